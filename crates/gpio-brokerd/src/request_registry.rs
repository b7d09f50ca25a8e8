//! Granted line requests
//!
//! Each request owns its adapter handle and refers to its chip by device
//! name. Line ownership is mirrored into the chip registry for the whole
//! lifetime of the request.

use crate::adapter::RequestHandle;
use crate::bus::{self, BusSignal, Interface, ObjectExporter, PropertyMap};
use crate::chip_registry::ChipRegistry;
use crate::error::{BrokerError, Result};
use crate::event::{EdgeSink, EventSender};
use crate::id_set::IdSet;
use crate::line::{EdgeEvent, LineConfig, LineValue, RequestConfig};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error};

/// One live request
pub struct RequestEntry {
    /// Request id
    pub id: u32,
    /// Unique across the daemon's lifetime, unlike the id
    pub generation: u64,
    /// Object path
    pub path: String,
    /// Device name of the owning chip
    pub chip: String,
    /// Reserved offsets in submission order
    pub offsets: Vec<u32>,
    handle: Box<dyn RequestHandle>,
}

impl std::fmt::Debug for RequestEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestEntry")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("path", &self.path)
            .field("chip", &self.chip)
            .field("offsets", &self.offsets)
            .finish()
    }
}

impl RequestEntry {
    fn check_subset(&self, offsets: &[u32]) -> Result<()> {
        if offsets.is_empty() {
            return Err(BrokerError::invalid_args("no offsets given"));
        }

        let mut seen = BTreeSet::new();
        for offset in offsets {
            if !self.offsets.contains(offset) {
                return Err(BrokerError::invalid_args(format!(
                    "offset {} is not part of request {}",
                    offset, self.path
                )));
            }
            if !seen.insert(*offset) {
                return Err(BrokerError::invalid_args(format!(
                    "offset {} given more than once",
                    offset
                )));
            }
        }
        Ok(())
    }
}

/// Live requests keyed by id
#[derive(Debug, Default)]
pub struct RequestRegistry {
    requests: BTreeMap<u32, RequestEntry>,
    ids: IdSet,
    next_generation: u64,
}

impl RequestRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Request by id
    pub fn get(&self, id: u32) -> Option<&RequestEntry> {
        self.requests.get(&id)
    }

    /// Ids of all live requests
    pub fn ids(&self) -> Vec<u32> {
        self.requests.keys().copied().collect()
    }

    /// Number of live requests
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// True when nothing is requested
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Reserve lines on `devname`, returning the new request path
    pub fn request_lines(
        &mut self,
        chips: &mut ChipRegistry,
        devname: &str,
        request_config: &RequestConfig,
        line_config: &LineConfig,
        exporter: &dyn ObjectExporter,
        tx: &EventSender,
    ) -> Result<String> {
        let chip = chips
            .get_mut(devname)
            .ok_or_else(|| BrokerError::internal(format!("no chip entry for {}", devname)))?;

        let handle = chip
            .handle_mut()
            .request_lines(request_config, line_config)
            .map_err(BrokerError::RequestFailed)?;
        let offsets = handle.offsets().to_vec();

        let line_paths = offsets
            .iter()
            .map(|offset| {
                chip.line(*offset).map(|l| l.path.clone()).ok_or_else(|| {
                    BrokerError::internal(format!(
                        "no line data for offset {} on {}",
                        offset, devname
                    ))
                })
            })
            .collect::<Result<Vec<String>>>()?;
        let chip_path = chip.path.clone();

        let id = self.ids.allocate();
        let generation = self.next_generation;
        self.next_generation += 1;
        let path = bus::request_path(id);

        exporter.export(
            &path,
            Interface::Request,
            PropertyMap::from([
                ("ChipPath", chip_path.into()),
                ("LinePaths", line_paths.into()),
            ]),
        )?;

        for offset in &offsets {
            chips.set_line_owner(devname, *offset, Some(&path), exporter)?;
        }

        self.requests.insert(
            id,
            RequestEntry {
                id,
                generation,
                path: path.clone(),
                chip: devname.to_string(),
                offsets,
                handle,
            },
        );

        let watched = match self.requests.get_mut(&id) {
            Some(entry) => entry
                .handle
                .watch_edge_events(EdgeSink::new(id, generation, tx.clone())),
            None => return Err(BrokerError::internal(format!("request {} vanished", id))),
        };
        if let Err(e) = watched {
            error!(path = %path, "failed to subscribe to edge events: {}", e);
            self.release(id, chips, exporter)?;
            return Err(BrokerError::RequestFailed(e));
        }

        debug!(path = %path, chip = %devname, "exported request");
        Ok(path)
    }

    /// Tear down a request and return its lines to the pool
    pub fn release(
        &mut self,
        id: u32,
        chips: &mut ChipRegistry,
        exporter: &dyn ObjectExporter,
    ) -> Result<()> {
        let mut entry = self
            .requests
            .remove(&id)
            .ok_or_else(|| BrokerError::UnknownObject(bus::request_path(id)))?;

        exporter.unexport(&entry.path)?;
        for offset in &entry.offsets {
            chips.set_line_owner(&entry.chip, *offset, None, exporter)?;
        }
        self.ids.free(id)?;
        entry.handle.release();

        debug!(path = %entry.path, "released request");
        Ok(())
    }

    /// Release every request held on a chip, returning how many went away
    pub fn release_for_chip(
        &mut self,
        devname: &str,
        chips: &mut ChipRegistry,
        exporter: &dyn ObjectExporter,
    ) -> Result<usize> {
        let ids: Vec<u32> = self
            .requests
            .values()
            .filter(|r| r.chip == devname)
            .map(|r| r.id)
            .collect();

        for id in &ids {
            self.release(*id, chips, exporter)?;
        }
        Ok(ids.len())
    }

    /// Apply new settings to the reserved lines
    pub fn reconfigure(&mut self, id: u32, line_config: &LineConfig) -> Result<()> {
        self.entry_mut(id)?
            .handle
            .reconfigure_lines(line_config)
            .map_err(BrokerError::ReconfigureFailed)
    }

    /// Read line values, all reserved lines when `offsets` is `None`
    pub fn get_values(&mut self, id: u32, offsets: Option<&[u32]>) -> Result<Vec<LineValue>> {
        let entry = self.entry_mut(id)?;
        if let Some(offsets) = offsets {
            entry.check_subset(offsets)?;
        }

        entry
            .handle
            .get_values(offsets)
            .map_err(BrokerError::GetValuesFailed)
    }

    /// Drive output values
    pub fn set_values(&mut self, id: u32, offsets: &[u32], values: &[LineValue]) -> Result<()> {
        let entry = self.entry_mut(id)?;
        entry.check_subset(offsets)?;
        if offsets.len() != values.len() {
            return Err(BrokerError::invalid_args(format!(
                "{} values given for {} offsets",
                values.len(),
                offsets.len()
            )));
        }

        entry
            .handle
            .set_values(offsets, values)
            .map_err(BrokerError::SetValuesFailed)
    }

    /// Re-emit an edge event on the line it happened on.
    ///
    /// Events queued by a request that has since been released are dropped,
    /// even when a newer request took over its id.
    pub fn forward_edge(
        &self,
        id: u32,
        generation: u64,
        event: &EdgeEvent,
        chips: &ChipRegistry,
        exporter: &dyn ObjectExporter,
    ) -> Result<()> {
        let Some(entry) = self
            .requests
            .get(&id)
            .filter(|entry| entry.generation == generation)
        else {
            debug!(
                request = id,
                generation,
                offset = event.offset,
                "edge event for released request"
            );
            return Ok(());
        };

        if !entry.offsets.contains(&event.offset) {
            debug!(
                path = %entry.path,
                offset = event.offset,
                "edge event for unrequested offset"
            );
            return Ok(());
        }

        let line = chips
            .get(&entry.chip)
            .and_then(|chip| chip.line(event.offset))
            .ok_or_else(|| {
                BrokerError::internal(format!(
                    "no line data for offset {} on {}",
                    event.offset, entry.chip
                ))
            })?;

        exporter.emit_signal(BusSignal::EdgeEvent {
            path: line.path.clone(),
            edge: event.kind.as_wire(),
            timestamp_ns: event.timestamp_ns,
            global_seqno: event.global_seqno,
            line_seqno: event.line_seqno,
        });
        Ok(())
    }

    fn entry_mut(&mut self, id: u32) -> Result<&mut RequestEntry> {
        self.requests
            .get_mut(&id)
            .ok_or_else(|| BrokerError::UnknownObject(bus::request_path(id)))
    }
}
