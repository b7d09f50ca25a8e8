//! Exported chips and their line snapshots
//!
//! A chip is in the registry exactly while its object tree is published.
//! Export is all-or-nothing: if any line cannot be exported or watched, the
//! lines already published are retracted and the chip is dropped.

use crate::adapter::{ChipHandle, ChipOpener};
use crate::bus::{self, Interface, ObjectExporter, PropertyMap};
use crate::error::{AdapterError, BrokerError, Result};
use crate::event::{EventSender, InfoSink};
use crate::hotplug::Device;
use crate::line::LineInfo;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, error, warn};

/// `RequestPath` of a line no request owns
pub const NO_REQUEST: &str = "none";

/// Mirror of one line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineEntry {
    /// Object path
    pub path: String,
    /// Last snapshot reported by the adapter
    pub info: LineInfo,
    /// Owned by a live request
    pub managed: bool,
    /// Path of the owning request
    pub request_path: Option<String>,
}

impl LineEntry {
    fn new(path: String, info: LineInfo) -> Self {
        Self {
            path,
            info,
            managed: false,
            request_path: None,
        }
    }

    /// Offset within the chip
    pub fn offset(&self) -> u32 {
        self.info.offset
    }

    /// Owning request path, or `"none"`
    pub fn owner(&self) -> &str {
        self.request_path.as_deref().unwrap_or(NO_REQUEST)
    }

    fn info_properties(&self) -> PropertyMap {
        let info = &self.info;
        PropertyMap::from([
            ("Offset", info.offset.into()),
            ("Name", info.name.as_str().into()),
            ("Used", info.used.into()),
            ("Consumer", info.consumer.as_str().into()),
            ("Direction", info.direction.as_str().into()),
            ("EdgeDetection", info.edge.as_str().into()),
            ("Bias", info.bias.as_str().into()),
            ("Drive", info.drive.as_str().into()),
            ("ActiveLow", info.active_low.into()),
            ("Debounced", info.debounced.into()),
            ("DebouncePeriodUs", info.debounce_period_us.into()),
            ("EventClock", info.event_clock.as_str().into()),
        ])
    }

    fn owner_properties(&self) -> PropertyMap {
        PropertyMap::from([
            ("Managed", self.managed.into()),
            ("RequestPath", self.owner().into()),
        ])
    }

    /// Every published property
    pub fn properties(&self) -> PropertyMap {
        let mut props = self.info_properties();
        props.extend(self.owner_properties());
        props
    }
}

/// One exported chip
pub struct ChipEntry {
    /// Kernel device name, the registry key
    pub devname: String,
    /// Object path
    pub path: String,
    /// Device node the chip was opened from
    pub dev_path: PathBuf,
    /// Chip name reported by the adapter
    pub name: String,
    /// Chip label
    pub label: String,
    /// Number of lines
    pub num_lines: u32,
    handle: Box<dyn ChipHandle>,
    lines: BTreeMap<u32, LineEntry>,
}

impl std::fmt::Debug for ChipEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChipEntry")
            .field("devname", &self.devname)
            .field("path", &self.path)
            .field("num_lines", &self.num_lines)
            .field("lines", &self.lines.len())
            .finish()
    }
}

impl ChipEntry {
    fn properties(&self) -> PropertyMap {
        PropertyMap::from([
            ("Name", self.name.as_str().into()),
            ("Label", self.label.as_str().into()),
            ("NumLines", self.num_lines.into()),
            ("Path", self.dev_path.display().to_string().into()),
        ])
    }

    /// Line entry by offset
    pub fn line(&self, offset: u32) -> Option<&LineEntry> {
        self.lines.get(&offset)
    }

    /// All line entries in offset order
    pub fn lines(&self) -> impl Iterator<Item = &LineEntry> {
        self.lines.values()
    }

    /// Adapter handle for hardware operations
    pub fn handle_mut(&mut self) -> &mut dyn ChipHandle {
        self.handle.as_mut()
    }
}

/// Chips currently exported, keyed by device name
#[derive(Debug, Default)]
pub struct ChipRegistry {
    chips: BTreeMap<String, ChipEntry>,
}

impl ChipRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Chip by device name
    pub fn get(&self, devname: &str) -> Option<&ChipEntry> {
        self.chips.get(devname)
    }

    /// Chip by device name, mutable
    pub fn get_mut(&mut self, devname: &str) -> Option<&mut ChipEntry> {
        self.chips.get_mut(devname)
    }

    /// Device name of the chip exported at `path`
    pub fn devname_for_path(&self, path: &str) -> Option<&str> {
        self.chips
            .values()
            .find(|c| c.path == path)
            .map(|c| c.devname.as_str())
    }

    /// True if a chip with this device name is exported
    pub fn contains(&self, devname: &str) -> bool {
        self.chips.contains_key(devname)
    }

    /// Device names of all exported chips
    pub fn devnames(&self) -> Vec<String> {
        self.chips.keys().cloned().collect()
    }

    /// Number of exported chips
    pub fn len(&self) -> usize {
        self.chips.len()
    }

    /// True when no chip is exported
    pub fn is_empty(&self) -> bool {
        self.chips.is_empty()
    }

    /// Handle a hotplug add.
    ///
    /// Returns `Ok(true)` when the chip was exported. Filtered devices,
    /// duplicates and adapter failures leave the registry unchanged and
    /// return `Ok(false)`; only bookkeeping errors are returned as `Err`.
    pub fn add(
        &mut self,
        device: &Device,
        opener: &dyn ChipOpener,
        exporter: &dyn ObjectExporter,
        tx: &EventSender,
    ) -> Result<bool> {
        let devnode = match &device.devnode {
            Some(devnode) if device.is_gpiochip() => devnode,
            _ => {
                debug!(device = %device.name, "not a gpio chip, ignoring");
                return Ok(false);
            }
        };

        if self.chips.contains_key(&device.name) {
            debug!(chip = %device.name, "chip already exported");
            return Ok(false);
        }

        let sink = InfoSink::new(device.name.as_str(), tx.clone());
        let handle = match opener.open(devnode, sink) {
            Ok(handle) => handle,
            Err(e) => {
                error!(chip = %device.name, "failed to open gpio chip: {}", e);
                return Ok(false);
            }
        };

        let info = match handle.info() {
            Ok(info) => info,
            Err(e) => {
                error!(chip = %device.name, "failed to read chip info: {}", e);
                return Ok(false);
            }
        };

        let mut entry = ChipEntry {
            devname: device.name.clone(),
            path: bus::chip_path(&device.name),
            dev_path: handle.path().to_path_buf(),
            name: info.name,
            label: info.label,
            num_lines: info.num_lines,
            handle,
            lines: BTreeMap::new(),
        };

        exporter.export(&entry.path, Interface::Chip, entry.properties())?;

        for offset in 0..entry.num_lines {
            if let Err(e) = export_line(&mut entry, offset, exporter)? {
                error!(
                    chip = %entry.devname,
                    offset,
                    "failed to export line, dropping chip: {}",
                    e
                );
                unexport_lines(&mut entry, exporter)?;
                exporter.unexport(&entry.path)?;
                return Ok(false);
            }
        }

        debug!(chip = %entry.devname, lines = entry.num_lines, "exported gpio chip");
        self.chips.insert(entry.devname.clone(), entry);
        Ok(true)
    }

    /// Retract a chip and close its handle. Requests on the chip must have
    /// been released by the caller.
    pub fn remove(&mut self, devname: &str, exporter: &dyn ObjectExporter) -> Result<bool> {
        let Some(mut entry) = self.chips.remove(devname) else {
            warn!(chip = %devname, "removal of unknown chip");
            return Ok(false);
        };

        unexport_lines(&mut entry, exporter)?;
        exporter.unexport(&entry.path)?;
        debug!(chip = %devname, "removed gpio chip");
        Ok(true)
    }

    /// Apply an info-change notification from the adapter
    pub fn info_changed(
        &mut self,
        devname: &str,
        info: LineInfo,
        exporter: &dyn ObjectExporter,
    ) -> Result<()> {
        let Some(chip) = self.chips.get_mut(devname) else {
            debug!(chip = %devname, offset = info.offset, "info event for departed chip");
            return Ok(());
        };

        let line = chip.lines.get_mut(&info.offset).ok_or_else(|| {
            BrokerError::internal(format!(
                "no line data for offset {} on {}",
                info.offset, devname
            ))
        })?;

        line.info = info;
        exporter.update_properties(&line.path, line.info_properties())
    }

    /// Mark a line as owned by `request_path`, or free it with `None`
    pub fn set_line_owner(
        &mut self,
        devname: &str,
        offset: u32,
        request_path: Option<&str>,
        exporter: &dyn ObjectExporter,
    ) -> Result<()> {
        let line = self
            .chips
            .get_mut(devname)
            .ok_or_else(|| BrokerError::internal(format!("no chip entry for {}", devname)))?
            .lines
            .get_mut(&offset)
            .ok_or_else(|| {
                BrokerError::internal(format!("no line data for offset {} on {}", offset, devname))
            })?;

        line.managed = request_path.is_some();
        line.request_path = request_path.map(str::to_string);
        exporter.update_properties(&line.path, line.owner_properties())
    }
}

/// Export one line and start watching it. The outer error is a bookkeeping
/// failure; the inner one an adapter failure that aborts the chip export.
fn export_line(
    entry: &mut ChipEntry,
    offset: u32,
    exporter: &dyn ObjectExporter,
) -> Result<std::result::Result<(), AdapterError>> {
    let info = match entry.handle.line_info(offset) {
        Ok(info) => info,
        Err(e) => return Ok(Err(e)),
    };

    let line = LineEntry::new(bus::line_path(&entry.path, offset), info);
    exporter.export(&line.path, Interface::Line, line.properties())?;
    let path = line.path.clone();
    entry.lines.insert(offset, line);

    match entry.handle.watch_line_info(offset) {
        Ok(info) => {
            if let Some(line) = entry.lines.get_mut(&offset) {
                line.info = info;
                exporter.update_properties(&path, line.info_properties())?;
            }
            Ok(Ok(()))
        }
        Err(e) => {
            // not watched, so only the object needs retracting
            entry.lines.remove(&offset);
            exporter.unexport(&path)?;
            Ok(Err(e))
        }
    }
}

fn unexport_lines(entry: &mut ChipEntry, exporter: &dyn ObjectExporter) -> Result<()> {
    let lines = std::mem::take(&mut entry.lines);
    for (offset, line) in lines {
        if let Err(e) = entry.handle.unwatch_line_info(offset) {
            debug!(chip = %entry.devname, offset, "unwatch failed: {}", e);
        }
        exporter.unexport(&line.path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{SimBackend, SimChipSpec};
    use crate::bus::{ObjectBus, PropValue};
    use crate::event;
    use crate::line::Direction;

    fn setup(num_lines: u32) -> (SimBackend, ObjectBus, EventSender, event::EventReceiver, Device) {
        let backend = SimBackend::new();
        let devnode = backend.add_chip(SimChipSpec::new("gpiochip0", num_lines));
        let (tx, rx) = event::channel();
        (
            backend,
            ObjectBus::default(),
            tx,
            rx,
            Device::new("gpiochip0", Some(devnode)),
        )
    }

    #[test]
    fn test_export_publishes_every_line() {
        let (backend, bus, tx, _rx, device) = setup(4);
        let mut chips = ChipRegistry::new();

        assert!(chips.add(&device, &backend, &bus, &tx).unwrap());
        assert_eq!(bus.len(), 5);
        for offset in 0u32..4 {
            let path = format!("/broker/chips/gpiochip0/line{}", offset);
            assert_eq!(
                bus.property(&path, "Offset"),
                Some(PropValue::U64(u64::from(offset)))
            );
            assert_eq!(bus.property(&path, "RequestPath"), Some("none".into()));
        }
        assert_eq!(
            bus.property("/broker/chips/gpiochip0", "Path"),
            Some("/dev/gpiochip0".into())
        );
    }

    #[test]
    fn test_duplicate_add_is_noop() {
        let (backend, bus, tx, _rx, device) = setup(2);
        let mut chips = ChipRegistry::new();

        assert!(chips.add(&device, &backend, &bus, &tx).unwrap());
        assert!(!chips.add(&device, &backend, &bus, &tx).unwrap());
        assert_eq!(chips.len(), 1);
        assert_eq!(bus.len(), 3);
    }

    #[test]
    fn test_watch_failure_rolls_back_chip() {
        let (backend, bus, tx, _rx, device) = setup(4);
        let mut chips = ChipRegistry::new();
        backend.fail_watch_at("gpiochip0", 2);

        assert!(!chips.add(&device, &backend, &bus, &tx).unwrap());
        assert!(chips.is_empty());
        assert!(bus.is_empty());

        // a later add succeeds once the fault is gone
        assert!(chips.add(&device, &backend, &bus, &tx).unwrap());
        assert_eq!(bus.len(), 5);
    }

    #[test]
    fn test_open_failure_leaves_chip_absent() {
        let (backend, bus, tx, _rx, _) = setup(1);
        let mut chips = ChipRegistry::new();
        let ghost = Device::new("gpiochip7", Some(PathBuf::from("/dev/gpiochip7")));

        assert!(!chips.add(&ghost, &backend, &bus, &tx).unwrap());
        assert!(!chips.contains("gpiochip7"));
    }

    #[test]
    fn test_non_chip_devices_are_filtered() {
        let (backend, bus, tx, _rx, _) = setup(1);
        let mut chips = ChipRegistry::new();

        assert!(!chips.add(&Device::new("gpio512", None), &backend, &bus, &tx).unwrap());
        assert!(bus.is_empty());
    }

    #[test]
    fn test_remove_retracts_everything() {
        let (backend, bus, tx, _rx, device) = setup(3);
        let mut chips = ChipRegistry::new();
        chips.add(&device, &backend, &bus, &tx).unwrap();

        assert!(chips.remove("gpiochip0", &bus).unwrap());
        assert!(bus.is_empty());
        assert!(!chips.remove("gpiochip0", &bus).unwrap());
    }

    #[test]
    fn test_info_changed_updates_snapshot() {
        let (backend, bus, tx, _rx, device) = setup(2);
        let mut chips = ChipRegistry::new();
        chips.add(&device, &backend, &bus, &tx).unwrap();

        let mut info = LineInfo::unused(1, "");
        info.used = true;
        info.consumer = "other".to_string();
        info.direction = Direction::Output;
        chips.info_changed("gpiochip0", info, &bus).unwrap();

        let path = "/broker/chips/gpiochip0/line1";
        assert_eq!(bus.property(path, "Consumer"), Some("other".into()));
        assert_eq!(bus.property(path, "Direction"), Some("output".into()));

        // departed chip is a benign race, unknown offset is not
        chips
            .info_changed("gpiochip9", LineInfo::unused(0, ""), &bus)
            .unwrap();
        let err = chips
            .info_changed("gpiochip0", LineInfo::unused(9, ""), &bus)
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_line_owner() {
        let (backend, bus, tx, _rx, device) = setup(2);
        let mut chips = ChipRegistry::new();
        chips.add(&device, &backend, &bus, &tx).unwrap();

        let path = "/broker/chips/gpiochip0/line0";
        chips
            .set_line_owner("gpiochip0", 0, Some("/broker/requests/request0"), &bus)
            .unwrap();
        assert_eq!(bus.property(path, "Managed"), Some(true.into()));
        assert_eq!(
            bus.property(path, "RequestPath"),
            Some("/broker/requests/request0".into())
        );

        chips.set_line_owner("gpiochip0", 0, None, &bus).unwrap();
        assert_eq!(bus.property(path, "Managed"), Some(false.into()));
        assert_eq!(bus.property(path, "RequestPath"), Some("none".into()));

        assert!(chips.set_line_owner("gpiochip0", 5, None, &bus).is_err());
    }
}
