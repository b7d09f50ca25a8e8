//! In-memory GPIO chips
//!
//! Behaves like the kernel character device closely enough to drive the
//! broker end to end: exclusive line ownership, info-change notifications
//! for watched lines, edge generation from simulated pull changes, and chip
//! removal. Tests use the harness methods (`add_chip`, `set_pull`,
//! `fail_watch_at`, ...) to play the part of the hardware.

use super::{
    ChipHandle, ChipOpener, RequestHandle, select_offsets, validate_reconfigure_offsets,
    validate_request_offsets,
};
use crate::error::{AdapterError, AdapterErrorKind, AdapterResult};
use crate::event::{EdgeSink, InfoSink};
use crate::line::{
    Bias, ChipInfo, Direction, Edge, EdgeEvent, EdgeKind, LineConfig, LineInfo, LineSettings,
    LineValue, RequestConfig,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SIM_DEV_DIR: &str = "/dev";

/// Step applied to the simulated clock for each pull change
const CLOCK_STEP_NS: u64 = 1_000;

/// Description of a simulated chip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimChipSpec {
    /// Device name, e.g. `gpiochip0`
    pub name: String,
    /// Chip label
    pub label: String,
    /// Number of lines
    pub num_lines: u32,
    /// Optional line names keyed by offset
    pub line_names: HashMap<u32, String>,
}

/// Label of chips created without one
pub const DEFAULT_SIM_LABEL: &str = "gpio-sim";

impl SimChipSpec {
    /// Chip without line names
    pub fn new(name: impl Into<String>, num_lines: u32) -> Self {
        Self {
            name: name.into(),
            label: DEFAULT_SIM_LABEL.to_string(),
            num_lines,
            line_names: HashMap::new(),
        }
    }

    /// Set the chip label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Name one line
    pub fn with_line_name(mut self, offset: u32, name: impl Into<String>) -> Self {
        self.line_names.insert(offset, name.into());
        self
    }
}

#[derive(Debug)]
struct SimLine {
    info: LineInfo,
    pull: LineValue,
    output: LineValue,
    owner: Option<u64>,
}

impl SimLine {
    fn logical_value(&self) -> LineValue {
        match self.info.direction {
            Direction::Output => self.output,
            _ if self.info.active_low => self.pull.inverted(),
            _ => self.pull,
        }
    }

    fn physical_value(&self) -> LineValue {
        match self.info.direction {
            Direction::Output if self.info.active_low => self.output.inverted(),
            Direction::Output => self.output,
            _ => self.pull,
        }
    }

    fn apply(&mut self, settings: &LineSettings) {
        if settings.direction != Direction::AsIs {
            self.info.direction = settings.direction;
        }
        if settings.bias != Bias::AsIs {
            self.info.bias = settings.bias;
        }
        self.info.edge = settings.edge;
        self.info.drive = settings.drive;
        self.info.active_low = settings.active_low;
        self.info.debounced = settings.debounce_period_us > 0;
        self.info.debounce_period_us = settings.debounce_period_us;
        self.info.event_clock = settings.event_clock;
        if self.info.direction == Direction::Output {
            self.output = settings.output_value;
        }
    }

    fn reset(&mut self) {
        self.info.used = false;
        self.info.consumer.clear();
        self.info.edge = Edge::None;
        self.info.debounced = false;
        self.info.debounce_period_us = 0;
        self.owner = None;
    }
}

#[derive(Debug)]
struct SimChip {
    info: ChipInfo,
    dev_path: PathBuf,
    lines: Vec<SimLine>,
}

#[derive(Debug)]
struct SimRequest {
    edge_sink: Option<EdgeSink>,
    global_seqno: u64,
    line_seqno: BTreeMap<u32, u64>,
}

#[derive(Debug)]
struct Watcher {
    chip: String,
    sink: InfoSink,
    offsets: BTreeSet<u32>,
}

#[derive(Debug, Default)]
struct SimState {
    chips: BTreeMap<String, SimChip>,
    requests: BTreeMap<u64, SimRequest>,
    watchers: BTreeMap<u64, Watcher>,
    next_key: u64,
    clock_ns: u64,
    fail_watch: Option<(String, u32)>,
}

impl SimState {
    fn key(&mut self) -> u64 {
        self.next_key += 1;
        self.next_key
    }

    fn chip(&self, name: &str) -> AdapterResult<&SimChip> {
        self.chips
            .get(name)
            .ok_or_else(|| AdapterError::not_found("No such device"))
    }

    fn chip_mut(&mut self, name: &str) -> AdapterResult<&mut SimChip> {
        self.chips
            .get_mut(name)
            .ok_or_else(|| AdapterError::not_found("No such device"))
    }

    fn notify(&self, chip: &str, offsets: &[u32]) {
        let Some(sim_chip) = self.chips.get(chip) else {
            return;
        };

        for watcher in self.watchers.values().filter(|w| w.chip == chip) {
            for offset in offsets.iter().filter(|o| watcher.offsets.contains(*o)) {
                if let Some(line) = sim_chip.lines.get(*offset as usize) {
                    watcher.sink.send(line.info.clone());
                }
            }
        }
    }
}

/// In-memory chip backend with a test harness
#[derive(Clone, Debug, Default)]
pub struct SimBackend {
    state: Arc<Mutex<SimState>>,
}

impl SimBackend {
    /// Backend with no chips
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend pre-populated with chips
    pub fn with_chips(specs: &[SimChipSpec]) -> Self {
        let backend = Self::new();
        for spec in specs {
            backend.add_chip(spec.clone());
        }
        backend
    }

    /// Plug in a chip, returning its device path
    pub fn add_chip(&self, spec: SimChipSpec) -> PathBuf {
        let dev_path = Path::new(SIM_DEV_DIR).join(&spec.name);
        let lines = (0..spec.num_lines)
            .map(|offset| SimLine {
                info: LineInfo::unused(
                    offset,
                    spec.line_names.get(&offset).cloned().unwrap_or_default(),
                ),
                pull: LineValue::Inactive,
                output: LineValue::Inactive,
                owner: None,
            })
            .collect();

        let chip = SimChip {
            info: ChipInfo {
                name: spec.name.clone(),
                label: spec.label,
                num_lines: spec.num_lines,
            },
            dev_path: dev_path.clone(),
            lines,
        };

        self.state.lock().chips.insert(spec.name, chip);
        dev_path
    }

    /// Unplug a chip. Open handles and requests start failing.
    pub fn remove_chip(&self, name: &str) -> bool {
        let mut state = self.state.lock();
        state.watchers.retain(|_, w| w.chip != name);
        state.chips.remove(name).is_some()
    }

    /// Names of the plugged chips
    pub fn chip_names(&self) -> Vec<String> {
        self.state.lock().chips.keys().cloned().collect()
    }

    /// Device path of a plugged chip
    pub fn dev_path(&self, name: &str) -> Option<PathBuf> {
        self.state.lock().chips.get(name).map(|c| c.dev_path.clone())
    }

    /// Make the next watch of `offset` on `chip` fail
    pub fn fail_watch_at(&self, chip: &str, offset: u32) {
        self.state.lock().fail_watch = Some((chip.to_string(), offset));
    }

    /// Drive the external pull on a line, generating edge events for the
    /// request holding it when edge detection matches.
    pub fn set_pull(&self, chip: &str, offset: u32, level: LineValue) -> AdapterResult<()> {
        let mut state = self.state.lock();
        state.clock_ns += CLOCK_STEP_NS;
        let timestamp_ns = state.clock_ns;

        let line = state
            .chip_mut(chip)?
            .lines
            .get_mut(offset as usize)
            .ok_or_else(|| AdapterError::invalid(format!("no line at offset {}", offset)))?;

        let before = line.logical_value();
        line.pull = level;
        let after = line.logical_value();

        if line.info.direction == Direction::Output || before == after {
            return Ok(());
        }

        let kind = if after == LineValue::Active {
            EdgeKind::Rising
        } else {
            EdgeKind::Falling
        };
        if !line.info.edge.detects(kind) {
            return Ok(());
        }

        let Some(owner) = line.owner else {
            return Ok(());
        };
        let Some(request) = state.requests.get_mut(&owner) else {
            return Ok(());
        };

        request.global_seqno += 1;
        let line_seqno = request.line_seqno.entry(offset).or_insert(0);
        *line_seqno += 1;

        let event = EdgeEvent {
            kind,
            timestamp_ns,
            offset,
            global_seqno: request.global_seqno,
            line_seqno: *line_seqno,
        };
        if let Some(sink) = &request.edge_sink {
            sink.send(event);
        }

        Ok(())
    }

    /// Level seen on the pin: the driven level for outputs, the pull for inputs
    pub fn physical_value(&self, chip: &str, offset: u32) -> Option<LineValue> {
        let state = self.state.lock();
        let line = state.chips.get(chip)?.lines.get(offset as usize)?;
        Some(line.physical_value())
    }

    /// Current snapshot of a line
    pub fn line_snapshot(&self, chip: &str, offset: u32) -> Option<LineInfo> {
        let state = self.state.lock();
        let line = state.chips.get(chip)?.lines.get(offset as usize)?;
        Some(line.info.clone())
    }

    /// Number of live line requests across all chips
    pub fn active_requests(&self) -> usize {
        self.state.lock().requests.len()
    }
}

impl ChipOpener for SimBackend {
    fn open(&self, path: &Path, info_sink: InfoSink) -> AdapterResult<Box<dyn ChipHandle>> {
        let mut state = self.state.lock();
        let name = state
            .chips
            .values()
            .find(|c| c.dev_path == path)
            .map(|c| c.info.name.clone())
            .ok_or_else(|| AdapterError::not_found("No such file or directory"))?;

        let key = state.key();
        state.watchers.insert(
            key,
            Watcher {
                chip: name.clone(),
                sink: info_sink,
                offsets: BTreeSet::new(),
            },
        );

        Ok(Box::new(SimChipHandle {
            state: Arc::clone(&self.state),
            key,
            chip: name,
            path: path.to_path_buf(),
        }))
    }
}

/// Open simulated chip
#[derive(Debug)]
pub struct SimChipHandle {
    state: Arc<Mutex<SimState>>,
    key: u64,
    chip: String,
    path: PathBuf,
}

impl ChipHandle for SimChipHandle {
    fn path(&self) -> &Path {
        &self.path
    }

    fn info(&self) -> AdapterResult<ChipInfo> {
        Ok(self.state.lock().chip(&self.chip)?.info.clone())
    }

    fn line_info(&self, offset: u32) -> AdapterResult<LineInfo> {
        let state = self.state.lock();
        state
            .chip(&self.chip)?
            .lines
            .get(offset as usize)
            .map(|l| l.info.clone())
            .ok_or_else(|| AdapterError::invalid(format!("no line at offset {}", offset)))
    }

    fn watch_line_info(&mut self, offset: u32) -> AdapterResult<LineInfo> {
        let mut state = self.state.lock();

        if state.fail_watch.as_ref() == Some(&(self.chip.clone(), offset)) {
            state.fail_watch = None;
            return Err(AdapterError::new(AdapterErrorKind::Os(5), "Input/output error"));
        }

        let info = state
            .chip(&self.chip)?
            .lines
            .get(offset as usize)
            .map(|l| l.info.clone())
            .ok_or_else(|| AdapterError::invalid(format!("no line at offset {}", offset)))?;

        let watcher = state
            .watchers
            .get_mut(&self.key)
            .ok_or_else(|| AdapterError::not_found("No such device"))?;
        if !watcher.offsets.insert(offset) {
            return Err(AdapterError::busy("Device or resource busy"));
        }

        Ok(info)
    }

    fn unwatch_line_info(&mut self, offset: u32) -> AdapterResult<()> {
        let mut state = self.state.lock();
        let watcher = state
            .watchers
            .get_mut(&self.key)
            .ok_or_else(|| AdapterError::not_found("No such device"))?;
        if !watcher.offsets.remove(&offset) {
            return Err(AdapterError::busy("Device or resource busy"));
        }
        Ok(())
    }

    fn request_lines(
        &mut self,
        request_config: &RequestConfig,
        line_config: &LineConfig,
    ) -> AdapterResult<Box<dyn RequestHandle>> {
        let mut state = self.state.lock();
        let offsets = line_config.offsets();
        let resolved = line_config.resolved();

        let chip = state.chip(&self.chip)?;
        validate_request_offsets(&offsets, chip.info.num_lines)?;
        for (offset, settings) in &resolved {
            if chip.lines[*offset as usize].info.used {
                return Err(AdapterError::busy("Device or resource busy"));
            }
            check_settings(settings)?;
        }

        let key = state.key();
        let consumer = request_config
            .consumer
            .clone()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| "?".to_string());

        let chip = state.chip_mut(&self.chip)?;
        for (offset, settings) in &resolved {
            let line = &mut chip.lines[*offset as usize];
            line.info.used = true;
            line.info.consumer = consumer.clone();
            line.owner = Some(key);
            line.apply(settings);
        }

        state.requests.insert(
            key,
            SimRequest {
                edge_sink: None,
                global_seqno: 0,
                line_seqno: BTreeMap::new(),
            },
        );
        state.notify(&self.chip, &offsets);

        Ok(Box::new(SimRequestHandle {
            state: Arc::clone(&self.state),
            key,
            chip: self.chip.clone(),
            offsets,
            released: false,
        }))
    }
}

impl Drop for SimChipHandle {
    fn drop(&mut self) {
        self.state.lock().watchers.remove(&self.key);
    }
}

fn check_settings(settings: &LineSettings) -> AdapterResult<()> {
    if settings.direction == Direction::Output && settings.edge != Edge::None {
        return Err(AdapterError::invalid("edge detection requires an input line"));
    }
    if settings.direction != Direction::Output && settings.drive != Default::default() {
        return Err(AdapterError::invalid("drive requires an output line"));
    }
    Ok(())
}

/// Simulated line request
#[derive(Debug)]
pub struct SimRequestHandle {
    state: Arc<Mutex<SimState>>,
    key: u64,
    chip: String,
    offsets: Vec<u32>,
    released: bool,
}

impl SimRequestHandle {
    fn check_live(&self) -> AdapterResult<()> {
        if self.released {
            return Err(AdapterError::released());
        }
        Ok(())
    }
}

impl RequestHandle for SimRequestHandle {
    fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    fn watch_edge_events(&mut self, sink: EdgeSink) -> AdapterResult<()> {
        self.check_live()?;
        let mut state = self.state.lock();
        let request = state
            .requests
            .get_mut(&self.key)
            .ok_or_else(AdapterError::released)?;
        request.edge_sink = Some(sink);
        Ok(())
    }

    fn reconfigure_lines(&mut self, line_config: &LineConfig) -> AdapterResult<()> {
        self.check_live()?;
        validate_reconfigure_offsets(&self.offsets, &line_config.offsets())?;

        let resolved = line_config.resolved();
        for (_, settings) in &resolved {
            check_settings(settings)?;
        }

        let mut state = self.state.lock();
        let chip = state.chip_mut(&self.chip)?;
        for (offset, settings) in &resolved {
            chip.lines[*offset as usize].apply(settings);
        }
        state.notify(&self.chip, &self.offsets);

        Ok(())
    }

    fn get_values(&mut self, offsets: Option<&[u32]>) -> AdapterResult<Vec<LineValue>> {
        self.check_live()?;
        let offsets = select_offsets(&self.offsets, offsets)?;

        let state = self.state.lock();
        let chip = state.chip(&self.chip)?;
        Ok(offsets
            .iter()
            .map(|o| chip.lines[*o as usize].logical_value())
            .collect())
    }

    fn set_values(&mut self, offsets: &[u32], values: &[LineValue]) -> AdapterResult<()> {
        self.check_live()?;
        if offsets.len() != values.len() {
            return Err(AdapterError::invalid(format!(
                "{} values given for {} lines",
                values.len(),
                offsets.len()
            )));
        }
        let offsets = select_offsets(&self.offsets, Some(offsets))?;

        let mut state = self.state.lock();
        let chip = state.chip_mut(&self.chip)?;
        if offsets
            .iter()
            .any(|o| chip.lines[*o as usize].info.direction != Direction::Output)
        {
            return Err(AdapterError::new(
                AdapterErrorKind::PermissionDenied,
                "Operation not permitted",
            ));
        }

        for (offset, value) in offsets.iter().zip(values) {
            chip.lines[*offset as usize].output = *value;
        }

        Ok(())
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let mut state = self.state.lock();
        state.requests.remove(&self.key);
        if let Some(chip) = state.chips.get_mut(&self.chip) {
            for offset in &self.offsets {
                match chip.lines.get_mut(*offset as usize) {
                    Some(line) if line.owner == Some(self.key) => line.reset(),
                    _ => {}
                }
            }
        }
        state.notify(&self.chip, &self.offsets);
    }
}

impl Drop for SimRequestHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{self, BrokerEvent};
    use crate::line::Drive;

    fn output_config(offsets: Vec<u32>) -> LineConfig {
        let mut config = LineConfig::new();
        config.add_group(
            offsets,
            LineSettings {
                direction: Direction::Output,
                ..Default::default()
            },
        );
        config
    }

    fn input_config(offsets: Vec<u32>, edge: Edge) -> LineConfig {
        let mut config = LineConfig::new();
        config.add_group(
            offsets,
            LineSettings {
                direction: Direction::Input,
                edge,
                ..Default::default()
            },
        );
        config
    }

    fn open(backend: &SimBackend, name: &str) -> (Box<dyn ChipHandle>, event::EventReceiver) {
        let (tx, rx) = event::channel();
        let path = backend.dev_path(name).unwrap();
        let chip = backend.open(&path, InfoSink::new(name, tx)).unwrap();
        (chip, rx)
    }

    #[test]
    fn test_open_unknown_path() {
        let backend = SimBackend::new();
        let (tx, _rx) = event::channel();
        let err = backend
            .open(Path::new("/dev/gpiochip9"), InfoSink::new("gpiochip9", tx))
            .err()
            .unwrap();
        assert_eq!(err.kind, AdapterErrorKind::NotFound);
    }

    #[test]
    fn test_chip_info_and_names() {
        let backend = SimBackend::with_chips(&[SimChipSpec::new("gpiochip0", 4)
            .with_label("bank0")
            .with_line_name(2, "led")]);
        let (chip, _rx) = open(&backend, "gpiochip0");

        let info = chip.info().unwrap();
        assert_eq!(info.label, "bank0");
        assert_eq!(info.num_lines, 4);
        assert_eq!(chip.line_info(2).unwrap().name, "led");
        assert_eq!(chip.line_info(1).unwrap().name, "");
        assert!(chip.line_info(4).is_err());
    }

    #[test]
    fn test_busy_lines() {
        let backend = SimBackend::with_chips(&[SimChipSpec::new("gpiochip0", 8)]);
        let (mut chip, _rx) = open(&backend, "gpiochip0");

        let _held = chip
            .request_lines(&RequestConfig::default(), &output_config(vec![1, 2]))
            .unwrap();
        let err = chip
            .request_lines(&RequestConfig::default(), &output_config(vec![2, 3]))
            .err()
            .unwrap();
        assert_eq!(err.kind, AdapterErrorKind::Busy);
        assert!(!backend.line_snapshot("gpiochip0", 3).unwrap().used);
    }

    #[test]
    fn test_watched_lines_report_changes() {
        let backend = SimBackend::with_chips(&[SimChipSpec::new("gpiochip0", 4)]);
        let (mut chip, mut rx) = open(&backend, "gpiochip0");
        chip.watch_line_info(1).unwrap();

        let config = RequestConfig {
            consumer: Some("blinker".into()),
            event_buffer_size: 0,
        };
        let mut request = chip.request_lines(&config, &output_config(vec![1, 3])).unwrap();

        match rx.try_recv().unwrap() {
            BrokerEvent::InfoChanged { info, .. } => {
                assert_eq!(info.offset, 1);
                assert!(info.used);
                assert_eq!(info.consumer, "blinker");
                assert_eq!(info.direction, Direction::Output);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(rx.try_recv().is_err());

        request.release();
        match rx.try_recv().unwrap() {
            BrokerEvent::InfoChanged { info, .. } => assert!(!info.used),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_set_values_is_all_or_nothing() {
        let backend = SimBackend::with_chips(&[SimChipSpec::new("gpiochip0", 4)]);
        let (mut chip, _rx) = open(&backend, "gpiochip0");

        let mut config = output_config(vec![0]);
        config.add_group(
            vec![1],
            LineSettings {
                direction: Direction::Input,
                ..Default::default()
            },
        );
        let mut request = chip.request_lines(&RequestConfig::default(), &config).unwrap();

        let err = request
            .set_values(&[0, 1], &[LineValue::Active, LineValue::Active])
            .unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::PermissionDenied);
        assert_eq!(
            backend.physical_value("gpiochip0", 0),
            Some(LineValue::Inactive)
        );

        request.set_values(&[0], &[LineValue::Active]).unwrap();
        assert_eq!(request.get_values(Some(&[0])).unwrap(), vec![LineValue::Active]);
    }

    #[test]
    fn test_active_low_output() {
        let backend = SimBackend::with_chips(&[SimChipSpec::new("gpiochip0", 2)]);
        let (mut chip, _rx) = open(&backend, "gpiochip0");

        let mut config = LineConfig::new();
        config.add_group(
            vec![0],
            LineSettings {
                direction: Direction::Output,
                active_low: true,
                drive: Drive::OpenDrain,
                ..Default::default()
            },
        );
        let mut request = chip.request_lines(&RequestConfig::default(), &config).unwrap();
        request.set_values(&[0], &[LineValue::Active]).unwrap();

        assert_eq!(
            backend.physical_value("gpiochip0", 0),
            Some(LineValue::Inactive)
        );
        assert_eq!(request.get_values(None).unwrap(), vec![LineValue::Active]);
    }

    #[test]
    fn test_edges_carry_sequence_numbers() {
        let backend = SimBackend::with_chips(&[SimChipSpec::new("gpiochip0", 4)]);
        let (mut chip, _rx) = open(&backend, "gpiochip0");
        let mut request = chip
            .request_lines(&RequestConfig::default(), &input_config(vec![0, 1], Edge::Both))
            .unwrap();

        let (tx, mut rx) = event::channel();
        request.watch_edge_events(EdgeSink::new(0, 0, tx)).unwrap();

        backend.set_pull("gpiochip0", 0, LineValue::Active).unwrap();
        backend.set_pull("gpiochip0", 1, LineValue::Active).unwrap();
        backend.set_pull("gpiochip0", 0, LineValue::Inactive).unwrap();

        let mut events = Vec::new();
        while let Ok(BrokerEvent::Edge { event, .. }) = rx.try_recv() {
            events.push(event);
        }

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, EdgeKind::Rising);
        assert_eq!(events[2].kind, EdgeKind::Falling);
        assert_eq!(
            events.iter().map(|e| e.global_seqno).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(
            events.iter().map(|e| e.line_seqno).collect::<Vec<_>>(),
            vec![1, 1, 2]
        );
        assert!(events[0].timestamp_ns < events[1].timestamp_ns);
    }

    #[test]
    fn test_rising_only_filters_falling() {
        let backend = SimBackend::with_chips(&[SimChipSpec::new("gpiochip0", 1)]);
        let (mut chip, _rx) = open(&backend, "gpiochip0");
        let mut request = chip
            .request_lines(&RequestConfig::default(), &input_config(vec![0], Edge::Rising))
            .unwrap();
        let (tx, mut rx) = event::channel();
        request.watch_edge_events(EdgeSink::new(0, 0, tx)).unwrap();

        backend.set_pull("gpiochip0", 0, LineValue::Active).unwrap();
        backend.set_pull("gpiochip0", 0, LineValue::Inactive).unwrap();

        assert!(matches!(rx.try_recv(), Ok(BrokerEvent::Edge { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_reconfigure_and_release() {
        let backend = SimBackend::with_chips(&[SimChipSpec::new("gpiochip0", 8)]);
        let (mut chip, _rx) = open(&backend, "gpiochip0");
        let mut request = chip
            .request_lines(&RequestConfig::default(), &output_config(vec![2, 5]))
            .unwrap();

        request
            .reconfigure_lines(&input_config(vec![5, 2], Edge::Falling))
            .unwrap();
        assert_eq!(
            backend.line_snapshot("gpiochip0", 5).unwrap().edge,
            Edge::Falling
        );

        let err = request
            .reconfigure_lines(&input_config(vec![2], Edge::None))
            .unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::InvalidArgument);

        request.release();
        assert_eq!(backend.active_requests(), 0);
        assert_eq!(
            request.get_values(None).unwrap_err().kind,
            AdapterErrorKind::Released
        );
        assert_eq!(
            request
                .reconfigure_lines(&output_config(vec![2, 5]))
                .unwrap_err()
                .kind,
            AdapterErrorKind::Released
        );
    }

    #[test]
    fn test_removed_chip_fails_operations() {
        let backend = SimBackend::with_chips(&[SimChipSpec::new("gpiochip0", 2)]);
        let (mut chip, _rx) = open(&backend, "gpiochip0");
        let mut request = chip
            .request_lines(&RequestConfig::default(), &output_config(vec![0]))
            .unwrap();

        assert!(backend.remove_chip("gpiochip0"));
        assert_eq!(chip.info().unwrap_err().kind, AdapterErrorKind::NotFound);
        assert_eq!(
            request.get_values(None).unwrap_err().kind,
            AdapterErrorKind::NotFound
        );
        request.release();
    }

    #[test]
    fn test_injected_watch_failure_fires_once() {
        let backend = SimBackend::with_chips(&[SimChipSpec::new("gpiochip0", 4)]);
        let (mut chip, _rx) = open(&backend, "gpiochip0");

        backend.fail_watch_at("gpiochip0", 2);
        assert!(chip.watch_line_info(0).is_ok());
        assert!(chip.watch_line_info(2).is_err());
        assert!(chip.watch_line_info(2).is_ok());
        assert_eq!(
            chip.watch_line_info(2).unwrap_err().kind,
            AdapterErrorKind::Busy
        );
    }
}
