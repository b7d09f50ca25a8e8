//! Line model shared by the registries and the adapters
//!
//! Line snapshots, per-line settings, request configuration and edge events.

/// Line direction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    /// Leave the direction unchanged (settings only)
    #[default]
    AsIs,
    /// Input line
    Input,
    /// Output line
    Output,
}

impl Direction {
    /// Bus representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::AsIs => "as-is",
            Direction::Input => "input",
            Direction::Output => "output",
        }
    }
}

/// Edge detection mode
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Edge {
    /// No edge detection
    #[default]
    None,
    /// Rising edges only
    Rising,
    /// Falling edges only
    Falling,
    /// Both edges
    Both,
}

impl Edge {
    /// Bus representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Edge::None => "none",
            Edge::Rising => "rising",
            Edge::Falling => "falling",
            Edge::Both => "both",
        }
    }

    /// Whether transitions of the given kind are reported
    pub fn detects(&self, kind: EdgeKind) -> bool {
        matches!(
            (self, kind),
            (Edge::Both, _) | (Edge::Rising, EdgeKind::Rising) | (Edge::Falling, EdgeKind::Falling)
        )
    }
}

/// Line bias
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Bias {
    /// Leave the bias unchanged (settings only)
    #[default]
    AsIs,
    /// Bias state not known to the kernel (info only)
    Unknown,
    /// Bias disabled
    Disabled,
    /// Pull-up
    PullUp,
    /// Pull-down
    PullDown,
}

impl Bias {
    /// Bus representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Bias::AsIs => "as-is",
            Bias::Unknown => "unknown",
            Bias::Disabled => "disabled",
            Bias::PullUp => "pull-up",
            Bias::PullDown => "pull-down",
        }
    }
}

/// Output drive
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Drive {
    /// Push-pull
    #[default]
    PushPull,
    /// Open drain
    OpenDrain,
    /// Open source
    OpenSource,
}

impl Drive {
    /// Bus representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Drive::PushPull => "push-pull",
            Drive::OpenDrain => "open-drain",
            Drive::OpenSource => "open-source",
        }
    }
}

/// Clock used to timestamp edge events
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum EventClock {
    /// CLOCK_MONOTONIC
    #[default]
    Monotonic,
    /// CLOCK_REALTIME
    Realtime,
    /// Hardware timestamping engine
    Hte,
}

impl EventClock {
    /// Bus representation
    pub fn as_str(&self) -> &'static str {
        match self {
            EventClock::Monotonic => "monotonic",
            EventClock::Realtime => "realtime",
            EventClock::Hte => "hte",
        }
    }
}

/// Logical line value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum LineValue {
    /// Logical 0
    #[default]
    Inactive,
    /// Logical 1
    Active,
}

impl LineValue {
    /// Parse the integer wire form (0 or 1)
    pub fn from_wire(value: i64) -> Option<Self> {
        match value {
            0 => Some(LineValue::Inactive),
            1 => Some(LineValue::Active),
            _ => None,
        }
    }

    /// Integer wire form
    pub fn as_wire(&self) -> i32 {
        match self {
            LineValue::Inactive => 0,
            LineValue::Active => 1,
        }
    }

    /// The opposite value
    pub fn inverted(&self) -> Self {
        match self {
            LineValue::Inactive => LineValue::Active,
            LineValue::Active => LineValue::Inactive,
        }
    }
}

impl From<bool> for LineValue {
    fn from(active: bool) -> Self {
        if active {
            LineValue::Active
        } else {
            LineValue::Inactive
        }
    }
}

/// Chip level metadata
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChipInfo {
    /// Kernel chip name
    pub name: String,
    /// Chip label
    pub label: String,
    /// Number of lines exposed by the chip
    pub num_lines: u32,
}

/// Snapshot of one line's state as reported by the kernel
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct LineInfo {
    /// Offset within the chip
    pub offset: u32,
    /// Line name (empty if unnamed)
    pub name: String,
    /// Line is in use by some consumer
    pub used: bool,
    /// Consumer label (empty if unused)
    pub consumer: String,
    /// Current direction
    pub direction: Direction,
    /// Edge detection mode
    pub edge: Edge,
    /// Bias
    pub bias: Bias,
    /// Drive
    pub drive: Drive,
    /// Active-low flag
    pub active_low: bool,
    /// Debouncing enabled
    pub debounced: bool,
    /// Debounce period in microseconds
    pub debounce_period_us: u64,
    /// Edge event clock
    pub event_clock: EventClock,
}

impl LineInfo {
    /// Fresh, unused input line
    pub fn unused(offset: u32, name: impl Into<String>) -> Self {
        Self {
            offset,
            name: name.into(),
            direction: Direction::Input,
            bias: Bias::Unknown,
            ..Default::default()
        }
    }
}

/// Settings applied to a group of lines in a request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct LineSettings {
    /// Requested direction
    pub direction: Direction,
    /// Edge detection
    pub edge: Edge,
    /// Active-low
    pub active_low: bool,
    /// Bias
    pub bias: Bias,
    /// Drive
    pub drive: Drive,
    /// Debounce period in microseconds (0 disables)
    pub debounce_period_us: u64,
    /// Edge event clock
    pub event_clock: EventClock,
    /// Initial output value
    pub output_value: LineValue,
}

/// Line configuration: ordered groups of offsets with shared settings plus
/// optional output values applied after grouping.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct LineConfig {
    groups: Vec<(Vec<u32>, LineSettings)>,
    output_values: Vec<LineValue>,
}

impl LineConfig {
    /// Empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a group of offsets sharing the same settings
    pub fn add_group(&mut self, offsets: Vec<u32>, settings: LineSettings) -> &mut Self {
        self.groups.push((offsets, settings));
        self
    }

    /// Output values applied, in order, to the offsets as listed
    pub fn set_output_values(&mut self, values: Vec<LineValue>) -> &mut Self {
        self.output_values = values;
        self
    }

    /// Groups in the order they were added
    pub fn groups(&self) -> &[(Vec<u32>, LineSettings)] {
        &self.groups
    }

    /// Output value overrides
    pub fn output_values(&self) -> &[LineValue] {
        &self.output_values
    }

    /// All offsets in submission order, repeats included
    pub fn offsets(&self) -> Vec<u32> {
        self.groups
            .iter()
            .flat_map(|(offsets, _)| offsets.iter().copied())
            .collect()
    }

    /// Per-offset settings in submission order with output values merged in
    pub fn resolved(&self) -> Vec<(u32, LineSettings)> {
        let mut lines: Vec<(u32, LineSettings)> = self
            .groups
            .iter()
            .flat_map(|(offsets, settings)| offsets.iter().map(move |o| (*o, *settings)))
            .collect();

        for ((_, settings), value) in lines.iter_mut().zip(self.output_values.iter()) {
            settings.output_value = *value;
        }

        lines
    }

    /// Settings that apply to a single offset
    pub fn settings_for(&self, offset: u32) -> Option<LineSettings> {
        self.resolved()
            .into_iter()
            .find(|(o, _)| *o == offset)
            .map(|(_, settings)| settings)
    }
}

/// Request-wide configuration
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct RequestConfig {
    /// Consumer label attached to the requested lines
    pub consumer: Option<String>,
    /// Kernel edge event buffer size (0 = default)
    pub event_buffer_size: u32,
}

/// Edge transition type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeKind {
    /// Inactive to active
    Rising,
    /// Active to inactive
    Falling,
}

impl EdgeKind {
    /// Integer wire form: 1 rising, 0 falling
    pub fn as_wire(&self) -> i32 {
        match self {
            EdgeKind::Rising => 1,
            EdgeKind::Falling => 0,
        }
    }
}

/// Edge event delivered by a line request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EdgeEvent {
    /// Transition type
    pub kind: EdgeKind,
    /// Timestamp in nanoseconds on the line's event clock
    pub timestamp_ns: u64,
    /// Offset of the line that changed
    pub offset: u32,
    /// Sequence number across all lines of the request
    pub global_seqno: u64,
    /// Sequence number for this line
    pub line_seqno: u64,
}
