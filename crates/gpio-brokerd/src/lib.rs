//! GPIO Resource Broker Daemon
//!
//! Publishes the machine's GPIO chips and lines as objects on an
//! inter-process bus and arbitrates exclusive line requests between
//! independent clients. Chips follow kernel hotplug; line snapshots follow
//! kernel info-change events; edge events are forwarded to subscribers in
//! kernel order.

pub mod adapter;
pub mod broker;
pub mod bus;
pub mod chip_registry;
pub mod config_file;
pub mod error;
pub mod event;
pub mod hotplug;
pub mod http_api;
pub mod id_set;
pub mod line;
pub mod request_registry;
pub mod systemd;
pub mod wire;

pub use adapter::{ChipHandle, ChipOpener, RequestHandle, SimBackend, SimChipSpec};
#[cfg(target_os = "linux")]
pub use adapter::CdevBackend;
pub use broker::Broker;
pub use bus::{BusSignal, Interface, ObjectBus, ObjectExporter, ObjectSnapshot, PropValue};
pub use chip_registry::{ChipEntry, ChipRegistry, LineEntry};
pub use config_file::{BackendKind, BrokerConfig, DEFAULT_CONFIG_PATH};
pub use error::*;
pub use event::{BrokerEvent, EventSender};
pub use hotplug::{Device, HotplugAction, HotplugEvent};
pub use http_api::AppState;
pub use id_set::IdSet;
pub use line::*;
pub use request_registry::{RequestEntry, RequestRegistry};
pub use systemd::SystemdNotifier;
pub use wire::{MethodCall, MethodReply};

/// Version of the object and method layout served on the bus
pub const BUS_API_VERSION: u32 = 1;
