//! Object bus
//!
//! Exported objects live in a path-keyed table. Each object implements one
//! interface with a fixed method table; property changes and custom signals
//! are broadcast to subscribers.

use crate::error::{BrokerError, Result};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Parent of all chip objects
pub const CHIPS_ROOT: &str = "/broker/chips";

/// Parent of all request objects
pub const REQUESTS_ROOT: &str = "/broker/requests";

/// Object path of a chip
pub fn chip_path(devname: &str) -> String {
    format!("{}/{}", CHIPS_ROOT, devname)
}

/// Object path of a line below its chip
pub fn line_path(chip_path: &str, offset: u32) -> String {
    format!("{}/line{}", chip_path, offset)
}

/// Object path of a request
pub fn request_path(id: u32) -> String {
    format!("{}/request{}", REQUESTS_ROOT, id)
}

/// Request id encoded in a request object path
pub fn parse_request_id(path: &str) -> Option<u32> {
    path.strip_prefix(REQUESTS_ROOT)?
        .strip_prefix("/request")?
        .parse()
        .ok()
}

/// Interfaces implemented by exported objects
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Interface {
    /// A GPIO chip
    #[serde(rename = "broker.Chip")]
    Chip,
    /// One line of a chip
    #[serde(rename = "broker.Line")]
    Line,
    /// A granted line request
    #[serde(rename = "broker.Request")]
    Request,
}

impl Interface {
    /// Methods callable on objects of this interface
    pub fn methods(&self) -> &'static [&'static str] {
        match self {
            Interface::Chip => &["RequestLines"],
            Interface::Line => &[],
            Interface::Request => &["Release", "ReconfigureLines", "GetValues", "SetValues"],
        }
    }

    /// Check a method against the table
    pub fn has_method(&self, method: &str) -> bool {
        self.methods().iter().any(|m| *m == method)
    }
}

/// Property value
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PropValue {
    /// Boolean
    Bool(bool),
    /// Unsigned integer
    U64(u64),
    /// String or object path
    Str(String),
    /// List of strings or object paths
    StrList(Vec<String>),
}

impl From<bool> for PropValue {
    fn from(v: bool) -> Self {
        PropValue::Bool(v)
    }
}

impl From<u32> for PropValue {
    fn from(v: u32) -> Self {
        PropValue::U64(u64::from(v))
    }
}

impl From<u64> for PropValue {
    fn from(v: u64) -> Self {
        PropValue::U64(v)
    }
}

impl From<&str> for PropValue {
    fn from(v: &str) -> Self {
        PropValue::Str(v.to_string())
    }
}

impl From<String> for PropValue {
    fn from(v: String) -> Self {
        PropValue::Str(v)
    }
}

impl From<Vec<String>> for PropValue {
    fn from(v: Vec<String>) -> Self {
        PropValue::StrList(v)
    }
}

/// Property name to value
pub type PropertyMap = BTreeMap<&'static str, PropValue>;

/// Notifications broadcast to bus subscribers
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "signal")]
pub enum BusSignal {
    /// An object was exported
    ObjectAdded {
        /// Object path
        path: String,
        /// Its interface
        interface: Interface,
        /// Initial properties
        properties: PropertyMap,
    },
    /// An object was retracted
    ObjectRemoved {
        /// Object path
        path: String,
        /// Its interface
        interface: Interface,
    },
    /// Some properties of an object changed
    PropertiesChanged {
        /// Object path
        path: String,
        /// Its interface
        interface: Interface,
        /// Only the values that changed
        changed: PropertyMap,
    },
    /// Edge event on a line
    EdgeEvent {
        /// Line object path
        path: String,
        /// 1 rising, 0 falling
        edge: i32,
        /// Kernel timestamp
        timestamp_ns: u64,
        /// Request-wide sequence number
        global_seqno: u64,
        /// Per-line sequence number
        line_seqno: u64,
    },
}

/// A published object
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ObjectSnapshot {
    /// Object path
    pub path: String,
    /// Interface
    pub interface: Interface,
    /// Current properties
    pub properties: PropertyMap,
}

/// Publishes objects and emits notifications on behalf of the broker
pub trait ObjectExporter: Send + Sync {
    /// Publish an object. The path must not be taken.
    fn export(&self, path: &str, interface: Interface, properties: PropertyMap) -> Result<()>;

    /// Retract an object
    fn unexport(&self, path: &str) -> Result<()>;

    /// Merge properties into an object, announcing those that changed
    fn update_properties(&self, path: &str, properties: PropertyMap) -> Result<()>;

    /// Broadcast a custom signal
    fn emit_signal(&self, signal: BusSignal);

    /// Objects below `prefix`
    fn children(&self, prefix: &str) -> Vec<ObjectSnapshot>;

    /// One object
    fn object(&self, path: &str) -> Option<ObjectSnapshot>;

    /// Interface of the object at `path`
    fn interface(&self, path: &str) -> Option<Interface> {
        self.object(path).map(|o| o.interface)
    }

    /// Resolve a method call target, rejecting unknown objects and methods
    fn resolve_method(&self, path: &str, method: &str) -> Result<Interface> {
        let interface = self
            .interface(path)
            .ok_or_else(|| BrokerError::UnknownObject(path.to_string()))?;
        if !interface.has_method(method) {
            return Err(BrokerError::UnknownMethod {
                path: path.to_string(),
                method: method.to_string(),
            });
        }
        Ok(interface)
    }
}

#[derive(Debug)]
struct ExportedObject {
    interface: Interface,
    properties: PropertyMap,
}

/// In-memory object table with broadcast signals
#[derive(Clone, Debug)]
pub struct ObjectBus {
    objects: Arc<RwLock<BTreeMap<String, ExportedObject>>>,
    signals: broadcast::Sender<BusSignal>,
}

impl ObjectBus {
    /// Create a bus buffering up to `signal_capacity` undelivered signals
    /// per subscriber
    pub fn new(signal_capacity: usize) -> Self {
        let (signals, _) = broadcast::channel(signal_capacity.max(1));
        Self {
            objects: Arc::new(RwLock::new(BTreeMap::new())),
            signals,
        }
    }

    /// Subscribe to signals emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<BusSignal> {
        self.signals.subscribe()
    }

    /// Number of exported objects
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// True when nothing is exported
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Single property lookup
    pub fn property(&self, path: &str, name: &str) -> Option<PropValue> {
        self.objects
            .read()
            .get(path)
            .and_then(|o| o.properties.get(name).cloned())
    }

    fn send(&self, signal: BusSignal) {
        // No subscribers is not an error
        let _ = self.signals.send(signal);
    }
}

impl Default for ObjectBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl ObjectExporter for ObjectBus {
    fn export(&self, path: &str, interface: Interface, properties: PropertyMap) -> Result<()> {
        {
            let mut objects = self.objects.write();
            if objects.contains_key(path) {
                return Err(BrokerError::internal(format!(
                    "object {} is already exported",
                    path
                )));
            }
            objects.insert(
                path.to_string(),
                ExportedObject {
                    interface,
                    properties: properties.clone(),
                },
            );
        }

        debug!(path = %path, ?interface, "exported object");
        self.send(BusSignal::ObjectAdded {
            path: path.to_string(),
            interface,
            properties,
        });
        Ok(())
    }

    fn unexport(&self, path: &str) -> Result<()> {
        let removed = self.objects.write().remove(path).ok_or_else(|| {
            BrokerError::internal(format!("object {} is not exported", path))
        })?;

        debug!(path = %path, "unexported object");
        self.send(BusSignal::ObjectRemoved {
            path: path.to_string(),
            interface: removed.interface,
        });
        Ok(())
    }

    fn update_properties(&self, path: &str, properties: PropertyMap) -> Result<()> {
        let (interface, changed) = {
            let mut objects = self.objects.write();
            let object = objects.get_mut(path).ok_or_else(|| {
                BrokerError::internal(format!("object {} is not exported", path))
            })?;

            let mut changed = PropertyMap::new();
            for (name, value) in properties {
                if object.properties.get(name) != Some(&value) {
                    object.properties.insert(name, value.clone());
                    changed.insert(name, value);
                }
            }
            (object.interface, changed)
        };

        if !changed.is_empty() {
            self.send(BusSignal::PropertiesChanged {
                path: path.to_string(),
                interface,
                changed,
            });
        }
        Ok(())
    }

    fn emit_signal(&self, signal: BusSignal) {
        self.send(signal);
    }

    fn children(&self, prefix: &str) -> Vec<ObjectSnapshot> {
        let prefix = prefix.trim_end_matches('/');
        let below = format!("{}/", prefix);
        self.objects
            .read()
            .iter()
            .filter(|(path, _)| path.starts_with(&below))
            .map(|(path, object)| ObjectSnapshot {
                path: path.clone(),
                interface: object.interface,
                properties: object.properties.clone(),
            })
            .collect()
    }

    fn object(&self, path: &str) -> Option<ObjectSnapshot> {
        self.objects.read().get(path).map(|object| ObjectSnapshot {
            path: path.to_string(),
            interface: object.interface,
            properties: object.properties.clone(),
        })
    }
}
