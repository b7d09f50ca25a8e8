//! Hotplug watcher for GPIO chips
//!
//! Linux: listens on the kernel uevent netlink socket for `gpio` subsystem
//! add/remove notifications. Chips already present at startup are found by
//! scanning the device directory.

use crate::error::{BrokerError, Result};
use crate::event::{BrokerEvent, EventSender};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Device lifecycle action
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HotplugAction {
    /// Device appeared
    Add,
    /// Device went away
    Remove,
}

impl HotplugAction {
    /// Parse the uevent action string; other actions are not of interest
    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "add" => Some(HotplugAction::Add),
            "remove" => Some(HotplugAction::Remove),
            _ => None,
        }
    }
}

/// A device reported by the hotplug monitor
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    /// Kernel device name, e.g. `gpiochip0`
    pub name: String,
    /// Character device node, if the device has one
    pub devnode: Option<PathBuf>,
}

impl Device {
    /// Create a device record
    pub fn new(name: impl Into<String>, devnode: Option<PathBuf>) -> Self {
        Self {
            name: name.into(),
            devnode,
        }
    }

    /// True for GPIO chip character devices. Legacy sysfs line exports
    /// share the subsystem but have no device node.
    pub fn is_gpiochip(&self) -> bool {
        self.devnode.is_some()
    }
}

/// One hotplug notification
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HotplugEvent {
    /// What happened
    pub action: HotplugAction,
    /// To which device
    pub device: Device,
}

impl HotplugEvent {
    /// Chip add notification
    pub fn add(device: Device) -> Self {
        Self {
            action: HotplugAction::Add,
            device,
        }
    }

    /// Chip removal notification
    pub fn remove(device: Device) -> Self {
        Self {
            action: HotplugAction::Remove,
            device,
        }
    }
}

/// Parse a kernel uevent message (`ACTION@DEVPATH\0KEY=VALUE\0...`).
///
/// Returns `None` for messages outside the `gpio` subsystem, for actions
/// other than add/remove and for udev daemon rebroadcasts.
pub fn parse_uevent(buf: &[u8], dev_dir: &Path) -> Option<HotplugEvent> {
    let mut fields = buf.split(|b| *b == 0).filter(|f| !f.is_empty());

    let header = std::str::from_utf8(fields.next()?).ok()?;
    if !header.contains('@') {
        return None;
    }

    let mut action = None;
    let mut devpath = None;
    let mut subsystem = None;
    let mut devname = None;
    for field in fields {
        let Ok(field) = std::str::from_utf8(field) else {
            continue;
        };
        match field.split_once('=') {
            Some(("ACTION", v)) => action = Some(v),
            Some(("DEVPATH", v)) => devpath = Some(v),
            Some(("SUBSYSTEM", v)) => subsystem = Some(v),
            Some(("DEVNAME", v)) => devname = Some(v),
            _ => {}
        }
    }

    if subsystem? != "gpio" {
        return None;
    }
    let action = HotplugAction::parse(action?)?;
    let name = devpath?.rsplit('/').next()?.to_string();
    let devnode = devname.map(|d| {
        let d = Path::new(d);
        if d.is_absolute() {
            d.to_path_buf()
        } else {
            dev_dir.join(d)
        }
    });

    Some(HotplugEvent {
        action,
        device: Device { name, devnode },
    })
}

fn chip_sort_key(name: &str) -> (usize, String) {
    (name.len(), name.to_string())
}

/// Chips already present in `dev_dir`, in numeric order
pub fn enumerate_chips(dev_dir: &Path) -> Result<Vec<Device>> {
    let entries = std::fs::read_dir(dev_dir).map_err(|e| {
        BrokerError::Hotplug(format!("Failed to scan {}: {}", dev_dir.display(), e))
    })?;

    let mut devices: Vec<Device> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?.to_string();
            name.starts_with("gpiochip")
                .then(|| Device::new(name, Some(entry.path())))
        })
        .collect();

    devices.sort_by_key(|d| chip_sort_key(&d.name));
    Ok(devices)
}

/// Queue an add event for every device, in order
pub fn announce(devices: Vec<Device>, tx: &EventSender) -> Result<()> {
    for device in devices {
        debug!(chip = %device.name, "announcing present chip");
        tx.send(BrokerEvent::Hotplug(HotplugEvent::add(device)))
            .map_err(|_| BrokerError::Hotplug("dispatcher queue closed".to_string()))?;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
pub use uevent::UeventMonitor;

#[cfg(target_os = "linux")]
mod uevent {
    use super::*;
    use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_KOBJECT_UEVENT};
    use tokio::io::unix::AsyncFd;

    /// Multicast group the kernel broadcasts uevents on
    const UEVENT_KERNEL_GROUP: u32 = 1;

    const UEVENT_BUFFER_SIZE: usize = 16 * 1024;

    /// Kernel uevent subscriber
    pub struct UeventMonitor {
        socket: AsyncFd<Socket>,
        dev_dir: PathBuf,
        buffer: Vec<u8>,
    }

    impl UeventMonitor {
        /// Bind to the kernel uevent multicast group
        pub fn new(dev_dir: impl Into<PathBuf>) -> Result<Self> {
            let mut socket = Socket::new(NETLINK_KOBJECT_UEVENT).map_err(|e| {
                BrokerError::Hotplug(format!("Failed to create uevent socket: {}", e))
            })?;

            socket
                .bind(&SocketAddr::new(0, UEVENT_KERNEL_GROUP))
                .map_err(|e| BrokerError::Hotplug(format!("Failed to bind uevent socket: {}", e)))?;
            socket.set_non_blocking(true).map_err(|e| {
                BrokerError::Hotplug(format!("Failed to set non-blocking: {}", e))
            })?;

            let socket = AsyncFd::new(socket)
                .map_err(|e| BrokerError::Hotplug(format!("Failed to create AsyncFd: {}", e)))?;

            debug!("Subscribed to kernel uevents");

            Ok(Self {
                socket,
                dev_dir: dev_dir.into(),
                buffer: Vec::with_capacity(UEVENT_BUFFER_SIZE),
            })
        }

        /// Wait for the next gpio add/remove notification
        pub async fn next_event(&mut self) -> Result<HotplugEvent> {
            loop {
                let mut guard = self
                    .socket
                    .readable()
                    .await
                    .map_err(|e| BrokerError::Hotplug(format!("uevent poll failed: {}", e)))?;

                self.buffer.clear();
                let buffer = &mut self.buffer;
                match guard.try_io(|inner| inner.get_ref().recv(buffer, 0)) {
                    Ok(Ok(_)) => {
                        if let Some(event) = parse_uevent(&self.buffer, &self.dev_dir) {
                            return Ok(event);
                        }
                    }
                    Ok(Err(e)) => {
                        return Err(BrokerError::Hotplug(format!("uevent recv failed: {}", e)));
                    }
                    Err(_would_block) => continue,
                }
            }
        }

        /// Forward notifications to the dispatcher until it goes away
        pub async fn run(mut self, tx: EventSender) {
            loop {
                match self.next_event().await {
                    Ok(event) => {
                        debug!(action = ?event.action, chip = %event.device.name, "uevent");
                        if tx.send(BrokerEvent::Hotplug(event)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("{}", e);
                        return;
                    }
                }
            }
        }
    }
}
