//! systemd service notifications

use crate::error::{BrokerError, Result};
use tracing::debug;

/// Readiness and status notifications for `Type=notify` services.
///
/// Does nothing unless `NOTIFY_SOCKET` is set.
#[derive(Clone, Debug)]
pub struct SystemdNotifier {
    enabled: bool,
}

impl SystemdNotifier {
    /// Detect the notification socket
    pub fn new() -> Self {
        let enabled = std::env::var_os("NOTIFY_SOCKET").is_some();
        if enabled {
            debug!("systemd notification socket detected");
        }
        Self { enabled }
    }

    /// Notifier that never sends anything
    pub fn disabled() -> Self {
        Self { enabled: false }
    }

    /// Tell systemd the broker is serving
    pub fn notify_ready(&self) -> Result<()> {
        self.notify(&[sd_notify::NotifyState::Ready])
    }

    /// Update the status line shown by `systemctl status`
    pub fn notify_status(&self, message: &str) -> Result<()> {
        self.notify(&[sd_notify::NotifyState::Status(message)])
    }

    /// Tell systemd the broker is shutting down
    pub fn notify_stopping(&self) -> Result<()> {
        self.notify(&[sd_notify::NotifyState::Stopping])
    }

    /// True when running under systemd with a notify socket
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn notify(&self, state: &[sd_notify::NotifyState]) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        sd_notify::notify(false, state)
            .map_err(|e| BrokerError::Bus(format!("systemd notification failed: {}", e)))
    }
}

impl Default for SystemdNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_notifier_is_silent() {
        let notifier = SystemdNotifier::disabled();
        assert!(!notifier.is_enabled());
        assert!(notifier.notify_ready().is_ok());
        assert!(notifier.notify_status("serving 2 chips").is_ok());
        assert!(notifier.notify_stopping().is_ok());
    }
}
