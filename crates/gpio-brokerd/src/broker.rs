//! Event dispatcher
//!
//! The broker owns both registries and drains [`BrokerEvent`]s one at a time.
//! Handlers run to completion, so no registry is ever shared or locked.

use crate::adapter::ChipOpener;
use crate::bus::{self, Interface, ObjectExporter};
use crate::chip_registry::ChipRegistry;
use crate::error::{BrokerError, Result};
use crate::event::{self, BrokerEvent, EventReceiver, EventSender};
use crate::hotplug::{HotplugAction, HotplugEvent};
use crate::request_registry::RequestRegistry;
use crate::wire::{MethodCall, MethodReply};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// The broker context
pub struct Broker {
    opener: Arc<dyn ChipOpener>,
    exporter: Arc<dyn ObjectExporter>,
    chips: ChipRegistry,
    requests: RequestRegistry,
    tx: EventSender,
    rx: EventReceiver,
}

impl Broker {
    /// Create a broker with empty registries
    pub fn new(opener: Arc<dyn ChipOpener>, exporter: Arc<dyn ObjectExporter>) -> Self {
        let (tx, rx) = event::channel();
        Self {
            opener,
            exporter,
            chips: ChipRegistry::new(),
            requests: RequestRegistry::new(),
            tx,
            rx,
        }
    }

    /// Handle for queueing events
    pub fn sender(&self) -> EventSender {
        self.tx.clone()
    }

    /// Exported chips
    pub fn chips(&self) -> &ChipRegistry {
        &self.chips
    }

    /// Live requests
    pub fn requests(&self) -> &RequestRegistry {
        &self.requests
    }

    /// Process one event. Only internal-consistency errors are returned;
    /// method call failures go back to the caller.
    pub fn handle_event(&mut self, event: BrokerEvent) -> Result<()> {
        match event {
            BrokerEvent::Hotplug(event) => self.hotplug(event),
            BrokerEvent::MethodCall { path, call, reply } => {
                let result = self.call(&path, call);
                if let Err(e) = &result {
                    if e.is_fatal() {
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(BrokerError::internal("broker failure")));
                        }
                        return result.map(|_| ());
                    }
                }

                if let Some(reply) = reply {
                    if reply.send(result).is_err() {
                        debug!(path = %path, "caller went away before the reply");
                    }
                }
                Ok(())
            }
            BrokerEvent::InfoChanged { chip, info } => {
                self.chips.info_changed(&chip, info, self.exporter.as_ref())
            }
            BrokerEvent::Edge {
                request,
                generation,
                event,
            } => self.requests.forward_edge(
                request,
                generation,
                &event,
                &self.chips,
                self.exporter.as_ref(),
            ),
        }
    }

    fn hotplug(&mut self, event: HotplugEvent) -> Result<()> {
        let device = event.device;
        debug!(action = ?event.action, device = %device.name, "hotplug event");

        match event.action {
            HotplugAction::Add => {
                self.chips
                    .add(&device, self.opener.as_ref(), self.exporter.as_ref(), &self.tx)?;
            }
            HotplugAction::Remove => {
                if !device.is_gpiochip() {
                    debug!(device = %device.name, "not a gpio chip, ignoring");
                    return Ok(());
                }
                self.remove_chip(&device.name)?;
            }
        }
        Ok(())
    }

    fn remove_chip(&mut self, devname: &str) -> Result<()> {
        let released = self.requests.release_for_chip(
            devname,
            &mut self.chips,
            self.exporter.as_ref(),
        )?;
        if released > 0 {
            info!(chip = %devname, released, "released requests of departing chip");
        }
        self.chips.remove(devname, self.exporter.as_ref())?;
        Ok(())
    }

    /// Execute a method call against an exported object
    pub fn call(&mut self, path: &str, call: MethodCall) -> Result<MethodReply> {
        debug!(path = %path, method = call.name(), args = ?call, "method call");

        let result = self.dispatch(path, call);
        if let Err(e) = &result {
            if e.is_fatal() || e.adapter_error().is_some() {
                error!(path = %path, "{}", e);
            } else {
                debug!(path = %path, "call rejected: {}", e);
            }
        }
        result
    }

    fn dispatch(&mut self, path: &str, call: MethodCall) -> Result<MethodReply> {
        let interface = self.exporter.resolve_method(path, call.name())?;
        let exporter = self.exporter.as_ref();

        match (interface, call) {
            (
                Interface::Chip,
                MethodCall::RequestLines {
                    line_config,
                    request_config,
                },
            ) => {
                let devname = self
                    .chips
                    .devname_for_path(path)
                    .ok_or_else(|| BrokerError::internal(format!("no chip entry for {}", path)))?
                    .to_string();
                let request_path = self.requests.request_lines(
                    &mut self.chips,
                    &devname,
                    &request_config,
                    &line_config,
                    exporter,
                    &self.tx,
                )?;
                Ok(MethodReply::ObjectPath(request_path))
            }
            (Interface::Request, MethodCall::Release) => {
                let id = request_id(path)?;
                self.requests.release(id, &mut self.chips, exporter)?;
                Ok(MethodReply::Unit)
            }
            (Interface::Request, MethodCall::ReconfigureLines { line_config }) => {
                self.requests.reconfigure(request_id(path)?, &line_config)?;
                Ok(MethodReply::Unit)
            }
            (Interface::Request, MethodCall::GetValues { offsets }) => {
                let values = self
                    .requests
                    .get_values(request_id(path)?, offsets.as_deref())?;
                Ok(MethodReply::Values(
                    values.iter().map(|v| v.as_wire()).collect(),
                ))
            }
            (Interface::Request, MethodCall::SetValues { offsets, values }) => {
                self.requests
                    .set_values(request_id(path)?, &offsets, &values)?;
                Ok(MethodReply::Unit)
            }
            (_, call) => Err(BrokerError::UnknownMethod {
                path: path.to_string(),
                method: call.name().to_string(),
            }),
        }
    }

    /// Process every queued event without waiting. Returns how many were
    /// handled.
    pub fn drain_pending(&mut self) -> Result<usize> {
        let mut handled = 0;
        while let Ok(event) = self.rx.try_recv() {
            self.handle_event(event)?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Run the dispatcher until `shutdown` resolves, then retract every chip
    pub async fn run<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!("broker dispatcher started");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                event = self.rx.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    if let Err(e) = self.handle_event(event) {
                        error!("stopping dispatcher: {}", e);
                        return Err(e);
                    }
                }
            }
        }

        self.shutdown()
    }

    /// Remove every chip through the normal removal cascade
    pub fn shutdown(&mut self) -> Result<()> {
        let devnames = self.chips.devnames();
        if !devnames.is_empty() {
            info!(chips = devnames.len(), "retracting chips");
        }
        for devname in devnames {
            self.remove_chip(&devname)?;
        }
        if !self.requests.is_empty() {
            warn!(requests = self.requests.len(), "requests left after shutdown");
        }
        Ok(())
    }
}

fn request_id(path: &str) -> Result<u32> {
    bus::parse_request_id(path)
        .ok_or_else(|| BrokerError::internal(format!("malformed request path {}", path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{SimBackend, SimChipSpec};
    use crate::bus::ObjectBus;
    use crate::hotplug::Device;
    use crate::line::{Direction, LineConfig, LineSettings, LineValue, RequestConfig};
    use std::path::PathBuf;
    use tokio::sync::oneshot;

    fn broker_with_chip(num_lines: u32) -> (Broker, SimBackend, ObjectBus) {
        let backend = SimBackend::with_chips(&[SimChipSpec::new("gpiochip0", num_lines)]);
        let bus = ObjectBus::default();
        let mut broker = Broker::new(Arc::new(backend.clone()), Arc::new(bus.clone()));
        broker
            .handle_event(BrokerEvent::Hotplug(HotplugEvent::add(Device::new(
                "gpiochip0",
                Some(PathBuf::from("/dev/gpiochip0")),
            ))))
            .unwrap();
        (broker, backend, bus)
    }

    fn request_outputs(offsets: Vec<u32>) -> MethodCall {
        let mut line_config = LineConfig::new();
        line_config.add_group(
            offsets,
            LineSettings {
                direction: Direction::Output,
                ..Default::default()
            },
        );
        MethodCall::RequestLines {
            line_config,
            request_config: RequestConfig::default(),
        }
    }

    #[test]
    fn test_method_call_event_replies() {
        let (mut broker, _backend, _bus) = broker_with_chip(4);
        let (reply, mut rx) = oneshot::channel();

        broker
            .handle_event(BrokerEvent::MethodCall {
                path: "/broker/chips/gpiochip0".to_string(),
                call: request_outputs(vec![1]),
                reply: Some(reply),
            })
            .unwrap();

        let result = rx.try_recv().unwrap().unwrap();
        assert_eq!(
            result,
            MethodReply::ObjectPath("/broker/requests/request0".to_string())
        );
    }

    #[test]
    fn test_unknown_targets() {
        let (mut broker, _backend, _bus) = broker_with_chip(2);

        let err = broker
            .call("/broker/requests/request4", MethodCall::Release)
            .unwrap_err();
        assert_eq!(err.bus_name(), "broker.Error.UnknownObject");

        let err = broker
            .call("/broker/chips/gpiochip0/line0", MethodCall::Release)
            .unwrap_err();
        assert_eq!(err.bus_name(), "broker.Error.UnknownMethod");

        let err = broker
            .call("/broker/chips/gpiochip0", MethodCall::Release)
            .unwrap_err();
        assert_eq!(err.bus_name(), "broker.Error.UnknownMethod");
    }

    #[test]
    fn test_info_changes_are_drained() {
        let (mut broker, _backend, bus) = broker_with_chip(4);
        broker.call("/broker/chips/gpiochip0", request_outputs(vec![2])).unwrap();

        assert!(broker.drain_pending().unwrap() > 0);
        assert_eq!(
            bus.property("/broker/chips/gpiochip0/line2", "Used"),
            Some(true.into())
        );
        assert_eq!(
            bus.property("/broker/chips/gpiochip0/line2", "Direction"),
            Some("output".into())
        );
    }

    #[test]
    fn test_values_round_trip_through_dispatch() {
        let (mut broker, _backend, _bus) = broker_with_chip(4);
        let path = match broker
            .call("/broker/chips/gpiochip0", request_outputs(vec![3, 0]))
            .unwrap()
        {
            MethodReply::ObjectPath(path) => path,
            other => panic!("unexpected reply {:?}", other),
        };

        broker
            .call(
                &path,
                MethodCall::SetValues {
                    offsets: vec![0],
                    values: vec![LineValue::Active],
                },
            )
            .unwrap();
        let values = broker
            .call(&path, MethodCall::GetValues { offsets: None })
            .unwrap();
        assert_eq!(values, MethodReply::Values(vec![0, 1]));
    }

    #[test]
    fn test_shutdown_retracts_everything() {
        let (mut broker, backend, bus) = broker_with_chip(4);
        broker.call("/broker/chips/gpiochip0", request_outputs(vec![0])).unwrap();
        broker.call("/broker/chips/gpiochip0", request_outputs(vec![1])).unwrap();

        broker.shutdown().unwrap();
        assert!(broker.chips().is_empty());
        assert!(broker.requests().is_empty());
        assert!(bus.is_empty());
        assert_eq!(backend.active_requests(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (mut broker, _backend, bus) = broker_with_chip(2);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        stop_tx.send(()).unwrap();

        broker
            .run(async {
                let _ = stop_rx.await;
            })
            .await
            .unwrap();
        assert!(bus.is_empty());
    }

    #[tokio::test]
    async fn test_run_fails_on_internal_error() {
        let (mut broker, _backend, _bus) = broker_with_chip(2);
        broker
            .sender()
            .send(BrokerEvent::InfoChanged {
                chip: "gpiochip0".to_string(),
                info: crate::line::LineInfo::unused(9, ""),
            })
            .unwrap();

        let err = broker.run(std::future::pending()).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
