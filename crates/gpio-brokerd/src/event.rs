//! Events drained by the broker dispatcher
//!
//! Hotplug notifications, method calls and adapter callbacks all funnel into
//! one unbounded channel and are processed one at a time.

use crate::error::Result;
use crate::hotplug::HotplugEvent;
use crate::line::{EdgeEvent, LineInfo};
use crate::wire::{MethodCall, MethodReply};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Reply channel for a method call
pub type ReplySender = oneshot::Sender<Result<MethodReply>>;

/// Everything the dispatcher reacts to
#[derive(Debug)]
pub enum BrokerEvent {
    /// A chip appeared or disappeared
    Hotplug(HotplugEvent),
    /// Client method call against an exported object
    MethodCall {
        /// Target object path
        path: String,
        /// Decoded call
        call: MethodCall,
        /// Where to send the outcome; `None` drops it
        reply: Option<ReplySender>,
    },
    /// A watched line's info changed
    InfoChanged {
        /// Device name of the chip the line belongs to
        chip: String,
        /// New snapshot
        info: LineInfo,
    },
    /// An edge event arrived on a request
    Edge {
        /// Request id
        request: u32,
        /// Generation of the request the sink was bound to. Ids are reused
        /// after release, generations are not.
        generation: u64,
        /// The event as delivered by the kernel
        event: EdgeEvent,
    },
}

/// Sending half of the dispatcher queue
pub type EventSender = mpsc::UnboundedSender<BrokerEvent>;

/// Receiving half of the dispatcher queue
pub type EventReceiver = mpsc::UnboundedReceiver<BrokerEvent>;

/// Create the dispatcher queue
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Info-change callback bound to one chip
#[derive(Clone, Debug)]
pub struct InfoSink {
    chip: String,
    tx: EventSender,
}

impl InfoSink {
    /// Bind a sink to a chip's device name
    pub fn new(chip: impl Into<String>, tx: EventSender) -> Self {
        Self {
            chip: chip.into(),
            tx,
        }
    }

    /// Device name this sink reports for
    pub fn chip(&self) -> &str {
        &self.chip
    }

    /// Queue an info change
    pub fn send(&self, info: LineInfo) {
        let event = BrokerEvent::InfoChanged {
            chip: self.chip.clone(),
            info,
        };
        if self.tx.send(event).is_err() {
            debug!(chip = %self.chip, "dispatcher gone, dropping info event");
        }
    }
}

/// Edge-event callback bound to one request
#[derive(Clone, Debug)]
pub struct EdgeSink {
    request: u32,
    generation: u64,
    tx: EventSender,
}

impl EdgeSink {
    /// Bind a sink to a request id and its generation
    pub fn new(request: u32, generation: u64, tx: EventSender) -> Self {
        Self {
            request,
            generation,
            tx,
        }
    }

    /// Request id this sink reports for
    pub fn request(&self) -> u32 {
        self.request
    }

    /// Generation of the request this sink reports for
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue an edge event
    pub fn send(&self, event: EdgeEvent) {
        let event = BrokerEvent::Edge {
            request: self.request,
            generation: self.generation,
            event,
        };
        if self.tx.send(event).is_err() {
            debug!(request = self.request, "dispatcher gone, dropping edge event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line::EdgeKind;

    #[test]
    fn test_sinks_tag_events() {
        let (tx, mut rx) = channel();

        InfoSink::new("gpiochip1", tx.clone()).send(LineInfo::unused(3, "btn"));
        EdgeSink::new(7, 12, tx).send(EdgeEvent {
            kind: EdgeKind::Rising,
            timestamp_ns: 10,
            offset: 3,
            global_seqno: 1,
            line_seqno: 1,
        });

        match rx.try_recv().unwrap() {
            BrokerEvent::InfoChanged { chip, info } => {
                assert_eq!(chip, "gpiochip1");
                assert_eq!(info.offset, 3);
            }
            other => panic!("unexpected event {:?}", other),
        }
        match rx.try_recv().unwrap() {
            BrokerEvent::Edge {
                request,
                generation,
                event,
            } => {
                assert_eq!((request, generation), (7, 12));
                assert_eq!(event.global_seqno, 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_send_after_close_is_silent() {
        let (tx, rx) = channel();
        drop(rx);
        InfoSink::new("gpiochip0", tx).send(LineInfo::unused(0, ""));
    }
}
