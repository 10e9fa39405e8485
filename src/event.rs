use std::sync::Arc;

use tokio::sync::mpsc;

use crate::cell::CellId;
use crate::error::{ErrorCategory, ErrorRecord};
use crate::pipeline::PipelineState;
use crate::record::RingBuffer;

/// Everything the stages can tell the control loop.
///
/// Stages only publish; classification and dispatch happen in one place,
/// on the control thread.
#[derive(Debug)]
pub enum PipelineEvent {
    /// A frame left the capture source.
    FrameReady { pts: u64, seq: u64 },
    /// A stage (or the whole graph) finished a state transition.
    StateChanged {
        component: &'static str,
        old: PipelineState,
        new: PipelineState,
    },
    /// A record bin finished draining; its buffer is read-only from here on.
    RecordDrained {
        cell: CellId,
        generation: u64,
        buffer: Arc<RingBuffer>,
    },
    /// Classified error or warning from any stage.
    Error(ErrorRecord),
    /// A producing stage reached end of stream.
    Eos { component: &'static str },
    /// Informational progress event (recovery steps, stats).
    Info {
        component: &'static str,
        message: String,
    },
}

/// Publishing half of the event bus, injected into every stage at
/// construction. Cheap to clone; sends never block.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<PipelineEvent>,
}

impl EventBus {
    pub fn channel() -> (EventBus, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventBus { tx }, rx)
    }

    /// Post an event. A closed bus (engine shutting down) drops it silently;
    /// stages must not care whether anyone is still listening.
    pub fn post(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn error(&self, record: ErrorRecord) {
        self.post(PipelineEvent::Error(record));
    }

    pub fn warning(&self, category: ErrorCategory, component: &'static str, message: String) {
        debug_assert!(category.is_warning());
        self.error(ErrorRecord::new(category, component, message));
    }

    pub fn info(&self, component: &'static str, message: impl Into<String>) {
        self.post(PipelineEvent::Info {
            component,
            message: message.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_post_order() {
        let (bus, mut rx) = EventBus::channel();

        bus.post(PipelineEvent::FrameReady { pts: 1, seq: 1 });
        bus.info("camera", "negotiated");

        match rx.recv().await.unwrap() {
            PipelineEvent::FrameReady { pts, seq } => {
                assert_eq!(pts, 1);
                assert_eq!(seq, 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            PipelineEvent::Info { component, .. } => assert_eq!(component, "camera"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn post_after_receiver_dropped_is_silent() {
        let (bus, rx) = EventBus::channel();
        drop(rx);
        bus.info("pipeline", "late event");
    }
}
