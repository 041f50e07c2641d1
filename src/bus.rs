//! Typed in-process event bus.
//!
//! Named channels with synchronous FIFO fan-out. Subscribers must not block
//! the publisher; anything long-running forwards into a scheduler wake
//! channel instead of doing work inline.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::types::{BatchDbId, ScreenshotId, SourceKey};

/// Channel names used by the core pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// A screenshot passed dedup and was persisted.
    ScreenshotAccept,
    /// A source buffer drained and a batch is ready to persist.
    BatchReady,
    /// A batch row exists; analysis may claim it.
    BatchPersisted,
    /// Analysis produced context nodes; downstream schedulers should wake.
    NodesCreated,
    /// Vector-document rows changed; the vector scheduler should wake.
    VectorDocumentsDirty,
    /// Scheduler lifecycle signals for observability.
    SchedulerLifecycle,
}

/// What drained a source buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchTrigger {
    /// The buffer reached the minimum batch size.
    Size,
    /// The buffer aged past the batch timeout.
    Timeout,
}

impl BatchTrigger {
    /// Stable label for logs and tests.
    pub fn as_str(self) -> &'static str {
        match self {
            BatchTrigger::Size => "size",
            BatchTrigger::Timeout => "timeout",
        }
    }
}

/// Scheduler lifecycle phases published on [`Channel::SchedulerLifecycle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    /// Loop thread started.
    Started,
    /// Loop thread stopped.
    Stopped,
    /// An external wake arrived.
    Waked,
    /// A cycle began.
    CycleStart,
    /// A cycle finished.
    CycleEnd,
}

/// Events delivered over the bus.
#[derive(Debug, Clone)]
pub enum Event {
    /// A screenshot passed dedup and was persisted.
    ScreenshotAccepted {
        /// The new screenshot's row id.
        screenshot_id: ScreenshotId,
        /// Its capture source.
        source_key: SourceKey,
    },
    /// A source buffer drained.
    BatchReady {
        /// The drained source.
        source_key: SourceKey,
        /// Members in capture order.
        screenshot_ids: Vec<ScreenshotId>,
        /// What caused the drain.
        trigger: BatchTrigger,
    },
    /// A batch row was persisted (or an identical one reused).
    BatchPersisted {
        /// Batch row id.
        batch_db_id: BatchDbId,
        /// Content-addressed batch id.
        batch_id: String,
        /// Owning source.
        source_key: SourceKey,
        /// Members in capture order.
        screenshot_ids: Vec<ScreenshotId>,
    },
    /// Analysis produced context nodes.
    NodesCreated {
        /// The new or replaced nodes.
        node_ids: Vec<crate::types::NodeId>,
        /// How many of them requested OCR.
        ocr_requested: usize,
    },
    /// Vector-document rows changed.
    VectorDocumentsDirty,
    /// A scheduler lifecycle signal.
    SchedulerLifecycle {
        /// Scheduler name, e.g. `vlm`.
        scheduler: &'static str,
        /// Which phase fired.
        phase: LifecyclePhase,
    },
}

impl Event {
    /// The channel this event is delivered on.
    pub fn channel(&self) -> Channel {
        match self {
            Event::ScreenshotAccepted { .. } => Channel::ScreenshotAccept,
            Event::BatchReady { .. } => Channel::BatchReady,
            Event::BatchPersisted { .. } => Channel::BatchPersisted,
            Event::NodesCreated { .. } => Channel::NodesCreated,
            Event::VectorDocumentsDirty => Channel::VectorDocumentsDirty,
            Event::SchedulerLifecycle { .. } => Channel::SchedulerLifecycle,
        }
    }
}

type Subscriber = Box<dyn Fn(&Event) + Send + Sync>;

/// In-process pub/sub hub shared by the pipeline components.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<FxHashMap<Channel, Vec<Subscriber>>>,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber on a channel. Delivery order within a channel
    /// follows registration order.
    pub fn subscribe(&self, channel: Channel, subscriber: impl Fn(&Event) + Send + Sync + 'static) {
        self.subscribers
            .write()
            .entry(channel)
            .or_default()
            .push(Box::new(subscriber));
    }

    /// Delivers an event synchronously to every subscriber of its channel.
    pub fn publish(&self, event: &Event) {
        let channel = event.channel();
        trace!(?channel, "bus.publish");
        let subscribers = self.subscribers.read();
        if let Some(list) = subscribers.get(&channel) {
            for subscriber in list {
                subscriber(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn delivery_is_fifo_within_a_channel() {
        let bus = EventBus::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for tag in 0..3 {
            let order = Arc::clone(&order);
            bus.subscribe(Channel::VectorDocumentsDirty, move |_| {
                order.lock().push(tag);
            });
        }
        bus.publish(&Event::VectorDocumentsDirty);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn events_route_by_channel() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&hits);
        bus.subscribe(Channel::BatchReady, move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&Event::VectorDocumentsDirty);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        bus.publish(&Event::BatchReady {
            source_key: SourceKey::screen("1"),
            screenshot_ids: vec![1],
            trigger: BatchTrigger::Size,
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
