//! Bridges ready batches from the registry into persisted batch rows.

use std::sync::Arc;

use tracing::{info, warn};

use crate::bus::{Event, EventBus};
use crate::error::Result;
use crate::store::Store;
use crate::types::{now_ms, ScreenshotId, SourceKey};

/// Subscribes to `batch:ready`, persists the batch transactionally, and
/// announces `batch:persisted` so analysis can claim it.
pub struct BatchBuilder {
    store: Arc<Store>,
    bus: Arc<EventBus>,
}

impl BatchBuilder {
    /// Creates a builder over the shared store and bus.
    pub fn new(store: Arc<Store>, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    /// Wires the builder into the bus. The subscription keeps the builder
    /// alive for the lifetime of the bus.
    pub fn attach(self: Arc<Self>) {
        let builder = Arc::clone(&self);
        self.bus
            .subscribe(crate::bus::Channel::BatchReady, move |event| {
                if let Event::BatchReady {
                    source_key,
                    screenshot_ids,
                    ..
                } = event
                {
                    if let Err(err) = builder.handle_ready(source_key, screenshot_ids) {
                        warn!(source_key = %source_key, %err, "batch.builder.persist_failed");
                    }
                }
            });
    }

    /// Persists one ready batch and publishes its arrival.
    pub fn handle_ready(
        &self,
        source_key: &SourceKey,
        screenshot_ids: &[ScreenshotId],
    ) -> Result<()> {
        let outcome = self
            .store
            .create_and_persist_batch(source_key, screenshot_ids, now_ms())?;
        info!(
            batch_id = %outcome.batch.batch_id,
            members = outcome.batch.screenshot_ids.len(),
            reused = outcome.reused,
            "batch.builder.persisted"
        );
        self.bus.publish(&Event::BatchPersisted {
            batch_db_id: outcome.batch.id,
            batch_id: outcome.batch.batch_id.clone(),
            source_key: source_key.clone(),
            screenshot_ids: outcome.batch.screenshot_ids.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Channel;
    use crate::store::NewScreenshot;
    use parking_lot::Mutex;

    #[test]
    fn ready_batches_flow_through_to_persisted() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new());
        let persisted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&persisted);
        bus.subscribe(Channel::BatchPersisted, move |event| {
            if let Event::BatchPersisted { batch_id, .. } = event {
                sink.lock().push(batch_id.clone());
            }
        });
        Arc::new(BatchBuilder::new(Arc::clone(&store), Arc::clone(&bus))).attach();

        let key = SourceKey::screen("1");
        let sid = store
            .insert_screenshot(&NewScreenshot::for_test(key.clone(), 1_000), 1_000)
            .unwrap();
        bus.publish(&Event::BatchReady {
            source_key: key,
            screenshot_ids: vec![sid],
            trigger: crate::bus::BatchTrigger::Timeout,
        });

        let seen = persisted.lock();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].starts_with("batch_"));
    }
}
