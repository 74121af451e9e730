use innkeep_core::events::EventPublisher;
use innkeep_core::repository::OutboxStore;
use innkeep_core::CoreResult;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub published: usize,
    pub failed: usize,
}

/// Drains staged events to the broker. Entries that fail stay in the
/// outbox and are picked up again on the next pass.
#[derive(Clone)]
pub struct OutboxDispatcher {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn EventPublisher>,
    batch_size: i64,
}

impl OutboxDispatcher {
    pub fn new(store: Arc<dyn OutboxStore>, publisher: Arc<dyn EventPublisher>, batch_size: i64) -> Self {
        Self {
            store,
            publisher,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn dispatch_pending(&self) -> CoreResult<DispatchReport> {
        let entries = self.store.claim_pending(self.batch_size).await?;
        let mut report = DispatchReport::default();

        for entry in entries {
            let message = &entry.message;
            match self.publisher.publish(&message.topic, &message.key, &message.payload).await {
                Ok(()) => {
                    self.store.mark_published(entry.id).await?;
                    report.published += 1;
                }
                Err(e) => {
                    warn!(outbox_id = entry.id, attempts = entry.attempts, topic = %message.topic, "Publish failed, will retry: {}", e);
                    self.store.mark_failed(entry.id, &e.to_string()).await?;
                    report.failed += 1;
                }
            }
        }

        if report.published + report.failed > 0 {
            info!(published = report.published, failed = report.failed, "Outbox pass complete");
        } else {
            debug!("Outbox empty");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use innkeep_core::booking::Reservation;
    use innkeep_core::events::OutboxMessage;
    use innkeep_core::memory::{InMemoryBookingStore, RecordingPublisher};
    use innkeep_core::repository::BookingStore;

    async fn staged_store() -> InMemoryBookingStore {
        let store = InMemoryBookingStore::new();
        for _ in 0..3 {
            let room_id = store.seed_room(80.0, 1);
            store
                .reserve(&Reservation {
                    days: 1,
                    user_id: 7,
                    room_id,
                    event: Some(OutboxMessage::new("booking.created", "booking", format!("{{\"room_id\":{}}}", room_id))),
                })
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_dispatch_publishes_in_order() {
        let store = staged_store().await;
        let publisher = RecordingPublisher::new();
        let dispatcher = OutboxDispatcher::new(Arc::new(store.clone()), Arc::new(publisher.clone()), 10);

        let report = dispatcher.dispatch_pending().await.unwrap();

        assert_eq!(report, DispatchReport { published: 3, failed: 0 });
        let payloads: Vec<String> = publisher.published().into_iter().map(|e| e.payload).collect();
        assert_eq!(payloads, vec!["{\"room_id\":1}", "{\"room_id\":2}", "{\"room_id\":3}"]);
        assert_eq!(store.unpublished_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_publish_is_retried_next_pass() {
        let store = staged_store().await;
        let publisher = RecordingPublisher::new();
        publisher.set_fail(true);
        let dispatcher = OutboxDispatcher::new(Arc::new(store.clone()), Arc::new(publisher.clone()), 10);

        let report = dispatcher.dispatch_pending().await.unwrap();
        assert_eq!(report, DispatchReport { published: 0, failed: 3 });
        assert_eq!(store.unpublished_count(), 3);
        assert!(store.last_error(1).is_some());

        publisher.set_fail(false);
        let report = dispatcher.dispatch_pending().await.unwrap();
        assert_eq!(report.published, 3);
        assert_eq!(store.unpublished_count(), 0);
    }

    #[tokio::test]
    async fn test_batch_size_limits_a_pass() {
        let store = staged_store().await;
        let publisher = RecordingPublisher::new();
        let dispatcher = OutboxDispatcher::new(Arc::new(store.clone()), Arc::new(publisher.clone()), 2);

        assert_eq!(dispatcher.dispatch_pending().await.unwrap().published, 2);
        assert_eq!(dispatcher.dispatch_pending().await.unwrap().published, 1);
    }
}
