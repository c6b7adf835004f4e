//! Fanout Queue (spec 4.9): turns one matched `(subscription, event)` pair
//! into zero or more `DeliveryTask`s, rate-gating per user first.
//!
//! Per-user FIFO ordering is delegated to the storage gateway's task
//! sequence counter rather than re-implemented here — the single-owner
//! `VecDeque`-per-user pattern from `vault::pool`'s share-ledger handoff is
//! what the storage gateway's in-memory backend uses internally
//! (`storage::memory::State::task_order`); this module only needs to
//! preserve call order when it enqueues, which a synchronous write path
//! already guarantees.

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::models::{
    CanonicalRelease, Channel, DeadLetterReason, DeadLetterRow, DeliveryStatus, DeliveryTask,
    ReleaseEvent, UserSubscription, WebhookPayload,
};
use crate::storage::{hour_bucket, StorageGateway};

fn build_payload(event: &ReleaseEvent, release: &CanonicalRelease, priority_score: f64) -> WebhookPayload {
    WebhookPayload {
        event_id: event.event_id,
        release_id: event.release_id,
        name: release.name.clone(),
        brand: release.brand.clone(),
        status_from: event.status_from,
        status_to: event.status_to,
        price_from: event.price_from.map(|p| p.0),
        price_to: event.price_to.map(|p| p.0),
        url: None,
        region: release.region.clone(),
        priority_score,
        detected_at: event.detected_at,
    }
}

/// Fan an event out to every channel on `subscriptions`, rate-gating per
/// user. Returns the number of tasks enqueued.
pub async fn fanout(
    storage: &dyn StorageGateway,
    event: &ReleaseEvent,
    release: &CanonicalRelease,
    priority_score: f64,
    subscriptions: &[UserSubscription],
) -> anyhow::Result<usize> {
    let now = Utc::now();
    let bucket = hour_bucket(now);
    let payload = build_payload(event, release, priority_score);
    let mut enqueued = 0usize;

    for sub in subscriptions {
        if let Some(max) = sub.max_events_per_hour {
            let current = storage.get_rate(sub.user_id, bucket).await?;
            if current >= max {
                warn!(user_id = %sub.user_id, max, "rate limit exceeded, dead-lettering event");
                storage
                    .dead_letter(DeadLetterRow {
                        original_event_id: event.event_id,
                        user_id: sub.user_id,
                        payload: payload.clone(),
                        reason: DeadLetterReason::RateLimited,
                        recorded_at: now,
                    })
                    .await?;
                continue;
            }
        }

        for channel in &sub.channels {
            let task = DeliveryTask {
                task_id: Uuid::new_v4(),
                user_id: sub.user_id,
                subscription_id: sub.subscription_id,
                event_id: event.event_id,
                channel: Channel { kind: channel.kind, address: channel.address.clone() },
                status: DeliveryStatus::Pending,
                attempts: 0,
                last_attempt_at: None,
                next_attempt_at: now,
                payload: payload.clone(),
                lease_expires_at: None,
            };
            storage.enqueue_task(task).await?;
            enqueued += 1;
        }
    }

    Ok(enqueued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChannelKind, Money, PayloadHash, ReleaseId, Status};
    use crate::storage::MemoryStorage;
    use std::collections::HashSet;

    fn release() -> CanonicalRelease {
        let now = Utc::now();
        CanonicalRelease {
            release_id: ReleaseId(1),
            sku: Some("ABC".into()),
            brand: Some("nike".into()),
            name: "AJ1".into(),
            status: Status::Live,
            price: Some(Money::from_major(100.0)),
            currency: Some("USD".into()),
            release_date: None,
            region: None,
            source: "nike".into(),
            first_seen_at: now,
            updated_at: now,
            stock_summary: None,
            payload_hash: PayloadHash(1),
        }
    }

    fn event() -> ReleaseEvent {
        let now = Utc::now();
        ReleaseEvent {
            event_id: Uuid::new_v4(),
            release_id: ReleaseId(1),
            source: "nike".into(),
            status_from: None,
            status_to: Some(Status::Live),
            price_from: None,
            price_to: None,
            detected_at: now,
            ingestion_started: now,
            ingestion_completed: now,
            latency_ms: 5,
            aggregator_hits: 0,
            social_mentions: None,
            restock_likelihood: None,
            priority_score: 0.5,
        }
    }

    fn sub(max_events_per_hour: Option<u32>) -> UserSubscription {
        UserSubscription {
            subscription_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            brand_filter: HashSet::new(),
            sku_filter: HashSet::new(),
            region_filter: HashSet::new(),
            size_filter: HashSet::new(),
            max_events_per_hour,
            channels: vec![
                Channel { kind: ChannelKind::Discord, address: "https://x".into() },
                Channel { kind: ChannelKind::Email, address: "u@example.com".into() },
            ],
        }
    }

    #[tokio::test]
    async fn creates_one_task_per_channel() {
        let storage = MemoryStorage::new();
        let count = fanout(&storage, &event(), &release(), 0.5, &[sub(None)]).await.unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn exceeding_rate_limit_dead_letters_instead_of_enqueueing() {
        let storage = MemoryStorage::new();
        let s = sub(Some(1));
        let bucket = hour_bucket(Utc::now());
        storage.increment_rate(s.user_id, bucket).await.unwrap();

        let count = fanout(&storage, &event(), &release(), 0.5, &[s]).await.unwrap();
        assert_eq!(count, 0, "rate-limited subscription must not consume a delivery slot");
    }
}
