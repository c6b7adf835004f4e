//! End-to-end scenario tests against an in-memory storage gateway.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use ingestord::canonicalizer::Canonicalizer;
use ingestord::change_detector::{self, IngestionWindow};
use ingestord::delivery::{self, DeliveryChannel, SendOutcome};
use ingestord::fanout;
use ingestord::models::{Channel, ChannelKind, Money, RawRelease, Status, UserSubscription};
use ingestord::storage::{MemoryStorage, StorageGateway};
use ingestord::subscriptions::SubscriptionIndex;

fn nike_raw(status_raw: &str, price: f64) -> RawRelease {
    RawRelease {
        source: "nike".into(),
        source_id: "1".into(),
        title: "AJ1 Bred".into(),
        brand: Some("Jordan".into()),
        sku: Some("DZ5485-612".into()),
        price: Some(Money::from_major(price)),
        currency: Some("USD".into()),
        release_date: None,
        status_raw: Some(status_raw.into()),
        url: None,
        image_url: None,
        size_availability: None,
    }
}

fn window() -> IngestionWindow {
    let started = Utc::now();
    IngestionWindow { started, completed: started + chrono::Duration::milliseconds(10) }
}

#[tokio::test]
async fn s1_new_release_creates_event() {
    let storage = MemoryStorage::new();
    let canon = Canonicalizer::new();

    let outcome = canon.canonicalize(nike_raw("UPCOMING", 180.0), &storage).await.unwrap().unwrap();
    assert!(outcome.pre.is_none());

    let expected_id = ingestord::hashing::release_id(Some("DZ5485-612"), "AJ1 Bred", "nike");
    assert_eq!(outcome.post.release_id, expected_id);

    let event = change_detector::detect(outcome.pre.as_ref(), &outcome.post, window()).unwrap();
    assert!(event.status_from.is_none());
    assert_eq!(event.status_to, Some(Status::Upcoming));
    assert!(event.price_from.is_none());
    assert!(event.price_to.is_none());
}

#[tokio::test]
async fn s2_status_flip_fans_out_to_two_users() {
    let storage = MemoryStorage::new();
    let canon = Canonicalizer::new();

    let first = canon.canonicalize(nike_raw("UPCOMING", 180.0), &storage).await.unwrap().unwrap();
    let _ = change_detector::detect(first.pre.as_ref(), &first.post, window()).unwrap();

    let second = canon.canonicalize(nike_raw("LIVE", 180.0), &storage).await.unwrap().unwrap();
    let event = change_detector::detect(second.pre.as_ref(), &second.post, window()).unwrap();
    assert_eq!(event.status_from, Some(Status::Upcoming));
    assert_eq!(event.status_to, Some(Status::Live));

    let mut index = SubscriptionIndex::new();
    let u1 = UserSubscription {
        subscription_id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        brand_filter: ["Jordan".to_string()].into_iter().collect(),
        sku_filter: HashSet::new(),
        region_filter: HashSet::new(),
        size_filter: HashSet::new(),
        max_events_per_hour: None,
        channels: vec![Channel { kind: ChannelKind::Discord, address: "https://u1".into() }],
    };
    let u2 = UserSubscription {
        subscription_id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        brand_filter: HashSet::new(),
        sku_filter: ["DZ5485-612".to_string()].into_iter().collect(),
        region_filter: HashSet::new(),
        size_filter: HashSet::new(),
        max_events_per_hour: None,
        channels: vec![Channel { kind: ChannelKind::Email, address: "u2@example.com".into() }],
    };
    index.upsert(u1.clone());
    index.upsert(u2.clone());

    let matched = index.matches(&second.post);
    assert_eq!(matched.len(), 2, "both U1 (brand) and U2 (sku) should match");

    let enqueued = fanout::fanout(&storage, &event, &second.post, 0.5, &[u1, u2]).await.unwrap();
    assert_eq!(enqueued, 2, "one delivery task per matched user");
}

#[tokio::test]
async fn s3_circuit_breaker_opens_after_three_failures() {
    use ingestord::models::BreakerState;
    use ingestord::scheduler::health::{HealthTracker, CB_THRESHOLD};

    let tracker = HealthTracker::new();
    for _ in 0..CB_THRESHOLD {
        tracker.record_failure("nike-json", "default");
    }
    assert_eq!(tracker.snapshot("nike-json").breaker_state, BreakerState::Open);
    // Still open before the cooldown elapses.
    assert_eq!(tracker.poll_transitions("nike-json"), BreakerState::Open);
}

#[tokio::test]
async fn s4_rate_limit_dead_letters_third_event() {
    let storage = MemoryStorage::new();
    let sub = UserSubscription {
        subscription_id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        brand_filter: HashSet::new(),
        sku_filter: HashSet::new(),
        region_filter: HashSet::new(),
        size_filter: HashSet::new(),
        max_events_per_hour: Some(2),
        channels: vec![Channel { kind: ChannelKind::Discord, address: "https://u1".into() }],
    };

    let canon = Canonicalizer::new();
    let mut total_enqueued = 0;
    for i in 0..3u8 {
        let raw = nike_raw(if i == 0 { "UPCOMING" } else { "LIVE" }, 180.0 + i as f64);
        let outcome = canon.canonicalize(raw, &storage).await.unwrap().unwrap();
        let Some(event) = change_detector::detect(outcome.pre.as_ref(), &outcome.post, window()) else {
            continue;
        };
        let enqueued = fanout::fanout(&storage, &event, &outcome.post, 0.5, std::slice::from_ref(&sub))
            .await
            .unwrap();
        total_enqueued += enqueued;
        if enqueued > 0 {
            // Simulate successful delivery so the rate counter advances,
            // since fanout itself only checks the counter, it never
            // increments it (spec: incremented on successful delivery).
            let bucket = ingestord::storage::hour_bucket(Utc::now());
            storage.increment_rate(sub.user_id, bucket).await.unwrap();
        }
    }

    assert_eq!(total_enqueued, 2, "only the first two events should reach delivery");
}

#[tokio::test]
async fn s5_nike_without_sku_is_quarantined() {
    let storage = MemoryStorage::new();
    let canon = Canonicalizer::new();

    let raw = RawRelease {
        source: "nike".into(),
        source_id: "2".into(),
        title: "Air Max".into(),
        brand: Some("Nike".into()),
        sku: None,
        price: None,
        currency: None,
        release_date: None,
        status_raw: Some("UPCOMING".into()),
        url: None,
        image_url: None,
        size_availability: None,
    };

    let outcome = canon.canonicalize(raw, &storage).await.unwrap();
    assert!(outcome.is_none(), "quarantined record must not produce a canonical row");
}

#[tokio::test]
async fn s6_idempotent_reingest_advances_updated_at_only() {
    let storage = MemoryStorage::new();
    let canon = Canonicalizer::new();

    let first = canon.canonicalize(nike_raw("UPCOMING", 180.0), &storage).await.unwrap().unwrap();
    let first_event = change_detector::detect(first.pre.as_ref(), &first.post, window());
    assert!(first_event.is_some());

    let second = canon.canonicalize(nike_raw("UPCOMING", 180.0), &storage).await.unwrap().unwrap();
    let second_event = change_detector::detect(second.pre.as_ref(), &second.post, window());
    assert!(second_event.is_none(), "identical payload must not produce a second event");
    assert_eq!(second.post.first_seen_at, first.post.first_seen_at);
    assert!(second.post.updated_at >= first.post.updated_at);

    let canonical = storage.get_canonical(second.post.release_id).await.unwrap();
    assert!(canonical.is_some());
}

struct FlakyWebhook {
    remaining_failures: std::sync::atomic::AtomicU32,
}

#[async_trait::async_trait]
impl DeliveryChannel for FlakyWebhook {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Discord
    }

    async fn send(&self, _task: &ingestord::models::DeliveryTask) -> SendOutcome {
        let remaining = self.remaining_failures.load(std::sync::atomic::Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            SendOutcome::RetryableFailure { retry_after: None }
        } else {
            SendOutcome::Sent
        }
    }
}

#[tokio::test]
async fn lease_exclusivity_holds_under_concurrent_workers() {
    let storage = Arc::new(MemoryStorage::new());
    let sub = UserSubscription {
        subscription_id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        brand_filter: HashSet::new(),
        sku_filter: HashSet::new(),
        region_filter: HashSet::new(),
        size_filter: HashSet::new(),
        max_events_per_hour: None,
        channels: vec![Channel { kind: ChannelKind::Discord, address: "https://u1".into() }],
    };
    let canon = Canonicalizer::new();
    let outcome = canon.canonicalize(nike_raw("UPCOMING", 180.0), storage.as_ref()).await.unwrap().unwrap();
    let event = change_detector::detect(outcome.pre.as_ref(), &outcome.post, window()).unwrap();
    fanout::fanout(storage.as_ref(), &event, &outcome.post, 0.5, std::slice::from_ref(&sub)).await.unwrap();

    let channel: Arc<dyn DeliveryChannel> = Arc::new(FlakyWebhook { remaining_failures: 0.into() });
    let mut handles = Vec::new();
    for _ in 0..4 {
        let storage = storage.clone();
        let channel = channel.clone();
        handles.push(tokio::spawn(async move { delivery::process_one(storage.as_ref(), channel.as_ref()).await }));
    }
    let mut processed_count = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap() {
            processed_count += 1;
        }
    }
    assert_eq!(processed_count, 1, "exactly one worker should have leased the single pending task");
}
