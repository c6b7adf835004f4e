//! Domain types shared across every pipeline stage.
//!
//! Kept as a single module the way the teacher's `models.rs` holds every
//! wire/storage type in one place rather than scattering small structs
//! across component files.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A release's canonical identity, derived deterministically from
/// `(sku, source)` or `(source, slug(title))`. Never a random UUID: the
/// whole point is that re-deriving it from the same inputs yields the same
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReleaseId(pub u64);

impl std::fmt::Display for ReleaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Content fingerprint of a canonical release's normalized fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadHash(pub u64);

/// Event identity. Monotonic within a release via `detected_at` ordering,
/// but the id itself is a UUID since nothing downstream derives it.
pub type EventId = Uuid;
pub type UserId = Uuid;
pub type SubscriptionId = Uuid;
pub type TaskId = Uuid;

/// Money stored as integer minor units (cents) to keep change-detection
/// comparisons exact instead of comparing floats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Money(pub i64);

impl Money {
    pub fn from_major(units: f64) -> Self {
        Money((units * 100.0).round() as i64)
    }

    pub fn major(&self) -> f64 {
        self.0 as f64 / 100.0
    }
}

/// A value that must never reach a log line or error message. `Debug`/
/// `Display` both print `***`; only `expose()` yields the real value.
#[derive(Clone, Serialize, Deserialize)]
pub struct Redacted<T>(T);

impl<T> Redacted<T> {
    pub fn new(value: T) -> Self {
        Redacted(value)
    }

    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T> std::fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "***")
    }
}

impl<T> std::fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "***")
    }
}

/// One of the three shapes a target's response takes; drives parser
/// selection alongside `parser_key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetKind {
    JsonCatalog,
    HtmlPage,
    ApiFeed,
}

/// A pollable retailer endpoint. Configuration data; never mutated at
/// runtime (the scheduler mutates `ScraperHealth`/`next_due_at`, not this).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub target_id: String,
    pub kind: TargetKind,
    pub url_template: String,
    pub parser_key: String,
    pub source: String,
    pub expected_cadence_seconds: u64,
    pub proxy_pool_id: Option<String>,
    pub priority_score: f64,
}

impl Target {
    pub fn proxy_pool(&self) -> &str {
        self.proxy_pool_id.as_deref().unwrap_or("default")
    }
}

/// Per-size stock count observed for one release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeAvailability {
    pub total: u32,
    pub available: u32,
}

pub type StockSummary = HashMap<String, SizeAvailability>;

/// Output of parsing one target's response. Transient; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRelease {
    pub source: String,
    pub source_id: String,
    pub title: String,
    pub brand: Option<String>,
    pub sku: Option<String>,
    pub price: Option<Money>,
    pub currency: Option<String>,
    pub release_date: Option<DateTime<Utc>>,
    pub status_raw: Option<String>,
    pub url: Option<String>,
    pub image_url: Option<String>,
    pub size_availability: Option<StockSummary>,
}

/// Canonical release status vocabulary. Screaming-snake on the wire to
/// match the spec's literal status strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Upcoming,
    Live,
    RaffleOpen,
    RaffleClosed,
    Restock,
    SoldOut,
    Delayed,
    Unknown,
}

impl Status {
    /// Status weight feeding the priority scorer (spec 4.8).
    pub fn weight(&self) -> f64 {
        match self {
            Status::Live => 1.0,
            Status::RaffleOpen => 0.9,
            Status::Restock => 0.8,
            Status::Upcoming => 0.3,
            _ => 0.1,
        }
    }
}

/// The deduplicated release entity. Sole writer is the Canonicalizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalRelease {
    pub release_id: ReleaseId,
    pub sku: Option<String>,
    pub brand: Option<String>,
    pub name: String,
    pub status: Status,
    pub price: Option<Money>,
    pub currency: Option<String>,
    pub release_date: Option<DateTime<Utc>>,
    pub region: Option<String>,
    pub source: String,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stock_summary: Option<StockSummary>,
    pub payload_hash: PayloadHash,
}

/// Point-in-time stock sample. Append-only; elided when semantically equal
/// to the prior snapshot for the same release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockSnapshot {
    pub release_id: ReleaseId,
    pub observed_at: DateTime<Utc>,
    pub size_availability: StockSummary,
}

/// Immutable state-transition record produced by the Change Detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseEvent {
    pub event_id: EventId,
    pub release_id: ReleaseId,
    pub source: String,
    pub status_from: Option<Status>,
    pub status_to: Option<Status>,
    pub price_from: Option<Money>,
    pub price_to: Option<Money>,
    pub detected_at: DateTime<Utc>,
    pub ingestion_started: DateTime<Utc>,
    pub ingestion_completed: DateTime<Utc>,
    pub latency_ms: i64,
    pub aggregator_hits: u32,
    pub social_mentions: Option<u32>,
    pub restock_likelihood: Option<f64>,
    pub priority_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelKind {
    Email,
    Discord,
    Slack,
    CustomWebhook,
    Push,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub kind: ChannelKind,
    pub address: String,
}

/// A filter owned by one user. A user may own many; each matches
/// independently (spec 4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSubscription {
    pub subscription_id: SubscriptionId,
    pub user_id: UserId,
    pub brand_filter: HashSet<String>,
    pub sku_filter: HashSet<String>,
    pub region_filter: HashSet<String>,
    pub size_filter: HashSet<String>,
    pub max_events_per_hour: Option<u32>,
    pub channels: Vec<Channel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    InFlight,
    Sent,
    Failed,
    DeadLettered,
}

/// An in-flight per-user dispatch. Ownership moves from the Fanout Queue to
/// a single Delivery Worker under a time-bounded lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryTask {
    pub task_id: TaskId,
    pub user_id: UserId,
    pub subscription_id: SubscriptionId,
    pub event_id: EventId,
    pub channel: Channel,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: DateTime<Utc>,
    pub payload: WebhookPayload,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

/// Outbound wire shape for webhook channels (spec 6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event_id: EventId,
    pub release_id: ReleaseId,
    pub name: String,
    pub brand: Option<String>,
    pub status_from: Option<Status>,
    pub status_to: Option<Status>,
    pub price_from: Option<i64>,
    pub price_to: Option<i64>,
    pub url: Option<String>,
    pub region: Option<String>,
    pub priority_score: f64,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// One row per target, continuously updated by fetch outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperHealth {
    pub target_id: String,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub breaker_state: BreakerState,
    pub breaker_opened_at: Option<DateTime<Utc>>,
    pub proxy_pool: String,
}

impl ScraperHealth {
    pub fn new(target_id: impl Into<String>, proxy_pool: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            last_success_at: None,
            consecutive_failures: 0,
            breaker_state: BreakerState::Closed,
            breaker_opened_at: None,
            proxy_pool: proxy_pool.into(),
        }
    }
}

/// Reasons a RawRelease or event is routed to quarantine / dead-letter
/// instead of advancing the pipeline (spec 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineReason {
    MissingSkuNikeJordan,
    StructurallyInvalid,
}

impl std::fmt::Display for QuarantineReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QuarantineReason::MissingSkuNikeJordan => "missing_sku_nike_jordan",
            QuarantineReason::StructurallyInvalid => "structurally_invalid",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineRow {
    pub reason: QuarantineReason,
    pub source: String,
    pub raw_payload: String,
    pub quarantined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    RateLimited,
    DeliveryPermanent,
    DeliveryExhausted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRow {
    pub original_event_id: EventId,
    pub user_id: UserId,
    pub payload: WebhookPayload,
    pub reason: DeadLetterReason,
    pub recorded_at: DateTime<Utc>,
}
