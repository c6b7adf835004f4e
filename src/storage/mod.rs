//! Storage Gateway (spec 6): the single seam between the ingestion core and
//! whatever relational store backs it. Spec 9 explicitly scopes dual-write
//! and Firestore/SQL precedence questions out of the core; this crate picks
//! one concrete backend (`rusqlite`, per-row locking via
//! `parking_lot::Mutex`) and an in-memory twin for tests, both behind the
//! same trait so the rest of the pipeline never branches on backend.

pub mod memory;
pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    CanonicalRelease, ChannelKind, DeadLetterRow, DeliveryStatus, DeliveryTask, QuarantineRow,
    ReleaseEvent, ReleaseId, ScraperHealth, StockSnapshot, TaskId, UserId, UserSubscription,
};

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

/// `floor(now / 1 hour)`, per spec's Hour bucket definition.
pub fn hour_bucket(at: DateTime<Utc>) -> i64 {
    at.timestamp() / 3600
}

#[async_trait]
pub trait StorageGateway: Send + Sync {
    async fn get_canonical(&self, release_id: ReleaseId) -> anyhow::Result<Option<CanonicalRelease>>;
    async fn upsert_canonical(&self, release: CanonicalRelease) -> anyhow::Result<()>;

    async fn latest_stock_snapshot(&self, release_id: ReleaseId) -> anyhow::Result<Option<StockSnapshot>>;
    async fn append_stock_snapshot(&self, snapshot: StockSnapshot) -> anyhow::Result<()>;

    async fn append_event(&self, event: ReleaseEvent) -> anyhow::Result<()>;
    async fn events_for_release(&self, release_id: ReleaseId) -> anyhow::Result<Vec<ReleaseEvent>>;

    async fn quarantine(&self, row: QuarantineRow) -> anyhow::Result<()>;

    async fn upsert_subscription(&self, sub: UserSubscription) -> anyhow::Result<()>;
    async fn subscriptions_matching_brand_or_sku(
        &self,
        brand: Option<&str>,
        sku: Option<&str>,
    ) -> anyhow::Result<Vec<UserSubscription>>;
    async fn all_subscriptions(&self) -> anyhow::Result<Vec<UserSubscription>>;

    async fn update_health(&self, health: ScraperHealth) -> anyhow::Result<()>;
    async fn get_health(&self, target_id: &str) -> anyhow::Result<Option<ScraperHealth>>;

    async fn enqueue_task(&self, task: DeliveryTask) -> anyhow::Result<()>;
    /// Lease one PENDING task for `channel`, marking it IN_FLIGHT with a
    /// lease expiring after `lease_duration`. Returns `None` if no task is
    /// ready.
    async fn lease_task(
        &self,
        channel: ChannelKind,
        lease_duration: Duration,
    ) -> anyhow::Result<Option<DeliveryTask>>;
    async fn complete_task(&self, task_id: TaskId, status: DeliveryStatus) -> anyhow::Result<()>;
    /// Return a task to PENDING, e.g. after a failed attempt that should
    /// retry, or because its lease expired.
    async fn release_task(&self, task: DeliveryTask) -> anyhow::Result<()>;
    async fn expire_leases(&self) -> anyhow::Result<usize>;

    async fn dead_letter(&self, row: DeadLetterRow) -> anyhow::Result<()>;

    /// Atomically increment `(user_id, hour_bucket)` and return the new
    /// count.
    async fn increment_rate(&self, user_id: UserId, hour_bucket: i64) -> anyhow::Result<u32>;
    async fn get_rate(&self, user_id: UserId, hour_bucket: i64) -> anyhow::Result<u32>;
    /// Garbage-collect rate counters older than 48 hours (spec 3).
    async fn gc_rate_counters(&self, older_than_hours_ago: i64) -> anyhow::Result<usize>;
}
