//! In-memory `StorageGateway`, grounded on the teacher's
//! `vault::pool::PooledVault` pattern of one `parking_lot::Mutex`-guarded
//! state struct per logical resource. Used by the test suite and by
//! `ingestord --ephemeral` for local smoke-testing.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::{hour_bucket as bucket_of, StorageGateway};
use crate::models::{
    CanonicalRelease, ChannelKind, DeadLetterRow, DeliveryStatus, DeliveryTask, QuarantineRow,
    ReleaseEvent, ReleaseId, ScraperHealth, StockSnapshot, TaskId, UserId, UserSubscription,
};

#[derive(Default)]
struct State {
    canonical: HashMap<ReleaseId, CanonicalRelease>,
    stock_snapshots: HashMap<ReleaseId, Vec<StockSnapshot>>,
    events: HashMap<ReleaseId, Vec<ReleaseEvent>>,
    quarantine: Vec<QuarantineRow>,
    subscriptions: HashMap<uuid::Uuid, UserSubscription>,
    health: HashMap<String, ScraperHealth>,
    tasks: HashMap<TaskId, DeliveryTask>,
    task_order: VecDeque<TaskId>,
    dead_letters: Vec<DeadLetterRow>,
    rate_counters: HashMap<(UserId, i64), u32>,
}

#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<State>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageGateway for MemoryStorage {
    async fn get_canonical(&self, release_id: ReleaseId) -> anyhow::Result<Option<CanonicalRelease>> {
        Ok(self.state.lock().canonical.get(&release_id).cloned())
    }

    async fn upsert_canonical(&self, release: CanonicalRelease) -> anyhow::Result<()> {
        self.state.lock().canonical.insert(release.release_id, release);
        Ok(())
    }

    async fn latest_stock_snapshot(&self, release_id: ReleaseId) -> anyhow::Result<Option<StockSnapshot>> {
        Ok(self
            .state
            .lock()
            .stock_snapshots
            .get(&release_id)
            .and_then(|v| v.last().cloned()))
    }

    async fn append_stock_snapshot(&self, snapshot: StockSnapshot) -> anyhow::Result<()> {
        self.state
            .lock()
            .stock_snapshots
            .entry(snapshot.release_id)
            .or_default()
            .push(snapshot);
        Ok(())
    }

    async fn append_event(&self, event: ReleaseEvent) -> anyhow::Result<()> {
        self.state.lock().events.entry(event.release_id).or_default().push(event);
        Ok(())
    }

    async fn events_for_release(&self, release_id: ReleaseId) -> anyhow::Result<Vec<ReleaseEvent>> {
        Ok(self.state.lock().events.get(&release_id).cloned().unwrap_or_default())
    }

    async fn quarantine(&self, row: QuarantineRow) -> anyhow::Result<()> {
        self.state.lock().quarantine.push(row);
        Ok(())
    }

    async fn upsert_subscription(&self, sub: UserSubscription) -> anyhow::Result<()> {
        self.state.lock().subscriptions.insert(sub.subscription_id, sub);
        Ok(())
    }

    async fn subscriptions_matching_brand_or_sku(
        &self,
        brand: Option<&str>,
        sku: Option<&str>,
    ) -> anyhow::Result<Vec<UserSubscription>> {
        let state = self.state.lock();
        Ok(state
            .subscriptions
            .values()
            .filter(|s| {
                let brand_hit = brand.is_some_and(|b| s.brand_filter.contains(b));
                let sku_hit = sku.is_some_and(|sk| s.sku_filter.contains(sk));
                let scan_fallback = s.brand_filter.is_empty() && s.sku_filter.is_empty();
                brand_hit || sku_hit || scan_fallback
            })
            .cloned()
            .collect())
    }

    async fn all_subscriptions(&self) -> anyhow::Result<Vec<UserSubscription>> {
        Ok(self.state.lock().subscriptions.values().cloned().collect())
    }

    async fn update_health(&self, health: ScraperHealth) -> anyhow::Result<()> {
        self.state.lock().health.insert(health.target_id.clone(), health);
        Ok(())
    }

    async fn get_health(&self, target_id: &str) -> anyhow::Result<Option<ScraperHealth>> {
        Ok(self.state.lock().health.get(target_id).cloned())
    }

    async fn enqueue_task(&self, task: DeliveryTask) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.task_order.push_back(task.task_id);
        state.tasks.insert(task.task_id, task);
        Ok(())
    }

    async fn lease_task(
        &self,
        channel: ChannelKind,
        lease_duration: Duration,
    ) -> anyhow::Result<Option<DeliveryTask>> {
        let mut state = self.state.lock();
        let now = Utc::now();
        let candidate_id = state.task_order.iter().find(|id| {
            state
                .tasks
                .get(*id)
                .is_some_and(|t| t.channel.kind == channel && t.status == DeliveryStatus::Pending && t.next_attempt_at <= now)
        }).copied();

        let Some(task_id) = candidate_id else { return Ok(None) };
        state.task_order.retain(|id| *id != task_id);
        let task = state.tasks.get_mut(&task_id).expect("candidate just looked up");
        task.status = DeliveryStatus::InFlight;
        task.lease_expires_at = Some(now + chrono::Duration::from_std(lease_duration).unwrap_or_default());
        Ok(Some(task.clone()))
    }

    async fn complete_task(&self, task_id: TaskId, status: DeliveryStatus) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if let Some(task) = state.tasks.get_mut(&task_id) {
            task.status = status;
            task.lease_expires_at = None;
        }
        Ok(())
    }

    async fn release_task(&self, task: DeliveryTask) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.task_order.push_back(task.task_id);
        state.tasks.insert(task.task_id, task);
        Ok(())
    }

    async fn expire_leases(&self) -> anyhow::Result<usize> {
        let mut state = self.state.lock();
        let now = Utc::now();
        let expired: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|t| t.status == DeliveryStatus::InFlight && t.lease_expires_at.is_some_and(|exp| exp <= now))
            .map(|t| t.task_id)
            .collect();
        let count = expired.len();
        for id in expired {
            if let Some(task) = state.tasks.get_mut(&id) {
                task.status = DeliveryStatus::Pending;
                task.lease_expires_at = None;
                state.task_order.push_back(id);
            }
        }
        Ok(count)
    }

    async fn dead_letter(&self, row: DeadLetterRow) -> anyhow::Result<()> {
        self.state.lock().dead_letters.push(row);
        Ok(())
    }

    async fn increment_rate(&self, user_id: UserId, hour_bucket: i64) -> anyhow::Result<u32> {
        let mut state = self.state.lock();
        let counter = state.rate_counters.entry((user_id, hour_bucket)).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn get_rate(&self, user_id: UserId, hour_bucket: i64) -> anyhow::Result<u32> {
        Ok(self
            .state
            .lock()
            .rate_counters
            .get(&(user_id, hour_bucket))
            .copied()
            .unwrap_or(0))
    }

    async fn gc_rate_counters(&self, older_than_hours_ago: i64) -> anyhow::Result<usize> {
        let mut state = self.state.lock();
        let cutoff = bucket_of(Utc::now()) - older_than_hours_ago;
        let before = state.rate_counters.len();
        state.rate_counters.retain(|(_, bucket), _| *bucket >= cutoff);
        Ok(before - state.rate_counters.len())
    }
}
