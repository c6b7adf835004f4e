//! `rusqlite`-backed `StorageGateway`, grounded on the teacher's
//! `signals::db_storage::DbSignalStorage`: WAL mode, a `parking_lot`-guarded
//! connection, and JSON-blob columns for the nested domain types (matching
//! `details_json` there) rather than a fully normalized schema, since the
//! bottleneck the teacher's comments call out is row-level concurrency, not
//! column-level query shape.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::info;

use super::StorageGateway;
use crate::models::{
    CanonicalRelease, ChannelKind, DeadLetterRow, DeliveryStatus, DeliveryTask, QuarantineRow,
    ReleaseEvent, ReleaseId, ScraperHealth, StockSnapshot, TaskId, UserId, UserSubscription,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS canonical_releases (
    release_id TEXT PRIMARY KEY,
    json TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS stock_snapshots (
    release_id TEXT NOT NULL,
    observed_at INTEGER NOT NULL,
    json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_stock_snapshots_release
    ON stock_snapshots(release_id, observed_at DESC);

CREATE TABLE IF NOT EXISTS events (
    event_id TEXT PRIMARY KEY,
    release_id TEXT NOT NULL,
    detected_at INTEGER NOT NULL,
    json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_release ON events(release_id, detected_at);

CREATE TABLE IF NOT EXISTS quarantine (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    quarantined_at INTEGER NOT NULL,
    json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS subscriptions (
    subscription_id TEXT PRIMARY KEY,
    brand_filter TEXT NOT NULL,
    sku_filter TEXT NOT NULL,
    json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_subscriptions_brand ON subscriptions(brand_filter);
CREATE INDEX IF NOT EXISTS idx_subscriptions_sku ON subscriptions(sku_filter);

CREATE TABLE IF NOT EXISTS scraper_health (
    target_id TEXT PRIMARY KEY,
    json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS delivery_tasks (
    task_id TEXT PRIMARY KEY,
    channel TEXT NOT NULL,
    status TEXT NOT NULL,
    next_attempt_at INTEGER NOT NULL,
    seq INTEGER NOT NULL,
    json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_ready ON delivery_tasks(channel, status, next_attempt_at, seq);

CREATE TABLE IF NOT EXISTS dead_letters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    recorded_at INTEGER NOT NULL,
    json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rate_counters (
    user_id TEXT NOT NULL,
    hour_bucket INTEGER NOT NULL,
    count INTEGER NOT NULL,
    PRIMARY KEY (user_id, hour_bucket)
);
"#;

pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
    seq: Mutex<i64>,
}

impl SqliteStorage {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        info!(path, "storage gateway opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            seq: Mutex::new(0),
        })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            seq: Mutex::new(0),
        })
    }

    fn next_seq(&self) -> i64 {
        let mut seq = self.seq.lock();
        *seq += 1;
        *seq
    }
}

#[async_trait]
impl StorageGateway for SqliteStorage {
    async fn get_canonical(&self, release_id: ReleaseId) -> anyhow::Result<Option<CanonicalRelease>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT json FROM canonical_releases WHERE release_id = ?1")?;
        let row: Option<String> = stmt
            .query_row(params![release_id.to_string()], |r| r.get(0))
            .ok();
        Ok(row.and_then(|j| serde_json::from_str(&j).ok()))
    }

    async fn upsert_canonical(&self, release: CanonicalRelease) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        let json = serde_json::to_string(&release)?;
        conn.execute(
            "INSERT INTO canonical_releases (release_id, json, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(release_id) DO UPDATE SET json = excluded.json, updated_at = excluded.updated_at",
            params![release.release_id.to_string(), json, release.updated_at.timestamp()],
        )?;
        Ok(())
    }

    async fn latest_stock_snapshot(&self, release_id: ReleaseId) -> anyhow::Result<Option<StockSnapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT json FROM stock_snapshots WHERE release_id = ?1 ORDER BY observed_at DESC LIMIT 1",
        )?;
        let row: Option<String> = stmt
            .query_row(params![release_id.to_string()], |r| r.get(0))
            .ok();
        Ok(row.and_then(|j| serde_json::from_str(&j).ok()))
    }

    async fn append_stock_snapshot(&self, snapshot: StockSnapshot) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        let json = serde_json::to_string(&snapshot)?;
        conn.execute(
            "INSERT INTO stock_snapshots (release_id, observed_at, json) VALUES (?1, ?2, ?3)",
            params![snapshot.release_id.to_string(), snapshot.observed_at.timestamp(), json],
        )?;
        Ok(())
    }

    async fn append_event(&self, event: ReleaseEvent) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        let json = serde_json::to_string(&event)?;
        conn.execute(
            "INSERT INTO events (event_id, release_id, detected_at, json) VALUES (?1, ?2, ?3, ?4)",
            params![
                event.event_id.to_string(),
                event.release_id.to_string(),
                event.detected_at.timestamp_millis(),
                json
            ],
        )?;
        Ok(())
    }

    async fn events_for_release(&self, release_id: ReleaseId) -> anyhow::Result<Vec<ReleaseEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT json FROM events WHERE release_id = ?1 ORDER BY detected_at ASC",
        )?;
        let rows = stmt.query_map(params![release_id.to_string()], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    async fn quarantine(&self, row: QuarantineRow) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        let json = serde_json::to_string(&row)?;
        conn.execute(
            "INSERT INTO quarantine (quarantined_at, json) VALUES (?1, ?2)",
            params![row.quarantined_at.timestamp(), json],
        )?;
        Ok(())
    }

    async fn upsert_subscription(&self, sub: UserSubscription) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        let json = serde_json::to_string(&sub)?;
        let brand_filter = sub.brand_filter.iter().cloned().collect::<Vec<_>>().join(",");
        let sku_filter = sub.sku_filter.iter().cloned().collect::<Vec<_>>().join(",");
        conn.execute(
            "INSERT INTO subscriptions (subscription_id, brand_filter, sku_filter, json) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(subscription_id) DO UPDATE SET brand_filter = excluded.brand_filter, sku_filter = excluded.sku_filter, json = excluded.json",
            params![sub.subscription_id.to_string(), brand_filter, sku_filter, json],
        )?;
        Ok(())
    }

    async fn subscriptions_matching_brand_or_sku(
        &self,
        brand: Option<&str>,
        sku: Option<&str>,
    ) -> anyhow::Result<Vec<UserSubscription>> {
        // Inverted-index style lookup (spec 4.7): filter using the
        // brand_filter/sku_filter columns, then defer the precise
        // empty-filter/full-scan semantics to the in-process matcher.
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT json, brand_filter, sku_filter FROM subscriptions")?;
        let rows = stmt.query_map([], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (json, brand_filter, sku_filter) = row?;
            let brand_hit = brand.is_some_and(|b| brand_filter.split(',').any(|x| x == b));
            let sku_hit = sku.is_some_and(|sk| sku_filter.split(',').any(|x| x == sk));
            let scan_fallback = brand_filter.is_empty() && sku_filter.is_empty();
            if brand_hit || sku_hit || scan_fallback {
                out.push(serde_json::from_str(&json)?);
            }
        }
        Ok(out)
    }

    async fn all_subscriptions(&self) -> anyhow::Result<Vec<UserSubscription>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT json FROM subscriptions")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    async fn update_health(&self, health: ScraperHealth) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        let json = serde_json::to_string(&health)?;
        conn.execute(
            "INSERT INTO scraper_health (target_id, json) VALUES (?1, ?2)
             ON CONFLICT(target_id) DO UPDATE SET json = excluded.json",
            params![health.target_id, json],
        )?;
        Ok(())
    }

    async fn get_health(&self, target_id: &str) -> anyhow::Result<Option<ScraperHealth>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT json FROM scraper_health WHERE target_id = ?1")?;
        let row: Option<String> = stmt.query_row(params![target_id], |r| r.get(0)).ok();
        Ok(row.and_then(|j| serde_json::from_str(&j).ok()))
    }

    async fn enqueue_task(&self, task: DeliveryTask) -> anyhow::Result<()> {
        let seq = self.next_seq();
        let conn = self.conn.lock();
        let json = serde_json::to_string(&task)?;
        let channel = format!("{:?}", task.channel.kind);
        let status = format!("{:?}", task.status);
        conn.execute(
            "INSERT INTO delivery_tasks (task_id, channel, status, next_attempt_at, seq, json) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![task.task_id.to_string(), channel, status, task.next_attempt_at.timestamp(), seq, json],
        )?;
        Ok(())
    }

    async fn lease_task(
        &self,
        channel: ChannelKind,
        lease_duration: Duration,
    ) -> anyhow::Result<Option<DeliveryTask>> {
        let conn = self.conn.lock();
        let channel_str = format!("{:?}", channel);
        let now = Utc::now();
        let mut stmt = conn.prepare(
            "SELECT task_id, json FROM delivery_tasks
             WHERE channel = ?1 AND status = 'Pending' AND next_attempt_at <= ?2
             ORDER BY seq ASC LIMIT 1",
        )?;
        let row: Option<(String, String)> = stmt
            .query_row(params![channel_str, now.timestamp()], |r| Ok((r.get(0)?, r.get(1)?)))
            .ok();
        let Some((task_id, json)) = row else { return Ok(None) };
        let mut task: DeliveryTask = serde_json::from_str(&json)?;
        task.status = DeliveryStatus::InFlight;
        task.lease_expires_at = Some(now + chrono::Duration::from_std(lease_duration).unwrap_or_default());
        let updated = serde_json::to_string(&task)?;
        conn.execute(
            "UPDATE delivery_tasks SET status = 'InFlight', json = ?2 WHERE task_id = ?1",
            params![task_id, updated],
        )?;
        Ok(Some(task))
    }

    async fn complete_task(&self, task_id: TaskId, status: DeliveryStatus) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        let status_str = format!("{:?}", status);
        conn.execute(
            "UPDATE delivery_tasks SET status = ?2 WHERE task_id = ?1",
            params![task_id.to_string(), status_str],
        )?;
        Ok(())
    }

    async fn release_task(&self, task: DeliveryTask) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        let json = serde_json::to_string(&task)?;
        conn.execute(
            "UPDATE delivery_tasks SET status = 'Pending', next_attempt_at = ?2, json = ?3 WHERE task_id = ?1",
            params![task.task_id.to_string(), task.next_attempt_at.timestamp(), json],
        )?;
        Ok(())
    }

    async fn expire_leases(&self) -> anyhow::Result<usize> {
        let conn = self.conn.lock();
        let now = Utc::now().timestamp();
        let mut stmt = conn.prepare("SELECT task_id, json FROM delivery_tasks WHERE status = 'InFlight'")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
        let mut expired = Vec::new();
        for row in rows {
            let (task_id, json) = row?;
            let task: DeliveryTask = serde_json::from_str(&json)?;
            if task.lease_expires_at.is_some_and(|e| e.timestamp() <= now) {
                expired.push((task_id, task));
            }
        }
        let count = expired.len();
        for (task_id, mut task) in expired {
            task.status = DeliveryStatus::Pending;
            task.lease_expires_at = None;
            let json = serde_json::to_string(&task)?;
            conn.execute(
                "UPDATE delivery_tasks SET status = 'Pending', json = ?2 WHERE task_id = ?1",
                params![task_id, json],
            )?;
        }
        Ok(count)
    }

    async fn dead_letter(&self, row: DeadLetterRow) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        let json = serde_json::to_string(&row)?;
        conn.execute(
            "INSERT INTO dead_letters (recorded_at, json) VALUES (?1, ?2)",
            params![row.recorded_at.timestamp(), json],
        )?;
        Ok(())
    }

    async fn increment_rate(&self, user_id: UserId, hour_bucket: i64) -> anyhow::Result<u32> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO rate_counters (user_id, hour_bucket, count) VALUES (?1, ?2, 1)
             ON CONFLICT(user_id, hour_bucket) DO UPDATE SET count = count + 1",
            params![user_id.to_string(), hour_bucket],
        )?;
        let count: u32 = conn.query_row(
            "SELECT count FROM rate_counters WHERE user_id = ?1 AND hour_bucket = ?2",
            params![user_id.to_string(), hour_bucket],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    async fn get_rate(&self, user_id: UserId, hour_bucket: i64) -> anyhow::Result<u32> {
        let conn = self.conn.lock();
        let count: Option<u32> = conn
            .query_row(
                "SELECT count FROM rate_counters WHERE user_id = ?1 AND hour_bucket = ?2",
                params![user_id.to_string(), hour_bucket],
                |r| r.get(0),
            )
            .ok();
        Ok(count.unwrap_or(0))
    }

    async fn gc_rate_counters(&self, older_than_hours_ago: i64) -> anyhow::Result<usize> {
        let conn = self.conn.lock();
        let cutoff = super::hour_bucket(Utc::now()) - older_than_hours_ago;
        let affected = conn.execute("DELETE FROM rate_counters WHERE hour_bucket < ?1", params![cutoff])?;
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_canonical_release_through_json_column() {
        use crate::models::{Money, PayloadHash, Status};

        let storage = SqliteStorage::open_in_memory().unwrap();
        let now = Utc::now();
        let release = CanonicalRelease {
            release_id: ReleaseId(42),
            sku: Some("ABC-123".into()),
            brand: Some("Jordan".into()),
            name: "AJ1 Bred".into(),
            status: Status::Upcoming,
            price: Some(Money::from_major(180.0)),
            currency: Some("USD".into()),
            release_date: None,
            region: None,
            source: "nike".into(),
            first_seen_at: now,
            updated_at: now,
            stock_summary: None,
            payload_hash: PayloadHash(7),
        };
        storage.upsert_canonical(release.clone()).await.unwrap();
        let loaded = storage.get_canonical(ReleaseId(42)).await.unwrap().unwrap();
        assert_eq!(loaded.sku, release.sku);
        assert_eq!(loaded.name, release.name);
    }

    #[tokio::test]
    async fn expired_lease_rewrites_json_blob_alongside_status_column() {
        use crate::models::{Channel, ChannelKind, DeliveryStatus, WebhookPayload};
        use std::time::Duration as StdDuration;
        use uuid::Uuid;

        let storage = SqliteStorage::open_in_memory().unwrap();
        let task_id = Uuid::new_v4();
        let task = DeliveryTask {
            task_id,
            user_id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            channel: Channel { kind: ChannelKind::Discord, address: "https://x".into() },
            status: DeliveryStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            next_attempt_at: Utc::now(),
            payload: WebhookPayload {
                event_id: Uuid::new_v4(),
                release_id: ReleaseId(1),
                name: "AJ1".into(),
                brand: None,
                status_from: None,
                status_to: None,
                price_from: None,
                price_to: None,
                url: None,
                region: None,
                priority_score: 0.5,
                detected_at: Utc::now(),
            },
            lease_expires_at: None,
        };
        storage.enqueue_task(task).await.unwrap();

        let leased = storage.lease_task(ChannelKind::Discord, StdDuration::from_millis(1)).await.unwrap();
        assert!(leased.is_some());
        tokio::time::sleep(StdDuration::from_millis(20)).await;

        let reclaimed = storage.expire_leases().await.unwrap();
        assert_eq!(reclaimed, 1);

        let json: String = storage
            .conn
            .lock()
            .query_row("SELECT json FROM delivery_tasks WHERE task_id = ?1", params![task_id.to_string()], |r| r.get(0))
            .unwrap();
        let reloaded: DeliveryTask = serde_json::from_str(&json).unwrap();
        assert_eq!(reloaded.status, DeliveryStatus::Pending, "json blob must agree with the SQL status column");
        assert!(reloaded.lease_expires_at.is_none(), "json blob must clear the stale lease expiry");
    }
}
