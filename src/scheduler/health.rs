//! Scraper Health Tracker (spec 4.6): per-target failure counting and
//! circuit breaker transitions, with a write-coalescing flush to the
//! storage gateway.
//!
//! The breaker transition logic is the same shape as the teacher's
//! `binance_session::EndpointRotator::record_failure`/`record_success`
//! circuit-breaking pair, generalized from per-endpoint websocket failover
//! to per-target fetch breakers. The jitter PRNG is lifted verbatim from
//! `binance_session::BackoffCalculator::next_random` (xorshift64) rather
//! than pulling in `rand`, since this crate has no other use for a RNG
//! crate.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::models::{BreakerState, ScraperHealth};
use crate::storage::StorageGateway;

pub const CB_THRESHOLD: u32 = 3;
pub const CB_COOLDOWN: Duration = Duration::from_secs(15 * 60);

struct Xorshift64(u64);

impl Xorshift64 {
    fn seeded() -> Self {
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x9E3779B97F4A7C15);
        Self(seed | 1)
    }

    fn next_f64(&mut self) -> f64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        (self.0 as f64) / (u64::MAX as f64)
    }
}

/// `base * 2^attempt`, capped, plus `±20%` jitter, per spec 4.5's
/// `next_due_at` success path.
pub fn jitter(base_seconds: u64, pct: f64, rng: &mut Xorshift64) -> Duration {
    let spread = (base_seconds as f64) * pct;
    let offset = (rng.next_f64() * 2.0 - 1.0) * spread;
    let secs = (base_seconds as f64 + offset).max(1.0);
    Duration::from_secs_f64(secs)
}

/// `base * 2^consecutive_failures`, capped, per spec 4.5's transient-error
/// backoff.
pub fn exponential_backoff(consecutive_failures: u32, base: Duration, cap: Duration) -> Duration {
    let scaled = base.as_secs_f64() * 2f64.powi(consecutive_failures as i32);
    Duration::from_secs_f64(scaled.min(cap.as_secs_f64()))
}

pub struct HealthTracker {
    rows: Mutex<HashMap<String, ScraperHealth>>,
    rng: Mutex<Xorshift64>,
    dirty_since: Mutex<Option<DateTime<Utc>>>,
    cb_threshold: u32,
    cb_cooldown: Duration,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::with_thresholds(CB_THRESHOLD, CB_COOLDOWN)
    }

    pub fn with_thresholds(cb_threshold: u32, cb_cooldown: Duration) -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            rng: Mutex::new(Xorshift64::seeded()),
            dirty_since: Mutex::new(None),
            cb_threshold,
            cb_cooldown,
        }
    }

    pub fn snapshot(&self, target_id: &str) -> ScraperHealth {
        self.rows
            .lock()
            .entry(target_id.to_string())
            .or_insert_with(|| ScraperHealth::new(target_id, "default"))
            .clone()
    }

    fn mark_dirty(&self) {
        let mut dirty = self.dirty_since.lock();
        if dirty.is_none() {
            *dirty = Some(Utc::now());
        }
    }

    pub fn record_success(&self, target_id: &str, proxy_pool: &str) {
        let mut rows = self.rows.lock();
        let row = rows
            .entry(target_id.to_string())
            .or_insert_with(|| ScraperHealth::new(target_id, proxy_pool));
        row.consecutive_failures = 0;
        row.last_success_at = Some(Utc::now());
        if row.breaker_state == BreakerState::HalfOpen {
            row.breaker_state = BreakerState::Closed;
            row.breaker_opened_at = None;
            info!(target_id, "breaker closed after successful probe");
        }
        drop(rows);
        self.mark_dirty();
        metrics::increment_counter!("ingestord_fetch_success_total");
    }

    pub fn record_failure(&self, target_id: &str, proxy_pool: &str) {
        let mut rows = self.rows.lock();
        let row = rows
            .entry(target_id.to_string())
            .or_insert_with(|| ScraperHealth::new(target_id, proxy_pool));
        row.consecutive_failures += 1;

        match row.breaker_state {
            BreakerState::Closed if row.consecutive_failures >= self.cb_threshold => {
                row.breaker_state = BreakerState::Open;
                row.breaker_opened_at = Some(Utc::now());
                warn!(target_id, failures = row.consecutive_failures, "breaker opened");
            }
            BreakerState::HalfOpen => {
                row.breaker_state = BreakerState::Open;
                row.breaker_opened_at = Some(Utc::now());
                warn!(target_id, "probe failed, breaker re-opened");
            }
            _ => {}
        }
        drop(rows);
        self.mark_dirty();
        metrics::increment_counter!("ingestord_fetch_failure_total");
    }

    /// Must be called before dispatch to decide readiness; transitions
    /// `OPEN -> HALF_OPEN` once the cooldown elapses.
    pub fn poll_transitions(&self, target_id: &str) -> BreakerState {
        let mut rows = self.rows.lock();
        let Some(row) = rows.get_mut(target_id) else { return BreakerState::Closed };
        if row.breaker_state == BreakerState::Open {
            if let Some(opened_at) = row.breaker_opened_at {
                let elapsed = Utc::now() - opened_at;
                if elapsed.to_std().unwrap_or(Duration::ZERO) >= self.cb_cooldown {
                    row.breaker_state = BreakerState::HalfOpen;
                    info!(target_id, "breaker half-open, admitting probe");
                }
            }
        }
        row.breaker_state
    }

    pub fn next_jitter(&self, base_seconds: u64) -> Duration {
        jitter(base_seconds, 0.20, &mut self.rng.lock())
    }

    /// Flush all rows if at least 5 seconds have elapsed since the first
    /// un-flushed mutation, per spec 4.6's write-coalescing interval.
    /// Grounded on `route_quality::metrics`'s periodic export task.
    pub async fn flush_if_due(&self, storage: &dyn StorageGateway, interval: Duration) -> anyhow::Result<bool> {
        let due = {
            let dirty = self.dirty_since.lock();
            matches!(*dirty, Some(since) if (Utc::now() - since).to_std().unwrap_or(Duration::ZERO) >= interval)
        };
        if !due {
            return Ok(false);
        }
        let rows: Vec<ScraperHealth> = self.rows.lock().values().cloned().collect();
        for row in rows {
            storage.update_health(row).await?;
        }
        *self.dirty_since.lock() = None;
        Ok(true)
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn breaker_opens_after_threshold_failures() {
        let tracker = HealthTracker::new();
        for _ in 0..CB_THRESHOLD {
            tracker.record_failure("t1", "default");
        }
        assert_eq!(tracker.snapshot("t1").breaker_state, BreakerState::Open);
    }

    #[test]
    fn success_resets_failure_count() {
        let tracker = HealthTracker::new();
        tracker.record_failure("t1", "default");
        tracker.record_success("t1", "default");
        assert_eq!(tracker.snapshot("t1").consecutive_failures, 0);
    }

    #[test]
    fn half_open_failure_reopens_without_recounting() {
        let tracker = HealthTracker::new();
        for _ in 0..CB_THRESHOLD {
            tracker.record_failure("t1", "default");
        }
        {
            let mut rows = tracker.rows.lock();
            let row = rows.get_mut("t1").unwrap();
            row.breaker_state = BreakerState::HalfOpen;
        }
        tracker.record_failure("t1", "default");
        assert_eq!(tracker.snapshot("t1").breaker_state, BreakerState::Open);
    }

    #[tokio::test]
    async fn flush_is_coalesced_until_interval_elapses() {
        let tracker = HealthTracker::new();
        let storage = MemoryStorage::new();
        tracker.record_failure("t1", "default");
        let flushed = tracker.flush_if_due(&storage, Duration::from_secs(5)).await.unwrap();
        assert!(!flushed, "interval has not elapsed yet");
        let flushed = tracker.flush_if_due(&storage, Duration::ZERO).await.unwrap();
        assert!(flushed);
    }
}
