//! Scheduler (spec 4.5): owns readiness decisions for every target and
//! dispatches work onto a bounded channel consumed by a worker pool.
//!
//! The decision loop itself never awaits while holding the target-state
//! lock — candidates are selected and cloned out under the lock, then
//! dispatched after it is released — matching the teacher's
//! `route_quality::prober::RouteQualityProber::run` shape of a
//! `tokio::time::interval` loop driving bounded `mpsc` handoff to workers.
//! Per-pool selection uses a `BinaryHeap` ordered by `(priority_score,
//! Reverse(next_due_at))` as called for by spec 4.5's dispatch policy.

pub mod health;

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::models::{BreakerState, Target};
use health::HealthTracker;

const TRANSIENT_BACKOFF_BASE: Duration = Duration::from_secs(60);
const TRANSIENT_BACKOFF_CAP: Duration = Duration::from_secs(30 * 60);
const PERMANENT_QUARANTINE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Success,
    Transient,
    RateLimited { retry_after: Option<Duration> },
    Permanent { reason: String },
}

/// Implemented by the pipeline wiring (Fetch -> Parse -> Canonicalize) that
/// actually executes a dispatched target. Kept as a trait so the scheduler
/// has no direct dependency on the fetch/parser/canonicalizer modules.
#[async_trait]
pub trait TargetRunner: Send + Sync {
    async fn run(&self, target: &Target) -> DispatchOutcome;
}

struct TargetEntry {
    target: Target,
    next_due_at: DateTime<Utc>,
    consecutive_failures: u32,
}

struct Candidate {
    target_id: String,
    priority_score: f64,
    next_due_at: DateTime<Utc>,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.priority_score == other.priority_score && self.next_due_at == other.next_due_at
    }
}
impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority_score wins; ties broken by older (smaller)
        // next_due_at, per spec 4.5.
        self.priority_score
            .partial_cmp(&other.priority_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.next_due_at.cmp(&self.next_due_at))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct Scheduler {
    targets: Mutex<HashMap<String, TargetEntry>>,
    in_flight: Mutex<HashMap<String, usize>>,
    half_open_probing: Mutex<HashMap<String, bool>>,
    pub health: Arc<HealthTracker>,
    max_parallel_per_pool: usize,
}

impl Scheduler {
    pub fn new(health: Arc<HealthTracker>, max_parallel_per_pool: usize) -> Self {
        Self {
            targets: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            half_open_probing: Mutex::new(HashMap::new()),
            health,
            max_parallel_per_pool,
        }
    }

    pub fn register_target(&self, target: Target) {
        let mut targets = self.targets.lock();
        targets.entry(target.target_id.clone()).or_insert_with(|| TargetEntry {
            next_due_at: Utc::now(),
            consecutive_failures: 0,
            target,
        });
    }

    /// One decision-loop tick: select and claim up to `max_parallel_per_pool`
    /// ready targets per pool, returning their owned `Target`s for dispatch.
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<Target> {
        let targets = self.targets.lock();
        let mut by_pool: HashMap<String, BinaryHeap<Candidate>> = HashMap::new();

        for entry in targets.values() {
            if entry.next_due_at > now {
                continue;
            }
            let breaker = self.health.poll_transitions(&entry.target.target_id);
            if breaker == BreakerState::Open {
                continue;
            }
            if breaker == BreakerState::HalfOpen {
                let mut probing = self.half_open_probing.lock();
                if *probing.get(&entry.target.target_id).unwrap_or(&false) {
                    continue;
                }
                probing.insert(entry.target.target_id.clone(), true);
            }
            by_pool
                .entry(entry.target.proxy_pool().to_string())
                .or_default()
                .push(Candidate {
                    target_id: entry.target.target_id.clone(),
                    priority_score: entry.target.priority_score,
                    next_due_at: entry.next_due_at,
                });
        }

        let mut dispatched = Vec::new();
        for (pool, mut heap) in by_pool {
            let mut in_flight = self.in_flight.lock();
            let current = *in_flight.get(&pool).unwrap_or(&0);
            let slots = self.max_parallel_per_pool.saturating_sub(current);
            for _ in 0..slots {
                let Some(candidate) = heap.pop() else { break };
                if let Some(entry) = targets.get(&candidate.target_id) {
                    dispatched.push(entry.target.clone());
                    *in_flight.entry(pool.clone()).or_insert(0) += 1;
                }
            }
        }
        dispatched
    }

    /// Apply the outcome of a dispatched target, per spec 4.5's per-outcome
    /// `next_due_at` update rules.
    pub fn report_outcome(&self, target_id: &str, outcome: DispatchOutcome, now: DateTime<Utc>) {
        let mut targets = self.targets.lock();
        let Some(entry) = targets.get_mut(target_id) else { return };
        let pool = entry.target.proxy_pool().to_string();
        self.half_open_probing.lock().remove(target_id);

        match &outcome {
            DispatchOutcome::Success => {
                self.health.record_success(target_id, &pool);
                entry.consecutive_failures = 0;
                entry.next_due_at = now + chrono::Duration::from_std(
                    self.health.next_jitter(entry.target.expected_cadence_seconds),
                ).unwrap_or_default();
            }
            DispatchOutcome::Transient => {
                self.health.record_failure(target_id, &pool);
                entry.consecutive_failures += 1;
                let backoff = health::exponential_backoff(
                    entry.consecutive_failures,
                    TRANSIENT_BACKOFF_BASE,
                    TRANSIENT_BACKOFF_CAP,
                );
                entry.next_due_at = now + chrono::Duration::from_std(backoff).unwrap_or_default();
            }
            DispatchOutcome::RateLimited { retry_after } => {
                self.health.record_failure(target_id, &pool);
                entry.consecutive_failures += 1;
                let backoff = health::exponential_backoff(
                    entry.consecutive_failures,
                    TRANSIENT_BACKOFF_BASE,
                    TRANSIENT_BACKOFF_CAP,
                );
                let effective = retry_after.map(|r| r.max(backoff)).unwrap_or(backoff);
                entry.next_due_at = now + chrono::Duration::from_std(effective).unwrap_or_default();
            }
            DispatchOutcome::Permanent { reason } => {
                warn!(target_id, reason, "target quarantined after permanent error");
                entry.next_due_at = now + chrono::Duration::from_std(PERMANENT_QUARANTINE).unwrap_or_default();
            }
        }

        let mut in_flight = self.in_flight.lock();
        if let Some(count) = in_flight.get_mut(&pool) {
            *count = count.saturating_sub(1);
        }
    }

    /// Runs the decision loop until `shutdown` resolves. Dispatch goes over
    /// a bounded `mpsc` channel sized to `max_parallel_per_pool * pool
    /// count` so a burst of ready targets backpressures instead of
    /// unbounded-spawning, consumed by `worker_count` long-lived workers
    /// pulling from the same receiver.
    pub async fn run(
        self: Arc<Self>,
        runner: Arc<dyn TargetRunner>,
        tick_interval: Duration,
        worker_count: usize,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let (tx, rx) = mpsc::channel::<Target>(worker_count * 4);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = Vec::new();
        for _ in 0..worker_count {
            let rx = rx.clone();
            let runner = runner.clone();
            let scheduler = self.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let target = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(target) = target else { break };
                    let outcome = runner.run(&target).await;
                    scheduler.report_outcome(&target.target_id, outcome, Utc::now());
                }
            }));
        }

        let mut ticker = tokio::time::interval(tick_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for target in self.tick(Utc::now()) {
                        if tx.send(target).await.is_err() {
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler shutting down, draining in-flight dispatch");
                        break;
                    }
                }
            }
        }
        drop(tx);
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TargetKind;

    fn target(id: &str, priority: f64) -> Target {
        Target {
            target_id: id.into(),
            kind: TargetKind::JsonCatalog,
            url_template: "https://example.com".into(),
            parser_key: "json-catalog".into(),
            source: "nike".into(),
            expected_cadence_seconds: 60,
            proxy_pool_id: None,
            priority_score: priority,
        }
    }

    #[test]
    fn higher_priority_dispatched_first_when_pool_is_constrained() {
        let health = Arc::new(HealthTracker::new());
        let scheduler = Scheduler::new(health, 1);
        scheduler.register_target(target("low", 0.1));
        scheduler.register_target(target("high", 0.9));
        let dispatched = scheduler.tick(Utc::now());
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].target_id, "high");
    }

    #[test]
    fn open_breaker_excludes_target_from_dispatch() {
        let health = Arc::new(HealthTracker::new());
        let scheduler = Scheduler::new(health.clone(), 4);
        scheduler.register_target(target("t1", 0.5));
        for _ in 0..health::CB_THRESHOLD {
            health.record_failure("t1", "default");
        }
        let dispatched = scheduler.tick(Utc::now());
        assert!(dispatched.is_empty());
    }

    #[test]
    fn success_outcome_advances_next_due_at_forward() {
        let health = Arc::new(HealthTracker::new());
        let scheduler = Scheduler::new(health, 4);
        scheduler.register_target(target("t1", 0.5));
        let now = Utc::now();
        scheduler.tick(now);
        scheduler.report_outcome("t1", DispatchOutcome::Success, now);
        let targets = scheduler.targets.lock();
        assert!(targets.get("t1").unwrap().next_due_at > now);
    }

    #[test]
    fn permanent_error_quarantines_for_one_hour() {
        let health = Arc::new(HealthTracker::new());
        let scheduler = Scheduler::new(health, 4);
        scheduler.register_target(target("t1", 0.5));
        let now = Utc::now();
        scheduler.report_outcome("t1", DispatchOutcome::Permanent { reason: "404".into() }, now);
        let targets = scheduler.targets.lock();
        let due = targets.get("t1").unwrap().next_due_at;
        assert!(due >= now + chrono::Duration::minutes(59));
    }
}
