//! Delivery Workers (spec 4.10): one worker pool per channel kind, each
//! leasing tasks and handing them to a `DeliveryChannel` implementation.
//!
//! `DeliveryChannel` is an `async_trait` object the way the teacher treats
//! its scraper clients as trait objects behind `Box<dyn Fetcher>`-style
//! seams — a uniform interface the worker loop drives without caring which
//! transport backs it.

pub mod email;
pub mod push;
pub mod webhook;

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::models::{ChannelKind, DeadLetterReason, DeadLetterRow, DeliveryStatus, DeliveryTask};
use crate::storage::{hour_bucket, StorageGateway};

pub const LEASE_DURATION: Duration = Duration::from_secs(2 * 60);
const RETRY_BASE: Duration = Duration::from_secs(10);
const RETRY_CAP: Duration = Duration::from_secs(60 * 60);
const MAX_ATTEMPTS: u32 = 6;

#[derive(Debug)]
pub enum SendOutcome {
    Sent,
    RetryableFailure { retry_after: Option<Duration> },
    PermanentFailure,
}

pub use email::EmailSender;
pub use push::PushSender;
pub use webhook::WebhookSender;

#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;
    async fn send(&self, task: &DeliveryTask) -> SendOutcome;
}

fn backoff_for(attempts: u32) -> Duration {
    let scaled = RETRY_BASE.as_secs_f64() * 2f64.powi(attempts as i32);
    Duration::from_secs_f64(scaled.min(RETRY_CAP.as_secs_f64()))
}

/// Lease and process one task for `channel`, returning `false` if nothing
/// was ready.
pub async fn process_one(
    storage: &dyn StorageGateway,
    channel: &dyn DeliveryChannel,
) -> anyhow::Result<bool> {
    let Some(mut task) = storage.lease_task(channel.kind(), LEASE_DURATION).await? else {
        return Ok(false);
    };

    let outcome = channel.send(&task).await;
    task.attempts += 1;
    task.last_attempt_at = Some(Utc::now());

    match outcome {
        SendOutcome::Sent => {
            storage.complete_task(task.task_id, DeliveryStatus::Sent).await?;
            let bucket = hour_bucket(Utc::now());
            storage.increment_rate(task.user_id, bucket).await?;
            info!(task_id = %task.task_id, "delivery sent");
            metrics::increment_counter!("ingestord_delivery_sent_total");
        }
        SendOutcome::PermanentFailure => {
            dead_letter(storage, &task, DeadLetterReason::DeliveryPermanent).await?;
        }
        SendOutcome::RetryableFailure { retry_after } => {
            if task.attempts >= MAX_ATTEMPTS {
                dead_letter(storage, &task, DeadLetterReason::DeliveryExhausted).await?;
            } else {
                let backoff = backoff_for(task.attempts);
                let wait = retry_after.map(|r| r.max(backoff)).unwrap_or(backoff);
                task.next_attempt_at = Utc::now() + chrono::Duration::from_std(wait).unwrap_or_default();
                task.status = DeliveryStatus::Pending;
                warn!(task_id = %task.task_id, attempts = task.attempts, "delivery retry scheduled");
                storage.release_task(task).await?;
            }
        }
    }

    Ok(true)
}

async fn dead_letter(
    storage: &dyn StorageGateway,
    task: &DeliveryTask,
    reason: DeadLetterReason,
) -> anyhow::Result<()> {
    storage.complete_task(task.task_id, DeliveryStatus::DeadLettered).await?;
    metrics::increment_counter!("ingestord_delivery_dead_lettered_total");
    storage
        .dead_letter(DeadLetterRow {
            original_event_id: task.event_id,
            user_id: task.user_id,
            payload: task.payload.clone(),
            reason,
            recorded_at: Utc::now(),
        })
        .await
}

/// Drives `process_one` in a loop, sleeping briefly when idle. One call per
/// worker task; `worker_count` workers per channel give spec 5's "K
/// delivery workers per channel kind, independent pools".
pub async fn run_worker(
    storage: &dyn StorageGateway,
    channel: &dyn DeliveryChannel,
    idle_sleep: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            processed = process_one(storage, channel) => {
                match processed {
                    Ok(true) => continue,
                    Ok(false) => tokio::time::sleep(idle_sleep).await,
                    Err(e) => {
                        warn!(error = %e, "delivery worker error, backing off");
                        tokio::time::sleep(idle_sleep).await;
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Channel, WebhookPayload};
    use crate::storage::MemoryStorage;
    use uuid::Uuid;

    struct AlwaysFails;

    #[async_trait]
    impl DeliveryChannel for AlwaysFails {
        fn kind(&self) -> ChannelKind {
            ChannelKind::Discord
        }
        async fn send(&self, _task: &DeliveryTask) -> SendOutcome {
            SendOutcome::RetryableFailure { retry_after: None }
        }
    }

    fn sample_task() -> DeliveryTask {
        DeliveryTask {
            task_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            channel: Channel { kind: ChannelKind::Discord, address: "https://x".into() },
            status: DeliveryStatus::Pending,
            attempts: MAX_ATTEMPTS - 1,
            last_attempt_at: None,
            next_attempt_at: Utc::now(),
            payload: WebhookPayload {
                event_id: Uuid::new_v4(),
                release_id: crate::models::ReleaseId(1),
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
        }
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_instead_of_retrying_forever() {
        let storage = MemoryStorage::new();
        storage.enqueue_task(sample_task()).await.unwrap();
        let processed = process_one(&storage, &AlwaysFails).await.unwrap();
        assert!(processed);
    }

    #[tokio::test]
    async fn no_ready_task_returns_false() {
        let storage = MemoryStorage::new();
        let processed = process_one(&storage, &AlwaysFails).await.unwrap();
        assert!(!processed);
    }
}
