//! Change Detector (spec 4.4): a pure function over a pre/post canonical
//! image pair, run with no I/O of its own so it stays a CPU-bound pipeline
//! stage (spec 5's suspension-point rule) — same shape as the teacher's
//! `signals::detector::SignalDetector::detect`, which is likewise a pure
//! transform from market state to zero-or-one signal.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{CanonicalRelease, ReleaseEvent, Status};

/// Timestamps carried through one ingestion batch, used for `latency_ms`
/// instead of wall-clock-at-arbitrary-points.
#[derive(Debug, Clone, Copy)]
pub struct IngestionWindow {
    pub started: DateTime<Utc>,
    pub completed: DateTime<Utc>,
}

/// Implements spec 4.4's rules exactly. `pre` is the stored image before
/// this canonicalization; `post` is the image after.
pub fn detect(
    pre: Option<&CanonicalRelease>,
    post: &CanonicalRelease,
    window: IngestionWindow,
) -> Option<ReleaseEvent> {
    let detected_at = window.completed;
    let latency_ms = (detected_at - window.started).num_milliseconds();

    let (status_from, status_to, price_from, price_to) = match pre {
        None => {
            if post.status == Status::Unknown {
                return None;
            }
            (None, Some(post.status), None, None)
        }
        Some(pre) if pre.payload_hash == post.payload_hash => return None,
        Some(pre) => {
            let status_changed = pre.status != post.status;
            let price_changed = pre.price != post.price && (pre.price.is_some() || post.price.is_some());

            if !status_changed && !price_changed {
                return None;
            }

            if status_changed && price_changed {
                (Some(pre.status), Some(post.status), pre.price, post.price)
            } else if status_changed {
                (Some(pre.status), Some(post.status), None, None)
            } else {
                (Some(post.status), Some(post.status), pre.price, post.price)
            }
        }
    };

    Some(ReleaseEvent {
        event_id: Uuid::new_v4(),
        release_id: post.release_id,
        source: post.source.clone(),
        status_from,
        status_to,
        price_from,
        price_to,
        detected_at,
        ingestion_started: window.started,
        ingestion_completed: window.completed,
        latency_ms,
        aggregator_hits: 0,
        social_mentions: None,
        restock_likelihood: None,
        priority_score: 0.0,
    })
}
