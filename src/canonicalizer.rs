//! Canonicalizer (spec 4.3): folds one `RawRelease` into the stored
//! `CanonicalRelease` for its `release_id`.
//!
//! Row-scoped locking follows the teacher's `vault::pool::PooledVault`
//! shape — one `tokio::sync::Mutex` per logical resource, held across the
//! storage read-modify-write rather than a single global lock — generalized
//! here from one mutex per vault to one mutex per `release_id`, handed out
//! from a registry guarded by a short-lived `parking_lot::Mutex`. Contention
//! retry is the same bounded-exponential-backoff shape as
//! `route_quality::mitigation`'s failover retry loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::hashing::{self, CanonicalFields};
use crate::models::{
    CanonicalRelease, QuarantineReason, QuarantineRow, RawRelease, ReleaseId, Status,
};
use crate::storage::StorageGateway;

const MAX_CONTENTION_ATTEMPTS: u32 = 5;
const CONTENTION_BASE_DELAY: Duration = Duration::from_millis(20);
const CONTENTION_CAP: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum CanonicalizerError {
    #[error("storage contention on release {0} exhausted {MAX_CONTENTION_ATTEMPTS} attempts")]
    Contention(ReleaseId),
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Outcome of canonicalizing one raw release: the pre-image (prior stored
/// row, if any) and the post-image handed to the Change Detector. Both are
/// the same value when nothing changed.
pub struct CanonicalizeOutcome {
    pub pre: Option<CanonicalRelease>,
    pub post: CanonicalRelease,
}

fn parse_status(raw: Option<&str>) -> Status {
    match raw.map(|s| s.to_uppercase()) {
        Some(s) if s == "LIVE" => Status::Live,
        Some(s) if s == "UPCOMING" => Status::Upcoming,
        Some(s) if s == "RAFFLE_OPEN" => Status::RaffleOpen,
        Some(s) if s == "RAFFLE_CLOSED" => Status::RaffleClosed,
        Some(s) if s == "RESTOCK" => Status::Restock,
        Some(s) if s == "SOLD_OUT" => Status::SoldOut,
        Some(s) if s == "DELAYED" => Status::Delayed,
        _ => Status::Unknown,
    }
}

fn is_nike_or_jordan(brand: &Option<String>) -> bool {
    matches!(
        brand.as_deref().map(|b| b.to_lowercase()),
        Some(ref b) if b == "nike" || b == "jordan"
    )
}

/// Per-`release_id` lock registry, the generalization of
/// `PooledVault`'s one-mutex-per-vault pattern to one mutex per row.
#[derive(Default)]
pub struct RowLocks {
    locks: parking_lot::Mutex<HashMap<ReleaseId, Arc<AsyncMutex<()>>>>,
}

impl RowLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, id: ReleaseId) -> Arc<AsyncMutex<()>> {
        self.locks.lock().entry(id).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }
}

pub struct Canonicalizer {
    row_locks: RowLocks,
}

impl Canonicalizer {
    pub fn new() -> Self {
        Self { row_locks: RowLocks::new() }
    }

    /// Canonicalize `raw`, persisting through `storage`. Returns `Ok(None)`
    /// when the record was quarantined instead of written.
    pub async fn canonicalize(
        &self,
        raw: RawRelease,
        storage: &dyn StorageGateway,
    ) -> Result<Option<CanonicalizeOutcome>, CanonicalizerError> {
        if is_nike_or_jordan(&raw.brand) && raw.sku.as_deref().unwrap_or("").trim().is_empty() {
            let row = QuarantineRow {
                reason: QuarantineReason::MissingSkuNikeJordan,
                source: raw.source.clone(),
                raw_payload: serde_json::to_string(&raw).unwrap_or_default(),
                quarantined_at: Utc::now(),
            };
            storage.quarantine(row).await?;
            return Ok(None);
        }

        let release_id = hashing::release_id(raw.sku.as_deref(), &raw.title, &raw.source);
        let status = parse_status(raw.status_raw.as_deref());
        let fields = CanonicalFields {
            name: &raw.title,
            brand: raw.brand.as_deref(),
            status,
            price: raw.price,
            currency: raw.currency.as_deref(),
            stock_summary: raw.size_availability.as_ref(),
        };
        let payload_hash = hashing::content_hash(&fields);

        let lock = self.row_locks.lock_for(release_id);
        let mut delay = CONTENTION_BASE_DELAY;
        let mut last_err = None;

        for attempt in 0..MAX_CONTENTION_ATTEMPTS {
            let _guard = lock.lock().await;
            match self.try_write(release_id, payload_hash, status, &raw, storage).await {
                Ok(outcome) => return Ok(Some(outcome)),
                Err(e) => {
                    warn!(attempt, %release_id, error = %e, "canonicalizer contention, retrying");
                    last_err = Some(e);
                    drop(_guard);
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(CONTENTION_CAP);
                }
            }
        }

        let _ = last_err;
        Err(CanonicalizerError::Contention(release_id))
    }

    async fn try_write(
        &self,
        release_id: ReleaseId,
        payload_hash: crate::models::PayloadHash,
        status: Status,
        raw: &RawRelease,
        storage: &dyn StorageGateway,
    ) -> anyhow::Result<CanonicalizeOutcome> {
        let now = Utc::now();
        let pre = storage.get_canonical(release_id).await?;

        let post = match &pre {
            None => CanonicalRelease {
                release_id,
                sku: raw.sku.clone(),
                brand: raw.brand.clone(),
                name: raw.title.clone(),
                status,
                price: raw.price,
                currency: raw.currency.clone(),
                release_date: raw.release_date,
                region: None,
                source: raw.source.clone(),
                first_seen_at: now,
                updated_at: now,
                stock_summary: raw.size_availability.clone(),
                payload_hash,
            },
            Some(existing) if existing.payload_hash == payload_hash => CanonicalRelease {
                updated_at: now,
                ..existing.clone()
            },
            Some(existing) => CanonicalRelease {
                release_id,
                sku: raw.sku.clone().or_else(|| existing.sku.clone()),
                brand: raw.brand.clone().or_else(|| existing.brand.clone()),
                name: if raw.title.is_empty() { existing.name.clone() } else { raw.title.clone() },
                status,
                price: raw.price.or(existing.price),
                currency: raw.currency.clone().or_else(|| existing.currency.clone()),
                release_date: raw.release_date.or(existing.release_date),
                region: existing.region.clone(),
                source: raw.source.clone(),
                first_seen_at: existing.first_seen_at,
                updated_at: now,
                stock_summary: raw.size_availability.clone().or_else(|| existing.stock_summary.clone()),
                payload_hash,
            },
        };

        storage.upsert_canonical(post.clone()).await?;
        Ok(CanonicalizeOutcome { pre, post })
    }
}

impl Default for Canonicalizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Money;
    use crate::storage::MemoryStorage;

    fn raw(source: &str, sku: Option<&str>, brand: Option<&str>, title: &str) -> RawRelease {
        RawRelease {
            source: source.into(),
            source_id: "1".into(),
            title: title.into(),
            brand: brand.map(String::from),
            sku: sku.map(String::from),
            price: Some(Money::from_major(150.0)),
            currency: Some("USD".into()),
            release_date: None,
            status_raw: Some("UPCOMING".into()),
            url: None,
            image_url: None,
            size_availability: None,
        }
    }

    #[tokio::test]
    async fn nike_without_sku_is_quarantined() {
        let storage = MemoryStorage::new();
        let canon = Canonicalizer::new();
        let out = canon.canonicalize(raw("nike", None, Some("nike"), "AJ1"), &storage).await.unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn first_write_has_no_pre_image() {
        let storage = MemoryStorage::new();
        let canon = Canonicalizer::new();
        let out = canon
            .canonicalize(raw("footlocker", Some("ABC-1"), None, "Air Max"), &storage)
            .await
            .unwrap()
            .unwrap();
        assert!(out.pre.is_none());
        assert_eq!(out.post.status, Status::Upcoming);
    }

    #[tokio::test]
    async fn unchanged_payload_only_bumps_updated_at() {
        let storage = MemoryStorage::new();
        let canon = Canonicalizer::new();
        let r = raw("footlocker", Some("ABC-1"), None, "Air Max");
        let first = canon.canonicalize(r.clone(), &storage).await.unwrap().unwrap();
        let second = canon.canonicalize(r, &storage).await.unwrap().unwrap();
        assert_eq!(first.post.payload_hash, second.post.payload_hash);
        assert_eq!(second.pre.unwrap().release_id, second.post.release_id);
        assert!(second.post.updated_at >= first.post.updated_at);
    }

    #[tokio::test]
    async fn changed_price_preserves_first_seen_at() {
        let storage = MemoryStorage::new();
        let canon = Canonicalizer::new();
        let mut r = raw("footlocker", Some("ABC-1"), None, "Air Max");
        let first = canon.canonicalize(r.clone(), &storage).await.unwrap().unwrap();
        r.price = Some(Money::from_major(200.0));
        let second = canon.canonicalize(r, &storage).await.unwrap().unwrap();
        assert_eq!(second.post.first_seen_at, first.post.first_seen_at);
        assert_eq!(second.post.price, Some(Money::from_major(200.0)));
    }
}
