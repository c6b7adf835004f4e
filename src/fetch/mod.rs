//! Fetch Adapter (spec 4.1): retrieves one target, classifies the outcome,
//! and reports it to the health tracker. No persistence happens here.

mod client;

pub use client::HttpFetcher;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::models::Target;

/// Per-attempt context: which proxy/user-agent to use and the deadline the
/// fetch must respect.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    pub proxy: Option<String>,
    pub user_agent: String,
    pub deadline: Duration,
}

impl Default for AttemptContext {
    fn default() -> Self {
        Self {
            proxy: None,
            user_agent: "ingestord/0.1 (+release-tracker)".to_string(),
            deadline: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchOk {
    pub bytes: Vec<u8>,
    pub status_code: u16,
    pub fetched_at: DateTime<Utc>,
    pub latency_ms: i64,
}

/// Outcome of one fetch attempt. Mirrors spec 4.1's four-way split exactly;
/// classification happens once, at the point the HTTP response or error is
/// observed, so every downstream consumer works off this enum instead of
/// re-deriving the taxonomy from a status code.
#[derive(Debug, Clone)]
pub enum FetchResult {
    Ok(FetchOk),
    TransientError { reason: String },
    PermanentError { reason: String },
    RateLimited { retry_after: Option<Duration> },
}

impl FetchResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, FetchResult::Ok(_))
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, target: &Target, attempt: &AttemptContext) -> FetchResult;
}
