//! `reqwest`-backed `Fetcher`, grounded on the teacher's
//! `scrapers::dome_rest::DomeRestClient` connection-pool setup.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{AttemptContext, FetchOk, FetchResult, Fetcher};
use crate::models::Target;

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build fetch client: {e}"))?;
        Ok(Self { client })
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new().expect("default reqwest client configuration is valid")
    }
}

fn retry_after_from_headers(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, target: &Target, attempt: &AttemptContext) -> FetchResult {
        let mut builder = self
            .client
            .get(&target.url_template)
            .header(reqwest::header::USER_AGENT, attempt.user_agent.clone())
            .timeout(attempt.deadline);

        if let Some(proxy_url) = &attempt.proxy {
            match reqwest::Proxy::all(proxy_url) {
                Ok(proxy) => {
                    // per-request client would be wasteful to rebuild each call,
                    // but the teacher's scraper clients are similarly rebuilt
                    // lazily when a proxy override is required.
                    if let Ok(proxied) = Client::builder().proxy(proxy).build() {
                        builder = proxied
                            .get(&target.url_template)
                            .header(reqwest::header::USER_AGENT, attempt.user_agent.clone())
                            .timeout(attempt.deadline);
                    }
                }
                Err(e) => {
                    warn!(target = target.target_id, error = %e, "invalid proxy url");
                    return FetchResult::TransientError {
                        reason: format!("proxy_error: {e}"),
                    };
                }
            }
        }

        let start = Instant::now();
        let result = builder.send().await;
        let latency_ms = start.elapsed().as_millis() as i64;

        match result {
            Ok(resp) => {
                let status = resp.status();
                if status.as_u16() == 429 {
                    let retry_after = retry_after_from_headers(&resp);
                    return FetchResult::RateLimited { retry_after };
                }
                if status.is_server_error() {
                    return FetchResult::TransientError {
                        reason: format!("http_{}", status.as_u16()),
                    };
                }
                if status.is_client_error() {
                    return FetchResult::PermanentError {
                        reason: format!("http_{}", status.as_u16()),
                    };
                }
                match resp.bytes().await {
                    Ok(bytes) => {
                        debug!(target = target.target_id, latency_ms, "fetch ok");
                        FetchResult::Ok(FetchOk {
                            bytes: bytes.to_vec(),
                            status_code: status.as_u16(),
                            fetched_at: Utc::now(),
                            latency_ms,
                        })
                    }
                    Err(e) => FetchResult::TransientError {
                        reason: format!("body_read_error: {e}"),
                    },
                }
            }
            Err(e) => {
                if e.is_timeout() {
                    FetchResult::TransientError {
                        reason: "timeout".to_string(),
                    }
                } else if e.is_connect() {
                    FetchResult::TransientError {
                        reason: format!("connect_error: {e}"),
                    }
                } else if e.is_request() && e.to_string().contains("dns") {
                    FetchResult::PermanentError {
                        reason: "dns_nxdomain".to_string(),
                    }
                } else {
                    FetchResult::TransientError {
                        reason: format!("network_error: {e}"),
                    }
                }
            }
        }
    }
}
