//! Webhook channel (Discord/Slack/custom): POSTs the task payload as JSON.
//! Success on 2xx; retry on 5xx/429, honoring `Retry-After` the way
//! `middleware::rate_limit` computes and surfaces a retry-after duration.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use super::{DeliveryChannel, SendOutcome};
use crate::models::{ChannelKind, DeliveryTask};

pub struct WebhookSender {
    client: Client,
    kind: ChannelKind,
}

impl WebhookSender {
    pub fn new(kind: ChannelKind) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build webhook client: {e}"))?;
        Ok(Self { client, kind })
    }
}

fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl DeliveryChannel for WebhookSender {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn send(&self, task: &DeliveryTask) -> SendOutcome {
        let result = self.client.post(&task.channel.address).json(&task.payload).send().await;

        match result {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    SendOutcome::Sent
                } else if status.as_u16() == 429 || status.is_server_error() {
                    SendOutcome::RetryableFailure { retry_after: retry_after(&resp) }
                } else {
                    SendOutcome::PermanentFailure
                }
            }
            Err(_) => SendOutcome::RetryableFailure { retry_after: None },
        }
    }
}
