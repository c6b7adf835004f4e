//! Email channel: hands off to an external transactional mailer over its
//! HTTP API. Success on 2xx; retry on 5xx/network, matching the Email row
//! of spec 4.10's transport table.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use super::{DeliveryChannel, SendOutcome};
use crate::models::{ChannelKind, DeliveryTask};

pub struct EmailSender {
    client: Client,
}

impl EmailSender {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build email client: {e}"))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DeliveryChannel for EmailSender {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn send(&self, task: &DeliveryTask) -> SendOutcome {
        let body = serde_json::json!({
            "to": task.channel.address,
            "subject": format!("{} just changed status", task.payload.name),
            "payload": task.payload,
        });

        match self.client.post("https://mailer.internal/v1/send").json(&body).send().await {
            Ok(resp) if resp.status().is_success() => SendOutcome::Sent,
            Ok(resp) if resp.status().is_server_error() => {
                SendOutcome::RetryableFailure { retry_after: None }
            }
            Ok(_) => SendOutcome::PermanentFailure,
            Err(_) => SendOutcome::RetryableFailure { retry_after: None },
        }
    }
}
