//! Push channel: single-shot delivery, no retry on permanent failure
//! (spec 4.10's Push row — a stale device token is never going to recover).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use super::{DeliveryChannel, SendOutcome};
use crate::models::{ChannelKind, DeliveryTask};

pub struct PushSender {
    client: Client,
}

impl PushSender {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build push client: {e}"))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DeliveryChannel for PushSender {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Push
    }

    async fn send(&self, task: &DeliveryTask) -> SendOutcome {
        match self.client.post(&task.channel.address).json(&task.payload).send().await {
            Ok(resp) if resp.status().is_success() => SendOutcome::Sent,
            // No retry path for push: every non-success is treated as
            // permanent per spec.
            _ => SendOutcome::PermanentFailure,
        }
    }
}
