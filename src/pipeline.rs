//! Wires the full control flow named in spec 3: Scheduler -> Fetch Adapter
//! -> Parser -> Canonicalizer -> [Storage upsert] -> Change Detector ->
//! Subscription Matcher -> Priority Scorer -> Fanout Queue. Delivery
//! Workers run as a separate pool consuming from the same storage gateway
//! (`delivery::run_worker`).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::{error, warn};

use crate::canonicalizer::Canonicalizer;
use crate::change_detector::{self, IngestionWindow};
use crate::fanout;
use crate::fetch::{AttemptContext, FetchResult, Fetcher};
use crate::models::Target;
use crate::parsers::ParserRegistry;
use crate::priority::{self, ScoringModel};
use crate::scheduler::{DispatchOutcome, TargetRunner};
use crate::storage::StorageGateway;
use crate::subscriptions::SubscriptionIndex;

pub struct Pipeline {
    fetcher: Arc<dyn Fetcher>,
    parsers: Arc<ParserRegistry>,
    canonicalizer: Canonicalizer,
    storage: Arc<dyn StorageGateway>,
    subscriptions: Arc<RwLock<SubscriptionIndex>>,
    scoring_model: ScoringModel,
}

impl Pipeline {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        parsers: Arc<ParserRegistry>,
        storage: Arc<dyn StorageGateway>,
        subscriptions: Arc<RwLock<SubscriptionIndex>>,
        scoring_model: ScoringModel,
    ) -> Self {
        Self {
            fetcher,
            parsers,
            canonicalizer: Canonicalizer::new(),
            storage,
            subscriptions,
            scoring_model,
        }
    }

    /// Process one target end-to-end: fetch, parse, canonicalize every
    /// extracted raw release, detect changes, match subscriptions, score,
    /// and fan out.
    pub async fn run_target(&self, target: &Target) -> DispatchOutcome {
        let ingestion_started = Utc::now();
        let attempt = AttemptContext { proxy: target.proxy_pool_id.clone(), ..Default::default() };

        let fetch_result = self.fetcher.fetch(target, &attempt).await;
        let bytes = match fetch_result {
            FetchResult::Ok(ok) => ok.bytes,
            FetchResult::TransientError { reason } => {
                warn!(target = target.target_id, reason, "transient fetch failure");
                return DispatchOutcome::Transient;
            }
            FetchResult::PermanentError { reason } => {
                return DispatchOutcome::Permanent { reason };
            }
            FetchResult::RateLimited { retry_after } => {
                return DispatchOutcome::RateLimited { retry_after };
            }
        };

        let raw_releases = match self.parsers.parse(&target.parser_key, &bytes) {
            Ok(releases) => releases,
            Err(e) => {
                error!(target = target.target_id, error = %e, "parse failure treated as permanent");
                return DispatchOutcome::Permanent { reason: e.to_string() };
            }
        };

        for raw in raw_releases {
            if let Err(e) = self.handle_raw_release(raw, ingestion_started).await {
                error!(target = target.target_id, error = %e, "failed to process raw release");
            }
        }

        DispatchOutcome::Success
    }

    async fn handle_raw_release(
        &self,
        raw: crate::models::RawRelease,
        ingestion_started: chrono::DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let Some(outcome) = self.canonicalizer.canonicalize(raw, self.storage.as_ref()).await? else {
            return Ok(());
        };

        let window = IngestionWindow { started: ingestion_started, completed: Utc::now() };
        let Some(mut event) = change_detector::detect(outcome.pre.as_ref(), &outcome.post, window) else {
            return Ok(());
        };

        event.priority_score = priority::score(&event, &outcome.post, &self.scoring_model);
        self.storage.append_event(event.clone()).await?;

        let matched_ids = {
            let index = self.subscriptions.read();
            index.matches(&outcome.post)
        };

        if matched_ids.is_empty() {
            return Ok(());
        }

        let all_subs = self.storage.all_subscriptions().await?;
        let matched_subs: Vec<_> = all_subs
            .into_iter()
            .filter(|s| matched_ids.iter().any(|m| m.subscription_id == s.subscription_id))
            .collect();

        fanout::fanout(
            self.storage.as_ref(),
            &event,
            &outcome.post,
            event.priority_score,
            &matched_subs,
        )
        .await?;

        Ok(())
    }
}

#[async_trait]
impl TargetRunner for Pipeline {
    async fn run(&self, target: &Target) -> DispatchOutcome {
        self.run_target(target).await
    }
}
