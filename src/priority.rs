//! Priority Scorer (spec 4.8): a deterministic, reproducible
//! `score(event, release, model) -> [0, 1]` feature composition.
//!
//! Grounded on the teacher's `signals::detector::SignalDetector`'s pattern
//! of composing a handful of bounded feature contributions into one
//! confidence value (there via ad-hoc `min`/`+` clamps per signal kind;
//! here via an explicit weighted sum passed through a logistic transform,
//! since this scorer needs a versioned, swappable weight set rather than
//! per-signal hardcoded constants).

use serde::{Deserialize, Serialize};

use crate::models::{CanonicalRelease, ReleaseEvent, Status};

/// Versioned weight set for the scorer. `Default` provides spec's
/// documented fallback when no model record is configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringModel {
    pub version: u32,
    pub w_brand_popularity: f64,
    pub w_aggregator_hits: f64,
    pub w_social_mentions: f64,
    pub w_restock_recency: f64,
    pub w_status: f64,
    pub w_price_volatility: f64,
    pub bias: f64,
}

impl Default for ScoringModel {
    fn default() -> Self {
        Self {
            version: 1,
            w_brand_popularity: 1.2,
            w_aggregator_hits: 0.15,
            w_social_mentions: 0.05,
            w_restock_recency: 0.8,
            w_status: 2.0,
            w_price_volatility: 0.5,
            bias: -1.5,
        }
    }
}

fn brand_popularity(brand: Option<&str>) -> f64 {
    match brand.map(|b| b.to_lowercase()) {
        Some(ref b) if b == "jordan" || b == "nike" => 1.0,
        Some(ref b) if b == "adidas" || b == "yeezy" => 0.8,
        Some(_) => 0.4,
        None => 0.1,
    }
}

fn price_volatility(event: &ReleaseEvent) -> f64 {
    match (event.price_from, event.price_to) {
        (Some(from), Some(to)) if from.0 != 0 => ((to.0 - from.0).abs() as f64 / from.0 as f64).min(1.0),
        _ => 0.0,
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Pure, reproducible given the same `model.version`.
pub fn score(event: &ReleaseEvent, release: &CanonicalRelease, model: &ScoringModel) -> f64 {
    let status = event.status_to.unwrap_or(Status::Unknown);
    let aggregator = (event.aggregator_hits as f64 / 10.0).min(1.0);
    let social = event.social_mentions.map(|m| (m as f64 / 100.0).min(1.0)).unwrap_or(0.0);
    let restock = if status == Status::Restock { event.restock_likelihood.unwrap_or(0.5) } else { 0.0 };

    let weighted = model.w_brand_popularity * brand_popularity(release.brand.as_deref())
        + model.w_aggregator_hits * aggregator
        + model.w_social_mentions * social
        + model.w_restock_recency * restock
        + model.w_status * status.weight()
        + model.w_price_volatility * price_volatility(event)
        + model.bias;

    sigmoid(weighted)
}
