//! Subscription Matcher (spec 4.7): given one `ReleaseEvent` plus its
//! owning `CanonicalRelease`, returns the `(user_id, subscription_id)`
//! pairs whose filters match.
//!
//! Inverted indexes keyed by brand and sku follow the teacher's
//! `signals::quality::SignalQualityGate` pattern of a `HashMap` of rolling
//! per-key state rather than a full scan on every event; subscriptions
//! with neither filter set fall back to a full scan, per spec.

use std::collections::{HashMap, HashSet};

use crate::models::{CanonicalRelease, SubscriptionId, UserId, UserSubscription};

pub struct MatchedSubscription {
    pub user_id: UserId,
    pub subscription_id: SubscriptionId,
}

#[derive(Default)]
pub struct SubscriptionIndex {
    subscriptions: HashMap<SubscriptionId, UserSubscription>,
    by_brand: HashMap<String, HashSet<SubscriptionId>>,
    by_sku: HashMap<String, HashSet<SubscriptionId>>,
    scan_fallback: HashSet<SubscriptionId>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, sub: UserSubscription) {
        self.remove(sub.subscription_id);
        for brand in &sub.brand_filter {
            self.by_brand.entry(brand.clone()).or_default().insert(sub.subscription_id);
        }
        for sku in &sub.sku_filter {
            self.by_sku.entry(sku.clone()).or_default().insert(sub.subscription_id);
        }
        if sub.brand_filter.is_empty() && sub.sku_filter.is_empty() {
            self.scan_fallback.insert(sub.subscription_id);
        }
        self.subscriptions.insert(sub.subscription_id, sub);
    }

    pub fn remove(&mut self, subscription_id: SubscriptionId) {
        if let Some(old) = self.subscriptions.remove(&subscription_id) {
            for brand in &old.brand_filter {
                if let Some(set) = self.by_brand.get_mut(brand) {
                    set.remove(&subscription_id);
                }
            }
            for sku in &old.sku_filter {
                if let Some(set) = self.by_sku.get_mut(sku) {
                    set.remove(&subscription_id);
                }
            }
            self.scan_fallback.remove(&subscription_id);
        }
    }

    /// Candidate subscription ids worth evaluating for `release` — the
    /// union of brand/sku index hits plus the full-scan-fallback set, per
    /// spec 4.7's "efficient for large subscription counts" requirement.
    fn candidates(&self, release: &CanonicalRelease) -> HashSet<SubscriptionId> {
        let mut candidates = self.scan_fallback.clone();
        if let Some(brand) = &release.brand {
            if let Some(set) = self.by_brand.get(brand) {
                candidates.extend(set);
            }
        }
        if let Some(sku) = &release.sku {
            if let Some(set) = self.by_sku.get(sku) {
                candidates.extend(set);
            }
        }
        candidates
    }

    pub fn matches(&self, release: &CanonicalRelease) -> Vec<MatchedSubscription> {
        self.candidates(release)
            .into_iter()
            .filter_map(|id| self.subscriptions.get(&id))
            .filter(|sub| field_match(sub, release))
            .map(|sub| MatchedSubscription { user_id: sub.user_id, subscription_id: sub.subscription_id })
            .collect()
    }
}

fn field_match(sub: &UserSubscription, release: &CanonicalRelease) -> bool {
    let brand_ok = sub.brand_filter.is_empty()
        || release.brand.as_ref().is_some_and(|b| sub.brand_filter.contains(b));
    let sku_ok =
        sub.sku_filter.is_empty() || release.sku.as_ref().is_some_and(|s| sub.sku_filter.contains(s));
    let region_ok = if sub.region_filter.is_empty() {
        true
    } else {
        release.region.as_ref().is_some_and(|r| sub.region_filter.contains(r))
    };
    let size_ok = if sub.size_filter.is_empty() {
        true
    } else {
        release.stock_summary.as_ref().is_some_and(|stock| {
            sub.size_filter.iter().any(|size| stock.get(size).is_some_and(|a| a.available > 0))
        })
    };
    brand_ok && sku_ok && region_ok && size_ok
}
