//! Deterministic id derivation and content fingerprinting.
//!
//! `release_id` must be reproducible from the same `(sku, source)` or
//! `(source, title)` pair across process restarts, so this deliberately
//! does not use `std::collections::hash_map::RandomState` (seeded per
//! process) — it hashes over SHA-256 and truncates, the same primitive the
//! teacher already depends on (`sha2`) for CLOB request signing.

use sha2::{Digest, Sha256};

use crate::models::{Money, PayloadHash, ReleaseId, Status, StockSummary};

fn hash64(input: &str) -> u64 {
    let digest = Sha256::digest(input.as_bytes());
    u64::from_be_bytes(digest[0..8].try_into().expect("sha256 digest >= 8 bytes"))
}

/// Uppercase and strip internal whitespace, per spec 4.3 step 1.
pub fn normalize_sku(sku: &str) -> String {
    sku.to_uppercase().chars().filter(|c| !c.is_whitespace()).collect()
}

/// Lowercase, collapse whitespace to `-`, strip punctuation, per spec 4.3
/// step 1.
pub fn slugify(title: &str) -> String {
    let lowered = title.to_lowercase();
    let mut slug = String::with_capacity(lowered.len());
    let mut last_was_dash = false;
    for c in lowered.chars() {
        if c.is_alphanumeric() {
            slug.push(c);
            last_was_dash = false;
        } else if !last_was_dash {
            slug.push('-');
            last_was_dash = true;
        }
    }
    slug.trim_matches('-').to_string()
}

/// Derive `release_id` exactly per spec 4.3 step 1.
pub fn release_id(sku: Option<&str>, title: &str, source: &str) -> ReleaseId {
    let key = match sku.filter(|s| !s.trim().is_empty()) {
        Some(sku) => format!("sku::{}::{}", normalize_sku(sku), source),
        None => format!("name::{}::{}", slugify(title), source),
    };
    ReleaseId(hash64(&key))
}

/// Fields that feed `payload_hash`, normalized the same way each time so
/// two semantically-identical `RawRelease`s always fingerprint equal.
pub struct CanonicalFields<'a> {
    pub name: &'a str,
    pub brand: Option<&'a str>,
    pub status: Status,
    pub price: Option<Money>,
    pub currency: Option<&'a str>,
    pub stock_summary: Option<&'a StockSummary>,
}

pub fn content_hash(fields: &CanonicalFields<'_>) -> PayloadHash {
    let mut s = String::new();
    s.push_str(&slugify(fields.name));
    s.push('|');
    s.push_str(fields.brand.unwrap_or(""));
    s.push('|');
    s.push_str(&format!("{:?}", fields.status));
    s.push('|');
    s.push_str(&fields.price.map(|m| m.0.to_string()).unwrap_or_default());
    s.push('|');
    s.push_str(fields.currency.unwrap_or(""));
    s.push('|');
    if let Some(stock) = fields.stock_summary {
        let mut entries: Vec<_> = stock.iter().collect();
        entries.sort_by_key(|(size, _)| size.clone());
        for (size, avail) in entries {
            s.push_str(&format!("{}:{}/{};", size, avail.available, avail.total));
        }
    }
    PayloadHash(hash64(&s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_id_prefers_sku() {
        let a = release_id(Some("DZ5485-612"), "AJ1 Bred", "nike");
        let b = release_id(Some("dz5485-612"), "completely different title", "nike");
        assert_eq!(a, b, "normalize() should make sku-keying case/space insensitive");
    }

    #[test]
    fn release_id_falls_back_to_slugged_title() {
        let a = release_id(None, "Air Max 1 SC", "footlocker");
        let b = release_id(None, "  air   max 1 sc  ", "footlocker");
        assert_eq!(a, b);
    }

    #[test]
    fn release_id_is_deterministic_across_calls() {
        let a = release_id(Some("ABC-123"), "x", "nike");
        let b = release_id(Some("ABC-123"), "x", "nike");
        assert_eq!(a, b);
    }

    #[test]
    fn different_sources_produce_different_ids() {
        let a = release_id(Some("ABC-123"), "x", "nike");
        let b = release_id(Some("ABC-123"), "x", "footlocker");
        assert_ne!(a, b);
    }

    #[test]
    fn slugify_collapses_punctuation() {
        assert_eq!(slugify("Air Jordan 1 'Bred'!!"), "air-jordan-1-bred");
    }
}
