//! Parser for `json-catalog` targets: a top-level object carrying an array
//! of release records. Grounded on the teacher's `scrapers::dome_rest`
//! JSON-decoding style (typed `serde` structs over a documented response
//! shape, explicit missing-field errors rather than silently skipping).

use serde::Deserialize;

use super::{ParseError, Parser};
use crate::models::{Money, RawRelease, SizeAvailability};

#[derive(Debug, Deserialize)]
struct CatalogEnvelope {
    source: String,
    releases: Vec<CatalogRelease>,
}

#[derive(Debug, Deserialize)]
struct CatalogRelease {
    source_id: String,
    title: String,
    #[serde(default)]
    brand: Option<String>,
    #[serde(default)]
    sku: Option<String>,
    #[serde(default)]
    price: Option<f64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    release_date: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default)]
    sizes: Option<std::collections::HashMap<String, CatalogSize>>,
}

#[derive(Debug, Deserialize)]
struct CatalogSize {
    total: u32,
    available: u32,
}

#[derive(Default)]
pub struct JsonCatalogParser;

impl Parser for JsonCatalogParser {
    fn parse(&self, bytes: &[u8]) -> Result<Vec<RawRelease>, ParseError> {
        let envelope: CatalogEnvelope = serde_json::from_slice(bytes).map_err(|e| {
            ParseError::StructurallyInvalid(format!("expected catalog envelope: {e}"))
        })?;

        let mut out = Vec::with_capacity(envelope.releases.len());
        for r in envelope.releases {
            let size_availability = r.sizes.map(|sizes| {
                sizes
                    .into_iter()
                    .map(|(label, s)| {
                        (
                            label,
                            SizeAvailability {
                                total: s.total,
                                available: s.available,
                            },
                        )
                    })
                    .collect()
            });

            out.push(RawRelease {
                source: envelope.source.clone(),
                source_id: r.source_id,
                title: r.title,
                brand: r.brand,
                sku: r.sku,
                price: r.price.map(Money::from_major),
                currency: r.currency,
                release_date: r.release_date,
                status_raw: r.status,
                url: r.url,
                image_url: r.image_url,
                size_availability,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_catalog() {
        let json = br#"{
            "source": "nike",
            "releases": [
                {"source_id": "1", "title": "AJ1 Bred", "sku": "DZ5485-612", "brand": "Jordan", "price": 180.0, "currency": "USD", "status": "UPCOMING"}
            ]
        }"#;
        let releases = JsonCatalogParser::default().parse(json).unwrap();
        assert_eq!(releases.len(), 1);
        assert_eq!(releases[0].sku.as_deref(), Some("DZ5485-612"));
        assert_eq!(releases[0].price, Some(Money::from_major(180.0)));
    }

    #[test]
    fn empty_releases_array_is_valid() {
        let json = br#"{"source": "nike", "releases": []}"#;
        let releases = JsonCatalogParser::default().parse(json).unwrap();
        assert!(releases.is_empty());
    }

    #[test]
    fn missing_releases_array_is_structural_error() {
        let json = br#"{"source": "nike"}"#;
        let err = JsonCatalogParser::default().parse(json).unwrap_err();
        assert!(matches!(err, ParseError::StructurallyInvalid(_)));
    }
}
