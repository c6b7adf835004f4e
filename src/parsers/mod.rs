//! Parser Registry (spec 4.2): maps a `parser_key` to a pure, deterministic
//! extractor. No parser performs I/O.

mod html_page;
mod json_catalog;

pub use html_page::HtmlPageParser;
pub use json_catalog::JsonCatalogParser;

use std::collections::HashMap;

use thiserror::Error;

use crate::models::RawRelease;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("missing mandatory field or array: {0}")]
    StructurallyInvalid(String),
}

pub trait Parser: Send + Sync {
    fn parse(&self, bytes: &[u8]) -> Result<Vec<RawRelease>, ParseError>;
}

/// Registry mapping `parser_key -> Parser`. A single struct with optional
/// fields (`RawRelease`) is enough for every retailer shape; per spec 9 no
/// tagged-variant hierarchy is needed here.
#[derive(Default)]
pub struct ParserRegistry {
    parsers: HashMap<String, Box<dyn Parser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: impl Into<String>, parser: Box<dyn Parser>) -> &mut Self {
        self.parsers.insert(key.into(), parser);
        self
    }

    pub fn with_defaults() -> Self {
        let mut r = Self::new();
        r.register("json-catalog", Box::new(JsonCatalogParser::default()));
        r.register("html-page", Box::new(HtmlPageParser::default()));
        r
    }

    pub fn parse(&self, parser_key: &str, bytes: &[u8]) -> Result<Vec<RawRelease>, ParseError> {
        match self.parsers.get(parser_key) {
            Some(parser) => parser.parse(bytes),
            None => Err(ParseError::StructurallyInvalid(format!(
                "no parser registered for key {parser_key}"
            ))),
        }
    }
}
