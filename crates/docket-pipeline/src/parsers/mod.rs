//! Parser adapters and the registry that routes documents to them.

pub mod http;
pub mod markdown;

use std::collections::HashMap;
use std::sync::Arc;

use docket_core::Parser;

pub use http::HttpConversionParser;
pub use markdown::MarkdownFileParser;

/// Registry mapping source types to parser implementations.
///
/// Source types are matched case-insensitively. Documents whose type has no
/// registered parser go to the fallback parser, if any.
#[derive(Clone, Default)]
pub struct ParserRegistry {
    parsers: HashMap<String, Arc<dyn Parser>>,
    fallback: Option<Arc<dyn Parser>>,
}

impl ParserRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parser for a source type. Replaces any existing parser for
    /// the same type.
    pub fn register(&mut self, source_type: &str, parser: Arc<dyn Parser>) {
        self.parsers.insert(source_type.to_lowercase(), parser);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_parser(mut self, source_type: &str, parser: Arc<dyn Parser>) -> Self {
        self.register(source_type, parser);
        self
    }

    /// Set the parser used for unregistered source types.
    pub fn with_fallback(mut self, parser: Arc<dyn Parser>) -> Self {
        self.fallback = Some(parser);
        self
    }

    /// Parser for `source_type`, falling back when none is registered.
    pub fn resolve(&self, source_type: &str) -> Option<Arc<dyn Parser>> {
        self.parsers
            .get(&source_type.to_lowercase())
            .or(self.fallback.as_ref())
            .cloned()
    }

    /// Source types with a registered parser, sorted.
    pub fn source_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.parsers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Run health checks on all registered parsers, keyed by parser name.
    pub async fn health_check_all(&self) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        for parser in self.parsers.values().chain(self.fallback.iter()) {
            let healthy = parser.health_check().await.unwrap_or(false);
            results.insert(parser.name().to_string(), healthy);
        }
        results
    }
}
