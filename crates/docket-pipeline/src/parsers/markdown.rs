//! Parser for markdown and plain-text sources on local storage.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use docket_core::defaults::{REPRESENTATION_SCHEMA_VERSION, STORAGE_ROOT};
use docket_core::{Error, ParsedRepresentation, Parser, RepresentationContent, Result};
use docket_core::logging::SUBSYSTEM_PIPELINE;

/// Tool name recorded on representations produced by this parser.
pub const MARKDOWN_PARSER_NAME: &str = "markdown-file";

/// Reads markdown or plain text from a storage root. Locators are paths
/// relative to the root.
#[derive(Debug, Clone)]
pub struct MarkdownFileParser {
    root: PathBuf,
}

impl MarkdownFileParser {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root from `STORAGE_ROOT` (default `./storage`).
    pub fn from_env() -> Self {
        let root = std::env::var("STORAGE_ROOT").unwrap_or_else(|_| STORAGE_ROOT.to_string());
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a locator under the root, rejecting absolute paths and
    /// parent-directory components.
    fn resolve(&self, locator: &str) -> Result<PathBuf> {
        let relative = Path::new(locator);
        if locator.trim().is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(Error::Parse(format!("locator escapes storage root: {}", locator)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl Parser for MarkdownFileParser {
    fn name(&self) -> &str {
        MARKDOWN_PARSER_NAME
    }

    async fn parse(&self, locator: &str) -> Result<ParsedRepresentation> {
        let path = self.resolve(locator)?;
        let text = tokio::fs::read_to_string(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::Parse(format!("source not found: {}", locator)),
            std::io::ErrorKind::InvalidData => {
                Error::Parse(format!("source is not valid UTF-8 text: {}", locator))
            }
            _ => Error::Unavailable(format!("reading {}: {}", locator, e)),
        })?;

        debug!(
            subsystem = SUBSYSTEM_PIPELINE,
            component = "markdown_parser",
            locator,
            bytes = text.len(),
            "Source read"
        );

        Ok(ParsedRepresentation {
            parsing_tool: MARKDOWN_PARSER_NAME.to_string(),
            schema_version: REPRESENTATION_SCHEMA_VERSION.to_string(),
            content: RepresentationContent::Markdown { text },
        })
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(tokio::fs::metadata(&self.root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false))
    }
}
