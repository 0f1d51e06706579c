//! Core data models for docket.
//!
//! These types are shared across all docket crates and represent the
//! pipeline's domain entities: projects, source documents, conversion
//! representations, blocks, schemas, runs, and overlays.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use uuid::Uuid;

// =============================================================================
// PROJECTS
// =============================================================================

/// Top-level grouping that owns source documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// DOCUMENTS
// =============================================================================

/// Parsing state of a source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentState {
    Pending,
    Parsing,
    Parsed,
    Failed,
}

impl DocumentState {
    /// Whether `self -> next` is an edge of the document state machine.
    ///
    /// `Parsed -> Pending` and `Failed -> Pending` are reached by
    /// re-ingestion with a changed content hash; `Failed -> Pending` is also
    /// reached by an explicit resubmit.
    pub fn can_transition_to(self, next: DocumentState) -> bool {
        use DocumentState::*;
        matches!(
            (self, next),
            (Pending, Parsing)
                | (Parsing, Parsed)
                | (Parsing, Failed)
                | (Parsed, Pending)
                | (Failed, Pending)
        )
    }

    /// `Parsed` and `Failed` are terminal until re-ingestion.
    pub fn is_terminal(self) -> bool {
        matches!(self, DocumentState::Parsed | DocumentState::Failed)
    }
}

impl std::fmt::Display for DocumentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Parsing => write!(f, "parsing"),
            Self::Parsed => write!(f, "parsed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for DocumentState {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "parsing" => Ok(Self::Parsing),
            "parsed" => Ok(Self::Parsed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid document state: {}", s)),
        }
    }
}

/// Structured reason attached to a failed document or run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// Cooperative cancellation observed at a checkpoint.
    Cancelled,
    /// Parser capability failed permanently or exhausted retries.
    Parse { message: String },
    /// Representation could not be decomposed into blocks.
    MalformedRepresentation { message: String },
    /// Schema-execution capability failed or returned unusable output.
    Execution { message: String },
    /// Anything else (persistence errors, timeouts).
    Internal { message: String },
}

impl FailureReason {
    pub fn message(&self) -> &str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Parse { message }
            | Self::MalformedRepresentation { message }
            | Self::Execution { message }
            | Self::Internal { message } => message,
        }
    }
}

impl From<&crate::Error> for FailureReason {
    fn from(err: &crate::Error) -> Self {
        use crate::Error;
        match err {
            Error::Cancelled(_) => Self::Cancelled,
            Error::Parse(m) => Self::Parse { message: m.clone() },
            Error::MalformedRepresentation(m) => Self::MalformedRepresentation { message: m.clone() },
            Error::Execution(m) => Self::Execution { message: m.clone() },
            // Transient errors that exhausted their retries are attributed to
            // the capability the caller was invoking; callers override this.
            other => Self::Internal {
                message: other.to_string(),
            },
        }
    }
}

/// A source document owned by a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub id: Uuid,
    pub project_id: Uuid,
    pub title: String,
    /// Lower-cased locator extension, used to route to a parser.
    pub source_type: String,
    pub locator: String,
    pub content_hash: String,
    pub state: DocumentState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    /// Live representation, present only while `Parsed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub representation_id: Option<Uuid>,
    /// Optimistic concurrency counter; bumped by every mutation.
    pub version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SourceDocument {
    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested_at.is_some()
    }
}

/// Request to ingest a document into a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    pub project_id: Uuid,
    pub locator: String,
    pub content_hash: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub source_type: Option<String>,
}

impl IngestRequest {
    pub fn new(project_id: Uuid, locator: impl Into<String>, content_hash: impl Into<String>) -> Self {
        Self {
            project_id,
            locator: locator.into(),
            content_hash: content_hash.into(),
            title: None,
            source_type: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Title to store: explicit title, else the locator's file stem.
    pub fn resolved_title(&self) -> String {
        if let Some(t) = self.title.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            return t.to_string();
        }
        let name = self.locator.rsplit(['/', '\\']).next().unwrap_or(&self.locator);
        match name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem.to_string(),
            _ => name.to_string(),
        }
    }

    /// Source type to store: explicit type, else the locator's extension.
    pub fn resolved_source_type(&self) -> String {
        if let Some(t) = self.source_type.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            return t.to_lowercase();
        }
        let name = self.locator.rsplit(['/', '\\']).next().unwrap_or(&self.locator);
        match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext.to_lowercase(),
            _ => String::new(),
        }
    }
}

/// What `ingest` did with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    /// A new document was created in `Pending`.
    Created,
    /// Same locator and content hash as an existing document; nothing changed.
    Unchanged,
    /// Content hash changed; the document is back in `Pending`.
    Reingested,
}

/// Read projection joining a document with its live representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentView {
    #[serde(flatten)]
    pub document: SourceDocument,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsing_tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed_at: Option<DateTime<Utc>>,
    pub block_count: i32,
    pub block_type_freq: BTreeMap<String, i32>,
    pub total_characters: i64,
}

impl DocumentView {
    /// View of a document, filled in from its live representation when there is one.
    pub fn new(document: SourceDocument, live: Option<&ConversionRepresentation>) -> Self {
        match live {
            Some(rep) => Self {
                document,
                parsing_tool: Some(rep.parsing_tool.clone()),
                parsed_at: Some(rep.parsed_at),
                block_count: rep.block_count,
                block_type_freq: rep.block_type_freq.clone(),
                total_characters: rep.total_characters,
            },
            None => Self {
                document,
                parsing_tool: None,
                parsed_at: None,
                block_count: 0,
                block_type_freq: BTreeMap::new(),
                total_characters: 0,
            },
        }
    }
}

// =============================================================================
// REPRESENTATIONS & BLOCKS
// =============================================================================

/// One pre-segmented unit produced by a structured parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub block_type: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub section_path: Vec<String>,
}

/// Parser output, stored verbatim on the representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum RepresentationContent {
    /// Markdown text, decomposed by block structure.
    Markdown { text: String },
    /// Already segmented content; each segment becomes one block.
    Segments { segments: Vec<Segment> },
}

impl RepresentationContent {
    pub fn format_name(&self) -> &'static str {
        match self {
            Self::Markdown { .. } => "markdown",
            Self::Segments { .. } => "segments",
        }
    }
}

/// What a parser capability hands back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedRepresentation {
    pub parsing_tool: String,
    pub schema_version: String,
    pub content: RepresentationContent,
}

/// Structured output of parsing a source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionRepresentation {
    pub id: Uuid,
    pub document_id: Uuid,
    pub schema_version: String,
    pub parsing_tool: String,
    pub content: RepresentationContent,
    pub content_hash: String,
    pub block_count: i32,
    pub block_type_freq: BTreeMap<String, i32>,
    pub total_characters: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_at: Option<DateTime<Utc>>,
    pub parsed_at: DateTime<Utc>,
}

impl ConversionRepresentation {
    pub fn is_superseded(&self) -> bool {
        self.superseded_at.is_some()
    }
}

/// Character span of a block inside the representation text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLocator {
    pub start_offset: i64,
    pub end_offset: i64,
}

/// An ordered, immutable unit of a representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: Uuid,
    pub representation_id: Uuid,
    pub order_index: i32,
    pub block_type: String,
    #[serde(default)]
    pub section_path: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locator: Option<BlockLocator>,
    pub content: String,
    pub content_hash: String,
}

// =============================================================================
// SCHEMAS
// =============================================================================

/// A published, immutable schema version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// Lineage identifier shared by every version of a schema ref.
    pub id: Uuid,
    pub schema_ref: String,
    pub version: i32,
    pub definition: JsonValue,
    pub definition_hash: String,
    pub created_at: DateTime<Utc>,
}

impl Schema {
    pub fn key(&self) -> SchemaKey {
        SchemaKey {
            id: self.id,
            version: self.version,
        }
    }
}

/// Identity of one schema version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaKey {
    pub id: Uuid,
    pub version: i32,
}

/// Request to publish a schema definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishSchemaRequest {
    /// Explicit ref; derived from the definition's `$id` or `title` when absent.
    #[serde(default)]
    pub schema_ref: Option<String>,
    pub definition: JsonValue,
}

// =============================================================================
// RUNS & OVERLAYS
// =============================================================================

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// Execution of one schema version against one block set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub document_id: Uuid,
    pub representation_id: Uuid,
    pub schema_id: Uuid,
    pub schema_version: i32,
    /// Hash over the ordered block content hashes the run executed against.
    pub fingerprint: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    pub requested_by: String,
    pub overlay_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn schema_key(&self) -> SchemaKey {
        SchemaKey {
            id: self.schema_id,
            version: self.schema_version,
        }
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested_at.is_some()
    }
}

/// A single annotation returned by the schema-execution capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub block_id: Uuid,
    pub payload: JsonValue,
}

/// Annotation persisted against a block by a succeeded run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Overlay {
    pub id: Uuid,
    pub run_id: Uuid,
    pub block_id: Uuid,
    pub order_index: i32,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
    /// True when the overlay's run targeted a representation that is no longer live.
    #[serde(default)]
    pub superseded: bool,
}

/// Overlay listing filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayFilter {
    pub schema: Option<SchemaKey>,
    /// When false, overlays of superseded representations are left out.
    pub include_superseded: bool,
}

// =============================================================================
// AUTHORIZATION CONTEXT
// =============================================================================

/// Opaque caller credential handed to the authorizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Anonymous,
    ApiKey(String),
}

/// Operation the caller wants to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Ingest,
    Submit,
    RequestRun,
    Cancel,
    PublishSchema,
    Read,
}

/// Identity resolved by the authorizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub identity: String,
    pub rate_limit_bucket: String,
}

impl Principal {
    /// Principal used by internal callers and open deployments.
    pub fn system() -> Self {
        Self {
            identity: "system".to_string(),
            rate_limit_bucket: "system".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_state_transitions() {
        use DocumentState::*;
        assert!(Pending.can_transition_to(Parsing));
        assert!(Parsing.can_transition_to(Parsed));
        assert!(Parsing.can_transition_to(Failed));
        assert!(Parsed.can_transition_to(Pending));
        assert!(Failed.can_transition_to(Pending));

        assert!(!Pending.can_transition_to(Parsed));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Parsing.can_transition_to(Pending));
        assert!(!Parsed.can_transition_to(Parsing));
        assert!(!Failed.can_transition_to(Parsed));
        assert!(!Parsed.can_transition_to(Parsed));
    }

    #[test]
    fn test_document_state_roundtrip_str() {
        for s in ["pending", "parsing", "parsed", "failed"] {
            let state: DocumentState = s.parse().unwrap();
            assert_eq!(state.to_string(), s);
        }
        assert!("done".parse::<DocumentState>().is_err());
    }

    #[test]
    fn test_run_status_terminal() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert_eq!("SUCCEEDED".parse::<RunStatus>().unwrap(), RunStatus::Succeeded);
    }

    #[test]
    fn test_failure_reason_serialization() {
        let reason = FailureReason::Execution {
            message: "schema rejected".to_string(),
        };
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["kind"], "execution");
        assert_eq!(json["message"], "schema rejected");

        let cancelled = serde_json::to_value(FailureReason::Cancelled).unwrap();
        assert_eq!(cancelled, serde_json::json!({"kind": "cancelled"}));
    }

    #[test]
    fn test_failure_reason_from_error() {
        let err = crate::Error::MalformedRepresentation("no blocks".into());
        assert_eq!(
            FailureReason::from(&err),
            FailureReason::MalformedRepresentation {
                message: "no blocks".into()
            }
        );
        let err = crate::Error::Cancelled("user".into());
        assert_eq!(FailureReason::from(&err), FailureReason::Cancelled);
    }

    #[test]
    fn test_ingest_request_resolution() {
        let req = IngestRequest::new(Uuid::nil(), "uploads/2024/Quarterly Report.MD", "abc");
        assert_eq!(req.resolved_title(), "Quarterly Report");
        assert_eq!(req.resolved_source_type(), "md");

        let req = IngestRequest::new(Uuid::nil(), "README", "abc").with_title("  Readme  ");
        assert_eq!(req.resolved_title(), "Readme");
        assert_eq!(req.resolved_source_type(), "");

        let req = IngestRequest::new(Uuid::nil(), ".env", "abc");
        assert_eq!(req.resolved_title(), ".env");
        assert_eq!(req.resolved_source_type(), "");
    }

    #[test]
    fn test_representation_content_tagging() {
        let content = RepresentationContent::Markdown {
            text: "# Hi".to_string(),
        };
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json["format"], "markdown");
        assert_eq!(content.format_name(), "markdown");

        let parsed: RepresentationContent = serde_json::from_value(serde_json::json!({
            "format": "segments",
            "segments": [{"block_type": "paragraph", "text": "x"}]
        }))
        .unwrap();
        match parsed {
            RepresentationContent::Segments { segments } => {
                assert_eq!(segments.len(), 1);
                assert!(segments[0].section_path.is_empty());
            }
            _ => panic!("expected segments"),
        }
    }
}
