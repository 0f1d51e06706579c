//! Error types for the docket pipeline.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias using docket's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for docket operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Project not found
    #[error("Project not found: {0}")]
    ProjectNotFound(Uuid),

    /// Source document not found
    #[error("Document not found: {0}")]
    DocumentNotFound(Uuid),

    /// Run not found
    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    /// Schema version not found
    #[error("Schema not found: {id} v{version}")]
    SchemaNotFound { id: Uuid, version: i32 },

    /// A state-machine transition that is not permitted from the current state
    #[error("Invalid transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// Optimistic concurrency check failed; another writer moved the record first
    #[error("Stale state for {entity} {id}: expected version {expected_version}")]
    StaleState {
        entity: &'static str,
        id: Uuid,
        expected_version: i64,
    },

    /// Representation payload could not be decomposed into blocks
    #[error("Malformed representation: {0}")]
    MalformedRepresentation(String),

    /// Parser capability reported a permanent failure
    #[error("Parse error: {0}")]
    Parse(String),

    /// Schema-execution capability reported a failure
    #[error("Execution error: {0}")]
    Execution(String),

    /// Overlays were appended to a run that is not running
    #[error("Run is not running: {0}")]
    RunNotRunning(Uuid),

    /// Work was cancelled at a checkpoint
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A run was requested for a document without a live representation
    #[error("Document not parsed: {0}")]
    DocumentNotParsed(Uuid),

    /// External capability temporarily unavailable (retryable)
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Authentication/authorization failed
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Forbidden (authenticated but not authorized)
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Caller exceeded its rate-limit bucket
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the failure is worth retrying with backoff.
    ///
    /// Only capability and transport failures qualify. State-machine and
    /// dedup violations are never retried automatically.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Unavailable(_) | Error::Request(_))
    }

    /// Short machine-readable kind, used in API error bodies and event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Database(_) => "database",
            Error::NotFound(_)
            | Error::ProjectNotFound(_)
            | Error::DocumentNotFound(_)
            | Error::RunNotFound(_)
            | Error::SchemaNotFound { .. } => "not_found",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::StaleState { .. } => "stale_state",
            Error::MalformedRepresentation(_) => "malformed_representation",
            Error::Parse(_) => "parse",
            Error::Execution(_) => "execution",
            Error::RunNotRunning(_) => "run_not_running",
            Error::Cancelled(_) => "cancelled",
            Error::DocumentNotParsed(_) => "document_not_parsed",
            Error::Unavailable(_) => "unavailable",
            Error::Serialization(_) => "serialization",
            Error::Config(_) => "config",
            Error::InvalidInput(_) => "invalid_input",
            Error::Request(_) => "request",
            Error::Internal(_) => "internal",
            Error::Unauthorized(_) => "unauthorized",
            Error::Forbidden(_) => "forbidden",
            Error::RateLimited(_) => "rate_limited",
            Error::Io(_) => "io",
        }
    }

    /// Build an `InvalidTransition` from any displayable states.
    pub fn invalid_transition(
        entity: &'static str,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        Error::InvalidTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            Error::Unavailable(e.to_string())
        } else {
            Error::Request(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_not_found() {
        let err = Error::NotFound("test resource".to_string());
        assert_eq!(err.to_string(), "Not found: test resource");
    }

    #[test]
    fn test_error_display_document_not_found() {
        let id = Uuid::nil();
        let err = Error::DocumentNotFound(id);
        assert_eq!(err.to_string(), format!("Document not found: {}", id));
    }

    #[test]
    fn test_error_display_schema_not_found() {
        let id = Uuid::nil();
        let err = Error::SchemaNotFound { id, version: 3 };
        assert_eq!(err.to_string(), format!("Schema not found: {} v3", id));
    }

    #[test]
    fn test_error_display_invalid_transition() {
        let err = Error::invalid_transition("document", "parsing", "pending");
        assert_eq!(
            err.to_string(),
            "Invalid transition for document: parsing -> pending"
        );
    }

    #[test]
    fn test_error_display_stale_state() {
        let id = Uuid::nil();
        let err = Error::StaleState {
            entity: "document",
            id,
            expected_version: 4,
        };
        assert_eq!(
            err.to_string(),
            format!("Stale state for document {}: expected version 4", id)
        );
    }

    #[test]
    fn test_error_display_run_not_running() {
        let id = Uuid::nil();
        let err = Error::RunNotRunning(id);
        assert_eq!(err.to_string(), format!("Run is not running: {}", id));
    }

    #[test]
    fn test_error_display_malformed() {
        let err = Error::MalformedRepresentation("no blocks".to_string());
        assert_eq!(err.to_string(), "Malformed representation: no blocks");
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.kind(), "io");
    }

    #[test]
    fn test_is_transient() {
        assert!(Error::Unavailable("503".into()).is_transient());
        assert!(Error::Request("reset".into()).is_transient());
        assert!(!Error::Parse("bad pdf".into()).is_transient());
        assert!(!Error::Execution("schema".into()).is_transient());
        assert!(!Error::RunNotRunning(Uuid::nil()).is_transient());
        assert!(!Error::invalid_transition("document", "a", "b").is_transient());
    }

    #[test]
    fn test_kind_groups_not_found() {
        assert_eq!(Error::DocumentNotFound(Uuid::nil()).kind(), "not_found");
        assert_eq!(Error::RunNotFound(Uuid::nil()).kind(), "not_found");
        assert_eq!(
            Error::SchemaNotFound {
                id: Uuid::nil(),
                version: 1
            }
            .kind(),
            "not_found"
        );
        assert_eq!(Error::ProjectNotFound(Uuid::nil()).kind(), "not_found");
    }
}
