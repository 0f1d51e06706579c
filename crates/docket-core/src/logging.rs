//! Structured logging conventions for docket.
//!
//! `tracing` field names are identifiers at the call site, so the names
//! below are a convention rather than constants. The values of the
//! `subsystem` field are constants so log aggregation can filter on them.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, retry or fallback applied |
//! | INFO  | Lifecycle events (startup, shutdown), state transitions |
//! | DEBUG | Decision points, dedup outcomes, config choices |
//! | TRACE | Per-block iteration |
//!
//! ## Field names
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `subsystem` | one of the `SUBSYSTEM_*` values |
//! | `component` | e.g. `coordinator`, `run_executor`, `worker`, `pool` |
//! | `op` | e.g. `ingest`, `submit`, `parse`, `request_run` |
//! | `project_id`, `document_id`, `representation_id`, `run_id` | entity ids |
//! | `schema_id`, `schema_version` | schema key |
//! | `kind`, `subject_id` | worker job kind and the document or run it targets |
//! | `duration_ms`, `block_count`, `overlay_count`, `attempt` | measurements |
//! | `from_state`, `to_state` | document transition |
//! | `error` | error message on failure |

/// HTTP handlers and the server binary.
pub const SUBSYSTEM_API: &str = "api";

/// Storage backends and the connection pool.
pub const SUBSYSTEM_DB: &str = "db";

/// Pipeline services, capabilities, and the worker.
pub const SUBSYSTEM_PIPELINE: &str = "pipeline";
