//! Row decoding shared by the Postgres repositories.
//!
//! Enum columns are stored as TEXT and JSON columns as JSONB; decoding
//! failures surface as `Error::Internal` rather than panicking.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::Row;

use docket_core::{
    Block, ConversionRepresentation, DocumentState, DocumentView, Error, FailureReason, Overlay,
    Result, Run, RunStatus, Schema, SourceDocument,
};

/// Column list selected for documents (and the documents view prefix).
pub(crate) const DOCUMENT_COLUMNS: &str = "id, project_id, title, source_type, locator, content_hash, \
     state, failure, representation_id, version, cancel_requested_at, created_at, updated_at";

pub(crate) const REPRESENTATION_COLUMNS: &str = "id, document_id, schema_version, parsing_tool, \
     content, content_hash, block_count, block_type_freq, total_characters, superseded_at, parsed_at";

pub(crate) const BLOCK_COLUMNS: &str =
    "id, representation_id, order_index, block_type, section_path, locator, content, content_hash";

pub(crate) const RUN_COLUMNS: &str = "id, document_id, representation_id, schema_id, schema_version, \
     fingerprint, status, failure, requested_by, overlay_count, cancel_requested_at, started_at, finished_at";

pub(crate) const SCHEMA_COLUMNS: &str =
    "id, schema_ref, version, definition, definition_hash, created_at";

fn decode_json<T: DeserializeOwned>(value: JsonValue, column: &str) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| Error::Internal(format!("corrupt {} column: {}", column, e)))
}

fn decode_optional_json<T: DeserializeOwned>(value: Option<JsonValue>, column: &str) -> Result<Option<T>> {
    match value {
        None | Some(JsonValue::Null) => Ok(None),
        Some(v) => decode_json(v, column).map(Some),
    }
}

pub(crate) fn parse_document_row(row: &PgRow) -> Result<SourceDocument> {
    let state: String = row.get("state");
    Ok(SourceDocument {
        id: row.get("id"),
        project_id: row.get("project_id"),
        title: row.get("title"),
        source_type: row.get("source_type"),
        locator: row.get("locator"),
        content_hash: row.get("content_hash"),
        state: state.parse::<DocumentState>().map_err(Error::Internal)?,
        failure: decode_optional_json::<FailureReason>(row.get("failure"), "failure")?,
        representation_id: row.get("representation_id"),
        version: row.get("version"),
        cancel_requested_at: row.get("cancel_requested_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub(crate) fn parse_view_row(row: &PgRow) -> Result<DocumentView> {
    Ok(DocumentView {
        document: parse_document_row(row)?,
        parsing_tool: row.get("parsing_tool"),
        parsed_at: row.get("parsed_at"),
        block_count: row.get("block_count"),
        block_type_freq: decode_json::<BTreeMap<String, i32>>(row.get("block_type_freq"), "block_type_freq")?,
        total_characters: row.get("total_characters"),
    })
}

pub(crate) fn parse_representation_row(row: &PgRow) -> Result<ConversionRepresentation> {
    Ok(ConversionRepresentation {
        id: row.get("id"),
        document_id: row.get("document_id"),
        schema_version: row.get("schema_version"),
        parsing_tool: row.get("parsing_tool"),
        content: decode_json(row.get("content"), "content")?,
        content_hash: row.get("content_hash"),
        block_count: row.get("block_count"),
        block_type_freq: decode_json(row.get("block_type_freq"), "block_type_freq")?,
        total_characters: row.get("total_characters"),
        superseded_at: row.get("superseded_at"),
        parsed_at: row.get("parsed_at"),
    })
}

pub(crate) fn parse_block_row(row: &PgRow) -> Result<Block> {
    Ok(Block {
        id: row.get("id"),
        representation_id: row.get("representation_id"),
        order_index: row.get("order_index"),
        block_type: row.get("block_type"),
        section_path: decode_json(row.get("section_path"), "section_path")?,
        locator: decode_optional_json(row.get("locator"), "locator")?,
        content: row.get("content"),
        content_hash: row.get("content_hash"),
    })
}

pub(crate) fn parse_schema_row(row: &PgRow) -> Schema {
    Schema {
        id: row.get("id"),
        schema_ref: row.get("schema_ref"),
        version: row.get("version"),
        definition: row.get("definition"),
        definition_hash: row.get("definition_hash"),
        created_at: row.get("created_at"),
    }
}

pub(crate) fn parse_run_row(row: &PgRow) -> Result<Run> {
    let status: String = row.get("status");
    Ok(Run {
        id: row.get("id"),
        document_id: row.get("document_id"),
        representation_id: row.get("representation_id"),
        schema_id: row.get("schema_id"),
        schema_version: row.get("schema_version"),
        fingerprint: row.get("fingerprint"),
        status: status.parse::<RunStatus>().map_err(Error::Internal)?,
        failure: decode_optional_json(row.get("failure"), "failure")?,
        requested_by: row.get("requested_by"),
        overlay_count: row.get("overlay_count"),
        cancel_requested_at: row.get("cancel_requested_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
    })
}

pub(crate) fn parse_overlay_row(row: &PgRow) -> Overlay {
    Overlay {
        id: row.get("id"),
        run_id: row.get("run_id"),
        block_id: row.get("block_id"),
        order_index: row.get("order_index"),
        payload: row.get("payload"),
        created_at: row.get("created_at"),
        superseded: row.try_get("superseded").unwrap_or(false),
    }
}

/// Encode a value for a JSONB bind parameter.
pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<JsonValue> {
    serde_json::to_value(value).map_err(Error::from)
}
