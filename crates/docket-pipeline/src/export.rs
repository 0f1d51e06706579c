//! JSONL export records: one line per block, immutable parse output next to
//! the user-defined overlay data.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use docket_core::{Block, ConversionRepresentation, Overlay, Result, Schema, SourceDocument};

/// Media type of an export body.
pub const JSONL_CONTENT_TYPE: &str = "application/x-ndjson; charset=utf-8";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSource {
    pub document_id: Uuid,
    pub project_id: Uuid,
    pub title: String,
    pub source_type: String,
    pub locator: String,
    pub content_hash: String,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportConversion {
    pub representation_id: Uuid,
    pub parsing_tool: String,
    pub schema_version: String,
    pub content_hash: String,
    pub block_count: i32,
    pub block_type_freq: BTreeMap<String, i32>,
    pub total_characters: i64,
    pub parsed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportImmutable {
    pub source: ExportSource,
    pub conversion: ExportConversion,
    pub block: Block,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportUserDefined {
    pub schema_ref: Option<String>,
    pub schema_id: Option<Uuid>,
    pub schema_version: Option<i32>,
    /// Overlay payload for the block, `{}` when there is none.
    pub data: JsonValue,
}

/// One exported line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRecord {
    pub immutable: ExportImmutable,
    pub user_defined: ExportUserDefined,
}

/// Build one record per block, in block order.
///
/// `overlays` and `schema` are the run's; pass an empty slice and `None` to
/// export the bare representation. A block with several overlays exports
/// the first one.
pub fn build_records(
    document: &SourceDocument,
    representation: &ConversionRepresentation,
    blocks: &[Block],
    schema: Option<&Schema>,
    overlays: &[Overlay],
) -> Vec<ExportRecord> {
    let mut by_block: HashMap<Uuid, &JsonValue> = HashMap::new();
    for overlay in overlays {
        by_block.entry(overlay.block_id).or_insert(&overlay.payload);
    }

    let source = ExportSource {
        document_id: document.id,
        project_id: document.project_id,
        title: document.title.clone(),
        source_type: document.source_type.clone(),
        locator: document.locator.clone(),
        content_hash: document.content_hash.clone(),
        ingested_at: document.created_at,
    };
    let conversion = ExportConversion {
        representation_id: representation.id,
        parsing_tool: representation.parsing_tool.clone(),
        schema_version: representation.schema_version.clone(),
        content_hash: representation.content_hash.clone(),
        block_count: representation.block_count,
        block_type_freq: representation.block_type_freq.clone(),
        total_characters: representation.total_characters,
        parsed_at: representation.parsed_at,
    };

    let mut ordered: Vec<&Block> = blocks.iter().collect();
    ordered.sort_by_key(|b| b.order_index);

    ordered
        .into_iter()
        .map(|block| ExportRecord {
            immutable: ExportImmutable {
                source: source.clone(),
                conversion: conversion.clone(),
                block: block.clone(),
            },
            user_defined: ExportUserDefined {
                schema_ref: schema.map(|s| s.schema_ref.clone()),
                schema_id: schema.map(|s| s.id),
                schema_version: schema.map(|s| s.version),
                data: by_block
                    .get(&block.id)
                    .map(|p| (*p).clone())
                    .unwrap_or_else(|| json!({})),
            },
        })
        .collect()
}

/// Serialize records as newline-delimited JSON, one record per line.
pub fn to_jsonl(records: &[ExportRecord]) -> Result<String> {
    let mut out = String::new();
    for record in records {
        out.push_str(&serde_json::to_string(record)?);
        out.push('\n');
    }
    Ok(out)
}
