//! Content hashing, block-set fingerprints, and schema ref slugs.
//!
//! Every hash is lowercase hex SHA-256. Inputs that are JSON are first
//! rendered in canonical form (object keys sorted, no insignificant
//! whitespace) so that semantically equal definitions hash equally.

use regex::Regex;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

use crate::defaults::{SCHEMA_REF_FALLBACK, SCHEMA_REF_MAX_LEN};
use crate::models::{Block, RepresentationContent};

/// SHA-256 of `bytes` as lowercase hex.
pub fn sha256_hex(bytes: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(bytes.as_ref()))
}

/// Source content hash, scoped by source type so that identical bytes
/// uploaded as different formats are distinct documents.
pub fn source_content_hash(source_type: &str, bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_type.as_bytes());
    hasher.update(b"\n");
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash of a representation payload together with the tool that produced it.
pub fn representation_hash(parsing_tool: &str, content: &RepresentationContent) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parsing_tool.as_bytes());
    hasher.update(b"\n");
    hasher.update(content.format_name().as_bytes());
    hasher.update(b"\n");
    match content {
        RepresentationContent::Markdown { text } => hasher.update(text.as_bytes()),
        RepresentationContent::Segments { segments } => {
            for segment in segments {
                hasher.update(segment.block_type.as_bytes());
                hasher.update(b"\0");
                hasher.update(segment.section_path.join("\u{1f}").as_bytes());
                hasher.update(b"\0");
                hasher.update(segment.text.as_bytes());
                hasher.update(b"\n");
            }
        }
    }
    hex::encode(hasher.finalize())
}

/// Hash of a single block's content, qualified by its type.
pub fn block_content_hash(block_type: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(block_type.as_bytes());
    hasher.update(b"\n");
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Fingerprint of an ordered block set.
///
/// Depends only on the ordered content hashes, so a reparse that produces
/// the same blocks yields the same fingerprint and a run can be reused.
pub fn fingerprint<'a>(content_hashes: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for (idx, hash) in content_hashes.into_iter().enumerate() {
        if idx > 0 {
            hasher.update(b"\n");
        }
        hasher.update(hash.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Fingerprint of a block slice in order-index order.
pub fn block_set_fingerprint(blocks: &[Block]) -> String {
    let mut ordered: Vec<&Block> = blocks.iter().collect();
    ordered.sort_by_key(|b| b.order_index);
    fingerprint(ordered.iter().map(|b| b.content_hash.as_str()))
}

/// Canonical JSON rendering with recursively sorted object keys.
pub fn stable_json(value: &JsonValue) -> String {
    fn canonical(value: &JsonValue) -> JsonValue {
        match value {
            JsonValue::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut out = serde_json::Map::with_capacity(map.len());
                for k in keys {
                    out.insert(k.clone(), canonical(&map[k]));
                }
                JsonValue::Object(out)
            }
            JsonValue::Array(items) => JsonValue::Array(items.iter().map(canonical).collect()),
            other => other.clone(),
        }
    }
    // serde_json::Map preserves insertion order only with `preserve_order`;
    // without it the map is a BTreeMap and already sorted. Canonicalize
    // anyway so the output is independent of feature unification.
    canonical(value).to_string()
}

/// Hash of a schema definition in canonical form.
pub fn definition_hash(definition: &JsonValue) -> String {
    sha256_hex(stable_json(definition))
}

fn non_slug_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9_-]+").expect("static regex"))
}

fn repeated_underscores() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"_{2,}").expect("static regex"))
}

/// Normalize free text into a schema ref slug.
///
/// Lowercases, replaces runs of disallowed characters with `_`, collapses
/// repeated underscores, trims leading/trailing underscores, and truncates
/// to [`SCHEMA_REF_MAX_LEN`]. Returns [`SCHEMA_REF_FALLBACK`] for empty input.
pub fn slugify(input: &str) -> String {
    let lowered = input.trim().to_lowercase();
    let replaced = non_slug_chars().replace_all(&lowered, "_");
    let collapsed = repeated_underscores().replace_all(&replaced, "_");
    let trimmed = collapsed.trim_matches('_');
    let truncated: String = trimmed.chars().take(SCHEMA_REF_MAX_LEN).collect();
    let truncated = truncated.trim_end_matches('_');
    if truncated.is_empty() {
        SCHEMA_REF_FALLBACK.to_string()
    } else {
        truncated.to_string()
    }
}

/// Derive a schema ref from a definition's `$id` (last path segment, minus
/// extension) or `title`.
pub fn derive_schema_ref(definition: &JsonValue) -> String {
    if let Some(id) = definition.get("$id").and_then(JsonValue::as_str) {
        let tail = id
            .trim_end_matches('/')
            .rsplit(['/', '#', ':'])
            .next()
            .unwrap_or(id);
        let stem = tail.strip_suffix(".json").unwrap_or(tail);
        let stem = stem.strip_suffix(".schema").unwrap_or(stem);
        if !stem.is_empty() {
            return slugify(stem);
        }
    }
    if let Some(title) = definition.get("title").and_then(JsonValue::as_str) {
        return slugify(title);
    }
    SCHEMA_REF_FALLBACK.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sha256_hex_known_value() {
        assert_eq!(
            sha256_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_source_content_hash_scoped_by_type() {
        let a = source_content_hash("md", b"hello");
        let b = source_content_hash("txt", b"hello");
        assert_ne!(a, b);
        assert_eq!(a, source_content_hash("md", b"hello"));
    }

    #[test]
    fn test_fingerprint_is_order_sensitive() {
        let a = fingerprint(["h1", "h2"]);
        let b = fingerprint(["h2", "h1"]);
        assert_ne!(a, b);
        assert_eq!(a, fingerprint(["h1", "h2"]));
        // separator prevents concatenation collisions
        assert_ne!(fingerprint(["ab", "c"]), fingerprint(["a", "bc"]));
    }

    #[test]
    fn test_stable_json_sorts_nested_keys() {
        let a = json!({"b": 1, "a": {"d": [1, {"z": 0, "y": 1}], "c": null}});
        let b = json!({"a": {"c": null, "d": [1, {"y": 1, "z": 0}]}, "b": 1});
        assert_eq!(stable_json(&a), stable_json(&b));
        assert_eq!(definition_hash(&a), definition_hash(&b));
        assert!(stable_json(&a).starts_with(r#"{"a":{"c":null"#));
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Invoice Fields"), "invoice_fields");
        assert_eq!(slugify("  --Contract__Terms!!v2 "), "--contract_terms_v2");
        assert_eq!(slugify("___"), "schema");
        assert_eq!(slugify(""), "schema");
        assert_eq!(slugify(&"x".repeat(100)).len(), SCHEMA_REF_MAX_LEN);
    }

    #[test]
    fn test_derive_schema_ref() {
        assert_eq!(
            derive_schema_ref(&json!({"$id": "https://example.com/schemas/Invoice.schema.json"})),
            "invoice"
        );
        assert_eq!(derive_schema_ref(&json!({"title": "Key Dates"})), "key_dates");
        assert_eq!(derive_schema_ref(&json!({"type": "object"})), "schema");
    }

    #[test]
    fn test_representation_hash_depends_on_tool() {
        let content = RepresentationContent::Markdown {
            text: "# A".into(),
        };
        assert_ne!(
            representation_hash("markdown", &content),
            representation_hash("docling", &content)
        );
    }
}
