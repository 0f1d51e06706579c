//! Versioned table-name registry.
//!
//! Storage layouts are versioned by table name (`documents_v2`, ...). The
//! registry is injected into the Postgres repositories at construction so a
//! deployment can point at a different layout without code changes.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Table names used by the Postgres repositories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableNames {
    pub projects: String,
    pub documents: String,
    pub representations: String,
    pub blocks: String,
    pub schemas: String,
    pub runs: String,
    pub overlays: String,
    pub documents_view: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self::v2()
    }
}

impl TableNames {
    /// Current storage layout.
    pub fn v2() -> Self {
        Self {
            projects: "projects".to_string(),
            documents: "documents_v2".to_string(),
            representations: "conversion_representations_v2".to_string(),
            blocks: "blocks_v2".to_string(),
            schemas: "schemas".to_string(),
            runs: "runs_v2".to_string(),
            overlays: "block_overlays_v2".to_string(),
            documents_view: "documents_view_v2".to_string(),
        }
    }

    /// Load overrides from `DOCKET_TABLE_<NAME>` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut names = Self::v2();
        let overrides: [(&str, &mut String); 8] = [
            ("DOCKET_TABLE_PROJECTS", &mut names.projects),
            ("DOCKET_TABLE_DOCUMENTS", &mut names.documents),
            ("DOCKET_TABLE_REPRESENTATIONS", &mut names.representations),
            ("DOCKET_TABLE_BLOCKS", &mut names.blocks),
            ("DOCKET_TABLE_SCHEMAS", &mut names.schemas),
            ("DOCKET_TABLE_RUNS", &mut names.runs),
            ("DOCKET_TABLE_OVERLAYS", &mut names.overlays),
            ("DOCKET_TABLE_DOCUMENTS_VIEW", &mut names.documents_view),
        ];
        for (var, slot) in overrides {
            if let Ok(value) = std::env::var(var) {
                *slot = value;
            }
        }
        names.validate()?;
        Ok(names)
    }

    /// Every name must be a plain SQL identifier; they are interpolated into queries.
    pub fn validate(&self) -> Result<()> {
        for name in [
            &self.projects,
            &self.documents,
            &self.representations,
            &self.blocks,
            &self.schemas,
            &self.runs,
            &self.overlays,
            &self.documents_view,
        ] {
            if !is_identifier(name) {
                return Err(Error::Config(format!("invalid table name: {:?}", name)));
            }
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
