//! # docket-core
//!
//! Core types, traits, and abstractions for the docket document conversion
//! and schema-run annotation pipeline.
//!
//! This crate provides the data model, the error taxonomy, the repository and
//! capability traits implemented by `docket-db` and `docket-pipeline`, and the
//! [`ChangeNotifier`] that propagates committed state changes to subscribers.

pub mod defaults;
pub mod error;
pub mod events;
pub mod hashing;
pub mod logging;
pub mod models;
pub mod tables;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use events::{
    ChangeNotifier, EventActor, EventContext, EventEnvelope, PipelineEvent, ScopeFilter,
    Subscription, SubscriptionItem,
};
pub use models::*;
pub use tables::TableNames;
pub use traits::*;
pub use uuid_utils::{block_id, new_v7};
