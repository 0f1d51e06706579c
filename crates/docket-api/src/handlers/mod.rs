//! HTTP handlers, grouped by resource.

pub mod documents;
pub mod events;
pub mod projects;
pub mod runs;
pub mod schemas;
pub mod system;
