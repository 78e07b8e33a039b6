//! Local model library
//!
//! In-memory indexes over the files the agent manages, persisted through the
//! settings store:
//! - Resource store: hash-keyed index of model files with reverse lookups
//! - Activity log: append-only record of downloads, removals and vault moves

pub mod activities;
pub mod resources;

pub use activities::{Activity, ActivityKind, ActivityLog};
pub use resources::{Resource, ResourceKind, ResourceStore};
