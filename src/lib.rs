//! hublink: Desktop link agent that keeps a local model library in sync with a remote hub
//!
//! The agent holds one persistent connection to the hub's link service and provides:
//! - Remote command execution (list/add/remove resources, activity queries, generation)
//! - A hash-keyed local resource store with an append-only activity log
//! - Filesystem reconciliation for the configured model directory
//! - The vault toggle flow against the hub's HTTP API

pub mod commands;
pub mod config;
pub mod fetch;
pub mod hub;
pub mod library;
pub mod link;
pub mod settings;
pub mod ui;
pub mod watcher;
