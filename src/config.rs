//! Agent configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub agent: AgentConfig,
    pub hub: HubConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Data directory holding runtime settings and the persisted library
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// WebSocket endpoint of the hub's link service
    #[serde(default = "default_socket_url")]
    pub socket_url: String,

    /// Base URL of the hub's HTTP API (vault operations)
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// API token sent as a bearer credential on vault requests
    #[serde(default)]
    pub api_token: Option<String>,
}

/// Reconnect backoff applied after the link drops
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first retry in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Cap for the doubling retry delay in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

// Defaults
fn default_socket_url() -> String {
    "ws://127.0.0.1:3000/link".to_string()
}
fn default_api_url() -> String {
    "http://127.0.0.1:3000".to_string()
}
fn default_initial_delay() -> u64 {
    1_000
}
fn default_max_delay() -> u64 {
    60_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent: AgentConfig {
                data_dir: PathBuf::from("/var/lib/hublink"),
            },
            hub: HubConfig {
                socket_url: default_socket_url(),
                api_url: default_api_url(),
                api_token: None,
            },
            reconnect: ReconnectConfig::default(),
        }
    }
}
