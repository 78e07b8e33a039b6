//! Runtime settings store
//!
//! JSON-backed state that survives restarts: link credentials, the watched
//! model directory, and the persisted library contents. Writes go through a
//! temp file plus rename so a crash never leaves a half-written file. Root
//! path changes are published on a watch channel for the reconciler.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tracing::debug;

use crate::library::{Activity, Resource};

/// On-disk settings document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Short link key the user pairs with
    pub key: Option<String>,
    /// Long-lived key issued by the hub after the first join
    pub upgrade_key: Option<String>,
    /// Directory the reconciler watches for model files
    pub root_resource_path: Option<PathBuf>,
    /// Persisted resource store contents, in insertion order
    pub resources: Vec<Resource>,
    /// Persisted activity log, most recent first
    pub activities: Vec<Activity>,
}

/// Owns the settings document and its persistence.
///
/// One instance is created at startup and shared between components. All
/// mutation goes through the async setters, which write the file before
/// returning.
pub struct SettingsStore {
    path: PathBuf,
    state: RwLock<Settings>,
    root_path_tx: watch::Sender<Option<PathBuf>>,
}

impl SettingsStore {
    /// Load settings from `path`, or start from defaults when the file does
    /// not exist yet.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings: Settings = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading settings from {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("parsing settings at {}", path.display()))?
        } else {
            Settings::default()
        };

        let (root_path_tx, _) = watch::channel(settings.root_resource_path.clone());

        Ok(Self {
            path,
            state: RwLock::new(settings),
            root_path_tx,
        })
    }

    pub async fn key(&self) -> Option<String> {
        self.state.read().await.key.clone()
    }

    pub async fn set_key(&self, key: Option<String>) -> Result<()> {
        let mut state = self.state.write().await;
        state.key = key;
        self.persist(&state)
    }

    pub async fn upgrade_key(&self) -> Option<String> {
        self.state.read().await.upgrade_key.clone()
    }

    pub async fn set_upgrade_key(&self, key: Option<String>) -> Result<()> {
        let mut state = self.state.write().await;
        state.upgrade_key = key;
        self.persist(&state)
    }

    pub async fn root_resource_path(&self) -> Option<PathBuf> {
        self.state.read().await.root_resource_path.clone()
    }

    /// Point the reconciler at a new model directory.
    ///
    /// Empty paths are ignored, matching the pairing UI which submits an
    /// empty string when the folder dialog is dismissed.
    pub async fn set_root_resource_path(&self, path: PathBuf) -> Result<()> {
        if path.as_os_str().is_empty() {
            debug!("Ignoring empty root resource path");
            return Ok(());
        }

        let mut state = self.state.write().await;
        state.root_resource_path = Some(path.clone());
        self.persist(&state)?;
        drop(state);

        self.root_path_tx.send_replace(Some(path));
        Ok(())
    }

    /// Watch channel carrying the current root path; the reconciler re-targets
    /// on every change.
    pub fn subscribe_root_path(&self) -> watch::Receiver<Option<PathBuf>> {
        self.root_path_tx.subscribe()
    }

    pub async fn resources(&self) -> Vec<Resource> {
        self.state.read().await.resources.clone()
    }

    pub async fn put_resources(&self, resources: Vec<Resource>) -> Result<()> {
        let mut state = self.state.write().await;
        state.resources = resources;
        self.persist(&state)
    }

    pub async fn activities(&self) -> Vec<Activity> {
        self.state.read().await.activities.clone()
    }

    pub async fn put_activities(&self, activities: Vec<Activity>) -> Result<()> {
        let mut state = self.state.write().await;
        state.activities = activities;
        self.persist(&state)
    }

    /// Wipe everything back to defaults, including credentials and the
    /// persisted library.
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.state.write().await;
        *state = Settings::default();
        self.persist(&state)?;
        drop(state);

        self.root_path_tx.send_replace(None);
        Ok(())
    }

    fn persist(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let content = serde_json::to_string_pretty(settings).context("encoding settings")?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, content).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;

        Ok(())
    }
}
