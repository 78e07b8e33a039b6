//! Activity log
//!
//! Append-only record of what the agent did to the library. Listings are
//! most recent first; the hub renders them verbatim.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::settings::SettingsStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    /// Model name the entry refers to
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    /// ISO-8601 timestamp with millisecond precision
    pub date: String,
    /// Bytes transferred, set on completed downloads
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_length: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityKind {
    #[serde(rename = "downloaded")]
    Downloaded,
    #[serde(rename = "cancelled")]
    Cancelled,
    #[serde(rename = "removed")]
    Removed,
    #[serde(rename = "added vault")]
    AddedVault,
    #[serde(rename = "removed vault")]
    RemovedVault,
}

impl Activity {
    pub fn new(name: impl Into<String>, kind: ActivityKind) -> Self {
        Self {
            name: name.into(),
            kind,
            date: timestamp(),
            total_length: None,
        }
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Shared activity log, persisted through the settings store.
pub struct ActivityLog {
    inner: RwLock<VecDeque<Activity>>,
    settings: Arc<SettingsStore>,
}

impl ActivityLog {
    pub async fn new(settings: Arc<SettingsStore>) -> Self {
        let entries: VecDeque<Activity> = settings.activities().await.into();

        Self {
            inner: RwLock::new(entries),
            settings,
        }
    }

    /// Append an entry at the head of the log.
    pub async fn record(&self, activity: Activity) -> Result<()> {
        let snapshot = {
            let mut entries = self.inner.write().await;
            entries.push_front(activity);
            entries.iter().cloned().collect()
        };

        self.settings.put_activities(snapshot).await
    }

    /// All entries, most recent first.
    pub async fn list(&self) -> Vec<Activity> {
        self.inner.read().await.iter().cloned().collect()
    }

    pub async fn clear(&self) -> Result<()> {
        self.inner.write().await.clear();
        self.settings.put_activities(Vec::new()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn log(dir: &TempDir) -> ActivityLog {
        let settings = Arc::new(SettingsStore::load(dir.path().join("settings.json")).unwrap());
        ActivityLog::new(settings).await
    }

    #[tokio::test]
    async fn test_list_is_most_recent_first() {
        let dir = TempDir::new().unwrap();
        let log = log(&dir).await;

        log.record(Activity::new("first", ActivityKind::Downloaded))
            .await
            .unwrap();
        log.record(Activity::new("second", ActivityKind::Removed))
            .await
            .unwrap();
        log.record(Activity::new("third", ActivityKind::Downloaded))
            .await
            .unwrap();

        let names: Vec<String> = log.list().await.into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn test_clear() {
        let dir = TempDir::new().unwrap();
        let log = log(&dir).await;

        log.record(Activity::new("first", ActivityKind::Downloaded))
            .await
            .unwrap();
        log.clear().await.unwrap();

        assert!(log.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_persists_across_reload() {
        let dir = TempDir::new().unwrap();
        let settings_path = dir.path().join("settings.json");

        {
            let settings = Arc::new(SettingsStore::load(&settings_path).unwrap());
            let log = ActivityLog::new(settings).await;
            let mut entry = Activity::new("model-a", ActivityKind::Downloaded);
            entry.total_length = Some(1024);
            log.record(entry).await.unwrap();
            log.record(Activity::new("model-b", ActivityKind::Removed))
                .await
                .unwrap();
        }

        let settings = Arc::new(SettingsStore::load(&settings_path).unwrap());
        let log = ActivityLog::new(settings).await;
        let entries = log.list().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "model-b");
        assert_eq!(entries[1].name, "model-a");
        assert_eq!(entries[1].total_length, Some(1024));
    }

    #[test]
    fn test_activity_kind_wire_names() {
        let added = serde_json::to_string(&ActivityKind::AddedVault).unwrap();
        assert_eq!(added, "\"added vault\"");

        let parsed: ActivityKind = serde_json::from_str("\"removed vault\"").unwrap();
        assert_eq!(parsed, ActivityKind::RemovedVault);
    }
}
