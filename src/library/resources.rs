//! Hash-keyed resource store
//!
//! Every managed file is indexed by its lowercase SHA-256 digest. The store
//! keeps insertion order for listings, answers reverse lookups by model
//! version and by local path, and writes through to the settings store after
//! every mutation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::settings::SettingsStore;

/// A model file the agent manages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// Lowercase SHA-256 of the file contents
    pub hash: String,
    /// File name, including extension
    pub name: String,
    /// Display name of the model this file belongs to
    pub model_name: String,
    /// Display name of the model version
    pub model_version_name: String,
    #[serde(rename = "type")]
    pub kind: ResourceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version_id: Option<i64>,
    /// Set when the file is stored in the user's vault
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vault_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Model,
    Lora,
    Lycoris,
    /// Anything the hub sends that we do not recognize
    #[serde(other)]
    Default,
}

impl Resource {
    /// Build a resource record for a file that appeared locally, before the
    /// hub has told us anything about it.
    pub fn from_local_file(path: &Path, hash: String) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().into_owned();
        let model_name = path.file_stem()?.to_string_lossy().into_owned();

        let kind = match path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_lowercase())
            .as_deref()
        {
            Some("lora") | Some("loras") => ResourceKind::Lora,
            Some("lycoris") => ResourceKind::Lycoris,
            _ => ResourceKind::Model,
        };

        Some(Self {
            hash: hash.to_lowercase(),
            name,
            model_name,
            model_version_name: String::new(),
            kind,
            url: None,
            model_version_id: None,
            vault_id: None,
            local_path: Some(path.to_path_buf()),
        })
    }
}

#[derive(Default)]
struct ResourceIndex {
    entries: HashMap<String, Resource>,
    /// Hashes in the order they were first added
    order: Vec<String>,
}

/// Shared resource index, loaded from and persisted through the settings
/// store.
pub struct ResourceStore {
    inner: RwLock<ResourceIndex>,
    settings: Arc<SettingsStore>,
}

impl ResourceStore {
    pub async fn new(settings: Arc<SettingsStore>) -> Self {
        let mut index = ResourceIndex::default();
        for resource in settings.resources().await {
            let hash = resource.hash.to_lowercase();
            if index.entries.insert(hash.clone(), resource).is_none() {
                index.order.push(hash);
            }
        }

        Self {
            inner: RwLock::new(index),
            settings,
        }
    }

    /// All resources, in insertion order.
    pub async fn list(&self) -> Vec<Resource> {
        let index = self.inner.read().await;
        index
            .order
            .iter()
            .filter_map(|hash| index.entries.get(hash).cloned())
            .collect()
    }

    pub async fn lookup(&self, hash: &str) -> Option<Resource> {
        let index = self.inner.read().await;
        index.entries.get(&hash.to_lowercase()).cloned()
    }

    /// First resource carrying the given model version id, in insertion
    /// order.
    pub async fn lookup_by_model_version(&self, model_version_id: i64) -> Option<Resource> {
        let index = self.inner.read().await;
        index
            .order
            .iter()
            .filter_map(|hash| index.entries.get(hash))
            .find(|resource| resource.model_version_id == Some(model_version_id))
            .cloned()
    }

    pub async fn lookup_by_path(&self, path: &Path) -> Option<Resource> {
        let index = self.inner.read().await;
        index
            .order
            .iter()
            .filter_map(|hash| index.entries.get(hash))
            .find(|resource| resource.local_path.as_deref() == Some(path))
            .cloned()
    }

    /// Insert or replace a resource. A replaced entry keeps its position in
    /// the listing order.
    pub async fn upsert(&self, mut resource: Resource) -> Result<()> {
        resource.hash = resource.hash.to_lowercase();

        let snapshot = {
            let mut index = self.inner.write().await;
            let hash = resource.hash.clone();
            if index.entries.insert(hash.clone(), resource).is_none() {
                index.order.push(hash);
            }
            collect(&index)
        };

        self.settings.put_resources(snapshot).await
    }

    pub async fn remove(&self, hash: &str) -> Result<Option<Resource>> {
        let hash = hash.to_lowercase();

        let (removed, snapshot) = {
            let mut index = self.inner.write().await;
            let removed = index.entries.remove(&hash);
            if removed.is_some() {
                index.order.retain(|h| h != &hash);
            }
            (removed, collect(&index))
        };

        if removed.is_some() {
            self.settings.put_resources(snapshot).await?;
        }

        Ok(removed)
    }

    /// Remove whichever resource points at `path`, if any. Used by the
    /// reconciler when a watched file disappears.
    pub async fn remove_by_path(&self, path: &Path) -> Result<Option<Resource>> {
        let hash = match self.lookup_by_path(path).await {
            Some(resource) => resource.hash,
            None => return Ok(None),
        };

        let removed = self.remove(&hash).await?;
        if let Some(resource) = &removed {
            debug!(hash = %resource.hash, path = %path.display(), "Removed resource for vanished file");
        }

        Ok(removed)
    }

    /// Update the vault membership marker on an existing resource.
    pub async fn set_vault_id(&self, hash: &str, vault_id: Option<i64>) -> Result<Option<Resource>> {
        let hash = hash.to_lowercase();

        let (updated, snapshot) = {
            let mut index = self.inner.write().await;
            let updated = match index.entries.get_mut(&hash) {
                Some(resource) => {
                    resource.vault_id = vault_id;
                    Some(resource.clone())
                }
                None => None,
            };
            (updated, collect(&index))
        };

        if updated.is_some() {
            self.settings.put_resources(snapshot).await?;
        }

        Ok(updated)
    }
}

fn collect(index: &ResourceIndex) -> Vec<Resource> {
    index
        .order
        .iter()
        .filter_map(|hash| index.entries.get(hash).cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn resource(hash: &str, name: &str) -> Resource {
        Resource {
            hash: hash.to_string(),
            name: name.to_string(),
            model_name: name.trim_end_matches(".safetensors").to_string(),
            model_version_name: "v1.0".to_string(),
            kind: ResourceKind::Model,
            url: None,
            model_version_id: None,
            vault_id: None,
            local_path: None,
        }
    }

    async fn store(dir: &TempDir) -> ResourceStore {
        let settings = Arc::new(SettingsStore::load(dir.path().join("settings.json")).unwrap());
        ResourceStore::new(settings).await
    }

    #[tokio::test]
    async fn test_list_keeps_insertion_order() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        store.upsert(resource("CCC", "c.safetensors")).await.unwrap();
        store.upsert(resource("AAA", "a.safetensors")).await.unwrap();
        store.upsert(resource("BBB", "b.safetensors")).await.unwrap();

        let names: Vec<String> = store.list().await.into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["c.safetensors", "a.safetensors", "b.safetensors"]);
    }

    #[tokio::test]
    async fn test_upsert_replaces_in_place() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        store.upsert(resource("AAA", "a.safetensors")).await.unwrap();
        store.upsert(resource("BBB", "b.safetensors")).await.unwrap();

        let mut replacement = resource("AAA", "a-renamed.safetensors");
        replacement.model_version_id = Some(42);
        store.upsert(replacement).await.unwrap();

        let listed = store.list().await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name, "a-renamed.safetensors");
        assert_eq!(listed[0].model_version_id, Some(42));
    }

    #[tokio::test]
    async fn test_lookup_is_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        store
            .upsert(resource("AbCdEf0123", "m.safetensors"))
            .await
            .unwrap();

        let found = store.lookup("ABCDEF0123").await.unwrap();
        assert_eq!(found.hash, "abcdef0123");
    }

    #[tokio::test]
    async fn test_lookup_by_model_version_prefers_earliest() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        let mut first = resource("AAA", "a.safetensors");
        first.model_version_id = Some(7);
        let mut second = resource("BBB", "b.safetensors");
        second.model_version_id = Some(7);

        store.upsert(first).await.unwrap();
        store.upsert(second).await.unwrap();

        let found = store.lookup_by_model_version(7).await.unwrap();
        assert_eq!(found.hash, "aaa");
    }

    #[tokio::test]
    async fn test_remove_by_path() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        let mut tracked = resource("AAA", "a.safetensors");
        tracked.local_path = Some(dir.path().join("a.safetensors"));
        store.upsert(tracked).await.unwrap();

        let removed = store
            .remove_by_path(&dir.path().join("a.safetensors"))
            .await
            .unwrap();
        assert!(removed.is_some());
        assert!(store.list().await.is_empty());

        let missing = store
            .remove_by_path(&dir.path().join("unknown.safetensors"))
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_persists_across_reload() {
        let dir = TempDir::new().unwrap();
        let settings_path = dir.path().join("settings.json");

        {
            let settings = Arc::new(SettingsStore::load(&settings_path).unwrap());
            let store = ResourceStore::new(settings).await;
            store.upsert(resource("AAA", "a.safetensors")).await.unwrap();
            store.upsert(resource("BBB", "b.safetensors")).await.unwrap();
            store.remove("AAA").await.unwrap();
        }

        let settings = Arc::new(SettingsStore::load(&settings_path).unwrap());
        let store = ResourceStore::new(settings).await;
        let listed = store.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].hash, "bbb");
    }

    #[tokio::test]
    async fn test_set_vault_id() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        store.upsert(resource("AAA", "a.safetensors")).await.unwrap();

        let updated = store.set_vault_id("aaa", Some(99)).await.unwrap().unwrap();
        assert_eq!(updated.vault_id, Some(99));
        assert_eq!(store.lookup("aaa").await.unwrap().vault_id, Some(99));

        let cleared = store.set_vault_id("aaa", None).await.unwrap().unwrap();
        assert_eq!(cleared.vault_id, None);

        assert!(store.set_vault_id("zzz", Some(1)).await.unwrap().is_none());
    }

    #[test]
    fn test_from_local_file_infers_kind() {
        let model = Resource::from_local_file(
            Path::new("/models/checkpoint.safetensors"),
            "AAA".to_string(),
        )
        .unwrap();
        assert_eq!(model.kind, ResourceKind::Model);
        assert_eq!(model.name, "checkpoint.safetensors");
        assert_eq!(model.model_name, "checkpoint");
        assert_eq!(model.hash, "aaa");

        let lora =
            Resource::from_local_file(Path::new("/models/lora/style.safetensors"), "BBB".to_string())
                .unwrap();
        assert_eq!(lora.kind, ResourceKind::Lora);

        let lycoris = Resource::from_local_file(
            Path::new("/models/lycoris/detail.safetensors"),
            "CCC".to_string(),
        )
        .unwrap();
        assert_eq!(lycoris.kind, ResourceKind::Lycoris);
    }
}
