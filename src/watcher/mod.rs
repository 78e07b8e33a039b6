//! Filesystem reconciler
//!
//! Watches the configured model directory and keeps the resource store
//! honest: files that appear get hashed and indexed, files that vanish get
//! dropped. Re-targeting tears the old watcher down completely before the
//! new one arms, so a stale reconcile can never land after the switch.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fetch::file_sha256;
use crate::library::{Resource, ResourceStore};
use crate::ui::{UiEvent, UiNotifier};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Failed to watch {path}: {message}")]
    Setup { path: PathBuf, message: String },
}

/// Follow the root path setting, watching whichever directory it points at.
pub async fn run(
    mut root_rx: watch::Receiver<Option<PathBuf>>,
    resources: Arc<ResourceStore>,
    ui: UiNotifier,
    shutdown: CancellationToken,
) {
    let mut handle: Option<WatchHandle> = None;

    loop {
        let root = root_rx.borrow_and_update().clone();

        // Old watcher down first; its last reconcile finishes before the
        // new root arms.
        if let Some(active) = handle.take() {
            active.shutdown().await;
        }

        if let Some(root) = &root {
            match arm(root.clone(), resources.clone(), ui.clone()) {
                Ok(armed) => {
                    info!(root = %root.display(), "Watching model directory");
                    handle = Some(armed);
                }
                Err(err) => {
                    warn!(error = %err, "Could not arm the directory watcher");
                    ui.notify(UiEvent::Error {
                        message: err.to_string(),
                    });
                }
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = root_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(active) = handle.take() {
        active.shutdown().await;
    }
    debug!("Reconciler stopped");
}

struct WatchHandle {
    token: CancellationToken,
    forwarder: std::thread::JoinHandle<()>,
    consumer: tokio::task::JoinHandle<()>,
}

impl WatchHandle {
    /// Stop watching and wait for in-progress reconciles to finish.
    async fn shutdown(self) {
        let WatchHandle {
            token,
            forwarder,
            consumer,
        } = self;

        token.cancel();
        if let Err(err) = consumer.await {
            warn!(error = %err, "Reconcile task panicked");
        }
        let _ = tokio::task::spawn_blocking(move || forwarder.join()).await;
    }
}

fn arm(
    root: PathBuf,
    resources: Arc<ResourceStore>,
    ui: UiNotifier,
) -> Result<WatchHandle, WatchError> {
    let (raw_tx, raw_rx) = std::sync::mpsc::channel();
    let mut watcher =
        RecommendedWatcher::new(raw_tx, NotifyConfig::default()).map_err(|e| WatchError::Setup {
            path: root.clone(),
            message: e.to_string(),
        })?;
    watcher
        .watch(&root, RecursiveMode::Recursive)
        .map_err(|e| WatchError::Setup {
            path: root.clone(),
            message: e.to_string(),
        })?;

    let token = CancellationToken::new();
    let (event_tx, event_rx) = mpsc::channel(256);

    // The notify watcher lives on this thread; dropping it on exit releases
    // the OS watches. recv_timeout keeps the loop responsive to the token.
    let forward_token = token.clone();
    let forwarder = std::thread::spawn(move || {
        let _watcher = watcher;
        while !forward_token.is_cancelled() {
            match raw_rx.recv_timeout(Duration::from_millis(250)) {
                Ok(Ok(event)) => {
                    if event_tx.blocking_send(event).is_err() {
                        break;
                    }
                }
                Ok(Err(err)) => warn!(error = %err, "Watch error"),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
    });

    let consumer = tokio::spawn(consume(root, event_rx, resources, ui, token.clone()));

    Ok(WatchHandle {
        token,
        forwarder,
        consumer,
    })
}

async fn consume(
    root: PathBuf,
    mut events: mpsc::Receiver<Event>,
    resources: Arc<ResourceStore>,
    ui: UiNotifier,
    cancel: CancellationToken,
) {
    // Index whatever is already on disk; the OS only reports changes.
    if scan(&root, &resources, &cancel).await {
        ui.notify(UiEvent::ResourcesChanged);
    }

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let mut changed = false;
        for path in &event.paths {
            if !should_track(&root, path) {
                continue;
            }
            match tokio::fs::metadata(path).await {
                Ok(meta) if meta.is_file() => {
                    if reconcile_present(path, &resources).await {
                        changed = true;
                    }
                }
                Ok(meta) if meta.is_dir() => {
                    // A directory moved in arrives as one event
                    if scan(path, &resources, &cancel).await {
                        changed = true;
                    }
                }
                Ok(_) => {}
                Err(_) => {
                    if reconcile_missing(path, &resources).await {
                        changed = true;
                    }
                }
            }
        }

        if changed {
            ui.notify(UiEvent::ResourcesChanged);
        }
    }

    debug!(root = %root.display(), "Reconciler for root stopped");
}

/// Walk `root` and reconcile every regular file found.
async fn scan(root: &Path, resources: &ResourceStore, cancel: &CancellationToken) -> bool {
    let mut changed = false;
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        if cancel.is_cancelled() {
            break;
        }

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "Could not scan directory");
                continue;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !should_track(root, &path) {
                continue;
            }
            match entry.file_type().await {
                Ok(kind) if kind.is_dir() => pending.push(path),
                Ok(kind) if kind.is_file() => {
                    if reconcile_present(&path, resources).await {
                        changed = true;
                    }
                }
                _ => {}
            }
        }
    }

    changed
}

async fn reconcile_present(path: &Path, resources: &ResourceStore) -> bool {
    let hash = match file_sha256(path).await {
        Ok(hash) => hash,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "Could not hash file");
            return false;
        }
    };

    let mut changed = false;

    // A rewritten file keeps its path but changes identity
    if let Some(stale) = resources.lookup_by_path(path).await {
        if stale.hash != hash {
            match resources.remove(&stale.hash).await {
                Ok(Some(_)) => changed = true,
                Ok(None) => {}
                Err(err) => warn!(error = %err, "Failed to drop stale entry"),
            }
        }
    }

    match resources.lookup(&hash).await {
        Some(existing) => {
            if existing.local_path.as_deref() != Some(path) {
                let mut updated = existing;
                updated.local_path = Some(path.to_path_buf());
                match resources.upsert(updated).await {
                    Ok(()) => changed = true,
                    Err(err) => warn!(error = %err, "Failed to update resource path"),
                }
            }
        }
        None => match Resource::from_local_file(path, hash) {
            Some(resource) => {
                info!(path = %path.display(), hash = %resource.hash, "Indexed new file");
                match resources.upsert(resource).await {
                    Ok(()) => changed = true,
                    Err(err) => warn!(error = %err, "Failed to index file"),
                }
            }
            None => {}
        },
    }

    changed
}

async fn reconcile_missing(path: &Path, resources: &ResourceStore) -> bool {
    match resources.remove_by_path(path).await {
        Ok(Some(removed)) => {
            info!(path = %path.display(), hash = %removed.hash, "Dropped entry for removed file");
            return true;
        }
        Ok(None) => {}
        Err(err) => {
            warn!(error = %err, "Failed to drop resource");
            return false;
        }
    }

    // No exact entry; a directory may have vanished with files inside
    let mut changed = false;
    for resource in resources.list().await {
        let Some(local) = resource.local_path.clone() else {
            continue;
        };
        if local.starts_with(path) {
            match resources.remove(&resource.hash).await {
                Ok(Some(_)) => {
                    info!(path = %local.display(), hash = %resource.hash, "Dropped entry under removed directory");
                    changed = true;
                }
                Ok(None) => {}
                Err(err) => warn!(error = %err, "Failed to drop resource"),
            }
        }
    }

    changed
}

/// Hidden path components and partial downloads never enter the library,
/// whether a file arrives by scan or by live event.
fn should_track(root: &Path, path: &Path) -> bool {
    let Ok(relative) = path.strip_prefix(root) else {
        return false;
    };
    for component in relative.components() {
        let Some(name) = component.as_os_str().to_str() else {
            return false;
        };
        if name.starts_with('.') || name.ends_with(".download") {
            return false;
        }
    }
    true
}
