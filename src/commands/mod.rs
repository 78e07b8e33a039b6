//! Command dispatcher
//!
//! Executes remote commands in arrival order and reports status back over
//! the link. Transfers run on their own tasks so the dispatch loop stays
//! responsive; a registry of in-flight downloads backs the duplicate guard
//! and `activities:cancel`.

pub mod vault;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::fetch::{FetchError, Fetcher, ProgressFn};
use crate::library::{Activity, ActivityKind, ActivityLog, Resource, ResourceKind, ResourceStore};
use crate::link::protocol::{Command, CommandEnvelope, StatusEnvelope};
use crate::link::LinkRequest;
use crate::settings::SettingsStore;
use crate::ui::{UiEvent, UiNotifier};

/// Delegate for `image:txt2img`. The stock build only acknowledges; a real
/// generation backend plugs in here.
#[async_trait]
pub trait TextToImage: Send + Sync {
    async fn generate(&self, params: serde_json::Value) -> anyhow::Result<()>;
}

pub struct NoopGenerator;

#[async_trait]
impl TextToImage for NoopGenerator {
    async fn generate(&self, params: serde_json::Value) -> anyhow::Result<()> {
        info!(params = %params, "No generation backend wired; request dropped");
        Ok(())
    }
}

pub struct CommandDispatcher {
    settings: Arc<SettingsStore>,
    resources: Arc<ResourceStore>,
    activities: Arc<ActivityLog>,
    fetcher: Arc<dyn Fetcher>,
    generator: Arc<dyn TextToImage>,
    link: mpsc::Sender<LinkRequest>,
    ui: UiNotifier,
    /// Hashes with a transfer in flight, with the token that aborts it
    in_flight: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl CommandDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Arc<SettingsStore>,
        resources: Arc<ResourceStore>,
        activities: Arc<ActivityLog>,
        fetcher: Arc<dyn Fetcher>,
        generator: Arc<dyn TextToImage>,
        link: mpsc::Sender<LinkRequest>,
        ui: UiNotifier,
    ) -> Self {
        Self {
            settings,
            resources,
            activities,
            fetcher,
            generator,
            link,
            ui,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn run(self, mut commands: mpsc::Receiver<CommandEnvelope>) {
        while let Some(envelope) = commands.recv().await {
            self.dispatch(envelope).await;
        }

        debug!("Command dispatcher stopped");
    }

    async fn dispatch(&self, envelope: CommandEnvelope) {
        let id = envelope.id;
        match envelope.command {
            Command::ResourcesList => self.resources_list(&id).await,
            Command::ResourcesAdd { resource } => self.resources_add(&id, resource).await,
            Command::ResourcesRemove { resource } => {
                self.resources_remove(&id, &resource.hash).await
            }
            Command::ActivitiesList => self.activities_list(&id).await,
            Command::ActivitiesClear => self.activities_clear(&id).await,
            Command::ActivitiesCancel => self.activities_cancel(&id).await,
            Command::TextToImage { params } => self.txt2img(&id, params).await,
            Command::Unknown => warn!(id = %id, "Ignoring unrecognized command"),
        }
    }

    async fn resources_list(&self, id: &str) {
        let resources = self.resources.list().await;
        self.send_status(
            StatusEnvelope::success(id, "resources:list").with_resources(resources),
        )
        .await;
    }

    async fn resources_add(&self, id: &str, mut resource: Resource) {
        let hash = resource.hash.to_lowercase();
        resource.hash = hash.clone();

        if self.resources.lookup(&hash).await.is_some() {
            debug!(hash = %hash, "Resource already in the library");
            self.ui.notify(UiEvent::Error {
                message: "Resource already exists".to_string(),
            });
            self.send_status(
                StatusEnvelope::error(id, "resources:add", "Resource already exists")
                    .with_resource(resource),
            )
            .await;
            return;
        }

        let Some(url) = resource.url.clone() else {
            self.send_status(
                StatusEnvelope::error(id, "resources:add", "Resource has no download url")
                    .with_resource(resource),
            )
            .await;
            return;
        };

        let Some(root) = self.settings.root_resource_path().await else {
            self.send_status(
                StatusEnvelope::error(id, "resources:add", "No resource directory configured")
                    .with_resource(resource),
            )
            .await;
            return;
        };

        let cancel = CancellationToken::new();
        let duplicate = {
            let mut in_flight = self.in_flight.lock().await;
            if in_flight.contains_key(&hash) {
                true
            } else {
                in_flight.insert(hash.clone(), cancel.clone());
                false
            }
        };
        if duplicate {
            debug!(hash = %hash, "Download already in progress");
            self.ui.notify(UiEvent::Error {
                message: "Resource download already in progress".to_string(),
            });
            self.send_status(
                StatusEnvelope::error(id, "resources:add", "Resource download already in progress")
                    .with_resource(resource),
            )
            .await;
            return;
        }

        let dest = match resource.kind {
            ResourceKind::Lora => root.join("lora").join(&resource.name),
            ResourceKind::Lycoris => root.join("lycoris").join(&resource.name),
            _ => root.join(&resource.name),
        };

        self.send_status(
            StatusEnvelope::processing(id, "resources:add")
                .with_resource(resource.clone())
                .with_progress(0),
        )
        .await;

        let fetcher = self.fetcher.clone();
        let resources = self.resources.clone();
        let activities = self.activities.clone();
        let link = self.link.clone();
        let ui = self.ui.clone();
        let in_flight = self.in_flight.clone();
        let id = id.to_string();

        tokio::spawn(async move {
            let progress: ProgressFn = {
                let link = link.clone();
                let id = id.clone();
                let resource = resource.clone();
                Box::new(move |percent| {
                    let envelope = StatusEnvelope::processing(&id, "resources:add")
                        .with_resource(resource.clone())
                        .with_progress(percent);
                    // Progress is best effort; a full queue just skips a tick
                    let _ = link.try_send(LinkRequest::SendStatus(envelope));
                })
            };

            let outcome = fetcher.fetch(&url, &dest, &hash, cancel, Some(progress)).await;

            match outcome {
                Ok(outcome) => {
                    resource.local_path = Some(outcome.path);
                    if let Err(err) = resources.upsert(resource.clone()).await {
                        error!(error = %err, "Failed to store resource");
                    }

                    let mut activity =
                        Activity::new(resource.model_name.clone(), ActivityKind::Downloaded);
                    activity.total_length = Some(outcome.total_bytes);
                    if let Err(err) = activities.record(activity).await {
                        error!(error = %err, "Failed to record activity");
                    }

                    // The slot frees only after the store entry commits, so
                    // one guard always covers a retried add.
                    in_flight.lock().await.remove(&hash);

                    info!(
                        hash = %hash,
                        name = %resource.name,
                        bytes = outcome.total_bytes,
                        "Resource added"
                    );
                    let envelope = StatusEnvelope::success(&id, "resources:add")
                        .with_resource(resource)
                        .with_progress(100);
                    let _ = link.send(LinkRequest::SendStatus(envelope)).await;
                    ui.notify(UiEvent::ResourcesChanged);
                    ui.notify(UiEvent::ActivitiesChanged);
                }
                Err(FetchError::Canceled) => {
                    in_flight.lock().await.remove(&hash);
                    info!(hash = %hash, name = %resource.name, "Download canceled");
                    if let Err(err) = activities
                        .record(Activity::new(
                            resource.model_name.clone(),
                            ActivityKind::Cancelled,
                        ))
                        .await
                    {
                        error!(error = %err, "Failed to record activity");
                    }

                    let envelope =
                        StatusEnvelope::canceled(&id, "resources:add").with_resource(resource);
                    let _ = link.send(LinkRequest::SendStatus(envelope)).await;
                    ui.notify(UiEvent::ActivitiesChanged);
                }
                Err(err) => {
                    in_flight.lock().await.remove(&hash);
                    warn!(hash = %hash, error = %err, "Download failed");
                    let envelope = StatusEnvelope::error(&id, "resources:add", err.to_string())
                        .with_resource(resource);
                    let _ = link.send(LinkRequest::SendStatus(envelope)).await;
                    ui.notify(UiEvent::Error {
                        message: err.to_string(),
                    });
                }
            }
        });
    }

    async fn resources_remove(&self, id: &str, hash: &str) {
        match self.resources.remove(hash).await {
            Ok(Some(resource)) => {
                if let Some(path) = &resource.local_path {
                    if let Err(err) = tokio::fs::remove_file(path).await {
                        warn!(path = %path.display(), error = %err, "Could not delete file");
                    }
                }

                if let Err(err) = self
                    .activities
                    .record(Activity::new(
                        resource.model_name.clone(),
                        ActivityKind::Removed,
                    ))
                    .await
                {
                    error!(error = %err, "Failed to record activity");
                }

                info!(hash = %resource.hash, name = %resource.name, "Resource removed");
                self.send_status(
                    StatusEnvelope::success(id, "resources:remove").with_resource(resource),
                )
                .await;
                self.ui.notify(UiEvent::ResourcesChanged);
                self.ui.notify(UiEvent::ActivitiesChanged);
            }
            Ok(None) => {
                self.send_status(StatusEnvelope::error(
                    id,
                    "resources:remove",
                    "Resource not found",
                ))
                .await;
            }
            Err(err) => {
                error!(error = %err, "Failed to remove resource");
                self.send_status(StatusEnvelope::error(id, "resources:remove", err.to_string()))
                    .await;
            }
        }
    }

    async fn activities_list(&self, id: &str) {
        let activities = self.activities.list().await;
        self.send_status(
            StatusEnvelope::success(id, "activities:list").with_activities(activities),
        )
        .await;
    }

    async fn activities_clear(&self, id: &str) {
        match self.activities.clear().await {
            Ok(()) => {
                self.send_status(
                    StatusEnvelope::success(id, "activities:clear").with_activities(Vec::new()),
                )
                .await;
                self.ui.notify(UiEvent::ActivitiesChanged);
            }
            Err(err) => {
                error!(error = %err, "Failed to clear activities");
                self.send_status(StatusEnvelope::error(id, "activities:clear", err.to_string()))
                    .await;
            }
        }
    }

    async fn activities_cancel(&self, id: &str) {
        // Signal only; each transfer task drops its own entry once the
        // fetch unwinds.
        let count = {
            let in_flight = self.in_flight.lock().await;
            for cancel in in_flight.values() {
                cancel.cancel();
            }
            in_flight.len()
        };

        if count == 0 {
            self.send_status(StatusEnvelope::error(
                id,
                "activities:cancel",
                "No downloads in progress",
            ))
            .await;
            return;
        }

        info!(count, "Canceling in-flight downloads");
        self.send_status(StatusEnvelope::success(id, "activities:cancel"))
            .await;
    }

    async fn txt2img(&self, id: &str, params: serde_json::Value) {
        self.send_status(StatusEnvelope::processing(id, "image:txt2img"))
            .await;

        let generator = self.generator.clone();
        let link = self.link.clone();
        let id = id.to_string();

        tokio::spawn(async move {
            let envelope = match generator.generate(params).await {
                Ok(()) => StatusEnvelope::success(&id, "image:txt2img"),
                Err(err) => StatusEnvelope::error(&id, "image:txt2img", err.to_string()),
            };
            let _ = link.send(LinkRequest::SendStatus(envelope)).await;
        });
    }

    async fn send_status(&self, envelope: StatusEnvelope) {
        if self
            .link
            .send(LinkRequest::SendStatus(envelope))
            .await
            .is_err()
        {
            warn!("Link manager is gone; dropping status report");
        }
    }
}
