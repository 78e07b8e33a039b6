//! hublink agent binary
//!
//! Wires the stores, the hub link, the command dispatcher and the directory
//! reconciler together, then runs until interrupted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use hublink::commands::{vault, CommandDispatcher, NoopGenerator};
use hublink::config::Config;
use hublink::fetch::HttpFetcher;
use hublink::hub::HubClient;
use hublink::library::{ActivityLog, ResourceStore};
use hublink::link::{self, LinkManager, LinkRequest};
use hublink::settings::SettingsStore;
use hublink::ui::UiNotifier;
use hublink::watcher;

#[derive(Parser, Debug)]
#[command(name = "hublink", about = "Desktop link agent for a remote model hub")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "hublink.toml")]
    config: String,

    /// Override the data directory
    #[arg(long, env = "HUBLINK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Override the hub socket url
    #[arg(long, env = "HUBLINK_HUB_URL")]
    hub_url: Option<String>,

    /// Pair with this link key at startup
    #[arg(long)]
    key: Option<String>,

    /// Toggle vault membership for a model version, then exit
    #[arg(long, value_name = "MODEL_VERSION_ID")]
    toggle_vault: Option<i64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("hublink=info".parse()?))
        .init();

    let cli = Cli::parse();
    info!("Starting hublink agent");

    let mut config: Config = if Path::new(&cli.config).exists() {
        let content = std::fs::read_to_string(&cli.config)
            .with_context(|| format!("reading config from {}", cli.config))?;
        toml::from_str(&content).with_context(|| format!("parsing config at {}", cli.config))?
    } else {
        info!("No config file found, using defaults");
        Config::default()
    };
    if let Some(data_dir) = cli.data_dir {
        config.agent.data_dir = data_dir;
    }
    if let Some(hub_url) = cli.hub_url {
        config.hub.socket_url = hub_url;
    }

    let settings = Arc::new(SettingsStore::load(
        config.agent.data_dir.join("settings.json"),
    )?);
    let resources = Arc::new(ResourceStore::new(settings.clone()).await);
    let activities = Arc::new(ActivityLog::new(settings.clone()).await);
    info!(
        resources = resources.list().await.len(),
        activities = activities.list().await.len(),
        "Library loaded"
    );

    // One-shot mode: flip vault membership and exit
    if let Some(model_version_id) = cli.toggle_vault {
        let api = HubClient::new(config.hub.api_url.clone(), config.hub.api_token.clone());
        match vault::toggle_vault_item(&api, &resources, &activities, None, model_version_id)
            .await?
        {
            Some(resource) => info!(
                name = %resource.name,
                in_vault = resource.vault_id.is_some(),
                "Vault membership updated"
            ),
            None => info!("No vault change applied"),
        }
        return Ok(());
    }

    let ui = UiNotifier::new();
    let shutdown = CancellationToken::new();

    // Transport events and link requests feed the manager; commands flow
    // from the manager to the dispatcher.
    let (transport_tx, transport_rx) = mpsc::channel(64);
    let (request_tx, request_rx) = mpsc::channel(64);
    let (command_tx, command_rx) = mpsc::channel(64);

    let (manager, _state_rx) = LinkManager::new(settings.clone(), command_tx, ui.clone());
    let manager_task = tokio::spawn(manager.run(transport_rx, request_rx));

    let dispatcher = CommandDispatcher::new(
        settings.clone(),
        resources.clone(),
        activities.clone(),
        Arc::new(HttpFetcher::new()),
        Arc::new(NoopGenerator),
        request_tx.clone(),
        ui.clone(),
    );
    let dispatcher_task = tokio::spawn(dispatcher.run(command_rx));

    let watcher_task = tokio::spawn(watcher::run(
        settings.subscribe_root_path(),
        resources.clone(),
        ui.clone(),
        shutdown.clone(),
    ));

    let supervisor_task = tokio::spawn(link::supervise(
        config.hub.socket_url.clone(),
        config.reconnect.clone(),
        transport_tx,
        shutdown.clone(),
    ));

    // Debug sink for UI events until a desktop shell is attached
    let mut ui_rx = ui.subscribe();
    tokio::spawn(async move {
        loop {
            match ui_rx.recv().await {
                Ok(event) => debug!(?event, "UI event"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "UI events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    if let Some(key) = cli.key {
        info!("Pairing with provided link key");
        if request_tx.send(LinkRequest::SetKey { key }).await.is_err() {
            warn!("Link manager unavailable; key not applied");
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("listening for shutdown")?;
    info!("Shutting down");

    shutdown.cancel();
    let _ = request_tx.send(LinkRequest::Close).await;

    let _ = supervisor_task.await;
    let _ = watcher_task.await;
    let _ = manager_task.await;
    // The dispatcher ends once the manager drops the command channel
    let _ = dispatcher_task.await;

    info!("Stopped");
    Ok(())
}
