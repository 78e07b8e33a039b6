//! Hub link lifecycle
//!
//! - `LinkManager` turns transport events into connection state, announces
//!   the agent, joins the command room and routes command traffic
//! - `supervise` keeps one transport alive, re-dialing with capped backoff
//!
//! State machine: DISCONNECTED -> CONNECTING on dial, CONNECTING ->
//! CONNECTED once the room join is acknowledged or a presence update
//! arrives, any drop -> DISCONNECTED. A kick clears both stored keys, so
//! the next dial starts unpaired.

pub mod protocol;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ReconnectConfig;
use crate::settings::SettingsStore;
use crate::ui::{UiEvent, UiNotifier};

use protocol::{
    ClientFrame, CommandEnvelope, JoinKey, PresenceAnnounce, ServerFrame, StatusEnvelope,
    AGENT_TYPE,
};
use transport::TransportEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Requests other components hand to the link manager
#[derive(Debug)]
pub enum LinkRequest {
    /// Pair with a fresh short key entered through the UI
    SetKey { key: String },
    SendStatus(StatusEnvelope),
    Close,
}

/// Owns connection state and the outbound side of the current transport.
pub struct LinkManager {
    settings: Arc<SettingsStore>,
    command_tx: mpsc::Sender<CommandEnvelope>,
    ui: UiNotifier,
    state_tx: watch::Sender<LinkState>,
    outbound: Option<mpsc::Sender<ClientFrame>>,
}

impl LinkManager {
    pub fn new(
        settings: Arc<SettingsStore>,
        command_tx: mpsc::Sender<CommandEnvelope>,
        ui: UiNotifier,
    ) -> (Self, watch::Receiver<LinkState>) {
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);

        (
            Self {
                settings,
                command_tx,
                ui,
                state_tx,
                outbound: None,
            },
            state_rx,
        )
    }

    pub async fn run(
        mut self,
        mut transport_events: mpsc::Receiver<TransportEvent>,
        mut requests: mpsc::Receiver<LinkRequest>,
    ) {
        loop {
            tokio::select! {
                event = transport_events.recv() => {
                    let Some(event) = event else { break };
                    self.handle_transport(event).await;
                }
                request = requests.recv() => {
                    let Some(request) = request else { break };
                    if !self.handle_request(request).await {
                        break;
                    }
                }
            }
        }

        debug!("Link manager stopped");
    }

    async fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connecting => {
                self.set_state(LinkState::Connecting);
            }
            TransportEvent::Connected { outbound } => {
                self.outbound = Some(outbound);
                self.send(ClientFrame::Iam(PresenceAnnounce {
                    client_type: AGENT_TYPE.to_string(),
                }))
                .await;

                // Only the upgrade key joins on connect; a short pairing key
                // joins through the user flow that set it.
                match self.settings.upgrade_key().await {
                    Some(key) => self.send(ClientFrame::Join(JoinKey { key })).await,
                    None => debug!("No upgrade key; waiting for pairing"),
                }
            }
            TransportEvent::Frame(frame) => self.handle_frame(frame).await,
            TransportEvent::Closed => {
                self.outbound = None;
                self.set_state(LinkState::Disconnected);
            }
            TransportEvent::Failed { error } => {
                warn!(error = %error, "Hub connection failed");
                self.outbound = None;
                self.set_state(LinkState::Disconnected);
            }
        }
    }

    async fn handle_frame(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::Command(envelope) => {
                info!(id = %envelope.id, kind = envelope.command.kind(), "Command received");
                if self.command_tx.send(envelope).await.is_err() {
                    warn!("Command dispatcher is gone; dropping command");
                }
            }
            ServerFrame::Joined(ack) => {
                debug!(room = ?ack.room, "Join acknowledged");
                self.set_state(LinkState::Connected);
            }
            ServerFrame::RoomPresence(presence) => {
                // Presence only arrives inside the room, so any update
                // confirms the link.
                debug!(clients = presence.client, agents = presence.sd, "Room presence");
                self.set_state(LinkState::Connected);
            }
            ServerFrame::Kicked => {
                warn!("Kicked from hub room; clearing stored keys");
                if let Err(err) = self.settings.set_key(None).await {
                    warn!(error = %err, "Failed to clear link key");
                }
                if let Err(err) = self.settings.set_upgrade_key(None).await {
                    warn!(error = %err, "Failed to clear upgrade key");
                }
                self.set_state(LinkState::Disconnected);
                self.ui.notify(UiEvent::Error {
                    message: "The hub revoked this link; pair again with a new key".to_string(),
                });
            }
            ServerFrame::UpgradeKey(payload) => {
                info!("Received upgrade key");
                if let Err(err) = self.settings.set_upgrade_key(Some(payload.key.clone())).await {
                    warn!(error = %err, "Failed to persist upgrade key");
                }
                self.ui.notify(UiEvent::UpgradeKeyReceived {
                    key: payload.key.clone(),
                });
                // Re-join under the durable key; the ack moves us to
                // Connected.
                self.send(ClientFrame::Join(JoinKey { key: payload.key })).await;
            }
        }
    }

    async fn handle_request(&mut self, request: LinkRequest) -> bool {
        match request {
            LinkRequest::SetKey { key } => {
                if let Err(err) = self.settings.set_key(Some(key.clone())).await {
                    warn!(error = %err, "Failed to persist link key");
                }
                // Joins immediately when a transport is up, otherwise the
                // next connect picks the key up from settings.
                self.send(ClientFrame::Join(JoinKey { key })).await;
            }
            LinkRequest::SendStatus(envelope) => {
                self.send(ClientFrame::CommandStatus(envelope)).await;
            }
            LinkRequest::Close => {
                self.outbound = None;
                self.set_state(LinkState::Disconnected);
                return false;
            }
        }

        true
    }

    async fn send(&mut self, frame: ClientFrame) {
        match &self.outbound {
            Some(outbound) => {
                if outbound.send(frame).await.is_err() {
                    debug!("Transport gone; dropping frame");
                    self.outbound = None;
                }
            }
            None => debug!("Not connected; dropping frame"),
        }
    }

    fn set_state(&self, state: LinkState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });

        if changed {
            info!(?state, "Connection state changed");
            self.ui.notify(UiEvent::ConnectionChanged(state));
        }
    }
}

/// Re-dial the hub until shutdown. Failed connections back off with doubling
/// delays up to the configured cap; an orderly close resets the delay.
pub async fn supervise(
    url: String,
    reconnect: ReconnectConfig,
    events: mpsc::Sender<TransportEvent>,
    shutdown: CancellationToken,
) {
    let initial = Duration::from_millis(reconnect.initial_delay_ms);
    let max = Duration::from_millis(reconnect.max_delay_ms);
    let mut delay = initial;

    loop {
        let failed = transport::run(&url, &events, &shutdown).await.is_err();
        if shutdown.is_cancelled() {
            break;
        }

        if !failed {
            delay = initial;
        }

        debug!(delay_ms = delay.as_millis() as u64, "Reconnecting after delay");
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        if failed {
            delay = (delay * 2).min(max);
        }
    }

    debug!("Link supervisor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    struct Fixture {
        settings: Arc<SettingsStore>,
        event_tx: mpsc::Sender<TransportEvent>,
        request_tx: mpsc::Sender<LinkRequest>,
        command_rx: mpsc::Receiver<CommandEnvelope>,
        state_rx: watch::Receiver<LinkState>,
    }

    fn fixture(dir: &TempDir) -> Fixture {
        let settings = Arc::new(SettingsStore::load(dir.path().join("settings.json")).unwrap());
        let (command_tx, command_rx) = mpsc::channel(8);
        let (manager, state_rx) =
            LinkManager::new(settings.clone(), command_tx, UiNotifier::new());
        let (event_tx, event_rx) = mpsc::channel(8);
        let (request_tx, request_rx) = mpsc::channel(8);
        tokio::spawn(manager.run(event_rx, request_rx));

        Fixture {
            settings,
            event_tx,
            request_tx,
            command_rx,
            state_rx,
        }
    }

    async fn recv_frame(rx: &mut mpsc::Receiver<ClientFrame>) -> ClientFrame {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("transport channel closed")
    }

    #[tokio::test]
    async fn test_connect_announces_and_joins_with_upgrade_key() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir);
        fx.settings
            .set_upgrade_key(Some("upgrade-xyz".to_string()))
            .await
            .unwrap();

        let (out_tx, mut out_rx) = mpsc::channel(8);
        fx.event_tx
            .send(TransportEvent::Connected { outbound: out_tx })
            .await
            .unwrap();

        match recv_frame(&mut out_rx).await {
            ClientFrame::Iam(announce) => assert_eq!(announce.client_type, "sd"),
            other => panic!("expected iam, got {other:?}"),
        }
        match recv_frame(&mut out_rx).await {
            ClientFrame::Join(join) => assert_eq!(join.key, "upgrade-xyz"),
            other => panic!("expected join, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_short_key_does_not_join_on_connect() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir);
        fx.settings.set_key(Some("ABC123".to_string())).await.unwrap();

        let (out_tx, mut out_rx) = mpsc::channel(8);
        fx.event_tx
            .send(TransportEvent::Connected { outbound: out_tx })
            .await
            .unwrap();

        recv_frame(&mut out_rx).await; // iam
        assert!(
            timeout(Duration::from_millis(200), out_rx.recv())
                .await
                .is_err(),
            "short key must not join until the user pairs with it"
        );
    }

    #[tokio::test]
    async fn test_join_ack_marks_connected() {
        let dir = TempDir::new().unwrap();
        let mut fx = fixture(&dir);

        fx.event_tx.send(TransportEvent::Connecting).await.unwrap();
        fx.state_rx.changed().await.unwrap();
        assert_eq!(*fx.state_rx.borrow_and_update(), LinkState::Connecting);

        fx.event_tx
            .send(TransportEvent::Frame(ServerFrame::Joined(
                protocol::JoinAck { room: None },
            )))
            .await
            .unwrap();
        fx.state_rx.changed().await.unwrap();
        assert_eq!(*fx.state_rx.borrow_and_update(), LinkState::Connected);
    }

    #[tokio::test]
    async fn test_upgrade_key_rejoins_room() {
        let dir = TempDir::new().unwrap();
        let mut fx = fixture(&dir);

        let (out_tx, mut out_rx) = mpsc::channel(8);
        fx.event_tx
            .send(TransportEvent::Connected { outbound: out_tx })
            .await
            .unwrap();
        recv_frame(&mut out_rx).await; // iam, no stored key so no join yet

        fx.event_tx
            .send(TransportEvent::Frame(ServerFrame::UpgradeKey(
                protocol::UpgradeKeyPayload {
                    key: "upgrade-xyz".to_string(),
                },
            )))
            .await
            .unwrap();

        match recv_frame(&mut out_rx).await {
            ClientFrame::Join(join) => assert_eq!(join.key, "upgrade-xyz"),
            other => panic!("expected re-join with upgrade key, got {other:?}"),
        }
        assert_eq!(
            fx.settings.upgrade_key().await,
            Some("upgrade-xyz".to_string())
        );

        fx.event_tx
            .send(TransportEvent::Frame(ServerFrame::Joined(
                protocol::JoinAck { room: None },
            )))
            .await
            .unwrap();
        fx.state_rx.changed().await.unwrap();
        assert_eq!(*fx.state_rx.borrow_and_update(), LinkState::Connected);
    }

    #[tokio::test]
    async fn test_presence_marks_connected() {
        let dir = TempDir::new().unwrap();
        let mut fx = fixture(&dir);

        fx.event_tx
            .send(TransportEvent::Frame(ServerFrame::RoomPresence(
                protocol::RoomPresence { client: 1, sd: 1 },
            )))
            .await
            .unwrap();
        fx.state_rx.changed().await.unwrap();
        assert_eq!(*fx.state_rx.borrow_and_update(), LinkState::Connected);

        // An empty-looking update never demotes the link.
        fx.event_tx
            .send(TransportEvent::Frame(ServerFrame::RoomPresence(
                protocol::RoomPresence { client: 0, sd: 1 },
            )))
            .await
            .unwrap();
        let envelope: CommandEnvelope =
            serde_json::from_str(r#"{"id": "barrier", "type": "resources:list"}"#).unwrap();
        fx.event_tx
            .send(TransportEvent::Frame(ServerFrame::Command(envelope)))
            .await
            .unwrap();
        timeout(Duration::from_secs(1), fx.command_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!fx.state_rx.has_changed().unwrap());
        assert_eq!(*fx.state_rx.borrow(), LinkState::Connected);
    }

    #[tokio::test]
    async fn test_kicked_clears_credentials() {
        let dir = TempDir::new().unwrap();
        let mut fx = fixture(&dir);
        fx.settings.set_key(Some("ABC123".to_string())).await.unwrap();
        fx.settings
            .set_upgrade_key(Some("upgrade-xyz".to_string()))
            .await
            .unwrap();

        fx.event_tx.send(TransportEvent::Connecting).await.unwrap();
        fx.state_rx.changed().await.unwrap();

        fx.event_tx
            .send(TransportEvent::Frame(ServerFrame::Kicked))
            .await
            .unwrap();
        fx.state_rx.changed().await.unwrap();
        assert_eq!(*fx.state_rx.borrow_and_update(), LinkState::Disconnected);

        assert_eq!(fx.settings.key().await, None);
        assert_eq!(fx.settings.upgrade_key().await, None);
    }

    #[tokio::test]
    async fn test_commands_forwarded_to_dispatcher() {
        let dir = TempDir::new().unwrap();
        let mut fx = fixture(&dir);

        let envelope: CommandEnvelope =
            serde_json::from_str(r#"{"id": "cmd-1", "type": "resources:list"}"#).unwrap();
        fx.event_tx
            .send(TransportEvent::Frame(ServerFrame::Command(envelope)))
            .await
            .unwrap();

        let received = timeout(Duration::from_secs(1), fx.command_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.id, "cmd-1");
    }

    #[tokio::test]
    async fn test_status_reports_sent_over_transport() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir);

        let (out_tx, mut out_rx) = mpsc::channel(8);
        fx.event_tx
            .send(TransportEvent::Connected { outbound: out_tx })
            .await
            .unwrap();
        recv_frame(&mut out_rx).await; // iam

        fx.request_tx
            .send(LinkRequest::SendStatus(StatusEnvelope::success(
                "cmd-2",
                "resources:list",
            )))
            .await
            .unwrap();

        match recv_frame(&mut out_rx).await {
            ClientFrame::CommandStatus(envelope) => {
                assert_eq!(envelope.id, "cmd-2");
                assert_eq!(envelope.status, protocol::CommandStatus::Success);
            }
            other => panic!("expected commandStatus, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_set_key_persists_and_joins() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir);

        let (out_tx, mut out_rx) = mpsc::channel(8);
        fx.event_tx
            .send(TransportEvent::Connected { outbound: out_tx })
            .await
            .unwrap();
        recv_frame(&mut out_rx).await; // iam

        fx.request_tx
            .send(LinkRequest::SetKey {
                key: "NEW999".to_string(),
            })
            .await
            .unwrap();

        match recv_frame(&mut out_rx).await {
            ClientFrame::Join(join) => assert_eq!(join.key, "NEW999"),
            other => panic!("expected join, got {other:?}"),
        }
        assert_eq!(fx.settings.key().await, Some("NEW999".to_string()));
    }
}
