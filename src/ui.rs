//! UI event fan-out
//!
//! Components publish coarse change notifications here; any number of
//! frontends (tray, debug logger, future desktop shell) subscribe.

use tokio::sync::broadcast;

use crate::link::LinkState;

#[derive(Debug, Clone)]
pub enum UiEvent {
    ConnectionChanged(LinkState),
    /// Long-lived key issued after the first pairing; shown so the user can
    /// re-link other installs.
    UpgradeKeyReceived { key: String },
    ResourcesChanged,
    ActivitiesChanged,
    Error { message: String },
}

/// Cheap-to-clone handle around a broadcast channel. Notifying without
/// subscribers is fine; events are simply dropped.
#[derive(Clone)]
pub struct UiNotifier {
    tx: broadcast::Sender<UiEvent>,
}

impl UiNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn notify(&self, event: UiEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.tx.subscribe()
    }
}

impl Default for UiNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let notifier = UiNotifier::new();
        let mut rx = notifier.subscribe();

        notifier.notify(UiEvent::ResourcesChanged);

        match rx.recv().await.unwrap() {
            UiEvent::ResourcesChanged => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_notify_without_subscribers_is_fine() {
        let notifier = UiNotifier::new();
        notifier.notify(UiEvent::ActivitiesChanged);
    }
}
