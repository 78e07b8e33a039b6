//! WebSocket transport
//!
//! One `run` call drives one connection from dial to teardown. The link
//! manager owns the lifecycle: it receives transport events on a channel and
//! gets a fresh outbound sender with every successful connect, so frames can
//! never leak into a newer connection.

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{ClientFrame, ServerFrame};

#[derive(Debug)]
pub enum TransportEvent {
    Connecting,
    /// Dial succeeded; `outbound` feeds this connection until it closes.
    Connected {
        outbound: mpsc::Sender<ClientFrame>,
    },
    Frame(ServerFrame),
    /// Orderly close, by either side
    Closed,
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Stream error: {0}")]
    Stream(String),
}

/// Dial `url` and pump frames until the connection ends or `shutdown` fires.
///
/// Returns `Ok` on orderly close or shutdown, `Err` when the connection
/// dropped and a reconnect makes sense.
pub async fn run(
    url: &str,
    events: &mpsc::Sender<TransportEvent>,
    shutdown: &CancellationToken,
) -> Result<(), TransportError> {
    if events.send(TransportEvent::Connecting).await.is_err() {
        return Ok(());
    }

    let (stream, _) = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        connected = connect_async(url) => match connected {
            Ok(pair) => pair,
            Err(err) => {
                let error = err.to_string();
                let _ = events.send(TransportEvent::Failed { error: error.clone() }).await;
                return Err(TransportError::Connect(error));
            }
        },
    };

    info!(url, "Hub link established");
    let (mut sink, mut inbound) = stream.split();

    // Fresh channel per connection
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientFrame>(64);
    if events
        .send(TransportEvent::Connected {
            outbound: outbound_tx,
        })
        .await
        .is_err()
    {
        return Ok(());
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                let _ = events.send(TransportEvent::Closed).await;
                return Ok(());
            }
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else {
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = events.send(TransportEvent::Closed).await;
                    return Ok(());
                };
                match serde_json::to_string(&frame) {
                    Ok(raw) => {
                        debug!(frame = %raw, "Sending frame");
                        if let Err(err) = sink.send(Message::Text(raw)).await {
                            let error = err.to_string();
                            let _ = events.send(TransportEvent::Failed { error: error.clone() }).await;
                            return Err(TransportError::Stream(error));
                        }
                    }
                    Err(err) => warn!(error = %err, "Dropping unencodable frame"),
                }
            }
            message = inbound.next() => match message {
                Some(Ok(Message::Text(raw))) => {
                    match serde_json::from_str::<ServerFrame>(&raw) {
                        Ok(frame) => {
                            if events.send(TransportEvent::Frame(frame)).await.is_err() {
                                return Ok(());
                            }
                        }
                        Err(err) => warn!(error = %err, frame = %raw, "Ignoring unrecognized frame"),
                    }
                }
                // tungstenite answers pings on its own
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    let _ = events.send(TransportEvent::Closed).await;
                    return Ok(());
                }
                // Binary frames are not part of the protocol
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    let error = err.to_string();
                    let _ = events.send(TransportEvent::Failed { error: error.clone() }).await;
                    return Err(TransportError::Stream(error));
                }
            }
        }
    }
}
