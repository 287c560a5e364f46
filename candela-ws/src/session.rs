use std::net::SocketAddr;
use std::sync::Arc;

use eyre::{Result, ensure};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tracing::{debug, info, warn};

use crate::registry::{ConnectionRegistry, Subscription};

/// Per-connection state machine.
///
/// A client holds at most one active subscription; a well-formed text frame
/// replaces it (the registry preserves or drops the one-second shadow as
/// appropriate). The server is broadcast-only: nothing is ever sent in
/// response to a client message. Any protocol error ends this session only.
pub async fn handle_session(
    registry: Arc<ConnectionRegistry>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, error = %e, "websocket handshake failed");
            return;
        }
    };

    let (mut sink, mut frames) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Utf8Bytes>();
    let client = registry.connect(tx).await;

    // Writer task: drains broadcasts into the socket so a slow client only
    // delays itself.
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut current: Option<Subscription> = None;

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(Message::Text(text)) => match parse_subscription(&text) {
                Ok(subscription) => {
                    if current.as_ref() == Some(&subscription) {
                        continue;
                    }
                    if let Some(previous) = current.take() {
                        registry
                            .unsubscribe(client.id, &previous, Some(&subscription))
                            .await;
                    }
                    registry.subscribe(client.id, subscription.clone()).await;
                    current = Some(subscription);
                }
                Err(e) => {
                    warn!(%peer, client = client.id, error = %e, "bad subscription payload");
                    break;
                }
            },
            Ok(Message::Close(_)) => {
                debug!(%peer, client = client.id, "client closed connection");
                break;
            }
            // Pings are answered by the transport; everything else is noise.
            Ok(_) => {}
            Err(e) => {
                debug!(%peer, client = client.id, error = %e, "websocket error");
                break;
            }
        }
    }

    if let Some(subscription) = current {
        registry.unsubscribe(client.id, &subscription, None).await;
    }
    registry.disconnect(client.id).await;
    info!(%peer, client = client.id, "session ended");

    // The registry no longer holds a sender; dropping ours lets the writer
    // drain and exit.
    drop(client);
    let _ = writer.await;
}

/// Decodes `{"symbol": ..., "timeframe": {"size": N, "unit": "..."}}`.
///
/// # Error
///
/// Non-object payloads, a missing or malformed `timeframe` object,
/// a non-integer `size`, a non-string or unknown `unit`, and an empty
/// `symbol` are all rejected.
fn parse_subscription(text: &Utf8Bytes) -> Result<Subscription> {
    let subscription: Subscription = simd_json::from_slice(&mut text.as_bytes().to_vec())?;
    ensure!(
        !subscription.symbol.trim().is_empty(),
        "symbol must be a non-empty string"
    );
    Ok(subscription)
}
