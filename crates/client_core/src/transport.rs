use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use shared::{
    domain::SessionKind,
    protocol::{TransportFrame, WireMessage},
};
use tokio::{
    net::TcpStream,
    sync::{broadcast, oneshot, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::warn;
use url::Url;

/// The message pipe of the engine. Sends resolve to the server-confirmed
/// copy of the message; the inbound stream runs for the connection's
/// lifetime and does not replay anything missed while disconnected. Any
/// timeout policy for sends lives behind this trait, not in the core.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_message(&self, kind: SessionKind, message: WireMessage) -> Result<WireMessage>;
    fn subscribe_inbound(&self) -> broadcast::Receiver<TransportFrame>;
}

pub struct MissingTransport {
    events: broadcast::Sender<TransportFrame>,
}

impl MissingTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1);
        Self { events }
    }
}

impl Default for MissingTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MissingTransport {
    async fn send_message(&self, _kind: SessionKind, _message: WireMessage) -> Result<WireMessage> {
        Err(anyhow!("transport is unavailable"))
    }

    fn subscribe_inbound(&self) -> broadcast::Receiver<TransportFrame> {
        self.events.subscribe()
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type PendingAcks = Arc<Mutex<HashMap<String, oneshot::Sender<WireMessage>>>>;

/// Websocket-backed transport. Outbound sends are correlated with their
/// acknowledgement frame by client message id.
pub struct WsTransport {
    writer: Mutex<WsSink>,
    pending: PendingAcks,
    events: broadcast::Sender<TransportFrame>,
    ack_timeout: Duration,
    reader_task: JoinHandle<()>,
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("ack_timeout", &self.ack_timeout)
            .finish_non_exhaustive()
    }
}

impl WsTransport {
    pub async fn connect(ws_url: &str, ack_timeout: Duration) -> Result<Arc<Self>> {
        Url::parse(ws_url).with_context(|| format!("invalid websocket url: {ws_url}"))?;
        let (stream, _) = connect_async(ws_url)
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        let (writer, mut reader) = stream.split();

        let (events, _) = broadcast::channel(1024);
        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));

        let reader_pending = Arc::clone(&pending);
        let reader_events = events.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<TransportFrame>(&text)
                    {
                        Ok(TransportFrame::Ack { message }) => {
                            let waiter = reader_pending.lock().await.remove(&message.cli_mid);
                            match waiter {
                                Some(tx) => {
                                    let _ = tx.send(message);
                                }
                                None => warn!(
                                    cli_mid = %message.cli_mid,
                                    "acknowledgement without a waiting send"
                                ),
                            }
                        }
                        Ok(frame) => {
                            let _ = reader_events.send(frame);
                        }
                        Err(err) => warn!("invalid transport frame: {err}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("websocket receive failed: {err}");
                        break;
                    }
                }
            }
        });

        Ok(Arc::new(Self {
            writer: Mutex::new(writer),
            pending,
            events,
            ack_timeout,
            reader_task,
        }))
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_message(&self, kind: SessionKind, message: WireMessage) -> Result<WireMessage> {
        if message.cli_mid.is_empty() {
            return Err(anyhow!("outbound message requires a client id"));
        }
        let cli_mid = message.cli_mid.clone();
        let frame = match kind {
            SessionKind::Direct => TransportFrame::DirectMessage { message },
            SessionKind::Channel => TransportFrame::ChannelMessage { message },
        };
        let encoded = serde_json::to_string(&frame).context("failed to encode outbound frame")?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(cli_mid.clone(), tx);

        if let Err(err) = self.writer.lock().await.send(Message::Text(encoded)).await {
            self.pending.lock().await.remove(&cli_mid);
            return Err(anyhow!("websocket send failed: {err}"));
        }

        match timeout(self.ack_timeout, rx).await {
            Ok(Ok(confirmed)) => Ok(confirmed),
            Ok(Err(_)) => Err(anyhow!("transport closed before acknowledgement")),
            Err(_) => {
                self.pending.lock().await.remove(&cli_mid);
                Err(anyhow!("timed out waiting for send acknowledgement"))
            }
        }
    }

    fn subscribe_inbound(&self) -> broadcast::Receiver<TransportFrame> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
