//! Connectors that open a message link to a room.
//!
//! A [`Link`] is a pair of channels carrying [`WireMessage`]s. The
//! connector owns whatever pumps bytes underneath; when the link breaks the
//! inbound channel closes and the session notices.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::protocol::{ProtocolError, WireCodec, WireMessage, PROTOCOL_VERSION};
use super::ClientInfo;
use crate::room::RoomRegistry;

/// Transport-level errors, surfaced to the client as session events
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Connection refused: {0}")]
    Refused(String),

    #[error("Connection closed")]
    Closed,

    #[error("Room unavailable: {0}")]
    RoomUnavailable(String),

    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::WebSocket(err.to_string())
    }
}

/// An open, bidirectional message link to a room
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<WireMessage>,
    pub inbound: mpsc::UnboundedReceiver<WireMessage>,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a link and introduce the client to the room
    async fn open(
        &self,
        room_id: &str,
        client: &ClientInfo,
        resume_token: Option<String>,
    ) -> Result<Link, TransportError>;
}

/// In-process connector talking straight to a [`RoomRegistry`].
///
/// `set_online(false)` refuses new links and severs open ones, which is how
/// tests simulate a network outage.
#[derive(Clone)]
pub struct LocalConnector {
    registry: Arc<RoomRegistry>,
    online: Arc<AtomicBool>,
    sever_tx: broadcast::Sender<()>,
}

impl LocalConnector {
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        let (sever_tx, _) = broadcast::channel(4);
        Self {
            registry,
            online: Arc::new(AtomicBool::new(true)),
            sever_tx,
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        if !online {
            self.sever();
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Break every open link without changing the online flag
    pub fn sever(&self) {
        let _ = self.sever_tx.send(());
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn open(
        &self,
        room_id: &str,
        client: &ClientInfo,
        resume_token: Option<String>,
    ) -> Result<Link, TransportError> {
        if !self.is_online() {
            return Err(TransportError::Refused("network offline".to_string()));
        }

        let mut sever = self.sever_tx.subscribe();
        let mut handle = self
            .registry
            .join_room(room_id, client.clone(), resume_token)
            .await
            .map_err(|e| TransportError::RoomUnavailable(e.to_string()))?;

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, mut from_client) = mpsc::unbounded_channel::<WireMessage>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = handle.recv() => match msg {
                        Some(msg) => {
                            if to_client.send(msg).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    msg = from_client.recv() => match msg {
                        Some(msg) => {
                            if handle.send(msg).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = sever.recv() => {
                        debug!(session = %handle.session_id(), "local link severed");
                        break;
                    }
                }
            }
        });

        Ok(Link { outbound, inbound })
    }
}

/// WebSocket connector for the bundled server (`/ws/:room_id`)
#[derive(Debug, Clone)]
pub struct WsConnector {
    base_url: String,
}

impl WsConnector {
    /// `base_url` like `ws://127.0.0.1:3001`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn room_url(&self, room_id: &str) -> String {
        format!("{}/ws/{}", self.base_url, room_id)
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(
        &self,
        room_id: &str,
        client: &ClientInfo,
        resume_token: Option<String>,
    ) -> Result<Link, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.room_url(room_id)).await?;
        let (mut writer, mut reader) = ws_stream.split();

        let hello = WireMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            room_id: room_id.to_string(),
            client: client.clone(),
            resume_token,
        };
        writer
            .send(Message::Binary(WireCodec::encode(&hello)?.to_vec()))
            .await?;

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, mut from_client) = mpsc::unbounded_channel::<WireMessage>();

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(msg) = from_client.recv().await {
                let bytes = match WireCodec::encode(&msg) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("Dropping unencodable message: {}", e);
                        continue;
                    }
                };
                if writer.send(Message::Binary(bytes.to_vec())).await.is_err() {
                    break;
                }
            }
            let _ = writer.close().await;
        });

        // Reader task: decode frames until the socket closes
        tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Binary(data)) => match WireCodec::decode(&data) {
                        Ok(msg) => {
                            if to_client.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Dropping malformed frame: {}", e),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
        });

        Ok(Link { outbound, inbound })
    }
}

/// Test connector: every link plays back a fixed script from the "room",
/// then stays open and silent. What the client sends is kept for inspection.
#[cfg(test)]
pub(crate) struct ScriptedConnector {
    script: Vec<WireMessage>,
    opened: std::sync::atomic::AtomicUsize,
    links: parking_lot::Mutex<
        Vec<(
            mpsc::UnboundedSender<WireMessage>,
            mpsc::UnboundedReceiver<WireMessage>,
        )>,
    >,
}

#[cfg(test)]
impl ScriptedConnector {
    pub fn new(script: Vec<WireMessage>) -> Self {
        Self {
            script,
            opened: std::sync::atomic::AtomicUsize::new(0),
            links: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// A room that accepts the connection and never says anything
    pub fn silent() -> Self {
        Self::new(Vec::new())
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Messages received from clients so far, across all links
    pub fn received(&self) -> Vec<WireMessage> {
        let mut out = Vec::new();
        for (_, from_client) in self.links.lock().iter_mut() {
            while let Ok(msg) = from_client.try_recv() {
                out.push(msg);
            }
        }
        out
    }
}

#[cfg(test)]
#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(
        &self,
        _room_id: &str,
        _client: &ClientInfo,
        _resume_token: Option<String>,
    ) -> Result<Link, TransportError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        for msg in &self.script {
            let _ = to_client.send(msg.clone());
        }
        self.links.lock().push((to_client, from_client));
        Ok(Link { outbound, inbound })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::RegistryConfig;
    use crate::storage::MemoryStore;

    fn registry() -> Arc<RoomRegistry> {
        Arc::new(RoomRegistry::new(
            Arc::new(MemoryStore::new()),
            RegistryConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_local_link_receives_welcome() {
        let connector = LocalConnector::new(registry());
        let mut link = connector
            .open("room-1", &ClientInfo::new("alice", "Alice"), None)
            .await
            .unwrap();

        match link.inbound.recv().await {
            Some(WireMessage::Welcome { session_id, .. }) => assert!(!session_id.is_empty()),
            other => panic!("Expected welcome, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_offline_connector_refuses_and_severs() {
        let connector = LocalConnector::new(registry());
        let mut link = connector
            .open("room-1", &ClientInfo::new("alice", "Alice"), None)
            .await
            .unwrap();
        assert!(matches!(
            link.inbound.recv().await,
            Some(WireMessage::Welcome { .. })
        ));

        connector.set_online(false);
        assert!(link.inbound.recv().await.is_none());

        let refused = connector
            .open("room-1", &ClientInfo::new("alice", "Alice"), None)
            .await;
        assert!(matches!(refused, Err(TransportError::Refused(_))));
    }

    #[test]
    fn test_ws_room_url() {
        let connector = WsConnector::new("ws://localhost:3001/");
        assert_eq!(connector.room_url("abc"), "ws://localhost:3001/ws/abc");
    }
}
