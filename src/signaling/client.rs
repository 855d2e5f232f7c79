//! WebSocket Client für den Relay-Server
//!
//! Verwaltet die Verbindung zum Relay:
//! - Registrierung direkt nach dem Verbindungsaufbau
//! - Peer-Liste nach der Bestätigung anfordern
//! - Keepalive
//! - Eingehende Nachrichten dekodieren und an die Steuerschleife weiterleiten
//!
//! Der Client interpretiert keine Payload-Semantik. Nach einem
//! Verbindungsabbruch wird nicht neu verbunden.

use super::messages::*;
use super::peers::PeerRecord;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Puffergröße für ausgehende Nachrichten
const OUTBOUND_CAPACITY: usize = 256;

/// Puffergröße für eingehende Events
const INBOUND_CAPACITY: usize = 256;

/// Maximale Wartezeit für den Verbindungsaufbau
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to relay server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Outbound queue full, message dropped")]
    QueueFull,

    #[error("Outbound queue congested, frame dropped")]
    Congested,
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events, die der Client an die Steuerschleife liefert
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// Relay hat die Verbindung begrüßt
    Welcome,

    /// Registrierung bestätigt (Peer-Liste ist bereits angefordert)
    Registered,

    /// Neue vollständige Peer-Liste
    PeersUpdated(Vec<PeerRecord>),

    /// Envelope eines anderen Peers
    Envelope(Envelope),

    /// Verbindung getrennt
    Disconnected { reason: Option<String> },
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    is_registered: bool,
}

// ============================================================================
// RELAY HANDLE
// ============================================================================

/// Sende-Seite der Relay-Verbindung (klonbar, non-blocking)
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<Message>,
    state: Arc<RwLock<ClientState>>,
    /// Freie Plätze, die nur Signaling-Nachrichten belegen dürfen
    control_reserve: usize,
}

impl RelayHandle {
    /// Erstellt ein Handle samt Empfänger der ausgehenden Nachrichten
    ///
    /// Wird vom Client für den Write-Task genutzt und in Tests, um den
    /// ausgehenden Verkehr direkt zu lesen.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        let state = ClientState {
            is_connected: true,
            is_registered: false,
        };
        (
            Self {
                tx,
                state: Arc::new(RwLock::new(state)),
                control_reserve: capacity / 4,
            },
            rx,
        )
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected && !self.tx.is_closed()
    }

    /// Prüft ob das Relay die Registrierung bestätigt hat
    pub fn is_registered(&self) -> bool {
        self.state.read().is_registered
    }

    /// Sendet eine Steuer-Nachricht (non-blocking, verwendet try_send)
    pub fn send(&self, message: &ClientMessage) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let text = serde_json::to_string(message)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        self.tx.try_send(Message::Text(text)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SignalingError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SignalingError::NotConnected,
        })
    }

    /// Verteilt ein Envelope über das Relay an alle Peers
    ///
    /// Frames werden verworfen, sobald nur noch die Reserve frei ist.
    /// Signaling-Envelopes dürfen die Reserve belegen.
    pub fn broadcast(&self, envelope: Envelope) -> Result<(), SignalingError> {
        if envelope.payload.is_frame() && self.tx.capacity() <= self.control_reserve {
            return Err(SignalingError::Congested);
        }
        tracing::trace!(
            "Broadcasting {} to {:?}",
            envelope.payload.type_name(),
            envelope.target
        );
        self.send(&ClientMessage::Broadcast { payload: envelope })
    }

    /// Fordert die Peer-Liste an
    pub fn request_peers(&self) -> Result<(), SignalingError> {
        self.send(&ClientMessage::GetPeers)
    }

    /// Sendet einen Keepalive-Ping
    pub fn ping(&self) -> Result<(), SignalingError> {
        self.send(&ClientMessage::Ping {
            timestamp: Utc::now().timestamp_millis(),
        })
    }

    /// Schließt die Verbindung, nachdem alle wartenden Nachrichten gesendet wurden
    pub fn close(&self) {
        if self.tx.try_send(Message::Close(None)).is_err() {
            tracing::debug!("Close frame not queued, connection already gone");
        }
        self.mark_disconnected();
    }

    fn mark_registered(&self) {
        self.state.write().is_registered = true;
    }

    fn mark_disconnected(&self) {
        let mut state = self.state.write();
        state.is_connected = false;
        state.is_registered = false;
    }

    /// Startet einen Keepalive-Task
    ///
    /// Die Antwort des Relays wird nicht ausgewertet.
    pub fn start_keepalive(&self, every: Duration) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // Der erste Tick kommt sofort
            interval.tick().await;
            loop {
                interval.tick().await;
                if !handle.is_connected() {
                    break;
                }
                if let Err(e) = handle.ping() {
                    tracing::warn!("Failed to send keepalive: {}", e);
                }
            }
        })
    }
}

impl std::fmt::Debug for RelayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHandle")
            .field("state", &*self.state.read())
            .finish()
    }
}

// ============================================================================
// RELAY CONNECTION
// ============================================================================

/// Eine aufgebaute Relay-Verbindung
pub struct RelayConnection {
    pub handle: RelayHandle,
    pub events: mpsc::Receiver<SignalingEvent>,
    writer: JoinHandle<()>,
}

impl RelayConnection {
    /// Schließt die Verbindung und wartet, bis der Write-Task fertig ist
    pub async fn shutdown(self, grace: Duration) {
        self.handle.close();
        if tokio::time::timeout(grace, self.writer).await.is_err() {
            tracing::warn!("Relay writer did not finish within {:?}", grace);
        }
    }
}

// ============================================================================
// RELAY CLIENT
// ============================================================================

/// WebSocket Client für die Relay-Kommunikation
pub struct RelayClient {
    server_url: String,
    registration: Registration,
}

impl RelayClient {
    /// Erstellt einen neuen RelayClient
    pub fn new(server_url: String, registration: Registration) -> Self {
        Self {
            server_url,
            registration,
        }
    }

    /// Verbindet mit dem Relay und sendet die Registrierung
    pub async fn connect(&self) -> Result<RelayConnection, SignalingError> {
        tracing::info!("Connecting to relay server: {}", self.server_url);

        let connecting = connect_async(self.server_url.as_str());
        let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connecting)
            .await
            .map_err(|_| SignalingError::ConnectionFailed("Timeout".to_string()))?
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (handle, mut rx) = RelayHandle::channel(OUTBOUND_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<SignalingEvent>(INBOUND_CAPACITY);

        // Read-Task starten
        let reader_handle = handle.clone();
        tokio::spawn(async move {
            let mut reason = None;
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        let Some(event) = Self::handle_inbound(&text, &reader_handle) else {
                            continue;
                        };
                        if event_tx.send(event).await.is_err() {
                            tracing::debug!("Event receiver dropped, stopping reader");
                            return;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        tracing::info!("WebSocket closed by relay");
                        reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        reason = Some(e.to_string());
                        break;
                    }
                    _ => {}
                }
            }

            reader_handle.mark_disconnected();
            let _ = event_tx.send(SignalingEvent::Disconnected { reason }).await;
        });

        // Write-Task starten
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        // Registrierung senden
        handle.send(&ClientMessage::Register(self.registration.clone()))?;
        tracing::info!(
            "Registering as {} ({})",
            self.registration.nickname,
            self.registration.address
        );

        Ok(RelayConnection {
            handle,
            events: event_rx,
            writer,
        })
    }

    /// Verarbeitet eine eingehende Textnachricht
    ///
    /// Nicht dekodierbare Nachrichten werden stillschweigend verworfen.
    fn handle_inbound(text: &str, handle: &RelayHandle) -> Option<SignalingEvent> {
        let Some(inbound) = decode_inbound(text) else {
            tracing::debug!("Dropping undecodable relay message ({} bytes)", text.len());
            return None;
        };

        match inbound {
            Inbound::Relay(RelayMessage::Welcome { message }) => {
                let suffix = message.map(|m| format!(": {m}")).unwrap_or_default();
                tracing::info!("Relay says welcome{}", suffix);
                Some(SignalingEvent::Welcome)
            }
            Inbound::Relay(RelayMessage::Registered { .. }) => {
                handle.mark_registered();
                if let Err(e) = handle.request_peers() {
                    tracing::warn!("Failed to request peer list: {}", e);
                }
                Some(SignalingEvent::Registered)
            }
            Inbound::Relay(RelayMessage::PeerList { peers })
            | Inbound::Relay(RelayMessage::PeerListUpdate { peers }) => {
                Some(SignalingEvent::PeersUpdated(peers))
            }
            Inbound::Relay(RelayMessage::Broadcast { payload }) | Inbound::Envelope(payload) => {
                Some(SignalingEvent::Envelope(payload))
            }
            Inbound::Relay(RelayMessage::Pong {}) => None,
        }
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("server_url", &self.server_url)
            .field("nickname", &self.registration.nickname)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::peers::LocalIdentity;

    fn text_of(msg: Message) -> serde_json::Value {
        match msg {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text message, got {other:?}"),
        }
    }

    #[test]
    fn test_registered_requests_peers() {
        let (handle, mut rx) = RelayHandle::channel(8);
        let event = RelayClient::handle_inbound(r#"{"type":"registered"}"#, &handle);

        assert_eq!(event, Some(SignalingEvent::Registered));
        assert!(handle.is_registered());
        assert_eq!(text_of(rx.try_recv().unwrap())["type"], "getPeers");
    }

    #[test]
    fn test_peer_list_event() {
        let (handle, _rx) = RelayHandle::channel(8);
        let event = RelayClient::handle_inbound(
            r#"{"type":"peerList","peers":[{"nickname":"X"},{"nickname":"Y"}]}"#,
            &handle,
        );
        match event {
            Some(SignalingEvent::PeersUpdated(peers)) => assert_eq!(peers.len(), 2),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_and_pong_are_dropped() {
        let (handle, _rx) = RelayHandle::channel(8);
        assert_eq!(RelayClient::handle_inbound("{", &handle), None);
        assert_eq!(RelayClient::handle_inbound(r#"{"type":"pong"}"#, &handle), None);
    }

    #[test]
    fn test_broadcast_and_ping_format() {
        let (handle, mut rx) = RelayHandle::channel(8);
        let identity = LocalIdentity::with_node_id("A", "A_1", "127.0.0.1");

        handle
            .broadcast(Envelope::new(&identity, None, Payload::JoinedGroupVoice))
            .unwrap();
        handle.ping().unwrap();

        let broadcast = text_of(rx.try_recv().unwrap());
        assert_eq!(broadcast["type"], "broadcast");
        assert_eq!(broadcast["payload"]["type"], "joinedGroupVoice");
        assert_eq!(text_of(rx.try_recv().unwrap())["type"], "ping");
    }

    #[test]
    fn test_send_after_close_fails() {
        let (handle, mut rx) = RelayHandle::channel(8);
        handle.close();
        assert!(matches!(rx.try_recv(), Ok(Message::Close(None))));
        assert_eq!(handle.request_peers(), Err(SignalingError::NotConnected));
    }

    #[test]
    fn test_full_queue_reports_error() {
        let (handle, _rx) = RelayHandle::channel(1);
        handle.request_peers().unwrap();
        assert_eq!(handle.request_peers(), Err(SignalingError::QueueFull));
    }

    #[test]
    fn test_frames_leave_room_for_signaling() {
        let (handle, mut rx) = RelayHandle::channel(8);
        let identity = LocalIdentity::with_node_id("A", "A_1", "127.0.0.1");
        let frame = || {
            Envelope::new(
                &identity,
                Some("B".to_string()),
                Payload::VoiceData {
                    audio: vec![0; 16],
                    compression: CompressionInfo::default(),
                },
            )
        };

        let mut accepted = 0;
        while handle.broadcast(frame()).is_ok() {
            accepted += 1;
        }
        assert_eq!(accepted, 6);
        assert_eq!(handle.broadcast(frame()), Err(SignalingError::Congested));

        handle
            .broadcast(Envelope::new(&identity, Some("B".to_string()), Payload::CallEnded))
            .unwrap();
        handle.request_peers().unwrap();

        let types: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|msg| {
                let value = text_of(msg);
                value["payload"]["type"]
                    .as_str()
                    .unwrap_or(value["type"].as_str().unwrap())
                    .to_string()
            })
            .collect();
        assert_eq!(types.len(), 8);
        assert_eq!(types[6], "callEnded");
        assert_eq!(types[7], "getPeers");
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_pings_periodically() {
        let (handle, mut rx) = RelayHandle::channel(8);
        let task = handle.start_keepalive(Duration::from_secs(25));

        tokio::time::sleep(Duration::from_secs(51)).await;
        task.abort();

        let mut pings = 0;
        while let Ok(msg) = rx.try_recv() {
            assert_eq!(text_of(msg)["type"], "ping");
            pings += 1;
        }
        assert_eq!(pings, 2);
    }
}
