//! Message Types für das Relay-Protokoll
//!
//! Zwei Ebenen:
//! - Steuer-Nachrichten zwischen Client und Relay (`register`, `getPeers`, ...)
//! - Signaling-Envelopes, die das Relay als opaken `payload` an alle
//!   verbundenen Peers weiterverteilt
//!
//! Envelopes werden genau einmal an der Transportgrenze dekodiert.

use crate::codec::{Algorithm, CompressionResult};
use crate::signaling::peers::{LocalIdentity, PeerRecord};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Reserviertes Ziel für "alle Mitglieder des Kanals"
///
/// Enthält `@`, das in Nicknames nicht erlaubt ist.
pub const GROUP_TARGET: &str = "@group";

// ============================================================================
// CLIENT → RELAY MESSAGES
// ============================================================================

/// Alle Nachrichten, die der Client an das Relay schickt
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Anmeldung nach dem Verbindungsaufbau
    Register(Registration),

    /// Peer-Liste anfordern
    GetPeers,

    /// Envelope an alle Peers verteilen
    Broadcast { payload: Envelope },

    /// Keepalive
    Ping { timestamp: i64 },
}

/// Inhalt der `register`-Nachricht
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    pub address: String,
    pub nickname: String,
    pub channel: String,
    pub ip: String,
    pub port: u16,
    pub mode: String,
    pub capabilities: Vec<String>,
}

impl Registration {
    pub fn new(identity: &LocalIdentity, channel: String, port: u16, mode: String) -> Self {
        Self {
            address: identity.node_id.clone(),
            nickname: identity.nickname.clone(),
            channel,
            ip: identity.ip.clone(),
            port,
            mode,
            capabilities: default_capabilities(),
        }
    }
}

/// Fähigkeiten, die dieser Client ankündigt
pub fn default_capabilities() -> Vec<String> {
    ["voice", "video", "chat", "call"]
        .into_iter()
        .map(String::from)
        .collect()
}

// ============================================================================
// RELAY → CLIENT MESSAGES
// ============================================================================

/// Alle Steuer-Nachrichten des Relays
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RelayMessage {
    /// Begrüßung direkt nach dem Verbindungsaufbau
    Welcome {
        #[serde(default)]
        message: Option<String>,
    },

    /// Registrierung bestätigt
    Registered {
        #[serde(default)]
        nickname: Option<String>,
    },

    /// Vollständige Peer-Liste
    PeerList {
        #[serde(default)]
        peers: Vec<PeerRecord>,
    },

    /// Aktualisierte Peer-Liste (ersetzt ebenfalls komplett)
    PeerListUpdate {
        #[serde(default)]
        peers: Vec<PeerRecord>,
    },

    /// Weitergeleiteter Broadcast eines anderen Peers
    Broadcast { payload: Envelope },

    /// Antwort auf Keepalive (wird ignoriert)
    Pong {},
}

/// Ergebnis der Dekodierung einer eingehenden Textnachricht
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Relay(RelayMessage),
    Envelope(Envelope),
}

/// Dekodiert eine eingehende Nachricht
///
/// Relays leiten Broadcasts entweder verpackt (`{type:"broadcast", payload}`)
/// oder direkt als Envelope weiter; beides wird akzeptiert. Alles andere
/// ergibt `None` und wird vom Aufrufer verworfen.
pub fn decode_inbound(text: &str) -> Option<Inbound> {
    match serde_json::from_str::<RelayMessage>(text) {
        Ok(RelayMessage::Broadcast { payload }) => Some(Inbound::Envelope(payload)),
        Ok(msg) => Some(Inbound::Relay(msg)),
        Err(_) => serde_json::from_str::<Envelope>(text)
            .ok()
            .map(Inbound::Envelope),
    }
}

// ============================================================================
// SIGNALING ENVELOPE
// ============================================================================

/// Signaling-Envelope (wird nach dem Erstellen nicht mehr verändert)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Node-ID des Absenders
    pub from: String,
    /// Nickname des Absenders
    pub nickname: String,
    /// Nickname des Empfängers oder [`GROUP_TARGET`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Envelope {
    pub fn new(identity: &LocalIdentity, target: Option<String>, payload: Payload) -> Self {
        Self {
            from: identity.node_id.clone(),
            nickname: identity.nickname.clone(),
            target,
            timestamp: Utc::now().timestamp_millis(),
            payload,
        }
    }

    /// Ist dieses Envelope an `nickname` adressiert?
    pub fn is_addressed_to(&self, nickname: &str) -> bool {
        self.target.as_deref() == Some(nickname)
    }

    /// Ist dieses Envelope an die Gruppe adressiert?
    pub fn is_for_group(&self) -> bool {
        self.target.as_deref() == Some(GROUP_TARGET)
    }
}

/// Typ-spezifischer Inhalt eines Envelopes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Payload {
    CallRequest {
        #[serde(rename = "hasVideo", default)]
        has_video: bool,
    },
    CallAccepted,
    CallRejected,
    CallBusy,
    CallEnded,
    VoiceData {
        #[serde(with = "base64_bytes")]
        audio: Vec<u8>,
        #[serde(default)]
        compression: CompressionInfo,
    },
    VoiceStatus {
        status: StreamStatus,
    },
    VideoFrame {
        #[serde(with = "base64_bytes")]
        frame: Vec<u8>,
        #[serde(default)]
        compression: CompressionInfo,
    },
    VideoStatus {
        status: StreamStatus,
    },
    JoinedGroupVoice,
    LeftGroupVoice,
    ChatMessage {
        message: String,
    },
}

impl Payload {
    /// Wire-Name des Typs (für Logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Payload::CallRequest { .. } => "callRequest",
            Payload::CallAccepted => "callAccepted",
            Payload::CallRejected => "callRejected",
            Payload::CallBusy => "callBusy",
            Payload::CallEnded => "callEnded",
            Payload::VoiceData { .. } => "voiceData",
            Payload::VoiceStatus { .. } => "voiceStatus",
            Payload::VideoFrame { .. } => "videoFrame",
            Payload::VideoStatus { .. } => "videoStatus",
            Payload::JoinedGroupVoice => "joinedGroupVoice",
            Payload::LeftGroupVoice => "leftGroupVoice",
            Payload::ChatMessage { .. } => "chatMessage",
        }
    }

    /// Audio-Chunk oder Video-Frame (darf bei Überlast verworfen werden)
    pub fn is_frame(&self) -> bool {
        matches!(self, Payload::VoiceData { .. } | Payload::VideoFrame { .. })
    }

    /// Medien-Envelope (unterliegt dem Annahmefilter)?
    pub fn is_media(&self) -> bool {
        matches!(
            self,
            Payload::VoiceData { .. }
                | Payload::VoiceStatus { .. }
                | Payload::VideoFrame { .. }
                | Payload::VideoStatus { .. }
        )
    }
}

/// Status einer Sende-Pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Started,
    Stopped,
}

/// Beschreibung der Kompression im Envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionInfo {
    #[serde(default)]
    pub algorithm: Algorithm,
    #[serde(default)]
    pub original_size: usize,
    #[serde(default)]
    pub compressed_size: usize,
    #[serde(default = "default_ratio")]
    pub ratio: f64,
}

fn default_ratio() -> f64 {
    1.0
}

impl Default for CompressionInfo {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            original_size: 0,
            compressed_size: 0,
            ratio: 1.0,
        }
    }
}

impl From<&CompressionResult> for CompressionInfo {
    fn from(result: &CompressionResult) -> Self {
        Self {
            algorithm: result.algorithm,
            original_size: result.original_size,
            compressed_size: result.compressed_size,
            ratio: result.ratio,
        }
    }
}

/// Binärdaten als Base64-String im JSON
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded.as_bytes()).map_err(de::Error::custom)
    }
}

// ============================================================================
// TESTS
// ============================================================================
