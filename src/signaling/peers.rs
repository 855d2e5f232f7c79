//! Peer Registry und lokale Identität
//!
//! Die Peer-Liste wird bei jedem `peerList`/`peerListUpdate` komplett
//! ersetzt. Es gibt keine partiellen Updates.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, UdpSocket};

// ============================================================================
// PEER RECORD
// ============================================================================

/// Entfernter Peer, wie ihn das Relay meldet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Opake Transport-ID (Node-ID des Peers)
    #[serde(default)]
    pub address: String,
    pub nickname: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl PeerRecord {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

// ============================================================================
// LOCAL IDENTITY
// ============================================================================

/// Identität dieses Prozesses (nach dem Verbinden unveränderlich)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub nickname: String,
    /// Nickname + Zeitstempel des Verbindungsaufbaus
    pub node_id: String,
    pub ip: String,
}

impl LocalIdentity {
    /// Erzeugt eine neue Identität mit frischer Node-ID
    pub fn new(nickname: impl Into<String>, ip: impl Into<String>) -> Self {
        let nickname = nickname.into();
        let node_id = format!("{}_{}", nickname, Utc::now().timestamp_millis());
        Self {
            nickname,
            node_id,
            ip: ip.into(),
        }
    }

    pub fn with_node_id(
        nickname: impl Into<String>,
        node_id: impl Into<String>,
        ip: impl Into<String>,
    ) -> Self {
        Self {
            nickname: nickname.into(),
            node_id: node_id.into(),
            ip: ip.into(),
        }
    }

    /// Gehört ein Nickname zu diesem Prozess?
    pub fn is_self(&self, nickname: &str) -> bool {
        self.nickname == nickname
    }
}

/// Ermittelt die lokale IP-Adresse über die Route zum Internet
///
/// Es werden keine Pakete gesendet; `connect` auf einem UDP-Socket
/// wählt nur das ausgehende Interface.
pub fn detect_local_ip() -> String {
    let route = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
        Ok(socket.local_addr()?.ip())
    };

    match route() {
        Ok(ip) if !ip.is_unspecified() => ip.to_string(),
        Ok(_) => Ipv4Addr::LOCALHOST.to_string(),
        Err(e) => {
            tracing::debug!("Local IP detection failed: {}", e);
            Ipv4Addr::LOCALHOST.to_string()
        }
    }
}

// ============================================================================
// PEER REGISTRY
// ============================================================================

/// Zuletzt bekannte Peer-Menge (an die Relay-Verbindung gebunden)
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Vec<PeerRecord>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ersetzt die komplette Peer-Menge
    pub fn replace(&mut self, peers: Vec<PeerRecord>) {
        tracing::debug!("Peer list replaced ({} peers)", peers.len());
        self.peers = peers;
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn all(&self) -> &[PeerRecord] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Alle Peers außer dem lokalen
    pub fn remote<'a, 'b>(
        &'a self,
        local_nickname: &'b str,
    ) -> impl Iterator<Item = &'a PeerRecord> + 'b
    where
        'a: 'b,
    {
        self.peers.iter().filter(move |p| p.nickname != local_nickname)
    }

    pub fn contains(&self, nickname: &str) -> bool {
        self.peers.iter().any(|p| p.nickname == nickname)
    }

    /// Löst einen eingegebenen Namen zu einem entfernten Peer auf
    ///
    /// Reihenfolge: exakt, ohne Groß-/Kleinschreibung, dann Präfix in
    /// beide Richtungen. Der lokale Peer wird nie gefunden.
    pub fn resolve(&self, name: &str, local_nickname: &str) -> Option<&PeerRecord> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        let lower = name.to_lowercase();

        self.remote(local_nickname)
            .find(|p| p.nickname == name)
            .or_else(|| {
                self.remote(local_nickname)
                    .find(|p| p.nickname.to_lowercase() == lower)
            })
            .or_else(|| {
                self.remote(local_nickname).find(|p| {
                    let nick = p.nickname.to_lowercase();
                    nick.starts_with(&lower) || lower.starts_with(&nick)
                })
            })
    }
}

// ============================================================================
// TESTS
// ============================================================================
