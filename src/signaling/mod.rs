//! Signaling Module - WebSocket Client für den Relay-Server
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Relay:
//! - WebSocket-Verbindung aufbauen und halten
//! - Registrierung und Peer-Liste
//! - Envelopes typsicher kodieren und dekodieren
//!

mod client;
mod messages;
mod peers;

pub use client::{RelayClient, RelayConnection, RelayHandle, SignalingError, SignalingEvent};
pub use messages::*;
pub use peers::{detect_local_ip, LocalIdentity, PeerRecord, PeerRegistry};
