//! Session-Zustand
//!
//! `CallState` ist die einzige Instanz, die entscheidet, ob Medien-Pipelines
//! laufen dürfen. Die Übergänge selbst macht der `SessionController`.

use crate::signaling::GROUP_TARGET;
use std::fmt;

// ============================================================================
// CALL STATE
// ============================================================================

/// Aktueller Status der Session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    /// Kein aktiver Anruf
    #[default]
    Idle,
    /// Ausgehender Anruf wartet auf Antwort
    Calling,
    /// Eingehender Anruf wartet auf Antwort
    Ringing,
    /// Anruf mit einem Partner aktiv
    InCall,
    /// Teilnahme am Gruppen-Voice des Kanals
    InGroup,
}

impl CallState {
    /// Dürfen in diesem Zustand Medien gesendet werden?
    pub fn allows_media(&self) -> bool {
        matches!(self, CallState::InCall | CallState::InGroup)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Idle => "IDLE",
            CallState::Calling => "CALLING",
            CallState::Ringing => "RINGING",
            CallState::InCall => "IN_CALL",
            CallState::InGroup => "IN_GROUP",
        };
        f.write_str(name)
    }
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Zustand plus Gegenstelle
///
/// Die Felder werden nur über die Übergangsmethoden gesetzt, so dass
/// `partner` und `incoming_caller` immer zum Zustand passen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallSession {
    state: CallState,
    partner: Option<String>,
    incoming_caller: Option<String>,
    /// Eingehender Anruf mit Video angekündigt
    incoming_video: bool,
}

impl CallSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn partner(&self) -> Option<&str> {
        self.partner.as_deref()
    }

    pub fn incoming_caller(&self) -> Option<&str> {
        self.incoming_caller.as_deref()
    }

    pub fn incoming_video(&self) -> bool {
        self.incoming_video
    }

    /// Ziel für ausgehende Medien-Envelopes
    pub fn media_target(&self) -> Option<String> {
        match self.state {
            CallState::InCall => self.partner.clone(),
            CallState::InGroup => Some(GROUP_TARGET.to_string()),
            _ => None,
        }
    }

    pub(crate) fn calling(&mut self, partner: String) {
        self.state = CallState::Calling;
        self.partner = Some(partner);
        self.incoming_caller = None;
        self.incoming_video = false;
    }

    pub(crate) fn ringing(&mut self, caller: String, has_video: bool) {
        self.state = CallState::Ringing;
        self.partner = None;
        self.incoming_caller = Some(caller);
        self.incoming_video = has_video;
    }

    pub(crate) fn in_call(&mut self, partner: String) {
        self.state = CallState::InCall;
        self.partner = Some(partner);
        self.incoming_caller = None;
        self.incoming_video = false;
    }

    pub(crate) fn in_group(&mut self) {
        self.state = CallState::InGroup;
        self.partner = None;
        self.incoming_caller = None;
        self.incoming_video = false;
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}

// ============================================================================
// TRANSMISSION FLAGS
// ============================================================================

/// Sende-/Empfangsschalter, unabhängig vom Zustand
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransmissionFlags {
    /// Mikrofon sendet
    pub talking: bool,
    /// Kamera sendet
    pub video_on: bool,
    /// Eingehendes Audio nicht abspielen
    pub muted: bool,
}

impl TransmissionFlags {
    /// Schaltet beide Sende-Pipelines ab, `muted` bleibt erhalten
    pub fn clear_transmission(&mut self) {
        self.talking = false;
        self.video_on = false;
    }
}

// ============================================================================
// TESTS
// ============================================================================
