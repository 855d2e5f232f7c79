//! Session Controller
//!
//! Einzige Instanz, die den Anruf-/Gruppenzustand verändert, Capture-
//! Pipelines startet/stoppt und entscheidet, ob empfangene Medien
//! abgespielt werden.
//!
//! Alle Eingaben (Befehle, Relay-Events, Capture-Frames, Timer) werden
//! nacheinander von der Steuerschleife an den Controller übergeben.
//! Dadurch gibt es genau einen Schreiber und keine Locks auf dem Zustand.

use super::state::{CallSession, CallState, TransmissionFlags};
use crate::codec::Compressor;
use crate::devices::{rediscover, Device, DeviceError, DeviceRegistry, DeviceSelector, MediaKind};
use crate::media::{
    CaptureBackend, CaptureError, CaptureEvent, CaptureProcess, CaptureRequest, MediaReceiver,
};
use crate::signaling::{
    CompressionInfo, Envelope, LocalIdentity, Payload, PeerRegistry, RelayHandle,
    SignalingError, SignalingEvent, StreamStatus, GROUP_TARGET,
};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Puffer für Frames aus den Capture-Prozessen
const CAPTURE_CAPACITY: usize = 32;

const TIMER_CAPACITY: usize = 16;

const EVENT_CAPACITY: usize = 100;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: CallState,
    },

    #[error("No peer named '{0}' found")]
    PeerNotFound(String),

    #[error("Not in a call or group voice")]
    NotInSession,

    #[error("The {0} is already in use")]
    PipelineBusy(MediaKind),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

// ============================================================================
// EVENTS
// ============================================================================

/// Grund für einen gescheiterten ausgehenden Anruf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallFailure {
    Rejected,
    Busy,
    NoAnswer,
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallFailure::Rejected => write!(f, "rejected"),
            CallFailure::Busy => write!(f, "busy"),
            CallFailure::NoAnswer => write!(f, "no answer"),
        }
    }
}

/// Wofür eine Capture-Pipeline gerade läuft
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    /// Frames gehen komprimiert ans Relay
    Transmit,
    /// Lokale Kamera-Vorschau
    Preview,
    /// Ein einzelner Frame, dann Stopp
    Snapshot,
    /// Aufnahme für die lokale Mikrofon-Wiedergabe
    MicTest,
}

impl fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineMode::Transmit => write!(f, "transmit"),
            PipelineMode::Preview => write!(f, "preview"),
            PipelineMode::Snapshot => write!(f, "snapshot"),
            PipelineMode::MicTest => write!(f, "mic test"),
        }
    }
}

/// Events die vom SessionController ausgelöst werden
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged { from: CallState, to: CallState },
    IncomingCall { caller: String, has_video: bool },
    /// Wiederholtes Klingeln solange RINGING
    Ring { caller: String },
    CallConnected { partner: String },
    CallFailed { partner: String, reason: CallFailure },
    CallEnded { partner: String, by_peer: bool },
    MissedCall { caller: String },
    Chat { from: String, message: String, direct: bool },
    /// Start/Stopp der Sende-Pipeline eines anderen Peers
    PeerMedia { nickname: String, kind: MediaKind, status: StreamStatus },
    GroupPresence { nickname: String, joined: bool },
    PeersUpdated { count: usize },
    PipelineChanged { kind: MediaKind, mode: PipelineMode, active: bool },
    DeviceFault { kind: MediaKind, error: String },
    Notice(String),
}

/// Timer-Nachrichten an die Steuerschleife
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    CallTimeout { call_id: u64 },
    Ring { call_id: u64 },
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Wartezeit auf eine Antwort beim ausgehenden Anruf
    pub call_timeout: Duration,
    /// Abstand der Ring-Benachrichtigungen
    pub ring_interval: Duration,
    /// Aufnahmelänge des Mikrofon-Tests in Bytes PCM
    pub mic_test_bytes: usize,
    pub compressor: Compressor,
    /// ffmpeg für die erneute Geräteerkennung
    pub ffmpeg: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            ring_interval: Duration::from_secs(3),
            // 3 s bei 16 kHz mono s16le
            mic_test_bytes: 3 * 32_000,
            compressor: Compressor::default(),
            ffmpeg: "ffmpeg".to_string(),
        }
    }
}

/// Empfänger, die die Steuerschleife neben den Relay-Events abfragt
pub struct SessionChannels {
    pub capture_rx: mpsc::Receiver<CaptureEvent>,
    pub timer_rx: mpsc::Receiver<TimerEvent>,
}

/// Momentaufnahme für `/status`
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub nickname: String,
    pub node_id: String,
    pub connected: bool,
    pub state: CallState,
    pub partner: Option<String>,
    pub incoming_caller: Option<String>,
    pub flags: TransmissionFlags,
    pub audio_pipeline: Option<PipelineMode>,
    pub video_pipeline: Option<PipelineMode>,
    pub camera: Option<Device>,
    pub microphone: Option<Device>,
    pub roster: Vec<String>,
    pub peer_count: usize,
}

// ============================================================================
// PIPELINE
// ============================================================================

struct Pipeline {
    mode: PipelineMode,
    generation: u64,
    device: Device,
    process: Box<dyn CaptureProcess>,
    frames: u64,
    bytes: u64,
}

// ============================================================================
// SESSION CONTROLLER
// ============================================================================

pub struct SessionController {
    identity: LocalIdentity,
    relay: RelayHandle,
    peers: PeerRegistry,
    devices: DeviceRegistry,
    capture: Box<dyn CaptureBackend>,
    receiver: MediaReceiver,
    config: SessionConfig,

    session: CallSession,
    flags: TransmissionFlags,
    roster: BTreeSet<String>,

    audio: Option<Pipeline>,
    video: Option<Pipeline>,
    next_generation: u64,
    mic_test_buffer: Vec<u8>,

    /// Erhöht sich bei jedem ausgehenden/eingehenden Anruf
    call_id: u64,
    call_timer: Option<JoinHandle<()>>,
    ring_timer: Option<JoinHandle<()>>,

    capture_tx: mpsc::Sender<CaptureEvent>,
    timer_tx: mpsc::Sender<TimerEvent>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl SessionController {
    /// Erstellt einen neuen SessionController
    pub fn new(
        identity: LocalIdentity,
        relay: RelayHandle,
        devices: DeviceRegistry,
        capture: Box<dyn CaptureBackend>,
        receiver: MediaReceiver,
        config: SessionConfig,
    ) -> (Self, SessionChannels) {
        let (capture_tx, capture_rx) = mpsc::channel(CAPTURE_CAPACITY);
        let (timer_tx, timer_rx) = mpsc::channel(TIMER_CAPACITY);
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let controller = Self {
            identity,
            relay,
            peers: PeerRegistry::new(),
            devices,
            capture,
            receiver,
            config,
            session: CallSession::new(),
            flags: TransmissionFlags::default(),
            roster: BTreeSet::new(),
            audio: None,
            video: None,
            next_generation: 0,
            mic_test_buffer: Vec::new(),
            call_id: 0,
            call_timer: None,
            ring_timer: None,
            capture_tx,
            timer_tx,
            event_tx,
        };

        (
            controller,
            SessionChannels {
                capture_rx,
                timer_rx,
            },
        )
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn state(&self) -> CallState {
        self.session.state()
    }

    pub fn session(&self) -> &CallSession {
        &self.session
    }

    pub fn flags(&self) -> TransmissionFlags {
        self.flags
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    pub fn roster(&self) -> &BTreeSet<String> {
        &self.roster
    }

    pub fn pipeline_mode(&self, kind: MediaKind) -> Option<PipelineMode> {
        self.slot(kind).as_ref().map(|p| p.mode)
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            nickname: self.identity.nickname.clone(),
            node_id: self.identity.node_id.clone(),
            connected: self.relay.is_connected(),
            state: self.session.state(),
            partner: self.session.partner().map(str::to_string),
            incoming_caller: self.session.incoming_caller().map(str::to_string),
            flags: self.flags,
            audio_pipeline: self.pipeline_mode(MediaKind::Audio),
            video_pipeline: self.pipeline_mode(MediaKind::Video),
            camera: self.devices.current(MediaKind::Video).ok().cloned(),
            microphone: self.devices.current(MediaKind::Audio).ok().cloned(),
            roster: self.roster.iter().cloned().collect(),
            peer_count: self.peers.remote(&self.identity.nickname).count(),
        }
    }

    // ========================================================================
    // CALL COMMANDS
    // ========================================================================

    /// Startet einen ausgehenden Anruf
    pub fn call(&mut self, name: &str) -> Result<(), SessionError> {
        self.require(CallState::Idle, "start a call")?;

        let partner = self
            .peers
            .resolve(name, &self.identity.nickname)
            .map(|p| p.nickname.clone())
            .ok_or_else(|| SessionError::PeerNotFound(name.trim().to_string()))?;

        let has_video = self.devices.current(MediaKind::Video).is_ok();
        self.send(Some(partner.clone()), Payload::CallRequest { has_video })?;

        tracing::info!("Calling {}", partner);
        self.transition(|s| s.calling(partner));
        self.start_call_timer();
        Ok(())
    }

    /// Nimmt den eingehenden Anruf an
    pub fn answer(&mut self) -> Result<(), SessionError> {
        self.require(CallState::Ringing, "answer")?;
        let caller = self.incoming_caller()?;

        self.send(Some(caller.clone()), Payload::CallAccepted)?;
        self.stop_ringing();

        tracing::info!("Call with {} accepted", caller);
        self.transition(|s| s.in_call(caller.clone()));
        self.emit(SessionEvent::CallConnected { partner: caller });
        Ok(())
    }

    /// Lehnt den eingehenden Anruf ab
    pub fn reject(&mut self) -> Result<(), SessionError> {
        self.require(CallState::Ringing, "reject")?;
        let caller = self.incoming_caller()?;

        self.send(Some(caller.clone()), Payload::CallRejected)?;
        tracing::info!("Call from {} rejected", caller);
        self.go_idle();
        Ok(())
    }

    /// Beendet Anruf, ausgehenden Anrufversuch oder Gruppen-Voice
    pub fn hangup(&mut self) -> Result<(), SessionError> {
        match self.session.state() {
            CallState::InCall => {
                let partner = self.session.partner().unwrap_or_default().to_string();
                self.stop_transmission();
                self.notify(Some(partner.clone()), Payload::CallEnded);
                tracing::info!("Hung up on {}", partner);
                self.go_idle();
                self.emit(SessionEvent::CallEnded {
                    partner,
                    by_peer: false,
                });
                Ok(())
            }
            CallState::Calling => {
                let partner = self.session.partner().unwrap_or_default().to_string();
                self.notify(Some(partner.clone()), Payload::CallEnded);
                tracing::info!("Call to {} cancelled", partner);
                self.go_idle();
                self.emit(SessionEvent::Notice(format!("Call to {partner} cancelled")));
                Ok(())
            }
            CallState::Ringing => self.reject(),
            CallState::InGroup => self.leave_group(),
            state => Err(SessionError::InvalidState {
                action: "hang up",
                state,
            }),
        }
    }

    /// Tritt dem Gruppen-Voice des Kanals bei
    pub fn join_group(&mut self) -> Result<(), SessionError> {
        match self.session.state() {
            CallState::Idle => {}
            CallState::InGroup => {
                self.emit(SessionEvent::Notice("Already in group voice".to_string()));
                return Ok(());
            }
            state => {
                return Err(SessionError::InvalidState {
                    action: "join the group voice",
                    state,
                })
            }
        }

        self.send(Some(GROUP_TARGET.to_string()), Payload::JoinedGroupVoice)?;
        tracing::info!("Joined group voice");
        self.transition(CallSession::in_group);
        Ok(())
    }

    /// Verlässt das Gruppen-Voice
    pub fn leave_group(&mut self) -> Result<(), SessionError> {
        self.require(CallState::InGroup, "leave the group voice")?;

        self.stop_transmission();
        self.notify(Some(GROUP_TARGET.to_string()), Payload::LeftGroupVoice);
        tracing::info!("Left group voice");
        self.go_idle();
        Ok(())
    }

    // ========================================================================
    // MEDIA COMMANDS
    // ========================================================================

    /// Startet die Mikrofon-Übertragung
    pub fn start_talking(&mut self) -> Result<(), SessionError> {
        self.start_transmit(MediaKind::Audio)
    }

    /// Stoppt die Mikrofon-Übertragung
    pub fn stop_talking(&mut self) -> Result<(), SessionError> {
        if !self.flags.talking {
            self.emit(SessionEvent::Notice("Not talking".to_string()));
            return Ok(());
        }
        self.stop_transmit(MediaKind::Audio);
        Ok(())
    }

    /// Schaltet die Kamera-Übertragung ein oder aus
    pub fn set_video(&mut self, on: bool) -> Result<(), SessionError> {
        if on {
            // Eine laufende Vorschau wird durch die Übertragung ersetzt
            if self.pipeline_mode(MediaKind::Video) == Some(PipelineMode::Preview) {
                self.stop_pipeline(MediaKind::Video);
            }
            return self.start_transmit(MediaKind::Video);
        }

        match self.pipeline_mode(MediaKind::Video) {
            Some(PipelineMode::Transmit) => self.stop_transmit(MediaKind::Video),
            Some(PipelineMode::Preview) => {
                self.stop_pipeline(MediaKind::Video);
                self.emit(SessionEvent::Notice("Local preview stopped".to_string()));
            }
            _ => self.emit(SessionEvent::Notice("Video is not on".to_string())),
        }
        Ok(())
    }

    /// Startet eine lokale Kamera-Vorschau (ohne Senden)
    pub fn video_test(&mut self) -> Result<(), SessionError> {
        self.start_local(MediaKind::Video, PipelineMode::Preview)?;
        self.emit(SessionEvent::Notice(
            "Local preview started, /video off to stop".to_string(),
        ));
        Ok(())
    }

    /// Nimmt einen einzelnen Frame auf und zeigt ihn lokal an
    pub fn camera_test(&mut self) -> Result<(), SessionError> {
        self.start_local(MediaKind::Video, PipelineMode::Snapshot)
    }

    /// Nimmt kurz auf und spielt die Aufnahme lokal ab
    pub fn mic_test(&mut self) -> Result<(), SessionError> {
        self.start_local(MediaKind::Audio, PipelineMode::MicTest)?;
        self.mic_test_buffer.clear();
        self.emit(SessionEvent::Notice("Recording, speak now".to_string()));
        Ok(())
    }

    /// Wählt Kamera oder Mikrofon für den nächsten Capture-Start
    pub fn select_device(
        &mut self,
        kind: MediaKind,
        selector: &DeviceSelector,
    ) -> Result<Device, SessionError> {
        let device = self.devices.select(kind, selector)?;
        if self.slot(kind).is_some() {
            self.emit(SessionEvent::Notice(format!(
                "{kind} {device} is used from the next start"
            )));
        }
        Ok(device)
    }

    /// Erkennt die Geräte eines Typs neu
    pub fn refresh_devices(&mut self, kind: MediaKind) -> Result<(), SessionError> {
        rediscover(&mut self.devices, kind, &self.config.ffmpeg)?;
        Ok(())
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.flags.muted = muted;
        tracing::info!("Incoming audio {}", if muted { "muted" } else { "unmuted" });
    }

    /// Sendet eine Chat-Nachricht an den Partner bzw. die Gruppe
    pub fn send_chat(&mut self, message: &str) -> Result<(), SessionError> {
        let target = match self.session.state() {
            CallState::InCall => self.session.partner().map(str::to_string),
            _ => Some(GROUP_TARGET.to_string()),
        };
        self.send(
            target,
            Payload::ChatMessage {
                message: message.to_string(),
            },
        )?;
        Ok(())
    }

    /// Stoppt alle Pipelines und meldet sich bei Partner/Gruppe ab
    pub fn shutdown(&mut self) {
        self.stop_transmission();

        match self.session.state() {
            CallState::InCall | CallState::Calling => {
                let partner = self.session.partner().map(str::to_string);
                self.notify(partner, Payload::CallEnded);
            }
            CallState::Ringing => {
                let caller = self.session.incoming_caller().map(str::to_string);
                self.notify(caller, Payload::CallRejected);
            }
            CallState::InGroup => {
                self.notify(Some(GROUP_TARGET.to_string()), Payload::LeftGroupVoice);
            }
            CallState::Idle => {}
        }

        self.go_idle();
        self.stop_pipeline(MediaKind::Audio);
        self.stop_pipeline(MediaKind::Video);
        tracing::info!("Session shut down");
    }

    // ========================================================================
    // SIGNALING EVENTS
    // ========================================================================

    /// Verarbeitet ein Event der Relay-Verbindung
    pub fn handle_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Welcome => tracing::debug!("Relay welcome received"),
            SignalingEvent::Registered => {
                tracing::info!("Registered as {}", self.identity.nickname);
            }
            SignalingEvent::PeersUpdated(peers) => {
                self.peers.replace(peers);
                let peers = &self.peers;
                self.roster.retain(|nickname| peers.contains(nickname));
                let count = self.peers.remote(&self.identity.nickname).count();
                self.emit(SessionEvent::PeersUpdated { count });
            }
            SignalingEvent::Envelope(envelope) => self.handle_envelope(envelope),
            SignalingEvent::Disconnected { reason } => {
                tracing::warn!(
                    "Relay disconnected{}",
                    reason.map(|r| format!(": {r}")).unwrap_or_default()
                );
                self.go_idle();
                self.stop_pipeline(MediaKind::Audio);
                self.stop_pipeline(MediaKind::Video);
                self.peers.clear();
                self.roster.clear();
            }
        }
    }

    /// Verarbeitet ein empfangenes Envelope
    pub fn handle_envelope(&mut self, envelope: Envelope) {
        if self.identity.is_self(&envelope.nickname) || envelope.from == self.identity.node_id {
            tracing::trace!("Ignoring own {}", envelope.payload.type_name());
            return;
        }

        if envelope.payload.is_media() {
            if self.accepts_media(&envelope) {
                self.handle_media(envelope);
            } else {
                tracing::trace!(
                    "Dropping {} from {} in state {}",
                    envelope.payload.type_name(),
                    envelope.nickname,
                    self.session.state()
                );
            }
            return;
        }

        let sender = envelope.nickname.clone();
        let for_me = envelope.is_addressed_to(&self.identity.nickname);
        let for_channel = envelope.target.is_none() || envelope.is_for_group();

        match envelope.payload {
            Payload::CallRequest { has_video } if for_me => self.on_call_request(sender, has_video),
            Payload::CallAccepted if for_me => self.on_call_accepted(sender),
            Payload::CallRejected if for_me => self.on_call_failed(sender, CallFailure::Rejected),
            Payload::CallBusy if for_me => self.on_call_failed(sender, CallFailure::Busy),
            Payload::CallEnded if for_me => self.on_call_ended(sender),
            Payload::JoinedGroupVoice => {
                if self.roster.insert(sender.clone()) {
                    self.emit(SessionEvent::GroupPresence {
                        nickname: sender,
                        joined: true,
                    });
                }
            }
            Payload::LeftGroupVoice => {
                if self.roster.remove(&sender) {
                    self.emit(SessionEvent::GroupPresence {
                        nickname: sender,
                        joined: false,
                    });
                }
            }
            Payload::ChatMessage { message } => {
                if for_me || for_channel {
                    self.emit(SessionEvent::Chat {
                        from: sender,
                        message,
                        direct: for_me,
                    });
                }
            }
            other => tracing::trace!("Ignoring {} not addressed to us", other.type_name()),
        }
    }

    fn on_call_request(&mut self, caller: String, has_video: bool) {
        match self.session.state() {
            CallState::Idle => {
                tracing::info!("Incoming call from {}", caller);
                self.transition(|s| s.ringing(caller.clone(), has_video));
                self.start_ringing();
                self.emit(SessionEvent::IncomingCall { caller, has_video });
            }
            state => {
                tracing::info!("Busy ({}), rejecting call from {}", state, caller);
                self.notify(Some(caller.clone()), Payload::CallBusy);
                self.emit(SessionEvent::Notice(format!(
                    "Missed call from {caller} (busy)"
                )));
            }
        }
    }

    fn on_call_accepted(&mut self, sender: String) {
        if !self.is_calling(&sender) {
            tracing::debug!("Ignoring callAccepted from {}", sender);
            return;
        }
        self.cancel_call_timer();
        tracing::info!("{} accepted the call", sender);
        self.transition(|s| s.in_call(sender.clone()));
        self.emit(SessionEvent::CallConnected { partner: sender });
    }

    fn on_call_failed(&mut self, sender: String, reason: CallFailure) {
        if !self.is_calling(&sender) {
            tracing::debug!("Ignoring call {} from {}", reason, sender);
            return;
        }
        tracing::info!("Call to {} failed: {}", sender, reason);
        self.go_idle();
        self.emit(SessionEvent::CallFailed {
            partner: sender,
            reason,
        });
    }

    fn on_call_ended(&mut self, sender: String) {
        match self.session.state() {
            CallState::InCall if self.session.partner() == Some(sender.as_str()) => {
                tracing::info!("{} ended the call", sender);
                self.go_idle();
                self.emit(SessionEvent::CallEnded {
                    partner: sender,
                    by_peer: true,
                });
            }
            CallState::Ringing if self.session.incoming_caller() == Some(sender.as_str()) => {
                tracing::info!("{} hung up before we answered", sender);
                self.go_idle();
                self.emit(SessionEvent::MissedCall { caller: sender });
            }
            _ => tracing::debug!("Ignoring callEnded from {}", sender),
        }
    }

    /// Annahmefilter für Medien- und Status-Envelopes
    fn accepts_media(&self, envelope: &Envelope) -> bool {
        match self.session.state() {
            CallState::InCall => {
                self.session.partner() == Some(envelope.nickname.as_str())
                    && envelope.is_addressed_to(&self.identity.nickname)
            }
            CallState::InGroup => envelope.is_for_group(),
            _ => false,
        }
    }

    fn handle_media(&mut self, envelope: Envelope) {
        let sender = envelope.nickname;
        match envelope.payload {
            Payload::VoiceData { audio, compression } => {
                self.receiver
                    .receive_audio(&audio, compression.algorithm, self.flags.muted);
            }
            Payload::VideoFrame { frame, compression } => {
                if let Err(e) = self.receiver.receive_video(&frame, compression.algorithm) {
                    tracing::warn!("Failed to show frame from {}: {}", sender, e);
                }
            }
            Payload::VoiceStatus { status } => self.emit(SessionEvent::PeerMedia {
                nickname: sender,
                kind: MediaKind::Audio,
                status,
            }),
            Payload::VideoStatus { status } => self.emit(SessionEvent::PeerMedia {
                nickname: sender,
                kind: MediaKind::Video,
                status,
            }),
            _ => {}
        }
    }

    // ========================================================================
    // CAPTURE EVENTS
    // ========================================================================

    /// Verarbeitet einen Frame oder das Ende eines Capture-Prozesses
    pub fn handle_capture(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::Frame {
                kind,
                generation,
                data,
            } => {
                let Some(pipeline) = self.live_pipeline(kind, generation) else {
                    tracing::trace!("Dropping stale {} frame (generation {})", kind, generation);
                    return;
                };
                pipeline.frames += 1;
                pipeline.bytes += data.len() as u64;
                let mode = pipeline.mode;

                match mode {
                    PipelineMode::Transmit => self.transmit_frame(kind, &data),
                    PipelineMode::Preview => {
                        if let Err(e) = self.receiver.show_local_frame(&data) {
                            tracing::warn!("Preview frame not shown: {}", e);
                        }
                    }
                    PipelineMode::Snapshot => {
                        self.stop_pipeline(kind);
                        match self.receiver.show_local_frame(&data) {
                            Ok(path) => self.emit(SessionEvent::Notice(format!(
                                "Camera OK, snapshot saved to {}",
                                path.display()
                            ))),
                            Err(e) => self.emit(SessionEvent::DeviceFault {
                                kind,
                                error: e.to_string(),
                            }),
                        }
                    }
                    PipelineMode::MicTest => {
                        self.mic_test_buffer.extend_from_slice(&data);
                        if self.mic_test_buffer.len() >= self.config.mic_test_bytes {
                            self.stop_pipeline(kind);
                            self.play_mic_test();
                        }
                    }
                }
            }
            CaptureEvent::Ended {
                kind,
                generation,
                error,
            } => {
                if self.live_pipeline(kind, generation).is_none() {
                    return;
                }
                let Some(pipeline) = self.stop_pipeline(kind) else {
                    return;
                };

                match pipeline.mode {
                    PipelineMode::Transmit => {
                        // Session bleibt bestehen, nur die Pipeline ist weg
                        self.set_flag(kind, false);
                        self.send_status(kind, StreamStatus::Stopped);
                    }
                    PipelineMode::MicTest => self.play_mic_test(),
                    _ => {}
                }

                match error {
                    Some(error) => {
                        tracing::error!("{} capture failed: {}", kind, error);
                        self.emit(SessionEvent::DeviceFault { kind, error });
                    }
                    None => self.emit(SessionEvent::Notice(format!(
                        "{kind} capture ended after {} frames",
                        pipeline.frames
                    ))),
                }
            }
        }
    }

    fn transmit_frame(&mut self, kind: MediaKind, data: &[u8]) {
        let Some(target) = self.session.media_target() else {
            return;
        };

        let packed = self.config.compressor.compress(data);
        let compression = CompressionInfo::from(&packed);
        tracing::trace!(
            "{} frame {} -> {} bytes ({:.0}% saved, {})",
            kind,
            packed.original_size,
            packed.compressed_size,
            packed.savings_percent(),
            packed.label
        );

        let payload = match kind {
            MediaKind::Audio => Payload::VoiceData {
                audio: packed.data,
                compression,
            },
            MediaKind::Video => Payload::VideoFrame {
                frame: packed.data,
                compression,
            },
        };

        if let Err(e) = self.send(Some(target), payload) {
            tracing::debug!("Dropping {} frame: {}", kind, e);
        }
    }

    fn play_mic_test(&mut self) {
        let pcm = std::mem::take(&mut self.mic_test_buffer);
        if pcm.is_empty() {
            self.emit(SessionEvent::Notice("Microphone delivered no audio".to_string()));
            return;
        }
        self.emit(SessionEvent::Notice(format!(
            "Microphone OK, playing back {} bytes",
            pcm.len()
        )));
        self.receiver.play_local_audio(pcm);
    }

    // ========================================================================
    // TIMER EVENTS
    // ========================================================================

    pub fn handle_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::CallTimeout { call_id } => {
                if call_id != self.call_id || self.session.state() != CallState::Calling {
                    tracing::debug!("Ignoring stale call timeout {}", call_id);
                    return;
                }
                let partner = self.session.partner().unwrap_or_default().to_string();
                tracing::info!("No answer from {}", partner);
                self.call_timer = None;
                self.go_idle();
                self.emit(SessionEvent::CallFailed {
                    partner,
                    reason: CallFailure::NoAnswer,
                });
            }
            TimerEvent::Ring { call_id } => {
                if call_id != self.call_id {
                    return;
                }
                if let Some(caller) = self.session.incoming_caller() {
                    let caller = caller.to_string();
                    self.emit(SessionEvent::Ring { caller });
                }
            }
        }
    }

    fn start_call_timer(&mut self) {
        self.cancel_call_timer();
        self.call_id += 1;

        let call_id = self.call_id;
        let timeout = self.config.call_timeout;
        let tx = self.timer_tx.clone();
        self.call_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(TimerEvent::CallTimeout { call_id }).await;
        }));
    }

    fn cancel_call_timer(&mut self) {
        if let Some(timer) = self.call_timer.take() {
            timer.abort();
        }
    }

    fn start_ringing(&mut self) {
        self.stop_ringing();
        self.call_id += 1;

        let call_id = self.call_id;
        let every = self.config.ring_interval;
        let tx = self.timer_tx.clone();
        self.ring_timer = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            loop {
                interval.tick().await;
                if tx.send(TimerEvent::Ring { call_id }).await.is_err() {
                    break;
                }
            }
        }));
    }

    fn stop_ringing(&mut self) {
        if let Some(timer) = self.ring_timer.take() {
            timer.abort();
        }
    }

    // ========================================================================
    // PIPELINES
    // ========================================================================

    fn start_transmit(&mut self, kind: MediaKind) -> Result<(), SessionError> {
        if !self.session.state().allows_media() {
            return Err(SessionError::NotInSession);
        }
        match self.pipeline_mode(kind) {
            Some(PipelineMode::Transmit) => {
                tracing::warn!("{} transmission already running", kind);
                self.emit(SessionEvent::Notice(format!("{kind} is already on")));
                return Ok(());
            }
            Some(_) => return Err(SessionError::PipelineBusy(kind)),
            None => {}
        }

        self.start_pipeline(kind, PipelineMode::Transmit)?;
        self.set_flag(kind, true);
        self.send_status(kind, StreamStatus::Started);
        Ok(())
    }

    fn stop_transmit(&mut self, kind: MediaKind) {
        if self.pipeline_mode(kind) == Some(PipelineMode::Transmit) {
            self.stop_pipeline(kind);
        }
        if self.flag(kind) {
            self.set_flag(kind, false);
            self.send_status(kind, StreamStatus::Stopped);
        }
    }

    /// Stoppt beide Sende-Pipelines, solange das Ziel noch bekannt ist
    fn stop_transmission(&mut self) {
        self.stop_transmit(MediaKind::Audio);
        self.stop_transmit(MediaKind::Video);
    }

    fn start_local(&mut self, kind: MediaKind, mode: PipelineMode) -> Result<(), SessionError> {
        if self.slot(kind).is_some() {
            return Err(SessionError::PipelineBusy(kind));
        }
        self.start_pipeline(kind, mode)
    }

    fn start_pipeline(&mut self, kind: MediaKind, mode: PipelineMode) -> Result<(), SessionError> {
        let device = self.devices.current(kind)?.clone();
        self.next_generation += 1;
        let generation = self.next_generation;

        let request = CaptureRequest {
            kind,
            device: device.clone(),
            generation,
        };
        let process = self.capture.start(request, self.capture_tx.clone())?;

        tracing::info!("{} pipeline started ({}) on {}", kind, mode, device);
        *self.slot_mut(kind) = Some(Pipeline {
            mode,
            generation,
            device,
            process,
            frames: 0,
            bytes: 0,
        });
        self.emit(SessionEvent::PipelineChanged {
            kind,
            mode,
            active: true,
        });
        Ok(())
    }

    /// Entfernt die Pipeline und beendet den Prozess
    ///
    /// Danach eintreffende Frames haben eine veraltete Generation und
    /// werden verworfen.
    fn stop_pipeline(&mut self, kind: MediaKind) -> Option<Pipeline> {
        let mut pipeline = self.slot_mut(kind).take()?;
        pipeline.process.terminate();

        tracing::info!(
            "{} pipeline stopped ({}) on {}: {} frames, {} bytes",
            kind,
            pipeline.mode,
            pipeline.device,
            pipeline.frames,
            pipeline.bytes
        );
        self.emit(SessionEvent::PipelineChanged {
            kind,
            mode: pipeline.mode,
            active: false,
        });
        Some(pipeline)
    }

    fn live_pipeline(&mut self, kind: MediaKind, generation: u64) -> Option<&mut Pipeline> {
        self.slot_mut(kind)
            .as_mut()
            .filter(|p| p.generation == generation)
    }

    fn slot(&self, kind: MediaKind) -> &Option<Pipeline> {
        match kind {
            MediaKind::Audio => &self.audio,
            MediaKind::Video => &self.video,
        }
    }

    fn slot_mut(&mut self, kind: MediaKind) -> &mut Option<Pipeline> {
        match kind {
            MediaKind::Audio => &mut self.audio,
            MediaKind::Video => &mut self.video,
        }
    }

    fn flag(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.flags.talking,
            MediaKind::Video => self.flags.video_on,
        }
    }

    fn set_flag(&mut self, kind: MediaKind, on: bool) {
        match kind {
            MediaKind::Audio => self.flags.talking = on,
            MediaKind::Video => self.flags.video_on = on,
        }
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn require(&self, expected: CallState, action: &'static str) -> Result<(), SessionError> {
        let state = self.session.state();
        if state == expected {
            Ok(())
        } else {
            Err(SessionError::InvalidState { action, state })
        }
    }

    fn incoming_caller(&self) -> Result<String, SessionError> {
        self.session
            .incoming_caller()
            .map(str::to_string)
            .ok_or(SessionError::InvalidState {
                action: "answer",
                state: self.session.state(),
            })
    }

    fn is_calling(&self, sender: &str) -> bool {
        self.session.state() == CallState::Calling && self.session.partner() == Some(sender)
    }

    /// Zurück nach IDLE: Sende-Pipelines aus, Timer aus, Viewer zurücksetzen
    fn go_idle(&mut self) {
        self.cancel_call_timer();
        self.stop_ringing();
        self.stop_transmission();
        self.flags.clear_transmission();
        if self.receiver.frames_shown() > 0 {
            tracing::info!("Session showed {} video frames", self.receiver.frames_shown());
        }
        self.receiver.reset();
        self.transition(CallSession::reset);
    }

    fn transition(&mut self, apply: impl FnOnce(&mut CallSession)) {
        let from = self.session.state();
        apply(&mut self.session);
        let to = self.session.state();

        if from != to {
            tracing::info!("State {} -> {}", from, to);
            self.emit(SessionEvent::StateChanged { from, to });
        }
    }

    fn send(&self, target: Option<String>, payload: Payload) -> Result<(), SignalingError> {
        self.relay
            .broadcast(Envelope::new(&self.identity, target, payload))
    }

    /// Wie `send`, ein Fehler wird nur geloggt
    fn notify(&self, target: Option<String>, payload: Payload) {
        let kind = payload.type_name();
        if let Err(e) = self.send(target, payload) {
            tracing::warn!("Failed to send {}: {}", kind, e);
        }
    }

    fn send_status(&self, kind: MediaKind, status: StreamStatus) {
        let Some(target) = self.session.media_target() else {
            return;
        };
        let payload = match kind {
            MediaKind::Audio => Payload::VoiceStatus { status },
            MediaKind::Video => Payload::VideoStatus { status },
        };
        self.notify(Some(target), payload);
    }

    fn emit(&self, event: SessionEvent) {
        // Ohne Subscriber schlägt send fehl, das ist in Ordnung
        let _ = self.event_tx.send(event);
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.cancel_call_timer();
        self.stop_ringing();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::DeviceDescriptor;
    use crate::media::{Playback, PlaybackError};
    use crate::signaling::{PeerRecord, GROUP_TARGET};
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tokio_tungstenite::tungstenite::Message;

    // ------------------------------------------------------------------------
    // Fakes
    // ------------------------------------------------------------------------

    #[derive(Default)]
    struct CaptureLog {
        started: Vec<(MediaKind, u64)>,
        terminated: Vec<(MediaKind, u64)>,
    }

    struct FakeCapture(Arc<Mutex<CaptureLog>>);

    struct FakeProcess {
        kind: MediaKind,
        generation: u64,
        log: Arc<Mutex<CaptureLog>>,
    }

    impl CaptureBackend for FakeCapture {
        fn start(
            &mut self,
            request: CaptureRequest,
            _events: mpsc::Sender<CaptureEvent>,
        ) -> Result<Box<dyn CaptureProcess>, CaptureError> {
            self.0.lock().started.push((request.kind, request.generation));
            Ok(Box::new(FakeProcess {
                kind: request.kind,
                generation: request.generation,
                log: Arc::clone(&self.0),
            }))
        }
    }

    impl CaptureProcess for FakeProcess {
        fn terminate(&mut self) {
            self.log.lock().terminated.push((self.kind, self.generation));
        }
    }

    #[derive(Default)]
    struct Rendered {
        audio: Vec<Vec<u8>>,
        frames: Vec<Vec<u8>>,
        viewers: usize,
    }

    struct FakePlayback(Arc<Mutex<Rendered>>);

    impl Playback for FakePlayback {
        fn play_audio(&mut self, pcm: Vec<u8>) {
            self.0.lock().audio.push(pcm);
        }

        fn write_frame(&mut self, jpeg: &[u8]) -> Result<PathBuf, PlaybackError> {
            self.0.lock().frames.push(jpeg.to_vec());
            Ok(PathBuf::from("latest_frame.jpg"))
        }

        fn open_viewer(&mut self, _path: &Path) -> Result<(), PlaybackError> {
            self.0.lock().viewers += 1;
            Ok(())
        }
    }

    // ------------------------------------------------------------------------
    // Harness
    // ------------------------------------------------------------------------

    struct Harness {
        ctl: SessionController,
        channels: SessionChannels,
        outbound: mpsc::Receiver<Message>,
        events: broadcast::Receiver<SessionEvent>,
        capture: Arc<Mutex<CaptureLog>>,
        rendered: Arc<Mutex<Rendered>>,
    }

    fn peer(nickname: &str) -> PeerRecord {
        PeerRecord {
            address: format!("{nickname}_1"),
            nickname: nickname.to_string(),
            channel: "general".to_string(),
            ip: "10.0.0.2".to_string(),
            mode: "voice".to_string(),
            capabilities: vec!["voice".to_string(), "call".to_string()],
        }
    }

    fn harness() -> Harness {
        harness_with_queue(256)
    }

    fn harness_with_queue(capacity: usize) -> Harness {
        let identity = LocalIdentity::with_node_id("M3Pro", "M3Pro_1", "10.0.0.1");
        let (relay, outbound) = RelayHandle::channel(capacity);
        let devices = DeviceRegistry::from_descriptors(
            vec![DeviceDescriptor::new("/dev/video0", "Integrated Camera")],
            vec![DeviceDescriptor::new("default", "System Default")],
        );
        let capture = Arc::new(Mutex::new(CaptureLog::default()));
        let rendered = Arc::new(Mutex::new(Rendered::default()));
        let receiver = MediaReceiver::new(
            Box::new(FakePlayback(Arc::clone(&rendered))),
            Compressor::default(),
        );
        let config = SessionConfig {
            mic_test_bytes: 8,
            ..SessionConfig::default()
        };

        let (mut ctl, channels) = SessionController::new(
            identity,
            relay,
            devices,
            Box::new(FakeCapture(Arc::clone(&capture))),
            receiver,
            config,
        );
        let events = ctl.subscribe();
        ctl.handle_signaling(SignalingEvent::PeersUpdated(vec![
            peer("M3Pro"),
            peer("X"),
            peer("Bob"),
        ]));

        Harness {
            ctl,
            channels,
            outbound,
            events,
            capture,
            rendered,
        }
    }

    fn envelope(from: &str, target: Option<&str>, payload: Payload) -> Envelope {
        Envelope {
            from: format!("{from}_1"),
            nickname: from.to_string(),
            target: target.map(str::to_string),
            timestamp: 1,
            payload,
        }
    }

    impl Harness {
        /// Alle seit dem letzten Aufruf gesendeten Envelopes
        fn sent(&mut self) -> Vec<Value> {
            let mut out = Vec::new();
            while let Ok(msg) = self.outbound.try_recv() {
                if let Message::Text(text) = msg {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    assert_eq!(value["type"], "broadcast");
                    out.push(value["payload"].clone());
                }
            }
            out
        }

        fn events(&mut self) -> Vec<SessionEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        fn receive(&mut self, from: &str, target: Option<&str>, payload: Payload) {
            self.ctl.handle_envelope(envelope(from, target, payload));
        }

        fn generation(&self, kind: MediaKind) -> u64 {
            self.capture
                .lock()
                .started
                .iter()
                .rev()
                .find(|(k, _)| *k == kind)
                .map(|(_, g)| *g)
                .unwrap()
        }

        fn frame(&mut self, kind: MediaKind, data: &[u8]) {
            let generation = self.generation(kind);
            self.ctl.handle_capture(CaptureEvent::Frame {
                kind,
                generation,
                data: Bytes::copy_from_slice(data),
            });
        }

        /// Bringt die Session nach IN_CALL mit X
        fn in_call_with_x(&mut self) {
            self.ctl.call("X").unwrap();
            self.receive("X", Some("M3Pro"), Payload::CallAccepted);
            assert_eq!(self.ctl.state(), CallState::InCall);
            self.sent();
            self.events();
        }
    }

    // ------------------------------------------------------------------------
    // Call setup
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_incoming_call_rings() {
        let mut h = harness();
        h.receive("X", Some("M3Pro"), Payload::CallRequest { has_video: false });

        assert_eq!(h.ctl.state(), CallState::Ringing);
        assert_eq!(h.ctl.session().incoming_caller(), Some("X"));
        assert!(h.events().contains(&SessionEvent::IncomingCall {
            caller: "X".to_string(),
            has_video: false
        }));
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn test_call_request_for_someone_else_is_ignored() {
        let mut h = harness();
        h.receive("X", Some("Bob"), Payload::CallRequest { has_video: false });
        assert_eq!(h.ctl.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_answer_sends_accept() {
        let mut h = harness();
        h.receive("X", Some("M3Pro"), Payload::CallRequest { has_video: false });
        h.ctl.answer().unwrap();

        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "callAccepted");
        assert_eq!(sent[0]["target"], "X");
        assert_eq!(h.ctl.state(), CallState::InCall);
        assert_eq!(h.ctl.session().partner(), Some("X"));
    }

    #[tokio::test]
    async fn test_reject_returns_to_idle() {
        let mut h = harness();
        h.receive("X", Some("M3Pro"), Payload::CallRequest { has_video: false });
        h.ctl.reject().unwrap();

        let sent = h.sent();
        assert_eq!(sent[0]["type"], "callRejected");
        assert_eq!(sent[0]["target"], "X");
        assert_eq!(h.ctl.state(), CallState::Idle);
        assert_eq!(h.ctl.session().incoming_caller(), None);
    }

    #[tokio::test]
    async fn test_call_unknown_peer_sends_nothing() {
        let mut h = harness();
        let err = h.ctl.call("Y").unwrap_err();

        assert!(matches!(err, SessionError::PeerNotFound(ref name) if name == "Y"));
        assert!(h.sent().is_empty());
        assert_eq!(h.ctl.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_call_resolves_prefix() {
        let mut h = harness();
        h.ctl.call("bo").unwrap();

        let sent = h.sent();
        assert_eq!(sent[0]["type"], "callRequest");
        assert_eq!(sent[0]["target"], "Bob");
        assert_eq!(sent[0]["nickname"], "M3Pro");
        assert_eq!(h.ctl.state(), CallState::Calling);
        assert_eq!(h.ctl.session().partner(), Some("Bob"));
    }

    #[tokio::test]
    async fn test_accept_from_other_peer_is_ignored() {
        let mut h = harness();
        h.ctl.call("X").unwrap();
        h.receive("Bob", Some("M3Pro"), Payload::CallAccepted);
        assert_eq!(h.ctl.state(), CallState::Calling);
    }

    #[tokio::test]
    async fn test_busy_and_rejected_end_calling() {
        for (payload, reason) in [
            (Payload::CallBusy, CallFailure::Busy),
            (Payload::CallRejected, CallFailure::Rejected),
        ] {
            let mut h = harness();
            h.ctl.call("X").unwrap();
            h.events();
            h.receive("X", Some("M3Pro"), payload);

            assert_eq!(h.ctl.state(), CallState::Idle);
            assert!(h.events().contains(&SessionEvent::CallFailed {
                partner: "X".to_string(),
                reason
            }));
        }
    }

    #[tokio::test]
    async fn test_non_idle_replies_busy() {
        for state in [
            CallState::Calling,
            CallState::Ringing,
            CallState::InCall,
            CallState::InGroup,
        ] {
            let mut h = harness();
            match state {
                CallState::Calling => h.ctl.call("X").unwrap(),
                CallState::Ringing => {
                    h.receive("X", Some("M3Pro"), Payload::CallRequest { has_video: false })
                }
                CallState::InCall => h.in_call_with_x(),
                CallState::InGroup => h.ctl.join_group().unwrap(),
                CallState::Idle => unreachable!(),
            }
            assert_eq!(h.ctl.state(), state);
            h.sent();

            h.receive("Bob", Some("M3Pro"), Payload::CallRequest { has_video: true });

            let sent = h.sent();
            assert_eq!(sent.len(), 1, "in {state}");
            assert_eq!(sent[0]["type"], "callBusy");
            assert_eq!(sent[0]["target"], "Bob");
            assert_eq!(h.ctl.state(), state);
        }
    }

    #[tokio::test]
    async fn test_repeated_request_while_ringing_is_busy() {
        let mut h = harness();
        h.receive("X", Some("M3Pro"), Payload::CallRequest { has_video: false });
        h.receive("X", Some("M3Pro"), Payload::CallRequest { has_video: false });

        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "callBusy");
        assert_eq!(sent[0]["target"], "X");
        assert_eq!(h.ctl.state(), CallState::Ringing);
        assert_eq!(h.ctl.session().incoming_caller(), Some("X"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out_to_idle() {
        let mut h = harness();
        h.ctl.call("X").unwrap();
        h.events();

        let timer = h.channels.timer_rx.recv().await.unwrap();
        assert!(matches!(timer, TimerEvent::CallTimeout { .. }));
        h.ctl.handle_timer(timer);

        assert_eq!(h.ctl.state(), CallState::Idle);
        assert!(h.events().contains(&SessionEvent::CallFailed {
            partner: "X".to_string(),
            reason: CallFailure::NoAnswer
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_cancels_timeout() {
        let mut h = harness();
        h.in_call_with_x();

        let fired =
            tokio::time::timeout(Duration::from_secs(120), h.channels.timer_rx.recv()).await;
        assert!(fired.is_err());
        assert_eq!(h.ctl.state(), CallState::InCall);
    }

    #[tokio::test]
    async fn test_stale_timeout_is_ignored() {
        let mut h = harness();
        h.in_call_with_x();
        h.ctl.handle_timer(TimerEvent::CallTimeout { call_id: 1 });
        assert_eq!(h.ctl.state(), CallState::InCall);
    }

    #[tokio::test]
    async fn test_caller_cancel_with_hangup() {
        let mut h = harness();
        h.ctl.call("X").unwrap();
        h.sent();
        h.ctl.hangup().unwrap();

        let sent = h.sent();
        assert_eq!(sent[0]["type"], "callEnded");
        assert_eq!(sent[0]["target"], "X");
        assert_eq!(h.ctl.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_caller_gives_up_while_ringing() {
        let mut h = harness();
        h.receive("X", Some("M3Pro"), Payload::CallRequest { has_video: false });
        h.receive("X", Some("M3Pro"), Payload::CallEnded);

        assert_eq!(h.ctl.state(), CallState::Idle);
        assert!(h.events().contains(&SessionEvent::MissedCall {
            caller: "X".to_string()
        }));
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_hangup_stops_both_pipelines() {
        let mut h = harness();
        h.in_call_with_x();
        h.ctl.start_talking().unwrap();
        h.ctl.set_video(true).unwrap();
        assert!(h.ctl.flags().talking && h.ctl.flags().video_on);

        h.ctl.hangup().unwrap();

        let flags = h.ctl.flags();
        assert!(!flags.talking && !flags.video_on);
        let terminated: Vec<MediaKind> =
            h.capture.lock().terminated.iter().map(|(k, _)| *k).collect();
        assert!(terminated.contains(&MediaKind::Audio));
        assert!(terminated.contains(&MediaKind::Video));

        let sent = h.sent();
        let last = sent.last().unwrap();
        assert_eq!(last["type"], "callEnded");
        assert_eq!(last["target"], "X");
        assert_eq!(h.ctl.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_hangup_is_sent_while_frames_back_up() {
        let mut h = harness_with_queue(8);
        h.in_call_with_x();
        h.ctl.start_talking().unwrap();

        for _ in 0..20 {
            h.frame(MediaKind::Audio, &[7; 64]);
        }
        h.ctl.hangup().unwrap();

        let sent = h.sent();
        let types: Vec<&str> = sent.iter().map(|v| v["type"].as_str().unwrap()).collect();
        assert_eq!(types.last(), Some(&"callEnded"));
        assert_eq!(sent.last().unwrap()["target"], "X");
        assert!(types.contains(&"voiceData"));
        assert_eq!(h.ctl.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_remote_call_ended_forces_flags_off() {
        let mut h = harness();
        h.in_call_with_x();
        h.ctl.start_talking().unwrap();

        // Nicht vom Partner: kein Effekt
        h.receive("Bob", Some("M3Pro"), Payload::CallEnded);
        assert_eq!(h.ctl.state(), CallState::InCall);

        h.receive("X", Some("M3Pro"), Payload::CallEnded);
        assert_eq!(h.ctl.state(), CallState::Idle);
        assert!(!h.ctl.flags().talking);
        assert_eq!(h.capture.lock().terminated.len(), 1);
        assert!(h.events().contains(&SessionEvent::CallEnded {
            partner: "X".to_string(),
            by_peer: true
        }));
    }

    #[tokio::test]
    async fn test_shutdown_notifies_partner() {
        let mut h = harness();
        h.in_call_with_x();
        h.ctl.shutdown();

        let sent = h.sent();
        assert_eq!(sent.last().unwrap()["type"], "callEnded");
        assert_eq!(h.ctl.state(), CallState::Idle);
    }

    // ------------------------------------------------------------------------
    // Group voice
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_group_video_on_broadcasts_status() {
        let mut h = harness();
        h.ctl.join_group().unwrap();
        assert_eq!(h.sent()[0]["type"], "joinedGroupVoice");

        h.ctl.set_video(true).unwrap();

        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "videoStatus");
        assert_eq!(sent[0]["status"], "started");
        assert_eq!(sent[0]["target"], GROUP_TARGET);
        assert!(h.ctl.flags().video_on);
        assert_eq!(h.capture.lock().started, vec![(MediaKind::Video, 1)]);
    }

    #[tokio::test]
    async fn test_join_group_while_in_call_is_rejected() {
        let mut h = harness();
        h.in_call_with_x();

        let err = h.ctl.join_group().unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidState {
                state: CallState::InCall,
                ..
            }
        ));
        assert!(h.sent().is_empty());
        assert_eq!(h.ctl.state(), CallState::InCall);
    }

    #[tokio::test]
    async fn test_leave_group() {
        let mut h = harness();
        h.ctl.join_group().unwrap();
        h.ctl.start_talking().unwrap();
        h.sent();

        h.ctl.leave_group().unwrap();

        let types: Vec<Value> = h.sent().into_iter().map(|v| v["type"].clone()).collect();
        assert_eq!(types, vec!["voiceStatus", "leftGroupVoice"]);
        assert_eq!(h.ctl.state(), CallState::Idle);
        assert!(!h.ctl.flags().talking);
    }

    #[tokio::test]
    async fn test_group_roster() {
        let mut h = harness();
        h.receive("Bob", Some(GROUP_TARGET), Payload::JoinedGroupVoice);
        h.receive("X", None, Payload::JoinedGroupVoice);
        assert_eq!(h.ctl.roster().len(), 2);

        h.receive("X", Some(GROUP_TARGET), Payload::LeftGroupVoice);
        assert!(!h.ctl.roster().contains("X"));

        h.ctl
            .handle_signaling(SignalingEvent::PeersUpdated(vec![peer("M3Pro"), peer("X")]));
        assert!(h.ctl.roster().is_empty());
    }

    // ------------------------------------------------------------------------
    // Media
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_talking_requires_session() {
        let mut h = harness();
        assert!(matches!(h.ctl.start_talking(), Err(SessionError::NotInSession)));
        assert!(h.capture.lock().started.is_empty());
        assert!(!h.ctl.flags().talking);
    }

    #[tokio::test]
    async fn test_repeated_start_is_noop() {
        let mut h = harness();
        h.in_call_with_x();
        h.ctl.start_talking().unwrap();
        h.ctl.start_talking().unwrap();
        assert_eq!(h.capture.lock().started.len(), 1);
    }

    #[tokio::test]
    async fn test_captured_audio_is_compressed_and_sent() {
        let mut h = harness();
        h.in_call_with_x();
        h.ctl.start_talking().unwrap();
        h.sent();

        let pcm = vec![3u8; 3200];
        h.frame(MediaKind::Audio, &pcm);

        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "voiceData");
        assert_eq!(sent[0]["target"], "X");
        assert_eq!(sent[0]["compression"]["algorithm"], "zstd");
        assert_eq!(sent[0]["compression"]["originalSize"], 3200);

        let wire = BASE64.decode(sent[0]["audio"].as_str().unwrap()).unwrap();
        assert_eq!(Compressor::default().decompress(&wire), pcm);
    }

    #[tokio::test]
    async fn test_frames_after_stop_are_dropped() {
        let mut h = harness();
        h.in_call_with_x();
        h.ctl.start_talking().unwrap();
        let generation = h.generation(MediaKind::Audio);
        h.ctl.stop_talking().unwrap();
        h.sent();

        h.ctl.handle_capture(CaptureEvent::Frame {
            kind: MediaKind::Audio,
            generation,
            data: Bytes::from_static(&[1, 2, 3, 4]),
        });
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn test_partner_audio_is_played() {
        let mut h = harness();
        h.in_call_with_x();

        let packed = Compressor::default().compress(&[5u8; 640]);
        h.receive(
            "X",
            Some("M3Pro"),
            Payload::VoiceData {
                audio: packed.data.clone(),
                compression: CompressionInfo::from(&packed),
            },
        );
        assert_eq!(h.rendered.lock().audio, vec![vec![5u8; 640]]);
    }

    #[tokio::test]
    async fn test_muted_audio_is_not_played() {
        let mut h = harness();
        h.in_call_with_x();
        h.ctl.set_muted(true);

        h.receive(
            "X",
            Some("M3Pro"),
            Payload::VoiceData {
                audio: vec![1, 2, 3],
                compression: CompressionInfo::default(),
            },
        );
        assert!(h.rendered.lock().audio.is_empty());
    }

    #[tokio::test]
    async fn test_media_from_non_partner_is_dropped() {
        let mut h = harness();
        h.in_call_with_x();

        h.receive(
            "Bob",
            Some("M3Pro"),
            Payload::VoiceData {
                audio: vec![1, 2, 3],
                compression: CompressionInfo::default(),
            },
        );
        h.receive(
            "Bob",
            Some("M3Pro"),
            Payload::VideoFrame {
                frame: vec![0xFF, 0xD8, 0xFF, 0xD9],
                compression: CompressionInfo::default(),
            },
        );

        let rendered = h.rendered.lock();
        assert!(rendered.audio.is_empty());
        assert!(rendered.frames.is_empty());
    }

    #[tokio::test]
    async fn test_media_while_idle_is_dropped() {
        let mut h = harness();
        h.receive(
            "X",
            Some(GROUP_TARGET),
            Payload::VoiceData {
                audio: vec![1, 2, 3],
                compression: CompressionInfo::default(),
            },
        );
        assert!(h.rendered.lock().audio.is_empty());
    }

    #[tokio::test]
    async fn test_group_video_opens_viewer_once() {
        let mut h = harness();
        h.ctl.join_group().unwrap();

        for _ in 0..3 {
            h.receive(
                "Bob",
                Some(GROUP_TARGET),
                Payload::VideoFrame {
                    frame: vec![0xFF, 0xD8, 0xFF, 0xD9],
                    compression: CompressionInfo::default(),
                },
            );
        }
        assert_eq!(h.rendered.lock().frames.len(), 3);
        assert_eq!(h.rendered.lock().viewers, 1);
    }

    #[tokio::test]
    async fn test_device_fault_keeps_session() {
        let mut h = harness();
        h.in_call_with_x();
        h.ctl.start_talking().unwrap();
        let generation = h.generation(MediaKind::Audio);
        h.sent();
        h.events();

        h.ctl.handle_capture(CaptureEvent::Ended {
            kind: MediaKind::Audio,
            generation,
            error: Some("device busy".to_string()),
        });

        assert_eq!(h.ctl.state(), CallState::InCall);
        assert!(!h.ctl.flags().talking);
        assert_eq!(h.sent()[0]["status"], "stopped");
        assert!(h.events().contains(&SessionEvent::DeviceFault {
            kind: MediaKind::Audio,
            error: "device busy".to_string()
        }));
    }

    // ------------------------------------------------------------------------
    // Device tests
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_camera_snapshot_stops_after_one_frame() {
        let mut h = harness();
        h.ctl.camera_test().unwrap();
        h.frame(MediaKind::Video, &[0xFF, 0xD8, 7, 0xFF, 0xD9]);

        assert_eq!(h.rendered.lock().frames.len(), 1);
        assert_eq!(h.capture.lock().terminated.len(), 1);
        assert_eq!(h.ctl.pipeline_mode(MediaKind::Video), None);
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn test_mic_test_plays_back_recording() {
        let mut h = harness();
        h.ctl.mic_test().unwrap();
        h.frame(MediaKind::Audio, &[1, 2, 3, 4]);
        assert!(h.rendered.lock().audio.is_empty());
        h.frame(MediaKind::Audio, &[5, 6, 7, 8]);

        assert_eq!(h.rendered.lock().audio, vec![vec![1, 2, 3, 4, 5, 6, 7, 8]]);
        assert_eq!(h.ctl.pipeline_mode(MediaKind::Audio), None);
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn test_preview_is_replaced_by_transmit() {
        let mut h = harness();
        h.ctl.video_test().unwrap();
        assert!(matches!(h.ctl.camera_test(), Err(SessionError::PipelineBusy(MediaKind::Video))));

        h.ctl.join_group().unwrap();
        h.ctl.set_video(true).unwrap();
        assert_eq!(h.ctl.pipeline_mode(MediaKind::Video), Some(PipelineMode::Transmit));
        assert_eq!(h.capture.lock().terminated.len(), 1);
    }

    // ------------------------------------------------------------------------
    // Chat / misc
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_chat_routing() {
        let mut h = harness();
        h.ctl.send_chat("hi all").unwrap();
        assert_eq!(h.sent()[0]["target"], GROUP_TARGET);

        h.in_call_with_x();
        h.ctl.send_chat("hi X").unwrap();
        let sent = h.sent();
        assert_eq!(sent[0]["type"], "chatMessage");
        assert_eq!(sent[0]["target"], "X");
        assert_eq!(sent[0]["message"], "hi X");
    }

    #[tokio::test]
    async fn test_inbound_chat_filtering() {
        let mut h = harness();
        h.receive("Bob", Some("M3Pro"), Payload::ChatMessage { message: "psst".into() });
        h.receive("Bob", Some("X"), Payload::ChatMessage { message: "not for us".into() });
        h.receive("X", Some(GROUP_TARGET), Payload::ChatMessage { message: "hey".into() });

        let chats: Vec<SessionEvent> = h
            .events()
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::Chat { .. }))
            .collect();
        assert_eq!(
            chats,
            vec![
                SessionEvent::Chat {
                    from: "Bob".into(),
                    message: "psst".into(),
                    direct: true
                },
                SessionEvent::Chat {
                    from: "X".into(),
                    message: "hey".into(),
                    direct: false
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_own_envelopes_are_ignored() {
        let mut h = harness();
        h.receive("M3Pro", Some("M3Pro"), Payload::CallRequest { has_video: false });
        assert_eq!(h.ctl.state(), CallState::Idle);
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn test_status_report() {
        let mut h = harness();
        h.in_call_with_x();
        h.ctl.set_muted(true);

        let status = h.ctl.status();
        assert_eq!(status.state, CallState::InCall);
        assert_eq!(status.partner.as_deref(), Some("X"));
        assert!(status.flags.muted);
        assert_eq!(status.peer_count, 2);
        assert_eq!(status.camera.map(|d| d.id), Some("/dev/video0".to_string()));
    }
}
