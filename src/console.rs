//! Interaktive Terminal-Oberfläche
//!
//! Führt geparste Befehle gegen den `SessionController` aus und formatiert
//! Session-Events als Textzeilen. Ausgabe auf stdout, Logging auf stderr.

use crate::call_engine::{
    Command, DeviceAction, PipelineMode, SessionController, SessionError, SessionEvent,
    StatusReport, VideoAction,
};
use crate::devices::{DeviceRegistry, MediaKind};
use crate::signaling::{PeerRecord, StreamStatus};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::io::{self, BufRead};
use tokio::sync::mpsc;

/// Puffer für eingelesene Befehlszeilen
const INPUT_CAPACITY: usize = 16;

pub const HELP: &str = "\
Commands:
  /call <name>          call a peer (exact, case-insensitive or prefix match)
  a, /answer            answer an incoming call
  r, /reject            reject an incoming call
  /hangup               end the call, cancel a pending call or leave the group
  /voice                join the group voice of the channel
  /leave                leave the group voice
  t / s                 start / stop talking
  /video on|off|test    camera transmission or local preview
  /camera list|test|<n> list, test or select a camera
  /mic list|test|<n>    list, test or select a microphone
  /mute, /unmute        silence incoming audio
  /peers                list peers on the relay
  /status               show session status
  /help                 this help
  /quit                 leave and exit
Any other text is sent as a chat message.";

/// Liest Befehlszeilen auf einem eigenen Thread
///
/// Nicht im Blocking-Pool: dort wartet der Runtime-Shutdown auf die
/// nächste Zeile.
pub fn spawn_line_reader<R>(reader: R) -> io::Result<mpsc::Receiver<io::Result<String>>>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel(INPUT_CAPACITY);
    std::thread::Builder::new()
        .name("console-input".to_string())
        .spawn(move || {
            for line in reader.lines() {
                let failed = line.is_err();
                if tx.blocking_send(line).is_err() || failed {
                    break;
                }
            }
            tracing::debug!("Console input thread finished");
        })?;
    Ok(rx)
}

/// Ergebnis eines Befehls
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Continue(Option<String>),
    Quit,
}

/// Führt einen Befehl aus
pub fn execute(
    controller: &mut SessionController,
    command: Command,
) -> Result<Outcome, SessionError> {
    let reply = match command {
        Command::StartTalking => controller.start_talking().map(|_| None)?,
        Command::StopTalking => controller.stop_talking().map(|_| None)?,
        Command::Answer => controller.answer().map(|_| None)?,
        Command::Reject => controller.reject().map(|_| None)?,
        Command::Call(name) => controller.call(&name).map(|_| None)?,
        Command::Hangup => controller.hangup().map(|_| None)?,
        Command::JoinGroup => controller.join_group().map(|_| None)?,
        Command::LeaveGroup => controller.leave_group().map(|_| None)?,
        Command::Video(VideoAction::On) => controller.set_video(true).map(|_| None)?,
        Command::Video(VideoAction::Off) => controller.set_video(false).map(|_| None)?,
        Command::Video(VideoAction::Test) => controller.video_test().map(|_| None)?,
        Command::Camera(action) => device_command(controller, MediaKind::Video, action)?,
        Command::Mic(action) => device_command(controller, MediaKind::Audio, action)?,
        Command::Mute => {
            controller.set_muted(true);
            Some("Incoming audio muted".to_string())
        }
        Command::Unmute => {
            controller.set_muted(false);
            Some("Incoming audio unmuted".to_string())
        }
        Command::Peers => Some(render_peers(
            controller.peers().all(),
            &controller.identity().nickname,
            controller.roster(),
        )),
        Command::Status => Some(render_status(&controller.status())),
        Command::Help => Some(HELP.to_string()),
        Command::Quit => return Ok(Outcome::Quit),
        Command::Chat(message) => {
            controller.send_chat(&message)?;
            Some(format!("[you] {message}"))
        }
        Command::Empty => None,
        Command::Invalid(usage) => Some(format!("Usage: {usage}")),
        Command::Unknown(name) => Some(format!("Unknown command /{name}, try /help")),
    };
    Ok(Outcome::Continue(reply))
}

fn device_command(
    controller: &mut SessionController,
    kind: MediaKind,
    action: DeviceAction,
) -> Result<Option<String>, SessionError> {
    match action {
        DeviceAction::List => {
            if let Err(e) = controller.refresh_devices(kind) {
                tracing::warn!("Rescanning {} devices failed: {}", kind, e);
            }
            Ok(Some(render_devices(controller.devices(), kind)))
        }
        DeviceAction::Test => {
            match kind {
                MediaKind::Video => controller.camera_test()?,
                MediaKind::Audio => controller.mic_test()?,
            }
            Ok(None)
        }
        DeviceAction::Select(selector) => {
            let device = controller.select_device(kind, &selector)?;
            Ok(Some(format!("Using {kind} {device}")))
        }
    }
}

// ============================================================================
// RENDERING
// ============================================================================

/// Formatiert ein Session-Event, `None` = nicht anzeigen
pub fn render_event(event: &SessionEvent) -> Option<String> {
    let line = match event {
        SessionEvent::StateChanged { to, .. } => format!("* {to}"),
        SessionEvent::IncomingCall { caller, has_video } => format!(
            "Incoming {}call from {caller}: 'a' to answer, 'r' to reject",
            if *has_video { "video " } else { "" }
        ),
        SessionEvent::Ring { caller } => format!("Ringing... ({caller})"),
        SessionEvent::CallConnected { partner } => {
            format!("Connected with {partner}: 't' to talk, /video on for camera")
        }
        SessionEvent::CallFailed { partner, reason } => {
            format!("Call to {partner} failed: {reason}")
        }
        SessionEvent::CallEnded { partner, by_peer: true } => format!("{partner} ended the call"),
        SessionEvent::CallEnded { partner, by_peer: false } => format!("Call with {partner} ended"),
        SessionEvent::MissedCall { caller } => format!("Missed call from {caller}"),
        SessionEvent::Chat {
            from,
            message,
            direct,
        } => {
            if *direct {
                format!("[{from} -> you] {message}")
            } else {
                format!("[{from}] {message}")
            }
        }
        SessionEvent::PeerMedia {
            nickname,
            kind,
            status,
        } => {
            let verb = match status {
                StreamStatus::Started => "turned on",
                StreamStatus::Stopped => "turned off",
            };
            format!("{nickname} {verb} their {kind}")
        }
        SessionEvent::GroupPresence { nickname, joined } => format!(
            "{nickname} {} the group voice",
            if *joined { "joined" } else { "left" }
        ),
        SessionEvent::PeersUpdated { count } => format!("{count} peer(s) online"),
        SessionEvent::PipelineChanged {
            kind,
            mode: PipelineMode::Transmit,
            active,
        } => format!("Your {kind} is {}", if *active { "ON" } else { "OFF" }),
        SessionEvent::PipelineChanged { .. } => return None,
        SessionEvent::DeviceFault { kind, error } => format!("{kind} error: {error}"),
        SessionEvent::Notice(text) => text.clone(),
    };
    Some(line)
}

pub fn render_peers(
    peers: &[PeerRecord],
    local_nickname: &str,
    roster: &BTreeSet<String>,
) -> String {
    let remote: Vec<&PeerRecord> = peers.iter().filter(|p| p.nickname != local_nickname).collect();
    if remote.is_empty() {
        return "No other peers online".to_string();
    }

    let mut out = format!("{} peer(s) online:", remote.len());
    for peer in remote {
        let media = if peer.has_capability("video") {
            "voice+video"
        } else {
            "voice"
        };
        let _ = write!(
            out,
            "\n  {:<20} {:<15} #{} [{}]",
            peer.nickname, peer.ip, peer.channel, media
        );
        if roster.contains(&peer.nickname) {
            out.push_str(" (group voice)");
        }
    }
    out
}

pub fn render_devices(devices: &DeviceRegistry, kind: MediaKind) -> String {
    let list = devices.list(kind);
    if list.is_empty() {
        return format!("No {kind} found");
    }

    let selected = devices.current(kind).ok().map(|d| d.index);
    let mut out = format!("Available {kind}s:");
    for device in list.values() {
        let marker = if Some(device.index) == selected { "*" } else { " " };
        let _ = write!(out, "\n {marker} {device}");
    }
    out
}

pub fn render_status(status: &StatusReport) -> String {
    let on_off = |on: bool| if on { "on" } else { "off" };
    let device = |d: &Option<crate::devices::Device>| {
        d.as_ref()
            .map(|d| d.to_string())
            .unwrap_or_else(|| "none".to_string())
    };

    let mut out = format!(
        "{} ({}) - relay {}",
        status.nickname,
        status.node_id,
        if status.connected { "connected" } else { "disconnected" }
    );
    let _ = write!(out, "\n  State:      {}", status.state);
    if let Some(partner) = &status.partner {
        let _ = write!(out, " with {partner}");
    }
    if let Some(caller) = &status.incoming_caller {
        let _ = write!(out, " from {caller}");
    }
    let _ = write!(
        out,
        "\n  Talking:    {}\n  Video:      {}\n  Muted:      {}",
        on_off(status.flags.talking),
        on_off(status.flags.video_on),
        if status.flags.muted { "yes" } else { "no" }
    );
    for (label, mode) in [("Mic", status.audio_pipeline), ("Camera", status.video_pipeline)] {
        if let Some(mode) = mode {
            if mode != PipelineMode::Transmit {
                let _ = write!(out, "\n  {label} busy:   {mode}");
            }
        }
    }
    let _ = write!(
        out,
        "\n  Camera:     {}\n  Microphone: {}\n  Peers:      {}",
        device(&status.camera),
        device(&status.microphone),
        status.peer_count
    );
    if !status.roster.is_empty() {
        let _ = write!(out, "\n  Group:      {}", status.roster.join(", "));
    }
    out
}

// ============================================================================
// TESTS
// ============================================================================
