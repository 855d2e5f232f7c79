//! Media Reception & Playback
//!
//! - Audio: PCM wird direkt an einen Player-Prozess übergeben
//!   (fire-and-forget, Instanzen dürfen sich überlappen)
//! - Video: der letzte Frame wird in eine feste Datei geschrieben,
//!   beim ersten Frame einer Session wird einmalig der Bildbetrachter
//!   des Systems geöffnet

use crate::codec::{Algorithm, Compressor};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("Failed to write frame to {path}: {reason}")]
    FrameWrite { path: String, reason: String },

    #[error("Failed to launch '{program}': {reason}")]
    LaunchFailed { program: String, reason: String },
}

// ============================================================================
// PLAYBACK TRAIT
// ============================================================================

/// Ausgabe-Seite für empfangene Medien
pub trait Playback: Send {
    /// Spielt einen PCM-Buffer ab (kehrt sofort zurück)
    fn play_audio(&mut self, pcm: Vec<u8>);

    /// Überschreibt den zuletzt empfangenen Frame
    fn write_frame(&mut self, jpeg: &[u8]) -> Result<PathBuf, PlaybackError>;

    /// Öffnet den Bildbetrachter für `path`
    fn open_viewer(&mut self, path: &Path) -> Result<(), PlaybackError>;
}

// ============================================================================
// PROCESS PLAYBACK
// ============================================================================

/// Einstellungen für [`ProcessPlayback`]
#[derive(Debug, Clone)]
pub struct PlaybackOptions {
    /// Audio-Player (`ffplay` oder `aplay`)
    pub player: String,
    /// Bildbetrachter, `None` = Standardprogramm der Plattform
    pub viewer: Option<String>,
    pub frame_path: PathBuf,
    pub sample_rate: u32,
    /// Nur ein Player gleichzeitig, weitere warten
    pub serial: bool,
}

/// Playback über externe Prozesse
pub struct ProcessPlayback {
    options: PlaybackOptions,
    player_args: Vec<String>,
    serial_gate: Option<Arc<Semaphore>>,
}

impl ProcessPlayback {
    pub fn new(options: PlaybackOptions) -> Self {
        let player_args = player_args(&options.player, options.sample_rate);
        let serial_gate = options.serial.then(|| Arc::new(Semaphore::new(1)));
        Self {
            options,
            player_args,
            serial_gate,
        }
    }

    pub fn frame_path(&self) -> &Path {
        &self.options.frame_path
    }
}

impl Playback for ProcessPlayback {
    fn play_audio(&mut self, pcm: Vec<u8>) {
        let program = self.options.player.clone();
        let args = self.player_args.clone();
        let gate = self.serial_gate.clone();

        tokio::spawn(async move {
            // Im seriellen Modus bis zum Ende des vorherigen Players warten
            let _permit = match gate {
                Some(gate) => match gate.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
                None => None,
            };

            if let Err(e) = run_player(&program, &args, &pcm).await {
                tracing::warn!("Audio playback failed: {}", e);
            }
        });
    }

    fn write_frame(&mut self, jpeg: &[u8]) -> Result<PathBuf, PlaybackError> {
        let path = self.options.frame_path.clone();
        write_atomic(&path, jpeg).map_err(|e| PlaybackError::FrameWrite {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(path)
    }

    fn open_viewer(&mut self, path: &Path) -> Result<(), PlaybackError> {
        let (program, mut args) = viewer_command(self.options.viewer.as_deref());
        args.push(path.display().to_string());

        tracing::info!("Opening viewer: {} {:?}", program, args);
        let mut child = tokio::process::Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| PlaybackError::LaunchFailed {
                program: program.clone(),
                reason: e.to_string(),
            })?;

        // Exit-Status abholen, damit kein Zombie zurückbleibt
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(())
    }
}

/// Argumente für den Audio-Player, abhängig vom Programmnamen
pub fn player_args(player: &str, sample_rate: u32) -> Vec<String> {
    let name = Path::new(player)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(player);

    let rate = sample_rate.to_string();
    let args: Vec<&str> = if name == "aplay" {
        vec![
            "-q",
            "-t",
            "raw",
            "-f",
            "S16_LE",
            "-c",
            "1",
            "-r",
            rate.as_str(),
            "-",
        ]
    } else {
        vec![
            "-nodisp",
            "-autoexit",
            "-loglevel",
            "quiet",
            "-f",
            "s16le",
            "-ar",
            rate.as_str(),
            "-ch_layout",
            "mono",
            "-i",
            "-",
        ]
    };
    args.into_iter().map(String::from).collect()
}

/// Standard-Bildbetrachter der Plattform
fn viewer_command(custom: Option<&str>) -> (String, Vec<String>) {
    if let Some(viewer) = custom {
        return (viewer.to_string(), Vec::new());
    }
    if cfg!(target_os = "macos") {
        ("open".to_string(), Vec::new())
    } else if cfg!(target_os = "windows") {
        (
            "cmd".to_string(),
            vec!["/C".to_string(), "start".to_string(), String::new()],
        )
    } else {
        ("xdg-open".to_string(), Vec::new())
    }
}

async fn run_player(program: &str, args: &[String], pcm: &[u8]) -> std::io::Result<()> {
    let mut child = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(pcm).await?;
        // EOF signalisiert dem Player das Ende
        drop(stdin);
    }
    child.wait().await?;
    Ok(())
}

/// Schreibt über eine temporäre Datei und Rename, damit der Betrachter
/// nie einen halben Frame liest
fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".part");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)
}

// ============================================================================
// MEDIA RECEIVER
// ============================================================================

/// Dekodiert empfangene Medien und reicht sie an das Playback weiter
///
/// Bekommt nur Envelopes, die der Annahmefilter der Session bereits
/// durchgelassen hat.
pub struct MediaReceiver {
    playback: Box<dyn Playback>,
    codec: Compressor,
    viewer_opened: bool,
    frames_shown: u64,
}

impl MediaReceiver {
    pub fn new(playback: Box<dyn Playback>, codec: Compressor) -> Self {
        Self {
            playback,
            codec,
            viewer_opened: false,
            frames_shown: 0,
        }
    }

    pub fn viewer_opened(&self) -> bool {
        self.viewer_opened
    }

    pub fn frames_shown(&self) -> u64 {
        self.frames_shown
    }

    /// Verarbeitet einen Audio-Chunk
    ///
    /// Wird immer dekomprimiert; abgespielt nur wenn nicht stumm.
    /// Gibt zurück, ob abgespielt wurde.
    pub fn receive_audio(&mut self, data: &[u8], algorithm: Algorithm, muted: bool) -> bool {
        let pcm = self.codec.decompress_with(algorithm, data);
        if muted {
            tracing::trace!("Muted, discarding {} bytes of audio", pcm.len());
            return false;
        }
        self.playback.play_audio(pcm);
        true
    }

    /// Verarbeitet einen Video-Frame
    pub fn receive_video(
        &mut self,
        data: &[u8],
        algorithm: Algorithm,
    ) -> Result<PathBuf, PlaybackError> {
        let jpeg = self.codec.decompress_with(algorithm, data);
        self.show_frame(&jpeg)
    }

    /// Zeigt einen lokal aufgenommenen Frame an (Kamera-Test, Vorschau)
    pub fn show_local_frame(&mut self, jpeg: &[u8]) -> Result<PathBuf, PlaybackError> {
        self.show_frame(jpeg)
    }

    /// Spielt lokal aufgenommenes Audio ab (Mikrofon-Test)
    pub fn play_local_audio(&mut self, pcm: Vec<u8>) {
        self.playback.play_audio(pcm);
    }

    /// Setzt den Viewer-Zustand für eine neue Session zurück
    pub fn reset(&mut self) {
        self.viewer_opened = false;
        self.frames_shown = 0;
    }

    fn show_frame(&mut self, jpeg: &[u8]) -> Result<PathBuf, PlaybackError> {
        let path = self.playback.write_frame(jpeg)?;
        self.frames_shown += 1;

        if !self.viewer_opened {
            // Auch bei Fehlschlag nur einmal pro Session versuchen
            self.viewer_opened = true;
            self.playback.open_viewer(&path)?;
        }
        Ok(path)
    }
}

impl std::fmt::Debug for MediaReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaReceiver")
            .field("viewer_opened", &self.viewer_opened)
            .field("frames_shown", &self.frames_shown)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
