//! Media Capture Pipeline
//!
//! Startet pro Medientyp einen externen ffmpeg-Prozess und zerlegt dessen
//! stdout in einzelne Frames:
//! - Video: MJPEG-Strom, Frame-Grenzen über SOI/EOI-Marker
//! - Audio: PCM s16le mono in Chunks fester Größe
//!
//! Jeder Prozess hat einen eigenen Lese-Task, der die Frames in einen
//! begrenzten Kanal schreibt. Die Steuerschleife konsumiert diesen Kanal,
//! dadurch bleibt die Reihenfolge pro Pipeline erhalten.

use super::frames::JpegScanner;
use crate::devices::{Device, MediaKind};
use bytes::Bytes;
use parking_lot::Mutex;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Lesepuffer für den MJPEG-Strom
const VIDEO_READ_SIZE: usize = 64 * 1024;

/// Anzahl der stderr-Zeilen, die für Fehlermeldungen behalten werden
const STDERR_TAIL_LINES: usize = 8;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Failed to spawn capture process '{program}': {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Capture process has no stdout")]
    NoOutput,
}

// ============================================================================
// PROFILES
// ============================================================================

/// Feste Video-Aufnahmeparameter (niedrige Auflösung/Bildrate)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoProfile {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// MJPEG-Qualität (2 = beste, 31 = schlechteste)
    pub quality: u32,
}

impl Default for VideoProfile {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            fps: 10,
            quality: 8,
        }
    }
}

impl VideoProfile {
    /// Parst `WIDTHxHEIGHT@FPS`, z.B. `320x240@10`
    pub fn parse(input: &str) -> Option<Self> {
        let (size, fps) = match input.split_once('@') {
            Some((size, fps)) => (size, fps.trim().parse().ok()?),
            None => (input, Self::default().fps),
        };
        let (w, h) = size.split_once('x')?;
        let profile = Self {
            width: w.trim().parse().ok()?,
            height: h.trim().parse().ok()?,
            fps,
            ..Self::default()
        };
        (profile.width > 0 && profile.height > 0 && profile.fps > 0).then_some(profile)
    }
}

/// Audio-Aufnahmeparameter (PCM s16le)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioProfile {
    pub sample_rate: u32,
    pub channels: u16,
    /// Dauer eines Chunks in Millisekunden
    pub chunk_ms: u32,
}

impl Default for AudioProfile {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            chunk_ms: 100,
        }
    }
}

impl AudioProfile {
    /// Bytes pro Sekunde (16 Bit pro Sample)
    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.channels as usize * 2
    }

    /// Größe eines Chunks in Bytes
    pub fn chunk_bytes(&self) -> usize {
        (self.bytes_per_second() * self.chunk_ms as usize / 1000).max(2)
    }
}

// ============================================================================
// INPUT FORMAT
// ============================================================================

/// ffmpeg-Eingabeformat der Plattform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    /// Linux: v4l2 für Kameras, ALSA für Mikrofone
    V4l2Alsa,
    /// macOS
    AvFoundation,
    /// Windows
    DirectShow,
}

impl InputFormat {
    pub fn native() -> Self {
        if cfg!(target_os = "macos") {
            InputFormat::AvFoundation
        } else if cfg!(target_os = "windows") {
            InputFormat::DirectShow
        } else {
            InputFormat::V4l2Alsa
        }
    }
}

// ============================================================================
// CAPTURE EVENTS
// ============================================================================

/// Ein Request zum Starten einer Capture-Pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub kind: MediaKind,
    pub device: Device,
    /// Laufende Nummer, mit der veraltete Frames erkannt werden
    pub generation: u64,
}

/// Nachrichten der Lese-Tasks an die Steuerschleife
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// Ein vollständiger Frame bzw. Chunk
    Frame {
        kind: MediaKind,
        generation: u64,
        data: Bytes,
    },
    /// Der Prozess hat seinen Ausgabestrom beendet
    Ended {
        kind: MediaKind,
        generation: u64,
        /// `None` wenn der Prozess absichtlich beendet wurde
        error: Option<String>,
    },
}

// ============================================================================
// BACKEND TRAITS
// ============================================================================

/// Startet Capture-Prozesse
pub trait CaptureBackend: Send {
    fn start(
        &mut self,
        request: CaptureRequest,
        events: mpsc::Sender<CaptureEvent>,
    ) -> Result<Box<dyn CaptureProcess>, CaptureError>;
}

/// Ein laufender Capture-Prozess
pub trait CaptureProcess: Send {
    /// Beendet den Prozess (idempotent)
    fn terminate(&mut self);
}

// ============================================================================
// FFMPEG BACKEND
// ============================================================================

/// Capture über einen ffmpeg-Kindprozess
#[derive(Debug, Clone)]
pub struct FfmpegCapture {
    program: String,
    format: InputFormat,
    video: VideoProfile,
    audio: AudioProfile,
}

impl FfmpegCapture {
    pub fn new(program: String, video: VideoProfile, audio: AudioProfile) -> Self {
        Self {
            program,
            format: InputFormat::native(),
            video,
            audio,
        }
    }

    pub fn with_format(mut self, format: InputFormat) -> Self {
        self.format = format;
        self
    }

    /// ffmpeg-Argumente für eine Kamera
    pub fn video_args(&self, device: &Device) -> Vec<String> {
        let p = &self.video;
        let size = format!("{}x{}", p.width, p.height);
        let fps = p.fps.to_string();

        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin"]
            .into_iter()
            .map(String::from)
            .collect();

        let (format, input) = match self.format {
            InputFormat::V4l2Alsa => ("v4l2", device.id.clone()),
            InputFormat::AvFoundation => ("avfoundation", format!("{}:none", device.id)),
            InputFormat::DirectShow => ("dshow", format!("video={}", device.id)),
        };
        args.extend([
            "-f".to_string(),
            format.to_string(),
            "-framerate".to_string(),
            fps.clone(),
            "-video_size".to_string(),
            size,
            "-i".to_string(),
            input,
        ]);

        args.extend([
            "-an".to_string(),
            "-f".to_string(),
            "image2pipe".to_string(),
            "-vcodec".to_string(),
            "mjpeg".to_string(),
            "-q:v".to_string(),
            p.quality.to_string(),
            "-r".to_string(),
            fps,
            "-".to_string(),
        ]);
        args
    }

    /// ffmpeg-Argumente für ein Mikrofon
    pub fn audio_args(&self, device: &Device) -> Vec<String> {
        let p = &self.audio;
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin"]
            .into_iter()
            .map(String::from)
            .collect();

        let (format, input) = match self.format {
            InputFormat::V4l2Alsa => ("alsa", device.id.clone()),
            InputFormat::AvFoundation => ("avfoundation", format!(":{}", device.id)),
            InputFormat::DirectShow => ("dshow", format!("audio={}", device.id)),
        };
        args.extend(["-f".to_string(), format.to_string(), "-i".to_string(), input]);

        args.extend([
            "-vn".to_string(),
            "-ac".to_string(),
            p.channels.to_string(),
            "-ar".to_string(),
            p.sample_rate.to_string(),
            "-acodec".to_string(),
            "pcm_s16le".to_string(),
            "-f".to_string(),
            "s16le".to_string(),
            "-".to_string(),
        ]);
        args
    }

    fn spawn(&self, args: &[String]) -> Result<Child, CaptureError> {
        tracing::debug!("{} args: {:?}", self.program, args);
        Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CaptureError::SpawnFailed {
                program: self.program.clone(),
                reason: e.to_string(),
            })
    }
}

impl CaptureBackend for FfmpegCapture {
    fn start(
        &mut self,
        request: CaptureRequest,
        events: mpsc::Sender<CaptureEvent>,
    ) -> Result<Box<dyn CaptureProcess>, CaptureError> {
        let args = match request.kind {
            MediaKind::Video => self.video_args(&request.device),
            MediaKind::Audio => self.audio_args(&request.device),
        };

        tracing::info!(
            "Starting {} capture on {} (generation {})",
            request.kind,
            request.device,
            request.generation
        );

        let mut child = self.spawn(&args)?;
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CaptureError::NoOutput);
            }
        };

        let stopping = Arc::new(AtomicBool::new(false));
        let stderr_tail = Arc::new(Mutex::new(Vec::<String>::new()));

        if let Some(stderr) = child.stderr.take() {
            let tail = Arc::clone(&stderr_tail);
            std::thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    let mut tail = tail.lock();
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.remove(0);
                    }
                    tail.push(line);
                }
            });
        }

        let reader = StreamReader {
            kind: request.kind,
            generation: request.generation,
            events,
            stopping: Arc::clone(&stopping),
            stderr_tail,
        };
        let chunk_bytes = self.audio.chunk_bytes();

        // Blockierender Lese-Task
        tokio::task::spawn_blocking(move || match reader.kind {
            MediaKind::Video => reader.read_video(stdout),
            MediaKind::Audio => reader.read_audio(stdout, chunk_bytes),
        });

        Ok(Box::new(FfmpegProcess {
            child: Some(child),
            stopping,
            kind: request.kind,
        }))
    }
}

// ============================================================================
// STREAM READER
// ============================================================================

struct StreamReader {
    kind: MediaKind,
    generation: u64,
    events: mpsc::Sender<CaptureEvent>,
    stopping: Arc<AtomicBool>,
    stderr_tail: Arc<Mutex<Vec<String>>>,
}

impl StreamReader {
    fn read_video<R: Read>(self, mut reader: R) {
        let mut scanner = JpegScanner::new();
        let mut buf = vec![0u8; VIDEO_READ_SIZE];
        let mut frame_count = 0u64;

        let error = loop {
            match reader.read(&mut buf) {
                Ok(0) => break None,
                Ok(n) => {
                    for frame in scanner.push(&buf[..n]) {
                        frame_count += 1;
                        if !self.emit(frame) {
                            return;
                        }
                    }
                }
                Err(e) => break Some(e.to_string()),
            }
        };

        tracing::info!(
            "Video capture finished: {} frames, {} bytes discarded, {} bytes incomplete",
            frame_count,
            scanner.dropped_bytes(),
            scanner.pending()
        );
        self.finish(error);
    }

    fn read_audio<R: Read>(self, mut reader: R, chunk_bytes: usize) {
        let mut chunk_count = 0u64;

        let error = loop {
            let mut chunk = vec![0u8; chunk_bytes];
            match reader.read_exact(&mut chunk) {
                Ok(()) => {
                    chunk_count += 1;
                    if !self.emit(Bytes::from(chunk)) {
                        return;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break None,
                Err(e) => break Some(e.to_string()),
            }
        };

        tracing::info!("Audio capture finished: {} chunks", chunk_count);
        self.finish(error);
    }

    /// Gibt `false` zurück wenn der Empfänger weg ist
    fn emit(&self, data: Bytes) -> bool {
        if self.stopping.load(Ordering::SeqCst) {
            return false;
        }
        let event = CaptureEvent::Frame {
            kind: self.kind,
            generation: self.generation,
            data,
        };
        if self.events.blocking_send(event).is_err() {
            tracing::info!("{} receiver dropped, stopping capture", self.kind);
            return false;
        }
        true
    }

    fn finish(self, read_error: Option<String>) {
        let error = if self.stopping.load(Ordering::SeqCst) {
            None
        } else {
            let tail = self.stderr_tail.lock().join(" | ");
            Some(match (read_error, tail.is_empty()) {
                (Some(e), _) => e,
                (None, false) => tail,
                (None, true) => "capture process exited".to_string(),
            })
        };

        let _ = self.events.blocking_send(CaptureEvent::Ended {
            kind: self.kind,
            generation: self.generation,
            error,
        });
    }
}

// ============================================================================
// PROCESS HANDLE
// ============================================================================

struct FfmpegProcess {
    child: Option<Child>,
    stopping: Arc<AtomicBool>,
    kind: MediaKind,
}

impl CaptureProcess for FfmpegProcess {
    fn terminate(&mut self) {
        // Flag zuerst, damit kein Frame mehr nach dem logischen Stopp ankommt
        self.stopping.store(true, Ordering::SeqCst);

        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                tracing::debug!("{} capture already exited: {}", self.kind, e);
            }
            let _ = child.wait();
            tracing::info!("{} capture process terminated", self.kind);
        }
    }
}

impl Drop for FfmpegProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

// ============================================================================
// TESTS
// ============================================================================
