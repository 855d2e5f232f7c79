//! Media Module - Capture und Playback
//!
//! Dieses Modul verwaltet:
//! - Capture-Prozesse für Kamera und Mikrofon
//! - Zerlegung des MJPEG-Stroms in Frames
//! - Wiedergabe empfangener Audio-Chunks und Video-Frames

mod capture;
mod frames;
mod playback;

pub use capture::{
    AudioProfile, CaptureBackend, CaptureError, CaptureEvent, CaptureProcess, CaptureRequest,
    FfmpegCapture, InputFormat, VideoProfile,
};
pub use frames::{JpegScanner, JPEG_EOI, JPEG_SOI, MAX_FRAME_SIZE};
pub use playback::{
    player_args, MediaReceiver, Playback, PlaybackError, PlaybackOptions, ProcessPlayback,
};
