//! Geräteerkennung
//!
//! Plattformabhängige Erkennung von Kameras und Mikrofonen:
//! - Linux: `/dev/video*` (+ Namen aus sysfs) und `arecord -l`
//! - macOS: `ffmpeg -f avfoundation -list_devices true`
//! - Windows: `ffmpeg -f dshow -list_devices true`
//!
//! Mit dem Feature `cpal-devices` werden Mikrofone über cpal ermittelt.

use super::registry::{DeviceDescriptor, DeviceError, DeviceRegistry, MediaKind};
use std::process::Command;

#[cfg(target_os = "macos")]
const AVFOUNDATION_LIST: &[&str] = &["-f", "avfoundation", "-list_devices", "true", "-i", ""];

#[cfg(target_os = "windows")]
const DSHOW_LIST: &[&str] = &["-f", "dshow", "-list_devices", "true", "-i", "dummy"];

/// Erkennt alle verfügbaren Geräte und baut eine Registry auf
pub fn discover(ffmpeg: &str) -> DeviceRegistry {
    let cameras = match list_cameras(ffmpeg) {
        Ok(list) => list,
        Err(e) => {
            tracing::warn!("Camera enumeration failed: {}", e);
            Vec::new()
        }
    };
    let microphones = match list_microphones(ffmpeg) {
        Ok(list) => list,
        Err(e) => {
            tracing::warn!("Microphone enumeration failed: {}", e);
            vec![system_default_microphone()]
        }
    };

    tracing::info!(
        "Found {} camera(s) and {} microphone(s)",
        cameras.len(),
        microphones.len()
    );
    DeviceRegistry::from_descriptors(cameras, microphones)
}

/// Erkennt die Geräte eines Typs neu
pub fn rediscover(
    registry: &mut DeviceRegistry,
    kind: MediaKind,
    ffmpeg: &str,
) -> Result<(), DeviceError> {
    let list = match kind {
        MediaKind::Video => list_cameras(ffmpeg)?,
        MediaKind::Audio => list_microphones(ffmpeg)?,
    };
    registry.replace(kind, list);
    Ok(())
}

fn system_default_microphone() -> DeviceDescriptor {
    #[cfg(target_os = "macos")]
    {
        DeviceDescriptor::new("0", "System Default")
    }
    #[cfg(not(target_os = "macos"))]
    {
        DeviceDescriptor::new("default", "System Default")
    }
}

// ============================================================================
// CAMERAS
// ============================================================================

#[cfg(target_os = "linux")]
fn list_cameras(_ffmpeg: &str) -> Result<Vec<DeviceDescriptor>, DeviceError> {
    let entries =
        std::fs::read_dir("/dev").map_err(|e| DeviceError::EnumerationFailed(e.to_string()))?;

    let mut nodes: Vec<u32> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| parse_video_node(&entry.file_name().to_string_lossy()))
        .collect();
    nodes.sort_unstable();

    Ok(nodes
        .into_iter()
        .map(|n| {
            let id = format!("/dev/video{n}");
            let name = std::fs::read_to_string(format!("/sys/class/video4linux/video{n}/name"))
                .map(|s| s.trim().to_string())
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| id.clone());
            DeviceDescriptor::new(id, name)
        })
        .collect())
}

#[cfg(target_os = "macos")]
fn list_cameras(ffmpeg: &str) -> Result<Vec<DeviceDescriptor>, DeviceError> {
    let listing = ffmpeg_listing(ffmpeg, AVFOUNDATION_LIST)?;
    Ok(parse_avfoundation_listing(&listing).0)
}

#[cfg(target_os = "windows")]
fn list_cameras(ffmpeg: &str) -> Result<Vec<DeviceDescriptor>, DeviceError> {
    let listing = ffmpeg_listing(ffmpeg, DSHOW_LIST)?;
    Ok(parse_dshow_listing(&listing).0)
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn list_cameras(_ffmpeg: &str) -> Result<Vec<DeviceDescriptor>, DeviceError> {
    tracing::warn!("Camera detection not supported on this platform");
    Ok(Vec::new())
}

// ============================================================================
// MICROPHONES
// ============================================================================

#[cfg(feature = "cpal-devices")]
fn list_microphones(_ffmpeg: &str) -> Result<Vec<DeviceDescriptor>, DeviceError> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let mut list = vec![system_default_microphone()];
    let devices = host
        .input_devices()
        .map_err(|e| DeviceError::EnumerationFailed(e.to_string()))?;
    for device in devices {
        if let Ok(name) = device.name() {
            list.push(DeviceDescriptor::new(name.clone(), name));
        }
    }
    Ok(list)
}

#[cfg(all(not(feature = "cpal-devices"), target_os = "linux"))]
fn list_microphones(_ffmpeg: &str) -> Result<Vec<DeviceDescriptor>, DeviceError> {
    let mut list = vec![system_default_microphone()];

    match Command::new("arecord").arg("-l").output() {
        Ok(output) if output.status.success() => {
            list.extend(parse_arecord_listing(&String::from_utf8_lossy(&output.stdout)));
        }
        Ok(output) => {
            tracing::debug!("arecord -l exited with {}", output.status);
        }
        Err(e) => {
            tracing::debug!("arecord not available: {}", e);
        }
    }
    Ok(list)
}

#[cfg(all(not(feature = "cpal-devices"), target_os = "macos"))]
fn list_microphones(ffmpeg: &str) -> Result<Vec<DeviceDescriptor>, DeviceError> {
    let listing = ffmpeg_listing(ffmpeg, AVFOUNDATION_LIST)?;
    let mics = parse_avfoundation_listing(&listing).1;
    Ok(if mics.is_empty() {
        vec![system_default_microphone()]
    } else {
        mics
    })
}

#[cfg(all(not(feature = "cpal-devices"), target_os = "windows"))]
fn list_microphones(ffmpeg: &str) -> Result<Vec<DeviceDescriptor>, DeviceError> {
    let listing = ffmpeg_listing(ffmpeg, DSHOW_LIST)?;
    Ok(parse_dshow_listing(&listing).1)
}

#[cfg(all(
    not(feature = "cpal-devices"),
    not(any(target_os = "linux", target_os = "macos", target_os = "windows"))
))]
fn list_microphones(_ffmpeg: &str) -> Result<Vec<DeviceDescriptor>, DeviceError> {
    Ok(vec![system_default_microphone()])
}

// ============================================================================
// PARSERS
// ============================================================================

/// Führt ffmpeg im Listenmodus aus (Ausgabe landet auf stderr)
#[allow(dead_code)]
fn ffmpeg_listing(ffmpeg: &str, args: &[&str]) -> Result<String, DeviceError> {
    let output = Command::new(ffmpeg)
        .args(["-hide_banner"])
        .args(args)
        .output()
        .map_err(|e| DeviceError::EnumerationFailed(format!("{ffmpeg}: {e}")))?;
    // ffmpeg beendet sich hier immer mit Fehlercode, die Liste steht trotzdem in stderr
    Ok(String::from_utf8_lossy(&output.stderr).into_owned())
}

/// `video12` → 12
pub fn parse_video_node(file_name: &str) -> Option<u32> {
    file_name.strip_prefix("video")?.parse().ok()
}

/// Parst `arecord -l`, z.B.
/// `card 1: Device [USB Audio Device], device 0: USB Audio [USB Audio]`
pub fn parse_arecord_listing(listing: &str) -> Vec<DeviceDescriptor> {
    listing
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("card ")?;
            let (card, rest) = rest.split_once(':')?;
            let card: u32 = card.trim().parse().ok()?;

            let name = rest
                .split_once('[')
                .and_then(|(_, r)| r.split_once(']'))
                .map(|(n, _)| n.trim().to_string())?;

            let device: u32 = rest
                .split_once("device ")
                .and_then(|(_, r)| r.split_once(':'))
                .and_then(|(d, _)| d.trim().parse().ok())?;

            Some(DeviceDescriptor::new(format!("hw:{card},{device}"), name))
        })
        .collect()
}

/// Parst die avfoundation-Liste in (Kameras, Mikrofone)
pub fn parse_avfoundation_listing(listing: &str) -> (Vec<DeviceDescriptor>, Vec<DeviceDescriptor>) {
    let mut cameras = Vec::new();
    let mut microphones = Vec::new();
    let mut section: Option<MediaKind> = None;

    for line in listing.lines() {
        if line.contains("AVFoundation video devices") {
            section = Some(MediaKind::Video);
            continue;
        }
        if line.contains("AVFoundation audio devices") {
            section = Some(MediaKind::Audio);
            continue;
        }
        let Some(kind) = section else { continue };

        // "[AVFoundation indev @ 0x7f...] [0] FaceTime HD Camera"
        let Some((_, tail)) = line.split_once("] [") else {
            continue;
        };
        let Some((index, name)) = tail.split_once("] ") else {
            continue;
        };
        if index.parse::<u32>().is_err() {
            continue;
        }
        let descriptor = DeviceDescriptor::new(index, name.trim());
        match kind {
            MediaKind::Video => cameras.push(descriptor),
            MediaKind::Audio => microphones.push(descriptor),
        }
    }
    (cameras, microphones)
}

/// Parst die dshow-Liste in (Kameras, Mikrofone)
///
/// Neuere ffmpeg-Versionen markieren jedes Gerät mit `(video)`/`(audio)`.
pub fn parse_dshow_listing(listing: &str) -> (Vec<DeviceDescriptor>, Vec<DeviceDescriptor>) {
    let mut cameras = Vec::new();
    let mut microphones = Vec::new();

    for line in listing.lines() {
        if line.contains("Alternative name") {
            continue;
        }
        let Some((_, tail)) = line.split_once('"') else {
            continue;
        };
        let Some((name, rest)) = tail.split_once('"') else {
            continue;
        };
        let descriptor = DeviceDescriptor::new(name, name);
        if rest.contains("(video)") {
            cameras.push(descriptor);
        } else if rest.contains("(audio)") {
            microphones.push(descriptor);
        }
    }
    (cameras, microphones)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_video_node() {
        assert_eq!(parse_video_node("video0"), Some(0));
        assert_eq!(parse_video_node("video12"), Some(12));
        assert_eq!(parse_video_node("video"), None);
        assert_eq!(parse_video_node("vhci"), None);
    }

    #[test]
    fn test_parse_arecord() {
        let listing = "**** List of CAPTURE Hardware Devices ****\n\
card 0: PCH [HDA Intel PCH], device 0: ALC257 Analog [ALC257 Analog]\n\
  Subdevices: 1/1\n\
  Subdevice #0: subdevice #0\n\
card 2: Device [USB Audio Device], device 0: USB Audio [USB Audio]\n";

        let devices = parse_arecord_listing(listing);
        assert_eq!(
            devices,
            vec![
                DeviceDescriptor::new("hw:0,0", "HDA Intel PCH"),
                DeviceDescriptor::new("hw:2,0", "USB Audio Device"),
            ]
        );
    }

    #[test]
    fn test_parse_avfoundation() {
        let listing = "[AVFoundation indev @ 0x7fb] AVFoundation video devices:\n\
[AVFoundation indev @ 0x7fb] [0] FaceTime HD Camera\n\
[AVFoundation indev @ 0x7fb] [1] Capture screen 0\n\
[AVFoundation indev @ 0x7fb] AVFoundation audio devices:\n\
[AVFoundation indev @ 0x7fb] [0] MacBook Pro Microphone\n\
: Input/output error\n";

        let (cams, mics) = parse_avfoundation_listing(listing);
        assert_eq!(cams.len(), 2);
        assert_eq!(cams[0], DeviceDescriptor::new("0", "FaceTime HD Camera"));
        assert_eq!(mics, vec![DeviceDescriptor::new("0", "MacBook Pro Microphone")]);
    }

    #[test]
    fn test_parse_dshow() {
        let listing = "[dshow @ 000001] \"Integrated Webcam\" (video)\n\
[dshow @ 000001]   Alternative name \"@device_pnp_\\\\?\\usb\"\n\
[dshow @ 000001] \"Microphone Array (Realtek)\" (audio)\n";

        let (cams, mics) = parse_dshow_listing(listing);
        assert_eq!(cams, vec![DeviceDescriptor::new("Integrated Webcam", "Integrated Webcam")]);
        assert_eq!(mics[0].name, "Microphone Array (Realtek)");
    }
}
