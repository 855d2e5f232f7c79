//! Device Registry
//!
//! Hält die erkannten Kameras und Mikrofone und das aktuell gewählte
//! Gerät pro Medientyp. Auswahl über "default", Index oder Namensteil.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("No {0} devices found")]
    NoDevices(MediaKind),

    #[error("No {kind} device matches '{selector}'")]
    NotFound { kind: MediaKind, selector: String },

    #[error("Device enumeration failed: {0}")]
    EnumerationFailed(String),
}

// ============================================================================
// MEDIA KIND
// ============================================================================

/// Medientyp einer Capture-Pipeline bzw. eines Geräts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "microphone"),
            MediaKind::Video => write!(f, "camera"),
        }
    }
}

// ============================================================================
// DEVICE
// ============================================================================

/// Konkretes Gerät, wie es an den Capture-Prozess übergeben wird
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub index: usize,
    /// Eingabe-Bezeichner für ffmpeg (z.B. `/dev/video0`, `hw:1,0`, `0`)
    pub id: String,
    pub name: String,
    pub kind: MediaKind,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name == self.id {
            write!(f, "[{}] {}", self.index, self.name)
        } else {
            write!(f, "[{}] {} ({})", self.index, self.name, self.id)
        }
    }
}

/// Rohes Ergebnis der Geräteerkennung (noch ohne Index)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: String,
    pub name: String,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

// ============================================================================
// SELECTOR
// ============================================================================

/// Logische Geräteauswahl
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelector {
    Default,
    Index(usize),
    Name(String),
}

impl DeviceSelector {
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        if input.is_empty() || input.eq_ignore_ascii_case("default") {
            DeviceSelector::Default
        } else if let Ok(index) = input.parse::<usize>() {
            DeviceSelector::Index(index)
        } else {
            DeviceSelector::Name(input.to_string())
        }
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::Default => write!(f, "default"),
            DeviceSelector::Index(i) => write!(f, "{i}"),
            DeviceSelector::Name(n) => write!(f, "{n}"),
        }
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    cameras: BTreeMap<usize, Device>,
    microphones: BTreeMap<usize, Device>,
    selected_camera: Option<usize>,
    selected_microphone: Option<usize>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Baut die Registry aus einer Erkennung auf
    pub fn from_descriptors(
        cameras: Vec<DeviceDescriptor>,
        microphones: Vec<DeviceDescriptor>,
    ) -> Self {
        let mut registry = Self::new();
        registry.replace(MediaKind::Video, cameras);
        registry.replace(MediaKind::Audio, microphones);
        registry
    }

    /// Ersetzt die Geräteliste eines Typs
    ///
    /// Eine bestehende Auswahl bleibt erhalten, solange derselbe Bezeichner
    /// weiterhin vorhanden ist.
    pub fn replace(&mut self, kind: MediaKind, descriptors: Vec<DeviceDescriptor>) {
        let previous_id = self.selected(kind).map(|d| d.id.clone());

        let devices: BTreeMap<usize, Device> = descriptors
            .into_iter()
            .enumerate()
            .map(|(index, d)| {
                (
                    index,
                    Device {
                        index,
                        id: d.id,
                        name: d.name,
                        kind,
                    },
                )
            })
            .collect();

        let reselected = previous_id.and_then(|id| {
            devices
                .values()
                .find(|d| d.id == id)
                .map(|d| d.index)
        });

        match kind {
            MediaKind::Video => {
                self.cameras = devices;
                self.selected_camera = reselected;
            }
            MediaKind::Audio => {
                self.microphones = devices;
                self.selected_microphone = reselected;
            }
        }
    }

    /// Alle Geräte eines Typs (Index → Gerät)
    pub fn list(&self, kind: MediaKind) -> &BTreeMap<usize, Device> {
        match kind {
            MediaKind::Video => &self.cameras,
            MediaKind::Audio => &self.microphones,
        }
    }

    /// Explizit gewähltes Gerät (falls vorhanden)
    pub fn selected(&self, kind: MediaKind) -> Option<&Device> {
        let index = match kind {
            MediaKind::Video => self.selected_camera,
            MediaKind::Audio => self.selected_microphone,
        }?;
        self.list(kind).get(&index)
    }

    /// Gerät, das beim nächsten Capture-Start verwendet wird
    pub fn current(&self, kind: MediaKind) -> Result<&Device, DeviceError> {
        match self.selected(kind) {
            Some(device) => Ok(device),
            None => self.resolve(kind, &DeviceSelector::Default),
        }
    }

    /// Löst eine logische Auswahl zu einem konkreten Gerät auf
    pub fn resolve(
        &self,
        kind: MediaKind,
        selector: &DeviceSelector,
    ) -> Result<&Device, DeviceError> {
        let devices = self.list(kind);
        if devices.is_empty() {
            return Err(DeviceError::NoDevices(kind));
        }

        let found = match selector {
            DeviceSelector::Default => devices.values().next(),
            DeviceSelector::Index(index) => devices.get(index),
            DeviceSelector::Name(needle) => {
                let needle = needle.to_lowercase();
                devices
                    .values()
                    .find(|d| d.id.to_lowercase() == needle)
                    .or_else(|| {
                        devices.values().find(|d| {
                            d.name.to_lowercase().contains(&needle)
                                || d.id.to_lowercase().contains(&needle)
                        })
                    })
            }
        };

        found.ok_or_else(|| DeviceError::NotFound {
            kind,
            selector: selector.to_string(),
        })
    }

    /// Wählt ein Gerät aus und gibt es zurück
    pub fn select(
        &mut self,
        kind: MediaKind,
        selector: &DeviceSelector,
    ) -> Result<Device, DeviceError> {
        let device = self.resolve(kind, selector)?.clone();
        tracing::info!("Selected {}: {}", kind, device);

        match kind {
            MediaKind::Video => self.selected_camera = Some(device.index),
            MediaKind::Audio => self.selected_microphone = Some(device.index),
        }
        Ok(device)
    }
}

// ============================================================================
// TESTS
// ============================================================================
