//! Devices Module - Kameras und Mikrofone
//!
//! Erkennung der lokalen Geräte und Verwaltung der aktuellen Auswahl.

mod enumerate;
mod registry;

pub use enumerate::{
    discover, parse_arecord_listing, parse_avfoundation_listing, parse_dshow_listing,
    parse_video_node, rediscover,
};
pub use registry::{
    Device, DeviceDescriptor, DeviceError, DeviceRegistry, DeviceSelector, MediaKind,
};
