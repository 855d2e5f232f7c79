//! Frame-Grenzen im MJPEG-Byte-Stream
//!
//! Der Kamera-Prozess liefert einen ununterbrochenen Strom aus
//! aneinandergereihten JPEG-Bildern. Ein Bild beginnt mit dem
//! SOI-Marker (FF D8) und endet mit dem EOI-Marker (FF D9).

use bytes::{Buf, Bytes, BytesMut};

/// Start of Image
pub const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
/// End of Image
pub const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Maximale Größe eines einzelnen Frames, danach wird der Puffer verworfen
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Zerlegt einen Byte-Stream in vollständige JPEG-Frames
#[derive(Debug, Default)]
pub struct JpegScanner {
    buffer: BytesMut,
    dropped_bytes: u64,
}

impl JpegScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Anzahl verworfener Bytes (Müll vor SOI, übergroße Frames)
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    /// Bytes, die noch auf ein EOI warten
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Hängt einen Chunk an und gibt alle jetzt vollständigen Frames zurück
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let Some(start) = find_marker(&self.buffer, JPEG_SOI, 0) else {
                // Ein einzelnes 0xFF am Ende könnte der Anfang eines SOI sein
                let keep = usize::from(self.buffer.last() == Some(&0xFF));
                let drop = self.buffer.len() - keep;
                self.dropped_bytes += drop as u64;
                self.buffer.advance(drop);
                break;
            };

            if start > 0 {
                self.dropped_bytes += start as u64;
                self.buffer.advance(start);
            }

            match find_marker(&self.buffer, JPEG_EOI, JPEG_SOI.len()) {
                Some(end) => {
                    let frame = self.buffer.split_to(end + JPEG_EOI.len()).freeze();
                    frames.push(frame);
                }
                None => {
                    if self.buffer.len() > MAX_FRAME_SIZE {
                        tracing::warn!(
                            "Discarding {} bytes without JPEG end marker",
                            self.buffer.len()
                        );
                        self.dropped_bytes += self.buffer.len() as u64;
                        self.buffer.clear();
                    }
                    break;
                }
            }
        }

        frames
    }
}

fn find_marker(haystack: &[u8], marker: [u8; 2], from: usize) -> Option<usize> {
    if haystack.len() < from + 2 {
        return None;
    }
    haystack[from..]
        .windows(2)
        .position(|w| w == marker)
        .map(|pos| pos + from)
}

// ============================================================================
// TESTS
// ============================================================================
