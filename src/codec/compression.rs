//! Kompression für Audio-Chunks und Video-Frames
//!
//! Verwendet zstd als generischen Byte-Stream-Kompressor.
//! Der Kompressor darf die Übertragung niemals blockieren: bei einem
//! internen Fehler werden die Rohdaten unverändert durchgereicht.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Standard zstd-Level (schnell, ausreichend für Echtzeit)
pub const DEFAULT_LEVEL: i32 = 3;

/// Obergrenze für dekomprimierte Daten (schützt vor Kompressionsbomben)
pub const MAX_DECOMPRESSED_SIZE: usize = 16 * 1024 * 1024;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Compression failed: {0}")]
    CompressionFailed(String),

    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("Decompressed payload exceeds {0} bytes")]
    TooLarge(usize),
}

// ============================================================================
// ALGORITHM
// ============================================================================

/// Verwendetes Verfahren, wird im Envelope mitgeschickt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    #[default]
    Zstd,
    /// Rohdaten (Fallback nach Kompressionsfehler)
    None,
}

// ============================================================================
// COMPRESSION RESULT
// ============================================================================

/// Ergebnis einer Kompression (pro Frame/Chunk, wird nicht persistiert)
#[derive(Debug, Clone)]
pub struct CompressionResult {
    pub data: Vec<u8>,
    pub algorithm: Algorithm,
    pub original_size: usize,
    pub compressed_size: usize,
    /// Original / komprimiert, 1.0 bei leerer Eingabe
    pub ratio: f64,
    pub label: String,
    /// Gesetzt wenn der Kompressor auf Rohdaten zurückgefallen ist
    pub error: Option<CodecError>,
}

impl CompressionResult {
    fn passthrough(input: &[u8], error: Option<CodecError>) -> Self {
        Self {
            data: input.to_vec(),
            algorithm: Algorithm::None,
            original_size: input.len(),
            compressed_size: input.len(),
            ratio: 1.0,
            label: efficiency_label(input.len(), input.len()),
            error,
        }
    }

    /// Prozentuale Ersparnis (negativ wenn die Daten gewachsen sind)
    pub fn savings_percent(&self) -> f64 {
        if self.original_size == 0 {
            return 0.0;
        }
        (1.0 - self.compressed_size as f64 / self.original_size as f64) * 100.0
    }
}

/// Lesbare Bewertung der Kompressionseffizienz
pub fn efficiency_label(original: usize, compressed: usize) -> String {
    if original == 0 {
        return "empty".to_string();
    }
    let saved = (1.0 - compressed as f64 / original as f64) * 100.0;
    let grade = match saved {
        s if s >= 75.0 => "excellent",
        s if s >= 50.0 => "good",
        s if s >= 20.0 => "fair",
        s if s > 0.0 => "poor",
        _ => "none",
    };
    format!("{saved:.1}% saved ({grade})")
}

// ============================================================================
// COMPRESSOR
// ============================================================================

/// Deterministischer, verlustfreier Kompressor
#[derive(Debug, Clone, Copy)]
pub struct Compressor {
    level: i32,
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(DEFAULT_LEVEL)
    }
}

impl Compressor {
    /// Erstellt einen Kompressor mit gegebenem zstd-Level (wird auf 1..=19 begrenzt)
    pub fn new(level: i32) -> Self {
        Self {
            level: level.clamp(1, 19),
        }
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    /// Komprimiert einen Buffer
    ///
    /// Schlägt nie fehl: bei einem internen Fehler werden die Rohdaten
    /// mit `Algorithm::None` und gesetztem `error` zurückgegeben.
    pub fn compress(&self, input: &[u8]) -> CompressionResult {
        match zstd::encode_all(input, self.level) {
            Ok(data) => {
                let compressed_size = data.len();
                let ratio = if compressed_size == 0 {
                    1.0
                } else {
                    input.len() as f64 / compressed_size as f64
                };
                CompressionResult {
                    label: efficiency_label(input.len(), compressed_size),
                    data,
                    algorithm: Algorithm::Zstd,
                    original_size: input.len(),
                    compressed_size,
                    ratio: if input.is_empty() { 1.0 } else { ratio },
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!("Compression failed, sending raw bytes: {}", e);
                CompressionResult::passthrough(
                    input,
                    Some(CodecError::CompressionFailed(e.to_string())),
                )
            }
        }
    }

    /// Dekomprimiert einen Buffer
    ///
    /// Toleriert unkomprimierte Eingaben: schlägt die Dekompression fehl,
    /// wird die Eingabe unverändert zurückgegeben.
    pub fn decompress(&self, input: &[u8]) -> Vec<u8> {
        match self.try_decompress(input) {
            Ok(data) => data,
            Err(e) => {
                tracing::debug!("Decompression fell back to raw input: {}", e);
                input.to_vec()
            }
        }
    }

    /// Dekomprimiert gemäß angegebenem Verfahren
    pub fn decompress_with(&self, algorithm: Algorithm, input: &[u8]) -> Vec<u8> {
        match algorithm {
            Algorithm::None => input.to_vec(),
            Algorithm::Zstd => self.decompress(input),
        }
    }

    /// Strikte Variante ohne Fallback
    pub fn try_decompress(&self, input: &[u8]) -> Result<Vec<u8>, CodecError> {
        use std::io::Read;

        let decoder = zstd::stream::read::Decoder::new(input)
            .map_err(|e| CodecError::DecompressionFailed(e.to_string()))?;

        let mut out = Vec::new();
        decoder
            .take(MAX_DECOMPRESSED_SIZE as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::DecompressionFailed(e.to_string()))?;

        if out.len() > MAX_DECOMPRESSED_SIZE {
            return Err(CodecError::TooLarge(MAX_DECOMPRESSED_SIZE));
        }
        Ok(out)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_buffers() -> Vec<Vec<u8>> {
        vec![
            Vec::new(),
            vec![0u8],
            vec![0u8; 4096],
            b"hello hello hello hello hello".to_vec(),
            (0..10_000u32).map(|i| (i * 31 % 251) as u8).collect(),
            // JPEG-artiger Header mit Zufallsmuster
            [0xFF, 0xD8, 0xFF, 0xE0]
                .into_iter()
                .chain((0..2048u32).map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8))
                .collect(),
        ]
    }

    #[test]
    fn test_round_trip() {
        let codec = Compressor::default();
        for buffer in sample_buffers() {
            let result = codec.compress(&buffer);
            assert!(result.error.is_none());
            assert_eq!(codec.decompress(&result.data), buffer);
        }
    }

    #[test]
    fn test_compression_reports_sizes() {
        let codec = Compressor::default();
        let input = vec![7u8; 8000];
        let result = codec.compress(&input);

        assert_eq!(result.algorithm, Algorithm::Zstd);
        assert_eq!(result.original_size, 8000);
        assert_eq!(result.compressed_size, result.data.len());
        assert!(result.ratio > 10.0);
        assert!(result.label.contains("excellent"));
        assert!(result.savings_percent() > 90.0);
    }

    #[test]
    fn test_decompress_tolerates_raw_input() {
        let codec = Compressor::default();
        let raw = b"not a zstd frame at all".to_vec();
        assert_eq!(codec.decompress(&raw), raw);
        assert!(codec.try_decompress(&raw).is_err());
    }

    #[test]
    fn test_decompress_with_none_skips_decoding() {
        let codec = Compressor::default();
        let compressed = codec.compress(b"payload").data;
        // Bei "none" werden die Bytes nicht angefasst
        assert_eq!(codec.decompress_with(Algorithm::None, &compressed), compressed);
        assert_eq!(
            codec.decompress_with(Algorithm::Zstd, &compressed),
            b"payload".to_vec()
        );
    }

    #[test]
    fn test_empty_input_label() {
        let result = Compressor::default().compress(&[]);
        assert_eq!(result.ratio, 1.0);
        assert_eq!(result.label, "empty");
    }

    #[test]
    fn test_level_is_clamped() {
        assert_eq!(Compressor::new(0).level(), 1);
        assert_eq!(Compressor::new(99).level(), 19);
    }
}
