//! Codec Module - Kompression von Mediendaten
//!
//! Jeder ausgehende Audio-Chunk und jeder Video-Frame wird vor dem
//! Base64-Wrapping komprimiert.

mod compression;

pub use compression::{
    efficiency_label, Algorithm, CodecError, CompressionResult, Compressor, DEFAULT_LEVEL,
    MAX_DECOMPRESSED_SIZE,
};
