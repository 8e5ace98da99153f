// Author: Lukas Bower
// Purpose: Compression seam applied to the serialised snapshot stream.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! The snapshot stream is run through an external compression oracle after
//! encoding. The codec itself is replaceable; the engine only requires a
//! `compress(bytes) -> bytes` function.

/// Compression oracle applied to the encoded snapshot stream.
pub trait Compressor: Send + Sync {
    /// Compress the serialised stream.
    fn compress(&self, bytes: &[u8]) -> Vec<u8>;
}

/// DEFLATE compression backed by `miniz_oxide`.
#[derive(Debug, Default)]
pub struct Deflate {
    level: u8,
}

impl Deflate {
    /// Construct a compressor with an explicit compression level (0-10).
    #[must_use]
    pub fn with_level(level: u8) -> Self {
        Self { level }
    }
}

impl Compressor for Deflate {
    fn compress(&self, bytes: &[u8]) -> Vec<u8> {
        let level = if self.level == 0 { 6 } else { self.level };
        miniz_oxide::deflate::compress_to_vec(bytes, level)
    }
}

/// Pass-through compressor for tests and debugging.
#[derive(Debug, Default)]
pub struct Identity;

impl Compressor for Identity {
    fn compress(&self, bytes: &[u8]) -> Vec<u8> {
        bytes.to_vec()
    }
}
