use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use super::SerialisationDecorator;
use crate::cache::entry::SerialisationFlags;
use crate::error::{CacheError, Result};

/// Zlib compression.
#[derive(Debug, Clone, Copy)]
pub struct CompressionDecorator {
  level: Compression,
}

impl CompressionDecorator {
  pub fn new(level: u32) -> Self {
    Self {
      level: Compression::new(level.min(9)),
    }
  }
}

impl Default for CompressionDecorator {
  fn default() -> Self {
    Self {
      level: Compression::default(),
    }
  }
}

impl SerialisationDecorator for CompressionDecorator {
  fn name(&self) -> &'static str {
    "compression"
  }

  fn is_enabled(&self, flags: SerialisationFlags) -> bool {
    flags.compressed
  }

  fn encode(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(payload.len() / 2), self.level);
    encoder
      .write_all(&payload)
      .map_err(|e| CacheError::serialisation(format!("compression failed: {}", e)))?;
    encoder
      .finish()
      .map_err(|e| CacheError::serialisation(format!("compression failed: {}", e)))
  }

  fn decode(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
    let mut decoded = Vec::with_capacity(payload.len() * 2);
    ZlibDecoder::new(payload.as_slice())
      .read_to_end(&mut decoded)
      .map_err(|e| CacheError::serialisation(format!("decompression failed: {}", e)))?;
    Ok(decoded)
  }
}
