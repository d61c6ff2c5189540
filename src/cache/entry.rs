//! Persisted entries and the store key that carries their metadata.
//!
//! Key layout: `requestHash_typeHash_cachedAt_expiresAt_flags`, times in epoch
//! milliseconds. `_` never appears in a hash, so the layout is unambiguous.

use std::fmt;

pub const SEPARATOR: char = '_';

const FIELD_COUNT: usize = 5;

/// Which serialisation decorators were applied to a payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SerialisationFlags {
  pub compressed: bool,
  pub encrypted: bool,
}

impl SerialisationFlags {
  const COMPRESSED: u8 = 0b01;
  const ENCRYPTED: u8 = 0b10;

  pub const NONE: Self = Self {
    compressed: false,
    encrypted: false,
  };

  pub fn new(compressed: bool, encrypted: bool) -> Self {
    Self {
      compressed,
      encrypted,
    }
  }

  pub fn bits(self) -> u8 {
    let mut bits = 0;
    if self.compressed {
      bits |= Self::COMPRESSED;
    }
    if self.encrypted {
      bits |= Self::ENCRYPTED;
    }
    bits
  }

  pub fn from_bits(bits: u8) -> Option<Self> {
    if bits & !(Self::COMPRESSED | Self::ENCRYPTED) != 0 {
      return None;
    }
    Some(Self {
      compressed: bits & Self::COMPRESSED != 0,
      encrypted: bits & Self::ENCRYPTED != 0,
    })
  }
}

/// Metadata encoded in a store key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryKey {
  pub request_hash: String,
  pub type_hash: String,
  pub cached_at: i64,
  pub expires_at: i64,
  pub flags: SerialisationFlags,
}

impl EntryKey {
  /// Prefix shared by every key of one request hash.
  pub fn prefix(request_hash: &str) -> String {
    format!("{}{}", request_hash, SEPARATOR)
  }

  /// Decodes a store key. Returns None for anything that is not a
  /// well-formed five-field key.
  pub fn parse(key: &str) -> Option<Self> {
    let fields: Vec<&str> = key.split(SEPARATOR).collect();
    if fields.len() != FIELD_COUNT || fields.iter().any(|f| f.is_empty()) {
      return None;
    }

    Some(Self {
      request_hash: fields[0].to_string(),
      type_hash: fields[1].to_string(),
      cached_at: fields[2].parse().ok()?,
      expires_at: fields[3].parse().ok()?,
      flags: SerialisationFlags::from_bits(fields[4].parse().ok()?)?,
    })
  }

  pub fn encode(&self) -> String {
    self.to_string()
  }

  /// Same key with `expires_at` forced to 0.
  pub fn invalidated(&self) -> Self {
    Self {
      expires_at: 0,
      ..self.clone()
    }
  }

  pub fn is_stale_at(&self, now_millis: i64) -> bool {
    now_millis >= self.expires_at
  }
}

impl fmt::Display for EntryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{hash}{sep}{ty}{sep}{cached}{sep}{expires}{sep}{flags}",
      hash = self.request_hash,
      ty = self.type_hash,
      cached = self.cached_at,
      expires = self.expires_at,
      flags = self.flags.bits(),
      sep = SEPARATOR,
    )
  }
}

/// One persisted unit: key metadata plus the decorated payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub key: EntryKey,
  pub payload: Vec<u8>,
}
