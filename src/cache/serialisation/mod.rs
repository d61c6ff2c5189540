//! Layered serialisation: JSON encoding followed by reversible byte transforms.

mod compression;
mod encryption;

pub use compression::CompressionDecorator;
pub use encryption::EncryptionDecorator;

use tracing::trace;

use super::entry::SerialisationFlags;
use super::traits::Cacheable;
use crate::error::{CacheError, Result};

/// A reversible byte transform, enabled per entry through its flags.
pub trait SerialisationDecorator: Send + Sync {
  fn name(&self) -> &'static str;

  fn is_enabled(&self, flags: SerialisationFlags) -> bool;

  fn encode(&self, payload: Vec<u8>) -> Result<Vec<u8>>;

  fn decode(&self, payload: Vec<u8>) -> Result<Vec<u8>>;
}

/// Applies decorators in order on the way in and in reverse on the way out.
pub struct SerialisationPipeline {
  decorators: Vec<Box<dyn SerialisationDecorator>>,
}

impl SerialisationPipeline {
  pub fn new(decorators: Vec<Box<dyn SerialisationDecorator>>) -> Self {
    Self { decorators }
  }

  /// Pipeline without any decorator; flags are recorded but have no effect.
  pub fn plain() -> Self {
    Self::new(Vec::new())
  }

  /// Encryption first, then compression. Encryption is skipped when no
  /// passphrase is available.
  pub fn standard(passphrase: Option<&str>) -> Self {
    let mut decorators: Vec<Box<dyn SerialisationDecorator>> = Vec::new();
    if let Some(passphrase) = passphrase {
      decorators.push(Box::new(EncryptionDecorator::from_passphrase(passphrase)));
    }
    decorators.push(Box::new(CompressionDecorator::default()));
    Self::new(decorators)
  }

  /// Whether an enabled flag would actually be honoured.
  pub fn supports(&self, flags: SerialisationFlags) -> SerialisationFlags {
    let supported = |probe: SerialisationFlags| self.decorators.iter().any(|d| d.is_enabled(probe));
    SerialisationFlags {
      compressed: flags.compressed && supported(SerialisationFlags::new(true, false)),
      encrypted: flags.encrypted && supported(SerialisationFlags::new(false, true)),
    }
  }

  pub fn serialise<R: Cacheable>(&self, payload: &R, flags: SerialisationFlags) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(payload)?;
    for decorator in self.decorators.iter().filter(|d| d.is_enabled(flags)) {
      let before = bytes.len();
      bytes = decorator.encode(bytes)?;
      trace!(decorator = decorator.name(), before, after = bytes.len(), "encoded payload");
    }
    Ok(bytes)
  }

  /// Fails with [`CacheError::DecoratorUnavailable`] when the entry was
  /// written with a decorator this pipeline lacks.
  pub fn deserialise<R: Cacheable>(&self, bytes: &[u8], flags: SerialisationFlags) -> Result<R> {
    let supported = self.supports(flags);
    if supported != flags {
      return Err(CacheError::DecoratorUnavailable(format!(
        "entry flags {:?}, supported {:?}",
        flags, supported
      )));
    }

    let mut bytes = bytes.to_vec();
    for decorator in self.decorators.iter().rev().filter(|d| d.is_enabled(flags)) {
      bytes = decorator.decode(bytes)?;
    }
    serde_json::from_slice(&bytes).map_err(|e| {
      CacheError::Serialisation(format!("could not decode {}: {}", R::type_name(), e))
    })
  }
}

impl Default for SerialisationPipeline {
  fn default() -> Self {
    Self::standard(None)
  }
}
