use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::SerialisationDecorator;
use crate::cache::entry::SerialisationFlags;
use crate::error::{CacheError, Result};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const IV_LEN: usize = 16;

/// AES-256-CBC with PKCS#7 padding. Output is `iv || ciphertext`.
#[derive(Clone)]
pub struct EncryptionDecorator {
  key: [u8; 32],
}

impl EncryptionDecorator {
  pub fn new(key: [u8; 32]) -> Self {
    Self { key }
  }

  /// Derives the key as SHA-256 of the passphrase.
  pub fn from_passphrase(passphrase: &str) -> Self {
    let mut key = [0u8; 32];
    key.copy_from_slice(&Sha256::digest(passphrase.as_bytes()));
    Self::new(key)
  }
}

impl std::fmt::Debug for EncryptionDecorator {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("EncryptionDecorator").finish_non_exhaustive()
  }
}

impl SerialisationDecorator for EncryptionDecorator {
  fn name(&self) -> &'static str {
    "encryption"
  }

  fn is_enabled(&self, flags: SerialisationFlags) -> bool {
    flags.encrypted
  }

  fn encode(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let ciphertext =
      Aes256CbcEnc::new(&self.key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(&payload);

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
  }

  fn decode(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
    if payload.len() < IV_LEN {
      return Err(CacheError::serialisation("encrypted payload is truncated"));
    }
    let (iv, ciphertext) = payload.split_at(IV_LEN);
    let mut iv_block = [0u8; IV_LEN];
    iv_block.copy_from_slice(iv);

    Aes256CbcDec::new(&self.key.into(), &iv_block.into())
      .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
      .map_err(|_| CacheError::serialisation("could not decrypt payload"))
  }
}
