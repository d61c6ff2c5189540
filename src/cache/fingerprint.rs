//! Deterministic request identities.

use md5::Md5;
use serde::Deserialize;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use url::Url;

use super::traits::Cacheable;
use crate::error::{CacheError, Result};

/// Base used to resolve path-only URLs such as `/fact?a=1`.
const RELATIVE_BASE: &str = "relative://fingerprint.invalid";

/// Request as supplied by the caller. Never persisted.
#[derive(Debug, Clone)]
pub struct RequestIdentity<R> {
  pub url: String,
  /// Extra parameters, merged with the ones already present in `url`.
  pub query: Vec<(String, String)>,
  pub body: Option<String>,
  response: PhantomData<fn() -> R>,
}

impl<R: Cacheable> RequestIdentity<R> {
  pub fn new(url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      query: Vec::new(),
      body: None,
      response: PhantomData,
    }
  }

  pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.query.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: impl Into<String>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn type_name(&self) -> &'static str {
    R::type_name()
  }
}

/// Request identity after hashing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintedRequest {
  pub url: String,
  pub body: Option<String>,
  pub type_name: &'static str,
  pub request_hash: String,
  pub type_hash: String,
}

/// Digest used for fingerprints. Changing it orphans every existing entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
  #[default]
  Sha1,
  Md5,
  /// Seed-7, multiplier-31 polynomial over UTF-16 code units.
  Polynomial,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Hasher {
  algorithm: HashAlgorithm,
}

impl Hasher {
  pub fn new(algorithm: HashAlgorithm) -> Self {
    Self { algorithm }
  }

  pub fn algorithm(&self) -> HashAlgorithm {
    self.algorithm
  }

  pub fn fingerprint<R: Cacheable>(
    &self,
    request: &RequestIdentity<R>,
  ) -> Result<FingerprintedRequest> {
    let canonical = canonical_request(request)?;

    Ok(FingerprintedRequest {
      url: request.url.clone(),
      body: request.body.clone(),
      type_name: R::type_name(),
      request_hash: self.hash(&canonical),
      type_hash: self.type_hash::<R>(),
    })
  }

  pub fn type_hash<R: Cacheable>(&self) -> String {
    self.hash(R::type_name())
  }

  pub fn hash(&self, text: &str) -> String {
    match self.algorithm {
      HashAlgorithm::Sha1 => hex::encode_upper(Sha1::digest(text.as_bytes())),
      HashAlgorithm::Md5 => hex::encode_upper(Md5::digest(text.as_bytes())),
      HashAlgorithm::Polynomial => polynomial_hash(text).to_string(),
    }
  }
}

fn polynomial_hash(text: &str) -> i64 {
  text
    .encode_utf16()
    .fold(7i64, |hash, unit| hash.wrapping_mul(31).wrapping_add(i64::from(unit)))
}

/// `scheme:host path?sorted` followed by `||body` when a body is present.
fn canonical_request<R>(request: &RequestIdentity<R>) -> Result<String> {
  let (url, relative) = parse_url(&request.url)?;

  // First value wins for repeated names.
  let mut params: BTreeMap<String, String> = BTreeMap::new();
  for (name, value) in url.query_pairs() {
    params.entry(name.into_owned()).or_insert_with(|| value.into_owned());
  }
  for (name, value) in &request.query {
    params.entry(name.clone()).or_insert_with(|| value.clone());
  }

  let sorted = params
    .iter()
    .map(|(name, value)| format!("{}={}", name, value))
    .collect::<Vec<_>>()
    .join("&");

  let (scheme, host) = if relative {
    ("", "")
  } else {
    (url.scheme(), url.host_str().unwrap_or_default())
  };

  let canonical = format!("{}:{}{}?{}", scheme, host, url.path(), sorted);

  Ok(match &request.body {
    Some(body) => format!("{}||{}", canonical, body),
    None => canonical,
  })
}

fn parse_url(raw: &str) -> Result<(Url, bool)> {
  let invalid = |e: url::ParseError| CacheError::Fingerprint {
    url: raw.to_string(),
    reason: e.to_string(),
  };

  match Url::parse(raw) {
    Ok(url) => Ok((url, false)),
    Err(url::ParseError::RelativeUrlWithoutBase) => {
      let base = Url::parse(RELATIVE_BASE).map_err(invalid)?;
      base.join(raw).map(|url| (url, true)).map_err(invalid)
    }
    Err(e) => Err(invalid(e)),
  }
}
