use color_eyre::{
  eyre::{eyre, WrapErr},
  Result,
};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use serde_json::Value;
use std::net::TcpStream;
use std::time::Duration;
use tracing::trace;
use url::Url;

use crate::cache::{ConnectivityProbe, RequestIdentity};

/// Plain HTTP client used as the upstream of cached requests.
#[derive(Clone)]
pub struct HttpUpstream {
  client: reqwest::Client,
}

impl HttpUpstream {
  pub fn new() -> Result<Self> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(
      USER_AGENT,
      HeaderValue::from_static(concat!("reprise/", env!("CARGO_PKG_VERSION"))),
    );

    let client = reqwest::Client::builder()
      .default_headers(headers)
      .build()
      .wrap_err("Failed to create HTTP client")?;

    Ok(Self { client })
  }

  /// GET a JSON document. Extra query parameters of the identity are appended.
  ///
  /// Transport errors keep their source so they can be classified as
  /// network failures.
  pub async fn get_json(&self, request: &RequestIdentity<Value>) -> Result<Value> {
    let response = self
      .client
      .get(&request.url)
      .query(&request.query)
      .send()
      .await
      .wrap_err_with(|| format!("Failed to fetch {}", request.url))?;

    let status = response.status();
    if !status.is_success() {
      return Err(eyre!("Request to {} failed with HTTP {}", request.url, status));
    }

    let body = response
      .bytes()
      .await
      .wrap_err_with(|| format!("Failed to read response from {}", request.url))?;

    serde_json::from_slice(&body)
      .wrap_err_with(|| format!("Failed to parse response from {}", request.url))
  }
}

/// Treats the network as online while the upstream host accepts TCP
/// connections.
///
/// Each check resolves the host and connects synchronously, blocking for at
/// most `timeout` per resolved address.
#[derive(Debug, Clone)]
pub struct HostProbe {
  url: Url,
  timeout: Duration,
}

impl HostProbe {
  pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

  pub fn for_url(raw: &str) -> Result<Self> {
    let url = Url::parse(raw).wrap_err_with(|| format!("Invalid upstream URL {}", raw))?;
    if url.host().is_none() {
      return Err(eyre!("Upstream URL {} has no host", raw));
    }
    Ok(Self {
      url,
      timeout: Self::DEFAULT_TIMEOUT,
    })
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }
}

impl ConnectivityProbe for HostProbe {
  fn is_online(&self) -> bool {
    let addrs = match self.url.socket_addrs(|| None) {
      Ok(addrs) => addrs,
      Err(e) => {
        trace!(url = %self.url, error = %e, "could not resolve upstream host");
        return false;
      }
    };
    addrs
      .iter()
      .any(|addr| TcpStream::connect_timeout(addr, self.timeout).is_ok())
  }
}
