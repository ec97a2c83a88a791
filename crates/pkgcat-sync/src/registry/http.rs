//! HTTP registry client.
//!
//! Speaks the registry's JSON API:
//!
//! | Call | Request |
//! |------|---------|
//! | probe | `GET /healthz` |
//! | list packages | `GET /api/v1/packages` (newline-delimited `{"name": ...}` objects) |
//! | get package | `GET /api/v1/packages/{name}` |
//! | get bundle | `GET /api/v1/packages/{name}/channels/{channel}/bundle` |
//!
//! The package listing is consumed as a byte stream and decoded line by line,
//! so a listing that breaks mid-way still yields every name received before
//! the break.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use pkgcat_core::{Error, Result};

use super::{Bundle, PackageNameStream, RawPackage, RegistryClient, RegistryDialer};
use crate::connection::ConnectivityState;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for one catalog source.
#[derive(Clone)]
pub struct HttpRegistryClient {
    base_url: Url,
    client: reqwest::Client,
    request_timeout: Duration,
}

impl std::fmt::Debug for HttpRegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRegistryClient")
            .field("base_url", &self.base_url.as_str())
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl HttpRegistryClient {
    /// Creates a client for the registry at `address` (`host:port` or URL).
    ///
    /// # Errors
    ///
    /// Returns a connection error if the address cannot be parsed or the
    /// underlying HTTP client cannot be built.
    pub fn new(
        address: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let base_url = parse_address(address)?;
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| Error::connection_with_source("failed to build HTTP client", e))?;
        Ok(Self {
            base_url,
            client,
            request_timeout,
        })
    }

    /// Returns the base URL requests are sent to.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                Error::connection(format!("registry URL {} cannot be a base", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T> {
        let url = self.url(segments)?;
        let response = self
            .client
            .get(url.clone())
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| Error::connection_with_source(format!("request to {url} failed"), e))?;
        let response = check_status(response).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::connection_with_source(format!("reading {url} failed"), e))?;
        serde_json::from_slice(&body)
            .map_err(|e| Error::decode(format!("invalid response from {url}: {e}")))
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn list_packages(&self) -> Result<PackageNameStream> {
        let url = self.url(&["api", "v1", "packages"])?;
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| Error::connection_with_source(format!("request to {url} failed"), e))?;
        let response = check_status(response).await?;
        Ok(package_names(response.bytes_stream()))
    }

    async fn get_package(&self, name: &str) -> Result<RawPackage> {
        self.get_json(&["api", "v1", "packages", name]).await
    }

    async fn get_bundle_for_channel(&self, package: &str, channel: &str) -> Result<Bundle> {
        self.get_json(&["api", "v1", "packages", package, "channels", channel, "bundle"])
            .await
    }

    async fn probe(&self) -> ConnectivityState {
        let Ok(url) = self.url(&["healthz"]) else {
            return ConnectivityState::TransientFailure;
        };
        match self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => ConnectivityState::Ready,
            Ok(response) if response.status() == StatusCode::GONE => ConnectivityState::Shutdown,
            Ok(response) => {
                tracing::debug!(
                    base_url = %self.base_url,
                    status = %response.status(),
                    "registry probe failed"
                );
                ConnectivityState::TransientFailure
            }
            Err(e) => {
                tracing::debug!(base_url = %self.base_url, error = %e, "registry unreachable");
                ConnectivityState::TransientFailure
            }
        }
    }
}

/// Dials [`HttpRegistryClient`]s.
#[derive(Debug, Clone)]
pub struct HttpDialer {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl Default for HttpDialer {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT)
    }
}

impl HttpDialer {
    /// Creates a dialer with the given connect and per-request timeouts.
    #[must_use]
    pub const fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }
}

#[async_trait]
impl RegistryDialer for HttpDialer {
    async fn dial(&self, address: &str) -> Result<Arc<dyn RegistryClient>> {
        let client = HttpRegistryClient::new(address, self.connect_timeout, self.request_timeout)?;
        Ok(Arc::new(client))
    }
}

fn parse_address(address: &str) -> Result<Url> {
    let address = address.trim();
    if address.is_empty() {
        return Err(Error::connection("registry address is empty"));
    }
    let candidate = if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    };
    let url = Url::parse(&candidate).map_err(|e| {
        Error::connection_with_source(format!("invalid registry address {address:?}"), e)
    })?;
    if url.host_str().is_none_or(str::is_empty) {
        return Err(Error::connection(format!(
            "registry address {address:?} has no host"
        )));
    }
    Ok(url)
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().clone();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|value| {
            value
                .get("message")
                .and_then(|v| v.as_str())
                .map(str::to_string)
        })
        .unwrap_or(body);
    Err(Error::registry(
        status.as_u16(),
        format!("{url}: {}", message.trim()),
    ))
}

#[derive(Deserialize)]
struct PackageName {
    name: String,
}

struct LineReader {
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    buf: Vec<u8>,
    done: bool,
}

/// Decodes a newline-delimited stream of `{"name": ...}` objects lazily.
fn package_names<S>(inner: S) -> PackageNameStream
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    let reader = LineReader {
        inner: inner.boxed(),
        buf: Vec::new(),
        done: false,
    };
    stream::unfold(reader, |mut reader| async move {
        loop {
            if let Some(pos) = reader.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = reader.buf.drain(..=pos).collect();
                let line = line.trim_ascii();
                if line.is_empty() {
                    continue;
                }
                return Some((decode_name(line), reader));
            }
            if reader.done {
                let rest = std::mem::take(&mut reader.buf);
                let rest = rest.trim_ascii();
                if rest.is_empty() {
                    return None;
                }
                return Some((decode_name(rest), reader));
            }
            match reader.inner.next().await {
                Some(Ok(chunk)) => reader.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    reader.done = true;
                    reader.buf.clear();
                    let err = Error::connection_with_source("package listing interrupted", e);
                    return Some((Err(err), reader));
                }
                None => reader.done = true,
            }
        }
    })
    .boxed()
}

fn decode_name(line: &[u8]) -> Result<String> {
    serde_json::from_slice::<PackageName>(line)
        .map(|p| p.name)
        .map_err(|e| Error::decode(format!("invalid package listing entry: {e}")))
}
