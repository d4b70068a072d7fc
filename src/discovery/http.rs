//! Outbound HTTP for discovery sources
//!
//! Every request is SSRF-screened first, redirects are never followed, and
//! response bodies are read through a hard size cap.

use bytes::{Bytes, BytesMut};
use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::DiscoveryConfig;
use crate::security::screen_url;
use crate::{Error, Result};

/// Credentials attached to a source request
#[derive(Debug, Clone, Copy)]
pub enum Auth<'a> {
    /// No credentials
    None,
    /// HTTP basic auth (skipped when the username is empty)
    Basic(&'a str, &'a str),
    /// Bearer token
    Bearer(&'a str),
}

/// Shared client for the HTTP-based sources
#[derive(Debug, Clone)]
pub struct SourceClient {
    client: Client,
    max_bytes: usize,
}

impl SourceClient {
    /// Build the client from discovery configuration
    pub fn new(config: &DiscoveryConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("dashgate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            max_bytes: config.max_response_bytes,
        })
    }

    /// Response cap in bytes
    #[must_use]
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Screened GET decoding a JSON body
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str, auth: Auth<'_>) -> Result<T> {
        let url = screen_url(url).await?;
        let request = with_auth(self.client.get(url), auth);
        self.send_json(request).await
    }

    /// Screened POST with a JSON body, decoding a JSON response
    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(&self, url: &str, body: &B) -> Result<T> {
        let url = screen_url(url).await?;
        self.send_json(self.client.post(url).json(body)).await
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Internal(format!("Source answered HTTP {status}")));
        }
        let body = read_limited(response, self.max_bytes).await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

fn with_auth(request: RequestBuilder, auth: Auth<'_>) -> RequestBuilder {
    match auth {
        Auth::None => request,
        Auth::Basic(user, _) if user.is_empty() => request,
        Auth::Basic(user, password) => request.basic_auth(user, Some(password)),
        Auth::Bearer(token) => request.bearer_auth(token),
    }
}

/// Read a response body, failing once it exceeds `max` bytes
pub async fn read_limited(mut response: Response, max: usize) -> Result<Bytes> {
    if response
        .content_length()
        .is_some_and(|len| len > max as u64)
    {
        return Err(Error::Internal(format!("Response exceeds {max} bytes")));
    }

    let mut buf = BytesMut::new();
    while let Some(chunk) = response.chunk().await? {
        if buf.len() + chunk.len() > max {
            return Err(Error::Internal(format!("Response exceeds {max} bytes")));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// Join an API path onto a base URL, tolerating trailing slashes
#[must_use]
pub fn join(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
