//! HTTP client for talking to upstream binary caches.
//!
//! A stateless wrapper around a single shared [`reqwest::Client`] offering
//! the two access patterns the fetcher needs: small in-memory GETs
//! (narinfo) and streamed-to-file GETs (archives).

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt as _;
use reqwest::{Client, StatusCode};
use tokio::io::AsyncWriteExt as _;

use crate::config::USER_AGENT;

/// Total time budget for a single upstream request.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(120);

/// Outcome of a GET against an upstream: either it has the object, or a
/// 404 says it doesn't. Any other failure is a hard error.
pub enum Fetched<T> {
    /// The upstream returned 200 with this payload.
    Found(T),
    /// The upstream returned 404: this is a soft failure, try the next
    /// upstream.
    NotFound,
}

/// A stateless HTTP client shared by every upstream probe.
pub struct UpstreamClient {
    client: Client,
}

impl UpstreamClient {
    /// Builds a client with the fixed user-agent and request timeout.
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(UPSTREAM_TIMEOUT)
            .build()
            .context("building upstream http client")?;
        Ok(UpstreamClient { client })
    }

    /// GETs `url` and returns the full response body in memory, or
    /// `NotFound` on a 404. Used for narinfo, which is always small.
    pub async fn get_bytes(&self, url: &str) -> anyhow::Result<Fetched<Vec<u8>>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("connecting to {url}"))?;
        match response.status() {
            StatusCode::OK => {
                let bytes = response
                    .bytes()
                    .await
                    .with_context(|| format!("reading body of {url}"))?;
                Ok(Fetched::Found(bytes.to_vec()))
            }
            StatusCode::NOT_FOUND => Ok(Fetched::NotFound),
            other => anyhow::bail!("{url} returned {other}"),
        }
    }

    /// GETs `url` and streams the response body into the file at `dest`,
    /// or reports `NotFound` on a 404. Used for archives, which may be
    /// large enough that buffering them in memory would be wasteful.
    pub async fn download_to_file(&self, url: &str, dest: &Path) -> anyhow::Result<Fetched<()>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("connecting to {url}"))?;
        match response.status() {
            StatusCode::OK => (),
            StatusCode::NOT_FOUND => return Ok(Fetched::NotFound),
            other => anyhow::bail!("{url} returned {other}"),
        };
        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("creating {}", dest.display()))?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("streaming body of {url}"))?;
            file.write_all(&chunk)
                .await
                .with_context(|| format!("writing to {}", dest.display()))?;
        }
        file.flush()
            .await
            .with_context(|| format!("flushing {}", dest.display()))?;
        Ok(Fetched::Found(()))
    }
}
