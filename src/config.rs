//! Immutable, process-wide startup configuration.
//!
//! Assembled once in `main` from CLI flags and the two environment
//! variables this server reads (`NIX_SECRET_KEY_FILE`,
//! `NIX_UPSTREAM_CACHES`), then handed to every request handler behind an
//! `Arc`. Nothing in here is ever mutated after startup.

use std::path::PathBuf;

use anyhow::Context;
use reqwest::Url;

use crate::signing::SecretKey;

/// User-agent sent on every upstream request, identifying this server.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// The default upstream used when `NIX_UPSTREAM_CACHES` is unset.
const DEFAULT_UPSTREAM: &str = "https://cache.nixos.org";

/// Process-wide configuration, read-only after startup.
pub struct Config {
    /// Store directory this server publishes, e.g. `/nix/store`.
    pub store_dir: PathBuf,
    /// Ordered, non-empty list of upstream binary cache base URLs, each
    /// normalized to have no trailing `/` so request paths can be built by
    /// plain string concatenation (`{upstream}/{hashpart}.narinfo`). Empty
    /// only when `NIX_UPSTREAM_CACHES` is explicitly set to the empty
    /// string, in which case pull-through is disabled entirely.
    pub upstreams: Vec<String>,
    /// Loaded signing key, if `NIX_SECRET_KEY_FILE` was set.
    pub secret_key: Option<SecretKey>,
}

impl Config {
    /// Builds the configuration from a store directory and the process
    /// environment.
    pub async fn load(store_dir: PathBuf) -> anyhow::Result<Self> {
        let secret_key = match std::env::var_os("NIX_SECRET_KEY_FILE") {
            None => None,
            Some(path) => Some(
                SecretKey::load(path.as_ref())
                    .await
                    .with_context(|| format!("loading secret key from {:?}", path))?,
            ),
        };
        let upstreams = match std::env::var("NIX_UPSTREAM_CACHES") {
            Err(_) => vec![parse_upstream(DEFAULT_UPSTREAM)?],
            Ok(raw) if raw.trim().is_empty() => vec![],
            Ok(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(parse_upstream)
                .collect::<anyhow::Result<Vec<_>>>()?,
        };
        Ok(Config {
            store_dir,
            upstreams,
            secret_key,
        })
    }
}

fn parse_upstream(s: &str) -> anyhow::Result<String> {
    let trimmed = s.strip_suffix('/').unwrap_or(s);
    // Parsed only to validate; the normalized *string* (not the
    // reparsed/re-serialized `Url`, which would reinsert a trailing `/`
    // for an origin-only URL) is what gets concatenated with paths.
    Url::parse(trimmed).with_context(|| format!("upstream cache url {s:?} is malformed"))?;
    Ok(trimmed.to_string())
}
