//! The pull-through caching pipeline: resolve a hash part against an
//! ordered list of upstream caches, import the winning object into the
//! local store, and report the result.
//!
//! Per-upstream state machine:
//! `Probe -> Parse -> Download -> Decompress -> Restore -> Done`. Any
//! non-terminal failure advances to the next upstream (`Next`); running
//! out of upstreams is a terminal `Miss`.

use std::path::PathBuf;

use tracing::Instrument as _;

use crate::decompress::DecompressingReader;
use crate::hash::HashPart;
use crate::narinfo::NarInfo;
use crate::store::StoreGateway;
use crate::store_path::StorePath;
use crate::upstream::{Fetched, UpstreamClient};

/// Outcome of a pull-through fetch attempt.
pub enum Outcome {
    /// A store path was imported (or already existed due to a lost race)
    /// and is ready to serve.
    Hit(StorePath),
    /// No configured upstream had the object.
    Miss,
}

/// Orchestrates the upstream probe -> download -> decompress -> restore
/// pipeline over an ordered upstream list.
pub struct PullThroughFetcher<G: StoreGateway> {
    store_dir: PathBuf,
    upstreams: Vec<String>,
    client: UpstreamClient,
    gateway: G,
}

impl<G: StoreGateway> PullThroughFetcher<G> {
    /// Builds a fetcher over `upstreams` (already normalized, see
    /// [`crate::config::Config`]).
    pub fn new(store_dir: PathBuf, upstreams: Vec<String>, client: UpstreamClient, gateway: G) -> Self {
        Self {
            store_dir,
            upstreams,
            client,
            gateway,
        }
    }

    /// Attempts to resolve `hash_part` against each configured upstream in
    /// order, importing the first one that succeeds. Absorbs every
    /// per-upstream failure internally; only returns an error for
    /// problems with the local store itself (not with any upstream).
    pub async fn fetch(&self, hash_part: &HashPart) -> anyhow::Result<Outcome> {
        for upstream in &self.upstreams {
            let span = tracing::trace_span!("pull-through", upstream, hash_part = %hash_part);
            match self.try_upstream(upstream, hash_part).instrument(span).await {
                Attempt::Done(path) => return Ok(Outcome::Hit(path)),
                Attempt::Next(reason) => {
                    tracing::debug!(upstream, hash_part = %hash_part, "upstream attempt failed: {reason:#}");
                }
            }
        }
        Ok(Outcome::Miss)
    }

    async fn try_upstream(&self, upstream: &str, hash_part: &HashPart) -> Attempt {
        // Probe
        let narinfo_url = format!("{upstream}/{hash_part}.narinfo");
        let body = match self.client.get_bytes(&narinfo_url).await {
            Ok(Fetched::Found(body)) => body,
            Ok(Fetched::NotFound) => return Attempt::Next(anyhow::anyhow!("no narinfo")),
            Err(e) => return Attempt::Next(e),
        };

        // Parse
        let text = match String::from_utf8(body) {
            Ok(text) => text,
            Err(e) => return Attempt::Next(e.into()),
        };
        let info = match NarInfo::parse(&text) {
            Ok(info) => info,
            Err(e) => return Attempt::Next(e),
        };

        // Download
        let nar_url = format!("{upstream}/{}", info.url);
        let download = match tempfile::Builder::new().prefix("nar-download-").tempfile() {
            Ok(f) => f,
            Err(e) => return Attempt::Next(e.into()),
        };
        match self.client.download_to_file(&nar_url, download.path()).await {
            Ok(Fetched::Found(())) => {}
            Ok(Fetched::NotFound) => return Attempt::Next(anyhow::anyhow!("archive {nar_url} missing")),
            Err(e) => return Attempt::Next(e),
        }

        // Decompress
        let file = match tokio::fs::File::open(download.path()).await {
            Ok(f) => f,
            Err(e) => return Attempt::Next(e.into()),
        };
        let reader = tokio::io::BufReader::new(file);
        let decompressing = match DecompressingReader::new(reader, info.compression, info.nar_size) {
            Ok(r) => r,
            Err(e) => return Attempt::Next(e),
        };

        // Restore
        let store_path = match self.store_path_for(hash_part, &info) {
            Ok(p) => p,
            Err(e) => return Attempt::Next(e),
        };
        match self.gateway.restore_path(&store_path, decompressing).await {
            Ok(()) => Attempt::Done(store_path),
            Err(restore_err) => {
                // Two concurrent misses may both restore the same path; a
                // "failure" here can really be a race the other caller
                // already won.
                match self.gateway.lookup_by_hash_part(hash_part).await {
                    Ok(Some(existing)) => Attempt::Done(existing),
                    _ => Attempt::Next(restore_err),
                }
            }
        }
    }

    fn store_path_for(&self, hash_part: &HashPart, info: &NarInfo) -> anyhow::Result<StorePath> {
        let path = std::path::Path::new(&info.store_path);
        let store_path = StorePath::new(&self.store_dir, path)?;
        anyhow::ensure!(
            store_path.hash_part() == hash_part,
            "upstream narinfo StorePath hash part {:?} does not match requested {:?}",
            store_path.hash_part(),
            hash_part
        );
        Ok(store_path)
    }
}

enum Attempt {
    Done(StorePath),
    Next(anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BoxedReader, PathInfo};
    use crate::test_utils::{TestStoreGateway, HTTP_UPSTREAM};

    fn fetcher(upstreams: Vec<String>, gateway: TestStoreGateway) -> PullThroughFetcher<TestStoreGateway> {
        PullThroughFetcher::new(
            PathBuf::from("/nix/store"),
            upstreams,
            UpstreamClient::new().unwrap(),
            gateway,
        )
    }

    #[tokio::test]
    async fn test_fetch_uncompressed_hit() {
        let hash_part = HashPart::new("dddddddddddddddddddddddddddddddd").unwrap();
        let gateway = TestStoreGateway::new();
        let store_path = StorePath::new(
            std::path::Path::new("/nix/store"),
            std::path::Path::new("/nix/store/dddddddddddddddddddddddddddddddd-pkg"),
        )
        .unwrap();
        gateway
            .expect_restore(
                &store_path,
                PathInfo {
                    deriver: None,
                    nar_hash: crate::hash::NarHash::from_base32(&"0".repeat(52)).unwrap(),
                    nar_size: 18,
                    references: vec!["eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee-lib".to_string()],
                    sigs: vec![],
                },
            )
            .await;
        let f = fetcher(vec![HTTP_UPSTREAM.to_string()], gateway.clone());
        let outcome = f.fetch(&hash_part).await.unwrap();
        let Outcome::Hit(path) = outcome else {
            panic!("expected Hit");
        };
        assert_eq!(path.name(), "pkg");
        let info = gateway.query_path_info(&path).await.unwrap();
        assert_eq!(info.references, vec!["eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee-lib".to_string()]);
    }

    #[tokio::test]
    async fn test_fetch_gzip_decompresses_before_restore() {
        let hash_part = HashPart::new("ffffffffffffffffffffffffffffffff").unwrap();
        let gateway = TestStoreGateway::new();
        let f = fetcher(vec![HTTP_UPSTREAM.to_string()], gateway.clone());
        let outcome = f.fetch(&hash_part).await.unwrap();
        let Outcome::Hit(path) = outcome else {
            panic!("expected Hit");
        };
        let mut stream = gateway.stream_path(&path).await.unwrap();
        let mut buf = Vec::new();
        use tokio::io::AsyncReadExt as _;
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf.len(), 27);
    }

    #[tokio::test]
    async fn test_fetch_falls_through_to_second_upstream() {
        let hash_part = HashPart::new("dddddddddddddddddddddddddddddddd").unwrap();
        let dead_upstream = format!("{}/no-such-prefix", &*HTTP_UPSTREAM);
        let gateway = TestStoreGateway::new();
        let f = fetcher(vec![dead_upstream, HTTP_UPSTREAM.to_string()], gateway);
        let outcome = f.fetch(&hash_part).await.unwrap();
        assert!(matches!(outcome, Outcome::Hit(_)));
    }

    #[tokio::test]
    async fn test_fetch_miss_when_no_upstream_has_it() {
        let hash_part = HashPart::new("zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz").unwrap();
        let gateway = TestStoreGateway::new();
        let f = fetcher(vec![HTTP_UPSTREAM.to_string()], gateway);
        let outcome = f.fetch(&hash_part).await.unwrap();
        assert!(matches!(outcome, Outcome::Miss));
    }

    #[tokio::test]
    async fn test_fetch_empty_upstream_list_is_immediate_miss() {
        let hash_part = HashPart::new("dddddddddddddddddddddddddddddddd").unwrap();
        let gateway = TestStoreGateway::new();
        let f = fetcher(vec![], gateway);
        let outcome = f.fetch(&hash_part).await.unwrap();
        assert!(matches!(outcome, Outcome::Miss));
    }

    /// A gateway whose first `restore_path` call fails, as if a concurrent
    /// fetch had already won the race and created the path; the real
    /// `nix-store --restore` would fail on an already-existing path.
    #[derive(Clone)]
    struct RaceLoserGateway {
        inner: TestStoreGateway,
        restore_called: std::sync::Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait::async_trait]
    impl StoreGateway for RaceLoserGateway {
        async fn lookup_by_hash_part(
            &self,
            hash_part: &HashPart,
        ) -> anyhow::Result<Option<StorePath>> {
            self.inner.lookup_by_hash_part(hash_part).await
        }

        async fn query_path_info(&self, path: &StorePath) -> anyhow::Result<PathInfo> {
            self.inner.query_path_info(path).await
        }

        async fn stream_path(&self, path: &StorePath) -> anyhow::Result<BoxedReader> {
            self.inner.stream_path(path).await
        }

        async fn restore_path<R>(&self, path: &StorePath, archive: R) -> anyhow::Result<()>
        where
            R: tokio::io::AsyncRead + Unpin + Send,
        {
            if !self.restore_called.swap(true, std::sync::atomic::Ordering::SeqCst) {
                // Simulate another concurrent fetch having already
                // restored this path, as if it had raced us and won.
                let mut content = Vec::new();
                let mut archive = archive;
                tokio::io::AsyncReadExt::read_to_end(&mut archive, &mut content).await?;
                self.inner
                    .insert(
                        path,
                        content,
                        PathInfo {
                            deriver: None,
                            nar_hash: crate::hash::NarHash::from_base32(&"0".repeat(52)).unwrap(),
                            nar_size: 18,
                            references: vec!["eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee-lib".to_string()],
                            sigs: vec![],
                        },
                    )
                    .await;
                anyhow::bail!("simulated restore conflict");
            }
            self.inner.restore_path(path, archive).await
        }

        async fn stream_build_log(&self, path: &StorePath) -> anyhow::Result<Option<BoxedReader>> {
            self.inner.stream_build_log(path).await
        }
    }

    #[tokio::test]
    async fn test_fetch_recovers_from_lost_restore_race() {
        let hash_part = HashPart::new("dddddddddddddddddddddddddddddddd").unwrap();
        let gateway = RaceLoserGateway {
            inner: TestStoreGateway::new(),
            restore_called: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
        };
        let f = PullThroughFetcher::new(
            PathBuf::from("/nix/store"),
            vec![HTTP_UPSTREAM.to_string()],
            UpstreamClient::new().unwrap(),
            gateway,
        );
        let outcome = f.fetch(&hash_part).await.unwrap();
        assert!(matches!(outcome, Outcome::Hit(_)));
    }
}
