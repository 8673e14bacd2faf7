//! Functions and fixtures used in tests only.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock, Once};

use reqwest::Url;
use tokio::io::AsyncReadExt as _;
use tokio::sync::Mutex;
use tracing::Level;
use tracing_subscriber::filter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use crate::hash::NarHash;
use crate::store::{BoxedReader, PathInfo, StoreGateway};
use crate::store_path::StorePath;

static SETUP_LOGGING: Once = Once::new();

/// Tests calling this function will have tracing log in a way compatible
/// with cargo test.
pub fn setup_logging() {
    SETUP_LOGGING.call_once(|| {
        let filter = filter::Targets::new()
            .with_target("runtime", Level::DEBUG)
            .with_target("tokio", Level::DEBUG)
            .with_default(Level::TRACE);

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_filter(filter);

        tracing_subscriber::registry().with(fmt_layer).init();
    });
}

/// Path to a file under the `tests/fixtures` folder of the repo.
pub fn fixture(path: &str) -> PathBuf {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(path);
    assert!(path.exists(), "missing test fixture {}", path.display());
    path
}

/// Path to the stub `nix-store` binary used by [`crate::store`]'s unit
/// tests.
pub fn fake_nix_store_bin() -> PathBuf {
    fixture("bin/fake-nix-store")
}

/// The base URL of an HTTP server serving `tests/fixtures/upstream` as a
/// binary-cache-shaped static file tree. Started on first access.
pub static HTTP_UPSTREAM: LazyLock<Url> = LazyLock::new(start_http_upstream);

fn start_http_upstream() -> Url {
    let dir = fixture("upstream");
    let port = port_check::free_local_ipv4_port().unwrap();
    let server =
        http_handle::server::Server::new(&format!("127.0.0.1:{port}"), dir.to_str().unwrap());
    std::thread::spawn(move || server.start().unwrap());
    while !port_check::is_port_reachable_with_timeout(
        ("127.0.0.1", port),
        std::time::Duration::from_millis(300),
    ) {
        std::thread::sleep(std::time::Duration::from_millis(100))
    }
    Url::parse(&format!("http://127.0.0.1:{port}")).unwrap()
}

struct Entry {
    content: Vec<u8>,
    info: PathInfo,
}

/// An in-memory [`StoreGateway`], standing in for the real
/// `nix-store`-backed one in tests that exercise the fetcher and
/// dispatcher logic rather than the store gateway itself.
#[derive(Clone, Default)]
pub struct TestStoreGateway {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    logs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    restore_info: Arc<Mutex<HashMap<String, PathInfo>>>,
}

fn default_info(content: &[u8]) -> PathInfo {
    PathInfo {
        deriver: None,
        nar_hash: NarHash::from_base32(&"0".repeat(52)).unwrap(),
        nar_size: content.len() as u64,
        references: vec![],
        sigs: vec![],
    }
}

impl TestStoreGateway {
    /// Builds an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `path` as already present locally, with the given
    /// content and metadata, as if it had been built or previously
    /// imported.
    pub async fn insert(&self, path: &StorePath, content: Vec<u8>, info: PathInfo) {
        self.entries
            .lock()
            .await
            .insert(path.leaf_str().to_string(), Entry { content, info });
    }

    /// Registers a build log for `path`.
    pub async fn insert_log(&self, path: &StorePath, log: Vec<u8>) {
        self.logs
            .lock()
            .await
            .insert(path.leaf_str().to_string(), log);
    }

    /// Pre-registers the [`PathInfo`] that a later `restore_path` call for
    /// `path` should record, standing in for the references a real
    /// `nix-store --restore` would derive by scanning the NAR.
    pub async fn expect_restore(&self, path: &StorePath, info: PathInfo) {
        self.restore_info
            .lock()
            .await
            .insert(path.leaf_str().to_string(), info);
    }
}

#[async_trait::async_trait]
impl StoreGateway for TestStoreGateway {
    async fn lookup_by_hash_part(
        &self,
        hash_part: &crate::hash::HashPart,
    ) -> anyhow::Result<Option<StorePath>> {
        let entries = self.entries.lock().await;
        for leaf in entries.keys() {
            if leaf.starts_with(&format!("{hash_part}-")) {
                return Ok(Some(StorePath::new(
                    std::path::Path::new("/nix/store"),
                    &std::path::Path::new("/nix/store").join(leaf),
                )?));
            }
        }
        Ok(None)
    }

    async fn query_path_info(&self, path: &StorePath) -> anyhow::Result<PathInfo> {
        let entries = self.entries.lock().await;
        entries
            .get(path.leaf_str())
            .map(|e| e.info.clone())
            .ok_or_else(|| anyhow::anyhow!("no such path: {}", path.leaf_str()))
    }

    async fn stream_path(&self, path: &StorePath) -> anyhow::Result<BoxedReader> {
        let entries = self.entries.lock().await;
        let content = entries
            .get(path.leaf_str())
            .map(|e| e.content.clone())
            .ok_or_else(|| anyhow::anyhow!("no such path: {}", path.leaf_str()))?;
        Ok(Box::pin(Cursor::new(content)))
    }

    async fn restore_path<R>(&self, path: &StorePath, mut archive: R) -> anyhow::Result<()>
    where
        R: tokio::io::AsyncRead + Unpin + Send,
    {
        let mut content = Vec::new();
        archive.read_to_end(&mut content).await?;
        let info = match self.restore_info.lock().await.remove(path.leaf_str()) {
            Some(info) => info,
            None => default_info(&content),
        };
        self.entries
            .lock()
            .await
            .insert(path.leaf_str().to_string(), Entry { content, info });
        Ok(())
    }

    async fn stream_build_log(&self, path: &StorePath) -> anyhow::Result<Option<BoxedReader>> {
        let logs = self.logs.lock().await;
        Ok(logs
            .get(path.leaf_str())
            .map(|log| Box::pin(Cursor::new(log.clone())) as BoxedReader))
    }
}
