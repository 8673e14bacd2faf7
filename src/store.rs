//! The Store Gateway: a narrow capability interface over the local
//! package store, and its sole implementation, which shells out to
//! `nix-store`.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt as _, AsyncRead, AsyncWriteExt as _, BufReader};
use tokio::process::{Child, Command};

use crate::hash::{HashPart, NarHash};
use crate::store_path::StorePath;

/// The subset of `queryPathInfo` this server needs to compose a narinfo.
#[derive(Debug, Clone)]
pub struct PathInfo {
    /// Leaf name of the deriver, if known.
    pub deriver: Option<String>,
    /// Hash of the NAR serialization of this path.
    pub nar_hash: NarHash,
    /// Size in bytes of the NAR serialization.
    pub nar_size: u64,
    /// Leaf names of this path's references, in store order.
    pub references: Vec<String>,
    /// Any signatures already attached to this path in the store.
    pub sigs: Vec<String>,
}

/// A boxed, type-erased archive/log byte stream.
pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

/// Capability interface over the local package store.
///
/// `#[async_trait]`, not a native `async fn` in trait: every axum handler
/// is generic over `G: StoreGateway`, and auto-trait leakage (`Send`)
/// does not cross an RPITIT into a generic caller, so the router could
/// not otherwise prove a handler's future is `Send` for an arbitrary `G`.
/// `async_trait` boxes each call into a `Pin<Box<dyn Future + Send>>`,
/// restoring the guarantee the teacher's own `Substituter` trait relies
/// on for the same reason.
#[async_trait::async_trait]
pub trait StoreGateway: Clone + Send + Sync + 'static {
    /// Resolves the canonical store path for a hash part, or `None` if no
    /// such path exists locally.
    async fn lookup_by_hash_part(
        &self,
        hash_part: &HashPart,
    ) -> anyhow::Result<Option<StorePath>>;

    /// Queries metadata about a (must already be valid) store path.
    async fn query_path_info(&self, path: &StorePath) -> anyhow::Result<PathInfo>;

    /// Streams the NAR serialization of a store path. The stream's total
    /// length equals `query_path_info(path).nar_size`.
    async fn stream_path(&self, path: &StorePath) -> anyhow::Result<BoxedReader>;

    /// Materializes `archive` (a NAR byte stream) at `path`. `path` must
    /// not already exist.
    async fn restore_path<R>(&self, path: &StorePath, archive: R) -> anyhow::Result<()>
    where
        R: AsyncRead + Unpin + Send;

    /// Streams the build log for `path`, or `None` if no log is kept for
    /// it.
    async fn stream_build_log(&self, path: &StorePath) -> anyhow::Result<Option<BoxedReader>>;
}

/// Wraps a spawned child process's stdout so the child is reaped (no
/// zombies) when the reader is dropped, including on
/// early cancellation.
struct ChildStdout {
    child: Child,
    stdout: tokio::process::ChildStdout,
}

impl AsyncRead for ChildStdout {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stdout).poll_read(cx, buf)
    }
}

impl Drop for ChildStdout {
    fn drop(&mut self) {
        // start_kill is synchronous and non-blocking; the process is
        // reaped by tokio's internal reaper once it exits.
        let _ = self.child.start_kill();
    }
}

/// Shells out to the `nix-store` CLI to implement the [`StoreGateway`]
/// capabilities.
#[derive(Clone)]
pub struct NixStoreGateway {
    store_dir: PathBuf,
    /// Path or name of the `nix-store` binary to invoke; overridable in
    /// tests to point at a stub.
    nix_store_bin: PathBuf,
}

impl NixStoreGateway {
    /// Builds a gateway that calls the `nix-store` binary found on `PATH`.
    pub fn new(store_dir: PathBuf) -> Self {
        Self {
            store_dir,
            nix_store_bin: PathBuf::from("nix-store"),
        }
    }

    /// Builds a gateway that calls a specific `nix-store` binary, for
    /// tests.
    pub fn with_binary(store_dir: PathBuf, nix_store_bin: PathBuf) -> Self {
        Self {
            store_dir,
            nix_store_bin,
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.nix_store_bin);
        command.kill_on_drop(true);
        command
    }

    async fn query_one(&self, path: &StorePath, flag: &str) -> anyhow::Result<String> {
        let mut command = self.command();
        command.arg("--query").arg(flag).arg(path.as_ref() as &Path);
        let output = command
            .output()
            .await
            .with_context(|| format!("spawning {:?}", &command))?;
        anyhow::ensure!(
            output.status.success(),
            "{:?} failed: {}",
            &command,
            String::from_utf8_lossy(&output.stderr)
        );
        Ok(String::from_utf8(output.stdout)
            .with_context(|| format!("{:?} produced non-utf8 output", &command))?
            .trim_end_matches('\n')
            .to_string())
    }
}

#[async_trait::async_trait]
impl StoreGateway for NixStoreGateway {
    async fn lookup_by_hash_part(
        &self,
        hash_part: &HashPart,
    ) -> anyhow::Result<Option<StorePath>> {
        let store_dir = self.store_dir.clone();
        let prefix = hash_part.to_string();
        let found = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<PathBuf>> {
            for entry in std::fs::read_dir(&store_dir).context("opening store directory")? {
                let entry = entry.context("iterating store directory")?;
                let name = entry.file_name();
                if name.to_string_lossy().starts_with(&format!("{prefix}-")) {
                    return Ok(Some(entry.path()));
                }
            }
            Ok(None)
        })
        .await??;
        found
            .map(|path| StorePath::new(&self.store_dir, &path))
            .transpose()
    }

    async fn query_path_info(&self, path: &StorePath) -> anyhow::Result<PathInfo> {
        let hash = self.query_one(path, "--hash").await?;
        let size = self.query_one(path, "--size").await?;
        let deriver = self.query_one(path, "--deriver").await?;
        let references = self.query_one(path, "--references").await?;
        let sigs = self.query_one(path, "--sigs").await.unwrap_or_default();

        let nar_hash = NarHash::from_base32(hash.strip_prefix("sha256:").unwrap_or(&hash))
            .with_context(|| format!("parsing NarHash {hash:?} from nix-store --query --hash"))?;
        let nar_size: u64 = size
            .parse()
            .with_context(|| format!("parsing NarSize {size:?} from nix-store --query --size"))?;
        let references: Vec<String> = references
            .split_whitespace()
            .filter_map(|full| full.rsplit('/').next())
            .map(str::to_string)
            .filter(|leaf| leaf != path.leaf_str())
            .collect();
        let deriver = deriver
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty() && *s != "unknown-deriver")
            .map(str::to_string);
        let sigs = sigs
            .split_whitespace()
            .map(str::to_string)
            .collect::<Vec<_>>();

        Ok(PathInfo {
            deriver,
            nar_hash,
            nar_size,
            references,
            sigs,
        })
    }

    async fn stream_path(&self, path: &StorePath) -> anyhow::Result<BoxedReader> {
        let mut command = self.command();
        command.arg("--dump").arg(path.as_ref() as &Path);
        command.stdout(Stdio::piped());
        let mut child = command
            .spawn()
            .with_context(|| format!("spawning {:?}", &command))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("nix-store --dump did not provide stdout"))?;
        Ok(Box::pin(ChildStdout { child, stdout }))
    }

    async fn restore_path<R>(&self, path: &StorePath, archive: R) -> anyhow::Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut command = self.command();
        command.arg("--restore").arg(path.as_ref() as &Path);
        command.stdin(Stdio::piped());
        let mut process = command
            .spawn()
            .with_context(|| format!("spawning {:?}", &command))?;
        let Some(mut stdin) = process.stdin.take() else {
            anyhow::bail!("running {:?} without stdin", &command);
        };
        let mut archive = archive;
        let copy_result = tokio::io::copy(&mut archive, &mut stdin).await;
        let flush_result = stdin.flush().await;
        drop(stdin);
        match copy_result.and(flush_result) {
            Ok(_) => {
                let status = process
                    .wait()
                    .await
                    .with_context(|| format!("waiting for {:?}", &command))?;
                anyhow::ensure!(status.success(), "{:?} failed", &command);
                Ok(())
            }
            Err(e) => {
                let _ = process.kill().await;
                Err(e).with_context(|| format!("piping archive into {:?}", &command))
            }
        }
    }

    async fn stream_build_log(&self, path: &StorePath) -> anyhow::Result<Option<BoxedReader>> {
        let mut command = self.command();
        command.arg("--read-log").arg(path.as_ref() as &Path);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::null());
        let mut child = command
            .spawn()
            .with_context(|| format!("spawning {:?}", &command))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("nix-store --read-log did not provide stdout"))?;
        let mut reader = BufReader::new(stdout);
        // Peek for output without consuming, so we can report "no log" as
        // `None` rather than an empty stream if the process exits
        // immediately with nothing on stdout.
        let has_data = !reader
            .fill_buf()
            .await
            .context("reading nix-store --read-log output")?
            .is_empty();
        if !has_data {
            let status = child.wait().await.context("waiting for nix-store --read-log")?;
            if !status.success() {
                return Ok(None);
            }
        }
        Ok(Some(Box::pin(ChildStdout {
            child,
            stdout: reader.into_inner(),
        })))
    }
}
