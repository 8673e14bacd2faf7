//! The Request Dispatcher: the five HTTP route shapes this server serves,
//! and the glue between them and the rest of the pipeline.
//!
//! References:
//! Protocol: <https://github.com/fzakaria/nix-http-binary-cache-api-spec>

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header::CONTENT_TYPE, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Router};
use http::header::CONTENT_LENGTH;
use tokio_util::io::ReaderStream;

use crate::config::Config;
use crate::error::AppError;
use crate::fetcher::{Outcome, PullThroughFetcher};
use crate::hash::HashPart;
use crate::narinfo::{Compression, NarInfo};
use crate::store::StoreGateway;
use crate::store_path::StorePath;
use crate::Options;

const NARINFO_CONTENT_TYPE: &str = "text/x-nix-narinfo";
/// Body type of `/nar/...` and `/log/...` responses.
const NAR_CONTENT_TYPE: &str = "text/plain";

struct ServerState<G: StoreGateway> {
    config: Arc<Config>,
    gateway: G,
    fetcher: Arc<PullThroughFetcher<G>>,
}

// `#[derive(Clone)]` would additionally require `G::Clone`'s bound to be
// inferred correctly for the `Arc` fields, which it already is; written out
// so the bound on `G` reads the same as everywhere else in this crate.
impl<G: StoreGateway> Clone for ServerState<G> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            gateway: self.gateway.clone(),
            fetcher: self.fetcher.clone(),
        }
    }
}

fn not_found_file() -> Response {
    (StatusCode::NOT_FOUND, "File not found.\n").into_response()
}

/// Resolves `hash_part` to a store path, trying the local store first and
/// falling back to the pull-through fetcher when it is configured.
async fn resolve<G: StoreGateway>(
    state: &ServerState<G>,
    hash_part: &HashPart,
) -> Result<StorePath, AppError> {
    if let Some(path) = state
        .gateway
        .lookup_by_hash_part(hash_part)
        .await
        .map_err(AppError::StoreUnavailable)?
    {
        return Ok(path);
    }
    if state.config.upstreams.is_empty() {
        return Err(AppError::NotFound);
    }
    match state
        .fetcher
        .fetch(hash_part)
        .await
        .map_err(AppError::StoreUnavailable)?
    {
        Outcome::Hit(path) => Ok(path),
        Outcome::Miss => Err(AppError::NotFound),
    }
}

/// Composes the narinfo this server emits for an already-resolved store
/// path: egress is always `Compression: none`, and
/// signatures are either a single freshly-computed one (if a secret key is
/// configured) or the upstream signatures forwarded verbatim.
async fn compose_narinfo<G: StoreGateway>(
    state: &ServerState<G>,
    path: &StorePath,
) -> Result<String, AppError> {
    let info = state
        .gateway
        .query_path_info(path)
        .await
        .map_err(AppError::StoreUnavailable)?;
    let upstream_sigs = info.sigs;

    let mut narinfo = NarInfo {
        store_path: path.as_ref().to_string_lossy().into_owned(),
        url: format!("nar/{}-{}.nar", path.hash_part(), info.nar_hash.base32()),
        compression: Compression::None,
        nar_hash: info.nar_hash.to_string(),
        nar_size: info.nar_size,
        references: info.references,
        deriver: info.deriver,
        sigs: Vec::new(),
        extra: Default::default(),
    };
    narinfo.sigs = match &state.config.secret_key {
        Some(key) => vec![key.sign_narinfo(&state.config.store_dir, &narinfo)],
        None => upstream_sigs,
    };
    Ok(narinfo.to_string())
}

async fn get_nix_cache_info<G: StoreGateway>(State(state): State<ServerState<G>>) -> Response {
    let body = format!(
        "StoreDir: {}\nWantMassQuery: 1\nPriority: 30\n",
        state.config.store_dir.display()
    );
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain")],
        body,
    )
        .into_response()
}

async fn get_narinfo<G: StoreGateway>(
    Path(raw): Path<String>,
    State(state): State<ServerState<G>>,
) -> Response {
    let Some(hash_str) = raw.strip_suffix(".narinfo") else {
        return not_found_file();
    };
    let Ok(hash_part) = HashPart::new(hash_str) else {
        return not_found_file();
    };
    match resolve(&state, &hash_part).await {
        Ok(path) => match compose_narinfo(&state, &path).await {
            Ok(body) => (StatusCode::OK, [(CONTENT_TYPE, NARINFO_CONTENT_TYPE)], body).into_response(),
            Err(e) => e.into_response(),
        },
        Err(e) => e.into_response(),
    }
}

/// `{hashpart}-{narhash}.nar` or legacy `{hashpart}.nar`, split apart here
/// because both shapes land on the same `/nar/{path}` axum route (a single
/// path segment cannot mix a literal suffix with more than one parameter).
enum NarRequest {
    Hashed { hash_part: HashPart, nar_hash_base32: String },
    Legacy { hash_part: HashPart },
}

fn parse_nar_path(raw: &str) -> Option<NarRequest> {
    let stem = raw.strip_suffix(".nar")?;
    if stem.len() == 32 {
        let hash_part = HashPart::new(stem).ok()?;
        return Some(NarRequest::Legacy { hash_part });
    }
    if stem.len() > 33 && stem.as_bytes().get(32) == Some(&b'-') {
        let hash_part = HashPart::new(&stem[..32]).ok()?;
        let nar_hash_base32 = stem[33..].to_string();
        return Some(NarRequest::Hashed { hash_part, nar_hash_base32 });
    }
    None
}

async fn stream_nar<G: StoreGateway>(state: &ServerState<G>, path: &StorePath) -> Result<Response, AppError> {
    let info = state
        .gateway
        .query_path_info(path)
        .await
        .map_err(AppError::StoreUnavailable)?;
    let stream = state
        .gateway
        .stream_path(path)
        .await
        .map_err(AppError::StoreUnavailable)?;
    let body = axum::body::Body::from_stream(ReaderStream::new(stream));
    Ok((
        StatusCode::OK,
        [
            (CONTENT_TYPE, NAR_CONTENT_TYPE.to_string()),
            (CONTENT_LENGTH, info.nar_size.to_string()),
        ],
        body,
    )
        .into_response())
}

async fn get_nar<G: StoreGateway>(
    Path(raw): Path<String>,
    State(state): State<ServerState<G>>,
) -> Response {
    let request = match parse_nar_path(&raw) {
        Some(r) => r,
        None => return not_found_file(),
    };
    let hash_part = match &request {
        NarRequest::Hashed { hash_part, .. } | NarRequest::Legacy { hash_part } => hash_part,
    };
    let path = match resolve(&state, hash_part).await {
        Ok(path) => path,
        Err(e) => return e.into_response(),
    };
    if let NarRequest::Hashed { nar_hash_base32, .. } = &request {
        match state.gateway.query_path_info(&path).await {
            Ok(info) if info.nar_hash.base32() == nar_hash_base32 => {}
            Ok(_) => return AppError::HashMismatch.into_response(),
            Err(e) => return AppError::StoreUnavailable(e).into_response(),
        }
    }
    match stream_nar(&state, &path).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// `[0-9a-z]+-[0-9a-zA-Z+\-._?=]+`.
fn valid_log_name(name: &str) -> bool {
    let Some((hash_part, rest)) = name.split_once('-') else {
        return false;
    };
    HashPart::new(hash_part).is_ok()
        && !rest.is_empty()
        && rest
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.' | b'_' | b'?' | b'='))
}

async fn get_log<G: StoreGateway>(
    Path(name): Path<String>,
    State(state): State<ServerState<G>>,
) -> Response {
    if !valid_log_name(&name) {
        return not_found_file();
    }
    let full_path = state.config.store_dir.join(&name);
    let Ok(store_path) = StorePath::new(&state.config.store_dir, &full_path) else {
        return not_found_file();
    };
    match state.gateway.stream_build_log(&store_path).await {
        Ok(Some(stream)) => {
            let body = axum::body::Body::from_stream(ReaderStream::new(stream));
            (StatusCode::OK, [(CONTENT_TYPE, NAR_CONTENT_TYPE)], body).into_response()
        }
        Ok(None) => AppError::NotFound.into_response(),
        Err(e) => AppError::StoreUnavailable(e).into_response(),
    }
}

async fn fallback() -> Response {
    (StatusCode::NOT_FOUND, "File not found.\n").into_response()
}

fn router<G: StoreGateway>(state: ServerState<G>) -> Router {
    Router::new()
        .route("/nix-cache-info", get(get_nix_cache_info))
        .route("/{path}", get(get_narinfo))
        .route("/nar/{path}", get(get_nar))
        .route("/log/{name}", get(get_log))
        .fallback(fallback)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Starts the server according to command line arguments contained in
/// `args`. Does not return unless the listener fails or is shut down.
pub async fn run_server(args: Options) -> anyhow::Result<()> {
    let config = Arc::new(Config::load(args.store_dir.clone()).await?);
    let gateway = crate::store::NixStoreGateway::with_binary(
        args.store_dir.clone(),
        args.nix_store_bin.clone(),
    );
    let client = crate::upstream::UpstreamClient::new()?;
    let fetcher = Arc::new(PullThroughFetcher::new(
        config.store_dir.clone(),
        config.upstreams.clone(),
        client,
        gateway.clone(),
    ));
    let state = ServerState {
        config,
        gateway,
        fetcher,
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(args.listen_address)
        .await
        .map_err(|e| anyhow::anyhow!("opening listen socket on {}: {e}", args.listen_address))?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
