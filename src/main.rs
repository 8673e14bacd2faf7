//! A read-only, pull-through HTTP binary cache server for the nix package
//! store.
//!
//! ### Architecture
//!
//! The narinfo wire format is in [narinfo]. Decompression of upstream
//! archives is in [decompress]. The HTTP client used to talk to upstream
//! caches is in [upstream]. The local package store is accessed through the
//! narrow [store::StoreGateway] capability interface. [fetcher] orchestrates
//! the upstream-probe/download/decompress/restore pipeline on a local miss.
//! Everything above is tied together into an HTTP server in [server].

#![warn(missing_docs)]

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::prelude::*;

pub mod config;
pub mod decompress;
pub mod error;
pub mod fetcher;
pub mod hash;
pub mod narinfo;
pub mod server;
pub mod signing;
pub mod store;
pub mod store_path;
pub mod upstream;

#[cfg(test)]
pub mod test_utils;

/// A read-only pull-through binary cache server for the nix package store.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Options {
    /// Address for the server to listen on.
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    listen_address: SocketAddr,
    /// Store directory this server publishes, e.g. `/nix/store`.
    #[arg(long, default_value = "/nix/store")]
    store_dir: PathBuf,
    /// Path to the `nix-store` binary to invoke. Overridable for tests; not
    /// meant to be changed on a real system.
    #[arg(long, default_value = "nix-store", hide = true)]
    nix_store_bin: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "nixpullcached=info,tower_http=debug")
    }
    let args = Options::parse();
    let fmt_layer = tracing_subscriber::fmt::layer().without_time();
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    server::run_server(args).await
}
