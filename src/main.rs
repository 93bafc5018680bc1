//! `diffcache` serves raw and diff images over HTTP, computing and caching
//! diffs on demand.

use clap::Parser;
use derive_more::{Display, Error};
use diffcache_config::Config;
use diffcache_diffstore::{DiffStore, DiffStoreOptions, default_diff_fn};
use diffcache_storage::BlobHandle;
use diffcache_storage::backend::LocalBlobStore;
use exn::ResultExt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Display, Error)]
enum ErrorKind {
    #[display("configuration error")]
    Config,
    #[display("could not open diff store")]
    Store,
    #[display("server error")]
    Server,
}

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Configuration file (TOML, YAML or JSON).
    #[arg(short, long, env = "DIFFCACHE_CONFIG")]
    config: Option<PathBuf>,
    /// Address to listen on, overriding the configuration.
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<(), exn::Exn<ErrorKind>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let config = Config::load(args.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    let listen = args.listen.unwrap_or(config.listen);
    let sources = config
        .sources
        .iter()
        .map(|source| LocalBlobStore::new(&source.name, &source.path).map(|store| Arc::new(store) as BlobHandle))
        .collect::<Result<Vec<_>, _>>()
        .or_raise(|| ErrorKind::Config)?;
    let options = DiffStoreOptions::new(&config.base_dir)
        .with_cache_gigs(config.cache_gigs)
        .with_parallelism(config.parallelism())
        .with_source_prefix(&config.source_prefix);
    let store = DiffStore::open(options, sources, default_diff_fn()).await.or_raise(|| ErrorKind::Store)?;

    let listener = TcpListener::bind(listen).await.or_raise(|| ErrorKind::Server)?;
    tracing::info!(%listen, prefix = %config.url_prefix, "Serving images");
    let served = axum::serve(listener, store.image_handler(&config.url_prefix))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .or_raise(|| ErrorKind::Server);
    // Flush pending writes even if the server failed.
    store.close().await;
    served
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = ?err, "Unable to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
