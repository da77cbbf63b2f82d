//! floatquery HTTP server binary

use anyhow::Context;
use floatquery::config::Config;
use floatquery::server;
use floatquery::store::demo_corpus;
use floatquery::{ContextStore, HttpContextStore, InMemoryStore, QueryEngine};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn config_path() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(path));
        }
    }
    std::env::var("FLOATQUERY_CONFIG").ok().map(PathBuf::from)
}

fn build_store(config: &Config) -> anyhow::Result<Arc<dyn ContextStore>> {
    if let Some(url) = &config.store.service_url {
        info!("Using remote context store at {}", url);
        return Ok(Arc::new(HttpContextStore::new(url.clone(), config.retrieval.store_timeout)));
    }
    if let Some(path) = &config.store.corpus_path {
        let store = InMemoryStore::from_json_file(path)
            .with_context(|| format!("Failed to load corpus from {}", path.display()))?;
        info!("Loaded {} records from {}", store.len(), path.display());
        return Ok(Arc::new(store));
    }
    warn!("No corpus or store service configured, serving the built-in demo corpus");
    Ok(Arc::new(InMemoryStore::with_records(demo_corpus())))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .init();

    info!("floatquery {}", env!("CARGO_PKG_VERSION"));

    let path = config_path();
    let config = Config::load(path.as_deref()).context("Failed to load configuration")?;

    let store = build_store(&config)?;
    let engine = QueryEngine::from_config(&config, store);
    info!("Query engine initialized");

    let maintenance = engine.clone();
    let interval = config.maintenance_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            maintenance.purge();
        }
    });

    server::run_server(engine, &config.server.bind, config.server.port).await?;

    Ok(())
}
