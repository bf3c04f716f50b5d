//! bpmn-actor-server: host process for the per-node actor engine.
//!
//! Reads config from the first CLI argument or `BPMN_ACTOR_CONFIG` (defaults
//! when neither is given), deploys every `*.yaml` definition found in
//! `definitions_dir` and runs the due-timer poller until ctrl-c.
//!
//! With the `postgres` feature, `DATABASE_URL` enables the `postgres` timer
//! store and data-object providers.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

use bpmn_actor_core::config::CONFIG_ENV;
use bpmn_actor_core::store_memory::{memory_registry, MemoryRepository};
use bpmn_actor_core::{inbound_channel, Engine, EngineConfig, ProcessDefinition, ProviderRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bpmn_actor_core=info,bpmn_actor_server=info".into()),
        )
        .init();

    let config = load_config()?;
    let (inbound_tx, inbound_rx) = inbound_channel();
    let mut registry = memory_registry(inbound_tx);
    register_postgres(&mut registry).await?;

    let providers = registry
        .resolve(&config.providers)
        .context("Resolving providers")?;
    let definitions_dir = config.definitions_dir.clone();
    let engine = Engine::start(config, Arc::new(MemoryRepository::new()), providers, inbound_rx)?;

    if let Some(dir) = definitions_dir {
        deploy_dir(&engine, &dir).await?;
    } else {
        tracing::warn!("no definitions_dir configured; nothing deployed");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run_timer_poller(shutdown_rx).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Waiting for ctrl-c")?;
    tracing::info!("shutdown requested");
    // Receiver may already be gone if the poller exited.
    let _ = shutdown_tx.send(true);
    if let Err(e) = poller.await {
        tracing::warn!(error = %e, "timer poller task failed");
    }
    engine.shutdown().await;
    Ok(())
}

fn load_config() -> Result<EngineConfig> {
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
    match path {
        Some(path) => {
            let config = EngineConfig::load_from_file(&path)?;
            tracing::info!(path = %path.display(), "config loaded");
            Ok(config)
        }
        None => {
            tracing::info!("no config given, using defaults");
            Ok(EngineConfig::default())
        }
    }
}

async fn deploy_dir(engine: &Engine, dir: &Path) -> Result<()> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Reading {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "yaml" || ext == "yml"))
        .collect();
    paths.sort();

    for path in paths {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Reading {}", path.display()))?;
        let definition = ProcessDefinition::from_yaml(&content)
            .with_context(|| format!("Parsing {}", path.display()))?;
        let deployed = engine
            .deploy(&definition)
            .await
            .with_context(|| format!("Deploying {}", path.display()))?;
        tracing::info!(
            path = %path.display(),
            process_id = %deployed.process_id,
            version = deployed.version,
            "definition deployed"
        );
    }
    Ok(())
}

#[cfg(feature = "postgres")]
async fn register_postgres(registry: &mut ProviderRegistry) -> Result<()> {
    use bpmn_actor_core::store_postgres::{ensure_schema, PgDataObjects, PgTimerStore};
    use sqlx::postgres::PgPoolOptions;

    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        tracing::info!("DATABASE_URL not set; postgres providers not registered");
        return Ok(());
    };
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .context("Connecting to database")?;
    ensure_schema(&pool).await?;
    tracing::info!("Connected to database");

    registry
        .register_timer_store("postgres", Arc::new(PgTimerStore::new(pool.clone())))
        .register_data_objects("postgres", Arc::new(PgDataObjects::new(pool)));
    Ok(())
}

#[cfg(not(feature = "postgres"))]
async fn register_postgres(_registry: &mut ProviderRegistry) -> Result<()> {
    Ok(())
}
