use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use veil_common::config::{AdminDbConfig, Config, Secrets};
use veil_core::store::{AdminStore, MemoryStore, YamlStore};
use veil_core::QueryEngine;
use veil_server::{create_router, seed};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path =
        std::env::var("VEIL_CONFIG").unwrap_or_else(|_| "config/veil.yaml".to_string());
    let config = Config::from_file(&config_path)
        .with_context(|| format!("loading configuration from {config_path}"))?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.server.log_level.clone()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let secrets = match std::env::var("VEIL_SECRETS") {
        Ok(path) => Secrets::from_file(&path).with_context(|| format!("loading secrets from {path}"))?,
        Err(_) => Secrets::default(),
    };

    let store: Arc<dyn AdminStore> = match &config.admin_database {
        AdminDbConfig::Yaml { db_file } => Arc::new(
            YamlStore::open(db_file)
                .await
                .with_context(|| format!("opening admin store at {db_file}"))?,
        ),
        AdminDbConfig::InMemory => Arc::new(MemoryStore::new()),
    };

    let engine = QueryEngine::from_config(&config, secrets, store);
    if config.develop_mode {
        seed::seed_demo(&engine)
            .await
            .context("seeding develop-mode demo data")?;
    }

    let addr = format!("{}:{}", config.server.host_ip, config.server.host_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(addr = %addr, "veil server listening");

    axum::serve(listener, create_router(engine))
        .await
        .context("server terminated")?;
    Ok(())
}
