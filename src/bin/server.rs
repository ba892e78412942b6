// OpsFlow control-plane server
// Run with: cargo run --bin server

//! Starts the orchestrator and serves the REST control API. Storage is a
//! JSON snapshot when `OPSFLOW_STORAGE_PATH` (or the config file) names a
//! path, otherwise in-memory. Workflow bodies default to no-ops; real
//! deployments register their implementations before `start()`.

use std::sync::Arc;

use dotenv::dotenv;
use tracing::info;
use tracing_subscriber::EnvFilter;

use opsflow::{
    BodyRegistry, ControlServerBuilder, FileStorage, InMemoryStorage, Orchestrator,
    OrchestratorConfig, OrchestratorStorage,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = OrchestratorConfig::load()?;
    let storage: Arc<dyn OrchestratorStorage> = match &config.storage_path {
        Some(path) => {
            info!(path = %path, "using file-backed storage");
            Arc::new(FileStorage::open(path).await?)
        }
        None => {
            info!("using in-memory storage");
            Arc::new(InMemoryStorage::default())
        }
    };

    let registry = Arc::new(BodyRegistry::new());
    let orchestrator = Orchestrator::new(config, storage, registry);
    orchestrator.initialize_defaults().await?;
    orchestrator.start();

    ControlServerBuilder::new(orchestrator).serve().await?;
    Ok(())
}
