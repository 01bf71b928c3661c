//! All-in-one server: coordinator plus the four agents in one process.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use cascade::agents::{spawn_agent, Agent, Carrier, Clerk, Conductor, Transformer};
use cascade::events::Coordinator;
use cascade::store::{EntityStore, MemoryStore, SledStore};
use cascade::work::{register_generic_work, ScriptedBackend};
use cascade::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::from_yaml_file(&path)?,
        None => ServerConfig::default(),
    };

    let store: Arc<dyn EntityStore> = match &config.db_path {
        Some(path) => {
            info!(path = %path.display(), "opening sled store");
            Arc::new(SledStore::open(path)?)
        }
        None => {
            info!("using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    // Scripted back-end that walks jobs Pending -> Running -> Finished on
    // successive polls; swap in a real ExecutionBackend for production use.
    register_generic_work(Arc::new(ScriptedBackend::new(true)));

    let coordinator = Arc::new(Coordinator::new(store.clone(), config.coordinator.clone()));
    let bus = coordinator.handle();

    let clerk = Arc::new(Clerk::new(store.clone(), bus.clone(), config.clerk.clone()));
    let transformer =
        Arc::new(Transformer::new(store.clone(), bus.clone(), config.transformer.clone()));
    let carrier = Arc::new(Carrier::new(store.clone(), bus.clone(), config.carrier.clone()));
    let conductor =
        Arc::new(Conductor::new(store.clone(), bus.clone(), config.conductor.clone()));

    let mut handles = vec![coordinator.clone().spawn()];
    handles.extend(spawn_agent(clerk.clone() as Arc<dyn cascade::Agent>));
    handles.extend(spawn_agent(transformer.clone() as Arc<dyn cascade::Agent>));
    handles.extend(spawn_agent(carrier.clone() as Arc<dyn cascade::Agent>));
    handles.extend(spawn_agent(conductor.clone() as Arc<dyn cascade::Agent>));
    info!("cascade server started");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    coordinator.stop();
    clerk.core().stop();
    transformer.core().stop();
    carrier.core().stop();
    conductor.core().stop();
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}
