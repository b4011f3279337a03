//! Main daemon command - starts the agent and serves the RPC surface

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{info, warn};

use capsule_daemon::agent::{Agent, RuntimeFactory};
use capsule_daemon::capability::CapabilityStore;
use capsule_daemon::config::Configuration;
use capsule_daemon::events::EventBus;
use capsule_daemon::process::ExitNotifier;
use capsule_daemon::router::{self, AppState};
use capsule_daemon::runtime::LinuxRuntime;

/// Run the daemon
pub async fn run(config_path: &str) -> Result<()> {
    info!("Loading configuration from: {}", config_path);
    let config = Configuration::load(config_path)?;
    let config = Arc::new(config);

    info!("Configuration loaded");
    info!("  API: {}:{}", config.api.host, config.api.port);
    info!(
        "  Shared mounts dir: {}",
        config.agent.shared_mounts_dir.display()
    );

    // Capability stores
    let capability_store = CapabilityStore::from_dir(&config.agent.service_manifest_dir)
        .context("Failed to load service manifests")?;
    let default_store = CapabilityStore::from_dir(&config.agent.default_service_manifest_dir)
        .context("Failed to load default service manifests")?;

    // Process-exit notifier
    let notifier = ExitNotifier::new();

    // Runtime factory: one Linux runtime driver per container
    let defaults = config.capsule_defaults()?;
    let factory_config = config.clone();
    let factory: RuntimeFactory = Box::new(move |name, capsule_config| {
        Arc::new(LinuxRuntime::new(
            name,
            &capsule_config.shared_mounts_dir,
            capsule_config.runtime_config_path.clone(),
            factory_config.agent.cgroup_root.clone(),
            capsule_config.network.as_ref().map(|n| n.bridge_device.clone()),
        ))
    });

    let events = EventBus::new();
    let agent = Agent::new(
        defaults,
        capability_store,
        default_store,
        notifier.clone(),
        events.clone(),
        factory,
    );
    let agent = Arc::new(Mutex::new(agent));

    // Build the HTTP router
    let state = AppState {
        agent: agent.clone(),
        events,
        config: config.clone(),
    };
    let app = router::build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port)
        .parse()
        .context("Invalid API address")?;

    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Could not bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Reap every container before exiting; undo stacks are walked here
    info!("Shutting down");
    agent.lock().await.shutdown_all().await;
    notifier.shutdown();

    Ok(())
}

/// Resolves when SIGINT or SIGTERM arrives
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("Could not install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
}
