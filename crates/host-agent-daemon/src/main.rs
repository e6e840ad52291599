//! host-agent daemon.
//!
//! Serves the authenticated request/response API and the WebSocket push
//! channel on separate listeners.
//!
//! Run with: cargo run -p host-agent-daemon -- --config agent.toml

mod config;

use std::{net::SocketAddr, path::Path, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use host_agent_core::{CredentialStore, EventHub, LogBuffer, LogBufferLayer, traits::AppCatalog};
use host_agent_executor::{
    BytePatchExecutor, CommandExecutor, CommandTemplate, CompileLoadExecutor, MutationExecutors,
    mutation::{DEFAULT_ARTIFACT_FILE, DEFAULT_SOURCE_FILE},
};
use host_agent_state::{
    CatalogCapture, CommandAppCatalog, CommandCapture, HostProperties, MutationOrchestrator,
    PropertiesCapture, SnapshotStore, storage::FsSnapshotStorage,
};
use host_agent_transport::{AgentState, SystemProbe, api_router, spawn_heartbeat, ws_router};
use tokio::{net::TcpListener, sync::watch};
use tower_http::cors::CorsLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, LanguageConfig};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Host control-plane agent
#[derive(Parser, Debug)]
#[command(name = "host-agent")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "HOST_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Address for the request/response API
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Address for the WebSocket push channel
    #[arg(long)]
    ws_bind: Option<SocketAddr>,

    /// Directory for snapshots and mutation work files
    #[arg(long, env = "HOST_AGENT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Accept this bearer token in addition to configured ones
    #[arg(long, env = "HOST_AGENT_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

impl Args {
    /// Command-line values take precedence over the file.
    fn apply(self, config: &mut Config) {
        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }
        if let Some(ws_bind) = self.ws_bind {
            config.server.ws_bind = ws_bind;
        }
        if let Some(data_dir) = self.data_dir {
            config.snapshots.data_dir = Some(data_dir);
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if let Some(token) = self.token.filter(|t| !t.trim().is_empty()) {
            config.auth.tokens.push(token);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref()).context("failed to load configuration")?;
    args.apply(&mut config);

    let logs = Arc::new(LogBuffer::new(config.logging.buffer_lines));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(LogBufferLayer::new(Arc::clone(&logs)))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

    let state = build_state(&config, &data_dir, logs)?;

    for token in &config.auth.tokens {
        state.credentials.insert(token.clone());
    }
    if config.auth.tokens.is_empty() {
        let issued = state.credentials.issue();
        tracing::info!(token = %issued.token, "issued access token");
    }

    match state.snapshots.create("service_start").await {
        Ok(id) => tracing::info!(snapshot_id = %id, "startup snapshot created"),
        Err(e) => tracing::warn!(error = %e, "startup snapshot failed"),
    }

    let api_listener = TcpListener::bind(config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    let ws_listener = TcpListener::bind(config.server.ws_bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.ws_bind))?;

    let heartbeat = config.monitor.heartbeat().map(|interval| {
        spawn_heartbeat(Arc::clone(&state.system), Arc::clone(&state.events), interval)
    });

    let mut api = api_router(state.clone());
    if config.server.cors {
        api = api.layer(CorsLayer::permissive());
    }
    let ws = ws_router(state);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    tracing::info!(
        api = %config.server.bind,
        ws = %config.server.ws_bind,
        data_dir = %data_dir.display(),
        version = AGENT_VERSION,
        "host agent listening"
    );

    let api_server = axum::serve(api_listener, api).with_graceful_shutdown(stopped(shutdown_rx.clone()));
    let ws_server = axum::serve(ws_listener, ws).with_graceful_shutdown(stopped(shutdown_rx));
    let served = tokio::try_join!(
        async { api_server.await.context("API server failed") },
        async { ws_server.await.context("push channel server failed") },
    );

    if let Some(task) = heartbeat {
        task.abort();
    }
    served?;
    tracing::info!("host agent stopped");
    Ok(())
}

/// Construct every store and service from configuration.
fn build_state(config: &Config, data_dir: &Path, logs: Arc<LogBuffer>) -> Result<AgentState> {
    let events = Arc::new(EventHub::new());
    let executor = CommandExecutor::new(config.executor.to_executor_config())
        .with_events(Arc::clone(&events));
    let hook_timeout = config.executor.default_timeout();

    let mut catalog = CommandAppCatalog::new(executor.clone(), hook_timeout);
    if let Some(list) = &config.apps.list {
        catalog = catalog.with_list(list.clone());
    }
    if let Some(modify) = &config.apps.modify {
        catalog = catalog.with_modify(CommandTemplate::new(modify.clone()));
    }
    let catalog: Arc<dyn AppCatalog> = Arc::new(catalog);

    let properties = Arc::new(HostProperties::detect(AGENT_VERSION));
    let storage = FsSnapshotStorage::open(data_dir.join("snapshots"))
        .context("failed to open snapshot storage")?;

    let mut snapshots = SnapshotStore::new(Arc::new(storage)).with_events(Arc::clone(&events));
    if config.snapshots.properties {
        snapshots = snapshots.with_capture(Arc::new(PropertiesCapture::new(Arc::clone(&properties))));
    }
    if config.snapshots.packages {
        snapshots = snapshots.with_capture(Arc::new(CatalogCapture::new(Arc::clone(&catalog))));
    }
    for capture in &config.snapshots.captures {
        snapshots = snapshots.with_capture(Arc::new(CommandCapture::new(
            capture.name.clone(),
            capture.command.clone(),
            executor.clone(),
            hook_timeout,
        )));
    }
    let snapshots = Arc::new(snapshots);

    let mut executors = MutationExecutors::new();
    for (language, definition) in &config.mutation.languages {
        match definition {
            LanguageConfig::CompileLoad {
                compile,
                load,
                source_file,
                artifact_file,
            } => {
                let mut compile_load = CompileLoadExecutor::new(
                    executor.clone(),
                    data_dir,
                    CommandTemplate::new(compile.clone()),
                    hook_timeout,
                )
                .with_file_names(
                    source_file.as_deref().unwrap_or(DEFAULT_SOURCE_FILE),
                    artifact_file.as_deref().unwrap_or(DEFAULT_ARTIFACT_FILE),
                );
                if let Some(load) = load {
                    compile_load = compile_load.with_load(CommandTemplate::new(load.clone()));
                }
                executors.register(language.clone(), Arc::new(compile_load));
            }
            LanguageConfig::BytePatch { patch } => executors.register(
                language.clone(),
                Arc::new(BytePatchExecutor::new(
                    executor.clone(),
                    data_dir,
                    CommandTemplate::new(patch.clone()),
                    hook_timeout,
                )),
            ),
        }
    }
    if executors.is_empty() {
        tracing::warn!("no mutation languages configured; apply-mutation will be rejected");
    } else {
        tracing::info!(languages = ?executors.languages(), "mutation executors registered");
    }

    let orchestrator = Arc::new(
        MutationOrchestrator::new(Arc::clone(&snapshots), executors, Arc::clone(&catalog))
            .with_events(Arc::clone(&events)),
    );

    Ok(AgentState {
        credentials: Arc::new(CredentialStore::new()),
        executor,
        snapshots,
        orchestrator,
        catalog,
        system: Arc::new(SystemProbe::new(properties, AGENT_VERSION)),
        events,
        logs,
        max_timeout: config.executor.max_timeout(),
    })
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to register SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received Ctrl-C"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}
