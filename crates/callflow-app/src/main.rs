//! Callflow application binary - composition root.
//!
//! 1. Load configuration from TOML, with CLI overrides
//! 2. Open the SQLite store
//! 3. Wire the engine (scheduler, call tracker, campaign service)
//! 4. Start the scheduler and session maintenance loops
//! 5. Serve webhooks and management routes until Ctrl-C

mod cli;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use callflow_api::auth::load_or_generate_token;
use callflow_api::state::AppState;
use callflow_core::types::ScriptDefinition;
use callflow_core::{CallflowConfig, SystemClock};
use callflow_engine::{Collaborators, ScriptGraph};
use callflow_storage::{Database, SqliteStore};

use cli::{CliArgs, Command};

/// Expand ~ to the home directory in a path string.
fn resolve_data_dir(data_dir: &str) -> PathBuf {
    if let Some(rest) = data_dir.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(rest)
    } else {
        PathBuf::from(data_dir)
    }
}

/// Validate a script file and report the outcome on stdout.
fn validate_script(path: &std::path::Path) -> Result<bool, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)?;
    let script: ScriptDefinition = serde_json::from_str(&content)?;
    match ScriptGraph::build(&script) {
        Ok(graph) => {
            println!("{}: valid ({} nodes)", path.display(), graph.nodes().len());
            Ok(true)
        }
        Err(e) => {
            println!("{}: invalid: {}", path.display(), e);
            Ok(false)
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    let config_file = args.resolve_config_path();
    let mut config = CallflowConfig::load_or_default(&config_file);
    if let Some(level) = &args.log_level {
        config.general.log_level = level.clone();
    }

    // Tracing: RUST_LOG wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_level)),
        )
        .init();

    if let Command::ValidateScript { file } = args.command() {
        if !validate_script(file)? {
            std::process::exit(1);
        }
        return Ok(());
    }

    tracing::info!("Starting Callflow v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(path = %config_file.display(), "Configuration resolved");

    config.general.port = args.resolve_port(config.general.port);
    if let Some(dir) = args.resolve_data_dir() {
        config.general.data_dir = dir;
    }
    config.validate()?;

    // Storage.
    let data_dir = resolve_data_dir(&config.general.data_dir);
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
        return Err(e.into());
    }
    let db_path = data_dir.join("callflow.db");
    let store = Arc::new(SqliteStore::new(Arc::new(Database::new(&db_path)?)));

    // Engine.
    let mut state = AppState::new(
        config.clone(),
        store,
        Collaborators::offline(),
        Arc::new(SystemClock),
    )?;
    state.api_token = load_or_generate_token(&data_dir.join("api_token"));
    tracing::info!(
        telephony = "dry-run",
        public_base_url = %config.general.public_base_url,
        "Engine ready"
    );

    // Background loops.
    let scheduler = Arc::clone(&state.scheduler);
    let scheduler_task = tokio::spawn(async move { scheduler.run().await });
    let tracker = Arc::clone(&state.tracker);
    let maintenance_task = tokio::spawn(async move { tracker.run_maintenance().await });

    let scheduler = Arc::clone(&state.scheduler);
    let tracker = Arc::clone(&state.tracker);

    // Serve until Ctrl-C, then stop the loops.
    let served = callflow_api::start_server(&config, state, shutdown_signal()).await;

    scheduler.shutdown();
    tracker.shutdown();
    let _ = tokio::join!(scheduler_task, maintenance_task);

    if let Err(e) = served {
        tracing::error!(error = %e, "API server stopped with an error");
        return Err(e.into());
    }
    tracing::info!("Callflow stopped");
    Ok(())
}
