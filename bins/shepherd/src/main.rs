//! Shepherd daemon: supervises registered applications until interrupted,
//! re-attaching to processes left behind by a previous run.

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use shepherd_metrics::SysinfoProbe;
use shepherd_store::{JsonConfigStore, JsonRuntimeStore};
use shepherd_supervise::{AppDefinition, OsTransport, ProcessManager, SupervisorOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shepherd", about = "Process supervisor daemon", version)]
struct Args {
    /// Directory for stores and per-application storage.
    #[arg(long, default_value = "/var/lib/shepherd")]
    data_dir: PathBuf,

    /// YAML file with application definitions to register at boot.
    #[arg(long)]
    apps: Option<PathBuf>,

    /// Log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log: String,
}

#[derive(Deserialize)]
struct AppsFile {
    apps: Vec<AppDefinition>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log)),
        )
        .init();

    tokio::fs::create_dir_all(&args.data_dir)
        .await
        .with_context(|| format!("creating data dir {}", args.data_dir.display()))?;

    let manager = ProcessManager::new(
        SupervisorOptions::new(args.data_dir.join("apps")),
        Arc::new(JsonConfigStore::new(args.data_dir.join("apps.json"))),
        Arc::new(JsonRuntimeStore::new(args.data_dir.join("runtime.json"))),
        Arc::new(OsTransport::new()),
        Arc::new(SysinfoProbe::new()),
    )
    .await
    .context("building the process manager")?;

    if let Some(path) = &args.apps {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let file: AppsFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        for definition in file.apps {
            match manager.register(definition).await {
                Ok(config) => info!(app = %config.name, id = config.id, "registered"),
                Err(err) => warn!(error = %err, "skipping application definition"),
            }
        }
    }

    manager.initialize().await.context("initializing")?;
    for entry in manager.list().await.context("listing applications")? {
        info!(app = %entry.name, state = %entry.state, "application");
    }
    info!("shepherd is up, press ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down, supervised applications keep running");
    manager.uninitialize().await.context("uninitializing")?;
    Ok(())
}
