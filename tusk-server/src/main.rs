//! tusk maintenance binary

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tusk_core::{tus, Environment, UploadConfig, UploadId, UploadInfo};
use tusk_engine::UploadStore;
use tusk_server::{CleanupConfig, CleanupDaemon, SidecarRepository, UploadRepository};

#[derive(Parser)]
#[command(name = "tusk", version, about = "Resumable upload storage maintenance")]
struct Cli {
    /// JSON configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Upload working directory, overrides the environment default
    #[arg(long, value_name = "PATH")]
    base_dir: Option<PathBuf>,

    /// development or production
    #[arg(long, value_name = "ENV")]
    environment: Option<Environment>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the cleanup daemon until interrupted
    Daemon,
    /// Run a single cleanup cycle and print its report
    Sweep,
    /// List in-progress uploads
    List,
    /// Show one upload
    Status { id: String },
    /// Print the protocol capability headers for this configuration
    Capabilities,
}

#[derive(Serialize)]
struct StatusView {
    #[serde(flatten)]
    info: UploadInfo,
    progress: f64,
    remaining: u64,
    complete: bool,
    headers: BTreeMap<&'static str, String>,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<UploadConfig> {
    let mut config = match &cli.config {
        Some(path) => UploadConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => UploadConfig::default(),
    };

    if let Some(base_dir) = &cli.base_dir {
        config.base_dir = Some(base_dir.clone());
    }
    if let Some(environment) = cli.environment {
        config.environment = environment;
    }

    Ok(config)
}

fn daemon_for(store: &UploadStore, config: &UploadConfig) -> CleanupDaemon {
    let repositories: Vec<Arc<dyn UploadRepository>> =
        vec![Arc::new(SidecarRepository::new(store.clone()))];
    CleanupDaemon::new(store.clone(), repositories, CleanupConfig::from(config))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = load_config(&cli)?;
    let store = UploadStore::open(&config).context("Failed to open upload store")?;
    info!("Upload directory: {}", store.resolver().base().display());

    match &cli.command {
        Command::Daemon => {
            let daemon = daemon_for(&store, &config);
            daemon.start();
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;
            info!("Shutdown requested");
            daemon.stop().await;
        }
        Command::Sweep => {
            let report = daemon_for(&store, &config).run_cycle().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::List => {
            let uploads = store.list_uploads()?;
            println!("{}", serde_json::to_string_pretty(&uploads)?);
        }
        Command::Status { id } => {
            let id = UploadId::new(id)?;
            let info = store.get_info(&id)?;
            let view = StatusView {
                progress: info.progress(),
                remaining: info.remaining(),
                complete: info.is_complete(),
                headers: tus::status_headers(&info).into_iter().collect(),
                info,
            };
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Command::Capabilities => {
            let headers: BTreeMap<_, _> = tus::capability_headers(store.max_file_size())
                .into_iter()
                .collect();
            println!("{}", serde_json::to_string_pretty(&headers)?);
        }
    }

    Ok(())
}
