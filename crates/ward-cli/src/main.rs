use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use ward_supervisor::backup::RestoreOutcome;
use ward_supervisor::hydrator::HydrationEnv;
use ward_supervisor::sessions::DEFAULT_HISTORY_LIMIT;
use ward_supervisor::Warden;
use ward_types::control::{HistoryResponse, SessionsResponse};

#[derive(Parser)]
#[command(name = "warden", version, about = "Warden: keeps the sandbox gateway alive")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Restore, hydrate, start the gateway and serve the control API
    Boot,
    /// Show gateway process status
    Status,
    /// Restart the gateway (waits for it to come back)
    Restart {
        #[arg(long)]
        token: String,
    },
    /// Rewrite the gateway config from the environment
    Hydrate,
    /// List gateway sessions
    Sessions {
        /// Only sessions active in the last N minutes
        #[arg(long)]
        active: Option<u32>,
    },
    /// Show the tail of a session transcript
    History {
        key: String,
        #[arg(long, default_value_t = DEFAULT_HISTORY_LIMIT)]
        limit: usize,
    },
    /// Backup store operations
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },
}

#[derive(Subcommand)]
enum BackupAction {
    /// Pull from the store if it is newer than local state
    Restore,
    /// Push local state to the store now
    Push,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = ward_supervisor::settings::load_settings()?;
    let warden = Arc::new(Warden::new(settings));

    match cli.command {
        Commands::Boot => boot(warden).await,
        Commands::Status => {
            let report = warden.supervisor().status().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Restart { token } => {
            let config = warden.load_config().await?;
            let process = warden.supervisor().restart(&config, Some(&token)).await?;
            println!("Gateway restarted (pid: {})", process.pid);
            Ok(())
        }
        Commands::Hydrate => {
            let report = warden.hydrate(HydrationEnv::from_env()).await?;
            println!("Provider rule: {}", report.rule);
            println!("Primary model: {}", report.primary_model);
            if report.reset_document {
                println!("Existing config was unreadable and has been replaced");
            }
            for name in &report.dropped_providers {
                println!("Dropped invalid provider: {name}");
            }
            Ok(())
        }
        Commands::Sessions { active } => {
            let listing = warden.sessions().list_sessions(active).await?;
            let response = SessionsResponse {
                count: listing.sessions.len(),
                sessions: listing.sessions,
                raw: listing.raw,
            };
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Commands::History { key, limit } => {
            let messages = warden.sessions().get_history(&key, limit).await?;
            println!("{}", serde_json::to_string_pretty(&HistoryResponse { messages })?);
            Ok(())
        }
        Commands::Backup { action } => {
            let backup = warden
                .backup()
                .context("Backup is disabled in warden settings")?;
            match action {
                BackupAction::Restore => match backup.restore_if_newer().await? {
                    RestoreOutcome::Restored { remote, files } => {
                        println!("Restored {files} files from backup taken at {remote}");
                    }
                    RestoreOutcome::UpToDate { remote, .. } => {
                        println!("Local state is current (backup from {remote})");
                    }
                    RestoreOutcome::NoBackup => println!("No backup found"),
                },
                BackupAction::Push => match backup.push_now().await? {
                    Some(at) => println!("Backup pushed at {at}"),
                    None => println!("Nothing to push: no local config"),
                },
            }
            Ok(())
        }
    }
}

/// Long-running mode. A failed gateway start is logged, not fatal: the
/// control API stays up so callers can see the status and retry a restart.
async fn boot(warden: Arc<Warden>) -> Result<()> {
    match warden.boot(HydrationEnv::from_env()).await {
        Ok(process) => info!("Gateway running (pid: {}, port: {})", process.pid, process.port),
        Err(e) => error!("Gateway failed to start: {e}"),
    }

    if let Some(backup) = warden.backup() {
        let every = Duration::from_secs(warden.settings().backup.sync_interval_secs.max(1));
        backup.clone().spawn_periodic(every);
        info!("Periodic backup every {}s", every.as_secs());
    }

    let listen = warden.settings().api.listen.clone();
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind control API on {listen}"))?;
    info!("Control API listening on {listen}");

    axum::serve(listener, ward_supervisor::api::router(warden))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .context("Control API server failed")
}
