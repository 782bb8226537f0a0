pub mod api;
pub mod backup;
pub mod error;
pub mod host;
pub mod hydrator;
pub mod sessions;
pub mod settings;
pub mod supervisor;

pub use error::{WardenError, WardenResult};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::RwLock;
use tracing::{info, warn};

use ward_types::gateway_config::GatewayConfig;
use ward_types::process::GatewayProcess;
use ward_types::settings::WardenSettings;

use backup::{BackupSync, LocalState, MountedBackupStore, RestoreOutcome};
use host::{OsProcessHost, ProcessHost};
use hydrator::{HydrationEnv, HydrationReport};
use sessions::{CliSessionSource, SessionSource, SessionStore};
use supervisor::{Supervisor, SupervisorOptions};

/// Everything one sandbox needs: the supervisor, the session view, backup
/// sync and the last hydrated gateway config. The control API holds an
/// `Arc<Warden>`.
pub struct Warden {
    settings: WardenSettings,
    config: RwLock<GatewayConfig>,
    supervisor: Arc<Supervisor>,
    sessions: SessionStore<Arc<dyn SessionSource>>,
    backup: Option<Arc<BackupSync<MountedBackupStore>>>,
}

impl Warden {
    /// Wire up the real OS process host and gateway CLI.
    pub fn new(settings: WardenSettings) -> Self {
        let host: Arc<dyn ProcessHost> = Arc::new(OsProcessHost::new());
        let supervisor = Arc::new(Supervisor::new(
            host,
            settings.gateway.clone(),
            SupervisorOptions::from(&settings),
        ));
        let sessions: Arc<dyn SessionSource> = Arc::new(CliSessionSource::new(
            settings.gateway.binary.clone(),
            Duration::from_secs(settings.supervisor.cli_timeout_secs),
        ));
        let backup = settings.backup.enabled.then(|| {
            Arc::new(BackupSync::new(
                MountedBackupStore::new(&settings.backup.mount_path),
                LocalState::from_settings(&settings),
            ))
        });
        Self::with_parts(settings, supervisor, sessions, backup)
    }

    pub fn with_parts(
        settings: WardenSettings,
        supervisor: Arc<Supervisor>,
        sessions: Arc<dyn SessionSource>,
        backup: Option<Arc<BackupSync<MountedBackupStore>>>,
    ) -> Self {
        Self {
            settings,
            config: RwLock::new(GatewayConfig::default()),
            supervisor,
            sessions: SessionStore::new(sessions),
            backup,
        }
    }

    pub fn settings(&self) -> &WardenSettings {
        &self.settings
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn sessions(&self) -> &SessionStore<Arc<dyn SessionSource>> {
        &self.sessions
    }

    pub fn backup(&self) -> Option<&Arc<BackupSync<MountedBackupStore>>> {
        self.backup.as_ref()
    }

    /// Snapshot of the gateway config currently in effect.
    pub async fn config(&self) -> GatewayConfig {
        self.config.read().await.clone()
    }

    pub async fn set_config(&self, config: GatewayConfig) {
        *self.config.write().await = config;
    }

    fn config_path(&self) -> PathBuf {
        PathBuf::from(&self.settings.gateway.config_path)
    }

    /// Read the persisted gateway config without rewriting it.
    pub async fn load_config(&self) -> Result<GatewayConfig> {
        let path = self.config_path();
        let config = match tokio::fs::read_to_string(&path).await {
            Ok(text) => hydrator::parse_persisted(&text).0,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => GatewayConfig::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };
        self.set_config(config.clone()).await;
        Ok(config)
    }

    /// Hydrate the gateway config file from the environment.
    pub async fn hydrate(&self, env: HydrationEnv) -> Result<HydrationReport> {
        let path = self.config_path();
        let settings = self.settings.clone();
        let (config, report) =
            tokio::task::spawn_blocking(move || hydrator::hydrate_file(&path, &env, &settings))
                .await
                .context("Hydration task failed")??;
        if !report.dropped_providers.is_empty() {
            warn!("Dropped invalid providers: {}", report.dropped_providers.join(", "));
        }
        self.set_config(config).await;
        Ok(report)
    }

    /// Restore from backup if it is newer. Failures are logged; a sandbox
    /// with a broken backup mount still boots from local state.
    pub async fn restore(&self) -> Option<RestoreOutcome> {
        let backup = self.backup.as_ref()?;
        match backup.restore_if_newer().await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!("Backup restore failed, continuing with local state: {e:#}");
                None
            }
        }
    }

    /// Boot sequence: restore, hydrate, then make sure the gateway is up.
    pub async fn boot(&self, env: HydrationEnv) -> WardenResult<GatewayProcess> {
        self.restore().await;
        let report = self.hydrate(env).await?;
        info!(
            "Booting gateway with provider rule {} (primary: {})",
            report.rule, report.primary_model
        );
        let config = self.config().await;
        self.supervisor.ensure_running(&config).await
    }
}
