//! Backup sync between the sandbox filesystem and the remote store.
//!
//! Restores run before the gateway starts and only when the remote sync
//! marker is strictly newer than the local one. Pushes run periodically and
//! stamp both markers with the same time.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use ward_types::settings::WardenSettings;

/// Name of the sync marker file, both locally and in the store.
pub const MARKER_FILE: &str = ".last-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKind {
    Config,
    Workspace,
}

impl TreeKind {
    fn dir_name(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Workspace => "workspace",
        }
    }
}

#[async_trait]
pub trait BackupStore: Send + Sync {
    async fn read_marker(&self) -> Result<Option<DateTime<Utc>>>;
    async fn write_marker(&self, at: DateTime<Utc>) -> Result<()>;
    /// Copy a stored tree into `dest`. Returns the number of files copied.
    async fn pull_tree(&self, kind: TreeKind, dest: &Path) -> Result<u64>;
    /// Copy `src` into the stored tree. Returns the number of files copied.
    async fn push_tree(&self, kind: TreeKind, src: &Path) -> Result<u64>;
}

/// A store whose bucket is mounted as a local directory:
/// `<root>/config`, `<root>/workspace`, `<root>/.last-sync`.
pub struct MountedBackupStore {
    root: PathBuf,
}

impl MountedBackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn is_mounted(&self) -> bool {
        self.root.is_dir()
    }
}

#[async_trait]
impl BackupStore for MountedBackupStore {
    async fn read_marker(&self) -> Result<Option<DateTime<Utc>>> {
        read_marker_file(&self.root.join(MARKER_FILE)).await
    }

    async fn write_marker(&self, at: DateTime<Utc>) -> Result<()> {
        write_marker_file(&self.root.join(MARKER_FILE), at).await
    }

    async fn pull_tree(&self, kind: TreeKind, dest: &Path) -> Result<u64> {
        let src = self.root.join(kind.dir_name());
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || copy_tree(&src, &dest))
            .await
            .context("Backup pull task failed")?
    }

    async fn push_tree(&self, kind: TreeKind, src: &Path) -> Result<u64> {
        let dest = self.root.join(kind.dir_name());
        let src = src.to_path_buf();
        tokio::task::spawn_blocking(move || copy_tree(&src, &dest))
            .await
            .context("Backup push task failed")?
    }
}

/// Where the sandbox keeps the state that gets backed up.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalState {
    pub config_dir: PathBuf,
    pub workspace_dir: PathBuf,
}

impl LocalState {
    pub fn from_settings(settings: &WardenSettings) -> Self {
        let config_path = PathBuf::from(&settings.gateway.config_path);
        let config_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            config_dir,
            workspace_dir: PathBuf::from(&settings.gateway.workspace),
        }
    }

    fn marker_path(&self) -> PathBuf {
        self.config_dir.join(MARKER_FILE)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RestoreOutcome {
    Restored { remote: DateTime<Utc>, files: u64 },
    UpToDate {
        local: Option<DateTime<Utc>>,
        remote: DateTime<Utc>,
    },
    NoBackup,
}

/// Restore only when the remote marker is strictly newer than the local one,
/// or when there is no local marker.
pub fn should_restore(local: Option<DateTime<Utc>>, remote: Option<DateTime<Utc>>) -> bool {
    match (local, remote) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(l), Some(r)) => r > l,
    }
}

pub struct BackupSync<B> {
    store: B,
    local: LocalState,
}

impl<B: BackupStore + 'static> BackupSync<B> {
    pub fn new(store: B, local: LocalState) -> Self {
        Self { store, local }
    }

    pub async fn local_marker(&self) -> Result<Option<DateTime<Utc>>> {
        read_marker_file(&self.local.marker_path()).await
    }

    pub async fn restore_if_newer(&self) -> Result<RestoreOutcome> {
        let remote = self.store.read_marker().await?;
        let local = self.local_marker().await?;

        let Some(remote_at) = remote else {
            info!("No backup marker in store, nothing to restore");
            return Ok(RestoreOutcome::NoBackup);
        };
        if !should_restore(local, remote) {
            info!(
                "Local state is current (local: {local:?}, backup: {remote_at}), skipping restore"
            );
            return Ok(RestoreOutcome::UpToDate {
                local,
                remote: remote_at,
            });
        }

        info!("Restoring from backup taken at {remote_at}");
        let mut files = self
            .store
            .pull_tree(TreeKind::Config, &self.local.config_dir)
            .await
            .context("Failed to restore config tree")?;
        files += self
            .store
            .pull_tree(TreeKind::Workspace, &self.local.workspace_dir)
            .await
            .context("Failed to restore workspace tree")?;
        write_marker_file(&self.local.marker_path(), remote_at).await?;

        info!("Restored {files} files from backup");
        Ok(RestoreOutcome::Restored {
            remote: remote_at,
            files,
        })
    }

    /// Push local state to the store. Refuses when there is no local config,
    /// so an empty sandbox never overwrites a good backup.
    pub async fn push_now(&self) -> Result<Option<DateTime<Utc>>> {
        if !dir_has_files(&self.local.config_dir).await {
            warn!(
                "No local config in {}, refusing to push an empty backup",
                self.local.config_dir.display()
            );
            return Ok(None);
        }

        let mut files = self
            .store
            .push_tree(TreeKind::Config, &self.local.config_dir)
            .await
            .context("Failed to back up config tree")?;
        if self.local.workspace_dir.is_dir() {
            files += self
                .store
                .push_tree(TreeKind::Workspace, &self.local.workspace_dir)
                .await
                .context("Failed to back up workspace tree")?;
        }

        let now = Utc::now();
        self.store.write_marker(now).await?;
        write_marker_file(&self.local.marker_path(), now).await?;
        debug!("Backed up {files} files at {now}");
        Ok(Some(now))
    }

    /// Push on a fixed interval until the task is dropped.
    pub fn spawn_periodic(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately; the boot sequence has
            // just restored, so skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match self.push_now().await {
                    Ok(Some(at)) => info!("Backup pushed at {at}"),
                    Ok(None) => {}
                    Err(e) => error!("Backup push failed: {e:#}"),
                }
            }
        })
    }
}

/// Parse a marker. RFC 3339 is what we write; bare epoch seconds are
/// accepted too. Anything else counts as no marker.
pub fn parse_marker(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    text.parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

async fn read_marker_file(path: &Path) -> Result<Option<DateTime<Utc>>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => {
            let parsed = parse_marker(&text);
            if parsed.is_none() {
                warn!("Ignoring unparseable sync marker at {}", path.display());
            }
            Ok(parsed)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

async fn write_marker_file(path: &Path, at: DateTime<Utc>) -> Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    tokio::fs::write(path, at.to_rfc3339())
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

async fn dir_has_files(dir: &Path) -> bool {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return false;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_name() != MARKER_FILE {
            return true;
        }
    }
    false
}

/// Recursive copy, overwriting files in `dest`. The marker file and
/// symlinks are skipped. A missing `src` copies nothing.
fn copy_tree(src: &Path, dest: &Path) -> Result<u64> {
    if !src.is_dir() {
        return Ok(0);
    }
    std::fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create {}", dest.display()))?;

    let mut copied = 0;
    let entries =
        std::fs::read_dir(src).with_context(|| format!("Failed to read {}", src.display()))?;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if name == MARKER_FILE {
            continue;
        }
        let file_type = entry.file_type()?;
        let from = entry.path();
        let to = dest.join(&name);
        if file_type.is_dir() {
            copied += copy_tree(&from, &to)?;
        } else if file_type.is_file() {
            std::fs::copy(&from, &to).with_context(|| {
                format!("Failed to copy {} to {}", from.display(), to.display())
            })?;
            copied += 1;
        }
    }
    Ok(copied)
}
