//! OS process plumbing behind the supervisor: spawn, signal, liveness and
//! command-line signature lookup.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use ward_types::settings::GatewaySettings;

/// A fully resolved gateway launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchCommand {
    /// `<binary> gateway --port <p> --verbose --allow-unconfigured --bind <mode> [--token <t>]`
    ///
    /// Without a token the gateway falls back to device pairing.
    pub fn gateway(
        settings: &GatewaySettings,
        port: u16,
        bind: &str,
        token: Option<&str>,
    ) -> Self {
        let mut args = vec![
            "gateway".to_string(),
            "--port".to_string(),
            port.to_string(),
            "--verbose".to_string(),
            "--allow-unconfigured".to_string(),
            "--bind".to_string(),
            bind.to_string(),
        ];
        if let Some(t) = token {
            args.push("--token".to_string());
            args.push(t.to_string());
        }
        args.extend(settings.extra_args.iter().cloned());
        Self {
            program: settings.binary.clone(),
            args,
        }
    }

    /// Substring identifying a running gateway in a process command line.
    pub fn signature(program: &str) -> String {
        let base = Path::new(program)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| program.to_string());
        format!("{base} gateway")
    }

    /// Command line with the token masked, for logs.
    pub fn redacted(&self) -> String {
        let mut out = vec![self.program.clone()];
        let mut mask_next = false;
        for arg in &self.args {
            if mask_next {
                out.push("***".to_string());
                mask_next = false;
            } else {
                mask_next = arg == "--token";
                out.push(arg.clone());
            }
        }
        out.join(" ")
    }
}

#[async_trait]
pub trait ProcessHost: Send + Sync {
    /// Start the process and return its pid.
    async fn spawn(&self, cmd: &LaunchCommand) -> Result<u32>;
    /// Ask the process to exit (SIGTERM on unix).
    async fn terminate(&self, pid: u32) -> Result<()>;
    /// Kill the process outright.
    async fn kill(&self, pid: u32) -> Result<()>;
    async fn is_alive(&self, pid: u32) -> bool;
    /// First live process whose command line contains `signature`.
    async fn find_by_signature(&self, signature: &str) -> Result<Option<u32>>;
}

struct ChildEntry {
    kill_tx: Option<oneshot::Sender<()>>,
}

/// Real processes via `tokio::process`. Children spawned here are reaped by
/// a waiter task; anything else is reached through signals and `/proc`.
#[derive(Clone, Default)]
pub struct OsProcessHost {
    children: Arc<Mutex<HashMap<u32, ChildEntry>>>,
}

impl OsProcessHost {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessHost for OsProcessHost {
    async fn spawn(&self, cmd: &LaunchCommand) -> Result<u32> {
        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn: {}", cmd.program))?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("Spawned process has no pid"))?;

        // Forward gateway output into our own log stream.
        if let Some(out) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(target: "gateway", "{line}");
                }
            });
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(target: "gateway", "{line}");
                }
            });
        }

        // Register before the waiter starts, so a child that exits at once
        // is still removed.
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        self.children.lock().await.insert(
            pid,
            ChildEntry {
                kill_tx: Some(kill_tx),
            },
        );

        let children = Arc::clone(&self.children);
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = &mut kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let code = status.ok().and_then(|s| s.code());
            info!("Gateway process {pid} exited (code: {code:?})");
            children.lock().await.remove(&pid);
        });

        Ok(pid)
    }

    async fn terminate(&self, pid: u32) -> Result<()> {
        #[cfg(unix)]
        {
            send_signal(pid, libc::SIGTERM)
        }

        #[cfg(not(unix))]
        {
            self.kill(pid).await
        }
    }

    async fn kill(&self, pid: u32) -> Result<()> {
        if let Some(entry) = self.children.lock().await.get_mut(&pid) {
            if let Some(tx) = entry.kill_tx.take() {
                let _ = tx.send(());
                return Ok(());
            }
        }

        #[cfg(unix)]
        {
            send_signal(pid, libc::SIGKILL)
        }

        #[cfg(not(unix))]
        {
            anyhow::bail!("Cannot kill process {pid}: not spawned by this supervisor")
        }
    }

    async fn is_alive(&self, pid: u32) -> bool {
        // Our own children leave the map once reaped.
        if self.children.lock().await.contains_key(&pid) {
            return true;
        }
        pid_alive(pid)
    }

    async fn find_by_signature(&self, signature: &str) -> Result<Option<u32>> {
        let signature = signature.to_string();
        tokio::task::spawn_blocking(move || scan_process_table(&signature))
            .await
            .context("Process scan task failed")?
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) -> Result<()> {
    let pid = libc::pid_t::try_from(pid).context("pid out of range")?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, signal) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("Failed to signal process {pid}"));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn pid_alive(pid: u32) -> bool {
    // Zombies still have a /proc entry but are gone for our purposes.
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z" && state != "X"),
        Err(_) => false,
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only probes for existence.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(target_os = "linux")]
fn scan_process_table(signature: &str) -> Result<Option<u32>> {
    let own_pid = std::process::id();
    let entries = std::fs::read_dir("/proc").context("Failed to read /proc")?;
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        if pid == own_pid {
            continue;
        }
        let Ok(raw) = std::fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        let cmdline = cmdline_to_string(&raw);
        if cmdline.contains(signature) && pid_alive(pid) {
            debug!("Found process {pid} matching '{signature}': {cmdline}");
            return Ok(Some(pid));
        }
    }
    Ok(None)
}

#[cfg(not(target_os = "linux"))]
fn scan_process_table(_signature: &str) -> Result<Option<u32>> {
    Ok(None)
}

/// `/proc/<pid>/cmdline` is NUL-separated.
fn cmdline_to_string(raw: &[u8]) -> String {
    raw.split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ward_types::settings::WardenSettings;

    #[test]
    fn launch_with_token() {
        let settings = WardenSettings::default().gateway;
        let cmd = LaunchCommand::gateway(&settings, 18789, "lan", Some("s3cret"));
        assert_eq!(cmd.program, "clawdbot");
        assert_eq!(
            cmd.args,
            vec![
                "gateway", "--port", "18789", "--verbose", "--allow-unconfigured", "--bind", "lan",
                "--token", "s3cret"
            ]
        );
        assert!(!cmd.redacted().contains("s3cret"));
        assert!(cmd.redacted().ends_with("--token ***"));
    }

    #[test]
    fn launch_without_token_uses_pairing() {
        let settings = WardenSettings::default().gateway;
        let cmd = LaunchCommand::gateway(&settings, 18789, "lan", None);
        assert!(!cmd.args.iter().any(|a| a == "--token"));
    }

    #[test]
    fn signature_uses_binary_name() {
        assert_eq!(LaunchCommand::signature("/usr/local/bin/clawdbot"), "clawdbot gateway");
        assert_eq!(LaunchCommand::signature("clawdbot"), "clawdbot gateway");
    }

    #[test]
    fn cmdline_parsing() {
        let raw = b"node\0/usr/local/bin/clawdbot\0gateway\0--port\018789\0";
        let line = cmdline_to_string(raw);
        assert_eq!(line, "node /usr/local/bin/clawdbot gateway --port 18789");
        assert!(line.contains(&LaunchCommand::signature("clawdbot")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_and_kill_real_child() {
        let host = OsProcessHost::new();
        let cmd = LaunchCommand {
            program: "sleep".to_string(),
            args: vec!["30".to_string()],
        };
        let pid = host.spawn(&cmd).await.unwrap();
        assert!(host.is_alive(pid).await);

        host.kill(pid).await.unwrap();
        wait_for_exit(&host, pid).await;
        assert!(host.children.lock().await.is_empty());
    }

    #[cfg(unix)]
    async fn wait_for_exit(host: &OsProcessHost, pid: u32) {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while host.is_alive(pid).await {
            assert!(tokio::time::Instant::now() < deadline, "child did not exit");
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_children_are_forgotten() {
        let host = OsProcessHost::new();
        let cmd = LaunchCommand {
            program: "true".to_string(),
            args: vec![],
        };
        for _ in 0..3 {
            let pid = host.spawn(&cmd).await.unwrap();
            wait_for_exit(&host, pid).await;
        }
        assert!(host.children.lock().await.is_empty());
    }

    #[tokio::test]
    async fn spawn_missing_binary_fails() {
        let host = OsProcessHost::new();
        let cmd = LaunchCommand {
            program: "/nonexistent/definitely-not-a-gateway".to_string(),
            args: vec![],
        };
        assert!(host.spawn(&cmd).await.is_err());
    }
}
