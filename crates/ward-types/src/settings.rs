use serde::{Deserialize, Serialize};

/// Supervisor settings, persisted as `warden.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WardenSettings {
    pub gateway: GatewaySettings,
    pub supervisor: SupervisorSettings,
    pub backup: BackupSettings,
    pub inference: InferenceSettings,
    pub api: ApiSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Gateway executable, resolved through `PATH` when not absolute.
    pub binary: String,
    pub port: u16,
    pub bind: String,
    pub trusted_proxies: Vec<String>,
    /// Where the gateway reads its JSON configuration from.
    pub config_path: String,
    pub workspace: String,
    /// Extra arguments appended to the launch command.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorSettings {
    pub probe_timeout_ms: u64,
    pub grace_period_ms: u64,
    pub startup_timeout_secs: u64,
    pub cli_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSettings {
    pub enabled: bool,
    /// Directory where the remote bucket is mounted.
    pub mount_path: String,
    pub sync_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceSettings {
    /// Base URL of the sandbox's own inference proxy.
    pub managed_url: String,
    /// Path suffix identifying a URL as the managed proxy.
    pub proxy_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiSettings {
    pub listen: String,
}

impl Default for WardenSettings {
    fn default() -> Self {
        Self {
            gateway: GatewaySettings {
                binary: "clawdbot".to_string(),
                port: 18789,
                bind: "lan".to_string(),
                trusted_proxies: vec!["10.1.0.0".to_string()],
                config_path: "/root/.clawdbot/clawdbot.json".to_string(),
                workspace: "/root/clawd".to_string(),
                extra_args: vec![],
            },
            supervisor: SupervisorSettings {
                probe_timeout_ms: 1500,
                grace_period_ms: 2000,
                startup_timeout_secs: 180,
                cli_timeout_secs: 15,
            },
            backup: BackupSettings {
                enabled: true,
                mount_path: "/data/warden".to_string(),
                sync_interval_secs: 300,
            },
            inference: InferenceSettings {
                managed_url: "http://127.0.0.1:8787/inference/v1".to_string(),
                proxy_path: "/inference/v1".to_string(),
            },
            api: ApiSettings {
                listen: "0.0.0.0:8080".to_string(),
            },
        }
    }
}
