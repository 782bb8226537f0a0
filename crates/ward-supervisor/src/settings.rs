use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use ward_types::settings::WardenSettings;

/// Returns the Warden home directory (~/.warden/)
pub fn warden_home() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".warden"))
}

/// Returns the settings path: `$WARDEN_CONFIG` if set, else ~/.warden/warden.toml
pub fn settings_path() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("WARDEN_CONFIG") {
        if !p.is_empty() {
            return Ok(PathBuf::from(p));
        }
    }
    Ok(warden_home()?.join("warden.toml"))
}

/// Load settings from disk, creating the default file if it doesn't exist,
/// then apply environment overrides.
pub fn load_settings() -> Result<WardenSettings> {
    let path = settings_path()?;
    let mut settings = load_settings_from(&path)?;
    apply_env_overrides(&mut settings, |k| std::env::var(k).ok());
    Ok(settings)
}

pub fn load_settings_from(path: &Path) -> Result<WardenSettings> {
    if !path.exists() {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let default = WardenSettings::default();
        let toml_str = toml::to_string_pretty(&default)
            .context("Failed to serialize default settings")?;
        std::fs::write(path, &toml_str)
            .with_context(|| format!("Failed to write default settings to {}", path.display()))?;
        return Ok(default);
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings from {}", path.display()))?;
    let settings: WardenSettings = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse settings at {}", path.display()))?;
    Ok(settings)
}

/// Env vars win over the file for the handful of values a deployment
/// typically pins per container.
pub fn apply_env_overrides<F>(settings: &mut WardenSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(port) = lookup("WARDEN_GATEWAY_PORT").and_then(|v| v.parse().ok()) {
        settings.gateway.port = port;
    }
    if let Some(bin) = lookup("WARDEN_GATEWAY_BINARY").filter(|v| !v.is_empty()) {
        settings.gateway.binary = bin;
    }
    if let Some(listen) = lookup("WARDEN_API_LISTEN").filter(|v| !v.is_empty()) {
        settings.api.listen = listen;
    }
    if let Some(mount) = lookup("WARDEN_BACKUP_MOUNT").filter(|v| !v.is_empty()) {
        settings.backup.mount_path = mount;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_settings_roundtrip() {
        let settings = WardenSettings::default();
        let toml_str = toml::to_string_pretty(&settings).unwrap();
        let parsed: WardenSettings = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, settings);
        assert_eq!(parsed.gateway.port, 18789);
    }

    #[test]
    fn missing_file_writes_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("warden.toml");
        let settings = load_settings_from(&path).unwrap();
        assert_eq!(settings, WardenSettings::default());
        assert!(path.exists());

        // Second load reads the file back.
        let again = load_settings_from(&path).unwrap();
        assert_eq!(again, settings);
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("WARDEN_GATEWAY_PORT", "19001"),
            ("WARDEN_API_LISTEN", "127.0.0.1:9000"),
            ("WARDEN_GATEWAY_BINARY", ""),
        ]
        .into_iter()
        .collect();
        let mut settings = WardenSettings::default();
        apply_env_overrides(&mut settings, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(settings.gateway.port, 19001);
        assert_eq!(settings.api.listen, "127.0.0.1:9000");
        assert_eq!(settings.gateway.binary, "clawdbot");
    }
}
