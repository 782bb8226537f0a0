//! The configuration document the gateway reads at launch.
//!
//! Only the fields the supervisor touches are modelled. Everything else is
//! carried through `extra` so hydration never loses settings the gateway owns.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Dialect tag for providers speaking the OpenAI chat-completions API.
pub const DIALECT_OPENAI: &str = "openai-completions";
/// Dialect tag for providers speaking the Anthropic messages API.
pub const DIALECT_ANTHROPIC: &str = "anthropic-messages";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default)]
    pub agents: AgentsSection,
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub models: ModelsSection,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub channels: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentsSection {
    #[serde(default)]
    pub defaults: AgentDefaults,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelSelection>,
    /// Provider-qualified model id (`provider/model`) → selectable alias.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub models: BTreeMap<String, ModelAlias>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSelection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelAlias {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trusted_proxies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<GatewayAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_ui: Option<ControlUi>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The gateway's own HTTP control plane.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlUi {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub allow_insecure_auth: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelsSection {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub base_url: String,
    pub api: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub models: Vec<ModelEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ModelEntry {
    pub fn new(id: &str, name: &str, context_window: u32) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            context_window: Some(context_window),
            extra: Map::new(),
        }
    }
}

impl GatewayConfig {
    /// The primary model, if one has been selected.
    pub fn primary_model(&self) -> Option<&str> {
        self.agents
            .defaults
            .model
            .as_ref()
            .and_then(|m| m.primary.as_deref())
    }

    /// The gateway access token, if one is configured.
    pub fn auth_token(&self) -> Option<&str> {
        self.gateway
            .auth
            .as_ref()
            .and_then(|a| a.token.as_deref())
            .filter(|t| !t.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_survive_roundtrip() {
        let raw = serde_json::json!({
            "agents": { "defaults": { "workspace": "/root/clawd", "maxConcurrent": 4 } },
            "gateway": { "port": 18789, "reload": { "mode": "hot" } },
            "models": { "providers": {} },
            "hooks": { "enabled": true }
        });
        let cfg: GatewayConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(cfg.agents.defaults.workspace.as_deref(), Some("/root/clawd"));
        assert_eq!(cfg.agents.defaults.extra["maxConcurrent"], 4);
        assert!(cfg.gateway.extra.contains_key("reload"));

        let back = serde_json::to_value(&cfg).unwrap();
        assert_eq!(back["hooks"]["enabled"], true);
        assert_eq!(back["gateway"]["reload"]["mode"], "hot");
    }

    #[test]
    fn empty_document_parses_to_default() {
        let cfg: GatewayConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, GatewayConfig::default());
        assert!(cfg.primary_model().is_none());
        assert!(cfg.auth_token().is_none());
    }

    #[test]
    fn empty_token_is_not_a_token() {
        let mut cfg = GatewayConfig::default();
        cfg.gateway.auth = Some(GatewayAuth {
            token: Some(String::new()),
            extra: Map::new(),
        });
        assert!(cfg.auth_token().is_none());
    }
}
