//! Config hydration: persisted gateway config + environment → the document
//! the gateway will read at launch.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::{info, warn};

use ward_types::gateway_config::{
    ControlUi, GatewayAuth, GatewayConfig, ModelAlias, ModelEntry, ModelSelection,
    ProviderConfig, DIALECT_ANTHROPIC, DIALECT_OPENAI,
};
use ward_types::settings::WardenSettings;

/// Minimum context window for a managed model to be picked as primary.
const MIN_PRIMARY_CONTEXT: u32 = 16_384;

const ANTHROPIC_ENDPOINT: &str = "https://api.anthropic.com";
const DEFAULT_PRIMARY_MODEL: &str = "anthropic/claude-sonnet-4-5";

const MANAGED_PROVIDER: &str = "managed";
const OPENAI_COMPAT_PROVIDER: &str = "openai-compatible";
const ANTHROPIC_PROVIDER: &str = "anthropic";

struct CatalogModel {
    id: &'static str,
    name: &'static str,
    context_window: u32,
    tool_use: bool,
}

const fn model(
    id: &'static str,
    name: &'static str,
    context_window: u32,
    tool_use: bool,
) -> CatalogModel {
    CatalogModel {
        id,
        name,
        context_window,
        tool_use,
    }
}

const MANAGED_CATALOG: &[CatalogModel] = &[
    model("llama-3.2-3b-instruct", "Llama 3.2 3B Instruct", 8_192, true),
    model("mistral-7b-instruct", "Mistral 7B Instruct", 32_768, false),
    model("llama-3.3-70b-instruct", "Llama 3.3 70B Instruct", 24_000, true),
    model("qwen2.5-coder-32b-instruct", "Qwen 2.5 Coder 32B", 32_768, true),
];

const GENERIC_OPENAI_CATALOG: &[CatalogModel] = &[
    model("gpt-4o", "GPT-4o", 128_000, true),
    model("gpt-4o-mini", "GPT-4o mini", 128_000, true),
];

const GEMINI_CATALOG: &[CatalogModel] = &[
    model("gemini-2.5-flash", "Gemini 2.5 Flash", 1_048_576, true),
    model("gemini-2.5-pro", "Gemini 2.5 Pro", 1_048_576, true),
];

const OPENROUTER_CATALOG: &[CatalogModel] = &[
    model("google/gemini-2.5-flash", "Gemini 2.5 Flash (OpenRouter)", 1_048_576, true),
    model("anthropic/claude-sonnet-4.5", "Claude Sonnet 4.5 (OpenRouter)", 200_000, true),
];

const ANTHROPIC_CATALOG: &[CatalogModel] = &[
    model("claude-sonnet-4-5", "Claude Sonnet 4.5", 200_000, true),
    model("claude-opus-4-1", "Claude Opus 4.1", 200_000, true),
    model("claude-haiku-4-5", "Claude Haiku 4.5", 200_000, true),
];

/// A vendor recognised by host substring on an OpenAI-compatible base URL.
struct KnownVendor {
    host_fragment: &'static str,
    provider: &'static str,
    catalog: &'static [CatalogModel],
    fallback_provider: &'static str,
    fallback_base_url: &'static str,
    fallback_catalog: &'static [CatalogModel],
}

const KNOWN_VENDORS: &[KnownVendor] = &[KnownVendor {
    host_fragment: "generativelanguage.googleapis.com",
    provider: "gemini",
    catalog: GEMINI_CATALOG,
    fallback_provider: "openrouter",
    fallback_base_url: "https://openrouter.ai/api/v1",
    fallback_catalog: OPENROUTER_CATALOG,
}];

// ─── Environment ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    OpenAi,
    Anthropic,
}

/// Environment-derived hydration input. Empty values count as unset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HydrationEnv {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub fallback_api_key: Option<String>,
    pub dialect: Option<Dialect>,
    pub managed_inference: bool,
    pub anthropic_api_key: Option<String>,
    pub gateway_token: Option<String>,
    pub dev_mode: bool,
    pub telegram_bot_token: Option<String>,
    pub discord_bot_token: Option<String>,
    pub slack_bot_token: Option<String>,
    pub slack_app_token: Option<String>,
}

impl HydrationEnv {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| lookup(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let flag = |k: &str| {
            get(k).is_some_and(|v| {
                matches!(
                    v.to_ascii_lowercase().as_str(),
                    "1" | "true" | "yes" | "on"
                )
            })
        };
        let dialect =
            get("INFERENCE_API_DIALECT").and_then(|v| match v.to_ascii_lowercase().as_str() {
                "openai" => Some(Dialect::OpenAi),
                "anthropic" => Some(Dialect::Anthropic),
                other => {
                    warn!("Ignoring unknown INFERENCE_API_DIALECT: {other}");
                    None
                }
            });

        Self {
            base_url: get("INFERENCE_BASE_URL").map(|u| u.trim_end_matches('/').to_string()),
            api_key: get("INFERENCE_API_KEY"),
            fallback_api_key: get("INFERENCE_FALLBACK_API_KEY"),
            dialect,
            managed_inference: flag("MANAGED_INFERENCE"),
            anthropic_api_key: get("ANTHROPIC_API_KEY"),
            gateway_token: get("GATEWAY_TOKEN"),
            dev_mode: flag("DEV_MODE"),
            telegram_bot_token: get("TELEGRAM_BOT_TOKEN"),
            discord_bot_token: get("DISCORD_BOT_TOKEN"),
            slack_bot_token: get("SLACK_BOT_TOKEN"),
            slack_app_token: get("SLACK_APP_TOKEN"),
        }
    }
}

// ─── Provider selection ──────────────────────────────────────────────────────

/// Which precedence rule chose the inference provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderRule {
    Managed,
    OpenAiCompatible,
    AnthropicCompatible,
    DirectCredential,
    StaticDefault,
}

impl std::fmt::Display for ProviderRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Managed => write!(f, "managed inference"),
            Self::OpenAiCompatible => write!(f, "openai-compatible base url"),
            Self::AnthropicCompatible => write!(f, "anthropic-compatible base url"),
            Self::DirectCredential => write!(f, "direct anthropic credential"),
            Self::StaticDefault => write!(f, "static default"),
        }
    }
}

/// First matching rule wins.
pub fn select_rule(env: &HydrationEnv, proxy_path: &str) -> ProviderRule {
    let base_url = env.base_url.as_deref();
    if env.managed_inference || base_url.is_some_and(|u| is_managed_url(u, proxy_path)) {
        return ProviderRule::Managed;
    }
    if let Some(url) = base_url {
        return match env.dialect.unwrap_or_else(|| infer_dialect(url)) {
            Dialect::OpenAi => ProviderRule::OpenAiCompatible,
            Dialect::Anthropic => ProviderRule::AnthropicCompatible,
        };
    }
    if env.anthropic_api_key.is_some() {
        return ProviderRule::DirectCredential;
    }
    ProviderRule::StaticDefault
}

fn url_path(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(u) => u.path().trim_end_matches('/').to_string(),
        Err(_) => url.trim_end_matches('/').to_string(),
    }
}

fn url_host(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        .unwrap_or_default()
}

fn is_managed_url(url: &str, proxy_path: &str) -> bool {
    let suffix = proxy_path.trim_end_matches('/');
    !suffix.is_empty() && url_path(url).ends_with(suffix)
}

fn infer_dialect(url: &str) -> Dialect {
    if url_host(url).contains("anthropic") {
        return Dialect::Anthropic;
    }
    let path = url_path(url);
    if path.ends_with("/openai") || path.ends_with("/v1") {
        Dialect::OpenAi
    } else {
        Dialect::Anthropic
    }
}

fn known_vendor(url: &str) -> Option<&'static KnownVendor> {
    let host = url_host(url);
    KNOWN_VENDORS.iter().find(|v| host.contains(v.host_fragment))
}

// ─── Hydration ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct HydrationReport {
    pub rule: ProviderRule,
    pub primary_model: String,
    pub dropped_providers: Vec<String>,
    /// The persisted document was unreadable and hydration started from empty.
    pub reset_document: bool,
}

/// Parse a persisted document. Providers that are structurally invalid are
/// dropped first. A document that still fails to parse becomes the empty one.
pub fn parse_persisted(text: &str) -> (GatewayConfig, Vec<String>, bool) {
    let mut doc: Value = match serde_json::from_str(text) {
        Ok(v @ Value::Object(_)) => v,
        Ok(_) => {
            warn!("Persisted gateway config is not a JSON object, starting from empty");
            return (GatewayConfig::default(), Vec::new(), true);
        }
        Err(e) => {
            warn!("Persisted gateway config is not valid JSON ({e}), starting from empty");
            return (GatewayConfig::default(), Vec::new(), true);
        }
    };

    let dropped = drop_invalid_providers(&mut doc);
    match serde_json::from_value::<GatewayConfig>(doc) {
        Ok(cfg) => (cfg, dropped, false),
        Err(e) => {
            warn!("Persisted gateway config has an unexpected shape ({e}), starting from empty");
            (GatewayConfig::default(), dropped, true)
        }
    }
}

fn drop_invalid_providers(doc: &mut Value) -> Vec<String> {
    let Some(providers) = doc
        .pointer_mut("/models/providers")
        .and_then(Value::as_object_mut)
    else {
        return Vec::new();
    };

    let invalid: Vec<String> = providers
        .iter()
        .filter(|(_, p)| !is_valid_provider(p))
        .map(|(name, _)| name.clone())
        .collect();
    for name in &invalid {
        warn!("Dropping invalid provider entry: {name}");
        providers.remove(name);
    }
    invalid
}

/// A provider must name its endpoint and dialect, give every model an id,
/// and otherwise match the typed record, so one bad entry cannot fail the
/// whole document.
fn is_valid_provider(provider: &Value) -> bool {
    let Some(obj) = provider.as_object() else {
        return false;
    };
    let is_str = |k: &str| obj.get(k).is_some_and(Value::is_string);
    if !is_str("baseUrl") || !is_str("api") {
        return false;
    }
    let ids_ok = match obj.get("models") {
        None => true,
        Some(Value::Array(models)) => models
            .iter()
            .all(|m| m.get("id").is_some_and(Value::is_string)),
        Some(_) => false,
    };
    ids_ok && serde_json::from_value::<ProviderConfig>(provider.clone()).is_ok()
}

/// Apply environment overrides and supervisor-owned fields to `cfg`.
pub fn hydrate(
    cfg: &mut GatewayConfig,
    env: &HydrationEnv,
    settings: &WardenSettings,
) -> (ProviderRule, String) {
    let rule = select_rule(env, &settings.inference.proxy_path);
    let primary = apply_provider_rule(cfg, rule, env, settings);

    cfg.agents.defaults.model.get_or_insert_with(ModelSelection::default).primary =
        Some(primary.clone());
    cfg.agents.defaults.workspace = Some(settings.gateway.workspace.clone());

    apply_gateway_policy(cfg, env, settings);
    apply_channels(cfg, env);

    (rule, primary)
}

fn apply_provider_rule(
    cfg: &mut GatewayConfig,
    rule: ProviderRule,
    env: &HydrationEnv,
    settings: &WardenSettings,
) -> String {
    match rule {
        ProviderRule::Managed => {
            let base_url = env
                .base_url
                .clone()
                .filter(|u| is_managed_url(u, &settings.inference.proxy_path))
                .unwrap_or_else(|| settings.inference.managed_url.clone());
            let primary = MANAGED_CATALOG
                .iter()
                .find(|m| m.tool_use && m.context_window >= MIN_PRIMARY_CONTEXT)
                .unwrap_or(&MANAGED_CATALOG[0]);
            upsert_provider(
                cfg,
                MANAGED_PROVIDER,
                &base_url,
                DIALECT_OPENAI,
                env.api_key.clone(),
                MANAGED_CATALOG,
            );
            qualified(MANAGED_PROVIDER, primary.id)
        }
        ProviderRule::OpenAiCompatible => {
            let url = env.base_url.clone().unwrap_or_default();
            match known_vendor(&url) {
                Some(vendor) => {
                    upsert_provider(
                        cfg,
                        vendor.provider,
                        &url,
                        DIALECT_OPENAI,
                        env.api_key.clone(),
                        vendor.catalog,
                    );
                    match &env.fallback_api_key {
                        Some(key) => {
                            upsert_provider(
                                cfg,
                                vendor.fallback_provider,
                                vendor.fallback_base_url,
                                DIALECT_OPENAI,
                                Some(key.clone()),
                                vendor.fallback_catalog,
                            );
                            qualified(vendor.fallback_provider, vendor.fallback_catalog[0].id)
                        }
                        None => qualified(vendor.provider, vendor.catalog[0].id),
                    }
                }
                None => {
                    upsert_provider(
                        cfg,
                        OPENAI_COMPAT_PROVIDER,
                        &url,
                        DIALECT_OPENAI,
                        env.api_key.clone(),
                        GENERIC_OPENAI_CATALOG,
                    );
                    qualified(OPENAI_COMPAT_PROVIDER, GENERIC_OPENAI_CATALOG[0].id)
                }
            }
        }
        ProviderRule::AnthropicCompatible => {
            let url = env.base_url.clone().unwrap_or_default();
            let key = env.api_key.clone().or_else(|| env.anthropic_api_key.clone());
            upsert_provider(
                cfg,
                ANTHROPIC_PROVIDER,
                &url,
                DIALECT_ANTHROPIC,
                key,
                ANTHROPIC_CATALOG,
            );
            qualified(ANTHROPIC_PROVIDER, ANTHROPIC_CATALOG[0].id)
        }
        ProviderRule::DirectCredential => {
            upsert_provider(
                cfg,
                ANTHROPIC_PROVIDER,
                ANTHROPIC_ENDPOINT,
                DIALECT_ANTHROPIC,
                env.anthropic_api_key.clone(),
                ANTHROPIC_CATALOG,
            );
            qualified(ANTHROPIC_PROVIDER, ANTHROPIC_CATALOG[0].id)
        }
        ProviderRule::StaticDefault => DEFAULT_PRIMARY_MODEL.to_string(),
    }
}

fn qualified(provider: &str, model_id: &str) -> String {
    format!("{provider}/{model_id}")
}

fn upsert_provider(
    cfg: &mut GatewayConfig,
    name: &str,
    base_url: &str,
    api: &str,
    api_key: Option<String>,
    catalog: &[CatalogModel],
) {
    let entry = cfg
        .models
        .providers
        .entry(name.to_string())
        .or_insert_with(ProviderConfig::default);
    entry.base_url = base_url.to_string();
    entry.api = api.to_string();
    entry.api_key = api_key;
    entry.models = catalog
        .iter()
        .map(|m| ModelEntry::new(m.id, m.name, m.context_window))
        .collect();

    for m in catalog {
        let alias = cfg
            .agents
            .defaults
            .models
            .entry(qualified(name, m.id))
            .or_insert_with(ModelAlias::default);
        if alias.alias.is_none() {
            alias.alias = Some(m.name.to_string());
        }
    }
}

fn apply_gateway_policy(cfg: &mut GatewayConfig, env: &HydrationEnv, settings: &WardenSettings) {
    let gw = &mut cfg.gateway;
    gw.port = Some(settings.gateway.port);
    gw.mode = Some("local".to_string());
    gw.bind = Some(settings.gateway.bind.clone());
    gw.trusted_proxies = settings.gateway.trusted_proxies.clone();

    let ui = gw.control_ui.get_or_insert_with(ControlUi::default);
    ui.enabled = true;
    ui.allow_insecure_auth = env.dev_mode;

    match &env.gateway_token {
        Some(token) => {
            gw.auth.get_or_insert_with(GatewayAuth::default).token = Some(token.clone());
        }
        None => {
            if let Some(auth) = gw.auth.as_mut() {
                auth.token = None;
            }
        }
    }
}

fn apply_channels(cfg: &mut GatewayConfig, env: &HydrationEnv) {
    let channels = &mut cfg.channels;
    merge_channel(channels, "telegram", &[("botToken", env.telegram_bot_token.as_ref())]);
    merge_channel(channels, "discord", &[("token", env.discord_bot_token.as_ref())]);
    merge_channel(
        channels,
        "slack",
        &[
            ("botToken", env.slack_bot_token.as_ref()),
            ("appToken", env.slack_app_token.as_ref()),
        ],
    );
}

/// Enable a channel and set its credentials, keeping any other settings.
/// Channels with no credentials in the environment are left untouched.
fn merge_channel(
    channels: &mut Map<String, Value>,
    channel: &str,
    fields: &[(&str, Option<&String>)],
) {
    if fields.iter().all(|(_, v)| v.is_none()) {
        return;
    }
    let entry = channels
        .entry(channel.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    if let Some(obj) = entry.as_object_mut() {
        obj.insert("enabled".to_string(), Value::Bool(true));
        for (key, value) in fields {
            if let Some(v) = value {
                obj.insert(key.to_string(), Value::String((*v).clone()));
            }
        }
    }
}

/// Read, hydrate and rewrite the gateway config file.
pub fn hydrate_file(
    path: &Path,
    env: &HydrationEnv,
    settings: &WardenSettings,
) -> Result<(GatewayConfig, HydrationReport)> {
    let (mut cfg, dropped, reset) = match std::fs::read_to_string(path) {
        Ok(text) => parse_persisted(&text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No gateway config at {}, starting from empty", path.display());
            (GatewayConfig::default(), Vec::new(), false)
        }
        Err(e) => {
            warn!("Failed to read {} ({e}), starting from empty", path.display());
            (GatewayConfig::default(), Vec::new(), true)
        }
    };

    let (rule, primary_model) = hydrate(&mut cfg, env, settings);

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let json = serde_json::to_string_pretty(&cfg).context("Failed to serialize gateway config")?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write gateway config to {}", path.display()))?;

    info!("Gateway config hydrated: provider rule={rule}, primary={primary_model}");
    Ok((
        cfg,
        HydrationReport {
            rule,
            primary_model,
            dropped_providers: dropped,
            reset_document: reset,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> HydrationEnv {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        HydrationEnv::from_lookup(|k| map.get(k).cloned())
    }

    fn hydrated(pairs: &[(&str, &str)]) -> (GatewayConfig, ProviderRule, String) {
        let mut cfg = GatewayConfig::default();
        let (rule, primary) = hydrate(&mut cfg, &env_of(pairs), &WardenSettings::default());
        (cfg, rule, primary)
    }

    #[test]
    fn managed_flag_beats_third_party_url() {
        let (cfg, rule, primary) = hydrated(&[
            ("MANAGED_INFERENCE", "true"),
            ("INFERENCE_BASE_URL", "https://api.openai.com/v1"),
            ("INFERENCE_API_KEY", "sk-test"),
        ]);
        assert_eq!(rule, ProviderRule::Managed);
        assert_eq!(primary, "managed/llama-3.3-70b-instruct");
        let managed = &cfg.models.providers["managed"];
        assert_eq!(managed.base_url, "http://127.0.0.1:8787/inference/v1");
        assert_eq!(managed.api, DIALECT_OPENAI);
        assert!(!cfg.models.providers.contains_key("openai-compatible"));
    }

    #[test]
    fn proxy_path_url_selects_managed() {
        let (cfg, rule, _) = hydrated(&[(
            "INFERENCE_BASE_URL",
            "https://sandbox.example.dev/inference/v1/",
        )]);
        assert_eq!(rule, ProviderRule::Managed);
        assert_eq!(
            cfg.models.providers["managed"].base_url,
            "https://sandbox.example.dev/inference/v1"
        );
    }

    #[test]
    fn managed_primary_meets_context_minimum() {
        let (cfg, _, primary) = hydrated(&[("MANAGED_INFERENCE", "1")]);
        let id = primary.strip_prefix("managed/").unwrap();
        let entry = cfg.models.providers["managed"]
            .models
            .iter()
            .find(|m| m.id == id)
            .unwrap();
        assert!(entry.context_window.unwrap() >= MIN_PRIMARY_CONTEXT);
    }

    #[test]
    fn generic_openai_url() {
        let (cfg, rule, primary) = hydrated(&[
            ("INFERENCE_BASE_URL", "https://llm.internal.example/v1"),
            ("INFERENCE_API_KEY", "sk-1"),
        ]);
        assert_eq!(rule, ProviderRule::OpenAiCompatible);
        assert_eq!(primary, "openai-compatible/gpt-4o");
        let p = &cfg.models.providers["openai-compatible"];
        assert_eq!(p.api_key.as_deref(), Some("sk-1"));
        assert_eq!(
            cfg.agents.defaults.models["openai-compatible/gpt-4o"].alias.as_deref(),
            Some("GPT-4o")
        );
    }

    #[test]
    fn known_vendor_prefers_fallback_when_keyed() {
        let (cfg, rule, primary) = hydrated(&[
            ("INFERENCE_BASE_URL", "https://generativelanguage.googleapis.com/v1beta/openai"),
            ("INFERENCE_API_KEY", "g-key"),
            ("INFERENCE_FALLBACK_API_KEY", "or-key"),
        ]);
        assert_eq!(rule, ProviderRule::OpenAiCompatible);
        assert_eq!(primary, "openrouter/google/gemini-2.5-flash");
        assert_eq!(cfg.models.providers["gemini"].api_key.as_deref(), Some("g-key"));
        assert_eq!(cfg.models.providers["openrouter"].api_key.as_deref(), Some("or-key"));
    }

    #[test]
    fn known_vendor_without_fallback_uses_vendor() {
        let (cfg, _, primary) = hydrated(&[
            ("INFERENCE_BASE_URL", "https://generativelanguage.googleapis.com/v1beta/openai"),
            ("INFERENCE_API_KEY", "g-key"),
        ]);
        assert_eq!(primary, "gemini/gemini-2.5-flash");
        assert!(!cfg.models.providers.contains_key("openrouter"));
    }

    #[test]
    fn anthropic_url_without_key_omits_credential() {
        let (cfg, rule, primary) = hydrated(&[(
            "INFERENCE_BASE_URL",
            "https://gateway.example.com/v1/acct/gw/anthropic",
        )]);
        assert_eq!(rule, ProviderRule::AnthropicCompatible);
        assert_eq!(primary, "anthropic/claude-sonnet-4-5");
        let p = &cfg.models.providers["anthropic"];
        assert_eq!(p.api, DIALECT_ANTHROPIC);
        assert!(p.api_key.is_none());
    }

    #[test]
    fn explicit_dialect_overrides_inference() {
        let (_, rule, _) = hydrated(&[
            ("INFERENCE_BASE_URL", "https://proxy.example.com/custom"),
            ("INFERENCE_API_DIALECT", "openai"),
        ]);
        assert_eq!(rule, ProviderRule::OpenAiCompatible);
    }

    #[test]
    fn direct_credential_uses_standard_endpoint() {
        let (cfg, rule, _) = hydrated(&[("ANTHROPIC_API_KEY", "sk-ant")]);
        assert_eq!(rule, ProviderRule::DirectCredential);
        let p = &cfg.models.providers["anthropic"];
        assert_eq!(p.base_url, ANTHROPIC_ENDPOINT);
        assert_eq!(p.api_key.as_deref(), Some("sk-ant"));
    }

    #[test]
    fn nothing_configured_falls_back_to_default() {
        let (cfg, rule, primary) = hydrated(&[]);
        assert_eq!(rule, ProviderRule::StaticDefault);
        assert_eq!(primary, DEFAULT_PRIMARY_MODEL);
        assert!(cfg.models.providers.is_empty());
        assert_eq!(cfg.primary_model(), Some(DEFAULT_PRIMARY_MODEL));
    }

    #[test]
    fn invalid_provider_is_dropped_before_merge() {
        let persisted = serde_json::json!({
            "models": { "providers": {
                "broken": { "baseUrl": "https://x", "api": "openai-completions",
                            "models": [ { "name": "no id here" } ] },
                "fine": { "baseUrl": "https://y", "api": "openai-completions",
                          "models": [ { "id": "m1", "name": "M1" } ] }
            } }
        })
        .to_string();
        let (mut cfg, dropped, reset) = parse_persisted(&persisted);
        assert_eq!(dropped, vec!["broken".to_string()]);
        assert!(!reset);

        hydrate(&mut cfg, &env_of(&[("ANTHROPIC_API_KEY", "k")]), &WardenSettings::default());
        assert!(!cfg.models.providers.contains_key("broken"));
        assert!(cfg.models.providers.contains_key("fine"));
        assert!(cfg.models.providers.contains_key("anthropic"));
    }

    #[test]
    fn mistyped_provider_field_drops_only_that_provider() {
        let persisted = serde_json::json!({
            "models": { "providers": {
                "bad": { "baseUrl": "https://x", "api": "openai-completions",
                         "models": [ { "id": "m1", "contextWindow": "200k" } ] },
                "numeric_key": { "baseUrl": "https://z", "api": "openai-completions",
                                 "apiKey": 42 },
                "good": { "baseUrl": "https://y", "api": "openai-completions",
                          "models": [ { "id": "m2", "name": "M2", "contextWindow": 8192 } ] }
            } },
            "channels": { "telegram": { "enabled": true, "botToken": "t" } },
            "gateway": { "customFlag": true }
        })
        .to_string();

        let (cfg, mut dropped, reset) = parse_persisted(&persisted);
        dropped.sort();
        assert_eq!(dropped, vec!["bad".to_string(), "numeric_key".to_string()]);
        assert!(!reset);
        assert_eq!(cfg.models.providers.len(), 1);
        assert_eq!(cfg.models.providers["good"].models[0].context_window, Some(8192));
        assert_eq!(cfg.channels["telegram"]["botToken"], "t");
        assert_eq!(cfg.gateway.extra["customFlag"], true);
    }

    #[test]
    fn malformed_document_starts_empty() {
        let (cfg, dropped, reset) = parse_persisted("{ not json");
        assert_eq!(cfg, GatewayConfig::default());
        assert!(dropped.is_empty());
        assert!(reset);

        let (cfg, _, reset) = parse_persisted(r#"{"gateway": {"port": "not-a-port"}}"#);
        assert_eq!(cfg, GatewayConfig::default());
        assert!(reset);
    }

    #[test]
    fn supervisor_owned_fields_are_overwritten() {
        let persisted = serde_json::json!({
            "gateway": {
                "port": 1234, "bind": "loopback", "trustedProxies": ["1.2.3.4"],
                "controlUi": { "enabled": false, "basePath": "/ui" },
                "auth": { "token": "old" }
            }
        })
        .to_string();
        let (mut cfg, _, _) = parse_persisted(&persisted);
        hydrate(
            &mut cfg,
            &env_of(&[("GATEWAY_TOKEN", "new"), ("DEV_MODE", "yes")]),
            &WardenSettings::default(),
        );

        assert_eq!(cfg.gateway.port, Some(18789));
        assert_eq!(cfg.gateway.bind.as_deref(), Some("lan"));
        assert_eq!(cfg.gateway.trusted_proxies, vec!["10.1.0.0".to_string()]);
        let ui = cfg.gateway.control_ui.as_ref().unwrap();
        assert!(ui.enabled);
        assert!(ui.allow_insecure_auth);
        assert_eq!(ui.extra["basePath"], "/ui");
        assert_eq!(cfg.auth_token(), Some("new"));
    }

    #[test]
    fn token_is_cleared_without_env() {
        let (mut cfg, _, _) =
            parse_persisted(r#"{"gateway":{"auth":{"token":"stale","mode":"token"}}}"#);
        hydrate(&mut cfg, &env_of(&[]), &WardenSettings::default());
        assert!(cfg.auth_token().is_none());
        assert_eq!(cfg.gateway.auth.as_ref().unwrap().extra["mode"], "token");
    }

    #[test]
    fn channel_credentials_merge() {
        let (mut cfg, _, _) =
            parse_persisted(r#"{"channels":{"telegram":{"dmPolicy":"pairing"}}}"#);
        hydrate(
            &mut cfg,
            &env_of(&[("TELEGRAM_BOT_TOKEN", "tg"), ("SLACK_APP_TOKEN", "xapp")]),
            &WardenSettings::default(),
        );
        assert_eq!(cfg.channels["telegram"]["botToken"], "tg");
        assert_eq!(cfg.channels["telegram"]["dmPolicy"], "pairing");
        assert_eq!(cfg.channels["slack"]["appToken"], "xapp");
        assert!(!cfg.channels.contains_key("discord"));
    }

    #[test]
    fn hydrate_file_writes_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gw").join("config.json");
        let env = env_of(&[("MANAGED_INFERENCE", "on")]);
        let (_, report) = hydrate_file(&path, &env, &WardenSettings::default()).unwrap();
        assert_eq!(report.rule, ProviderRule::Managed);
        assert!(!report.reset_document);

        let written: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["gateway"]["port"], 18789);
        assert_eq!(written["agents"]["defaults"]["model"]["primary"], report.primary_model);
    }
}
