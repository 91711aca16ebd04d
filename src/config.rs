use crate::error::AppError;
use crate::models::{ProviderId, Tier};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const SERVICE_NAME: &str = "companion-relay";
const ENV_PREFIX: &str = "COMPANION_RELAY";

fn app_home_dir() -> Result<PathBuf, AppError> {
    if let Ok(custom) = std::env::var("COMPANION_RELAY_HOME") {
        return Ok(PathBuf::from(custom));
    }

    if let Some(dirs) = ProjectDirs::from("com", "companion", SERVICE_NAME) {
        let candidate = dirs.data_local_dir().to_path_buf();
        if fs::create_dir_all(&candidate).is_ok() {
            return Ok(candidate);
        }
    }

    let cwd = std::env::current_dir()?;
    Ok(cwd.join(".companion-relay"))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub quota: QuotaSettings,
    pub chain: ChainSettings,
    pub orchestrator: OrchestratorSettings,
    pub providers: BTreeMap<String, ProviderSettings>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            quota: QuotaSettings::default(),
            chain: ChainSettings::default(),
            orchestrator: OrchestratorSettings::default(),
            providers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TierRule {
    pub trial_duration_days: i64,
    pub total_message_cap: u64,
    pub daily_message_cap: u64,
    pub cooldown_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_cap_paid: Option<u64>,
}

impl TierRule {
    pub fn free_default() -> Self {
        Self {
            trial_duration_days: 7,
            total_message_cap: 50,
            daily_message_cap: 15,
            cooldown_seconds: 3,
            daily_cap_paid: None,
        }
    }

    pub fn paid_default() -> Self {
        Self {
            trial_duration_days: 0,
            total_message_cap: 0,
            daily_message_cap: 0,
            cooldown_seconds: 0,
            daily_cap_paid: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QuotaSettings {
    /// Offset used for the daily midnight boundary. Unset means the host's local offset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone_offset_minutes: Option<i32>,
    pub free: TierRule,
    pub tier1: TierRule,
    pub tier2: TierRule,
    pub tier3: TierRule,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            timezone_offset_minutes: None,
            free: TierRule::free_default(),
            tier1: TierRule::paid_default(),
            tier2: TierRule::paid_default(),
            tier3: TierRule::paid_default(),
        }
    }
}

impl QuotaSettings {
    /// Expired, `none` and unrecognized tiers are rated with the free rule.
    pub fn rule_for(&self, tier: Tier) -> TierRule {
        match tier {
            Tier::Tier1 => self.tier1,
            Tier::Tier2 => self.tier2,
            Tier::Tier3 => self.tier3,
            Tier::Free | Tier::Expired | Tier::None => self.free,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChainSettings {
    pub low_latency_timeout_ms: u64,
    pub standard_timeout_ms: u64,
    pub low_latency_history: usize,
    pub standard_history: usize,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            low_latency_timeout_ms: 6_000,
            standard_timeout_ms: 30_000,
            low_latency_history: 2,
            standard_history: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Whether the restricted-mode refusal consumes a quota slot.
    pub charge_restricted_refusal: bool,
    pub intent_detection: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Openai,
    Anthropic,
}

impl ProviderKind {
    pub fn parse(input: &str) -> Result<ProviderKind, AppError> {
        match input.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::Openai),
            "anthropic" => Ok(ProviderKind::Anthropic),
            other => Err(AppError::Config(format!(
                "Unsupported provider kind '{other}'. Use openai or anthropic."
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProviderSettings {
    #[serde(default)]
    pub kind: ProviderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

impl AppConfig {
    /// Provider entries whose key parses to a known id.
    pub fn provider_entries(&self) -> Vec<(ProviderId, &ProviderSettings)> {
        self.providers
            .iter()
            .filter_map(|(name, settings)| ProviderId::parse(name).map(|id| (id, settings)))
            .collect()
    }
}

pub fn config_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("config"))
}

pub fn data_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("data"))
}

pub fn config_path() -> Result<PathBuf, AppError> {
    Ok(config_dir()?.join("config.toml"))
}

pub fn db_path() -> Result<PathBuf, AppError> {
    Ok(data_dir()?.join("relay.sqlite"))
}

pub fn ensure_dirs() -> Result<(), AppError> {
    fs::create_dir_all(config_dir()?)?;
    fs::create_dir_all(data_dir()?)?;
    Ok(())
}

/// Layers the TOML file (if any) under `COMPANION_RELAY__SECTION__KEY` overrides.
pub fn load_config_from(path: &Path) -> Result<AppConfig, AppError> {
    let layered = ::config::Config::builder()
        .add_source(::config::File::from(path).required(false))
        .add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    Ok(layered.try_deserialize::<AppConfig>()?)
}

pub fn load_config() -> Result<AppConfig, AppError> {
    load_config_from(&config_path()?)
}

pub fn save_config(config: &AppConfig) -> Result<(), AppError> {
    ensure_dirs()?;
    let path = config_path()?;
    let raw = toml::to_string_pretty(config)?;
    fs::write(path, raw)?;
    Ok(())
}

fn key_entry(provider: ProviderId) -> Result<keyring::Entry, AppError> {
    Ok(keyring::Entry::new(
        SERVICE_NAME,
        &format!("provider:{}", provider.as_label()),
    )?)
}

pub fn set_api_key(provider: ProviderId, key: &str) -> Result<(), AppError> {
    key_entry(provider)?.set_password(key)?;
    Ok(())
}

pub fn delete_api_key(provider: ProviderId) -> Result<(), AppError> {
    match key_entry(provider)?.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(AppError::Keyring(e)),
    }
}

fn api_key_env_name(provider: ProviderId) -> String {
    format!(
        "{}_API_KEY",
        provider.as_label().to_ascii_uppercase().replace('-', "_")
    )
}

/// Keyring first, then `<ID>_API_KEY`. `None` means the provider is not configured.
pub fn get_api_key(provider: ProviderId) -> Option<String> {
    if let Ok(entry) = key_entry(provider) {
        if let Ok(value) = entry.get_password() {
            if !value.is_empty() {
                return Some(value);
            }
        }
    }

    std::env::var(api_key_env_name(provider))
        .ok()
        .filter(|value| !value.is_empty())
}

pub fn ensure_initialized() -> Result<(), AppError> {
    ensure_dirs()?;
    let cfg_path = config_path()?;
    if !Path::new(&cfg_path).exists() {
        save_config(&AppConfig::default())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_rules_match_free_plan() {
        let quota = QuotaSettings::default();
        let free = quota.rule_for(Tier::Free);
        assert_eq!(free.trial_duration_days, 7);
        assert_eq!(free.total_message_cap, 50);
        assert_eq!(free.daily_message_cap, 15);
        assert_eq!(free.cooldown_seconds, 3);
        assert_eq!(quota.rule_for(Tier::Expired), free);
        assert_eq!(quota.rule_for(Tier::Tier3).daily_cap_paid, None);
    }

    #[test]
    fn api_key_env_name_uses_underscores() {
        assert_eq!(api_key_env_name(ProviderId::NightPersona), "NIGHT_PERSONA_API_KEY");
        assert_eq!(api_key_env_name(ProviderId::Fast), "FAST_API_KEY");
    }

    #[test]
    fn load_config_reads_partial_toml_over_defaults() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("config.toml");
        fs::write(
            &path,
            r#"
            [quota.tier1]
            trial_duration_days = 0
            total_message_cap = 0
            daily_message_cap = 0
            cooldown_seconds = 0
            daily_cap_paid = 200

            [providers.general]
            kind = "anthropic"
            model = "claude-3-5-haiku-latest"

            [providers.unknown]
            model = "ignored"
            "#,
        )
        .expect("write config");

        let cfg = load_config_from(&path).expect("load config");
        assert_eq!(cfg.quota.tier1.daily_cap_paid, Some(200));
        assert_eq!(cfg.quota.free, TierRule::free_default());
        assert_eq!(cfg.chain, ChainSettings::default());

        let entries = cfg.provider_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, ProviderId::General);
        assert_eq!(entries[0].1.kind, ProviderKind::Anthropic);
    }

    #[test]
    fn saved_config_loads_back() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("config.toml");
        let mut cfg = AppConfig::default();
        cfg.orchestrator.charge_restricted_refusal = true;
        cfg.providers.insert(
            "fast".into(),
            ProviderSettings {
                model: "llama-3.1-8b-instant".into(),
                fallback_model: Some("llama3-8b-8192".into()),
                ..Default::default()
            },
        );
        fs::write(&path, toml::to_string_pretty(&cfg).expect("serialize")).expect("write");

        assert_eq!(load_config_from(&path).expect("load config"), cfg);
    }
}
