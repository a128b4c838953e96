//! Daemon configuration: one TOML file, every field defaulted, validated
//! before any module starts.

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::core::budget::{BudgetSettings, Tier};
use crate::core::llm::backend::ModelBackend;
use crate::core::scheduler::ActiveHours;

pub const CONFIG_ENV: &str = "NIGHTSHIFT_CONFIG";
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const LOCAL_BASE_URL: &str = "http://localhost:11434";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{field}: {message}")]
    Invalid { field: &'static str, message: String },
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.into(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    ApiKey,
    Oauth,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_active_start")]
    pub active_start_hour: u32,
    #[serde(default = "default_active_end")]
    pub active_end_hour: u32,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_session_cap")]
    pub session_cap_usd: f64,
    #[serde(default)]
    pub global_cap_usd: Option<f64>,
    #[serde(default = "default_thresholds")]
    pub alert_thresholds: Vec<u32>,
    #[serde(default = "default_project")]
    pub project: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    #[serde(default = "default_model")]
    pub model: String,
    /// Per-tier model overrides, e.g. `background = "claude-3-5-haiku-latest"`.
    #[serde(default)]
    pub tiers: HashMap<String, String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_oauth_env")]
    pub oauth_token_env: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Git repository the agent works in. Without one, changes are not
    /// committed and tools run inside `<data_dir>/workspace`.
    #[serde(default)]
    pub repo_path: Option<PathBuf>,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_gate_timeout")]
    pub gate_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_browser")]
    pub browser_command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default)]
    pub authorized_chat_id: Option<i64>,
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".nightshift"))
        .unwrap_or_else(|| PathBuf::from(".nightshift"))
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_active_start() -> u32 {
    22
}
fn default_active_end() -> u32 {
    6
}
fn default_heartbeat() -> u64 {
    15
}
fn default_session_cap() -> f64 {
    5.0
}
fn default_thresholds() -> Vec<u32> {
    vec![50, 75, 90]
}
fn default_project() -> String {
    "default".to_string()
}
fn default_backend() -> BackendKind {
    BackendKind::ApiKey
}
fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}
fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}
fn default_oauth_env() -> String {
    "CLAUDE_CODE_OAUTH_TOKEN".to_string()
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_branch() -> String {
    "nightshift/work".to_string()
}
fn default_gate_timeout() -> u64 {
    600
}
fn default_tool_timeout() -> u64 {
    60
}
fn default_browser() -> String {
    "chromium".to_string()
}
fn default_token_env() -> String {
    "TELEGRAM_BOT_TOKEN".to_string()
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            active_start_hour: default_active_start(),
            active_end_hour: default_active_end(),
            heartbeat_minutes: default_heartbeat(),
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            session_cap_usd: default_session_cap(),
            global_cap_usd: None,
            alert_thresholds: default_thresholds(),
            project: default_project(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            model: default_model(),
            tiers: HashMap::new(),
            base_url: None,
            api_key_env: default_api_key_env(),
            oauth_token_env: default_oauth_env(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            repo_path: None,
            branch: default_branch(),
            gate_timeout_secs: default_gate_timeout(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_tool_timeout(),
            browser_command: default_browser(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token_env: default_token_env(),
            authorized_chat_id: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            schedule: ScheduleConfig::default(),
            budget: BudgetConfig::default(),
            model: ModelConfig::default(),
            workspace: WorkspaceConfig::default(),
            tools: ToolsConfig::default(),
            chat: ChatConfig::default(),
        }
    }
}

fn non_empty_env(env: &dyn Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    env(name).filter(|v| !v.trim().is_empty())
}

impl Config {
    /// `--config` wins, then `$NIGHTSHIFT_CONFIG`, then `~/.nightshift/config.toml`.
    pub fn resolve_path(explicit: Option<&str>) -> PathBuf {
        explicit
            .map(PathBuf::from)
            .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
            .unwrap_or_else(|| default_data_dir().join("config.toml"))
    }

    /// A missing file means defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        self.schedule
            .timezone
            .parse::<Tz>()
            .map_err(|_| invalid("schedule.timezone", format!("unknown timezone '{}'", self.schedule.timezone)))
    }

    /// Field-level checks, including that required secrets are present in
    /// the environment.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_with(&|name| std::env::var(name).ok())
    }

    pub fn validate_with(&self, env: &dyn Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let s = &self.schedule;
        if s.active_start_hour > 23 {
            return Err(invalid("schedule.active_start_hour", "must be 0-23"));
        }
        if s.active_end_hour > 23 {
            return Err(invalid("schedule.active_end_hour", "must be 0-23"));
        }
        if s.heartbeat_minutes < 1 {
            return Err(invalid("schedule.heartbeat_minutes", "must be at least 1"));
        }
        self.timezone()?;

        let b = &self.budget;
        if !(b.session_cap_usd > 0.0) {
            return Err(invalid("budget.session_cap_usd", "must be greater than 0"));
        }
        if b.global_cap_usd.is_some_and(|c| !(c > 0.0)) {
            return Err(invalid("budget.global_cap_usd", "must be greater than 0"));
        }
        if let Some(t) = b.alert_thresholds.iter().find(|t| !(1..=100).contains(*t)) {
            return Err(invalid("budget.alert_thresholds", format!("{} is not within 1-100", t)));
        }

        if !(30..=120).contains(&self.tools.timeout_secs) {
            return Err(invalid("tools.timeout_secs", "must be 30-120"));
        }
        if self.workspace.gate_timeout_secs == 0 {
            return Err(invalid("workspace.gate_timeout_secs", "must be greater than 0"));
        }
        if self.model.model.trim().is_empty() {
            return Err(invalid("model.model", "must not be empty"));
        }
        self.tier_models()?;
        if self.model.max_tokens == 0 {
            return Err(invalid("model.max_tokens", "must be greater than 0"));
        }
        match self.model.backend {
            BackendKind::ApiKey if non_empty_env(env, &self.model.api_key_env).is_none() => {
                return Err(invalid(
                    "model.api_key_env",
                    format!("environment variable {} is not set", self.model.api_key_env),
                ));
            }
            BackendKind::Oauth if non_empty_env(env, &self.model.oauth_token_env).is_none() => {
                return Err(invalid(
                    "model.oauth_token_env",
                    format!("environment variable {} is not set", self.model.oauth_token_env),
                ));
            }
            _ => {}
        }

        if self.chat.enabled {
            if non_empty_env(env, &self.chat.token_env).is_none() {
                return Err(invalid(
                    "chat.token_env",
                    format!("environment variable {} is not set", self.chat.token_env),
                ));
            }
            if self.chat.authorized_chat_id.is_none() {
                return Err(invalid("chat.authorized_chat_id", "required when chat is enabled"));
            }
        }
        Ok(())
    }

    pub fn model_backend(&self) -> Result<ModelBackend, ConfigError> {
        self.model_backend_with(&|name| std::env::var(name).ok())
    }

    pub fn model_backend_with(&self, env: &dyn Fn(&str) -> Option<String>) -> Result<ModelBackend, ConfigError> {
        let m = &self.model;
        Ok(match m.backend {
            BackendKind::ApiKey => ModelBackend::ApiKey {
                api_key: non_empty_env(env, &m.api_key_env)
                    .ok_or_else(|| invalid("model.api_key_env", format!("{} is not set", m.api_key_env)))?,
                base_url: m.base_url.clone().unwrap_or_else(|| ANTHROPIC_BASE_URL.to_string()),
            },
            BackendKind::Oauth => ModelBackend::OAuth {
                token: non_empty_env(env, &m.oauth_token_env)
                    .ok_or_else(|| invalid("model.oauth_token_env", format!("{} is not set", m.oauth_token_env)))?,
                base_url: m.base_url.clone().unwrap_or_else(|| ANTHROPIC_BASE_URL.to_string()),
            },
            BackendKind::Local => ModelBackend::Local {
                base_url: m.base_url.clone().unwrap_or_else(|| LOCAL_BASE_URL.to_string()),
                api_key: non_empty_env(env, &m.api_key_env),
            },
        })
    }

    pub fn tier_models(&self) -> Result<HashMap<Tier, String>, ConfigError> {
        self.model
            .tiers
            .iter()
            .map(|(name, model)| {
                Tier::parse(name)
                    .map(|tier| (tier, model.clone()))
                    .ok_or_else(|| invalid("model.tiers", format!("unknown tier '{}'", name)))
            })
            .collect()
    }

    pub fn active_hours(&self) -> Result<ActiveHours, ConfigError> {
        Ok(ActiveHours {
            tz: self.timezone()?,
            start_hour: self.schedule.active_start_hour,
            end_hour: self.schedule.active_end_hour,
        })
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.schedule.heartbeat_minutes * 60)
    }

    pub fn budget_settings(&self) -> BudgetSettings {
        BudgetSettings {
            project: self.budget.project.clone(),
            session_cap_usd: self.budget.session_cap_usd,
            global_cap_usd: self.budget.global_cap_usd,
            alert_thresholds: self.budget.alert_thresholds.clone(),
        }
    }

    /// Root the file tools are confined to.
    pub fn work_root(&self) -> PathBuf {
        self.workspace
            .repo_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("workspace"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_with(vars: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |name| {
            vars.iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
        }
    }

    fn field_of(err: ConfigError) -> &'static str {
        match err {
            ConfigError::Invalid { field, .. } => field,
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [schedule]
            timezone = "Europe/Berlin"
            active_start_hour = 23
            active_end_hour = 7

            [model]
            backend = "local"
            base_url = "http://127.0.0.1:8080"

            [model.tiers]
            background = "qwen2.5-7b"
            "#,
        )
        .unwrap();
        assert_eq!(config.schedule.heartbeat_minutes, 15);
        assert_eq!(config.budget.alert_thresholds, vec![50, 75, 90]);
        assert_eq!(
            config.tier_models().unwrap().get(&Tier::Background).map(String::as_str),
            Some("qwen2.5-7b")
        );
        assert!(config.validate_with(&env_with(&[])).is_ok());

        match config.model_backend_with(&env_with(&[])).unwrap() {
            ModelBackend::Local { base_url, api_key } => {
                assert_eq!(base_url, "http://127.0.0.1:8080");
                assert!(api_key.is_none());
            }
            other => panic!("unexpected backend {:?}", other),
        }
    }

    #[test]
    fn validation_names_the_field() {
        let env = env_with(&[("ANTHROPIC_API_KEY", "sk-test")]);
        assert!(Config::default().validate_with(&env).is_ok());

        let mut c = Config::default();
        c.schedule.active_end_hour = 24;
        assert_eq!(field_of(c.validate_with(&env).unwrap_err()), "schedule.active_end_hour");

        let mut c = Config::default();
        c.schedule.timezone = "Mars/Olympus".to_string();
        assert_eq!(field_of(c.validate_with(&env).unwrap_err()), "schedule.timezone");

        let mut c = Config::default();
        c.budget.session_cap_usd = 0.0;
        assert_eq!(field_of(c.validate_with(&env).unwrap_err()), "budget.session_cap_usd");

        let mut c = Config::default();
        c.budget.alert_thresholds = vec![50, 150];
        assert_eq!(field_of(c.validate_with(&env).unwrap_err()), "budget.alert_thresholds");

        let mut c = Config::default();
        c.tools.timeout_secs = 5;
        assert_eq!(field_of(c.validate_with(&env).unwrap_err()), "tools.timeout_secs");

        let mut c = Config::default();
        c.model.tiers.insert("nightly".to_string(), "m".to_string());
        assert_eq!(field_of(c.validate_with(&env).unwrap_err()), "model.tiers");

        let mut c = Config::default();
        c.chat.enabled = true;
        assert_eq!(field_of(c.validate_with(&env).unwrap_err()), "chat.token_env");

        assert_eq!(
            field_of(Config::default().validate_with(&env_with(&[])).unwrap_err()),
            "model.api_key_env"
        );
    }

    #[test]
    fn oauth_backend_reads_token_env() {
        let mut c = Config::default();
        c.model.backend = BackendKind::Oauth;
        let backend = c
            .model_backend_with(&env_with(&[("CLAUDE_CODE_OAUTH_TOKEN", "tok")]))
            .unwrap();
        assert!(matches!(backend, ModelBackend::OAuth { ref token, .. } if token == "tok"));
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let text = Config::default().to_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.schedule.active_start_hour, 22);
        assert_eq!(parsed.workspace.branch, "nightshift/work");
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "schedule = 3").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
        assert!(Config::load(&dir.path().join("missing.toml")).is_ok());
    }
}
