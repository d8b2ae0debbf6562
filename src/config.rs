use crate::model::{Language, ReportType};
use anyhow::{Context, Result, anyhow, bail};
use chrono_tz::Tz;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use url::Url;

const APP_DIR: &str = ".mandalart-report";
const CONFIG_FILE: &str = "config.json";
const ENV_PREFIX: &str = "MANDALART_";

pub const DEFAULT_MODEL: &str = "sonar";
pub const DEFAULT_MAX_TOKENS: u32 = 2000;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_path: PathBuf,
    pub api_bind: String,
    pub api_port: u16,
    pub service_role_key: Option<String>,
    pub cron_secret: Option<String>,
    pub ai_api_base_url: String,
    pub ai_api_key: Option<String>,
    pub ai_model: String,
    pub ai_fallback_model: Option<String>,
    pub ai_max_tokens: u32,
    pub ai_temperature: f32,
    pub ai_timeout_seconds: u64,
    pub report_cache_enabled: bool,
    pub default_timezone: String,
    pub default_language: Language,
    pub report_workers: usize,
    pub weekly_report_cron: String,
    pub streak_warning_cron: String,
    pub comeback_cron: String,
    pub schedule_timezone: String,
    pub push_endpoint: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_root_dir().join("db").join("reports.db"),
            api_bind: "127.0.0.1".to_string(),
            api_port: 7891,
            service_role_key: None,
            cron_secret: None,
            ai_api_base_url: "https://api.perplexity.ai".to_string(),
            ai_api_key: None,
            ai_model: DEFAULT_MODEL.to_string(),
            ai_fallback_model: None,
            ai_max_tokens: DEFAULT_MAX_TOKENS,
            ai_temperature: DEFAULT_TEMPERATURE,
            ai_timeout_seconds: 60,
            report_cache_enabled: true,
            default_timezone: "Asia/Seoul".to_string(),
            default_language: Language::Ko,
            report_workers: 4,
            weekly_report_cron: "0 9 * * 1".to_string(),
            streak_warning_cron: "0 21 * * *".to_string(),
            comeback_cron: "0 10 * * *".to_string(),
            schedule_timezone: "Asia/Seoul".to_string(),
            push_endpoint: "https://exp.host/--/api/v2/push/send".to_string(),
        }
    }
}

impl Config {
    pub fn config_path() -> Result<PathBuf> {
        if let Ok(explicit) = std::env::var(format!("{ENV_PREFIX}CONFIG")) {
            if !explicit.trim().is_empty() {
                return Ok(expand_home(explicit.trim()));
            }
        }

        Ok(default_root_dir().join(CONFIG_FILE))
    }

    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Loads the file when present, otherwise defaults, then applies
    /// `MANDALART_*` environment overrides. Called once per invocation.
    pub fn resolve() -> Result<Self> {
        let config_path = Self::config_path()?;
        let mut config = if config_path.exists() {
            Self::load_from(&config_path)?
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;
        set_mode_600(&config_path)?;

        Ok(())
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        for key in SUPPORTED_KEYS {
            let env_key = format!("{ENV_PREFIX}{}", key.to_ascii_uppercase());
            let Some(value) = lookup(&env_key) else {
                continue;
            };
            // Only the fallback model may be cleared from the environment.
            if value.trim().is_empty() && key != "ai_fallback_model" {
                continue;
            }
            self.set_value(key, &value)
                .with_context(|| format!("Invalid value in {env_key}"))?;
        }

        Ok(())
    }

    pub fn ensure_bootstrap_files(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create DB directory: {}", parent.display()))?;
        }

        Ok(())
    }

    pub fn default_tz(&self) -> Result<Tz> {
        parse_timezone(&self.default_timezone)
    }

    pub fn schedule_tz(&self) -> Result<Tz> {
        parse_timezone(&self.schedule_timezone)
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let normalized = normalize_config_key(key);
        let trimmed = value.trim();

        match normalized {
            "db_path" => self.db_path = expand_home(trimmed),
            "api_bind" => self.api_bind = trimmed.to_string(),
            "api_port" => {
                self.api_port = trimmed
                    .parse::<u16>()
                    .map_err(|_| anyhow!("api_port must be a number"))?;
            }
            "service_role_key" => self.service_role_key = non_empty(trimmed),
            "cron_secret" => self.cron_secret = non_empty(trimmed),
            "ai_api_base_url" => {
                Url::parse(trimmed)
                    .with_context(|| format!("ai_api_base_url is not a valid URL: {trimmed}"))?;
                self.ai_api_base_url = trimmed.trim_end_matches('/').to_string();
            }
            "ai_api_key" => self.ai_api_key = non_empty(trimmed),
            "ai_model" => {
                if trimmed.is_empty() {
                    bail!("ai_model must not be empty");
                }
                self.ai_model = trimmed.to_string();
            }
            "ai_fallback_model" => self.ai_fallback_model = non_empty(trimmed),
            "ai_max_tokens" => {
                self.ai_max_tokens = trimmed
                    .parse::<u32>()
                    .map_err(|_| anyhow!("ai_max_tokens must be a number"))?
                    .max(1);
            }
            "ai_temperature" => {
                self.ai_temperature = parse_temperature(trimmed)?;
            }
            "ai_timeout_seconds" => {
                self.ai_timeout_seconds = trimmed
                    .parse::<u64>()
                    .map_err(|_| anyhow!("ai_timeout_seconds must be a number"))?
                    .max(5);
            }
            "report_cache_enabled" => {
                self.report_cache_enabled = trimmed
                    .parse::<bool>()
                    .map_err(|_| anyhow!("report_cache_enabled must be true/false"))?;
            }
            "default_timezone" => {
                parse_timezone(trimmed)?;
                self.default_timezone = trimmed.to_string();
            }
            "default_language" => {
                self.default_language = trimmed.parse::<Language>()?;
            }
            "report_workers" => {
                self.report_workers = trimmed
                    .parse::<usize>()
                    .map_err(|_| anyhow!("report_workers must be a number"))?
                    .clamp(1, 32);
            }
            "weekly_report_cron" => {
                crate::scheduler::parse_cron(trimmed)?;
                self.weekly_report_cron = trimmed.to_string();
            }
            "streak_warning_cron" => {
                crate::scheduler::parse_cron(trimmed)?;
                self.streak_warning_cron = trimmed.to_string();
            }
            "comeback_cron" => {
                crate::scheduler::parse_cron(trimmed)?;
                self.comeback_cron = trimmed.to_string();
            }
            "schedule_timezone" => {
                parse_timezone(trimmed)?;
                self.schedule_timezone = trimmed.to_string();
            }
            "push_endpoint" => {
                Url::parse(trimmed)
                    .with_context(|| format!("push_endpoint is not a valid URL: {trimmed}"))?;
                self.push_endpoint = trimmed.to_string();
            }
            _ => {
                bail!(
                    "Unsupported config key: {key}. Supported keys: {}",
                    SUPPORTED_KEYS.join(", ")
                );
            }
        }

        Ok(())
    }

    pub fn get_value(&self, key: &str) -> Option<String> {
        match normalize_config_key(key) {
            "db_path" => Some(self.db_path.display().to_string()),
            "api_bind" => Some(self.api_bind.clone()),
            "api_port" => Some(self.api_port.to_string()),
            "service_role_key" => Some(mask(self.service_role_key.as_deref())),
            "cron_secret" => Some(mask(self.cron_secret.as_deref())),
            "ai_api_base_url" => Some(self.ai_api_base_url.clone()),
            "ai_api_key" => Some(mask(self.ai_api_key.as_deref())),
            "ai_model" => Some(self.ai_model.clone()),
            "ai_fallback_model" => Some(
                self.ai_fallback_model
                    .clone()
                    .unwrap_or_else(|| "not_set".to_string()),
            ),
            "ai_max_tokens" => Some(self.ai_max_tokens.to_string()),
            "ai_temperature" => Some(self.ai_temperature.to_string()),
            "ai_timeout_seconds" => Some(self.ai_timeout_seconds.to_string()),
            "report_cache_enabled" => Some(self.report_cache_enabled.to_string()),
            "default_timezone" => Some(self.default_timezone.clone()),
            "default_language" => Some(self.default_language.to_string()),
            "report_workers" => Some(self.report_workers.to_string()),
            "weekly_report_cron" => Some(self.weekly_report_cron.clone()),
            "streak_warning_cron" => Some(self.streak_warning_cron.clone()),
            "comeback_cron" => Some(self.comeback_cron.clone()),
            "schedule_timezone" => Some(self.schedule_timezone.clone()),
            "push_endpoint" => Some(self.push_endpoint.clone()),
            _ => None,
        }
    }
}

const SUPPORTED_KEYS: [&str; 21] = [
    "db_path",
    "api_bind",
    "api_port",
    "service_role_key",
    "cron_secret",
    "ai_api_base_url",
    "ai_api_key",
    "ai_model",
    "ai_fallback_model",
    "ai_max_tokens",
    "ai_temperature",
    "ai_timeout_seconds",
    "report_cache_enabled",
    "default_timezone",
    "default_language",
    "report_workers",
    "weekly_report_cron",
    "streak_warning_cron",
    "comeback_cron",
    "schedule_timezone",
    "push_endpoint",
];

fn normalize_config_key(key: &str) -> &str {
    match key {
        "db_path" | "db.path" => "db_path",
        "api_bind" | "api.bind" => "api_bind",
        "api_port" | "api.port" => "api_port",
        "service_role_key" | "auth.service_role_key" => "service_role_key",
        "cron_secret" | "auth.cron_secret" => "cron_secret",
        "ai_api_base_url" | "ai.base_url" => "ai_api_base_url",
        "ai_api_key" | "ai.api_key" => "ai_api_key",
        "ai_model" | "ai.model" => "ai_model",
        "ai_fallback_model" | "ai.fallback_model" => "ai_fallback_model",
        "ai_max_tokens" | "ai.max_tokens" => "ai_max_tokens",
        "ai_temperature" | "ai.temperature" => "ai_temperature",
        "ai_timeout_seconds" | "ai.timeout_seconds" => "ai_timeout_seconds",
        "report_cache_enabled" | "report.cache_enabled" => "report_cache_enabled",
        "default_timezone" | "report.timezone" => "default_timezone",
        "default_language" | "report.language" => "default_language",
        "report_workers" | "report.workers" => "report_workers",
        "weekly_report_cron" | "schedule.weekly_report" => "weekly_report_cron",
        "streak_warning_cron" | "schedule.streak_warning" => "streak_warning_cron",
        "comeback_cron" | "schedule.comeback" => "comeback_cron",
        "schedule_timezone" | "schedule.timezone" => "schedule_timezone",
        "push_endpoint" | "push.endpoint" => "push_endpoint",
        _ => key,
    }
}

/// Model parameters for one report type, resolved once per invocation.
///
/// Lookup order for every field: `REPORT_<TYPE>_<KEY>`, then `REPORT_<KEY>`,
/// then the config file, then the hardcoded default.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSettings {
    pub model: String,
    pub fallback_model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl GenerationSettings {
    pub fn resolve<F>(config: &Config, report_type: ReportType, env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let segment = report_type.env_segment();
        let layered = |key: &str| {
            env(&format!("REPORT_{segment}_{key}")).or_else(|| env(&format!("REPORT_{key}")))
        };

        let model = layered("MODEL")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| config.ai_model.clone());

        // An explicitly empty env value disables the fallback.
        let fallback_model = match layered("FALLBACK_MODEL") {
            Some(value) => non_empty(value.trim()),
            None => config.ai_fallback_model.clone(),
        }
        .filter(|fallback| fallback != &model);

        let max_tokens = layered("MAX_TOKENS")
            .and_then(|value| value.trim().parse::<u32>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(config.ai_max_tokens);

        let temperature = layered("TEMPERATURE")
            .and_then(|value| parse_temperature(value.trim()).ok())
            .unwrap_or(config.ai_temperature);

        Self {
            model,
            fallback_model,
            max_tokens,
            temperature,
        }
    }

    pub fn distinct_fallback(&self) -> Option<&str> {
        self.fallback_model
            .as_deref()
            .filter(|fallback| !fallback.is_empty() && *fallback != self.model)
    }
}

pub fn parse_timezone(value: &str) -> Result<Tz> {
    value
        .trim()
        .parse::<Tz>()
        .map_err(|_| anyhow!("Invalid IANA timezone: {value}. Example: Asia/Seoul"))
}

fn parse_temperature(value: &str) -> Result<f32> {
    let parsed = value
        .parse::<f32>()
        .map_err(|_| anyhow!("ai_temperature must be a number"))?;
    if !(0.0..=2.0).contains(&parsed) {
        bail!("ai_temperature must be between 0.0 and 2.0");
    }
    Ok(parsed)
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn mask(value: Option<&str>) -> String {
    value
        .map(|_| "***set***".to_string())
        .unwrap_or_else(|| "not_set".to_string())
}

pub fn expand_home(raw: &str) -> PathBuf {
    raw.strip_prefix("~/")
        .and_then(|stripped| home_dir().map(|home| home.join(stripped)))
        .unwrap_or_else(|| PathBuf::from(raw))
}

fn default_root_dir() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

fn set_mode_600(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to set file permissions: {}", path.display()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn type_specific_env_wins_over_global() {
        let config = Config::default();
        let env = env_from(&[
            ("REPORT_WEEKLY_MODEL", "sonar-pro"),
            ("REPORT_MODEL", "sonar-reasoning"),
            ("REPORT_MAX_TOKENS", "3000"),
        ]);

        let weekly = GenerationSettings::resolve(&config, ReportType::Weekly, &env);
        assert_eq!(weekly.model, "sonar-pro");
        assert_eq!(weekly.max_tokens, 3000);

        let diagnosis = GenerationSettings::resolve(&config, ReportType::Diagnosis, &env);
        assert_eq!(diagnosis.model, "sonar-reasoning");
        assert_eq!(diagnosis.temperature, DEFAULT_TEMPERATURE);
    }

    #[test]
    fn config_file_values_apply_without_env() {
        let config = Config {
            ai_model: "gpt-4o-mini".to_string(),
            ai_fallback_model: Some("gpt-4o".to_string()),
            ai_temperature: 0.3,
            ..Config::default()
        };

        let settings = GenerationSettings::resolve(&config, ReportType::Monthly, |_| None);
        assert_eq!(settings.model, "gpt-4o-mini");
        assert_eq!(settings.fallback_model.as_deref(), Some("gpt-4o"));
        assert_eq!(settings.temperature, 0.3);
    }

    #[test]
    fn fallback_equal_to_primary_is_dropped() {
        let config = Config {
            ai_fallback_model: Some(DEFAULT_MODEL.to_string()),
            ..Config::default()
        };
        let settings = GenerationSettings::resolve(&config, ReportType::Weekly, |_| None);
        assert_eq!(settings.fallback_model, None);
    }

    #[test]
    fn empty_env_fallback_disables_configured_fallback() {
        let config = Config {
            ai_fallback_model: Some("sonar-pro".to_string()),
            ..Config::default()
        };
        let env = env_from(&[("REPORT_DIAGNOSIS_FALLBACK_MODEL", "")]);
        let settings = GenerationSettings::resolve(&config, ReportType::Diagnosis, env);
        assert_eq!(settings.fallback_model, None);
    }

    #[test]
    fn empty_process_env_clears_config_fallback() {
        let mut config = Config {
            ai_fallback_model: Some("sonar-pro".to_string()),
            ai_api_key: Some("sk-file".to_string()),
            ..Config::default()
        };
        config
            .apply_env(env_from(&[
                ("MANDALART_AI_FALLBACK_MODEL", ""),
                ("MANDALART_AI_API_KEY", " "),
            ]))
            .unwrap();

        assert_eq!(config.ai_fallback_model, None);
        assert_eq!(config.ai_api_key.as_deref(), Some("sk-file"));
    }

    #[test]
    fn invalid_env_numbers_fall_through() {
        let config = Config::default();
        let env = env_from(&[("REPORT_TEMPERATURE", "hot"), ("REPORT_MAX_TOKENS", "0")]);
        let settings = GenerationSettings::resolve(&config, ReportType::Insight, env);
        assert_eq!(settings.temperature, DEFAULT_TEMPERATURE);
        assert_eq!(settings.max_tokens, DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn set_value_validates_and_masks_secrets() {
        let mut config = Config::default();
        config.set_value("auth.cron_secret", "s3cret").unwrap();
        assert_eq!(config.get_value("cron_secret").as_deref(), Some("***set***"));

        assert!(config.set_value("report.timezone", "Mars/Olympus").is_err());
        config.set_value("report.timezone", "America/New_York").unwrap();
        assert_eq!(config.default_timezone, "America/New_York");

        assert!(config.set_value("ai.temperature", "3.5").is_err());
        assert!(config.set_value("unknown.key", "1").is_err());
    }

    #[test]
    fn env_overrides_use_prefixed_keys() {
        let mut config = Config::default();
        let env = env_from(&[
            ("MANDALART_AI_MODEL", "sonar-pro"),
            ("MANDALART_REPORT_WORKERS", "64"),
            ("MANDALART_REPORT_CACHE_ENABLED", "false"),
        ]);
        config.apply_env(env).unwrap();
        assert_eq!(config.ai_model, "sonar-pro");
        assert_eq!(config.report_workers, 32);
        assert!(!config.report_cache_enabled);
    }
}
