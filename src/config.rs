use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{info, warn};

const DEFAULT_CONFIG_PATH: &str = "/etc/metric-groups/config.yaml";

/// Top-level configuration for a grouping engine host.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Remote grouping API location and request budgets.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "ApiConfig::default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub bk_biz_id: i64,
    #[serde(default)]
    pub time_series_group_id: i64,
    #[serde(default = "ApiConfig::default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(default = "ApiConfig::default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl ApiConfig {
    fn default_base_url() -> String {
        "http://127.0.0.1:8000/rest/v2".to_string()
    }

    const fn default_request_timeout() -> Duration {
        Duration::from_secs(10)
    }

    const fn default_connect_timeout() -> Duration {
        Duration::from_secs(3)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            bk_biz_id: 0,
            time_series_group_id: 0,
            request_timeout: Self::default_request_timeout(),
            connect_timeout: Self::default_connect_timeout(),
        }
    }
}

/// Editing session behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Follow-up saves issued when edits land while a save is in flight.
    #[serde(default = "SessionConfig::default_max_resave_attempts")]
    pub max_resave_attempts: u32,
}

impl SessionConfig {
    const fn default_max_resave_attempts() -> u32 {
        3
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_resave_attempts: Self::default_max_resave_attempts(),
        }
    }
}

/// Load configuration from a YAML file, falling back to defaults + env overrides.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let target_path = if let Some(path) = path {
        path.to_path_buf()
    } else if let Ok(env_path) = env::var("METRIC_GROUPS_CONFIG") {
        PathBuf::from(env_path)
    } else {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    };

    let mut config = match try_parse_file(&target_path)? {
        Some(cfg) => {
            info!(path = %target_path.display(), "loaded configuration");
            cfg
        }
        None => {
            warn!(path = %target_path.display(), "config file not found; using built-in defaults");
            EngineConfig::default()
        }
    };

    apply_env_overrides(&mut config)?;
    validate(&config)?;
    Ok(config)
}

fn try_parse_file(path: &Path) -> Result<Option<EngineConfig>> {
    match fs::read_to_string(path) {
        Ok(raw) => {
            let cfg = serde_yaml::from_str(&raw)
                .with_context(|| format!("failed to parse YAML config at {}", path.display()))?;
            Ok(Some(cfg))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read config file at {}", path.display()))
        }
    }
}

fn apply_env_overrides(config: &mut EngineConfig) -> Result<()> {
    if let Ok(base_url) = env::var("METRIC_GROUPS_API_BASE") {
        if !base_url.trim().is_empty() {
            config.api.base_url = base_url.trim().to_string();
        }
    }

    if let Some(biz_id) = parse_env_i64("METRIC_GROUPS_BIZ_ID")? {
        config.api.bk_biz_id = biz_id;
    }

    if let Some(group_id) = parse_env_i64("METRIC_GROUPS_TS_GROUP_ID")? {
        config.api.time_series_group_id = group_id;
    }

    Ok(())
}

fn parse_env_i64(key: &str) -> Result<Option<i64>> {
    match env::var(key) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("environment variable {key} must be an integer")),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn validate(config: &EngineConfig) -> Result<()> {
    let base_url = config.api.base_url.trim();
    if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
        bail!("api.base_url must be an http(s) URL, got `{base_url}`");
    }
    if config.api.time_series_group_id <= 0 {
        bail!(
            "Missing time series group. Set api.time_series_group_id in YAML or the METRIC_GROUPS_TS_GROUP_ID environment variable."
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(name: &str, body: &str) -> PathBuf {
        let dir = env::temp_dir().join("metric_groups_config_test");
        fs::create_dir_all(&dir).expect("temp dir");
        let path = dir.join(name);
        fs::write(&path, body).expect("write config");
        path
    }

    #[test]
    fn yaml_fields_and_durations_parse() {
        let path = write_config(
            "full.yaml",
            "api:\n  base_url: https://monitor.example.com/rest/v2\n  bk_biz_id: 2\n  time_series_group_id: 17\n  request_timeout: 2s 500ms\nsession:\n  max_resave_attempts: 1\n",
        );
        let config = try_parse_file(&path).expect("parse").expect("present");
        assert_eq!(config.api.bk_biz_id, 2);
        assert_eq!(config.api.time_series_group_id, 17);
        assert_eq!(config.api.request_timeout, Duration::from_millis(2_500));
        assert_eq!(config.api.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.session.max_resave_attempts, 1);
        validate(&config).expect("valid");
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let path = env::temp_dir().join("metric_groups_config_test/does-not-exist.yaml");
        assert!(try_parse_file(&path).expect("no error").is_none());
    }

    #[test]
    fn malformed_yaml_reports_path() {
        let path = write_config("broken.yaml", "api: [unterminated\n");
        let err = try_parse_file(&path).unwrap_err();
        assert!(err.to_string().contains("broken.yaml"), "{err}");
    }

    #[test]
    fn validation_requires_group_and_http_url() {
        let mut config = EngineConfig::default();
        assert!(validate(&config).is_err(), "group id 0 must be rejected");

        config.api.time_series_group_id = 5;
        validate(&config).expect("defaults plus group id are valid");

        config.api.base_url = "ftp://nope".into();
        assert!(validate(&config).is_err());
    }
}
