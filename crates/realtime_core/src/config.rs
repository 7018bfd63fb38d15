use std::{collections::HashMap, fs, path::Path, time::Duration};

use anyhow::{bail, Context};
use pubsub::TokenConfig;
use serde::Deserialize;

use crate::{
    offline_queue::OfflineQueueConfig,
    state_machine::{BackoffPolicy, DEFAULT_MAX_RECONNECT_ATTEMPTS},
};

pub const DEFAULT_CONFIG_FILE: &str = "realtime.toml";
pub const CONFIG_PATH_ENV: &str = "REALTIME_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RealtimeSettings {
    pub connection_timeout_ms: u64,
    pub reconnect_backoff_ms: Vec<u64>,
    pub max_reconnect_attempts: u32,
    pub health_check_interval_ms: u64,
    pub latency_warning_ms: u64,
    pub cleanup_timeout_ms: u64,
    pub offline_queue_capacity: usize,
    pub offline_message_ttl_secs: u64,
    pub duplicate_window_secs: u64,
    pub delivery_retention_secs: u64,
    pub token_api_key: String,
    pub token_api_secret: String,
    pub token_ttl_seconds: i64,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            connection_timeout_ms: 10_000,
            reconnect_backoff_ms: vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000],
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            health_check_interval_ms: 30_000,
            latency_warning_ms: 5_000,
            cleanup_timeout_ms: 5_000,
            offline_queue_capacity: 100,
            offline_message_ttl_secs: 24 * 60 * 60,
            duplicate_window_secs: 30,
            delivery_retention_secs: 24 * 60 * 60,
            token_api_key: "devkey".into(),
            token_api_secret: "devsecret".into(),
            token_ttl_seconds: 3600,
        }
    }
}

impl RealtimeSettings {
    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let settings: Self = toml::from_str(raw).context("invalid realtime settings")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connection_timeout_ms == 0 {
            bail!("connection_timeout_ms must be positive");
        }
        if self.reconnect_backoff_ms.is_empty() {
            bail!("reconnect_backoff_ms must list at least one delay");
        }
        if self.health_check_interval_ms == 0 {
            bail!("health_check_interval_ms must be positive");
        }
        if self.offline_queue_capacity == 0 {
            bail!("offline_queue_capacity must be positive");
        }
        if self.offline_message_ttl_secs == 0 {
            bail!("offline_message_ttl_secs must be positive");
        }
        if self.token_api_secret.is_empty() {
            bail!("token_api_secret must not be empty");
        }
        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn latency_warning(&self) -> Duration {
        Duration::from_millis(self.latency_warning_ms)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup_timeout_ms)
    }

    pub fn duplicate_window(&self) -> Duration {
        Duration::from_secs(self.duplicate_window_secs)
    }

    pub fn delivery_retention(&self) -> Duration {
        Duration::from_secs(self.delivery_retention_secs)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            self.reconnect_backoff_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
            self.max_reconnect_attempts,
        )
    }

    pub fn offline_queue(&self) -> OfflineQueueConfig {
        OfflineQueueConfig {
            capacity: self.offline_queue_capacity,
            ttl: Duration::from_secs(self.offline_message_ttl_secs),
        }
    }

    pub fn token_config(&self) -> TokenConfig {
        TokenConfig {
            api_key: self.token_api_key.clone(),
            api_secret: self.token_api_secret.clone(),
            ttl_seconds: self.token_ttl_seconds,
        }
    }

    fn apply_overrides(&mut self, vars: &HashMap<String, String>) {
        fn parse_into<T: std::str::FromStr>(vars: &HashMap<String, String>, key: &str, slot: &mut T) {
            if let Some(parsed) = vars.get(key).and_then(|v| v.trim().parse::<T>().ok()) {
                *slot = parsed;
            }
        }

        parse_into(vars, "APP__CONNECTION_TIMEOUT_MS", &mut self.connection_timeout_ms);
        parse_into(vars, "APP__MAX_RECONNECT_ATTEMPTS", &mut self.max_reconnect_attempts);
        parse_into(vars, "APP__HEALTH_CHECK_INTERVAL_MS", &mut self.health_check_interval_ms);
        parse_into(vars, "APP__LATENCY_WARNING_MS", &mut self.latency_warning_ms);
        parse_into(vars, "APP__CLEANUP_TIMEOUT_MS", &mut self.cleanup_timeout_ms);
        parse_into(vars, "APP__OFFLINE_QUEUE_CAPACITY", &mut self.offline_queue_capacity);
        parse_into(vars, "APP__OFFLINE_MESSAGE_TTL_SECS", &mut self.offline_message_ttl_secs);
        parse_into(vars, "APP__DUPLICATE_WINDOW_SECS", &mut self.duplicate_window_secs);
        parse_into(vars, "APP__DELIVERY_RETENTION_SECS", &mut self.delivery_retention_secs);
        parse_into(vars, "APP__TOKEN_TTL_SECONDS", &mut self.token_ttl_seconds);

        if let Some(raw) = vars.get("APP__RECONNECT_BACKOFF_MS") {
            let parsed: Result<Vec<u64>, _> =
                raw.split(',').map(|part| part.trim().parse::<u64>()).collect();
            if let Ok(delays) = parsed {
                self.reconnect_backoff_ms = delays;
            }
        }
        if let Some(v) = vars.get("APP__TOKEN_API_KEY") {
            self.token_api_key = v.clone();
        }
        if let Some(v) = vars.get("APP__TOKEN_API_SECRET") {
            self.token_api_secret = v.clone();
        }
    }
}

/// Defaults, then the settings file, then `APP__*` environment overrides.
pub fn load_settings() -> anyhow::Result<RealtimeSettings> {
    let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.into());
    let vars: HashMap<String, String> = std::env::vars()
        .filter(|(key, _)| key.starts_with("APP__"))
        .collect();
    load_settings_from(Path::new(&path), &vars)
}

pub fn load_settings_from(
    path: &Path,
    vars: &HashMap<String, String>,
) -> anyhow::Result<RealtimeSettings> {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => toml::from_str::<RealtimeSettings>(&raw)
            .with_context(|| format!("failed to parse settings file '{}'", path.display()))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => RealtimeSettings::default(),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read settings file '{}'", path.display()))
        }
    };
    settings.apply_overrides(vars);
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
