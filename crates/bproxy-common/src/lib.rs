use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use bproxy_protocol::StreamingMode;

pub const DEFAULT_API_KEY: &str = "123456";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("API_KEYS must contain at least one non-empty key")]
    EmptyApiKeys,
}

/// Final, merged process configuration.
///
/// Merge order: CLI > ENV > built-in defaults. Malformed numeric values in
/// the environment fall back to the default for that key rather than
/// aborting startup.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyConfig {
    pub host: String,
    pub http_port: u16,
    pub ws_port: u16,
    pub streaming_mode: StreamingMode,
    pub failure_threshold: u32,
    pub switch_on_uses: u32,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub immediate_switch_status_codes: Vec<u16>,
    #[serde(skip)]
    pub api_keys: Vec<String>,
    pub initial_auth_index: u32,
    pub camoufox_executable: Option<PathBuf>,
    pub auth_dir: Option<PathBuf>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 7860,
            ws_port: 9998,
            streaming_mode: StreamingMode::Real,
            failure_threshold: 3,
            switch_on_uses: 40,
            max_retries: 1,
            retry_delay_ms: 2000,
            immediate_switch_status_codes: vec![429, 503],
            api_keys: vec![DEFAULT_API_KEY.to_string()],
            initial_auth_index: 1,
            camoufox_executable: None,
            auth_dir: None,
        }
    }
}

impl ProxyConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// True when no API_KEYS were supplied and the documented default is in
    /// effect; bootstrap logs a notice in that case.
    pub fn uses_default_api_key(&self) -> bool {
        self.api_keys.len() == 1 && self.api_keys[0] == DEFAULT_API_KEY
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_keys.iter().all(|key| key.trim().is_empty()) {
            return Err(ConfigError::EmptyApiKeys);
        }
        Ok(())
    }
}

/// Optional layer used when merging configuration sources.
#[derive(Debug, Clone, Default)]
pub struct ProxyConfigPatch {
    pub host: Option<String>,
    pub http_port: Option<u16>,
    pub ws_port: Option<u16>,
    pub streaming_mode: Option<StreamingMode>,
    pub failure_threshold: Option<u32>,
    pub switch_on_uses: Option<u32>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub immediate_switch_status_codes: Option<Vec<u16>>,
    pub api_keys: Option<Vec<String>>,
    pub initial_auth_index: Option<u32>,
    pub camoufox_executable: Option<PathBuf>,
    pub auth_dir: Option<PathBuf>,
}

impl ProxyConfigPatch {
    /// Read every documented key from the environment. Unset keys stay
    /// `None`; set-but-unparsable keys are logged and also stay `None`, so
    /// the default wins downstream.
    pub fn from_env() -> Self {
        Self {
            host: env_string("HOST"),
            http_port: env_parse("PORT"),
            ws_port: env_parse("WS_PORT"),
            streaming_mode: env_string("STREAMING_MODE").and_then(|raw| {
                let parsed = StreamingMode::parse(&raw);
                if parsed.is_none() {
                    tracing::warn!(value = %raw, "invalid STREAMING_MODE, using default");
                }
                parsed
            }),
            failure_threshold: env_parse("FAILURE_THRESHOLD"),
            switch_on_uses: env_parse("SWITCH_ON_USES"),
            max_retries: env_parse("MAX_RETRIES"),
            retry_delay_ms: env_parse("RETRY_DELAY"),
            immediate_switch_status_codes: env_string("IMMEDIATE_SWITCH_STATUS_CODES")
                .map(|raw| parse_status_list(&raw)),
            api_keys: env_string("API_KEYS").map(|raw| parse_key_list(&raw)),
            initial_auth_index: env_parse("INITIAL_AUTH_INDEX"),
            camoufox_executable: env_string("CAMOUFOX_EXECUTABLE_PATH").map(PathBuf::from),
            auth_dir: env_string("AUTH_DIR").map(PathBuf::from),
        }
    }

    pub fn overlay(&mut self, other: ProxyConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.http_port.is_some() {
            self.http_port = other.http_port;
        }
        if other.ws_port.is_some() {
            self.ws_port = other.ws_port;
        }
        if other.streaming_mode.is_some() {
            self.streaming_mode = other.streaming_mode;
        }
        if other.failure_threshold.is_some() {
            self.failure_threshold = other.failure_threshold;
        }
        if other.switch_on_uses.is_some() {
            self.switch_on_uses = other.switch_on_uses;
        }
        if other.max_retries.is_some() {
            self.max_retries = other.max_retries;
        }
        if other.retry_delay_ms.is_some() {
            self.retry_delay_ms = other.retry_delay_ms;
        }
        if other.immediate_switch_status_codes.is_some() {
            self.immediate_switch_status_codes = other.immediate_switch_status_codes;
        }
        if other.api_keys.is_some() {
            self.api_keys = other.api_keys;
        }
        if other.initial_auth_index.is_some() {
            self.initial_auth_index = other.initial_auth_index;
        }
        if other.camoufox_executable.is_some() {
            self.camoufox_executable = other.camoufox_executable;
        }
        if other.auth_dir.is_some() {
            self.auth_dir = other.auth_dir;
        }
    }

    pub fn into_config(self) -> ProxyConfig {
        let defaults = ProxyConfig::default();
        ProxyConfig {
            host: self.host.unwrap_or(defaults.host),
            http_port: self.http_port.unwrap_or(defaults.http_port),
            ws_port: self.ws_port.unwrap_or(defaults.ws_port),
            streaming_mode: self.streaming_mode.unwrap_or(defaults.streaming_mode),
            failure_threshold: self.failure_threshold.unwrap_or(defaults.failure_threshold),
            switch_on_uses: self.switch_on_uses.unwrap_or(defaults.switch_on_uses),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            retry_delay_ms: self.retry_delay_ms.unwrap_or(defaults.retry_delay_ms),
            immediate_switch_status_codes: self
                .immediate_switch_status_codes
                .unwrap_or(defaults.immediate_switch_status_codes),
            api_keys: self
                .api_keys
                .filter(|keys| !keys.is_empty())
                .unwrap_or(defaults.api_keys),
            initial_auth_index: self
                .initial_auth_index
                .unwrap_or(defaults.initial_auth_index),
            camoufox_executable: self.camoufox_executable,
            auth_dir: self.auth_dir,
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "invalid numeric value, using default");
            None
        }
    }
}

fn parse_status_list(raw: &str) -> Vec<u16> {
    raw.split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect()
}

fn parse_key_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ProxyConfigPatch::default().into_config();
        assert_eq!(config.http_port, 7860);
        assert_eq!(config.ws_port, 9998);
        assert_eq!(config.streaming_mode, StreamingMode::Real);
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.switch_on_uses, 40);
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.retry_delay_ms, 2000);
        assert_eq!(config.immediate_switch_status_codes, vec![429, 503]);
        assert_eq!(config.initial_auth_index, 1);
        assert!(config.uses_default_api_key());
        config.validate().unwrap();
    }

    #[test]
    fn malformed_numeric_env_falls_back_to_default() {
        std::env::set_var("BPROXY_TEST_BAD_PORT", "not-a-number");
        let parsed: Option<u16> = env_parse("BPROXY_TEST_BAD_PORT");
        assert!(parsed.is_none());
        std::env::remove_var("BPROXY_TEST_BAD_PORT");
    }

    #[test]
    fn overlay_prefers_later_layer() {
        let mut base = ProxyConfigPatch {
            http_port: Some(1234),
            host: Some("127.0.0.1".to_string()),
            ..ProxyConfigPatch::default()
        };
        base.overlay(ProxyConfigPatch {
            http_port: Some(9999),
            ..ProxyConfigPatch::default()
        });
        let config = base.into_config();
        assert_eq!(config.http_port, 9999);
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn key_and_status_lists_split_on_commas() {
        assert_eq!(parse_status_list("429, 503,x,500"), vec![429, 503, 500]);
        assert_eq!(
            parse_key_list(" a ,, b "),
            vec!["a".to_string(), "b".to_string()]
        );
    }
}
