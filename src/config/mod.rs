use anyhow::{Context, Result, anyhow};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use serde_inline_default::serde_inline_default;

use crate::model::error::ConfigError;
use crate::services::cmcd::BufferUnitRules;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    File,
    Redis,
}

#[serde_inline_default]
#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde_inline_default("127.0.0.1".to_string())]
    pub app_host: String,
    #[serde_inline_default(8080)]
    pub app_port: u32,
    #[serde_inline_default("error".to_string())]
    pub rust_log: String,
    #[serde_inline_default("http://localhost:8888".to_string())]
    pub origin_url: String,
    #[serde_inline_default(10000)]
    pub origin_timeout_ms: u64,
    #[serde_inline_default(StoreBackend::Memory)]
    pub delay_store: StoreBackend,
    #[serde_inline_default("/tmp/cmsd_delay_state.json".to_string())]
    pub delay_state_file: String,
    pub redis_url: Option<String>,
    #[serde_inline_default("cmsd:delay_state".to_string())]
    pub redis_state_key: String,
    // device id fragments of players that report buffer levels in ms
    #[serde_inline_default(vec!["dash.js-v4.2.1".to_string()])]
    pub bl_ms_devices: Vec<String>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.delay_store == StoreBackend::Redis && self.redis_url.is_none() {
            return Err(ConfigError::MissingRedisUrl);
        }
        if self.bl_ms_devices.iter().any(|d| d.trim().is_empty()) {
            return Err(ConfigError::EmptyDevicePattern);
        }
        url::Url::parse(&self.origin_url)
            .map_err(|e| ConfigError::InvalidOriginUrl(self.origin_url.clone(), e))?;
        Ok(())
    }

    pub fn buffer_unit_rules(&self) -> BufferUnitRules {
        BufferUnitRules::new(self.bl_ms_devices.iter().map(|d| d.trim().to_string()))
    }
}

static CONFIG: OnceCell<Config> = OnceCell::new();

fn load_config() -> Result<Config> {
    // a missing .env file is fine, the environment alone may be enough
    let _ = dotenvy::dotenv();
    let cnf = envy::from_env::<Config>()
        .map_err(|e| anyhow!(e))
        .context(format!(
            "at {} line {} column {}",
            file!(),
            line!(),
            column!(),
        ))?;
    cnf.validate().context("invalid configuration")?;
    Ok(cnf)
}

/// Loads and validates the configuration once; later calls return the cached value.
pub fn init() -> Result<&'static Config> {
    CONFIG.get_or_try_init(load_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> Config {
        envy::from_iter(vars.iter().map(|(k, v)| (k.to_string(), v.to_string()))).unwrap()
    }

    #[test]
    fn defaults_apply_when_env_is_empty() {
        let cnf = config_from(&[]);
        assert_eq!(cnf.app_port, 8080);
        assert_eq!(cnf.delay_store, StoreBackend::Memory);
        assert_eq!(cnf.bl_ms_devices, vec!["dash.js-v4.2.1".to_string()]);
        assert!(cnf.validate().is_ok());
    }

    #[test]
    fn redis_backend_requires_url() {
        let cnf = config_from(&[("DELAY_STORE", "redis")]);
        assert!(matches!(cnf.validate(), Err(ConfigError::MissingRedisUrl)));

        let cnf = config_from(&[
            ("DELAY_STORE", "redis"),
            ("REDIS_URL", "redis://127.0.0.1/"),
        ]);
        assert!(cnf.validate().is_ok());
    }

    #[test]
    fn device_patterns_are_comma_separated() {
        let cnf = config_from(&[("BL_MS_DEVICES", "dash.js-v4.2.1,shaka-4")]);
        assert_eq!(cnf.bl_ms_devices.len(), 2);
        let rules = cnf.buffer_unit_rules();
        assert!(rules.reports_millis(Some("shaka-4.3.0")));
        assert!(!rules.reports_millis(Some("dash.js-v3.1.3")));
    }

    #[test]
    fn empty_device_pattern_is_rejected() {
        let cnf = config_from(&[("BL_MS_DEVICES", "dash.js-v4.2.1,")]);
        assert!(matches!(
            cnf.validate(),
            Err(ConfigError::EmptyDevicePattern)
        ));
    }
}
