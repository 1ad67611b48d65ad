//! Runtime settings of a [`Context`](crate::context::Context).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::queue::DEFAULT_CAPACITY;
use crate::wire::VERSION_LATEST;

/// Environment variable with `key=value;key=value` overrides of [`ParamConfig`].
pub const ENV_CONFIG_OVERRIDE: &str = "PARAMZ_CONFIG_OVERRIDE";
/// Environment variable naming a zenoh configuration file.
pub const ENV_ZENOH_CONFIG: &str = "PARAMZ_ZENOH_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParamConfig {
    /// Address of this process on the network.
    pub node: u16,
    /// Node used when a caller does not name one.
    pub dfl_node: u16,
    pub timeout_ms: u64,
    pub autosend: bool,
    pub version: u8,
    pub queue_capacity: usize,
    /// Hardware id matched against HWID pushes.
    pub hwid: Option<u32>,
    /// Wake-up period of the collector loop.
    pub collector_tick_ms: u64,
}

impl Default for ParamConfig {
    fn default() -> Self {
        Self {
            node: 0,
            dfl_node: 0,
            timeout_ms: 1000,
            autosend: true,
            version: VERSION_LATEST,
            queue_capacity: DEFAULT_CAPACITY,
            hwid: None,
            collector_tick_ms: 100,
        }
    }
}

impl ParamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Replace one field, addressed by its name, with a JSON value.
    pub fn apply(&mut self, key: &str, value: &serde_json::Value) -> Result<()> {
        let mut doc = serde_json::to_value(&*self).map_err(|e| Error::Config(e.to_string()))?;
        let Some(slot) = doc.get_mut(key) else {
            return Err(Error::Config(format!("unknown setting '{key}'")));
        };
        *slot = value.clone();
        *self = serde_json::from_value(doc)
            .map_err(|e| Error::Config(format!("bad value for '{key}': {e}")))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=VERSION_LATEST).contains(&self.version) {
            return Err(Error::Config(format!("unsupported protocol version {}", self.version)));
        }
        if self.queue_capacity < 16 {
            return Err(Error::Config(format!(
                "queue capacity {} is too small",
                self.queue_capacity
            )));
        }
        Ok(())
    }
}

/// Parse `key=value;key=value` pairs whose values are JSON5.
///
/// ```
/// let pairs = param_z::config::parse_overrides("dfl_node=5; autosend=false").unwrap();
/// assert_eq!(pairs.len(), 2);
/// ```
pub fn parse_overrides(text: &str) -> Result<Vec<(String, serde_json::Value)>> {
    let mut overrides = Vec::new();
    for pair in text.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let Some((key, value)) = pair.split_once('=') else {
            return Err(Error::Config(format!(
                "invalid override '{pair}', expected 'key=value'"
            )));
        };
        let (key, value) = (key.trim(), value.trim());
        let json = json5::from_str::<serde_json::Value>(value).map_err(|e| {
            Error::Config(format!("cannot parse value for '{key}': {e} (value: {value})"))
        })?;
        tracing::debug!("Override: {} = {}", key, json);
        overrides.push((key.to_string(), json));
    }
    Ok(overrides)
}

/// Overrides from [`ENV_CONFIG_OVERRIDE`], if set.
pub fn env_overrides() -> Result<Vec<(String, serde_json::Value)>> {
    match std::env::var(ENV_CONFIG_OVERRIDE) {
        Ok(text) => {
            tracing::debug!("Applying overrides from {ENV_CONFIG_OVERRIDE}: {text}");
            parse_overrides(&text)
        }
        Err(_) => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_apply_known_keys() {
        let mut config = ParamConfig::default();
        for (key, value) in parse_overrides("dfl_node=5;timeout_ms=250;hwid=4660;autosend=false").unwrap() {
            config.apply(&key, &value).unwrap();
        }
        assert_eq!(config.dfl_node, 5);
        assert_eq!(config.timeout(), Duration::from_millis(250));
        assert_eq!(config.hwid, Some(4660));
        assert!(!config.autosend);
    }

    #[test]
    fn test_unknown_key_and_bad_value() {
        let mut config = ParamConfig::default();
        assert!(config.apply("colour", &json!(1)).is_err());
        assert!(config.apply("node", &json!("five")).is_err());
        assert_eq!(config, ParamConfig::default());
    }

    #[test]
    fn test_malformed_override() {
        assert!(parse_overrides("node").is_err());
        assert!(parse_overrides("node=[").is_err());
        assert!(parse_overrides(" ; ").unwrap().is_empty());
    }

    #[test]
    fn test_validate_version() {
        let config = ParamConfig {
            version: 3,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
