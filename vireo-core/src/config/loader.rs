//! # Configuration Loading
//!
//! Builds a [`BrokerConfig`] from defaults, an optional TOML document and
//! `VIREO_*` environment overrides, then validates the result.

use std::collections::BTreeMap;
use std::env;
use std::path::Path;

use tracing::{debug, info};

use crate::config::schema::BrokerConfig;
use crate::config::validator::ConfigValidator;
use crate::{Error, Result};

/// Sections whose scalar keys may be overridden from the environment.
const OVERRIDABLE_SECTIONS: [&str; 3] = ["network", "transport", "logging"];

/// Configuration loader layering defaults, TOML and environment.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    env_prefix: String,
    env: Option<BTreeMap<String, String>>,
}

impl ConfigLoader {
    /// Loader reading `VIREO_*` variables from the process environment.
    #[must_use]
    pub fn new() -> Self {
        Self { env_prefix: "VIREO".to_owned(), env: None }
    }

    /// Set the environment variable prefix.
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Use an explicit variable set instead of the process environment.
    #[must_use]
    pub fn with_env_vars<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = Some(vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }

    /// Environment variable prefix.
    #[must_use]
    pub fn env_prefix(&self) -> &str {
        &self.env_prefix
    }

    /// Load from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load_from_file(&self, path: impl AsRef<Path>) -> Result<BrokerConfig> {
        let path = path.as_ref();
        info!("Loading configuration from file: {}", path.display());
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::io(path.display().to_string(), e))?;
        self.load_from_str(&content)
    }

    /// Load from a TOML document.
    ///
    /// # Errors
    /// Returns an error if the document cannot be parsed or validated.
    pub fn load_from_str(&self, content: &str) -> Result<BrokerConfig> {
        let file_value = content
            .parse::<toml::Value>()
            .map_err(|e| Error::configuration(format!("Failed to parse config: {e}")))?;
        self.finish(Some(file_value))
    }

    /// Load defaults plus environment overrides.
    ///
    /// # Errors
    /// Returns an error if an override is malformed or validation fails.
    pub fn load_defaults(&self) -> Result<BrokerConfig> {
        self.finish(None)
    }

    fn finish(&self, file_value: Option<toml::Value>) -> Result<BrokerConfig> {
        let mut value = toml::Value::try_from(BrokerConfig::default())
            .map_err(|e| Error::configuration(format!("Failed to serialize default config: {e}")))?;

        if let Some(file_value) = file_value {
            value = merge(value, file_value);
            debug!("Merged configuration file over defaults");
        }

        self.apply_env_vars(&mut value);

        let config: BrokerConfig = value
            .try_into()
            .map_err(|e| Error::configuration(format!("Failed to deserialize config: {e}")))?;
        ConfigValidator::validate(&config)?;
        info!(destinations = config.destinations.len(), "Configuration loaded and validated");
        Ok(config)
    }

    /// `VIREO_TRANSPORT_PING_INTERVAL_SECS=5` sets `transport.ping_interval_secs`.
    fn apply_env_vars(&self, config: &mut toml::Value) {
        let prefix = format!("{}_", self.env_prefix);
        let vars: Vec<(String, String)> = match &self.env {
            Some(vars) => vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            None => env::vars().collect(),
        };

        for (key, raw) in vars {
            let Some(rest) = key.strip_prefix(&prefix) else { continue };
            let rest = rest.to_lowercase();
            let Some((section, field)) = OVERRIDABLE_SECTIONS
                .iter()
                .find_map(|s| rest.strip_prefix(&format!("{s}_")).map(|f| (*s, f.to_owned())))
            else {
                continue;
            };
            if let toml::Value::Table(root) = config {
                if let Some(toml::Value::Table(table)) = root.get_mut(section) {
                    debug!(section, field = %field, "Applying environment override");
                    table.insert(field, parse_env_value(&raw));
                }
            }
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge `overlay` into `base`, recursing into tables.
fn merge(mut base: toml::Value, overlay: toml::Value) -> toml::Value {
    if let (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) = (&mut base, overlay) {
        for (key, value) in overlay_table {
            match base_table.remove(&key) {
                Some(existing) if existing.is_table() && value.is_table() => {
                    base_table.insert(key, merge(existing, value));
                },
                _ => {
                    base_table.insert(key, value);
                },
            }
        }
    }
    base
}

/// Parse an environment value to the most specific TOML type.
fn parse_env_value(value: &str) -> toml::Value {
    if let Ok(b) = value.parse::<bool>() {
        return toml::Value::Boolean(b);
    }
    if let Ok(i) = value.parse::<i64>() {
        return toml::Value::Integer(i);
    }
    if let Ok(f) = value.parse::<f64>() {
        return toml::Value::Float(f);
    }
    toml::Value::String(value.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageSyncMethod;
    use crate::telemetry::LogLevel;
    use tempfile::TempDir;

    fn loader() -> ConfigLoader {
        ConfigLoader::new().with_env_vars(Vec::<(String, String)>::new())
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = loader().load_defaults().unwrap();
        assert_eq!(config, BrokerConfig::default());
    }

    #[test]
    fn test_partial_file_over_defaults() {
        let dir = TempDir::new().unwrap();
        let toml = format!(
            r#"
            [network]
            bind_address = "127.0.0.1:9000"

            [logging]
            level = "debug"

            [[destinations]]
            name = "orders"
            data_folder = "{}"
            block_size = 512
            sync_method = "sync_data"
            "#,
            dir.path().display()
        );
        let config = loader().load_from_str(&toml).unwrap();
        assert_eq!(config.network.bind_address.port(), 9000);
        assert_eq!(config.logging.level, LogLevel::Debug);
        let orders = config.destination("orders").unwrap();
        assert_eq!(orders.block_size, 512);
        assert_eq!(orders.sync_method, StorageSyncMethod::SyncData);
        assert_eq!(orders.initial_block_count, 64);
    }

    #[test]
    fn test_env_overrides() {
        let config = ConfigLoader::new()
            .with_env_vars([
                ("VIREO_TRANSPORT_PING_INTERVAL_SECS", "5"),
                ("VIREO_NETWORK_MAX_CONNECTIONS", "12"),
                ("OTHER_NETWORK_MAX_CONNECTIONS", "99"),
            ])
            .load_defaults()
            .unwrap();
        assert_eq!(config.transport.ping_interval_secs, 5);
        assert_eq!(config.network.max_connections, 12);
    }

    #[test]
    fn test_invalid_descriptor_rejected() {
        let toml = r#"
            [[destinations]]
            name = "q"
            block_size = 1
        "#;
        let err = loader().load_from_str(toml).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::InvalidDescriptor);
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vireo.toml");
        std::fs::write(&path, "[transport]\nuse_multiplexer = true\n").unwrap();
        let config = loader().load_from_file(&path).unwrap();
        assert!(config.transport.use_multiplexer);
    }

    #[test]
    fn test_parse_env_value() {
        assert_eq!(parse_env_value("true"), toml::Value::Boolean(true));
        assert_eq!(parse_env_value("42"), toml::Value::Integer(42));
        assert_eq!(parse_env_value("hello"), toml::Value::String("hello".to_owned()));
    }
}
