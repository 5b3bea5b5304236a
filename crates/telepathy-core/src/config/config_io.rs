//! Configuration loading and path resolution.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::ClientConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFailed(String),
    #[error("failed to parse config: {0}")]
    ParseFailed(String),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("missing $HOME, unable to resolve config directory")]
    MissingHome,
}

impl ClientConfig {
    /// Load configuration from a specific path.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            fs::read_to_string(path).map_err(|err| ConfigError::ReadFailed(err.to_string()))?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration text.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig =
            toml::from_str(contents).map_err(|err| ConfigError::ParseFailed(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default XDG config location, if present.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = Self::default_config_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from_path(&path)
    }

    /// Load from `path` when given, otherwise from the default location.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load_default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.introspection.call_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "introspection.call_timeout_ms must be greater than zero".to_string(),
            ));
        }
        let prefix = &self.observer.name_prefix;
        let valid_prefix = prefix
            .chars()
            .next()
            .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
            && prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_prefix {
            return Err(ConfigError::Invalid(format!(
                "observer.name_prefix {prefix:?} is not a valid bus name element"
            )));
        }
        if self.observer.filters.is_empty() {
            return Err(ConfigError::Invalid(
                "observer needs at least one [[observer.filter]]".to_string(),
            ));
        }
        Ok(())
    }

    /// Return the default config directory based on XDG or $HOME.
    pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
        if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
            return Ok(PathBuf::from(xdg).join("telepathy-rs"));
        }
        let home = env::var("HOME").map_err(|_| ConfigError::MissingHome)?;
        Ok(PathBuf::from(home).join(".config").join("telepathy-rs"))
    }

    /// Return the default config file path.
    pub fn default_config_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::default_config_dir()?.join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusKind;
    use crate::constants::{PROP_CHANNEL_TYPE, PROP_REQUESTED};

    #[test]
    fn empty_file_uses_defaults() {
        let config = ClientConfig::from_toml("").unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(config.bus.kind, BusKind::Session);
        assert_eq!(config.introspection.call_timeout_ms, 25_000);
        assert_eq!(config.observer.name_prefix, "TpRsSO");
        assert!(config.observer.recover);
        assert_eq!(config.observer.filters.len(), 2);
    }

    #[test]
    fn filters_become_class_specs() {
        let config = ClientConfig::from_toml(
            r#"
            [bus]
            kind = "system"

            [observer]
            name_prefix = "Logger"

            [[observer.filter]]
            channel_type = "org.freedesktop.Telepathy.Channel.Type.ContactSearch"
            requested = true
            "#,
        )
        .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(config.bus.kind, BusKind::System);

        let specs = config.observer.channel_filter();
        assert_eq!(specs.len(), 1);
        let props = specs[0].properties();
        assert_eq!(
            props.get(PROP_CHANNEL_TYPE).and_then(|v| v.as_str()),
            Some("org.freedesktop.Telepathy.Channel.Type.ContactSearch")
        );
        assert_eq!(props.get(PROP_REQUESTED).and_then(|v| v.as_bool()), Some(true));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let zero = ClientConfig::from_toml("[introspection]\ncall_timeout_ms = 0\n");
        assert!(matches!(zero, Err(ConfigError::Invalid(_))));

        let prefix = ClientConfig::from_toml("[observer]\nname_prefix = \"bad.name\"\n");
        assert!(matches!(prefix, Err(ConfigError::Invalid(_))));

        let garbage = ClientConfig::from_toml("[bus]\nkind = \"carrier-pigeon\"\n");
        assert!(matches!(garbage, Err(ConfigError::ParseFailed(_))));
    }
}
