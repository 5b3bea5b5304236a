//! Configuration types and defaults.
//!
//! Keeps schema definitions in one place for easier auditing.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::ChannelClassSpec;
use crate::constants::{HANDLE_TYPE_CONTACT, IFACE_CHANNEL_TYPE_CALL, IFACE_CHANNEL_TYPE_TEXT};

/// Top-level configuration loaded from config.toml.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub general: GeneralConfig,
    pub bus: BusConfig,
    pub introspection: IntrospectionConfig,
    pub observer: ObserverConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    Session,
    System,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    pub kind: BusKind,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IntrospectionConfig {
    /// Timeout applied to every remote call.
    pub call_timeout_ms: u64,
}

impl IntrospectionConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Default for IntrospectionConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 25_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObserverConfig {
    /// Prefix of the generated client name.
    pub name_prefix: String,
    /// Ask the dispatcher to replay existing channels on registration.
    pub recover: bool,
    pub delay_approvers: bool,
    #[serde(rename = "filter")]
    pub filters: Vec<ObserverFilterConfig>,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            name_prefix: "TpRsSO".to_string(),
            recover: true,
            delay_approvers: false,
            filters: vec![
                ObserverFilterConfig {
                    channel_type: Some(IFACE_CHANNEL_TYPE_TEXT.to_string()),
                    target_handle_type: Some(HANDLE_TYPE_CONTACT),
                    requested: None,
                },
                ObserverFilterConfig {
                    channel_type: Some(IFACE_CHANNEL_TYPE_CALL.to_string()),
                    target_handle_type: None,
                    requested: None,
                },
            ],
        }
    }
}

impl ObserverConfig {
    pub fn channel_filter(&self) -> Vec<ChannelClassSpec> {
        self.filters.iter().map(ObserverFilterConfig::to_class_spec).collect()
    }
}

/// One `[[observer.filter]]` table; unset keys match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObserverFilterConfig {
    pub channel_type: Option<String>,
    pub target_handle_type: Option<u32>,
    pub requested: Option<bool>,
}

impl ObserverFilterConfig {
    pub fn to_class_spec(&self) -> ChannelClassSpec {
        let mut spec = ChannelClassSpec::new();
        if let Some(channel_type) = &self.channel_type {
            spec = spec.with_channel_type(channel_type);
        }
        if let Some(handle_type) = self.target_handle_type {
            spec = spec.with_target_handle_type(handle_type);
        }
        if let Some(requested) = self.requested {
            spec = spec.with_requested(requested);
        }
        spec
    }
}
