//! Channel class filters used when registering clients.

use serde::{Deserialize, Serialize};

use crate::channel::Channel;
use crate::constants::{
    HANDLE_TYPE_CONTACT, IFACE_CHANNEL_TYPE_CALL, IFACE_CHANNEL_TYPE_CONTACT_SEARCH,
    IFACE_CHANNEL_TYPE_TEXT, PROP_CHANNEL_TYPE, PROP_REQUESTED, PROP_TARGET_HANDLE_TYPE,
};
use crate::transport::{prop_string, PropertyMap, Variant};

/// Fully qualified channel properties a channel must carry to match.
///
/// An empty spec matches every channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelClassSpec {
    properties: PropertyMap,
}

impl ChannelClassSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_properties(properties: PropertyMap) -> Self {
        Self { properties }
    }

    pub fn text_chat() -> Self {
        Self::new()
            .with_channel_type(IFACE_CHANNEL_TYPE_TEXT)
            .with_target_handle_type(HANDLE_TYPE_CONTACT)
    }

    pub fn call() -> Self {
        Self::new().with_channel_type(IFACE_CHANNEL_TYPE_CALL)
    }

    pub fn contact_search() -> Self {
        Self::new().with_channel_type(IFACE_CHANNEL_TYPE_CONTACT_SEARCH)
    }

    pub fn with_channel_type(self, channel_type: &str) -> Self {
        self.with_property(PROP_CHANNEL_TYPE, Variant::from(channel_type))
    }

    pub fn with_target_handle_type(self, handle_type: u32) -> Self {
        self.with_property(PROP_TARGET_HANDLE_TYPE, Variant::from(handle_type))
    }

    pub fn with_requested(self, requested: bool) -> Self {
        self.with_property(PROP_REQUESTED, Variant::from(requested))
    }

    pub fn with_property(mut self, name: &str, value: Variant) -> Self {
        self.properties.insert(name.to_string(), value);
        self
    }

    pub fn channel_type(&self) -> Option<String> {
        prop_string(&self.properties, PROP_CHANNEL_TYPE)
    }

    pub fn properties(&self) -> &PropertyMap {
        &self.properties
    }

    /// Every property in the spec is present in `properties` with an equal value.
    pub fn is_subset_of(&self, properties: &PropertyMap) -> bool {
        self.properties.iter().all(|(name, expected)| {
            properties
                .get(name)
                .is_some_and(|actual| values_match(expected, actual))
        })
    }

    pub fn matches(&self, channel: &Channel) -> bool {
        self.is_subset_of(channel.immutable_properties())
    }

    /// Stable textual form, identical for specs with equal properties.
    pub fn canonical_key(&self) -> String {
        // BTreeMap keeps keys sorted, so the JSON form is canonical.
        serde_json::to_string(&self.properties).unwrap_or_default()
    }

    /// Key identifying a whole filter regardless of order or duplicates.
    pub fn filter_key(specs: &[ChannelClassSpec]) -> String {
        let mut keys: Vec<String> = specs.iter().map(ChannelClassSpec::canonical_key).collect();
        keys.sort();
        keys.dedup();
        keys.join("|")
    }
}

// Handle types arrive as any integer width depending on the sender.
fn values_match(expected: &Variant, actual: &Variant) -> bool {
    match (expected.as_u32(), actual.as_u32()) {
        (Some(left), Some(right)) => left == right,
        _ => expected == actual,
    }
}
