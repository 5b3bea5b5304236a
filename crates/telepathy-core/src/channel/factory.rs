//! Builds the right channel type from a channel's immutable properties.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::{CallChannel, Channel, ContactSearchChannel};
use crate::constants::{IFACE_CHANNEL_TYPE_CALL, IFACE_CHANNEL_TYPE_CONTACT_SEARCH, PROP_CHANNEL_TYPE};
use crate::feature::Features;
use crate::transport::{prop_string, PropertyMap, RemoteBus};

pub struct ChannelFactory {
    bus: Arc<dyn RemoteBus>,
    features: HashMap<String, Features>,
}

impl ChannelFactory {
    /// Call channels get their contents and search channels their search
    /// state made ready by default.
    pub fn new(bus: Arc<dyn RemoteBus>) -> Self {
        let features = HashMap::from([
            (
                IFACE_CHANNEL_TYPE_CALL.to_string(),
                Features::from([CallChannel::FEATURE_CONTENTS]),
            ),
            (
                IFACE_CHANNEL_TYPE_CONTACT_SEARCH.to_string(),
                Features::from([ContactSearchChannel::FEATURE_CORE]),
            ),
        ]);
        Self { bus, features }
    }

    pub fn bus(&self) -> &Arc<dyn RemoteBus> {
        &self.bus
    }

    /// Replace the extra features made ready for `channel_type`.
    pub fn set_features_for(&mut self, channel_type: &str, features: Features) {
        self.features.insert(channel_type.to_string(), features);
    }

    /// Features an observer should make ready on `channel` before announcing it.
    pub fn features_for(&self, channel: &Channel) -> Features {
        let mut features = Features::from([Channel::FEATURE_CORE]);
        if let Some(extra) = self.features.get(&channel.channel_type()) {
            features.extend(extra.iter().copied());
        }
        features
    }

    pub fn create(&self, connection_bus_name: &str, object_path: &str, immutable: PropertyMap) -> Channel {
        let channel_type = prop_string(&immutable, PROP_CHANNEL_TYPE).unwrap_or_default();
        debug!(path = object_path, channel_type = %channel_type, "creating channel proxy");
        let bus = self.bus.clone();
        match channel_type.as_str() {
            IFACE_CHANNEL_TYPE_CALL => {
                CallChannel::new(bus, connection_bus_name, object_path, immutable)
                    .channel()
                    .clone()
            }
            IFACE_CHANNEL_TYPE_CONTACT_SEARCH => {
                ContactSearchChannel::new(bus, connection_bus_name, object_path, immutable)
                    .channel()
                    .clone()
            }
            _ => Channel::new(bus, connection_bus_name, object_path, immutable),
        }
    }
}
