//! Channel dispatch clients.
//!
//! A client advertises the capabilities it implements instead of being one
//! of several client kinds; the dispatcher side asks whether a capability is
//! supported and, for observers, reaches the [`Observer`] through
//! [`Client::as_observer`].

mod channel_class;
mod observer;
mod registry;
mod simple_observer;

use std::collections::BTreeSet;

use serde::Serialize;

use crate::constants::{IFACE_CLIENT_APPROVER, IFACE_CLIENT_HANDLER, IFACE_CLIENT_OBSERVER};

pub use channel_class::ChannelClassSpec;
pub use observer::{ObserveChannels, Observer, ObserverEvent, ObserverSettings, WeakObserver};
pub use registry::{ClientRegistrar, ObserverRegistry};
pub use simple_observer::{SimpleObserver, SimpleObserverEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ClientCapability {
    Observer,
    Approver,
    Handler,
}

impl ClientCapability {
    /// Bus interface a client exports for this capability.
    pub fn interface(self) -> &'static str {
        match self {
            ClientCapability::Observer => IFACE_CLIENT_OBSERVER,
            ClientCapability::Approver => IFACE_CLIENT_APPROVER,
            ClientCapability::Handler => IFACE_CLIENT_HANDLER,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClientCapabilities(BTreeSet<ClientCapability>);

impl ClientCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, capability: ClientCapability) -> Self {
        self.insert(capability);
        self
    }

    pub fn insert(&mut self, capability: ClientCapability) {
        self.0.insert(capability);
    }

    pub fn supports(&self, capability: ClientCapability) -> bool {
        self.0.contains(&capability)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Interfaces listed in the client's `Interfaces` property.
    pub fn interfaces(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|capability| capability.interface().to_string())
            .collect()
    }
}

pub trait Client: Send + Sync {
    fn capabilities(&self) -> ClientCapabilities;

    fn as_observer(&self) -> Option<&Observer> {
        None
    }
}
