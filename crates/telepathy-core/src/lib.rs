//! Client-side core for Telepathy proxies.
//!
//! Readiness tracking, pending operations, ordered signal delivery and the
//! channel/observer types built on top of them.

pub mod channel;
pub mod client;
pub mod config;
pub mod constants;
pub mod contacts;
pub mod error;
pub mod events;
pub mod feature;
pub mod pending;
pub mod proxy;
pub mod readiness;
pub mod signal_queue;
pub mod transport;
pub mod util;

pub use channel::{
    CallChannel, CallContent, CallEvent, CallState, Channel, ChannelDetails, ChannelFactory,
    ContactSearchChannel, LocalHoldState, LocalHoldStateReason, SearchEvent, SearchResult,
    SearchState,
};
pub use client::{
    ChannelClassSpec, Client, ClientCapabilities, ClientCapability, ClientRegistrar,
    ObserveChannels, Observer, ObserverEvent, ObserverRegistry, ObserverSettings,
    SimpleObserver, SimpleObserverEvent, WeakObserver,
};
pub use config::{
    BusConfig, BusKind, ClientConfig, ConfigError, GeneralConfig, IntrospectionConfig,
    ObserverConfig, ObserverFilterConfig,
};
pub use contacts::{Contact, ContactManager, ConnectionContactManager, ResolvedContacts};
pub use error::{OperationError, ReadinessError};
pub use events::{EventHub, ListenerId};
pub use feature::{Feature, Features};
pub use pending::{PendingComposite, PendingOperation, PendingReady, PendingReply};
pub use proxy::DBusProxy;
pub use readiness::{Introspectable, ReadinessHelper};
pub use signal_queue::{QueueStep, SignalQueue};
pub use transport::{LoopbackBus, PropertyMap, RemoteBus, Variant, ZbusBus};
pub use util::{diagnostic_mode, log_limit, log_snippet};
