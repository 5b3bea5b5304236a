//! Channel proxies.
//!
//! [`Channel`] carries the core feature shared by every channel type. Typed
//! channels ([`CallChannel`], [`ContactSearchChannel`]) register their own
//! features on the same readiness helper and attach their state to the
//! channel, so a plain `Channel` produced by the [`ChannelFactory`] can be
//! turned back into its typed form.

mod call;
mod contact_search;
mod factory;

pub use call::{
    CallChannel, CallContent, CallEvent, CallState, CallStateReason, LocalHoldState,
    LocalHoldStateReason,
};
pub use contact_search::{
    ContactInfoField, ContactSearchChannel, SearchEvent, SearchResult, SearchState,
};
pub use factory::ChannelFactory;

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use serde::Serialize;
use tracing::{debug, warn};

use crate::constants::{
    IFACE_CHANNEL, PROP_CHANNEL_TYPE, PROP_INITIATOR_ID, PROP_INTERFACES, PROP_REQUESTED,
    PROP_TARGET_HANDLE, PROP_TARGET_HANDLE_TYPE, PROP_TARGET_ID,
};
use crate::error::OperationError;
use crate::events::ListenerId;
use crate::feature::{Feature, Features};
use crate::pending::{PendingOperation, PendingReady};
use crate::proxy::DBusProxy;
use crate::readiness::Introspectable;
use crate::transport::{
    prop_bool, prop_str_list, prop_string, prop_u32, PropertyMap, RemoteBus,
};
use crate::util::{lock, log_snippet};

/// Core channel properties, valid once [`Channel::FEATURE_CORE`] is ready.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelDetails {
    pub channel_type: String,
    pub interfaces: Vec<String>,
    pub target_handle_type: u32,
    pub target_handle: u32,
    pub target_id: String,
    pub requested: bool,
    pub initiator_id: String,
}

impl ChannelDetails {
    /// Read the details from fully qualified immutable properties. Returns
    /// `None` unless every property needed is present.
    fn from_immutable(props: &PropertyMap) -> Option<Self> {
        Some(Self {
            channel_type: prop_string(props, PROP_CHANNEL_TYPE)?,
            interfaces: prop_str_list(props, PROP_INTERFACES)?,
            target_handle_type: prop_u32(props, PROP_TARGET_HANDLE_TYPE)?,
            target_handle: prop_u32(props, PROP_TARGET_HANDLE).unwrap_or_default(),
            target_id: prop_string(props, PROP_TARGET_ID).unwrap_or_default(),
            requested: prop_bool(props, PROP_REQUESTED)?,
            initiator_id: prop_string(props, PROP_INITIATOR_ID).unwrap_or_default(),
        })
    }

    /// Read the details from a `GetAll(Channel)` reply.
    fn from_get_all(props: &PropertyMap) -> Self {
        Self {
            channel_type: prop_string(props, "ChannelType").unwrap_or_default(),
            interfaces: prop_str_list(props, "Interfaces").unwrap_or_default(),
            target_handle_type: prop_u32(props, "TargetHandleType").unwrap_or_default(),
            target_handle: prop_u32(props, "TargetHandle").unwrap_or_default(),
            target_id: prop_string(props, "TargetID").unwrap_or_default(),
            requested: prop_bool(props, "Requested").unwrap_or_default(),
            initiator_id: prop_string(props, "InitiatorID").unwrap_or_default(),
        }
    }
}

type Extension = Arc<dyn Any + Send + Sync>;

struct ChannelInner {
    proxy: DBusProxy,
    immutable: PropertyMap,
    details: Mutex<ChannelDetails>,
    extension: OnceLock<Extension>,
}

/// A channel on a connection. Clones share the same remote object state.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub const FEATURE_CORE: Feature = Feature::new("Channel", 0);

    /// `bus_name` is the owning connection's bus name; `immutable` holds the
    /// fully qualified properties announced with the channel.
    pub fn new(
        bus: Arc<dyn RemoteBus>,
        bus_name: &str,
        object_path: &str,
        immutable: PropertyMap,
    ) -> Self {
        let proxy = DBusProxy::new(bus, bus_name, object_path);
        let inner = Arc::new(ChannelInner {
            proxy,
            immutable,
            details: Mutex::new(ChannelDetails::default()),
            extension: OnceLock::new(),
        });

        let weak = Arc::downgrade(&inner);
        let registered = inner.proxy.readiness().add_introspectables([(
            Self::FEATURE_CORE,
            Introspectable::new(move || introspect_core(&weak)),
        )]);
        if let Err(err) = registered {
            warn!(error = %err, "failed to register channel core feature");
        }

        let weak = Arc::downgrade(&inner);
        inner
            .proxy
            .connect_signal(IFACE_CHANNEL, "Closed", "", move |_| {
                if let Some(inner) = weak.upgrade() {
                    debug!(path = %inner.proxy.object_path(), "channel closed");
                    inner
                        .proxy
                        .invalidate(OperationError::cancelled("Channel closed"));
                }
            });

        Self { inner }
    }

    pub fn proxy(&self) -> &DBusProxy {
        &self.inner.proxy
    }

    pub fn object_path(&self) -> &str {
        self.inner.proxy.object_path()
    }

    /// Bus name of the connection the channel belongs to.
    pub fn connection_bus_name(&self) -> &str {
        self.inner.proxy.bus_name()
    }

    pub fn immutable_properties(&self) -> &PropertyMap {
        &self.inner.immutable
    }

    /// Channel type, from the immutable properties until core is ready.
    pub fn channel_type(&self) -> String {
        let details = lock(&self.inner.details);
        if !details.channel_type.is_empty() {
            return details.channel_type.clone();
        }
        prop_string(&self.inner.immutable, PROP_CHANNEL_TYPE).unwrap_or_default()
    }

    pub fn details(&self) -> ChannelDetails {
        lock(&self.inner.details).clone()
    }

    pub fn interfaces(&self) -> Vec<String> {
        self.inner.proxy.readiness().interfaces()
    }

    pub fn has_interface(&self, interface: &str) -> bool {
        self.inner.proxy.readiness().has_interface(interface)
    }

    pub fn target_id(&self) -> String {
        lock(&self.inner.details).target_id.clone()
    }

    pub fn target_handle_type(&self) -> u32 {
        lock(&self.inner.details).target_handle_type
    }

    pub fn is_requested(&self) -> bool {
        lock(&self.inner.details).requested
    }

    pub fn initiator_id(&self) -> String {
        lock(&self.inner.details).initiator_id.clone()
    }

    pub fn is_valid(&self) -> bool {
        self.inner.proxy.is_valid()
    }

    pub fn invalidation_error(&self) -> Option<OperationError> {
        self.inner.proxy.invalidation_error()
    }

    pub fn on_invalidated<F>(&self, listener: F) -> Option<ListenerId>
    where
        F: Fn(&OperationError) + Send + Sync + 'static,
    {
        self.inner.proxy.on_invalidated(listener)
    }

    pub fn become_ready(&self, features: Features) -> PendingReady {
        self.inner.proxy.become_ready(features)
    }

    pub fn is_ready(&self, features: &Features) -> bool {
        self.inner.proxy.is_ready(features)
    }

    pub fn is_feature_ready(&self, feature: Feature) -> bool {
        self.inner.proxy.is_ready(&Features::from([feature]))
    }

    /// Ask the remote side to close the channel.
    pub fn close(&self) -> PendingOperation {
        self.inner.proxy.call_void(IFACE_CHANNEL, "Close", Vec::new())
    }

    pub(crate) fn attach_extension(&self, extension: Extension) {
        if self.inner.extension.set(extension).is_err() {
            warn!(path = %self.object_path(), "channel already has a typed extension");
        }
    }

    pub(crate) fn extension<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let extension = self.inner.extension.get()?.clone();
        extension.downcast::<T>().ok()
    }

    pub(crate) fn downgrade(&self) -> WeakChannel {
        WeakChannel {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

#[derive(Clone)]
pub(crate) struct WeakChannel {
    inner: Weak<ChannelInner>,
}

impl WeakChannel {
    pub(crate) fn upgrade(&self) -> Option<Channel> {
        self.inner.upgrade().map(|inner| Channel { inner })
    }
}

fn introspect_core(weak: &Weak<ChannelInner>) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    if let Some(details) = ChannelDetails::from_immutable(&inner.immutable) {
        debug!(path = %inner.proxy.object_path(), "channel core from immutable properties");
        apply_core(&inner, details);
        return;
    }

    let weak = weak.clone();
    inner.proxy.get_all(IFACE_CHANNEL).on_reply(move |reply| {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match reply {
            Ok(props) => apply_core(&inner, ChannelDetails::from_get_all(&props)),
            Err(error) => {
                warn!(
                    path = %inner.proxy.object_path(),
                    error = %log_snippet(&error.to_string()),
                    "Properties.GetAll(Channel) failed"
                );
                inner
                    .proxy
                    .readiness()
                    .set_introspect_completed(Channel::FEATURE_CORE, Err(error));
            }
        }
    });
}

fn apply_core(inner: &ChannelInner, details: ChannelDetails) {
    let readiness = inner.proxy.readiness();
    readiness.set_interfaces(details.interfaces.clone());
    *lock(&inner.details) = details;
    readiness.set_introspect_completed(Channel::FEATURE_CORE, Ok(()));
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.object_path() == other.object_path()
            && self.connection_bus_name() == other.connection_bus_name()
    }
}

impl Eq for Channel {}

impl Hash for Channel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.connection_bus_name().hash(state);
        self.object_path().hash(state);
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("path", &self.object_path())
            .field("type", &self.channel_type())
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::constants::{HANDLE_TYPE_CONTACT, IFACE_CHANNEL_TYPE_TEXT};
    use crate::transport::Variant;

    pub(crate) const CONN: &str = "org.freedesktop.Telepathy.Connection.cm.proto.me";

    /// Complete immutable properties for a channel of `channel_type`.
    pub(crate) fn immutable(channel_type: &str, interfaces: &[&str]) -> PropertyMap {
        let mut props = PropertyMap::new();
        props.insert(PROP_CHANNEL_TYPE.into(), Variant::from(channel_type));
        props.insert(
            PROP_INTERFACES.into(),
            Variant::StrList(interfaces.iter().map(|i| i.to_string()).collect()),
        );
        props.insert(PROP_TARGET_HANDLE_TYPE.into(), Variant::from(HANDLE_TYPE_CONTACT));
        props.insert(PROP_TARGET_HANDLE.into(), Variant::from(4u32));
        props.insert(PROP_TARGET_ID.into(), Variant::from("bob@example.com"));
        props.insert(PROP_REQUESTED.into(), Variant::from(true));
        props.insert(PROP_INITIATOR_ID.into(), Variant::from("me@example.com"));
        props
    }

    pub(crate) fn text_immutable() -> PropertyMap {
        immutable(IFACE_CHANNEL_TYPE_TEXT, &[])
    }
}
