//! Base remote object proxy.
//!
//! A [`DBusProxy`] names one remote object, owns its [`ReadinessHelper`], and
//! tracks validity. Invalidation happens once: it drops signal subscriptions,
//! aborts pending readiness requests and notifies listeners.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::constants::{IFACE_PROPERTIES, qualified};
use crate::error::OperationError;
use crate::events::{EventHub, ListenerId};
use crate::feature::Features;
use crate::pending::{PendingOperation, PendingReady, PendingReply};
use crate::readiness::{ReadinessHelper, DEFAULT_STATUS};
use crate::transport::{
    MethodCall, PropertyMap, RemoteBus, SignalMatch, SignalSubscription, Variant,
};
use crate::util::{lock, log_snippet};

struct ProxyState {
    invalidation: Option<OperationError>,
    subscriptions: Vec<SignalSubscription>,
}

struct ProxyInner {
    bus: Arc<dyn RemoteBus>,
    bus_name: String,
    object_path: String,
    readiness: ReadinessHelper,
    state: Mutex<ProxyState>,
    invalidated: EventHub<OperationError>,
}

#[derive(Clone)]
pub struct DBusProxy {
    inner: Arc<ProxyInner>,
}

/// Non-owning handle to a [`DBusProxy`].
#[derive(Clone)]
pub struct WeakProxy {
    inner: Weak<ProxyInner>,
}

impl WeakProxy {
    pub fn upgrade(&self) -> Option<DBusProxy> {
        self.inner.upgrade().map(|inner| DBusProxy { inner })
    }
}

impl DBusProxy {
    pub fn new(
        bus: Arc<dyn RemoteBus>,
        bus_name: impl Into<String>,
        object_path: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(ProxyInner {
                bus,
                bus_name: bus_name.into(),
                object_path: object_path.into(),
                readiness: ReadinessHelper::new(DEFAULT_STATUS),
                state: Mutex::new(ProxyState {
                    invalidation: None,
                    subscriptions: Vec::new(),
                }),
                invalidated: EventHub::new(),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakProxy {
        WeakProxy {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn bus(&self) -> &Arc<dyn RemoteBus> {
        &self.inner.bus
    }

    pub fn bus_name(&self) -> &str {
        &self.inner.bus_name
    }

    pub fn object_path(&self) -> &str {
        &self.inner.object_path
    }

    pub fn readiness(&self) -> &ReadinessHelper {
        &self.inner.readiness
    }

    pub fn is_valid(&self) -> bool {
        lock(&self.inner.state).invalidation.is_none()
    }

    pub fn invalidation_error(&self) -> Option<OperationError> {
        lock(&self.inner.state).invalidation.clone()
    }

    /// Mark the remote object gone. Only the first call has any effect.
    pub fn invalidate(&self, error: OperationError) {
        let subscriptions = {
            let mut state = lock(&self.inner.state);
            if state.invalidation.is_some() {
                return;
            }
            state.invalidation = Some(error.clone());
            std::mem::take(&mut state.subscriptions)
        };
        debug!(
            path = %self.object_path(),
            error = %log_snippet(&error.to_string()),
            "proxy invalidated"
        );
        drop(subscriptions);
        self.inner.readiness.abort(error.clone());
        self.inner.invalidated.emit(&error);
    }

    /// Called once with the invalidation error; immediately if already invalid.
    pub fn on_invalidated<F>(&self, listener: F) -> Option<ListenerId>
    where
        F: Fn(&OperationError) + Send + Sync + 'static,
    {
        if let Some(error) = self.invalidation_error() {
            listener(&error);
            return None;
        }
        Some(self.inner.invalidated.connect(listener))
    }

    pub fn disconnect_invalidated(&self, id: ListenerId) {
        self.inner.invalidated.disconnect(id);
    }

    pub fn become_ready(&self, features: Features) -> PendingReady {
        self.inner.readiness.become_ready(features)
    }

    pub fn is_ready(&self, features: &Features) -> bool {
        self.inner.readiness.is_ready(features)
    }

    /// Call a method on this object; fails immediately if invalidated.
    pub fn call(
        &self,
        interface: &str,
        member: &str,
        args: Vec<Variant>,
        reply_signature: &'static str,
    ) -> PendingReply<Vec<Variant>> {
        if let Some(error) = self.invalidation_error() {
            return PendingReply::ready(Err(error));
        }
        let reply = self.inner.bus.call(MethodCall {
            destination: self.inner.bus_name.clone(),
            path: self.inner.object_path.clone(),
            interface: interface.to_string(),
            member: member.to_string(),
            args,
            reply_signature,
        });
        self.cancel_on_invalidation(reply.operation());
        reply
    }

    /// Finish `operation` with the invalidation error if this proxy is
    /// invalidated before it settles.
    pub fn cancel_on_invalidation(&self, operation: &PendingOperation) {
        if operation.is_finished() {
            return;
        }
        let target = operation.clone();
        let Some(id) = self.on_invalidated(move |error| {
            target.finish_if_pending(Some(error.clone()));
        }) else {
            return;
        };
        let proxy = self.downgrade();
        operation.on_finished(move |_| {
            if let Some(proxy) = proxy.upgrade() {
                proxy.disconnect_invalidated(id);
            }
        });
    }

    /// Call a method whose reply carries no value.
    pub fn call_void(&self, interface: &str, member: &str, args: Vec<Variant>) -> PendingOperation {
        self.call(interface, member, args, "").into_operation()
    }

    /// `org.freedesktop.DBus.Properties.GetAll`.
    pub fn get_all(&self, interface: &str) -> PendingReply<PropertyMap> {
        self.call(
            IFACE_PROPERTIES,
            "GetAll",
            vec![Variant::from(interface)],
            "a{sv}",
        )
        .map(|args| match args.into_iter().next() {
            Some(Variant::Map(map)) => Ok(map),
            _ => Err(OperationError::invalid_argument("GetAll reply is not a{sv}")),
        })
    }

    /// `org.freedesktop.DBus.Properties.Get`.
    pub fn get(&self, interface: &str, property: &str) -> PendingReply<Variant> {
        let name = qualified(interface, property);
        self.call(
            IFACE_PROPERTIES,
            "Get",
            vec![Variant::from(interface), Variant::from(property)],
            "v",
        )
        .map(move |args| {
            args.into_iter()
                .next()
                .ok_or_else(|| OperationError::invalid_argument(format!("empty reply for {name}")))
        })
    }

    /// Subscribe to a signal of this object for as long as the proxy is valid.
    pub fn connect_signal<F>(&self, interface: &str, member: &str, signature: &'static str, handler: F)
    where
        F: Fn(Vec<Variant>) + Send + Sync + 'static,
    {
        if !self.is_valid() {
            return;
        }
        let subscription = self.inner.bus.subscribe(
            SignalMatch {
                sender: self.inner.bus_name.clone(),
                path: self.inner.object_path.clone(),
                interface: interface.to_string(),
                member: member.to_string(),
                signature,
            },
            Arc::new(handler),
        );
        let mut state = lock(&self.inner.state);
        if state.invalidation.is_none() {
            state.subscriptions.push(subscription);
        }
    }
}

impl fmt::Debug for DBusProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DBusProxy")
            .field("bus_name", &self.inner.bus_name)
            .field("object_path", &self.inner.object_path)
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::Feature;
    use crate::readiness::Introspectable;
    use crate::transport::LoopbackBus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CORE: Feature = Feature::new("Proxy", 0);

    fn proxy() -> (Arc<LoopbackBus>, DBusProxy) {
        let bus = LoopbackBus::new(":1.7");
        let proxy = DBusProxy::new(bus.clone(), "org.example.Service", "/org/example/Object");
        (bus, proxy)
    }

    #[test]
    fn invalidation_aborts_readiness_and_drops_subscriptions() {
        let (bus, proxy) = proxy();
        proxy
            .readiness()
            .add_introspectables([(CORE, Introspectable::new(|| {}))])
            .unwrap_or_else(|err| panic!("registration failed: {err}"));
        proxy.connect_signal("org.example.Iface", "Changed", "", |_| {});
        assert_eq!(bus.subscription_count(), 1);

        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        proxy.on_invalidated(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        let op = proxy.become_ready(Features::from([CORE]));
        proxy.invalidate(OperationError::cancelled("Closed"));
        proxy.invalidate(OperationError::cancelled("again"));

        assert_eq!(op.error_message().as_deref(), Some("Closed"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscription_count(), 0);
        assert!(!proxy.is_valid());

        let late = proxy.call_void("org.example.Iface", "Ping", Vec::new());
        assert_eq!(late.error_message().as_deref(), Some("Closed"));
        assert_eq!(bus.call_count("Ping"), 0);
    }

    #[test]
    fn in_flight_calls_fail_on_invalidation() {
        let (bus, proxy) = proxy();
        let op = proxy.call_void("org.example.Iface", "Slow", Vec::new());
        proxy.invalidate(OperationError::cancelled("Closed"));
        assert_eq!(op.error_message().as_deref(), Some("Closed"));

        bus.take_call("Slow")
            .unwrap_or_else(|| panic!("Slow not issued"))
            .reply(Vec::new());
        assert!(op.is_error());
    }

    #[test]
    fn get_all_decodes_map_reply() {
        let (bus, proxy) = proxy();
        let reply = proxy.get_all("org.example.Iface");
        let call = bus
            .take_call("GetAll")
            .unwrap_or_else(|| panic!("GetAll not issued"));
        assert_eq!(call.call.args, vec![Variant::from("org.example.Iface")]);
        let mut map = PropertyMap::new();
        map.insert("Name".into(), Variant::from("x"));
        call.reply(vec![Variant::Map(map.clone())]);
        assert_eq!(reply.value(), Some(map));
    }

    #[test]
    fn late_invalidation_listener_runs_immediately() {
        let (_bus, proxy) = proxy();
        proxy.invalidate(OperationError::cancelled("gone"));
        let seen = Arc::new(AtomicUsize::new(0));
        let counted = seen.clone();
        assert!(proxy
            .on_invalidated(move |_| {
                counted.fetch_add(1, Ordering::SeqCst);
            })
            .is_none());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
