//! Remote object transport.
//!
//! The core only needs three things from the bus: issue a method call and get
//! one asynchronous reply, subscribe to a signal, and know its own unique
//! name. [`RemoteBus`] captures that shape; [`ZbusBus`] implements it over
//! D-Bus and [`LoopbackBus`] in-process for tests and demos.

mod dbus;
mod loopback;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::pending::PendingReply;

pub use dbus::{property_map_from_zbus, variant_to_zbus, ZbusBus};
pub use loopback::{LoopbackBus, PendingCall};

/// Property map keyed by (possibly qualified) property name.
pub type PropertyMap = BTreeMap<String, Variant>;

/// Decoded bus value, detached from the wire representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Variant {
    Bool(bool),
    UInt(u64),
    Int(i64),
    Double(f64),
    Str(String),
    StrList(Vec<String>),
    ObjectPath(String),
    ObjectPathList(Vec<String>),
    Map(PropertyMap),
    List(Vec<Variant>),
    Unsupported,
}

impl Variant {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Variant::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Variant::UInt(value) => u32::try_from(*value).ok(),
            Variant::Int(value) => u32::try_from(*value).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Variant::Str(value) | Variant::ObjectPath(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_object_path(&self) -> Option<&str> {
        match self {
            Variant::ObjectPath(value) => Some(value),
            _ => None,
        }
    }

    /// String lists; an empty generic list counts as an empty string list.
    pub fn as_str_list(&self) -> Option<Vec<String>> {
        match self {
            Variant::StrList(values) | Variant::ObjectPathList(values) => Some(values.clone()),
            Variant::List(values) => values
                .iter()
                .map(|value| value.as_str().map(str::to_string))
                .collect(),
            _ => None,
        }
    }

    pub fn as_object_path_list(&self) -> Option<Vec<String>> {
        match self {
            Variant::ObjectPathList(values) => Some(values.clone()),
            Variant::List(values) if values.is_empty() => Some(Vec::new()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&PropertyMap> {
        match self {
            Variant::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Variant]> {
        match self {
            Variant::List(values) => Some(values),
            _ => None,
        }
    }
}

impl From<bool> for Variant {
    fn from(value: bool) -> Self {
        Variant::Bool(value)
    }
}

impl From<u32> for Variant {
    fn from(value: u32) -> Self {
        Variant::UInt(u64::from(value))
    }
}

impl From<&str> for Variant {
    fn from(value: &str) -> Self {
        Variant::Str(value.to_string())
    }
}

impl From<String> for Variant {
    fn from(value: String) -> Self {
        Variant::Str(value)
    }
}

impl From<Vec<String>> for Variant {
    fn from(value: Vec<String>) -> Self {
        Variant::StrList(value)
    }
}

/// Read a typed value out of a property map.
pub fn prop_u32(map: &PropertyMap, key: &str) -> Option<u32> {
    map.get(key).and_then(Variant::as_u32)
}

pub fn prop_bool(map: &PropertyMap, key: &str) -> Option<bool> {
    map.get(key).and_then(Variant::as_bool)
}

pub fn prop_string(map: &PropertyMap, key: &str) -> Option<String> {
    map.get(key).and_then(Variant::as_str).map(str::to_string)
}

pub fn prop_str_list(map: &PropertyMap, key: &str) -> Option<Vec<String>> {
    map.get(key).and_then(Variant::as_str_list)
}

/// One outgoing method call.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    pub destination: String,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub args: Vec<Variant>,
    /// Signature the reply body is decoded with.
    pub reply_signature: &'static str,
}

/// Which signal to listen for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalMatch {
    pub sender: String,
    pub path: String,
    pub interface: String,
    pub member: String,
    /// Signature the signal body is decoded with.
    pub signature: &'static str,
}

impl SignalMatch {
    pub fn matches(&self, path: &str, interface: &str, member: &str) -> bool {
        self.path == path && self.interface == interface && self.member == member
    }
}

pub type SignalHandler = Arc<dyn Fn(Vec<Variant>) + Send + Sync>;

/// Keeps a signal subscription alive; dropping it unsubscribes.
pub struct SignalSubscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl SignalSubscription {
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }
}

impl Drop for SignalSubscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for SignalSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalSubscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Minimal remote-object transport the proxies are written against.
///
/// Implementations must deliver replies and signals one at a time, never while
/// holding a lock the callbacks could need.
pub trait RemoteBus: Send + Sync {
    /// Unique connection name, used to key per-bus registries.
    fn unique_name(&self) -> String;

    fn call(&self, call: MethodCall) -> PendingReply<Vec<Variant>>;

    fn subscribe(&self, rule: SignalMatch, handler: SignalHandler) -> SignalSubscription;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_tolerate_integer_widths_and_empty_lists() {
        assert_eq!(Variant::UInt(5).as_u32(), Some(5));
        assert_eq!(Variant::Int(7).as_u32(), Some(7));
        assert_eq!(Variant::Int(-1).as_u32(), None);
        assert_eq!(Variant::UInt(u64::MAX).as_u32(), None);
        assert_eq!(Variant::List(Vec::new()).as_object_path_list(), Some(Vec::new()));
        assert_eq!(Variant::List(Vec::new()).as_str_list(), Some(Vec::new()));
        assert_eq!(
            Variant::List(vec![Variant::from("a"), Variant::from("b")]).as_str_list(),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(Variant::Bool(true).as_str(), None);
    }

    #[test]
    fn property_helpers_read_typed_values() {
        let mut map = PropertyMap::new();
        map.insert("Limit".into(), Variant::from(10u32));
        map.insert("Server".into(), Variant::from("example.org"));
        map.insert("Keys".into(), Variant::from(vec!["nickname".to_string()]));
        assert_eq!(prop_u32(&map, "Limit"), Some(10));
        assert_eq!(prop_string(&map, "Server").as_deref(), Some("example.org"));
        assert_eq!(prop_str_list(&map, "Keys"), Some(vec!["nickname".to_string()]));
        assert_eq!(prop_bool(&map, "Missing"), None);
    }

    #[test]
    fn subscription_cancels_on_drop() {
        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let cloned = flag.clone();
        let subscription = SignalSubscription::new(move || {
            cloned.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        assert!(!flag.load(std::sync::atomic::Ordering::SeqCst));
        drop(subscription);
        assert!(flag.load(std::sync::atomic::Ordering::SeqCst));
    }
}
