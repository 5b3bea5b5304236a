//! Shared observers keyed by bus and filter.
//!
//! Holders of the same filter on the same bus share one registered observer.
//! The registry only keeps weak references; when the last holder drops its
//! observer the client is unregistered and the entry removed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info, warn};

use super::channel_class::ChannelClassSpec;
use super::observer::{Observer, ObserverSettings, WeakObserver};
use crate::channel::ChannelFactory;
use crate::config::ObserverConfig;
use crate::error::OperationError;
use crate::util::lock;

/// Makes a client reachable by the dispatcher.
pub trait ClientRegistrar: Send + Sync {
    fn register(&self, observer: &Observer) -> Result<(), OperationError>;

    fn unregister(&self, name: &str);
}

type EntryKey = (String, String);

struct RegistryInner {
    factory: Arc<ChannelFactory>,
    registrar: Arc<dyn ClientRegistrar>,
    prefix: String,
    settings: ObserverSettings,
    entries: Mutex<HashMap<EntryKey, WeakObserver>>,
    counter: AtomicU64,
}

#[derive(Clone)]
pub struct ObserverRegistry {
    inner: Arc<RegistryInner>,
}

impl ObserverRegistry {
    pub fn new(factory: Arc<ChannelFactory>, registrar: Arc<dyn ClientRegistrar>) -> Self {
        Self::from_config(factory, registrar, &ObserverConfig::default())
    }

    pub fn from_config(
        factory: Arc<ChannelFactory>,
        registrar: Arc<dyn ClientRegistrar>,
        config: &ObserverConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                factory,
                registrar,
                prefix: config.name_prefix.clone(),
                settings: ObserverSettings::from(config),
                entries: Mutex::new(HashMap::new()),
                counter: AtomicU64::new(0),
            }),
        }
    }

    pub fn factory(&self) -> &Arc<ChannelFactory> {
        &self.inner.factory
    }

    /// Number of observers currently alive.
    pub fn len(&self) -> usize {
        lock(&self.inner.entries)
            .values()
            .filter(|weak| !weak.is_dead())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Existing observer for `filter` on this bus, or a newly registered one.
    pub fn observer_for(&self, filter: Vec<ChannelClassSpec>) -> Result<Observer, OperationError> {
        let inner = &self.inner;
        let unique_name = inner.factory.bus().unique_name();
        let key = (unique_name.clone(), ChannelClassSpec::filter_key(&filter));

        let observer = {
            let mut entries = lock(&inner.entries);
            if let Some(existing) = entries.get(&key).and_then(WeakObserver::upgrade) {
                return Ok(existing);
            }
            let serial = inner.counter.fetch_add(1, Ordering::Relaxed) + 1;
            let name = format!(
                "{}_{}_{}",
                inner.prefix,
                unique_name.replace([':', '.'], "_"),
                serial
            );
            let observer = Observer::for_registered_accounts(
                name,
                filter,
                inner.factory.clone(),
                inner.settings,
            );
            entries.insert(key.clone(), observer.downgrade());
            observer
        };

        if let Err(error) = inner.registrar.register(&observer) {
            warn!(
                client = %observer.name(),
                error = %error,
                "failed to register observer"
            );
            lock(&inner.entries).remove(&key);
            return Err(error);
        }
        info!(client = %observer.name(), "registered shared observer");
        observer.attach_registration(RegistrationGuard {
            registry: Arc::downgrade(inner),
            key,
            name: observer.name().to_string(),
        });
        Ok(observer)
    }
}

/// Unregisters the client when its observer goes away.
pub(crate) struct RegistrationGuard {
    registry: Weak<RegistryInner>,
    key: EntryKey,
    name: String,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        {
            let mut entries = lock(&registry.entries);
            // A replacement may already sit under the same key.
            if entries
                .get(&self.key)
                .is_some_and(WeakObserver::is_dead)
            {
                entries.remove(&self.key);
            }
        }
        debug!(client = %self.name, "unregistering shared observer");
        registry.registrar.unregister(&self.name);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Registrar that remembers names instead of exporting anything.
    #[derive(Default)]
    pub(crate) struct RecordingRegistrar {
        pub(crate) registered: Mutex<Vec<String>>,
        pub(crate) unregistered: Mutex<Vec<String>>,
        pub(crate) refuse: bool,
    }

    impl ClientRegistrar for RecordingRegistrar {
        fn register(&self, observer: &Observer) -> Result<(), OperationError> {
            if self.refuse {
                return Err(OperationError::not_available("name taken"));
            }
            lock(&self.registered).push(observer.name().to_string());
            Ok(())
        }

        fn unregister(&self, name: &str) {
            lock(&self.unregistered).push(name.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingRegistrar;
    use super::*;
    use crate::transport::LoopbackBus;

    fn registry(registrar: Arc<RecordingRegistrar>) -> ObserverRegistry {
        let factory = Arc::new(ChannelFactory::new(LoopbackBus::new(":1.42")));
        ObserverRegistry::new(factory, registrar)
    }

    #[test]
    fn same_filter_shares_one_observer() {
        let registrar = Arc::new(RecordingRegistrar::default());
        let registry = registry(registrar.clone());

        let first = registry.observer_for(vec![ChannelClassSpec::text_chat()]);
        let second = registry.observer_for(vec![ChannelClassSpec::text_chat()]);
        let other = registry.observer_for(vec![ChannelClassSpec::call()]);
        let (Ok(first), Ok(second), Ok(other)) = (first, second, other) else {
            panic!("registration failed");
        };
        assert_eq!(first.name(), second.name());
        assert_ne!(first.name(), other.name());
        assert_eq!(first.name(), "TpRsSO__1_42_1");
        assert_eq!(lock(&registrar.registered).len(), 2);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn last_holder_drop_unregisters() {
        let registrar = Arc::new(RecordingRegistrar::default());
        let registry = registry(registrar.clone());

        let first = registry
            .observer_for(vec![ChannelClassSpec::call()])
            .unwrap_or_else(|err| panic!("{err}"));
        let second = registry
            .observer_for(vec![ChannelClassSpec::call()])
            .unwrap_or_else(|err| panic!("{err}"));
        let name = first.name().to_string();

        drop(first);
        assert!(lock(&registrar.unregistered).is_empty());
        drop(second);
        assert_eq!(*lock(&registrar.unregistered), vec![name.clone()]);
        assert!(registry.is_empty());

        let fresh = registry
            .observer_for(vec![ChannelClassSpec::call()])
            .unwrap_or_else(|err| panic!("{err}"));
        assert_ne!(fresh.name(), name);
    }

    #[test]
    fn refused_registration_leaves_no_entry() {
        let registrar = Arc::new(RecordingRegistrar {
            refuse: true,
            ..RecordingRegistrar::default()
        });
        let registry = registry(registrar.clone());
        let result = registry.observer_for(vec![ChannelClassSpec::call()]);
        assert!(result.is_err());
        assert!(registry.is_empty());
        assert!(lock(&registrar.unregistered).is_empty());
    }
}
