//! Per-account, optionally per-contact view over a shared observer.

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use indexmap::IndexMap;
use tracing::{debug, warn};

use super::channel_class::ChannelClassSpec;
use super::observer::{Observer, ObserverEvent};
use super::registry::ObserverRegistry;
use crate::channel::Channel;
use crate::contacts::ContactManager;
use crate::error::OperationError;
use crate::events::{EventHub, ListenerId};
use crate::feature::Features;
use crate::signal_queue::{QueueStep, SignalQueue};
use crate::util::{lock, log_snippet};

#[derive(Debug, Clone)]
pub enum SimpleObserverEvent {
    NewChannels(Vec<Channel>),
    ChannelInvalidated {
        channel: Channel,
        error: OperationError,
    },
}

enum Entry {
    New(Vec<Channel>),
    Invalidated(Channel, OperationError),
}

struct SimpleInner {
    observer: Observer,
    account: String,
    contact: Option<String>,
    /// Set once the contact identifier is normalized.
    normalized: Mutex<Option<String>>,
    channels: Mutex<IndexMap<String, Channel>>,
    events: EventHub<SimpleObserverEvent>,
    queue: SignalQueue<Entry>,
    listener: OnceLock<ListenerId>,
}

impl Drop for SimpleInner {
    fn drop(&mut self) {
        if let Some(id) = self.listener.get() {
            self.observer.disconnect_event(*id);
        }
    }
}

/// Channels of one account matching a filter, announced in arrival order.
#[derive(Clone)]
pub struct SimpleObserver {
    inner: Arc<SimpleInner>,
}

impl SimpleObserver {
    pub fn create(
        registry: &ObserverRegistry,
        account: &str,
        filter: Vec<ChannelClassSpec>,
        extra_features: Vec<(ChannelClassSpec, Features)>,
    ) -> Result<Self, OperationError> {
        let observer = Self::shared_observer(registry, account, filter, extra_features)?;
        Ok(Self::build(observer, account, None, None))
    }

    /// Like [`SimpleObserver::create`], keeping only channels whose target is
    /// `identifier`.
    ///
    /// With a contact manager the identifier is normalized first and no
    /// channel is announced before that finishes.
    pub fn create_for_contact(
        registry: &ObserverRegistry,
        account: &str,
        filter: Vec<ChannelClassSpec>,
        identifier: &str,
        extra_features: Vec<(ChannelClassSpec, Features)>,
        contacts: Option<Arc<dyn ContactManager>>,
    ) -> Result<Self, OperationError> {
        let observer = Self::shared_observer(registry, account, filter, extra_features)?;
        Ok(Self::build(
            observer,
            account,
            Some(identifier.to_string()),
            contacts,
        ))
    }

    fn shared_observer(
        registry: &ObserverRegistry,
        account: &str,
        filter: Vec<ChannelClassSpec>,
        extra_features: Vec<(ChannelClassSpec, Features)>,
    ) -> Result<Observer, OperationError> {
        let observer = registry.observer_for(filter)?;
        if !extra_features.is_empty() {
            observer.register_extra_features(extra_features);
        }
        observer.register_account(account);
        Ok(observer)
    }

    fn build(
        observer: Observer,
        account: &str,
        contact: Option<String>,
        contacts: Option<Arc<dyn ContactManager>>,
    ) -> Self {
        let needs_lookup = contact.is_some() && contacts.is_some();
        let normalized = if needs_lookup { None } else { contact.clone() };
        let inner = Arc::new_cyclic(|weak: &Weak<SimpleInner>| {
            let weak = weak.clone();
            SimpleInner {
                observer,
                account: account.to_string(),
                contact,
                normalized: Mutex::new(normalized),
                channels: Mutex::new(IndexMap::new()),
                events: EventHub::new(),
                queue: SignalQueue::new(move |entry, step| {
                    if let Some(inner) = weak.upgrade() {
                        process_entry(&inner, entry, step);
                    }
                }),
                listener: OnceLock::new(),
            }
        });
        if needs_lookup {
            inner.queue.set_paused(true);
        }

        let existing = inner.observer.channels_for_account(account);
        if !existing.is_empty() {
            inner.queue.enqueue(Entry::New(existing));
        }

        let weak = Arc::downgrade(&inner);
        let listener = inner.observer.on_event(move |event| {
            if let Some(inner) = weak.upgrade() {
                forward(&inner, event);
            }
        });
        let _ = inner.listener.set(listener);

        if let (Some(identifier), Some(contacts)) = (inner.contact.clone(), contacts) {
            normalize_contact(&inner, identifier, contacts.as_ref());
        }
        Self { inner }
    }

    pub fn account(&self) -> &str {
        &self.inner.account
    }

    pub fn contact_identifier(&self) -> Option<&str> {
        self.inner.contact.as_deref()
    }

    pub fn normalized_identifier(&self) -> Option<String> {
        lock(&self.inner.normalized).clone()
    }

    pub fn channel_filter(&self) -> &[ChannelClassSpec] {
        self.inner.observer.filter()
    }

    pub fn observer(&self) -> &Observer {
        &self.inner.observer
    }

    /// Channels announced so far and not invalidated since.
    pub fn channels(&self) -> Vec<Channel> {
        lock(&self.inner.channels).values().cloned().collect()
    }

    pub fn on_event<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SimpleObserverEvent) + Send + Sync + 'static,
    {
        self.inner.events.connect(listener)
    }

    pub fn disconnect_event(&self, id: ListenerId) -> bool {
        self.inner.events.disconnect(id)
    }

    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<SimpleObserverEvent> {
        self.inner.events.subscribe()
    }
}

fn forward(inner: &SimpleInner, event: &ObserverEvent) {
    match event {
        ObserverEvent::NewChannels {
            account, channels, ..
        } if *account == inner.account => {
            inner.queue.enqueue(Entry::New(channels.clone()));
        }
        ObserverEvent::ChannelInvalidated {
            account,
            channel,
            error,
        } if *account == inner.account => {
            inner
                .queue
                .enqueue(Entry::Invalidated(channel.clone(), error.clone()));
        }
        _ => {}
    }
}

fn normalize_contact(inner: &Arc<SimpleInner>, identifier: String, contacts: &dyn ContactManager) {
    let weak = Arc::downgrade(inner);
    contacts
        .contacts_for_identifiers(vec![identifier.clone()])
        .on_reply(move |result| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let normalized = match result {
                Ok(resolved) => match resolved.contact(&identifier) {
                    Some(contact) => contact.id.clone(),
                    None => {
                        warn!(
                            contact = %log_snippet(&identifier),
                            "contact identifier is invalid, filtering on it verbatim"
                        );
                        identifier
                    }
                },
                Err(error) => {
                    warn!(
                        contact = %log_snippet(&identifier),
                        error = %log_snippet(&error.to_string()),
                        "failed to normalize contact identifier, filtering on it verbatim"
                    );
                    identifier
                }
            };
            debug!(contact = %log_snippet(&normalized), "contact identifier normalized");
            *lock(&inner.normalized) = Some(normalized);
            inner.queue.set_paused(false);
        });
}

fn process_entry(inner: &SimpleInner, entry: Entry, step: QueueStep<Entry>) {
    match entry {
        Entry::New(channels) => {
            let normalized = lock(&inner.normalized).clone();
            let accepted: Vec<Channel> = {
                let mut known = lock(&inner.channels);
                channels
                    .into_iter()
                    .filter(|channel| {
                        normalized
                            .as_deref()
                            .map_or(true, |id| channel.target_id() == id)
                    })
                    .filter(|channel| {
                        known
                            .insert(channel.object_path().to_string(), channel.clone())
                            .is_none()
                    })
                    .collect()
            };
            if !accepted.is_empty() {
                inner.events.emit(&SimpleObserverEvent::NewChannels(accepted));
            }
        }
        Entry::Invalidated(channel, error) => {
            let removed = lock(&inner.channels).shift_remove(channel.object_path());
            if removed.is_some() {
                inner
                    .events
                    .emit(&SimpleObserverEvent::ChannelInvalidated { channel, error });
            }
        }
    }
    step.done();
}

impl fmt::Debug for SimpleObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleObserver")
            .field("account", &self.inner.account)
            .field("contact", &self.inner.contact)
            .field("observer", &self.inner.observer.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::{text_immutable, CONN};
    use crate::channel::ChannelFactory;
    use crate::client::registry::testing::RecordingRegistrar;
    use crate::client::ObserveChannels;
    use crate::constants::{connection_path_from_bus_name, IFACE_CHANNEL, PROP_TARGET_ID};
    use crate::contacts::{Contact, ResolvedContacts};
    use crate::pending::PendingReply;
    use crate::transport::{LoopbackBus, PropertyMap, Variant};

    const ACCOUNT: &str = "/org/freedesktop/Telepathy/Account/cm/proto/me";
    const OTHER: &str = "/org/freedesktop/Telepathy/Account/cm/proto/other";

    #[derive(Default)]
    struct ParkedLookup {
        parked: Mutex<Vec<PendingReply<ResolvedContacts>>>,
    }

    impl ParkedLookup {
        fn answer(&self, identifier: &str, normalized: &str) {
            let reply = lock(&self.parked).remove(0);
            let mut resolved = ResolvedContacts::default();
            resolved
                .resolved
                .insert(identifier.to_string(), Contact::new(normalized, 7));
            reply.finish(Ok(resolved));
        }
    }

    impl ContactManager for ParkedLookup {
        fn contacts_for_identifiers(&self, _identifiers: Vec<String>) -> PendingReply<ResolvedContacts> {
            let reply = PendingReply::new();
            lock(&self.parked).push(reply.clone());
            reply
        }
    }

    fn registry(bus: &Arc<LoopbackBus>) -> ObserverRegistry {
        ObserverRegistry::new(
            Arc::new(ChannelFactory::new(bus.clone())),
            Arc::new(RecordingRegistrar::default()),
        )
    }

    fn text_with_target(target: &str) -> PropertyMap {
        let mut props = text_immutable();
        props.insert(PROP_TARGET_ID.into(), Variant::from(target));
        props
    }

    fn observe(observer: &Observer, account: &str, channels: Vec<(&str, PropertyMap)>) {
        observer.observe_channels(ObserveChannels {
            account: account.to_string(),
            connection: connection_path_from_bus_name(CONN),
            channels: channels
                .into_iter()
                .map(|(path, props)| (path.to_string(), props))
                .collect(),
            ..ObserveChannels::default()
        });
    }

    fn record(simple: &SimpleObserver) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        simple.on_event(move |event| {
            let line = match event {
                SimpleObserverEvent::NewChannels(channels) => format!(
                    "new:{}",
                    channels
                        .iter()
                        .map(|c| c.object_path().to_string())
                        .collect::<Vec<_>>()
                        .join(",")
                ),
                SimpleObserverEvent::ChannelInvalidated { channel, .. } => {
                    format!("gone:{}", channel.object_path())
                }
            };
            lock(&sink).push(line);
        });
        seen
    }

    #[test]
    fn filters_by_account_and_populates_late_observers() {
        let bus = LoopbackBus::new(":1.30");
        let registry = registry(&bus);
        let filter = vec![ChannelClassSpec::text_chat()];

        let simple = SimpleObserver::create(&registry, ACCOUNT, filter.clone(), Vec::new())
            .unwrap_or_else(|err| panic!("{err}"));
        let seen = record(&simple);
        let other = SimpleObserver::create(&registry, OTHER, filter.clone(), Vec::new())
            .unwrap_or_else(|err| panic!("{err}"));
        let other_seen = record(&other);

        observe(simple.observer(), ACCOUNT, vec![("/c/1", text_immutable())]);
        observe(simple.observer(), OTHER, vec![("/c/2", text_immutable())]);
        assert_eq!(*lock(&seen), vec!["new:/c/1".to_string()]);
        assert_eq!(*lock(&other_seen), vec!["new:/c/2".to_string()]);

        let late = SimpleObserver::create(&registry, ACCOUNT, filter, Vec::new())
            .unwrap_or_else(|err| panic!("{err}"));
        let paths: Vec<String> = late
            .channels()
            .iter()
            .map(|c| c.object_path().to_string())
            .collect();
        assert_eq!(paths, vec!["/c/1".to_string()]);
    }

    #[test]
    fn contact_filter_holds_events_until_normalized() {
        let bus = LoopbackBus::new(":1.31");
        let registry = registry(&bus);
        let lookup = Arc::new(ParkedLookup::default());

        let simple = SimpleObserver::create_for_contact(
            &registry,
            ACCOUNT,
            vec![ChannelClassSpec::text_chat()],
            "Bob@Example.com",
            Vec::new(),
            Some(lookup.clone() as Arc<dyn ContactManager>),
        )
        .unwrap_or_else(|err| panic!("{err}"));
        let seen = record(&simple);

        observe(
            simple.observer(),
            ACCOUNT,
            vec![
                ("/c/bob", text_with_target("bob@example.com")),
                ("/c/carol", text_with_target("carol@example.com")),
            ],
        );
        bus.emit("/c/bob", IFACE_CHANNEL, "Closed", Vec::new());
        assert!(lock(&seen).is_empty());
        assert_eq!(simple.normalized_identifier(), None);

        lookup.answer("Bob@Example.com", "bob@example.com");
        assert_eq!(simple.normalized_identifier().as_deref(), Some("bob@example.com"));
        assert_eq!(
            *lock(&seen),
            vec!["new:/c/bob".to_string(), "gone:/c/bob".to_string()]
        );
    }

    #[test]
    fn dropping_last_simple_observer_releases_shared_observer() {
        let bus = LoopbackBus::new(":1.32");
        let registrar = Arc::new(RecordingRegistrar::default());
        let registry = ObserverRegistry::new(
            Arc::new(ChannelFactory::new(bus.clone())),
            registrar.clone(),
        );

        let simple = SimpleObserver::create(&registry, ACCOUNT, vec![ChannelClassSpec::call()], Vec::new())
            .unwrap_or_else(|err| panic!("{err}"));
        let name = simple.observer().name().to_string();
        assert_eq!(registry.len(), 1);

        drop(simple);
        assert!(registry.is_empty());
        assert_eq!(*lock(&registrar.unregistered), vec![name]);
    }
}
