//! Observer client: turns `ObserveChannels` batches into ready channels.
//!
//! Every batch goes through an ordered queue. A batch is announced only once
//! every channel in it has finished becoming ready (successfully or not), and
//! the acknowledgement returned to the dispatcher finishes right after the
//! announcement. Invalidations of announced channels travel through the same
//! queue so they can never overtake the batch that introduced the channel.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use super::channel_class::ChannelClassSpec;
use super::registry::RegistrationGuard;
use super::{Client, ClientCapabilities, ClientCapability};
use crate::channel::{Channel, ChannelFactory};
use crate::config::ObserverConfig;
use crate::constants::connection_bus_name_from_path;
use crate::error::OperationError;
use crate::events::{EventHub, ListenerId};
use crate::feature::Features;
use crate::pending::{PendingComposite, PendingOperation};
use crate::signal_queue::{QueueStep, SignalQueue};
use crate::transport::PropertyMap;
use crate::util::{lock, log_snippet};

/// Arguments of one `ObserveChannels` call.
#[derive(Debug, Clone, Default)]
pub struct ObserveChannels {
    pub account: String,
    pub connection: String,
    /// Channel object paths with their immutable properties.
    pub channels: Vec<(String, PropertyMap)>,
    pub dispatch_operation: String,
    pub requests_satisfied: Vec<String>,
    pub info: PropertyMap,
}

#[derive(Debug, Clone)]
pub enum ObserverEvent {
    NewChannels {
        account: String,
        connection: String,
        channels: Vec<Channel>,
        dispatch_operation: String,
        requests_satisfied: Vec<String>,
    },
    ChannelInvalidated {
        account: String,
        channel: Channel,
        error: OperationError,
    },
}

/// Properties the dispatcher reads from the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverSettings {
    pub recover: bool,
    pub delay_approvers: bool,
}

impl Default for ObserverSettings {
    fn default() -> Self {
        Self {
            recover: true,
            delay_approvers: false,
        }
    }
}

impl From<&ObserverConfig> for ObserverSettings {
    fn from(config: &ObserverConfig) -> Self {
        Self {
            recover: config.recover,
            delay_approvers: config.delay_approvers,
        }
    }
}

struct TrackedChannel {
    channel: Channel,
    account: String,
    listener: Option<ListenerId>,
}

#[derive(Default)]
struct Tracked {
    incomplete: IndexMap<String, TrackedChannel>,
    ready: IndexMap<String, TrackedChannel>,
}

impl Tracked {
    fn contains(&self, path: &str) -> bool {
        self.incomplete.contains_key(path) || self.ready.contains_key(path)
    }
}

enum ObserverEntry {
    NewChannels {
        request: ObserveChannels,
        paths: Vec<String>,
        ready: PendingOperation,
        ack: PendingOperation,
    },
    Invalidated {
        path: String,
        error: OperationError,
    },
}

struct ObserverInner {
    name: String,
    filter: Vec<ChannelClassSpec>,
    settings: ObserverSettings,
    factory: Arc<ChannelFactory>,
    /// `None` accepts every account.
    accounts: Mutex<Option<BTreeSet<String>>>,
    extra_features: Mutex<Vec<(ChannelClassSpec, Features)>>,
    tracked: Mutex<Tracked>,
    events: EventHub<ObserverEvent>,
    queue: SignalQueue<ObserverEntry>,
    registration: OnceLock<RegistrationGuard>,
}

#[derive(Clone)]
pub struct Observer {
    inner: Arc<ObserverInner>,
}

/// Non-owning handle; exported bus objects hold this so they never keep an
/// observer registered on their own.
#[derive(Clone)]
pub struct WeakObserver {
    inner: Weak<ObserverInner>,
}

impl WeakObserver {
    pub fn upgrade(&self) -> Option<Observer> {
        self.inner.upgrade().map(|inner| Observer { inner })
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.inner.strong_count() == 0
    }
}

impl Observer {
    pub fn new(
        name: impl Into<String>,
        filter: Vec<ChannelClassSpec>,
        factory: Arc<ChannelFactory>,
    ) -> Self {
        Self::with_settings(name, filter, factory, ObserverSettings::default())
    }

    pub fn with_settings(
        name: impl Into<String>,
        filter: Vec<ChannelClassSpec>,
        factory: Arc<ChannelFactory>,
        settings: ObserverSettings,
    ) -> Self {
        Self::build(name.into(), filter, factory, settings, None)
    }

    /// Observer that ignores every account until it is registered.
    pub(crate) fn for_registered_accounts(
        name: String,
        filter: Vec<ChannelClassSpec>,
        factory: Arc<ChannelFactory>,
        settings: ObserverSettings,
    ) -> Self {
        Self::build(name, filter, factory, settings, Some(BTreeSet::new()))
    }

    fn build(
        name: String,
        filter: Vec<ChannelClassSpec>,
        factory: Arc<ChannelFactory>,
        settings: ObserverSettings,
        accounts: Option<BTreeSet<String>>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ObserverInner>| {
            let weak = weak.clone();
            ObserverInner {
                name,
                filter,
                settings,
                factory,
                accounts: Mutex::new(accounts),
                extra_features: Mutex::new(Vec::new()),
                tracked: Mutex::new(Tracked::default()),
                events: EventHub::new(),
                queue: SignalQueue::new(move |entry, step| {
                    if let Some(inner) = weak.upgrade() {
                        process_entry(&inner, entry, step);
                    }
                }),
                registration: OnceLock::new(),
            }
        });
        Self { inner }
    }

    pub fn downgrade(&self) -> WeakObserver {
        WeakObserver {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn attach_registration(&self, guard: RegistrationGuard) {
        if self.inner.registration.set(guard).is_err() {
            warn!(client = %self.inner.name, "observer registered twice");
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn filter(&self) -> &[ChannelClassSpec] {
        &self.inner.filter
    }

    pub fn settings(&self) -> ObserverSettings {
        self.inner.settings
    }

    pub fn factory(&self) -> &Arc<ChannelFactory> {
        &self.inner.factory
    }

    /// Start accepting channels for `account`.
    pub fn register_account(&self, account: &str) {
        if let Some(accounts) = lock(&self.inner.accounts).as_mut() {
            accounts.insert(account.to_string());
        }
    }

    pub fn accepts_account(&self, account: &str) -> bool {
        lock(&self.inner.accounts)
            .as_ref()
            .map_or(true, |accounts| accounts.contains(account))
    }

    /// Make `features` ready on channels matching the paired class before
    /// announcing them.
    pub fn register_extra_features(&self, extra: Vec<(ChannelClassSpec, Features)>) {
        lock(&self.inner.extra_features).extend(extra);
    }

    /// Announced channels that are still tracked.
    pub fn channels(&self) -> Vec<Channel> {
        lock(&self.inner.tracked)
            .ready
            .values()
            .map(|tracked| tracked.channel.clone())
            .collect()
    }

    pub fn channels_for_account(&self, account: &str) -> Vec<Channel> {
        lock(&self.inner.tracked)
            .ready
            .values()
            .filter(|tracked| tracked.account == account)
            .map(|tracked| tracked.channel.clone())
            .collect()
    }

    pub fn on_event<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ObserverEvent) + Send + Sync + 'static,
    {
        self.inner.events.connect(listener)
    }

    pub fn disconnect_event(&self, id: ListenerId) -> bool {
        self.inner.events.disconnect(id)
    }

    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<ObserverEvent> {
        self.inner.events.subscribe()
    }

    /// Handle one dispatcher batch.
    ///
    /// The returned operation finishes once every new channel in the batch has
    /// a readiness outcome and the batch has been announced.
    pub fn observe_channels(&self, request: ObserveChannels) -> PendingOperation {
        let inner = &self.inner;
        if !self.accepts_account(&request.account) {
            debug!(
                client = %inner.name,
                account = %log_snippet(&request.account),
                "ignoring channels of unregistered account"
            );
            return PendingOperation::succeeded();
        }
        let Some(connection_bus_name) = connection_bus_name_from_path(&request.connection) else {
            warn!(
                client = %inner.name,
                connection = %log_snippet(&request.connection),
                "ObserveChannels with malformed connection path"
            );
            return PendingOperation::failed(OperationError::invalid_argument(format!(
                "{} is not a connection object path",
                request.connection
            )));
        };

        let mut created = Vec::new();
        for (path, immutable) in &request.channels {
            let known = lock(&inner.tracked).contains(path);
            if known {
                debug!(client = %inner.name, path = %path, "channel already observed");
                continue;
            }
            let channel = inner
                .factory
                .create(&connection_bus_name, path, immutable.clone());
            if !channel.is_valid() {
                continue;
            }
            created.push(channel);
        }

        let mut operations = Vec::with_capacity(created.len());
        let mut paths = Vec::with_capacity(created.len());
        for channel in created {
            let path = channel.object_path().to_string();
            let features = self.features_for(&channel);
            let listener = self.watch_invalidation(&channel);
            lock(&inner.tracked).incomplete.insert(
                path.clone(),
                TrackedChannel {
                    channel: channel.clone(),
                    account: request.account.clone(),
                    listener,
                },
            );
            operations.push(channel.become_ready(features).into_operation());
            paths.push(path);
        }

        info!(
            client = %inner.name,
            channels = paths.len(),
            dispatch_operation = %log_snippet(&request.dispatch_operation),
            "observing channels"
        );
        let ack = PendingOperation::new();
        inner.queue.enqueue(ObserverEntry::NewChannels {
            request,
            paths,
            ready: PendingComposite::new(operations, false).into_operation(),
            ack: ack.clone(),
        });
        ack
    }

    fn features_for(&self, channel: &Channel) -> Features {
        let mut features = self.inner.factory.features_for(channel);
        for (spec, extra) in lock(&self.inner.extra_features).iter() {
            if spec.matches(channel) {
                features.extend(extra.iter().copied());
            }
        }
        features
    }

    fn watch_invalidation(&self, channel: &Channel) -> Option<ListenerId> {
        let weak = Arc::downgrade(&self.inner);
        let path = channel.object_path().to_string();
        channel.on_invalidated(move |error| {
            if let Some(inner) = weak.upgrade() {
                inner.queue.enqueue(ObserverEntry::Invalidated {
                    path: path.clone(),
                    error: error.clone(),
                });
            }
        })
    }
}

fn process_entry(inner: &Arc<ObserverInner>, entry: ObserverEntry, step: QueueStep<ObserverEntry>) {
    match entry {
        ObserverEntry::NewChannels {
            request,
            paths,
            ready,
            ack,
        } => {
            let weak = Arc::downgrade(inner);
            ready.on_finished(move |ready| {
                if let Some(error) = ready.error() {
                    debug!(
                        error = %log_snippet(&error.to_string()),
                        "some observed channels failed to become ready"
                    );
                }
                if let Some(inner) = weak.upgrade() {
                    announce(&inner, request, &paths);
                }
                // The dispatcher hears back only after listeners saw the batch.
                ack.set_finished();
                step.done();
            });
        }
        ObserverEntry::Invalidated { path, error } => {
            let removed = lock(&inner.tracked).ready.shift_remove(&path);
            // Channels still becoming ready are dropped when their batch settles.
            let Some(tracked) = removed else {
                step.done();
                return;
            };
            debug!(
                client = %inner.name,
                path = %path,
                error = %log_snippet(&error.to_string()),
                "observed channel invalidated"
            );
            inner.events.emit(&ObserverEvent::ChannelInvalidated {
                account: tracked.account,
                channel: tracked.channel,
                error,
            });
            step.done();
        }
    }
}

fn announce(inner: &ObserverInner, request: ObserveChannels, paths: &[String]) {
    let mut announced = Vec::new();
    let mut dropped = Vec::new();
    {
        let mut tracked = lock(&inner.tracked);
        for path in paths {
            let Some(entry) = tracked.incomplete.shift_remove(path) else {
                continue;
            };
            if entry.channel.is_valid() {
                announced.push(entry.channel.clone());
                tracked.ready.insert(path.clone(), entry);
            } else {
                dropped.push(entry);
            }
        }
    }
    for entry in dropped {
        debug!(
            client = %inner.name,
            path = %entry.channel.object_path(),
            "channel invalidated before it became ready"
        );
        if let Some(id) = entry.listener {
            entry.channel.proxy().disconnect_invalidated(id);
        }
    }
    if announced.is_empty() {
        return;
    }
    inner.events.emit(&ObserverEvent::NewChannels {
        account: request.account,
        connection: request.connection,
        channels: announced,
        dispatch_operation: request.dispatch_operation,
        requests_satisfied: request.requests_satisfied,
    });
}

impl Client for Observer {
    fn capabilities(&self) -> ClientCapabilities {
        ClientCapabilities::new().with(ClientCapability::Observer)
    }

    fn as_observer(&self) -> Option<&Observer> {
        Some(self)
    }
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("name", &self.inner.name)
            .field("filter", &self.inner.filter.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::{immutable, text_immutable, CONN};
    use crate::constants::{connection_path_from_bus_name, IFACE_CHANNEL, IFACE_CHANNEL_TYPE_CALL};
    use crate::transport::LoopbackBus;

    const ACCOUNT: &str = "/org/freedesktop/Telepathy/Account/cm/proto/me";

    fn observer(bus: &Arc<LoopbackBus>) -> Observer {
        Observer::new(
            "Test",
            vec![ChannelClassSpec::text_chat(), ChannelClassSpec::call()],
            Arc::new(ChannelFactory::new(bus.clone())),
        )
    }

    fn batch(channels: Vec<(&str, PropertyMap)>) -> ObserveChannels {
        ObserveChannels {
            account: ACCOUNT.to_string(),
            connection: connection_path_from_bus_name(CONN),
            channels: channels
                .into_iter()
                .map(|(path, props)| (path.to_string(), props))
                .collect(),
            dispatch_operation: "/do/1".to_string(),
            ..ObserveChannels::default()
        }
    }

    fn record(observer: &Observer) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        observer.on_event(move |event| {
            let line = match event {
                ObserverEvent::NewChannels { channels, .. } => format!(
                    "new:{}",
                    channels
                        .iter()
                        .map(|c| c.object_path().to_string())
                        .collect::<Vec<_>>()
                        .join(",")
                ),
                ObserverEvent::ChannelInvalidated { channel, .. } => {
                    format!("gone:{}", channel.object_path())
                }
            };
            lock(&sink).push(line);
        });
        seen
    }

    #[test]
    fn ack_waits_for_every_channel_readiness() {
        let bus = LoopbackBus::new(":1.20");
        let observer = observer(&bus);
        let seen = record(&observer);

        let ack = observer.observe_channels(batch(vec![
            ("/c/text", text_immutable()),
            ("/c/call", immutable(IFACE_CHANNEL_TYPE_CALL, &[])),
        ]));
        assert!(!ack.is_finished());
        assert!(lock(&seen).is_empty());

        let call = bus.take_call_on("/c/call", "GetAll");
        assert!(call.is_some());
        if let Some(call) = call {
            call.fail(OperationError::not_available("no call state"));
        }
        assert!(ack.is_finished());
        assert!(!ack.is_error());
        assert_eq!(*lock(&seen), vec!["new:/c/text,/c/call".to_string()]);
        assert_eq!(observer.channels().len(), 2);
    }

    #[test]
    fn known_channels_and_unregistered_accounts_are_skipped() {
        let bus = LoopbackBus::new(":1.21");
        let observer = Observer::for_registered_accounts(
            "Scoped".to_string(),
            Vec::new(),
            Arc::new(ChannelFactory::new(bus.clone())),
            ObserverSettings::default(),
        );
        let seen = record(&observer);

        let ignored = observer.observe_channels(batch(vec![("/c/text", text_immutable())]));
        assert!(ignored.is_finished());
        assert!(lock(&seen).is_empty());

        observer.register_account(ACCOUNT);
        observer.observe_channels(batch(vec![("/c/text", text_immutable())]));
        let again = observer.observe_channels(batch(vec![("/c/text", text_immutable())]));
        assert!(again.is_finished());
        assert_eq!(*lock(&seen), vec!["new:/c/text".to_string()]);
    }

    #[test]
    fn malformed_connection_path_fails_the_ack() {
        let bus = LoopbackBus::new(":1.22");
        let observer = observer(&bus);
        let mut request = batch(vec![("/c/text", text_immutable())]);
        request.connection = "/not/a/connection".to_string();
        let ack = observer.observe_channels(request);
        assert_eq!(
            ack.error_name().as_deref(),
            Some(crate::constants::ERROR_INVALID_ARGUMENT)
        );
    }

    #[test]
    fn invalidation_follows_announcement() {
        let bus = LoopbackBus::new(":1.23");
        let observer = observer(&bus);
        let seen = record(&observer);

        observer.observe_channels(batch(vec![("/c/text", text_immutable())]));
        bus.emit("/c/text", IFACE_CHANNEL, "Closed", Vec::new());
        assert_eq!(
            *lock(&seen),
            vec!["new:/c/text".to_string(), "gone:/c/text".to_string()]
        );
        assert!(observer.channels().is_empty());
    }

    #[test]
    fn channel_closed_while_becoming_ready_is_never_announced() {
        let bus = LoopbackBus::new(":1.24");
        let observer = observer(&bus);
        let seen = record(&observer);

        let ack = observer.observe_channels(batch(vec![(
            "/c/call",
            immutable(IFACE_CHANNEL_TYPE_CALL, &[]),
        )]));
        bus.emit("/c/call", IFACE_CHANNEL, "Closed", Vec::new());
        assert!(ack.is_finished());
        assert!(lock(&seen).is_empty());
        assert!(observer.channels().is_empty());
    }

    #[test]
    fn batches_are_announced_in_arrival_order() {
        let bus = LoopbackBus::new(":1.25");
        let observer = observer(&bus);
        let seen = record(&observer);

        let slow = observer.observe_channels(batch(vec![(
            "/c/call",
            immutable(IFACE_CHANNEL_TYPE_CALL, &[]),
        )]));
        let fast = observer.observe_channels(batch(vec![("/c/text", text_immutable())]));
        assert!(!slow.is_finished());
        assert!(!fast.is_finished());
        assert!(lock(&seen).is_empty());

        if let Some(call) = bus.take_call_on("/c/call", "GetAll") {
            call.fail(OperationError::not_available("no call state"));
        }
        assert!(slow.is_finished() && fast.is_finished());
        assert_eq!(
            *lock(&seen),
            vec!["new:/c/call".to_string(), "new:/c/text".to_string()]
        );
    }

    #[test]
    fn observer_reports_observer_capability() {
        let bus = LoopbackBus::new(":1.26");
        let observer = observer(&bus);
        assert!(observer.capabilities().supports(ClientCapability::Observer));
        assert!(observer.as_observer().is_some());
    }
}
