//! Contact search channels.
//!
//! Search state changes and result batches are delivered through one ordered
//! queue: a result batch has to resolve its identifiers to contacts before it
//! can be announced, and nothing queued after it may be announced first.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, Weak};

use indexmap::IndexMap;
use serde::Serialize;
use serde_repr::Serialize_repr;
use tracing::{debug, warn};

use super::Channel;
use crate::constants::{qualified, IFACE_CHANNEL_TYPE_CONTACT_SEARCH};
use crate::contacts::{ConnectionContactManager, Contact, ContactManager};
use crate::error::OperationError;
use crate::events::{EventHub, ListenerId};
use crate::feature::Feature;
use crate::pending::PendingOperation;
use crate::proxy::DBusProxy;
use crate::readiness::Introspectable;
use crate::signal_queue::{QueueStep, SignalQueue};
use crate::transport::{
    prop_str_list, prop_string, prop_u32, PropertyMap, RemoteBus, Variant,
};
use crate::util::{lock, log_snippet};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize_repr)]
#[repr(u32)]
pub enum SearchState {
    #[default]
    NotStarted = 0,
    InProgress = 1,
    MoreAvailable = 2,
    Completed = 3,
    Failed = 4,
}

impl SearchState {
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::InProgress,
            2 => Self::MoreAvailable,
            3 => Self::Completed,
            4 => Self::Failed,
            _ => Self::NotStarted,
        }
    }

    /// No further results will arrive.
    pub fn is_final(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One vCard-style field of a search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContactInfoField {
    pub field_name: String,
    pub parameters: Vec<String>,
    pub field_value: Vec<String>,
}

impl ContactInfoField {
    fn from_variant(value: &Variant) -> Option<Self> {
        let parts = value.as_list()?;
        Some(Self {
            field_name: parts.first()?.as_str()?.to_string(),
            parameters: parts.get(1).and_then(Variant::as_str_list).unwrap_or_default(),
            field_value: parts.get(2).and_then(Variant::as_str_list).unwrap_or_default(),
        })
    }
}

/// Resolved contacts of one result batch, in arrival order.
pub type SearchResult = IndexMap<Contact, Vec<ContactInfoField>>;

#[derive(Debug, Clone)]
pub enum SearchEvent {
    StateChanged {
        state: SearchState,
        error_name: String,
        details: PropertyMap,
    },
    ResultReceived(SearchResult),
}

enum QueueEntry {
    State {
        state: SearchState,
        error_name: String,
        details: PropertyMap,
    },
    Result(Vec<(String, Vec<ContactInfoField>)>),
}

#[derive(Default)]
struct SearchProps {
    limit: u32,
    available_search_keys: Vec<String>,
    server: String,
    search_state: SearchState,
}

struct SearchShared {
    proxy: DBusProxy,
    contacts: Arc<dyn ContactManager>,
    immutable: PropertyMap,
    props: Mutex<SearchProps>,
    events: EventHub<SearchEvent>,
    queue: SignalQueue<QueueEntry>,
}

/// A channel of type `ContactSearch`.
#[derive(Clone)]
pub struct ContactSearchChannel {
    channel: Channel,
    shared: Arc<SearchShared>,
}

impl ContactSearchChannel {
    pub const FEATURE_CORE: Feature = Feature::new("ContactSearchChannel", 0);

    /// Results are resolved through the owning connection's contacts interface.
    pub fn new(
        bus: Arc<dyn RemoteBus>,
        bus_name: &str,
        object_path: &str,
        immutable: PropertyMap,
    ) -> Self {
        let contacts = Arc::new(ConnectionContactManager::new(bus.clone(), bus_name));
        Self::with_contact_manager(Channel::new(bus, bus_name, object_path, immutable), contacts)
    }

    pub fn with_contact_manager(channel: Channel, contacts: Arc<dyn ContactManager>) -> Self {
        let shared = Arc::new_cyclic(|weak: &Weak<SearchShared>| {
            let weak = weak.clone();
            SearchShared {
                proxy: channel.proxy().clone(),
                contacts,
                immutable: channel.immutable_properties().clone(),
                props: Mutex::new(SearchProps::default()),
                events: EventHub::new(),
                queue: SignalQueue::new(move |entry, step| {
                    if let Some(shared) = weak.upgrade() {
                        process_entry(&shared, entry, step);
                    }
                }),
            }
        });

        let weak = Arc::downgrade(&shared);
        let registered = channel.proxy().readiness().add_introspectables([(
            Self::FEATURE_CORE,
            Introspectable::new(move || introspect_search(&weak))
                .depends_on([Channel::FEATURE_CORE]),
        )]);
        if let Err(err) = registered {
            warn!(error = %err, "failed to register contact search feature");
        }

        channel.attach_extension(shared.clone());
        Self { channel, shared }
    }

    pub fn from_channel(channel: &Channel) -> Option<Self> {
        let shared = channel.extension::<SearchShared>()?;
        Some(Self {
            channel: channel.clone(),
            shared,
        })
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn on_event<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SearchEvent) + Send + Sync + 'static,
    {
        self.shared.events.connect(listener)
    }

    pub fn disconnect_event(&self, id: ListenerId) -> bool {
        self.shared.events.disconnect(id)
    }

    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<SearchEvent> {
        self.shared.events.subscribe()
    }

    pub fn search_state(&self) -> SearchState {
        lock(&self.shared.props).search_state
    }

    /// Maximum number of results per search; 0 means no limit.
    pub fn limit(&self) -> u32 {
        lock(&self.shared.props).limit
    }

    pub fn available_search_keys(&self) -> Vec<String> {
        lock(&self.shared.props).available_search_keys.clone()
    }

    pub fn server(&self) -> String {
        lock(&self.shared.props).server.clone()
    }

    /// Start a search for a single key.
    pub fn search_for(&self, key: &str, term: &str) -> PendingOperation {
        self.search(BTreeMap::from([(key.to_string(), term.to_string())]))
    }

    pub fn search(&self, terms: BTreeMap<String, String>) -> PendingOperation {
        if let Err(error) = self.check_state(&[SearchState::NotStarted], "Search already started") {
            return PendingOperation::failed(error);
        }
        let terms: PropertyMap = terms
            .into_iter()
            .map(|(key, term)| (key, Variant::Str(term)))
            .collect();
        self.request("Search", vec![Variant::Map(terms)])
    }

    /// Ask for more results; only valid while more are available.
    pub fn continue_search(&self) -> PendingOperation {
        if let Err(error) =
            self.check_state(&[SearchState::MoreAvailable], "No more results available")
        {
            return PendingOperation::failed(error);
        }
        self.request("More", Vec::new())
    }

    pub fn stop_search(&self) -> PendingOperation {
        if let Err(error) = self.check_state(
            &[SearchState::InProgress, SearchState::MoreAvailable],
            "Search is not running",
        ) {
            return PendingOperation::failed(error);
        }
        self.request("Stop", Vec::new())
    }

    fn check_state(&self, allowed: &[SearchState], message: &str) -> Result<(), OperationError> {
        if !self.channel.is_feature_ready(Self::FEATURE_CORE) {
            return Err(OperationError::not_available("Channel not ready"));
        }
        let state = self.search_state();
        if !allowed.contains(&state) {
            warn!(path = %self.object_path(), ?state, "{message}");
            return Err(OperationError::not_available(message));
        }
        Ok(())
    }

    /// Issue `member` and settle once both its reply and the state change it
    /// causes were seen, in whichever order they arrive. A failed reply
    /// settles immediately.
    fn request(&self, member: &str, args: Vec<Variant>) -> PendingOperation {
        #[derive(Default)]
        struct Race {
            reply: Option<Result<(), OperationError>>,
            state_seen: bool,
        }

        let operation = PendingOperation::new();
        let race = Arc::new(Mutex::new(Race::default()));

        let target = operation.clone();
        let seen = race.clone();
        let listener = self.shared.events.connect(move |event| {
            let SearchEvent::StateChanged { state, .. } = event else {
                return;
            };
            // Only a move away from NotStarted answers the request.
            if *state == SearchState::NotStarted {
                return;
            }
            let reply = {
                let mut race = lock(&seen);
                race.state_seen = true;
                race.reply.clone()
            };
            // No reply yet: the reply handler finishes it.
            if let Some(result) = reply {
                target.finish_if_pending(result.err());
            }
        });
        let shared = Arc::downgrade(&self.shared);
        operation.on_finished(move |_| {
            if let Some(shared) = shared.upgrade() {
                shared.events.disconnect(listener);
            }
        });
        self.shared.proxy.cancel_on_invalidation(&operation);

        let target = operation.clone();
        self.shared
            .proxy
            .call_void(IFACE_CHANNEL_TYPE_CONTACT_SEARCH, member, args)
            .on_finished(move |reply| {
                let result = reply.result().unwrap_or(Ok(()));
                let state_seen = {
                    let mut race = lock(&race);
                    race.reply = Some(result.clone());
                    race.state_seen
                };
                // Success still waits for the state change; an error cannot
                // be followed by one.
                if state_seen || result.is_err() {
                    target.finish_if_pending(result.err());
                }
            });
        operation
    }
}

impl Deref for ContactSearchChannel {
    type Target = Channel;

    fn deref(&self) -> &Self::Target {
        &self.channel
    }
}

impl fmt::Debug for ContactSearchChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContactSearchChannel")
            .field("path", &self.object_path())
            .field("state", &self.search_state())
            .finish()
    }
}

fn introspect_search(weak: &Weak<SearchShared>) {
    let Some(shared) = weak.upgrade() else {
        return;
    };

    let changed = weak.clone();
    shared.proxy.connect_signal(
        IFACE_CHANNEL_TYPE_CONTACT_SEARCH,
        "SearchStateChanged",
        "usa{sv}",
        move |args| {
            let Some(shared) = changed.upgrade() else {
                return;
            };
            shared.queue.enqueue(QueueEntry::State {
                state: SearchState::from_u32(
                    args.first().and_then(Variant::as_u32).unwrap_or_default(),
                ),
                error_name: args
                    .get(1)
                    .and_then(Variant::as_str)
                    .unwrap_or_default()
                    .to_string(),
                details: args
                    .get(2)
                    .and_then(Variant::as_map)
                    .cloned()
                    .unwrap_or_default(),
            });
        },
    );

    let received = weak.clone();
    shared.proxy.connect_signal(
        IFACE_CHANNEL_TYPE_CONTACT_SEARCH,
        "SearchResultReceived",
        "a{sa(sasas)}",
        move |args| {
            let Some(shared) = received.upgrade() else {
                return;
            };
            let batch = args
                .first()
                .and_then(Variant::as_map)
                .map(|results| {
                    results
                        .iter()
                        .map(|(identifier, fields)| {
                            let fields = fields
                                .as_list()
                                .unwrap_or_default()
                                .iter()
                                .filter_map(ContactInfoField::from_variant)
                                .collect();
                            (identifier.clone(), fields)
                        })
                        .collect()
                })
                .unwrap_or_default();
            shared.queue.enqueue(QueueEntry::Result(batch));
        },
    );

    let names = ["Limit", "AvailableSearchKeys", "Server"];
    let complete = names.iter().all(|name| {
        shared
            .immutable
            .contains_key(&qualified(IFACE_CHANNEL_TYPE_CONTACT_SEARCH, name))
    });

    let weak = weak.clone();
    if complete {
        let mut props = PropertyMap::new();
        for name in names {
            if let Some(value) = shared
                .immutable
                .get(&qualified(IFACE_CHANNEL_TYPE_CONTACT_SEARCH, name))
            {
                props.insert(name.to_string(), value.clone());
            }
        }
        extract_props(&shared, &props);
        shared
            .proxy
            .get(IFACE_CHANNEL_TYPE_CONTACT_SEARCH, "SearchState")
            .on_reply(move |reply| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let result = reply.map(|state| {
                    lock(&shared.props).search_state =
                        SearchState::from_u32(state.as_u32().unwrap_or_default());
                });
                finish_core(&shared, "Properties.Get(SearchState)", result);
            });
    } else {
        shared
            .proxy
            .get_all(IFACE_CHANNEL_TYPE_CONTACT_SEARCH)
            .on_reply(move |reply| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let result = reply.map(|props| {
                    extract_props(&shared, &props);
                    lock(&shared.props).search_state = SearchState::from_u32(
                        prop_u32(&props, "SearchState").unwrap_or_default(),
                    );
                });
                finish_core(&shared, "Properties.GetAll(ContactSearch)", result);
            });
    }
}

fn extract_props(shared: &SearchShared, props: &PropertyMap) {
    let mut current = lock(&shared.props);
    current.limit = prop_u32(props, "Limit").unwrap_or_default();
    current.available_search_keys = prop_str_list(props, "AvailableSearchKeys").unwrap_or_default();
    current.server = prop_string(props, "Server").unwrap_or_default();
}

fn finish_core(shared: &SearchShared, what: &str, result: Result<(), OperationError>) {
    match &result {
        Ok(()) => debug!(path = %shared.proxy.object_path(), "got reply to {what}"),
        Err(error) => warn!(
            path = %shared.proxy.object_path(),
            error = %log_snippet(&error.to_string()),
            "{what} failed"
        ),
    }
    shared
        .proxy
        .readiness()
        .set_introspect_completed(ContactSearchChannel::FEATURE_CORE, result);
}

fn process_entry(shared: &Arc<SearchShared>, entry: QueueEntry, step: QueueStep<QueueEntry>) {
    match entry {
        QueueEntry::State {
            state,
            error_name,
            details,
        } => {
            lock(&shared.props).search_state = state;
            debug!(path = %shared.proxy.object_path(), ?state, "search state changed");
            shared.events.emit(&SearchEvent::StateChanged {
                state,
                error_name,
                details,
            });
            step.done();
        }
        // Nothing to resolve, so announce without leaving this step; ordering
        // against earlier slow batches comes from the queue itself.
        QueueEntry::Result(batch) if batch.is_empty() => {
            shared
                .events
                .emit(&SearchEvent::ResultReceived(SearchResult::new()));
            step.done();
        }
        QueueEntry::Result(batch) => {
            let identifiers = batch.iter().map(|(id, _)| id.clone()).collect();
            let weak = Arc::downgrade(shared);
            shared
                .contacts
                .contacts_for_identifiers(identifiers)
                .on_reply(move |reply| {
                    // Channel gone: dropping `step` still releases the queue.
                    let Some(shared) = weak.upgrade() else {
                        return;
                    };
                    match reply {
                        Ok(resolved) => {
                            // Identifiers reported invalid have no contact.
                            let result: SearchResult = batch
                                .into_iter()
                                .filter_map(|(identifier, fields)| {
                                    resolved
                                        .contact(&identifier)
                                        .map(|contact| (contact.clone(), fields))
                                })
                                .collect();
                            shared.events.emit(&SearchEvent::ResultReceived(result));
                        }
                        Err(error) => warn!(
                            path = %shared.proxy.object_path(),
                            error = %error,
                            "resolving search result contacts failed, ignoring search result"
                        ),
                    }
                    step.done();
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{immutable, CONN};
    use super::*;
    use crate::contacts::ResolvedContacts;
    use crate::pending::PendingReply;
    use crate::feature::Features;
    use crate::transport::LoopbackBus;

    const PATH: &str = "/org/freedesktop/Telepathy/Connection/cm/proto/me/search1";

    type Parked = Vec<(Vec<String>, PendingReply<ResolvedContacts>)>;

    /// Contact manager whose lookups wait for the test to answer them.
    #[derive(Default)]
    struct ParkedContacts {
        parked: Mutex<Parked>,
    }

    impl ParkedContacts {
        fn answer_next(&self, invalid: &[&str]) {
            let (identifiers, reply) = {
                let mut parked = lock(&self.parked);
                assert!(!parked.is_empty(), "no contact lookup pending");
                parked.remove(0)
            };
            let mut contacts = ResolvedContacts::default();
            for (handle, identifier) in identifiers.into_iter().enumerate() {
                if invalid.contains(&identifier.as_str()) {
                    contacts
                        .invalid
                        .insert(identifier, OperationError::new("invalid", "invalid"));
                } else {
                    let contact = Contact::new(identifier.to_lowercase(), handle as u32 + 1);
                    contacts.resolved.insert(identifier, contact);
                }
            }
            reply.finish(Ok(contacts));
        }

        fn fail_next(&self) {
            let (_, reply) = lock(&self.parked).remove(0);
            reply.finish(Err(OperationError::not_available("offline")));
        }
    }

    impl ContactManager for ParkedContacts {
        fn contacts_for_identifiers(
            &self,
            identifiers: Vec<String>,
        ) -> PendingReply<ResolvedContacts> {
            let reply = PendingReply::new();
            lock(&self.parked).push((identifiers, reply.clone()));
            reply
        }
    }

    fn search_immutable() -> PropertyMap {
        let mut props = immutable(IFACE_CHANNEL_TYPE_CONTACT_SEARCH, &[]);
        props.insert(
            qualified(IFACE_CHANNEL_TYPE_CONTACT_SEARCH, "Limit"),
            Variant::from(5u32),
        );
        props.insert(
            qualified(IFACE_CHANNEL_TYPE_CONTACT_SEARCH, "AvailableSearchKeys"),
            Variant::StrList(vec!["fn".into(), "email".into()]),
        );
        props.insert(
            qualified(IFACE_CHANNEL_TYPE_CONTACT_SEARCH, "Server"),
            Variant::from("users.example.com"),
        );
        props
    }

    fn setup() -> (Arc<LoopbackBus>, ContactSearchChannel, Arc<ParkedContacts>) {
        let bus = LoopbackBus::new(":1.4");
        let contacts = Arc::new(ParkedContacts::default());
        let channel = Channel::new(bus.clone(), CONN, PATH, search_immutable());
        let search = ContactSearchChannel::with_contact_manager(channel, contacts.clone());
        (bus, search, contacts)
    }

    fn ready(bus: &LoopbackBus, search: &ContactSearchChannel) {
        let op = search.become_ready(Features::from([ContactSearchChannel::FEATURE_CORE]));
        let call = bus
            .take_call_on(PATH, "Get")
            .unwrap_or_else(|| panic!("Get(SearchState) not issued"));
        assert_eq!(
            call.call.args,
            vec![
                Variant::from(IFACE_CHANNEL_TYPE_CONTACT_SEARCH),
                Variant::from("SearchState")
            ]
        );
        call.reply(vec![Variant::from(0u32)]);
        assert!(op.is_valid());
    }

    fn record(search: &ContactSearchChannel) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        search.on_event(move |event| {
            let entry = match event {
                SearchEvent::StateChanged { state, .. } => format!("state {state:?}"),
                SearchEvent::ResultReceived(result) => {
                    let ids: Vec<&str> = result.keys().map(|c| c.id.as_str()).collect();
                    format!("result [{}]", ids.join(","))
                }
            };
            lock(&sink).push(entry);
        });
        seen
    }

    fn result_signal(ids: &[&str]) -> Vec<Variant> {
        let mut results = PropertyMap::new();
        for id in ids {
            let field = Variant::List(vec![
                Variant::from("fn"),
                Variant::StrList(Vec::new()),
                Variant::StrList(vec![format!("Name of {id}")]),
            ]);
            results.insert(id.to_string(), Variant::List(vec![field]));
        }
        vec![Variant::Map(results)]
    }

    fn state_signal(state: SearchState) -> Vec<Variant> {
        vec![
            Variant::from(state as u32),
            Variant::from(""),
            Variant::Map(PropertyMap::new()),
        ]
    }

    fn emit(bus: &LoopbackBus, member: &str, args: Vec<Variant>) {
        bus.emit(PATH, IFACE_CHANNEL_TYPE_CONTACT_SEARCH, member, args);
    }

    #[test]
    fn immutable_properties_skip_get_all() {
        let (bus, search, _contacts) = setup();
        ready(&bus, &search);
        assert_eq!(bus.call_count("GetAll"), 0);
        assert_eq!(search.limit(), 5);
        assert_eq!(search.server(), "users.example.com");
        assert_eq!(search.available_search_keys(), vec!["fn", "email"]);
        assert_eq!(search.search_state(), SearchState::NotStarted);
    }

    #[test]
    fn incomplete_immutable_properties_use_get_all() {
        let bus = LoopbackBus::new(":1.4");
        let channel = Channel::new(
            bus.clone(),
            CONN,
            PATH,
            immutable(IFACE_CHANNEL_TYPE_CONTACT_SEARCH, &[]),
        );
        let search =
            ContactSearchChannel::with_contact_manager(channel, Arc::new(ParkedContacts::default()));
        let op = search.become_ready(Features::from([ContactSearchChannel::FEATURE_CORE]));

        let mut props = PropertyMap::new();
        props.insert("SearchState".into(), Variant::from(SearchState::MoreAvailable as u32));
        props.insert("Limit".into(), Variant::from(9u32));
        bus.take_call_on(PATH, "GetAll")
            .unwrap_or_else(|| panic!("GetAll not issued"))
            .reply(vec![Variant::Map(props)]);

        assert!(op.is_valid());
        assert_eq!(search.limit(), 9);
        assert_eq!(search.search_state(), SearchState::MoreAvailable);
    }

    #[test]
    fn slow_result_is_announced_before_later_fast_entries() {
        let (bus, search, contacts) = setup();
        ready(&bus, &search);
        let seen = record(&search);

        emit(&bus, "SearchResultReceived", result_signal(&["Alice", "Bob"]));
        emit(&bus, "SearchResultReceived", result_signal(&[]));
        emit(&bus, "SearchStateChanged", state_signal(SearchState::Completed));
        assert!(lock(&seen).is_empty());
        assert_eq!(search.search_state(), SearchState::NotStarted);

        contacts.answer_next(&[]);
        assert_eq!(
            *lock(&seen),
            vec![
                "result [alice,bob]".to_string(),
                "result []".to_string(),
                "state Completed".to_string(),
            ]
        );
        assert_eq!(search.search_state(), SearchState::Completed);
    }

    #[test]
    fn failed_resolution_drops_only_that_batch() {
        let (bus, search, contacts) = setup();
        ready(&bus, &search);
        let seen = record(&search);

        emit(&bus, "SearchResultReceived", result_signal(&["Alice"]));
        emit(&bus, "SearchResultReceived", result_signal(&["Carol", "Nobody"]));
        contacts.fail_next();
        contacts.answer_next(&["Nobody"]);

        assert_eq!(*lock(&seen), vec!["result [carol]".to_string()]);
    }

    #[test]
    fn search_requires_ready_channel_and_fresh_state() {
        let (bus, search, _contacts) = setup();
        let early = search.search_for("fn", "alice");
        assert_eq!(early.error_message().as_deref(), Some("Channel not ready"));

        ready(&bus, &search);
        emit(&bus, "SearchStateChanged", state_signal(SearchState::InProgress));
        let again = search.search_for("fn", "alice");
        assert_eq!(again.error_message().as_deref(), Some("Search already started"));
        assert_eq!(bus.call_count("Search"), 0);
    }

    #[test]
    fn search_settles_once_when_reply_arrives_first() {
        let (bus, search, _contacts) = setup();
        ready(&bus, &search);
        let op = search.search_for("fn", "alice");
        let call = bus.take_call("Search").unwrap_or_else(|| panic!("Search not issued"));
        let mut terms = PropertyMap::new();
        terms.insert("fn".into(), Variant::from("alice"));
        assert_eq!(call.call.args, vec![Variant::Map(terms)]);

        call.reply(Vec::new());
        assert!(!op.is_finished());
        emit(&bus, "SearchStateChanged", state_signal(SearchState::InProgress));
        assert!(op.is_valid());
        emit(&bus, "SearchStateChanged", state_signal(SearchState::Completed));
        assert!(op.is_valid());
    }

    #[test]
    fn search_settles_once_when_state_change_arrives_first() {
        let (bus, search, _contacts) = setup();
        ready(&bus, &search);
        let op = search.search_for("fn", "alice");
        emit(&bus, "SearchStateChanged", state_signal(SearchState::InProgress));
        assert!(!op.is_finished());
        bus.take_call("Search")
            .unwrap_or_else(|| panic!("Search not issued"))
            .reply(Vec::new());
        assert!(op.is_valid());
    }

    #[test]
    fn failed_search_reply_settles_immediately() {
        let (bus, search, _contacts) = setup();
        ready(&bus, &search);
        let op = search.search_for("fn", "alice");
        bus.take_call("Search")
            .unwrap_or_else(|| panic!("Search not issued"))
            .fail(OperationError::invalid_argument("bad key"));
        assert_eq!(op.error_message().as_deref(), Some("bad key"));
        emit(&bus, "SearchStateChanged", state_signal(SearchState::Failed));
        assert!(op.is_error());
    }

    #[test]
    fn continue_and_stop_check_state() {
        let (bus, search, _contacts) = setup();
        ready(&bus, &search);
        assert!(search.continue_search().is_error());
        assert!(search.stop_search().is_error());

        emit(&bus, "SearchStateChanged", state_signal(SearchState::MoreAvailable));
        let more = search.continue_search();
        bus.take_call("More")
            .unwrap_or_else(|| panic!("More not issued"))
            .reply(Vec::new());
        emit(&bus, "SearchStateChanged", state_signal(SearchState::InProgress));
        assert!(more.is_valid());

        let stop = search.stop_search();
        emit(&bus, "SearchStateChanged", state_signal(SearchState::Completed));
        bus.take_call("Stop")
            .unwrap_or_else(|| panic!("Stop not issued"))
            .reply(Vec::new());
        assert!(stop.is_valid());
    }
}
