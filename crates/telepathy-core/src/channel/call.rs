//! Call channels and their contents.

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, Weak};

use serde_repr::Serialize_repr;
use tracing::{debug, warn};

use super::Channel;
use crate::constants::{IFACE_CALL_CONTENT, IFACE_CHANNEL_INTERFACE_HOLD, IFACE_CHANNEL_TYPE_CALL};
use crate::error::OperationError;
use crate::events::{EventHub, ListenerId};
use crate::feature::{Feature, Features};
use crate::pending::{PendingOperation, PendingReady};
use crate::proxy::DBusProxy;
use crate::readiness::Introspectable;
use crate::transport::{
    prop_bool, prop_string, prop_u32, PropertyMap, RemoteBus, Variant,
};
use crate::util::{lock, log_snippet};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize_repr)]
#[repr(u32)]
pub enum CallState {
    #[default]
    Unknown = 0,
    PendingInitiator = 1,
    Initialising = 2,
    Initialised = 3,
    Accepted = 4,
    Active = 5,
    Ended = 6,
}

impl CallState {
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::PendingInitiator,
            2 => Self::Initialising,
            3 => Self::Initialised,
            4 => Self::Accepted,
            5 => Self::Active,
            6 => Self::Ended,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize_repr)]
#[repr(u32)]
pub enum LocalHoldState {
    #[default]
    Unheld = 0,
    Held = 1,
    PendingHold = 2,
    PendingUnhold = 3,
}

impl LocalHoldState {
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Held,
            2 => Self::PendingHold,
            3 => Self::PendingUnhold,
            _ => Self::Unheld,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize_repr)]
#[repr(u32)]
pub enum LocalHoldStateReason {
    #[default]
    None = 0,
    Requested = 1,
    ResourceNotAvailable = 2,
}

impl LocalHoldStateReason {
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Requested,
            2 => Self::ResourceNotAvailable,
            _ => Self::None,
        }
    }
}

/// Why the call state changed or a content went away.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CallStateReason {
    pub actor: u32,
    pub reason: u32,
    pub dbus_reason: String,
    pub message: String,
}

impl CallStateReason {
    fn from_variant(value: Option<&Variant>) -> Self {
        let Some(fields) = value.and_then(Variant::as_list) else {
            return Self::default();
        };
        let text = |index: usize| {
            fields
                .get(index)
                .and_then(Variant::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Self {
            actor: fields.first().and_then(Variant::as_u32).unwrap_or_default(),
            reason: fields.get(1).and_then(Variant::as_u32).unwrap_or_default(),
            dbus_reason: text(2),
            message: text(3),
        }
    }
}

/// Public notifications of a [`CallChannel`].
#[derive(Debug, Clone)]
pub enum CallEvent {
    ContentAdded(CallContent),
    ContentRemoved {
        content: CallContent,
        reason: CallStateReason,
    },
    CallStateChanged {
        state: CallState,
        flags: u32,
        reason: CallStateReason,
    },
    LocalHoldStateChanged {
        state: LocalHoldState,
        reason: LocalHoldStateReason,
    },
}

#[derive(Default)]
struct ContentState {
    name: String,
    content_type: u32,
    disposition: u32,
    streams: Vec<String>,
}

struct ContentInner {
    proxy: DBusProxy,
    state: Mutex<ContentState>,
}

/// One media content of a call.
#[derive(Clone)]
pub struct CallContent {
    inner: Arc<ContentInner>,
}

impl CallContent {
    pub const FEATURE_CORE: Feature = Feature::new("CallContent", 0);

    fn new(bus: Arc<dyn RemoteBus>, bus_name: &str, object_path: &str) -> Self {
        let inner = Arc::new(ContentInner {
            proxy: DBusProxy::new(bus, bus_name, object_path),
            state: Mutex::new(ContentState::default()),
        });
        let weak = Arc::downgrade(&inner);
        let registered = inner.proxy.readiness().add_introspectables([(
            Self::FEATURE_CORE,
            Introspectable::new(move || introspect_content(&weak)),
        )]);
        if let Err(err) = registered {
            warn!(error = %err, "failed to register content core feature");
        }
        Self { inner }
    }

    pub fn proxy(&self) -> &DBusProxy {
        &self.inner.proxy
    }

    pub fn object_path(&self) -> &str {
        self.inner.proxy.object_path()
    }

    pub fn name(&self) -> String {
        lock(&self.inner.state).name.clone()
    }

    /// Media type (audio 0, video 1).
    pub fn content_type(&self) -> u32 {
        lock(&self.inner.state).content_type
    }

    pub fn disposition(&self) -> u32 {
        lock(&self.inner.state).disposition
    }

    /// Object paths of the content's streams.
    pub fn streams(&self) -> Vec<String> {
        lock(&self.inner.state).streams.clone()
    }

    pub fn is_valid(&self) -> bool {
        self.inner.proxy.is_valid()
    }

    fn become_ready(&self) -> PendingReady {
        self.inner
            .proxy
            .become_ready(Features::from([Self::FEATURE_CORE]))
    }
}

fn introspect_content(weak: &Weak<ContentInner>) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let weak = weak.clone();
    inner.proxy.get_all(IFACE_CALL_CONTENT).on_reply(move |reply| {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let result = match reply {
            Ok(props) => {
                let mut state = lock(&inner.state);
                state.name = prop_string(&props, "Name").unwrap_or_default();
                state.content_type = prop_u32(&props, "Type").unwrap_or_default();
                state.disposition = prop_u32(&props, "Disposition").unwrap_or_default();
                state.streams = props
                    .get("Streams")
                    .and_then(Variant::as_object_path_list)
                    .unwrap_or_default();
                Ok(())
            }
            Err(error) => {
                warn!(
                    path = %inner.proxy.object_path(),
                    error = %log_snippet(&error.to_string()),
                    "Properties.GetAll(Call1.Content) failed"
                );
                Err(error)
            }
        };
        inner
            .proxy
            .readiness()
            .set_introspect_completed(CallContent::FEATURE_CORE, result);
    });
}

impl PartialEq for CallContent {
    fn eq(&self, other: &Self) -> bool {
        self.object_path() == other.object_path()
    }
}

impl Eq for CallContent {}

impl fmt::Debug for CallContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContent")
            .field("path", &self.object_path())
            .field("name", &self.name())
            .finish()
    }
}

#[derive(Default)]
struct CallProps {
    state: CallState,
    flags: u32,
    reason: CallStateReason,
    details: PropertyMap,
    hardware_streaming: bool,
    initial_transport: u32,
    initial_audio: bool,
    initial_video: bool,
    initial_audio_name: String,
    initial_video_name: String,
    mutable_contents: bool,
}

#[derive(Default)]
struct CallInner {
    props: CallProps,
    contents: Vec<CallContent>,
    // Contents still becoming ready; never announced.
    incomplete: Vec<CallContent>,
    properties_received: bool,
    contents_announced: bool,
    hold_state: LocalHoldState,
    hold_reason: LocalHoldStateReason,
    hold_announced: bool,
}

impl CallInner {
    fn lookup(&self, path: &str) -> Option<CallContent> {
        self.contents
            .iter()
            .chain(self.incomplete.iter())
            .find(|content| content.object_path() == path)
            .cloned()
    }

    /// Whether the contents feature can now be reported complete. Marks it so.
    fn take_contents_completion(&mut self) -> bool {
        if self.contents_announced || !self.properties_received || !self.incomplete.is_empty() {
            return false;
        }
        self.contents_announced = true;
        true
    }
}

struct CallShared {
    proxy: DBusProxy,
    state: Mutex<CallInner>,
    events: EventHub<CallEvent>,
}

/// A channel of type `Call1`.
#[derive(Clone)]
pub struct CallChannel {
    channel: Channel,
    shared: Arc<CallShared>,
}

impl CallChannel {
    pub const FEATURE_CONTENTS: Feature = Feature::new("CallChannel", 0);
    pub const FEATURE_LOCAL_HOLD_STATE: Feature = Feature::new("CallChannel", 1);

    pub fn new(
        bus: Arc<dyn RemoteBus>,
        bus_name: &str,
        object_path: &str,
        immutable: PropertyMap,
    ) -> Self {
        Self::wrap(Channel::new(bus, bus_name, object_path, immutable))
    }

    pub(crate) fn wrap(channel: Channel) -> Self {
        let shared = Arc::new(CallShared {
            proxy: channel.proxy().clone(),
            state: Mutex::new(CallInner::default()),
            events: EventHub::new(),
        });

        let contents = Arc::downgrade(&shared);
        let hold = Arc::downgrade(&shared);
        let registered = channel.proxy().readiness().add_introspectables([
            (
                Self::FEATURE_CONTENTS,
                Introspectable::new(move || introspect_contents(&contents))
                    .depends_on([Channel::FEATURE_CORE]),
            ),
            (
                Self::FEATURE_LOCAL_HOLD_STATE,
                Introspectable::new(move || introspect_hold(&hold))
                    .depends_on([Channel::FEATURE_CORE])
                    .requires_interfaces([IFACE_CHANNEL_INTERFACE_HOLD]),
            ),
        ]);
        if let Err(err) = registered {
            warn!(error = %err, "failed to register call channel features");
        }

        let weak = Arc::downgrade(&shared);
        channel.on_invalidated(move |error| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let dropped: Vec<CallContent> = {
                let mut state = lock(&shared.state);
                let mut dropped = std::mem::take(&mut state.contents);
                dropped.append(&mut state.incomplete);
                dropped
            };
            for content in dropped {
                content.proxy().invalidate(error.clone());
            }
        });

        channel.attach_extension(shared.clone());
        Self { channel, shared }
    }

    /// Recover the typed channel from a channel built by the factory.
    pub fn from_channel(channel: &Channel) -> Option<Self> {
        let shared = channel.extension::<CallShared>()?;
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
        F: Fn(&CallEvent) + Send + Sync + 'static,
    {
        self.shared.events.connect(listener)
    }

    pub fn disconnect_event(&self, id: ListenerId) -> bool {
        self.shared.events.disconnect(id)
    }

    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<CallEvent> {
        self.shared.events.subscribe()
    }

    pub fn call_state(&self) -> CallState {
        lock(&self.shared.state).props.state
    }

    pub fn call_flags(&self) -> u32 {
        lock(&self.shared.state).props.flags
    }

    pub fn call_state_reason(&self) -> CallStateReason {
        lock(&self.shared.state).props.reason.clone()
    }

    pub fn call_state_details(&self) -> PropertyMap {
        lock(&self.shared.state).props.details.clone()
    }

    pub fn hardware_streaming(&self) -> bool {
        lock(&self.shared.state).props.hardware_streaming
    }

    pub fn initial_transport(&self) -> u32 {
        lock(&self.shared.state).props.initial_transport
    }

    pub fn has_initial_audio(&self) -> bool {
        lock(&self.shared.state).props.initial_audio
    }

    pub fn initial_audio_name(&self) -> String {
        lock(&self.shared.state).props.initial_audio_name.clone()
    }

    pub fn has_initial_video(&self) -> bool {
        lock(&self.shared.state).props.initial_video
    }

    pub fn initial_video_name(&self) -> String {
        lock(&self.shared.state).props.initial_video_name.clone()
    }

    pub fn has_mutable_contents(&self) -> bool {
        lock(&self.shared.state).props.mutable_contents
    }

    /// Ready contents. Meaningful once [`Self::FEATURE_CONTENTS`] is ready.
    pub fn contents(&self) -> Vec<CallContent> {
        lock(&self.shared.state).contents.clone()
    }

    pub fn content_by_name(&self, name: &str) -> Option<CallContent> {
        lock(&self.shared.state)
            .contents
            .iter()
            .find(|content| content.name() == name)
            .cloned()
    }

    pub fn local_hold_state(&self) -> LocalHoldState {
        lock(&self.shared.state).hold_state
    }

    pub fn local_hold_state_reason(&self) -> LocalHoldStateReason {
        lock(&self.shared.state).hold_reason
    }

    /// Put the call on hold or take it off hold.
    pub fn request_hold(&self, hold: bool) -> PendingOperation {
        if !self.channel.has_interface(IFACE_CHANNEL_INTERFACE_HOLD) {
            warn!(path = %self.object_path(), "request_hold used with no hold interface");
            return PendingOperation::failed(OperationError::not_implemented(
                "CallChannel does not support hold interface",
            ));
        }
        self.shared.proxy.call_void(
            IFACE_CHANNEL_INTERFACE_HOLD,
            "RequestHold",
            vec![Variant::from(hold)],
        )
    }

    /// Remove `content` from the call.
    ///
    /// Finishes once the removal was both acknowledged and announced, or as
    /// soon as the request fails.
    pub fn remove_content(&self, content: &CallContent) -> PendingOperation {
        let operation = PendingOperation::new();
        let path = content.object_path().to_string();

        // Either side may settle it; `finish_if_pending` keeps it single.
        let target = operation.clone();
        let listener_path = path.clone();
        let listener = self.shared.events.connect(move |event| {
            if let CallEvent::ContentRemoved { content, .. } = event {
                if content.object_path() == listener_path {
                    target.finish_if_pending(None);
                }
            }
        });
        let events = Arc::downgrade(&self.shared);
        operation.on_finished(move |_| {
            if let Some(shared) = events.upgrade() {
                shared.events.disconnect(listener);
            }
        });

        let reply = content.proxy().call_void(IFACE_CALL_CONTENT, "Remove", Vec::new());
        self.shared.proxy.cancel_on_invalidation(&operation);
        let target = operation.clone();
        let shared = Arc::downgrade(&self.shared);
        reply.on_finished(move |reply| {
            if let Some(error) = reply.error() {
                target.finish_if_pending(Some(error));
                return;
            }
            // Reply after the signal: already finished. Reply first: wait
            // for the signal unless the content is already gone.
            let still_present = shared
                .upgrade()
                .map(|shared| lock(&shared.state).contents.iter().any(|c| c.object_path() == path))
                .unwrap_or(false);
            if !still_present {
                target.finish_if_pending(None);
            }
        });
        operation
    }
}

impl Deref for CallChannel {
    type Target = Channel;

    fn deref(&self) -> &Self::Target {
        &self.channel
    }
}

impl fmt::Debug for CallChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallChannel")
            .field("path", &self.object_path())
            .field("state", &self.call_state())
            .finish()
    }
}

fn introspect_contents(weak: &Weak<CallShared>) {
    let Some(shared) = weak.upgrade() else {
        return;
    };
    let proxy = &shared.proxy;

    let added = weak.clone();
    proxy.connect_signal(IFACE_CHANNEL_TYPE_CALL, "ContentAdded", "o", move |args| {
        let (Some(shared), Some(path)) = (
            added.upgrade(),
            args.first().and_then(Variant::as_object_path),
        ) else {
            return;
        };
        on_content_added(&shared, path);
    });

    let removed = weak.clone();
    proxy.connect_signal(IFACE_CHANNEL_TYPE_CALL, "ContentRemoved", "o(uuss)", move |args| {
        let (Some(shared), Some(path)) = (
            removed.upgrade(),
            args.first().and_then(Variant::as_object_path),
        ) else {
            return;
        };
        on_content_removed(&shared, path, CallStateReason::from_variant(args.get(1)));
    });

    let changed = weak.clone();
    proxy.connect_signal(
        IFACE_CHANNEL_TYPE_CALL,
        "CallStateChanged",
        "uu(uuss)a{sv}",
        move |args| {
            let Some(shared) = changed.upgrade() else {
                return;
            };
            on_call_state_changed(&shared, &args);
        },
    );

    let weak = weak.clone();
    proxy.get_all(IFACE_CHANNEL_TYPE_CALL).on_reply(move |reply| {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let props = match reply {
            Ok(props) => props,
            Err(error) => {
                warn!(
                    path = %shared.proxy.object_path(),
                    error = %log_snippet(&error.to_string()),
                    "Properties.GetAll(Call1) failed"
                );
                shared
                    .proxy
                    .readiness()
                    .set_introspect_completed(CallChannel::FEATURE_CONTENTS, Err(error));
                return;
            }
        };
        debug!(path = %shared.proxy.object_path(), "got Call1 properties");

        let paths = props
            .get("Contents")
            .and_then(Variant::as_object_path_list)
            .unwrap_or_default();
        // Every listed content must be tracked before any of them is watched:
        // a content that settles synchronously would otherwise find the
        // incomplete set empty and complete the feature early.
        let (fresh, complete) = {
            let mut state = lock(&shared.state);
            state.props = CallProps {
                state: CallState::from_u32(prop_u32(&props, "CallState").unwrap_or_default()),
                flags: prop_u32(&props, "CallFlags").unwrap_or_default(),
                reason: CallStateReason::from_variant(props.get("CallStateReason")),
                details: props
                    .get("CallStateDetails")
                    .and_then(Variant::as_map)
                    .cloned()
                    .unwrap_or_default(),
                hardware_streaming: prop_bool(&props, "HardwareStreaming").unwrap_or_default(),
                initial_transport: prop_u32(&props, "InitialTransport").unwrap_or_default(),
                initial_audio: prop_bool(&props, "InitialAudio").unwrap_or_default(),
                initial_video: prop_bool(&props, "InitialVideo").unwrap_or_default(),
                initial_audio_name: prop_string(&props, "InitialAudioName").unwrap_or_default(),
                initial_video_name: prop_string(&props, "InitialVideoName").unwrap_or_default(),
                mutable_contents: prop_bool(&props, "MutableContents").unwrap_or_default(),
            };
            state.properties_received = true;
            let fresh: Vec<CallContent> = paths
                .iter()
                .filter_map(|path| track_content(&shared, &mut state, path))
                .collect();
            (fresh, state.take_contents_completion())
        };
        for content in fresh {
            watch_content(&shared, content);
        }
        if complete {
            complete_contents(&shared);
        }
    });
}

/// Registers `path` as incomplete unless it is already known.
fn track_content(shared: &CallShared, state: &mut CallInner, path: &str) -> Option<CallContent> {
    if state.lookup(path).is_some() {
        return None;
    }
    let content = CallContent::new(shared.proxy.bus().clone(), shared.proxy.bus_name(), path);
    state.incomplete.push(content.clone());
    Some(content)
}

fn watch_content(shared: &Arc<CallShared>, content: CallContent) {
    let weak = Arc::downgrade(shared);
    let ready = content.clone();
    content.become_ready().on_finished(move |operation| {
        if let Some(shared) = weak.upgrade() {
            on_content_ready(&shared, ready, operation.error());
        }
    });
}

fn on_content_added(shared: &Arc<CallShared>, path: &str) {
    debug!(path, "ContentAdded");
    let fresh = track_content(shared, &mut lock(&shared.state), path);
    match fresh {
        Some(content) => watch_content(shared, content),
        None => debug!(path, "content already known, ignoring"),
    }
}

fn on_content_ready(shared: &Arc<CallShared>, content: CallContent, error: Option<OperationError>) {
    let (announce, complete) = {
        let mut state = lock(&shared.state);
        let Some(index) = state.incomplete.iter().position(|c| *c == content) else {
            // Removed before it became ready.
            let complete = state.take_contents_completion();
            drop(state);
            if complete {
                complete_contents(shared);
            }
            return;
        };
        state.incomplete.remove(index);
        let announce = match &error {
            Some(error) => {
                debug!(
                    path = %content.object_path(),
                    error = %error,
                    "content failed to become ready, dropping it"
                );
                false
            }
            None => {
                state.contents.push(content.clone());
                state.contents_announced
            }
        };
        (announce, state.take_contents_completion())
    };
    if announce {
        shared.events.emit(&CallEvent::ContentAdded(content));
    }
    if complete {
        complete_contents(shared);
    }
}

fn on_content_removed(shared: &Arc<CallShared>, path: &str, reason: CallStateReason) {
    debug!(path, "ContentRemoved");
    let (removed, announce, complete) = {
        let mut state = lock(&shared.state);
        if let Some(index) = state.incomplete.iter().position(|c| c.object_path() == path) {
            let removed = state.incomplete.remove(index);
            (removed, false, state.take_contents_completion())
        } else if let Some(index) = state.contents.iter().position(|c| c.object_path() == path) {
            let removed = state.contents.remove(index);
            (removed, state.contents_announced, state.take_contents_completion())
        } else {
            debug!(path, "content not known, ignoring");
            return;
        }
    };
    if announce {
        shared.events.emit(&CallEvent::ContentRemoved {
            content: removed.clone(),
            reason,
        });
    }
    removed
        .proxy()
        .invalidate(OperationError::cancelled("Content removed"));
    if complete {
        complete_contents(shared);
    }
}

fn complete_contents(shared: &CallShared) {
    shared
        .proxy
        .readiness()
        .set_introspect_completed(CallChannel::FEATURE_CONTENTS, Ok(()));
}

fn on_call_state_changed(shared: &CallShared, args: &[Variant]) {
    let state = CallState::from_u32(args.first().and_then(Variant::as_u32).unwrap_or_default());
    let flags = args.get(1).and_then(Variant::as_u32).unwrap_or_default();
    let reason = CallStateReason::from_variant(args.get(2));
    let details = args
        .get(3)
        .and_then(Variant::as_map)
        .cloned()
        .unwrap_or_default();
    {
        let mut current = lock(&shared.state);
        let props = &mut current.props;
        if props.state == state
            && props.flags == flags
            && props.reason == reason
            && props.details == details
        {
            return;
        }
        props.state = state;
        props.flags = flags;
        props.reason = reason.clone();
        props.details = details;
    }
    debug!(path = %shared.proxy.object_path(), ?state, "call state changed");
    shared.events.emit(&CallEvent::CallStateChanged {
        state,
        flags,
        reason,
    });
}

fn introspect_hold(weak: &Weak<CallShared>) {
    let Some(shared) = weak.upgrade() else {
        return;
    };

    let changed = weak.clone();
    shared.proxy.connect_signal(
        IFACE_CHANNEL_INTERFACE_HOLD,
        "HoldStateChanged",
        "uu",
        move |args| {
            let Some(shared) = changed.upgrade() else {
                return;
            };
            let state = args.first().and_then(Variant::as_u32).unwrap_or_default();
            let reason = args.get(1).and_then(Variant::as_u32).unwrap_or_default();
            on_hold_state_changed(
                &shared,
                LocalHoldState::from_u32(state),
                LocalHoldStateReason::from_u32(reason),
            );
        },
    );

    let weak = weak.clone();
    shared
        .proxy
        .call(IFACE_CHANNEL_INTERFACE_HOLD, "GetHoldState", Vec::new(), "uu")
        .on_reply(move |reply| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let (state, reason) = match reply {
                Ok(args) => (
                    LocalHoldState::from_u32(
                        args.first().and_then(Variant::as_u32).unwrap_or_default(),
                    ),
                    LocalHoldStateReason::from_u32(
                        args.get(1).and_then(Variant::as_u32).unwrap_or_default(),
                    ),
                ),
                Err(error) => {
                    warn!(
                        path = %shared.proxy.object_path(),
                        error = %log_snippet(&error.to_string()),
                        "GetHoldState failed, assuming the call is not held"
                    );
                    let current = lock(&shared.state);
                    (current.hold_state, current.hold_reason)
                }
            };
            on_hold_state_changed(&shared, state, reason);
        });
}

fn on_hold_state_changed(shared: &CallShared, hold: LocalHoldState, reason: LocalHoldStateReason) {
    let (first, changed) = {
        let mut state = lock(&shared.state);
        let changed = state.hold_state != hold || state.hold_reason != reason;
        state.hold_state = hold;
        state.hold_reason = reason;
        let first = !state.hold_announced;
        state.hold_announced = true;
        (first, changed)
    };
    if first {
        shared
            .proxy
            .readiness()
            .set_introspect_completed(CallChannel::FEATURE_LOCAL_HOLD_STATE, Ok(()));
    } else if changed {
        shared.events.emit(&CallEvent::LocalHoldStateChanged {
            state: hold,
            reason,
        });
    }
}
