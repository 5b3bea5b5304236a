//! In-process bus used by tests and local demos.
//!
//! Calls are parked until the owner replies to them, unless an automatic reply
//! was configured for the member. Signals are delivered synchronously from
//! [`LoopbackBus::emit`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use super::{MethodCall, RemoteBus, SignalHandler, SignalMatch, SignalSubscription, Variant};
use crate::error::OperationError;
use crate::pending::PendingReply;
use crate::util::lock;

type ReplyKey = (String, String, String);
type CannedReply = Result<Vec<Variant>, OperationError>;

#[derive(Default)]
struct LoopbackState {
    parked: VecDeque<PendingCall>,
    history: Vec<MethodCall>,
    canned: HashMap<ReplyKey, CannedReply>,
    subscriptions: Vec<(u64, SignalMatch, SignalHandler)>,
    next_subscription: u64,
}

/// A call waiting for its reply.
pub struct PendingCall {
    pub call: MethodCall,
    reply: PendingReply<Vec<Variant>>,
}

impl PendingCall {
    pub fn reply(self, args: Vec<Variant>) {
        self.reply.finish(Ok(args));
    }

    pub fn fail(self, error: OperationError) {
        self.reply.finish(Err(error));
    }
}

pub struct LoopbackBus {
    unique_name: String,
    me: Weak<LoopbackBus>,
    state: Mutex<LoopbackState>,
}

impl LoopbackBus {
    pub fn new(unique_name: impl Into<String>) -> Arc<Self> {
        let unique_name = unique_name.into();
        Arc::new_cyclic(|me| Self {
            unique_name,
            me: me.clone(),
            state: Mutex::new(LoopbackState::default()),
        })
    }

    /// Answer every future call to `path`/`interface.member` with `reply`.
    pub fn set_reply(&self, path: &str, interface: &str, member: &str, reply: CannedReply) {
        lock(&self.state).canned.insert(
            (path.to_string(), interface.to_string(), member.to_string()),
            reply,
        );
    }

    /// Take the oldest parked call to `member`.
    pub fn take_call(&self, member: &str) -> Option<PendingCall> {
        let mut state = lock(&self.state);
        let index = state
            .parked
            .iter()
            .position(|pending| pending.call.member == member)?;
        state.parked.remove(index)
    }

    /// Take the oldest parked call to `member` on `path`.
    pub fn take_call_on(&self, path: &str, member: &str) -> Option<PendingCall> {
        let mut state = lock(&self.state);
        let index = state
            .parked
            .iter()
            .position(|pending| pending.call.member == member && pending.call.path == path)?;
        state.parked.remove(index)
    }

    pub fn parked_calls(&self) -> Vec<MethodCall> {
        lock(&self.state)
            .parked
            .iter()
            .map(|pending| pending.call.clone())
            .collect()
    }

    /// How many calls were made to `member`, answered or not.
    pub fn call_count(&self, member: &str) -> usize {
        lock(&self.state)
            .history
            .iter()
            .filter(|call| call.member == member)
            .count()
    }

    pub fn calls(&self) -> Vec<MethodCall> {
        lock(&self.state).history.clone()
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.state).subscriptions.len()
    }

    /// Deliver a signal to every matching subscriber.
    pub fn emit(&self, path: &str, interface: &str, member: &str, args: Vec<Variant>) {
        let handlers: Vec<SignalHandler> = lock(&self.state)
            .subscriptions
            .iter()
            .filter(|(_, rule, _)| rule.matches(path, interface, member))
            .map(|(_, _, handler)| handler.clone())
            .collect();
        debug!(path, interface, member, receivers = handlers.len(), "loopback signal");
        for handler in handlers {
            handler(args.clone());
        }
    }
}

impl RemoteBus for LoopbackBus {
    fn unique_name(&self) -> String {
        self.unique_name.clone()
    }

    fn call(&self, call: MethodCall) -> PendingReply<Vec<Variant>> {
        let reply = PendingReply::new();
        let canned = {
            let mut state = lock(&self.state);
            state.history.push(call.clone());
            let key = (call.path.clone(), call.interface.clone(), call.member.clone());
            match state.canned.get(&key).cloned() {
                Some(canned) => Some(canned),
                None => {
                    state.parked.push_back(PendingCall {
                        call,
                        reply: reply.clone(),
                    });
                    None
                }
            }
        };
        if let Some(canned) = canned {
            reply.finish(canned);
        }
        reply
    }

    fn subscribe(&self, rule: SignalMatch, handler: SignalHandler) -> SignalSubscription {
        let id = {
            let mut state = lock(&self.state);
            state.next_subscription += 1;
            let id = state.next_subscription;
            state.subscriptions.push((id, rule, handler));
            id
        };
        let bus = self.me.clone();
        SignalSubscription::new(move || {
            if let Some(bus) = bus.upgrade() {
                lock(&bus.state)
                    .subscriptions
                    .retain(|(existing, _, _)| *existing != id);
            }
        })
    }
}
