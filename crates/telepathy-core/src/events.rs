//! Public notification fan-out for proxies.
//!
//! Listeners are plain callbacks run inline on emit; subscribers get a tokio
//! channel for consumption from async code. Emission never holds the hub lock
//! while user code runs, so listeners may connect or disconnect re-entrantly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::util::lock;

/// Token returned by [`EventHub::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

pub struct EventHub<E> {
    listeners: Mutex<Vec<(ListenerId, Listener<E>)>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<E>>>,
    next_id: AtomicU64,
}

impl<E: Clone + Send + 'static> EventHub<E> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn connect<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners).push((id, Arc::new(listener)));
        id
    }

    pub fn disconnect(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.subscribers).push(sender);
        receiver
    }

    pub fn emit(&self, event: &E) {
        let listeners: Vec<Listener<E>> = lock(&self.listeners)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
        // Closed receivers are pruned on the next emit.
        lock(&self.subscribers).retain(|sender| sender.send(event.clone()).is_ok());
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }
}

impl<E: Clone + Send + 'static> Default for EventHub<E> {
    fn default() -> Self {
        Self::new()
    }
}
