//! Ordered delivery of remote events that need asynchronous resolution.
//!
//! Entries are handed to the processor one at a time, in enqueue order. The
//! processor receives a [`QueueStep`] and the next entry is not started until
//! that step is completed, either explicitly with [`QueueStep::done`] or by
//! dropping it. A step completed inside the processor call continues the drain
//! in the same loop, so fast entries never overtake slow ones.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use crate::util::lock;

type Processor<E> = Box<dyn Fn(E, QueueStep<E>) + Send + Sync>;

struct QueueState<E> {
    entries: VecDeque<E>,
    busy: bool,
    draining: bool,
    paused: bool,
}

struct QueueInner<E> {
    state: Mutex<QueueState<E>>,
    processor: Processor<E>,
}

pub struct SignalQueue<E> {
    inner: Arc<QueueInner<E>>,
}

impl<E> Clone for SignalQueue<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: Send + 'static> SignalQueue<E> {
    pub fn new<F>(processor: F) -> Self
    where
        F: Fn(E, QueueStep<E>) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    entries: VecDeque::new(),
                    busy: false,
                    draining: false,
                    paused: false,
                }),
                processor: Box::new(processor),
            }),
        }
    }

    pub fn enqueue(&self, entry: E) {
        lock(&self.inner.state).entries.push_back(entry);
        drain(&self.inner);
    }

    /// Hold entries without processing them until unpaused.
    pub fn set_paused(&self, paused: bool) {
        lock(&self.inner.state).paused = paused;
        if !paused {
            drain(&self.inner);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// No entry waiting and none being processed.
    pub fn is_idle(&self) -> bool {
        let state = lock(&self.inner.state);
        state.entries.is_empty() && !state.busy
    }
}

fn drain<E>(inner: &Arc<QueueInner<E>>) {
    {
        let mut state = lock(&inner.state);
        // A step completed inside the processor lands here; the outer loop
        // picks up the next entry instead.
        if state.draining {
            return;
        }
        state.draining = true;
    }
    loop {
        let entry = {
            let mut state = lock(&inner.state);
            // Busy means a step is still out; its completion restarts draining.
            let next = if state.busy || state.paused {
                None
            } else {
                state.entries.pop_front()
            };
            match next {
                Some(entry) => {
                    state.busy = true;
                    entry
                }
                None => {
                    state.draining = false;
                    return;
                }
            }
        };
        let step = QueueStep {
            queue: Some(Arc::downgrade(inner)),
        };
        (inner.processor)(entry, step);
    }
}

/// Completion token for the entry currently being processed.
pub struct QueueStep<E> {
    queue: Option<Weak<QueueInner<E>>>,
}

impl<E> QueueStep<E> {
    /// Mark the current entry handled and move on to the next one.
    pub fn done(mut self) {
        self.complete();
    }

    fn complete(&mut self) {
        // `take` makes done-then-drop a single completion.
        let Some(queue) = self.queue.take().and_then(|weak| weak.upgrade()) else {
            return;
        };
        lock(&queue.state).busy = false;
        drain(&queue);
    }
}

// A step dropped on an error path still releases the queue.
impl<E> Drop for QueueStep<E> {
    fn drop(&mut self) {
        self.complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Parked = Arc<Mutex<Vec<QueueStep<(u32, bool)>>>>;

    /// Entries are `(id, slow)`; slow entries park their step for the test to release.
    fn queue() -> (SignalQueue<(u32, bool)>, Arc<Mutex<Vec<u32>>>, Parked) {
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let parked: Parked = Arc::new(Mutex::new(Vec::new()));
        let sink = emitted.clone();
        let park = parked.clone();
        let queue = SignalQueue::new(move |(id, slow): (u32, bool), step| {
            if slow {
                lock(&park).push(step);
            } else {
                lock(&sink).push(id);
                step.done();
            }
        });
        (queue, emitted, parked)
    }

    fn release(parked: &Parked, emitted: &Arc<Mutex<Vec<u32>>>, id: u32) {
        let step = lock(parked).pop();
        lock(emitted).push(id);
        if let Some(step) = step {
            step.done();
        }
    }

    #[test]
    fn fast_entry_waits_for_slow_predecessor() {
        let (queue, emitted, parked) = queue();
        queue.enqueue((1, true));
        queue.enqueue((2, false));
        assert!(lock(&emitted).is_empty());
        assert_eq!(queue.len(), 1);
        assert!(!queue.is_idle());

        release(&parked, &emitted, 1);
        assert_eq!(*lock(&emitted), vec![1, 2]);
        assert!(queue.is_idle());
    }

    #[test]
    fn synchronous_entries_drain_in_one_pass() {
        let (queue, emitted, _parked) = queue();
        for id in 0..5 {
            queue.enqueue((id, false));
        }
        assert_eq!(*lock(&emitted), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn dropping_a_step_releases_the_queue() {
        let (queue, emitted, parked) = queue();
        queue.enqueue((1, true));
        queue.enqueue((2, false));
        // Resolution failed: the entry is dropped without an emission.
        let step = lock(&parked).pop();
        drop(step);
        assert_eq!(*lock(&emitted), vec![2]);
    }

    #[test]
    fn paused_queue_holds_entries() {
        let (queue, emitted, _parked) = queue();
        queue.set_paused(true);
        queue.enqueue((1, false));
        queue.enqueue((2, false));
        assert!(lock(&emitted).is_empty());
        queue.set_paused(false);
        assert_eq!(*lock(&emitted), vec![1, 2]);
    }
}
