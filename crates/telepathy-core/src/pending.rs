//! Single-shot pending operations.
//!
//! A [`PendingOperation`] finishes exactly once, either successfully or with an
//! [`OperationError`]. Completion callbacks run on the thread that finishes the
//! operation; a callback attached after completion runs immediately.

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::warn;

use crate::constants::ERROR_HANDLING_ERROR;
use crate::error::OperationError;
use crate::feature::Features;
use crate::util::lock;

type FinishedCallback = Box<dyn FnOnce(&PendingOperation) + Send>;

#[derive(Default)]
struct OperationState {
    finished: bool,
    error: Option<OperationError>,
    callbacks: Vec<FinishedCallback>,
}

struct OperationInner {
    state: Mutex<OperationState>,
    done: watch::Sender<bool>,
}

/// Handle to the outcome of one asynchronous action. Clones share the outcome.
#[derive(Clone)]
pub struct PendingOperation {
    inner: Arc<OperationInner>,
}

impl PendingOperation {
    pub fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(OperationInner {
                state: Mutex::new(OperationState::default()),
                done,
            }),
        }
    }

    /// An operation that already finished successfully.
    pub fn succeeded() -> Self {
        let operation = Self::new();
        operation.finish_if_pending(None);
        operation
    }

    /// An operation that already finished with `error`.
    pub fn failed(error: OperationError) -> Self {
        let operation = Self::new();
        operation.finish_if_pending(Some(error));
        operation
    }

    pub fn from_result(result: Result<(), OperationError>) -> Self {
        match result {
            Ok(()) => Self::succeeded(),
            Err(error) => Self::failed(error),
        }
    }

    pub fn is_finished(&self) -> bool {
        lock(&self.inner.state).finished
    }

    /// Finished without error.
    pub fn is_valid(&self) -> bool {
        let state = lock(&self.inner.state);
        state.finished && state.error.is_none()
    }

    /// Finished with an error.
    pub fn is_error(&self) -> bool {
        let state = lock(&self.inner.state);
        state.finished && state.error.is_some()
    }

    pub fn error(&self) -> Option<OperationError> {
        lock(&self.inner.state).error.clone()
    }

    pub fn error_name(&self) -> Option<String> {
        lock(&self.inner.state)
            .error
            .as_ref()
            .map(|error| error.name.clone())
    }

    pub fn error_message(&self) -> Option<String> {
        lock(&self.inner.state)
            .error
            .as_ref()
            .map(|error| error.message.clone())
    }

    /// `None` while pending.
    pub fn result(&self) -> Option<Result<(), OperationError>> {
        let state = lock(&self.inner.state);
        if !state.finished {
            return None;
        }
        Some(match &state.error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        })
    }

    /// Whether both handles refer to the same operation.
    pub fn same_as(&self, other: &PendingOperation) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Finish successfully. Finishing twice is a programming error.
    pub fn set_finished(&self) {
        self.finish_once(None);
    }

    /// Finish with `error`. An empty error name is replaced with a generic one.
    pub fn set_finished_with_error(&self, error: OperationError) {
        self.finish_once(Some(error));
    }

    fn finish_once(&self, error: Option<OperationError>) {
        if self.finish_if_pending(error) {
            return;
        }
        warn!("pending operation finished more than once; ignoring");
        if cfg!(debug_assertions) {
            panic!("pending operation finished more than once");
        }
    }

    /// Finish unless already finished. Returns whether this call finished it.
    ///
    /// Used where two racing sources may both try to settle the operation.
    pub(crate) fn finish_if_pending(&self, error: Option<OperationError>) -> bool {
        let error = error.map(normalize_error);
        let callbacks = {
            let mut state = lock(&self.inner.state);
            if state.finished {
                return false;
            }
            state.finished = true;
            state.error = error;
            std::mem::take(&mut state.callbacks)
        };
        self.inner.done.send_replace(true);
        for callback in callbacks {
            callback(self);
        }
        true
    }

    /// Run `callback` once the operation finishes, or right away if it already has.
    pub fn on_finished<F>(&self, callback: F)
    where
        F: FnOnce(&PendingOperation) + Send + 'static,
    {
        {
            let mut state = lock(&self.inner.state);
            if !state.finished {
                state.callbacks.push(Box::new(callback));
                return;
            }
        }
        callback(self);
    }

    /// Wait for completion from async code.
    pub async fn finished(&self) -> Result<(), OperationError> {
        let mut receiver = self.inner.done.subscribe();
        loop {
            if *receiver.borrow_and_update() {
                break;
            }
            if receiver.changed().await.is_err() {
                break;
            }
        }
        self.result()
            .unwrap_or_else(|| Err(OperationError::cancelled("operation abandoned")))
    }
}

impl Default for PendingOperation {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("PendingOperation")
            .field("finished", &state.finished)
            .field("error", &state.error)
            .finish()
    }
}

fn normalize_error(error: OperationError) -> OperationError {
    if !error.name.is_empty() {
        return error;
    }
    warn!("operation finished with an empty error name");
    let message = if error.message.is_empty() {
        "operation failed without an error name".to_string()
    } else {
        error.message
    };
    OperationError::new(ERROR_HANDLING_ERROR, message)
}

/// A pending operation that also carries a typed reply value.
pub struct PendingReply<T> {
    operation: PendingOperation,
    value: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for PendingReply<T> {
    fn clone(&self) -> Self {
        Self {
            operation: self.operation.clone(),
            value: self.value.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> PendingReply<T> {
    pub fn new() -> Self {
        Self {
            operation: PendingOperation::new(),
            value: Arc::new(Mutex::new(None)),
        }
    }

    /// A reply that is already settled.
    pub fn ready(result: Result<T, OperationError>) -> Self {
        let reply = Self::new();
        reply.finish(result);
        reply
    }

    /// Settle the reply. Returns false if it was already settled.
    pub fn finish(&self, result: Result<T, OperationError>) -> bool {
        match result {
            Ok(value) => {
                if self.operation.is_finished() {
                    return false;
                }
                *lock(&self.value) = Some(value);
                self.operation.finish_if_pending(None)
            }
            Err(error) => self.operation.finish_if_pending(Some(error)),
        }
    }

    pub fn value(&self) -> Option<T> {
        lock(&self.value).as_ref().cloned()
    }

    pub fn operation(&self) -> &PendingOperation {
        &self.operation
    }

    pub fn into_operation(self) -> PendingOperation {
        self.operation
    }

    /// Run `callback` with the reply outcome once settled.
    pub fn on_reply<F>(&self, callback: F)
    where
        F: FnOnce(Result<T, OperationError>) + Send + 'static,
    {
        let value = self.value.clone();
        self.operation.on_finished(move |operation| {
            let result = match operation.error() {
                Some(error) => Err(error),
                None => lock(&value).as_ref().cloned().ok_or_else(|| {
                    OperationError::new(ERROR_HANDLING_ERROR, "reply finished without a value")
                }),
            };
            callback(result);
        });
    }

    /// Derive a reply whose value is computed from this one.
    pub fn map<U, F>(&self, transform: F) -> PendingReply<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U, OperationError> + Send + 'static,
    {
        let mapped = PendingReply::new();
        let out = mapped.clone();
        self.on_reply(move |result| {
            out.finish(result.and_then(transform));
        });
        mapped
    }

    pub async fn finished(&self) -> Result<T, OperationError> {
        self.operation.finished().await?;
        self.value().ok_or_else(|| {
            OperationError::new(ERROR_HANDLING_ERROR, "reply finished without a value")
        })
    }
}

impl<T: Clone + Send + 'static> Default for PendingReply<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Deref for PendingReply<T> {
    type Target = PendingOperation;

    fn deref(&self) -> &Self::Target {
        &self.operation
    }
}

impl<T> fmt::Debug for PendingReply<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PendingReply").field(&self.operation).finish()
    }
}

#[derive(Default)]
struct CompositeState {
    remaining: usize,
    first_error: Option<OperationError>,
}

/// Fan-in over several operations.
///
/// With `fail_on_first_error` the composite fails as soon as any input fails;
/// otherwise it waits for every input and reports the first error seen.
/// Inputs finishing after the composite settled are ignored.
#[derive(Clone, Debug)]
pub struct PendingComposite {
    operation: PendingOperation,
}

impl PendingComposite {
    pub fn new(operations: Vec<PendingOperation>, fail_on_first_error: bool) -> Self {
        let operation = PendingOperation::new();
        if operations.is_empty() {
            operation.finish_if_pending(None);
            return Self { operation };
        }

        let state = Arc::new(Mutex::new(CompositeState {
            remaining: operations.len(),
            first_error: None,
        }));
        for input in operations {
            let state = state.clone();
            let composite = operation.clone();
            input.on_finished(move |finished| {
                let outcome = {
                    let mut state = lock(&state);
                    state.remaining = state.remaining.saturating_sub(1);
                    if let Some(error) = finished.error() {
                        state.first_error.get_or_insert(error);
                    }
                    if (fail_on_first_error && state.first_error.is_some())
                        || state.remaining == 0
                    {
                        Some(state.first_error.clone())
                    } else {
                        None
                    }
                };
                if let Some(error) = outcome {
                    composite.finish_if_pending(error);
                }
            });
        }
        Self { operation }
    }

    pub fn operation(&self) -> &PendingOperation {
        &self.operation
    }

    pub fn into_operation(self) -> PendingOperation {
        self.operation
    }
}

impl Deref for PendingComposite {
    type Target = PendingOperation;

    fn deref(&self) -> &Self::Target {
        &self.operation
    }
}

/// Operation returned by `become_ready`, remembering which features were asked for.
#[derive(Clone, Debug)]
pub struct PendingReady {
    operation: PendingOperation,
    requested: Features,
}

impl PendingReady {
    pub(crate) fn new(requested: Features) -> Self {
        Self {
            operation: PendingOperation::new(),
            requested,
        }
    }

    pub(crate) fn failed(requested: Features, error: OperationError) -> Self {
        Self {
            operation: PendingOperation::failed(error),
            requested,
        }
    }

    pub(crate) fn succeeded(requested: Features) -> Self {
        Self {
            operation: PendingOperation::succeeded(),
            requested,
        }
    }

    pub fn requested_features(&self) -> &Features {
        &self.requested
    }

    pub fn operation(&self) -> &PendingOperation {
        &self.operation
    }

    pub fn into_operation(self) -> PendingOperation {
        self.operation
    }
}

impl Deref for PendingReady {
    type Target = PendingOperation;

    fn deref(&self) -> &Self::Target {
        &self.operation
    }
}
