//! Feature introspection scheduling.
//!
//! A [`ReadinessHelper`] owns the `Feature -> Introspectable` registry of one
//! proxy. `become_ready` pulls in the dependency closure of the requested
//! features and runs each introspection callback once its dependencies are
//! satisfied and its interfaces are present. Callbacks report back through
//! [`ReadinessHelper::set_introspect_completed`], possibly re-entrantly; all
//! scheduling runs through a single drain loop so nothing recurses.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::error::{OperationError, ReadinessError};
use crate::feature::{Feature, Features};
use crate::pending::PendingReady;
use crate::util::lock;

/// Status value used by proxies that never change status (channels).
pub const DEFAULT_STATUS: u32 = 0;

type IntrospectFn = Arc<dyn Fn() + Send + Sync>;
type StatusListener = Arc<dyn Fn(u32) + Send + Sync>;

/// How to make one feature ready.
#[derive(Clone)]
pub struct Introspectable {
    makes_sense_for_statuses: BTreeSet<u32>,
    depends_on_features: Features,
    depends_on_interfaces: Vec<String>,
    introspect: IntrospectFn,
}

impl Introspectable {
    /// Introspectable for [`DEFAULT_STATUS`] with no dependencies.
    pub fn new<F>(introspect: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            makes_sense_for_statuses: BTreeSet::from([DEFAULT_STATUS]),
            depends_on_features: Features::new(),
            depends_on_interfaces: Vec::new(),
            introspect: Arc::new(introspect),
        }
    }

    pub fn for_statuses(mut self, statuses: impl IntoIterator<Item = u32>) -> Self {
        self.makes_sense_for_statuses = statuses.into_iter().collect();
        self
    }

    pub fn depends_on(mut self, features: impl IntoIterator<Item = Feature>) -> Self {
        self.depends_on_features.extend(features);
        self
    }

    pub fn requires_interfaces<I, S>(mut self, interfaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on_interfaces
            .extend(interfaces.into_iter().map(Into::into));
        self
    }

    pub fn makes_sense_for(&self, status: u32) -> bool {
        self.makes_sense_for_statuses.contains(&status)
    }

    pub fn depends_on_features(&self) -> &Features {
        &self.depends_on_features
    }

    pub fn depends_on_interfaces(&self) -> &[String] {
        &self.depends_on_interfaces
    }
}

impl fmt::Debug for Introspectable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Introspectable")
            .field("statuses", &self.makes_sense_for_statuses)
            .field("depends_on_features", &self.depends_on_features)
            .field("depends_on_interfaces", &self.depends_on_interfaces)
            .finish()
    }
}

struct HelperState {
    current_status: u32,
    pending_status: Option<u32>,
    introspectables: BTreeMap<Feature, Introspectable>,
    interfaces: Vec<String>,
    // Dependency-closed set of everything asked for so far.
    requested: Features,
    // Features some caller asked for by name.
    explicit: Features,
    satisfied: Features,
    missing: BTreeMap<Feature, OperationError>,
    in_flight: Features,
    requests: Vec<PendingReady>,
    invalidated: Option<OperationError>,
    status_announced: bool,
    draining: bool,
    dirty: bool,
    status_listeners: Vec<StatusListener>,
}

/// Side effects collected under the lock and run after it is released.
#[derive(Default)]
struct Actions {
    finish: Vec<(PendingReady, Option<OperationError>)>,
    introspect: Vec<(Feature, IntrospectFn)>,
    status_ready: Option<(u32, Vec<StatusListener>)>,
}

impl Actions {
    fn is_empty(&self) -> bool {
        self.finish.is_empty() && self.introspect.is_empty() && self.status_ready.is_none()
    }
}

struct HelperInner {
    state: Mutex<HelperState>,
}

impl Drop for HelperInner {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let requests = std::mem::take(&mut state.requests);
        for request in requests {
            request.finish_if_pending(Some(OperationError::cancelled("Destroyed")));
        }
    }
}

/// Per-proxy feature scheduler. Clones share state.
#[derive(Clone)]
pub struct ReadinessHelper {
    inner: Arc<HelperInner>,
}

impl ReadinessHelper {
    pub fn new(current_status: u32) -> Self {
        Self {
            inner: Arc::new(HelperInner {
                state: Mutex::new(HelperState {
                    current_status,
                    pending_status: None,
                    introspectables: BTreeMap::new(),
                    interfaces: Vec::new(),
                    requested: Features::new(),
                    explicit: Features::new(),
                    satisfied: Features::new(),
                    missing: BTreeMap::new(),
                    in_flight: Features::new(),
                    requests: Vec::new(),
                    invalidated: None,
                    status_announced: false,
                    draining: false,
                    dirty: false,
                    status_listeners: Vec::new(),
                }),
            }),
        }
    }

    /// Register a batch of features. The whole batch is rejected on a
    /// duplicate, an unknown dependency or a dependency cycle.
    pub fn add_introspectables<I>(&self, introspectables: I) -> Result<(), ReadinessError>
    where
        I: IntoIterator<Item = (Feature, Introspectable)>,
    {
        let mut state = lock(&self.inner.state);
        let mut batch: BTreeMap<Feature, Introspectable> = BTreeMap::new();
        for (feature, introspectable) in introspectables {
            if !feature.is_set() {
                return Err(ReadinessError::UnsetFeature);
            }
            if state.introspectables.contains_key(&feature) || batch.contains_key(&feature) {
                warn!(%feature, "feature registered twice");
                return Err(ReadinessError::DuplicateFeature(feature));
            }
            batch.insert(feature, introspectable);
        }

        for (feature, introspectable) in &batch {
            for dependency in &introspectable.depends_on_features {
                if !state.introspectables.contains_key(dependency) && !batch.contains_key(dependency)
                {
                    return Err(ReadinessError::UnknownDependency {
                        feature: *feature,
                        dependency: *dependency,
                    });
                }
            }
        }

        // Features already registered were checked when they were added, so a
        // cycle has to pass through the new batch.
        let lookup = |feature: &Feature| {
            batch
                .get(feature)
                .or_else(|| state.introspectables.get(feature))
                .map(|introspectable| &introspectable.depends_on_features)
        };
        for feature in batch.keys() {
            if reaches(feature, feature, &lookup) {
                return Err(ReadinessError::DependencyCycle(*feature));
            }
        }

        state.introspectables.extend(batch);
        Ok(())
    }

    pub fn current_status(&self) -> u32 {
        lock(&self.inner.state).current_status
    }

    /// Change the proxy status. Deferred while introspection is in flight.
    pub fn set_current_status(&self, status: u32) {
        {
            let mut state = lock(&self.inner.state);
            if state.current_status == status && state.pending_status.is_none() {
                return;
            }
            if !state.in_flight.is_empty() {
                debug!(status, "status changed while introspection is running");
                state.pending_status = Some(status);
                return;
            }
            apply_status(&mut state, status);
        }
        self.drain();
    }

    pub fn interfaces(&self) -> Vec<String> {
        lock(&self.inner.state).interfaces.clone()
    }

    pub fn has_interface(&self, interface: &str) -> bool {
        lock(&self.inner.state)
            .interfaces
            .iter()
            .any(|known| known == interface)
    }

    pub fn set_interfaces(&self, interfaces: Vec<String>) {
        lock(&self.inner.state).interfaces = interfaces;
    }

    pub fn requested_features(&self) -> Features {
        lock(&self.inner.state).requested.clone()
    }

    pub fn actual_features(&self) -> Features {
        lock(&self.inner.state).satisfied.clone()
    }

    pub fn missing_features(&self) -> Features {
        lock(&self.inner.state).missing.keys().copied().collect()
    }

    pub fn missing_error(&self, feature: Feature) -> Option<OperationError> {
        lock(&self.inner.state).missing.get(&feature).cloned()
    }

    /// True iff every feature is ready and the proxy has not been invalidated.
    pub fn is_ready(&self, features: &Features) -> bool {
        let state = lock(&self.inner.state);
        state.invalidated.is_none() && features.is_subset(&state.satisfied)
    }

    /// Like [`Self::is_ready`] but explains why not.
    pub fn check_ready(&self, features: &Features) -> Result<(), OperationError> {
        let state = lock(&self.inner.state);
        ready_outcome(&state, features)
    }

    pub fn on_status_ready<F>(&self, listener: F)
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        lock(&self.inner.state)
            .status_listeners
            .push(Arc::new(listener));
    }

    /// Start introspecting `features` and their dependencies.
    pub fn become_ready(&self, features: Features) -> PendingReady {
        let request = {
            let mut state = lock(&self.inner.state);
            if let Some(error) = &state.invalidated {
                return PendingReady::failed(features, error.clone());
            }
            if features.is_empty() {
                return PendingReady::succeeded(features);
            }
            if let Some(unknown) = features
                .iter()
                .find(|feature| !state.introspectables.contains_key(*feature))
            {
                warn!(feature = %unknown, "become_ready called with unsupported feature");
                return PendingReady::failed(
                    features,
                    OperationError::invalid_argument(
                        "Requested features contains unsupported feature",
                    ),
                );
            }
            if let Some(existing) = state
                .requests
                .iter()
                .find(|request| request.requested_features() == &features)
            {
                return existing.clone();
            }

            let closure = dependency_closure(&state.introspectables, &features);
            if !closure.is_subset(&state.requested) {
                state.status_announced = false;
            }
            state.requested.extend(closure);
            state.explicit.extend(features.iter().copied());

            let request = PendingReady::new(features);
            state.requests.push(request.clone());
            request
        };
        self.drain();
        request
    }

    /// Report the outcome of a feature's introspection.
    ///
    /// Ignored after invalidation and for features that are not in flight.
    pub fn set_introspect_completed(&self, feature: Feature, result: Result<(), OperationError>) {
        {
            let mut state = lock(&self.inner.state);
            if state.invalidated.is_some() {
                debug!(%feature, "ignoring introspection result for invalidated proxy");
                return;
            }
            if !state.in_flight.remove(&feature) {
                warn!(%feature, "introspection completed for a feature that is not in flight");
                return;
            }
            if let Some(status) = state.pending_status {
                // Results for the old status are stale.
                if !state.in_flight.is_empty() {
                    return;
                }
                apply_status(&mut state, status);
            } else {
                match result {
                    Ok(()) => {
                        debug!(%feature, "feature ready");
                        state.satisfied.insert(feature);
                    }
                    Err(error) => {
                        debug!(%feature, error = %error, "feature introspection failed");
                        state.missing.insert(feature, error);
                    }
                }
            }
        }
        self.drain();
    }

    /// Fail every pending request and stop scheduling; used on invalidation.
    pub fn abort(&self, error: OperationError) {
        let requests = {
            let mut state = lock(&self.inner.state);
            if state.invalidated.is_some() {
                return;
            }
            state.invalidated = Some(error.clone());
            state.satisfied.clear();
            state.missing.clear();
            state.in_flight.clear();
            state.pending_status = None;
            std::mem::take(&mut state.requests)
        };
        for request in requests {
            request.finish_if_pending(Some(error.clone()));
        }
    }

    pub fn is_aborted(&self) -> bool {
        lock(&self.inner.state).invalidated.is_some()
    }

    fn drain(&self) {
        {
            let mut state = lock(&self.inner.state);
            state.dirty = true;
            // Re-entered from a callback below: the running loop sees `dirty`
            // and plans again, so nothing recurses.
            if state.draining {
                return;
            }
            state.draining = true;
        }
        loop {
            let actions = {
                let mut state = lock(&self.inner.state);
                if !state.dirty {
                    state.draining = false;
                    break;
                }
                state.dirty = false;
                plan(&mut state)
            };
            if actions.is_empty() {
                continue;
            }
            // Callbacks run unlocked; each may complete features inline.
            for (request, error) in actions.finish {
                request.finish_if_pending(error);
            }
            if let Some((status, listeners)) = actions.status_ready {
                for listener in listeners {
                    listener(status);
                }
            }
            for (feature, introspect) in actions.introspect {
                debug!(%feature, "introspecting feature");
                introspect();
            }
        }
    }
}

impl fmt::Debug for ReadinessHelper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("ReadinessHelper")
            .field("status", &state.current_status)
            .field("requested", &state.requested)
            .field("satisfied", &state.satisfied)
            .field("missing", &state.missing)
            .field("in_flight", &state.in_flight)
            .finish()
    }
}

fn apply_status(state: &mut HelperState, status: u32) {
    state.current_status = status;
    state.pending_status = None;
    state.satisfied.clear();
    state.missing.clear();
    state.status_announced = false;
}

fn ready_outcome(state: &HelperState, features: &Features) -> Result<(), OperationError> {
    if let Some(error) = &state.invalidated {
        return Err(error.clone());
    }
    for feature in features {
        if let Some(error) = state.missing.get(feature) {
            return Err(error.clone());
        }
        if !state.satisfied.contains(feature) {
            return Err(OperationError::not_available(format!(
                "Feature {feature} is not ready"
            )));
        }
    }
    Ok(())
}

/// One scheduling pass: settle synchronous transitions, pick runnable
/// features, and collect requests that can finish.
fn plan(state: &mut HelperState) -> Actions {
    let mut actions = Actions::default();
    if state.invalidated.is_some() || state.pending_status.is_some() {
        return actions;
    }

    // Failures and skips settle features without a callback, which can
    // unblock or fail their dependents; repeat until nothing moves.
    loop {
        let mut changed = false;
        let pending: Vec<Feature> = state
            .requested
            .iter()
            .filter(|feature| {
                !state.satisfied.contains(*feature)
                    && !state.missing.contains_key(*feature)
                    && !state.in_flight.contains(*feature)
            })
            .copied()
            .collect();

        for feature in pending {
            let Some(introspectable) = state.introspectables.get(&feature).cloned() else {
                continue;
            };
            let deps = &introspectable.depends_on_features;
            if deps.iter().any(|dep| state.missing.contains_key(dep)) {
                state.missing.insert(
                    feature,
                    OperationError::not_available(
                        "Feature depends on other features that are not available",
                    ),
                );
                changed = true;
                continue;
            }
            if !deps.is_subset(&state.satisfied) {
                continue;
            }
            if !introspectable.makes_sense_for(state.current_status) {
                // Asked for by name: report it. Pulled in as a dependency: skip.
                if state.explicit.contains(&feature) {
                    state.missing.insert(
                        feature,
                        OperationError::not_available(
                            "Feature does not make sense for the current status",
                        ),
                    );
                } else {
                    state.satisfied.insert(feature);
                }
                changed = true;
                continue;
            }
            if let Some(absent) = introspectable
                .depends_on_interfaces
                .iter()
                .find(|interface| !state.interfaces.contains(*interface))
            {
                debug!(%feature, interface = %absent, "feature requires an absent interface");
                state.missing.insert(
                    feature,
                    OperationError::not_available(
                        "Feature depend on interfaces that are not available",
                    ),
                );
                changed = true;
                continue;
            }
            state.in_flight.insert(feature);
            actions.introspect.push((feature, introspectable.introspect.clone()));
        }

        if !changed {
            break;
        }
    }

    let mut still_pending = Vec::new();
    for request in std::mem::take(&mut state.requests) {
        let settled = request
            .requested_features()
            .iter()
            .all(|feature| state.satisfied.contains(feature) || state.missing.contains_key(feature));
        if settled {
            let error = ready_outcome(state, request.requested_features()).err();
            actions.finish.push((request, error));
        } else {
            still_pending.push(request);
        }
    }
    state.requests = still_pending;

    let all_settled = state
        .requested
        .iter()
        .all(|feature| state.satisfied.contains(feature) || state.missing.contains_key(feature));
    if all_settled && !state.requested.is_empty() && !state.status_announced {
        state.status_announced = true;
        actions.status_ready = Some((state.current_status, state.status_listeners.clone()));
    }

    actions
}

fn dependency_closure(
    introspectables: &BTreeMap<Feature, Introspectable>,
    features: &Features,
) -> Features {
    let mut closure = Features::new();
    let mut stack: Vec<Feature> = features.iter().copied().collect();
    while let Some(feature) = stack.pop() {
        if !closure.insert(feature) {
            continue;
        }
        if let Some(introspectable) = introspectables.get(&feature) {
            stack.extend(introspectable.depends_on_features.iter().copied());
        }
    }
    closure
}

fn reaches<'a, L>(start: &Feature, target: &Feature, lookup: &L) -> bool
where
    L: Fn(&Feature) -> Option<&'a Features>,
{
    let mut visited = Features::new();
    let mut stack: Vec<Feature> = lookup(start)
        .map(|deps| deps.iter().copied().collect())
        .unwrap_or_default();
    while let Some(feature) = stack.pop() {
        if feature == *target {
            return true;
        }
        if !visited.insert(feature) {
            continue;
        }
        if let Some(deps) = lookup(&feature) {
            stack.extend(deps.iter().copied());
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{ERROR_CANCELLED, ERROR_INVALID_ARGUMENT, ERROR_NOT_AVAILABLE};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const A: Feature = Feature::new("Test", 0);
    const B: Feature = Feature::new("Test", 1);
    const C: Feature = Feature::new("Test", 2);
    const D: Feature = Feature::new("Test", 3);

    type Calls = Arc<Mutex<Vec<Feature>>>;

    fn recorder(calls: &Calls, feature: Feature) -> Introspectable {
        let calls = calls.clone();
        Introspectable::new(move || lock(&calls).push(feature))
    }

    fn chain() -> (ReadinessHelper, Calls) {
        let helper = ReadinessHelper::new(DEFAULT_STATUS);
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        helper
            .add_introspectables([
                (A, recorder(&calls, A)),
                (B, recorder(&calls, B).depends_on([A])),
                (C, recorder(&calls, C).depends_on([B])),
                (D, recorder(&calls, D)),
            ])
            .unwrap_or_else(|err| panic!("registration failed: {err}"));
        (helper, calls)
    }

    fn set(features: &[Feature]) -> Features {
        features.iter().copied().collect()
    }

    fn taken(calls: &Calls) -> Vec<Feature> {
        std::mem::take(&mut *lock(calls))
    }

    #[test]
    fn dependencies_are_introspected_first() {
        let (helper, calls) = chain();
        let op = helper.become_ready(set(&[C]));
        assert_eq!(taken(&calls), vec![A]);
        assert!(!helper.is_ready(&set(&[C])));

        helper.set_introspect_completed(A, Ok(()));
        assert_eq!(taken(&calls), vec![B]);
        helper.set_introspect_completed(B, Ok(()));
        assert_eq!(taken(&calls), vec![C]);
        assert!(!op.is_finished());
        assert!(!helper.is_ready(&set(&[C])));

        helper.set_introspect_completed(C, Ok(()));
        assert!(op.is_valid());
        assert!(helper.is_ready(&set(&[A, B, C])));
        assert_eq!(helper.actual_features(), set(&[A, B, C]));
        assert_eq!(helper.requested_features(), set(&[A, B, C]));
    }

    #[test]
    fn concurrent_requests_share_introspection() {
        let (helper, calls) = chain();
        let first = helper.become_ready(set(&[B]));
        let second = helper.become_ready(set(&[B]));
        let overlapping = helper.become_ready(set(&[A]));
        assert!(first.same_as(&second));
        assert_eq!(taken(&calls), vec![A]);

        helper.set_introspect_completed(A, Ok(()));
        assert!(overlapping.is_valid());
        assert!(!first.is_finished());
        assert_eq!(taken(&calls), vec![B]);

        helper.set_introspect_completed(B, Ok(()));
        assert!(first.is_valid());
        assert!(second.is_valid());
        assert!(taken(&calls).is_empty());

        let again = helper.become_ready(set(&[B]));
        assert!(again.is_valid());
        assert!(taken(&calls).is_empty());
    }

    #[test]
    fn failure_propagates_to_dependents_without_blocking_siblings() {
        let (helper, calls) = chain();
        let op = helper.become_ready(set(&[C, D]));
        assert_eq!(taken(&calls), vec![A, D]);

        helper.set_introspect_completed(A, Err(OperationError::new("x.Failed", "no luck")));
        assert!(!op.is_finished());
        assert!(taken(&calls).is_empty());
        assert_eq!(helper.missing_features(), set(&[A, B, C]));
        assert_eq!(
            helper.missing_error(B).map(|err| err.name),
            Some(ERROR_NOT_AVAILABLE.to_string())
        );
        assert_eq!(helper.missing_error(A).map(|err| err.name), Some("x.Failed".to_string()));

        helper.set_introspect_completed(D, Ok(()));
        assert!(op.is_error());
        assert_eq!(op.error_name().as_deref(), Some(ERROR_NOT_AVAILABLE));
        assert!(helper.is_ready(&set(&[D])));
        assert!(!helper.is_ready(&set(&[C])));
    }

    #[test]
    fn missing_interface_fails_feature() {
        let helper = ReadinessHelper::new(DEFAULT_STATUS);
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        helper
            .add_introspectables([
                (A, recorder(&calls, A).requires_interfaces(["org.example.Hold"])),
                (B, recorder(&calls, B).requires_interfaces(["org.example.Present"])),
            ])
            .unwrap_or_else(|err| panic!("registration failed: {err}"));
        helper.set_interfaces(vec!["org.example.Present".to_string()]);

        let failing = helper.become_ready(set(&[A]));
        assert_eq!(
            failing.error_message().as_deref(),
            Some("Feature depend on interfaces that are not available")
        );
        let working = helper.become_ready(set(&[B]));
        assert_eq!(taken(&calls), vec![B]);
        helper.set_introspect_completed(B, Ok(()));
        assert!(working.is_valid());
    }

    #[test]
    fn inapplicable_status_fails_explicit_and_skips_dependencies() {
        let helper = ReadinessHelper::new(DEFAULT_STATUS);
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        helper
            .add_introspectables([
                (A, recorder(&calls, A).for_statuses([1])),
                (B, recorder(&calls, B).depends_on([A])),
            ])
            .unwrap_or_else(|err| panic!("registration failed: {err}"));

        let dependent = helper.become_ready(set(&[B]));
        assert_eq!(taken(&calls), vec![B]);
        helper.set_introspect_completed(B, Ok(()));
        assert!(dependent.is_valid());

        let helper = ReadinessHelper::new(DEFAULT_STATUS);
        helper
            .add_introspectables([(A, recorder(&calls, A).for_statuses([1]))])
            .unwrap_or_else(|err| panic!("registration failed: {err}"));
        let explicit = helper.become_ready(set(&[A]));
        assert_eq!(explicit.error_name().as_deref(), Some(ERROR_NOT_AVAILABLE));
        assert!(taken(&calls).is_empty());
    }

    #[test]
    fn registration_rejects_duplicates_cycles_and_unknown_dependencies() {
        let (helper, calls) = chain();
        let err = helper.add_introspectables([(A, recorder(&calls, A))]);
        assert_eq!(err, Err(ReadinessError::DuplicateFeature(A)));

        let fresh = ReadinessHelper::new(DEFAULT_STATUS);
        let x = Feature::new("Cycle", 0);
        let y = Feature::new("Cycle", 1);
        let err = fresh.add_introspectables([
            (x, recorder(&calls, x).depends_on([y])),
            (y, recorder(&calls, y).depends_on([x])),
        ]);
        assert!(matches!(err, Err(ReadinessError::DependencyCycle(_))));

        let err = fresh.add_introspectables([(x, recorder(&calls, x).depends_on([A]))]);
        assert_eq!(
            err,
            Err(ReadinessError::UnknownDependency {
                feature: x,
                dependency: A
            })
        );
        let err = fresh.add_introspectables([(x, recorder(&calls, x)), (x, recorder(&calls, x))]);
        assert_eq!(err, Err(ReadinessError::DuplicateFeature(x)));

        // Nothing from the rejected batches was kept.
        let unknown = fresh.become_ready(set(&[x]));
        assert_eq!(unknown.error_name().as_deref(), Some(ERROR_INVALID_ARGUMENT));
    }

    #[test]
    fn unsupported_feature_is_rejected() {
        let (helper, calls) = chain();
        let op = helper.become_ready(set(&[A, Feature::new("Other", 9)]));
        assert_eq!(op.error_name().as_deref(), Some(ERROR_INVALID_ARGUMENT));
        assert!(taken(&calls).is_empty());
    }

    #[test]
    fn abort_fails_requests_and_ignores_late_results() {
        let (helper, calls) = chain();
        let op = helper.become_ready(set(&[B]));
        assert_eq!(taken(&calls), vec![A]);

        helper.abort(OperationError::cancelled("proxy gone"));
        assert_eq!(op.error_message().as_deref(), Some("proxy gone"));

        helper.set_introspect_completed(A, Ok(()));
        assert!(taken(&calls).is_empty());
        assert!(!helper.is_ready(&set(&[A])));

        let late = helper.become_ready(set(&[A]));
        assert_eq!(late.error_name().as_deref(), Some(ERROR_CANCELLED));
        assert_eq!(late.error_message().as_deref(), Some("proxy gone"));
    }

    #[test]
    fn dropping_helper_cancels_pending_requests() {
        let (helper, _calls) = chain();
        let op = helper.become_ready(set(&[A]));
        drop(helper);
        assert_eq!(op.error_name().as_deref(), Some(ERROR_CANCELLED));
        assert_eq!(op.error_message().as_deref(), Some("Destroyed"));
    }

    #[test]
    fn status_change_while_in_flight_restarts_introspection() {
        let helper = ReadinessHelper::new(DEFAULT_STATUS);
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        helper
            .add_introspectables([(
                A,
                Introspectable::new(move || {
                    counted.fetch_add(1, Ordering::SeqCst);
                })
                .for_statuses([0, 1]),
            )])
            .unwrap_or_else(|err| panic!("registration failed: {err}"));
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = statuses.clone();
        helper.on_status_ready(move |status| lock(&sink).push(status));

        let op = helper.become_ready(set(&[A]));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        helper.set_current_status(1);
        assert_eq!(helper.current_status(), DEFAULT_STATUS);
        helper.set_introspect_completed(A, Ok(()));
        assert_eq!(helper.current_status(), 1);
        assert!(!op.is_finished());
        assert_eq!(count.load(Ordering::SeqCst), 2);

        helper.set_introspect_completed(A, Ok(()));
        assert!(op.is_valid());
        assert_eq!(*lock(&statuses), vec![1]);
    }

    #[test]
    fn status_change_clears_features_valid_for_both_statuses() {
        let helper = ReadinessHelper::new(DEFAULT_STATUS);
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        helper
            .add_introspectables([(A, recorder(&calls, A).for_statuses([0, 1]))])
            .unwrap_or_else(|err| panic!("registration failed: {err}"));

        let op = helper.become_ready(set(&[A]));
        assert_eq!(taken(&calls), vec![A]);
        helper.set_introspect_completed(A, Ok(()));
        assert!(op.is_valid());
        assert!(helper.is_ready(&set(&[A])));

        helper.set_current_status(1);
        assert!(helper.actual_features().is_empty());
        assert!(!helper.is_ready(&set(&[A])));
        assert_eq!(taken(&calls), vec![A]);
        helper.set_introspect_completed(A, Ok(()));
        assert!(helper.is_ready(&set(&[A])));
    }

    #[test]
    fn completion_from_inside_introspection_is_not_recursive() {
        let helper = ReadinessHelper::new(DEFAULT_STATUS);
        let slot: Arc<Mutex<Option<ReadinessHelper>>> = Arc::new(Mutex::new(None));
        let order: Calls = Arc::new(Mutex::new(Vec::new()));
        let make = |feature: Feature| {
            let slot = slot.clone();
            let order = order.clone();
            Introspectable::new(move || {
                lock(&order).push(feature);
                let helper = lock(&slot).clone();
                if let Some(helper) = helper {
                    helper.set_introspect_completed(feature, Ok(()));
                }
            })
        };
        helper
            .add_introspectables([(A, make(A)), (B, make(B).depends_on([A]))])
            .unwrap_or_else(|err| panic!("registration failed: {err}"));
        *lock(&slot) = Some(helper.clone());

        let op = helper.become_ready(set(&[B]));
        assert!(op.is_valid());
        assert_eq!(*lock(&order), vec![A, B]);
        // Break the helper <-> closure cycle.
        lock(&slot).take();
    }

    #[test]
    fn late_completion_for_unknown_feature_is_ignored() {
        let (helper, _calls) = chain();
        helper.set_introspect_completed(C, Ok(()));
        assert!(!helper.is_ready(&set(&[C])));
    }
}
