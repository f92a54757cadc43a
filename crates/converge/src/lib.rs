//! Steward converge: the Application reconciler.
//!
//! One invocation loads the primary resource, applies defaults, hands each
//! child kind to the [`Synthesizer`], and funnels the result through the
//! [`policy::ConvergencePolicy`] which records conditions and picks the
//! requeue interval. Every platform call goes through a trait so the host can
//! plug in kube-backed implementations and tests can plug in fakes.

#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use metrics::{counter, histogram};
use steward_core::{
    ApplicationStatus, Clock, ConditionType, ReconcileConfig, ReconcileError, ReconcileOutcome, ResourceKey,
};
use steward_schema::{ChildKind, DesiredState, ValidationError, VersionedSpec};
use tracing::{debug, info, warn};

pub mod policy;
pub mod readiness;

pub use policy::{ConvergencePolicy, ReconcileState};
pub use readiness::{InnerCondition, LiveWorkload, ReadinessInputs, WorkloadMode};

/// Primary resource as read from the platform.
#[derive(Debug, Clone)]
pub struct LoadedApplication {
    /// Decoding failures are kept so they can be reported on the object's status.
    pub spec: Result<VersionedSpec, ValidationError>,
    pub status: ApplicationStatus,
    pub generation: Option<i64>,
    /// Version token gating the status write.
    pub resource_version: String,
}

#[async_trait]
pub trait ApplicationStore: Send + Sync {
    /// `Ok(None)` when the resource no longer exists.
    async fn get(&self, key: &ResourceKey) -> Result<Option<LoadedApplication>, ReconcileError>;

    /// Write status; fails with `Conflict` when `resource_version` is stale.
    async fn update_status(&self, key: &ResourceKey, status: &ApplicationStatus, resource_version: &str) -> Result<(), ReconcileError>;
}

/// Idempotent create-or-update of one child kind, owner references included.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize_and_apply(&self, key: &ResourceKey, desired: &DesiredState, kind: ChildKind) -> Result<(), ReconcileError>;
}

#[async_trait]
pub trait WorkloadObserver: Send + Sync {
    async fn observe(&self, key: &ResourceKey, desired: &DesiredState) -> Result<LiveWorkload, ReconcileError>;
}

/// Warning-level events attached to the primary resource. Best effort.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn warn(&self, key: &ResourceKey, reason: &str, message: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

#[async_trait]
impl EventSink for NoopEvents {
    async fn warn(&self, _key: &ResourceKey, _reason: &str, _message: &str) {}
}

pub struct Reconciler {
    pub store: Arc<dyn ApplicationStore>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub observer: Arc<dyn WorkloadObserver>,
    pub events: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
}

impl Reconciler {
    /// Run one invocation for `key` against an immutable config snapshot.
    pub async fn reconcile(&self, key: &ResourceKey, config: &ReconcileConfig) -> ReconcileOutcome {
        let started = std::time::Instant::now();
        counter!("reconcile_total", 1u64, "kind" => "Application");
        let outcome = self.reconcile_inner(key, config).await;
        histogram!("reconcile_ms", started.elapsed().as_secs_f64() * 1000.0, "kind" => "Application");
        debug!(key = %key, requeue = outcome.requeue, after = ?outcome.requeue_after, "reconcile finished");
        outcome
    }

    async fn reconcile_inner(&self, key: &ResourceKey, config: &ReconcileConfig) -> ReconcileOutcome {
        let loaded = match self.store.get(key).await {
            Ok(Some(app)) => app,
            Ok(None) => {
                debug!(key = %key, "application gone; nothing to do");
                return ReconcileOutcome::done();
            }
            Err(e) if e.is_not_found() => return ReconcileOutcome::done(),
            Err(e) if !e.is_retryable() => {
                warn!(key = %key, error = %e, "application cannot be loaded; waiting for a change");
                return ReconcileOutcome { error: Some(e.to_string()), ..ReconcileOutcome::done() };
            }
            Err(e) => {
                // No object, no status to write: retry the load.
                warn!(key = %key, error = %e, "failed to load application");
                return ReconcileOutcome::failed(config.fresh_failure_interval, &e);
            }
        };

        let LoadedApplication { spec, status, generation, resource_version } = loaded;
        let mut state = ReconcileState {
            key: key.clone(),
            desired: spec.as_ref().map(|s| s.desired().with_defaults()).unwrap_or_default(),
            status,
            generation,
            resource_version,
        };
        let policy = ConvergencePolicy {
            store: self.store.as_ref(),
            observer: self.observer.as_ref(),
            events: self.events.as_ref(),
            clock: self.clock.as_ref(),
            config,
        };

        if let Err(e) = spec.and_then(|_| state.desired.validate()) {
            return policy.manage_error(e.into(), ConditionType::Reconciled, &mut state).await;
        }

        if already_converged(&state) {
            debug!(key = %key, generation = ?state.generation, "generation already applied; skipping synthesis");
            return policy.manage_success(ConditionType::Reconciled, &mut state).await;
        }

        for kind in state.desired.child_kinds() {
            if let Err(e) = self.synthesizer.synthesize_and_apply(key, &state.desired, kind).await {
                warn!(key = %key, child = kind.as_str(), error = %e, "synthesis failed");
                return policy.manage_error(e, ConditionType::Reconciled, &mut state).await;
            }
        }
        info!(key = %key, generation = ?state.generation, "children applied");
        policy.manage_success(ConditionType::Reconciled, &mut state).await
    }
}

/// The current generation was applied and the workload still exists.
fn already_converged(state: &ReconcileState) -> bool {
    let conditions = &state.status.conditions;
    state.generation.is_some()
        && state.status.observed_generation == state.generation
        && conditions.is_true(ConditionType::Reconciled)
        && conditions
            .get(ConditionType::ResourcesReady)
            .is_some_and(|c| c.reason != readiness::NOT_CREATED)
}
