//! Turns a success or failure into condition updates, a status write and a
//! requeue interval.

use std::time::Duration;

use steward_core::{
    ApplicationStatus, Clock, ConditionType, ConditionUpdate, ReconcileConfig, ReconcileError, ReconcileOutcome,
    ResourceKey,
};
use steward_schema::DesiredState;
use tracing::{debug, warn};

use crate::readiness::{self, LiveWorkload, ReadinessInputs, MSG_RESOURCES_NOT_READY, RESOURCES_NOT_READY};
use crate::{ApplicationStore, EventSink, WorkloadObserver};

/// Working copy of one Application for the duration of an invocation.
#[derive(Debug, Clone)]
pub struct ReconcileState {
    pub key: ResourceKey,
    pub desired: DesiredState,
    pub status: ApplicationStatus,
    pub generation: Option<i64>,
    pub resource_version: String,
}

pub struct ConvergencePolicy<'a> {
    pub store: &'a dyn ApplicationStore,
    pub observer: &'a dyn WorkloadObserver,
    pub events: &'a dyn EventSink,
    pub clock: &'a dyn Clock,
    pub config: &'a ReconcileConfig,
}

impl ConvergencePolicy<'_> {
    fn bounded(&self, d: Duration) -> Duration { d.clamp(self.config.min_interval, self.config.max_interval) }

    pub async fn manage_error(&self, err: ReconcileError, type_: ConditionType, state: &mut ReconcileState) -> ReconcileOutcome {
        let now = self.clock.now();
        let prior = state.status.conditions.get(type_).map(|c| c.status);
        warn!(key = %state.key, condition = %type_, reason = err.reason(), error = %err, "reconcile error");
        self.events.warn(&state.key, err.reason(), &err.to_string()).await;

        let conditions = &mut state.status.conditions;
        conditions.upsert(ConditionUpdate::falsy(type_, err.reason(), err.to_string()), now);
        if type_ == ConditionType::ResourcesReady {
            // Forced directly; the aggregator is not consulted on this path.
            conditions.upsert(ConditionUpdate::falsy(ConditionType::Ready, RESOURCES_NOT_READY, MSG_RESOURCES_NOT_READY), now);
            conditions.upsert(ConditionUpdate::falsy(ConditionType::Reconciled, RESOURCES_NOT_READY, MSG_RESOURCES_NOT_READY), now);
        } else {
            readiness::check_application_status(conditions, now);
        }

        if let Err(e) = self.persist(state).await {
            if e.is_conflict() {
                debug!(key = %state.key, "status conflict while recording error");
                return ReconcileOutcome::requeue_after(self.config.conflict_interval);
            }
            warn!(key = %state.key, error = %e, "failed to persist error status");
        }

        if !err.is_retryable() {
            return ReconcileOutcome { requeue: false, requeue_after: Duration::ZERO, error: Some(err.to_string()) };
        }
        let after = match prior {
            None | Some(steward_core::ConditionStatus::True) => self.config.fresh_failure_interval,
            Some(_) => self.config.repeat_failure_interval,
        };
        ReconcileOutcome::failed(self.bounded(after), &err)
    }

    pub async fn manage_success(&self, type_: ConditionType, state: &mut ReconcileState) -> ReconcileOutcome {
        let now = self.clock.now();
        state.status.conditions.upsert(ConditionUpdate::truthy(type_), now);
        if type_ == ConditionType::Reconciled {
            state.status.observed_generation = state.generation;
        }

        let live = match self.observer.observe(&state.key, &state.desired).await {
            Ok(live) => live,
            Err(e) if e.is_not_found() => LiveWorkload::missing(),
            Err(e) => return self.manage_error(e, ConditionType::ResourcesReady, state).await,
        };
        let inputs = ReadinessInputs::new(&state.desired, live);
        let resources = readiness::evaluate(&inputs, readiness::mode_of(&state.desired));
        state.status.conditions.upsert(resources, now);
        readiness::check_application_status(&mut state.status.conditions, now);

        if let Err(e) = self.persist(state).await {
            if e.is_conflict() {
                debug!(key = %state.key, "status conflict; requeueing");
                return ReconcileOutcome::requeue_after(self.config.conflict_interval);
            }
            return ReconcileOutcome::failed(self.bounded(self.config.fresh_failure_interval), &e);
        }

        if state.status.conditions.is_true(ConditionType::ResourcesReady) {
            ReconcileOutcome::requeue_after(self.bounded(self.config.steady_interval))
        } else {
            ReconcileOutcome::requeue_after(self.bounded(self.config.not_ready_interval))
        }
    }

    async fn persist(&self, state: &ReconcileState) -> Result<(), ReconcileError> {
        self.store.update_status(&state.key, &state.status, &state.resource_version).await
    }
}
