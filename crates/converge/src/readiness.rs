//! Readiness of the live child workload, and the aggregate Ready condition.

use chrono::{DateTime, Utc};
use steward_core::{ConditionSet, ConditionStatus, ConditionType, ConditionUpdate};
use steward_schema::{AutoscalingBounds, DesiredState};

pub const NOT_CREATED: &str = "NotCreated";
pub const MINIMUM_REPLICAS_AVAILABLE: &str = "MinimumReplicasAvailable";
pub const MINIMUM_REPLICAS_UNAVAILABLE: &str = "MinimumReplicasUnavailable";
pub const REPLICA_SET_UPDATING: &str = "ReplicaSetUpdating";
pub const SERVICE_STATUS_NOT_FOUND: &str = "ServiceStatusNotFound";
pub const APPLICATION_NOT_RECONCILED: &str = "ApplicationNotReconciled";
pub const RESOURCES_NOT_READY: &str = "ResourcesNotReady";

pub const MSG_NOT_RECONCILED: &str = "Application is not reconciled.";
pub const MSG_RESOURCES_NOT_READY: &str = "Resources are not ready.";

/// Ready condition reported by a serverless platform on its own object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerCondition {
    pub status: ConditionStatus,
    pub message: String,
}

/// What the observer saw on the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveWorkload {
    pub exists: bool,
    pub replicas: i32,
    pub ready_replicas: i32,
    pub updated_replicas: i32,
    pub inner_ready: Option<InnerCondition>,
}

impl LiveWorkload {
    pub fn missing() -> Self { Self::default() }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadMode {
    ReplicaBased,
    Serverless,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessInputs {
    pub expected_replicas: Option<i32>,
    pub autoscaling: Option<AutoscalingBounds>,
    pub live_replicas: i32,
    pub live_ready_replicas: i32,
    pub live_updated_replicas: i32,
    pub resource_exists: bool,
    pub inner_ready: Option<InnerCondition>,
}

impl ReadinessInputs {
    pub fn new(desired: &DesiredState, live: LiveWorkload) -> Self {
        Self {
            expected_replicas: desired.replicas,
            autoscaling: desired.autoscaling.clone(),
            live_replicas: live.replicas,
            live_ready_replicas: live.ready_replicas,
            live_updated_replicas: live.updated_replicas,
            resource_exists: live.exists,
            inner_ready: live.inner_ready,
        }
    }
}

pub fn mode_of(desired: &DesiredState) -> WorkloadMode {
    if desired.is_serverless() { WorkloadMode::Serverless } else { WorkloadMode::ReplicaBased }
}

/// Compute the ResourcesReady condition.
pub fn evaluate(inputs: &ReadinessInputs, mode: WorkloadMode) -> ConditionUpdate {
    match mode {
        WorkloadMode::ReplicaBased => evaluate_replicas(inputs),
        WorkloadMode::Serverless => evaluate_serverless(inputs),
    }
}

fn evaluate_replicas(i: &ReadinessInputs) -> ConditionUpdate {
    const T: ConditionType = ConditionType::ResourcesReady;
    if !i.resource_exists || (i.expected_replicas.is_none() && i.autoscaling.is_none()) {
        return ConditionUpdate::falsy(T, NOT_CREATED, "Workload has not been created.");
    }
    // Autoscaled workloads only need the floor; the ceiling is the autoscaler's business.
    if let Some(bounds) = &i.autoscaling {
        let min = bounds.effective_min();
        if i.live_ready_replicas < min {
            return ConditionUpdate::falsy(
                T,
                MINIMUM_REPLICAS_UNAVAILABLE,
                format!("{} of minimum {} replicas ready.", i.live_ready_replicas, min),
            );
        }
        return ConditionUpdate::new(T, ConditionStatus::True, MINIMUM_REPLICAS_AVAILABLE, "Minimum replicas are available.");
    }
    let expected = i.expected_replicas.unwrap_or_default();
    if i.live_replicas == expected && i.live_ready_replicas == expected && i.live_updated_replicas == expected {
        ConditionUpdate::new(T, ConditionStatus::True, MINIMUM_REPLICAS_AVAILABLE, "Minimum replicas are available.")
    } else if i.live_replicas > expected {
        ConditionUpdate::new(
            T,
            ConditionStatus::True,
            REPLICA_SET_UPDATING,
            format!("Scaling down from {} to {} replicas.", i.live_replicas, expected),
        )
    } else {
        ConditionUpdate::falsy(
            T,
            MINIMUM_REPLICAS_UNAVAILABLE,
            format!("{} of {} replicas ready, {} updated.", i.live_ready_replicas, expected, i.live_updated_replicas),
        )
    }
}

fn evaluate_serverless(i: &ReadinessInputs) -> ConditionUpdate {
    const T: ConditionType = ConditionType::ResourcesReady;
    if !i.resource_exists {
        return ConditionUpdate::falsy(T, NOT_CREATED, "Service has not been created.");
    }
    match &i.inner_ready {
        None => ConditionUpdate::falsy(T, SERVICE_STATUS_NOT_FOUND, "Service has no Ready condition yet."),
        Some(inner) => ConditionUpdate::new(T, ConditionStatus::from_bool(inner.status.is_true()), "", inner.message.clone()),
    }
}

/// Recompute Ready from Reconciled and ResourcesReady.
///
/// Reconciled is checked first. The Ready entry is only touched when its
/// status or message would change. Returns whether it was written.
pub fn check_application_status(conditions: &mut ConditionSet, now: DateTime<Utc>) -> bool {
    let update = if !conditions.is_true(ConditionType::Reconciled) {
        ConditionUpdate::falsy(ConditionType::Ready, APPLICATION_NOT_RECONCILED, MSG_NOT_RECONCILED)
    } else if !conditions.is_true(ConditionType::ResourcesReady) {
        ConditionUpdate::falsy(ConditionType::Ready, RESOURCES_NOT_READY, MSG_RESOURCES_NOT_READY)
    } else {
        ConditionUpdate::truthy(ConditionType::Ready)
    };
    if let Some(cur) = conditions.get(ConditionType::Ready) {
        if cur.status == update.status && cur.message == update.message { return false; }
    }
    conditions.upsert(update, now);
    true
}
