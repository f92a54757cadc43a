//! Steward core types: resource keys, reconcile outcomes, errors and status shapes.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod conditions;
pub mod config;

pub use conditions::{Condition, ConditionSet, ConditionStatus, ConditionType, ConditionUpdate, UnknownConditionType};
pub use config::{ConfigError, ReconcileConfig};

pub mod prelude {
    pub use super::{
        ApplicationStatus, Clock, Condition, ConditionSet, ConditionStatus, ConditionType, ConditionUpdate,
        OperationRecord, ReconcileConfig, ReconcileError, ReconcileOutcome, ResourceKey, SystemClock,
    };
}

/// Namespace + name of a primary resource; the unit of work for the queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// What the host should do with a key after an invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub requeue: bool,
    pub requeue_after: Duration,
    /// Text of the failure that produced this outcome, if any.
    pub error: Option<String>,
}

impl ReconcileOutcome {
    /// Terminal: wait for the next watch event.
    pub fn done() -> Self { Self::default() }

    pub fn requeue_after(after: Duration) -> Self {
        Self { requeue: true, requeue_after: after, error: None }
    }

    pub fn failed(after: Duration, err: &ReconcileError) -> Self {
        Self { requeue: true, requeue_after: after, error: Some(err.to_string()) }
    }
}

/// Error taxonomy shared by every platform seam.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Platform(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{0}")]
    Precondition(String),
}

impl ReconcileError {
    /// Short classification used as a condition reason.
    pub fn reason(&self) -> &'static str {
        match self {
            ReconcileError::NotFound(_) => "NotFound",
            ReconcileError::Validation(_) => "ValidationError",
            ReconcileError::Platform(_) => "PlatformError",
            ReconcileError::Conflict(_) => "Conflict",
            ReconcileError::Precondition(_) => "PreconditionFailed",
        }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, ReconcileError::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, ReconcileError::Conflict(_)) }

    /// Validation failures wait for a spec change instead of hot-looping.
    pub fn is_retryable(&self) -> bool { !matches!(self, ReconcileError::Validation(_)) }
}

/// Source of "now" for condition timestamps and backoff arithmetic.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> { Utc::now() }
}

/// Clock that only moves when told to. Used by tests across the workspace.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self { Self { now: Mutex::new(start) } }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> { *self.now.lock().unwrap_or_else(|e| e.into_inner()) }
}

/// Persisted status of an Application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    #[serde(default)]
    pub conditions: ConditionSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Maximum bytes of command output kept on an Operation's status.
pub const MAX_OUTPUT_BYTES: usize = 4096;

/// Lifecycle of a one-shot Operation. Immutable once `completed` is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl OperationRecord {
    pub fn is_completed(&self) -> bool {
        self.completed.as_ref().is_some_and(|c| c.status == ConditionStatus::True)
    }

    pub fn is_started(&self) -> bool {
        self.started.as_ref().is_some_and(|c| c.status == ConditionStatus::True)
    }

    /// Record a start attempt. Ignored once started or completed.
    pub fn mark_started(&mut self, update: ConditionUpdate, now: DateTime<Utc>) -> bool {
        if self.is_completed() || self.is_started() { return false; }
        match self.started.as_mut() {
            Some(c) => c.apply(update, now),
            None => self.started = Some(Condition::fresh(update, now)),
        }
        true
    }

    /// Record the terminal result. Only the first call takes effect.
    pub fn mark_completed(&mut self, update: ConditionUpdate, output: Option<String>, now: DateTime<Utc>) -> bool {
        if self.is_completed() { return false; }
        self.completed = Some(Condition::fresh(update, now));
        self.output = output.map(truncate_output);
        true
    }
}

fn truncate_output(mut s: String) -> String {
    if s.len() > MAX_OUTPUT_BYTES {
        let mut cut = MAX_OUTPUT_BYTES;
        while !s.is_char_boundary(cut) { cut -= 1; }
        s.truncate(cut);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> { DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap().with_timezone(&Utc) }

    #[test]
    fn key_displays_as_namespace_slash_name() {
        assert_eq!(ResourceKey::new("ns", "app").to_string(), "ns/app");
    }

    #[test]
    fn error_reasons_are_short_codes() {
        assert_eq!(ReconcileError::Platform("boom".into()).reason(), "PlatformError");
        assert_eq!(ReconcileError::Validation("bad".into()).reason(), "ValidationError");
        assert!(!ReconcileError::Validation("bad".into()).is_retryable());
        assert!(ReconcileError::Conflict("rv".into()).is_retryable());
        assert_eq!(ReconcileError::Platform("boom".into()).to_string(), "boom");
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(t0());
        clock.advance(Duration::from_secs(90));
        assert_eq!((clock.now() - t0()).num_seconds(), 90);
    }

    #[test]
    fn operation_record_is_immutable_once_completed() {
        let mut rec = OperationRecord::default();
        assert!(rec.mark_started(ConditionUpdate::truthy(ConditionType::Started), t0()));
        assert!(!rec.mark_started(ConditionUpdate::falsy(ConditionType::Started, "Error", "again"), t0()));
        assert!(rec.mark_completed(ConditionUpdate::truthy(ConditionType::Completed), Some("ok".into()), t0()));
        assert!(!rec.mark_completed(ConditionUpdate::falsy(ConditionType::Completed, "Error", "late"), None, t0()));
        assert!(rec.is_completed());
        assert_eq!(rec.output.as_deref(), Some("ok"));
        assert_eq!(rec.completed.as_ref().unwrap().reason, "");
    }

    #[test]
    fn failed_start_can_be_retried_until_started() {
        let mut rec = OperationRecord::default();
        assert!(rec.mark_started(ConditionUpdate::falsy(ConditionType::Started, "Error", "pod missing"), t0()));
        assert!(!rec.is_started());
        assert!(rec.mark_started(ConditionUpdate::truthy(ConditionType::Started), t0()));
        assert!(rec.is_started());
    }

    #[test]
    fn output_is_truncated_on_char_boundary() {
        let mut rec = OperationRecord::default();
        let long = "é".repeat(MAX_OUTPUT_BYTES);
        rec.mark_completed(ConditionUpdate::truthy(ConditionType::Completed), Some(long), t0());
        let out = rec.output.unwrap();
        assert!(out.len() <= MAX_OUTPUT_BYTES);
        assert!(out.chars().all(|c| c == 'é'));
    }

    #[test]
    fn status_round_trips_through_json() {
        let mut status = ApplicationStatus::default();
        status.conditions.upsert(ConditionUpdate::truthy(ConditionType::Reconciled), t0());
        status.observed_generation = Some(3);
        let v = serde_json::to_value(&status).unwrap();
        assert_eq!(v["observedGeneration"], 3);
        assert_eq!(v["conditions"][0]["type"], "Reconciled");
        assert_eq!(v["conditions"][0]["lastTransitionTime"], "2024-01-01T00:00:00Z");
        let back: ApplicationStatus = serde_json::from_value(v).unwrap();
        assert_eq!(back, status);
    }
}
