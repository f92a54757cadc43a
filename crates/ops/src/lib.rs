//! Steward Ops: the one-shot Operation controller.
//!
//! An Operation runs a command inside a pod exactly once. The lifecycle is
//! `Pending -> Started -> Completed`; `Started=True` is persisted (version
//! gated) before the command runs, so duplicate or racing invocations can
//! never execute it twice. Start failures are retried with a backoff that
//! doubles while the failure message stays the same.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use steward_converge::EventSink;
use steward_core::{
    Clock, ConditionStatus, ConditionType, ConditionUpdate, OperationRecord, ReconcileConfig, ReconcileError,
    ReconcileOutcome, ResourceKey,
};
use steward_schema::OperationSpec;
use tracing::{debug, info, warn};

pub mod cluster;

pub use crate::cluster::KubeOps;

const REASON_ERROR: &str = "Error";

/// Pod and container a command runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub namespace: String,
    pub pod: String,
    pub container: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoadedOperation {
    pub spec: OperationSpec,
    pub record: OperationRecord,
    pub resource_version: String,
}

#[async_trait]
pub trait OperationStore: Send + Sync {
    async fn get(&self, key: &ResourceKey) -> Result<Option<LoadedOperation>, ReconcileError>;

    /// Version-gated status write. Returns the new version token.
    async fn update_status(&self, key: &ResourceKey, record: &OperationRecord, resource_version: &str) -> Result<String, ReconcileError>;
}

/// Checks that the target exists, is running, and has the named container.
#[async_trait]
pub trait TargetProbe: Send + Sync {
    async fn probe(&self, target: &Target) -> Result<(), ReconcileError>;
}

#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Run `argv` to completion and return its output.
    async fn execute(&self, target: &Target, argv: &[String]) -> Result<String, ReconcileError>;
}

pub struct OperationController {
    pub store: Arc<dyn OperationStore>,
    pub probe: Arc<dyn TargetProbe>,
    pub exec: Arc<dyn RemoteExec>,
    pub events: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
}

/// Delay before the next start attempt.
///
/// An identical message with a recorded update time continues the backoff
/// from the time elapsed since that attempt; anything else starts over.
pub fn retry_interval(record: &OperationRecord, message: &str, now: DateTime<Utc>, config: &ReconcileConfig) -> Duration {
    let previous = record
        .started
        .as_ref()
        .filter(|c| c.status == ConditionStatus::False && c.message == message && c.has_update_time())
        .map(|c| Duration::from_secs((now - c.last_update_time).num_seconds().max(0) as u64));
    config.next_backoff(previous)
}

impl OperationController {
    pub async fn reconcile(&self, key: &ResourceKey, config: &ReconcileConfig) -> ReconcileOutcome {
        counter!("reconcile_total", 1u64, "kind" => "Operation");
        let op = match self.store.get(key).await {
            Ok(Some(op)) => op,
            Ok(None) => return ReconcileOutcome::done(),
            Err(e) if e.is_not_found() => return ReconcileOutcome::done(),
            Err(e) => return ReconcileOutcome::failed(config.fresh_failure_interval, &e),
        };
        let mut record = op.record.clone();
        if record.is_completed() {
            debug!(key = %key, "operation already completed");
            return ReconcileOutcome::done();
        }
        if record.is_started() {
            debug!(key = %key, "operation already started; not running it again");
            return ReconcileOutcome::done();
        }

        let target = Target { namespace: key.namespace.clone(), pod: op.spec.pod.clone(), container: op.spec.container.clone() };
        if let Err(e) = self.probe.probe(&target).await {
            return self.start_failed(key, &op, record, e, config).await;
        }

        record.mark_started(ConditionUpdate::truthy(ConditionType::Started), self.clock.now());
        let rv = match self.store.update_status(key, &record, &op.resource_version).await {
            Ok(rv) => rv,
            Err(e) if e.is_conflict() => {
                // Someone else moved the object; re-read before deciding anything.
                debug!(key = %key, "conflict recording start; requeueing");
                return ReconcileOutcome::requeue_after(config.conflict_interval);
            }
            Err(e) => return ReconcileOutcome::failed(config.fresh_failure_interval, &e),
        };

        info!(key = %key, pod = %target.pod, "executing operation");
        counter!("operation_exec_total", 1u64);
        let (update, output) = match self.exec.execute(&target, &op.spec.command).await {
            Ok(out) => (ConditionUpdate::truthy(ConditionType::Completed), Some(out)),
            Err(e) => {
                warn!(key = %key, error = %e, "operation command failed");
                self.events.warn(key, REASON_ERROR, &e.to_string()).await;
                (ConditionUpdate::new(ConditionType::Completed, ConditionStatus::True, REASON_ERROR, e.to_string()), None)
            }
        };
        record.mark_completed(update, output, self.clock.now());
        self.persist_completion(key, &record, rv).await;
        ReconcileOutcome::done()
    }

    async fn start_failed(
        &self,
        key: &ResourceKey,
        op: &LoadedOperation,
        mut record: OperationRecord,
        err: ReconcileError,
        config: &ReconcileConfig,
    ) -> ReconcileOutcome {
        let now = self.clock.now();
        let message = err.to_string();
        let after = retry_interval(&record, &message, now, config);
        record.mark_started(ConditionUpdate::falsy(ConditionType::Started, REASON_ERROR, message.clone()), now);
        warn!(key = %key, error = %message, retry_in = ?after, "operation target not ready");
        self.events.warn(key, REASON_ERROR, &message).await;
        match self.store.update_status(key, &record, &op.resource_version).await {
            Err(e) if e.is_conflict() => return ReconcileOutcome::requeue_after(config.conflict_interval),
            Err(e) => warn!(key = %key, error = %e, "failed to record start failure"),
            Ok(_) => {}
        }
        ReconcileOutcome::failed(after, &err)
    }

    /// The command already ran; keep trying to record the result against fresh versions.
    async fn persist_completion(&self, key: &ResourceKey, record: &OperationRecord, mut rv: String) {
        for _ in 0..3 {
            match self.store.update_status(key, record, &rv).await {
                Ok(_) => return,
                Err(e) if e.is_conflict() => match self.store.get(key).await {
                    Ok(Some(fresh)) => rv = fresh.resource_version,
                    _ => break,
                },
                Err(e) => {
                    warn!(key = %key, error = %e, "failed to record operation result");
                    return;
                }
            }
        }
        warn!(key = %key, "gave up recording operation result");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steward_core::Condition;

    fn at(secs: i64) -> DateTime<Utc> { DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap() }

    fn failed_at(message: &str, secs: i64) -> OperationRecord {
        OperationRecord {
            started: Some(Condition::fresh(ConditionUpdate::falsy(ConditionType::Started, REASON_ERROR, message), at(secs))),
            ..Default::default()
        }
    }

    #[test]
    fn first_failure_starts_at_one_second() {
        let cfg = ReconcileConfig::default();
        assert_eq!(retry_interval(&OperationRecord::default(), "pod missing", at(0), &cfg), Duration::from_secs(1));
    }

    #[test]
    fn identical_failure_doubles_elapsed() {
        let cfg = ReconcileConfig::default();
        assert_eq!(retry_interval(&failed_at("pod missing", 0), "pod missing", at(1), &cfg), Duration::from_secs(2));
        assert_eq!(retry_interval(&failed_at("pod missing", 0), "pod missing", at(8), &cfg), Duration::from_secs(16));
    }

    #[test]
    fn changed_failure_resets() {
        let cfg = ReconcileConfig::default();
        assert_eq!(retry_interval(&failed_at("pod missing", 0), "container missing", at(60), &cfg), Duration::from_secs(1));
    }

    #[test]
    fn backoff_is_capped_at_six_hours() {
        let cfg = ReconcileConfig::default();
        let day = 24 * 60 * 60;
        assert_eq!(retry_interval(&failed_at("m", 0), "m", at(day), &cfg), Duration::from_secs(6 * 60 * 60));
    }

    #[test]
    fn zero_update_time_does_not_continue_backoff() {
        let cfg = ReconcileConfig::default();
        let mut rec = failed_at("m", 0);
        rec.started.as_mut().unwrap().last_update_time = DateTime::<Utc>::default();
        assert_eq!(retry_interval(&rec, "m", at(100), &cfg), Duration::from_secs(1));
    }
}
