//! Steward schema: CRDs plus the adapter that collapses every served API
//! version into one [`DesiredState`]. Reconcilers only ever see `DesiredState`.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use steward_core::ReconcileError;

pub mod crd;

pub use crd::{v1alpha1, v1beta1, Operation, OperationSpec};

pub const DEFAULT_PORT: i32 = 8080;
pub const DEFAULT_TARGET_CPU: i32 = 80;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadKind {
    /// Replica-based Deployment, optionally autoscaled.
    #[default]
    Deployment,
    /// Knative service; readiness comes from its own Ready condition.
    Serverless,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscalingBounds {
    pub min: Option<i32>,
    pub max: i32,
    pub target_cpu: Option<i32>,
}

impl AutoscalingBounds {
    /// Floor used for readiness when no minimum was declared.
    pub fn effective_min(&self) -> i32 { self.min.unwrap_or(1) }
}

/// Version-agnostic projection of a user's Application spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    pub image: String,
    pub workload: WorkloadKind,
    pub replicas: Option<i32>,
    pub autoscaling: Option<AutoscalingBounds>,
    pub port: Option<i32>,
    pub env: Vec<(String, String)>,
}

/// Child resource kinds synthesised for an Application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChildKind {
    Deployment,
    Service,
    HorizontalPodAutoscaler,
    ServerlessService,
}

impl ChildKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            ChildKind::Deployment => "Deployment",
            ChildKind::Service => "Service",
            ChildKind::HorizontalPodAutoscaler => "HorizontalPodAutoscaler",
            ChildKind::ServerlessService => "ServerlessService",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("spec.image must not be empty")]
    EmptyImage,
    #[error("replicas must be >= 0 (got {0})")]
    NegativeReplicas(i32),
    #[error("autoscaling max must be >= 1 (got {0})")]
    MaxReplicas(i32),
    #[error("autoscaling min ({min}) must be between 1 and max ({max})")]
    MinReplicas { min: i32, max: i32 },
    #[error("target CPU utilisation must be in 1..=100 (got {0})")]
    TargetCpu(i32),
    #[error("port must be in 1..=65535 (got {0})")]
    Port(i32),
    #[error("unsupported apiVersion {0}")]
    UnsupportedVersion(String),
    #[error("malformed spec: {0}")]
    Malformed(String),
}

impl From<ValidationError> for ReconcileError {
    fn from(e: ValidationError) -> Self { ReconcileError::Validation(e.to_string()) }
}

impl DesiredState {
    pub fn is_serverless(&self) -> bool { self.workload == WorkloadKind::Serverless }

    /// Fill unset optional fields. Pure; calling it twice is a no-op.
    pub fn with_defaults(mut self) -> Self {
        if self.port.is_none() { self.port = Some(DEFAULT_PORT); }
        if let Some(a) = self.autoscaling.as_mut() {
            if a.min.is_none() { a.min = Some(1); }
            if a.target_cpu.is_none() { a.target_cpu = Some(DEFAULT_TARGET_CPU); }
        }
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.image.trim().is_empty() { return Err(ValidationError::EmptyImage); }
        if let Some(r) = self.replicas {
            if r < 0 { return Err(ValidationError::NegativeReplicas(r)); }
        }
        if let Some(a) = &self.autoscaling {
            if a.max < 1 { return Err(ValidationError::MaxReplicas(a.max)); }
            let min = a.effective_min();
            if min < 1 || min > a.max { return Err(ValidationError::MinReplicas { min, max: a.max }); }
            if let Some(t) = a.target_cpu {
                if !(1..=100).contains(&t) { return Err(ValidationError::TargetCpu(t)); }
            }
        }
        if let Some(p) = self.port {
            if !(1..=65535).contains(&p) { return Err(ValidationError::Port(p)); }
        }
        Ok(())
    }

    /// Child kinds to apply, in order.
    pub fn child_kinds(&self) -> Vec<ChildKind> {
        match self.workload {
            WorkloadKind::Serverless => vec![ChildKind::ServerlessService],
            WorkloadKind::Deployment => {
                let mut kinds = vec![ChildKind::Deployment, ChildKind::Service];
                if self.autoscaling.is_some() { kinds.push(ChildKind::HorizontalPodAutoscaler); }
                kinds
            }
        }
    }
}

impl From<&v1alpha1::ApplicationSpec> for DesiredState {
    fn from(s: &v1alpha1::ApplicationSpec) -> Self {
        DesiredState {
            image: s.image.clone(),
            workload: if s.serverless { WorkloadKind::Serverless } else { WorkloadKind::Deployment },
            replicas: s.size,
            autoscaling: s.autoscaling.as_ref().map(|a| AutoscalingBounds { min: a.min, max: a.max, target_cpu: None }),
            port: s.port,
            env: Vec::new(),
        }
    }
}

impl From<&v1beta1::ApplicationSpec> for DesiredState {
    fn from(s: &v1beta1::ApplicationSpec) -> Self {
        DesiredState {
            image: s.image.clone(),
            workload: match (s.runtime, s.serverless) {
                (v1beta1::Runtime::Knative, _) | (_, Some(true)) => WorkloadKind::Serverless,
                _ => WorkloadKind::Deployment,
            },
            replicas: s.replicas.or(s.size),
            autoscaling: match (&s.autoscaler, &s.autoscaling) {
                (Some(a), _) => Some(AutoscalingBounds {
                    min: a.min_replicas,
                    max: a.max_replicas,
                    target_cpu: a.target_cpu_utilization_percentage,
                }),
                (None, Some(a)) => Some(AutoscalingBounds { min: a.min, max: a.max, target_cpu: None }),
                (None, None) => None,
            },
            port: s.port,
            env: s.env.iter().map(|e| (e.name.clone(), e.value.clone())).collect(),
        }
    }
}

/// A spec as declared at whichever version the object was read.
#[derive(Debug, Clone, PartialEq)]
pub enum VersionedSpec {
    V1alpha1(v1alpha1::ApplicationSpec),
    V1beta1(v1beta1::ApplicationSpec),
}

impl VersionedSpec {
    /// Decode a raw `spec` given the object's `apiVersion` (`group/version` or bare version).
    pub fn from_parts(api_version: &str, spec: serde_json::Value) -> Result<Self, ValidationError> {
        let version = api_version.rsplit('/').next().unwrap_or(api_version);
        let malformed = |e: serde_json::Error| ValidationError::Malformed(e.to_string());
        match version {
            "v1alpha1" => serde_json::from_value(spec).map(VersionedSpec::V1alpha1).map_err(malformed),
            "v1beta1" => serde_json::from_value(spec).map(VersionedSpec::V1beta1).map_err(malformed),
            other => Err(ValidationError::UnsupportedVersion(other.to_string())),
        }
    }

    pub fn desired(&self) -> DesiredState {
        match self {
            VersionedSpec::V1alpha1(s) => s.into(),
            VersionedSpec::V1beta1(s) => s.into(),
        }
    }
}
