//! Steward kubehub: kube-backed implementations of the reconciler seams,
//! plus watch wiring that feeds the work queues.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Event as CoreEvent, EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject};
use kube::Client;
use steward_converge::{ApplicationStore, EventSink, InnerCondition, LiveWorkload, LoadedApplication, WorkloadObserver};
use steward_core::{ApplicationStatus, ConditionStatus, ReconcileError, ResourceKey};
use steward_schema::crd::{GROUP, STORAGE_VERSION};
use steward_schema::{DesiredState, VersionedSpec};
use tracing::{debug, warn};

pub mod synth;
pub mod watch;

pub use synth::KubeSynthesizer;

pub const FIELD_MANAGER: &str = "steward";

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from kubeconfig or in-cluster env")
}

/// Map a kube error onto the reconcile taxonomy.
pub fn map_kube_error(e: kube::Error) -> ReconcileError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => ReconcileError::NotFound(ae.message),
        kube::Error::Api(ae) if ae.code == 409 => ReconcileError::Conflict(ae.message),
        kube::Error::Api(ae) if ae.code == 422 || ae.code == 400 => ReconcileError::Validation(ae.message),
        other => ReconcileError::Platform(other.to_string()),
    }
}

/// `ApiResource` for the Application kind at a served version.
pub fn application_resource(version: &str) -> ApiResource {
    ApiResource {
        group: GROUP.to_string(),
        version: version.to_string(),
        api_version: format!("{GROUP}/{version}"),
        kind: "Application".to_string(),
        plural: "applications".to_string(),
    }
}

pub fn knative_service_resource() -> ApiResource {
    ApiResource {
        group: "serving.knative.dev".to_string(),
        version: "v1".to_string(),
        api_version: "serving.knative.dev/v1".to_string(),
        kind: "Service".to_string(),
        plural: "services".to_string(),
    }
}

/// Reads Applications as dynamic objects at the storage version.
pub struct KubeApplications {
    client: Client,
    resource: ApiResource,
}

impl KubeApplications {
    pub fn new(client: Client) -> Self { Self { client, resource: application_resource(STORAGE_VERSION) } }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.resource)
    }
}

/// Decode a dynamic Application into the reconciler's view.
pub fn load_application(obj: &DynamicObject) -> Result<LoadedApplication, ReconcileError> {
    let api_version = obj.types.as_ref().map(|t| t.api_version.as_str()).unwrap_or("");
    let spec_json = obj.data.get("spec").cloned().unwrap_or(serde_json::Value::Null);
    let spec = VersionedSpec::from_parts(api_version, spec_json);
    // An unreadable status is never overwritten with an empty one.
    let status: ApplicationStatus = match obj.data.get("status") {
        Some(v) if !v.is_null() => serde_json::from_value(v.clone())
            .map_err(|e| ReconcileError::Platform(format!("unreadable status: {e}")))?,
        _ => ApplicationStatus::default(),
    };
    Ok(LoadedApplication {
        spec,
        status,
        generation: obj.metadata.generation,
        resource_version: obj.metadata.resource_version.clone().unwrap_or_default(),
    })
}

#[async_trait]
impl ApplicationStore for KubeApplications {
    async fn get(&self, key: &ResourceKey) -> Result<Option<LoadedApplication>, ReconcileError> {
        match self.api(&key.namespace).get_opt(&key.name).await.map_err(map_kube_error)? {
            Some(obj) => load_application(&obj).map(Some),
            None => Ok(None),
        }
    }

    async fn update_status(&self, key: &ResourceKey, status: &ApplicationStatus, resource_version: &str) -> Result<(), ReconcileError> {
        // resourceVersion in a merge patch acts as a precondition: stale writes get 409.
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status,
        });
        self.api(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(map_kube_error)?;
        debug!(key = %key, "status written");
        Ok(())
    }
}

/// Looks up the child workload named after the Application.
pub struct KubeWorkloads {
    client: Client,
}

impl KubeWorkloads {
    pub fn new(client: Client) -> Self { Self { client } }
}

/// Pull the `Ready` condition out of a Knative-style `status.conditions` array.
pub fn inner_ready_condition(obj: &serde_json::Value) -> Option<InnerCondition> {
    let conditions = obj.pointer("/status/conditions")?.as_array()?;
    let ready = conditions.iter().find(|c| c.get("type").and_then(|t| t.as_str()) == Some("Ready"))?;
    let status = ready.get("status").and_then(|s| s.as_str()).unwrap_or("Unknown");
    Some(InnerCondition {
        status: status.parse().unwrap_or(ConditionStatus::Unknown),
        message: ready.get("message").and_then(|m| m.as_str()).unwrap_or_default().to_string(),
    })
}

#[async_trait]
impl WorkloadObserver for KubeWorkloads {
    async fn observe(&self, key: &ResourceKey, desired: &DesiredState) -> Result<LiveWorkload, ReconcileError> {
        if desired.is_serverless() {
            let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), &key.namespace, &knative_service_resource());
            let Some(obj) = api.get_opt(&key.name).await.map_err(map_kube_error)? else {
                return Ok(LiveWorkload::missing());
            };
            let raw = serde_json::to_value(&obj).map_err(|e| ReconcileError::Platform(e.to_string()))?;
            return Ok(LiveWorkload { exists: true, inner_ready: inner_ready_condition(&raw), ..Default::default() });
        }
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &key.namespace);
        let Some(dep) = api.get_opt(&key.name).await.map_err(map_kube_error)? else {
            return Ok(LiveWorkload::missing());
        };
        let st = dep.status.unwrap_or_default();
        Ok(LiveWorkload {
            exists: true,
            replicas: st.replicas.unwrap_or(0),
            ready_replicas: st.ready_replicas.unwrap_or(0),
            updated_replicas: st.updated_replicas.unwrap_or(0),
            inner_ready: None,
        })
    }
}

/// Emits core/v1 Warning events against the primary resource.
pub struct KubeEvents {
    client: Client,
    api_version: String,
    kind: &'static str,
}

impl KubeEvents {
    pub fn new(client: Client, api_version: impl Into<String>, kind: &'static str) -> Self {
        Self { client, api_version: api_version.into(), kind }
    }

    pub fn warning(&self, key: &ResourceKey, reason: &str, message: &str) -> CoreEvent {
        let now = Time(chrono::Utc::now());
        CoreEvent {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-", key.name)),
                namespace: Some(key.namespace.clone()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                api_version: Some(self.api_version.clone()),
                kind: Some(self.kind.to_string()),
                name: Some(key.name.clone()),
                namespace: Some(key.namespace.clone()),
                ..Default::default()
            },
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            type_: Some("Warning".to_string()),
            count: Some(1),
            first_timestamp: Some(now.clone()),
            last_timestamp: Some(now),
            source: Some(EventSource { component: Some(FIELD_MANAGER.to_string()), host: None }),
            reporting_component: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl EventSink for KubeEvents {
    async fn warn(&self, key: &ResourceKey, reason: &str, message: &str) {
        let api: Api<CoreEvent> = Api::namespaced(self.client.clone(), &key.namespace);
        if let Err(e) = api.create(&PostParams::default(), &self.warning(key, reason, message)).await {
            warn!(key = %key, error = %e, "failed to publish event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_err(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: format!("code {code}"), reason: String::new(), code })
    }

    #[test]
    fn kube_errors_map_onto_taxonomy() {
        assert!(map_kube_error(api_err(404)).is_not_found());
        assert!(map_kube_error(api_err(409)).is_conflict());
        assert!(!map_kube_error(api_err(422)).is_retryable());
        assert_eq!(map_kube_error(api_err(503)).reason(), "PlatformError");
    }

    #[test]
    fn dynamic_application_decodes_by_api_version() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "steward.dev/v1alpha1",
            "kind": "Application",
            "metadata": {"name": "shop", "namespace": "default", "generation": 4, "resourceVersion": "77"},
            "spec": {"image": "nginx", "size": 2},
            "status": {"observedGeneration": 3, "conditions": [{"type": "Reconciled", "status": "True"}]}
        }))
        .unwrap();
        let app = load_application(&obj).unwrap();
        assert_eq!(app.spec.unwrap().desired().replicas, Some(2));
        assert_eq!(app.generation, Some(4));
        assert_eq!(app.resource_version, "77");
        assert_eq!(app.status.observed_generation, Some(3));
        assert!(app.status.conditions.is_true(steward_core::ConditionType::Reconciled));
    }

    #[test]
    fn bad_spec_keeps_status_and_version() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "steward.dev/v1beta1",
            "kind": "Application",
            "metadata": {"name": "shop", "namespace": "default", "resourceVersion": "12"},
            "spec": {"replicas": "three"},
            "status": {"observedGeneration": 1}
        }))
        .unwrap();
        let app = load_application(&obj).unwrap();
        assert!(matches!(app.spec, Err(steward_schema::ValidationError::Malformed(_))));
        assert_eq!(app.resource_version, "12");
        assert_eq!(app.status.observed_generation, Some(1));
    }

    #[test]
    fn alpha_shaped_spec_served_at_storage_version() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "steward.dev/v1beta1",
            "kind": "Application",
            "metadata": {"name": "fn", "namespace": "default"},
            "spec": {"image": "hello", "serverless": true, "autoscaling": {"min": 1, "max": 3}}
        }))
        .unwrap();
        let desired = load_application(&obj).unwrap().spec.unwrap().desired();
        assert!(desired.is_serverless());
        assert_eq!(desired.autoscaling.map(|a| a.max), Some(3));
    }

    #[test]
    fn unreadable_status_is_not_replaced() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "steward.dev/v1beta1",
            "kind": "Application",
            "metadata": {"name": "shop", "namespace": "default"},
            "spec": {"image": "nginx"},
            "status": {"conditions": "not-a-list"}
        }))
        .unwrap();
        assert_eq!(load_application(&obj).unwrap_err().reason(), "PlatformError");
    }

    #[test]
    fn knative_ready_condition_is_extracted() {
        let svc = serde_json::json!({"status": {"conditions": [
            {"type": "ConfigurationsReady", "status": "True"},
            {"type": "Ready", "status": "False", "message": "Revision failed"}
        ]}});
        let inner = inner_ready_condition(&svc).unwrap();
        assert_eq!(inner.status, ConditionStatus::False);
        assert_eq!(inner.message, "Revision failed");
        assert!(inner_ready_condition(&serde_json::json!({"status": {}})).is_none());
    }
}
