//! Server-side apply of child resources. Field mapping is deliberately thin:
//! one container, one port, env, and autoscaling knobs.

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject};
use kube::Client;
use metrics::counter;
use serde_json::{json, Value as Json};
use steward_converge::Synthesizer;
use steward_core::{ReconcileError, ResourceKey};
use steward_schema::{ChildKind, DesiredState, DEFAULT_PORT};
use tracing::debug;

use crate::{knative_service_resource, map_kube_error, FIELD_MANAGER};

/// Identity of the owning Application, stamped into owner references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub api_version: String,
    pub name: String,
    pub uid: String,
}

pub struct KubeSynthesizer {
    client: Client,
    owner_resource: ApiResource,
}

impl KubeSynthesizer {
    pub fn new(client: Client, owner_resource: ApiResource) -> Self { Self { client, owner_resource } }

    async fn owner(&self, key: &ResourceKey) -> Result<Owner, ReconcileError> {
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), &key.namespace, &self.owner_resource);
        let obj = api.get(&key.name).await.map_err(map_kube_error)?;
        let uid = obj.metadata.uid.ok_or_else(|| ReconcileError::Platform("owner has no metadata.uid".into()))?;
        Ok(Owner { api_version: self.owner_resource.api_version.clone(), name: key.name.clone(), uid })
    }
}

fn resource_for(kind: ChildKind) -> ApiResource {
    let (group, version, kind_name, plural) = match kind {
        ChildKind::Deployment => ("apps", "v1", "Deployment", "deployments"),
        ChildKind::Service => ("", "v1", "Service", "services"),
        ChildKind::HorizontalPodAutoscaler => ("autoscaling", "v2", "HorizontalPodAutoscaler", "horizontalpodautoscalers"),
        ChildKind::ServerlessService => return knative_service_resource(),
    };
    ApiResource {
        group: group.to_string(),
        version: version.to_string(),
        api_version: if group.is_empty() { version.to_string() } else { format!("{group}/{version}") },
        kind: kind_name.to_string(),
        plural: plural.to_string(),
    }
}

fn labels(name: &str) -> Json {
    json!({ "app.kubernetes.io/name": name, "app.kubernetes.io/managed-by": FIELD_MANAGER })
}

fn container(desired: &DesiredState) -> Json {
    let env: Vec<Json> = desired.env.iter().map(|(k, v)| json!({ "name": k, "value": v })).collect();
    json!({
        "name": "app",
        "image": desired.image,
        "ports": [{ "containerPort": desired.port.unwrap_or(DEFAULT_PORT) }],
        "env": env,
    })
}

/// Render the manifest for one child kind.
pub fn render(kind: ChildKind, key: &ResourceKey, desired: &DesiredState, owner: &Owner) -> Json {
    let ar = resource_for(kind);
    let mut obj = json!({
        "apiVersion": ar.api_version,
        "kind": ar.kind,
        "metadata": {
            "name": key.name,
            "namespace": key.namespace,
            "labels": labels(&key.name),
            "ownerReferences": [{
                "apiVersion": owner.api_version,
                "kind": "Application",
                "name": owner.name,
                "uid": owner.uid,
                "controller": true,
                "blockOwnerDeletion": true,
            }],
        },
    });
    obj["spec"] = match kind {
        ChildKind::Deployment => {
            let mut spec = json!({
                "selector": { "matchLabels": labels(&key.name) },
                "template": {
                    "metadata": { "labels": labels(&key.name) },
                    "spec": { "containers": [container(desired)] },
                },
            });
            // The autoscaler owns replicas when present.
            if desired.autoscaling.is_none() {
                spec["replicas"] = json!(desired.replicas.unwrap_or(1));
            }
            spec
        }
        ChildKind::Service => json!({
            "selector": labels(&key.name),
            "ports": [{ "port": desired.port.unwrap_or(DEFAULT_PORT), "targetPort": desired.port.unwrap_or(DEFAULT_PORT) }],
        }),
        ChildKind::HorizontalPodAutoscaler => {
            let bounds = desired.autoscaling.clone().unwrap_or(steward_schema::AutoscalingBounds { min: None, max: 1, target_cpu: None });
            json!({
                "scaleTargetRef": { "apiVersion": "apps/v1", "kind": "Deployment", "name": key.name },
                "minReplicas": bounds.effective_min(),
                "maxReplicas": bounds.max,
                "metrics": [{
                    "type": "Resource",
                    "resource": {
                        "name": "cpu",
                        "target": { "type": "Utilization", "averageUtilization": bounds.target_cpu.unwrap_or(steward_schema::DEFAULT_TARGET_CPU) },
                    },
                }],
            })
        }
        ChildKind::ServerlessService => {
            let mut annotations = serde_json::Map::new();
            if let Some(b) = &desired.autoscaling {
                annotations.insert("autoscaling.knative.dev/min-scale".into(), json!(b.effective_min().to_string()));
                annotations.insert("autoscaling.knative.dev/max-scale".into(), json!(b.max.to_string()));
            }
            json!({
                "template": {
                    "metadata": { "annotations": annotations },
                    "spec": { "containers": [container(desired)] },
                },
            })
        }
    };
    obj
}

#[async_trait]
impl Synthesizer for KubeSynthesizer {
    async fn synthesize_and_apply(&self, key: &ResourceKey, desired: &DesiredState, kind: ChildKind) -> Result<(), ReconcileError> {
        let owner = self.owner(key).await?;
        let manifest = render(kind, key, desired, &owner);
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), &key.namespace, &resource_for(kind));
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&key.name, &pp, &Patch::Apply(&manifest)).await.map_err(map_kube_error)?;
        counter!("synthesize_total", 1u64, "kind" => kind.as_str());
        debug!(key = %key, child = kind.as_str(), "child applied");
        Ok(())
    }
}
