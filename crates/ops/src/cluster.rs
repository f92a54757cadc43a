//! kube-backed probe, exec, and status store for Operations.

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use steward_core::{OperationRecord, ReconcileError, ResourceKey};
use steward_kubehub::map_kube_error;
use steward_schema::Operation;
use tokio::io::AsyncRead;
use tracing::debug;

use crate::{LoadedOperation, OperationStore, RemoteExec, Target, TargetProbe};

#[derive(Clone)]
pub struct KubeOps {
    client: Client,
}

impl KubeOps {
    pub fn new(client: Client) -> Self { Self { client } }

    fn pods(&self, namespace: &str) -> Api<Pod> { Api::namespaced(self.client.clone(), namespace) }
}

/// Why a pod cannot run a command yet, if it cannot.
pub fn pod_unready_reason(pod: &Pod, container: Option<&str>) -> Option<String> {
    let name = pod.name_any();
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref()).unwrap_or("Unknown");
    if phase != "Running" {
        return Some(format!("pod {name} is {phase}, not Running"));
    }
    if let Some(c) = container {
        let present = pod.spec.as_ref().is_some_and(|s| s.containers.iter().any(|x| x.name == c));
        if !present {
            return Some(format!("container {c} not found in pod {name}"));
        }
    }
    None
}

#[async_trait]
impl TargetProbe for KubeOps {
    async fn probe(&self, target: &Target) -> Result<(), ReconcileError> {
        let pod = self
            .pods(&target.namespace)
            .get_opt(&target.pod)
            .await
            .map_err(map_kube_error)?
            .ok_or_else(|| ReconcileError::Precondition(format!("pod {} not found", target.pod)))?;
        match pod_unready_reason(&pod, target.container.as_deref()) {
            Some(why) => Err(ReconcileError::Precondition(why)),
            None => Ok(()),
        }
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(r) = reader {
        let mut stream = tokio_util::io::ReaderStream::new(r);
        while let Some(Ok(bytes)) = stream.next().await {
            buf.extend_from_slice(&bytes);
        }
    }
    buf
}

#[async_trait]
impl RemoteExec for KubeOps {
    async fn execute(&self, target: &Target, argv: &[String]) -> Result<String, ReconcileError> {
        let mut ap = AttachParams::default().stdout(true).stderr(true);
        if let Some(c) = &target.container {
            ap = ap.container(c.as_str());
        }
        let mut attached = self
            .pods(&target.namespace)
            .exec(&target.pod, argv.to_vec(), &ap)
            .await
            .map_err(map_kube_error)?;

        let status = attached.take_status();
        let (out, err) = tokio::join!(drain(attached.stdout()), drain(attached.stderr()));
        let status = match status {
            Some(s) => s.await,
            None => None,
        };
        if let Err(e) = attached.join().await {
            debug!(error = %e, "exec session closed uncleanly");
        }

        let mut output = String::from_utf8_lossy(&out).into_owned();
        output.push_str(&String::from_utf8_lossy(&err));
        match status {
            Some(s) if s.status.as_deref() == Some("Failure") => {
                let why = s.message.unwrap_or_else(|| "command failed".to_string());
                Err(ReconcileError::Platform(format!("{why}: {}", output.trim_end())))
            }
            _ => Ok(output),
        }
    }
}

#[async_trait]
impl OperationStore for KubeOps {
    async fn get(&self, key: &ResourceKey) -> Result<Option<LoadedOperation>, ReconcileError> {
        let api: Api<Operation> = Api::namespaced(self.client.clone(), &key.namespace);
        let Some(op) = api.get_opt(&key.name).await.map_err(map_kube_error)? else { return Ok(None) };
        Ok(Some(LoadedOperation {
            resource_version: op.resource_version().unwrap_or_default(),
            record: op.status.clone().unwrap_or_default(),
            spec: op.spec,
        }))
    }

    async fn update_status(&self, key: &ResourceKey, record: &OperationRecord, resource_version: &str) -> Result<String, ReconcileError> {
        let api: Api<Operation> = Api::namespaced(self.client.clone(), &key.namespace);
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": resource_version },
            "status": record,
        });
        let updated = api
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(map_kube_error)?;
        Ok(updated.resource_version().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodStatus};
    use kube::api::ObjectMeta;

    fn pod(phase: &str, containers: &[&str]) -> Pod {
        Pod {
            metadata: ObjectMeta { name: Some("web-0".into()), ..Default::default() },
            spec: Some(PodSpec {
                containers: containers.iter().map(|c| Container { name: c.to_string(), ..Default::default() }).collect(),
                ..Default::default()
            }),
            status: Some(PodStatus { phase: Some(phase.into()), ..Default::default() }),
        }
    }

    #[test]
    fn running_pod_with_container_is_ready() {
        assert_eq!(pod_unready_reason(&pod("Running", &["app"]), Some("app")), None);
        assert_eq!(pod_unready_reason(&pod("Running", &["app"]), None), None);
    }

    #[test]
    fn pending_pod_is_not_ready() {
        let why = pod_unready_reason(&pod("Pending", &["app"]), None).unwrap();
        assert!(why.contains("Pending"));
    }

    #[test]
    fn missing_container_is_reported() {
        let why = pod_unready_reason(&pod("Running", &["app"]), Some("sidecar")).unwrap();
        assert_eq!(why, "container sidecar not found in pod web-0");
    }
}
