//! Custom resource definitions served by the controller.
//!
//! `Application` is served at two versions with different field layouts;
//! `v1beta1` is the storage version and also carries the `v1alpha1` fields,
//! since the CRD has no conversion webhook. Nothing outside this crate reads these
//! structs directly: callers go through [`crate::VersionedSpec`].

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use steward_core::{ApplicationStatus, OperationRecord};

pub const GROUP: &str = "steward.dev";
pub const STORAGE_VERSION: &str = "v1beta1";

pub mod v1alpha1 {
    use super::*;

    #[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
    #[kube(group = "steward.dev", version = "v1alpha1", kind = "Application", namespaced)]
    #[kube(status = "ApplicationStatus", shortname = "sapp")]
    #[serde(rename_all = "camelCase")]
    pub struct ApplicationSpec {
        pub image: String,
        /// Fixed replica count.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub size: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub autoscaling: Option<Autoscaling>,
        /// Run as a Knative service instead of a Deployment.
        #[serde(default)]
        pub serverless: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub port: Option<i32>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
    #[serde(rename_all = "camelCase")]
    pub struct Autoscaling {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub min: Option<i32>,
        pub max: i32,
    }
}

pub mod v1beta1 {
    use super::*;

    #[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
    #[kube(group = "steward.dev", version = "v1beta1", kind = "Application", namespaced)]
    #[kube(status = "ApplicationStatus", shortname = "sapp")]
    #[kube(printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#)]
    #[serde(rename_all = "camelCase")]
    pub struct ApplicationSpec {
        pub image: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub replicas: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub autoscaler: Option<Autoscaler>,
        #[serde(default)]
        pub runtime: Runtime,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub port: Option<i32>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub env: Vec<EnvVar>,
        /// Deprecated v1alpha1 field, kept so objects created at v1alpha1 survive
        /// being served at this version. `replicas` wins when both are set.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub size: Option<i32>,
        /// Deprecated v1alpha1 field. `autoscaler` wins when both are set.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub autoscaling: Option<super::v1alpha1::Autoscaling>,
        /// Deprecated v1alpha1 field. `true` selects the Knative runtime.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub serverless: Option<bool>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
    #[serde(rename_all = "camelCase")]
    pub struct Autoscaler {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub min_replicas: Option<i32>,
        pub max_replicas: i32,
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "targetCPUUtilizationPercentage")]
        pub target_cpu_utilization_percentage: Option<i32>,
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
    pub enum Runtime {
        #[default]
        Deployment,
        Knative,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
    pub struct EnvVar {
        pub name: String,
        #[serde(default)]
        pub value: String,
    }
}

/// One-shot command executed inside a running pod.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(group = "steward.dev", version = "v1alpha1", kind = "Operation", namespaced)]
#[kube(status = "OperationRecord", shortname = "sop")]
#[serde(rename_all = "camelCase")]
pub struct OperationSpec {
    pub pod: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    pub command: Vec<String>,
}

/// CRDs for every served kind, with Application versions merged under the storage version.
pub fn all_crds() -> Result<Vec<k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition>, String> {
    use kube::core::crd::merge_crds;
    use kube::CustomResourceExt;

    let app = merge_crds(vec![v1alpha1::Application::crd(), v1beta1::Application::crd()], STORAGE_VERSION)
        .map_err(|e| e.to_string())?;
    Ok(vec![app, Operation::crd()])
}

/// Multi-document YAML suitable for `kubectl apply -f -`.
pub fn crds_yaml() -> Result<String, String> {
    let mut out = String::new();
    for crd in all_crds()? {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(&crd).map_err(|e| e.to_string())?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_crd_serves_both_versions_and_stores_beta() {
        let crds = all_crds().unwrap();
        let app = &crds[0];
        assert_eq!(app.spec.group, GROUP);
        let versions: Vec<_> = app.spec.versions.iter().map(|v| (v.name.as_str(), v.storage)).collect();
        assert!(versions.contains(&("v1alpha1", false)));
        assert!(versions.contains(&("v1beta1", true)));
    }

    #[test]
    fn operation_crd_has_status_subresource() {
        let crds = all_crds().unwrap();
        let op = &crds[1];
        assert_eq!(op.spec.names.kind, "Operation");
        let v = &op.spec.versions[0];
        assert!(v.subresources.as_ref().and_then(|s| s.status.as_ref()).is_some());
    }

    #[test]
    fn yaml_has_one_document_per_crd() {
        let yaml = crds_yaml().unwrap();
        assert_eq!(yaml.matches("---\n").count(), 2);
        assert!(yaml.contains("applications.steward.dev"));
    }
}
