//! NodeFeatureDiscovery custom resource (`nfd.openshift.io/v1alpha1`).

use kube::CustomResource;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "nfd.openshift.io",
    version = "v1alpha1",
    kind = "NodeFeatureDiscovery",
    namespaced,
    schema = "disabled",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct NodeFeatureDiscoverySpec {
    /// Namespace the operands are deployed into.
    #[serde(default, rename = "namespace", skip_serializing_if = "Option::is_none")]
    pub operand_namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operand: Option<OperandSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_config: Option<WorkerConfig>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperandSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    #[serde(default)]
    pub config_data: String,
}
