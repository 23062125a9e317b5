/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/crds.rs
*
* This file defines the Rust data structures behind the EphemeralCluster
* Custom Resource Definition. By using the `kube::CustomResource` derive macro,
* we get a strongly-typed representation of the API, enabling safe and
* idiomatic interaction with the Kubernetes API server.
*
* Architecture:
* - `EphemeralCluster` separates the requester's intent (`spec`) from the
*   operator's observation (`status`). Status is a subresource, so spec and
*   status writes never race each other's resourceVersion.
* - The nested ci-operator types (releases, images, resources, cluster claims)
*   keep ci-operator's own snake_case wire format: they are copied verbatim
*   into the build configuration inlined into the ProwJob.
* - The externally-owned ProwJob lives in `crds/prowjob.rs`.
* - `schemars` generates the OpenAPI v3 schema embedded in the CRD manifest.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::conditions::Conditions;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod prowjob;

/// Label put on every ProwJob created for an EphemeralCluster. Its value is the
/// owning EphemeralCluster's name.
pub const EPHEMERAL_CLUSTER_LABEL: &str = "ci.openshift.io/ephemeral-cluster";

/// Keeps an EphemeralCluster around until its ProwJob is gone or finished.
pub const DEPENDENT_PROWJOB_FINALIZER: &str = "ephemeralcluster.ci.openshift.io/dependent-prowjob";

pub const PR_EVENT_PAYLOAD_ANNOTATION: &str = "ephemeralcluster.ci.openshift.io/pr-event-payload";
pub const PR_EVENT_HEADERS_ANNOTATION: &str = "ephemeralcluster.ci.openshift.io/pr-event-headers";

// --- Condition reasons and messages ---

pub const PROWJOB_CREATING_DONE_REASON: &str = "ProwJob has been properly created";
pub const CI_OPERATOR_JOBS_GENERATE_FAILURE_REASON: &str = "CIOperatorJobsGenerateFailure";
pub const PROWJOB_BIND_FAILURE_REASON: &str = "ProwJobBindFailure";
pub const SECRETS_FETCH_FAILURE_REASON: &str = "SecretsFetchFailure";
pub const CREATE_TEST_COMPLETED_SECRET_FAILURE_REASON: &str = "CreateTestCompletedSecretFailure";
pub const PROWJOB_FAILURE_REASON: &str = "ProwJobFailure";
pub const PROWJOB_COMPLETED_REASON: &str = "ProwJobCompleted";

pub const CI_OPERATOR_NS_NOT_FOUND_MSG: &str = "ci-operator namespace not found";
pub const KUBECONFIG_NOT_READY_MSG: &str = "kubeconfig not ready";
pub const HIVE_SECRETS_NOT_READY_MSG: &str = "hive secrets not ready";

// --- EphemeralCluster Custom Resource Definition ---

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "ci.openshift.io",
    version = "v1",
    kind = "EphemeralCluster",
    namespaced,
    status = "EphemeralClusterStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"ProwJob", "type":"string", "jsonPath":".status.prowJobID"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#,
    shortname = "ec"
)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralClusterSpec {
    /// Inputs for the ci-operator configuration that provisions the cluster.
    #[serde(rename = "ciOperator")]
    pub ci_operator: CIOperatorSpec,
    /// Set by the requester once its tests are done. The operator then signals
    /// the CI job to tear the cluster down.
    #[serde(default)]
    pub tear_down_cluster: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CIOperatorSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub releases: BTreeMap<String, UnresolvedRelease>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub base_images: BTreeMap<String, ImageStreamTagReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_root_image: Option<BuildRootImageConfiguration>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub external_images: BTreeMap<String, ExternalImage>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, ResourceRequirements>,
    pub test: TestSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TestSpec {
    /// The step-registry workflow that installs the cluster.
    #[serde(default)]
    pub workflow: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_profile: String,
    /// When set the cluster is leased from a Hive pool instead of installed
    /// from a release payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_claim: Option<ClusterClaim>,
}

// --- ci-operator configuration types ---

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ImageStreamTagReference {
    pub namespace: String,
    pub name: String,
    pub tag: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct BuildRootImageConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_stream_tag: Option<ImageStreamTagReference>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub from_repository: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ExternalImage {
    pub registry: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pull_secret: String,
}

/// One of the ways ci-operator can resolve a release payload. Exactly one
/// field is expected to be set.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct UnresolvedRelease {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration: Option<Integration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<Candidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prerelease: Option<Prerelease>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<Release>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Integration {
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub include_built_images: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Candidate {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub product: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub architecture: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stream: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative: Option<u32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Prerelease {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub product: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub architecture: String,
    pub version_bounds: VersionBounds,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct VersionBounds {
    pub lower: String,
    pub upper: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Release {
    pub channel: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub architecture: String,
}

/// Requests and limits keyed by resource name, e.g. `cpu: 200m`.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ClusterClaim {
    pub product: String,
    pub version: String,
    pub architecture: String,
    pub cloud: String,
    pub owner: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// How long to wait for a claimed cluster, e.g. `1h0m0s`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

// --- Status ---

/// Coarse lifecycle summary. Only moves forward, except that `Failed` can be
/// reached from anywhere. Nothing leaves `Failed` or `Deprovisioned`.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum EphemeralClusterPhase {
    #[default]
    #[serde(rename = "")]
    Unset,
    Provisioning,
    Ready,
    Deprovisioning,
    Deprovisioned,
    Failed,
}

impl EphemeralClusterPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            EphemeralClusterPhase::Unset => "",
            EphemeralClusterPhase::Provisioning => "Provisioning",
            EphemeralClusterPhase::Ready => "Ready",
            EphemeralClusterPhase::Deprovisioning => "Deprovisioning",
            EphemeralClusterPhase::Deprovisioned => "Deprovisioned",
            EphemeralClusterPhase::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EphemeralClusterPhase::Failed | EphemeralClusterPhase::Deprovisioned
        )
    }

    fn rank(&self) -> u8 {
        match self {
            EphemeralClusterPhase::Unset => 0,
            EphemeralClusterPhase::Provisioning => 1,
            EphemeralClusterPhase::Ready => 2,
            EphemeralClusterPhase::Deprovisioning => 3,
            EphemeralClusterPhase::Deprovisioned => 4,
            EphemeralClusterPhase::Failed => 5,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralClusterStatus {
    #[serde(default)]
    pub phase: EphemeralClusterPhase,
    /// Name of the bound ProwJob. Empty until creation succeeds.
    #[serde(default, rename = "prowJobID", skip_serializing_if = "String::is_empty")]
    pub prow_job_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kubeconfig: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kube_admin_password: String,
    #[serde(default)]
    pub conditions: Conditions,
}

impl EphemeralClusterStatus {
    /// Moves the phase forward. Backward moves are ignored and terminal phases
    /// are sticky, so a level-triggered pass can never regress the summary.
    pub fn advance_phase(&mut self, next: EphemeralClusterPhase) {
        if self.phase.is_terminal() {
            return;
        }
        if next.rank() > self.phase.rank() {
            self.phase = next;
        }
    }
}

impl EphemeralCluster {
    /// The status this pass starts from: a copy of the stored status, or the
    /// default one when nothing is stored yet.
    pub fn observed_status(&self) -> EphemeralClusterStatus {
        self.status.clone().unwrap_or_default()
    }

    pub fn is_cluster_claim(&self) -> bool {
        self.spec.ci_operator.test.cluster_claim.is_some()
    }

    pub fn annotation(&self, key: &str) -> &str {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
            .unwrap_or_default()
    }
}
