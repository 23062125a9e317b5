/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/crds/prowjob.rs
*
* The ProwJob resource (`prow.k8s.io/v1`) is owned by the CI system, not by this
* operator. Only the fields the operator reads or writes are modeled here, and
* schema generation is disabled because the CRD is installed by Prow itself.
*
* Updates to existing ProwJobs always go through JSON merge patches touching
* only the fields modeled here, so fields this struct does not know about are
* never dropped.
*
* SPDX-License-Identifier: Apache-2.0
*/

use k8s_openapi::api::core::v1::PodSpec;
use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default)]
#[kube(
    group = "prow.k8s.io",
    version = "v1",
    kind = "ProwJob",
    namespaced,
    status = "ProwJobStatus",
    schema = "disabled"
)]
pub struct ProwJobSpec {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub type_: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent: String,
    /// The build cluster the job runs on. The dispatcher may rewrite it.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub job: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refs: Option<Refs>,
    #[serde(default)]
    pub report: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub context: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rerun_command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_spec: Option<PodSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct Refs {
    pub org: String,
    pub repo: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repo_link: String,
    pub base_ref: String,
    pub base_sha: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_link: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pulls: Vec<Pull>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct Pull {
    pub number: u64,
    pub author: String,
    pub sha: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(rename = "ref", default, skip_serializing_if = "String::is_empty")]
    pub ref_: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub link: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub commit_link: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author_link: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProwJobStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
}

/// The job states the operator reacts to. Anything Prow adds later maps to
/// `Unknown` and is treated as still running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProwJobState {
    Scheduling,
    Triggered,
    Pending,
    Success,
    Failure,
    Aborted,
    Error,
    Unknown,
}

impl From<&str> for ProwJobState {
    fn from(s: &str) -> Self {
        match s {
            "scheduling" => ProwJobState::Scheduling,
            "triggered" => ProwJobState::Triggered,
            "pending" => ProwJobState::Pending,
            "success" => ProwJobState::Success,
            "failure" => ProwJobState::Failure,
            "aborted" => ProwJobState::Aborted,
            "error" => ProwJobState::Error,
            _ => ProwJobState::Unknown,
        }
    }
}

impl ProwJobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProwJobState::Scheduling => "scheduling",
            ProwJobState::Triggered => "triggered",
            ProwJobState::Pending => "pending",
            ProwJobState::Success => "success",
            ProwJobState::Failure => "failure",
            ProwJobState::Aborted => "aborted",
            ProwJobState::Error => "error",
            ProwJobState::Unknown => "",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProwJobState::Success | ProwJobState::Failure | ProwJobState::Aborted | ProwJobState::Error
        )
    }
}

impl ProwJob {
    pub fn state(&self) -> ProwJobState {
        self.status
            .as_ref()
            .map(|s| ProwJobState::from(s.state.as_str()))
            .unwrap_or(ProwJobState::Unknown)
    }

    /// The raw state string, for messages.
    pub fn state_str(&self) -> &str {
        self.status.as_ref().map(|s| s.state.as_str()).unwrap_or_default()
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels().get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_states_are_tolerated() {
        assert_eq!(ProwJobState::from("aborted"), ProwJobState::Aborted);
        assert_eq!(ProwJobState::from("something-new"), ProwJobState::Unknown);
        assert!(!ProwJobState::Unknown.is_terminal());
        assert!(!ProwJobState::Pending.is_terminal());
        assert!(ProwJobState::Error.is_terminal());
    }

    #[test]
    fn decodes_prow_wire_format() {
        let pj: ProwJob = serde_json::from_value(serde_json::json!({
            "apiVersion": "prow.k8s.io/v1",
            "kind": "ProwJob",
            "metadata": {"name": "pj", "namespace": "ci", "labels": {"ci.openshift.io/ephemeral-cluster": "ec"}},
            "spec": {"type": "presubmit", "cluster": "build02", "rerun_command": "/test x", "report": false},
            "status": {"state": "pending", "startTime": "2025-01-01T00:00:00Z", "build_id": "42"}
        }))
        .unwrap();

        assert_eq!(pj.spec.cluster, "build02");
        assert_eq!(pj.spec.rerun_command, "/test x");
        assert_eq!(pj.state(), ProwJobState::Pending);
        assert_eq!(pj.label("ci.openshift.io/ephemeral-cluster"), Some("ec"));
    }

    #[test]
    fn missing_status_is_not_terminal() {
        let pj = ProwJob::new("pj", ProwJobSpec::default());
        assert_eq!(pj.state(), ProwJobState::Unknown);
        assert_eq!(pj.state_str(), "");
    }
}
