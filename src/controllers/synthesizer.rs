/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/controllers/synthesizer.rs
*
* Turns an EphemeralCluster into the ProwJob that provisions its cluster.
*
* Architecture:
* - `PrMeta` is decoded from the two annotations the requester copies from the
*   GitHub pull-request webhook: the event payload and its headers.
* - `BuildConfiguration` is the ci-operator configuration for a single test,
*   `cluster-provisioning`, whose only test step waits for the operator's
*   teardown signal. It is serialized to YAML and inlined into the job.
* - `JobGenerator` produces the ProwJob skeleton (job name, refs, labels, pod
*   spec) for a build configuration. `PresubmitGenerator` is the default.
* - `Synthesizer` ties them together and owns what the operator cares about:
*   object naming, the ephemeral-cluster label, `report=false`, the initial
*   cluster and the inlined configuration.
*
* Every failure here is terminal: retrying cannot fix a malformed annotation
* or an invalid spec.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::crds::prowjob::{ProwJob, ProwJobSpec, ProwJobStatus, Pull, Refs};
use crate::crds::{
    BuildRootImageConfiguration, CIOperatorSpec, ClusterClaim, EphemeralCluster, ExternalImage,
    ImageStreamTagReference, ResourceRequirements, UnresolvedRelease, EPHEMERAL_CLUSTER_LABEL,
    PR_EVENT_HEADERS_ANNOTATION, PR_EVENT_PAYLOAD_ANNOTATION,
};
use crate::error::Error;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub const CLUSTER_PROVISIONING_TEST: &str = "cluster-provisioning";
pub const WAIT_TEST_STEP: &str = "wait-test-complete";
pub const UNRESOLVED_CONFIG_ENV: &str = "UNRESOLVED_CONFIG";
pub const GITHUB_DELIVERY_HEADER: &str = "X-Github-Delivery";

const PROWJOB_NAME_PREFIX: &str = "ephemeralcluster";
const WAIT_TEST_COMPLETE_SH: &str = include_str!("wait-test-complete.sh");

// --- Pull-request metadata ---

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct PullRequest {
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub html_url: String,
    pub user: GitHubUser,
    pub head: PullRequestHead,
    pub base: PullRequestBase,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct GitHubUser {
    pub login: String,
    #[serde(default)]
    pub html_url: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct PullRequestHead {
    #[serde(rename = "ref")]
    pub ref_: String,
    pub sha: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct PullRequestBase {
    #[serde(rename = "ref")]
    pub ref_: String,
    pub sha: String,
    pub repo: Repository,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Repository {
    pub name: String,
    pub owner: GitHubUser,
    #[serde(default)]
    pub html_url: String,
}

// The webhook payload carries much more; only the pull request is used.
#[derive(Deserialize)]
struct PullRequestEvent {
    #[serde(default)]
    pull_request: Option<PullRequest>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrMeta {
    pub pull_request: PullRequest,
    pub headers: BTreeMap<String, String>,
}

impl PrMeta {
    pub fn from_annotations(ec: &EphemeralCluster) -> Result<Self, Error> {
        Self::parse(
            ec.annotation(PR_EVENT_PAYLOAD_ANNOTATION),
            ec.annotation(PR_EVENT_HEADERS_ANNOTATION),
        )
    }

    pub fn parse(event: &str, headers: &str) -> Result<Self, Error> {
        if event.is_empty() || headers.is_empty() {
            return Err(Error::PrEventError("malformed PR event payload".to_string()));
        }

        let event: PullRequestEvent = serde_json::from_str(event)
            .map_err(|e| Error::PrEventError(format!("unmarshal event: {}", e)))?;
        let headers: BTreeMap<String, String> = serde_json::from_str(headers)
            .map_err(|e| Error::PrEventError(format!("unmarshal headers: {}", e)))?;

        if !headers.contains_key(GITHUB_DELIVERY_HEADER) {
            return Err(Error::PrEventError("unsupported PR event payload".to_string()));
        }
        let pull_request = event
            .pull_request
            .ok_or_else(|| Error::PrEventError("pull_request missing from PR event payload".to_string()))?;

        Ok(Self {
            pull_request,
            headers,
        })
    }

    pub fn github_guid(&self) -> &str {
        self.headers
            .get(GITHUB_DELIVERY_HEADER)
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn org(&self) -> &str {
        &self.pull_request.base.repo.owner.login
    }

    pub fn repo(&self) -> &str {
        &self.pull_request.base.repo.name
    }

    pub fn branch(&self) -> &str {
        &self.pull_request.base.ref_
    }
}

// --- ci-operator build configuration ---

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct BuildConfiguration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_root: Option<BuildRootImageConfiguration>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub base_images: BTreeMap<String, ImageStreamTagReference>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub external_images: BTreeMap<String, ExternalImage>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub releases: BTreeMap<String, UnresolvedRelease>,
    pub resources: BTreeMap<String, ResourceRequirements>,
    pub tests: Vec<TestStepConfiguration>,
    pub zz_generated_metadata: Metadata,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TestStepConfiguration {
    #[serde(rename = "as")]
    pub as_: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_claim: Option<ClusterClaim>,
    pub steps: MultiStageTestConfiguration,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct MultiStageTestConfiguration {
    pub workflow: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cluster_profile: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    pub test: Vec<LiteralTestStep>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct LiteralTestStep {
    #[serde(rename = "as")]
    pub as_: String,
    pub from: String,
    pub commands: String,
    pub resources: ResourceRequirements,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Metadata {
    pub org: String,
    pub repo: String,
    pub branch: String,
}

fn resource_requirements(cpu: &str, memory: &str) -> ResourceRequirements {
    ResourceRequirements {
        requests: BTreeMap::from([("cpu".to_string(), cpu.to_string())]),
        limits: BTreeMap::from([("memory".to_string(), memory.to_string())]),
    }
}

fn default_resources() -> BTreeMap<String, ResourceRequirements> {
    BTreeMap::from([("*".to_string(), resource_requirements("200m", "400Mi"))])
}

/// Makes `cli` importable when the cluster is claimed from Hive, since there is
/// no release payload to resolve it from. Returns the name it was imported as:
/// `cli`, or the longest existing `cli*` name suffixed with `-2` to avoid a
/// collision.
fn inject_cli_image(
    base_images: &mut BTreeMap<String, ImageStreamTagReference>,
    cli_image: &ImageStreamTagReference,
) -> String {
    let name = base_images
        .keys()
        .filter(|name| name.starts_with("cli"))
        .fold(None::<&String>, |longest, name| match longest {
            Some(l) if l.len() >= name.len() => Some(l),
            _ => Some(name),
        })
        .map(|longest| format!("{}-2", longest))
        .unwrap_or_else(|| "cli".to_string());

    base_images.insert(name.clone(), cli_image.clone());
    name
}

impl BuildConfiguration {
    pub fn assemble(
        spec: &CIOperatorSpec,
        pr: &PrMeta,
        cli_image: &ImageStreamTagReference,
    ) -> Result<Self, Error> {
        let resources = if spec.resources.is_empty() {
            debug!("Resources not set, using default values");
            default_resources()
        } else {
            spec.resources.clone()
        };

        let mut base_images = spec.base_images.clone();
        let cli_image_name = match &spec.test.cluster_claim {
            None if spec.releases.is_empty() => {
                return Err(Error::SynthesisError("releases stanza not set".to_string()))
            }
            None => "cli".to_string(),
            Some(_) => inject_cli_image(&mut base_images, cli_image),
        };

        Ok(Self {
            build_root: spec.build_root_image.clone(),
            base_images,
            external_images: spec.external_images.clone(),
            releases: spec.releases.clone(),
            resources,
            tests: vec![TestStepConfiguration {
                as_: CLUSTER_PROVISIONING_TEST.to_string(),
                cluster_claim: spec.test.cluster_claim.clone(),
                steps: MultiStageTestConfiguration {
                    workflow: spec.test.workflow.clone(),
                    cluster_profile: spec.test.cluster_profile.clone(),
                    env: spec.test.env.clone(),
                    test: vec![LiteralTestStep {
                        as_: WAIT_TEST_STEP.to_string(),
                        from: cli_image_name,
                        commands: WAIT_TEST_COMPLETE_SH.to_string(),
                        resources: resource_requirements("10m", "100Mi"),
                    }],
                },
            }],
            zz_generated_metadata: Metadata {
                org: pr.org().to_string(),
                repo: pr.repo().to_string(),
                branch: pr.branch().to_string(),
            },
        })
    }
}

// --- ProwJob generation ---

/// Produces the ProwJob skeleton for a build configuration. The returned job
/// must have a pod spec with exactly one container, the one running ci-operator.
pub trait JobGenerator: Send + Sync {
    fn generate(&self, config: &BuildConfiguration, pr: &PrMeta) -> Result<ProwJob, Error>;
}

/// Generates a presubmit for the pull request, the way Prow would have for
/// `/test cluster-provisioning`.
pub struct PresubmitGenerator {
    pub ci_operator_image: String,
}

/// Kubernetes label values: at most 63 characters from `[A-Za-z0-9._-]`,
/// starting and ending with an alphanumeric.
fn label_value(s: &str) -> String {
    let sanitized: String = s
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '-' })
        .take(63)
        .collect();
    sanitized
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

impl JobGenerator for PresubmitGenerator {
    fn generate(&self, config: &BuildConfiguration, pr: &PrMeta) -> Result<ProwJob, Error> {
        let meta = &config.zz_generated_metadata;
        let job_name = format!(
            "{}-{}-{}-{}-{}",
            PROWJOB_NAME_PREFIX, meta.org, meta.repo, meta.branch, CLUSTER_PROVISIONING_TEST
        );
        let context = format!("ci/prow/{}", CLUSTER_PROVISIONING_TEST);
        let pull = &pr.pull_request;

        let base_link = if pull.base.repo.html_url.is_empty() {
            String::new()
        } else {
            format!("{}/commit/{}", pull.base.repo.html_url, pull.base.sha)
        };
        let commit_link = if pull.html_url.is_empty() {
            String::new()
        } else {
            format!("{}/commits/{}", pull.html_url, pull.head.sha)
        };

        let refs = Refs {
            org: meta.org.clone(),
            repo: meta.repo.clone(),
            repo_link: pull.base.repo.html_url.clone(),
            base_ref: meta.branch.clone(),
            base_sha: pull.base.sha.clone(),
            base_link,
            pulls: vec![Pull {
                number: pull.number,
                author: pull.user.login.clone(),
                sha: pull.head.sha.clone(),
                title: pull.title.clone(),
                ref_: pull.head.ref_.clone(),
                link: pull.html_url.clone(),
                commit_link,
                author_link: pull.user.html_url.clone(),
            }],
        };

        let labels = BTreeMap::from([
            ("created-by-prow".to_string(), "true".to_string()),
            ("prow.k8s.io/type".to_string(), "presubmit".to_string()),
            ("prow.k8s.io/job".to_string(), label_value(&job_name)),
            ("prow.k8s.io/context".to_string(), label_value(CLUSTER_PROVISIONING_TEST)),
            ("prow.k8s.io/refs.org".to_string(), label_value(&meta.org)),
            ("prow.k8s.io/refs.repo".to_string(), label_value(&meta.repo)),
            ("prow.k8s.io/refs.base_ref".to_string(), label_value(&meta.branch)),
            ("prow.k8s.io/refs.pull".to_string(), pull.number.to_string()),
            ("event-GUID".to_string(), label_value(pr.github_guid())),
        ]);
        let annotations = BTreeMap::from([
            ("prow.k8s.io/job".to_string(), job_name.clone()),
            ("prow.k8s.io/context".to_string(), context.clone()),
        ]);

        let container = Container {
            name: "test".to_string(),
            image: Some(self.ci_operator_image.clone()),
            command: Some(vec!["ci-operator".to_string()]),
            args: Some(vec![
                format!("--target={}", CLUSTER_PROVISIONING_TEST),
                "--give-pr-author-access-to-namespace=true".to_string(),
            ]),
            ..Default::default()
        };

        Ok(ProwJob {
            metadata: ObjectMeta {
                labels: Some(labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: ProwJobSpec {
                type_: "presubmit".to_string(),
                agent: "kubernetes".to_string(),
                job: job_name,
                refs: Some(refs),
                context,
                rerun_command: format!("/test {}", CLUSTER_PROVISIONING_TEST),
                pod_spec: Some(PodSpec {
                    containers: vec![container],
                    ..Default::default()
                }),
                ..Default::default()
            },
            status: None,
        })
    }
}

pub struct Synthesizer {
    generator: Arc<dyn JobGenerator>,
    cli_image: ImageStreamTagReference,
    prowjob_namespace: String,
    default_cluster: String,
}

impl Synthesizer {
    pub fn new(
        generator: Arc<dyn JobGenerator>,
        cli_image: ImageStreamTagReference,
        prowjob_namespace: impl Into<String>,
        default_cluster: impl Into<String>,
    ) -> Self {
        Self {
            generator,
            cli_image,
            prowjob_namespace: prowjob_namespace.into(),
            default_cluster: default_cluster.into(),
        }
    }

    /// Builds the ProwJob for `ec`, ready to be created.
    pub fn synthesize(&self, ec: &EphemeralCluster, now: DateTime<Utc>) -> Result<ProwJob, Error> {
        let pr = PrMeta::from_annotations(ec)?;
        let config = BuildConfiguration::assemble(&ec.spec.ci_operator, &pr, &self.cli_image)?;
        let mut prowjob = self.generator.generate(&config, &pr)?;

        prowjob.metadata.name = Some(uuid::Uuid::new_v4().to_string());
        prowjob.metadata.namespace = Some(self.prowjob_namespace.clone());
        prowjob
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(EPHEMERAL_CLUSTER_LABEL.to_string(), ec.name_any());

        // The dispatcher moves the job to its real cluster once it is scheduled.
        prowjob.spec.cluster = self.default_cluster.clone();
        prowjob.spec.report = false;
        prowjob.status = Some(ProwJobStatus {
            state: "scheduling".to_string(),
            start_time: Some(now.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ..Default::default()
        });

        inline_config(&mut prowjob, &config)?;
        Ok(prowjob)
    }
}

fn inline_config(prowjob: &mut ProwJob, config: &BuildConfiguration) -> Result<(), Error> {
    let yaml = serde_yaml::to_string(config)
        .map_err(|e| Error::SynthesisError(format!("marshal ci-operator config: {}", e)))?;

    let container = match prowjob.spec.pod_spec.as_mut() {
        Some(pod_spec) if pod_spec.containers.len() == 1 => &mut pod_spec.containers[0],
        _ => {
            return Err(Error::SynthesisError(
                "expected exactly one container in the ProwJob pod spec".to_string(),
            ))
        }
    };
    container.env.get_or_insert_with(Vec::new).push(EnvVar {
        name: UNRESOLVED_CONFIG_ENV.to_string(),
        value: Some(yaml),
        ..Default::default()
    });
    Ok(())
}
