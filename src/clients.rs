/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/clients.rs
*
* The seams between the reconcilers and the outside world.
*
* Architecture:
* - `ControlPlane` covers everything the operator reads and writes in its own
*   cluster: EphemeralClusters and ProwJobs.
* - `BuildCluster` covers the handful of calls made against a worker cluster,
*   where the CI job actually runs and publishes the cluster credentials.
* - `Clock` stamps condition transitions and abort times.
*
* The kube-backed implementations below are what `main.rs` wires in. Tests
* use in-memory fakes or the `mockall` mocks generated for each trait.
*
* All writes to existing objects are merge patches. Writes to EphemeralClusters
* carry the resourceVersion the reconciler read, so a concurrent change makes
* the write fail with a conflict instead of silently overwriting it.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::crds::prowjob::ProwJob;
use crate::crds::{EphemeralCluster, EphemeralClusterStatus};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams},
    Client, ResourceExt,
};
use serde_json::json;

#[cfg(test)]
use mockall::automock;

/// Operations against the control-plane cluster hosting the EphemeralCluster
/// and ProwJob resources.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn get_ephemeral_cluster(&self, name: &str) -> Result<EphemeralCluster, kube::Error>;

    /// Replaces the finalizer list and returns the updated object.
    async fn update_finalizers(
        &self,
        ec: &EphemeralCluster,
        finalizers: Vec<String>,
    ) -> Result<EphemeralCluster, kube::Error>;

    /// Writes the status subresource and returns the updated object.
    async fn update_status(
        &self,
        ec: &EphemeralCluster,
        status: &EphemeralClusterStatus,
    ) -> Result<EphemeralCluster, kube::Error>;

    async fn get_prowjob(&self, name: &str) -> Result<ProwJob, kube::Error>;

    async fn list_prowjobs(&self, label_selector: &str) -> Result<Vec<ProwJob>, kube::Error>;

    async fn create_prowjob(&self, prowjob: &ProwJob) -> Result<ProwJob, kube::Error>;

    /// Marks the job aborted. Only `state`, `description` and `completionTime`
    /// are written.
    async fn abort_prowjob(
        &self,
        name: &str,
        description: &str,
        completion_time: DateTime<Utc>,
    ) -> Result<ProwJob, kube::Error>;
}

/// Operations against a single worker cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BuildCluster: Send + Sync {
    async fn list_namespaces(&self, label_selector: &str) -> Result<Vec<Namespace>, kube::Error>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, kube::Error>;

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, kube::Error>;
}

#[cfg_attr(test, automock)]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// --- kube-backed implementations ---

pub struct KubeControlPlane {
    ephemeral_clusters: Api<EphemeralCluster>,
    prowjobs: Api<ProwJob>,
}

impl KubeControlPlane {
    pub fn new(client: Client, ephemeral_cluster_namespace: &str, prowjob_namespace: &str) -> Self {
        Self {
            ephemeral_clusters: Api::namespaced(client.clone(), ephemeral_cluster_namespace),
            prowjobs: Api::namespaced(client, prowjob_namespace),
        }
    }
}

#[async_trait]
impl ControlPlane for KubeControlPlane {
    async fn get_ephemeral_cluster(&self, name: &str) -> Result<EphemeralCluster, kube::Error> {
        self.ephemeral_clusters.get(name).await
    }

    async fn update_finalizers(
        &self,
        ec: &EphemeralCluster,
        finalizers: Vec<String>,
    ) -> Result<EphemeralCluster, kube::Error> {
        let patch = json!({
            "metadata": {
                "resourceVersion": ec.resource_version(),
                "finalizers": finalizers,
            }
        });
        self.ephemeral_clusters
            .patch(&ec.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
    }

    async fn update_status(
        &self,
        ec: &EphemeralCluster,
        status: &EphemeralClusterStatus,
    ) -> Result<EphemeralCluster, kube::Error> {
        let patch = json!({
            "metadata": { "resourceVersion": ec.resource_version() },
            "status": status,
        });
        self.ephemeral_clusters
            .patch_status(&ec.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
    }

    async fn get_prowjob(&self, name: &str) -> Result<ProwJob, kube::Error> {
        self.prowjobs.get(name).await
    }

    async fn list_prowjobs(&self, label_selector: &str) -> Result<Vec<ProwJob>, kube::Error> {
        let lp = ListParams::default().labels(label_selector);
        Ok(self.prowjobs.list(&lp).await?.items)
    }

    async fn create_prowjob(&self, prowjob: &ProwJob) -> Result<ProwJob, kube::Error> {
        self.prowjobs.create(&PostParams::default(), prowjob).await
    }

    async fn abort_prowjob(
        &self,
        name: &str,
        description: &str,
        completion_time: DateTime<Utc>,
    ) -> Result<ProwJob, kube::Error> {
        // The ProwJob CRD has no status subresource; status is part of the object.
        let patch = json!({
            "status": {
                "state": "aborted",
                "description": description,
                "completionTime": completion_time.to_rfc3339_opts(SecondsFormat::Secs, true),
            }
        });
        self.prowjobs
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
    }
}

pub struct KubeBuildCluster {
    client: Client,
}

impl KubeBuildCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BuildCluster for KubeBuildCluster {
    async fn list_namespaces(&self, label_selector: &str) -> Result<Vec<Namespace>, kube::Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let lp = ListParams::default().labels(label_selector);
        Ok(api.list(&lp).await?.items)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, kube::Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, kube::Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), secret).await
    }
}

/// In-memory implementations of the client traits for reconciler tests.
#[cfg(test)]
pub mod fake {
    use super::*;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    pub fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{} ({})", reason, code),
            reason: reason.to_string(),
            code,
        })
    }

    fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
        match selector.split_once('=') {
            Some((k, v)) => labels.get(k).is_some_and(|l| l == v),
            None => labels.contains_key(selector),
        }
    }

    pub struct FixedClock(pub DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    #[derive(Default)]
    pub struct ControlPlaneState {
        pub ephemeral_clusters: BTreeMap<String, EphemeralCluster>,
        pub prowjobs: BTreeMap<String, ProwJob>,
        pub fail_list: bool,
        pub fail_create: bool,
        pub fail_status_update: bool,
        pub status_writes: usize,
        pub finalizer_writes: usize,
        pub aborts: usize,
    }

    /// Stores objects in maps and enforces resourceVersion preconditions the
    /// way the API server does.
    #[derive(Default)]
    pub struct FakeControlPlane {
        pub state: Mutex<ControlPlaneState>,
    }

    impl FakeControlPlane {
        pub fn with(ecs: Vec<EphemeralCluster>, prowjobs: Vec<ProwJob>) -> Self {
            let state = ControlPlaneState {
                ephemeral_clusters: ecs.into_iter().map(|ec| (ec.name_any(), ec)).collect(),
                prowjobs: prowjobs.into_iter().map(|pj| (pj.name_any(), pj)).collect(),
                ..Default::default()
            };
            Self {
                state: Mutex::new(state),
            }
        }

        pub fn ephemeral_cluster(&self, name: &str) -> EphemeralCluster {
            self.state.lock().unwrap().ephemeral_clusters[name].clone()
        }

        pub fn prowjob(&self, name: &str) -> ProwJob {
            self.state.lock().unwrap().prowjobs[name].clone()
        }

        pub fn prowjob_count(&self) -> usize {
            self.state.lock().unwrap().prowjobs.len()
        }

        pub fn writes(&self) -> usize {
            let s = self.state.lock().unwrap();
            s.status_writes + s.finalizer_writes + s.aborts
        }
    }

    fn checked_update<'a>(
        stored: Option<&'a mut EphemeralCluster>,
        ec: &EphemeralCluster,
    ) -> Result<&'a mut EphemeralCluster, kube::Error> {
        let stored = stored.ok_or_else(|| api_error(404, "NotFound"))?;
        if stored.metadata.resource_version != ec.metadata.resource_version {
            return Err(api_error(409, "Conflict"));
        }
        let next = stored
            .metadata
            .resource_version
            .as_deref()
            .and_then(|rv| rv.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        stored.metadata.resource_version = Some(next.to_string());
        Ok(stored)
    }

    #[async_trait]
    impl ControlPlane for FakeControlPlane {
        async fn get_ephemeral_cluster(&self, name: &str) -> Result<EphemeralCluster, kube::Error> {
            let s = self.state.lock().unwrap();
            s.ephemeral_clusters
                .get(name)
                .cloned()
                .ok_or_else(|| api_error(404, "NotFound"))
        }

        async fn update_finalizers(
            &self,
            ec: &EphemeralCluster,
            finalizers: Vec<String>,
        ) -> Result<EphemeralCluster, kube::Error> {
            let mut s = self.state.lock().unwrap();
            let stored = checked_update(s.ephemeral_clusters.get_mut(&ec.name_any()), ec)?;
            stored.metadata.finalizers = Some(finalizers);
            let updated = stored.clone();
            s.finalizer_writes += 1;
            Ok(updated)
        }

        async fn update_status(
            &self,
            ec: &EphemeralCluster,
            status: &EphemeralClusterStatus,
        ) -> Result<EphemeralCluster, kube::Error> {
            let mut s = self.state.lock().unwrap();
            if s.fail_status_update {
                return Err(api_error(500, "InternalError"));
            }
            let stored = checked_update(s.ephemeral_clusters.get_mut(&ec.name_any()), ec)?;
            stored.status = Some(status.clone());
            let updated = stored.clone();
            s.status_writes += 1;
            Ok(updated)
        }

        async fn get_prowjob(&self, name: &str) -> Result<ProwJob, kube::Error> {
            let s = self.state.lock().unwrap();
            s.prowjobs.get(name).cloned().ok_or_else(|| api_error(404, "NotFound"))
        }

        async fn list_prowjobs(&self, label_selector: &str) -> Result<Vec<ProwJob>, kube::Error> {
            let s = self.state.lock().unwrap();
            if s.fail_list {
                return Err(api_error(500, "InternalError"));
            }
            Ok(s.prowjobs
                .values()
                .filter(|pj| matches_selector(pj.labels(), label_selector))
                .cloned()
                .collect())
        }

        async fn create_prowjob(&self, prowjob: &ProwJob) -> Result<ProwJob, kube::Error> {
            let mut s = self.state.lock().unwrap();
            if s.fail_create {
                return Err(api_error(500, "InternalError"));
            }
            let name = prowjob.name_any();
            if s.prowjobs.contains_key(&name) {
                return Err(api_error(409, "AlreadyExists"));
            }
            s.prowjobs.insert(name, prowjob.clone());
            Ok(prowjob.clone())
        }

        async fn abort_prowjob(
            &self,
            name: &str,
            description: &str,
            completion_time: DateTime<Utc>,
        ) -> Result<ProwJob, kube::Error> {
            let mut s = self.state.lock().unwrap();
            let pj = s.prowjobs.get_mut(name).ok_or_else(|| api_error(404, "NotFound"))?;
            let status = pj.status.get_or_insert_with(Default::default);
            status.state = "aborted".to_string();
            status.description = description.to_string();
            status.completion_time = Some(completion_time.to_rfc3339_opts(SecondsFormat::Secs, true));
            let aborted = pj.clone();
            s.aborts += 1;
            Ok(aborted)
        }
    }

    #[derive(Default)]
    pub struct BuildClusterState {
        pub namespaces: Vec<Namespace>,
        pub secrets: BTreeMap<(String, String), Secret>,
        pub fail_create_secret: bool,
        pub secrets_created: usize,
    }

    #[derive(Default)]
    pub struct FakeBuildCluster {
        pub state: Mutex<BuildClusterState>,
    }

    impl FakeBuildCluster {
        pub fn add_namespace(&self, name: &str, labels: &[(&str, &str)]) {
            let ns = Namespace {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
                    ..Default::default()
                },
                ..Default::default()
            };
            self.state.lock().unwrap().namespaces.push(ns);
        }

        pub fn add_secret(&self, namespace: &str, name: &str, data: &[(&str, &str)]) {
            let secret = Secret {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                data: Some(
                    data.iter()
                        .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                        .collect(),
                ),
                ..Default::default()
            };
            self.state
                .lock()
                .unwrap()
                .secrets
                .insert((namespace.to_string(), name.to_string()), secret);
        }

        pub fn has_secret(&self, namespace: &str, name: &str) -> bool {
            self.state
                .lock()
                .unwrap()
                .secrets
                .contains_key(&(namespace.to_string(), name.to_string()))
        }
    }

    #[async_trait]
    impl BuildCluster for FakeBuildCluster {
        async fn list_namespaces(&self, label_selector: &str) -> Result<Vec<Namespace>, kube::Error> {
            let s = self.state.lock().unwrap();
            Ok(s.namespaces
                .iter()
                .filter(|ns| matches_selector(ns.labels(), label_selector))
                .cloned()
                .collect())
        }

        async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, kube::Error> {
            let s = self.state.lock().unwrap();
            s.secrets
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
                .ok_or_else(|| api_error(404, "NotFound"))
        }

        async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, kube::Error> {
            let mut s = self.state.lock().unwrap();
            if s.fail_create_secret {
                return Err(api_error(500, "InternalError"));
            }
            let key = (namespace.to_string(), secret.name_any());
            if s.secrets.contains_key(&key) {
                return Err(api_error(409, "AlreadyExists"));
            }
            s.secrets.insert(key, secret.clone());
            s.secrets_created += 1;
            Ok(secret.clone())
        }
    }
}
