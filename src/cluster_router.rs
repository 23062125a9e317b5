/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/cluster_router.rs
*
* Routes a ProwJob to a client for the worker cluster it runs on.
*
* The router is built once at startup from a single kubeconfig: every context
* in it is one worker cluster, keyed by the context name. Prow records that
* same name in `spec.cluster`, so the lookup is a plain map access. After
* construction the router is read-only and shared between reconciliations.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::clients::{BuildCluster, KubeBuildCluster};
use crate::crds::prowjob::ProwJob;
use crate::error::Error;
use anyhow::{Context, Result};
use futures::future::join_all;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub struct ClusterRouter {
    /// Worker-cluster name to client.
    clients: BTreeMap<String, Arc<dyn BuildCluster>>,
}

impl ClusterRouter {
    pub fn new(clients: BTreeMap<String, Arc<dyn BuildCluster>>) -> Self {
        Self { clients }
    }

    /// Creates a client for every context of the kubeconfig at `path`.
    pub async fn from_kubeconfig(path: &Path) -> Result<Self> {
        let kubeconfig = Kubeconfig::read_from(path)
            .with_context(|| format!("Failed to read build clusters kubeconfig '{}'", path.display()))?;

        let client_futures = kubeconfig.contexts.iter().map(|context| {
            let kubeconfig = kubeconfig.clone();
            let name = context.name.clone();
            async move {
                let options = KubeConfigOptions {
                    context: Some(name.clone()),
                    ..Default::default()
                };
                let config = Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .with_context(|| format!("Failed to load kubeconfig for cluster '{}'", name))?;
                let client = Client::try_from(config)
                    .with_context(|| format!("Failed to create Kubernetes client for cluster '{}'", name))?;
                Ok::<_, anyhow::Error>((name, Arc::new(KubeBuildCluster::new(client)) as Arc<dyn BuildCluster>))
            }
        });

        let mut clients = BTreeMap::new();
        for result in join_all(client_futures).await {
            let (name, client) = result?;
            clients.insert(name, client);
        }

        let router = Self::new(clients);
        info!(clusters = ?router.cluster_names().collect::<Vec<_>>(), "Build cluster clients initialized");
        Ok(router)
    }

    /// The client for the cluster named in `prowjob.spec.cluster`.
    pub fn client_for(&self, prowjob: &ProwJob) -> Result<Arc<dyn BuildCluster>, Error> {
        self.get(&prowjob.spec.cluster)
    }

    pub fn get(&self, cluster: &str) -> Result<Arc<dyn BuildCluster>, Error> {
        self.clients
            .get(cluster)
            .cloned()
            .ok_or_else(|| Error::UnknownCluster(cluster.to_string()))
    }

    pub fn cluster_names(&self) -> impl Iterator<Item = &str> {
        self.clients.keys().map(String::as_str)
    }
}
