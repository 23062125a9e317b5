/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/controllers/ephemeralcluster_controller.rs
*
* This file implements the reconciliation logic for the EphemeralCluster
* custom resource. The controller creates the ProwJob that provisions the
* cluster, copies the cluster's credentials from the build cluster into the
* resource's status, signals the job once the requester is done with the
* cluster, and reports how the job ended.
*
* Architecture:
* The reconciler is level-triggered. Every pass re-reads the object and the
* world, computes an observed status starting from the stored one, and writes
* it back only if something changed. The phase only moves forward and the
* kubeconfig and password are written once.
*
* Core Logic:
* - Binding: with no `prowJobID` recorded, ProwJobs labeled for the object are
*   listed first. None means a new job is synthesized and created, one means
*   the job is rebound, more than one is a terminal error.
* - Credentials: the job's build cluster is resolved through the
*   `ClusterRouter`, the ci-operator namespace is found by its job-id label,
*   and the kubeconfig (plus the admin password for claimed clusters) is
*   copied from its secrets.
* - Teardown: once `tearDownCluster` is set, the signal secret is created in
*   the ci-operator namespace. The job's wait step exits when it appears.
* - Deletion: a finalizer keeps the object around until its ProwJob is gone,
*   finished, or aborted by this controller.
*
* Only API failures met along the way are retried, by requeueing after the
* polling interval. Everything else is terminal: it is recorded in status when
* possible and returned to the controller's error policy.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::clients::{BuildCluster, Clock, ControlPlane};
use crate::cluster_router::ClusterRouter;
use crate::conditions::ConditionType;
use crate::controllers::synthesizer::{Synthesizer, CLUSTER_PROVISIONING_TEST};
use crate::controllers::utils::{
    abort_prowjob, is_already_exists, is_not_found, with_finalizer, without_finalizer,
    ReconcileResult,
};
use crate::crds::prowjob::{ProwJob, ProwJobState};
use crate::crds::*;
use crate::error::Error;
use crate::metrics;
use k8s_openapi::api::core::v1::Secret;
use kube::api::ObjectMeta;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, info_span, warn, Instrument};

const CONTROLLER_NAME: &str = "ephemeralcluster";

pub const ABORT_EPHEMERAL_CLUSTER_DELETED: &str = "Ephemeral Cluster deleted";
pub const TEST_DONE_SIGNAL_SECRET: &str = "ephemeral-cluster-test-done";
pub const JOB_ID_NAMESPACE_LABEL: &str = "ci.openshift.io/jobid";
pub const HIVE_ADMIN_KUBECONFIG_SECRET: &str = "cluster-provisioning-hive-admin-kubeconfig";
pub const HIVE_ADMIN_PASSWORD_SECRET: &str = "cluster-provisioning-hive-admin-password";

/// The context required by the reconciler.
pub struct Context {
    pub control_plane: Arc<dyn ControlPlane>,
    pub router: Arc<ClusterRouter>,
    pub synthesizer: Synthesizer,
    pub clock: Arc<dyn Clock>,
    pub polling: Duration,
}

impl Context {
    fn requeue(&self) -> ReconcileResult {
        ReconcileResult::requeue(self.polling)
    }
}

/// Entry point for the kube-runtime controller.
pub async fn reconcile(ec: Arc<EphemeralCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = ec.name_any();
    let span = info_span!("reconcile_ephemeralcluster", ephemeralcluster = %name);
    let result = reconcile_ephemeral_cluster(&ctx, &name).instrument(span).await;

    match &result {
        Ok(r) => metrics::record_reconcile(CONTROLLER_NAME, r.metric_label()),
        Err(e) => metrics::record_reconcile(CONTROLLER_NAME, e.metric_label()),
    }
    result.map(ReconcileResult::into_action)
}

/// Errors reaching the controller are terminal; wait for the object to change.
pub fn on_error(ec: Arc<EphemeralCluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(ephemeralcluster = %ec.name_any(), %error, "EphemeralCluster reconciliation failed");
    Action::await_change()
}

/// Reconciles the EphemeralCluster `name`. Retryable failures come back as a
/// requeue after the polling interval, never as an `Err`.
pub async fn reconcile_ephemeral_cluster(ctx: &Context, name: &str) -> Result<ReconcileResult, Error> {
    let ec = ctx
        .control_plane
        .get_ephemeral_cluster(name)
        .await
        .map_err(|source| Error::FetchError {
            name: name.to_string(),
            source,
        })?;

    let result = if ec.metadata.deletion_timestamp.is_some() {
        handle_deletion(ctx, &ec).await
    } else {
        reconcile_live(ctx, ec).await
    };

    match result {
        Err(e) if !e.is_terminal() => {
            warn!(error = %e, "Retrying after polling interval");
            Ok(ctx.requeue())
        }
        other => other,
    }
}

async fn reconcile_live(ctx: &Context, ec: EphemeralCluster) -> Result<ReconcileResult, Error> {
    let mut observed = ec.observed_status();
    if observed.prow_job_id.is_empty() {
        return bind_or_create_prowjob(ctx, ec, observed).await;
    }

    observed.conditions.upsert(
        ConditionType::ClusterProvisioning,
        false,
        PROWJOB_CREATING_DONE_REASON,
        "",
        ctx.clock.now(),
    );

    let prowjob = match ctx.control_plane.get_prowjob(&observed.prow_job_id).await {
        Ok(pj) => pj,
        Err(e) if is_not_found(&e) => {
            info!(prowjob = %observed.prow_job_id, "ProwJob not found");
            return remove_finalizer(ctx, &ec, ReconcileResult::done()).await;
        }
        Err(e) => return Err(e.into()),
    };

    if let Err(err) = fetch_credentials(ctx, &ec, &mut observed, &prowjob).await {
        return Err(fail_with_status(ctx, &ec, &observed, err).await);
    }

    if ec.spec.tear_down_cluster && !observed.conditions.is_true(ConditionType::TestCompleted) {
        if let Err(err) = notify_test_complete(ctx, &mut observed, &prowjob).await {
            return Err(fail_with_status(ctx, &ec, &observed, err).await);
        }
    }

    // A job in a final state is the only reason to stop polling.
    let result = if report_final_state(ctx, &prowjob, &mut observed) {
        ReconcileResult::done()
    } else {
        ctx.requeue()
    };

    persist_status(ctx, &ec, &observed).await?;
    Ok(result)
}

async fn bind_or_create_prowjob(
    ctx: &Context,
    ec: EphemeralCluster,
    mut observed: EphemeralClusterStatus,
) -> Result<ReconcileResult, Error> {
    let selector = format!("{}={}", EPHEMERAL_CLUSTER_LABEL, ec.name_any());
    let mut existing = ctx.control_plane.list_prowjobs(&selector).await?;

    match existing.len() {
        0 => create_prowjob(ctx, ec, observed).await,
        1 => {
            let prowjob = existing.remove(0);
            info!(prowjob = %prowjob.name_any(), "ProwJob found but was not bound, binding now");
            observed.prow_job_id = prowjob.name_any();
            let ec = add_finalizer(ctx, ec).await?;
            persist_status(ctx, &ec, &observed).await?;
            Ok(ctx.requeue())
        }
        count => {
            error!(count, "Too many ProwJobs bound");
            let err = Error::TooManyProwJobs {
                name: ec.name_any(),
                count,
            };
            observed.conditions.upsert(
                ConditionType::ClusterProvisioning,
                false,
                PROWJOB_BIND_FAILURE_REASON,
                &err.to_string(),
                ctx.clock.now(),
            );
            advance_phase(&mut observed, EphemeralClusterPhase::Failed);
            Err(fail_with_status(ctx, &ec, &observed, err).await)
        }
    }
}

async fn create_prowjob(
    ctx: &Context,
    ec: EphemeralCluster,
    mut observed: EphemeralClusterStatus,
) -> Result<ReconcileResult, Error> {
    let now = ctx.clock.now();

    let prowjob = match ctx.synthesizer.synthesize(&ec, now) {
        Ok(pj) => pj,
        Err(err) => {
            error!(error = %err, "Failed to synthesize the ProwJob");
            observed.conditions.upsert(
                ConditionType::ClusterProvisioning,
                false,
                CI_OPERATOR_JOBS_GENERATE_FAILURE_REASON,
                &err.to_string(),
                now,
            );
            advance_phase(&mut observed, EphemeralClusterPhase::Failed);
            return Err(fail_with_status(ctx, &ec, &observed, err).await);
        }
    };

    let created = match ctx.control_plane.create_prowjob(&prowjob).await {
        Ok(pj) => pj,
        Err(e) => {
            warn!(prowjob = %prowjob.name_any(), error = %e, "Failed to create the ProwJob");
            observed.conditions.upsert(
                ConditionType::ClusterProvisioning,
                false,
                CI_OPERATOR_JOBS_GENERATE_FAILURE_REASON,
                &format!("create prowjob: {}", e),
                now,
            );
            persist_status(ctx, &ec, &observed).await?;
            return Ok(ctx.requeue());
        }
    };
    metrics::PROWJOBS_CREATED_TOTAL.inc();
    info!(prowjob = %created.name_any(), "ProwJob created");

    // The finalizer goes on first: an object must never point at a job it
    // does not hold a finalizer for.
    let ec = add_finalizer(ctx, ec).await?;

    observed.prow_job_id = created.name_any();
    observed
        .conditions
        .upsert(ConditionType::ClusterProvisioning, true, "", "", now);
    advance_phase(&mut observed, EphemeralClusterPhase::Provisioning);
    persist_status(ctx, &ec, &observed).await?;
    Ok(ctx.requeue())
}

fn credentials_present(ec: &EphemeralCluster, status: &EphemeralClusterStatus) -> bool {
    if ec.is_cluster_claim() {
        !status.kubeconfig.is_empty() && !status.kube_admin_password.is_empty()
    } else {
        !status.kubeconfig.is_empty()
    }
}

/// Copies the cluster credentials into `observed`. Credentials are written
/// once. Not-ready states are recorded as conditions and are not errors; only
/// an unknown build cluster is.
async fn fetch_credentials(
    ctx: &Context,
    ec: &EphemeralCluster,
    observed: &mut EphemeralClusterStatus,
    prowjob: &ProwJob,
) -> Result<(), Error> {
    if credentials_present(ec, observed) {
        return Ok(());
    }

    let now = ctx.clock.now();
    let client = match ctx.router.client_for(prowjob) {
        Ok(client) => client,
        Err(err) => {
            error!(cluster = %prowjob.spec.cluster, "Build client not found");
            observed.conditions.upsert(
                ConditionType::ClusterReady,
                false,
                SECRETS_FETCH_FAILURE_REASON,
                &err.to_string(),
                now,
            );
            advance_phase(observed, EphemeralClusterPhase::Failed);
            return Err(err);
        }
    };

    let Some(namespace) = find_test_namespace(client.as_ref(), prowjob).await else {
        info!("ci-operator namespace not found");
        observed.conditions.upsert(
            ConditionType::ClusterReady,
            false,
            SECRETS_FETCH_FAILURE_REASON,
            CI_OPERATOR_NS_NOT_FOUND_MSG,
            now,
        );
        return Ok(());
    };

    let fetched = if ec.is_cluster_claim() {
        fetch_hive_secrets(client.as_ref(), &namespace, observed).await
    } else {
        fetch_kubeconfig(client.as_ref(), &namespace, observed).await
    };

    match fetched {
        Ok(()) => {
            info!(namespace = %namespace, "Cluster credentials fetched");
            observed
                .conditions
                .upsert(ConditionType::ClusterReady, true, "", "", now);
            advance_phase(observed, EphemeralClusterPhase::Ready);
        }
        Err(message) => {
            observed.conditions.upsert(
                ConditionType::ClusterReady,
                false,
                SECRETS_FETCH_FAILURE_REASON,
                &message,
                now,
            );
        }
    }
    Ok(())
}

/// The namespace ci-operator runs the job's tests in. API failures are
/// treated like a namespace that does not exist yet.
async fn find_test_namespace(client: &dyn BuildCluster, prowjob: &ProwJob) -> Option<String> {
    let selector = format!("{}={}", JOB_ID_NAMESPACE_LABEL, prowjob.name_any());
    match client.list_namespaces(&selector).await {
        Ok(namespaces) => namespaces.first().map(|ns| ns.name_any()),
        Err(e) => {
            warn!(error = %e, "Failed to list ci-operator namespaces");
            None
        }
    }
}

/// Reads `key` from the secret. `Ok(None)` when the secret or the key is not
/// there yet.
async fn read_secret_key(
    client: &dyn BuildCluster,
    namespace: &str,
    name: &str,
    key: &str,
) -> Result<Option<String>, kube::Error> {
    let secret = match client.get_secret(namespace, name).await {
        Ok(secret) => secret,
        Err(e) if is_not_found(&e) => return Ok(None),
        Err(e) => return Err(e),
    };
    Ok(secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .filter(|value| !value.0.is_empty())
        .map(|value| String::from_utf8_lossy(&value.0).into_owned()))
}

async fn fetch_kubeconfig(
    client: &dyn BuildCluster,
    namespace: &str,
    observed: &mut EphemeralClusterStatus,
) -> Result<(), String> {
    match read_secret_key(client, namespace, CLUSTER_PROVISIONING_TEST, "kubeconfig").await {
        Ok(Some(kubeconfig)) => {
            observed.kubeconfig = kubeconfig;
            Ok(())
        }
        Ok(None) => Err(KUBECONFIG_NOT_READY_MSG.to_string()),
        Err(e) => {
            warn!(secret = CLUSTER_PROVISIONING_TEST, error = %e, "Failed to read secret");
            Err(e.to_string())
        }
    }
}

async fn fetch_hive_secrets(
    client: &dyn BuildCluster,
    namespace: &str,
    observed: &mut EphemeralClusterStatus,
) -> Result<(), String> {
    let mut values = Vec::with_capacity(2);
    for (secret, key) in [
        (HIVE_ADMIN_KUBECONFIG_SECRET, "kubeconfig"),
        (HIVE_ADMIN_PASSWORD_SECRET, "password"),
    ] {
        match read_secret_key(client, namespace, secret, key).await {
            Ok(Some(value)) => values.push(value),
            Ok(None) => return Err(HIVE_SECRETS_NOT_READY_MSG.to_string()),
            Err(e) => {
                warn!(secret, error = %e, "Failed to read secret");
                return Err(e.to_string());
            }
        }
    }

    observed.kube_admin_password = values.pop().unwrap_or_default();
    observed.kubeconfig = values.pop().unwrap_or_default();
    Ok(())
}

/// Creates the secret the job's wait step polls for.
async fn notify_test_complete(
    ctx: &Context,
    observed: &mut EphemeralClusterStatus,
    prowjob: &ProwJob,
) -> Result<(), Error> {
    let now = ctx.clock.now();
    let record_failure = |observed: &mut EphemeralClusterStatus, message: &str| {
        observed.conditions.upsert(
            ConditionType::TestCompleted,
            false,
            CREATE_TEST_COMPLETED_SECRET_FAILURE_REASON,
            message,
            now,
        );
    };

    let client = match ctx.router.client_for(prowjob) {
        Ok(client) => client,
        Err(err) => {
            error!(cluster = %prowjob.spec.cluster, "Build client not found");
            record_failure(observed, &err.to_string());
            advance_phase(observed, EphemeralClusterPhase::Failed);
            return Err(err);
        }
    };

    let Some(namespace) = find_test_namespace(client.as_ref(), prowjob).await else {
        record_failure(observed, CI_OPERATOR_NS_NOT_FOUND_MSG);
        return Ok(());
    };

    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(TEST_DONE_SIGNAL_SECRET.to_string()),
            namespace: Some(namespace.clone()),
            ..Default::default()
        },
        ..Default::default()
    };
    match client.create_secret(&namespace, &secret).await {
        Ok(_) => info!(namespace = %namespace, "Test completed secret created"),
        Err(e) if is_already_exists(&e) => {}
        Err(e) => {
            warn!(namespace = %namespace, error = %e, "Failed to create the test completed secret");
            record_failure(observed, &e.to_string());
            return Ok(());
        }
    }

    observed
        .conditions
        .upsert(ConditionType::TestCompleted, true, "", "", now);
    advance_phase(observed, EphemeralClusterPhase::Deprovisioning);
    Ok(())
}

/// Records how the job ended. Returns whether the job is in a final state.
fn report_final_state(ctx: &Context, prowjob: &ProwJob, observed: &mut EphemeralClusterStatus) -> bool {
    let message = format!("prowjob state: {}", prowjob.state_str());
    let (reason, phase) = match prowjob.state() {
        ProwJobState::Aborted | ProwJobState::Error | ProwJobState::Failure => {
            (PROWJOB_FAILURE_REASON, EphemeralClusterPhase::Failed)
        }
        ProwJobState::Success => (PROWJOB_COMPLETED_REASON, EphemeralClusterPhase::Deprovisioned),
        _ => return false,
    };

    observed.conditions.upsert(
        ConditionType::ProwJobCompleted,
        true,
        reason,
        &message,
        ctx.clock.now(),
    );
    advance_phase(observed, phase);
    true
}

async fn handle_deletion(ctx: &Context, ec: &EphemeralCluster) -> Result<ReconcileResult, Error> {
    let prow_job_id = ec
        .status
        .as_ref()
        .map(|s| s.prow_job_id.as_str())
        .unwrap_or_default();
    if prow_job_id.is_empty() {
        info!("No ProwJob bound, removing the finalizer");
        return remove_finalizer(ctx, ec, ctx.requeue()).await;
    }

    let prowjob = match ctx.control_plane.get_prowjob(prow_job_id).await {
        Ok(pj) => pj,
        Err(e) if is_not_found(&e) => {
            info!(prowjob = %prow_job_id, "ProwJob not found, removing the finalizer");
            return remove_finalizer(ctx, ec, ctx.requeue()).await;
        }
        Err(e) => return Err(e.into()),
    };

    if prowjob.state().is_terminal() {
        info!(prowjob = %prow_job_id, state = prowjob.state_str(), "ProwJob in a final state already, removing the finalizer");
        return remove_finalizer(ctx, ec, ctx.requeue()).await;
    }

    abort_prowjob(
        ctx.control_plane.as_ref(),
        ctx.clock.as_ref(),
        &prowjob,
        ABORT_EPHEMERAL_CLUSTER_DELETED,
    )
    .await?;
    Ok(ctx.requeue())
}

/// Drops our finalizer. When it is not there, `absent` is returned unchanged.
async fn remove_finalizer(
    ctx: &Context,
    ec: &EphemeralCluster,
    absent: ReconcileResult,
) -> Result<ReconcileResult, Error> {
    match without_finalizer(ec) {
        Some(finalizers) => {
            ctx.control_plane.update_finalizers(ec, finalizers).await?;
            info!("Finalizer removed");
            Ok(ReconcileResult::done())
        }
        None => Ok(absent),
    }
}

async fn add_finalizer(ctx: &Context, ec: EphemeralCluster) -> Result<EphemeralCluster, Error> {
    match with_finalizer(&ec) {
        Some(finalizers) => Ok(ctx.control_plane.update_finalizers(&ec, finalizers).await?),
        None => Ok(ec),
    }
}

fn advance_phase(observed: &mut EphemeralClusterStatus, phase: EphemeralClusterPhase) {
    let before = observed.phase;
    observed.advance_phase(phase);
    if observed.phase != before {
        metrics::PHASE_TRANSITIONS_TOTAL
            .with_label_values(&[observed.phase.as_str()])
            .inc();
    }
}

/// Writes `observed` unless it equals what is stored.
async fn persist_status(
    ctx: &Context,
    ec: &EphemeralCluster,
    observed: &EphemeralClusterStatus,
) -> Result<(), Error> {
    if ec.status.as_ref() == Some(observed) {
        return Ok(());
    }
    ctx.control_plane.update_status(ec, observed).await?;
    Ok(())
}

/// Records a terminal error in status on a best-effort basis. If that write
/// fails too, both errors are returned together.
async fn fail_with_status(
    ctx: &Context,
    ec: &EphemeralCluster,
    observed: &EphemeralClusterStatus,
    err: Error,
) -> Error {
    match persist_status(ctx, ec, observed).await {
        Ok(()) => err,
        Err(update_err) => Error::aggregate(err, update_err),
    }
}
