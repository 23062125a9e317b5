/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/controllers/prowjob_controller.rs
*
* Companion reconciler for ProwJobs created on behalf of an EphemeralCluster.
*
* The EphemeralCluster's finalizer normally ensures its job is aborted before
* the object goes away. This controller covers the remaining gap: a ProwJob
* whose EphemeralCluster no longer exists (the finalizer was removed by hand,
* or the job was created and the object vanished before it was bound) is
* aborted so it does not hold a cluster for nothing.
*
* Only ProwJobs carrying the `ci.openshift.io/ephemeral-cluster` label are
* watched, see `main.rs`.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::clients::{Clock, ControlPlane};
use crate::controllers::utils::{abort_prowjob, is_not_found, ReconcileResult};
use crate::crds::prowjob::ProwJob;
use crate::crds::EPHEMERAL_CLUSTER_LABEL;
use crate::error::Error;
use crate::metrics;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, info_span, warn, Instrument};

const CONTROLLER_NAME: &str = "prowjob";

pub const ABORT_EPHEMERAL_CLUSTER_NOT_FOUND: &str = "EphemeralCluster not found";

pub struct Context {
    pub control_plane: Arc<dyn ControlPlane>,
    pub clock: Arc<dyn Clock>,
    pub polling: Duration,
}

pub async fn reconcile(prowjob: Arc<ProwJob>, ctx: Arc<Context>) -> Result<Action, Error> {
    let span = info_span!("reconcile_prowjob", prowjob = %prowjob.name_any());
    let result = reconcile_prowjob(&ctx, &prowjob).instrument(span).await;

    match &result {
        Ok(r) => metrics::record_reconcile(CONTROLLER_NAME, r.metric_label()),
        Err(e) => metrics::record_reconcile(CONTROLLER_NAME, e.metric_label()),
    }
    result.map(ReconcileResult::into_action)
}

pub fn on_error(prowjob: Arc<ProwJob>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(prowjob = %prowjob.name_any(), %error, "ProwJob reconciliation failed");
    Action::await_change()
}

/// Aborts `prowjob` if the EphemeralCluster named by its label is gone.
pub async fn reconcile_prowjob(ctx: &Context, prowjob: &ProwJob) -> Result<ReconcileResult, Error> {
    let ec_name = match prowjob.label(EPHEMERAL_CLUSTER_LABEL) {
        Some(name) if !name.is_empty() => name,
        _ => return Err(Error::MissingNameLabel(prowjob.name_any())),
    };

    match ctx.control_plane.get_ephemeral_cluster(ec_name).await {
        Ok(_) => Ok(ReconcileResult::done()),
        Err(e) if is_not_found(&e) => {
            if prowjob.state().is_terminal() {
                return Ok(ReconcileResult::done());
            }
            info!(ephemeralcluster = %ec_name, "EphemeralCluster not found, aborting ProwJob");
            match abort_prowjob(
                ctx.control_plane.as_ref(),
                ctx.clock.as_ref(),
                prowjob,
                ABORT_EPHEMERAL_CLUSTER_NOT_FOUND,
            )
            .await
            {
                Ok(_) => Ok(ReconcileResult::done()),
                Err(e) => {
                    warn!(error = %e, "Failed to abort ProwJob");
                    Ok(ReconcileResult::requeue(ctx.polling))
                }
            }
        }
        Err(e) => {
            warn!(ephemeralcluster = %ec_name, error = %e, "Failed to get EphemeralCluster");
            Ok(ReconcileResult::requeue(ctx.polling))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::fake::{api_error, FakeControlPlane, FixedClock};
    use crate::clients::MockControlPlane;
    use crate::controllers::synthesizer::fixtures::ephemeral_cluster;
    use crate::crds::prowjob::{ProwJobSpec, ProwJobState, ProwJobStatus};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    const POLLING: Duration = Duration::from_secs(3);

    fn context(control_plane: Arc<dyn ControlPlane>) -> Context {
        Context {
            control_plane,
            clock: Arc::new(FixedClock(Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap())),
            polling: POLLING,
        }
    }

    fn prowjob(label: Option<&str>, state: &str) -> ProwJob {
        let mut pj = ProwJob::new("pj-1", ProwJobSpec::default());
        pj.metadata.labels =
            label.map(|l| BTreeMap::from([(EPHEMERAL_CLUSTER_LABEL.to_string(), l.to_string())]));
        pj.status = Some(ProwJobStatus {
            state: state.to_string(),
            ..Default::default()
        });
        pj
    }

    #[tokio::test]
    async fn missing_label_is_terminal() {
        let ctx = context(Arc::new(FakeControlPlane::default()));

        let err = reconcile_prowjob(&ctx, &prowjob(None, "pending")).await.unwrap_err();
        assert!(matches!(err, Error::MissingNameLabel(_)));
        assert!(err.is_terminal());

        let err = reconcile_prowjob(&ctx, &prowjob(Some(""), "pending")).await.unwrap_err();
        assert!(matches!(err, Error::MissingNameLabel(_)));
    }

    #[tokio::test]
    async fn orphaned_prowjob_is_aborted() {
        let pj = prowjob(Some("ec"), "pending");
        let cp = Arc::new(FakeControlPlane::with(vec![], vec![pj.clone()]));
        let ctx = context(cp.clone());

        let result = reconcile_prowjob(&ctx, &pj).await.unwrap();
        assert_eq!(result, ReconcileResult::done());

        let stored = cp.prowjob("pj-1");
        assert_eq!(stored.state(), ProwJobState::Aborted);
        assert_eq!(
            stored.status.as_ref().unwrap().description,
            ABORT_EPHEMERAL_CLUSTER_NOT_FOUND
        );
    }

    #[tokio::test]
    async fn finished_or_aborted_prowjobs_are_left_alone() {
        for state in ["success", "failure", "aborted"] {
            let pj = prowjob(Some("ec"), state);
            let cp = Arc::new(FakeControlPlane::with(vec![], vec![pj.clone()]));
            let ctx = context(cp.clone());

            let result = reconcile_prowjob(&ctx, &pj).await.unwrap();
            assert_eq!(result, ReconcileResult::done());
            assert_eq!(cp.writes(), 0, "state {state}");
            assert_eq!(cp.prowjob("pj-1").state_str(), state);
        }
    }

    #[tokio::test]
    async fn live_ephemeral_cluster_keeps_its_prowjob() {
        let pj = prowjob(Some("ec"), "pending");
        let cp = Arc::new(FakeControlPlane::with(vec![ephemeral_cluster("ec")], vec![pj.clone()]));
        let ctx = context(cp.clone());

        let result = reconcile_prowjob(&ctx, &pj).await.unwrap();
        assert_eq!(result, ReconcileResult::done());
        assert_eq!(cp.writes(), 0);
        assert_eq!(cp.prowjob("pj-1").state(), ProwJobState::Pending);
    }

    #[tokio::test]
    async fn api_failures_are_retried() {
        let mut cp = MockControlPlane::new();
        cp.expect_get_ephemeral_cluster()
            .returning(|_| Err(api_error(500, "InternalError")));
        cp.expect_abort_prowjob().never();
        let ctx = context(Arc::new(cp));

        let result = reconcile_prowjob(&ctx, &prowjob(Some("ec"), "pending")).await.unwrap();
        assert_eq!(result.requeue_after, POLLING);

        let mut cp = MockControlPlane::new();
        cp.expect_get_ephemeral_cluster()
            .returning(|_| Err(api_error(404, "NotFound")));
        cp.expect_abort_prowjob()
            .times(1)
            .returning(|_, _, _| Err(api_error(409, "Conflict")));
        let ctx = context(Arc::new(cp));

        let result = reconcile_prowjob(&ctx, &prowjob(Some("ec"), "pending")).await.unwrap();
        assert_eq!(result.requeue_after, POLLING);
    }
}
