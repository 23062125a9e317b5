/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/controllers/utils.rs
*
* Helpers shared by the EphemeralCluster and ProwJob controllers.
*
* Functions:
* - `is_not_found` / `is_already_exists`: classify Kubernetes API errors.
* - `with_finalizer` / `without_finalizer`: compute a new finalizer list, or
*   `None` when nothing would change.
* - `abort_prowjob`: marks a ProwJob aborted unless it already is.
* - `ReconcileResult`: outcome of a reconciliation, mapped to a controller `Action`.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::clients::{Clock, ControlPlane};
use crate::crds::prowjob::{ProwJob, ProwJobState};
use crate::crds::{EphemeralCluster, DEPENDENT_PROWJOB_FINALIZER};
use crate::metrics;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::time::Duration;
use tracing::info;

/// How a reconciliation ended. A zero `requeue_after` means "wait for the
/// next change".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileResult {
    pub requeue_after: Duration,
}

impl ReconcileResult {
    pub fn done() -> Self {
        Self {
            requeue_after: Duration::ZERO,
        }
    }

    pub fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: after,
        }
    }

    pub fn metric_label(&self) -> &'static str {
        if self.requeue_after.is_zero() {
            "ok"
        } else {
            "requeue"
        }
    }

    pub fn into_action(self) -> Action {
        if self.requeue_after.is_zero() {
            Action::await_change()
        } else {
            Action::requeue(self.requeue_after)
        }
    }
}

pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

pub fn has_finalizer(ec: &EphemeralCluster) -> bool {
    ec.finalizers().iter().any(|f| f == DEPENDENT_PROWJOB_FINALIZER)
}

/// The finalizer list with ours appended, or `None` if it is already there.
pub fn with_finalizer(ec: &EphemeralCluster) -> Option<Vec<String>> {
    if has_finalizer(ec) {
        return None;
    }
    let mut finalizers = ec.finalizers().to_vec();
    finalizers.push(DEPENDENT_PROWJOB_FINALIZER.to_string());
    Some(finalizers)
}

/// The finalizer list without ours, or `None` if it was not there.
pub fn without_finalizer(ec: &EphemeralCluster) -> Option<Vec<String>> {
    if !has_finalizer(ec) {
        return None;
    }
    Some(
        ec.finalizers()
            .iter()
            .filter(|f| f.as_str() != DEPENDENT_PROWJOB_FINALIZER)
            .cloned()
            .collect(),
    )
}

/// Aborts `prowjob` with `reason` as its description. A job that is already
/// aborted is left alone. Returns whether an abort was written.
pub async fn abort_prowjob(
    control_plane: &dyn ControlPlane,
    clock: &dyn Clock,
    prowjob: &ProwJob,
    reason: &str,
) -> Result<bool, kube::Error> {
    if prowjob.state() == ProwJobState::Aborted {
        info!(prowjob = %prowjob.name_any(), "ProwJob aborted already, skipping");
        return Ok(false);
    }

    control_plane
        .abort_prowjob(&prowjob.name_any(), reason, clock.now())
        .await?;
    metrics::PROWJOBS_ABORTED_TOTAL
        .with_label_values(&[reason])
        .inc();
    info!(prowjob = %prowjob.name_any(), reason, "ProwJob aborted");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{MockClock, MockControlPlane};
    use crate::crds::prowjob::{ProwJobSpec, ProwJobStatus};
    use chrono::{TimeZone, Utc};

    fn ec_with_finalizers(finalizers: &[&str]) -> EphemeralCluster {
        let mut ec = EphemeralCluster::new("ec", Default::default());
        ec.metadata.finalizers = Some(finalizers.iter().map(|f| f.to_string()).collect());
        ec
    }

    fn prowjob_in(state: &str) -> ProwJob {
        let mut pj = ProwJob::new("pj", ProwJobSpec::default());
        pj.status = Some(ProwJobStatus {
            state: state.to_string(),
            ..Default::default()
        });
        pj
    }

    #[test]
    fn finalizer_edits_are_minimal() {
        let ec = ec_with_finalizers(&["other"]);
        assert_eq!(
            with_finalizer(&ec),
            Some(vec!["other".to_string(), DEPENDENT_PROWJOB_FINALIZER.to_string()])
        );
        assert_eq!(without_finalizer(&ec), None);

        let ec = ec_with_finalizers(&[DEPENDENT_PROWJOB_FINALIZER, "other"]);
        assert_eq!(with_finalizer(&ec), None);
        assert_eq!(without_finalizer(&ec), Some(vec!["other".to_string()]));
    }

    #[test]
    fn zero_requeue_waits_for_change() {
        assert_eq!(ReconcileResult::done().into_action(), Action::await_change());
        assert_eq!(
            ReconcileResult::requeue(Duration::from_secs(3)).into_action(),
            Action::requeue(Duration::from_secs(3))
        );
    }

    #[tokio::test]
    async fn abort_is_skipped_for_aborted_jobs() {
        let mut cp = MockControlPlane::new();
        cp.expect_abort_prowjob().never();
        let clock = MockClock::new();

        let written = abort_prowjob(&cp, &clock, &prowjob_in("aborted"), "EphemeralCluster not found")
            .await
            .unwrap();
        assert!(!written);
    }

    #[tokio::test]
    async fn abort_stamps_completion_time() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let mut clock = MockClock::new();
        clock.expect_now().return_const(now);
        let mut cp = MockControlPlane::new();
        cp.expect_abort_prowjob()
            .withf(move |name, description, at| {
                name == "pj" && description == "Ephemeral Cluster deleted" && *at == now
            })
            .times(1)
            .returning(|_, _, _| Ok(prowjob_in("aborted")));

        let written = abort_prowjob(&cp, &clock, &prowjob_in("pending"), "Ephemeral Cluster deleted")
            .await
            .unwrap();
        assert!(written);
    }
}
