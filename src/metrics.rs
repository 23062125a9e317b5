/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/metrics.rs
*
* This module defines the custom Prometheus metrics that the operator exposes.
* They describe how often each reconciler runs, how it ends, and how many
* ProwJobs the operator creates and aborts.
*
* Using `lazy_static`, the metrics are created only once and shared by both
* reconciliation loops and the metrics server.
*
* SPDX-License-Identifier: Apache-2.0
*/

use lazy_static::lazy_static;
use prometheus::{opts, IntCounter, IntCounterVec, Registry};

// --- Metric Definitions ---

lazy_static! {
    /// Reconciliations, labeled by controller and outcome (`ok`, `requeue` or an error label).
    pub static ref RECONCILE_TOTAL: IntCounterVec = IntCounterVec::new(
        opts!(
            "ephemeralcluster_reconcile_total",
            "Total number of reconciliations."
        ),
        &["controller", "result"]
    )
    .expect("valid metric definition");

    pub static ref PROWJOBS_CREATED_TOTAL: IntCounter = IntCounter::with_opts(opts!(
        "ephemeralcluster_prowjobs_created_total",
        "Total number of ProwJobs created for EphemeralClusters."
    ))
    .expect("valid metric definition");

    /// Aborted ProwJobs, labeled by the reason written into the job's description.
    pub static ref PROWJOBS_ABORTED_TOTAL: IntCounterVec = IntCounterVec::new(
        opts!(
            "ephemeralcluster_prowjobs_aborted_total",
            "Total number of ProwJobs aborted by the operator."
        ),
        &["reason"]
    )
    .expect("valid metric definition");

    pub static ref PHASE_TRANSITIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        opts!(
            "ephemeralcluster_phase_transitions_total",
            "Total number of EphemeralCluster phase transitions, by target phase."
        ),
        &["phase"]
    )
    .expect("valid metric definition");
}

/// Creates a new Prometheus registry and registers all custom metrics.
///
/// This function is intended to be called once at operator startup.
pub fn create_and_register_metrics() -> Result<Registry, prometheus::Error> {
    let r = Registry::new();
    r.register(Box::new(RECONCILE_TOTAL.clone()))?;
    r.register(Box::new(PROWJOBS_CREATED_TOTAL.clone()))?;
    r.register(Box::new(PROWJOBS_ABORTED_TOTAL.clone()))?;
    r.register(Box::new(PHASE_TRANSITIONS_TOTAL.clone()))?;
    Ok(r)
}

pub fn record_reconcile(controller: &str, result: &str) {
    RECONCILE_TOTAL.with_label_values(&[controller, result]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_exposes_all_metrics() {
        record_reconcile("ephemeralcluster", "ok");
        PROWJOBS_CREATED_TOTAL.inc();
        PROWJOBS_ABORTED_TOTAL.with_label_values(&["EphemeralCluster not found"]).inc();
        PHASE_TRANSITIONS_TOTAL.with_label_values(&["Ready"]).inc();

        let registry = create_and_register_metrics().unwrap();
        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|mf| mf.get_name().to_string())
            .collect();

        for expected in [
            "ephemeralcluster_reconcile_total",
            "ephemeralcluster_prowjobs_created_total",
            "ephemeralcluster_prowjobs_aborted_total",
            "ephemeralcluster_phase_transitions_total",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }
}
