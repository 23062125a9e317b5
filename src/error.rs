/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/error.rs
*
* Error taxonomy shared by both reconcilers.
*
* Only Kubernetes API failures met mid-reconciliation are retryable: the
* reconcilers turn them into a plain requeue after the polling interval.
* Everything else is terminal and surfaces to the controller's error policy,
* which logs it and waits for the next change to the object.
*
* SPDX-License-Identifier: Apache-2.0
*/

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("failed to get EphemeralCluster {name}: {source}")]
    FetchError {
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("unknown cluster {0}")]
    UnknownCluster(String),

    #[error("parse pull request meta: {0}")]
    PrEventError(String),

    #[error("generate prowjob: {0}")]
    SynthesisError(String),

    #[error("too many ProwJobs associated with EphemeralCluster {name}: found {count}")]
    TooManyProwJobs { name: String, count: usize },

    #[error("ProwJob {0} has no ci.openshift.io/ephemeral-cluster label")]
    MissingNameLabel(String),

    #[error("{}", join_messages(.0))]
    Aggregate(Vec<Error>),
}

fn join_messages(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Terminal errors are not worth retrying on a timer: they need the object
    /// (or the operator's configuration) to change first.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Error::KubeError(_))
    }

    /// Combines a terminal error with a failure to record it in status.
    pub fn aggregate(cause: Error, status_write: Error) -> Error {
        Error::Aggregate(vec![cause, status_write])
    }

    /// Short label used for the reconcile metrics.
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube_error",
            Error::FetchError { .. } => "fetch_error",
            Error::UnknownCluster(_) => "unknown_cluster",
            Error::PrEventError(_) => "pr_event_error",
            Error::SynthesisError(_) => "synthesis_error",
            Error::TooManyProwJobs { .. } => "too_many_prowjobs",
            Error::MissingNameLabel(_) => "missing_name_label",
            Error::Aggregate(_) => "aggregate",
        }
    }
}
