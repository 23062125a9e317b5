/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/config.rs
*
* Operator configuration, declared with `clap`'s derive API. Every flag can
* also be supplied through an environment variable, which is how the operator
* is configured when it runs as a Deployment.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::crds::ImageStreamTagReference;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Provisions ephemeral test clusters by driving ProwJobs.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct OperatorConfig {
    /// Namespace holding the ProwJobs.
    #[arg(long, env = "PROWJOB_NAMESPACE", default_value = "ci")]
    pub prowjob_namespace: String,

    /// The only namespace whose EphemeralClusters are reconciled.
    #[arg(long, env = "EPHEMERAL_CLUSTER_NAMESPACE", default_value = "ephemeral-cluster")]
    pub ephemeral_cluster_namespace: String,

    /// Kubeconfig with one context per build cluster, named after the cluster.
    #[arg(long, env = "BUILD_CLUSTERS_KUBECONFIG", required_unless_present = "print_crd")]
    pub build_clusters_kubeconfig: Option<PathBuf>,

    /// How often a pending EphemeralCluster is looked at again, e.g. `3s`, `1m`.
    #[arg(long, env = "POLLING_INTERVAL", default_value = "3s", value_parser = parse_duration_str)]
    pub polling_interval: Duration,

    /// `namespace/name:tag` of the image providing `oc` to the wait step when
    /// a cluster is claimed.
    #[arg(long, env = "CLI_IMAGE", default_value = "ocp/4.22:cli", value_parser = parse_image_stream_tag)]
    pub cli_image: ImageStreamTagReference,

    /// Image of the ci-operator container run by the ProwJob.
    #[arg(long, env = "CI_OPERATOR_IMAGE", default_value = "ci-operator:latest")]
    pub ci_operator_image: String,

    /// Build cluster written into new ProwJobs until the dispatcher picks one.
    #[arg(long, env = "DEFAULT_CLUSTER", default_value = "build01")]
    pub default_cluster: String,

    #[arg(long, env = "METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,

    /// Jaeger agent endpoint, e.g. `jaeger-agent:6831`. Tracing export is off when unset.
    #[arg(long = "jaeger-agent", env = "JAEGER_AGENT_ENDPOINT")]
    pub jaeger_agent: Option<String>,

    /// Print the EphemeralCluster CRD as YAML and exit.
    #[arg(long)]
    pub print_crd: bool,
}

/// Parses a `<n>s`, `<n>m` or `<n>h` interval.
pub fn parse_duration_str(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let invalid = || format!("invalid interval '{}'", s);
    if let Some(num_str) = s.strip_suffix('s') {
        let secs = num_str.parse::<u64>().map_err(|_| invalid())?;
        Ok(Duration::from_secs(secs))
    } else if let Some(num_str) = s.strip_suffix('m') {
        let mins = num_str.parse::<u64>().map_err(|_| invalid())?;
        Ok(Duration::from_secs(mins * 60))
    } else if let Some(num_str) = s.strip_suffix('h') {
        let hours = num_str.parse::<u64>().map_err(|_| invalid())?;
        Ok(Duration::from_secs(hours * 3600))
    } else {
        Err(invalid())
    }
}

/// Parses `namespace/name:tag`. All three parts must be non-empty.
pub fn parse_image_stream_tag(s: &str) -> Result<ImageStreamTagReference, String> {
    let invalid = || format!("invalid image stream tag '{}', expected namespace/name:tag", s);
    let (namespace, rest) = s.split_once('/').ok_or_else(invalid)?;
    let (name, tag) = rest.rsplit_once(':').ok_or_else(invalid)?;
    if [namespace, name, tag]
        .iter()
        .any(|p| p.is_empty() || p.contains('/') || p.contains(':'))
    {
        return Err(invalid());
    }
    Ok(ImageStreamTagReference {
        namespace: namespace.to_string(),
        name: name.to_string(),
        tag: tag.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_intervals() {
        assert_eq!(parse_duration_str("3s").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration_str("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration_str(" 2h ").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration_str("3").is_err());
        assert!(parse_duration_str("xs").is_err());
    }

    #[test]
    fn parses_cli_image() {
        let istag = parse_image_stream_tag("ocp/4.18:cli").unwrap();
        assert_eq!(istag.namespace, "ocp");
        assert_eq!(istag.name, "4.18");
        assert_eq!(istag.tag, "cli");

        for bad in ["ocp/4.18", "4.18:cli", "/4.18:cli", "ocp/:cli", "ocp/4.18:", "a/b/c:d"] {
            assert!(parse_image_stream_tag(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn defaults_apply() {
        let cfg = OperatorConfig::try_parse_from([
            "ephemeral_cluster_operator",
            "--build-clusters-kubeconfig",
            "/etc/build-clusters/kubeconfig",
        ])
        .unwrap();
        assert_eq!(cfg.prowjob_namespace, "ci");
        assert_eq!(cfg.ephemeral_cluster_namespace, "ephemeral-cluster");
        assert_eq!(cfg.polling_interval, Duration::from_secs(3));
        assert_eq!(cfg.default_cluster, "build01");
        assert_eq!(cfg.cli_image.tag, "cli");
        assert!(cfg.jaeger_agent.is_none());
    }

    #[test]
    fn kubeconfig_optional_only_when_printing_crd() {
        assert!(OperatorConfig::try_parse_from(["ephemeral_cluster_operator", "--print-crd"]).is_ok());
        assert!(OperatorConfig::try_parse_from(["ephemeral_cluster_operator"]).is_err());
    }
}
