/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/main.rs
*
* Main entry point for the ephemeral-cluster operator. It sets up and runs
* the two reconciliation loops, plus the endpoint exposing their metrics.
*
* Architecture:
* 1.  **Configuration**: flags and environment variables are parsed into an
*     `OperatorConfig`. With `--print-crd` the EphemeralCluster CRD is printed
*     as YAML and the process exits.
* 2.  **Initialization**: `tracing` is set up for JSON logs, exported to a
*     Jaeger agent when one is configured. The control-plane client comes from
*     the in-cluster or default kubeconfig; one client per build cluster is
*     built from the build clusters kubeconfig.
* 3.  **Controllers**:
*     - EphemeralCluster: drives every cluster through its lifecycle.
*     - ProwJob: aborts labeled jobs whose EphemeralCluster is gone.
*     Both run with a concurrency of one.
* 4.  **Concurrent Execution**: the controllers and the metrics server run
*     together under `tokio::join!` until a termination signal arrives.
*
* SPDX-License-Identifier: Apache-2.0
*/

use anyhow::{Context as _, Result};
use clap::Parser;
use ephemeral_cluster_operator::clients::{KubeControlPlane, SystemClock};
use ephemeral_cluster_operator::cluster_router::ClusterRouter;
use ephemeral_cluster_operator::config::OperatorConfig;
use ephemeral_cluster_operator::controllers::synthesizer::{PresubmitGenerator, Synthesizer};
use ephemeral_cluster_operator::controllers::{ephemeralcluster_controller, prowjob_controller};
use ephemeral_cluster_operator::crds::prowjob::ProwJob;
use ephemeral_cluster_operator::crds::{EphemeralCluster, EPHEMERAL_CLUSTER_LABEL};
use ephemeral_cluster_operator::metrics;
use futures::stream::StreamExt;
use kube::{Api, Client, CustomResourceExt};
use kube_runtime::{controller, watcher, Controller};
use opentelemetry::global;
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use warp::Filter;

/// Initializes logging, and the OpenTelemetry pipeline when a Jaeger agent is set.
fn init_telemetry(jaeger_agent: Option<&str>) -> Result<()> {
    let telemetry = match jaeger_agent {
        Some(endpoint) => {
            let tracer = opentelemetry_jaeger::new_agent_pipeline()
                .with_endpoint(endpoint)
                .with_service_name("ephemeral-cluster-operator")
                .install_batch(opentelemetry_sdk::runtime::Tokio)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().json();

    tracing_subscriber::registry()
        .with(filter)
        .with(telemetry)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

/// Renders the metrics into the Prometheus text format.
async fn metrics_handler(registry: Arc<Registry>) -> Result<impl warp::Reply, warp::Rejection> {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return Err(warp::reject::reject());
    }

    Ok(warp::reply::with_header(
        String::from_utf8_lossy(&buffer).into_owned(),
        "Content-Type",
        encoder.format_type(),
    ))
}

/// Runs the HTTP server exposing /metrics until a termination signal arrives.
async fn run_metrics_server(registry: Arc<Registry>, port: u16) {
    let metrics_route = warp::path("metrics")
        .and(warp::get())
        .and(warp::any().map(move || Arc::clone(&registry)))
        .and_then(metrics_handler);

    info!(port, "Starting metrics server");
    let (_, server) = warp::serve(metrics_route).bind_with_graceful_shutdown(([0, 0, 0, 0], port), async {
        let _ = tokio::signal::ctrl_c().await;
    });
    server.await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = OperatorConfig::parse();

    if config.print_crd {
        print!("{}", serde_yaml::to_string(&EphemeralCluster::crd())?);
        return Ok(());
    }

    init_telemetry(config.jaeger_agent.as_deref())?;
    info!("Telemetry initialized.");

    let client = Client::try_default()
        .await
        .context("Failed to create the control-plane client")?;

    let kubeconfig = config
        .build_clusters_kubeconfig
        .as_deref()
        .context("--build-clusters-kubeconfig is required")?;
    let router = Arc::new(ClusterRouter::from_kubeconfig(kubeconfig).await?);

    let control_plane = Arc::new(KubeControlPlane::new(
        client.clone(),
        &config.ephemeral_cluster_namespace,
        &config.prowjob_namespace,
    ));
    let clock = Arc::new(SystemClock);

    let synthesizer = Synthesizer::new(
        Arc::new(PresubmitGenerator {
            ci_operator_image: config.ci_operator_image.clone(),
        }),
        config.cli_image.clone(),
        config.prowjob_namespace.clone(),
        config.default_cluster.clone(),
    );

    let ec_context = Arc::new(ephemeralcluster_controller::Context {
        control_plane: control_plane.clone(),
        router,
        synthesizer,
        clock: clock.clone(),
        polling: config.polling_interval,
    });
    let pj_context = Arc::new(prowjob_controller::Context {
        control_plane,
        clock,
        polling: config.polling_interval,
    });

    let registry = Arc::new(metrics::create_and_register_metrics()?);
    info!("Custom metrics registered.");

    let ephemeral_clusters =
        Api::<EphemeralCluster>::namespaced(client.clone(), &config.ephemeral_cluster_namespace);
    let prowjobs = Api::<ProwJob>::namespaced(client, &config.prowjob_namespace);

    info!(
        ephemeral_cluster_namespace = %config.ephemeral_cluster_namespace,
        prowjob_namespace = %config.prowjob_namespace,
        polling_interval = ?config.polling_interval,
        "EphemeralCluster operator starting..."
    );

    tokio::join!(
        run_metrics_server(registry, config.metrics_port),
        Controller::new(ephemeral_clusters, watcher::Config::default())
            .with_config(controller::Config::default().concurrency(1))
            .shutdown_on_signal()
            .run(
                ephemeralcluster_controller::reconcile,
                ephemeralcluster_controller::on_error,
                ec_context,
            )
            .for_each(|res| async move {
                match res {
                    Ok(o) => info!("Reconciled EphemeralCluster: {:?}", o),
                    Err(e) => error!("EphemeralCluster reconcile error: {}", e),
                }
            }),
        Controller::new(prowjobs, watcher::Config::default().labels(EPHEMERAL_CLUSTER_LABEL))
            .with_config(controller::Config::default().concurrency(1))
            .shutdown_on_signal()
            .run(prowjob_controller::reconcile, prowjob_controller::on_error, pj_context)
            .for_each(|res| async move {
                match res {
                    Ok(o) => info!("Reconciled ProwJob: {:?}", o),
                    Err(e) => error!("ProwJob reconcile error: {}", e),
                }
            }),
    );

    info!("EphemeralCluster operator shutting down.");
    global::shutdown_tracer_provider();
    Ok(())
}
