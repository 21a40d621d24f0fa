//! Reconcile loop and health endpoint.
//!
//! One serial reconcile per tick: snapshot, aggregate, decide, act. Nothing
//! survives a tick except configuration and the API clients, so the loop
//! needs no locks. A failed tick is logged and the next tick is the retry;
//! pod creations and deletions complete before the next tick starts, which
//! keeps the pending-placeholder accounting accurate.

use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, info};
use tokio::net::TcpListener;

use crate::api::ApiClient;
use crate::config::ScalerConfig;
use crate::scaler::decision::{ScalePlan, ScalePolicy};
use crate::scaler::metrics::aggregate;
use crate::scaler::placeholder::PlaceholderPods;
use crate::scaler::scaledown::plan_scale_down;
use crate::scaler::snapshot::SnapshotCollector;

/// Run the autoscaler until the process is stopped.
pub async fn run(config: ScalerConfig) -> Result<()> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.api_port))
        .await
        .with_context(|| format!("binding health listener on port {}", config.api_port))?;
    info!("health endpoint listening on port {}", config.api_port);
    tokio::spawn(serve_health(listener));

    let autoscaler = Autoscaler::new(&config).await?;
    info!(
        "autoscaler reconciling region {} every {:?}",
        config.region_id, config.tick_interval
    );

    let mut ticker = tokio::time::interval(config.tick_interval);
    loop {
        ticker.tick().await;
        if let Err(err) = autoscaler.reconcile().await {
            error!("reconcile failed, retrying next tick: {err:#}");
        }
    }
}

struct Autoscaler {
    policy: ScalePolicy,
    collector: SnapshotCollector,
    placeholders: PlaceholderPods,
}

impl Autoscaler {
    async fn new(config: &ScalerConfig) -> Result<Self> {
        let api = ApiClient::new(&config.daytona_api_url, &config.daytona_api_key);
        let client = kube::Client::try_default()
            .await
            .context("building Kubernetes client")?;
        Ok(Self {
            policy: ScalePolicy {
                max_utilization_percent: config.max_resource_utilization_percent,
                min_idle_runners: config.min_idle_runners,
                min_idle_cpu: config.min_idle_cpu,
                min_idle_memory: config.min_idle_memory,
            },
            collector: SnapshotCollector::new(
                api,
                client.clone(),
                &config.provider_namespace,
                &config.region_id,
            ),
            placeholders: PlaceholderPods::new(client, &config.provider_namespace),
        })
    }

    async fn reconcile(&self) -> Result<()> {
        let state = self.collector.snapshot().await?;
        let metrics = aggregate(&state);
        let pending: Vec<String> = state
            .pending_placeholders()
            .map(|p| p.name.clone())
            .collect();

        info!(
            "pool: cpu {:.2}/{:.2} mem {:.2}/{:.2} idle_runners={} nascent={} pending_placeholders={}",
            metrics.total_allocated_cpu,
            metrics.total_cpu_capacity,
            metrics.total_allocated_memory,
            metrics.total_memory_capacity,
            metrics.idle_runners,
            metrics.nascent_nodes,
            pending.len(),
        );

        let plan = ScalePlan::evaluate(&metrics, pending.len(), &self.policy);
        if plan.scale_up {
            if plan.pods_to_create > 0 {
                info!(
                    "scaling up: {} node(s) needed, creating {} placeholder pod(s)",
                    plan.nodes_needed, plan.pods_to_create
                );
                self.placeholders.create_batch(plan.pods_to_create).await;
            } else {
                info!(
                    "scale-up deficit of {} node(s) absorbed by {} pending placeholder(s)",
                    plan.nodes_needed,
                    pending.len()
                );
            }
            // Scale-up owns this tick.
            return Ok(());
        }

        if !pending.is_empty() {
            info!(
                "scale-up no longer justified, deleting {} pending placeholder(s)",
                pending.len()
            );
            self.placeholders.delete_batch(&pending).await;
        }

        let victims = plan_scale_down(&state, &metrics, &self.policy);
        if !victims.is_empty() {
            self.placeholders.delete_batch(&victims).await;
        }
        Ok(())
    }
}

/// Liveness is independent of the loop's forward progress; platform probes
/// handle stalls.
async fn serve_health(listener: TcpListener) {
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(err) => {
                debug!("health accept error: {err}");
                continue;
            }
        };
        let io = TokioIo::new(stream);
        tokio::task::spawn(async move {
            let service = service_fn(|req: Request<Incoming>| async move {
                let response = match (req.method(), req.uri().path()) {
                    (&Method::GET, "/healthz") => Response::builder()
                        .status(StatusCode::OK)
                        .body(Full::new(Bytes::from_static(b"OK"))),
                    _ => Response::builder()
                        .status(StatusCode::NOT_FOUND)
                        .body(Full::new(Bytes::new())),
                };
                response.map_err(anyhow::Error::from)
            });
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                debug!("health connection error: {err:?}");
            }
        });
    }
}
