//! Prometheus metrics for observations
//!
//! Series are keyed by (src, dest, jobid). The sink remembers every label set
//! it created so series of removed jobs or hosts can be evicted explicitly.

use crate::error::Result;
use axum::{routing::get, Router};
use dashmap::DashSet;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Second eviction pass, after probes that were in flight have reported
pub const EVICTION_DELAY: Duration = Duration::from_secs(60);

pub trait MetricsSink: Send + Sync {
    fn observe(&self, src: &str, dest: &str, job_id: &str, ok: bool, latency: Option<Duration>);

    /// Drop every series of the given jobs
    fn evict_job_ids(&self, job_ids: &HashSet<String>);

    /// Drop every series whose destination is not in `valid_hosts`
    fn evict_invalid_dest_hosts(&self, valid_hosts: &HashSet<String>);
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SeriesKey {
    src: String,
    dest: String,
    job_id: String,
}

pub struct PrometheusMetrics {
    registry: Registry,
    observations: IntCounterVec,
    latency: HistogramVec,
    series: DashSet<SeriesKey>,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let observations = IntCounterVec::new(
            Opts::new(
                "nwpd_aggregated_observations_total",
                "Number of observations by edge, job and status",
            ),
            &["src", "dest", "jobid", "status"],
        )?;
        let latency = HistogramVec::new(
            HistogramOpts::new(
                "nwpd_aggregated_observation_latency_seconds",
                "Latency of successful observations",
            )
            .buckets(vec![
                0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
            ]),
            &["src", "dest", "jobid"],
        )?;

        registry.register(Box::new(observations.clone()))?;
        registry.register(Box::new(latency.clone()))?;

        Ok(Self {
            registry,
            observations,
            latency,
            series: DashSet::new(),
        })
    }

    /// Number of (src, dest, jobid) series currently exported
    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    /// Prometheus text exposition of all metrics
    pub fn render(&self) -> String {
        match TextEncoder::new().encode_to_string(&self.registry.gather()) {
            Ok(text) => text,
            Err(e) => {
                warn!("cannot encode metrics: {}", e);
                String::new()
            }
        }
    }

    fn evict_where(&self, evict: impl Fn(&SeriesKey) -> bool) {
        let stale: Vec<SeriesKey> = self
            .series
            .iter()
            .filter(|key| evict(key))
            .map(|key| key.clone())
            .collect();

        for key in stale {
            let (src, dest, job_id) = (key.src.as_str(), key.dest.as_str(), key.job_id.as_str());
            for status in ["ok", "failed"] {
                let _ = self
                    .observations
                    .remove_label_values(&[src, dest, job_id, status]);
            }
            let _ = self.latency.remove_label_values(&[src, dest, job_id]);
            debug!(
                src = %key.src,
                dest = %key.dest,
                job_id = %key.job_id,
                "evicted metric series"
            );
            self.series.remove(&key);
        }
    }
}

impl MetricsSink for PrometheusMetrics {
    fn observe(&self, src: &str, dest: &str, job_id: &str, ok: bool, latency: Option<Duration>) {
        let status = if ok { "ok" } else { "failed" };
        self.observations
            .with_label_values(&[src, dest, job_id, status])
            .inc();
        if let Some(latency) = latency {
            self.latency
                .with_label_values(&[src, dest, job_id])
                .observe(latency.as_secs_f64());
        }
        self.series.insert(SeriesKey {
            src: src.to_string(),
            dest: dest.to_string(),
            job_id: job_id.to_string(),
        });
    }

    fn evict_job_ids(&self, job_ids: &HashSet<String>) {
        if job_ids.is_empty() {
            return;
        }
        self.evict_where(|key| job_ids.contains(&key.job_id));
    }

    fn evict_invalid_dest_hosts(&self, valid_hosts: &HashSet<String>) {
        self.evict_where(|key| !valid_hosts.contains(&key.dest));
    }
}

/// Evict stale series now and once more after `delay`.
/// The delayed pass is not cancelled on shutdown.
pub fn schedule_eviction(
    metrics: Arc<dyn MetricsSink>,
    obsolete_job_ids: HashSet<String>,
    valid_dest_hosts: HashSet<String>,
    delay: Duration,
) -> JoinHandle<()> {
    metrics.evict_job_ids(&obsolete_job_ids);
    metrics.evict_invalid_dest_hosts(&valid_dest_hosts);

    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        metrics.evict_job_ids(&obsolete_job_ids);
        metrics.evict_invalid_dest_hosts(&valid_dest_hosts);
    })
}

/// Serve `/metrics` on the given port in a detached task.
/// Failures are logged and never reach the caller.
pub fn serve_metrics(metrics: Arc<PrometheusMetrics>, port: u16) -> JoinHandle<()> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let metrics = metrics.clone();
            async move { metrics.render() }
        }),
    );

    tokio::spawn(async move {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("cannot listen for metrics on {}: {}", addr, e);
                return;
            }
        };
        info!("provide metrics at ':{}/metrics'", port);
        if let Err(e) = axum::serve(listener, app).await {
            warn!("metrics server failed: {}", e);
        }
    })
}
