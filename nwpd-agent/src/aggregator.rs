//! Streaming edge aggregator
//!
//! Keeps the recent outcomes of every (src, dest, job) edge inside a sliding
//! time window and periodically reports the edges that saw failures.

use crate::error::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use nwpd_proto::Observation;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consumer of the observation stream
pub trait ObservationListener: Send + Sync {
    fn add(&self, obs: &Observation);

    /// Replace the set of edges the listener keeps state for
    fn update_valid_edges(&self, edges: ValidEdges);
}

/// Job ids and hosts derived from the active job set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidEdges {
    pub job_ids: HashSet<String>,
    pub src_hosts: HashSet<String>,
    pub dest_hosts: HashSet<String>,
}

#[derive(Debug, Clone, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct EdgeKey {
    pub src: String,
    pub dest: String,
    pub job_id: String,
}

#[derive(Debug, Default)]
struct EdgeHistory {
    outcomes: VecDeque<(DateTime<Utc>, bool)>,
}

impl EdgeHistory {
    fn push(&mut self, time: DateTime<Utc>, ok: bool, cutoff: DateTime<Utc>) {
        // runners deliver out of order across jobs, keep the deque sorted
        let pos = self.outcomes.partition_point(|(t, _)| *t <= time);
        self.outcomes.insert(pos, (time, ok));
        self.expire(cutoff);
    }

    fn expire(&mut self, cutoff: DateTime<Utc>) {
        while matches!(self.outcomes.front(), Some((t, _)) if *t < cutoff) {
            self.outcomes.pop_front();
        }
    }
}

/// Summary of one edge within the time window
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EdgeSummary {
    pub src: String,
    pub dest: String,
    pub job_id: String,
    pub ok_count: usize,
    pub failed_count: usize,
    pub last_ok: bool,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationReport {
    pub time: DateTime<Utc>,
    pub host_network: bool,
    pub time_window_seconds: u64,
    pub edges: usize,
    pub unhealthy: Vec<EdgeSummary>,
}

pub struct EdgeAggregator {
    edges: DashMap<EdgeKey, EdgeHistory>,
    valid: RwLock<Option<ValidEdges>>,
    report_period: Duration,
    time_window: Duration,
    report_file: PathBuf,
    host_network: bool,
    events_processed: AtomicU64,
    events_dropped: AtomicU64,
}

impl EdgeAggregator {
    /// Create the aggregator, creating `log_dir` for its reports
    pub fn new(
        report_period: Duration,
        time_window: Duration,
        log_dir: impl AsRef<Path>,
        host_network: bool,
    ) -> Result<Self> {
        let log_dir = log_dir.as_ref();
        std::fs::create_dir_all(log_dir)?;
        let name = if host_network {
            "aggregation-host.json"
        } else {
            "aggregation-pod.json"
        };

        Ok(Self {
            edges: DashMap::new(),
            valid: RwLock::new(None),
            report_period,
            time_window,
            report_file: log_dir.join(name),
            host_network,
            events_processed: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
        })
    }

    pub fn report_file(&self) -> &Path {
        &self.report_file
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed.load(Ordering::Relaxed)
    }

    /// Observations ignored because their job is no longer active
    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let window = chrono::Duration::from_std(self.time_window).unwrap_or(chrono::Duration::MAX);
        now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn accepts(&self, obs: &Observation) -> bool {
        match self.valid.read() {
            Ok(valid) => valid
                .as_ref()
                .map_or(true, |v| v.job_ids.contains(&obs.job_id)),
            Err(_) => true,
        }
    }

    /// Summaries of all edges as of `now`, sorted by edge
    pub fn summarize(&self, now: DateTime<Utc>) -> Vec<EdgeSummary> {
        let cutoff = self.cutoff(now);
        let mut summaries: Vec<EdgeSummary> = self
            .edges
            .iter_mut()
            .filter_map(|mut entry| {
                entry.value_mut().expire(cutoff);
                let (last_seen, last_ok) = *entry.value().outcomes.back()?;
                let ok_count = entry.value().outcomes.iter().filter(|(_, ok)| *ok).count();
                Some(EdgeSummary {
                    src: entry.key().src.clone(),
                    dest: entry.key().dest.clone(),
                    job_id: entry.key().job_id.clone(),
                    ok_count,
                    failed_count: entry.value().outcomes.len() - ok_count,
                    last_ok,
                    last_seen,
                })
            })
            .collect();
        self.edges.retain(|_, history| !history.outcomes.is_empty());

        summaries.sort_by(|a, b| {
            (&a.src, &a.dest, &a.job_id).cmp(&(&b.src, &b.dest, &b.job_id))
        });
        summaries
    }

    /// Build the report for `now`, log unhealthy edges and write it as JSON
    pub async fn report(&self, now: DateTime<Utc>) -> Result<AggregationReport> {
        let summaries = self.summarize(now);
        let edges = summaries.len();
        let unhealthy: Vec<EdgeSummary> = summaries
            .into_iter()
            .filter(|s| s.failed_count > 0)
            .collect();

        for s in &unhealthy {
            warn!(
                src = %s.src,
                dest = %s.dest,
                job_id = %s.job_id,
                ok = s.ok_count,
                failed = s.failed_count,
                "unhealthy edge"
            );
        }
        info!(
            edges,
            unhealthy = unhealthy.len(),
            processed = self.events_processed(),
            "aggregation report"
        );

        let report = AggregationReport {
            time: now,
            host_network: self.host_network,
            time_window_seconds: self.time_window.as_secs(),
            edges,
            unhealthy,
        };
        let json = serde_json::to_vec_pretty(&report)?;
        tokio::fs::write(&self.report_file, json).await?;
        Ok(report)
    }

    /// Report every period until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.report_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("aggregator stopped");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.report(Utc::now()).await {
                        warn!("cannot write aggregation report: {}", e);
                    }
                }
            }
        }
    }
}

impl ObservationListener for EdgeAggregator {
    fn add(&self, obs: &Observation) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
        if !self.accepts(obs) {
            self.events_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let key = EdgeKey {
            src: obs.src_host.clone(),
            dest: obs.dest_host.clone(),
            job_id: obs.job_id.clone(),
        };
        let cutoff = self.cutoff(Utc::now());
        self.edges
            .entry(key)
            .or_default()
            .push(obs.time(), obs.ok, cutoff);
    }

    fn update_valid_edges(&self, edges: ValidEdges) {
        // the src of every edge is this node, so only job and dest are checked
        self.edges.retain(|key, _| {
            edges.job_ids.contains(&key.job_id) && edges.dest_hosts.contains(&key.dest)
        });
        debug!(
            jobs = edges.job_ids.len(),
            dest_hosts = edges.dest_hosts.len(),
            "updated valid edges"
        );
        if let Ok(mut valid) = self.valid.write() {
            *valid = Some(edges);
        }
    }
}
