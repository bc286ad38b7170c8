//! Observation pipeline
//!
//! Runners push observations into one bounded queue. The agent loop drains
//! it and hands every observation to the `Dispatcher`, which fans it out to
//! the log, the metrics sink, the storage writer and the streaming
//! aggregator. A full queue makes runners wait instead of dropping results.

use crate::aggregator::ObservationListener;
use crate::metrics::MetricsSink;
use crate::writer::SharedWriter;
use nwpd_common::AgentConfig;
use nwpd_proto::Observation;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::info;

/// Capacity of the observation queue between runners and the dispatch loop
pub const OBSERVATION_QUEUE_CAPACITY: usize = 100;

pub type ObservationSender = mpsc::Sender<Arc<Observation>>;
pub type ObservationReceiver = mpsc::Receiver<Arc<Observation>>;

pub fn observation_channel() -> (ObservationSender, ObservationReceiver) {
    mpsc::channel(OBSERVATION_QUEUE_CAPACITY)
}

/// Routes observations to every configured consumer
pub struct Dispatcher {
    config: watch::Receiver<Arc<AgentConfig>>,
    metrics: Arc<dyn MetricsSink>,
    writer: SharedWriter,
    aggregator: Option<Arc<dyn ObservationListener>>,
}

impl Dispatcher {
    pub fn new(
        config: watch::Receiver<Arc<AgentConfig>>,
        metrics: Arc<dyn MetricsSink>,
        writer: SharedWriter,
        aggregator: Option<Arc<dyn ObservationListener>>,
    ) -> Self {
        Self {
            config,
            metrics,
            writer,
            aggregator,
        }
    }

    pub fn dispatch(&self, obs: Arc<Observation>) {
        let log_observations = self.config.borrow().log_observations;
        if log_observations {
            info!(
                src = %obs.src_host,
                dest = %obs.dest_host,
                ok = obs.ok,
                jobid = %obs.job_id,
                time = %obs.time(),
                "{}",
                obs.result
            );
        }

        self.metrics.observe(
            &obs.src_host,
            &obs.dest_host,
            &obs.job_id,
            obs.ok,
            obs.latency().filter(|_| obs.ok),
        );

        if let Some(writer) = self.writer.get() {
            writer.add(obs.clone());
        }
        if let Some(aggregator) = &self.aggregator {
            aggregator.add(&obs);
        }
    }
}
