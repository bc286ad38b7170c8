//! Query-time aggregation of observations into fixed-width windows

use chrono::{DateTime, Utc};
use nwpd_proto::time::{to_proto_duration, to_timestamp};
use nwpd_proto::{AggregatedObservation, Observation};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

pub const DEFAULT_AGGREGATION_WINDOW: Duration = Duration::from_secs(60);

/// Requested widths at or below this are ignored
pub const MIN_AGGREGATION_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Edge {
    pub src: String,
    pub dest: String,
}

/// Window width for a request
pub fn aggregation_window(requested: Option<Duration>) -> Duration {
    match requested {
        Some(width) if width > MIN_AGGREGATION_WINDOW => width,
        _ => DEFAULT_AGGREGATION_WINDOW,
    }
}

#[derive(Default)]
struct EdgeWindow {
    ok: HashMap<String, i32>,
    not_ok: HashMap<String, i32>,
    total_ok_duration: HashMap<String, Duration>,
}

impl EdgeWindow {
    fn add(&mut self, obs: &Observation) {
        if obs.ok {
            *self.ok.entry(obs.job_id.clone()).or_default() += 1;
            if let Some(latency) = obs.latency() {
                *self.total_ok_duration.entry(obs.job_id.clone()).or_default() += latency;
            }
        } else {
            *self.not_ok.entry(obs.job_id.clone()).or_default() += 1;
        }
    }

    fn finish(self, edge: Edge, start: DateTime<Utc>, end: DateTime<Utc>) -> AggregatedObservation {
        let mean_ok_duration = self
            .total_ok_duration
            .into_iter()
            .filter_map(|(job_id, total)| {
                let count = *self.ok.get(&job_id)?;
                let count = u32::try_from(count).ok().filter(|c| *c > 0)?;
                Some((job_id, to_proto_duration(total / count)))
            })
            .collect();

        AggregatedObservation {
            src_host: edge.src,
            dest_host: edge.dest,
            period_start: Some(to_timestamp(start)),
            period_end: Some(to_timestamp(end)),
            jobs_ok_count: self.ok,
            jobs_not_ok_count: self.not_ok,
            mean_ok_duration,
        }
    }
}

/// Bucket observations (sorted by timestamp) into consecutive windows of
/// `width` per edge. The first window starts at `start`, or at the first
/// observation when no start is given. Windows without observations for an
/// edge produce nothing for it.
pub fn aggregate_observations(
    observations: &[Observation],
    start: Option<DateTime<Utc>>,
    width: Duration,
) -> Vec<AggregatedObservation> {
    let Some(first) = observations.first() else {
        return Vec::new();
    };
    let Ok(delta) = chrono::Duration::from_std(width) else {
        return Vec::new();
    };
    if delta <= chrono::Duration::zero() {
        return Vec::new();
    }

    let mut window_start = start.unwrap_or_else(|| first.time());
    let mut window_end = window_start + delta;
    let mut current: BTreeMap<Edge, EdgeWindow> = BTreeMap::new();
    let mut aggregated = Vec::new();

    for obs in observations {
        let time = obs.time();
        while time >= window_end {
            flush(&mut current, window_start, window_end, &mut aggregated);
            window_start = window_end;
            window_end = window_start + delta;
        }

        let edge = Edge {
            src: obs.src_host.clone(),
            dest: obs.dest_host.clone(),
        };
        current.entry(edge).or_default().add(obs);
    }
    flush(&mut current, window_start, window_end, &mut aggregated);

    aggregated
}

fn flush(
    current: &mut BTreeMap<Edge, EdgeWindow>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    out: &mut Vec<AggregatedObservation>,
) {
    out.extend(
        std::mem::take(current)
            .into_iter()
            .map(|(edge, window)| window.finish(edge, start, end)),
    );
}
