use crate::cli::{Commands, QueryFilter};
use crate::{CliError, Result};
use chrono::{DateTime, Utc};
use nwpd_proto::time::{from_proto_duration, from_timestamp, to_proto_duration, to_timestamp};
use nwpd_proto::{AgentServiceClient, AggregatedObservation, GetObservationsRequest, Observation};
use std::time::Duration;
use tonic::transport::Channel;
use tracing::{debug, info};

pub async fn handle_command(agent: &str, command: Commands) -> Result<()> {
    let mut client = connect(agent).await?;
    match command {
        Commands::Observations { filter } => {
            let request = build_request(&filter, None, Utc::now());
            let observations = client
                .get_observations(request)
                .await?
                .into_inner()
                .observations;
            print_observations(&observations);
        }
        Commands::Aggregated { filter, window } => {
            let request = build_request(&filter, window, Utc::now());
            let aggregated = client
                .get_aggregated_observations(request)
                .await?
                .into_inner()
                .aggregated_observations;
            print_aggregated(&aggregated);
        }
    }
    Ok(())
}

async fn connect(agent: &str) -> Result<AgentServiceClient<Channel>> {
    let endpoint = format!("http://{}", agent);
    info!("Connecting to agent at {}", endpoint);
    AgentServiceClient::connect(endpoint)
        .await
        .map_err(|e| CliError::Connect {
            agent: agent.to_string(),
            reason: e.to_string(),
        })
}

/// Translate command line filters into a query
pub fn build_request(
    filter: &QueryFilter,
    window: Option<Duration>,
    now: DateTime<Utc>,
) -> GetObservationsRequest {
    let start = filter
        .since
        .and_then(|since| chrono::Duration::from_std(since).ok())
        .and_then(|since| now.checked_sub_signed(since))
        .map(to_timestamp);
    debug!(?start, "query start");

    GetObservationsRequest {
        limit: filter.limit.max(0),
        restrict_to_job_ids: filter.job.clone(),
        restrict_to_src_hosts: filter.src.clone(),
        restrict_to_dest_hosts: filter.dest.clone(),
        failures_only: filter.failures_only,
        start,
        end: None,
        aggregation_window: window.map(to_proto_duration),
    }
}

fn print_observations(observations: &[Observation]) {
    if observations.is_empty() {
        println!("No observations found.");
        return;
    }

    println!(
        "{:<24} {:<20} {:<20} {:<16} {:<4} {:>9}  {}",
        "TIME", "SOURCE", "DESTINATION", "JOB", "OK", "DURATION", "RESULT"
    );
    println!("{}", "-".repeat(120));

    for obs in observations {
        println!(
            "{:<24} {:<20} {:<20} {:<16} {:<4} {:>9}  {}",
            obs.time().format("%Y-%m-%d %H:%M:%S%.3f"),
            truncate(&obs.src_host, 20),
            truncate(&obs.dest_host, 20),
            truncate(&obs.job_id, 16),
            if obs.ok { "ok" } else { "FAIL" },
            obs.latency().map(format_latency).unwrap_or_default(),
            obs.result
        );
    }
}

fn print_aggregated(aggregated: &[AggregatedObservation]) {
    if aggregated.is_empty() {
        println!("No observations found.");
        return;
    }

    println!(
        "{:<20} {:<20} {:<20} {}",
        "WINDOW START", "SOURCE", "DESTINATION", "JOBS"
    );
    println!("{}", "-".repeat(100));

    for aggr in aggregated {
        let start = aggr
            .period_start
            .as_ref()
            .map(|t| from_timestamp(t).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        println!(
            "{:<20} {:<20} {:<20} {}",
            start,
            truncate(&aggr.src_host, 20),
            truncate(&aggr.dest_host, 20),
            format_jobs(aggr)
        );
    }
}

/// `job ok=N fail=M mean=X` per job, sorted by job id
pub fn format_jobs(aggr: &AggregatedObservation) -> String {
    let mut jobs: Vec<&String> = aggr
        .jobs_ok_count
        .keys()
        .chain(aggr.jobs_not_ok_count.keys())
        .collect();
    jobs.sort();
    jobs.dedup();

    jobs.into_iter()
        .map(|job| {
            let ok = aggr.jobs_ok_count.get(job).copied().unwrap_or(0);
            let failed = aggr.jobs_not_ok_count.get(job).copied().unwrap_or(0);
            match aggr.mean_ok_duration.get(job) {
                Some(mean) => format!(
                    "{} ok={} fail={} mean={}",
                    job,
                    ok,
                    failed,
                    format_latency(from_proto_duration(mean))
                ),
                None => format!("{} ok={} fail={}", job, ok, failed),
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_latency(d: Duration) -> String {
    if d < Duration::from_millis(1) {
        format!("{}us", d.as_micros())
    } else if d < Duration::from_secs(1) {
        format!("{:.1}ms", d.as_secs_f64() * 1000.0)
    } else {
        format!("{:.2}s", d.as_secs_f64())
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    #[test]
    fn test_build_request() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let filter = QueryFilter {
            job: vec!["j1".into()],
            dest: vec!["node-b".into()],
            failures_only: true,
            since: Some(Duration::from_secs(1800)),
            limit: 50,
            ..Default::default()
        };

        let request = build_request(&filter, Some(Duration::from_secs(300)), now);
        assert_eq!(request.limit, 50);
        assert_eq!(request.restrict_to_job_ids, vec!["j1"]);
        assert!(request.restrict_to_src_hosts.is_empty());
        assert!(request.failures_only);
        assert_eq!(
            from_timestamp(request.start.as_ref().unwrap()),
            Utc.with_ymd_and_hms(2024, 5, 1, 11, 30, 0).unwrap()
        );
        assert!(request.end.is_none());
        assert_eq!(
            from_proto_duration(request.aggregation_window.as_ref().unwrap()),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn test_format_jobs() {
        let aggr = AggregatedObservation {
            jobs_ok_count: HashMap::from([("b".to_string(), 2), ("a".to_string(), 1)]),
            jobs_not_ok_count: HashMap::from([("b".to_string(), 1)]),
            mean_ok_duration: HashMap::from([(
                "b".to_string(),
                to_proto_duration(Duration::from_millis(12)),
            )]),
            ..Default::default()
        };
        assert_eq!(
            format_jobs(&aggr),
            "a ok=1 fail=0, b ok=2 fail=1 mean=12.0ms"
        );
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("node-a", 20), "node-a");
        assert_eq!(truncate("a-very-long-node-name", 10), "a-very-...");
    }
}
