//! Live set of jobs keyed by job id

use crate::job::{Job, JobId};
use crate::pipeline::ObservationSender;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::info;

#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<Mutex<HashMap<JobId, Job>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job, replacing the job with the same id.
    ///
    /// A replacement continues the schedule of the job it replaces. A new job
    /// gets a random virtual last run within one period, spreading the first
    /// runs of jobs started together.
    pub async fn add_or_replace(&self, mut job: Job) {
        let mut jobs = self.jobs.lock().await;

        let prefix = match jobs.get(job.job_id()) {
            Some(previous) => {
                job.inherit_schedule(previous);
                "restarting"
            }
            None => {
                let now = Instant::now();
                let offset = job.period().mul_f64(rand::random::<f64>());
                job.set_last_run(Some(now.checked_sub(offset).unwrap_or(now)));
                "starting"
            }
        };
        log_start(&job, prefix);
        jobs.insert(job.job_id().to_string(), job);
    }

    /// Remove a job. Unknown ids are ignored.
    pub async fn delete(&self, job_id: &str) {
        let mut jobs = self.jobs.lock().await;
        if jobs.remove(job_id).is_some() {
            info!("deleted job {}", job_id);
        }
    }

    /// Let every job start a run if it is due. Returns the number of runs started.
    pub async fn tick(&self, out: &ObservationSender) -> usize {
        let mut jobs = self.jobs.lock().await;
        let now = Instant::now();
        let mut started = 0;
        for job in jobs.values_mut() {
            if job.tick(now, out) {
                started += 1;
            }
        }
        started
    }

    pub async fn job_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.jobs.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn last_run(&self, job_id: &str) -> Option<Instant> {
        self.jobs.lock().await.get(job_id).and_then(Job::last_run)
    }

    pub async fn period(&self, job_id: &str) -> Option<std::time::Duration> {
        self.jobs.lock().await.get(job_id).map(Job::period)
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }
}

fn log_start(job: &Job, prefix: &str) {
    let mut desc = job.description();
    if !desc.is_empty() {
        desc.push_str(", ");
    }
    info!(
        "{} job {}: {} [{}period={:.1}s]",
        prefix,
        job.job_id(),
        job.args().join(" "),
        desc,
        job.period().as_secs_f64()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::testing::{job_config, FakeRunner};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn job(id: &str, period: Duration) -> Job {
        Job::new(
            job_config(id, &["fake", "node-b"]),
            period,
            Arc::new(FakeRunner::new(&["node-b"])),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_job_last_run_within_one_period() {
        let registry = JobRegistry::new();
        let period = Duration::from_secs(10);

        for i in 0..20 {
            let id = format!("j{}", i);
            let before = Instant::now();
            registry.add_or_replace(job(&id, period)).await;
            let last_run = registry.last_run(&id).await.unwrap();
            assert!(last_run <= before);
            assert!(last_run > before - period);
        }
        assert_eq!(registry.len().await, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_keeps_last_run() {
        let registry = JobRegistry::new();
        registry.add_or_replace(job("j1", Duration::from_secs(10))).await;
        let first = registry.last_run("j1").await;

        tokio::time::advance(Duration::from_secs(3)).await;
        registry.add_or_replace(job("j1", Duration::from_secs(20))).await;

        assert_eq!(registry.last_run("j1").await, first);
        assert_eq!(registry.period("j1").await, Some(Duration::from_secs(20)));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let registry = JobRegistry::new();
        registry.add_or_replace(job("j1", Duration::from_secs(1))).await;

        registry.delete("unknown").await;
        assert_eq!(registry.job_ids().await, vec!["j1"]);

        registry.delete("j1").await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_runs_due_jobs() {
        let registry = JobRegistry::new();
        registry.add_or_replace(job("j1", Duration::from_secs(5))).await;
        registry.add_or_replace(job("j2", Duration::from_secs(5))).await;
        let (tx, mut rx) = mpsc::channel(10);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(registry.tick(&tx).await, 2);

        let mut seen = vec![
            rx.recv().await.unwrap().job_id.clone(),
            rx.recv().await.unwrap().job_id.clone(),
        ];
        seen.sort();
        assert_eq!(seen, vec!["j1", "j2"]);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(registry.tick(&tx).await, 0);
    }
}
