//! Periodic probe jobs
//!
//! A `Job` pairs a job descriptor with a `Runner` and its scheduling state.
//! Each job decides on its own whether a registry tick is due for it; a due
//! job spawns its runner and does not start again until that run finished.

use crate::error::Result;
use crate::pipeline::ObservationSender;
use async_trait::async_trait;
use nwpd_common::{ClusterConfig, JobConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub type JobId = String;

/// Executes one probe pass for a job
#[async_trait]
pub trait Runner: Send + Sync {
    /// Probe every target once, sending one observation per target.
    /// Sending waits while the observation queue is full.
    async fn run(&self, job_id: &str, out: &ObservationSender);

    /// Hosts this runner probes
    fn dest_hosts(&self) -> Vec<String>;

    fn description(&self) -> String {
        String::new()
    }
}

/// Builds executable jobs from job descriptors
pub trait JobFactory: Send + Sync {
    /// Returns `Ok(None)` for a job that is valid but has nothing to do
    /// with the current cluster configuration.
    fn build(
        &self,
        cluster: &ClusterConfig,
        descriptor: &JobConfig,
        default_period: Duration,
    ) -> Result<Option<Job>>;
}

pub struct Job {
    config: JobConfig,
    period: Duration,
    runner: Arc<dyn Runner>,
    last_run: Option<Instant>,
    active: Arc<AtomicBool>,
}

impl Job {
    pub fn new(config: JobConfig, period: Duration, runner: Arc<dyn Runner>) -> Self {
        Self {
            config,
            period,
            runner,
            last_run: None,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.config.job_id
    }

    pub fn args(&self) -> &[String] {
        &self.config.args
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn description(&self) -> String {
        self.runner.description()
    }

    pub fn dest_hosts(&self) -> Vec<String> {
        self.runner.dest_hosts()
    }

    pub fn last_run(&self) -> Option<Instant> {
        self.last_run
    }

    pub fn set_last_run(&mut self, last_run: Option<Instant>) {
        self.last_run = last_run;
    }

    /// Whether a run spawned by this job (or the job it replaced) is in flight
    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Take over the scheduling state of the job this one replaces
    pub(crate) fn inherit_schedule(&mut self, previous: &Job) {
        self.last_run = previous.last_run;
        self.active = previous.active.clone();
    }

    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_run {
            Some(last) => now >= last + self.period,
            None => true,
        }
    }

    /// Start a run if one is due. Returns true when a run was started.
    pub fn tick(&mut self, now: Instant, out: &ObservationSender) -> bool {
        if self.is_running() || !self.is_due(now) {
            return false;
        }
        self.last_run = Some(now);
        self.active.store(true, Ordering::Release);

        let runner = self.runner.clone();
        let guard = ActiveGuard(self.active.clone());
        let job_id = self.config.job_id.clone();
        let out = out.clone();
        tokio::spawn(async move {
            let _guard = guard;
            runner.run(&job_id, &out).await;
        });
        true
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("job_id", &self.config.job_id)
            .field("args", &self.config.args)
            .field("period", &self.period)
            .field("last_run", &self.last_run)
            .finish()
    }
}

/// Clears the in-flight flag when a run ends, including by panic
struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    fn fake_job(period: Duration) -> (Job, Arc<AtomicUsize>) {
        let runner = FakeRunner::new(&["node-b"]);
        let runs = runner.runs.clone();
        let job = Job::new(job_config("j1", &["fake", "node-b"]), period, Arc::new(runner));
        (job, runs)
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_respects_period() {
        let (tx, mut rx) = mpsc::channel(10);
        let (mut job, runs) = fake_job(Duration::from_secs(10));

        assert!(job.tick(Instant::now(), &tx));
        let obs = rx.recv().await.unwrap();
        assert_eq!(obs.job_id, "j1");
        assert_eq!(obs.dest_host, "node-b");
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!job.tick(Instant::now(), &tx));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(job.tick(Instant::now(), &tx));
        rx.recv().await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_overlapping_runs() {
        // capacity 1 and nobody draining: the first run blocks on its second send
        let runner = FakeRunner::new(&["a", "b"]);
        let mut job = Job::new(
            job_config("j1", &["fake"]),
            Duration::from_millis(100),
            Arc::new(runner),
        );
        let (tx, mut rx) = mpsc::channel(1);

        assert!(job.tick(Instant::now(), &tx));
        tokio::task::yield_now().await;
        assert!(job.is_running());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!job.tick(Instant::now(), &tx));

        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!job.is_running());
        assert!(job.tick(Instant::now(), &tx));
    }
}
