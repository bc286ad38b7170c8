//! Configuration loading and job reconciliation
//!
//! The manager owns the active agent and cluster config snapshots and keeps
//! the job registry in line with them. Reconciliation is all or nothing:
//! every job descriptor is built before anything is touched, so a bad
//! descriptor leaves the registry and the snapshots as they were.

use crate::aggregator::{ObservationListener, ValidEdges};
use crate::error::Result;
use crate::job::{Job, JobFactory};
use crate::metrics::{schedule_eviction, MetricsSink, EVICTION_DELAY};
use crate::registry::JobRegistry;
use crate::writer::{FileObservationWriter, ObservationWriter, SharedWriter};
use nwpd_common::{load_agent_config, load_cluster_config, AgentConfig, ClusterConfig};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

/// Paths of the two configuration files
#[derive(Debug, Clone)]
pub struct ConfigFiles {
    pub agent: PathBuf,
    pub cluster: PathBuf,
}

pub struct ConfigManager {
    files: ConfigFiles,
    host_network: bool,
    registry: JobRegistry,
    factory: Arc<dyn JobFactory>,
    metrics: Arc<dyn MetricsSink>,
    aggregator: Option<Arc<dyn ObservationListener>>,
    writer: SharedWriter,
    agent_config: watch::Sender<Arc<AgentConfig>>,
    cluster_config: watch::Sender<Arc<ClusterConfig>>,
    reload_lock: Mutex<()>,
    eviction_delay: Duration,
}

impl ConfigManager {
    pub fn new(
        files: ConfigFiles,
        host_network: bool,
        registry: JobRegistry,
        factory: Arc<dyn JobFactory>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let (agent_config, _) = watch::channel(Arc::new(AgentConfig::default()));
        let (cluster_config, _) = watch::channel(Arc::new(ClusterConfig::default()));
        Self {
            files,
            host_network,
            registry,
            factory,
            metrics,
            aggregator: None,
            writer: SharedWriter::default(),
            agent_config,
            cluster_config,
            reload_lock: Mutex::new(()),
            eviction_delay: EVICTION_DELAY,
        }
    }

    pub fn with_aggregator(mut self, aggregator: Arc<dyn ObservationListener>) -> Self {
        self.aggregator = Some(aggregator);
        self
    }

    pub fn with_eviction_delay(mut self, delay: Duration) -> Self {
        self.eviction_delay = delay;
        self
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn writer(&self) -> SharedWriter {
        self.writer.clone()
    }

    /// Active agent config snapshot
    pub fn agent_config(&self) -> Arc<AgentConfig> {
        self.agent_config.borrow().clone()
    }

    /// Active cluster config snapshot
    pub fn cluster_config(&self) -> Arc<ClusterConfig> {
        self.cluster_config.borrow().clone()
    }

    pub fn subscribe_agent_config(&self) -> watch::Receiver<Arc<AgentConfig>> {
        self.agent_config.subscribe()
    }

    /// Directories to watch for config changes
    pub fn watched_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = Vec::new();
        for file in [&self.files.agent, &self.files.cluster] {
            let dir = match file.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => PathBuf::from("."),
            };
            if !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }
        dirs
    }

    /// Load both config files and apply them. Any failure is fatal to startup.
    pub async fn initialize(&self) -> Result<()> {
        let _guard = self.reload_lock.lock().await;
        let cluster = load_cluster_config(&self.files.cluster)?;
        let agent = load_agent_config(&self.files.agent)?;
        self.reconcile(agent, Some(cluster)).await
    }

    /// Apply a new agent config against the active cluster config
    pub async fn apply_agent_config(&self, config: AgentConfig) -> Result<()> {
        let _guard = self.reload_lock.lock().await;
        self.reconcile(config, None).await
    }

    /// Reload both files. Returns `Ok(false)` when neither changed.
    pub async fn reload_config(&self) -> Result<bool> {
        let _guard = self.reload_lock.lock().await;

        let agent = load_agent_config(&self.files.agent)?;
        let cluster = load_cluster_config(&self.files.cluster)?;
        let changed =
            **self.agent_config.borrow() != agent || **self.cluster_config.borrow() != cluster;
        if !changed {
            debug!("no reload needed");
            return Ok(false);
        }

        info!(
            "reloaded configuration from {} and {}",
            self.files.agent.display(),
            self.files.cluster.display()
        );
        self.reconcile(agent, Some(cluster)).await?;
        info!("configuration applied");
        Ok(true)
    }

    async fn reconcile(&self, config: AgentConfig, cluster: Option<ClusterConfig>) -> Result<()> {
        let previous_ids: HashSet<String> = self
            .agent_config
            .borrow()
            .jobs(self.host_network)
            .iter()
            .map(|j| j.job_id.clone())
            .collect();
        let cluster = match cluster {
            Some(cluster) => Arc::new(cluster),
            None => self.cluster_config(),
        };

        let (jobs, skipped) = self.build_jobs(&config, &cluster)?;
        let applied: HashSet<String> = config
            .jobs(self.host_network)
            .iter()
            .map(|j| j.job_id.clone())
            .collect();
        let valid_dest_hosts: HashSet<String> = jobs.iter().flat_map(Job::dest_hosts).collect();

        if self.writer.get().is_none() {
            if let Some(writer) = self.create_writer(&config)? {
                if self.writer.set(writer.clone()).is_ok() {
                    tokio::spawn(async move { writer.run().await });
                }
            }
        }

        self.cluster_config.send_replace(cluster);
        self.agent_config.send_replace(Arc::new(config));

        for job in jobs {
            self.registry.add_or_replace(job).await;
        }

        let obsolete: HashSet<String> = previous_ids.difference(&applied).cloned().collect();
        for job_id in &obsolete {
            self.registry.delete(job_id).await;
        }
        // skipped jobs stop running but their ids stay valid
        for job_id in &skipped {
            self.registry.delete(job_id).await;
        }

        schedule_eviction(
            self.metrics.clone(),
            obsolete,
            valid_dest_hosts.clone(),
            self.eviction_delay,
        );

        if let Some(aggregator) = &self.aggregator {
            aggregator.update_valid_edges(ValidEdges {
                job_ids: applied,
                src_hosts: valid_dest_hosts.clone(),
                dest_hosts: valid_dest_hosts,
            });
        }
        Ok(())
    }

    /// Build every descriptor, returning the runnable jobs and the ids of skipped ones
    fn build_jobs(
        &self,
        config: &AgentConfig,
        cluster: &ClusterConfig,
    ) -> Result<(Vec<Job>, Vec<String>)> {
        let default_period = config
            .network(self.host_network)
            .map(|n| n.default_period())
            .unwrap_or(nwpd_common::DEFAULT_JOB_PERIOD);

        let mut jobs = Vec::new();
        let mut skipped = Vec::new();
        for descriptor in config.jobs(self.host_network) {
            match self.factory.build(cluster, descriptor, default_period)? {
                Some(job) => jobs.push(job),
                None => {
                    debug!(job_id = %descriptor.job_id, "job has no targets, skipped");
                    skipped.push(descriptor.job_id.clone());
                }
            }
        }
        Ok((jobs, skipped))
    }

    fn create_writer(&self, config: &AgentConfig) -> Result<Option<Arc<dyn ObservationWriter>>> {
        let Some(dir) = config.output_dir.as_deref() else {
            return Ok(None);
        };
        let prefix = config
            .network(self.host_network)
            .map(|n| n.data_file_prefix())
            .unwrap_or(nwpd_common::DEFAULT_DATA_FILE_PREFIX);
        let writer = FileObservationWriter::new(dir, prefix, config.retention_hours())?;
        Ok(Some(Arc::new(writer)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::testing::{job_config, FakeJobFactory};
    use crate::metrics::testing::RecordingMetrics;
    use nwpd_common::{JobConfig, NetworkConfig};
    use nwpd_proto::Observation;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingListener {
        updates: std::sync::Mutex<Vec<ValidEdges>>,
    }

    impl ObservationListener for RecordingListener {
        fn add(&self, _obs: &Observation) {}

        fn update_valid_edges(&self, edges: ValidEdges) {
            self.updates.lock().unwrap().push(edges);
        }
    }

    struct Fixture {
        dir: TempDir,
        manager: ConfigManager,
        metrics: Arc<RecordingMetrics>,
        listener: Arc<RecordingListener>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let metrics = Arc::new(RecordingMetrics::default());
        let listener = Arc::new(RecordingListener::default());
        let manager = ConfigManager::new(
            ConfigFiles {
                agent: dir.path().join("agent.yaml"),
                cluster: dir.path().join("cluster.yaml"),
            },
            false,
            JobRegistry::new(),
            Arc::new(FakeJobFactory),
            metrics.clone(),
        )
        .with_aggregator(listener.clone());
        Fixture {
            dir,
            manager,
            metrics,
            listener,
        }
    }

    fn config(jobs: Vec<JobConfig>) -> AgentConfig {
        AgentConfig {
            pod_network: Some(NetworkConfig {
                jobs,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_diff_adds_and_deletes() {
        let f = fixture();
        f.manager
            .apply_agent_config(config(vec![
                job_config("j1", &["fake", "node-b"]),
                job_config("j2", &["fake", "node-c"]),
            ]))
            .await
            .unwrap();
        assert_eq!(f.manager.registry().job_ids().await, vec!["j1", "j2"]);

        f.manager
            .apply_agent_config(config(vec![
                job_config("j2", &["fake", "node-c"]),
                job_config("j3", &["fake", "node-d"]),
            ]))
            .await
            .unwrap();
        assert_eq!(f.manager.registry().job_ids().await, vec!["j2", "j3"]);

        let evicted = f.metrics.evicted_jobs.lock().unwrap();
        assert_eq!(evicted.last(), Some(&set(&["j1"])));
        let hosts = f.metrics.evicted_hosts.lock().unwrap();
        assert_eq!(hosts.last(), Some(&set(&["node-c", "node-d"])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reapply_keeps_job_schedule() {
        let f = fixture();
        let cfg = config(vec![job_config("j1", &["fake", "node-b"])]);
        f.manager.apply_agent_config(cfg.clone()).await.unwrap();
        let last_run = f.manager.registry().last_run("j1").await;

        tokio::time::advance(Duration::from_secs(2)).await;
        f.manager.apply_agent_config(cfg.clone()).await.unwrap();

        assert_eq!(f.manager.registry().job_ids().await, vec!["j1"]);
        assert_eq!(f.manager.registry().last_run("j1").await, last_run);
        assert_eq!(*f.manager.agent_config(), cfg);
    }

    #[tokio::test]
    async fn test_invalid_job_changes_nothing() {
        let f = fixture();
        let good = config(vec![job_config("j1", &["fake", "node-b"])]);
        f.manager.apply_agent_config(good.clone()).await.unwrap();

        let err = f
            .manager
            .apply_agent_config(config(vec![
                job_config("j2", &["fake", "node-c"]),
                job_config("bad", &["invalid"]),
            ]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad"));

        assert_eq!(f.manager.registry().job_ids().await, vec!["j1"]);
        assert_eq!(*f.manager.agent_config(), good);
        assert_eq!(f.listener.updates.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_skipped_job_is_not_registered() {
        let f = fixture();
        f.manager
            .apply_agent_config(config(vec![
                job_config("j1", &["fake", "node-b"]),
                job_config("j2", &["skip"]),
            ]))
            .await
            .unwrap();
        assert_eq!(f.manager.registry().job_ids().await, vec!["j1"]);
    }

    #[tokio::test]
    async fn test_skipped_job_is_not_obsolete() {
        let f = fixture();
        f.manager
            .apply_agent_config(config(vec![
                job_config("j1", &["fake", "node-b"]),
                job_config("j2", &["fake", "node-c"]),
            ]))
            .await
            .unwrap();

        f.manager
            .apply_agent_config(config(vec![
                job_config("j1", &["fake", "node-b"]),
                job_config("j2", &["skip"]),
            ]))
            .await
            .unwrap();

        assert_eq!(f.manager.registry().job_ids().await, vec!["j1"]);
        let evicted = f.metrics.evicted_jobs.lock().unwrap();
        assert_eq!(evicted.last(), Some(&HashSet::new()));
        let updates = f.listener.updates.lock().unwrap();
        assert_eq!(updates.last().unwrap().job_ids, set(&["j1", "j2"]));
    }

    #[tokio::test]
    async fn test_aggregator_gets_valid_edges() {
        let f = fixture();
        f.manager
            .apply_agent_config(config(vec![
                job_config("j1", &["fake", "node-b", "node-c"]),
                job_config("j2", &["fake", "node-d"]),
            ]))
            .await
            .unwrap();

        let updates = f.listener.updates.lock().unwrap();
        let edges = updates.last().unwrap();
        assert_eq!(edges.job_ids, set(&["j1", "j2"]));
        assert_eq!(edges.dest_hosts, set(&["node-b", "node-c", "node-d"]));
    }

    #[tokio::test]
    async fn test_writer_created_once() {
        let f = fixture();
        assert!(f.manager.writer().get().is_none());

        let mut cfg = config(vec![]);
        cfg.output_dir = Some(f.dir.path().join("data"));
        f.manager.apply_agent_config(cfg.clone()).await.unwrap();
        let first = f.manager.writer().get().cloned().unwrap();
        assert!(f.dir.path().join("data").is_dir());

        cfg.output_dir = Some(f.dir.path().join("other"));
        f.manager.apply_agent_config(cfg).await.unwrap();
        let second = f.manager.writer().get().cloned().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!f.dir.path().join("other").exists());

        first.stop().await;
    }

    #[tokio::test]
    async fn test_reload_only_on_change() {
        let f = fixture();
        let agent_file = f.dir.path().join("agent.yaml");
        std::fs::write(
            &agent_file,
            "podNetwork:\n  jobs:\n    - jobID: j1\n      args: [fake, node-b]\n",
        )
        .unwrap();
        std::fs::write(f.dir.path().join("cluster.yaml"), "nodeCount: 1\n").unwrap();

        f.manager.initialize().await.unwrap();
        assert_eq!(f.manager.cluster_config().node_count, 1);
        assert!(!f.manager.reload_config().await.unwrap());

        std::fs::write(
            &agent_file,
            "podNetwork:\n  jobs:\n    - jobID: j2\n      args: [fake, node-b]\n",
        )
        .unwrap();
        assert!(f.manager.reload_config().await.unwrap());
        assert_eq!(f.manager.registry().job_ids().await, vec!["j2"]);
        assert!(!f.manager.reload_config().await.unwrap());
    }

    #[tokio::test]
    async fn test_unreadable_reload_keeps_snapshot() {
        let f = fixture();
        let agent_file = f.dir.path().join("agent.yaml");
        std::fs::write(
            &agent_file,
            "podNetwork:\n  jobs:\n    - jobID: j1\n      args: [fake, node-b]\n",
        )
        .unwrap();
        std::fs::write(f.dir.path().join("cluster.yaml"), "nodeCount: 1\n").unwrap();
        f.manager.initialize().await.unwrap();

        std::fs::write(&agent_file, "podNetwork: [not, a, map]\n").unwrap();
        assert!(f.manager.reload_config().await.is_err());
        assert_eq!(f.manager.registry().job_ids().await, vec!["j1"]);
        assert_eq!(f.manager.agent_config().jobs(false).len(), 1);
    }

    #[test]
    fn test_watched_dirs_deduplicated() {
        let f = fixture();
        assert_eq!(f.manager.watched_dirs(), vec![f.dir.path().to_path_buf()]);
    }
}
