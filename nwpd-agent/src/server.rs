//! Agent composition root and control loop
//!
//! One loop owns the tick clock, the observation queue, config file watch
//! events and the shutdown signals. Everything else runs in tasks spawned
//! from here: job runs, the writer drain loop, the aggregator reports and
//! the metrics endpoint.

use crate::aggregator::{EdgeAggregator, ObservationListener};
use crate::config_manager::{ConfigFiles, ConfigManager};
use crate::error::Result;
use crate::grpc_server::ObservationService;
use crate::job::JobFactory;
use crate::metrics::{serve_metrics, MetricsSink, PrometheusMetrics};
use crate::pipeline::{observation_channel, Dispatcher, ObservationReceiver, ObservationSender};
use crate::registry::JobRegistry;
use crate::runners::DefaultJobFactory;
use notify::{RecursiveMode, Watcher};
use nwpd_common::load_agent_config;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub config_file: PathBuf,
    pub cluster_config_file: PathBuf,
    pub host_network: bool,
    /// Source host of every observation this agent records
    pub node_name: String,
    pub tick_period: Duration,
    /// Directory for aggregation reports
    pub log_dir: PathBuf,
}

impl AgentOptions {
    pub fn new(config_file: impl Into<PathBuf>, cluster_config_file: impl Into<PathBuf>) -> Self {
        Self {
            config_file: config_file.into(),
            cluster_config_file: cluster_config_file.into(),
            host_network: false,
            node_name: node_name(),
            tick_period: DEFAULT_TICK_PERIOD,
            log_dir: PathBuf::from(nwpd_common::PATH_LOG_DIR),
        }
    }
}

/// Node name from the downward API, falling back to the hostname
pub fn node_name() -> String {
    std::env::var("NODE_NAME")
        .or_else(|_| std::env::var("POD_NAME"))
        .or_else(|_| hostname::get().map(|h| h.to_string_lossy().to_string()))
        .unwrap_or_else(|_| "unknown".to_string())
}

pub struct Agent {
    options: AgentOptions,
    manager: Arc<ConfigManager>,
    metrics: Arc<PrometheusMetrics>,
    aggregator: Arc<EdgeAggregator>,
    obs_tx: ObservationSender,
    obs_rx: ObservationReceiver,
    shutdown: CancellationToken,
}

impl Agent {
    /// Build the agent with the built-in probes
    pub async fn setup(options: AgentOptions) -> Result<Self> {
        let factory = Arc::new(DefaultJobFactory::new(options.node_name.clone()));
        Self::setup_with(options, factory).await
    }

    /// Build the agent and apply the initial configuration
    pub async fn setup_with(options: AgentOptions, factory: Arc<dyn JobFactory>) -> Result<Self> {
        let initial = load_agent_config(&options.config_file)?;
        let aggregator = Arc::new(EdgeAggregator::new(
            initial.aggregation_report_period(),
            initial.aggregation_time_window(),
            &options.log_dir,
            options.host_network,
        )?);
        let metrics = Arc::new(PrometheusMetrics::new()?);

        let manager = ConfigManager::new(
            ConfigFiles {
                agent: options.config_file.clone(),
                cluster: options.cluster_config_file.clone(),
            },
            options.host_network,
            JobRegistry::new(),
            factory,
            metrics.clone(),
        )
        .with_aggregator(aggregator.clone());
        manager.initialize().await?;

        let (obs_tx, obs_rx) = observation_channel();
        Ok(Self {
            options,
            manager: Arc::new(manager),
            metrics,
            aggregator,
            obs_tx,
            obs_rx,
            shutdown: CancellationToken::new(),
        })
    }

    /// Cancelling the token makes `run` return
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn manager(&self) -> Arc<ConfigManager> {
        self.manager.clone()
    }

    pub fn service(&self) -> ObservationService {
        ObservationService::new(self.manager.writer())
    }

    /// Run until shutdown, an interrupt or a config watch failure
    pub async fn run(self) -> Result<()> {
        let Agent {
            options,
            manager,
            metrics,
            aggregator,
            obs_tx,
            mut obs_rx,
            shutdown,
        } = self;

        let config = manager.agent_config();
        if let Some(port) = config.network(options.host_network).and_then(|n| n.http_port) {
            serve_metrics(metrics.clone(), port);
        }
        let aggregator_task = tokio::spawn(aggregator.clone().run(shutdown.child_token()));

        let (watch_tx, mut watch_rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            let _ = watch_tx.send(event);
        })?;
        for dir in manager.watched_dirs() {
            watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        }

        let dispatcher = Dispatcher::new(
            manager.subscribe_agent_config(),
            metrics.clone() as Arc<dyn MetricsSink>,
            manager.writer(),
            Some(aggregator.clone() as Arc<dyn ObservationListener>),
        );

        let mut ticker = tokio::time::interval(options.tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let interrupt = interrupted();
        tokio::pin!(interrupt);

        info!(
            node = %options.node_name,
            host_network = options.host_network,
            "agent running"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown requested");
                    break;
                }
                _ = &mut interrupt => {
                    info!("interrupted");
                    break;
                }
                Some(obs) = obs_rx.recv() => dispatcher.dispatch(obs),
                event = watch_rx.recv() => match event {
                    Some(Ok(_)) => {
                        debug!("config watch event");
                        let manager = manager.clone();
                        tokio::spawn(async move {
                            if let Err(e) = manager.reload_config().await {
                                warn!("cannot reload configuration: {}", e);
                            }
                        });
                    }
                    Some(Err(e)) => {
                        warn!("watcher failed: {}", e);
                        break;
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    manager.registry().tick(&obs_tx).await;
                }
            }
        }

        drop(watcher);
        shutdown.cancel();
        if let Some(writer) = manager.writer().get() {
            writer.stop().await;
        }
        let _ = aggregator_task.await;
        info!("agent stopped");
        Ok(())
    }
}

/// Resolves on Ctrl-C or SIGTERM
async fn interrupted() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut term) = signal(SignalKind::terminate()) {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    if res.is_err() {
                        term.recv().await;
                    }
                }
                _ = term.recv() => {}
            }
            return;
        }
    }
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}
