//! Built-in probe runners and the default job factory
//!
//! Job args are a command line. The first element selects the probe, the
//! rest are its flags:
//!
//! ```text
//! checkTCPPort --node-port 10250 --period 30s
//! checkTCPPort --endpoints api:10.0.0.1:443,db:10.0.0.2:5432
//! checkTCPPort --endpoint-kube-apiserver
//! ```

use crate::error::{AgentError, Result};
use crate::job::{Job, JobFactory, Runner};
use crate::pipeline::ObservationSender;
use async_trait::async_trait;
use chrono::Utc;
use clap::Parser;
use nwpd_common::duration::parse_duration;
use nwpd_common::{ClusterConfig, Endpoint, JobConfig};
use nwpd_proto::Observation;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

pub const CMD_CHECK_TCP_PORT: &str = "checkTCPPort";

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = CMD_CHECK_TCP_PORT, disable_help_flag = true)]
struct CheckTcpPortArgs {
    /// Endpoints as hostname:ip:port
    #[arg(long, value_delimiter = ',')]
    endpoints: Vec<String>,

    /// Port to probe on every cluster node
    #[arg(long)]
    node_port: Option<u16>,

    #[arg(long)]
    endpoint_internal_kube_apiserver: bool,

    #[arg(long)]
    endpoint_kube_apiserver: bool,

    #[arg(long, value_parser = parse_duration)]
    period: Option<Duration>,
}

/// One host to connect to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpTarget {
    pub hostname: String,
    pub ip: String,
    pub port: u16,
}

impl From<&Endpoint> for TcpTarget {
    fn from(e: &Endpoint) -> Self {
        Self {
            hostname: e.hostname.clone(),
            ip: e.ip.clone(),
            port: e.port,
        }
    }
}

fn parse_endpoint(s: &str) -> std::result::Result<TcpTarget, String> {
    let parts: Vec<&str> = s.split(':').collect();
    let [hostname, ip, port] = parts.as_slice() else {
        return Err(format!("invalid endpoint {}, expected hostname:ip:port", s));
    };
    let port = port
        .parse::<u16>()
        .map_err(|e| format!("invalid port in endpoint {}: {}", s, e))?;
    Ok(TcpTarget {
        hostname: hostname.to_string(),
        ip: ip.to_string(),
        port,
    })
}

/// Connects to every target once per run
pub struct TcpPortRunner {
    src_host: String,
    targets: Vec<TcpTarget>,
    timeout: Duration,
}

impl TcpPortRunner {
    pub fn new(src_host: impl Into<String>, targets: Vec<TcpTarget>, timeout: Duration) -> Self {
        Self {
            src_host: src_host.into(),
            targets,
            timeout,
        }
    }

    async fn check(&self, target: &TcpTarget) -> (bool, Duration, String) {
        let addr = format!("{}:{}", target.ip, target.port);
        let start = Instant::now();
        match tokio::time::timeout(self.timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(_stream)) => (true, start.elapsed(), format!("connected to {}", addr)),
            Ok(Err(e)) => (false, start.elapsed(), format!("cannot connect to {}: {}", addr, e)),
            Err(_) => (
                false,
                start.elapsed(),
                format!("timeout connecting to {} after {:?}", addr, self.timeout),
            ),
        }
    }
}

#[async_trait]
impl Runner for TcpPortRunner {
    async fn run(&self, job_id: &str, out: &ObservationSender) {
        for target in &self.targets {
            let (ok, elapsed, result) = self.check(target).await;
            let obs = Observation::new(
                self.src_host.as_str(),
                target.hostname.as_str(),
                job_id,
                ok,
                ok.then_some(elapsed),
                Utc::now(),
                result,
            );
            if out.send(Arc::new(obs)).await.is_err() {
                debug!(job_id, "observation queue closed");
                return;
            }
        }
    }

    fn dest_hosts(&self) -> Vec<String> {
        self.targets.iter().map(|t| t.hostname.clone()).collect()
    }

    fn description(&self) -> String {
        format!("{} endpoints", self.targets.len())
    }
}

/// Builds jobs for the built-in probes
pub struct DefaultJobFactory {
    src_host: String,
    timeout: Duration,
}

impl DefaultJobFactory {
    pub fn new(src_host: impl Into<String>) -> Self {
        Self {
            src_host: src_host.into(),
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    fn tcp_targets(
        &self,
        cluster: &ClusterConfig,
        descriptor: &JobConfig,
        args: &CheckTcpPortArgs,
    ) -> Result<Vec<TcpTarget>> {
        let mut targets = Vec::new();
        for endpoint in &args.endpoints {
            targets.push(
                parse_endpoint(endpoint)
                    .map_err(|reason| AgentError::invalid_job(&descriptor.job_id, reason))?,
            );
        }
        if let Some(port) = args.node_port {
            targets.extend(cluster.nodes.iter().map(|n| TcpTarget {
                hostname: n.hostname.clone(),
                ip: n.internal_ip.clone(),
                port,
            }));
        }
        if args.endpoint_internal_kube_apiserver {
            targets.extend(cluster.internal_kube_api_server.iter().map(TcpTarget::from));
        }
        if args.endpoint_kube_apiserver {
            targets.extend(cluster.kube_api_server.iter().map(TcpTarget::from));
        }
        Ok(targets)
    }
}

impl JobFactory for DefaultJobFactory {
    fn build(
        &self,
        cluster: &ClusterConfig,
        descriptor: &JobConfig,
        default_period: Duration,
    ) -> Result<Option<Job>> {
        let Some(command) = descriptor.args.first() else {
            return Err(AgentError::invalid_job(&descriptor.job_id, "no job args"));
        };

        match command.as_str() {
            CMD_CHECK_TCP_PORT => {
                let args = CheckTcpPortArgs::try_parse_from(&descriptor.args).map_err(|e| {
                    AgentError::invalid_job(&descriptor.job_id, e.to_string().trim_end())
                })?;
                let targets = self.tcp_targets(cluster, descriptor, &args)?;
                if targets.is_empty() {
                    return Ok(None);
                }
                let period = args
                    .period
                    .filter(|p| !p.is_zero())
                    .unwrap_or(default_period);
                let runner = TcpPortRunner::new(self.src_host.clone(), targets, self.timeout);
                Ok(Some(Job::new(descriptor.clone(), period, Arc::new(runner))))
            }
            other => Err(AgentError::invalid_job(
                &descriptor.job_id,
                format!("unknown command {}", other),
            )),
        }
    }
}
