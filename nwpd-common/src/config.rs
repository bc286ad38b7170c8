//! Agent and cluster configuration
//!
//! Both files are YAML documents. A loaded config is treated as an immutable
//! snapshot: a reload builds a new value and the agent swaps it in wholesale.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Agent configuration shared by the host network and pod network agents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Directory for observation files. No writer is created when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_hours: Option<u32>,
    #[serde(default)]
    pub log_observations: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation_report_period_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation_time_window_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_network: Option<NetworkConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_network: Option<NetworkConfig>,
}

/// Jobs and settings for one network mode
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_file_prefix: Option<String>,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
    #[serde(
        default,
        with = "crate::duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub default_period: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
}

/// A job descriptor: identifier plus the probe command line
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(rename = "jobID")]
    pub job_id: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl AgentConfig {
    /// Network config for the given mode, if configured
    pub fn network(&self, host_network: bool) -> Option<&NetworkConfig> {
        if host_network {
            self.host_network.as_ref()
        } else {
            self.pod_network.as_ref()
        }
    }

    /// Job descriptors for the given mode (empty when the mode is not configured)
    pub fn jobs(&self, host_network: bool) -> &[JobConfig] {
        self.network(host_network)
            .map(|n| n.jobs.as_slice())
            .unwrap_or(&[])
    }

    pub fn aggregation_report_period(&self) -> Duration {
        self.aggregation_report_period_seconds
            .map(Duration::from_secs)
            .unwrap_or(crate::DEFAULT_AGGREGATION_REPORT_PERIOD)
    }

    pub fn aggregation_time_window(&self) -> Duration {
        self.aggregation_time_window_seconds
            .map(Duration::from_secs)
            .unwrap_or(crate::DEFAULT_AGGREGATION_TIME_WINDOW)
    }

    pub fn retention_hours(&self) -> u32 {
        self.retention_hours
            .unwrap_or(crate::DEFAULT_RETENTION_HOURS)
    }

    /// Reject configs that would break the one-job-per-id invariant
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.aggregation_report_period_seconds == Some(0) {
            return Err(ConfigError::Invalid(
                "aggregationReportPeriodSeconds must be positive".to_string(),
            ));
        }
        if self.aggregation_time_window_seconds == Some(0) {
            return Err(ConfigError::Invalid(
                "aggregationTimeWindowSeconds must be positive".to_string(),
            ));
        }
        for (mode, network) in [("hostNetwork", &self.host_network), ("podNetwork", &self.pod_network)] {
            let Some(network) = network else { continue };
            let mut seen = HashSet::new();
            for job in &network.jobs {
                if job.job_id.is_empty() {
                    return Err(ConfigError::Invalid(format!("{}: job without jobID", mode)));
                }
                if !seen.insert(job.job_id.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "{}: duplicate jobID {}",
                        mode, job.job_id
                    )));
                }
            }
        }
        Ok(())
    }
}

impl NetworkConfig {
    pub fn default_period(&self) -> Duration {
        match self.default_period {
            Some(d) if !d.is_zero() => d,
            _ => crate::DEFAULT_JOB_PERIOD,
        }
    }

    pub fn data_file_prefix(&self) -> &str {
        match self.data_file_prefix.as_deref() {
            Some(p) if !p.is_empty() => p,
            _ => crate::DEFAULT_DATA_FILE_PREFIX,
        }
    }
}

/// Cluster topology as seen by the agents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    #[serde(default)]
    pub node_count: usize,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub pod_endpoints: Vec<PodEndpoint>,
    #[serde(
        default,
        rename = "internalKubeAPIServer",
        skip_serializing_if = "Option::is_none"
    )]
    pub internal_kube_api_server: Option<Endpoint>,
    #[serde(
        default,
        rename = "kubeAPIServer",
        skip_serializing_if = "Option::is_none"
    )]
    pub kube_api_server: Option<Endpoint>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub hostname: String,
    #[serde(rename = "internalIP")]
    pub internal_ip: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodEndpoint {
    pub nodename: String,
    pub podname: String,
    #[serde(rename = "podIP")]
    pub pod_ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub hostname: String,
    pub ip: String,
    pub port: u16,
}

/// Load and validate the agent configuration file
pub fn load_agent_config(path: impl AsRef<Path>) -> Result<AgentConfig, ConfigError> {
    let config: AgentConfig = load_yaml(path.as_ref())?;
    config.validate()?;
    Ok(config)
}

/// Load the cluster configuration file
pub fn load_cluster_config(path: impl AsRef<Path>) -> Result<ClusterConfig, ConfigError> {
    load_yaml(path.as_ref())
}

fn load_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const AGENT_YAML: &str = r#"
outputDir: /var/lib/nwpd
retentionHours: 2
logObservations: true
aggregationReportPeriodSeconds: 30
hostNetwork:
  dataFilePrefix: nodes
  defaultPeriod: 10s
  httpPort: 8881
  jobs:
    - jobID: tcp-n2api-ext
      args: ["checkTCPPort", "--endpoint-kube-apiserver"]
    - jobID: tcp-n2n
      args: ["checkTCPPort", "--node-port", "10250", "--period", "30s"]
podNetwork:
  jobs: []
"#;

    fn write_file(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_load_agent_config() {
        let f = write_file(AGENT_YAML);
        let cfg = load_agent_config(f.path()).unwrap();

        assert_eq!(cfg.output_dir, Some(PathBuf::from("/var/lib/nwpd")));
        assert_eq!(cfg.retention_hours(), 2);
        assert!(cfg.log_observations);
        assert_eq!(cfg.aggregation_report_period(), Duration::from_secs(30));
        assert_eq!(
            cfg.aggregation_time_window(),
            crate::DEFAULT_AGGREGATION_TIME_WINDOW
        );

        let host = cfg.network(true).unwrap();
        assert_eq!(host.data_file_prefix(), "nodes");
        assert_eq!(host.default_period(), Duration::from_secs(10));
        assert_eq!(host.http_port, Some(8881));
        assert_eq!(cfg.jobs(true).len(), 2);
        assert_eq!(cfg.jobs(true)[1].job_id, "tcp-n2n");
        assert!(cfg.jobs(false).is_empty());
    }

    #[test]
    fn test_network_defaults() {
        let network = NetworkConfig::default();
        assert_eq!(network.default_period(), crate::DEFAULT_JOB_PERIOD);
        assert_eq!(network.data_file_prefix(), crate::DEFAULT_DATA_FILE_PREFIX);
        assert!(AgentConfig::default().jobs(true).is_empty());
    }

    #[test]
    fn test_duplicate_job_ids_rejected() {
        let f = write_file(
            r#"
podNetwork:
  jobs:
    - jobID: a
      args: ["checkTCPPort"]
    - jobID: a
      args: ["checkTCPPort"]
"#,
        );
        let err = load_agent_config(f.path()).unwrap_err();
        assert!(err.to_string().contains("duplicate jobID a"));
    }

    #[test]
    fn test_zero_aggregation_period_rejected() {
        let f = write_file("aggregationReportPeriodSeconds: 0\n");
        let err = load_agent_config(f.path()).unwrap_err();
        assert!(err.to_string().contains("aggregationReportPeriodSeconds"));

        let f = write_file("aggregationTimeWindowSeconds: 0\n");
        assert!(load_agent_config(f.path()).is_err());
    }

    #[test]
    fn test_load_cluster_config() {
        let f = write_file(
            r#"
nodeCount: 2
nodes:
  - hostname: node-a
    internalIP: 10.0.0.1
  - hostname: node-b
    internalIP: 10.0.0.2
podEndpoints:
  - nodename: node-a
    podname: agent-xyz
    podIP: 100.64.0.5
    port: 8881
kubeAPIServer:
  hostname: api.example.com
  ip: 1.2.3.4
  port: 443
"#,
        );
        let cfg = load_cluster_config(f.path()).unwrap();
        assert_eq!(cfg.node_count, 2);
        assert_eq!(cfg.nodes[1].internal_ip, "10.0.0.2");
        assert_eq!(cfg.pod_endpoints[0].pod_ip, "100.64.0.5");
        assert_eq!(cfg.kube_api_server.as_ref().unwrap().port, 443);
        assert!(cfg.internal_kube_api_server.is_none());
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = load_cluster_config("/does/not/exist.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
