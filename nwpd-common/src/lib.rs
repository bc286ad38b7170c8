//! Shared types for the nwpd agent and its tooling
//!
//! This crate defines:
//! - the agent configuration (per network mode job lists, output, aggregation)
//! - the cluster configuration (nodes, pod endpoints, API server endpoints)
//! - YAML loading for both files
//! - defaults shared by the agent and the CLI

pub mod config;
pub mod duration;

pub use config::{
    load_agent_config, load_cluster_config, AgentConfig, ClusterConfig, ConfigError, Endpoint,
    JobConfig, NetworkConfig, Node, PodEndpoint,
};

use std::time::Duration;

/// Period used for jobs when the network config has no `defaultPeriod`
pub const DEFAULT_JOB_PERIOD: Duration = Duration::from_secs(1);

/// Data file prefix used when the network config has no `dataFilePrefix`
pub const DEFAULT_DATA_FILE_PREFIX: &str = "agent";

/// Retention for observation files when `retentionHours` is unset
pub const DEFAULT_RETENTION_HOURS: u32 = 4;

/// Report period of the streaming aggregator
pub const DEFAULT_AGGREGATION_REPORT_PERIOD: Duration = Duration::from_secs(60);

/// Time window kept by the streaming aggregator
pub const DEFAULT_AGGREGATION_TIME_WINDOW: Duration = Duration::from_secs(30 * 60);

/// Port the agent serves its gRPC query API on
pub const DEFAULT_GRPC_PORT: u16 = 8880;

/// Directory the streaming aggregator writes its reports to
pub const PATH_LOG_DIR: &str = "/var/log/nwpd";
