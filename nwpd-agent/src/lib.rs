//! Node agent for nwpd (DaemonSet)
//!
//! Responsibilities:
//! - Run network probe jobs on a fixed tick
//! - Reload the agent and cluster configuration without a restart
//! - Fan observations out to storage, metrics and the edge aggregator
//! - Answer raw and aggregated history queries over gRPC
//! - Expose Prometheus metrics on the configured `httpPort`

pub mod aggregation;
pub mod aggregator;
pub mod config_manager;
pub mod error;
pub mod grpc_server;
pub mod job;
pub mod metrics;
pub mod pipeline;
pub mod registry;
pub mod runners;
pub mod server;
pub mod writer;

pub use error::{AgentError, Result};
pub use server::{Agent, AgentOptions};
