//! gRPC protocol definitions for the nwpd agent
//!
//! Defines:
//! - `AgentService` - query interface every agent serves
//! - `Observation` and `AggregatedObservation` records
//! - conversions between protobuf well-known types and chrono / std time

pub mod messages;
pub mod time;

pub mod v1 {
    include!(concat!(env!("OUT_DIR"), "/nwpd.v1.AgentService.rs"));
}

pub use messages::*;
pub use v1::agent_service_client::AgentServiceClient;
pub use v1::agent_service_server::{AgentService, AgentServiceServer};
