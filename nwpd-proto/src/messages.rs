//! Protobuf messages of the `nwpd.v1` package

use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Outcome of one probe run against one destination
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Observation {
    #[prost(string, tag = "1")]
    pub src_host: String,
    #[prost(string, tag = "2")]
    pub dest_host: String,
    #[prost(message, optional, tag = "3")]
    pub timestamp: Option<prost_types::Timestamp>,
    #[prost(message, optional, tag = "4")]
    pub duration: Option<prost_types::Duration>,
    #[prost(bool, tag = "5")]
    pub ok: bool,
    #[prost(string, tag = "6")]
    pub job_id: String,
    #[prost(string, tag = "7")]
    pub result: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetObservationsRequest {
    /// Maximum number of observations, 0 means unlimited
    #[prost(int32, tag = "1")]
    pub limit: i32,
    #[prost(string, repeated, tag = "2")]
    pub restrict_to_job_ids: Vec<String>,
    #[prost(string, repeated, tag = "3")]
    pub restrict_to_src_hosts: Vec<String>,
    #[prost(string, repeated, tag = "4")]
    pub restrict_to_dest_hosts: Vec<String>,
    #[prost(bool, tag = "5")]
    pub failures_only: bool,
    #[prost(message, optional, tag = "6")]
    pub start: Option<prost_types::Timestamp>,
    #[prost(message, optional, tag = "7")]
    pub end: Option<prost_types::Timestamp>,
    /// Only used by `GetAggregatedObservations`
    #[prost(message, optional, tag = "8")]
    pub aggregation_window: Option<prost_types::Duration>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetObservationsResponse {
    #[prost(message, repeated, tag = "1")]
    pub observations: Vec<Observation>,
}

/// Per edge summary of one aggregation window
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AggregatedObservation {
    #[prost(string, tag = "1")]
    pub src_host: String,
    #[prost(string, tag = "2")]
    pub dest_host: String,
    #[prost(message, optional, tag = "3")]
    pub period_start: Option<prost_types::Timestamp>,
    #[prost(message, optional, tag = "4")]
    pub period_end: Option<prost_types::Timestamp>,
    #[prost(map = "string, int32", tag = "5")]
    pub jobs_ok_count: HashMap<String, i32>,
    #[prost(map = "string, int32", tag = "6")]
    pub jobs_not_ok_count: HashMap<String, i32>,
    #[prost(map = "string, message", tag = "7")]
    pub mean_ok_duration: HashMap<String, prost_types::Duration>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetAggregatedObservationsResponse {
    #[prost(message, repeated, tag = "1")]
    pub aggregated_observations: Vec<AggregatedObservation>,
}

impl Observation {
    pub fn new(
        src_host: impl Into<String>,
        dest_host: impl Into<String>,
        job_id: impl Into<String>,
        ok: bool,
        duration: Option<std::time::Duration>,
        at: DateTime<Utc>,
        result: impl Into<String>,
    ) -> Self {
        Self {
            src_host: src_host.into(),
            dest_host: dest_host.into(),
            timestamp: Some(crate::time::to_timestamp(at)),
            duration: duration.map(crate::time::to_proto_duration),
            ok,
            job_id: job_id.into(),
            result: result.into(),
        }
    }

    /// Timestamp as UTC time, the epoch when unset
    pub fn time(&self) -> DateTime<Utc> {
        self.timestamp
            .as_ref()
            .map(crate::time::from_timestamp)
            .unwrap_or_default()
    }

    /// Probe latency, if recorded
    pub fn latency(&self) -> Option<std::time::Duration> {
        self.duration.as_ref().map(crate::time::from_proto_duration)
    }
}
