//! gRPC server implementation for the agent
//!
//! Implements `AgentService` on top of the observation writer.

use crate::aggregation::{aggregate_observations, aggregation_window};
use crate::error::{AgentError, Result};
use crate::writer::{ListObservationsOptions, SharedWriter};
use nwpd_proto::time::{from_proto_duration, from_timestamp};
use nwpd_proto::{
    AgentService, AgentServiceServer, AggregatedObservation, GetAggregatedObservationsResponse,
    GetObservationsRequest, GetObservationsResponse, Observation,
};
use std::net::SocketAddr;
use tokio::task::JoinHandle;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info};

/// Query service over the observation history
#[derive(Clone)]
pub struct ObservationService {
    writer: SharedWriter,
}

impl ObservationService {
    pub fn new(writer: SharedWriter) -> Self {
        Self { writer }
    }

    pub async fn list_observations(
        &self,
        request: &GetObservationsRequest,
    ) -> Result<Vec<Observation>> {
        let writer = self.writer.get().ok_or(AgentError::NoWriter)?;
        writer
            .list_observations(&ListObservationsOptions::from(request))
            .await
    }

    pub async fn list_aggregated_observations(
        &self,
        request: &GetObservationsRequest,
    ) -> Result<Vec<AggregatedObservation>> {
        let observations = self.list_observations(request).await?;
        let width = aggregation_window(request.aggregation_window.as_ref().map(from_proto_duration));
        let start = request.start.as_ref().map(from_timestamp);
        Ok(aggregate_observations(&observations, start, width))
    }
}

fn to_status(e: AgentError) -> Status {
    match e {
        AgentError::NoWriter => Status::failed_precondition(e.to_string()),
        AgentError::Storage(msg) => Status::internal(msg),
        AgentError::Io(e) => Status::internal(e.to_string()),
        e => Status::internal(e.to_string()),
    }
}

#[tonic::async_trait]
impl AgentService for ObservationService {
    async fn get_observations(
        &self,
        request: Request<GetObservationsRequest>,
    ) -> std::result::Result<Response<GetObservationsResponse>, Status> {
        let req = request.into_inner();
        let observations = self.list_observations(&req).await.map_err(to_status)?;
        debug!(count = observations.len(), "served observations");
        Ok(Response::new(GetObservationsResponse { observations }))
    }

    async fn get_aggregated_observations(
        &self,
        request: Request<GetObservationsRequest>,
    ) -> std::result::Result<Response<GetAggregatedObservationsResponse>, Status> {
        let req = request.into_inner();
        let aggregated_observations = self
            .list_aggregated_observations(&req)
            .await
            .map_err(to_status)?;
        Ok(Response::new(GetAggregatedObservationsResponse {
            aggregated_observations,
        }))
    }
}

/// Start the gRPC server in the background
pub fn start_server(service: ObservationService, addr: SocketAddr) -> JoinHandle<()> {
    info!("Starting gRPC server on {}", addr);

    let server = tonic::transport::Server::builder()
        .add_service(AgentServiceServer::new(service))
        .serve(addr);

    tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("gRPC server error: {}", e);
        }
    })
}
