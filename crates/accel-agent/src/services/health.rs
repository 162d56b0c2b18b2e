//! Health query service implementation

use crate::coordinator::Coordinator;
use accel_core::{DeviceClient, DeviceId, DeviceKind, Error, HealthStates};
use accel_proto::{
    DeviceState, GetGpuStateRequest, GetGpuStateResponse, HealthQuery, ListRequest, ListResponse,
    SetErrorRequest, SetErrorResponse, SetHealthRequest, SetHealthResponse,
};
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

/// Serves GPU health verdicts and the operator override entry points
#[derive(Clone)]
pub struct HealthQueryService {
    coordinator: Arc<Coordinator>,
}

impl HealthQueryService {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    async fn gpu_client(&self) -> Result<Arc<dyn DeviceClient>, Status> {
        self.coordinator
            .client(DeviceKind::Gpu)
            .await
            .ok_or_else(|| Status::unavailable("GPU client is not connected"))
    }

    async fn states(&self) -> Result<HealthStates, Status> {
        self.gpu_client()
            .await?
            .get_health_states()
            .await
            .ok_or_else(|| Status::unavailable("GPU health has not been evaluated yet"))
    }
}

/// Map device-client errors onto gRPC status codes
fn to_status(error: Error) -> Status {
    match error {
        Error::NotFound(msg) => Status::not_found(msg),
        Error::InvalidRequest(msg) => Status::invalid_argument(msg),
        Error::Unavailable(msg) => Status::unavailable(msg),
        other => Status::internal(other.to_string()),
    }
}

#[tonic::async_trait]
impl HealthQuery for HealthQueryService {
    async fn list(&self, _request: Request<ListRequest>) -> Result<Response<ListResponse>, Status> {
        debug!("Received List request");
        let states = self.states().await?;
        Ok(Response::new(ListResponse {
            states: states
                .iter()
                .map(|(id, health)| DeviceState::evaluated(id, health))
                .collect(),
        }))
    }

    async fn get_gpu_state(
        &self,
        request: Request<GetGpuStateRequest>,
    ) -> Result<Response<GetGpuStateResponse>, Status> {
        let req = request.into_inner();
        debug!("Received GetGPUState request for {} ids", req.ids.len());

        let states = self.states().await?;
        if req.ids.is_empty() {
            return Ok(Response::new(GetGpuStateResponse {
                states: states
                    .iter()
                    .map(|(id, health)| DeviceState::evaluated(id, health))
                    .collect(),
            }));
        }

        let mut found = Vec::with_capacity(req.ids.len());
        for raw in req.ids {
            let id = DeviceId::from(raw);
            let health = states
                .get(&id)
                .ok_or_else(|| Status::not_found(format!("GPU {} not found", id)))?;
            found.push(DeviceState::evaluated(&id, health));
        }
        Ok(Response::new(GetGpuStateResponse { states: found }))
    }

    async fn set_error(
        &self,
        request: Request<SetErrorRequest>,
    ) -> Result<Response<SetErrorResponse>, Status> {
        let req = request.into_inner();
        if req.fields.len() != req.counts.len() {
            return Err(Status::invalid_argument(format!(
                "{} fields but {} counts",
                req.fields.len(),
                req.counts.len()
            )));
        }

        let id = DeviceId::from(req.id);
        info!("SetError for GPU {}: {:?} = {:?}", id, req.fields, req.counts);
        self.gpu_client()
            .await?
            .set_error(&id, &req.fields, &req.counts)
            .await
            .map_err(to_status)?;
        Ok(Response::new(SetErrorResponse {}))
    }

    async fn set_health(
        &self,
        request: Request<SetHealthRequest>,
    ) -> Result<Response<SetHealthResponse>, Status> {
        let req = request.into_inner();
        let id = DeviceId::from(req.id);
        info!("SetHealth for GPU {}: {:?}", id, req.health);
        self.gpu_client()
            .await?
            .set_health_override(&id, &req.health)
            .await
            .map_err(to_status)?;
        Ok(Response::new(SetHealthResponse {}))
    }
}
