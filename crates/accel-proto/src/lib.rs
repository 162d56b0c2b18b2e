//! # accel-proto
//!
//! Protocol buffer definitions and generated gRPC bindings of the health
//! query service exposed by the exporter agent.

pub mod conversions;

// Generated protobuf code
pub mod health {
    pub mod v1 {
        tonic::include_proto!("accel.health.v1");
    }
}

pub use health::v1::{
    health_query_client::HealthQueryClient,
    health_query_server::{HealthQuery, HealthQueryServer},
    DeviceState, GetGpuStateRequest, GetGpuStateResponse, Health, ListRequest, ListResponse,
    SetErrorRequest, SetErrorResponse, SetHealthRequest, SetHealthResponse,
};

/// Errors of proto-level operations
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, ProtoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_wire_values() {
        assert_eq!(Health::Healthy as i32, 1);
        assert_eq!(Health::Unhealthy as i32, 2);
        assert_eq!(Health::try_from(3).ok(), Some(Health::Unknown));
    }

    #[test]
    fn test_set_error_request() {
        let request = SetErrorRequest {
            id: "a1000000-0000-0000-0000-000000000000".to_string(),
            fields: vec!["GPU_ECC_UNCORRECT_UMC".to_string()],
            counts: vec![1],
        };
        assert_eq!(request.fields.len(), request.counts.len());
    }
}
