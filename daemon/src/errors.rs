use std::io;

use thiserror::Error;

use crate::{
    config::ConfigError, rpc::TransportError, store::StoreError,
    supervisor::{SupervisorError, workload::WorkloadError},
    telemetry::TelemetryError,
};

// The main daemon error type
#[derive(Debug, Error)]
pub enum TunegpudError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error(transparent)]
    Workload(#[from] WorkloadError),
    #[error(transparent)]
    Device(#[from] anyhow::Error),
    #[error("Failed to listen on {addr}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}
