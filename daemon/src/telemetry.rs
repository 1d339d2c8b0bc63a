use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    gpu_device::GpuDevice,
    rpc::{RpcClient, TransportError, WireValue},
    sample::GpuReading,
};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error(transparent)]
    Device(#[from] anyhow::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Sensors sent no data")]
    NoData,
    #[error("Unexpected sensors response \"{0}\"")]
    Response(String),
}

// Source of instantaneous GPU readings
#[async_trait]
pub trait TelemetryProvider: Send + Sync {
    async fn sample(&self) -> Result<GpuReading, TelemetryError>;
}

// Read the sensors of a device owned by this process
pub struct DeviceTelemetry {
    device: Arc<dyn GpuDevice>,
}

impl DeviceTelemetry {
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self { device }
    }
}

#[async_trait]
impl TelemetryProvider for DeviceTelemetry {
    async fn sample(&self) -> Result<GpuReading, TelemetryError> {
        Ok(self.device.reading()?)
    }
}

// Ask the sensors host for a reading
pub struct RemoteTelemetry {
    client: RpcClient,
    timeout: Duration,
}

impl RemoteTelemetry {
    pub fn new(client: RpcClient, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl TelemetryProvider for RemoteTelemetry {
    async fn sample(&self) -> Result<GpuReading, TelemetryError> {
        let value = self
            .client
            .call_with_timeout("get_gpu_data", &[], self.timeout)
            .await?;

        match value {
            WireValue::Null => Err(TelemetryError::NoData),
            WireValue::Str(json) => serde_json::from_str(&json)
                .map_err(|_| TelemetryError::Response(json)),
            other => Err(TelemetryError::Response(other.encode())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu_device::mock::MockGpu;

    #[tokio::test]
    async fn test_device_telemetry_propagates_failures() {
        let telemetry =
            DeviceTelemetry::new(Arc::new(MockGpu::default().fail_readings_from(2)));

        assert!(telemetry.sample().await.is_ok());
        assert!(matches!(
            telemetry.sample().await,
            Err(TelemetryError::Device(_))
        ));
    }
}
