use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{
    gpu_device::GpuDevice,
    rpc::{Arity, Request, RpcService, ServiceError, WireValue},
};

// Expose the GPU sensors to the other components
pub struct SensorsService {
    device: Arc<dyn GpuDevice>,
}

impl SensorsService {
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self { device }
    }

    // Reading as a Json document, None when the sensors can't be read
    fn gpu_data(&self) -> Result<WireValue> {
        let reading = match self.device.reading() {
            Ok(reading) => reading,
            Err(err) => {
                warn!("Sensors: Failed to read the GPU sensors: {err:#}");

                return Ok(WireValue::Null);
            }
        };

        debug!("Sensors: {:?}", reading);

        let json = serde_json::to_string(&reading)
            .with_context(|| "Failed to encode the GPU reading")?;

        Ok(WireValue::from(json))
    }

    fn tdp_info(&self) -> Result<WireValue> {
        let limits = self.device.power_limits()?;
        let enforced = self.device.enforced_power_limit()?;

        let percent = |mw: u32| f64::from(mw) / f64::from(limits.max_mw.max(1)) * 100.0;

        let report = [
            format!("Current power limit: {} W", f64::from(enforced) / 1000.0),
            format!("Current TDP limit: {:.1} %", percent(enforced)),
            format!("Default power limit: {} W", f64::from(limits.default_mw) / 1000.0),
            format!(
                "Power limit range: {} W - {} W",
                f64::from(limits.min_mw) / 1000.0,
                f64::from(limits.max_mw) / 1000.0
            ),
            format!("TDP range: {:.1} % - 100 %", percent(limits.min_mw)),
        ]
        .join("\n");

        Ok(WireValue::from(report))
    }
}

#[async_trait]
impl RpcService for SensorsService {
    fn name(&self) -> &'static str {
        "Sensors"
    }

    fn arity(&self, method: &str) -> Option<Arity> {
        match method {
            "get_gpu_data" | "print_tdp_info" => Some(Arity::exact(0)),
            _ => None,
        }
    }

    async fn call(&self, request: &Request) -> Result<WireValue, ServiceError> {
        let value = match request.method.as_str() {
            "get_gpu_data" => self.gpu_data()?,
            "print_tdp_info" => self.tdp_info()?,
            _ => return Ok(WireValue::from(format!("Unknown method {}", request.method))),
        };

        Ok(value)
    }
}
