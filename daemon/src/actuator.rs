use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::{
    gpu_device::GpuDevice,
    rpc::{Arity, Request, RpcService, ServiceError, WireValue},
    sample::ParameterPoint,
};

// Offsets the GPU was last set to. The driver doesn't always report them
// so they are tracked here
#[derive(Debug, Default)]
struct ActuatorContext {
    core_clock_offset_mhz: i32,
    mem_clock_offset_mhz: i32,
}

// The only component allowed to change the GPU parameters
pub struct ActuatorService {
    device: Arc<dyn GpuDevice>,
    context: Mutex<ActuatorContext>,
}

impl ActuatorService {
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self {
            device,
            context: Mutex::new(ActuatorContext::default()),
        }
    }

    // Lower the power limit by the given amount without going under
    // the minimum and return the limit the device reports afterwards
    pub async fn reduce_tdp(&self, step_mw: u32) -> Result<u32> {
        let _context = self.context.lock().await;

        let limits = self.device.power_limits()?;
        let enforced = self.device.enforced_power_limit()?;

        let new_limit = limits.min_mw.max(enforced.saturating_sub(step_mw));
        self.device.set_power_limit(new_limit)?;

        let limit = self.device.power_limit()?;
        info!(
            "Actuator: New power limit {} W ({:.1} % TDP)",
            f64::from(limit) / 1000.0,
            f64::from(limit) / f64::from(limits.max_mw.max(1)) * 100.0
        );

        Ok(limit)
    }

    pub async fn set_tdp_to_default(&self) -> Result<u32> {
        let _context = self.context.lock().await;

        let limits = self.device.power_limits()?;
        self.device.set_power_limit(limits.default_mw)?;

        info!("Actuator: Power limit reset to {} W", f64::from(limits.default_mw) / 1000.0);

        Ok(limits.default_mw)
    }

    // Set an absolute power limit, clamped to the device constraints
    pub async fn set_tdp(&self, limit_mw: u32) -> Result<u32> {
        let _context = self.context.lock().await;

        let limits = self.device.power_limits()?;
        self.device.set_power_limit(limits.clamp(limit_mw))?;

        let limit = self.device.power_limit()?;
        info!("Actuator: Power limit set to {} W", f64::from(limit) / 1000.0);

        Ok(limit)
    }

    // Return the new core offset and the max clock it gives
    pub async fn increase_core_offset(&self, step_mhz: i32) -> Result<(i32, u32)> {
        let mut context = self.context.lock().await;

        let offset = context.core_clock_offset_mhz.saturating_add(step_mhz);
        self.apply_core_offset(&mut context, offset)
    }

    pub async fn reset_core_offset(&self) -> Result<(i32, u32)> {
        let mut context = self.context.lock().await;

        self.apply_core_offset(&mut context, 0)
    }

    pub async fn set_core_offset(&self, offset_mhz: i32) -> Result<(i32, u32)> {
        let mut context = self.context.lock().await;

        self.apply_core_offset(&mut context, offset_mhz)
    }

    pub async fn increase_mem_offset(&self, step_mhz: i32) -> Result<i32> {
        let mut context = self.context.lock().await;

        let offset = context.mem_clock_offset_mhz.saturating_add(step_mhz);
        self.apply_mem_offset(&mut context, offset)
    }

    pub async fn reset_mem_offset(&self) -> Result<i32> {
        let mut context = self.context.lock().await;

        self.apply_mem_offset(&mut context, 0)
    }

    pub async fn set_mem_offset(&self, offset_mhz: i32) -> Result<i32> {
        let mut context = self.context.lock().await;

        self.apply_mem_offset(&mut context, offset_mhz)
    }

    pub async fn parameter_point(&self) -> Result<ParameterPoint> {
        let context = self.context.lock().await;

        Ok(ParameterPoint::new(
            self.device.power_limit()?,
            context.core_clock_offset_mhz,
            context.mem_clock_offset_mhz,
        ))
    }

    pub async fn clock_info(&self) -> Result<String> {
        let context = self.context.lock().await;

        let max_clock = self.device.max_core_clock()?;

        Ok([
            format!("Max GPU clock: {max_clock} MHz"),
            format!("GPU clock offset: {} MHz", context.core_clock_offset_mhz),
            format!("Memory clock offset: {} MHz", context.mem_clock_offset_mhz),
        ]
        .join("\n"))
    }

    // The context only changes once the device accepted the offset
    fn apply_core_offset(
        &self,
        context: &mut ActuatorContext,
        offset_mhz: i32,
    ) -> Result<(i32, u32)> {
        self.device.set_core_clock_offset(offset_mhz)?;
        context.core_clock_offset_mhz = offset_mhz;

        let max_clock = self.device.max_core_clock()?;
        info!("Actuator: GPU clock offset {offset_mhz} MHz, max clock {max_clock} MHz");

        Ok((offset_mhz, max_clock))
    }

    fn apply_mem_offset(
        &self,
        context: &mut ActuatorContext,
        offset_mhz: i32,
    ) -> Result<i32> {
        self.device.set_mem_clock_offset(offset_mhz)?;
        context.mem_clock_offset_mhz = offset_mhz;

        info!("Actuator: Memory clock offset {offset_mhz} MHz");

        Ok(offset_mhz)
    }
}

fn core_answer((offset, max_clock): (i32, u32)) -> WireValue {
    WireValue::List(vec![offset.into(), max_clock.into()])
}

#[async_trait]
impl RpcService for ActuatorService {
    fn name(&self) -> &'static str {
        "Actuator"
    }

    fn arity(&self, method: &str) -> Option<Arity> {
        match method {
            "reduce_tdp"
            | "set_tdp"
            | "increase_gpu_clock_offset"
            | "set_gpu_clock_offset"
            | "increase_mem_clock_offset"
            | "set_mem_clock_offset" => Some(Arity::exact(1)),
            "set_tdp_to_default"
            | "set_gpu_clock_offset_to_default"
            | "set_mem_clock_offset_to_default"
            | "get_parameter_point"
            | "print_gpu_clock_info" => Some(Arity::exact(0)),
            _ => None,
        }
    }

    async fn call(&self, request: &Request) -> Result<WireValue, ServiceError> {
        let value: WireValue = match request.method.as_str() {
            "reduce_tdp" => {
                let step = request.arg::<u32>(0, "milliwatts")?;
                self.reduce_tdp(step).await?.into()
            }
            "set_tdp_to_default" => self.set_tdp_to_default().await?.into(),
            "set_tdp" => {
                let limit = request.arg::<u32>(0, "milliwatts")?;
                self.set_tdp(limit).await?.into()
            }
            "increase_gpu_clock_offset" => {
                let step = request.arg::<i32>(0, "megahertz")?;
                core_answer(self.increase_core_offset(step).await?)
            }
            "set_gpu_clock_offset_to_default" => {
                core_answer(self.reset_core_offset().await?)
            }
            "set_gpu_clock_offset" => {
                let offset = request.arg::<i32>(0, "megahertz")?;
                core_answer(self.set_core_offset(offset).await?)
            }
            "increase_mem_clock_offset" => {
                let step = request.arg::<i32>(0, "megahertz")?;
                self.increase_mem_offset(step).await?.into()
            }
            "set_mem_clock_offset_to_default" => {
                self.reset_mem_offset().await?.into()
            }
            "set_mem_clock_offset" => {
                let offset = request.arg::<i32>(0, "megahertz")?;
                self.set_mem_offset(offset).await?.into()
            }
            "get_parameter_point" => self.parameter_point().await?.to_wire(),
            "print_gpu_clock_info" => self
                .clock_info()
                .await
                .with_context(|| "Failed to read the GPU clock info")?
                .into(),
            _ => format!("Unknown method {}", request.method).into(),
        };

        Ok(value)
    }
}
