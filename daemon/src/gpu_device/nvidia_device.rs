use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use nvml_wrapper::{
    Device, Nvml,
    enum_wrappers::device::{Clock, ClockId, TemperatureSensor},
};
use tracing::{debug, info};

use crate::{
    gpu_device::{GpuDevice, PowerLimits},
    sample::GpuReading,
};

pub struct NvidiaDevice {
    // NVML is thread-safe so it is safe to make
    // simultaneous NVML calls from multiple threads.
    // We can therefore simply wrap it in a Arc with no Mutex
    nvml: Arc<Nvml>,

    // Store the GPU unique identifier
    uuid: String,
}

impl NvidiaDevice {
    pub fn new(nvml: &Arc<Nvml>, uuid: &str) -> Result<Self> {
        let device = Self {
            nvml: nvml.clone(),
            uuid: uuid.to_string(),
        };

        // Make sure the device is reachable before handing it out
        device.get()?;

        Ok(device)
    }

    // Initialize NVML and return the first GPU of the system
    pub fn first() -> Result<Self> {
        let nvml =
            Arc::new(Nvml::init().with_context(|| "Failed to load NVML library")?);
        info!("NVML successfully initialized");

        if nvml.device_count()? == 0 {
            return Err(anyhow!("No Nvidia GPU found"));
        }

        let uuid = nvml.device_by_index(0)?.uuid()?;
        debug!("Found Nvidia device: \"{}\"", uuid);

        Self::new(&nvml, &uuid)
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    // Return a NVML device handle.
    // This function can fail and return an error
    fn get<'a>(&'a self) -> Result<Device<'a>> {
        let uuid = self.uuid.as_str();

        self.nvml.device_by_uuid(uuid).with_context(|| {
            format!("Failed to retrive GPU device \"{}\"", uuid)
        })
    }
}

impl GpuDevice for NvidiaDevice {
    fn power_limits(&self) -> Result<PowerLimits> {
        let device = self.get()?;

        let constraints = device
            .power_management_limit_constraints()
            .with_context(|| "Failed to get power limit constraints")?;
        let default_mw = device
            .power_management_limit_default()
            .with_context(|| "Failed to get default power limit")?;

        Ok(PowerLimits {
            min_mw: constraints.min_limit,
            max_mw: constraints.max_limit,
            default_mw,
        })
    }

    fn enforced_power_limit(&self) -> Result<u32> {
        self.get()?
            .enforced_power_limit()
            .with_context(|| "Failed to get enforced power limit")
    }

    fn power_limit(&self) -> Result<u32> {
        self.get()?
            .power_management_limit()
            .with_context(|| "Failed to get power management limit")
    }

    fn set_power_limit(&self, limit_mw: u32) -> Result<()> {
        let mut device = self.get()?;

        device.set_power_management_limit(limit_mw).with_context(|| {
            format!("Failed to set power limit to {} mW on \"{}\"", limit_mw, self.uuid)
        })
    }

    fn set_core_clock_offset(&self, offset_mhz: i32) -> Result<()> {
        let mut device = self.get()?;

        device.set_gpc_clock_vf_offset(offset_mhz).with_context(|| {
            format!("Failed to set core clock offset to {} MHz on \"{}\"", offset_mhz, self.uuid)
        })
    }

    fn set_mem_clock_offset(&self, offset_mhz: i32) -> Result<()> {
        let mut device = self.get()?;

        device.set_mem_clock_vf_offset(offset_mhz).with_context(|| {
            format!("Failed to set memory clock offset to {} MHz on \"{}\"", offset_mhz, self.uuid)
        })
    }

    fn max_core_clock(&self) -> Result<u32> {
        self.get()?
            .max_clock_info(Clock::Graphics)
            .with_context(|| "Failed to get max GPU clock")
    }

    fn reading(&self) -> Result<GpuReading> {
        let device = self.get()?;

        let utilization = device
            .utilization_rates()
            .with_context(|| "Failed to fetch GPU utilization info")?;
        let memory_info = device
            .memory_info()
            .with_context(|| "Failed to fetch GPU memory info")?;
        let constraints = device
            .power_management_limit_constraints()
            .with_context(|| "Failed to get power limit constraints")?;

        Ok(GpuReading {
            gpu_clock_mhz: device.clock(Clock::Graphics, ClockId::Current)?,
            // NVML reports the double data rate
            mem_clock_mhz: device.clock(Clock::Memory, ClockId::Current)? / 2,
            max_gpu_clock_mhz: device.max_clock_info(Clock::Graphics)?,
            temperature_c: device
                .temperature(TemperatureSensor::Gpu)
                .with_context(|| "Failed to fetch GPU temperature")?,
            fan_speed_percent: device.fan_speed(0)?,
            fan_speed_rpm: device.fan_speed_rpm(0).ok(),
            memory_used_mb: memory_info.used as f64 / 1024.0 / 1024.0,
            gpu_load_percent: utilization.gpu,
            mem_controller_load_percent: utilization.memory,
            power_draw_mw: device
                .power_usage()
                .with_context(|| "Failed to fetch GPU power usage")?,
            power_limit_mw: device.enforced_power_limit()?,
            power_limit_max_mw: constraints.max_limit,
            // Offsets aren't exposed by every driver
            core_clock_offset_mhz: device.gpc_clock_vf_offset().ok(),
            mem_clock_offset_mhz: device.mem_clock_vf_offset().ok(),
            voltage_v: None,
        })
    }
}
