use anyhow::Result;

use crate::sample::GpuReading;

pub mod mock;
pub mod nvidia_device;

// Power limit range of the device, all values in milliwatts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerLimits {
    pub min_mw: u32,
    pub max_mw: u32,
    pub default_mw: u32,
}

impl PowerLimits {
    pub fn clamp(&self, limit_mw: u32) -> u32 {
        limit_mw.clamp(self.min_mw, self.max_mw)
    }
}

// GPU device trait.
// NVML calls are thread-safe so every method takes a shared reference
pub trait GpuDevice: Send + Sync {
    // Return the power limit constraints and the default limit
    fn power_limits(&self) -> Result<PowerLimits>;

    // Return the power limit the driver currently enforces
    fn enforced_power_limit(&self) -> Result<u32>;
    // Return the power management limit set on the device
    fn power_limit(&self) -> Result<u32>;
    fn set_power_limit(&self, limit_mw: u32) -> Result<()>;

    fn set_core_clock_offset(&self, offset_mhz: i32) -> Result<()>;
    fn set_mem_clock_offset(&self, offset_mhz: i32) -> Result<()>;

    // Return the max achievable core clock with the current offset
    fn max_core_clock(&self) -> Result<u32>;

    // Read every sensor at once
    fn reading(&self) -> Result<GpuReading>;
}
