use std::sync::Mutex;

use anyhow::{Result, anyhow};
use tracing::debug;

use crate::{
    gpu_device::{GpuDevice, PowerLimits},
    sample::{GpuReading, ParameterPoint},
};

#[derive(Debug)]
struct MockState {
    power_limit_mw: u32,
    core_clock_offset_mhz: i32,
    mem_clock_offset_mhz: i32,

    readings: usize,
}

// Simulated GPU used by the --mock mode and the tests.
//
// The max core clock follows the core offset until it reaches the clock
// cap, past that point the offset is silently clamped like real drivers do
#[derive(Debug)]
pub struct MockGpu {
    limits: PowerLimits,

    base_clock_mhz: u32,
    clock_cap_mhz: u32,

    // Readings starting from this one (1 based) fail
    fail_readings_from: Option<usize>,
    fail_setters: bool,
    // Leave the offsets out of the readings like some drivers do
    hide_offsets: bool,

    state: Mutex<MockState>,
}

impl MockGpu {
    pub fn new(limits: PowerLimits) -> Self {
        Self {
            limits,
            base_clock_mhz: 1905,
            clock_cap_mhz: 2100,
            fail_readings_from: None,
            fail_setters: false,
            hide_offsets: false,
            state: Mutex::new(MockState {
                power_limit_mw: limits.default_mw,
                core_clock_offset_mhz: 0,
                mem_clock_offset_mhz: 0,
                readings: 0,
            }),
        }
    }

    pub fn with_clock(mut self, base_clock_mhz: u32, clock_cap_mhz: u32) -> Self {
        self.base_clock_mhz = base_clock_mhz;
        self.clock_cap_mhz = clock_cap_mhz;
        self
    }

    pub fn fail_readings_from(mut self, reading: usize) -> Self {
        self.fail_readings_from = Some(reading);
        self
    }

    pub fn fail_setters(mut self) -> Self {
        self.fail_setters = true;
        self
    }

    pub fn hide_offsets(mut self) -> Self {
        self.hide_offsets = true;
        self
    }

    // Parameters currently applied
    pub fn point(&self) -> Result<ParameterPoint> {
        let state = self.lock()?;

        Ok(ParameterPoint::new(
            state.power_limit_mw,
            state.core_clock_offset_mhz,
            state.mem_clock_offset_mhz,
        ))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MockState>> {
        self.state.lock().map_err(|_| anyhow!("Mock GPU state poisoned"))
    }

    fn check_setter(&self, what: &str) -> Result<()> {
        if self.fail_setters {
            return Err(anyhow!("Mock GPU refused to set the {what}"));
        }

        Ok(())
    }

    fn max_clock_for(&self, offset_mhz: i32) -> u32 {
        let clock = i64::from(self.base_clock_mhz) + i64::from(offset_mhz);

        clock.clamp(0, i64::from(self.clock_cap_mhz)) as u32
    }
}

impl Default for MockGpu {
    fn default() -> Self {
        Self::new(PowerLimits {
            min_mw: 100_000,
            max_mw: 400_000,
            default_mw: 350_000,
        })
    }
}

impl GpuDevice for MockGpu {
    fn power_limits(&self) -> Result<PowerLimits> {
        Ok(self.limits)
    }

    fn enforced_power_limit(&self) -> Result<u32> {
        Ok(self.lock()?.power_limit_mw)
    }

    fn power_limit(&self) -> Result<u32> {
        Ok(self.lock()?.power_limit_mw)
    }

    fn set_power_limit(&self, limit_mw: u32) -> Result<()> {
        self.check_setter("power limit")?;

        if limit_mw < self.limits.min_mw || limit_mw > self.limits.max_mw {
            return Err(anyhow!("Power limit {limit_mw} mW out of range"));
        }

        debug!("Mock GPU: power limit set to {limit_mw} mW");
        self.lock()?.power_limit_mw = limit_mw;

        Ok(())
    }

    fn set_core_clock_offset(&self, offset_mhz: i32) -> Result<()> {
        self.check_setter("core clock offset")?;

        debug!("Mock GPU: core clock offset set to {offset_mhz} MHz");
        self.lock()?.core_clock_offset_mhz = offset_mhz;

        Ok(())
    }

    fn set_mem_clock_offset(&self, offset_mhz: i32) -> Result<()> {
        self.check_setter("memory clock offset")?;

        debug!("Mock GPU: memory clock offset set to {offset_mhz} MHz");
        self.lock()?.mem_clock_offset_mhz = offset_mhz;

        Ok(())
    }

    fn max_core_clock(&self) -> Result<u32> {
        let offset = self.lock()?.core_clock_offset_mhz;

        Ok(self.max_clock_for(offset))
    }

    fn reading(&self) -> Result<GpuReading> {
        let mut state = self.lock()?;
        state.readings += 1;

        if self
            .fail_readings_from
            .is_some_and(|from| state.readings >= from)
        {
            return Err(anyhow!("Mock GPU sensors unavailable"));
        }

        // The board draws a bit less than its limit under load
        let power_draw_mw = state.power_limit_mw / 10 * 9;
        let max_gpu_clock_mhz = self.max_clock_for(state.core_clock_offset_mhz);

        Ok(GpuReading {
            gpu_clock_mhz: max_gpu_clock_mhz.saturating_sub(30),
            mem_clock_mhz: (10_500 + state.mem_clock_offset_mhz).max(0) as u32 / 2,
            max_gpu_clock_mhz,
            temperature_c: 65,
            fan_speed_percent: 60,
            fan_speed_rpm: Some(2000),
            memory_used_mb: 2048.0,
            gpu_load_percent: 99,
            mem_controller_load_percent: 45,
            power_draw_mw,
            power_limit_mw: state.power_limit_mw,
            power_limit_max_mw: self.limits.max_mw,
            core_clock_offset_mhz: (!self.hide_offsets).then_some(state.core_clock_offset_mhz),
            mem_clock_offset_mhz: (!self.hide_offsets).then_some(state.mem_clock_offset_mhz),
            voltage_v: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_clock_is_silently_clamped() {
        let gpu = MockGpu::default().with_clock(2000, 2080);

        gpu.set_core_clock_offset(50).unwrap();
        assert_eq!(gpu.max_core_clock().unwrap(), 2050);

        gpu.set_core_clock_offset(100).unwrap();
        assert_eq!(gpu.max_core_clock().unwrap(), 2080);

        gpu.set_core_clock_offset(150).unwrap();
        assert_eq!(gpu.max_core_clock().unwrap(), 2080);
    }

    #[test]
    fn test_reading_failure_injection() {
        let gpu = MockGpu::default().fail_readings_from(3);

        assert!(gpu.reading().is_ok());
        assert!(gpu.reading().is_ok());
        assert!(gpu.reading().is_err());
        assert!(gpu.reading().is_err());
    }

    #[test]
    fn test_power_limit_range() {
        let gpu = MockGpu::default();

        assert!(gpu.set_power_limit(50_000).is_err());
        gpu.set_power_limit(200_000).unwrap();
        assert_eq!(
            gpu.reading().unwrap().point(),
            Some(ParameterPoint::new(200_000, 0, 0))
        );
    }

    #[test]
    fn test_hidden_offsets() {
        let gpu = MockGpu::default().hide_offsets();
        gpu.set_core_clock_offset(50).unwrap();

        let reading = gpu.reading().unwrap();
        assert_eq!(reading.core_clock_offset_mhz, None);
        assert_eq!(reading.point(), None);
        assert_eq!(gpu.point().unwrap().core_clock_offset_mhz, 50);
    }
}
