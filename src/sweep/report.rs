use core::fmt;

use crate::sweep::SweepPhase;

// Why the memory offset stopped increasing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryStop {
    // The next offset gave an unstable run
    Unstable,
    // The configured ceiling was reached
    Ceiling,
}

// Why the core offset stopped increasing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreStop {
    // The max clock stopped following the offset
    ClockClamped,
    Ceiling,
}

// Highest stable memory offset found for one (power limit, core offset) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBoundary {
    pub power_limit_mw: u32,
    pub core_clock_offset_mhz: i32,
    pub last_stable_mem_offset_mhz: i32,
    pub reason: MemoryStop,
}

// Last core offset tried at one power limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreBoundary {
    pub power_limit_mw: u32,
    pub last_core_offset_mhz: i32,
    pub max_clock_mhz: u32,
    pub reason: CoreStop,
}

// Outcome of the sweep of one workload
#[derive(Debug, Clone, PartialEq)]
pub struct SweepReport {
    pub workload: String,

    pub runs: usize,
    pub stable_runs: usize,

    pub memory_boundaries: Vec<MemoryBoundary>,
    pub core_boundaries: Vec<CoreBoundary>,

    pub default_power_limit_mw: Option<u32>,
    pub min_power_limit_mw: Option<u32>,

    pub phase: SweepPhase,
}

impl SweepReport {
    pub fn new(workload: &str) -> Self {
        Self {
            workload: workload.to_string(),
            runs: 0,
            stable_runs: 0,
            memory_boundaries: Vec::new(),
            core_boundaries: Vec::new(),
            default_power_limit_mw: None,
            min_power_limit_mw: None,
            phase: SweepPhase::Idle,
        }
    }
}

impl fmt::Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Workload {}: {:?} after {} runs ({} stable)",
            self.workload, self.phase, self.runs, self.stable_runs
        )?;

        if let (Some(default), Some(min)) =
            (self.default_power_limit_mw, self.min_power_limit_mw)
        {
            writeln!(
                f,
                "  Power limit: {} W down to {} W",
                f64::from(default) / 1000.0,
                f64::from(min) / 1000.0
            )?;
        }

        for core in self.core_boundaries.iter() {
            writeln!(
                f,
                "  {} W: core offset {} MHz ({} MHz max clock, {:?})",
                f64::from(core.power_limit_mw) / 1000.0,
                core.last_core_offset_mhz,
                core.max_clock_mhz,
                core.reason
            )?;
        }

        for memory in self.memory_boundaries.iter() {
            writeln!(
                f,
                "  {} W, core {} MHz: memory offset {} MHz ({:?})",
                f64::from(memory.power_limit_mw) / 1000.0,
                memory.core_clock_offset_mhz,
                memory.last_stable_mem_offset_mhz,
                memory.reason
            )?;
        }

        Ok(())
    }
}
