// Stability gated walk of the parameter space of one workload.
//
// Starting from the default parameters, the memory offset is raised until
// a run is unstable or its ceiling is reached, then the core offset is
// raised and the memory sweep starts again from its default. When the
// core offset stops raising the max clock or reaches its ceiling, the
// offsets go back to their defaults and the power limit is lowered. The
// sweep is done once the power limit stops going down.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tunegpud::{
    config::{SweepConfig, TimingConfig},
    sample::ParameterPoint,
    store::CollectionId,
    supervisor::RunPlan,
};

use crate::clients::{Actuator, BenchmarkRunner, CoreClock, RemoteError};

pub mod report;

use report::{CoreBoundary, CoreStop, MemoryBoundary, MemoryStop, SweepReport};

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("Sweep of {workload} aborted")]
    Remote {
        workload: String,
        #[source]
        source: RemoteError,
    },
    #[error("Sweep of {workload} cancelled")]
    Cancelled { workload: String },
}

// What the next step of the controller does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepPhase {
    // Select the workload and reset the GPU to its defaults
    Idle,
    // Run at the current point, then raise the memory offset
    SweepingMemory,
    // Raise the core offset
    SweepingCore,
    // Lower the power limit
    SweepingPower,
    Done,
    Aborted,
}

impl SweepPhase {
    pub fn is_finished(&self) -> bool {
        matches!(self, SweepPhase::Done | SweepPhase::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSettings {
    pub power_step_mw: u32,
    pub core_step_mhz: i32,
    pub mem_step_mhz: i32,

    pub core_ceiling_mhz: Option<i32>,
    pub mem_ceiling_mhz: Option<i32>,

    pub plan: RunPlan,
}

impl SweepSettings {
    pub fn from_config(sweep: &SweepConfig, timing: TimingConfig) -> Self {
        Self {
            power_step_mw: sweep.power_step_mw,
            core_step_mhz: sweep.core_step_mhz,
            mem_step_mhz: sweep.mem_step_mhz,
            core_ceiling_mhz: sweep.core_ceiling_mhz,
            mem_ceiling_mhz: sweep.mem_ceiling_mhz,
            plan: RunPlan::from(timing),
        }
    }
}

// Values of each dimension as reported by the actuator
#[derive(Debug, Default, Clone, Copy)]
struct SweepState {
    power_limit_mw: u32,

    core: CoreClock,
    previous_core: CoreClock,

    mem_offset_mhz: i32,
    last_stable_mem_offset_mhz: i32,
}

pub struct SweepController {
    actuator: Arc<dyn Actuator>,
    runner: Arc<dyn BenchmarkRunner>,

    settings: SweepSettings,
    collection: CollectionId,

    state: SweepState,
    report: SweepReport,
}

impl SweepController {
    pub fn new(
        actuator: Arc<dyn Actuator>,
        runner: Arc<dyn BenchmarkRunner>,
        settings: SweepSettings,
        collection: CollectionId,
        workload: &str,
    ) -> Self {
        Self {
            actuator,
            runner,
            settings,
            collection,
            state: SweepState::default(),
            report: SweepReport::new(workload),
        }
    }

    pub fn phase(&self) -> SweepPhase {
        self.report.phase
    }

    pub fn report(&self) -> &SweepReport {
        &self.report
    }

    // Point the next run is executed at
    pub fn point(&self) -> ParameterPoint {
        ParameterPoint::new(
            self.state.power_limit_mw,
            self.state.core.offset_mhz,
            self.state.mem_offset_mhz,
        )
    }

    // Execute one transition. Any failure to reach a component aborts the
    // sweep, finished sweeps stay where they are
    pub async fn step(&mut self) -> Result<SweepPhase, SweepError> {
        let result = match self.report.phase {
            SweepPhase::Idle => self.start().await,
            SweepPhase::SweepingMemory => self.memory_step().await,
            SweepPhase::SweepingCore => self.core_step().await,
            SweepPhase::SweepingPower => self.power_step().await,
            SweepPhase::Done | SweepPhase::Aborted => return Ok(self.report.phase),
        };

        match result {
            Ok(phase) => {
                debug!("Sweep controller: {:?} -> {:?}", self.report.phase, phase);
                self.report.phase = phase;

                Ok(phase)
            }
            Err(source) => {
                error!(
                    "Sweep controller: Aborting the sweep of {} at {}: {source}",
                    self.report.workload,
                    self.point()
                );
                self.report.phase = SweepPhase::Aborted;

                Err(SweepError::Remote {
                    workload: self.report.workload.clone(),
                    source,
                })
            }
        }
    }

    // Step until the sweep is finished. Cancellation is only checked
    // between steps, a run in progress always completes
    pub async fn run(mut self, token: &CancellationToken) -> Result<SweepReport, SweepError> {
        while !self.phase().is_finished() {
            if token.is_cancelled() {
                info!("Sweep controller: Quiting");

                return Err(SweepError::Cancelled {
                    workload: self.report.workload.clone(),
                });
            }

            self.step().await?;
        }

        info!("Sweep controller: {}", self.report);

        Ok(self.report)
    }

    async fn start(&mut self) -> Result<SweepPhase, RemoteError> {
        let workload = self.report.workload.clone();
        info!("Sweep controller: Starting the sweep of {workload}");

        self.runner.set_workload(&workload).await?;

        let limit = self.actuator.set_tdp_to_default().await?;
        self.state.power_limit_mw = limit;
        self.report.default_power_limit_mw = Some(limit);
        self.report.min_power_limit_mw = Some(limit);

        self.reset_core().await?;
        self.reset_mem().await?;

        Ok(SweepPhase::SweepingMemory)
    }

    async fn memory_step(&mut self) -> Result<SweepPhase, RemoteError> {
        let point = self.point();
        info!("Sweep controller: Running {} at {point}", self.report.workload);

        let result = self
            .runner
            .run(&self.collection, point, self.settings.plan)
            .await?;
        self.report.runs += 1;

        if !result.is_stable() {
            warn!(
                "Sweep controller: {} is unstable at {point} ({}), last stable memory offset {} MHz",
                self.report.workload,
                result
                    .failure
                    .map_or("no reason".to_string(), |failure| failure.to_string()),
                self.state.last_stable_mem_offset_mhz
            );
            self.end_memory(MemoryStop::Unstable);

            return Ok(SweepPhase::SweepingCore);
        }

        self.report.stable_runs += 1;
        self.state.last_stable_mem_offset_mhz = self.state.mem_offset_mhz;

        let reconciled = self.runner.reconcile(&self.collection).await?;
        debug!("Sweep controller: {reconciled}");

        self.state.mem_offset_mhz = self
            .actuator
            .increase_mem_offset(self.settings.mem_step_mhz)
            .await?;

        if self
            .settings
            .mem_ceiling_mhz
            .is_some_and(|ceiling| self.state.mem_offset_mhz >= ceiling)
        {
            info!(
                "Sweep controller: Memory offset ceiling reached, last tested {} MHz at {}",
                self.state.last_stable_mem_offset_mhz, point
            );
            self.end_memory(MemoryStop::Ceiling);

            return Ok(SweepPhase::SweepingCore);
        }

        Ok(SweepPhase::SweepingMemory)
    }

    async fn core_step(&mut self) -> Result<SweepPhase, RemoteError> {
        self.state.previous_core = self.state.core;
        self.state.core = self
            .actuator
            .increase_core_offset(self.settings.core_step_mhz)
            .await?;

        let reason = if self.state.core.max_clock_mhz == self.state.previous_core.max_clock_mhz {
            Some(CoreStop::ClockClamped)
        } else if self
            .settings
            .core_ceiling_mhz
            .is_some_and(|ceiling| self.state.core.offset_mhz >= ceiling)
        {
            Some(CoreStop::Ceiling)
        } else {
            None
        };

        if let Some(reason) = reason {
            let previous = self.state.previous_core;
            info!(
                "Sweep controller: Core offset sweep at {} W ended at {} MHz ({:?})",
                f64::from(self.state.power_limit_mw) / 1000.0,
                previous.offset_mhz,
                reason
            );

            self.report.core_boundaries.push(CoreBoundary {
                power_limit_mw: self.state.power_limit_mw,
                last_core_offset_mhz: previous.offset_mhz,
                max_clock_mhz: previous.max_clock_mhz,
                reason,
            });

            return Ok(SweepPhase::SweepingPower);
        }

        self.reset_mem().await?;

        Ok(SweepPhase::SweepingMemory)
    }

    // Offsets go back to their defaults before the limit is lowered, the GPU
    // never runs a lower limit with offsets only tested at a higher one
    async fn power_step(&mut self) -> Result<SweepPhase, RemoteError> {
        self.reset_core().await?;
        self.reset_mem().await?;

        let previous = self.state.power_limit_mw;
        self.state.power_limit_mw = self
            .actuator
            .reduce_tdp(self.settings.power_step_mw)
            .await?;

        self.report.min_power_limit_mw = Some(
            self.report
                .min_power_limit_mw
                .map_or(self.state.power_limit_mw, |min| {
                    min.min(self.state.power_limit_mw)
                }),
        );

        if self.state.power_limit_mw == previous {
            info!(
                "Sweep controller: Minimum power limit {} W reached, {} is done",
                f64::from(previous) / 1000.0,
                self.report.workload
            );

            return Ok(SweepPhase::Done);
        }

        Ok(SweepPhase::SweepingMemory)
    }

    async fn reset_core(&mut self) -> Result<(), RemoteError> {
        let core = self.actuator.reset_core_offset().await?;
        debug!("Sweep controller: Core offset reset, max clock {} MHz", core.max_clock_mhz);

        self.state.core = core;
        self.state.previous_core = core;

        Ok(())
    }

    async fn reset_mem(&mut self) -> Result<(), RemoteError> {
        let offset = self.actuator.reset_mem_offset().await?;

        self.state.mem_offset_mhz = offset;
        self.state.last_stable_mem_offset_mhz = offset;

        Ok(())
    }

    fn end_memory(&mut self, reason: MemoryStop) {
        self.report.memory_boundaries.push(MemoryBoundary {
            power_limit_mw: self.state.power_limit_mw,
            core_clock_offset_mhz: self.state.core.offset_mhz,
            last_stable_mem_offset_mhz: self.state.last_stable_mem_offset_mhz,
            reason,
        });
    }
}
