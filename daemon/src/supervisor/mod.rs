// Time boxed benchmark runs with telemetry sampling.
//
// A run samples the sensors once per tick for before + during + after
// ticks. The workload is started at tick `before` and asked to stop at
// tick `before + during`. Failures never leave a run as errors, they
// become part of its RunResult.

use std::{io, path::PathBuf, sync::Arc, time::Duration};

use chrono::Local;
use thiserror::Error;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::{
    config::TimingConfig,
    sample::{ParameterPoint, RunFailure, RunResult, TelemetrySample},
    store::{CollectionId, SampleStore, StoreError},
    telemetry::TelemetryProvider,
};

pub mod process_table;
pub mod reconcile;
pub mod workload;
pub mod workload_log;

use process_table::ProcessTable;
use reconcile::{ReconcileReport, reconcile};
use workload::{LaunchCommand, RunningWorkload, WorkloadLauncher};
use workload_log::WorkloadLog;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Failed to read the workload log {path:?}")]
    Log {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

// Number of ticks of each phase of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunPlan {
    pub before: u32,
    pub during: u32,
    pub after: u32,
}

impl RunPlan {
    pub fn new(before: u32, during: u32, after: u32) -> Self {
        Self {
            before,
            during,
            after,
        }
    }

    pub fn total(&self) -> u32 {
        self.before
            .saturating_add(self.during)
            .saturating_add(self.after)
    }

    fn stop_tick(&self) -> u32 {
        self.before.saturating_add(self.during)
    }
}

impl From<TimingConfig> for RunPlan {
    fn from(timing: TimingConfig) -> Self {
        Self::new(timing.before, timing.during, timing.after)
    }
}

pub struct RunSupervisor {
    telemetry: Arc<dyn TelemetryProvider>,
    launcher: Arc<dyn WorkloadLauncher>,
    processes: Arc<dyn ProcessTable>,
    store: Arc<dyn SampleStore>,

    log: WorkloadLog,
    // Executable name looked up in the process list after a run
    process_name: String,

    tick: Duration,
}

impl RunSupervisor {
    pub fn new(
        telemetry: Arc<dyn TelemetryProvider>,
        launcher: Arc<dyn WorkloadLauncher>,
        processes: Arc<dyn ProcessTable>,
        store: Arc<dyn SampleStore>,
        log: WorkloadLog,
        process_name: &str,
    ) -> Self {
        Self {
            telemetry,
            launcher,
            processes,
            store,
            log,
            process_name: process_name.to_string(),
            tick: Duration::from_secs(1),
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn log(&self) -> &WorkloadLog {
        &self.log
    }

    // Execute one run and store its samples, tagged with the workload,
    // in the given collection. Samples are tagged with the applied point
    // when the caller knows it, with the offsets the sensors report otherwise
    pub async fn run(
        &self,
        collection: &CollectionId,
        command: &LaunchCommand,
        workload_tag: &str,
        applied: Option<ParameterPoint>,
        plan: RunPlan,
    ) -> RunResult {
        info!(
            "Run supervisor: Starting {} run into {} ({} + {} + {} ticks)",
            workload_tag, collection, plan.before, plan.during, plan.after
        );

        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut workload: Option<Box<dyn RunningWorkload>> = None;
        let mut sample_count = 0;

        for tick in 0..plan.total() {
            ticker.tick().await;

            if tick == plan.before {
                match self.launcher.start(command).await {
                    Ok(started) => {
                        info!("Run supervisor: Workload started (pid {:?})", started.id());
                        workload = Some(started);
                    }
                    Err(err) => {
                        error!("Run supervisor: {err}: {}", source_chain(&err));
                        return RunResult::failed(sample_count, RunFailure::LaunchFailed);
                    }
                }
            }

            if tick == plan.stop_tick() {
                if let Some(running) = workload.as_mut() {
                    debug!("Run supervisor: Requesting graceful stop");

                    if let Err(err) = running.request_graceful_stop().await {
                        warn!("Run supervisor: {err}");
                    }
                }
            }

            let reading = match self.telemetry.sample().await {
                Ok(reading) => reading,
                Err(err) => {
                    warn!(
                        "Run supervisor: Failed to read the GPU sensors, stopping the run: {err}"
                    );
                    Self::force_stop(workload).await;

                    return RunResult::failed(sample_count, RunFailure::SensorUnavailable);
                }
            };

            let Some(point) = applied.or_else(|| reading.point()) else {
                warn!(
                    "Run supervisor: The sensors don't report the clock offsets and no applied point was given, stopping the run"
                );
                Self::force_stop(workload).await;

                return RunResult::failed(sample_count, RunFailure::SensorUnavailable);
            };

            let sample = TelemetrySample::new(reading, workload_tag, point, Local::now());
            debug!("Run supervisor: Sample {}: {:?}", tick, sample);

            if let Err(err) = self.store.append(collection, &sample).await {
                error!("Run supervisor: {err}: {}", source_chain(&err));
                Self::force_stop(workload).await;

                return RunResult::failed(sample_count, RunFailure::StoreUnavailable);
            }

            sample_count += 1;
        }

        let Some(mut workload) = workload else {
            warn!("Run supervisor: The run ended before the workload was started");
            return RunResult::failed(sample_count, RunFailure::LaunchFailed);
        };

        if let Err(err) = workload.terminate().await {
            warn!("Run supervisor: {err}");
        }

        let marker_failure = match self.log.has_shutdown_marker().await {
            Ok(true) => None,
            Ok(false) => {
                warn!("Run supervisor: The workload was stopped unexpectedly, its log is incomplete");
                Some(RunFailure::MissingShutdownMarker)
            }
            Err(err) => {
                warn!("Run supervisor: Failed to read {:?}: {err}", self.log.path());
                Some(RunFailure::LogUnreadable)
            }
        };

        match self.processes.is_running(&self.process_name).await {
            Ok(true) => {
                warn!("Run supervisor: {} is still running, killing it", self.process_name);

                if let Err(err) = self.processes.kill_all(&self.process_name).await {
                    error!("Run supervisor: Failed to kill {}: {err}", self.process_name);
                }

                return RunResult {
                    succeeded: false,
                    sample_count,
                    abnormal_termination: marker_failure.is_some(),
                    failure: Some(RunFailure::LingeringProcess),
                };
            }
            Ok(false) => {}
            Err(err) => {
                warn!("Run supervisor: Failed to check the process list: {err}");
            }
        }

        let result = match marker_failure {
            None => RunResult::completed(sample_count),
            Some(failure) => RunResult::abnormal(sample_count, failure),
        };
        info!("Run supervisor: Run finished: {:?}", result);

        result
    }

    // Annotate the samples of a collection with the FPS values found in
    // the workload log
    pub async fn reconcile(
        &self,
        collection: &CollectionId,
    ) -> Result<ReconcileReport, SupervisorError> {
        let entries = self.log.fps_entries().await.map_err(|source| {
            SupervisorError::Log {
                path: self.log.path().to_path_buf(),
                source,
            }
        })?;

        let mut samples = self.store.load(collection).await?;
        let day = Local::now().format("%Y-%m-%d").to_string();

        let report = reconcile(&mut samples, &entries, &day);
        if report.updated > 0 {
            self.store.replace(collection, &samples).await?;
        }

        info!("Run supervisor: Reconciled {}: {}", collection, report);

        Ok(report)
    }

    // Best effort termination, errors are only logged
    async fn force_stop(workload: Option<Box<dyn RunningWorkload>>) {
        if let Some(mut workload) = workload {
            if let Err(err) = workload.terminate().await {
                debug!("Run supervisor: Ignoring termination failure: {err}");
            }
        }
    }
}

// Render the causes of an error on one line
fn source_chain(err: &dyn std::error::Error) -> String {
    let mut causes = Vec::new();
    let mut source = err.source();

    while let Some(cause) = source {
        causes.push(cause.to_string());
        source = cause.source();
    }

    causes.join(": ")
}
