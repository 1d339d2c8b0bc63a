#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Local;
use tunegpu::clients::{BenchmarkRunner, RemoteError};
use tunegpud::{
    actuator::ActuatorService,
    gpu_device::{GpuDevice, PowerLimits, mock::MockGpu},
    rpc::TransportError,
    sample::{ParameterPoint, RunFailure, RunResult, TelemetrySample},
    store::{CollectionId, MemoryStore, SampleStore},
    supervisor::RunPlan,
};

pub const SAMPLES_PER_RUN: usize = 3;

type Stability = Box<dyn Fn(ParameterPoint) -> bool + Send + Sync>;

#[derive(Debug, Default)]
pub struct RunnerLog {
    pub workload: String,
    pub runs: Vec<(String, ParameterPoint)>,
    pub reconciles: usize,
}

// Benchmark host stand in: every run stores a few readings of the mock GPU
// and reconciliation gives them an FPS value derived from their point
pub struct FakeRunner {
    gpu: Arc<MockGpu>,
    store: Arc<MemoryStore>,

    stable: Stability,
    // Runs starting from this one (1 based) fail to reach the host
    unreachable_from: Option<usize>,

    pub log: Mutex<RunnerLog>,
}

impl FakeRunner {
    pub fn new(gpu: Arc<MockGpu>, store: Arc<MemoryStore>) -> Self {
        Self {
            gpu,
            store,
            stable: Box::new(|_| true),
            unreachable_from: None,
            log: Mutex::default(),
        }
    }

    pub fn stable_when(mut self, stable: impl Fn(ParameterPoint) -> bool + Send + Sync + 'static) -> Self {
        self.stable = Box::new(stable);
        self
    }

    pub fn unreachable_from(mut self, run: usize) -> Self {
        self.unreachable_from = Some(run);
        self
    }

    pub fn runs(&self) -> Vec<(String, ParameterPoint)> {
        self.log.lock().unwrap().runs.clone()
    }

    pub fn reconciles(&self) -> usize {
        self.log.lock().unwrap().reconciles
    }
}

// Faster with less memory overclock and slower at low power
pub fn fps_model(point: ParameterPoint) -> u32 {
    100 + point.power_limit_mw / 10_000 + (point.core_clock_offset_mhz / 10) as u32
        + (point.mem_clock_offset_mhz / 100) as u32
}

#[async_trait]
impl BenchmarkRunner for FakeRunner {
    async fn set_workload(&self, workload: &str) -> Result<(), RemoteError> {
        self.log.lock().unwrap().workload = workload.to_string();

        Ok(())
    }

    async fn run(
        &self,
        collection: &CollectionId,
        point: ParameterPoint,
        _plan: RunPlan,
    ) -> Result<RunResult, RemoteError> {
        let reading = self.gpu.reading()?;
        assert_eq!(
            Some(point),
            reading.point(),
            "run tagged with a point the GPU isn't running"
        );

        let (workload, run) = {
            let mut log = self.log.lock().unwrap();
            let current = log.workload.clone();
            log.runs.push((current, point));
            (log.workload.clone(), log.runs.len())
        };

        if self.unreachable_from.is_some_and(|from| run >= from) {
            return Err(RemoteError::Transport(TransportError::Timeout {
                addr: "127.0.0.1:1235".to_string(),
                method: "run_benchmark".to_string(),
                timeout: Duration::from_secs(1800),
            }));
        }

        for _ in 0..SAMPLES_PER_RUN {
            let sample = TelemetrySample::new(reading.clone(), &workload, point, Local::now());
            self.store
                .append(collection, &sample)
                .await
                .map_err(anyhow::Error::from)?;
        }

        if (self.stable)(point) {
            Ok(RunResult::completed(SAMPLES_PER_RUN))
        } else {
            Ok(RunResult::abnormal(SAMPLES_PER_RUN, RunFailure::MissingShutdownMarker))
        }
    }

    async fn reconcile(&self, collection: &CollectionId) -> Result<String, RemoteError> {
        let mut samples = self.store.load(collection).await.map_err(anyhow::Error::from)?;

        let mut updated = 0;
        for sample in samples.iter_mut().filter(|sample| !sample.is_reconciled()) {
            let fps = fps_model(sample.point);
            sample.fps = Some(fps);
            sample.efficiency = Some(f64::from(fps) / sample.reading.power_draw_w());
            updated += 1;
        }

        self.store
            .replace(collection, &samples)
            .await
            .map_err(anyhow::Error::from)?;
        self.log.lock().unwrap().reconciles += 1;

        Ok(format!("samples updated: {updated}"))
    }
}

pub fn mock_gpu(min_mw: u32, default_mw: u32) -> Arc<MockGpu> {
    Arc::new(MockGpu::new(PowerLimits {
        min_mw,
        max_mw: 400_000,
        default_mw,
    }))
}

pub fn actuator(gpu: &Arc<MockGpu>) -> Arc<ActuatorService> {
    Arc::new(ActuatorService::new(gpu.clone()))
}
