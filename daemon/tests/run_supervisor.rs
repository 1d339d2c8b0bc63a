use std::{
    collections::BTreeSet,
    io,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tunegpud::{
    benchmark_service::BenchmarkService,
    config::BenchmarkConfig,
    gpu_device::mock::MockGpu,
    rpc::{RpcClient, RpcServer},
    sample::{ParameterPoint, RunFailure, RunResult},
    store::{CollectionId, MemoryStore, SampleStore},
    supervisor::{
        RunPlan, RunSupervisor,
        process_table::ProcessTable,
        workload::{LaunchCommand, RunningWorkload, WorkloadError, WorkloadLauncher},
        workload_log::WorkloadLog,
    },
    telemetry::DeviceTelemetry,
};

const MARKER: &str = "Kombustor shutdown ok.";
const PROCESS: &str = "fake-workload";

// What the fake workload saw during a run
#[derive(Debug, Default)]
struct Events {
    // Samples stored when the workload was started
    started_at: Vec<usize>,
    // Samples stored when the graceful stop was requested
    stopped_at: Vec<usize>,
    terminations: usize,
    commands: Vec<LaunchCommand>,
}

#[derive(Clone)]
struct FakeLauncher {
    store: Arc<MemoryStore>,
    _dir: Arc<TempDir>,
    log_path: PathBuf,

    write_marker: bool,
    fail_start: bool,

    events: Arc<Mutex<Events>>,
}

struct FakeWorkload {
    launcher: FakeLauncher,
}

impl FakeLauncher {
    async fn stored(&self) -> usize {
        let mut total = 0;
        for name in self.store.list("db").await.unwrap() {
            total += self
                .store
                .load(&CollectionId::new("db", &name))
                .await
                .unwrap()
                .len();
        }

        total
    }
}

#[async_trait]
impl WorkloadLauncher for FakeLauncher {
    async fn start(
        &self,
        command: &LaunchCommand,
    ) -> Result<Box<dyn RunningWorkload>, WorkloadError> {
        if self.fail_start {
            return Err(WorkloadError::Spawn {
                program: command.program.clone(),
                source: io::Error::from(io::ErrorKind::NotFound),
            });
        }

        let stored = self.stored().await;
        {
            let mut events = self.events.lock().unwrap();
            events.started_at.push(stored);
            events.commands.push(command.clone());
        }

        // A fresh run starts with a fresh log
        std::fs::write(&self.log_path, "Starting test\n").unwrap();

        Ok(Box::new(FakeWorkload {
            launcher: self.clone(),
        }))
    }
}

#[async_trait]
impl RunningWorkload for FakeWorkload {
    fn id(&self) -> Option<u32> {
        Some(4242)
    }

    async fn request_graceful_stop(&mut self) -> Result<(), WorkloadError> {
        let stored = self.launcher.stored().await;
        self.launcher.events.lock().unwrap().stopped_at.push(stored);

        if self.launcher.write_marker {
            let mut log = std::fs::read_to_string(&self.launcher.log_path).unwrap();
            log.push_str(MARKER);
            log.push('\n');
            std::fs::write(&self.launcher.log_path, log).unwrap();
        }

        Ok(())
    }

    async fn terminate(&mut self) -> Result<(), WorkloadError> {
        self.launcher.events.lock().unwrap().terminations += 1;

        Ok(())
    }
}

#[derive(Default)]
struct FakeProcessTable {
    running: bool,
    kills: Mutex<usize>,
}

#[async_trait]
impl ProcessTable for FakeProcessTable {
    async fn is_running(&self, _name: &str) -> io::Result<bool> {
        Ok(self.running)
    }

    async fn kill_all(&self, name: &str) -> io::Result<()> {
        assert_eq!(name, PROCESS);
        *self.kills.lock().unwrap() += 1;

        Ok(())
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    launcher: FakeLauncher,
    processes: Arc<FakeProcessTable>,
    gpu: MockGpu,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());

        let launcher = FakeLauncher {
            store: store.clone(),
            log_path: dir.path().join("workload.log"),
            _dir: Arc::new(dir),
            write_marker: true,
            fail_start: false,
            events: Arc::default(),
        };

        Self {
            store,
            launcher,
            processes: Arc::default(),
            gpu: MockGpu::default(),
        }
    }

    fn supervisor(
        self,
    ) -> (
        RunSupervisor,
        Arc<MemoryStore>,
        Arc<Mutex<Events>>,
        Arc<FakeProcessTable>,
    ) {
        let events = self.launcher.events.clone();
        let log = WorkloadLog::new(&self.launcher.log_path, MARKER);

        let supervisor = RunSupervisor::new(
            Arc::new(DeviceTelemetry::new(Arc::new(self.gpu))),
            Arc::new(self.launcher),
            self.processes.clone(),
            self.store.clone(),
            log,
            PROCESS,
        )
        .with_tick(Duration::from_millis(1));

        (supervisor, self.store, events, self.processes)
    }
}

fn command() -> LaunchCommand {
    LaunchCommand::from_config(&BenchmarkConfig::default(), "glfurrytorus")
}

fn collection() -> CollectionId {
    CollectionId::new("db", "gpu_data_2024-03-09_14_05_07")
}

#[tokio::test]
async fn test_stable_run_collects_every_sample() {
    let (supervisor, store, events, processes) = Harness::new().supervisor();

    let result = supervisor
        .run(&collection(), &command(), "glfurrytorus", None, RunPlan::new(5, 30, 10))
        .await;

    assert_eq!(result, RunResult::completed(45));
    assert!(result.is_stable());

    let samples = store.load(&collection()).await.unwrap();
    assert_eq!(samples.len(), 45);
    assert!(samples.iter().all(|sample| sample.workload == "glfurrytorus"));

    let events = events.lock().unwrap();
    assert_eq!(events.started_at, vec![5]);
    assert_eq!(events.stopped_at, vec![35]);
    assert_eq!(events.terminations, 1);
    assert!(events.commands[0].args.contains(&"-glfurrytorus".to_string()));

    assert_eq!(*processes.kills.lock().unwrap(), 0);
}

#[tokio::test]
async fn test_sensor_failure_stops_the_run() {
    let mut harness = Harness::new();
    harness.gpu = MockGpu::default().fail_readings_from(21);
    let (supervisor, store, events, _) = harness.supervisor();

    let result = supervisor
        .run(&collection(), &command(), "glfurrytorus", None, RunPlan::new(5, 30, 10))
        .await;

    assert_eq!(result, RunResult::failed(20, RunFailure::SensorUnavailable));
    assert!(!result.is_stable());
    assert_eq!(store.load(&collection()).await.unwrap().len(), 20);

    let events = events.lock().unwrap();
    assert_eq!(events.started_at, vec![5]);
    // Never reached the graceful stop, the workload was terminated instead
    assert!(events.stopped_at.is_empty());
    assert_eq!(events.terminations, 1);
}

#[tokio::test]
async fn test_missing_marker_is_abnormal() {
    let mut harness = Harness::new();
    harness.launcher.write_marker = false;
    let (supervisor, _, _, _) = harness.supervisor();

    let result = supervisor
        .run(&collection(), &command(), "gltessyspherex32", None, RunPlan::new(1, 3, 1))
        .await;

    assert!(result.succeeded);
    assert!(result.abnormal_termination);
    assert_eq!(result.failure, Some(RunFailure::MissingShutdownMarker));
    assert_eq!(result.sample_count, 5);
    assert!(!result.is_stable());
}

#[tokio::test]
async fn test_lingering_process_is_killed() {
    let mut harness = Harness::new();
    harness.processes = Arc::new(FakeProcessTable {
        running: true,
        ..Default::default()
    });
    let (supervisor, _, _, processes) = harness.supervisor();

    let result = supervisor
        .run(&collection(), &command(), "glfurrytorus", None, RunPlan::new(1, 2, 1))
        .await;

    assert!(!result.succeeded);
    assert_eq!(result.failure, Some(RunFailure::LingeringProcess));
    assert_eq!(*processes.kills.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_launch_failure() {
    let mut harness = Harness::new();
    harness.launcher.fail_start = true;
    let (supervisor, store, _, _) = harness.supervisor();

    let result = supervisor
        .run(&collection(), &command(), "glfurrytorus", None, RunPlan::new(3, 5, 2))
        .await;

    assert_eq!(result, RunResult::failed(3, RunFailure::LaunchFailed));
    assert_eq!(store.load(&collection()).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_samples_carry_the_applied_point() {
    let mut harness = Harness::new();
    harness.gpu = MockGpu::default().hide_offsets();
    let (supervisor, store, _, _) = harness.supervisor();

    let applied = ParameterPoint::new(330_000, 100, 400);
    let result = supervisor
        .run(&collection(), &command(), "glmsi01", Some(applied), RunPlan::new(1, 2, 1))
        .await;
    assert!(result.is_stable());

    let samples = store.load(&collection()).await.unwrap();
    assert_eq!(samples.len(), 4);
    assert!(samples.iter().all(|sample| sample.point == applied));
}

#[tokio::test]
async fn test_unknown_offsets_fail_the_run() {
    let mut harness = Harness::new();
    harness.gpu = MockGpu::default().hide_offsets();
    let (supervisor, store, events, _) = harness.supervisor();

    let result = supervisor
        .run(&collection(), &command(), "glmsi01", None, RunPlan::new(1, 2, 1))
        .await;

    // Untagged samples would be attributed to the wrong point
    assert_eq!(result, RunResult::failed(0, RunFailure::SensorUnavailable));
    assert!(store.load(&collection()).await.unwrap().is_empty());
    assert!(events.lock().unwrap().started_at.is_empty());
}

#[tokio::test]
async fn test_reconcile_after_run() {
    let harness = Harness::new();
    let log_path = harness.launcher.log_path.clone();
    let (supervisor, store, _, _) = harness.supervisor();

    supervisor
        .run(&collection(), &command(), "glfurrytorus", None, RunPlan::new(1, 3, 1))
        .await;

    // Write one FPS line per distinct second seen in the samples
    let samples = store.load(&collection()).await.unwrap();
    let times: BTreeSet<String> = samples
        .iter()
        .map(|sample| sample.date[11..].to_string())
        .collect();

    let mut log = String::new();
    for time in times.iter() {
        log.push_str(&format!("({time}) GPU 0 - FPS: 120\n"));
    }
    log.push_str(MARKER);
    std::fs::write(&log_path, log).unwrap();

    let report = supervisor.reconcile(&collection()).await.unwrap();
    assert_eq!(report.updated, times.len());

    let samples = store.load(&collection()).await.unwrap();
    let reconciled: Vec<_> = samples.iter().filter(|s| s.is_reconciled()).collect();
    assert_eq!(reconciled.len(), times.len());
    for sample in reconciled {
        assert_eq!(sample.fps, Some(120));
        let expected = 120.0 / sample.reading.power_draw_w();
        assert!((sample.efficiency.unwrap() - expected).abs() < 1e-9);
    }

    // A second pass has nothing left to do
    let report = supervisor.reconcile(&collection()).await.unwrap();
    assert_eq!(report.updated, 0);
}

#[tokio::test]
async fn test_benchmark_service_over_the_wire() {
    let harness = Harness::new();
    let (supervisor, store, events, _) = harness.supervisor();

    let service = BenchmarkService::new(supervisor, BenchmarkConfig::default(), "db");
    let server = RpcServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let token = CancellationToken::new();
    tokio::spawn(server.run(Arc::new(service), token.clone()));

    let client = RpcClient::new(addr).with_retry_interval(Duration::from_millis(20));

    let answer = client
        .call("change_benchmark_test_type", &[&"glpiano"])
        .await
        .unwrap();
    assert_eq!(answer.as_str(), Some("Benchmark test type changed to glpiano"));

    let answer = client
        .call("run_benchmark", &[&"gpu_data_2024-03-09_14_05_07", &1, &2, &1])
        .await
        .unwrap();
    assert_eq!(RunResult::from_wire(&answer), Some(RunResult::completed(4)));

    let samples = store.load(&collection()).await.unwrap();
    assert_eq!(samples.len(), 4);
    assert!(samples.iter().all(|sample| sample.workload == "glpiano"));
    assert!(
        events.lock().unwrap().commands[0]
            .args
            .contains(&"-glpiano".to_string())
    );

    // The applied point follows the database
    let answer = client
        .call(
            "run_benchmark",
            &[&"gpu_data_found_params", &1, &1, &1, &"db", &300_000, &50, &-200],
        )
        .await
        .unwrap();
    assert_eq!(RunResult::from_wire(&answer), Some(RunResult::completed(3)));

    let found = store
        .load(&CollectionId::new("db", "gpu_data_found_params"))
        .await
        .unwrap();
    assert_eq!(found.len(), 3);
    assert!(
        found
            .iter()
            .all(|sample| sample.point == ParameterPoint::new(300_000, 50, -200))
    );

    let answer = client
        .call("run_benchmark", &[&"gpu_data_found_params", &1, &1, &1, &"db", &300_000])
        .await
        .unwrap();
    assert!(answer.as_str().unwrap().contains("core clock offset"));

    let answer = client.call("get_benchmark_test_type", &[]).await.unwrap();
    assert_eq!(answer.as_str(), Some("glpiano"));

    token.cancel();
}
