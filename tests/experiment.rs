mod common;

use std::{path::Path, sync::Arc};

use common::{FakeRunner, SAMPLES_PER_RUN, actuator, mock_gpu};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tunegpu::{
    experiment::{BaselineCollections, ExperimentDriver, ExperimentError},
    recommender::OptimalParams,
};
use tunegpud::{
    config::Config,
    gpu_device::mock::MockGpu,
    sample::ParameterPoint,
    store::{CollectionId, MemoryStore, SampleStore},
};

struct Setup {
    dir: TempDir,
    gpu: Arc<MockGpu>,
    config: Config,
    store: Arc<MemoryStore>,
    runner: Arc<FakeRunner>,
    driver: ExperimentDriver,
}

fn config(dir: &Path) -> Config {
    let mut config = Config::default();

    config.sweep.workloads = vec!["glfurrytorus".to_string(), "glmsi01".to_string()];
    config.sweep.core_ceiling_mhz = Some(50);
    config.sweep.mem_ceiling_mhz = Some(200);
    config.experiment.baseline_registry = dir.join("comparison_collections.json");
    config.experiment.optimal_params_path = dir.join("optimal_params.txt");

    config
}

// Power limits from 350 W down to 340 W in two steps
fn setup() -> Setup {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path());

    let gpu = mock_gpu(340_000, 350_000);
    let store = Arc::new(MemoryStore::new());
    let runner = Arc::new(FakeRunner::new(gpu.clone(), store.clone()));

    let driver = ExperimentDriver::new(actuator(&gpu), runner.clone(), store.clone(), &config);

    Setup {
        dir,
        gpu,
        config,
        store,
        runner,
        driver,
    }
}

#[tokio::test]
async fn test_full_sweep_then_validation() {
    let setup = setup();
    let token = CancellationToken::new();

    let (sweep, reports) = setup.driver.full_sweep(&token).await.unwrap();
    assert_eq!(sweep.database, setup.config.store.monitoring_database);
    assert!(sweep.name.starts_with("gpu_data_"));
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|report| report.runs == 3));

    let samples = setup.store.load(&sweep).await.unwrap();
    assert_eq!(samples.len(), 6 * SAMPLES_PER_RUN);
    assert!(samples.iter().all(|sample| sample.is_reconciled()));

    assert_eq!(setup.driver.latest_sweep_collection().await.unwrap(), sweep);

    // Lowest power limit has the best FPS per watt in the fake model
    let outcome = setup
        .driver
        .validate_recommendation(&sweep, &token)
        .await
        .unwrap();
    let expected = ParameterPoint::new(340_000, 0, 0);
    assert_eq!(outcome.recommended, expected);
    assert_eq!(outcome.applied, expected);
    assert_eq!(outcome.stable_runs, 2);
    assert_eq!(outcome.collection.database, setup.config.store.comparison_database);
    assert!(outcome.collection.name.starts_with("gpu_data_found_params_"));

    let saved = OptimalParams::load(&setup.config.experiment.optimal_params_path)
        .await
        .unwrap();
    assert_eq!(saved.point(), expected);

    let found = setup.store.load(&outcome.collection).await.unwrap();
    assert_eq!(found.len(), 2 * SAMPLES_PER_RUN);
    assert!(found.iter().all(|sample| sample.point == expected));
}

fn defaults() -> ParameterPoint {
    ParameterPoint::new(350_000, 0, 0)
}

#[tokio::test]
async fn test_full_sweep_restores_the_defaults() {
    let setup = setup();

    setup.driver.full_sweep(&CancellationToken::new()).await.unwrap();

    assert_eq!(setup.gpu.point().unwrap(), defaults());
}

#[tokio::test]
async fn test_aborted_sweep_restores_the_defaults() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path());

    let gpu = mock_gpu(340_000, 350_000);
    let store = Arc::new(MemoryStore::new());
    let runner = Arc::new(FakeRunner::new(gpu.clone(), store.clone()).unreachable_from(2));
    let driver = ExperimentDriver::new(actuator(&gpu), runner, store, &config);

    let result = driver.full_sweep(&CancellationToken::new()).await;

    assert!(matches!(result, Err(ExperimentError::Sweep(_))));
    assert_eq!(gpu.point().unwrap(), defaults());
}

#[tokio::test]
async fn test_cancelled_sweep_restores_the_defaults() {
    let setup = setup();
    let token = CancellationToken::new();

    // Leftovers of an interrupted session
    setup
        .driver
        .apply_point(ParameterPoint::new(340_000, 50, 200))
        .await
        .unwrap();
    token.cancel();

    let result = setup.driver.full_sweep(&token).await;

    assert!(matches!(result, Err(ExperimentError::Sweep(_))));
    assert!(setup.runner.runs().is_empty());
    assert_eq!(setup.gpu.point().unwrap(), defaults());
}

#[tokio::test]
async fn test_min_power_baseline_restores_the_defaults() {
    let setup = setup();

    setup
        .driver
        .min_power_baseline(&CancellationToken::new())
        .await
        .unwrap();

    let limits: Vec<u32> = setup
        .runner
        .runs()
        .iter()
        .map(|(_, point)| point.power_limit_mw)
        .collect();
    assert_eq!(limits, vec![340_000, 340_000]);
    assert_eq!(setup.gpu.point().unwrap(), defaults());
}

#[tokio::test]
async fn test_baselines_are_collected_once() {
    let setup = setup();
    let token = CancellationToken::new();

    let baselines = setup.driver.collect_baselines(&token).await.unwrap();
    assert!(baselines.default_params.starts_with("gpu_data_default_params_"));
    assert!(
        baselines
            .default_params_and_min_power_limit
            .starts_with("gpu_data_default_params_and_min_power_limit_")
    );

    let limits: Vec<u32> = setup
        .runner
        .runs()
        .iter()
        .map(|(_, point)| point.power_limit_mw)
        .collect();
    assert_eq!(limits, vec![350_000, 350_000, 340_000, 340_000]);

    let registry = std::fs::read_to_string(&setup.config.experiment.baseline_registry).unwrap();
    let registered: BaselineCollections = serde_json::from_str(&registry).unwrap();
    assert_eq!(registered, baselines);

    // Second invocation only reads the registry
    let again = setup.driver.collect_baselines(&token).await.unwrap();
    assert_eq!(again, baselines);
    assert_eq!(setup.runner.runs().len(), 4);

    // Comparison of both baselines with themselves
    let found = CollectionId::new(
        &setup.config.store.comparison_database,
        &baselines.default_params,
    );
    let summaries = setup.driver.compare(&baselines, &found).await.unwrap();
    assert_eq!(summaries.len(), 3);
    assert!(summaries[1].mean_power_w < summaries[0].mean_power_w);
}

#[tokio::test]
async fn test_stale_registry_is_recollected() {
    let setup = setup();
    let token = CancellationToken::new();

    let stale = BaselineCollections {
        default_params: "gpu_data_default_params_2020-01-01_00_00_00".to_string(),
        default_params_and_min_power_limit: "gpu_data_default_params_and_min_power_limit_2020-01-01_00_00_00".to_string(),
    };
    std::fs::write(
        &setup.config.experiment.baseline_registry,
        serde_json::to_string(&stale).unwrap(),
    )
    .unwrap();

    let baselines = setup.driver.collect_baselines(&token).await.unwrap();
    assert_ne!(baselines, stale);
    assert_eq!(setup.runner.runs().len(), 4);
}

#[tokio::test]
async fn test_apply_point_and_defaults() {
    let setup = setup();

    let applied = setup
        .driver
        .apply_point(ParameterPoint::new(345_000, 100, -200))
        .await
        .unwrap();
    assert_eq!(applied, ParameterPoint::new(345_000, 100, -200));

    // Clamped by the actuator
    let applied = setup
        .driver
        .apply_point(ParameterPoint::new(50_000, 0, 0))
        .await
        .unwrap();
    assert_eq!(applied.power_limit_mw, 340_000);

    let defaults = setup.driver.apply_defaults().await.unwrap();
    assert_eq!(defaults, ParameterPoint::new(350_000, 0, 0));
}

#[tokio::test]
async fn test_validation_needs_a_sweep() {
    let setup = setup();

    assert!(matches!(
        setup.driver.latest_sweep_collection().await,
        Err(ExperimentError::NoSweepCollection { .. })
    ));

    // A sweep collection without FPS values gives nothing to recommend
    let empty = CollectionId::new(&setup.config.store.monitoring_database, "gpu_data_x");
    assert!(matches!(
        setup.driver.recommend(&empty).await,
        Err(ExperimentError::Recommend(_))
    ));
    assert!(!setup.dir.path().join("optimal_params.txt").exists());
}

#[tokio::test]
async fn test_actuator_failure_surfaces() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path());

    let gpu = Arc::new(MockGpu::default().fail_setters());
    let store = Arc::new(MemoryStore::new());
    let runner = Arc::new(FakeRunner::new(gpu.clone(), store.clone()));
    let driver = ExperimentDriver::new(actuator(&gpu), runner.clone(), store, &config);

    let result = driver.default_baseline(&CancellationToken::new()).await;

    assert!(matches!(result, Err(ExperimentError::Remote(_))));
    assert!(runner.runs().is_empty());
}
