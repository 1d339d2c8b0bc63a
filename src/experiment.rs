// Experiments built on top of the sweep: the full sweep of every workload,
// the baselines at default parameters and the validation of the point
// picked by the recommender.

use std::{io, path::PathBuf, sync::Arc};

use chrono::Local;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tunegpud::{
    config::{Config, ExperimentConfig, StoreConfig},
    sample::ParameterPoint,
    store::{CollectionId, SampleStore, StoreError},
};

use crate::{
    clients::{Actuator, BenchmarkRunner, RemoteError},
    recommender::{
        CollectionSummary, EfficiencyRecommender, OptimalParams, OptimalParamsError,
        RecommendError, Recommender,
    },
    sweep::{SweepController, SweepError, SweepSettings, report::SweepReport},
};

// Suffix appended to collection names, safe to use in file names
const COLLECTION_SUFFIX_FORMAT: &str = "%Y-%m-%d_%H_%M_%S";

#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Sweep(#[from] SweepError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Recommend(#[from] RecommendError),
    #[error(transparent)]
    OptimalParams(#[from] OptimalParamsError),
    #[error("Failed to write the baseline registry {path:?}")]
    Registry {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to encode the baseline registry {path:?}")]
    RegistryEncode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("No \"{prefix}\" collection found in database {database}")]
    NoSweepCollection { database: String, prefix: String },
    #[error("Experiment cancelled")]
    Cancelled,
}

// Names of the baseline collections, kept in the registry file so that
// baselines are only collected once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineCollections {
    pub default_params: String,
    pub default_params_and_min_power_limit: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    pub recommended: ParameterPoint,
    // What the actuator actually applied
    pub applied: ParameterPoint,
    pub collection: CollectionId,
    pub stable_runs: usize,
}

pub struct ExperimentDriver {
    actuator: Arc<dyn Actuator>,
    runner: Arc<dyn BenchmarkRunner>,
    store: Arc<dyn SampleStore>,
    recommender: Arc<dyn Recommender>,

    settings: SweepSettings,
    workloads: Vec<String>,

    store_config: StoreConfig,
    config: ExperimentConfig,
}

impl ExperimentDriver {
    pub fn new(
        actuator: Arc<dyn Actuator>,
        runner: Arc<dyn BenchmarkRunner>,
        store: Arc<dyn SampleStore>,
        config: &Config,
    ) -> Self {
        Self {
            actuator,
            runner,
            store,
            recommender: Arc::new(EfficiencyRecommender::new(config.experiment.alpha)),
            settings: SweepSettings::from_config(&config.sweep, config.timing),
            workloads: config.sweep.workloads.clone(),
            store_config: config.store.clone(),
            config: config.experiment.clone(),
        }
    }

    pub fn with_recommender(mut self, recommender: Arc<dyn Recommender>) -> Self {
        self.recommender = recommender;
        self
    }

    pub fn workloads(&self) -> &[String] {
        &self.workloads
    }

    // Sweep every workload in order into one new monitoring collection.
    // The GPU is back at its defaults afterwards, whatever the outcome
    pub async fn full_sweep(
        &self,
        token: &CancellationToken,
    ) -> Result<(CollectionId, Vec<SweepReport>), ExperimentError> {
        let collection = CollectionId::new(
            &self.store_config.monitoring_database,
            &timestamped(&self.config.sweep_collection),
        );
        info!("Experiment: Full sweep into {collection}");

        let result = self.sweep_workloads(&collection, token).await;
        let reports = self.restore_defaults(result).await?;

        Ok((collection, reports))
    }

    // Run every workload once at the default parameters
    pub async fn default_baseline(
        &self,
        token: &CancellationToken,
    ) -> Result<CollectionId, ExperimentError> {
        let collection = self.comparison_collection(&self.config.default_baseline_collection);
        info!("Experiment: Default parameters baseline into {collection}");

        let result = self.run_at_defaults(&collection, token).await;
        self.restore_defaults(result).await?;

        Ok(collection)
    }

    // Run every workload once at the default offsets and the minimum
    // power limit, then restore the default limit
    pub async fn min_power_baseline(
        &self,
        token: &CancellationToken,
    ) -> Result<CollectionId, ExperimentError> {
        let collection = self.comparison_collection(&self.config.min_power_baseline_collection);
        info!("Experiment: Minimum power limit baseline into {collection}");

        let result = self.run_at_min_power(&collection, token).await;
        self.restore_defaults(result).await?;

        Ok(collection)
    }

    // Collect both baselines unless the registry names collections that
    // still exist
    pub async fn collect_baselines(
        &self,
        token: &CancellationToken,
    ) -> Result<BaselineCollections, ExperimentError> {
        if let Some(baselines) = self.registered_baselines().await? {
            info!("Experiment: Baselines were collected before, skipping them");
            return Ok(baselines);
        }

        let default_params = self.default_baseline(token).await?;
        let min_power = self.min_power_baseline(token).await?;

        let baselines = BaselineCollections {
            default_params: default_params.name,
            default_params_and_min_power_limit: min_power.name,
        };
        self.register_baselines(&baselines).await?;

        Ok(baselines)
    }

    // Most recent sweep collection of the monitoring database
    pub async fn latest_sweep_collection(&self) -> Result<CollectionId, ExperimentError> {
        let database = &self.store_config.monitoring_database;
        let prefix = format!("{}_", self.config.sweep_collection);

        // The timestamp suffix sorts in chronological order
        let latest = self
            .store
            .list(database)
            .await?
            .into_iter()
            .filter(|name| name.starts_with(&prefix))
            .max()
            .ok_or_else(|| ExperimentError::NoSweepCollection {
                database: database.clone(),
                prefix: self.config.sweep_collection.clone(),
            })?;

        Ok(CollectionId::new(database, &latest))
    }

    pub async fn recommend(&self, sweep: &CollectionId) -> Result<ParameterPoint, ExperimentError> {
        let samples = self.store.load(sweep).await?;
        debug!("Experiment: {} samples in {sweep}", samples.len());

        Ok(self.recommender.recommend(&samples)?)
    }

    // Save the recommended point, apply it and run every workload with it
    pub async fn validate_recommendation(
        &self,
        sweep: &CollectionId,
        token: &CancellationToken,
    ) -> Result<ValidationOutcome, ExperimentError> {
        let recommended = self.recommend(sweep).await?;
        OptimalParams::from(recommended)
            .save(&self.config.optimal_params_path)
            .await?;

        let applied = self.apply_point(recommended).await?;
        if applied != recommended {
            warn!("Experiment: Recommended {recommended} but the GPU accepted {applied}");
        }

        let collection = self.comparison_collection(&self.config.found_params_collection);
        info!("Experiment: Found parameters runs into {collection}");
        let stable_runs = self.run_each_workload(&collection, token).await?;

        Ok(ValidationOutcome {
            recommended,
            applied,
            collection,
            stable_runs,
        })
    }

    // Averages of the baselines and the validation collection, in that order
    pub async fn compare(
        &self,
        baselines: &BaselineCollections,
        found: &CollectionId,
    ) -> Result<Vec<CollectionSummary>, ExperimentError> {
        let database = &self.store_config.comparison_database;
        let collections = [
            CollectionId::new(database, &baselines.default_params),
            CollectionId::new(database, &baselines.default_params_and_min_power_limit),
            found.clone(),
        ];

        let mut summaries = Vec::with_capacity(collections.len());
        for collection in collections.iter() {
            let samples = self.store.load(collection).await?;

            match CollectionSummary::from_samples(&collection.name, &samples) {
                Some(summary) => summaries.push(summary),
                None => warn!("Experiment: No FPS values in {collection}"),
            }
        }

        Ok(summaries)
    }

    pub async fn apply_defaults(&self) -> Result<ParameterPoint, ExperimentError> {
        let limit = self.actuator.set_tdp_to_default().await?;
        let core = self.actuator.reset_core_offset().await?;
        let mem = self.actuator.reset_mem_offset().await?;

        Ok(ParameterPoint::new(limit, core.offset_mhz, mem))
    }

    pub async fn apply_point(&self, point: ParameterPoint) -> Result<ParameterPoint, ExperimentError> {
        let limit = self.actuator.set_tdp(point.power_limit_mw).await?;
        let core = self
            .actuator
            .set_core_offset(point.core_clock_offset_mhz)
            .await?;
        let mem = self
            .actuator
            .set_mem_offset(point.mem_clock_offset_mhz)
            .await?;

        Ok(ParameterPoint::new(limit, core.offset_mhz, mem))
    }

    async fn sweep_workloads(
        &self,
        collection: &CollectionId,
        token: &CancellationToken,
    ) -> Result<Vec<SweepReport>, ExperimentError> {
        let mut reports = Vec::with_capacity(self.workloads.len());

        for workload in self.workloads.iter() {
            let controller = SweepController::new(
                self.actuator.clone(),
                self.runner.clone(),
                self.settings,
                collection.clone(),
                workload,
            );

            reports.push(controller.run(token).await?);
        }

        Ok(reports)
    }

    async fn run_at_defaults(
        &self,
        collection: &CollectionId,
        token: &CancellationToken,
    ) -> Result<usize, ExperimentError> {
        self.apply_defaults().await?;

        self.run_each_workload(collection, token).await
    }

    async fn run_at_min_power(
        &self,
        collection: &CollectionId,
        token: &CancellationToken,
    ) -> Result<usize, ExperimentError> {
        let defaults = self.apply_defaults().await?;
        let min = self.reduce_to_min(defaults.power_limit_mw).await?;
        info!("Experiment: Minimum power limit {} W", f64::from(min) / 1000.0);

        self.run_each_workload(collection, token).await
    }

    // Put the GPU back at its defaults and hand back the result of what ran
    // before. A failure to restore is only logged
    async fn restore_defaults<T>(
        &self,
        result: Result<T, ExperimentError>,
    ) -> Result<T, ExperimentError> {
        match self.apply_defaults().await {
            Ok(point) => info!("Experiment: GPU restored to {point}"),
            Err(err) => error!("Experiment: Failed to restore the default parameters: {err}"),
        }

        result
    }

    async fn reduce_to_min(&self, mut limit: u32) -> Result<u32, ExperimentError> {
        loop {
            let reduced = self.actuator.reduce_tdp(self.settings.power_step_mw).await?;
            if reduced == limit {
                return Ok(limit);
            }

            limit = reduced;
        }
    }

    // One run per workload, stable runs get their FPS reconciled.
    // Return the number of stable runs
    async fn run_each_workload(
        &self,
        collection: &CollectionId,
        token: &CancellationToken,
    ) -> Result<usize, ExperimentError> {
        let mut stable_runs = 0;

        // Every run of the experiment happens at the point applied before
        let point = self.actuator.parameter_point().await?;

        for workload in self.workloads.iter() {
            if token.is_cancelled() {
                info!("Experiment: Quiting");
                return Err(ExperimentError::Cancelled);
            }

            self.runner.set_workload(workload).await?;
            let result = self
                .runner
                .run(collection, point, self.settings.plan)
                .await?;

            if !result.is_stable() {
                warn!("Experiment: {workload} run was unstable: {:?}", result);
                continue;
            }

            stable_runs += 1;
            let report = self.runner.reconcile(collection).await?;
            info!("Experiment: {workload}: {report}");
        }

        Ok(stable_runs)
    }

    fn comparison_collection(&self, name: &str) -> CollectionId {
        CollectionId::new(&self.store_config.comparison_database, &timestamped(name))
    }

    // Baselines named by the registry, if all of them are in the store
    async fn registered_baselines(&self) -> Result<Option<BaselineCollections>, ExperimentError> {
        let path = &self.config.baseline_registry;

        let text = match fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ExperimentError::Registry {
                    path: path.clone(),
                    source,
                });
            }
        };

        let baselines: BaselineCollections = match serde_json::from_str(&text) {
            Ok(baselines) => baselines,
            Err(err) => {
                warn!("Experiment: Ignoring invalid baseline registry {:?}: {err}", path);
                return Ok(None);
            }
        };

        let database = &self.store_config.comparison_database;
        for name in [
            &baselines.default_params,
            &baselines.default_params_and_min_power_limit,
        ] {
            if !self.store.contains(&CollectionId::new(database, name)).await? {
                warn!("Experiment: Registered baseline {name} is missing from {database}");
                return Ok(None);
            }
        }

        Ok(Some(baselines))
    }

    async fn register_baselines(&self, baselines: &BaselineCollections) -> Result<(), ExperimentError> {
        let path = &self.config.baseline_registry;

        let text = serde_json::to_string_pretty(baselines).map_err(|source| {
            ExperimentError::RegistryEncode {
                path: path.clone(),
                source,
            }
        })?;

        fs::write(path, text)
            .await
            .map_err(|source| ExperimentError::Registry {
                path: path.clone(),
                source,
            })?;

        debug!("Experiment: Baselines registered in {:?}", path);

        Ok(())
    }
}

// Collection name followed by the current local time
pub fn timestamped(name: &str) -> String {
    format!("{name}_{}", Local::now().format(COLLECTION_SUFFIX_FORMAT))
}
