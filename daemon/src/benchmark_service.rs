use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::{
    config::BenchmarkConfig,
    rpc::{Arity, ProtocolError, Request, RpcService, ServiceError, WireValue},
    sample::ParameterPoint,
    store::CollectionId,
    supervisor::{RunPlan, RunSupervisor, workload::LaunchCommand},
};

#[derive(Debug)]
struct BenchmarkState {
    test_type: String,
}

// Run host: executes benchmark runs one at a time
pub struct BenchmarkService {
    supervisor: RunSupervisor,
    config: BenchmarkConfig,

    // Database used when a call doesn't name one
    default_database: String,

    // Held for the whole duration of a run so runs never overlap
    state: Mutex<BenchmarkState>,
}

impl BenchmarkService {
    pub fn new(
        supervisor: RunSupervisor,
        config: BenchmarkConfig,
        default_database: &str,
    ) -> Self {
        let test_type = config.default_test_type.clone();

        Self {
            supervisor,
            config,
            default_database: default_database.to_string(),
            state: Mutex::new(BenchmarkState { test_type }),
        }
    }

    // The collection name is always the first argument, the database
    // is an optional trailing one
    fn collection(
        &self,
        request: &Request,
        database_index: usize,
    ) -> Result<CollectionId, ProtocolError> {
        let name: String = request.arg(0, "collection name")?;
        let database = request
            .optional_arg(database_index)
            .unwrap_or(&self.default_database);

        Ok(CollectionId::new(database, &name))
    }

    // The point applied by the caller follows the database:
    // power limit, core offset and memory offset
    fn applied_point(request: &Request) -> Result<Option<ParameterPoint>, ProtocolError> {
        if request.optional_arg(5).is_none() {
            return Ok(None);
        }

        Ok(Some(ParameterPoint::new(
            request.arg(5, "power limit")?,
            request.arg(6, "core clock offset")?,
            request.arg(7, "memory clock offset")?,
        )))
    }

    async fn run_benchmark(&self, request: &Request) -> Result<WireValue, ServiceError> {
        let plan = RunPlan::new(
            request.arg(1, "time before start")?,
            request.arg(2, "test running time")?,
            request.arg(3, "time after finish")?,
        );
        let collection = self.collection(request, 4)?;
        let applied = Self::applied_point(request)?;

        let state = self.state.lock().await;
        let command = LaunchCommand::from_config(&self.config, &state.test_type);

        let result = self
            .supervisor
            .run(&collection, &command, &state.test_type, applied, plan)
            .await;

        Ok(result.to_wire())
    }

    async fn change_test_type(&self, request: &Request) -> Result<WireValue, ServiceError> {
        let test_type: String = request.arg(0, "test type")?;
        if test_type.contains(char::is_whitespace) {
            return Err(ProtocolError::BadArgument {
                method: request.method.clone(),
                name: "test type".to_string(),
                value: test_type.clone(),
                reason: "whitespace isn't allowed".to_string(),
            }
            .into());
        }

        self.state.lock().await.test_type = test_type.clone();
        info!("Benchmark: Test type changed to {test_type}");

        Ok(WireValue::from(format!("Benchmark test type changed to {test_type}")))
    }

    async fn update_fps_and_efficiency(
        &self,
        request: &Request,
    ) -> Result<WireValue, ServiceError> {
        let collection = self.collection(request, 1)?;

        // The log belongs to the last run, don't read it while a run writes it
        let _state = self.state.lock().await;

        let report = self
            .supervisor
            .reconcile(&collection)
            .await
            .map_err(anyhow::Error::from)?;

        Ok(WireValue::from(report.to_string()))
    }
}

#[async_trait]
impl RpcService for BenchmarkService {
    fn name(&self) -> &'static str {
        "Benchmark"
    }

    fn arity(&self, method: &str) -> Option<Arity> {
        match method {
            "run_benchmark" => Some(Arity::range(4, 8)),
            "change_benchmark_test_type" => Some(Arity::exact(1)),
            "update_fps_and_efficiency_in_collection" => Some(Arity::range(1, 2)),
            "get_benchmark_test_type" => Some(Arity::exact(0)),
            _ => None,
        }
    }

    async fn call(&self, request: &Request) -> Result<WireValue, ServiceError> {
        match request.method.as_str() {
            "run_benchmark" => self.run_benchmark(request).await,
            "change_benchmark_test_type" => self.change_test_type(request).await,
            "update_fps_and_efficiency_in_collection" => {
                self.update_fps_and_efficiency(request).await
            }
            "get_benchmark_test_type" => {
                Ok(WireValue::from(self.state.lock().await.test_type.clone()))
            }
            _ => Ok(WireValue::from(format!("Unknown method {}", request.method))),
        }
    }
}
