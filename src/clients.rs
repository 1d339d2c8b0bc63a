// Handles on the component hosts used by the orchestrator.
//
// The sweep only sees the Actuator and BenchmarkRunner traits, the remote
// clients below implement them over the transport.

use std::{fmt::Display, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};
use tunegpud::{
    actuator::ActuatorService,
    config::{Config, RpcConfig},
    rpc::{RpcClient, TransportError, WireValue},
    sample::{ParameterPoint, RunResult},
    store::CollectionId,
    supervisor::RunPlan,
};

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Device(#[from] anyhow::Error),
    #[error("Unexpected answer to {method}: {answer}")]
    UnexpectedResponse { method: String, answer: WireValue },
}

// Core offset applied by the actuator and the max clock it gives
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CoreClock {
    pub offset_mhz: i32,
    pub max_clock_mhz: u32,
}

// GPU parameters control
#[async_trait]
pub trait Actuator: Send + Sync {
    async fn reduce_tdp(&self, step_mw: u32) -> Result<u32, RemoteError>;
    async fn set_tdp_to_default(&self) -> Result<u32, RemoteError>;
    async fn set_tdp(&self, limit_mw: u32) -> Result<u32, RemoteError>;

    async fn increase_core_offset(&self, step_mhz: i32) -> Result<CoreClock, RemoteError>;
    async fn reset_core_offset(&self) -> Result<CoreClock, RemoteError>;
    async fn set_core_offset(&self, offset_mhz: i32) -> Result<CoreClock, RemoteError>;

    async fn increase_mem_offset(&self, step_mhz: i32) -> Result<i32, RemoteError>;
    async fn reset_mem_offset(&self) -> Result<i32, RemoteError>;
    async fn set_mem_offset(&self, offset_mhz: i32) -> Result<i32, RemoteError>;

    async fn parameter_point(&self) -> Result<ParameterPoint, RemoteError>;
}

// Benchmark runs
#[async_trait]
pub trait BenchmarkRunner: Send + Sync {
    // Select the workload tag used by the following runs
    async fn set_workload(&self, workload: &str) -> Result<(), RemoteError>;

    // Run the workload once with the given point applied, the samples
    // of the run are tagged with it
    async fn run(
        &self,
        collection: &CollectionId,
        point: ParameterPoint,
        plan: RunPlan,
    ) -> Result<RunResult, RemoteError>;

    // Annotate the collection with the FPS of the last run, return the
    // host report
    async fn reconcile(&self, collection: &CollectionId) -> Result<String, RemoteError>;
}

// Actuator host reached over the transport
#[derive(Debug, Clone)]
pub struct ActuatorClient {
    client: RpcClient,
}

impl ActuatorClient {
    pub fn new(client: RpcClient) -> Self {
        Self { client }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(RpcClient::from_config(&config.endpoints.actuator, &config.rpc))
    }

    async fn call_int(&self, method: &str, args: &[&(dyn Display + Sync)]) -> Result<i64, RemoteError> {
        let answer = self.client.call(method, args).await?;

        answer
            .as_i64()
            .ok_or_else(|| unexpected(method, answer.clone()))
    }

    async fn call_limit(&self, method: &str, args: &[&(dyn Display + Sync)]) -> Result<u32, RemoteError> {
        let value = self.call_int(method, args).await?;

        u32::try_from(value).map_err(|_| unexpected(method, WireValue::Int(value)))
    }

    async fn call_offset(&self, method: &str, args: &[&(dyn Display + Sync)]) -> Result<i32, RemoteError> {
        let value = self.call_int(method, args).await?;

        i32::try_from(value).map_err(|_| unexpected(method, WireValue::Int(value)))
    }

    async fn call_core(
        &self,
        method: &str,
        args: &[&(dyn Display + Sync)],
    ) -> Result<CoreClock, RemoteError> {
        let answer = self.client.call(method, args).await?;

        let clock = match answer.as_list() {
            Some([offset, max_clock]) => offset
                .as_i64()
                .and_then(|offset| i32::try_from(offset).ok())
                .zip(max_clock.as_i64().and_then(|clock| u32::try_from(clock).ok()))
                .map(|(offset_mhz, max_clock_mhz)| CoreClock {
                    offset_mhz,
                    max_clock_mhz,
                }),
            _ => None,
        };

        clock.ok_or_else(|| unexpected(method, answer))
    }
}

#[async_trait]
impl Actuator for ActuatorClient {
    async fn reduce_tdp(&self, step_mw: u32) -> Result<u32, RemoteError> {
        self.call_limit("reduce_tdp", &[&step_mw]).await
    }

    async fn set_tdp_to_default(&self) -> Result<u32, RemoteError> {
        self.call_limit("set_tdp_to_default", &[]).await
    }

    async fn set_tdp(&self, limit_mw: u32) -> Result<u32, RemoteError> {
        self.call_limit("set_tdp", &[&limit_mw]).await
    }

    async fn increase_core_offset(&self, step_mhz: i32) -> Result<CoreClock, RemoteError> {
        self.call_core("increase_gpu_clock_offset", &[&step_mhz]).await
    }

    async fn reset_core_offset(&self) -> Result<CoreClock, RemoteError> {
        self.call_core("set_gpu_clock_offset_to_default", &[]).await
    }

    async fn set_core_offset(&self, offset_mhz: i32) -> Result<CoreClock, RemoteError> {
        self.call_core("set_gpu_clock_offset", &[&offset_mhz]).await
    }

    async fn increase_mem_offset(&self, step_mhz: i32) -> Result<i32, RemoteError> {
        self.call_offset("increase_mem_clock_offset", &[&step_mhz]).await
    }

    async fn reset_mem_offset(&self) -> Result<i32, RemoteError> {
        self.call_offset("set_mem_clock_offset_to_default", &[]).await
    }

    async fn set_mem_offset(&self, offset_mhz: i32) -> Result<i32, RemoteError> {
        self.call_offset("set_mem_clock_offset", &[&offset_mhz]).await
    }

    async fn parameter_point(&self) -> Result<ParameterPoint, RemoteError> {
        let answer = self.client.call("get_parameter_point", &[]).await?;

        ParameterPoint::from_wire(&answer).ok_or_else(|| unexpected("get_parameter_point", answer))
    }
}

// The actuator hosted in this process
#[async_trait]
impl Actuator for ActuatorService {
    async fn reduce_tdp(&self, step_mw: u32) -> Result<u32, RemoteError> {
        Ok(ActuatorService::reduce_tdp(self, step_mw).await?)
    }

    async fn set_tdp_to_default(&self) -> Result<u32, RemoteError> {
        Ok(ActuatorService::set_tdp_to_default(self).await?)
    }

    async fn set_tdp(&self, limit_mw: u32) -> Result<u32, RemoteError> {
        Ok(ActuatorService::set_tdp(self, limit_mw).await?)
    }

    async fn increase_core_offset(&self, step_mhz: i32) -> Result<CoreClock, RemoteError> {
        let (offset_mhz, max_clock_mhz) =
            ActuatorService::increase_core_offset(self, step_mhz).await?;

        Ok(CoreClock {
            offset_mhz,
            max_clock_mhz,
        })
    }

    async fn reset_core_offset(&self) -> Result<CoreClock, RemoteError> {
        let (offset_mhz, max_clock_mhz) = ActuatorService::reset_core_offset(self).await?;

        Ok(CoreClock {
            offset_mhz,
            max_clock_mhz,
        })
    }

    async fn set_core_offset(&self, offset_mhz: i32) -> Result<CoreClock, RemoteError> {
        let (offset_mhz, max_clock_mhz) =
            ActuatorService::set_core_offset(self, offset_mhz).await?;

        Ok(CoreClock {
            offset_mhz,
            max_clock_mhz,
        })
    }

    async fn increase_mem_offset(&self, step_mhz: i32) -> Result<i32, RemoteError> {
        Ok(ActuatorService::increase_mem_offset(self, step_mhz).await?)
    }

    async fn reset_mem_offset(&self) -> Result<i32, RemoteError> {
        Ok(ActuatorService::reset_mem_offset(self).await?)
    }

    async fn set_mem_offset(&self, offset_mhz: i32) -> Result<i32, RemoteError> {
        Ok(ActuatorService::set_mem_offset(self, offset_mhz).await?)
    }

    async fn parameter_point(&self) -> Result<ParameterPoint, RemoteError> {
        Ok(ActuatorService::parameter_point(self).await?)
    }
}

// Benchmark host reached over the transport
#[derive(Debug, Clone)]
pub struct BenchmarkClient {
    client: RpcClient,

    // Runs last much longer than the other calls
    run_timeout: Duration,
}

impl BenchmarkClient {
    pub fn new(client: RpcClient, run_timeout: Duration) -> Self {
        Self {
            client,
            run_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let rpc: &RpcConfig = &config.rpc;

        Self::new(
            RpcClient::from_config(&config.endpoints.benchmark, rpc),
            rpc.run_timeout(),
        )
    }

    // A run never answers before all of its one second ticks elapsed
    fn minimum_run_timeout(plan: RunPlan) -> Duration {
        Duration::from_secs(u64::from(plan.total()) + 60)
    }
}

#[async_trait]
impl BenchmarkRunner for BenchmarkClient {
    async fn set_workload(&self, workload: &str) -> Result<(), RemoteError> {
        let answer = self
            .client
            .call("change_benchmark_test_type", &[&workload])
            .await?;

        match answer.as_str() {
            Some(text) if text.ends_with(workload) => {
                info!("{text}");
                Ok(())
            }
            _ => Err(unexpected("change_benchmark_test_type", answer)),
        }
    }

    async fn run(
        &self,
        collection: &CollectionId,
        point: ParameterPoint,
        plan: RunPlan,
    ) -> Result<RunResult, RemoteError> {
        let timeout = self.run_timeout.max(Self::minimum_run_timeout(plan));

        let answer = self
            .client
            .call_with_timeout(
                "run_benchmark",
                &[
                    &collection.name,
                    &plan.before,
                    &plan.during,
                    &plan.after,
                    &collection.database,
                    &point.power_limit_mw,
                    &point.core_clock_offset_mhz,
                    &point.mem_clock_offset_mhz,
                ],
                timeout,
            )
            .await?;

        debug!("run_benchmark answered {answer}");

        RunResult::from_wire(&answer).ok_or_else(|| unexpected("run_benchmark", answer))
    }

    async fn reconcile(&self, collection: &CollectionId) -> Result<String, RemoteError> {
        let answer = self
            .client
            .call(
                "update_fps_and_efficiency_in_collection",
                &[&collection.name, &collection.database],
            )
            .await?;

        match answer {
            WireValue::Str(report) => Ok(report),
            other => Err(unexpected("update_fps_and_efficiency_in_collection", other)),
        }
    }
}

fn unexpected(method: &str, answer: WireValue) -> RemoteError {
    RemoteError::UnexpectedResponse {
        method: method.to_string(),
        answer,
    }
}
