use core::fmt;
use std::{str::FromStr, sync::Arc};

use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::info;

use crate::{
    actuator::ActuatorService,
    benchmark_service::BenchmarkService,
    config::Config,
    errors::TunegpudError,
    gpu_device::{GpuDevice, mock::MockGpu, nvidia_device::NvidiaDevice},
    rpc::{RpcClient, RpcServer, RpcService},
    sensors::SensorsService,
    store::{JsonlStore, SampleStore},
    supervisor::{
        RunSupervisor, process_table::SystemProcessTable,
        workload::CommandLauncher, workload_log::WorkloadLog,
    },
    telemetry::{DeviceTelemetry, RemoteTelemetry, TelemetryProvider},
};

// Component hosted by a daemon process
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Sensors,
    Actuator,
    Benchmark,
    #[default]
    All,
}

impl Component {
    fn hosts(&self, component: Component) -> bool {
        *self == Component::All || *self == component
    }

    fn needs_device(&self) -> bool {
        self.hosts(Component::Sensors) || self.hosts(Component::Actuator)
    }
}

impl FromStr for Component {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sensors" => Ok(Component::Sensors),
            "actuator" => Ok(Component::Actuator),
            "benchmark" => Ok(Component::Benchmark),
            "all" => Ok(Component::All),
            other => Err(format!("Unknown component \"{other}\"")),
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::Sensors => "sensors",
            Component::Actuator => "actuator",
            Component::Benchmark => "benchmark",
            Component::All => "all",
        };

        f.write_str(name)
    }
}

// Bind the servers of the requested components and run them on the
// tracker until the token is cancelled
pub async fn start_components(
    component: Component,
    config: &Config,
    mock: bool,
    tracker: &TaskTracker,
    token: &CancellationToken,
) -> Result<(), TunegpudError> {
    info!("Starting component(s): {component}");

    let device: Option<Arc<dyn GpuDevice>> = if !component.needs_device() {
        None
    } else if mock {
        info!("Using a simulated GPU");
        Some(Arc::new(MockGpu::default()))
    } else {
        Some(Arc::new(NvidiaDevice::first()?))
    };

    if let Some(device) = &device {
        if component.hosts(Component::Sensors) {
            let service = SensorsService::new(device.clone());
            spawn_server(&config.endpoints.sensors, service, tracker, token).await?;
        }

        if component.hosts(Component::Actuator) {
            let service = ActuatorService::new(device.clone());
            spawn_server(&config.endpoints.actuator, service, tracker, token).await?;
        }
    }

    if component.hosts(Component::Benchmark) {
        // Read the sensors directly when they live in this process
        let telemetry: Arc<dyn TelemetryProvider> = match &device {
            Some(device) if component == Component::All => {
                Arc::new(DeviceTelemetry::new(device.clone()))
            }
            _ => Arc::new(RemoteTelemetry::new(
                RpcClient::from_config(&config.endpoints.sensors, &config.rpc),
                config.rpc.sample_timeout(),
            )),
        };

        let store: Arc<dyn SampleStore> = Arc::new(JsonlStore::new(&config.store.data_dir));
        let benchmark = &config.benchmark;

        let supervisor = RunSupervisor::new(
            telemetry,
            Arc::new(CommandLauncher::from_config(benchmark)),
            Arc::new(SystemProcessTable),
            store,
            WorkloadLog::new(&benchmark.log_path, &benchmark.shutdown_marker),
            &benchmark.process_name,
        )
        .with_tick(benchmark.tick());

        let service = BenchmarkService::new(
            supervisor,
            benchmark.clone(),
            &config.store.monitoring_database,
        );
        spawn_server(&config.endpoints.benchmark, service, tracker, token).await?;
    }

    Ok(())
}

async fn spawn_server<S: RpcService>(
    addr: &str,
    service: S,
    tracker: &TaskTracker,
    token: &CancellationToken,
) -> Result<(), TunegpudError> {
    let server = RpcServer::bind(addr).await.map_err(|source| {
        TunegpudError::Bind {
            addr: addr.to_string(),
            source,
        }
    })?;

    let token = token.clone();
    tracker.spawn(async move {
        server.run(Arc::new(service), token).await;
    });

    Ok(())
}
