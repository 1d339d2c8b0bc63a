use std::{
    fs::File,
    io::{self, BufReader},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to open Json configuration file {path:?}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse Json configuration file {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid configuration file {path:?}: {field} {reason}")]
    Invalid {
        path: PathBuf,
        field: &'static str,
        reason: &'static str,
    },
}

// Configuration shared by the component hosts and the orchestrator.
// Every section and field is optional in the file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub endpoints: EndpointsConfig,
    pub rpc: RpcConfig,
    pub benchmark: BenchmarkConfig,
    pub timing: TimingConfig,
    pub sweep: SweepConfig,
    pub store: StoreConfig,
    pub experiment: ExperimentConfig,
}

impl Config {
    // Load the configuration file, a missing file gives the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!("Parsing config file at: {:?}", path);

        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!("Configuration file {:?} not found, using defaults", path);

                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Open {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let buf = BufReader::new(file);

        let config: Self = serde_json::from_reader(buf).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.validate().map_err(|(field, reason)| ConfigError::Invalid {
            path: path.to_path_buf(),
            field,
            reason,
        })?;

        Ok(config)
    }

    // Values that would stall the sweep or the run ticker
    fn validate(&self) -> Result<(), (&'static str, &'static str)> {
        if self.benchmark.tick_ms == 0 {
            return Err(("benchmark.tick_ms", "must be positive"));
        }
        if self.sweep.power_step_mw == 0 {
            return Err(("sweep.power_step_mw", "must be positive"));
        }
        if self.sweep.core_step_mhz <= 0 {
            return Err(("sweep.core_step_mhz", "must be positive"));
        }
        if self.sweep.mem_step_mhz <= 0 {
            return Err(("sweep.mem_step_mhz", "must be positive"));
        }

        Ok(())
    }
}

// Addresses of the component hosts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    pub sensors: String,
    pub benchmark: String,
    pub actuator: String,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            sensors: "127.0.0.1:1234".to_string(),
            benchmark: "127.0.0.1:1235".to_string(),
            actuator: "127.0.0.1:1236".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    // Timeout of the calls that answer right away
    pub call_timeout_secs: u64,
    // Timeout of a telemetry sample request made by the run host
    pub sample_timeout_secs: u64,
    // Timeout of a whole benchmark run
    pub run_timeout_secs: u64,

    pub retry_interval_ms: u64,
    pub max_connect_attempts: Option<u32>,
}

impl RpcConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn sample_timeout(&self) -> Duration {
        Duration::from_secs(self.sample_timeout_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: 120,
            sample_timeout_secs: 5,
            run_timeout_secs: 1800,
            retry_interval_ms: 1000,
            max_connect_attempts: None,
        }
    }
}

// How the workload is started, stopped and checked
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkConfig {
    pub program: PathBuf,
    // Arguments, "{test}" is replaced by the workload tag
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,

    pub log_path: PathBuf,
    pub shutdown_marker: String,

    // Executable name looked up in the process list after a run
    pub process_name: String,

    // Command run to stop the workload gracefully, the workload
    // is sent an interrupt signal when it is not set
    pub stop_command: Option<Vec<String>>,

    pub default_test_type: String,

    pub tick_ms: u64,
    pub terminate_timeout_secs: u64,
}

impl BenchmarkConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        let folder = PathBuf::from("C:\\Program Files\\Geeks3D\\MSI Kombustor 4 x64");

        Self {
            program: folder.join("MSI-Kombustor-x64.exe"),
            args: [
                "-width=1920",
                "-height=1080",
                "-{test}",
                "-benchmark",
                "-fullscreen",
                "-log_gpu_data",
                "-logfile_in_app_folder",
            ]
            .iter()
            .map(|arg| arg.to_string())
            .collect(),
            working_dir: Some(folder.clone()),
            log_path: folder.join("_kombustor_log.txt"),
            shutdown_marker: "Kombustor shutdown ok.".to_string(),
            process_name: "MSI-Kombustor-x64.exe".to_string(),
            stop_command: None,
            default_test_type: "glfurrytorus".to_string(),
            tick_ms: 1000,
            terminate_timeout_secs: 10,
        }
    }
}

// Number of ticks spent before, during and after the workload
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub before: u32,
    pub during: u32,
    pub after: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            before: 5,
            during: 30,
            after: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub power_step_mw: u32,
    pub core_step_mhz: i32,
    pub mem_step_mhz: i32,

    // Offsets reaching these values end their dimension. They are set
    // by hand from previous runs to avoid crashing the GPU again
    pub core_ceiling_mhz: Option<i32>,
    pub mem_ceiling_mhz: Option<i32>,

    pub workloads: Vec<String>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            power_step_mw: 5000,
            core_step_mhz: 50,
            mem_step_mhz: 200,
            core_ceiling_mhz: Some(250),
            mem_ceiling_mhz: Some(650),
            workloads: [
                "glfurrytorus",
                "glfurrymsi",
                "glmsi01",
                "glmsi02gpumedium",
                "glphongdonut",
                "glpbrdonut",
                "gltessyspherex32",
            ]
            .iter()
            .map(|name| name.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,

    // Database receiving the sweep samples
    pub monitoring_database: String,
    // Database receiving the baseline and validation samples
    pub comparison_database: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            monitoring_database: "gpu_benchmark_monitoring".to_string(),
            comparison_database: "gpu_benchmark_comparison".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    // Collection name prefixes, a timestamp is appended to each of them
    pub sweep_collection: String,
    pub default_baseline_collection: String,
    pub min_power_baseline_collection: String,
    pub found_params_collection: String,

    // File remembering the names of the baseline collections
    pub baseline_registry: PathBuf,
    pub optimal_params_path: PathBuf,

    // Weight of the power draw against the performance when scoring
    pub alpha: f64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            sweep_collection: "gpu_data".to_string(),
            default_baseline_collection: "gpu_data_default_params".to_string(),
            min_power_baseline_collection:
                "gpu_data_default_params_and_min_power_limit".to_string(),
            found_params_collection: "gpu_data_found_params".to_string(),
            baseline_registry: PathBuf::from("comparison_collections.json"),
            optimal_params_path: PathBuf::from("optimal_params.txt"),
            alpha: 0.5,
        }
    }
}
