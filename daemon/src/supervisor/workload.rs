use core::fmt;
use std::{io, path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    process::{Child, Command},
    time::timeout,
};
use tracing::{debug, warn};

use crate::config::BenchmarkConfig;

// Placeholder replaced by the workload tag in the configured arguments
const TEST_PLACEHOLDER: &str = "{test}";

#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("Failed to start {program:?}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to signal the workload")]
    Signal(#[source] io::Error),
    #[error("Failed to wait for the workload to exit")]
    Wait(#[source] io::Error),
    #[error("Stop command {command:?} failed: {reason}")]
    StopCommand { command: Vec<String>, reason: String },
}

// Fully resolved command line of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl LaunchCommand {
    pub fn from_config(config: &BenchmarkConfig, test_type: &str) -> Self {
        Self {
            program: config.program.clone(),
            args: config
                .args
                .iter()
                .map(|arg| arg.replace(TEST_PLACEHOLDER, test_type))
                .collect(),
            working_dir: config.working_dir.clone(),
        }
    }
}

impl fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.program.display())?;
        for arg in self.args.iter() {
            write!(f, " {arg}")?;
        }

        Ok(())
    }
}

// Starts workloads
#[async_trait]
pub trait WorkloadLauncher: Send + Sync {
    async fn start(
        &self,
        command: &LaunchCommand,
    ) -> Result<Box<dyn RunningWorkload>, WorkloadError>;
}

// Handle on a started workload
#[async_trait]
pub trait RunningWorkload: Send {
    fn id(&self) -> Option<u32>;

    // Ask the workload to finish its test and exit on its own
    async fn request_graceful_stop(&mut self) -> Result<(), WorkloadError>;

    // Stop the workload and wait for it to exit
    async fn terminate(&mut self) -> Result<(), WorkloadError>;
}

// How the workload is asked to stop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GracefulStop {
    // Send an interrupt signal, only available on unix
    Interrupt,
    // Run an external command
    Command(Vec<String>),
}

// Launch the workload as a child process
pub struct CommandLauncher {
    graceful_stop: GracefulStop,
    terminate_timeout: Duration,
}

impl CommandLauncher {
    pub fn new(graceful_stop: GracefulStop, terminate_timeout: Duration) -> Self {
        Self {
            graceful_stop,
            terminate_timeout,
        }
    }

    pub fn from_config(config: &BenchmarkConfig) -> Self {
        let graceful_stop = match &config.stop_command {
            Some(command) if !command.is_empty() => {
                GracefulStop::Command(command.clone())
            }
            _ => GracefulStop::Interrupt,
        };

        Self::new(graceful_stop, config.terminate_timeout())
    }
}

#[async_trait]
impl WorkloadLauncher for CommandLauncher {
    async fn start(
        &self,
        command: &LaunchCommand,
    ) -> Result<Box<dyn RunningWorkload>, WorkloadError> {
        let mut process = Command::new(&command.program);
        process
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        if let Some(dir) = &command.working_dir {
            process.current_dir(dir);
        }

        let child = process.spawn().map_err(|source| WorkloadError::Spawn {
            program: command.program.clone(),
            source,
        })?;

        debug!("Started workload {} with pid {:?}", command, child.id());

        Ok(Box::new(ChildWorkload {
            child,
            graceful_stop: self.graceful_stop.clone(),
            terminate_timeout: self.terminate_timeout,
        }))
    }
}

struct ChildWorkload {
    child: Child,
    graceful_stop: GracefulStop,
    terminate_timeout: Duration,
}

impl ChildWorkload {
    fn has_exited(&mut self) -> Result<bool, WorkloadError> {
        Ok(self.child.try_wait().map_err(WorkloadError::Wait)?.is_some())
    }

    #[cfg(unix)]
    fn send_signal(&self, signal: nix::sys::signal::Signal) -> Result<(), WorkloadError> {
        use nix::unistd::Pid;

        // The pid is gone once the child has been reaped
        let Some(pid) = self.child.id() else {
            return Ok(());
        };

        nix::sys::signal::kill(Pid::from_raw(pid as i32), signal)
            .map_err(|errno| WorkloadError::Signal(io::Error::from(errno)))
    }
}

#[async_trait]
impl RunningWorkload for ChildWorkload {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn request_graceful_stop(&mut self) -> Result<(), WorkloadError> {
        if self.has_exited()? {
            debug!("Workload already exited before the stop request");
            return Ok(());
        }

        match &self.graceful_stop {
            GracefulStop::Interrupt => {
                #[cfg(unix)]
                self.send_signal(nix::sys::signal::Signal::SIGINT)?;

                #[cfg(not(unix))]
                warn!("Interrupt signals aren't supported, configure a stop command");

                Ok(())
            }
            GracefulStop::Command(command) => {
                let Some((program, args)) = command.split_first() else {
                    return Err(WorkloadError::StopCommand {
                        command: command.clone(),
                        reason: "empty command".to_string(),
                    });
                };

                let status = Command::new(program)
                    .args(args)
                    .stdin(Stdio::null())
                    .status()
                    .await
                    .map_err(|err| WorkloadError::StopCommand {
                        command: command.clone(),
                        reason: err.to_string(),
                    })?;

                if !status.success() {
                    return Err(WorkloadError::StopCommand {
                        command: command.clone(),
                        reason: status.to_string(),
                    });
                }

                Ok(())
            }
        }
    }

    async fn terminate(&mut self) -> Result<(), WorkloadError> {
        if self.has_exited()? {
            return Ok(());
        }

        #[cfg(unix)]
        {
            if let Err(err) = self.send_signal(nix::sys::signal::Signal::SIGTERM) {
                warn!("Failed to send SIGTERM: {err}");
            }

            if let Ok(status) = timeout(self.terminate_timeout, self.child.wait()).await {
                let status = status.map_err(WorkloadError::Wait)?;
                debug!("Workload exited with {status}");

                return Ok(());
            }

            warn!("Workload didn't exit after {:?}, forcing kill", self.terminate_timeout);
        }

        self.child.kill().await.map_err(WorkloadError::Wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_type_substitution() {
        let config = BenchmarkConfig::default();
        let command = LaunchCommand::from_config(&config, "glpbrdonut");

        assert!(command.args.contains(&"-glpbrdonut".to_string()));
        assert!(command.args.iter().all(|arg| !arg.contains(TEST_PLACEHOLDER)));
        assert!(command.to_string().ends_with(
            "-width=1920 -height=1080 -glpbrdonut -benchmark -fullscreen -log_gpu_data -logfile_in_app_folder"
        ));
    }

    #[test]
    fn test_empty_stop_command_falls_back_to_interrupt() {
        let config = BenchmarkConfig {
            stop_command: Some(vec![]),
            ..Default::default()
        };

        let launcher = CommandLauncher::from_config(&config);
        assert_eq!(launcher.graceful_stop, GracefulStop::Interrupt);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_long_running_child() {
        let launcher = CommandLauncher::new(
            GracefulStop::Interrupt,
            Duration::from_secs(5),
        );
        let command = LaunchCommand {
            program: PathBuf::from("sleep"),
            args: vec!["30".to_string()],
            working_dir: None,
        };

        let mut workload = launcher.start(&command).await.unwrap();
        assert!(workload.id().is_some());

        workload.terminate().await.unwrap();
        // Terminating twice is harmless
        workload.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_program() {
        let launcher = CommandLauncher::new(
            GracefulStop::Interrupt,
            Duration::from_secs(1),
        );
        let command = LaunchCommand {
            program: PathBuf::from("/nonexistent/workload-binary"),
            args: vec![],
            working_dir: None,
        };

        assert!(matches!(
            launcher.start(&command).await,
            Err(WorkloadError::Spawn { .. })
        ));
    }
}
