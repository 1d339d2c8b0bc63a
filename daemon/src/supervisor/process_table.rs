use std::io;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

// Lookup of processes by executable name in the OS process list
#[async_trait]
pub trait ProcessTable: Send + Sync {
    async fn is_running(&self, name: &str) -> io::Result<bool>;

    // Force kill every process with the given name
    async fn kill_all(&self, name: &str) -> io::Result<()>;
}

// Query the system process list with the platform tools
#[derive(Debug, Default)]
pub struct SystemProcessTable;

#[cfg(not(windows))]
#[async_trait]
impl ProcessTable for SystemProcessTable {
    async fn is_running(&self, name: &str) -> io::Result<bool> {
        let status = Command::new("pgrep").args(["-f", name]).output().await?.status;

        // pgrep exits with 1 when nothing matched
        match status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(io::Error::other(format!("pgrep failed with {status}"))),
        }
    }

    async fn kill_all(&self, name: &str) -> io::Result<()> {
        let status = Command::new("pkill").args(["-KILL", "-f", name]).status().await?;
        debug!("pkill {} exited with {}", name, status);

        Ok(())
    }
}

#[cfg(windows)]
#[async_trait]
impl ProcessTable for SystemProcessTable {
    async fn is_running(&self, name: &str) -> io::Result<bool> {
        let filter = format!("IMAGENAME eq {name}");
        let output = Command::new("tasklist")
            .args(["/FI", filter.as_str(), "/NH"])
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_lowercase();

        Ok(stdout.contains(&name.to_lowercase()))
    }

    async fn kill_all(&self, name: &str) -> io::Result<()> {
        let status = Command::new("taskkill")
            .args(["/F", "/IM", name])
            .status()
            .await?;
        debug!("taskkill {} exited with {}", name, status);

        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_process_is_not_running() {
        let table = SystemProcessTable;

        let running = table
            .is_running("tunegpud-no-such-process-name-7d1f")
            .await;

        // pgrep may be missing on minimal systems
        if let Ok(running) = running {
            assert!(!running);
        }
    }
}
