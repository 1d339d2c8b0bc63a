use std::{
    io,
    path::{Path, PathBuf},
};

use tokio::fs;

const FPS_TAG: &str = " - FPS: ";

// One performance line of the workload log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FpsEntry {
    // Wall clock time formatted as HH:MM:SS
    pub time: String,
    pub fps: u32,
}

// Log file written by the workload
#[derive(Debug, Clone)]
pub struct WorkloadLog {
    path: PathBuf,
    shutdown_marker: String,
}

impl WorkloadLog {
    pub fn new(path: impl Into<PathBuf>, shutdown_marker: &str) -> Self {
        Self {
            path: path.into(),
            shutdown_marker: shutdown_marker.to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // The marker line is only written when the workload shut down cleanly
    pub async fn has_shutdown_marker(&self) -> io::Result<bool> {
        let text = self.read().await?;

        Ok(text.lines().any(|line| line.contains(&self.shutdown_marker)))
    }

    pub async fn fps_entries(&self) -> io::Result<Vec<FpsEntry>> {
        let text = self.read().await?;

        Ok(text.lines().filter_map(parse_fps_line).collect())
    }

    // The log encoding isn't specified, invalid bytes are replaced
    async fn read(&self) -> io::Result<String> {
        let bytes = fs::read(&self.path).await?;

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

// Parse a line of the form "(HH:MM:SS<anything> - FPS: <n>"
pub fn parse_fps_line(line: &str) -> Option<FpsEntry> {
    line.match_indices('(')
        .find_map(|(start, _)| parse_from_paren(&line[start + 1..]))
}

fn parse_from_paren(text: &str) -> Option<FpsEntry> {
    let time = text.get(..8)?;
    if !is_time(time) {
        return None;
    }

    // At least one character separates the time from the FPS tag,
    // the last tag followed by digits wins
    let rest = &text[8..];
    rest.rmatch_indices(FPS_TAG)
        .filter(|(i, _)| *i >= 1)
        .find_map(|(i, _)| {
            let digits: String = rest[i + FPS_TAG.len()..]
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();

            digits.parse().ok()
        })
        .map(|fps| FpsEntry {
            time: time.to_string(),
            fps,
        })
}

fn is_time(text: &str) -> bool {
    text.bytes().enumerate().all(|(i, b)| match i {
        2 | 5 => b == b':',
        _ => b.is_ascii_digit(),
    }) && text.len() == 8
}
