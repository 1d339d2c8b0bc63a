use core::fmt;
use std::{path::PathBuf, str::FromStr};

use argparse::{ArgumentParser, Print, Store, StoreOption};

// Experiment to execute
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    // Sweep the parameters of every workload
    #[default]
    Sweep,
    // Collect the default parameters baselines
    Baseline,
    // Validate the recommended point of a sweep
    Validate,
    // Baselines, validation and comparison in one go
    Analyse,
    ApplyDefaults,
    ApplyOptimal,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sweep" => Ok(Command::Sweep),
            "baseline" => Ok(Command::Baseline),
            "validate" => Ok(Command::Validate),
            "analyse" | "analyze" => Ok(Command::Analyse),
            "apply-defaults" => Ok(Command::ApplyDefaults),
            "apply-optimal" => Ok(Command::ApplyOptimal),
            other => Err(format!("Unknown command \"{other}\"")),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Sweep => "sweep",
            Command::Baseline => "baseline",
            Command::Validate => "validate",
            Command::Analyse => "analyse",
            Command::ApplyDefaults => "apply-defaults",
            Command::ApplyOptimal => "apply-optimal",
        };

        f.write_str(name)
    }
}

pub struct ArgsOptions {
    pub config_file_path: PathBuf,
    pub command: Command,
    // Sweep collection to analyse instead of the latest one
    pub collection: Option<String>,
}

impl ArgsOptions {
    pub fn parse() -> Self {
        let mut options = ArgsOptions::default();

        {
            let mut parser = ArgumentParser::new();
            parser.set_description("Find the most efficient stable GPU power and clock settings");

            // Configuration file path
            parser.refer(&mut options.config_file_path).add_option(
                &["-c", "--config"],
                Store,
                "The file path of the configuration file",
            );

            parser.refer(&mut options.collection).add_option(
                &["--collection"],
                StoreOption,
                "Sweep collection used by validate and analyse",
            );

            parser.refer(&mut options.command).add_argument(
                "command",
                Store,
                "sweep, baseline, validate, analyse, apply-defaults or apply-optimal",
            );

            // Show version
            parser.add_option(
                &["-V", "--version"],
                Print(env!("CARGO_PKG_VERSION").to_string()),
                "Show the version",
            );

            parser.parse_args_or_exit();
        }

        options
    }
}

impl Default for ArgsOptions {
    fn default() -> Self {
        Self {
            config_file_path: PathBuf::from("tunegpu/config.json"),
            command: Command::default(),
            collection: None,
        }
    }
}
