use std::path::PathBuf;

use argparse::{ArgumentParser, Print, Store, StoreTrue};

use crate::host::Component;

pub struct ArgsOptions {
    pub config_file_path: PathBuf,
    pub component: Component,
    pub mock: bool,
}

impl ArgsOptions {
    pub fn parse() -> Self {
        let mut options = ArgsOptions::default();

        {
            let mut parser = ArgumentParser::new();
            parser.set_description("Host the GPU tuning components");

            // Configuration file path
            parser.refer(&mut options.config_file_path).add_option(
                &["-c", "--config"],
                Store,
                "The file path of the configuration file",
            );

            parser.refer(&mut options.component).add_option(
                &["--component"],
                Store,
                "Component to host: sensors, actuator, benchmark or all",
            );

            parser.refer(&mut options.mock).add_option(
                &["--mock"],
                StoreTrue,
                "Use a simulated GPU instead of NVML",
            );

            // Show daemon version
            parser.add_option(
                &["-V", "--version"],
                Print(env!("CARGO_PKG_VERSION").to_string()),
                "Show the daemon version",
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
            component: Component::All,
            mock: false,
        }
    }
}
