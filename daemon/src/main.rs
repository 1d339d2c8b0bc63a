use anyhow::Result;
use tokio::signal::ctrl_c;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tunegpud::{arg_parser::ArgsOptions, config::Config, host, logger};

#[tokio::main]
async fn main() -> Result<()> {
    logger::init_logging();

    // Parse the command line arguments
    let args_options = ArgsOptions::parse();
    let config = Config::load(&args_options.config_file_path)?;

    // This token and tracker will be used to handle graceful shutdown
    let tracker = TaskTracker::new();
    let token = CancellationToken::new();

    host::start_components(
        args_options.component,
        &config,
        args_options.mock,
        &tracker,
        &token,
    )
    .await?;

    // TODO: Handle SIGTERM as well for service managers
    ctrl_c().await?;

    // Cancel the token to communicate the program
    // termination to the running tasks
    token.cancel();

    // Wait for the tasks to finish
    tracker.close();
    tracker.wait().await;

    Ok(())
}
