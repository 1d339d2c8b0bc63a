use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{select, signal::ctrl_c};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info};
use tunegpu::{
    arg_parser::{ArgsOptions, Command},
    clients::{ActuatorClient, BenchmarkClient},
    experiment::ExperimentDriver,
    recommender::OptimalParams,
};
use tunegpud::{
    config::Config,
    logger,
    sample::ParameterPoint,
    store::{CollectionId, JsonlStore},
};

#[tokio::main]
async fn main() -> Result<()> {
    logger::init_logging();

    // Parse the command line arguments
    let args_options = ArgsOptions::parse();
    let config = Config::load(&args_options.config_file_path)?;

    // This token and tracker will be used to handle graceful shutdown
    let tracker = TaskTracker::new();
    let token = CancellationToken::new();

    // An interrupt lets the current run finish, the experiment stops
    // before the next one
    {
        let token = token.clone();

        tracker.spawn(async move {
            select! {
                _ = token.cancelled() => {},
                _ = ctrl_c() => {
                    info!("Interrupted, stopping after the current run");
                    token.cancel();
                }
            }
        });
    }

    let driver = ExperimentDriver::new(
        Arc::new(ActuatorClient::from_config(&config)),
        Arc::new(BenchmarkClient::from_config(&config)),
        Arc::new(JsonlStore::new(&config.store.data_dir)),
        &config,
    );

    let result = execute(&driver, &args_options, &config, &token).await;
    if let Err(err) = &result {
        for e in err.chain() {
            error!("{e}");
        }
    }

    // Cancel the token to communicate the program
    // termination to the running tasks
    token.cancel();

    // Wait for the tasks to finish
    tracker.close();
    tracker.wait().await;

    result
}

async fn execute(
    driver: &ExperimentDriver,
    args_options: &ArgsOptions,
    config: &Config,
    token: &CancellationToken,
) -> Result<()> {
    info!("Executing {}", args_options.command);

    match args_options.command {
        Command::Sweep => {
            let (collection, reports) = driver.full_sweep(token).await?;

            println!("Samples stored in {collection}");
            for report in reports.iter() {
                print!("{report}");
            }
        }
        Command::Baseline => {
            let baselines = driver.collect_baselines(token).await?;

            println!("Default parameters: {}", baselines.default_params);
            println!(
                "Default parameters and minimum power limit: {}",
                baselines.default_params_and_min_power_limit
            );
        }
        Command::Validate => {
            let sweep = sweep_collection(driver, args_options, config).await?;
            let outcome = driver.validate_recommendation(&sweep, token).await?;

            println!("Recommended parameters: {}", outcome.recommended);
            print_point("Applied GPU parameters", outcome.applied);
            println!(
                "{} of {} runs stable, samples stored in {}",
                outcome.stable_runs,
                driver.workloads().len(),
                outcome.collection
            );
        }
        Command::Analyse => {
            let sweep = sweep_collection(driver, args_options, config).await?;

            let baselines = driver.collect_baselines(token).await?;
            let outcome = driver.validate_recommendation(&sweep, token).await?;

            println!("Recommended parameters: {}", outcome.recommended);
            for summary in driver.compare(&baselines, &outcome.collection).await? {
                println!("{summary}");
            }
        }
        Command::ApplyDefaults => {
            let applied = driver.apply_defaults().await?;
            print_point("Applied GPU parameters", applied);
        }
        Command::ApplyOptimal => {
            let path = &config.experiment.optimal_params_path;
            let params = OptimalParams::load(path)
                .await
                .with_context(|| "Can't apply the optimal parameters")?;

            println!("Saved optimal parameters:\n{params}\n");

            let applied = driver.apply_point(params.point()).await?;
            print_point("Applied GPU parameters", applied);
        }
    }

    Ok(())
}

// The collection named on the command line or the latest sweep
async fn sweep_collection(
    driver: &ExperimentDriver,
    args_options: &ArgsOptions,
    config: &Config,
) -> Result<CollectionId> {
    match &args_options.collection {
        Some(name) => Ok(CollectionId::new(&config.store.monitoring_database, name)),
        None => Ok(driver.latest_sweep_collection().await?),
    }
}

fn print_point(title: &str, point: ParameterPoint) {
    println!("{title}:");
    println!("  Power limit (W): {}", point.power_limit_w());
    println!("  GPU clock offset (MHz): {}", point.core_clock_offset_mhz);
    println!("  Memory clock offset (MHz): {}", point.mem_clock_offset_mhz);
}
