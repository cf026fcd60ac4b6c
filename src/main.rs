use lbm_blocks::{Config, QuitEvent, Solver};
use anyhow::Result;
use log::info;
use signal_hook::consts::{SIGINT, SIGTERM};
use std::env;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: {} <config.json>", args[0]);
        eprintln!("  config.json - JSON file containing domain, runner and output settings");
        std::process::exit(1);
    }

    let config_path = &args[1];
    info!("Loading configuration from: {}", config_path);
    let config = Config::from_file(config_path)?;

    info!("Simulation parameters:");
    info!("  Domain: {:?} ({:?})", config.domain.global_size(), config.physics.grid);
    info!("  Blocks: {}", config.domain.blocks);
    info!("  Backend: {:?}", config.runner.backend);
    info!("  Max iterations: {}", config.runner.max_iters);
    info!("  Output frequency: {}", config.runner.every);

    let quit = QuitEvent::new();
    signal_hook::flag::register(SIGINT, quit.flag())?;
    signal_hook::flag::register(SIGTERM, quit.flag())?;

    let output_directory = config.output.output_directory.clone();
    let solver = Solver::new(config, quit).await?;
    let outcomes = solver.run().await?;

    let iterations = outcomes.iter().map(|o| o.iterations()).max().unwrap_or(0);
    info!("Simulation stopped after {} iterations.", iterations);
    info!("Output files written to: {}", output_directory);

    Ok(())
}
