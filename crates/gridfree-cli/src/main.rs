mod cli;
mod commands;
mod config;
mod engine;
mod error;
mod logging;
mod utils;

use crate::cli::{Cli, Commands};
use crate::commands::Context;
use crate::config::FileConfig;
use crate::error::{CliError, Result};
use crate::utils::progress::CliProgressHandler;
use clap::Parser;
use tracing::{debug, error, info};

fn main() {
    if let Err(e) = run_app() {
        eprintln!("\n❌ Error: {}", e);
        std::process::exit(1);
    }
}

fn run_app() -> Result<()> {
    let cli = Cli::parse();
    logging::setup_logging(cli.verbose, cli.quiet, cli.log_file.as_deref())?;

    info!(
        "🚀 gridfree CLI v{} starting up.",
        env!("CARGO_PKG_VERSION")
    );
    debug!("Full CLI arguments parsed: {:?}", &cli);

    if let Some(num_threads) = cli.threads {
        info!(
            "Setting Rayon global thread pool to {} threads.",
            num_threads
        );
        rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build_global()
            .map_err(|e| {
                CliError::Other(anyhow::anyhow!("Failed to build global thread pool: {}", e))
            })?;
    }

    let config_path = config::locate(cli.config.as_deref(), &cli.pool);
    let ctx = Context {
        pool_dir: cli.pool.clone(),
        file: FileConfig::load(config_path.as_deref(), &cli.set_values)?,
        progress: if cli.quiet {
            CliProgressHandler::hidden()
        } else {
            CliProgressHandler::new()
        },
    };

    let command_result = match &cli.command {
        Commands::CreatePool(args) => commands::pool::create(&ctx, args),
        Commands::CreateNodes(args) => commands::nodes::create(&ctx, args),
        Commands::Prepare => commands::nodes::prepare(&ctx),
        Commands::Mdrun(args) => commands::sampling::mdrun(&ctx, args),
        Commands::Refine(args) => commands::sampling::refine(&ctx, args),
        Commands::Reweight(args) => commands::analysis::reweight(&ctx, args),
        Commands::Analyze(args) => commands::analysis::analyze(&ctx, args),
        Commands::Recover(args) => commands::recover::run(&ctx, args),
        Commands::Remove(args) => commands::nodes::remove(&ctx, args),
        Commands::Export(args) => commands::pool::export_table(&ctx, args),
        Commands::Status => commands::pool::status(&ctx).map(|text| print!("{text}")),
    };

    match &command_result {
        Ok(_) => info!("✅ Command completed successfully."),
        Err(e) => error!("❌ Command failed: {}", e),
    }
    command_result
}
