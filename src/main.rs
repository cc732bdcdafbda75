//! ipflip - moves a server off a blocklisted public address.

use clap::Parser;
use std::process::ExitCode;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use ipflip::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::ERROR
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .without_time()
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to initialise logging: {}", e);
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Commands::Run { dry_run } => ipflip::commands::run::run(dry_run, &cli.config)
            .await
            .map(|outcome| outcome.is_success()),
        Commands::Check { ip } => ipflip::commands::check::run(&ip, &cli.config)
            .await
            .map(|()| true),
        Commands::Probe { ip } => ipflip::commands::probe::run(&ip, &cli.config)
            .await
            .map(|()| true),
        Commands::Version => {
            println!("ipflip {}", env!("CARGO_PKG_VERSION"));
            Ok(true)
        }
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
