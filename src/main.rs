//! Fleetlink CLI entry point

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use fleetlink::aggregator::console;
use fleetlink::cli::{AgentArgs, ServeArgs};
use fleetlink::{Aggregator, Cli, Commands, DeviceAgent, FleetConfig, FleetError};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<FleetError>()
                .map(FleetError::exit_code)
                .unwrap_or(ExitCode::FAILURE)
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => FleetConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => FleetConfig::load()?,
    };
    init_logging(&config, cli.verbose);

    match cli.command {
        Commands::Serve(args) => serve(&args, &mut config).await?,
        Commands::Agent(args) => agents(&args, &mut config).await?,
    }
    Ok(())
}

/// RUST_LOG wins; otherwise the configured level, raised to debug by `--verbose`.
fn init_logging(config: &FleetConfig, verbose: bool) {
    let level = if verbose { "debug" } else { config.logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("fleetlink={}", level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn serve(args: &ServeArgs, config: &mut FleetConfig) -> fleetlink::Result<()> {
    args.apply(config);
    let (aggregator, events) = Aggregator::new(config.server.host);
    tracing::info!("Aggregator ready on {}:{}", config.server.host, config.server.port);
    console::run(aggregator, events, config.server.port, !args.no_listen).await
}

async fn agents(args: &AgentArgs, config: &mut FleetConfig) -> fleetlink::Result<()> {
    args.apply(config);
    if args.count == 0 {
        return Err(FleetError::Config {
            message: "--count must be at least 1".to_string(),
        });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::with_capacity(args.count);
    for i in 0..args.count {
        let agent = DeviceAgent::new(config.agent.clone());
        tracing::debug!("Starting device {} against {}", i, config.agent.server_addr());
        handles.push(tokio::spawn(agent.run(shutdown_rx.clone())));
    }
    drop(shutdown_rx);
    tracing::info!("Running {} device(s) against {}", args.count, config.agent.server_addr());

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl-C: {}", e);
    }
    tracing::info!("Shutting down devices");
    shutdown_tx.send_replace(true);

    for handle in handles {
        match handle.await {
            Ok(result) => result?,
            Err(e) => tracing::warn!("Device task ended abnormally: {}", e),
        }
    }
    Ok(())
}
