//! CLI argument definitions using clap with subcommand architecture
//!
//! Command-line values override the configuration file, which overrides the
//! built-in defaults.

use clap::{Args, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::config::FleetConfig;

/// Telemetry device-fleet simulator
#[derive(Parser, Debug)]
#[command(name = "fleetlink")]
#[command(about = "Aggregator and simulated devices speaking length-prefixed JSON over TCP")]
#[command(version)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true, env = "FLEETLINK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Show debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available subcommands for fleetlink
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the aggregator with an interactive operator console
    #[command(visible_alias = "s")]
    Serve(ServeArgs),

    /// Run one or more simulated devices
    #[command(visible_alias = "a")]
    Agent(AgentArgs),
}

/// Arguments for the aggregator
#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Address to bind to
    #[arg(long)]
    pub host: Option<IpAddr>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Start with the listener stopped; use the `listen` console command
    #[arg(long)]
    pub no_listen: bool,
}

/// Arguments for simulated devices
#[derive(Args, Debug)]
pub struct AgentArgs {
    /// Aggregator host
    #[arg(long)]
    pub host: Option<String>,

    /// Aggregator port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of devices to simulate
    #[arg(short = 'n', long, default_value = "1")]
    pub count: usize,
}

impl ServeArgs {
    /// Fold the flags into the loaded configuration.
    pub fn apply(&self, config: &mut FleetConfig) {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
    }
}

impl AgentArgs {
    /// Fold the flags into the loaded configuration.
    pub fn apply(&self, config: &mut FleetConfig) {
        if let Some(host) = &self.host {
            config.agent.host = host.clone();
        }
        if let Some(port) = self.port {
            config.agent.port = port;
        }
    }
}
