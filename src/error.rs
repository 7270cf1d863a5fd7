//! Error types and exit codes for fleetlink

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use thiserror::Error;

/// Main error type for fleetlink operations
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid address: {value}")]
    InvalidAddress { value: String },

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("IO error at {path}: {message}")]
    ConfigIo { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetError {
    /// Convert error to a process exit code:
    /// - 1: network or IO failure
    /// - 2: configuration problem
    /// - 3: message encoding failure
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Bind { .. } | Self::Connect { .. } | Self::Io(_) => ExitCode::from(1),
            Self::InvalidAddress { .. } | Self::Config { .. } | Self::ConfigIo { .. } => {
                ExitCode::from(2)
            }
            Self::Encode(_) => ExitCode::from(3),
        }
    }
}

/// Result type alias for fleetlink operations
pub type Result<T> = std::result::Result<T, FleetError>;
