//! Events published by the aggregator
//!
//! Connections report to the listener over one channel
//! ([`ConnectionEvent`]); the listener relays a higher-level stream
//! ([`ServerEvent`]) to whatever presentation layer is attached.

use std::net::IpAddr;

use serde_json::Value;

use super::connection::ConnectionId;

/// Severity of an operator-facing log line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Emitted by a single connection towards its owner
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    MessageReceived {
        id: ConnectionId,
        message: Value,
    },
    /// Sent exactly once, after which the connection's socket is released
    Disconnected { id: ConnectionId },
    Log { level: LogLevel, text: String },
}

/// Emitted by the aggregator towards the presentation layer
#[derive(Debug, Clone)]
pub enum ServerEvent {
    ConnectionOpened {
        id: ConnectionId,
        ip: IpAddr,
        port: u16,
    },
    ConnectionClosed { id: ConnectionId },
    DataReceived {
        id: ConnectionId,
        message: Value,
    },
    Log { level: LogLevel, text: String },
}

impl ServerEvent {
    pub(crate) fn log(level: LogLevel, text: impl Into<String>) -> Self {
        ServerEvent::Log {
            level,
            text: text.into(),
        }
    }
}
