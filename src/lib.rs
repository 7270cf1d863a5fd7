//! Fleetlink: a telemetry device-fleet simulator
//!
//! Two roles share one wire protocol, length-prefixed JSON over TCP:
//!
//! - The **aggregator** accepts device connections, assigns each an id,
//!   relays their telemetry to a presentation layer and pushes commands and
//!   threshold configuration back to one or all devices.
//! - The **device agent** keeps a link to the aggregator alive, reconnecting
//!   on a fixed interval, and streams synthetic network metrics, device status
//!   and log lines while told to.
//!
//! # Example
//!
//! ```ignore
//! use fleetlink::{Aggregator, Command, Message};
//! use std::net::Ipv4Addr;
//!
//! let (aggregator, mut events) = Aggregator::new(Ipv4Addr::UNSPECIFIED.into());
//! aggregator.start_listening(12345).await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! aggregator.broadcast(&Message::command(Command::Start))?;
//! ```

pub mod agent;
pub mod aggregator;
pub mod cli;
pub mod config;
pub mod error;
pub mod framing;
pub mod protocol;

pub use agent::{AgentState, DeviceAgent, LinkState, SendState, Thresholds};
pub use aggregator::{Aggregator, ConnectionId, LogLevel, ServerEvent};
pub use cli::{Cli, Commands};
pub use config::{AgentConfig, FleetConfig, ServerConfig};
pub use error::{FleetError, Result};
pub use framing::{encode, next_frame, try_decode_one, Decoded};
pub use protocol::{Command, ConfigUpdate, DeviceStatus, LogEntry, Message, NetworkMetrics, Severity};
