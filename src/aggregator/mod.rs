//! Fleetlink Aggregator
//!
//! The server side of the fleet: accepts device connections, greets each
//! with a `ConnectAck`, decodes their telemetry and lets an operator push
//! commands and configuration to one or all devices.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              AGGREGATOR                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                ConnectionRegistry (Mutex<HashMap>)               │  │
//! │  │                                                                  │  │
//! │  │  id_1 ──► Connection { peer, outbound queue, driver task }       │  │
//! │  │  id_2 ──► Connection { ... }                                     │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! │                                                                         │
//! │  accept loop ──► Connection::new ──► registry.insert ──► driver task    │
//! │  driver task ──ConnectionEvent──► relay ──ServerEvent──► presentation   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Connections never hold a reference to the registry; they only report
//! their id on the event channel and the relay deregisters them.

pub mod connection;
pub mod console;
pub mod events;
pub mod listener;
pub mod registry;

pub use connection::{Connection, ConnectionId, FrameSink, Liveness};
pub use events::{ConnectionEvent, LogLevel, ServerEvent};
pub use listener::Aggregator;
pub use registry::{ConnectionRegistry, RegistryStats};
