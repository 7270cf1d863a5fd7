//! Common test utilities and fixtures for fleetlink integration tests
//!
//! This module provides:
//! - `RawDevice`, a bare TCP client speaking the frame protocol by hand
//! - Helpers to start an aggregator on an ephemeral port and spawn agents
//! - Assertions that wait on the aggregator's event stream

#![allow(unused_imports)]
#![allow(dead_code)]

pub mod assertions;
pub mod harness;

pub use assertions::*;
pub use harness::*;
