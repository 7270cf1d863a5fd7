//! Synthetic telemetry generator
//!
//! Produces one random message per call, picking a category with weights
//! 33 / 34 / 33 (network metrics, device status, log line).

use std::time::Duration;

use rand::Rng;

use crate::protocol::{DeviceStatus, LogEntry, Message, NetworkMetrics, Severity};

/// Characters used for synthetic log text
pub const LOG_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ\
abcdefghijklmnopqrstuvwxyz\
0123456789 ./-_:,;!@#%^&*()[]{}";

/// Half-open `[min, max)` length bands for log text: short, medium, long
pub const LOG_LENGTH_BANDS: [(usize, usize); 3] = [(5, 50), (50, 200), (200, 800)];

pub fn random_message<R: Rng + ?Sized>(rng: &mut R) -> Message {
    let roll = rng.gen_range(0..100);
    if roll < 33 {
        Message::NetworkMetrics(network_metrics(rng))
    } else if roll < 67 {
        Message::DeviceStatus(device_status(rng))
    } else {
        Message::Log(log_entry(rng))
    }
}

pub fn network_metrics<R: Rng + ?Sized>(rng: &mut R) -> NetworkMetrics {
    NetworkMetrics {
        bandwidth: rng.gen_range(1.0..=1000.0),
        latency: rng.gen_range(0.1..=200.0),
        packet_loss: rng.gen_range(0.0..=0.2),
    }
}

pub fn device_status<R: Rng + ?Sized>(rng: &mut R) -> DeviceStatus {
    DeviceStatus {
        uptime: rng.gen_range(0..=1_000_000),
        cpu_usage: rng.gen_range(0..=100),
        memory_usage: rng.gen_range(0..=100),
    }
}

pub fn log_entry<R: Rng + ?Sized>(rng: &mut R) -> LogEntry {
    let (min, max) = LOG_LENGTH_BANDS[rng.gen_range(0..LOG_LENGTH_BANDS.len())];
    let len = rng.gen_range(min..max);
    LogEntry {
        message: random_text(rng, len),
        severity: Severity::Info,
    }
}

/// `len` characters drawn uniformly from [`LOG_CHARSET`]
pub fn random_text<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| LOG_CHARSET[rng.gen_range(0..LOG_CHARSET.len())] as char)
        .collect()
}

/// Uniform delay in `[min_ms, max_ms]`, re-rolled on every call
pub fn send_delay<R: Rng + ?Sized>(rng: &mut R, min_ms: u64, max_ms: u64) -> Duration {
    Duration::from_millis(rng.gen_range(min_ms..=max_ms.max(min_ms)))
}
