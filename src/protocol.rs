//! Wire protocol message types
//!
//! Defines the JSON messages exchanged between the aggregator and device
//! agents. Every message is a JSON object with a string `type` field:
//!
//! ```json
//! // Aggregator -> Agent
//! {"type":"ConnectAck","client_id":"..."}
//! {"type":"Command","command":"START"}
//! {"type":"Config","crit_latency_ms":100,"crit_packet_loss":0.05}
//!
//! // Agent -> Aggregator
//! {"type":"NetworkMetrics","bandwidth":512.3,"latency":12.7,"packet_loss":0.01}
//! {"type":"DeviceStatus","uptime":4821,"cpu_usage":37,"memory_usage":61}
//! {"type":"Log","message":"...","severity":"INFO"}
//! ```
//!
//! Messages with an unrecognized `type` are reported as
//! [`ProtocolError::UnknownType`] so that callers can log and skip them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// `type` values this crate understands
pub const KNOWN_TYPES: &[&str] = &[
    "ConnectAck",
    "Command",
    "Config",
    "NetworkMetrics",
    "DeviceStatus",
    "Log",
];

/// A decoded protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Sent by the aggregator right after accepting a connection
    ConnectAck { client_id: String },
    /// Start or stop the agent's telemetry stream
    Command { command: Command },
    /// Threshold update; absent fields keep their previous value
    Config(ConfigUpdate),
    NetworkMetrics(NetworkMetrics),
    DeviceStatus(DeviceStatus),
    Log(LogEntry),
}

/// Send lifecycle command. Case-insensitive on input, upper-case on output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum Command {
    Start,
    Stop,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Start => "START",
            Command::Stop => "STOP",
        }
    }
}

impl From<Command> for &'static str {
    fn from(command: Command) -> Self {
        command.as_str()
    }
}

impl TryFrom<String> for Command {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.eq_ignore_ascii_case("START") {
            Ok(Command::Start)
        } else if value.eq_ignore_ascii_case("STOP") {
            Ok(Command::Stop)
        } else {
            Err(format!("unknown command '{}'", value))
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a `Config` message
///
/// Each field is read on its own: a value that cannot be interpreted is
/// treated as absent instead of failing the whole message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_integer"
    )]
    pub crit_latency_ms: Option<i64>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_number"
    )]
    pub crit_packet_loss: Option<f64>,
}

/// Integers, and floats with no fractional part (`80.0`)
fn lenient_integer<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| {
        v.as_i64().or_else(|| {
            v.as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
                .map(|f| f as i64)
        })
    }))
}

fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| v.as_f64()))
}

/// Link quality sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkMetrics {
    /// Mbps, in [1, 1000]
    pub bandwidth: f64,
    /// Milliseconds, in [0.1, 200]
    pub latency: f64,
    /// Fraction, in [0, 0.2]
    pub packet_loss: f64,
}

/// Host health sample
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub uptime: u32,
    pub cpu_usage: u8,
    pub memory_usage: u8,
}

/// Free-form log line from a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub message: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
        }
    }
}

/// Why a JSON object could not be turned into a [`Message`]
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("message has no string 'type' field")]
    MissingType,

    #[error("unrecognized message type '{0}'")]
    UnknownType(String),

    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Message {
    /// Interpret a decoded JSON object.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_string();

        if !KNOWN_TYPES.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }

        serde_json::from_value(value).map_err(|source| ProtocolError::InvalidPayload { kind, source })
    }

    pub fn connect_ack(client_id: impl Into<String>) -> Self {
        Message::ConnectAck {
            client_id: client_id.into(),
        }
    }

    pub fn command(command: Command) -> Self {
        Message::Command { command }
    }

    pub fn config(crit_latency_ms: i64, crit_packet_loss: f64) -> Self {
        Message::Config(ConfigUpdate {
            crit_latency_ms: Some(crit_latency_ms),
            crit_packet_loss: Some(crit_packet_loss),
        })
    }

    /// The wire `type` of this message
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ConnectAck { .. } => "ConnectAck",
            Message::Command { .. } => "Command",
            Message::Config(_) => "Config",
            Message::NetworkMetrics(_) => "NetworkMetrics",
            Message::DeviceStatus(_) => "DeviceStatus",
            Message::Log(_) => "Log",
        }
    }

    /// One-line human readable content, as shown in the operator console
    pub fn summary(&self) -> String {
        match self {
            Message::ConnectAck { client_id } => format!("client_id={}", client_id),
            Message::Command { command } => command.to_string(),
            Message::Config(cfg) => {
                let mut parts = Vec::new();
                if let Some(ms) = cfg.crit_latency_ms {
                    parts.push(format!("crit_latency_ms={}", ms));
                }
                if let Some(pl) = cfg.crit_packet_loss {
                    parts.push(format!("crit_packet_loss={}", pl));
                }
                parts.join(" ")
            }
            Message::NetworkMetrics(m) => format!(
                "bw={:.2} latency={:.2} pl={:.4}",
                m.bandwidth, m.latency, m.packet_loss
            ),
            Message::DeviceStatus(s) => format!(
                "uptime={} cpu={} mem={}",
                s.uptime, s.cpu_usage, s.memory_usage
            ),
            Message::Log(entry) => format!("[{}] {}", entry.severity.as_str(), entry.message),
        }
    }
}

/// Type label and content summary for any received object.
///
/// Objects that are not a known, well-formed message fall back to their
/// compact JSON text.
pub fn describe(value: &Value) -> (String, String) {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("?")
        .to_string();

    match Message::from_value(value.clone()) {
        Ok(msg) => (kind, msg.summary()),
        Err(_) => (kind, value.to_string()),
    }
}
