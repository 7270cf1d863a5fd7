//! Device agent state machine
//!
//! Two orthogonal axes: the link lifecycle
//! (`Disconnected → Connecting → Connected → Disconnected`) and the send
//! lifecycle (`Idle ⇄ Sending`), plus the threshold configuration pushed by
//! the aggregator. Everything here is synchronous; the runtime in
//! [`super::DeviceAgent`] performs the I/O the returned [`Reaction`]s ask for.

use crate::protocol::{Command, ConfigUpdate, LogEntry, Message, NetworkMetrics, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Idle,
    Sending,
}

/// Critical values above which a metrics sample is reported as a breach
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub crit_latency_ms: i64,
    pub crit_packet_loss: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            crit_latency_ms: 100,
            crit_packet_loss: 0.05,
        }
    }
}

impl Thresholds {
    /// Overwrite the fields present in `update`.
    pub fn apply(&mut self, update: &ConfigUpdate) {
        if let Some(ms) = update.crit_latency_ms {
            self.crit_latency_ms = ms;
        }
        if let Some(pl) = update.crit_packet_loss {
            self.crit_packet_loss = pl;
        }
    }

    pub fn is_breached_by(&self, metrics: &NetworkMetrics) -> bool {
        metrics.latency > self.crit_latency_ms as f64 || metrics.packet_loss > self.crit_packet_loss
    }
}

/// What the runtime has to do after the state handled an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    None,
    /// Arm the send timer with a fresh random delay
    ScheduleFirstTick,
    /// Disarm the send timer
    CancelTick,
    /// Message type the agent does not act on
    Ignored,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentState {
    pub link: LinkState,
    pub sending: SendState,
    /// Assigned by the aggregator's `ConnectAck`
    pub client_id: Option<String>,
    pub thresholds: Thresholds,
}

impl Default for AgentState {
    fn default() -> Self {
        Self::new(Thresholds::default())
    }
}

impl AgentState {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            link: LinkState::Disconnected,
            sending: SendState::Idle,
            client_id: None,
            thresholds,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link == LinkState::Connected
    }

    pub fn is_sending(&self) -> bool {
        self.sending == SendState::Sending
    }

    /// Enter `Connecting`. Returns false, changing nothing, if a connect
    /// attempt is already under way or the link is up.
    pub fn begin_connect(&mut self) -> bool {
        if self.link != LinkState::Disconnected {
            return false;
        }
        self.link = LinkState::Connecting;
        true
    }

    pub fn on_connected(&mut self) {
        self.link = LinkState::Connected;
    }

    /// Any loss of the link also stops sending.
    pub fn on_disconnected(&mut self) {
        self.link = LinkState::Disconnected;
        self.sending = SendState::Idle;
    }

    pub fn handle(&mut self, message: Message) -> Reaction {
        match message {
            Message::ConnectAck { client_id } => {
                tracing::info!("Got ConnectAck, client_id = {}", client_id);
                self.client_id = Some(client_id);
                Reaction::None
            }
            Message::Command { command } => {
                tracing::info!("Received {} command", command);
                match command {
                    Command::Start => self.start(),
                    Command::Stop => self.stop(),
                }
            }
            Message::Config(update) => {
                self.thresholds.apply(&update);
                tracing::info!(
                    "Applied config: latency {} ms, packet loss {}",
                    self.thresholds.crit_latency_ms,
                    self.thresholds.crit_packet_loss
                );
                Reaction::None
            }
            other => {
                tracing::info!("Server message: {} {}", other.kind(), other.summary());
                Reaction::Ignored
            }
        }
    }

    pub fn start(&mut self) -> Reaction {
        if self.is_sending() || !self.is_connected() {
            return Reaction::None;
        }
        self.sending = SendState::Sending;
        Reaction::ScheduleFirstTick
    }

    pub fn stop(&mut self) -> Reaction {
        self.sending = SendState::Idle;
        Reaction::CancelTick
    }

    /// Called when the send timer fires. Drops back to `Idle` and returns
    /// false if the tick should not produce traffic.
    pub fn tick_should_send(&mut self) -> bool {
        if !self.is_sending() || !self.is_connected() {
            self.sending = SendState::Idle;
            return false;
        }
        true
    }

    /// Frames to transmit for one generated sample, in wire order.
    ///
    /// A metrics sample that breaches a threshold is preceded by a warning
    /// log frame.
    pub fn frames_for(&self, sample: Message) -> Vec<Message> {
        let mut frames = Vec::with_capacity(2);
        if let Message::NetworkMetrics(metrics) = &sample {
            if self.thresholds.is_breached_by(metrics) {
                frames.push(threshold_warning(metrics));
            }
        }
        frames.push(sample);
        frames
    }
}

pub fn threshold_warning(metrics: &NetworkMetrics) -> Message {
    Message::Log(LogEntry {
        message: format!(
            "Threshold exceeded: latency={} pl={}",
            metrics.latency, metrics.packet_loss
        ),
        severity: Severity::Warning,
    })
}
