//! Fleetlink Device Agent
//!
//! Simulates one device: keeps a TCP link to the aggregator alive,
//! reconnecting on a fixed interval, and while in the sending state emits one
//! synthetic telemetry message per random delay.
//!
//! ```text
//!   reconnect tick ──► connect ──► session ──► link lost ──► reconnect tick
//!                                    │
//!                    ┌───────────────┼────────────────┐
//!                 read_buf        send tick        shutdown
//!              (ConnectAck,     (generator +       (returns)
//!              Command, Config)  thresholds)
//! ```
//!
//! All agent state lives on a single task, so inbound commands, timer ticks
//! and link loss are handled strictly in sequence.

pub mod generator;
pub mod state;

use std::future::pending;
use std::pin::Pin;
use std::time::Duration;

use bytes::BytesMut;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{interval, sleep, MissedTickBehavior, Sleep};

use crate::config::AgentConfig;
use crate::error::{FleetError, Result};
use crate::framing::{self, Decoded};
use crate::protocol::{Message, ProtocolError};

pub use state::{AgentState, LinkState, Reaction, SendState, Thresholds};

const READ_BUFFER_SIZE: usize = 4 * 1024;

/// Why a connected session ended
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    Lost(String),
}

/// Armed send timer, if any
type SendTimer = Option<Pin<Box<Sleep>>>;

/// A simulated device
pub struct DeviceAgent {
    config: AgentConfig,
    state: AgentState,
    status: watch::Sender<AgentState>,
    rng: StdRng,
}

impl DeviceAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Agent with a deterministic traffic generator
    pub fn with_seed(config: AgentConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: AgentConfig, rng: StdRng) -> Self {
        let state = AgentState::new(Thresholds {
            crit_latency_ms: config.crit_latency_ms,
            crit_packet_loss: config.crit_packet_loss,
        });
        let (status, _) = watch::channel(state.clone());
        Self {
            config,
            state,
            status,
            rng,
        }
    }

    /// Observe state changes: link, send lifecycle, client id and thresholds.
    pub fn status(&self) -> watch::Receiver<AgentState> {
        self.status.subscribe()
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    /// Run until `shutdown` flips to true (or its sender is dropped).
    ///
    /// The first connection attempt is made immediately. After a failed
    /// attempt or a lost link the next attempt waits one reconnect interval.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = self.config.server_addr();
        let retry = self.config.reconnect_interval();
        let mut reconnect = interval(retry.max(Duration::from_millis(1)));
        reconnect.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = reconnect.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            if !self.state.begin_connect() {
                continue;
            }
            self.publish();
            tracing::debug!("Connecting to {}", addr);

            let connected = tokio::select! {
                result = TcpStream::connect(addr.as_str()) => result,
                _ = shutdown.changed() => break,
            };

            let stream = match connected {
                Ok(stream) => stream,
                Err(source) => {
                    let err = FleetError::Connect {
                        addr: addr.clone(),
                        source,
                    };
                    tracing::warn!("{}; will retry in {:?}", err, retry);
                    self.state.on_disconnected();
                    self.publish();
                    continue;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!("Could not set TCP_NODELAY: {}", e);
            }
            self.state.on_connected();
            self.publish();
            tracing::info!("Connected to server {}", addr);

            let end = self.session(stream, &mut shutdown).await;
            self.state.on_disconnected();
            self.publish();

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost(reason) => {
                    tracing::warn!(
                        "Disconnected from server ({}), will retry in {:?}",
                        reason,
                        retry
                    );
                    reconnect.reset();
                }
            }
        }

        self.state.on_disconnected();
        self.publish();
        tracing::info!("Agent stopped");
        Ok(())
    }

    async fn session(&mut self, stream: TcpStream, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
        let (mut reader, mut writer) = stream.into_split();
        let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut timer: SendTimer = None;

        loop {
            tokio::select! {
                read = reader.read_buf(&mut buffer) => match read {
                    Ok(0) => return SessionEnd::Lost("server closed the connection".to_string()),
                    Ok(_) => {
                        self.drain_frames(&mut buffer, &mut timer);
                        self.publish();
                    }
                    Err(e) => return SessionEnd::Lost(e.to_string()),
                },

                _ = fire(&mut timer) => {
                    timer = None;
                    if !self.state.tick_should_send() {
                        self.publish();
                        continue;
                    }
                    if let Err(e) = self.send_sample(&mut writer).await {
                        return SessionEnd::Lost(e.to_string());
                    }
                    timer = Some(self.next_tick());
                }

                _ = shutdown.changed() => {
                    let _ = writer.shutdown().await;
                    return SessionEnd::Shutdown;
                }
            }
        }
    }

    fn drain_frames(&mut self, buffer: &mut BytesMut, timer: &mut SendTimer) {
        loop {
            let value = match framing::next_frame(buffer) {
                Decoded::NotReady => break,
                Decoded::Malformed { reason } => {
                    tracing::warn!("Dropping malformed frame from server: {}", reason);
                    continue;
                }
                Decoded::Message(value) => value,
            };

            let message = match Message::from_value(value) {
                Ok(message) => message,
                Err(ProtocolError::UnknownType(kind)) => {
                    tracing::info!("Ignoring server message of unknown type '{}'", kind);
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Invalid server message: {}", e);
                    continue;
                }
            };

            match self.state.handle(message) {
                Reaction::ScheduleFirstTick => *timer = Some(self.next_tick()),
                Reaction::CancelTick => *timer = None,
                Reaction::None | Reaction::Ignored => {}
            }
        }
    }

    async fn send_sample(&mut self, writer: &mut OwnedWriteHalf) -> Result<()> {
        let sample = generator::random_message(&mut self.rng);
        for frame in self.state.frames_for(sample) {
            let bytes = framing::encode(&frame)?;
            writer.write_all(&bytes).await?;
            tracing::debug!("Sent {} {}", frame.kind(), frame.summary());
        }
        Ok(())
    }

    fn next_tick(&mut self) -> Pin<Box<Sleep>> {
        let delay: Duration = generator::send_delay(
            &mut self.rng,
            self.config.min_send_interval_ms,
            self.config.max_send_interval_ms,
        );
        Box::pin(sleep(delay))
    }

    fn publish(&self) {
        self.status.send_if_modified(|current| {
            if *current == self.state {
                return false;
            }
            *current = self.state.clone();
            true
        });
    }
}

/// Completes when the armed timer fires; never completes while disarmed.
async fn fire(timer: &mut SendTimer) {
    match timer {
        Some(armed) => armed.as_mut().await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, Severity};
    use serde_json::Value;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    async fn fake_server() -> (TcpListener, AgentConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = AgentConfig {
            host: "127.0.0.1".to_string(),
            port: listener.local_addr().unwrap().port(),
            reconnect_interval_ms: 50,
            min_send_interval_ms: 1,
            max_send_interval_ms: 5,
            ..AgentConfig::default()
        };
        (listener, config)
    }

    async fn send(stream: &mut TcpStream, message: &Message) {
        stream.write_all(&framing::encode(message).unwrap()).await.unwrap();
    }

    async fn read_frame(stream: &mut TcpStream, buffer: &mut BytesMut) -> Value {
        loop {
            if let Decoded::Message(value) = framing::next_frame(buffer) {
                return value;
            }
            let n = timeout(Duration::from_secs(5), stream.read_buf(buffer))
                .await
                .expect("timed out waiting for a frame")
                .unwrap();
            assert!(n > 0, "agent closed the connection");
        }
    }

    async fn wait_for(status: &mut watch::Receiver<AgentState>, check: impl Fn(&AgentState) -> bool) {
        timeout(Duration::from_secs(5), status.wait_for(|s| check(s)))
            .await
            .expect("timed out waiting for agent state")
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_ack_and_config_update_state() {
        let (listener, config) = fake_server().await;
        let agent = DeviceAgent::with_seed(config, 1);
        let mut status = agent.status();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(agent.run(shutdown_rx));

        let (mut stream, _) = listener.accept().await.unwrap();
        send(&mut stream, &Message::connect_ack("dev-1")).await;
        send(&mut stream, &Message::config(40, 0.2)).await;

        wait_for(&mut status, |s| {
            s.is_connected() && s.client_id.as_deref() == Some("dev-1") && s.thresholds.crit_latency_ms == 40
        })
        .await;
        assert_eq!(status.borrow().thresholds.crit_packet_loss, 0.2);
        assert!(!status.borrow().is_sending());

        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap().unwrap();
        assert_eq!(status.borrow().link, LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_start_streams_and_stop_halts() {
        let (listener, config) = fake_server().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(DeviceAgent::with_seed(config, 2).run(shutdown_rx));

        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buffer = BytesMut::new();
        send(&mut stream, &Message::command(Command::Start)).await;

        for _ in 0..5 {
            let value = read_frame(&mut stream, &mut buffer).await;
            let message = Message::from_value(value).unwrap();
            assert!(matches!(
                message,
                Message::NetworkMetrics(_) | Message::DeviceStatus(_) | Message::Log(_)
            ));
        }

        send(&mut stream, &Message::command(Command::Stop)).await;

        // Frames already in flight may still arrive; after that the link goes quiet
        let quiet = timeout(Duration::from_secs(5), async {
            loop {
                match timeout(Duration::from_millis(300), stream.read_buf(&mut buffer)).await {
                    Err(_) => break,
                    Ok(Ok(0)) => panic!("agent closed the connection"),
                    Ok(_) => {}
                }
            }
        })
        .await;
        assert!(quiet.is_ok(), "agent kept sending after STOP");

        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_breach_warning_precedes_metrics() {
        let (listener, config) = fake_server().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(DeviceAgent::with_seed(config, 3).run(shutdown_rx));

        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buffer = BytesMut::new();
        // Every metrics sample breaches a negative latency threshold
        send(&mut stream, &Message::config(-1, 1.0)).await;
        send(&mut stream, &Message::command(Command::Start)).await;

        let mut previous: Option<Message> = None;
        let mut metrics_seen = 0;
        while metrics_seen < 3 {
            let message = Message::from_value(read_frame(&mut stream, &mut buffer).await).unwrap();
            if let Message::NetworkMetrics(_) = message {
                match &previous {
                    Some(Message::Log(entry)) => {
                        assert_eq!(entry.severity, Severity::Warning);
                        assert!(entry.message.starts_with("Threshold exceeded"));
                    }
                    other => panic!("metrics not preceded by a warning: {:?}", other),
                }
                metrics_seen += 1;
            }
            previous = Some(message);
        }

        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reconnects_after_link_loss() {
        let (listener, config) = fake_server().await;
        let agent = DeviceAgent::with_seed(config, 4);
        let mut status = agent.status();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(agent.run(shutdown_rx));

        let (mut stream, _) = listener.accept().await.unwrap();
        send(&mut stream, &Message::connect_ack("first")).await;
        send(&mut stream, &Message::command(Command::Start)).await;
        wait_for(&mut status, |s| s.is_sending() && s.client_id.as_deref() == Some("first")).await;
        drop(stream);

        let (mut second, _) = timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("agent did not reconnect")
            .unwrap();
        wait_for(&mut status, |s| s.is_connected()).await;
        // Sending does not resume on its own after a reconnect
        assert!(!status.borrow().is_sending());
        // The last assigned id survives the link loss until a new ack replaces it
        assert_eq!(status.borrow().client_id.as_deref(), Some("first"));

        send(&mut second, &Message::connect_ack("second")).await;
        wait_for(&mut status, |s| s.client_id.as_deref() == Some("second")).await;

        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_retries_when_server_absent() {
        let (listener, config) = fake_server().await;
        let port = config.port;
        drop(listener);

        let agent = DeviceAgent::with_seed(config, 5);
        let mut status = agent.status();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(agent.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(120)).await;
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let accepted = timeout(Duration::from_secs(5), listener.accept()).await;
        assert!(accepted.is_ok(), "agent never retried");
        wait_for(&mut status, |s| s.is_connected()).await;

        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap().unwrap();
    }
}
