//! Aggregator, agent and raw-socket fixtures

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::BytesMut;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use fleetlink::{
    encode, next_frame, AgentConfig, AgentState, Aggregator, Decoded, DeviceAgent, Message,
    ServerEvent,
};

/// Upper bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(5);

pub type Events = mpsc::UnboundedReceiver<ServerEvent>;

/// Aggregator listening on an ephemeral loopback port
pub async fn start_aggregator() -> (Aggregator, Events, SocketAddr) {
    let (aggregator, events) = Aggregator::new(Ipv4Addr::LOCALHOST.into());
    let addr = aggregator
        .start_listening(0)
        .await
        .expect("aggregator failed to listen");
    (aggregator, events, addr)
}

/// Agent configuration with short timers pointed at `addr`
pub fn agent_config(addr: SocketAddr) -> AgentConfig {
    AgentConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        reconnect_interval_ms: 100,
        min_send_interval_ms: 1,
        max_send_interval_ms: 10,
        ..AgentConfig::default()
    }
}

/// A running device agent
pub struct AgentHandle {
    pub status: watch::Receiver<AgentState>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<fleetlink::Result<()>>,
}

impl AgentHandle {
    pub fn spawn(config: AgentConfig, seed: u64) -> Self {
        let agent = DeviceAgent::with_seed(config, seed);
        let status = agent.status();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(agent.run(shutdown_rx));
        Self {
            status,
            shutdown,
            task,
        }
    }

    pub async fn wait_until(&mut self, check: impl Fn(&AgentState) -> bool) {
        timeout(WAIT, self.status.wait_for(|s| check(s)))
            .await
            .expect("timed out waiting for agent state")
            .expect("agent dropped its status channel");
    }

    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        timeout(WAIT, self.task)
            .await
            .expect("agent did not stop")
            .expect("agent task panicked")
            .expect("agent returned an error");
    }
}

/// Bare TCP client that frames messages by hand
pub struct RawDevice {
    stream: TcpStream,
    buffer: BytesMut,
}

impl RawDevice {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect failed");
        Self {
            stream,
            buffer: BytesMut::new(),
        }
    }

    /// Connect and consume the greeting, returning the assigned id
    pub async fn connect_acked(addr: SocketAddr) -> (Self, String) {
        let mut device = Self::connect(addr).await;
        match device.read_message().await {
            Message::ConnectAck { client_id } => (device, client_id),
            other => panic!("Expected ConnectAck first, got {:?}", other),
        }
    }

    pub async fn send(&mut self, message: &Message) {
        self.send_raw(&encode(message).unwrap()).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write failed");
    }

    /// Next frame, or `None` if the aggregator closed the socket
    pub async fn try_read_value(&mut self) -> Option<Value> {
        loop {
            match next_frame(&mut self.buffer) {
                Decoded::Message(value) => return Some(value),
                Decoded::Malformed { reason } => panic!("aggregator sent a malformed frame: {}", reason),
                Decoded::NotReady => {}
            }
            let n = timeout(WAIT, self.stream.read_buf(&mut self.buffer))
                .await
                .expect("timed out waiting for a frame")
                .expect("read failed");
            if n == 0 {
                return None;
            }
        }
    }

    pub async fn read_message(&mut self) -> Message {
        let value = self.try_read_value().await.expect("aggregator closed the connection");
        Message::from_value(value).expect("aggregator sent an invalid message")
    }

    /// True if nothing arrives within `window`
    pub async fn is_quiet_for(&mut self, window: Duration) -> bool {
        if !self.buffer.is_empty() {
            return false;
        }
        timeout(window, self.stream.read_buf(&mut self.buffer)).await.is_err()
    }

    pub async fn expect_closed(&mut self) {
        assert!(self.try_read_value().await.is_none(), "expected the aggregator to close the socket");
    }

    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }
}
