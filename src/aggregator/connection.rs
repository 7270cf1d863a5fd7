//! Per-device connection handling
//!
//! Each accepted socket is owned by exactly one [`Connection`]. The
//! connection greets the device with a `ConnectAck`, decodes inbound frames
//! into [`ConnectionEvent`]s and serializes outbound frames through a queue
//! drained by its own task, so `send` never blocks the caller.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::aggregator::events::{ConnectionEvent, LogLevel};
use crate::framing::{self, Decoded};
use crate::protocol::Message;

/// Opaque, never reused identifier assigned at accept time
pub type ConnectionId = String;

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Liveness of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Active,
    Closing,
}

/// Anything the registry can address by id and hand an encoded frame to
pub trait FrameSink: Send + Sync {
    fn id(&self) -> &str;

    /// Queue an already-encoded frame. Must not block on network I/O.
    fn send_frame(&self, frame: Bytes);
}

/// Server-side handle to one device socket
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<Bytes>,
    closing: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// The I/O half of a connection, run on its own task by [`Connection::start`]
pub struct ConnectionDriver {
    id: ConnectionId,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    buffer: BytesMut,
    outbound: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    closing: Arc<AtomicBool>,
    shutdown: watch::Receiver<bool>,
}

impl Connection {
    /// Wrap an accepted socket.
    ///
    /// A fresh identifier is generated and the `ConnectAck` frame is queued
    /// immediately; nothing touches the socket until the driver is started.
    pub fn new(
        stream: TcpStream,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> io::Result<(Self, ConnectionDriver)> {
        let peer = stream.peer_addr()?;
        let id = uuid::Uuid::new_v4().to_string();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let closing = Arc::new(AtomicBool::new(false));

        let conn = Self {
            id: id.clone(),
            peer,
            outbound: outbound_tx,
            closing: closing.clone(),
            shutdown: shutdown_tx,
            task: Mutex::new(None),
        };

        let _ = events.send(ConnectionEvent::Log {
            level: LogLevel::Info,
            text: format!(
                "Connection created: {} ({}:{})",
                id,
                peer.ip(),
                peer.port()
            ),
        });
        conn.send(&Message::connect_ack(id.clone()));

        let (reader, writer) = stream.into_split();
        let driver = ConnectionDriver {
            id,
            reader,
            writer,
            buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
            outbound: outbound_rx,
            events,
            closing,
            shutdown: shutdown_rx,
        };

        Ok((conn, driver))
    }

    /// Create a connection and start driving it right away.
    pub fn accept(
        stream: TcpStream,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> io::Result<Self> {
        let (conn, driver) = Self::new(stream, events)?;
        conn.start(driver);
        Ok(conn)
    }

    /// Spawn the I/O task. Must be called from within a tokio runtime.
    pub fn start(&self, driver: ConnectionDriver) {
        let handle = tokio::spawn(driver.run());
        *self.task.lock() = Some(handle);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> Liveness {
        if self.closing.load(Ordering::SeqCst) {
            Liveness::Closing
        } else {
            Liveness::Active
        }
    }

    /// Encode and queue `message`. A no-op once the connection is closing.
    pub fn send<T: Serialize + ?Sized>(&self, message: &T) {
        if self.state() == Liveness::Closing {
            return;
        }
        match framing::encode(message) {
            Ok(frame) => self.send_frame(frame),
            Err(e) => tracing::warn!("Dropping unencodable message for {}: {}", self.id, e),
        }
    }

    /// Ask the driver to stop without waiting for it.
    pub fn request_close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.shutdown.send_replace(true);
    }

    /// Close the socket and wait until the driver has reported
    /// `Disconnected` and released it.
    pub async fn close(&self) {
        self.request_close();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("Connection task for {} ended abnormally: {}", self.id, e);
            }
        }
    }
}

impl FrameSink for Connection {
    fn id(&self) -> &str {
        &self.id
    }

    fn send_frame(&self, frame: Bytes) {
        if self.state() == Liveness::Closing {
            return;
        }
        // Receiver gone means the driver already exited
        let _ = self.outbound.send(frame);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.request_close();
    }
}

impl ConnectionDriver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                read = self.reader.read_buf(&mut self.buffer) => match read {
                    Ok(0) => {
                        tracing::debug!("Peer closed connection {}", self.id);
                        break;
                    }
                    Ok(n) => {
                        tracing::trace!("Read {} bytes from {}", n, self.id);
                        self.drain_frames();
                    }
                    Err(e) => {
                        tracing::warn!("Read error on {}: {}", self.id, e);
                        break;
                    }
                },

                frame = self.outbound.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = self.writer.write_all(&frame).await {
                            tracing::warn!("Write error on {}: {}", self.id, e);
                            break;
                        }
                    }
                    None => break,
                },

                _ = self.shutdown.changed() => {
                    tracing::debug!("Closing connection {} on request", self.id);
                    break;
                }
            }
        }

        self.closing.store(true, Ordering::SeqCst);
        let _ = self.writer.shutdown().await;

        self.emit(ConnectionEvent::Log {
            level: LogLevel::Info,
            text: format!("Client disconnected: {}", self.id),
        });
        self.emit(ConnectionEvent::Disconnected {
            id: self.id.clone(),
        });
    }

    fn drain_frames(&mut self) {
        loop {
            match framing::next_frame(&mut self.buffer) {
                Decoded::NotReady => break,
                Decoded::Message(message) => {
                    self.emit(ConnectionEvent::MessageReceived {
                        id: self.id.clone(),
                        message,
                    });
                }
                Decoded::Malformed { reason } => {
                    tracing::warn!("Invalid frame from {}: {}", self.id, reason);
                    self.emit(ConnectionEvent::Log {
                        level: LogLevel::Warning,
                        text: format!("Received invalid JSON from {}: {}", self.id, reason),
                    });
                }
            }
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }
}
