//! Listening socket, acceptor loop and event relay
//!
//! [`Aggregator`] is the control surface offered to a presentation layer:
//! `start_listening`, `stop_listening`, `broadcast` and `unicast`. It is
//! cheap to clone and every method may be called from any task or thread.
//!
//! ```text
//!  TcpListener ──accept──► Connection ──ConnectionEvent──┐
//!       │                      ▲                         ▼
//!       │                      │ send_frame        relay task ──ServerEvent──► presentation
//!       └──insert──► ConnectionRegistry ◄──remove──────┘
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::aggregator::connection::{Connection, ConnectionId};
use crate::aggregator::events::{ConnectionEvent, LogLevel, ServerEvent};
use crate::aggregator::registry::{ConnectionRegistry, RegistryStats};
use crate::error::{FleetError, Result};

/// Handle to a running accept loop
struct Acceptor {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Inner {
    host: IpAddr,
    registry: Arc<ConnectionRegistry>,
    events: mpsc::UnboundedSender<ServerEvent>,
    connection_events: mpsc::UnboundedSender<ConnectionEvent>,
    acceptor: tokio::sync::Mutex<Option<Acceptor>>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
    relay: JoinHandle<()>,
}

/// The aggregator server: listener, acceptor and connection registry
#[derive(Clone)]
pub struct Aggregator {
    inner: Arc<Inner>,
}

impl Aggregator {
    /// Create an aggregator that will bind on `host`.
    ///
    /// Returns the receiving end of the event stream. Must be called from
    /// within a tokio runtime.
    pub fn new(host: IpAddr) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(ConnectionRegistry::new());

        let relay = tokio::spawn(relay_events(conn_rx, registry.clone(), events_tx.clone()));

        let inner = Inner {
            host,
            registry,
            events: events_tx,
            connection_events: conn_tx,
            acceptor: tokio::sync::Mutex::new(None),
            local_addr: parking_lot::Mutex::new(None),
            relay,
        };

        (
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        )
    }

    /// Bind and start accepting connections.
    ///
    /// Calling this while already listening is a no-op that returns the
    /// existing address. A bind failure is reported both as an error log
    /// event and as the returned error; it is not retried.
    pub async fn start_listening(&self, port: u16) -> Result<SocketAddr> {
        let mut acceptor = self.inner.acceptor.lock().await;
        if let Some(existing) = acceptor.as_ref() {
            tracing::debug!("Already listening on {}", existing.local_addr);
            return Ok(existing.local_addr);
        }

        let addr = SocketAddr::new(self.inner.host, port);
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) => {
                tracing::error!("Failed to listen on {}: {}", addr, source);
                self.emit(ServerEvent::log(
                    LogLevel::Error,
                    format!("Failed to listen on port {} : {}", port, source),
                ));
                return Err(FleetError::Bind { addr, source });
            }
        };
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            listener,
            self.inner.registry.clone(),
            self.inner.connection_events.clone(),
            self.inner.events.clone(),
            shutdown_rx,
        ));

        *acceptor = Some(Acceptor {
            local_addr,
            shutdown: shutdown_tx,
            task,
        });
        *self.inner.local_addr.lock() = Some(local_addr);

        tracing::info!("Aggregator listening on {}", local_addr);
        self.emit(ServerEvent::log(
            LogLevel::Info,
            format!("Server listening on port {}", local_addr.port()),
        ));
        Ok(local_addr)
    }

    /// Stop accepting, then close and deregister every connection.
    ///
    /// Each closed connection still produces its `ConnectionClosed` event.
    /// Idempotent.
    pub async fn stop_listening(&self) {
        // Held until every connection is closed so a concurrent
        // `start_listening` cannot accept into a registry being drained
        let mut guard = self.inner.acceptor.lock().await;
        let acceptor = guard.take();
        let was_listening = acceptor.is_some();

        if let Some(acceptor) = acceptor {
            acceptor.shutdown.send_replace(true);
            if let Err(e) = acceptor.task.await {
                tracing::warn!("Accept loop ended abnormally: {}", e);
            }
            *self.inner.local_addr.lock() = None;
            tracing::info!("Stopped listening on {}", acceptor.local_addr);
        }

        let connections = self.inner.registry.drain();
        let closed = connections.len();
        for conn in connections {
            conn.close().await;
        }
        drop(guard);

        if was_listening || closed > 0 {
            self.emit(ServerEvent::log(LogLevel::Info, "Server stopped"));
        }
    }

    /// Queue `message` for every connected device.
    pub fn broadcast<T: Serialize + ?Sized>(&self, message: &T) -> Result<usize> {
        let count = self.inner.registry.broadcast(message)?;
        tracing::debug!("Broadcast queued for {} connections", count);
        Ok(count)
    }

    /// Queue `message` for one device; unknown ids are ignored.
    pub fn unicast<T: Serialize + ?Sized>(&self, id: &str, message: &T) -> Result<bool> {
        self.inner.registry.unicast(id, message)
    }

    pub fn is_listening(&self) -> bool {
        self.inner.local_addr.lock().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.inner.registry.ids()
    }

    pub fn stats(&self) -> RegistryStats {
        self.inner.registry.stats()
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.inner.events.send(event);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(acceptor) = self.acceptor.get_mut().take() {
            acceptor.shutdown.send_replace(true);
            acceptor.task.abort();
        }
        for conn in self.registry.drain() {
            conn.request_close();
        }
        self.relay.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    connection_events: mpsc::UnboundedSender<ConnectionEvent>,
    events: mpsc::UnboundedSender<ServerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tracing::info!("Accepted connection from {}", addr);
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
                    }
                    let (conn, driver) = match Connection::new(stream, connection_events.clone()) {
                        Ok(parts) => parts,
                        Err(e) => {
                            tracing::warn!("Dropping connection from {}: {}", addr, e);
                            continue;
                        }
                    };

                    // Register before the driver runs so a disconnect can
                    // never be observed ahead of the registration
                    let conn = Arc::new(conn);
                    let id = conn.id().to_string();
                    let peer = conn.peer_addr();
                    registry.insert(conn.clone());
                    let _ = events.send(ServerEvent::ConnectionOpened {
                        id,
                        ip: peer.ip(),
                        port: peer.port(),
                    });
                    conn.start(driver);
                }
                Err(e) => {
                    tracing::warn!("Failed to accept connection: {}", e);
                    let _ = events.send(ServerEvent::log(
                        LogLevel::Warning,
                        format!("Failed to accept connection: {}", e),
                    ));
                }
            },

            _ = shutdown.changed() => break,
        }
    }
}

/// Turn per-connection events into server events, deregistering
/// connections as they go away.
async fn relay_events(
    mut connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    registry: Arc<ConnectionRegistry>,
    events: mpsc::UnboundedSender<ServerEvent>,
) {
    while let Some(event) = connection_events.recv().await {
        let upward = match event {
            ConnectionEvent::MessageReceived { id, message } => {
                ServerEvent::DataReceived { id, message }
            }
            ConnectionEvent::Disconnected { id } => {
                registry.remove(&id);
                ServerEvent::ConnectionClosed { id }
            }
            ConnectionEvent::Log { level, text } => ServerEvent::Log { level, text },
        };
        let _ = events.send(upward);
    }
}
