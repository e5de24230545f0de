//! TCP server: accept loop, connection registry, admission control.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::connection::{ConnectionHost, ConnectionId, TcpConnection, spawn_receive_loop};
use crate::error::{Result, TcpError};
use crate::provider::{AdmissionDecision, ServiceProvider};
use crate::state::TcpServerState;

/// The server's set of live connections.
///
/// Connection IDs are monotonically increasing, so iterating the map visits
/// connections in the order they were accepted.
struct Registry {
    connections: RwLock<BTreeMap<ConnectionId, Arc<TcpConnection>>>,
}

impl Registry {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: RwLock::new(BTreeMap::new()),
        })
    }
}

impl ConnectionHost for Registry {
    fn detach(&self, id: ConnectionId) {
        self.connections.write().remove(&id);
    }
}

/// Mutable server lifecycle state, guarded by one mutex.
struct ServerInner {
    state: TcpServerState,
    local_addr: Option<SocketAddr>,
    shutdown: Option<Arc<Notify>>,
    accept_task: Option<JoinHandle<()>>,
}

/// A TCP server that delivers connection events to a [`ServiceProvider`].
///
/// The server listens on the configured port, registers every accepted
/// connection, and arms a per-connection receive loop that notifies the
/// provider when data arrives or the peer disconnects. A configurable
/// maximum connection count gates admission: once the limit is reached the
/// provider's `admission_overflow` decision determines whether further
/// connections are admitted or closed on the spot.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use tcplink::TcpServer;
///
/// let server = TcpServer::new(Arc::new(MyProvider), 8080);
/// server.start().await?;
/// server.broadcast(b"hello everyone").await;
/// server.stop().await;
/// ```
pub struct TcpServer {
    provider: Arc<dyn ServiceProvider>,
    port: u16,
    max_connections: Arc<AtomicUsize>,
    registry: Arc<Registry>,
    inner: Mutex<ServerInner>,
}

impl TcpServer {
    /// Create a new server that will listen on `port` and report events to
    /// `provider`. No socket is touched until [`start`](Self::start).
    pub fn new(provider: Arc<dyn ServiceProvider>, port: u16) -> Self {
        Self {
            provider,
            port,
            max_connections: Arc::new(AtomicUsize::new(0)),
            registry: Registry::new(),
            inner: Mutex::new(ServerInner {
                state: TcpServerState::Stopped,
                local_addr: None,
                shutdown: None,
                accept_task: None,
            }),
        }
    }

    /// Get the configured port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get the current server state.
    pub fn state(&self) -> TcpServerState {
        self.inner.lock().state
    }

    /// Check if the server is listening.
    pub fn is_listening(&self) -> bool {
        self.inner.lock().state == TcpServerState::Listening
    }

    /// Get the actual local address after the server has started.
    ///
    /// Returns `None` if the server is not listening. This is useful when
    /// binding to port 0 to get the actual assigned port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().local_addr
    }

    /// Get the maximum number of concurrent connections. 0 means unbounded.
    pub fn max_connections(&self) -> usize {
        self.max_connections.load(Ordering::SeqCst)
    }

    /// Set the maximum number of concurrent connections. 0 means unbounded.
    ///
    /// Lowering the limit below the current count does not disconnect
    /// anyone; it only affects admission of new connections.
    pub fn set_max_connections(&self, max: usize) {
        self.max_connections.store(max, Ordering::SeqCst);
    }

    /// Get the number of active connections.
    pub fn connection_count(&self) -> usize {
        self.registry.connections.read().len()
    }

    /// Get a list of all active connection IDs, in accept order.
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.registry.connections.read().keys().copied().collect()
    }

    /// Get a connection by ID.
    pub fn get_connection(&self, id: ConnectionId) -> Option<Arc<TcpConnection>> {
        self.registry.connections.read().get(&id).cloned()
    }

    /// Start listening for connections.
    ///
    /// Returns `Ok(true)` when this call transitioned the server from
    /// stopped to listening, `Ok(false)` when the server was already
    /// starting or listening, and the bind error when the configured port
    /// cannot be bound (the server ends Stopped in that case).
    pub async fn start(&self) -> Result<bool> {
        {
            let mut inner = self.inner.lock();
            if inner.state != TcpServerState::Stopped {
                return Ok(false);
            }
            inner.state = TcpServerState::Starting;
        }

        let listener = match TcpListener::bind(("0.0.0.0", self.port)).await {
            Ok(listener) => listener,
            Err(err) => {
                self.inner.lock().state = TcpServerState::Stopped;
                return Err(err.into());
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                self.inner.lock().state = TcpServerState::Stopped;
                return Err(err.into());
            }
        };

        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(run_accept_loop(
            listener,
            self.registry.clone(),
            self.provider.clone(),
            self.max_connections.clone(),
            shutdown.clone(),
        ));

        let mut inner = self.inner.lock();
        inner.local_addr = Some(local_addr);
        inner.shutdown = Some(shutdown);
        inner.accept_task = Some(task);
        inner.state = TcpServerState::Listening;
        tracing::info!(target: "tcplink::server", "Listening on {}", local_addr);
        Ok(true)
    }

    /// Stop the server.
    ///
    /// Stops accepting, then closes and drops every registered connection,
    /// invoking the provider's `closing` callback for each. Returns whether
    /// this call transitioned the server from listening to stopped.
    pub async fn stop(&self) -> bool {
        let (shutdown, task) = {
            let mut inner = self.inner.lock();
            if inner.state != TcpServerState::Listening {
                return false;
            }
            inner.state = TcpServerState::Stopping;
            (inner.shutdown.take(), inner.accept_task.take())
        };

        if let Some(shutdown) = shutdown {
            // notify_one stores a permit when the accept task is not
            // currently parked on notified(), so a stop racing task
            // startup or an in-flight callback cannot lose the wakeup.
            shutdown.notify_one();
        }
        if let Some(task) = task {
            let _ = task.await;
        }

        // Swap the whole registry out under the exclusive lock so no new
        // entry can interleave with the drain.
        let drained = std::mem::take(&mut *self.registry.connections.write());
        for conn in drained.into_values() {
            if conn.claim_close() {
                self.provider.closing(&conn).await;
            }
            conn.close();
        }

        let mut inner = self.inner.lock();
        inner.local_addr = None;
        inner.state = TcpServerState::Stopped;
        tracing::info!(target: "tcplink::server", "Stopped");
        true
    }

    /// Write `data` to every registered connection.
    ///
    /// Each connection gets one [`write`](TcpConnection::write) attempt; a
    /// failure or write-readiness timeout on one connection never aborts
    /// delivery to the others and is not retried.
    pub async fn broadcast(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let targets: Vec<Arc<TcpConnection>> =
            self.registry.connections.read().values().cloned().collect();
        tracing::debug!(
            target: "tcplink::server",
            "Broadcasting {} bytes to {} connections", data.len(), targets.len()
        );
        for conn in targets {
            match conn.write(data, 0, data.len()).await {
                Ok(n) if n == data.len() => {}
                Ok(_) => {
                    tracing::debug!(
                        target: "tcplink::server",
                        "Broadcast to {} timed out waiting for write readiness", conn.id()
                    );
                }
                Err(err) => {
                    tracing::debug!(
                        target: "tcplink::server",
                        "Broadcast to {} failed: {}", conn.id(), err
                    );
                }
            }
        }
    }

    /// Disconnect a specific client.
    ///
    /// Removes the connection from the registry, invokes the provider's
    /// `closing` callback, and closes the socket. Returns `false` when the
    /// ID is not registered.
    pub async fn disconnect_client(&self, id: ConnectionId) -> bool {
        let Some(conn) = self.registry.connections.write().remove(&id) else {
            return false;
        };
        if conn.claim_close() {
            self.provider.closing(&conn).await;
        }
        conn.close();
        true
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("port", &self.port)
            .field("state", &self.state())
            .field("connections", &self.connection_count())
            .field("max_connections", &self.max_connections())
            .finish()
    }
}

/// Accept loop task.
///
/// Runs until the shutdown notify fires. Each accepted socket is wrapped,
/// passed through admission control, registered, announced through the
/// provider's `connected` callback, and handed its own receive loop. Accept
/// errors are reported through the `exception` callback (with no
/// connection) and the loop keeps accepting.
async fn run_accept_loop(
    listener: TcpListener,
    registry: Arc<Registry>,
    provider: Arc<dyn ServiceProvider>,
    max_connections: Arc<AtomicUsize>,
    shutdown: Arc<Notify>,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.notified() => break,
            accepted = listener.accept() => accepted,
        };

        let stream = match accepted {
            Ok((stream, _)) => stream,
            Err(err) => {
                tracing::warn!(target: "tcplink::server", "Accept error: {}", err);
                let err = TcpError::from(err);
                provider.exception(None, &err).await;
                continue;
            }
        };

        let conn = match TcpConnection::new(stream) {
            Ok(conn) => conn,
            Err(err) => {
                provider.exception(None, &err).await;
                continue;
            }
        };

        // Admission control and registration in one critical section. The
        // upgradable guard keeps count and broadcast readers unblocked
        // while the provider's overflow decision is pending; only the
        // insert itself takes the write lock.
        let admitted = {
            let guard = registry.connections.upgradable_read();
            let max = max_connections.load(Ordering::SeqCst);
            let over_limit = max != 0 && guard.len() >= max;
            if over_limit && provider.admission_overflow(&conn) == AdmissionDecision::Reject {
                false
            } else {
                if over_limit {
                    tracing::debug!(
                        target: "tcplink::server",
                        "Provider admitted {} past the limit of {}", conn.id(), max
                    );
                }
                let mut guard = RwLockUpgradableReadGuard::upgrade(guard);
                guard.insert(conn.id(), conn.clone());
                true
            }
        };

        if !admitted {
            tracing::debug!(
                target: "tcplink::server",
                "Rejected {} from {}: connection limit reached", conn.id(), conn.peer_addr()
            );
            if conn.claim_close() {
                provider.closing(&conn).await;
            }
            conn.close();
            continue;
        }

        tracing::debug!(
            target: "tcplink::server",
            "Accepted {} from {}", conn.id(), conn.peer_addr()
        );
        provider.connected(&conn).await;
        spawn_receive_loop(conn, provider.clone(), registry.clone());
    }
}
