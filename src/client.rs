//! TCP client: blocking connect, single connection, shared receive loop.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpStream;

use crate::connection::{ConnectionHost, ConnectionId, TcpConnection, spawn_receive_loop};
use crate::error::{Result, TcpError};
use crate::provider::ServiceProvider;
use crate::state::TcpClientState;

/// The client's single connection slot.
///
/// Doubles as the receive loop's [`ConnectionHost`]: when the loop exits it
/// detaches the connection, which clears the slot and returns the client to
/// the disconnected state.
struct ClientSlot {
    inner: Mutex<SlotInner>,
}

struct SlotInner {
    state: TcpClientState,
    connection: Option<Arc<TcpConnection>>,
}

impl ConnectionHost for ClientSlot {
    fn detach(&self, id: ConnectionId) {
        let mut inner = self.inner.lock();
        if inner.connection.as_ref().is_some_and(|c| c.id() == id) {
            inner.connection = None;
            inner.state = TcpClientState::Disconnected;
        }
    }
}

/// A TCP client that delivers connection events to a [`ServiceProvider`].
///
/// The client owns at most one connection at a time. [`connect`](Self::connect)
/// blocks its caller until the TCP handshake resolves, then arms the same
/// receive loop the server uses for its connections: the provider's
/// `data_ready` callback fires whenever bytes arrive, and its `closing`
/// callback fires when the peer disconnects or [`disconnect`](Self::disconnect)
/// is called.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use tcplink::TcpClient;
///
/// let client = TcpClient::new(Arc::new(MyProvider));
/// client.connect("127.0.0.1", 8080).await?;
/// if let Some(conn) = client.socket() {
///     conn.write(b"hello", 0, 5).await?;
/// }
/// client.disconnect(true).await?;
/// ```
pub struct TcpClient {
    provider: Arc<dyn ServiceProvider>,
    slot: Arc<ClientSlot>,
}

impl TcpClient {
    /// Create a new client that will report events to `provider`.
    pub fn new(provider: Arc<dyn ServiceProvider>) -> Self {
        Self {
            provider,
            slot: Arc::new(ClientSlot {
                inner: Mutex::new(SlotInner {
                    state: TcpClientState::Disconnected,
                    connection: None,
                }),
            }),
        }
    }

    /// Get the current connection state.
    pub fn state(&self) -> TcpClientState {
        self.slot.inner.lock().state
    }

    /// Check if the client is connected.
    pub fn is_connected(&self) -> bool {
        self.slot.inner.lock().state == TcpClientState::Connected
    }

    /// Get the active connection, if any.
    pub fn socket(&self) -> Option<Arc<TcpConnection>> {
        self.slot.inner.lock().connection.clone()
    }

    /// Connect to `address:port`.
    ///
    /// Fails with [`TcpError::AlreadyConnected`] when a connection is
    /// already established or being established. On success the provider's
    /// `connected` callback has fired and the receive loop is armed before
    /// this returns. On failure the client is back in the disconnected
    /// state with no partial state retained.
    pub async fn connect(&self, address: &str, port: u16) -> Result<()> {
        {
            let mut inner = self.slot.inner.lock();
            if inner.state != TcpClientState::Disconnected {
                return Err(TcpError::AlreadyConnected);
            }
            inner.state = TcpClientState::Connecting;
        }

        let conn = match self.establish(address, port).await {
            Ok(conn) => conn,
            Err(err) => {
                self.slot.inner.lock().state = TcpClientState::Disconnected;
                return Err(err);
            }
        };

        {
            let mut inner = self.slot.inner.lock();
            inner.connection = Some(conn.clone());
            inner.state = TcpClientState::Connected;
        }
        tracing::debug!(
            target: "tcplink::client",
            "Connected {} to {}", conn.id(), conn.peer_addr()
        );

        self.provider.connected(&conn).await;
        spawn_receive_loop(conn, self.provider.clone(), self.slot.clone());
        Ok(())
    }

    /// Resolve, connect, and wrap the socket.
    async fn establish(&self, address: &str, port: u16) -> Result<Arc<TcpConnection>> {
        let stream = TcpStream::connect((address, port)).await?;
        TcpConnection::new(stream)
    }

    /// Disconnect from the server.
    ///
    /// Fails with [`TcpError::NotConnected`] when no connection is
    /// established. When `notify_provider` is true the provider's `closing`
    /// callback is invoked before the socket is closed; when false the
    /// connection is torn down silently.
    pub async fn disconnect(&self, notify_provider: bool) -> Result<()> {
        let conn = {
            let mut inner = self.slot.inner.lock();
            if inner.state != TcpClientState::Connected {
                return Err(TcpError::NotConnected);
            }
            inner.state = TcpClientState::Disconnected;
            inner.connection.take()
        };
        let Some(conn) = conn else {
            return Err(TcpError::NotConnected);
        };

        if conn.claim_close() && notify_provider {
            self.provider.closing(&conn).await;
        }
        conn.close();
        tracing::debug!(target: "tcplink::client", "Disconnected {}", conn.id());
        Ok(())
    }
}

impl std::fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.slot.inner.lock();
        f.debug_struct("TcpClient")
            .field("state", &inner.state)
            .field(
                "peer_addr",
                &inner.connection.as_ref().map(|c| c.peer_addr()),
            )
            .finish()
    }
}
