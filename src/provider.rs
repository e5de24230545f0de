//! The service-provider contract: embedder callbacks for connection events.

use std::sync::Arc;

use async_trait::async_trait;

use crate::connection::TcpConnection;
use crate::error::TcpError;

/// Decision returned by [`ServiceProvider::admission_overflow`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// Refuse the connection; it is closed without ever entering the registry.
    Reject,
    /// Admit the connection even though the configured maximum is reached.
    AllowAnyway,
}

/// Callbacks through which the server and client deliver connection events.
///
/// Embedders implement the events they care about; every method has a no-op
/// default. Callbacks run on whichever worker task delivered the event:
/// callbacks for different connections may execute in parallel, but for a
/// single connection they are strictly sequential, because the next receive
/// is armed only after the previous callback returns.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use async_trait::async_trait;
/// use tcplink::{ServiceProvider, TcpConnection};
///
/// struct Echo;
///
/// #[async_trait]
/// impl ServiceProvider for Echo {
///     async fn data_ready(&self, conn: &Arc<TcpConnection>) {
///         let mut buf = [0u8; 4096];
///         let len = buf.len();
///         while let Ok(n) = conn.read(&mut buf, 0, len) {
///             if n == 0 {
///                 break;
///             }
///             let _ = conn.write(&buf, 0, n).await;
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait ServiceProvider: Send + Sync + 'static {
    /// Called once for every connection that is accepted or established.
    async fn connected(&self, connection: &Arc<TcpConnection>) {
        let _ = connection;
    }

    /// Called when at least one byte is available on the connection.
    ///
    /// Drain the available bytes by calling [`TcpConnection::read`] until it
    /// returns 0. Bytes left unread are not lost; they trigger another
    /// notification the next time the socket reports readiness.
    async fn data_ready(&self, connection: &Arc<TcpConnection>) {
        let _ = connection;
    }

    /// Called before a connection's socket is closed, on every path: peer
    /// closure, local disconnect, transport error, and server shutdown.
    async fn closing(&self, connection: &Arc<TcpConnection>) {
        let _ = connection;
    }

    /// Called for internal faults that are not routine peer resets.
    ///
    /// `connection` is `None` when the fault occurred before a connection
    /// existed, such as a failure in the accept path.
    async fn exception(&self, connection: Option<&Arc<TcpConnection>>, error: &TcpError) {
        let _ = (connection, error);
    }

    /// Called on the server side when an incoming connection would exceed the
    /// configured maximum.
    ///
    /// This runs synchronously inside the admission critical section, before
    /// the connection is registered. Return [`AdmissionDecision::AllowAnyway`]
    /// to admit the connection regardless of the limit.
    fn admission_overflow(&self, connection: &Arc<TcpConnection>) -> AdmissionDecision {
        let _ = connection;
        AdmissionDecision::Reject
    }
}
