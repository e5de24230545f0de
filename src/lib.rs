//! Event-driven TCP server and client library.
//!
//! tcplink manages connection lifecycles at the socket level and delivers
//! events to an embedder-supplied [`ServiceProvider`]: embedders implement
//! the callbacks they care about and never touch raw sockets.
//!
//! - **[`TcpServer`]**: accept loop, live connection registry, admission
//!   control against a configurable connection limit, broadcast to every
//!   registered connection, controlled shutdown.
//! - **[`TcpClient`]**: blocking connect and a single owned connection,
//!   with the same event loop semantics as a server-side connection.
//! - **[`TcpConnection`]**: the per-connection socket wrapper with the
//!   library's read/write contract: bounded-wait writes that report
//!   backpressure by returning 0, and non-blocking reads fed by a one-byte
//!   lookahead so data arrival is detected before the provider decides how
//!   much to consume.
//!
//! No message framing is imposed: `data_ready` reports raw byte arrival,
//! and the provider drains the socket however its protocol requires.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use tcplink::{ServiceProvider, TcpConnection, TcpServer};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl ServiceProvider for Echo {
//!     async fn connected(&self, conn: &Arc<TcpConnection>) {
//!         println!("new connection from {}", conn.peer_addr());
//!     }
//!
//!     async fn data_ready(&self, conn: &Arc<TcpConnection>) {
//!         let mut buf = [0u8; 4096];
//!         let len = buf.len();
//!         while let Ok(n) = conn.read(&mut buf, 0, len) {
//!             if n == 0 {
//!                 break;
//!             }
//!             let _ = conn.write(&buf, 0, n).await;
//!         }
//!     }
//! }
//!
//! let server = TcpServer::new(Arc::new(Echo), 8080);
//! server.start().await?;
//! ```
//!
//! # Threading
//!
//! Callbacks run on whichever tokio worker delivered the event. Callbacks
//! for different connections may run in parallel; callbacks for a single
//! connection are strictly sequential, because the next receive is armed
//! only after the previous callback returns. The library never installs a
//! tracing subscriber; that is the embedding application's job.

mod client;
mod connection;
mod error;
mod provider;
mod server;
mod state;

pub use client::TcpClient;
pub use connection::{ConnectionId, TcpConnection};
pub use error::{Result, TcpError};
pub use provider::{AdmissionDecision, ServiceProvider};
pub use server::TcpServer;
pub use state::{TcpClientState, TcpServerState};
