//! Error types for TCP socket operations.

use std::io;

use thiserror::Error;

/// Errors produced by the TCP server, client, and connection types.
#[derive(Error, Debug)]
pub enum TcpError {
    /// The supplied buffer has zero length.
    #[error("buffer is empty")]
    EmptyBuffer,

    /// The offset/count pair does not describe a region inside the buffer.
    #[error("offset {offset} with count {count} is out of range for a buffer of {len} bytes")]
    OutOfRange {
        /// Requested start position within the buffer.
        offset: usize,
        /// Requested number of bytes.
        count: usize,
        /// Actual buffer length.
        len: usize,
    },

    /// The connection has been closed; no further reads or writes are possible.
    #[error("connection is closed")]
    Closed,

    /// `connect` was called while a connection is already established.
    #[error("client is already connected")]
    AlreadyConnected,

    /// An operation that requires an established connection was called without one.
    #[error("client is not connected")]
    NotConnected,

    /// Transport-level socket failure.
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// Whether an I/O error kind represents a routine peer-initiated reset.
///
/// Resets are ordinary disconnects: they are reported through the provider's
/// `closing` callback only, never through `exception`.
pub(crate) fn is_routine_reset(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

/// A specialized Result type for TCP operations.
pub type Result<T> = std::result::Result<T, TcpError>;
