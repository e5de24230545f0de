//! State enums for the TCP server and client.

/// Current state of a [`TcpClient`](crate::TcpClient).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpClientState {
    /// Not connected to any server.
    Disconnected,
    /// Currently attempting to connect.
    Connecting,
    /// Connected and ready to send/receive data.
    Connected,
}

impl Default for TcpClientState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl std::fmt::Display for TcpClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

/// Current state of a [`TcpServer`](crate::TcpServer).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpServerState {
    /// Server is not running.
    Stopped,
    /// Server is starting up.
    Starting,
    /// Server is listening for connections.
    Listening,
    /// Server is shutting down.
    Stopping,
}

impl Default for TcpServerState {
    fn default() -> Self {
        Self::Stopped
    }
}

impl std::fmt::Display for TcpServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Starting => write!(f, "Starting"),
            Self::Listening => write!(f, "Listening"),
            Self::Stopping => write!(f, "Stopping"),
        }
    }
}
