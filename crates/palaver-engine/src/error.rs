//! Engine error types.

use std::io;

use thiserror::Error;

use crate::connection::ConnectionId;
use crate::socks5::Socks5Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur in the engine.
///
/// Only [`EngineError::Poll`] is returned from the event loop itself;
/// everything else is reported to the component that caused it.
#[derive(Debug, Error)]
pub enum EngineError {
    /// IO error on a socket or file.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The poll multiplexer failed.
    #[error("poll failed: {0}")]
    Poll(io::Error),

    /// Protocol error (framing, parsing).
    #[error("Protocol error: {0}")]
    Protocol(#[from] palaver_protocol::ProtocolError),

    /// SOCKS5 handshake failure.
    #[error("SOCKS5 error: {0}")]
    Socks5(#[from] Socks5Error),

    /// No connection with that id.
    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl EngineError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}
