//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while framing and parsing the XML stream.
///
/// Only [`ProtocolError::is_fatal`] errors end the stream; the rest are
/// confined to the stanza that caused them.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The underlying XML parser rejected the input.
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    /// Stanza bytes were not valid UTF-8.
    #[error("stanza is not valid UTF-8")]
    InvalidUtf8,

    /// A stanza that could be framed but not turned into an element.
    #[error("invalid stanza: {0}")]
    InvalidStanza(String),

    /// An element or attribute used a prefix with no namespace binding.
    #[error("unbound namespace prefix: {prefix}")]
    UnboundPrefix { prefix: String },

    /// The first element of the stream was not a stream header.
    #[error("invalid stream start: <{name}> in namespace '{namespace}'")]
    InvalidStreamStart { name: String, namespace: String },

    /// Markup that cannot occur in a well-formed stream, such as an end tag
    /// before any start tag.
    #[error("malformed stream: {0}")]
    MalformedStream(String),

    /// A single stanza grew beyond the buffer limit.
    #[error("stanza too large: {size} bytes (max: {max})")]
    StanzaTooLarge { size: usize, max: usize },

    /// Data arrived after the stream was closed.
    #[error("stream is closed")]
    StreamClosed,
}

impl ProtocolError {
    /// Creates an unbound prefix error.
    pub fn unbound_prefix(prefix: impl Into<String>) -> Self {
        Self::UnboundPrefix {
            prefix: prefix.into(),
        }
    }

    /// Returns true if the error terminates the whole stream rather than a
    /// single stanza.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidStreamStart { .. }
                | Self::MalformedStream(_)
                | Self::StanzaTooLarge { .. }
                | Self::StreamClosed
        )
    }
}

/// Failures of the stream management negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    /// The server answered `<failed/>`.
    #[error("negotiation rejected by server: {}", .condition.as_deref().unwrap_or("no condition"))]
    Rejected { condition: Option<String> },

    /// No answer arrived before the deadline.
    #[error("negotiation timed out")]
    Timeout,

    /// The server does not implement the feature.
    #[error("stream management is not supported by the server")]
    Unsupported,

    /// Local state does not allow the request, or the server's counters do
    /// not match ours.
    #[error("stream management consistency error: {0}")]
    ConsistencyError(String),
}
