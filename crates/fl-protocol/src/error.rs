//! Protocol error types

use thiserror::Error;

/// Errors that can occur while encoding or decoding wire messages
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Message header could not be parsed
    #[error("Malformed message header: {0:?}")]
    MalformedHeader(String),

    /// Verb is not part of the protocol
    #[error("Unknown verb: {0:?}")]
    UnknownVerb(String),

    /// Declared payload length exceeds the sanity cap
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Payload did not split into the expected number of arguments
    #[error("{verb} payload does not contain {expected} arguments")]
    ArgumentMismatch { verb: &'static str, expected: usize },

    /// Argument length prefix points past the end of the payload
    #[error("Truncated argument: declared {declared} bytes, {available} available")]
    TruncatedArgument { declared: usize, available: usize },

    /// Argument bytes are not valid UTF-8
    #[error("Argument is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// A reply arrived with no request awaiting one
    #[error("RET received with no pending request")]
    UnexpectedReply,

    /// A verb arrived on a side of the connection that never receives it
    #[error("Verb {0} is not valid in this direction")]
    UnexpectedVerb(&'static str),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
