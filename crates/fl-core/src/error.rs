//! Error taxonomy for the flowlink client
//!
//! Connection and subprocess failures are recoverable (the endpoint
//! state machine retries within its budget or the user reconnects);
//! protocol failures are fatal to the affected connection only. Every
//! user-visible variant carries the endpoint address so multi-server
//! setups stay diagnosable.

use fl_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the flowlink client
#[derive(Error, Debug)]
pub enum ClientError {
    /// Malformed frame or unrecognized verb; fatal to that connection
    #[error("Protocol error on '{address}': {source}")]
    Protocol {
        address: String,
        #[source]
        source: ProtocolError,
    },

    /// Socket-level failure; recoverable by reconnect
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Secure-shell tunnel or launch failure
    #[error("Subprocess error: {0}")]
    Subprocess(#[from] SubprocessError),

    /// Port discovery gave up after the retry budget
    #[error("Could not discover a daemon port on '{address}' after {attempts} attempts")]
    RetryExhausted { address: String, attempts: u32 },

    /// Daemon refused an operation; the connection stays open
    #[error("Server '{address}' refused the operation ({category}): {detail}")]
    Permission {
        address: String,
        category: String,
        detail: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Wrap a protocol error with the endpoint it occurred on
    pub fn protocol(address: impl Into<String>, source: ProtocolError) -> Self {
        Self::Protocol {
            address: address.into(),
            source,
        }
    }
}

/// Socket-level errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// TCP connect failed
    #[error("Could not connect to '{address}': {source}")]
    ConnectFailed {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Connection timed out
    #[error("Connection to '{address}' timed out")]
    Timeout { address: String },

    /// Peer closed the connection or the socket errored mid-session
    #[error("Connection to '{address}' lost")]
    Lost { address: String },

    /// Operation requires a logged-in endpoint
    #[error("Not connected to '{address}'")]
    NotConnected { address: String },
}

/// Secure-shell subprocess failures
#[derive(Error, Debug)]
pub enum SubprocessError {
    /// The subprocess could not be started at all
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The subprocess wrote to stderr; it was killed and the text surfaced
    #[error("Error contacting '{address}' via ssh: {stderr}")]
    Stderr { address: String, stderr: String },

    /// The subprocess exited with a nonzero status and no stderr
    #[error("ssh to '{address}' exited with status {code}")]
    Exit { address: String, code: i32 },

    /// The subprocess ran past its time budget and was killed
    #[error("ssh to '{address}' timed out")]
    Timeout { address: String },

    /// No free local port could be found for the tunnel
    #[error("No free local port available for the tunnel to '{address}'")]
    NoLocalPort { address: String },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Could not read or write the config file
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
