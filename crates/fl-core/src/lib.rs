//! fl-core: shared types, errors and configuration for flowlink
//!
//! This crate provides the domain types (job status, connection state),
//! the error taxonomy, and the TOML configuration used by the client
//! engine and the CLI.

pub mod config;
pub mod error;
pub mod types;

pub use config::ClientConfig;
pub use error::{ClientError, ConfigError, ConnectionError, SubprocessError};
pub use types::{is_local_address, ConnectionState, JobKey, JobStatus};

/// Hostname of the machine this client runs on
pub fn local_hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}
