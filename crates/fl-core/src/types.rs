//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Execution status of a job, as reported by the daemon
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Job is still producing output
    Running,
    /// Job completed successfully
    Finished,
    /// Job terminated with an error
    Failed,
    /// Daemon reported a status this client does not recognize
    #[default]
    Unknown,
}

impl JobStatus {
    /// Wire string for this status
    pub fn as_wire(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Unknown => "unknown",
        }
    }

    /// Parse a daemon-reported status string.
    ///
    /// Unrecognized strings map to `Unknown` rather than failing: an
    /// older client must still track jobs run by a newer daemon.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "running" => JobStatus::Running,
            "finished" => JobStatus::Finished,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Unknown,
        }
    }

    /// Whether this status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// Connection lifecycle state of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No connection; the endpoint can be (re)connected
    Disconnected,
    /// Querying the daemon's advertised port over a one-shot shell command
    AskPort,
    /// Starting the daemon because no port was advertised
    Launch,
    /// Opening a local forward tunnel to the daemon's port
    OpenTunnel,
    /// TCP connection in progress
    Connect,
    /// Socket established; login may or may not have completed yet
    Connected,
    /// Terminal failure; surfaced to the user, no further attempts
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::AskPort => "asking port",
            ConnectionState::Launch => "launching daemon",
            ConnectionState::OpenTunnel => "opening tunnel",
            ConnectionState::Connect => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Registry key for a job: the endpoint that produced it plus the
/// daemon-assigned job id. At most one job record exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    /// Address of the owning endpoint
    pub endpoint: String,
    /// Daemon-assigned job id, unique within that endpoint
    pub id: String,
}

impl JobKey {
    /// Create a new job key
    pub fn new(endpoint: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.endpoint)
    }
}

/// Whether an address refers to the machine the client runs on.
///
/// Local endpoints skip the ssh tunnel entirely and run the daemon
/// through a plain login shell.
pub fn is_local_address(address: &str) -> bool {
    matches!(address, "127.0.0.1" | "localhost" | "::1")
}
