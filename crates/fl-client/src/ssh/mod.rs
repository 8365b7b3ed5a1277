//! Secure-shell subprocess plumbing
//!
//! Everything the endpoint state machine needs from the outside world
//! goes through the [`TunnelLauncher`] trait: asking a daemon for its
//! advertised port, launching the daemon, opening forward tunnels and
//! fetching the session credential. The production implementation
//! spawns an external `ssh` process; tests substitute a scripted mock.

mod launcher;

pub use launcher::SshLauncher;

use std::fmt;

use async_trait::async_trait;
use tokio::process::Child;

use fl_core::SubprocessError;

/// Seam between the endpoint state machine and the ssh subprocesses
#[async_trait]
pub trait TunnelLauncher: Send + Sync {
    /// Ask the daemon at `address` for its advertised listening port.
    ///
    /// `Ok(None)` means the command ran but no port was advertised
    /// (the daemon is not running yet); that is not an error here,
    /// the retry policy lives in the endpoint state machine.
    async fn ask_port(&self, address: &str) -> Result<Option<u16>, SubprocessError>;

    /// Start the daemon on `address`, detached.
    async fn launch_daemon(&self, address: &str) -> Result<(), SubprocessError>;

    /// Open a local forward tunnel to `remote_port` on `address` and
    /// wait until it accepts connections.
    async fn open_tunnel(
        &self,
        address: &str,
        remote_port: u16,
    ) -> Result<SecureTunnel, SubprocessError>;

    /// Fetch the X session credential for the login message.
    ///
    /// `None` when no display is available; login proceeds with an
    /// empty credential, as it does for local daemons.
    async fn session_credential(&self) -> Option<String>;
}

/// A local TCP forward to a daemon's port, backed by an ssh process.
///
/// Exclusively owned by one endpoint. Dropping the tunnel kills the
/// ssh process and with it the forward.
pub struct SecureTunnel {
    /// Local port the forward is bound to
    pub local_port: u16,
    /// Daemon port on the remote side
    pub remote_port: u16,
    /// Remote host the forward goes to
    pub remote_host: String,
    child: Option<Child>,
}

impl SecureTunnel {
    pub(crate) fn new(local_port: u16, remote_host: String, remote_port: u16, child: Child) -> Self {
        Self {
            local_port,
            remote_port,
            remote_host,
            child: Some(child),
        }
    }

    /// A tunnel record with no owned process, for forwards that are
    /// not backed by a subprocess (tests, pre-established forwards).
    pub fn detached(local_port: u16, remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            local_port,
            remote_port,
            remote_host: remote_host.into(),
            child: None,
        }
    }

    /// Kill the owning ssh process, tearing the forward down.
    pub fn close(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                tracing::debug!("Failed to kill tunnel process: {}", e);
            }
        }
    }
}

impl Drop for SecureTunnel {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for SecureTunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureTunnel")
            .field("local_port", &self.local_port)
            .field("remote_host", &self.remote_host)
            .field("remote_port", &self.remote_port)
            .finish()
    }
}
