//! External ssh subprocess launcher
//!
//! Fixed command templates, mirroring what an operator would type:
//!
//! - port discovery: `ssh -x <addr> 'test -e <portfile> && cat <portfile> || true'`
//! - daemon launch:  `ssh -f -x <addr> '<daemon>'`
//! - tunnel:         `ssh -x -L <local>:127.0.0.1:<remote> <addr> sleep <keepalive>`
//!
//! For local addresses the ssh hop is replaced by a login shell, so a
//! daemon installed only in the user's profile environment is found.
//!
//! Exit code and stderr are the only signals observed; stdout is
//! scanned for a base-10 port. Any stderr output kills the process
//! immediately and surfaces as a fatal [`SubprocessError`].

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};

use fl_core::{is_local_address, ClientConfig, SubprocessError};

use super::{SecureTunnel, TunnelLauncher};

/// How many local ports are probed past the base port before giving up
const TUNNEL_PORT_PROBES: u16 = 100;

/// Production launcher spawning external ssh processes
pub struct SshLauncher {
    config: Arc<ClientConfig>,
}

impl SshLauncher {
    /// Create a launcher using the given configuration
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self { config }
    }

    /// Build a one-shot command: ssh for remote addresses, a login
    /// shell for local ones.
    fn one_shot(&self, address: &str, remote_command: &str) -> Command {
        if is_local_address(address) {
            let mut cmd = Command::new("bash");
            cmd.args(["-l", "-c", remote_command]);
            cmd
        } else {
            let mut cmd = Command::new(&self.config.ssh_binary);
            cmd.args(["-x", address, remote_command]);
            cmd
        }
    }

    /// Run a one-shot command to completion, capturing stdout.
    ///
    /// stderr output kills the process and is fatal; a nonzero exit
    /// without stderr is fatal too.
    async fn run_capture(&self, address: &str, mut cmd: Command) -> Result<String, SubprocessError> {
        let command_line = format!("{:?}", cmd.as_std());
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| SubprocessError::Spawn {
            command: command_line.clone(),
            source,
        })?;

        let result = tokio::time::timeout(
            self.config.subprocess_timeout,
            drain_child(address, &command_line, &mut child),
        )
        .await;

        match result {
            Ok(inner) => inner,
            Err(_elapsed) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(SubprocessError::Timeout {
                    address: address.to_string(),
                })
            }
        }
    }
}

/// Read stdout and stderr concurrently until the process exits.
///
/// The first stderr chunk kills the process: for these fixed templates
/// anything on stderr means ssh itself failed (unreachable host, auth
/// refused, broken forward), and the endpoint state machine owns what
/// happens next.
async fn drain_child(
    address: &str,
    command_line: &str,
    child: &mut Child,
) -> Result<String, SubprocessError> {
    let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(SubprocessError::Spawn {
            command: command_line.to_string(),
            source: std::io::Error::other("subprocess output not captured"),
        });
    };

    let mut out = Vec::new();
    let mut err = Vec::new();
    let mut obuf = [0u8; 4096];
    let mut ebuf = [0u8; 4096];
    let mut stdout_open = true;
    let mut stderr_open = true;

    while stdout_open || stderr_open {
        tokio::select! {
            read = stdout.read(&mut obuf), if stdout_open => match read {
                Ok(0) => stdout_open = false,
                Ok(n) => out.extend_from_slice(&obuf[..n]),
                Err(source) => {
                    return Err(SubprocessError::Spawn {
                        command: command_line.to_string(),
                        source,
                    })
                }
            },
            read = stderr.read(&mut ebuf), if stderr_open => match read {
                Ok(0) => stderr_open = false,
                Ok(n) => {
                    err.extend_from_slice(&ebuf[..n]);
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(SubprocessError::Stderr {
                        address: address.to_string(),
                        stderr: String::from_utf8_lossy(&err).trim().to_string(),
                    });
                }
                Err(source) => {
                    return Err(SubprocessError::Spawn {
                        command: command_line.to_string(),
                        source,
                    })
                }
            },
        }
    }

    let status = child.wait().await.map_err(|source| SubprocessError::Spawn {
        command: command_line.to_string(),
        source,
    })?;

    if !status.success() {
        return Err(SubprocessError::Exit {
            address: address.to_string(),
            code: status.code().unwrap_or(-1),
        });
    }

    Ok(String::from_utf8_lossy(&out).into_owned())
}

#[async_trait]
impl TunnelLauncher for SshLauncher {
    async fn ask_port(&self, address: &str) -> Result<Option<u16>, SubprocessError> {
        // `|| true` keeps a missing port file from looking like an
        // ssh failure: a daemon not yet running is a normal outcome.
        let remote = format!(
            "test -e {file} && cat {file} || true",
            file = self.config.daemon_port_file
        );
        let output = self.run_capture(address, self.one_shot(address, &remote)).await?;

        let port = output.trim().parse::<u16>().ok().filter(|&p| p != 0);
        tracing::debug!(address, ?port, "port discovery");
        Ok(port)
    }

    async fn launch_daemon(&self, address: &str) -> Result<(), SubprocessError> {
        tracing::info!(address, daemon = %self.config.daemon_binary, "launching daemon");

        let cmd = if is_local_address(address) {
            let detached = format!("{} >/dev/null 2>&1 &", self.config.daemon_binary);
            let mut cmd = Command::new("bash");
            cmd.args(["-l", "-c", &detached]);
            cmd
        } else {
            let mut cmd = Command::new(&self.config.ssh_binary);
            cmd.args(["-f", "-x", address, &self.config.daemon_binary]);
            cmd
        };

        self.run_capture(address, cmd).await?;
        Ok(())
    }

    async fn open_tunnel(
        &self,
        address: &str,
        remote_port: u16,
    ) -> Result<SecureTunnel, SubprocessError> {
        let local_port = free_local_port(self.config.tunnel_base_port)
            .await
            .ok_or_else(|| SubprocessError::NoLocalPort {
                address: address.to_string(),
            })?;

        let forward = format!("{}:127.0.0.1:{}", local_port, remote_port);
        let keepalive = format!("sleep {}", self.config.tunnel_keepalive);
        let mut cmd = Command::new(&self.config.ssh_binary);
        cmd.args(["-x", "-L", &forward, address, &keepalive])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let command_line = format!("{:?}", cmd.as_std());
        let mut child = cmd.spawn().map_err(|source| SubprocessError::Spawn {
            command: command_line,
            source,
        })?;

        tracing::info!(address, local_port, remote_port, "opening tunnel");

        // The forward is usable only once ssh has authenticated and
        // bound the local port; probe until it accepts.
        let deadline = tokio::time::Instant::now() + self.config.subprocess_timeout;
        loop {
            if let Some(status) = child.try_wait().ok().flatten() {
                return Err(SubprocessError::Exit {
                    address: address.to_string(),
                    code: status.code().unwrap_or(-1),
                });
            }
            if TcpStream::connect(("127.0.0.1", local_port)).await.is_ok() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                let _ = child.start_kill();
                return Err(SubprocessError::Timeout {
                    address: address.to_string(),
                });
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }

        Ok(SecureTunnel::new(
            local_port,
            address.to_string(),
            remote_port,
            child,
        ))
    }

    async fn session_credential(&self) -> Option<String> {
        let display = std::env::var("DISPLAY").ok().filter(|d| !d.is_empty())?;

        let mut cmd = Command::new("xauth");
        cmd.args(["list", &display])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let output = match cmd.output().await {
            Ok(o) if o.status.success() => o,
            Ok(_) | Err(_) => {
                tracing::debug!("xauth lookup failed, logging in without a credential");
                return None;
            }
        };

        // `xauth list` lines: <display> <protocol> <cookie>
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(2))
            .map(|cookie| cookie.to_string())
    }
}

/// Find a free local port, scanning upward from `base`.
async fn free_local_port(base: u16) -> Option<u16> {
    for port in base..base.saturating_add(TUNNEL_PORT_PROBES) {
        if TcpListener::bind(("127.0.0.1", port)).await.is_ok() {
            return Some(port);
        }
    }
    None
}
