//! Endpoint connection state machine
//!
//! An [`Endpoint`] owns everything about one daemon connection: port
//! discovery over ssh, the forward tunnel, the TCP socket, the login
//! handshake and the reader task that feeds inbound messages to the
//! dispatcher.
//!
//! Connection lifecycle:
//!
//! ```text
//! AskPort --port--> OpenTunnel --> Connect --> Connected
//!    |                                            |
//!    +--no port--> Launch --> AskPort       (socket drops)
//!    |  (retry budget)                            |
//!    +--budget spent--> Failed              Disconnected
//! ```
//!
//! Local addresses skip the tunnel and connect straight to the
//! discovered port. `Disconnected` keeps job records; only explicit
//! removal forgets a job.

use std::sync::{Arc, Weak};

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use uuid::Uuid;

use fl_core::{
    is_local_address, local_hostname, ClientConfig, ClientError, ConnectionError, ConnectionState,
    JobKey,
};
use fl_protocol::{Verb, WireCodec, WireMessage};

use crate::dispatch::{dispatch, DispatchOutcome, RequestKind, SessionState};
use crate::registry::JobRegistry;
use crate::ssh::{SecureTunnel, TunnelLauncher};

/// Capacity of the error-notification channel. Refusals are rare; a
/// subscriber that falls this far behind misses the oldest ones.
const ERROR_CHANNEL_CAPACITY: usize = 32;

/// Connection-attempt bookkeeping, reset on every connect
#[derive(Debug, Default)]
struct LinkState {
    /// Daemon port discovered for the current attempt, 0 when unknown
    port: u16,
    /// Daemon launches spent in the current attempt
    retry_count: u32,
    /// Human-readable cause of the last failure
    last_error: Option<String>,
}

/// One daemon connection and its protocol state
pub struct Endpoint {
    address: String,
    config: Arc<ClientConfig>,
    registry: Arc<JobRegistry>,
    launcher: Arc<dyn TunnelLauncher>,
    state_tx: watch::Sender<ConnectionState>,
    error_tx: broadcast::Sender<Arc<ClientError>>,
    link: std::sync::Mutex<LinkState>,
    session: Mutex<SessionState>,
    writer: Mutex<Option<FramedWrite<OwnedWriteHalf, WireCodec>>>,
    tunnel: Mutex<Option<SecureTunnel>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    // handle to self for spawning the reader task
    weak: Weak<Endpoint>,
}

impl Endpoint {
    /// Create an endpoint for `address`. No connection is made yet.
    pub fn new(
        address: impl Into<String>,
        config: Arc<ClientConfig>,
        registry: Arc<JobRegistry>,
        launcher: Arc<dyn TunnelLauncher>,
    ) -> Arc<Self> {
        let address = address.into();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (error_tx, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        Arc::new_cyclic(|weak| Self {
            session: Mutex::new(SessionState::new(&address)),
            address,
            config,
            registry,
            launcher,
            state_tx,
            error_tx,
            link: std::sync::Mutex::new(LinkState::default()),
            writer: Mutex::new(None),
            tunnel: Mutex::new(None),
            reader_task: Mutex::new(None),
            weak: weak.clone(),
        })
    }

    /// Address this endpoint connects to
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch connection state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Text of the most recent error reported by this endpoint
    pub fn last_error(&self) -> Option<String> {
        self.link.lock().unwrap_or_else(|e| e.into_inner()).last_error.clone()
    }

    /// Watch errors that arrive with no caller to return them to:
    /// daemon refusals and connection loss noticed by the reader.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<Arc<ClientError>> {
        self.error_tx.subscribe()
    }

    /// Daemon port discovered by the last connect attempt, 0 when unknown
    pub fn daemon_port(&self) -> u16 {
        self.link.lock().unwrap_or_else(|e| e.into_inner()).port
    }

    fn set_state(&self, state: ConnectionState) {
        tracing::debug!(address = %self.address, %state, "connection state");
        self.state_tx.send_replace(state);
    }

    fn fail(&self, error: ClientError) -> ClientError {
        self.link
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_error = Some(error.to_string());
        self.set_state(ConnectionState::Failed);
        error
    }

    /// Record an error and hand it to subscribers. Used where the
    /// error surfaces asynchronously instead of from a caller's await.
    fn publish_error(&self, error: ClientError) {
        self.link
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_error = Some(error.to_string());
        let _ = self.error_tx.send(Arc::new(error));
    }

    /// Drive the full connect sequence: discover the daemon port,
    /// open the tunnel, connect, log in and start the reader task.
    pub async fn connect(&self) -> Result<(), ClientError> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        let port = match self.discover_port().await {
            Ok(port) => port,
            Err(e) => return Err(self.fail(e)),
        };

        // Local daemons are reached directly; remote ones through a
        // forward tunnel bound on this machine.
        let connect_port = if is_local_address(&self.address) {
            port
        } else {
            self.set_state(ConnectionState::OpenTunnel);
            match self.launcher.open_tunnel(&self.address, port).await {
                Ok(tunnel) => {
                    let local_port = tunnel.local_port;
                    *self.tunnel.lock().await = Some(tunnel);
                    local_port
                }
                Err(e) => return Err(self.fail(e.into())),
            }
        };

        self.set_state(ConnectionState::Connect);
        let stream = match tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(("127.0.0.1", connect_port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(self.fail(
                    ConnectionError::ConnectFailed {
                        address: self.address.clone(),
                        source,
                    }
                    .into(),
                ))
            }
            Err(_elapsed) => {
                return Err(self.fail(
                    ConnectionError::Timeout {
                        address: self.address.clone(),
                    }
                    .into(),
                ))
            }
        };

        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(FramedWrite::new(write_half, WireCodec::new()));
        self.set_state(ConnectionState::Connected);
        tracing::info!(address = %self.address, port = connect_port, "connected");

        // a failed login must not leave a Connected endpoint behind
        // with a writer and no reader
        if let Err(e) = self.login().await {
            self.teardown().await;
            return Err(self.fail(e));
        }

        // upgrade always succeeds while a caller holds the endpoint
        let Some(strong) = self.weak.upgrade() else {
            return Ok(());
        };
        let task = tokio::spawn(read_loop(
            strong,
            FramedRead::new(read_half, WireCodec::new()),
        ));
        if let Some(old) = self.reader_task.lock().await.replace(task) {
            old.abort();
        }

        Ok(())
    }

    /// Ask the daemon for its advertised port, launching it when no
    /// port is published yet, within the retry budget.
    async fn discover_port(&self) -> Result<u16, ClientError> {
        {
            let mut link = self.link.lock().unwrap_or_else(|e| e.into_inner());
            link.retry_count = 0;
            link.last_error = None;
        }

        loop {
            self.set_state(ConnectionState::AskPort);
            if let Some(port) = self.launcher.ask_port(&self.address).await? {
                self.link.lock().unwrap_or_else(|e| e.into_inner()).port = port;
                tracing::debug!(address = %self.address, port, "daemon port discovered");
                return Ok(port);
            }

            let spent = {
                let link = self.link.lock().unwrap_or_else(|e| e.into_inner());
                link.retry_count
            };
            if spent >= self.config.max_port_retries {
                return Err(ClientError::RetryExhausted {
                    address: self.address.clone(),
                    attempts: spent,
                });
            }
            self.link.lock().unwrap_or_else(|e| e.into_inner()).retry_count = spent + 1;

            self.set_state(ConnectionState::Launch);
            self.launcher.launch_daemon(&self.address).await?;
        }
    }

    /// Send the login message. Its acknowledgement is handled by the
    /// dispatcher, which also requests the job backlog.
    async fn login(&self) -> Result<(), ClientError> {
        let hostname = local_hostname();
        let display = std::env::var("DISPLAY").unwrap_or_default();
        let credential = self.launcher.session_credential().await.unwrap_or_default();

        {
            let mut session = self.session.lock().await;
            session.reset();
            session.push_pending(RequestKind::Login);
        }
        self.send(WireMessage::new(Verb::Ini, &[&hostname, &display, &credential]))
            .await
    }

    /// Write one message to the daemon.
    pub async fn send(&self, msg: WireMessage) -> Result<(), ClientError> {
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(ConnectionError::NotConnected {
                address: self.address.clone(),
            }
            .into());
        };
        writer
            .send(msg)
            .await
            .map_err(|e| ClientError::protocol(&self.address, e))
    }

    /// Submit a serialized flow for execution. The returned handle
    /// resolves to the daemon-assigned job key once the run is
    /// acknowledged; the job record appears in the registry at the
    /// same moment.
    pub async fn submit(&self, flow: &str) -> Result<Submission, ClientError> {
        let (id, ack) = {
            let mut session = self.session.lock().await;
            if !session.logged_in {
                return Err(ConnectionError::NotConnected {
                    address: self.address.clone(),
                }
                .into());
            }
            session.push_pending_acked(RequestKind::Run)
        };

        match self.send(WireMessage::new(Verb::Run, &[flow])).await {
            Ok(()) => Ok(Submission {
                id,
                address: self.address.clone(),
                ack,
            }),
            Err(e) => {
                self.session.lock().await.pending.retain(|r| r.id != id);
                Err(e)
            }
        }
    }

    /// Ask the daemon to end a job after its current step.
    pub async fn terminate_job(&self, job_id: &str) -> Result<(), ClientError> {
        self.send(WireMessage::new(Verb::End, &[job_id])).await
    }

    /// Ask the daemon to kill a job immediately.
    pub async fn kill_job(&self, job_id: &str) -> Result<(), ClientError> {
        self.send(WireMessage::new(Verb::Kil, &[job_id])).await
    }

    /// Request the daemon's job backlog.
    pub async fn request_jobs(&self) -> Result<(), ClientError> {
        self.send(WireMessage::new(Verb::Lst, &[] as &[&str])).await
    }

    /// Disconnect deliberately: tell the daemon goodbye, stop the
    /// reader and tear the link down. Job records stay.
    pub async fn disconnect(&self) {
        if self.state() == ConnectionState::Connected {
            // best effort; the daemon may already be gone
            if let Err(e) = self.send(WireMessage::new(Verb::Qut, &[] as &[&str])).await {
                tracing::debug!(address = %self.address, error = %e, "goodbye not sent");
            }
        }
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
        self.teardown().await;
    }

    /// Drop link state after the socket is gone, keeping job records.
    async fn teardown(&self) {
        self.session.lock().await.reset();
        *self.writer.lock().await = None;
        *self.tunnel.lock().await = None;
        {
            let mut link = self.link.lock().unwrap_or_else(|e| e.into_inner());
            link.port = 0;
            link.retry_count = 0;
        }
        self.set_state(ConnectionState::Disconnected);
        tracing::info!(address = %self.address, "disconnected");
    }
}

/// A submitted flow awaiting the daemon's acknowledgement
#[derive(Debug)]
pub struct Submission {
    id: Uuid,
    address: String,
    ack: oneshot::Receiver<JobKey>,
}

impl Submission {
    /// Correlation id of the pending request
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the daemon to assign a job id. Backlog records listed
    /// by the daemon in the meantime do not resolve this; only the
    /// acknowledgement of this submission does.
    pub async fn acknowledged(self) -> Result<JobKey, ClientError> {
        self.ack.await.map_err(|_| {
            ConnectionError::Lost {
                address: self.address,
            }
            .into()
        })
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("address", &self.address)
            .field("state", &self.state())
            .finish()
    }
}

/// Read inbound messages until the socket drops, feeding each to the
/// dispatcher. Protocol errors are fatal to the connection.
async fn read_loop(endpoint: Arc<Endpoint>, mut reader: FramedRead<OwnedReadHalf, WireCodec>) {
    loop {
        let item = match reader.next().await {
            Some(item) => item,
            None => {
                endpoint.publish_error(
                    ConnectionError::Lost {
                        address: endpoint.address.clone(),
                    }
                    .into(),
                );
                break;
            }
        };
        let msg = match item {
            Ok(msg) => msg,
            Err(e) => {
                tracing::error!(address = %endpoint.address, error = %e, "decode failed");
                endpoint.publish_error(ClientError::protocol(&endpoint.address, e));
                break;
            }
        };

        let outcome = {
            let mut session = endpoint.session.lock().await;
            dispatch(&mut session, &endpoint.registry, msg).await
        };

        match outcome {
            Ok(DispatchOutcome::None) => {}
            Ok(DispatchOutcome::Reply(reply)) => {
                if let Err(e) = endpoint.send(reply).await {
                    tracing::error!(address = %endpoint.address, error = %e, "reply failed");
                    endpoint.publish_error(e);
                    break;
                }
            }
            Ok(DispatchOutcome::Refused { category, detail }) => {
                // the connection stays up; subscribers get the refusal
                endpoint.publish_error(ClientError::Permission {
                    address: endpoint.address.clone(),
                    category,
                    detail,
                });
            }
            Err(e) => {
                tracing::error!(address = %endpoint.address, error = %e, "dispatch failed");
                endpoint.publish_error(e);
                break;
            }
        }
    }

    tracing::warn!(address = %endpoint.address, "connection lost");
    endpoint.teardown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fl_core::SubprocessError;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Scripted launcher recording the sequence of calls it receives
    #[derive(Default)]
    struct MockLauncher {
        ask_results: StdMutex<VecDeque<Result<Option<u16>, SubprocessError>>>,
        tunnel_error: bool,
        credential: Option<String>,
        calls: StdMutex<Vec<&'static str>>,
    }

    impl MockLauncher {
        fn with_ask_results(
            results: impl IntoIterator<Item = Result<Option<u16>, SubprocessError>>,
        ) -> Self {
            Self {
                ask_results: StdMutex::new(results.into_iter().collect()),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl TunnelLauncher for MockLauncher {
        async fn ask_port(&self, _address: &str) -> Result<Option<u16>, SubprocessError> {
            self.record("ask");
            self.ask_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(None))
        }

        async fn launch_daemon(&self, _address: &str) -> Result<(), SubprocessError> {
            self.record("launch");
            Ok(())
        }

        async fn open_tunnel(
            &self,
            address: &str,
            remote_port: u16,
        ) -> Result<SecureTunnel, SubprocessError> {
            self.record("tunnel");
            if self.tunnel_error {
                return Err(SubprocessError::Stderr {
                    address: address.to_string(),
                    stderr: "channel setup failed".to_string(),
                });
            }
            Ok(SecureTunnel::detached(remote_port, address, remote_port))
        }

        async fn session_credential(&self) -> Option<String> {
            self.record("credential");
            self.credential.clone()
        }
    }

    fn endpoint_with(address: &str, launcher: Arc<MockLauncher>) -> Arc<Endpoint> {
        Endpoint::new(
            address,
            Arc::new(ClientConfig::default()),
            Arc::new(JobRegistry::new()),
            launcher,
        )
    }

    #[tokio::test]
    async fn test_no_port_triggers_daemon_launch() {
        let launcher = Arc::new(MockLauncher {
            ask_results: StdMutex::new(VecDeque::from([Ok(None), Ok(Some(6010))])),
            tunnel_error: true,
            ..Default::default()
        });
        let endpoint = endpoint_with("rocky", Arc::clone(&launcher));

        let err = endpoint.connect().await.unwrap_err();

        // port discovered on the second ask, then the (failing) tunnel
        assert_eq!(launcher.calls(), ["ask", "launch", "ask", "tunnel"]);
        assert!(matches!(err, ClientError::Subprocess(_)));
        assert_eq!(endpoint.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let launcher = Arc::new(MockLauncher::default()); // always Ok(None)
        let endpoint = endpoint_with("rocky", Arc::clone(&launcher));

        let err = endpoint.connect().await.unwrap_err();

        match err {
            ClientError::RetryExhausted { address, attempts } => {
                assert_eq!(address, "rocky");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
        // one ask per launch plus the initial and final asks
        assert_eq!(
            launcher.calls(),
            ["ask", "launch", "ask", "launch", "ask", "launch", "ask"]
        );
        assert_eq!(endpoint.state(), ConnectionState::Failed);
        assert!(endpoint.last_error().unwrap().contains("rocky"));
    }

    #[tokio::test]
    async fn test_subprocess_stderr_fails_immediately() {
        let launcher = Arc::new(MockLauncher::with_ask_results([Err(
            SubprocessError::Stderr {
                address: "rocky".to_string(),
                stderr: "Permission denied (publickey)".to_string(),
            },
        )]));
        let endpoint = endpoint_with("rocky", Arc::clone(&launcher));

        let err = endpoint.connect().await.unwrap_err();

        assert_eq!(launcher.calls(), ["ask"]);
        assert!(matches!(
            err,
            ClientError::Subprocess(SubprocessError::Stderr { .. })
        ));
        assert_eq!(endpoint.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_local_address_skips_tunnel() {
        // daemon advertises a port nothing listens on; connect fails at
        // the TCP stage without ever opening a tunnel
        let unused = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = unused.local_addr().unwrap().port();
        drop(unused);

        let launcher = Arc::new(MockLauncher::with_ask_results([Ok(Some(port))]));
        let endpoint = endpoint_with("127.0.0.1", Arc::clone(&launcher));

        let err = endpoint.connect().await.unwrap_err();

        assert_eq!(launcher.calls(), ["ask"]);
        assert!(matches!(
            err,
            ClientError::Connection(ConnectionError::ConnectFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_login_failure_tears_the_link_down() {
        // the TCP connect succeeds (the listener's backlog accepts it),
        // then the login write fails: the credential is too large for
        // the codec to frame
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let launcher = Arc::new(MockLauncher {
            ask_results: StdMutex::new(VecDeque::from([Ok(Some(port))])),
            credential: Some("x".repeat(fl_protocol::MAX_PAYLOAD_SIZE + 1)),
            ..Default::default()
        });
        let endpoint = endpoint_with("127.0.0.1", Arc::clone(&launcher));

        let err = endpoint.connect().await.unwrap_err();

        assert!(matches!(err, ClientError::Protocol { .. }));
        assert_eq!(endpoint.state(), ConnectionState::Failed);
        assert!(endpoint.last_error().is_some());
        // no half-open link left behind
        assert!(endpoint.writer.lock().await.is_none());
        assert!(!endpoint.session.lock().await.logged_in);
        drop(listener);
    }

    #[tokio::test]
    async fn test_submit_requires_login() {
        let endpoint = endpoint_with("rocky", Arc::new(MockLauncher::default()));
        let err = endpoint.submit("flow").await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Connection(ConnectionError::NotConnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_disconnect_when_never_connected() {
        let endpoint = endpoint_with("rocky", Arc::new(MockLauncher::default()));
        endpoint.disconnect().await;
        assert_eq!(endpoint.state(), ConnectionState::Disconnected);
    }
}
