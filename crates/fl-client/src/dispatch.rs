//! Inbound message dispatch
//!
//! One entry point, [`dispatch`], applies a decoded [`WireMessage`] to
//! the session and job registry and tells the caller what, if
//! anything, to send back. Replies (`RET`) carry no verb of their own
//! to say what they acknowledge; the daemon answers request-bearing
//! verbs in order, so a FIFO of pending requests resolves each `RET`'s
//! argument layout.

use std::collections::VecDeque;

use tokio::sync::oneshot;
use uuid::Uuid;

use fl_core::{ClientError, JobKey, JobStatus};
use fl_protocol::{ProtocolError, Verb, WireMessage};

use crate::registry::{JobDescription, JobRegistry};

/// What a pending request is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// `INI` was sent; the reply carries the daemon hostname
    Login,
    /// `RUN` was sent; the reply carries the new job's description
    Run,
}

/// An outstanding request awaiting its `RET`
#[derive(Debug)]
pub struct PendingRequest {
    /// Client-generated correlation id, surfaced to callers of submit
    pub id: Uuid,
    pub kind: RequestKind,
    /// Resolved with the daemon-assigned job key when the reply is a
    /// run acknowledgement a caller chose to await
    ack: Option<oneshot::Sender<JobKey>>,
}

impl PendingRequest {
    fn new(kind: RequestKind, ack: Option<oneshot::Sender<JobKey>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            ack,
        }
    }
}

/// Per-connection protocol state
#[derive(Debug)]
pub struct SessionState {
    /// Endpoint address, for logging and error context
    pub address: String,
    /// Whether the login handshake has completed
    pub logged_in: bool,
    /// Hostname the daemon reported at login
    pub remote_hostname: Option<String>,
    /// Requests sent but not yet acknowledged, oldest first
    pub pending: VecDeque<PendingRequest>,
}

impl SessionState {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            logged_in: false,
            remote_hostname: None,
            pending: VecDeque::new(),
        }
    }

    /// Record an outgoing request and hand back its correlation id.
    pub fn push_pending(&mut self, kind: RequestKind) -> Uuid {
        let request = PendingRequest::new(kind, None);
        let id = request.id;
        self.pending.push_back(request);
        id
    }

    /// Record an outgoing request whose acknowledgement the caller
    /// wants to await. The receiver resolves to the daemon-assigned
    /// job key; it closes unresolved if the session resets first.
    pub fn push_pending_acked(&mut self, kind: RequestKind) -> (Uuid, oneshot::Receiver<JobKey>) {
        let (tx, rx) = oneshot::channel();
        let request = PendingRequest::new(kind, Some(tx));
        let id = request.id;
        self.pending.push_back(request);
        (id, rx)
    }

    /// Drop session state on disconnect. Job records are not ours.
    pub fn reset(&mut self) {
        self.logged_in = false;
        self.remote_hostname = None;
        self.pending.clear();
    }
}

/// What the caller should do after a message was applied
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Nothing to send
    None,
    /// Send this message back to the daemon
    Reply(WireMessage),
    /// The daemon refused an operation; surface it, keep the connection
    Refused { category: String, detail: String },
}

/// Apply one inbound message to the session and registry.
pub async fn dispatch(
    session: &mut SessionState,
    registry: &JobRegistry,
    msg: WireMessage,
) -> Result<DispatchOutcome, ClientError> {
    match msg.verb {
        Verb::Ret => dispatch_ret(session, registry, &msg).await,
        Verb::Job => {
            let args = msg
                .args()
                .map_err(|e| ClientError::protocol(&session.address, e))?;
            let [id, status, title, started, finished, hostname, issues, cmdline, output] =
                into_array::<9>(args);
            registry.add(
                &session.address,
                JobDescription {
                    id,
                    status: JobStatus::from_wire(&status),
                    title,
                    started_at: started,
                    finished_at: finished,
                    hostname,
                    issues,
                    command_line: cmdline,
                    output,
                },
            );
            Ok(DispatchOutcome::None)
        }
        Verb::Out => {
            let args = msg
                .args()
                .map_err(|e| ClientError::protocol(&session.address, e))?;
            let [id, chunk] = into_array::<2>(args);
            let key = JobKey::new(&session.address, id);
            if !registry.append_output(&key, &chunk).await {
                // Output for a job removed on our side; the daemon
                // will stop sending once it processes the END.
                tracing::debug!(%key, "dropping output for unknown job");
            }
            Ok(DispatchOutcome::None)
        }
        Verb::Fin => {
            let args = msg
                .args()
                .map_err(|e| ClientError::protocol(&session.address, e))?;
            let [id, status, finished] = into_array::<3>(args);
            let key = JobKey::new(&session.address, id);
            let status = JobStatus::from_wire(&status);
            if !registry.update_status(&key, status, &finished).await {
                tracing::debug!(%key, "dropping finish notice for unknown job");
            }
            Ok(DispatchOutcome::None)
        }
        Verb::Err => {
            let args = msg
                .args()
                .map_err(|e| ClientError::protocol(&session.address, e))?;
            let [category, detail] = into_array::<2>(args);
            tracing::warn!(
                address = %session.address,
                category = %category,
                detail = %detail,
                "daemon refused an operation"
            );
            Ok(DispatchOutcome::Refused { category, detail })
        }
        // Client-originated verbs never arrive here.
        Verb::Ini | Verb::Lst | Verb::Run | Verb::End | Verb::Kil | Verb::Qut => {
            Err(ClientError::protocol(
                &session.address,
                ProtocolError::UnexpectedVerb(msg.verb.as_str()),
            ))
        }
    }
}

async fn dispatch_ret(
    session: &mut SessionState,
    registry: &JobRegistry,
    msg: &WireMessage,
) -> Result<DispatchOutcome, ClientError> {
    let Some(request) = session.pending.pop_front() else {
        return Err(ClientError::protocol(
            &session.address,
            ProtocolError::UnexpectedReply,
        ));
    };

    match request.kind {
        RequestKind::Login => {
            let args = msg
                .split(1)
                .map_err(|e| ClientError::protocol(&session.address, e))?;
            let [hostname] = into_array::<1>(args);
            session.logged_in = true;
            session.remote_hostname = Some(hostname);
            tracing::info!(
                address = %session.address,
                hostname = session.remote_hostname.as_deref(),
                "logged in"
            );
            // Ask for the job backlog right away.
            Ok(DispatchOutcome::Reply(WireMessage::new(
                Verb::Lst,
                &[] as &[&str],
            )))
        }
        RequestKind::Run => {
            let args = msg
                .split(7)
                .map_err(|e| ClientError::protocol(&session.address, e))?;
            let [id, status, title, started, issues, cmdline, output] = into_array::<7>(args);
            let hostname = session.remote_hostname.clone().unwrap_or_default();
            let key = JobKey::new(&session.address, id.clone());
            registry.add(
                &session.address,
                JobDescription {
                    id,
                    status: JobStatus::from_wire(&status),
                    title,
                    started_at: started,
                    finished_at: String::new(),
                    hostname,
                    issues,
                    command_line: cmdline,
                    output,
                },
            );
            if let Some(ack) = request.ack {
                // the submitter may have stopped waiting; that's fine
                let _ = ack.send(key);
            }
            Ok(DispatchOutcome::None)
        }
    }
}

/// Convert an argument vector of known length into an array.
///
/// The length is already enforced by `split`, so this cannot fail for
/// the arity the caller asked for.
fn into_array<const N: usize>(args: Vec<String>) -> [String; N] {
    match args.try_into() {
        Ok(array) => array,
        Err(_) => unreachable!("split returned the wrong argument count"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fl_core::JobKey;

    fn job_msg(id: &str, status: &str) -> WireMessage {
        WireMessage::new(
            Verb::Job,
            &[
                id,
                status,
                "flow title",
                "Fri Aug 21 10:00:00 2026",
                "",
                "rocky",
                "",
                "seismic-filter < in > out",
                "",
            ],
        )
    }

    #[tokio::test]
    async fn test_login_ack_requests_job_list() {
        let mut session = SessionState::new("rocky");
        let registry = JobRegistry::new();
        session.push_pending(RequestKind::Login);

        let outcome = dispatch(
            &mut session,
            &registry,
            WireMessage::new(Verb::Ret, &["rocky.example.com"]),
        )
        .await
        .unwrap();

        assert!(session.logged_in);
        assert_eq!(session.remote_hostname.as_deref(), Some("rocky.example.com"));
        match outcome {
            DispatchOutcome::Reply(reply) => assert_eq!(reply.verb, Verb::Lst),
            other => panic!("expected a LST reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_ack_registers_job() {
        let mut session = SessionState::new("rocky");
        session.logged_in = true;
        session.remote_hostname = Some("rocky.example.com".to_string());
        session.push_pending(RequestKind::Run);
        let registry = JobRegistry::new();

        dispatch(
            &mut session,
            &registry,
            WireMessage::new(
                Verb::Ret,
                &[
                    "7",
                    "running",
                    "flow title",
                    "Fri Aug 21 10:00:00 2026",
                    "",
                    "seismic-filter < in > out",
                    "first lines\n",
                ],
            ),
        )
        .await
        .unwrap();

        let job = registry.find(&JobKey::new("rocky", "7")).unwrap();
        let job = job.read().await;
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.hostname, "rocky.example.com");
        assert_eq!(job.output, "first lines\n");
        assert!(job.finished_at.is_empty());
    }

    #[tokio::test]
    async fn test_run_ack_resolves_awaited_submission() {
        let mut session = SessionState::new("rocky");
        session.logged_in = true;
        session.remote_hostname = Some("rocky.example.com".to_string());
        let (_, mut ack) = session.push_pending_acked(RequestKind::Run);
        let registry = JobRegistry::new();

        dispatch(
            &mut session,
            &registry,
            WireMessage::new(
                Verb::Ret,
                &[
                    "42",
                    "running",
                    "flow title",
                    "Fri Aug 21 10:00:00 2026",
                    "",
                    "seismic-filter < in > out",
                    "",
                ],
            ),
        )
        .await
        .unwrap();

        assert_eq!(ack.try_recv().unwrap(), JobKey::new("rocky", "42"));
    }

    #[tokio::test]
    async fn test_session_reset_closes_pending_acks() {
        let mut session = SessionState::new("rocky");
        let (_, mut ack) = session.push_pending_acked(RequestKind::Run);

        session.reset();

        assert!(ack.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ret_with_nothing_pending() {
        let mut session = SessionState::new("rocky");
        let registry = JobRegistry::new();

        let err = dispatch(
            &mut session,
            &registry,
            WireMessage::new(Verb::Ret, &["anything"]),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            ClientError::Protocol {
                source: ProtocolError::UnexpectedReply,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_replies_resolve_oldest_first() {
        let mut session = SessionState::new("rocky");
        let registry = JobRegistry::new();
        session.push_pending(RequestKind::Login);
        session.push_pending(RequestKind::Run);

        dispatch(
            &mut session,
            &registry,
            WireMessage::new(Verb::Ret, &["rocky.example.com"]),
        )
        .await
        .unwrap();
        assert!(session.logged_in);
        assert_eq!(session.pending.len(), 1);
        assert_eq!(session.pending[0].kind, RequestKind::Run);
    }

    #[tokio::test]
    async fn test_job_then_fin_in_sequence() {
        let mut session = SessionState::new("rocky");
        let registry = JobRegistry::new();

        dispatch(&mut session, &registry, job_msg("3", "running"))
            .await
            .unwrap();
        dispatch(
            &mut session,
            &registry,
            WireMessage::new(Verb::Fin, &["3", "finished", "Fri Aug 21 10:05:00 2026"]),
        )
        .await
        .unwrap();

        let job = registry.find(&JobKey::new("rocky", "3")).unwrap();
        let job = job.read().await;
        assert_eq!(job.status, JobStatus::Finished);
        assert_eq!(job.finished_at, "Fri Aug 21 10:05:00 2026");
    }

    #[tokio::test]
    async fn test_duplicate_job_listing_is_ignored() {
        let mut session = SessionState::new("rocky");
        let registry = JobRegistry::new();

        dispatch(&mut session, &registry, job_msg("3", "running"))
            .await
            .unwrap();
        dispatch(&mut session, &registry, job_msg("3", "failed"))
            .await
            .unwrap();

        assert_eq!(registry.len(), 1);
        let job = registry.find(&JobKey::new("rocky", "3")).unwrap();
        assert_eq!(job.read().await.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_output_for_unknown_job_is_dropped() {
        let mut session = SessionState::new("rocky");
        let registry = JobRegistry::new();

        let outcome = dispatch(
            &mut session,
            &registry,
            WireMessage::new(Verb::Out, &["99", "stray output"]),
        )
        .await
        .unwrap();

        assert!(matches!(outcome, DispatchOutcome::None));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_refusal_keeps_session() {
        let mut session = SessionState::new("rocky");
        session.logged_in = true;
        let registry = JobRegistry::new();

        let outcome = dispatch(
            &mut session,
            &registry,
            WireMessage::new(Verb::Err, &["permission", "user not allowed"]),
        )
        .await
        .unwrap();

        match outcome {
            DispatchOutcome::Refused { category, detail } => {
                assert_eq!(category, "permission");
                assert_eq!(detail, "user not allowed");
            }
            other => panic!("expected Refused, got {other:?}"),
        }
        assert!(session.logged_in);
    }

    #[tokio::test]
    async fn test_client_verbs_rejected_inbound() {
        let mut session = SessionState::new("rocky");
        let registry = JobRegistry::new();

        for msg in [
            WireMessage::new(Verb::Lst, &[] as &[&str]),
            WireMessage::new(Verb::Run, &["flow"]),
            WireMessage::new(Verb::Qut, &[] as &[&str]),
        ] {
            let err = dispatch(&mut session, &registry, msg).await.unwrap_err();
            assert!(matches!(
                err,
                ClientError::Protocol {
                    source: ProtocolError::UnexpectedVerb(_),
                    ..
                }
            ));
        }
    }
}
