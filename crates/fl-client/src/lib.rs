//! fl-client: the flowlink client engine
//!
//! Connects to execution daemons over ssh-forwarded TCP, logs in,
//! submits flows and tracks the resulting jobs. The [`ConnectionManager`]
//! is the entry point; it hands out [`Endpoint`]s and shares one
//! [`JobRegistry`] across all of them.

pub mod dispatch;
pub mod endpoint;
pub mod manager;
pub mod registry;
pub mod ssh;

pub use dispatch::{DispatchOutcome, PendingRequest, RequestKind, SessionState};
pub use endpoint::{Endpoint, Submission};
pub use manager::ConnectionManager;
pub use registry::{Job, JobDescription, JobEvent, JobRegistry};
pub use ssh::{SecureTunnel, SshLauncher, TunnelLauncher};
