//! fl-protocol: wire protocol for the flowlink execution daemon
//!
//! Defines the line-oriented message format spoken between the desktop
//! client and the execution daemon, and a tokio codec for it.

pub mod codec;
pub mod error;
pub mod message;
pub mod verb;

pub use codec::{encode_message, WireCodec, MAX_PAYLOAD_SIZE};
pub use error::ProtocolError;
pub use message::{split_args, WireMessage};
pub use verb::Verb;
