//! The closed set of protocol verbs

use serde::{Deserialize, Serialize};
use std::fmt;

/// A message verb.
///
/// Every message on the wire starts with one of these tokens. The set
/// is closed: a token outside it is a protocol error and the connection
/// that produced it is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verb {
    /// Login request (client -> daemon): hostname, display, credential
    Ini,
    /// Acknowledgement of the last request (daemon -> client)
    Ret,
    /// Operation refused (daemon -> client): category, detail
    Err,
    /// Request the current job list (client -> daemon)
    Lst,
    /// Submit a serialized flow (client -> daemon)
    Run,
    /// Full job description (daemon -> client)
    Job,
    /// Incremental job output (daemon -> client): id, chunk
    Out,
    /// Job terminated (daemon -> client): id, status, finished
    Fin,
    /// Request graceful job termination (client -> daemon): id
    End,
    /// Request forced job termination (client -> daemon): id
    Kil,
    /// Goodbye (client -> daemon)
    Qut,
}

impl Verb {
    /// Wire token for this verb
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Ini => "INI",
            Verb::Ret => "RET",
            Verb::Err => "ERR",
            Verb::Lst => "LST",
            Verb::Run => "RUN",
            Verb::Job => "JOB",
            Verb::Out => "OUT",
            Verb::Fin => "FIN",
            Verb::End => "END",
            Verb::Kil => "KIL",
            Verb::Qut => "QUT",
        }
    }

    /// Parse a wire token. Returns `None` for tokens outside the set.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "INI" => Some(Verb::Ini),
            "RET" => Some(Verb::Ret),
            "ERR" => Some(Verb::Err),
            "LST" => Some(Verb::Lst),
            "RUN" => Some(Verb::Run),
            "JOB" => Some(Verb::Job),
            "OUT" => Some(Verb::Out),
            "FIN" => Some(Verb::Fin),
            "END" => Some(Verb::End),
            "KIL" => Some(Verb::Kil),
            "QUT" => Some(Verb::Qut),
            _ => None,
        }
    }

    /// Fixed argument count for this verb.
    ///
    /// `RET` has no fixed arity: its payload layout depends on which
    /// request it acknowledges, which only the dispatcher knows.
    pub fn arity(&self) -> Option<usize> {
        match self {
            Verb::Ini => Some(3),
            Verb::Ret => None,
            Verb::Err => Some(2),
            Verb::Lst => Some(0),
            Verb::Run => Some(1),
            Verb::Job => Some(9),
            Verb::Out => Some(2),
            Verb::Fin => Some(3),
            Verb::End => Some(1),
            Verb::Kil => Some(1),
            Verb::Qut => Some(0),
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
