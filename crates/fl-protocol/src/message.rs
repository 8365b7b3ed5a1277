//! Wire messages and argument framing
//!
//! A message is a single line:
//!
//! ```text
//! <VERB> <payloadLength> <len1>|<arg1> <len2>|<arg2>...\n
//! ```
//!
//! Each argument is framed as `<byteLength>|<content>` and arguments
//! are joined by a single space. `payloadLength` is the exact byte
//! length of the joined framed-argument payload, excluding the verb,
//! the surrounding spaces and the trailing newline. Because arguments
//! are length-delimited they may contain spaces, pipes and newlines.

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::verb::Verb;

/// A decoded message: a verb plus its raw framed payload.
///
/// The payload is kept unsplit because the argument layout of `RET`
/// depends on which request it acknowledges; callers that know the
/// expected layout split it with [`WireMessage::split`]. Messages are
/// transient: decoded, dispatched once, then dropped.
#[derive(Debug, Clone)]
pub struct WireMessage {
    /// The message verb
    pub verb: Verb,
    /// Framed-argument payload, exactly `payloadLength` bytes
    pub payload: Bytes,
}

impl WireMessage {
    /// Build a message from a verb and its arguments.
    pub fn new<S: AsRef<str>>(verb: Verb, args: &[S]) -> Self {
        let mut payload = String::new();
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                payload.push(' ');
            }
            let arg = arg.as_ref();
            payload.push_str(&arg.len().to_string());
            payload.push('|');
            payload.push_str(arg);
        }
        Self {
            verb,
            payload: Bytes::from(payload),
        }
    }

    /// Split the payload into the verb's fixed number of arguments.
    ///
    /// Fails for `RET`, whose arity is resolved by the dispatcher.
    pub fn args(&self) -> Result<Vec<String>, ProtocolError> {
        let arity = self
            .verb
            .arity()
            .ok_or(ProtocolError::UnexpectedReply)?;
        self.split(arity)
    }

    /// Split the payload into exactly `parts` arguments.
    pub fn split(&self, parts: usize) -> Result<Vec<String>, ProtocolError> {
        split_args(&self.payload, self.verb.as_str(), parts)
    }
}

/// Split a framed payload into exactly `parts` `<len>|<content>` fields.
pub fn split_args(
    payload: &[u8],
    verb: &'static str,
    parts: usize,
) -> Result<Vec<String>, ProtocolError> {
    let mismatch = || ProtocolError::ArgumentMismatch {
        verb,
        expected: parts,
    };

    let mut args = Vec::with_capacity(parts);
    let mut cursor = 0usize;

    for i in 0..parts {
        // length prefix up to '|'
        let bar = payload[cursor..]
            .iter()
            .position(|&b| b == b'|')
            .ok_or_else(mismatch)?;
        let digits = &payload[cursor..cursor + bar];
        if digits.is_empty() || !digits.iter().all(|b| b.is_ascii_digit()) {
            return Err(mismatch());
        }
        let len: usize = std::str::from_utf8(digits)?
            .parse()
            .map_err(|_| mismatch())?;
        cursor += bar + 1;

        let available = payload.len() - cursor;
        if available < len {
            return Err(ProtocolError::TruncatedArgument {
                declared: len,
                available,
            });
        }
        args.push(std::str::from_utf8(&payload[cursor..cursor + len])?.to_string());
        cursor += len;

        if i != parts - 1 {
            // single space between framed arguments
            if payload.get(cursor) != Some(&b' ') {
                return Err(mismatch());
            }
            cursor += 1;
        }
    }

    // exactly `parts` fields: nothing may remain
    if cursor != payload.len() {
        return Err(mismatch());
    }

    Ok(args)
}
