//! Tokio codec for the line-oriented wire format
//!
//! Decoding is incremental: bytes are buffered until a full
//! `<VERB> <payloadLength> ` header is present, then until
//! `payloadLength` payload bytes plus the trailing newline have
//! arrived. Splitting the stream at arbitrary byte boundaries yields
//! the same message sequence as feeding it whole.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::message::WireMessage;
use crate::verb::Verb;

/// Sanity cap on a declared payload length (16 MiB). A corrupt header
/// must not make the decoder buffer unbounded amounts of data.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Longest well-formed header: 3-byte verb, space, decimal length,
/// space. Anything longer without both spaces is garbage.
const MAX_HEADER_SIZE: usize = 16;

/// A parsed header awaiting its payload
#[derive(Debug, Clone, Copy)]
struct PendingHeader {
    verb: Verb,
    payload_len: usize,
}

/// Codec for encoding/decoding wire messages
#[derive(Debug, Default)]
pub struct WireCodec {
    /// Header of the message currently being buffered (if any)
    pending: Option<PendingHeader>,
}

impl WireCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self { pending: None }
    }

    /// Try to parse a header from the front of `src`, consuming it.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    fn decode_header(src: &mut BytesMut) -> Result<Option<PendingHeader>, ProtocolError> {
        // minimum complete message: "LST 0 \n"
        if src.len() < 6 {
            return Ok(None);
        }

        let scan = &src[..src.len().min(MAX_HEADER_SIZE)];
        let sp1 = match scan.iter().position(|&b| b == b' ') {
            Some(p) => p,
            None if src.len() >= MAX_HEADER_SIZE => {
                return Err(ProtocolError::MalformedHeader(preview(src)));
            }
            None => return Ok(None),
        };
        let sp2 = match scan[sp1 + 1..].iter().position(|&b| b == b' ') {
            Some(p) => sp1 + 1 + p,
            None if src.len() >= MAX_HEADER_SIZE => {
                return Err(ProtocolError::MalformedHeader(preview(src)));
            }
            None => return Ok(None),
        };

        let token = std::str::from_utf8(&src[..sp1])
            .map_err(|_| ProtocolError::MalformedHeader(preview(src)))?;
        let verb = Verb::from_token(token)
            .ok_or_else(|| ProtocolError::UnknownVerb(token.to_string()))?;

        let payload_len: usize = std::str::from_utf8(&src[sp1 + 1..sp2])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ProtocolError::MalformedHeader(preview(src)))?;

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        src.advance(sp2 + 1);
        Ok(Some(PendingHeader { verb, payload_len }))
    }
}

fn preview(src: &BytesMut) -> String {
    String::from_utf8_lossy(&src[..src.len().min(32)]).into_owned()
}

impl Decoder for WireCodec {
    type Item = WireMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending.take() {
            Some(h) => h,
            None => match Self::decode_header(src)? {
                Some(h) => h,
                None => return Ok(None),
            },
        };

        // payload plus the trailing newline
        if src.len() < header.payload_len + 1 {
            self.pending = Some(header);
            return Ok(None);
        }

        let payload = src.split_to(header.payload_len).freeze();
        let terminator = src.split_to(1);
        if terminator[0] != b'\n' {
            return Err(ProtocolError::MalformedHeader(preview(src)));
        }

        tracing::trace!(verb = %header.verb, len = header.payload_len, "decoded message");

        Ok(Some(WireMessage {
            verb: header.verb,
            payload,
        }))
    }
}

impl Encoder<WireMessage> for WireCodec {
    type Error = ProtocolError;

    fn encode(&mut self, msg: WireMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if msg.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: msg.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        dst.reserve(msg.payload.len() + 16);
        dst.extend_from_slice(msg.verb.as_str().as_bytes());
        dst.extend_from_slice(b" ");
        dst.extend_from_slice(msg.payload.len().to_string().as_bytes());
        dst.extend_from_slice(b" ");
        dst.extend_from_slice(&msg.payload);
        dst.extend_from_slice(b"\n");

        Ok(())
    }
}

/// Encode a message to a standalone byte buffer.
pub fn encode_message(verb: Verb, args: &[&str]) -> Result<Bytes, ProtocolError> {
    let mut codec = WireCodec::new();
    let mut buf = BytesMut::new();
    codec.encode(WireMessage::new(verb, args), &mut buf)?;
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(buf: &mut BytesMut) -> Vec<WireMessage> {
        let mut codec = WireCodec::new();
        let mut out = Vec::new();
        while let Some(msg) = codec.decode(buf).unwrap() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_encode_two_empty_arguments() {
        let bytes = encode_message(Verb::from_token("FIN").unwrap(), &["", ""]).unwrap();
        // framing is verb-independent
        assert_eq!(&bytes[4..], b"5 0| 0|\n");

        let mut codec = WireCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(WireMessage::new(Verb::Out, &["", ""]), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"OUT 5 0| 0|\n");
    }

    #[test]
    fn test_encode_exact_vector() {
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(WireMessage::new(Verb::Out, &["teste1", "123"]), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"OUT 14 6|teste1 3|123\n");
    }

    #[test]
    fn test_encode_zero_arguments() {
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(WireMessage::new(Verb::Lst, &[] as &[&str]), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"LST 0 \n");
    }

    #[test]
    fn test_decode_roundtrip() {
        let mut buf = BytesMut::new();
        let mut codec = WireCodec::new();
        let args = ["id-1", "running", "a title", "", "cmd | grep x", "line1\nline2"];
        codec
            .encode(WireMessage::new(Verb::Job, &args[..3]), &mut buf)
            .unwrap();
        codec
            .encode(WireMessage::new(Verb::Out, &args[3..5]), &mut buf)
            .unwrap();

        let msgs = decode_all(&mut buf);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].verb, Verb::Job);
        assert_eq!(msgs[0].split(3).unwrap(), args[..3]);
        assert_eq!(msgs[1].split(2).unwrap(), args[3..5]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_split_at_every_boundary() {
        let mut whole = BytesMut::new();
        let mut codec = WireCodec::new();
        codec
            .encode(WireMessage::new(Verb::Job, &["1", "running", "t"]), &mut whole)
            .unwrap();
        codec
            .encode(WireMessage::new(Verb::Fin, &["1", "finished", "now"]), &mut whole)
            .unwrap();
        let whole = whole.freeze();

        for split in 0..=whole.len() {
            let mut codec = WireCodec::new();
            let mut buf = BytesMut::from(&whole[..split]);
            let mut msgs = Vec::new();
            while let Some(m) = codec.decode(&mut buf).unwrap() {
                msgs.push(m);
            }
            buf.extend_from_slice(&whole[split..]);
            while let Some(m) = codec.decode(&mut buf).unwrap() {
                msgs.push(m);
            }

            assert_eq!(msgs.len(), 2, "split at byte {split}");
            assert_eq!(msgs[0].verb, Verb::Job);
            assert_eq!(msgs[1].verb, Verb::Fin);
            assert_eq!(msgs[1].split(3).unwrap(), ["1", "finished", "now"]);
        }
    }

    #[test]
    fn test_decode_unknown_verb() {
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::from(&b"ZZZ 5 0| 0|\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::UnknownVerb(v)) if v == "ZZZ"
        ));
    }

    #[test]
    fn test_decode_garbage_header() {
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::from(&b"nothing-resembling-a-header........"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::MalformedHeader(_))
        ));

        let mut codec = WireCodec::new();
        let mut buf = BytesMut::from(&b"OUT abc 0| 0|\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_decode_oversized_payload_declaration() {
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::from(&b"OUT 999999999 "[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_decode_incomplete_returns_none() {
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::from(&b"OUT 14 6|tes"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        // remainder preserved for the next read
        buf.extend_from_slice(b"te1 3|123\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.split(2).unwrap(), ["teste1", "123"]);
    }
}
