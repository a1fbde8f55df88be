//! Binary framing of OCPP envelopes
//!
//! Layout (big-endian), `str` = u16 length + UTF-8, `blob` = u32 length + bytes:
//!
//! ```text
//! u8 type | str destination | u8 hops, hops x str | str messageId
//!   CALL / SEND: str action | blob payload | blob signatures
//!   CALLRESULT:  blob payload | blob signatures
//!   CALLERROR:   str errorCode | str description | blob details
//! ```
//!
//! An empty destination means "the directly connected peer"; an empty
//! signatures blob means "unsigned". Signatures are a JSON array.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::Value;

use crate::envelope::{
    EncodeError, Envelope, ErrorCode, ErrorMessage, Format, MessageType, ParseError, Payload,
    Request, Response, SendMessage,
};
use crate::signature::Signature;
use crate::types::{NetworkPath, NodeId, RequestId};

/// Maximum number of hops a binary frame may carry
pub const MAX_HOPS: usize = u8::MAX as usize;

/// Encode an envelope as a binary frame
pub fn encode(envelope: &Envelope) -> Result<Bytes, EncodeError> {
    let mut buf = BytesMut::with_capacity(128);

    let tag = match envelope {
        Envelope::Request(_) => MessageType::Call,
        Envelope::Response(_) => MessageType::CallResult,
        Envelope::Error(_) => MessageType::CallError,
        Envelope::Send(_) => MessageType::Send,
    };
    buf.put_u8(tag as u8);

    let destination = envelope.destination().map(NodeId::as_str).unwrap_or("");
    put_str(&mut buf, destination, "destination")?;

    let path = envelope.network_path();
    if path.len() > MAX_HOPS {
        return Err(EncodeError::FieldTooLong("network path"));
    }
    buf.put_u8(path.len() as u8);
    for hop in path.iter() {
        put_str(&mut buf, hop.as_str(), "network path")?;
    }

    put_str(&mut buf, envelope.request_id().as_str(), "message id")?;

    match envelope {
        Envelope::Request(r) => {
            put_str(&mut buf, &r.action, "action")?;
            put_blob(&mut buf, &r.payload.to_wire_bytes()?, "payload")?;
            put_signatures(&mut buf, &r.signatures)?;
        }
        Envelope::Send(s) => {
            put_str(&mut buf, &s.action, "action")?;
            put_blob(&mut buf, &s.payload.to_wire_bytes()?, "payload")?;
            put_signatures(&mut buf, &s.signatures)?;
        }
        Envelope::Response(r) => {
            put_blob(&mut buf, &r.payload.to_wire_bytes()?, "payload")?;
            put_signatures(&mut buf, &r.signatures)?;
        }
        Envelope::Error(e) => {
            put_str(&mut buf, e.error_code.as_str(), "error code")?;
            put_str(&mut buf, &e.description, "description")?;
            put_blob(&mut buf, &serde_json::to_vec(&e.details)?, "details")?;
        }
    }

    Ok(buf.freeze())
}

/// Decode a binary frame
pub fn decode(bytes: &[u8]) -> Result<Envelope, ParseError> {
    let mut reader = Reader { buf: bytes, request_id: None };

    let tag = reader.u8("message type")?;
    let destination = reader.str("destination")?;
    let hops = reader.u8("hop count")?;
    let mut path = Vec::with_capacity(hops as usize);
    for _ in 0..hops {
        path.push(NodeId::from(reader.str("network path")?));
    }
    let request_id = RequestId::new(reader.str("message id")?);
    reader.request_id = Some(request_id.clone());

    let destination = if destination.is_empty() {
        None
    } else {
        Some(NodeId::from(destination))
    };
    let network_path = NetworkPath::from(path);

    let msg_type = MessageType::from_tag(tag as i64).ok_or_else(|| {
        ParseError::could_not_parse(
            Some(request_id.clone()),
            format!("unknown binary message type {}", tag),
        )
    })?;

    let envelope = match msg_type {
        MessageType::Call | MessageType::Send => {
            let action = reader.str("action")?;
            let payload = Payload::Binary(Bytes::copy_from_slice(reader.blob("payload")?));
            let signatures = reader.signatures()?;

            if msg_type == MessageType::Call {
                Envelope::Request(Request {
                    request_id,
                    action,
                    destination,
                    network_path,
                    payload,
                    signatures,
                    sign_infos: Vec::new(),
                })
            } else {
                Envelope::Send(SendMessage {
                    request_id,
                    action,
                    destination,
                    network_path,
                    payload,
                    signatures,
                })
            }
        }
        MessageType::CallResult => {
            let payload = Payload::Binary(Bytes::copy_from_slice(reader.blob("payload")?));
            let signatures = reader.signatures()?;
            Envelope::Response(Response {
                request_id,
                destination,
                network_path,
                payload,
                signatures,
            })
        }
        MessageType::CallError => {
            let error_code = reader.str("error code")?.parse().unwrap_or(ErrorCode::GenericError);
            let description = reader.str("description")?;
            let details = reader.blob("details")?;
            let details = if details.is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_slice(details)
                    .map_err(|e| reader.formation(format!("details: {}", e)))?
            };
            Envelope::Error(ErrorMessage {
                request_id,
                destination,
                network_path,
                error_code,
                description,
                details,
                format: Format::Binary,
            })
        }
    };

    if reader.buf.has_remaining() {
        return Err(reader.could_not_parse(format!("{} trailing bytes", reader.buf.remaining())));
    }

    Ok(envelope)
}

fn put_str(buf: &mut BytesMut, s: &str, field: &'static str) -> Result<(), EncodeError> {
    let len = u16::try_from(s.len()).map_err(|_| EncodeError::FieldTooLong(field))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_blob(buf: &mut BytesMut, b: &[u8], field: &'static str) -> Result<(), EncodeError> {
    let len = u32::try_from(b.len()).map_err(|_| EncodeError::FieldTooLong(field))?;
    buf.put_u32(len);
    buf.put_slice(b);
    Ok(())
}

fn put_signatures(buf: &mut BytesMut, signatures: &[Signature]) -> Result<(), EncodeError> {
    if signatures.is_empty() {
        buf.put_u32(0);
        Ok(())
    } else {
        put_blob(buf, &serde_json::to_vec(signatures)?, "signatures")
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    request_id: Option<RequestId>,
}

impl<'a> Reader<'a> {
    fn formation(&self, reason: impl Into<String>) -> ParseError {
        ParseError::formation(self.request_id.clone(), reason)
    }

    fn could_not_parse(&self, reason: impl Into<String>) -> ParseError {
        ParseError::could_not_parse(self.request_id.clone(), reason)
    }

    fn need(&self, n: usize, field: &str) -> Result<(), ParseError> {
        if self.buf.remaining() < n {
            Err(self.formation(format!("truncated frame while reading {}", field)))
        } else {
            Ok(())
        }
    }

    fn u8(&mut self, field: &str) -> Result<u8, ParseError> {
        self.need(1, field)?;
        Ok(self.buf.get_u8())
    }

    fn bytes(&mut self, n: usize, field: &str) -> Result<&'a [u8], ParseError> {
        self.need(n, field)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn str(&mut self, field: &str) -> Result<String, ParseError> {
        self.need(2, field)?;
        let len = self.buf.get_u16() as usize;
        let raw = self.bytes(len, field)?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| self.formation(format!("{} is not UTF-8", field)))
    }

    fn blob(&mut self, field: &str) -> Result<&'a [u8], ParseError> {
        self.need(4, field)?;
        let len = self.buf.get_u32() as usize;
        self.bytes(len, field)
    }

    fn signatures(&mut self) -> Result<Vec<Signature>, ParseError> {
        let raw = self.blob("signatures")?;
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_slice(raw)
            .map_err(|e| self.formation(format!("malformed signatures: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn routed_request() -> Envelope {
        Envelope::Request(
            Request::new("GetFile", Bytes::from_static(b"\xde\xad\xbe\xef"))
                .with_request_id("r-1")
                .to("CS001")
                .with_path(NetworkPath::from_source("CSMS").append_hop("NN01")),
        )
    }

    #[test]
    fn test_binary_request_fields_survive() {
        let bytes = encode(&routed_request()).unwrap();
        match decode(&bytes).unwrap() {
            Envelope::Request(r) => {
                assert_eq!(r.action, "GetFile");
                assert_eq!(r.request_id.as_str(), "r-1");
                assert_eq!(r.destination, Some(NodeId::from("CS001")));
                assert_eq!(r.network_path.len(), 2);
                assert_eq!(r.payload.as_bytes().unwrap().as_ref(), b"\xde\xad\xbe\xef");
            }
            other => panic!("Expected Request, got {:?}", other),
        }
    }

    #[test]
    fn test_binary_error_keeps_code_and_details() {
        let err = ErrorMessage::new("r-2", ErrorCode::SignatureError, "bad signature")
            .with_details(json!({"invalid": 1}))
            .with_format(Format::Binary);
        let bytes = encode(&Envelope::Error(err)).unwrap();

        match decode(&bytes).unwrap() {
            Envelope::Error(e) => {
                assert_eq!(e.error_code, ErrorCode::SignatureError);
                assert_eq!(e.details["invalid"], 1);
                assert_eq!(e.format, Format::Binary);
                assert!(e.destination.is_none());
            }
            other => panic!("Expected Error, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_frame_is_formation_violation() {
        let bytes = encode(&routed_request()).unwrap();
        let err = decode(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, ParseError::FormationViolation { .. }));
        assert_eq!(err.request_id(), Some(&RequestId::from("r-1")));
    }

    #[test]
    fn test_unknown_tag_is_could_not_parse() {
        let mut bytes = encode(&routed_request()).unwrap().to_vec();
        bytes[0] = 9;
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, ParseError::CouldNotParse { .. }));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = encode(&routed_request()).unwrap().to_vec();
        bytes.push(0);
        assert!(matches!(decode(&bytes), Err(ParseError::CouldNotParse { .. })));
    }

    #[test]
    fn test_empty_frame() {
        let err = decode(&[]).unwrap_err();
        assert!(err.request_id().is_none());
    }
}
