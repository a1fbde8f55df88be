//! OCPP message envelopes and their JSON framing
//!
//! OCPP frames are JSON arrays tagged by a message type:
//! - CALL: `[2, messageId, action, payload]`
//! - CALLRESULT: `[3, messageId, payload]`
//! - CALLERROR: `[4, messageId, errorCode, errorDescription, errorDetails]`
//! - SEND: `[6, messageId, action, payload]`
//!
//! Messages travelling through networking nodes use the routed form, which
//! inserts the destination and the network path right after the tag:
//! `[2, destinationId, [path...], messageId, action, payload]` and so on.
//!
//! Binary frames carry the same envelopes, see [`crate::binary`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::binary;
use crate::canonical::{canonical_json, SIGNATURES_FIELD};
use crate::policy::Signable;
use crate::signature::{KeyPair, Signature, SignatureError};
use crate::types::{NetworkPath, NodeId, RequestId};

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
    Send = 6,
}

impl MessageType {
    pub fn from_tag(tag: i64) -> Option<Self> {
        match tag {
            2 => Some(MessageType::Call),
            3 => Some(MessageType::CallResult),
            4 => Some(MessageType::CallError),
            6 => Some(MessageType::Send),
            _ => None,
        }
    }
}

/// OCPP error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    FormationViolation,
    FormatViolation,
    CouldNotParse,
    SignatureError,
    GenericError,
    Filtered,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::FormationViolation => "FormationViolation",
            ErrorCode::FormatViolation => "FormatViolation",
            ErrorCode::CouldNotParse => "CouldNotParse",
            ErrorCode::SignatureError => "SignatureError",
            ErrorCode::GenericError => "GenericError",
            ErrorCode::Filtered => "Filtered",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::MessageTypeNotSupported => "MessageTypeNotSupported",
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::RpcFrameworkError => "RpcFrameworkError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string())).map_err(|_| ())
    }
}

/// Errors produced while turning bytes into an envelope
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The frame is not a well-formed OCPP structure
    #[error("formation violation: {reason}")]
    FormationViolation {
        request_id: Option<RequestId>,
        reason: String,
    },

    /// Well-formed JSON that matches no envelope shape for its tag
    #[error("could not parse: {reason}")]
    CouldNotParse {
        request_id: Option<RequestId>,
        reason: String,
    },
}

impl ParseError {
    pub fn formation(request_id: Option<RequestId>, reason: impl Into<String>) -> Self {
        ParseError::FormationViolation {
            request_id,
            reason: reason.into(),
        }
    }

    pub fn could_not_parse(request_id: Option<RequestId>, reason: impl Into<String>) -> Self {
        ParseError::CouldNotParse {
            request_id,
            reason: reason.into(),
        }
    }

    /// Request id of the offending frame, if it could be read
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            ParseError::FormationViolation { request_id, .. }
            | ParseError::CouldNotParse { request_id, .. } => request_id.as_ref(),
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            ParseError::FormationViolation { .. } => ErrorCode::FormationViolation,
            ParseError::CouldNotParse { .. } => ErrorCode::CouldNotParse,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            ParseError::FormationViolation { reason, .. }
            | ParseError::CouldNotParse { reason, .. } => reason,
        }
    }

    /// Error envelope answering the frame that failed to parse
    pub fn to_error_message(&self, format: Format) -> ErrorMessage {
        ErrorMessage::new(
            self.request_id().cloned().unwrap_or_else(RequestId::unknown),
            self.error_code(),
            self.reason(),
        )
        .with_format(format)
    }
}

/// Errors produced while turning an envelope into bytes
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("field too long for binary framing: {0}")]
    FieldTooLong(&'static str),
}

/// Wire framing of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Binary,
}

/// Raw frame as exchanged with the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn format(&self) -> Format {
        match self {
            Frame::Text(_) => Format::Json,
            Frame::Binary(_) => Format::Binary,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Frame::Text(t) => t.len(),
            Frame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Message type tag, read without parsing the rest of the frame
    pub fn message_type(&self) -> Option<MessageType> {
        let tag = match self {
            Frame::Text(text) => match serde_json::from_str::<Value>(text).ok()? {
                Value::Array(array) => array.first()?.as_i64()?,
                _ => return None,
            },
            Frame::Binary(bytes) => *bytes.first()? as i64,
        };
        MessageType::from_tag(tag)
    }
}

/// Message payload: a JSON object or opaque bytes
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Binary(Bytes),
}

impl Payload {
    pub fn json(value: impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Payload::Json(serde_json::to_value(value)?))
    }

    pub fn format(&self) -> Format {
        match self {
            Payload::Json(_) => Format::Json,
            Payload::Binary(_) => Format::Binary,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(v) => Some(v),
            Payload::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Payload::Binary(b) => Some(b),
            Payload::Json(_) => None,
        }
    }

    /// Parse the JSON payload as a specific type
    pub fn parse<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        match self {
            Payload::Json(v) => serde_json::from_value(v.clone()),
            Payload::Binary(b) => serde_json::from_slice(b),
        }
    }

    /// Bytes covered by signatures
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Payload::Json(v) => canonical_json(v),
            Payload::Binary(b) => Ok(b.to_vec()),
        }
    }

    pub(crate) fn to_wire_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Payload::Json(v) => serde_json::to_vec(v),
            Payload::Binary(b) => Ok(b.to_vec()),
        }
    }
}

impl From<Value> for Payload {
    fn from(v: Value) -> Self {
        Payload::Json(v)
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Payload::Binary(b)
    }
}

/// Request (CALL), JSON or binary depending on the payload
#[derive(Debug, Clone)]
pub struct Request {
    pub request_id: RequestId,
    pub action: String,
    /// Final recipient, `None` when addressed to the directly connected peer
    pub destination: Option<NodeId>,
    pub network_path: NetworkPath,
    pub payload: Payload,
    pub signatures: Vec<Signature>,
    /// Keys this particular message asks to be signed with, never sent
    pub sign_infos: Vec<KeyPair>,
}

impl Request {
    /// Create a new request with an auto-generated id
    pub fn new(action: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self {
            request_id: RequestId::random(),
            action: action.into(),
            destination: None,
            network_path: NetworkPath::new(),
            payload: payload.into(),
            signatures: Vec::new(),
            sign_infos: Vec::new(),
        }
    }

    pub fn with_request_id(mut self, id: impl Into<RequestId>) -> Self {
        self.request_id = id.into();
        self
    }

    pub fn to(mut self, destination: impl Into<NodeId>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_path(mut self, path: NetworkPath) -> Self {
        self.network_path = path;
        self
    }

    pub fn signed_with(mut self, key: KeyPair) -> Self {
        self.sign_infos.push(key);
        self
    }

    pub fn format(&self) -> Format {
        self.payload.format()
    }

    /// Build the response travelling back to the source of this request
    pub fn reply(&self, local: &NodeId, payload: impl Into<Payload>) -> Response {
        Response {
            request_id: self.request_id.clone(),
            destination: self.network_path.source().cloned(),
            network_path: NetworkPath::from_source(local.clone()),
            payload: payload.into(),
            signatures: Vec::new(),
        }
    }

    /// Build an error travelling back to the source of this request
    pub fn error_reply(
        &self,
        local: &NodeId,
        code: ErrorCode,
        description: impl Into<String>,
        details: Value,
    ) -> ErrorMessage {
        ErrorMessage {
            request_id: self.request_id.clone(),
            destination: self.network_path.source().cloned(),
            network_path: NetworkPath::from_source(local.clone()),
            error_code: code,
            description: description.into(),
            details,
            format: self.format(),
        }
    }
}

/// Response (CALLRESULT)
#[derive(Debug, Clone)]
pub struct Response {
    pub request_id: RequestId,
    pub destination: Option<NodeId>,
    pub network_path: NetworkPath,
    pub payload: Payload,
    pub signatures: Vec<Signature>,
}

impl Response {
    pub fn new(request_id: impl Into<RequestId>, payload: impl Into<Payload>) -> Self {
        Self {
            request_id: request_id.into(),
            destination: None,
            network_path: NetworkPath::new(),
            payload: payload.into(),
            signatures: Vec::new(),
        }
    }

    pub fn format(&self) -> Format {
        self.payload.format()
    }
}

/// Error response (CALLERROR)
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorMessage {
    pub request_id: RequestId,
    pub destination: Option<NodeId>,
    pub network_path: NetworkPath,
    pub error_code: ErrorCode,
    pub description: String,
    pub details: Value,
    pub format: Format,
}

impl ErrorMessage {
    pub fn new(
        request_id: impl Into<RequestId>,
        error_code: ErrorCode,
        description: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            destination: None,
            network_path: NetworkPath::new(),
            error_code,
            description: description.into(),
            details: Value::Object(Map::new()),
            format: Format::Json,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }
}

/// One-way message (SEND), never answered
#[derive(Debug, Clone)]
pub struct SendMessage {
    pub request_id: RequestId,
    pub action: String,
    pub destination: Option<NodeId>,
    pub network_path: NetworkPath,
    pub payload: Payload,
    pub signatures: Vec<Signature>,
}

impl SendMessage {
    pub fn new(action: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self {
            request_id: RequestId::random(),
            action: action.into(),
            destination: None,
            network_path: NetworkPath::new(),
            payload: payload.into(),
            signatures: Vec::new(),
        }
    }

    pub fn to(mut self, destination: impl Into<NodeId>) -> Self {
        self.destination = Some(destination.into());
        self
    }
}

/// Parsed OCPP envelope (any type)
#[derive(Debug, Clone)]
pub enum Envelope {
    Request(Request),
    Response(Response),
    Error(ErrorMessage),
    Send(SendMessage),
}

impl Envelope {
    /// Parse an envelope from a transport frame
    pub fn parse(frame: &Frame) -> Result<Self, ParseError> {
        match frame {
            Frame::Text(text) => Self::parse_json(text.as_bytes()),
            Frame::Binary(bytes) => binary::decode(bytes),
        }
    }

    /// Parse a JSON-framed envelope
    pub fn parse_json(bytes: &[u8]) -> Result<Self, ParseError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| ParseError::formation(None, format!("not JSON: {}", e)))?;

        let array = match value {
            Value::Array(a) => a,
            _ => return Err(ParseError::formation(None, "frame is not a JSON array")),
        };

        if array.is_empty() {
            return Err(ParseError::formation(None, "empty frame"));
        }

        let tag = array[0]
            .as_i64()
            .ok_or_else(|| ParseError::formation(None, "message type is not an integer"))?;

        let routed = array.len() >= 3 && array[2].is_array();
        let id_index = if routed { 3 } else { 1 };
        let request_id = match array.get(id_index) {
            Some(Value::String(s)) => RequestId::new(s.clone()),
            Some(_) => return Err(ParseError::formation(None, "message id is not a string")),
            None => return Err(ParseError::formation(None, "message id missing")),
        };
        let rid = Some(request_id.clone());

        let msg_type = MessageType::from_tag(tag).ok_or_else(|| {
            ParseError::could_not_parse(rid.clone(), format!("unknown message type {}", tag))
        })?;

        let (destination, network_path) = if routed {
            let destination = array[1]
                .as_str()
                .ok_or_else(|| ParseError::formation(rid.clone(), "destination is not a string"))?;
            let path: NetworkPath = serde_json::from_value(array[2].clone()).map_err(|_| {
                ParseError::formation(rid.clone(), "network path is not a list of node ids")
            })?;
            (Some(NodeId::from(destination)), path)
        } else {
            (None, NetworkPath::new())
        };

        let body = &array[id_index + 1..];
        let arity = |expected: usize| {
            if body.len() == expected {
                Ok(())
            } else {
                Err(ParseError::could_not_parse(
                    rid.clone(),
                    format!(
                        "{:?} expects {} fields after the message id, got {}",
                        msg_type,
                        expected,
                        body.len()
                    ),
                ))
            }
        };

        match msg_type {
            MessageType::Call | MessageType::Send => {
                arity(2)?;
                let action = body[0]
                    .as_str()
                    .ok_or_else(|| {
                        ParseError::could_not_parse(rid.clone(), "action is not a string")
                    })?
                    .to_string();
                let (payload, signatures) = split_signatures(body[1].clone(), &rid)?;

                if msg_type == MessageType::Call {
                    Ok(Envelope::Request(Request {
                        request_id,
                        action,
                        destination,
                        network_path,
                        payload: Payload::Json(payload),
                        signatures,
                        sign_infos: Vec::new(),
                    }))
                } else {
                    Ok(Envelope::Send(SendMessage {
                        request_id,
                        action,
                        destination,
                        network_path,
                        payload: Payload::Json(payload),
                        signatures,
                    }))
                }
            }
            MessageType::CallResult => {
                arity(1)?;
                let (payload, signatures) = split_signatures(body[0].clone(), &rid)?;
                Ok(Envelope::Response(Response {
                    request_id,
                    destination,
                    network_path,
                    payload: Payload::Json(payload),
                    signatures,
                }))
            }
            MessageType::CallError => {
                arity(3)?;
                let error_code = body[0]
                    .as_str()
                    .ok_or_else(|| {
                        ParseError::could_not_parse(rid.clone(), "error code is not a string")
                    })?
                    .parse()
                    .unwrap_or(ErrorCode::GenericError);
                let description = body[1].as_str().unwrap_or("").to_string();

                Ok(Envelope::Error(ErrorMessage {
                    request_id,
                    destination,
                    network_path,
                    error_code,
                    description,
                    details: body[2].clone(),
                    format: Format::Json,
                }))
            }
        }
    }

    /// Get the request id
    pub fn request_id(&self) -> &RequestId {
        match self {
            Envelope::Request(r) => &r.request_id,
            Envelope::Response(r) => &r.request_id,
            Envelope::Error(e) => &e.request_id,
            Envelope::Send(s) => &s.request_id,
        }
    }

    pub fn destination(&self) -> Option<&NodeId> {
        match self {
            Envelope::Request(r) => r.destination.as_ref(),
            Envelope::Response(r) => r.destination.as_ref(),
            Envelope::Error(e) => e.destination.as_ref(),
            Envelope::Send(s) => s.destination.as_ref(),
        }
    }

    pub fn network_path(&self) -> &NetworkPath {
        match self {
            Envelope::Request(r) => &r.network_path,
            Envelope::Response(r) => &r.network_path,
            Envelope::Error(e) => &e.network_path,
            Envelope::Send(s) => &s.network_path,
        }
    }

    pub fn network_path_mut(&mut self) -> &mut NetworkPath {
        match self {
            Envelope::Request(r) => &mut r.network_path,
            Envelope::Response(r) => &mut r.network_path,
            Envelope::Error(e) => &mut e.network_path,
            Envelope::Send(s) => &mut s.network_path,
        }
    }

    pub fn action(&self) -> Option<&str> {
        match self {
            Envelope::Request(r) => Some(&r.action),
            Envelope::Send(s) => Some(&s.action),
            _ => None,
        }
    }

    pub fn format(&self) -> Format {
        match self {
            Envelope::Request(r) => r.payload.format(),
            Envelope::Response(r) => r.payload.format(),
            Envelope::Error(e) => e.format,
            Envelope::Send(s) => s.payload.format(),
        }
    }

    fn is_routed(&self) -> bool {
        self.destination().is_some() || !self.network_path().is_empty()
    }

    /// Serialize to a transport frame, JSON text or binary
    pub fn to_frame(&self) -> Result<Frame, EncodeError> {
        match self.format() {
            Format::Json => Ok(Frame::Text(self.to_json_string()?)),
            Format::Binary => Ok(Frame::Binary(binary::encode(self)?)),
        }
    }

    /// Serialize to the OCPP JSON array form
    pub fn to_json_string(&self) -> Result<String, EncodeError> {
        let mut items: Vec<Value> = Vec::with_capacity(7);

        let tag = match self {
            Envelope::Request(_) => MessageType::Call,
            Envelope::Response(_) => MessageType::CallResult,
            Envelope::Error(_) => MessageType::CallError,
            Envelope::Send(_) => MessageType::Send,
        };
        items.push(Value::from(tag as i32));

        if self.is_routed() {
            items.push(Value::String(
                self.destination().map(|d| d.to_string()).unwrap_or_default(),
            ));
            items.push(serde_json::to_value(self.network_path())?);
        }
        items.push(Value::String(self.request_id().to_string()));

        match self {
            Envelope::Request(r) => {
                items.push(Value::String(r.action.clone()));
                items.push(json_payload_with_signatures(&r.payload, &r.signatures)?);
            }
            Envelope::Send(s) => {
                items.push(Value::String(s.action.clone()));
                items.push(json_payload_with_signatures(&s.payload, &s.signatures)?);
            }
            Envelope::Response(r) => {
                items.push(json_payload_with_signatures(&r.payload, &r.signatures)?);
            }
            Envelope::Error(e) => {
                items.push(Value::String(e.error_code.to_string()));
                items.push(Value::String(e.description.clone()));
                items.push(e.details.clone());
            }
        }

        Ok(serde_json::to_string(&Value::Array(items))?)
    }
}

/// Pull the `signatures` member out of a JSON payload
fn split_signatures(
    mut payload: Value,
    request_id: &Option<RequestId>,
) -> Result<(Value, Vec<Signature>), ParseError> {
    if !payload.is_object() {
        return Err(ParseError::could_not_parse(
            request_id.clone(),
            "payload is not a JSON object",
        ));
    }

    let signatures = match payload.as_object_mut().and_then(|m| m.remove(SIGNATURES_FIELD)) {
        Some(raw) => serde_json::from_value(raw).map_err(|e| {
            ParseError::formation(request_id.clone(), format!("malformed signatures: {}", e))
        })?,
        None => Vec::new(),
    };

    Ok((payload, signatures))
}

fn json_payload_with_signatures(
    payload: &Payload,
    signatures: &[Signature],
) -> Result<Value, serde_json::Error> {
    let mut value = match payload {
        Payload::Json(v) => v.clone(),
        Payload::Binary(b) => serde_json::from_slice(b)?,
    };

    if !signatures.is_empty() {
        if let Some(map) = value.as_object_mut() {
            map.insert(SIGNATURES_FIELD.to_string(), serde_json::to_value(signatures)?);
        }
    }
    Ok(value)
}

fn canonical(payload: &Payload) -> Result<Vec<u8>, SignatureError> {
    payload
        .canonical_bytes()
        .map_err(|e| SignatureError::Canonicalization(e.to_string()))
}

impl Signable for Request {
    fn signatures(&self) -> &[Signature] {
        &self.signatures
    }

    fn signatures_mut(&mut self) -> &mut Vec<Signature> {
        &mut self.signatures
    }

    fn canonical_bytes(&self) -> Result<Vec<u8>, SignatureError> {
        canonical(&self.payload)
    }

    fn sign_infos(&self) -> &[KeyPair] {
        &self.sign_infos
    }
}

impl Signable for Response {
    fn signatures(&self) -> &[Signature] {
        &self.signatures
    }

    fn signatures_mut(&mut self) -> &mut Vec<Signature> {
        &mut self.signatures
    }

    fn canonical_bytes(&self) -> Result<Vec<u8>, SignatureError> {
        canonical(&self.payload)
    }
}

impl Signable for SendMessage {
    fn signatures(&self) -> &[Signature] {
        &self.signatures
    }

    fn signatures_mut(&mut self) -> &mut Vec<Signature> {
        &mut self.signatures
    }

    fn canonical_bytes(&self) -> Result<Vec<u8>, SignatureError> {
        canonical(&self.payload)
    }
}
