//! # OCPP Core
//!
//! Message model and trust layer shared by every OCPP node:
//!
//! - `types`: node ids, request ids and the network path a message travels
//! - `envelope`: CALL / CALLRESULT / CALLERROR / SEND envelopes and JSON framing
//! - `binary`: the same envelopes framed as binary WebSocket messages
//! - `canonical`: canonical JSON used as signature input
//! - `signature`: ECDSA sign / verify over secp256r1, secp384r1, secp521r1
//! - `policy`: context-keyed signature policy
//!
//! ```
//! use ocpp_core::{Curve, Envelope, KeyPair, MessageContext, Request, SignaturePolicy};
//! use ocpp_core::policy::{sign_message, verify_message};
//! use serde_json::json;
//!
//! let key = KeyPair::generate(Curve::Secp256r1);
//! let policy = SignaturePolicy::new().sign_with(MessageContext::request("Reset"), key);
//!
//! let mut request = Request::new("Reset", json!({"type": "Immediate"})).to("CS001");
//! sign_message(&mut request, &MessageContext::request("Reset"), &policy, &[]).unwrap();
//! verify_message(&mut request, true).unwrap();
//!
//! let frame = Envelope::Request(request).to_frame().unwrap();
//! assert!(Envelope::parse(&frame).is_ok());
//! ```

pub mod actions;
pub mod binary;
pub mod canonical;
pub mod envelope;
pub mod policy;
pub mod signature;
pub mod types;

pub use envelope::{
    EncodeError, Envelope, ErrorCode, ErrorMessage, Format, Frame, MessageType, ParseError,
    Payload, Request, Response, SendMessage,
};
pub use policy::{
    MessageContext, Signable, SignaturePolicy, SignaturePolicyEntry, VerificationRule,
};
pub use signature::{Curve, KeyPair, SignInfo, Signature, SignatureError, VerificationStatus};
pub use types::{NetworkPath, NodeId, RequestId};
