//! Signature policy: which keys sign which messages, and how strictly
//! incoming signatures are checked
//!
//! A policy is a table keyed by [`MessageContext`]. Each entry lists the key
//! pairs that sign messages of that context and the rule applied when such a
//! message arrives (no verification, any signature valid, all valid).

use std::collections::HashMap;
use std::fmt;
use tracing::debug;

use crate::signature::{judge, verify_all, KeyPair, Signature, SignatureError, VerificationStatus};

/// Identity of a message kind, e.g. `ResetRequest` or `ResetResponse`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageContext(String);

impl MessageContext {
    pub fn new(context: impl Into<String>) -> Self {
        Self(context.into())
    }

    pub fn request(action: &str) -> Self {
        Self(format!("{}Request", action))
    }

    pub fn response(action: &str) -> Self {
        Self(format!("{}Response", action))
    }

    /// One-way SEND messages
    pub fn message(action: &str) -> Self {
        Self(format!("{}Message", action))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How signatures on an incoming message are judged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VerificationRule {
    /// Signatures are not checked
    #[default]
    None,
    /// At least one signature must verify
    Any,
    /// Every signature must verify
    All,
}

/// One row of the policy table
#[derive(Debug, Clone)]
pub struct SignaturePolicyEntry {
    pub context: MessageContext,
    pub keys: Vec<KeyPair>,
    pub verification: VerificationRule,
}

impl SignaturePolicyEntry {
    pub fn new(context: MessageContext) -> Self {
        Self {
            context,
            keys: Vec::new(),
            verification: VerificationRule::None,
        }
    }

    pub fn with_key(mut self, key: KeyPair) -> Self {
        self.keys.push(key);
        self
    }

    pub fn with_verification(mut self, rule: VerificationRule) -> Self {
        self.verification = rule;
        self
    }
}

/// Context-keyed signing and verification rules
#[derive(Debug, Clone, Default)]
pub struct SignaturePolicy {
    entries: HashMap<MessageContext, SignaturePolicyEntry>,
}

impl SignaturePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the entry for its context
    pub fn with_entry(mut self, entry: SignaturePolicyEntry) -> Self {
        self.entries.insert(entry.context.clone(), entry);
        self
    }

    /// Sign every message of `context` with `key`
    pub fn sign_with(mut self, context: MessageContext, key: KeyPair) -> Self {
        self.entries
            .entry(context.clone())
            .or_insert_with(|| SignaturePolicyEntry::new(context))
            .keys
            .push(key);
        self
    }

    /// Check incoming messages of `context` with `rule`
    pub fn verify_with(mut self, context: MessageContext, rule: VerificationRule) -> Self {
        self.entries
            .entry(context.clone())
            .or_insert_with(|| SignaturePolicyEntry::new(context))
            .verification = rule;
        self
    }

    pub fn entry(&self, context: &MessageContext) -> Option<&SignaturePolicyEntry> {
        self.entries.get(context)
    }

    pub fn keys_for(&self, context: &MessageContext) -> &[KeyPair] {
        self.entries
            .get(context)
            .map(|e| e.keys.as_slice())
            .unwrap_or(&[])
    }

    pub fn verification_for(&self, context: &MessageContext) -> VerificationRule {
        self.entries
            .get(context)
            .map(|e| e.verification)
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A message that can carry detached signatures
pub trait Signable {
    fn signatures(&self) -> &[Signature];

    fn signatures_mut(&mut self) -> &mut Vec<Signature>;

    /// Bytes covered by signatures (payload without its signatures)
    fn canonical_bytes(&self) -> Result<Vec<u8>, SignatureError>;

    /// Keys attached to this particular message
    fn sign_infos(&self) -> &[KeyPair] {
        &[]
    }
}

/// Sign a message with every applicable key.
///
/// Applicable keys are the explicit `sign_infos`, the keys attached to the
/// message itself, and the keys `policy` selects for `context`, each used
/// once. Either every signature is appended or the message is left as is.
/// Returns the number of signatures added.
pub fn sign_message<M: Signable>(
    message: &mut M,
    context: &MessageContext,
    policy: &SignaturePolicy,
    sign_infos: &[KeyPair],
) -> Result<usize, SignatureError> {
    let mut keys: Vec<&KeyPair> = Vec::new();
    for key in sign_infos
        .iter()
        .chain(message.sign_infos())
        .chain(policy.keys_for(context))
    {
        if !keys.iter().any(|k| k.public_key == key.public_key) {
            keys.push(key);
        }
    }

    if keys.is_empty() {
        return Ok(0);
    }

    let canonical = message.canonical_bytes()?;
    let signatures = keys
        .iter()
        .map(|key| key.sign(&canonical))
        .collect::<Result<Vec<_>, _>>()?;

    debug!("Signed {} with {} key(s)", context, signatures.len());
    let count = signatures.len();
    message.signatures_mut().extend(signatures);
    Ok(count)
}

/// Verify the signatures of a message, marking each with its status
pub fn verify_message<M: Signable>(
    message: &mut M,
    all_must_be_valid: bool,
) -> Result<(), SignatureError> {
    let canonical = message.canonical_bytes()?;
    verify_all(message.signatures_mut(), &canonical, all_must_be_valid)
}

/// Apply the policy's verification rule for `context`.
///
/// When the entry lists keys, only signatures made with one of them count as
/// valid; the others are marked invalid even if they verify.
pub fn verify_by_policy<M: Signable>(
    message: &mut M,
    context: &MessageContext,
    policy: &SignaturePolicy,
) -> Result<(), SignatureError> {
    let all_must_be_valid = match policy.verification_for(context) {
        VerificationRule::None => return Ok(()),
        VerificationRule::Any => false,
        VerificationRule::All => true,
    };

    let trusted = policy.keys_for(context);
    if trusted.is_empty() {
        return verify_message(message, all_must_be_valid);
    }

    let canonical = message.canonical_bytes()?;
    let signatures = message.signatures_mut();
    match verify_all(signatures, &canonical, all_must_be_valid) {
        Ok(()) | Err(SignatureError::VerificationFailed { .. }) => {}
        Err(e) => return Err(e),
    }

    for signature in signatures.iter_mut() {
        if !trusted.iter().any(|key| key.public_key == signature.key_id) {
            debug!("{}: signature by untrusted key {}", context, signature.key_id);
            signature.status = VerificationStatus::Invalid("untrusted key".into());
        }
    }
    judge(signatures, all_must_be_valid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Request;
    use crate::signature::{Curve, VerificationStatus};
    use serde_json::json;

    fn reset() -> Request {
        Request::new("Reset", json!({"type": "Immediate", "evseId": 1}))
    }

    #[test]
    fn test_policy_selects_keys_by_context() {
        let key = KeyPair::generate(Curve::Secp256r1);
        let context = MessageContext::request("Reset");
        let policy = SignaturePolicy::new().sign_with(context.clone(), key.clone());

        let mut request = reset();
        let n = sign_message(&mut request, &context, &policy, &[]).unwrap();
        assert_eq!(n, 1);
        assert_eq!(request.signatures[0].key_id, key.public_key);

        let mut other = Request::new("Heartbeat", json!({}));
        let heartbeat = MessageContext::request("Heartbeat");
        let n = sign_message(&mut other, &heartbeat, &policy, &[]).unwrap();
        assert_eq!(n, 0);
        assert!(other.signatures.is_empty());
    }

    #[test]
    fn test_all_sources_combined_and_deduplicated() {
        let explicit = KeyPair::generate(Curve::Secp256r1);
        let attached = KeyPair::generate(Curve::Secp384r1);
        let context = MessageContext::request("Reset");
        let policy = SignaturePolicy::new().sign_with(context.clone(), explicit.clone());

        let mut request = reset().signed_with(attached);
        let n = sign_message(&mut request, &context, &policy, &[explicit]).unwrap();
        assert_eq!(n, 2);
        verify_message(&mut request, true).unwrap();
    }

    #[test]
    fn test_signing_is_all_or_nothing() {
        let good = KeyPair::generate(Curve::Secp256r1);
        let broken = KeyPair::generate(Curve::Secp256r1).to_public();

        let mut request = reset();
        let err = sign_message(
            &mut request,
            &MessageContext::request("Reset"),
            &SignaturePolicy::new(),
            &[good, broken],
        )
        .unwrap_err();

        assert!(matches!(err, SignatureError::MissingPrivateKey { .. }));
        assert!(request.signatures.is_empty());
    }

    #[test]
    fn test_payload_change_breaks_signature() {
        let key = KeyPair::generate(Curve::Secp521r1);
        let mut request = reset();
        let context = MessageContext::request("Reset");
        sign_message(&mut request, &context, &SignaturePolicy::new(), &[key]).unwrap();

        request.payload = json!({"type": "OnIdle", "evseId": 1}).into();
        assert!(verify_message(&mut request, false).is_err());
        assert!(matches!(request.signatures[0].status, VerificationStatus::Invalid(_)));
    }

    #[test]
    fn test_verify_by_policy() {
        let context = MessageContext::request("Reset");
        let lax = SignaturePolicy::new();
        let strict = SignaturePolicy::new().verify_with(context.clone(), VerificationRule::All);

        let mut unsigned = reset();
        assert!(verify_by_policy(&mut unsigned, &context, &lax).is_ok());
        assert_eq!(
            verify_by_policy(&mut unsigned, &context, &strict).unwrap_err(),
            SignatureError::NoSignatures
        );
    }

    #[test]
    fn test_verify_by_policy_rejects_untrusted_signer() {
        let context = MessageContext::request("Reset");
        let trusted = KeyPair::generate(Curve::Secp256r1);
        let rogue = KeyPair::generate(Curve::Secp256r1);
        let policy = SignaturePolicy::new().with_entry(
            SignaturePolicyEntry::new(context.clone())
                .with_key(trusted.to_public())
                .with_verification(VerificationRule::All),
        );
        let none = SignaturePolicy::new();

        let mut forged = reset();
        sign_message(&mut forged, &context, &none, &[rogue.clone()]).unwrap();
        assert_eq!(
            verify_by_policy(&mut forged, &context, &policy).unwrap_err(),
            SignatureError::VerificationFailed { invalid: 1, total: 1 }
        );
        assert_eq!(
            forged.signatures[0].status,
            VerificationStatus::Invalid("untrusted key".into())
        );

        let mut genuine = reset();
        sign_message(&mut genuine, &context, &none, &[trusted.clone()]).unwrap();
        verify_by_policy(&mut genuine, &context, &policy).unwrap();
        assert_eq!(genuine.signatures[0].status, VerificationStatus::Valid);

        // Under ALL a trusted signature does not excuse an untrusted one
        let mut mixed = reset();
        sign_message(&mut mixed, &context, &none, &[trusted.clone(), rogue]).unwrap();
        assert!(verify_by_policy(&mut mixed, &context, &policy).is_err());

        let lenient = SignaturePolicy::new().with_entry(
            SignaturePolicyEntry::new(context.clone())
                .with_key(trusted.to_public())
                .with_verification(VerificationRule::Any),
        );
        verify_by_policy(&mut mixed, &context, &lenient).unwrap();
    }
}
