//! Detached ECDSA signatures over canonical message payloads
//!
//! Supported curves:
//! - `secp256r1` (NIST P-256), digest SHA-256
//! - `secp384r1` (NIST P-384), digest SHA-512
//! - `secp521r1` (NIST P-521), digest SHA-512
//!
//! Signatures are deterministic (RFC 6979) and computed over the pre-hashed
//! digest of the canonical payload. The key id of a signature is the base64
//! SEC1 encoding of the signer's public key, so a verifier can rebuild the
//! key without any out-of-band key store.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256, Sha512};
use signature::hazmat::{PrehashSigner, PrehashVerifier};
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Encoding of key material and signature values
pub const ENCODING_BASE64: &str = "base64";

/// Errors raised while signing or verifying
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("unsupported signature encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("key pair '{key}' has no private key")]
    MissingPrivateKey { key: String },

    #[error("could not parse private key of '{key}': {reason}")]
    InvalidPrivateKey { key: String, reason: String },

    #[error("could not parse public key '{key}': {reason}")]
    InvalidPublicKey { key: String, reason: String },

    #[error("malformed signature value: {0}")]
    MalformedSignature(String),

    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("no signatures to verify")]
    NoSignatures,

    #[error("signature verification failed ({invalid} of {total} invalid)")]
    VerificationFailed { invalid: usize, total: usize },

    #[error("could not canonicalize payload: {0}")]
    Canonicalization(String),
}

/// Elliptic curve of a key pair or signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Curve {
    #[serde(rename = "secp256r1")]
    Secp256r1,
    #[serde(rename = "secp384r1")]
    Secp384r1,
    #[serde(rename = "secp521r1")]
    Secp521r1,
}

impl Curve {
    pub const ALL: [Curve; 3] = [Curve::Secp256r1, Curve::Secp384r1, Curve::Secp521r1];

    pub fn name(&self) -> &'static str {
        match self {
            Curve::Secp256r1 => "secp256r1",
            Curve::Secp384r1 => "secp384r1",
            Curve::Secp521r1 => "secp521r1",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, SignatureError> {
        match name {
            "secp256r1" | "P-256" => Ok(Curve::Secp256r1),
            "secp384r1" | "P-384" => Ok(Curve::Secp384r1),
            "secp521r1" | "P-521" => Ok(Curve::Secp521r1),
            other => Err(SignatureError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    /// Infer the curve from the length of an uncompressed or compressed SEC1 point
    pub fn from_public_key_len(len: usize) -> Option<Self> {
        match len {
            65 | 33 => Some(Curve::Secp256r1),
            97 | 49 => Some(Curve::Secp384r1),
            133 | 67 => Some(Curve::Secp521r1),
            _ => None,
        }
    }

    /// Digest the canonical bytes with the hash paired to this curve
    pub fn digest(&self, bytes: &[u8]) -> Vec<u8> {
        match self {
            Curve::Secp256r1 => Sha256::digest(bytes).to_vec(),
            Curve::Secp384r1 | Curve::Secp521r1 => Sha512::digest(bytes).to_vec(),
        }
    }
}

impl fmt::Display for Curve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Key material used to sign messages (also called sign info).
///
/// Keys are held as base64 strings: the raw private scalar and the
/// uncompressed SEC1 public point.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPair {
    pub curve: Curve,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "canonical_time::option")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Alias kept for callers that think in terms of "sign infos"
pub type SignInfo = KeyPair;

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("curve", &self.curve)
            .field("public_key", &self.public_key)
            .field("has_private_key", &self.private_key.is_some())
            .field("name", &self.name)
            .finish()
    }
}

impl KeyPair {
    /// Generate a fresh random key pair on `curve`
    pub fn generate(curve: Curve) -> Self {
        let mut rng = rand::rngs::OsRng;
        let (private, public) = match curve {
            Curve::Secp256r1 => {
                let key = p256::ecdsa::SigningKey::random(&mut rng);
                let public = key.verifying_key().to_encoded_point(false).as_bytes().to_vec();
                (key.to_bytes().to_vec(), public)
            }
            Curve::Secp384r1 => {
                let key = p384::ecdsa::SigningKey::random(&mut rng);
                let public = key.verifying_key().to_encoded_point(false).as_bytes().to_vec();
                (key.to_bytes().to_vec(), public)
            }
            Curve::Secp521r1 => {
                let key = p521::ecdsa::SigningKey::random(&mut rng);
                let public = p521::ecdsa::VerifyingKey::from(&key).to_encoded_point(false).as_bytes().to_vec();
                (key.to_bytes().to_vec(), public)
            }
        };

        Self {
            curve,
            private_key: Some(BASE64.encode(private)),
            public_key: BASE64.encode(public),
            name: None,
            description: None,
            timestamp: Some(Utc::now()),
        }
    }

    /// Key pair holding only a public key (verification side)
    pub fn public_only(curve: Curve, public_key: impl Into<String>) -> Self {
        Self {
            curve,
            private_key: None,
            public_key: public_key.into(),
            name: None,
            description: None,
            timestamp: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Strip the private key
    pub fn to_public(&self) -> Self {
        Self {
            private_key: None,
            ..self.clone()
        }
    }

    /// Key id written into signatures produced by this key pair
    pub fn fingerprint(&self) -> &str {
        &self.public_key
    }

    fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.public_key.clone())
    }

    fn private_bytes(&self) -> Result<Vec<u8>, SignatureError> {
        let encoded = self
            .private_key
            .as_ref()
            .ok_or_else(|| SignatureError::MissingPrivateKey { key: self.label() })?;

        BASE64
            .decode(encoded)
            .map_err(|e| SignatureError::InvalidPrivateKey {
                key: self.label(),
                reason: e.to_string(),
            })
    }

    fn public_bytes(&self) -> Result<Vec<u8>, SignatureError> {
        BASE64
            .decode(&self.public_key)
            .map_err(|e| SignatureError::InvalidPublicKey {
                key: self.label(),
                reason: e.to_string(),
            })
    }

    /// Check that both halves of the key pair parse and belong together
    pub fn validate(&self) -> Result<(), SignatureError> {
        let private = self.private_bytes()?;
        let public = self.public_bytes()?;
        let derived = derive_public_key(self.curve, &private).map_err(|reason| {
            SignatureError::InvalidPrivateKey {
                key: self.label(),
                reason,
            }
        })?;

        parse_public_key(self.curve, &public).map_err(|reason| SignatureError::InvalidPublicKey {
            key: self.label(),
            reason,
        })?;

        if derived != public {
            return Err(SignatureError::InvalidPublicKey {
                key: self.label(),
                reason: "public key does not match private key".into(),
            });
        }
        Ok(())
    }

    /// Sign the canonical bytes of a message
    pub fn sign(&self, canonical: &[u8]) -> Result<Signature, SignatureError> {
        self.validate()?;
        let private = self.private_bytes()?;
        let digest = self.curve.digest(canonical);

        let value = sign_prehash(self.curve, &private, &digest).map_err(|reason| {
            SignatureError::SigningFailed(format!("{}: {}", self.label(), reason))
        })?;

        Ok(Signature {
            key_id: self.public_key.clone(),
            value: BASE64.encode(value),
            algorithm: self.curve.name().to_string(),
            encoding: ENCODING_BASE64.to_string(),
            name: self.name.clone(),
            description: self.description.clone(),
            timestamp: Some(Utc::now()),
            status: VerificationStatus::Unverified,
        })
    }
}

/// Outcome of verifying one signature
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum VerificationStatus {
    #[default]
    Unverified,
    Valid,
    Invalid(String),
}

/// A detached signature attached to a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    /// Public key fingerprint of the signer
    pub key_id: String,
    pub value: String,
    pub algorithm: String,
    pub encoding: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "canonical_time::option")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub status: VerificationStatus,
}

impl Signature {
    /// Check this signature against the canonical bytes it claims to cover
    pub fn verify(&self, canonical: &[u8]) -> Result<(), SignatureError> {
        if self.encoding != ENCODING_BASE64 {
            return Err(SignatureError::UnsupportedEncoding(self.encoding.clone()));
        }

        let curve = Curve::from_name(&self.algorithm)?;
        let public = BASE64
            .decode(&self.key_id)
            .map_err(|e| SignatureError::InvalidPublicKey {
                key: self.key_id.clone(),
                reason: e.to_string(),
            })?;

        if Curve::from_public_key_len(public.len()) != Some(curve) {
            return Err(SignatureError::InvalidPublicKey {
                key: self.key_id.clone(),
                reason: format!("key length {} does not match {}", public.len(), curve),
            });
        }

        let value = BASE64
            .decode(&self.value)
            .map_err(|e| SignatureError::MalformedSignature(e.to_string()))?;

        let digest = curve.digest(canonical);
        verify_prehash(curve, &public, &digest, &value)
    }
}

/// Sign `canonical` with every key pair, all or nothing
pub fn sign_all(keys: &[KeyPair], canonical: &[u8]) -> Result<Vec<Signature>, SignatureError> {
    keys.iter().map(|key| key.sign(canonical)).collect()
}

/// Verify signatures over `canonical`, recording each one's status.
///
/// With `all_must_be_valid` every signature has to check out, otherwise one
/// valid signature is enough.
pub fn verify_all(
    signatures: &mut [Signature],
    canonical: &[u8],
    all_must_be_valid: bool,
) -> Result<(), SignatureError> {
    if signatures.is_empty() {
        return Err(SignatureError::NoSignatures);
    }

    for signature in signatures.iter_mut() {
        signature.status = match signature.verify(canonical) {
            Ok(()) => VerificationStatus::Valid,
            Err(e) => {
                debug!("Signature by {} invalid: {}", signature.key_id, e);
                VerificationStatus::Invalid(e.to_string())
            }
        };
    }

    judge(signatures, all_must_be_valid)
}

/// Apply ALL/ANY to signatures whose status is already set
pub fn judge(signatures: &[Signature], all_must_be_valid: bool) -> Result<(), SignatureError> {
    if signatures.is_empty() {
        return Err(SignatureError::NoSignatures);
    }

    let total = signatures.len();
    let invalid = signatures
        .iter()
        .filter(|s| s.status != VerificationStatus::Valid)
        .count();

    let ok = if all_must_be_valid {
        invalid == 0
    } else {
        invalid < total
    };

    if ok {
        Ok(())
    } else {
        Err(SignatureError::VerificationFailed { invalid, total })
    }
}

fn sign_prehash(curve: Curve, private: &[u8], digest: &[u8]) -> Result<Vec<u8>, String> {
    match curve {
        Curve::Secp256r1 => {
            let key = p256::ecdsa::SigningKey::from_slice(private).map_err(|e| e.to_string())?;
            let sig: p256::ecdsa::Signature = key.sign_prehash(digest).map_err(|e| e.to_string())?;
            Ok(sig.to_bytes().to_vec())
        }
        Curve::Secp384r1 => {
            let key = p384::ecdsa::SigningKey::from_slice(private).map_err(|e| e.to_string())?;
            let sig: p384::ecdsa::Signature = key.sign_prehash(digest).map_err(|e| e.to_string())?;
            Ok(sig.to_bytes().to_vec())
        }
        Curve::Secp521r1 => {
            let key = p521::ecdsa::SigningKey::from_slice(private).map_err(|e| e.to_string())?;
            let sig: p521::ecdsa::Signature = key.sign_prehash(digest).map_err(|e| e.to_string())?;
            Ok(sig.to_bytes().to_vec())
        }
    }
}

fn verify_prehash(
    curve: Curve,
    public: &[u8],
    digest: &[u8],
    value: &[u8],
) -> Result<(), SignatureError> {
    let malformed = |e: signature::Error| SignatureError::MalformedSignature(e.to_string());
    let invalid_key = |reason: String| SignatureError::InvalidPublicKey {
        key: BASE64.encode(public),
        reason,
    };
    let rejected = |_| SignatureError::VerificationFailed { invalid: 1, total: 1 };

    match curve {
        Curve::Secp256r1 => {
            let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(public)
                .map_err(|e| invalid_key(e.to_string()))?;
            let sig = p256::ecdsa::Signature::from_slice(value).map_err(malformed)?;
            key.verify_prehash(digest, &sig).map_err(rejected)
        }
        Curve::Secp384r1 => {
            let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(public)
                .map_err(|e| invalid_key(e.to_string()))?;
            let sig = p384::ecdsa::Signature::from_slice(value).map_err(malformed)?;
            key.verify_prehash(digest, &sig).map_err(rejected)
        }
        Curve::Secp521r1 => {
            let key = p521::ecdsa::VerifyingKey::from_sec1_bytes(public)
                .map_err(|e| invalid_key(e.to_string()))?;
            let sig = p521::ecdsa::Signature::from_slice(value).map_err(malformed)?;
            key.verify_prehash(digest, &sig).map_err(rejected)
        }
    }
}

fn derive_public_key(curve: Curve, private: &[u8]) -> Result<Vec<u8>, String> {
    match curve {
        Curve::Secp256r1 => {
            let key = p256::ecdsa::SigningKey::from_slice(private).map_err(|e| e.to_string())?;
            Ok(key.verifying_key().to_encoded_point(false).as_bytes().to_vec())
        }
        Curve::Secp384r1 => {
            let key = p384::ecdsa::SigningKey::from_slice(private).map_err(|e| e.to_string())?;
            Ok(key.verifying_key().to_encoded_point(false).as_bytes().to_vec())
        }
        Curve::Secp521r1 => {
            let key = p521::ecdsa::SigningKey::from_slice(private).map_err(|e| e.to_string())?;
            Ok(p521::ecdsa::VerifyingKey::from(&key).to_encoded_point(false).as_bytes().to_vec())
        }
    }
}

fn parse_public_key(curve: Curve, public: &[u8]) -> Result<(), String> {
    match curve {
        Curve::Secp256r1 => p256::ecdsa::VerifyingKey::from_sec1_bytes(public)
            .map(|_| ())
            .map_err(|e| e.to_string()),
        Curve::Secp384r1 => p384::ecdsa::VerifyingKey::from_sec1_bytes(public)
            .map(|_| ())
            .map_err(|e| e.to_string()),
        Curve::Secp521r1 => p521::ecdsa::VerifyingKey::from_sec1_bytes(public)
            .map(|_| ())
            .map_err(|e| e.to_string()),
    }
}

/// RFC 3339 UTC timestamps with millisecond precision, so signer and
/// verifier always render the same text for the same instant
pub mod canonical_time {
    use super::*;

    pub fn format(time: &DateTime<Utc>) -> String {
        time.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn serialize<S: Serializer>(
        time: &DateTime<Utc>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(time))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&text)
            .map(|t| t.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            time: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match time {
                Some(t) => serializer.serialize_some(&format(t)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            let text = Option::<String>::deserialize(deserializer)?;
            text.map(|t| {
                DateTime::parse_from_rfc3339(&t)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
        }
    }
}
