//! Property tests for signatures and network paths
//!
//! - Sign / verify holds for every curve and any payload
//! - Flipping any byte of the canonical payload breaks verification
//! - Appending hops never loses the source

use ocpp_core::policy::{sign_message, verify_message};
use ocpp_core::signature::verify_all;
use ocpp_core::{Curve, KeyPair, MessageContext, NetworkPath, NodeId, Request, SignaturePolicy};
use proptest::prelude::*;
use serde_json::json;

// ============================================================================
// Strategies
// ============================================================================

fn curve() -> impl Strategy<Value = Curve> {
    prop_oneof![
        Just(Curve::Secp256r1),
        Just(Curve::Secp384r1),
        Just(Curve::Secp521r1),
    ]
}

fn canonical_payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..256)
}

fn node_ids() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[A-Z]{2}[0-9]{3}", 1..8)
}

// ============================================================================
// Signature Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn sign_then_verify_succeeds(curve in curve(), payload in canonical_payload()) {
        let key = KeyPair::generate(curve);
        let mut sigs = vec![key.sign(&payload).unwrap()];
        prop_assert!(verify_all(&mut sigs, &payload, true).is_ok());
    }

    #[test]
    fn any_mutated_byte_fails(
        curve in curve(),
        payload in canonical_payload(),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255u8,
    ) {
        let key = KeyPair::generate(curve);
        let mut sigs = vec![key.sign(&payload).unwrap()];

        let mut tampered = payload.clone();
        let i = index.index(tampered.len());
        tampered[i] ^= flip;

        prop_assert!(verify_all(&mut sigs, &tampered, false).is_err());
    }

    #[test]
    fn signed_request_verifies(curve in curve(), evse in 0i64..64, kind in "[A-Za-z]{1,12}") {
        let key = KeyPair::generate(curve);
        let context = MessageContext::request("Reset");
        let mut request = Request::new("Reset", json!({"type": kind, "evseId": evse}));

        sign_message(&mut request, &context, &SignaturePolicy::new(), &[key]).unwrap();
        prop_assert!(verify_message(&mut request, true).is_ok());
    }
}

// ============================================================================
// Network Path Property Tests
// ============================================================================

proptest! {
    #[test]
    fn append_hop_preserves_source(ids in node_ids()) {
        let mut path = NetworkPath::from_source(ids[0].as_str());
        for id in &ids[1..] {
            let next = path.append_hop(id.as_str());
            prop_assert_eq!(next.len(), path.len() + 1);
            prop_assert_eq!(next.last_hop(), Some(&NodeId::from(id.as_str())));
            path = next;
        }
        prop_assert_eq!(path.source(), Some(&NodeId::from(ids[0].as_str())));
        for id in &ids {
            prop_assert!(path.contains(&NodeId::from(id.as_str())));
        }
    }
}
