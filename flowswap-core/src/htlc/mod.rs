//! HTLC codec layer.
//!
//! Builds and parses the three per-chain HTLC encodings: the BTC P2WSH
//! three-secret script, its M1 twin, and the EVM contract's calldata and
//! event logs. The engine never touches raw scripts or ABI words directly;
//! it dispatches on the leg variant and calls into these modules.

pub mod btc_script;
pub mod evm_abi;
pub mod m1_script;

use crate::crypto::{HashlockTriple, SecretSlot};
use crate::error::CodecError;

/// How a watched HTLC output was spent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpendKind {
    Claim,
    Refund,
}

/// Classify a witness stack spending a three-secret HTLC output.
///
/// Claim stacks are `[sig, S_lp2, S_lp1, S_user, <1>, script]`; refund
/// stacks are `[sig, <0>, script]` where `<0>` is the empty push.
pub fn classify_witness(items: &[Vec<u8>]) -> Option<SpendKind> {
    if items.len() < 3 {
        return None;
    }
    let selector = &items[items.len() - 2];
    if selector.is_empty() {
        Some(SpendKind::Refund)
    } else if selector.as_slice() == [1u8] {
        Some(SpendKind::Claim)
    } else {
        None
    }
}

/// Extract the three preimages from a claim witness stack and match each
/// to its hashlock by hashing. Returns them in declaration order
/// `(S_user, S_lp1, S_lp2)`.
pub fn extract_preimages(
    items: &[Vec<u8>],
    hashlocks: &HashlockTriple,
) -> Result<[[u8; 32]; 3], CodecError> {
    let mut user = None;
    let mut lp1 = None;
    let mut lp2 = None;
    for item in items {
        if item.len() != 32 {
            continue;
        }
        let mut candidate = [0u8; 32];
        candidate.copy_from_slice(item);
        match hashlocks.classify(&candidate) {
            Some(SecretSlot::User) => user = Some(candidate),
            Some(SecretSlot::Lp1) => lp1 = Some(candidate),
            Some(SecretSlot::Lp2) => lp2 = Some(candidate),
            None => {}
        }
    }
    match (user, lp1, lp2) {
        (Some(u), Some(l1), Some(l2)) => Ok([u, l1, l2]),
        _ => Err(CodecError::Witness(
            "claim witness does not reveal all three preimages".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256;

    fn triple_with_secrets() -> (HashlockTriple, [[u8; 32]; 3]) {
        let secrets = [[0x11u8; 32], [0x22u8; 32], [0x33u8; 32]];
        let triple = HashlockTriple {
            user: sha256(&secrets[0]),
            lp1: sha256(&secrets[1]),
            lp2: sha256(&secrets[2]),
        };
        (triple, secrets)
    }

    #[test]
    fn classify_claim_and_refund() {
        let claim = vec![
            vec![0xde; 71],
            vec![0x33; 32],
            vec![0x22; 32],
            vec![0x11; 32],
            vec![1],
            vec![0xaa; 80],
        ];
        assert_eq!(classify_witness(&claim), Some(SpendKind::Claim));

        let refund = vec![vec![0xde; 71], vec![], vec![0xaa; 80]];
        assert_eq!(classify_witness(&refund), Some(SpendKind::Refund));

        assert_eq!(classify_witness(&[vec![1]]), None);
    }

    #[test]
    fn extract_matches_by_hash_not_position() {
        let (triple, secrets) = triple_with_secrets();
        // Secrets deliberately shuffled relative to declaration order.
        let witness = vec![
            vec![0xde; 71],
            secrets[0].to_vec(),
            secrets[2].to_vec(),
            secrets[1].to_vec(),
            vec![1],
            vec![0xaa; 80],
        ];
        let extracted = extract_preimages(&witness, &triple).unwrap();
        assert_eq!(extracted, secrets);
    }

    #[test]
    fn extract_fails_on_missing_preimage() {
        let (triple, secrets) = triple_with_secrets();
        let witness = vec![
            vec![0xde; 71],
            secrets[0].to_vec(),
            secrets[1].to_vec(),
            vec![1],
            vec![0xaa; 80],
        ];
        assert!(extract_preimages(&witness, &triple).is_err());
    }
}
