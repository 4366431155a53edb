//! M1 three-secret HTLC script.
//!
//! The M1 interpreter executes the same script semantics as Bitcoin's; only
//! the byte-level encoding is its own, so this module carries its own
//! opcode table and a minimal push encoder instead of going through the
//! `bitcoin` crate. Script hashes address outputs directly: an M1 HTLC
//! address is `m1w` followed by the hex SHA-256 of the witness script.

use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use serde_json::json;

use crate::crypto::{sha256, HashlockTriple};
use crate::error::CodecError;

// M1 interpreter opcode assignments.
const OP_IF: u8 = 0x63;
const OP_ELSE: u8 = 0x67;
const OP_ENDIF: u8 = 0x68;
const OP_DROP: u8 = 0x75;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_SHA256: u8 = 0xa8;
const OP_CHECKSIG: u8 = 0xac;
const OP_CLTV: u8 = 0xb1;

const MAX_PUSH: usize = 75;

/// Parameters of an M1 three-secret HTLC.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct M1HtlcParams {
    pub hashlocks: HashlockTriple,
    pub claim_pubkey: PublicKey,
    pub refund_pubkey: PublicKey,
    pub timelock_height: u64,
}

fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    debug_assert!(!data.is_empty() && data.len() <= MAX_PUSH);
    script.push(data.len() as u8);
    script.extend_from_slice(data);
}

fn push_int(script: &mut Vec<u8>, value: u64) {
    let mut bytes = Vec::new();
    let mut v = value;
    while v > 0 {
        bytes.push((v & 0xff) as u8);
        v >>= 8;
    }
    if bytes.is_empty() {
        bytes.push(0);
    }
    // Keep the number positive under script-integer sign rules.
    if bytes[bytes.len() - 1] & 0x80 != 0 {
        bytes.push(0);
    }
    push_data(script, &bytes);
}

fn decode_int(bytes: &[u8]) -> Result<u64, CodecError> {
    if bytes.is_empty() || bytes.len() > 8 {
        return Err(CodecError::Script("bad m1 locktime encoding".into()));
    }
    if bytes[bytes.len() - 1] & 0x80 != 0 {
        return Err(CodecError::Script("negative m1 locktime".into()));
    }
    let mut value: u64 = 0;
    for (i, b) in bytes.iter().enumerate() {
        value |= (*b as u64) << (8 * i);
    }
    Ok(value)
}

impl M1HtlcParams {
    pub fn redeem_script(&self) -> Vec<u8> {
        let mut script = Vec::with_capacity(180);
        script.push(OP_IF);
        for hash in self.hashlocks.ordered() {
            script.push(OP_SHA256);
            push_data(&mut script, &hash);
            script.push(OP_EQUALVERIFY);
        }
        push_data(&mut script, &self.claim_pubkey.serialize());
        script.push(OP_CHECKSIG);
        script.push(OP_ELSE);
        push_int(&mut script, self.timelock_height);
        script.push(OP_CLTV);
        script.push(OP_DROP);
        push_data(&mut script, &self.refund_pubkey.serialize());
        script.push(OP_CHECKSIG);
        script.push(OP_ENDIF);
        script
    }

    pub fn address(&self) -> String {
        format!("m1w{}", hex::encode(sha256(&self.redeem_script())))
    }
}

/// Single-key M1 address, used for LP payouts: `m1k` plus the hex SHA-256
/// of the serialized pubkey.
pub fn key_address(pubkey: &PublicKey) -> String {
    format!("m1k{}", hex::encode(sha256(&pubkey.serialize())))
}

/// Parse an M1 redeem script back into its parameters.
pub fn parse_redeem_script(script: &[u8]) -> Result<M1HtlcParams, CodecError> {
    let mut hashes: Vec<[u8; 32]> = Vec::with_capacity(3);
    let mut keys: Vec<PublicKey> = Vec::with_capacity(2);
    let mut timelock: Option<u64> = None;
    let mut last_push: Option<Vec<u8>> = None;

    let mut i = 0usize;
    while i < script.len() {
        let byte = script[i];
        if (1..=MAX_PUSH as u8).contains(&byte) {
            let len = byte as usize;
            let end = i + 1 + len;
            if end > script.len() {
                return Err(CodecError::Script("truncated m1 push".into()));
            }
            let data = &script[i + 1..end];
            match len {
                32 => {
                    let mut h = [0u8; 32];
                    h.copy_from_slice(data);
                    hashes.push(h);
                }
                33 => {
                    let key = PublicKey::from_slice(data)
                        .map_err(|e| CodecError::Script(e.to_string()))?;
                    keys.push(key);
                }
                _ => {}
            }
            last_push = Some(data.to_vec());
            i = end;
        } else {
            if byte == OP_CLTV {
                let data = last_push
                    .as_ref()
                    .ok_or_else(|| CodecError::Script("m1 OP_CLTV without locktime".into()))?;
                timelock = Some(decode_int(data)?);
            }
            last_push = None;
            i += 1;
        }
    }

    if hashes.len() != 3 || keys.len() != 2 {
        return Err(CodecError::Script(
            "m1 script is not a three-secret htlc".into(),
        ));
    }
    Ok(M1HtlcParams {
        hashlocks: HashlockTriple {
            user: hashes[0],
            lp1: hashes[1],
            lp2: hashes[2],
        },
        claim_pubkey: keys[0],
        refund_pubkey: keys[1],
        timelock_height: timelock
            .ok_or_else(|| CodecError::Script("missing m1 locktime".into()))?,
    })
}

/// Signature over the canonical spend commitment `(outpoint, recipient,
/// value)`, as the M1 interpreter defines it.
fn sign_spend(
    outpoint: &str,
    recipient: &str,
    value: u64,
    key: &SecretKey,
) -> Result<Vec<u8>, CodecError> {
    let mut data = Vec::new();
    data.extend_from_slice(outpoint.as_bytes());
    data.extend_from_slice(recipient.as_bytes());
    data.extend_from_slice(&value.to_le_bytes());
    let digest = sha256(&data);
    let msg = Message::from_slice(&digest).map_err(|e| CodecError::Script(e.to_string()))?;
    let secp = Secp256k1::new();
    let sig = secp.sign_ecdsa(&msg, key);
    Ok(sig.serialize_compact().to_vec())
}

/// Build the raw claim transaction the M1 daemon accepts: a single input
/// spending the HTLC outpoint with the claim witness stack, paying
/// `value - fee` to `payout`.
pub fn build_claim_tx(
    outpoint: &str,
    value: u64,
    fee: u64,
    params: &M1HtlcParams,
    payout: &str,
    secrets: &[[u8; 32]; 3],
    key: &SecretKey,
) -> Result<Vec<u8>, CodecError> {
    let out_value = value
        .checked_sub(fee)
        .ok_or_else(|| CodecError::Script("fee exceeds htlc value".into()))?;
    let signature = sign_spend(outpoint, payout, out_value, key)?;
    let witness = vec![
        hex::encode(&signature),
        hex::encode(secrets[2]),
        hex::encode(secrets[1]),
        hex::encode(secrets[0]),
        "01".to_string(),
        hex::encode(params.redeem_script()),
    ];
    let tx = json!({
        "inputs": [{ "outpoint": outpoint, "witness": witness }],
        "outputs": [{ "address": payout, "value": out_value }],
        "locktime": 0,
    });
    Ok(tx.to_string().into_bytes())
}

/// Build the raw refund transaction for an expired M1 HTLC.
pub fn build_refund_tx(
    outpoint: &str,
    value: u64,
    fee: u64,
    params: &M1HtlcParams,
    refund_to: &str,
    key: &SecretKey,
) -> Result<Vec<u8>, CodecError> {
    let out_value = value
        .checked_sub(fee)
        .ok_or_else(|| CodecError::Script("fee exceeds htlc value".into()))?;
    let signature = sign_spend(outpoint, refund_to, out_value, key)?;
    let witness = vec![
        hex::encode(&signature),
        String::new(),
        hex::encode(params.redeem_script()),
    ];
    let tx = json!({
        "inputs": [{ "outpoint": outpoint, "witness": witness }],
        "outputs": [{ "address": refund_to, "value": out_value }],
        "locktime": params.timelock_height,
    });
    Ok(tx.to_string().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_key(byte: u8) -> (SecretKey, PublicKey) {
        let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
        let secp = Secp256k1::new();
        (sk, PublicKey::from_secret_key(&secp, &sk))
    }

    fn test_params(timelock_height: u64) -> M1HtlcParams {
        M1HtlcParams {
            hashlocks: HashlockTriple {
                user: sha256(b"su"),
                lp1: sha256(b"s1"),
                lp2: sha256(b"s2"),
            },
            claim_pubkey: test_key(3).1,
            refund_pubkey: test_key(4).1,
            timelock_height,
        }
    }

    #[test]
    fn script_round_trip() {
        let params = test_params(910_000);
        let parsed = parse_redeem_script(&params.redeem_script()).unwrap();
        assert_eq!(parsed, params);
    }

    #[test]
    fn address_format() {
        let address = test_params(910_000).address();
        assert!(address.starts_with("m1w"));
        assert_eq!(address.len(), 3 + 64);
    }

    #[test]
    fn claim_tx_is_daemon_json() {
        let params = test_params(910_000);
        let (sk, _) = test_key(3);
        let secrets = [[0x11; 32], [0x22; 32], [0x33; 32]];
        let raw = build_claim_tx(
            &format!("{}:0", "ab".repeat(32)),
            100_000,
            200,
            &params,
            "m1wdeadbeef",
            &secrets,
            &sk,
        )
        .unwrap();
        let tx: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(tx["outputs"][0]["value"], 99_800);
        let witness = tx["inputs"][0]["witness"].as_array().unwrap();
        assert_eq!(witness.len(), 6);
        assert_eq!(witness[4], "01");
    }

    proptest! {
        #[test]
        fn script_round_trip_any_height(height in 1u64..5_000_000u64) {
            let params = test_params(height);
            let parsed = parse_redeem_script(&params.redeem_script()).unwrap();
            prop_assert_eq!(parsed, params);
        }
    }
}
