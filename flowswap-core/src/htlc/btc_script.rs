//! BTC three-secret HTLC script (P2WSH).
//!
//! Redeem script layout:
//!
//! ```text
//! OP_IF
//!     OP_SHA256 <H_user> OP_EQUALVERIFY
//!     OP_SHA256 <H_lp1>  OP_EQUALVERIFY
//!     OP_SHA256 <H_lp2>  OP_EQUALVERIFY
//!     <claim_pubkey> OP_CHECKSIG
//! OP_ELSE
//!     <locktime> OP_CLTV OP_DROP <refund_pubkey> OP_CHECKSIG
//! OP_ENDIF
//! ```
//!
//! Single SHA-256 throughout, matching the EVM contract so the preimages
//! stay interchangeable across chains.

use std::str::FromStr;

use bitcoin::absolute::LockTime;
use bitcoin::blockdata::opcodes;
use bitcoin::blockdata::script::{Builder as ScriptBuilder, Instruction};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{
    Address, Network, OutPoint, PublicKey, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut,
    Witness,
};
use secp256k1::{Message, Secp256k1, SecretKey};

use crate::crypto::HashlockTriple;
use crate::error::CodecError;

/// Parameters of a BTC three-secret HTLC.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BtcHtlcParams {
    pub hashlocks: HashlockTriple,
    pub claim_pubkey: PublicKey,
    pub refund_pubkey: PublicKey,
    pub timelock_height: u32,
}

impl BtcHtlcParams {
    pub fn redeem_script(&self) -> ScriptBuf {
        let [h_user, h_lp1, h_lp2] = self.hashlocks.ordered();
        ScriptBuilder::new()
            .push_opcode(opcodes::all::OP_IF)
            .push_opcode(opcodes::all::OP_SHA256)
            .push_slice(h_user)
            .push_opcode(opcodes::all::OP_EQUALVERIFY)
            .push_opcode(opcodes::all::OP_SHA256)
            .push_slice(h_lp1)
            .push_opcode(opcodes::all::OP_EQUALVERIFY)
            .push_opcode(opcodes::all::OP_SHA256)
            .push_slice(h_lp2)
            .push_opcode(opcodes::all::OP_EQUALVERIFY)
            .push_key(&self.claim_pubkey)
            .push_opcode(opcodes::all::OP_CHECKSIG)
            .push_opcode(opcodes::all::OP_ELSE)
            .push_int(self.timelock_height as i64)
            .push_opcode(opcodes::all::OP_CLTV)
            .push_opcode(opcodes::all::OP_DROP)
            .push_key(&self.refund_pubkey)
            .push_opcode(opcodes::all::OP_CHECKSIG)
            .push_opcode(opcodes::all::OP_ENDIF)
            .into_script()
    }

    pub fn p2wsh_address(&self, network: Network) -> Address {
        Address::p2wsh(&self.redeem_script(), network)
    }
}

/// Parse a redeem script back into its parameters. Inverse of
/// [`BtcHtlcParams::redeem_script`].
pub fn parse_redeem_script(script: &Script) -> Result<BtcHtlcParams, CodecError> {
    let instructions: Vec<Instruction> = script
        .instructions()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CodecError::Script(e.to_string()))?;

    let mut hashes: Vec<[u8; 32]> = Vec::with_capacity(3);
    let mut keys: Vec<PublicKey> = Vec::with_capacity(2);
    let mut timelock: Option<u32> = None;

    for (i, instruction) in instructions.iter().enumerate() {
        match instruction {
            Instruction::PushBytes(data) if data.len() == 32 => {
                let mut h = [0u8; 32];
                h.copy_from_slice(data.as_bytes());
                hashes.push(h);
            }
            Instruction::PushBytes(data) if data.len() == 33 => {
                let key = PublicKey::from_slice(data.as_bytes())
                    .map_err(|e| CodecError::Script(e.to_string()))?;
                keys.push(key);
            }
            Instruction::Op(op) if *op == opcodes::all::OP_CLTV => {
                let prev = instructions
                    .get(i.wrapping_sub(1))
                    .ok_or_else(|| CodecError::Script("OP_CLTV without locktime push".into()))?;
                if let Instruction::PushBytes(data) = prev {
                    timelock = Some(decode_script_int(data.as_bytes())?);
                }
            }
            _ => {}
        }
    }

    if hashes.len() != 3 {
        return Err(CodecError::Script(format!(
            "expected 3 hashlock pushes, found {}",
            hashes.len()
        )));
    }
    if keys.len() != 2 {
        return Err(CodecError::Script(format!(
            "expected 2 pubkey pushes, found {}",
            keys.len()
        )));
    }
    let timelock_height =
        timelock.ok_or_else(|| CodecError::Script("missing CLTV locktime".into()))?;

    Ok(BtcHtlcParams {
        hashlocks: HashlockTriple {
            user: hashes[0],
            lp1: hashes[1],
            lp2: hashes[2],
        },
        claim_pubkey: keys[0],
        refund_pubkey: keys[1],
        timelock_height,
    })
}

/// Decode a minimally-encoded script integer (positive, up to 5 bytes LE).
fn decode_script_int(bytes: &[u8]) -> Result<u32, CodecError> {
    if bytes.is_empty() || bytes.len() > 5 {
        return Err(CodecError::Script("bad locktime encoding".into()));
    }
    let mut value: u64 = 0;
    for (i, b) in bytes.iter().enumerate() {
        value |= (*b as u64) << (8 * i);
    }
    // Script integers carry the sign in the high bit of the last byte.
    if bytes[bytes.len() - 1] & 0x80 != 0 {
        return Err(CodecError::Script("negative locktime".into()));
    }
    u32::try_from(value).map_err(|_| CodecError::Script("locktime exceeds u32".into()))
}

/// Assemble the claim witness: `<sig> <S_lp2> <S_lp1> <S_user> <1> <script>`.
/// `secrets` are in declaration order `(S_user, S_lp1, S_lp2)`.
pub fn claim_witness(signature: &[u8], secrets: &[[u8; 32]; 3], redeem_script: &Script) -> Witness {
    let mut witness = Witness::new();
    witness.push(signature);
    witness.push(secrets[2]);
    witness.push(secrets[1]);
    witness.push(secrets[0]);
    witness.push([1u8]);
    witness.push(redeem_script.as_bytes());
    witness
}

/// Assemble the refund witness: `<sig> <0> <script>`.
pub fn refund_witness(signature: &[u8], redeem_script: &Script) -> Witness {
    let mut witness = Witness::new();
    witness.push(signature);
    witness.push([0u8; 0]);
    witness.push(redeem_script.as_bytes());
    witness
}

fn parse_outpoint(outpoint: &str) -> Result<OutPoint, CodecError> {
    OutPoint::from_str(outpoint).map_err(|e| CodecError::Script(e.to_string()))
}

fn sign_htlc_input(
    tx: &Transaction,
    redeem_script: &Script,
    value: u64,
    key: &SecretKey,
) -> Result<Vec<u8>, CodecError> {
    let mut cache = SighashCache::new(tx);
    let sighash = cache
        .segwit_signature_hash(0, redeem_script, value, EcdsaSighashType::All)
        .map_err(|e| CodecError::Script(e.to_string()))?;
    let msg = Message::from_slice(sighash.as_ref()).map_err(|e| CodecError::Script(e.to_string()))?;
    let secp = Secp256k1::new();
    let sig = secp.sign_ecdsa(&msg, key);
    let mut der = sig.serialize_der().to_vec();
    der.push(EcdsaSighashType::All as u8);
    Ok(der)
}

/// Build and sign the transaction sweeping a funded HTLC output through the
/// claim branch.
pub fn build_claim_tx(
    outpoint: &str,
    value: u64,
    fee: u64,
    params: &BtcHtlcParams,
    payout: &Address,
    secrets: &[[u8; 32]; 3],
    key: &SecretKey,
) -> Result<Transaction, CodecError> {
    let redeem_script = params.redeem_script();
    let mut tx = Transaction {
        version: 2,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: parse_outpoint(outpoint)?,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: value
                .checked_sub(fee)
                .ok_or_else(|| CodecError::Script("fee exceeds htlc value".into()))?,
            script_pubkey: payout.script_pubkey(),
        }],
    };
    let signature = sign_htlc_input(&tx, &redeem_script, value, key)?;
    tx.input[0].witness = claim_witness(&signature, secrets, &redeem_script);
    Ok(tx)
}

/// Build and sign the refund transaction. Valid only once the chain tip has
/// passed the HTLC locktime; the transaction carries that locktime so the
/// network enforces OP_CLTV.
pub fn build_refund_tx(
    outpoint: &str,
    value: u64,
    fee: u64,
    params: &BtcHtlcParams,
    refund_to: &Address,
    key: &SecretKey,
) -> Result<Transaction, CodecError> {
    let redeem_script = params.redeem_script();
    let lock_time = LockTime::from_height(params.timelock_height)
        .map_err(|e| CodecError::Script(e.to_string()))?;
    let mut tx = Transaction {
        version: 2,
        lock_time,
        input: vec![TxIn {
            previous_output: parse_outpoint(outpoint)?,
            script_sig: ScriptBuf::new(),
            // Sequence below final so the locktime is consensus-enforced.
            sequence: Sequence::ENABLE_LOCKTIME_NO_RBF,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: value
                .checked_sub(fee)
                .ok_or_else(|| CodecError::Script("fee exceeds htlc value".into()))?,
            script_pubkey: refund_to.script_pubkey(),
        }],
    };
    let signature = sign_htlc_input(&tx, &redeem_script, value, key)?;
    tx.input[0].witness = refund_witness(&signature, &redeem_script);
    Ok(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256;
    use proptest::prelude::*;

    fn test_key(byte: u8) -> (SecretKey, PublicKey) {
        let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
        let secp = Secp256k1::new();
        let pk = PublicKey::new(secp256k1::PublicKey::from_secret_key(&secp, &sk));
        (sk, pk)
    }

    fn test_params(timelock_height: u32) -> BtcHtlcParams {
        BtcHtlcParams {
            hashlocks: HashlockTriple {
                user: sha256(b"su"),
                lp1: sha256(b"s1"),
                lp2: sha256(b"s2"),
            },
            claim_pubkey: test_key(1).1,
            refund_pubkey: test_key(2).1,
            timelock_height,
        }
    }

    #[test]
    fn script_round_trip() {
        let params = test_params(820_000);
        let script = params.redeem_script();
        let parsed = parse_redeem_script(&script).unwrap();
        assert_eq!(parsed, params);
    }

    #[test]
    fn address_is_segwit() {
        let params = test_params(820_000);
        let address = params.p2wsh_address(Network::Regtest);
        assert!(address.to_string().starts_with("bcrt1"));
    }

    #[test]
    fn claim_witness_layout() {
        let params = test_params(820_000);
        let script = params.redeem_script();
        let secrets = [[0x11; 32], [0x22; 32], [0x33; 32]];
        let witness = claim_witness(&[0xde; 71], &secrets, &script);
        let items: Vec<Vec<u8>> = witness.to_vec();
        assert_eq!(items.len(), 6);
        assert_eq!(items[1], vec![0x33; 32]); // S_lp2
        assert_eq!(items[2], vec![0x22; 32]); // S_lp1
        assert_eq!(items[3], vec![0x11; 32]); // S_user
        assert_eq!(items[4], vec![1]);
        assert_eq!(items[5], script.as_bytes().to_vec());
    }

    #[test]
    fn claim_tx_spends_to_payout() {
        let params = test_params(820_000);
        let (claim_sk, _) = test_key(1);
        let payout = Address::p2wsh(
            &ScriptBuilder::new()
                .push_opcode(opcodes::OP_TRUE)
                .into_script(),
            Network::Regtest,
        );
        let outpoint = format!("{}:0", "11".repeat(32));
        let secrets = [
            *b"susususususususususususususususu",
            *b"s1s1s1s1s1s1s1s1s1s1s1s1s1s1s1s1",
            *b"s2s2s2s2s2s2s2s2s2s2s2s2s2s2s2s2",
        ];
        let tx = build_claim_tx(&outpoint, 100_000, 500, &params, &payout, &secrets, &claim_sk)
            .unwrap();
        assert_eq!(tx.output[0].value, 99_500);
        assert_eq!(tx.input[0].witness.len(), 6);
    }

    #[test]
    fn refund_tx_carries_locktime() {
        let params = test_params(820_000);
        let (refund_sk, _) = test_key(2);
        let refund_to = Address::p2wsh(
            &ScriptBuilder::new()
                .push_opcode(opcodes::OP_TRUE)
                .into_script(),
            Network::Regtest,
        );
        let outpoint = format!("{}:1", "22".repeat(32));
        let tx =
            build_refund_tx(&outpoint, 50_000, 500, &params, &refund_to, &refund_sk).unwrap();
        assert_eq!(tx.lock_time.to_consensus_u32(), 820_000);
        let items: Vec<Vec<u8>> = tx.input[0].witness.to_vec();
        assert_eq!(items.len(), 3);
        assert!(items[1].is_empty());
    }

    proptest! {
        #[test]
        fn script_round_trip_any_height(height in 500u32..2_000_000u32) {
            let params = test_params(height);
            let parsed = parse_redeem_script(&params.redeem_script()).unwrap();
            prop_assert_eq!(parsed, params);
        }
    }
}
