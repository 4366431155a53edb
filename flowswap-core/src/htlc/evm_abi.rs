//! Calldata and event codec for the EVM three-hashlock HTLC contract.
//!
//! The contract hashes with SHA-256, not keccak, so preimages interoperate
//! with the BTC/M1 scripts; keccak only appears here for ABI selectors and
//! event topics. Methods:
//!
//! ```text
//! create(address recipient, address token, uint256 amount,
//!        bytes32 hUser, bytes32 hLp1, bytes32 hLp2, uint256 timelock) -> bytes32 id
//! claim(bytes32 id, bytes32 sUser, bytes32 sLp1, bytes32 sLp2)
//! refund(bytes32 id)
//! status(bytes32 id) -> uint8
//! ```

use sha3::{Digest, Keccak256};

use crate::crypto::HashlockTriple;
use crate::error::CodecError;

const WORD: usize = 32;

/// A 20-byte EVM account address.
pub type EvmAddress = [u8; 20];

pub fn parse_address(raw: &str) -> Result<EvmAddress, CodecError> {
    let stripped = raw.strip_prefix("0x").unwrap_or(raw);
    let bytes = hex::decode(stripped)?;
    bytes
        .try_into()
        .map_err(|_| CodecError::Abi("address must be 20 bytes".into()))
}

pub fn format_address(addr: &EvmAddress) -> String {
    format!("0x{}", hex::encode(addr))
}

fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Keccak256::digest(data));
    out
}

fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

fn word_from_u64(value: u64) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}

fn u64_from_word(word: &[u8]) -> Result<u64, CodecError> {
    if word.len() != WORD || word[..24].iter().any(|b| *b != 0) {
        return Err(CodecError::Abi("uint256 exceeds u64".into()));
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&word[24..]);
    Ok(u64::from_be_bytes(bytes))
}

fn word_from_address(addr: &EvmAddress) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[12..].copy_from_slice(addr);
    word
}

fn address_from_word(word: &[u8]) -> Result<EvmAddress, CodecError> {
    if word.len() != WORD || word[..12].iter().any(|b| *b != 0) {
        return Err(CodecError::Abi("malformed address word".into()));
    }
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&word[12..]);
    Ok(addr)
}

fn word_at(data: &[u8], index: usize) -> Result<&[u8], CodecError> {
    data.get(index * WORD..(index + 1) * WORD)
        .ok_or_else(|| CodecError::Abi(format!("calldata truncated at word {index}")))
}

fn bytes32_at(data: &[u8], index: usize) -> Result<[u8; 32], CodecError> {
    let mut out = [0u8; 32];
    out.copy_from_slice(word_at(data, index)?);
    Ok(out)
}

/// Arguments of `create`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvmCreateParams {
    pub recipient: EvmAddress,
    pub token: EvmAddress,
    pub amount: u64,
    pub hashlocks: HashlockTriple,
    pub timelock: u64,
}

pub fn encode_create(params: &EvmCreateParams) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 7 * WORD);
    data.extend_from_slice(&selector(
        "create(address,address,uint256,bytes32,bytes32,bytes32,uint256)",
    ));
    data.extend_from_slice(&word_from_address(&params.recipient));
    data.extend_from_slice(&word_from_address(&params.token));
    data.extend_from_slice(&word_from_u64(params.amount));
    data.extend_from_slice(&params.hashlocks.user);
    data.extend_from_slice(&params.hashlocks.lp1);
    data.extend_from_slice(&params.hashlocks.lp2);
    data.extend_from_slice(&word_from_u64(params.timelock));
    data
}

/// Inverse of [`encode_create`].
pub fn decode_create(calldata: &[u8]) -> Result<EvmCreateParams, CodecError> {
    let expected = selector("create(address,address,uint256,bytes32,bytes32,bytes32,uint256)");
    if calldata.len() < 4 {
        return Err(CodecError::Abi("calldata shorter than selector".into()));
    }
    let (head, body) = calldata.split_at(4);
    if head != expected {
        return Err(CodecError::Abi("not a create call".into()));
    }
    if body.len() != 7 * WORD {
        return Err(CodecError::Abi("create calldata must be 7 words".into()));
    }
    Ok(EvmCreateParams {
        recipient: address_from_word(word_at(body, 0)?)?,
        token: address_from_word(word_at(body, 1)?)?,
        amount: u64_from_word(word_at(body, 2)?)?,
        hashlocks: HashlockTriple {
            user: bytes32_at(body, 3)?,
            lp1: bytes32_at(body, 4)?,
            lp2: bytes32_at(body, 5)?,
        },
        timelock: u64_from_word(word_at(body, 6)?)?,
    })
}

pub fn encode_claim(id: &[u8; 32], secrets: &[[u8; 32]; 3]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 4 * WORD);
    data.extend_from_slice(&selector("claim(bytes32,bytes32,bytes32,bytes32)"));
    data.extend_from_slice(id);
    data.extend_from_slice(&secrets[0]);
    data.extend_from_slice(&secrets[1]);
    data.extend_from_slice(&secrets[2]);
    data
}

pub fn encode_refund(id: &[u8; 32]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + WORD);
    data.extend_from_slice(&selector("refund(bytes32)"));
    data.extend_from_slice(id);
    data
}

pub fn encode_status(id: &[u8; 32]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + WORD);
    data.extend_from_slice(&selector("status(bytes32)"));
    data.extend_from_slice(id);
    data
}

/// `balanceOf(address)` calldata for ERC-20 balance refreshes.
pub fn encode_balance_of(holder: &EvmAddress) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + WORD);
    data.extend_from_slice(&selector("balanceOf(address)"));
    data.extend_from_slice(&word_from_address(holder));
    data
}

/// Contract-side HTLC status, used as the tie-break when events and local
/// state disagree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvmHtlcStatus {
    Unknown,
    Open,
    Claimed,
    Refunded,
}

pub fn decode_status(ret: &[u8]) -> Result<EvmHtlcStatus, CodecError> {
    match u64_from_word(ret)? {
        0 => Ok(EvmHtlcStatus::Unknown),
        1 => Ok(EvmHtlcStatus::Open),
        2 => Ok(EvmHtlcStatus::Claimed),
        3 => Ok(EvmHtlcStatus::Refunded),
        other => Err(CodecError::Abi(format!("unknown htlc status {other}"))),
    }
}

pub fn decode_u64(ret: &[u8]) -> Result<u64, CodecError> {
    u64_from_word(ret)
}

/// Event topics. Only the HTLC id is indexed; hashlocks and preimages ride
/// in the data section so the watcher can match swaps without extra calls.
pub fn topic_created() -> [u8; 32] {
    keccak256(b"HTLCCreated(bytes32,address,address,address,uint256,bytes32,bytes32,bytes32,uint256)")
}

pub fn topic_claimed() -> [u8; 32] {
    keccak256(b"HTLCClaimed(bytes32,bytes32,bytes32,bytes32)")
}

pub fn topic_refunded() -> [u8; 32] {
    keccak256(b"HTLCRefunded(bytes32)")
}

/// Decoded `HTLCCreated` event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatedEvent {
    pub id: [u8; 32],
    pub sender: EvmAddress,
    pub recipient: EvmAddress,
    pub token: EvmAddress,
    pub amount: u64,
    pub hashlocks: HashlockTriple,
    pub timelock: u64,
}

pub fn decode_created(topics: &[[u8; 32]], data: &[u8]) -> Result<CreatedEvent, CodecError> {
    if topics.len() != 2 || topics[0] != topic_created() {
        return Err(CodecError::Abi("not an HTLCCreated log".into()));
    }
    if data.len() != 8 * WORD {
        return Err(CodecError::Abi("HTLCCreated data must be 8 words".into()));
    }
    Ok(CreatedEvent {
        id: topics[1],
        sender: address_from_word(word_at(data, 0)?)?,
        recipient: address_from_word(word_at(data, 1)?)?,
        token: address_from_word(word_at(data, 2)?)?,
        amount: u64_from_word(word_at(data, 3)?)?,
        hashlocks: HashlockTriple {
            user: bytes32_at(data, 4)?,
            lp1: bytes32_at(data, 5)?,
            lp2: bytes32_at(data, 6)?,
        },
        timelock: u64_from_word(word_at(data, 7)?)?,
    })
}

/// Decoded `HTLCClaimed` event: the id plus the three preimages in
/// declaration order.
pub fn decode_claimed(
    topics: &[[u8; 32]],
    data: &[u8],
) -> Result<([u8; 32], [[u8; 32]; 3]), CodecError> {
    if topics.len() != 2 || topics[0] != topic_claimed() {
        return Err(CodecError::Abi("not an HTLCClaimed log".into()));
    }
    if data.len() != 3 * WORD {
        return Err(CodecError::Abi("HTLCClaimed data must be 3 words".into()));
    }
    Ok((
        topics[1],
        [bytes32_at(data, 0)?, bytes32_at(data, 1)?, bytes32_at(data, 2)?],
    ))
}

pub fn decode_refunded(topics: &[[u8; 32]]) -> Result<[u8; 32], CodecError> {
    if topics.len() != 2 || topics[0] != topic_refunded() {
        return Err(CodecError::Abi("not an HTLCRefunded log".into()));
    }
    Ok(topics[1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256;
    use proptest::prelude::*;

    /// Encode the `HTLCCreated` data section, inverse of `decode_created`.
    fn encode_created_data(event: &CreatedEvent) -> Vec<u8> {
        let mut data = Vec::with_capacity(8 * WORD);
        data.extend_from_slice(&word_from_address(&event.sender));
        data.extend_from_slice(&word_from_address(&event.recipient));
        data.extend_from_slice(&word_from_address(&event.token));
        data.extend_from_slice(&word_from_u64(event.amount));
        data.extend_from_slice(&event.hashlocks.user);
        data.extend_from_slice(&event.hashlocks.lp1);
        data.extend_from_slice(&event.hashlocks.lp2);
        data.extend_from_slice(&word_from_u64(event.timelock));
        data
    }

    /// Encode the `HTLCClaimed` data section, inverse of `decode_claimed`.
    fn encode_claimed_data(secrets: &[[u8; 32]; 3]) -> Vec<u8> {
        let mut data = Vec::with_capacity(3 * WORD);
        data.extend_from_slice(&secrets[0]);
        data.extend_from_slice(&secrets[1]);
        data.extend_from_slice(&secrets[2]);
        data
    }

    fn triple() -> HashlockTriple {
        HashlockTriple {
            user: sha256(b"u"),
            lp1: sha256(b"1"),
            lp2: sha256(b"2"),
        }
    }

    #[test]
    fn create_round_trip() {
        let params = EvmCreateParams {
            recipient: [0xaa; 20],
            token: [0xbb; 20],
            amount: 597_200,
            hashlocks: triple(),
            timelock: 1_700_003_600,
        };
        let calldata = encode_create(&params);
        assert_eq!(calldata.len(), 4 + 7 * 32);
        assert_eq!(decode_create(&calldata).unwrap(), params);
    }

    #[test]
    fn decode_rejects_wrong_selector() {
        let mut calldata = encode_create(&EvmCreateParams {
            recipient: [0; 20],
            token: [0; 20],
            amount: 1,
            hashlocks: triple(),
            timelock: 1,
        });
        calldata[0] ^= 0xff;
        assert!(decode_create(&calldata).is_err());
    }

    #[test]
    fn claimed_event_round_trip() {
        let secrets = [[0x11; 32], [0x22; 32], [0x33; 32]];
        let id = [0xc1; 32];
        let topics = vec![topic_claimed(), id];
        let data = encode_claimed_data(&secrets);
        let (decoded_id, decoded) = decode_claimed(&topics, &data).unwrap();
        assert_eq!(decoded_id, id);
        assert_eq!(decoded, secrets);
    }

    #[test]
    fn created_event_round_trip() {
        let event = CreatedEvent {
            id: [0xc1; 32],
            sender: [0x01; 20],
            recipient: [0x02; 20],
            token: [0x03; 20],
            amount: 42,
            hashlocks: triple(),
            timelock: 99,
        };
        let topics = vec![topic_created(), event.id];
        let data = encode_created_data(&event);
        assert_eq!(decode_created(&topics, &data).unwrap(), event);
    }

    #[test]
    fn address_parse_round_trip() {
        let addr = parse_address("0x00112233445566778899aabbccddeeff00112233").unwrap();
        assert_eq!(format_address(&addr), "0x00112233445566778899aabbccddeeff00112233");
    }

    proptest! {
        #[test]
        fn create_round_trip_prop(amount in any::<u64>(), timelock in any::<u64>(),
                                  recipient in any::<[u8; 20]>(), token in any::<[u8; 20]>()) {
            let params = EvmCreateParams {
                recipient,
                token,
                amount,
                hashlocks: triple(),
                timelock,
            };
            prop_assert_eq!(decode_create(&encode_create(&params)).unwrap(), params);
        }
    }
}
