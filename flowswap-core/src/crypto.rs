//! Hashlock and preimage primitives for the three-secret scheme.
//!
//! Every hashlock in the protocol is a single SHA-256 over a 32-byte
//! preimage. The same construction is used on all three chains so that one
//! claim reveals preimages usable everywhere.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::EngineError;

/// Serde helpers for fixed 32-byte values rendered as hex in JSON.
pub mod hex32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let raw = String::deserialize(d)?;
        let bytes = hex::decode(&raw).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

/// Same as [`hex32`] but for optional values.
pub mod hex32_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<[u8; 32]>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(v) => s.serialize_some(&hex::encode(v)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<[u8; 32]>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        match raw {
            None => Ok(None),
            Some(raw) => {
                let bytes = hex::decode(&raw).map_err(serde::de::Error::custom)?;
                let arr: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| serde::de::Error::custom("expected 32 bytes"))?;
                Ok(Some(arr))
            }
        }
    }
}

/// Compute SHA-256 of arbitrary data.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&Sha256::digest(data));
    hash
}

/// Generate a cryptographically secure 32-byte preimage.
pub fn generate_preimage() -> [u8; 32] {
    let mut rng = rand::rngs::OsRng;
    let mut bytes = [0u8; 32];
    rng.fill_bytes(&mut bytes);
    bytes
}

/// Which of the three secrets a preimage corresponds to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecretSlot {
    User,
    Lp1,
    Lp2,
}

/// The three hashlocks of a swap: user-supplied plus the two minted by the
/// LP. All must be pairwise distinct.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashlockTriple {
    #[serde(with = "hex32")]
    pub user: [u8; 32],
    #[serde(with = "hex32")]
    pub lp1: [u8; 32],
    #[serde(with = "hex32")]
    pub lp2: [u8; 32],
}

impl HashlockTriple {
    /// Mint the LP-side hashlocks for a user-supplied `h_user`. Returns the
    /// triple together with the two fresh LP preimages. The preimages must
    /// not be persisted until the HTLC publishing them has confirmed.
    pub fn mint(h_user: [u8; 32]) -> Result<(Self, [u8; 32], [u8; 32]), EngineError> {
        let s_lp1 = generate_preimage();
        let s_lp2 = generate_preimage();
        let triple = HashlockTriple {
            user: h_user,
            lp1: sha256(&s_lp1),
            lp2: sha256(&s_lp2),
        };
        triple.validate()?;
        Ok((triple, s_lp1, s_lp2))
    }

    /// All three hashlocks present and pairwise distinct.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.user == self.lp1 || self.user == self.lp2 || self.lp1 == self.lp2 {
            return Err(EngineError::InvariantViolation(
                "hashlocks must be pairwise distinct".into(),
            ));
        }
        Ok(())
    }

    /// The hashlocks in protocol declaration order (user, lp1, lp2).
    pub fn ordered(&self) -> [[u8; 32]; 3] {
        [self.user, self.lp1, self.lp2]
    }

    /// Match a candidate preimage against the triple by hashing.
    pub fn classify(&self, preimage: &[u8; 32]) -> Option<SecretSlot> {
        let h = sha256(preimage);
        if h == self.user {
            Some(SecretSlot::User)
        } else if h == self.lp1 {
            Some(SecretSlot::Lp1)
        } else if h == self.lp2 {
            Some(SecretSlot::Lp2)
        } else {
            None
        }
    }

    /// Verify a preimage against the hashlock in a given slot.
    pub fn verify(&self, slot: SecretSlot, preimage: &[u8; 32]) -> bool {
        let expected = match slot {
            SecretSlot::User => self.user,
            SecretSlot::Lp1 => self.lp1,
            SecretSlot::Lp2 => self.lp2,
        };
        sha256(preimage) == expected
    }
}

/// Revealed preimages, filled in as chain events surface them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretSet {
    #[serde(with = "hex32_opt", default)]
    pub user: Option<[u8; 32]>,
    #[serde(with = "hex32_opt", default)]
    pub lp1: Option<[u8; 32]>,
    #[serde(with = "hex32_opt", default)]
    pub lp2: Option<[u8; 32]>,
}

impl SecretSet {
    pub fn record(&mut self, slot: SecretSlot, preimage: [u8; 32]) {
        match slot {
            SecretSlot::User => self.user = Some(preimage),
            SecretSlot::Lp1 => self.lp1 = Some(preimage),
            SecretSlot::Lp2 => self.lp2 = Some(preimage),
        }
    }

    pub fn all_known(&self) -> bool {
        self.user.is_some() && self.lp1.is_some() && self.lp2.is_some()
    }

    /// The full triple in declaration order, if every secret is known.
    pub fn as_array(&self) -> Option<[[u8; 32]; 3]> {
        Some([self.user?, self.lp1?, self.lp2?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn mint_produces_distinct_hashlocks() {
        let h_user = sha256(b"user secret");
        let (triple, s_lp1, s_lp2) = HashlockTriple::mint(h_user).unwrap();
        triple.validate().unwrap();
        assert!(triple.verify(SecretSlot::Lp1, &s_lp1));
        assert!(triple.verify(SecretSlot::Lp2, &s_lp2));
        assert!(!triple.verify(SecretSlot::Lp1, &s_lp2));
    }

    #[test]
    fn duplicate_hashlocks_rejected() {
        let h = sha256(b"x");
        let triple = HashlockTriple {
            user: h,
            lp1: h,
            lp2: sha256(b"y"),
        };
        assert!(triple.validate().is_err());
    }

    #[test]
    fn secret_set_completes() {
        let mut secrets = SecretSet::default();
        assert!(!secrets.all_known());
        secrets.record(SecretSlot::User, [1u8; 32]);
        secrets.record(SecretSlot::Lp1, [2u8; 32]);
        secrets.record(SecretSlot::Lp2, [3u8; 32]);
        assert!(secrets.all_known());
        assert_eq!(
            secrets.as_array().unwrap(),
            [[1u8; 32], [2u8; 32], [3u8; 32]]
        );
    }

    proptest! {
        #[test]
        fn classify_roundtrip(s_user in any::<[u8; 32]>(),
                              s_lp1 in any::<[u8; 32]>(),
                              s_lp2 in any::<[u8; 32]>()) {
            let triple = HashlockTriple {
                user: sha256(&s_user),
                lp1: sha256(&s_lp1),
                lp2: sha256(&s_lp2),
            };
            prop_assume!(triple.validate().is_ok());
            prop_assert_eq!(triple.classify(&s_user), Some(SecretSlot::User));
            prop_assert_eq!(triple.classify(&s_lp1), Some(SecretSlot::Lp1));
            prop_assert_eq!(triple.classify(&s_lp2), Some(SecretSlot::Lp2));
        }

        #[test]
        fn hex32_serde_roundtrip(v in any::<[u8; 32]>()) {
            #[derive(serde::Serialize, serde::Deserialize)]
            struct Wrap(#[serde(with = "hex32")] [u8; 32]);
            let json = serde_json::to_string(&Wrap(v)).unwrap();
            let back: Wrap = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(back.0, v);
        }
    }
}
