//! Key material for the LP's claim and refund branches.
//!
//! One hex-encoded 32-byte secp256k1 key per UTXO chain, read from the key
//! directory at startup. The directory must be `700` and each key file
//! `600`; anything looser is a startup failure. EVM signing is delegated to
//! the connected node, so no EVM key lives here.

use std::fs;
use std::path::{Path, PathBuf};

use secp256k1::{PublicKey, Secp256k1, SecretKey};

use crate::error::KeyError;
use crate::types::ChainId;

pub struct KeyStore {
    btc: SecretKey,
    m1: SecretKey,
}

fn check_mode(path: &Path, allowed: u32, label: &str) -> Result<(), KeyError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let mode = fs::metadata(path)
            .map_err(|_| KeyError::Missing(label.to_string()))?
            .mode()
            & 0o777;
        if mode & !allowed != 0 {
            return Err(KeyError::Permissions {
                chain: label.to_string(),
                mode,
            });
        }
    }
    #[cfg(not(unix))]
    let _ = (path, allowed, label);
    Ok(())
}

fn load_key(dir: &Path, name: &str) -> Result<SecretKey, KeyError> {
    let path: PathBuf = dir.join(format!("{name}.key"));
    check_mode(&path, 0o600, name)?;
    let raw = fs::read_to_string(&path).map_err(|_| KeyError::Missing(name.to_string()))?;
    let bytes = hex::decode(raw.trim()).map_err(|e| KeyError::Invalid(e.to_string()))?;
    SecretKey::from_slice(&bytes).map_err(|e| KeyError::Invalid(e.to_string()))
}

impl KeyStore {
    pub fn load(dir: &Path) -> Result<Self, KeyError> {
        check_mode(dir, 0o700, "key directory")?;
        Ok(KeyStore {
            btc: load_key(dir, "btc")?,
            m1: load_key(dir, "m1")?,
        })
    }

    /// Build a store from raw keys; used by tests and recovery tooling.
    pub fn from_keys(btc: SecretKey, m1: SecretKey) -> Self {
        KeyStore { btc, m1 }
    }

    pub fn secret(&self, chain: ChainId) -> Result<&SecretKey, KeyError> {
        match chain {
            ChainId::Btc => Ok(&self.btc),
            ChainId::M1 => Ok(&self.m1),
            ChainId::Evm => Err(KeyError::Missing("evm keys live in the node signer".into())),
        }
    }

    pub fn public(&self, chain: ChainId) -> Result<PublicKey, KeyError> {
        let secp = Secp256k1::new();
        Ok(PublicKey::from_secret_key(&secp, self.secret(chain)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn write_key(dir: &Path, name: &str, mode: u32) {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(format!("{name}.key"));
        fs::write(&path, hex::encode([7u8; 32])).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn loads_keys_with_tight_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700)).unwrap();
        write_key(dir.path(), "btc", 0o600);
        write_key(dir.path(), "m1", 0o600);
        let keys = KeyStore::load(dir.path()).unwrap();
        assert!(keys.public(ChainId::Btc).is_ok());
        assert!(keys.public(ChainId::Evm).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn rejects_world_readable_key() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700)).unwrap();
        write_key(dir.path(), "btc", 0o644);
        write_key(dir.path(), "m1", 0o600);
        assert!(matches!(
            KeyStore::load(dir.path()),
            Err(KeyError::Permissions { .. })
        ));
    }
}
