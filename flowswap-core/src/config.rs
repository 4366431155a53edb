//! LP node configuration.
//!
//! Read-only to the engine at transition time; the node loads it once at
//! startup (TOML file plus environment overrides) and hands it out behind
//! an `Arc`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Asset;

#[derive(Debug, Error)]
pub enum ConfigValidationError {
    #[error("invalid pair {from}->{to}: {reason}")]
    InvalidPair {
        from: Asset,
        to: Asset,
        reason: String,
    },

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("missing required field: {0}")]
    MissingField(String),
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LpConfig {
    pub identity: IdentityConfig,
    pub pairs: Vec<PairConfig>,
    pub confirmations: ConfirmationConfig,
    pub timelocks: TimelockConfig,
    pub watcher: WatcherConfig,
    pub store: StoreConfig,
    pub inventory: InventoryConfig,
    pub notify: NotifyConfig,
    pub rpc: RpcConfig,
    pub engine: EngineConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub lp_id: String,
    pub lp_name: String,
    pub key_dir: PathBuf,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        IdentityConfig {
            lp_id: "lp-dev".to_string(),
            lp_name: "flowswap-dev".to_string(),
            key_dir: PathBuf::from("keys"),
        }
    }
}

/// One tradeable pair with its spread and size bounds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PairConfig {
    pub from: Asset,
    pub to: Asset,
    pub enabled: bool,
    pub bid_spread_bps: u32,
    pub ask_spread_bps: u32,
    pub min_amount: u64,
    pub max_amount: u64,
}

/// BTC confirmation tiers by deposit size, plus fixed policies for the
/// other chains (M1 one confirmation, EVM events at >=1 block depth).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationConfig {
    pub btc_tiers: Vec<ConfirmationTier>,
    pub m1_confirmations: u32,
    pub evm_min_depth: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfirmationTier {
    /// Tier applies to amounts up to and including this many sats.
    pub max_amount_sats: u64,
    pub confirmations: u32,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        ConfirmationConfig {
            btc_tiers: vec![
                ConfirmationTier {
                    max_amount_sats: 1_000_000,
                    confirmations: 1,
                },
                ConfirmationTier {
                    max_amount_sats: 10_000_000,
                    confirmations: 2,
                },
                ConfirmationTier {
                    max_amount_sats: 50_000_000,
                    confirmations: 3,
                },
            ],
            m1_confirmations: 1,
            evm_min_depth: 1,
        }
    }
}

impl ConfirmationConfig {
    /// Required BTC confirmations for a deposit of `amount_sats`. Amounts
    /// beyond the last tier require six confirmations.
    pub fn btc_confirmations_for(&self, amount_sats: u64) -> u32 {
        for tier in &self.btc_tiers {
            if amount_sats <= tier.max_amount_sats {
                return tier.confirmations;
            }
        }
        6
    }
}

/// Safety margins between adjacent legs' timelocks, per chain and in that
/// chain's native unit (blocks for BTC/M1, seconds for EVM).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelockConfig {
    pub btc_margin_blocks: u64,
    pub m1_margin_blocks: u64,
    pub evm_margin_secs: u64,
    /// Assumed block intervals, used only to compare timelocks across
    /// heterogeneous chains when validating the safety order.
    pub btc_block_secs: u64,
    pub m1_block_secs: u64,
}

impl Default for TimelockConfig {
    fn default() -> Self {
        TimelockConfig {
            btc_margin_blocks: 144,
            m1_margin_blocks: 144,
            evm_margin_secs: 3600,
            btc_block_secs: 600,
            m1_block_secs: 60,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub btc_poll_secs: u64,
    pub m1_poll_secs: u64,
    pub evm_poll_secs: u64,
    pub btc_reorg_depth: u64,
    pub m1_reorg_depth: u64,
    pub evm_reorg_depth: u64,
    /// Poll interval while a chain is marked degraded.
    pub degraded_poll_secs: u64,
    pub rpc_timeout_secs: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        WatcherConfig {
            btc_poll_secs: 10,
            m1_poll_secs: 10,
            evm_poll_secs: 5,
            btc_reorg_depth: 12,
            m1_reorg_depth: 24,
            evm_reorg_depth: 32,
            degraded_poll_secs: 60,
            rpc_timeout_secs: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    pub archive_grace_hours: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            db_path: PathBuf::from("flowswap-db.json"),
            archive_grace_hours: 24,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    pub refresh_secs: u64,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        InventoryConfig { refresh_secs: 60 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub max_attempts: u32,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        NotifyConfig {
            base_delay_secs: 1,
            max_delay_secs: 60,
            max_attempts: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub btc_rpc_url: String,
    pub btc_rpc_user: Option<String>,
    pub btc_rpc_pass: Option<String>,
    pub btc_network: String,
    pub m1_rpc_url: String,
    pub evm_rpc_url: String,
    /// Address of the deployed three-hashlock HTLC contract.
    pub evm_htlc_contract: String,
    /// ERC-20 token the EVM leg holds (USDC).
    pub usdc_token: String,
    /// LP account on the EVM chain; the connected signer owns its key.
    pub evm_lp_address: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig {
            btc_rpc_url: "http://127.0.0.1:18443".to_string(),
            btc_rpc_user: None,
            btc_rpc_pass: None,
            btc_network: "regtest".to_string(),
            m1_rpc_url: "http://127.0.0.1:28443".to_string(),
            evm_rpc_url: "http://127.0.0.1:8545".to_string(),
            evm_htlc_contract: String::new(),
            usdc_token: String::new(),
            evm_lp_address: String::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub auto_claim: bool,
    pub auto_refund: bool,
    pub rate_refresh_secs: u64,
    pub shutdown_drain_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            auto_claim: true,
            auto_refund: true,
            rate_refresh_secs: 30,
            shutdown_drain_secs: 30,
        }
    }
}

impl LpConfig {
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.identity.lp_id.is_empty() {
            return Err(ConfigValidationError::MissingField("identity.lp_id".into()));
        }
        for pair in &self.pairs {
            if pair.from == pair.to {
                return Err(ConfigValidationError::InvalidPair {
                    from: pair.from,
                    to: pair.to,
                    reason: "identical assets".into(),
                });
            }
            if pair.bid_spread_bps >= 10_000 || pair.ask_spread_bps >= 10_000 {
                return Err(ConfigValidationError::InvalidPair {
                    from: pair.from,
                    to: pair.to,
                    reason: "spread must be below 10000 bps".into(),
                });
            }
            if pair.min_amount > pair.max_amount {
                return Err(ConfigValidationError::InvalidPair {
                    from: pair.from,
                    to: pair.to,
                    reason: "min above max".into(),
                });
            }
        }
        if self.confirmations.btc_tiers.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "confirmations.btc_tiers".into(),
            ));
        }
        let mut prev = 0u64;
        for tier in &self.confirmations.btc_tiers {
            if tier.max_amount_sats <= prev {
                return Err(ConfigValidationError::InvalidValue(
                    "confirmation tiers must be strictly increasing".into(),
                ));
            }
            prev = tier.max_amount_sats;
        }
        if self.timelocks.btc_margin_blocks == 0
            || self.timelocks.m1_margin_blocks == 0
            || self.timelocks.evm_margin_secs == 0
        {
            return Err(ConfigValidationError::InvalidValue(
                "timelock margins must be positive".into(),
            ));
        }
        if self.timelocks.btc_block_secs == 0 || self.timelocks.m1_block_secs == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "block intervals must be positive".into(),
            ));
        }
        if self.store.db_path.as_os_str().is_empty() {
            return Err(ConfigValidationError::InvalidPath("store.db_path".into()));
        }
        if self.notify.max_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "notify.max_attempts must be positive".into(),
            ));
        }
        Ok(())
    }

    /// The pair entry for a from/to combination, if enabled.
    pub fn pair(&self, from: Asset, to: Asset) -> Option<&PairConfig> {
        self.pairs
            .iter()
            .find(|p| p.from == from && p.to == to && p.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_pair() -> LpConfig {
        LpConfig {
            pairs: vec![PairConfig {
                from: Asset::Btc,
                to: Asset::Usdc,
                enabled: true,
                bid_spread_bps: 30,
                ask_spread_bps: 30,
                min_amount: 10_000,
                max_amount: 100_000_000,
            }],
            ..LpConfig::default()
        }
    }

    #[test]
    fn default_config_validates() {
        LpConfig::default().validate().unwrap();
    }

    #[test]
    fn tier_lookup() {
        let conf = ConfirmationConfig::default();
        assert_eq!(conf.btc_confirmations_for(500_000), 1);
        assert_eq!(conf.btc_confirmations_for(1_000_000), 1);
        assert_eq!(conf.btc_confirmations_for(5_000_000), 2);
        assert_eq!(conf.btc_confirmations_for(20_000_000), 3);
        assert_eq!(conf.btc_confirmations_for(60_000_000), 6);
    }

    #[test]
    fn rejects_inverted_pair_bounds() {
        let mut config = config_with_pair();
        config.pairs[0].min_amount = 2;
        config.pairs[0].max_amount = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unsorted_tiers() {
        let mut config = config_with_pair();
        config.confirmations.btc_tiers = vec![
            ConfirmationTier {
                max_amount_sats: 10,
                confirmations: 1,
            },
            ConfirmationTier {
                max_amount_sats: 10,
                confirmations: 2,
            },
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn disabled_pair_not_found() {
        let mut config = config_with_pair();
        config.pairs[0].enabled = false;
        assert!(config.pair(Asset::Btc, Asset::Usdc).is_none());
    }
}
