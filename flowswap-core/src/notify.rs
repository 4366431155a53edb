//! Outbound notifications to the peer LP in per-leg mode.
//!
//! Two webhooks: the M1-locked descriptor after LP_IN's M1 HTLC confirms,
//! and the preimage hand-back after the downstream claim. Retries use
//! exponential backoff capped at 60 s; once the budget is exhausted the
//! engine parks the swap `peer_unreachable` and on-chain events remain
//! authoritative.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::NotifyConfig;
use crate::crypto::hex32;
use crate::error::NotifyError;

/// Body of `POST /api/flowswap/{id}/m1-locked`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct M1LockedNotification {
    pub outpoint: String,
    pub amount_sats: u64,
    pub expiry_height: u64,
}

/// Body of `POST /api/flowswap/{id}/btc-claimed`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BtcClaimedNotification {
    pub claim_txid: String,
    #[serde(with = "hex32")]
    pub s_user: [u8; 32],
    #[serde(with = "hex32")]
    pub s_lp1: [u8; 32],
    #[serde(with = "hex32")]
    pub s_lp2: [u8; 32],
}

pub struct PeerNotifier {
    http: reqwest::Client,
    config: NotifyConfig,
}

impl PeerNotifier {
    pub fn new(config: NotifyConfig) -> Self {
        PeerNotifier {
            http: reqwest::Client::new(),
            config,
        }
    }

    async fn post_with_retry<T: Serialize>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<(), NotifyError> {
        let mut delay = Duration::from_secs(self.config.base_delay_secs.max(1));
        let cap = Duration::from_secs(self.config.max_delay_secs);
        for attempt in 1..=self.config.max_attempts {
            match self.http.post(url).json(body).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(url, attempt, "peer notification delivered");
                    return Ok(());
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    // 4xx means the peer understood and refused; retrying
                    // the same payload cannot succeed.
                    if status >= 400 && status < 500 {
                        return Err(NotifyError::Rejected(status));
                    }
                    warn!(url, attempt, status, "peer notification failed");
                }
                Err(e) => {
                    warn!(url, attempt, error = %e, "peer notification failed");
                }
            }
            if attempt < self.config.max_attempts {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(cap);
            }
        }
        Err(NotifyError::Exhausted {
            attempts: self.config.max_attempts,
        })
    }

    /// Tell the peer LP_OUT that our M1 HTLC for `swap_id` has confirmed.
    pub async fn m1_locked(
        &self,
        peer_url: &str,
        swap_id: &str,
        body: &M1LockedNotification,
    ) -> Result<(), NotifyError> {
        let url = format!("{}/api/flowswap/{}/m1-locked", peer_url.trim_end_matches('/'), swap_id);
        self.post_with_retry(&url, body).await
    }

    /// Hand the revealed preimages back to the peer LP_IN.
    pub async fn btc_claimed(
        &self,
        peer_url: &str,
        swap_id: &str,
        body: &BtcClaimedNotification,
    ) -> Result<(), NotifyError> {
        let url = format!(
            "{}/api/flowswap/{}/btc-claimed",
            peer_url.trim_end_matches('/'),
            swap_id
        );
        self.post_with_retry(&url, body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exhausts_retry_budget_against_dead_peer() {
        let notifier = PeerNotifier::new(NotifyConfig {
            base_delay_secs: 1,
            max_delay_secs: 1,
            max_attempts: 2,
        });
        tokio::time::pause();
        let notification = M1LockedNotification {
            outpoint: format!("{}:0", "ab".repeat(32)),
            amount_sats: 100_000,
            expiry_height: 1_000,
        };
        let call = notifier.m1_locked(
            // Nothing listens on port 1; connections are refused at once.
            "http://127.0.0.1:1",
            "fs_test",
            &notification,
        );
        let result = tokio::time::timeout(Duration::from_secs(600), call).await;
        match result {
            Ok(Err(NotifyError::Exhausted { attempts: 2 })) => {}
            other => panic!("expected exhausted budget, got {other:?}"),
        }
    }

    #[test]
    fn notification_bodies_serialize_as_hex() {
        let body = BtcClaimedNotification {
            claim_txid: "ab".repeat(32),
            s_user: [0x11; 32],
            s_lp1: [0x22; 32],
            s_lp2: [0x33; 32],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["s_user"], "11".repeat(32));
    }
}
