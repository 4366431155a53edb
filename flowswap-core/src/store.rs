//! Durable swap store.
//!
//! One JSON snapshot per LP: `{lp_id, version, swaps}`. Every state
//! transition flushes the whole document under the global store mutex with
//! write-temp + fsync + rename. Terminal swaps past the grace period rotate
//! into an archive file with the same schema.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::types::{Swap, SwapState};

/// Snapshot schema version written by this build.
pub const STORE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    lp_id: String,
    version: u32,
    swaps: HashMap<String, Swap>,
}

struct StoreInner {
    swaps: HashMap<String, Swap>,
}

pub struct SwapStore {
    path: PathBuf,
    lp_id: String,
    inner: Mutex<StoreInner>,
}

impl SwapStore {
    /// Load the snapshot at `path`, or start empty if the file does not
    /// exist yet.
    pub fn load(path: impl Into<PathBuf>, lp_id: impl Into<String>) -> Result<Self, StoreError> {
        let path = path.into();
        let lp_id = lp_id.into();
        let swaps = match fs::read(&path) {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
                if snapshot.version > STORE_VERSION {
                    return Err(StoreError::VersionMismatch {
                        found: snapshot.version,
                        supported: STORE_VERSION,
                    });
                }
                info!(
                    path = %path.display(),
                    swaps = snapshot.swaps.len(),
                    "loaded swap store"
                );
                snapshot.swaps
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "starting with empty swap store");
                HashMap::new()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(SwapStore {
            path,
            lp_id,
            inner: Mutex::new(StoreInner { swaps }),
        })
    }

    fn write_snapshot(
        path: &Path,
        lp_id: &str,
        swaps: &HashMap<String, Swap>,
    ) -> Result<(), StoreError> {
        let snapshot = Snapshot {
            lp_id: lp_id.to_string(),
            version: STORE_VERSION,
            swaps: swaps.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Insert or replace a swap and flush the snapshot.
    pub async fn upsert(&self, swap: Swap) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.swaps.insert(swap.swap_id.clone(), swap);
        Self::write_snapshot(&self.path, &self.lp_id, &inner.swaps)
    }

    pub async fn get(&self, swap_id: &str) -> Option<Swap> {
        self.inner.lock().await.swaps.get(swap_id).cloned()
    }

    pub async fn contains(&self, swap_id: &str) -> bool {
        self.inner.lock().await.swaps.contains_key(swap_id)
    }

    /// All swaps, optionally filtered by state, newest first.
    pub async fn list(&self, state: Option<SwapState>, limit: usize) -> Vec<Swap> {
        let inner = self.inner.lock().await;
        let mut swaps: Vec<Swap> = inner
            .swaps
            .values()
            .filter(|s| state.map_or(true, |wanted| s.state == wanted))
            .cloned()
            .collect();
        swaps.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        swaps.truncate(limit);
        swaps
    }

    /// Non-terminal swaps for the startup resume scan.
    pub async fn non_terminal(&self) -> Vec<Swap> {
        self.inner
            .lock()
            .await
            .swaps
            .values()
            .filter(|s| !s.state.is_terminal())
            .cloned()
            .collect()
    }

    /// Move terminal swaps older than `max_age_secs` into the archive file.
    /// Returns the number of swaps archived.
    pub async fn archive_terminal(
        &self,
        now: u64,
        max_age_secs: u64,
    ) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        let expired: Vec<String> = inner
            .swaps
            .values()
            .filter(|s| {
                s.state.is_terminal()
                    && s.terminal_at
                        .map_or(false, |t| now.saturating_sub(t) >= max_age_secs)
            })
            .map(|s| s.swap_id.clone())
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        let archive_path = self.path.with_extension("archive.json");
        let mut archived: HashMap<String, Swap> = match fs::read(&archive_path) {
            Ok(bytes) => serde_json::from_slice::<Snapshot>(&bytes)
                .map(|s| s.swaps)
                .unwrap_or_else(|e| {
                    warn!(error = %e, "archive file unreadable, starting fresh");
                    HashMap::new()
                }),
            Err(_) => HashMap::new(),
        };
        for swap_id in &expired {
            if let Some(swap) = inner.swaps.remove(swap_id) {
                archived.insert(swap_id.clone(), swap);
            }
        }
        Self::write_snapshot(&archive_path, &self.lp_id, &archived)?;
        Self::write_snapshot(&self.path, &self.lp_id, &inner.swaps)?;
        info!(count = expired.len(), "archived terminal swaps");
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{sha256, HashlockTriple, SecretSet};
    use crate::types::*;

    fn sample_swap(id: &str, state: SwapState, created_at: u64) -> Swap {
        Swap {
            swap_id: id.to_string(),
            direction: Direction::Forward,
            routing: RoutingMode::SingleLp,
            from_asset: Asset::Btc,
            to_asset: Asset::Usdc,
            from_amount: 100_000,
            to_amount: 597_200,
            quote: QuoteTerms {
                rate_num: 6,
                rate_den: 1,
                spread_bps: 30,
                protocol_fee: 0,
            },
            hashlocks: HashlockTriple {
                user: sha256(b"u"),
                lp1: sha256(b"1"),
                lp2: sha256(b"2"),
            },
            secrets: SecretSet::default(),
            btc_leg: None,
            m1_leg: None,
            evm_leg: None,
            state,
            resume_state: None,
            timeline: vec![],
            user_refund_address: "bcrt1q".into(),
            user_payout_address: "0x00".into(),
            user_btc_pubkey: String::new(),
            peer_m1_pubkey: None,
            m1_notified: false,
            secrets_notified: false,
            created_at,
            updated_at: created_at,
            terminal_at: state.is_terminal().then_some(created_at),
            reservations: vec![],
            seen_events: vec![],
        }
    }

    #[tokio::test]
    async fn snapshot_round_trip_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        let store = SwapStore::load(&path, "lp-test").unwrap();
        store
            .upsert(sample_swap("fs_01", SwapState::AwaitingBtc, 100))
            .await
            .unwrap();
        store
            .upsert(sample_swap("fs_02", SwapState::Completed, 200))
            .await
            .unwrap();

        let first = fs::read(&path).unwrap();
        drop(store);

        // Reload and rewrite without changes.
        let store = SwapStore::load(&path, "lp-test").unwrap();
        let swap = store.get("fs_01").await.unwrap();
        store.upsert(swap).await.unwrap();
        let second = fs::read(&path).unwrap();

        let a: serde_json::Value = serde_json::from_slice(&first).unwrap();
        let b: serde_json::Value = serde_json::from_slice(&second).unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn list_filters_and_orders() {
        let dir = tempfile::tempdir().unwrap();
        let store = SwapStore::load(dir.path().join("db.json"), "lp").unwrap();
        store
            .upsert(sample_swap("fs_a", SwapState::AwaitingBtc, 1))
            .await
            .unwrap();
        store
            .upsert(sample_swap("fs_b", SwapState::AwaitingBtc, 2))
            .await
            .unwrap();
        store
            .upsert(sample_swap("fs_c", SwapState::Completed, 3))
            .await
            .unwrap();

        let awaiting = store.list(Some(SwapState::AwaitingBtc), 10).await;
        assert_eq!(awaiting.len(), 2);
        assert_eq!(awaiting[0].swap_id, "fs_b");

        let limited = store.list(None, 1).await;
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].swap_id, "fs_c");
    }

    #[tokio::test]
    async fn archives_only_aged_terminal_swaps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        let store = SwapStore::load(&path, "lp").unwrap();
        store
            .upsert(sample_swap("fs_live", SwapState::M1Locked, 100))
            .await
            .unwrap();
        store
            .upsert(sample_swap("fs_old", SwapState::Completed, 100))
            .await
            .unwrap();
        store
            .upsert(sample_swap("fs_new", SwapState::Completed, 9_000))
            .await
            .unwrap();

        let archived = store.archive_terminal(10_000, 3_600).await.unwrap();
        assert_eq!(archived, 1);
        assert!(store.get("fs_old").await.is_none());
        assert!(store.get("fs_new").await.is_some());
        assert!(store.get("fs_live").await.is_some());

        let archive: serde_json::Value =
            serde_json::from_slice(&fs::read(path.with_extension("archive.json")).unwrap())
                .unwrap();
        assert!(archive["swaps"]["fs_old"].is_object());
        assert_eq!(archive["version"], 1);
    }

    #[tokio::test]
    async fn rejects_future_snapshot_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        fs::write(
            &path,
            serde_json::json!({"lp_id": "lp", "version": 99, "swaps": {}}).to_string(),
        )
        .unwrap();
        assert!(matches!(
            SwapStore::load(&path, "lp"),
            Err(StoreError::VersionMismatch { found: 99, .. })
        ));
    }
}
