//! The swap engine: sole mutator of swap state.
//!
//! Events for a given swap are serialized through a per-swap queue and
//! lock; different swaps proceed in parallel. Chain RPC and peer HTTP are
//! never issued while a per-swap lock is held: handlers read the swap,
//! decide an intended action and release the lock; the action runs against
//! the chain; the commit re-acquires the lock and re-validates that the
//! swap still expects the action before applying the transition.
//!
//! Lock order when several are needed: store -> chain -> swap.

pub mod events;
pub mod timelock;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitcoin::Network;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::chain::{EvmChain, UtxoChain};
use crate::config::LpConfig;
use crate::crypto::{sha256, HashlockTriple, SecretSet};
use crate::error::EngineError;
use crate::htlc::{btc_script, evm_abi, m1_script};
use crate::inventory::Inventory;
use crate::keys::KeyStore;
use crate::notify::{BtcClaimedNotification, M1LockedNotification, PeerNotifier};
use crate::store::SwapStore;
use crate::types::*;
use crate::watcher::{WatchRegistry, WatchTarget};
use events::{EngineEvent, WatcherEvent};
use timelock::TimelockPlan;

/// The three chain clients the engine commands.
#[derive(Clone)]
pub struct ChainSet {
    pub btc: Arc<dyn UtxoChain>,
    pub m1: Arc<dyn UtxoChain>,
    pub evm: Arc<dyn EvmChain>,
}

/// Request to create a swap. For per-leg routing the peer-minted hashlocks
/// arrive in the request; this LP mints only the one its role owns.
#[derive(Clone, Debug)]
pub struct InitSwapRequest {
    pub direction: Direction,
    pub routing: RoutingMode,
    pub from_amount: u64,
    pub quote: QuoteTerms,
    pub h_user: [u8; 32],
    pub h_lp1: Option<[u8; 32]>,
    pub h_lp2: Option<[u8; 32]>,
    pub user_refund_address: String,
    pub user_payout_address: String,
    pub user_btc_pubkey: String,
    pub peer_m1_pubkey: Option<String>,
}

/// On-chain or outbound action decided under the swap lock and executed
/// outside it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Action {
    LockM1,
    LockEvm,
    LockBtcForUser,
    SweepM1,
    SweepBtc,
    SweepEvm,
    RefundLeg(ChainId),
    NotifyM1Locked,
    NotifySecrets,
}

impl Action {
    fn name(&self) -> &'static str {
        match self {
            Action::LockM1 => "lock_m1",
            Action::LockEvm => "lock_evm",
            Action::LockBtcForUser => "lock_btc",
            Action::SweepM1 => "sweep_m1",
            Action::SweepBtc => "sweep_btc",
            Action::SweepEvm => "sweep_evm",
            Action::RefundLeg(_) => "refund",
            Action::NotifyM1Locked => "notify_m1_locked",
            Action::NotifySecrets => "notify_secrets",
        }
    }
}

/// LP-minted preimages held in memory until the HTLC that makes them
/// claimable has confirmed; only then do they reach the persisted record.
#[derive(Clone, Copy, Debug, Default)]
struct MintedSecrets {
    lp1: Option<[u8; 32]>,
    lp2: Option<[u8; 32]>,
}

pub struct SwapEngine {
    config: Arc<LpConfig>,
    store: Arc<SwapStore>,
    inventory: Arc<Inventory>,
    chains: ChainSet,
    keys: Arc<KeyStore>,
    registry: Arc<WatchRegistry>,
    notifier: Arc<PeerNotifier>,
    network: Network,
    swap_locks: DashMap<String, Arc<Mutex<()>>>,
    btc_wallet_lock: Mutex<()>,
    m1_wallet_lock: Mutex<()>,
    evm_wallet_lock: Mutex<()>,
    in_flight: DashMap<String, ()>,
    minted_secrets: DashMap<String, MintedSecrets>,
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl SwapEngine {
    pub fn new(
        config: Arc<LpConfig>,
        store: Arc<SwapStore>,
        inventory: Arc<Inventory>,
        chains: ChainSet,
        keys: Arc<KeyStore>,
        registry: Arc<WatchRegistry>,
        notifier: Arc<PeerNotifier>,
    ) -> Result<Self, EngineError> {
        let network = config
            .rpc
            .btc_network
            .parse::<Network>()
            .map_err(|e| EngineError::InvariantViolation(format!("bad btc network: {e}")))?;
        Ok(SwapEngine {
            config,
            store,
            inventory,
            chains,
            keys,
            registry,
            notifier,
            network,
            swap_locks: DashMap::new(),
            btc_wallet_lock: Mutex::new(()),
            m1_wallet_lock: Mutex::new(()),
            evm_wallet_lock: Mutex::new(()),
            in_flight: DashMap::new(),
            minted_secrets: DashMap::new(),
        })
    }

    fn swap_lock(&self, swap_id: &str) -> Arc<Mutex<()>> {
        self.swap_locks
            .entry(swap_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn wallet_lock(&self, chain: ChainId) -> &Mutex<()> {
        match chain {
            ChainId::Btc => &self.btc_wallet_lock,
            ChainId::M1 => &self.m1_wallet_lock,
            ChainId::Evm => &self.evm_wallet_lock,
        }
    }

    // ------------------------------------------------------------------
    // Swap creation
    // ------------------------------------------------------------------

    /// Create a swap: validate the pair and hashlocks, plan timelocks from
    /// current tips, derive the HTLC descriptors, reserve outbound
    /// inventory and persist in `awaiting_*`. No on-chain action happens
    /// here.
    pub async fn init_swap(&self, req: InitSwapRequest) -> Result<Swap, EngineError> {
        let (from_asset, to_asset) = match req.direction {
            Direction::Forward => (Asset::Btc, Asset::Usdc),
            Direction::Reverse => (Asset::Usdc, Asset::Btc),
        };
        let pair = self
            .config
            .pair(from_asset, to_asset)
            .ok_or_else(|| EngineError::StateConflict(format!("pair {from_asset}->{to_asset} disabled")))?;
        if req.from_amount < pair.min_amount || req.from_amount > pair.max_amount {
            return Err(EngineError::StateConflict(format!(
                "amount {} outside [{}, {}]",
                req.from_amount, pair.min_amount, pair.max_amount
            )));
        }
        let to_amount = req
            .quote
            .to_amount(req.from_amount)
            .ok_or_else(|| EngineError::InvariantViolation("quote arithmetic failed".into()))?;

        let (hashlocks, minted) = self.assemble_hashlocks(&req)?;

        // Tips are fetched before the swap exists; nothing is locked yet.
        let btc_tip = self
            .chains
            .btc
            .tip_height()
            .await
            .map_err(|e| EngineError::chain(ChainId::Btc, e))?;
        let m1_tip = self
            .chains
            .m1
            .tip_height()
            .await
            .map_err(|e| EngineError::chain(ChainId::M1, e))?;
        let now = unix_now();
        let plan = timelock::plan(&self.config.timelocks, req.direction, btc_tip, m1_tip, now);
        timelock::validate(&plan, req.direction, btc_tip, m1_tip, now, &self.config.timelocks)?;

        let swap_id = new_swap_id();
        self.minted_secrets.insert(swap_id.clone(), minted);
        let mut swap = self.build_swap(&req, swap_id, hashlocks, to_amount, &plan, now)?;

        // Reserve what the LP will lock on its outbound legs.
        let mut reserved = Vec::new();
        for (asset, amount) in self.outbound_amounts(&swap) {
            match self.inventory.reserve(asset, amount, &swap.swap_id, now).await {
                Ok(reservation) => reserved.push(reservation),
                Err(e) => {
                    self.inventory.release(&swap.swap_id).await;
                    self.minted_secrets.remove(&swap.swap_id);
                    return Err(e.into());
                }
            }
        }
        swap.reservations = reserved;

        let initial = match req.direction {
            Direction::Forward => SwapState::AwaitingBtc,
            Direction::Reverse => SwapState::AwaitingUsdc,
        };
        swap.state = initial;
        swap.push_timeline(now, initial, "swap created");

        self.register_initial_watches(&swap);
        if let Err(e) = self.store.upsert(swap.clone()).await {
            self.inventory.release(&swap.swap_id).await;
            self.registry.unregister_swap(&swap.swap_id);
            self.minted_secrets.remove(&swap.swap_id);
            return Err(e.into());
        }
        info!(swap_id = %swap.swap_id, direction = ?swap.direction, "swap initialized");
        Ok(swap)
    }

    /// Combine user-supplied, peer-supplied and freshly-minted hashlocks
    /// according to the routing role, enforcing pairwise distinctness
    /// before anything is persisted. The minted preimages stay in memory
    /// until the HTLC that makes them claimable has confirmed.
    fn assemble_hashlocks(
        &self,
        req: &InitSwapRequest,
    ) -> Result<(HashlockTriple, MintedSecrets), EngineError> {
        let (h_lp1, h_lp2, minted) = match &req.routing {
            RoutingMode::SingleLp => {
                if req.h_lp1.is_some() || req.h_lp2.is_some() {
                    return Err(EngineError::InvariantViolation(
                        "single-LP init must not supply LP hashlocks".into(),
                    ));
                }
                let s_lp1 = crate::crypto::generate_preimage();
                let s_lp2 = crate::crypto::generate_preimage();
                (
                    sha256(&s_lp1),
                    sha256(&s_lp2),
                    MintedSecrets {
                        lp1: Some(s_lp1),
                        lp2: Some(s_lp2),
                    },
                )
            }
            RoutingMode::PerLeg { role: LegRole::LpIn, .. } => {
                let h_lp2 = req.h_lp2.ok_or_else(|| {
                    EngineError::InvariantViolation("per-leg LP_IN requires peer H_lp2".into())
                })?;
                let s_lp1 = crate::crypto::generate_preimage();
                (
                    req.h_lp1.unwrap_or_else(|| sha256(&s_lp1)),
                    h_lp2,
                    MintedSecrets {
                        lp1: Some(s_lp1),
                        lp2: None,
                    },
                )
            }
            RoutingMode::PerLeg { role: LegRole::LpOut, .. } => {
                let h_lp1 = req.h_lp1.ok_or_else(|| {
                    EngineError::InvariantViolation("per-leg LP_OUT requires peer H_lp1".into())
                })?;
                let s_lp2 = crate::crypto::generate_preimage();
                (
                    h_lp1,
                    req.h_lp2.unwrap_or_else(|| sha256(&s_lp2)),
                    MintedSecrets {
                        lp1: None,
                        lp2: Some(s_lp2),
                    },
                )
            }
        };
        let triple = HashlockTriple {
            user: req.h_user,
            lp1: h_lp1,
            lp2: h_lp2,
        };
        triple.validate()?;
        Ok((triple, minted))
    }

    /// Once the HTLC that makes the LP's preimages claimable has at least
    /// one confirmation, move them from memory into the persisted record so
    /// the API surface can hand them to the claimant.
    fn persist_minted_secrets(&self, swap: &mut Swap) {
        if let Some((_, minted)) = self.minted_secrets.remove(&swap.swap_id) {
            if let Some(s_lp1) = minted.lp1 {
                swap.secrets.record(crate::crypto::SecretSlot::Lp1, s_lp1);
            }
            if let Some(s_lp2) = minted.lp2 {
                swap.secrets.record(crate::crypto::SecretSlot::Lp2, s_lp2);
            }
        }
    }

    fn build_swap(
        &self,
        req: &InitSwapRequest,
        swap_id: String,
        hashlocks: HashlockTriple,
        to_amount: u64,
        plan: &TimelockPlan,
        now: u64,
    ) -> Result<Swap, EngineError> {
        let lp_btc_pub = bitcoin::PublicKey::new(self.keys.public(ChainId::Btc)?);
        let lp_m1_pub = self.keys.public(ChainId::M1)?;
        let user_btc_pub = req
            .user_btc_pubkey
            .parse::<bitcoin::PublicKey>()
            .map_err(|e| EngineError::InvariantViolation(format!("bad user pubkey: {e}")))?;

        let (btc_sats, m1_sats, usdc_units) = match req.direction {
            // M1 mirrors the BTC side 1:1 in sats.
            Direction::Forward => (req.from_amount, req.from_amount, to_amount),
            Direction::Reverse => (to_amount, to_amount, req.from_amount),
        };

        // BTC leg: claim branch belongs to whoever receives the coins.
        let (btc_claim, btc_refund, btc_sender, btc_recipient) = match req.direction {
            Direction::Forward => (lp_btc_pub, user_btc_pub, "user", "lp"),
            Direction::Reverse => (user_btc_pub, lp_btc_pub, "lp", "user"),
        };
        let btc_params = btc_script::BtcHtlcParams {
            hashlocks,
            claim_pubkey: btc_claim,
            refund_pubkey: btc_refund,
            timelock_height: u32::try_from(plan.btc_height)
                .map_err(|_| EngineError::InvariantViolation("btc timelock overflow".into()))?,
        };
        let mut btc_core = HtlcCore::new(btc_sats, hashlocks, plan.btc_height, btc_sender, btc_recipient);
        btc_core.fund_evidence = None;
        let btc_leg = HtlcLeg::Btc(UtxoHtlc {
            core: btc_core,
            address: btc_params.p2wsh_address(self.network).to_string(),
            outpoint: None,
            claim_pubkey: btc_claim.to_string(),
            refund_pubkey: btc_refund.to_string(),
        });

        // M1 leg. Single-LP: locked by the LP to itself. Per-leg: LP_IN
        // locks with the peer LP_OUT on the claim branch; LP_OUT records
        // the mirror view of LP_IN's HTLC (peer owns the refund branch).
        let peer_pub = match &req.peer_m1_pubkey {
            Some(raw) => Some(raw.parse::<secp256k1::PublicKey>().map_err(|e| {
                EngineError::InvariantViolation(format!("bad peer m1 pubkey: {e}"))
            })?),
            None => None,
        };
        let (m1_claim, m1_refund) = match &req.routing {
            RoutingMode::SingleLp => (lp_m1_pub, lp_m1_pub),
            RoutingMode::PerLeg { role: LegRole::LpIn, .. } => (
                peer_pub.ok_or_else(|| {
                    EngineError::InvariantViolation("per-leg LP_IN requires the peer's M1 pubkey".into())
                })?,
                lp_m1_pub,
            ),
            RoutingMode::PerLeg { role: LegRole::LpOut, .. } => (
                lp_m1_pub,
                peer_pub.ok_or_else(|| {
                    EngineError::InvariantViolation("per-leg LP_OUT requires the peer's M1 pubkey".into())
                })?,
            ),
        };
        let m1_params = m1_script::M1HtlcParams {
            hashlocks,
            claim_pubkey: m1_claim,
            refund_pubkey: m1_refund,
            timelock_height: plan.m1_height,
        };
        let m1_leg = HtlcLeg::M1(UtxoHtlc {
            core: HtlcCore::new(m1_sats, hashlocks, plan.m1_height, "lp", "lp"),
            address: m1_params.address(),
            outpoint: None,
            claim_pubkey: hex::encode(m1_claim.serialize()),
            refund_pubkey: hex::encode(m1_refund.serialize()),
        });

        // EVM leg: LP pays the user in forward mode; the user pays the LP
        // in reverse mode.
        let (evm_sender, evm_recipient) = match req.direction {
            Direction::Forward => (
                self.config.rpc.evm_lp_address.clone(),
                req.user_payout_address.clone(),
            ),
            Direction::Reverse => (
                req.user_refund_address.clone(),
                self.config.rpc.evm_lp_address.clone(),
            ),
        };
        let evm_leg = HtlcLeg::Evm(EvmHtlc {
            core: HtlcCore::new(usdc_units, hashlocks, plan.evm_ts, evm_sender, evm_recipient),
            contract: self.config.rpc.evm_htlc_contract.clone(),
            token: self.config.rpc.usdc_token.clone(),
            htlc_id: None,
        });

        Ok(Swap {
            swap_id,
            direction: req.direction,
            routing: req.routing.clone(),
            from_asset: match req.direction {
                Direction::Forward => Asset::Btc,
                Direction::Reverse => Asset::Usdc,
            },
            to_asset: match req.direction {
                Direction::Forward => Asset::Usdc,
                Direction::Reverse => Asset::Btc,
            },
            from_amount: req.from_amount,
            to_amount,
            quote: req.quote,
            hashlocks,
            secrets: SecretSet::default(),
            btc_leg: Some(btc_leg),
            m1_leg: Some(m1_leg),
            evm_leg: Some(evm_leg),
            state: SwapState::Init,
            resume_state: None,
            timeline: Vec::new(),
            user_refund_address: req.user_refund_address.clone(),
            user_payout_address: req.user_payout_address.clone(),
            user_btc_pubkey: req.user_btc_pubkey.clone(),
            peer_m1_pubkey: req.peer_m1_pubkey.clone(),
            m1_notified: false,
            secrets_notified: false,
            created_at: now,
            updated_at: now,
            terminal_at: None,
            reservations: Vec::new(),
            seen_events: Vec::new(),
        })
    }

    /// Assets the LP must hold to serve this swap.
    fn outbound_amounts(&self, swap: &Swap) -> Vec<(Asset, u64)> {
        match (&swap.routing, swap.direction) {
            (RoutingMode::SingleLp, Direction::Forward) => vec![
                (Asset::M1, swap.from_amount),
                (Asset::Usdc, swap.to_amount),
            ],
            (RoutingMode::SingleLp, Direction::Reverse) => vec![
                (Asset::M1, swap.to_amount),
                (Asset::Btc, swap.to_amount),
            ],
            (RoutingMode::PerLeg { role: LegRole::LpIn, .. }, _) => {
                vec![(Asset::M1, swap.m1_leg.as_ref().map_or(0, |l| l.core().amount))]
            }
            (RoutingMode::PerLeg { role: LegRole::LpOut, .. }, _) => {
                vec![(Asset::Usdc, swap.to_amount)]
            }
        }
    }

    fn register_initial_watches(&self, swap: &Swap) {
        match (swap.direction, &swap.routing) {
            (_, RoutingMode::PerLeg { role: LegRole::LpOut, .. }) => {
                // Nothing to watch until the peer reports its M1 lock.
            }
            (Direction::Forward, _) => {
                if let Some(leg) = swap.btc_leg.as_ref().and_then(HtlcLeg::as_utxo) {
                    self.registry.register(
                        ChainId::Btc,
                        &swap.swap_id,
                        WatchTarget::FundingAddress {
                            address: leg.address.clone(),
                            amount: leg.core.amount,
                            expiry_height: leg.core.timelock,
                        },
                    );
                }
            }
            (Direction::Reverse, _) => {
                if let Some(leg) = swap.evm_leg.as_ref().and_then(HtlcLeg::as_evm) {
                    self.registry.register(
                        ChainId::Evm,
                        &swap.swap_id,
                        WatchTarget::EvmCreate {
                            contract: leg.contract.clone(),
                            h_user: swap.hashlocks.user,
                        },
                    );
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    /// Consume the shared event queue, fanning out to one worker per swap
    /// so events for a given swap stay totally ordered while different
    /// swaps progress in parallel.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<WatcherEvent>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut workers: HashMap<String, mpsc::UnboundedSender<EngineEvent>> = HashMap::new();
        let mut handles = Vec::new();
        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                maybe = rx.recv() => {
                    let Some(WatcherEvent { swap_id, event }) = maybe else { break };
                    let sender = workers.entry(swap_id.clone()).or_insert_with(|| {
                        let (tx, mut wrx) = mpsc::unbounded_channel();
                        let engine = Arc::clone(&self);
                        let id = swap_id.clone();
                        handles.push(tokio::spawn(async move {
                            while let Some(event) = wrx.recv().await {
                                if let Err(e) = engine.handle_event(&id, event).await {
                                    warn!(swap_id = %id, error = %e, "event handling failed");
                                }
                            }
                        }));
                        tx
                    });
                    let _ = sender.send(event);
                }
            }
        }
        // Drain per-swap queues for a bounded time, then persist and exit.
        drop(workers);
        let drain = Duration::from_secs(self.config.engine.shutdown_drain_secs);
        if tokio::time::timeout(drain, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!("shutdown drain window elapsed with events still queued");
        }
    }

    /// Apply one event to one swap. Holds the per-swap lock only while
    /// reading and mutating the record; any resulting chain action runs
    /// after the lock is released.
    pub async fn handle_event(&self, swap_id: &str, event: EngineEvent) -> Result<(), EngineError> {
        let lock = self.swap_lock(swap_id);
        let action = {
            let _guard = lock.lock().await;
            let mut swap = self
                .store
                .get(swap_id)
                .await
                .ok_or_else(|| EngineError::UnknownSwap(swap_id.to_string()))?;

            if let Some(key) = event.dedup_key() {
                if !swap.note_event(key) {
                    debug!(swap_id, "duplicate watcher event ignored");
                    return Ok(());
                }
            }
            if swap.state.is_terminal() && !matches!(event, EngineEvent::Reorg { .. }) {
                return Ok(());
            }
            // On-chain events are authoritative, and a peer message means
            // the peer is reachable again: either way a parked swap
            // resumes.
            let resumes = event.dedup_key().is_some()
                || matches!(
                    event,
                    EngineEvent::PeerSecrets { .. } | EngineEvent::PeerM1Locked { .. }
                );
            if swap.state == SwapState::PeerUnreachable && resumes {
                if let Some(resume) = swap.resume_state.take() {
                    swap.state = resume;
                    swap.push_timeline(unix_now(), resume, "resumed from peer_unreachable");
                }
            }

            let applied = self.apply(&mut swap, &event);
            match applied {
                Ok(action) => {
                    self.store.upsert(swap).await?;
                    action
                }
                Err(EngineError::InvariantViolation(msg)) => {
                    error!(swap_id, %msg, "invariant violation; failing swap");
                    self.fail_swap(&mut swap, &msg).await?;
                    return Err(EngineError::InvariantViolation(msg));
                }
                Err(e) => return Err(e),
            }
        };

        if let Some(action) = action {
            self.perform(swap_id, action).await;
        }
        Ok(())
    }

    /// Pure state mutation under the swap lock; returns the chain action
    /// the new state calls for, if any.
    fn apply(&self, swap: &mut Swap, event: &EngineEvent) -> Result<Option<Action>, EngineError> {
        let now = unix_now();
        match event {
            EngineEvent::FundingSeen { chain, txid, outpoint, .. } => {
                self.on_funding_seen(swap, *chain, txid, outpoint.as_deref(), now)?;
            }
            EngineEvent::FundingConfirmed {
                chain,
                txid,
                outpoint,
                amount,
                height,
                block_hash,
                confirmations,
            } => {
                self.on_funding_confirmed(
                    swap,
                    *chain,
                    txid,
                    outpoint.as_deref(),
                    *amount,
                    *height,
                    block_hash,
                    *confirmations,
                    now,
                )?;
            }
            EngineEvent::HtlcCreated {
                id,
                txid,
                height,
                block_hash,
                amount,
                recipient,
                timelock,
            } => {
                self.on_htlc_created(
                    swap, *id, txid, *height, block_hash, *amount, recipient, *timelock, now,
                )?;
            }
            EngineEvent::ClaimObserved {
                chain,
                txid,
                height,
                block_hash,
                confirmations,
                preimages,
            } => {
                self.on_claim_observed(
                    swap,
                    *chain,
                    txid,
                    *height,
                    block_hash.as_deref(),
                    *confirmations,
                    preimages.as_ref(),
                    now,
                )?;
            }
            EngineEvent::RefundObserved {
                chain,
                txid,
                height,
                confirmations,
            } => {
                self.on_refund_observed(swap, *chain, txid, *height, *confirmations, now)?;
            }
            EngineEvent::TimelockExpired { chain, .. } => {
                return self.on_timelock_expired(swap, *chain, now);
            }
            EngineEvent::Reorg { chain, height, .. } => {
                self.on_reorg(swap, *chain, *height, now)?;
            }
            EngineEvent::PeerM1Locked {
                outpoint,
                amount_sats,
                expiry_height,
            } => {
                self.on_peer_m1_locked(swap, outpoint, *amount_sats, *expiry_height, now)?;
            }
            EngineEvent::PeerSecrets { claim_txid, preimages } => {
                self.on_peer_secrets(swap, claim_txid, preimages, now)?;
            }
            EngineEvent::FundingHint { chain } => {
                self.on_funding_hint(swap, *chain, now)?;
            }
            EngineEvent::Tick { .. } => {}
        }
        Ok(self.pending_action(swap))
    }

    // ------------------------------------------------------------------
    // Event handlers (pure, under the swap lock)
    // ------------------------------------------------------------------

    fn on_funding_seen(
        &self,
        swap: &mut Swap,
        chain: ChainId,
        txid: &str,
        outpoint: Option<&str>,
        now: u64,
    ) -> Result<(), EngineError> {
        let Some(leg) = swap.leg_mut(chain) else { return Ok(()) };
        if leg.core().fund_evidence.is_none() {
            leg.core_mut().fund_evidence = Some(ChainEvidence::unconfirmed(txid));
        }
        if let (Some(utxo), Some(outpoint)) = (leg.as_utxo_mut(), outpoint) {
            utxo.outpoint.get_or_insert_with(|| outpoint.to_string());
        }
        let next = match (chain, swap.effective_state()) {
            (ChainId::Btc, SwapState::AwaitingBtc) => Some(SwapState::BtcFundingSeen),
            (ChainId::Evm, SwapState::AwaitingUsdc) => Some(SwapState::UsdcFundingSeen),
            _ => None,
        };
        if let Some(next) = next {
            self.transition(swap, next, format!("funding seen in mempool: {txid}"), now)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn on_funding_confirmed(
        &self,
        swap: &mut Swap,
        chain: ChainId,
        txid: &str,
        outpoint: Option<&str>,
        amount: u64,
        height: u64,
        block_hash: &str,
        confirmations: u32,
        now: u64,
    ) -> Result<(), EngineError> {
        let direction = swap.direction;
        let state = swap.effective_state();
        let routing = swap.routing.clone();
        let Some(leg) = swap.leg_mut(chain) else { return Ok(()) };

        if amount < leg.core().amount {
            let expected = leg.core().amount;
            swap.push_timeline(
                now,
                state,
                format!("{chain} funding underpays: got {amount}, expected {expected}; ignored"),
            );
            return Ok(());
        }
        leg.core_mut().fund_evidence = Some(ChainEvidence {
            txid: txid.to_string(),
            height: Some(height),
            block_hash: Some(block_hash.to_string()),
            confirmations,
        });
        if let (Some(utxo), Some(outpoint)) = (leg.as_utxo_mut(), outpoint) {
            utxo.outpoint = Some(outpoint.to_string());
        }

        let required = match chain {
            ChainId::Btc => self.config.confirmations.btc_confirmations_for(amount),
            ChainId::M1 => self.config.confirmations.m1_confirmations,
            ChainId::Evm => 1,
        };
        if confirmations < required {
            swap.push_timeline(
                now,
                state,
                format!("{chain} funding at {confirmations}/{required} confirmations"),
            );
            return Ok(());
        }
        if let Some(leg) = swap.leg_mut(chain) {
            leg.core_mut().funded = true;
        }

        // Funded leg gains a spend watch covering claim, refund and expiry.
        if let Some(utxo) = swap.leg(chain).and_then(HtlcLeg::as_utxo) {
            if let Some(outpoint) = utxo.outpoint.clone() {
                self.registry.register(
                    chain,
                    &swap.swap_id,
                    WatchTarget::Outpoint {
                        outpoint,
                        expiry_height: utxo.core.timelock,
                        hashlocks: utxo.core.hashlocks,
                    },
                );
            }
        }

        match (chain, state, direction) {
            (ChainId::Btc, SwapState::AwaitingBtc | SwapState::BtcFundingSeen, Direction::Forward) => {
                self.transition(swap, SwapState::BtcFunded, format!("btc funded by {txid}"), now)?;
            }
            (ChainId::Btc, SwapState::BtcLocked, Direction::Reverse) => {
                // The payout HTLC the user claims is live; release the LP
                // preimages for the claimant.
                self.persist_minted_secrets(swap);
                swap.push_timeline(now, state, format!("btc payout htlc confirmed: {txid}"));
            }
            (ChainId::M1, SwapState::M1Locked, _) => {
                let note = format!("m1 htlc confirmed: {txid}");
                match routing {
                    RoutingMode::PerLeg { role: LegRole::LpIn, .. } => {
                        self.persist_minted_secrets(swap);
                        self.transition(swap, SwapState::M1LockedForLpOut, note, now)?;
                    }
                    _ => swap.push_timeline(now, state, note),
                }
            }
            (ChainId::M1, SwapState::Init, _) => {
                // LP_OUT verifying the peer's M1 HTLC on chain.
                if matches!(routing, RoutingMode::PerLeg { role: LegRole::LpOut, .. }) {
                    self.transition(swap, SwapState::M1LockedSeen, format!("peer m1 htlc verified: {txid}"), now)?;
                }
            }
            _ => {
                swap.push_timeline(now, state, format!("{chain} funding confirmed: {txid}"));
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn on_htlc_created(
        &self,
        swap: &mut Swap,
        id: [u8; 32],
        txid: &str,
        height: u64,
        block_hash: &str,
        amount: u64,
        recipient: &str,
        _timelock: u64,
        now: u64,
    ) -> Result<(), EngineError> {
        let state = swap.effective_state();
        let Some(leg) = swap.evm_leg.as_mut().and_then(HtlcLeg::as_evm_mut) else {
            return Ok(());
        };
        if amount < leg.core.amount {
            let expected = leg.core.amount;
            swap.push_timeline(
                now,
                state,
                format!("evm htlc underpays: got {amount}, expected {expected}; ignored"),
            );
            return Ok(());
        }
        leg.htlc_id = Some(id);
        leg.core.funded = true;
        leg.core.fund_evidence = Some(ChainEvidence {
            txid: txid.to_string(),
            height: Some(height),
            block_hash: Some(block_hash.to_string()),
            confirmations: 1,
        });
        let expiry_ts = leg.core.timelock;
        self.registry.register(
            ChainId::Evm,
            &swap.swap_id,
            WatchTarget::EvmHtlc { id, expiry_ts },
        );

        match (state, swap.direction) {
            (SwapState::AwaitingUsdc | SwapState::UsdcFundingSeen, Direction::Reverse) => {
                self.transition(
                    swap,
                    SwapState::UsdcFunded,
                    format!("usdc htlc {} funded by user", hex::encode(id)),
                    now,
                )?;
            }
            (_, Direction::Forward) => {
                // Our own create confirming: the LP preimages become
                // claimable, so they may now be persisted and served.
                self.persist_minted_secrets(swap);
                swap.push_timeline(
                    now,
                    state,
                    format!("usdc htlc {} confirmed for {recipient}", hex::encode(id)),
                );
            }
            _ => {}
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn on_claim_observed(
        &self,
        swap: &mut Swap,
        chain: ChainId,
        txid: &str,
        height: Option<u64>,
        block_hash: Option<&str>,
        confirmations: u32,
        preimages: Option<&[[u8; 32]; 3]>,
        now: u64,
    ) -> Result<(), EngineError> {
        let state = swap.effective_state();

        // Preimage containment: verify against the hashlocks and persist
        // only once the revealing transaction has at least one
        // confirmation.
        if let Some(preimages) = preimages {
            let [s_user, s_lp1, s_lp2] = preimages;
            if sha256(s_user) != swap.hashlocks.user
                || sha256(s_lp1) != swap.hashlocks.lp1
                || sha256(s_lp2) != swap.hashlocks.lp2
            {
                return Err(EngineError::InvariantViolation(
                    "claimed preimages do not match hashlocks".into(),
                ));
            }
            if confirmations >= 1 {
                swap.secrets.record(crate::crypto::SecretSlot::User, *s_user);
                swap.secrets.record(crate::crypto::SecretSlot::Lp1, *s_lp1);
                swap.secrets.record(crate::crypto::SecretSlot::Lp2, *s_lp2);
            }
        }

        let Some(leg) = swap.leg_mut(chain) else { return Ok(()) };
        let own_claim = leg
            .core()
            .claim_evidence
            .as_ref()
            .map_or(false, |e| e.txid == txid);
        let evidence = ChainEvidence {
            txid: txid.to_string(),
            height,
            block_hash: block_hash.map(str::to_string),
            confirmations,
        };

        // A confirmed claim dominates an unconfirmed refund observation.
        if leg.core().refunded {
            let refund_unconfirmed = leg
                .core()
                .refund_evidence
                .as_ref()
                .map_or(true, |e| e.height.is_none());
            if confirmations >= 1 && refund_unconfirmed {
                let core = leg.core_mut();
                core.refunded = false;
                core.refund_evidence = None;
                swap.push_timeline(
                    now,
                    state,
                    format!("{chain} claim {txid} supersedes unconfirmed refund"),
                );
            } else {
                return Ok(());
            }
        }

        let Some(leg) = swap.leg_mut(chain) else { return Ok(()) };
        leg.core_mut().claim_evidence = Some(evidence);
        if confirmations >= 1 {
            leg.core_mut().claimed = true;
        }

        if confirmations == 0 {
            swap.push_timeline(now, state, format!("{chain} claim seen in mempool: {txid}"));
            return Ok(());
        }

        match (chain, swap.direction, state) {
            // Forward: user claim on the EVM leg reveals all secrets.
            (ChainId::Evm, Direction::Forward, SwapState::UsdcLocked) => {
                self.transition(
                    swap,
                    SwapState::UsdcClaimedByUser,
                    format!("user claimed usdc in {txid}; secrets extracted"),
                    now,
                )?;
            }
            // Forward: our own M1/BTC sweeps confirming.
            (ChainId::M1, Direction::Forward, SwapState::M1SelfClaimed) if own_claim => {
                swap.push_timeline(now, state, format!("m1 sweep confirmed: {txid}"));
            }
            (ChainId::Btc, Direction::Forward, SwapState::BtcClaimed) if own_claim => {
                self.complete(swap, format!("btc sweep confirmed: {txid}"), now)?;
            }
            // Reverse: user claim on the BTC leg reveals all secrets.
            (ChainId::Btc, Direction::Reverse, SwapState::BtcLocked) => {
                self.transition(
                    swap,
                    SwapState::BtcClaimedByUser,
                    format!("user claimed btc in {txid}; secrets extracted"),
                    now,
                )?;
            }
            (ChainId::Evm, Direction::Reverse, SwapState::UsdcClaimed) if own_claim => {
                self.complete(swap, format!("usdc sweep confirmed: {txid}"), now)?;
            }
            // Per-leg LP_IN: LP_OUT claimed our M1 HTLC, revealing secrets.
            (ChainId::M1, _, SwapState::M1LockedForLpOut) if !own_claim => {
                swap.push_timeline(
                    now,
                    state,
                    format!("peer claimed m1 htlc in {txid}; secrets extracted"),
                );
            }
            // Per-leg LP_OUT: our claim of the peer's M1 confirming.
            (ChainId::M1, _, SwapState::M1ClaimedFromLpIn) if own_claim => {
                self.complete(swap, format!("m1 claim from lp_in confirmed: {txid}"), now)?;
            }
            // Late peer claim after local refund bookkeeping: reconcile;
            // the pending-action pass will attempt any upstream claim.
            (_, _, SwapState::RefundPending | SwapState::Refunded) => {
                swap.push_timeline(
                    now,
                    state,
                    format!("late {chain} claim {txid} observed during refund"),
                );
            }
            _ => {
                swap.push_timeline(now, state, format!("{chain} claim observed: {txid}"));
            }
        }
        Ok(())
    }

    fn on_refund_observed(
        &self,
        swap: &mut Swap,
        chain: ChainId,
        txid: &str,
        height: Option<u64>,
        confirmations: u32,
        now: u64,
    ) -> Result<(), EngineError> {
        let state = swap.effective_state();
        let Some(leg) = swap.leg_mut(chain) else { return Ok(()) };

        // A confirmed claim dominates: ignore refund observations for a
        // leg already claimed on-chain.
        if leg.core().claimed {
            return Ok(());
        }
        leg.core_mut().refund_evidence = Some(ChainEvidence {
            txid: txid.to_string(),
            height,
            block_hash: None,
            confirmations,
        });
        if confirmations >= 1 {
            leg.core_mut().refunded = true;
        }
        swap.push_timeline(now, state, format!("{chain} refund observed: {txid}"));

        if confirmations >= 1 && self.refundable_legs(swap).is_empty() {
            let lp_funded_anything = swap.any_leg_funded();
            if state == SwapState::RefundPending || lp_funded_anything {
                self.mark_refunded(swap, now)?;
            }
        }
        Ok(())
    }

    /// LP-owned legs that are funded but neither claimed nor refunded, in
    /// downstream-first refund order.
    fn refundable_legs(&self, swap: &Swap) -> Vec<ChainId> {
        let order = match swap.direction {
            Direction::Forward => [ChainId::Evm, ChainId::M1],
            Direction::Reverse => [ChainId::Btc, ChainId::M1],
        };
        order
            .into_iter()
            .filter(|chain| {
                swap.leg(*chain).map_or(false, |leg| {
                    let core = leg.core();
                    core.funded
                        && !core.claimed
                        && !core.refunded
                        && self.lp_owns_refund(swap, *chain)
                })
            })
            .collect()
    }

    fn lp_owns_refund(&self, swap: &Swap, chain: ChainId) -> bool {
        match (chain, swap.leg(chain)) {
            (ChainId::Evm, Some(HtlcLeg::Evm(leg))) => {
                leg.core.sender.eq_ignore_ascii_case(&self.config.rpc.evm_lp_address)
            }
            (_, Some(leg)) => leg
                .as_utxo()
                .and_then(|utxo| {
                    let lp = self.keys.public(chain).ok()?;
                    Some(utxo.refund_pubkey == hex::encode(lp.serialize())
                        || utxo.refund_pubkey == bitcoin::PublicKey::new(lp).to_string())
                })
                .unwrap_or(false),
            _ => false,
        }
    }

    fn on_timelock_expired(
        &self,
        swap: &mut Swap,
        chain: ChainId,
        now: u64,
    ) -> Result<Option<Action>, EngineError> {
        let state = swap.effective_state();

        // Nothing funded: the user simply never showed up. The operator
        // force-fails at leisure; no on-chain cleanup exists to do.
        if !swap.any_leg_funded() {
            swap.push_timeline(now, state, format!("{chain} timelock expired, nothing funded"));
            return Ok(None);
        }

        // Claim-over-refund: if the downstream secrets are already known,
        // sweep what we are owed instead of refunding.
        if swap.secrets.all_known() {
            swap.push_timeline(
                now,
                state,
                format!("{chain} timelock expired but secrets known; claiming instead"),
            );
            return Ok(self.pending_action(swap));
        }

        let refundable = self.refundable_legs(swap);
        if refundable.is_empty() {
            swap.push_timeline(now, state, format!("{chain} timelock expired, no lp-owned leg to refund"));
            return Ok(None);
        }
        if !self.config.engine.auto_refund {
            swap.push_timeline(now, state, "auto-refund disabled; operator action required");
            return Ok(None);
        }
        if state != SwapState::RefundPending {
            self.transition(
                swap,
                SwapState::RefundPending,
                format!("{chain} timelock expired; refunding lp legs"),
                now,
            )?;
        }
        Ok(Some(Action::RefundLeg(refundable[0])))
    }

    fn on_reorg(
        &self,
        swap: &mut Swap,
        chain: ChainId,
        height: u64,
        now: u64,
    ) -> Result<(), EngineError> {
        let direction = swap.direction;
        let state = swap.state;
        let Some(leg) = swap.leg_mut(chain) else { return Ok(()) };

        let mut rolled_back = false;
        let core = leg.core_mut();
        if core
            .claim_evidence
            .as_ref()
            .and_then(|e| e.height)
            .map_or(false, |h| h >= height)
        {
            core.claimed = false;
            core.claim_evidence = None;
            rolled_back = true;
        }
        if core
            .refund_evidence
            .as_ref()
            .and_then(|e| e.height)
            .map_or(false, |h| h >= height)
        {
            core.refunded = false;
            core.refund_evidence = None;
            rolled_back = true;
        }
        if core
            .fund_evidence
            .as_ref()
            .and_then(|e| e.height)
            .map_or(false, |h| h >= height)
        {
            core.funded = false;
            if let Some(e) = core.fund_evidence.as_mut() {
                e.height = None;
                e.block_hash = None;
                e.confirmations = 0;
            }
            rolled_back = true;
        }
        if !rolled_back {
            return Ok(());
        }

        let rewound = rollback_state(state, chain, direction);
        swap.push_timeline(
            now,
            rewound,
            format!("reorg on {chain} at height {height}; rolled back to {rewound}"),
        );
        if swap.state.is_terminal() {
            swap.terminal_at = None;
        }
        swap.state = rewound;
        info!(swap_id = %swap.swap_id, %chain, height, "reorg rollback applied");
        Ok(())
    }

    fn on_peer_m1_locked(
        &self,
        swap: &mut Swap,
        outpoint: &str,
        amount_sats: u64,
        expiry_height: u64,
        now: u64,
    ) -> Result<(), EngineError> {
        if !matches!(swap.routing, RoutingMode::PerLeg { role: LegRole::LpOut, .. }) {
            return Err(EngineError::StateConflict(
                "m1-locked notification on a non-LP_OUT swap".into(),
            ));
        }
        let state = swap.effective_state();
        let hashlocks = swap.hashlocks;
        let Some(leg) = swap.m1_leg.as_mut().and_then(HtlcLeg::as_utxo_mut) else {
            return Ok(());
        };
        if amount_sats < leg.core.amount {
            return Err(EngineError::InvariantViolation(format!(
                "peer m1 lock underpays: {amount_sats} < {}",
                leg.core.amount
            )));
        }
        leg.outpoint = Some(outpoint.to_string());
        leg.core.timelock = expiry_height;
        // Recompute the script address with the expiry the peer actually
        // used; the planned one was provisional.
        let refreshed = m1_script::M1HtlcParams {
            hashlocks,
            claim_pubkey: parse_secp_pubkey(&leg.claim_pubkey)?,
            refund_pubkey: parse_secp_pubkey(&leg.refund_pubkey)?,
            timelock_height: expiry_height,
        };
        leg.address = refreshed.address();
        swap.push_timeline(now, state, format!("peer reports m1 locked at {outpoint}"));

        // Verify on chain before trusting it: watch the outpoint and the
        // funding address; the watcher's confirmation moves the state.
        self.registry.register(
            ChainId::M1,
            &swap.swap_id,
            WatchTarget::Outpoint {
                outpoint: outpoint.to_string(),
                expiry_height,
                hashlocks: swap.hashlocks,
            },
        );
        if let Some(utxo) = swap.m1_leg.as_ref().and_then(HtlcLeg::as_utxo) {
            self.registry.register(
                ChainId::M1,
                &swap.swap_id,
                WatchTarget::FundingAddress {
                    address: utxo.address.clone(),
                    amount: utxo.core.amount,
                    expiry_height,
                },
            );
        }
        Ok(())
    }

    fn on_peer_secrets(
        &self,
        swap: &mut Swap,
        claim_txid: &str,
        preimages: &[[u8; 32]; 3],
        now: u64,
    ) -> Result<(), EngineError> {
        let [s_user, s_lp1, s_lp2] = preimages;
        if sha256(s_user) != swap.hashlocks.user
            || sha256(s_lp1) != swap.hashlocks.lp1
            || sha256(s_lp2) != swap.hashlocks.lp2
        {
            return Err(EngineError::InvariantViolation(
                "peer-supplied preimages do not match hashlocks".into(),
            ));
        }
        swap.secrets.record(crate::crypto::SecretSlot::User, *s_user);
        swap.secrets.record(crate::crypto::SecretSlot::Lp1, *s_lp1);
        swap.secrets.record(crate::crypto::SecretSlot::Lp2, *s_lp2);
        let state = swap.effective_state();
        swap.push_timeline(
            now,
            state,
            format!("peer delivered secrets from claim {claim_txid}"),
        );
        Ok(())
    }

    fn on_funding_hint(&self, swap: &mut Swap, chain: ChainId, now: u64) -> Result<(), EngineError> {
        let next = match (chain, swap.effective_state()) {
            (ChainId::Btc, SwapState::AwaitingBtc) => Some(SwapState::BtcFundingSeen),
            (ChainId::Evm, SwapState::AwaitingUsdc) => Some(SwapState::UsdcFundingSeen),
            _ => None,
        };
        if let Some(next) = next {
            self.transition(swap, next, "user reports funding sent", now)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pending-action derivation
    // ------------------------------------------------------------------

    /// The on-chain action the current state calls for. Derived purely
    /// from the swap record so ticks and retries re-decide from scratch.
    fn pending_action(&self, swap: &Swap) -> Option<Action> {
        let auto_claim = self.config.engine.auto_claim;
        match (swap.effective_state(), swap.direction, &swap.routing) {
            (SwapState::BtcFunded, Direction::Forward, _) => Some(Action::LockM1),
            (SwapState::UsdcFunded, Direction::Reverse, _) => Some(Action::LockM1),
            (SwapState::M1Locked, Direction::Forward, RoutingMode::SingleLp) => swap
                .m1_leg
                .as_ref()
                .filter(|l| l.core().funded)
                .map(|_| Action::LockEvm),
            (SwapState::M1Locked, Direction::Reverse, _) => swap
                .m1_leg
                .as_ref()
                .filter(|l| l.core().funded)
                .map(|_| Action::LockBtcForUser),
            (SwapState::M1LockedSeen, _, RoutingMode::PerLeg { role: LegRole::LpOut, .. }) => {
                Some(Action::LockEvm)
            }
            (SwapState::UsdcClaimedByUser, _, routing) if auto_claim && swap.secrets.all_known() => {
                match routing {
                    RoutingMode::PerLeg { role: LegRole::LpOut, .. } | RoutingMode::SingleLp => {
                        Some(Action::SweepM1)
                    }
                    _ => None,
                }
            }
            (SwapState::M1SelfClaimed, Direction::Forward, _)
                if auto_claim && swap.secrets.all_known() =>
            {
                swap.btc_leg
                    .as_ref()
                    .filter(|l| !l.core().claimed)
                    .map(|_| Action::SweepBtc)
            }
            (SwapState::BtcClaimedByUser, Direction::Reverse, _)
                if auto_claim && swap.secrets.all_known() =>
            {
                Some(Action::SweepEvm)
            }
            (SwapState::M1LockedForLpOut, _, RoutingMode::PerLeg { role: LegRole::LpIn, .. }) => {
                if swap.secrets.all_known() && auto_claim {
                    swap.btc_leg
                        .as_ref()
                        .filter(|l| !l.core().claimed)
                        .map(|_| Action::SweepBtc)
                } else if !swap.m1_notified {
                    Some(Action::NotifyM1Locked)
                } else {
                    None
                }
            }
            (SwapState::M1ClaimedFromLpIn, _, RoutingMode::PerLeg { role: LegRole::LpOut, .. })
                if !swap.secrets_notified =>
            {
                Some(Action::NotifySecrets)
            }
            (SwapState::RefundPending, _, _) => {
                if swap.secrets.all_known() {
                    // Claim-over-refund reconciliation after catch-up.
                    match swap.direction {
                        Direction::Forward => swap
                            .btc_leg
                            .as_ref()
                            .filter(|l| l.core().funded && !l.core().claimed && !l.core().refunded)
                            .map(|_| Action::SweepBtc),
                        Direction::Reverse => swap
                            .evm_leg
                            .as_ref()
                            .filter(|l| l.core().funded && !l.core().claimed && !l.core().refunded)
                            .map(|_| Action::SweepEvm),
                    }
                } else {
                    self.refundable_legs(swap).first().map(|c| Action::RefundLeg(*c))
                }
            }
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Action execution (no swap lock held)
    // ------------------------------------------------------------------

    async fn perform(&self, swap_id: &str, action: Action) {
        let flight_key = format!("{swap_id}:{}", action.name());
        if self.in_flight.insert(flight_key.clone(), ()).is_some() {
            debug!(swap_id, action = action.name(), "action already in flight");
            return;
        }
        let result = self.perform_inner(swap_id, action).await;
        self.in_flight.remove(&flight_key);
        if let Err(e) = result {
            match &e {
                EngineError::Chain { chain, source } if source.is_transient() => {
                    warn!(swap_id, %chain, error = %source, "transient chain failure; will retry on tick");
                }
                _ => {
                    error!(swap_id, action = action.name(), error = %e, "action failed; parking leg");
                    if let Err(park) = self.park_broken(swap_id, &e).await {
                        error!(swap_id, error = %park, "failed to park swap");
                    }
                }
            }
        }
    }

    async fn perform_inner(&self, swap_id: &str, action: Action) -> Result<(), EngineError> {
        // Snapshot under the lock, act outside it.
        let swap = {
            let lock = self.swap_lock(swap_id);
            let _guard = lock.lock().await;
            self.store
                .get(swap_id)
                .await
                .ok_or_else(|| EngineError::UnknownSwap(swap_id.to_string()))?
        };
        if self.pending_action(&swap) != Some(action) {
            debug!(swap_id, action = action.name(), "action no longer pending; discarded");
            return Ok(());
        }
        match action {
            Action::LockM1 => self.do_lock_m1(&swap).await,
            Action::LockEvm => self.do_lock_evm(&swap).await,
            Action::LockBtcForUser => self.do_lock_btc(&swap).await,
            Action::SweepM1 => self.do_sweep_m1(&swap).await,
            Action::SweepBtc => self.do_sweep_btc(&swap).await,
            Action::SweepEvm => self.do_sweep_evm(&swap).await,
            Action::RefundLeg(chain) => self.do_refund(&swap, chain).await,
            Action::NotifyM1Locked => self.do_notify_m1_locked(&swap).await,
            Action::NotifySecrets => self.do_notify_secrets(&swap).await,
        }
    }

    /// Re-acquire the swap lock, re-validate the expectation, commit.
    async fn commit<F>(
        &self,
        swap_id: &str,
        expected: &[SwapState],
        mutate: F,
    ) -> Result<(), EngineError>
    where
        F: FnOnce(&mut Swap, u64) -> Result<(), EngineError>,
    {
        let lock = self.swap_lock(swap_id);
        let _guard = lock.lock().await;
        let mut swap = self
            .store
            .get(swap_id)
            .await
            .ok_or_else(|| EngineError::UnknownSwap(swap_id.to_string()))?;
        if !expected.contains(&swap.effective_state()) {
            warn!(
                swap_id,
                state = %swap.state,
                "state changed during chain action; commit discarded"
            );
            return Ok(());
        }
        let now = unix_now();
        mutate(&mut swap, now)?;
        // A successful commit while parked means the peer interaction went
        // through after all; resume. Commits that set a new state clear
        // the stale resume marker instead.
        if swap.state == SwapState::PeerUnreachable {
            if let Some(resume) = swap.resume_state.take() {
                swap.state = resume;
                swap.push_timeline(now, resume, "peer reachable again; resumed");
            }
        } else {
            swap.resume_state = None;
        }
        self.store.upsert(swap).await?;
        Ok(())
    }

    async fn do_lock_m1(&self, swap: &Swap) -> Result<(), EngineError> {
        let leg = swap
            .m1_leg
            .as_ref()
            .and_then(HtlcLeg::as_utxo)
            .ok_or_else(|| EngineError::StateConflict("missing m1 leg".into()))?;
        let (address, amount) = (leg.address.clone(), leg.core.amount);
        let txid = {
            let _wallet = self.wallet_lock(ChainId::M1).lock().await;
            self.chains
                .m1
                .fund_address(&address, amount)
                .await
                .map_err(|e| EngineError::chain(ChainId::M1, e))?
        };
        let registry = Arc::clone(&self.registry);
        self.commit(
            &swap.swap_id,
            &[SwapState::BtcFunded, SwapState::UsdcFunded],
            move |swap, now| {
                if let Some(leg) = swap.m1_leg.as_mut() {
                    leg.core_mut().fund_evidence = Some(ChainEvidence::unconfirmed(&txid));
                }
                if let Some(utxo) = swap.m1_leg.as_ref().and_then(HtlcLeg::as_utxo) {
                    registry.register(
                        ChainId::M1,
                        &swap.swap_id,
                        WatchTarget::FundingAddress {
                            address: utxo.address.clone(),
                            amount: utxo.core.amount,
                            expiry_height: utxo.core.timelock,
                        },
                    );
                }
                swap.push_timeline(now, SwapState::M1Locked, format!("m1 htlc published: {txid}"));
                swap.state = SwapState::M1Locked;
                Ok(())
            },
        )
        .await
    }

    async fn do_lock_evm(&self, swap: &Swap) -> Result<(), EngineError> {
        let leg = swap
            .evm_leg
            .as_ref()
            .and_then(HtlcLeg::as_evm)
            .ok_or_else(|| EngineError::StateConflict("missing evm leg".into()))?;
        let params = evm_abi::EvmCreateParams {
            recipient: evm_abi::parse_address(&leg.core.recipient)?,
            token: evm_abi::parse_address(&leg.token)?,
            amount: leg.core.amount,
            hashlocks: swap.hashlocks,
            timelock: leg.core.timelock,
        };
        let contract = leg.contract.clone();
        let h_user = swap.hashlocks.user;
        let calldata = evm_abi::encode_create(&params);
        let txid = {
            let _wallet = self.wallet_lock(ChainId::Evm).lock().await;
            self.chains
                .evm
                .send_transaction(&contract, &calldata)
                .await
                .map_err(|e| EngineError::chain(ChainId::Evm, e))?
        };
        let registry = Arc::clone(&self.registry);
        self.commit(
            &swap.swap_id,
            &[SwapState::M1Locked, SwapState::M1LockedSeen],
            move |swap, now| {
                if let Some(leg) = swap.evm_leg.as_mut() {
                    leg.core_mut().fund_evidence = Some(ChainEvidence::unconfirmed(&txid));
                }
                registry.register(
                    ChainId::Evm,
                    &swap.swap_id,
                    WatchTarget::EvmCreate { contract, h_user },
                );
                swap.push_timeline(now, SwapState::UsdcLocked, format!("usdc htlc create sent: {txid}"));
                swap.state = SwapState::UsdcLocked;
                Ok(())
            },
        )
        .await
    }

    async fn do_lock_btc(&self, swap: &Swap) -> Result<(), EngineError> {
        let leg = swap
            .btc_leg
            .as_ref()
            .and_then(HtlcLeg::as_utxo)
            .ok_or_else(|| EngineError::StateConflict("missing btc leg".into()))?;
        let (address, amount) = (leg.address.clone(), leg.core.amount);
        let txid = {
            let _wallet = self.wallet_lock(ChainId::Btc).lock().await;
            self.chains
                .btc
                .fund_address(&address, amount)
                .await
                .map_err(|e| EngineError::chain(ChainId::Btc, e))?
        };
        let registry = Arc::clone(&self.registry);
        self.commit(&swap.swap_id, &[SwapState::M1Locked], move |swap, now| {
            if let Some(leg) = swap.btc_leg.as_mut() {
                leg.core_mut().fund_evidence = Some(ChainEvidence::unconfirmed(&txid));
            }
            if let Some(utxo) = swap.btc_leg.as_ref().and_then(HtlcLeg::as_utxo) {
                registry.register(
                    ChainId::Btc,
                    &swap.swap_id,
                    WatchTarget::FundingAddress {
                        address: utxo.address.clone(),
                        amount: utxo.core.amount,
                        expiry_height: utxo.core.timelock,
                    },
                );
            }
            swap.push_timeline(now, SwapState::BtcLocked, format!("btc payout htlc published: {txid}"));
            swap.state = SwapState::BtcLocked;
            Ok(())
        })
        .await
    }

    fn m1_params(&self, swap: &Swap) -> Result<m1_script::M1HtlcParams, EngineError> {
        let leg = swap
            .m1_leg
            .as_ref()
            .and_then(HtlcLeg::as_utxo)
            .ok_or_else(|| EngineError::StateConflict("missing m1 leg".into()))?;
        Ok(m1_script::M1HtlcParams {
            hashlocks: swap.hashlocks,
            claim_pubkey: parse_secp_pubkey(&leg.claim_pubkey)?,
            refund_pubkey: parse_secp_pubkey(&leg.refund_pubkey)?,
            timelock_height: leg.core.timelock,
        })
    }

    async fn do_sweep_m1(&self, swap: &Swap) -> Result<(), EngineError> {
        let leg = swap
            .m1_leg
            .as_ref()
            .and_then(HtlcLeg::as_utxo)
            .ok_or_else(|| EngineError::StateConflict("missing m1 leg".into()))?;
        let outpoint = leg
            .outpoint
            .clone()
            .ok_or_else(|| EngineError::StateConflict("m1 leg has no outpoint".into()))?;
        let secrets = swap
            .secrets
            .as_array()
            .ok_or_else(|| EngineError::StateConflict("secrets incomplete".into()))?;
        let params = self.m1_params(swap)?;
        let payout = m1_script::key_address(&self.keys.public(ChainId::M1)?);
        let value = leg.core.amount;
        let next_state = match &swap.routing {
            RoutingMode::PerLeg { role: LegRole::LpOut, .. } => SwapState::M1ClaimedFromLpIn,
            _ => SwapState::M1SelfClaimed,
        };
        let txid = {
            let _wallet = self.wallet_lock(ChainId::M1).lock().await;
            let fee = self
                .chains
                .m1
                .estimate_spend_fee()
                .await
                .map_err(|e| EngineError::chain(ChainId::M1, e))?;
            let raw = m1_script::build_claim_tx(
                &outpoint,
                value,
                fee,
                &params,
                &payout,
                &secrets,
                self.keys.secret(ChainId::M1)?,
            )?;
            self.chains
                .m1
                .broadcast(&raw)
                .await
                .map_err(|e| EngineError::chain(ChainId::M1, e))?
        };
        self.commit(
            &swap.swap_id,
            &[SwapState::UsdcClaimedByUser],
            move |swap, now| {
                if let Some(leg) = swap.m1_leg.as_mut() {
                    leg.core_mut().claim_evidence = Some(ChainEvidence::unconfirmed(&txid));
                }
                swap.push_timeline(now, next_state, format!("m1 sweep broadcast: {txid}"));
                swap.state = next_state;
                Ok(())
            },
        )
        .await
    }

    async fn do_sweep_btc(&self, swap: &Swap) -> Result<(), EngineError> {
        let leg = swap
            .btc_leg
            .as_ref()
            .and_then(HtlcLeg::as_utxo)
            .ok_or_else(|| EngineError::StateConflict("missing btc leg".into()))?;
        let outpoint = leg
            .outpoint
            .clone()
            .ok_or_else(|| EngineError::StateConflict("btc leg has no outpoint".into()))?;
        let secrets = swap
            .secrets
            .as_array()
            .ok_or_else(|| EngineError::StateConflict("secrets incomplete".into()))?;
        let params = btc_script::BtcHtlcParams {
            hashlocks: swap.hashlocks,
            claim_pubkey: parse_btc_pubkey(&leg.claim_pubkey)?,
            refund_pubkey: parse_btc_pubkey(&leg.refund_pubkey)?,
            timelock_height: u32::try_from(leg.core.timelock)
                .map_err(|_| EngineError::InvariantViolation("btc timelock overflow".into()))?,
        };
        let value = leg.core.amount;
        let payout = bitcoin::Address::p2wpkh(
            &bitcoin::PublicKey::new(self.keys.public(ChainId::Btc)?),
            self.network,
        )
        .map_err(|e| EngineError::InvariantViolation(e.to_string()))?;
        let txid = {
            let _wallet = self.wallet_lock(ChainId::Btc).lock().await;
            let fee = self
                .chains
                .btc
                .estimate_spend_fee()
                .await
                .map_err(|e| EngineError::chain(ChainId::Btc, e))?;
            let tx = btc_script::build_claim_tx(
                &outpoint,
                value,
                fee,
                &params,
                &payout,
                &secrets,
                self.keys.secret(ChainId::Btc)?,
            )?;
            let raw = bitcoin::consensus::encode::serialize(&tx);
            self.chains
                .btc
                .broadcast(&raw)
                .await
                .map_err(|e| EngineError::chain(ChainId::Btc, e))?
        };
        self.commit(
            &swap.swap_id,
            &[
                SwapState::M1SelfClaimed,
                SwapState::M1LockedForLpOut,
                SwapState::RefundPending,
            ],
            move |swap, now| {
                if let Some(leg) = swap.btc_leg.as_mut() {
                    leg.core_mut().claim_evidence = Some(ChainEvidence::unconfirmed(&txid));
                }
                swap.push_timeline(now, SwapState::BtcClaimed, format!("btc sweep broadcast: {txid}"));
                swap.state = SwapState::BtcClaimed;
                Ok(())
            },
        )
        .await
    }

    async fn do_sweep_evm(&self, swap: &Swap) -> Result<(), EngineError> {
        let leg = swap
            .evm_leg
            .as_ref()
            .and_then(HtlcLeg::as_evm)
            .ok_or_else(|| EngineError::StateConflict("missing evm leg".into()))?;
        let id = leg
            .htlc_id
            .ok_or_else(|| EngineError::StateConflict("evm htlc id unknown".into()))?;
        let secrets = swap
            .secrets
            .as_array()
            .ok_or_else(|| EngineError::StateConflict("secrets incomplete".into()))?;
        let contract = leg.contract.clone();
        let calldata = evm_abi::encode_claim(&id, &secrets);
        let txid = {
            let _wallet = self.wallet_lock(ChainId::Evm).lock().await;
            self.chains
                .evm
                .send_transaction(&contract, &calldata)
                .await
                .map_err(|e| EngineError::chain(ChainId::Evm, e))?
        };
        self.commit(
            &swap.swap_id,
            &[SwapState::BtcClaimedByUser, SwapState::RefundPending],
            move |swap, now| {
                if let Some(leg) = swap.evm_leg.as_mut() {
                    leg.core_mut().claim_evidence = Some(ChainEvidence::unconfirmed(&txid));
                }
                swap.push_timeline(now, SwapState::UsdcClaimed, format!("usdc claim sent: {txid}"));
                swap.state = SwapState::UsdcClaimed;
                Ok(())
            },
        )
        .await
    }

    async fn do_refund(&self, swap: &Swap, chain: ChainId) -> Result<(), EngineError> {
        match chain {
            ChainId::Evm => {
                let leg = swap
                    .evm_leg
                    .as_ref()
                    .and_then(HtlcLeg::as_evm)
                    .ok_or_else(|| EngineError::StateConflict("missing evm leg".into()))?;
                let id = leg
                    .htlc_id
                    .ok_or_else(|| EngineError::StateConflict("evm htlc id unknown".into()))?;
                let now_ts = self
                    .chains
                    .evm
                    .latest_timestamp()
                    .await
                    .map_err(|e| EngineError::chain(ChainId::Evm, e))?;
                if now_ts < leg.core.timelock {
                    debug!(swap_id = %swap.swap_id, "evm timelock not yet passed; refund deferred");
                    return Ok(());
                }
                let contract = leg.contract.clone();
                let calldata = evm_abi::encode_refund(&id);
                let txid = {
                    let _wallet = self.wallet_lock(ChainId::Evm).lock().await;
                    self.chains
                        .evm
                        .send_transaction(&contract, &calldata)
                        .await
                        .map_err(|e| EngineError::chain(ChainId::Evm, e))?
                };
                self.commit(&swap.swap_id, &[SwapState::RefundPending], move |swap, now| {
                    if let Some(leg) = swap.evm_leg.as_mut() {
                        leg.core_mut().refund_evidence = Some(ChainEvidence::unconfirmed(&txid));
                    }
                    swap.push_timeline(now, SwapState::RefundPending, format!("evm refund sent: {txid}"));
                    Ok(())
                })
                .await
            }
            ChainId::M1 => {
                let leg = swap
                    .m1_leg
                    .as_ref()
                    .and_then(HtlcLeg::as_utxo)
                    .ok_or_else(|| EngineError::StateConflict("missing m1 leg".into()))?;
                let outpoint = leg
                    .outpoint
                    .clone()
                    .ok_or_else(|| EngineError::StateConflict("m1 leg has no outpoint".into()))?;
                let tip = self
                    .chains
                    .m1
                    .tip_height()
                    .await
                    .map_err(|e| EngineError::chain(ChainId::M1, e))?;
                if tip < leg.core.timelock {
                    debug!(swap_id = %swap.swap_id, "m1 timelock not yet passed; refund deferred");
                    return Ok(());
                }
                let params = self.m1_params(swap)?;
                let refund_to = m1_script::key_address(&self.keys.public(ChainId::M1)?);
                let value = leg.core.amount;
                let txid = {
                    let _wallet = self.wallet_lock(ChainId::M1).lock().await;
                    let fee = self
                        .chains
                        .m1
                        .estimate_spend_fee()
                        .await
                        .map_err(|e| EngineError::chain(ChainId::M1, e))?;
                    let raw = m1_script::build_refund_tx(
                        &outpoint,
                        value,
                        fee,
                        &params,
                        &refund_to,
                        self.keys.secret(ChainId::M1)?,
                    )?;
                    self.chains
                        .m1
                        .broadcast(&raw)
                        .await
                        .map_err(|e| EngineError::chain(ChainId::M1, e))?
                };
                self.commit(&swap.swap_id, &[SwapState::RefundPending], move |swap, now| {
                    if let Some(leg) = swap.m1_leg.as_mut() {
                        leg.core_mut().refund_evidence = Some(ChainEvidence::unconfirmed(&txid));
                    }
                    swap.push_timeline(now, SwapState::RefundPending, format!("m1 refund broadcast: {txid}"));
                    Ok(())
                })
                .await
            }
            ChainId::Btc => {
                let leg = swap
                    .btc_leg
                    .as_ref()
                    .and_then(HtlcLeg::as_utxo)
                    .ok_or_else(|| EngineError::StateConflict("missing btc leg".into()))?;
                let outpoint = leg
                    .outpoint
                    .clone()
                    .ok_or_else(|| EngineError::StateConflict("btc leg has no outpoint".into()))?;
                let tip = self
                    .chains
                    .btc
                    .tip_height()
                    .await
                    .map_err(|e| EngineError::chain(ChainId::Btc, e))?;
                if tip < leg.core.timelock {
                    debug!(swap_id = %swap.swap_id, "btc timelock not yet passed; refund deferred");
                    return Ok(());
                }
                let key = match self.keys.secret(ChainId::Btc) {
                    Ok(key) => key,
                    Err(e) => {
                        // Missing key material: the refund cannot be built.
                        self.commit(&swap.swap_id, &[SwapState::RefundPending], move |swap, now| {
                            swap.push_timeline(
                                now,
                                SwapState::BtcRefundUnrecoverable,
                                "btc refund unbuildable: key material missing",
                            );
                            swap.state = SwapState::BtcRefundUnrecoverable;
                            Ok(())
                        })
                        .await?;
                        return Err(EngineError::UnrecoverableRefund {
                            chain: ChainId::Btc,
                            reason: e.to_string(),
                        });
                    }
                };
                let params = btc_script::BtcHtlcParams {
                    hashlocks: swap.hashlocks,
                    claim_pubkey: parse_btc_pubkey(&leg.claim_pubkey)?,
                    refund_pubkey: parse_btc_pubkey(&leg.refund_pubkey)?,
                    timelock_height: u32::try_from(leg.core.timelock)
                        .map_err(|_| EngineError::InvariantViolation("btc timelock overflow".into()))?,
                };
                let refund_to = bitcoin::Address::p2wpkh(
                    &bitcoin::PublicKey::new(self.keys.public(ChainId::Btc)?),
                    self.network,
                )
                .map_err(|e| EngineError::InvariantViolation(e.to_string()))?;
                let value = leg.core.amount;
                let txid = {
                    let _wallet = self.wallet_lock(ChainId::Btc).lock().await;
                    let fee = self
                        .chains
                        .btc
                        .estimate_spend_fee()
                        .await
                        .map_err(|e| EngineError::chain(ChainId::Btc, e))?;
                    let tx = btc_script::build_refund_tx(
                        &outpoint, value, fee, &params, &refund_to, key,
                    )?;
                    let raw = bitcoin::consensus::encode::serialize(&tx);
                    self.chains
                        .btc
                        .broadcast(&raw)
                        .await
                        .map_err(|e| EngineError::chain(ChainId::Btc, e))?
                };
                self.commit(&swap.swap_id, &[SwapState::RefundPending], move |swap, now| {
                    if let Some(leg) = swap.btc_leg.as_mut() {
                        leg.core_mut().refund_evidence = Some(ChainEvidence::unconfirmed(&txid));
                    }
                    swap.push_timeline(now, SwapState::RefundPending, format!("btc refund broadcast: {txid}"));
                    Ok(())
                })
                .await
            }
        }
    }

    async fn do_notify_m1_locked(&self, swap: &Swap) -> Result<(), EngineError> {
        let RoutingMode::PerLeg { peer_url, .. } = &swap.routing else {
            return Ok(());
        };
        let leg = swap
            .m1_leg
            .as_ref()
            .and_then(HtlcLeg::as_utxo)
            .ok_or_else(|| EngineError::StateConflict("missing m1 leg".into()))?;
        let body = M1LockedNotification {
            outpoint: leg
                .outpoint
                .clone()
                .ok_or_else(|| EngineError::StateConflict("m1 leg has no outpoint".into()))?,
            amount_sats: leg.core.amount,
            expiry_height: leg.core.timelock,
        };
        match self.notifier.m1_locked(peer_url, &swap.swap_id, &body).await {
            Ok(()) => {
                self.commit(&swap.swap_id, &[SwapState::M1LockedForLpOut], |swap, now| {
                    swap.m1_notified = true;
                    swap.push_timeline(now, SwapState::M1LockedForLpOut, "peer notified of m1 lock");
                    Ok(())
                })
                .await
            }
            Err(e) => {
                warn!(swap_id = %swap.swap_id, error = %e, "m1-locked notify exhausted");
                self.park_unreachable(&swap.swap_id).await
            }
        }
    }

    async fn do_notify_secrets(&self, swap: &Swap) -> Result<(), EngineError> {
        let RoutingMode::PerLeg { peer_url, .. } = &swap.routing else {
            return Ok(());
        };
        let secrets = swap
            .secrets
            .as_array()
            .ok_or_else(|| EngineError::StateConflict("secrets incomplete".into()))?;
        let claim_txid = swap
            .m1_leg
            .as_ref()
            .and_then(|l| l.core().claim_evidence.as_ref())
            .map(|e| e.txid.clone())
            .unwrap_or_default();
        let body = BtcClaimedNotification {
            claim_txid,
            s_user: secrets[0],
            s_lp1: secrets[1],
            s_lp2: secrets[2],
        };
        match self.notifier.btc_claimed(peer_url, &swap.swap_id, &body).await {
            Ok(()) => {
                self.commit(
                    &swap.swap_id,
                    &[SwapState::M1ClaimedFromLpIn, SwapState::Completed],
                    |swap, now| {
                        swap.secrets_notified = true;
                        let state = swap.state;
                        swap.push_timeline(now, state, "secrets handed back to peer");
                        Ok(())
                    },
                )
                .await
            }
            Err(e) => {
                warn!(swap_id = %swap.swap_id, error = %e, "secret hand-back exhausted");
                self.park_unreachable(&swap.swap_id).await
            }
        }
    }

    async fn park_unreachable(&self, swap_id: &str) -> Result<(), EngineError> {
        let lock = self.swap_lock(swap_id);
        let _guard = lock.lock().await;
        let mut swap = self
            .store
            .get(swap_id)
            .await
            .ok_or_else(|| EngineError::UnknownSwap(swap_id.to_string()))?;
        if swap.state.is_terminal() || swap.state == SwapState::PeerUnreachable {
            return Ok(());
        }
        swap.resume_state = Some(swap.state);
        swap.state = SwapState::PeerUnreachable;
        swap.push_timeline(unix_now(), SwapState::PeerUnreachable, "peer notify budget exhausted");
        self.store.upsert(swap).await?;
        Ok(())
    }

    async fn park_broken(&self, swap_id: &str, error: &EngineError) -> Result<(), EngineError> {
        let lock = self.swap_lock(swap_id);
        let _guard = lock.lock().await;
        let mut swap = self
            .store
            .get(swap_id)
            .await
            .ok_or_else(|| EngineError::UnknownSwap(swap_id.to_string()))?;
        if swap.state.is_terminal()
            || matches!(
                swap.state,
                SwapState::LegBroken | SwapState::BtcRefundUnrecoverable
            )
        {
            return Ok(());
        }
        swap.resume_state = Some(swap.state);
        swap.state = SwapState::LegBroken;
        swap.push_timeline(unix_now(), SwapState::LegBroken, format!("leg broken: {error}"));
        self.store.upsert(swap).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Operator commands
    // ------------------------------------------------------------------

    /// Operator force-fail. Refused once any leg carries on-chain funding.
    pub async fn force_fail(&self, swap_id: &str, reason: &str) -> Result<Swap, EngineError> {
        let lock = self.swap_lock(swap_id);
        let _guard = lock.lock().await;
        let mut swap = self
            .store
            .get(swap_id)
            .await
            .ok_or_else(|| EngineError::UnknownSwap(swap_id.to_string()))?;
        if swap.state.is_terminal() {
            return Err(EngineError::StateConflict(format!(
                "swap already terminal: {}",
                swap.state
            )));
        }
        if !swap.effective_state().is_prefunding() || swap.any_leg_funded() {
            return Err(EngineError::StateConflict(
                "force-fail refused: swap has on-chain funding".into(),
            ));
        }
        self.fail_swap(&mut swap, reason).await?;
        Ok(swap)
    }

    async fn fail_swap(&self, swap: &mut Swap, reason: &str) -> Result<(), EngineError> {
        let now = unix_now();
        swap.state = SwapState::Failed;
        swap.terminal_at = Some(now);
        swap.push_timeline(now, SwapState::Failed, reason);
        swap.reservations.clear();
        self.inventory.release(&swap.swap_id).await;
        self.registry.unregister_swap(&swap.swap_id);
        self.store.upsert(swap.clone()).await?;
        Ok(())
    }

    fn mark_refunded(&self, swap: &mut Swap, now: u64) -> Result<(), EngineError> {
        self.transition(swap, SwapState::Refunded, "all lp legs refunded", now)?;
        Ok(())
    }

    fn complete(&self, swap: &mut Swap, note: String, now: u64) -> Result<(), EngineError> {
        self.transition(swap, SwapState::Completed, note, now)
    }

    /// Validated state transition; terminal transitions release inventory
    /// and watcher subscriptions.
    fn transition(
        &self,
        swap: &mut Swap,
        to: SwapState,
        note: impl Into<String>,
        now: u64,
    ) -> Result<(), EngineError> {
        let from = swap.effective_state();
        if !legal_transition(from, to) {
            return Err(EngineError::InvalidTransition { from, to });
        }
        swap.state = to;
        swap.resume_state = None;
        swap.push_timeline(now, to, note);
        if to.is_terminal() {
            swap.terminal_at = Some(now);
            swap.reservations.clear();
            let swap_id = swap.swap_id.clone();
            self.registry.unregister_swap(&swap_id);
            let inventory = Arc::clone(&self.inventory);
            tokio::spawn(async move { inventory.release(&swap_id).await });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------

    /// Re-register watcher subscriptions for every non-terminal swap; the
    /// watchers then re-derive each leg's status from the chain before the
    /// engine accepts new events for it.
    pub async fn resume(&self) -> Result<usize, EngineError> {
        let swaps = self.store.non_terminal().await;
        for swap in &swaps {
            self.register_initial_watches(swap);
            for chain in [ChainId::Btc, ChainId::M1, ChainId::Evm] {
                if let Some(leg) = swap.leg(chain) {
                    if let Some(utxo) = leg.as_utxo() {
                        if let Some(outpoint) = utxo.outpoint.clone() {
                            self.registry.register(
                                chain,
                                &swap.swap_id,
                                WatchTarget::Outpoint {
                                    outpoint,
                                    expiry_height: utxo.core.timelock,
                                    hashlocks: utxo.core.hashlocks,
                                },
                            );
                        }
                    }
                    if let Some(evm) = leg.as_evm() {
                        if let Some(id) = evm.htlc_id {
                            self.registry.register(
                                ChainId::Evm,
                                &swap.swap_id,
                                WatchTarget::EvmHtlc {
                                    id,
                                    expiry_ts: evm.core.timelock,
                                },
                            );
                        }
                    }
                }
            }
            info!(swap_id = %swap.swap_id, state = %swap.state, "resume scan scheduled");
        }
        Ok(swaps.len())
    }

    /// One pass of the periodic tick: every non-terminal swap re-derives
    /// its pending action, retrying anything a transient failure or a
    /// missed notification left undone.
    pub async fn tick_all(&self) {
        let now = unix_now();
        for swap in self.store.non_terminal().await {
            if let Err(e) = self
                .handle_event(&swap.swap_id, EngineEvent::Tick { now })
                .await
            {
                warn!(swap_id = %swap.swap_id, error = %e, "tick failed");
            }
        }
    }

    /// Archive terminal swaps older than the configured grace period.
    pub async fn archive_terminal(&self, max_age_secs: u64) -> Result<usize, EngineError> {
        Ok(self.store.archive_terminal(unix_now(), max_age_secs).await?)
    }
}

fn parse_btc_pubkey(raw: &str) -> Result<bitcoin::PublicKey, EngineError> {
    raw.parse::<bitcoin::PublicKey>()
        .map_err(|e| EngineError::InvariantViolation(format!("bad pubkey: {e}")))
}

fn parse_secp_pubkey(raw: &str) -> Result<secp256k1::PublicKey, EngineError> {
    raw.parse::<secp256k1::PublicKey>()
        .map_err(|e| EngineError::InvariantViolation(format!("bad pubkey: {e}")))
}

/// Where a leg rollback rewinds the swap to when a reorg un-confirms its
/// latest evidence.
fn rollback_state(state: SwapState, chain: ChainId, direction: Direction) -> SwapState {
    use SwapState::*;
    match (state, chain, direction) {
        // Orphaned BTC sweep: back to the M1-claimed position, the sweep
        // will be re-broadcast with the already-known secrets.
        (Completed | BtcClaimed, ChainId::Btc, Direction::Forward) => M1SelfClaimed,
        (Completed | UsdcClaimed, ChainId::Evm, Direction::Reverse) => BtcClaimedByUser,
        (Completed | M1ClaimedFromLpIn, ChainId::M1, _) => UsdcClaimedByUser,
        (M1SelfClaimed, ChainId::M1, Direction::Forward) => UsdcClaimedByUser,
        (UsdcClaimedByUser, ChainId::Evm, Direction::Forward) => UsdcLocked,
        (BtcClaimedByUser, ChainId::Btc, Direction::Reverse) => BtcLocked,
        // Orphaned funding: back to the watch state.
        (BtcFunded, ChainId::Btc, Direction::Forward) => BtcFundingSeen,
        (UsdcFunded, ChainId::Evm, Direction::Reverse) => UsdcFundingSeen,
        (other, _, _) => other,
    }
}

/// Legal swap-state transitions outside reorg rollbacks.
fn legal_transition(from: SwapState, to: SwapState) -> bool {
    use SwapState::*;
    if from == to {
        return true;
    }
    matches!(
        (from, to),
        (Init, AwaitingBtc | AwaitingUsdc | M1LockedSeen | Failed)
            | (AwaitingBtc, BtcFundingSeen | BtcFunded | Failed)
            | (BtcFundingSeen, BtcFunded | Failed)
            | (BtcFunded, M1Locked)
            | (M1Locked, UsdcLocked | M1LockedForLpOut | BtcLocked | RefundPending)
            | (UsdcLocked, UsdcClaimedByUser | RefundPending)
            | (UsdcClaimedByUser, M1SelfClaimed | M1ClaimedFromLpIn)
            | (M1SelfClaimed, BtcClaimed | RefundPending)
            | (BtcClaimed, Completed)
            | (AwaitingUsdc, UsdcFundingSeen | UsdcFunded | Failed)
            | (UsdcFundingSeen, UsdcFunded | Failed)
            | (UsdcFunded, M1Locked)
            | (BtcLocked, BtcClaimedByUser | RefundPending)
            | (BtcClaimedByUser, UsdcClaimed)
            | (UsdcClaimed, Completed)
            | (M1LockedSeen, UsdcLocked | RefundPending)
            | (M1LockedForLpOut, BtcClaimed | RefundPending | PeerUnreachable)
            | (M1ClaimedFromLpIn, Completed | PeerUnreachable)
            | (RefundPending, Refunded | BtcClaimed | UsdcClaimed | BtcRefundUnrecoverable)
            | (LegBroken, RefundPending | Failed)
            | (BtcRefundUnrecoverable, Refunded | Failed)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_exits() {
        use SwapState::*;
        let all = [
            Init,
            AwaitingBtc,
            BtcFundingSeen,
            BtcFunded,
            M1Locked,
            UsdcLocked,
            UsdcClaimedByUser,
            M1SelfClaimed,
            BtcClaimed,
            AwaitingUsdc,
            UsdcFundingSeen,
            UsdcFunded,
            BtcLocked,
            BtcClaimedByUser,
            UsdcClaimed,
            M1LockedForLpOut,
            M1LockedSeen,
            M1ClaimedFromLpIn,
            RefundPending,
            PeerUnreachable,
            BtcRefundUnrecoverable,
            LegBroken,
            Completed,
            Refunded,
            Failed,
        ];
        for terminal in [Completed, Refunded, Failed] {
            for target in all {
                if target != terminal {
                    assert!(
                        !legal_transition(terminal, target),
                        "{terminal} -> {target} must be illegal"
                    );
                }
            }
        }
    }

    #[test]
    fn happy_path_transitions_are_legal() {
        use SwapState::*;
        let forward = [
            AwaitingBtc,
            BtcFundingSeen,
            BtcFunded,
            M1Locked,
            UsdcLocked,
            UsdcClaimedByUser,
            M1SelfClaimed,
            BtcClaimed,
            Completed,
        ];
        for pair in forward.windows(2) {
            assert!(legal_transition(pair[0], pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        let reverse = [
            AwaitingUsdc,
            UsdcFundingSeen,
            UsdcFunded,
            M1Locked,
            BtcLocked,
            BtcClaimedByUser,
            UsdcClaimed,
            Completed,
        ];
        for pair in reverse.windows(2) {
            assert!(legal_transition(pair[0], pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn reorg_rollback_targets() {
        assert_eq!(
            rollback_state(SwapState::Completed, ChainId::Btc, Direction::Forward),
            SwapState::M1SelfClaimed
        );
        assert_eq!(
            rollback_state(SwapState::BtcFunded, ChainId::Btc, Direction::Forward),
            SwapState::BtcFundingSeen
        );
        assert_eq!(
            rollback_state(SwapState::Completed, ChainId::Evm, Direction::Reverse),
            SwapState::BtcClaimedByUser
        );
    }
}
