//! End-to-end scenario tests for the swap engine, driven by hand-built
//! watcher events over in-memory chain clients.

mod common;

use common::*;

use flowswap_core::engine::events::EngineEvent;
use flowswap_core::engine::InitSwapRequest;
use flowswap_core::crypto::sha256;
use flowswap_core::types::{QuoteTerms, RoutingMode};
use flowswap_core::{Asset, ChainId, Direction, EngineError, LegRole, SwapState};

const S_USER: [u8; 32] = [7u8; 32];

fn forward_request() -> InitSwapRequest {
    InitSwapRequest {
        direction: Direction::Forward,
        routing: RoutingMode::SingleLp,
        from_amount: 100_000,
        quote: QuoteTerms {
            rate_num: 600_000_000,
            rate_den: 100_000_000,
            spread_bps: 30,
            protocol_fee: 1_000,
        },
        h_user: sha256(&S_USER),
        h_lp1: None,
        h_lp2: None,
        user_refund_address: "bcrt1quserrefund".into(),
        user_payout_address: "0x4444444444444444444444444444444444444444".into(),
        user_btc_pubkey: pubkey_hex(9),
        peer_m1_pubkey: None,
    }
}

async fn settle_background_releases() {
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
}

/// Drive a forward swap from init to `usdc_locked` and return its id plus
/// the persisted LP preimages.
async fn forward_to_usdc_locked(fx: &Fixture) -> (String, [u8; 32], [u8; 32]) {
    let swap = fx.engine.init_swap(forward_request()).await.unwrap();
    let id = swap.swap_id.clone();
    assert_eq!(swap.state, SwapState::AwaitingBtc);
    assert_eq!(swap.to_amount, 597_200);

    fx.engine
        .handle_event(
            &id,
            EngineEvent::FundingSeen {
                chain: ChainId::Btc,
                txid: "ab".repeat(32),
                outpoint: Some(format!("{}:0", "ab".repeat(32))),
                amount: 100_000,
            },
        )
        .await
        .unwrap();
    assert_eq!(fx.store.get(&id).await.unwrap().state, SwapState::BtcFundingSeen);

    fx.engine
        .handle_event(
            &id,
            EngineEvent::FundingConfirmed {
                chain: ChainId::Btc,
                txid: "ab".repeat(32),
                outpoint: Some(format!("{}:0", "ab".repeat(32))),
                amount: 100_000,
                height: 800_001,
                block_hash: "hash800001".into(),
                confirmations: 1,
            },
        )
        .await
        .unwrap();
    // 100k sats needs one confirmation; the engine locks M1 right away.
    let swap = fx.store.get(&id).await.unwrap();
    assert_eq!(swap.state, SwapState::M1Locked);
    assert_eq!(fx.m1.funded.lock().unwrap().len(), 1);

    fx.engine
        .handle_event(
            &id,
            EngineEvent::FundingConfirmed {
                chain: ChainId::M1,
                txid: "cd".repeat(32),
                outpoint: Some(format!("{}:0", "cd".repeat(32))),
                amount: 100_000,
                height: 900_002,
                block_hash: "hash900002".into(),
                confirmations: 1,
            },
        )
        .await
        .unwrap();
    let swap = fx.store.get(&id).await.unwrap();
    assert_eq!(swap.state, SwapState::UsdcLocked);
    assert_eq!(fx.evm.sent.lock().unwrap().len(), 1);

    fx.engine
        .handle_event(
            &id,
            EngineEvent::HtlcCreated {
                id: [0xc1; 32],
                txid: "0xcreate".into(),
                height: 19_000_001,
                block_hash: "ehash19000001".into(),
                amount: 597_200,
                recipient: "0x4444444444444444444444444444444444444444".into(),
                timelock: fx
                    .store
                    .get(&id)
                    .await
                    .unwrap()
                    .evm_leg
                    .as_ref()
                    .unwrap()
                    .core()
                    .timelock,
            },
        )
        .await
        .unwrap();
    let swap = fx.store.get(&id).await.unwrap();
    assert_eq!(swap.state, SwapState::UsdcLocked);
    // The LP preimages became claimable and are now persisted.
    let s_lp1 = swap.secrets.lp1.unwrap();
    let s_lp2 = swap.secrets.lp2.unwrap();
    assert_eq!(sha256(&s_lp1), swap.hashlocks.lp1);
    assert_eq!(sha256(&s_lp2), swap.hashlocks.lp2);
    (id, s_lp1, s_lp2)
}

/// Scenario A: forward happy path ends `completed` with the quoted
/// amount and no reservations left.
#[tokio::test]
async fn forward_happy_path() {
    let fx = fixture();
    let (id, s_lp1, s_lp2) = forward_to_usdc_locked(&fx).await;

    fx.engine
        .handle_event(
            &id,
            EngineEvent::ClaimObserved {
                chain: ChainId::Evm,
                txid: "0xclaim".into(),
                height: Some(19_000_010),
                block_hash: Some("ehash19000010".into()),
                confirmations: 1,
                preimages: Some([S_USER, s_lp1, s_lp2]),
            },
        )
        .await
        .unwrap();
    let swap = fx.store.get(&id).await.unwrap();
    // The M1 sweep is broadcast in the same pass.
    assert_eq!(swap.state, SwapState::M1SelfClaimed);
    assert!(swap.secrets.all_known());
    assert_eq!(fx.m1.broadcasts.lock().unwrap().len(), 1);

    // Tick chains the BTC sweep.
    fx.engine.handle_event(&id, EngineEvent::Tick { now: 0 }).await.unwrap();
    let swap = fx.store.get(&id).await.unwrap();
    assert_eq!(swap.state, SwapState::BtcClaimed);
    let sweep_txid = fx.btc.last_broadcast_txid().unwrap();

    fx.engine
        .handle_event(
            &id,
            EngineEvent::ClaimObserved {
                chain: ChainId::Btc,
                txid: sweep_txid,
                height: Some(800_010),
                block_hash: Some("hash800010".into()),
                confirmations: 1,
                preimages: None,
            },
        )
        .await
        .unwrap();
    let swap = fx.store.get(&id).await.unwrap();
    assert_eq!(swap.state, SwapState::Completed);
    assert!(swap.terminal_at.is_some());
    assert!(swap.reservations.is_empty());

    settle_background_releases().await;
    assert_eq!(fx.inventory.reserved(Asset::M1).await, 0);
    assert_eq!(fx.inventory.reserved(Asset::Usdc).await, 0);
    assert!(fx.registry.is_empty(ChainId::Btc));
    assert!(fx.registry.is_empty(ChainId::M1));
    assert!(fx.registry.is_empty(ChainId::Evm));
}

/// Scenario B: the user never funds. Expiry alone does nothing on-chain;
/// operator force-fail releases the reservations.
#[tokio::test]
async fn user_abandons_after_init() {
    let fx = fixture();
    let swap = fx.engine.init_swap(forward_request()).await.unwrap();
    let id = swap.swap_id.clone();
    assert!(fx.inventory.reserved(Asset::M1).await > 0);

    let expiry = swap.btc_leg.as_ref().unwrap().core().timelock;
    fx.engine
        .handle_event(
            &id,
            EngineEvent::TimelockExpired {
                chain: ChainId::Btc,
                timelock: expiry,
            },
        )
        .await
        .unwrap();
    let swap = fx.store.get(&id).await.unwrap();
    assert_eq!(swap.state, SwapState::AwaitingBtc);
    assert_eq!(fx.m1.funded.lock().unwrap().len(), 0);

    let swap = fx.engine.force_fail(&id, "user never funded").await.unwrap();
    assert_eq!(swap.state, SwapState::Failed);
    assert_eq!(fx.inventory.reserved(Asset::M1).await, 0);
    assert_eq!(fx.inventory.reserved(Asset::Usdc).await, 0);
}

/// Force-fail must be refused once a leg has on-chain funding.
#[tokio::test]
async fn force_fail_refused_after_funding() {
    let fx = fixture();
    let (id, _, _) = forward_to_usdc_locked(&fx).await;
    let err = fx.engine.force_fail(&id, "nope").await.unwrap_err();
    assert!(matches!(err, EngineError::StateConflict(_)));
}

/// Scenario C: LP locked both outbound legs but the user never claims.
/// The engine refunds the EVM HTLC, then the M1 HTLC, and the swap ends
/// `refunded`. The BTC HTLC is on the user's refund branch and stays
/// untouched.
#[tokio::test]
async fn lp_funds_then_user_never_claims() {
    let fx = fixture();
    let (id, _, _) = forward_to_usdc_locked(&fx).await;

    let evm_expiry = fx
        .store
        .get(&id)
        .await
        .unwrap()
        .evm_leg
        .as_ref()
        .unwrap()
        .core()
        .timelock;
    // Chain time passes the EVM timelock; M1 tip passes its height.
    fx.evm
        .timestamp
        .store(evm_expiry + 1, std::sync::atomic::Ordering::SeqCst);
    let m1_expiry = fx
        .store
        .get(&id)
        .await
        .unwrap()
        .m1_leg
        .as_ref()
        .unwrap()
        .core()
        .timelock;
    fx.m1.tip.store(m1_expiry + 1, std::sync::atomic::Ordering::SeqCst);

    fx.engine
        .handle_event(
            &id,
            EngineEvent::TimelockExpired {
                chain: ChainId::Evm,
                timelock: evm_expiry,
            },
        )
        .await
        .unwrap();
    let swap = fx.store.get(&id).await.unwrap();
    assert_eq!(swap.state, SwapState::RefundPending);
    // EVM refund call went out.
    assert_eq!(fx.evm.sent.lock().unwrap().len(), 2);
    let refund_txid = fx.evm.last_tx_hash().unwrap();

    fx.engine
        .handle_event(
            &id,
            EngineEvent::RefundObserved {
                chain: ChainId::Evm,
                txid: refund_txid,
                height: Some(19_000_500),
                confirmations: 1,
            },
        )
        .await
        .unwrap();
    // The M1 refund follows in the same pass.
    assert_eq!(fx.m1.broadcasts.lock().unwrap().len(), 1);
    let m1_refund_txid = fx.m1.last_broadcast_txid().unwrap();

    fx.engine
        .handle_event(
            &id,
            EngineEvent::RefundObserved {
                chain: ChainId::M1,
                txid: m1_refund_txid,
                height: Some(m1_expiry + 2),
                confirmations: 1,
            },
        )
        .await
        .unwrap();
    let swap = fx.store.get(&id).await.unwrap();
    assert_eq!(swap.state, SwapState::Refunded);
    assert!(swap.btc_leg.as_ref().unwrap().core().funded);
    assert!(!swap.btc_leg.as_ref().unwrap().core().refunded);

    settle_background_releases().await;
    assert_eq!(fx.inventory.reserved(Asset::M1).await, 0);
}

/// Scenario D: a reorg orphans the BTC sweep after `completed`. The engine
/// rolls back, re-broadcasts with the known secrets and completes again;
/// the audit trail keeps both the rollback and the re-claim.
#[tokio::test]
async fn late_reorg_after_completion() {
    let fx = fixture();
    let (id, s_lp1, s_lp2) = forward_to_usdc_locked(&fx).await;

    fx.engine
        .handle_event(
            &id,
            EngineEvent::ClaimObserved {
                chain: ChainId::Evm,
                txid: "0xclaim".into(),
                height: Some(19_000_010),
                block_hash: Some("ehash19000010".into()),
                confirmations: 1,
                preimages: Some([S_USER, s_lp1, s_lp2]),
            },
        )
        .await
        .unwrap();
    fx.engine.handle_event(&id, EngineEvent::Tick { now: 0 }).await.unwrap();
    let sweep_txid = fx.btc.last_broadcast_txid().unwrap();
    fx.engine
        .handle_event(
            &id,
            EngineEvent::ClaimObserved {
                chain: ChainId::Btc,
                txid: sweep_txid.clone(),
                height: Some(800_010),
                block_hash: Some("hash800010".into()),
                confirmations: 1,
                preimages: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(fx.store.get(&id).await.unwrap().state, SwapState::Completed);

    // Blocks from 800_010 get orphaned.
    fx.engine
        .handle_event(
            &id,
            EngineEvent::Reorg {
                chain: ChainId::Btc,
                height: 800_010,
                new_hash: "hash800010b".into(),
            },
        )
        .await
        .unwrap();
    let swap = fx.store.get(&id).await.unwrap();
    // Rolled back and the sweep was re-broadcast immediately.
    assert_eq!(swap.state, SwapState::BtcClaimed);
    assert_eq!(fx.btc.broadcasts.lock().unwrap().len(), 2);

    fx.engine
        .handle_event(
            &id,
            EngineEvent::ClaimObserved {
                chain: ChainId::Btc,
                txid: sweep_txid,
                height: Some(800_011),
                block_hash: Some("hash800011b".into()),
                confirmations: 1,
                preimages: None,
            },
        )
        .await
        .unwrap();
    let swap = fx.store.get(&id).await.unwrap();
    assert_eq!(swap.state, SwapState::Completed);
    let notes: Vec<&str> = swap.timeline.iter().map(|t| t.note.as_str()).collect();
    assert!(notes.iter().any(|n| n.contains("reorg")));
    assert!(notes.iter().filter(|n| n.contains("btc sweep confirmed")).count() >= 2);
}

/// Scenario E: per-leg LP_IN with an unreachable peer parks the swap; the
/// peer's on-chain claim later resumes and completes it.
#[tokio::test]
async fn per_leg_peer_outage_then_recovery() {
    let fx = fixture();
    let s_lp2 = [0x52u8; 32];
    let mut req = forward_request();
    req.routing = RoutingMode::PerLeg {
        role: LegRole::LpIn,
        // Nothing listens here; the notify budget burns out fast.
        peer_url: "http://127.0.0.1:1".into(),
    };
    req.h_lp2 = Some(sha256(&s_lp2));
    req.peer_m1_pubkey = Some(pubkey_hex(8));
    let swap = fx.engine.init_swap(req).await.unwrap();
    let id = swap.swap_id.clone();

    fx.engine
        .handle_event(
            &id,
            EngineEvent::FundingConfirmed {
                chain: ChainId::Btc,
                txid: "ab".repeat(32),
                outpoint: Some(format!("{}:0", "ab".repeat(32))),
                amount: 100_000,
                height: 800_001,
                block_hash: "hash800001".into(),
                confirmations: 1,
            },
        )
        .await
        .unwrap();
    assert_eq!(fx.store.get(&id).await.unwrap().state, SwapState::M1Locked);

    // The M1 lock confirms; the engine notifies the peer, exhausts the
    // retry budget and parks the swap.
    fx.engine
        .handle_event(
            &id,
            EngineEvent::FundingConfirmed {
                chain: ChainId::M1,
                txid: "cd".repeat(32),
                outpoint: Some(format!("{}:0", "cd".repeat(32))),
                amount: 100_000,
                height: 900_002,
                block_hash: "hash900002".into(),
                confirmations: 1,
            },
        )
        .await
        .unwrap();
    let swap = fx.store.get(&id).await.unwrap();
    assert_eq!(swap.state, SwapState::PeerUnreachable);
    assert_eq!(swap.resume_state, Some(SwapState::M1LockedForLpOut));
    let s_lp1 = swap.secrets.lp1.unwrap();

    // LP_OUT claims our M1 HTLC on-chain; the observation resumes the
    // swap and the revealed secrets drive the BTC sweep.
    fx.engine
        .handle_event(
            &id,
            EngineEvent::ClaimObserved {
                chain: ChainId::M1,
                txid: "ee".repeat(32),
                height: Some(900_010),
                block_hash: Some("hash900010".into()),
                confirmations: 1,
                preimages: Some([S_USER, s_lp1, s_lp2]),
            },
        )
        .await
        .unwrap();
    let swap = fx.store.get(&id).await.unwrap();
    assert_eq!(swap.state, SwapState::BtcClaimed);

    let sweep_txid = fx.btc.last_broadcast_txid().unwrap();
    fx.engine
        .handle_event(
            &id,
            EngineEvent::ClaimObserved {
                chain: ChainId::Btc,
                txid: sweep_txid,
                height: Some(800_020),
                block_hash: Some("hash800020".into()),
                confirmations: 1,
                preimages: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(fx.store.get(&id).await.unwrap().state, SwapState::Completed);
}

/// Scenario F: malformed init-leg with identical LP hashlocks is rejected
/// synchronously; nothing is created or reserved.
#[tokio::test]
async fn invariant_violation_on_duplicate_hashlocks() {
    let fx = fixture();
    let dup = sha256(b"same");
    let mut req = forward_request();
    req.routing = RoutingMode::PerLeg {
        role: LegRole::LpOut,
        peer_url: "http://127.0.0.1:1".into(),
    };
    req.h_lp1 = Some(dup);
    req.h_lp2 = Some(dup);
    req.peer_m1_pubkey = Some(pubkey_hex(8));
    let err = fx.engine.init_swap(req).await.unwrap_err();
    assert!(matches!(err, EngineError::InvariantViolation(_)));
    assert!(fx.store.list(None, 10).await.is_empty());
    assert_eq!(fx.inventory.reserved(Asset::Usdc).await, 0);
    assert_eq!(fx.inventory.reserved(Asset::M1).await, 0);
}

/// Reverse happy path: USDC -> BTC.
#[tokio::test]
async fn reverse_happy_path() {
    let fx = fixture();
    let req = InitSwapRequest {
        direction: Direction::Reverse,
        routing: RoutingMode::SingleLp,
        from_amount: 600_000,
        quote: QuoteTerms {
            rate_num: 1,
            rate_den: 6,
            spread_bps: 0,
            protocol_fee: 0,
        },
        h_user: sha256(&S_USER),
        h_lp1: None,
        h_lp2: None,
        user_refund_address: "0x5555555555555555555555555555555555555555".into(),
        user_payout_address: "bcrt1quserpayout".into(),
        user_btc_pubkey: pubkey_hex(9),
        peer_m1_pubkey: None,
    };
    let swap = fx.engine.init_swap(req).await.unwrap();
    let id = swap.swap_id.clone();
    assert_eq!(swap.state, SwapState::AwaitingUsdc);
    assert_eq!(swap.to_amount, 100_000);

    // User funds the EVM HTLC.
    fx.engine
        .handle_event(
            &id,
            EngineEvent::HtlcCreated {
                id: [0xc2; 32],
                txid: "0xusercreate".into(),
                height: 19_000_001,
                block_hash: "ehash19000001".into(),
                amount: 600_000,
                recipient: LP_EVM_ADDRESS.into(),
                timelock: swap.evm_leg.as_ref().unwrap().core().timelock,
            },
        )
        .await
        .unwrap();
    assert_eq!(fx.store.get(&id).await.unwrap().state, SwapState::M1Locked);

    fx.engine
        .handle_event(
            &id,
            EngineEvent::FundingConfirmed {
                chain: ChainId::M1,
                txid: "cd".repeat(32),
                outpoint: Some(format!("{}:0", "cd".repeat(32))),
                amount: 100_000,
                height: 900_002,
                block_hash: "hash900002".into(),
                confirmations: 1,
            },
        )
        .await
        .unwrap();
    let swap = fx.store.get(&id).await.unwrap();
    assert_eq!(swap.state, SwapState::BtcLocked);
    assert_eq!(fx.btc.funded.lock().unwrap().len(), 1);

    // LP's BTC payout HTLC confirms; the LP preimages go live.
    fx.engine
        .handle_event(
            &id,
            EngineEvent::FundingConfirmed {
                chain: ChainId::Btc,
                txid: "ab".repeat(32),
                outpoint: Some(format!("{}:0", "ab".repeat(32))),
                amount: 100_000,
                height: 800_002,
                block_hash: "hash800002".into(),
                confirmations: 1,
            },
        )
        .await
        .unwrap();
    let swap = fx.store.get(&id).await.unwrap();
    let s_lp1 = swap.secrets.lp1.unwrap();
    let s_lp2 = swap.secrets.lp2.unwrap();

    // User sweeps the BTC HTLC, revealing everything.
    fx.engine
        .handle_event(
            &id,
            EngineEvent::ClaimObserved {
                chain: ChainId::Btc,
                txid: "ff".repeat(32),
                height: Some(800_010),
                block_hash: Some("hash800010".into()),
                confirmations: 1,
                preimages: Some([S_USER, s_lp1, s_lp2]),
            },
        )
        .await
        .unwrap();
    let swap = fx.store.get(&id).await.unwrap();
    assert_eq!(swap.state, SwapState::UsdcClaimed);

    let claim_txid = fx.evm.last_tx_hash().unwrap();
    fx.engine
        .handle_event(
            &id,
            EngineEvent::ClaimObserved {
                chain: ChainId::Evm,
                txid: claim_txid,
                height: Some(19_000_020),
                block_hash: Some("ehash19000020".into()),
                confirmations: 1,
                preimages: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(fx.store.get(&id).await.unwrap().state, SwapState::Completed);
}

/// Once the downstream secrets are known, an expiring leg is swept, never
/// refunded, even though its timelock has passed.
#[tokio::test]
async fn claim_over_refund_preferred() {
    let fx = fixture();
    let (id, s_lp1, s_lp2) = forward_to_usdc_locked(&fx).await;

    fx.engine
        .handle_event(
            &id,
            EngineEvent::ClaimObserved {
                chain: ChainId::Evm,
                txid: "0xclaim".into(),
                height: Some(19_000_010),
                block_hash: Some("ehash19000010".into()),
                confirmations: 1,
                preimages: Some([S_USER, s_lp1, s_lp2]),
            },
        )
        .await
        .unwrap();
    assert_eq!(fx.store.get(&id).await.unwrap().state, SwapState::M1SelfClaimed);

    // The BTC leg's timelock passes before our sweep went out. Secrets are
    // known, so the engine claims rather than refunds.
    let expiry = fx
        .store
        .get(&id)
        .await
        .unwrap()
        .btc_leg
        .as_ref()
        .unwrap()
        .core()
        .timelock;
    fx.engine
        .handle_event(
            &id,
            EngineEvent::TimelockExpired {
                chain: ChainId::Btc,
                timelock: expiry,
            },
        )
        .await
        .unwrap();
    let swap = fx.store.get(&id).await.unwrap();
    assert_eq!(swap.state, SwapState::BtcClaimed);
    assert_eq!(fx.btc.broadcasts.lock().unwrap().len(), 1);
    assert!(swap
        .timeline
        .iter()
        .any(|t| t.note.contains("secrets known; claiming instead")));
}

/// Watcher delivery is at-least-once; replaying an event must not change
/// state or duplicate audit entries.
#[tokio::test]
async fn duplicate_events_are_idempotent() {
    let fx = fixture();
    let swap = fx.engine.init_swap(forward_request()).await.unwrap();
    let id = swap.swap_id.clone();

    let event = EngineEvent::FundingConfirmed {
        chain: ChainId::Btc,
        txid: "ab".repeat(32),
        outpoint: Some(format!("{}:0", "ab".repeat(32))),
        amount: 100_000,
        height: 800_001,
        block_hash: "hash800001".into(),
        confirmations: 1,
    };
    fx.engine.handle_event(&id, event.clone()).await.unwrap();
    let after_first = fx.store.get(&id).await.unwrap();

    fx.engine.handle_event(&id, event).await.unwrap();
    let after_second = fx.store.get(&id).await.unwrap();

    assert_eq!(after_first.state, after_second.state);
    assert_eq!(after_first.timeline.len(), after_second.timeline.len());
    // Only one M1 lock went out.
    assert_eq!(fx.m1.funded.lock().unwrap().len(), 1);
}
