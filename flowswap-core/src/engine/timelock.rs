//! Timelock planning and safety-order validation.
//!
//! Along the payment direction each hop's timelock must undercut the
//! previous hop's by at least the upstream chain's safety margin, so the
//! LP can always claim upstream after claiming downstream. Heights and
//! timestamps are compared through the configured block intervals.

use crate::config::TimelockConfig;
use crate::error::EngineError;
use crate::types::Direction;

/// Absolute timelocks for the three legs of one swap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimelockPlan {
    pub btc_height: u64,
    pub m1_height: u64,
    pub evm_ts: u64,
}

fn blocks_for(secs: u64, block_secs: u64) -> u64 {
    secs.div_ceil(block_secs)
}

/// Allocate timelocks from the downstream-most leg outward: the final leg
/// gets its own chain's margin as the claim window, and every upstream leg
/// adds its margin on top of the whole downstream window.
pub fn plan(
    config: &TimelockConfig,
    direction: Direction,
    btc_tip: u64,
    m1_tip: u64,
    now: u64,
) -> TimelockPlan {
    // Each upstream window builds on the *rounded* downstream window so
    // block-granularity rounding always lands on the safe side.
    match direction {
        Direction::Forward => {
            // BTC (upstream) -> M1 -> EVM (downstream).
            let evm_window = config.evm_margin_secs;
            let m1_blocks = blocks_for(
                evm_window + config.m1_margin_blocks * config.m1_block_secs,
                config.m1_block_secs,
            );
            let m1_window = m1_blocks * config.m1_block_secs;
            let btc_blocks = blocks_for(
                m1_window + config.btc_margin_blocks * config.btc_block_secs,
                config.btc_block_secs,
            );
            TimelockPlan {
                btc_height: btc_tip + btc_blocks,
                m1_height: m1_tip + m1_blocks,
                evm_ts: now + evm_window,
            }
        }
        Direction::Reverse => {
            // EVM (upstream) -> M1 -> BTC (downstream).
            let btc_blocks = config.btc_margin_blocks;
            let btc_window = btc_blocks * config.btc_block_secs;
            let m1_blocks = blocks_for(
                btc_window + config.m1_margin_blocks * config.m1_block_secs,
                config.m1_block_secs,
            );
            let m1_window = m1_blocks * config.m1_block_secs;
            TimelockPlan {
                btc_height: btc_tip + btc_blocks,
                m1_height: m1_tip + m1_blocks,
                evm_ts: now + m1_window + config.evm_margin_secs,
            }
        }
    }
}

/// Estimated seconds until each leg's timelock, from current tips.
fn windows(
    plan: &TimelockPlan,
    btc_tip: u64,
    m1_tip: u64,
    now: u64,
    config: &TimelockConfig,
) -> (u64, u64, u64) {
    let btc = plan.btc_height.saturating_sub(btc_tip) * config.btc_block_secs;
    let m1 = plan.m1_height.saturating_sub(m1_tip) * config.m1_block_secs;
    let evm = plan.evm_ts.saturating_sub(now);
    (btc, m1, evm)
}

/// Check the monotonic safety order. Re-run before every lock broadcast;
/// failing here is an invariant violation, not a retryable condition.
pub fn validate(
    plan: &TimelockPlan,
    direction: Direction,
    btc_tip: u64,
    m1_tip: u64,
    now: u64,
    config: &TimelockConfig,
) -> Result<(), EngineError> {
    let (btc, m1, evm) = windows(plan, btc_tip, m1_tip, now, config);
    let btc_margin = config.btc_margin_blocks * config.btc_block_secs;
    let m1_margin = config.m1_margin_blocks * config.m1_block_secs;
    let ok = match direction {
        Direction::Forward => btc >= m1 + btc_margin && m1 >= evm + m1_margin,
        Direction::Reverse => evm >= m1 + config.evm_margin_secs && m1 >= btc + m1_margin,
    };
    if ok {
        Ok(())
    } else {
        Err(EngineError::InvariantViolation(format!(
            "timelock safety order broken: btc {btc}s, m1 {m1}s, evm {evm}s"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn forward_plan_validates() {
        let config = TimelockConfig::default();
        let plan = plan_at(&config, Direction::Forward);
        validate(&plan, Direction::Forward, 800_000, 900_000, 1_700_000_000, &config).unwrap();
        assert!(plan.btc_height > 800_000);
        assert!(plan.m1_height > 900_000);
    }

    #[test]
    fn reverse_plan_validates() {
        let config = TimelockConfig::default();
        let plan = plan_at(&config, Direction::Reverse);
        validate(&plan, Direction::Reverse, 800_000, 900_000, 1_700_000_000, &config).unwrap();
    }

    #[test]
    fn stale_plan_fails_validation() {
        let config = TimelockConfig::default();
        let plan = plan_at(&config, Direction::Forward);
        // A day of BTC blocks later the upstream window has eroded.
        assert!(validate(
            &plan,
            Direction::Forward,
            800_000 + 144,
            900_000,
            1_700_000_000,
            &config
        )
        .is_err());
    }

    fn plan_at(config: &TimelockConfig, direction: Direction) -> TimelockPlan {
        plan(config, direction, 800_000, 900_000, 1_700_000_000)
    }

    proptest! {
        #[test]
        fn plans_always_satisfy_safety_order(
            btc_tip in 1_000u64..2_000_000,
            m1_tip in 1_000u64..5_000_000,
            now in 1_600_000_000u64..1_900_000_000,
            forward in any::<bool>(),
        ) {
            let config = TimelockConfig::default();
            let direction = if forward { Direction::Forward } else { Direction::Reverse };
            let plan = plan(&config, direction, btc_tip, m1_tip, now);
            prop_assert!(validate(&plan, direction, btc_tip, m1_tip, now, &config).is_ok());
        }
    }
}
