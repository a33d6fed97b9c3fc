//! Block-based rate limiting of order placements and cancels.
//!
//! Counts are bucketed by block height, never by wall clock, so every node
//! that replays the same history holds the same counters. Admission either
//! records the operation or fails without touching state.

use crate::config::{MaxPerNBlocks, RateLimitConfig};
use crate::types::{BlockHeight, SubaccountId};
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RateLimitClass {
    ShortTermPlacement,
    StatefulPlacement,
    ShortTermCancellation,
}

impl fmt::Display for RateLimitClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RateLimitClass::ShortTermPlacement => "short-term placement",
            RateLimitClass::StatefulPlacement => "stateful placement",
            RateLimitClass::ShortTermCancellation => "short-term cancellation",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{class} rate of {count} for subaccount {subaccount_id} exceeds limit of {limit} over {num_blocks} blocks")]
pub struct RateLimitError {
    pub class: RateLimitClass,
    pub subaccount_id: SubaccountId,
    pub count: u32,
    pub limit: u32,
    pub num_blocks: u32,
}

/// Sliding windows over trailing blocks for one operation class.
#[derive(Debug, Clone)]
pub struct MultiBlockRateLimiter<K> {
    windows: Vec<MaxPerNBlocks>,
    max_blocks: u32,
    per_block: BTreeMap<BlockHeight, BTreeMap<K, u32>>,
}

impl<K: Ord + Copy> MultiBlockRateLimiter<K> {
    pub fn new(windows: &[MaxPerNBlocks]) -> Self {
        Self {
            windows: windows.to_vec(),
            max_blocks: windows.iter().map(|w| w.num_blocks).max().unwrap_or(0),
            per_block: BTreeMap::new(),
        }
    }

    /// Count for `key` over the `num_blocks` blocks ending at `height`.
    pub fn count(&self, key: &K, height: BlockHeight, num_blocks: u32) -> u32 {
        let oldest = BlockHeight(height.0.saturating_sub(num_blocks.saturating_sub(1)));
        self.per_block
            .range(oldest..=height)
            .filter_map(|(_, counts)| counts.get(key))
            .sum()
    }

    /// Records one operation unless any window would exceed its limit.
    /// On rejection returns (count including this one, limit, num_blocks).
    pub fn check_and_record(&mut self, key: K, height: BlockHeight) -> Result<(), (u32, u32, u32)> {
        for window in &self.windows {
            let count = self.count(&key, height, window.num_blocks) + 1;
            if count > window.limit {
                return Err((count, window.limit, window.num_blocks));
            }
        }
        if !self.windows.is_empty() {
            *self.per_block.entry(height).or_default().entry(key).or_default() += 1;
        }
        Ok(())
    }

    /// Drop buckets that no window can reach from `height` onward.
    pub fn prune(&mut self, height: BlockHeight) {
        let keep_from = BlockHeight(height.0.saturating_sub(self.max_blocks.saturating_sub(1)));
        self.per_block = self.per_block.split_off(&keep_from);
    }

    pub fn tracked_blocks(&self) -> usize {
        self.per_block.len()
    }
}

/// The three admission classes. Each class map is guarded on its own.
#[derive(Debug)]
pub struct BlockRateLimiter {
    short_term_orders: Mutex<MultiBlockRateLimiter<SubaccountId>>,
    stateful_orders: Mutex<MultiBlockRateLimiter<SubaccountId>>,
    short_term_cancels: Mutex<MultiBlockRateLimiter<SubaccountId>>,
}

impl BlockRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            short_term_orders: Mutex::new(MultiBlockRateLimiter::new(&config.short_term_orders)),
            stateful_orders: Mutex::new(MultiBlockRateLimiter::new(&config.stateful_orders)),
            short_term_cancels: Mutex::new(MultiBlockRateLimiter::new(&config.short_term_cancels)),
        }
    }

    fn limiter(&self, class: RateLimitClass) -> &Mutex<MultiBlockRateLimiter<SubaccountId>> {
        match class {
            RateLimitClass::ShortTermPlacement => &self.short_term_orders,
            RateLimitClass::StatefulPlacement => &self.stateful_orders,
            RateLimitClass::ShortTermCancellation => &self.short_term_cancels,
        }
    }

    pub fn admit(
        &self,
        class: RateLimitClass,
        subaccount_id: SubaccountId,
        height: BlockHeight,
    ) -> Result<(), RateLimitError> {
        self.limiter(class)
            .lock()
            .check_and_record(subaccount_id, height)
            .map_err(|(count, limit, num_blocks)| {
                debug!(
                    "rate limited class={} subaccount={} count={} limit={} blocks={}",
                    class, subaccount_id, count, limit, num_blocks
                );
                RateLimitError {
                    class,
                    subaccount_id,
                    count,
                    limit,
                    num_blocks,
                }
            })
    }

    /// Operations recorded for the subaccount in the last `num_blocks` blocks.
    pub fn count(&self, class: RateLimitClass, subaccount_id: SubaccountId, height: BlockHeight, num_blocks: u32) -> u32 {
        self.limiter(class).lock().count(&subaccount_id, height, num_blocks)
    }

    /// Called once per committed block, before the next block's admissions.
    pub fn prune(&self, next_height: BlockHeight) {
        self.short_term_orders.lock().prune(next_height);
        self.stateful_orders.lock().prune(next_height);
        self.short_term_cancels.lock().prune(next_height);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_per_two_blocks() -> RateLimitConfig {
        RateLimitConfig {
            short_term_orders: Vec::new(),
            stateful_orders: vec![MaxPerNBlocks { num_blocks: 2, limit: 1 }],
            short_term_cancels: Vec::new(),
        }
    }

    #[test]
    fn second_stateful_placement_in_window_rejected() {
        let limiter = BlockRateLimiter::new(&one_per_two_blocks());
        let alice = SubaccountId::new(1, 0);

        assert!(limiter.admit(RateLimitClass::StatefulPlacement, alice, BlockHeight(5)).is_ok());
        let err = limiter
            .admit(RateLimitClass::StatefulPlacement, alice, BlockHeight(6))
            .unwrap_err();
        assert_eq!(err.count, 2);
        assert_eq!(err.limit, 1);

        // block 5 has left the window
        limiter.prune(BlockHeight(7));
        assert!(limiter.admit(RateLimitClass::StatefulPlacement, alice, BlockHeight(7)).is_ok());
    }

    #[test]
    fn rejection_does_not_record() {
        let limiter = BlockRateLimiter::new(&one_per_two_blocks());
        let alice = SubaccountId::new(1, 0);
        limiter.admit(RateLimitClass::StatefulPlacement, alice, BlockHeight(1)).unwrap();
        assert!(limiter.admit(RateLimitClass::StatefulPlacement, alice, BlockHeight(1)).is_err());
        assert_eq!(limiter.count(RateLimitClass::StatefulPlacement, alice, BlockHeight(1), 2), 1);
    }

    #[test]
    fn classes_and_subaccounts_are_independent() {
        let config = RateLimitConfig {
            short_term_orders: vec![MaxPerNBlocks { num_blocks: 1, limit: 1 }],
            stateful_orders: vec![MaxPerNBlocks { num_blocks: 1, limit: 1 }],
            short_term_cancels: vec![MaxPerNBlocks { num_blocks: 1, limit: 1 }],
        };
        let limiter = BlockRateLimiter::new(&config);
        let alice = SubaccountId::new(1, 0);
        let bob = SubaccountId::new(2, 0);
        let h = BlockHeight(3);

        assert!(limiter.admit(RateLimitClass::ShortTermPlacement, alice, h).is_ok());
        assert!(limiter.admit(RateLimitClass::ShortTermCancellation, alice, h).is_ok());
        assert!(limiter.admit(RateLimitClass::StatefulPlacement, alice, h).is_ok());
        assert!(limiter.admit(RateLimitClass::ShortTermPlacement, bob, h).is_ok());
        assert!(limiter.admit(RateLimitClass::ShortTermPlacement, alice, h).is_err());
    }

    #[test]
    fn every_window_is_enforced() {
        let mut limiter: MultiBlockRateLimiter<u8> = MultiBlockRateLimiter::new(&[
            MaxPerNBlocks { num_blocks: 1, limit: 2 },
            MaxPerNBlocks { num_blocks: 10, limit: 3 },
        ]);
        assert!(limiter.check_and_record(0, BlockHeight(1)).is_ok());
        assert!(limiter.check_and_record(0, BlockHeight(1)).is_ok());
        assert_eq!(limiter.check_and_record(0, BlockHeight(1)), Err((3, 2, 1)));
        assert!(limiter.check_and_record(0, BlockHeight(2)).is_ok());
        assert_eq!(limiter.check_and_record(0, BlockHeight(3)), Err((4, 3, 10)));
    }

    #[test]
    fn prune_keeps_reachable_blocks() {
        let mut limiter: MultiBlockRateLimiter<u8> =
            MultiBlockRateLimiter::new(&[MaxPerNBlocks { num_blocks: 3, limit: 100 }]);
        for h in 1..=5 {
            limiter.check_and_record(0, BlockHeight(h)).unwrap();
        }
        limiter.prune(BlockHeight(6));
        // heights 4 and 5 can still be counted from height 6
        assert_eq!(limiter.tracked_blocks(), 2);
        assert_eq!(limiter.count(&0, BlockHeight(6), 3), 2);
    }

    #[test]
    fn unlimited_records_nothing() {
        let mut limiter: MultiBlockRateLimiter<u8> = MultiBlockRateLimiter::new(&[]);
        for _ in 0..1_000 {
            assert!(limiter.check_and_record(0, BlockHeight(1)).is_ok());
        }
        assert_eq!(limiter.tracked_blocks(), 0);
    }
}
