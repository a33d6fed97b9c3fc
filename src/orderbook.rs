//! Per-pair order book with price-time priority.
//!
//! Both sides are kept in a `BTreeMap` keyed so that ascending iteration yields
//! best price first and, within a price, arrival order. No unordered containers:
//! iteration order feeds consensus-visible fills.

use crate::order::{GoodTil, Order, OrderId};
use crate::types::{BlockHeight, ClobPairId, Side, SubaccountId, Subticks};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

/// Order priority key. `rank` is the price for asks and the inverted price for
/// bids, so the smallest key is always the best order on either side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PriorityKey {
    rank: u64,
    sequence: u64,
}

impl PriorityKey {
    fn new(side: Side, subticks: Subticks, sequence: u64) -> Self {
        let rank = match side {
            Side::Buy => u64::MAX - subticks.0,
            Side::Sell => subticks.0,
        };
        Self { rank, sequence }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// A single price level in the order book
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceLevel {
    pub subticks: Subticks,
    pub total_quantums: u64,
    pub order_count: usize,
}

/// Central Limit Order Book for one clob pair
#[derive(Debug, Clone)]
pub struct OrderBook {
    pub clob_pair_id: ClobPairId,
    bids: BTreeMap<PriorityKey, Order>,
    asks: BTreeMap<PriorityKey, Order>,
    index: BTreeMap<OrderId, (Side, PriorityKey)>,
    // short-term orders by good-til-block
    block_expirations: BTreeMap<BlockHeight, BTreeSet<OrderId>>,
    next_sequence: u64,
}

impl OrderBook {
    pub fn new(clob_pair_id: ClobPairId) -> Self {
        Self {
            clob_pair_id,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            index: BTreeMap::new(),
            block_expirations: BTreeMap::new(),
            next_sequence: 0,
        }
    }

    fn side_map(&self, side: Side) -> &BTreeMap<PriorityKey, Order> {
        match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        }
    }

    fn side_map_mut(&mut self, side: Side) -> &mut BTreeMap<PriorityKey, Order> {
        match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        }
    }

    /// Get the best bid price (highest buy order)
    pub fn best_bid(&self) -> Option<Subticks> {
        self.bids.values().next().map(|o| o.subticks)
    }

    /// Get the best ask price (lowest sell order)
    pub fn best_ask(&self) -> Option<Subticks> {
        self.asks.values().next().map(|o| o.subticks)
    }

    /// Midpoint of best bid and ask, rounded down
    pub fn mid_price(&self) -> Option<Subticks> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(Subticks(((u128::from(bid.0) + u128::from(ask.0)) / 2) as u64)),
            _ => None,
        }
    }

    /// Get the spread between best bid and ask
    pub fn spread(&self) -> Option<u64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask.0.saturating_sub(bid.0)),
            _ => None,
        }
    }

    /// Insert an order behind everything already resting at its price.
    pub fn insert(&mut self, order: Order) -> PriorityKey {
        debug_assert!(!self.index.contains_key(&order.id), "order already resting");
        let key = PriorityKey::new(order.side, order.subticks, self.next_sequence);
        self.next_sequence += 1;

        self.index.insert(order.id, (order.side, key));
        if let GoodTil::Block(height) = order.good_til {
            if order.id.is_short_term() {
                self.block_expirations.entry(height).or_default().insert(order.id);
            }
        }
        let side = order.side;
        self.side_map_mut(side).insert(key, order);
        key
    }

    /// Remove an order from the book by ID
    pub fn remove(&mut self, order_id: &OrderId) -> Option<Order> {
        let (side, key) = self.index.remove(order_id)?;
        let order = self.side_map_mut(side).remove(&key)?;
        if let GoodTil::Block(height) = order.good_til {
            if let Some(ids) = self.block_expirations.get_mut(&height) {
                ids.remove(order_id);
                if ids.is_empty() {
                    self.block_expirations.remove(&height);
                }
            }
        }
        Some(order)
    }

    pub fn get(&self, order_id: &OrderId) -> Option<&Order> {
        let (side, key) = self.index.get(order_id)?;
        self.side_map(*side).get(key)
    }

    pub fn contains(&self, order_id: &OrderId) -> bool {
        self.index.contains_key(order_id)
    }

    /// Best resting order on `side`.
    pub fn best(&self, side: Side) -> Option<(PriorityKey, &Order)> {
        self.side_map(side).iter().next().map(|(k, o)| (*k, o))
    }

    /// Next resting order on `side` strictly behind `after` in priority.
    pub fn next_after(&self, side: Side, after: PriorityKey) -> Option<(PriorityKey, &Order)> {
        self.side_map(side)
            .range((Bound::Excluded(after), Bound::Unbounded))
            .next()
            .map(|(k, o)| (*k, o))
    }

    /// Whether a taker on `side` at `subticks` would match the opposite best.
    pub fn would_cross(&self, side: Side, subticks: Subticks) -> bool {
        match side {
            Side::Buy => self.best_ask().is_some_and(|ask| subticks >= ask),
            Side::Sell => self.best_bid().is_some_and(|bid| subticks <= bid),
        }
    }

    /// Orders on `side` in priority order, up to `depth`.
    pub fn top(&self, side: Side, depth: usize) -> Vec<&Order> {
        self.side_map(side).values().take(depth).collect()
    }

    /// Aggregate depth per price level. `remaining` maps an order to its
    /// unfilled quantums, which the book itself does not track.
    pub fn levels(&self, side: Side, max_levels: usize, remaining: impl Fn(&Order) -> u64) -> Vec<PriceLevel> {
        let mut levels: Vec<PriceLevel> = Vec::new();

        for order in self.side_map(side).values() {
            if levels.last().map(|l| l.subticks) != Some(order.subticks) {
                if levels.len() >= max_levels {
                    break;
                }
                levels.push(PriceLevel {
                    subticks: order.subticks,
                    total_quantums: 0,
                    order_count: 0,
                });
            }
            if let Some(level) = levels.last_mut() {
                level.total_quantums += remaining(order);
                level.order_count += 1;
            }
        }

        levels
    }

    pub fn orders_for_subaccount(&self, subaccount_id: SubaccountId) -> Vec<OrderId> {
        self.index
            .keys()
            .filter(|id| id.subaccount_id == subaccount_id)
            .copied()
            .collect()
    }

    /// Short-term orders whose good-til-block is at or below `height`.
    pub fn short_term_expiring_by(&self, height: BlockHeight) -> Vec<OrderId> {
        self.block_expirations
            .range(..=height)
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect()
    }

    pub fn order_ids(&self) -> impl Iterator<Item = &OrderId> {
        self.index.keys()
    }

    /// Check if the book is crossed (best bid >= best ask)
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }

    /// Total number of orders in the book
    pub fn order_count(&self) -> usize {
        self.bids.len() + self.asks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}
