// 4.1 twap.rs: twap parent placements and their leg triggers.
// a parent splits into ceil(duration / interval) legs. each due trigger emits one IOC
// suborder; missed intervals roll into the next leg instead of being dropped.

use crate::config::ClobPairConfig;
use crate::order::{Order, OrderFlags, OrderId, OrderVariant, TimeInForce};
use crate::types::{BlockContext, BlockTime, Side, SubaccountId, Subticks, ONE_MILLION};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Working state of one twap parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwapOrderPlacement {
    pub order: Order,
    pub remaining_legs: u32,
    pub remaining_quantums: u64,
}

impl TwapOrderPlacement {
    pub fn filled_quantums(&self) -> u64 {
        self.order.quantums - self.remaining_quantums
    }
}

/// A suborder ready to be placed, plus what it consumes from the parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwapLeg {
    pub suborder: Order,
    pub legs_consumed: u32,
    pub trigger_time: BlockTime,
}

pub fn suborder_id(parent: &OrderId) -> OrderId {
    parent.with_flags(OrderFlags::TwapSuborder)
}

pub fn parent_id(suborder: &OrderId) -> OrderId {
    suborder.with_flags(OrderFlags::Twap)
}

/// Legs that have come due by `now` for a trigger scheduled at `trigger_time`.
pub fn legs_due(trigger_time: BlockTime, now: BlockTime, interval_secs: u32, remaining_legs: u32) -> u32 {
    if interval_secs == 0 {
        return remaining_legs;
    }
    let elapsed = now.secs_since(trigger_time) / interval_secs;
    elapsed.saturating_add(1).min(remaining_legs)
}

/// Size of the next suborder: the due share of what is left, on the step grid.
/// The final leg takes everything left.
pub fn leg_quantums(remaining_quantums: u64, remaining_legs: u32, legs_due: u32, step: u64) -> u64 {
    if remaining_legs == 0 || remaining_quantums == 0 {
        return 0;
    }
    let legs_due = legs_due.clamp(1, remaining_legs);
    if legs_due == remaining_legs {
        return remaining_quantums;
    }
    let share = u128::from(remaining_quantums) * u128::from(legs_due) / u128::from(remaining_legs);
    let step = step.max(1);
    let on_grid = (share as u64) / step * step;
    on_grid.max(step).min(remaining_quantums)
}

/// Oracle price moved by the tolerance against the parent, rounded inward to
/// the tick and capped by the parent's own limit price.
pub fn suborder_subticks(
    side: Side,
    oracle: Subticks,
    price_tolerance_ppm: u32,
    subticks_per_tick: u64,
    limit: Subticks,
) -> Subticks {
    let tick = u128::from(subticks_per_tick.max(1));
    let oracle = u128::from(oracle.0);
    let million = u128::from(ONE_MILLION);
    let tolerance = u128::from(price_tolerance_ppm.min(ONE_MILLION));

    let price = match side {
        Side::Buy => {
            let raw = oracle * (million + tolerance) / million;
            (raw / tick * tick).max(tick)
        }
        Side::Sell => {
            let raw = (oracle * (million - tolerance)).div_ceil(million);
            (raw.div_ceil(tick) * tick).max(tick)
        }
    };
    let price = Subticks(u64::try_from(price).unwrap_or(u64::MAX));
    match side {
        Side::Buy => price.min(limit),
        Side::Sell => price.max(limit),
    }
}

/// Twap placements and trigger schedule for one clob pair.
#[derive(Debug, Clone, Default)]
pub struct TwapStore {
    placements: BTreeMap<OrderId, TwapOrderPlacement>,
    triggers: BTreeSet<(BlockTime, OrderId)>,
    trigger_times: BTreeMap<OrderId, BlockTime>,
}

impl TwapStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a validated twap parent with its first leg due at `now`.
    pub fn insert(&mut self, order: Order, now: BlockTime) -> Option<&TwapOrderPlacement> {
        let params = order.twap_parameters()?;
        let parent = order.id;
        self.remove(&parent);
        let placement = TwapOrderPlacement {
            remaining_legs: params.total_legs(),
            remaining_quantums: order.quantums,
            order,
        };
        self.placements.insert(parent, placement);
        self.schedule(&parent, now);
        self.placements.get(&parent)
    }

    fn schedule(&mut self, parent: &OrderId, time: BlockTime) {
        let suborder = suborder_id(parent);
        if let Some(previous) = self.trigger_times.insert(suborder, time) {
            self.triggers.remove(&(previous, suborder));
        }
        self.triggers.insert((time, suborder));
    }

    pub fn get(&self, parent: &OrderId) -> Option<&TwapOrderPlacement> {
        self.placements.get(parent)
    }

    pub fn contains(&self, parent: &OrderId) -> bool {
        self.placements.contains_key(parent)
    }

    pub fn next_trigger_time(&self, parent: &OrderId) -> Option<BlockTime> {
        self.trigger_times.get(&suborder_id(parent)).copied()
    }

    /// Delete the parent and its trigger.
    pub fn remove(&mut self, parent: &OrderId) -> Option<TwapOrderPlacement> {
        let suborder = suborder_id(parent);
        if let Some(time) = self.trigger_times.remove(&suborder) {
            self.triggers.remove(&(time, suborder));
        }
        self.placements.remove(parent)
    }

    /// Parents with a trigger at or before `now`, in (time, id) order.
    pub fn due(&self, now: BlockTime) -> Vec<OrderId> {
        self.triggers
            .iter()
            .take_while(|(time, _)| *time <= now)
            .map(|(_, suborder)| parent_id(suborder))
            .collect()
    }

    /// Build the suborder for a due parent.
    pub fn next_leg(&self, parent: &OrderId, now: BlockTime, oracle: Subticks, pair: &ClobPairConfig) -> Option<TwapLeg> {
        let placement = self.placements.get(parent)?;
        let params = placement.order.twap_parameters()?;
        let trigger_time = self.next_trigger_time(parent)?;
        if trigger_time > now {
            return None;
        }

        let legs_consumed = legs_due(trigger_time, now, params.interval_secs, placement.remaining_legs);
        let quantums = leg_quantums(
            placement.remaining_quantums,
            placement.remaining_legs,
            legs_consumed,
            pair.step_base_quantums,
        );
        if quantums == 0 {
            return None;
        }
        let parent_order = &placement.order;
        let suborder = Order {
            id: suborder_id(parent),
            side: parent_order.side,
            quantums,
            subticks: suborder_subticks(
                parent_order.side,
                oracle,
                params.price_tolerance_ppm,
                pair.subticks_per_tick,
                parent_order.subticks,
            ),
            time_in_force: TimeInForce::IOC,
            good_til: parent_order.good_til,
            reduce_only: parent_order.reduce_only,
            builder_fee: parent_order.builder_fee,
            variant: OrderVariant::TwapSuborder,
        };
        Some(TwapLeg {
            suborder,
            legs_consumed,
            trigger_time,
        })
    }

    /// Apply a suborder fill to its parent.
    pub fn record_fill(&mut self, parent: &OrderId, filled: u64) {
        if let Some(placement) = self.placements.get_mut(parent) {
            assert!(
                filled <= placement.remaining_quantums,
                "twap fill {} exceeds remaining {} for {}",
                filled,
                placement.remaining_quantums,
                parent
            );
            placement.remaining_quantums -= filled;
        }
    }

    /// Consume legs after a placed suborder. Returns the parent if it completed
    /// and was deleted, otherwise schedules its next trigger.
    pub fn advance(&mut self, parent: &OrderId, legs_consumed: u32, trigger_time: BlockTime) -> Option<TwapOrderPlacement> {
        let placement = self.placements.get_mut(parent)?;
        placement.remaining_legs = placement.remaining_legs.saturating_sub(legs_consumed);
        if placement.remaining_legs == 0 || placement.remaining_quantums == 0 {
            return self.remove(parent);
        }
        let interval = placement.order.twap_parameters().map_or(0, |p| p.interval_secs);
        let next = trigger_time.saturating_add_secs(interval.saturating_mul(legs_consumed));
        self.schedule(parent, next);
        None
    }

    /// Remove and return every parent whose good-til has passed by the end of `ctx`.
    pub fn prune_expired(&mut self, ctx: &BlockContext) -> Vec<TwapOrderPlacement> {
        let expired: Vec<OrderId> = self
            .placements
            .values()
            .filter(|p| p.order.good_til.expires_by(ctx))
            .map(|p| p.order.id)
            .collect();
        expired.iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn count_for_subaccount(&self, subaccount_id: SubaccountId) -> usize {
        self.placements.keys().filter(|id| id.subaccount_id == subaccount_id).count()
    }

    pub fn parents(&self) -> impl Iterator<Item = &TwapOrderPlacement> {
        self.placements.values()
    }

    pub fn len(&self) -> usize {
        self.placements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.placements.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::TwapParameters;
    use crate::types::ClobPairId;

    fn params() -> TwapParameters {
        TwapParameters {
            duration_secs: 300,
            interval_secs: 60,
            price_tolerance_ppm: 10_000,
        }
    }

    fn parent(quantums: u64) -> Order {
        Order::twap(SubaccountId::new(1, 0), 7, ClobPairId(0), Side::Buy, quantums, 200, params(), 10_000)
    }

    fn pair() -> ClobPairConfig {
        ClobPairConfig::new(0, 10, 1, 0)
    }

    #[test]
    fn even_split_per_leg() {
        assert_eq!(leg_quantums(1_000, 5, 1, 10), 200);
        assert_eq!(leg_quantums(800, 4, 1, 10), 200);
    }

    #[test]
    fn catch_up_absorbs_missed_legs() {
        // two legs due out of four
        assert_eq!(leg_quantums(800, 4, 2, 10), 400);
        // all legs due: emit everything left
        assert_eq!(leg_quantums(800, 4, 9, 10), 800);
    }

    #[test]
    fn leg_sizing_guards() {
        assert_eq!(leg_quantums(500, 0, 1, 10), 0);
        assert_eq!(leg_quantums(0, 3, 1, 10), 0);
        // share below one step still emits one step
        assert_eq!(leg_quantums(20, 5, 1, 10), 10);
        // rounds down to the step grid
        assert_eq!(leg_quantums(1_000, 3, 1, 10), 330);
    }

    #[test]
    fn legs_due_counts_elapsed_intervals() {
        assert_eq!(legs_due(BlockTime(100), BlockTime(100), 60, 5), 1);
        assert_eq!(legs_due(BlockTime(100), BlockTime(159), 60, 5), 1);
        assert_eq!(legs_due(BlockTime(100), BlockTime(220), 60, 5), 3);
        assert_eq!(legs_due(BlockTime(100), BlockTime(10_000), 60, 5), 5);
    }

    #[test]
    fn suborder_price_applies_tolerance() {
        let buy = suborder_subticks(Side::Buy, Subticks(100), 10_000, 1, Subticks(1_000));
        assert_eq!(buy, Subticks(101));
        let sell = suborder_subticks(Side::Sell, Subticks(100), 10_000, 1, Subticks(1));
        assert_eq!(sell, Subticks(99));
        // capped by the parent's limit
        let capped = suborder_subticks(Side::Buy, Subticks(100), 10_000, 1, Subticks(100));
        assert_eq!(capped, Subticks(100));
        // rounded inward to the tick
        let ticked = suborder_subticks(Side::Buy, Subticks(1_000), 10_000, 25, Subticks(5_000));
        assert_eq!(ticked, Subticks(1_000));
    }

    #[test]
    fn lifecycle_until_complete() {
        let mut store = TwapStore::new();
        let order = parent(1_000);
        let id = order.id;
        store.insert(order, BlockTime(100));
        assert_eq!(store.get(&id).unwrap().remaining_legs, 5);
        assert_eq!(store.due(BlockTime(100)), vec![id]);

        let leg = store.next_leg(&id, BlockTime(100), Subticks(150), &pair()).unwrap();
        assert_eq!(leg.suborder.quantums, 200);
        assert_eq!(leg.suborder.id, suborder_id(&id));
        assert_eq!(leg.suborder.time_in_force, TimeInForce::IOC);

        store.record_fill(&id, 200);
        assert!(store.advance(&id, leg.legs_consumed, leg.trigger_time).is_none());
        assert_eq!(store.next_trigger_time(&id), Some(BlockTime(160)));
        assert!(store.due(BlockTime(159)).is_empty());

        // skip ahead three intervals; the leg catches up
        let leg = store.next_leg(&id, BlockTime(280), Subticks(150), &pair()).unwrap();
        assert_eq!(leg.legs_consumed, 3);
        assert_eq!(leg.suborder.quantums, 600);
        store.record_fill(&id, 100);
        assert!(store.advance(&id, leg.legs_consumed, leg.trigger_time).is_none());
        assert_eq!(store.get(&id).unwrap().remaining_quantums, 700);
        assert_eq!(store.next_trigger_time(&id), Some(BlockTime(340)));

        // the last leg takes what is left
        let leg = store.next_leg(&id, BlockTime(340), Subticks(150), &pair()).unwrap();
        assert_eq!(leg.suborder.quantums, 700);
        store.record_fill(&id, 0);
        let done = store.advance(&id, leg.legs_consumed, leg.trigger_time).unwrap();
        assert_eq!(done.filled_quantums(), 300);
        assert!(store.is_empty());
        assert!(store.due(BlockTime(u32::MAX)).is_empty());
    }

    #[test]
    fn prune_expired_parents() {
        let mut store = TwapStore::new();
        store.insert(parent(100), BlockTime(0));
        assert!(store.prune_expired(&BlockContext::new(1, 9_999)).is_empty());
        assert_eq!(store.prune_expired(&BlockContext::new(2, 10_000)).len(), 1);
        assert!(store.due(BlockTime(u32::MAX)).is_empty());
    }
}
