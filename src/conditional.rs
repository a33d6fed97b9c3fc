//! Conditional orders: stop-loss and take-profit.
//!
//! Conditional orders are stored apart from the order book and stay dormant
//! until an oracle price crosses their trigger. Triggering is one-way: a
//! triggered order is handed to the matching engine and never returns here.

use crate::order::{ConditionType, Order, OrderId};
use crate::types::{BlockContext, Side, SubaccountId, Subticks};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// How the trigger price should be compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerCondition {
    /// Triggers when the oracle price is at or above the trigger.
    Above,
    /// Triggers when the oracle price is at or below the trigger.
    Below,
}

/// A buy stop-loss protects a short, so it fires as price rises; a buy
/// take-profit fires as price falls. Sells mirror this.
pub fn trigger_condition(side: Side, condition_type: ConditionType) -> TriggerCondition {
    match (side, condition_type) {
        (Side::Buy, ConditionType::StopLoss) | (Side::Sell, ConditionType::TakeProfit) => TriggerCondition::Above,
        (Side::Sell, ConditionType::StopLoss) | (Side::Buy, ConditionType::TakeProfit) => TriggerCondition::Below,
    }
}

/// Whether a conditional order fires at `oracle`. Non-conditional orders never do.
pub fn should_trigger(order: &Order, oracle: Subticks) -> bool {
    let Some(trigger) = order.conditional_trigger() else {
        return false;
    };
    match trigger_condition(order.side, trigger.condition_type) {
        TriggerCondition::Above => oracle >= trigger.trigger_subticks,
        TriggerCondition::Below => oracle <= trigger.trigger_subticks,
    }
}

/// Dormant conditional orders for one clob pair.
#[derive(Debug, Clone, Default)]
pub struct UntriggeredConditionalOrders {
    orders: BTreeMap<OrderId, Order>,
    // (trigger, id) indexes so a price update only walks orders it fires
    above: BTreeSet<(Subticks, OrderId)>,
    below: BTreeSet<(Subticks, OrderId)>,
}

impl UntriggeredConditionalOrders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a conditional order. Replaces any dormant order with the same id.
    pub fn insert(&mut self, order: Order) {
        let Some(trigger) = order.conditional_trigger() else {
            debug_assert!(false, "only conditional orders are stored untriggered");
            return;
        };
        self.remove(&order.id);
        let entry = (trigger.trigger_subticks, order.id);
        match trigger_condition(order.side, trigger.condition_type) {
            TriggerCondition::Above => self.above.insert(entry),
            TriggerCondition::Below => self.below.insert(entry),
        };
        self.orders.insert(order.id, order);
    }

    pub fn remove(&mut self, id: &OrderId) -> Option<Order> {
        let order = self.orders.remove(id)?;
        if let Some(trigger) = order.conditional_trigger() {
            let entry = (trigger.trigger_subticks, order.id);
            self.above.remove(&entry);
            self.below.remove(&entry);
        }
        Some(order)
    }

    pub fn get(&self, id: &OrderId) -> Option<&Order> {
        self.orders.get(id)
    }

    pub fn contains(&self, id: &OrderId) -> bool {
        self.orders.contains_key(id)
    }

    pub fn get_by_subaccount(&self, subaccount_id: SubaccountId) -> Vec<&Order> {
        self.orders
            .values()
            .filter(|o| o.id.subaccount_id == subaccount_id)
            .collect()
    }

    /// Ids that fire at `oracle`, in id order.
    pub fn check_triggers(&self, oracle: Subticks) -> Vec<OrderId> {
        let mut fired: BTreeSet<OrderId> = BTreeSet::new();
        for (trigger, id) in &self.above {
            if *trigger > oracle {
                break;
            }
            fired.insert(*id);
        }
        for (trigger, id) in self.below.iter().rev() {
            if *trigger < oracle {
                break;
            }
            fired.insert(*id);
        }
        fired.into_iter().collect()
    }

    /// Remove and return every order whose good-til has passed by the end of `ctx`.
    pub fn prune_expired(&mut self, ctx: &BlockContext) -> Vec<Order> {
        let expired: Vec<OrderId> = self
            .orders
            .values()
            .filter(|o| o.good_til.expires_by(ctx))
            .map(|o| o.id)
            .collect();
        expired.iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

/// Result of checking conditional orders.
#[derive(Debug, Clone)]
pub struct TriggeredOrders {
    pub triggered: Vec<Order>,
    pub remaining: usize,
}

/// Collect triggered orders in id order, removing them from the store.
pub fn process_triggers(store: &mut UntriggeredConditionalOrders, oracle: Subticks) -> TriggeredOrders {
    let triggered: Vec<Order> = store
        .check_triggers(oracle)
        .into_iter()
        .filter_map(|id| store.remove(&id))
        .collect();

    TriggeredOrders {
        triggered,
        remaining: store.len(),
    }
}
