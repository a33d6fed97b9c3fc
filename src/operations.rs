//! The per-block operations queue.
//!
//! Every consensus-relevant effect produced while building a block is appended
//! here in order: client placements and cancels (inputs), and the matches and
//! removals they cause (outputs). The proposer ships the encoded queue; every
//! validator replays the inputs and checks that it regenerates the same queue.

use crate::deleveraging::DeleveragingFill;
use crate::liquidation::LiquidationOrder;
use crate::order::{GoodTil, Order, OrderId, RemovalReason};
use crate::types::{ClobPairId, SubaccountId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MakerFill {
    pub maker_order_id: OrderId,
    pub fill_quantums: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchOrders {
    pub taker_order_id: OrderId,
    pub fills: Vec<MakerFill>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchLiquidation {
    pub order: LiquidationOrder,
    pub fills: Vec<MakerFill>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchDeleveraging {
    pub liquidated_subaccount_id: SubaccountId,
    pub clob_pair_id: ClobPairId,
    // signed delta requested for the liquidated subaccount
    pub delta_quantums: i128,
    pub fills: Vec<DeleveragingFill>,
    pub withdrawals_gated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClobMatch {
    Orders(MatchOrders),
    Liquidation(MatchLiquidation),
    Deleveraging(MatchDeleveraging),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRemoval {
    pub order_id: OrderId,
    pub reason: RemovalReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    OrderPlacement(Order),
    OrderCancellation { order_id: OrderId, good_til: GoodTil },
    Match(ClobMatch),
    OrderRemoval(OrderRemoval),
}

impl Operation {
    /// Inputs are re-executed on replay. Order matches and removals are
    /// regenerated by them; liquidation and deleveraging matches carry their own inputs.
    pub fn is_replay_input(&self) -> bool {
        match self {
            Operation::OrderPlacement(_) | Operation::OrderCancellation { .. } => true,
            Operation::Match(ClobMatch::Liquidation(_)) | Operation::Match(ClobMatch::Deleveraging(_)) => true,
            Operation::Match(ClobMatch::Orders(_)) | Operation::OrderRemoval(_) => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OperationsQueue {
    operations: Vec<Operation>,
    // last placement queued per id
    placed: BTreeMap<OrderId, Order>,
}

impl OperationsQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a placement unless this exact order is already queued.
    pub fn push_placement(&mut self, order: &Order) -> bool {
        if self.is_queued(order) {
            return false;
        }
        self.placed.insert(order.id, order.clone());
        self.operations.push(Operation::OrderPlacement(order.clone()));
        true
    }

    pub fn push_cancellation(&mut self, order_id: OrderId, good_til: GoodTil) {
        self.operations.push(Operation::OrderCancellation { order_id, good_til });
    }

    pub fn push_match(&mut self, clob_match: ClobMatch) {
        self.operations.push(Operation::Match(clob_match));
    }

    pub fn push_removal(&mut self, order_id: OrderId, reason: RemovalReason) {
        self.operations.push(Operation::OrderRemoval(OrderRemoval { order_id, reason }));
    }

    pub fn is_placed(&self, order_id: &OrderId) -> bool {
        self.placed.contains_key(order_id)
    }

    /// Whether this exact order is the last placement queued for its id.
    pub fn is_queued(&self, order: &Order) -> bool {
        self.placed.get(&order.id) == Some(order)
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn clear(&mut self) {
        self.operations.clear();
        self.placed.clear();
    }

    /// Index of the first operation that differs from `other`, if any.
    pub fn first_divergence(&self, other: &[Operation]) -> Option<usize> {
        let common = self.operations.len().min(other.len());
        (0..common)
            .find(|&i| self.operations[i] != other[i])
            .or_else(|| (self.operations.len() != other.len()).then_some(common))
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        encode_operations(&self.operations)
    }
}

pub fn encode_operations(operations: &[Operation]) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(operations)
}

pub fn decode_operations(bytes: &[u8]) -> Result<Vec<Operation>, serde_json::Error> {
    serde_json::from_slice(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn order(client_id: u32, good_til_block: u32) -> Order {
        Order::short_term(SubaccountId::new(1, 0), client_id, ClobPairId(0), Side::Buy, 10, 100, good_til_block)
    }

    #[test]
    fn placement_queued_once_per_version() {
        let mut queue = OperationsQueue::new();
        assert!(queue.push_placement(&order(1, 10)));
        assert!(!queue.push_placement(&order(1, 10)));
        // a replacement is a new version
        assert!(queue.push_placement(&order(1, 11)));
        assert_eq!(queue.len(), 2);
        assert!(queue.is_placed(&order(1, 10).id));
    }

    #[test]
    fn encoded_queue_decodes_to_same_operations() {
        let mut queue = OperationsQueue::new();
        let taker = order(2, 10);
        queue.push_placement(&taker);
        queue.push_match(ClobMatch::Orders(MatchOrders {
            taker_order_id: taker.id,
            fills: vec![MakerFill {
                maker_order_id: order(3, 10).id,
                fill_quantums: 5,
            }],
        }));
        queue.push_removal(order(3, 10).id, RemovalReason::SelfTrade);

        let bytes = queue.encode().unwrap();
        let decoded = decode_operations(&bytes).unwrap();
        assert_eq!(decoded, queue.operations());
        assert_eq!(queue.first_divergence(&decoded), None);
    }

    #[test]
    fn divergence_reports_first_index() {
        let mut queue = OperationsQueue::new();
        queue.push_placement(&order(1, 10));
        queue.push_cancellation(order(1, 10).id, GoodTil::Block(crate::types::BlockHeight(12)));

        let mut other = queue.operations().to_vec();
        other[1] = Operation::OrderCancellation {
            order_id: order(1, 10).id,
            good_til: GoodTil::Block(crate::types::BlockHeight(13)),
        };
        assert_eq!(queue.first_divergence(&other), Some(1));
        assert_eq!(queue.first_divergence(&other[..1]), Some(1));
        assert!(decode_operations(b"not json").is_err());
    }

    #[test]
    fn replay_inputs() {
        assert!(Operation::OrderPlacement(order(1, 10)).is_replay_input());
        assert!(!Operation::OrderRemoval(OrderRemoval {
            order_id: order(1, 10).id,
            reason: RemovalReason::Undercollateralized,
        })
        .is_replay_input());
    }
}
