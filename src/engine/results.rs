// 8.0.2: result types and errors for engine operations.

use super::matching::MatchStop;
use crate::collaborators::PositionDelta;
use crate::config::ConfigError;
use crate::deleveraging::DeleveragingResult;
use crate::liquidation::{LiquidationError, LiquidationOrder};
use crate::order::{GoodTil, Order, OrderId, OrderStatus, OrderValidationError, RemovalReason, ReplacementError};
use crate::rate_limit::RateLimitError;
use crate::types::{BlockHeight, ClobPairId, Side, SubaccountId, Subticks};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One maker/taker fill, priced at the maker's subticks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fill {
    pub maker_order_id: OrderId,
    pub maker_subaccount_id: SubaccountId,
    pub taker_subaccount_id: SubaccountId,
    pub taker_side: Side,
    pub quantums: u64,
    pub subticks: Subticks,
    pub quote_quantums: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderResult {
    pub order_id: OrderId,
    pub status: OrderStatus,
    // filled by this placement
    pub filled_quantums: u64,
    // filled over the life of the order id, including carried-over fills
    pub total_filled: u64,
    pub remaining_quantums: u64,
    pub fills: Vec<Fill>,
    pub is_resting: bool,
    pub removed_makers: Vec<(OrderId, RemovalReason)>,
}

impl OrderResult {
    pub(super) fn stored(order: &Order) -> Self {
        Self {
            order_id: order.id,
            status: OrderStatus::Untriggered,
            filled_quantums: 0,
            total_filled: 0,
            remaining_quantums: order.quantums,
            fills: Vec::new(),
            is_resting: false,
            removed_makers: Vec::new(),
        }
    }

    pub fn is_fully_filled(&self) -> bool {
        self.status == OrderStatus::FullyFilled
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelResult {
    pub order_id: OrderId,
    pub good_til: GoodTil,
    // the resting or stored order this cancel removed, if any
    pub removed: Option<Order>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiquidationOutcome {
    pub order: LiquidationOrder,
    pub fills: Vec<Fill>,
    pub filled_quantums: u64,
    pub insurance_delta: Decimal,
    pub stop: Option<MatchStop>,
    pub deleveraging: Option<DeleveragingResult>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiquidationSummary {
    pub outcomes: Vec<LiquidationOutcome>,
    pub skipped: Vec<(SubaccountId, LiquidationError)>,
    // positions closed because their market is in final settlement
    pub final_settlement: Vec<DeleveragingResult>,
}

impl LiquidationSummary {
    pub fn liquidated_quantums(&self) -> u64 {
        self.outcomes.iter().map(|o| o.filled_quantums).sum()
    }

    pub fn deleveraged_quantums(&self) -> u64 {
        self.outcomes
            .iter()
            .filter_map(|o| o.deleveraging.as_ref())
            .chain(&self.final_settlement)
            .map(|d| d.total_quantums())
            .sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndBlockSummary {
    pub expired: Vec<OrderId>,
    pub triggered: Vec<OrderResult>,
    pub twap_suborders: Vec<OrderResult>,
    pub deleted_twaps: Vec<OrderId>,
    pub completed_twaps: Vec<OrderId>,
}

/// What a committed block changed outside the book: the position and quote
/// deltas of every subaccount that traded, and insurance fund movements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSettlement {
    pub height: BlockHeight,
    pub position_deltas: Vec<(SubaccountId, PositionDelta)>,
    pub insurance_deltas: Vec<(ClobPairId, Decimal)>,
    pub withdrawals_gated_at: Option<BlockHeight>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("clob pair {0} not found")]
    MarketNotFound(ClobPairId),

    #[error("clob pair {0} already exists")]
    MarketAlreadyExists(ClobPairId),

    #[error("clob pair {0} is not accepting orders")]
    MarketNotActive(ClobPairId),

    #[error("order {0} not found")]
    OrderNotFound(OrderId),

    #[error("order {0} already exists")]
    DuplicateOrder(OrderId),

    #[error("invalid order: {0}")]
    Validation(#[from] OrderValidationError),

    #[error("invalid replacement: {0}")]
    Replacement(#[from] ReplacementError),

    #[error("rate limited: {0}")]
    RateLimited(#[from] RateLimitError),

    #[error("liquidation error: {0}")]
    Liquidation(#[from] LiquidationError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("encoding failed: {0}")]
    Encoding(String),

    #[error("order {order_id} was cancelled until {cancel_good_til}")]
    CancelledOrder { order_id: OrderId, cancel_good_til: GoodTil },

    #[error("cancel of {order_id} at {requested} does not exceed existing cancel at {existing}")]
    CancelGoodTilNotIncreased {
        order_id: OrderId,
        existing: GoodTil,
        requested: GoodTil,
    },

    #[error("cancel of {order_id} at {requested} does not exceed order good-til {existing}")]
    CancelGoodTilTooLow {
        order_id: OrderId,
        existing: GoodTil,
        requested: GoodTil,
    },

    #[error("invalid cancel good-til {good_til} for {order_id}")]
    InvalidCancelGoodTil { order_id: OrderId, good_til: GoodTil },

    #[error("subaccount {subaccount_id} fails collateral check")]
    Undercollateralized { subaccount_id: SubaccountId },

    #[error("post-only order {0} would cross the book")]
    PostOnlyWouldCross(OrderId),

    #[error("fill-or-kill order {order_id} could fill {filled} of {quantums}")]
    FillOrKillNotFilled { order_id: OrderId, filled: u64, quantums: u64 },

    #[error("subaccount {subaccount_id} has {count} stateful orders (max {max})")]
    StatefulOrderLimit {
        subaccount_id: SubaccountId,
        count: u32,
        max: u32,
    },

    #[error("replayed operations diverge at index {index}")]
    ReplayDiverged { index: usize },

    #[error("no oracle price or margin parameters for clob pair {0}")]
    MissingOraclePrice(ClobPairId),
}
