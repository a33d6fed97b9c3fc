// 3.0 collaborators.rs: narrow interfaces the clob consumes. margin math, oracle
// prices and subaccount balances live outside this crate and are queried synchronously.

use crate::types::{ClobPairId, Side, SubaccountId, Subticks};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Proposed change to one subaccount's position in one market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionDelta {
    pub clob_pair_id: ClobPairId,
    pub base_quantums: i128,
    pub quote_quantums: Decimal,
}

impl PositionDelta {
    pub fn new(clob_pair_id: ClobPairId) -> Self {
        Self {
            clob_pair_id,
            base_quantums: 0,
            quote_quantums: Decimal::ZERO,
        }
    }

    /// Buying `quantums` for `quote` adds base and spends quote.
    pub fn for_fill(clob_pair_id: ClobPairId, side: Side, quantums: u64, quote: Decimal) -> Self {
        let mut delta = Self::new(clob_pair_id);
        delta.add_fill(side, quantums, quote);
        delta
    }

    pub fn add_fill(&mut self, side: Side, quantums: u64, quote: Decimal) {
        self.base_quantums += side.sign() * i128::from(quantums);
        self.quote_quantums -= Decimal::from(side.sign() as i64) * quote;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollateralCheck {
    Success,
    NewlyUndercollateralized,
    StillUndercollateralized,
}

impl CollateralCheck {
    pub fn is_success(&self) -> bool {
        matches!(self, CollateralCheck::Success)
    }
}

pub trait CollateralChecker: Send + Sync {
    fn check_collateralization(&self, subaccount_id: SubaccountId, delta: &PositionDelta) -> CollateralCheck;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarginParams {
    pub initial_margin_ppm: u32,
    pub maintenance_margin_ppm: u32,
}

pub trait PriceSource: Send + Sync {
    fn oracle_price(&self, clob_pair_id: ClobPairId) -> Option<Subticks>;
    fn margin_params(&self, clob_pair_id: ClobPairId) -> Option<MarginParams>;
}

/// Cross-margined risk of a subaccount in quote quantums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubaccountRisk {
    pub net_collateral: Decimal,
    pub maintenance_margin: Decimal,
}

impl SubaccountRisk {
    pub fn is_liquidatable(&self) -> bool {
        self.net_collateral < self.maintenance_margin
    }
}

pub trait SubaccountSource: Send + Sync {
    fn risk(&self, subaccount_id: SubaccountId) -> Option<SubaccountRisk>;
    /// Signed position in base quantums. zero when flat.
    fn position(&self, subaccount_id: SubaccountId, clob_pair_id: ClobPairId) -> i128;
    fn open_positions(&self, subaccount_id: SubaccountId) -> Vec<(ClobPairId, i128)>;
    /// Subaccounts holding a position on `side` (Buy = long) in the market, in id order.
    fn subaccounts_with_position(&self, clob_pair_id: ClobPairId, side: Side) -> Vec<SubaccountId>;
    fn insurance_fund_balance(&self, clob_pair_id: ClobPairId) -> Decimal;
}
