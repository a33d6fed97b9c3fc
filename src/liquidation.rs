//! Liquidation math and per-block limits.
//!
//! A liquidation order closes part or all of one perpetual position of an
//! undercollateralized subaccount. Its price (the fillable price) sits between
//! the oracle price and the bankruptcy price, scaled by how far the subaccount is
//! below maintenance margin. The insurance fund takes the difference between what
//! the fill pays and the bankruptcy price, within per-subaccount block limits.

use crate::collaborators::SubaccountRisk;
use crate::config::{ClobPairConfig, FillablePriceConfig, PositionBlockLimits, SubaccountBlockLimits};
use crate::types::{
    decimal_to_i128, decimal_to_u64, mul_ppm, pow10, position_notional, signed_decimal, ClobPairId, Quote,
    Side, SubaccountId, Subticks,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// Oracle price and margin parameters of one market, as seen by liquidations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketRisk {
    pub clob_pair_id: ClobPairId,
    pub oracle: Subticks,
    pub exponent: i32,
    pub maintenance_margin_ppm: u32,
}

impl MarketRisk {
    /// Signed net notional of `quantums` at the oracle price.
    pub fn notional(&self, quantums: i128) -> Decimal {
        position_notional(quantums, self.oracle, self.exponent)
    }

    pub fn maintenance_margin(&self, quantums: i128) -> Decimal {
        mul_ppm(self.notional(quantums).abs(), self.maintenance_margin_ppm)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LiquidationError {
    #[error("position delta {delta} is invalid for position {position}")]
    InvalidPositionDelta { position: i128, delta: i128 },
    #[error("subaccount {0} has no position to liquidate")]
    NoPositionToLiquidate(SubaccountId),
    #[error("subaccount {0} is not liquidatable")]
    NotLiquidatable(SubaccountId),
    #[error("subaccount {0} not found")]
    UnknownSubaccount(SubaccountId),
    #[error("no oracle price or margin parameters for clob pair {0}")]
    MissingMarketRisk(ClobPairId),
    #[error("subaccount {subaccount_id} already liquidated clob pair {clob_pair_id} this block")]
    AlreadyLiquidated {
        subaccount_id: SubaccountId,
        clob_pair_id: ClobPairId,
    },
    #[error("subaccount {0} reached its notional liquidation limit for this block")]
    SubaccountLimitReached(SubaccountId),
    #[error("fillable price for subaccount {0} is negative")]
    NegativeFillablePrice(SubaccountId),
}

pub fn validate_position_delta(position: i128, delta: i128) -> Result<(), LiquidationError> {
    if position.signum() * delta.signum() != -1 || delta.abs() > position.abs() {
        return Err(LiquidationError::InvalidPositionDelta { position, delta });
    }
    Ok(())
}

/// Quote quantums the subaccount must receive for `delta` to close at exactly
/// zero remaining collateral: `-DNNV - TNC * |DMMR| / TMMR`, rounded up.
pub fn bankruptcy_quote(
    market: &MarketRisk,
    position: i128,
    delta: i128,
    risk: &SubaccountRisk,
) -> Result<Decimal, LiquidationError> {
    validate_position_delta(position, delta)?;

    let after = position + delta;
    let delta_notional = market.notional(after) - market.notional(position);
    let delta_maintenance = market.maintenance_margin(after) - market.maintenance_margin(position);
    assert!(
        delta_maintenance <= Decimal::ZERO,
        "reducing a position raised its maintenance margin"
    );

    let collateral_share = if risk.maintenance_margin.is_zero() {
        Decimal::ZERO
    } else {
        (risk.net_collateral * delta_maintenance.abs() / risk.maintenance_margin).floor()
    };
    Ok((-delta_notional - collateral_share).ceil())
}

/// Fillable price in quote quantums per base quantum:
/// `(PNNV - ABR * SMMR * PMMR) / PS` with `ABR = clamp(BA * (1 - TNC / TMMR), 0, 1)`.
pub fn fillable_price(
    subaccount_id: SubaccountId,
    market: &MarketRisk,
    position: i128,
    risk: &SubaccountRisk,
    config: &FillablePriceConfig,
) -> Result<Decimal, LiquidationError> {
    if position == 0 {
        return Err(LiquidationError::NoPositionToLiquidate(subaccount_id));
    }

    let unbounded = if risk.maintenance_margin.is_zero() {
        if risk.net_collateral < Decimal::ZERO {
            Decimal::ONE
        } else {
            Decimal::ZERO
        }
    } else {
        let ratio = risk.net_collateral / risk.maintenance_margin;
        mul_ppm(Decimal::ONE - ratio, config.bankruptcy_adjustment_ppm)
    };
    let adjusted_bankruptcy_rating = unbounded.clamp(Decimal::ZERO, Decimal::ONE);

    let max_spread = mul_ppm(
        market.maintenance_margin(position),
        config.spread_to_maintenance_margin_ratio_ppm,
    );
    let price = (market.notional(position) - adjusted_bankruptcy_rating * max_spread) / signed_decimal(position);
    if price < Decimal::ZERO {
        return Err(LiquidationError::NegativeFillablePrice(subaccount_id));
    }
    Ok(price)
}

/// Converts a fillable price to subticks on the tick grid. Sells closing longs
/// round up and buys closing shorts round down, so the liquidation never
/// trades through its own limit.
pub fn fillable_price_to_subticks(price: Decimal, liquidating_long: bool, pair: &ClobPairConfig) -> Subticks {
    let raw = price / pow10(pair.quantum_conversion_exponent);
    let rounded = if liquidating_long { raw.ceil() } else { raw.floor() };
    let tick = pair.subticks_per_tick.max(1);
    let max = u64::MAX - u64::MAX % tick;

    let subticks = decimal_to_u64(rounded).unwrap_or(if rounded.is_sign_negative() { 0 } else { max });
    let aligned = if liquidating_long {
        subticks.div_ceil(tick).saturating_mul(tick)
    } else {
        subticks / tick * tick
    };
    Subticks(aligned.clamp(tick, max))
}

/// Insurance fund delta for one fill: `received - bankruptcy`. A positive delta
/// is the liquidation fee, capped at `max_fee_ppm` of the fill's quote notional.
pub fn insurance_fund_delta(quote_received: Decimal, bankruptcy: Decimal, fill_quote: Decimal, max_fee_ppm: u32) -> Decimal {
    let delta = quote_received - bankruptcy;
    if delta <= Decimal::ZERO {
        return delta;
    }
    let max_fee = mul_ppm(fill_quote.abs(), max_fee_ppm).floor();
    delta.min(max_fee)
}

/// (min, max) notional of a position that may be liquidated in one block.
/// Small positions close in full: the floor overrides the portion cap.
pub fn position_notional_limits(abs_notional: Decimal, limits: &PositionBlockLimits) -> (Decimal, Decimal) {
    let min = Decimal::from(limits.min_position_notional_liquidated).min(abs_notional);
    let max = mul_ppm(abs_notional, limits.max_position_portion_liquidated_ppm).max(min);
    (min, max)
}

/// Signed size delta that closes as much of `position` as the position and
/// subaccount limits allow, on the step grid.
pub fn liquidatable_size_delta(
    market: &MarketRisk,
    position: i128,
    step: u64,
    max_subaccount_notional: Decimal,
    limits: &PositionBlockLimits,
) -> i128 {
    let abs_notional = market.notional(position).abs();
    let (_, max_position_notional) = position_notional_limits(abs_notional, limits);
    let max_notional = max_position_notional.min(max_subaccount_notional);

    let step = i128::from(step.max(1));
    if abs_notional <= max_notional || position.abs() <= step || abs_notional.is_zero() {
        return -position;
    }

    let proportional = (signed_decimal(position.abs()) * max_notional / abs_notional).floor();
    let abs_delta = decimal_to_i128(proportional).unwrap_or(0) / step * step;
    let abs_delta = abs_delta.clamp(step, position.abs());
    -position.signum() * abs_delta
}

/// An ephemeral order closing (part of) one position. Never rests on the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationOrder {
    pub subaccount_id: SubaccountId,
    pub clob_pair_id: ClobPairId,
    pub side: Side,
    pub quantums: u64,
    pub subticks: Subticks,
    // oracle price and notional when the order was built, for ordering only
    pub oracle: Subticks,
    pub notional: Decimal,
}

impl LiquidationOrder {
    pub fn is_buy(&self) -> bool {
        self.side.is_buy()
    }

    /// |subticks - oracle| / oracle
    pub fn oracle_distance(&self) -> Decimal {
        if self.oracle.is_zero() {
            return Decimal::ZERO;
        }
        let diff = Decimal::from(self.subticks.0) - Decimal::from(self.oracle.0);
        diff.abs() / Decimal::from(self.oracle.0)
    }

    /// Processing order: furthest from oracle first, then largest notional,
    /// then subaccount id.
    pub fn priority_cmp(&self, other: &Self) -> Ordering {
        other
            .oracle_distance()
            .cmp(&self.oracle_distance())
            .then(other.notional.abs().cmp(&self.notional.abs()))
            .then(self.subaccount_id.cmp(&other.subaccount_id))
            .then(self.clob_pair_id.cmp(&other.clob_pair_id))
    }
}

pub fn sort_liquidation_orders(orders: &mut [LiquidationOrder]) {
    orders.sort_by(|a, b| a.priority_cmp(b));
}

/// What one subaccount has been liquidated for in the current block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubaccountLiquidationInfo {
    pub perpetuals_liquidated: BTreeSet<ClobPairId>,
    pub notional_liquidated: Decimal,
    pub quantums_insurance_lost: Decimal,
}

/// Per-block liquidation bookkeeping. Reset at commit.
#[derive(Debug, Clone, Default)]
pub struct LiquidationBlockTracker {
    infos: BTreeMap<SubaccountId, SubaccountLiquidationInfo>,
    attempts: u32,
}

impl LiquidationBlockTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&self, subaccount_id: SubaccountId) -> SubaccountLiquidationInfo {
        self.infos.get(&subaccount_id).cloned().unwrap_or_default()
    }

    pub fn has_liquidated(&self, subaccount_id: SubaccountId, clob_pair_id: ClobPairId) -> bool {
        self.infos
            .get(&subaccount_id)
            .is_some_and(|info| info.perpetuals_liquidated.contains(&clob_pair_id))
    }

    pub fn mark_liquidated(&mut self, subaccount_id: SubaccountId, clob_pair_id: ClobPairId) {
        self.infos
            .entry(subaccount_id)
            .or_default()
            .perpetuals_liquidated
            .insert(clob_pair_id);
    }

    /// Record a liquidation fill: its oracle notional and the insurance fund delta it caused.
    pub fn record_fill(&mut self, subaccount_id: SubaccountId, notional: Decimal, insurance_delta: Decimal) {
        let info = self.infos.entry(subaccount_id).or_default();
        info.notional_liquidated += notional.abs();
        if insurance_delta < Decimal::ZERO {
            info.quantums_insurance_lost += -insurance_delta;
        }
    }

    pub fn remaining_notional(&self, subaccount_id: SubaccountId, limits: &SubaccountBlockLimits) -> Decimal {
        let used = self.infos.get(&subaccount_id).map_or(Decimal::ZERO, |i| i.notional_liquidated);
        (Decimal::from(limits.max_notional_liquidated) - used).max(Decimal::ZERO)
    }

    pub fn remaining_insurance_lost(&self, subaccount_id: SubaccountId, limits: &SubaccountBlockLimits) -> Decimal {
        let used = self
            .infos
            .get(&subaccount_id)
            .map_or(Decimal::ZERO, |i| i.quantums_insurance_lost);
        (Decimal::from(limits.max_quantums_insurance_lost) - used).max(Decimal::ZERO)
    }

    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.infos.clear();
        self.attempts = 0;
    }
}

/// Insurance fund of one market, tracked through the liquidations of a block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsuranceFund {
    pub balance: Quote,
    pub total_deposits: Quote,
    pub total_payouts: Quote,
}

impl InsuranceFund {
    pub fn new(initial_balance: Quote) -> Self {
        Self {
            balance: initial_balance,
            total_deposits: Quote::zero(),
            total_payouts: Quote::zero(),
        }
    }

    pub fn deposit(&mut self, amount: Quote) {
        self.balance = self.balance.add(amount);
        self.total_deposits = self.total_deposits.add(amount);
    }

    /// Pays out up to `amount`; returns what was actually covered.
    pub fn cover_bad_debt(&mut self, amount: Quote) -> Quote {
        let covered = amount.min(self.balance);
        self.balance = self.balance.sub(covered);
        self.total_payouts = self.total_payouts.add(covered);
        covered
    }

    pub fn can_cover(&self, amount: Quote) -> bool {
        self.balance >= amount
    }

    /// Apply a signed insurance delta: fees deposit, shortfalls pay out.
    pub fn apply_delta(&mut self, delta: Decimal) {
        if delta >= Decimal::ZERO {
            self.deposit(Quote::new(delta));
        } else {
            self.cover_bad_debt(Quote::new(-delta));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn market(oracle: u64) -> MarketRisk {
        MarketRisk {
            clob_pair_id: ClobPairId(0),
            oracle: Subticks(oracle),
            exponent: 0,
            maintenance_margin_ppm: 50_000, // 5%
        }
    }

    fn alice() -> SubaccountId {
        SubaccountId::new(1, 0)
    }

    #[test]
    fn delta_must_reduce_position() {
        assert!(validate_position_delta(10, -10).is_ok());
        assert!(validate_position_delta(-10, 4).is_ok());
        assert!(validate_position_delta(10, 5).is_err());
        assert!(validate_position_delta(10, -11).is_err());
        assert!(validate_position_delta(0, -1).is_err());
    }

    #[test]
    fn bankruptcy_quote_for_full_close() {
        // long 100 @ oracle 100, quote balance -9,600: TNC 400, TMMR 500
        let risk = SubaccountRisk {
            net_collateral: dec!(400),
            maintenance_margin: dec!(500),
        };
        // -DNNV = 10,000; TNC * |DMMR| / TMMR = 400
        let quote = bankruptcy_quote(&market(100), 100, -100, &risk).unwrap();
        assert_eq!(quote, dec!(9_600));
    }

    #[test]
    fn bankruptcy_quote_with_negative_collateral() {
        let risk = SubaccountRisk {
            net_collateral: dec!(-200),
            maintenance_margin: dec!(500),
        };
        let quote = bankruptcy_quote(&market(100), 100, -100, &risk).unwrap();
        assert_eq!(quote, dec!(10_200));

        // half the position carries half the shortfall
        let half = bankruptcy_quote(&market(100), 100, -50, &risk).unwrap();
        assert_eq!(half, dec!(5_100));
    }

    #[test]
    fn fillable_price_between_bankruptcy_and_oracle() {
        let config = FillablePriceConfig {
            bankruptcy_adjustment_ppm: 1_000_000,
            spread_to_maintenance_margin_ratio_ppm: 1_000_000,
        };
        // TNC / TMMR = 0.8, ABR = 0.2, spread = 500
        let risk = SubaccountRisk {
            net_collateral: dec!(400),
            maintenance_margin: dec!(500),
        };
        let long = fillable_price(alice(), &market(100), 100, &risk, &config).unwrap();
        assert_eq!(long, dec!(99));

        let short = fillable_price(alice(), &market(100), -100, &risk, &config).unwrap();
        assert_eq!(short, dec!(101));

        // deeply underwater: ABR clamps to 1
        let bankrupt = SubaccountRisk {
            net_collateral: dec!(-1_000),
            maintenance_margin: dec!(500),
        };
        let floor = fillable_price(alice(), &market(100), 100, &bankrupt, &config).unwrap();
        assert_eq!(floor, dec!(95));
    }

    #[test]
    fn fillable_price_rounds_away_from_trader() {
        let pair = ClobPairConfig::new(0, 1, 10, 0);
        assert_eq!(fillable_price_to_subticks(dec!(99.2), true, &pair), Subticks(100));
        assert_eq!(fillable_price_to_subticks(dec!(99.2), false, &pair), Subticks(90));
        // never below one tick
        assert_eq!(fillable_price_to_subticks(dec!(0.4), false, &pair), Subticks(10));

        let scaled = ClobPairConfig::new(0, 1, 1, -2);
        assert_eq!(fillable_price_to_subticks(dec!(1.234), false, &scaled), Subticks(123));
    }

    #[test]
    fn insurance_fee_is_capped() {
        // received 10,000 against bankruptcy 9,600 on a 10,000 fill at 0.5% max fee
        assert_eq!(insurance_fund_delta(dec!(10_000), dec!(9_600), dec!(10_000), 5_000), dec!(50));
        assert_eq!(insurance_fund_delta(dec!(9_700), dec!(9_600), dec!(9_700), 50_000), dec!(100));
        // shortfall passes through uncapped
        assert_eq!(insurance_fund_delta(dec!(9_500), dec!(9_600), dec!(9_500), 5_000), dec!(-100));
    }

    #[test]
    fn floor_dominates_portion_cap() {
        let limits = PositionBlockLimits {
            min_position_notional_liquidated: 100_000,
            max_position_portion_liquidated_ppm: 100_000, // 10%
        };
        // 500 @ 100 = $50,000 notional: the whole position closes
        let delta = liquidatable_size_delta(&market(100), 500, 1, dec!(1_000_000_000), &limits);
        assert_eq!(delta, -500);

        let (min, max) = position_notional_limits(dec!(50_000), &limits);
        assert_eq!(min, dec!(50_000));
        assert_eq!(max, dec!(50_000));
    }

    #[test]
    fn portion_cap_rounds_to_step() {
        let limits = PositionBlockLimits {
            min_position_notional_liquidated: 1_000,
            max_position_portion_liquidated_ppm: 250_000,
        };
        // short 1,000 @ 100: max 25,000 notional -> 250, on a step of 30 -> 240
        let delta = liquidatable_size_delta(&market(100), -1_000, 30, dec!(1_000_000_000), &limits);
        assert_eq!(delta, 240);

        // subaccount limit tighter than the position limit
        let delta = liquidatable_size_delta(&market(100), -1_000, 10, dec!(5_000), &limits);
        assert_eq!(delta, 50);
    }

    #[test]
    fn liquidation_orders_sorted_by_distance_then_notional() {
        let order = |owner: u64, subticks: u64, notional: Decimal| LiquidationOrder {
            subaccount_id: SubaccountId::new(owner, 0),
            clob_pair_id: ClobPairId(0),
            side: Side::Sell,
            quantums: 1,
            subticks: Subticks(subticks),
            oracle: Subticks(100),
            notional,
        };
        let mut orders = vec![
            order(1, 99, dec!(10)),
            order(2, 95, dec!(10)),
            order(3, 99, dec!(50)),
            order(0, 99, dec!(10)),
        ];
        sort_liquidation_orders(&mut orders);
        let owners: Vec<u64> = orders.iter().map(|o| o.subaccount_id.owner).collect();
        assert_eq!(owners, vec![2, 3, 0, 1]);
    }

    #[test]
    fn tracker_limits() {
        let limits = SubaccountBlockLimits {
            max_notional_liquidated: 1_000,
            max_quantums_insurance_lost: 100,
        };
        let mut tracker = LiquidationBlockTracker::new();
        tracker.mark_liquidated(alice(), ClobPairId(0));
        tracker.record_fill(alice(), dec!(-400), dec!(-30));
        tracker.record_fill(alice(), dec!(200), dec!(5));

        assert!(tracker.has_liquidated(alice(), ClobPairId(0)));
        assert!(!tracker.has_liquidated(alice(), ClobPairId(1)));
        assert_eq!(tracker.remaining_notional(alice(), &limits), dec!(400));
        assert_eq!(tracker.remaining_insurance_lost(alice(), &limits), dec!(70));

        tracker.reset();
        assert_eq!(tracker.remaining_notional(alice(), &limits), dec!(1_000));
    }

    #[test]
    fn insurance_fund_operations() {
        let mut fund = InsuranceFund::new(Quote::new(dec!(1_000)));
        fund.apply_delta(dec!(50));
        assert_eq!(fund.balance.value(), dec!(1_050));
        fund.apply_delta(dec!(-300));
        assert_eq!(fund.balance.value(), dec!(750));
        assert!(fund.can_cover(Quote::new(dec!(750))));

        let partial = fund.cover_bad_debt(Quote::new(dec!(2_000)));
        assert_eq!(partial.value(), dec!(750));
        assert_eq!(fund.balance.value(), dec!(0));
        assert_eq!(fund.total_payouts.value(), dec!(1_050));
    }
}
