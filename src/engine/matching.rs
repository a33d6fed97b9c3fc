//! Matching: plan a taker against the book without touching it, then apply.
//!
//! Planning walks the opposite side best-first and decides every fill, maker
//! removal and stop condition up front. Fill-or-kill and post-only rejections
//! therefore never leave partial state behind, and a plan is applied in one
//! pass under the market lock.

use super::core::{MarketBook, MemClob};
use super::results::Fill;
use crate::collaborators::{PositionDelta, SubaccountRisk};
use crate::liquidation::{bankruptcy_quote, insurance_fund_delta, LiquidationOrder, MarketRisk};
use crate::operations::{ClobMatch, MakerFill, MatchLiquidation, MatchOrders};
use crate::order::{Order, OrderId, OrderStatus, OrderVariant, RemovalReason};
use crate::types::{fill_amount_to_quote, Side, SubaccountId, Subticks};
use log::{debug, info, warn};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Why matching stopped before the taker was exhausted or the book stopped crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchStop {
    TakerUndercollateralized,
    ReduceOnly,
    // the next fill would exceed the subaccount's insurance-lost budget
    InsuranceLimit,
    // the next fill would overdraw the insurance fund
    InsuranceFundInsufficient,
    BankruptcyPriceUnavailable,
}

/// State the planner needs to price insurance for a liquidation taker.
#[derive(Debug, Clone, Copy)]
pub(super) struct LiquidationContext {
    pub(super) market: MarketRisk,
    pub(super) position: i128,
    pub(super) risk: SubaccountRisk,
    pub(super) remaining_insurance_lost: Decimal,
    pub(super) fund_balance: Decimal,
    pub(super) max_fee_ppm: u32,
}

#[derive(Debug, Clone)]
pub(super) struct TakerSpec {
    pub(super) subaccount_id: SubaccountId,
    pub(super) side: Side,
    pub(super) subticks: Subticks,
    pub(super) quantums: u64,
    pub(super) reduce_only: bool,
    pub(super) liquidation: Option<LiquidationContext>,
}

impl TakerSpec {
    pub(super) fn for_order(order: &Order, quantums: u64) -> Self {
        Self {
            subaccount_id: order.subaccount_id(),
            side: order.side,
            subticks: order.subticks,
            quantums,
            reduce_only: order.reduce_only,
            liquidation: None,
        }
    }

    fn crosses(&self, maker_subticks: Subticks) -> bool {
        match self.side {
            Side::Buy => self.subticks >= maker_subticks,
            Side::Sell => self.subticks <= maker_subticks,
        }
    }
}

#[derive(Debug, Clone)]
pub(super) struct PlannedFill {
    pub(super) maker: Order,
    pub(super) quantums: u64,
    pub(super) quote: Decimal,
    pub(super) insurance_delta: Decimal,
}

#[derive(Debug, Clone, Default)]
pub(super) struct MatchPlan {
    pub(super) fills: Vec<PlannedFill>,
    pub(super) removals: Vec<(Order, RemovalReason)>,
    pub(super) taker_filled: u64,
    pub(super) stop: Option<MatchStop>,
}

impl MatchPlan {
    pub(super) fn insurance_delta(&self) -> Decimal {
        self.fills.iter().map(|f| f.insurance_delta).sum()
    }
}

/// Who the taker of an applied plan was.
#[derive(Debug, Clone, Copy)]
pub(super) enum MatchTaker<'a> {
    Order(&'a Order),
    Liquidation(&'a LiquidationOrder),
}

impl MatchTaker<'_> {
    fn subaccount_id(&self) -> SubaccountId {
        match self {
            MatchTaker::Order(order) => order.subaccount_id(),
            MatchTaker::Liquidation(order) => order.subaccount_id,
        }
    }

    fn side(&self) -> Side {
        match self {
            MatchTaker::Order(order) => order.side,
            MatchTaker::Liquidation(order) => order.side,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(super) struct AppliedMatch {
    pub(super) fills: Vec<Fill>,
    pub(super) removed_makers: Vec<(OrderId, RemovalReason)>,
}

/// Largest fill on `side` that does not take `position` through zero.
fn reduce_only_cap(position: i128, side: Side) -> u64 {
    if position.signum() == -side.sign() {
        u64::try_from(position.unsigned_abs()).unwrap_or(u64::MAX)
    } else {
        0
    }
}

impl MemClob {
    /// Decide the fills for `taker` against the opposite side of `market`.
    pub(super) fn plan_match(&self, market: &MarketBook, taker: &TakerSpec) -> MatchPlan {
        let mut plan = MatchPlan::default();
        let clob_pair_id = market.config.id;
        let exponent = market.config.quantum_conversion_exponent;
        let maker_side = taker.side.opposite();

        let mut remaining = taker.quantums;
        let mut taker_delta = market.pending_delta(taker.subaccount_id);
        let mut maker_deltas: BTreeMap<SubaccountId, PositionDelta> = BTreeMap::new();
        let mut liquidation = taker.liquidation;

        let mut next = market.book.best(maker_side);
        while let Some((key, maker)) = next {
            next = market.book.next_after(maker_side, key);
            if remaining == 0 || !taker.crosses(maker.subticks) {
                break;
            }

            let maker_subaccount = maker.subaccount_id();
            if maker_subaccount == taker.subaccount_id {
                plan.removals.push((maker.clone(), RemovalReason::SelfTrade));
                continue;
            }

            let maker_remaining = maker.quantums.saturating_sub(market.filled(&maker.id));
            if maker_remaining == 0 {
                continue;
            }
            let mut quantums = remaining.min(maker_remaining);
            let mut taker_clipped = false;
            let mut maker_clipped = false;

            if taker.reduce_only {
                let position = self.subaccounts.position(taker.subaccount_id, clob_pair_id) + taker_delta.base_quantums;
                let cap = reduce_only_cap(position, taker.side);
                if cap == 0 {
                    plan.stop = Some(MatchStop::ReduceOnly);
                    break;
                }
                if cap < quantums {
                    quantums = cap;
                    taker_clipped = true;
                }
            }

            let maker_before = maker_deltas
                .get(&maker_subaccount)
                .copied()
                .unwrap_or_else(|| market.pending_delta(maker_subaccount));
            let maker_position = self.subaccounts.position(maker_subaccount, clob_pair_id) + maker_before.base_quantums;
            if maker.reduce_only {
                let cap = reduce_only_cap(maker_position, maker.side);
                if cap == 0 {
                    plan.removals.push((maker.clone(), RemovalReason::ReduceOnlyResized));
                    continue;
                }
                if cap < quantums {
                    quantums = cap;
                    maker_clipped = true;
                    taker_clipped = false;
                }
            }

            let quote = fill_amount_to_quote(maker.subticks, quantums, exponent).value();

            let mut insurance_delta = Decimal::ZERO;
            if let Some(ctx) = &liquidation {
                let delta = taker.side.sign() * i128::from(quantums);
                let bankruptcy = match bankruptcy_quote(&ctx.market, ctx.position, delta, &ctx.risk) {
                    Ok(quote) => quote,
                    Err(err) => {
                        warn!(
                            "liquidation pricing failed subaccount={} err={}",
                            taker.subaccount_id, err
                        );
                        plan.stop = Some(MatchStop::BankruptcyPriceUnavailable);
                        break;
                    }
                };
                let received = match taker.side {
                    Side::Sell => quote,
                    Side::Buy => -quote,
                };
                insurance_delta = insurance_fund_delta(received, bankruptcy, quote, ctx.max_fee_ppm);
                if insurance_delta < Decimal::ZERO {
                    if -insurance_delta > ctx.remaining_insurance_lost {
                        plan.stop = Some(MatchStop::InsuranceLimit);
                        break;
                    }
                    if ctx.fund_balance + insurance_delta < Decimal::ZERO {
                        plan.stop = Some(MatchStop::InsuranceFundInsufficient);
                        break;
                    }
                }
            }

            let mut taker_after = taker_delta;
            taker_after.add_fill(taker.side, quantums, quote);
            if liquidation.is_none() && !self.collateral.check_collateralization(taker.subaccount_id, &taker_after).is_success() {
                plan.stop = Some(MatchStop::TakerUndercollateralized);
                break;
            }

            let mut maker_after = maker_before;
            maker_after.add_fill(maker.side, quantums, quote);
            if !self.collateral.check_collateralization(maker_subaccount, &maker_after).is_success() {
                plan.removals.push((maker.clone(), RemovalReason::Undercollateralized));
                continue;
            }

            taker_delta = taker_after;
            maker_deltas.insert(maker_subaccount, maker_after);
            if let Some(ctx) = liquidation.as_mut() {
                let delta = taker.side.sign() * i128::from(quantums);
                let after = ctx.position + delta;
                let received = match taker.side {
                    Side::Sell => quote,
                    Side::Buy => -quote,
                };
                ctx.risk.net_collateral +=
                    received - insurance_delta + ctx.market.notional(after) - ctx.market.notional(ctx.position);
                ctx.risk.maintenance_margin +=
                    ctx.market.maintenance_margin(after) - ctx.market.maintenance_margin(ctx.position);
                ctx.position = after;
                if insurance_delta < Decimal::ZERO {
                    ctx.remaining_insurance_lost += insurance_delta;
                }
                ctx.fund_balance += insurance_delta;
            }

            plan.fills.push(PlannedFill {
                maker: maker.clone(),
                quantums,
                quote,
                insurance_delta,
            });
            remaining -= quantums;
            plan.taker_filled += quantums;

            // a reduce-only order that just closed its position cannot keep working
            if maker_clipped {
                plan.removals.push((maker.clone(), RemovalReason::ReduceOnlyResized));
            }
            if taker_clipped {
                plan.stop = Some(MatchStop::ReduceOnly);
                break;
            }
        }

        plan
    }

    /// Apply a plan to `market` and queue its operations: maker placements not
    /// yet queued, the match, then removals. The taker's own placement is queued by the caller.
    pub(super) fn apply_plan(&self, market: &mut MarketBook, taker: MatchTaker<'_>, plan: &MatchPlan) -> AppliedMatch {
        let mut applied = AppliedMatch::default();
        let taker_subaccount = taker.subaccount_id();
        let taker_side = taker.side();
        let mut maker_fills = Vec::with_capacity(plan.fills.len());
        let mut maker_placements = Vec::new();

        for planned in &plan.fills {
            let maker = &planned.maker;
            if !matches!(maker.variant, OrderVariant::TwapSuborder) {
                let filled = market.filled(&maker.id) + planned.quantums;
                market.set_filled(maker, filled);
                if filled == maker.quantums {
                    market.remove_resting(&maker.id);
                    market.set_status(maker, OrderStatus::FullyFilled);
                }
            }

            let base = i128::from(planned.quantums);
            market.add_block_delta(maker.subaccount_id(), maker.side.sign() * base, -Decimal::from(maker.side.sign() as i64) * planned.quote);
            market.add_block_delta(
                taker_subaccount,
                taker_side.sign() * base,
                -Decimal::from(taker_side.sign() as i64) * planned.quote - planned.insurance_delta,
            );

            maker_placements.push(maker.clone());
            maker_fills.push(MakerFill {
                maker_order_id: maker.id,
                fill_quantums: planned.quantums,
            });
            let fill = Fill {
                maker_order_id: maker.id,
                maker_subaccount_id: maker.subaccount_id(),
                taker_subaccount_id: taker_subaccount,
                taker_side,
                quantums: planned.quantums,
                subticks: maker.subticks,
                quote_quantums: planned.quote,
            };
            if self.options.verbose {
                info!(
                    "fill clob={} maker={} taker={} quantums={} subticks={}",
                    market.config.id, fill.maker_order_id, fill.taker_subaccount_id, fill.quantums, fill.subticks
                );
            } else {
                debug!(
                    "fill clob={} maker={} taker={} quantums={} subticks={}",
                    market.config.id, fill.maker_order_id, fill.taker_subaccount_id, fill.quantums, fill.subticks
                );
            }
            applied.fills.push(fill);
        }

        for (maker, reason) in &plan.removals {
            if market.remove_resting(&maker.id).is_some() {
                market.set_status(maker, OrderStatus::Removed(*reason));
                applied.removed_makers.push((maker.id, *reason));
                debug!("maker removed clob={} order={} reason={:?}", market.config.id, maker.id, reason);
            }
        }

        let mut operations = self.operations.lock();
        for maker in &maker_placements {
            operations.push_placement(maker);
        }
        match taker {
            MatchTaker::Order(order) if !maker_fills.is_empty() => {
                operations.push_match(ClobMatch::Orders(MatchOrders {
                    taker_order_id: order.id,
                    fills: maker_fills,
                }));
            }
            MatchTaker::Liquidation(order) if !maker_fills.is_empty() || !applied.removed_makers.is_empty() => {
                operations.push_match(ClobMatch::Liquidation(MatchLiquidation {
                    order: *order,
                    fills: maker_fills,
                }));
            }
            _ => {}
        }
        for (order_id, reason) in &applied.removed_makers {
            operations.push_removal(*order_id, *reason);
        }

        applied
    }
}

#[cfg(test)]
mod tests {
    use super::super::core::test_support::*;
    use super::*;
    use crate::types::Subticks;

    #[test]
    fn plan_walks_best_price_first() {
        let (clob, _) = setup();
        clob.place_order(sell(1, 1, 5, 11)).unwrap();
        clob.place_order(sell(2, 1, 5, 10)).unwrap();
        clob.place_order(sell(3, 1, 5, 12)).unwrap();

        let taker = buy(4, 1, 8, 11);
        let market = clob.market(PAIR).unwrap().lock();
        let plan = clob.plan_match(&market, &TakerSpec::for_order(&taker, 8));

        let makers: Vec<(u64, u64)> = plan
            .fills
            .iter()
            .map(|f| (f.maker.subaccount_id().owner, f.quantums))
            .collect();
        assert_eq!(makers, vec![(2, 5), (1, 3)]);
        assert_eq!(plan.taker_filled, 8);
        assert!(plan.stop.is_none());
        // planning leaves the book untouched
        assert_eq!(market.book.order_count(), 3);
    }

    #[test]
    fn self_trade_removes_maker_only() {
        let (clob, _) = setup();
        clob.place_order(sell(1, 1, 5, 10)).unwrap();
        clob.place_order(sell(2, 1, 5, 10)).unwrap();

        let taker = buy(1, 2, 5, 10);
        let market = clob.market(PAIR).unwrap().lock();
        let plan = clob.plan_match(&market, &TakerSpec::for_order(&taker, 5));
        assert_eq!(plan.removals.len(), 1);
        assert_eq!(plan.removals[0].1, RemovalReason::SelfTrade);
        assert_eq!(plan.fills[0].maker.subaccount_id(), sub(2));
    }

    #[test]
    fn undercollateralized_maker_is_skipped() {
        let (clob, ledger) = setup();
        clob.place_order(sell(1, 1, 5, 10)).unwrap();
        clob.place_order(sell(2, 1, 5, 10)).unwrap();
        ledger.freeze(sub(1));

        let taker = buy(3, 1, 5, 10);
        let market = clob.market(PAIR).unwrap().lock();
        let plan = clob.plan_match(&market, &TakerSpec::for_order(&taker, 5));
        assert_eq!(plan.removals[0].1, RemovalReason::Undercollateralized);
        assert_eq!(plan.fills.len(), 1);
        assert_eq!(plan.fills[0].maker.subaccount_id(), sub(2));
    }

    #[test]
    fn undercollateralized_taker_stops() {
        let (clob, ledger) = setup();
        clob.place_order(sell(1, 1, 5, 10)).unwrap();
        ledger.freeze(sub(3));

        let taker = buy(3, 1, 5, 10);
        let market = clob.market(PAIR).unwrap().lock();
        let plan = clob.plan_match(&market, &TakerSpec::for_order(&taker, 5));
        assert!(plan.fills.is_empty());
        assert_eq!(plan.stop, Some(MatchStop::TakerUndercollateralized));
    }

    #[test]
    fn reduce_only_taker_clipped_to_position() {
        let (clob, ledger) = setup();
        ledger.set_position(sub(3), PAIR, 3);
        clob.place_order(buy(1, 1, 10, 10)).unwrap();

        let taker = sell(3, 1, 10, 10).with_reduce_only();
        let market = clob.market(PAIR).unwrap().lock();
        let plan = clob.plan_match(&market, &TakerSpec::for_order(&taker, 10));
        assert_eq!(plan.taker_filled, 3);
        assert_eq!(plan.stop, Some(MatchStop::ReduceOnly));
    }

    #[test]
    fn non_crossing_book_plans_nothing() {
        let (clob, _) = setup();
        clob.place_order(sell(1, 1, 5, 12)).unwrap();
        let market = clob.market(PAIR).unwrap().lock();
        let mut spec = TakerSpec::for_order(&buy(2, 1, 5, 11), 5);
        assert!(clob.plan_match(&market, &spec).fills.is_empty());
        spec.subticks = Subticks(12);
        assert_eq!(clob.plan_match(&market, &spec).taker_filled, 5);
    }

    #[test]
    fn reduce_only_cap_direction() {
        assert_eq!(reduce_only_cap(5, Side::Sell), 5);
        assert_eq!(reduce_only_cap(5, Side::Buy), 0);
        assert_eq!(reduce_only_cap(-4, Side::Buy), 4);
        assert_eq!(reduce_only_cap(0, Side::Sell), 0);
    }
}
