//! Liquidation of undercollateralized subaccounts.
//!
//! Each liquidatable subaccount gets at most one liquidation order per call: the
//! open position with the largest notional that has not been liquidated this
//! block, sized by the position and subaccount block limits and priced at the
//! fillable price. Orders run in priority order against the book as takers that
//! never rest. Whatever the book and insurance fund cannot absorb goes to
//! deleveraging.

use super::core::MemClob;
use super::matching::{AppliedMatch, LiquidationContext, MatchPlan, MatchStop, MatchTaker, TakerSpec};
use super::results::{LiquidationOutcome, LiquidationSummary};
use crate::config::ClobPairConfig;
use crate::liquidation::{
    fillable_price, fillable_price_to_subticks, liquidatable_size_delta, sort_liquidation_orders, LiquidationError,
    LiquidationOrder, MarketRisk,
};
use crate::types::{Side, SubaccountId};
use log::{debug, info, warn};
use rust_decimal::Decimal;

impl MemClob {
    /// Build, rank and execute liquidation orders for `subaccount_ids`.
    /// Positions in final-settlement markets are deleveraged first.
    /// Subaccounts that cannot be liquidated are reported in `skipped`.
    pub fn liquidate_subaccounts(&self, subaccount_ids: &[SubaccountId]) -> LiquidationSummary {
        let mut summary = LiquidationSummary {
            final_settlement: self.deleverage_final_settlement(subaccount_ids),
            ..Default::default()
        };
        let mut orders = Vec::with_capacity(subaccount_ids.len());
        for &subaccount_id in subaccount_ids {
            match self.build_liquidation_order(subaccount_id) {
                Ok(order) => orders.push(order),
                Err(err) => {
                    debug!("liquidation skipped subaccount={} reason={}", subaccount_id, err);
                    summary.skipped.push((subaccount_id, err));
                }
            }
        }
        sort_liquidation_orders(&mut orders);

        let max_attempts = self.config.liquidations.max_liquidation_attempts_per_block;
        for order in orders {
            if self.liquidations.lock().attempts() >= max_attempts {
                info!("liquidation attempts exhausted for this block max={}", max_attempts);
                break;
            }
            match self.liquidate(&order) {
                Ok(outcome) => summary.outcomes.push(outcome),
                Err(err) => {
                    warn!("liquidation failed subaccount={} err={}", order.subaccount_id, err);
                    summary.skipped.push((order.subaccount_id, err));
                }
            }
        }
        summary
    }

    /// The liquidation order for a subaccount, if it is liquidatable and has
    /// an eligible position.
    pub fn build_liquidation_order(&self, subaccount_id: SubaccountId) -> Result<LiquidationOrder, LiquidationError> {
        let risk = self
            .current_risk(subaccount_id)
            .ok_or(LiquidationError::UnknownSubaccount(subaccount_id))?;
        if !risk.is_liquidatable() {
            return Err(LiquidationError::NotLiquidatable(subaccount_id));
        }

        let limits = &self.config.liquidations;
        let (info, remaining_notional) = {
            let tracker = self.liquidations.lock();
            (
                tracker.info(subaccount_id),
                tracker.remaining_notional(subaccount_id, &limits.subaccount_block_limits),
            )
        };
        if remaining_notional <= Decimal::ZERO {
            return Err(LiquidationError::SubaccountLimitReached(subaccount_id));
        }

        let mut chosen: Option<(ClobPairConfig, MarketRisk, i128)> = None;
        let mut already_liquidated = None;
        for (clob_pair_id, position) in self.current_positions(subaccount_id) {
            if info.perpetuals_liquidated.contains(&clob_pair_id) {
                already_liquidated = Some(clob_pair_id);
                continue;
            }
            let Some(pair) = self.clob_pair(clob_pair_id).filter(|p| p.is_active()) else {
                continue;
            };
            let Ok(market) = self.market_risk(&pair) else {
                continue;
            };
            let larger = chosen
                .as_ref()
                .map_or(true, |(_, best, best_position)| market.notional(position).abs() > best.notional(*best_position).abs());
            if larger {
                chosen = Some((pair, market, position));
            }
        }
        let Some((pair, market, position)) = chosen else {
            return Err(match already_liquidated {
                Some(clob_pair_id) => LiquidationError::AlreadyLiquidated {
                    subaccount_id,
                    clob_pair_id,
                },
                None => LiquidationError::NoPositionToLiquidate(subaccount_id),
            });
        };

        let delta = liquidatable_size_delta(
            &market,
            position,
            pair.step_base_quantums,
            remaining_notional,
            &limits.position_block_limits,
        );
        let price = fillable_price(subaccount_id, &market, position, &risk, &limits.fillable_price_config)?;
        let side = Side::closing(position).ok_or(LiquidationError::NoPositionToLiquidate(subaccount_id))?;

        Ok(LiquidationOrder {
            subaccount_id,
            clob_pair_id: pair.id,
            side,
            quantums: u64::try_from(delta.unsigned_abs()).unwrap_or(u64::MAX),
            subticks: fillable_price_to_subticks(price, position > 0, &pair),
            oracle: market.oracle,
            notional: market.notional(position),
        })
    }

    fn liquidate(&self, order: &LiquidationOrder) -> Result<LiquidationOutcome, LiquidationError> {
        let (applied, plan) = self.execute_liquidation_match(order)?;

        let residual = order.quantums - plan.taker_filled;
        let insurance_stopped = matches!(
            plan.stop,
            Some(MatchStop::InsuranceLimit | MatchStop::InsuranceFundInsufficient | MatchStop::BankruptcyPriceUnavailable)
        );
        let bankrupt = self
            .current_risk(order.subaccount_id)
            .is_some_and(|risk| risk.net_collateral < Decimal::ZERO);
        let deleveraging = if residual > 0 && (insurance_stopped || bankrupt) {
            let delta = order.side.sign() * i128::from(residual);
            Some(self.execute_deleveraging(order.subaccount_id, order.clob_pair_id, delta)?)
        } else {
            None
        };

        Ok(LiquidationOutcome {
            order: *order,
            fills: applied.fills,
            filled_quantums: plan.taker_filled,
            insurance_delta: plan.insurance_delta(),
            stop: plan.stop,
            deleveraging,
        })
    }

    /// Match a liquidation order against the book and settle its insurance
    /// fund deltas. Replayed as-is for `Match(Liquidation)` operations.
    pub(super) fn execute_liquidation_match(
        &self,
        order: &LiquidationOrder,
    ) -> Result<(AppliedMatch, MatchPlan), LiquidationError> {
        let subaccount_id = order.subaccount_id;
        let clob_pair_id = order.clob_pair_id;
        {
            let mut tracker = self.liquidations.lock();
            tracker.record_attempt();
            tracker.mark_liquidated(subaccount_id, clob_pair_id);
        }

        let limits = &self.config.liquidations;
        let pair = self
            .clob_pair(clob_pair_id)
            .ok_or(LiquidationError::MissingMarketRisk(clob_pair_id))?;
        let market_risk = self
            .market_risk(&pair)
            .map_err(|_| LiquidationError::MissingMarketRisk(clob_pair_id))?;
        let outside = self
            .risk_outside(subaccount_id, Some(clob_pair_id))
            .ok_or(LiquidationError::UnknownSubaccount(subaccount_id))?;
        let remaining_insurance_lost = self
            .liquidations
            .lock()
            .remaining_insurance_lost(subaccount_id, &limits.subaccount_block_limits);
        let fund_balance = self.insurance_fund(clob_pair_id).balance.value();

        let (applied, plan) = {
            let mut market = self
                .market(clob_pair_id)
                .map_err(|_| LiquidationError::MissingMarketRisk(clob_pair_id))?
                .lock();
            let position = self.position_in(&market, subaccount_id);
            let closable = if Side::closing(position) == Some(order.side) {
                u64::try_from(position.unsigned_abs()).unwrap_or(u64::MAX)
            } else {
                0
            };
            let taker = TakerSpec {
                subaccount_id,
                side: order.side,
                subticks: order.subticks,
                quantums: order.quantums.min(closable),
                reduce_only: false,
                liquidation: Some(LiquidationContext {
                    market: market_risk,
                    position,
                    risk: self.with_block_fills(outside, &market, subaccount_id),
                    remaining_insurance_lost,
                    fund_balance,
                    max_fee_ppm: limits.max_liquidation_fee_ppm,
                }),
            };
            let plan = self.plan_match(&market, &taker);
            let applied = self.apply_plan(&mut market, MatchTaker::Liquidation(order), &plan);
            (applied, plan)
        };

        self.apply_insurance_delta(clob_pair_id, plan.insurance_delta());
        {
            let mut tracker = self.liquidations.lock();
            for fill in &plan.fills {
                tracker.record_fill(
                    subaccount_id,
                    market_risk.notional(i128::from(fill.quantums)),
                    fill.insurance_delta,
                );
            }
        }

        info!(
            "liquidation subaccount={} clob={} side={:?} filled={} of {} insurance_delta={} stop={:?}",
            subaccount_id,
            clob_pair_id,
            order.side,
            plan.taker_filled,
            order.quantums,
            plan.insurance_delta(),
            plan.stop
        );
        Ok((applied, plan))
    }
}
