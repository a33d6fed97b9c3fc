//! Order placement, replacement and cancellation.

use super::config::ExecMode;
use super::core::{MarketBook, MemClob};
use super::matching::{MatchStop, MatchTaker, TakerSpec};
use super::results::{CancelResult, EngineError, OrderResult};
use crate::order::{GoodTil, Order, OrderId, OrderStatus, OrderVariant, RemovalReason, ReplacementError, TimeInForce};
use crate::rate_limit::RateLimitClass;
use crate::types::fill_amount_to_quote;
use log::debug;

impl MemClob {
    /// Place (or replace) an order. Speculative placements are rate limited.
    pub fn place_order(&self, order: Order) -> Result<OrderResult, EngineError> {
        self.place_order_with(order, self.mode == ExecMode::Speculative)
    }

    pub(super) fn place_order_with(&self, order: Order, rate_limited: bool) -> Result<OrderResult, EngineError> {
        let clob_pair_id = order.clob_pair_id();
        let pair = self.market(clob_pair_id)?.lock().config.clone();
        if !pair.is_active() {
            return Err(EngineError::MarketNotActive(clob_pair_id));
        }
        order.validate_basic(&self.ctx, &pair, &self.config)?;

        let subaccount_id = order.subaccount_id();
        if rate_limited {
            let class = if order.id.is_short_term() {
                RateLimitClass::ShortTermPlacement
            } else {
                RateLimitClass::StatefulPlacement
            };
            self.rate_limiter.admit(class, subaccount_id, self.ctx.height)?;
        }

        // counted before the target market is locked
        let stateful_count = order
            .id
            .flags
            .counts_toward_stateful_limit()
            .then(|| self.stateful_order_count(subaccount_id));

        let mut market = self.market(clob_pair_id)?.lock();
        self.place_in_market(&mut market, order, stateful_count)
    }

    fn place_in_market(
        &self,
        market: &mut MarketBook,
        order: Order,
        stateful_count: Option<u32>,
    ) -> Result<OrderResult, EngineError> {
        // replay of a placement already regenerated by an earlier match
        if self.mode == ExecMode::Finalize && self.operations.lock().is_queued(&order) {
            return Ok(unchanged(market, &order));
        }

        if let Some(cancel_good_til) = market.cancels.get(&order.id).copied() {
            if !order.good_til.strictly_after(&cancel_good_til) {
                return Err(EngineError::CancelledOrder {
                    order_id: order.id,
                    cancel_good_til,
                });
            }
        }

        let existing = market.find_order(&order.id).cloned();
        match &existing {
            Some(existing) if *existing == order => {
                if self.mode == ExecMode::Finalize {
                    return Ok(unchanged(market, &order));
                }
                return Err(EngineError::DuplicateOrder(order.id));
            }
            Some(existing) => order.validate_replacement(existing)?,
            None => {
                if let Some(count) = stateful_count {
                    let max = self.config.orders.max_stateful_orders_per_subaccount;
                    if count >= max {
                        return Err(EngineError::StatefulOrderLimit {
                            subaccount_id: order.subaccount_id(),
                            count,
                            max,
                        });
                    }
                }
            }
        }

        let filled_before = match market.twaps.get(&order.id) {
            Some(placement) => placement.filled_quantums(),
            None => market.filled(&order.id),
        };
        if filled_before > 0 {
            let fully_filled = existing.as_ref().map_or(order.quantums, |e| e.quantums);
            if filled_before >= fully_filled {
                return Err(ReplacementError::FullyFilled.into());
            }
            if order.quantums < filled_before {
                return Err(ReplacementError::BelowFilledAmount {
                    filled: filled_before,
                    quantums: order.quantums,
                }
                .into());
            }
        }
        let replacing = existing.is_some();

        match order.variant {
            OrderVariant::Conditional(_) => {
                if replacing {
                    self.replace_out(market, &order.id);
                }
                market.conditionals.insert(order.clone());
                self.operations.lock().push_placement(&order);
                debug!("conditional order stored id={} replacing={}", order.id, replacing);
                let mut result = OrderResult::stored(&order);
                result.total_filled = filled_before;
                result.remaining_quantums = order.quantums - filled_before;
                Ok(result)
            }
            OrderVariant::Twap(_) => {
                if replacing {
                    self.replace_out(market, &order.id);
                }
                market.twaps.insert(order.clone(), self.ctx.time);
                if filled_before > 0 {
                    market.twaps.record_fill(&order.id, filled_before);
                }
                self.operations.lock().push_placement(&order);
                debug!("twap order stored id={} replacing={}", order.id, replacing);
                let mut result = OrderResult::stored(&order);
                result.total_filled = filled_before;
                result.remaining_quantums = order.quantums - filled_before;
                Ok(result)
            }
            _ => self.match_and_rest(market, order, replacing, filled_before),
        }
    }

    fn replace_out(&self, market: &mut MarketBook, order_id: &OrderId) {
        if market.take_order(order_id).is_some() {
            self.operations.lock().push_removal(*order_id, RemovalReason::Replaced);
        }
    }

    /// Match `order` as a taker, then rest, remove or finish it. Nothing is
    /// mutated unless the placement is accepted.
    pub(super) fn match_and_rest(
        &self,
        market: &mut MarketBook,
        order: Order,
        replacing: bool,
        filled_before: u64,
    ) -> Result<OrderResult, EngineError> {
        let remaining = order.quantums - filled_before;
        let subaccount_id = order.subaccount_id();

        if order.time_in_force == TimeInForce::PostOnly && market.book.would_cross(order.side, order.subticks) {
            return Err(EngineError::PostOnlyWouldCross(order.id));
        }

        if !order.reduce_only {
            let quote = fill_amount_to_quote(order.subticks, remaining, market.config.quantum_conversion_exponent);
            let mut delta = market.pending_delta(subaccount_id);
            delta.add_fill(order.side, remaining, quote.value());
            if !self.collateral.check_collateralization(subaccount_id, &delta).is_success() {
                return Err(EngineError::Undercollateralized { subaccount_id });
            }
        }

        let plan = self.plan_match(market, &TakerSpec::for_order(&order, remaining));
        if order.time_in_force == TimeInForce::FOK && plan.taker_filled < remaining {
            return Err(EngineError::FillOrKillNotFilled {
                order_id: order.id,
                filled: plan.taker_filled,
                quantums: remaining,
            });
        }

        if replacing {
            self.replace_out(market, &order.id);
        }
        self.operations.lock().push_placement(&order);
        let applied = self.apply_plan(market, MatchTaker::Order(&order), &plan);

        let total_filled = filled_before + plan.taker_filled;
        if total_filled > 0 && !matches!(order.variant, OrderVariant::TwapSuborder) {
            market.set_filled(&order, total_filled);
        }

        let remainder = order.quantums - total_filled;
        let (status, is_resting) = if remainder == 0 {
            (OrderStatus::FullyFilled, false)
        } else {
            match plan.stop {
                Some(MatchStop::TakerUndercollateralized) => {
                    (OrderStatus::Removed(RemovalReason::Undercollateralized), false)
                }
                Some(MatchStop::ReduceOnly) => (OrderStatus::Removed(RemovalReason::ReduceOnlyResized), false),
                _ if order.time_in_force.is_immediate() => {
                    (OrderStatus::Removed(RemovalReason::ImmediateOrCancelRemainder), false)
                }
                _ if total_filled > 0 => (OrderStatus::PartiallyFilled, true),
                _ => (OrderStatus::Open, true),
            }
        };
        if is_resting {
            market.rest(order.clone());
        } else {
            market.set_status(&order, status);
        }

        debug!(
            "order placed id={} filled={} remaining={} status={:?}",
            order.id, plan.taker_filled, remainder, status
        );

        Ok(OrderResult {
            order_id: order.id,
            status,
            filled_quantums: plan.taker_filled,
            total_filled,
            remaining_quantums: remainder,
            fills: applied.fills,
            is_resting,
            removed_makers: applied.removed_makers,
        })
    }

    /// Cancel an order until `good_til`. The cancel is recorded even when no
    /// order with this id exists, blocking later placements up to `good_til`.
    pub fn cancel_order(&self, order_id: OrderId, good_til: GoodTil) -> Result<CancelResult, EngineError> {
        let market = self.market(order_id.clob_pair_id)?;
        self.validate_cancel_good_til(&order_id, good_til)?;
        if self.mode == ExecMode::Speculative && order_id.is_short_term() {
            self.rate_limiter
                .admit(RateLimitClass::ShortTermCancellation, order_id.subaccount_id, self.ctx.height)?;
        }

        let mut market = market.lock();
        if let Some(existing) = market.cancels.get(&order_id).copied() {
            if !good_til.strictly_after(&existing) {
                return Err(EngineError::CancelGoodTilNotIncreased {
                    order_id,
                    existing,
                    requested: good_til,
                });
            }
        }
        if let Some(order) = market.find_order(&order_id) {
            if !good_til.strictly_after(&order.good_til) {
                return Err(EngineError::CancelGoodTilTooLow {
                    order_id,
                    existing: order.good_til,
                    requested: good_til,
                });
            }
        }

        let removed = market.take_order(&order_id);
        if let Some(order) = &removed {
            market.set_status(order, OrderStatus::Cancelled);
        }
        market.cancels.insert(order_id, good_til);
        self.operations.lock().push_cancellation(order_id, good_til);
        debug!("order cancelled id={} good_til={} removed={}", order_id, good_til, removed.is_some());

        Ok(CancelResult {
            order_id,
            good_til,
            removed,
        })
    }

    // a cancel may outlive the placement window by one block or one second,
    // so it can always exceed the good-til of any admissible order
    fn validate_cancel_good_til(&self, order_id: &OrderId, good_til: GoodTil) -> Result<(), EngineError> {
        let limits = &self.config.orders;
        let valid = match (order_id.is_short_term(), good_til) {
            (true, GoodTil::Block(height)) => {
                height >= self.ctx.height && height <= self.ctx.height.saturating_add(limits.short_block_window + 1)
            }
            (false, GoodTil::BlockTime(time)) => {
                time > self.ctx.time && time <= self.ctx.time.saturating_add_secs(limits.stateful_time_window_secs + 1)
            }
            _ => false,
        };
        if valid {
            Ok(())
        } else {
            Err(EngineError::InvalidCancelGoodTil {
                order_id: *order_id,
                good_til,
            })
        }
    }
}

// result for a placement that leaves the book as it is
fn unchanged(market: &MarketBook, order: &Order) -> OrderResult {
    let total_filled = match market.twaps.get(&order.id) {
        Some(placement) => placement.filled_quantums(),
        None => market.filled(&order.id),
    };
    OrderResult {
        order_id: order.id,
        status: market.status_of(&order.id).unwrap_or(OrderStatus::Open),
        filled_quantums: 0,
        total_filled,
        remaining_quantums: order.quantums.saturating_sub(total_filled),
        fills: Vec::new(),
        is_resting: market.book.contains(&order.id),
        removed_makers: Vec::new(),
    }
}
