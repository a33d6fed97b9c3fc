// 8.4 engine/triggers.rs: end-of-block firing of conditional orders and twap legs.
// runs under the market lock; every resulting placement goes through the same
// matching path as a client order.

use super::core::{MarketBook, MemClob};
use super::results::{EndBlockSummary, EngineError};
use crate::conditional::process_triggers;
use crate::order::{OrderStatus, RemovalReason};
use log::{debug, info, warn};

impl MemClob {
    /// Place every conditional order the oracle price has triggered.
    pub(super) fn fire_conditionals(&self, market: &mut MarketBook, summary: &mut EndBlockSummary) {
        let Some(oracle) = self.prices.oracle_price(market.config.id) else {
            return;
        };
        let fired = process_triggers(&mut market.conditionals, oracle);
        if !fired.triggered.is_empty() {
            debug!(
                "conditionals triggered clob={} count={} dormant={}",
                market.config.id,
                fired.triggered.len(),
                fired.remaining
            );
        }

        for order in fired.triggered {
            let filled_before = market.filled(&order.id);
            match self.match_and_rest(market, order.clone(), false, filled_before) {
                Ok(result) => summary.triggered.push(result),
                Err(err) => {
                    let reason = match err {
                        EngineError::Undercollateralized { .. } => RemovalReason::Undercollateralized,
                        _ => RemovalReason::ImmediateOrCancelRemainder,
                    };
                    warn!("triggered order {} not placed: {}", order.id, err);
                    market.set_status(&order, OrderStatus::Removed(reason));
                    self.operations.lock().push_removal(order.id, reason);
                }
            }
        }
    }

    /// Place one suborder for every twap parent whose trigger is due.
    pub(super) fn fire_twap_legs(&self, market: &mut MarketBook, summary: &mut EndBlockSummary) {
        let Some(oracle) = self.prices.oracle_price(market.config.id) else {
            return;
        };
        let now = self.ctx.time;

        for parent in market.twaps.due(now) {
            let Some(leg) = market.twaps.next_leg(&parent, now, oracle, &market.config) else {
                continue;
            };
            match self.match_and_rest(market, leg.suborder.clone(), false, 0) {
                Ok(result) => {
                    market.twaps.record_fill(&parent, result.filled_quantums);
                    // keep the parent's cumulative fill queryable after it completes
                    if let Some(placement) = market.twaps.get(&parent).cloned() {
                        if placement.filled_quantums() > 0 {
                            market.set_filled(&placement.order, placement.filled_quantums());
                        }
                    }
                    summary.twap_suborders.push(result);

                    if let Some(done) = market.twaps.advance(&parent, leg.legs_consumed, leg.trigger_time) {
                        let status = if done.remaining_quantums == 0 {
                            OrderStatus::FullyFilled
                        } else {
                            OrderStatus::Expired
                        };
                        info!(
                            "twap completed id={} filled={} of {}",
                            parent,
                            done.filled_quantums(),
                            done.order.quantums
                        );
                        market.set_status(&done.order, status);
                        summary.completed_twaps.push(parent);
                    }
                }
                Err(err) => {
                    warn!("twap leg for {} failed, deleting parent: {}", parent, err);
                    if let Some(deleted) = market.twaps.remove(&parent) {
                        let reason = RemovalReason::TwapParentDeleted;
                        market.set_status(&deleted.order, OrderStatus::Removed(reason));
                        self.operations.lock().push_removal(parent, reason);
                        summary.deleted_twaps.push(parent);
                    }
                }
            }
        }
    }
}
