// 8.7 engine/blocks.rs: block lifecycle. speculative state is rebuilt from the
// committed snapshot; deliver_operations replays a proposal against it in finalize
// mode and rejects the block when the regenerated queue differs.

use super::config::ExecMode;
use super::core::{MarketBook, MemClob};
use super::results::{BlockSettlement, EndBlockSummary, EngineError, OrderResult};
use crate::operations::{ClobMatch, Operation};
use crate::order::{Order, OrderStatus};
use crate::proposal::{OperationsSource, ProposalError};
use crate::types::BlockContext;
use log::{debug, info, warn};

impl MemClob {
    pub fn begin_block(&mut self, ctx: BlockContext) {
        debug!("begin block height={} time={}", ctx.height, ctx.time);
        self.ctx = ctx;
        self.mode = ExecMode::Speculative;
    }

    /// Expire orders, prune fill and cancel records, then fire triggers.
    pub fn end_block(&mut self) -> EndBlockSummary {
        let mut summary = EndBlockSummary::default();
        let ids: Vec<_> = self.markets.keys().copied().collect();
        for clob_pair_id in ids {
            let Some(market) = self.markets.get(&clob_pair_id) else {
                continue;
            };
            let mut market = market.lock();
            self.expire_orders(&mut market, &mut summary);
            if market.config.is_active() {
                self.fire_conditionals(&mut market, &mut summary);
                self.fire_twap_legs(&mut market, &mut summary);
            }
        }
        if !summary.expired.is_empty() {
            debug!("expired {} orders at height {}", summary.expired.len(), self.ctx.height);
        }
        summary
    }

    fn expire_orders(&self, market: &mut MarketBook, summary: &mut EndBlockSummary) {
        let ctx = self.ctx;
        market.statuses.retain(|_, (status, good_til)| !(status.is_terminal() && good_til.expires_by(&ctx)));

        let mut expired: Vec<Order> = market
            .book
            .short_term_expiring_by(ctx.height)
            .iter()
            .filter_map(|id| market.remove_resting(id))
            .collect();
        let stateful: Vec<_> = market
            .stateful_expirations
            .iter()
            .take_while(|(time, _)| *time <= ctx.time)
            .map(|(_, id)| *id)
            .collect();
        expired.extend(stateful.iter().filter_map(|id| market.remove_resting(id)));
        expired.extend(market.conditionals.prune_expired(&ctx));
        expired.extend(market.twaps.prune_expired(&ctx).into_iter().map(|p| p.order));

        for order in expired {
            market.set_status(&order, OrderStatus::Expired);
            summary.expired.push(order.id);
        }

        for id in market.fills.keys_where(|_, record| record.prunable_after.expires_by(&ctx)) {
            market.fills.remove(&id);
        }
        for id in market.cancels.keys_where(|_, good_til| good_til.expires_by(&ctx)) {
            market.cancels.remove(&id);
        }
    }

    /// Fold this block into the committed snapshot and return what it changed
    /// outside the book. The caller applies the settlement to its subaccounts.
    pub fn commit(&mut self) -> BlockSettlement {
        let mut position_deltas = Vec::new();
        for market in self.markets.values_mut() {
            let market = market.get_mut();
            position_deltas.extend(std::mem::take(&mut market.block_deltas));
            market.fills.commit();
            market.cancels.commit();
            self.snapshot.insert(market.config.id, market.clone());
        }

        let insurance_deltas = std::mem::take(self.insurance.get_mut())
            .into_iter()
            .map(|(id, fund)| (id, fund.total_deposits.value() - fund.total_payouts.value()))
            .filter(|(_, delta)| !delta.is_zero())
            .collect();
        self.committed_withdrawals = *self.withdrawals.get_mut();
        self.rate_limiter.prune(self.ctx.height.next());
        self.liquidations.get_mut().reset();
        self.operations.get_mut().clear();
        self.mode = ExecMode::Speculative;

        let settlement = BlockSettlement {
            height: self.ctx.height,
            position_deltas,
            insurance_deltas,
            withdrawals_gated_at: self.committed_withdrawals.gated_at(),
        };
        info!(
            "committed height={} subaccounts={} markets={}",
            settlement.height,
            settlement.position_deltas.len(),
            self.snapshot.len()
        );
        settlement
    }

    /// Reset every market, the queue and the per-block liquidation state to the
    /// last commit.
    fn restore_committed(&mut self) {
        for (clob_pair_id, market) in self.markets.iter_mut() {
            if let Some(committed) = self.snapshot.get(clob_pair_id) {
                *market.get_mut() = committed.clone();
            }
        }
        self.operations.get_mut().clear();
        self.liquidations.get_mut().reset();
        self.insurance.get_mut().clear();
        *self.withdrawals.get_mut() = self.committed_withdrawals;
    }

    /// Drop speculative state and re-place the locally pending orders on top of
    /// the committed snapshot. Pending orders were rate limited on first admission.
    pub fn discard_speculative(&mut self, pending: Vec<Order>) -> Vec<Result<OrderResult, EngineError>> {
        self.restore_committed();
        self.mode = ExecMode::Speculative;
        let results: Vec<_> = pending.into_iter().map(|order| self.place_order_with(order, false)).collect();
        debug!(
            "rebuilt speculative state: {} of {} pending orders placed",
            results.iter().filter(|r| r.is_ok()).count(),
            results.len()
        );
        results
    }

    /// Replay a proposed operations queue against committed state.
    pub fn deliver_operations(&mut self, operations: &[Operation]) -> Result<(), EngineError> {
        self.restore_committed();
        self.mode = ExecMode::Finalize;

        for operation in operations.iter().filter(|op| op.is_replay_input()) {
            if let Err(err) = self.replay(operation) {
                debug!("replayed operation rejected at height {}: {}", self.ctx.height, err);
            }
        }

        if let Some(index) = self.operations.lock().first_divergence(operations) {
            warn!(
                "replay diverged at height {} index {} (proposed {} operations)",
                self.ctx.height,
                index,
                operations.len()
            );
            return Err(EngineError::ReplayDiverged { index });
        }
        info!("delivered {} operations at height {}", operations.len(), self.ctx.height);
        Ok(())
    }

    fn replay(&self, operation: &Operation) -> Result<(), EngineError> {
        match operation {
            Operation::OrderPlacement(order) => {
                self.place_order_with(order.clone(), false)?;
            }
            Operation::OrderCancellation { order_id, good_til } => {
                self.cancel_order(*order_id, *good_til)?;
            }
            Operation::Match(ClobMatch::Liquidation(m)) => {
                self.execute_liquidation_match(&m.order)?;
            }
            Operation::Match(ClobMatch::Deleveraging(d)) => {
                self.execute_deleveraging(d.liquidated_subaccount_id, d.clob_pair_id, d.delta_quantums)?;
            }
            Operation::Match(ClobMatch::Orders(_)) | Operation::OrderRemoval(_) => {}
        }
        Ok(())
    }

    /// Encoded operations queue for the proposer. Empty when nothing was queued.
    pub fn operations_payload(&self) -> Result<Vec<u8>, EngineError> {
        let operations = self.operations.lock();
        if operations.is_empty() {
            return Ok(Vec::new());
        }
        operations.encode().map_err(|e| EngineError::Encoding(e.to_string()))
    }
}

impl OperationsSource for MemClob {
    fn operations_payload(&self) -> Result<Vec<u8>, ProposalError> {
        MemClob::operations_payload(self).map_err(|e| ProposalError::Unavailable {
            slot: "operations",
            reason: e.to_string(),
        })
    }
}
