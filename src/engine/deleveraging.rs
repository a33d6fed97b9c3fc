// 8.6 engine/deleveraging.rs: offsets a liquidation residual directly against
// opposite-side positions in the same market.
// candidate risk outside the market is read before the market is locked.

use super::core::MemClob;
use crate::config::ClobPairStatus;
use crate::deleveraging::{
    offset_quantums, overlaps, rank_candidates, settlement_quote, DeleveragingFill, DeleveragingResult,
};
use crate::liquidation::{bankruptcy_quote, validate_position_delta, LiquidationError};
use crate::operations::{ClobMatch, MatchDeleveraging};
use crate::types::{ClobPairId, Side, SubaccountId};
use log::{debug, info, warn};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};

impl MemClob {
    /// Subaccounts holding a position in any final-settlement market, committed
    /// or traded this block.
    pub fn final_settlement_subaccounts(&self) -> Vec<SubaccountId> {
        let mut ids = BTreeSet::new();
        for clob_pair_id in self.clob_pair_ids() {
            let Ok(market) = self.market(clob_pair_id) else {
                continue;
            };
            let market = market.lock();
            if market.config.status != ClobPairStatus::FinalSettlement {
                continue;
            }
            let mut holders: BTreeSet<SubaccountId> = [Side::Buy, Side::Sell]
                .into_iter()
                .flat_map(|side| self.subaccounts.subaccounts_with_position(clob_pair_id, side))
                .collect();
            holders.extend(market.block_deltas.keys().copied());
            ids.extend(holders.into_iter().filter(|id| self.position_in(&market, *id) != 0));
        }
        ids.into_iter().collect()
    }

    /// Close every position the subaccounts hold in final-settlement markets
    /// against opposite holders. Solvent subaccounts settle at the oracle price.
    pub fn deleverage_final_settlement(&self, subaccount_ids: &[SubaccountId]) -> Vec<DeleveragingResult> {
        let mut results = Vec::new();
        for &subaccount_id in subaccount_ids {
            for (clob_pair_id, position) in self.current_positions(subaccount_id) {
                let settling = self
                    .clob_pair(clob_pair_id)
                    .is_some_and(|pair| pair.status == ClobPairStatus::FinalSettlement);
                if !settling {
                    continue;
                }
                match self.execute_deleveraging(subaccount_id, clob_pair_id, -position) {
                    Ok(result) => results.push(result),
                    Err(err) => warn!(
                        "final settlement failed subaccount={} clob={} err={}",
                        subaccount_id, clob_pair_id, err
                    ),
                }
            }
        }
        results
    }

    /// Close up to `delta_quantums` of the subaccount's position in `clob_pair_id`
    /// against the largest opposite positions. Replayed as-is for
    /// `Match(Deleveraging)` operations.
    pub(super) fn execute_deleveraging(
        &self,
        subaccount_id: SubaccountId,
        clob_pair_id: ClobPairId,
        delta_quantums: i128,
    ) -> Result<DeleveragingResult, LiquidationError> {
        let pair = self
            .clob_pair(clob_pair_id)
            .ok_or(LiquidationError::MissingMarketRisk(clob_pair_id))?;
        let market_risk = self
            .market_risk(&pair)
            .map_err(|_| LiquidationError::MissingMarketRisk(clob_pair_id))?;
        let market = self
            .market(clob_pair_id)
            .map_err(|_| LiquidationError::MissingMarketRisk(clob_pair_id))?;
        let max_candidates = self.config.liquidations.max_deleveraging_subaccounts_to_iterate as usize;

        // candidates: committed holders of the other side plus anyone who traded this block
        let (position, candidate_ids) = {
            let market = market.lock();
            let position = self.position_in(&market, subaccount_id);
            let opposite = if position > 0 { Side::Sell } else { Side::Buy };
            let mut ids: BTreeSet<SubaccountId> = self
                .subaccounts
                .subaccounts_with_position(clob_pair_id, opposite)
                .into_iter()
                .collect();
            ids.extend(market.block_deltas.keys().copied());
            let positions: Vec<(SubaccountId, i128)> =
                ids.into_iter().map(|id| (id, self.position_in(&market, id))).collect();
            let ranked = rank_candidates(positions, subaccount_id, position, max_candidates);
            (position, ranked.into_iter().map(|c| c.subaccount_id).collect::<Vec<_>>())
        };
        validate_position_delta(position, delta_quantums)?;

        let liquidated_outside = self
            .risk_outside(subaccount_id, Some(clob_pair_id))
            .ok_or(LiquidationError::UnknownSubaccount(subaccount_id))?;
        let candidates_outside: BTreeMap<SubaccountId, _> = candidate_ids
            .iter()
            .filter_map(|id| Some((*id, self.risk_outside(*id, Some(clob_pair_id))?)))
            .collect();

        let mut market = market.lock();
        let mut remaining = delta_quantums;
        let mut fills = Vec::new();

        for candidate_id in &candidate_ids {
            if remaining == 0 {
                break;
            }
            let Some(outside) = candidates_outside.get(candidate_id) else {
                continue;
            };
            let position = self.position_in(&market, subaccount_id);
            let candidate_position = self.position_in(&market, *candidate_id);
            let Some(offset) = offset_quantums(remaining, candidate_position) else {
                continue;
            };

            let risk = self.with_block_fills(liquidated_outside, &market, subaccount_id);
            let liquidated_quote = match settlement_quote(&market_risk, pair.status, position, offset, &risk) {
                Ok(quote) => quote,
                Err(err) => {
                    warn!("deleveraging pricing failed subaccount={} err={}", subaccount_id, err);
                    break;
                }
            };
            let candidate_risk = self.with_block_fills(*outside, &market, *candidate_id);
            let Ok(candidate_bankruptcy) = bankruptcy_quote(&market_risk, candidate_position, -offset, &candidate_risk)
            else {
                continue;
            };
            if !overlaps(liquidated_quote, candidate_bankruptcy) {
                debug!(
                    "deleveraging skipped candidate={} quote={} bankruptcy={}",
                    candidate_id, liquidated_quote, candidate_bankruptcy
                );
                continue;
            }

            market.add_block_delta(subaccount_id, offset, liquidated_quote);
            market.add_block_delta(*candidate_id, -offset, -liquidated_quote);
            fills.push(DeleveragingFill {
                offsetting_subaccount_id: *candidate_id,
                fill_quantums: u64::try_from(offset.unsigned_abs()).unwrap_or(u64::MAX),
            });
            remaining -= offset;
        }

        let risk = self.with_block_fills(liquidated_outside, &market, subaccount_id);
        let withdrawals_gated = remaining != 0 && risk.net_collateral < Decimal::ZERO;
        if withdrawals_gated {
            self.withdrawals.lock().gate(self.ctx.height);
            warn!(
                "withdrawals gated at height {}: subaccount {} has unresolved residual {} in clob {}",
                self.ctx.height, subaccount_id, remaining, clob_pair_id
            );
        }

        if !fills.is_empty() || withdrawals_gated {
            self.operations.lock().push_match(ClobMatch::Deleveraging(MatchDeleveraging {
                liquidated_subaccount_id: subaccount_id,
                clob_pair_id,
                delta_quantums,
                fills: fills.clone(),
                withdrawals_gated,
            }));
        }
        drop(market);

        let result = DeleveragingResult {
            liquidated_subaccount_id: subaccount_id,
            clob_pair_id,
            fills,
            remaining_delta: remaining,
            withdrawals_gated,
        };
        info!(
            "deleveraging subaccount={} clob={} offset={} remaining={}",
            subaccount_id,
            clob_pair_id,
            result.total_quantums(),
            result.remaining_delta
        );
        Ok(result)
    }
}
