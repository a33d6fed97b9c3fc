// 6.2: deleveraging. when the book cannot absorb a liquidation, the residual is
// offset directly against subaccounts holding the opposite position.
// largest opposite positions are offset first; ties break on subaccount id.

use crate::collaborators::SubaccountRisk;
use crate::config::ClobPairStatus;
use crate::liquidation::{bankruptcy_quote, LiquidationError, MarketRisk};
use crate::types::{ClobPairId, SubaccountId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleveragingCandidate {
    pub subaccount_id: SubaccountId,
    pub position_quantums: i128,
}

impl PartialOrd for DeleveragingCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeleveragingCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // larger positions first, then by subaccount id for stability
        other
            .position_quantums
            .abs()
            .cmp(&self.position_quantums.abs())
            .then(self.subaccount_id.cmp(&other.subaccount_id))
    }
}

/// Opposite-side holders of the market, ranked and capped at `max_candidates`.
/// `liquidated_position` is the position being closed.
pub fn rank_candidates(
    positions: Vec<(SubaccountId, i128)>,
    liquidated: SubaccountId,
    liquidated_position: i128,
    max_candidates: usize,
) -> Vec<DeleveragingCandidate> {
    let mut candidates: Vec<DeleveragingCandidate> = positions
        .into_iter()
        .filter(|(id, _)| *id != liquidated)
        .filter(|(_, pos)| *pos != 0 && pos.signum() == -liquidated_position.signum())
        .map(|(subaccount_id, position_quantums)| DeleveragingCandidate {
            subaccount_id,
            position_quantums,
        })
        .collect();

    candidates.sort();
    candidates.truncate(max_candidates);
    candidates
}

/// Size the liquidated subaccount can offset against `candidate_position`, signed
/// like `remaining_delta`. None when the candidate no longer holds the opposite side.
pub fn offset_quantums(remaining_delta: i128, candidate_position: i128) -> Option<i128> {
    if remaining_delta == 0 || candidate_position.signum() != remaining_delta.signum() {
        return None;
    }
    Some(remaining_delta.signum() * remaining_delta.abs().min(candidate_position.abs()))
}

/// Final-settlement markets close at the oracle price while the subaccount is solvent.
pub fn uses_oracle_price(status: ClobPairStatus, net_collateral: Decimal) -> bool {
    status == ClobPairStatus::FinalSettlement && net_collateral >= Decimal::ZERO
}

/// Quote the liquidated subaccount receives for closing `delta`.
pub fn settlement_quote(
    market: &MarketRisk,
    status: ClobPairStatus,
    position: i128,
    delta: i128,
    risk: &SubaccountRisk,
) -> Result<Decimal, LiquidationError> {
    if uses_oracle_price(status, risk.net_collateral) {
        return Ok(-market.notional(delta));
    }
    bankruptcy_quote(market, position, delta, risk)
}

/// The counterparty receives `-liquidated_quote` for taking the other side.
/// The offset only happens if that does not push the counterparty past its own
/// bankruptcy price.
pub fn overlaps(liquidated_quote: Decimal, counterparty_bankruptcy_quote: Decimal) -> bool {
    -liquidated_quote >= counterparty_bankruptcy_quote
}

/// One offset against a counterparty. `fill_quantums` is unsigned; the side
/// follows from the liquidated position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleveragingFill {
    pub offsetting_subaccount_id: SubaccountId,
    pub fill_quantums: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleveragingResult {
    pub liquidated_subaccount_id: SubaccountId,
    pub clob_pair_id: ClobPairId,
    pub fills: Vec<DeleveragingFill>,
    // signed delta still unresolved for the liquidated subaccount
    pub remaining_delta: i128,
    pub withdrawals_gated: bool,
}

impl DeleveragingResult {
    pub fn total_quantums(&self) -> u64 {
        self.fills.iter().map(|f| f.fill_quantums).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.remaining_delta == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Subticks;
    use rust_decimal_macros::dec;

    fn sub(owner: u64) -> SubaccountId {
        SubaccountId::new(owner, 0)
    }

    #[test]
    fn ranking_prefers_largest_opposite_position() {
        let positions = vec![(sub(1), -5), (sub(2), -20), (sub(3), 7), (sub(4), -20), (sub(9), 100)];
        // liquidating the long held by sub 9: only shorts qualify
        let ranked = rank_candidates(positions, sub(9), 100, 10);
        let ids: Vec<u64> = ranked.iter().map(|c| c.subaccount_id.owner).collect();
        assert_eq!(ids, vec![2, 4, 1]);
    }

    #[test]
    fn ranking_respects_iteration_cap() {
        let positions: Vec<_> = (1..=50).map(|i| (sub(i), i as i128)).collect();
        let ranked = rank_candidates(positions, sub(99), -10, 5);
        assert_eq!(ranked.len(), 5);
        assert_eq!(ranked[0].subaccount_id, sub(50));
    }

    #[test]
    fn offset_is_bounded_by_counterparty() {
        // selling 30 from a long against a short of 20 (counterparty buys 20)
        assert_eq!(offset_quantums(-30, -20), Some(-20));
        assert_eq!(offset_quantums(-10, -20), Some(-10));
        assert_eq!(offset_quantums(15, 40), Some(15));
        // counterparty flipped sides since ranking
        assert_eq!(offset_quantums(-10, 5), None);
        assert_eq!(offset_quantums(0, 5), None);
    }

    #[test]
    fn final_settlement_uses_oracle_when_solvent() {
        let market = MarketRisk {
            clob_pair_id: ClobPairId(0),
            oracle: Subticks(100),
            exponent: 0,
            maintenance_margin_ppm: 50_000,
        };
        let solvent = SubaccountRisk {
            net_collateral: dec!(10),
            maintenance_margin: dec!(500),
        };
        let quote = settlement_quote(&market, ClobPairStatus::FinalSettlement, 100, -100, &solvent).unwrap();
        assert_eq!(quote, dec!(10_000));

        let active = settlement_quote(&market, ClobPairStatus::Active, 100, -100, &solvent).unwrap();
        assert_eq!(active, dec!(9_990));

        let insolvent = SubaccountRisk {
            net_collateral: dec!(-10),
            maintenance_margin: dec!(500),
        };
        assert!(!uses_oracle_price(ClobPairStatus::FinalSettlement, insolvent.net_collateral));
    }

    #[test]
    fn overlap_check() {
        // liquidated long receives 9,600 to sell; counterparty short pays 9,600
        assert!(overlaps(dec!(9_600), dec!(-9_700)));
        assert!(overlaps(dec!(9_600), dec!(-9_600)));
        assert!(!overlaps(dec!(9_600), dec!(-9_500)));
    }
}
