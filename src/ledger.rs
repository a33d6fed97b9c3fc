// 3.1 ledger.rs: in-memory subaccount ledger (mocked). implements the margin, oracle
// and balance collaborators for simulations and tests. not consensus code.

use crate::collaborators::{
    CollateralCheck, CollateralChecker, MarginParams, PositionDelta, PriceSource, SubaccountRisk,
    SubaccountSource,
};
use crate::engine::BlockSettlement;
use crate::types::{mul_ppm, position_notional, ClobPairId, Side, SubaccountId, Subticks};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy)]
struct MarketState {
    oracle: Subticks,
    margin: MarginParams,
    exponent: i32,
}

#[derive(Debug, Default)]
struct LedgerState {
    markets: BTreeMap<ClobPairId, MarketState>,
    quote_balances: BTreeMap<SubaccountId, Decimal>,
    positions: BTreeMap<SubaccountId, BTreeMap<ClobPairId, i128>>,
    insurance_funds: BTreeMap<ClobPairId, Decimal>,
    frozen: BTreeSet<SubaccountId>,
}

// (net collateral, initial margin, maintenance margin)
type Requirements = (Decimal, Decimal, Decimal);

impl LedgerState {
    fn requirements(&self, subaccount_id: SubaccountId, delta: Option<&PositionDelta>) -> Requirements {
        let mut net_collateral = self.quote_balances.get(&subaccount_id).copied().unwrap_or_default();
        let mut positions = self.positions.get(&subaccount_id).cloned().unwrap_or_default();

        if let Some(delta) = delta {
            net_collateral += delta.quote_quantums;
            *positions.entry(delta.clob_pair_id).or_default() += delta.base_quantums;
        }

        let mut initial = Decimal::ZERO;
        let mut maintenance = Decimal::ZERO;
        for (clob_pair_id, quantums) in positions {
            let Some(market) = self.markets.get(&clob_pair_id) else {
                continue;
            };
            let notional = position_notional(quantums, market.oracle, market.exponent);
            net_collateral += notional;
            initial += mul_ppm(notional.abs(), market.margin.initial_margin_ppm);
            maintenance += mul_ppm(notional.abs(), market.margin.maintenance_margin_ppm);
        }
        (net_collateral, initial, maintenance)
    }
}

/// Subaccount balances, positions and oracle prices held in memory.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: RwLock<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_market(&self, clob_pair_id: ClobPairId, oracle_subticks: u64, margin: MarginParams, exponent: i32) {
        self.state.write().markets.insert(
            clob_pair_id,
            MarketState {
                oracle: Subticks(oracle_subticks),
                margin,
                exponent,
            },
        );
    }

    pub fn set_oracle_price(&self, clob_pair_id: ClobPairId, oracle_subticks: u64) {
        if let Some(market) = self.state.write().markets.get_mut(&clob_pair_id) {
            market.oracle = Subticks(oracle_subticks);
        }
    }

    pub fn deposit(&self, subaccount_id: SubaccountId, amount: Decimal) {
        *self.state.write().quote_balances.entry(subaccount_id).or_default() += amount;
    }

    pub fn quote_balance(&self, subaccount_id: SubaccountId) -> Decimal {
        self.state.read().quote_balances.get(&subaccount_id).copied().unwrap_or_default()
    }

    pub fn set_position(&self, subaccount_id: SubaccountId, clob_pair_id: ClobPairId, quantums: i128) {
        let mut state = self.state.write();
        let positions = state.positions.entry(subaccount_id).or_default();
        if quantums == 0 {
            positions.remove(&clob_pair_id);
        } else {
            positions.insert(clob_pair_id, quantums);
        }
    }

    /// Settle a delta into the ledger, as final block execution would.
    pub fn apply_delta(&self, subaccount_id: SubaccountId, delta: &PositionDelta) {
        let current = self.position(subaccount_id, delta.clob_pair_id);
        self.deposit(subaccount_id, delta.quote_quantums);
        self.set_position(subaccount_id, delta.clob_pair_id, current + delta.base_quantums);
    }

    /// Fold a committed block into positions, balances and insurance funds.
    pub fn settle(&self, settlement: &BlockSettlement) {
        for (subaccount_id, delta) in &settlement.position_deltas {
            self.apply_delta(*subaccount_id, delta);
        }
        let mut state = self.state.write();
        for (clob_pair_id, delta) in &settlement.insurance_deltas {
            *state.insurance_funds.entry(*clob_pair_id).or_default() += *delta;
        }
    }

    pub fn set_insurance_fund(&self, clob_pair_id: ClobPairId, balance: Decimal) {
        self.state.write().insurance_funds.insert(clob_pair_id, balance);
    }

    /// Every collateral check for this subaccount fails until `unfreeze`.
    pub fn freeze(&self, subaccount_id: SubaccountId) {
        self.state.write().frozen.insert(subaccount_id);
    }

    pub fn unfreeze(&self, subaccount_id: SubaccountId) {
        self.state.write().frozen.remove(&subaccount_id);
    }
}

impl CollateralChecker for InMemoryLedger {
    fn check_collateralization(&self, subaccount_id: SubaccountId, delta: &PositionDelta) -> CollateralCheck {
        let state = self.state.read();
        if state.frozen.contains(&subaccount_id) {
            return CollateralCheck::StillUndercollateralized;
        }
        let (net_after, initial_after, _) = state.requirements(subaccount_id, Some(delta));
        if net_after >= initial_after {
            return CollateralCheck::Success;
        }
        let (net_before, initial_before, _) = state.requirements(subaccount_id, None);
        if net_before >= initial_before {
            CollateralCheck::NewlyUndercollateralized
        } else {
            CollateralCheck::StillUndercollateralized
        }
    }
}

impl PriceSource for InMemoryLedger {
    fn oracle_price(&self, clob_pair_id: ClobPairId) -> Option<Subticks> {
        self.state.read().markets.get(&clob_pair_id).map(|m| m.oracle)
    }

    fn margin_params(&self, clob_pair_id: ClobPairId) -> Option<MarginParams> {
        self.state.read().markets.get(&clob_pair_id).map(|m| m.margin)
    }
}

impl SubaccountSource for InMemoryLedger {
    fn risk(&self, subaccount_id: SubaccountId) -> Option<SubaccountRisk> {
        let state = self.state.read();
        if !state.quote_balances.contains_key(&subaccount_id) && !state.positions.contains_key(&subaccount_id) {
            return None;
        }
        let (net_collateral, _, maintenance_margin) = state.requirements(subaccount_id, None);
        Some(SubaccountRisk {
            net_collateral,
            maintenance_margin,
        })
    }

    fn position(&self, subaccount_id: SubaccountId, clob_pair_id: ClobPairId) -> i128 {
        self.state
            .read()
            .positions
            .get(&subaccount_id)
            .and_then(|p| p.get(&clob_pair_id))
            .copied()
            .unwrap_or(0)
    }

    fn open_positions(&self, subaccount_id: SubaccountId) -> Vec<(ClobPairId, i128)> {
        self.state
            .read()
            .positions
            .get(&subaccount_id)
            .map(|p| p.iter().filter(|(_, q)| **q != 0).map(|(c, q)| (*c, *q)).collect())
            .unwrap_or_default()
    }

    fn subaccounts_with_position(&self, clob_pair_id: ClobPairId, side: Side) -> Vec<SubaccountId> {
        self.state
            .read()
            .positions
            .iter()
            .filter(|(_, positions)| {
                positions
                    .get(&clob_pair_id)
                    .is_some_and(|q| q.signum() == side.sign())
            })
            .map(|(id, _)| *id)
            .collect()
    }

    fn insurance_fund_balance(&self, clob_pair_id: ClobPairId) -> Decimal {
        self.state.read().insurance_funds.get(&clob_pair_id).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn margin() -> MarginParams {
        MarginParams {
            initial_margin_ppm: 100_000,
            maintenance_margin_ppm: 50_000,
        }
    }

    fn ledger() -> InMemoryLedger {
        let ledger = InMemoryLedger::new();
        ledger.add_market(ClobPairId(0), 100, margin(), 0);
        ledger
    }

    #[test]
    fn risk_includes_position_notional() {
        let ledger = ledger();
        let alice = SubaccountId::new(1, 0);
        ledger.deposit(alice, dec!(-9_000));
        ledger.set_position(alice, ClobPairId(0), 100); // $10,000 long

        let risk = ledger.risk(alice).unwrap();
        assert_eq!(risk.net_collateral, dec!(1_000));
        assert_eq!(risk.maintenance_margin, dec!(500));
        assert!(!risk.is_liquidatable());

        ledger.set_oracle_price(ClobPairId(0), 94);
        let risk = ledger.risk(alice).unwrap();
        assert_eq!(risk.net_collateral, dec!(400));
        assert!(risk.is_liquidatable());
    }

    #[test]
    fn collateral_check_uses_initial_margin() {
        let ledger = ledger();
        let bob = SubaccountId::new(2, 0);
        ledger.deposit(bob, dec!(100));

        // buying 10 at 100 needs 100 initial margin
        let ok = PositionDelta::for_fill(ClobPairId(0), Side::Buy, 10, dec!(1_000));
        assert_eq!(ledger.check_collateralization(bob, &ok), CollateralCheck::Success);

        let too_big = PositionDelta::for_fill(ClobPairId(0), Side::Buy, 11, dec!(1_100));
        assert_eq!(
            ledger.check_collateralization(bob, &too_big),
            CollateralCheck::NewlyUndercollateralized
        );

        ledger.freeze(bob);
        assert!(!ledger.check_collateralization(bob, &ok).is_success());
    }

    #[test]
    fn settle_folds_block_deltas() {
        let ledger = ledger();
        let alice = SubaccountId::new(1, 0);
        let bob = SubaccountId::new(2, 0);
        ledger.set_insurance_fund(ClobPairId(0), dec!(50));
        let settlement = BlockSettlement {
            height: crate::types::BlockHeight(3),
            position_deltas: vec![
                (alice, PositionDelta::for_fill(ClobPairId(0), Side::Buy, 4, dec!(400))),
                (bob, PositionDelta::for_fill(ClobPairId(0), Side::Sell, 4, dec!(400))),
            ],
            insurance_deltas: vec![(ClobPairId(0), dec!(-20))],
            withdrawals_gated_at: None,
        };
        ledger.settle(&settlement);

        assert_eq!(ledger.position(alice, ClobPairId(0)), 4);
        assert_eq!(ledger.quote_balance(alice), dec!(-400));
        assert_eq!(ledger.position(bob, ClobPairId(0)), -4);
        assert_eq!(ledger.quote_balance(bob), dec!(400));
        assert_eq!(ledger.insurance_fund_balance(ClobPairId(0)), dec!(30));
    }

    #[test]
    fn positions_by_side() {
        let ledger = ledger();
        ledger.set_position(SubaccountId::new(1, 0), ClobPairId(0), 5);
        ledger.set_position(SubaccountId::new(2, 0), ClobPairId(0), -5);
        ledger.set_position(SubaccountId::new(3, 0), ClobPairId(0), -1);

        assert_eq!(ledger.subaccounts_with_position(ClobPairId(0), Side::Buy).len(), 1);
        assert_eq!(ledger.subaccounts_with_position(ClobPairId(0), Side::Sell).len(), 2);
    }
}
