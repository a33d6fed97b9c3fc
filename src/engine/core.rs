// 8.0 engine/core.rs: the in-memory clob. holds every market's book and trigger stores,
// the operations queue, the rate limiter and the per-block liquidation state.
// lock order: at most one market lock, then the operations queue / tracker / insurance.
// nothing locks a second market while holding one.

use super::config::{EngineOptions, ExecMode};
use super::results::EngineError;
use crate::collaborators::{CollateralChecker, PositionDelta, PriceSource, SubaccountRisk, SubaccountSource};
use crate::conditional::UntriggeredConditionalOrders;
use crate::config::{ClobConfig, ClobPairConfig, ClobPairStatus};
use crate::ledger::InMemoryLedger;
use crate::liquidation::{InsuranceFund, LiquidationBlockTracker, MarketRisk};
use crate::operations::{Operation, OperationsQueue};
use crate::order::{GoodTil, Order, OrderId, OrderStatus};
use crate::orderbook::{OrderBook, PriceLevel};
use crate::rate_limit::{BlockRateLimiter, RateLimitClass};
use crate::state::{CancelRecords, FillAmounts, FillRecord, WithdrawalsGate};
use crate::twap::{TwapOrderPlacement, TwapStore};
use crate::types::{BlockContext, BlockHeight, BlockTime, ClobPairId, Quote, Side, SubaccountId, Subticks};
use log::info;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/** 8.1: everything the clob keeps for one pair. cloned wholesale into the committed snapshot */
#[derive(Debug, Clone)]
pub(super) struct MarketBook {
    pub(super) config: ClobPairConfig,
    pub(super) book: OrderBook,
    pub(super) fills: FillAmounts,
    pub(super) cancels: CancelRecords,
    // resting stateful orders by good-til-block-time
    pub(super) stateful_expirations: BTreeSet<(BlockTime, OrderId)>,
    pub(super) conditionals: UntriggeredConditionalOrders,
    pub(super) twaps: TwapStore,
    pub(super) statuses: BTreeMap<OrderId, (OrderStatus, GoodTil)>,
    // fills of the current block per subaccount, settled at commit
    pub(super) block_deltas: BTreeMap<SubaccountId, PositionDelta>,
}

impl MarketBook {
    pub(super) fn new(config: ClobPairConfig) -> Self {
        Self {
            book: OrderBook::new(config.id),
            config,
            fills: FillAmounts::new(),
            cancels: CancelRecords::new(),
            stateful_expirations: BTreeSet::new(),
            conditionals: UntriggeredConditionalOrders::new(),
            twaps: TwapStore::new(),
            statuses: BTreeMap::new(),
            block_deltas: BTreeMap::new(),
        }
    }

    pub(super) fn filled(&self, order_id: &OrderId) -> u64 {
        self.fills.get(order_id).map_or(0, |r| r.filled_quantums)
    }

    pub(super) fn set_filled(&mut self, order: &Order, filled_quantums: u64) {
        assert!(
            filled_quantums <= order.quantums,
            "fill amount {} exceeds size {} for {}",
            filled_quantums,
            order.quantums,
            order.id
        );
        self.fills.insert(
            order.id,
            FillRecord {
                filled_quantums,
                prunable_after: order.good_til,
            },
        );
    }

    pub(super) fn pending_delta(&self, subaccount_id: SubaccountId) -> PositionDelta {
        self.block_deltas
            .get(&subaccount_id)
            .copied()
            .unwrap_or_else(|| PositionDelta::new(self.config.id))
    }

    pub(super) fn add_block_delta(&mut self, subaccount_id: SubaccountId, base_quantums: i128, quote_quantums: Decimal) {
        let clob_pair_id = self.config.id;
        let delta = self
            .block_deltas
            .entry(subaccount_id)
            .or_insert_with(|| PositionDelta::new(clob_pair_id));
        delta.base_quantums += base_quantums;
        delta.quote_quantums += quote_quantums;
    }

    /// Resting, dormant or working order with this id.
    pub(super) fn find_order(&self, order_id: &OrderId) -> Option<&Order> {
        self.book
            .get(order_id)
            .or_else(|| self.conditionals.get(order_id))
            .or_else(|| self.twaps.get(order_id).map(|p| &p.order))
    }

    /// Take an order off the book and out of the expiration index.
    pub(super) fn remove_resting(&mut self, order_id: &OrderId) -> Option<Order> {
        let order = self.book.remove(order_id)?;
        if let GoodTil::BlockTime(time) = order.good_til {
            self.stateful_expirations.remove(&(time, *order_id));
        }
        Some(order)
    }

    pub(super) fn rest(&mut self, order: Order) {
        if order.id.is_stateful() {
            if let GoodTil::BlockTime(time) = order.good_til {
                self.stateful_expirations.insert((time, order.id));
            }
        }
        self.book.insert(order);
    }

    /// Remove an order from wherever it lives: book, conditional store or twap store.
    pub(super) fn take_order(&mut self, order_id: &OrderId) -> Option<Order> {
        self.remove_resting(order_id)
            .or_else(|| self.conditionals.remove(order_id))
            .or_else(|| self.twaps.remove(order_id).map(|p| p.order))
    }

    pub(super) fn status_of(&self, order_id: &OrderId) -> Option<OrderStatus> {
        if self.book.contains(order_id) {
            return Some(if self.filled(order_id) > 0 {
                OrderStatus::PartiallyFilled
            } else {
                OrderStatus::Open
            });
        }
        if self.conditionals.contains(order_id) || self.twaps.contains(order_id) {
            return Some(OrderStatus::Untriggered);
        }
        self.statuses.get(order_id).map(|(status, _)| *status)
    }

    pub(super) fn set_status(&mut self, order: &Order, status: OrderStatus) {
        self.statuses.insert(order.id, (status, order.good_til));
    }

    fn stateful_count(&self, subaccount_id: SubaccountId) -> u32 {
        let resting = self
            .book
            .orders_for_subaccount(subaccount_id)
            .into_iter()
            .filter(|id| id.flags.counts_toward_stateful_limit())
            .count();
        let dormant = self.conditionals.get_by_subaccount(subaccount_id).len();
        let working = self.twaps.count_for_subaccount(subaccount_id);
        (resting + dormant + working) as u32
    }
}

/** 8.2: the clob. speculative admission takes &self; block lifecycle takes &mut self */
pub struct MemClob {
    pub(super) config: ClobConfig,
    pub(super) options: EngineOptions,
    pub(super) ctx: BlockContext,
    pub(super) mode: ExecMode,
    pub(super) markets: BTreeMap<ClobPairId, Mutex<MarketBook>>,
    pub(super) snapshot: BTreeMap<ClobPairId, MarketBook>,
    pub(super) operations: Mutex<OperationsQueue>,
    pub(super) rate_limiter: BlockRateLimiter,
    pub(super) liquidations: Mutex<LiquidationBlockTracker>,
    pub(super) insurance: Mutex<BTreeMap<ClobPairId, InsuranceFund>>,
    pub(super) withdrawals: Mutex<WithdrawalsGate>,
    pub(super) committed_withdrawals: WithdrawalsGate,
    pub(super) collateral: Arc<dyn CollateralChecker>,
    pub(super) prices: Arc<dyn PriceSource>,
    pub(super) subaccounts: Arc<dyn SubaccountSource>,
}

impl MemClob {
    pub fn new(
        config: ClobConfig,
        options: EngineOptions,
        collateral: Arc<dyn CollateralChecker>,
        prices: Arc<dyn PriceSource>,
        subaccounts: Arc<dyn SubaccountSource>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            rate_limiter: BlockRateLimiter::new(&config.rate_limits),
            config,
            options,
            ctx: BlockContext::default(),
            mode: ExecMode::Speculative,
            markets: BTreeMap::new(),
            snapshot: BTreeMap::new(),
            operations: Mutex::new(OperationsQueue::new()),
            liquidations: Mutex::new(LiquidationBlockTracker::new()),
            insurance: Mutex::new(BTreeMap::new()),
            withdrawals: Mutex::new(WithdrawalsGate::default()),
            committed_withdrawals: WithdrawalsGate::default(),
            collateral,
            prices,
            subaccounts,
        })
    }

    /// A clob whose three collaborators are one in-memory ledger.
    pub fn with_ledger(config: ClobConfig, ledger: Arc<InMemoryLedger>) -> Result<Self, EngineError> {
        Self::new(
            config,
            EngineOptions::default(),
            ledger.clone(),
            ledger.clone(),
            ledger,
        )
    }

    pub fn config(&self) -> &ClobConfig {
        &self.config
    }

    pub fn block_context(&self) -> BlockContext {
        self.ctx
    }

    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    pub fn add_clob_pair(&mut self, pair: ClobPairConfig) -> Result<(), EngineError> {
        pair.validate()?;
        if self.markets.contains_key(&pair.id) {
            return Err(EngineError::MarketAlreadyExists(pair.id));
        }
        info!(
            "clob pair added id={} step={} tick={} exponent={}",
            pair.id, pair.step_base_quantums, pair.subticks_per_tick, pair.quantum_conversion_exponent
        );
        let market = MarketBook::new(pair);
        self.snapshot.insert(market.config.id, market.clone());
        self.markets.insert(market.config.id, Mutex::new(market));
        Ok(())
    }

    /// Governance status change. Applies to live and committed state alike.
    pub fn set_clob_pair_status(&mut self, clob_pair_id: ClobPairId, status: ClobPairStatus) -> Result<(), EngineError> {
        let market = self
            .markets
            .get_mut(&clob_pair_id)
            .ok_or(EngineError::MarketNotFound(clob_pair_id))?;
        market.get_mut().config.status = status;
        if let Some(committed) = self.snapshot.get_mut(&clob_pair_id) {
            committed.config.status = status;
        }
        info!("clob pair status changed id={} status={:?}", clob_pair_id, status);
        Ok(())
    }

    pub fn clob_pair(&self, clob_pair_id: ClobPairId) -> Option<ClobPairConfig> {
        self.markets.get(&clob_pair_id).map(|m| m.lock().config.clone())
    }

    pub fn clob_pair_ids(&self) -> Vec<ClobPairId> {
        self.markets.keys().copied().collect()
    }

    pub(super) fn market(&self, clob_pair_id: ClobPairId) -> Result<&Mutex<MarketBook>, EngineError> {
        self.markets
            .get(&clob_pair_id)
            .ok_or(EngineError::MarketNotFound(clob_pair_id))
    }

    // ----- queries -----

    pub fn get_order(&self, order_id: &OrderId) -> Option<Order> {
        let market = self.markets.get(&order_id.clob_pair_id)?.lock();
        market.find_order(order_id).cloned()
    }

    /// Cumulative filled quantums for an order id. Twap parents report the sum of their legs.
    pub fn get_fill_amount(&self, order_id: &OrderId) -> u64 {
        let Some(market) = self.markets.get(&order_id.clob_pair_id) else {
            return 0;
        };
        let market = market.lock();
        match market.twaps.get(order_id) {
            Some(placement) => placement.filled_quantums(),
            None => market.filled(order_id),
        }
    }

    pub fn order_status(&self, order_id: &OrderId) -> Option<OrderStatus> {
        self.markets.get(&order_id.clob_pair_id)?.lock().status_of(order_id)
    }

    pub fn twap_placement(&self, order_id: &OrderId) -> Option<TwapOrderPlacement> {
        let market = self.markets.get(&order_id.clob_pair_id)?.lock();
        market.twaps.get(order_id).cloned()
    }

    pub fn best_bid(&self, clob_pair_id: ClobPairId) -> Option<Subticks> {
        self.markets.get(&clob_pair_id)?.lock().book.best_bid()
    }

    pub fn best_ask(&self, clob_pair_id: ClobPairId) -> Option<Subticks> {
        self.markets.get(&clob_pair_id)?.lock().book.best_ask()
    }

    /// Aggregated unfilled depth per price level.
    pub fn levels(&self, clob_pair_id: ClobPairId, side: Side, depth: Option<usize>) -> Vec<PriceLevel> {
        let Some(market) = self.markets.get(&clob_pair_id) else {
            return Vec::new();
        };
        let market = market.lock();
        let depth = depth.unwrap_or(self.options.default_book_depth);
        market
            .book
            .levels(side, depth, |o| o.quantums.saturating_sub(market.filled(&o.id)))
    }

    pub fn open_orders(&self, subaccount_id: SubaccountId) -> Vec<Order> {
        let mut orders = Vec::new();
        for market in self.markets.values() {
            let market = market.lock();
            orders.extend(
                market
                    .book
                    .orders_for_subaccount(subaccount_id)
                    .iter()
                    .filter_map(|id| market.book.get(id).cloned()),
            );
        }
        orders
    }

    /// Stateful orders (resting, dormant or working) counted against the per-subaccount cap.
    /// Locks one market at a time.
    pub fn stateful_order_count(&self, subaccount_id: SubaccountId) -> u32 {
        self.markets
            .values()
            .map(|m| m.lock().stateful_count(subaccount_id))
            .sum()
    }

    pub fn rate_limit_count(&self, class: RateLimitClass, subaccount_id: SubaccountId, num_blocks: u32) -> u32 {
        self.rate_limiter.count(class, subaccount_id, self.ctx.height, num_blocks)
    }

    pub fn withdrawals_gated_at(&self) -> Option<BlockHeight> {
        self.withdrawals.lock().gated_at()
    }

    /// Recovery hook: lifts the withdrawals gate in live and committed state.
    pub fn clear_withdrawals_gate(&mut self) {
        let gated_at = self.committed_withdrawals.gated_at().or(self.withdrawals.get_mut().gated_at());
        self.withdrawals.get_mut().clear();
        self.committed_withdrawals.clear();
        info!("withdrawals gate cleared gated_at={:?} height={}", gated_at, self.ctx.height);
    }

    /// Operations queued so far this block, in order.
    pub fn operations(&self) -> Vec<Operation> {
        self.operations.lock().operations().to_vec()
    }

    /// Insurance fund balance including this block's liquidations.
    pub fn insurance_fund_balance(&self, clob_pair_id: ClobPairId) -> Decimal {
        self.insurance_fund(clob_pair_id).balance.value()
    }

    pub(super) fn insurance_fund(&self, clob_pair_id: ClobPairId) -> InsuranceFund {
        let mut funds = self.insurance.lock();
        funds
            .entry(clob_pair_id)
            .or_insert_with(|| InsuranceFund::new(Quote::new(self.subaccounts.insurance_fund_balance(clob_pair_id))))
            .clone()
    }

    pub(super) fn apply_insurance_delta(&self, clob_pair_id: ClobPairId, delta: Decimal) {
        if delta.is_zero() {
            return;
        }
        let mut funds = self.insurance.lock();
        funds
            .entry(clob_pair_id)
            .or_insert_with(|| InsuranceFund::new(Quote::new(self.subaccounts.insurance_fund_balance(clob_pair_id))))
            .apply_delta(delta);
    }

    // ----- collaborator views -----

    pub(super) fn market_risk(&self, pair: &ClobPairConfig) -> Result<MarketRisk, EngineError> {
        let oracle = self
            .prices
            .oracle_price(pair.id)
            .ok_or(EngineError::MissingOraclePrice(pair.id))?;
        let margin = self
            .prices
            .margin_params(pair.id)
            .ok_or(EngineError::MissingOraclePrice(pair.id))?;
        Ok(MarketRisk {
            clob_pair_id: pair.id,
            oracle,
            exponent: pair.quantum_conversion_exponent,
            maintenance_margin_ppm: margin.maintenance_margin_ppm,
        })
    }

    /// Committed position plus this block's fills in `market`.
    pub(super) fn position_in(&self, market: &MarketBook, subaccount_id: SubaccountId) -> i128 {
        self.subaccounts.position(subaccount_id, market.config.id) + market.pending_delta(subaccount_id).base_quantums
    }

    /// Committed risk adjusted by this block's fills in every market. Locks
    /// each market in turn, so the caller must not hold a market lock.
    pub(super) fn current_risk(&self, subaccount_id: SubaccountId) -> Option<SubaccountRisk> {
        self.risk_outside(subaccount_id, None)
    }

    /// `current_risk` without the fills of `excluded`. A caller about to lock
    /// `excluded` adds those under its own lock with `with_block_fills`.
    pub(super) fn risk_outside(&self, subaccount_id: SubaccountId, excluded: Option<ClobPairId>) -> Option<SubaccountRisk> {
        let mut risk = self.subaccounts.risk(subaccount_id)?;
        for (clob_pair_id, market) in &self.markets {
            if Some(*clob_pair_id) != excluded {
                self.adjust_risk(&mut risk, &market.lock(), subaccount_id);
            }
        }
        Some(risk)
    }

    pub(super) fn with_block_fills(&self, mut risk: SubaccountRisk, market: &MarketBook, subaccount_id: SubaccountId) -> SubaccountRisk {
        self.adjust_risk(&mut risk, market, subaccount_id);
        risk
    }

    fn adjust_risk(&self, risk: &mut SubaccountRisk, market: &MarketBook, subaccount_id: SubaccountId) {
        let Some(delta) = market.block_deltas.get(&subaccount_id) else {
            return;
        };
        let Ok(market_risk) = self.market_risk(&market.config) else {
            return;
        };
        let before = self.subaccounts.position(subaccount_id, market.config.id);
        let after = before + delta.base_quantums;
        risk.net_collateral += delta.quote_quantums + market_risk.notional(after) - market_risk.notional(before);
        risk.maintenance_margin += market_risk.maintenance_margin(after) - market_risk.maintenance_margin(before);
    }

    /// Open positions including this block's fills, in clob pair order.
    pub(super) fn current_positions(&self, subaccount_id: SubaccountId) -> Vec<(ClobPairId, i128)> {
        self.markets
            .iter()
            .map(|(id, market)| (*id, self.position_in(&market.lock(), subaccount_id)))
            .filter(|(_, position)| *position != 0)
            .collect()
    }
}

#[cfg(test)]
pub(super) mod test_support {
    use super::*;
    use crate::collaborators::MarginParams;
    use rust_decimal_macros::dec;

    pub(crate) const PAIR: ClobPairId = ClobPairId(0);

    pub(crate) fn sub(owner: u64) -> SubaccountId {
        SubaccountId::new(owner, 0)
    }

    // step 1, tick 1, exponent 0: quote = subticks * quantums
    pub(crate) fn setup() -> (MemClob, Arc<InMemoryLedger>) {
        setup_with(ClobConfig::testing())
    }

    pub(crate) fn setup_with(config: ClobConfig) -> (MemClob, Arc<InMemoryLedger>) {
        let _ = env_logger::try_init();
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.add_market(
            PAIR,
            10,
            MarginParams {
                initial_margin_ppm: 100_000,
                maintenance_margin_ppm: 50_000,
            },
            0,
        );
        for owner in 1..=6 {
            ledger.deposit(sub(owner), dec!(1_000_000));
        }
        let mut clob = MemClob::with_ledger(config, ledger.clone()).unwrap();
        clob.add_clob_pair(ClobPairConfig::new(0, 1, 1, 0)).unwrap();
        clob.begin_block(BlockContext::new(10, 1_000));
        (clob, ledger)
    }

    pub(crate) fn buy(owner: u64, client_id: u32, quantums: u64, subticks: u64) -> Order {
        Order::short_term(sub(owner), client_id, PAIR, Side::Buy, quantums, subticks, 15)
    }

    pub(crate) fn sell(owner: u64, client_id: u32, quantums: u64, subticks: u64) -> Order {
        Order::short_term(sub(owner), client_id, PAIR, Side::Sell, quantums, subticks, 15)
    }

    pub(crate) fn long_buy(owner: u64, client_id: u32, quantums: u64, subticks: u64) -> Order {
        Order::long_term(sub(owner), client_id, PAIR, Side::Buy, quantums, subticks, 2_000)
    }
}
