//! Orders: identity, variants, good-til expiry and admission validation.
//!
//! An order id is stable for the life of the order. Its flags decide where the
//! order lives (book only, or persisted as stateful), how it expires (block height
//! or block time), and whether it waits on a trigger first.

use crate::config::{ClobConfig, ClobPairConfig};
use crate::types::{
    BlockContext, BlockHeight, BlockTime, ClobPairId, Side, SubaccountId, Subticks, ONE_MILLION,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OrderFlags {
    ShortTerm,
    LongTerm,
    Conditional,
    Twap,
    TwapSuborder,
}

impl OrderFlags {
    pub fn is_short_term(&self) -> bool {
        matches!(self, OrderFlags::ShortTerm)
    }

    pub fn is_stateful(&self) -> bool {
        !self.is_short_term()
    }

    // suborders are owned by their twap parent and never counted on their own
    pub fn counts_toward_stateful_limit(&self) -> bool {
        matches!(self, OrderFlags::LongTerm | OrderFlags::Conditional | OrderFlags::Twap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderId {
    pub subaccount_id: SubaccountId,
    pub client_id: u32,
    pub flags: OrderFlags,
    pub clob_pair_id: ClobPairId,
}

impl OrderId {
    pub fn new(
        subaccount_id: SubaccountId,
        client_id: u32,
        flags: OrderFlags,
        clob_pair_id: ClobPairId,
    ) -> Self {
        Self {
            subaccount_id,
            client_id,
            flags,
            clob_pair_id,
        }
    }

    pub fn with_flags(&self, flags: OrderFlags) -> Self {
        Self { flags, ..*self }
    }

    pub fn is_short_term(&self) -> bool {
        self.flags.is_short_term()
    }

    pub fn is_stateful(&self) -> bool {
        self.flags.is_stateful()
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{:?}@{}",
            self.subaccount_id, self.client_id, self.flags, self.clob_pair_id
        )
    }
}

/// Expiry of an order. Short-term orders expire by height, stateful ones by time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GoodTil {
    Block(BlockHeight),
    BlockTime(BlockTime),
}

impl GoodTil {
    /// Whether an order with this expiry may be admitted during `ctx`.
    pub fn is_valid_at(&self, ctx: &BlockContext) -> bool {
        match self {
            GoodTil::Block(height) => *height >= ctx.height,
            GoodTil::BlockTime(time) => *time > ctx.time,
        }
    }

    /// Whether this expiry has passed once block `ctx` is finished.
    pub fn expires_by(&self, ctx: &BlockContext) -> bool {
        match self {
            GoodTil::Block(height) => *height <= ctx.height,
            GoodTil::BlockTime(time) => *time <= ctx.time,
        }
    }

    // only good-tils of the same kind are comparable
    pub fn compare(&self, other: &GoodTil) -> Option<Ordering> {
        match (self, other) {
            (GoodTil::Block(a), GoodTil::Block(b)) => Some(a.cmp(b)),
            (GoodTil::BlockTime(a), GoodTil::BlockTime(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    pub fn strictly_after(&self, other: &GoodTil) -> bool {
        self.compare(other) == Some(Ordering::Greater)
    }
}

impl fmt::Display for GoodTil {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GoodTil::Block(height) => write!(f, "block {}", height),
            GoodTil::BlockTime(time) => write!(f, "time {}", time),
        }
    }
}

/// Order time in force options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good till canceled. Remainder rests on the book.
    #[default]
    GTC,
    /// Immediate or cancel. Fill what is possible, cancel the rest.
    IOC,
    /// Fill or kill. Fill entirely or not at all.
    FOK,
    /// Post only. Rejected if it would take liquidity.
    PostOnly,
}

impl TimeInForce {
    pub fn is_immediate(&self) -> bool {
        matches!(self, TimeInForce::IOC | TimeInForce::FOK)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    StopLoss,
    TakeProfit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalTrigger {
    pub condition_type: ConditionType,
    pub trigger_subticks: Subticks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwapParameters {
    pub duration_secs: u32,
    pub interval_secs: u32,
    pub price_tolerance_ppm: u32,
}

impl TwapParameters {
    /// ceil(duration / interval)
    pub fn total_legs(&self) -> u32 {
        if self.interval_secs == 0 {
            return 0;
        }
        self.duration_secs.div_ceil(self.interval_secs)
    }
}

/// Fee attribution to an order router. Charged on fills of this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderFee {
    pub recipient: u64,
    pub fee_ppm: u32,
}

/// What kind of order this is, with the parameters only that kind carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderVariant {
    ShortTerm,
    LongTerm,
    Conditional(ConditionalTrigger),
    Twap(TwapParameters),
    TwapSuborder,
}

impl OrderVariant {
    pub fn flags(&self) -> OrderFlags {
        match self {
            OrderVariant::ShortTerm => OrderFlags::ShortTerm,
            OrderVariant::LongTerm => OrderFlags::LongTerm,
            OrderVariant::Conditional(_) => OrderFlags::Conditional,
            OrderVariant::Twap(_) => OrderFlags::Twap,
            OrderVariant::TwapSuborder => OrderFlags::TwapSuborder,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub side: Side,
    pub quantums: u64,
    pub subticks: Subticks,
    pub time_in_force: TimeInForce,
    pub good_til: GoodTil,
    pub reduce_only: bool,
    pub builder_fee: Option<BuilderFee>,
    pub variant: OrderVariant,
}

impl Order {
    #[allow(clippy::too_many_arguments)]
    fn build(
        subaccount_id: SubaccountId,
        client_id: u32,
        clob_pair_id: ClobPairId,
        side: Side,
        quantums: u64,
        subticks: u64,
        good_til: GoodTil,
        variant: OrderVariant,
    ) -> Self {
        Self {
            id: OrderId::new(subaccount_id, client_id, variant.flags(), clob_pair_id),
            side,
            quantums,
            subticks: Subticks(subticks),
            time_in_force: TimeInForce::GTC,
            good_til,
            reduce_only: false,
            builder_fee: None,
            variant,
        }
    }

    pub fn short_term(
        subaccount_id: SubaccountId,
        client_id: u32,
        clob_pair_id: ClobPairId,
        side: Side,
        quantums: u64,
        subticks: u64,
        good_til_block: u32,
    ) -> Self {
        Self::build(
            subaccount_id,
            client_id,
            clob_pair_id,
            side,
            quantums,
            subticks,
            GoodTil::Block(BlockHeight(good_til_block)),
            OrderVariant::ShortTerm,
        )
    }

    pub fn long_term(
        subaccount_id: SubaccountId,
        client_id: u32,
        clob_pair_id: ClobPairId,
        side: Side,
        quantums: u64,
        subticks: u64,
        good_til_time: u32,
    ) -> Self {
        Self::build(
            subaccount_id,
            client_id,
            clob_pair_id,
            side,
            quantums,
            subticks,
            GoodTil::BlockTime(BlockTime(good_til_time)),
            OrderVariant::LongTerm,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn conditional(
        subaccount_id: SubaccountId,
        client_id: u32,
        clob_pair_id: ClobPairId,
        side: Side,
        quantums: u64,
        subticks: u64,
        condition_type: ConditionType,
        trigger_subticks: u64,
        good_til_time: u32,
    ) -> Self {
        let trigger = ConditionalTrigger {
            condition_type,
            trigger_subticks: Subticks(trigger_subticks),
        };
        Self::build(
            subaccount_id,
            client_id,
            clob_pair_id,
            side,
            quantums,
            subticks,
            GoodTil::BlockTime(BlockTime(good_til_time)),
            OrderVariant::Conditional(trigger),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn twap(
        subaccount_id: SubaccountId,
        client_id: u32,
        clob_pair_id: ClobPairId,
        side: Side,
        quantums: u64,
        subticks: u64,
        params: TwapParameters,
        good_til_time: u32,
    ) -> Self {
        Self::build(
            subaccount_id,
            client_id,
            clob_pair_id,
            side,
            quantums,
            subticks,
            GoodTil::BlockTime(BlockTime(good_til_time)),
            OrderVariant::Twap(params),
        )
    }

    pub fn with_time_in_force(mut self, time_in_force: TimeInForce) -> Self {
        self.time_in_force = time_in_force;
        self
    }

    pub fn with_reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }

    pub fn with_builder_fee(mut self, fee: BuilderFee) -> Self {
        self.builder_fee = Some(fee);
        self
    }

    pub fn subaccount_id(&self) -> SubaccountId {
        self.id.subaccount_id
    }

    pub fn clob_pair_id(&self) -> ClobPairId {
        self.id.clob_pair_id
    }

    pub fn is_buy(&self) -> bool {
        self.side.is_buy()
    }

    /// Whether this order, as a taker, crosses a maker resting at `maker_subticks`.
    pub fn crosses(&self, maker_subticks: Subticks) -> bool {
        match self.side {
            Side::Buy => self.subticks >= maker_subticks,
            Side::Sell => self.subticks <= maker_subticks,
        }
    }

    pub fn twap_parameters(&self) -> Option<TwapParameters> {
        match self.variant {
            OrderVariant::Twap(params) => Some(params),
            _ => None,
        }
    }

    pub fn conditional_trigger(&self) -> Option<ConditionalTrigger> {
        match self.variant {
            OrderVariant::Conditional(trigger) => Some(trigger),
            _ => None,
        }
    }

    /// Stateless admission checks against the pair and the current block.
    pub fn validate_basic(
        &self,
        ctx: &BlockContext,
        pair: &ClobPairConfig,
        config: &ClobConfig,
    ) -> Result<(), OrderValidationError> {
        if self.id.clob_pair_id != pair.id {
            return Err(OrderValidationError::ClobPairMismatch {
                order: self.id.clob_pair_id,
                pair: pair.id,
            });
        }
        if self.variant.flags() != self.id.flags {
            return Err(OrderValidationError::VariantFlagsMismatch { flags: self.id.flags });
        }
        if matches!(self.variant, OrderVariant::TwapSuborder) {
            return Err(OrderValidationError::InternalOrderKind);
        }

        if self.quantums == 0 {
            return Err(OrderValidationError::ZeroQuantums);
        }
        if self.quantums % pair.step_base_quantums != 0 {
            return Err(OrderValidationError::QuantumsNotStepMultiple {
                quantums: self.quantums,
                step: pair.step_base_quantums,
            });
        }
        if self.subticks.is_zero() {
            return Err(OrderValidationError::ZeroSubticks);
        }
        if self.subticks.0 % pair.subticks_per_tick != 0 {
            return Err(OrderValidationError::SubticksNotTickMultiple {
                subticks: self.subticks,
                tick: pair.subticks_per_tick,
            });
        }

        self.validate_good_til(ctx, config)?;

        match self.variant {
            OrderVariant::LongTerm if self.time_in_force.is_immediate() => {
                return Err(OrderValidationError::StatefulImmediateExecution);
            }
            OrderVariant::Conditional(trigger) => {
                if trigger.trigger_subticks.is_zero() {
                    return Err(OrderValidationError::ZeroTriggerSubticks);
                }
                if trigger.trigger_subticks.0 % pair.subticks_per_tick != 0 {
                    return Err(OrderValidationError::SubticksNotTickMultiple {
                        subticks: trigger.trigger_subticks,
                        tick: pair.subticks_per_tick,
                    });
                }
            }
            OrderVariant::Twap(params) => validate_twap(self, &params, config)?,
            _ => {}
        }

        if let Some(fee) = self.builder_fee {
            if fee.fee_ppm > config.orders.max_builder_fee_ppm {
                return Err(OrderValidationError::BuilderFeeTooHigh {
                    fee_ppm: fee.fee_ppm,
                    max: config.orders.max_builder_fee_ppm,
                });
            }
        }

        Ok(())
    }

    fn validate_good_til(&self, ctx: &BlockContext, config: &ClobConfig) -> Result<(), OrderValidationError> {
        match (self.id.flags.is_short_term(), self.good_til) {
            (true, GoodTil::Block(good_til)) => {
                if good_til < ctx.height {
                    return Err(OrderValidationError::GoodTilBlockStale {
                        good_til,
                        height: ctx.height,
                    });
                }
                let max = ctx.height.saturating_add(config.orders.short_block_window);
                if good_til > max {
                    return Err(OrderValidationError::GoodTilBlockTooFar { good_til, max });
                }
            }
            (false, GoodTil::BlockTime(good_til)) => {
                if good_til <= ctx.time {
                    return Err(OrderValidationError::GoodTilTimeStale {
                        good_til,
                        time: ctx.time,
                    });
                }
                let max = ctx.time.saturating_add_secs(config.orders.stateful_time_window_secs);
                if good_til > max {
                    return Err(OrderValidationError::GoodTilTimeTooFar { good_til, max });
                }
            }
            _ => return Err(OrderValidationError::GoodTilKindMismatch { flags: self.id.flags }),
        }
        Ok(())
    }

    /// Rules a replacement must satisfy against the order it replaces.
    /// The fill-amount rule needs the fill table and is checked by the engine.
    pub fn validate_replacement(&self, existing: &Order) -> Result<(), ReplacementError> {
        if !self.good_til.strictly_after(&existing.good_til) {
            return Err(ReplacementError::GoodTilNotIncreased {
                existing: existing.good_til,
                replacement: self.good_til,
            });
        }
        if self.side != existing.side {
            return Err(ReplacementError::SideChanged);
        }
        if self.time_in_force != existing.time_in_force {
            return Err(ReplacementError::TimeInForceChanged);
        }
        if self.reduce_only != existing.reduce_only {
            return Err(ReplacementError::ReduceOnlyChanged);
        }
        if self.variant.flags() != existing.variant.flags() {
            return Err(ReplacementError::VariantChanged);
        }
        Ok(())
    }
}

fn validate_twap(order: &Order, params: &TwapParameters, config: &ClobConfig) -> Result<(), OrderValidationError> {
    if order.time_in_force != TimeInForce::GTC {
        return Err(OrderValidationError::InvalidTwap {
            reason: "twap orders must be good-til-cancel".to_string(),
        });
    }
    let twap = &config.twap;
    if params.interval_secs < twap.min_interval_secs || params.interval_secs > twap.max_interval_secs {
        return Err(OrderValidationError::InvalidTwap {
            reason: format!(
                "interval {}s outside [{}s, {}s]",
                params.interval_secs, twap.min_interval_secs, twap.max_interval_secs
            ),
        });
    }
    if params.duration_secs < params.interval_secs || params.duration_secs > twap.max_duration_secs {
        return Err(OrderValidationError::InvalidTwap {
            reason: format!(
                "duration {}s outside [{}s, {}s]",
                params.duration_secs, params.interval_secs, twap.max_duration_secs
            ),
        });
    }
    if params.duration_secs % params.interval_secs != 0 {
        return Err(OrderValidationError::InvalidTwap {
            reason: "duration must be a multiple of interval".to_string(),
        });
    }
    if params.price_tolerance_ppm >= ONE_MILLION {
        return Err(OrderValidationError::InvalidTwap {
            reason: "price tolerance must be below 100%".to_string(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemovalReason {
    Undercollateralized,
    SelfTrade,
    Replaced,
    ReduceOnlyResized,
    ImmediateOrCancelRemainder,
    TwapParentDeleted,
}

/// Lifecycle of an order id as seen by queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    // untriggered conditional or twap parent still working
    Untriggered,
    Open,
    PartiallyFilled,
    FullyFilled,
    Cancelled,
    Removed(RemovalReason),
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::FullyFilled | OrderStatus::Cancelled | OrderStatus::Removed(_) | OrderStatus::Expired
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderValidationError {
    #[error("order is for clob pair {order} but was routed to {pair}")]
    ClobPairMismatch { order: ClobPairId, pair: ClobPairId },
    #[error("order variant does not match flags {flags:?}")]
    VariantFlagsMismatch { flags: OrderFlags },
    #[error("twap suborders are placed by the engine only")]
    InternalOrderKind,
    #[error("order size must be positive")]
    ZeroQuantums,
    #[error("quantums {quantums} not a multiple of step {step}")]
    QuantumsNotStepMultiple { quantums: u64, step: u64 },
    #[error("order price must be positive")]
    ZeroSubticks,
    #[error("subticks {subticks} not a multiple of tick {tick}")]
    SubticksNotTickMultiple { subticks: Subticks, tick: u64 },
    #[error("good-til kind does not match flags {flags:?}")]
    GoodTilKindMismatch { flags: OrderFlags },
    #[error("good-til block {good_til} is before current height {height}")]
    GoodTilBlockStale { good_til: BlockHeight, height: BlockHeight },
    #[error("good-til block {good_til} exceeds max {max}")]
    GoodTilBlockTooFar { good_til: BlockHeight, max: BlockHeight },
    #[error("good-til time {good_til} is not after block time {time}")]
    GoodTilTimeStale { good_til: BlockTime, time: BlockTime },
    #[error("good-til time {good_til} exceeds max {max}")]
    GoodTilTimeTooFar { good_til: BlockTime, max: BlockTime },
    #[error("long-term orders cannot be IOC or FOK")]
    StatefulImmediateExecution,
    #[error("conditional trigger price must be positive")]
    ZeroTriggerSubticks,
    #[error("invalid twap parameters: {reason}")]
    InvalidTwap { reason: String },
    #[error("builder fee {fee_ppm} ppm exceeds max {max} ppm")]
    BuilderFeeTooHigh { fee_ppm: u32, max: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplacementError {
    #[error("replacement good-til {replacement} must exceed existing {existing}")]
    GoodTilNotIncreased { existing: GoodTil, replacement: GoodTil },
    #[error("replacement changes side")]
    SideChanged,
    #[error("replacement changes time in force")]
    TimeInForceChanged,
    #[error("replacement changes reduce-only")]
    ReduceOnlyChanged,
    #[error("replacement changes order kind")]
    VariantChanged,
    #[error("order is already fully filled")]
    FullyFilled,
    #[error("replacement size {quantums} below filled amount {filled}")]
    BelowFilledAmount { filled: u64, quantums: u64 },
}
