// 1.0: all the primitives live here. ids, sides, subticks, block heights/times, quote amounts.
// sizes (quantums) and prices (subticks) are integers so every validator derives the same bits.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;

pub const ONE_MILLION: u32 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClobPairId(pub u32);

impl fmt::Display for ClobPairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// owner address is abstracted to a number; `number` picks the sub-ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubaccountId {
    pub owner: u64,
    pub number: u32,
}

impl SubaccountId {
    pub fn new(owner: u64, number: u32) -> Self {
        Self { owner, number }
    }
}

impl fmt::Display for SubaccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1 for buys, -1 for sells. buying grows a position.
    pub fn sign(&self) -> i128 {
        match self {
            Side::Buy => 1,
            Side::Sell => -1,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn is_buy(&self) -> bool {
        matches!(self, Side::Buy)
    }

    // side that closes a position of this sign
    pub fn closing(position_quantums: i128) -> Option<Side> {
        match position_quantums.signum() {
            1 => Some(Side::Sell),
            -1 => Some(Side::Buy),
            _ => None,
        }
    }
}

// 1.1: price in subticks. one subtick is the smallest price unit of a clob pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Subticks(pub u64);

impl Subticks {
    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Subticks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// 1.2: block height. short-term expiry and rate-limit windows key off this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct BlockHeight(pub u32);

impl BlockHeight {
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    pub fn saturating_add(&self, blocks: u32) -> Self {
        Self(self.0.saturating_add(blocks))
    }

    pub fn saturating_sub(&self, blocks: u32) -> Self {
        Self(self.0.saturating_sub(blocks))
    }
}

impl fmt::Display for BlockHeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// 1.3: block time in unix seconds. agreed by consensus, never read from a wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct BlockTime(pub u32);

impl BlockTime {
    pub fn saturating_add_secs(&self, secs: u32) -> Self {
        Self(self.0.saturating_add(secs))
    }

    pub fn secs_since(&self, earlier: BlockTime) -> u32 {
        self.0.saturating_sub(earlier.0)
    }

    pub fn to_datetime(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp(i64::from(self.0), 0)
    }
}

impl fmt::Display for BlockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%SZ")),
            None => write!(f, "{}s", self.0),
        }
    }
}

/// Height and time of the block currently being built or executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockContext {
    pub height: BlockHeight,
    pub time: BlockTime,
}

impl BlockContext {
    pub fn new(height: u32, time: u32) -> Self {
        Self {
            height: BlockHeight(height),
            time: BlockTime(time),
        }
    }

    pub fn next(&self, block_secs: u32) -> Self {
        Self {
            height: self.height.next(),
            time: self.time.saturating_add_secs(block_secs),
        }
    }
}

// 1.4: quote quantums. collateral, notional, insurance flows all use this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Quote(Decimal);

impl Quote {
    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    pub fn zero() -> Self {
        Self(Decimal::ZERO)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < Decimal::ZERO
    }

    pub fn abs(&self) -> Self {
        Self(self.0.abs())
    }

    pub fn add(&self, other: Quote) -> Self {
        Self(self.0 + other.0)
    }

    pub fn sub(&self, other: Quote) -> Self {
        Self(self.0 - other.0)
    }
}

impl fmt::Display for Quote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialOrd for Quote {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Quote {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl Sum for Quote {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::zero(), |acc, q| acc.add(q))
    }
}

impl<'a> Sum<&'a Quote> for Quote {
    fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
        iter.fold(Self::zero(), |acc, q| acc.add(*q))
    }
}

// 1.5: integer/ppm helpers shared by matching and liquidation math.

/// 10^exponent as a decimal. exponent must lie within [-28, 18].
pub fn pow10(exponent: i32) -> Decimal {
    if exponent >= 0 {
        Decimal::from(10u64.pow(exponent.unsigned_abs()))
    } else {
        Decimal::new(1, exponent.unsigned_abs())
    }
}

pub fn mul_ppm(value: Decimal, ppm: u32) -> Decimal {
    value * Decimal::from(ppm) / Decimal::from(ONE_MILLION)
}

pub fn signed_decimal(quantums: i128) -> Decimal {
    Decimal::from_i128_with_scale(quantums, 0)
}

/// Quote value of `quantums` at `subticks`: subticks * quantums * 10^exponent.
pub fn fill_amount_to_quote(subticks: Subticks, quantums: u64, exponent: i32) -> Quote {
    Quote::new(Decimal::from(subticks.0) * Decimal::from(quantums) * pow10(exponent))
}

/// Signed notional of a position at `price`. longs positive, shorts negative.
pub fn position_notional(quantums: i128, price: Subticks, exponent: i32) -> Decimal {
    signed_decimal(quantums) * Decimal::from(price.0) * pow10(exponent)
}

pub fn decimal_to_u64(value: Decimal) -> Option<u64> {
    value.to_u64()
}

pub fn decimal_to_i128(value: Decimal) -> Option<i128> {
    value.to_i128()
}
