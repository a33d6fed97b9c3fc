// 7.0 config.rs: all tunables in one place. clob pairs, order limits, rate limits, twap,
// liquidations, proposal assembly.
// every value is consensus-relevant: validators must run with identical configs.

use crate::types::ClobPairId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClobPairStatus {
    Active,
    // no new placements; deleveraging settles at the oracle price
    FinalSettlement,
}

// Static parameters of one clob pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClobPairConfig {
    pub id: ClobPairId,
    // Order sizes must be a multiple of this
    pub step_base_quantums: u64,
    // Order prices must be a multiple of this
    pub subticks_per_tick: u64,
    // quote quantums = subticks * base quantums * 10^exponent
    pub quantum_conversion_exponent: i32,
    pub status: ClobPairStatus,
}

impl ClobPairConfig {
    pub fn new(id: u32, step_base_quantums: u64, subticks_per_tick: u64, exponent: i32) -> Self {
        Self {
            id: ClobPairId(id),
            step_base_quantums,
            subticks_per_tick,
            quantum_conversion_exponent: exponent,
            status: ClobPairStatus::Active,
        }
    }

    // BTC-USD as listed on mainnet
    pub fn btc_usd() -> Self {
        Self::new(0, 1_000_000, 100_000, -9)
    }

    pub fn eth_usd() -> Self {
        Self::new(1, 1_000_000_000, 100_000, -9)
    }

    pub fn is_active(&self) -> bool {
        self.status == ClobPairStatus::Active
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.step_base_quantums == 0 {
            return Err(ConfigError::InvalidClobPair {
                reason: format!("clob pair {} step base quantums must be positive", self.id),
            });
        }
        if self.subticks_per_tick == 0 {
            return Err(ConfigError::InvalidClobPair {
                reason: format!("clob pair {} subticks per tick must be positive", self.id),
            });
        }
        if !(-28..=18).contains(&self.quantum_conversion_exponent) {
            return Err(ConfigError::InvalidClobPair {
                reason: format!("clob pair {} exponent out of range", self.id),
            });
        }
        Ok(())
    }
}

/** 7.2: admission limits for orders. */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderLimits {
    // Short-term good-til-block may be at most this many blocks ahead
    pub short_block_window: u32,
    // Stateful good-til-block-time may be at most this many seconds ahead
    pub stateful_time_window_secs: u32,
    pub max_stateful_orders_per_subaccount: u32,
    pub max_builder_fee_ppm: u32,
}

impl Default for OrderLimits {
    fn default() -> Self {
        Self {
            short_block_window: 20,
            stateful_time_window_secs: 95 * 24 * 60 * 60,
            max_stateful_orders_per_subaccount: 20,
            max_builder_fee_ppm: 10_000, // 1%
        }
    }
}

/** 7.3: twap parameter bounds. */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwapConfig {
    pub min_interval_secs: u32,
    pub max_interval_secs: u32,
    pub max_duration_secs: u32,
}

impl Default for TwapConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: 30,
            max_interval_secs: 60 * 60,
            max_duration_secs: 24 * 60 * 60,
        }
    }
}

// At most `limit` operations over the trailing `num_blocks` blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaxPerNBlocks {
    pub num_blocks: u32,
    pub limit: u32,
}

/** 7.4: block rate limits per subaccount. every listed window is enforced. */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub short_term_orders: Vec<MaxPerNBlocks>,
    pub stateful_orders: Vec<MaxPerNBlocks>,
    pub short_term_cancels: Vec<MaxPerNBlocks>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            short_term_orders: vec![MaxPerNBlocks { num_blocks: 1, limit: 200 }],
            stateful_orders: vec![
                MaxPerNBlocks { num_blocks: 1, limit: 2 },
                MaxPerNBlocks { num_blocks: 100, limit: 20 },
            ],
            short_term_cancels: vec![MaxPerNBlocks { num_blocks: 1, limit: 200 }],
        }
    }
}

impl RateLimitConfig {
    pub fn unlimited() -> Self {
        Self {
            short_term_orders: Vec::new(),
            stateful_orders: Vec::new(),
            short_term_cancels: Vec::new(),
        }
    }
}

/** 7.5: liquidation parameters. amounts are quote quantums. */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillablePriceConfig {
    // scales how far below bankruptcy the fillable price may go
    pub bankruptcy_adjustment_ppm: u32,
    // max spread from oracle, as a fraction of maintenance margin
    pub spread_to_maintenance_margin_ratio_ppm: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionBlockLimits {
    // positions at or below this notional close in full
    pub min_position_notional_liquidated: u64,
    pub max_position_portion_liquidated_ppm: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubaccountBlockLimits {
    pub max_notional_liquidated: u64,
    pub max_quantums_insurance_lost: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationsConfig {
    pub max_liquidation_fee_ppm: u32,
    pub position_block_limits: PositionBlockLimits,
    pub subaccount_block_limits: SubaccountBlockLimits,
    pub fillable_price_config: FillablePriceConfig,
    pub max_liquidation_attempts_per_block: u32,
    pub max_deleveraging_subaccounts_to_iterate: u32,
}

impl Default for LiquidationsConfig {
    fn default() -> Self {
        Self {
            max_liquidation_fee_ppm: 15_000, // 1.5%
            position_block_limits: PositionBlockLimits {
                min_position_notional_liquidated: 1_000_000_000, // $1,000
                max_position_portion_liquidated_ppm: 1_000_000,
            },
            subaccount_block_limits: SubaccountBlockLimits {
                max_notional_liquidated: 100_000_000_000_000, // $100M
                max_quantums_insurance_lost: 100_000_000_000_000,
            },
            fillable_price_config: FillablePriceConfig {
                bankruptcy_adjustment_ppm: 1_000_000,
                spread_to_maintenance_margin_ratio_ppm: 1_500_000,
            },
            max_liquidation_attempts_per_block: 35,
            max_deleveraging_subaccounts_to_iterate: 500,
        }
    }
}

/** 7.6: proposal assembly. */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalConfig {
    // first-pass budget for pool txs, as a share of bytes left after the fixed group
    pub other_txs_share_ppm: u32,
    // message type urls that may never appear in the pool group
    pub disallowed_message_types: Vec<String>,
}

impl Default for ProposalConfig {
    fn default() -> Self {
        Self {
            other_txs_share_ppm: 250_000,
            disallowed_message_types: vec![
                "/clob.MsgProposedOperations".to_string(),
                "/prices.MsgUpdateMarketPrices".to_string(),
                "/perpetuals.MsgAddPremiumVotes".to_string(),
            ],
        }
    }
}

// The complete clob configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClobConfig {
    pub orders: OrderLimits,
    pub twap: TwapConfig,
    pub rate_limits: RateLimitConfig,
    pub liquidations: LiquidationsConfig,
    pub proposal: ProposalConfig,
}

impl ClobConfig {
    // Permissive preset used by simulations and tests
    pub fn testing() -> Self {
        let mut config = Self::default();
        config.rate_limits = RateLimitConfig::unlimited();
        config.orders.max_stateful_orders_per_subaccount = 1_000;
        config.liquidations.position_block_limits.min_position_notional_liquidated = 1_000;
        config.liquidations.max_liquidation_fee_ppm = 5_000;
        config.liquidations.fillable_price_config.spread_to_maintenance_margin_ratio_ppm = 100_000;
        config.twap.min_interval_secs = 1;
        config
    }

    // Mainnet preset with tighter liquidation throughput
    pub fn mainnet() -> Self {
        let mut config = Self::default();
        config.liquidations.position_block_limits.max_position_portion_liquidated_ppm = 100_000;
        config.liquidations.subaccount_block_limits.max_notional_liquidated = 10_000_000_000_000; // $10M
        config.liquidations.subaccount_block_limits.max_quantums_insurance_lost = 1_000_000_000_000; // $1M
        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.orders.short_block_window == 0 {
            return Err(ConfigError::InvalidOrderLimits {
                reason: "short block window must be positive".to_string(),
            });
        }
        if self.orders.stateful_time_window_secs == 0 {
            return Err(ConfigError::InvalidOrderLimits {
                reason: "stateful time window must be positive".to_string(),
            });
        }

        if self.twap.min_interval_secs == 0 || self.twap.min_interval_secs > self.twap.max_interval_secs {
            return Err(ConfigError::InvalidTwap {
                reason: "twap interval bounds must satisfy 0 < min <= max".to_string(),
            });
        }
        if self.twap.max_duration_secs < self.twap.min_interval_secs {
            return Err(ConfigError::InvalidTwap {
                reason: "twap max duration below min interval".to_string(),
            });
        }

        let windows = self
            .rate_limits
            .short_term_orders
            .iter()
            .chain(&self.rate_limits.stateful_orders)
            .chain(&self.rate_limits.short_term_cancels);
        for window in windows {
            if window.num_blocks == 0 || window.limit == 0 {
                return Err(ConfigError::InvalidRateLimit {
                    reason: format!("window {:?} must have positive blocks and limit", window),
                });
            }
        }

        let liquidations = &self.liquidations;
        if liquidations.max_liquidation_fee_ppm > 1_000_000 {
            return Err(ConfigError::InvalidLiquidations {
                reason: "liquidation fee above 100%".to_string(),
            });
        }
        let portion = liquidations.position_block_limits.max_position_portion_liquidated_ppm;
        if portion == 0 || portion > 1_000_000 {
            return Err(ConfigError::InvalidLiquidations {
                reason: "max position portion must be in (0, 1_000_000]".to_string(),
            });
        }
        if liquidations.fillable_price_config.bankruptcy_adjustment_ppm < 1_000_000 {
            return Err(ConfigError::InvalidLiquidations {
                reason: "bankruptcy adjustment must be at least 1_000_000 ppm".to_string(),
            });
        }
        if liquidations.fillable_price_config.spread_to_maintenance_margin_ratio_ppm == 0 {
            return Err(ConfigError::InvalidLiquidations {
                reason: "spread to maintenance margin ratio must be positive".to_string(),
            });
        }
        if liquidations.subaccount_block_limits.max_notional_liquidated == 0 {
            return Err(ConfigError::InvalidLiquidations {
                reason: "max notional liquidated must be positive".to_string(),
            });
        }

        if self.proposal.other_txs_share_ppm > 1_000_000 {
            return Err(ConfigError::InvalidProposal {
                reason: "other txs share above 100%".to_string(),
            });
        }

        Ok(())
    }
}

// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid clob pair: {reason}")]
    InvalidClobPair { reason: String },
    #[error("invalid order limits: {reason}")]
    InvalidOrderLimits { reason: String },
    #[error("invalid twap config: {reason}")]
    InvalidTwap { reason: String },
    #[error("invalid rate limit: {reason}")]
    InvalidRateLimit { reason: String },
    #[error("invalid liquidations config: {reason}")]
    InvalidLiquidations { reason: String },
    #[error("invalid proposal config: {reason}")]
    InvalidProposal { reason: String },
}

// Environment presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Testnet,
    Mainnet,
}

impl Environment {
    pub fn config(&self) -> ClobConfig {
        match self {
            Environment::Development => ClobConfig::testing(),
            Environment::Testnet => ClobConfig::default(),
            Environment::Mainnet => ClobConfig::mainnet(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = ClobConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.orders.short_block_window, 20);
    }

    #[test]
    fn test_environment_presets() {
        assert!(Environment::Development.config().validate().is_ok());
        assert!(Environment::Testnet.config().validate().is_ok());
        assert!(Environment::Mainnet.config().validate().is_ok());
    }

    #[test]
    fn test_mainnet_caps_position_portion() {
        let config = ClobConfig::mainnet();
        assert_eq!(
            config.liquidations.position_block_limits.max_position_portion_liquidated_ppm,
            100_000
        );
    }

    #[test]
    fn test_invalid_rate_limit_window() {
        let mut config = ClobConfig::default();
        config.rate_limits.stateful_orders.push(MaxPerNBlocks { num_blocks: 0, limit: 1 });
        assert!(matches!(config.validate(), Err(ConfigError::InvalidRateLimit { .. })));
    }

    #[test]
    fn test_invalid_liquidation_fee() {
        let mut config = ClobConfig::default();
        config.liquidations.max_liquidation_fee_ppm = 2_000_000;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidLiquidations { .. })));
    }

    #[test]
    fn test_invalid_clob_pair() {
        let mut pair = ClobPairConfig::btc_usd();
        assert!(pair.validate().is_ok());
        pair.subticks_per_tick = 0;
        assert!(matches!(pair.validate(), Err(ConfigError::InvalidClobPair { .. })));
    }

    #[test]
    fn test_config_serialization() {
        let config = ClobConfig::mainnet();
        let json = serde_json::to_string(&config).unwrap();
        let back: ClobConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(
            back.liquidations.max_liquidation_attempts_per_block,
            config.liquidations.max_liquidation_attempts_per_block
        );
        assert_eq!(back.rate_limits.stateful_orders, config.rate_limits.stateful_orders);
    }
}
