// 8.0: the in-memory clob. admits orders speculatively, matches them price-time,
// fires triggers and liquidations, and replays proposed operation queues.
// deterministic: same committed state plus same operations gives the same queue.

mod blocks;
mod config;
mod core;
mod deleveraging;
mod liquidations;
mod matching;
mod orders;
mod results;
mod triggers;

pub use config::{EngineOptions, ExecMode};
pub use self::core::MemClob;
pub use matching::MatchStop;
pub use results::{
    BlockSettlement, CancelResult, EndBlockSummary, EngineError, Fill, LiquidationOutcome, LiquidationSummary,
    OrderResult,
};
