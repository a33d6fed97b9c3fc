// clob-core: deterministic central limit order book for on-chain perpetuals.
// every validator replays the same operations against the same committed state
// and must derive the same fills, so all math is integer or fixed-point decimal.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: ids, sides, subticks, quantums, block height/time, quote
//   2.x  order.rs: orders, flags, good-til, validation, replacement rules
//   2.1  orderbook.rs: price-time priority book per clob pair
//   2.2  state.rs: fill and cancel tables over a copy-on-write overlay
//   3.x  collaborators.rs: collateral, price and subaccount interfaces
//   3.1  ledger.rs: in-memory collaborator used by tests and simulations
//   4.x  conditional.rs: dormant stop-loss / take-profit orders
//   4.1  twap.rs: twap parents, leg sizing and catch-up
//   5.x  rate_limit.rs: per-subaccount sliding block windows
//   6.x  liquidation.rs: bankruptcy and fillable prices, block limits, insurance
//   6.2  deleveraging.rs: ranking and pricing of offsetting positions
//   7.x  config.rs: clob, liquidation, rate limit and proposal parameters
//   7.1  operations.rs: the per-block operations queue and its encoding
//   8.x  engine/: the memclob: placement, matching, triggers, liquidations, blocks
//   9.x  proposal.rs: byte-bounded block proposal assembly

// order book
pub mod orderbook;
pub mod order;
pub mod state;
pub mod types;

// triggers and admission
pub mod conditional;
pub mod rate_limit;
pub mod twap;

// risk
pub mod deleveraging;
pub mod liquidation;

// block building
pub mod collaborators;
pub mod config;
pub mod engine;
pub mod ledger;
pub mod operations;
pub mod proposal;

// re exports for convenience
pub use collaborators::*;
pub use conditional::*;
pub use config::*;
pub use deleveraging::*;
pub use engine::*;
pub use liquidation::*;
pub use order::*;
pub use types::*;
pub use ledger::InMemoryLedger;
pub use operations::{decode_operations, encode_operations, ClobMatch, Operation, OperationsQueue};
pub use orderbook::{OrderBook, PriceLevel};
pub use proposal::{
    FixedGroupSource, MessageTypeFilter, OperationsSource, Proposal, ProposalAssembler, ProposalError, TxFilter,
};
pub use rate_limit::{BlockRateLimiter, RateLimitClass, RateLimitError};
pub use state::{FillRecord, WithdrawalsGate};
pub use twap::{TwapOrderPlacement, TwapStore};
