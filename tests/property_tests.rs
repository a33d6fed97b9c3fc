//! Property-based tests for matching and replay.
//!
//! These tests verify invariants hold under random order flow.

use clob_core::*;
use clob_core::twap::leg_quantums;
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

const PAIR: ClobPairId = ClobPairId(0);

fn sub(owner: u64) -> SubaccountId {
    SubaccountId::new(owner, 0)
}

fn clob() -> (MemClob, Arc<InMemoryLedger>) {
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
    for owner in 1..=4 {
        ledger.deposit(sub(owner), dec!(1_000_000));
    }
    let mut clob = MemClob::with_ledger(ClobConfig::testing(), ledger.clone()).unwrap();
    clob.add_clob_pair(ClobPairConfig::new(0, 1, 1, 0)).unwrap();
    clob.begin_block(BlockContext::new(10, 1_000));
    (clob, ledger)
}

#[derive(Debug, Clone)]
struct Flow {
    owner: u64,
    side: Side,
    quantums: u64,
    subticks: u64,
    time_in_force: TimeInForce,
}

// Strategies for generating order flow
fn side_strategy() -> impl Strategy<Value = Side> {
    prop_oneof![Just(Side::Buy), Just(Side::Sell)]
}

fn tif_strategy() -> impl Strategy<Value = TimeInForce> {
    prop_oneof![
        4 => Just(TimeInForce::GTC),
        1 => Just(TimeInForce::IOC),
        1 => Just(TimeInForce::FOK),
        1 => Just(TimeInForce::PostOnly),
    ]
}

fn flow_strategy() -> impl Strategy<Value = Vec<Flow>> {
    proptest::collection::vec(
        (1u64..=4, side_strategy(), 1u64..50, 5u64..15, tif_strategy()).prop_map(
            |(owner, side, quantums, subticks, time_in_force)| Flow {
                owner,
                side,
                quantums,
                subticks,
                time_in_force,
            },
        ),
        1..40,
    )
}

fn place_all(clob: &MemClob, flow: &[Flow]) -> Vec<Order> {
    flow.iter()
        .enumerate()
        .map(|(i, f)| {
            let order = Order::short_term(sub(f.owner), i as u32, PAIR, f.side, f.quantums, f.subticks, 15)
                .with_time_in_force(f.time_in_force);
            let _ = clob.place_order(order.clone());
            order
        })
        .collect()
}

proptest! {
    /// The book never rests crossed after any placement.
    #[test]
    fn book_never_crossed(flow in flow_strategy()) {
        let (clob, _) = clob();
        place_all(&clob, &flow);
        if let (Some(bid), Some(ask)) = (clob.best_bid(PAIR), clob.best_ask(PAIR)) {
            prop_assert!(bid < ask, "crossed book bid={} ask={}", bid, ask);
        }
    }

    /// Fill amount never exceeds order size.
    #[test]
    fn fill_never_exceeds_size(flow in flow_strategy()) {
        let (clob, _) = clob();
        for order in place_all(&clob, &flow) {
            prop_assert!(clob.get_fill_amount(&order.id) <= order.quantums);
        }
    }

    /// Every fill has two sides: base and quote deltas net to zero.
    #[test]
    fn block_deltas_balance(flow in flow_strategy()) {
        let (mut clob, _) = clob();
        place_all(&clob, &flow);
        let settlement = clob.commit();
        let base: i128 = settlement.position_deltas.iter().map(|(_, d)| d.base_quantums).sum();
        let quote: Decimal = settlement.position_deltas.iter().map(|(_, d)| d.quote_quantums).sum();
        prop_assert_eq!(base, 0);
        prop_assert_eq!(quote, Decimal::ZERO);
    }

    /// A validator replaying the proposer's queue derives the same block.
    #[test]
    fn replay_is_deterministic(flow in flow_strategy()) {
        let (mut proposer, _) = clob();
        let (mut validator, _) = clob();
        place_all(&proposer, &flow);

        let operations = proposer.operations();
        prop_assert!(proposer.deliver_operations(&operations).is_ok());
        prop_assert!(validator.deliver_operations(&operations).is_ok());
        prop_assert_eq!(proposer.operations(), operations.clone());
        prop_assert_eq!(validator.operations(), operations);
        prop_assert_eq!(proposer.commit(), validator.commit());
    }

    /// Twap legs never over-emit and the final leg takes the rest.
    #[test]
    fn twap_legs_sum_to_parent(total in 1u64..10_000, legs in 1u32..50, step in 1u64..20) {
        let total = total * step;
        let mut remaining = total;
        let mut remaining_legs = legs;
        while remaining_legs > 0 {
            let leg = leg_quantums(remaining, remaining_legs, 1, step);
            prop_assert!(leg <= remaining);
            prop_assert_eq!(leg % step, 0);
            remaining -= leg;
            remaining_legs -= 1;
        }
        prop_assert_eq!(remaining, 0);
    }

    /// Rate limited admission never records more than the window allows.
    #[test]
    fn rate_limit_window_respected(limit in 1u32..5, attempts in 1usize..20) {
        let mut config = ClobConfig::testing();
        config.rate_limits.short_term_orders = vec![MaxPerNBlocks { num_blocks: 1, limit }];
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.add_market(PAIR, 10, MarginParams { initial_margin_ppm: 100_000, maintenance_margin_ppm: 50_000 }, 0);
        ledger.deposit(sub(1), dec!(1_000_000));
        let mut clob = MemClob::with_ledger(config, ledger).unwrap();
        clob.add_clob_pair(ClobPairConfig::new(0, 1, 1, 0)).unwrap();
        clob.begin_block(BlockContext::new(10, 1_000));

        let accepted = (0..attempts)
            .filter(|i| {
                let order = Order::short_term(sub(1), *i as u32, PAIR, Side::Buy, 1, 5, 15);
                clob.place_order(order).is_ok()
            })
            .count();
        prop_assert_eq!(accepted, attempts.min(limit as usize));
    }
}
