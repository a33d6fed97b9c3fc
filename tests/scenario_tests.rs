//! End-to-end block scenarios.
//!
//! A proposer builds a block speculatively and ships its operations queue; an
//! independent validator with the same committed state replays it and must end
//! up with the same settlement.

use clob_core::*;
use rust_decimal_macros::dec;
use std::sync::Arc;

const PAIR: ClobPairId = ClobPairId(0);

fn sub(owner: u64) -> SubaccountId {
    SubaccountId::new(owner, 0)
}

struct Node {
    clob: MemClob,
    ledger: Arc<InMemoryLedger>,
}

fn node() -> Node {
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
    let mut clob = MemClob::with_ledger(ClobConfig::testing(), ledger.clone()).unwrap();
    clob.add_clob_pair(ClobPairConfig::new(0, 1, 1, 0)).unwrap();
    clob.begin_block(BlockContext::new(10, 1_000));
    Node { clob, ledger }
}

fn nodes() -> (Node, Node) {
    (node(), node())
}

fn order(owner: u64, client_id: u32, side: Side, quantums: u64, subticks: u64) -> Order {
    Order::short_term(sub(owner), client_id, PAIR, side, quantums, subticks, 15)
}

/// Deliver, end and commit the same operations on both nodes and settle each ledger.
fn finalize(proposer: &mut Node, validator: &mut Node) -> (BlockSettlement, BlockSettlement) {
    let payload = proposer.clob.operations_payload().unwrap();
    let operations = if payload.is_empty() {
        Vec::new()
    } else {
        decode_operations(&payload).unwrap()
    };

    proposer.clob.deliver_operations(&operations).unwrap();
    validator.clob.deliver_operations(&operations).unwrap();
    assert_eq!(proposer.clob.operations(), validator.clob.operations());

    proposer.clob.end_block();
    validator.clob.end_block();
    let proposed = proposer.clob.commit();
    let validated = validator.clob.commit();
    proposer.ledger.settle(&proposed);
    validator.ledger.settle(&validated);
    (proposed, validated)
}

#[test]
fn validator_reproduces_proposer_fills() {
    let (mut proposer, mut validator) = nodes();
    proposer.clob.place_order(order(2, 1, Side::Sell, 10, 10)).unwrap();
    proposer.clob.place_order(order(3, 1, Side::Sell, 10, 11)).unwrap();
    proposer.clob.place_order(order(4, 1, Side::Buy, 5, 9)).unwrap();
    proposer
        .clob
        .place_order(order(1, 1, Side::Buy, 15, 11).with_time_in_force(TimeInForce::IOC))
        .unwrap();

    let (proposed, validated) = finalize(&mut proposer, &mut validator);
    assert_eq!(proposed, validated);
    for owner in 1..=4 {
        assert_eq!(
            proposer.ledger.position(sub(owner), PAIR),
            validator.ledger.position(sub(owner), PAIR)
        );
    }
    assert_eq!(validator.ledger.position(sub(1), PAIR), 15);
    assert_eq!(validator.clob.best_ask(PAIR), Some(Subticks(11)));
    assert_eq!(validator.clob.best_bid(PAIR), Some(Subticks(9)));
}

#[test]
fn validator_local_orders_survive_rebuild() {
    let (mut proposer, mut validator) = nodes();
    let local = order(5, 1, Side::Buy, 5, 8);
    validator.clob.place_order(local.clone()).unwrap();
    proposer.clob.place_order(order(2, 1, Side::Sell, 10, 12)).unwrap();

    finalize(&mut proposer, &mut validator);
    // replay started from committed state, so the local order is gone
    assert!(validator.clob.get_order(&local.id).is_none());

    validator.clob.begin_block(BlockContext::new(11, 1_001));
    let results = validator.clob.discard_speculative(vec![local.clone()]);
    assert!(results.iter().all(|r| r.is_ok()));
    assert!(validator.clob.get_order(&local.id).is_some());
    assert_eq!(validator.clob.best_ask(PAIR), Some(Subticks(12)));
}

#[test]
fn liquidation_replays_with_insurance_fee() {
    let (mut proposer, mut validator) = nodes();
    // net collateral 40 against maintenance margin 50
    for n in [&proposer, &validator] {
        n.ledger.deposit(sub(1), dec!(-1_000_960));
        n.ledger.set_position(sub(1), PAIR, 100);
    }
    proposer.clob.place_order(order(2, 1, Side::Buy, 100, 10)).unwrap();

    let summary = proposer.clob.liquidate_subaccounts(&[sub(1), sub(3)]);
    assert_eq!(summary.liquidated_quantums(), 100);
    assert_eq!(summary.skipped.len(), 1);

    let (proposed, validated) = finalize(&mut proposer, &mut validator);
    assert_eq!(proposed, validated);
    assert_eq!(proposed.insurance_deltas, vec![(PAIR, dec!(5))]);
    assert_eq!(validator.ledger.position(sub(1), PAIR), 0);
    assert_eq!(validator.ledger.position(sub(2), PAIR), 100);
}

#[test]
fn empty_book_falls_back_to_deleveraging() {
    let (mut proposer, mut validator) = nodes();
    for n in [&proposer, &validator] {
        // net collateral -10: bankrupt
        n.ledger.deposit(sub(1), dec!(-1_001_010));
        n.ledger.set_position(sub(1), PAIR, 100);
        n.ledger.set_position(sub(3), PAIR, -100);
    }

    let summary = proposer.clob.liquidate_subaccounts(&[sub(1)]);
    assert_eq!(summary.liquidated_quantums(), 0);
    assert_eq!(summary.deleveraged_quantums(), 100);

    let (proposed, validated) = finalize(&mut proposer, &mut validator);
    assert_eq!(proposed, validated);
    assert_eq!(proposed.withdrawals_gated_at, None);
    for n in [&proposer, &validator] {
        assert_eq!(n.ledger.position(sub(1), PAIR), 0);
        assert_eq!(n.ledger.position(sub(3), PAIR), 0);
        assert_eq!(n.ledger.quote_balance(sub(1)), dec!(0));
    }
}

#[test]
fn unresolved_bankruptcy_gates_withdrawals_on_every_node() {
    let (mut proposer, mut validator) = nodes();
    for n in [&proposer, &validator] {
        n.ledger.deposit(sub(1), dec!(-1_001_010));
        n.ledger.set_position(sub(1), PAIR, 100);
    }

    proposer.clob.liquidate_subaccounts(&[sub(1)]);
    let (proposed, validated) = finalize(&mut proposer, &mut validator);
    assert_eq!(proposed.withdrawals_gated_at, Some(BlockHeight(10)));
    assert_eq!(validated.withdrawals_gated_at, Some(BlockHeight(10)));
}

#[test]
fn final_settlement_replays_at_oracle_price() {
    let (mut proposer, mut validator) = nodes();
    for n in [&mut proposer, &mut validator] {
        // net collateral 20: solvent, so settles at the oracle
        n.ledger.deposit(sub(1), dec!(-1_000_980));
        n.ledger.set_position(sub(1), PAIR, 100);
        n.ledger.set_position(sub(2), PAIR, -100);
        n.clob.set_clob_pair_status(PAIR, ClobPairStatus::FinalSettlement).unwrap();
    }

    let holders = proposer.clob.final_settlement_subaccounts();
    assert_eq!(holders, vec![sub(1), sub(2)]);
    let results = proposer.clob.deleverage_final_settlement(&holders);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].total_quantums(), 100);

    let (proposed, validated) = finalize(&mut proposer, &mut validator);
    assert_eq!(proposed, validated);
    assert_eq!(proposed.withdrawals_gated_at, None);
    for n in [&proposer, &validator] {
        assert_eq!(n.ledger.position(sub(1), PAIR), 0);
        assert_eq!(n.ledger.position(sub(2), PAIR), 0);
        assert_eq!(n.ledger.quote_balance(sub(1)), dec!(20));
    }
}

#[test]
fn tampered_queue_is_rejected() {
    let (mut proposer, mut validator) = nodes();
    proposer.clob.place_order(order(2, 1, Side::Sell, 10, 10)).unwrap();
    proposer.clob.place_order(order(1, 1, Side::Buy, 10, 10)).unwrap();

    let mut operations = proposer.clob.operations();
    if let Some(Operation::Match(ClobMatch::Orders(m))) = operations.last_mut() {
        m.fills[0].fill_quantums = 9;
    }
    assert_eq!(
        validator.clob.deliver_operations(&operations),
        Err(EngineError::ReplayDiverged { index: 2 })
    );
}

#[test]
fn twap_runs_across_blocks() {
    let (mut proposer, mut validator) = nodes();
    let params = TwapParameters {
        duration_secs: 20,
        interval_secs: 10,
        price_tolerance_ppm: 100_000,
    };
    let parent = Order::twap(sub(1), 1, PAIR, Side::Buy, 20, 11, params, 5_000);
    for n in [&mut proposer, &mut validator] {
        n.clob.place_order(Order::long_term(sub(2), 1, PAIR, Side::Sell, 20, 10, 5_000)).unwrap();
    }
    proposer.clob.place_order(parent.clone()).unwrap();
    finalize(&mut proposer, &mut validator);
    assert_eq!(validator.clob.get_fill_amount(&parent.id), 10);

    for n in [&mut proposer, &mut validator] {
        n.clob.begin_block(BlockContext::new(11, 1_010));
    }
    finalize(&mut proposer, &mut validator);
    assert_eq!(validator.clob.get_fill_amount(&parent.id), 20);
    assert_eq!(validator.ledger.position(sub(1), PAIR), 20);
    assert_eq!(validator.clob.order_status(&parent.id), Some(OrderStatus::FullyFilled));
}

struct Fixed;

impl FixedGroupSource for Fixed {
    fn attestation(&self) -> Result<Vec<u8>, ProposalError> {
        Ok(Vec::new())
    }

    fn price_updates(&self) -> Result<Vec<u8>, ProposalError> {
        Ok(b"prices".to_vec())
    }

    fn funding_votes(&self) -> Result<Vec<u8>, ProposalError> {
        Ok(b"funding".to_vec())
    }
}

#[test]
fn proposal_carries_the_operations_queue() {
    let (proposer, _) = nodes();
    proposer.clob.place_order(order(2, 1, Side::Sell, 10, 10)).unwrap();
    proposer.clob.place_order(order(1, 1, Side::Buy, 10, 10)).unwrap();

    let config = proposer.clob.config().proposal.clone();
    let filter = MessageTypeFilter::from_config(&config);
    let pool = vec![br#"{"messages":[{"type_url":"/bank.MsgSend"}]}"#.to_vec()];
    let proposal = ProposalAssembler::new(&config, &filter).prepare_proposal(1_000_000, &Fixed, &proposer.clob, &pool);

    assert_eq!(proposal.txs.len(), 5);
    assert!(proposal.txs[0].is_empty());
    assert_eq!(decode_operations(&proposal.txs[1]).unwrap(), proposer.clob.operations());
    assert_eq!(proposal.txs[2], pool[0]);
    assert_eq!(proposal.txs[4], b"prices".to_vec());
}
