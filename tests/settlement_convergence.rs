//! A settlement proposal reaches quorum, its sub-payment legs journal to
//! `paid`, and execution closes the period exactly once (spec.md §4.9).

use hive_node::error::HiveErrorKind;
use hive_node::settlement::{self, PaymentLeg};

mod common;
use common::open_store;

#[test]
fn quorum_then_execution_closes_period_once() {
	let store = open_store();
	let period = "2026-W05";
	let data_hash = "hash-of-contributions";

	settlement::create_proposal(
		&store,
		"prop-1",
		period,
		"02",
		data_hash,
		Some("plan-hash-1"),
		500,
		3,
		"{}",
		1_000,
		1_000 + 3600,
	)
	.unwrap();

	for voter in ["voter-a", "voter-b"] {
		assert!(settlement::record_ready_vote(&store, "prop-1", voter, data_hash, 1_100, "sig").unwrap());
	}
	// 2/3 clears a 0.51 quorum fraction.
	assert!(settlement::evaluate_ready_quorum(&store, "prop-1", 0.51).unwrap());

	let legs = vec![
		PaymentLeg { from_peer: "debtor-a".to_string(), to_peer: "creditor-a".to_string(), amount_sats: 1_000 },
		PaymentLeg { from_peer: "debtor-b".to_string(), to_peer: "creditor-a".to_string(), amount_sats: 500 },
	];
	for leg in &legs {
		settlement::journal_sub_payment(&store, "prop-1", leg, "paid", Some("payhash"), 1_200).unwrap();
	}

	assert!(!settlement::is_period_settled(&store, period).unwrap());

	let closed = settlement::record_execution(
		&store,
		"prop-1",
		period,
		"02",
		Some("payhash"),
		Some(1_500),
		Some("plan-hash-1"),
		"sig-exec",
		1_300,
	)
	.unwrap();
	assert!(closed, "all legs journaled paid before execution, period must close");
	assert!(settlement::is_period_settled(&store, period).unwrap());

	// A second proposal for the already-settled period is rejected outright.
	let err = settlement::create_proposal(
		&store,
		"prop-2",
		period,
		"02",
		data_hash,
		None,
		0,
		3,
		"{}",
		1_400,
		1_400 + 3600,
	)
	.unwrap_err();
	assert_eq!(err.kind(), Some(HiveErrorKind::AlreadySettled));
}

#[test]
fn execution_with_unpaid_legs_does_not_close_period() {
	let store = open_store();
	let period = "2026-W06";
	let data_hash = "hash-2";

	settlement::create_proposal(&store, "prop-3", period, "02", data_hash, None, 0, 2, "{}", 1_000, 1_000 + 3600)
		.unwrap();

	let leg = PaymentLeg { from_peer: "debtor-a".to_string(), to_peer: "creditor-a".to_string(), amount_sats: 1_000 };
	settlement::journal_sub_payment(&store, "prop-3", &leg, "pending", None, 1_100).unwrap();

	let closed =
		settlement::record_execution(&store, "prop-3", period, "02", None, None, None, "sig", 1_200).unwrap();
	assert!(!closed, "an unpaid leg must hold the period open");
	assert!(!settlement::is_period_settled(&store, period).unwrap());
}
