//! Per-peer inflight cap: once a peer has `MAX_INFLIGHT_PER_PEER` non-terminal
//! rows, further enqueues for that peer are dropped and reported, not queued
//! past the limit (spec.md §4.3).

use hive_node::outbox::{self, MAX_INFLIGHT_PER_PEER};
use hive_node::protocol::messages::HiveMessageType;

mod common;
use common::open_store;

#[test]
fn enqueue_drops_once_peer_is_at_inflight_cap() {
	let store = open_store();
	let us = "02".to_string() + &"a".repeat(64);
	let peer = "03".to_string() + &"b".repeat(64);
	let targets = vec![peer.clone()];

	for i in 0..MAX_INFLIGHT_PER_PEER {
		let dropped = outbox::enqueue(
			&store,
			&us,
			&format!("msg-{i}"),
			HiveMessageType::Gossip,
			"{}",
			&targets,
			1_000,
		)
		.unwrap();
		assert!(dropped.is_empty(), "enqueue {i} must not be dropped, below the cap");
	}

	let dropped = outbox::enqueue(
		&store,
		&us,
		"msg-overflow",
		HiveMessageType::Gossip,
		"{}",
		&targets,
		1_000,
	)
	.unwrap();
	assert_eq!(dropped, vec![peer]);
}

#[test]
fn enqueue_skips_our_own_pubkey() {
	let store = open_store();
	let us = "02".to_string() + &"a".repeat(64);
	let targets = vec![us.clone()];

	let dropped =
		outbox::enqueue(&store, &us, "msg-self", HiveMessageType::Gossip, "{}", &targets, 1_000).unwrap();
	assert!(dropped.is_empty(), "self-addressed target is skipped, not dropped-for-cap");
}
