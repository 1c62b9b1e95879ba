//! Two nodes racing an Intent Lock for the same target resolve
//! deterministically once the hold expires, with the loser recorded as
//! `aborted(lost_tiebreaker)` (spec.md §4.6).

use hive_node::intent;

mod common;
use common::open_store;

#[test]
fn lexicographically_smallest_initiator_wins() {
	let store = open_store();
	let alice = "02".to_string() + &"a".repeat(64);
	let bob = "03".to_string() + &"b".repeat(64);

	intent::announce(&store, "intent-alice", "channel_open", "peer-x", &alice, 1_000, 60).unwrap();
	intent::announce(&store, "intent-bob", "channel_open", "peer-x", &bob, 1_000, 60).unwrap();

	let competitors = intent::competitors(&store, "channel_open", "peer-x").unwrap();
	assert_eq!(competitors.len(), 2);
	let winner = intent::winner(&competitors).unwrap();
	assert_eq!(winner.initiator_pubkey, alice);

	let losers = intent::resolve_due(&store, 1_100).unwrap();
	assert_eq!(losers, vec!["intent-bob".to_string()]);

	let remaining = intent::competitors(&store, "channel_open", "peer-x").unwrap();
	assert!(remaining.is_empty(), "both intents left pending status after resolution");
}

#[test]
fn second_announce_for_same_tuple_is_rejected() {
	let store = open_store();
	let alice = "02".to_string() + &"a".repeat(64);
	intent::announce(&store, "intent-1", "rebalance", "peer-y", &alice, 1_000, 60).unwrap();
	let err = intent::announce(&store, "intent-2", "rebalance", "peer-y", &alice, 1_000, 60).unwrap_err();
	assert!(err.is_idempotent_noop());
}
