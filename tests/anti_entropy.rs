//! State-hash exchange converges two out-of-sync peers: a `StateHash`
//! announcement with a mismatched hash triggers `FullSyncRequest`, whose
//! response merges every entry into the requester's store (spec.md §4.7).

use std::sync::Arc;

use hive_node::coordinator::{Coordinator, InboundContext};
use hive_node::host::{NodeHost, TestSigner};
use hive_node::protocol::messages::{HiveMessageType, StateHashPayload};
use hive_node::protocol::{self, Frame};
use hive_node::state_sync;
use hive_node::store::PeerStateRow;

mod common;
use common::{open_store, test_config};

fn node(pubkey: &str) -> Coordinator {
	let store = open_store();
	let host: Arc<dyn NodeHost> = Arc::new(TestSigner::new(pubkey.to_string()));
	Coordinator::new(store, host, test_config(pubkey.to_string()))
}

#[tokio::test]
async fn mismatched_state_hash_triggers_full_sync() {
	let node_a = node(&("02".to_string() + &"a".repeat(64)));
	let node_b = node(&("03".to_string() + &"b".repeat(64)));

	let known_peer = "02".to_string() + &"c".repeat(64);
	state_sync::merge_entry(
		&node_a.store,
		&PeerStateRow {
			peer_id: known_peer.clone(),
			capacity_sats: 5_000_000,
			available_sats: 2_000_000,
			fee_policy: serde_json::json!({}),
			topology: vec![],
			last_gossip: 1_000,
			state_hash: "hash-v1".to_string(),
			version: 1,
		},
	)
	.unwrap();

	assert!(state_sync::all_entries(&node_b.store).unwrap().is_empty());

	let a_id = "02".to_string() + &"a".repeat(64);
	let b_id = "03".to_string() + &"b".repeat(64);

	let a_hash = state_sync::current_state_hash(&node_a.store).unwrap();
	let announcement = StateHashPayload {
		peer_id: a_id.clone(),
		state_hash: a_hash,
		membership_hash: state_sync::compute_membership_hash(&[]),
		version: 1_000,
	};
	let frame = Frame {
		version: 1,
		msg_type: HiveMessageType::StateHash,
		payload: serde_json::to_value(&announcement).unwrap(),
	};
	let bytes = protocol::serialize(&frame).unwrap();
	let ctx = InboundContext { transport_peer_id: &a_id };
	let request_frame = node_b.handle_inbound(&bytes, ctx, 1_000).await.unwrap().expect("hash mismatch must request full sync");
	assert_eq!(request_frame.msg_type, HiveMessageType::FullSyncRequest);

	let request_bytes = protocol::serialize(&request_frame).unwrap();
	let ctx = InboundContext { transport_peer_id: &b_id };
	let response_frame = node_a
		.handle_inbound(&request_bytes, ctx, 1_001)
		.await
		.unwrap()
		.expect("full sync request must produce a response");
	assert_eq!(response_frame.msg_type, HiveMessageType::FullSyncResponse);

	let response_bytes = protocol::serialize(&response_frame).unwrap();
	let ctx = InboundContext { transport_peer_id: &a_id };
	node_b.handle_inbound(&response_bytes, ctx, 1_002).await.unwrap();

	let synced = state_sync::all_entries(&node_b.store).unwrap();
	assert_eq!(synced.len(), 1);
	assert_eq!(synced[0].peer_id, known_peer);
	assert_eq!(
		state_sync::current_state_hash(&node_b.store).unwrap(),
		state_sync::current_state_hash(&node_a.store).unwrap()
	);
}
