//! Wire-frame serialization round trip and end-to-end dispatch through a
//! `Coordinator` for a single inbound `Gossip` frame (spec.md §4.1/§4.7).

use std::sync::Arc;

use hive_node::coordinator::{Coordinator, InboundContext};
use hive_node::host::{NodeHost, TestSigner};
use hive_node::protocol::messages::{GossipPayload, HiveMessageType};
use hive_node::protocol::{self, Frame};

mod common;
use common::{open_store, test_config};

#[test]
fn frame_survives_serialize_deserialize() {
	let payload = GossipPayload {
		peer_id: "02".to_string() + &"a".repeat(64),
		capacity_sats: 1_000_000,
		available_sats: 500_000,
		fee_policy: serde_json::json!({"base_fee_msat": 1000}),
		topology: vec!["03bb".to_string()],
		last_gossip: 1_000,
		state_hash: "deadbeef".to_string(),
		version: 1,
	};
	let frame = Frame {
		version: 1,
		msg_type: HiveMessageType::Gossip,
		payload: serde_json::to_value(&payload).unwrap(),
	};
	let bytes = protocol::serialize(&frame).unwrap();
	let decoded = protocol::deserialize(&bytes).unwrap();
	assert_eq!(decoded.msg_type, HiveMessageType::Gossip);
	let decoded_payload: GossipPayload = serde_json::from_value(decoded.payload).unwrap();
	assert_eq!(decoded_payload, payload);
}

#[tokio::test]
async fn inbound_gossip_merges_peer_state_and_acks() {
	let store = open_store();
	let our_pubkey = "02".to_string() + &"a".repeat(64);
	let host: Arc<dyn NodeHost> = Arc::new(TestSigner::new(our_pubkey.clone()));
	let coordinator = Coordinator::new(store, host, test_config(our_pubkey.clone()));

	let sender = "03".to_string() + &"b".repeat(64);
	let payload = GossipPayload {
		peer_id: sender.clone(),
		capacity_sats: 2_000_000,
		available_sats: 1_500_000,
		fee_policy: serde_json::json!({}),
		topology: vec![],
		last_gossip: 1_000,
		state_hash: "abc123".to_string(),
		version: 1,
	};
	let frame =
		Frame { version: 1, msg_type: HiveMessageType::Gossip, payload: serde_json::to_value(&payload).unwrap() };
	let bytes = protocol::serialize(&frame).unwrap();
	let ctx = InboundContext { transport_peer_id: &sender };
	let response = coordinator.handle_inbound(&bytes, ctx, 1_000).await.unwrap();
	assert!(response.is_none(), "Gossip has no typed ack, unlike tracked message types");
}
