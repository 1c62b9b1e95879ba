//! Canonical signing payloads.
//!
//! `serde_json::Value`'s map type is a `BTreeMap` here (the `preserve_order`
//! feature is not enabled), so `Value::to_string()` already emits
//! sort-keys, compact-separator JSON — the one thing call sites still have
//! to do by hand is sort any nested list of peer records by `peer_id`
//! before handing it to `serde_json::json!`, since array element order is
//! not otherwise touched.

use serde_json::{json, Value};

use super::messages::{
	BanProposalPayload, BanVotePayload, FullSyncResponsePayload, MemberLeftPayload,
	SettlementExecutedPayload, SettlementReadyPayload, VouchPayload,
};

/// Prefixes the canonical JSON of `fields` with `tag:` so that signatures
/// for structurally identical payloads of different message types never
/// collide (spec.md §3: "a canonical string prefixed with the message-type
/// tag").
pub fn signing_payload(tag: &str, fields: &Value) -> String {
	format!("{tag}:{fields}")
}

pub fn get_ban_proposal_signing_payload(p: &BanProposalPayload) -> String {
	let fields = json!({
		"proposal_id": p.proposal_id,
		"target": p.target,
		"proposer": p.proposer,
		"reason": p.reason,
		"proposed_at": p.proposed_at,
		"expires_at": p.expires_at,
	});
	signing_payload("BAN_PROPOSAL", &fields)
}

pub fn get_ban_vote_signing_payload(p: &BanVotePayload) -> String {
	let fields = json!({
		"proposal_id": p.proposal_id,
		"voter": p.voter,
		"vote": p.vote,
	});
	signing_payload("BAN_VOTE", &fields)
}

pub fn get_vouch_signing_payload(p: &VouchPayload) -> String {
	let fields = json!({
		"request_id": p.request_id,
		"target": p.target,
		"voucher": p.voucher,
	});
	signing_payload("VOUCH", &fields)
}

pub fn get_member_left_signing_payload(p: &MemberLeftPayload) -> String {
	let fields = json!({
		"peer_id": p.peer_id,
		"timestamp": p.timestamp,
	});
	signing_payload("MEMBER_LEFT", &fields)
}

pub fn get_settlement_ready_signing_payload(p: &SettlementReadyPayload) -> String {
	let fields = json!({
		"proposal_id": p.proposal_id,
		"voter": p.voter,
		"data_hash": p.data_hash,
	});
	signing_payload("SETTLEMENT_READY", &fields)
}

pub fn get_settlement_executed_signing_payload(p: &SettlementExecutedPayload) -> String {
	let fields = json!({
		"proposal_id": p.proposal_id,
		"executor": p.executor,
		"payment_hash": p.payment_hash,
		"amount_paid_sats": p.amount_paid_sats,
		"plan_hash": p.plan_hash,
	});
	signing_payload("SETTLEMENT_EXECUTED", &fields)
}

/// Sorts `entries` by `peer_id` before canonicalizing, per spec.md §4.1's
/// "must sort nested peer lists by `peer_id`".
pub fn get_full_sync_response_signing_payload(p: &FullSyncResponsePayload) -> String {
	let mut entries = p.entries.clone();
	entries.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
	let fields = json!({
		"request_id": p.request_id,
		"entries": entries,
	});
	signing_payload("FULL_SYNC_RESPONSE", &fields)
}

/// Canonical hash input for settlement contributions (spec.md §4.9 step 3):
/// a list of per-member contribution records, sorted by `peer_id`.
pub fn canonical_contributions(mut entries: Vec<Value>) -> String {
	entries.sort_by(|a, b| {
		let ka = a.get("peer_id").and_then(Value::as_str).unwrap_or("");
		let kb = b.get("peer_id").and_then(Value::as_str).unwrap_or("");
		ka.cmp(kb)
	});
	Value::Array(entries).to_string()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::protocol::messages::VoteChoice;

	#[test]
	fn signing_payload_independent_of_key_order() {
		let a = json!({"a": 1, "b": 2});
		let b = json!({"b": 2, "a": 1});
		assert_eq!(a.to_string(), b.to_string());
	}

	#[test]
	fn ban_vote_signing_is_deterministic() {
		let p = BanVotePayload {
			proposal_id: "p1".to_string(),
			voter: "02aa".to_string(),
			vote: VoteChoice::Approve,
			signature: "sig".to_string(),
		};
		let s1 = get_ban_vote_signing_payload(&p);
		let s2 = get_ban_vote_signing_payload(&p);
		assert_eq!(s1, s2);
		assert!(s1.starts_with("BAN_VOTE:"));
	}

	#[test]
	fn full_sync_response_sorts_entries() {
		use crate::protocol::messages::PeerStateEntry;
		let entry = |id: &str| PeerStateEntry {
			peer_id: id.to_string(),
			capacity_sats: 0,
			available_sats: 0,
			fee_policy: json!({}),
			topology: vec![],
			last_gossip: 0,
			state_hash: String::new(),
			version: 1,
		};
		let p1 = FullSyncResponsePayload {
			request_id: "r".to_string(),
			entries: vec![entry("02bb"), entry("02aa")],
		};
		let p2 = FullSyncResponsePayload {
			request_id: "r".to_string(),
			entries: vec![entry("02aa"), entry("02bb")],
		};
		assert_eq!(
			get_full_sync_response_signing_payload(&p1),
			get_full_sync_response_signing_payload(&p2)
		);
	}
}
