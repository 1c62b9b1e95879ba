//! Idempotency log: deterministic event IDs, check-and-record against the
//! Store, and pruning — grounded on `modules/idempotency.py`'s
//! `EVENT_ID_FIELDS` table and `generate_event_id`/`check_and_record`.

use bitcoin_hashes::{sha256, Hash};
use serde_json::{json, Value};

use crate::error::HiveResult;
use crate::protocol::messages::{identity_fields, HiveMessageType};
use crate::store::Store;

/// First 32 hex chars of `SHA256(canonical_json({_type, ...identity fields}))`.
/// `serde_json::Value`'s object type is a `BTreeMap` here, so key order in
/// the literal below doesn't matter — `to_string()` always emits sorted
/// keys.
pub fn generate_event_id(msg_type: HiveMessageType, payload: &Value) -> Option<String> {
	let fields = identity_fields(msg_type)?;
	let mut record = serde_json::Map::new();
	record.insert("_type".to_string(), json!(msg_type.name()));
	for field in fields {
		let value = payload.get(field).cloned().unwrap_or(Value::Null);
		record.insert((*field).to_string(), value);
	}
	let canonical = Value::Object(record).to_string();
	let digest = sha256::Hash::hash(canonical.as_bytes());
	Some(digest.to_string()[..32].to_string())
}

/// `INSERT OR IGNORE` against `proto_events`. Returns `(is_new, event_id)`.
/// Types with no declared identity fields (gossip, snapshots) are naturally
/// idempotent via version-guarded overwrite and are never tracked here —
/// callers should not call this for them.
pub fn check_and_record(
	store: &Store,
	msg_type: HiveMessageType,
	payload: &Value,
	actor_id: &str,
	now: i64,
) -> HiveResult<(bool, String)> {
	let event_id = generate_event_id(msg_type, payload)
		.unwrap_or_else(|| format!("{:x}", sha256::Hash::hash(payload.to_string().as_bytes())));
	let is_new = store.with_conn(|conn| {
		let changed = conn.execute(
			"INSERT OR IGNORE INTO proto_events (event_id, event_type, actor_id, created_at, received_at) \
			 VALUES (?1, ?2, ?3, ?4, ?4)",
			rusqlite::params![event_id, msg_type.name(), actor_id, now],
		)?;
		Ok(changed > 0)
	})?;
	Ok((is_new, event_id))
}

/// Deletes `proto_events` rows older than 30 days (spec.md §4.2).
pub fn prune(store: &Store, now: i64) -> HiveResult<usize> {
	let cutoff = now - 30 * 24 * 3600;
	store.with_conn(|conn| {
		let n = conn.execute("DELETE FROM proto_events WHERE received_at < ?1", [cutoff])?;
		Ok(n)
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::test_store;

	#[test]
	fn event_id_is_stable_under_key_reordering() {
		let a = json!({"proposal_id": "p1", "voter": "02aa", "vote": "approve"});
		let b = json!({"vote": "approve", "voter": "02aa", "proposal_id": "p1"});
		assert_eq!(
			generate_event_id(HiveMessageType::BanVote, &a),
			generate_event_id(HiveMessageType::BanVote, &b)
		);
	}

	#[test]
	fn check_and_record_is_idempotent() {
		let store = test_store();
		let payload = json!({"proposal_id": "p1", "voter": "02aa", "vote": "approve"});
		let (first_new, id1) =
			check_and_record(&store, HiveMessageType::BanVote, &payload, "02aa", 1000).unwrap();
		let (second_new, id2) =
			check_and_record(&store, HiveMessageType::BanVote, &payload, "02aa", 1001).unwrap();
		assert!(first_new);
		assert!(!second_new);
		assert_eq!(id1, id2);
	}

	#[test]
	fn gossip_has_no_identity_fields() {
		assert!(identity_fields(HiveMessageType::Gossip).is_none());
	}
}
