//! HiveMap state synchronization: per-peer state cache, deterministic state
//! hash, threshold gossip, anti-entropy FULL_SYNC. Grounded on
//! `modules/state_manager.py`'s doc header; spec.md §4.7.

use std::collections::HashMap;
use std::sync::Mutex;

use bitcoin_hashes::{sha256, Hash};
use serde_json::json;

use crate::error::HiveResult;
use crate::store::{PeerStateRow, Store};

pub const GOSSIP_CAPACITY_CHANGE_THRESHOLD: f64 = 0.10;
pub const HEARTBEAT_INTERVAL_SECONDS: i64 = 1800;
pub const ANTI_ENTROPY_INTERVAL_SECONDS: i64 = 120;
pub const FULL_SYNC_COOLDOWN_SECONDS: i64 = 60;

/// `SHA256(sorted_json([{peer_id, version, timestamp}, ...]))`. Only
/// identity/version metadata is hashed, not the full payload, per spec.md
/// §4.7 — this is deliberately cheap to compute and compare.
pub fn compute_state_hash(entries: &[(String, u64, i64)]) -> String {
	let mut sorted: Vec<_> = entries.to_vec();
	sorted.sort_by(|a, b| a.0.cmp(&b.0));
	let values: Vec<_> = sorted
		.iter()
		.map(|(peer_id, version, timestamp)| {
			json!({"peer_id": peer_id, "version": version, "timestamp": timestamp})
		})
		.collect();
	let canonical = serde_json::Value::Array(values).to_string();
	sha256::Hash::hash(canonical.as_bytes()).to_string()
}

/// Hash over sorted `(peer_id, tier)` pairs, used to detect membership
/// divergence even when state hashes already agree.
pub fn compute_membership_hash(members: &[(String, String)]) -> String {
	let mut sorted: Vec<_> = members.to_vec();
	sorted.sort_by(|a, b| a.0.cmp(&b.0));
	let values: Vec<_> =
		sorted.iter().map(|(peer_id, tier)| json!({"peer_id": peer_id, "tier": tier})).collect();
	let canonical = serde_json::Value::Array(values).to_string();
	sha256::Hash::hash(canonical.as_bytes()).to_string()
}

/// Reasons a node should broadcast its own `GOSSIP`, per spec.md §4.7's
/// threshold-gossip rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GossipTrigger {
	CapacityDelta,
	FeePolicyChanged,
	BanChanged,
	Heartbeat,
}

pub fn should_gossip(
	old_capacity: u64,
	new_capacity: u64,
	fee_policy_changed: bool,
	ban_changed: bool,
	seconds_since_last_broadcast: i64,
) -> Option<GossipTrigger> {
	if old_capacity > 0 {
		let delta = (new_capacity as f64 - old_capacity as f64).abs() / old_capacity as f64;
		if delta > GOSSIP_CAPACITY_CHANGE_THRESHOLD {
			return Some(GossipTrigger::CapacityDelta);
		}
	}
	if fee_policy_changed {
		return Some(GossipTrigger::FeePolicyChanged);
	}
	if ban_changed {
		return Some(GossipTrigger::BanChanged);
	}
	if seconds_since_last_broadcast >= HEARTBEAT_INTERVAL_SECONDS {
		return Some(GossipTrigger::Heartbeat);
	}
	None
}

/// Version-guarded merge: accepts `incoming` iff its `version` exceeds the
/// local version; defensive copies of `topology`/`fee_policy` are taken by
/// virtue of owning `PeerStateRow` by value.
pub fn merge_entry(store: &Store, incoming: &PeerStateRow) -> HiveResult<bool> {
	store.with_conn(|conn| {
		let local_version: Option<i64> = conn
			.query_row(
				"SELECT version FROM peer_state WHERE peer_id = ?1",
				[&incoming.peer_id],
				|r| r.get(0),
			)
			.ok();
		if let Some(local_version) = local_version {
			if (incoming.version as i64) <= local_version {
				return Ok(false);
			}
		}
		conn.execute(
			"INSERT INTO peer_state \
			 (peer_id, capacity_sats, available_sats, fee_policy, topology, last_gossip, \
			  state_hash, version) \
			 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
			 ON CONFLICT(peer_id) DO UPDATE SET \
			   capacity_sats = excluded.capacity_sats, \
			   available_sats = excluded.available_sats, \
			   fee_policy = excluded.fee_policy, \
			   topology = excluded.topology, \
			   last_gossip = excluded.last_gossip, \
			   state_hash = excluded.state_hash, \
			   version = excluded.version",
			rusqlite::params![
				incoming.peer_id,
				incoming.capacity_sats as i64,
				incoming.available_sats as i64,
				incoming.fee_policy.to_string(),
				serde_json::to_string(&incoming.topology).unwrap_or_default(),
				incoming.last_gossip,
				incoming.state_hash,
				incoming.version as i64,
			],
		)?;
		Ok(true)
	})
}

pub fn all_entries(store: &Store) -> HiveResult<Vec<PeerStateRow>> {
	store.with_conn(|conn| {
		let mut stmt = conn.prepare(
			"SELECT peer_id, capacity_sats, available_sats, fee_policy, topology, last_gossip, \
			 state_hash, version FROM peer_state",
		)?;
		let rows = stmt
			.query_map([], |row| {
				let fee_policy: String = row.get(3)?;
				let topology: String = row.get(4)?;
				Ok(PeerStateRow {
					peer_id: row.get(0)?,
					capacity_sats: row.get::<_, i64>(1)? as u64,
					available_sats: row.get::<_, i64>(2)? as u64,
					fee_policy: serde_json::from_str(&fee_policy).unwrap_or(serde_json::json!({})),
					topology: serde_json::from_str(&topology).unwrap_or_default(),
					last_gossip: row.get(5)?,
					state_hash: row.get(6)?,
					version: row.get::<_, i64>(7)? as u64,
				})
			})?
			.collect::<Result<Vec<_>, _>>()?;
		Ok(rows)
	})
}

pub fn current_state_hash(store: &Store) -> HiveResult<String> {
	let entries = all_entries(store)?;
	let tuples: Vec<_> =
		entries.iter().map(|e| (e.peer_id.clone(), e.version, e.last_gossip)).collect();
	Ok(compute_state_hash(&tuples))
}

/// Per-peer FULL_SYNC rate limiter (spec.md §4.7: "per-peer rate-limited...
/// cooldown 60s").
pub struct FullSyncLimiter {
	last_request: Mutex<HashMap<String, i64>>,
}

impl FullSyncLimiter {
	pub fn new() -> Self {
		Self { last_request: Mutex::new(HashMap::new()) }
	}

	pub fn allow(&self, peer_id: &str, now: i64) -> bool {
		let mut last = self.last_request.lock().expect("full sync limiter lock poisoned");
		let due = last.get(peer_id).map(|t| now - t >= FULL_SYNC_COOLDOWN_SECONDS).unwrap_or(true);
		if due {
			last.insert(peer_id.to_string(), now);
		}
		due
	}
}

impl Default for FullSyncLimiter {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::test_store;

	#[test]
	fn state_hash_independent_of_insertion_order() {
		let a = vec![("p1".to_string(), 3, 10), ("p2".to_string(), 2, 9)];
		let b = vec![("p2".to_string(), 2, 9), ("p1".to_string(), 3, 10)];
		assert_eq!(compute_state_hash(&a), compute_state_hash(&b));
	}

	#[test]
	fn merge_accepts_strictly_newer_version() {
		let store = test_store();
		let entry = |version: u64| PeerStateRow {
			peer_id: "p1".to_string(),
			capacity_sats: 1,
			available_sats: 1,
			fee_policy: serde_json::json!({}),
			topology: vec![],
			last_gossip: 0,
			state_hash: "h".to_string(),
			version,
		};
		assert!(merge_entry(&store, &entry(1)).unwrap());
		assert!(merge_entry(&store, &entry(3)).unwrap());
		assert!(!merge_entry(&store, &entry(2)).unwrap());
		assert!(!merge_entry(&store, &entry(3)).unwrap());
	}

	#[test]
	fn anti_entropy_scenario_converges() {
		let store_a = test_store();
		let store_b = test_store();
		let p1 = |version: u64| PeerStateRow {
			peer_id: "P1".to_string(),
			capacity_sats: 1,
			available_sats: 1,
			fee_policy: serde_json::json!({}),
			topology: vec![],
			last_gossip: 0,
			state_hash: "h".to_string(),
			version,
		};
		let p2 = |version: u64| PeerStateRow {
			peer_id: "P2".to_string(),
			capacity_sats: 1,
			available_sats: 1,
			fee_policy: serde_json::json!({}),
			topology: vec![],
			last_gossip: 0,
			state_hash: "h".to_string(),
			version,
		};
		merge_entry(&store_a, &p1(3)).unwrap();
		merge_entry(&store_a, &p2(2)).unwrap();
		merge_entry(&store_b, &p1(1)).unwrap();
		merge_entry(&store_b, &p2(2)).unwrap();
		assert_ne!(current_state_hash(&store_a).unwrap(), current_state_hash(&store_b).unwrap());

		for entry in all_entries(&store_a).unwrap() {
			merge_entry(&store_b, &entry).unwrap();
		}
		assert_eq!(current_state_hash(&store_a).unwrap(), current_state_hash(&store_b).unwrap());
	}

	#[test]
	fn gossip_threshold_scenario() {
		assert!(should_gossip(10_000_000, 11_000_001, false, false, 0).is_some());
		assert!(should_gossip(11_000_001, 11_100_000, false, false, 0).is_none());
	}
}
