//! TTL/hop-limited gossip relay with dedup and path tracking. Grounded on
//! `modules/relay.py`'s doc header.

use std::collections::HashMap;
use std::sync::Mutex;

use bitcoin_hashes::{sha256, Hash};
use serde_json::Value;

pub const DEFAULT_TTL: u8 = 3;
pub const DEDUP_WINDOW_SECONDS: i64 = 10 * 60;

/// A gossip envelope: TTL and the path of peers that already relayed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipEnvelope {
	pub ttl: u8,
	pub path: Vec<String>,
}

fn hash_payload(payload: &Value) -> String {
	sha256::Hash::hash(payload.to_string().as_bytes()).to_string()
}

/// Time-bounded dedup cache, fine-grained-locked per spec.md §5 ("mutating
/// operations on in-memory caches... are guarded by fine-grained locks").
pub struct DedupCache {
	seen: Mutex<HashMap<String, i64>>,
}

impl DedupCache {
	pub fn new() -> Self {
		Self { seen: Mutex::new(HashMap::new()) }
	}

	/// Records `payload`'s hash if unseen within the dedup window. Returns
	/// `true` if this is the first sighting (relay should proceed).
	pub fn record_if_new(&self, payload: &Value, now: i64) -> bool {
		let hash = hash_payload(payload);
		let mut seen = self.seen.lock().expect("dedup cache lock poisoned");
		seen.retain(|_, seen_at| now - *seen_at < DEDUP_WINDOW_SECONDS);
		if seen.contains_key(&hash) {
			false
		} else {
			seen.insert(hash, now);
			true
		}
	}
}

impl Default for DedupCache {
	fn default() -> Self {
		Self::new()
	}
}

/// Decides whether and to whom to forward a gossip envelope: decrement TTL,
/// forward to every connected member not already in `path`, unless TTL has
/// reached zero.
pub fn relay_targets(envelope: &GossipEnvelope, connected_members: &[String]) -> Vec<String> {
	if envelope.ttl == 0 {
		return Vec::new();
	}
	connected_members.iter().filter(|m| !envelope.path.contains(m)).cloned().collect()
}

/// Produces the outgoing envelope after this node relays: TTL decremented,
/// our pubkey appended to path.
pub fn advance_envelope(envelope: &GossipEnvelope, our_pubkey: &str) -> GossipEnvelope {
	let mut path = envelope.path.clone();
	path.push(our_pubkey.to_string());
	GossipEnvelope { ttl: envelope.ttl - 1, path }
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn dedup_cache_drops_repeat_within_window() {
		let cache = DedupCache::new();
		let payload = json!({"a": 1});
		assert!(cache.record_if_new(&payload, 0));
		assert!(!cache.record_if_new(&payload, 5));
	}

	#[test]
	fn dedup_cache_expires_after_window() {
		let cache = DedupCache::new();
		let payload = json!({"a": 1});
		assert!(cache.record_if_new(&payload, 0));
		assert!(cache.record_if_new(&payload, DEDUP_WINDOW_SECONDS + 1));
	}

	#[test]
	fn relay_stops_at_zero_ttl() {
		let envelope = GossipEnvelope { ttl: 0, path: vec![] };
		assert!(relay_targets(&envelope, &["a".to_string()]).is_empty());
	}

	#[test]
	fn relay_excludes_path_members() {
		let envelope = GossipEnvelope { ttl: 2, path: vec!["a".to_string()] };
		let targets = relay_targets(&envelope, &["a".to_string(), "b".to_string()]);
		assert_eq!(targets, vec!["b".to_string()]);
	}
}
