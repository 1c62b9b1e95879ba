//! Intent Lock: announce-wait-commit with deterministic tie-breaking.
//! Grounded on spec.md §4.6; `modules/intent_manager.py`'s doc header
//! confirms the three-phase shape.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::{HiveError, HiveErrorKind, HiveResult};
use crate::store::{IntentLock, IntentStatus, Store};

pub const DEFAULT_HOLD_SECONDS: i64 = 60;
pub const CLOCK_SKEW_TOLERANCE_SECONDS: i64 = 300;
pub const MAX_REMOTE_INTENTS: usize = 200;
pub const STUCK_COMMITTED_MAX_AGE_SECONDS: i64 = 300;
pub const TERMINAL_PURGE_AGE_SECONDS: i64 = 24 * 3600;

/// Bounded, LRU-evicted cache of remote intents not yet reconciled into the
/// Store (spec.md §4.6: "the remote-intent cache is bounded... LRU
/// eviction").
pub struct RemoteIntentCache {
	order: Mutex<VecDeque<String>>,
}

impl RemoteIntentCache {
	pub fn new() -> Self {
		Self { order: Mutex::new(VecDeque::new()) }
	}

	/// Records that intent `id` was touched; evicts the oldest entry if the
	/// cache is now over `MAX_REMOTE_INTENTS`. Returns the id evicted, if any.
	pub fn touch(&self, id: &str) -> Option<String> {
		let mut order = self.order.lock().expect("remote intent cache lock poisoned");
		order.retain(|existing| existing != id);
		order.push_back(id.to_string());
		if order.len() > MAX_REMOTE_INTENTS {
			order.pop_front()
		} else {
			None
		}
	}
}

impl Default for RemoteIntentCache {
	fn default() -> Self {
		Self::new()
	}
}

/// Rejects remote intents whose announced `timestamp` is more than
/// `CLOCK_SKEW_TOLERANCE_SECONDS` away from our clock.
pub fn within_clock_skew(timestamp: i64, now: i64) -> bool {
	(timestamp - now).abs() <= CLOCK_SKEW_TOLERANCE_SECONDS
}

/// Creates and broadcasts (via the caller's outbox enqueue) a local
/// `pending` intent. Fails with `ProposalExists`-shaped semantics if one is
/// already pending for the same `(intent_type, target, initiator)` — spec.md
/// §3's invariant: "at most one pending intent per tuple... at a time per
/// node".
pub fn announce(
	store: &Store,
	id: &str,
	intent_type: &str,
	target: &str,
	initiator_pubkey: &str,
	now: i64,
	hold_seconds: i64,
) -> HiveResult<()> {
	store.with_conn(|conn| {
		let existing: i64 = conn.query_row(
			"SELECT COUNT(*) FROM intent_locks \
			 WHERE intent_type = ?1 AND target = ?2 AND initiator_pubkey = ?3 AND status = 'pending'",
			rusqlite::params![intent_type, target, initiator_pubkey],
			|r| r.get(0),
		)?;
		if existing > 0 {
			return Err(HiveError::new(
				HiveErrorKind::ProposalExists,
				format!("pending intent already exists for {intent_type}/{target}"),
			));
		}
		conn.execute(
			"INSERT INTO intent_locks \
			 (id, intent_type, target, initiator_pubkey, timestamp, expires_at, status, reason) \
			 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', NULL)",
			rusqlite::params![id, intent_type, target, initiator_pubkey, now, now + hold_seconds],
		)?;
		Ok(())
	})
}

fn row_from(row: &rusqlite::Row) -> rusqlite::Result<IntentLock> {
	let status: String = row.get(6)?;
	Ok(IntentLock {
		id: row.get(0)?,
		intent_type: row.get(1)?,
		target: row.get(2)?,
		initiator_pubkey: row.get(3)?,
		timestamp: row.get(4)?,
		expires_at: row.get(5)?,
		status: IntentStatus::from_str(&status).unwrap_or(IntentStatus::Failed),
		reason: row.get(7)?,
	})
}

/// All intents (local and remote) competing for the same `(type, target)`,
/// regardless of initiator, still `pending`.
pub fn competitors(store: &Store, intent_type: &str, target: &str) -> HiveResult<Vec<IntentLock>> {
	store.with_conn(|conn| {
		let mut stmt = conn.prepare(
			"SELECT id, intent_type, target, initiator_pubkey, timestamp, expires_at, status, reason \
			 FROM intent_locks WHERE intent_type = ?1 AND target = ?2 AND status = 'pending'",
		)?;
		let rows = stmt
			.query_map(rusqlite::params![intent_type, target], row_from)?
			.collect::<Result<Vec<_>, _>>()?;
		Ok(rows)
	})
}

/// Tie-break: the lexicographically smallest non-empty `initiator_pubkey`
/// wins. A `None`/empty pubkey always loses (spec.md §4.6 guard).
pub fn winner<'a>(candidates: &'a [IntentLock]) -> Option<&'a IntentLock> {
	candidates
		.iter()
		.filter(|c| !c.initiator_pubkey.is_empty())
		.min_by(|a, b| a.initiator_pubkey.cmp(&b.initiator_pubkey))
}

/// Resolves every hold whose `expires_at <= now`: the winner of each
/// competing group transitions to `committed`; every other pending intent
/// in that group transitions to `aborted(lost_tiebreaker)`. Returns the ids
/// that lost, so the caller can broadcast `INTENT_ABORT` for each.
pub fn resolve_due(store: &Store, now: i64) -> HiveResult<Vec<String>> {
	let due = store.with_conn(|conn| {
		let mut stmt = conn.prepare(
			"SELECT DISTINCT intent_type, target FROM intent_locks \
			 WHERE status = 'pending' AND expires_at <= ?1",
		)?;
		let pairs = stmt
			.query_map([now], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
			.collect::<Result<Vec<_>, _>>()?;
		Ok(pairs)
	})?;

	let mut losers = Vec::new();
	for (intent_type, target) in due {
		let group = competitors(store, &intent_type, &target)?;
		let due_group: Vec<_> = group.into_iter().filter(|c| c.expires_at <= now).collect();
		if due_group.is_empty() {
			continue;
		}
		let Some(won) = winner(&due_group) else {
			// No candidate has a usable pubkey (e.g. every entry in the group
			// is empty-pubkey) — there is no winner to commit, so the whole
			// group expires rather than re-competing forever.
			for candidate in &due_group {
				store.transaction(|tx| {
					tx.execute(
						"UPDATE intent_locks SET status = 'expired' WHERE id = ?1",
						[&candidate.id],
					)?;
					Ok(())
				})?;
			}
			continue;
		};
		let winner_id = won.id.clone();
		store.transaction(|tx| {
			tx.execute(
				"UPDATE intent_locks SET status = 'committed' WHERE id = ?1",
				[&winner_id],
			)?;
			Ok(())
		})?;
		for candidate in &due_group {
			if candidate.id != winner_id {
				store.transaction(|tx| {
					tx.execute(
						"UPDATE intent_locks SET status = 'aborted', reason = 'lost_tiebreaker' \
						 WHERE id = ?1",
						[&candidate.id],
					)?;
					Ok(())
				})?;
				losers.push(candidate.id.clone());
			}
		}
	}
	Ok(losers)
}

/// Recovery sweep (spec.md §4.6): intents stuck `committed` past
/// `STUCK_COMMITTED_MAX_AGE_SECONDS` fail with `stuck_recovery`; terminal
/// intents older than 24h are purged.
pub fn recover_and_purge(store: &Store, now: i64) -> HiveResult<()> {
	store.with_conn(|conn| {
		conn.execute(
			"UPDATE intent_locks SET status = 'failed', reason = 'stuck_recovery' \
			 WHERE status = 'committed' AND timestamp < ?1",
			[now - STUCK_COMMITTED_MAX_AGE_SECONDS],
		)?;
		conn.execute(
			"DELETE FROM intent_locks WHERE status IN ('aborted', 'expired', 'failed') \
			 AND timestamp < ?1",
			[now - TERMINAL_PURGE_AGE_SECONDS],
		)?;
		Ok(())
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::test_store;

	#[test]
	fn tiebreak_picks_lexicographically_smallest() {
		let store = test_store();
		announce(&store, "ia", "channel_open", "03cc", "02bb", 0, 60).unwrap();
		announce(&store, "ib", "channel_open", "03cc", "02aa", 0, 60).unwrap();
		let losers = resolve_due(&store, 100).unwrap();
		assert_eq!(losers, vec!["ia".to_string()]);
		let winner_status: String = store
			.with_conn(|conn| {
				Ok(conn
					.query_row("SELECT status FROM intent_locks WHERE id = 'ib'", [], |r| r.get(0))
					.unwrap())
			})
			.unwrap();
		assert_eq!(winner_status, "committed");
	}

	#[test]
	fn empty_pubkey_always_loses() {
		let candidates = vec![
			IntentLock {
				id: "a".to_string(),
				intent_type: "x".to_string(),
				target: "t".to_string(),
				initiator_pubkey: String::new(),
				timestamp: 0,
				expires_at: 10,
				status: IntentStatus::Pending,
				reason: None,
			},
			IntentLock {
				id: "b".to_string(),
				intent_type: "x".to_string(),
				target: "t".to_string(),
				initiator_pubkey: "02aa".to_string(),
				timestamp: 0,
				expires_at: 10,
				status: IntentStatus::Pending,
				reason: None,
			},
		];
		assert_eq!(winner(&candidates).unwrap().id, "b");
	}

	#[test]
	fn rejects_duplicate_pending_for_same_tuple() {
		let store = test_store();
		announce(&store, "i1", "channel_open", "03cc", "02aa", 0, 60).unwrap();
		let err = announce(&store, "i2", "channel_open", "03cc", "02aa", 1, 60).unwrap_err();
		assert_eq!(err.kind(), Some(HiveErrorKind::ProposalExists));
	}

	#[test]
	fn all_empty_pubkey_group_expires_instead_of_sticking() {
		let store = test_store();
		// Bypass `announce`'s per-tuple dedup (keyed on initiator_pubkey too)
		// to set up two competing rows that both have an empty initiator.
		store
			.with_conn(|conn| {
				for id in ["ia", "ib"] {
					conn.execute(
						"INSERT INTO intent_locks \
						 (id, intent_type, target, initiator_pubkey, timestamp, expires_at, status, reason) \
						 VALUES (?1, 'channel_open', '03cc', '', 0, 60, 'pending', NULL)",
						[id],
					)?;
				}
				Ok(())
			})
			.unwrap();
		let losers = resolve_due(&store, 100).unwrap();
		assert!(losers.is_empty(), "winnerless group has no tiebreak loser to report");
		for id in ["ia", "ib"] {
			let status: String = store
				.with_conn(|conn| {
					Ok(conn.query_row("SELECT status FROM intent_locks WHERE id = ?1", [id], |r| r.get(0)).unwrap())
				})
				.unwrap();
			assert_eq!(status, "expired");
		}
		// Re-running resolve_due must not re-select the now-expired rows.
		assert!(resolve_due(&store, 200).unwrap().is_empty());
	}

	#[test]
	fn remote_intent_cache_evicts_oldest() {
		let cache = RemoteIntentCache::new();
		for i in 0..MAX_REMOTE_INTENTS {
			assert!(cache.touch(&format!("i{i}")).is_none());
		}
		assert_eq!(cache.touch("overflow"), Some("i0".to_string()));
	}
}
