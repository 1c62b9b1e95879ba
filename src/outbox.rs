//! Per-peer reliable delivery: enqueue with backpressure, retry with
//! exponential backoff and jitter, explicit and implicit ACKs, expiry and
//! cleanup. Grounded on `modules/outbox.py`'s `OutboxManager`.

use rand::Rng;

use crate::error::HiveResult;
use crate::host::{NodeHost, SendOutcome};
use crate::protocol::messages::HiveMessageType;
use crate::store::{OutboxEntry, OutboxStatus, Store};

pub const BASE_RETRY_SECONDS: i64 = 30;
pub const MAX_RETRY_SECONDS: i64 = 3600;
pub const MAX_RETRIES: u32 = 20;
pub const TTL_SECONDS: i64 = 24 * 3600;
pub const MAX_INFLIGHT_PER_PEER: u32 = 10;
const TERMINAL_ROW_MAX_AGE_SECONDS: i64 = 7 * 24 * 3600;

fn next_retry_at(now: i64, retry_count: u32) -> i64 {
	let backoff = BASE_RETRY_SECONDS.saturating_mul(1i64 << retry_count.min(20));
	let capped = backoff.min(MAX_RETRY_SECONDS);
	let jitter = rand::thread_rng().gen_range(0..=(capped / 4).max(1));
	now + capped + jitter
}

/// Enqueues one row per target peer (excluding `our_pubkey`). A peer whose
/// non-terminal row count is already at `MAX_INFLIGHT_PER_PEER` is skipped
/// and logged, per spec.md §4.3.
pub fn enqueue(
	store: &Store,
	our_pubkey: &str,
	msg_id: &str,
	msg_type: HiveMessageType,
	payload_json: &str,
	peer_ids: &[String],
	now: i64,
) -> HiveResult<Vec<String>> {
	let mut dropped = Vec::new();
	for peer_id in peer_ids {
		if peer_id == our_pubkey {
			continue;
		}
		let inflight: u32 = store.with_conn(|conn| {
			let count: i64 = conn.query_row(
				"SELECT COUNT(*) FROM outbox_entries WHERE peer_id = ?1 \
				 AND status IN ('queued', 'sent')",
				[peer_id],
				|row| row.get(0),
			)?;
			Ok(count as u32)
		})?;
		if inflight >= MAX_INFLIGHT_PER_PEER {
			log::warn!("outbox: dropping enqueue for {peer_id}, at MAX_INFLIGHT_PER_PEER");
			dropped.push(peer_id.clone());
			continue;
		}
		store.with_conn(|conn| {
			conn.execute(
				"INSERT OR IGNORE INTO outbox_entries \
				 (msg_id, peer_id, msg_type, payload_json, status, created_at, next_retry_at, \
				  retry_count, expires_at, last_error) \
				 VALUES (?1, ?2, ?3, ?4, 'queued', ?5, ?5, 0, ?6, NULL)",
				rusqlite::params![
					msg_id,
					peer_id,
					msg_type.name(),
					payload_json,
					now,
					now + TTL_SECONDS
				],
			)?;
			Ok(())
		})?;
	}
	Ok(dropped)
}

fn row_from(row: &rusqlite::Row) -> rusqlite::Result<OutboxEntry> {
	let status: String = row.get(4)?;
	Ok(OutboxEntry {
		msg_id: row.get(0)?,
		peer_id: row.get(1)?,
		msg_type: row.get(2)?,
		payload_json: row.get(3)?,
		status: OutboxStatus::from_str(&status).unwrap_or(OutboxStatus::Failed),
		created_at: row.get(5)?,
		next_retry_at: row.get(6)?,
		retry_count: row.get::<_, i64>(7)? as u32,
		expires_at: row.get(8)?,
		last_error: row.get(9)?,
	})
}

/// Selects due rows (`status in {queued, sent}`, `next_retry_at <= now`,
/// `expires_at > now`) and attempts to send each via the host. Mirrors
/// spec.md §4.3's retry loop exactly, including the deliberate asymmetry:
/// `retry_count` only advances on a successful handoff to transport, never
/// on a failed send (an unsent message must not consume retry budget).
pub async fn retry_due(
	store: &Store,
	host: &dyn NodeHost,
	now: i64,
	batch_limit: usize,
) -> HiveResult<usize> {
	let due = store.with_conn(|conn| {
		let mut stmt = conn.prepare(
			"SELECT msg_id, peer_id, msg_type, payload_json, status, created_at, next_retry_at, \
			 retry_count, expires_at, last_error FROM outbox_entries \
			 WHERE status IN ('queued', 'sent') AND next_retry_at <= ?1 AND expires_at > ?1 \
			 LIMIT ?2",
		)?;
		let rows = stmt
			.query_map(rusqlite::params![now, batch_limit as i64], row_from)?
			.collect::<Result<Vec<_>, _>>()?;
		Ok(rows)
	})?;

	let mut attempted = 0usize;
	for entry in due {
		if entry.retry_count >= MAX_RETRIES {
			mark_failed(store, &entry.msg_id, &entry.peer_id, "max retries exceeded")?;
			continue;
		}
		attempted += 1;
		let bytes = entry.payload_json.clone().into_bytes();
		match host.send_custom_message(&entry.peer_id, bytes).await {
			Ok(SendOutcome::Sent) => {
				let new_retry_count = entry.retry_count + 1;
				let scheduled = next_retry_at(now, new_retry_count);
				store.with_conn(|conn| {
					conn.execute(
						"UPDATE outbox_entries SET status = 'sent', retry_count = ?1, \
						 next_retry_at = ?2 WHERE msg_id = ?3 AND peer_id = ?4",
						rusqlite::params![new_retry_count, scheduled, entry.msg_id, entry.peer_id],
					)?;
					Ok(())
				})?;
			}
			Ok(SendOutcome::PeerUnreachable) => {
				let scheduled = next_retry_at(now, entry.retry_count);
				store.with_conn(|conn| {
					conn.execute(
						"UPDATE outbox_entries SET next_retry_at = ?1, \
						 last_error = 'peer unreachable' WHERE msg_id = ?2 AND peer_id = ?3",
						rusqlite::params![scheduled, entry.msg_id, entry.peer_id],
					)?;
					Ok(())
				})?;
			}
			Err(e) => {
				log::warn!("outbox: send to {} failed: {e}", entry.peer_id);
				mark_failed(store, &entry.msg_id, &entry.peer_id, &e.to_string())?;
			}
		}
	}
	Ok(attempted)
}

fn mark_failed(store: &Store, msg_id: &str, peer_id: &str, reason: &str) -> HiveResult<()> {
	store.with_conn(|conn| {
		conn.execute(
			"UPDATE outbox_entries SET status = 'failed', last_error = ?1 \
			 WHERE msg_id = ?2 AND peer_id = ?3",
			rusqlite::params![reason, msg_id, peer_id],
		)?;
		Ok(())
	})
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
	Ok,
	Invalid,
	RetryLater,
}

/// Handles an explicit `MSG_ACK`.
pub fn process_ack(
	store: &Store,
	peer_id: &str,
	ack_msg_id: &str,
	status: AckStatus,
) -> HiveResult<()> {
	let new_status = match status {
		AckStatus::Ok => Some("acked"),
		AckStatus::Invalid => Some("failed"),
		AckStatus::RetryLater => None,
	};
	if let Some(new_status) = new_status {
		store.with_conn(|conn| {
			conn.execute(
				"UPDATE outbox_entries SET status = ?1 WHERE msg_id = ?2 AND peer_id = ?3",
				rusqlite::params![new_status, ack_msg_id, peer_id],
			)?;
			Ok(())
		})?;
	}
	Ok(())
}

/// Bulk-acks all non-terminal outbox rows of `request_type` addressed to
/// `peer_id` whose `match_field` in the stored payload equals the incoming
/// response's value for that field — spec.md §4.3's `IMPLICIT_ACK_MAP`.
pub fn process_implicit_ack(
	store: &Store,
	peer_id: &str,
	response: &crate::protocol::Frame,
) -> HiveResult<usize> {
	let Some((request_type, match_field)) =
		crate::protocol::messages::implicit_ack_target(response.msg_type)
	else {
		return Ok(0);
	};
	let Some(match_value) = response.payload.get(match_field).and_then(|v| v.as_str()) else {
		return Ok(0);
	};
	store.with_conn(|conn| {
		let mut stmt = conn.prepare(
			"SELECT msg_id, payload_json FROM outbox_entries \
			 WHERE peer_id = ?1 AND msg_type = ?2 AND status IN ('queued', 'sent')",
		)?;
		let candidates: Vec<(String, String)> = stmt
			.query_map(rusqlite::params![peer_id, request_type.name()], |row| {
				Ok((row.get(0)?, row.get(1)?))
			})?
			.collect::<Result<Vec<_>, _>>()?;
		let mut acked = 0usize;
		for (msg_id, payload_json) in candidates {
			let value: serde_json::Value = match serde_json::from_str(&payload_json) {
				Ok(v) => v,
				Err(_) => continue,
			};
			if value.get(match_field).and_then(|v| v.as_str()) == Some(match_value) {
				conn.execute(
					"UPDATE outbox_entries SET status = 'acked' WHERE msg_id = ?1 AND peer_id = ?2",
					rusqlite::params![msg_id, peer_id],
				)?;
				acked += 1;
			}
		}
		Ok(acked)
	})
}

/// Marks rows past their `expires_at` as `expired`, then deletes terminal
/// rows older than 7 days.
pub fn expire_and_cleanup(store: &Store, now: i64) -> HiveResult<(usize, usize)> {
	store.with_conn(|conn| {
		let expired = conn.execute(
			"UPDATE outbox_entries SET status = 'expired' \
			 WHERE status IN ('queued', 'sent') AND expires_at <= ?1",
			[now],
		)?;
		let cutoff = now - TERMINAL_ROW_MAX_AGE_SECONDS;
		let deleted = conn.execute(
			"DELETE FROM outbox_entries WHERE status IN ('acked', 'failed', 'expired') \
			 AND created_at < ?1",
			[cutoff],
		)?;
		Ok((expired, deleted))
	})
}

/// Count of non-terminal outbox rows, surfaced read-only on the operator
/// API (SPEC_FULL.md §11, "Outbox stats").
pub fn pending_count(store: &Store) -> HiveResult<i64> {
	store.with_conn(|conn| {
		let n: i64 = conn.query_row(
			"SELECT COUNT(*) FROM outbox_entries WHERE status IN ('queued', 'sent')",
			[],
			|row| row.get(0),
		)?;
		Ok(n)
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::host::TestSigner;
	use crate::store::test_store;

	fn peers(n: usize) -> Vec<String> {
		(0..n).map(|i| format!("peer-{i}")).collect()
	}

	#[test]
	fn enqueue_respects_inflight_cap() {
		let store = test_store();
		let target = vec!["peer-x".to_string()];
        let mut total_dropped = 0;
		for i in 0..15 {
			let dropped =
				enqueue(&store, "me", &format!("m{i}"), HiveMessageType::Gossip, "{}", &target, 0)
					.unwrap();
			total_dropped += dropped.len();
		}
		assert_eq!(total_dropped, 5);
		let count: i64 = store
			.with_conn(|conn| {
				Ok(conn
					.query_row("SELECT COUNT(*) FROM outbox_entries", [], |r| r.get(0))
					.unwrap())
			})
			.unwrap();
		assert_eq!(count, 10);
	}

	#[test]
	fn enqueue_skips_self() {
		let store = test_store();
		enqueue(
			&store,
			"me",
			"m1",
			HiveMessageType::Gossip,
			"{}",
			&["me".to_string()],
			0,
		)
		.unwrap();
		let count: i64 = store
			.with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM outbox_entries", [], |r| r.get(0)).unwrap()))
			.unwrap();
		assert_eq!(count, 0);
	}

	#[tokio::test]
	async fn retry_due_increments_retry_count_only_on_success() {
		let store = test_store();
		enqueue(&store, "me", "m1", HiveMessageType::Gossip, "{}", &peers(1), 0).unwrap();
		let host = TestSigner::new("me");
		retry_due(&store, &host, 100, 10).await.unwrap();
		let (status, retry_count) = store
			.with_conn(|conn| {
				Ok(conn
					.query_row(
						"SELECT status, retry_count FROM outbox_entries WHERE msg_id = 'm1'",
						[],
						|r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)),
					)
					.unwrap())
			})
			.unwrap();
		assert_eq!(status, "sent");
		assert_eq!(retry_count, 1);
	}

	#[test]
	fn process_ack_ok_marks_acked() {
		let store = test_store();
		enqueue(&store, "me", "m1", HiveMessageType::Gossip, "{}", &peers(1), 0).unwrap();
		process_ack(&store, "peer-0", "m1", AckStatus::Ok).unwrap();
		let status: String = store
			.with_conn(|conn| {
				Ok(conn
					.query_row("SELECT status FROM outbox_entries WHERE msg_id = 'm1'", [], |r| {
						r.get(0)
					})
					.unwrap())
			})
			.unwrap();
		assert_eq!(status, "acked");
	}
}
