//! Operator escalation queue: `pending_actions` CRUD. Grounded on
//! `membership.rs`'s proposal/vote CRUD style; spec.md §6 ("propose_action,
//! approve_action, reject_action") and §7 ("in advisor mode, any
//! state-changing decision... produces a `pending_actions` row awaiting
//! operator input").

use crate::error::{HiveError, HiveErrorKind, HiveResult};
use crate::store::{PendingActionRow, PendingActionStatus, Store};

/// Queues a state-changing decision for operator review. Returns the
/// decision packet the operator surface renders.
pub fn propose_action(
	store: &Store,
	action_type: &str,
	target: &str,
	context: &str,
	now: i64,
) -> HiveResult<PendingActionRow> {
	store.with_conn(|conn| {
		conn.execute(
			"INSERT INTO pending_actions (action_type, target, context, status, created_at) \
			 VALUES (?1, ?2, ?3, 'pending', ?4)",
			rusqlite::params![action_type, target, context, now],
		)?;
		let id = conn.last_insert_rowid();
		Ok(PendingActionRow {
			id,
			action_type: action_type.to_string(),
			target: target.to_string(),
			context: context.to_string(),
			status: PendingActionStatus::Pending,
			created_at: now,
			decided_at: None,
			reason: None,
		})
	})
}

fn load_action(store: &Store, id: i64) -> HiveResult<Option<PendingActionRow>> {
	store.with_conn(|conn| {
		conn.query_row(
			"SELECT id, action_type, target, context, status, created_at, decided_at, reason \
			 FROM pending_actions WHERE id = ?1",
			[id],
			|row| {
				Ok(PendingActionRow {
					id: row.get(0)?,
					action_type: row.get(1)?,
					target: row.get(2)?,
					context: row.get(3)?,
					status: PendingActionStatus::from_str(&row.get::<_, String>(4)?)
						.unwrap_or(PendingActionStatus::Pending),
					created_at: row.get(5)?,
					decided_at: row.get(6)?,
					reason: row.get(7)?,
				})
			},
		)
		.map(Some)
		.or_else(|e| {
			if matches!(e, rusqlite::Error::QueryReturnedNoRows) {
				Ok(None)
			} else {
				Err(e.into())
			}
		})
	})
}

/// All queued-but-undecided actions, oldest first.
pub fn list_pending(store: &Store) -> HiveResult<Vec<PendingActionRow>> {
	store.with_conn(|conn| {
		let mut stmt = conn.prepare(
			"SELECT id, action_type, target, context, status, created_at, decided_at, reason \
			 FROM pending_actions WHERE status = 'pending' ORDER BY created_at ASC",
		)?;
		let rows = stmt
			.query_map([], |row| {
				Ok(PendingActionRow {
					id: row.get(0)?,
					action_type: row.get(1)?,
					target: row.get(2)?,
					context: row.get(3)?,
					status: PendingActionStatus::from_str(&row.get::<_, String>(4)?)
						.unwrap_or(PendingActionStatus::Pending),
					created_at: row.get(5)?,
					decided_at: row.get(6)?,
					reason: row.get(7)?,
				})
			})?
			.collect::<Result<Vec<_>, _>>()?;
		Ok(rows)
	})
}

fn decide(store: &Store, id: i64, status: PendingActionStatus, reason: Option<&str>, now: i64) -> HiveResult<PendingActionRow> {
	let Some(action) = load_action(store, id)? else {
		return Err(HiveError::new(HiveErrorKind::Governance, format!("no pending action {id}")));
	};
	if action.status != PendingActionStatus::Pending {
		return Err(HiveError::new(HiveErrorKind::Governance, "action already decided"));
	}
	store.with_conn(|conn| {
		conn.execute(
			"UPDATE pending_actions SET status = ?1, decided_at = ?2, reason = ?3 WHERE id = ?4",
			rusqlite::params![status.as_str(), now, reason, id],
		)?;
		Ok(())
	})?;
	Ok(PendingActionRow { status, decided_at: Some(now), reason: reason.map(str::to_string), ..action })
}

/// Operator approval: the queued action is cleared to execute. Execution
/// itself is the caller's responsibility (this module only tracks the
/// decision, per spec.md §7's propagation policy: "only governance-visible
/// outcomes... bubble up").
pub fn approve_action(store: &Store, id: i64, now: i64) -> HiveResult<PendingActionRow> {
	decide(store, id, PendingActionStatus::Approved, None, now)
}

pub fn reject_action(store: &Store, id: i64, reason: Option<&str>, now: i64) -> HiveResult<PendingActionRow> {
	decide(store, id, PendingActionStatus::Rejected, reason, now)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::test_store;

	#[test]
	fn propose_then_approve_transitions_status() {
		let store = test_store();
		let action = propose_action(&store, "ban", "peer1", "{}", 0).unwrap();
		assert_eq!(action.status, PendingActionStatus::Pending);
		let approved = approve_action(&store, action.id, 10).unwrap();
		assert_eq!(approved.status, PendingActionStatus::Approved);
		assert_eq!(approved.decided_at, Some(10));
	}

	#[test]
	fn rejecting_records_reason() {
		let store = test_store();
		let action = propose_action(&store, "channel_open", "peer2", "{}", 0).unwrap();
		let rejected = reject_action(&store, action.id, Some("too risky"), 5).unwrap();
		assert_eq!(rejected.status, PendingActionStatus::Rejected);
		assert_eq!(rejected.reason.as_deref(), Some("too risky"));
	}

	#[test]
	fn deciding_twice_fails() {
		let store = test_store();
		let action = propose_action(&store, "ban", "peer3", "{}", 0).unwrap();
		approve_action(&store, action.id, 1).unwrap();
		let err = approve_action(&store, action.id, 2).unwrap_err();
		assert_eq!(err.kind(), Some(HiveErrorKind::Governance));
	}

	#[test]
	fn list_pending_excludes_decided() {
		let store = test_store();
		let a = propose_action(&store, "ban", "peer4", "{}", 0).unwrap();
		let b = propose_action(&store, "ban", "peer5", "{}", 0).unwrap();
		approve_action(&store, a.id, 1).unwrap();
		let pending = list_pending(&store).unwrap();
		assert_eq!(pending.len(), 1);
		assert_eq!(pending[0].id, b.id);
	}
}
