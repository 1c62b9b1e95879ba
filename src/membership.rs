//! Membership and governance state machine: invite/join, vouch-based
//! promotion, ban proposals and votes, voluntary departure. Grounded on
//! spec.md §4.5; `modules/governance.py`'s doc header informed the
//! escalation shape.

use crate::error::{HiveError, HiveErrorKind, HiveResult};
use crate::protocol::messages::ProposalType;
use crate::store::{BanProposalRow, BanProposalStatus, Member, MemberTier, Store};

pub const PROBATION_SECONDS: i64 = 14 * 24 * 3600;
pub const PROMOTION_UPTIME_THRESHOLD: f64 = 0.9;
pub const PROMOTION_CONTRIBUTION_THRESHOLD: f64 = 0.5;
pub const BAN_PROPOSAL_VOTING_SECONDS: i64 = 7 * 24 * 3600;

/// Inserts a `neophyte` row for a node that just joined via a valid invite
/// ticket and broadcast `ATTEST` (spec.md §4.5 "Outsider -> Neophyte").
pub fn record_join(store: &Store, peer_id: &str, now: i64) -> HiveResult<()> {
	store.with_conn(|conn| {
		conn.execute(
			"INSERT OR IGNORE INTO members \
			 (peer_id, tier, joined_at, promoted_at, contribution_ratio, uptime_pct, \
			  vouch_count, last_seen, addresses, leech_flagged, leech_watch_since) \
			 VALUES (?1, 'neophyte', ?2, NULL, 1.0, 1.0, 0, ?2, NULL, 0, NULL)",
			rusqlite::params![peer_id, now],
		)?;
		Ok(())
	})
}

fn load_member(store: &Store, peer_id: &str) -> HiveResult<Option<Member>> {
	store.with_conn(|conn| {
		conn.query_row(
			"SELECT peer_id, tier, joined_at, promoted_at, contribution_ratio, uptime_pct, \
			 vouch_count, last_seen, addresses, leech_flagged, leech_watch_since FROM members WHERE peer_id = ?1",
			[peer_id],
			|row| {
				Ok(Member {
					peer_id: row.get(0)?,
					tier: MemberTier::from_str(&row.get::<_, String>(1)?)
						.unwrap_or(MemberTier::Neophyte),
					joined_at: row.get(2)?,
					promoted_at: row.get(3)?,
					contribution_ratio: row.get(4)?,
					uptime_pct: row.get(5)?,
					vouch_count: row.get::<_, i64>(6)? as u32,
					last_seen: row.get(7)?,
					addresses: row.get(8)?,
					leech_flagged: row.get::<_, i64>(9)? != 0,
					leech_watch_since: row.get(10)?,
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

/// Eligibility check for a `PROMOTION_REQUEST` target (spec.md §4.5): uptime
/// and contribution thresholds, minimum age since joining, not banned, not
/// leech-flagged.
pub fn is_promotion_eligible(store: &Store, target: &str, now: i64) -> HiveResult<bool> {
	let Some(member) = load_member(store, target)? else {
		return Ok(false);
	};
	if member.tier != MemberTier::Neophyte {
		return Ok(false);
	}
	if now - member.joined_at < PROBATION_SECONDS {
		return Ok(false);
	}
	if member.uptime_pct < PROMOTION_UPTIME_THRESHOLD {
		return Ok(false);
	}
	if member.contribution_ratio < PROMOTION_CONTRIBUTION_THRESHOLD {
		return Ok(false);
	}
	if is_banned(store, target, now)? {
		return Ok(false);
	}
	if member.leech_flagged {
		return Ok(false);
	}
	Ok(true)
}

/// Persists a leech-flag transition (spec.md §4.8). No-op on repeated calls
/// with the same value.
pub fn set_leech_flag(store: &Store, peer_id: &str, flagged: bool) -> HiveResult<()> {
	store.with_conn(|conn| {
		conn.execute(
			"UPDATE members SET leech_flagged = ?1 WHERE peer_id = ?2",
			rusqlite::params![flagged as i64, peer_id],
		)?;
		Ok(())
	})
}

/// Sets (or clears, with `None`) the timestamp since which `peer_id`'s
/// contribution ratio has continuously sat below `LEECH_BAN_RATIO` — the
/// rolling window `evaluate_leech_status` gates the ban flag on.
pub fn set_leech_watch_since(store: &Store, peer_id: &str, since: Option<i64>) -> HiveResult<()> {
	store.with_conn(|conn| {
		conn.execute(
			"UPDATE members SET leech_watch_since = ?1 WHERE peer_id = ?2",
			rusqlite::params![since, peer_id],
		)?;
		Ok(())
	})
}

pub fn is_banned(store: &Store, peer_id: &str, now: i64) -> HiveResult<bool> {
	store.with_conn(|conn| {
		let count: i64 = conn.query_row(
			"SELECT COUNT(*) FROM bans WHERE peer_id = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
			rusqlite::params![peer_id, now],
			|row| row.get(0),
		)?;
		Ok(count > 0)
	})
}

/// Records a signed `VOUCH` for `target`'s open `PROMOTION_REQUEST`.
/// Idempotent: a voucher can only raise the count once.
pub fn record_vouch(store: &Store, target: &str) -> HiveResult<u32> {
	store.with_conn(|conn| {
		conn.execute(
			"UPDATE members SET vouch_count = vouch_count + 1 WHERE peer_id = ?1",
			[target],
		)?;
		let count: i64 =
			conn.query_row("SELECT vouch_count FROM members WHERE peer_id = ?1", [target], |r| {
				r.get(0)
			})?;
		Ok(count as u32)
	})
}

pub fn vouch_quorum_met(vouch_count: u32, member_count: u32, quorum_fraction: f64) -> bool {
	if member_count == 0 {
		return false;
	}
	(vouch_count as f64) / (member_count as f64) >= quorum_fraction
}

/// Applies a `PROMOTION`: idempotent via the caller's idempotency check,
/// transitions the row to `tier=member, promoted_at=now`.
pub fn apply_promotion(store: &Store, target: &str, now: i64) -> HiveResult<()> {
	store.with_conn(|conn| {
		conn.execute(
			"UPDATE members SET tier = 'member', promoted_at = ?1 WHERE peer_id = ?2",
			rusqlite::params![now, target],
		)?;
		Ok(())
	})
}

pub fn member_count(store: &Store) -> HiveResult<u32> {
	store.with_conn(|conn| {
		let n: i64 = conn.query_row("SELECT COUNT(*) FROM members", [], |r| r.get(0))?;
		Ok(n as u32)
	})
}

/// Full member roster, for the operator `members()` surface (spec.md §6)
/// and for `compute_membership_hash`'s `(peer_id, tier)` input.
pub fn list_members(store: &Store) -> HiveResult<Vec<Member>> {
	store.with_conn(|conn| {
		let mut stmt = conn.prepare(
			"SELECT peer_id, tier, joined_at, promoted_at, contribution_ratio, uptime_pct, \
			 vouch_count, last_seen, addresses, leech_flagged, leech_watch_since FROM members ORDER BY peer_id",
		)?;
		let rows = stmt
			.query_map([], |row| {
				Ok(Member {
					peer_id: row.get(0)?,
					tier: MemberTier::from_str(&row.get::<_, String>(1)?)
						.unwrap_or(MemberTier::Neophyte),
					joined_at: row.get(2)?,
					promoted_at: row.get(3)?,
					contribution_ratio: row.get(4)?,
					uptime_pct: row.get(5)?,
					vouch_count: row.get::<_, i64>(6)? as u32,
					last_seen: row.get(7)?,
					addresses: row.get(8)?,
					leech_flagged: row.get::<_, i64>(9)? != 0,
					leech_watch_since: row.get(10)?,
				})
			})?
			.collect::<Result<Vec<_>, _>>()?;
		Ok(rows)
	})
}

/// Opens a new `ban_proposals` row. Rejects if one already exists for
/// `target` in `pending` status (spec §7 `ProposalExists`, a state
/// conflict — idempotent no-op on the receiver path).
pub fn open_ban_proposal(
	store: &Store,
	proposal_id: &str,
	target: &str,
	proposer: &str,
	reason: &str,
	proposal_type: ProposalType,
	proposed_at: i64,
	expires_at: i64,
) -> HiveResult<()> {
	store.with_conn(|conn| {
		let existing: i64 = conn.query_row(
			"SELECT COUNT(*) FROM ban_proposals WHERE target = ?1 AND status = 'pending'",
			[target],
			|r| r.get(0),
		)?;
		if existing > 0 {
			return Err(HiveError::new(HiveErrorKind::ProposalExists, target));
		}
		let type_str = match proposal_type {
			ProposalType::Standard => "standard",
			ProposalType::SettlementGaming => "settlement_gaming",
		};
		conn.execute(
			"INSERT OR IGNORE INTO ban_proposals \
			 (proposal_id, target, proposer, reason, proposed_at, expires_at, status, proposal_type) \
			 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)",
			rusqlite::params![proposal_id, target, proposer, reason, proposed_at, expires_at, type_str],
		)?;
		Ok(())
	})
}

/// Records a ban vote. One vote per `(proposal_id, voter)`, enforced by
/// primary key.
pub fn record_ban_vote(
	store: &Store,
	proposal_id: &str,
	voter: &str,
	approve: bool,
	now: i64,
	signature: &str,
) -> HiveResult<()> {
	let vote = if approve { "approve" } else { "reject" };
	store.with_conn(|conn| {
		conn.execute(
			"INSERT OR IGNORE INTO ban_votes (proposal_id, voter, vote, voted_at, signature) \
			 VALUES (?1, ?2, ?3, ?4, ?5)",
			rusqlite::params![proposal_id, voter, vote, now, signature],
		)?;
		Ok(())
	})
}

fn load_ban_proposal(store: &Store, proposal_id: &str) -> HiveResult<Option<BanProposalRow>> {
	store.with_conn(|conn| {
		conn.query_row(
			"SELECT proposal_id, target, proposer, reason, proposed_at, expires_at, status, \
			 proposal_type FROM ban_proposals WHERE proposal_id = ?1",
			[proposal_id],
			|row| {
				Ok(BanProposalRow {
					proposal_id: row.get(0)?,
					target: row.get(1)?,
					proposer: row.get(2)?,
					reason: row.get(3)?,
					proposed_at: row.get(4)?,
					expires_at: row.get(5)?,
					status: BanProposalStatus::from_str(&row.get::<_, String>(6)?)
						.unwrap_or(BanProposalStatus::Pending),
					proposal_type: row.get(7)?,
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

/// The target of a proposal, for callers (the coordinator) that need it to
/// invoke `apply_ban` after `evaluate_ban_quorum` passes.
pub fn ban_proposal_target(store: &Store, proposal_id: &str) -> HiveResult<Option<String>> {
	Ok(load_ban_proposal(store, proposal_id)?.map(|p| p.target))
}

/// Quorum evaluation per spec.md §4.5 / §9:
/// - `standard`: `approve_count / member_count >= 0.51` before `expires_at`.
/// - `settlement_gaming`: the inverted-voting variant — non-votes count as
///   `approve` once `expires_at` has passed; an active `reject` vote is
///   what blocks.
pub fn evaluate_ban_quorum(
	store: &Store,
	proposal_id: &str,
	member_count: u32,
	quorum_fraction: f64,
	now: i64,
) -> HiveResult<bool> {
	let Some(proposal) = load_ban_proposal(store, proposal_id)? else {
		return Ok(false);
	};
	if proposal.status != BanProposalStatus::Pending {
		return Ok(false);
	}
	let (approve_count, reject_count): (i64, i64) = store.with_conn(|conn| {
		let approve = conn.query_row(
			"SELECT COUNT(*) FROM ban_votes WHERE proposal_id = ?1 AND vote = 'approve'",
			[proposal_id],
			|r| r.get(0),
		)?;
		let reject = conn.query_row(
			"SELECT COUNT(*) FROM ban_votes WHERE proposal_id = ?1 AND vote = 'reject'",
			[proposal_id],
			|r| r.get(0),
		)?;
		Ok((approve, reject))
	})?;

	if proposal.proposal_type == "settlement_gaming" {
		if now < proposal.expires_at {
			return Ok(false);
		}
		let non_rejectors = member_count as i64 - reject_count;
		Ok(member_count > 0 && (non_rejectors as f64) / (member_count as f64) >= quorum_fraction)
	} else {
		if now >= proposal.expires_at {
			return Ok(false);
		}
		Ok(member_count > 0 && (approve_count as f64) / (member_count as f64) >= quorum_fraction)
	}
}

/// Applies a passed ban proposal: inserts the `Ban` row, clears pending
/// intents targeting the banned peer, and aborts any in-flight settlement
/// proposal or sub-payment involving the banned peer (spec.md §4.5).
pub fn apply_ban(
	store: &Store,
	proposal_id: &str,
	target: &str,
	reason: &str,
	reporter: &str,
	now: i64,
) -> HiveResult<()> {
	store.transaction(|tx| {
		tx.execute(
			"UPDATE ban_proposals SET status = 'passed' WHERE proposal_id = ?1",
			[proposal_id],
		)?;
		tx.execute(
			"INSERT OR IGNORE INTO bans (peer_id, reason, reporter, signature, banned_at, expires_at) \
			 VALUES (?1, ?2, ?3, NULL, ?4, NULL)",
			rusqlite::params![target, reason, reporter, now],
		)?;
		tx.execute(
			"UPDATE intent_locks SET status = 'aborted', reason = 'peer_banned' \
			 WHERE status = 'pending' AND (target = ?1 OR initiator_pubkey = ?1)",
			[target],
		)?;
		tx.execute(
			"UPDATE settlement_proposals SET status = 'aborted' \
			 WHERE status IN ('pending', 'ready') \
			 AND (proposer = ?1 OR proposal_id IN ( \
			   SELECT proposal_id FROM settlement_sub_payments WHERE from_peer = ?1 OR to_peer = ?1 \
			 ))",
			[target],
		)?;
		tx.execute(
			"UPDATE settlement_sub_payments SET status = 'aborted' \
			 WHERE status != 'paid' AND (from_peer = ?1 OR to_peer = ?1)",
			[target],
		)?;
		Ok(())
	})
}

/// Voluntary departure: deletes the member row and associated caches
/// (spec.md §4.5).
pub fn apply_departure(store: &Store, peer_id: &str) -> HiveResult<()> {
	store.transaction(|tx| {
		tx.execute("DELETE FROM members WHERE peer_id = ?1", [peer_id])?;
		tx.execute("DELETE FROM peer_state WHERE peer_id = ?1", [peer_id])?;
		Ok(())
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::test_store;

	#[test]
	fn standard_quorum_passes_at_threshold() {
		let store = test_store();
		open_ban_proposal(
			&store,
			"p1",
			"target",
			"proposer",
			"misbehavior",
			ProposalType::Standard,
			0,
			1000,
		)
		.unwrap();
		record_ban_vote(&store, "p1", "v1", true, 1, "sig").unwrap();
		record_ban_vote(&store, "p1", "v2", true, 1, "sig").unwrap();
		assert!(evaluate_ban_quorum(&store, "p1", 3, 0.51, 2).unwrap());
	}

	#[test]
	fn standard_quorum_fails_after_expiry() {
		let store = test_store();
		open_ban_proposal(
			&store,
			"p1",
			"target",
			"proposer",
			"misbehavior",
			ProposalType::Standard,
			0,
			100,
		)
		.unwrap();
		record_ban_vote(&store, "p1", "v1", true, 1, "sig").unwrap();
		record_ban_vote(&store, "p1", "v2", true, 1, "sig").unwrap();
		assert!(!evaluate_ban_quorum(&store, "p1", 3, 0.51, 200).unwrap());
	}

	#[test]
	fn settlement_gaming_counts_nonvotes_as_approve_after_expiry() {
		let store = test_store();
		open_ban_proposal(
			&store,
			"p1",
			"target",
			"proposer",
			"gaming",
			ProposalType::SettlementGaming,
			0,
			100,
		)
		.unwrap();
		// Before expiry: never passes regardless of votes.
		assert!(!evaluate_ban_quorum(&store, "p1", 3, 0.51, 50).unwrap());
		// After expiry with no rejects: passes (non-votes count as approve).
		assert!(evaluate_ban_quorum(&store, "p1", 3, 0.51, 200).unwrap());
	}

	#[test]
	fn settlement_gaming_blocked_by_active_rejects() {
		let store = test_store();
		open_ban_proposal(
			&store,
			"p1",
			"target",
			"proposer",
			"gaming",
			ProposalType::SettlementGaming,
			0,
			100,
		)
		.unwrap();
		record_ban_vote(&store, "p1", "v1", false, 1, "sig").unwrap();
		record_ban_vote(&store, "p1", "v2", false, 1, "sig").unwrap();
		assert!(!evaluate_ban_quorum(&store, "p1", 3, 0.51, 200).unwrap());
	}

	#[test]
	fn open_ban_proposal_rejects_duplicate_pending() {
		let store = test_store();
		open_ban_proposal(&store, "p1", "target", "a", "r", ProposalType::Standard, 0, 100).unwrap();
		let err =
			open_ban_proposal(&store, "p2", "target", "b", "r", ProposalType::Standard, 0, 100)
				.unwrap_err();
		assert_eq!(err.kind(), Some(HiveErrorKind::ProposalExists));
	}

	#[test]
	fn apply_ban_aborts_in_flight_settlement_sessions_for_target() {
		let store = test_store();
		let target = "target-peer";
		store
			.with_conn(|conn| {
				conn.execute(
					"INSERT INTO settlement_proposals \
					 (proposal_id, period, proposer, proposed_at, expires_at, status, data_hash, \
					  plan_hash, total_fees_sats, member_count, last_broadcast_at, contributions_json) \
					 VALUES ('prop-by-target', '2026-W10', ?1, 0, 1000, 'pending', 'hash', NULL, 0, 2, NULL, NULL)",
					[target],
				)?;
				conn.execute(
					"INSERT INTO settlement_proposals \
					 (proposal_id, period, proposer, proposed_at, expires_at, status, data_hash, \
					  plan_hash, total_fees_sats, member_count, last_broadcast_at, contributions_json) \
					 VALUES ('prop-with-leg', '2026-W10', 'other-proposer', 0, 1000, 'ready', 'hash', NULL, 0, 2, NULL, NULL)",
					[],
				)?;
				conn.execute(
					"INSERT INTO settlement_sub_payments \
					 (proposal_id, from_peer, to_peer, amount_sats, status, payment_hash, updated_at) \
					 VALUES ('prop-with-leg', ?1, 'creditor', 500, 'pending', NULL, 0)",
					[target],
				)?;
				Ok(())
			})
			.unwrap();

		apply_ban(&store, "ban-1", target, "misbehavior", "reporter", 2000).unwrap();

		let statuses: Vec<(String, String)> = store
			.with_conn(|conn| {
				let mut stmt = conn.prepare(
					"SELECT proposal_id, status FROM settlement_proposals ORDER BY proposal_id",
				)?;
				let rows = stmt
					.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
					.collect::<Result<Vec<_>, _>>()?;
				Ok(rows)
			})
			.unwrap();
		assert_eq!(
			statuses,
			vec![("prop-by-target".to_string(), "aborted".to_string()), ("prop-with-leg".to_string(), "aborted".to_string())]
		);

		let sub_payment_status: String = store
			.with_conn(|conn| {
				conn.query_row(
					"SELECT status FROM settlement_sub_payments WHERE proposal_id = 'prop-with-leg'",
					[],
					|r| r.get(0),
				)
			})
			.unwrap();
		assert_eq!(sub_payment_status, "aborted");
	}
}
