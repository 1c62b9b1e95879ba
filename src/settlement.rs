//! Weekly settlement: fee-report collection, canonical-hash proposals,
//! quorum voting, idempotent execution, double-settlement prevention.
//! Grounded on `modules/settlement.py`'s `SettlementManager` for shape (the
//! fair-share weights and payment-matching algorithm are spec.md
//! §4.9/§8-scenario-4's, not the source's older 40/40/20 BOLT12 scheme).

use bitcoin_hashes::{sha256, Hash};
use chrono::{Datelike, TimeZone, Utc};
use serde_json::{json, Value};

use crate::config::SettlementWeights;
use crate::error::{HiveError, HiveErrorKind, HiveResult};
use crate::protocol::signing::canonical_contributions;
use crate::store::{FeeReportRow, SettlementProposalRow, SettlementStatus, Store};

pub const REBROADCAST_INTERVAL_SECONDS: i64 = 6 * 3600;
pub const SETTLEMENT_GAMING_GRACE_SECONDS: i64 = 24 * 3600;

/// ISO-week key `YYYY-WNN` for the week containing `unix_seconds`.
pub fn period_for(unix_seconds: i64) -> String {
	let dt = Utc.timestamp_opt(unix_seconds, 0).single().expect("valid unix timestamp");
	let iso = dt.iso_week();
	format!("{}-W{:02}", iso.year(), iso.week())
}

/// `(period_start, period_end)` for an ISO-week key — Monday 00:00 UTC
/// through the following Monday.
pub fn period_bounds(period: &str) -> Option<(i64, i64)> {
	let (year_str, week_str) = period.split_once("-W")?;
	let year: i32 = year_str.parse().ok()?;
	let week: u32 = week_str.parse().ok()?;
	let monday = chrono::NaiveDate::from_isoywd_opt(year, week, chrono::Weekday::Mon)?;
	let start = monday.and_hms_opt(0, 0, 0)?.and_utc().timestamp();
	Some((start, start + 7 * 86_400))
}

pub fn upsert_fee_report(store: &Store, report: &FeeReportRow) -> HiveResult<()> {
	store.with_conn(|conn| {
		conn.execute(
			"INSERT INTO fee_reports \
			 (peer_id, period, fees_earned_sats, forward_count, rebalance_costs_sats, \
			  period_start, period_end, received_at) \
			 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
			 ON CONFLICT(peer_id, period) DO UPDATE SET \
			   fees_earned_sats = excluded.fees_earned_sats, \
			   forward_count = excluded.forward_count, \
			   rebalance_costs_sats = excluded.rebalance_costs_sats, \
			   received_at = excluded.received_at",
			rusqlite::params![
				report.peer_id,
				report.period,
				report.fees_earned_sats as i64,
				report.forward_count as i64,
				report.rebalance_costs_sats as i64,
				report.period_start,
				report.period_end,
				report.received_at,
			],
		)?;
		Ok(())
	})
}

pub fn fee_reports_for_period(store: &Store, period: &str) -> HiveResult<Vec<FeeReportRow>> {
	store.with_conn(|conn| {
		let mut stmt = conn.prepare(
			"SELECT peer_id, period, fees_earned_sats, forward_count, rebalance_costs_sats, \
			 period_start, period_end, received_at FROM fee_reports WHERE period = ?1 \
			 ORDER BY peer_id",
		)?;
		let rows = stmt
			.query_map([period], |row| {
				Ok(FeeReportRow {
					peer_id: row.get(0)?,
					period: row.get(1)?,
					fees_earned_sats: row.get::<_, i64>(2)? as u64,
					forward_count: row.get::<_, i64>(3)? as u64,
					rebalance_costs_sats: row.get::<_, i64>(4)? as u64,
					period_start: row.get(5)?,
					period_end: row.get(6)?,
					received_at: row.get(7)?,
				})
			})?
			.collect::<Result<Vec<_>, _>>()?;
		Ok(rows)
	})
}

/// Deterministic proposer election: lowest `peer_id` among members with a
/// fee report for the period (spec.md §4.9 step 2).
pub fn elect_proposer(reports: &[FeeReportRow]) -> Option<&str> {
	reports.iter().map(|r| r.peer_id.as_str()).min()
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemberContribution {
	pub peer_id: String,
	pub fees_earned_sats: u64,
	pub forward_count: u64,
	pub capacity_sats: u64,
	pub uptime_pct: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FairShareResult {
	pub peer_id: String,
	pub fair_share_sats: i64,
	pub balance_sats: i64,
}

/// Fair-share calculation per spec.md §4.9/§8 scenario 4: capacity,
/// forwards, and uptime are each normalized across members, weighted, and
/// multiplied by `total_fees`. Residual rounding dust is attributed to the
/// largest positive balance so balances sum to exactly zero.
pub fn compute_fair_shares(
	contributions: &[MemberContribution],
	weights: SettlementWeights,
) -> Vec<FairShareResult> {
	if contributions.is_empty() {
		return Vec::new();
	}
	let total_fees: u64 = contributions.iter().map(|c| c.fees_earned_sats).sum();
	let total_capacity: u64 = contributions.iter().map(|c| c.capacity_sats).sum();
	let total_forwards: u64 = contributions.iter().map(|c| c.forward_count).sum();
	let total_uptime: f64 = contributions.iter().map(|c| c.uptime_pct).sum();
	let n = contributions.len() as f64;

	let mut raw_shares: Vec<f64> = contributions
		.iter()
		.map(|c| {
			let capacity_share = if total_capacity > 0 {
				c.capacity_sats as f64 / total_capacity as f64
			} else {
				1.0 / n
			};
			let forwards_share = if total_forwards > 0 {
				c.forward_count as f64 / total_forwards as f64
			} else {
				1.0 / n
			};
			let uptime_share = if total_uptime > 0.0 { c.uptime_pct / total_uptime } else { 1.0 / n };
			let weighted = weights.capacity * capacity_share
				+ weights.forwards * forwards_share
				+ weights.uptime * uptime_share;
			weighted * total_fees as f64
		})
		.collect();

	let rounded: Vec<i64> = raw_shares.iter().map(|s| s.round() as i64).collect();
	let dust = total_fees as i64 - rounded.iter().sum::<i64>();
	let mut rounded = rounded;
	if dust != 0 {
		if let Some((idx, _)) =
			rounded.iter().enumerate().max_by_key(|(_, v)| **v)
		{
			rounded[idx] += dust;
		}
	}
	raw_shares.clear();

	contributions
		.iter()
		.zip(rounded)
		.map(|(c, fair_share_sats)| FairShareResult {
			peer_id: c.peer_id.clone(),
			fair_share_sats,
			balance_sats: fair_share_sats - c.fees_earned_sats as i64,
		})
		.collect()
}

fn contribution_values(contributions: &[MemberContribution]) -> Vec<Value> {
	contributions
		.iter()
		.map(|c| {
			json!({
				"peer_id": c.peer_id,
				"fees_earned_sats": c.fees_earned_sats,
				"forward_count": c.forward_count,
				"capacity_sats": c.capacity_sats,
				"uptime_pct": c.uptime_pct,
			})
		})
		.collect()
}

/// `SHA256(canonical(contributions))`, sorted by `peer_id`.
pub fn compute_data_hash(contributions: &[MemberContribution]) -> String {
	let canonical = canonical_contributions(contribution_values(contributions));
	sha256::Hash::hash(canonical.as_bytes()).to_string()
}

/// The `contributions_json` a proposer broadcasts alongside `data_hash`,
/// sorted by `peer_id` the same way the hash is computed over.
pub fn contributions_to_json(contributions: &[MemberContribution]) -> Value {
	let mut values = contribution_values(contributions);
	values.sort_by(|a, b| {
		let ka = a.get("peer_id").and_then(Value::as_str).unwrap_or("");
		let kb = b.get("peer_id").and_then(Value::as_str).unwrap_or("");
		ka.cmp(kb)
	});
	Value::Array(values)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentLeg {
	pub from_peer: String,
	pub to_peer: String,
	pub amount_sats: i64,
}

/// Greedy payment matching: largest debtor pays largest creditor until both
/// are settled, standard min-transfer-count algorithm.
pub fn build_payment_plan(shares: &[FairShareResult]) -> Vec<PaymentLeg> {
	let mut debtors: Vec<(String, i64)> = shares
		.iter()
		.filter(|s| s.balance_sats < 0)
		.map(|s| (s.peer_id.clone(), -s.balance_sats))
		.collect();
	let mut creditors: Vec<(String, i64)> = shares
		.iter()
		.filter(|s| s.balance_sats > 0)
		.map(|s| (s.peer_id.clone(), s.balance_sats))
		.collect();
	debtors.sort_by(|a, b| b.1.cmp(&a.1));
	creditors.sort_by(|a, b| b.1.cmp(&a.1));

	let mut plan = Vec::new();
	let (mut i, mut j) = (0usize, 0usize);
	while i < debtors.len() && j < creditors.len() {
		let amount = debtors[i].1.min(creditors[j].1);
		if amount > 0 {
			plan.push(PaymentLeg {
				from_peer: debtors[i].0.clone(),
				to_peer: creditors[j].0.clone(),
				amount_sats: amount,
			});
		}
		debtors[i].1 -= amount;
		creditors[j].1 -= amount;
		if debtors[i].1 == 0 {
			i += 1;
		}
		if creditors[j].1 == 0 {
			j += 1;
		}
	}
	plan
}

pub fn compute_plan_hash(plan: &[PaymentLeg]) -> String {
	let mut sorted = plan.to_vec();
	sorted.sort_by(|a, b| (a.from_peer.as_str(), a.to_peer.as_str()).cmp(&(b.from_peer.as_str(), b.to_peer.as_str())));
	let values: Vec<_> = sorted
		.iter()
		.map(|leg| json!({"from": leg.from_peer, "to": leg.to_peer, "amount_sats": leg.amount_sats}))
		.collect();
	let canonical = serde_json::Value::Array(values).to_string();
	sha256::Hash::hash(canonical.as_bytes()).to_string()
}

pub fn is_period_settled(store: &Store, period: &str) -> HiveResult<bool> {
	store.with_conn(|conn| {
		let n: i64 =
			conn.query_row("SELECT COUNT(*) FROM settled_periods WHERE period = ?1", [period], |r| {
				r.get(0)
			})?;
		Ok(n > 0)
	})
}

pub fn create_proposal(
	store: &Store,
	proposal_id: &str,
	period: &str,
	proposer: &str,
	data_hash: &str,
	plan_hash: Option<&str>,
	total_fees_sats: u64,
	member_count: u32,
	contributions_json: &str,
	proposed_at: i64,
	expires_at: i64,
) -> HiveResult<()> {
	if is_period_settled(store, period)? {
		return Err(HiveError::new(HiveErrorKind::AlreadySettled, period));
	}
	store.with_conn(|conn| {
		conn.execute(
			"INSERT OR IGNORE INTO settlement_proposals \
			 (proposal_id, period, proposer, proposed_at, expires_at, status, data_hash, plan_hash, \
			  total_fees_sats, member_count, last_broadcast_at, contributions_json) \
			 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?8, ?9, ?4, ?10)",
			rusqlite::params![
				proposal_id,
				period,
				proposer,
				proposed_at,
				expires_at,
				data_hash,
				plan_hash,
				total_fees_sats as i64,
				member_count,
				contributions_json,
			],
		)?;
		Ok(())
	})
}

pub fn load_proposal(store: &Store, proposal_id: &str) -> HiveResult<Option<SettlementProposalRow>> {
	store.with_conn(|conn| {
		conn.query_row(
			"SELECT proposal_id, period, proposer, proposed_at, expires_at, status, data_hash, \
			 plan_hash, total_fees_sats, member_count, last_broadcast_at, contributions_json \
			 FROM settlement_proposals WHERE proposal_id = ?1",
			[proposal_id],
			|row| {
				Ok(SettlementProposalRow {
					proposal_id: row.get(0)?,
					period: row.get(1)?,
					proposer: row.get(2)?,
					proposed_at: row.get(3)?,
					expires_at: row.get(4)?,
					status: SettlementStatus::from_str(&row.get::<_, String>(5)?)
						.unwrap_or(SettlementStatus::Pending),
					data_hash: row.get(6)?,
					plan_hash: row.get(7)?,
					total_fees_sats: row.get::<_, i64>(8)? as u64,
					member_count: row.get::<_, i64>(9)? as u32,
					last_broadcast_at: row.get(10)?,
					contributions_json: row.get(11)?,
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

/// Records a `SETTLEMENT_READY` vote iff the voter's recomputed `data_hash`
/// matches the proposal's (spec.md §4.9 step 4). A mismatch is a silent
/// abstention, not an error.
pub fn record_ready_vote(
	store: &Store,
	proposal_id: &str,
	voter: &str,
	data_hash: &str,
	now: i64,
	signature: &str,
) -> HiveResult<bool> {
	let Some(proposal) = load_proposal(store, proposal_id)? else {
		return Ok(false);
	};
	if proposal.data_hash != data_hash {
		return Ok(false);
	}
	store.with_conn(|conn| {
		conn.execute(
			"INSERT OR IGNORE INTO settlement_ready_votes (proposal_id, voter, data_hash, voted_at, signature) \
			 VALUES (?1, ?2, ?3, ?4, ?5)",
			rusqlite::params![proposal_id, voter, data_hash, now, signature],
		)?;
		Ok(true)
	})
}

/// Once `ready_votes / member_count >= quorum_fraction`, transitions the
/// proposal to `ready`.
pub fn evaluate_ready_quorum(
	store: &Store,
	proposal_id: &str,
	quorum_fraction: f64,
) -> HiveResult<bool> {
	let Some(proposal) = load_proposal(store, proposal_id)? else {
		return Ok(false);
	};
	if proposal.status != SettlementStatus::Pending {
		return Ok(proposal.status == SettlementStatus::Ready || proposal.status == SettlementStatus::Executed);
	}
	let ready_votes: i64 = store.with_conn(|conn| {
		conn.query_row(
			"SELECT COUNT(*) FROM settlement_ready_votes WHERE proposal_id = ?1",
			[proposal_id],
			|r| r.get(0),
		)
	})?;
	let met = proposal.member_count > 0
		&& (ready_votes as f64) / (proposal.member_count as f64) >= quorum_fraction;
	if met {
		store.with_conn(|conn| {
			conn.execute(
				"UPDATE settlement_proposals SET status = 'ready' WHERE proposal_id = ?1",
				[proposal_id],
			)?;
			Ok(())
		})?;
	}
	Ok(met)
}

/// Journals a sub-payment leg for crash recovery (spec.md §4.9 step 6,
/// SPEC_FULL.md §11). On restart, the executor consults this journal before
/// retrying a leg.
pub fn journal_sub_payment(
	store: &Store,
	proposal_id: &str,
	leg: &PaymentLeg,
	status: &str,
	payment_hash: Option<&str>,
	now: i64,
) -> HiveResult<()> {
	store.with_conn(|conn| {
		conn.execute(
			"INSERT INTO settlement_sub_payments \
			 (proposal_id, from_peer, to_peer, amount_sats, status, payment_hash, updated_at) \
			 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
			 ON CONFLICT(proposal_id, from_peer, to_peer) DO UPDATE SET \
			   status = excluded.status, payment_hash = excluded.payment_hash, \
			   updated_at = excluded.updated_at",
			rusqlite::params![
				proposal_id,
				leg.from_peer,
				leg.to_peer,
				leg.amount_sats,
				status,
				payment_hash,
				now
			],
		)?;
		Ok(())
	})
}

pub fn sub_payment_status(store: &Store, proposal_id: &str, from: &str, to: &str) -> HiveResult<Option<String>> {
	store.with_conn(|conn| {
		conn.query_row(
			"SELECT status FROM settlement_sub_payments WHERE proposal_id = ?1 AND from_peer = ?2 AND to_peer = ?3",
			rusqlite::params![proposal_id, from, to],
			|r| r.get(0),
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

/// Records a `SETTLEMENT_EXECUTED` and, once every sub-payment leg journaled
/// for this proposal (via `journal_sub_payment`) reaches `paid`, closes the
/// period with a `settled_periods` row. `is_period_settled` is consulted
/// first (spec.md §8 scenario 5): a concurrent proposer's execution for an
/// already-settled period is a no-op, not an error. Returns whether this
/// call closed the period.
pub fn record_execution(
	store: &Store,
	proposal_id: &str,
	period: &str,
	executor: &str,
	payment_hash: Option<&str>,
	amount_paid_sats: Option<u64>,
	plan_hash: Option<&str>,
	signature: &str,
	now: i64,
) -> HiveResult<bool> {
	if is_period_settled(store, period)? {
		return Err(HiveError::new(HiveErrorKind::AlreadySettled, period));
	}
	store.with_conn(|conn| {
		conn.execute(
			"INSERT OR IGNORE INTO settlement_executions \
			 (proposal_id, executor, payment_hash, amount_paid_sats, executed_at, signature, plan_hash) \
			 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
			rusqlite::params![
				proposal_id,
				executor,
				payment_hash,
				amount_paid_sats.map(|v| v as i64),
				now,
				signature,
				plan_hash
			],
		)?;
		Ok(())
	})?;
	let all_paid = store.with_conn(|conn| {
		let total: i64 = conn.query_row(
			"SELECT COUNT(*) FROM settlement_sub_payments WHERE proposal_id = ?1",
			[proposal_id],
			|r| r.get(0),
		)?;
		if total == 0 {
			return Ok(false);
		}
		let unpaid: i64 = conn.query_row(
			"SELECT COUNT(*) FROM settlement_sub_payments WHERE proposal_id = ?1 AND status != 'paid'",
			[proposal_id],
			|r| r.get(0),
		)?;
		Ok(unpaid == 0)
	})?;
	if all_paid {
		close_period(store, period, now)
	} else {
		Ok(false)
	}
}

/// Closes the period. Uniqueness of `period` as primary key is the hard
/// anti-double-settlement guard (spec.md §3, §8 scenario 5).
pub fn close_period(store: &Store, period: &str, now: i64) -> HiveResult<bool> {
	store.with_conn(|conn| {
		let changed = conn.execute(
			"INSERT OR IGNORE INTO settled_periods (period, settled_at) VALUES (?1, ?2)",
			rusqlite::params![period, now],
		)?;
		Ok(changed > 0)
	})
}

/// Rebroadcast check: a `pending` proposal whose `last_broadcast_at` is
/// stale should be rebroadcast (spec.md §4.9: "every REBROADCAST_INTERVAL
/// to tolerate membership churn").
pub fn needs_rebroadcast(proposal: &SettlementProposalRow, now: i64) -> bool {
	proposal.status == SettlementStatus::Pending
		&& proposal
			.last_broadcast_at
			.map(|t| now - t >= REBROADCAST_INTERVAL_SECONDS)
			.unwrap_or(true)
}

/// All proposals still in `pending` status, for the hourly rebroadcast
/// sweep (spec.md §4.10's `settlement tick`).
pub fn pending_proposals(store: &Store) -> HiveResult<Vec<SettlementProposalRow>> {
	store.with_conn(|conn| {
		let mut stmt = conn.prepare(
			"SELECT proposal_id, period, proposer, proposed_at, expires_at, status, data_hash, \
			 plan_hash, total_fees_sats, member_count, last_broadcast_at, contributions_json \
			 FROM settlement_proposals WHERE status = 'pending'",
		)?;
		let rows = stmt
			.query_map([], |row| {
				Ok(SettlementProposalRow {
					proposal_id: row.get(0)?,
					period: row.get(1)?,
					proposer: row.get(2)?,
					proposed_at: row.get(3)?,
					expires_at: row.get(4)?,
					status: SettlementStatus::from_str(&row.get::<_, String>(5)?)
						.unwrap_or(SettlementStatus::Pending),
					data_hash: row.get(6)?,
					plan_hash: row.get(7)?,
					total_fees_sats: row.get::<_, i64>(8)? as u64,
					member_count: row.get::<_, i64>(9)? as u32,
					last_broadcast_at: row.get(10)?,
					contributions_json: row.get(11)?,
				})
			})?
			.collect::<Result<Vec<_>, _>>()?;
		Ok(rows)
	})
}

/// Proposals that reached quorum but have no `settled_periods` row yet —
/// the candidates a debtor member still needs to execute against.
pub fn ready_proposals(store: &Store) -> HiveResult<Vec<SettlementProposalRow>> {
	store.with_conn(|conn| {
		let mut stmt = conn.prepare(
			"SELECT proposal_id, period, proposer, proposed_at, expires_at, status, data_hash, \
			 plan_hash, total_fees_sats, member_count, last_broadcast_at, contributions_json \
			 FROM settlement_proposals WHERE status = 'ready'",
		)?;
		let rows = stmt
			.query_map([], |row| {
				Ok(SettlementProposalRow {
					proposal_id: row.get(0)?,
					period: row.get(1)?,
					proposer: row.get(2)?,
					proposed_at: row.get(3)?,
					expires_at: row.get(4)?,
					status: SettlementStatus::from_str(&row.get::<_, String>(5)?)
						.unwrap_or(SettlementStatus::Pending),
					data_hash: row.get(6)?,
					plan_hash: row.get(7)?,
					total_fees_sats: row.get::<_, i64>(8)? as u64,
					member_count: row.get::<_, i64>(9)? as u32,
					last_broadcast_at: row.get(10)?,
					contributions_json: row.get(11)?,
				})
			})?
			.collect::<Result<Vec<_>, _>>()?;
		Ok(rows)
	})
}

/// Whether `executor` has already recorded a `SETTLEMENT_EXECUTED` for this
/// proposal, enforced by the `(proposal_id, executor)` primary key.
pub fn has_executed(store: &Store, proposal_id: &str, executor: &str) -> HiveResult<bool> {
	store.with_conn(|conn| {
		let n: i64 = conn.query_row(
			"SELECT COUNT(*) FROM settlement_executions WHERE proposal_id = ?1 AND executor = ?2",
			rusqlite::params![proposal_id, executor],
			|r| r.get(0),
		)?;
		Ok(n > 0)
	})
}

pub fn mark_rebroadcast(store: &Store, proposal_id: &str, now: i64) -> HiveResult<()> {
	store.with_conn(|conn| {
		conn.execute(
			"UPDATE settlement_proposals SET last_broadcast_at = ?1 WHERE proposal_id = ?2",
			rusqlite::params![now, proposal_id],
		)?;
		Ok(())
	})
}

/// All proposals, most recent first — the operator-facing settlement
/// history read (SPEC_FULL.md §11, `get_settlement_history`).
pub fn settlement_history(store: &Store) -> HiveResult<Vec<SettlementProposalRow>> {
	store.with_conn(|conn| {
		let mut stmt = conn.prepare(
			"SELECT proposal_id, period, proposer, proposed_at, expires_at, status, data_hash, \
			 plan_hash, total_fees_sats, member_count, last_broadcast_at, contributions_json \
			 FROM settlement_proposals ORDER BY proposed_at DESC",
		)?;
		let rows = stmt
			.query_map([], |row| {
				Ok(SettlementProposalRow {
					proposal_id: row.get(0)?,
					period: row.get(1)?,
					proposer: row.get(2)?,
					proposed_at: row.get(3)?,
					expires_at: row.get(4)?,
					status: SettlementStatus::from_str(&row.get::<_, String>(5)?)
						.unwrap_or(SettlementStatus::Pending),
					data_hash: row.get(6)?,
					plan_hash: row.get(7)?,
					total_fees_sats: row.get::<_, i64>(8)? as u64,
					member_count: row.get::<_, i64>(9)? as u32,
					last_broadcast_at: row.get(10)?,
					contributions_json: row.get(11)?,
				})
			})?
			.collect::<Result<Vec<_>, _>>()?;
		Ok(rows)
	})
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubPaymentRow {
	pub proposal_id: String,
	pub from_peer: String,
	pub to_peer: String,
	pub amount_sats: i64,
	pub status: String,
	pub payment_hash: Option<String>,
	pub updated_at: i64,
}

/// A single period's proposal plus its journaled payment legs
/// (`get_period_details`).
pub fn period_details(
	store: &Store,
	period: &str,
) -> HiveResult<Option<(SettlementProposalRow, Vec<SubPaymentRow>)>> {
	let Some(proposal) = store.with_conn(|conn| {
		conn.query_row(
			"SELECT proposal_id, period, proposer, proposed_at, expires_at, status, data_hash, \
			 plan_hash, total_fees_sats, member_count, last_broadcast_at, contributions_json \
			 FROM settlement_proposals WHERE period = ?1 ORDER BY proposed_at DESC LIMIT 1",
			[period],
			|row| {
				Ok(SettlementProposalRow {
					proposal_id: row.get(0)?,
					period: row.get(1)?,
					proposer: row.get(2)?,
					proposed_at: row.get(3)?,
					expires_at: row.get(4)?,
					status: SettlementStatus::from_str(&row.get::<_, String>(5)?)
						.unwrap_or(SettlementStatus::Pending),
					data_hash: row.get(6)?,
					plan_hash: row.get(7)?,
					total_fees_sats: row.get::<_, i64>(8)? as u64,
					member_count: row.get::<_, i64>(9)? as u32,
					last_broadcast_at: row.get(10)?,
					contributions_json: row.get(11)?,
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
	})?
	else {
		return Ok(None);
	};
	let legs = store.with_conn(|conn| {
		let mut stmt = conn.prepare(
			"SELECT proposal_id, from_peer, to_peer, amount_sats, status, payment_hash, updated_at \
			 FROM settlement_sub_payments WHERE proposal_id = ?1",
		)?;
		let rows = stmt
			.query_map([&proposal.proposal_id], |row| {
				Ok(SubPaymentRow {
					proposal_id: row.get(0)?,
					from_peer: row.get(1)?,
					to_peer: row.get(2)?,
					amount_sats: row.get(3)?,
					status: row.get(4)?,
					payment_hash: row.get(5)?,
					updated_at: row.get(6)?,
				})
			})?
			.collect::<Result<Vec<_>, _>>()?;
		Ok(rows)
	})?;
	Ok(Some((proposal, legs)))
}

/// Every sub-payment leg touching `peer_id`, most recent first
/// (`get_member_settlement_history`).
pub fn member_settlement_history(store: &Store, peer_id: &str) -> HiveResult<Vec<SubPaymentRow>> {
	store.with_conn(|conn| {
		let mut stmt = conn.prepare(
			"SELECT proposal_id, from_peer, to_peer, amount_sats, status, payment_hash, updated_at \
			 FROM settlement_sub_payments WHERE from_peer = ?1 OR to_peer = ?1 \
			 ORDER BY updated_at DESC",
		)?;
		let rows = stmt
			.query_map([peer_id], |row| {
				Ok(SubPaymentRow {
					proposal_id: row.get(0)?,
					from_peer: row.get(1)?,
					to_peer: row.get(2)?,
					amount_sats: row.get(3)?,
					status: row.get(4)?,
					payment_hash: row.get(5)?,
					updated_at: row.get(6)?,
				})
			})?
			.collect::<Result<Vec<_>, _>>()?;
		Ok(rows)
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::test_store;

	fn weights() -> SettlementWeights {
		SettlementWeights { capacity: 0.30, forwards: 0.60, uptime: 0.10 }
	}

	#[test]
	fn settlement_convergence_scenario() {
		let contributions = vec![
			MemberContribution {
				peer_id: "A".to_string(),
				fees_earned_sats: 100,
				forward_count: 10,
				capacity_sats: 1_000_000,
				uptime_pct: 1.0,
			},
			MemberContribution {
				peer_id: "B".to_string(),
				fees_earned_sats: 50,
				forward_count: 5,
				capacity_sats: 1_000_000,
				uptime_pct: 1.0,
			},
			MemberContribution {
				peer_id: "C".to_string(),
				fees_earned_sats: 0,
				forward_count: 0,
				capacity_sats: 1_000_000,
				uptime_pct: 1.0,
			},
		];
		let shares = compute_fair_shares(&contributions, weights());
		assert_eq!(shares[0].fair_share_sats, 80);
		assert_eq!(shares[1].fair_share_sats, 50);
		assert_eq!(shares[2].fair_share_sats, 20);
		assert_eq!(shares[0].balance_sats, -20);
		assert_eq!(shares[1].balance_sats, 0);
		assert_eq!(shares[2].balance_sats, 20);

		let plan = build_payment_plan(&shares);
		assert_eq!(plan, vec![PaymentLeg {
			from_peer: "A".to_string(),
			to_peer: "C".to_string(),
			amount_sats: 20,
		}]);
	}

	#[test]
	fn period_for_known_date() {
		// 2025-01-13 is a Monday in ISO week 3.
		let monday = chrono::NaiveDate::from_ymd_opt(2025, 1, 13)
			.unwrap()
			.and_hms_opt(0, 0, 0)
			.unwrap()
			.and_utc()
			.timestamp();
		assert_eq!(period_for(monday), "2025-W03");
	}

	#[test]
	fn double_settlement_rejected() {
		let store = test_store();
		close_period(&store, "2025-W03", 1000).unwrap();
		let err = create_proposal(&store, "p2", "2025-W03", "B", "hash", None, 150, 3, "[]", 1001, 2000)
			.unwrap_err();
		assert_eq!(err.kind(), Some(HiveErrorKind::AlreadySettled));
	}

	#[test]
	fn close_period_is_unique() {
		let store = test_store();
		assert!(close_period(&store, "2025-W03", 1000).unwrap());
		assert!(!close_period(&store, "2025-W03", 2000).unwrap());
	}

	#[test]
	fn data_hash_independent_of_order() {
		let a = vec![
			MemberContribution { peer_id: "B".into(), fees_earned_sats: 1, forward_count: 1, capacity_sats: 1, uptime_pct: 1.0 },
			MemberContribution { peer_id: "A".into(), fees_earned_sats: 2, forward_count: 2, capacity_sats: 2, uptime_pct: 1.0 },
		];
		let b = vec![a[1].clone(), a[0].clone()];
		assert_eq!(compute_data_hash(&a), compute_data_hash(&b));
	}
}
