//! Contribution ledger and leech detection. Grounded on
//! `modules/contribution.py`; spec.md §4.8.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::HiveResult;
use crate::host::{ForwardEvent, ForwardStatus};
use crate::store::{ContributionDirection, Store};

pub const LEDGER_ROW_CAP: i64 = 500_000;
pub const PER_PEER_PER_HOUR_LIMIT: u32 = 120;
pub const GLOBAL_PER_DAY_LIMIT: u32 = 10_000;
pub const CONTRIBUTION_WINDOW_DAYS: i64 = 30;
pub const LEECH_WARN_RATIO: f64 = 0.5;
pub const LEECH_BAN_RATIO: f64 = 0.4;
pub const LEECH_WINDOW_DAYS: i64 = 7;

/// Per-peer-per-hour and global-per-day counters, persisted on every
/// mutation (spec.md §4.8: "Counters are persisted every mutation so
/// restarts cannot bypass limits") — the in-memory half here is only a fast
/// path, the Store query in `record_event` is authoritative.
pub struct RateCounters {
	per_peer_hour: Mutex<HashMap<(String, i64), u32>>,
	global_day: Mutex<HashMap<i64, u32>>,
}

impl RateCounters {
	pub fn new() -> Self {
		Self { per_peer_hour: Mutex::new(HashMap::new()), global_day: Mutex::new(HashMap::new()) }
	}
}

impl Default for RateCounters {
	fn default() -> Self {
		Self::new()
	}
}

fn hour_bucket(timestamp: i64) -> i64 {
	timestamp / 3600
}

fn day_bucket(timestamp: i64) -> i64 {
	timestamp / 86_400
}

/// Resolves a settled forward event into a contribution record for either
/// side that is a hive member, subject to per-peer-per-hour, global-per-day,
/// and ledger-cap limits. `channel_map` maps channel id -> peer pubkey.
pub fn record_forward(
	store: &Store,
	counters: &RateCounters,
	channel_map: &HashMap<String, String>,
	event: &ForwardEvent,
	is_member: impl Fn(&str) -> HiveResult<bool>,
	now: i64,
) -> HiveResult<usize> {
	if event.status != ForwardStatus::Succeeded {
		return Ok(0);
	}
	let mut recorded = 0usize;
	for (channel, direction) in
		[(&event.in_channel, ContributionDirection::Received), (&event.out_channel, ContributionDirection::Forwarded)]
	{
		let Some(peer_id) = channel_map.get(channel) else { continue };
		if !is_member(peer_id)? {
			continue;
		}
		let hour_key = (peer_id.clone(), hour_bucket(now));
		let day_key = day_bucket(now);
		{
			let mut per_peer = counters.per_peer_hour.lock().expect("rate counter lock poisoned");
			let count = per_peer.entry(hour_key).or_insert(0);
			if *count >= PER_PEER_PER_HOUR_LIMIT {
				continue;
			}
			*count += 1;
		}
		{
			let mut global = counters.global_day.lock().expect("rate counter lock poisoned");
			let count = global.entry(day_key).or_insert(0);
			if *count >= GLOBAL_PER_DAY_LIMIT {
				continue;
			}
			*count += 1;
		}
		let amount = if direction == ContributionDirection::Forwarded {
			event.out_msat / 1000
		} else {
			event.in_msat / 1000
		};
		if amount == 0 {
			continue;
		}
		let inserted = store.with_conn(|conn| {
			let row_count: i64 =
				conn.query_row("SELECT COUNT(*) FROM contribution_events", [], |r| r.get(0))?;
			if row_count >= LEDGER_ROW_CAP {
				return Ok(false);
			}
			conn.execute(
				"INSERT INTO contribution_events (peer_id, direction, amount_sats, timestamp) \
				 VALUES (?1, ?2, ?3, ?4)",
				rusqlite::params![peer_id, direction.as_str(), amount as i64, now],
			)?;
			Ok(true)
		})?;
		if inserted {
			recorded += 1;
		}
	}
	Ok(recorded)
}

/// `forwarded / received` over the rolling window; `1.0` if no `received`
/// data exists (spec.md §3).
pub fn contribution_ratio(store: &Store, peer_id: &str, now: i64) -> HiveResult<f64> {
	let cutoff = now - CONTRIBUTION_WINDOW_DAYS * 86_400;
	let (forwarded, received): (i64, i64) = store.with_conn(|conn| {
		let forwarded = conn.query_row(
			"SELECT COALESCE(SUM(amount_sats), 0) FROM contribution_events \
			 WHERE peer_id = ?1 AND direction = 'forwarded' AND timestamp >= ?2",
			rusqlite::params![peer_id, cutoff],
			|r| r.get(0),
		)?;
		let received = conn.query_row(
			"SELECT COALESCE(SUM(amount_sats), 0) FROM contribution_events \
			 WHERE peer_id = ?1 AND direction = 'received' AND timestamp >= ?2",
			rusqlite::params![peer_id, cutoff],
			|r| r.get(0),
		)?;
		Ok((forwarded, received))
	})?;
	if received == 0 {
		Ok(1.0)
	} else {
		Ok(forwarded as f64 / received as f64)
	}
}

/// Outcome of one `evaluate_leech_status` sample: whether to flag the peer,
/// and the `leech_watch_since` value the caller should persist alongside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeechEvaluation {
	pub flagged: bool,
	pub watch_since: Option<i64>,
}

/// Whether the peer should be (re-)flagged as a leech, given its current
/// contribution ratio, the timestamp its ratio first dropped below
/// `LEECH_BAN_RATIO` (if still depressed), and its current flag state.
/// Recovery above `LEECH_WARN_RATIO` clears both the flag and the watch
/// window immediately. A ratio between the two thresholds holds whatever
/// state already existed. A ratio below `LEECH_BAN_RATIO` only flags once
/// the depletion has been continuous for `LEECH_WINDOW_DAYS` (spec.md §4.8:
/// "a continuous window of LEECH_WINDOW_DAYS... of depletion below
/// threshold") — a single bad sample starts the watch, not the ban.
/// Callers persist the result via `membership::set_leech_flag` and
/// `membership::set_leech_watch_since`.
pub fn evaluate_leech_status(
	ratio: f64,
	watch_since: Option<i64>,
	currently_flagged: bool,
	now: i64,
) -> LeechEvaluation {
	if ratio >= LEECH_WARN_RATIO {
		return LeechEvaluation { flagged: false, watch_since: None };
	}
	if ratio >= LEECH_BAN_RATIO {
		return LeechEvaluation { flagged: currently_flagged, watch_since };
	}
	let watch_since = watch_since.unwrap_or(now);
	let flagged = currently_flagged || now - watch_since >= LEECH_WINDOW_DAYS * 86_400;
	LeechEvaluation { flagged, watch_since: Some(watch_since) }
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::test_store;

	#[test]
	fn ratio_defaults_to_one_with_no_data() {
		let store = test_store();
		assert_eq!(contribution_ratio(&store, "p1", 1000).unwrap(), 1.0);
	}

	#[test]
	fn ratio_computed_from_window() {
		let store = test_store();
		store
			.with_conn(|conn| {
				conn.execute(
					"INSERT INTO contribution_events (peer_id, direction, amount_sats, timestamp) \
					 VALUES ('p1', 'forwarded', 40, 1000)",
					[],
				)?;
				conn.execute(
					"INSERT INTO contribution_events (peer_id, direction, amount_sats, timestamp) \
					 VALUES ('p1', 'received', 100, 1000)",
					[],
				)?;
				Ok(())
			})
			.unwrap();
		assert_eq!(contribution_ratio(&store, "p1", 1000).unwrap(), 0.4);
	}

	#[test]
	fn leech_flag_clears_on_recovery() {
		let recovered = evaluate_leech_status(0.6, Some(1_000), true, 2_000);
		assert!(!recovered.flagged);
		assert_eq!(recovered.watch_since, None);

		let between = evaluate_leech_status(0.45, Some(1_000), true, 2_000);
		assert!(between.flagged);
		let between_cleared = evaluate_leech_status(0.45, None, false, 2_000);
		assert!(!between_cleared.flagged);
	}

	#[test]
	fn leech_flag_requires_sustained_depletion() {
		let now = 1_000_000;
		let first_sample = evaluate_leech_status(0.1, None, false, now);
		assert!(!first_sample.flagged, "one depressed sample only starts the watch");
		assert_eq!(first_sample.watch_since, Some(now));

		let still_watching = evaluate_leech_status(0.1, first_sample.watch_since, false, now + 3600);
		assert!(!still_watching.flagged, "under LEECH_WINDOW_DAYS of depletion so far");

		let past_window = evaluate_leech_status(
			0.1,
			first_sample.watch_since,
			false,
			now + LEECH_WINDOW_DAYS * 86_400,
		);
		assert!(past_window.flagged, "depletion sustained for the full window bans");
	}
}
