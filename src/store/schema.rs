//! Schema definitions. `CREATE TABLE IF NOT EXISTS` for every entity
//! spec.md §3 names, plus the supplemented settlement sub-payment journal
//! (SPEC_FULL.md §11).

use rusqlite::Connection;

use crate::error::HiveResult;

pub fn create_all(conn: &Connection) -> HiveResult<()> {
	conn.execute_batch(
		r#"
		CREATE TABLE IF NOT EXISTS members (
			peer_id TEXT PRIMARY KEY,
			tier TEXT NOT NULL,
			joined_at INTEGER NOT NULL,
			promoted_at INTEGER,
			contribution_ratio REAL NOT NULL DEFAULT 1.0,
			uptime_pct REAL NOT NULL DEFAULT 1.0,
			vouch_count INTEGER NOT NULL DEFAULT 0,
			last_seen INTEGER NOT NULL,
			addresses TEXT,
			leech_flagged INTEGER NOT NULL DEFAULT 0,
			leech_watch_since INTEGER
		);

		CREATE TABLE IF NOT EXISTS intent_locks (
			id TEXT PRIMARY KEY,
			intent_type TEXT NOT NULL,
			target TEXT NOT NULL,
			initiator_pubkey TEXT NOT NULL,
			timestamp INTEGER NOT NULL,
			expires_at INTEGER NOT NULL,
			status TEXT NOT NULL,
			reason TEXT
		);
		CREATE INDEX IF NOT EXISTS idx_intent_locks_conflict
			ON intent_locks(intent_type, target, initiator_pubkey, status);

		CREATE TABLE IF NOT EXISTS peer_state (
			peer_id TEXT PRIMARY KEY,
			capacity_sats INTEGER NOT NULL,
			available_sats INTEGER NOT NULL,
			fee_policy TEXT NOT NULL,
			topology TEXT NOT NULL,
			last_gossip INTEGER NOT NULL,
			state_hash TEXT NOT NULL,
			version INTEGER NOT NULL
		);

		CREATE TABLE IF NOT EXISTS contribution_events (
			id INTEGER PRIMARY KEY AUTOINCREMENT,
			peer_id TEXT NOT NULL,
			direction TEXT NOT NULL,
			amount_sats INTEGER NOT NULL,
			timestamp INTEGER NOT NULL
		);
		CREATE INDEX IF NOT EXISTS idx_contribution_events_peer_time
			ON contribution_events(peer_id, timestamp);

		CREATE TABLE IF NOT EXISTS bans (
			peer_id TEXT PRIMARY KEY,
			reason TEXT NOT NULL,
			reporter TEXT NOT NULL,
			signature TEXT,
			banned_at INTEGER NOT NULL,
			expires_at INTEGER
		);

		CREATE TABLE IF NOT EXISTS ban_proposals (
			proposal_id TEXT PRIMARY KEY,
			target TEXT NOT NULL,
			proposer TEXT NOT NULL,
			reason TEXT NOT NULL,
			proposed_at INTEGER NOT NULL,
			expires_at INTEGER NOT NULL,
			status TEXT NOT NULL,
			proposal_type TEXT NOT NULL
		);

		CREATE TABLE IF NOT EXISTS ban_votes (
			proposal_id TEXT NOT NULL,
			voter TEXT NOT NULL,
			vote TEXT NOT NULL,
			voted_at INTEGER NOT NULL,
			signature TEXT NOT NULL,
			PRIMARY KEY (proposal_id, voter)
		);

		CREATE TABLE IF NOT EXISTS outbox_entries (
			msg_id TEXT NOT NULL,
			peer_id TEXT NOT NULL,
			msg_type TEXT NOT NULL,
			payload_json TEXT NOT NULL,
			status TEXT NOT NULL,
			created_at INTEGER NOT NULL,
			next_retry_at INTEGER NOT NULL,
			retry_count INTEGER NOT NULL DEFAULT 0,
			expires_at INTEGER NOT NULL,
			last_error TEXT,
			PRIMARY KEY (msg_id, peer_id)
		);
		CREATE INDEX IF NOT EXISTS idx_outbox_peer_status
			ON outbox_entries(peer_id, status);
		CREATE INDEX IF NOT EXISTS idx_outbox_retry_due
			ON outbox_entries(status, next_retry_at);

		CREATE TABLE IF NOT EXISTS proto_events (
			event_id TEXT PRIMARY KEY,
			event_type TEXT NOT NULL,
			actor_id TEXT NOT NULL,
			created_at INTEGER NOT NULL,
			received_at INTEGER NOT NULL
		);

		CREATE TABLE IF NOT EXISTS settlement_proposals (
			proposal_id TEXT PRIMARY KEY,
			period TEXT NOT NULL,
			proposer TEXT NOT NULL,
			proposed_at INTEGER NOT NULL,
			expires_at INTEGER NOT NULL,
			status TEXT NOT NULL,
			data_hash TEXT NOT NULL,
			plan_hash TEXT,
			total_fees_sats INTEGER NOT NULL,
			member_count INTEGER NOT NULL,
			last_broadcast_at INTEGER,
			contributions_json TEXT
		);
		CREATE INDEX IF NOT EXISTS idx_settlement_proposals_period
			ON settlement_proposals(period);

		CREATE TABLE IF NOT EXISTS settlement_ready_votes (
			proposal_id TEXT NOT NULL,
			voter TEXT NOT NULL,
			data_hash TEXT NOT NULL,
			voted_at INTEGER NOT NULL,
			signature TEXT NOT NULL,
			PRIMARY KEY (proposal_id, voter)
		);

		CREATE TABLE IF NOT EXISTS settlement_executions (
			proposal_id TEXT NOT NULL,
			executor TEXT NOT NULL,
			payment_hash TEXT,
			amount_paid_sats INTEGER,
			executed_at INTEGER NOT NULL,
			signature TEXT NOT NULL,
			plan_hash TEXT,
			PRIMARY KEY (proposal_id, executor)
		);

		CREATE TABLE IF NOT EXISTS settlement_sub_payments (
			proposal_id TEXT NOT NULL,
			from_peer TEXT NOT NULL,
			to_peer TEXT NOT NULL,
			amount_sats INTEGER NOT NULL,
			status TEXT NOT NULL,
			payment_hash TEXT,
			updated_at INTEGER NOT NULL,
			PRIMARY KEY (proposal_id, from_peer, to_peer)
		);

		CREATE TABLE IF NOT EXISTS settled_periods (
			period TEXT PRIMARY KEY,
			settled_at INTEGER NOT NULL
		);

		CREATE TABLE IF NOT EXISTS fee_reports (
			peer_id TEXT NOT NULL,
			period TEXT NOT NULL,
			fees_earned_sats INTEGER NOT NULL,
			forward_count INTEGER NOT NULL,
			rebalance_costs_sats INTEGER NOT NULL,
			period_start INTEGER NOT NULL,
			period_end INTEGER NOT NULL,
			received_at INTEGER NOT NULL,
			PRIMARY KEY (peer_id, period)
		);

		CREATE TABLE IF NOT EXISTS pending_actions (
			id INTEGER PRIMARY KEY AUTOINCREMENT,
			action_type TEXT NOT NULL,
			target TEXT NOT NULL,
			context TEXT NOT NULL,
			status TEXT NOT NULL,
			created_at INTEGER NOT NULL,
			decided_at INTEGER,
			reason TEXT
		);
		"#,
	)?;
	Ok(())
}
