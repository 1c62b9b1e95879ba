//! Typed row models for the tables `schema` creates.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberTier {
	Neophyte,
	Member,
}

impl MemberTier {
	pub fn as_str(self) -> &'static str {
		match self {
			MemberTier::Neophyte => "neophyte",
			MemberTier::Member => "member",
		}
	}

	pub fn from_str(s: &str) -> Option<Self> {
		match s {
			"neophyte" => Some(MemberTier::Neophyte),
			"member" => Some(MemberTier::Member),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct Member {
	pub peer_id: String,
	pub tier: MemberTier,
	pub joined_at: i64,
	pub promoted_at: Option<i64>,
	pub contribution_ratio: f64,
	pub uptime_pct: f64,
	pub vouch_count: u32,
	pub last_seen: i64,
	pub addresses: Option<String>,
	pub leech_flagged: bool,
	pub leech_watch_since: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentStatus {
	Pending,
	Committed,
	Aborted,
	Expired,
	Failed,
}

impl IntentStatus {
	pub fn as_str(self) -> &'static str {
		match self {
			IntentStatus::Pending => "pending",
			IntentStatus::Committed => "committed",
			IntentStatus::Aborted => "aborted",
			IntentStatus::Expired => "expired",
			IntentStatus::Failed => "failed",
		}
	}

	pub fn from_str(s: &str) -> Option<Self> {
		match s {
			"pending" => Some(IntentStatus::Pending),
			"committed" => Some(IntentStatus::Committed),
			"aborted" => Some(IntentStatus::Aborted),
			"expired" => Some(IntentStatus::Expired),
			"failed" => Some(IntentStatus::Failed),
			_ => None,
		}
	}

	/// Is this one of the sticky terminal states in the DAG spec.md §3
	/// describes (`pending -> {committed, aborted, expired, failed}`)?
	pub fn is_terminal(self) -> bool {
		!matches!(self, IntentStatus::Pending)
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntentLock {
	pub id: String,
	pub intent_type: String,
	pub target: String,
	pub initiator_pubkey: String,
	pub timestamp: i64,
	pub expires_at: i64,
	pub status: IntentStatus,
	pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerStateRow {
	pub peer_id: String,
	pub capacity_sats: u64,
	pub available_sats: u64,
	pub fee_policy: serde_json::Value,
	pub topology: Vec<String>,
	pub last_gossip: i64,
	pub state_hash: String,
	pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContributionDirection {
	Forwarded,
	Received,
}

impl ContributionDirection {
	pub fn as_str(self) -> &'static str {
		match self {
			ContributionDirection::Forwarded => "forwarded",
			ContributionDirection::Received => "received",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
	Queued,
	Sent,
	Acked,
	Failed,
	Expired,
}

impl OutboxStatus {
	pub fn as_str(self) -> &'static str {
		match self {
			OutboxStatus::Queued => "queued",
			OutboxStatus::Sent => "sent",
			OutboxStatus::Acked => "acked",
			OutboxStatus::Failed => "failed",
			OutboxStatus::Expired => "expired",
		}
	}

	pub fn from_str(s: &str) -> Option<Self> {
		match s {
			"queued" => Some(OutboxStatus::Queued),
			"sent" => Some(OutboxStatus::Sent),
			"acked" => Some(OutboxStatus::Acked),
			"failed" => Some(OutboxStatus::Failed),
			"expired" => Some(OutboxStatus::Expired),
			_ => None,
		}
	}

	pub fn is_terminal(self) -> bool {
		matches!(self, OutboxStatus::Acked | OutboxStatus::Failed | OutboxStatus::Expired)
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
	pub msg_id: String,
	pub peer_id: String,
	pub msg_type: String,
	pub payload_json: String,
	pub status: OutboxStatus,
	pub created_at: i64,
	pub next_retry_at: i64,
	pub retry_count: u32,
	pub expires_at: i64,
	pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementStatus {
	Pending,
	Ready,
	Executed,
	Aborted,
}

impl SettlementStatus {
	pub fn as_str(self) -> &'static str {
		match self {
			SettlementStatus::Pending => "pending",
			SettlementStatus::Ready => "ready",
			SettlementStatus::Executed => "executed",
			SettlementStatus::Aborted => "aborted",
		}
	}

	pub fn from_str(s: &str) -> Option<Self> {
		match s {
			"pending" => Some(SettlementStatus::Pending),
			"ready" => Some(SettlementStatus::Ready),
			"executed" => Some(SettlementStatus::Executed),
			"aborted" => Some(SettlementStatus::Aborted),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct SettlementProposalRow {
	pub proposal_id: String,
	pub period: String,
	pub proposer: String,
	pub proposed_at: i64,
	pub expires_at: i64,
	pub status: SettlementStatus,
	pub data_hash: String,
	pub plan_hash: Option<String>,
	pub total_fees_sats: u64,
	pub member_count: u32,
	pub last_broadcast_at: Option<i64>,
	pub contributions_json: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeeReportRow {
	pub peer_id: String,
	pub period: String,
	pub fees_earned_sats: u64,
	pub forward_count: u64,
	pub rebalance_costs_sats: u64,
	pub period_start: i64,
	pub period_end: i64,
	pub received_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanProposalStatus {
	Pending,
	Passed,
	Rejected,
	Expired,
}

impl BanProposalStatus {
	pub fn as_str(self) -> &'static str {
		match self {
			BanProposalStatus::Pending => "pending",
			BanProposalStatus::Passed => "passed",
			BanProposalStatus::Rejected => "rejected",
			BanProposalStatus::Expired => "expired",
		}
	}

	pub fn from_str(s: &str) -> Option<Self> {
		match s {
			"pending" => Some(BanProposalStatus::Pending),
			"passed" => Some(BanProposalStatus::Passed),
			"rejected" => Some(BanProposalStatus::Rejected),
			"expired" => Some(BanProposalStatus::Expired),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct BanProposalRow {
	pub proposal_id: String,
	pub target: String,
	pub proposer: String,
	pub reason: String,
	pub proposed_at: i64,
	pub expires_at: i64,
	pub status: BanProposalStatus,
	pub proposal_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingActionStatus {
	Pending,
	Approved,
	Rejected,
}

impl PendingActionStatus {
	pub fn as_str(self) -> &'static str {
		match self {
			PendingActionStatus::Pending => "pending",
			PendingActionStatus::Approved => "approved",
			PendingActionStatus::Rejected => "rejected",
		}
	}

	pub fn from_str(s: &str) -> Option<Self> {
		match s {
			"pending" => Some(PendingActionStatus::Pending),
			"approved" => Some(PendingActionStatus::Approved),
			"rejected" => Some(PendingActionStatus::Rejected),
			_ => None,
		}
	}
}

/// A queued operator decision (spec.md §7: "in advisor mode, any
/// state-changing decision... produces a `pending_actions` row awaiting
/// operator input").
#[derive(Debug, Clone, PartialEq)]
pub struct PendingActionRow {
	pub id: i64,
	pub action_type: String,
	pub target: String,
	pub context: String,
	pub status: PendingActionStatus,
	pub created_at: i64,
	pub decided_at: Option<i64>,
	pub reason: Option<String>,
}
