//! Message-type taxonomy and typed, validated payloads.
//!
//! Each state-changing type carries a `validate_<type>_payload` equivalent
//! as a method on its payload struct (`Payload::validate`), matching the
//! shape spec.md §4.1 calls for without needing a trait object per type.

use serde::{Deserialize, Serialize};

use super::{check_list_cap, check_pubkey, check_reason};
use crate::error::{HiveError, HiveErrorKind, HiveResult};

macro_rules! message_types {
	($($variant:ident = $code:expr),+ $(,)?) => {
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
		pub enum HiveMessageType {
			$($variant),+
		}

		impl HiveMessageType {
			pub fn code(self) -> u16 {
				match self {
					$(HiveMessageType::$variant => $code),+
				}
			}

			pub fn from_code(code: u16) -> Option<Self> {
				match code {
					$($code => Some(HiveMessageType::$variant),)+
					_ => None,
				}
			}

			pub fn name(self) -> &'static str {
				match self {
					$(HiveMessageType::$variant => stringify!($variant)),+
				}
			}
		}
	};
}

message_types! {
	Hello = 1,
	Attest = 3,
	Gossip = 5,
	FullSyncRequest = 7,
	FullSyncResponse = 9,
	StateHash = 11,
	Intent = 13,
	IntentAbort = 15,
	PromotionRequest = 17,
	Vouch = 19,
	Promotion = 21,
	MemberLeft = 23,
	BanProposal = 25,
	BanVote = 27,
	FeeReport = 29,
	FeeIntelligenceSnapshot = 31,
	LiquidityNeed = 33,
	LiquiditySnapshot = 35,
	RouteProbe = 37,
	RouteProbeBatch = 39,
	PeerReputationSnapshot = 41,
	HealthReport = 43,
	TaskRequest = 45,
	TaskResponse = 47,
	SpliceInitRequest = 49,
	SpliceInitResponse = 51,
	SpliceInitUpdate = 53,
	SpliceInitSigned = 55,
	SpliceInitAbort = 57,
	SettlementPropose = 59,
	SettlementReady = 61,
	SettlementExecuted = 63,
	MsgAck = 65,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloPayload {
	pub node_pubkey: String,
	/// `(min, max)` contiguous supported version range.
	pub supported_versions: (u8, u8),
}

impl HelloPayload {
	pub fn validate(&self) -> HiveResult<()> {
		check_pubkey("node_pubkey", &self.node_pubkey)?;
		if self.supported_versions.0 > self.supported_versions.1 {
			return Err(HiveError::new(
				HiveErrorKind::FieldOutOfRange,
				"supported_versions range is inverted",
			));
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttestPayload {
	pub peer_id: String,
	pub features: Vec<String>,
}

impl AttestPayload {
	pub fn validate(&self) -> HiveResult<()> {
		check_pubkey("peer_id", &self.peer_id)?;
		check_list_cap("features", &self.features)?;
		Ok(())
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GossipPayload {
	pub peer_id: String,
	pub capacity_sats: u64,
	pub available_sats: u64,
	pub fee_policy: serde_json::Value,
	pub topology: Vec<String>,
	pub last_gossip: i64,
	pub state_hash: String,
	pub version: u64,
}

impl GossipPayload {
	pub fn validate(&self) -> HiveResult<()> {
		check_pubkey("peer_id", &self.peer_id)?;
		check_list_cap("topology", &self.topology)?;
		if self.available_sats > self.capacity_sats {
			return Err(HiveError::new(
				HiveErrorKind::FieldOutOfRange,
				"available_sats exceeds capacity_sats",
			));
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FullSyncRequestPayload {
	pub request_id: String,
	pub requester_id: String,
}

impl FullSyncRequestPayload {
	pub fn validate(&self) -> HiveResult<()> {
		check_pubkey("requester_id", &self.requester_id)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerStateEntry {
	pub peer_id: String,
	pub capacity_sats: u64,
	pub available_sats: u64,
	pub fee_policy: serde_json::Value,
	pub topology: Vec<String>,
	pub last_gossip: i64,
	pub state_hash: String,
	pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FullSyncResponsePayload {
	pub request_id: String,
	pub entries: Vec<PeerStateEntry>,
}

impl FullSyncResponsePayload {
	pub fn validate(&self) -> HiveResult<()> {
		check_list_cap("entries", &self.entries)?;
		for entry in &self.entries {
			check_pubkey("entries[].peer_id", &entry.peer_id)?;
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateHashPayload {
	pub peer_id: String,
	pub state_hash: String,
	pub membership_hash: String,
	pub version: u64,
}

impl StateHashPayload {
	pub fn validate(&self) -> HiveResult<()> {
		check_pubkey("peer_id", &self.peer_id)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntentPayload {
	pub id: String,
	pub intent_type: String,
	pub target: String,
	pub initiator_pubkey: String,
	pub timestamp: i64,
	pub expires_at: i64,
}

impl IntentPayload {
	pub fn validate(&self) -> HiveResult<()> {
		check_pubkey("initiator_pubkey", &self.initiator_pubkey)?;
		if self.intent_type.is_empty() || self.intent_type.len() > 64 {
			return Err(HiveError::new(HiveErrorKind::FieldOutOfRange, "bad intent_type"));
		}
		if self.expires_at <= self.timestamp {
			return Err(HiveError::new(HiveErrorKind::FieldOutOfRange, "expires_at <= timestamp"));
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntentAbortPayload {
	pub id: String,
	pub reason: String,
}

impl IntentAbortPayload {
	pub fn validate(&self) -> HiveResult<()> {
		check_reason("reason", &self.reason)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromotionRequestPayload {
	pub request_id: String,
	pub target: String,
}

impl PromotionRequestPayload {
	pub fn validate(&self) -> HiveResult<()> {
		check_pubkey("target", &self.target)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VouchPayload {
	pub request_id: String,
	pub target: String,
	pub voucher: String,
	pub signature: String,
}

impl VouchPayload {
	pub fn validate(&self) -> HiveResult<()> {
		check_pubkey("target", &self.target)?;
		check_pubkey("voucher", &self.voucher)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromotionPayload {
	pub request_id: String,
	pub target: String,
}

impl PromotionPayload {
	pub fn validate(&self) -> HiveResult<()> {
		check_pubkey("target", &self.target)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberLeftPayload {
	pub peer_id: String,
	pub timestamp: i64,
	pub signature: String,
}

impl MemberLeftPayload {
	pub fn validate(&self) -> HiveResult<()> {
		check_pubkey("peer_id", &self.peer_id)
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProposalType {
	Standard,
	SettlementGaming,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BanProposalPayload {
	pub proposal_id: String,
	pub target: String,
	pub proposer: String,
	pub reason: String,
	pub proposed_at: i64,
	pub expires_at: i64,
	pub proposal_type: ProposalType,
}

impl BanProposalPayload {
	pub fn validate(&self) -> HiveResult<()> {
		check_pubkey("target", &self.target)?;
		check_pubkey("proposer", &self.proposer)?;
		check_reason("reason", &self.reason)?;
		if self.expires_at <= self.proposed_at {
			return Err(HiveError::new(HiveErrorKind::FieldOutOfRange, "expires_at <= proposed_at"));
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VoteChoice {
	Approve,
	Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BanVotePayload {
	pub proposal_id: String,
	pub voter: String,
	pub vote: VoteChoice,
	pub signature: String,
}

impl BanVotePayload {
	pub fn validate(&self) -> HiveResult<()> {
		check_pubkey("voter", &self.voter)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeeReportPayload {
	pub peer_id: String,
	pub period: String,
	pub fees_earned_sats: u64,
	pub forward_count: u64,
	pub rebalance_costs_sats: u64,
	pub period_start: i64,
	pub period_end: i64,
}

impl FeeReportPayload {
	pub fn validate(&self) -> HiveResult<()> {
		check_pubkey("peer_id", &self.peer_id)?;
		if self.period_end <= self.period_start {
			return Err(HiveError::new(HiveErrorKind::FieldOutOfRange, "period_end <= period_start"));
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SettlementProposePayload {
	pub proposal_id: String,
	pub period: String,
	pub proposer: String,
	pub data_hash: String,
	pub plan_hash: Option<String>,
	pub total_fees_sats: u64,
	pub member_count: u32,
	pub contributions_json: serde_json::Value,
	pub expires_at: i64,
}

impl SettlementProposePayload {
	pub fn validate(&self) -> HiveResult<()> {
		check_pubkey("proposer", &self.proposer)?;
		if self.member_count == 0 {
			return Err(HiveError::new(HiveErrorKind::FieldOutOfRange, "member_count is zero"));
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SettlementReadyPayload {
	pub proposal_id: String,
	pub voter: String,
	pub data_hash: String,
	pub signature: String,
}

impl SettlementReadyPayload {
	pub fn validate(&self) -> HiveResult<()> {
		check_pubkey("voter", &self.voter)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SettlementExecutedPayload {
	pub proposal_id: String,
	pub executor: String,
	pub payment_hash: Option<String>,
	pub amount_paid_sats: Option<u64>,
	pub plan_hash: Option<String>,
	pub signature: String,
}

impl SettlementExecutedPayload {
	pub fn validate(&self) -> HiveResult<()> {
		check_pubkey("executor", &self.executor)
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
	Ok,
	Invalid,
	RetryLater,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MsgAckPayload {
	pub msg_id: String,
	pub status: AckStatus,
}

impl MsgAckPayload {
	pub fn validate(&self) -> HiveResult<()> {
		if self.msg_id.is_empty() {
			return Err(HiveError::new(HiveErrorKind::FieldOutOfRange, "empty msg_id"));
		}
		Ok(())
	}
}

/// Static table: response type -> (request type it implicitly acks, the
/// payload field both share that identifies the specific request). Mirrors
/// `IMPLICIT_ACK_MAP` from spec.md §4.3 / DESIGN NOTES §9.
pub fn implicit_ack_target(response: HiveMessageType) -> Option<(HiveMessageType, &'static str)> {
	match response {
		HiveMessageType::Vouch => Some((HiveMessageType::PromotionRequest, "request_id")),
		HiveMessageType::Promotion => Some((HiveMessageType::PromotionRequest, "request_id")),
		HiveMessageType::BanVote => Some((HiveMessageType::BanProposal, "proposal_id")),
		HiveMessageType::SettlementReady => Some((HiveMessageType::SettlementPropose, "proposal_id")),
		HiveMessageType::SettlementExecuted => Some((HiveMessageType::SettlementReady, "proposal_id")),
		HiveMessageType::FullSyncResponse => Some((HiveMessageType::FullSyncRequest, "request_id")),
		HiveMessageType::Attest => Some((HiveMessageType::Hello, "node_pubkey")),
		_ => None,
	}
}

/// Each state-changing message type's identity-field tuple, used by
/// `idempotency::generate_event_id` (spec.md §4.2). Gossip/snapshot types are
/// intentionally absent — they are naturally idempotent via version-guarded
/// overwrite and are not tracked here.
pub fn identity_fields(msg_type: HiveMessageType) -> Option<&'static [&'static str]> {
	match msg_type {
		HiveMessageType::BanProposal => Some(&["proposal_id"]),
		HiveMessageType::BanVote => Some(&["proposal_id", "voter"]),
		HiveMessageType::FeeReport => Some(&["peer_id", "period_start"]),
		HiveMessageType::PromotionRequest => Some(&["request_id"]),
		HiveMessageType::Vouch => Some(&["request_id", "voucher"]),
		HiveMessageType::Promotion => Some(&["request_id", "target"]),
		HiveMessageType::MemberLeft => Some(&["peer_id", "timestamp"]),
		HiveMessageType::Intent => Some(&["id"]),
		HiveMessageType::IntentAbort => Some(&["id"]),
		HiveMessageType::SettlementPropose => Some(&["proposal_id"]),
		HiveMessageType::SettlementReady => Some(&["proposal_id", "voter"]),
		HiveMessageType::SettlementExecuted => Some(&["proposal_id", "executor"]),
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn code_roundtrip_covers_every_variant() {
		for code in (1u16..=65).step_by(2) {
			let t = HiveMessageType::from_code(code).expect("odd code should map to a variant");
			assert_eq!(t.code(), code);
		}
	}

	#[test]
	fn even_codes_are_unknown() {
		assert!(HiveMessageType::from_code(2).is_none());
	}

	#[test]
	fn rejects_bad_pubkey_length() {
		let payload = StateHashPayload {
			peer_id: "02short".to_string(),
			state_hash: "x".to_string(),
			membership_hash: "y".to_string(),
			version: 1,
		};
		assert!(payload.validate().is_err());
	}
}
