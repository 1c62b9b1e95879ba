//! Top-level orchestrator: wires every component together, owns the
//! in-memory caches and rate limiters, and runs the inbound pipeline and
//! background loops spec.md §4.10 names. Grounded on
//! `ldk-server/src/main.rs`'s boot/event-loop shape and
//! `ldk-server/src/service.rs`'s dispatch-by-path pattern, generalized here
//! to dispatch-by-message-type.

use std::sync::Arc;

use rand::seq::SliceRandom;

use crate::config::Config;
use crate::contribution::{self, RateCounters};
use crate::error::{HiveError, HiveErrorKind, HiveResult};
use crate::governance;
use crate::host::NodeHost;
use crate::idempotency;
use crate::intent::RemoteIntentCache;
use crate::membership;
use crate::metrics::Metrics;
use crate::outbox;
use crate::protocol::messages::{
	AckStatus as WireAckStatus, BanProposalPayload, BanVotePayload, FeeReportPayload,
	FullSyncRequestPayload, FullSyncResponsePayload, GossipPayload, HiveMessageType, IntentAbortPayload,
	IntentPayload, MemberLeftPayload, MsgAckPayload, PeerStateEntry, ProposalType, PromotionPayload,
	PromotionRequestPayload, SettlementExecutedPayload, SettlementProposePayload,
	SettlementReadyPayload, StateHashPayload, VoteChoice, VouchPayload,
};
use crate::protocol::{self, Frame};
use crate::rate_limit::{GlobalRateLimiter, RateLimiter};
use crate::relay::{self, DedupCache, GossipEnvelope};
use crate::settlement;
use crate::state_sync::{self, FullSyncLimiter};
use crate::store::{PeerStateRow, SettlementProposalRow, Store};

/// Everything the inbound pipeline needs beyond the message itself: the
/// transport-level sender, used to enforce identity binding (spec.md §4.10:
/// "the verified signature pubkey must equal both `reporter_id` and the
/// transport-level `peer_id`").
pub struct InboundContext<'a> {
	pub transport_peer_id: &'a str,
}

/// A node's own recomputation of a settlement period: the contributions it
/// derived, the `data_hash` over them, and the resulting shares and plan.
struct SettlementMaterials {
	contributions: Vec<settlement::MemberContribution>,
	data_hash: String,
	shares: Vec<settlement::FairShareResult>,
	plan: Vec<settlement::PaymentLeg>,
}

pub struct Coordinator {
	pub store: Store,
	pub host: Arc<dyn NodeHost>,
	pub config: Config,
	pub rate_limiter: RateLimiter,
	pub global_rate_limiter: GlobalRateLimiter,
	pub dedup: DedupCache,
	pub full_sync_limiter: FullSyncLimiter,
	pub remote_intent_cache: RemoteIntentCache,
	pub contribution_counters: RateCounters,
	pub metrics: Metrics,
}

impl Coordinator {
	pub fn new(store: Store, host: Arc<dyn NodeHost>, config: Config) -> Self {
		Self {
			store,
			host,
			config,
			rate_limiter: RateLimiter::new(),
			global_rate_limiter: GlobalRateLimiter::new(1, 500),
			dedup: DedupCache::new(),
			full_sync_limiter: FullSyncLimiter::new(),
			remote_intent_cache: RemoteIntentCache::new(),
			contribution_counters: RateCounters::new(),
			metrics: Metrics::new(),
		}
	}

	fn our_pubkey(&self) -> &str {
		self.host.our_pubkey()
	}

	fn is_tracked_type(&self, msg_type: HiveMessageType) -> bool {
		crate::protocol::messages::identity_fields(msg_type).is_some()
	}

	/// For message types that carry a `signature` field, returns
	/// `(claimed_signer_id, canonical_signing_payload)` built the same way
	/// the signer built it (`protocol::signing`'s per-type functions), so
	/// `verify_message` checks the signature over the same bytes that were
	/// signed rather than the raw frame (which would include the signature
	/// itself). Used to enforce spec.md §4.10's identity-binding check: the
	/// verified signer must equal both the claimed identity and the
	/// transport-level sender.
	fn signing_target(frame: &Frame) -> HiveResult<Option<(String, String)>> {
		use crate::protocol::signing::*;
		let out = match frame.msg_type {
			HiveMessageType::BanVote => {
				let p: BanVotePayload = parse(frame)?;
				Some((p.voter.clone(), get_ban_vote_signing_payload(&p)))
			}
			HiveMessageType::Vouch => {
				let p: VouchPayload = parse(frame)?;
				Some((p.voucher.clone(), get_vouch_signing_payload(&p)))
			}
			HiveMessageType::MemberLeft => {
				let p: MemberLeftPayload = parse(frame)?;
				Some((p.peer_id.clone(), get_member_left_signing_payload(&p)))
			}
			HiveMessageType::SettlementReady => {
				let p: SettlementReadyPayload = parse(frame)?;
				Some((p.voter.clone(), get_settlement_ready_signing_payload(&p)))
			}
			HiveMessageType::SettlementExecuted => {
				let p: SettlementExecutedPayload = parse(frame)?;
				Some((p.executor.clone(), get_settlement_executed_signing_payload(&p)))
			}
			_ => None,
		};
		Ok(out)
	}

	async fn enforce_identity_binding(
		&self,
		frame: &Frame,
		ctx: &InboundContext<'_>,
	) -> HiveResult<()> {
		let Some((claimed_id, canonical)) = Self::signing_target(frame)? else {
			return Ok(());
		};
		let Some(signature) = frame.payload.get("signature").and_then(|v| v.as_str()) else {
			return Err(HiveError::new(HiveErrorKind::SignatureInvalid, "missing signature"));
		};
		let verified = self.host.verify_message(&canonical, signature).await?;
		if !verified.verified || verified.pubkey.as_deref() != Some(claimed_id.as_str()) {
			return Err(HiveError::new(
				HiveErrorKind::SignatureInvalid,
				"signature does not match claimed identity",
			));
		}
		if claimed_id != ctx.transport_peer_id {
			return Err(HiveError::new(
				HiveErrorKind::IdentityBindingFailed,
				"claimed identity does not match transport peer_id",
			));
		}
		Ok(())
	}

	/// Inbound pipeline: verify framing -> ban/size gate -> rate-limit gate
	/// -> idempotency check -> dispatch. Returns the response frame to send
	/// back to the sender, if any (an explicit `MSG_ACK` or a domain
	/// response), per spec.md §4.10.
	pub async fn handle_inbound(
		&self,
		bytes: &[u8],
		ctx: InboundContext<'_>,
		now: i64,
	) -> HiveResult<Option<Frame>> {
		let frame = protocol::deserialize(bytes)?;

		if membership::is_banned(&self.store, ctx.transport_peer_id, now)? {
			return Err(HiveError::new(HiveErrorKind::NotAMember, "sender is banned"));
		}

		if !self.global_rate_limiter.allow(now) {
			return Err(HiveError::new(HiveErrorKind::GlobalRate, "global rate exceeded"));
		}
		if !self.rate_limiter.allow(ctx.transport_peer_id, frame.msg_type, now) {
			return Err(HiveError::new(HiveErrorKind::PerSenderRate, "per-sender rate exceeded"));
		}

		self.enforce_identity_binding(&frame, &ctx).await?;

		if self.is_tracked_type(frame.msg_type) {
			let (is_new, _event_id) = idempotency::check_and_record(
				&self.store,
				frame.msg_type,
				&frame.payload,
				ctx.transport_peer_id,
				now,
			)?;
			if !is_new {
				// Duplicate: idempotent no-op on the receiver path, still
				// ack so the sender can clear its outbox (spec.md §7).
				return Ok(ack_for(&frame, WireAckStatus::Ok));
			}
		}

		outbox::process_implicit_ack(&self.store, ctx.transport_peer_id, &frame)?;

		let dispatch_result = self.dispatch(&frame, ctx.transport_peer_id, now).await;
		match dispatch_result {
			Ok(response) => Ok(response.or_else(|| ack_for(&frame, WireAckStatus::Ok))),
			Err(e) if e.is_idempotent_noop() => Ok(ack_for(&frame, WireAckStatus::Ok)),
			Err(e) => Err(e),
		}
	}

	async fn dispatch(
		&self,
		frame: &Frame,
		sender: &str,
		now: i64,
	) -> HiveResult<Option<Frame>> {
		match frame.msg_type {
			HiveMessageType::Gossip => {
				let payload: GossipPayload = parse(frame)?;
				payload.validate()?;
				let row = PeerStateRow {
					peer_id: payload.peer_id.clone(),
					capacity_sats: payload.capacity_sats,
					available_sats: payload.available_sats,
					fee_policy: payload.fee_policy.clone(),
					topology: payload.topology.clone(),
					last_gossip: payload.last_gossip,
					state_hash: payload.state_hash.clone(),
					version: payload.version,
				};
				if !state_sync::merge_entry(&self.store, &row)? {
					return Err(HiveError::new(HiveErrorKind::VersionTooOld, "stale gossip version"));
				}
				self.relay_gossip(frame, sender, now).await?;
				Ok(None)
			}
			HiveMessageType::StateHash => {
				let payload: StateHashPayload = parse(frame)?;
				payload.validate()?;
				let local_hash = state_sync::current_state_hash(&self.store)?;
				if payload.state_hash != local_hash && self.full_sync_limiter.allow(sender, now) {
					let request = FullSyncRequestPayload {
						request_id: format!("fsr-{sender}-{now}"),
						requester_id: self.our_pubkey().to_string(),
					};
					return Ok(Some(Frame {
						version: frame.version,
						msg_type: HiveMessageType::FullSyncRequest,
						payload: serde_json::to_value(&request).expect("serializable"),
					}));
				}
				Ok(None)
			}
			HiveMessageType::FullSyncRequest => {
				let payload: FullSyncRequestPayload = parse(frame)?;
				payload.validate()?;
				let entries = state_sync::all_entries(&self.store)?
					.into_iter()
					.map(|e| PeerStateEntry {
						peer_id: e.peer_id,
						capacity_sats: e.capacity_sats,
						available_sats: e.available_sats,
						fee_policy: e.fee_policy,
						topology: e.topology,
						last_gossip: e.last_gossip,
						state_hash: e.state_hash,
						version: e.version,
					})
					.collect();
				let response =
					FullSyncResponsePayload { request_id: payload.request_id, entries };
				Ok(Some(Frame {
					version: frame.version,
					msg_type: HiveMessageType::FullSyncResponse,
					payload: serde_json::to_value(&response).expect("serializable"),
				}))
			}
			HiveMessageType::FullSyncResponse => {
				let payload: FullSyncResponsePayload = parse(frame)?;
				payload.validate()?;
				for entry in payload.entries {
					let row = PeerStateRow {
						peer_id: entry.peer_id,
						capacity_sats: entry.capacity_sats,
						available_sats: entry.available_sats,
						fee_policy: entry.fee_policy,
						topology: entry.topology,
						last_gossip: entry.last_gossip,
						state_hash: entry.state_hash,
						version: entry.version,
					};
					state_sync::merge_entry(&self.store, &row)?;
				}
				Ok(None)
			}
			HiveMessageType::Intent => {
				let payload: IntentPayload = parse(frame)?;
				payload.validate()?;
				if !crate::intent::within_clock_skew(payload.timestamp, now) {
					return Err(HiveError::new(HiveErrorKind::FieldOutOfRange, "intent timestamp skew"));
				}
				self.remote_intent_cache.touch(&payload.id);
				crate::intent::announce(
					&self.store,
					&payload.id,
					&payload.intent_type,
					&payload.target,
					&payload.initiator_pubkey,
					payload.timestamp,
					payload.expires_at - payload.timestamp,
				)
				.or_else(|e| if e.is_idempotent_noop() { Ok(()) } else { Err(e) })?;
				Ok(None)
			}
			HiveMessageType::IntentAbort => {
				let payload: IntentAbortPayload = parse(frame)?;
				payload.validate()?;
				self.store.with_conn(|conn| {
					conn.execute(
						"UPDATE intent_locks SET status = 'aborted', reason = ?1 WHERE id = ?2",
						rusqlite::params![payload.reason, payload.id],
					)?;
					Ok(())
				})?;
				Ok(None)
			}
			HiveMessageType::PromotionRequest => {
				let payload: PromotionRequestPayload = parse(frame)?;
				payload.validate()?;
				if membership::is_promotion_eligible(&self.store, &payload.target, now)? {
					let unsigned = VouchPayload {
						request_id: payload.request_id,
						target: payload.target,
						voucher: self.our_pubkey().to_string(),
						signature: String::new(),
					};
					let canonical = crate::protocol::signing::get_vouch_signing_payload(&unsigned);
					let signature = self.host.sign_message(&canonical).await?.signature;
					let vouch = VouchPayload { signature, ..unsigned };
					return Ok(Some(Frame {
						version: frame.version,
						msg_type: HiveMessageType::Vouch,
						payload: serde_json::to_value(&vouch).expect("serializable"),
					}));
				}
				Ok(None)
			}
			HiveMessageType::Vouch => {
				let payload: VouchPayload = parse(frame)?;
				payload.validate()?;
				let count = membership::record_vouch(&self.store, &payload.target)?;
				let total = membership::member_count(&self.store)?;
				if membership::vouch_quorum_met(count, total, self.config.vouch_quorum_fraction) {
					let promotion = PromotionPayload {
						request_id: payload.request_id,
						target: payload.target,
					};
					return Ok(Some(Frame {
						version: frame.version,
						msg_type: HiveMessageType::Promotion,
						payload: serde_json::to_value(&promotion).expect("serializable"),
					}));
				}
				Ok(None)
			}
			HiveMessageType::Promotion => {
				let payload: PromotionPayload = parse(frame)?;
				payload.validate()?;
				membership::apply_promotion(&self.store, &payload.target, now)?;
				Ok(None)
			}
			HiveMessageType::MemberLeft => {
				let payload: MemberLeftPayload = parse(frame)?;
				payload.validate()?;
				membership::apply_departure(&self.store, &payload.peer_id)?;
				Ok(None)
			}
			HiveMessageType::BanProposal => {
				let payload: BanProposalPayload = parse(frame)?;
				payload.validate()?;
				membership::open_ban_proposal(
					&self.store,
					&payload.proposal_id,
					&payload.target,
					&payload.proposer,
					&payload.reason,
					payload.proposal_type,
					payload.proposed_at,
					payload.expires_at,
				)?;
				Ok(None)
			}
			HiveMessageType::BanVote => {
				let payload: BanVotePayload = parse(frame)?;
				payload.validate()?;
				membership::record_ban_vote(
					&self.store,
					&payload.proposal_id,
					&payload.voter,
					payload.vote == VoteChoice::Approve,
					now,
					&payload.signature,
				)?;
				let total = membership::member_count(&self.store)?;
				if membership::evaluate_ban_quorum(
					&self.store,
					&payload.proposal_id,
					total,
					self.config.ban_quorum_fraction,
					now,
				)? {
					if let Some(target) =
						membership::ban_proposal_target(&self.store, &payload.proposal_id)?
					{
						membership::apply_ban(
							&self.store,
							&payload.proposal_id,
							&target,
							"quorum reached",
							&payload.voter,
							now,
						)?;
					}
				}
				Ok(None)
			}
			HiveMessageType::FeeReport => {
				let payload: FeeReportPayload = parse(frame)?;
				payload.validate()?;
				settlement::upsert_fee_report(
					&self.store,
					&crate::store::FeeReportRow {
						peer_id: payload.peer_id,
						period: payload.period,
						fees_earned_sats: payload.fees_earned_sats,
						forward_count: payload.forward_count,
						rebalance_costs_sats: payload.rebalance_costs_sats,
						period_start: payload.period_start,
						period_end: payload.period_end,
						received_at: now,
					},
				)?;
				Ok(None)
			}
			HiveMessageType::SettlementPropose => {
				let payload: SettlementProposePayload = parse(frame)?;
				payload.validate()?;
				settlement::create_proposal(
					&self.store,
					&payload.proposal_id,
					&payload.period,
					&payload.proposer,
					&payload.data_hash,
					payload.plan_hash.as_deref(),
					payload.total_fees_sats,
					payload.member_count,
					&payload.contributions_json.to_string(),
					now,
					payload.expires_at,
				)?;
				if let Some(proposal) = settlement::load_proposal(&self.store, &payload.proposal_id)? {
					self.vote_settlement_ready(&proposal, now).await?;
				}
				Ok(None)
			}
			HiveMessageType::SettlementReady => {
				let payload: SettlementReadyPayload = parse(frame)?;
				payload.validate()?;
				settlement::record_ready_vote(
					&self.store,
					&payload.proposal_id,
					&payload.voter,
					&payload.data_hash,
					now,
					&payload.signature,
				)?;
				settlement::evaluate_ready_quorum(
					&self.store,
					&payload.proposal_id,
					self.config.settlement_quorum_fraction,
				)?;
				Ok(None)
			}
			HiveMessageType::SettlementExecuted => {
				let payload: SettlementExecutedPayload = parse(frame)?;
				payload.validate()?;
				if let Some(proposal) = settlement::load_proposal(&self.store, &payload.proposal_id)? {
					// The payload reports that `executor` cleared all of its own
					// outgoing legs; recompute the plan locally and journal those
					// legs paid so our own copy of the ledger converges too.
					if let Some(materials) = self.build_settlement_materials(&proposal.period).await? {
						for leg in materials.plan.iter().filter(|leg| leg.from_peer == payload.executor) {
							settlement::journal_sub_payment(
								&self.store,
								&payload.proposal_id,
								leg,
								"paid",
								payload.payment_hash.as_deref(),
								now,
							)?;
						}
					}
					settlement::record_execution(
						&self.store,
						&payload.proposal_id,
						&proposal.period,
						&payload.executor,
						payload.payment_hash.as_deref(),
						payload.amount_paid_sats,
						payload.plan_hash.as_deref(),
						&payload.signature,
						now,
					)?;
				}
				Ok(None)
			}
			HiveMessageType::MsgAck => {
				let payload: MsgAckPayload = parse(frame)?;
				payload.validate()?;
				let status = match payload.status {
					crate::protocol::messages::AckStatus::Ok => outbox::AckStatus::Ok,
					crate::protocol::messages::AckStatus::Invalid => outbox::AckStatus::Invalid,
					crate::protocol::messages::AckStatus::RetryLater => outbox::AckStatus::RetryLater,
				};
				outbox::process_ack(&self.store, sender, &payload.msg_id, status)?;
				Ok(None)
			}
			// Out-of-scope intelligence/coordination types (spec.md §1:
			// "topology planners, fee optimizers, and anticipatory-liquidity
			// predictors that produce intelligence consumed by the core")
			// are framed and relayed but not deeply interpreted here.
			_ => Ok(None),
		}
	}

	/// Background loop: outbox retry (spec.md §4.10, every 30s).
	pub async fn outbox_retry_tick(&self, now: i64) -> HiveResult<()> {
		outbox::retry_due(&self.store, self.host.as_ref(), now, 100).await?;
		Ok(())
	}

	/// Background loop: outbox expire/cleanup (hourly).
	pub fn outbox_expire_tick(&self, now: i64) -> HiveResult<()> {
		outbox::expire_and_cleanup(&self.store, now)?;
		Ok(())
	}

	/// Background loop: intent expiry/commit sweep (every 10s).
	pub fn intent_tick(&self, now: i64) -> HiveResult<Vec<String>> {
		let losers = crate::intent::resolve_due(&self.store, now)?;
		crate::intent::recover_and_purge(&self.store, now)?;
		Ok(losers)
	}

	/// Relays a freshly-merged `Gossip` frame to directly connected members,
	/// decrementing TTL and tracking the hop path, deduped against a recent
	/// rebroadcast of the same payload (spec.md's gossip relay, grounded on
	/// `modules/relay.py`).
	async fn relay_gossip(&self, frame: &Frame, sender: &str, now: i64) -> HiveResult<()> {
		if !self.dedup.record_if_new(&frame.payload, now) {
			return Ok(());
		}
		let ttl = frame.payload.get("ttl").and_then(|v| v.as_u64()).unwrap_or(relay::DEFAULT_TTL as u64) as u8;
		let mut path: Vec<String> = frame
			.payload
			.get("path")
			.and_then(|v| v.as_array())
			.map(|a| a.iter().filter_map(|x| x.as_str().map(str::to_string)).collect())
			.unwrap_or_default();
		if !path.contains(&sender.to_string()) {
			path.push(sender.to_string());
		}
		let envelope = GossipEnvelope { ttl, path };
		let peers = self.host.list_peers().await?;
		let targets = relay::relay_targets(&envelope, &peers);
		if targets.is_empty() {
			return Ok(());
		}
		let advanced = relay::advance_envelope(&envelope, self.our_pubkey());
		let mut payload = frame.payload.clone();
		payload["ttl"] = serde_json::json!(advanced.ttl);
		payload["path"] = serde_json::json!(advanced.path);
		let peer_id = payload.get("peer_id").and_then(|v| v.as_str()).unwrap_or("unknown");
		let msg_id = format!("gossip-relay-{peer_id}-{}-{now}", payload.get("version").and_then(|v| v.as_i64()).unwrap_or(0));
		outbox::enqueue(
			&self.store,
			self.our_pubkey(),
			&msg_id,
			HiveMessageType::Gossip,
			&payload.to_string(),
			&targets,
			now,
		)?;
		Ok(())
	}

	/// Background loop: anti-entropy (every 2 min). Picks one random peer and
	/// exchanges `STATE_HASH` (spec.md §4.9: "each node picks a peer").
	pub async fn anti_entropy_tick(&self, now: i64) -> HiveResult<()> {
		let peers = self.host.list_peers().await?;
		let Some(peer_id) = peers.choose(&mut rand::thread_rng()) else {
			return Ok(());
		};
		let state_hash = state_sync::current_state_hash(&self.store)?;
		let members = membership::list_members(&self.store)?
			.into_iter()
			.map(|m| (m.peer_id, m.tier.as_str().to_string()))
			.collect::<Vec<_>>();
		let membership_hash = state_sync::compute_membership_hash(&members);
		let payload = StateHashPayload {
			peer_id: self.our_pubkey().to_string(),
			state_hash,
			membership_hash,
			version: now as u64,
		};
		let frame = Frame {
			version: 1,
			msg_type: HiveMessageType::StateHash,
			payload: serde_json::to_value(&payload).expect("serializable"),
		};
		let bytes = protocol::serialize(&frame)?;
		self.host.send_custom_message(peer_id, bytes).await?;
		Ok(())
	}

	/// Recomputes contributions, fair shares, and the payment plan for
	/// `period` from this node's own fee-report store (spec.md §4.9 step 4:
	/// "every member independently recomputes contributions from its own
	/// fee-report store"). `None` if no member has filed a fee report for
	/// the period yet. Capacity for peers comes from gossiped state; our own
	/// capacity comes straight from the host, since we never gossip to
	/// ourselves.
	async fn build_settlement_materials(&self, period: &str) -> HiveResult<Option<SettlementMaterials>> {
		let reports = settlement::fee_reports_for_period(&self.store, period)?;
		if reports.is_empty() {
			return Ok(None);
		}
		let mut capacity_by_peer: std::collections::HashMap<String, u64> = state_sync::all_entries(&self.store)?
			.into_iter()
			.map(|e| (e.peer_id, e.capacity_sats))
			.collect();
		let our_capacity: u64 = self.host.list_peer_channels().await?.iter().map(|c| c.capacity_sats).sum();
		capacity_by_peer.insert(self.our_pubkey().to_string(), our_capacity);
		let uptime_by_peer: std::collections::HashMap<String, f64> = membership::list_members(&self.store)?
			.into_iter()
			.map(|m| (m.peer_id, m.uptime_pct))
			.collect();
		let contributions: Vec<settlement::MemberContribution> = reports
			.iter()
			.map(|r| settlement::MemberContribution {
				peer_id: r.peer_id.clone(),
				fees_earned_sats: r.fees_earned_sats,
				forward_count: r.forward_count,
				capacity_sats: capacity_by_peer.get(&r.peer_id).copied().unwrap_or(0),
				uptime_pct: uptime_by_peer.get(&r.peer_id).copied().unwrap_or(1.0),
			})
			.collect();
		let data_hash = settlement::compute_data_hash(&contributions);
		let shares = settlement::compute_fair_shares(&contributions, self.config.settlement_weights);
		let plan = settlement::build_payment_plan(&shares);
		Ok(Some(SettlementMaterials { contributions, data_hash, shares, plan }))
	}

	/// Elects a proposer for `period` (spec.md §4.9 step 2: "deterministic
	/// election by lowest `peer_id` among participating members") and, if we
	/// are it, constructs and broadcasts `SETTLEMENT_PROPOSE`, then casts our
	/// own `SETTLEMENT_READY` vote since we never receive our own broadcast.
	async fn originate_settlement_proposal(&self, period: &str, now: i64) -> HiveResult<()> {
		let reports = settlement::fee_reports_for_period(&self.store, period)?;
		let Some(proposer) = settlement::elect_proposer(&reports) else {
			return Ok(());
		};
		if proposer != self.our_pubkey() {
			return Ok(());
		}
		let Some(materials) = self.build_settlement_materials(period).await? else {
			return Ok(());
		};
		let plan_hash = settlement::compute_plan_hash(&materials.plan);
		let total_fees_sats: u64 = materials.contributions.iter().map(|c| c.fees_earned_sats).sum();
		let member_count = materials.contributions.len() as u32;
		let proposal_id = format!("settlement-{period}-{now}");
		let expires_at = now + settlement::SETTLEMENT_GAMING_GRACE_SECONDS;
		let contributions_json = settlement::contributions_to_json(&materials.contributions);

		settlement::create_proposal(
			&self.store,
			&proposal_id,
			period,
			self.our_pubkey(),
			&materials.data_hash,
			Some(&plan_hash),
			total_fees_sats,
			member_count,
			&contributions_json.to_string(),
			now,
			expires_at,
		)?;

		let propose = SettlementProposePayload {
			proposal_id: proposal_id.clone(),
			period: period.to_string(),
			proposer: self.our_pubkey().to_string(),
			data_hash: materials.data_hash.clone(),
			plan_hash: Some(plan_hash),
			total_fees_sats,
			member_count,
			contributions_json,
			expires_at,
		};
		let members = membership::list_members(&self.store)?
			.into_iter()
			.map(|m| m.peer_id)
			.collect::<Vec<_>>();
		let payload_json = serde_json::to_string(&propose).expect("serializable");
		let msg_id = format!("settlement-propose-{proposal_id}");
		outbox::enqueue(
			&self.store,
			self.our_pubkey(),
			&msg_id,
			HiveMessageType::SettlementPropose,
			&payload_json,
			&members,
			now,
		)?;

		if let Some(proposal) = settlement::load_proposal(&self.store, &proposal_id)? {
			self.vote_settlement_ready(&proposal, now).await?;
		}
		Ok(())
	}

	/// Recomputes `proposal`'s contributions locally and, if our `data_hash`
	/// matches, records and broadcasts a signed `SETTLEMENT_READY` vote
	/// (spec.md §4.9 step 4). A mismatch is a silent abstention.
	async fn vote_settlement_ready(&self, proposal: &SettlementProposalRow, now: i64) -> HiveResult<()> {
		let Some(materials) = self.build_settlement_materials(&proposal.period).await? else {
			return Ok(());
		};
		if materials.data_hash != proposal.data_hash {
			log::info!(
				"settlement: recomputed data_hash diverges from proposal {}, abstaining",
				proposal.proposal_id
			);
			return Ok(());
		}
		let unsigned = SettlementReadyPayload {
			proposal_id: proposal.proposal_id.clone(),
			voter: self.our_pubkey().to_string(),
			data_hash: materials.data_hash,
			signature: String::new(),
		};
		let canonical = crate::protocol::signing::get_settlement_ready_signing_payload(&unsigned);
		let signature = self.host.sign_message(&canonical).await?.signature;
		settlement::record_ready_vote(
			&self.store,
			&proposal.proposal_id,
			self.our_pubkey(),
			&unsigned.data_hash,
			now,
			&signature,
		)?;
		settlement::evaluate_ready_quorum(&self.store, &proposal.proposal_id, self.config.settlement_quorum_fraction)?;

		let ready = SettlementReadyPayload { signature, ..unsigned };
		let members = membership::list_members(&self.store)?
			.into_iter()
			.map(|m| m.peer_id)
			.collect::<Vec<_>>();
		let payload_json = serde_json::to_string(&ready).expect("serializable");
		let msg_id = format!("settlement-ready-{}-{}", proposal.proposal_id, self.our_pubkey());
		outbox::enqueue(
			&self.store,
			self.our_pubkey(),
			&msg_id,
			HiveMessageType::SettlementReady,
			&payload_json,
			&members,
			now,
		)?;
		Ok(())
	}

	/// Once `proposal` is `ready`, executes our own legs if we hold a
	/// negative balance (spec.md §4.9 step 6: "each member with a negative
	/// balance executes its payment plan"), journals them paid, and
	/// broadcasts `SETTLEMENT_EXECUTED`. A no-op if we already executed or
	/// hold no debt.
	async fn execute_settlement_if_debtor(&self, proposal: &SettlementProposalRow, now: i64) -> HiveResult<()> {
		if settlement::has_executed(&self.store, &proposal.proposal_id, self.our_pubkey())? {
			return Ok(());
		}
		let Some(materials) = self.build_settlement_materials(&proposal.period).await? else {
			return Ok(());
		};
		let Some(my_share) = materials.shares.iter().find(|s| s.peer_id == self.our_pubkey()) else {
			return Ok(());
		};
		if my_share.balance_sats >= 0 {
			return Ok(());
		}
		let our_legs: Vec<_> =
			materials.plan.iter().filter(|leg| leg.from_peer == self.our_pubkey()).collect();
		let mut total_paid_sats = 0u64;
		let mut last_payment_hash = None;
		for leg in &our_legs {
			let invoice = self.host.fetch_invoice(&leg.to_peer, leg.amount_sats as u64 * 1000).await?;
			let payment_hash = self.host.pay(&invoice).await?;
			settlement::journal_sub_payment(
				&self.store,
				&proposal.proposal_id,
				leg,
				"paid",
				Some(&payment_hash),
				now,
			)?;
			total_paid_sats += leg.amount_sats as u64;
			last_payment_hash = Some(payment_hash);
		}

		let plan_hash = settlement::compute_plan_hash(&materials.plan);
		let unsigned = SettlementExecutedPayload {
			proposal_id: proposal.proposal_id.clone(),
			executor: self.our_pubkey().to_string(),
			payment_hash: last_payment_hash,
			amount_paid_sats: Some(total_paid_sats),
			plan_hash: Some(plan_hash),
			signature: String::new(),
		};
		let canonical = crate::protocol::signing::get_settlement_executed_signing_payload(&unsigned);
		let signature = self.host.sign_message(&canonical).await?.signature;
		let executed = SettlementExecutedPayload { signature: signature.clone(), ..unsigned };

		settlement::record_execution(
			&self.store,
			&proposal.proposal_id,
			&proposal.period,
			self.our_pubkey(),
			executed.payment_hash.as_deref(),
			executed.amount_paid_sats,
			executed.plan_hash.as_deref(),
			&signature,
			now,
		)?;

		let members = membership::list_members(&self.store)?
			.into_iter()
			.map(|m| m.peer_id)
			.collect::<Vec<_>>();
		let payload_json = serde_json::to_string(&executed).expect("serializable");
		let msg_id = format!("settlement-executed-{}-{}", proposal.proposal_id, self.our_pubkey());
		outbox::enqueue(
			&self.store,
			self.our_pubkey(),
			&msg_id,
			HiveMessageType::SettlementExecuted,
			&payload_json,
			&members,
			now,
		)?;
		Ok(())
	}

	/// Background loop: settlement tick (hourly) — elects a proposer and
	/// originates the prior period's proposal, rebroadcasts any pending
	/// proposal whose `last_broadcast_at` is stale, and executes our own
	/// payment legs once a proposal reaches `ready` (spec.md §4.9).
	pub async fn settlement_tick(&self, now: i64) -> HiveResult<()> {
		let current_period = settlement::period_for(now);
		if let Some((period_start, _)) = settlement::period_bounds(&current_period) {
			let prev_period = settlement::period_for(period_start - 1);
			if !settlement::is_period_settled(&self.store, &prev_period)?
				&& settlement::period_details(&self.store, &prev_period)?.is_none()
			{
				self.originate_settlement_proposal(&prev_period, now).await?;
			}
		}

		let pending = settlement::pending_proposals(&self.store)?;
		if !pending.is_empty() {
			let members = membership::list_members(&self.store)?
				.into_iter()
				.map(|m| m.peer_id)
				.collect::<Vec<_>>();
			for proposal in pending {
				if !settlement::needs_rebroadcast(&proposal, now) {
					continue;
				}
				let contributions_json: serde_json::Value = proposal
					.contributions_json
					.as_deref()
					.and_then(|s| serde_json::from_str(s).ok())
					.unwrap_or(serde_json::Value::Null);
				let propose = SettlementProposePayload {
					proposal_id: proposal.proposal_id.clone(),
					period: proposal.period.clone(),
					proposer: proposal.proposer.clone(),
					data_hash: proposal.data_hash.clone(),
					plan_hash: proposal.plan_hash.clone(),
					total_fees_sats: proposal.total_fees_sats,
					member_count: proposal.member_count,
					contributions_json,
					expires_at: proposal.expires_at,
				};
				let payload_json = serde_json::to_string(&propose).expect("serializable");
				let msg_id = format!("settlement-rebroadcast-{}-{now}", proposal.proposal_id);
				outbox::enqueue(
					&self.store,
					self.our_pubkey(),
					&msg_id,
					HiveMessageType::SettlementPropose,
					&payload_json,
					&members,
					now,
				)?;
				settlement::mark_rebroadcast(&self.store, &proposal.proposal_id, now)?;
			}
		}

		for proposal in settlement::ready_proposals(&self.store)? {
			self.execute_settlement_if_debtor(&proposal, now).await?;
		}
		Ok(())
	}

	/// Background loop: contribution-ledger recording from the node's own
	/// recent forwarding events (spec.md §4.8). Not on a fixed cadence named
	/// in §4.10; run it alongside the outbox retry loop (every 30s) since
	/// both are cheap, idempotent sweeps.
	pub async fn contribution_tick(&self, now: i64) -> HiveResult<usize> {
		let channels = self.host.list_peer_channels().await?;
		let channel_map: std::collections::HashMap<String, String> =
			channels.into_iter().map(|c| (c.channel_id, c.peer_id)).collect();
		let forwards = self.host.list_forwards().await?;
		let mut recorded = 0usize;
		for event in &forwards {
			recorded += contribution::record_forward(
				&self.store,
				&self.contribution_counters,
				&channel_map,
				event,
				|peer_id| is_member(&self.store, peer_id),
				now,
			)?;
		}
		Ok(recorded)
	}

	/// Background loop: leech detection (spec.md §4.8). Recomputes each
	/// member's contribution ratio, updates the persisted leech flag, and on
	/// a new flag either raises a `standard` ban proposal (autotrigger) or
	/// queues an operator review action.
	pub async fn leech_tick(&self, now: i64) -> HiveResult<()> {
		let members = membership::list_members(&self.store)?;
		for member in members {
			let ratio = contribution::contribution_ratio(&self.store, &member.peer_id, now)?;
			let evaluation = contribution::evaluate_leech_status(
				ratio,
				member.leech_watch_since,
				member.leech_flagged,
				now,
			);
			if evaluation.watch_since != member.leech_watch_since {
				membership::set_leech_watch_since(&self.store, &member.peer_id, evaluation.watch_since)?;
			}
			let flagged = evaluation.flagged;
			if flagged == member.leech_flagged {
				continue;
			}
			membership::set_leech_flag(&self.store, &member.peer_id, flagged)?;
			if !flagged {
				continue;
			}
			if self.config.ban_autotrigger_enabled {
				let proposal_id = format!("ban-leech-{}-{now}", member.peer_id);
				let expires_at = now + membership::BAN_PROPOSAL_VOTING_SECONDS;
				membership::open_ban_proposal(
					&self.store,
					&proposal_id,
					&member.peer_id,
					self.our_pubkey(),
					"leech detection: contribution ratio below ban threshold",
					ProposalType::Standard,
					now,
					expires_at,
				)
				.or_else(|e| if e.is_idempotent_noop() { Ok(()) } else { Err(e) })?;
				let ban_proposal = BanProposalPayload {
					proposal_id: proposal_id.clone(),
					target: member.peer_id.clone(),
					proposer: self.our_pubkey().to_string(),
					reason: "leech detection: contribution ratio below ban threshold".to_string(),
					proposed_at: now,
					expires_at,
					proposal_type: ProposalType::Standard,
				};
				let payload_json = serde_json::to_string(&ban_proposal).expect("serializable");
				let targets = membership::list_members(&self.store)?
					.into_iter()
					.map(|m| m.peer_id)
					.filter(|id| id != self.our_pubkey())
					.collect::<Vec<_>>();
				outbox::enqueue(
					&self.store,
					self.our_pubkey(),
					&proposal_id,
					HiveMessageType::BanProposal,
					&payload_json,
					&targets,
					now,
				)?;
			} else {
				governance::propose_action(
					&self.store,
					"leech_review",
					&member.peer_id,
					&serde_json::json!({ "contribution_ratio": ratio }).to_string(),
					now,
				)?;
			}
		}
		Ok(())
	}

	/// Background loop: pruning (daily).
	pub fn pruning_tick(&self, now: i64) -> HiveResult<()> {
		idempotency::prune(&self.store, now)?;
		Ok(())
	}
}

fn is_member(store: &Store, peer_id: &str) -> HiveResult<bool> {
	store.with_conn(|conn| {
		let count: i64 =
			conn.query_row("SELECT COUNT(*) FROM members WHERE peer_id = ?1", [peer_id], |r| r.get(0))?;
		Ok(count > 0)
	})
}

fn parse<T: serde::de::DeserializeOwned>(frame: &Frame) -> HiveResult<T> {
	serde_json::from_value(frame.payload.clone())
		.map_err(|e| HiveError::new(HiveErrorKind::MalformedJson, e.to_string()))
}

fn ack_for(frame: &Frame, status: WireAckStatus) -> Option<Frame> {
	let msg_id = frame
		.payload
		.get("id")
		.or_else(|| frame.payload.get("proposal_id"))
		.or_else(|| frame.payload.get("request_id"))
		.and_then(|v| v.as_str())?
		.to_string();
	let ack = MsgAckPayload { msg_id, status };
	Some(Frame {
		version: frame.version,
		msg_type: HiveMessageType::MsgAck,
		payload: serde_json::to_value(&ack).expect("serializable"),
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::host::TestSigner;
	use crate::store::test_store;

	fn test_config() -> Config {
		Config {
			our_pubkey: "02".to_string() + &"a".repeat(64),
			storage_dir_path: std::env::temp_dir(),
			rest_service_addr: "127.0.0.1:0".parse().unwrap(),
			intent_hold_seconds: 60,
			clock_skew_tolerance_seconds: 300,
			max_remote_intents: 200,
			state_heartbeat_seconds: 1800,
			anti_entropy_seconds: 120,
			gossip_capacity_change_threshold: 0.1,
			full_sync_cooldown_seconds: 60,
			contribution_window_days: 30,
			leech_warn_ratio: 0.5,
			leech_ban_ratio: 0.4,
			leech_window_days: 7,
			ban_autotrigger_enabled: false,
			settlement_quorum_fraction: 0.51,
			settlement_rebroadcast_seconds: 21_600,
			settlement_weights: crate::config::SettlementWeights::default(),
			ban_quorum_fraction: 0.51,
			governance_mode: crate::config::GovernanceMode::Advisor,
			outbox: crate::config::OutboxConfig::default(),
			min_channel_size_sats: 20_000,
			max_channel_size_sats: 16_777_215,
			vouch_quorum_fraction: 2.0 / 3.0,
			log_level: log::LevelFilter::Info,
			log_file_path: None,
		}
	}

	#[tokio::test]
	async fn duplicate_ban_vote_acks_without_error() {
		let store = test_store();
		let host: Arc<dyn NodeHost> = Arc::new(TestSigner::new("02".to_string() + &"a".repeat(64)));
		let coordinator = Coordinator::new(store, host, test_config());
		membership::open_ban_proposal(
			&coordinator.store,
			"p1",
			&("03".to_string() + &"b".repeat(64)),
			&("02".to_string() + &"c".repeat(64)),
			"reason",
			crate::protocol::messages::ProposalType::Standard,
			0,
			1000,
		)
		.unwrap();
		let voter = "02".to_string() + &"d".repeat(64);
		let unsigned = BanVotePayload {
			proposal_id: "p1".to_string(),
			voter: voter.clone(),
			vote: VoteChoice::Approve,
			signature: String::new(),
		};
		let canonical = crate::protocol::signing::get_ban_vote_signing_payload(&unsigned);
		let vote = BanVotePayload { signature: format!("sig:{canonical}:{voter}"), ..unsigned };
		let frame = Frame {
			version: 1,
			msg_type: HiveMessageType::BanVote,
			payload: serde_json::to_value(&vote).unwrap(),
		};
		let bytes = protocol::serialize(&frame).unwrap();
		let ctx = || InboundContext { transport_peer_id: &vote.voter };
		let first = coordinator.handle_inbound(&bytes, ctx(), 10).await.unwrap();
		let second = coordinator.handle_inbound(&bytes, ctx(), 11).await.unwrap();
		assert!(first.is_some());
		assert!(second.is_some());
	}

	fn seed_depleted_member(store: &Store, peer_id: &str, now: i64) {
		membership::record_join(store, peer_id, now).unwrap();
		store
			.with_conn(|conn| {
				conn.execute(
					"INSERT INTO contribution_events (peer_id, direction, amount_sats, timestamp) \
					 VALUES (?1, 'received', 100, ?2)",
					rusqlite::params![peer_id, now],
				)?;
				Ok(())
			})
			.unwrap();
	}

	#[tokio::test]
	async fn leech_tick_queues_review_when_autotrigger_disabled() {
		let store = test_store();
		let host: Arc<dyn NodeHost> = Arc::new(TestSigner::new("02".to_string() + &"a".repeat(64)));
		let peer = "03".to_string() + &"b".repeat(64);
		seed_depleted_member(&store, &peer, 1_000);
		let coordinator = Coordinator::new(store, host, test_config());
		coordinator.leech_tick(1_000).await.unwrap();
		let watching = membership::list_members(&coordinator.store)
			.unwrap()
			.into_iter()
			.find(|m| m.peer_id == peer)
			.unwrap();
		assert!(!watching.leech_flagged, "a single depressed sample only starts the watch window");
		assert_eq!(watching.leech_watch_since, Some(1_000));

		let past_window = 1_000 + contribution::LEECH_WINDOW_DAYS * 86_400;
		coordinator.leech_tick(past_window).await.unwrap();
		let member = membership::list_members(&coordinator.store)
			.unwrap()
			.into_iter()
			.find(|m| m.peer_id == peer)
			.unwrap();
		assert!(member.leech_flagged);
		let pending = governance::list_pending(&coordinator.store).unwrap();
		assert_eq!(pending.len(), 1);
		assert_eq!(pending[0].target, peer);
	}

	#[tokio::test]
	async fn leech_tick_raises_ban_proposal_when_autotrigger_enabled() {
		let store = test_store();
		let host: Arc<dyn NodeHost> = Arc::new(TestSigner::new("02".to_string() + &"a".repeat(64)));
		let peer = "03".to_string() + &"c".repeat(64);
		seed_depleted_member(&store, &peer, 1_000);
		let mut config = test_config();
		config.ban_autotrigger_enabled = true;
		let coordinator = Coordinator::new(store, host, config);
		coordinator.leech_tick(1_000).await.unwrap();
		let past_window = 1_000 + contribution::LEECH_WINDOW_DAYS * 86_400;
		coordinator.leech_tick(past_window).await.unwrap();
		let target =
			membership::ban_proposal_target(&coordinator.store, &format!("ban-leech-{peer}-{past_window}"))
				.unwrap();
		assert_eq!(target, Some(peer));
	}

	#[tokio::test]
	async fn settlement_tick_elects_self_as_sole_proposer_and_self_votes() {
		let store = test_store();
		let our_pubkey = "02".to_string() + &"a".repeat(64);
		let host: Arc<dyn NodeHost> = Arc::new(TestSigner::new(our_pubkey.clone()));
		let coordinator = Coordinator::new(store, host, test_config());

		let now = 10_000_000;
		let current_period = settlement::period_for(now);
		let (period_start, _) = settlement::period_bounds(&current_period).unwrap();
		let prev_period = settlement::period_for(period_start - 1);
		settlement::upsert_fee_report(
			&coordinator.store,
			&crate::store::FeeReportRow {
				peer_id: our_pubkey.clone(),
				period: prev_period.clone(),
				fees_earned_sats: 0,
				forward_count: 0,
				rebalance_costs_sats: 0,
				period_start: period_start - 7 * 86_400,
				period_end: period_start,
				received_at: now,
			},
		)
		.unwrap();

		coordinator.settlement_tick(now).await.unwrap();

		let proposal = settlement::period_details(&coordinator.store, &prev_period)
			.unwrap()
			.expect("we are the sole contributor and elect ourselves proposer")
			.0;
		assert_eq!(proposal.proposer, our_pubkey);
		// Sole member, quorum clears on our own self-vote.
		assert_eq!(proposal.status, crate::store::SettlementStatus::Ready);
	}
}
