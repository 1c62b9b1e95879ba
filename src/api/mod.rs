//! Operator HTTP surface. Grounded on `ldk-server/src/service.rs`'s
//! `Context` + per-endpoint-handler-function shape, adapted from that
//! crate's raw `hyper::Service` + protobuf wire format to `axum::Router` +
//! JSON (this crate carries no `prost`/`ldk-server-protos` dependency; see
//! DESIGN.md). Endpoints implement spec.md §6's operator contract:
//! `members()`, `propose_action`/`approve_action`/`reject_action`, plus the
//! read-only settlement history/reporting and outbox-stats surfaces
//! SPEC_FULL.md §11 adds.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::coordinator::Coordinator;
use crate::error::HiveError;
use crate::governance;
use crate::membership;
use crate::outbox;
use crate::settlement::{self, SubPaymentRow};
use crate::store::{Member, PendingActionRow, SettlementProposalRow};

#[derive(Clone)]
pub struct ApiState {
	pub coordinator: Arc<Coordinator>,
}

pub fn router(state: ApiState) -> Router {
	Router::new()
		.route("/v1/members", get(get_members))
		.route("/v1/actions", post(propose_action))
		.route("/v1/actions/:id/approve", post(approve_action))
		.route("/v1/actions/:id/reject", post(reject_action))
		.route("/v1/metrics", get(get_metrics))
		.route("/v1/outbox/stats", get(get_outbox_stats))
		.route("/v1/settlement/history", get(get_settlement_history))
		.route("/v1/settlement/periods/:period", get(get_period_details))
		.route("/v1/settlement/members/:peer_id/history", get(get_member_settlement_history))
		.with_state(state)
}

fn now() -> i64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.expect("system clock before epoch")
		.as_secs() as i64
}

/// Wraps `HiveError` for the operator surface: domain errors map to 400,
/// anything else to 500, mirroring `server/src/api/error.rs`'s
/// message/error_code split.
struct ApiError(HiveError);

impl From<HiveError> for ApiError {
	fn from(e: HiveError) -> Self {
		ApiError(e)
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let status = match &self.0 {
			HiveError::Domain { .. } => StatusCode::BAD_REQUEST,
			HiveError::Db(_) | HiveError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
		};
		let body = json!({
			"error": self.0.to_string(),
			"error_code": self.0.kind().map(|k| k.as_str()),
		});
		(status, Json(body)).into_response()
	}
}

fn member_json(m: Member) -> Value {
	json!({
		"peer_id": m.peer_id,
		"tier": m.tier.as_str(),
		"joined_at": m.joined_at,
		"promoted_at": m.promoted_at,
		"contribution_ratio": m.contribution_ratio,
		"uptime_pct": m.uptime_pct * 100.0,
		"vouch_count": m.vouch_count,
		"last_seen": m.last_seen,
		"leech_flagged": m.leech_flagged,
	})
}

/// `GET /v1/members`: live roster with `contribution_ratio` and `uptime_pct`
/// as a percentage in `[0, 100]` (spec.md §6).
async fn get_members(State(state): State<ApiState>) -> Result<Json<Value>, ApiError> {
	let members = membership::list_members(&state.coordinator.store)?;
	Ok(Json(json!({ "members": members.into_iter().map(member_json).collect::<Vec<_>>() })))
}

#[derive(Deserialize)]
struct ProposeActionRequest {
	action_type: String,
	target: String,
	context: Value,
}

fn pending_action_json(a: PendingActionRow) -> Value {
	json!({
		"id": a.id,
		"action_type": a.action_type,
		"target": a.target,
		"context": a.context,
		"status": a.status.as_str(),
		"created_at": a.created_at,
		"decided_at": a.decided_at,
		"reason": a.reason,
	})
}

/// `POST /v1/actions`: `propose_action(action_type, target, context) ->
/// decision_packet` (spec.md §6).
async fn propose_action(
	State(state): State<ApiState>,
	Json(req): Json<ProposeActionRequest>,
) -> Result<Json<Value>, ApiError> {
	let action = governance::propose_action(
		&state.coordinator.store,
		&req.action_type,
		&req.target,
		&req.context.to_string(),
		now(),
	)?;
	Ok(Json(pending_action_json(action)))
}

async fn approve_action(
	State(state): State<ApiState>,
	Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
	let action = governance::approve_action(&state.coordinator.store, id, now())?;
	Ok(Json(pending_action_json(action)))
}

#[derive(Deserialize, Default)]
struct RejectActionRequest {
	reason: Option<String>,
}

async fn reject_action(
	State(state): State<ApiState>,
	Path(id): Path<i64>,
	body: Option<Json<RejectActionRequest>>,
) -> Result<Json<Value>, ApiError> {
	let reason = body.and_then(|Json(r)| r.reason);
	let action = governance::reject_action(&state.coordinator.store, id, reason.as_deref(), now())?;
	Ok(Json(pending_action_json(action)))
}

/// `GET /v1/metrics`: Prometheus text exposition, refreshed on read.
async fn get_metrics(State(state): State<ApiState>) -> Result<String, ApiError> {
	state.coordinator.metrics.refresh(&state.coordinator.store)?;
	Ok(state.coordinator.metrics.render())
}

async fn get_outbox_stats(State(state): State<ApiState>) -> Result<Json<Value>, ApiError> {
	let pending = outbox::pending_count(&state.coordinator.store)?;
	Ok(Json(json!({ "pending_count": pending })))
}

fn proposal_json(p: SettlementProposalRow) -> Value {
	json!({
		"proposal_id": p.proposal_id,
		"period": p.period,
		"proposer": p.proposer,
		"proposed_at": p.proposed_at,
		"expires_at": p.expires_at,
		"status": p.status.as_str(),
		"total_fees_sats": p.total_fees_sats,
		"member_count": p.member_count,
	})
}

fn sub_payment_json(s: SubPaymentRow) -> Value {
	json!({
		"proposal_id": s.proposal_id,
		"from_peer": s.from_peer,
		"to_peer": s.to_peer,
		"amount_sats": s.amount_sats,
		"status": s.status,
		"payment_hash": s.payment_hash,
		"updated_at": s.updated_at,
	})
}

/// `GET /v1/settlement/history`: `get_settlement_history` (SPEC_FULL.md
/// §11), most recent first.
async fn get_settlement_history(State(state): State<ApiState>) -> Result<Json<Value>, ApiError> {
	let history = settlement::settlement_history(&state.coordinator.store)?;
	Ok(Json(json!({ "proposals": history.into_iter().map(proposal_json).collect::<Vec<_>>() })))
}

/// `GET /v1/settlement/periods/:period`: `get_period_details`.
async fn get_period_details(
	State(state): State<ApiState>,
	Path(period): Path<String>,
) -> Result<Json<Value>, ApiError> {
	match settlement::period_details(&state.coordinator.store, &period)? {
		Some((proposal, legs)) => Ok(Json(json!({
			"proposal": proposal_json(proposal),
			"sub_payments": legs.into_iter().map(sub_payment_json).collect::<Vec<_>>(),
		}))),
		None => Ok(Json(json!({ "proposal": null, "sub_payments": [] }))),
	}
}

/// `GET /v1/settlement/members/:peer_id/history`: `get_member_settlement_history`.
async fn get_member_settlement_history(
	State(state): State<ApiState>,
	Path(peer_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
	let legs = settlement::member_settlement_history(&state.coordinator.store, &peer_id)?;
	Ok(Json(json!({ "history": legs.into_iter().map(sub_payment_json).collect::<Vec<_>>() })))
}
