//! Crate-wide error taxonomy.
//!
//! Mirrors the split the teacher uses between a closed error-code enum and a
//! wrapper carrying a human-readable message (`server/src/api/error.rs`'s
//! `LdkServerError`/`LdkServerErrorCode`), generalized to the error kinds
//! spec.md §7 names.

use thiserror::Error;

/// The closed set of error kinds the core distinguishes, per spec.md §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HiveErrorKind {
	// Protocol errors — drop the message, log at warn, no retry.
	BadMagic,
	BadVersion,
	UnknownType,
	PayloadTooLarge,
	MalformedJson,
	FieldOutOfRange,

	// Identity errors — drop, log at warn, do not penalize reputation.
	SignatureInvalid,
	PubkeyMismatch,
	NotAMember,
	IdentityBindingFailed,

	// Rate-limit errors — drop, log at debug.
	PerSenderRate,
	GlobalRate,
	InflightCap,

	// State conflicts — success on the sender path, no-op on the receiver path.
	VersionTooOld,
	DuplicateEvent,
	AlreadySettled,
	ProposalExists,

	// Transient I/O errors — retry locally with bounded backoff.
	HostRpcTimeout,
	DatabaseBusy,

	// Terminal errors — never retry.
	PermanentlyFailed,

	// Governance escalation.
	Governance,
}

impl HiveErrorKind {
	/// True for the "state conflict" family: spec.md §7 says these should be
	/// treated as success on the sender path (idempotency) and a no-op on
	/// the receiver path, still emitting `MSG_ACK{ok}`.
	pub fn is_state_conflict(self) -> bool {
		matches!(
			self,
			HiveErrorKind::VersionTooOld
				| HiveErrorKind::DuplicateEvent
				| HiveErrorKind::AlreadySettled
				| HiveErrorKind::ProposalExists
		)
	}

	pub fn as_str(self) -> &'static str {
		match self {
			HiveErrorKind::BadMagic => "bad_magic",
			HiveErrorKind::BadVersion => "bad_version",
			HiveErrorKind::UnknownType => "unknown_type",
			HiveErrorKind::PayloadTooLarge => "payload_too_large",
			HiveErrorKind::MalformedJson => "malformed_json",
			HiveErrorKind::FieldOutOfRange => "field_out_of_range",
			HiveErrorKind::SignatureInvalid => "signature_invalid",
			HiveErrorKind::PubkeyMismatch => "pubkey_mismatch",
			HiveErrorKind::NotAMember => "not_a_member",
			HiveErrorKind::IdentityBindingFailed => "identity_binding_failed",
			HiveErrorKind::PerSenderRate => "per_sender_rate",
			HiveErrorKind::GlobalRate => "global_rate",
			HiveErrorKind::InflightCap => "inflight_cap",
			HiveErrorKind::VersionTooOld => "version_too_old",
			HiveErrorKind::DuplicateEvent => "duplicate_event",
			HiveErrorKind::AlreadySettled => "already_settled",
			HiveErrorKind::ProposalExists => "proposal_exists",
			HiveErrorKind::HostRpcTimeout => "host_rpc_timeout",
			HiveErrorKind::DatabaseBusy => "database_busy",
			HiveErrorKind::PermanentlyFailed => "permanently_failed",
			HiveErrorKind::Governance => "governance",
		}
	}
}

#[derive(Debug, Error)]
pub enum HiveError {
	#[error("{kind:?}: {message}")]
	Domain { kind: HiveErrorKind, message: String },

	#[error("database error: {0}")]
	Db(#[from] rusqlite::Error),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

impl HiveError {
	pub fn new(kind: HiveErrorKind, message: impl Into<String>) -> Self {
		HiveError::Domain { kind, message: message.into() }
	}

	pub fn kind(&self) -> Option<HiveErrorKind> {
		match self {
			HiveError::Domain { kind, .. } => Some(*kind),
			_ => None,
		}
	}

	/// Whether, per spec.md §7, this outcome should still be acked to the
	/// sender as `MSG_ACK{ok}` (idempotent no-op) rather than treated as a
	/// failure.
	pub fn is_idempotent_noop(&self) -> bool {
		self.kind().map(HiveErrorKind::is_state_conflict).unwrap_or(false)
	}
}

pub type HiveResult<T> = Result<T, HiveError>;
