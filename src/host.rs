//! The abstract Lightning node host: everything this crate consumes from
//! the wrapped node rather than implements itself (spec.md §6, "Host
//! Lightning node (consumed)"). Kept as an injected capability — per DESIGN
//! NOTES §9 — so tests can substitute a deterministic double instead of a
//! real node.

use async_trait::async_trait;

use crate::error::HiveResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignResult {
	pub signature: String,
	pub zbase: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyResult {
	pub verified: bool,
	pub pubkey: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerChannel {
	pub peer_id: String,
	pub channel_id: String,
	pub capacity_sats: u64,
	pub local_balance_sats: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardStatus {
	Succeeded,
	Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardEvent {
	pub in_channel: String,
	pub out_channel: String,
	pub in_msat: u64,
	pub out_msat: u64,
	pub status: ForwardStatus,
}

/// Whether a `send_custom_message` call should be treated by the outbox as
/// "handed to transport" (still needs an ack) or a hard failure (peer
/// unreachable, retry without consuming retry budget).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
	Sent,
	PeerUnreachable,
}

/// Abstracts the Lightning node RPC surface. Production code backs this
/// with the real node's custom-message and signing API; tests back it with
/// an in-memory double.
#[async_trait]
pub trait NodeHost: Send + Sync {
	fn our_pubkey(&self) -> &str;

	async fn sign_message(&self, text: &str) -> HiveResult<SignResult>;

	async fn verify_message(&self, text: &str, signature: &str) -> HiveResult<VerifyResult>;

	async fn send_custom_message(&self, peer_id: &str, bytes: Vec<u8>) -> HiveResult<SendOutcome>;

	async fn list_peers(&self) -> HiveResult<Vec<String>>;

	async fn list_peer_channels(&self) -> HiveResult<Vec<PeerChannel>>;

	async fn list_forwards(&self) -> HiveResult<Vec<ForwardEvent>>;

	async fn fetch_invoice(&self, offer: &str, amount_msat: u64) -> HiveResult<String>;

	async fn pay(&self, invoice: &str) -> HiveResult<String>;
}

/// Deterministic test double: verifies any `(text, signature)` pair where
/// `signature == format!("sig:{text}:{pubkey}")`, matching what `TestSigner`
/// itself produces from `sign_message`. No real cryptography, on purpose —
/// this exists to substitute for the host's verification primitive in unit
/// and integration tests (DESIGN NOTES §9).
#[derive(Debug, Clone)]
pub struct TestSigner {
	pub pubkey: String,
}

impl TestSigner {
	pub fn new(pubkey: impl Into<String>) -> Self {
		Self { pubkey: pubkey.into() }
	}

	pub fn sign(&self, text: &str) -> String {
		format!("sig:{text}:{}", self.pubkey)
	}

	pub fn verify(&self, text: &str, signature: &str) -> VerifyResult {
		if let Some(rest) = signature.strip_prefix("sig:") {
			if let Some((signed_text, pubkey)) = rest.rsplit_once(':') {
				if signed_text == text {
					return VerifyResult { verified: true, pubkey: Some(pubkey.to_string()) };
				}
			}
		}
		VerifyResult { verified: false, pubkey: None }
	}
}

#[async_trait]
impl NodeHost for TestSigner {
	fn our_pubkey(&self) -> &str {
		&self.pubkey
	}

	async fn sign_message(&self, text: &str) -> HiveResult<SignResult> {
		let signature = self.sign(text);
		Ok(SignResult { zbase: signature.clone(), signature })
	}

	async fn verify_message(&self, text: &str, signature: &str) -> HiveResult<VerifyResult> {
		Ok(self.verify(text, signature))
	}

	async fn send_custom_message(&self, _peer_id: &str, _bytes: Vec<u8>) -> HiveResult<SendOutcome> {
		Ok(SendOutcome::Sent)
	}

	async fn list_peers(&self) -> HiveResult<Vec<String>> {
		Ok(Vec::new())
	}

	async fn list_peer_channels(&self) -> HiveResult<Vec<PeerChannel>> {
		Ok(Vec::new())
	}

	async fn list_forwards(&self) -> HiveResult<Vec<ForwardEvent>> {
		Ok(Vec::new())
	}

	async fn fetch_invoice(&self, offer: &str, _amount_msat: u64) -> HiveResult<String> {
		Ok(format!("invoice-for-{offer}"))
	}

	async fn pay(&self, invoice: &str) -> HiveResult<String> {
		Ok(format!("preimage-for-{invoice}"))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_signer_roundtrips() {
		let signer = TestSigner::new("02aa");
		let sig = signer.sign("hello");
		let result = signer.verify("hello", &sig);
		assert!(result.verified);
		assert_eq!(result.pubkey.as_deref(), Some("02aa"));
	}

	#[test]
	fn test_signer_rejects_tampered_text() {
		let signer = TestSigner::new("02aa");
		let sig = signer.sign("hello");
		assert!(!signer.verify("goodbye", &sig).verified);
	}
}
