//! Wire protocol: framing, message taxonomy, payload validation, and
//! canonical signing payloads.
//!
//! Framing mirrors the doc header in `modules/protocol.py`: a fixed magic,
//! a version byte, a u16 type code, and a JSON body. Message-type codes are
//! all odd so that non-hive plugins sharing the same custom-message channel
//! on the Lightning host ignore them.

pub mod messages;
pub mod signing;

use crate::error::{HiveError, HiveErrorKind, HiveResult};

/// `"HIVE"` as a big-endian u32.
pub const MAGIC: u32 = 0x4849_5645;
pub const MIN_SUPPORTED_VERSION: u8 = 1;
pub const MAX_SUPPORTED_VERSION: u8 = 1;
pub const MAX_MESSAGE_BYTES: usize = 256 * 1024;
pub const MAX_PEERS_IN_SNAPSHOT: usize = 500;
pub const MAX_REASON_LEN: usize = 256;
pub const PUBKEY_HEX_LEN: usize = 66;

const FRAME_HEADER_LEN: usize = 4 + 1 + 2;

pub use messages::HiveMessageType;

/// A decoded wire frame: the message type and its raw JSON payload. Typed
/// payload extraction happens one level up, in `messages`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
	pub version: u8,
	pub msg_type: HiveMessageType,
	pub payload: serde_json::Value,
}

/// Encode a frame to wire bytes. Enforces the same size cap as decode;
/// callers that produce an oversized frame must drop the peer from the
/// send path rather than truncate (spec.md §4.1).
pub fn serialize(frame: &Frame) -> HiveResult<Vec<u8>> {
	let body = serde_json::to_vec(&frame.payload)
		.map_err(|e| HiveError::new(HiveErrorKind::MalformedJson, e.to_string()))?;
	if FRAME_HEADER_LEN + body.len() > MAX_MESSAGE_BYTES {
		return Err(HiveError::new(
			HiveErrorKind::PayloadTooLarge,
			format!("encoded frame is {} bytes, cap is {MAX_MESSAGE_BYTES}", body.len()),
		));
	}
	let mut out = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
	out.extend_from_slice(&MAGIC.to_be_bytes());
	out.push(frame.version);
	out.extend_from_slice(&frame.msg_type.code().to_be_bytes());
	out.extend_from_slice(&body);
	Ok(out)
}

/// Decode wire bytes into a `Frame`. Version tolerance: any version in
/// `[MIN_SUPPORTED_VERSION, MAX_SUPPORTED_VERSION]` decodes on a best-effort
/// basis — unknown JSON keys are simply not extracted by the typed payload
/// parsers, and missing optional fields take their serde defaults.
pub fn deserialize(bytes: &[u8]) -> HiveResult<Frame> {
	if bytes.len() > MAX_MESSAGE_BYTES {
		return Err(HiveError::new(
			HiveErrorKind::PayloadTooLarge,
			format!("frame is {} bytes, cap is {MAX_MESSAGE_BYTES}", bytes.len()),
		));
	}
	if bytes.len() < FRAME_HEADER_LEN {
		return Err(HiveError::new(HiveErrorKind::MalformedJson, "frame shorter than header"));
	}
	let magic = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
	if magic != MAGIC {
		return Err(HiveError::new(HiveErrorKind::BadMagic, format!("got magic {magic:#x}")));
	}
	let version = bytes[4];
	if !(MIN_SUPPORTED_VERSION..=MAX_SUPPORTED_VERSION).contains(&version) {
		return Err(HiveError::new(HiveErrorKind::BadVersion, format!("got version {version}")));
	}
	let code = u16::from_be_bytes([bytes[5], bytes[6]]);
	let msg_type = HiveMessageType::from_code(code)
		.ok_or_else(|| HiveError::new(HiveErrorKind::UnknownType, format!("code {code}")))?;
	let payload: serde_json::Value = serde_json::from_slice(&bytes[FRAME_HEADER_LEN..])
		.map_err(|e| HiveError::new(HiveErrorKind::MalformedJson, e.to_string()))?;
	Ok(Frame { version, msg_type, payload })
}

/// The effective protocol version to speak with a peer, per spec.md §4.1:
/// `min(our.max, peer.max)`.
pub fn effective_version(peer_max: u8) -> u8 {
	MAX_SUPPORTED_VERSION.min(peer_max)
}

fn check_pubkey(field: &str, value: &str) -> HiveResult<()> {
	if value.len() != PUBKEY_HEX_LEN || !value.chars().all(|c| c.is_ascii_hexdigit()) {
		return Err(HiveError::new(
			HiveErrorKind::FieldOutOfRange,
			format!("{field} must be a {PUBKEY_HEX_LEN}-hex-char pubkey"),
		));
	}
	Ok(())
}

fn check_reason(field: &str, value: &str) -> HiveResult<()> {
	if value.len() > MAX_REASON_LEN {
		return Err(HiveError::new(
			HiveErrorKind::FieldOutOfRange,
			format!("{field} exceeds {MAX_REASON_LEN} bytes"),
		));
	}
	Ok(())
}

fn check_list_cap<T>(field: &str, list: &[T]) -> HiveResult<()> {
	if list.len() > MAX_PEERS_IN_SNAPSHOT {
		return Err(HiveError::new(
			HiveErrorKind::FieldOutOfRange,
			format!("{field} exceeds cap of {MAX_PEERS_IN_SNAPSHOT}"),
		));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use messages::HelloPayload;

	#[test]
	fn roundtrip_preserves_frame() {
		let payload = HelloPayload {
			node_pubkey: "02".to_string() + &"a".repeat(64),
			supported_versions: (1, 1),
		};
		let frame = Frame {
			version: 1,
			msg_type: HiveMessageType::Hello,
			payload: serde_json::to_value(&payload).unwrap(),
		};
		let bytes = serialize(&frame).unwrap();
		let decoded = deserialize(&bytes).unwrap();
		assert_eq!(decoded, frame);
	}

	#[test]
	fn rejects_bad_magic() {
		let mut bytes = vec![0u8; 10];
		bytes[0] = 0xff;
		assert_eq!(deserialize(&bytes).unwrap_err().kind(), Some(HiveErrorKind::BadMagic));
	}

	#[test]
	fn rejects_unknown_type() {
		let mut bytes = MAGIC.to_be_bytes().to_vec();
		bytes.push(1);
		bytes.extend_from_slice(&9998u16.to_be_bytes());
		bytes.extend_from_slice(b"{}");
		assert_eq!(deserialize(&bytes).unwrap_err().kind(), Some(HiveErrorKind::UnknownType));
	}

	#[test]
	fn rejects_oversized_payload() {
		let huge = vec![b'a'; MAX_MESSAGE_BYTES + 1];
		assert_eq!(deserialize(&huge).unwrap_err().kind(), Some(HiveErrorKind::PayloadTooLarge));
	}
}
