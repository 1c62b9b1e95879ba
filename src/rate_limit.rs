//! Per-sender, per-message-family rate limiting (spec.md §5:
//! "Rate limiters apply per-sender per-message-family windows").

use std::collections::HashMap;
use std::sync::Mutex;

use crate::protocol::messages::HiveMessageType;

/// Default window-limit pairs per message family; `LIQUIDITY_NEED` is
/// called out by name in spec.md §5 as needing its own tighter window.
fn window_limit(msg_type: HiveMessageType) -> (i64, u32) {
	match msg_type {
		HiveMessageType::LiquidityNeed => (300, 5),
		HiveMessageType::Gossip => (60, 20),
		HiveMessageType::RouteProbe | HiveMessageType::RouteProbeBatch => (60, 30),
		_ => (60, 60),
	}
}

#[derive(Default)]
struct Bucket {
	window_start: i64,
	count: u32,
}

/// Sliding-window-by-reset rate limiter keyed by `(sender, message family)`.
pub struct RateLimiter {
	buckets: Mutex<HashMap<(String, u16), Bucket>>,
}

impl RateLimiter {
	pub fn new() -> Self {
		Self { buckets: Mutex::new(HashMap::new()) }
	}

	/// Returns `true` if `sender` may send another `msg_type` message at
	/// `now` without tripping `PerSenderRate`.
	pub fn allow(&self, sender: &str, msg_type: HiveMessageType, now: i64) -> bool {
		let (window_seconds, limit) = window_limit(msg_type);
		let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");
		let key = (sender.to_string(), msg_type.code());
		let bucket = buckets.entry(key).or_insert_with(|| Bucket { window_start: now, count: 0 });
		if now - bucket.window_start >= window_seconds {
			bucket.window_start = now;
			bucket.count = 0;
		}
		if bucket.count >= limit {
			false
		} else {
			bucket.count += 1;
			true
		}
	}
}

impl Default for RateLimiter {
	fn default() -> Self {
		Self::new()
	}
}

/// A coarse global cap independent of sender identity, applied before the
/// per-sender check (spec.md §5: "GlobalRate").
pub struct GlobalRateLimiter {
	bucket: Mutex<Bucket>,
	window_seconds: i64,
	limit: u32,
}

impl GlobalRateLimiter {
	pub fn new(window_seconds: i64, limit: u32) -> Self {
		Self { bucket: Mutex::new(Bucket { window_start: 0, count: 0 }), window_seconds, limit }
	}

	pub fn allow(&self, now: i64) -> bool {
		let mut bucket = self.bucket.lock().expect("global rate limiter lock poisoned");
		if now - bucket.window_start >= self.window_seconds {
			bucket.window_start = now;
			bucket.count = 0;
		}
		if bucket.count >= self.limit {
			false
		} else {
			bucket.count += 1;
			true
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn caps_within_window() {
		let limiter = RateLimiter::new();
		for _ in 0..5 {
			assert!(limiter.allow("02aa", HiveMessageType::LiquidityNeed, 0));
		}
		assert!(!limiter.allow("02aa", HiveMessageType::LiquidityNeed, 1));
	}

	#[test]
	fn resets_after_window() {
		let limiter = RateLimiter::new();
		for _ in 0..5 {
			assert!(limiter.allow("02aa", HiveMessageType::LiquidityNeed, 0));
		}
		assert!(limiter.allow("02aa", HiveMessageType::LiquidityNeed, 301));
	}

	#[test]
	fn per_sender_isolation() {
		let limiter = RateLimiter::new();
		for _ in 0..5 {
			assert!(limiter.allow("02aa", HiveMessageType::LiquidityNeed, 0));
		}
		assert!(limiter.allow("02bb", HiveMessageType::LiquidityNeed, 0));
	}
}
