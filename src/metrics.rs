//! Operator-facing health metrics, Prometheus text exposition format.
//! Modeled on `util/metrics.rs`'s gauge registry, generalized from a single
//! Lightning node's channel/balance gauges to this coordinator's queue
//! depths and membership counts.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::error::HiveResult;
use crate::store::Store;
use crate::{membership, outbox};

/// Process-wide gauges, updated by the Coordinator's background loops.
pub struct Metrics {
	pub outbox_pending: AtomicI64,
	pub member_count: AtomicI64,
	pub neophyte_count: AtomicI64,
	pub pending_ban_proposals: AtomicI64,
	pub pending_settlement_proposals: AtomicI64,
}

impl Metrics {
	pub fn new() -> Self {
		Self {
			outbox_pending: AtomicI64::new(0),
			member_count: AtomicI64::new(0),
			neophyte_count: AtomicI64::new(0),
			pending_ban_proposals: AtomicI64::new(0),
			pending_settlement_proposals: AtomicI64::new(0),
		}
	}

	pub fn refresh(&self, store: &Store) -> HiveResult<()> {
		self.outbox_pending.store(outbox::pending_count(store)?, Ordering::Relaxed);
		self.member_count.store(membership::member_count(store)? as i64, Ordering::Relaxed);
		let (neophytes, bans, settlements): (i64, i64, i64) = store.with_conn(|conn| {
			let neophytes = conn.query_row(
				"SELECT COUNT(*) FROM members WHERE tier = 'neophyte'",
				[],
				|r| r.get(0),
			)?;
			let bans = conn.query_row(
				"SELECT COUNT(*) FROM ban_proposals WHERE status = 'pending'",
				[],
				|r| r.get(0),
			)?;
			let settlements = conn.query_row(
				"SELECT COUNT(*) FROM settlement_proposals WHERE status = 'pending'",
				[],
				|r| r.get(0),
			)?;
			Ok((neophytes, bans, settlements))
		})?;
		self.neophyte_count.store(neophytes, Ordering::Relaxed);
		self.pending_ban_proposals.store(bans, Ordering::Relaxed);
		self.pending_settlement_proposals.store(settlements, Ordering::Relaxed);
		Ok(())
	}

	/// Renders the Prometheus text exposition format.
	pub fn render(&self) -> String {
		let mut out = String::new();
		let gauge = |out: &mut String, name: &str, help: &str, value: i64| {
			out.push_str(&format!("# HELP {name} {help}\n"));
			out.push_str(&format!("# TYPE {name} gauge\n"));
			out.push_str(&format!("{name} {value}\n"));
		};
		gauge(
			&mut out,
			"hive_outbox_pending",
			"non-terminal outbox rows awaiting delivery",
			self.outbox_pending.load(Ordering::Relaxed),
		);
		gauge(
			&mut out,
			"hive_member_count",
			"members at tier=member",
			self.member_count.load(Ordering::Relaxed),
		);
		gauge(
			&mut out,
			"hive_neophyte_count",
			"members at tier=neophyte",
			self.neophyte_count.load(Ordering::Relaxed),
		);
		gauge(
			&mut out,
			"hive_pending_ban_proposals",
			"ban proposals awaiting quorum",
			self.pending_ban_proposals.load(Ordering::Relaxed),
		);
		gauge(
			&mut out,
			"hive_pending_settlement_proposals",
			"settlement proposals awaiting quorum",
			self.pending_settlement_proposals.load(Ordering::Relaxed),
		);
		out
	}
}

impl Default for Metrics {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::test_store;

	#[test]
	fn render_includes_all_gauges() {
		let store = test_store();
		let metrics = Metrics::new();
		metrics.refresh(&store).unwrap();
		let text = metrics.render();
		assert!(text.contains("hive_outbox_pending 0"));
		assert!(text.contains("hive_member_count 0"));
	}
}
