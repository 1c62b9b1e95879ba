//! Shared `Config` fixture for integration tests, mirroring
//! `coordinator.rs`'s own `#[cfg(test)] test_config`.

use std::time::Duration;

use hive_node::config::{Config, GovernanceMode, OutboxConfig, SettlementWeights};

pub fn test_config(our_pubkey: String) -> Config {
	Config {
		our_pubkey,
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
		settlement_weights: SettlementWeights::default(),
		ban_quorum_fraction: 0.51,
		governance_mode: GovernanceMode::Advisor,
		outbox: OutboxConfig::default(),
		min_channel_size_sats: 20_000,
		max_channel_size_sats: 16_777_215,
		vouch_quorum_fraction: 2.0 / 3.0,
		log_level: log::LevelFilter::Info,
		log_file_path: None,
	}
}

#[allow(dead_code)]
pub fn secs(n: u64) -> Duration {
	Duration::from_secs(n)
}

pub fn open_store() -> hive_node::store::Store {
	let dir = tempfile::tempdir().unwrap();
	let store = hive_node::store::Store::open(dir.path()).unwrap();
	std::mem::forget(dir);
	store
}
