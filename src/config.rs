//! Configuration loading: TOML file merged under CLI flags/env vars, the
//! same layering `util/config.rs` uses in the teacher (`ConfigBuilder::merge_toml`
//! then `merge_args`, CLI/env always wins). Bounds are validated in `build()`;
//! invalid config fails startup.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::Parser;
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Governance mode: how state-changing decisions are authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GovernanceMode {
	/// Every state-changing decision produces a pending_actions row awaiting
	/// operator input.
	Advisor,
	/// Execute within configured safety limits.
	Autonomous,
	/// Delegate to an external oracle/advisor, falling back to advisor mode
	/// on any error (fail-closed bias, spec.md §5).
	Oracle,
}

impl FromStr for GovernanceMode {
	type Err = io::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"advisor" => Ok(GovernanceMode::Advisor),
			"autonomous" => Ok(GovernanceMode::Autonomous),
			"oracle" => Ok(GovernanceMode::Oracle),
			other => Err(invalid_input(format!("Unknown governance_mode: {other}"))),
		}
	}
}

/// Fair-share settlement weights (spec.md §4.9); must sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct SettlementWeights {
	pub capacity: f64,
	pub forwards: f64,
	pub uptime: f64,
}

impl Default for SettlementWeights {
	fn default() -> Self {
		Self { capacity: 0.30, forwards: 0.60, uptime: 0.10 }
	}
}

impl SettlementWeights {
	fn validate(&self) -> io::Result<()> {
		let sum = self.capacity + self.forwards + self.uptime;
		if (sum - 1.0).abs() > 1e-6 {
			return Err(invalid_input(format!(
				"settlement_weights must sum to 1.0, got {sum}"
			)));
		}
		if self.capacity < 0.0 || self.forwards < 0.0 || self.uptime < 0.0 {
			return Err(invalid_input("settlement_weights must be non-negative"));
		}
		Ok(())
	}
}

/// Outbox retry-policy tunables (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct OutboxConfig {
	pub base_retry_seconds: u64,
	pub max_retry_seconds: u64,
	pub max_retries: u32,
	pub ttl_seconds: u64,
	pub max_inflight_per_peer: u32,
}

impl Default for OutboxConfig {
	fn default() -> Self {
		Self {
			base_retry_seconds: 30,
			max_retry_seconds: 3600,
			max_retries: 20,
			ttl_seconds: 24 * 3600,
			max_inflight_per_peer: 10,
		}
	}
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
	pub our_pubkey: String,
	pub storage_dir_path: PathBuf,
	pub rest_service_addr: SocketAddr,

	pub intent_hold_seconds: u64,
	pub clock_skew_tolerance_seconds: u64,
	pub max_remote_intents: usize,

	pub state_heartbeat_seconds: u64,
	pub anti_entropy_seconds: u64,
	pub gossip_capacity_change_threshold: f64,
	pub full_sync_cooldown_seconds: u64,

	pub contribution_window_days: u32,
	pub leech_warn_ratio: f64,
	pub leech_ban_ratio: f64,
	pub leech_window_days: u32,
	pub ban_autotrigger_enabled: bool,

	pub settlement_quorum_fraction: f64,
	pub settlement_rebroadcast_seconds: u64,
	pub settlement_weights: SettlementWeights,

	pub ban_quorum_fraction: f64,

	pub governance_mode: GovernanceMode,
	pub outbox: OutboxConfig,

	pub min_channel_size_sats: u64,
	pub max_channel_size_sats: u64,

	pub vouch_quorum_fraction: f64,

	pub log_level: LevelFilter,
	pub log_file_path: Option<String>,
}

#[derive(Default)]
struct ConfigBuilder {
	our_pubkey: Option<String>,
	storage_dir_path: Option<String>,
	rest_service_addr: Option<String>,

	intent_hold_seconds: Option<u64>,
	clock_skew_tolerance_seconds: Option<u64>,
	max_remote_intents: Option<usize>,

	state_heartbeat_seconds: Option<u64>,
	anti_entropy_seconds: Option<u64>,
	gossip_capacity_change_threshold: Option<f64>,
	full_sync_cooldown_seconds: Option<u64>,

	contribution_window_days: Option<u32>,
	leech_warn_ratio: Option<f64>,
	leech_ban_ratio: Option<f64>,
	leech_window_days: Option<u32>,
	ban_autotrigger_enabled: Option<bool>,

	settlement_quorum_fraction: Option<f64>,
	settlement_rebroadcast_seconds: Option<u64>,
	settlement_weights: Option<SettlementWeights>,

	ban_quorum_fraction: Option<f64>,

	governance_mode: Option<GovernanceMode>,
	outbox: Option<OutboxConfig>,

	min_channel_size_sats: Option<u64>,
	max_channel_size_sats: Option<u64>,

	vouch_quorum_fraction: Option<f64>,

	log_level: Option<String>,
	log_file_path: Option<String>,
}

impl ConfigBuilder {
	fn merge_toml(&mut self, toml: TomlConfig) {
		if let Some(node) = toml.node {
			self.our_pubkey = node.pubkey.or(self.our_pubkey.clone());
			self.storage_dir_path = node.storage_dir_path.or(self.storage_dir_path.clone());
			self.rest_service_addr =
				node.rest_service_address.or(self.rest_service_addr.clone());
		}
		if let Some(intent) = toml.intent {
			self.intent_hold_seconds = intent.hold_seconds.or(self.intent_hold_seconds);
			self.clock_skew_tolerance_seconds =
				intent.clock_skew_tolerance_seconds.or(self.clock_skew_tolerance_seconds);
			self.max_remote_intents = intent.max_remote_intents.or(self.max_remote_intents);
		}
		if let Some(state) = toml.state_sync {
			self.state_heartbeat_seconds =
				state.heartbeat_seconds.or(self.state_heartbeat_seconds);
			self.anti_entropy_seconds = state.anti_entropy_seconds.or(self.anti_entropy_seconds);
			self.gossip_capacity_change_threshold = state
				.gossip_capacity_change_threshold
				.or(self.gossip_capacity_change_threshold);
			self.full_sync_cooldown_seconds =
				state.full_sync_cooldown_seconds.or(self.full_sync_cooldown_seconds);
		}
		if let Some(contribution) = toml.contribution {
			self.contribution_window_days =
				contribution.window_days.or(self.contribution_window_days);
			self.leech_warn_ratio = contribution.leech_warn_ratio.or(self.leech_warn_ratio);
			self.leech_ban_ratio = contribution.leech_ban_ratio.or(self.leech_ban_ratio);
			self.leech_window_days = contribution.leech_window_days.or(self.leech_window_days);
			self.ban_autotrigger_enabled =
				contribution.ban_autotrigger_enabled.or(self.ban_autotrigger_enabled);
		}
		if let Some(settlement) = toml.settlement {
			self.settlement_quorum_fraction =
				settlement.quorum_fraction.or(self.settlement_quorum_fraction);
			self.settlement_rebroadcast_seconds =
				settlement.rebroadcast_seconds.or(self.settlement_rebroadcast_seconds);
			self.settlement_weights = settlement.weights.or(self.settlement_weights);
		}
		if let Some(membership) = toml.membership {
			self.ban_quorum_fraction = membership.ban_quorum_fraction.or(self.ban_quorum_fraction);
			self.vouch_quorum_fraction =
				membership.vouch_quorum_fraction.or(self.vouch_quorum_fraction);
		}
		if let Some(governance) = toml.governance {
			self.governance_mode = governance.mode.or(self.governance_mode);
		}
		if let Some(outbox) = toml.outbox {
			self.outbox = Some(OutboxConfig {
				base_retry_seconds: outbox
					.base_retry_seconds
					.unwrap_or(OutboxConfig::default().base_retry_seconds),
				max_retry_seconds: outbox
					.max_retry_seconds
					.unwrap_or(OutboxConfig::default().max_retry_seconds),
				max_retries: outbox.max_retries.unwrap_or(OutboxConfig::default().max_retries),
				ttl_seconds: outbox.ttl_seconds.unwrap_or(OutboxConfig::default().ttl_seconds),
				max_inflight_per_peer: outbox
					.max_inflight_per_peer
					.unwrap_or(OutboxConfig::default().max_inflight_per_peer),
			});
		}
		if let Some(channel) = toml.channel {
			self.min_channel_size_sats =
				channel.min_channel_size_sats.or(self.min_channel_size_sats);
			self.max_channel_size_sats =
				channel.max_channel_size_sats.or(self.max_channel_size_sats);
		}
		if let Some(log) = toml.log {
			self.log_level = log.level.or(self.log_level.clone());
			self.log_file_path = log.file.or(self.log_file_path.clone());
		}
	}

	fn merge_args(&mut self, args: &ArgsConfig) {
		if let Some(v) = &args.node_pubkey {
			self.our_pubkey = Some(v.clone());
		}
		if let Some(v) = &args.storage_dir_path {
			self.storage_dir_path = Some(v.clone());
		}
		if let Some(v) = &args.rest_service_address {
			self.rest_service_addr = Some(v.clone());
		}
		if let Some(v) = args.governance_mode {
			self.governance_mode = Some(v);
		}
	}

	fn build(self) -> io::Result<Config> {
		let our_pubkey = self.our_pubkey.ok_or_else(|| missing_field_err("node.pubkey"))?;
		if our_pubkey.len() != 66 || !our_pubkey.chars().all(|c| c.is_ascii_hexdigit()) {
			return Err(invalid_input("node.pubkey must be a 66-hex-char compressed pubkey"));
		}

		let storage_dir_path = self
			.storage_dir_path
			.ok_or_else(|| missing_field_err("node.storage_dir_path"))
			.map(PathBuf::from)?;

		let rest_service_addr = self
			.rest_service_addr
			.ok_or_else(|| missing_field_err("node.rest_service_address"))?
			.parse::<SocketAddr>()
			.map_err(|e| invalid_input(format!("Invalid rest_service_address: {e}")))?;

		let min_channel_size_sats = self.min_channel_size_sats.unwrap_or(20_000);
		let max_channel_size_sats = self.max_channel_size_sats.unwrap_or(16_777_215);
		if min_channel_size_sats > max_channel_size_sats {
			return Err(invalid_input("min_channel_size_sats must be <= max_channel_size_sats"));
		}

		let leech_warn_ratio = self.leech_warn_ratio.unwrap_or(0.5);
		let leech_ban_ratio = self.leech_ban_ratio.unwrap_or(0.4);
		if !(0.0..=1.0).contains(&leech_warn_ratio) || !(0.0..=1.0).contains(&leech_ban_ratio) {
			return Err(invalid_input("leech ratios must be in [0, 1]"));
		}

		let settlement_quorum_fraction = self.settlement_quorum_fraction.unwrap_or(0.51);
		let ban_quorum_fraction = self.ban_quorum_fraction.unwrap_or(0.51);
		let vouch_quorum_fraction = self.vouch_quorum_fraction.unwrap_or(2.0 / 3.0);
		for (name, v) in [
			("settlement_quorum_fraction", settlement_quorum_fraction),
			("ban_quorum_fraction", ban_quorum_fraction),
			("vouch_quorum_fraction", vouch_quorum_fraction),
		] {
			if !(0.0..=1.0).contains(&v) || v <= 0.0 {
				return Err(invalid_input(format!("{name} must be in (0, 1]")));
			}
		}

		let settlement_weights = self.settlement_weights.unwrap_or_default();
		settlement_weights.validate()?;

		let log_level = self
			.log_level
			.as_ref()
			.map(|s| {
				LevelFilter::from_str(s)
					.map_err(|e| invalid_input(format!("Invalid log level: {e}")))
			})
			.transpose()?
			.unwrap_or(LevelFilter::Info);

		Ok(Config {
			our_pubkey,
			storage_dir_path,
			rest_service_addr,
			intent_hold_seconds: self.intent_hold_seconds.unwrap_or(60),
			clock_skew_tolerance_seconds: self.clock_skew_tolerance_seconds.unwrap_or(300),
			max_remote_intents: self.max_remote_intents.unwrap_or(200),
			state_heartbeat_seconds: self.state_heartbeat_seconds.unwrap_or(1800),
			anti_entropy_seconds: self.anti_entropy_seconds.unwrap_or(120),
			gossip_capacity_change_threshold: self
				.gossip_capacity_change_threshold
				.unwrap_or(0.10),
			full_sync_cooldown_seconds: self.full_sync_cooldown_seconds.unwrap_or(60),
			contribution_window_days: self.contribution_window_days.unwrap_or(30),
			leech_warn_ratio,
			leech_ban_ratio,
			leech_window_days: self.leech_window_days.unwrap_or(7),
			ban_autotrigger_enabled: self.ban_autotrigger_enabled.unwrap_or(false),
			settlement_quorum_fraction,
			settlement_rebroadcast_seconds: self.settlement_rebroadcast_seconds.unwrap_or(21_600),
			settlement_weights,
			ban_quorum_fraction,
			governance_mode: self.governance_mode.unwrap_or(GovernanceMode::Advisor),
			outbox: self.outbox.unwrap_or_default(),
			min_channel_size_sats,
			max_channel_size_sats,
			vouch_quorum_fraction,
			log_level,
			log_file_path: self.log_file_path,
		})
	}
}

#[derive(Deserialize, Serialize, Default)]
pub struct TomlConfig {
	node: Option<NodeConfig>,
	intent: Option<IntentConfig>,
	state_sync: Option<StateSyncConfig>,
	contribution: Option<ContributionConfig>,
	settlement: Option<SettlementConfig>,
	membership: Option<MembershipConfig>,
	governance: Option<GovernanceConfig>,
	outbox: Option<TomlOutboxConfig>,
	channel: Option<ChannelConfig>,
	log: Option<LogConfig>,
}

#[derive(Deserialize, Serialize)]
struct NodeConfig {
	pubkey: Option<String>,
	storage_dir_path: Option<String>,
	rest_service_address: Option<String>,
}

#[derive(Deserialize, Serialize)]
struct IntentConfig {
	hold_seconds: Option<u64>,
	clock_skew_tolerance_seconds: Option<u64>,
	max_remote_intents: Option<usize>,
}

#[derive(Deserialize, Serialize)]
struct StateSyncConfig {
	heartbeat_seconds: Option<u64>,
	anti_entropy_seconds: Option<u64>,
	gossip_capacity_change_threshold: Option<f64>,
	full_sync_cooldown_seconds: Option<u64>,
}

#[derive(Deserialize, Serialize)]
struct ContributionConfig {
	window_days: Option<u32>,
	leech_warn_ratio: Option<f64>,
	leech_ban_ratio: Option<f64>,
	leech_window_days: Option<u32>,
	ban_autotrigger_enabled: Option<bool>,
}

#[derive(Deserialize, Serialize)]
struct SettlementConfig {
	quorum_fraction: Option<f64>,
	rebroadcast_seconds: Option<u64>,
	weights: Option<SettlementWeights>,
}

#[derive(Deserialize, Serialize)]
struct MembershipConfig {
	ban_quorum_fraction: Option<f64>,
	vouch_quorum_fraction: Option<f64>,
}

#[derive(Deserialize, Serialize)]
struct GovernanceConfig {
	mode: Option<GovernanceMode>,
}

#[derive(Deserialize, Serialize)]
struct TomlOutboxConfig {
	base_retry_seconds: Option<u64>,
	max_retry_seconds: Option<u64>,
	max_retries: Option<u32>,
	ttl_seconds: Option<u64>,
	max_inflight_per_peer: Option<u32>,
}

#[derive(Deserialize, Serialize)]
struct ChannelConfig {
	min_channel_size_sats: Option<u64>,
	max_channel_size_sats: Option<u64>,
}

#[derive(Deserialize, Serialize)]
struct LogConfig {
	level: Option<String>,
	file: Option<String>,
}

#[derive(Parser, Debug, Default)]
#[command(
	version,
	about = "hive-node Configuration",
	long_about = None,
	override_usage = "hive-node [config_path]"
)]
pub struct ArgsConfig {
	#[arg(required = false, help = "The configuration file for running hive-node.")]
	pub config_file: Option<String>,

	#[arg(long, env = "HIVE_NODE_PUBKEY", help = "This node's 66-hex-char pubkey.")]
	node_pubkey: Option<String>,

	#[arg(long, env = "HIVE_STORAGE_DIR_PATH", help = "Directory for the SQLite store.")]
	storage_dir_path: Option<String>,

	#[arg(long, env = "HIVE_REST_SERVICE_ADDRESS", help = "Operator-facing HTTP API address.")]
	rest_service_address: Option<String>,

	#[arg(long, env = "HIVE_GOVERNANCE_MODE", help = "advisor | autonomous | oracle")]
	governance_mode: Option<GovernanceMode>,
}

impl clap::ValueEnum for GovernanceMode {
	fn value_variants<'a>() -> &'a [Self] {
		&[GovernanceMode::Advisor, GovernanceMode::Autonomous, GovernanceMode::Oracle]
	}

	fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
		Some(clap::builder::PossibleValue::new(match self {
			GovernanceMode::Advisor => "advisor",
			GovernanceMode::Autonomous => "autonomous",
			GovernanceMode::Oracle => "oracle",
		}))
	}
}

pub fn load_config(args: &ArgsConfig) -> io::Result<Config> {
	let mut builder = ConfigBuilder::default();

	if let Some(path) = &args.config_file {
		let content = std::fs::read_to_string(Path::new(path)).map_err(|e| {
			io::Error::new(e.kind(), format!("Failed to read config file '{path}': {e}"))
		})?;
		let toml_config: TomlConfig = toml::from_str(&content)
			.map_err(|e| invalid_input(format!("Config file contains invalid TOML: {e}")))?;
		builder.merge_toml(toml_config);
	}

	builder.merge_args(args);
	builder.build()
}

fn missing_field_err(field: &str) -> io::Error {
	invalid_input(format!(
		"Missing `{field}`. Please provide it via config file, CLI argument, or environment variable."
	))
}

fn invalid_input(message: impl Into<String>) -> io::Error {
	io::Error::new(io::ErrorKind::InvalidInput, message.into())
}

#[cfg(test)]
mod tests {
	use super::*;

	const MINIMAL_TOML: &str = r#"
		[node]
		pubkey = "02aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
		storage_dir_path = "/tmp/hive"
		rest_service_address = "127.0.0.1:9000"
	"#;

	fn write_temp(name: &str, content: &str) -> String {
		let path = std::env::temp_dir().join(name);
		std::fs::write(&path, content).unwrap();
		path.to_string_lossy().to_string()
	}

	#[test]
	fn loads_defaults_from_minimal_toml() {
		let path = write_temp("hive_test_minimal.toml", MINIMAL_TOML);
		let args = ArgsConfig { config_file: Some(path), ..Default::default() };
		let config = load_config(&args).unwrap();

		assert_eq!(config.intent_hold_seconds, 60);
		assert_eq!(config.settlement_weights, SettlementWeights::default());
		assert_eq!(config.governance_mode, GovernanceMode::Advisor);
		assert_eq!(config.outbox.max_retries, 20);
	}

	#[test]
	fn rejects_bad_pubkey() {
		let toml = MINIMAL_TOML.replace("02aaaa", "nothex");
		let path = write_temp("hive_test_badpubkey.toml", &toml);
		let args = ArgsConfig { config_file: Some(path), ..Default::default() };
		assert!(load_config(&args).is_err());
	}

	#[test]
	fn rejects_weights_not_summing_to_one() {
		let toml = format!(
			"{MINIMAL_TOML}\n[settlement.weights]\ncapacity = 0.5\nforwards = 0.5\nuptime = 0.5\n"
		);
		let path = write_temp("hive_test_badweights.toml", &toml);
		let args = ArgsConfig { config_file: Some(path), ..Default::default() };
		let err = load_config(&args).unwrap_err();
		assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
	}

	#[test]
	fn rejects_inverted_channel_bounds() {
		let toml = format!(
			"{MINIMAL_TOML}\n[channel]\nmin_channel_size_sats = 100\nmax_channel_size_sats = 10\n"
		);
		let path = write_temp("hive_test_badchannel.toml", &toml);
		let args = ArgsConfig { config_file: Some(path), ..Default::default() };
		assert!(load_config(&args).is_err());
	}

	#[test]
	fn cli_args_override_file() {
		let path = write_temp("hive_test_override.toml", MINIMAL_TOML);
		let args = ArgsConfig {
			config_file: Some(path),
			rest_service_address: Some("127.0.0.1:9999".to_string()),
			..Default::default()
		};
		let config = load_config(&args).unwrap();
		assert_eq!(config.rest_service_addr, "127.0.0.1:9999".parse().unwrap());
	}
}
