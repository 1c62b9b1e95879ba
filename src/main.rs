use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal::unix::SignalKind;

use hive_node::api::{self, ApiState};
use hive_node::config::{self, ArgsConfig};
use hive_node::coordinator::Coordinator;
use hive_node::host::{NodeHost, TestSigner};
use hive_node::store::Store;
use hive_node::telemetry;

fn now() -> i64 {
	SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_secs() as i64
}

/// Spawns a periodic background loop, logging and continuing on any caught
/// error rather than dying on a single bad entry (spec.md §7's propagation
/// policy).
fn spawn_tick<F, Fut>(name: &'static str, period: Duration, mut f: F)
where
	F: FnMut(i64) -> Fut + Send + 'static,
	Fut: std::future::Future<Output = hive_node::error::HiveResult<()>> + Send,
{
	tokio::spawn(async move {
		let mut interval = tokio::time::interval(period);
		loop {
			interval.tick().await;
			if let Err(e) = f(now()).await {
				log::warn!("{name} tick failed: {e}");
			}
		}
	});
}

#[tokio::main]
async fn main() {
	let args = ArgsConfig::parse();
	let config = match config::load_config(&args) {
		Ok(config) => config,
		Err(e) => {
			eprintln!("Invalid configuration: {e}");
			std::process::exit(1);
		}
	};

	telemetry::init_logging(&config);
	log::info!("starting hive-node, pubkey {}", config.our_pubkey);

	let store = match Store::open(&config.storage_dir_path) {
		Ok(store) => store,
		Err(e) => {
			eprintln!("Failed to open store: {e}");
			std::process::exit(1);
		}
	};

	// The host Lightning node's custom-message transport and RPC surface are
	// consumed through `NodeHost` (spec.md §6) rather than implemented here;
	// a real deployment substitutes its own adapter for this seam.
	let host: Arc<dyn NodeHost> = Arc::new(TestSigner::new(config.our_pubkey.clone()));

	let rest_service_addr = config.rest_service_addr;
	let anti_entropy_period = Duration::from_secs(config.anti_entropy_seconds);
	let settlement_rebroadcast_period = Duration::from_secs(config.settlement_rebroadcast_seconds);

	let coordinator = Arc::new(Coordinator::new(store, host, config));

	spawn_tick("outbox_retry", Duration::from_secs(30), {
		let coordinator = Arc::clone(&coordinator);
		move |now| {
			let coordinator = Arc::clone(&coordinator);
			async move { coordinator.outbox_retry_tick(now).await }
		}
	});
	spawn_tick("outbox_expire", Duration::from_secs(3600), {
		let coordinator = Arc::clone(&coordinator);
		move |now| {
			let coordinator = Arc::clone(&coordinator);
			async move { coordinator.outbox_expire_tick(now) }
		}
	});
	spawn_tick("intent", Duration::from_secs(10), {
		let coordinator = Arc::clone(&coordinator);
		move |now| {
			let coordinator = Arc::clone(&coordinator);
			async move { coordinator.intent_tick(now).map(|_| ()) }
		}
	});
	spawn_tick("anti_entropy", anti_entropy_period, {
		let coordinator = Arc::clone(&coordinator);
		move |now| {
			let coordinator = Arc::clone(&coordinator);
			async move { coordinator.anti_entropy_tick(now).await }
		}
	});
	spawn_tick("settlement", settlement_rebroadcast_period, {
		let coordinator = Arc::clone(&coordinator);
		move |now| {
			let coordinator = Arc::clone(&coordinator);
			async move { coordinator.settlement_tick(now).await }
		}
	});
	spawn_tick("contribution", Duration::from_secs(30), {
		let coordinator = Arc::clone(&coordinator);
		move |now| {
			let coordinator = Arc::clone(&coordinator);
			async move { coordinator.contribution_tick(now).await.map(|_| ()) }
		}
	});
	spawn_tick("leech_detection", Duration::from_secs(3600), {
		let coordinator = Arc::clone(&coordinator);
		move |now| {
			let coordinator = Arc::clone(&coordinator);
			async move { coordinator.leech_tick(now).await }
		}
	});
	spawn_tick("pruning", Duration::from_secs(24 * 3600), {
		let coordinator = Arc::clone(&coordinator);
		move |now| {
			let coordinator = Arc::clone(&coordinator);
			async move { coordinator.pruning_tick(now) }
		}
	});

	let router = api::router(ApiState { coordinator: Arc::clone(&coordinator) });
	let listener = match TcpListener::bind(rest_service_addr).await {
		Ok(listener) => listener,
		Err(e) => {
			eprintln!("Failed to bind operator API on {rest_service_addr}: {e}");
			std::process::exit(1);
		}
	};
	log::info!("operator API listening on {rest_service_addr}");

	let mut sigterm_stream = tokio::signal::unix::signal(SignalKind::terminate())
		.expect("failed to register SIGTERM handler");

	tokio::select! {
		result = axum::serve(listener, router) => {
			if let Err(e) = result {
				log::error!("operator API server error: {e}");
			}
		}
		_ = tokio::signal::ctrl_c() => {
			log::info!("received CTRL-C, shutting down");
		}
		_ = sigterm_stream.recv() => {
			log::info!("received SIGTERM, shutting down");
		}
	}

	telemetry::flush();
	log::info!("shutdown complete");
}
