//! hive-node: the coordination-plane crate for a federation of Lightning
//! routing nodes. Module layout mirrors `ldk-server`'s split between a thin
//! binary (`main.rs`) and a library crate exposing everything the binary,
//! and integration tests, need.

pub mod api;
pub mod config;
pub mod contribution;
pub mod coordinator;
pub mod error;
pub mod governance;
pub mod host;
pub mod idempotency;
pub mod intent;
pub mod membership;
pub mod metrics;
pub mod outbox;
pub mod protocol;
pub mod rate_limit;
pub mod relay;
pub mod settlement;
pub mod state_sync;
pub mod store;
pub mod telemetry;
