//! Durable persistence layer.
//!
//! One `rusqlite::Connection` per thread (spec.md §5: "each calling thread
//! maintains its own connection via thread-local storage"), WAL journaling,
//! and a scoped `TransactionBehavior::Immediate` transaction helper so a
//! `BEGIN…COMMIT` can never deadlock against a concurrent reader.

pub mod models;
mod schema;

use std::cell::RefCell;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::error::{HiveError, HiveErrorKind, HiveResult};

pub use models::*;

thread_local! {
	static CONN: RefCell<Option<Connection>> = const { RefCell::new(None) };
}

/// Durable store handle. Cheap to clone (just a path); the real connection
/// lives in thread-local storage and is opened lazily per thread.
#[derive(Debug, Clone)]
pub struct Store {
	db_path: PathBuf,
}

impl Store {
	pub fn open(dir: impl AsRef<Path>) -> HiveResult<Self> {
		std::fs::create_dir_all(dir.as_ref())?;
		let db_path = dir.as_ref().join("hive.sqlite");
		let store = Store { db_path };
		// Open once up front so schema creation and pragma setup happen
		// before any other thread races to do it.
		store.with_conn(|conn| {
			schema::create_all(conn)?;
			Ok(())
		})?;
		Ok(store)
	}

	fn open_connection(&self) -> HiveResult<Connection> {
		let conn = Connection::open(&self.db_path)?;
		conn.pragma_update(None, "journal_mode", "WAL")?;
		conn.pragma_update(None, "busy_timeout", 5_000)?;
		conn.pragma_update(None, "foreign_keys", "ON")?;
		Ok(conn)
	}

	fn ensure_open(&self) {
		CONN.with(|cell| {
			let mut slot = cell.borrow_mut();
			if slot.is_none() {
				let conn = self.open_connection().expect("failed to open sqlite connection");
				schema::create_all(&conn).expect("failed to apply schema");
				*slot = Some(conn);
			}
		});
	}

	/// Runs `f` against this thread's connection, opening and migrating it
	/// on first use.
	pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> HiveResult<T>) -> HiveResult<T> {
		self.ensure_open();
		CONN.with(|cell| {
			let slot = cell.borrow();
			f(slot.as_ref().expect("just initialized"))
		})
	}

	/// Runs `f` inside an immediate-mode transaction, matching spec.md §5's
	/// "uses an immediate-write lock so BEGIN…COMMIT cannot deadlock with
	/// readers". Rolls back automatically if `f` returns `Err` or panics.
	pub fn transaction<T>(&self, f: impl FnOnce(&Transaction) -> HiveResult<T>) -> HiveResult<T> {
		self.ensure_open();
		CONN.with(|cell| {
			let mut slot = cell.borrow_mut();
			let conn = slot.as_mut().expect("just initialized");
			let tx = conn
				.transaction_with_behavior(TransactionBehavior::Immediate)
				.map_err(busy_to_hive_error)?;
			let result = f(&tx)?;
			tx.commit().map_err(HiveError::from)?;
			Ok(result)
		})
	}
}

pub(crate) fn busy_to_hive_error(e: rusqlite::Error) -> HiveError {
	if let rusqlite::Error::SqliteFailure(err, _) = &e {
		if err.code == rusqlite::ErrorCode::DatabaseBusy {
			return HiveError::new(HiveErrorKind::DatabaseBusy, e.to_string());
		}
	}
	HiveError::from(e)
}

#[cfg(test)]
pub(crate) fn test_store() -> Store {
	let dir = tempfile::tempdir().unwrap();
	let store = Store::open(dir.path()).unwrap();
	std::mem::forget(dir);
	store
}
