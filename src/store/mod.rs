//! Durable string-keyed storage.
//!
//! The rest of the crate treats the store as a black box: values are
//! serialized text written and read whole under a key.
//! - `SqliteStorage` persists to a single-table SQLite database
//! - `MemoryStorage` keeps everything in a map (tests, ephemeral runs)

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use crate::error::Result;

/// Key under which the bearer token is stored.
pub const AUTH_TOKEN_KEY: &str = "auth_token";

/// Trait for key-value storage backends.
pub trait KeyValueStore: Send + Sync {
  /// Get the value stored under `key`, if any.
  fn get(&self, key: &str) -> Result<Option<String>>;

  /// Store `value` under `key`, replacing any previous value.
  fn set(&self, key: &str, value: &str) -> Result<()>;

  /// Remove `key`. Removing a missing key is not an error.
  fn remove(&self, key: &str) -> Result<()>;
}
