//! Error type shared by the store, cache, API client and sync manager.

use thiserror::Error;

use crate::offline::ItemStatus;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
  /// Network unreachable when a sync was requested
  #[error("no network connectivity")]
  NoConnectivity,

  #[error("a sync is already in progress")]
  SyncInProgress,

  #[error("sync was cancelled")]
  SyncCancelled,

  /// Download of a single item failed; the message is also recorded on the item
  #[error("download of {id} failed: {message}")]
  DownloadFailure { id: String, message: String },

  #[error("failed to read {key} from storage: {message}")]
  StorageRead { key: String, message: String },

  #[error("failed to write {key} to storage: {message}")]
  StorageWrite { key: String, message: String },

  /// Server answered 401; stored credentials have been cleared
  #[error("authorization expired, log in again")]
  AuthExpired,

  #[error("rate limited by server after {attempts} attempts")]
  RateLimited { attempts: u32 },

  /// A newer request with the same method and path replaced this one
  #[error("request {key} superseded by a newer request")]
  Superseded { key: String },

  #[error("server returned {status}: {message}")]
  Http { status: u16, message: String },

  #[error("network error: {0}")]
  Network(#[from] reqwest::Error),

  #[error("invalid url: {0}")]
  InvalidUrl(#[from] url::ParseError),

  #[error("serialization error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("item {0} already exists")]
  DuplicateItem(String),

  #[error("item {0} not found")]
  NotFound(String),

  #[error("invalid item {id}: {reason}")]
  InvalidItem { id: String, reason: String },

  #[error("item {id} cannot move from {from} to {to}")]
  InvalidTransition {
    id: String,
    from: ItemStatus,
    to: ItemStatus,
  },

  #[error("file error: {0}")]
  Io(#[from] std::io::Error),
}

impl Error {
  /// Whether the caller can reasonably try the same operation again.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      Error::NoConnectivity
        | Error::SyncInProgress
        | Error::SyncCancelled
        | Error::DownloadFailure { .. }
        | Error::RateLimited { .. }
        | Error::Network(_)
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_transient_errors_are_retryable() {
    assert!(Error::NoConnectivity.is_retryable());
    assert!(Error::RateLimited { attempts: 3 }.is_retryable());
    assert!(Error::DownloadFailure {
      id: "r1".to_string(),
      message: "timeout".to_string(),
    }
    .is_retryable());

    assert!(!Error::AuthExpired.is_retryable());
    assert!(!Error::NotFound("r1".to_string()).is_retryable());
    assert!(!Error::Http {
      status: 404,
      message: "missing".to_string(),
    }
    .is_retryable());
  }
}
