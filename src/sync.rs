//! Reconciliation of the offline cache with the server.
//!
//! Only one sync runs at a time. A sync checks connectivity once, asks the
//! server for the current state of every cached item and reports which items
//! are out of date or gone. It never changes item status itself: there is no
//! way back from downloaded to pending, so callers delete and re-add.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::ApiClient;
use crate::error::{Error, Result};
use crate::offline::{ItemStatus, OfflineCache};

const MANIFEST_PATH: &str = "/content/manifest";

/// Answers whether the network is usable right now.
pub trait Connectivity: Send + Sync {
  fn is_reachable(&self) -> impl Future<Output = bool> + Send;
}

/// Connectivity check that probes an API endpoint.
pub struct HttpConnectivity {
  api: ApiClient,
  path: String,
  timeout: Duration,
}

impl HttpConnectivity {
  pub fn new(api: ApiClient, path: impl Into<String>, timeout: Duration) -> Self {
    Self {
      api,
      path: path.into(),
      timeout,
    }
  }
}

impl Connectivity for HttpConnectivity {
  fn is_reachable(&self) -> impl Future<Output = bool> + Send {
    self.api.probe(&self.path, self.timeout)
  }
}

#[derive(Debug, Serialize)]
struct ManifestRequest<'a> {
  ids: Vec<&'a str>,
}

/// Server-side state of one item.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
  pub id: String,
  pub last_updated: DateTime<Utc>,
}

/// Result of a completed sync.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
  /// Number of local items compared
  pub checked: usize,
  /// Downloaded items whose server copy changed after the download
  pub outdated: Vec<String>,
  /// Items the server no longer has
  pub missing: Vec<String>,
  pub synced_at: DateTime<Utc>,
}

/// Coordinates sync runs and exposes their state.
pub struct SyncManager<C: Connectivity> {
  api: ApiClient,
  cache: Arc<OfflineCache>,
  connectivity: C,
  syncing: AtomicBool,
  last_sync_time: Mutex<Option<DateTime<Utc>>>,
  cancel: Mutex<Option<CancellationToken>>,
}

/// Clears the in-progress state when a run ends, including when its future is dropped.
struct Running<'a, C: Connectivity>(&'a SyncManager<C>);

impl<C: Connectivity> Drop for Running<'_, C> {
  fn drop(&mut self) {
    let mut cancel = lock(&self.0.cancel);
    *cancel = None;
    self.0.syncing.store(false, Ordering::Release);
  }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl<C: Connectivity> SyncManager<C> {
  pub fn new(api: ApiClient, cache: Arc<OfflineCache>, connectivity: C) -> Self {
    Self {
      api,
      cache,
      connectivity,
      syncing: AtomicBool::new(false),
      last_sync_time: Mutex::new(None),
      cancel: Mutex::new(None),
    }
  }

  pub fn is_syncing(&self) -> bool {
    self.syncing.load(Ordering::Acquire)
  }

  pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
    *lock(&self.last_sync_time)
  }

  /// Run a sync.
  ///
  /// Fails with `SyncInProgress` if another sync is running, `NoConnectivity`
  /// if the network is unreachable and `SyncCancelled` if `cancel_sync` was
  /// called. `last_sync_time` only moves on success.
  pub async fn start_sync(&self) -> Result<SyncReport> {
    // The flag and the token change under the same lock, so `cancel_sync`
    // never sees a running sync without its token.
    let token = {
      let mut cancel = lock(&self.cancel);
      if self
        .syncing
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
      {
        return Err(Error::SyncInProgress);
      }
      let token = CancellationToken::new();
      *cancel = Some(token.clone());
      token
    };
    let _running = Running(self);

    let report = tokio::select! {
      _ = token.cancelled() => {
        info!("sync cancelled");
        return Err(Error::SyncCancelled);
      }
      result = self.run() => result?,
    };

    *lock(&self.last_sync_time) = Some(report.synced_at);
    info!(
      checked = report.checked,
      outdated = report.outdated.len(),
      missing = report.missing.len(),
      "sync finished"
    );
    Ok(report)
  }

  /// Abort the running sync, dropping its in-flight request.
  /// Returns false when no sync is running.
  pub fn cancel_sync(&self) -> bool {
    match lock(&self.cancel).take() {
      Some(token) => {
        token.cancel();
        true
      }
      None => false,
    }
  }

  async fn run(&self) -> Result<SyncReport> {
    if !self.connectivity.is_reachable().await {
      warn!("sync requested without connectivity");
      return Err(Error::NoConnectivity);
    }

    let items = self.cache.all();
    let synced_at = Utc::now();
    if items.is_empty() {
      return Ok(SyncReport {
        checked: 0,
        outdated: Vec::new(),
        missing: Vec::new(),
        synced_at,
      });
    }

    let request = ManifestRequest {
      ids: items.iter().map(|i| i.id.as_str()).collect(),
    };
    let manifest: Vec<ManifestEntry> = self.api.post_json(MANIFEST_PATH, &request).await?;
    let remote: HashMap<&str, &ManifestEntry> =
      manifest.iter().map(|e| (e.id.as_str(), e)).collect();

    let mut outdated = Vec::new();
    let mut missing = Vec::new();
    for item in &items {
      match remote.get(item.id.as_str()) {
        None => missing.push(item.id.clone()),
        Some(entry)
          if item.status == ItemStatus::Downloaded && entry.last_updated > item.last_updated =>
        {
          outdated.push(item.id.clone())
        }
        Some(_) => {}
      }
    }

    Ok(SyncReport {
      checked: items.len(),
      outdated,
      missing,
      synced_at,
    })
  }
}
