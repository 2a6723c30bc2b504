//! In-memory offline collection with write-through persistence.

use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::codec::{self, OFFLINE_CONTENT_KEY};
use super::files::FileStore;
use super::item::{ItemPatch, ItemStatus, ItemType, OfflineItem};
use crate::error::{Error, Result};
use crate::store::KeyValueStore;

/// Error message for downloads cut short by a restart.
const INTERRUPTED: &str = "download interrupted";

/// Outcome of removing an item.
#[derive(Debug)]
pub struct Removal {
  /// The item as it was before removal
  pub item: OfflineItem,
  /// Set when the item's local file could not be deleted.
  /// The metadata is removed regardless.
  pub file_error: Option<Error>,
}

/// Offline content cache.
///
/// Holds every `OfflineItem` in memory and writes the whole collection to the
/// key-value store on each mutation. A mutation only becomes visible in memory
/// once the write succeeded, so both copies stay identical.
pub struct OfflineCache {
  items: Mutex<Vec<OfflineItem>>,
  store: Arc<dyn KeyValueStore>,
  files: Arc<dyn FileStore>,
}

impl OfflineCache {
  /// Rehydrate the cache from the durable copy.
  ///
  /// No download survives a restart, so items persisted as `downloading` are
  /// moved to `error` and can be retried.
  pub fn load(store: Arc<dyn KeyValueStore>, files: Arc<dyn FileStore>) -> Result<Self> {
    let items = match store.get(OFFLINE_CONTENT_KEY)? {
      Some(raw) => codec::decode(&raw)?,
      None => Vec::new(),
    };
    info!(count = items.len(), "loaded offline content");

    let cache = Self {
      items: Mutex::new(items),
      store,
      files,
    };
    cache.fail_interrupted()?;
    Ok(cache)
  }

  fn fail_interrupted(&self) -> Result<()> {
    let mut items = self.items();
    let mut interrupted = Vec::new();
    for (index, item) in items.iter().enumerate() {
      if item.status == ItemStatus::Downloading {
        interrupted.push((index, item.apply(&ItemPatch::failed(INTERRUPTED))?));
      }
    }
    if interrupted.is_empty() {
      return Ok(());
    }

    let mut next = items.clone();
    for (index, item) in interrupted {
      warn!(id = %item.id, "download interrupted");
      next[index] = item;
    }
    self.persist(&next)?;
    *items = next;
    Ok(())
  }

  // A poisoned lock still guards a consistent collection: every mutation
  // below completes or rolls back before it can panic.
  fn items(&self) -> MutexGuard<'_, Vec<OfflineItem>> {
    self.items.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn persist(&self, items: &[OfflineItem]) -> Result<()> {
    let raw = codec::encode(items)?;
    self.store.set(OFFLINE_CONTENT_KEY, &raw)
  }

  /// Insert a new item. Rejects duplicate ids.
  pub fn add(&self, item: OfflineItem) -> Result<()> {
    item.validate()?;

    let mut items = self.items();
    if items.iter().any(|i| i.id == item.id) {
      return Err(Error::DuplicateItem(item.id));
    }

    let id = item.id.clone();
    items.push(item);
    if let Err(e) = self.persist(&items) {
      items.pop();
      return Err(e);
    }

    debug!(%id, "added offline item");
    Ok(())
  }

  /// Remove an item and delete its local file, if it has one.
  ///
  /// Returns `None` when no item has that id. The file is only touched once
  /// the shrunken collection is stored. A failed file deletion is reported in
  /// the `Removal` but does not undo the metadata removal.
  pub fn remove(&self, id: &str) -> Result<Option<Removal>> {
    let mut items = self.items();
    let Some(index) = items.iter().position(|i| i.id == id) else {
      return Ok(None);
    };

    let item = items.remove(index);
    if let Err(e) = self.persist(&items) {
      items.insert(index, item);
      return Err(e);
    }
    drop(items);

    let file_error = match &item.local_path {
      Some(path) => match self.files.remove(path) {
        Ok(()) => None,
        Err(e) => {
          warn!(%id, path = %path.display(), error = %e, "failed to delete offline file");
          Some(e)
        }
      },
      None => None,
    };

    debug!(%id, "removed offline item");
    Ok(Some(Removal { item, file_error }))
  }

  /// Merge `patch` into the item with `id`.
  ///
  /// Returns the updated item, or `None` if there is no such item.
  pub fn update(&self, id: &str, patch: ItemPatch) -> Result<Option<OfflineItem>> {
    let mut items = self.items();
    let Some(index) = items.iter().position(|i| i.id == id) else {
      return Ok(None);
    };

    let updated = items[index].apply(&patch)?;
    let previous = std::mem::replace(&mut items[index], updated.clone());
    if let Err(e) = self.persist(&items) {
      items[index] = previous;
      return Err(e);
    }

    Ok(Some(updated))
  }

  /// User-triggered retry of a failed item: error -> downloading.
  pub fn retry(&self, id: &str) -> Result<OfflineItem> {
    let current = self
      .get_by_id(id)
      .ok_or_else(|| Error::NotFound(id.to_string()))?;
    if current.status != ItemStatus::Error {
      return Err(Error::InvalidTransition {
        id: id.to_string(),
        from: current.status,
        to: ItemStatus::Downloading,
      });
    }

    self
      .update(id, ItemPatch::new().status(ItemStatus::Downloading).progress(0))?
      .ok_or_else(|| Error::NotFound(id.to_string()))
  }

  /// Drop every item, in memory and in the store.
  pub fn reset(&self) -> Result<()> {
    let mut items = self.items();
    self.store.remove(OFFLINE_CONTENT_KEY)?;
    items.clear();
    Ok(())
  }

  pub fn get_by_id(&self, id: &str) -> Option<OfflineItem> {
    self.items().iter().find(|i| i.id == id).cloned()
  }

  pub fn get_by_type(&self, item_type: ItemType) -> Vec<OfflineItem> {
    self.filtered(|i| i.item_type == item_type)
  }

  pub fn get_by_status(&self, status: ItemStatus) -> Vec<OfflineItem> {
    self.filtered(|i| i.status == status)
  }

  pub fn get_by_tag(&self, tag: &str) -> Vec<OfflineItem> {
    self.filtered(|i| i.has_tag(tag))
  }

  pub fn all(&self) -> Vec<OfflineItem> {
    self.items().clone()
  }

  pub fn len(&self) -> usize {
    self.items().len()
  }

  pub fn is_empty(&self) -> bool {
    self.items().is_empty()
  }

  /// Sum of `size` over every held item, in bytes.
  pub fn total_storage_used(&self) -> u64 {
    self.items().iter().map(|i| i.size).sum()
  }

  fn filtered(&self, predicate: impl Fn(&OfflineItem) -> bool) -> Vec<OfflineItem> {
    self
      .items()
      .iter()
      .filter(|i| predicate(i))
      .cloned()
      .collect()
  }
}
