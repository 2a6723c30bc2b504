//! Offline item entity, its status state machine and partial updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Kind of remote content an item caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
  Report,
  Dashboard,
  Dataset,
}

impl ItemType {
  pub fn as_str(self) -> &'static str {
    match self {
      ItemType::Report => "report",
      ItemType::Dashboard => "dashboard",
      ItemType::Dataset => "dataset",
    }
  }

  /// Collection segment used in API paths (e.g. `/reports/{id}`).
  pub fn api_segment(self) -> &'static str {
    match self {
      ItemType::Report => "reports",
      ItemType::Dashboard => "dashboards",
      ItemType::Dataset => "datasets",
    }
  }
}

impl fmt::Display for ItemType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(self.as_str())
  }
}

impl FromStr for ItemType {
  type Err = String;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "report" => Ok(ItemType::Report),
      "dashboard" => Ok(ItemType::Dashboard),
      "dataset" => Ok(ItemType::Dataset),
      other => Err(format!(
        "unknown item type '{}' (expected report, dashboard or dataset)",
        other
      )),
    }
  }
}

/// Lifecycle state of an offline item.
///
/// ```text
/// pending -> downloading -> downloaded
///                 ^      \-> error
///                 \-----------/  (user retry)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
  Pending,
  Downloading,
  Downloaded,
  Error,
}

impl ItemStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      ItemStatus::Pending => "pending",
      ItemStatus::Downloading => "downloading",
      ItemStatus::Downloaded => "downloaded",
      ItemStatus::Error => "error",
    }
  }

  /// Whether a change from `self` to `next` is allowed.
  /// Staying in the same state is always allowed.
  pub fn can_transition_to(self, next: ItemStatus) -> bool {
    use ItemStatus::*;

    self == next
      || matches!(
        (self, next),
        (Pending, Downloading)
          | (Downloading, Downloaded)
          | (Downloading, Error)
          | (Error, Downloading)
      )
  }
}

impl fmt::Display for ItemStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(self.as_str())
  }
}

impl FromStr for ItemStatus {
  type Err = String;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "pending" => Ok(ItemStatus::Pending),
      "downloading" => Ok(ItemStatus::Downloading),
      "downloaded" => Ok(ItemStatus::Downloaded),
      "error" => Ok(ItemStatus::Error),
      other => Err(format!("unknown item status '{}'", other)),
    }
  }
}

/// Descriptive fields of an item. Replaced as a whole, never field by field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemMetadata {
  pub name: String,
  pub description: String,
  pub owner: String,
  pub tags: BTreeSet<String>,
}

/// A piece of remote content cached for offline use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineItem {
  pub id: String,
  #[serde(rename = "type")]
  pub item_type: ItemType,
  pub name: String,
  #[serde(default)]
  pub description: String,
  #[serde(default)]
  pub owner: String,
  #[serde(default)]
  pub tags: BTreeSet<String>,
  /// Size in bytes, 0 until the download completes
  #[serde(default)]
  pub size: u64,
  pub status: ItemStatus,
  /// Percentage 0-100, only while downloading
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub download_progress: Option<u8>,
  pub last_updated: DateTime<Utc>,
  /// Set if and only if the item is downloaded
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub local_path: Option<PathBuf>,
  /// Set only when status is error
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl OfflineItem {
  /// Create a pending item for content the user asked to keep offline.
  pub fn new(id: impl Into<String>, item_type: ItemType, metadata: ItemMetadata) -> Self {
    Self {
      id: id.into(),
      item_type,
      name: metadata.name,
      description: metadata.description,
      owner: metadata.owner,
      tags: metadata.tags,
      size: 0,
      status: ItemStatus::Pending,
      download_progress: None,
      last_updated: Utc::now(),
      local_path: None,
      error: None,
    }
  }

  pub fn has_tag(&self, tag: &str) -> bool {
    self.tags.contains(tag)
  }

  /// Check the status-dependent field invariants.
  pub fn validate(&self) -> Result<()> {
    let invalid = |reason: &str| {
      Err(Error::InvalidItem {
        id: self.id.clone(),
        reason: reason.to_string(),
      })
    };

    if self.id.is_empty() {
      return invalid("id must not be empty");
    }
    match (self.status, self.local_path.is_some()) {
      (ItemStatus::Downloaded, false) => return invalid("downloaded item has no local path"),
      (status, true) if status != ItemStatus::Downloaded => {
        return invalid("only a downloaded item may have a local path")
      }
      _ => {}
    }
    if let Some(progress) = self.download_progress {
      if self.status != ItemStatus::Downloading {
        return invalid("download progress is only valid while downloading");
      }
      if progress > 100 {
        return invalid("download progress above 100");
      }
    }
    if self.error.is_some() && self.status != ItemStatus::Error {
      return invalid("error message on an item that is not in error");
    }

    Ok(())
  }

  /// Produce the item that results from merging `patch` into `self`.
  ///
  /// Fields owned by a status (`download_progress`, `error`) are dropped when
  /// the status moves away from it, unless the patch sets them explicitly.
  pub fn apply(&self, patch: &ItemPatch) -> Result<Self> {
    let mut next = self.clone();

    if let Some(status) = patch.status {
      if !self.status.can_transition_to(status) {
        return Err(Error::InvalidTransition {
          id: self.id.clone(),
          from: self.status,
          to: status,
        });
      }
      next.status = status;
    }

    if let Some(metadata) = &patch.metadata {
      next.name = metadata.name.clone();
      next.description = metadata.description.clone();
      next.owner = metadata.owner.clone();
      next.tags = metadata.tags.clone();
    }
    if let Some(size) = patch.size {
      next.size = size;
    }
    if let Some(progress) = patch.download_progress {
      next.download_progress = Some(progress);
    }
    if let Some(path) = &patch.local_path {
      next.local_path = Some(path.clone());
    }
    if let Some(error) = &patch.error {
      next.error = Some(error.clone());
    }

    if next.status != self.status {
      if next.status != ItemStatus::Downloading && patch.download_progress.is_none() {
        next.download_progress = None;
      }
      if next.status != ItemStatus::Error && patch.error.is_none() {
        next.error = None;
      }
    }

    next.last_updated = Utc::now();
    next.validate()?;
    Ok(next)
  }
}

/// Partial update for an item. Unset fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct ItemPatch {
  pub metadata: Option<ItemMetadata>,
  pub size: Option<u64>,
  pub status: Option<ItemStatus>,
  pub download_progress: Option<u8>,
  pub local_path: Option<PathBuf>,
  pub error: Option<String>,
}

impl ItemPatch {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn status(mut self, status: ItemStatus) -> Self {
    self.status = Some(status);
    self
  }

  pub fn progress(mut self, percent: u8) -> Self {
    self.download_progress = Some(percent);
    self
  }

  pub fn size(mut self, size: u64) -> Self {
    self.size = Some(size);
    self
  }

  pub fn local_path(mut self, path: impl Into<PathBuf>) -> Self {
    self.local_path = Some(path.into());
    self
  }

  pub fn metadata(mut self, metadata: ItemMetadata) -> Self {
    self.metadata = Some(metadata);
    self
  }

  /// Mark the item as fully downloaded.
  pub fn downloaded(size: u64, path: impl Into<PathBuf>) -> Self {
    Self::new()
      .status(ItemStatus::Downloaded)
      .size(size)
      .local_path(path)
  }

  /// Mark the item as failed with a message.
  pub fn failed(message: impl Into<String>) -> Self {
    Self {
      status: Some(ItemStatus::Error),
      error: Some(message.into()),
      ..Self::default()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn report(id: &str) -> OfflineItem {
    OfflineItem::new(
      id,
      ItemType::Report,
      ItemMetadata {
        name: "Quarterly".to_string(),
        ..ItemMetadata::default()
      },
    )
  }

  #[test]
  fn test_new_item_is_pending_and_valid() {
    let item = report("r1");
    assert_eq!(item.status, ItemStatus::Pending);
    assert_eq!(item.size, 0);
    assert!(item.local_path.is_none());
    item.validate().unwrap();
  }

  #[test]
  fn test_transitions() {
    use ItemStatus::*;

    assert!(Pending.can_transition_to(Downloading));
    assert!(Downloading.can_transition_to(Downloaded));
    assert!(Downloading.can_transition_to(Error));
    assert!(Error.can_transition_to(Downloading));
    assert!(Downloaded.can_transition_to(Downloaded));

    assert!(!Pending.can_transition_to(Downloaded));
    assert!(!Downloaded.can_transition_to(Pending));
    assert!(!Downloaded.can_transition_to(Downloading));
    assert!(!Error.can_transition_to(Downloaded));
    assert!(!Error.can_transition_to(Pending));
  }

  #[test]
  fn test_progress_dropped_when_download_completes() {
    let item = report("r1")
      .apply(&ItemPatch::new().status(ItemStatus::Downloading).progress(50))
      .unwrap();
    assert_eq!(item.download_progress, Some(50));

    let done = item.apply(&ItemPatch::downloaded(10, "/x")).unwrap();
    assert_eq!(done.status, ItemStatus::Downloaded);
    assert_eq!(done.download_progress, None);
    assert_eq!(done.local_path, Some(PathBuf::from("/x")));
  }

  #[test]
  fn test_downloaded_requires_local_path() {
    let item = report("r1")
      .apply(&ItemPatch::new().status(ItemStatus::Downloading))
      .unwrap();

    let err = item
      .apply(&ItemPatch::new().status(ItemStatus::Downloaded).size(5))
      .unwrap_err();
    assert!(matches!(err, Error::InvalidItem { .. }));
  }

  #[test]
  fn test_local_path_rejected_outside_downloaded() {
    let err = report("r1")
      .apply(&ItemPatch::new().local_path("/tmp/r1"))
      .unwrap_err();
    assert!(matches!(err, Error::InvalidItem { .. }));
  }

  #[test]
  fn test_retry_clears_error() {
    let failed = report("r1")
      .apply(&ItemPatch::new().status(ItemStatus::Downloading))
      .unwrap()
      .apply(&ItemPatch::failed("timeout"))
      .unwrap();
    assert_eq!(failed.error.as_deref(), Some("timeout"));

    let retried = failed
      .apply(&ItemPatch::new().status(ItemStatus::Downloading).progress(0))
      .unwrap();
    assert_eq!(retried.status, ItemStatus::Downloading);
    assert_eq!(retried.error, None);
  }

  #[test]
  fn test_invalid_transition_reported() {
    let err = report("r1")
      .apply(&ItemPatch::downloaded(1, "/x"))
      .unwrap_err();
    assert!(matches!(
      err,
      Error::InvalidTransition {
        from: ItemStatus::Pending,
        to: ItemStatus::Downloaded,
        ..
      }
    ));
  }

  #[test]
  fn test_metadata_replaced_as_a_whole() {
    let mut item = report("r1");
    item.tags.insert("finance".to_string());
    item.owner = "ana".to_string();

    let updated = item
      .apply(&ItemPatch::new().metadata(ItemMetadata {
        name: "Renamed".to_string(),
        ..ItemMetadata::default()
      }))
      .unwrap();
    assert_eq!(updated.name, "Renamed");
    assert!(updated.owner.is_empty());
    assert!(updated.tags.is_empty());
  }

  #[test]
  fn test_parse_type_and_status() {
    assert_eq!("Dashboard".parse::<ItemType>().unwrap(), ItemType::Dashboard);
    assert_eq!(
      "downloaded".parse::<ItemStatus>().unwrap(),
      ItemStatus::Downloaded
    );
    assert!("chart".parse::<ItemType>().is_err());
  }
}
