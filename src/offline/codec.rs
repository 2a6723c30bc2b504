//! Serialization of the offline collection as a single JSON array.

use super::item::OfflineItem;
use crate::error::Result;

/// Fixed key the whole collection is stored under.
pub const OFFLINE_CONTENT_KEY: &str = "offline_content";

pub fn encode(items: &[OfflineItem]) -> Result<String> {
  Ok(serde_json::to_string(items)?)
}

/// Decode a persisted collection. A blank value decodes to an empty collection.
pub fn decode(raw: &str) -> Result<Vec<OfflineItem>> {
  if raw.trim().is_empty() {
    return Ok(Vec::new());
  }
  Ok(serde_json::from_str(raw)?)
}
