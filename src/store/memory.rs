use std::collections::HashMap;
use std::sync::Mutex;

use super::KeyValueStore;
use crate::error::{Error, Result};

/// Storage that keeps values in memory only.
/// Used for tests and for runs that should not touch the disk.
#[derive(Default)]
pub struct MemoryStorage {
  values: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

impl KeyValueStore for MemoryStorage {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let values = self.values.lock().map_err(|e| Error::StorageRead {
      key: key.to_string(),
      message: format!("lock poisoned: {}", e),
    })?;
    Ok(values.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    let mut values = self.values.lock().map_err(|e| Error::StorageWrite {
      key: key.to_string(),
      message: format!("lock poisoned: {}", e),
    })?;
    values.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let mut values = self.values.lock().map_err(|e| Error::StorageWrite {
      key: key.to_string(),
      message: format!("lock poisoned: {}", e),
    })?;
    values.remove(key);
    Ok(())
  }
}
