//! Device file boundary used when cached content is deleted.

use std::io::ErrorKind;
use std::path::Path;

use crate::error::Result;

pub trait FileStore: Send + Sync {
  /// Delete the file at `path`. A file that is already gone counts as deleted.
  fn remove(&self, path: &Path) -> Result<()>;
}

/// Files on the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFiles;

impl FileStore for LocalFiles {
  fn remove(&self, path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e.into()),
    }
  }
}
