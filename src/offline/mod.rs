//! Offline content: cached reports, dashboards and datasets.
//!
//! - `OfflineCache` owns the items and writes them through to storage
//! - `Downloader` moves items through pending -> downloading -> downloaded/error
//! - `codec` defines the persisted JSON form

mod cache;
pub mod codec;
mod download;
mod files;
mod item;

pub use cache::{OfflineCache, Removal};
pub use download::{content_file_name, Downloader};
pub use files::{FileStore, LocalFiles};
pub use item::{ItemMetadata, ItemPatch, ItemStatus, ItemType, OfflineItem};
