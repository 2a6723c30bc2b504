//! Offline cache, sync and API client for report, dashboard and dataset content.

pub mod api;
pub mod app;
pub mod config;
pub mod error;
pub mod offline;
pub mod store;
pub mod sync;

pub use app::App;
pub use error::{Error, Result};
