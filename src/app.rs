//! Application context owning the store, API client, cache, downloader and sync manager.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::api::ApiClient;
use crate::config::Config;
use crate::offline::{Downloader, LocalFiles, OfflineCache};
use crate::store::{KeyValueStore, SqliteStorage};
use crate::sync::{HttpConnectivity, SyncManager};

/// Everything a front end needs, created once at start-up and passed by reference.
pub struct App {
  config: Config,
  api: ApiClient,
  cache: Arc<OfflineCache>,
  downloader: Downloader,
  sync: SyncManager<HttpConnectivity>,
}

impl App {
  /// Open the SQLite store from the configuration and build the context on it.
  pub fn open(config: Config) -> Result<Self> {
    let path = config.storage.database_path()?;
    let store = SqliteStorage::open(&path)
      .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;
    info!(path = %path.display(), "opened store");

    Self::with_store(config, Arc::new(store))
  }

  /// Build the context on an existing store.
  pub fn with_store(config: Config, store: Arc<dyn KeyValueStore>) -> Result<Self> {
    let api = ApiClient::new(&config.api, Arc::clone(&store))?;

    if let Some(token) = Config::get_api_token() {
      api.set_token(&token)?;
    }

    let cache = Arc::new(OfflineCache::load(store, Arc::new(LocalFiles))?);
    let downloader = Downloader::new(
      api.clone(),
      Arc::clone(&cache),
      config.storage.downloads_path()?,
    );
    let connectivity = HttpConnectivity::new(
      api.clone(),
      config.sync.probe_path.clone(),
      Duration::from_secs(config.sync.probe_timeout_secs),
    );
    let sync = SyncManager::new(api.clone(), Arc::clone(&cache), connectivity);

    Ok(Self {
      config,
      api,
      cache,
      downloader,
      sync,
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn api(&self) -> &ApiClient {
    &self.api
  }

  pub fn cache(&self) -> &Arc<OfflineCache> {
    &self.cache
  }

  pub fn downloader(&self) -> &Downloader {
    &self.downloader
  }

  pub fn sync(&self) -> &SyncManager<HttpConnectivity> {
    &self.sync
  }

  /// Forget all offline content. Local files are not deleted.
  pub fn reset(&self) -> Result<()> {
    self.cache.reset()?;
    Ok(())
  }
}
