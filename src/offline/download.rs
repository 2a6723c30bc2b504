//! Streams item content to local files and drives the item status machine.

use futures::StreamExt;
use reqwest::Method;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::OfflineCache;
use super::item::{ItemPatch, ItemStatus, OfflineItem};
use crate::api::ApiClient;
use crate::error::{Error, Result};

/// File name for an item's content. Hashing keeps arbitrary ids path-safe.
///
/// Content streams into `<sha256(id)>.part` and is renamed to
/// `<sha256(id)>.bin` once complete.
pub fn content_file_name(id: &str) -> String {
  format!("{}.bin", hex::encode(Sha256::digest(id.as_bytes())))
}

/// Downloads offline items into a directory.
pub struct Downloader {
  api: ApiClient,
  cache: Arc<OfflineCache>,
  dir: PathBuf,
  /// Cancellation tokens for active downloads, by item id
  active: Mutex<HashMap<String, CancellationToken>>,
}

/// Unregisters an active download when it ends, however it ends.
struct ActiveDownload<'a> {
  id: String,
  active: &'a Mutex<HashMap<String, CancellationToken>>,
}

impl Drop for ActiveDownload<'_> {
  fn drop(&mut self) {
    lock(self.active).remove(&self.id);
  }
}

fn lock(
  active: &Mutex<HashMap<String, CancellationToken>>,
) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
  active.lock().unwrap_or_else(|e| e.into_inner())
}

impl Downloader {
  pub fn new(api: ApiClient, cache: Arc<OfflineCache>, dir: impl Into<PathBuf>) -> Self {
    Self {
      api,
      cache,
      dir: dir.into(),
      active: Mutex::new(HashMap::new()),
    }
  }

  /// Download a pending item.
  pub async fn download(&self, id: &str) -> Result<OfflineItem> {
    let item = self
      .cache
      .get_by_id(id)
      .ok_or_else(|| Error::NotFound(id.to_string()))?;
    if item.status != ItemStatus::Pending {
      return Err(Error::InvalidTransition {
        id: id.to_string(),
        from: item.status,
        to: ItemStatus::Downloading,
      });
    }

    let (token, _active) = self.register(&item)?;
    let item = self
      .cache
      .update(id, ItemPatch::new().status(ItemStatus::Downloading).progress(0))?
      .ok_or_else(|| Error::NotFound(id.to_string()))?;

    self.run(item, token).await
  }

  /// Retry a failed item: error -> downloading, then download again.
  ///
  /// Also restarts an item left in `downloading` with no active download,
  /// which happens when its final state could not be stored.
  pub async fn retry(&self, id: &str) -> Result<OfflineItem> {
    let item = self
      .cache
      .get_by_id(id)
      .ok_or_else(|| Error::NotFound(id.to_string()))?;

    let (token, _active) = self.register(&item)?;
    let item = match item.status {
      ItemStatus::Downloading => {
        warn!(%id, "restarting orphaned download");
        self
          .cache
          .update(id, ItemPatch::new().progress(0))?
          .ok_or_else(|| Error::NotFound(id.to_string()))?
      }
      _ => self.cache.retry(id)?,
    };

    self.run(item, token).await
  }

  /// Cancel an active download. Returns false if the item is not downloading.
  pub fn cancel(&self, id: &str) -> bool {
    match lock(&self.active).get(id) {
      Some(token) => {
        token.cancel();
        true
      }
      None => false,
    }
  }

  pub fn is_active(&self, id: &str) -> bool {
    lock(&self.active).contains_key(id)
  }

  fn register(&self, item: &OfflineItem) -> Result<(CancellationToken, ActiveDownload<'_>)> {
    let mut active = lock(&self.active);
    if active.contains_key(&item.id) {
      return Err(Error::InvalidTransition {
        id: item.id.clone(),
        from: ItemStatus::Downloading,
        to: ItemStatus::Downloading,
      });
    }

    let token = CancellationToken::new();
    active.insert(item.id.clone(), token.clone());
    Ok((
      token,
      ActiveDownload {
        id: item.id.clone(),
        active: &self.active,
      },
    ))
  }

  async fn run(&self, item: OfflineItem, token: CancellationToken) -> Result<OfflineItem> {
    let final_path = self.dir.join(content_file_name(&item.id));
    let part_path = final_path.with_extension("part");
    info!(id = %item.id, path = %final_path.display(), "downloading offline item");

    let result = tokio::select! {
      _ = token.cancelled() => Err("download cancelled".to_string()),
      result = self.fetch_to_file(&item, &part_path) => result.map_err(|e| e.to_string()),
    };

    let outcome = match result {
      Ok(size) => match tokio::fs::rename(&part_path, &final_path).await {
        Ok(()) => Ok(size),
        Err(e) => Err(e.to_string()),
      },
      Err(message) => Err(message),
    };

    match outcome {
      Ok(size) => {
        let updated = self
          .cache
          .update(&item.id, ItemPatch::downloaded(size, &final_path))?;
        match updated {
          Some(updated) => {
            info!(id = %item.id, size, "offline item downloaded");
            Ok(updated)
          }
          None => {
            // Removed while downloading; nothing references the file any more
            let _ = tokio::fs::remove_file(&final_path).await;
            Err(Error::NotFound(item.id))
          }
        }
      }
      Err(message) => {
        warn!(id = %item.id, error = %message, "offline download failed");
        if let Err(e) = tokio::fs::remove_file(&part_path).await {
          if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %part_path.display(), error = %e, "failed to remove partial download");
          }
        }
        self
          .cache
          .update(&item.id, ItemPatch::failed(message.clone()))?;
        Err(Error::DownloadFailure {
          id: item.id,
          message,
        })
      }
    }
  }

  /// Stream the item's content into `part_path`, reporting whole-percent progress.
  /// Returns the number of bytes written.
  async fn fetch_to_file(&self, item: &OfflineItem, part_path: &Path) -> Result<u64> {
    let encoded_id: String = url::form_urlencoded::byte_serialize(item.id.as_bytes()).collect();
    let path = format!("/{}/{}/download", item.item_type.api_segment(), encoded_id);

    let streamed = self.api.fetch(Method::GET, &path).await?;
    let superseded = streamed.in_flight.token();
    let total = streamed.response.content_length().filter(|t| *t > 0);

    tokio::fs::create_dir_all(&self.dir).await?;
    let mut file = tokio::fs::File::create(part_path).await?;
    let mut stream = streamed.response.bytes_stream();
    let mut written = 0u64;
    let mut last_percent = 0u8;

    loop {
      let chunk = tokio::select! {
        _ = superseded.cancelled() => {
          return Err(Error::Superseded { key: streamed.in_flight.key().to_string() });
        }
        chunk = stream.next() => chunk,
      };
      let Some(chunk) = chunk else {
        break;
      };
      let chunk = chunk?;
      file.write_all(&chunk).await?;
      written += chunk.len() as u64;

      if let Some(total) = total {
        let percent = (written.saturating_mul(100) / total).min(100) as u8;
        if percent != last_percent {
          last_percent = percent;
          debug!(id = %item.id, percent, "download progress");
          self
            .cache
            .update(&item.id, ItemPatch::new().progress(percent))?
            .ok_or_else(|| Error::NotFound(item.id.clone()))?;
        }
      }
    }

    file.flush().await?;
    Ok(written)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::ApiConfig;
  use crate::offline::{ItemMetadata, ItemType, LocalFiles};
  use crate::store::MemoryStorage;
  use std::time::Duration;
  use tokio::io::AsyncReadExt;
  use tokio::net::TcpListener;
  use wiremock::matchers::{method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  struct Fixture {
    _server: Option<MockServer>,
    _dir: tempfile::TempDir,
    api: ApiClient,
    cache: Arc<OfflineCache>,
    downloader: Arc<Downloader>,
  }

  async fn fixture(route: &str, response: ResponseTemplate) -> Fixture {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path(route))
      .respond_with(response)
      .mount(&server)
      .await;

    let mut f = fixture_at(server.uri());
    f._server = Some(server);
    f
  }

  fn fixture_at(base_url: String) -> Fixture {
    let store = Arc::new(MemoryStorage::new());
    let cache = Arc::new(OfflineCache::load(store.clone(), Arc::new(LocalFiles)).unwrap());
    let api = ApiClient::new(
      &ApiConfig {
        base_url,
        timeout_secs: 5,
        max_retries: 0,
        retry_delay_ms: 0,
      },
      store,
    )
    .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let downloader = Arc::new(Downloader::new(
      api.clone(),
      cache.clone(),
      dir.path().join("files"),
    ));

    Fixture {
      _server: None,
      _dir: dir,
      api,
      cache,
      downloader,
    }
  }

  /// Server that announces `total` bytes, sends the first `sent` and then stalls.
  async fn stalling_server(total: usize, sent: usize) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
      loop {
        let Ok((mut socket, _)) = listener.accept().await else {
          return;
        };
        tokio::spawn(async move {
          let mut buf = [0u8; 4096];
          let _ = socket.read(&mut buf).await;
          let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\n\r\n",
            total
          );
          socket.write_all(head.as_bytes()).await.unwrap();
          socket.write_all(&vec![3u8; sent]).await.unwrap();
          socket.flush().await.unwrap();
          tokio::time::sleep(Duration::from_secs(30)).await;
        });
      }
    });

    format!("http://{}", addr)
  }

  async fn wait_for_progress(cache: &OfflineCache, id: &str, percent: u8) {
    for _ in 0..200 {
      if cache.get_by_id(id).and_then(|i| i.download_progress) == Some(percent) {
        return;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
      "progress never reached {}%: {:?}",
      percent,
      cache.get_by_id(id)
    );
  }

  fn report(id: &str) -> OfflineItem {
    OfflineItem::new(id, ItemType::Report, ItemMetadata::default())
  }

  #[test]
  fn test_content_file_name_is_stable_and_path_safe() {
    let a = content_file_name("reports/../../etc");
    assert_eq!(a, content_file_name("reports/../../etc"));
    assert_eq!(a.len(), 64 + ".bin".len());
    assert!(!a.contains('/'));
    assert_ne!(a, content_file_name("other"));
    assert_eq!(
      Path::new(&a).with_extension("part").to_str().unwrap(),
      format!("{}.part", &a[..64])
    );
  }

  #[tokio::test]
  async fn test_download_success() {
    let body = vec![7u8; 4096];
    let f = fixture(
      "/reports/r1/download",
      ResponseTemplate::new(200).set_body_bytes(body.clone()),
    )
    .await;
    f.cache.add(report("r1")).unwrap();

    let item = f.downloader.download("r1").await.unwrap();
    assert_eq!(item.status, ItemStatus::Downloaded);
    assert_eq!(item.size, 4096);
    assert_eq!(item.download_progress, None);

    let path = item.local_path.unwrap();
    assert_eq!(path.file_name().unwrap().to_str().unwrap(), content_file_name("r1"));
    assert_eq!(std::fs::read(&path).unwrap(), body);
    assert!(!path.with_extension("part").exists());
    assert_eq!(f.cache.total_storage_used(), 4096);
    assert!(!f.downloader.is_active("r1"));
  }

  #[tokio::test]
  async fn test_download_failure_marks_item_error_then_retry() {
    let f = fixture("/reports/r1/download", ResponseTemplate::new(500)).await;
    f.cache.add(report("r1")).unwrap();

    let err = f.downloader.download("r1").await.unwrap_err();
    assert!(matches!(err, Error::DownloadFailure { ref id, .. } if id == "r1"));

    let failed = f.cache.get_by_id("r1").unwrap();
    assert_eq!(failed.status, ItemStatus::Error);
    assert!(failed.error.as_deref().unwrap().contains("500"));
    assert!(failed.local_path.is_none());

    // Retry goes through downloading again and fails the same way
    let err = f.downloader.retry("r1").await.unwrap_err();
    assert!(matches!(err, Error::DownloadFailure { .. }));
    assert_eq!(f.cache.get_by_id("r1").unwrap().status, ItemStatus::Error);
  }

  #[tokio::test]
  async fn test_download_requires_pending() {
    let f = fixture("/reports/r1/download", ResponseTemplate::new(200)).await;
    f.cache.add(report("r1")).unwrap();
    f.cache
      .update("r1", ItemPatch::new().status(ItemStatus::Downloading))
      .unwrap();

    let err = f.downloader.download("r1").await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));

    let err = f.downloader.download("nope").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
  }

  #[tokio::test]
  async fn test_cancel_active_download() {
    let f = fixture(
      "/reports/slow/download",
      ResponseTemplate::new(200)
        .set_body_bytes(vec![1u8; 16])
        .set_delay(Duration::from_secs(5)),
    )
    .await;
    f.cache.add(report("slow")).unwrap();

    let handle = {
      let downloader = f.downloader.clone();
      tokio::spawn(async move { downloader.download("slow").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(f.downloader.is_active("slow"));
    assert!(f.downloader.cancel("slow"));

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::DownloadFailure { ref message, .. } if message == "download cancelled"));

    let item = f.cache.get_by_id("slow").unwrap();
    assert_eq!(item.status, ItemStatus::Error);
    assert!(!f.downloader.is_active("slow"));
    assert!(!f.downloader.cancel("slow"));
  }

  #[tokio::test]
  async fn test_progress_reported_while_streaming() {
    let f = fixture_at(stalling_server(200, 80).await);
    f.cache.add(report("r1")).unwrap();

    let handle = {
      let downloader = f.downloader.clone();
      tokio::spawn(async move { downloader.download("r1").await })
    };

    // 80 of 200 bytes
    wait_for_progress(&f.cache, "r1", 40).await;
    let item = f.cache.get_by_id("r1").unwrap();
    assert_eq!(item.status, ItemStatus::Downloading);
    assert!(item.local_path.is_none());

    assert!(f.downloader.cancel("r1"));
    handle.await.unwrap().unwrap_err();
    assert_eq!(f.cache.get_by_id("r1").unwrap().download_progress, None);
  }

  #[tokio::test]
  async fn test_newer_request_supersedes_streaming_download() {
    let f = fixture_at(stalling_server(100, 10).await);
    f.cache.add(report("r1")).unwrap();

    let handle = {
      let downloader = f.downloader.clone();
      tokio::spawn(async move { downloader.download("r1").await })
    };
    wait_for_progress(&f.cache, "r1", 10).await;

    let _newer = f
      .api
      .fetch(Method::GET, "/reports/r1/download")
      .await
      .unwrap();

    let err = handle.await.unwrap().unwrap_err();
    assert!(
      matches!(err, Error::DownloadFailure { ref message, .. } if message.contains("superseded"))
    );
    let item = f.cache.get_by_id("r1").unwrap();
    assert_eq!(item.status, ItemStatus::Error);

    let part = f
      .downloader
      .dir
      .join(content_file_name("r1"))
      .with_extension("part");
    assert!(!part.exists());
  }

  #[tokio::test]
  async fn test_retry_restarts_orphaned_download() {
    let body = vec![9u8; 64];
    let f = fixture(
      "/reports/r1/download",
      ResponseTemplate::new(200).set_body_bytes(body.clone()),
    )
    .await;
    f.cache.add(report("r1")).unwrap();
    // Left downloading with nothing running, as after a failed final write
    f.cache
      .update("r1", ItemPatch::new().status(ItemStatus::Downloading).progress(40))
      .unwrap();

    let err = f.downloader.download("r1").await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));

    let item = f.downloader.retry("r1").await.unwrap();
    assert_eq!(item.status, ItemStatus::Downloaded);
    assert_eq!(item.size, 64);
    assert_eq!(std::fs::read(item.local_path.unwrap()).unwrap(), body);
  }
}
