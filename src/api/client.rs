use reqwest::header::RETRY_AFTER;
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::retry::RetryPolicy;
use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::store::{KeyValueStore, AUTH_TOKEN_KEY};

type Registry = Arc<Mutex<HashMap<String, InFlightEntry>>>;

struct InFlightEntry {
  id: u64,
  token: CancellationToken,
}

fn lock_registry(
  registry: &Mutex<HashMap<String, InFlightEntry>>,
) -> MutexGuard<'_, HashMap<String, InFlightEntry>> {
  registry.lock().unwrap_or_else(|e| e.into_inner())
}

/// Registration of one in-flight request.
///
/// Cancelled when a newer request with the same method and path starts.
/// Dropping it unregisters the request unless a newer one already took its slot.
pub struct InFlight {
  key: String,
  id: u64,
  token: CancellationToken,
  registry: Registry,
}

impl InFlight {
  pub fn key(&self) -> &str {
    &self.key
  }

  /// Token that fires once this request has been superseded.
  pub fn token(&self) -> CancellationToken {
    self.token.clone()
  }
}

impl Drop for InFlight {
  fn drop(&mut self) {
    let mut registry = lock_registry(&self.registry);
    if registry.get(&self.key).is_some_and(|e| e.id == self.id) {
      registry.remove(&self.key);
    }
  }
}

/// A response whose body is read by the caller, together with its
/// de-duplication registration.
pub struct Streamed {
  pub response: Response,
  pub in_flight: InFlight,
}

/// HTTP client for the content API.
///
/// Attaches the stored bearer token, cancels an older in-flight request when a
/// new one with the same method and path is issued, retries rate-limited
/// requests and forgets the token when the server rejects it.
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  base_url: String,
  store: Arc<dyn KeyValueStore>,
  retry: RetryPolicy,
  in_flight: Registry,
  next_id: Arc<AtomicU64>,
}

impl ApiClient {
  pub fn new(config: &ApiConfig, store: Arc<dyn KeyValueStore>) -> Result<Self> {
    // Validate once so request URLs only need appending
    Url::parse(&config.base_url)?;

    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .user_agent(concat!("docvault/", env!("CARGO_PKG_VERSION")))
      .build()?;

    Ok(Self {
      http,
      base_url: config.base_url.trim_end_matches('/').to_string(),
      store,
      retry: RetryPolicy {
        max_retries: config.max_retries,
        fallback_delay: Duration::from_millis(config.retry_delay_ms),
        ..RetryPolicy::default()
      },
      in_flight: Arc::new(Mutex::new(HashMap::new())),
      next_id: Arc::new(AtomicU64::new(0)),
    })
  }

  fn url(&self, path: &str) -> Result<Url> {
    let path = path.trim_start_matches('/');
    Ok(Url::parse(&format!("{}/{}", self.base_url, path))?)
  }

  // ==========================================================================
  // Credentials
  // ==========================================================================

  pub fn set_token(&self, token: &str) -> Result<()> {
    self.store.set(AUTH_TOKEN_KEY, token)
  }

  pub fn clear_token(&self) -> Result<()> {
    self.store.remove(AUTH_TOKEN_KEY)
  }

  pub fn has_token(&self) -> Result<bool> {
    Ok(self.store.get(AUTH_TOKEN_KEY)?.is_some())
  }

  // ==========================================================================
  // Requests
  // ==========================================================================

  /// GET `path` and decode the JSON body.
  pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
    self.request_json(Method::GET, path, None).await
  }

  /// POST `body` as JSON to `path` and decode the JSON response.
  pub async fn post_json<B: Serialize, T: DeserializeOwned>(
    &self,
    path: &str,
    body: &B,
  ) -> Result<T> {
    let body = serde_json::to_value(body)?;
    self.request_json(Method::POST, path, Some(body)).await
  }

  /// Issue a request and hand back the response with its body unread.
  ///
  /// The caller should watch `in_flight.token()` while consuming the body;
  /// it fires when a newer request for the same method and path starts.
  pub async fn fetch(&self, method: Method, path: &str) -> Result<Streamed> {
    let in_flight = self.begin(&method, path);
    let token = in_flight.token();

    let response = tokio::select! {
      _ = token.cancelled() => return Err(Error::Superseded { key: in_flight.key.clone() }),
      response = self.execute(&method, path, None) => response?,
    };

    Ok(Streamed {
      response,
      in_flight,
    })
  }

  /// Check whether `path` answers at all, ignoring status, auth and retries.
  pub async fn probe(&self, path: &str, timeout: Duration) -> bool {
    let Ok(url) = self.url(path) else {
      return false;
    };
    match self.http.get(url).timeout(timeout).send().await {
      Ok(_) => true,
      Err(e) => {
        debug!(error = %e, "connectivity probe failed");
        false
      }
    }
  }

  async fn request_json<T: DeserializeOwned>(
    &self,
    method: Method,
    path: &str,
    body: Option<Value>,
  ) -> Result<T> {
    let in_flight = self.begin(&method, path);
    let token = in_flight.token();

    let work = async {
      let response = self.execute(&method, path, body.as_ref()).await?;
      let bytes = response.bytes().await?;
      Ok::<T, Error>(serde_json::from_slice(&bytes)?)
    };

    tokio::select! {
      _ = token.cancelled() => Err(Error::Superseded { key: in_flight.key.clone() }),
      result = work => result,
    }
  }

  /// Register a request, cancelling any older one with the same key.
  fn begin(&self, method: &Method, path: &str) -> InFlight {
    let key = format!("{} {}", method, path);
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let token = CancellationToken::new();

    let previous = lock_registry(&self.in_flight).insert(
      key.clone(),
      InFlightEntry {
        id,
        token: token.clone(),
      },
    );
    if let Some(previous) = previous {
      debug!(%key, "superseding in-flight request");
      previous.token.cancel();
    }

    InFlight {
      key,
      id,
      token,
      registry: Arc::clone(&self.in_flight),
    }
  }

  /// Send the request, retrying on 429 and mapping error statuses.
  async fn execute(&self, method: &Method, path: &str, body: Option<&Value>) -> Result<Response> {
    let url = self.url(path)?;
    let mut attempt = 0u32;

    loop {
      let mut request = self.http.request(method.clone(), url.clone());
      if let Some(token) = self.store.get(AUTH_TOKEN_KEY)? {
        request = request.bearer_auth(token);
      }
      if let Some(body) = body {
        request = request.json(body);
      }

      debug!(%method, %url, attempt, "sending request");
      let response = request.send().await?;
      let status = response.status();

      if status == StatusCode::UNAUTHORIZED {
        warn!(%method, %url, "authorization rejected, clearing stored token");
        self.store.remove(AUTH_TOKEN_KEY)?;
        return Err(Error::AuthExpired);
      }

      if status == StatusCode::TOO_MANY_REQUESTS {
        if attempt >= self.retry.max_retries {
          return Err(Error::RateLimited {
            attempts: attempt + 1,
          });
        }
        let delay = self.retry.delay_for(response.headers().get(RETRY_AFTER));
        attempt += 1;
        warn!(%method, %url, attempt, ?delay, "rate limited, retrying");
        tokio::time::sleep(delay).await;
        continue;
      }

      if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(Error::Http {
          status: status.as_u16(),
          message,
        });
      }

      return Ok(response);
    }
  }
}
