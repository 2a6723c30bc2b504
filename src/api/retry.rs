//! Backoff policy for rate-limited (HTTP 429) responses.

use chrono::{DateTime, Utc};
use reqwest::header::HeaderValue;
use std::time::Duration;

/// How often and how long to wait when the server rate-limits us.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
  /// Retries after the first attempt
  pub max_retries: u32,
  /// Delay used when the response carries no usable `Retry-After`
  pub fallback_delay: Duration,
  /// Upper bound on any single wait
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 3,
      fallback_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(60),
    }
  }
}

impl RetryPolicy {
  /// Delay before the next attempt, given the response's `Retry-After` header.
  pub fn delay_for(&self, retry_after: Option<&HeaderValue>) -> Duration {
    retry_after
      .and_then(|v| v.to_str().ok())
      .and_then(|v| parse_retry_after(v, Utc::now()))
      .unwrap_or(self.fallback_delay)
      .min(self.max_delay)
  }
}

/// Parse a `Retry-After` value: either delta-seconds or an HTTP-date.
/// Dates in the past yield a zero delay.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
  let value = value.trim();

  if let Ok(secs) = value.parse::<u64>() {
    return Some(Duration::from_secs(secs));
  }

  let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
  Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn test_parse_seconds() {
    assert_eq!(
      parse_retry_after(" 3 ", Utc::now()),
      Some(Duration::from_secs(3))
    );
    assert_eq!(parse_retry_after("0", Utc::now()), Some(Duration::ZERO));
  }

  #[test]
  fn test_parse_http_date() {
    let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 50).unwrap();
    assert_eq!(
      parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT", now),
      Some(Duration::from_secs(10))
    );
  }

  #[test]
  fn test_past_date_is_zero() {
    let now = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    assert_eq!(
      parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT", now),
      Some(Duration::ZERO)
    );
  }

  #[test]
  fn test_garbage_falls_back() {
    let policy = RetryPolicy {
      fallback_delay: Duration::from_millis(250),
      ..RetryPolicy::default()
    };
    assert_eq!(parse_retry_after("soon", Utc::now()), None);
    assert_eq!(
      policy.delay_for(Some(&HeaderValue::from_static("soon"))),
      Duration::from_millis(250)
    );
    assert_eq!(policy.delay_for(None), Duration::from_millis(250));
  }

  #[test]
  fn test_delay_is_capped() {
    let policy = RetryPolicy {
      max_delay: Duration::from_secs(5),
      ..RetryPolicy::default()
    };
    assert_eq!(
      policy.delay_for(Some(&HeaderValue::from_static("3600"))),
      Duration::from_secs(5)
    );
  }
}
