//! Remote content API boundary.

mod client;
mod retry;

pub use client::{ApiClient, InFlight, Streamed};
pub use retry::{parse_retry_after, RetryPolicy};
