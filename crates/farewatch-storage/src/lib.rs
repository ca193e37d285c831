//! HTTP client plumbing and the persistence adapter for farewatch.

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub mod memory;
pub mod postgrest;
pub mod store;

pub use memory::MemoryStore;
pub use postgrest::{decode_each_row, Filter, FilterOp, Query, RowBatch, StoreConfig, TableClient};
pub use store::{FareStore, PostgrestStore, StoreError};

pub const CRATE_NAME: &str = "farewatch-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Only HTTP 429 is retryable; POSTs are not idempotent.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

impl HttpClientConfig {
    /// Builder with the shared timeout, compression and user agent, for
    /// callers that need to add their own default headers.
    pub fn client_builder(&self) -> reqwest::ClientBuilder {
        let builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(self.timeout);
        match &self.user_agent {
            Some(user_agent) => builder.user_agent(user_agent.clone()),
            None => builder,
        }
    }

    pub fn build_client(&self) -> anyhow::Result<reqwest::Client> {
        self.client_builder().build().context("building reqwest client")
    }

    pub fn token_bucket(&self) -> Option<SimpleTokenBucket> {
        self.token_bucket
            .map(|c| SimpleTokenBucket::new(c.capacity, c.refill_every))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Waits for a token. Whole refill periods are credited and the
    /// remainder is carried over, so slow callers do not lose budget.
    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            if !self.refill_every.is_zero() {
                let elapsed = state.last_refill.elapsed();
                let periods = (elapsed.as_nanos() / self.refill_every.as_nanos()) as u32;
                if periods > 0 {
                    state.tokens = state.tokens.saturating_add(periods).min(self.capacity);
                    state.last_refill += self.refill_every * periods;
                }
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let wait = self.refill_every.saturating_sub(state.last_refill.elapsed());
            drop(state);
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    pub async fn available(&self) -> u32 {
        self.state.lock().await.tokens
    }
}
