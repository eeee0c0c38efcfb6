//! Persistence (subjects, sync targets, watermarks) and shared HTTP retry
//! utilities for the sync pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use intim_core::{SubjectProfile, SyncTarget};
use rand::Rng;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub mod memory;
pub mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

pub const CRATE_NAME: &str = "intim-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A subject whose profile still misses a required field, together with what
/// is needed to read its validation store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSubject {
    pub subject_id: String,
    pub access_token: String,
    pub sink_database_id: String,
    pub validation_database_id: String,
}

#[async_trait]
pub trait SubjectRepository: Send + Sync {
    async fn find_incomplete(&self) -> Result<Vec<PendingSubject>, StoreError>;

    /// Persist the profile and return the subject's sync target, in one
    /// transaction. `None` when the subject or its target does not exist; in
    /// that case nothing is written.
    async fn complete_profile(
        &self,
        subject_id: &str,
        profile: &SubjectProfile,
    ) -> Result<Option<SyncTarget>, StoreError>;
}

#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Insert or overwrite. The last write wins, even if it is older.
    async fn upsert_watermark(
        &self,
        subject_id: &str,
        treated_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn watermark(&self, subject_id: &str) -> Result<Option<DateTime<Utc>>, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
    AuthRejected,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        RetryDisposition::AuthRejected
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Capped exponential backoff with proportional jitter. Used by every call
/// site that retries.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Extra random delay, as a fraction of the computed delay.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn jittered_delay(&self, attempt_index: usize) -> Duration {
        let delay = self.delay_for_attempt(attempt_index);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
        delay + delay.mul_f64(extra)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

/// One client per outbound call class, each with its own timeout.
pub fn build_http_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}

/// Lazily created async mutex per key; serializes work for the same key
/// while letting different keys proceed concurrently.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock().await;
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
        assert_eq!(policy.jittered_delay(1), Duration::from_millis(200));
    }

    #[test]
    fn jitter_stays_within_its_fraction() {
        let policy = BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: 0.5,
        };
        for _ in 0..50 {
            let delay = policy.jittered_delay(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
        assert_eq!(BackoffPolicy::default().max_attempts(), 3);
    }

    #[test]
    fn status_classification_separates_auth_from_transient() {
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::AuthRejected);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::AuthRejected);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn keyed_locks_serialize_same_key_only() {
        let locks = Arc::new(KeyedLocks::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let (locks, active, peak) = (locks.clone(), active.clone(), peak.clone());
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("subject-a").await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);

        let _a = locks.lock("subject-a").await;
        let _b = tokio::time::timeout(Duration::from_millis(50), locks.lock("subject-b"))
            .await
            .expect("other keys are not blocked");
    }
}
