//! Bounded retry with exponential back-off.
//!
//! The deadline covers the whole call including every attempt, not each
//! attempt on its own. Errors the classifier rejects are returned after
//! the first attempt without sleeping.

use crate::config::VcenterConfig;
use crate::error::{VcenterError, VcenterErrorKind, VcenterResult};

use log::warn;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Connection-level messages that mean "the endpoint is still coming up".
const CONNECT_TIMEOUT_MARKERS: &[&str] = &[
    "connection timed out",
    "os error 110",
    "os error 10060",
    "operation timed out",
];

/// Remote faults that clear up on their own.
const TRANSIENT_FAULT_MARKERS: &[&str] = &["STREAM ioctl timeout", "Device timeout", "Timer expired"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total wall-clock budget across all attempts
    pub timeout: Duration,
    pub initial_sleep: Duration,
    /// Back-off cap
    pub max_sleep: Duration,
}

impl RetryPolicy {
    pub fn new(timeout: Duration, initial_sleep: Duration) -> Self {
        Self {
            timeout,
            initial_sleep,
            max_sleep: initial_sleep.saturating_mul(8),
        }
    }

    pub fn with_max_sleep(mut self, max_sleep: Duration) -> Self {
        self.max_sleep = max_sleep.max(self.initial_sleep);
        self
    }

    /// Long budget: the endpoint may be rebooting.
    pub fn for_connect(config: &VcenterConfig) -> Self {
        Self::new(
            Duration::from_secs(config.connect_retry_timeout_secs),
            Duration::from_secs(config.connect_initial_sleep_secs),
        )
        .with_max_sleep(Duration::from_secs(120))
    }

    pub fn for_upload(config: &VcenterConfig) -> Self {
        Self::new(
            Duration::from_secs(config.upload_retry_timeout_secs),
            Duration::from_secs(config.upload_initial_sleep_secs),
        )
        .with_max_sleep(Duration::from_secs(60))
    }

    /// Run `op` until it succeeds, fails with an error `classify` rejects,
    /// or the deadline passes (the last error is returned).
    pub async fn execute<T, F, Fut, C>(&self, name: &str, mut op: F, classify: C) -> VcenterResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = VcenterResult<T>>,
        C: Fn(&VcenterError) -> bool,
    {
        let start = Instant::now();
        let mut sleep = self.initial_sleep;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !classify(&err) {
                return Err(err);
            }

            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                warn!(
                    "{name}: giving up after {attempt} attempts in {}s: {err}",
                    elapsed.as_secs()
                );
                return Err(err);
            }

            let delay = sleep
                .min(self.timeout - elapsed)
                .max(Duration::from_millis(1));
            warn!(
                "{name}: attempt {attempt} failed, retrying in {}ms: {err}",
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
            sleep = sleep.saturating_mul(2).min(self.max_sleep);
        }
    }
}

/// Classifier for connect and upload retries.
pub fn is_transient(err: &VcenterError) -> bool {
    if TRANSIENT_FAULT_MARKERS.iter().any(|m| err.message.contains(m)) {
        return true;
    }
    match err.kind {
        VcenterErrorKind::Timeout | VcenterErrorKind::TlsError => true,
        VcenterErrorKind::ConnectionError => {
            let lowered = err.message.to_lowercase();
            CONNECT_TIMEOUT_MARKERS.iter().any(|m| lowered.contains(m))
        }
        _ => false,
    }
}
