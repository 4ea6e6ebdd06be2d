use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreResult, TelemetryError};
use crate::model::TelemetryItem;

/// What a publisher reports after a successful publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Items handed to the destination.
    pub items_sent: usize,
    /// Items the destination confirmed. Equals `items_sent` when the
    /// destination does not report a count.
    pub items_accepted: usize,
    /// Network requests (or writes) it took.
    pub requests: usize,
}

/// A sink that transmits a batch of items to one destination.
///
/// Requirements:
/// - Implementations must be thread-safe (`Send + Sync`).
/// - Every outcome is returned; a publisher never drops a batch silently.
/// - Publishers do not retry internally; the next flush is the retry.
/// - `cancel` may fire at any time; implementations should stop between
///   requests and return `TelemetryError::Cancelled`.
#[async_trait]
pub trait TelemetryPublisher: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(
        &self,
        items: &[TelemetryItem],
        cancel: &CancellationToken,
    ) -> CoreResult<PublishReceipt>;
}

type FailureFn = Arc<dyn Fn(&str) -> TelemetryError + Send + Sync>;

/// Keeps every published batch in memory.
/// Useful for tests, local runs, or as a placeholder sink.
pub struct InMemoryPublisher {
    name: String,
    batches: Mutex<Vec<Vec<TelemetryItem>>>,
    attempts: Mutex<usize>,
    failure: Option<FailureFn>,
    delay: Duration,
}

impl InMemoryPublisher {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            batches: Mutex::new(Vec::new()),
            attempts: Mutex::new(0),
            failure: None,
            delay: Duration::ZERO,
        }
    }

    /// Every publish fails with the error built by `f` (given the publisher name).
    pub fn failing_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> TelemetryError + Send + Sync + 'static,
    {
        self.failure = Some(Arc::new(f));
        self
    }

    /// Simulated transmission time before the outcome is reported.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Batches that were accepted, in publish order.
    pub fn batches(&self) -> Vec<Vec<TelemetryItem>> {
        self.batches.lock().clone()
    }

    /// All accepted items, flattened.
    pub fn items(&self) -> Vec<TelemetryItem> {
        self.batches.lock().iter().flatten().cloned().collect()
    }

    /// Publish calls, including failed ones.
    pub fn attempts(&self) -> usize {
        *self.attempts.lock()
    }
}

#[async_trait]
impl TelemetryPublisher for InMemoryPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(
        &self,
        items: &[TelemetryItem],
        cancel: &CancellationToken,
    ) -> CoreResult<PublishReceipt> {
        *self.attempts.lock() += 1;

        if !self.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(TelemetryError::Cancelled { publisher: self.name.clone() });
                }
                _ = tokio::time::sleep(self.delay) => {}
            }
        }

        if let Some(fail) = &self.failure {
            return Err(fail(&self.name));
        }

        self.batches.lock().push(items.to_vec());
        Ok(PublishReceipt {
            items_sent: items.len(),
            items_accepted: items.len(),
            requests: 1,
        })
    }
}

impl std::fmt::Debug for InMemoryPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryPublisher")
            .field("name", &self.name)
            .field("failing", &self.failure.is_some())
            .finish_non_exhaustive()
    }
}
