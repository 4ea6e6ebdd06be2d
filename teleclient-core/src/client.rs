//! The telemetry client: Track* calls, activity scopes, and fan-out publish.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use reqwest::Url;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::activity::{ActivityScopeTracker, ScopeToken};
use crate::clock::{Clock, SystemClock};
use crate::error::{CoreResult, TelemetryError};
use crate::model::{ExceptionDetails, SeverityLevel, TelemetryData, TelemetryItem, TelemetryOperation};
use crate::publisher::{PublishReceipt, TelemetryPublisher};
use crate::tags::TelemetryTags;

/// How one publisher fared in a publish.
#[derive(Debug)]
pub enum PublishStatus {
    Success(PublishReceipt),
    Failed(TelemetryError),
    /// The cancellation signal fired before the publisher finished.
    Cancelled,
}

impl PublishStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Failed(_) => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn error(&self) -> Option<&TelemetryError> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct PublisherOutcome {
    pub publisher: String,
    pub status: PublishStatus,
}

/// Per-publisher outcomes of one publish, in registration order.
#[derive(Debug, Default)]
pub struct PublishResult {
    /// Items drained from the buffer for this publish.
    pub items: usize,
    pub outcomes: Vec<PublisherOutcome>,
}

impl PublishResult {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.status.is_success())
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &PublisherOutcome> {
        self.outcomes.iter().filter(|o| o.status.is_success())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &TelemetryError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.status.error().map(|e| (o.publisher.as_str(), e)))
    }

    pub fn cancelled(&self) -> impl Iterator<Item = &PublisherOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, PublishStatus::Cancelled))
    }

    pub fn outcome(&self, publisher: &str) -> Option<&PublishStatus> {
        self.outcomes
            .iter()
            .find(|o| o.publisher == publisher)
            .map(|o| &o.status)
    }
}

/// Buffers telemetry for one logical unit of work and publishes it to every
/// registered publisher.
///
/// Track* calls never block and never touch the network. The ambient
/// operation is shared state of a single logical call chain; a client is
/// created per unit of work and dropped after its final publish.
pub struct TelemetryClient {
    publishers: Vec<Arc<dyn TelemetryPublisher>>,
    tags: RwLock<TelemetryTags>,
    scopes: ActivityScopeTracker,
    buffer: Mutex<Vec<TelemetryItem>>,
    clock: Arc<dyn Clock>,
}

impl TelemetryClient {
    pub fn new(publishers: Vec<Arc<dyn TelemetryPublisher>>, tags: TelemetryTags) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            publishers,
            tags: RwLock::new(tags),
            scopes: ActivityScopeTracker::new(TelemetryOperation::default(), clock.clone()),
            buffer: Mutex::new(Vec::new()),
            clock,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.scopes = ActivityScopeTracker::new(self.scopes.operation(), clock.clone());
        self.clock = clock;
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn publisher_names(&self) -> Vec<&str> {
        self.publishers.iter().map(|p| p.name()).collect()
    }

    /// Snapshot of the client's default tags.
    pub fn tags(&self) -> TelemetryTags {
        self.tags.read().clone()
    }

    /// Replace the default tags. Already buffered items keep their snapshot.
    pub fn set_tags(&self, tags: TelemetryTags) {
        *self.tags.write() = tags;
    }

    pub fn set_tag(&self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.write().insert(key, value);
    }

    pub fn operation(&self) -> TelemetryOperation {
        self.scopes.operation()
    }

    /// Set the ambient operation. Meant to be called once, before the first
    /// Track* call of a unit of work.
    pub fn set_operation(&self, operation: TelemetryOperation) {
        self.scopes.set_operation(operation);
    }

    pub fn activity_scope_begin(&self, activity_id: impl Into<String>) -> ScopeToken {
        self.scopes.begin(activity_id)
    }

    pub fn activity_scope_end(&self, token: ScopeToken) -> Duration {
        self.scopes.end(token)
    }

    /// Items buffered and not yet drained by a publish.
    pub fn pending_items(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn track_trace(
        &self,
        message: impl Into<String>,
        severity: SeverityLevel,
        tags: Option<&TelemetryTags>,
    ) {
        self.track(
            self.clock.wall(),
            TelemetryData::Trace {
                message: message.into(),
                severity,
            },
            tags,
        );
    }

    /// Like [`track_trace`](Self::track_trace) with a numeric level (0..=4).
    pub fn track_trace_level(
        &self,
        message: impl Into<String>,
        level: i32,
        tags: Option<&TelemetryTags>,
    ) -> CoreResult<()> {
        let severity = SeverityLevel::try_from(level)?;
        self.track_trace(message, severity, tags);
        Ok(())
    }

    pub fn track_event(&self, name: impl Into<String>, tags: Option<&TelemetryTags>) {
        self.track(
            self.clock.wall(),
            TelemetryData::Event { name: name.into() },
            tags,
        );
    }

    pub fn track_exception<E>(&self, error: &E, tags: Option<&TelemetryTags>)
    where
        E: std::error::Error + ?Sized,
    {
        self.track_exception_details(ExceptionDetails::from_error(error), tags);
    }

    pub fn track_exception_details(&self, details: ExceptionDetails, tags: Option<&TelemetryTags>) {
        self.track(self.clock.wall(), TelemetryData::Exception { details }, tags);
    }

    /// `name` defaults to the URI when absent.
    #[allow(clippy::too_many_arguments)]
    pub fn track_request(
        &self,
        start_time: DateTime<Utc>,
        duration: Duration,
        id: impl Into<String>,
        uri: &Url,
        response_code: impl Into<String>,
        success: bool,
        name: Option<&str>,
        tags: Option<&TelemetryTags>,
    ) {
        self.track(
            start_time,
            TelemetryData::Request {
                duration,
                id: id.into(),
                uri: uri.clone(),
                response_code: response_code.into(),
                success,
                name: name.map(str::to_string),
            },
            tags,
        );
    }

    pub fn track_dependency_in_proc(
        &self,
        start_time: DateTime<Utc>,
        duration: Duration,
        id: impl Into<String>,
        name: impl Into<String>,
        success: bool,
        tags: Option<&TelemetryTags>,
    ) {
        self.track(
            start_time,
            TelemetryData::DependencyInProc {
                duration,
                id: id.into(),
                name: name.into(),
                success,
            },
            tags,
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn track_dependency_http(
        &self,
        start_time: DateTime<Utc>,
        duration: Duration,
        id: impl Into<String>,
        method: impl Into<String>,
        uri: &Url,
        status_code: u16,
        success: bool,
        tags: Option<&TelemetryTags>,
    ) {
        self.track(
            start_time,
            TelemetryData::DependencyHttp {
                duration,
                id: id.into(),
                method: method.into(),
                uri: uri.clone(),
                status_code,
                success,
            },
            tags,
        );
    }

    pub fn track_page_view(
        &self,
        start_time: DateTime<Utc>,
        duration: Duration,
        id: impl Into<String>,
        name: impl Into<String>,
        uri: &Url,
        tags: Option<&TelemetryTags>,
    ) {
        self.track(
            start_time,
            TelemetryData::PageView {
                duration,
                id: id.into(),
                name: name.into(),
                uri: uri.clone(),
            },
            tags,
        );
    }

    /// Client defaults, then the ambient operation, then call-site tags.
    fn item_tags(&self, call_site: Option<&TelemetryTags>) -> TelemetryTags {
        let base = self.tags.read().clone().with_operation(&self.scopes.operation());
        match call_site {
            Some(overlay) => base.merged(overlay),
            None => base,
        }
    }

    fn track(&self, time: DateTime<Utc>, data: TelemetryData, tags: Option<&TelemetryTags>) {
        let item = TelemetryItem::new(time, self.item_tags(tags), data);
        tracing::trace!(kind = ?item.kind(), operation_id = ?item.operation_id(), "tracked");
        self.buffer.lock().push(item);
    }

    fn drain(&self) -> Vec<TelemetryItem> {
        std::mem::take(&mut *self.buffer.lock())
    }

    /// Drain the buffer and send the batch to every publisher concurrently.
    ///
    /// Items tracked while this runs land in the next batch. Individual
    /// publisher failures are reported in the result, never returned as an
    /// error. When `cancel` fires, publishers that already finished keep their
    /// outcome and the rest are reported as cancelled.
    pub async fn publish(&self, cancel: &CancellationToken) -> PublishResult {
        let batch = self.drain();
        tracing::debug!(
            items = batch.len(),
            publishers = self.publishers.len(),
            "draining telemetry buffer"
        );

        let batch = &batch;
        let sends = self.publishers.iter().map(|publisher| {
            let span = tracing::info_span!(
                "telemetry_publish",
                publisher = %publisher.name(),
                items = batch.len(),
                status = tracing::field::Empty
            );
            let fut = async move {
                let status = tokio::select! {
                    biased;
                    res = publisher.publish(batch, cancel) => match res {
                        Ok(receipt) => PublishStatus::Success(receipt),
                        Err(TelemetryError::Cancelled { .. }) => PublishStatus::Cancelled,
                        Err(e) => PublishStatus::Failed(e),
                    },
                    _ = cancel.cancelled() => PublishStatus::Cancelled,
                };
                tracing::Span::current().record("status", status.as_str());
                match &status {
                    PublishStatus::Failed(e) => tracing::warn!(
                        publisher = %publisher.name(),
                        error = %e,
                        kind = e.kind(),
                        retryable = e.is_retryable(),
                        "telemetry publish failed"
                    ),
                    PublishStatus::Cancelled => tracing::warn!(
                        publisher = %publisher.name(),
                        "telemetry publish cancelled"
                    ),
                    PublishStatus::Success(_) => {}
                }
                PublisherOutcome {
                    publisher: publisher.name().to_string(),
                    status,
                }
            };
            fut.instrument(span)
        });

        PublishResult {
            items: batch.len(),
            outcomes: join_all(sends).await,
        }
    }
}

impl fmt::Debug for TelemetryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryClient")
            .field("publishers", &self.publisher_names())
            .field("scopes", &self.scopes)
            .field("pending_items", &self.pending_items())
            .finish_non_exhaustive()
    }
}
