//! Runs one unit of work under telemetry.
//!
//! The runner opens a top-level activity scope, runs the caller's logic,
//! tracks a Request item (and an Exception item on failure), publishes, and
//! only then hands the business outcome back. Publish failures are logged and
//! reported but never replace that outcome. A panic in the caller's logic is
//! tracked and published the same way, then resumed.

use std::any::Any;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use reqwest::Url;
use tokio_util::sync::CancellationToken;

use crate::activity::new_activity_id;
use crate::client::{PublishResult, TelemetryClient};
use crate::model::ExceptionDetails;
use crate::tags::TelemetryTags;

/// Message attached to failures that are re-raised wrapped.
pub const WORK_FAILED: &str = "error during work execution";

/// A failure the hosting platform expects and shows to the end user as-is.
/// It passes through the runner unwrapped.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ExpectedFailure {
    message: String,
}

impl ExpectedFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Caller logic panicked; carries the panic message.
#[derive(Debug, thiserror::Error)]
#[error("work panicked: {0}")]
struct Panicked(String);

impl Panicked {
    fn from_payload(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self(message)
    }
}

/// Outcome of one hosted unit of work.
#[derive(Debug)]
pub struct Execution<T> {
    pub result: anyhow::Result<T>,
    pub publish: PublishResult,
    /// Id of the top-level scope, which is also the Request item's id.
    pub request_id: String,
}

impl<T> Execution<T> {
    pub fn into_result(self) -> anyhow::Result<T> {
        self.result
    }
}

pub struct HostRunner {
    client: Arc<TelemetryClient>,
    request_uri: Url,
    request_name: Option<String>,
    publish_timeout: Duration,
    cancel: CancellationToken,
}

impl HostRunner {
    pub fn new(client: Arc<TelemetryClient>, request_uri: Url) -> Self {
        Self {
            client,
            request_uri,
            request_name: None,
            publish_timeout: Duration::from_secs(30),
            cancel: CancellationToken::new(),
        }
    }

    /// Name of the Request item. Defaults to the request URI.
    pub fn with_request_name(mut self, name: impl Into<String>) -> Self {
        self.request_name = Some(name.into());
        self
    }

    /// Upper bound on the wait for the final publish.
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Parent signal; cancelling it cuts the final publish short.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn client(&self) -> &Arc<TelemetryClient> {
        &self.client
    }

    /// Run synchronous caller logic.
    ///
    /// If `work` panics, the Exception and Request items are still tracked
    /// and published before the panic resumes.
    pub async fn execute<T, F>(&self, work: F) -> Execution<T>
    where
        F: FnOnce(&TelemetryClient) -> anyhow::Result<T>,
    {
        let request_id = new_activity_id();
        let token = self.client.activity_scope_begin(request_id.clone());
        let outcome = catch_unwind(AssertUnwindSafe(|| work(self.client.as_ref())));
        self.settle(request_id, token, outcome).await
    }

    /// Run asynchronous caller logic. Panics are handled as in [`Self::execute`].
    pub async fn execute_async<T, F, Fut>(&self, work: F) -> Execution<T>
    where
        F: FnOnce(Arc<TelemetryClient>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let request_id = new_activity_id();
        let token = self.client.activity_scope_begin(request_id.clone());
        let outcome = AssertUnwindSafe(work(self.client.clone()))
            .catch_unwind()
            .await;
        self.settle(request_id, token, outcome).await
    }

    /// Run synchronous caller logic from a thread that is not inside the
    /// runtime, blocking until the final publish has completed.
    pub fn run_blocking<T, F>(&self, rt: &tokio::runtime::Runtime, work: F) -> Execution<T>
    where
        F: FnOnce(&TelemetryClient) -> anyhow::Result<T>,
    {
        rt.block_on(self.execute(work))
    }

    async fn settle<T>(
        &self,
        request_id: String,
        token: crate::activity::ScopeToken,
        outcome: std::thread::Result<anyhow::Result<T>>,
    ) -> Execution<T> {
        match outcome {
            Ok(result) => self.finish(request_id, token, result).await,
            Err(payload) => {
                let panicked = Panicked::from_payload(payload.as_ref());
                tracing::error!(request_id = %request_id, error = %panicked, "hosted work panicked");
                let _ = self.finish::<T>(request_id, token, Err(panicked.into())).await;
                resume_unwind(payload)
            }
        }
    }

    async fn finish<T>(
        &self,
        request_id: String,
        token: crate::activity::ScopeToken,
        result: anyhow::Result<T>,
    ) -> Execution<T> {
        let client = &self.client;
        let start_time = token.start_time();
        let operation = client.operation();

        if let Err(err) = &result {
            let type_name = if err.downcast_ref::<ExpectedFailure>().is_some() {
                "ExpectedFailure"
            } else if err.downcast_ref::<Panicked>().is_some() {
                "Panic"
            } else {
                "UnhandledError"
            };
            client.track_exception_details(ExceptionDetails::from_anyhow(err, type_name), None);
        }

        let duration = client.activity_scope_end(token);
        let success = result.is_ok();
        let request_tags = TelemetryTags::new().with_operation(&operation);
        client.track_request(
            start_time,
            duration,
            &request_id,
            &self.request_uri,
            if success { "0" } else { "1" },
            success,
            self.request_name.as_deref(),
            Some(&request_tags),
        );

        let publish = self.publish_bounded().await;
        for (publisher, err) in publish.failures() {
            tracing::warn!(publisher, error = %err, "telemetry for hosted work not delivered");
        }

        let result = result.map_err(|err| {
            if err.downcast_ref::<ExpectedFailure>().is_some() {
                err
            } else {
                err.context(WORK_FAILED)
            }
        });
        Execution {
            result,
            publish,
            request_id,
        }
    }

    async fn publish_bounded(&self) -> PublishResult {
        let cancel = self.cancel.child_token();
        let publish = self.client.publish(&cancel);
        tokio::pin!(publish);
        tokio::select! {
            result = &mut publish => result,
            _ = tokio::time::sleep(self.publish_timeout) => {
                tracing::warn!(
                    timeout_ms = self.publish_timeout.as_millis() as u64,
                    "final telemetry publish timed out"
                );
                cancel.cancel();
                publish.await
            }
        }
    }
}

impl std::fmt::Debug for HostRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRunner")
            .field("request_uri", &self.request_uri.as_str())
            .field("request_name", &self.request_name)
            .field("publish_timeout", &self.publish_timeout)
            .finish_non_exhaustive()
    }
}
