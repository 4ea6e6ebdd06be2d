//! Application telemetry client: correlated activity scopes, an in-memory
//! buffer, and concurrent publishing to one or more ingestion endpoints.

pub mod activity;
pub mod auth;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod factory;
pub mod host;
pub mod http_client;
pub mod model;
pub mod publisher;
pub mod publishers;
pub mod tags;
pub mod wire;
#[cfg(test)]
mod test_span;

pub use activity::{ActivityScopeTracker, ScopeToken, new_activity_id};
pub use auth::{BearerToken, BearerTokenProvider, StaticTokenSource, TokenSource};
pub use client::{PublishResult, PublishStatus, PublisherOutcome, TelemetryClient};
pub use config::{ClientConfig, HttpCfg, PublisherConfig};
pub use error::{CoreResult, TelemetryError};
pub use factory::create_telemetry_client;
pub use host::{ExpectedFailure, HostRunner};
pub use model::{ExceptionDetails, SeverityLevel, TelemetryData, TelemetryItem, TelemetryOperation};
pub use publisher::{InMemoryPublisher, PublishReceipt, TelemetryPublisher};
pub use tags::TelemetryTags;
