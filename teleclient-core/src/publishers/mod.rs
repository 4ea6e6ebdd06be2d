//! Concrete publisher implementations.

pub mod http;

pub use http::HttpTelemetryPublisher;
