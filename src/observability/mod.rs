//! Observability infrastructure.
//!
//! Provides:
//! - Structured tracing via tracing-subscriber
//! - OpenTelemetry metrics for requests and the admission window

pub mod metrics;
pub mod tracing;
