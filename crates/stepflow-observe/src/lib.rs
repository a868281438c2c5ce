//! Observability setup for stepflow: structured logging via `tracing` with an
//! optional OpenTelemetry stdout exporter.

pub mod tracing_setup;
