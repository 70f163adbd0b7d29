//! Common pieces shared by the wharf crates: telemetry and well-known names

#![deny(missing_docs)]

pub mod telemetry;

pub use telemetry::{init_telemetry, TelemetryConfig, TelemetryError};

/// Service name reported in traces and logs
pub const SERVICE_NAME: &str = "wharf";

/// Annotation key used to record the chart template version on a namespace
pub const EXTERNAL_ID_ANNOTATION: &str = "wharf.io/external-id";

/// Default port for the HTTP/WebSocket API
pub const DEFAULT_API_PORT: u16 = 8080;
