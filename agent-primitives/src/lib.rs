//! Core shared types for MXP agent telemetry.

#![warn(missing_docs, clippy::pedantic)]

mod error;
mod ids;

/// Error type and result alias shared across the SDK.
pub use error::{Error, Result};
/// Identifiers for distributed traces and the spans within them.
pub use ids::{SpanId, TraceId};
