//! Shared error definitions for agent primitives.

use thiserror::Error;
use uuid::Error as UuidError;

/// Result alias used throughout the agent runtime.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while manipulating agent primitive types.
#[derive(Debug, Error)]
pub enum Error {
    /// A trace or span identifier could not be parsed.
    #[error("invalid {kind} id: {source}")]
    InvalidId {
        /// Which identifier failed to parse (`trace` or `span`).
        kind: &'static str,
        /// Source parsing error from the UUID library.
        source: UuidError,
    },
}
