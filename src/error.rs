//! Semantic status codes for tree operations.
//!
//! Operations report three kinds of failure, all as ordinary `Err` values:
//! semantic outcomes (not-found / already-exists, which also leave read-set
//! entries behind), caller contract violations (buffer and payload bounds,
//! returned before any mutation), and resource exhaustion (the page pool ran
//! dry mid-SMO, returned after the structure has been restored to a
//! consistent shape). Internal optimistic retries are never surfaced here;
//! the state machines loop until they reach one of these outcomes.

use thiserror::Error;

/// Result type alias for tree operations.
pub type Result<T> = std::result::Result<T, TreeError>;

/// Errors reported by tree operations. The set is stable; callers are
/// expected to match on it.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum TreeError {
    /// The key does not exist. A range read covering the miss was recorded.
    #[error("key not found")]
    KeyNotFound,

    /// The key already exists. The existing record was recorded in the read
    /// set.
    #[error("key already exists")]
    KeyAlreadyExists,

    /// The output buffer is smaller than the stored payload.
    #[error("payload buffer too small: need {required} bytes, got {capacity}")]
    TooSmallPayloadBuffer { required: usize, capacity: usize },

    /// A partial read or write extends past the stored payload length.
    #[error("payload too short: offset {offset} + count {count} > stored {stored}")]
    TooShortPayload {
        offset: usize,
        count: usize,
        stored: usize,
    },

    /// The payload can never fit a border page.
    #[error("payload too long: {length} bytes exceeds the {max} byte maximum")]
    TooLongPayload { length: usize, max: usize },

    /// The volatile page pool is exhausted. The tree remains consistent; the
    /// failed structural modification was completed or unwound before this
    /// was returned.
    #[error("out of volatile pages")]
    OutOfPages,
}
