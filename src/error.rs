//! Error kinds carried at the engine/HTTP-layer boundary.

use thiserror::Error;

/// Failure returned by an engine entry point. The engine never encodes an
/// HTTP status number itself; callers map a variant to one.
#[derive(Debug, Error)]
pub enum FserveError {
    /// File does not exist, the format probe failed, or on-demand serving
    /// is disabled (404).
    #[error("not found: {0}")]
    NotFound(String),

    /// Max listeners reached, duplicate login, or admin policy refused the
    /// attach (403, optionally with a redirect hint).
    #[error("forbidden: {reason}")]
    Forbidden {
        reason: String,
        /// Whether the caller should attempt a peer redirect instead of a
        /// bare 403.
        redirect: bool,
    },

    /// Declared byte range exceeds the bytes available past
    /// `frame_start_pos` (416).
    #[error("range not satisfiable")]
    RangeNotSatisfiable,

    /// Admin parameters missing or malformed (400).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// On-disk format disagrees with the advertised fallback format.
    #[error("format mismatch for {0}")]
    FormatMismatch(String),

    /// Format plugin rejected the file during probing.
    #[error("format init failed for {0}")]
    FormatInit(String),

    /// Connection-level error: terminate the listener, not the cache entry.
    #[error("fatal connection error: {0}")]
    Fatal(String),
}

impl FserveError {
    pub fn forbidden(reason: impl Into<String>, redirect: bool) -> Self {
        FserveError::Forbidden {
            reason: reason.into(),
            redirect,
        }
    }
}
