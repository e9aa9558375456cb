// Error taxonomy for queued requests.
//
// Outcomes are stored in result slots and may be read more than once, so
// every variant is Clone and carries owned, already-rendered detail rather
// than the underlying source error.

use std::time::Duration;

use thiserror::Error;

use crate::queue::request::RequestId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// The server answered outside the success range [200, 400).
    #[error("request failed with HTTP status {status}")]
    Http { status: u16 },

    /// The request never produced a response (DNS, TLS, connection reset...).
    #[error("transport error: {0}")]
    Transport(String),

    /// The response body could not be decoded.
    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("invalid request path {0:?}")]
    InvalidPath(String),

    /// The path resolved to a URL outside the configured origin.
    #[error("refusing cross-origin request to {0}")]
    CrossOrigin(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request {0} was cancelled")]
    Cancelled(RequestId),

    #[error("no such pending request: {0}")]
    UnknownRequest(RequestId),

    #[error("request {0} was already added to the queue")]
    DuplicateRequest(RequestId),

    #[error("result for request {0} was already written")]
    SlotAlreadyWritten(RequestId),

    #[error("request action panicked")]
    ActionPanicked,

    #[error("no Tokio runtime available to drive the request queue")]
    NoRuntime,

    #[error("no authenticity token available for a mutating request")]
    MissingToken,
}

impl From<reqwest::Error> for RequestError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RequestError::Decode(err.to_string())
        } else {
            RequestError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for RequestError {
    fn from(err: serde_json::Error) -> Self {
        RequestError::Decode(err.to_string())
    }
}
