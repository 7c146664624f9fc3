use thiserror::Error;

/// Top-level error type for the `fieldlink-api` crate.
///
/// Covers every failure mode across the field transports:
/// socket I/O, HTTP polling, and the BACnet/IP request pipeline.
/// `fieldlink-core` maps these into pipeline-level errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// Socket-level failure (bind, send, receive).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Request timed out waiting for a reply.
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// HTTP response with a 4xx/5xx status.
    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    /// A download answered 2xx with nothing in it.
    #[error("Empty response body from {url}")]
    EmptyBody { url: String },

    /// The client's receive loop has shut down.
    #[error("Client closed")]
    Closed,

    // ── BACnet ──────────────────────────────────────────────────────
    /// The device answered with an Error-PDU for the whole request.
    #[error("BacnetError (class {class}, code {code})")]
    Protocol { class: u32, code: u32 },

    /// The device rejected the request.
    #[error("Request rejected by device (reason {reason})")]
    Rejected { reason: u8 },

    /// The device aborted the transaction.
    #[error("Request aborted by device (reason {reason})")]
    Aborted { reason: u8 },

    /// A frame could not be decoded.
    #[error("Malformed frame: {reason}")]
    Decode { reason: String },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    pub(crate) fn decode(reason: impl Into<String>) -> Self {
        Self::Decode {
            reason: reason.into(),
        }
    }

    /// Returns `true` if the request timed out at any layer.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Transport(e) => e.is_timeout(),
            _ => false,
        }
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Timeout { .. } | Self::Io(_) => true,
            _ => false,
        }
    }
}
