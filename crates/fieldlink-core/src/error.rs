// ── Core error types ──
//
// Pipeline-level errors from fieldlink-core. Transport failures arrive
// wrapped from `fieldlink_api::Error`; storage and message-bus
// collaborators report through `StoreError` and `BusError`.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Could not resolve address '{address}' for controller {controller}: {reason}")]
    Resolve {
        controller: String,
        address: String,
        reason: String,
    },

    #[error("Cannot connect to controller {controller}: {reason}")]
    Connection { controller: String, reason: String },

    #[error("Connection to controller {controller} has been closed")]
    NotConnected { controller: String },

    #[error("Request queue has shut down")]
    QueueClosed,

    // ── Data errors ──────────────────────────────────────────────────
    #[error("Invalid event: {reason}")]
    InvalidEvent { reason: String },

    #[error("Snapshot cache error for {controller}: {reason}")]
    Snapshot { controller: String, reason: String },

    #[error("Pre-send hook '{hook}' failed: {reason}")]
    Hook { hook: String, reason: String },

    #[error("Cannot archive download '{target}': {reason}")]
    Download { target: String, reason: String },

    #[error("Invalid configuration: {message}")]
    Config { message: String },

    // ── Wrapped collaborator errors ──────────────────────────────────
    #[error(transparent)]
    Api(#[from] fieldlink_api::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bus(#[from] BusError),

    // ── Fatal ────────────────────────────────────────────────────────
    /// Raised when consuming a message fails in a way that could leave
    /// stored data inconsistent. The process is expected to exit.
    #[error("Unrecoverable failure while applying a consumed message: {reason}")]
    Fatal { reason: String },
}

impl CoreError {
    /// Returns `true` if the operation may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Api(e) => e.is_transient(),
            Self::Resolve { .. } | Self::Connection { .. } => true,
            Self::Store(e) => e.is_unique_violation(),
            _ => false,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

// ── StoreError ──────────────────────────────────────────────────────

/// Failures reported by the entity graph and value store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// A unique constraint rejected the write ("duplicate key").
    #[error("duplicate key value violates unique constraint \"{constraint}\"")]
    UniqueViolation { constraint: String },

    /// The enclosing transaction was already aborted.
    #[error("current transaction is aborted")]
    TransactionAborted,

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn unique(constraint: impl Into<String>) -> Self {
        Self::UniqueViolation {
            constraint: constraint.into(),
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation { .. })
    }

    pub fn is_transaction_aborted(&self) -> bool {
        matches!(self, Self::TransactionAborted)
    }
}

// ── BusError ────────────────────────────────────────────────────────

/// Failures reported by the message sink/source.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("message bus closed")]
    Closed,

    #[error("no queue bound to exchange '{exchange}'")]
    Unroutable { exchange: String },

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_violation_reads_like_a_duplicate_key() {
        let err = StoreError::unique("platform_name_key");
        assert!(err.to_string().contains("duplicate key"));
        assert!(CoreError::from(err).is_transient());
    }

    #[test]
    fn fatal_is_not_transient() {
        let err = CoreError::Fatal {
            reason: "boom".into(),
        };
        assert!(err.is_fatal());
        assert!(!err.is_transient());
    }
}
