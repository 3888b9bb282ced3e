//! The dispatcher-wide error taxonomy.
//!
//! Every failure surfaced to a user or logged by the dispatcher falls into
//! one of these categories.  Agents never let an error escape their event
//! loop; they translate it into a persisted state transition, so this type
//! mostly travels through the store/broker ports and the API layer.

use thiserror::Error;

/// Classified dispatcher error.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The caller supplied something invalid (bad mission tree, cancel on a
    /// terminal mission, update of an unknown node).  Maps to a 4xx.
    #[error("usage error: {0}")]
    Usage(String),

    /// An internal invariant was violated.  Maps to a 5xx.
    #[error("server error: {0}")]
    Server(String),

    /// The broker or store connection was lost; recovered by bounded-retry
    /// reconnect.
    #[error("transient error: {0}")]
    Transient(String),

    /// The robot reported a FATAL VDA5050 error.
    #[error("robot protocol error: {0}")]
    RobotProtocol(String),

    /// A mission or notify call exceeded its allotted time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The operation was canceled by the user.
    #[error("canceled: {0}")]
    Canceled(String),
}

impl DispatchError {
    /// Stable machine-readable code for this error class.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::Usage(_) => "USAGE",
            DispatchError::Server(_) => "SERVER",
            DispatchError::Transient(_) => "TRANSIENT",
            DispatchError::RobotProtocol(_) => "ROBOT",
            DispatchError::Timeout(_) => "TIMEOUT",
            DispatchError::Canceled(_) => "CANCELED",
        }
    }

    /// Whether retrying the operation may succeed without user intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, DispatchError::Transient(_))
    }
}
