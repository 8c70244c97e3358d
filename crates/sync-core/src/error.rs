use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ConnectionState;

/// Broad error category used for surfacing and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EngineErrorCategory {
    /// Invalid input, unsupported state, or other configuration issue.
    Config,
    /// Authentication/authorization failure.
    Auth,
    /// Transient network or transport failure.
    Network,
    /// Rate-limited by the remote service.
    RateLimited,
    /// History/persistence loading failure.
    Storage,
    /// Serialization/deserialization failure.
    Serialization,
    /// Internal engine bug or invariant break.
    Internal,
}

/// Stable engine error payload crossing the engine boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct EngineError {
    /// High-level error category.
    pub category: EngineErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl EngineError {
    /// Construct a new engine error.
    pub fn new(
        category: EngineErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: ConnectionState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            EngineErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while connection is in state {current:?}"),
        )
    }

    /// Whether retrying this error may recover.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category,
            EngineErrorCategory::Network
                | EngineErrorCategory::RateLimited
                | EngineErrorCategory::Storage
        )
    }
}

/// Map HTTP status codes to engine error categories.
pub fn classify_http_status(status: u16) -> EngineErrorCategory {
    match status {
        401 | 403 => EngineErrorCategory::Auth,
        408 | 429 => EngineErrorCategory::RateLimited,
        400..=499 => EngineErrorCategory::Config,
        500..=599 => EngineErrorCategory::Network,
        _ => EngineErrorCategory::Internal,
    }
}
