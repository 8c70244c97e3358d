use crate::{
    error::EngineError,
    types::{EngineEvent, SendAck},
};

/// Internal helper describing send success/failure before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Send succeeded and produced a confirmed message ID.
    Success { message_id: String },
    /// Send failed with engine error details.
    Failure { error: EngineError },
}

/// Convert a send outcome to a stable `EngineEvent::SendAck`.
pub fn normalize_send_outcome(temp_id: impl Into<String>, outcome: SendOutcome) -> EngineEvent {
    let temp_id = temp_id.into();
    match outcome {
        SendOutcome::Success { message_id } => EngineEvent::SendAck(SendAck {
            temp_id,
            message_id: Some(message_id),
            error_code: None,
        }),
        SendOutcome::Failure { error } => EngineEvent::SendAck(SendAck {
            temp_id,
            message_id: None,
            error_code: Some(error.code),
        }),
    }
}

/// Convert an error into a `FatalError` engine event.
pub fn normalize_fatal_error(error: EngineError, recoverable: bool) -> EngineEvent {
    EngineEvent::FatalError {
        code: error.code,
        message: error.message,
        recoverable,
    }
}
