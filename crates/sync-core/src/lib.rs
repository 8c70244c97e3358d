//! Core contract shared between the sync engine and its consumers.
//!
//! This crate defines the message/connection protocol types, the ordered
//! deduplicated message store, the reconnect backoff policy, the connection
//! lifecycle state machine, and common error/event-channel abstractions.

/// Reconnect backoff policy used by the connection supervisor.
pub mod backoff;
/// Engine event broadcast primitives.
pub mod channel;
/// Stable engine error types and HTTP classification helpers.
pub mod error;
/// Send outcome normalization helpers (send acknowledgements).
pub mod normalization;
/// Connection lifecycle state machine.
pub mod state_machine;
/// Ordered, deduplicated, memory-bounded message store.
pub mod store;
/// Protocol types (messages, statuses, configuration, events).
pub mod types;

pub use backoff::BackoffPolicy;
pub use channel::{EngineEvents, EventStream};
pub use error::{classify_http_status, EngineError, EngineErrorCategory};
pub use normalization::{normalize_fatal_error, normalize_send_outcome, SendOutcome};
pub use state_machine::ConnectionStateMachine;
pub use store::MessageStore;
pub use types::{
    ChannelStatus, ConnectionState, ContentType, EngineConfig, EngineEvent, Message,
    MessageMetadata, MessageRole, ProcessingStatus, SendAck,
};
