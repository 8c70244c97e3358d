use serde::{Deserialize, Serialize};

/// Author role attached to a conversation message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageRole {
    /// Message written by the local user.
    User,
    /// Message produced by the remote assistant.
    Assistant,
    /// System/notice message.
    System,
}

/// Content encoding of a message body. Opaque to the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ContentType {
    /// Plain text body.
    #[default]
    Text,
    /// Markdown-formatted body.
    Markdown,
}

/// Server-side processing status of a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProcessingStatus {
    /// Awaiting server confirmation.
    Pending,
    /// Confirmed by the server.
    Sent,
    /// Rejected or failed.
    Failed,
}

/// Correlation metadata carried by every message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MessageMetadata {
    /// Temp ID correlating a provisional entry with its confirmed counterpart.
    pub temp_id: Option<String>,
    /// `true` while the entry is a locally created, unconfirmed message.
    pub optimistic: bool,
}

/// Canonical conversation message as held by the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Permanent ID once confirmed; `temp-<millis>-<rand>` while provisional.
    pub id: String,
    /// Owning conversation ID.
    pub conversation_id: String,
    /// Delivery surface tag (for example `browser`). Opaque to the engine.
    pub interface: String,
    /// Author role.
    pub role: MessageRole,
    /// Message body.
    pub content: String,
    /// Body encoding.
    pub content_type: ContentType,
    /// Optional ID of the message this one replies to.
    pub reply_to_message_id: Option<String>,
    /// Correlation metadata.
    pub metadata: MessageMetadata,
    /// Server-side processing status.
    pub processing_status: ProcessingStatus,
    /// Creation timestamp in milliseconds since Unix epoch.
    pub created_at_ms: u64,
}

impl Message {
    /// Build a provisional user message awaiting server confirmation.
    ///
    /// The temp ID doubles as the entry's ID until reconciliation.
    pub fn provisional(
        temp_id: impl Into<String>,
        conversation_id: impl Into<String>,
        interface: impl Into<String>,
        content: impl Into<String>,
        created_at_ms: u64,
    ) -> Self {
        let temp_id = temp_id.into();
        Self {
            id: temp_id.clone(),
            conversation_id: conversation_id.into(),
            interface: interface.into(),
            role: MessageRole::User,
            content: content.into(),
            content_type: ContentType::Text,
            reply_to_message_id: None,
            metadata: MessageMetadata {
                temp_id: Some(temp_id),
                optimistic: true,
            },
            processing_status: ProcessingStatus::Pending,
            created_at_ms,
        }
    }

    /// Whether this entry is a pending provisional message.
    pub fn is_pending_provisional(&self) -> bool {
        self.metadata.optimistic && self.processing_status == ProcessingStatus::Pending
    }
}

/// Raw status values reported by the realtime channel transport.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Subscription is live.
    Subscribed,
    /// Transport-level channel error.
    ChannelError,
    /// Subscription timed out.
    TimedOut,
    /// Subscription closed.
    Closed,
}

/// Connection lifecycle state reported to engine consumers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionState {
    /// No subscription; initial and post-teardown state.
    Closed,
    /// Subscribe call in flight.
    Subscribing,
    /// Subscription live, inbound events flowing.
    Subscribed,
    /// Disconnected; a backoff timer is armed for the next attempt.
    ReconnectScheduled,
    /// Retry cap reached; requires external re-initialization.
    Exhausted,
}

/// Engine tuning values. All bounds are product-tunable, not semantic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// In-memory history retention cap.
    pub max_messages: usize,
    /// Consecutive failed-attempt cap before the connection is exhausted.
    pub max_reconnect_attempts: u32,
    /// Base reconnect delay in milliseconds.
    pub base_reconnect_delay_ms: u64,
    /// Reconnect delay ceiling in milliseconds.
    pub max_reconnect_delay_ms: u64,
    /// Send request timeout in milliseconds.
    pub send_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_messages: 100,
            max_reconnect_attempts: 5,
            base_reconnect_delay_ms: 1_000,
            max_reconnect_delay_ms: 30_000,
            send_timeout_ms: 30_000,
        }
    }
}

/// Acknowledgement emitted after a send attempt resolves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendAck {
    /// Temp ID of the provisional entry the attempt belongs to.
    pub temp_id: String,
    /// Confirmed message ID on success.
    pub message_id: Option<String>,
    /// Stable engine error code on failure.
    pub error_code: Option<String>,
}

/// Event channel output emitted by the engine to observers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EngineEvent {
    /// Connection lifecycle transition.
    ConnectionChanged {
        /// New connection state.
        state: ConnectionState,
    },
    /// The message snapshot changed; observers should re-read it.
    MessagesUpdated,
    /// Send acknowledgement.
    SendAck(SendAck),
    /// Fatal or surfaced runtime error.
    FatalError {
        /// Stable engine error code.
        code: String,
        /// Human-readable error message.
        message: String,
        /// Indicates whether retrying may recover.
        recoverable: bool,
    },
}
