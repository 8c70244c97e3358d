//! Collaborator seams the sync engine talks to.
//!
//! The engine never implements a transport protocol itself; it drives these
//! traits. `memory` provides scripted in-process doubles used by tests and
//! the smoke app, `http` provides a real send endpoint over HTTP.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use sync_core::{ChannelStatus, EngineError, Message};

/// In-memory doubles for every collaborator trait.
pub mod memory;

/// HTTP send endpoint implementation.
pub mod http;

/// Event delivered on an open subscription.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A message was inserted into the conversation.
    Insert(Message),
    /// The transport reported a subscription status change.
    Status(ChannelStatus),
}

/// Stops event delivery for one subscription when dropped or unsubscribed.
pub trait SubscriptionHandle: Send {
    fn unsubscribe(&mut self);
}

/// An open subscription: the inbound event stream plus its handle.
pub struct Subscription {
    /// Inbound events in transport delivery order.
    pub events: mpsc::Receiver<ChannelEvent>,
    /// Handle owning the transport-side registration.
    pub handle: Box<dyn SubscriptionHandle>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

/// Push-based realtime message source.
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    /// Apply an auth credential to the transport.
    ///
    /// When the engine is configured with a token, this completes before
    /// `subscribe` is issued.
    async fn set_auth(&self, token: &str) -> Result<(), EngineError>;

    /// Open a subscription on `topic`.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, EngineError>;
}

/// Loader for the persisted history of one conversation.
#[async_trait]
pub trait HistoryLoader: Send + Sync {
    /// Fetch the conversation history in ascending time order.
    async fn load_history(&self, conversation_id: &str) -> Result<Vec<Message>, EngineError>;
}

/// Outbound send request. The temp ID is echoed back by the server so the
/// engine can correlate the confirmation with its provisional entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub conversation_id: String,
    pub content: String,
    pub interface_tag: String,
    pub temp_id: String,
}

/// Confirmed send response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendResponse {
    pub message_id: String,
}

/// Endpoint accepting outbound message sends.
#[async_trait]
pub trait SendEndpoint: Send + Sync {
    async fn send(&self, request: SendRequest) -> Result<SendResponse, EngineError>;
}
