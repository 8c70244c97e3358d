//! Conversation sync engine.
//!
//! Keeps a local, ordered, deduplicated, memory-bounded view of one
//! conversation's messages in sync with a push-based remote source over an
//! unreliable subscription, and lets the local user send messages that
//! appear optimistically before the server confirms them.
//!
//! The engine owns three moving parts: a [`SyncEngine`] orchestrator, a
//! connection supervisor driving subscribe/reconnect with exponential
//! backoff, and a send coordinator reconciling optimistic sends. Transport
//! specifics live behind the `sync-transport` collaborator traits.

mod engine;
mod send;
mod supervisor;

pub use engine::{EngineTransports, SyncEngine};
pub use send::SendReceipt;
