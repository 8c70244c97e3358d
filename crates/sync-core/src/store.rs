use std::collections::HashSet;

use crate::types::{Message, ProcessingStatus};

/// In-memory message log with bounded retention and O(1) duplicate checks.
///
/// Holds the messages of a single conversation in insertion order. Every
/// live entry's ID is tracked in an auxiliary index so inbound duplicates
/// are rejected without scanning. Provisional (optimistic) entries are
/// replaced in place on confirmation so their position never changes.
#[derive(Debug, Clone)]
pub struct MessageStore {
    messages: Vec<Message>,
    ids: HashSet<String>,
    max_messages: usize,
}

impl MessageStore {
    /// Create a store with a retention cap (`max_messages >= 1`).
    pub fn new(max_messages: usize) -> Self {
        Self {
            messages: Vec::new(),
            ids: HashSet::new(),
            max_messages: max_messages.max(1),
        }
    }

    /// Number of retained messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the store holds no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Whether a message with this ID is currently retained.
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Cloned view of the retained messages in insertion order.
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    /// Insert a locally created provisional message.
    ///
    /// Rejected when its ID is already present or when another pending
    /// provisional entry carries the same temp ID (at most one pending
    /// entry per temp ID). Returns whether the store changed.
    pub fn insert_provisional(&mut self, message: Message) -> bool {
        if self.ids.contains(&message.id) {
            return false;
        }
        if let Some(temp_id) = message.metadata.temp_id.as_deref() {
            if self.position_of_pending(temp_id).is_some() {
                return false;
            }
        }

        self.ids.insert(message.id.clone());
        self.messages.push(message);
        self.evict_to_cap();
        true
    }

    /// Merge a message delivered by the subscription. Returns whether the
    /// store changed.
    ///
    /// Idempotent: a known ID is a no-op. An inbound message whose temp ID
    /// matches a pending provisional entry replaces that entry in place;
    /// this is the reconciliation path for sends confirmed via the
    /// subscription echo rather than the direct response.
    pub fn merge_inbound(&mut self, message: Message) -> bool {
        if self.ids.contains(&message.id) {
            return false;
        }

        let pending = message
            .metadata
            .temp_id
            .as_deref()
            .and_then(|temp_id| self.position_of_pending(temp_id));

        match pending {
            Some(index) => {
                let mut confirmed = message;
                confirmed.metadata.optimistic = false;
                if confirmed.processing_status == ProcessingStatus::Pending {
                    confirmed.processing_status = ProcessingStatus::Sent;
                }

                let previous = std::mem::replace(&mut self.messages[index], confirmed);
                self.ids.remove(&previous.id);
                self.ids.insert(self.messages[index].id.clone());
            }
            None => {
                self.ids.insert(message.id.clone());
                self.messages.push(message);
                self.evict_to_cap();
            }
        }
        true
    }

    /// Confirm the pending provisional entry for `temp_id` using the
    /// server-assigned ID from the direct send response.
    ///
    /// At most once per temp ID: when the inbound echo already confirmed
    /// the entry (or the confirmed ID is otherwise present) this is a
    /// no-op. The entry keeps its position. Returns whether it applied.
    pub fn reconcile(&mut self, temp_id: &str, confirmed_id: &str) -> bool {
        if self.ids.contains(confirmed_id) {
            return false;
        }
        let Some(index) = self.position_of_pending(temp_id) else {
            return false;
        };

        let entry = &mut self.messages[index];
        self.ids.remove(&entry.id);
        entry.id = confirmed_id.to_owned();
        entry.metadata.optimistic = false;
        entry.processing_status = ProcessingStatus::Sent;
        self.ids.insert(entry.id.clone());
        true
    }

    /// Remove the pending provisional entry for `temp_id` entirely.
    ///
    /// Used when the send request itself fails. Returns whether an entry
    /// was removed.
    pub fn rollback(&mut self, temp_id: &str) -> bool {
        let Some(index) = self.position_of_pending(temp_id) else {
            return false;
        };

        let removed = self.messages.remove(index);
        self.ids.remove(&removed.id);
        true
    }

    fn position_of_pending(&self, temp_id: &str) -> Option<usize> {
        self.messages.iter().position(|message| {
            message.is_pending_provisional()
                && message.metadata.temp_id.as_deref() == Some(temp_id)
        })
    }

    fn evict_to_cap(&mut self) {
        if self.messages.len() <= self.max_messages {
            return;
        }

        while self.messages.len() > self.max_messages {
            // Oldest confirmed entry goes first; pending provisional
            // entries are evicted only when nothing else remains.
            let index = self
                .messages
                .iter()
                .position(|message| !message.metadata.optimistic)
                .unwrap_or(0);
            self.messages.remove(index);
        }

        // Rebuild the index from the retained slice so it exactly matches
        // the surviving IDs.
        self.ids = self
            .messages
            .iter()
            .map(|message| message.id.clone())
            .collect();
    }
}
