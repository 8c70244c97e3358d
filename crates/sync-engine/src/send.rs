use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tracing::{debug, warn};

use sync_core::{
    normalize_send_outcome, EngineError, EngineErrorCategory, EngineEvent, EngineEvents, Message,
    MessageStore, SendOutcome,
};
use sync_transport::{SendEndpoint, SendRequest};

/// How a send attempt resolved for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendReceipt {
    /// The server confirmed the message.
    Confirmed { message_id: String },
    /// A newer send superseded this one, or the engine shut down while it
    /// was in flight. Benign: no error, nothing left to do.
    Cancelled,
}

struct InFlightSend {
    temp_id: String,
    cancel: CancellationToken,
}

/// Coordinates optimistic sends for one conversation.
///
/// A send inserts its provisional message before the first network await,
/// so callers observe it immediately. Only one send is in flight at a
/// time; a newer send supersedes an older one instead of queuing behind
/// it, and supersession is never reported as an error.
pub(crate) struct SendCoordinator {
    endpoint: Arc<dyn SendEndpoint>,
    conversation_id: String,
    store: Arc<Mutex<MessageStore>>,
    events: EngineEvents,
    send_timeout: Duration,
    in_flight: Mutex<Option<InFlightSend>>,
    shutdown: CancellationToken,
}

impl SendCoordinator {
    pub(crate) fn new(
        endpoint: Arc<dyn SendEndpoint>,
        conversation_id: String,
        store: Arc<Mutex<MessageStore>>,
        events: EngineEvents,
        send_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            endpoint,
            conversation_id,
            store,
            events,
            send_timeout,
            in_flight: Mutex::new(None),
            shutdown,
        }
    }

    pub(crate) async fn send(
        &self,
        content: &str,
        interface: &str,
    ) -> Result<SendReceipt, EngineError> {
        if self.shutdown.is_cancelled() {
            return Err(crate::engine::shutdown_error());
        }

        let temp_id = new_temp_id();
        let cancel = self.shutdown.child_token();

        {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(previous) = in_flight.take() {
                // The newer send supersedes the older one. Its provisional
                // entry leaves silently; the cancellation is not an error.
                previous.cancel.cancel();
                let rolled_back = {
                    let mut store = self.store.lock().await;
                    store.rollback(&previous.temp_id)
                };
                if rolled_back {
                    self.events.emit(EngineEvent::MessagesUpdated);
                }
                debug!(superseded = %previous.temp_id, "send superseded by newer send");
            }

            let message = Message::provisional(
                &temp_id,
                &self.conversation_id,
                interface,
                content,
                now_ms(),
            );
            {
                let mut store = self.store.lock().await;
                store.insert_provisional(message);
            }
            self.events.emit(EngineEvent::MessagesUpdated);

            *in_flight = Some(InFlightSend {
                temp_id: temp_id.clone(),
                cancel: cancel.clone(),
            });
        }

        let request = SendRequest {
            conversation_id: self.conversation_id.clone(),
            content: content.to_owned(),
            interface_tag: interface.to_owned(),
            temp_id: temp_id.clone(),
        };

        let raced = tokio::select! {
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(self.send_timeout, self.endpoint.send(request)) => {
                Some(result)
            }
        };

        match raced {
            None => Ok(SendReceipt::Cancelled),
            Some(Err(_elapsed)) => {
                if cancel.is_cancelled() {
                    return Ok(SendReceipt::Cancelled);
                }
                self.clear_in_flight(&temp_id).await;
                let err = EngineError::new(
                    EngineErrorCategory::Network,
                    "send_timeout",
                    format!(
                        "send was not answered within {}ms",
                        self.send_timeout.as_millis()
                    ),
                );
                self.fail(&temp_id, err).await
            }
            Some(Ok(Ok(response))) => {
                if cancel.is_cancelled() {
                    // The response lost the race against a supersession or
                    // teardown; its provisional entry is already gone.
                    return Ok(SendReceipt::Cancelled);
                }
                self.clear_in_flight(&temp_id).await;
                {
                    let mut store = self.store.lock().await;
                    // No-op when the inbound echo already confirmed it.
                    store.reconcile(&temp_id, &response.message_id);
                }
                self.events.emit(EngineEvent::MessagesUpdated);
                self.events.emit(normalize_send_outcome(
                    &temp_id,
                    SendOutcome::Success {
                        message_id: response.message_id.clone(),
                    },
                ));
                Ok(SendReceipt::Confirmed {
                    message_id: response.message_id,
                })
            }
            Some(Ok(Err(err))) => {
                if cancel.is_cancelled() {
                    // Lost the race against a supersession or teardown;
                    // the failure must not surface.
                    return Ok(SendReceipt::Cancelled);
                }
                self.clear_in_flight(&temp_id).await;
                self.fail(&temp_id, err).await
            }
        }
    }

    /// Cancel the in-flight send, if any. Idempotent.
    pub(crate) async fn teardown(&self) {
        let mut in_flight = self.in_flight.lock().await;
        if let Some(in_flight) = in_flight.take() {
            in_flight.cancel.cancel();
        }
    }

    async fn fail(&self, temp_id: &str, err: EngineError) -> Result<SendReceipt, EngineError> {
        warn!(temp_id, error = %err, "send failed, rolling back provisional entry");
        let rolled_back = {
            let mut store = self.store.lock().await;
            store.rollback(temp_id)
        };
        if rolled_back {
            self.events.emit(EngineEvent::MessagesUpdated);
        }
        self.events.emit(normalize_send_outcome(
            temp_id,
            SendOutcome::Failure { error: err.clone() },
        ));
        Err(err)
    }

    async fn clear_in_flight(&self, temp_id: &str) {
        let mut in_flight = self.in_flight.lock().await;
        if in_flight
            .as_ref()
            .is_some_and(|current| current.temp_id == temp_id)
        {
            *in_flight = None;
        }
    }
}

fn new_temp_id() -> String {
    let rand = Uuid::new_v4().simple().to_string();
    format!("temp-{}-{}", now_ms(), &rand[..8])
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
