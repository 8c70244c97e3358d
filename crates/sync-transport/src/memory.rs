//! Scripted in-process collaborators for tests and the smoke app.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use sync_core::{ChannelStatus, EngineError, EngineErrorCategory, Message};

use crate::{
    ChannelEvent, HistoryLoader, RealtimeChannel, SendEndpoint, SendRequest, SendResponse,
    Subscription, SubscriptionHandle,
};

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Default)]
struct ChannelInner {
    auth_token: Option<String>,
    set_auth_calls: usize,
    subscribe_calls: usize,
    auth_set_before_first_subscribe: Option<bool>,
    next_subscription_id: u64,
    subscriptions: HashMap<String, Vec<(u64, mpsc::Sender<ChannelEvent>)>>,
    status_on_subscribe: Option<ChannelStatus>,
    failing_subscribes: usize,
}

/// In-memory realtime channel. Tests and the smoke app push inserts and
/// status changes; the engine consumes them like transport events.
#[derive(Clone, Default)]
pub struct InMemoryChannel {
    inner: Arc<Mutex<ChannelInner>>,
}

impl InMemoryChannel {
    /// Channel that reports `Subscribed` as soon as a subscription opens.
    pub fn new() -> Self {
        let channel = Self::default();
        channel.set_status_on_subscribe(Some(ChannelStatus::Subscribed));
        channel
    }

    /// Override the status emitted right after each subscribe, or `None`
    /// to emit nothing.
    pub fn set_status_on_subscribe(&self, status: Option<ChannelStatus>) {
        self.inner.lock().expect("channel lock").status_on_subscribe = status;
    }

    /// Make the next `count` subscribe calls fail with a transport error.
    pub fn fail_next_subscribes(&self, count: usize) {
        self.inner.lock().expect("channel lock").failing_subscribes = count;
    }

    /// Deliver an inbound message to every live subscription on `topic`.
    pub fn push_insert(&self, topic: &str, message: Message) {
        self.broadcast(topic, ChannelEvent::Insert(message));
    }

    /// Deliver a status change to every live subscription on `topic`.
    pub fn push_status(&self, topic: &str, status: ChannelStatus) {
        self.broadcast(topic, ChannelEvent::Status(status));
    }

    /// Number of live subscriptions on `topic`.
    pub fn active_subscriptions(&self, topic: &str) -> usize {
        let inner = self.inner.lock().expect("channel lock");
        inner.subscriptions.get(topic).map_or(0, Vec::len)
    }

    /// Last token applied via `set_auth`.
    pub fn auth_token(&self) -> Option<String> {
        self.inner.lock().expect("channel lock").auth_token.clone()
    }

    /// Number of `set_auth` calls observed.
    pub fn set_auth_calls(&self) -> usize {
        self.inner.lock().expect("channel lock").set_auth_calls
    }

    /// Number of `subscribe` calls observed, including failed ones.
    pub fn subscribe_calls(&self) -> usize {
        self.inner.lock().expect("channel lock").subscribe_calls
    }

    /// Whether an auth token was already applied when the first subscribe
    /// arrived. `None` until a subscribe has been observed.
    pub fn auth_set_before_first_subscribe(&self) -> Option<bool> {
        self.inner
            .lock()
            .expect("channel lock")
            .auth_set_before_first_subscribe
    }

    fn broadcast(&self, topic: &str, event: ChannelEvent) {
        let senders: Vec<mpsc::Sender<ChannelEvent>> = {
            let inner = self.inner.lock().expect("channel lock");
            inner
                .subscriptions
                .get(topic)
                .map(|subs| subs.iter().map(|(_, tx)| tx.clone()).collect())
                .unwrap_or_default()
        };
        for tx in senders {
            let _ = tx.try_send(event.clone());
        }
    }
}

struct InMemorySubscriptionHandle {
    inner: Arc<Mutex<ChannelInner>>,
    topic: String,
    id: u64,
    active: bool,
}

impl SubscriptionHandle for InMemorySubscriptionHandle {
    fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        let mut inner = self.inner.lock().expect("channel lock");
        if let Some(subs) = inner.subscriptions.get_mut(&self.topic) {
            subs.retain(|(id, _)| *id != self.id);
        }
    }
}

impl Drop for InMemorySubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[async_trait]
impl RealtimeChannel for InMemoryChannel {
    async fn set_auth(&self, token: &str) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().expect("channel lock");
        inner.auth_token = Some(token.to_owned());
        inner.set_auth_calls += 1;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, EngineError> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let (id, status) = {
            let mut inner = self.inner.lock().expect("channel lock");
            inner.subscribe_calls += 1;
            if inner.auth_set_before_first_subscribe.is_none() {
                inner.auth_set_before_first_subscribe = Some(inner.auth_token.is_some());
            }
            if inner.failing_subscribes > 0 {
                inner.failing_subscribes -= 1;
                return Err(EngineError::new(
                    EngineErrorCategory::Network,
                    "channel_subscribe_failed",
                    format!("scripted subscribe failure for topic '{topic}'"),
                ));
            }

            let id = inner.next_subscription_id;
            inner.next_subscription_id += 1;
            inner
                .subscriptions
                .entry(topic.to_owned())
                .or_default()
                .push((id, tx.clone()));
            (id, inner.status_on_subscribe)
        };

        if let Some(status) = status {
            let _ = tx.try_send(ChannelEvent::Status(status));
        }

        Ok(Subscription {
            events: rx,
            handle: Box::new(InMemorySubscriptionHandle {
                inner: Arc::clone(&self.inner),
                topic: topic.to_owned(),
                id,
                active: true,
            }),
        })
    }
}

#[derive(Debug, Default)]
struct LoaderInner {
    script: VecDeque<Result<Vec<Message>, EngineError>>,
    messages: Vec<Message>,
    calls: usize,
}

/// In-memory history loader with an optional per-call result script.
#[derive(Clone, Default)]
pub struct InMemoryHistoryLoader {
    inner: Arc<Mutex<LoaderInner>>,
}

impl InMemoryHistoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader that always returns `messages`.
    pub fn with_messages(messages: Vec<Message>) -> Self {
        let loader = Self::default();
        loader.inner.lock().expect("loader lock").messages = messages;
        loader
    }

    /// Queue one scripted result consumed before the default history.
    pub fn push_result(&self, result: Result<Vec<Message>, EngineError>) {
        self.inner
            .lock()
            .expect("loader lock")
            .script
            .push_back(result);
    }

    /// Number of load calls observed.
    pub fn calls(&self) -> usize {
        self.inner.lock().expect("loader lock").calls
    }
}

#[async_trait]
impl HistoryLoader for InMemoryHistoryLoader {
    async fn load_history(&self, _conversation_id: &str) -> Result<Vec<Message>, EngineError> {
        let mut inner = self.inner.lock().expect("loader lock");
        inner.calls += 1;
        match inner.script.pop_front() {
            Some(result) => result,
            None => Ok(inner.messages.clone()),
        }
    }
}

/// One scripted endpoint response.
#[derive(Debug, Clone)]
pub struct ScriptedSend {
    /// Delay before the endpoint answers.
    pub delay: Duration,
    /// Confirmed message ID or the failure to return.
    pub result: Result<String, EngineError>,
}

#[derive(Debug, Default)]
struct EndpointInner {
    script: VecDeque<ScriptedSend>,
    requests: Vec<SendRequest>,
}

/// Scripted send endpoint recording every request it receives.
#[derive(Clone, Default)]
pub struct ScriptedSendEndpoint {
    inner: Arc<Mutex<EndpointInner>>,
}

impl ScriptedSendEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an immediate success returning `message_id`.
    pub fn enqueue_success(&self, message_id: impl Into<String>) {
        self.enqueue_success_after(message_id, Duration::ZERO);
    }

    /// Queue a success returning `message_id` after `delay`.
    pub fn enqueue_success_after(&self, message_id: impl Into<String>, delay: Duration) {
        self.enqueue(ScriptedSend {
            delay,
            result: Ok(message_id.into()),
        });
    }

    /// Queue an immediate failure.
    pub fn enqueue_failure(&self, error: EngineError) {
        self.enqueue(ScriptedSend {
            delay: Duration::ZERO,
            result: Err(error),
        });
    }

    fn enqueue(&self, send: ScriptedSend) {
        self.inner
            .lock()
            .expect("endpoint lock")
            .script
            .push_back(send);
    }

    /// Requests observed so far, in arrival order.
    pub fn requests(&self) -> Vec<SendRequest> {
        self.inner.lock().expect("endpoint lock").requests.clone()
    }
}

#[async_trait]
impl SendEndpoint for ScriptedSendEndpoint {
    async fn send(&self, request: SendRequest) -> Result<SendResponse, EngineError> {
        let scripted = {
            let mut inner = self.inner.lock().expect("endpoint lock");
            inner.requests.push(request);
            inner.script.pop_front()
        };

        let Some(scripted) = scripted else {
            return Err(EngineError::new(
                EngineErrorCategory::Internal,
                "unscripted_send",
                "no scripted response queued for this send",
            ));
        };

        if scripted.delay > Duration::ZERO {
            tokio::time::sleep(scripted.delay).await;
        }
        scripted
            .result
            .map(|message_id| SendResponse { message_id })
    }
}
