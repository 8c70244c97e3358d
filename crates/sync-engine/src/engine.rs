use std::{
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sync_core::{
    normalize_fatal_error, BackoffPolicy, ConnectionState, ConnectionStateMachine, EngineConfig,
    EngineError, EngineErrorCategory, EngineEvent, EngineEvents, EventStream, Message,
    MessageStore,
};
use sync_transport::{HistoryLoader, RealtimeChannel, SendEndpoint};

use crate::{
    send::{SendCoordinator, SendReceipt},
    supervisor::ConnectionSupervisor,
};

const EVENT_BUFFER: usize = 256;

pub(crate) fn shutdown_error() -> EngineError {
    EngineError::new(
        EngineErrorCategory::Internal,
        "engine_shut_down",
        "engine has been shut down",
    )
}

/// Collaborators the engine drives. All transport specifics live behind
/// these trait objects.
pub struct EngineTransports {
    /// Push-based realtime message source.
    pub channel: Arc<dyn RealtimeChannel>,
    /// Loader for the persisted conversation history.
    pub loader: Arc<dyn HistoryLoader>,
    /// Endpoint accepting outbound sends.
    pub endpoint: Arc<dyn SendEndpoint>,
    /// Optional credential applied to the channel before subscribing.
    pub auth_token: Option<String>,
}

/// Sync engine for a single conversation.
///
/// `init` loads history and opens the subscription; `send_message` runs an
/// optimistic send; `shutdown` tears everything down deterministically.
/// Consumers observe immutable snapshots plus a broadcast event stream;
/// all mutation happens inside the engine.
pub struct SyncEngine {
    conversation_id: String,
    loader: Arc<dyn HistoryLoader>,
    store: Arc<Mutex<MessageStore>>,
    events: EngineEvents,
    supervisor: Arc<ConnectionSupervisor>,
    sender: SendCoordinator,
    state: Arc<StdMutex<ConnectionStateMachine>>,
    last_error: Arc<StdMutex<Option<EngineError>>>,
    shutdown: CancellationToken,
}

impl SyncEngine {
    pub fn new(
        config: EngineConfig,
        conversation_id: impl Into<String>,
        transports: EngineTransports,
    ) -> Self {
        let conversation_id = conversation_id.into();
        let store = Arc::new(Mutex::new(MessageStore::new(config.max_messages)));
        let events = EngineEvents::new(EVENT_BUFFER);
        let state = Arc::new(StdMutex::new(ConnectionStateMachine::default()));
        let last_error: Arc<StdMutex<Option<EngineError>>> = Arc::new(StdMutex::new(None));
        let shutdown = CancellationToken::new();

        let supervisor = Arc::new(ConnectionSupervisor::new(
            transports.channel,
            topic_for(&conversation_id),
            transports.auth_token,
            BackoffPolicy::new(config.base_reconnect_delay_ms, config.max_reconnect_delay_ms),
            config.max_reconnect_attempts,
            Arc::clone(&store),
            events.clone(),
            Arc::clone(&state),
            Arc::clone(&last_error),
            shutdown.child_token(),
        ));

        let sender = SendCoordinator::new(
            transports.endpoint,
            conversation_id.clone(),
            Arc::clone(&store),
            events.clone(),
            Duration::from_millis(config.send_timeout_ms),
            shutdown.child_token(),
        );

        Self {
            conversation_id,
            loader: transports.loader,
            store,
            events,
            supervisor,
            sender,
            state,
            last_error,
            shutdown,
        }
    }

    /// Conversation this engine synchronizes.
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Load history and open the subscription.
    ///
    /// A failed history load is surfaced as recoverable and leaves the
    /// connection untouched; calling `init` again retries from scratch.
    pub async fn init(&self) -> Result<(), EngineError> {
        if self.shutdown.is_cancelled() {
            return Err(shutdown_error());
        }
        info!(conversation_id = %self.conversation_id, "initializing sync engine");

        let history = match self.loader.load_history(&self.conversation_id).await {
            Ok(history) => history,
            Err(err) => {
                warn!(error = %err, "history load failed");
                let wrapped = EngineError::new(
                    EngineErrorCategory::Storage,
                    "history_load_failed",
                    err.message,
                );
                *self.last_error.lock().expect("error lock") = Some(wrapped.clone());
                self.events.emit(normalize_fatal_error(wrapped.clone(), true));
                return Err(wrapped);
            }
        };

        if self.shutdown.is_cancelled() {
            return Err(shutdown_error());
        }

        let changed = {
            let mut store = self.store.lock().await;
            let mut changed = false;
            for message in history {
                changed |= store.merge_inbound(message);
            }
            changed
        };
        if changed {
            self.events.emit(EngineEvent::MessagesUpdated);
        }

        self.supervisor.connect().await
    }

    /// Send a message, inserting it optimistically before the network
    /// confirms it.
    pub async fn send_message(
        &self,
        content: &str,
        interface: &str,
    ) -> Result<SendReceipt, EngineError> {
        self.sender.send(content, interface).await
    }

    /// Snapshot of the retained messages in insertion order.
    pub async fn messages(&self) -> Vec<Message> {
        self.store.lock().await.snapshot()
    }

    /// Current connection lifecycle state.
    pub fn connection_state(&self) -> ConnectionState {
        self.state.lock().expect("state lock").state()
    }

    /// Most recent surfaced error, if any.
    pub fn last_error(&self) -> Option<EngineError> {
        self.last_error.lock().expect("error lock").clone()
    }

    /// Subscribe to engine events.
    pub fn subscribe_events(&self) -> EventStream {
        self.events.subscribe()
    }

    /// Tear the engine down. Idempotent; afterwards the engine is inert:
    /// late transport callbacks are dropped and no state mutates.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!(conversation_id = %self.conversation_id, "shutting down sync engine");
        self.shutdown.cancel();
        self.sender.teardown().await;
        self.supervisor.teardown().await;
    }
}

fn topic_for(conversation_id: &str) -> String {
    format!("messages:{conversation_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use sync_core::{
        ChannelStatus, ContentType, MessageMetadata, MessageRole, ProcessingStatus, SendAck,
    };
    use sync_transport::memory::{InMemoryChannel, InMemoryHistoryLoader, ScriptedSendEndpoint};
    use sync_transport::{SendRequest, SendResponse};

    const TOPIC: &str = "messages:conv-1";

    fn fast_config() -> EngineConfig {
        EngineConfig {
            max_messages: 100,
            max_reconnect_attempts: 5,
            base_reconnect_delay_ms: 1,
            max_reconnect_delay_ms: 5,
            send_timeout_ms: 200,
        }
    }

    struct Harness {
        engine: Arc<SyncEngine>,
        channel: InMemoryChannel,
        loader: InMemoryHistoryLoader,
        endpoint: ScriptedSendEndpoint,
    }

    fn harness(config: EngineConfig, auth_token: Option<String>) -> Harness {
        let channel = InMemoryChannel::new();
        let loader = InMemoryHistoryLoader::new();
        let endpoint = ScriptedSendEndpoint::new();
        let engine = Arc::new(SyncEngine::new(
            config,
            "conv-1",
            EngineTransports {
                channel: Arc::new(channel.clone()),
                loader: Arc::new(loader.clone()),
                endpoint: Arc::new(endpoint.clone()),
                auth_token,
            },
        ));
        Harness {
            engine,
            channel,
            loader,
            endpoint,
        }
    }

    fn inbound(id: &str, body: &str) -> Message {
        Message {
            id: id.to_owned(),
            conversation_id: "conv-1".to_owned(),
            interface: "browser".to_owned(),
            role: MessageRole::Assistant,
            content: body.to_owned(),
            content_type: ContentType::Text,
            reply_to_message_id: None,
            metadata: MessageMetadata::default(),
            processing_status: ProcessingStatus::Sent,
            created_at_ms: 1_760_000_000_000,
        }
    }

    fn echo(id: &str, temp_id: &str, body: &str) -> Message {
        let mut message = inbound(id, body);
        message.role = MessageRole::User;
        message.metadata.temp_id = Some(temp_id.to_owned());
        message
    }

    async fn wait_for_state(engine: &SyncEngine, expected: ConnectionState) {
        for _ in 0..500 {
            if engine.connection_state() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!(
            "timed out waiting for state {expected:?}, still {:?}",
            engine.connection_state()
        );
    }

    async fn wait_for_message_count(engine: &SyncEngine, expected: usize) {
        for _ in 0..500 {
            if engine.messages().await.len() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!(
            "timed out waiting for {expected} messages, have {}",
            engine.messages().await.len()
        );
    }

    #[tokio::test]
    async fn seeds_history_then_subscribes() {
        let h = harness(fast_config(), None);
        h.loader
            .push_result(Ok(vec![inbound("m1", "one"), inbound("m2", "two")]));

        h.engine.init().await.expect("init should work");

        let snapshot = h.engine.messages().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id, "m1");
        assert_eq!(snapshot[1].id, "m2");

        wait_for_state(&h.engine, ConnectionState::Subscribed).await;
        assert_eq!(h.channel.subscribe_calls(), 1);
        assert!(h.engine.last_error().is_none());
    }

    #[tokio::test]
    async fn applies_auth_credential_before_subscribing() {
        let h = harness(fast_config(), Some("token-123".to_owned()));
        h.engine.init().await.expect("init should work");
        wait_for_state(&h.engine, ConnectionState::Subscribed).await;

        assert_eq!(h.channel.set_auth_calls(), 1);
        assert_eq!(h.channel.auth_token().as_deref(), Some("token-123"));
        assert_eq!(h.channel.auth_set_before_first_subscribe(), Some(true));
    }

    #[tokio::test]
    async fn merges_inbound_events_and_ignores_duplicates() {
        let h = harness(fast_config(), None);
        h.engine.init().await.expect("init should work");
        wait_for_state(&h.engine, ConnectionState::Subscribed).await;

        h.channel.push_insert(TOPIC, inbound("m1", "hello"));
        h.channel.push_insert(TOPIC, inbound("m1", "hello"));
        h.channel.push_insert(TOPIC, inbound("m2", "world"));

        wait_for_message_count(&h.engine, 2).await;
        let snapshot = h.engine.messages().await;
        assert_eq!(snapshot[0].id, "m1");
        assert_eq!(snapshot[1].id, "m2");
    }

    #[tokio::test]
    async fn confirms_optimistic_send_on_success() {
        let h = harness(fast_config(), None);
        h.endpoint.enqueue_success("m1");
        h.engine.init().await.expect("init should work");
        wait_for_state(&h.engine, ConnectionState::Subscribed).await;

        let mut events = h.engine.subscribe_events();
        let receipt = h
            .engine
            .send_message("hello", "browser")
            .await
            .expect("send should work");
        assert_eq!(
            receipt,
            SendReceipt::Confirmed {
                message_id: "m1".to_owned()
            }
        );

        let snapshot = h.engine.messages().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "m1");
        assert_eq!(snapshot[0].content, "hello");
        assert!(!snapshot[0].metadata.optimistic);
        assert_eq!(snapshot[0].processing_status, ProcessingStatus::Sent);

        let requests = h.endpoint.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].temp_id.starts_with("temp-"));
        assert_eq!(requests[0].interface_tag, "browser");

        let mut acks: Vec<SendAck> = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::SendAck(ack) = event {
                acks.push(ack);
            }
        }
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].message_id.as_deref(), Some("m1"));
        assert_eq!(acks[0].error_code, None);
    }

    #[tokio::test]
    async fn rolls_back_provisional_entry_on_send_failure() {
        let h = harness(fast_config(), None);
        h.endpoint.enqueue_failure(EngineError::new(
            EngineErrorCategory::Config,
            "send_failed",
            "conversation is archived",
        ));
        h.engine.init().await.expect("init should work");
        wait_for_state(&h.engine, ConnectionState::Subscribed).await;

        let err = h
            .engine
            .send_message("hello", "browser")
            .await
            .expect_err("send must fail");
        assert_eq!(err.code, "send_failed");
        assert!(h.engine.messages().await.is_empty());
    }

    #[tokio::test]
    async fn newer_send_supersedes_older_without_error() {
        let h = harness(fast_config(), None);
        h.endpoint
            .enqueue_success_after("m-a", Duration::from_millis(100));
        h.endpoint.enqueue_success("m-b");
        h.engine.init().await.expect("init should work");
        wait_for_state(&h.engine, ConnectionState::Subscribed).await;

        let first = tokio::spawn({
            let engine = Arc::clone(&h.engine);
            async move { engine.send_message("a", "browser").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = h
            .engine
            .send_message("b", "browser")
            .await
            .expect("second send should work");
        assert_eq!(
            second,
            SendReceipt::Confirmed {
                message_id: "m-b".to_owned()
            }
        );

        let first = first
            .await
            .expect("join")
            .expect("superseded send must not surface an error");
        assert_eq!(first, SendReceipt::Cancelled);

        let snapshot = h.engine.messages().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "m-b");
        assert_eq!(snapshot[0].content, "b");
    }

    #[tokio::test]
    async fn times_out_unanswered_send_and_rolls_back() {
        let mut config = fast_config();
        config.send_timeout_ms = 50;
        let h = harness(config, None);
        h.endpoint
            .enqueue_success_after("m1", Duration::from_millis(500));
        h.engine.init().await.expect("init should work");
        wait_for_state(&h.engine, ConnectionState::Subscribed).await;

        let mut events = h.engine.subscribe_events();
        let err = h
            .engine
            .send_message("hello", "browser")
            .await
            .expect_err("unanswered send must time out");
        assert_eq!(err.code, "send_timeout");
        assert_eq!(err.category, EngineErrorCategory::Network);
        // The provisional entry does not outlive the failed attempt.
        assert!(h.engine.messages().await.is_empty());

        let mut acks: Vec<SendAck> = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::SendAck(ack) = event {
                acks.push(ack);
            }
        }
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].message_id, None);
        assert_eq!(acks[0].error_code.as_deref(), Some("send_timeout"));
    }

    /// Blocks its first send on a gate; later sends confirm immediately.
    struct GatedSendEndpoint {
        calls: AtomicUsize,
        entered: Notify,
        release: Notify,
    }

    impl GatedSendEndpoint {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                entered: Notify::new(),
                release: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl SendEndpoint for GatedSendEndpoint {
        async fn send(&self, _request: SendRequest) -> Result<SendResponse, EngineError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.entered.notify_one();
                self.release.notified().await;
                Ok(SendResponse {
                    message_id: "m-slow".to_owned(),
                })
            } else {
                Ok(SendResponse {
                    message_id: "m-fast".to_owned(),
                })
            }
        }
    }

    #[tokio::test]
    async fn late_response_for_superseded_send_is_discarded() {
        let channel = InMemoryChannel::new();
        let endpoint = Arc::new(GatedSendEndpoint::new());
        let engine = Arc::new(SyncEngine::new(
            EngineConfig {
                send_timeout_ms: 5_000,
                ..fast_config()
            },
            "conv-1",
            EngineTransports {
                channel: Arc::new(channel.clone()),
                loader: Arc::new(InMemoryHistoryLoader::new()),
                endpoint: Arc::clone(&endpoint) as Arc<dyn SendEndpoint>,
                auth_token: None,
            },
        ));
        engine.init().await.expect("init should work");
        wait_for_state(&engine, ConnectionState::Subscribed).await;

        let mut events = engine.subscribe_events();
        let first = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.send_message("slow", "browser").await }
        });
        endpoint.entered.notified().await;

        let second = engine
            .send_message("fast", "browser")
            .await
            .expect("second send should work");
        assert_eq!(
            second,
            SendReceipt::Confirmed {
                message_id: "m-fast".to_owned()
            }
        );

        // The server answers the superseded send only now, after its
        // provisional entry was already rolled back.
        endpoint.release.notify_one();
        let first = first
            .await
            .expect("join")
            .expect("superseded send must not surface an error");
        assert_eq!(first, SendReceipt::Cancelled);

        let snapshot = engine.messages().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "m-fast");

        // The stale confirmation must not produce a success ack.
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::SendAck(ack) = event {
                assert_ne!(ack.message_id.as_deref(), Some("m-slow"));
            }
        }
    }

    #[tokio::test]
    async fn subscription_echo_confirms_send_exactly_once() {
        let h = harness(fast_config(), None);
        h.endpoint
            .enqueue_success_after("m9", Duration::from_millis(80));
        h.engine.init().await.expect("init should work");
        wait_for_state(&h.engine, ConnectionState::Subscribed).await;

        let sender = tokio::spawn({
            let engine = Arc::clone(&h.engine);
            async move { engine.send_message("hi", "browser").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let temp_id = h.endpoint.requests()[0].temp_id.clone();
        h.channel.push_insert(TOPIC, echo("m9", &temp_id, "hi"));

        let receipt = sender
            .await
            .expect("join")
            .expect("send should still resolve");
        assert_eq!(
            receipt,
            SendReceipt::Confirmed {
                message_id: "m9".to_owned()
            }
        );

        // Echo and direct response both referenced the temp ID; exactly
        // one confirmed entry remains.
        let snapshot = h.engine.messages().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "m9");
        assert!(!snapshot[0].metadata.optimistic);
    }

    #[tokio::test]
    async fn exhausts_after_repeated_channel_errors() {
        let h = harness(fast_config(), None);
        h.channel
            .set_status_on_subscribe(Some(ChannelStatus::ChannelError));

        h.engine.init().await.expect("init should work");
        wait_for_state(&h.engine, ConnectionState::Exhausted).await;

        let err = h.engine.last_error().expect("terminal error must be set");
        assert_eq!(err.code, "reconnect_exhausted");
        // Cap of five retries means six subscribe attempts in total.
        assert_eq!(h.channel.subscribe_calls(), 6);
    }

    #[tokio::test]
    async fn recovers_from_transient_subscribe_failure() {
        let h = harness(fast_config(), None);
        h.channel.fail_next_subscribes(1);

        h.engine.init().await.expect("init should work");
        wait_for_state(&h.engine, ConnectionState::Subscribed).await;

        assert_eq!(h.channel.subscribe_calls(), 2);
        assert!(h.engine.last_error().is_none());
    }

    #[tokio::test]
    async fn holds_steady_once_resubscribed() {
        let h = harness(fast_config(), None);
        h.channel.fail_next_subscribes(2);

        h.engine.init().await.expect("init should work");
        wait_for_state(&h.engine, ConnectionState::Subscribed).await;
        assert_eq!(h.channel.subscribe_calls(), 3);

        // No stray reconnect timer fires another subscribe while the
        // channel stays live.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.channel.subscribe_calls(), 3);
        assert_eq!(h.engine.connection_state(), ConnectionState::Subscribed);
    }

    #[tokio::test]
    async fn failed_history_load_is_surfaced_and_retryable() {
        let h = harness(fast_config(), None);
        h.loader.push_result(Err(EngineError::new(
            EngineErrorCategory::Storage,
            "db_offline",
            "scripted outage",
        )));

        let err = h.engine.init().await.expect_err("first init must fail");
        assert_eq!(err.code, "history_load_failed");
        assert_eq!(
            h.engine.last_error().map(|err| err.code),
            Some("history_load_failed".to_owned())
        );
        // The connection is untouched until history loads.
        assert_eq!(h.channel.subscribe_calls(), 0);
        assert_eq!(h.engine.connection_state(), ConnectionState::Closed);

        h.loader.push_result(Ok(vec![inbound("m1", "one")]));
        h.engine.init().await.expect("second init should work");
        wait_for_state(&h.engine, ConnectionState::Subscribed).await;
        assert_eq!(h.engine.messages().await.len(), 1);
    }

    #[tokio::test]
    async fn stays_silent_after_shutdown() {
        let h = harness(fast_config(), None);
        h.endpoint
            .enqueue_success_after("m1", Duration::from_millis(100));
        h.engine.init().await.expect("init should work");
        wait_for_state(&h.engine, ConnectionState::Subscribed).await;

        h.channel.push_insert(TOPIC, inbound("m0", "early"));
        wait_for_message_count(&h.engine, 1).await;

        let sender = tokio::spawn({
            let engine = Arc::clone(&h.engine);
            async move { engine.send_message("hello", "browser").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.engine.messages().await.len(), 2);

        h.engine.shutdown().await;
        assert_eq!(h.engine.connection_state(), ConnectionState::Closed);
        assert_eq!(h.channel.active_subscriptions(TOPIC), 0);

        // Late transport callbacks must be dropped without mutation.
        h.channel.push_insert(TOPIC, inbound("m5", "late"));
        h.channel.push_status(TOPIC, ChannelStatus::ChannelError);

        let receipt = sender
            .await
            .expect("join")
            .expect("cancelled send must not surface an error");
        assert_eq!(receipt, SendReceipt::Cancelled);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(h.engine.messages().await.len(), 2);
        assert_eq!(h.engine.connection_state(), ConnectionState::Closed);

        let err = h
            .engine
            .send_message("after", "browser")
            .await
            .expect_err("sends after shutdown must fail fast");
        assert_eq!(err.code, "engine_shut_down");

        // Teardown is idempotent.
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn keeps_history_bounded_under_inbound_pressure() {
        let mut config = fast_config();
        config.max_messages = 5;
        let h = harness(config, None);
        h.engine.init().await.expect("init should work");
        wait_for_state(&h.engine, ConnectionState::Subscribed).await;

        for n in 0..20 {
            h.channel
                .push_insert(TOPIC, inbound(&format!("m{n}"), "body"));
        }

        wait_for_message_count(&h.engine, 5).await;
        // Give any stragglers time to land, then re-check the bound.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let snapshot = h.engine.messages().await;
        assert_eq!(snapshot.len(), 5);
        assert_eq!(snapshot[4].id, "m19");
    }
}
