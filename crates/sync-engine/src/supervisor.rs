use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Mutex as StdMutex,
};

use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sync_core::{
    normalize_fatal_error, BackoffPolicy, ChannelStatus, ConnectionStateMachine, EngineError,
    EngineErrorCategory, EngineEvent, EngineEvents, MessageStore,
};
use sync_transport::{ChannelEvent, RealtimeChannel, Subscription, SubscriptionHandle};

/// Owns the realtime subscription for one conversation.
///
/// At most one subscription is live at any time; `connect` fully tears
/// down the previous one before opening the next, so events are never
/// delivered twice. Transient drops are retried with exponential backoff
/// up to the attempt cap, after which the connection is exhausted and
/// requires external re-initialization.
pub(crate) struct ConnectionSupervisor {
    channel: Arc<dyn RealtimeChannel>,
    topic: String,
    auth_token: Option<String>,
    backoff: BackoffPolicy,
    max_attempts: u32,
    store: Arc<Mutex<MessageStore>>,
    events: EngineEvents,
    state: Arc<StdMutex<ConnectionStateMachine>>,
    last_error: Arc<StdMutex<Option<EngineError>>>,
    attempts: AtomicU32,
    // Guard flag: at most one scheduled reconnect at a time.
    reconnect_pending: AtomicBool,
    reconnect_cancel: StdMutex<Option<CancellationToken>>,
    active: Mutex<Option<ActiveSubscription>>,
    shutdown: CancellationToken,
}

struct ActiveSubscription {
    handle: Box<dyn SubscriptionHandle>,
    reader_cancel: CancellationToken,
    reader: JoinHandle<()>,
}

impl ConnectionSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        channel: Arc<dyn RealtimeChannel>,
        topic: String,
        auth_token: Option<String>,
        backoff: BackoffPolicy,
        max_attempts: u32,
        store: Arc<Mutex<MessageStore>>,
        events: EngineEvents,
        state: Arc<StdMutex<ConnectionStateMachine>>,
        last_error: Arc<StdMutex<Option<EngineError>>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            channel,
            topic,
            auth_token,
            backoff,
            max_attempts,
            store,
            events,
            state,
            last_error,
            attempts: AtomicU32::new(0),
            reconnect_pending: AtomicBool::new(false),
            reconnect_cancel: StdMutex::new(None),
            active: Mutex::new(None),
            shutdown,
        }
    }

    /// Open (or re-open) the subscription.
    ///
    /// Cancels any armed reconnect timer and tears down the previous
    /// subscription first. A transient failure here schedules a retry and
    /// does not surface; only an exhausted connection returns an error.
    pub(crate) async fn connect(self: &Arc<Self>) -> Result<(), EngineError> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }

        self.cancel_scheduled_reconnect();
        self.teardown_subscription().await;

        let next = {
            let mut state = self.state.lock().expect("state lock");
            state.begin_subscribe()?
        };
        self.events.emit(EngineEvent::ConnectionChanged { state: next });
        debug!(topic = %self.topic, "opening subscription");

        // The credential must land on the transport before subscribe,
        // otherwise the subscription can race its own authorization.
        if let Some(token) = self.auth_token.as_deref() {
            if let Err(err) = self.channel.set_auth(token).await {
                warn!(error = %err, "applying auth credential failed");
                self.record_error(err);
                self.schedule_reconnect();
                return Ok(());
            }
        }

        match self.channel.subscribe(&self.topic).await {
            Ok(subscription) => {
                self.install_subscription(subscription).await;
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, topic = %self.topic, "subscribe failed");
                self.record_error(err);
                self.schedule_reconnect();
                Ok(())
            }
        }
    }

    /// Cancel timers and close the subscription. Idempotent.
    pub(crate) async fn teardown(self: &Arc<Self>) {
        self.cancel_scheduled_reconnect();
        self.teardown_subscription().await;

        let state = self.state.lock().expect("state lock").close();
        self.events.emit(EngineEvent::ConnectionChanged { state });
        debug!(topic = %self.topic, "supervisor torn down");
    }

    async fn install_subscription(self: &Arc<Self>, subscription: Subscription) {
        let Subscription { events, handle } = subscription;
        let reader_cancel = self.shutdown.child_token();
        let reader = self.spawn_reader(events, reader_cancel.clone());

        let mut active = self.active.lock().await;
        *active = Some(ActiveSubscription {
            handle,
            reader_cancel,
            reader,
        });
    }

    fn spawn_reader(
        self: &Arc<Self>,
        mut events: tokio::sync::mpsc::Receiver<ChannelEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(ChannelEvent::Insert(message)) => supervisor.on_insert(message).await,
                        Some(ChannelEvent::Status(status)) => {
                            if !supervisor.on_status(status) {
                                break;
                            }
                        }
                        None => {
                            supervisor.on_status(ChannelStatus::Closed);
                            break;
                        }
                    },
                }
            }
        })
    }

    async fn on_insert(&self, message: sync_core::Message) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let changed = {
            let mut store = self.store.lock().await;
            store.merge_inbound(message)
        };
        if changed {
            self.events.emit(EngineEvent::MessagesUpdated);
        }
    }

    /// Handle a transport status change. Returns whether the reader should
    /// keep consuming the subscription.
    fn on_status(self: &Arc<Self>, status: ChannelStatus) -> bool {
        match status {
            ChannelStatus::Subscribed => {
                // A live subscription invalidates any armed reconnect.
                self.cancel_scheduled_reconnect();
                self.attempts.store(0, Ordering::SeqCst);
                *self.last_error.lock().expect("error lock") = None;
                if let Ok(state) = self.state.lock().expect("state lock").mark_subscribed() {
                    self.events.emit(EngineEvent::ConnectionChanged { state });
                }
                info!(topic = %self.topic, "subscription live");
                true
            }
            ChannelStatus::ChannelError | ChannelStatus::TimedOut | ChannelStatus::Closed => {
                warn!(topic = %self.topic, ?status, "subscription dropped");
                self.schedule_reconnect();
                false
            }
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if self.reconnect_pending.swap(true, Ordering::SeqCst) {
            // A reconnect is already armed.
            return;
        }

        let attempt = self.attempts.load(Ordering::SeqCst);
        if attempt >= self.max_attempts {
            self.reconnect_pending.store(false, Ordering::SeqCst);
            self.exhaust(attempt);
            return;
        }

        let hint = self
            .last_error
            .lock()
            .expect("error lock")
            .as_ref()
            .and_then(|err| err.retry_after_ms);
        let delay = self.backoff.delay_for_attempt(attempt, hint);
        self.attempts.store(attempt + 1, Ordering::SeqCst);

        if let Ok(state) = self
            .state
            .lock()
            .expect("state lock")
            .mark_reconnect_scheduled()
        {
            self.events.emit(EngineEvent::ConnectionChanged { state });
        }
        info!(
            topic = %self.topic,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );

        let token = self.shutdown.child_token();
        *self.reconnect_cancel.lock().expect("reconnect lock") = Some(token.clone());

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    supervisor.reconnect_pending.store(false, Ordering::SeqCst);
                    if let Err(err) = supervisor.connect().await {
                        warn!(error = %err, "reconnect attempt failed");
                    }
                }
            }
        });
    }

    fn exhaust(self: &Arc<Self>, attempts: u32) {
        let state = self.state.lock().expect("state lock").mark_exhausted();
        let err = EngineError::new(
            EngineErrorCategory::Network,
            "reconnect_exhausted",
            format!("gave up after {attempts} consecutive reconnect attempts"),
        );
        error!(topic = %self.topic, attempts, "reconnect attempts exhausted");
        *self.last_error.lock().expect("error lock") = Some(err.clone());
        self.events.emit(EngineEvent::ConnectionChanged { state });
        self.events.emit(normalize_fatal_error(err, false));
    }

    fn cancel_scheduled_reconnect(&self) {
        if let Some(token) = self
            .reconnect_cancel
            .lock()
            .expect("reconnect lock")
            .take()
        {
            token.cancel();
        }
        self.reconnect_pending.store(false, Ordering::SeqCst);
    }

    async fn teardown_subscription(&self) {
        let active = {
            let mut active = self.active.lock().await;
            active.take()
        };

        if let Some(mut active) = active {
            active.reader_cancel.cancel();
            active.handle.unsubscribe();
            let _ = active.reader.await;
        }
    }

    fn record_error(&self, err: EngineError) {
        *self.last_error.lock().expect("error lock") = Some(err);
    }
}
