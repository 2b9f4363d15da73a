//! ---
//! relay_section: "02-messaging"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Subscription channel: broker session, lifecycle and delivery task."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
//! Subscription channel.
//!
//! A channel owns one broker session at a time. Inbound events are consumed by
//! a dedicated delivery task which drives the lifecycle state machine,
//! dispatches notifications to the listener registry, resolves pending
//! command replies and, when the channel serves commands, answers them.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected
//!                     |                                           ^
//!                     +-------------------------------------------+
//! ```
//!
//! Reconnection is left to the caller: a session dropped by the broker ends
//! in `Disconnected` and `connect` may be called again.

use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use indexmap::IndexSet;
use parking_lot::{Mutex, RwLock};
use relay_common::{ChannelConfig, CorrelatorConfig};
use relay_logging::{
    log_lifecycle_event, relay_debug, relay_error, relay_info, relay_warn, LifecycleOutcome,
    LogContext,
};
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::broker::{Broker, BrokerEvent, BrokerLink, BrokerStatus, ClientId};
use crate::codec::EnvelopeCodec;
use crate::correlator::{Correlator, PendingReplies};
use crate::envelope::{AsyncMessage, Envelope, Uid};
use crate::logging::{log_envelope, MessageDirection, MessagingMetricsExporter};
use crate::registry::{ListenerHandle, ListenerRegistry};
use crate::responder::CommandResponder;
use crate::{MessagingError, Result};

const EVENT_CAPACITY: usize = 64;

/// Lifecycle state of a [`SubscriptionChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// No broker session.
    Disconnected,
    /// Session attached, waiting for the broker to confirm subscriptions.
    Connecting,
    /// Subscriptions confirmed; notifications are flowing.
    Connected,
    /// Unsubscribe requested, waiting for the broker to confirm.
    Disconnecting,
}

impl ChannelState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: ChannelState) -> bool {
        use ChannelState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnecting)
                | (Disconnecting, Disconnected)
        )
    }

    /// Lowercase label used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::Connecting => "connecting",
            ChannelState::Connected => "connected",
            ChannelState::Disconnecting => "disconnecting",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle notification broadcast to [`SubscriptionChannel::events`] receivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The channel moved between lifecycle states.
    StateChanged {
        /// Previous state.
        from: ChannelState,
        /// New state.
        to: ChannelState,
    },
}

/// Snapshot of one topic subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionState {
    /// Subscribed topic.
    pub topic: String,
    /// Whether the channel is currently connected.
    pub connected: bool,
    /// Listeners registered for the topic.
    pub listeners: usize,
}

struct Session {
    client: ClientId,
    delivery: JoinHandle<()>,
}

struct ChannelInner {
    name: String,
    broker: Arc<dyn Broker>,
    codec: EnvelopeCodec,
    config: ChannelConfig,
    correlator: CorrelatorConfig,
    registry: ListenerRegistry,
    pending: Arc<PendingReplies>,
    responder: RwLock<Option<Arc<CommandResponder>>>,
    topics: Mutex<IndexSet<String>>,
    session: AsyncMutex<Option<Session>>,
    state: watch::Sender<ChannelState>,
    events: broadcast::Sender<ChannelEvent>,
    metrics: Option<MessagingMetricsExporter>,
}

impl ChannelInner {
    fn log_context(&self) -> LogContext<'_> {
        LogContext::new().with_channel(&self.name)
    }

    fn current_state(&self) -> ChannelState {
        *self.state.borrow()
    }

    fn transition(&self, to: ChannelState, outcome: LifecycleOutcome) -> bool {
        let mut from = to;
        let changed = self.state.send_if_modified(|state| {
            from = *state;
            if state.can_transition_to(to) {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            log_lifecycle_event(
                Some(&self.log_context()),
                "channel.state",
                &format!("{from} -> {to}"),
                outcome,
            );
            let _ = self.events.send(ChannelEvent::StateChanged { from, to });
        } else if from != to {
            relay_warn!(
                context = self.log_context(),
                "rejected state transition {from} -> {to}"
            );
        }
        changed
    }

    /// Broker-initiated loss of the session.
    fn session_lost(&self, reason: &str) {
        match self.current_state() {
            ChannelState::Connected => {
                self.transition(ChannelState::Disconnecting, LifecycleOutcome::Fault);
                self.transition(ChannelState::Disconnected, LifecycleOutcome::Fault);
            }
            ChannelState::Connecting | ChannelState::Disconnecting => {
                self.transition(ChannelState::Disconnected, LifecycleOutcome::Fault);
            }
            ChannelState::Disconnected => return,
        }
        relay_warn!(context = self.log_context(), "broker dropped the session: {reason}");
    }

    fn subscription_topics(&self) -> Vec<String> {
        let mut topics: IndexSet<String> = self.config.subscriptions.iter().cloned().collect();
        {
            let mut tracked = self.topics.lock();
            tracked.extend(self.registry.topics());
            topics.extend(tracked.iter().cloned());
        }
        topics.insert(self.correlator.reply_topic.clone());
        if self.responder.read().is_some() {
            topics.insert(self.correlator.command_topic.clone());
        }
        topics.into_iter().collect()
    }

    fn on_status(&self, status: BrokerStatus) {
        match status {
            BrokerStatus::Subscribed(topics) => {
                if self.current_state() == ChannelState::Connecting {
                    self.transition(ChannelState::Connected, LifecycleOutcome::Success);
                } else {
                    relay_debug!(context = self.log_context(), "subscribed to {topics:?}");
                }
            }
            BrokerStatus::Unsubscribed(_) => {
                if self.current_state() == ChannelState::Disconnecting {
                    self.transition(ChannelState::Disconnected, LifecycleOutcome::Success);
                }
            }
            BrokerStatus::Disconnected(reason) => self.session_lost(&reason),
        }
    }

    fn on_message(self: &Arc<Self>, topic: &str, payload: &[u8]) {
        let envelope = match self.codec.decode(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                if let Some(metrics) = &self.metrics {
                    metrics.observe_decode_failure();
                }
                let ctx = self.log_context().with_topic(topic);
                relay_warn!(context = ctx, "dropping undecodable payload: {err}");
                return;
            }
        };
        log_envelope(MessageDirection::Inbound, &self.name, topic, &envelope);
        if let Some(metrics) = &self.metrics {
            metrics.observe_received(&envelope);
        }

        match envelope {
            Envelope::Async(message) => {
                let report = self.registry.dispatch(topic, &message);
                if report.failed > 0 {
                    if let Some(metrics) = &self.metrics {
                        metrics.observe_listener_failures(report.failed);
                    }
                }
            }
            Envelope::CommandReply(reply) => {
                let uid = reply.uid().clone();
                let command = reply.name.clone();
                if !self.pending.resolve(reply) {
                    if let Some(metrics) = &self.metrics {
                        metrics.observe_unmatched_reply();
                    }
                    let ctx = self
                        .log_context()
                        .with_topic(topic)
                        .with_uid(uid.as_str())
                        .with_command(&command);
                    relay_debug!(context = ctx, "discarding reply with no waiting command");
                }
            }
            Envelope::Command(command) => {
                let responder = self.responder.read().clone();
                let Some(responder) = responder else {
                    let ctx = self.log_context().with_uid(command.uid().as_str());
                    relay_debug!(context = ctx, "ignoring command, channel is not serving");
                    return;
                };
                let channel = SubscriptionChannel {
                    inner: Arc::clone(self),
                };
                tokio::spawn(async move {
                    let reply = responder.respond(&command).await;
                    let reply_topic = channel.inner.correlator.reply_topic.clone();
                    if let Err(err) = channel.publish_envelope(&reply_topic, reply.into()).await {
                        let ctx = channel
                            .inner
                            .log_context()
                            .with_uid(command.uid().as_str())
                            .with_command(&command.name);
                        relay_error!(context = ctx, "failed to publish reply: {err}");
                    }
                });
            }
            Envelope::Error(error) => {
                let uid = error.uid().clone();
                let message = error.message.clone();
                if !self.pending.fail(error) {
                    let ctx = self.log_context().with_topic(topic).with_uid(uid.as_str());
                    relay_warn!(context = ctx, "error report: {message}");
                }
            }
        }
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.delivery.abort();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let broker = Arc::clone(&self.broker);
                runtime.spawn(async move { broker.detach(session.client).await });
            }
        }
    }
}

async fn deliver(inner: Weak<ChannelInner>, mut events: mpsc::UnboundedReceiver<BrokerEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            BrokerEvent::Status(status) => inner.on_status(status),
            BrokerEvent::Message { topic, payload } => inner.on_message(&topic, &payload),
        }
    }
    if let Some(inner) = inner.upgrade() {
        inner.session_lost("event stream closed");
    }
}

/// Builder for [`SubscriptionChannel`].
pub struct ChannelBuilder {
    broker: Arc<dyn Broker>,
    config: ChannelConfig,
    correlator: CorrelatorConfig,
    responder: Option<CommandResponder>,
    metrics: Option<MessagingMetricsExporter>,
}

impl ChannelBuilder {
    /// Channel settings (name, timeouts, wire format, subscriptions).
    pub fn config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    /// Command and reply topics, default timeout and pending bound.
    pub fn correlator(mut self, config: CorrelatorConfig) -> Self {
        self.correlator = config;
        self
    }

    /// Answer commands received on the command topic.
    pub fn responder(mut self, responder: CommandResponder) -> Self {
        self.responder = Some(responder);
        self
    }

    /// Record activity on the given exporter.
    pub fn metrics(mut self, metrics: MessagingMetricsExporter) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Finish the channel. It starts disconnected.
    pub fn build(self) -> SubscriptionChannel {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let pending = Arc::new(PendingReplies::new(
            self.correlator.max_pending,
            self.metrics.clone(),
        ));
        SubscriptionChannel {
            inner: Arc::new(ChannelInner {
                name: self.config.name.clone(),
                codec: EnvelopeCodec::new(self.config.wire_format),
                broker: self.broker,
                config: self.config,
                correlator: self.correlator,
                registry: ListenerRegistry::new(),
                pending,
                responder: RwLock::new(self.responder.map(Arc::new)),
                topics: Mutex::new(IndexSet::new()),
                session: AsyncMutex::new(None),
                state,
                events,
                metrics: self.metrics,
            }),
        }
    }
}

/// Live connection to a topic broker.
///
/// Cloning is cheap; all clones share the session, registry and pending
/// replies. Dropping the last clone ends the delivery task.
#[derive(Clone)]
pub struct SubscriptionChannel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for SubscriptionChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionChannel")
            .field("name", &self.inner.name)
            .field("broker", &self.inner.broker.name())
            .field("state", &self.inner.current_state())
            .finish()
    }
}

impl SubscriptionChannel {
    /// Start building a channel over `broker`.
    pub fn builder(broker: Arc<dyn Broker>) -> ChannelBuilder {
        ChannelBuilder {
            broker,
            config: ChannelConfig::default(),
            correlator: CorrelatorConfig::default(),
            responder: None,
            metrics: None,
        }
    }

    /// Channel name used in logs.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Codec used for every envelope on this channel.
    pub fn codec(&self) -> EnvelopeCodec {
        self.inner.codec
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.inner.current_state()
    }

    /// Whether subscriptions are confirmed.
    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Watch the lifecycle state.
    pub fn state_changes(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    /// Receive lifecycle transitions as they happen.
    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    /// Command/reply correlator bound to this channel.
    pub fn correlator(&self) -> Correlator {
        Correlator::new(
            self.clone(),
            Arc::clone(&self.inner.pending),
            self.inner.correlator.command_topic.clone(),
            self.inner.correlator.default_timeout,
            self.inner.metrics.clone(),
        )
    }

    /// Attach to the broker and wait until it confirms the subscriptions.
    ///
    /// Returns immediately when already connected. Fails with
    /// [`MessagingError::Connection`] when the broker refuses the session or
    /// does not confirm within the configured connect timeout; the channel is
    /// `Disconnected` afterwards.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        let mut session = inner.session.lock().await;
        if session.is_some() && inner.current_state() == ChannelState::Connected {
            return Ok(());
        }
        if let Some(stale) = session.take() {
            stale.delivery.abort();
            inner.broker.detach(stale.client).await;
        }
        if !inner.transition(ChannelState::Connecting, LifecycleOutcome::Success) {
            return Err(MessagingError::Connection(format!(
                "cannot connect while {}",
                inner.current_state()
            )));
        }

        let limit = inner.config.connect_timeout;
        let outcome = match tokio::time::timeout(limit, self.establish(&mut session)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(MessagingError::Connection(format!(
                "broker did not confirm subscriptions within {limit:?}"
            ))),
        };

        if let Err(err) = outcome {
            if let Some(failed) = session.take() {
                failed.delivery.abort();
                inner.broker.detach(failed.client).await;
            }
            inner.transition(ChannelState::Disconnected, LifecycleOutcome::Fault);
            return Err(match err {
                MessagingError::Connection(_) => err,
                other => MessagingError::Connection(other.to_string()),
            });
        }
        Ok(())
    }

    async fn establish(&self, slot: &mut Option<Session>) -> Result<()> {
        let inner = &self.inner;
        let BrokerLink { client, events } = inner.broker.attach().await?;
        let delivery = tokio::spawn(deliver(Arc::downgrade(inner), events));
        *slot = Some(Session { client, delivery });

        let topics = inner.subscription_topics();
        let mut states = inner.state.subscribe();
        inner.broker.subscribe(client, &topics).await?;
        let reached = match states.wait_for(|state| *state != ChannelState::Connecting).await {
            Ok(state) => *state,
            Err(_) => return Err(MessagingError::Connection("channel state closed".into())),
        };
        if reached != ChannelState::Connected {
            return Err(MessagingError::Connection(
                "broker dropped the session while connecting".into(),
            ));
        }
        relay_info!(context = inner.log_context(), "connected; subscribed to {topics:?}");
        Ok(())
    }

    /// Unsubscribe everything and wait for the broker to confirm.
    ///
    /// The channel always ends `Disconnected`. When the confirmation does not
    /// arrive within the disconnect timeout the session is torn down anyway and
    /// a [`MessagingError::Connection`] is returned.
    pub async fn disconnect(&self) -> Result<()> {
        let inner = &self.inner;
        let mut session = inner.session.lock().await;
        let mut outcome = Ok(());

        if let Some(active) = session.take() {
            // A session the broker already dropped only needs detaching.
            let live = inner.current_state() == ChannelState::Connected;
            if live && inner.transition(ChannelState::Disconnecting, LifecycleOutcome::Success) {
                let topics = inner.subscription_topics();
                let mut states = inner.state.subscribe();
                outcome = match inner.broker.unsubscribe(active.client, &topics).await {
                    Ok(()) => {
                        let limit = inner.config.disconnect_timeout;
                        let confirmed = tokio::time::timeout(
                            limit,
                            states.wait_for(|state| *state == ChannelState::Disconnected),
                        )
                        .await;
                        match confirmed {
                            Ok(Ok(_)) => Ok(()),
                            _ => Err(MessagingError::Connection(format!(
                                "broker did not confirm teardown within {limit:?}"
                            ))),
                        }
                    }
                    Err(err) => Err(err),
                };
            }
            active.delivery.abort();
            inner.broker.detach(active.client).await;
        }

        if inner.current_state() != ChannelState::Disconnected {
            inner.transition(ChannelState::Disconnected, LifecycleOutcome::Fault);
        }
        inner
            .topics
            .lock()
            .retain(|topic| inner.registry.listener_count(topic) > 0);
        outcome
    }

    /// Publish `value` on `topic` as an async notification.
    ///
    /// Fire-and-forget: the returned uid identifies the envelope, nothing
    /// confirms delivery.
    pub async fn publish(&self, topic: &str, value: JsonValue) -> Result<Uid> {
        self.publish_envelope(topic, AsyncMessage::new(topic, value).into())
            .await
    }

    /// Encode and publish an arbitrary envelope on `topic`.
    pub async fn publish_envelope(&self, topic: &str, envelope: Envelope) -> Result<Uid> {
        let inner = &self.inner;
        let payload: Bytes = inner.codec.encode(&envelope)?;
        log_envelope(MessageDirection::Outbound, &inner.name, topic, &envelope);
        inner.broker.publish(topic, payload).await?;
        if let Some(metrics) = &inner.metrics {
            metrics.observe_published(&envelope);
        }
        Ok(envelope.uid().clone())
    }

    /// Up to `count` most recent envelopes of `topic`, newest first.
    ///
    /// Fails on the first retained payload that does not decode.
    pub async fn history(&self, topic: &str, count: usize) -> Result<Vec<Envelope>> {
        let payloads = self.inner.broker.history(topic, count).await?;
        payloads
            .iter()
            .map(|payload| self.inner.codec.decode(payload).map_err(MessagingError::from))
            .collect()
    }

    /// Register `callback` for notifications on `topic`.
    ///
    /// The topic is subscribed right away when the channel is connected,
    /// otherwise on the next `connect`.
    pub async fn add_listener<F>(&self, topic: impl Into<String>, callback: F) -> Result<ListenerHandle>
    where
        F: Fn(&AsyncMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let topic = topic.into();
        let handle = self.inner.registry.add_listener(topic.clone(), callback);
        if let Err(err) = self.track_topic(&topic).await {
            handle.remove();
            return Err(err);
        }
        Ok(handle)
    }

    /// Register a bounded queue for notifications on `topic`.
    ///
    /// `None` uses the configured queue capacity.
    pub async fn add_queue_listener(
        &self,
        topic: impl Into<String>,
        capacity: Option<usize>,
    ) -> Result<(ListenerHandle, mpsc::Receiver<AsyncMessage>)> {
        let topic = topic.into();
        let capacity = capacity.unwrap_or(self.inner.config.queue_capacity);
        let (handle, queue) = self.inner.registry.add_queue(topic.clone(), capacity);
        if let Err(err) = self.track_topic(&topic).await {
            handle.remove();
            return Err(err);
        }
        Ok((handle, queue))
    }

    async fn track_topic(&self, topic: &str) -> Result<()> {
        let inner = &self.inner;
        if !inner.topics.lock().insert(topic.to_owned()) {
            return Ok(());
        }
        let session = inner.session.lock().await;
        if let Some(active) = session.as_ref() {
            if inner.current_state() == ChannelState::Connected {
                if let Err(err) = inner.broker.subscribe(active.client, &[topic.to_owned()]).await {
                    inner.topics.lock().shift_remove(topic);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Start answering commands with `responder`.
    pub async fn serve(&self, responder: CommandResponder) -> Result<()> {
        let inner = &self.inner;
        *inner.responder.write() = Some(Arc::new(responder));
        let session = inner.session.lock().await;
        if let Some(active) = session.as_ref() {
            if inner.current_state() == ChannelState::Connected {
                let topic = inner.correlator.command_topic.clone();
                inner.broker.subscribe(active.client, &[topic]).await?;
            }
        }
        Ok(())
    }

    /// Subscription snapshot for `topic`, if the channel tracks it.
    pub fn subscription(&self, topic: &str) -> Option<SubscriptionState> {
        let inner = &self.inner;
        let listeners = inner.registry.listener_count(topic);
        let known = listeners > 0
            || inner.config.subscriptions.iter().any(|t| t == topic)
            || inner.topics.lock().contains(topic);
        known.then(|| SubscriptionState {
            topic: topic.to_owned(),
            connected: self.is_connected(),
            listeners,
        })
    }

    /// Snapshots of every tracked subscription.
    pub fn subscriptions(&self) -> Vec<SubscriptionState> {
        let inner = &self.inner;
        let mut topics: IndexSet<String> = inner.config.subscriptions.iter().cloned().collect();
        topics.extend(inner.topics.lock().iter().cloned());
        topics.extend(inner.registry.topics());
        topics
            .iter()
            .filter_map(|topic| self.subscription(topic))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use ChannelState::*;

    #[test]
    fn state_machine_allows_only_lifecycle_edges() {
        let allowed = [
            (Disconnected, Connecting),
            (Connecting, Connected),
            (Connecting, Disconnected),
            (Connected, Disconnecting),
            (Disconnecting, Disconnected),
        ];
        let states = [Disconnected, Connecting, Connected, Disconnecting];
        for from in states {
            for to in states {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[tokio::test]
    async fn rejected_transition_keeps_state() {
        let channel = SubscriptionChannel::builder(Arc::new(InMemoryBroker::default())).build();
        assert!(!channel
            .inner
            .transition(Connected, LifecycleOutcome::Success));
        assert_eq!(channel.state(), Disconnected);
    }

    #[tokio::test]
    async fn subscription_topics_include_reply_and_served_command_topics() {
        let config = ChannelConfig {
            subscriptions: vec!["humidity".into()],
            ..ChannelConfig::default()
        };
        let channel = SubscriptionChannel::builder(Arc::new(InMemoryBroker::default()))
            .config(config)
            .responder(CommandResponder::new())
            .build();
        channel.inner.registry.add_listener("state", |_| Ok(()));

        let topics = channel.inner.subscription_topics();
        assert_eq!(
            topics,
            vec!["humidity", "state", "relay.replies", "relay.commands"]
        );
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        /// Route this thread's events into a buffer until the guard drops.
        fn install() -> (Self, tracing::subscriber::DefaultGuard) {
            let logs = Self::default();
            let writer = logs.clone();
            let subscriber = tracing_subscriber::fmt()
                .with_max_level(tracing::Level::DEBUG)
                .with_ansi(false)
                .with_writer(move || writer.clone())
                .finish();
            (logs, tracing::subscriber::set_default(subscriber))
        }

        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    #[tokio::test]
    async fn disconnect_after_broker_drop_only_detaches() {
        let (logs, _guard) = CapturedLogs::install();

        let broker = InMemoryBroker::default();
        let channel = SubscriptionChannel::builder(Arc::new(broker.clone())).build();
        channel.connect().await.expect("connect");
        let mut states = channel.state_changes();
        broker.disconnect_all("broker restart");
        tokio::time::timeout(
            std::time::Duration::from_secs(2),
            states.wait_for(|state| *state == Disconnected),
        )
        .await
        .expect("dropped in time")
        .expect("channel alive");

        let mut events = channel.events();
        channel.disconnect().await.expect("disconnect");
        assert_eq!(channel.state(), Disconnected);
        assert!(events.try_recv().is_err());
        assert_eq!(broker.client_count(), 0);
        assert!(!logs.text().contains("rejected state transition"), "{}", logs.text());
        assert!(logs.text().contains("broker dropped the session"));
    }

    #[tokio::test]
    async fn unpublishable_reply_is_logged_as_error() {
        let (logs, _guard) = CapturedLogs::install();
        let broker = InMemoryBroker::default();
        let responder = CommandResponder::new().register(
            "ping",
            crate::responder::handler_fn(|_| async { Ok(serde_json::json!("pong")) }),
        );
        let channel = SubscriptionChannel::builder(Arc::new(broker.clone()))
            .responder(responder)
            .build();
        broker.set_fault(crate::broker::BrokerFault::Unreachable);

        let command = Envelope::from(crate::envelope::Command::new("ping"));
        let bytes = channel.codec().encode(&command).expect("encode");
        channel.inner.on_message("relay.commands", &bytes);

        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while !logs.text().contains("failed to publish reply") {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("reply failure logged");
        let line = logs
            .text()
            .lines()
            .find(|line| line.contains("failed to publish reply"))
            .map(str::to_owned)
            .expect("log line");
        assert!(line.contains("ERROR"), "{line}");
        assert!(line.contains("ping"), "{line}");
    }
}
