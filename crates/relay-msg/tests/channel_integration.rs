//! ---
//! relay_section: "02-messaging"
//! relay_subsection: "tests"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "End-to-end channel, listener and command/reply scenarios."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use prometheus::Registry;
use relay_common::ChannelConfig;
use relay_msg::{
    handler_fn, AsyncMessage, Broker, BrokerEvent, BrokerFault, ChannelEvent, ChannelState,
    Command, CommandReply, CommandRequest, CommandResponder, Envelope, ErrorMessage,
    InMemoryBroker, MessagingError, MessagingMetricsExporter, SubscriptionChannel,
};
use serde_json::json;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

fn fast_config(name: &str) -> ChannelConfig {
    ChannelConfig {
        name: name.to_owned(),
        connect_timeout: Duration::from_millis(200),
        disconnect_timeout: Duration::from_millis(200),
        ..ChannelConfig::default()
    }
}

fn channel(broker: &InMemoryBroker, name: &str) -> SubscriptionChannel {
    SubscriptionChannel::builder(Arc::new(broker.clone()))
        .config(fast_config(name))
        .build()
}

fn server(broker: &InMemoryBroker) -> SubscriptionChannel {
    let responder = CommandResponder::new()
        .register("ping", handler_fn(|_| async { Ok(json!("pong")) }))
        .register(
            "echo",
            handler_fn(|command: Command| async move {
                let n = command.args.first().and_then(|v| v.as_u64()).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(3 * (10 - n.min(10)))).await;
                Ok(json!(command.args))
            }),
        )
        .register(
            "calibrate",
            handler_fn(|_| async { Err::<serde_json::Value, _>(anyhow::anyhow!("sensor offline")) }),
        );
    SubscriptionChannel::builder(Arc::new(broker.clone()))
        .config(fast_config("server"))
        .responder(responder)
        .build()
}

async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

async fn wait_for_state(channel: &SubscriptionChannel, wanted: ChannelState) {
    let mut states = channel.state_changes();
    timeout(WAIT, states.wait_for(|state| *state == wanted))
        .await
        .expect("state reached in time")
        .expect("channel alive");
}

fn counter_value(registry: &Registry, name: &str) -> f64 {
    registry
        .gather()
        .iter()
        .find(|family| family.get_name() == name)
        .map(|family| family.get_metric()[0].get_counter().get_value())
        .unwrap_or_default()
}

#[tokio::test]
async fn connect_is_idempotent_and_reports_lifecycle() {
    let broker = InMemoryBroker::default();
    let channel = channel(&broker, "device-state");
    let mut events = channel.events();

    channel.connect().await.expect("connect");
    channel.connect().await.expect("second connect is a no-op");
    assert_eq!(channel.state(), ChannelState::Connected);
    assert_eq!(broker.client_count(), 1);

    assert_eq!(
        events.recv().await.expect("event"),
        ChannelEvent::StateChanged {
            from: ChannelState::Disconnected,
            to: ChannelState::Connecting
        }
    );
    assert_eq!(
        events.recv().await.expect("event"),
        ChannelEvent::StateChanged {
            from: ChannelState::Connecting,
            to: ChannelState::Connected
        }
    );
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn unconfirmed_subscriptions_fail_connect_after_timeout() {
    let broker = InMemoryBroker::default();
    broker.set_fault(BrokerFault::SilentSubscribe);
    let channel = channel(&broker, "device-state");

    let err = channel.connect().await.expect_err("no confirmation");
    assert!(err.is_connection(), "unexpected error {err}");
    assert_eq!(channel.state(), ChannelState::Disconnected);
    assert_eq!(broker.client_count(), 0);

    broker.set_fault(BrokerFault::None);
    channel.connect().await.expect("connect after recovery");
}

#[tokio::test]
async fn unreachable_broker_fails_connect_and_publish() {
    let broker = InMemoryBroker::default();
    broker.set_fault(BrokerFault::Unreachable);
    let channel = channel(&broker, "device-state");

    let err = channel.connect().await.expect_err("unreachable");
    assert!(err.is_connection());
    assert_eq!(channel.state(), ChannelState::Disconnected);

    let err = channel.publish("humidity", json!(1)).await.expect_err("unreachable");
    assert!(err.is_connection());
}

#[tokio::test]
async fn disconnect_walks_the_state_machine_once() {
    let broker = InMemoryBroker::default();
    let channel = channel(&broker, "device-state");
    channel.connect().await.expect("connect");
    let mut events = channel.events();

    channel.disconnect().await.expect("disconnect");
    channel.disconnect().await.expect("second disconnect is a no-op");
    assert_eq!(channel.state(), ChannelState::Disconnected);
    assert_eq!(broker.client_count(), 0);

    let transitions: Vec<ChannelEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    assert_eq!(
        transitions,
        vec![
            ChannelEvent::StateChanged {
                from: ChannelState::Connected,
                to: ChannelState::Disconnecting
            },
            ChannelEvent::StateChanged {
                from: ChannelState::Disconnecting,
                to: ChannelState::Disconnected
            },
        ]
    );
}

#[tokio::test]
async fn notifications_arrive_in_publish_order() {
    let broker = InMemoryBroker::default();
    let subscriber = channel(&broker, "device-state");
    let publisher = channel(&broker, "sensor");
    let (_handle, mut queue) = subscriber
        .add_queue_listener("humidity", None)
        .await
        .expect("queue listener");
    subscriber.connect().await.expect("connect");

    let first = publisher.publish("humidity", json!(58.9)).await.expect("publish");
    for value in 1..5 {
        publisher.publish("humidity", json!(value)).await.expect("publish");
    }

    let received: AsyncMessage = timeout(WAIT, queue.recv()).await.expect("in time").expect("message");
    assert_eq!(received.topic, "humidity");
    assert_eq!(received.value, json!(58.9));
    assert_eq!(received.uid(), &first);
    for value in 1..5 {
        let next = timeout(WAIT, queue.recv()).await.expect("in time").expect("message");
        assert_eq!(next.value, json!(value));
    }
}

#[tokio::test]
async fn history_is_newest_first_and_surfaces_decode_errors() {
    let broker = InMemoryBroker::default();
    let channel = channel(&broker, "device-state");
    for value in [1, 2, 3] {
        channel.publish("state", json!(value)).await.expect("publish");
    }

    let history = channel.history("state", 2).await.expect("history");
    let values: Vec<_> = history
        .iter()
        .map(|envelope| match envelope {
            Envelope::Async(message) => message.value.clone(),
            other => panic!("unexpected variant {}", other.kind()),
        })
        .collect();
    assert_eq!(values, vec![json!(3), json!(2)]);

    broker
        .publish("state", Bytes::from_static(b"not an envelope"))
        .await
        .expect("raw publish");
    let err = channel.history("state", 2).await.expect_err("corrupt entry");
    assert!(matches!(err, MessagingError::Decode(_)));
}

#[tokio::test]
async fn send_and_wait_returns_matching_reply() {
    let broker = InMemoryBroker::default();
    let server = server(&broker);
    server.connect().await.expect("server connect");
    let client = channel(&broker, "client");
    client.connect().await.expect("client connect");

    let correlator = client.correlator();
    let reply = correlator
        .send_and_wait(CommandRequest::new("ping"))
        .await
        .expect("reply");
    assert_eq!(reply.name, "ping");
    assert_eq!(reply.result, json!("pong"));
    assert_eq!(reply.uid().as_str().len(), 32);
    assert!(reply.started_at.is_some() && reply.ended_at.is_some());
    assert_eq!(correlator.pending_count(), 0);
}

#[tokio::test]
async fn remote_failure_is_surfaced() {
    let broker = InMemoryBroker::default();
    let server = server(&broker);
    server.connect().await.expect("server connect");
    let client = channel(&broker, "client");
    client.connect().await.expect("client connect");

    let err = client
        .correlator()
        .send_and_wait(CommandRequest::new("calibrate").arg(3))
        .await
        .expect_err("remote failure");
    match err {
        MessagingError::Remote { command, message, .. } => {
            assert_eq!(command, "calibrate");
            assert_eq!(message, "sensor offline");
        }
        other => panic!("unexpected error {other}"),
    }

    let err = client
        .correlator()
        .send_and_wait(CommandRequest::new("reboot"))
        .await
        .expect_err("unknown command");
    assert!(matches!(err, MessagingError::Remote { message, .. } if message == "unknown command: reboot"));
}

#[tokio::test]
async fn timeout_releases_slot_and_late_reply_is_discarded() {
    let broker = InMemoryBroker::default();
    let metrics_registry = Registry::new();
    let metrics = MessagingMetricsExporter::register(&metrics_registry).expect("metrics");
    let client = SubscriptionChannel::builder(Arc::new(broker.clone()))
        .config(fast_config("client"))
        .metrics(metrics)
        .build();
    client.connect().await.expect("connect");
    let correlator = client.correlator();

    let err = correlator
        .send_and_wait(CommandRequest::new("ping").with_timeout(Duration::from_millis(50)))
        .await
        .expect_err("nobody answers");
    let uid = match err {
        MessagingError::Timeout { uid, after } => {
            assert_eq!(after, Duration::from_millis(50));
            uid
        }
        other => panic!("unexpected error {other}"),
    };
    assert_eq!(correlator.pending_count(), 0);
    assert_eq!(counter_value(&metrics_registry, "relay_command_timeouts_total"), 1.0);

    let late = CommandReply::from_command(&Command::with_uid(uid, "ping")).with_result(json!("pong"));
    channel(&broker, "late-responder")
        .publish_envelope("relay.replies", late.into())
        .await
        .expect("publish late reply");
    eventually(|| counter_value(&metrics_registry, "relay_unmatched_replies_total") == 1.0).await;
}

#[tokio::test]
async fn concurrent_commands_receive_their_own_replies() {
    let broker = InMemoryBroker::default();
    let server = server(&broker);
    server.connect().await.expect("server connect");
    let client = channel(&broker, "client");
    client.connect().await.expect("client connect");

    let waiters: Vec<_> = (0..10u64)
        .map(|n| {
            let correlator = client.correlator();
            tokio::spawn(async move {
                correlator
                    .send_and_wait(CommandRequest::new("echo").arg(n))
                    .await
                    .map(|reply| (n, reply))
            })
        })
        .collect();

    for waiter in waiters {
        let (n, reply) = waiter.await.expect("task").expect("reply");
        assert_eq!(reply.result, json!([n]));
    }
    assert_eq!(client.correlator().pending_count(), 0);
}

#[tokio::test]
async fn cancellation_releases_the_slot() {
    let broker = InMemoryBroker::default();
    let client = channel(&broker, "client");
    client.connect().await.expect("connect");
    let correlator = client.correlator();

    let err = correlator
        .send_and_wait_cancellable(
            CommandRequest::new("ping").with_timeout(Duration::from_secs(30)),
            tokio::time::sleep(Duration::from_millis(20)),
        )
        .await
        .expect_err("cancelled");
    assert!(matches!(err, MessagingError::Cancelled { .. }));
    assert_eq!(correlator.pending_count(), 0);

    let dropped = timeout(
        Duration::from_millis(20),
        correlator.send_and_wait(CommandRequest::new("ping")),
    )
    .await;
    assert!(dropped.is_err());
    assert_eq!(correlator.pending_count(), 0);
}

#[tokio::test]
async fn error_envelope_fails_the_matching_waiter() {
    let broker = InMemoryBroker::default();
    let client = channel(&broker, "client");
    client.connect().await.expect("connect");

    let mut rejecter = broker.attach().await.expect("attach");
    broker
        .subscribe(rejecter.client, &["relay.commands".to_owned()])
        .await
        .expect("subscribe");
    let rejecting = {
        let broker = broker.clone();
        tokio::spawn(async move {
            while let Some(event) = rejecter.events.recv().await {
                if let BrokerEvent::Message { payload, .. } = event {
                    let command = relay_msg::decode(&payload).expect("command");
                    let report = ErrorMessage::with_uid(command.uid().clone(), "rejected");
                    let bytes = relay_msg::encode(&report.into()).expect("encode");
                    broker.publish("relay.replies", bytes).await.expect("publish");
                    return;
                }
            }
        })
    };

    let err = client
        .correlator()
        .send_and_wait(CommandRequest::new("move"))
        .await
        .expect_err("rejected");
    match err {
        MessagingError::Remote { command, message, .. } => {
            assert_eq!(command, "move");
            assert_eq!(message, "rejected");
        }
        other => panic!("unexpected error {other}"),
    }
    rejecting.await.expect("rejecter task");
}

#[tokio::test]
async fn removed_listener_stops_receiving_and_topic_is_pruned_on_disconnect() {
    let broker = InMemoryBroker::default();
    let channel = channel(&broker, "device-state");
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&hits);
    let counted = channel
        .add_listener("humidity", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .expect("listener");
    let (tap, mut queue) = channel
        .add_queue_listener("humidity", Some(8))
        .await
        .expect("queue listener");
    channel.connect().await.expect("connect");

    channel.publish("humidity", json!(1)).await.expect("publish");
    timeout(WAIT, queue.recv()).await.expect("in time").expect("message");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    assert!(counted.remove());
    assert!(!counted.remove());
    channel.publish("humidity", json!(2)).await.expect("publish");
    timeout(WAIT, queue.recv()).await.expect("in time").expect("message");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    assert!(tap.remove());
    let state = channel.subscription("humidity").expect("still subscribed");
    assert_eq!(state.listeners, 0);
    assert!(state.connected);

    channel.disconnect().await.expect("disconnect");
    assert!(channel.subscription("humidity").is_none());
}

#[tokio::test]
async fn channels_on_one_broker_dispatch_each_listener_once() {
    let broker = InMemoryBroker::default();
    let first = channel(&broker, "first");
    let second = channel(&broker, "second");
    let mut counters = Vec::new();
    let mut queues = Vec::new();
    for channel in [&first, &second] {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        channel
            .add_listener("x", move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .expect("listener");
        let (_handle, queue) = channel.add_queue_listener("x", None).await.expect("queue");
        counters.push(hits);
        queues.push(queue);
        channel.connect().await.expect("connect");
    }
    assert_eq!(broker.subscriber_count("x"), 2);

    first.publish("x", json!("once")).await.expect("publish");
    for queue in &mut queues {
        let message = timeout(WAIT, queue.recv()).await.expect("in time").expect("message");
        assert_eq!(message.value, json!("once"));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    for (hits, queue) in counters.iter().zip(&mut queues) {
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(queue.try_recv().is_err());
    }
}

#[tokio::test]
async fn listener_added_while_connected_is_subscribed() {
    let broker = InMemoryBroker::default();
    let channel = channel(&broker, "device-state");
    channel.connect().await.expect("connect");
    assert_eq!(broker.subscriber_count("late"), 0);

    let (_handle, mut queue) = channel.add_queue_listener("late", None).await.expect("queue");
    assert_eq!(broker.subscriber_count("late"), 1);
    let state = channel.subscription("late").expect("tracked");
    assert_eq!(state.listeners, 1);

    channel.publish("late", json!(7)).await.expect("publish");
    let message = timeout(WAIT, queue.recv()).await.expect("in time").expect("message");
    assert_eq!(message.value, json!(7));
}

#[tokio::test]
async fn failing_listener_does_not_starve_the_others() {
    let broker = InMemoryBroker::default();
    let channel = channel(&broker, "device-state");
    channel
        .add_listener("x", |_| anyhow::bail!("listener refused"))
        .await
        .expect("failing listener");
    channel
        .add_listener("x", |_| panic!("listener exploded"))
        .await
        .expect("panicking listener");
    let (_handle, mut queue) = channel.add_queue_listener("x", None).await.expect("queue");
    channel.connect().await.expect("connect");

    channel.publish("x", json!("first")).await.expect("publish");
    channel.publish("x", json!("second")).await.expect("publish");
    for expected in ["first", "second"] {
        let message = timeout(WAIT, queue.recv()).await.expect("in time").expect("message");
        assert_eq!(message.value, json!(expected));
    }
}

#[tokio::test]
async fn broker_drop_disconnects_and_caller_may_reconnect() {
    let broker = InMemoryBroker::default();
    let channel = channel(&broker, "device-state");
    channel.connect().await.expect("connect");

    broker.disconnect_all("broker restart");
    wait_for_state(&channel, ChannelState::Disconnected).await;

    channel.connect().await.expect("reconnect");
    assert!(channel.is_connected());
    assert_eq!(broker.client_count(), 1);
}
