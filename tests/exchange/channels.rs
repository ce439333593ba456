use bus_exchange::pubsub::CompletionMode;
use bus_exchange::{
    in_memory, in_memory_with, Channel, ChannelConfig, ExchangeConfig, ExchangeError, Message,
    TeardownPolicy, TransportError,
};

use crate::support::{channel_errors, channel_inbox, init_tracing, published_ids, Recorder};

#[test]
fn publish_before_handshake_subscribes_once_and_fires_after() {
    init_tracing();
    let stack = in_memory_with(ExchangeConfig::default(), CompletionMode::Manual);
    let channel = Channel::new("t1", &stack.exchange);

    channel.publish(Message::with_id("1", "say")).unwrap();
    assert_eq!(stack.subscriber.subscribe_calls("t1"), 1);
    assert!(published_ids(&stack.broker, "t1").is_empty());

    // Second publish before the handshake resolves.
    channel.publish(Message::with_id("2", "say")).unwrap();
    assert_eq!(stack.subscriber.subscribe_calls("t1"), 1);
    assert_eq!(channel.pending_len(), 2);

    assert!(stack.subscriber.complete_next());

    assert_eq!(published_ids(&stack.broker, "t1"), vec!["1", "2"]);
    assert_eq!(stack.subscriber.subscribe_calls("t1"), 1);
    assert!(channel.is_subscribed());

    channel.publish(Message::with_id("3", "say")).unwrap();
    assert_eq!(published_ids(&stack.broker, "t1"), vec!["1", "2", "3"]);
}

#[test]
fn second_channel_on_a_topic_costs_no_transport_call() {
    let stack = in_memory();
    let first = Channel::new("t2", &stack.exchange);
    let second = Channel::new("t2", &stack.exchange);

    first.subscribe(|result| assert!(result.is_ok()));
    assert_eq!(stack.subscriber.subscribe_calls("t2"), 1);

    second.subscribe(|result| assert!(result.is_ok()));
    assert_eq!(stack.subscriber.subscribe_calls("t2"), 1);
    assert!(second.is_subscribed());
}

#[test]
fn every_channel_on_a_topic_receives_its_messages() {
    let stack = in_memory();
    let first = Channel::new("t2", &stack.exchange);
    let second = Channel::new("t2", &stack.exchange);
    let first_inbox = channel_inbox(&first);
    let second_inbox = channel_inbox(&second);

    first.publish(Message::with_id("1", "say")).unwrap();
    second.publish(Message::with_id("2", "say")).unwrap();

    assert_eq!(first_inbox.items(), vec!["1", "2"]);
    assert_eq!(second_inbox.items(), vec!["1", "2"]);
}

#[test]
fn failed_handshake_is_reported_and_pending_publishes_survive() {
    let stack = in_memory_with(ExchangeConfig::default(), CompletionMode::Manual);
    let channel = Channel::new("t1", &stack.exchange);
    let errors = channel_errors(&channel);

    channel.publish(Message::with_id("1", "say")).unwrap();
    channel.publish(Message::with_id("2", "say")).unwrap();
    stack
        .subscriber
        .fail_next_pending(TransportError::Disconnected("reset".into()));

    let errors = errors.items();
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        &errors[0],
        ExchangeError::HandshakeFailed { topic, pending: 2, source }
            if topic == "t1" && matches!(**source, ExchangeError::Subscribe { .. })
    ));
    assert!(!channel.is_subscribed());
    assert_eq!(channel.pending_len(), 2);

    // The next publish retries the handshake and flushes everything in order.
    channel.publish(Message::with_id("3", "say")).unwrap();
    assert_eq!(stack.subscriber.subscribe_calls("t1"), 2);
    stack.subscriber.complete_next();

    assert_eq!(published_ids(&stack.broker, "t1"), vec!["1", "2", "3"]);
}

#[test]
fn subscribe_waiters_share_the_handshake() {
    let stack = in_memory_with(ExchangeConfig::default(), CompletionMode::Manual);
    let channel = Channel::new("t1", &stack.exchange);
    let results: Recorder<Result<(), ExchangeError>> = Recorder::new();

    for _ in 0..2 {
        let sink = results.clone();
        channel.subscribe(move |result| sink.push(result));
    }
    channel.publish(Message::with_id("1", "say")).unwrap();
    assert_eq!(stack.subscriber.subscribe_calls("t1"), 1);

    stack.subscriber.complete_all();

    assert_eq!(results.items(), vec![Ok(()), Ok(())]);
    assert_eq!(published_ids(&stack.broker, "t1"), vec!["1"]);
}

#[test]
fn removing_the_last_listener_tears_the_channel_down() {
    let stack = in_memory();
    let channel = stack.exchange.channel("room");
    let a = channel.on_message(|_| {});
    let b = channel.on_message(|_| {});
    channel.publish(Message::with_id("1", "say")).unwrap();

    channel.remove_listener(a);
    assert_eq!(stack.subscriber.unsubscribe_calls("room"), 0);
    assert!(!channel.is_closed());

    channel.remove_listener(b);
    assert_eq!(stack.subscriber.unsubscribe_calls("room"), 1);
    assert!(channel.is_closed());
    assert!(channel.exchange().is_none());
    assert!(stack.exchange.channel_topics().is_empty());

    // The registry hands out a fresh channel afterwards.
    let fresh = stack.exchange.channel("room");
    assert!(!fresh.same_as(&channel));
    assert!(!fresh.is_closed());
}

#[test]
fn teardown_keeps_the_topic_while_another_channel_uses_it() {
    let stack = in_memory();
    let first = Channel::new("room", &stack.exchange);
    let second = Channel::new("room", &stack.exchange);
    let inbox = channel_inbox(&second);
    first.subscribe(|_| {});
    second.subscribe(|_| {});

    first.close(|result| assert!(result.is_ok()));

    assert_eq!(stack.subscriber.unsubscribe_calls("room"), 0);
    assert!(stack.subscriber.is_subscribed("room"));
    second.publish(Message::with_id("1", "say")).unwrap();
    assert_eq!(inbox.items(), vec!["1"]);
}

#[test]
fn publishing_on_a_closed_channel_fails() {
    let stack = in_memory();
    let channel = Channel::new("room", &stack.exchange);
    let errors = channel_errors(&channel);
    channel.close(|_| {});

    let result = channel.publish(Message::with_id("1", "say"));

    let closed = ExchangeError::ChannelClosed {
        topic: "room".into(),
    };
    assert_eq!(result.err(), Some(closed.clone()));
    assert_eq!(errors.items(), vec![closed]);
    assert!(published_ids(&stack.broker, "room").is_empty());
}

#[test]
fn teardown_policy_decides_what_a_failed_unsubscribe_leaves_behind() {
    for (policy, closed) in [
        (TeardownPolicy::ReleaseAlways, true),
        (TeardownPolicy::RetainOnFailure, false),
    ] {
        let mut config = ExchangeConfig::default();
        config.channel = ChannelConfig::default().with_teardown(policy);
        let stack = in_memory_with(config, CompletionMode::Immediate);
        let channel = stack.exchange.channel("room");
        let errors = channel_errors(&channel);
        channel.subscribe(|_| {});
        stack
            .subscriber
            .fail_next_unsubscribe("room", TransportError::Rejected("busy".into()));

        channel.close(|result| assert!(result.is_err()));

        assert_eq!(channel.is_closed(), closed, "{policy:?}");
        assert_eq!(errors.len(), 1, "{policy:?}");
        assert_eq!(stack.exchange.channel_topics().is_empty(), closed, "{policy:?}");
    }
}
