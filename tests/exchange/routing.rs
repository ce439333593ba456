use bus_exchange::message::codec;
use bus_exchange::pubsub::CompletionMode;
use bus_exchange::{
    in_memory, in_memory_with, AckPolicy, Exchange, ExchangeConfig, ExchangeError, HandlerError,
    HandlerRegistry, Message,
};
use serde_json::json;

use crate::support::{channel_inbox, exchange_errors, init_tracing, published_ids, Recorder};

/// Handler that forwards every `chat.say` to the room named in its content.
fn room_router() -> HandlerRegistry {
    let registry = HandlerRegistry::new();
    registry.on("chat.say", |mut message: Message, exchange: &Exchange| {
        let room = message.content["room"]
            .as_str()
            .ok_or_else(|| HandlerError::Rejected("no room".into()))?
            .to_string();
        message.set_target(room);
        exchange.publish(&mut message);
        Ok(())
    });
    registry
}

#[test]
fn unpublished_goes_to_queue_then_published_goes_to_target() {
    init_tracing();
    let stack = in_memory();
    stack.jobs.pause();
    let mut message = Message::with_id("m-1", "chat.say").with_target("lobby");

    stack.exchange.publish(&mut message);

    assert!(message.is_published());
    assert_eq!(stack.jobs.pending_len("message"), 1);
    let queued: Message = serde_json::from_str(&stack.jobs.payloads()[0]).unwrap();
    assert!(queued.is_published());
    assert!(stack.broker.published().is_empty());

    // Same message again: already ingested, so it goes to its target.
    stack.exchange.publish(&mut message);

    assert_eq!(stack.jobs.jobs().len(), 1);
    assert_eq!(published_ids(&stack.broker, "lobby"), vec!["m-1"]);
}

#[test]
fn handler_fans_out_to_a_channel_in_another_process() {
    init_tracing();
    let producer = in_memory();
    producer.exchange.set_handler(room_router());
    let consumer = producer.peer(ExchangeConfig::default(), CompletionMode::Immediate);

    let room = consumer.exchange.channel("lobby");
    let inbox = channel_inbox(&room);
    room.subscribe(|result| assert!(result.is_ok()));

    producer.exchange.publish(
        &mut Message::with_id("m-1", "chat.say").with_content(json!({ "room": "lobby" })),
    );

    assert_eq!(inbox.items(), vec!["m-1"]);
    assert_eq!(producer.jobs.completed_ids(), vec![1]);
    // Only the consumer side subscribed at the transport.
    assert!(producer.subscriber.subscriptions().is_empty());
    assert_eq!(consumer.subscriber.subscriptions(), vec!["lobby".to_string()]);
}

#[test]
fn payload_survives_the_transport() {
    let producer = in_memory();
    let consumer = producer.peer(ExchangeConfig::default(), CompletionMode::Immediate);
    let received = Recorder::new();
    let sink = received.clone();
    consumer.exchange.subscribe(
        "data",
        move |message: &Message| {
            sink.push(message.clone());
            Ok(())
        },
        |_| {},
    );

    let sent = Message::with_id("m-1", "data.put").with_content(json!({ "a": 1, "b": "x" }));
    producer.exchange.publish_to(&sent, "data");

    let (_, raw) = producer.broker.published()[0].clone();
    assert!(raw.starts_with("%7B"));
    let decoded: Message = codec::decode(&raw).unwrap();
    assert_eq!(decoded, sent);
    assert_eq!(received.items(), vec![sent]);
}

#[test]
fn prefix_namespaces_transport_topics() {
    let config = ExchangeConfig::from_json_str(r#"{ "pubsub": { "prefix": "app:" } }"#).unwrap();
    let producer = in_memory_with(config.clone(), CompletionMode::Immediate);
    let consumer = producer.peer(config, CompletionMode::Immediate);
    let room = consumer.exchange.channel("lobby");
    let inbox = channel_inbox(&room);
    room.subscribe(|_| {});

    producer
        .exchange
        .publish_to(&Message::with_id("m-1", "chat.say"), "lobby");

    assert_eq!(published_ids(&producer.broker, "app:lobby"), vec!["m-1"]);
    assert_eq!(inbox.items(), vec!["m-1"]);
    assert!(consumer.subscriber.is_subscribed("app:lobby"));
}

#[test]
fn failed_handler_is_reported_and_acked_by_default() {
    let stack = in_memory();
    let errors = exchange_errors(&stack.exchange);
    stack.exchange.set_handler(room_router());

    stack.exchange.publish(&mut Message::with_id("m-1", "chat.say"));

    assert_eq!(
        errors.items(),
        vec![ExchangeError::Handler {
            action: "chat.say".into(),
            source: HandlerError::Rejected("no room".into()),
        }]
    );
    assert_eq!(stack.jobs.completed_ids(), vec![1]);
    assert!(stack.jobs.failed().is_empty());
}

#[test]
fn failed_handler_is_retried_when_acking_on_success() {
    let config = ExchangeConfig::from_json_str(r#"{ "queue": { "ack": "on_success" } }"#).unwrap();
    assert_eq!(config.queue.ack, AckPolicy::OnSuccess);
    let stack = in_memory_with(config, CompletionMode::Immediate);
    let errors = exchange_errors(&stack.exchange);
    stack.exchange.set_handler(room_router());

    stack.exchange.publish(&mut Message::with_id("m-1", "chat.say"));

    // Default in-memory queue gives up after three attempts.
    assert_eq!(errors.len(), 3);
    assert_eq!(stack.jobs.failed().len(), 1);
    assert!(stack.jobs.completed_ids().is_empty());
}

#[test]
fn malformed_transport_payload_is_dropped() {
    let stack = in_memory();
    let errors = exchange_errors(&stack.exchange);
    let room = stack.exchange.channel("lobby");
    let inbox = channel_inbox(&room);
    room.subscribe(|_| {});

    stack.subscriber.inject("lobby", "not%20json");
    stack
        .exchange
        .publish_to(&Message::with_id("m-2", "chat.say"), "lobby");

    assert!(matches!(errors.items()[0], ExchangeError::Codec(_)));
    assert_eq!(inbox.items(), vec!["m-2"]);
}
