use std::thread;

use bus_exchange::pubsub::{CompletionMode, Operation};
use bus_exchange::{
    in_memory, in_memory_with, ExchangeConfig, ExchangeError, Message, TopicPhase, TransportError,
};

use crate::support::{exchange_errors, init_tracing, Recorder};

#[test]
fn concurrent_subscribers_share_one_transport_call() {
    init_tracing();
    let stack = in_memory_with(ExchangeConfig::default(), CompletionMode::Manual);
    let results: Recorder<Result<String, ExchangeError>> = Recorder::new();

    let callers: Vec<_> = (0..8)
        .map(|_| {
            let exchange = stack.exchange.clone();
            let sink = results.clone();
            thread::spawn(move || {
                exchange.subscribe("news", |_: &Message| Ok(()), move |result| sink.push(result));
            })
        })
        .collect();
    for caller in callers {
        caller.join().unwrap();
    }

    assert_eq!(stack.subscriber.subscribe_calls("news"), 1);
    assert_eq!(stack.exchange.pubsub().topic_state("news"), TopicPhase::Subscribing);
    assert!(results.is_empty());

    stack.subscriber.complete_all();

    let results = results.items();
    assert_eq!(results.len(), 8);
    assert!(results.iter().all(|r| r == &Ok("news".to_string())));
    assert_eq!(stack.exchange.listener_count("news"), 8);
    assert_eq!(stack.exchange.pubsub().subscribed_topics(), vec!["news".to_string()]);
}

#[test]
fn concurrent_subscribers_all_see_the_same_failure() {
    let stack = in_memory_with(ExchangeConfig::default(), CompletionMode::Manual);
    let errors = exchange_errors(&stack.exchange);
    let results: Recorder<Result<String, ExchangeError>> = Recorder::new();
    for _ in 0..3 {
        let sink = results.clone();
        stack
            .exchange
            .subscribe("news", |_: &Message| Ok(()), move |result| sink.push(result));
    }

    stack
        .subscriber
        .fail_next_pending(TransportError::Disconnected("reset".into()));

    let expected = Err(ExchangeError::Subscribe {
        topic: "news".into(),
        source: TransportError::Disconnected("reset".into()),
    });
    assert_eq!(results.items(), vec![expected.clone(), expected.clone(), expected]);
    assert_eq!(stack.exchange.listener_count("news"), 0);
    assert_eq!(errors.len(), 1);

    // Failure leaves the topic idle, so the next caller retries.
    stack.exchange.subscribe("news", |_: &Message| Ok(()), |_| {});
    assert_eq!(stack.subscriber.subscribe_calls("news"), 2);
}

#[test]
fn different_topics_are_in_flight_together() {
    let stack = in_memory_with(ExchangeConfig::default(), CompletionMode::Manual);
    stack.exchange.subscribe("a", |_: &Message| Ok(()), |_| {});
    stack.exchange.subscribe("b", |_: &Message| Ok(()), |_| {});

    assert_eq!(
        stack.subscriber.pending(),
        vec![
            (Operation::Subscribe, "a".to_string()),
            (Operation::Subscribe, "b".to_string()),
        ]
    );
}

#[test]
fn only_the_last_listener_unsubscribes_the_transport() {
    let stack = in_memory();
    let ids: Vec<_> = (0..3)
        .map(|_| stack.exchange.subscribe("news", |_: &Message| Ok(()), |_| {}))
        .collect();
    let results: Recorder<Result<String, ExchangeError>> = Recorder::new();

    for id in &ids[..2] {
        let sink = results.clone();
        stack
            .exchange
            .unsubscribe("news", *id, move |result| sink.push(result));
    }
    assert_eq!(stack.subscriber.unsubscribe_calls("news"), 0);
    assert!(stack.exchange.pubsub().is_subscribed("news"));

    let sink = results.clone();
    stack
        .exchange
        .unsubscribe("news", ids[2], move |result| sink.push(result));

    assert_eq!(stack.subscriber.unsubscribe_calls("news"), 1);
    assert_eq!(results.len(), 3);
    assert!(!stack.exchange.pubsub().is_subscribed("news"));
    assert!(!stack.subscriber.is_subscribed("news"));
}

#[test]
fn double_unsubscribe_is_a_noop() {
    let stack = in_memory();
    let id = stack.exchange.subscribe("news", |_: &Message| Ok(()), |_| {});
    stack.exchange.unsubscribe("news", id, |_| {});

    let results: Recorder<Result<String, ExchangeError>> = Recorder::new();
    let sink = results.clone();
    stack
        .exchange
        .unsubscribe("news", id, move |result| sink.push(result));

    assert_eq!(results.items(), vec![Ok("news".to_string())]);
    assert_eq!(stack.subscriber.unsubscribe_calls("news"), 1);
}

#[test]
fn subscribe_during_unsubscribe_waits_for_it() {
    let stack = in_memory_with(ExchangeConfig::default(), CompletionMode::Manual);
    let id = stack.exchange.subscribe("news", |_: &Message| Ok(()), |_| {});
    stack.subscriber.complete_all();

    stack.exchange.unsubscribe("news", id, |_| {});
    let results: Recorder<Result<String, ExchangeError>> = Recorder::new();
    let sink = results.clone();
    stack
        .exchange
        .subscribe("news", |_: &Message| Ok(()), move |result| sink.push(result));

    assert_eq!(stack.exchange.pubsub().topic_state("news"), TopicPhase::Unsubscribing);
    assert_eq!(
        stack.subscriber.pending(),
        vec![(Operation::Unsubscribe, "news".to_string())]
    );

    stack.subscriber.complete_next();
    assert_eq!(
        stack.subscriber.pending(),
        vec![(Operation::Subscribe, "news".to_string())]
    );
    stack.subscriber.complete_next();

    assert_eq!(results.items(), vec![Ok("news".to_string())]);
    assert_eq!(stack.subscriber.subscribe_calls("news"), 2);
    assert!(stack.subscriber.is_subscribed("news"));
    assert_eq!(stack.exchange.listener_count("news"), 1);
}

#[test]
fn failed_unsubscribe_keeps_the_subscription() {
    let stack = in_memory();
    let errors = exchange_errors(&stack.exchange);
    let id = stack.exchange.subscribe("news", |_: &Message| Ok(()), |_| {});
    stack
        .subscriber
        .fail_next_unsubscribe("news", TransportError::Rejected("busy".into()));

    let results: Recorder<Result<String, ExchangeError>> = Recorder::new();
    let sink = results.clone();
    stack
        .exchange
        .unsubscribe("news", id, move |result| sink.push(result));

    assert!(matches!(
        results.items()[0],
        Err(ExchangeError::Unsubscribe { .. })
    ));
    assert_eq!(errors.len(), 1);
    assert_eq!(stack.exchange.pubsub().topic_state("news"), TopicPhase::Subscribed);
}

#[test]
fn resubscribe_behind_a_parked_unsubscribe_ends_subscribed() {
    let stack = in_memory_with(ExchangeConfig::default(), CompletionMode::Manual);
    let pubsub = stack.exchange.pubsub();
    let results: Recorder<(&'static str, bool)> = Recorder::new();
    for (name, subscribe) in [("sub1", true), ("unsub", false), ("sub2", true)] {
        let sink = results.clone();
        let done = move |result: Result<String, ExchangeError>| sink.push((name, result.is_ok()));
        if subscribe {
            pubsub.subscribe("news", done);
        } else {
            pubsub.unsubscribe("news", done);
        }
    }

    assert_eq!(stack.subscriber.complete_all(), 3);

    assert_eq!(
        results.items(),
        vec![("sub1", true), ("unsub", true), ("sub2", true)]
    );
    assert_eq!(pubsub.topic_state("news"), TopicPhase::Subscribed);
    assert!(stack.subscriber.is_subscribed("news"));
}

#[test]
fn listener_added_after_a_cancelled_subscribe_hears_the_topic() {
    let stack = in_memory_with(ExchangeConfig::default(), CompletionMode::Manual);
    let peer = stack.peer(ExchangeConfig::default(), CompletionMode::Immediate);
    let received: Recorder<String> = Recorder::new();

    let first = stack.exchange.subscribe("news", |_: &Message| Ok(()), |_| {});
    stack.exchange.unsubscribe("news", first, |_| {});
    let sink = received.clone();
    stack.exchange.subscribe(
        "news",
        move |message: &Message| {
            sink.push(message.id.clone());
            Ok(())
        },
        |result| assert!(result.is_ok()),
    );
    stack.subscriber.complete_all();

    peer.exchange
        .publish_to(&Message::with_id("m-1", "say"), "news");

    assert_eq!(received.items(), vec!["m-1"]);
    assert_eq!(stack.exchange.listener_count("news"), 1);
    assert_eq!(stack.subscriber.subscribe_calls("news"), 2);
}

#[test]
fn unsubscribe_before_the_subscribe_settles_cancels_it() {
    let stack = in_memory_with(ExchangeConfig::default(), CompletionMode::Manual);
    let results: Recorder<Result<String, ExchangeError>> = Recorder::new();
    let sink = results.clone();
    let id = stack
        .exchange
        .subscribe("news", |_: &Message| Ok(()), move |result| sink.push(result));

    stack.exchange.unsubscribe("news", id, |_| {});
    stack.subscriber.complete_all();

    assert_eq!(results.items(), vec![Ok("news".to_string())]);
    assert_eq!(stack.exchange.listener_count("news"), 0);
    assert!(stack.exchange.topics().is_empty());
    assert_eq!(stack.exchange.pubsub().topic_state("news"), TopicPhase::Idle);
    assert!(!stack.subscriber.is_subscribed("news"));
}

#[test]
fn cancelling_one_pending_subscribe_keeps_the_others() {
    let stack = in_memory_with(ExchangeConfig::default(), CompletionMode::Manual);
    let first = stack.exchange.subscribe("news", |_: &Message| Ok(()), |_| {});
    stack.exchange.subscribe("news", |_: &Message| Ok(()), |_| {});

    stack.exchange.unsubscribe("news", first, |result| assert!(result.is_ok()));
    stack.subscriber.complete_all();

    assert_eq!(stack.subscriber.unsubscribe_calls("news"), 0);
    assert_eq!(stack.exchange.listener_count("news"), 1);
    assert_eq!(stack.exchange.topics(), vec!["news".to_string()]);
    assert!(stack.subscriber.is_subscribed("news"));
}
