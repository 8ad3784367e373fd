use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use aiko::bus::LoopbackBroker;
use aiko::clock::ManualClock;
use aiko::config::RuntimeConfig;
use aiko::ec::{
    ChangeKind, Consumer, ConsumerOptions, ConsumerState, Filter, Producer, Share, Value,
};
use aiko::{Error, Runtime};

/// A producer runtime and a consumer runtime on one loopback broker, both
/// driven by hand on a shared manual clock.
struct Network {
    broker: LoopbackBroker,
    clock: ManualClock,
    producer_rt: Runtime,
    consumer_rt: Runtime,
}

impl Network {
    fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let broker = LoopbackBroker::new();
        let clock = ManualClock::new();
        let producer_rt =
            Runtime::with_clock(RuntimeConfig::default(), &broker, Arc::new(clock.clone()))
                .expect("producer runtime");
        let consumer_rt =
            Runtime::with_clock(RuntimeConfig::default(), &broker, Arc::new(clock.clone()))
                .expect("consumer runtime");
        Self {
            broker,
            clock,
            producer_rt,
            consumer_rt,
        }
    }

    fn settle(&self) {
        for _ in 0..4 {
            self.consumer_rt.scheduler().run_once();
            self.producer_rt.scheduler().run_once();
        }
    }

    fn advance(&self, by: Duration) {
        self.clock.advance(by);
        self.settle();
    }

    fn producer(&self, share: Share) -> Producer {
        Producer::new(&self.producer_rt, "svc", share).expect("producer")
    }

    fn consumer(&self, name: &str, filter: Filter) -> (Consumer, Rc<RefCell<Vec<String>>>) {
        let consumer = Consumer::new(
            &self.consumer_rt,
            name,
            "svc",
            ConsumerOptions::default().filter(filter).lease_seconds(5),
        )
        .expect("consumer");
        let events = Rc::new(RefCell::new(Vec::new()));
        {
            let events = Rc::clone(&events);
            consumer.add_handler(move |kind: ChangeKind, path: &str, value: Option<&Value>| {
                let value = value
                    .and_then(Value::as_scalar)
                    .map(|scalar| format!(" {scalar}"))
                    .unwrap_or_default();
                events.borrow_mut().push(format!("{kind} {path}{value}"));
            });
        }
        (consumer, events)
    }

    fn wiretap(&self, topic: &str) -> Rc<RefCell<Vec<String>>> {
        let wire = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&wire);
        self.consumer_rt
            .add_message_handler(topic, move |_: &str, payload: &str| {
                sink.borrow_mut().push(payload.to_string())
            })
            .expect("wiretap");
        wire
    }
}

fn share_of(pairs: &[(&str, Value)]) -> Share {
    let mut share = Share::new();
    for (path, value) in pairs {
        share.update(path, value.clone()).expect("seed share");
    }
    share
}

#[test]
fn lifecycle_scenario() {
    let net = Network::new();
    let producer = net.producer(share_of(&[("lifecycle", Value::from("ready"))]));
    let wire = net.wiretap("aiko/c/in");
    let (consumer, events) = net.consumer("c", Filter::All);

    net.settle();
    assert_eq!(
        *wire.borrow(),
        vec!["(item_count 1)", "(add lifecycle ready)", "(sync aiko/c/in)"]
    );
    assert_eq!(consumer.state(), ConsumerState::Ready);

    producer.update("lifecycle", "busy").expect("update");
    net.settle();

    assert_eq!(
        consumer.mirror(),
        share_of(&[("lifecycle", Value::from("busy"))])
    );
    assert_eq!(
        *events.borrow(),
        vec![
            "add lifecycle ready",
            "sync aiko/c/in",
            "update lifecycle busy",
        ]
    );
}

#[test]
fn filters_select_paths() {
    let net = Network::new();
    let producer = net.producer(share_of(&[
        ("a.x", Value::from(1)),
        ("b.y", Value::from(2)),
        ("ab", Value::from(3)),
    ]));
    let (only_a, _) = net.consumer("only_a", Filter::prefixes(["a"]));
    let (exact, _) = net.consumer("exact", Filter::prefixes(["b.y"]));
    net.settle();

    assert_eq!(only_a.mirror(), share_of(&[("a.x", Value::from(1))]));
    assert_eq!(exact.mirror(), share_of(&[("b.y", Value::from(2))]));

    producer.update("ab", 30).expect("update ab");
    producer.update("a.z", 4).expect("update a.z");
    producer.update("b.yy", 5).expect("update b.yy");
    net.settle();

    assert_eq!(
        only_a.mirror(),
        share_of(&[("a.x", Value::from(1)), ("a.z", Value::from(4))])
    );
    assert_eq!(exact.mirror(), share_of(&[("b.y", Value::from(2))]));
    assert_eq!(producer.subscriptions().len(), 2);
}

#[test]
fn depth_invariant_holds_end_to_end() {
    let net = Network::new();
    let producer = net.producer(share_of(&[("a", Value::from(1))]));
    let state = net.wiretap("aiko/svc/state");
    let (consumer, _) = net.consumer("c", Filter::All);
    net.settle();
    state.borrow_mut().clear();

    let err = producer.update("a.b.c", 1).expect_err("too deep");
    assert!(matches!(err, Error::InvalidPath(_)));
    net.consumer_rt
        .publish("aiko/svc/control", "(update x.y.z 1)")
        .expect("publish");
    net.settle();

    assert!(state.borrow().is_empty());
    assert_eq!(producer.share(), share_of(&[("a", Value::from(1))]));
    assert_eq!(consumer.mirror(), share_of(&[("a", Value::from(1))]));
}

#[test]
fn replayed_update_is_idempotent() {
    let net = Network::new();
    let _producer = net.producer(Share::new());
    let (consumer, events) = net.consumer("c", Filter::All);
    net.settle();
    events.borrow_mut().clear();

    for _ in 0..2 {
        net.consumer_rt
            .publish("aiko/c/in", "(update x 5)")
            .expect("publish");
    }
    net.settle();

    assert_eq!(consumer.get("x").expect("get"), Some(Value::from(5)));
    assert_eq!(*events.borrow(), vec!["update x 5", "update x 5"]);
}

#[test]
fn snapshot_is_atomic() {
    let net = Network::new();
    let (consumer, _) = net.consumer("c", Filter::All);
    net.settle();
    assert_eq!(consumer.state(), ConsumerState::AwaitingSnapshot);

    let feed = |payload: &str| {
        net.consumer_rt
            .publish("aiko/c/in", payload)
            .expect("publish")
    };
    feed("(add stray 9)");
    feed("(item_count 3)");
    feed("(add a 1)");
    feed("(add b 2)");
    net.settle();
    assert_eq!(consumer.state(), ConsumerState::AwaitingSnapshot);

    feed("(add c 3)");
    net.settle();
    assert_eq!(consumer.state(), ConsumerState::Ready);
    assert_eq!(
        consumer.mirror(),
        share_of(&[
            ("a", Value::from(1)),
            ("b", Value::from(2)),
            ("c", Value::from(3)),
        ])
    );
}

#[test]
fn consumer_catches_up_after_outage() {
    let net = Network::new();
    let producer = net.producer(share_of(&[("lifecycle", Value::from("ready"))]));
    let (consumer, _) = net.consumer("c", Filter::All);
    net.settle();
    assert_eq!(consumer.state(), ConsumerState::Ready);

    net.broker.set_online(false);
    net.settle();
    assert_eq!(consumer.state(), ConsumerState::Unleased);

    producer.update("lifecycle", "busy").expect("update while offline");
    producer.update("stats.count", 7).expect("update while offline");
    net.settle();
    assert_eq!(
        consumer.get("lifecycle").expect("get"),
        Some(Value::from("ready"))
    );

    net.broker.set_online(true);
    net.settle();
    assert_eq!(consumer.state(), ConsumerState::Ready);
    assert_eq!(consumer.mirror(), producer.share());
}

#[test]
fn subscriptions_follow_leases() {
    let net = Network::new();
    let producer = net.producer(Share::new());
    let (consumer, _) = net.consumer("c", Filter::All);
    net.consumer_rt
        .publish("aiko/svc/control", "(share aiko/ghost/in 5 *)")
        .expect("publish");
    net.settle();
    assert_eq!(producer.subscriptions().len(), 2);

    for _ in 0..3 {
        net.advance(Duration::from_secs(2));
    }
    let topics: Vec<String> = producer
        .subscriptions()
        .into_iter()
        .map(|info| info.response_topic)
        .collect();
    assert_eq!(topics, vec!["aiko/c/in"]);

    consumer.terminate();
    net.settle();
    assert!(producer.subscriptions().is_empty());
}
