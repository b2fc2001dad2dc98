mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use common::{TestBroker, unique_topic, wait_until};
use courier_client::{
    Client, CompressionType, ConsumerConfig, ConsumerType, Error, IO_THREAD_NAME, InitialPosition,
    MessageBuilder, MessageId, ProducerConfig,
};

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

fn text(message: &courier_client::Message) -> String {
    String::from_utf8_lossy(message.data()).into_owned()
}

#[test]
fn produce_then_receive_then_timeout() {
    let broker = TestBroker::start();
    let client = Client::new(&broker.url).unwrap();
    let topic = unique_topic("hello");

    let consumer = client.subscribe(&topic, "sub").unwrap();
    let producer = client.create_producer(&topic).unwrap();
    let sent_id = producer.send("hello").unwrap();

    let message = consumer.receive_timeout(Duration::from_millis(1000)).unwrap();
    assert_eq!(message.data(), b"hello");
    assert_eq!(message.message_id(), sent_id);
    assert_eq!(message.topic(), topic);
    assert_eq!(message.redelivery_count(), 0);
    consumer.acknowledge(&message).unwrap();

    let err = consumer
        .receive_timeout(Duration::from_millis(100))
        .unwrap_err();
    assert_eq!(err, Error::Timeout);
    assert!(err.is_timeout());
    client.close().unwrap();
}

#[test]
fn async_sends_complete_exactly_once_in_order() {
    const N: usize = 200;
    let broker = TestBroker::start();
    let client = Client::new(&broker.url).unwrap();
    let topic = unique_topic("async");

    let mut config = ProducerConfig::new();
    config.set_max_pending_messages(N as i32);
    let producer = client.create_producer_with_config(&topic, config).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let ids: Arc<Mutex<Vec<MessageId>>> = Arc::default();
    let off_io_thread = Arc::new(AtomicBool::new(false));
    for i in 0..N {
        let calls = calls.clone();
        let ids = ids.clone();
        let off_io_thread = off_io_thread.clone();
        producer.send_async(format!("msg-{i}"), move |result| {
            if thread::current().name() != Some(IO_THREAD_NAME) {
                off_io_thread.store(true, Ordering::SeqCst);
            }
            ids.lock().unwrap().push(result.unwrap());
            calls.fetch_add(1, Ordering::SeqCst);
        });
    }

    assert!(wait_until(RECEIVE_TIMEOUT, || calls.load(Ordering::SeqCst) >= N));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(calls.load(Ordering::SeqCst), N);
    assert!(!off_io_thread.load(Ordering::SeqCst));

    let ids = ids.lock().unwrap();
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(producer.last_sequence_id(), N as i64 - 1);
    client.close().unwrap();
}

#[test]
fn listener_receives_in_order_without_overlap() {
    let broker = TestBroker::start();
    let client = Client::new(&broker.url).unwrap();
    let topic = unique_topic("listener");

    let received: Arc<Mutex<Vec<String>>> = Arc::default();
    let busy = Arc::new(AtomicBool::new(false));
    let overlapped = Arc::new(AtomicBool::new(false));
    let thread_names: Arc<Mutex<Vec<String>>> = Arc::default();

    let mut config = ConsumerConfig::new();
    {
        let received = received.clone();
        let busy = busy.clone();
        let overlapped = overlapped.clone();
        let thread_names = thread_names.clone();
        config.set_message_listener(move |consumer, message| {
            if busy.swap(true, Ordering::SeqCst) {
                overlapped.store(true, Ordering::SeqCst);
            }
            thread_names
                .lock()
                .unwrap()
                .push(thread::current().name().unwrap_or_default().to_string());
            thread::sleep(Duration::from_millis(20));
            consumer.acknowledge(&message).unwrap();
            received.lock().unwrap().push(text(&message));
            busy.store(false, Ordering::SeqCst);
        });
    }
    let consumer = client.subscribe_with_config(&topic, "sub", config).unwrap();
    assert!(matches!(consumer.receive(), Err(Error::InvalidOperation(_))));

    let producer = client.create_producer(&topic).unwrap();
    for i in 1..=3 {
        producer.send_async(format!("hello-{i}"), |result| {
            result.unwrap();
        });
    }

    assert!(wait_until(RECEIVE_TIMEOUT, || received.lock().unwrap().len() == 3));
    assert_eq!(*received.lock().unwrap(), vec!["hello-1", "hello-2", "hello-3"]);
    assert!(!overlapped.load(Ordering::SeqCst));
    let names = thread_names.lock().unwrap();
    assert!(names.iter().all(|name| name.starts_with("courier-listener-")));
    drop(names);

    consumer.close().unwrap();
    client.close().unwrap();
}

#[test]
fn second_exclusive_consumer_is_busy() {
    let broker = TestBroker::start();
    let client = Client::new(&broker.url).unwrap();
    let topic = unique_topic("exclusive");

    let first = client.subscribe(&topic, "only-one").unwrap();
    let err = client.subscribe(&topic, "only-one").err().unwrap();
    assert!(matches!(err, Error::ConsumerBusy(_)), "unexpected error: {err:?}");

    // A different subscription is unaffected.
    client.subscribe(&topic, "another").unwrap();

    first.close().unwrap();
    first.close().unwrap();
    client.subscribe(&topic, "only-one").unwrap();
    client.close().unwrap();
}

#[test]
fn client_close_drains_in_flight_sends() {
    const N: usize = 50;
    let broker = TestBroker::start();
    let client = Client::new(&broker.url).unwrap();
    let topic = unique_topic("close");

    let consumer = client.subscribe(&topic, "sub").unwrap();
    let producer = client.create_producer(&topic).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    for i in 0..N {
        let calls = calls.clone();
        producer.send_async(format!("m-{i}"), move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
        });
    }
    // Leave a message unacknowledged.
    consumer.receive_timeout(RECEIVE_TIMEOUT).unwrap();

    client.close().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), N);
    assert!(producer.is_closed());
    assert!(consumer.is_closed());
    client.close().unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(calls.load(Ordering::SeqCst), N);
}

#[test]
fn shared_subscription_spreads_messages() {
    let broker = TestBroker::start();
    let client = Client::new(&broker.url).unwrap();
    let topic = unique_topic("shared");

    let mut config = ConsumerConfig::new();
    config.set_consumer_type(ConsumerType::Shared);
    let first = client.subscribe_with_config(&topic, "work", config.clone()).unwrap();
    let second = client.subscribe_with_config(&topic, "work", config).unwrap();

    let producer = client.create_producer(&topic).unwrap();
    for i in 0..10 {
        producer.send(format!("job-{i}")).unwrap();
    }

    let drain = |consumer: &courier_client::Consumer| {
        let mut count = 0;
        while let Ok(message) = consumer.receive_timeout(Duration::from_millis(300)) {
            consumer.acknowledge(&message).unwrap();
            count += 1;
        }
        count
    };
    let (a, b) = (drain(&first), drain(&second));
    assert_eq!(a + b, 10);
    assert!(a > 0 && b > 0, "uneven split: {a}/{b}");

    producer.send("cumulative").unwrap();
    let message = first
        .receive_timeout(Duration::from_millis(300))
        .or_else(|_| second.receive_timeout(Duration::from_millis(300)))
        .unwrap();
    assert!(matches!(
        first.acknowledge_cumulative(&message),
        Err(Error::InvalidOperation(_))
    ));
    client.close().unwrap();
}

#[test]
fn failover_moves_to_the_next_consumer() {
    let broker = TestBroker::start();
    let client = Client::new(&broker.url).unwrap();
    let topic = unique_topic("failover");

    let subscribe = |name: &str| {
        let mut config = ConsumerConfig::new();
        config
            .set_consumer_type(ConsumerType::Failover)
            .set_consumer_name(name);
        client.subscribe_with_config(&topic, "ha", config).unwrap()
    };
    let primary = subscribe("a");
    let standby = subscribe("b");
    assert_eq!(primary.consumer_name(), "a");

    let producer = client.create_producer(&topic).unwrap();
    producer.send("one").unwrap();
    let message = primary.receive_timeout(RECEIVE_TIMEOUT).unwrap();
    assert_eq!(message.data(), b"one");
    primary.acknowledge(&message).unwrap();
    assert_eq!(
        standby.receive_timeout(Duration::from_millis(200)).unwrap_err(),
        Error::Timeout
    );

    producer.send("two").unwrap();
    primary.close().unwrap();
    let message = standby.receive_timeout(RECEIVE_TIMEOUT).unwrap();
    assert_eq!(message.data(), b"two");
    client.close().unwrap();
}

#[test]
fn batched_and_compressed_messages_arrive_in_order() {
    let broker = TestBroker::start();
    let client = Client::new(&broker.url).unwrap();
    let topic = unique_topic("batch");
    let consumer = client.subscribe(&topic, "sub").unwrap();

    let mut config = ProducerConfig::new();
    config
        .set_batching_enabled(true)
        .set_batching_max_messages(4)
        .set_batching_max_publish_delay_ms(50)
        .set_compression_type(CompressionType::Lz4);
    let producer = client.create_producer_with_config(&topic, config).unwrap();

    let results: Arc<Mutex<Vec<MessageId>>> = Arc::default();
    for i in 0..10 {
        let results = results.clone();
        producer.send_async(format!("batched-{i}"), move |result| {
            results.lock().unwrap().push(result.unwrap());
        });
    }
    producer.flush().unwrap();
    assert_eq!(results.lock().unwrap().len(), 10);
    assert!(results.lock().unwrap().iter().all(|id| id.batch_index().is_some()));

    for i in 0..10 {
        let message = consumer.receive_timeout(RECEIVE_TIMEOUT).unwrap();
        assert_eq!(text(&message), format!("batched-{i}"));
        assert!(message.message_id().batch_index().is_some());
        consumer.acknowledge(&message).unwrap();
    }

    let mut zlib = ProducerConfig::new();
    zlib.set_compression_type(CompressionType::Zlib);
    let zlib_producer = client.create_producer_with_config(&topic, zlib).unwrap();
    let payload = "z".repeat(10_000);
    zlib_producer.send(payload.as_str()).unwrap();
    let message = consumer.receive_timeout(RECEIVE_TIMEOUT).unwrap();
    assert_eq!(text(&message), payload);
    client.close().unwrap();
}

#[test]
fn properties_and_metadata_are_delivered() {
    let broker = TestBroker::start();
    let client = Client::new(&broker.url).unwrap();
    let topic = unique_topic("props");
    let consumer = client.subscribe(&topic, "sub").unwrap();

    let mut config = ProducerConfig::new();
    config.set_producer_name("named-producer");
    let producer = client.create_producer_with_config(&topic, config).unwrap();
    assert_eq!(producer.producer_name(), "named-producer");
    assert_eq!(producer.topic(), topic);

    let before = chrono::Utc::now() - chrono::Duration::seconds(5);
    producer
        .send(
            MessageBuilder::new("payload")
                .property("kind", "order")
                .partition_key("customer-9"),
        )
        .unwrap();

    let message = consumer.receive_timeout(RECEIVE_TIMEOUT).unwrap();
    assert_eq!(message.property("kind"), Some("order"));
    assert_eq!(message.partition_key(), Some("customer-9"));
    assert_eq!(message.producer_name(), "named-producer");
    assert!(message.publish_time() >= before);

    let err = client
        .create_producer_with_config(&topic, {
            let mut duplicate = ProducerConfig::new();
            duplicate.set_producer_name("named-producer");
            duplicate
        })
        .err()
        .unwrap();
    assert!(matches!(err, Error::BrokerRejected { .. }), "unexpected error: {err:?}");
    client.close().unwrap();
}

#[test]
fn initial_position_selects_backlog() {
    let broker = TestBroker::start();
    let client = Client::new(&broker.url).unwrap();
    let topic = unique_topic("position");
    let producer = client.create_producer(&topic).unwrap();
    producer.send("backlog").unwrap();

    let mut earliest = ConsumerConfig::new();
    earliest.set_initial_position(InitialPosition::Earliest);
    let from_start = client.subscribe_with_config(&topic, "replay", earliest).unwrap();
    let latest = client.subscribe(&topic, "tail").unwrap();

    assert_eq!(from_start.receive_timeout(RECEIVE_TIMEOUT).unwrap().data(), b"backlog");
    assert_eq!(
        latest.receive_timeout(Duration::from_millis(200)).unwrap_err(),
        Error::Timeout
    );
    client.close().unwrap();
}

#[test]
fn unacknowledged_messages_are_redelivered_after_timeout() {
    let broker = TestBroker::start();
    let client = Client::new(&broker.url).unwrap();
    let topic = unique_topic("unacked");

    let mut config = ConsumerConfig::new();
    config.set_unacked_messages_timeout_ms(300);
    let consumer = client.subscribe_with_config(&topic, "sub", config).unwrap();
    let producer = client.create_producer(&topic).unwrap();
    producer.send("retry-me").unwrap();

    let first = consumer.receive_timeout(RECEIVE_TIMEOUT).unwrap();
    assert_eq!(first.redelivery_count(), 0);
    let again = consumer.receive_timeout(RECEIVE_TIMEOUT).unwrap();
    assert_eq!(again.data(), b"retry-me");
    assert_eq!(again.message_id(), first.message_id());
    assert!(again.redelivery_count() >= 1);
    consumer.acknowledge(&again).unwrap();
    client.close().unwrap();
}

#[test]
fn explicit_redelivery_and_cumulative_ack() {
    let broker = TestBroker::start();
    let client = Client::new(&broker.url).unwrap();
    let topic = unique_topic("redeliver");

    let consumer = client.subscribe(&topic, "sub").unwrap();
    let producer = client.create_producer(&topic).unwrap();
    for i in 0..3 {
        producer.send(format!("r-{i}")).unwrap();
    }

    let first = consumer.receive_timeout(RECEIVE_TIMEOUT).unwrap();
    assert_eq!(text(&first), "r-0");
    // Let the rest of the backlog reach the receiver queue first.
    thread::sleep(Duration::from_millis(200));
    consumer.redeliver_unacknowledged_messages().unwrap();

    let mut last = None;
    for i in 0..3 {
        let message = consumer.receive_timeout(RECEIVE_TIMEOUT).unwrap();
        assert_eq!(text(&message), format!("r-{i}"));
        last = Some(message);
    }
    let last = last.unwrap();
    consumer.acknowledge_cumulative(&last).unwrap();
    consumer.close().unwrap();

    let reopened = client.subscribe(&topic, "sub").unwrap();
    assert_eq!(
        reopened.receive_timeout(Duration::from_millis(300)).unwrap_err(),
        Error::Timeout
    );

    reopened.unsubscribe().unwrap();
    assert!(reopened.is_closed());
    assert!(matches!(
        reopened.receive_timeout(Duration::from_millis(10)),
        Err(Error::AlreadyClosed(_))
    ));
    client.close().unwrap();
}

#[test]
fn closed_producer_rejects_sends() {
    let broker = TestBroker::start();
    let client = Client::new(&broker.url).unwrap();
    let topic = unique_topic("closed");
    let producer = client.create_producer(&topic).unwrap();
    assert_eq!(producer.last_sequence_id(), -1);
    producer.send("once").unwrap();
    assert_eq!(producer.last_sequence_id(), 0);

    producer.close().unwrap();
    producer.close().unwrap();
    assert_eq!(
        producer.send("twice").unwrap_err(),
        Error::AlreadyClosed("producer")
    );

    let oversized = vec![0u8; courier_client::MAX_MESSAGE_SIZE + 1];
    let other = client.create_producer(&topic).unwrap();
    assert!(matches!(other.send(oversized), Err(Error::InvalidMessage(_))));
    client.close().unwrap();
}

#[test]
fn send_after_client_close_still_completes() {
    let broker = TestBroker::start();
    let client = Client::new(&broker.url).unwrap();
    let producer = client.create_producer(&unique_topic("after-close")).unwrap();
    client.close().unwrap();

    let caller = thread::current().id();
    let (tx, rx) = std::sync::mpsc::channel();
    producer.send_async("late", move |result| {
        let _ = tx.send((result, thread::current().id()));
    });
    let (result, callback_thread) = rx.recv_timeout(RECEIVE_TIMEOUT).unwrap();
    assert!(matches!(result, Err(Error::AlreadyClosed(_))));
    assert_ne!(callback_thread, caller);
}

#[test]
fn flush_waits_for_callbacks_to_finish() {
    let broker = TestBroker::start();
    let client = Client::new(&broker.url).unwrap();
    let producer = client.create_producer(&unique_topic("flush")).unwrap();

    let finished = Arc::new(AtomicUsize::new(0));
    for i in 0..5 {
        let finished = finished.clone();
        producer.send_async(format!("slow-{i}"), move |result| {
            result.unwrap();
            thread::sleep(Duration::from_millis(20));
            finished.fetch_add(1, Ordering::SeqCst);
        });
    }
    producer.flush().unwrap();
    assert_eq!(finished.load(Ordering::SeqCst), 5);

    let finished_on_close = finished.clone();
    producer.send_async("last", move |result| {
        result.unwrap();
        thread::sleep(Duration::from_millis(50));
        finished_on_close.fetch_add(1, Ordering::SeqCst);
    });
    producer.close().unwrap();
    assert_eq!(finished.load(Ordering::SeqCst), 6);
    client.close().unwrap();
}
