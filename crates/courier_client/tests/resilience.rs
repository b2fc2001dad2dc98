mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::{SilentBroker, TestBroker, unique_topic, wait_until};
use courier_broker::auth::issue_token;
use courier_client::{Client, ClientConfig, Error, ProducerConfig, Result};
use courier_config::{BrokerSettings, ServerSettings};

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(10);

fn collecting_callback(
    results: &Arc<Mutex<Vec<Result<courier_client::MessageId>>>>,
) -> impl FnOnce(Result<courier_client::MessageId>) + Send + 'static {
    let results = results.clone();
    move |result| results.lock().unwrap().push(result)
}

#[test]
fn consumer_and_producer_recover_after_disconnect() {
    let broker = TestBroker::start();
    let client = Client::new(&broker.url).unwrap();
    let topic = unique_topic("reconnect");

    let consumer = client.subscribe(&topic, "sub").unwrap();
    let producer = client.create_producer(&topic).unwrap();
    producer.send("before").unwrap();

    let first = consumer.receive_timeout(RECEIVE_TIMEOUT).unwrap();
    assert_eq!(first.data(), b"before");
    assert_eq!(first.redelivery_count(), 0);

    assert!(broker.disconnect_all() >= 1);

    // At-least-once: the unacknowledged message comes back.
    let again = consumer.receive_timeout(RECEIVE_TIMEOUT).unwrap();
    assert_eq!(again.data(), b"before");
    assert!(again.redelivery_count() >= 1);
    consumer.acknowledge(&again).unwrap();

    producer.send("after").unwrap();
    let next = consumer.receive_timeout(RECEIVE_TIMEOUT).unwrap();
    assert_eq!(next.data(), b"after");
    consumer.acknowledge(&next).unwrap();
    client.close().unwrap();
}

#[test]
fn in_flight_sends_fail_with_connection_lost() {
    let silent = SilentBroker::start();
    let client = Client::new(&silent.url).unwrap();
    let producer = client
        .create_producer("persistent://public/default/silent")
        .unwrap();

    let results = Arc::new(Mutex::new(Vec::new()));
    for i in 0..3 {
        producer.send_async(format!("lost-{i}"), collecting_callback(&results));
    }
    std::thread::sleep(Duration::from_millis(100));
    assert!(results.lock().unwrap().is_empty());

    silent.drop_connections();
    assert!(wait_until(RECEIVE_TIMEOUT, || results.lock().unwrap().len() == 3));
    assert!(results
        .lock()
        .unwrap()
        .iter()
        .all(|result| matches!(result, Err(Error::ConnectionLost))));
    client.close().unwrap();
}

#[test]
fn send_times_out_without_receipt() {
    let silent = SilentBroker::start();
    let client = Client::new(&silent.url).unwrap();
    let mut config = ProducerConfig::new();
    config.set_send_timeout_millis(200);
    let producer = client
        .create_producer_with_config("persistent://public/default/slow", config)
        .unwrap();

    let started = Instant::now();
    assert_eq!(producer.send("never acked").unwrap_err(), Error::Timeout);
    assert!(started.elapsed() < Duration::from_secs(5));
    client.close().unwrap();
}

#[test]
fn full_queue_fails_when_not_blocking() {
    let silent = SilentBroker::start();
    let mut client_config = ClientConfig::default();
    client_config.set_operation_timeout(Duration::from_millis(300));
    let client = Client::with_config(&silent.url, client_config).unwrap();
    let mut config = ProducerConfig::new();
    config
        .set_max_pending_messages(2)
        .set_block_if_queue_full(false);
    let producer = client
        .create_producer_with_config("persistent://public/default/full", config)
        .unwrap();

    let results = Arc::new(Mutex::new(Vec::new()));
    for i in 0..3 {
        producer.send_async(format!("queued-{i}"), collecting_callback(&results));
    }
    assert!(wait_until(RECEIVE_TIMEOUT, || !results.lock().unwrap().is_empty()));
    assert!(matches!(
        results.lock().unwrap()[0],
        Err(Error::ProducerQueueFull)
    ));
    client.close().unwrap();
}

#[test]
fn full_queue_blocks_until_a_slot_frees() {
    let silent = SilentBroker::start();
    let mut client_config = ClientConfig::default();
    client_config.set_operation_timeout(Duration::from_millis(300));
    let client = Client::with_config(&silent.url, client_config).unwrap();
    let mut config = ProducerConfig::new();
    config.set_max_pending_messages(2);
    let producer = client
        .create_producer_with_config("persistent://public/default/blocking", config)
        .unwrap();

    let results = Arc::new(Mutex::new(Vec::new()));
    for i in 0..2 {
        producer.send_async(format!("held-{i}"), collecting_callback(&results));
    }

    let enqueued = Arc::new(AtomicBool::new(false));
    let sender = {
        let producer = producer.clone();
        let results = results.clone();
        let enqueued = enqueued.clone();
        std::thread::spawn(move || {
            producer.send_async("third", collecting_callback(&results));
            enqueued.store(true, Ordering::SeqCst);
        })
    };

    std::thread::sleep(Duration::from_millis(300));
    assert!(!enqueued.load(Ordering::SeqCst));

    // Losing the connection fails the two in-flight sends and frees their slots.
    silent.drop_connections();
    assert!(wait_until(RECEIVE_TIMEOUT, || enqueued.load(Ordering::SeqCst)));
    sender.join().unwrap();
    assert!(wait_until(RECEIVE_TIMEOUT, || results.lock().unwrap().len() >= 2));
    {
        let results = results.lock().unwrap();
        assert!(results[..2].iter().all(|result| matches!(result, Err(Error::ConnectionLost))));
    }
    client.close().unwrap();
    assert_eq!(results.lock().unwrap().len(), 3);
}

#[test]
fn close_fails_undrained_sends_with_timeout() {
    let silent = SilentBroker::start();
    let mut config = ClientConfig::default();
    config.set_operation_timeout(Duration::from_millis(300));
    let client = Client::with_config(&silent.url, config).unwrap();
    let producer = client
        .create_producer("persistent://public/default/stuck")
        .unwrap();

    let results = Arc::new(Mutex::new(Vec::new()));
    for i in 0..5 {
        producer.send_async(format!("stuck-{i}"), collecting_callback(&results));
    }
    client.close().unwrap();

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|result| matches!(result, Err(Error::Timeout))));
}

#[test]
fn token_authentication() {
    let server = ServerSettings {
        auth_secret: Some("test-secret".to_string()),
        ..ServerSettings::default()
    };
    let broker = TestBroker::start_with(server, BrokerSettings::default());
    let topic = unique_topic("auth");

    let anonymous = Client::new(&broker.url).unwrap();
    let err = anonymous.create_producer(&topic).err().unwrap();
    assert!(matches!(err, Error::Connect(_)), "unexpected error: {err:?}");

    let mut config = ClientConfig::default();
    let token = issue_token("wrong-secret", "intruder", chrono::Duration::hours(1)).unwrap();
    config.set_auth_token(token);
    let forged = Client::with_config(&broker.url, config).unwrap();
    assert!(matches!(forged.create_producer(&topic).err(), Some(Error::Connect(_))));

    let mut config = ClientConfig::default();
    let token = issue_token("test-secret", "tester", chrono::Duration::hours(1)).unwrap();
    config.set_auth_token(token);
    let client = Client::with_config(&broker.url, config).unwrap();
    let consumer = client.subscribe(&topic, "sub").unwrap();
    client.create_producer(&topic).unwrap().send("authorized").unwrap();
    assert_eq!(
        consumer.receive_timeout(RECEIVE_TIMEOUT).unwrap().data(),
        b"authorized"
    );
    client.close().unwrap();
}

#[test]
fn connection_limit_is_a_connect_error() {
    let settings = BrokerSettings {
        max_connections: 1,
        ..BrokerSettings::default()
    };
    let broker = TestBroker::start_with(ServerSettings::default(), settings);
    let topic = unique_topic("limit");

    let first = Client::new(&broker.url).unwrap();
    first.create_producer(&topic).unwrap();

    let second = Client::new(&broker.url).unwrap();
    let err = second.create_producer(&topic).err().unwrap();
    assert!(matches!(err, Error::Connect(_)), "unexpected error: {err:?}");
    first.close().unwrap();
}
