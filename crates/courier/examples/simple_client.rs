//! Publish a message and read it back through a listener.
//!
//! Start a broker first: `cargo run -p courier -- standalone`.

use std::sync::mpsc;
use std::time::Duration;

use courier_client::{Client, ConsumerConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    courier_utils::logging::init("info");

    let client = Client::new("pulsar://127.0.0.1:6650/")?;
    let topic = "persistent://public/default/chat";

    let (tx, rx) = mpsc::channel();
    let mut config = ConsumerConfig::new();
    config.set_message_listener(move |consumer, message| {
        println!("Incoming: {}", String::from_utf8_lossy(message.data()));
        let _ = consumer.acknowledge(&message);
        let _ = tx.send(());
    });
    let _consumer = client.subscribe_with_config(topic, "example", config)?;

    let producer = client.create_producer(topic)?;
    let id = producer.send("Hello from example")?;
    println!("Published as {id}");

    rx.recv_timeout(Duration::from_secs(5))?;
    client.close()?;
    Ok(())
}
