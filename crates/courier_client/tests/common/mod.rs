#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use courier_broker::{Broker, BrokerServer};
use courier_config::{BrokerSettings, ServerSettings};
use courier_transport::{ClientCommand, ServerCommand, SERVER_VERSION, decode, encode};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::watch;

/// A standalone broker on an ephemeral port, running on its own runtime.
pub struct TestBroker {
    pub url: String,
    pub broker: Arc<Mutex<Broker>>,
    _runtime: Runtime,
}

impl TestBroker {
    pub fn start() -> Self {
        Self::start_with(ServerSettings::default(), BrokerSettings::default())
    }

    pub fn start_with(server: ServerSettings, settings: BrokerSettings) -> Self {
        courier_utils::logging::init("debug");
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("test-broker")
            .enable_all()
            .build()
            .unwrap();
        let broker = Arc::new(Mutex::new(Broker::new(settings)));
        let server = runtime
            .block_on(BrokerServer::bind("127.0.0.1:0", broker.clone(), &server))
            .unwrap();
        let addr = server.local_addr().unwrap();
        runtime.spawn(server.run());
        Self {
            url: format!("pulsar://{addr}/"),
            broker,
            _runtime: runtime,
        }
    }

    /// Cut every client connection.
    pub fn disconnect_all(&self) -> usize {
        self.broker.lock().unwrap().disconnect_all_sessions()
    }
}

/// A broker that accepts producers but never acknowledges a send, and can
/// drop its connections on demand.
pub struct SilentBroker {
    pub url: String,
    drop_connections: watch::Sender<u64>,
    _runtime: Runtime,
}

impl SilentBroker {
    pub fn start() -> Self {
        courier_utils::logging::init("debug");
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("silent-broker")
            .enable_all()
            .build()
            .unwrap();
        let listener = runtime.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
        let addr = listener.local_addr().unwrap();
        let (drop_connections, _) = watch::channel(0);
        let drops = drop_connections.clone();

        runtime.spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let mut dropped = drops.subscribe();
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    loop {
                        tokio::select! {
                            frame = ws.next() => {
                                let Some(Ok(frame)) = frame else { return };
                                let Ok(Some(command)) = decode::<ClientCommand>(&frame) else {
                                    continue;
                                };
                                let reply = match command {
                                    ClientCommand::Connect { .. } => ServerCommand::Connected {
                                        server_version: SERVER_VERSION.to_string(),
                                    },
                                    ClientCommand::Producer { request_id, .. } => {
                                        ServerCommand::ProducerSuccess {
                                            request_id,
                                            producer_name: "silent".to_string(),
                                        }
                                    }
                                    ClientCommand::Ping => ServerCommand::Pong,
                                    ClientCommand::CloseProducer { request_id, .. } => {
                                        ServerCommand::Success { request_id }
                                    }
                                    _ => continue,
                                };
                                if ws.send(encode(&reply).unwrap()).await.is_err() {
                                    return;
                                }
                            }
                            _ = dropped.changed() => {
                                let _ = ws.close(None).await;
                                return;
                            }
                        }
                    }
                });
            }
        });

        Self {
            url: format!("pulsar://{addr}/"),
            drop_connections,
            _runtime: runtime,
        }
    }

    pub fn drop_connections(&self) {
        self.drop_connections.send_modify(|generation| *generation += 1);
    }
}

/// A topic name no other test uses.
pub fn unique_topic(name: &str) -> String {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    format!(
        "persistent://public/default/{name}-{}",
        NEXT.fetch_add(1, Ordering::SeqCst)
    )
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
