//! Connection management for the courier client
//!
//! A [`Connection`] is one logical, reconnecting WebSocket channel to a broker.
//! The socket is owned by a supervisor task on the client runtime; producers and
//! consumers hand it commands through an unbounded channel and receive broker
//! events through the [`ProducerEvents`] and [`ConsumerEvents`] handlers they
//! register.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{RecvTimeoutError, SyncSender, sync_channel};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use courier_transport::{
    ClientCommand, CLIENT_VERSION, MessageIdData, MessageMetadata, ServerCommand, ServerError,
    decode, encode,
};
use courier_utils::{Backoff, lock, wait_timeout};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

use crate::client::on_io_thread;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::service_url::ServiceUrl;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingRequest = Box<dyn FnOnce(Result<Response>) + Send>;

/// Successful answer to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Response {
    Success,
    ProducerSuccess { producer_name: String },
}

/// Broker events routed to a producer.
pub(crate) trait ProducerEvents: Send + Sync {
    fn on_receipt(&self, sequence_id: u64, highest_sequence_id: u64, message_id: MessageIdData);
    fn on_send_error(&self, sequence_id: u64, code: ServerError, message: String);
    fn on_connection_lost(&self);
    fn on_reconnected(self: Arc<Self>);
}

/// Broker events routed to a consumer.
pub(crate) trait ConsumerEvents: Send + Sync {
    fn on_message(
        &self,
        message_id: MessageIdData,
        redelivery_count: u32,
        metadata: MessageMetadata,
        payload: Vec<u8>,
        checksum: u32,
    );
    fn on_connection_lost(&self);
    fn on_reconnected(self: Arc<Self>);
}

#[derive(Default)]
struct Link {
    outbound: Option<mpsc::UnboundedSender<ClientCommand>>,
    closed: bool,
}

struct ConnectionInner {
    url: String,
    config: ClientConfig,
    handle: Handle,
    link: Mutex<Link>,
    link_changed: Condvar,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    producers: Mutex<HashMap<u64, Weak<dyn ProducerEvents>>>,
    consumers: Mutex<HashMap<u64, Weak<dyn ConsumerEvents>>>,
    request_ids: AtomicU64,
    producer_ids: AtomicU64,
    consumer_ids: AtomicU64,
    epoch: AtomicU64,
    shutdown: Notify,
}

/// Cheap handle to a shared broker connection.
#[derive(Clone)]
pub(crate) struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Open a connection and wait for the broker handshake.
    pub(crate) fn connect(handle: &Handle, url: &str, config: &ClientConfig) -> Result<Self> {
        let inner = Arc::new(ConnectionInner {
            url: url.to_string(),
            config: config.clone(),
            handle: handle.clone(),
            link: Mutex::new(Link::default()),
            link_changed: Condvar::new(),
            pending: Mutex::new(HashMap::new()),
            producers: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            request_ids: AtomicU64::new(0),
            producer_ids: AtomicU64::new(0),
            consumer_ids: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            shutdown: Notify::new(),
        });

        let (ready_tx, ready_rx) = sync_channel(1);
        handle.spawn(supervise(inner.clone(), ready_tx));

        // The supervisor enforces the connection timeout; the margin covers scheduling.
        let wait = config.connection_timeout() * 2 + Duration::from_secs(1);
        match ready_rx.recv_timeout(wait) {
            Ok(Ok(())) => Ok(Self { inner }),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                let connection = Self { inner };
                connection.close();
                Err(Error::Connect(format!("timed out connecting to {url}")))
            }
        }
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    pub(crate) fn operation_timeout(&self) -> Duration {
        self.inner.config.operation_timeout()
    }

    pub(crate) fn retry_backoff(&self) -> Backoff {
        retry_backoff(&self.inner.config)
    }

    /// Incremented every time the transport is (re)established.
    pub(crate) fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        lock(&self.inner.link).closed
    }

    pub(crate) fn is_connected(&self) -> bool {
        lock(&self.inner.link).outbound.is_some()
    }

    pub(crate) fn next_producer_id(&self) -> u64 {
        self.inner.producer_ids.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn next_consumer_id(&self) -> u64 {
        self.inner.consumer_ids.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn register_producer(&self, producer_id: u64, handler: Weak<dyn ProducerEvents>) {
        lock(&self.inner.producers).insert(producer_id, handler);
    }

    pub(crate) fn remove_producer(&self, producer_id: u64) {
        lock(&self.inner.producers).remove(&producer_id);
    }

    pub(crate) fn register_consumer(&self, consumer_id: u64, handler: Weak<dyn ConsumerEvents>) {
        lock(&self.inner.consumers).insert(consumer_id, handler);
    }

    pub(crate) fn remove_consumer(&self, consumer_id: u64) {
        lock(&self.inner.consumers).remove(&consumer_id);
    }

    /// Queue a fire-and-forget command. Returns false while disconnected.
    pub(crate) fn send_command(&self, command: ClientCommand) -> bool {
        let link = lock(&self.inner.link);
        match &link.outbound {
            Some(outbound) => outbound.send(command).is_ok(),
            None => false,
        }
    }

    /// Send a request and block until the broker answers or the operation
    /// timeout passes. Waits for a reconnect in progress.
    pub(crate) fn request<F>(&self, build: F) -> Result<Response>
    where
        F: FnOnce(u64) -> ClientCommand,
    {
        if on_io_thread() {
            return Err(Error::InvalidOperation(
                "blocking request issued from an I/O thread".to_string(),
            ));
        }

        let deadline = Instant::now() + self.operation_timeout();
        {
            let mut link = lock(&self.inner.link);
            loop {
                if link.closed {
                    return Err(Error::AlreadyClosed("connection"));
                }
                if link.outbound.is_some() {
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::Timeout);
                }
                link = wait_timeout(&self.inner.link_changed, link, deadline - now);
            }
        }

        let (tx, rx) = sync_channel(1);
        let request_id = self.dispatch_request(
            build,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )?;

        match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                lock(&self.inner.pending).remove(&request_id);
                Err(Error::Timeout)
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::ConnectionLost),
        }
    }

    /// Non-blocking variant of [`Connection::request`] for use on the runtime.
    /// Fails immediately while disconnected.
    pub(crate) async fn request_async<F>(&self, build: F) -> Result<Response>
    where
        F: FnOnce(u64) -> ClientCommand,
    {
        let (tx, rx) = oneshot::channel();
        let request_id = self.dispatch_request(
            build,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )?;

        match tokio::time::timeout(self.operation_timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionLost),
            Err(_) => {
                lock(&self.inner.pending).remove(&request_id);
                Err(Error::Timeout)
            }
        }
    }

    fn dispatch_request<F>(&self, build: F, complete: PendingRequest) -> Result<u64>
    where
        F: FnOnce(u64) -> ClientCommand,
    {
        let link = lock(&self.inner.link);
        if link.closed {
            return Err(Error::AlreadyClosed("connection"));
        }
        let Some(outbound) = &link.outbound else {
            return Err(Error::ConnectionLost);
        };

        let request_id = self.inner.request_ids.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.pending).insert(request_id, complete);
        if outbound.send(build(request_id)).is_err() {
            lock(&self.inner.pending).remove(&request_id);
            return Err(Error::ConnectionLost);
        }
        Ok(request_id)
    }

    /// Stop the connection. Outstanding requests fail; queued commands are
    /// still written before the socket closes. Idempotent.
    pub(crate) fn close(&self) {
        let outbound = {
            let mut link = lock(&self.inner.link);
            if link.closed {
                return;
            }
            link.closed = true;
            link.outbound.take()
        };
        drop(outbound);
        self.inner.shutdown.notify_one();
        self.inner.link_changed.notify_all();
        self.inner.fail_pending(Error::AlreadyClosed("connection"));
        debug!(url = %self.inner.url, "connection closed");
    }
}

impl ConnectionInner {
    fn fail_pending(&self, error: Error) {
        let pending: Vec<_> = lock(&self.pending).drain().map(|(_, p)| p).collect();
        for complete in pending {
            complete(Err(error.clone()));
        }
    }

    fn complete_request(&self, request_id: u64, result: Result<Response>) {
        let pending = lock(&self.pending).remove(&request_id);
        match pending {
            Some(complete) => complete(result),
            None => debug!(request_id, "response for unknown or expired request"),
        }
    }

    fn producer(&self, producer_id: u64) -> Option<Arc<dyn ProducerEvents>> {
        lock(&self.producers).get(&producer_id).and_then(Weak::upgrade)
    }

    fn consumer(&self, consumer_id: u64) -> Option<Arc<dyn ConsumerEvents>> {
        lock(&self.consumers).get(&consumer_id).and_then(Weak::upgrade)
    }

    fn live_producers(&self) -> Vec<Arc<dyn ProducerEvents>> {
        let mut producers = lock(&self.producers);
        producers.retain(|_, handler| handler.strong_count() > 0);
        producers.values().filter_map(Weak::upgrade).collect()
    }

    fn live_consumers(&self) -> Vec<Arc<dyn ConsumerEvents>> {
        let mut consumers = lock(&self.consumers);
        consumers.retain(|_, handler| handler.strong_count() > 0);
        consumers.values().filter_map(Weak::upgrade).collect()
    }

    /// Route one broker command. Returns false when the connection must drop.
    fn handle_server_command(&self, command: ServerCommand) -> bool {
        match command {
            ServerCommand::Success { request_id } => {
                self.complete_request(request_id, Ok(Response::Success));
            }
            ServerCommand::ProducerSuccess {
                request_id,
                producer_name,
            } => {
                self.complete_request(request_id, Ok(Response::ProducerSuccess { producer_name }));
            }
            ServerCommand::Error {
                request_id: Some(request_id),
                code,
                message,
            } => {
                self.complete_request(request_id, Err(Error::from_server(code, message)));
            }
            ServerCommand::Error {
                request_id: None,
                code,
                message,
            } => {
                error!(url = %self.url, %code, "broker dropped the connection: {}", message);
                return false;
            }
            ServerCommand::SendReceipt {
                producer_id,
                sequence_id,
                highest_sequence_id,
                message_id,
            } => match self.producer(producer_id) {
                Some(producer) => producer.on_receipt(sequence_id, highest_sequence_id, message_id),
                None => debug!(producer_id, sequence_id, "receipt for unknown producer"),
            },
            ServerCommand::SendError {
                producer_id,
                sequence_id,
                code,
                message,
            } => match self.producer(producer_id) {
                Some(producer) => producer.on_send_error(sequence_id, code, message),
                None => debug!(producer_id, sequence_id, "send error for unknown producer"),
            },
            ServerCommand::Message {
                consumer_id,
                message_id,
                redelivery_count,
                metadata,
                payload,
                checksum,
            } => match self.consumer(consumer_id) {
                Some(consumer) => {
                    consumer.on_message(message_id, redelivery_count, metadata, payload, checksum)
                }
                None => debug!(consumer_id, %message_id, "message for unknown consumer"),
            },
            ServerCommand::Connected { .. } => {
                warn!(url = %self.url, "unexpected connected command");
            }
            ServerCommand::Ping | ServerCommand::Pong => {}
        }
        true
    }

    fn on_disconnected(&self) {
        {
            let mut link = lock(&self.link);
            link.outbound = None;
        }
        self.fail_pending(Error::ConnectionLost);
        for producer in self.live_producers() {
            producer.on_connection_lost();
        }
        for consumer in self.live_consumers() {
            consumer.on_connection_lost();
        }
    }
}

async fn supervise(inner: Arc<ConnectionInner>, ready: SyncSender<Result<()>>) {
    let mut ready = Some(ready);
    let mut backoff = Backoff::new(inner.config.initial_backoff(), inner.config.max_backoff());

    loop {
        let established = tokio::select! {
            result = establish(&inner) => result,
            _ = inner.shutdown.notified() => break,
        };

        match established {
            Ok(ws) => {
                backoff.reset();
                let (tx, rx) = mpsc::unbounded_channel();
                {
                    let mut link = lock(&inner.link);
                    if link.closed {
                        break;
                    }
                    link.outbound = Some(tx);
                }
                inner.epoch.fetch_add(1, Ordering::SeqCst);
                inner.link_changed.notify_all();

                match ready.take() {
                    Some(ready) => {
                        let _ = ready.send(Ok(()));
                    }
                    None => {
                        info!(url = %inner.url, "reconnected to broker");
                        for producer in inner.live_producers() {
                            producer.on_reconnected();
                        }
                        for consumer in inner.live_consumers() {
                            consumer.on_reconnected();
                        }
                    }
                }

                run_loop(&inner, ws, rx).await;
                inner.on_disconnected();
                if lock(&inner.link).closed {
                    break;
                }
                warn!(url = %inner.url, "connection lost, reconnecting");
            }
            Err(e) => {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(e));
                    lock(&inner.link).closed = true;
                    return;
                }
                warn!(url = %inner.url, "reconnect attempt failed: {}", e);
            }
        }

        let delay = backoff.next();
        debug!(url = %inner.url, ?delay, "waiting before reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = inner.shutdown.notified() => break,
        }
    }

    inner.fail_pending(Error::AlreadyClosed("connection"));
    inner.link_changed.notify_all();
}

async fn establish(inner: &ConnectionInner) -> Result<WsStream> {
    let connect_timeout = inner.config.connection_timeout();
    let (mut ws, _) = tokio::time::timeout(connect_timeout, connect_async(inner.url.as_str()))
        .await
        .map_err(|_| Error::Connect(format!("timed out connecting to {}", inner.url)))?
        .map_err(|e| Error::Connect(format!("failed to connect to {}: {}", inner.url, e)))?;

    let connect = ClientCommand::Connect {
        client_version: CLIENT_VERSION.to_string(),
        auth_token: inner.config.auth_token().map(str::to_string),
    };
    let frame = encode(&connect).map_err(|e| Error::Connect(e.to_string()))?;
    ws.send(frame)
        .await
        .map_err(|e| Error::Connect(format!("handshake with {} failed: {}", inner.url, e)))?;

    let deadline = tokio::time::Instant::now() + connect_timeout;
    loop {
        let frame = match tokio::time::timeout_at(deadline, ws.next()).await {
            Err(_) => return Err(Error::Connect(format!("handshake with {} timed out", inner.url))),
            Ok(None) => {
                return Err(Error::Connect(format!("{} closed during handshake", inner.url)));
            }
            Ok(Some(Err(e))) => {
                return Err(Error::Connect(format!("handshake with {} failed: {}", inner.url, e)));
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match decode::<ServerCommand>(&frame) {
            Ok(Some(ServerCommand::Connected { server_version })) => {
                info!(url = %inner.url, %server_version, "connected to broker");
                return Ok(ws);
            }
            Ok(Some(ServerCommand::Error { code, message, .. })) => {
                return Err(match Error::from_server(code, message) {
                    e @ Error::Connect(_) => e,
                    other => Error::Connect(other.to_string()),
                });
            }
            Ok(Some(other)) => debug!(?other, "ignoring command during handshake"),
            Ok(None) => {}
            Err(e) => return Err(Error::Connect(format!("bad handshake frame: {e}"))),
        }
    }
}

async fn run_loop(
    inner: &ConnectionInner,
    ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<ClientCommand>,
) {
    let (mut sink, mut stream) = ws.split();
    let period = inner.config.keep_alive_interval().max(Duration::from_secs(1));
    let mut keep_alive = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            command = outbound.recv() => {
                let Some(command) = command else {
                    let _ = sink.close().await;
                    return;
                };
                let frame = match encode(&command) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("failed to encode command: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(frame).await {
                    warn!(url = %inner.url, "write failed: {}", e);
                    return;
                }
            }
            frame = stream.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        warn!(url = %inner.url, "read failed: {}", e);
                        return;
                    }
                    None => {
                        debug!(url = %inner.url, "broker closed the stream");
                        return;
                    }
                };
                awaiting_pong = false;
                if frame.is_close() {
                    return;
                }
                match decode::<ServerCommand>(&frame) {
                    Ok(Some(ServerCommand::Ping)) => {
                        let pong = encode(&ClientCommand::Pong);
                        if let Ok(pong) = pong {
                            if sink.send(pong).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Some(command)) => {
                        if !inner.handle_server_command(command) {
                            let _ = sink.close().await;
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(url = %inner.url, "dropping malformed frame: {}", e),
                }
            }
            _ = keep_alive.tick() => {
                if awaiting_pong {
                    warn!(url = %inner.url, "keep-alive timed out");
                    return;
                }
                let ping = match encode(&ClientCommand::Ping) {
                    Ok(ping) => ping,
                    Err(_) => continue,
                };
                if sink.send(ping).await.is_err() {
                    return;
                }
                awaiting_pong = true;
            }
            _ = inner.shutdown.notified() => {
                while let Ok(command) = outbound.try_recv() {
                    if let Ok(frame) = encode(&command) {
                        let _ = sink.send(frame).await;
                    }
                }
                let _ = sink.close().await;
                return;
            }
        }
    }
}

/// Backoff for re-registering producers and consumers on a fresh transport.
/// The mandatory stop lands one attempt right before the operation timeout.
fn retry_backoff(config: &ClientConfig) -> Backoff {
    Backoff::new(config.initial_backoff(), config.max_backoff())
        .with_mandatory_stop(config.operation_timeout())
}

#[derive(Debug, Clone, Copy)]
struct FailedAttempts {
    last_failure: Instant,
    count: u32,
}

/// Connections shared by every producer and consumer of a client, keyed by
/// broker URL.
pub(crate) struct ConnectionPool {
    handle: Handle,
    config: ClientConfig,
    connections: Mutex<HashMap<String, Connection>>,
    failures: Mutex<HashMap<String, FailedAttempts>>,
}

impl ConnectionPool {
    pub(crate) fn new(handle: Handle, config: ClientConfig) -> Self {
        Self {
            handle,
            config,
            connections: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Return the live connection to `url`, opening one if needed.
    pub(crate) fn get_connection(&self, url: &ServiceUrl) -> Result<Connection> {
        let key = url.websocket_url();
        let mut connections = lock(&self.connections);
        if let Some(connection) = connections.get(key) {
            if !connection.is_closed() {
                return Ok(connection.clone());
            }
            connections.remove(key);
        }

        if let Some(failed) = lock(&self.failures).get(key).copied() {
            if Backoff::should_backoff(failed.last_failure, failed.count) {
                return Err(Error::Connect(format!(
                    "backing off from {key} after {} failed attempts",
                    failed.count
                )));
            }
        }

        debug!(url = %key, "creating connection");
        match Connection::connect(&self.handle, key, &self.config) {
            Ok(connection) => {
                lock(&self.failures).remove(key);
                connections.insert(key.to_string(), connection.clone());
                Ok(connection)
            }
            Err(e) => {
                let mut failures = lock(&self.failures);
                let entry = failures.entry(key.to_string()).or_insert(FailedAttempts {
                    last_failure: Instant::now(),
                    count: 0,
                });
                entry.last_failure = Instant::now();
                entry.count += 1;
                warn!(url = %key, attempts = entry.count, "failed to connect: {}", e);
                Err(e)
            }
        }
    }

    pub(crate) fn close_all(&self) {
        let connections: Vec<_> = lock(&self.connections).drain().map(|(_, c)| c).collect();
        for connection in connections {
            connection.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_refuses_while_backing_off() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let mut config = ClientConfig::default();
        config.set_connection_timeout(Duration::from_millis(500));
        let pool = ConnectionPool::new(runtime.handle().clone(), config);

        // Nothing listens on port 1.
        let url = ServiceUrl::parse("pulsar://127.0.0.1:1/").unwrap();
        let first = pool.get_connection(&url).err().unwrap();
        assert!(matches!(first, Error::Connect(_)));

        let second = pool.get_connection(&url).err().unwrap();
        match second {
            Error::Connect(message) => assert!(message.contains("backing off")),
            other => panic!("unexpected error: {other:?}"),
        }
        pool.close_all();
    }

    #[test]
    fn retry_backoff_stops_at_operation_timeout() {
        let mut config = ClientConfig::default();
        config
            .set_backoff(Duration::from_millis(100), Duration::from_secs(60))
            .set_operation_timeout(Duration::from_millis(250));
        let mut backoff = retry_backoff(&config);

        let start = Instant::now();
        assert_eq!(backoff.next_at(start), Duration::from_millis(100));
        // 100ms in, a 200ms delay would overshoot the 250ms timeout.
        assert_eq!(
            backoff.next_at(start + Duration::from_millis(100)),
            Duration::from_millis(150)
        );
        assert_eq!(
            backoff.next_at(start + Duration::from_millis(250)),
            Duration::from_millis(400)
        );
    }
}
