//! WebSocket server
//!
//! Accepts TCP/WebSocket connections and translates protocol commands into
//! broker operations. Per connection:
//! - a `Session` is registered with the broker (refused over `max_connections`)
//! - a write loop forwards the session's outbound channel to the socket and
//!   closes the socket once the session is dropped
//! - the read loop enforces connect (and token authentication when a secret is
//!   configured) before any other command
//! - cleanup runs exactly once, whichever side ends first

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use courier_config::{ServerSettings, Settings};
use courier_transport::{ClientCommand, SERVER_VERSION, ServerCommand, ServerError, WsMessage};
use courier_utils::lock;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};

use crate::auth::validate_token;
use crate::engine::Broker;
use crate::session::Session;

pub struct BrokerServer {
    listener: TcpListener,
    broker: Arc<Mutex<Broker>>,
    auth_secret: Option<Arc<str>>,
}

impl BrokerServer {
    /// Bind the listener. Port `0` picks an ephemeral port.
    pub async fn bind(
        addr: &str,
        broker: Arc<Mutex<Broker>>,
        settings: &ServerSettings,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            broker,
            auth_secret: settings.auth_secret.as_deref().map(Arc::from),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn broker(&self) -> Arc<Mutex<Broker>> {
        self.broker.clone()
    }

    /// Accept connections until the listener fails.
    pub async fn run(self) {
        match self.listener.local_addr() {
            Ok(addr) => info!("Broker listening on ws://{addr}"),
            Err(e) => warn!("Broker listening on unknown address: {e}"),
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let broker = self.broker.clone();
                    let auth_secret = self.auth_secret.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, peer, broker, auth_secret).await;
                    });
                }
                Err(e) => {
                    error!("Accept failed: {e}");
                    break;
                }
            }
        }
    }
}

/// Run a standalone broker from settings until the listener fails.
pub async fn start_websocket_server(settings: Settings) -> std::io::Result<()> {
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let broker = Arc::new(Mutex::new(Broker::new(settings.broker.clone())));
    tokio::spawn(Broker::start_expiry_loop(broker.clone()));

    let server = BrokerServer::bind(&addr, broker, &settings.server).await?;
    server.run().await;
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    broker: Arc<Mutex<Broker>>,
    auth_secret: Option<Arc<str>>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {peer} failed: {e}");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    let session = Session::new(tx);
    let session_id = session.id.clone();
    let registered = lock(&broker).register_session(session);
    if let Err(session) = registered {
        warn!("Refusing {peer}: connection limit reached");
        session.send(&ServerCommand::Error {
            request_id: None,
            code: ServerError::TooManyConnections,
            message: "Too many connections".to_string(),
        });
        drop(session);
        while let Some(msg) = rx.recv().await {
            let _ = ws_sender.send(msg).await;
        }
        let _ = ws_sender.close().await;
        return;
    }
    debug!("Session {session_id} opened from {peer}");

    let cleanup_called = Arc::new(AtomicBool::new(false));
    let do_cleanup = {
        let broker = broker.clone();
        let session_id = session_id.clone();
        let cleanup_called = cleanup_called.clone();
        move || {
            if !cleanup_called.swap(true, Ordering::SeqCst) {
                lock(&broker).cleanup_session(&session_id);
            }
        }
    };

    {
        let session_id = session_id.clone();
        let do_cleanup = do_cleanup.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = ws_sender.send(msg).await {
                    debug!("Failed to write to {session_id}: {e}");
                    break;
                }
            }
            let _ = ws_sender.send(WsMessage::Close(None)).await;
            let _ = ws_sender.close().await;
            do_cleanup();
            debug!("Write loop closed for {session_id}");
        });
    }

    while let Some(Ok(frame)) = ws_receiver.next().await {
        let command = match courier_transport::decode::<ClientCommand>(&frame) {
            Ok(Some(command)) => command,
            Ok(None) => {
                if frame.is_close() {
                    break;
                }
                continue;
            }
            Err(e) => {
                warn!("Invalid command from {session_id}: {e}");
                continue;
            }
        };

        let mut broker_lock = lock(&broker);
        let authenticated = broker_lock.is_authenticated(&session_id);
        match command {
            ClientCommand::Connect {
                client_version,
                auth_token,
            } if !authenticated => {
                let verdict = match (&auth_secret, auth_token) {
                    (None, _) => Ok(None),
                    (Some(secret), Some(token)) => validate_token(secret, &token)
                        .map(|claims| Some(claims.sub))
                        .map_err(|e| e.to_string()),
                    (Some(_), None) => Err("missing token".to_string()),
                };
                match verdict {
                    Ok(subject) => {
                        broker_lock.mark_authenticated(&session_id);
                        info!(
                            "{session_id} connected ({client_version}) as {}",
                            subject.as_deref().unwrap_or("anonymous")
                        );
                        broker_lock.reply(
                            &session_id,
                            &ServerCommand::Connected {
                                server_version: SERVER_VERSION.to_string(),
                            },
                        );
                    }
                    Err(reason) => {
                        warn!("{session_id} authentication failed: {reason}");
                        broker_lock.reply(
                            &session_id,
                            &ServerCommand::Error {
                                request_id: None,
                                code: ServerError::AuthenticationError,
                                message: format!("Authentication failed: {reason}"),
                            },
                        );
                        broker_lock.cleanup_session(&session_id);
                        break;
                    }
                }
            }
            _ if !authenticated => {
                warn!("{session_id} sent a command before connecting");
                broker_lock.reply(
                    &session_id,
                    &ServerCommand::Error {
                        request_id: None,
                        code: ServerError::AuthenticationError,
                        message: "must connect first".to_string(),
                    },
                );
                broker_lock.cleanup_session(&session_id);
                break;
            }
            command => broker_lock.handle_command(&session_id, command),
        }
    }

    do_cleanup();
}
