//! CLI for courier
//!
//! Subcommands:
//! - `standalone`: run the in-memory broker
//! - `produce`: publish messages to a topic
//! - `consume`: receive and acknowledge messages from a subscription
//! - `token`: mint an authentication token for a broker secret

use std::time::Duration;

use clap::Parser;
use courier_broker::auth::issue_token;
use courier_broker::start_websocket_server;
use courier_client::{Client, ClientConfig, Error as ClientError};
use courier_config::load_config;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "courier")]
enum Command {
    /// Start the standalone broker
    Standalone,
    /// Publish messages
    Produce {
        /// Broker URL (defaults to `client.service_url` from the settings)
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        topic: String,
        /// Message payload
        #[arg(short, long)]
        message: String,
        /// How many copies to send
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
    },
    /// Receive messages
    Consume {
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        topic: String,
        #[arg(long, default_value = "courier-cli")]
        subscription: String,
        /// Stop after this many messages (0 runs until no message arrives for 5s)
        #[arg(short = 'n', long, default_value_t = 0)]
        count: usize,
    },
    /// Issue a token accepted by a broker configured with the same secret
    Token {
        #[arg(long)]
        subject: String,
        /// Defaults to `server.auth_secret` from the settings
        #[arg(long)]
        secret: Option<String>,
        #[arg(long, default_value_t = 24)]
        ttl_hours: i64,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    courier_utils::logging::init("info");

    let cmd = Command::parse();

    let result = match cmd {
        Command::Standalone => run_standalone().await,
        Command::Produce {
            url,
            topic,
            message,
            count,
        } => blocking(move || run_produce(url, &topic, &message, count)).await,
        Command::Consume {
            url,
            topic,
            subscription,
            count,
        } => blocking(move || run_consume(url, &topic, &subscription, count)).await,
        Command::Token {
            subject,
            secret,
            ttl_hours,
        } => run_token(&subject, secret, ttl_hours),
    };

    if let Err(e) = result {
        error!("courier failed: {}", e);
        std::process::exit(1);
    }
}

type CliResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// The client API blocks; keep it off the async workers.
async fn blocking<F>(f: F) -> CliResult
where
    F: FnOnce() -> CliResult + Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

async fn run_standalone() -> CliResult {
    let settings = load_config()?;

    tokio::select! {
        result = start_websocket_server(settings) => {
            result?;
            error!("Broker exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }
    Ok(())
}

fn connect(url: Option<String>) -> Result<Client, Box<dyn std::error::Error + Send + Sync>> {
    let settings = load_config()?;
    let config = ClientConfig::from_settings(&settings.client);
    let url = url.unwrap_or(settings.client.service_url);
    Ok(Client::with_config(&url, config)?)
}

fn run_produce(url: Option<String>, topic: &str, message: &str, count: usize) -> CliResult {
    let client = connect(url)?;
    let producer = client.create_producer(topic)?;
    for _ in 0..count {
        let id = producer.send(message)?;
        info!("Published {} to {}", id, topic);
    }
    client.close()?;
    Ok(())
}

fn run_consume(url: Option<String>, topic: &str, subscription: &str, count: usize) -> CliResult {
    let client = connect(url)?;
    let consumer = client.subscribe(topic, subscription)?;
    let mut received = 0;
    while count == 0 || received < count {
        let message = match consumer.receive_timeout(Duration::from_secs(5)) {
            Ok(message) => message,
            Err(ClientError::Timeout) if count == 0 => break,
            Err(ClientError::Timeout) => continue,
            Err(e) => return Err(e.into()),
        };
        info!(
            "Received {} from {}: {}",
            message.message_id(),
            message.topic(),
            String::from_utf8_lossy(message.data())
        );
        consumer.acknowledge(&message)?;
        received += 1;
    }
    client.close()?;
    Ok(())
}

fn run_token(subject: &str, secret: Option<String>, ttl_hours: i64) -> CliResult {
    let secret = match secret {
        Some(secret) => secret,
        None => load_config()?
            .server
            .auth_secret
            .ok_or("no --secret given and server.auth_secret is not set")?,
    };
    let token = issue_token(&secret, subject, chrono::Duration::hours(ttl_hours))?;
    println!("{token}");
    Ok(())
}
