use serde::Deserialize;

/// Top-level settings for the standalone broker and for clients built from
/// configuration files.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub client: ClientSettings,
}

/// Where the standalone broker listens and how it authenticates.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// HMAC secret for token authentication. `None` disables authentication.
    pub auth_secret: Option<String>,
}

/// Operational limits of the standalone broker.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub max_connections: usize,
    /// Retained entries older than this are dropped. `0` keeps them forever.
    pub message_ttl_secs: u64,
    pub max_messages_per_topic: usize,
}

/// Client-side defaults.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ClientSettings {
    pub service_url: String,
    pub operation_timeout_secs: u64,
    pub connection_timeout_ms: u64,
    pub io_threads: usize,
    pub keep_alive_secs: u64,
    pub auth_token: Option<String>,
}

/// Partially specified settings as read from files and the environment.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub client: Option<PartialClientSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub auth_secret: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub max_connections: Option<usize>,
    pub message_ttl_secs: Option<u64>,
    pub max_messages_per_topic: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialClientSettings {
    pub service_url: Option<String>,
    pub operation_timeout_secs: Option<u64>,
    pub connection_timeout_ms: Option<u64>,
    pub io_threads: Option<usize>,
    pub keep_alive_secs: Option<u64>,
    pub auth_token: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            broker: BrokerSettings::default(),
            client: ClientSettings::default(),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6650,
            auth_secret: None,
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            message_ttl_secs: 3600,
            max_messages_per_topic: 10_000,
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            service_url: "pulsar://127.0.0.1:6650/".to_string(),
            operation_timeout_secs: 30,
            connection_timeout_ms: 10_000,
            io_threads: 1,
            keep_alive_secs: 30,
            auth_token: None,
        }
    }
}

impl PartialSettings {
    /// Fill every missing value from `defaults`.
    pub fn merge_onto(self, defaults: Settings) -> Settings {
        let server = self.server.unwrap_or_default();
        let broker = self.broker.unwrap_or_default();
        let client = self.client.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(defaults.server.host),
                port: server.port.unwrap_or(defaults.server.port),
                auth_secret: server
                    .auth_secret
                    .filter(|secret| !secret.is_empty())
                    .or(defaults.server.auth_secret),
            },
            broker: BrokerSettings {
                max_connections: broker
                    .max_connections
                    .unwrap_or(defaults.broker.max_connections),
                message_ttl_secs: broker
                    .message_ttl_secs
                    .unwrap_or(defaults.broker.message_ttl_secs),
                max_messages_per_topic: broker
                    .max_messages_per_topic
                    .unwrap_or(defaults.broker.max_messages_per_topic),
            },
            client: ClientSettings {
                service_url: client.service_url.unwrap_or(defaults.client.service_url),
                operation_timeout_secs: client
                    .operation_timeout_secs
                    .unwrap_or(defaults.client.operation_timeout_secs),
                connection_timeout_ms: client
                    .connection_timeout_ms
                    .unwrap_or(defaults.client.connection_timeout_ms),
                io_threads: client.io_threads.unwrap_or(defaults.client.io_threads),
                keep_alive_secs: client
                    .keep_alive_secs
                    .unwrap_or(defaults.client.keep_alive_secs),
                auth_token: client
                    .auth_token
                    .filter(|token| !token.is_empty())
                    .or(defaults.client.auth_token),
            },
        }
    }
}
