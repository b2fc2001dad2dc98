//! Broker URL resolution
//!
//! `pulsar://host:port/` and `ws://` address a plaintext broker,
//! `pulsar+ssl://` and `wss://` an encrypted one. The resolved form is always a
//! WebSocket URL.

use std::fmt;

use url::Url;

use crate::error::{Error, Result};

pub const DEFAULT_PORT: u16 = 6650;
pub const DEFAULT_TLS_PORT: u16 = 6651;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceUrl {
    url: Url,
    tls: bool,
}

impl ServiceUrl {
    pub fn parse(raw: &str) -> Result<Self> {
        let parsed = Url::parse(raw.trim())
            .map_err(|e| Error::InvalidConfiguration(format!("invalid service url '{raw}': {e}")))?;

        let tls = match parsed.scheme() {
            "pulsar" | "ws" => false,
            "pulsar+ssl" | "wss" => true,
            other => {
                return Err(Error::InvalidConfiguration(format!(
                    "unsupported scheme '{other}' in '{raw}'"
                )));
            }
        };
        let host = parsed
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| Error::InvalidConfiguration(format!("missing host in '{raw}'")))?;
        let explicit_port = match parsed.scheme() {
            "ws" | "wss" => parsed.port_or_known_default(),
            _ => parsed.port(),
        };
        let port = explicit_port.unwrap_or(if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT });
        let scheme = if tls { "wss" } else { "ws" };

        let url = Url::parse(&format!("{scheme}://{host}:{port}{}", parsed.path()))
            .map_err(|e| Error::InvalidConfiguration(format!("invalid service url '{raw}': {e}")))?;
        Ok(Self { url, tls })
    }

    pub fn websocket_url(&self) -> &str {
        self.url.as_str()
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.url.port_or_known_default().unwrap_or(DEFAULT_PORT)
    }
}

impl fmt::Display for ServiceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulsar_scheme_maps_to_websocket() {
        let url = ServiceUrl::parse("pulsar://localhost:6650/").unwrap();
        assert_eq!(url.websocket_url(), "ws://localhost:6650/");
        assert!(!url.is_tls());
        assert_eq!(url.host(), "localhost");
        assert_eq!(url.port(), 6650);
    }

    #[test]
    fn default_ports() {
        assert_eq!(ServiceUrl::parse("pulsar://broker").unwrap().port(), 6650);
        let tls = ServiceUrl::parse("pulsar+ssl://broker/").unwrap();
        assert!(tls.is_tls());
        assert_eq!(tls.websocket_url(), "wss://broker:6651/");
    }

    #[test]
    fn websocket_urls_pass_through() {
        let url = ServiceUrl::parse("ws://127.0.0.1:40123").unwrap();
        assert_eq!(url.websocket_url(), "ws://127.0.0.1:40123/");
    }

    #[test]
    fn rejects_unknown_schemes() {
        assert!(matches!(
            ServiceUrl::parse("http://localhost:6650/"),
            Err(Error::InvalidConfiguration(_))
        ));
        assert!(ServiceUrl::parse("not a url").is_err());
    }
}
