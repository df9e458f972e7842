use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Inbound protocol tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" => Some(Protocol::Http),
            "https" => Some(Protocol::Https),
            _ => None,
        }
    }

    /// Port used when the request target does not carry one
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Http => 80,
            Protocol::Https => 443,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Transport network of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
        }
    }
}

/// Canonical routing request produced by an inbound handshake.
///
/// Immutable once built. The country code is attached afterwards by
/// consuming the value through [`Request::with_country_code`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Request {
    network: Network,
    protocol: Protocol,
    domain: String,
    ip: Option<IpAddr>,
    port: u16,
    uri: String,
    country_code: Option<String>,
    conn_id: u64,
}

impl Request {
    /// Build a request for `host`, falling back to the protocol default port.
    ///
    /// `host` may be a domain name or an IP literal (IPv6 with or without brackets).
    pub fn new(
        protocol: Protocol,
        host: &str,
        port: Option<u16>,
        uri: impl Into<String>,
        conn_id: u64,
    ) -> Self {
        let domain = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host)
            .to_string();
        let ip = domain.parse::<IpAddr>().ok();

        Self {
            network: Network::Tcp,
            protocol,
            domain,
            ip,
            port: port.unwrap_or_else(|| protocol.default_port()),
            uri: uri.into(),
            country_code: None,
            conn_id,
        }
    }

    pub fn with_country_code(mut self, code: impl Into<String>) -> Self {
        self.country_code = Some(code.into());
        self
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn country_code(&self) -> Option<&str> {
        self.country_code.as_deref()
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// `host:port` form suitable for dialing, bracketing IPv6 literals
    pub fn host_port(&self) -> String {
        match self.ip {
            Some(IpAddr::V6(_)) => format!("[{}]:{}", self.domain, self.port),
            _ => format!("{}:{}", self.domain, self.port),
        }
    }
}
