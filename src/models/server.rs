use std::collections::BTreeMap;

use serde::Serialize;

/// Name of the built-in server that connects straight to the request target
pub const DIRECT: &str = "DIRECT";
/// Name of the built-in server that refuses every request
pub const REJECT: &str = "REJECT";

/// Concrete upstream server. Immutable after load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Server {
    pub name: String,
    /// Outbound protocol type, the key into the dial registry
    pub typ: String,
    pub addr: String,
    pub port: u16,
    #[serde(skip_serializing)]
    pub params: BTreeMap<String, String>,
}

impl Server {
    pub fn new(
        name: impl Into<String>,
        typ: impl Into<String>,
        addr: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            typ: typ.into(),
            addr: addr.into(),
            port,
            params: BTreeMap::new(),
        }
    }

    pub fn with_params(mut self, params: BTreeMap<String, String>) -> Self {
        self.params = params;
        self
    }

    pub fn direct() -> Self {
        Self::new(DIRECT, "direct", "", 0)
    }

    pub fn reject() -> Self {
        Self::new(REJECT, "reject", "", 0)
    }

    /// `addr:port`, bracketing bare IPv6 literals
    pub fn address(&self) -> String {
        if self.addr.contains(':') && !self.addr.starts_with('[') {
            format!("[{}]:{}", self.addr, self.port)
        } else {
            format!("{}:{}", self.addr, self.port)
        }
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_servers() {
        assert_eq!(Server::direct().typ, "direct");
        assert_eq!(Server::reject().name, REJECT);
    }

    #[test]
    fn test_address_formatting() {
        assert_eq!(
            Server::new("JP1", "socks5", "jp.remote.com", 1080).address(),
            "jp.remote.com:1080"
        );
        assert_eq!(Server::new("v6", "http", "::1", 3128).address(), "[::1]:3128");
    }

    #[test]
    fn test_empty_params_are_absent() {
        let mut params = BTreeMap::new();
        params.insert("user".to_string(), String::new());
        params.insert("password".to_string(), "secret".to_string());
        let server = Server::new("US1", "http", "us.remote.com", 8080).with_params(params);

        assert_eq!(server.param("user"), None);
        assert_eq!(server.param("password"), Some("secret"));
    }
}
