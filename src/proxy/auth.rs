//! Proxy authentication gate
//!
//! Handles Basic and Bearer authentication of inbound proxy requests.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hyper::header::PROXY_AUTHORIZATION;
use tracing::{debug, warn};

use crate::error::{JunctionError, Result};
use crate::proxy::inbound::message::ParsedRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Basic,
    Bearer,
}

impl AuthScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthScheme::Basic => "Basic",
            AuthScheme::Bearer => "Bearer",
        }
    }
}

/// Proxy authentication handler, built once per listener
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ProxyAuth {
    #[default]
    Disabled,
    Required {
        scheme: AuthScheme,
        /// Exact `Proxy-Authorization` value a client must send
        expected: String,
    },
}

impl ProxyAuth {
    /// Build from listener parameters (`auth_type`, `user`, `password`, `token`)
    pub fn from_params(params: &BTreeMap<String, String>) -> Result<Self> {
        let get = |key: &str| params.get(key).map(String::as_str).filter(|v| !v.is_empty());

        let auth_type = match get("auth_type") {
            Some(t) => t.to_lowercase(),
            None => return Ok(ProxyAuth::Disabled),
        };

        match auth_type.as_str() {
            "basic" => {
                let user = get("user").ok_or_else(|| {
                    JunctionError::InvalidConfig("basic auth requires 'user'".to_string())
                })?;
                let password = get("password").ok_or_else(|| {
                    JunctionError::InvalidConfig("basic auth requires 'password'".to_string())
                })?;
                Ok(Self::basic(user, password))
            }
            "bearer" => {
                let token = get("token").ok_or_else(|| {
                    JunctionError::InvalidConfig("bearer auth requires 'token'".to_string())
                })?;
                Ok(Self::bearer(token))
            }
            other => Err(JunctionError::InvalidConfig(format!(
                "unsupported auth_type: {}",
                other
            ))),
        }
    }

    pub fn basic(user: &str, password: &str) -> Self {
        let credentials = BASE64.encode(format!("{}:{}", user, password));
        ProxyAuth::Required {
            scheme: AuthScheme::Basic,
            expected: format!("Basic {}", credentials),
        }
    }

    pub fn bearer(token: &str) -> Self {
        ProxyAuth::Required {
            scheme: AuthScheme::Bearer,
            expected: format!("Bearer {}", token),
        }
    }

    /// Check if authentication is enabled
    pub fn is_enabled(&self) -> bool {
        !matches!(self, ProxyAuth::Disabled)
    }

    /// Validate the Proxy-Authorization header
    pub fn validate(&self, req: &ParsedRequest) -> Result<()> {
        let expected = match self {
            ProxyAuth::Disabled => return Ok(()),
            ProxyAuth::Required { expected, .. } => expected,
        };

        let provided = req
            .header(PROXY_AUTHORIZATION.as_str())
            .ok_or(JunctionError::AuthenticationFailed)?;

        if provided == expected {
            debug!("Proxy authentication successful");
            Ok(())
        } else {
            warn!("Proxy authentication failed");
            Err(JunctionError::AuthenticationFailed)
        }
    }

    /// Raw `407 Proxy Authentication Required` response
    pub fn challenge_response(&self, version: &str) -> Vec<u8> {
        let scheme = match self {
            ProxyAuth::Required { scheme, .. } => scheme.as_str(),
            ProxyAuth::Disabled => AuthScheme::Basic.as_str(),
        };
        format!(
            "{} 407 Proxy Authentication Required\r\nProxy-Authenticate: {} realm=\"Proxy\"\r\nContent-Length: 0\r\n\r\n",
            version, scheme
        )
        .into_bytes()
    }
}
