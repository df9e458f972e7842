//! Routing profile document
//!
//! The profile is the on-disk description of listeners, servers, server
//! groups and rules. It is plain data: building the routing graph from it
//! happens in [`crate::proxy::Router::from_profile`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{JunctionError, Result};

pub type Params = BTreeMap<String, String>;

/// Rule parameter naming the rule target
pub const RULE_PARAM_PROXY: &str = "proxy";
/// Rule parameter holding a free-form comment
pub const RULE_PARAM_COMMENT: &str = "comment";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Profile {
    pub general: General,
    pub listener: Vec<ListenerConfig>,
    pub server: BTreeMap<String, ServerConfig>,
    pub server_group: BTreeMap<String, GroupConfig>,
    pub rule: Vec<RuleConfig>,
    pub mitm: MitmConfig,
    /// Country code -> CIDR list used to resolve GEOIP rules
    pub geoip: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct General {
    pub logger_level: String,
    /// Allow TLS interception of CONNECT tunnels
    pub allow_mitm: bool,
    /// Allow capturing traffic to the sniffing channel
    pub allow_dump: bool,
}

impl Default for General {
    fn default() -> Self {
        Self {
            logger_level: "info".to_string(),
            allow_mitm: false,
            allow_dump: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
    #[serde(alias = "type")]
    pub typ: String,
    #[serde(alias = "address")]
    pub addr: String,
    #[serde(default)]
    pub params: Params,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(alias = "type")]
    pub typ: String,
    #[serde(alias = "address")]
    pub addr: String,
    pub port: u16,
    #[serde(default)]
    pub params: Params,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    #[serde(alias = "type")]
    pub typ: String,
    pub servers: Vec<String>,
    #[serde(default)]
    pub params: Params,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(alias = "type")]
    pub typ: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub params: Params,
}

impl RuleConfig {
    pub fn target(&self) -> Option<&str> {
        self.param(RULE_PARAM_PROXY)
    }

    pub fn comment(&self) -> Option<&str> {
        self.param(RULE_PARAM_COMMENT)
    }

    /// Exact key first, then any casing (`Proxy`, `Comment`)
    fn param(&self, key: &str) -> Option<&str> {
        self.params
            .get(key)
            .or_else(|| {
                self.params
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(key))
                    .map(|(_, v)| v)
            })
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MitmConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_key: Option<PathBuf>,
}

impl Profile {
    /// Decode a profile from TOML
    pub fn decode(input: &str) -> Result<Self> {
        Ok(toml::from_str(input)?)
    }

    /// Encode the profile as TOML
    pub fn encode(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Read and decode a profile file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            JunctionError::InvalidConfig(format!(
                "failed to read profile {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::decode(&contents)
    }
}
