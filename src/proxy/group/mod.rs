//! Server group strategies
//!
//! A group resolves to one of its members each time it is asked. Members may
//! be servers or other groups; recursion is handled by the resolver.

mod rtt;
mod select;

pub use rtt::RttGroup;
pub use select::SelectGroup;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use url::Url;

use crate::error::{JunctionError, Result};
use crate::models::GroupConfig;

/// Latency probing parameters of a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSettings {
    pub url: Url,
    pub interval: Duration,
    pub timeout: Duration,
}

/// Trait for server group strategies
///
/// `pick` must never block: it is called on every routed request.
pub trait ServerGroup: Send + Sync {
    fn name(&self) -> &str;

    fn strategy_name(&self) -> &'static str;

    fn members(&self) -> &[String];

    /// Choose a direct member name
    fn pick(&self) -> Result<String>;

    /// Pin a member. Only manual-selection strategies support this.
    fn select(&self, _member: &str) -> Result<()> {
        Err(JunctionError::InvalidRequest(format!(
            "group {} ({}) does not support manual selection",
            self.name(),
            self.strategy_name()
        )))
    }

    /// Currently pinned member, if the strategy pins one
    fn selected(&self) -> Option<String> {
        None
    }

    fn probe_settings(&self) -> Option<&ProbeSettings> {
        None
    }

    /// Record a probe result; `None` marks the member unreachable
    fn update_latency(&self, _member: &str, _latency: Option<Duration>) {}

    fn latencies(&self) -> Vec<(String, Option<Duration>)> {
        Vec::new()
    }

    fn snapshot(&self) -> GroupSnapshot {
        GroupSnapshot {
            name: self.name().to_string(),
            strategy: self.strategy_name(),
            members: self.members().to_vec(),
            selected: self.selected(),
            current: self.pick().ok(),
            latencies: self
                .latencies()
                .into_iter()
                .map(|(member, latency)| (member, latency.map(|d| d.as_millis() as u64)))
                .collect(),
        }
    }
}

/// Serializable view of a group for the control API
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSnapshot {
    pub name: String,
    pub strategy: &'static str,
    pub members: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected: Option<String>,
    /// Member `pick` currently returns
    pub current: Option<String>,
    /// Latency in milliseconds per member, `null` when unknown
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub latencies: BTreeMap<String, Option<u64>>,
}

pub type GroupFactory = fn(&str, &GroupConfig) -> Result<Arc<dyn ServerGroup>>;

/// Strategy name -> group constructor
pub struct GroupRegistry {
    factories: HashMap<String, GroupFactory>,
}

impl Default for GroupRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("select", SelectGroup::from_config);
        registry.register("rtt", RttGroup::from_config);
        registry
    }
}

impl GroupRegistry {
    pub fn register(&mut self, strategy: &str, factory: GroupFactory) {
        self.factories.insert(strategy.to_lowercase(), factory);
    }

    /// Create a group of the configured strategy
    pub fn create(&self, name: &str, config: &GroupConfig) -> Result<Arc<dyn ServerGroup>> {
        if config.servers.is_empty() {
            return Err(JunctionError::InvalidConfig(format!(
                "group {} has no members",
                name
            )));
        }
        let factory = self
            .factories
            .get(&config.typ.to_lowercase())
            .ok_or_else(|| {
                JunctionError::InvalidConfig(format!(
                    "group {} has unknown strategy: {}",
                    name, config.typ
                ))
            })?;
        factory(name, config)
    }
}
