//! Routing graph
//!
//! [`Resolver`] turns a rule target into a concrete [`Server`] by walking
//! group picks; [`Router`] puts the rule set in front of it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{JunctionError, Result};
use crate::models::{Profile, Request, Server};
use crate::proxy::group::{GroupRegistry, ServerGroup};
use crate::proxy::outbound::DialRegistry;
use crate::proxy::rules::{GeoLookup, RuleSet, StaticGeoIp};

pub struct Resolver {
    servers: HashMap<String, Arc<Server>>,
    groups: HashMap<String, Arc<dyn ServerGroup>>,
}

impl Resolver {
    /// Build from servers and groups; `DIRECT` and `REJECT` are always present
    pub fn new(
        servers: impl IntoIterator<Item = Server>,
        groups: impl IntoIterator<Item = Arc<dyn ServerGroup>>,
    ) -> Result<Self> {
        let mut server_map: HashMap<String, Arc<Server>> = HashMap::new();
        for server in [Server::direct(), Server::reject()]
            .into_iter()
            .chain(servers)
        {
            if server_map.contains_key(&server.name) {
                return Err(JunctionError::InvalidConfig(format!(
                    "server {} is defined more than once",
                    server.name
                )));
            }
            server_map.insert(server.name.clone(), Arc::new(server));
        }

        let mut group_map: HashMap<String, Arc<dyn ServerGroup>> = HashMap::new();
        for group in groups {
            let name = group.name().to_string();
            if server_map.contains_key(&name) || group_map.contains_key(&name) {
                return Err(JunctionError::InvalidConfig(format!(
                    "name {} is used by more than one server or group",
                    name
                )));
            }
            group_map.insert(name, group);
        }

        Ok(Self {
            servers: server_map,
            groups: group_map,
        })
    }

    pub fn from_profile(profile: &Profile, registry: &GroupRegistry) -> Result<Self> {
        let servers = profile
            .server
            .iter()
            .map(|(name, config)| {
                Server::new(name, &config.typ, &config.addr, config.port)
                    .with_params(config.params.clone())
            })
            .collect::<Vec<_>>();
        let groups = profile
            .server_group
            .iter()
            .map(|(name, config)| registry.create(name, config))
            .collect::<Result<Vec<_>>>()?;
        Self::new(servers, groups)
    }

    /// Resolve a server or group name to a concrete server.
    ///
    /// Reads group state only; never changes a selection.
    pub fn resolve(&self, name: &str) -> Result<Arc<Server>> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut current = name.to_string();

        loop {
            if let Some(server) = self.servers.get(&current) {
                return Ok(server.clone());
            }
            let group = self
                .groups
                .get(&current)
                .ok_or_else(|| JunctionError::UnknownTarget(current.clone()))?;
            if !visited.insert(current.clone()) {
                return Err(JunctionError::Cycle { name: current });
            }
            let next = group.pick()?;
            debug!(group = %current, member = %next, "Group resolved");
            current = next;
        }
    }

    /// Check that every member exists and the group graph is acyclic
    pub fn validate(&self) -> Result<()> {
        for group in self.groups.values() {
            for member in group.members() {
                if !self.contains(member) {
                    return Err(JunctionError::UnknownTarget(format!(
                        "{} (member of group {})",
                        member,
                        group.name()
                    )));
                }
            }
        }

        let mut done: HashSet<&str> = HashSet::new();
        let mut names: Vec<&String> = self.groups.keys().collect();
        names.sort();
        for name in names {
            let mut path = Vec::new();
            self.visit(name, &mut path, &mut done)?;
        }
        Ok(())
    }

    fn visit<'a>(
        &'a self,
        name: &'a str,
        path: &mut Vec<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> Result<()> {
        if done.contains(name) {
            return Ok(());
        }
        if path.contains(&name) {
            return Err(JunctionError::Cycle {
                name: name.to_string(),
            });
        }
        let Some(group) = self.groups.get(name) else {
            return Ok(());
        };

        path.push(name);
        for member in group.members() {
            self.visit(member, path, done)?;
        }
        path.pop();
        done.insert(name);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.servers.contains_key(name) || self.groups.contains_key(name)
    }

    pub fn server(&self, name: &str) -> Option<Arc<Server>> {
        self.servers.get(name).cloned()
    }

    pub fn servers(&self) -> impl Iterator<Item = &Arc<Server>> {
        self.servers.values()
    }

    pub fn group(&self, name: &str) -> Option<Arc<dyn ServerGroup>> {
        self.groups.get(name).cloned()
    }

    /// All groups, sorted by name
    pub fn groups(&self) -> Vec<Arc<dyn ServerGroup>> {
        let mut groups: Vec<_> = self.groups.values().cloned().collect();
        groups.sort_by(|a, b| a.name().cmp(b.name()));
        groups
    }
}

/// Outcome of routing one request
#[derive(Debug, Clone)]
pub struct Route {
    /// Matched rule in display form
    pub rule: String,
    /// Rule target (server or group name)
    pub target: String,
    pub server: Arc<Server>,
}

/// Rules in front of the resolver
pub struct Router {
    rules: RuleSet,
    resolver: Arc<Resolver>,
    geo: Option<Arc<dyn GeoLookup>>,
}

impl Router {
    pub fn new(
        rules: RuleSet,
        resolver: Arc<Resolver>,
        geo: Option<Arc<dyn GeoLookup>>,
    ) -> Result<Self> {
        for rule in rules.rules() {
            if !resolver.contains(&rule.target) {
                return Err(JunctionError::UnknownTarget(format!(
                    "{} (target of rule {})",
                    rule.target,
                    rule.display()
                )));
            }
        }
        resolver.validate()?;
        Ok(Self {
            rules,
            resolver,
            geo,
        })
    }

    /// Build and validate the routing graph of a profile
    pub fn from_profile(
        profile: &Profile,
        groups: &GroupRegistry,
        dialers: &DialRegistry,
    ) -> Result<Self> {
        let resolver = Resolver::from_profile(profile, groups)?;
        for server in resolver.servers() {
            if !dialers.supports(&server.typ) {
                return Err(JunctionError::UnsupportedProtocol(format!(
                    "{} (server {})",
                    server.typ, server.name
                )));
            }
        }

        let rules = RuleSet::from_configs(&profile.rule)?;
        let geo = StaticGeoIp::from_table(&profile.geoip)?;
        let geo: Option<Arc<dyn GeoLookup>> = if geo.is_empty() {
            None
        } else {
            Some(Arc::new(geo))
        };

        let router = Self::new(rules, Arc::new(resolver), geo)?;
        info!(
            rules = router.rules.len(),
            groups = router.resolver.groups().len(),
            "Routing table loaded"
        );
        Ok(router)
    }

    /// Attach the country code, match a rule and resolve its target
    pub fn route(&self, request: Request) -> Result<(Request, Route)> {
        let request = match (&self.geo, request.ip()) {
            (Some(geo), Some(ip)) => match geo.country_code(ip) {
                Some(code) => request.with_country_code(code),
                None => request,
            },
            _ => request,
        };

        let (rule, target) = self.rules.match_request(&request)?;
        let server = self.resolver.resolve(target)?;
        let route = Route {
            rule: rule.display(),
            target: target.to_string(),
            server,
        };
        Ok((request, route))
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }
}
