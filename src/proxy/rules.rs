//! Rule engine
//!
//! Rules are evaluated in declaration order and the first match wins.

use std::collections::BTreeMap;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::Serialize;
use tracing::warn;

use crate::error::{JunctionError, Result};
use crate::models::{Request, RuleConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleKind {
    Domain(String),
    DomainSuffix(String),
    DomainKeyword(String),
    IpCidr(IpNet),
    GeoIp(String),
    Final,
}

impl RuleKind {
    pub fn parse(typ: &str, value: &str) -> Result<Self> {
        let value = value.trim();
        match typ.to_uppercase().as_str() {
            "DOMAIN" => Ok(RuleKind::Domain(value.to_lowercase())),
            "DOMAIN-SUFFIX" => Ok(RuleKind::DomainSuffix(
                value.trim_start_matches('.').to_lowercase(),
            )),
            "DOMAIN-KEYWORD" => Ok(RuleKind::DomainKeyword(value.to_lowercase())),
            "IP-CIDR" | "IP-CIDR6" => {
                let net = value.parse::<IpNet>().map_err(|e| {
                    JunctionError::InvalidConfig(format!("invalid CIDR '{}': {}", value, e))
                })?;
                Ok(RuleKind::IpCidr(net))
            }
            "GEOIP" => Ok(RuleKind::GeoIp(value.to_uppercase())),
            "FINAL" | "MATCH" => Ok(RuleKind::Final),
            other => Err(JunctionError::InvalidConfig(format!(
                "unknown rule type: {}",
                other
            ))),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            RuleKind::Domain(_) => "DOMAIN",
            RuleKind::DomainSuffix(_) => "DOMAIN-SUFFIX",
            RuleKind::DomainKeyword(_) => "DOMAIN-KEYWORD",
            RuleKind::IpCidr(_) => "IP-CIDR",
            RuleKind::GeoIp(_) => "GEOIP",
            RuleKind::Final => "FINAL",
        }
    }

    pub fn matches(&self, request: &Request) -> bool {
        let domain = request.domain();
        match self {
            RuleKind::Domain(value) => domain.eq_ignore_ascii_case(value),
            RuleKind::DomainSuffix(suffix) => {
                let domain = domain.to_lowercase();
                domain == *suffix
                    || domain
                        .strip_suffix(suffix.as_str())
                        .is_some_and(|rest| rest.ends_with('.'))
            }
            RuleKind::DomainKeyword(keyword) => domain.to_lowercase().contains(keyword.as_str()),
            RuleKind::IpCidr(net) => request.ip().is_some_and(|ip| net.contains(&ip)),
            RuleKind::GeoIp(code) => request
                .country_code()
                .is_some_and(|cc| cc.eq_ignore_ascii_case(code)),
            RuleKind::Final => true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Rule {
    #[serde(skip)]
    pub kind: RuleKind,
    pub typ: &'static str,
    pub value: String,
    /// Server or group name requests are routed to
    pub target: String,
    pub params: BTreeMap<String, String>,
}

impl Rule {
    pub fn from_config(config: &RuleConfig) -> Result<Self> {
        let kind = RuleKind::parse(&config.typ, &config.value)?;
        let target = config
            .target()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                JunctionError::InvalidConfig(format!(
                    "rule {},{} has no proxy target",
                    config.typ, config.value
                ))
            })?
            .to_string();

        Ok(Self {
            typ: kind.type_name(),
            kind,
            value: config.value.clone(),
            target,
            params: config.params.clone(),
        })
    }

    /// `TYPE,value` form used in logs and records
    pub fn display(&self) -> String {
        if matches!(self.kind, RuleKind::Final) {
            self.typ.to_string()
        } else {
            format!("{},{}", self.typ, self.value)
        }
    }
}

/// Country code lookup for GEOIP rules
pub trait GeoLookup: Send + Sync {
    fn country_code(&self, ip: IpAddr) -> Option<String>;
}

/// Country table built from the profile's `[geoip]` section
#[derive(Debug, Clone, Default)]
pub struct StaticGeoIp {
    entries: Vec<(IpNet, String)>,
}

impl StaticGeoIp {
    pub fn from_table(table: &BTreeMap<String, Vec<String>>) -> Result<Self> {
        let mut entries = Vec::new();
        for (code, cidrs) in table {
            for cidr in cidrs {
                let net = cidr.trim().parse::<IpNet>().map_err(|e| {
                    JunctionError::InvalidConfig(format!(
                        "invalid geoip CIDR '{}' for {}: {}",
                        cidr, code, e
                    ))
                })?;
                entries.push((net, code.to_uppercase()));
            }
        }
        // Most specific network first
        entries.sort_by(|a, b| b.0.prefix_len().cmp(&a.0.prefix_len()));
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl GeoLookup for StaticGeoIp {
    fn country_code(&self, ip: IpAddr) -> Option<String> {
        self.entries
            .iter()
            .find(|(net, _)| net.contains(&ip))
            .map(|(_, code)| code.clone())
    }
}

/// Ordered rule list
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        if !rules.iter().any(|r| matches!(r.kind, RuleKind::Final)) {
            warn!("Rule set has no FINAL rule; unmatched requests will fail");
        }
        Self { rules }
    }

    pub fn from_configs(configs: &[RuleConfig]) -> Result<Self> {
        let rules = configs
            .iter()
            .map(Rule::from_config)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(rules))
    }

    /// First matching rule and its target name
    pub fn match_request(&self, request: &Request) -> Result<(&Rule, &str)> {
        self.rules
            .iter()
            .find(|rule| rule.kind.matches(request))
            .map(|rule| (rule, rule.target.as_str()))
            .ok_or_else(|| JunctionError::NoRoute {
                target: request.host_port(),
            })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
