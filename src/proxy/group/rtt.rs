//! Lowest round-trip-time strategy

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use url::Url;

use super::{ProbeSettings, ServerGroup};
use crate::error::{JunctionError, Result};
use crate::models::GroupConfig;

const DEFAULT_INTERVAL_SECS: u64 = 600;
const DEFAULT_TIMEOUT_SECS: u64 = 5;

type LatencyTable = HashMap<String, Option<Duration>>;

/// Picks the member with the lowest measured latency.
///
/// Members without a measurement sort last; ties go to member order. The
/// latency table is swapped atomically by the prober, so `pick` never waits.
pub struct RttGroup {
    name: String,
    members: Vec<String>,
    settings: ProbeSettings,
    latencies: ArcSwap<LatencyTable>,
}

impl RttGroup {
    pub fn new(name: impl Into<String>, members: Vec<String>, settings: ProbeSettings) -> Self {
        Self {
            name: name.into(),
            members,
            settings,
            latencies: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn from_config(name: &str, config: &GroupConfig) -> Result<Arc<dyn ServerGroup>> {
        let url = config
            .params
            .get("url")
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                JunctionError::InvalidConfig(format!("rtt group {} requires 'url'", name))
            })?;
        let url = Url::parse(url)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(JunctionError::InvalidConfig(format!(
                "rtt group {} probe url must be http or https",
                name
            )));
        }

        let settings = ProbeSettings {
            url,
            interval: Duration::from_secs(seconds_param(
                name,
                config,
                "interval",
                DEFAULT_INTERVAL_SECS,
            )?),
            timeout: Duration::from_secs(seconds_param(
                name,
                config,
                "timeout",
                DEFAULT_TIMEOUT_SECS,
            )?),
        };

        Ok(Arc::new(Self::new(name, config.servers.clone(), settings)))
    }
}

fn seconds_param(name: &str, config: &GroupConfig, key: &str, default: u64) -> Result<u64> {
    match config.params.get(key).filter(|v| !v.is_empty()) {
        Some(value) => value
            .parse::<u64>()
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| {
                JunctionError::InvalidConfig(format!(
                    "rtt group {}: '{}' must be a positive number of seconds",
                    name, key
                ))
            }),
        None => Ok(default),
    }
}

impl ServerGroup for RttGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn strategy_name(&self) -> &'static str {
        "rtt"
    }

    fn members(&self) -> &[String] {
        &self.members
    }

    fn pick(&self) -> Result<String> {
        let table = self.latencies.load();
        let mut best: Option<(&String, Duration)> = None;

        for member in &self.members {
            if let Some(Some(latency)) = table.get(member) {
                if best.map_or(true, |(_, current)| *latency < current) {
                    best = Some((member, *latency));
                }
            }
        }

        best.map(|(member, _)| member.clone())
            .or_else(|| self.members.first().cloned())
            .ok_or_else(|| JunctionError::UnknownTarget(self.name.clone()))
    }

    fn probe_settings(&self) -> Option<&ProbeSettings> {
        Some(&self.settings)
    }

    fn update_latency(&self, member: &str, latency: Option<Duration>) {
        self.latencies.rcu(|current| {
            let mut next = LatencyTable::clone(current);
            next.insert(member.to_string(), latency);
            next
        });
    }

    fn latencies(&self) -> Vec<(String, Option<Duration>)> {
        let table = self.latencies.load();
        self.members
            .iter()
            .map(|m| (m.clone(), table.get(m).copied().flatten()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn group() -> RttGroup {
        RttGroup::new(
            "AUTO",
            vec![
                "JP1".to_string(),
                "JP2".to_string(),
                "US1".to_string(),
                "US2".to_string(),
            ],
            ProbeSettings {
                url: Url::parse("https://www.google.com").unwrap(),
                interval: Duration::from_secs(600),
                timeout: Duration::from_secs(5),
            },
        )
    }

    fn ms(v: u64) -> Option<Duration> {
        Some(Duration::from_millis(v))
    }

    #[test]
    fn test_unprobed_group_returns_first_member() {
        assert_eq!(group().pick().unwrap(), "JP1");
    }

    #[test]
    fn test_picks_lowest_latency() {
        let group = group();
        group.update_latency("JP1", ms(50));
        group.update_latency("JP2", ms(30));
        group.update_latency("US1", ms(200));
        assert_eq!(group.pick().unwrap(), "JP2");

        group.update_latency("JP2", None);
        assert_eq!(group.pick().unwrap(), "JP1");

        group.update_latency("JP2", ms(999_999));
        assert_eq!(group.pick().unwrap(), "JP1");
    }

    #[test]
    fn test_ties_follow_member_order() {
        let group = group();
        group.update_latency("US2", ms(10));
        group.update_latency("US1", ms(10));
        assert_eq!(group.pick().unwrap(), "US1");
    }

    #[test]
    fn test_unknown_members_sort_last() {
        let group = group();
        group.update_latency("JP1", None);
        group.update_latency("US2", ms(300));
        assert_eq!(group.pick().unwrap(), "US2");

        let latencies = group.latencies();
        assert_eq!(latencies[0], ("JP1".to_string(), None));
        assert_eq!(latencies[3], ("US2".to_string(), ms(300)));
    }

    #[test]
    fn test_from_config_params() {
        let mut params = BTreeMap::new();
        params.insert("url".to_string(), "http://cp.example/generate_204".to_string());
        params.insert("interval".to_string(), "60".to_string());
        let config = GroupConfig {
            typ: "rtt".to_string(),
            servers: vec!["A".to_string()],
            params: params.clone(),
        };
        let group = RttGroup::from_config("AUTO", &config).unwrap();
        let settings = group.probe_settings().unwrap();
        assert_eq!(settings.interval, Duration::from_secs(60));
        assert_eq!(settings.timeout, Duration::from_secs(5));

        params.insert("timeout".to_string(), "soon".to_string());
        let bad = GroupConfig { params, ..config };
        assert!(RttGroup::from_config("AUTO", &bad).is_err());
    }
}
