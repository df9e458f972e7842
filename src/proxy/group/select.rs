//! Manual selection strategy

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::info;

use super::ServerGroup;
use crate::error::{JunctionError, Result};
use crate::models::GroupConfig;

/// Returns the pinned member, the first one until an operator picks another.
///
/// Uses an atomic index so selection never takes a lock.
pub struct SelectGroup {
    name: String,
    members: Vec<String>,
    pinned: AtomicUsize,
}

impl SelectGroup {
    pub fn new(name: impl Into<String>, members: Vec<String>) -> Self {
        Self {
            name: name.into(),
            members,
            pinned: AtomicUsize::new(0),
        }
    }

    pub fn from_config(name: &str, config: &GroupConfig) -> Result<Arc<dyn ServerGroup>> {
        Ok(Arc::new(Self::new(name, config.servers.clone())))
    }
}

impl ServerGroup for SelectGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn strategy_name(&self) -> &'static str {
        "select"
    }

    fn members(&self) -> &[String] {
        &self.members
    }

    fn pick(&self) -> Result<String> {
        let idx = self.pinned.load(Ordering::Acquire);
        self.members
            .get(idx)
            .cloned()
            .ok_or_else(|| JunctionError::UnknownTarget(self.name.clone()))
    }

    fn select(&self, member: &str) -> Result<()> {
        let idx = self
            .members
            .iter()
            .position(|m| m == member)
            .ok_or_else(|| {
                JunctionError::NotFound(format!("{} is not a member of {}", member, self.name))
            })?;
        self.pinned.store(idx, Ordering::Release);
        info!(group = %self.name, member = %member, "Group selection changed");
        Ok(())
    }

    fn selected(&self) -> Option<String> {
        self.pick().ok()
    }
}
