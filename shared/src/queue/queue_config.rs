use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        RwLock,
    },
};

use crate::{queue::accounting::AccountingGroupPolicy, types::GroupKey};

/// Accounting group policies by group key
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueueConfig {
    pub groups: BTreeMap<GroupKey, AccountingGroupPolicy>,
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(mut self, key: GroupKey, policy: AccountingGroupPolicy) -> Self {
        self.groups.insert(key, policy);
        self
    }
}

/// Supplies versioned accounting group policies. Queues re-read the config
/// only when the version changes.
pub trait QueueConfigSource: Send + Sync {
    fn version(&self) -> u32;

    fn config(&self) -> Option<QueueConfig>;
}

/// A `QueueConfigSource` that can be republished at runtime and shared
/// between every endpoint's queue
#[derive(Default)]
pub struct SharedQueueConfig {
    version: AtomicU32,
    config: RwLock<Option<QueueConfig>>,
}

impl SharedQueueConfig {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            version: AtomicU32::new(1),
            config: RwLock::new(Some(config)),
        }
    }

    /// Replaces the config and bumps the version
    pub fn publish(&self, config: QueueConfig) {
        if let Ok(mut current) = self.config.write() {
            *current = Some(config);
        }
        self.version.fetch_add(1, Ordering::AcqRel);
    }
}

impl QueueConfigSource for SharedQueueConfig {
    fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    fn config(&self) -> Option<QueueConfig> {
        self.config.read().ok().and_then(|config| config.clone())
    }
}

/// Per-queue behavior switches
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueSettings {
    /// Reliable ordered messages without explicit dependencies also wait for
    /// any earlier such message's packet to resolve before being written
    pub legacy_ordered: bool,
    /// Nacks a reliable message survives before it is rejected; `None` retries forever
    pub reliable_retry_budget: Option<u32>,
    /// Seed for the scheduling jitter and early drop draws
    pub seed: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            legacy_ordered: false,
            reliable_retry_budget: None,
            seed: 0x9e37_79b9_7f4a_7c15,
        }
    }
}

#[cfg(test)]
mod queue_config_tests {
    use super::*;

    #[test]
    fn publish_bumps_version() {
        let shared = SharedQueueConfig::new(QueueConfig::new());
        let before = shared.version();
        shared.publish(QueueConfig::new().with_group(
            GroupKey::new(b"ents"),
            AccountingGroupPolicy::default(),
        ));
        assert_eq!(shared.version(), before + 1);
        assert_eq!(shared.config().unwrap().groups.len(), 1);
    }

    #[test]
    fn default_source_has_no_config() {
        let shared = SharedQueueConfig::default();
        assert_eq!(shared.version(), 0);
        assert!(shared.config().is_none());
    }
}
