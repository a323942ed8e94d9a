//! Operation keys and the allow-list that gates them.

use std::collections::BTreeSet;

use crate::error::{HypervisorError, Result};

pub const DOMAIN_LIST: &str = "domain.list";
pub const DOMAIN_INFO: &str = "domain.info";
pub const DOMAIN_STATS: &str = "domain.stats";
pub const DOMAIN_GETXML: &str = "domain.getxml";
pub const DOMAIN_CREATE: &str = "domain.create";
pub const DOMAIN_DELETE: &str = "domain.delete";
pub const DOMAIN_START: &str = "domain.start";
pub const DOMAIN_STOP: &str = "domain.stop";
pub const DOMAIN_REBOOT: &str = "domain.reboot";
pub const DOMAIN_ATTACH_DEVICE: &str = "domain.attach_device";
pub const DOMAIN_DETACH_DEVICE: &str = "domain.detach_device";
pub const HOST_INFO: &str = "host.info";
pub const NETWORK_LIST: &str = "network.list";
pub const STORAGE_LIST: &str = "storage.list";
pub const DEVICE_GENERATE: &str = "device.generate";

/// Operations a configuration must always allow.
pub const REQUIRED_OPERATIONS: [&str; 2] = [DOMAIN_LIST, DOMAIN_INFO];

/// Allow-list used when the configuration does not provide one.
pub fn default_allowed_operations() -> Vec<String> {
    [
        DOMAIN_LIST,
        DOMAIN_INFO,
        DOMAIN_START,
        DOMAIN_STOP,
        DOMAIN_REBOOT,
        DOMAIN_STATS,
        HOST_INFO,
        NETWORK_LIST,
        STORAGE_LIST,
        DEVICE_GENERATE,
    ]
    .iter()
    .map(|op| op.to_string())
    .collect()
}

/// Set of operation keys that may reach the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowList {
    allowed: BTreeSet<String>,
}

impl AllowList {
    pub fn new<I, S>(operations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: operations.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_allowed(&self, operation: &str) -> bool {
        self.allowed.contains(operation)
    }

    pub fn check(&self, operation: &str) -> Result<()> {
        if self.is_allowed(operation) {
            Ok(())
        } else {
            Err(HypervisorError::Permission(format!(
                "Operation '{}' is not allowed",
                operation
            )))
        }
    }

    /// Required operations absent from this list.
    pub fn missing_required(&self) -> Vec<&'static str> {
        REQUIRED_OPERATIONS
            .iter()
            .copied()
            .filter(|op| !self.is_allowed(op))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }
}

impl Default for AllowList {
    fn default() -> Self {
        Self::new(default_allowed_operations())
    }
}
