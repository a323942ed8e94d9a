//! Backend seam between the components and a hypervisor library.
//!
//! A [`Connector`] opens sessions; a [`HypervisorSession`] is one live
//! connection. Session calls are short and synchronous. Opening may block
//! and is always awaited under the configured timeout.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::types::*;

/// Kind of object a failed lookup was looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Domain,
    Network,
    StoragePool,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Domain => "Domain",
            Self::Network => "Network",
            Self::StoragePool => "Storage pool",
        })
    }
}

/// Error reported by a session call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VirtError {
    #[error("{kind} {name} not found")]
    NoSuchObject { kind: ObjectKind, name: String },

    #[error("{0}")]
    Failed(String),
}

impl VirtError {
    pub fn no_domain(name: &str) -> Self {
        Self::NoSuchObject {
            kind: ObjectKind::Domain,
            name: name.to_string(),
        }
    }
}

pub type VirtResult<T> = std::result::Result<T, VirtError>;

/// Opens hypervisor sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, uri: &str, readonly: bool) -> VirtResult<Arc<dyn HypervisorSession>>;
}

/// One established hypervisor connection.
pub trait HypervisorSession: Send + Sync {
    /// Cheap liveness check.
    fn probe(&self) -> VirtResult<()>;

    fn close(&self) -> VirtResult<()>;

    fn host_info(&self) -> VirtResult<HostInfo>;

    // --- domains ---

    fn active_domain_ids(&self) -> VirtResult<Vec<u32>>;

    fn domain_name_by_id(&self, id: u32) -> VirtResult<String>;

    fn defined_domain_names(&self) -> VirtResult<Vec<String>>;

    fn domain_info(&self, name: &str) -> VirtResult<DomainInfo>;

    fn domain_state(&self, name: &str) -> VirtResult<DomainState>;

    fn domain_xml(&self, name: &str) -> VirtResult<String>;

    /// Define a persistent domain. Returns its name.
    fn define_domain(&self, xml: &str) -> VirtResult<String>;

    /// Create and start a transient domain. Returns its name.
    fn create_transient_domain(&self, xml: &str) -> VirtResult<String>;

    fn start_domain(&self, name: &str, force_boot: bool) -> VirtResult<()>;

    fn shutdown_domain(&self, name: &str) -> VirtResult<()>;

    fn destroy_domain(&self, name: &str) -> VirtResult<()>;

    fn reboot_domain(&self, name: &str, acpi_power_button: bool) -> VirtResult<()>;

    fn undefine_domain(&self, name: &str, mode: UndefineMode) -> VirtResult<()>;

    fn attach_device(&self, name: &str, xml: &str, scope: DeviceScope) -> VirtResult<()>;

    fn detach_device(&self, name: &str, xml: &str, scope: DeviceScope) -> VirtResult<()>;

    // --- statistics ---

    fn cpu_stats(&self, name: &str) -> VirtResult<CpuStats>;

    fn memory_stats(&self, name: &str) -> VirtResult<MemoryStats>;

    fn block_stats(&self, name: &str, device: &str) -> VirtResult<BlockStats>;

    fn interface_stats(&self, name: &str, device: &str) -> VirtResult<InterfaceStats>;

    // --- networks and storage ---

    fn active_network_names(&self) -> VirtResult<Vec<String>>;

    fn defined_network_names(&self) -> VirtResult<Vec<String>>;

    fn network_info(&self, name: &str) -> VirtResult<NetworkInfo>;

    fn active_pool_names(&self) -> VirtResult<Vec<String>>;

    fn defined_pool_names(&self) -> VirtResult<Vec<String>>;

    fn pool_info(&self, name: &str) -> VirtResult<StoragePoolInfo>;
}
