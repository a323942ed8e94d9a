//! Data model shared by queries, lifecycle operations and the descriptor generators.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{HypervisorError, Result};

// =============================================================================
// STATES
// =============================================================================

/// Domain run state as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    PmSuspended,
}

impl DomainState {
    /// Map a numeric libvirt state code. Unknown codes become `NoState`.
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Running,
            2 => Self::Blocked,
            3 => Self::Paused,
            4 => Self::Shutdown,
            5 => Self::Shutoff,
            6 => Self::Crashed,
            7 => Self::PmSuspended,
            _ => Self::NoState,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoState => "nostate",
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Paused => "paused",
            Self::Shutdown => "shutdown",
            Self::Shutoff => "shutoff",
            Self::Crashed => "crashed",
            Self::PmSuspended => "pmsuspended",
        }
    }

    /// Whether the domain holds a live process (has an id).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Blocked | Self::Paused | Self::PmSuspended)
    }
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Virtual network state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkState {
    Active,
    Inactive,
}

/// Storage pool state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoragePoolState {
    Inactive,
    Building,
    Running,
    Degraded,
    Inaccessible,
}

impl StoragePoolState {
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Building,
            2 => Self::Running,
            3 => Self::Degraded,
            4 => Self::Inaccessible,
            _ => Self::Inactive,
        }
    }
}

// =============================================================================
// QUERY SNAPSHOTS
// =============================================================================

/// Snapshot of a domain's identity and resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainInfo {
    pub name: String,
    pub uuid: String,
    /// Runtime id, present only while the domain is active
    pub id: Option<u32>,
    pub state: DomainState,
    /// KiB
    pub max_memory: u64,
    /// KiB
    pub memory: u64,
    pub vcpus: u32,
    /// Nanoseconds
    pub cpu_time: u64,
    pub autostart: bool,
    pub persistent: bool,
}

/// Runtime statistics for a domain. Only `name` and `state` are guaranteed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainStats {
    pub name: String,
    pub state: Option<DomainState>,
    pub cpu_time: Option<u64>,
    pub cpu_user_time: Option<u64>,
    pub cpu_system_time: Option<u64>,
    pub memory_actual: Option<u64>,
    pub memory_unused: Option<u64>,
    pub memory_available: Option<u64>,
    pub memory_usable: Option<u64>,
    pub block_rd_bytes: Option<u64>,
    pub block_wr_bytes: Option<u64>,
    pub block_rd_reqs: Option<u64>,
    pub block_wr_reqs: Option<u64>,
    pub net_rx_bytes: Option<u64>,
    pub net_tx_bytes: Option<u64>,
    pub net_rx_pkts: Option<u64>,
    pub net_tx_pkts: Option<u64>,
}

impl DomainStats {
    pub fn base(name: &str, state: DomainState) -> Self {
        Self {
            name: name.to_string(),
            state: Some(state),
            ..Default::default()
        }
    }
}

/// CPU counters, nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuStats {
    pub cpu_time: Option<u64>,
    pub user_time: Option<u64>,
    pub system_time: Option<u64>,
}

/// Balloon memory counters, KiB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub actual: Option<u64>,
    pub unused: Option<u64>,
    pub available: Option<u64>,
    pub usable: Option<u64>,
}

/// Per-device block counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockStats {
    pub rd_bytes: u64,
    pub wr_bytes: u64,
    pub rd_reqs: u64,
    pub wr_reqs: u64,
}

/// Per-interface network counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
}

impl BlockStats {
    /// Add another device's counters, clamping at `u64::MAX`.
    pub fn accumulate(&mut self, other: &BlockStats) {
        self.rd_bytes = self.rd_bytes.saturating_add(other.rd_bytes);
        self.wr_bytes = self.wr_bytes.saturating_add(other.wr_bytes);
        self.rd_reqs = self.rd_reqs.saturating_add(other.rd_reqs);
        self.wr_reqs = self.wr_reqs.saturating_add(other.wr_reqs);
    }
}

impl InterfaceStats {
    pub fn accumulate(&mut self, other: &InterfaceStats) {
        self.rx_bytes = self.rx_bytes.saturating_add(other.rx_bytes);
        self.tx_bytes = self.tx_bytes.saturating_add(other.tx_bytes);
        self.rx_packets = self.rx_packets.saturating_add(other.rx_packets);
        self.tx_packets = self.tx_packets.saturating_add(other.tx_packets);
    }
}

/// Host capabilities and resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    pub hostname: String,
    pub uri: String,
    pub hypervisor_type: String,
    pub hypervisor_version: String,
    pub libvirt_version: String,
    pub cpu_model: String,
    pub cpu_arch: String,
    pub cpu_cores: u32,
    pub cpu_threads: u32,
    pub cpu_sockets: u32,
    pub cpu_mhz: u32,
    /// KiB
    pub memory_size: u64,
    /// KiB
    pub memory_free: u64,
    pub numa_nodes: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub name: String,
    pub uuid: String,
    pub state: NetworkState,
    pub bridge_name: Option<String>,
    pub autostart: bool,
    pub persistent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoragePoolInfo {
    pub name: String,
    pub uuid: String,
    pub state: StoragePoolState,
    /// Bytes
    pub capacity: u64,
    pub allocation: u64,
    pub available: u64,
    pub autostart: bool,
    pub persistent: bool,
}

/// State filter accepted by domain listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainStateFilter {
    #[default]
    All,
    Running,
    Active,
    Stopped,
    Inactive,
}

impl DomainStateFilter {
    pub fn matches(&self, state: DomainState) -> bool {
        match self {
            Self::All => true,
            Self::Running | Self::Active => state == DomainState::Running,
            Self::Stopped | Self::Inactive => state == DomainState::Shutoff,
        }
    }
}

// =============================================================================
// DOMAIN CREATION
// =============================================================================

/// First boot device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootDevice {
    #[default]
    Hd,
    Cdrom,
    Network,
    Fd,
}

impl BootDevice {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hd => "hd",
            Self::Cdrom => "cdrom",
            Self::Network => "network",
            Self::Fd => "fd",
        }
    }
}

/// Parameters for creating a domain from scratch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainCreateParams {
    pub name: String,
    /// KiB
    pub memory: u64,
    pub vcpus: u32,
    /// GiB. Validated only; the image itself is provisioned elsewhere.
    pub disk_size: Option<u64>,
    pub disk_path: Option<String>,
    pub cdrom_path: Option<String>,
    pub network: String,
    pub os_type: String,
    pub arch: String,
    pub boot_device: BootDevice,
    /// Complete descriptor that replaces generation entirely
    pub xml: Option<String>,
    /// Create a transient domain instead of defining a persistent one
    pub ephemeral: bool,
}

impl Default for DomainCreateParams {
    fn default() -> Self {
        Self {
            name: String::new(),
            memory: 2_097_152,
            vcpus: 2,
            disk_size: None,
            disk_path: None,
            cdrom_path: None,
            network: "default".to_string(),
            os_type: "hvm".to_string(),
            arch: "x86_64".to_string(),
            boot_device: BootDevice::Hd,
            xml: None,
            ephemeral: false,
        }
    }
}

impl DomainCreateParams {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.memory < 1024 {
            return Err(invalid("memory must be at least 1024 KiB"));
        }
        if !(1..=128).contains(&self.vcpus) {
            return Err(invalid("vcpus must be between 1 and 128"));
        }
        if matches!(self.disk_size, Some(0)) {
            return Err(invalid("disk_size must be at least 1 GiB"));
        }
        for (field, value) in [("network", &self.network), ("os_type", &self.os_type), ("arch", &self.arch)] {
            if value.is_empty() {
                return Err(invalid(&format!("{} must not be empty", field)));
            }
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> HypervisorError {
    HypervisorError::Operation(format!("Invalid domain parameters: {}", reason))
}

// =============================================================================
// LIFECYCLE
// =============================================================================

/// Effect scope of a device change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceScope {
    /// Running instance only
    Live,
    /// Persistent definition only
    Config,
    /// Running instance and persistent definition
    Both,
    /// Whatever the hypervisor considers current
    Current,
}

impl DeviceScope {
    pub fn from_flags(live: bool, persistent: bool) -> Self {
        match (live, persistent) {
            (true, true) => Self::Both,
            (true, false) => Self::Live,
            (false, true) => Self::Config,
            (false, false) => Self::Current,
        }
    }
}

/// How a definition is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndefineMode {
    /// Also drop managed-save images and NVRAM
    WithCleanup,
    Plain,
}

/// Whether a start/stop request changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleOutcome {
    Applied,
    AlreadyInState,
}

/// What `delete_domain` did with the storage it found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub destroyed: bool,
    pub storage_paths: Vec<String>,
    pub storage_removed: Vec<String>,
}

/// Uniform envelope returned by every mutating operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl OperationResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.details.insert(key.to_string(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes() {
        assert_eq!(DomainState::from_code(1), DomainState::Running);
        assert_eq!(DomainState::from_code(5), DomainState::Shutoff);
        assert_eq!(DomainState::from_code(42), DomainState::NoState);
        assert_eq!(StoragePoolState::from_code(2), StoragePoolState::Running);
        assert_eq!(DomainState::PmSuspended.to_string(), "pmsuspended");
    }

    #[test]
    fn test_create_params_defaults_from_json() {
        let params: DomainCreateParams = serde_json::from_value(serde_json::json!({
            "name": "vm1",
            "boot_device": "cdrom"
        }))
        .unwrap();

        assert_eq!(params.memory, 2_097_152);
        assert_eq!(params.vcpus, 2);
        assert_eq!(params.network, "default");
        assert_eq!(params.boot_device, BootDevice::Cdrom);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_create_params_validation() {
        let mut params = DomainCreateParams::new("vm1");
        params.memory = 512;
        assert!(params.validate().is_err());

        let mut params = DomainCreateParams::new("vm1");
        params.vcpus = 129;
        assert!(params.validate().is_err());

        let mut params = DomainCreateParams::new("vm1");
        params.disk_size = Some(0);
        assert!(params.validate().is_err());

        assert!(DomainCreateParams::new("").validate().is_err());
    }

    #[test]
    fn test_scope_from_flags() {
        assert_eq!(DeviceScope::from_flags(true, true), DeviceScope::Both);
        assert_eq!(DeviceScope::from_flags(true, false), DeviceScope::Live);
        assert_eq!(DeviceScope::from_flags(false, true), DeviceScope::Config);
        assert_eq!(DeviceScope::from_flags(false, false), DeviceScope::Current);
    }

    #[test]
    fn test_state_filter() {
        assert!(DomainStateFilter::Active.matches(DomainState::Running));
        assert!(!DomainStateFilter::Stopped.matches(DomainState::Paused));
        assert!(DomainStateFilter::Inactive.matches(DomainState::Shutoff));
        assert!(DomainStateFilter::All.matches(DomainState::Crashed));
    }

    #[test]
    fn test_device_counters_saturate() {
        let mut block = BlockStats { rd_bytes: u64::MAX - 1, wr_reqs: 3, ..Default::default() };
        block.accumulate(&BlockStats { rd_bytes: 10, wr_bytes: 5, rd_reqs: 1, wr_reqs: 4 });
        assert_eq!(block, BlockStats { rd_bytes: u64::MAX, wr_bytes: 5, rd_reqs: 1, wr_reqs: 7 });

        let mut net = InterfaceStats { tx_packets: u64::MAX, ..Default::default() };
        net.accumulate(&InterfaceStats { rx_bytes: 1000, tx_bytes: 0, rx_packets: 2, tx_packets: u64::MAX });
        assert_eq!(net.tx_packets, u64::MAX);
        assert_eq!(net.rx_bytes, 1000);
        assert_eq!(net.rx_packets, 2);
    }
}
