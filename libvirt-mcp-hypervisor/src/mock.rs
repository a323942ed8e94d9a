//! Mock hypervisor backend for testing and development.
//!
//! State lives in memory and survives reconnects, like a real host.
//! Every mutating call is recorded so tests can assert what reached the
//! hypervisor, and individual faults can be switched on.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::session::{Connector, HypervisorSession, ObjectKind, VirtError, VirtResult};
use crate::types::*;
use crate::xml::inspect;

/// A call that reached the mock session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Close,
    Define(String),
    CreateTransient(String),
    Start { name: String, force_boot: bool },
    Shutdown(String),
    Destroy(String),
    Reboot { name: String, acpi: bool },
    Undefine { name: String, mode: UndefineMode },
    AttachDevice { name: String, scope: DeviceScope },
    DetachDevice { name: String, scope: DeviceScope },
}

/// Fault switches.
#[derive(Debug, Default)]
pub struct MockFaults {
    pub open_fails: bool,
    pub probe_fails: bool,
    pub close_fails: bool,
    /// Domains whose info lookup fails
    pub broken_domains: HashSet<String>,
    pub block_stats_fail: bool,
    pub interface_stats_fail: bool,
    /// Reject undefine with cleanup flags (older hypervisors)
    pub undefine_cleanup_unsupported: bool,
}

struct MockDomain {
    uuid: String,
    xml: String,
    state: DomainState,
    id: Option<u32>,
    persistent: bool,
    memory: u64,
    vcpus: u32,
    devices: Vec<String>,
}

struct MockNetwork {
    uuid: String,
    active: bool,
    bridge: Option<String>,
}

struct MockPool {
    uuid: String,
    state: StoragePoolState,
    capacity: u64,
    allocation: u64,
}

struct MockHost {
    domains: BTreeMap<String, MockDomain>,
    networks: BTreeMap<String, MockNetwork>,
    pools: BTreeMap<String, MockPool>,
    next_id: u32,
}

/// In-memory hypervisor session.
pub struct MockSession {
    host: RwLock<MockHost>,
    calls: Mutex<Vec<MockCall>>,
    faults: Mutex<MockFaults>,
}

impl MockSession {
    pub fn new() -> Self {
        info!("Creating mock hypervisor session");
        let mut networks = BTreeMap::new();
        networks.insert(
            "default".to_string(),
            MockNetwork {
                uuid: Uuid::new_v4().to_string(),
                active: true,
                bridge: Some("virbr0".to_string()),
            },
        );
        let mut pools = BTreeMap::new();
        pools.insert(
            "default".to_string(),
            MockPool {
                uuid: Uuid::new_v4().to_string(),
                state: StoragePoolState::Running,
                capacity: 500 * 1024 * 1024 * 1024,
                allocation: 120 * 1024 * 1024 * 1024,
            },
        );

        Self {
            host: RwLock::new(MockHost {
                domains: BTreeMap::new(),
                networks,
                pools,
                next_id: 1,
            }),
            calls: Mutex::new(Vec::new()),
            faults: Mutex::new(MockFaults::default()),
        }
    }

    /// Fault switches, mutable in place.
    pub fn faults(&self) -> MutexGuard<'_, MockFaults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Calls recorded so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Seed a persistent domain in the given state, bypassing the call log.
    pub fn insert_domain(&self, xml: &str, state: DomainState) -> VirtResult<String> {
        let mut host = self.write()?;
        let name = host.add_domain(xml, true)?;
        host.set_state(&name, state)?;
        Ok(name)
    }

    /// Devices currently attached through `attach_device`.
    pub fn attached_devices(&self, name: &str) -> VirtResult<Vec<String>> {
        let host = self.read()?;
        Ok(host.domain(name)?.devices.clone())
    }

    fn record(&self, call: MockCall) {
        debug!(call = ?call, "Mock hypervisor call");
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(call);
    }

    fn read(&self) -> VirtResult<std::sync::RwLockReadGuard<'_, MockHost>> {
        self.host
            .read()
            .map_err(|_| VirtError::Failed("Lock poisoned".to_string()))
    }

    fn write(&self) -> VirtResult<std::sync::RwLockWriteGuard<'_, MockHost>> {
        self.host
            .write()
            .map_err(|_| VirtError::Failed("Lock poisoned".to_string()))
    }
}

impl Default for MockSession {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHost {
    fn domain(&self, name: &str) -> VirtResult<&MockDomain> {
        self.domains.get(name).ok_or_else(|| VirtError::no_domain(name))
    }

    fn domain_mut(&mut self, name: &str) -> VirtResult<&mut MockDomain> {
        self.domains.get_mut(name).ok_or_else(|| VirtError::no_domain(name))
    }

    fn add_domain(&mut self, xml: &str, persistent: bool) -> VirtResult<String> {
        let read = |field: &str| {
            inspect::root_child_text(xml, field)
                .map_err(|e| VirtError::Failed(format!("XML error: {}", e)))
        };
        let name = read("name")?
            .filter(|n| !n.is_empty())
            .ok_or_else(|| VirtError::Failed("missing domain name".to_string()))?;
        let uuid = read("uuid")?.unwrap_or_else(|| Uuid::new_v4().to_string());
        let memory = read("memory")?.and_then(|m| m.parse().ok()).unwrap_or(0);
        let vcpus = read("vcpu")?.and_then(|v| v.parse().ok()).unwrap_or(1);

        if let Some(existing) = self.domains.get(&name) {
            if existing.uuid != uuid {
                return Err(VirtError::Failed(format!("domain '{}' already exists", name)));
            }
        }

        self.domains.insert(
            name.clone(),
            MockDomain {
                uuid,
                xml: xml.to_string(),
                state: DomainState::Shutoff,
                id: None,
                persistent,
                memory,
                vcpus,
                devices: Vec::new(),
            },
        );
        Ok(name)
    }

    fn set_state(&mut self, name: &str, state: DomainState) -> VirtResult<()> {
        let next_id = self.next_id;
        let domain = self.domain_mut(name)?;
        domain.state = state;
        if state.is_active() {
            if domain.id.is_none() {
                domain.id = Some(next_id);
                self.next_id += 1;
            }
        } else {
            domain.id = None;
        }
        Ok(())
    }

    /// Transient domains vanish once they stop.
    fn power_off(&mut self, name: &str) -> VirtResult<()> {
        self.set_state(name, DomainState::Shutoff)?;
        if !self.domain(name)?.persistent {
            self.domains.remove(name);
        }
        Ok(())
    }
}

impl HypervisorSession for MockSession {
    fn probe(&self) -> VirtResult<()> {
        if self.faults().probe_fails {
            return Err(VirtError::Failed("connection reset by peer".to_string()));
        }
        Ok(())
    }

    fn close(&self) -> VirtResult<()> {
        self.record(MockCall::Close);
        if self.faults().close_fails {
            return Err(VirtError::Failed("close failed".to_string()));
        }
        Ok(())
    }

    fn host_info(&self) -> VirtResult<HostInfo> {
        let host = self.read()?;
        let used: u64 = host
            .domains
            .values()
            .filter(|d| d.state.is_active())
            .map(|d| d.memory)
            .sum();
        let total: u64 = 64 * 1024 * 1024;

        Ok(HostInfo {
            hostname: "mock-host".to_string(),
            uri: "test:///default".to_string(),
            hypervisor_type: "QEMU".to_string(),
            hypervisor_version: "8.2.0".to_string(),
            libvirt_version: "10.0.0".to_string(),
            cpu_model: "x86_64".to_string(),
            cpu_arch: "x86_64".to_string(),
            cpu_cores: 8,
            cpu_threads: 2,
            cpu_sockets: 1,
            cpu_mhz: 3000,
            memory_size: total,
            memory_free: total.saturating_sub(used),
            numa_nodes: 1,
        })
    }

    fn active_domain_ids(&self) -> VirtResult<Vec<u32>> {
        let host = self.read()?;
        Ok(host.domains.values().filter_map(|d| d.id).collect())
    }

    fn domain_name_by_id(&self, id: u32) -> VirtResult<String> {
        let host = self.read()?;
        host.domains
            .iter()
            .find(|(_, d)| d.id == Some(id))
            .map(|(name, _)| name.clone())
            .ok_or_else(|| VirtError::NoSuchObject {
                kind: ObjectKind::Domain,
                name: format!("id {}", id),
            })
    }

    fn defined_domain_names(&self) -> VirtResult<Vec<String>> {
        let host = self.read()?;
        Ok(host
            .domains
            .iter()
            .filter(|(_, d)| d.persistent && !d.state.is_active())
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn domain_info(&self, name: &str) -> VirtResult<DomainInfo> {
        if self.faults().broken_domains.contains(name) {
            return Err(VirtError::Failed(format!("internal error reading {}", name)));
        }
        let host = self.read()?;
        let d = host.domain(name)?;
        Ok(DomainInfo {
            name: name.to_string(),
            uuid: d.uuid.clone(),
            id: d.id,
            state: d.state,
            max_memory: d.memory,
            memory: if d.state.is_active() { d.memory } else { 0 },
            vcpus: d.vcpus,
            cpu_time: if d.state.is_active() { 1_500_000_000 } else { 0 },
            autostart: false,
            persistent: d.persistent,
        })
    }

    fn domain_state(&self, name: &str) -> VirtResult<DomainState> {
        Ok(self.read()?.domain(name)?.state)
    }

    fn domain_xml(&self, name: &str) -> VirtResult<String> {
        Ok(self.read()?.domain(name)?.xml.clone())
    }

    fn define_domain(&self, xml: &str) -> VirtResult<String> {
        self.record(MockCall::Define(xml.to_string()));
        self.write()?.add_domain(xml, true)
    }

    fn create_transient_domain(&self, xml: &str) -> VirtResult<String> {
        self.record(MockCall::CreateTransient(xml.to_string()));
        let mut host = self.write()?;
        let name = host.add_domain(xml, false)?;
        host.set_state(&name, DomainState::Running)?;
        Ok(name)
    }

    fn start_domain(&self, name: &str, force_boot: bool) -> VirtResult<()> {
        self.record(MockCall::Start { name: name.to_string(), force_boot });
        let mut host = self.write()?;
        if host.domain(name)?.state.is_active() {
            return Err(VirtError::Failed("Requested operation is not valid: domain is already running".to_string()));
        }
        host.set_state(name, DomainState::Running)
    }

    fn shutdown_domain(&self, name: &str) -> VirtResult<()> {
        self.record(MockCall::Shutdown(name.to_string()));
        let mut host = self.write()?;
        if !host.domain(name)?.state.is_active() {
            return Err(VirtError::Failed("Requested operation is not valid: domain is not running".to_string()));
        }
        host.power_off(name)
    }

    fn destroy_domain(&self, name: &str) -> VirtResult<()> {
        self.record(MockCall::Destroy(name.to_string()));
        let mut host = self.write()?;
        if !host.domain(name)?.state.is_active() {
            return Err(VirtError::Failed("Requested operation is not valid: domain is not running".to_string()));
        }
        host.power_off(name)
    }

    fn reboot_domain(&self, name: &str, acpi_power_button: bool) -> VirtResult<()> {
        self.record(MockCall::Reboot { name: name.to_string(), acpi: acpi_power_button });
        let host = self.read()?;
        if host.domain(name)?.state != DomainState::Running {
            return Err(VirtError::Failed("Requested operation is not valid: domain is not running".to_string()));
        }
        Ok(())
    }

    fn undefine_domain(&self, name: &str, mode: UndefineMode) -> VirtResult<()> {
        self.record(MockCall::Undefine { name: name.to_string(), mode });
        if mode == UndefineMode::WithCleanup && self.faults().undefine_cleanup_unsupported {
            return Err(VirtError::Failed("unsupported flags (0x6)".to_string()));
        }
        let mut host = self.write()?;
        host.domain(name)?;
        host.domains.remove(name);
        Ok(())
    }

    fn attach_device(&self, name: &str, xml: &str, scope: DeviceScope) -> VirtResult<()> {
        self.record(MockCall::AttachDevice { name: name.to_string(), scope });
        self.write()?.domain_mut(name)?.devices.push(xml.to_string());
        Ok(())
    }

    fn detach_device(&self, name: &str, xml: &str, scope: DeviceScope) -> VirtResult<()> {
        self.record(MockCall::DetachDevice { name: name.to_string(), scope });
        let mut host = self.write()?;
        let devices = &mut host.domain_mut(name)?.devices;
        let index = devices
            .iter()
            .position(|d| d == xml)
            .ok_or_else(|| VirtError::Failed("device not found".to_string()))?;
        devices.remove(index);
        Ok(())
    }

    fn cpu_stats(&self, name: &str) -> VirtResult<CpuStats> {
        self.read()?.domain(name)?;
        Ok(CpuStats {
            cpu_time: Some(1_500_000_000),
            user_time: Some(1_000_000_000),
            system_time: Some(500_000_000),
        })
    }

    fn memory_stats(&self, name: &str) -> VirtResult<MemoryStats> {
        let host = self.read()?;
        let memory = host.domain(name)?.memory;
        Ok(MemoryStats {
            actual: Some(memory),
            unused: Some(memory / 2),
            available: Some(memory),
            usable: Some(memory / 2),
        })
    }

    fn block_stats(&self, name: &str, _device: &str) -> VirtResult<BlockStats> {
        self.read()?.domain(name)?;
        if self.faults().block_stats_fail {
            return Err(VirtError::Failed("block stats unavailable".to_string()));
        }
        Ok(BlockStats {
            rd_bytes: 4096,
            wr_bytes: 8192,
            rd_reqs: 4,
            wr_reqs: 8,
        })
    }

    fn interface_stats(&self, name: &str, _device: &str) -> VirtResult<InterfaceStats> {
        self.read()?.domain(name)?;
        if self.faults().interface_stats_fail {
            return Err(VirtError::Failed("interface stats unavailable".to_string()));
        }
        Ok(InterfaceStats {
            rx_bytes: 1000,
            tx_bytes: 2000,
            rx_packets: 10,
            tx_packets: 20,
        })
    }

    fn active_network_names(&self) -> VirtResult<Vec<String>> {
        let host = self.read()?;
        Ok(host.networks.iter().filter(|(_, n)| n.active).map(|(k, _)| k.clone()).collect())
    }

    fn defined_network_names(&self) -> VirtResult<Vec<String>> {
        let host = self.read()?;
        Ok(host.networks.iter().filter(|(_, n)| !n.active).map(|(k, _)| k.clone()).collect())
    }

    fn network_info(&self, name: &str) -> VirtResult<NetworkInfo> {
        let host = self.read()?;
        let net = host.networks.get(name).ok_or_else(|| VirtError::NoSuchObject {
            kind: ObjectKind::Network,
            name: name.to_string(),
        })?;
        Ok(NetworkInfo {
            name: name.to_string(),
            uuid: net.uuid.clone(),
            state: if net.active { NetworkState::Active } else { NetworkState::Inactive },
            bridge_name: net.bridge.clone(),
            autostart: true,
            persistent: true,
        })
    }

    fn active_pool_names(&self) -> VirtResult<Vec<String>> {
        let host = self.read()?;
        Ok(host
            .pools
            .iter()
            .filter(|(_, p)| p.state == StoragePoolState::Running)
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn defined_pool_names(&self) -> VirtResult<Vec<String>> {
        let host = self.read()?;
        Ok(host
            .pools
            .iter()
            .filter(|(_, p)| p.state != StoragePoolState::Running)
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn pool_info(&self, name: &str) -> VirtResult<StoragePoolInfo> {
        let host = self.read()?;
        let pool = host.pools.get(name).ok_or_else(|| VirtError::NoSuchObject {
            kind: ObjectKind::StoragePool,
            name: name.to_string(),
        })?;
        Ok(StoragePoolInfo {
            name: name.to_string(),
            uuid: pool.uuid.clone(),
            state: pool.state,
            capacity: pool.capacity,
            allocation: pool.allocation,
            available: pool.capacity - pool.allocation,
            autostart: true,
            persistent: true,
        })
    }
}

/// Connector handing out one shared [`MockSession`].
#[derive(Clone)]
pub struct MockConnector {
    session: Arc<MockSession>,
    opens: Arc<AtomicUsize>,
    open_delay: Duration,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            session: Arc::new(MockSession::new()),
            opens: Arc::new(AtomicUsize::new(0)),
            open_delay: Duration::ZERO,
        }
    }

    /// Make every open take at least `delay`.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn session(&self) -> Arc<MockSession> {
        Arc::clone(&self.session)
    }

    /// Successful opens so far.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, uri: &str, readonly: bool) -> VirtResult<Arc<dyn HypervisorSession>> {
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        if self.session.faults().open_fails {
            return Err(VirtError::Failed(format!("unable to connect to {}", uri)));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        info!(uri = %uri, readonly, "Opened mock hypervisor session");
        Ok(self.session.clone() as Arc<dyn HypervisorSession>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const XML: &str = "<domain type='kvm'><name>test-vm</name><memory unit='KiB'>1048576</memory><vcpu>2</vcpu></domain>";

    #[test]
    fn test_define_and_start() {
        let session = MockSession::new();
        let name = session.define_domain(XML).unwrap();
        assert_eq!(name, "test-vm");
        assert_eq!(session.domain_state(&name).unwrap(), DomainState::Shutoff);
        assert!(session.active_domain_ids().unwrap().is_empty());

        session.start_domain(&name, false).unwrap();
        let info = session.domain_info(&name).unwrap();
        assert_eq!(info.state, DomainState::Running);
        assert_eq!(info.vcpus, 2);
        assert!(info.id.is_some());
        assert!(session.start_domain(&name, false).is_err());
    }

    #[test]
    fn test_transient_domain_vanishes_on_stop() {
        let session = MockSession::new();
        let name = session.create_transient_domain(XML).unwrap();
        assert_eq!(session.domain_state(&name).unwrap(), DomainState::Running);
        assert!(session.defined_domain_names().unwrap().is_empty());

        session.destroy_domain(&name).unwrap();
        assert!(matches!(
            session.domain_state(&name),
            Err(VirtError::NoSuchObject { .. })
        ));
    }

    #[test]
    fn test_seeded_networks_and_pools() {
        let session = MockSession::new();
        assert_eq!(session.active_network_names().unwrap(), vec!["default"]);
        assert_eq!(session.active_pool_names().unwrap(), vec!["default"]);
        assert!(session.network_info("missing").is_err());
    }
}
