//! Libvirt session implementation.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::error::{Error as LibvirtError, ErrorNumber};
use virt::network::Network;
use virt::storage_pool::StoragePool;
use virt::sys;

use crate::session::{Connector, HypervisorSession, ObjectKind, VirtError, VirtResult};
use crate::types::*;
use crate::xml::inspect;

/// Opens libvirt connections on the blocking thread pool.
#[derive(Debug, Default, Clone)]
pub struct LibvirtConnector;

impl LibvirtConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for LibvirtConnector {
    #[instrument(skip(self))]
    async fn open(&self, uri: &str, readonly: bool) -> VirtResult<Arc<dyn HypervisorSession>> {
        info!("Connecting to libvirt");
        let target = uri.to_string();

        let connection = tokio::task::spawn_blocking(move || {
            if readonly {
                Connect::open_read_only(Some(&target))
            } else {
                Connect::open(Some(&target))
            }
        })
        .await
        .map_err(|e| VirtError::Failed(format!("connect task failed: {}", e)))?
        .map_err(|e| VirtError::Failed(e.to_string()))?;

        info!("Connected to libvirt");
        Ok(Arc::new(LibvirtSession {
            uri: uri.to_string(),
            connection,
        }))
    }
}

/// Libvirt/QEMU session.
pub struct LibvirtSession {
    uri: String,
    connection: Connect,
}

impl LibvirtSession {
    fn domain(&self, name: &str) -> VirtResult<Domain> {
        Domain::lookup_by_name(&self.connection, name)
            .map_err(|e| lookup_error(ObjectKind::Domain, name, e))
    }

    fn network(&self, name: &str) -> VirtResult<Network> {
        Network::lookup_by_name(&self.connection, name)
            .map_err(|e| lookup_error(ObjectKind::Network, name, e))
    }

    fn pool(&self, name: &str) -> VirtResult<StoragePool> {
        StoragePool::lookup_by_name(&self.connection, name)
            .map_err(|e| lookup_error(ObjectKind::StoragePool, name, e))
    }
}

fn lookup_error(kind: ObjectKind, name: &str, e: LibvirtError) -> VirtError {
    match e.code() {
        ErrorNumber::NoDomain | ErrorNumber::NoNetwork | ErrorNumber::NoStoragePool => {
            VirtError::NoSuchObject {
                kind,
                name: name.to_string(),
            }
        }
        _ => failed(e),
    }
}

fn failed(e: LibvirtError) -> VirtError {
    VirtError::Failed(e.to_string())
}

/// libvirt packs versions as major * 1_000_000 + minor * 1_000 + micro.
fn format_version(version: u32) -> String {
    format!("{}.{}.{}", version / 1_000_000, (version / 1_000) % 1_000, version % 1_000)
}

fn non_negative(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

impl HypervisorSession for LibvirtSession {
    fn probe(&self) -> VirtResult<()> {
        match self.connection.is_alive() {
            Ok(true) => Ok(()),
            Ok(false) => Err(VirtError::Failed("connection is not alive".to_string())),
            Err(e) => Err(failed(e)),
        }
    }

    fn close(&self) -> VirtResult<()> {
        // Drops this session's reference; the last clone frees the connection.
        let mut connection = self.connection.clone();
        connection.close().map(|_| ()).map_err(failed)
    }

    #[instrument(skip(self))]
    fn host_info(&self) -> VirtResult<HostInfo> {
        let c = &self.connection;
        let node = c.get_node_info().map_err(failed)?;
        let caps = c.get_capabilities().map_err(failed)?;
        let cpu_arch = inspect::text_at_path(&caps, &["capabilities", "host", "cpu", "arch"])
            .map_err(VirtError::Failed)?
            .unwrap_or_default();

        Ok(HostInfo {
            hostname: c.get_hostname().map_err(failed)?,
            uri: c.get_uri().unwrap_or_else(|_| self.uri.clone()),
            hypervisor_type: c.get_type().map_err(failed)?,
            hypervisor_version: format_version(c.get_hyp_version().map_err(failed)?),
            libvirt_version: format_version(c.get_lib_version().map_err(failed)?),
            cpu_model: node.model,
            cpu_arch,
            cpu_cores: node.cores,
            cpu_threads: node.threads,
            cpu_sockets: node.sockets,
            cpu_mhz: node.mhz,
            // virNodeInfo reports KiB already; free memory comes in bytes
            memory_size: node.memory,
            memory_free: c.get_free_memory().map_err(failed)? / 1024,
            numa_nodes: node.nodes,
        })
    }

    fn active_domain_ids(&self) -> VirtResult<Vec<u32>> {
        self.connection.list_domains().map_err(failed)
    }

    fn domain_name_by_id(&self, id: u32) -> VirtResult<String> {
        let domain = Domain::lookup_by_id(&self.connection, id)
            .map_err(|e| lookup_error(ObjectKind::Domain, &format!("id {}", id), e))?;
        domain.get_name().map_err(failed)
    }

    fn defined_domain_names(&self) -> VirtResult<Vec<String>> {
        self.connection.list_defined_domains().map_err(failed)
    }

    fn domain_info(&self, name: &str) -> VirtResult<DomainInfo> {
        let domain = self.domain(name)?;
        let info = domain.get_info().map_err(failed)?;

        Ok(DomainInfo {
            name: domain.get_name().map_err(failed)?,
            uuid: domain.get_uuid_string().map_err(failed)?,
            id: domain.get_id(),
            state: DomainState::from_code(info.state as u32),
            max_memory: info.max_mem,
            memory: info.memory,
            vcpus: info.nr_virt_cpu,
            cpu_time: info.cpu_time,
            autostart: domain.get_autostart().unwrap_or(false),
            persistent: domain.is_persistent().unwrap_or(false),
        })
    }

    fn domain_state(&self, name: &str) -> VirtResult<DomainState> {
        let (state, _reason) = self.domain(name)?.get_state().map_err(failed)?;
        Ok(DomainState::from_code(state as u32))
    }

    fn domain_xml(&self, name: &str) -> VirtResult<String> {
        self.domain(name)?.get_xml_desc(0).map_err(failed)
    }

    #[instrument(skip(self, xml))]
    fn define_domain(&self, xml: &str) -> VirtResult<String> {
        let domain = Domain::define_xml(&self.connection, xml).map_err(failed)?;
        domain.get_name().map_err(failed)
    }

    #[instrument(skip(self, xml))]
    fn create_transient_domain(&self, xml: &str) -> VirtResult<String> {
        let domain = Domain::create_xml(&self.connection, xml, 0).map_err(failed)?;
        domain.get_name().map_err(failed)
    }

    fn start_domain(&self, name: &str, force_boot: bool) -> VirtResult<()> {
        let domain = self.domain(name)?;
        let flags = if force_boot { sys::VIR_DOMAIN_START_FORCE_BOOT } else { 0 };
        domain.create_with_flags(flags).map(|_| ()).map_err(failed)
    }

    fn shutdown_domain(&self, name: &str) -> VirtResult<()> {
        self.domain(name)?.shutdown().map(|_| ()).map_err(failed)
    }

    fn destroy_domain(&self, name: &str) -> VirtResult<()> {
        self.domain(name)?.destroy().map(|_| ()).map_err(failed)
    }

    fn reboot_domain(&self, name: &str, acpi_power_button: bool) -> VirtResult<()> {
        let flags = if acpi_power_button {
            sys::VIR_DOMAIN_REBOOT_ACPI_POWER_BTN
        } else {
            sys::VIR_DOMAIN_REBOOT_DEFAULT
        };
        self.domain(name)?.reboot(flags).map_err(failed)
    }

    fn undefine_domain(&self, name: &str, mode: UndefineMode) -> VirtResult<()> {
        let domain = self.domain(name)?;
        match mode {
            UndefineMode::WithCleanup => domain
                .undefine_flags(sys::VIR_DOMAIN_UNDEFINE_MANAGED_SAVE | sys::VIR_DOMAIN_UNDEFINE_NVRAM)
                .map_err(failed),
            UndefineMode::Plain => domain.undefine().map_err(failed),
        }
    }

    fn attach_device(&self, name: &str, xml: &str, scope: DeviceScope) -> VirtResult<()> {
        debug!(domain = %name, scope = ?scope, "Attaching device");
        self.domain(name)?
            .attach_device_flags(xml, affect_flags(scope))
            .map(|_| ())
            .map_err(failed)
    }

    fn detach_device(&self, name: &str, xml: &str, scope: DeviceScope) -> VirtResult<()> {
        debug!(domain = %name, scope = ?scope, "Detaching device");
        self.domain(name)?
            .detach_device_flags(xml, affect_flags(scope))
            .map(|_| ())
            .map_err(failed)
    }

    fn cpu_stats(&self, name: &str) -> VirtResult<CpuStats> {
        let info = self.domain(name)?.get_info().map_err(failed)?;
        // The user/system split is only exposed through typed parameters
        Ok(CpuStats {
            cpu_time: Some(info.cpu_time),
            user_time: None,
            system_time: None,
        })
    }

    fn memory_stats(&self, name: &str) -> VirtResult<MemoryStats> {
        let samples = self.domain(name)?.memory_stats(0).map_err(failed)?;
        let mut stats = MemoryStats::default();
        for sample in samples {
            match sample.tag {
                sys::VIR_DOMAIN_MEMORY_STAT_ACTUAL_BALLOON => stats.actual = Some(sample.val),
                sys::VIR_DOMAIN_MEMORY_STAT_UNUSED => stats.unused = Some(sample.val),
                sys::VIR_DOMAIN_MEMORY_STAT_AVAILABLE => stats.available = Some(sample.val),
                sys::VIR_DOMAIN_MEMORY_STAT_USABLE => stats.usable = Some(sample.val),
                _ => {}
            }
        }
        Ok(stats)
    }

    fn block_stats(&self, name: &str, device: &str) -> VirtResult<BlockStats> {
        let s = self.domain(name)?.get_block_stats(device).map_err(failed)?;
        Ok(BlockStats {
            rd_bytes: non_negative(s.rd_bytes),
            wr_bytes: non_negative(s.wr_bytes),
            rd_reqs: non_negative(s.rd_req),
            wr_reqs: non_negative(s.wr_req),
        })
    }

    fn interface_stats(&self, name: &str, device: &str) -> VirtResult<InterfaceStats> {
        let s = self.domain(name)?.interface_stats(device).map_err(failed)?;
        Ok(InterfaceStats {
            rx_bytes: non_negative(s.rx_bytes),
            tx_bytes: non_negative(s.tx_bytes),
            rx_packets: non_negative(s.rx_packets),
            tx_packets: non_negative(s.tx_packets),
        })
    }

    fn active_network_names(&self) -> VirtResult<Vec<String>> {
        self.connection.list_networks().map_err(failed)
    }

    fn defined_network_names(&self) -> VirtResult<Vec<String>> {
        self.connection.list_defined_networks().map_err(failed)
    }

    fn network_info(&self, name: &str) -> VirtResult<NetworkInfo> {
        let net = self.network(name)?;
        let active = net.is_active().map_err(failed)?;
        Ok(NetworkInfo {
            name: name.to_string(),
            uuid: net.get_uuid_string().map_err(failed)?,
            state: if active { NetworkState::Active } else { NetworkState::Inactive },
            bridge_name: net.get_bridge_name().ok(),
            autostart: net.get_autostart().unwrap_or(false),
            persistent: net.is_persistent().unwrap_or(false),
        })
    }

    fn active_pool_names(&self) -> VirtResult<Vec<String>> {
        self.connection.list_storage_pools().map_err(failed)
    }

    fn defined_pool_names(&self) -> VirtResult<Vec<String>> {
        self.connection.list_defined_storage_pools().map_err(failed)
    }

    fn pool_info(&self, name: &str) -> VirtResult<StoragePoolInfo> {
        let pool = self.pool(name)?;
        let info = pool.get_info().map_err(failed)?;
        Ok(StoragePoolInfo {
            name: name.to_string(),
            uuid: pool.get_uuid_string().map_err(failed)?,
            state: StoragePoolState::from_code(info.state as u32),
            capacity: info.capacity,
            allocation: info.allocation,
            available: info.available,
            autostart: pool.get_autostart().unwrap_or(false),
            persistent: pool.is_persistent().unwrap_or(false),
        })
    }
}

fn affect_flags(scope: DeviceScope) -> u32 {
    match scope {
        DeviceScope::Both => sys::VIR_DOMAIN_AFFECT_LIVE | sys::VIR_DOMAIN_AFFECT_CONFIG,
        DeviceScope::Live => sys::VIR_DOMAIN_AFFECT_LIVE,
        DeviceScope::Config => sys::VIR_DOMAIN_AFFECT_CONFIG,
        DeviceScope::Current => sys::VIR_DOMAIN_AFFECT_CURRENT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_version() {
        assert_eq!(format_version(10_001_000), "10.1.0");
        assert_eq!(format_version(8_002_003), "8.2.3");
    }

    #[test]
    fn test_affect_flags() {
        assert_eq!(affect_flags(DeviceScope::Current), 0);
        assert_eq!(
            affect_flags(DeviceScope::Both),
            sys::VIR_DOMAIN_AFFECT_LIVE | sys::VIR_DOMAIN_AFFECT_CONFIG
        );
    }
}
