//! Read-only queries.

use std::collections::HashSet;
use tracing::{debug, instrument, warn};

use crate::client::{virt_error, VirtClient};
use crate::error::{HypervisorError, Result};
use crate::operations;
use crate::session::{HypervisorSession, VirtResult};
use crate::types::*;
use crate::xml::inspect;

impl VirtClient {
    /// Active domains first, then defined-but-inactive ones when asked.
    /// Entries that fail to translate are skipped.
    #[instrument(skip(self))]
    pub async fn list_domains(&self, include_inactive: bool) -> Result<Vec<DomainInfo>> {
        self.authorize(operations::DOMAIN_LIST)?;
        let session = self.session().await?;

        let mut names = Vec::new();
        for id in session.active_domain_ids().map_err(|e| virt_error("list active domains", e))? {
            match session.domain_name_by_id(id) {
                Ok(name) => names.push(name),
                Err(e) => warn!(id, error = %e, "Skipping active domain"),
            }
        }
        if include_inactive {
            names.extend(
                session
                    .defined_domain_names()
                    .map_err(|e| virt_error("list defined domains", e))?,
            );
        }

        let mut seen = HashSet::new();
        let mut domains = Vec::with_capacity(names.len());
        for name in names {
            match session.domain_info(&name) {
                Ok(info) => {
                    if seen.insert(info.uuid.clone()) {
                        domains.push(info);
                    }
                }
                Err(e) => warn!(domain = %name, error = %e, "Skipping domain"),
            }
        }

        debug!(count = domains.len(), "Listed domains");
        Ok(domains)
    }

    #[instrument(skip(self))]
    pub async fn domain_info(&self, name: &str) -> Result<DomainInfo> {
        self.authorize(operations::DOMAIN_INFO)?;
        let session = self.session().await?;
        session
            .domain_info(name)
            .map_err(|e| virt_error(&format!("get info for domain {}", name), e))
    }

    /// Base record always; runtime sections only while running, each
    /// filled independently.
    #[instrument(skip(self))]
    pub async fn domain_stats(&self, name: &str) -> Result<DomainStats> {
        self.authorize(operations::DOMAIN_STATS)?;
        let session = self.session().await?;

        let state = session
            .domain_state(name)
            .map_err(|e| virt_error(&format!("get stats for domain {}", name), e))?;
        let mut stats = DomainStats::base(name, state);
        if state != DomainState::Running {
            return Ok(stats);
        }

        match session.cpu_stats(name) {
            Ok(cpu) => {
                stats.cpu_time = cpu.cpu_time;
                stats.cpu_user_time = cpu.user_time;
                stats.cpu_system_time = cpu.system_time;
            }
            Err(e) => debug!(domain = %name, error = %e, "CPU stats unavailable"),
        }

        match session.memory_stats(name) {
            Ok(mem) => {
                stats.memory_actual = mem.actual;
                stats.memory_unused = mem.unused;
                stats.memory_available = mem.available;
                stats.memory_usable = mem.usable;
            }
            Err(e) => debug!(domain = %name, error = %e, "Memory stats unavailable"),
        }

        let xml = match session.domain_xml(name) {
            Ok(xml) => xml,
            Err(e) => {
                debug!(domain = %name, error = %e, "Descriptor unavailable, skipping device stats");
                return Ok(stats);
            }
        };

        match sum_block_stats(session.as_ref(), name, &xml) {
            Ok(block) => {
                stats.block_rd_bytes = Some(block.rd_bytes);
                stats.block_wr_bytes = Some(block.wr_bytes);
                stats.block_rd_reqs = Some(block.rd_reqs);
                stats.block_wr_reqs = Some(block.wr_reqs);
            }
            Err(e) => debug!(domain = %name, error = %e, "Block stats unavailable"),
        }

        match sum_interface_stats(session.as_ref(), name, &xml) {
            Ok(net) => {
                stats.net_rx_bytes = Some(net.rx_bytes);
                stats.net_tx_bytes = Some(net.tx_bytes);
                stats.net_rx_pkts = Some(net.rx_packets);
                stats.net_tx_pkts = Some(net.tx_packets);
            }
            Err(e) => debug!(domain = %name, error = %e, "Interface stats unavailable"),
        }

        Ok(stats)
    }

    #[instrument(skip(self))]
    pub async fn host_info(&self) -> Result<HostInfo> {
        self.authorize(operations::HOST_INFO)?;
        let session = self.session().await?;
        session.host_info().map_err(|e| virt_error("get host info", e))
    }

    #[instrument(skip(self))]
    pub async fn list_networks(&self) -> Result<Vec<NetworkInfo>> {
        self.authorize(operations::NETWORK_LIST)?;
        let session = self.session().await?;
        collect_named(
            "network",
            session.active_network_names(),
            session.defined_network_names(),
            |name| session.network_info(name),
        )
    }

    #[instrument(skip(self))]
    pub async fn list_storage_pools(&self) -> Result<Vec<StoragePoolInfo>> {
        self.authorize(operations::STORAGE_LIST)?;
        let session = self.session().await?;
        collect_named(
            "storage pool",
            session.active_pool_names(),
            session.defined_pool_names(),
            |name| session.pool_info(name),
        )
    }

    #[instrument(skip(self))]
    pub async fn domain_xml(&self, name: &str) -> Result<String> {
        self.authorize(operations::DOMAIN_GETXML)?;
        let session = self.session().await?;
        session
            .domain_xml(name)
            .map_err(|e| virt_error(&format!("get XML for domain {}", name), e))
    }
}

fn collect_named<T>(
    kind: &str,
    active: VirtResult<Vec<String>>,
    defined: VirtResult<Vec<String>>,
    info: impl Fn(&str) -> VirtResult<T>,
) -> Result<Vec<T>> {
    let mut names = active.map_err(|e| virt_error(&format!("list active {}s", kind), e))?;
    names.extend(defined.map_err(|e| virt_error(&format!("list defined {}s", kind), e))?);

    let mut items = Vec::with_capacity(names.len());
    for name in names {
        match info(&name) {
            Ok(item) => items.push(item),
            Err(e) => warn!(kind, name = %name, error = %e, "Skipping entry"),
        }
    }
    Ok(items)
}

fn sum_block_stats(session: &dyn HypervisorSession, name: &str, xml: &str) -> Result<BlockStats> {
    let targets = inspect::disk_targets(xml).map_err(HypervisorError::Operation)?;
    let mut total = BlockStats::default();
    for dev in targets {
        let s = session
            .block_stats(name, &dev)
            .map_err(|e| virt_error(&format!("read block stats for {}", dev), e))?;
        total.accumulate(&s);
    }
    Ok(total)
}

fn sum_interface_stats(session: &dyn HypervisorSession, name: &str, xml: &str) -> Result<InterfaceStats> {
    let targets = inspect::interface_targets(xml).map_err(HypervisorError::Operation)?;
    let mut total = InterfaceStats::default();
    for dev in targets {
        let s = session
            .interface_stats(name, &dev)
            .map_err(|e| virt_error(&format!("read interface stats for {}", dev), e))?;
        total.accumulate(&s);
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionManager, ConnectionSettings};
    use crate::mock::MockConnector;
    use crate::operations::AllowList;
    use std::sync::Arc;

    const RUNNING_XML: &str = "<domain type='kvm'><name>web</name><memory>1048576</memory><vcpu>2</vcpu>\
        <devices>\
        <disk type='file' device='disk'><source file='/img/web.qcow2'/><target dev='vda'/></disk>\
        <disk type='file' device='disk'><source file='/img/data.qcow2'/><target dev='vdb'/></disk>\
        <interface type='network'><target dev='vnet0'/></interface>\
        </devices></domain>";

    fn client(connector: &MockConnector, allowed: AllowList) -> VirtClient {
        let manager = ConnectionManager::new(Arc::new(connector.clone()), ConnectionSettings::default());
        VirtClient::new(manager, Arc::new(allowed))
    }

    fn all_ops() -> AllowList {
        AllowList::new([
            operations::DOMAIN_LIST,
            operations::DOMAIN_INFO,
            operations::DOMAIN_STATS,
            operations::DOMAIN_GETXML,
            operations::HOST_INFO,
            operations::NETWORK_LIST,
            operations::STORAGE_LIST,
        ])
    }

    fn domain_xml(name: &str) -> String {
        format!("<domain><name>{}</name><memory>1024</memory><vcpu>1</vcpu></domain>", name)
    }

    #[tokio::test]
    async fn test_list_merges_active_and_inactive() {
        let connector = MockConnector::new();
        let session = connector.session();
        session.insert_domain(&domain_xml("alpha"), DomainState::Running).unwrap();
        session.insert_domain(&domain_xml("beta"), DomainState::Shutoff).unwrap();
        let client = client(&connector, all_ops());

        let all = client.list_domains(true).await.unwrap();
        let names: Vec<_> = all.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);

        let active = client.list_domains(false).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].state, DomainState::Running);
    }

    #[tokio::test]
    async fn test_list_skips_broken_entries() {
        let connector = MockConnector::new();
        let session = connector.session();
        session.insert_domain(&domain_xml("good"), DomainState::Shutoff).unwrap();
        session.insert_domain(&domain_xml("bad"), DomainState::Shutoff).unwrap();
        session.faults().broken_domains.insert("bad".to_string());
        let client = client(&connector, all_ops());

        let domains = client.list_domains(true).await.unwrap();
        assert_eq!(domains.len(), 1);
        assert_eq!(domains[0].name, "good");
    }

    #[tokio::test]
    async fn test_denied_before_connecting() {
        let connector = MockConnector::new();
        let client = client(&connector, AllowList::new([operations::DOMAIN_LIST]));

        let err = client.host_info().await.unwrap_err();
        assert_eq!(err.kind(), "permission_error");
        assert_eq!(connector.open_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_domain_is_not_found() {
        let connector = MockConnector::new();
        let client = client(&connector, all_ops());

        let err = client.domain_info("ghost").await.unwrap_err();
        assert_eq!(err, HypervisorError::NotFound("Domain ghost not found".to_string()));
        assert_eq!(client.domain_stats("ghost").await.unwrap_err().kind(), "not_found");
        assert_eq!(client.domain_xml("ghost").await.unwrap_err().kind(), "not_found");
    }

    #[tokio::test]
    async fn test_stats_for_stopped_domain_is_base_only() {
        let connector = MockConnector::new();
        connector.session().insert_domain(&domain_xml("idle"), DomainState::Shutoff).unwrap();
        let client = client(&connector, all_ops());

        let stats = client.domain_stats("idle").await.unwrap();
        assert_eq!(stats, DomainStats::base("idle", DomainState::Shutoff));
    }

    #[tokio::test]
    async fn test_stats_sum_devices_and_degrade_per_section() {
        let connector = MockConnector::new();
        connector.session().insert_domain(RUNNING_XML, DomainState::Running).unwrap();
        let client = client(&connector, all_ops());

        let stats = client.domain_stats("web").await.unwrap();
        assert_eq!(stats.cpu_time, Some(1_500_000_000));
        assert_eq!(stats.memory_actual, Some(1_048_576));
        // Two disks at 4096 read bytes each
        assert_eq!(stats.block_rd_bytes, Some(8192));
        assert_eq!(stats.net_rx_bytes, Some(1000));

        connector.session().faults().block_stats_fail = true;
        let stats = client.domain_stats("web").await.unwrap();
        assert_eq!(stats.block_rd_bytes, None);
        assert_eq!(stats.block_wr_reqs, None);
        assert_eq!(stats.net_tx_pkts, Some(20));
        assert_eq!(stats.cpu_user_time, Some(1_000_000_000));
    }

    #[tokio::test]
    async fn test_host_networks_pools() {
        let connector = MockConnector::new();
        let client = client(&connector, all_ops());

        let host = client.host_info().await.unwrap();
        assert_eq!(host.hostname, "mock-host");

        let networks = client.list_networks().await.unwrap();
        assert_eq!(networks.len(), 1);
        assert_eq!(networks[0].bridge_name.as_deref(), Some("virbr0"));

        let pools = client.list_storage_pools().await.unwrap();
        assert_eq!(pools[0].state, StoragePoolState::Running);
    }

    #[tokio::test]
    async fn test_reconnects_after_lost_connection() {
        let connector = MockConnector::new();
        let client = client(&connector, all_ops());
        client.list_domains(true).await.unwrap();

        connector.session().faults().probe_fails = true;
        let err = client.list_domains(true).await.unwrap_err();
        assert_eq!(err.kind(), "connection_error");

        connector.session().faults().probe_fails = false;
        client.list_domains(true).await.unwrap();
        assert_eq!(connector.open_count(), 2);
    }
}
