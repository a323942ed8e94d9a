//! Mutating domain operations.
//!
//! ```text
//!  undefined --create--> shutoff --start--> running --stop--> shutoff
//!                                            |  ^
//!                                            +--+ reboot
//!  any state --delete(force if running)--> undefined
//! ```

use std::path::Path;
use tracing::{debug, info, instrument, warn};

use crate::client::{virt_error, VirtClient};
use crate::error::{HypervisorError, Result};
use crate::operations;
use crate::types::*;
use crate::xml::{inspect, DomainXmlBuilder};

impl VirtClient {
    /// Submit a descriptor. Returns the new domain's name.
    #[instrument(skip(self, xml), fields(xml_len = xml.len()))]
    pub async fn create_domain(&self, xml: &str, ephemeral: bool) -> Result<String> {
        self.authorize(operations::DOMAIN_CREATE)?;
        check_descriptor(xml, "invalid domain format")?;

        let session = self.session().await?;
        let name = if ephemeral {
            session
                .create_transient_domain(xml)
                .map_err(|e| virt_error("create transient domain", e))?
        } else {
            session.define_domain(xml).map_err(|e| virt_error("define domain", e))?
        };

        info!(domain = %name, ephemeral, "Domain created");
        Ok(name)
    }

    /// Generate a descriptor from parameters and submit it.
    ///
    /// A raw `xml` in the parameters replaces generation entirely.
    #[instrument(skip(self, params), fields(domain = %params.name))]
    pub async fn create_domain_from_params(&self, params: &DomainCreateParams) -> Result<String> {
        self.authorize(operations::DOMAIN_CREATE)?;

        let xml = match &params.xml {
            Some(xml) => xml.clone(),
            None => {
                let xml = DomainXmlBuilder::new(params, self.images_dir()).build()?;
                debug!(xml = %xml, "Generated domain XML");
                xml
            }
        };

        self.create_domain(&xml, params.ephemeral).await
    }

    #[instrument(skip(self))]
    pub async fn start_domain(&self, name: &str, force: bool) -> Result<LifecycleOutcome> {
        self.authorize(operations::DOMAIN_START)?;
        let session = self.session().await?;
        let action = format!("start domain {}", name);

        let state = session.domain_state(name).map_err(|e| virt_error(&action, e))?;
        if state == DomainState::Running {
            debug!("Domain already running");
            return Ok(LifecycleOutcome::AlreadyInState);
        }

        session.start_domain(name, force).map_err(|e| virt_error(&action, e))?;
        info!(force, "Domain started");
        Ok(LifecycleOutcome::Applied)
    }

    /// Graceful shutdown is requested, not awaited. `force` destroys.
    #[instrument(skip(self))]
    pub async fn stop_domain(&self, name: &str, force: bool) -> Result<LifecycleOutcome> {
        self.authorize(operations::DOMAIN_STOP)?;
        let session = self.session().await?;
        let action = format!("stop domain {}", name);

        let state = session.domain_state(name).map_err(|e| virt_error(&action, e))?;
        if state == DomainState::Shutoff {
            debug!("Domain already stopped");
            return Ok(LifecycleOutcome::AlreadyInState);
        }

        if force {
            session.destroy_domain(name).map_err(|e| virt_error(&action, e))?;
            info!("Domain destroyed");
        } else {
            session.shutdown_domain(name).map_err(|e| virt_error(&action, e))?;
            info!("Domain shutdown requested");
        }
        Ok(LifecycleOutcome::Applied)
    }

    #[instrument(skip(self))]
    pub async fn reboot_domain(&self, name: &str, force: bool) -> Result<()> {
        self.authorize(operations::DOMAIN_REBOOT)?;
        let session = self.session().await?;

        session
            .reboot_domain(name, force)
            .map_err(|e| virt_error(&format!("reboot domain {}", name), e))?;
        info!(force, "Domain reboot requested");
        Ok(())
    }

    /// Remove a domain definition, optionally with its disk images.
    ///
    /// Disk paths are read before undefining. File removal is
    /// best-effort; only the undefine decides success.
    #[instrument(skip(self))]
    pub async fn delete_domain(&self, name: &str, remove_storage: bool, force: bool) -> Result<DeleteReport> {
        self.authorize(operations::DOMAIN_DELETE)?;
        let session = self.session().await?;
        let action = format!("delete domain {}", name);
        let mut report = DeleteReport::default();

        let info = session.domain_info(name).map_err(|e| virt_error(&action, e))?;
        if info.state.is_active() && !force {
            return Err(HypervisorError::Operation(format!(
                "Domain {} is running. Use force=true to delete a running domain",
                name
            )));
        }

        // Read disks first: a transient domain is gone once destroyed
        if remove_storage {
            let xml = session.domain_xml(name).map_err(|e| virt_error(&action, e))?;
            report.storage_paths = inspect::disk_sources(&xml).unwrap_or_else(|e| {
                warn!(error = %e, "Could not read disk sources, leaving storage in place");
                Vec::new()
            });
        }

        if info.state.is_active() {
            session.destroy_domain(name).map_err(|e| virt_error(&action, e))?;
            report.destroyed = true;
            info!("Domain destroyed before delete");
        }

        if info.persistent {
            if let Err(e) = session.undefine_domain(name, UndefineMode::WithCleanup) {
                debug!(error = %e, "Undefine with cleanup flags failed, retrying plain");
                session
                    .undefine_domain(name, UndefineMode::Plain)
                    .map_err(|e| virt_error(&action, e))?;
            }
            info!("Domain undefined");
        } else {
            debug!("Transient domain removed by destroy, nothing to undefine");
        }

        for path in &report.storage_paths {
            if remove_file(Path::new(path)).await {
                report.storage_removed.push(path.clone());
            }
        }

        Ok(report)
    }

    #[instrument(skip(self, device_xml))]
    pub async fn attach_device(&self, name: &str, device_xml: &str, live: bool, persistent: bool) -> Result<DeviceScope> {
        self.authorize(operations::DOMAIN_ATTACH_DEVICE)?;
        check_descriptor(device_xml, "invalid device format")?;

        let scope = DeviceScope::from_flags(live, persistent);
        let session = self.session().await?;
        session
            .attach_device(name, device_xml, scope)
            .map_err(|e| virt_error(&format!("attach device to domain {}", name), e))?;
        info!(scope = ?scope, "Device attached");
        Ok(scope)
    }

    #[instrument(skip(self, device_xml))]
    pub async fn detach_device(&self, name: &str, device_xml: &str, live: bool, persistent: bool) -> Result<DeviceScope> {
        self.authorize(operations::DOMAIN_DETACH_DEVICE)?;
        check_descriptor(device_xml, "invalid device format")?;

        let scope = DeviceScope::from_flags(live, persistent);
        let session = self.session().await?;
        session
            .detach_device(name, device_xml, scope)
            .map_err(|e| virt_error(&format!("detach device from domain {}", name), e))?;
        info!(scope = ?scope, "Device detached");
        Ok(scope)
    }
}

fn check_descriptor(xml: &str, what: &str) -> Result<()> {
    inspect::check_well_formed(xml)
        .map_err(|reason| HypervisorError::Operation(format!("{}: {}", what, reason)))
}

async fn remove_file(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            info!(path = %path.display(), "Removed disk image");
            true
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to remove disk image");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionManager, ConnectionSettings};
    use crate::session::HypervisorSession;
    use crate::mock::{MockCall, MockConnector};
    use crate::operations::AllowList;
    use crate::xml::{DeviceSpec, DiskDevice};
    use std::sync::Arc;

    fn client(connector: &MockConnector) -> VirtClient {
        let manager = ConnectionManager::new(Arc::new(connector.clone()), ConnectionSettings::default());
        let allowed = AllowList::new([
            operations::DOMAIN_CREATE,
            operations::DOMAIN_START,
            operations::DOMAIN_STOP,
            operations::DOMAIN_REBOOT,
            operations::DOMAIN_DELETE,
            operations::DOMAIN_ATTACH_DEVICE,
            operations::DOMAIN_DETACH_DEVICE,
        ]);
        VirtClient::new(manager, Arc::new(allowed))
    }

    fn domain_xml(name: &str, disks: &[&Path]) -> String {
        let disks: String = disks
            .iter()
            .map(|p| format!("<disk type='file' device='disk'><source file='{}'/></disk>", p.display()))
            .collect();
        format!("<domain><name>{}</name><devices>{}</devices></domain>", name, disks)
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let connector = MockConnector::new();
        let session = connector.session();
        session.insert_domain(&domain_xml("vm", &[]), DomainState::Shutoff).unwrap();
        let client = client(&connector);

        assert_eq!(client.start_domain("vm", true).await.unwrap(), LifecycleOutcome::Applied);
        assert!(session.calls().contains(&MockCall::Start { name: "vm".to_string(), force_boot: true }));

        session.clear_calls();
        assert_eq!(client.start_domain("vm", false).await.unwrap(), LifecycleOutcome::AlreadyInState);
        assert!(session.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let connector = MockConnector::new();
        let session = connector.session();
        session.insert_domain(&domain_xml("vm", &[]), DomainState::Shutoff).unwrap();
        let client = client(&connector);

        assert_eq!(client.stop_domain("vm", false).await.unwrap(), LifecycleOutcome::AlreadyInState);
        assert!(session.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stop_graceful_and_forced() {
        let connector = MockConnector::new();
        let session = connector.session();
        session.insert_domain(&domain_xml("a", &[]), DomainState::Running).unwrap();
        session.insert_domain(&domain_xml("b", &[]), DomainState::Running).unwrap();
        let client = client(&connector);

        client.stop_domain("a", false).await.unwrap();
        client.stop_domain("b", true).await.unwrap();
        let calls = session.calls();
        assert!(calls.contains(&MockCall::Shutdown("a".to_string())));
        assert!(calls.contains(&MockCall::Destroy("b".to_string())));
    }

    #[tokio::test]
    async fn test_reboot_maps_force_to_acpi() {
        let connector = MockConnector::new();
        let session = connector.session();
        session.insert_domain(&domain_xml("vm", &[]), DomainState::Running).unwrap();
        let client = client(&connector);

        client.reboot_domain("vm", true).await.unwrap();
        assert_eq!(session.calls(), vec![MockCall::Reboot { name: "vm".to_string(), acpi: true }]);
    }

    #[tokio::test]
    async fn test_lifecycle_on_missing_domain() {
        let connector = MockConnector::new();
        let client = client(&connector);
        assert_eq!(client.start_domain("ghost", false).await.unwrap_err().kind(), "not_found");
        assert_eq!(client.stop_domain("ghost", true).await.unwrap_err().kind(), "not_found");
        assert_eq!(client.delete_domain("ghost", true, true).await.unwrap_err().kind(), "not_found");
    }

    #[tokio::test]
    async fn test_create_persistent_and_ephemeral() {
        let connector = MockConnector::new();
        let session = connector.session();
        let client = client(&connector);

        let name = client.create_domain(&domain_xml("persistent", &[]), false).await.unwrap();
        assert_eq!(name, "persistent");
        assert_eq!(session.domain_state("persistent").unwrap(), DomainState::Shutoff);

        let name = client.create_domain(&domain_xml("scratch", &[]), true).await.unwrap();
        assert_eq!(session.domain_state(&name).unwrap(), DomainState::Running);
        assert!(matches!(session.calls()[1], MockCall::CreateTransient(_)));
    }

    #[tokio::test]
    async fn test_create_rejects_malformed_without_connecting() {
        let connector = MockConnector::new();
        let client = client(&connector);

        let err = client.create_domain("<domain><name>x</name>", false).await.unwrap_err();
        assert!(err.message().starts_with("invalid domain format"));
        assert_eq!(connector.open_count(), 0);
    }

    #[tokio::test]
    async fn test_create_from_params() {
        let connector = MockConnector::new();
        let client = client(&connector).with_images_dir("/srv/images");

        let params = DomainCreateParams {
            name: "vm1".to_string(),
            memory: 1_048_576,
            vcpus: 1,
            ..Default::default()
        };
        let name = client.create_domain_from_params(&params).await.unwrap();
        assert_eq!(name, "vm1");

        let xml = connector.session().domain_xml("vm1").unwrap();
        assert_eq!(inspect::disk_sources(&xml).unwrap(), vec!["/srv/images/vm1.qcow2"]);
    }

    #[tokio::test]
    async fn test_delete_running_requires_force() {
        let connector = MockConnector::new();
        let session = connector.session();
        session.insert_domain(&domain_xml("busy", &[]), DomainState::Running).unwrap();
        let client = client(&connector);

        let err = client.delete_domain("busy", false, false).await.unwrap_err();
        assert!(err.message().contains("force"));
        assert_eq!(session.domain_state("busy").unwrap(), DomainState::Running);
    }

    #[tokio::test]
    async fn test_delete_with_storage_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("root.qcow2");
        let missing = dir.path().join("gone.qcow2");
        std::fs::write(&present, b"qcow").unwrap();

        let connector = MockConnector::new();
        let session = connector.session();
        session
            .insert_domain(&domain_xml("doomed", &[&present, &missing]), DomainState::Running)
            .unwrap();
        let client = client(&connector);

        let report = client.delete_domain("doomed", true, true).await.unwrap();

        assert!(report.destroyed);
        assert_eq!(report.storage_paths.len(), 2);
        assert_eq!(report.storage_removed, vec![present.display().to_string()]);
        assert!(!present.exists());
        assert!(session.domain_state("doomed").is_err());

        let calls = session.calls();
        assert_eq!(calls[0], MockCall::Destroy("doomed".to_string()));
        assert_eq!(
            calls[1],
            MockCall::Undefine { name: "doomed".to_string(), mode: UndefineMode::WithCleanup }
        );
    }

    #[tokio::test]
    async fn test_delete_falls_back_to_plain_undefine() {
        let connector = MockConnector::new();
        let session = connector.session();
        session.insert_domain(&domain_xml("old", &[]), DomainState::Shutoff).unwrap();
        session.faults().undefine_cleanup_unsupported = true;
        let client = client(&connector);

        let report = client.delete_domain("old", false, false).await.unwrap();
        assert!(!report.destroyed);
        assert!(report.storage_paths.is_empty());
        assert_eq!(
            session.calls().last(),
            Some(&MockCall::Undefine { name: "old".to_string(), mode: UndefineMode::Plain })
        );
    }

    #[tokio::test]
    async fn test_force_delete_transient_domain() {
        let dir = tempfile::tempdir().unwrap();
        let disk = dir.path().join("tmp1.qcow2");
        std::fs::write(&disk, b"qcow").unwrap();

        let connector = MockConnector::new();
        let session = connector.session();
        let client = client(&connector);
        client.create_domain(&domain_xml("tmp1", &[&disk]), true).await.unwrap();

        let report = client.delete_domain("tmp1", true, true).await.unwrap();
        assert!(report.destroyed);
        assert_eq!(report.storage_removed, vec![disk.display().to_string()]);
        assert!(session.domain_state("tmp1").is_err());
        assert!(!session.calls().iter().any(|c| matches!(c, MockCall::Undefine { .. })));
    }

    #[tokio::test]
    async fn test_delete_with_unreadable_disks_keeps_storage() {
        let connector = MockConnector::new();
        let session = connector.session();
        // Attribute without a value: the name reads fine, the disk walk does not
        let xml = "<domain><name>odd</name><devices><disk device><source file='/x.img'/></disk></devices></domain>";
        session.insert_domain(xml, DomainState::Shutoff).unwrap();
        let client = client(&connector);

        let report = client.delete_domain("odd", true, false).await.unwrap();
        assert!(report.storage_paths.is_empty());
        assert!(report.storage_removed.is_empty());
        assert!(session.domain_state("odd").is_err());
    }

    #[tokio::test]
    async fn test_attach_malformed_never_connects() {
        let connector = MockConnector::new();
        let client = client(&connector);

        let err = client.attach_device("vm", "not xml", true, true).await.unwrap_err();
        assert_eq!(err.kind(), "operation_error");
        assert!(err.message().starts_with("invalid device format"));
        assert_eq!(connector.open_count(), 0);
        assert!(connector.session().calls().is_empty());
    }

    #[tokio::test]
    async fn test_attach_and_detach_scopes() {
        let connector = MockConnector::new();
        let session = connector.session();
        session.insert_domain(&domain_xml("vm", &[]), DomainState::Running).unwrap();
        let client = client(&connector);
        let disk = DeviceSpec::Disk(DiskDevice::default()).to_xml().unwrap();

        assert_eq!(client.attach_device("vm", &disk, true, false).await.unwrap(), DeviceScope::Live);
        assert_eq!(session.attached_devices("vm").unwrap().len(), 1);
        assert_eq!(client.detach_device("vm", &disk, false, true).await.unwrap(), DeviceScope::Config);
        assert!(session.attached_devices("vm").unwrap().is_empty());

        assert_eq!(
            session.calls(),
            vec![
                MockCall::AttachDevice { name: "vm".to_string(), scope: DeviceScope::Live },
                MockCall::DetachDevice { name: "vm".to_string(), scope: DeviceScope::Config },
            ]
        );
    }
}
