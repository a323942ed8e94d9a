//! Maps named operations to gated component calls.
//!
//! Every call runs authorize, start, execute, complete. Mutating
//! operations always answer with an `OperationResult` envelope; reads
//! return their data model and propagate errors.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use libvirt_mcp_hypervisor::operations as ops;
use libvirt_mcp_hypervisor::{
    DeviceSpec, DomainCreateParams, DomainStateFilter, HypervisorError, LifecycleOutcome,
    OperationResult, Result, VirtClient,
};

use crate::security::{summarize_result, CallerContext, SecurityGate};

/// Every operation the dispatcher accepts, by tool name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ListDomains,
    DomainInfo,
    DomainStats,
    HostInfo,
    ListNetworks,
    ListStoragePools,
    GetDomainXml,
    GenerateDeviceXml,
    CreateDomain,
    DeleteDomain,
    StartDomain,
    StopDomain,
    RebootDomain,
    AttachDevice,
    DetachDevice,
}

impl Operation {
    pub const ALL: [Operation; 15] = [
        Self::ListDomains,
        Self::DomainInfo,
        Self::DomainStats,
        Self::HostInfo,
        Self::ListNetworks,
        Self::ListStoragePools,
        Self::GetDomainXml,
        Self::GenerateDeviceXml,
        Self::CreateDomain,
        Self::DeleteDomain,
        Self::StartDomain,
        Self::StopDomain,
        Self::RebootDomain,
        Self::AttachDevice,
        Self::DetachDevice,
    ];

    pub fn tool_name(&self) -> &'static str {
        match self {
            Self::ListDomains => "list_domains",
            Self::DomainInfo => "domain_info",
            Self::DomainStats => "domain_stats",
            Self::HostInfo => "host_info",
            Self::ListNetworks => "list_networks",
            Self::ListStoragePools => "list_storage_pools",
            Self::GetDomainXml => "get_domain_xml",
            Self::GenerateDeviceXml => "generate_device_xml",
            Self::CreateDomain => "create_domain",
            Self::DeleteDomain => "delete_domain",
            Self::StartDomain => "start_domain",
            Self::StopDomain => "stop_domain",
            Self::RebootDomain => "reboot_domain",
            Self::AttachDevice => "attach_device",
            Self::DetachDevice => "detach_device",
        }
    }

    /// Allow-list key.
    pub fn key(&self) -> &'static str {
        match self {
            Self::ListDomains => ops::DOMAIN_LIST,
            Self::DomainInfo => ops::DOMAIN_INFO,
            Self::DomainStats => ops::DOMAIN_STATS,
            Self::HostInfo => ops::HOST_INFO,
            Self::ListNetworks => ops::NETWORK_LIST,
            Self::ListStoragePools => ops::STORAGE_LIST,
            Self::GetDomainXml => ops::DOMAIN_GETXML,
            Self::GenerateDeviceXml => ops::DEVICE_GENERATE,
            Self::CreateDomain => ops::DOMAIN_CREATE,
            Self::DeleteDomain => ops::DOMAIN_DELETE,
            Self::StartDomain => ops::DOMAIN_START,
            Self::StopDomain => ops::DOMAIN_STOP,
            Self::RebootDomain => ops::DOMAIN_REBOOT,
            Self::AttachDevice => ops::DOMAIN_ATTACH_DEVICE,
            Self::DetachDevice => ops::DOMAIN_DETACH_DEVICE,
        }
    }

    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Self::CreateDomain
                | Self::DeleteDomain
                | Self::StartDomain
                | Self::StopDomain
                | Self::RebootDomain
                | Self::AttachDevice
                | Self::DetachDevice
        )
    }

    /// Phrase used in failure messages, e.g. "Failed to start domain vm1".
    fn failure_phrase(&self) -> &'static str {
        match self {
            Self::CreateDomain => "create domain",
            Self::DeleteDomain => "delete domain",
            Self::StartDomain => "start domain",
            Self::StopDomain => "stop domain",
            Self::RebootDomain => "reboot domain",
            Self::AttachDevice => "attach device to domain",
            Self::DetachDevice => "detach device from domain",
            _ => "query domain",
        }
    }
}

impl FromStr for Operation {
    type Err = HypervisorError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|op| op.tool_name() == s)
            .ok_or_else(|| HypervisorError::Operation(format!("Unknown operation: {}", s)))
    }
}

// =============================================================================
// ARGUMENTS
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ListDomainsArgs {
    state: DomainStateFilter,
    include_inactive: bool,
}

impl Default for ListDomainsArgs {
    fn default() -> Self {
        Self {
            state: DomainStateFilter::All,
            include_inactive: true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct NameArgs {
    #[serde(alias = "domain_name")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct PowerArgs {
    #[serde(alias = "domain_name")]
    name: String,
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Deserialize)]
struct DeleteArgs {
    #[serde(alias = "domain_name")]
    name: String,
    #[serde(default)]
    remove_storage: bool,
    #[serde(default)]
    force: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct DeviceArgs {
    #[serde(alias = "domain_name")]
    name: String,
    device_xml: String,
    #[serde(default = "default_true")]
    live: bool,
    #[serde(default = "default_true")]
    persistent: bool,
}

/// Decoded arguments, one variant per operation.
#[derive(Debug)]
enum Request {
    ListDomains(ListDomainsArgs),
    DomainInfo(NameArgs),
    DomainStats(NameArgs),
    HostInfo,
    ListNetworks,
    ListStoragePools,
    GetDomainXml(NameArgs),
    GenerateDeviceXml(DeviceSpec),
    CreateDomain(DomainCreateParams),
    DeleteDomain(DeleteArgs),
    StartDomain(PowerArgs),
    StopDomain(PowerArgs),
    RebootDomain(PowerArgs),
    AttachDevice(DeviceArgs),
    DetachDevice(DeviceArgs),
}

fn decode<T: DeserializeOwned>(operation: Operation, arguments: &Value) -> Result<T> {
    serde_json::from_value(arguments.clone()).map_err(|e| {
        HypervisorError::Operation(format!("Invalid arguments for {}: {}", operation.tool_name(), e))
    })
}

impl Request {
    fn decode(operation: Operation, arguments: &Value) -> Result<Self> {
        let request = match operation {
            Operation::ListDomains => Self::ListDomains(decode(operation, arguments)?),
            Operation::DomainInfo => Self::DomainInfo(decode(operation, arguments)?),
            Operation::DomainStats => Self::DomainStats(decode(operation, arguments)?),
            Operation::HostInfo => Self::HostInfo,
            Operation::ListNetworks => Self::ListNetworks,
            Operation::ListStoragePools => Self::ListStoragePools,
            Operation::GetDomainXml => Self::GetDomainXml(decode(operation, arguments)?),
            Operation::GenerateDeviceXml => Self::GenerateDeviceXml(decode(operation, arguments)?),
            Operation::CreateDomain => Self::CreateDomain(decode(operation, arguments)?),
            Operation::DeleteDomain => Self::DeleteDomain(decode(operation, arguments)?),
            Operation::StartDomain => Self::StartDomain(decode(operation, arguments)?),
            Operation::StopDomain => Self::StopDomain(decode(operation, arguments)?),
            Operation::RebootDomain => Self::RebootDomain(decode(operation, arguments)?),
            Operation::AttachDevice => Self::AttachDevice(decode(operation, arguments)?),
            Operation::DetachDevice => Self::DetachDevice(decode(operation, arguments)?),
        };
        Ok(request)
    }

    fn domain_name(&self) -> Option<&str> {
        match self {
            Self::DomainInfo(a) | Self::DomainStats(a) | Self::GetDomainXml(a) => Some(&a.name),
            Self::StartDomain(a) | Self::StopDomain(a) | Self::RebootDomain(a) => Some(&a.name),
            Self::DeleteDomain(a) => Some(&a.name),
            Self::AttachDevice(a) | Self::DetachDevice(a) => Some(&a.name),
            Self::CreateDomain(p) => Some(&p.name),
            Self::ListDomains(_)
            | Self::HostInfo
            | Self::ListNetworks
            | Self::ListStoragePools
            | Self::GenerateDeviceXml(_) => None,
        }
    }

    fn descriptor(&self) -> Option<&str> {
        match self {
            Self::CreateDomain(p) => p.xml.as_deref(),
            Self::AttachDevice(a) | Self::DetachDevice(a) => Some(&a.device_xml),
            _ => None,
        }
    }
}

// =============================================================================
// DISPATCHER
// =============================================================================

pub struct Dispatcher {
    client: Arc<VirtClient>,
    gate: Arc<SecurityGate>,
}

impl Dispatcher {
    pub fn new(client: Arc<VirtClient>, gate: Arc<SecurityGate>) -> Self {
        Self { client, gate }
    }

    pub fn client(&self) -> &VirtClient {
        &self.client
    }

    pub fn gate(&self) -> &SecurityGate {
        &self.gate
    }

    /// Run one named operation.
    ///
    /// Unknown names are an error for every caller. For known mutating
    /// operations every failure is folded into the returned envelope.
    #[instrument(skip(self, arguments, caller), fields(user = caller.user_name()))]
    pub async fn dispatch(&self, operation: &str, arguments: Value, caller: &CallerContext) -> Result<Value> {
        let operation: Operation = operation.parse()?;
        let arguments = if arguments.is_null() { json!({}) } else { arguments };

        let outcome = self.gated(operation, &arguments, caller).await;

        match outcome {
            Ok(value) => Ok(value),
            Err(e) if operation.is_mutating() => {
                let name = arguments
                    .get("name")
                    .or_else(|| arguments.get("domain_name"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                error!(operation = operation.tool_name(), domain = name, error = %e, "Operation failed");
                Ok(failure_envelope(operation, name, &e))
            }
            Err(e) => {
                error!(operation = operation.tool_name(), error = %e, "Operation failed");
                Err(e)
            }
        }
    }

    async fn gated(&self, operation: Operation, arguments: &Value, caller: &CallerContext) -> Result<Value> {
        let key = operation.key();

        // Policy first: a denied call is denied whatever its arguments
        self.gate.validate_operation(key, caller).await?;

        let request_id = Uuid::new_v4();
        let started = Instant::now();
        self.gate.record_start(request_id, key, caller, arguments);

        let result = self.checked_execute(operation, arguments, caller).await;

        let summary = match &result {
            Ok(value) => summarize_result(value),
            Err(e) => json!({ "success": false, "error": e.kind(), "message": e.message() }),
        };
        self.gate
            .complete_operation(request_id, key, caller, arguments, summary, started.elapsed())
            .await;

        result
    }

    async fn checked_execute(&self, operation: Operation, arguments: &Value, caller: &CallerContext) -> Result<Value> {
        let request = Request::decode(operation, arguments)?;
        if let Some(name) = request.domain_name() {
            self.gate.validate_domain_name(name, caller)?;
        }
        if let Some(xml) = request.descriptor() {
            self.gate.validate_descriptor(xml, caller)?;
        }
        self.execute(request).await
    }

    async fn execute(&self, request: Request) -> Result<Value> {
        let client = &self.client;

        match request {
            Request::ListDomains(args) => {
                let domains: Vec<_> = client
                    .list_domains(args.include_inactive)
                    .await?
                    .into_iter()
                    .filter(|d| args.state.matches(d.state))
                    .collect();
                debug!(count = domains.len(), "Listed domains");
                to_value(&domains)
            }
            Request::DomainInfo(args) => to_value(&client.domain_info(&args.name).await?),
            Request::DomainStats(args) => to_value(&client.domain_stats(&args.name).await?),
            Request::HostInfo => to_value(&client.host_info().await?),
            Request::ListNetworks => to_value(&client.list_networks().await?),
            Request::ListStoragePools => to_value(&client.list_storage_pools().await?),
            Request::GetDomainXml(args) => Ok(Value::String(client.domain_xml(&args.name).await?)),
            Request::GenerateDeviceXml(spec) => {
                debug!(device_type = spec.kind(), "Generating device descriptor");
                Ok(Value::String(spec.to_xml()?))
            }

            Request::CreateDomain(params) => {
                let name = client.create_domain_from_params(&params).await?;
                info!(domain = %name, ephemeral = params.ephemeral, "Domain created");
                envelope(
                    OperationResult::ok(format!("Domain {} created successfully", name))
                        .with_detail("domain", &name)
                        .with_detail("ephemeral", params.ephemeral)
                        .with_detail("memory", params.memory)
                        .with_detail("vcpus", params.vcpus),
                )
            }
            Request::DeleteDomain(args) => {
                let report = client.delete_domain(&args.name, args.remove_storage, args.force).await?;
                info!(domain = %args.name, "Domain deleted");
                envelope(
                    OperationResult::ok(format!("Domain {} deleted successfully", args.name))
                        .with_detail("domain", &args.name)
                        .with_detail("remove_storage", args.remove_storage)
                        .with_detail("force", args.force)
                        .with_detail("destroyed", report.destroyed)
                        .with_detail("storage_paths", &report.storage_paths)
                        .with_detail("storage_removed", &report.storage_removed),
                )
            }
            Request::StartDomain(args) => {
                let outcome = client.start_domain(&args.name, args.force).await?;
                let message = match outcome {
                    LifecycleOutcome::Applied => format!("Domain {} started successfully", args.name),
                    LifecycleOutcome::AlreadyInState => format!("Domain {} is already running", args.name),
                };
                envelope(
                    OperationResult::ok(message)
                        .with_detail("domain", &args.name)
                        .with_detail("outcome", outcome),
                )
            }
            Request::StopDomain(args) => {
                let outcome = client.stop_domain(&args.name, args.force).await?;
                let message = match outcome {
                    LifecycleOutcome::Applied => format!("Domain {} stopped successfully", args.name),
                    LifecycleOutcome::AlreadyInState => format!("Domain {} is already stopped", args.name),
                };
                envelope(
                    OperationResult::ok(message)
                        .with_detail("domain", &args.name)
                        .with_detail("force", args.force)
                        .with_detail("outcome", outcome),
                )
            }
            Request::RebootDomain(args) => {
                client.reboot_domain(&args.name, args.force).await?;
                envelope(
                    OperationResult::ok(format!("Domain {} rebooted successfully", args.name))
                        .with_detail("domain", &args.name)
                        .with_detail("force", args.force),
                )
            }
            Request::AttachDevice(args) => {
                let scope = client
                    .attach_device(&args.name, &args.device_xml, args.live, args.persistent)
                    .await?;
                envelope(
                    OperationResult::ok(format!("Device attached to domain {} successfully", args.name))
                        .with_detail("domain", &args.name)
                        .with_detail("scope", scope),
                )
            }
            Request::DetachDevice(args) => {
                let scope = client
                    .detach_device(&args.name, &args.device_xml, args.live, args.persistent)
                    .await?;
                envelope(
                    OperationResult::ok(format!("Device detached from domain {} successfully", args.name))
                        .with_detail("domain", &args.name)
                        .with_detail("scope", scope),
                )
            }
        }
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|e| HypervisorError::Operation(format!("Failed to encode result: {}", e)))
}

fn envelope(result: OperationResult) -> Result<Value> {
    to_value(&result)
}

fn failure_envelope(operation: Operation, name: &str, e: &HypervisorError) -> Value {
    let message = match e {
        HypervisorError::NotFound(m) => m.clone(),
        other => format!("Failed to {} {}: {}", operation.failure_phrase(), name, other.message()),
    };
    let result = OperationResult::failed(message)
        .with_detail("domain", name)
        .with_detail("error", e.message())
        .with_detail("kind", e.kind());
    serde_json::to_value(&result).unwrap_or(Value::Null)
}
