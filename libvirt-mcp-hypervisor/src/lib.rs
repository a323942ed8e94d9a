//! # libvirt-mcp Hypervisor
//!
//! Connection management, read-only queries, lifecycle operations and
//! descriptor generation over a hypervisor management library.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              VirtClient                 │
//! │  (allow-list, queries, lifecycle)       │
//! └─────────────────────┬───────────────────┘
//!                       │
//!            ConnectionManager (one handle)
//!                       │
//!         ┌─────────────┴─────────────┐
//!         ▼                           ▼
//! ┌───────────────────┐     ┌───────────────────┐
//! │ LibvirtConnector  │     │  MockConnector    │
//! │   (via virt)      │     │   (in memory)     │
//! └───────────────────┘     └───────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use libvirt_mcp_hypervisor::{AllowList, ConnectionManager, ConnectionSettings, MockConnector, VirtClient};
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = ConnectionManager::new(Arc::new(MockConnector::new()), ConnectionSettings::default());
//!     let client = VirtClient::new(manager, Arc::new(AllowList::default()));
//!
//!     for domain in client.list_domains(true).await.unwrap() {
//!         println!("{} {}", domain.name, domain.state);
//!     }
//! }
//! ```

pub mod client;
pub mod connection;
pub mod error;
pub mod libvirt;
mod lifecycle;
pub mod mock;
pub mod operations;
mod query;
pub mod session;
pub mod types;
pub mod xml;

pub use client::{VirtClient, DEFAULT_IMAGES_DIR};
pub use connection::{ConnectionManager, ConnectionSettings};
pub use error::{HypervisorError, Result};
pub use mock::{MockCall, MockConnector, MockSession};
pub use operations::AllowList;
pub use session::{Connector, HypervisorSession, VirtError};
pub use types::*;
pub use xml::{DeviceSpec, DomainXmlBuilder};

// Re-export libvirt backend when available
#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtConnector;
