//! # libvirt-mcp Server
//!
//! Security gate, dispatcher, configuration and the stdio transport that
//! expose hypervisor operations to tool-calling clients.
//!
//! ```text
//! stdin line ──► Dispatcher ──► SecurityGate ──► VirtClient ──► hypervisor
//!                    │              (audit)
//! stdout line ◄──────┘
//! ```

pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod security;
pub mod server;

pub use config::Config;
pub use dispatcher::{Dispatcher, Operation};
pub use security::{CallerContext, SecurityGate};
