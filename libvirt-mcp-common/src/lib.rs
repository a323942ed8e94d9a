//! # libvirt-mcp Common
//!
//! Shared utilities for the libvirt-mcp crates.
//!
//! ## Logging
//!
//! ```rust,ignore
//! use libvirt_mcp_common::init_logging;
//!
//! init_logging("info").unwrap();
//! tracing::info!(domain = "vm1", "Domain started");
//! ```
//!
//! All console output goes to stderr. Stdout is reserved for the
//! operation transport.

pub mod logging;

pub use logging::{init_logging, init_logging_json, init_logging_with_file, LogGuard};
