//! Command-line argument parsing.

use clap::Parser;

/// libvirt-mcp - Policy-gated virtualization management server
#[derive(Parser, Debug, Default)]
#[command(name = "libvirt-mcp")]
#[command(about = "libvirt-mcp - Policy-gated virtualization management server")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long, env = "MCP_CONFIG")]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Libvirt connection URI (e.g., qemu:///system)
    #[arg(long)]
    pub libvirt_uri: Option<String>,

    /// Open the hypervisor connection read-only
    #[arg(long)]
    pub readonly: bool,

    /// Enable development mode (mock hypervisor)
    #[arg(long)]
    pub dev: bool,

    /// Validate the configuration, print it and exit
    #[arg(long)]
    pub check_config: bool,

    /// Write the default configuration to this path and exit
    #[arg(long, value_name = "PATH")]
    pub generate_config: Option<String>,
}
