//! # libvirt-mcp
//!
//! Serves policy-gated virtualization operations over line-delimited JSON
//! on stdin/stdout. Logs go to stderr.
//!
//! ## Usage
//! ```bash
//! libvirt-mcp --config /etc/libvirt-mcp/config.yaml
//! libvirt-mcp --dev --log-level debug
//! libvirt-mcp --generate-config ./config.yaml
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use tracing::{error, info};

use libvirt_mcp_server::cli::Args;
use libvirt_mcp_server::config::{Config, LogFormat};
use libvirt_mcp_server::server;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    if let Some(ref path) = args.generate_config {
        let yaml = Config::default().to_yaml()?;
        std::fs::write(path, yaml).with_context(|| format!("Failed to write config file: {}", path))?;
        println!("Default configuration written to {}", path);
        return Ok(());
    }

    // Load configuration: file, then environment, then CLI flags
    let config = Config::resolve(args.config.as_deref())?
        .with_env_overrides()?
        .with_cli_overrides(&args);
    config.validate()?;

    if args.check_config {
        print!("{}", config.to_yaml()?);
        return Ok(());
    }

    // Initialize logging; the guard flushes the file writer on exit
    let _guard = match config.logging.file {
        Some(ref file) => Some(libvirt_mcp_common::init_logging_with_file(
            &config.logging.level,
            config.logging.format == LogFormat::Json,
            Path::new(file),
        )?),
        None => {
            match config.logging.format {
                LogFormat::Json => libvirt_mcp_common::init_logging_json(&config.logging.level)?,
                LogFormat::Pretty => libvirt_mcp_common::init_logging(&config.logging.level)?,
            }
            None
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        uri = %config.libvirt.uri,
        dev = args.dev,
        "Starting libvirt-mcp"
    );

    if let Err(e) = server::run(config, args.dev).await {
        error!(error = %e, "Server failed");
        return Err(e);
    }

    Ok(())
}
