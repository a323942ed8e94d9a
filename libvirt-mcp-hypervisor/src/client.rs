//! Component facade over the connection.
//!
//! Queries live in `query.rs`, mutating operations in `lifecycle.rs`.
//! Both follow the same order: allow-list check, input validation,
//! then the hypervisor.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::connection::ConnectionManager;
use crate::error::{HypervisorError, Result};
use crate::operations::AllowList;
use crate::session::{HypervisorSession, VirtError};

/// Default directory for generated disk image paths.
pub const DEFAULT_IMAGES_DIR: &str = "/var/lib/libvirt/images";

pub struct VirtClient {
    connection: ConnectionManager,
    allowed: Arc<AllowList>,
    images_dir: PathBuf,
}

impl VirtClient {
    pub fn new(connection: ConnectionManager, allowed: Arc<AllowList>) -> Self {
        Self {
            connection,
            allowed,
            images_dir: PathBuf::from(DEFAULT_IMAGES_DIR),
        }
    }

    pub fn with_images_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.images_dir = dir.into();
        self
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    pub fn allowed(&self) -> &AllowList {
        &self.allowed
    }

    pub(crate) fn authorize(&self, operation: &str) -> Result<()> {
        self.allowed.check(operation)
    }

    /// Live session, reconnecting first if a previous probe dropped it.
    pub(crate) async fn session(&self) -> Result<Arc<dyn HypervisorSession>> {
        self.connection.connect().await?;
        self.connection.ensure().await
    }
}

/// Map a session error for an action on a named object.
pub(crate) fn virt_error(action: &str, err: VirtError) -> HypervisorError {
    match err {
        VirtError::NoSuchObject { .. } => HypervisorError::NotFound(err.to_string()),
        VirtError::Failed(msg) => HypervisorError::Operation(format!("Failed to {}: {}", action, msg)),
    }
}
