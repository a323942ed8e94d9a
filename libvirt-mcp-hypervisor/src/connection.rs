//! Ownership of the single hypervisor connection.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::{HypervisorError, Result};
use crate::session::{Connector, HypervisorSession};

/// Where and how to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub uri: String,
    pub readonly: bool,
    pub timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            uri: "qemu:///system".to_string(),
            readonly: false,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Lazily opened connection handle.
///
/// `connect`, `ensure` and `disconnect` serialize on one lock. Callers
/// get a cloned session handle back and use it without further locking.
pub struct ConnectionManager {
    settings: ConnectionSettings,
    connector: Arc<dyn Connector>,
    handle: Mutex<Option<Arc<dyn HypervisorSession>>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, settings: ConnectionSettings) -> Self {
        Self {
            settings,
            connector,
            handle: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Open the connection if not already open.
    #[instrument(skip(self), fields(uri = %self.settings.uri, readonly = self.settings.readonly))]
    pub async fn connect(&self) -> Result<()> {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            debug!("Already connected");
            return Ok(());
        }

        info!("Connecting to hypervisor");

        let uri = &self.settings.uri;
        let opened = tokio::time::timeout(
            self.settings.timeout,
            self.connector.open(uri, self.settings.readonly),
        )
        .await
        .map_err(|_| {
            HypervisorError::Connection(format!(
                "Timed out after {}s connecting to {}",
                self.settings.timeout.as_secs(),
                uri
            ))
        })?
        .map_err(|e| HypervisorError::Connection(format!("Failed to connect to {}: {}", uri, e)))?;

        *handle = Some(opened);
        info!("Connected to hypervisor");
        Ok(())
    }

    /// Verify the connection is alive and hand out the session.
    ///
    /// A failed probe drops the handle; the next `connect` opens a new one.
    pub async fn ensure(&self) -> Result<Arc<dyn HypervisorSession>> {
        let mut handle = self.handle.lock().await;
        let session = handle
            .as_ref()
            .cloned()
            .ok_or_else(|| HypervisorError::Connection("not connected".to_string()))?;

        if let Err(e) = session.probe() {
            warn!(uri = %self.settings.uri, error = %e, "Hypervisor connection lost");
            *handle = None;
            return Err(HypervisorError::Connection("connection lost".to_string()));
        }

        Ok(session)
    }

    /// Release the handle. Close errors are logged, never returned.
    #[instrument(skip(self), fields(uri = %self.settings.uri))]
    pub async fn disconnect(&self) {
        let mut handle = self.handle.lock().await;
        if let Some(session) = handle.take() {
            match session.close() {
                Ok(()) => info!("Disconnected from hypervisor"),
                Err(e) => warn!(error = %e, "Error while closing hypervisor connection"),
            }
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.handle.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCall, MockConnector};

    fn manager(connector: &MockConnector) -> ConnectionManager {
        ConnectionManager::new(Arc::new(connector.clone()), ConnectionSettings::default())
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let connector = MockConnector::new();
        let manager = manager(&connector);

        manager.connect().await.unwrap();
        manager.connect().await.unwrap();

        assert_eq!(connector.open_count(), 1);
        assert!(manager.is_connected().await);
    }

    #[tokio::test]
    async fn test_connect_failure_names_uri() {
        let connector = MockConnector::new();
        connector.session().faults().open_fails = true;
        let manager = manager(&connector);

        let err = manager.connect().await.unwrap_err();
        assert_eq!(err.kind(), "connection_error");
        assert!(err.message().contains("qemu:///system"));
        assert!(!manager.is_connected().await);
    }

    #[tokio::test]
    async fn test_connect_times_out() {
        let connector = MockConnector::new().with_open_delay(Duration::from_millis(200));
        let manager = ConnectionManager::new(
            Arc::new(connector),
            ConnectionSettings {
                timeout: Duration::from_millis(20),
                ..Default::default()
            },
        );

        let err = manager.connect().await.unwrap_err();
        assert!(err.message().contains("Timed out"));
    }

    #[tokio::test]
    async fn test_ensure_drops_dead_handle() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        manager.connect().await.unwrap();
        assert!(manager.ensure().await.is_ok());

        connector.session().faults().probe_fails = true;
        let err = manager.ensure().await.err().unwrap();
        assert_eq!(err, HypervisorError::Connection("connection lost".to_string()));
        assert!(!manager.is_connected().await);

        // Caller reconnects explicitly
        connector.session().faults().probe_fails = false;
        manager.connect().await.unwrap();
        assert!(manager.ensure().await.is_ok());
        assert_eq!(connector.open_count(), 2);
    }

    #[tokio::test]
    async fn test_ensure_without_connect() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        assert!(manager.ensure().await.is_err());
        assert_eq!(connector.open_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_swallows_close_errors() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        manager.connect().await.unwrap();

        connector.session().faults().close_fails = true;
        manager.disconnect().await;

        assert!(!manager.is_connected().await);
        assert!(connector.session().calls().contains(&MockCall::Close));

        // Disconnecting twice is harmless
        manager.disconnect().await;
    }
}
