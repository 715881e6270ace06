//! Composition root.
//!
//! An [`Engine`] owns one hypervisor connection and the command executor for
//! the same host, and hands out the managers built on top of them.

use std::sync::Arc;
use tracing::info;

use crate::config::EngineConfig;
use crate::connection::{Connection, MockConnection};
use crate::error::Result;
use crate::exec::{Executor, MockExecutor};
use crate::ids::{IdGenerator, UuidGenerator};
use crate::inspect::HostInspector;
use crate::lifecycle::DomainManager;
use crate::media::{IsoBuilder, NoCloudIsoBuilder, PasswordReset};
use crate::snapshot::SnapshotManager;
use crate::storage::{ImageTool, MockImageTool, QemuImg, StorageManager};
use crate::uri::ConnectionTarget;

/// Everything needed to manage one hypervisor host.
pub struct Engine {
    config: EngineConfig,
    connection: Arc<dyn Connection>,
    executor: Arc<dyn Executor>,
    domains: DomainManager,
    storage: StorageManager,
    snapshots: SnapshotManager,
    host: HostInspector,
    passwords: PasswordReset,
}

impl Engine {
    /// Wire the managers with the stock image and ISO tools, run through
    /// `executor`.
    pub fn new(
        config: EngineConfig,
        connection: Arc<dyn Connection>,
        executor: Arc<dyn Executor>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        let images: Arc<dyn ImageTool> = Arc::new(QemuImg::new(executor.clone(), config.tools.qemu_img.clone()));
        let isos: Arc<dyn IsoBuilder> = Arc::new(NoCloudIsoBuilder::new(
            executor.clone(),
            config.domain.iso_dir.clone(),
            config.tools.iso_tools.clone(),
        ));
        Self::with_tools(config, connection, executor, ids, images, isos)
    }

    /// Wire the managers with caller-supplied image and ISO tools.
    pub fn with_tools(
        config: EngineConfig,
        connection: Arc<dyn Connection>,
        executor: Arc<dyn Executor>,
        ids: Arc<dyn IdGenerator>,
        images: Arc<dyn ImageTool>,
        isos: Arc<dyn IsoBuilder>,
    ) -> Self {
        let domains = DomainManager::new(connection.clone(), executor.clone(), isos, config.domain.clone());
        let storage = StorageManager::new(connection.clone(), executor.clone(), images, ids, config.storage.clone());
        let snapshots = SnapshotManager::new(connection.clone());
        let host = HostInspector::new(connection.clone());
        let passwords = PasswordReset::new(connection.clone(), executor.clone(), config.tools.virt_customize.clone());

        Self {
            config,
            connection,
            executor,
            domains,
            storage,
            snapshots,
            host,
            passwords,
        }
    }

    /// An engine backed entirely by in-memory mocks. Nothing touches the host.
    pub fn in_memory(config: EngineConfig) -> Self {
        let connection = Arc::new(MockConnection::new());
        let executor: Arc<dyn Executor> = Arc::new(MockExecutor::new());
        let images: Arc<dyn ImageTool> = Arc::new(MockImageTool::new(connection.clone()));
        let isos: Arc<dyn IsoBuilder> = Arc::new(NoCloudIsoBuilder::new(
            executor.clone(),
            config.domain.iso_dir.clone(),
            config.tools.iso_tools.clone(),
        ));
        info!("Using in-memory hypervisor");
        Self::with_tools(config, connection, executor, Arc::new(UuidGenerator), images, isos)
    }

    /// Connect to the hypervisor named by `config.uri`.
    ///
    /// Remote URIs (`qemu+ssh://`) get an SSH executor for the same host.
    #[cfg(feature = "libvirt")]
    pub async fn connect(config: EngineConfig) -> Result<Self> {
        use crate::connection::LibvirtConnection;
        use crate::exec::executor_for;

        let target = ConnectionTarget::parse(&config.uri)?;
        let uri = target.uri().to_string();
        let connection = tokio::task::spawn_blocking(move || LibvirtConnection::open(&uri))
            .await
            .map_err(|e| crate::error::HypervisorError::Internal(format!("connect task failed: {}", e)))??;

        let executor = executor_for(&target, &config);
        info!(target = %executor.describe(), remote = target.is_remote(), "Engine connected");
        Ok(Self::new(config, Arc::new(connection), executor, Arc::new(UuidGenerator)))
    }

    /// Without libvirt support only the URI is checked.
    #[cfg(not(feature = "libvirt"))]
    pub async fn connect(config: EngineConfig) -> Result<Self> {
        let target = ConnectionTarget::parse(&config.uri)?;
        Err(crate::error::HypervisorError::Unsupported(format!(
            "cannot connect to {}: built without libvirt support",
            target.uri()
        )))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    pub fn domains(&self) -> &DomainManager {
        &self.domains
    }

    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    pub fn host(&self) -> &HostInspector {
        &self.host
    }

    pub fn passwords(&self) -> &PasswordReset {
        &self.passwords
    }

    pub async fn is_alive(&self) -> Result<bool> {
        self.connection.is_alive().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_engine_is_alive() {
        let engine = Engine::in_memory(EngineConfig::default());

        assert!(engine.is_alive().await.unwrap());
        assert_eq!(engine.executor().describe(), "mock");
        assert!(engine.domains().list().await.unwrap().is_empty());
    }

    #[cfg(not(feature = "libvirt"))]
    #[tokio::test]
    async fn test_connect_without_libvirt() {
        let err = Engine::connect(EngineConfig::default()).await.err().unwrap();
        assert!(matches!(err, crate::error::HypervisorError::Unsupported(_)));
    }
}
