//! Hypervisor connection abstraction.
//!
//! [`Connection`] is the request/response surface the managers drive. Every
//! object is addressed by name and every document crosses the boundary as
//! XML text, which is how libvirt itself exchanges them. Implementations:
//!
//! - [`MockConnection`] - in-memory, for tests and `--dev` mode
//! - `LibvirtConnection` - real libvirt, behind the `libvirt` feature

mod mock;

#[cfg(feature = "libvirt")]
mod libvirt;

pub use mock::{FailurePoint, MockConnection};

#[cfg(feature = "libvirt")]
pub use self::libvirt::LibvirtConnection;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::*;

/// Hypervisor RPC surface.
///
/// Calls carry no client-side deadline; long-running hypervisor operations
/// block until the daemon answers.
#[async_trait]
pub trait Connection: Send + Sync {
    /// The URI this connection was opened with.
    fn uri(&self) -> String;

    /// Whether the connection is still usable.
    async fn is_alive(&self) -> Result<bool>;

    // =========================================================================
    // Domains
    // =========================================================================

    /// Define (or redefine) a persistent domain.
    async fn define_domain(&self, xml: &str) -> Result<()>;

    async fn undefine_domain(&self, name: &str, flags: UndefineFlags) -> Result<()>;

    /// Domain document; `inactive` selects the persistent definition.
    async fn domain_xml(&self, name: &str, inactive: bool) -> Result<String>;

    async fn domain_state(&self, name: &str) -> Result<DomainState>;

    async fn list_domains(&self) -> Result<Vec<DomainSummary>>;

    async fn start_domain(&self, name: &str) -> Result<()>;

    /// Ask the guest to shut down. Returns without waiting.
    async fn shutdown_domain(&self, name: &str) -> Result<()>;

    /// Power off immediately.
    async fn destroy_domain(&self, name: &str) -> Result<()>;

    async fn reboot_domain(&self, name: &str) -> Result<()>;

    async fn suspend_domain(&self, name: &str) -> Result<()>;

    async fn resume_domain(&self, name: &str) -> Result<()>;

    async fn set_memory(&self, name: &str, kib: u64, flags: ModifyFlags) -> Result<()>;

    async fn set_vcpus(&self, name: &str, count: u32, flags: ModifyFlags) -> Result<()>;

    async fn set_autostart(&self, name: &str, autostart: bool) -> Result<()>;

    async fn attach_device(&self, name: &str, xml: &str, flags: ModifyFlags) -> Result<()>;

    async fn detach_device(&self, name: &str, xml: &str, flags: ModifyFlags) -> Result<()>;

    // =========================================================================
    // Storage pools
    // =========================================================================

    async fn list_pools(&self) -> Result<Vec<String>>;

    async fn pool_xml(&self, name: &str) -> Result<String>;

    async fn pool_runtime(&self, name: &str) -> Result<PoolRuntime>;

    async fn pool_autostart(&self, name: &str) -> Result<bool>;

    async fn define_pool(&self, xml: &str) -> Result<()>;

    /// Create the pool's backing location (directory, filesystem, ...).
    async fn build_pool(&self, name: &str) -> Result<()>;

    async fn start_pool(&self, name: &str) -> Result<()>;

    async fn set_pool_autostart(&self, name: &str, autostart: bool) -> Result<()>;

    async fn refresh_pool(&self, name: &str) -> Result<()>;

    /// Stop an active pool.
    async fn destroy_pool(&self, name: &str) -> Result<()>;

    /// Remove the pool's backing location.
    async fn delete_pool(&self, name: &str) -> Result<()>;

    async fn undefine_pool(&self, name: &str) -> Result<()>;

    // =========================================================================
    // Storage volumes
    // =========================================================================

    async fn list_volumes(&self, pool: &str) -> Result<Vec<String>>;

    async fn volume_xml(&self, pool: &str, name: &str) -> Result<String>;

    async fn create_volume(&self, pool: &str, xml: &str) -> Result<()>;

    async fn delete_volume(&self, pool: &str, name: &str) -> Result<()>;

    async fn resize_volume(&self, pool: &str, name: &str, capacity_bytes: u64) -> Result<()>;

    // =========================================================================
    // Snapshots
    // =========================================================================

    async fn create_snapshot(&self, domain: &str, xml: &str, flags: SnapshotCreateFlags) -> Result<String>;

    /// Documents of every snapshot of a domain.
    async fn list_snapshot_xmls(&self, domain: &str) -> Result<Vec<String>>;

    async fn snapshot_xml(&self, domain: &str, name: &str) -> Result<String>;

    /// Name of the current snapshot, if any.
    async fn current_snapshot(&self, domain: &str) -> Result<Option<String>>;

    async fn revert_snapshot(&self, domain: &str, name: &str, flags: SnapshotRevertFlags) -> Result<()>;

    async fn delete_snapshot(&self, domain: &str, name: &str, flags: SnapshotDeleteFlags) -> Result<()>;

    // =========================================================================
    // Host
    // =========================================================================

    async fn capabilities_xml(&self) -> Result<String>;

    async fn sysinfo_xml(&self) -> Result<String>;

    /// Node device documents, optionally restricted to a capability (`pci`, `net`, ...).
    async fn node_device_xmls(&self, capability: Option<&str>) -> Result<Vec<String>>;
}
