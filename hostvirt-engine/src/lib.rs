//! # hostvirt engine
//!
//! Domain and storage orchestration for a single QEMU/KVM host, local or
//! reached over SSH.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                         Engine                           │
//! │  DomainManager  StorageManager  SnapshotManager  Host... │
//! └───────────────┬─────────────────────────┬────────────────┘
//!                 │                         │
//!                 ▼                         ▼
//!       ┌───────────────────┐     ┌───────────────────┐
//!       │    Connection     │     │     Executor      │
//!       │ libvirt RPC / mock│     │ local / ssh / mock│
//!       └───────────────────┘     └───────────────────┘
//! ```
//!
//! Hypervisor objects are exchanged as XML documents, decoded into the typed
//! descriptors of [`descriptor`]. File work on the host (`qemu-img`, ISO
//! authoring, directory ownership) goes through the [`Executor`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hostvirt_engine::{DomainSpec, Engine, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> hostvirt_engine::Result<()> {
//!     let engine = Engine::in_memory(EngineConfig::default());
//!
//!     let spec = DomainSpec {
//!         name: "web-1".into(),
//!         memory_mib: 2048,
//!         vcpus: 2,
//!         disk_path: "/var/lib/libvirt/images/web-1.qcow2".into(),
//!         ..Default::default()
//!     };
//!     engine.domains().define(&spec).await?;
//!     engine.domains().start("web-1").await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod exec;
pub mod ids;
pub mod inspect;
pub mod lifecycle;
pub mod media;
pub mod snapshot;
pub mod storage;
pub mod types;
pub mod uri;

pub use config::EngineConfig;
pub use connection::{Connection, FailurePoint, MockConnection};
pub use descriptor::{DomainDescriptor, DomainSpec, SnapshotDescriptor};
pub use engine::Engine;
pub use error::{HypervisorError, Result};
pub use exec::{Executor, MockExecutor};
pub use ids::{IdGenerator, SequentialIds, UuidGenerator};
pub use inspect::{HostCapabilities, HostDevice, HostInspector, HostSysinfo};
pub use lifecycle::DomainManager;
pub use media::{CloudInitPayload, IsoBuilder, NoCloudIsoBuilder, PasswordReset};
pub use snapshot::SnapshotManager;
pub use storage::{ImageTool, MockImageTool, StorageManager};
pub use types::*;
pub use uri::ConnectionTarget;

#[cfg(feature = "libvirt")]
pub use connection::LibvirtConnection;
