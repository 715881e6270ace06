//! Storage pools and volumes.
//!
//! Pools and volumes live in the hypervisor; this module drives them through
//! the [`Connection`] and uses an [`ImageTool`] for the image work libvirt
//! does not do itself.
//!
//! ## Provisioning from a template
//!
//! ```text
//!   create empty volume (target size)
//!              │
//!   template <= target ?
//!      │ yes                      │ no
//!      ▼                          ▼
//!   overlay on template        full convert of template
//!   resize up to target        resize (shrink) to target
//!      └────────────┬─────────────┘
//!                   ▼
//!        refresh pool, re-query volume
//! ```
//!
//! A failure or cancellation at any step deletes the destination volume.

mod image;
mod mock;

pub use image::{ImageInfo, ImageTool, QemuImg};
pub use mock::{ImageOp, MockImageTool};

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::StorageConfig;
use crate::connection::Connection;
use crate::descriptor::{from_xml, to_xml, PoolDescriptor, VolumeDescriptor};
use crate::error::{HypervisorError, Result, ResultExt};
use crate::exec::Executor;
use crate::ids::IdGenerator;
use crate::types::*;

/// Pool and volume operations for one hypervisor host.
pub struct StorageManager {
    connection: Arc<dyn Connection>,
    executor: Arc<dyn Executor>,
    images: Arc<dyn ImageTool>,
    ids: Arc<dyn IdGenerator>,
    config: StorageConfig,
}

impl StorageManager {
    pub fn new(
        connection: Arc<dyn Connection>,
        executor: Arc<dyn Executor>,
        images: Arc<dyn ImageTool>,
        ids: Arc<dyn IdGenerator>,
        config: StorageConfig,
    ) -> Self {
        Self {
            connection,
            executor,
            images,
            ids,
            config,
        }
    }

    // =========================================================================
    // Pools
    // =========================================================================

    /// Get or create a pool.
    ///
    /// An absent pool is defined, built and started; libvirt creates the
    /// directory. A defined but inactive pool is started.
    #[instrument(skip(self), fields(pool = %name))]
    pub async fn ensure_pool(&self, name: &str, pool_type: PoolType, path: &str) -> Result<Outcome<StoragePoolInfo>> {
        let mut warnings = Vec::new();

        let existing = self.connection.list_pools().await.context("ensure_pool", name)?;
        if existing.iter().any(|p| p == name) {
            let runtime = self.connection.pool_runtime(name).await.context("ensure_pool", name)?;
            if runtime.state != PoolState::Active {
                info!("Starting inactive pool");
                self.connection.start_pool(name).await.context("ensure_pool", name)?;
            }
        } else {
            info!(path = %path, "Creating storage pool");
            let xml = to_xml(&PoolDescriptor::new(name, pool_type, path))?;
            self.connection.define_pool(&xml).await.context("ensure_pool", name)?;
            self.connection.build_pool(name).await.context("ensure_pool", name)?;
            self.connection.start_pool(name).await.context("ensure_pool", name)?;

            if let Err(e) = self.connection.set_pool_autostart(name, true).await {
                warn!(error = %e, "Failed to enable pool autostart");
                warnings.push(Warning::new(WarningKind::Autostart, format!("pool '{}': {}", name, e)));
            }
        }

        let info = self.get_pool(name).await?;
        Ok(Outcome::with_warnings(info, warnings))
    }

    pub async fn get_pool(&self, name: &str) -> Result<StoragePoolInfo> {
        let descriptor = self.pool_descriptor(name).await.context("get_pool", name)?;
        let runtime = self.connection.pool_runtime(name).await.context("get_pool", name)?;
        let autostart = self.connection.pool_autostart(name).await.context("get_pool", name)?;
        Ok(descriptor.to_info(&runtime, autostart))
    }

    pub async fn list_pools(&self) -> Result<Vec<StoragePoolInfo>> {
        let mut pools = Vec::new();
        for name in self.connection.list_pools().await.context("list_pools", "pools")? {
            pools.push(self.get_pool(&name).await?);
        }
        Ok(pools)
    }

    /// Remove a pool, optionally with everything in it.
    ///
    /// Only the final undefine can fail the call; every earlier step is
    /// best effort and reported as a warning.
    #[instrument(skip(self), fields(pool = %name))]
    pub async fn delete_pool(&self, name: &str, delete_volumes: bool) -> Result<Outcome<()>> {
        let mut warnings = Vec::new();
        let runtime = self.connection.pool_runtime(name).await.context("delete_pool", name)?;
        let active = runtime.state == PoolState::Active;

        if delete_volumes && active {
            if let Err(e) = self.connection.refresh_pool(name).await {
                warn!(error = %e, "Pool refresh failed");
                warnings.push(Warning::new(WarningKind::Cleanup, format!("refresh: {}", e)));
            }
            match self.connection.list_volumes(name).await {
                Ok(volumes) => {
                    for volume in volumes {
                        if let Err(e) = self.connection.delete_volume(name, &volume).await {
                            warn!(volume = %volume, error = %e, "Failed to delete volume");
                            warnings.push(Warning::new(WarningKind::Cleanup, format!("volume '{}': {}", volume, e)));
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to list volumes");
                    warnings.push(Warning::new(WarningKind::Cleanup, format!("list volumes: {}", e)));
                }
            }
        }

        if active {
            if let Err(e) = self.connection.destroy_pool(name).await {
                warn!(error = %e, "Failed to stop pool");
                warnings.push(Warning::new(WarningKind::Cleanup, format!("stop: {}", e)));
            }
        }

        if delete_volumes {
            if let Err(e) = self.connection.delete_pool(name).await {
                warn!(error = %e, "Failed to delete pool directory");
                warnings.push(Warning::new(WarningKind::Cleanup, format!("delete: {}", e)));
            }
        }

        self.connection.undefine_pool(name).await.context("delete_pool", name)?;
        info!("Storage pool deleted");
        Ok(Outcome::with_warnings((), warnings))
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    /// Create an empty volume.
    ///
    /// When the new file is root-owned and the pool names an owner, the
    /// file is chowned to it; a refused chown is a warning. A volume that
    /// cannot be read back after creation is deleted again.
    #[instrument(skip(self), fields(pool = %pool, volume = %name))]
    pub async fn create_volume(
        &self,
        pool: &str,
        name: &str,
        size_gb: u64,
        format: DiskFormat,
    ) -> Result<Outcome<VolumeInfo>> {
        if size_gb == 0 {
            return Err(HypervisorError::InvalidConfig("volume size must be > 0".to_string())
                .context("create_volume", name));
        }

        let xml = to_xml(&VolumeDescriptor::new(name, size_gb * GIB, format))?;
        self.connection.create_volume(pool, &xml).await.context("create_volume", name)?;
        info!(size_gb, "Volume created");

        let described = async {
            let volume = self.volume_descriptor(pool, name).await?;
            let info = volume.to_info(pool)?;
            Ok::<_, HypervisorError>((volume, info))
        }
        .await;
        let (volume, info) = match described {
            Ok(described) => described,
            Err(e) => {
                warn!(error = %e, "Created volume cannot be read back, removing it");
                for warning in self.discard_volume(pool, name, None).await {
                    debug!(%warning, "Creation cleanup");
                }
                return Err(e.context("create_volume", name));
            }
        };

        let mut warnings = Vec::new();
        if let Some(warning) = self.fix_ownership(pool, &volume).await {
            warnings.push(warning);
        }
        Ok(Outcome::with_warnings(info, warnings))
    }

    async fn fix_ownership(&self, pool: &str, volume: &VolumeDescriptor) -> Option<Warning> {
        let root_owned = volume.permissions().map(|p| p.is_root_owned()).unwrap_or(false);
        let path = volume.path()?;
        if !root_owned {
            return None;
        }

        let owner = match self.pool_descriptor(pool).await {
            Ok(descriptor) => descriptor.target.permissions.as_ref().and_then(|p| p.chown_spec())?,
            Err(e) => {
                debug!(error = %e, "Pool permissions unavailable");
                return None;
            }
        };
        if owner == "0:0" {
            return None;
        }

        match self.executor.run("chown", &[owner.as_str(), path]).await {
            Ok(_) => {
                debug!(owner = %owner, path = %path, "Volume ownership fixed");
                None
            }
            Err(e) => {
                warn!(owner = %owner, path = %path, error = %e, "Failed to fix volume ownership");
                Some(Warning::new(WarningKind::PermissionDenied, format!("chown {} {}: {}", owner, path, e)))
            }
        }
    }

    /// Materialize a new volume from a template image.
    ///
    /// The result always has a virtual size of `target_gb`. When the
    /// template fits it becomes the backing file of a copy-on-write overlay,
    /// otherwise it is copied in full. The volume is named
    /// `{id}.{format}` from the injected ID generator.
    #[instrument(skip(self, cancel), fields(pool = %pool, template = %template))]
    pub async fn create_volume_from_image(
        &self,
        pool: &str,
        template: &str,
        template_gb: u64,
        target_gb: u64,
        format: DiskFormat,
        cancel: &CancellationToken,
    ) -> Result<Outcome<VolumeInfo>> {
        let name = format!("{}.{}", self.ids.next_id(), format);

        let created = self
            .create_volume(pool, &name, target_gb, format)
            .await
            .context("create_volume_from_image", name.as_str())?;
        let mut warnings = created.warnings;
        let path = created.value.path;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HypervisorError::Cancelled(format!("provisioning of '{}'", name))),
            result = self.materialize(pool, &name, &path, template, template_gb, target_gb, format) => result,
        };

        match result {
            Ok(info) => Ok(Outcome::with_warnings(info, warnings)),
            Err(e) => {
                warn!(volume = %name, error = %e, "Provisioning failed, removing volume");
                warnings.extend(self.discard_volume(pool, &name, Some(&path)).await);
                for warning in &warnings {
                    debug!(%warning, "Provisioning cleanup");
                }
                Err(e.context("create_volume_from_image", name))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn materialize(
        &self,
        pool: &str,
        name: &str,
        path: &str,
        template: &str,
        template_gb: u64,
        target_gb: u64,
        format: DiskFormat,
    ) -> Result<VolumeInfo> {
        let template_format = self.images.info(template).await?.disk_format()?;

        if template_gb <= target_gb {
            debug!("Template fits, creating overlay");
            self.images.create_overlay(template, template_format, path, format).await?;
            // A fresh overlay has the backing file's virtual size.
            self.images.resize(path, target_gb, false).await?;
        } else {
            debug!("Template larger than target, converting");
            self.images.convert(template, template_format, path, format).await?;
            self.images.resize(path, target_gb, true).await?;
        }

        self.connection.refresh_pool(pool).await?;
        let info = self.volume_descriptor(pool, name).await?.to_info(pool)?;
        info!(volume = %name, overlay = info.is_overlay(), "Volume provisioned from template");
        Ok(info)
    }

    /// Delete a half-made volume, then an empty leftover file if one remains.
    async fn discard_volume(&self, pool: &str, name: &str, path: Option<&str>) -> Vec<Warning> {
        let mut warnings = Vec::new();
        if let Err(e) = self.connection.delete_volume(pool, name).await {
            if !e.is_not_found() {
                warn!(volume = %name, error = %e, "Failed to delete volume");
                warnings.push(Warning::new(WarningKind::Cleanup, format!("volume '{}': {}", name, e)));
            }
        }
        let Some(path) = path else {
            return warnings;
        };
        if let Err(e) = self
            .executor
            .run("find", &[path, "-maxdepth", "0", "-empty", "-delete"])
            .await
        {
            debug!(path = %path, error = %e, "No empty leftover removed");
        }
        warnings
    }

    /// An empty image outside any pool, e.g. a scratch disk.
    pub async fn create_image(&self, path: &str, format: DiskFormat, size_gb: u64) -> Result<()> {
        self.images
            .create_empty(path, format, size_gb)
            .await
            .context("create_image", path)
    }

    /// Delete a volume by name, looking in the default pool, then the
    /// images pool.
    #[instrument(skip(self), fields(volume = %name))]
    pub async fn delete_volume(&self, name: &str) -> Result<()> {
        for pool in [&self.config.default_pool.name, &self.config.images_pool.name] {
            match self.connection.delete_volume(pool, name).await {
                Ok(()) => {
                    info!(pool = %pool, "Volume deleted");
                    return Ok(());
                }
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.context("delete_volume", name)),
            }
        }
        Err(HypervisorError::NotFound(format!("volume '{}'", name)).context("delete_volume", name))
    }

    #[instrument(skip(self), fields(pool = %pool, volume = %name))]
    pub async fn resize_volume(&self, pool: &str, name: &str, size_gb: u64) -> Result<VolumeInfo> {
        self.connection
            .resize_volume(pool, name, size_gb * GIB)
            .await
            .context("resize_volume", name)?;
        self.get_volume(pool, name).await
    }

    pub async fn list_volumes(&self, pool: &str) -> Result<Vec<VolumeInfo>> {
        let names = self.connection.list_volumes(pool).await.context("list_volumes", pool)?;
        let mut volumes = Vec::with_capacity(names.len());
        for name in names {
            volumes.push(self.get_volume(pool, &name).await?);
        }
        Ok(volumes)
    }

    pub async fn get_volume(&self, pool: &str, name: &str) -> Result<VolumeInfo> {
        Ok(self
            .volume_descriptor(pool, name)
            .await
            .context("get_volume", name)?
            .to_info(pool)
            .context("get_volume", name)?)
    }

    async fn pool_descriptor(&self, name: &str) -> Result<PoolDescriptor> {
        from_xml(&self.connection.pool_xml(name).await?)
    }

    async fn volume_descriptor(&self, pool: &str, name: &str) -> Result<VolumeDescriptor> {
        from_xml(&self.connection.volume_xml(pool, name).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::connection::{FailurePoint, MockConnection};
    use crate::exec::MockExecutor;
    use crate::ids::SequentialIds;

    struct Fixture {
        connection: Arc<MockConnection>,
        executor: Arc<MockExecutor>,
        images: Arc<MockImageTool>,
        storage: StorageManager,
    }

    fn fixture() -> Fixture {
        let connection = Arc::new(MockConnection::new());
        let executor = Arc::new(MockExecutor::new());
        let images = Arc::new(MockImageTool::new(connection.clone()));
        let storage = StorageManager::new(
            connection.clone(),
            executor.clone(),
            images.clone(),
            Arc::new(SequentialIds::starting_at(1000)),
            StorageConfig::default(),
        );
        Fixture { connection, executor, images, storage }
    }

    #[tokio::test]
    async fn test_ensure_pool_is_idempotent() {
        let f = fixture();

        let first = f.storage.ensure_pool("default", PoolType::Dir, "/var/lib/libvirt/images").await.unwrap();
        let second = f.storage.ensure_pool("default", PoolType::Dir, "/var/lib/libvirt/images").await.unwrap();

        assert_eq!(first.value.state, PoolState::Active);
        assert!(first.value.autostart);
        assert_eq!(first.value, second.value);
        assert_eq!(f.connection.calls_starting_with("define_pool").len(), 1);
        assert_eq!(f.storage.list_pools().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ensure_pool_autostart_failure_is_a_warning() {
        let f = fixture();
        f.connection.fail_on(FailurePoint::SetPoolAutostart);

        let outcome = f.storage.ensure_pool("default", PoolType::Dir, "/pool").await.unwrap();

        assert!(outcome.has_warning(WarningKind::Autostart));
        assert_eq!(outcome.value.state, PoolState::Active);
        assert!(!outcome.value.autostart);
    }

    #[tokio::test]
    async fn test_create_volume_rejects_zero_size() {
        let f = fixture();
        f.storage.ensure_pool("default", PoolType::Dir, "/pool").await.unwrap();

        let err = f.storage.create_volume("default", "x.qcow2", 0, DiskFormat::Qcow2).await.unwrap_err();
        assert!(matches!(err.root(), HypervisorError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_overlay_resize_failure_leaves_no_volume() {
        let f = fixture();
        f.storage.ensure_pool("default", PoolType::Dir, "/pool").await.unwrap();
        f.storage.ensure_pool("images", PoolType::Dir, "/images").await.unwrap();
        f.storage.create_volume("images", "base.qcow2", 10, DiskFormat::Qcow2).await.unwrap();
        f.images.fail_on(ImageOp::Resize);

        let err = f
            .storage
            .create_volume_from_image(
                "default",
                "/images/base.qcow2",
                10,
                20,
                DiskFormat::Qcow2,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err.root(), HypervisorError::ExternalToolFailure { .. }));
        assert!(f.images.operations().iter().any(|op| op.starts_with("create -b")));
        assert!(f.storage.list_volumes("default").await.unwrap().is_empty());
        assert_eq!(
            f.executor.commands_starting_with("find").last().map(String::as_str),
            Some("find /pool/1000.qcow2 -maxdepth 0 -empty -delete")
        );
    }

    #[tokio::test]
    async fn test_cancelled_provisioning_is_cleaned_up() {
        let f = fixture();
        f.storage.ensure_pool("default", PoolType::Dir, "/pool").await.unwrap();
        f.storage.ensure_pool("images", PoolType::Dir, "/images").await.unwrap();
        f.storage.create_volume("images", "base.qcow2", 10, DiskFormat::Qcow2).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = f
            .storage
            .create_volume_from_image("default", "/images/base.qcow2", 10, 20, DiskFormat::Qcow2, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err.root(), HypervisorError::Cancelled(_)));
        assert!(f.storage.list_volumes("default").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_volume_falls_back_to_images_pool() {
        let f = fixture();
        f.storage.ensure_pool("default", PoolType::Dir, "/pool").await.unwrap();
        f.storage.ensure_pool("images", PoolType::Dir, "/images").await.unwrap();
        f.storage.create_volume("images", "old.qcow2", 1, DiskFormat::Qcow2).await.unwrap();

        f.storage.delete_volume("old.qcow2").await.unwrap();

        assert_eq!(
            f.connection.calls_starting_with("delete_volume"),
            vec!["delete_volume default old.qcow2", "delete_volume images old.qcow2"]
        );
        let err = f.storage.delete_volume("old.qcow2").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_pool_with_volumes() {
        let f = fixture();
        f.storage.ensure_pool("scratch", PoolType::Dir, "/scratch").await.unwrap();
        f.storage.create_volume("scratch", "a.qcow2", 1, DiskFormat::Qcow2).await.unwrap();
        f.storage.create_volume("scratch", "b.qcow2", 1, DiskFormat::Qcow2).await.unwrap();
        f.connection.clear_calls();

        let outcome = f.storage.delete_pool("scratch", true).await.unwrap();

        assert!(outcome.is_clean());
        assert_eq!(
            f.connection.calls(),
            vec![
                "refresh_pool scratch",
                "delete_volume scratch a.qcow2",
                "delete_volume scratch b.qcow2",
                "destroy_pool scratch",
                "delete_pool scratch",
                "undefine_pool scratch",
            ]
        );
        assert!(f.storage.get_pool("scratch").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_pool_best_effort_steps_become_warnings() {
        let f = fixture();
        f.storage.ensure_pool("scratch", PoolType::Dir, "/scratch").await.unwrap();
        f.storage.create_volume("scratch", "a.qcow2", 1, DiskFormat::Qcow2).await.unwrap();
        f.connection.fail_on(FailurePoint::DeleteVolume);

        let outcome = f.storage.delete_pool("scratch", true).await.unwrap();

        // Volume and directory removal failed; the undefine still happened.
        assert_eq!(outcome.warnings.len(), 2);
        assert!(outcome.has_warning(WarningKind::Cleanup));
        assert!(f.storage.list_pools().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_pool_undefine_failure_is_fatal() {
        let f = fixture();
        f.storage.ensure_pool("scratch", PoolType::Dir, "/scratch").await.unwrap();
        f.connection.fail_on(FailurePoint::UndefinePool);

        let err = f.storage.delete_pool("scratch", false).await.unwrap_err();
        assert!(matches!(err.root(), HypervisorError::Rpc(_)));
    }
}
