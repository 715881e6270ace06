//! Image tool that edits volumes held by a [`MockConnection`].

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use super::image::{ImageInfo, ImageTool};
use crate::connection::MockConnection;
use crate::descriptor::{FormatRef, ScaledValue, VolumeBackingStore};
use crate::error::{HypervisorError, Result};
use crate::types::{DiskFormat, GIB};

/// Image operations that can be made to fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageOp {
    CreateOverlay,
    Resize,
    Convert,
    CreateEmpty,
    Info,
}

/// Applies image operations to the volume documents of a mock connection,
/// so that a later volume query sees their effect.
pub struct MockImageTool {
    connection: Arc<MockConnection>,
    failures: RwLock<HashSet<ImageOp>>,
    ops: RwLock<Vec<String>>,
}

impl MockImageTool {
    pub fn new(connection: Arc<MockConnection>) -> Self {
        Self {
            connection,
            failures: RwLock::new(HashSet::new()),
            ops: RwLock::new(Vec::new()),
        }
    }

    pub fn fail_on(&self, op: ImageOp) {
        if let Ok(mut failures) = self.failures.write() {
            failures.insert(op);
        }
    }

    /// Operations performed so far, e.g. `resize /pool/1.qcow2 20G`.
    pub fn operations(&self) -> Vec<String> {
        self.ops.read().map(|o| o.clone()).unwrap_or_default()
    }

    fn begin(&self, op: ImageOp, line: String) -> Result<()> {
        if let Ok(mut ops) = self.ops.write() {
            ops.push(line.clone());
        }
        let failing = self.failures.read().map(|f| f.contains(&op)).unwrap_or(false);
        if failing {
            return Err(HypervisorError::ExternalToolFailure {
                command: format!("qemu-img {}", line),
                exit_code: Some(1),
                output: format!("injected {:?} failure", op),
            });
        }
        Ok(())
    }

    fn capacity_of(&self, path: &str) -> Result<u64> {
        self.connection
            .volume_by_path(path)
            .map(|(_, v)| v.capacity.to_bytes())
            .ok_or_else(|| HypervisorError::ExternalToolFailure {
                command: format!("qemu-img info {}", path),
                exit_code: Some(1),
                output: format!("Could not open '{}': No such file or directory", path),
            })?
    }
}

#[async_trait]
impl ImageTool for MockImageTool {
    async fn create_overlay(
        &self,
        backing: &str,
        backing_format: DiskFormat,
        output: &str,
        format: DiskFormat,
    ) -> Result<()> {
        self.begin(ImageOp::CreateOverlay, format!("create -b {} {}", backing, output))?;
        let capacity = self.capacity_of(backing)?;

        self.connection.update_volume_by_path(output, |volume| {
            volume.capacity = ScaledValue::bytes(capacity);
            volume.allocation = Some(ScaledValue::bytes(196_624));
            volume.backing_store = Some(VolumeBackingStore {
                path: backing.to_string(),
                format: Some(FormatRef { format_type: backing_format.as_str().to_string() }),
            });
            if let Some(target) = volume.target.as_mut() {
                target.format = Some(FormatRef { format_type: format.as_str().to_string() });
            }
        })
    }

    async fn resize(&self, path: &str, size_gb: u64, shrink: bool) -> Result<()> {
        let line = if shrink {
            format!("resize --shrink {} {}G", path, size_gb)
        } else {
            format!("resize {} {}G", path, size_gb)
        };
        self.begin(ImageOp::Resize, line)?;

        let current = self.capacity_of(path)?;
        let wanted = size_gb * GIB;
        if wanted < current && !shrink {
            return Err(HypervisorError::ExternalToolFailure {
                command: format!("qemu-img resize {} {}G", path, size_gb),
                exit_code: Some(1),
                output: "Use the --shrink option to perform a shrink operation.".to_string(),
            });
        }
        self.connection
            .update_volume_by_path(path, |volume| volume.capacity = ScaledValue::bytes(wanted))
    }

    async fn convert(
        &self,
        input: &str,
        _input_format: DiskFormat,
        output: &str,
        output_format: DiskFormat,
    ) -> Result<()> {
        self.begin(ImageOp::Convert, format!("convert {} {}", input, output))?;
        let capacity = self.capacity_of(input)?;

        self.connection.update_volume_by_path(output, |volume| {
            volume.capacity = ScaledValue::bytes(capacity);
            volume.allocation = Some(ScaledValue::bytes(capacity / 4));
            volume.backing_store = None;
            if let Some(target) = volume.target.as_mut() {
                target.format = Some(FormatRef { format_type: output_format.as_str().to_string() });
            }
        })
    }

    async fn create_empty(&self, path: &str, format: DiskFormat, size_gb: u64) -> Result<()> {
        self.begin(ImageOp::CreateEmpty, format!("create -f {} {} {}G", format, path, size_gb))
    }

    async fn info(&self, path: &str) -> Result<ImageInfo> {
        self.begin(ImageOp::Info, format!("info {}", path))?;
        let (_, volume) = self.connection.volume_by_path(path).ok_or_else(|| {
            HypervisorError::ExternalToolFailure {
                command: format!("qemu-img info {}", path),
                exit_code: Some(1),
                output: format!("Could not open '{}': No such file or directory", path),
            }
        })?;

        Ok(ImageInfo {
            filename: path.to_string(),
            format: volume.format().unwrap_or("raw").to_string(),
            virtual_size: volume.capacity.to_bytes()?,
            actual_size: volume.allocation.as_ref().map(ScaledValue::to_bytes).transpose()?.unwrap_or(0),
            backing_file: volume.backing_store.as_ref().map(|b| b.path.clone()),
        })
    }
}
