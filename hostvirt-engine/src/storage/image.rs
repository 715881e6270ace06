//! Disk image tooling (`qemu-img`).

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::error::{HypervisorError, Result};
use crate::exec::Executor;
use crate::types::DiskFormat;

/// What `qemu-img info` reports about an image.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageInfo {
    pub filename: String,
    pub format: String,
    #[serde(rename = "virtual-size")]
    pub virtual_size: u64,
    #[serde(rename = "actual-size", default)]
    pub actual_size: u64,
    #[serde(rename = "backing-filename", default)]
    pub backing_file: Option<String>,
}

impl ImageInfo {
    pub fn disk_format(&self) -> Result<DiskFormat> {
        self.format
            .parse()
            .map_err(|e: String| HypervisorError::Unsupported(format!("{}: {}", self.filename, e)))
    }
}

/// Image operations the storage manager needs. Sizes are whole GiB.
#[async_trait]
pub trait ImageTool: Send + Sync {
    /// `create -f <fmt> -F <backing_fmt> -b <backing> <output>`
    async fn create_overlay(
        &self,
        backing: &str,
        backing_format: DiskFormat,
        output: &str,
        format: DiskFormat,
    ) -> Result<()>;

    /// `resize [--shrink] <path> <N>G`
    async fn resize(&self, path: &str, size_gb: u64, shrink: bool) -> Result<()>;

    /// `convert -f <in_fmt> -O <out_fmt> <input> <output>`
    async fn convert(
        &self,
        input: &str,
        input_format: DiskFormat,
        output: &str,
        output_format: DiskFormat,
    ) -> Result<()>;

    /// `create -f <fmt> <path> <N>G`
    async fn create_empty(&self, path: &str, format: DiskFormat, size_gb: u64) -> Result<()>;

    /// `info --output=json <path>`
    async fn info(&self, path: &str) -> Result<ImageInfo>;
}

/// `qemu-img` run through the executor, so it works on remote hosts too.
pub struct QemuImg {
    executor: Arc<dyn Executor>,
    binary: String,
}

impl QemuImg {
    pub fn new(executor: Arc<dyn Executor>, binary: impl Into<String>) -> Self {
        Self {
            executor,
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl ImageTool for QemuImg {
    #[instrument(skip(self), fields(target = %self.executor.describe()))]
    async fn create_overlay(
        &self,
        backing: &str,
        backing_format: DiskFormat,
        output: &str,
        format: DiskFormat,
    ) -> Result<()> {
        info!("Creating overlay image");
        self.executor
            .run(
                &self.binary,
                &["create", "-f", format.as_str(), "-F", backing_format.as_str(), "-b", backing, output],
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(target = %self.executor.describe()))]
    async fn resize(&self, path: &str, size_gb: u64, shrink: bool) -> Result<()> {
        let size = format!("{}G", size_gb);
        let mut args = vec!["resize"];
        if shrink {
            args.push("--shrink");
        }
        args.push(path);
        args.push(&size);

        self.executor.run(&self.binary, &args).await?;
        debug!("Image resized");
        Ok(())
    }

    #[instrument(skip(self), fields(target = %self.executor.describe()))]
    async fn convert(
        &self,
        input: &str,
        input_format: DiskFormat,
        output: &str,
        output_format: DiskFormat,
    ) -> Result<()> {
        info!("Converting image");
        self.executor
            .run(
                &self.binary,
                &["convert", "-f", input_format.as_str(), "-O", output_format.as_str(), input, output],
            )
            .await?;
        Ok(())
    }

    async fn create_empty(&self, path: &str, format: DiskFormat, size_gb: u64) -> Result<()> {
        let size = format!("{}G", size_gb);
        self.executor
            .run(&self.binary, &["create", "-f", format.as_str(), path, &size])
            .await?;
        Ok(())
    }

    async fn info(&self, path: &str) -> Result<ImageInfo> {
        let output = self.executor.run(&self.binary, &["info", "--output=json", path]).await?;
        serde_json::from_slice(&output.stdout)
            .map_err(|e| HypervisorError::Internal(format!("Failed to parse qemu-img output: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::MockExecutor;

    #[tokio::test]
    async fn test_command_lines() {
        let executor = Arc::new(MockExecutor::new());
        let tool = QemuImg::new(executor.clone(), "qemu-img");

        tool.create_overlay("/images/base.qcow2", DiskFormat::Qcow2, "/pool/1.qcow2", DiskFormat::Qcow2)
            .await
            .unwrap();
        tool.resize("/pool/1.qcow2", 20, false).await.unwrap();
        tool.convert("/images/big.raw", DiskFormat::Raw, "/pool/2.qcow2", DiskFormat::Qcow2)
            .await
            .unwrap();
        tool.resize("/pool/2.qcow2", 5, true).await.unwrap();
        tool.create_empty("/scratch/s.qcow2", DiskFormat::Qcow2, 8).await.unwrap();

        assert_eq!(
            executor.commands(),
            vec![
                "qemu-img create -f qcow2 -F qcow2 -b /images/base.qcow2 /pool/1.qcow2",
                "qemu-img resize /pool/1.qcow2 20G",
                "qemu-img convert -f raw -O qcow2 /images/big.raw /pool/2.qcow2",
                "qemu-img resize --shrink /pool/2.qcow2 5G",
                "qemu-img create -f qcow2 /scratch/s.qcow2 8G",
            ]
        );
    }

    #[tokio::test]
    async fn test_info_parses_json() {
        let executor = Arc::new(MockExecutor::new());
        executor.stub_output(
            "qemu-img info",
            r#"{
                "virtual-size": 10737418240,
                "filename": "/images/base.qcow2",
                "cluster-size": 65536,
                "format": "qcow2",
                "actual-size": 2147483648,
                "dirty-flag": false
            }"#,
        );
        let tool = QemuImg::new(executor, "qemu-img");

        let info = tool.info("/images/base.qcow2").await.unwrap();

        assert_eq!(info.virtual_size, 10 * crate::types::GIB);
        assert_eq!(info.disk_format().unwrap(), DiskFormat::Qcow2);
        assert_eq!(info.backing_file, None);
    }

    #[tokio::test]
    async fn test_failure_carries_output() {
        let executor = Arc::new(MockExecutor::new());
        executor.fail_command("qemu-img resize", 1, "qemu-img: Use the --shrink option to perform a shrink operation.");
        let tool = QemuImg::new(executor, "qemu-img");

        let err = tool.resize("/pool/1.qcow2", 1, false).await.unwrap_err();
        match err {
            HypervisorError::ExternalToolFailure { command, output, .. } => {
                assert_eq!(command, "qemu-img resize /pool/1.qcow2 1G");
                assert!(output.contains("--shrink"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
