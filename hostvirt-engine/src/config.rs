//! Engine configuration.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{HypervisorError, Result};

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Libvirt connection URI
    pub uri: String,
    /// Domain defaults
    pub domain: DomainDefaults,
    /// Storage pools and image tooling
    pub storage: StorageConfig,
    /// External tools
    pub tools: ToolsConfig,
    /// Secure-shell channel for remote hosts
    pub ssh: SshConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            uri: "qemu:///system".to_string(),
            domain: DomainDefaults::default(),
            storage: StorageConfig::default(),
            tools: ToolsConfig::default(),
            ssh: SshConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(HypervisorError::InvalidConfig(format!(
                "config file not found: {}",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| HypervisorError::InvalidConfig(format!("failed to parse config: {}", e)))
    }

    /// Deadline for a single external process.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.tools.command_timeout_secs)
    }
}

/// Defaults applied to every new domain.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DomainDefaults {
    /// Bridge used when a NIC names no source
    pub fallback_bridge: String,
    /// Directory holding `{name}.vnc` sockets
    pub vnc_socket_dir: String,
    /// Owner (`user:group`) of the VNC socket directory
    pub vnc_socket_owner: Option<String>,
    /// Mode of the VNC socket directory
    pub vnc_socket_mode: u32,
    /// Directory where configuration ISOs are staged
    pub iso_dir: String,
}

impl Default for DomainDefaults {
    fn default() -> Self {
        Self {
            fallback_bridge: "virbr0".to_string(),
            vnc_socket_dir: "/var/lib/libvirt/qemu/vnc".to_string(),
            vnc_socket_owner: Some("qemu:qemu".to_string()),
            vnc_socket_mode: 0o750,
            iso_dir: "/var/lib/libvirt/images/cloudinit".to_string(),
        }
    }
}

/// A named pool and where it lives.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolLocation {
    pub name: String,
    pub path: String,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Pool for instance disks
    pub default_pool: PoolLocation,
    /// Pool holding template images
    pub images_pool: PoolLocation,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            default_pool: PoolLocation {
                name: "default".to_string(),
                path: "/var/lib/libvirt/images".to_string(),
            },
            images_pool: PoolLocation {
                name: "images".to_string(),
                path: "/var/lib/libvirt/images/base".to_string(),
            },
        }
    }
}

/// External tool binaries and their deadline.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// qemu-img binary path
    pub qemu_img: String,
    /// ISO authoring tools, tried in order
    pub iso_tools: Vec<String>,
    /// Offline disk customization tool
    pub virt_customize: String,
    /// Deadline for each external process, in seconds
    pub command_timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            qemu_img: "qemu-img".to_string(),
            iso_tools: vec!["genisoimage".to_string(), "mkisofs".to_string()],
            virt_customize: "virt-customize".to_string(),
            command_timeout_secs: 600,
        }
    }
}

/// Secure-shell configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// ssh binary path
    pub binary: String,
    /// Passed as `-o ConnectTimeout=`
    pub connect_timeout_secs: u64,
    /// Identity file passed with `-i`
    pub identity_file: Option<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            binary: "ssh".to_string(),
            connect_timeout_secs: 10,
            identity_file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.uri, "qemu:///system");
        assert_eq!(config.domain.fallback_bridge, "virbr0");
        assert_eq!(config.storage.default_pool.name, "default");
        assert_eq!(config.storage.images_pool.name, "images");
        assert_eq!(config.command_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
uri: qemu+ssh://admin@kvm01/system
domain:
  fallback_bridge: br0
  vnc_socket_dir: /run/vnc
tools:
  command_timeout_secs: 30
storage:
  images_pool:
    name: templates
    path: /srv/templates
"#;

        let config = EngineConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.uri, "qemu+ssh://admin@kvm01/system");
        assert_eq!(config.domain.fallback_bridge, "br0");
        assert_eq!(config.domain.vnc_socket_dir, "/run/vnc");
        assert_eq!(config.domain.iso_dir, "/var/lib/libvirt/images/cloudinit");
        assert_eq!(config.tools.qemu_img, "qemu-img");
        assert_eq!(config.command_timeout(), Duration::from_secs(30));
        assert_eq!(config.storage.images_pool.name, "templates");
        assert_eq!(config.storage.default_pool.name, "default");
    }

    #[test]
    fn test_invalid_yaml_is_invalid_config() {
        let err = EngineConfig::from_yaml("uri: [unterminated").unwrap_err();
        assert!(matches!(err, HypervisorError::InvalidConfig(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = EngineConfig::load("/nonexistent/hostvirt.yaml").unwrap_err();
        assert!(matches!(err, HypervisorError::InvalidConfig(_)));
    }
}
