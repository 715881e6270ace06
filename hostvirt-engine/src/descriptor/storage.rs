//! Pool (`<pool>`) and volume (`<volume>`) documents.

use serde::{Deserialize, Serialize};

use super::ScaledValue;
use crate::error::Result;
use crate::types::{BackingStoreRef, DiskFormat, PoolRuntime, PoolType, StoragePoolInfo, VolumeInfo};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "pool")]
pub struct PoolDescriptor {
    #[serde(rename = "@type")]
    pub pool_type: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<ScaledValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation: Option<ScaledValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available: Option<ScaledValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PoolSource>,
    pub target: PoolTarget,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolSource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<NamedRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<PathRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<FormatRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedRef {
    #[serde(rename = "@name")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRef {
    #[serde(rename = "@path")]
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatRef {
    #[serde(rename = "@type")]
    pub format_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolTarget {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Permissions>,
}

/// Ownership of a pool directory or volume file, numeric as libvirt reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl Permissions {
    /// `owner:group` for `chown`, when both are known and not `-1`.
    pub fn chown_spec(&self) -> Option<String> {
        let valid = |id: &Option<String>| {
            id.as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty() && *v != "-1")
                .map(String::from)
        };
        Some(format!("{}:{}", valid(&self.owner)?, valid(&self.group)?))
    }

    pub fn is_root_owned(&self) -> bool {
        self.owner.as_deref().map(str::trim) == Some("0")
    }
}

impl PoolDescriptor {
    /// A directory-style pool rooted at `path`.
    pub fn new(name: &str, pool_type: PoolType, path: &str) -> Self {
        Self {
            pool_type: pool_type.as_str().to_string(),
            name: name.to_string(),
            uuid: None,
            capacity: None,
            allocation: None,
            available: None,
            source: None,
            target: PoolTarget {
                path: path.to_string(),
                permissions: None,
            },
        }
    }

    pub fn to_info(&self, runtime: &PoolRuntime, autostart: bool) -> StoragePoolInfo {
        StoragePoolInfo {
            name: self.name.clone(),
            pool_type: self.pool_type.clone(),
            path: self.target.path.clone(),
            state: runtime.state,
            capacity_bytes: runtime.capacity,
            allocation_bytes: runtime.allocation,
            available_bytes: runtime.available,
            autostart,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "volume")]
pub struct VolumeDescriptor {
    #[serde(rename = "@type", skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<String>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub capacity: ScaledValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation: Option<ScaledValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<VolumeTarget>,
    #[serde(rename = "backingStore", skip_serializing_if = "Option::is_none")]
    pub backing_store: Option<VolumeBackingStore>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeTarget {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<FormatRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Permissions>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeBackingStore {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<FormatRef>,
}

impl VolumeDescriptor {
    /// An empty volume of `capacity_bytes` in `format`.
    pub fn new(name: &str, capacity_bytes: u64, format: DiskFormat) -> Self {
        Self {
            volume_type: None,
            name: name.to_string(),
            key: None,
            capacity: ScaledValue::bytes(capacity_bytes),
            allocation: Some(ScaledValue::bytes(0)),
            target: Some(VolumeTarget {
                path: None,
                format: Some(FormatRef { format_type: format.as_str().to_string() }),
                permissions: None,
            }),
            backing_store: None,
        }
    }

    pub fn path(&self) -> Option<&str> {
        self.target.as_ref().and_then(|t| t.path.as_deref())
    }

    pub fn format(&self) -> Option<&str> {
        self.target
            .as_ref()
            .and_then(|t| t.format.as_ref())
            .map(|f| f.format_type.as_str())
    }

    pub fn permissions(&self) -> Option<&Permissions> {
        self.target.as_ref().and_then(|t| t.permissions.as_ref())
    }

    pub fn to_info(&self, pool: &str) -> Result<VolumeInfo> {
        Ok(VolumeInfo {
            name: self.name.clone(),
            pool: pool.to_string(),
            path: self.path().unwrap_or_default().to_string(),
            capacity_bytes: self.capacity.to_bytes()?,
            allocation_bytes: self.allocation.as_ref().map(ScaledValue::to_bytes).transpose()?.unwrap_or(0),
            format: self.format().map(String::from),
            backing_store: self
                .backing_store
                .as_ref()
                .filter(|b| !b.path.is_empty())
                .map(|b| BackingStoreRef {
                    path: b.path.clone(),
                    format: b.format.as_ref().map(|f| f.format_type.clone()),
                }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{from_xml, to_xml};
    use crate::types::{PoolState, GIB};

    const OVERLAY_XML: &str = r#"
<volume type='file'>
  <name>1001.qcow2</name>
  <key>/var/lib/libvirt/images/1001.qcow2</key>
  <capacity unit='bytes'>21474836480</capacity>
  <allocation unit='bytes'>200704</allocation>
  <physical unit='bytes'>196624</physical>
  <target>
    <path>/var/lib/libvirt/images/1001.qcow2</path>
    <format type='qcow2'/>
    <permissions>
      <mode>0600</mode>
      <owner>0</owner>
      <group>0</group>
    </permissions>
    <compat>1.1</compat>
  </target>
  <backingStore>
    <path>/var/lib/libvirt/images/base/ubuntu-22.04.qcow2</path>
    <format type='qcow2'/>
  </backingStore>
</volume>"#;

    #[test]
    fn test_decode_overlay_volume() {
        let volume: VolumeDescriptor = from_xml(OVERLAY_XML).unwrap();
        let info = volume.to_info("default").unwrap();

        assert_eq!(info.name, "1001.qcow2");
        assert_eq!(info.capacity_bytes, 20 * GIB);
        assert_eq!(info.allocation_bytes, 200704);
        assert_eq!(info.format.as_deref(), Some("qcow2"));
        assert!(info.is_overlay());
        assert_eq!(
            info.backing_store.unwrap().path,
            "/var/lib/libvirt/images/base/ubuntu-22.04.qcow2"
        );
        assert!(volume.permissions().unwrap().is_root_owned());
    }

    #[test]
    fn test_new_volume_document() {
        let xml = to_xml(&VolumeDescriptor::new("data.qcow2", 5 * GIB, DiskFormat::Qcow2)).unwrap();
        assert!(xml.starts_with("<volume>"));
        assert!(xml.contains(r#"<capacity unit="bytes">5368709120</capacity>"#));
        assert!(xml.contains(r#"<format type="qcow2"/>"#));
        assert!(!xml.contains("backingStore"));
    }

    #[test]
    fn test_pool_document() {
        let pool = PoolDescriptor::new("default", PoolType::Dir, "/var/lib/libvirt/images");
        let decoded: PoolDescriptor = from_xml(&to_xml(&pool).unwrap()).unwrap();
        assert_eq!(decoded, pool);

        let runtime = PoolRuntime {
            state: PoolState::Active,
            capacity: 100,
            allocation: 40,
            available: 60,
        };
        let info = decoded.to_info(&runtime, true);
        assert_eq!(info.pool_type, "dir");
        assert_eq!(info.path, "/var/lib/libvirt/images");
        assert!(info.autostart);
    }

    #[test]
    fn test_permissions_chown_spec() {
        let perms = Permissions {
            mode: Some("0711".into()),
            owner: Some("107".into()),
            group: Some("107".into()),
        };
        assert_eq!(perms.chown_spec().as_deref(), Some("107:107"));
        assert!(!perms.is_root_owned());

        let unknown = Permissions { owner: Some("-1".into()), group: Some("-1".into()), mode: None };
        assert_eq!(unknown.chown_spec(), None);
    }
}
