//! Snapshot document (`<domainsnapshot>`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A domain snapshot.
///
/// Libvirt embeds the full domain document in the snapshots it returns;
/// that part is not decoded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "domainsnapshot")]
pub struct SnapshotDescriptor {
    /// Empty when libvirt is left to pick the name
    #[serde(default)]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Domain state captured, e.g. `running` or `shutoff`; set by libvirt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Seconds since the epoch; set by libvirt
    #[serde(rename = "creationTime", skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<SnapshotParent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<SnapshotMemory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disks: Option<SnapshotDisks>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotParent {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMemory {
    /// `no`, `internal` or `external`
    #[serde(rename = "@snapshot")]
    pub snapshot: String,
    #[serde(rename = "@file", skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDisks {
    #[serde(rename = "disk", default)]
    pub disks: Vec<SnapshotDisk>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDisk {
    /// Target device (`vda`) or source path
    #[serde(rename = "@name")]
    pub name: String,
    /// `no`, `internal` or `external`
    #[serde(rename = "@snapshot", skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<SnapshotDriver>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SnapshotSource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDriver {
    #[serde(rename = "@type")]
    pub driver_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSource {
    #[serde(rename = "@file")]
    pub file: String,
}

impl SnapshotDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add an external disk-only entry for `target` written to `file`.
    pub fn with_external_disk(mut self, target: &str, file: &str, format: &str) -> Self {
        self.disks.get_or_insert_with(SnapshotDisks::default).disks.push(SnapshotDisk {
            name: target.to_string(),
            snapshot: Some("external".to_string()),
            driver: Some(SnapshotDriver { driver_type: format.to_string() }),
            source: Some(SnapshotSource { file: file.to_string() }),
        });
        self
    }

    pub fn parent_name(&self) -> Option<&str> {
        self.parent.as_ref().map(|p| p.name.as_str())
    }

    pub fn disk_entries(&self) -> &[SnapshotDisk] {
        self.disks.as_ref().map(|d| d.disks.as_slice()).unwrap_or(&[])
    }

    /// Creation time, if libvirt reported one.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.creation_time.and_then(|secs| DateTime::from_timestamp(secs, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{from_xml, to_xml};

    const SNAPSHOT_XML: &str = r#"
<domainsnapshot>
  <name>before-upgrade</name>
  <description>pre kernel 6.8</description>
  <state>running</state>
  <parent><name>clean-install</name></parent>
  <creationTime>1718000000</creationTime>
  <memory snapshot='internal'/>
  <disks>
    <disk name='vda' snapshot='internal'/>
    <disk name='hdd' snapshot='no'/>
  </disks>
  <domain type='kvm'><name>web-1</name></domain>
</domainsnapshot>"#;

    #[test]
    fn test_decode_snapshot() {
        let snapshot: SnapshotDescriptor = from_xml(SNAPSHOT_XML).unwrap();

        assert_eq!(snapshot.name, "before-upgrade");
        assert_eq!(snapshot.parent_name(), Some("clean-install"));
        assert_eq!(snapshot.state.as_deref(), Some("running"));
        assert_eq!(snapshot.creation_time, Some(1718000000));
        assert_eq!(snapshot.created_at().unwrap().to_rfc3339(), "2024-06-10T06:13:20+00:00");
        assert_eq!(snapshot.memory.as_ref().unwrap().snapshot, "internal");
        assert_eq!(snapshot.disk_entries().len(), 2);
        assert_eq!(snapshot.disk_entries()[1].snapshot.as_deref(), Some("no"));
    }

    #[test]
    fn test_encode_request() {
        let request = SnapshotDescriptor::new("nightly")
            .with_description("cron")
            .with_external_disk("vda", "/var/lib/libvirt/images/web-1.nightly.qcow2", "qcow2");

        let xml = to_xml(&request).unwrap();
        assert!(xml.starts_with("<domainsnapshot>"));
        assert!(xml.contains("<name>nightly</name>"));
        assert!(!xml.contains("<parent>"));

        let decoded: SnapshotDescriptor = from_xml(&xml).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_missing_name_is_an_error() {
        let result: crate::error::Result<SnapshotDescriptor> =
            from_xml("<domainsnapshot><state>running</state></domainsnapshot>");
        assert!(result.is_err());
    }
}
