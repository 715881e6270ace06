//! Domain snapshots.

use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::connection::Connection;
use crate::descriptor::{from_xml, to_xml, SnapshotDescriptor};
use crate::error::{Result, ResultExt};
use crate::types::*;

/// Creates, lists, reverts and deletes snapshots of one hypervisor's domains.
pub struct SnapshotManager {
    connection: Arc<dyn Connection>,
}

impl SnapshotManager {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self { connection }
    }

    /// Take a snapshot and return it as the hypervisor recorded it.
    ///
    /// An empty `descriptor.name` lets the hypervisor pick one.
    #[instrument(skip(self, descriptor), fields(snapshot = %descriptor.name))]
    pub async fn create(
        &self,
        domain: &str,
        descriptor: &SnapshotDescriptor,
        flags: SnapshotCreateFlags,
    ) -> Result<SnapshotDescriptor> {
        let xml = to_xml(descriptor).context("create_snapshot", domain)?;
        let name = self
            .connection
            .create_snapshot(domain, &xml, flags)
            .await
            .context("create_snapshot", domain)?;
        info!(name = %name, "Snapshot created");

        self.get(domain, &name).await
    }

    /// All snapshots of `domain`, in the hypervisor's order. Documents that
    /// fail to decode are left out and reported as warnings.
    #[instrument(skip(self))]
    pub async fn list(&self, domain: &str) -> Result<Outcome<Vec<SnapshotDescriptor>>> {
        let documents = self
            .connection
            .list_snapshot_xmls(domain)
            .await
            .context("list_snapshots", domain)?;

        let mut outcome = Outcome::new(Vec::with_capacity(documents.len()));
        for (index, xml) in documents.iter().enumerate() {
            match from_xml::<SnapshotDescriptor>(xml) {
                Ok(snapshot) => outcome.value.push(snapshot),
                Err(e) => {
                    warn!(index, error = %e, "Skipping unreadable snapshot document");
                    outcome.warnings.push(Warning::new(
                        WarningKind::Skipped,
                        format!("snapshot #{} of {}: {}", index, domain, e),
                    ));
                }
            }
        }
        Ok(outcome)
    }

    pub async fn get(&self, domain: &str, name: &str) -> Result<SnapshotDescriptor> {
        let target = format!("{}/{}", domain, name);
        let xml = self
            .connection
            .snapshot_xml(domain, name)
            .await
            .context("get_snapshot", &target)?;
        from_xml(&xml).context("get_snapshot", target)
    }

    /// The snapshot the domain was last created from or reverted to.
    pub async fn current(&self, domain: &str) -> Result<Option<SnapshotDescriptor>> {
        let current = self
            .connection
            .current_snapshot(domain)
            .await
            .context("current_snapshot", domain)?;
        match current {
            Some(name) => Ok(Some(self.get(domain, &name).await?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    pub async fn revert(&self, domain: &str, name: &str, flags: SnapshotRevertFlags) -> Result<()> {
        self.connection
            .revert_snapshot(domain, name, flags)
            .await
            .context("revert_snapshot", format!("{}/{}", domain, name))?;
        info!("Reverted to snapshot");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, domain: &str, name: &str, flags: SnapshotDeleteFlags) -> Result<()> {
        self.connection
            .delete_snapshot(domain, name, flags)
            .await
            .context("delete_snapshot", format!("{}/{}", domain, name))?;
        info!("Snapshot deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DomainDefaults;
    use crate::connection::{FailurePoint, MockConnection};
    use crate::descriptor::DomainSpec;
    use crate::error::HypervisorError;

    async fn setup() -> (Arc<MockConnection>, SnapshotManager) {
        let connection = Arc::new(MockConnection::new());
        let spec = DomainSpec {
            name: "web-1".to_string(),
            memory_mib: 1024,
            vcpus: 1,
            disk_path: "/var/lib/libvirt/images/web-1.qcow2".to_string(),
            ..Default::default()
        };
        let xml = to_xml(&spec.resolve(&DomainDefaults::default()).unwrap().build(None)).unwrap();
        connection.define_domain(&xml).await.unwrap();
        let snapshots = SnapshotManager::new(connection.clone());
        (connection, snapshots)
    }

    #[tokio::test]
    async fn test_create_returns_recorded_snapshot() {
        let (_, snapshots) = setup().await;

        let first = snapshots
            .create("web-1", &SnapshotDescriptor::new("clean"), SnapshotCreateFlags::default())
            .await
            .unwrap();
        let second = snapshots
            .create("web-1", &SnapshotDescriptor::new("patched").with_description("after yum update"), SnapshotCreateFlags::default())
            .await
            .unwrap();

        assert_eq!(first.state.as_deref(), Some("shutoff"));
        assert!(first.creation_time.is_some());
        assert_eq!(second.parent_name(), Some("clean"));
        assert_eq!(second.description.as_deref(), Some("after yum update"));
        assert_eq!(snapshots.current("web-1").await.unwrap().unwrap().name, "patched");
    }

    #[tokio::test]
    async fn test_list_skips_malformed_documents() {
        let (connection, snapshots) = setup().await;
        snapshots
            .create("web-1", &SnapshotDescriptor::new("clean"), SnapshotCreateFlags::default())
            .await
            .unwrap();
        connection
            .insert_raw_snapshot("web-1", "<domainsnapshot><state>running</state></domainsnapshot>")
            .unwrap();

        let outcome = snapshots.list("web-1").await.unwrap();

        assert_eq!(outcome.value.len(), 1);
        assert_eq!(outcome.value[0].name, "clean");
        assert!(outcome.has_warning(WarningKind::Skipped));
    }

    #[tokio::test]
    async fn test_revert_and_delete() {
        let (connection, snapshots) = setup().await;
        snapshots
            .create("web-1", &SnapshotDescriptor::new("clean"), SnapshotCreateFlags::default())
            .await
            .unwrap();
        snapshots
            .create("web-1", &SnapshotDescriptor::new("broken"), SnapshotCreateFlags::default())
            .await
            .unwrap();

        snapshots.revert("web-1", "clean", SnapshotRevertFlags::default()).await.unwrap();
        assert_eq!(snapshots.current("web-1").await.unwrap().unwrap().name, "clean");

        snapshots.delete("web-1", "broken", SnapshotDeleteFlags::default()).await.unwrap();
        let names: Vec<String> = snapshots.list("web-1").await.unwrap().value.into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["clean"]);
        assert_eq!(connection.calls_starting_with("revert_snapshot").len(), 1);
    }

    #[tokio::test]
    async fn test_errors_name_the_snapshot() {
        let (connection, snapshots) = setup().await;

        let err = snapshots.get("web-1", "missing").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("web-1/missing"));

        connection.fail_on(FailurePoint::CreateSnapshot);
        let err = snapshots
            .create("web-1", &SnapshotDescriptor::new("x"), SnapshotCreateFlags::default())
            .await
            .unwrap_err();
        assert!(matches!(err.root(), HypervisorError::Rpc(_)));
    }

    #[tokio::test]
    async fn test_no_current_snapshot() {
        let (_, snapshots) = setup().await;
        assert!(snapshots.current("web-1").await.unwrap().is_none());
    }
}
