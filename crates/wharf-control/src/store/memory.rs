//! In-memory deployment ledger for testing.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;
use wharf_build::BuildSpec;

use crate::error::{ControlError, ControlResult};
use crate::state::check_transition;
use crate::types::{
    Container, ContainerLaunch, ContainerRecordId, ContainerStatus, DeletedDeployment,
    DeploymentDetails, DeploymentId, DeploymentRecord, DeploymentStatus, NewDeployment,
    Repository, RepositoryId, UNKNOWN_COMMIT,
};

use super::{DeploymentFilter, DeploymentStore};

#[derive(Debug, Default)]
struct Ledger {
    repositories: HashMap<String, Repository>,
    deployments: HashMap<String, DeploymentRecord>,
    /// Keyed by deployment id.
    containers: HashMap<String, Container>,
}

impl Ledger {
    fn deployment_mut(&mut self, id: &DeploymentId) -> ControlResult<&mut DeploymentRecord> {
        self.deployments
            .get_mut(id.as_str())
            .ok_or_else(|| ControlError::deployment_not_found(id))
    }

    fn port_holder(&self, port: u16, except: Option<&DeploymentId>) -> Option<&DeploymentRecord> {
        self.deployments.values().find(|d| {
            d.exposed_port == port && d.status.holds_port() && except.is_none_or(|id| d.id != *id)
        })
    }
}

/// In-memory deployment ledger.
///
/// A single lock guards all three tables, which gives every multi-entity
/// write the same atomicity the PostgreSQL backend gets from transactions.
/// Data is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    ledger: RwLock<Ledger>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> ControlResult<RwLockReadGuard<'_, Ledger>> {
        self.ledger
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))
    }

    fn write(&self) -> ControlResult<RwLockWriteGuard<'_, Ledger>> {
        self.ledger
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))
    }

    /// Rewrite a parent link directly, bypassing every ledger rule.
    #[cfg(test)]
    pub(crate) fn set_parent(&self, id: &DeploymentId, parent: Option<DeploymentId>) {
        if let Ok(mut ledger) = self.write() {
            if let Ok(record) = ledger.deployment_mut(id) {
                record.parent_deployment_id = parent;
            }
        }
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn create_deployment(&self, request: &NewDeployment) -> ControlResult<DeploymentRecord> {
        let mut ledger = self.write()?;

        let port = request.build_spec.exposed_port;
        if let Some(holder) = ledger.port_holder(port, None) {
            return Err(ControlError::Conflict {
                port,
                holder: holder.id.to_string(),
            });
        }

        let existing = ledger
            .repositories
            .values()
            .find(|r| r.clone_url == request.clone_url)
            .map(|r| r.id.clone());
        let repository_id = match existing {
            Some(id) => id,
            None => {
                let repository = Repository::from_url(&request.clone_url, &request.branch)?;
                let id = repository.id.clone();
                ledger
                    .repositories
                    .insert(id.as_str().to_owned(), repository);
                id
            }
        };

        let record = DeploymentRecord::new(
            repository_id,
            request.branch.clone(),
            request.build_spec.clone(),
            None,
            None,
        );
        ledger
            .deployments
            .insert(record.id.as_str().to_owned(), record.clone());

        Ok(record)
    }

    async fn insert_child(
        &self,
        parent: &DeploymentId,
        commit_sha: &str,
        build_spec: &BuildSpec,
    ) -> ControlResult<DeploymentRecord> {
        let mut ledger = self.write()?;

        let parent = ledger.deployment_mut(parent)?;
        let record = DeploymentRecord::new(
            parent.repository_id.clone(),
            parent.branch.clone(),
            build_spec.clone(),
            Some(commit_sha.to_owned()),
            Some(parent.id.clone()),
        );

        ledger
            .deployments
            .insert(record.id.as_str().to_owned(), record.clone());
        Ok(record)
    }

    async fn get(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        Ok(self.read()?.deployments.get(id.as_str()).cloned())
    }

    async fn get_details(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentDetails>> {
        let ledger = self.read()?;

        let Some(deployment) = ledger.deployments.get(id.as_str()) else {
            return Ok(None);
        };
        let repository = ledger
            .repositories
            .get(deployment.repository_id.as_str())
            .cloned()
            .ok_or_else(|| {
                ControlError::internal(format!("deployment {id} has no repository"))
            })?;

        Ok(Some(DeploymentDetails {
            deployment: deployment.clone(),
            repository,
            container: ledger.containers.get(id.as_str()).cloned(),
        }))
    }

    async fn get_repository(&self, id: &RepositoryId) -> ControlResult<Option<Repository>> {
        Ok(self.read()?.repositories.get(id.as_str()).cloned())
    }

    async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>> {
        let ledger = self.read()?;

        let mut results: Vec<_> = ledger
            .deployments
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();

        results.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));

        #[allow(clippy::as_conversions)]
        let offset = filter.offset.unwrap_or(0) as usize;
        let results = results.into_iter().skip(offset);

        if let Some(limit) = filter.limit {
            #[allow(clippy::as_conversions)]
            Ok(results.take(limit as usize).collect())
        } else {
            Ok(results.collect())
        }
    }

    async fn update_build_spec(&self, id: &DeploymentId, spec: &BuildSpec) -> ControlResult<()> {
        let mut ledger = self.write()?;
        let record = ledger.deployment_mut(id)?;

        record.exposed_port = spec.exposed_port;
        record.build_spec = spec.clone();
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn transition(
        &self,
        id: &DeploymentId,
        to: DeploymentStatus,
    ) -> ControlResult<DeploymentStatus> {
        let mut ledger = self.write()?;
        let record = ledger.deployment_mut(id)?;

        let from = record.status;
        check_transition(from, to)?;
        record.status = to;
        record.updated_at = Utc::now();
        Ok(from)
    }

    async fn mark_building(&self, id: &DeploymentId, commit_sha: &str) -> ControlResult<()> {
        let mut ledger = self.write()?;
        let record = ledger.deployment_mut(id)?;

        check_transition(record.status, DeploymentStatus::Building)?;
        if commit_sha != UNKNOWN_COMMIT {
            record.commit_sha = commit_sha.to_owned();
        }
        record.status = DeploymentStatus::Building;
        record.error = None;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_running(
        &self,
        id: &DeploymentId,
        launch: &ContainerLaunch,
    ) -> ControlResult<Container> {
        let mut ledger = self.write()?;
        let record = ledger.deployment_mut(id)?;

        if record.status != DeploymentStatus::Building {
            return Err(ControlError::InvalidStateTransition {
                from: record.status.as_str(),
                to: DeploymentStatus::Running.as_str(),
            });
        }
        let now = Utc::now();
        record.status = DeploymentStatus::Running;
        record.image_tag = Some(launch.image_tag.clone());
        record.updated_at = now;

        let container = Container {
            id: ledger
                .containers
                .get(id.as_str())
                .map_or_else(ContainerRecordId::generate, |c| c.id.clone()),
            deployment_id: id.clone(),
            container_id: launch.container_id.clone(),
            host_port: launch.host_port,
            status: ContainerStatus::Running,
            started_at: Some(now),
            stopped_at: None,
        };
        ledger
            .containers
            .insert(id.as_str().to_owned(), container.clone());

        Ok(container)
    }

    async fn mark_failed(&self, id: &DeploymentId, error: &str) -> ControlResult<()> {
        let mut ledger = self.write()?;
        let record = ledger.deployment_mut(id)?;

        if record.status != DeploymentStatus::Failed {
            check_transition(record.status, DeploymentStatus::Failed)?;
            record.status = DeploymentStatus::Failed;
        }
        record.error = Some(error.to_owned());
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn reset_for_redeploy(
        &self,
        id: &DeploymentId,
        spec: Option<&BuildSpec>,
    ) -> ControlResult<DeploymentRecord> {
        let mut ledger = self.write()?;
        let now = Utc::now();

        let record = ledger.deployment_mut(id)?;
        if let Some(spec) = spec {
            record.exposed_port = spec.exposed_port;
            record.build_spec = spec.clone();
        }
        record.status = DeploymentStatus::Pending;
        record.error = None;
        record.updated_at = now;
        let record = record.clone();

        if let Some(container) = ledger.containers.get_mut(id.as_str()) {
            container.status = ContainerStatus::Stopped;
            container.stopped_at = Some(now);
        }

        Ok(record)
    }

    async fn set_container_status(
        &self,
        id: &DeploymentId,
        status: ContainerStatus,
    ) -> ControlResult<Container> {
        let mut ledger = self.write()?;
        let now = Utc::now();

        if !ledger.containers.contains_key(id.as_str()) {
            return Err(ControlError::not_found(format!(
                "no container for deployment {id}"
            )));
        }

        let record = ledger.deployment_mut(id)?;
        check_transition(record.status, status.deployment_status())?;
        let port = record.exposed_port;

        if status == ContainerStatus::Running {
            if let Some(holder) = ledger.port_holder(port, Some(id)) {
                return Err(ControlError::Conflict {
                    port,
                    holder: holder.id.to_string(),
                });
            }
        }

        let record = ledger.deployment_mut(id)?;
        record.status = status.deployment_status();
        record.updated_at = now;

        let container = ledger
            .containers
            .get_mut(id.as_str())
            .ok_or_else(|| ControlError::internal("container vanished under write lock"))?;
        container.status = status;
        match status {
            ContainerStatus::Running => {
                container.started_at = Some(now);
                container.stopped_at = None;
            }
            ContainerStatus::Stopped => container.stopped_at = Some(now),
        }

        Ok(container.clone())
    }

    async fn delete_deployment(&self, id: &DeploymentId) -> ControlResult<DeletedDeployment> {
        let mut ledger = self.write()?;

        let deployment = ledger
            .deployments
            .remove(id.as_str())
            .ok_or_else(|| ControlError::deployment_not_found(id))?;
        let container = ledger.containers.remove(id.as_str());

        for child in ledger.deployments.values_mut() {
            if child.parent_deployment_id.as_ref() == Some(id) {
                child.parent_deployment_id = None;
            }
        }

        let referenced = ledger
            .deployments
            .values()
            .any(|d| d.repository_id == deployment.repository_id);
        let repository_removed = !referenced
            && ledger
                .repositories
                .remove(deployment.repository_id.as_str())
                .is_some();

        Ok(DeletedDeployment {
            deployment,
            container,
            repository_removed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str, port: u16) -> NewDeployment {
        NewDeployment {
            clone_url: url.to_owned(),
            branch: "main".to_owned(),
            build_spec: BuildSpec::new("node", port),
        }
    }

    fn launch(port: u16) -> ContainerLaunch {
        ContainerLaunch {
            container_id: "c0ffee".to_owned(),
            host_port: port,
            image_tag: "api:abc1234".to_owned(),
        }
    }

    async fn running(store: &MemoryStore, url: &str, port: u16) -> DeploymentRecord {
        let record = store.create_deployment(&request(url, port)).await.expect("create");
        store.mark_building(&record.id, "abc1234").await.expect("building");
        store.mark_running(&record.id, &launch(port)).await.expect("running");
        record
    }

    #[tokio::test]
    async fn create_reuses_repository_per_url() {
        let store = MemoryStore::new();

        let a = store
            .create_deployment(&request("https://github.com/acme/api.git", 4000))
            .await
            .expect("create a");
        let b = store
            .create_deployment(&request("https://github.com/acme/api.git", 4001))
            .await
            .expect("create b");
        let c = store
            .create_deployment(&request("https://github.com/acme/web.git", 4002))
            .await
            .expect("create c");

        assert_eq!(a.repository_id, b.repository_id);
        assert_ne!(a.repository_id, c.repository_id);

        let repo = store
            .get_repository(&a.repository_id)
            .await
            .expect("get")
            .expect("repository exists");
        assert_eq!(repo.full_name, "acme/api");
        assert_eq!(repo.default_branch, "main");
    }

    #[tokio::test]
    async fn held_port_conflicts() {
        let store = MemoryStore::new();
        let first = store
            .create_deployment(&request("https://github.com/acme/api", 4000))
            .await
            .expect("create");

        let err = store
            .create_deployment(&request("https://github.com/acme/web", 4000))
            .await
            .unwrap_err();
        match err {
            ControlError::Conflict { port, holder } => {
                assert_eq!(port, 4000);
                assert_eq!(holder, first.id.to_string());
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stopped_and_failed_deployments_release_port() {
        let store = MemoryStore::new();

        let stopped = running(&store, "https://github.com/acme/api", 4000).await;
        store
            .set_container_status(&stopped.id, ContainerStatus::Stopped)
            .await
            .expect("stop");
        store
            .create_deployment(&request("https://github.com/acme/web", 4000))
            .await
            .expect("port released by stop");

        let failed = store
            .create_deployment(&request("https://github.com/acme/cli", 5000))
            .await
            .expect("create");
        store.mark_failed(&failed.id, "boom").await.expect("fail");
        store
            .create_deployment(&request("https://github.com/acme/docs", 5000))
            .await
            .expect("port released by failure");
    }

    #[tokio::test]
    async fn mark_running_writes_container_and_status_together() {
        let store = MemoryStore::new();
        let record = running(&store, "https://github.com/acme/api", 4000).await;

        let details = store
            .get_details(&record.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(details.deployment.status, DeploymentStatus::Running);
        assert_eq!(details.deployment.commit_sha, "abc1234");
        assert_eq!(details.deployment.image_tag.as_deref(), Some("api:abc1234"));

        let container = details.container.expect("container row");
        assert_eq!(container.container_id, "c0ffee");
        assert_eq!(container.host_port, 4000);
        assert_eq!(container.status, ContainerStatus::Running);
    }

    #[tokio::test]
    async fn mark_running_requires_building() {
        let store = MemoryStore::new();
        let record = store
            .create_deployment(&request("https://github.com/acme/api", 4000))
            .await
            .expect("create");

        let err = store.mark_running(&record.id, &launch(4000)).await.unwrap_err();
        assert!(matches!(err, ControlError::InvalidStateTransition { .. }));

        let details = store.get_details(&record.id).await.expect("get").expect("exists");
        assert!(details.container.is_none());
        assert_eq!(details.deployment.status, DeploymentStatus::Pending);
    }

    #[tokio::test]
    async fn resolved_commit_is_never_reset() {
        let store = MemoryStore::new();
        let record = store
            .create_deployment(&request("https://github.com/acme/api", 4000))
            .await
            .expect("create");
        store.mark_building(&record.id, "abc1234").await.expect("building");
        store.mark_failed(&record.id, "build failed").await.expect("fail");
        store.transition(&record.id, DeploymentStatus::Pending).await.expect("reset");
        store.mark_building(&record.id, UNKNOWN_COMMIT).await.expect("building");

        let record = store.get(&record.id).await.expect("get").expect("exists");
        assert_eq!(record.commit_sha, "abc1234");
        assert!(record.error.is_none());
    }

    #[tokio::test]
    async fn mark_failed_is_idempotent() {
        let store = MemoryStore::new();
        let record = store
            .create_deployment(&request("https://github.com/acme/api", 4000))
            .await
            .expect("create");

        store.mark_failed(&record.id, "first").await.expect("fail");
        store.mark_failed(&record.id, "second").await.expect("fail again");

        let record = store.get(&record.id).await.expect("get").expect("exists");
        assert_eq!(record.status, DeploymentStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn container_status_follows_state_machine() {
        let store = MemoryStore::new();
        let record = running(&store, "https://github.com/acme/api", 4000).await;

        let stopped = store
            .set_container_status(&record.id, ContainerStatus::Stopped)
            .await
            .expect("stop");
        assert!(stopped.stopped_at.is_some());

        let restarted = store
            .set_container_status(&record.id, ContainerStatus::Running)
            .await
            .expect("start");
        assert!(restarted.stopped_at.is_none());
        assert_eq!(
            store.get(&record.id).await.expect("get").expect("exists").status,
            DeploymentStatus::Running
        );

        let pending = store
            .create_deployment(&request("https://github.com/acme/web", 4001))
            .await
            .expect("create");
        let err = store
            .set_container_status(&pending.id, ContainerStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::NotFound(_)));
    }

    #[tokio::test]
    async fn reset_keeps_container_row_stopped() {
        let store = MemoryStore::new();
        let record = running(&store, "https://github.com/acme/api", 4000).await;

        let reset = store
            .reset_for_redeploy(&record.id, Some(&BuildSpec::new("python", 5000)))
            .await
            .expect("reset");
        assert_eq!(reset.status, DeploymentStatus::Pending);
        assert_eq!(reset.exposed_port, 5000);
        assert_eq!(reset.commit_sha, "abc1234");

        let details = store.get_details(&record.id).await.expect("get").expect("exists");
        let container = details.container.expect("container kept");
        assert_eq!(container.status, ContainerStatus::Stopped);

        store.mark_building(&record.id, "def5678").await.expect("building");
        let relaunched = store.mark_running(&record.id, &launch(5000)).await.expect("running");
        assert_eq!(relaunched.id, container.id);
        assert_eq!(relaunched.host_port, 5000);
    }

    #[tokio::test]
    async fn delete_removes_orphaned_repository_only() {
        let store = MemoryStore::new();
        let a = running(&store, "https://github.com/acme/api", 4000).await;
        let b = store
            .create_deployment(&request("https://github.com/acme/api", 4001))
            .await
            .expect("sibling");

        let deleted = store.delete_deployment(&a.id).await.expect("delete a");
        assert!(!deleted.repository_removed);
        assert!(deleted.container.is_some());
        assert!(store.get(&a.id).await.expect("get").is_none());
        assert!(store.get_repository(&a.repository_id).await.expect("get").is_some());

        let deleted = store.delete_deployment(&b.id).await.expect("delete b");
        assert!(deleted.repository_removed);
        assert!(store.get_repository(&b.repository_id).await.expect("get").is_none());

        let err = store.delete_deployment(&b.id).await.unwrap_err();
        assert!(matches!(err, ControlError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_unlinks_children() {
        let store = MemoryStore::new();
        let parent = running(&store, "https://github.com/acme/api", 4000).await;
        let child = store
            .insert_child(&parent.id, "abc1234", &parent.build_spec)
            .await
            .expect("child");
        assert_eq!(child.parent_deployment_id.as_ref(), Some(&parent.id));
        assert_eq!(child.repository_id, parent.repository_id);

        store.delete_deployment(&parent.id).await.expect("delete");
        let child = store.get(&child.id).await.expect("get").expect("exists");
        assert!(child.parent_deployment_id.is_none());
    }

    #[tokio::test]
    async fn list_with_filters_and_pagination() {
        let store = MemoryStore::new();
        let parent = running(&store, "https://github.com/acme/api", 4000).await;
        let child = store
            .insert_child(&parent.id, UNKNOWN_COMMIT, &parent.build_spec)
            .await
            .expect("child");
        store
            .create_deployment(&request("https://github.com/acme/web", 4001))
            .await
            .expect("other");

        let by_repo = store
            .list(&DeploymentFilter::new().with_repository(parent.repository_id.clone()))
            .await
            .expect("list");
        assert_eq!(by_repo.len(), 2);

        let running_main = store
            .list(
                &DeploymentFilter::new()
                    .with_repository(parent.repository_id.clone())
                    .with_branch("main")
                    .with_status(DeploymentStatus::Running),
            )
            .await
            .expect("list");
        assert_eq!(running_main.len(), 1);
        assert_eq!(running_main[0].id, parent.id);

        let children = store
            .list(&DeploymentFilter::new().with_parent(parent.id.clone()))
            .await
            .expect("list");
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, child.id);

        let all = store.list(&DeploymentFilter::new()).await.expect("list");
        assert_eq!(all.len(), 3);
        let page = store
            .list(&DeploymentFilter::new().with_limit(2).with_offset(2))
            .await
            .expect("list");
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, all[2].id);
    }

    #[tokio::test]
    async fn restart_conflicts_with_child_on_same_port() {
        let store = MemoryStore::new();
        let parent = running(&store, "https://github.com/acme/api", 4000).await;
        store
            .set_container_status(&parent.id, ContainerStatus::Stopped)
            .await
            .expect("stop");

        let child = store
            .insert_child(&parent.id, "def5678", &parent.build_spec)
            .await
            .expect("child");

        let err = store
            .set_container_status(&parent.id, ContainerStatus::Running)
            .await
            .unwrap_err();
        match err {
            ControlError::Conflict { port, holder } => {
                assert_eq!(port, 4000);
                assert_eq!(holder, child.id.to_string());
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        let parent = store.get(&parent.id).await.expect("get").expect("exists");
        assert_eq!(parent.status, DeploymentStatus::Stopped);
    }
}
