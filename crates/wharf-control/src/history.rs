//! Parent-chain walks for history and rollback.
//!
//! Deployments form chains through `parent_deployment_id`. The chain is
//! walked by repeated lookups in the ledger, newest first, with a visited set
//! so a corrupted cycle fails loudly instead of looping.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{ControlError, ControlResult};
use crate::store::DeploymentStore;
use crate::types::{DeploymentId, DeploymentRecord, DeploymentStatus};

/// One step of a deployment's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: DeploymentId,
    pub commit_sha: String,
    pub status: DeploymentStatus,
    pub created_at: DateTime<Utc>,
    pub branch: String,
    /// Set only on the deployment the walk started from.
    pub is_current: bool,
}

impl HistoryEntry {
    fn from_record(record: &DeploymentRecord, is_current: bool) -> Self {
        Self {
            id: record.id.clone(),
            commit_sha: record.commit_sha.clone(),
            status: record.status,
            created_at: record.created_at,
            branch: record.branch.clone(),
            is_current,
        }
    }
}

/// Resolves deployment history against the ledger.
#[derive(Clone)]
pub struct HistoryResolver {
    store: Arc<dyn DeploymentStore>,
}

impl HistoryResolver {
    pub fn new(store: Arc<dyn DeploymentStore>) -> Self {
        Self { store }
    }

    /// The chain from `id` back to its root, newest first.
    pub async fn history(&self, id: &DeploymentId) -> ControlResult<Vec<HistoryEntry>> {
        let mut entries = Vec::new();
        self.walk(id, |record| {
            entries.push(HistoryEntry::from_record(record, entries.is_empty()));
            false
        })
        .await?;
        Ok(entries)
    }

    /// The newest deployment in the chain from `id` that ran `commit_sha`.
    pub async fn find_by_commit(
        &self,
        id: &DeploymentId,
        commit_sha: &str,
    ) -> ControlResult<DeploymentRecord> {
        let mut found = None;
        self.walk(id, |record| {
            if record.commit_sha == commit_sha {
                found = Some(record.clone());
                true
            } else {
                false
            }
        })
        .await?;

        found.ok_or_else(|| {
            ControlError::not_found(format!("Commit {commit_sha} not found in deployment history"))
        })
    }

    /// Visit the chain starting at `start` until `visit` returns `true` or the
    /// root is reached.
    async fn walk<F>(&self, start: &DeploymentId, mut visit: F) -> ControlResult<()>
    where
        F: FnMut(&DeploymentRecord) -> bool + Send,
    {
        let mut visited = HashSet::new();
        let mut next = Some(start.clone());

        while let Some(id) = next {
            if !visited.insert(id.clone()) {
                return Err(ControlError::internal(format!(
                    "cycle in deployment history of {start} at {id}"
                )));
            }

            let Some(record) = self.store.get(&id).await? else {
                if id == *start {
                    return Err(ControlError::deployment_not_found(start));
                }
                // A dangling parent link ends the chain.
                break;
            };

            if visit(&record) {
                break;
            }
            next = record.parent_deployment_id;
        }

        Ok(())
    }
}

impl std::fmt::Debug for HistoryResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryResolver").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{NewDeployment, UNKNOWN_COMMIT};
    use wharf_build::BuildSpec;

    async fn chain(store: &MemoryStore, commits: &[&str]) -> Vec<DeploymentRecord> {
        let root = store
            .create_deployment(&NewDeployment {
                clone_url: "https://github.com/acme/api".to_owned(),
                branch: "main".to_owned(),
                build_spec: BuildSpec::new("node", 4000),
            })
            .await
            .expect("create");
        store.mark_building(&root.id, commits[0]).await.expect("building");

        let mut records = vec![store.get(&root.id).await.expect("get").expect("exists")];
        for commit in &commits[1..] {
            let parent = &records[records.len() - 1];
            let child = store
                .insert_child(&parent.id, commit, &parent.build_spec)
                .await
                .expect("child");
            records.push(child);
        }
        records
    }

    #[tokio::test]
    async fn history_is_newest_first_with_single_current() {
        let store = Arc::new(MemoryStore::new());
        let records = chain(&store, &["aaaaaaa", "bbbbbbb", "ccccccc"]).await;
        let resolver = HistoryResolver::new(store);

        let history = resolver.history(&records[2].id).await.expect("history");
        let commits: Vec<_> = history.iter().map(|e| e.commit_sha.as_str()).collect();
        assert_eq!(commits, ["ccccccc", "bbbbbbb", "aaaaaaa"]);
        assert!(history[0].is_current);
        assert_eq!(history.iter().filter(|e| e.is_current).count(), 1);

        let mid = resolver.history(&records[1].id).await.expect("history");
        assert_eq!(mid.len(), 2);
        assert_eq!(mid[0].id, records[1].id);
    }

    #[tokio::test]
    async fn find_by_commit_returns_original_deployment() {
        let store = Arc::new(MemoryStore::new());
        let records = chain(&store, &["aaaaaaa", "bbbbbbb", UNKNOWN_COMMIT]).await;
        let resolver = HistoryResolver::new(store);

        let found = resolver
            .find_by_commit(&records[2].id, "aaaaaaa")
            .await
            .expect("found");
        assert_eq!(found.id, records[0].id);

        let err = resolver
            .find_by_commit(&records[2].id, "fffffff")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Commit fffffff not found in deployment history");
    }

    #[tokio::test]
    async fn corrupted_cycle_fails_instead_of_looping() {
        let store = Arc::new(MemoryStore::new());
        let records = chain(&store, &["aaaaaaa", "bbbbbbb", "ccccccc"]).await;
        store.set_parent(&records[0].id, Some(records[2].id.clone()));
        let resolver = HistoryResolver::new(store);

        let err = resolver.history(&records[2].id).await.unwrap_err();
        assert!(matches!(err, ControlError::Internal(_)));
        assert!(err.to_string().contains("cycle in deployment history"));

        let err = resolver
            .find_by_commit(&records[1].id, "fffffff")
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Internal(_)));
    }

    #[tokio::test]
    async fn missing_start_is_not_found() {
        let resolver = HistoryResolver::new(Arc::new(MemoryStore::new()));
        let err = resolver.history(&DeploymentId::new("ghost")).await.unwrap_err();
        assert!(matches!(err, ControlError::NotFound(_)));
    }
}
