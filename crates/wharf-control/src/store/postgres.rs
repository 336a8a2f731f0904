//! PostgreSQL deployment ledger implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use wharf_build::BuildSpec;

use crate::error::{ControlError, ControlResult};
use crate::state::check_transition;
use crate::types::{
    Container, ContainerLaunch, ContainerRecordId, ContainerStatus, DeletedDeployment,
    DeploymentDetails, DeploymentId, DeploymentRecord, DeploymentStatus, NewDeployment,
    Repository, RepositoryId, UNKNOWN_COMMIT,
};

use super::{DeploymentFilter, DeploymentStore};

const DEPLOYMENT_COLUMNS: &str = "id, repository_id, branch, commit_sha, build_spec, \
     exposed_port, status, image_tag, parent_deployment_id, error, created_at, updated_at";

const REPOSITORY_COLUMNS: &str = "id, name, full_name, clone_url, default_branch, created_at";

const CONTAINER_COLUMNS: &str =
    "id, deployment_id, container_id, host_port, status, started_at, stopped_at";

/// PostgreSQL-backed deployment ledger.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL and create a new store.
    ///
    /// The required tables are created if they don't exist.
    pub async fn new(url: &str, max_connections: u32) -> ControlResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        Self::from_pool(pool).await
    }

    /// Create a store from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> ControlResult<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Ensure the required tables exist.
    async fn ensure_schema(&self) -> ControlResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS repositories (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                full_name TEXT NOT NULL,
                clone_url TEXT NOT NULL UNIQUE,
                default_branch TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                repository_id TEXT NOT NULL REFERENCES repositories(id),
                branch TEXT NOT NULL,
                commit_sha TEXT NOT NULL,
                build_spec JSONB NOT NULL,
                exposed_port INTEGER NOT NULL,
                status TEXT NOT NULL,
                image_tag TEXT,
                parent_deployment_id TEXT REFERENCES deployments(id) ON DELETE SET NULL,
                error TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS containers (
                id TEXT PRIMARY KEY,
                deployment_id TEXT NOT NULL UNIQUE REFERENCES deployments(id) ON DELETE CASCADE,
                container_id TEXT NOT NULL,
                host_port INTEGER NOT NULL,
                status TEXT NOT NULL,
                started_at TIMESTAMPTZ,
                stopped_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for index in [
            "CREATE INDEX IF NOT EXISTS idx_deployments_repository_branch \
             ON deployments (repository_id, branch)",
            "CREATE INDEX IF NOT EXISTS idx_deployments_port_status \
             ON deployments (exposed_port, status)",
            "CREATE INDEX IF NOT EXISTS idx_deployments_parent \
             ON deployments (parent_deployment_id)",
            "CREATE INDEX IF NOT EXISTS idx_deployments_created_at \
             ON deployments (created_at DESC)",
        ] {
            sqlx::query(index).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Parse a row into a DeploymentRecord.
    fn row_to_record(row: &PgRow) -> ControlResult<DeploymentRecord> {
        let build_spec_json: serde_json::Value = row.try_get("build_spec")?;
        let status_str: String = row.try_get("status")?;
        let parent: Option<String> = row.try_get("parent_deployment_id")?;

        let build_spec: BuildSpec = serde_json::from_value(build_spec_json).map_err(|e| {
            ControlError::Serialisation(format!("failed to deserialise build spec: {e}"))
        })?;

        let status: DeploymentStatus = status_str.parse().map_err(|e| {
            ControlError::Serialisation(format!("failed to parse status '{status_str}': {e}"))
        })?;

        Ok(DeploymentRecord {
            id: DeploymentId::new(row.try_get::<String, _>("id")?),
            repository_id: RepositoryId::new(row.try_get::<String, _>("repository_id")?),
            branch: row.try_get("branch")?,
            commit_sha: row.try_get("commit_sha")?,
            build_spec,
            exposed_port: port_from_column(row.try_get("exposed_port")?)?,
            status,
            image_tag: row.try_get("image_tag")?,
            parent_deployment_id: parent.map(DeploymentId::new),
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_repository(row: &PgRow) -> ControlResult<Repository> {
        Ok(Repository {
            id: RepositoryId::new(row.try_get::<String, _>("id")?),
            name: row.try_get("name")?,
            full_name: row.try_get("full_name")?,
            clone_url: row.try_get("clone_url")?,
            default_branch: row.try_get("default_branch")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_container(row: &PgRow) -> ControlResult<Container> {
        let status_str: String = row.try_get("status")?;
        let status: ContainerStatus = status_str.parse().map_err(|e| {
            ControlError::Serialisation(format!("failed to parse status '{status_str}': {e}"))
        })?;

        Ok(Container {
            id: ContainerRecordId::new(row.try_get::<String, _>("id")?),
            deployment_id: DeploymentId::new(row.try_get::<String, _>("deployment_id")?),
            container_id: row.try_get("container_id")?,
            host_port: port_from_column(row.try_get("host_port")?)?,
            status,
            started_at: row.try_get("started_at")?,
            stopped_at: row.try_get("stopped_at")?,
        })
    }

    async fn insert_record(
        tx: &mut Transaction<'_, Postgres>,
        record: &DeploymentRecord,
    ) -> ControlResult<()> {
        let build_spec_json = serde_json::to_value(&record.build_spec).map_err(|e| {
            ControlError::Serialisation(format!("failed to serialise build spec: {e}"))
        })?;

        sqlx::query(&format!(
            "INSERT INTO deployments ({DEPLOYMENT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        ))
        .bind(record.id.as_str())
        .bind(record.repository_id.as_str())
        .bind(&record.branch)
        .bind(&record.commit_sha)
        .bind(&build_spec_json)
        .bind(i32::from(record.exposed_port))
        .bind(record.status.as_str())
        .bind(&record.image_tag)
        .bind(record.parent_deployment_id.as_ref().map(DeploymentId::as_str))
        .bind(&record.error)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Lock a deployment row for the rest of the transaction.
    async fn lock_record(
        tx: &mut Transaction<'_, Postgres>,
        id: &DeploymentId,
    ) -> ControlResult<DeploymentRecord> {
        let row = sqlx::query(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_str())
        .fetch_optional(&mut **tx)
        .await?;

        match row {
            Some(r) => Self::row_to_record(&r),
            None => Err(ControlError::deployment_not_found(id)),
        }
    }

    /// Fail with `Conflict` if a deployment other than `except` holds `port`.
    ///
    /// Takes a transaction-scoped advisory lock on the port, so concurrent
    /// claims on the same port are serialised until the caller commits.
    async fn claim_port(
        tx: &mut Transaction<'_, Postgres>,
        port: u16,
        except: Option<&DeploymentId>,
    ) -> ControlResult<()> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(i64::from(port))
            .execute(&mut **tx)
            .await?;

        let holder: Option<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM deployments
            WHERE exposed_port = $1
              AND status IN ('PENDING', 'BUILDING', 'RUNNING')
              AND ($2::TEXT IS NULL OR id <> $2)
            LIMIT 1
            "#,
        )
        .bind(i32::from(port))
        .bind(except.map(DeploymentId::as_str))
        .fetch_optional(&mut **tx)
        .await?;

        match holder {
            Some(holder) => Err(ControlError::Conflict { port, holder }),
            None => Ok(()),
        }
    }

    async fn set_status(
        tx: &mut Transaction<'_, Postgres>,
        id: &DeploymentId,
        status: DeploymentStatus,
        now: DateTime<Utc>,
    ) -> ControlResult<()> {
        sqlx::query("UPDATE deployments SET status = $1, updated_at = $2 WHERE id = $3")
            .bind(status.as_str())
            .bind(now)
            .bind(id.as_str())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

fn port_from_column(value: i32) -> ControlResult<u16> {
    u16::try_from(value)
        .map_err(|_| ControlError::Serialisation(format!("port out of range: {value}")))
}

#[async_trait]
impl DeploymentStore for PostgresStore {
    async fn create_deployment(&self, request: &NewDeployment) -> ControlResult<DeploymentRecord> {
        let candidate = Repository::from_url(&request.clone_url, &request.branch)?;
        let port = request.build_spec.exposed_port;

        let mut tx = self.pool.begin().await?;

        Self::claim_port(&mut tx, port, None).await?;

        sqlx::query(&format!(
            "INSERT INTO repositories ({REPOSITORY_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (clone_url) DO NOTHING"
        ))
        .bind(candidate.id.as_str())
        .bind(&candidate.name)
        .bind(&candidate.full_name)
        .bind(&candidate.clone_url)
        .bind(&candidate.default_branch)
        .bind(candidate.created_at)
        .execute(&mut *tx)
        .await?;

        let repository_id: String =
            sqlx::query_scalar("SELECT id FROM repositories WHERE clone_url = $1 FOR SHARE")
                .bind(&request.clone_url)
                .fetch_one(&mut *tx)
                .await?;

        let record = DeploymentRecord::new(
            RepositoryId::new(repository_id),
            request.branch.clone(),
            request.build_spec.clone(),
            None,
            None,
        );
        Self::insert_record(&mut tx, &record).await?;

        tx.commit().await?;
        Ok(record)
    }

    async fn insert_child(
        &self,
        parent: &DeploymentId,
        commit_sha: &str,
        build_spec: &BuildSpec,
    ) -> ControlResult<DeploymentRecord> {
        let mut tx = self.pool.begin().await?;
        let parent = Self::lock_record(&mut tx, parent).await?;

        let record = DeploymentRecord::new(
            parent.repository_id,
            parent.branch,
            build_spec.clone(),
            Some(commit_sha.to_owned()),
            Some(parent.id),
        );
        Self::insert_record(&mut tx, &record).await?;

        tx.commit().await?;
        Ok(record)
    }

    async fn get(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(Self::row_to_record(&r)?)),
            None => Ok(None),
        }
    }

    async fn get_details(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentDetails>> {
        // One snapshot for all three reads.
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let Some(row) = sqlx::query(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(None);
        };
        let deployment = Self::row_to_record(&row)?;

        let row = sqlx::query(&format!(
            "SELECT {REPOSITORY_COLUMNS} FROM repositories WHERE id = $1"
        ))
        .bind(deployment.repository_id.as_str())
        .fetch_one(&mut *tx)
        .await?;
        let repository = Self::row_to_repository(&row)?;

        let container = sqlx::query(&format!(
            "SELECT {CONTAINER_COLUMNS} FROM containers WHERE deployment_id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .map(|r| Self::row_to_container(&r))
        .transpose()?;

        tx.commit().await?;

        Ok(Some(DeploymentDetails {
            deployment,
            repository,
            container,
        }))
    }

    async fn get_repository(&self, id: &RepositoryId) -> ControlResult<Option<Repository>> {
        let row = sqlx::query(&format!(
            "SELECT {REPOSITORY_COLUMNS} FROM repositories WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::row_to_repository(&r)).transpose()
    }

    async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>> {
        let mut query = format!("SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE 1=1");

        let mut params: Vec<String> = Vec::new();

        if let Some(ref repository_id) = filter.repository_id {
            params.push(repository_id.as_str().to_owned());
            query.push_str(&format!(" AND repository_id = ${}", params.len()));
        }

        if let Some(ref branch) = filter.branch {
            params.push(branch.clone());
            query.push_str(&format!(" AND branch = ${}", params.len()));
        }

        if let Some(status) = filter.status {
            params.push(status.as_str().to_owned());
            query.push_str(&format!(" AND status = ${}", params.len()));
        }

        if let Some(ref parent_id) = filter.parent_id {
            params.push(parent_id.as_str().to_owned());
            query.push_str(&format!(" AND parent_deployment_id = ${}", params.len()));
        }

        query.push_str(" ORDER BY created_at DESC, id DESC");

        if let Some(limit) = filter.limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }

        if let Some(offset) = filter.offset {
            query.push_str(&format!(" OFFSET {offset}"));
        }

        let mut sqlx_query = sqlx::query(&query);
        for param in &params {
            sqlx_query = sqlx_query.bind(param);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn update_build_spec(&self, id: &DeploymentId, spec: &BuildSpec) -> ControlResult<()> {
        let build_spec_json = serde_json::to_value(spec).map_err(|e| {
            ControlError::Serialisation(format!("failed to serialise build spec: {e}"))
        })?;

        let result = sqlx::query(
            r#"
            UPDATE deployments
            SET build_spec = $1, exposed_port = $2, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(&build_spec_json)
        .bind(i32::from(spec.exposed_port))
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::deployment_not_found(id));
        }

        Ok(())
    }

    async fn transition(
        &self,
        id: &DeploymentId,
        to: DeploymentStatus,
    ) -> ControlResult<DeploymentStatus> {
        let mut tx = self.pool.begin().await?;
        let record = Self::lock_record(&mut tx, id).await?;

        check_transition(record.status, to)?;
        Self::set_status(&mut tx, id, to, Utc::now()).await?;

        tx.commit().await?;
        Ok(record.status)
    }

    async fn mark_building(&self, id: &DeploymentId, commit_sha: &str) -> ControlResult<()> {
        let mut tx = self.pool.begin().await?;
        let record = Self::lock_record(&mut tx, id).await?;

        check_transition(record.status, DeploymentStatus::Building)?;
        let commit = if commit_sha == UNKNOWN_COMMIT {
            record.commit_sha.as_str()
        } else {
            commit_sha
        };

        sqlx::query(
            r#"
            UPDATE deployments
            SET status = $1, commit_sha = $2, error = NULL, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(DeploymentStatus::Building.as_str())
        .bind(commit)
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn mark_running(
        &self,
        id: &DeploymentId,
        launch: &ContainerLaunch,
    ) -> ControlResult<Container> {
        let mut tx = self.pool.begin().await?;
        let record = Self::lock_record(&mut tx, id).await?;

        if record.status != DeploymentStatus::Building {
            return Err(ControlError::InvalidStateTransition {
                from: record.status.as_str(),
                to: DeploymentStatus::Running.as_str(),
            });
        }
        let now = Utc::now();

        sqlx::query(
            r#"
            UPDATE deployments
            SET status = $1, image_tag = $2, updated_at = $3
            WHERE id = $4
            "#,
        )
        .bind(DeploymentStatus::Running.as_str())
        .bind(&launch.image_tag)
        .bind(now)
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO containers ({CONTAINER_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, NULL)
            ON CONFLICT (deployment_id) DO UPDATE
            SET container_id = EXCLUDED.container_id,
                host_port = EXCLUDED.host_port,
                status = EXCLUDED.status,
                started_at = EXCLUDED.started_at,
                stopped_at = NULL
            RETURNING {CONTAINER_COLUMNS}
            "#
        ))
        .bind(ContainerRecordId::generate().as_str())
        .bind(id.as_str())
        .bind(&launch.container_id)
        .bind(i32::from(launch.host_port))
        .bind(ContainerStatus::Running.as_str())
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        let container = Self::row_to_container(&row)?;

        tx.commit().await?;
        Ok(container)
    }

    async fn mark_failed(&self, id: &DeploymentId, error: &str) -> ControlResult<()> {
        let mut tx = self.pool.begin().await?;
        let record = Self::lock_record(&mut tx, id).await?;

        if record.status != DeploymentStatus::Failed {
            check_transition(record.status, DeploymentStatus::Failed)?;
        }

        sqlx::query(
            r#"
            UPDATE deployments
            SET status = $1, error = $2, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(DeploymentStatus::Failed.as_str())
        .bind(error)
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn reset_for_redeploy(
        &self,
        id: &DeploymentId,
        spec: Option<&BuildSpec>,
    ) -> ControlResult<DeploymentRecord> {
        let mut tx = self.pool.begin().await?;
        let mut record = Self::lock_record(&mut tx, id).await?;
        let now = Utc::now();

        if let Some(spec) = spec {
            record.exposed_port = spec.exposed_port;
            record.build_spec = spec.clone();
        }
        let build_spec_json = serde_json::to_value(&record.build_spec).map_err(|e| {
            ControlError::Serialisation(format!("failed to serialise build spec: {e}"))
        })?;

        sqlx::query(
            r#"
            UPDATE deployments
            SET status = $1, build_spec = $2, exposed_port = $3, error = NULL, updated_at = $4
            WHERE id = $5
            "#,
        )
        .bind(DeploymentStatus::Pending.as_str())
        .bind(&build_spec_json)
        .bind(i32::from(record.exposed_port))
        .bind(now)
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE containers SET status = $1, stopped_at = $2 WHERE deployment_id = $3")
            .bind(ContainerStatus::Stopped.as_str())
            .bind(now)
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        record.status = DeploymentStatus::Pending;
        record.error = None;
        record.updated_at = now;
        Ok(record)
    }

    async fn set_container_status(
        &self,
        id: &DeploymentId,
        status: ContainerStatus,
    ) -> ControlResult<Container> {
        let mut tx = self.pool.begin().await?;
        let record = Self::lock_record(&mut tx, id).await?;
        let now = Utc::now();

        check_transition(record.status, status.deployment_status())?;
        if status == ContainerStatus::Running {
            Self::claim_port(&mut tx, record.exposed_port, Some(id)).await?;
        }

        let row = sqlx::query(&format!(
            r#"
            UPDATE containers
            SET status = $1,
                started_at = CASE WHEN $1 = 'RUNNING' THEN $2 ELSE started_at END,
                stopped_at = CASE WHEN $1 = 'RUNNING' THEN NULL ELSE $2 END
            WHERE deployment_id = $3
            RETURNING {CONTAINER_COLUMNS}
            "#
        ))
        .bind(status.as_str())
        .bind(now)
        .bind(id.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Err(ControlError::not_found(format!(
                "no container for deployment {id}"
            )));
        };
        let container = Self::row_to_container(&row)?;

        Self::set_status(&mut tx, id, status.deployment_status(), now).await?;

        tx.commit().await?;
        Ok(container)
    }

    async fn delete_deployment(&self, id: &DeploymentId) -> ControlResult<DeletedDeployment> {
        let mut tx = self.pool.begin().await?;
        let deployment = Self::lock_record(&mut tx, id).await?;

        let container = sqlx::query(&format!(
            "SELECT {CONTAINER_COLUMNS} FROM containers WHERE deployment_id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .map(|r| Self::row_to_container(&r))
        .transpose()?;

        // Containers cascade; children have their parent link cleared.
        sqlx::query("DELETE FROM deployments WHERE id = $1")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;

        let removed = sqlx::query(
            r#"
            DELETE FROM repositories
            WHERE id = $1
              AND NOT EXISTS (SELECT 1 FROM deployments WHERE repository_id = $1)
            "#,
        )
        .bind(deployment.repository_id.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(DeletedDeployment {
            deployment,
            container,
            repository_removed: removed.rows_affected() > 0,
        })
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}
