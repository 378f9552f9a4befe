//! PostgreSQL implementation of TaskQueueBackend
//!
//! Work items are claimed with `FOR UPDATE SKIP LOCKED` so any number of
//! workers can poll the same queue without contention.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Row};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use super::queue::*;
use super::BackendAddress;
use crate::activity::ActivityError;
use crate::workflow::{WorkflowAction, WorkflowError, WorkflowEvent};

/// PostgreSQL backend session
///
/// ```ignore
/// let connector = PostgresConnector::new("maap").with_credentials(Some("maap".into()), None);
/// let backend = connector.connect(&"localhost:5432".parse()?).await?;
/// ```
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled task queue migrations
    pub async fn migrate(&self) -> Result<(), BackendError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| BackendError::Database(e.to_string()))
    }
}

#[async_trait]
impl TaskQueueBackend for PostgresBackend {
    #[instrument(skip(self, worker), fields(worker_id = %worker.id))]
    async fn register_worker(&self, worker: &WorkerInfo) -> Result<(), BackendError> {
        sqlx::query(
            r#"
            INSERT INTO maap_workers (
                id, task_queue, workflow_types, activity_types, max_concurrency,
                status, started_at, last_seen_at
            )
            VALUES ($1, $2, $3, $4, $5, 'active', $6, NOW())
            ON CONFLICT (id) DO UPDATE SET
                task_queue = EXCLUDED.task_queue,
                workflow_types = EXCLUDED.workflow_types,
                activity_types = EXCLUDED.activity_types,
                max_concurrency = EXCLUDED.max_concurrency,
                status = 'active',
                last_seen_at = NOW()
            "#,
        )
        .bind(&worker.id)
        .bind(&worker.task_queue)
        .bind(&worker.workflow_types)
        .bind(&worker.activity_types)
        .bind(worker.max_concurrency as i32)
        .bind(worker.started_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to register worker: {}", e);
            BackendError::from(e)
        })?;

        debug!("registered worker");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn deregister_worker(&self, worker_id: &str) -> Result<(), BackendError> {
        sqlx::query(
            r#"
            UPDATE maap_workers
            SET status = 'stopped', last_seen_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        debug!("deregistered worker");
        Ok(())
    }

    #[instrument(skip(self, workflow_types))]
    async fn poll_workflow_tasks(
        &self,
        task_queue: &str,
        worker_id: &str,
        workflow_types: &[String],
        max_tasks: usize,
    ) -> Result<Vec<WorkflowTask>, BackendError> {
        if workflow_types.is_empty() || max_tasks == 0 {
            return Ok(vec![]);
        }

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM maap_workflow_tasks
                WHERE task_queue = $1
                  AND status = 'pending'
                  AND workflow_type = ANY($2)
                ORDER BY created_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE maap_workflow_tasks t
            SET status = 'claimed',
                claimed_by = $4,
                claimed_at = NOW()
            FROM claimable c
            WHERE t.id = c.id
            RETURNING t.id, t.workflow_id, t.workflow_type, t.input, t.history
            "#,
        )
        .bind(task_queue)
        .bind(workflow_types)
        .bind(max_tasks as i64)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim workflow tasks: {}", e);
            BackendError::from(e)
        })?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let history: Vec<WorkflowEvent> = serde_json::from_value(row.get("history"))?;
            claimed.push(WorkflowTask {
                id: row.get("id"),
                workflow_id: row.get("workflow_id"),
                workflow_type: row.get("workflow_type"),
                input: row.get("input"),
                history,
            });
        }

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "claimed workflow tasks");
        }

        Ok(claimed)
    }

    #[instrument(skip(self, actions))]
    async fn complete_workflow_task(
        &self,
        task_id: Uuid,
        actions: Vec<WorkflowAction>,
    ) -> Result<(), BackendError> {
        let actions = serde_json::to_value(&actions)?;

        let result = sqlx::query(
            r#"
            UPDATE maap_workflow_tasks
            SET status = 'completed', actions = $2
            WHERE id = $1 AND status = 'claimed'
            "#,
        )
        .bind(task_id)
        .bind(&actions)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BackendError::TaskNotFound(task_id));
        }

        debug!("completed workflow task");
        Ok(())
    }

    #[instrument(skip(self, error))]
    async fn fail_workflow_task(
        &self,
        task_id: Uuid,
        error: &WorkflowError,
    ) -> Result<(), BackendError> {
        let error = serde_json::to_value(error)?;

        let result = sqlx::query(
            r#"
            UPDATE maap_workflow_tasks
            SET status = 'failed', error = $2
            WHERE id = $1 AND status = 'claimed'
            "#,
        )
        .bind(task_id)
        .bind(&error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BackendError::TaskNotFound(task_id));
        }

        Ok(())
    }

    #[instrument(skip(self, activity_types))]
    async fn poll_activity_tasks(
        &self,
        task_queue: &str,
        worker_id: &str,
        activity_types: &[String],
        max_tasks: usize,
    ) -> Result<Vec<ActivityTask>, BackendError> {
        if activity_types.is_empty() || max_tasks == 0 {
            return Ok(vec![]);
        }

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM maap_activity_tasks
                WHERE task_queue = $1
                  AND status = 'pending'
                  AND activity_type = ANY($2)
                  AND visible_at <= NOW()
                ORDER BY priority DESC, visible_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE maap_activity_tasks t
            SET status = 'claimed',
                claimed_by = $4,
                claimed_at = NOW(),
                heartbeat_at = NOW(),
                attempt = attempt + 1
            FROM claimable c
            WHERE t.id = c.id
            RETURNING t.id, t.workflow_id, t.activity_id, t.activity_type,
                      t.input, t.attempt, t.max_attempts
            "#,
        )
        .bind(task_queue)
        .bind(activity_types)
        .bind(max_tasks as i64)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim activity tasks: {}", e);
            BackendError::from(e)
        })?;

        let claimed: Vec<ActivityTask> = rows
            .into_iter()
            .map(|row| ActivityTask {
                id: row.get("id"),
                workflow_id: row.get("workflow_id"),
                activity_id: row.get("activity_id"),
                activity_type: row.get("activity_type"),
                input: row.get("input"),
                attempt: row.get::<i32, _>("attempt") as u32,
                max_attempts: row.get::<i32, _>("max_attempts") as u32,
            })
            .collect();

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "claimed activity tasks");
        }

        Ok(claimed)
    }

    #[instrument(skip(self, details))]
    async fn heartbeat_activity(
        &self,
        task_id: Uuid,
        worker_id: &str,
        details: Option<serde_json::Value>,
    ) -> Result<HeartbeatResponse, BackendError> {
        let row = sqlx::query(
            r#"
            UPDATE maap_activity_tasks
            SET heartbeat_at = NOW(), heartbeat_details = $3
            WHERE id = $1 AND claimed_by = $2 AND status = 'claimed'
            RETURNING cancel_requested
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .bind(&details)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(HeartbeatResponse {
                accepted: true,
                should_cancel: row.get("cancel_requested"),
            }),
            // No longer ours: reclaimed by the backend or already finished
            None => Ok(HeartbeatResponse {
                accepted: false,
                should_cancel: true,
            }),
        }
    }

    #[instrument(skip(self, result))]
    async fn complete_activity_task(
        &self,
        task_id: Uuid,
        result: serde_json::Value,
    ) -> Result<(), BackendError> {
        let updated = sqlx::query(
            r#"
            UPDATE maap_activity_tasks
            SET status = 'completed', result = $2
            WHERE id = $1 AND status = 'claimed'
            "#,
        )
        .bind(task_id)
        .bind(&result)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(BackendError::TaskNotFound(task_id));
        }

        debug!("completed activity task");
        Ok(())
    }

    #[instrument(skip(self, error))]
    async fn fail_activity_task(
        &self,
        task_id: Uuid,
        error: &ActivityError,
    ) -> Result<(), BackendError> {
        let error = serde_json::to_value(error)?;

        let updated = sqlx::query(
            r#"
            UPDATE maap_activity_tasks
            SET status = 'failed', error = $2
            WHERE id = $1 AND status = 'claimed'
            "#,
        )
        .bind(task_id)
        .bind(&error)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(BackendError::TaskNotFound(task_id));
        }

        Ok(())
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.pool.close().await;
        info!("Backend connection pool closed");
        Ok(())
    }
}

/// Opens [`PostgresBackend`] sessions
#[derive(Debug, Clone)]
pub struct PostgresConnector {
    database: String,
    username: Option<String>,
    password: Option<String>,
    connect_timeout: Duration,
    max_connections: u32,
    run_migrations: bool,
}

impl PostgresConnector {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            username: None,
            password: None,
            connect_timeout: Duration::from_secs(10),
            max_connections: 10,
            run_migrations: false,
        }
    }

    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max.max(1);
        self
    }

    /// Apply the bundled migrations after connecting
    pub fn with_migrations(mut self, enabled: bool) -> Self {
        self.run_migrations = enabled;
        self
    }

    fn options(&self, address: &BackendAddress) -> PgConnectOptions {
        let mut options = PgConnectOptions::new()
            .host(address.host())
            .port(address.port())
            .database(&self.database);

        if let Some(username) = &self.username {
            options = options.username(username);
        }
        if let Some(password) = &self.password {
            options = options.password(password);
        }

        options
    }
}

#[async_trait]
impl BackendConnector for PostgresConnector {
    #[instrument(skip(self, address), fields(address = %address))]
    async fn connect(
        &self,
        address: &BackendAddress,
    ) -> Result<Arc<dyn TaskQueueBackend>, BackendError> {
        let connect = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.connect_timeout)
            .connect_with(self.options(address));

        let pool = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| BackendError::ConnectTimeout {
                address: address.to_string(),
                after: self.connect_timeout,
            })?
            .map_err(|e| BackendError::Connection {
                address: address.to_string(),
                message: e.to_string(),
            })?;

        let backend = PostgresBackend::new(pool);
        if self.run_migrations {
            backend.migrate().await?;
        }

        debug!("connected to backend");
        Ok(Arc::new(backend))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_failure_reports_address() {
        // Nothing listens on the discard port
        let address = BackendAddress::new("127.0.0.1", 9).unwrap();
        let connector = PostgresConnector::new("maap").with_connect_timeout(Duration::from_secs(2));

        let err = connector.connect(&address).await.err().unwrap();

        assert!(
            matches!(
                err,
                BackendError::Connection { .. } | BackendError::ConnectTimeout { .. }
            ),
            "unexpected error: {err}"
        );
        assert!(err.to_string().contains("127.0.0.1:9"));
    }

    #[test]
    fn test_connector_builder() {
        let connector = PostgresConnector::new("maap")
            .with_credentials(Some("worker".into()), Some("secret".into()))
            .with_max_connections(0)
            .with_migrations(true);

        assert_eq!(connector.max_connections, 1);
        assert!(connector.run_migrations);
        assert_eq!(connector.username.as_deref(), Some("worker"));
    }
}
