//! Task status store
//!
//! SQLite-backed persistence for task records, the append-only task event
//! log, durable task claims, per-cluster override documents, stored
//! clusters and provider credentials.
//!
//! The connection sits behind a `parking_lot::Mutex`; every method is
//! synchronous and never holds the lock across an `.await`.

mod models;
pub mod reducer;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, Transaction};
use tracing::{debug, info};

pub use models::{
    AccessKey, CreateKubernetesTask, CustomClusterRecord, InitPlatformTask, RkeClusterRecord,
    TaskEvent, TaskRecord, TaskStatus, UpdateKubernetesTask,
};

use crate::task::{StepMessage, StepStatus, TaskKind};
use crate::{Error, Result};

/// Reason recorded for events caused by a namespace still being deleted
pub const REASON_NAMESPACE_BEING_TERMINATED: &str = "NamespaceBeingTerminated";

/// Classify a failure message into a machine-readable reason
pub fn reason_from_message(message: &str) -> &'static str {
    if message.contains("namespace wt-system because it is being terminated") {
        REASON_NAMESPACE_BEING_TERMINATED
    } else {
        ""
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS create_kubernetes_tasks (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  task_id TEXT NOT NULL UNIQUE,
  name TEXT NOT NULL,
  resource_type TEXT NOT NULL,
  worker_num INTEGER NOT NULL,
  provider_name TEXT NOT NULL,
  region TEXT NOT NULL,
  status TEXT NOT NULL,
  cluster_id TEXT NOT NULL,
  created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS init_platform_tasks (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  task_id TEXT NOT NULL UNIQUE,
  cluster_id TEXT NOT NULL,
  provider_name TEXT NOT NULL,
  status TEXT NOT NULL,
  created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS update_kubernetes_tasks (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  task_id TEXT NOT NULL UNIQUE,
  cluster_id TEXT NOT NULL,
  version INTEGER NOT NULL,
  provider_name TEXT NOT NULL,
  node_number INTEGER NOT NULL,
  status TEXT NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE(cluster_id, version)
);
CREATE TABLE IF NOT EXISTS task_events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  task_id TEXT NOT NULL,
  step_type TEXT NOT NULL,
  status TEXT NOT NULL,
  message TEXT NOT NULL,
  reason TEXT NOT NULL,
  created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS task_claims (
  task_id TEXT PRIMARY KEY,
  kind TEXT NOT NULL,
  claimed_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS cluster_configs (
  cluster_id TEXT PRIMARY KEY,
  config TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS custom_clusters (
  cluster_id TEXT PRIMARY KEY,
  name TEXT NOT NULL UNIQUE,
  eip TEXT NOT NULL,
  kubeconfig TEXT NOT NULL,
  created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS rke_clusters (
  cluster_id TEXT PRIMARY KEY,
  name TEXT NOT NULL UNIQUE,
  state TEXT NOT NULL,
  kubeconfig TEXT NOT NULL,
  create_config TEXT NOT NULL,
  created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS access_keys (
  provider_name TEXT PRIMARY KEY,
  access_key TEXT NOT NULL,
  secret_key TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_task_events_task ON task_events(task_id, id);
CREATE INDEX IF NOT EXISTS idx_init_tasks_cluster ON init_platform_tasks(provider_name, cluster_id);
"#;

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation)
}

fn create_kubernetes_from_row(row: &Row<'_>) -> rusqlite::Result<CreateKubernetesTask> {
    Ok(CreateKubernetesTask {
        task_id: row.get(0)?,
        name: row.get(1)?,
        worker_resource_type: row.get(2)?,
        worker_num: row.get(3)?,
        provider: row.get(4)?,
        region: row.get(5)?,
        status: TaskStatus::from_db(&row.get::<_, String>(6)?),
        cluster_id: row.get(7)?,
        created_at: parse_time(&row.get::<_, String>(8)?),
    })
}

const CREATE_KUBERNETES_COLUMNS: &str =
    "task_id, name, resource_type, worker_num, provider_name, region, status, cluster_id, created_at";

fn init_from_row(row: &Row<'_>) -> rusqlite::Result<InitPlatformTask> {
    Ok(InitPlatformTask {
        task_id: row.get(0)?,
        cluster_id: row.get(1)?,
        provider: row.get(2)?,
        status: TaskStatus::from_db(&row.get::<_, String>(3)?),
        created_at: parse_time(&row.get::<_, String>(4)?),
    })
}

const INIT_COLUMNS: &str = "task_id, cluster_id, provider_name, status, created_at";

fn update_from_row(row: &Row<'_>) -> rusqlite::Result<UpdateKubernetesTask> {
    Ok(UpdateKubernetesTask {
        task_id: row.get(0)?,
        cluster_id: row.get(1)?,
        version: row.get(2)?,
        provider: row.get(3)?,
        node_number: row.get(4)?,
        status: TaskStatus::from_db(&row.get::<_, String>(5)?),
        created_at: parse_time(&row.get::<_, String>(6)?),
    })
}

const UPDATE_COLUMNS: &str =
    "task_id, cluster_id, version, provider_name, node_number, status, created_at";

struct RawEvent {
    event_id: String,
    task_id: String,
    step_type: String,
    status: String,
    message: String,
    reason: String,
    created_at: String,
}

impl RawEvent {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            event_id: row.get(0)?,
            task_id: row.get(1)?,
            step_type: row.get(2)?,
            status: row.get(3)?,
            message: row.get(4)?,
            reason: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_event(self) -> Result<TaskEvent> {
        Ok(TaskEvent {
            step_type: self.step_type.parse()?,
            status: self.status.parse()?,
            event_id: self.event_id,
            task_id: self.task_id,
            message: self.message,
            reason: self.reason,
            created_at: parse_time(&self.created_at),
        })
    }
}

fn table_for(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::CreateKubernetes => "create_kubernetes_tasks",
        TaskKind::InitPlatform => "init_platform_tasks",
        TaskKind::UpdateKubernetes => "update_kubernetes_tasks",
    }
}

const ALL_KINDS: [TaskKind; 3] = [
    TaskKind::CreateKubernetes,
    TaskKind::InitPlatform,
    TaskKind::UpdateKubernetes,
];

/// Events of a task in insertion order
fn load_events(conn: &Connection, task_id: &str) -> Result<Vec<TaskEvent>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, task_id, step_type, status, message, reason, created_at
         FROM task_events WHERE task_id = ?1 ORDER BY id",
    )?;
    let raw = stmt
        .query_map(params![task_id], RawEvent::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raw.into_iter().map(RawEvent::into_event).collect()
}

/// Apply the reducer to whichever task table holds `task_id`
fn reduce_into_tables<'a>(
    tx: &Transaction<'_>,
    task_id: &str,
    events: &[&'a TaskEvent],
) -> Result<()> {
    for kind in ALL_KINDS {
        let table = table_for(kind);
        let current: Option<String> = tx
            .query_row(
                &format!("SELECT status FROM {} WHERE task_id = ?1", table),
                params![task_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            continue;
        };
        let current = TaskStatus::from_db(&current);
        let next = reducer::reduce(kind, current, events.iter().copied());
        if next != current {
            tx.execute(
                &format!("UPDATE {} SET status = ?1 WHERE task_id = ?2", table),
                params![next.as_str(), task_id],
            )?;
            info!(task_id = %task_id, kind = %kind, status = %next, "task status changed");
        }
    }
    Ok(())
}

/// SQLite-backed task status store
#[derive(Clone)]
pub struct TaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl TaskStore {
    /// Open (or create) the database at `path`
    pub fn open(path: &str) -> Result<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Private in-memory database
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // =========================================================================
    // Create kubernetes tasks
    // =========================================================================

    /// Persist a new cluster provisioning task
    pub fn create_create_kubernetes_task(&self, task: &CreateKubernetesTask) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO create_kubernetes_tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                CREATE_KUBERNETES_COLUMNS
            ),
            params![
                task.task_id,
                task.name,
                task.worker_resource_type,
                task.worker_num,
                task.provider,
                task.region,
                task.status.as_str(),
                task.cluster_id,
                task.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                Error::validation(format!("task {} already exists", task.task_id))
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    /// Get a cluster provisioning task
    pub fn get_create_kubernetes_task(&self, task_id: &str) -> Result<Option<CreateKubernetesTask>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {} FROM create_kubernetes_tasks WHERE task_id = ?1",
                    CREATE_KUBERNETES_COLUMNS
                ),
                params![task_id],
                create_kubernetes_from_row,
            )
            .optional()?)
    }

    /// Latest provisioning task for the provider
    pub fn last_create_kubernetes_task(&self, provider: &str) -> Result<Option<CreateKubernetesTask>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {} FROM create_kubernetes_tasks WHERE provider_name = ?1 ORDER BY id DESC LIMIT 1",
                    CREATE_KUBERNETES_COLUMNS
                ),
                params![provider],
                create_kubernetes_from_row,
            )
            .optional()?)
    }

    /// Latest provisioning task for the cluster
    pub fn last_create_kubernetes_task_for_cluster(
        &self,
        cluster_id: &str,
    ) -> Result<Option<CreateKubernetesTask>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {} FROM create_kubernetes_tasks WHERE cluster_id = ?1 ORDER BY id DESC LIMIT 1",
                    CREATE_KUBERNETES_COLUMNS
                ),
                params![cluster_id],
                create_kubernetes_from_row,
            )
            .optional()?)
    }

    // =========================================================================
    // Init platform tasks
    // =========================================================================

    /// Persist a new platform installation task
    pub fn create_init_task(&self, task: &InitPlatformTask) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO init_platform_tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5)",
                INIT_COLUMNS
            ),
            params![
                task.task_id,
                task.cluster_id,
                task.provider,
                task.status.as_str(),
                task.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                Error::validation(format!("task {} already exists", task.task_id))
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    /// Get a platform installation task
    pub fn get_init_task(&self, task_id: &str) -> Result<Option<InitPlatformTask>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                &format!("SELECT {} FROM init_platform_tasks WHERE task_id = ?1", INIT_COLUMNS),
                params![task_id],
                init_from_row,
            )
            .optional()?)
    }

    /// Latest platform installation task for (provider, cluster)
    pub fn init_task_for_cluster(
        &self,
        cluster_id: &str,
        provider: &str,
    ) -> Result<Option<InitPlatformTask>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {} FROM init_platform_tasks WHERE provider_name = ?1 AND cluster_id = ?2 ORDER BY id DESC LIMIT 1",
                    INIT_COLUMNS
                ),
                params![provider, cluster_id],
                init_from_row,
            )
            .optional()?)
    }

    /// Installation tasks not yet complete
    pub fn running_init_tasks(&self) -> Result<Vec<InitPlatformTask>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM init_platform_tasks WHERE status != 'complete' ORDER BY id",
            INIT_COLUMNS
        ))?;
        let rows = stmt.query_map([], init_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Delete every installation task for (provider, cluster)
    pub fn delete_init_tasks(&self, cluster_id: &str, provider: &str) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute(
            "DELETE FROM init_platform_tasks WHERE provider_name = ?1 AND cluster_id = ?2",
            params![provider, cluster_id],
        )?)
    }

    // =========================================================================
    // Update kubernetes tasks
    // =========================================================================

    /// Persist a new node update task; a repeated (cluster, version) fails
    pub fn create_update_task(&self, task: &UpdateKubernetesTask) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO update_kubernetes_tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                UPDATE_COLUMNS
            ),
            params![
                task.task_id,
                task.cluster_id,
                task.version,
                task.provider,
                task.node_number,
                task.status.as_str(),
                task.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                Error::validation(format!(
                    "duplicate kubernetes update task for cluster {} version {}",
                    task.cluster_id, task.version
                ))
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    /// Get a node update task
    pub fn get_update_task(&self, task_id: &str) -> Result<Option<UpdateKubernetesTask>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                &format!("SELECT {} FROM update_kubernetes_tasks WHERE task_id = ?1", UPDATE_COLUMNS),
                params![task_id],
                update_from_row,
            )
            .optional()?)
    }

    /// Highest-version update task for the cluster
    pub fn last_update_task_for_cluster(
        &self,
        cluster_id: &str,
    ) -> Result<Option<UpdateKubernetesTask>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {} FROM update_kubernetes_tasks WHERE cluster_id = ?1 ORDER BY version DESC LIMIT 1",
                    UPDATE_COLUMNS
                ),
                params![cluster_id],
                update_from_row,
            )
            .optional()?)
    }

    /// Latest update task for the provider
    pub fn last_update_task(&self, provider: &str) -> Result<Option<UpdateKubernetesTask>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {} FROM update_kubernetes_tasks WHERE provider_name = ?1 ORDER BY id DESC LIMIT 1",
                    UPDATE_COLUMNS
                ),
                params![provider],
                update_from_row,
            )
            .optional()?)
    }

    // =========================================================================
    // Any task
    // =========================================================================

    /// Find a task of any kind
    pub fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        if let Some(t) = self.get_create_kubernetes_task(task_id)? {
            return Ok(Some(TaskRecord::CreateKubernetes(t)));
        }
        if let Some(t) = self.get_init_task(task_id)? {
            return Ok(Some(TaskRecord::InitPlatform(t)));
        }
        Ok(self.get_update_task(task_id)?.map(TaskRecord::UpdateKubernetes))
    }

    /// Set the status of a task; missing tasks are ignored
    pub fn set_task_status(&self, kind: TaskKind, task_id: &str, status: TaskStatus) -> Result<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            &format!("UPDATE {} SET status = ?1 WHERE task_id = ?2", table_for(kind)),
            params![status.as_str(), task_id],
        )?;
        debug!(task_id = %task_id, kind = %kind, status = %status, updated, "set task status");
        Ok(())
    }

    /// Durably claim a task for execution; false when already claimed
    pub fn claim_task(&self, task_id: &str, kind: TaskKind) -> Result<bool> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO task_claims (task_id, kind, claimed_at) VALUES (?1, ?2, ?3)",
            params![task_id, kind.as_str(), now()],
        )?;
        Ok(inserted == 1)
    }

    // =========================================================================
    // Task events
    // =========================================================================

    /// Append a progress event and move the owning task's status in one
    /// transaction
    pub fn create_task_event(&self, task_id: &str, message: &StepMessage) -> Result<TaskEvent> {
        let event = TaskEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            step_type: message.step_type,
            status: message.status,
            message: message.message.clone(),
            reason: reason_from_message(&message.message).to_string(),
            created_at: Utc::now(),
        };

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO task_events (event_id, task_id, step_type, status, message, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.event_id,
                event.task_id,
                event.step_type.as_str(),
                event.status.as_str(),
                event.message,
                event.reason,
                event.created_at.to_rfc3339(),
            ],
        )?;
        reduce_into_tables(&tx, task_id, &[&event])?;
        tx.commit()?;

        info!(
            task_id = %task_id,
            step = %event.step_type,
            status = %event.status,
            "saved task event"
        );
        Ok(event)
    }

    /// Events of a task in insertion order; re-applies the reducer
    pub fn list_task_events(&self, task_id: &str) -> Result<Vec<TaskEvent>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let events = load_events(&tx, task_id)?;
        let refs: Vec<&TaskEvent> = events.iter().collect();
        reduce_into_tables(&tx, task_id, &refs)?;
        tx.commit()?;

        Ok(events)
    }

    /// Rewrite the status of the given events and re-derive the status of
    /// every task they belong to
    pub fn update_event_status_in_batch(&self, event_ids: &[String], status: StepStatus) -> Result<()> {
        if event_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut task_ids: Vec<String> = Vec::new();
        for id in event_ids {
            tx.execute(
                "UPDATE task_events SET status = ?1 WHERE event_id = ?2",
                params![status.as_str(), id],
            )?;
            let owner: Option<String> = tx
                .query_row(
                    "SELECT task_id FROM task_events WHERE event_id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(owner) = owner.filter(|o| !task_ids.contains(o)) {
                task_ids.push(owner);
            }
        }
        for task_id in &task_ids {
            let events = load_events(&tx, task_id)?;
            let refs: Vec<&TaskEvent> = events.iter().collect();
            reduce_into_tables(&tx, task_id, &refs)?;
        }
        tx.commit()?;
        debug!(count = event_ids.len(), tasks = task_ids.len(), status = %status, "rewrote event status");
        Ok(())
    }

    // =========================================================================
    // Cluster override documents
    // =========================================================================

    /// Store the override document for a cluster
    pub fn set_cluster_config(&self, cluster_id: &str, config: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO cluster_configs (cluster_id, config, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(cluster_id) DO UPDATE SET config = excluded.config, updated_at = excluded.updated_at",
            params![cluster_id, config, now()],
        )?;
        Ok(())
    }

    /// Override document for a cluster
    pub fn get_cluster_config(&self, cluster_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT config FROM cluster_configs WHERE cluster_id = ?1",
                params![cluster_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    // =========================================================================
    // Custom clusters
    // =========================================================================

    /// Store a customer-supplied cluster; names are unique
    pub fn create_custom_cluster(&self, cluster: &CustomClusterRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO custom_clusters (cluster_id, name, eip, kubeconfig, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                cluster.cluster_id,
                cluster.name,
                cluster.eip.join(","),
                cluster.kubeconfig,
                cluster.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                Error::validation(format!("custom cluster {} already exists", cluster.name))
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    /// Get a customer-supplied cluster by id or name
    pub fn get_custom_cluster(&self, id_or_name: &str) -> Result<Option<CustomClusterRecord>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT cluster_id, name, eip, kubeconfig, created_at FROM custom_clusters
                 WHERE cluster_id = ?1 OR name = ?1",
                params![id_or_name],
                custom_from_row,
            )
            .optional()?)
    }

    /// All customer-supplied clusters, newest first
    pub fn list_custom_clusters(&self) -> Result<Vec<CustomClusterRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT cluster_id, name, eip, kubeconfig, created_at FROM custom_clusters
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], custom_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Delete a customer-supplied cluster by id or name
    pub fn delete_custom_cluster(&self, id_or_name: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM custom_clusters WHERE cluster_id = ?1 OR name = ?1",
            params![id_or_name],
        )?;
        Ok(())
    }

    // =========================================================================
    // Rke clusters
    // =========================================================================

    /// Store a bootstrap-tool cluster; names are unique
    pub fn create_rke_cluster(&self, cluster: &RkeClusterRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO rke_clusters (cluster_id, name, state, kubeconfig, create_config, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                cluster.cluster_id,
                cluster.name,
                cluster.state,
                cluster.kubeconfig,
                cluster.create_config,
                cluster.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                Error::validation(format!("rke cluster {} already exists", cluster.name))
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    /// Overwrite a bootstrap-tool cluster
    pub fn update_rke_cluster(&self, cluster: &RkeClusterRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE rke_clusters SET name = ?2, state = ?3, kubeconfig = ?4, create_config = ?5
             WHERE cluster_id = ?1",
            params![
                cluster.cluster_id,
                cluster.name,
                cluster.state,
                cluster.kubeconfig,
                cluster.create_config,
            ],
        )?;
        Ok(())
    }

    /// Get a bootstrap-tool cluster by id or name
    pub fn get_rke_cluster(&self, id_or_name: &str) -> Result<Option<RkeClusterRecord>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT cluster_id, name, state, kubeconfig, create_config, created_at FROM rke_clusters
                 WHERE cluster_id = ?1 OR name = ?1",
                params![id_or_name],
                rke_from_row,
            )
            .optional()?)
    }

    /// All bootstrap-tool clusters, newest first
    pub fn list_rke_clusters(&self) -> Result<Vec<RkeClusterRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT cluster_id, name, state, kubeconfig, create_config, created_at FROM rke_clusters
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], rke_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Delete a bootstrap-tool cluster by id or name
    pub fn delete_rke_cluster(&self, id_or_name: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM rke_clusters WHERE cluster_id = ?1 OR name = ?1",
            params![id_or_name],
        )?;
        Ok(())
    }

    // =========================================================================
    // Access keys
    // =========================================================================

    /// Store (or replace) the credentials of a provider
    pub fn put_access_key(&self, key: &AccessKey) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO access_keys (provider_name, access_key, secret_key) VALUES (?1, ?2, ?3)
             ON CONFLICT(provider_name) DO UPDATE SET access_key = excluded.access_key,
             secret_key = excluded.secret_key",
            params![key.provider, key.access_key, key.secret_key],
        )?;
        Ok(())
    }

    /// Credentials of a provider
    pub fn get_access_key(&self, provider: &str) -> Result<Option<AccessKey>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT provider_name, access_key, secret_key FROM access_keys WHERE provider_name = ?1",
                params![provider],
                |row| {
                    Ok(AccessKey {
                        provider: row.get(0)?,
                        access_key: row.get(1)?,
                        secret_key: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }
}

fn custom_from_row(row: &Row<'_>) -> rusqlite::Result<CustomClusterRecord> {
    let eip: String = row.get(2)?;
    Ok(CustomClusterRecord {
        cluster_id: row.get(0)?,
        name: row.get(1)?,
        eip: eip
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        kubeconfig: row.get(3)?,
        created_at: parse_time(&row.get::<_, String>(4)?),
    })
}

fn rke_from_row(row: &Row<'_>) -> rusqlite::Result<RkeClusterRecord> {
    Ok(RkeClusterRecord {
        cluster_id: row.get(0)?,
        name: row.get(1)?,
        state: row.get(2)?,
        kubeconfig: row.get(3)?,
        create_config: row.get(4)?,
        created_at: parse_time(&row.get::<_, String>(5)?),
    })
}
