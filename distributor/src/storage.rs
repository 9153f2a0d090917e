use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use ethereum_types::U256;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};
use tracing::{info, warn};

use airdrop_common::{
    AirdropError, AirdropResult, DatabaseError, RecordError, Task, TaskId, TaskStatus, UserTaskKey, UserTaskRecord,
    UserTaskStatus,
};

use crate::config::DatabaseConfig;
use crate::leaf::{canonical_address, parse_reward};

/// Read access to reward-bearing tasks
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Tasks currently in the `active` status
    async fn list_active(&self) -> AirdropResult<Vec<Task>>;

    /// Per-participant reward of a task; `RecordNotFound` if the task is unknown
    async fn get_reward_amount(&self, task_id: TaskId) -> AirdropResult<U256>;

    async fn get_task(&self, task_id: TaskId) -> AirdropResult<Option<Task>>;

    async fn upsert_task(&self, task: &Task) -> AirdropResult<()>;
}

/// User participation records keyed by `(address, task_id)`
#[async_trait]
pub trait UserTaskStore: Send + Sync {
    /// Every record referencing one of `task_ids`, whatever its status
    async fn list_by_task_ids(&self, task_ids: &[TaskId]) -> AirdropResult<Vec<UserTaskRecord>>;

    /// Write the `proof` column of each record. Rows are updated independently
    /// and a failed row does not undo the others.
    async fn bulk_update_proof(&self, records: &[UserTaskRecord]) -> AirdropResult<BulkUpdateReport>;

    async fn get_user_task(&self, address: &str, task_id: TaskId) -> AirdropResult<Option<UserTaskRecord>>;

    /// Claim a task for a user. An existing claim is only replaced when it failed.
    async fn claim_task(&self, user_id: &str, address: &str, task_id: TaskId) -> AirdropResult<UserTaskRecord>;

    async fn mark_completed(&self, address: &str, task_id: TaskId) -> AirdropResult<UserTaskRecord>;

    /// Record the redeeming transaction once the claim event is observed
    async fn mark_rewarded(&self, address: &str, task_id: TaskId, tx_hash: &str) -> AirdropResult<UserTaskRecord>;
}

/// Combined store the distributor runs against
pub trait Storage: TaskStore + UserTaskStore {}

impl<T: TaskStore + UserTaskStore> Storage for T {}

/// Outcome of a bulk proof write
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkUpdateReport {
    pub updated: usize,
    pub failed: Vec<UserTaskKey>,
}

impl BulkUpdateReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Open the backend named by `database.backend`
pub async fn connect(config: &DatabaseConfig) -> AirdropResult<Arc<dyn Storage>> {
    match config.backend.as_str() {
        "memory" => {
            info!("Using in-memory storage");
            Ok(Arc::new(MemoryStorage::new()))
        }
        "postgres" => {
            let storage = PostgresStorage::new(&config.url, config.max_connections).await?;
            info!("Connected to PostgreSQL storage");
            Ok(Arc::new(storage))
        }
        other => Err(AirdropError::Config(format!("unknown database backend '{}'", other))),
    }
}

fn not_found(address: &str, task_id: TaskId) -> AirdropError {
    DatabaseError::RecordNotFound(format!("user task {}@{}", address, task_id)).into()
}

/// PostgreSQL storage implementation
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub async fn new(database_url: &str, max_connections: u32) -> AirdropResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    /// Create the two airdrop tables when missing
    async fn initialize_schema(&self) -> AirdropResult<()> {
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS airdrop_task (
                id BIGINT PRIMARY KEY,
                name VARCHAR NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                reward_amount NUMERIC(78, 0) NOT NULL,
                status VARCHAR NOT NULL DEFAULT 'active',
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
        "#)
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryFailed(e.to_string()))?;

        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS airdrop_user_task (
                id BIGSERIAL PRIMARY KEY,
                user_id VARCHAR NOT NULL,
                task_id BIGINT NOT NULL REFERENCES airdrop_task(id),
                address VARCHAR NOT NULL,
                status VARCHAR NOT NULL,
                proof TEXT NOT NULL DEFAULT '',
                claimed_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ,
                rewarded_at TIMESTAMPTZ,
                tx_hash VARCHAR,
                UNIQUE (address, task_id)
            )
        "#)
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryFailed(e.to_string()))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_airdrop_user_task_task_id ON airdrop_user_task(task_id)")
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryFailed(e.to_string()))?;

        Ok(())
    }

    fn row_to_task(row: &PgRow) -> AirdropResult<Task> {
        let id: i64 = row.try_get("id").map_err(query_failed)?;
        let reward: String = row.try_get("reward_amount").map_err(query_failed)?;
        let status: String = row.try_get("status").map_err(query_failed)?;

        Ok(Task {
            id: TaskId(id as u64),
            name: row.try_get("name").map_err(query_failed)?,
            description: row.try_get("description").map_err(query_failed)?,
            reward_amount: parse_reward(&reward)?,
            status: status.parse()?,
            created_at: row.try_get("created_at").map_err(query_failed)?,
            updated_at: row.try_get("updated_at").map_err(query_failed)?,
        })
    }

    fn row_to_user_task(row: &PgRow) -> AirdropResult<UserTaskRecord> {
        let task_id: i64 = row.try_get("task_id").map_err(query_failed)?;
        let status: String = row.try_get("status").map_err(query_failed)?;

        Ok(UserTaskRecord {
            id: row.try_get("id").map_err(query_failed)?,
            user_id: row.try_get("user_id").map_err(query_failed)?,
            task_id: TaskId(task_id as u64),
            address: row.try_get("address").map_err(query_failed)?,
            status: status.parse()?,
            proof: row.try_get("proof").map_err(query_failed)?,
            claimed_at: row.try_get("claimed_at").map_err(query_failed)?,
            completed_at: row.try_get("completed_at").map_err(query_failed)?,
            rewarded_at: row.try_get("rewarded_at").map_err(query_failed)?,
            tx_hash: row.try_get("tx_hash").map_err(query_failed)?,
        })
    }

    /// Explain why a conditional status update matched no row
    async fn rejected_transition<F>(&self, address: &str, task_id: TaskId, transition: F) -> AirdropError
    where
        F: FnOnce(&mut UserTaskRecord) -> Result<(), RecordError> + Send,
    {
        match self.get_user_task(address, task_id).await {
            Ok(Some(mut current)) => match transition(&mut current) {
                Err(e) => e.into(),
                Ok(()) => DatabaseError::QueryFailed(format!(
                    "user task {}@{} changed during update",
                    address, task_id
                ))
                .into(),
            },
            Ok(None) => not_found(address, task_id),
            Err(e) => e,
        }
    }
}

fn query_failed(e: sqlx::Error) -> AirdropError {
    DatabaseError::QueryFailed(e.to_string()).into()
}

const TASK_COLUMNS: &str =
    "id, name, description, reward_amount::TEXT AS reward_amount, status, created_at, updated_at";

const USER_TASK_COLUMNS: &str =
    "id, user_id, task_id, address, status, proof, claimed_at, completed_at, rewarded_at, tx_hash";

#[async_trait]
impl TaskStore for PostgresStorage {
    async fn list_active(&self) -> AirdropResult<Vec<Task>> {
        let rows = sqlx::query(&format!("SELECT {} FROM airdrop_task WHERE status = $1 ORDER BY id", TASK_COLUMNS))
            .bind(TaskStatus::Active.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(query_failed)?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn get_reward_amount(&self, task_id: TaskId) -> AirdropResult<U256> {
        let row = sqlx::query("SELECT reward_amount::TEXT AS reward_amount FROM airdrop_task WHERE id = $1")
            .bind(task_id.0 as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed)?
            .ok_or_else(|| DatabaseError::RecordNotFound(format!("task {}", task_id)))?;

        let reward: String = row.try_get("reward_amount").map_err(query_failed)?;
        Ok(parse_reward(&reward)?)
    }

    async fn get_task(&self, task_id: TaskId) -> AirdropResult<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {} FROM airdrop_task WHERE id = $1", TASK_COLUMNS))
            .bind(task_id.0 as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed)?;

        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn upsert_task(&self, task: &Task) -> AirdropResult<()> {
        sqlx::query(r#"
            INSERT INTO airdrop_task (id, name, description, reward_amount, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4::NUMERIC, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                reward_amount = EXCLUDED.reward_amount,
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at
        "#)
        .bind(task.id.0 as i64)
        .bind(&task.name)
        .bind(&task.description)
        .bind(task.reward_amount.to_string())
        .bind(task.status.as_str())
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await
        .map_err(query_failed)?;

        Ok(())
    }
}

#[async_trait]
impl UserTaskStore for PostgresStorage {
    async fn list_by_task_ids(&self, task_ids: &[TaskId]) -> AirdropResult<Vec<UserTaskRecord>> {
        if task_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<i64> = task_ids.iter().map(|id| id.0 as i64).collect();

        let rows = sqlx::query(&format!(
            "SELECT {} FROM airdrop_user_task WHERE task_id = ANY($1) ORDER BY task_id, id",
            USER_TASK_COLUMNS
        ))
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed)?;

        rows.iter().map(Self::row_to_user_task).collect()
    }

    async fn bulk_update_proof(&self, records: &[UserTaskRecord]) -> AirdropResult<BulkUpdateReport> {
        let mut report = BulkUpdateReport::default();

        for record in records {
            let result = sqlx::query("UPDATE airdrop_user_task SET proof = $1 WHERE address = $2 AND task_id = $3")
                .bind(&record.proof)
                .bind(&record.address)
                .bind(record.task_id.0 as i64)
                .execute(&self.pool)
                .await;

            match result {
                Ok(done) if done.rows_affected() > 0 => report.updated += 1,
                Ok(_) => {
                    warn!(key = %record.key(), "Proof update matched no row");
                    report.failed.push(record.key());
                }
                Err(e) => {
                    warn!(key = %record.key(), error = %e, "Proof update failed");
                    report.failed.push(record.key());
                }
            }
        }

        Ok(report)
    }

    async fn get_user_task(&self, address: &str, task_id: TaskId) -> AirdropResult<Option<UserTaskRecord>> {
        let address = canonical_address(address)?;
        let row = sqlx::query(&format!(
            "SELECT {} FROM airdrop_user_task WHERE address = $1 AND task_id = $2",
            USER_TASK_COLUMNS
        ))
        .bind(&address)
        .bind(task_id.0 as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_failed)?;

        row.as_ref().map(Self::row_to_user_task).transpose()
    }

    async fn claim_task(&self, user_id: &str, address: &str, task_id: TaskId) -> AirdropResult<UserTaskRecord> {
        let address = canonical_address(address)?;
        // a conflicting row is only taken over when it failed; the proof column is left alone
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO airdrop_user_task (user_id, task_id, address, status, claimed_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (address, task_id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                status = EXCLUDED.status,
                claimed_at = EXCLUDED.claimed_at,
                completed_at = NULL
            WHERE airdrop_user_task.status = $6
            RETURNING {}
            "#,
            USER_TASK_COLUMNS
        ))
        .bind(user_id)
        .bind(task_id.0 as i64)
        .bind(&address)
        .bind(UserTaskStatus::Claimed.as_str())
        .bind(Utc::now())
        .bind(UserTaskStatus::Failed.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(query_failed)?;

        match row {
            Some(row) => Self::row_to_user_task(&row),
            None => Err(DatabaseError::DuplicateKey(format!("user task {}@{}", address, task_id)).into()),
        }
    }

    async fn mark_completed(&self, address: &str, task_id: TaskId) -> AirdropResult<UserTaskRecord> {
        let address = canonical_address(address)?;
        let row = sqlx::query(&format!(
            r#"
            UPDATE airdrop_user_task SET status = $1, completed_at = $2
            WHERE address = $3 AND task_id = $4 AND status = $5
            RETURNING {}
            "#,
            USER_TASK_COLUMNS
        ))
        .bind(UserTaskStatus::Completed.as_str())
        .bind(Utc::now())
        .bind(&address)
        .bind(task_id.0 as i64)
        .bind(UserTaskStatus::Claimed.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(query_failed)?;

        match row {
            Some(row) => Self::row_to_user_task(&row),
            None => Err(self.rejected_transition(&address, task_id, |r| r.complete()).await),
        }
    }

    async fn mark_rewarded(&self, address: &str, task_id: TaskId, tx_hash: &str) -> AirdropResult<UserTaskRecord> {
        let address = canonical_address(address)?;
        let row = sqlx::query(&format!(
            r#"
            UPDATE airdrop_user_task SET status = $1, rewarded_at = $2, tx_hash = $3
            WHERE address = $4 AND task_id = $5 AND status = $6 AND proof <> ''
            RETURNING {}
            "#,
            USER_TASK_COLUMNS
        ))
        .bind(UserTaskStatus::Rewarded.as_str())
        .bind(Utc::now())
        .bind(tx_hash)
        .bind(&address)
        .bind(task_id.0 as i64)
        .bind(UserTaskStatus::Completed.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(query_failed)?;

        match row {
            Some(row) => Self::row_to_user_task(&row),
            None => Err(self.rejected_transition(&address, task_id, |r| r.mark_rewarded(tx_hash)).await),
        }
    }
}

/// In-memory storage for tests and local runs
pub struct MemoryStorage {
    tasks: RwLock<HashMap<TaskId, Task>>,
    user_tasks: RwLock<HashMap<UserTaskKey, UserTaskRecord>>,
    next_id: AtomicI64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            user_tasks: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Store a record as is, assigning an id when it has none. The address is
    /// kept verbatim, which lets tests seed rows no claim would accept.
    pub fn insert_user_task(&self, mut record: UserTaskRecord) -> UserTaskRecord {
        if record.id.is_none() {
            record.id = Some(self.next_id.fetch_add(1, Ordering::SeqCst));
        }
        self.user_tasks.write().insert(record.key(), record.clone());
        record
    }

    fn update_user_task<F>(&self, address: &str, task_id: TaskId, update: F) -> AirdropResult<UserTaskRecord>
    where
        F: FnOnce(&mut UserTaskRecord) -> AirdropResult<()>,
    {
        let key = UserTaskKey { address: canonical_address(address)?, task_id };
        let mut user_tasks = self.user_tasks.write();
        let record = user_tasks.get_mut(&key).ok_or_else(|| not_found(&key.address, task_id))?;

        // mutate a copy so a rejected transition leaves the stored row untouched
        let mut updated = record.clone();
        update(&mut updated)?;
        *record = updated.clone();
        Ok(updated)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemoryStorage {
    async fn list_active(&self) -> AirdropResult<Vec<Task>> {
        let tasks = self.tasks.read();
        let mut active: Vec<Task> = tasks.values().filter(|t| t.is_active()).cloned().collect();
        active.sort_by_key(|t| t.id);
        Ok(active)
    }

    async fn get_reward_amount(&self, task_id: TaskId) -> AirdropResult<U256> {
        let tasks = self.tasks.read();
        tasks
            .get(&task_id)
            .map(|t| t.reward_amount)
            .ok_or_else(|| DatabaseError::RecordNotFound(format!("task {}", task_id)).into())
    }

    async fn get_task(&self, task_id: TaskId) -> AirdropResult<Option<Task>> {
        Ok(self.tasks.read().get(&task_id).cloned())
    }

    async fn upsert_task(&self, task: &Task) -> AirdropResult<()> {
        let mut task = task.clone();
        task.updated_at = Utc::now();
        self.tasks.write().insert(task.id, task);
        Ok(())
    }
}

#[async_trait]
impl UserTaskStore for MemoryStorage {
    async fn list_by_task_ids(&self, task_ids: &[TaskId]) -> AirdropResult<Vec<UserTaskRecord>> {
        let user_tasks = self.user_tasks.read();
        let mut records: Vec<UserTaskRecord> = user_tasks
            .values()
            .filter(|r| task_ids.contains(&r.task_id))
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.task_id, r.id));
        Ok(records)
    }

    async fn bulk_update_proof(&self, records: &[UserTaskRecord]) -> AirdropResult<BulkUpdateReport> {
        let mut report = BulkUpdateReport::default();
        let mut user_tasks = self.user_tasks.write();

        for record in records {
            match user_tasks.get_mut(&record.key()) {
                Some(stored) => {
                    stored.proof = record.proof.clone();
                    report.updated += 1;
                }
                None => {
                    warn!(key = %record.key(), "Proof update matched no row");
                    report.failed.push(record.key());
                }
            }
        }

        Ok(report)
    }

    async fn get_user_task(&self, address: &str, task_id: TaskId) -> AirdropResult<Option<UserTaskRecord>> {
        let key = UserTaskKey { address: canonical_address(address)?, task_id };
        Ok(self.user_tasks.read().get(&key).cloned())
    }

    async fn claim_task(&self, user_id: &str, address: &str, task_id: TaskId) -> AirdropResult<UserTaskRecord> {
        let address = canonical_address(address)?;
        let key = UserTaskKey { address: address.clone(), task_id };
        let mut user_tasks = self.user_tasks.write();

        match user_tasks.get_mut(&key) {
            Some(existing) if existing.can_reclaim() => {
                existing.reclaim()?;
                existing.user_id = user_id.to_string();
                Ok(existing.clone())
            }
            Some(_) => Err(DatabaseError::DuplicateKey(format!("user task {}", key)).into()),
            None => {
                let mut record = UserTaskRecord::claim(user_id, address, task_id);
                record.id = Some(self.next_id.fetch_add(1, Ordering::SeqCst));
                user_tasks.insert(key, record.clone());
                Ok(record)
            }
        }
    }

    async fn mark_completed(&self, address: &str, task_id: TaskId) -> AirdropResult<UserTaskRecord> {
        self.update_user_task(address, task_id, |record| Ok(record.complete()?))
    }

    async fn mark_rewarded(&self, address: &str, task_id: TaskId, tx_hash: &str) -> AirdropResult<UserTaskRecord> {
        self.update_user_task(address, task_id, |record| Ok(record.mark_rewarded(tx_hash)?))
    }
}
