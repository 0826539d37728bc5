//! Durable queue backend using SQLite

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use jobq_queue::job::{AttemptRecord, ClaimedJob, Transition};
use jobq_queue::queue::NotificationSettings;
use jobq_queue::{
    Job, JobFilter, JobId, JobResult, NewJob, NewQueue, Page, PageRequest, Queue, QueueBackend,
    QueueError, QueueId, QueueUpdate,
};

use crate::sqlite::{PersistError, SqliteConfig};

const QUEUE_COLUMNS: &str = "seq, queue_id, owner_id, name, description, notification_type, \
     notification_url, notification_game_name, create_at, update_at";
const JOB_COLUMNS: &str =
    "seq, job_id, queue_id, user_id, script_name, args, current_retry, max_retry, create_at";
const RESULT_COLUMNS: &str = "seq, job_id, queue_id, status_code, result, end_of_job, create_at";

fn db_err(e: sqlx::Error) -> QueueError {
    QueueError::Backend(e.to_string())
}

fn parse_uuid(value: &str) -> Result<Uuid, QueueError> {
    Uuid::parse_str(value).map_err(|_| QueueError::Backend(format!("Invalid UUID '{}'", value)))
}

fn from_epoch(secs: i64) -> Result<DateTime<Utc>, QueueError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| QueueError::Backend(format!("Invalid timestamp {}", secs)))
}

fn to_u32(value: i64, column: &str) -> Result<u32, QueueError> {
    u32::try_from(value)
        .map_err(|_| QueueError::Backend(format!("{} out of range: {}", column, value)))
}

fn seq_of(row: &SqliteRow) -> Result<u64, QueueError> {
    let seq: i64 = row.try_get("seq").map_err(db_err)?;
    Ok(seq as u64)
}

fn queue_from_row(row: &SqliteRow) -> Result<(u64, Queue), QueueError> {
    let queue_id: String = row.try_get("queue_id").map_err(db_err)?;
    let notification_type: Option<String> = row.try_get("notification_type").map_err(db_err)?;
    let notification = NotificationSettings {
        notification_type: notification_type.map(|t| t.parse()).transpose()?,
        notification_url: row.try_get("notification_url").map_err(db_err)?,
        notification_game_name: row.try_get("notification_game_name").map_err(db_err)?,
    };

    let queue = Queue {
        queue_id: parse_uuid(&queue_id)?,
        owner_id: row.try_get("owner_id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        description: row.try_get("description").map_err(db_err)?,
        notification,
        create_at: from_epoch(row.try_get("create_at").map_err(db_err)?)?,
        update_at: from_epoch(row.try_get("update_at").map_err(db_err)?)?,
    };
    Ok((seq_of(row)?, queue))
}

fn job_from_row(row: &SqliteRow) -> Result<(u64, Job), QueueError> {
    let job_id: String = row.try_get("job_id").map_err(db_err)?;
    let queue_id: String = row.try_get("queue_id").map_err(db_err)?;

    let job = Job {
        job_id: parse_uuid(&job_id)?,
        queue_id: parse_uuid(&queue_id)?,
        user_id: row.try_get("user_id").map_err(db_err)?,
        script_name: row.try_get("script_name").map_err(db_err)?,
        args: row.try_get("args").map_err(db_err)?,
        current_retry: to_u32(row.try_get("current_retry").map_err(db_err)?, "current_retry")?,
        max_retry: to_u32(row.try_get("max_retry").map_err(db_err)?, "max_retry")?,
        create_at: from_epoch(row.try_get("create_at").map_err(db_err)?)?,
    };
    Ok((seq_of(row)?, job))
}

fn result_from_row(row: &SqliteRow) -> Result<(u64, JobResult), QueueError> {
    let job_id: String = row.try_get("job_id").map_err(db_err)?;
    let queue_id: String = row.try_get("queue_id").map_err(db_err)?;
    let status_code: i64 = row.try_get("status_code").map_err(db_err)?;

    let result = JobResult {
        job_id: parse_uuid(&job_id)?,
        queue_id: parse_uuid(&queue_id)?,
        status_code: i32::try_from(status_code)
            .map_err(|_| QueueError::Backend(format!("status_code out of range: {}", status_code)))?,
        result: row.try_get("result").map_err(db_err)?,
        end_of_job: row.try_get("end_of_job").map_err(db_err)?,
        create_at: from_epoch(row.try_get("create_at").map_err(db_err)?)?,
    };
    Ok((seq_of(row)?, result))
}

/// Lower bound and row count for a page query. One extra row tells
/// `PageRequest::paginate` whether a next page exists.
fn page_bounds(page: &PageRequest) -> (i64, i64) {
    (page.after.unwrap_or(0) as i64, page.limit as i64 + 1)
}

fn filter_clause(filter: &JobFilter) -> (&'static str, Option<&str>) {
    match filter {
        JobFilter::All => ("", None),
        JobFilter::ByUser(user_id) => (" AND user_id = ?", Some(user_id.as_str())),
        JobFilter::ByScript(script_name) => (" AND script_name = ?", Some(script_name.as_str())),
    }
}

async fn queue_exists(conn: &mut SqliteConnection, queue_id: QueueId) -> Result<bool, QueueError> {
    let row = sqlx::query("SELECT 1 FROM queues WHERE queue_id = ?")
        .bind(queue_id.to_string())
        .fetch_optional(conn)
        .await
        .map_err(db_err)?;
    Ok(row.is_some())
}

async fn fetch_owned_queue(
    conn: &mut SqliteConnection,
    owner_id: &str,
    queue_id: QueueId,
) -> Result<Queue, QueueError> {
    let sql = format!(
        "SELECT {} FROM queues WHERE queue_id = ? AND owner_id = ?",
        QUEUE_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(queue_id.to_string())
        .bind(owner_id)
        .fetch_optional(conn)
        .await
        .map_err(db_err)?
        .ok_or_else(|| QueueError::queue_not_found(queue_id))?;
    Ok(queue_from_row(&row)?.1)
}

/// Insert into `jobs` or `dead_jobs`; both share the job columns.
async fn insert_job(conn: &mut SqliteConnection, table: &str, job: &Job) -> Result<(), QueueError> {
    let sql = format!(
        "INSERT INTO {} (job_id, queue_id, user_id, script_name, args, current_retry, max_retry, create_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        table
    );
    sqlx::query(&sql)
        .bind(job.job_id.to_string())
        .bind(job.queue_id.to_string())
        .bind(&job.user_id)
        .bind(&job.script_name)
        .bind(&job.args)
        .bind(i64::from(job.current_retry))
        .bind(i64::from(job.max_retry))
        .bind(job.create_at.timestamp())
        .execute(conn)
        .await
        .map_err(db_err)?;
    Ok(())
}

/// Insert a pending job only while its queue exists. Returns false when
/// the queue is gone.
async fn insert_pending_job(conn: &mut SqliteConnection, job: &Job) -> Result<bool, QueueError> {
    let inserted = sqlx::query(
        "INSERT INTO jobs (job_id, queue_id, user_id, script_name, args, current_retry, max_retry, create_at) \
         SELECT ?, ?, ?, ?, ?, ?, ?, ? WHERE EXISTS (SELECT 1 FROM queues WHERE queue_id = ?)",
    )
    .bind(job.job_id.to_string())
    .bind(job.queue_id.to_string())
    .bind(&job.user_id)
    .bind(&job.script_name)
    .bind(&job.args)
    .bind(i64::from(job.current_retry))
    .bind(i64::from(job.max_retry))
    .bind(job.create_at.timestamp())
    .bind(job.queue_id.to_string())
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(inserted.rows_affected() == 1)
}

/// Durable queue backend using SQLite
///
/// Transactions write before they read. A deferred transaction that reads
/// first cannot be upgraded once another connection commits in WAL mode,
/// and fails with SQLITE_BUSY without waiting on the busy timeout.
///
/// Claims are leases recorded on the job row; settling deletes the row
/// under the lease id and reinserts it when the job is requeued or
/// dead-lettered, all in one transaction.
#[derive(Debug, Clone)]
pub struct SqliteQueueBackend {
    pool: SqlitePool,
}

impl SqliteQueueBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect with `config` and bring the schema up to date
    pub async fn connect(config: &SqliteConfig) -> Result<Self, PersistError> {
        let backend = Self::new(config.connect().await?);
        backend.migrate().await?;
        Ok(backend)
    }

    pub async fn migrate(&self) -> Result<(), PersistError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| PersistError::Migration(e.to_string()))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn ensure_queue(&self, queue_id: QueueId) -> Result<(), QueueError> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        if queue_exists(&mut conn, queue_id).await? {
            Ok(())
        } else {
            Err(QueueError::queue_not_found(queue_id))
        }
    }

    async fn list_job_table(
        &self,
        table: &str,
        queue_id: QueueId,
        filter: JobFilter,
        page: PageRequest,
    ) -> Result<Page<Job>, QueueError> {
        self.ensure_queue(queue_id).await?;

        let (clause, value) = filter_clause(&filter);
        let (after, fetch) = page_bounds(&page);
        let sql = format!(
            "SELECT {} FROM {} WHERE queue_id = ? AND seq > ?{} ORDER BY seq LIMIT ?",
            JOB_COLUMNS, table, clause
        );

        let mut query = sqlx::query(&sql).bind(queue_id.to_string()).bind(after);
        if let Some(value) = value {
            query = query.bind(value);
        }
        let rows = query.bind(fetch).fetch_all(&self.pool).await.map_err(db_err)?;

        let jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(page.paginate(jobs))
    }
}

#[async_trait]
impl QueueBackend for SqliteQueueBackend {
    async fn create_queue(&self, owner_id: &str, new: NewQueue) -> Result<Queue, QueueError> {
        let now = Utc::now().trunc_subsecs(0);
        let queue = Queue {
            queue_id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            name: new.name,
            description: new.description,
            notification: new.notification,
            create_at: now,
            update_at: now,
        };

        let notification = &queue.notification;
        sqlx::query(
            "INSERT INTO queues (queue_id, owner_id, name, description, notification_type, \
             notification_url, notification_game_name, create_at, update_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(queue.queue_id.to_string())
        .bind(&queue.owner_id)
        .bind(&queue.name)
        .bind(queue.description.as_deref())
        .bind(notification.notification_type.map(|t| t.as_str()))
        .bind(notification.notification_url.as_deref())
        .bind(notification.notification_game_name.as_deref())
        .bind(now.timestamp())
        .bind(now.timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                QueueError::DuplicateName(queue.name.clone())
            }
            other => db_err(other),
        })?;

        Ok(queue)
    }

    async fn get_queue(&self, owner_id: &str, queue_id: QueueId) -> Result<Queue, QueueError> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        fetch_owned_queue(&mut conn, owner_id, queue_id).await
    }

    async fn update_queue(
        &self,
        owner_id: &str,
        queue_id: QueueId,
        update: QueueUpdate,
    ) -> Result<Queue, QueueError> {
        let update_at = Utc::now().trunc_subsecs(0);
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let touched =
            sqlx::query("UPDATE queues SET update_at = ? WHERE queue_id = ? AND owner_id = ?")
                .bind(update_at.timestamp())
                .bind(queue_id.to_string())
                .bind(owner_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        if touched.rows_affected() == 0 {
            return Err(QueueError::queue_not_found(queue_id));
        }

        let mut queue = fetch_owned_queue(&mut tx, owner_id, queue_id).await?;
        queue.notification = queue.notification.merge(&update.notification)?;
        if let Some(description) = update.description {
            queue.description = Some(description);
        }

        let notification = &queue.notification;
        sqlx::query(
            "UPDATE queues SET description = ?, notification_type = ?, notification_url = ?, \
             notification_game_name = ? WHERE queue_id = ?",
        )
        .bind(queue.description.as_deref())
        .bind(notification.notification_type.map(|t| t.as_str()))
        .bind(notification.notification_url.as_deref())
        .bind(notification.notification_game_name.as_deref())
        .bind(queue_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(queue)
    }

    async fn delete_queue(&self, owner_id: &str, queue_id: QueueId) -> Result<(), QueueError> {
        let id = queue_id.to_string();
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let deleted = sqlx::query("DELETE FROM queues WHERE queue_id = ? AND owner_id = ?")
            .bind(&id)
            .bind(owner_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        if deleted.rows_affected() == 0 {
            return Err(QueueError::queue_not_found(queue_id));
        }

        let mut dropped = [0u64; 3];
        for (count, table) in dropped.iter_mut().zip(["jobs", "dead_jobs", "job_results"]) {
            let sql = format!("DELETE FROM {} WHERE queue_id = ?", table);
            *count = sqlx::query(&sql)
                .bind(&id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?
                .rows_affected();
        }

        tx.commit().await.map_err(db_err)?;
        debug!(
            queue_id = %queue_id,
            pending = dropped[0],
            dead = dropped[1],
            results = dropped[2],
            "Dropped queue contents"
        );
        Ok(())
    }

    async fn list_queues(
        &self,
        owner_id: &str,
        page: PageRequest,
    ) -> Result<Page<Queue>, QueueError> {
        let (after, fetch) = page_bounds(&page);
        let sql = format!(
            "SELECT {} FROM queues WHERE owner_id = ? AND seq > ? ORDER BY seq LIMIT ?",
            QUEUE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(owner_id)
            .bind(after)
            .bind(fetch)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let queues = rows
            .iter()
            .map(queue_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(page.paginate(queues))
    }

    async fn push_jobs(
        &self,
        queue_id: QueueId,
        user_id: &str,
        jobs: Vec<NewJob>,
    ) -> Result<Vec<Job>, QueueError> {
        if jobs.is_empty() {
            self.ensure_queue(queue_id).await?;
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let now = Utc::now().trunc_subsecs(0);
        let mut pushed = Vec::with_capacity(jobs.len());
        for new in jobs {
            let job = Job {
                job_id: Uuid::new_v4(),
                queue_id,
                user_id: user_id.to_string(),
                script_name: new.script_name,
                args: new.args,
                current_retry: 0,
                max_retry: new.max_retry,
                create_at: now,
            };
            if !insert_pending_job(&mut tx, &job).await? {
                return Err(QueueError::queue_not_found(queue_id));
            }
            pushed.push(job);
        }

        tx.commit().await.map_err(db_err)?;
        Ok(pushed)
    }

    async fn claim_next(
        &self,
        queue_id: QueueId,
        user_id: Option<&str>,
        lease: Duration,
    ) -> Result<Option<ClaimedJob>, QueueError> {
        self.ensure_queue(queue_id).await?;

        let now = Utc::now();
        let lease_len = chrono::Duration::from_std(lease)
            .map_err(|e| QueueError::Backend(format!("lease duration out of range: {}", e)))?;
        let lease_id = Uuid::new_v4();
        let expires_at = now + lease_len;

        let user_clause = if user_id.is_some() {
            " AND user_id = ?"
        } else {
            ""
        };
        let sql = format!(
            r#"
            UPDATE jobs
            SET lease_id = ?, lease_expires_at = ?
            WHERE seq = (
                SELECT seq FROM jobs
                WHERE queue_id = ?
                  AND (lease_id IS NULL OR lease_expires_at <= ?){}
                ORDER BY seq ASC
                LIMIT 1
            )
            RETURNING {}
            "#,
            user_clause, JOB_COLUMNS
        );

        let mut query = sqlx::query(&sql)
            .bind(lease_id.to_string())
            .bind(expires_at.timestamp_millis())
            .bind(queue_id.to_string())
            .bind(now.timestamp_millis());
        if let Some(user_id) = user_id {
            query = query.bind(user_id);
        }
        let row = query.fetch_optional(&self.pool).await.map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let (_, job) = job_from_row(&row)?;
        debug!(job_id = %job.job_id, queue_id = %queue_id, "Job leased");

        Ok(Some(ClaimedJob {
            job,
            lease_id,
            user_scope: user_id.map(str::to_string),
        }))
    }

    async fn settle(
        &self,
        claim: &ClaimedJob,
        transition: Transition,
        record: AttemptRecord,
    ) -> Result<JobResult, QueueError> {
        let job = &claim.job;
        let queue_id = job.queue_id.to_string();
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let released = sqlx::query("DELETE FROM jobs WHERE job_id = ? AND lease_id = ?")
            .bind(job.job_id.to_string())
            .bind(claim.lease_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        if released.rows_affected() == 0 {
            if !queue_exists(&mut tx, job.queue_id).await? {
                return Err(QueueError::queue_not_found(job.queue_id));
            }
            return Err(QueueError::LeaseLost(job.job_id));
        }

        match transition {
            Transition::Complete => {}
            Transition::Requeue { current_retry } => {
                let requeued = Job {
                    current_retry,
                    ..job.clone()
                };
                insert_job(&mut tx, "jobs", &requeued).await?;
            }
            Transition::DeadLetter => {
                insert_job(&mut tx, "dead_jobs", job).await?;
            }
        }

        let remaining = match claim.user_scope.as_deref() {
            Some(user_id) => {
                sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM jobs WHERE queue_id = ? AND user_id = ?",
                )
                .bind(&queue_id)
                .bind(user_id)
                .fetch_one(&mut *tx)
                .await
            }
            None => {
                sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM jobs WHERE queue_id = ?")
                    .bind(&queue_id)
                    .fetch_one(&mut *tx)
                    .await
            }
        }
        .map_err(db_err)?;

        let result = JobResult {
            job_id: job.job_id,
            queue_id: job.queue_id,
            status_code: record.status_code,
            result: record.result,
            end_of_job: remaining == 0,
            create_at: Utc::now().trunc_subsecs(0),
        };

        sqlx::query(
            "INSERT INTO job_results (job_id, queue_id, status_code, result, end_of_job, create_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(result.job_id.to_string())
        .bind(&queue_id)
        .bind(i64::from(result.status_code))
        .bind(&result.result)
        .bind(result.end_of_job)
        .bind(result.create_at.timestamp())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(result)
    }

    async fn list_jobs(
        &self,
        queue_id: QueueId,
        filter: JobFilter,
        page: PageRequest,
    ) -> Result<Page<Job>, QueueError> {
        self.list_job_table("jobs", queue_id, filter, page).await
    }

    async fn list_dead_jobs(
        &self,
        queue_id: QueueId,
        filter: JobFilter,
        page: PageRequest,
    ) -> Result<Page<Job>, QueueError> {
        self.list_job_table("dead_jobs", queue_id, filter, page).await
    }

    async fn delete_dead_job(
        &self,
        queue_id: QueueId,
        job_id: JobId,
        user_id: &str,
    ) -> Result<(), QueueError> {
        self.ensure_queue(queue_id).await?;

        let deleted =
            sqlx::query("DELETE FROM dead_jobs WHERE queue_id = ? AND job_id = ? AND user_id = ?")
                .bind(queue_id.to_string())
                .bind(job_id.to_string())
                .bind(user_id)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;

        if deleted.rows_affected() == 0 {
            return Err(QueueError::job_not_found(job_id));
        }
        Ok(())
    }

    async fn list_results(
        &self,
        queue_id: QueueId,
        job_id: Option<JobId>,
        page: PageRequest,
    ) -> Result<Page<JobResult>, QueueError> {
        self.ensure_queue(queue_id).await?;

        let (after, fetch) = page_bounds(&page);
        let job_clause = if job_id.is_some() {
            " AND job_id = ?"
        } else {
            ""
        };
        let sql = format!(
            "SELECT {} FROM job_results WHERE queue_id = ? AND seq > ?{} ORDER BY seq LIMIT ?",
            RESULT_COLUMNS, job_clause
        );

        let mut query = sqlx::query(&sql).bind(queue_id.to_string()).bind(after);
        if let Some(job_id) = job_id {
            query = query.bind(job_id.to_string());
        }
        let rows = query.bind(fetch).fetch_all(&self.pool).await.map_err(db_err)?;

        let results = rows
            .iter()
            .map(result_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(page.paginate(results))
    }
}
