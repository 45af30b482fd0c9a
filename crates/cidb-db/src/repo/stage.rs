//! Build stages and the failures recorded against them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cidb_core::{BuildId, BuildStageId, BuildStatus, ExceptionCategory, FailureId, StageStatus};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{FAILURE_MESSAGE_MAX_CHARS, PgCidb, truncate};
use crate::schema::min;
use crate::{DbError, DbResult};

/// A row of `buildStageTable`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BuildStageRecord {
    pub id: i64,
    pub build_id: i64,
    pub name: String,
    pub board: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: StageStatus,
    pub last_updated: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    #[sqlx(rename = "final")]
    #[serde(rename = "final")]
    pub is_final: bool,
}

impl BuildStageRecord {
    pub fn stage_id(&self) -> BuildStageId {
        BuildStageId::new(self.id)
    }
}

/// Input for [`StageRepo::insert_failure`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFailure {
    pub build_stage_id: BuildStageId,
    pub exception_type: String,
    pub exception_message: String,
    pub exception_category: ExceptionCategory,
    /// The failure this one was raised inside of, if any.
    pub outer_failure_id: Option<FailureId>,
    pub extra_info: Option<String>,
}

impl NewFailure {
    pub fn new(
        build_stage_id: BuildStageId,
        exception_type: impl Into<String>,
        exception_message: impl Into<String>,
        exception_category: ExceptionCategory,
    ) -> Self {
        Self {
            build_stage_id,
            exception_type: exception_type.into(),
            exception_message: exception_message.into(),
            exception_category,
            outer_failure_id: None,
            extra_info: None,
        }
    }

    pub fn with_outer_failure(mut self, outer_failure_id: FailureId) -> Self {
        self.outer_failure_id = Some(outer_failure_id);
        self
    }

    pub fn with_extra_info(mut self, extra_info: impl Into<String>) -> Self {
        self.extra_info = Some(extra_info.into());
        self
    }
}

/// A failure joined with its stage and build, as read from `failureView`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StageFailureRecord {
    pub id: i64,
    pub build_stage_id: i64,
    pub outer_failure_id: Option<i64>,
    pub exception_type: String,
    pub exception_message: String,
    #[sqlx(try_from = "String")]
    pub exception_category: ExceptionCategory,
    pub extra_info: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub stage_name: String,
    pub board: Option<String>,
    #[sqlx(try_from = "String")]
    pub stage_status: StageStatus,
    pub build_id: i64,
    pub master_build_id: Option<i64>,
    pub builder_name: String,
    pub waterfall: String,
    pub build_number: i64,
    pub build_config: String,
    #[sqlx(try_from = "String")]
    pub build_status: BuildStatus,
    pub important: bool,
    pub buildbucket_id: Option<String>,
}

#[async_trait]
pub trait StageRepo: Send + Sync {
    /// Insert a stage in `planned` with no start time.
    async fn insert_build_stage(
        &self,
        build_id: BuildId,
        name: &str,
        board: Option<&str>,
    ) -> DbResult<BuildStageId>;

    /// `planned -> waiting`. Returns 0 when the stage was in any other status.
    async fn wait_build_stage(&self, id: BuildStageId) -> DbResult<u64>;

    /// `planned | waiting -> inflight`, setting the start time.
    async fn start_build_stage(&self, id: BuildStageId) -> DbResult<u64>;

    /// Set a terminal status and mark the stage final. A repeated call
    /// overwrites the previous status.
    async fn finish_build_stage(&self, id: BuildStageId, status: StageStatus) -> DbResult<u64>;

    async fn get_build_stage(&self, id: BuildStageId) -> DbResult<Option<BuildStageRecord>>;

    /// Stages of one build in insertion order.
    async fn get_build_stages(&self, build_id: BuildId) -> DbResult<Vec<BuildStageRecord>>;

    async fn get_builds_stages(&self, build_ids: &[BuildId]) -> DbResult<Vec<BuildStageRecord>>;

    async fn insert_failure(&self, failure: &NewFailure) -> DbResult<FailureId>;

    async fn has_failure_msg_for_stage(&self, id: BuildStageId) -> DbResult<bool>;
}

const SELECT_STAGES: &str = "SELECT id, build_id, name, board, status, last_updated, \
                             start_time, finish_time, final FROM buildStageTable";

#[async_trait]
impl StageRepo for PgCidb {
    async fn insert_build_stage(
        &self,
        build_id: BuildId,
        name: &str,
        board: Option<&str>,
    ) -> DbResult<BuildStageId> {
        self.conn
            .require_schema("insert_build_stage", min::BUILD_STAGES)?;
        let pool = self.conn.pool();
        let id = self
            .conn
            .run("insert_build_stage", || {
                sqlx::query_scalar::<_, i64>(
                    r#"
                    INSERT INTO buildStageTable (build_id, name, board, status)
                    VALUES ($1, $2, $3, 'planned')
                    RETURNING id
                    "#,
                )
                .bind(build_id.get())
                .bind(name)
                .bind(board)
                .fetch_one(pool)
            })
            .await?;
        debug!(build_id = %build_id, stage_id = id, name, "Inserted build stage");
        Ok(BuildStageId::new(id))
    }

    async fn wait_build_stage(&self, id: BuildStageId) -> DbResult<u64> {
        self.conn.require_schema("wait_build_stage", min::BUILD_STAGES)?;
        let pool = self.conn.pool();
        let result = self
            .conn
            .run("wait_build_stage", || {
                sqlx::query(
                    "UPDATE buildStageTable SET status = 'waiting' \
                     WHERE id = $1 AND status = 'planned'",
                )
                .bind(id.get())
                .execute(pool)
            })
            .await?;
        Ok(result.rows_affected())
    }

    async fn start_build_stage(&self, id: BuildStageId) -> DbResult<u64> {
        self.conn
            .require_schema("start_build_stage", min::BUILD_STAGES)?;
        let pool = self.conn.pool();
        let result = self
            .conn
            .run("start_build_stage", || {
                sqlx::query(
                    "UPDATE buildStageTable SET status = 'inflight', start_time = NOW() \
                     WHERE id = $1 AND status IN ('planned', 'waiting')",
                )
                .bind(id.get())
                .execute(pool)
            })
            .await?;
        Ok(result.rows_affected())
    }

    async fn finish_build_stage(&self, id: BuildStageId, status: StageStatus) -> DbResult<u64> {
        self.conn
            .require_schema("finish_build_stage", min::BUILD_STAGES)?;
        if !status.is_terminal() {
            return Err(DbError::InvalidTransition(format!(
                "stage {id} cannot finish as {status}"
            )));
        }
        let pool = self.conn.pool();
        let result = self
            .conn
            .run("finish_build_stage", || {
                sqlx::query(
                    "UPDATE buildStageTable SET status = $2, finish_time = NOW(), final = TRUE \
                     WHERE id = $1",
                )
                .bind(id.get())
                .bind(status.as_str())
                .execute(pool)
            })
            .await?;
        debug!(stage_id = %id, %status, "Finished build stage");
        Ok(result.rows_affected())
    }

    async fn get_build_stage(&self, id: BuildStageId) -> DbResult<Option<BuildStageRecord>> {
        self.conn.require_schema("get_build_stage", min::BUILD_STAGES)?;
        let pool = self.conn.pool();
        let sql = format!("{SELECT_STAGES} WHERE id = $1");
        self.conn
            .run("get_build_stage", || {
                sqlx::query_as::<_, BuildStageRecord>(&sql)
                    .bind(id.get())
                    .fetch_optional(pool)
            })
            .await
    }

    async fn get_build_stages(&self, build_id: BuildId) -> DbResult<Vec<BuildStageRecord>> {
        self.get_builds_stages(&[build_id]).await
    }

    async fn get_builds_stages(&self, build_ids: &[BuildId]) -> DbResult<Vec<BuildStageRecord>> {
        self.conn
            .require_schema("get_builds_stages", min::BUILD_STAGES)?;
        if build_ids.is_empty() {
            return Ok(Vec::new());
        }
        let pool = self.conn.pool();
        let ids: Vec<i64> = build_ids.iter().map(|id| id.get()).collect();
        let ids = ids.as_slice();
        let sql = format!("{SELECT_STAGES} WHERE build_id = ANY($1) ORDER BY id");
        self.conn
            .run("get_builds_stages", || {
                sqlx::query_as::<_, BuildStageRecord>(&sql)
                    .bind(ids)
                    .fetch_all(pool)
            })
            .await
    }

    async fn insert_failure(&self, failure: &NewFailure) -> DbResult<FailureId> {
        self.conn.require_schema("insert_failure", min::FAILURES)?;
        let pool = self.conn.pool();
        let message = truncate(&failure.exception_message, FAILURE_MESSAGE_MAX_CHARS);
        let outer = failure.outer_failure_id.map(FailureId::get);
        let id = self
            .conn
            .run("insert_failure", || {
                sqlx::query_scalar::<_, i64>(
                    r#"
                    INSERT INTO failureTable (
                        build_stage_id, outer_failure_id, exception_type,
                        exception_message, exception_category, extra_info, timestamp
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, NOW())
                    RETURNING id
                    "#,
                )
                .bind(failure.build_stage_id.get())
                .bind(outer)
                .bind(&failure.exception_type)
                .bind(message)
                .bind(failure.exception_category.as_str())
                .bind(failure.extra_info.as_deref())
                .fetch_one(pool)
            })
            .await?;
        debug!(
            stage_id = %failure.build_stage_id,
            failure_id = id,
            exception_type = %failure.exception_type,
            "Inserted failure"
        );
        Ok(FailureId::new(id))
    }

    async fn has_failure_msg_for_stage(&self, id: BuildStageId) -> DbResult<bool> {
        self.conn
            .require_schema("has_failure_msg_for_stage", min::FAILURES)?;
        let pool = self.conn.pool();
        self.conn
            .run("has_failure_msg_for_stage", || {
                sqlx::query_scalar::<_, bool>(
                    "SELECT EXISTS (SELECT 1 FROM failureTable WHERE build_stage_id = $1)",
                )
                .bind(id.get())
                .fetch_one(pool)
            })
            .await
    }
}
