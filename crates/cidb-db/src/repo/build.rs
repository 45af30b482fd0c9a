//! Build rows: insertion, finishing, status reads and metadata.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cidb_core::{BuildId, BuildStatus};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{PgCidb, SUMMARY_MAX_CHARS, truncate};
use crate::schema::min;
use crate::{DbError, DbResult};

/// A row of `buildTable`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BuildRecord {
    pub id: i64,
    pub builder_name: String,
    pub waterfall: String,
    pub build_number: i64,
    pub build_config: String,
    pub bot_hostname: String,
    pub master_build_id: Option<i64>,
    pub buildbucket_id: Option<String>,
    pub buildbot_generation: Option<i64>,
    pub important: bool,
    #[sqlx(try_from = "String")]
    pub status: BuildStatus,
    pub start_time: DateTime<Utc>,
    pub finish_time: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    pub timeout_seconds: Option<i64>,
    pub deadline: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub metadata_url: Option<String>,
    pub milestone_version: Option<String>,
    pub platform_version: Option<String>,
    pub full_version: Option<String>,
    #[sqlx(rename = "final")]
    #[serde(rename = "final")]
    pub is_final: bool,
}

impl BuildRecord {
    pub fn build_id(&self) -> BuildId {
        BuildId::new(self.id)
    }

    pub fn master_build_id(&self) -> Option<BuildId> {
        self.master_build_id.map(BuildId::new)
    }

    pub fn is_slave(&self) -> bool {
        self.master_build_id.is_some()
    }
}

/// Input for [`BuildRepo::insert_build`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewBuild {
    pub builder_name: String,
    pub waterfall: String,
    pub build_number: i64,
    pub build_config: String,
    pub bot_hostname: String,
    pub master_build_id: Option<BuildId>,
    pub important: bool,
    /// Seconds the build may run before its deadline passes.
    pub timeout_seconds: Option<i64>,
    pub buildbucket_id: Option<String>,
    pub buildbot_generation: Option<i64>,
    /// One of `planned`, `waiting` or `inflight`.
    pub status: BuildStatus,
}

impl NewBuild {
    pub fn new(
        builder_name: impl Into<String>,
        waterfall: impl Into<String>,
        build_number: i64,
        build_config: impl Into<String>,
        bot_hostname: impl Into<String>,
    ) -> Self {
        Self {
            builder_name: builder_name.into(),
            waterfall: waterfall.into(),
            build_number,
            build_config: build_config.into(),
            bot_hostname: bot_hostname.into(),
            ..Default::default()
        }
    }

    pub fn with_master(mut self, master_build_id: BuildId) -> Self {
        self.master_build_id = Some(master_build_id);
        self
    }

    pub fn with_timeout_seconds(mut self, timeout_seconds: i64) -> Self {
        self.timeout_seconds = Some(timeout_seconds);
        self
    }

    pub fn with_buildbucket_id(mut self, buildbucket_id: impl Into<String>) -> Self {
        self.buildbucket_id = Some(buildbucket_id.into());
        self
    }

    pub fn with_status(mut self, status: BuildStatus) -> Self {
        self.status = status;
        self
    }

    pub fn important(mut self, important: bool) -> Self {
        self.important = important;
        self
    }

    pub(crate) fn validate(&self) -> DbResult<()> {
        if !self.status.is_initial() {
            return Err(DbError::InvalidTransition(format!(
                "a build cannot be inserted with status {}",
                self.status
            )));
        }
        Ok(())
    }
}

/// Version metadata reported by a build. `None` fields are left untouched
/// on update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct BuildMetadata {
    pub chrome_version: Option<String>,
    pub milestone_version: Option<String>,
    pub platform_version: Option<String>,
    pub full_version: Option<String>,
    pub sdk_version: Option<String>,
    pub toolchain_url: Option<String>,
    pub build_type: Option<String>,
    pub important: Option<bool>,
}

/// Firmware versions for one board of a build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardMetadata {
    pub main_firmware_version: Option<String>,
    pub ec_firmware_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BoardPerBuildRecord {
    pub build_id: i64,
    pub board: String,
    pub main_firmware_version: Option<String>,
    pub ec_firmware_version: Option<String>,
    pub last_updated: DateTime<Utc>,
}

#[async_trait]
pub trait BuildRepo: Send + Sync {
    /// Current time on the database clock.
    async fn get_time(&self) -> DbResult<DateTime<Utc>>;

    /// Insert a build. Fails with [`DbError::ReferentialIntegrity`] when the
    /// master build does not exist.
    async fn insert_build(&self, build: &NewBuild) -> DbResult<BuildId>;

    /// Mark a build finished. With `strict`, a build that is already final
    /// is left alone. Returns the number of rows changed.
    async fn finish_build(
        &self,
        id: BuildId,
        status: BuildStatus,
        summary: Option<&str>,
        metadata_url: Option<&str>,
        strict: bool,
    ) -> DbResult<u64>;

    async fn get_build_status(&self, id: BuildId) -> DbResult<Option<BuildRecord>>;

    /// Builds with the given ids, in id order. Unknown ids are skipped.
    async fn get_build_statuses(&self, ids: &[BuildId]) -> DbResult<Vec<BuildRecord>>;

    async fn get_build_status_with_buildbucket_id(
        &self,
        buildbucket_id: &str,
    ) -> DbResult<Option<BuildRecord>>;

    async fn update_metadata(&self, id: BuildId, metadata: &BuildMetadata) -> DbResult<u64>;

    async fn get_metadata(&self, id: BuildId) -> DbResult<Option<BuildMetadata>>;

    async fn insert_board_per_build(&self, id: BuildId, board: &str) -> DbResult<()>;

    async fn update_board_per_build_metadata(
        &self,
        id: BuildId,
        board: &str,
        metadata: &BoardMetadata,
    ) -> DbResult<u64>;

    async fn get_boards_per_build(&self, id: BuildId) -> DbResult<Vec<BoardPerBuildRecord>>;
}

#[async_trait]
impl BuildRepo for PgCidb {
    async fn get_time(&self) -> DbResult<DateTime<Utc>> {
        self.conn.get_time().await
    }

    async fn insert_build(&self, build: &NewBuild) -> DbResult<BuildId> {
        self.conn.require_schema("insert_build", min::BUILDS)?;
        build.validate()?;

        let pool = self.conn.pool();
        let master_build_id = build.master_build_id.map(BuildId::get);
        let id = self
            .conn
            .run("insert_build", || {
                sqlx::query_scalar::<_, i64>(
                    r#"
                    INSERT INTO buildTable (
                        builder_name, waterfall, build_number, build_config, bot_hostname,
                        master_build_id, important, buildbucket_id, buildbot_generation,
                        status, timeout_seconds, deadline, start_time
                    )
                    VALUES (
                        $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                        NOW() + ($11::bigint * INTERVAL '1 second'), NOW()
                    )
                    RETURNING id
                    "#,
                )
                .bind(&build.builder_name)
                .bind(&build.waterfall)
                .bind(build.build_number)
                .bind(&build.build_config)
                .bind(&build.bot_hostname)
                .bind(master_build_id)
                .bind(build.important)
                .bind(build.buildbucket_id.as_deref())
                .bind(build.buildbot_generation)
                .bind(build.status.as_str())
                .bind(build.timeout_seconds)
                .fetch_one(pool)
            })
            .await?;

        info!(
            build_id = id,
            build_config = %build.build_config,
            build_number = build.build_number,
            master_build_id,
            "Inserted build"
        );
        Ok(BuildId::new(id))
    }

    async fn finish_build(
        &self,
        id: BuildId,
        status: BuildStatus,
        summary: Option<&str>,
        metadata_url: Option<&str>,
        strict: bool,
    ) -> DbResult<u64> {
        self.conn.require_schema("finish_build", min::BUILDS)?;
        if !status.is_terminal() {
            return Err(DbError::InvalidTransition(format!(
                "build {id} cannot finish as {status}"
            )));
        }

        let pool = self.conn.pool();
        let summary = summary.map(|s| truncate(s, SUMMARY_MAX_CHARS));
        let result = self
            .conn
            .run("finish_build", || {
                sqlx::query(
                    r#"
                    UPDATE buildTable
                    SET status = $2,
                        summary = COALESCE($3, summary),
                        metadata_url = COALESCE($4, metadata_url),
                        finish_time = NOW(),
                        final = TRUE
                    WHERE id = $1 AND (NOT $5 OR NOT final)
                    "#,
                )
                .bind(id.get())
                .bind(status.as_str())
                .bind(summary)
                .bind(metadata_url)
                .bind(strict)
                .execute(pool)
            })
            .await?;

        let updated = result.rows_affected();
        debug!(build_id = %id, %status, strict, updated, "Finished build");
        Ok(updated)
    }

    async fn get_build_status(&self, id: BuildId) -> DbResult<Option<BuildRecord>> {
        self.conn.require_schema("get_build_status", min::BUILDS)?;
        let pool = self.conn.pool();
        self.conn
            .run("get_build_status", || {
                sqlx::query_as::<_, BuildRecord>(select_builds!("WHERE id = $1"))
                    .bind(id.get())
                    .fetch_optional(pool)
            })
            .await
    }

    async fn get_build_statuses(&self, ids: &[BuildId]) -> DbResult<Vec<BuildRecord>> {
        self.conn.require_schema("get_build_statuses", min::BUILDS)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let pool = self.conn.pool();
        let ids: Vec<i64> = ids.iter().map(|id| id.get()).collect();
        let ids = ids.as_slice();
        self.conn
            .run("get_build_statuses", || {
                sqlx::query_as::<_, BuildRecord>(select_builds!(
                    "WHERE id = ANY($1) ORDER BY id"
                ))
                .bind(ids)
                .fetch_all(pool)
            })
            .await
    }

    async fn get_build_status_with_buildbucket_id(
        &self,
        buildbucket_id: &str,
    ) -> DbResult<Option<BuildRecord>> {
        self.conn
            .require_schema("get_build_status_with_buildbucket_id", min::BUILDS)?;
        let pool = self.conn.pool();
        self.conn
            .run("get_build_status_with_buildbucket_id", || {
                sqlx::query_as::<_, BuildRecord>(select_builds!(
                    "WHERE buildbucket_id = $1 ORDER BY id DESC LIMIT 1"
                ))
                .bind(buildbucket_id)
                .fetch_optional(pool)
            })
            .await
    }

    async fn update_metadata(&self, id: BuildId, metadata: &BuildMetadata) -> DbResult<u64> {
        self.conn.require_schema("update_metadata", min::BUILDS)?;
        let pool = self.conn.pool();
        let result = self
            .conn
            .run("update_metadata", || {
                sqlx::query(
                    r#"
                    UPDATE buildTable
                    SET chrome_version = COALESCE($2, chrome_version),
                        milestone_version = COALESCE($3, milestone_version),
                        platform_version = COALESCE($4, platform_version),
                        full_version = COALESCE($5, full_version),
                        sdk_version = COALESCE($6, sdk_version),
                        toolchain_url = COALESCE($7, toolchain_url),
                        build_type = COALESCE($8, build_type),
                        important = COALESCE($9, important)
                    WHERE id = $1
                    "#,
                )
                .bind(id.get())
                .bind(metadata.chrome_version.as_deref())
                .bind(metadata.milestone_version.as_deref())
                .bind(metadata.platform_version.as_deref())
                .bind(metadata.full_version.as_deref())
                .bind(metadata.sdk_version.as_deref())
                .bind(metadata.toolchain_url.as_deref())
                .bind(metadata.build_type.as_deref())
                .bind(metadata.important)
                .execute(pool)
            })
            .await?;
        Ok(result.rows_affected())
    }

    async fn get_metadata(&self, id: BuildId) -> DbResult<Option<BuildMetadata>> {
        self.conn.require_schema("get_metadata", min::BUILDS)?;
        let pool = self.conn.pool();
        self.conn
            .run("get_metadata", || {
                sqlx::query_as::<_, BuildMetadata>(
                    r#"
                    SELECT chrome_version, milestone_version, platform_version, full_version,
                           sdk_version, toolchain_url, build_type, important
                    FROM buildTable WHERE id = $1
                    "#,
                )
                .bind(id.get())
                .fetch_optional(pool)
            })
            .await
    }

    async fn insert_board_per_build(&self, id: BuildId, board: &str) -> DbResult<()> {
        self.conn
            .require_schema("insert_board_per_build", min::BOARD_PER_BUILD)?;
        let pool = self.conn.pool();
        self.conn
            .run("insert_board_per_build", || {
                sqlx::query("INSERT INTO boardPerBuildTable (build_id, board) VALUES ($1, $2)")
                    .bind(id.get())
                    .bind(board)
                    .execute(pool)
            })
            .await?;
        Ok(())
    }

    async fn update_board_per_build_metadata(
        &self,
        id: BuildId,
        board: &str,
        metadata: &BoardMetadata,
    ) -> DbResult<u64> {
        self.conn
            .require_schema("update_board_per_build_metadata", min::BOARD_PER_BUILD)?;
        let pool = self.conn.pool();
        let result = self
            .conn
            .run("update_board_per_build_metadata", || {
                sqlx::query(
                    r#"
                    UPDATE boardPerBuildTable
                    SET main_firmware_version = COALESCE($3, main_firmware_version),
                        ec_firmware_version = COALESCE($4, ec_firmware_version),
                        last_updated = NOW()
                    WHERE build_id = $1 AND board = $2
                    "#,
                )
                .bind(id.get())
                .bind(board)
                .bind(metadata.main_firmware_version.as_deref())
                .bind(metadata.ec_firmware_version.as_deref())
                .execute(pool)
            })
            .await?;
        Ok(result.rows_affected())
    }

    async fn get_boards_per_build(&self, id: BuildId) -> DbResult<Vec<BoardPerBuildRecord>> {
        self.conn
            .require_schema("get_boards_per_build", min::BOARD_PER_BUILD)?;
        let pool = self.conn.pool();
        self.conn
            .run("get_boards_per_build", || {
                sqlx::query_as::<_, BoardPerBuildRecord>(
                    r#"
                    SELECT build_id, board, main_firmware_version, ec_firmware_version, last_updated
                    FROM boardPerBuildTable WHERE build_id = $1 ORDER BY board
                    "#,
                )
                .bind(id.get())
                .fetch_all(pool)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_build_defaults() {
        let build = NewBuild::new("lumpy-paladin", "chromeos", 42, "lumpy-paladin", "bot-1");
        assert_eq!(build.status, BuildStatus::Inflight);
        assert!(build.master_build_id.is_none());
        assert!(!build.important);
        assert!(build.validate().is_ok());
    }

    #[test]
    fn test_new_build_rejects_terminal_status() {
        let build = NewBuild::new("b", "w", 1, "c", "h").with_status(BuildStatus::Passed);
        assert!(matches!(
            build.validate(),
            Err(DbError::InvalidTransition(_))
        ));
    }

    #[test]
    fn test_build_record_serializes_final() {
        let record = BuildRecord {
            id: 7,
            builder_name: "b".into(),
            waterfall: "w".into(),
            build_number: 1,
            build_config: "c".into(),
            bot_hostname: "h".into(),
            master_build_id: Some(3),
            buildbucket_id: None,
            buildbot_generation: None,
            important: true,
            status: BuildStatus::Failed,
            start_time: Utc::now(),
            finish_time: None,
            last_updated: Utc::now(),
            timeout_seconds: None,
            deadline: None,
            summary: None,
            metadata_url: None,
            milestone_version: None,
            platform_version: None,
            full_version: None,
            is_final: true,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["final"], true);
        assert_eq!(json["status"], "fail");
        assert!(record.is_slave());
        assert_eq!(record.master_build_id(), Some(BuildId::new(3)));
    }
}
