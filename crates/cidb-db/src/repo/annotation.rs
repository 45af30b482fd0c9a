//! Out-of-band data hung off builds: messages and hardware test results,
//! plus the global key/value store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cidb_core::BuildId;
use serde::{Deserialize, Serialize};

use super::{MESSAGE_FIELD_MAX_CHARS, MESSAGE_VALUE_MAX_CHARS, PgCidb, truncate};
use crate::DbResult;
use crate::schema::min;

/// A row of `buildMessageTable` joined with its build.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BuildMessageRecord {
    pub id: i64,
    pub build_id: i64,
    pub build_config: String,
    pub waterfall: String,
    pub builder_name: String,
    pub build_number: i64,
    pub message_type: Option<String>,
    pub message_subtype: Option<String>,
    pub message_value: Option<String>,
    pub board: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBuildMessage {
    pub message_type: Option<String>,
    pub message_subtype: Option<String>,
    pub message_value: Option<String>,
    pub board: Option<String>,
}

impl NewBuildMessage {
    pub fn new(message_type: impl Into<String>, message_subtype: impl Into<String>) -> Self {
        Self {
            message_type: Some(message_type.into()),
            message_subtype: Some(message_subtype.into()),
            ..Default::default()
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.message_value = Some(value.into());
        self
    }

    pub fn with_board(mut self, board: impl Into<String>) -> Self {
        self.board = Some(board.into());
        self
    }

    /// Copy with every field cut to its column limit.
    pub(crate) fn truncated(&self) -> NewBuildMessage {
        let cut = |field: &Option<String>, max| field.as_deref().map(|v| truncate(v, max).to_string());
        NewBuildMessage {
            message_type: cut(&self.message_type, MESSAGE_FIELD_MAX_CHARS),
            message_subtype: cut(&self.message_subtype, MESSAGE_FIELD_MAX_CHARS),
            message_value: cut(&self.message_value, MESSAGE_VALUE_MAX_CHARS),
            board: cut(&self.board, MESSAGE_FIELD_MAX_CHARS),
        }
    }
}

/// One hardware test outcome to record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HwTestResult {
    pub build_id: BuildId,
    pub test_name: String,
    pub status: String,
}

impl HwTestResult {
    pub fn new(build_id: BuildId, test_name: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            build_id,
            test_name: test_name.into(),
            status: status.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct HwTestResultRecord {
    pub id: i64,
    pub build_id: i64,
    pub test_name: String,
    pub status: String,
}

#[async_trait]
pub trait AnnotationRepo: Send + Sync {
    async fn insert_build_message(
        &self,
        build_id: BuildId,
        message: &NewBuildMessage,
    ) -> DbResult<i64>;

    async fn get_build_messages(&self, build_id: BuildId) -> DbResult<Vec<BuildMessageRecord>>;

    /// Messages of every slave of `master_build_id`.
    async fn get_slave_build_messages(
        &self,
        master_build_id: BuildId,
    ) -> DbResult<Vec<BuildMessageRecord>>;

    /// Record any number of results. Returns how many were stored.
    async fn insert_hw_test_results(&self, results: &[HwTestResult]) -> DbResult<u64>;

    async fn get_hw_test_results_for_builds(
        &self,
        build_ids: &[BuildId],
    ) -> DbResult<Vec<HwTestResultRecord>>;

    /// The whole key/value store.
    async fn get_key_vals(&self) -> DbResult<HashMap<String, Option<String>>>;
}

const SELECT_MESSAGES: &str = "SELECT m.id, m.build_id, b.build_config, b.waterfall, \
                               b.builder_name, b.build_number, m.message_type, \
                               m.message_subtype, m.message_value, m.board, m.timestamp \
                               FROM buildMessageTable m JOIN buildTable b ON m.build_id = b.id";

#[async_trait]
impl AnnotationRepo for PgCidb {
    async fn insert_build_message(
        &self,
        build_id: BuildId,
        message: &NewBuildMessage,
    ) -> DbResult<i64> {
        self.conn
            .require_schema("insert_build_message", min::BUILD_MESSAGES)?;
        let pool = self.conn.pool();
        let message = message.truncated();
        let message = &message;
        self.conn
            .run("insert_build_message", || {
                sqlx::query_scalar::<_, i64>(
                    r#"
                    INSERT INTO buildMessageTable (
                        build_id, message_type, message_subtype, message_value, board, timestamp
                    )
                    VALUES ($1, $2, $3, $4, $5, NOW())
                    RETURNING id
                    "#,
                )
                .bind(build_id.get())
                .bind(message.message_type.as_deref())
                .bind(message.message_subtype.as_deref())
                .bind(message.message_value.as_deref())
                .bind(message.board.as_deref())
                .fetch_one(pool)
            })
            .await
    }

    async fn get_build_messages(&self, build_id: BuildId) -> DbResult<Vec<BuildMessageRecord>> {
        self.conn
            .require_schema("get_build_messages", min::BUILD_MESSAGES)?;
        let pool = self.conn.pool();
        let sql = format!("{SELECT_MESSAGES} WHERE m.build_id = $1 ORDER BY m.id");
        self.conn
            .run("get_build_messages", || {
                sqlx::query_as::<_, BuildMessageRecord>(&sql)
                    .bind(build_id.get())
                    .fetch_all(pool)
            })
            .await
    }

    async fn get_slave_build_messages(
        &self,
        master_build_id: BuildId,
    ) -> DbResult<Vec<BuildMessageRecord>> {
        self.conn
            .require_schema("get_slave_build_messages", min::BUILD_MESSAGES)?;
        let pool = self.conn.pool();
        let sql = format!("{SELECT_MESSAGES} WHERE b.master_build_id = $1 ORDER BY m.id");
        self.conn
            .run("get_slave_build_messages", || {
                sqlx::query_as::<_, BuildMessageRecord>(&sql)
                    .bind(master_build_id.get())
                    .fetch_all(pool)
            })
            .await
    }

    async fn insert_hw_test_results(&self, results: &[HwTestResult]) -> DbResult<u64> {
        self.conn
            .require_schema("insert_hw_test_results", min::HW_TEST_RESULTS)?;
        let pool = self.conn.pool();
        let build_ids: Vec<i64> = results.iter().map(|r| r.build_id.get()).collect();
        let names: Vec<&str> = results.iter().map(|r| r.test_name.as_str()).collect();
        let statuses: Vec<&str> = results.iter().map(|r| r.status.as_str()).collect();
        let (build_ids, names, statuses) =
            (build_ids.as_slice(), names.as_slice(), statuses.as_slice());
        let result = self
            .conn
            .run("insert_hw_test_results", || {
                sqlx::query(
                    r#"
                    INSERT INTO hwTestResultTable (build_id, test_name, status)
                    SELECT * FROM UNNEST($1::bigint[], $2::text[], $3::text[])
                    "#,
                )
                .bind(build_ids)
                .bind(names)
                .bind(statuses)
                .execute(pool)
            })
            .await?;
        Ok(result.rows_affected())
    }

    async fn get_hw_test_results_for_builds(
        &self,
        build_ids: &[BuildId],
    ) -> DbResult<Vec<HwTestResultRecord>> {
        self.conn
            .require_schema("get_hw_test_results_for_builds", min::HW_TEST_RESULTS)?;
        if build_ids.is_empty() {
            return Ok(Vec::new());
        }
        let pool = self.conn.pool();
        let ids: Vec<i64> = build_ids.iter().map(|id| id.get()).collect();
        let ids = ids.as_slice();
        self.conn
            .run("get_hw_test_results_for_builds", || {
                sqlx::query_as::<_, HwTestResultRecord>(
                    "SELECT id, build_id, test_name, status FROM hwTestResultTable \
                     WHERE build_id = ANY($1) ORDER BY id",
                )
                .bind(ids)
                .fetch_all(pool)
            })
            .await
    }

    async fn get_key_vals(&self) -> DbResult<HashMap<String, Option<String>>> {
        self.conn.require_schema("get_key_vals", min::KEYVALS)?;
        let pool = self.conn.pool();
        let rows = self
            .conn
            .run("get_key_vals", || {
                sqlx::query_as::<_, (String, Option<String>)>("SELECT k, v FROM keyvalTable")
                    .fetch_all(pool)
            })
            .await?;
        Ok(rows.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_fields_are_truncated() {
        let message = NewBuildMessage::new("t".repeat(300), "sub")
            .with_value("v".repeat(600))
            .with_board("lumpy");
        let cut = message.truncated();

        assert_eq!(cut.message_type.as_deref().map(str::len), Some(240));
        assert_eq!(cut.message_subtype.as_deref(), Some("sub"));
        assert_eq!(cut.message_value.as_deref().map(str::len), Some(480));
        assert_eq!(cut.board.as_deref(), Some("lumpy"));
    }
}
