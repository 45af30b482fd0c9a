//! CL actions recorded by builds.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cidb_core::{BuildId, ChangeSource, ClAction, ClActionKind, GerritChange};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::PgCidb;
use crate::DbResult;
use crate::schema::min;

/// A row of `clActionTable` together with the config of the build that
/// recorded it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ClActionRecord {
    pub id: i64,
    pub build_id: i64,
    pub build_config: String,
    pub change_number: i64,
    pub patch_number: i64,
    #[sqlx(try_from = "String")]
    pub change_source: ChangeSource,
    #[sqlx(try_from = "String")]
    pub action: ClActionKind,
    pub reason: Option<String>,
    pub buildbucket_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ClActionRecord {
    pub fn change(&self) -> GerritChange {
        GerritChange::new(
            self.change_number,
            self.change_source == ChangeSource::Internal,
        )
    }
}

#[async_trait]
pub trait ClActionRepo: Send + Sync {
    /// Record any number of actions for a build. Returns how many were stored.
    async fn insert_cl_actions(&self, build_id: BuildId, actions: &[ClAction]) -> DbResult<u64>;

    async fn get_actions_for_build(&self, build_id: BuildId) -> DbResult<Vec<ClActionRecord>>;

    /// Every action on any patch of the given changes.
    async fn get_actions_for_changes(
        &self,
        changes: &[GerritChange],
    ) -> DbResult<Vec<ClActionRecord>>;

    async fn get_actions_since(&self, since: DateTime<Utc>) -> DbResult<Vec<ClActionRecord>>;
}

const SELECT_ACTIONS: &str = "SELECT c.id, c.build_id, b.build_config, c.change_number, \
                              c.patch_number, c.change_source, c.action, c.reason, \
                              c.buildbucket_id, c.timestamp \
                              FROM clActionTable c JOIN buildTable b ON c.build_id = b.id";

/// Column-wise view of a batch of actions, bound as arrays and expanded with
/// `UNNEST` so every batch size takes the same statement.
struct ActionColumns<'a> {
    change_numbers: Vec<i64>,
    patch_numbers: Vec<i64>,
    change_sources: Vec<&'static str>,
    actions: Vec<&'static str>,
    reasons: Vec<Option<&'a str>>,
    buildbucket_ids: Vec<Option<&'a str>>,
    timestamps: Vec<Option<DateTime<Utc>>>,
}

impl<'a> ActionColumns<'a> {
    fn new(actions: &'a [ClAction]) -> Self {
        Self {
            change_numbers: actions.iter().map(|a| a.change_number).collect(),
            patch_numbers: actions.iter().map(|a| a.patch_number).collect(),
            change_sources: actions.iter().map(|a| a.change_source.as_str()).collect(),
            actions: actions.iter().map(|a| a.action.as_str()).collect(),
            reasons: actions.iter().map(|a| a.reason.as_deref()).collect(),
            buildbucket_ids: actions.iter().map(|a| a.buildbucket_id.as_deref()).collect(),
            timestamps: actions.iter().map(|a| a.timestamp).collect(),
        }
    }
}

#[async_trait]
impl ClActionRepo for PgCidb {
    async fn insert_cl_actions(&self, build_id: BuildId, actions: &[ClAction]) -> DbResult<u64> {
        self.conn.require_schema("insert_cl_actions", min::CL_ACTIONS)?;
        let pool = self.conn.pool();
        let columns = ActionColumns::new(actions);
        let columns = &columns;
        let result = self
            .conn
            .run("insert_cl_actions", || {
                sqlx::query(
                    r#"
                    INSERT INTO clActionTable (
                        build_id, change_number, patch_number, change_source,
                        action, reason, buildbucket_id, timestamp
                    )
                    SELECT $1::bigint, a.change_number, a.patch_number, a.change_source,
                           a.action, a.reason, a.buildbucket_id, COALESCE(a.timestamp, NOW())
                    FROM UNNEST(
                        $2::bigint[], $3::bigint[], $4::text[], $5::text[],
                        $6::text[], $7::text[], $8::timestamptz[]
                    ) AS a(change_number, patch_number, change_source,
                           action, reason, buildbucket_id, timestamp)
                    "#,
                )
                .bind(build_id.get())
                .bind(columns.change_numbers.as_slice())
                .bind(columns.patch_numbers.as_slice())
                .bind(columns.change_sources.as_slice())
                .bind(columns.actions.as_slice())
                .bind(columns.reasons.as_slice())
                .bind(columns.buildbucket_ids.as_slice())
                .bind(columns.timestamps.as_slice())
                .execute(pool)
            })
            .await?;

        let inserted = result.rows_affected();
        debug!(build_id = %build_id, inserted, "Inserted CL actions");
        Ok(inserted)
    }

    async fn get_actions_for_build(&self, build_id: BuildId) -> DbResult<Vec<ClActionRecord>> {
        self.conn
            .require_schema("get_actions_for_build", min::CL_ACTIONS)?;
        let pool = self.conn.pool();
        let sql = format!("{SELECT_ACTIONS} WHERE c.build_id = $1 ORDER BY c.id");
        self.conn
            .run("get_actions_for_build", || {
                sqlx::query_as::<_, ClActionRecord>(&sql)
                    .bind(build_id.get())
                    .fetch_all(pool)
            })
            .await
    }

    async fn get_actions_for_changes(
        &self,
        changes: &[GerritChange],
    ) -> DbResult<Vec<ClActionRecord>> {
        self.conn
            .require_schema("get_actions_for_changes", min::CL_ACTIONS)?;
        let mut seen = HashSet::new();
        let (numbers, sources): (Vec<i64>, Vec<&'static str>) = changes
            .iter()
            .filter(|change| seen.insert(**change))
            .map(|change| (change.change_number, change.source().as_str()))
            .unzip();
        if numbers.is_empty() {
            return Ok(Vec::new());
        }

        let pool = self.conn.pool();
        let (numbers, sources) = (numbers.as_slice(), sources.as_slice());
        let sql = format!(
            "{SELECT_ACTIONS} \
             JOIN UNNEST($1::bigint[], $2::text[]) AS w(change_number, change_source) \
             ON c.change_number = w.change_number AND c.change_source = w.change_source \
             ORDER BY c.id"
        );
        self.conn
            .run("get_actions_for_changes", || {
                sqlx::query_as::<_, ClActionRecord>(&sql)
                    .bind(numbers)
                    .bind(sources)
                    .fetch_all(pool)
            })
            .await
    }

    async fn get_actions_since(&self, since: DateTime<Utc>) -> DbResult<Vec<ClActionRecord>> {
        self.conn
            .require_schema("get_actions_since", min::CL_ACTIONS)?;
        let pool = self.conn.pool();
        let sql = format!("{SELECT_ACTIONS} WHERE c.timestamp >= $1 ORDER BY c.id");
        self.conn
            .run("get_actions_since", || {
                sqlx::query_as::<_, ClActionRecord>(&sql)
                    .bind(since)
                    .fetch_all(pool)
            })
            .await
    }
}
