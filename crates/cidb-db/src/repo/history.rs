//! Master/slave fan-out queries and build history.

use async_trait::async_trait;
use chrono::NaiveDate;
use cidb_core::BuildId;
use serde::{Deserialize, Serialize};
use sqlx::{Postgres, QueryBuilder};

use super::{BuildRecord, BuildStageRecord, PgCidb, StageFailureRecord};
use crate::DbResult;
use crate::schema::min;

/// A slave's stage along with the config of the slave build.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SlaveStageRecord {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub stage: BuildStageRecord,
    pub build_config: String,
}

/// Filters for [`HistoryRepo::get_build_history`]. Results are always newest
/// first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildHistoryQuery {
    pub build_config: String,
    /// Maximum number of builds to return. `None` returns all of them.
    pub limit: Option<i64>,
    pub ignore_build_id: Option<BuildId>,
    /// Builds started on or after this UTC date.
    pub start_date: Option<NaiveDate>,
    /// Builds started on or before this UTC date.
    pub end_date: Option<NaiveDate>,
    pub starting_build_number: Option<i64>,
    pub ending_build_number: Option<i64>,
    pub milestone_version: Option<String>,
    pub platform_version: Option<String>,
    pub starting_build_id: Option<BuildId>,
    pub waterfall: Option<String>,
    pub buildbot_generation: Option<i64>,
    /// Only builds that have finished.
    pub final_only: bool,
}

impl BuildHistoryQuery {
    pub fn new(build_config: impl Into<String>) -> Self {
        Self {
            build_config: build_config.into(),
            ..Default::default()
        }
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn ignore_build(mut self, id: BuildId) -> Self {
        self.ignore_build_id = Some(id);
        self
    }

    pub fn between_dates(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        self.start_date = start;
        self.end_date = end;
        self
    }

    pub fn build_numbers(mut self, starting: Option<i64>, ending: Option<i64>) -> Self {
        self.starting_build_number = starting;
        self.ending_build_number = ending;
        self
    }

    pub fn milestone(mut self, milestone: impl Into<String>) -> Self {
        self.milestone_version = Some(milestone.into());
        self
    }

    pub fn platform_version(mut self, platform_version: impl Into<String>) -> Self {
        self.platform_version = Some(platform_version.into());
        self
    }

    pub fn starting_build_id(mut self, id: BuildId) -> Self {
        self.starting_build_id = Some(id);
        self
    }

    pub fn waterfall(mut self, waterfall: impl Into<String>) -> Self {
        self.waterfall = Some(waterfall.into());
        self
    }

    pub fn buildbot_generation(mut self, generation: i64) -> Self {
        self.buildbot_generation = Some(generation);
        self
    }

    pub fn final_only(mut self) -> Self {
        self.final_only = true;
        self
    }

    /// Whether `build` passes every filter. Ordering and limit are not
    /// considered.
    pub fn matches(&self, build: &BuildRecord) -> bool {
        let start_day = build.start_time.date_naive();
        build.build_config == self.build_config
            && self.start_date.is_none_or(|d| start_day >= d)
            && self.end_date.is_none_or(|d| start_day <= d)
            && self
                .starting_build_number
                .is_none_or(|n| build.build_number >= n)
            && self
                .ending_build_number
                .is_none_or(|n| build.build_number <= n)
            && self.starting_build_id.is_none_or(|id| build.id >= id.get())
            && self.ignore_build_id.is_none_or(|id| build.id != id.get())
            && optional_eq(&self.milestone_version, &build.milestone_version)
            && optional_eq(&self.platform_version, &build.platform_version)
            && self
                .waterfall
                .as_ref()
                .is_none_or(|w| *w == build.waterfall)
            && self
                .buildbot_generation
                .is_none_or(|g| build.buildbot_generation == Some(g))
            && (!self.final_only || build.is_final)
    }

    fn to_sql(&self) -> QueryBuilder<'_, Postgres> {
        let mut qb = QueryBuilder::new(select_builds!("WHERE build_config = "));
        qb.push_bind(self.build_config.as_str());
        if let Some(date) = self.start_date {
            qb.push(" AND (start_time AT TIME ZONE 'UTC')::date >= ")
                .push_bind(date);
        }
        if let Some(date) = self.end_date {
            qb.push(" AND (start_time AT TIME ZONE 'UTC')::date <= ")
                .push_bind(date);
        }
        if let Some(number) = self.starting_build_number {
            qb.push(" AND build_number >= ").push_bind(number);
        }
        if let Some(number) = self.ending_build_number {
            qb.push(" AND build_number <= ").push_bind(number);
        }
        if let Some(id) = self.starting_build_id {
            qb.push(" AND id >= ").push_bind(id.get());
        }
        if let Some(id) = self.ignore_build_id {
            qb.push(" AND id <> ").push_bind(id.get());
        }
        if let Some(milestone) = &self.milestone_version {
            qb.push(" AND milestone_version = ")
                .push_bind(milestone.as_str());
        }
        if let Some(platform) = &self.platform_version {
            qb.push(" AND platform_version = ")
                .push_bind(platform.as_str());
        }
        if let Some(waterfall) = &self.waterfall {
            qb.push(" AND waterfall = ").push_bind(waterfall.as_str());
        }
        if let Some(generation) = self.buildbot_generation {
            qb.push(" AND buildbot_generation = ").push_bind(generation);
        }
        if self.final_only {
            qb.push(" AND final");
        }
        qb.push(" ORDER BY id DESC");
        if let Some(limit) = self.limit {
            qb.push(" LIMIT ").push_bind(limit);
        }
        qb
    }
}

fn optional_eq(filter: &Option<String>, value: &Option<String>) -> bool {
    filter.is_none() || filter == value
}

#[async_trait]
pub trait HistoryRepo: Send + Sync {
    /// Slaves of a master in insertion order. With `buildbucket_ids`, only
    /// those slaves are returned, in the order of the ids given; an empty
    /// list returns nothing.
    async fn get_slave_statuses(
        &self,
        master_build_id: BuildId,
        buildbucket_ids: Option<&[String]>,
    ) -> DbResult<Vec<BuildRecord>>;

    /// Stages of slave builds, filtered like [`HistoryRepo::get_slave_statuses`].
    async fn get_slave_stages(
        &self,
        master_build_id: BuildId,
        buildbucket_ids: Option<&[String]>,
    ) -> DbResult<Vec<SlaveStageRecord>>;

    /// Failures in slave builds, filtered like [`HistoryRepo::get_slave_statuses`].
    async fn get_slave_failures(
        &self,
        master_build_id: BuildId,
        buildbucket_ids: Option<&[String]>,
    ) -> DbResult<Vec<StageFailureRecord>>;

    async fn get_builds_failures(&self, build_ids: &[BuildId])
    -> DbResult<Vec<StageFailureRecord>>;

    /// Most recent builds of a config, newest first. A filter that matches
    /// nothing yields an empty list.
    async fn get_build_history(&self, query: &BuildHistoryQuery) -> DbResult<Vec<BuildRecord>>;

    /// The newest finished build of a config on a waterfall.
    async fn get_most_recent_build(
        &self,
        waterfall: &str,
        build_config: &str,
        milestone_version: Option<&str>,
    ) -> DbResult<Option<BuildRecord>>;
}

const SELECT_SLAVE_STAGES: &str = "SELECT bs.id, bs.build_id, bs.name, bs.board, bs.status, \
                                   bs.last_updated, bs.start_time, bs.finish_time, bs.final, \
                                   b.build_config \
                                   FROM buildStageTable bs JOIN buildTable b ON bs.build_id = b.id \
                                   WHERE b.master_build_id = $1";

const SELECT_FAILURES: &str = "SELECT id, build_stage_id, outer_failure_id, exception_type, \
                               exception_message, exception_category, extra_info, timestamp, \
                               stage_name, board, stage_status, build_id, master_build_id, \
                               builder_name, waterfall, build_number, build_config, build_status, \
                               important, buildbucket_id FROM failureView";

#[async_trait]
impl HistoryRepo for PgCidb {
    async fn get_slave_statuses(
        &self,
        master_build_id: BuildId,
        buildbucket_ids: Option<&[String]>,
    ) -> DbResult<Vec<BuildRecord>> {
        self.conn.require_schema("get_slave_statuses", min::BUILDS)?;
        let pool = self.conn.pool();
        match buildbucket_ids {
            None => {
                self.conn
                    .run("get_slave_statuses", || {
                        sqlx::query_as::<_, BuildRecord>(select_builds!(
                            "WHERE master_build_id = $1 ORDER BY id"
                        ))
                        .bind(master_build_id.get())
                        .fetch_all(pool)
                    })
                    .await
            }
            Some([]) => Ok(Vec::new()),
            Some(ids) => {
                self.conn
                    .run("get_slave_statuses", || {
                        sqlx::query_as::<_, BuildRecord>(select_builds!(
                            "WHERE master_build_id = $1 AND buildbucket_id = ANY($2) \
                             ORDER BY array_position($2::text[], buildbucket_id), id"
                        ))
                        .bind(master_build_id.get())
                        .bind(ids)
                        .fetch_all(pool)
                    })
                    .await
            }
        }
    }

    async fn get_slave_stages(
        &self,
        master_build_id: BuildId,
        buildbucket_ids: Option<&[String]>,
    ) -> DbResult<Vec<SlaveStageRecord>> {
        self.conn.require_schema("get_slave_stages", min::BUILDS)?;
        let pool = self.conn.pool();
        match buildbucket_ids {
            None => {
                let sql = format!("{SELECT_SLAVE_STAGES} ORDER BY bs.id");
                self.conn
                    .run("get_slave_stages", || {
                        sqlx::query_as::<_, SlaveStageRecord>(&sql)
                            .bind(master_build_id.get())
                            .fetch_all(pool)
                    })
                    .await
            }
            Some([]) => Ok(Vec::new()),
            Some(ids) => {
                let sql = format!(
                    "{SELECT_SLAVE_STAGES} AND b.buildbucket_id = ANY($2) \
                     ORDER BY array_position($2::text[], b.buildbucket_id), bs.id"
                );
                self.conn
                    .run("get_slave_stages", || {
                        sqlx::query_as::<_, SlaveStageRecord>(&sql)
                            .bind(master_build_id.get())
                            .bind(ids)
                            .fetch_all(pool)
                    })
                    .await
            }
        }
    }

    async fn get_slave_failures(
        &self,
        master_build_id: BuildId,
        buildbucket_ids: Option<&[String]>,
    ) -> DbResult<Vec<StageFailureRecord>> {
        self.conn
            .require_schema("get_slave_failures", min::FAILURE_VIEW)?;
        let pool = self.conn.pool();
        match buildbucket_ids {
            None => {
                let sql = format!("{SELECT_FAILURES} WHERE master_build_id = $1 ORDER BY id");
                self.conn
                    .run("get_slave_failures", || {
                        sqlx::query_as::<_, StageFailureRecord>(&sql)
                            .bind(master_build_id.get())
                            .fetch_all(pool)
                    })
                    .await
            }
            Some([]) => Ok(Vec::new()),
            Some(ids) => {
                let sql = format!(
                    "{SELECT_FAILURES} WHERE master_build_id = $1 AND buildbucket_id = ANY($2) \
                     ORDER BY array_position($2::text[], buildbucket_id), id"
                );
                self.conn
                    .run("get_slave_failures", || {
                        sqlx::query_as::<_, StageFailureRecord>(&sql)
                            .bind(master_build_id.get())
                            .bind(ids)
                            .fetch_all(pool)
                    })
                    .await
            }
        }
    }

    async fn get_builds_failures(
        &self,
        build_ids: &[BuildId],
    ) -> DbResult<Vec<StageFailureRecord>> {
        self.conn
            .require_schema("get_builds_failures", min::FAILURE_VIEW)?;
        if build_ids.is_empty() {
            return Ok(Vec::new());
        }
        let pool = self.conn.pool();
        let ids: Vec<i64> = build_ids.iter().map(|id| id.get()).collect();
        let ids = ids.as_slice();
        let sql = format!("{SELECT_FAILURES} WHERE build_id = ANY($1) ORDER BY id");
        self.conn
            .run("get_builds_failures", || {
                sqlx::query_as::<_, StageFailureRecord>(&sql)
                    .bind(ids)
                    .fetch_all(pool)
            })
            .await
    }

    async fn get_build_history(&self, query: &BuildHistoryQuery) -> DbResult<Vec<BuildRecord>> {
        self.conn.require_schema("get_build_history", min::BUILDS)?;
        let pool = self.conn.pool();
        self.conn
            .run("get_build_history", || async move {
                let mut qb = query.to_sql();
                qb.build_query_as::<BuildRecord>().fetch_all(pool).await
            })
            .await
    }

    async fn get_most_recent_build(
        &self,
        waterfall: &str,
        build_config: &str,
        milestone_version: Option<&str>,
    ) -> DbResult<Option<BuildRecord>> {
        self.conn
            .require_schema("get_most_recent_build", min::BUILDS)?;
        let pool = self.conn.pool();
        self.conn
            .run("get_most_recent_build", || {
                sqlx::query_as::<_, BuildRecord>(select_builds!(
                    "WHERE waterfall = $1 AND build_config = $2 AND final \
                     AND ($3::text IS NULL OR milestone_version = $3) \
                     ORDER BY id DESC LIMIT 1"
                ))
                .bind(waterfall)
                .bind(build_config)
                .bind(milestone_version)
                .fetch_optional(pool)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use cidb_core::BuildStatus;

    fn build(id: i64, number: i64) -> BuildRecord {
        let start = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        BuildRecord {
            id,
            builder_name: "Lumpy Paladin".into(),
            waterfall: "chromeos".into(),
            build_number: number,
            build_config: "lumpy-paladin".into(),
            bot_hostname: "bot".into(),
            master_build_id: None,
            buildbucket_id: None,
            buildbot_generation: Some(2),
            important: true,
            status: BuildStatus::Passed,
            start_time: start,
            finish_time: Some(start),
            last_updated: start,
            timeout_seconds: None,
            deadline: None,
            summary: None,
            metadata_url: None,
            milestone_version: Some("56".into()),
            platform_version: Some("9000.0.0".into()),
            full_version: None,
            is_final: true,
        }
    }

    #[test]
    fn test_matches_config_and_versions() {
        let b = build(10, 100);
        assert!(BuildHistoryQuery::new("lumpy-paladin").matches(&b));
        assert!(!BuildHistoryQuery::new("link-paladin").matches(&b));
        assert!(BuildHistoryQuery::new("lumpy-paladin").milestone("56").matches(&b));
        assert!(!BuildHistoryQuery::new("lumpy-paladin").milestone("57").matches(&b));
        assert!(
            !BuildHistoryQuery::new("lumpy-paladin")
                .platform_version("1.0.0")
                .matches(&b)
        );
    }

    #[test]
    fn test_matches_ranges() {
        let b = build(10, 100);
        let day = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let next = NaiveDate::from_ymd_opt(2024, 3, 11).unwrap();
        let q = BuildHistoryQuery::new("lumpy-paladin");

        assert!(q.clone().between_dates(Some(day), Some(day)).matches(&b));
        assert!(!q.clone().between_dates(Some(next), None).matches(&b));
        assert!(q.clone().build_numbers(Some(100), Some(100)).matches(&b));
        assert!(!q.clone().build_numbers(Some(101), None).matches(&b));
        assert!(!q.clone().ignore_build(BuildId::new(10)).matches(&b));
        assert!(!q.clone().starting_build_id(BuildId::new(11)).matches(&b));
        assert!(!q.clone().waterfall("chromiumos").matches(&b));
        assert!(!q.clone().buildbot_generation(1).matches(&b));
    }

    #[test]
    fn test_final_only() {
        let mut b = build(10, 100);
        b.is_final = false;
        assert!(BuildHistoryQuery::new("lumpy-paladin").matches(&b));
        assert!(!BuildHistoryQuery::new("lumpy-paladin").final_only().matches(&b));
    }

    #[test]
    fn test_sql_includes_only_set_filters() {
        let query = BuildHistoryQuery::new("lumpy-paladin")
            .milestone("56")
            .final_only()
            .limit(5);
        let sql = query.to_sql().into_sql();
        assert!(sql.contains("build_config = $1"));
        assert!(sql.contains("milestone_version = $2"));
        assert!(sql.contains(" AND final"));
        assert!(sql.ends_with("ORDER BY id DESC LIMIT $3"));
        assert!(!sql.contains("platform_version ="));
    }
}
