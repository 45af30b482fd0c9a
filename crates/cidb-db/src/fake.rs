//! In-memory implementation of every repository trait.
//!
//! [`FakeCidb`] follows the same contracts as [`PgCidb`](crate::PgCidb) over
//! plain vectors behind a mutex, using the process clock. It lets the
//! scheduler and other callers be tested without a PostgreSQL server.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cidb_core::{BuildId, BuildStageId, BuildStatus, ClAction, FailureId, GerritChange, StageStatus};

use crate::repo::{
    AnnotationRepo, BoardMetadata, BoardPerBuildRecord, BuildHistoryQuery, BuildMessageRecord,
    BuildMetadata, BuildRecord, BuildRepo, BuildStageRecord, ClActionRecord, ClActionRepo,
    DeadlineRepo, FAILURE_MESSAGE_MAX_CHARS, HistoryRepo, HwTestResult, HwTestResultRecord,
    NewBuild, NewBuildMessage, NewFailure, SUMMARY_MAX_CHARS, SlaveStageRecord,
    StageFailureRecord, StageRepo, truncate,
};
use crate::{DbError, DbResult};

#[derive(Debug, Default)]
pub struct FakeCidb {
    tables: Mutex<Tables>,
}

#[derive(Debug, Default)]
struct Tables {
    builds: Vec<FakeBuild>,
    stages: Vec<BuildStageRecord>,
    failures: Vec<(NewFailure, DateTime<Utc>)>,
    cl_actions: Vec<ClActionRecord>,
    boards: Vec<BoardPerBuildRecord>,
    messages: Vec<BuildMessageRecord>,
    hw_tests: Vec<HwTestResultRecord>,
    key_vals: HashMap<String, Option<String>>,
}

#[derive(Debug)]
struct FakeBuild {
    record: BuildRecord,
    /// Metadata columns that [`BuildRecord`] does not carry.
    chrome_version: Option<String>,
    sdk_version: Option<String>,
    toolchain_url: Option<String>,
    build_type: Option<String>,
}

/// Row ids are 1-based positions in their vector.
fn index(id: i64) -> Option<usize> {
    usize::try_from(id).ok()?.checked_sub(1)
}

fn next_id(len: usize) -> i64 {
    len as i64 + 1
}

fn missing(what: &str, id: impl std::fmt::Display) -> DbError {
    DbError::ReferentialIntegrity(format!("{what} {id} does not exist"))
}

impl Tables {
    fn build(&self, id: i64) -> Option<&FakeBuild> {
        index(id).and_then(|i| self.builds.get(i))
    }

    fn build_mut(&mut self, id: i64) -> Option<&mut FakeBuild> {
        index(id).and_then(|i| self.builds.get_mut(i))
    }

    fn has_build(&self, id: BuildId) -> bool {
        self.build(id.get()).is_some()
    }

    fn stage_mut(&mut self, id: BuildStageId) -> Option<&mut BuildStageRecord> {
        index(id.get()).and_then(|i| self.stages.get_mut(i))
    }

    /// The `failureView` row for the failure at position `i`.
    fn failure_view(&self, i: usize) -> Option<StageFailureRecord> {
        let (failure, timestamp) = self.failures.get(i)?;
        let stage = self.stages.get(index(failure.build_stage_id.get())?)?;
        let build = &self.build(stage.build_id)?.record;
        Some(StageFailureRecord {
            id: next_id(i),
            build_stage_id: stage.id,
            outer_failure_id: failure.outer_failure_id.map(FailureId::get),
            exception_type: failure.exception_type.clone(),
            exception_message: failure.exception_message.clone(),
            exception_category: failure.exception_category,
            extra_info: failure.extra_info.clone(),
            timestamp: *timestamp,
            stage_name: stage.name.clone(),
            board: stage.board.clone(),
            stage_status: stage.status,
            build_id: build.id,
            master_build_id: build.master_build_id,
            builder_name: build.builder_name.clone(),
            waterfall: build.waterfall.clone(),
            build_number: build.build_number,
            build_config: build.build_config.clone(),
            build_status: build.status,
            important: build.important,
            buildbucket_id: build.buildbucket_id.clone(),
        })
    }

    fn failures_where(&self, keep: impl Fn(&StageFailureRecord) -> bool) -> Vec<StageFailureRecord> {
        (0..self.failures.len())
            .filter_map(|i| self.failure_view(i))
            .filter(|f| keep(f))
            .collect()
    }

    fn slaves(&self, master: BuildId) -> impl Iterator<Item = &BuildRecord> {
        self.builds
            .iter()
            .map(|b| &b.record)
            .filter(move |b| b.master_build_id == Some(master.get()))
    }
}

fn message_record(
    id: i64,
    build: &BuildRecord,
    message: &NewBuildMessage,
    timestamp: DateTime<Utc>,
) -> BuildMessageRecord {
    BuildMessageRecord {
        id,
        build_id: build.id,
        build_config: build.build_config.clone(),
        waterfall: build.waterfall.clone(),
        builder_name: build.builder_name.clone(),
        build_number: build.build_number,
        message_type: message.message_type.clone(),
        message_subtype: message.message_subtype.clone(),
        message_value: message.message_value.clone(),
        board: message.board.clone(),
        timestamp,
    }
}

/// Position of a build's buildbucket id in the filter list, for ordering.
fn filter_position(ids: &[String], buildbucket_id: Option<&String>) -> Option<usize> {
    let buildbucket_id = buildbucket_id?;
    ids.iter().position(|id| id == buildbucket_id)
}

impl FakeCidb {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write directly to the key/value store.
    pub fn set_key_val(&self, key: impl Into<String>, value: Option<String>) {
        self.tables().key_vals.insert(key.into(), value);
    }

    /// Number of builds inserted so far.
    pub fn build_count(&self) -> usize {
        self.tables().builds.len()
    }

    /// Overwrite a build's deadline, e.g. to put it in the past.
    pub fn set_deadline(&self, id: BuildId, deadline: Option<DateTime<Utc>>) -> DbResult<()> {
        let mut tables = self.tables();
        let build = tables
            .build_mut(id.get())
            .ok_or_else(|| DbError::NotFound(format!("build {id}")))?;
        build.record.deadline = deadline;
        Ok(())
    }
}

#[async_trait]
impl BuildRepo for FakeCidb {
    async fn get_time(&self) -> DbResult<DateTime<Utc>> {
        Ok(Utc::now())
    }

    async fn insert_build(&self, build: &NewBuild) -> DbResult<BuildId> {
        build.validate()?;
        let mut tables = self.tables();
        if let Some(master) = build.master_build_id {
            if !tables.has_build(master) {
                return Err(missing("master build", master));
            }
        }

        let now = Utc::now();
        let id = next_id(tables.builds.len());
        let record = BuildRecord {
            id,
            builder_name: build.builder_name.clone(),
            waterfall: build.waterfall.clone(),
            build_number: build.build_number,
            build_config: build.build_config.clone(),
            bot_hostname: build.bot_hostname.clone(),
            master_build_id: build.master_build_id.map(BuildId::get),
            buildbucket_id: build.buildbucket_id.clone(),
            buildbot_generation: build.buildbot_generation,
            important: build.important,
            status: build.status,
            start_time: now,
            finish_time: None,
            last_updated: now,
            timeout_seconds: build.timeout_seconds,
            deadline: build
                .timeout_seconds
                .map(|secs| now + chrono::Duration::seconds(secs)),
            summary: None,
            metadata_url: None,
            milestone_version: None,
            platform_version: None,
            full_version: None,
            is_final: false,
        };
        tables.builds.push(FakeBuild {
            record,
            chrome_version: None,
            sdk_version: None,
            toolchain_url: None,
            build_type: None,
        });
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
        if !status.is_terminal() {
            return Err(DbError::InvalidTransition(format!(
                "build {id} cannot finish as {status}"
            )));
        }
        let mut tables = self.tables();
        let Some(build) = tables.build_mut(id.get()) else {
            return Ok(0);
        };
        let record = &mut build.record;
        if strict && record.is_final {
            return Ok(0);
        }

        let now = Utc::now();
        record.status = status;
        if let Some(summary) = summary {
            record.summary = Some(truncate(summary, SUMMARY_MAX_CHARS).to_string());
        }
        if let Some(url) = metadata_url {
            record.metadata_url = Some(url.to_string());
        }
        record.finish_time = Some(now);
        record.last_updated = now;
        record.is_final = true;
        Ok(1)
    }

    async fn get_build_status(&self, id: BuildId) -> DbResult<Option<BuildRecord>> {
        Ok(self.tables().build(id.get()).map(|b| b.record.clone()))
    }

    async fn get_build_statuses(&self, ids: &[BuildId]) -> DbResult<Vec<BuildRecord>> {
        let wanted: HashSet<i64> = ids.iter().map(|id| id.get()).collect();
        Ok(self
            .tables()
            .builds
            .iter()
            .filter(|b| wanted.contains(&b.record.id))
            .map(|b| b.record.clone())
            .collect())
    }

    async fn get_build_status_with_buildbucket_id(
        &self,
        buildbucket_id: &str,
    ) -> DbResult<Option<BuildRecord>> {
        Ok(self
            .tables()
            .builds
            .iter()
            .rev()
            .find(|b| b.record.buildbucket_id.as_deref() == Some(buildbucket_id))
            .map(|b| b.record.clone()))
    }

    async fn update_metadata(&self, id: BuildId, metadata: &BuildMetadata) -> DbResult<u64> {
        fn set(slot: &mut Option<String>, value: &Option<String>) {
            if value.is_some() {
                slot.clone_from(value);
            }
        }

        let mut tables = self.tables();
        let Some(build) = tables.build_mut(id.get()) else {
            return Ok(0);
        };
        set(&mut build.chrome_version, &metadata.chrome_version);
        set(&mut build.sdk_version, &metadata.sdk_version);
        set(&mut build.toolchain_url, &metadata.toolchain_url);
        set(&mut build.build_type, &metadata.build_type);
        let record = &mut build.record;
        set(&mut record.milestone_version, &metadata.milestone_version);
        set(&mut record.platform_version, &metadata.platform_version);
        set(&mut record.full_version, &metadata.full_version);
        if let Some(important) = metadata.important {
            record.important = important;
        }
        record.last_updated = Utc::now();
        Ok(1)
    }

    async fn get_metadata(&self, id: BuildId) -> DbResult<Option<BuildMetadata>> {
        Ok(self.tables().build(id.get()).map(|b| BuildMetadata {
            chrome_version: b.chrome_version.clone(),
            milestone_version: b.record.milestone_version.clone(),
            platform_version: b.record.platform_version.clone(),
            full_version: b.record.full_version.clone(),
            sdk_version: b.sdk_version.clone(),
            toolchain_url: b.toolchain_url.clone(),
            build_type: b.build_type.clone(),
            important: Some(b.record.important),
        }))
    }

    async fn insert_board_per_build(&self, id: BuildId, board: &str) -> DbResult<()> {
        let mut tables = self.tables();
        if !tables.has_build(id) {
            return Err(missing("build", id));
        }
        tables.boards.push(BoardPerBuildRecord {
            build_id: id.get(),
            board: board.to_string(),
            main_firmware_version: None,
            ec_firmware_version: None,
            last_updated: Utc::now(),
        });
        Ok(())
    }

    async fn update_board_per_build_metadata(
        &self,
        id: BuildId,
        board: &str,
        metadata: &BoardMetadata,
    ) -> DbResult<u64> {
        let mut tables = self.tables();
        let mut updated = 0;
        for row in tables
            .boards
            .iter_mut()
            .filter(|r| r.build_id == id.get() && r.board == board)
        {
            if metadata.main_firmware_version.is_some() {
                row.main_firmware_version.clone_from(&metadata.main_firmware_version);
            }
            if metadata.ec_firmware_version.is_some() {
                row.ec_firmware_version.clone_from(&metadata.ec_firmware_version);
            }
            row.last_updated = Utc::now();
            updated += 1;
        }
        Ok(updated)
    }

    async fn get_boards_per_build(&self, id: BuildId) -> DbResult<Vec<BoardPerBuildRecord>> {
        let mut boards: Vec<_> = self
            .tables()
            .boards
            .iter()
            .filter(|r| r.build_id == id.get())
            .cloned()
            .collect();
        boards.sort_by(|a, b| a.board.cmp(&b.board));
        Ok(boards)
    }
}

#[async_trait]
impl DeadlineRepo for FakeCidb {
    async fn get_time_to_deadline(&self, id: BuildId) -> DbResult<Option<Duration>> {
        let tables = self.tables();
        let deadline = tables.build(id.get()).and_then(|b| b.record.deadline);
        Ok(deadline.map(|deadline| (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO)))
    }

    async fn extend_deadline(&self, id: BuildId, extra: Duration) -> DbResult<u64> {
        let mut tables = self.tables();
        let Some(build) = tables.build_mut(id.get()) else {
            return Ok(0);
        };
        let now = Utc::now();
        let extra = chrono::Duration::from_std(extra)
            .map_err(|e| DbError::InvalidTransition(format!("deadline extension {e}")))?;
        let proposed = now + extra;
        let extendable = match build.record.deadline {
            None => true,
            Some(current) => current > now && proposed > current,
        };
        if !extendable {
            return Ok(0);
        }
        build.record.deadline = Some(proposed);
        build.record.last_updated = now;
        Ok(1)
    }
}

#[async_trait]
impl StageRepo for FakeCidb {
    async fn insert_build_stage(
        &self,
        build_id: BuildId,
        name: &str,
        board: Option<&str>,
    ) -> DbResult<BuildStageId> {
        let mut tables = self.tables();
        if !tables.has_build(build_id) {
            return Err(missing("build", build_id));
        }
        let id = next_id(tables.stages.len());
        tables.stages.push(BuildStageRecord {
            id,
            build_id: build_id.get(),
            name: name.to_string(),
            board: board.map(str::to_string),
            status: StageStatus::Planned,
            last_updated: Utc::now(),
            start_time: None,
            finish_time: None,
            is_final: false,
        });
        Ok(BuildStageId::new(id))
    }

    async fn wait_build_stage(&self, id: BuildStageId) -> DbResult<u64> {
        let mut tables = self.tables();
        match tables.stage_mut(id) {
            Some(stage) if stage.status == StageStatus::Planned => {
                stage.status = StageStatus::Waiting;
                stage.last_updated = Utc::now();
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn start_build_stage(&self, id: BuildStageId) -> DbResult<u64> {
        let mut tables = self.tables();
        match tables.stage_mut(id) {
            Some(stage) if stage.status.can_start() => {
                let now = Utc::now();
                stage.status = StageStatus::Inflight;
                stage.start_time = Some(now);
                stage.last_updated = now;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn finish_build_stage(&self, id: BuildStageId, status: StageStatus) -> DbResult<u64> {
        if !status.is_terminal() {
            return Err(DbError::InvalidTransition(format!(
                "stage {id} cannot finish as {status}"
            )));
        }
        let mut tables = self.tables();
        let Some(stage) = tables.stage_mut(id) else {
            return Ok(0);
        };
        let now = Utc::now();
        stage.status = status;
        stage.finish_time = Some(now);
        stage.last_updated = now;
        stage.is_final = true;
        Ok(1)
    }

    async fn get_build_stage(&self, id: BuildStageId) -> DbResult<Option<BuildStageRecord>> {
        let tables = self.tables();
        Ok(index(id.get()).and_then(|i| tables.stages.get(i)).cloned())
    }

    async fn get_build_stages(&self, build_id: BuildId) -> DbResult<Vec<BuildStageRecord>> {
        self.get_builds_stages(&[build_id]).await
    }

    async fn get_builds_stages(&self, build_ids: &[BuildId]) -> DbResult<Vec<BuildStageRecord>> {
        let wanted: HashSet<i64> = build_ids.iter().map(|id| id.get()).collect();
        Ok(self
            .tables()
            .stages
            .iter()
            .filter(|s| wanted.contains(&s.build_id))
            .cloned()
            .collect())
    }

    async fn insert_failure(&self, failure: &NewFailure) -> DbResult<FailureId> {
        let mut tables = self.tables();
        if index(failure.build_stage_id.get())
            .and_then(|i| tables.stages.get(i))
            .is_none()
        {
            return Err(missing("build stage", failure.build_stage_id));
        }
        if let Some(outer) = failure.outer_failure_id {
            if index(outer.get()).is_none_or(|i| i >= tables.failures.len()) {
                return Err(missing("failure", outer));
            }
        }

        let mut stored = failure.clone();
        stored.exception_message =
            truncate(&failure.exception_message, FAILURE_MESSAGE_MAX_CHARS).to_string();
        tables.failures.push((stored, Utc::now()));
        Ok(FailureId::new(next_id(tables.failures.len() - 1)))
    }

    async fn has_failure_msg_for_stage(&self, id: BuildStageId) -> DbResult<bool> {
        Ok(self
            .tables()
            .failures
            .iter()
            .any(|(f, _)| f.build_stage_id == id))
    }
}

#[async_trait]
impl ClActionRepo for FakeCidb {
    async fn insert_cl_actions(&self, build_id: BuildId, actions: &[ClAction]) -> DbResult<u64> {
        let mut tables = self.tables();
        if actions.is_empty() {
            return Ok(0);
        }
        let build_config = tables
            .build(build_id.get())
            .map(|b| b.record.build_config.clone())
            .ok_or_else(|| missing("build", build_id))?;

        let now = Utc::now();
        for action in actions {
            let id = next_id(tables.cl_actions.len());
            tables.cl_actions.push(ClActionRecord {
                id,
                build_id: build_id.get(),
                build_config: build_config.clone(),
                change_number: action.change_number,
                patch_number: action.patch_number,
                change_source: action.change_source,
                action: action.action,
                reason: action.reason.clone(),
                buildbucket_id: action.buildbucket_id.clone(),
                timestamp: action.timestamp.unwrap_or(now),
            });
        }
        Ok(actions.len() as u64)
    }

    async fn get_actions_for_build(&self, build_id: BuildId) -> DbResult<Vec<ClActionRecord>> {
        Ok(self
            .tables()
            .cl_actions
            .iter()
            .filter(|a| a.build_id == build_id.get())
            .cloned()
            .collect())
    }

    async fn get_actions_for_changes(
        &self,
        changes: &[GerritChange],
    ) -> DbResult<Vec<ClActionRecord>> {
        let wanted: HashSet<GerritChange> = changes.iter().copied().collect();
        Ok(self
            .tables()
            .cl_actions
            .iter()
            .filter(|a| wanted.contains(&a.change()))
            .cloned()
            .collect())
    }

    async fn get_actions_since(&self, since: DateTime<Utc>) -> DbResult<Vec<ClActionRecord>> {
        Ok(self
            .tables()
            .cl_actions
            .iter()
            .filter(|a| a.timestamp >= since)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AnnotationRepo for FakeCidb {
    async fn insert_build_message(
        &self,
        build_id: BuildId,
        message: &NewBuildMessage,
    ) -> DbResult<i64> {
        let mut tables = self.tables();
        let build = tables
            .build(build_id.get())
            .ok_or_else(|| missing("build", build_id))?;
        let id = next_id(tables.messages.len());
        let record = message_record(id, &build.record, &message.truncated(), Utc::now());
        tables.messages.push(record);
        Ok(id)
    }

    async fn get_build_messages(&self, build_id: BuildId) -> DbResult<Vec<BuildMessageRecord>> {
        Ok(self
            .tables()
            .messages
            .iter()
            .filter(|m| m.build_id == build_id.get())
            .cloned()
            .collect())
    }

    async fn get_slave_build_messages(
        &self,
        master_build_id: BuildId,
    ) -> DbResult<Vec<BuildMessageRecord>> {
        let tables = self.tables();
        let slaves: HashSet<i64> = tables.slaves(master_build_id).map(|b| b.id).collect();
        Ok(tables
            .messages
            .iter()
            .filter(|m| slaves.contains(&m.build_id))
            .cloned()
            .collect())
    }

    async fn insert_hw_test_results(&self, results: &[HwTestResult]) -> DbResult<u64> {
        let mut tables = self.tables();
        if let Some(result) = results.iter().find(|r| !tables.has_build(r.build_id)) {
            return Err(missing("build", result.build_id));
        }
        for result in results {
            let id = next_id(tables.hw_tests.len());
            tables.hw_tests.push(HwTestResultRecord {
                id,
                build_id: result.build_id.get(),
                test_name: result.test_name.clone(),
                status: result.status.clone(),
            });
        }
        Ok(results.len() as u64)
    }

    async fn get_hw_test_results_for_builds(
        &self,
        build_ids: &[BuildId],
    ) -> DbResult<Vec<HwTestResultRecord>> {
        let wanted: HashSet<i64> = build_ids.iter().map(|id| id.get()).collect();
        Ok(self
            .tables()
            .hw_tests
            .iter()
            .filter(|r| wanted.contains(&r.build_id))
            .cloned()
            .collect())
    }

    async fn get_key_vals(&self) -> DbResult<HashMap<String, Option<String>>> {
        Ok(self.tables().key_vals.clone())
    }
}

#[async_trait]
impl HistoryRepo for FakeCidb {
    async fn get_slave_statuses(
        &self,
        master_build_id: BuildId,
        buildbucket_ids: Option<&[String]>,
    ) -> DbResult<Vec<BuildRecord>> {
        let tables = self.tables();
        let slaves = tables.slaves(master_build_id);
        let Some(ids) = buildbucket_ids else {
            return Ok(slaves.cloned().collect());
        };
        let mut matched: Vec<(usize, BuildRecord)> = slaves
            .filter_map(|b| filter_position(ids, b.buildbucket_id.as_ref()).map(|p| (p, b.clone())))
            .collect();
        matched.sort_by_key(|(position, b)| (*position, b.id));
        Ok(matched.into_iter().map(|(_, b)| b).collect())
    }

    async fn get_slave_stages(
        &self,
        master_build_id: BuildId,
        buildbucket_ids: Option<&[String]>,
    ) -> DbResult<Vec<SlaveStageRecord>> {
        let tables = self.tables();
        let positions: HashMap<i64, (usize, String)> = tables
            .slaves(master_build_id)
            .filter_map(|b| {
                let position = match buildbucket_ids {
                    None => 0,
                    Some(ids) => filter_position(ids, b.buildbucket_id.as_ref())?,
                };
                Some((b.id, (position, b.build_config.clone())))
            })
            .collect();

        let mut stages: Vec<(usize, SlaveStageRecord)> = tables
            .stages
            .iter()
            .filter_map(|s| {
                let (position, build_config) = positions.get(&s.build_id)?;
                Some((
                    *position,
                    SlaveStageRecord {
                        stage: s.clone(),
                        build_config: build_config.clone(),
                    },
                ))
            })
            .collect();
        stages.sort_by_key(|(position, s)| (*position, s.stage.id));
        Ok(stages.into_iter().map(|(_, s)| s).collect())
    }

    async fn get_slave_failures(
        &self,
        master_build_id: BuildId,
        buildbucket_ids: Option<&[String]>,
    ) -> DbResult<Vec<StageFailureRecord>> {
        let tables = self.tables();
        let mut failures: Vec<(usize, StageFailureRecord)> = tables
            .failures_where(|f| f.master_build_id == Some(master_build_id.get()))
            .into_iter()
            .filter_map(|f| {
                let position = match buildbucket_ids {
                    None => 0,
                    Some(ids) => filter_position(ids, f.buildbucket_id.as_ref())?,
                };
                Some((position, f))
            })
            .collect();
        failures.sort_by_key(|(position, f)| (*position, f.id));
        Ok(failures.into_iter().map(|(_, f)| f).collect())
    }

    async fn get_builds_failures(
        &self,
        build_ids: &[BuildId],
    ) -> DbResult<Vec<StageFailureRecord>> {
        let wanted: HashSet<i64> = build_ids.iter().map(|id| id.get()).collect();
        Ok(self.tables().failures_where(|f| wanted.contains(&f.build_id)))
    }

    async fn get_build_history(&self, query: &BuildHistoryQuery) -> DbResult<Vec<BuildRecord>> {
        let limit = query
            .limit
            .map_or(usize::MAX, |n| usize::try_from(n).unwrap_or(0));
        Ok(self
            .tables()
            .builds
            .iter()
            .rev()
            .map(|b| &b.record)
            .filter(|b| query.matches(b))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_most_recent_build(
        &self,
        waterfall: &str,
        build_config: &str,
        milestone_version: Option<&str>,
    ) -> DbResult<Option<BuildRecord>> {
        Ok(self
            .tables()
            .builds
            .iter()
            .rev()
            .map(|b| &b.record)
            .find(|b| {
                b.is_final
                    && b.waterfall == waterfall
                    && b.build_config == build_config
                    && milestone_version.is_none_or(|m| b.milestone_version.as_deref() == Some(m))
            })
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cidb_core::{ClActionKind, ExceptionCategory};

    fn paladin(number: i64) -> NewBuild {
        NewBuild::new("Lumpy Paladin", "chromeos", number, "lumpy-paladin", "bot-1")
    }

    #[tokio::test]
    async fn test_insert_build_assigns_increasing_ids() {
        let db = FakeCidb::new();
        let a = db.insert_build(&paladin(1)).await.unwrap();
        let b = db.insert_build(&paladin(2)).await.unwrap();
        assert!(b > a);

        let record = db.get_build_status(a).await.unwrap().unwrap();
        assert_eq!(record.status, BuildStatus::Inflight);
        assert!(!record.is_final);
        assert!(record.deadline.is_none());
    }

    #[tokio::test]
    async fn test_insert_build_with_unknown_master_fails() {
        let db = FakeCidb::new();
        let err = db
            .insert_build(&paladin(1).with_master(BuildId::new(99)))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::ReferentialIntegrity(_)));
        assert_eq!(db.build_count(), 0);
    }

    #[tokio::test]
    async fn test_strict_finish_does_not_overwrite() {
        let db = FakeCidb::new();
        let id = db.insert_build(&paladin(1)).await.unwrap();

        let first = db
            .finish_build(id, BuildStatus::Failed, Some("boom"), None, true)
            .await
            .unwrap();
        let second = db
            .finish_build(id, BuildStatus::Passed, None, None, true)
            .await
            .unwrap();
        assert_eq!((first, second), (1, 0));

        let record = db.get_build_status(id).await.unwrap().unwrap();
        assert_eq!(record.status, BuildStatus::Failed);
        assert_eq!(record.summary.as_deref(), Some("boom"));
        assert!(record.is_final);
        assert_eq!(record.finish_time, Some(record.last_updated));

        let forced = db
            .finish_build(id, BuildStatus::Aborted, None, None, false)
            .await
            .unwrap();
        assert_eq!(forced, 1);
        let record = db.get_build_status(id).await.unwrap().unwrap();
        assert_eq!(record.status, BuildStatus::Aborted);
    }

    #[tokio::test]
    async fn test_finish_with_non_terminal_status_is_rejected() {
        let db = FakeCidb::new();
        let id = db.insert_build(&paladin(1)).await.unwrap();
        let err = db
            .finish_build(id, BuildStatus::Inflight, None, None, true)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_summary_is_truncated() {
        let db = FakeCidb::new();
        let id = db.insert_build(&paladin(1)).await.unwrap();
        let long = "x".repeat(2000);
        db.finish_build(id, BuildStatus::Passed, Some(&long), None, true)
            .await
            .unwrap();
        let record = db.get_build_status(id).await.unwrap().unwrap();
        assert_eq!(record.summary.map(|s| s.len()), Some(SUMMARY_MAX_CHARS));
    }

    #[tokio::test]
    async fn test_stage_lifecycle() {
        let db = FakeCidb::new();
        let build = db.insert_build(&paladin(1)).await.unwrap();
        let stage = db
            .insert_build_stage(build, "HWTest", Some("lumpy"))
            .await
            .unwrap();

        let record = db.get_build_stage(stage).await.unwrap().unwrap();
        assert_eq!(record.status, StageStatus::Planned);
        assert!(record.start_time.is_none());

        assert_eq!(db.wait_build_stage(stage).await.unwrap(), 1);
        let record = db.get_build_stage(stage).await.unwrap().unwrap();
        assert_eq!(record.status, StageStatus::Waiting);
        assert!(record.start_time.is_none());

        assert_eq!(db.start_build_stage(stage).await.unwrap(), 1);
        assert_eq!(db.wait_build_stage(stage).await.unwrap(), 0);
        let record = db.get_build_stage(stage).await.unwrap().unwrap();
        assert_eq!(record.status, StageStatus::Inflight);
        assert!(record.start_time.is_some());

        db.finish_build_stage(stage, StageStatus::Failed).await.unwrap();
        // Retried finishes overwrite.
        db.finish_build_stage(stage, StageStatus::Passed).await.unwrap();
        let record = db.get_build_stage(stage).await.unwrap().unwrap();
        assert_eq!(record.status, StageStatus::Passed);
        assert!(record.is_final);
        assert_eq!(db.start_build_stage(stage).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failures_attach_to_stage() {
        let db = FakeCidb::new();
        let build = db.insert_build(&paladin(1)).await.unwrap();
        let stage = db.insert_build_stage(build, "Build", None).await.unwrap();
        assert!(!db.has_failure_msg_for_stage(stage).await.unwrap());

        let outer = db
            .insert_failure(&NewFailure::new(
                stage,
                "StepFailure",
                "m".repeat(500),
                ExceptionCategory::Build,
            ))
            .await
            .unwrap();
        db.insert_failure(
            &NewFailure::new(stage, "BuildScriptFailure", "inner", ExceptionCategory::Infra)
                .with_outer_failure(outer),
        )
        .await
        .unwrap();

        assert!(db.has_failure_msg_for_stage(stage).await.unwrap());
        let failures = db.get_builds_failures(&[build]).await.unwrap();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].exception_message.len(), FAILURE_MESSAGE_MAX_CHARS);
        assert_eq!(failures[1].outer_failure_id, Some(outer.get()));
        assert_eq!(failures[1].stage_name, "Build");

        let err = db
            .insert_failure(&NewFailure::new(
                BuildStageId::new(42),
                "X",
                "y",
                ExceptionCategory::Unknown,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::ReferentialIntegrity(_)));
    }

    #[tokio::test]
    async fn test_cl_action_batches_of_any_size() {
        let db = FakeCidb::new();
        let build = db.insert_build(&paladin(1)).await.unwrap();
        let change = GerritChange::new(1234, false);

        for batch in [0usize, 1, 3] {
            let actions: Vec<ClAction> = (0..batch)
                .map(|i| ClAction::new(change, i as i64 + 1, ClActionKind::PickedUp))
                .collect();
            let before = db.get_actions_for_build(build).await.unwrap().len();
            let inserted = db.insert_cl_actions(build, &actions).await.unwrap();
            let after = db.get_actions_for_build(build).await.unwrap().len();
            assert_eq!(inserted as usize, batch);
            assert_eq!(after - before, batch);
        }

        let for_change = db.get_actions_for_changes(&[change]).await.unwrap();
        assert_eq!(for_change.len(), 4);
        assert!(for_change.iter().all(|a| a.build_config == "lumpy-paladin"));
        assert!(
            db.get_actions_for_changes(&[GerritChange::new(1234, true)])
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_deadline_reaches_zero_and_cannot_be_revived() {
        let db = FakeCidb::new();
        let none = db.insert_build(&paladin(1)).await.unwrap();
        assert_eq!(db.get_time_to_deadline(none).await.unwrap(), None);

        let id = db
            .insert_build(&paladin(2).with_timeout_seconds(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(
            db.get_time_to_deadline(id).await.unwrap(),
            Some(Duration::ZERO)
        );
        assert_eq!(
            db.extend_deadline(id, Duration::from_secs(600)).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_deadline_of_unknown_build_is_none() {
        let db = FakeCidb::new();
        let missing = BuildId::new(9999);
        assert_eq!(db.get_time_to_deadline(missing).await.unwrap(), None);
        assert_eq!(db.extend_deadline(missing, Duration::from_secs(60)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_extend_deadline_only_moves_forward() {
        let db = FakeCidb::new();
        let id = db
            .insert_build(&paladin(1).with_timeout_seconds(600))
            .await
            .unwrap();

        assert_eq!(db.extend_deadline(id, Duration::from_secs(60)).await.unwrap(), 0);
        assert_eq!(db.extend_deadline(id, Duration::from_secs(3600)).await.unwrap(), 1);
        let left = db.get_time_to_deadline(id).await.unwrap().unwrap();
        assert!(left > Duration::from_secs(3000));

        let open = db.insert_build(&paladin(2)).await.unwrap();
        assert_eq!(db.extend_deadline(open, Duration::from_secs(5)).await.unwrap(), 1);

        db.set_deadline(open, Some(Utc::now() - chrono::Duration::seconds(30)))
            .unwrap();
        assert_eq!(db.extend_deadline(open, Duration::from_secs(5)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_slave_statuses_filtering_and_order() {
        let db = FakeCidb::new();
        let master = db.insert_build(&paladin(1)).await.unwrap();
        for bb in ["bb-a", "bb-b", "bb-c"] {
            db.insert_build(&paladin(2).with_master(master).with_buildbucket_id(bb))
                .await
                .unwrap();
        }

        let all = db.get_slave_statuses(master, None).await.unwrap();
        let ids: Vec<i64> = all.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![2, 3, 4]);

        let nothing: &[String] = &[];
        assert!(db.get_slave_statuses(master, Some(nothing)).await.unwrap().is_empty());

        let filter = vec!["bb-c".to_string(), "bb-a".to_string()];
        let picked = db
            .get_slave_statuses(master, Some(filter.as_slice()))
            .await
            .unwrap();
        let bbs: Vec<_> = picked
            .iter()
            .map(|b| b.buildbucket_id.as_deref().unwrap())
            .collect();
        assert_eq!(bbs, vec!["bb-c", "bb-a"]);
    }

    #[tokio::test]
    async fn test_master_paladin_scenario() {
        let db = FakeCidb::new();
        for number in 1..=5 {
            let id = db
                .insert_build(&NewBuild::new(
                    "master-paladin",
                    "chromeos",
                    number,
                    "master-paladin",
                    "bot",
                ))
                .await
                .unwrap();
            db.finish_build(id, BuildStatus::Passed, None, None, true)
                .await
                .unwrap();
        }

        let master = db
            .insert_build(&NewBuild::new(
                "master-paladin",
                "chromeos",
                6,
                "master-paladin",
                "bot",
            ))
            .await
            .unwrap();
        for (bb, status) in [("s1", StageStatus::Passed), ("s2", StageStatus::Failed)] {
            let slave = db
                .insert_build(&paladin(6).with_master(master).with_buildbucket_id(bb))
                .await
                .unwrap();
            let stage = db.insert_build_stage(slave, "CommitQueueSync", None).await.unwrap();
            db.start_build_stage(stage).await.unwrap();
            db.finish_build_stage(stage, status).await.unwrap();
        }

        let stages = db.get_slave_stages(master, None).await.unwrap();
        assert_eq!(stages.len(), 2);
        assert!(stages.iter().all(|s| s.build_config == "lumpy-paladin"));
        let nothing: &[String] = &[];
        assert!(db.get_slave_stages(master, Some(nothing)).await.unwrap().is_empty());

        let history = db
            .get_build_history(&BuildHistoryQuery::new("master-paladin").limit(5))
            .await
            .unwrap();
        assert_eq!(history.len(), 5);
        assert!(history.windows(2).all(|w| w[0].id > w[1].id));
        assert_eq!(history[0].id, master.get());

        let finished = db
            .get_build_history(&BuildHistoryQuery::new("master-paladin").final_only())
            .await
            .unwrap();
        assert_eq!(finished.len(), 5);

        let recent = db
            .get_most_recent_build("chromeos", "master-paladin", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recent.build_number, 5);
    }

    #[tokio::test]
    async fn test_history_filter_with_no_matches_is_empty() {
        let db = FakeCidb::new();
        db.insert_build(&paladin(1)).await.unwrap();
        let history = db
            .get_build_history(&BuildHistoryQuery::new("lumpy-paladin").platform_version("1.2.3"))
            .await
            .unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn test_metadata_round_trip() {
        let db = FakeCidb::new();
        let id = db.insert_build(&paladin(1)).await.unwrap();
        db.update_metadata(
            id,
            &BuildMetadata {
                milestone_version: Some("56".into()),
                platform_version: Some("9000.0.0".into()),
                chrome_version: Some("56.0.2900.0".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        db.update_metadata(
            id,
            &BuildMetadata {
                sdk_version: Some("2017.01.01".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let metadata = db.get_metadata(id).await.unwrap().unwrap();
        assert_eq!(metadata.milestone_version.as_deref(), Some("56"));
        assert_eq!(metadata.chrome_version.as_deref(), Some("56.0.2900.0"));
        assert_eq!(metadata.sdk_version.as_deref(), Some("2017.01.01"));

        let matched = db
            .get_build_history(&BuildHistoryQuery::new("lumpy-paladin").milestone("56"))
            .await
            .unwrap();
        assert_eq!(matched.len(), 1);
    }

    #[tokio::test]
    async fn test_boards_messages_and_hw_tests() {
        let db = FakeCidb::new();
        let master = db.insert_build(&paladin(1)).await.unwrap();
        let slave = db.insert_build(&paladin(2).with_master(master)).await.unwrap();

        db.insert_board_per_build(slave, "lumpy").await.unwrap();
        let updated = db
            .update_board_per_build_metadata(
                slave,
                "lumpy",
                &BoardMetadata {
                    main_firmware_version: Some("Google_Lumpy.2.0".into()),
                    ec_firmware_version: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(updated, 1);
        let boards = db.get_boards_per_build(slave).await.unwrap();
        assert_eq!(boards[0].main_firmware_version.as_deref(), Some("Google_Lumpy.2.0"));

        db.insert_build_message(
            slave,
            &NewBuildMessage::new("self_destruction", "").with_value("true"),
        )
        .await
        .unwrap();
        assert_eq!(db.get_build_messages(slave).await.unwrap().len(), 1);
        let from_slaves = db.get_slave_build_messages(master).await.unwrap();
        assert_eq!(from_slaves.len(), 1);
        assert_eq!(from_slaves[0].message_value.as_deref(), Some("true"));

        let results = [
            HwTestResult::new(slave, "bvt-inline", "pass"),
            HwTestResult::new(slave, "bvt-cq", "fail"),
        ];
        assert_eq!(db.insert_hw_test_results(&results).await.unwrap(), 2);
        assert_eq!(db.insert_hw_test_results(&[]).await.unwrap(), 0);
        let stored = db.get_hw_test_results_for_builds(&[slave]).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].test_name, "bvt-cq");
    }

    #[tokio::test]
    async fn test_key_vals() {
        let db = FakeCidb::new();
        db.set_key_val("cq_pause", Some("true".into()));
        db.set_key_val("tree_status", None);
        let kv = db.get_key_vals().await.unwrap();
        assert_eq!(kv.get("cq_pause"), Some(&Some("true".to_string())));
        assert_eq!(kv.get("tree_status"), Some(&None));
    }

    #[tokio::test]
    async fn test_slave_failures_follow_filter() {
        let db = FakeCidb::new();
        let master = db.insert_build(&paladin(1)).await.unwrap();
        for bb in ["bb-1", "bb-2"] {
            let slave = db
                .insert_build(&paladin(2).with_master(master).with_buildbucket_id(bb))
                .await
                .unwrap();
            let stage = db.insert_build_stage(slave, "HWTest", None).await.unwrap();
            db.insert_failure(&NewFailure::new(stage, "TestFailure", bb, ExceptionCategory::Test))
                .await
                .unwrap();
        }

        assert_eq!(db.get_slave_failures(master, None).await.unwrap().len(), 2);
        let nothing: &[String] = &[];
        assert!(db.get_slave_failures(master, Some(nothing)).await.unwrap().is_empty());
        let filter = vec!["bb-2".to_string()];
        let only = db
            .get_slave_failures(master, Some(filter.as_slice()))
            .await
            .unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].exception_message, "bb-2");
    }
}
