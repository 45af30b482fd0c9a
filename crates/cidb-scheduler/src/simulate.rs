//! Drives simulated builds through the repository, the way real builders
//! write to CIDB: insert, boards, stages, failures, CL actions, metadata,
//! finish. Masters fan their slaves out over a [`WorkerPool`].

use std::sync::Arc;

use cidb_core::{BuildId, BuildStatus, ClAction, ExceptionCategory, StageStatus};
use cidb_db::{
    BuildMetadata, BuildRepo, Cidb, ClActionRepo, DbResult, NewBuild, NewFailure, StageRepo,
};
use tracing::{error, info, instrument};

use crate::error::{SchedulerError, SchedulerResult};
use crate::pool::WorkerPool;

#[derive(Debug, Clone)]
pub struct SimulatedFailure {
    pub exception_type: String,
    pub message: String,
    pub category: ExceptionCategory,
}

#[derive(Debug, Clone)]
pub struct SimulatedStage {
    pub name: String,
    pub board: Option<String>,
    /// Terminal status the stage finishes with.
    pub status: StageStatus,
    pub failures: Vec<SimulatedFailure>,
}

impl SimulatedStage {
    pub fn new(name: impl Into<String>, status: StageStatus) -> Self {
        Self {
            name: name.into(),
            board: None,
            status,
            failures: Vec::new(),
        }
    }

    pub fn on_board(mut self, board: impl Into<String>) -> Self {
        self.board = Some(board.into());
        self
    }

    pub fn with_failure(
        mut self,
        exception_type: impl Into<String>,
        message: impl Into<String>,
        category: ExceptionCategory,
    ) -> Self {
        self.failures.push(SimulatedFailure {
            exception_type: exception_type.into(),
            message: message.into(),
            category,
        });
        self
    }
}

/// Everything one builder run records.
#[derive(Debug, Clone)]
pub struct SimulatedBuild {
    pub build: NewBuild,
    pub boards: Vec<String>,
    pub stages: Vec<SimulatedStage>,
    pub cl_actions: Vec<ClAction>,
    pub metadata: Option<BuildMetadata>,
    pub summary: Option<String>,
    /// Terminal status the build finishes with.
    pub status: BuildStatus,
}

impl SimulatedBuild {
    pub fn new(build: NewBuild, status: BuildStatus) -> Self {
        Self {
            build,
            boards: Vec::new(),
            stages: Vec::new(),
            cl_actions: Vec::new(),
            metadata: None,
            summary: None,
            status,
        }
    }

    /// A typical commit-queue slave for `board`: sync, build, then hardware
    /// tests that fail with a lab error unless `passed`.
    pub fn paladin(board: &str, build_number: i64, passed: bool) -> Self {
        let config = format!("{board}-paladin");
        let build = NewBuild::new(
            config.clone(),
            "chromeos",
            build_number,
            config.clone(),
            format!("{board}-bot"),
        )
        .with_timeout_seconds(3 * 60 * 60)
        .with_buildbucket_id(format!("{config}-{build_number}"))
        .important(true);

        let hw_test = if passed {
            SimulatedStage::new("HWTest", StageStatus::Passed)
        } else {
            SimulatedStage::new("HWTest", StageStatus::Failed).with_failure(
                "TestLabFailure",
                "** HWTest did not complete due to infrastructure issues (code 3) **",
                ExceptionCategory::Lab,
            )
        }
        .on_board(board);

        let status = if passed {
            BuildStatus::Passed
        } else {
            BuildStatus::Failed
        };

        Self::new(build, status)
            .with_board(board)
            .with_stage(SimulatedStage::new("CommitQueueSync", StageStatus::Passed))
            .with_stage(SimulatedStage::new("BuildPackages", StageStatus::Passed).on_board(board))
            .with_stage(hw_test)
            .with_metadata(BuildMetadata {
                chrome_version: Some("65.0.3313.0".into()),
                milestone_version: Some("65".into()),
                platform_version: Some("10323.0.0".into()),
                full_version: Some("R65-10323.0.0".into()),
                ..Default::default()
            })
    }

    pub fn with_board(mut self, board: impl Into<String>) -> Self {
        self.boards.push(board.into());
        self
    }

    pub fn with_stage(mut self, stage: SimulatedStage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn with_cl_action(mut self, action: ClAction) -> Self {
        self.cl_actions.push(action);
        self
    }

    pub fn with_metadata(mut self, metadata: BuildMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    fn validate(&self) -> SchedulerResult<()> {
        let invalid = |reason: String| SchedulerError::InvalidSimulation {
            build_config: self.build.build_config.clone(),
            reason,
        };
        if !self.build.status.is_initial() {
            return Err(invalid(format!("starts in {}", self.build.status)));
        }
        if !self.status.is_terminal() {
            return Err(invalid(format!("finishes in {}", self.status)));
        }
        if let Some(stage) = self.stages.iter().find(|s| !s.status.is_terminal()) {
            return Err(invalid(format!(
                "stage {} finishes in {}",
                stage.name, stage.status
            )));
        }
        Ok(())
    }
}

/// Ids written by [`BuildSimulator::simulate_master`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationOutcome {
    pub master: BuildId,
    /// Slave ids in the order the slaves were given.
    pub slaves: Vec<BuildId>,
}

pub struct BuildSimulator {
    db: Arc<dyn Cidb>,
    pool: WorkerPool,
}

impl BuildSimulator {
    pub fn new(db: Arc<dyn Cidb>, pool: WorkerPool) -> Self {
        Self { db, pool }
    }

    /// Record one complete build with no master.
    pub async fn run_build(&self, build: &SimulatedBuild) -> SchedulerResult<BuildId> {
        build.validate()?;
        Ok(run_build(self.db.as_ref(), build, None).await?)
    }

    /// Insert the master, run every slave on the pool with the master's id,
    /// then record the master's own stages and finish it.
    ///
    /// If any slave fails to record, the master is finished as `fail` and the
    /// first slave error is returned.
    #[instrument(skip_all, fields(master = %master.build.build_config, slaves = slaves.len()))]
    pub async fn simulate_master(
        &self,
        master: SimulatedBuild,
        slaves: Vec<SimulatedBuild>,
    ) -> SchedulerResult<SimulationOutcome> {
        master.validate()?;
        for slave in &slaves {
            slave.validate()?;
        }

        let master_id = start_build(self.db.as_ref(), &master, None).await?;
        info!(master_id = %master_id, "Inserted master build");

        let db = self.db.clone();
        let results = self
            .pool
            .run(slaves, move |slave| {
                let db = db.clone();
                async move { run_build(db.as_ref(), &slave, Some(master_id)).await }
            })
            .await?;

        let slave_ids = match results.into_iter().collect::<DbResult<Vec<_>>>() {
            Ok(ids) => ids,
            Err(e) => {
                error!(master_id = %master_id, error = %e, "Slave build failed to record");
                let summary = format!("slave build failed to record: {e}");
                self.db
                    .finish_build(master_id, BuildStatus::Failed, Some(&summary), None, true)
                    .await?;
                return Err(e.into());
            }
        };

        complete_build(self.db.as_ref(), master_id, &master).await?;
        info!(master_id = %master_id, slaves = slave_ids.len(), status = %master.status, "Finished master build");

        Ok(SimulationOutcome {
            master: master_id,
            slaves: slave_ids,
        })
    }
}

async fn run_build(
    db: &dyn Cidb,
    sim: &SimulatedBuild,
    master: Option<BuildId>,
) -> DbResult<BuildId> {
    let id = start_build(db, sim, master).await?;
    complete_build(db, id, sim).await?;
    Ok(id)
}

async fn start_build(
    db: &dyn Cidb,
    sim: &SimulatedBuild,
    master: Option<BuildId>,
) -> DbResult<BuildId> {
    let id = match master {
        Some(master) => db.insert_build(&sim.build.clone().with_master(master)).await?,
        None => db.insert_build(&sim.build).await?,
    };
    for board in &sim.boards {
        db.insert_board_per_build(id, board).await?;
    }
    Ok(id)
}

async fn complete_build(db: &dyn Cidb, id: BuildId, sim: &SimulatedBuild) -> DbResult<()> {
    for stage in &sim.stages {
        let stage_id = db
            .insert_build_stage(id, &stage.name, stage.board.as_deref())
            .await?;
        db.wait_build_stage(stage_id).await?;
        db.start_build_stage(stage_id).await?;
        db.finish_build_stage(stage_id, stage.status).await?;
        for failure in &stage.failures {
            db.insert_failure(&NewFailure::new(
                stage_id,
                failure.exception_type.as_str(),
                failure.message.as_str(),
                failure.category,
            ))
            .await?;
        }
    }
    if !sim.cl_actions.is_empty() {
        db.insert_cl_actions(id, &sim.cl_actions).await?;
    }
    if let Some(metadata) = &sim.metadata {
        db.update_metadata(id, metadata).await?;
    }
    db.finish_build(id, sim.status, sim.summary.as_deref(), None, true)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cidb_core::{ClActionKind, GerritChange};
    use cidb_db::{FakeCidb, HistoryRepo};

    fn master(build_number: i64) -> SimulatedBuild {
        let build = NewBuild::new(
            "master-paladin",
            "chromeos",
            build_number,
            "master-paladin",
            "master-bot",
        );
        SimulatedBuild::new(build, BuildStatus::Passed)
            .with_stage(SimulatedStage::new("CommitQueueCompletion", StageStatus::Passed))
            .with_cl_action(ClAction::new(
                GerritChange::new(1234, false),
                2,
                ClActionKind::PickedUp,
            ))
            .with_summary("all slaves done")
    }

    fn simulator(db: &Arc<FakeCidb>, workers: usize) -> BuildSimulator {
        BuildSimulator::new(db.clone(), WorkerPool::new(workers))
    }

    #[tokio::test]
    async fn test_run_build_records_everything() {
        let db = Arc::new(FakeCidb::new());
        let id = simulator(&db, 1)
            .run_build(&SimulatedBuild::paladin("lumpy", 7, false))
            .await
            .unwrap();

        let record = db.get_build_status(id).await.unwrap().unwrap();
        assert_eq!(record.status, BuildStatus::Failed);
        assert!(record.is_final);
        assert_eq!(record.milestone_version.as_deref(), Some("65"));

        let stages = db.get_build_stages(id).await.unwrap();
        assert_eq!(stages.len(), 3);
        assert_eq!(stages[2].status, StageStatus::Failed);
        assert!(db.has_failure_msg_for_stage(stages[2].stage_id()).await.unwrap());
        assert!(!db.has_failure_msg_for_stage(stages[0].stage_id()).await.unwrap());

        let boards = db.get_boards_per_build(id).await.unwrap();
        assert_eq!(boards.len(), 1);
        assert_eq!(boards[0].board, "lumpy");
    }

    #[tokio::test]
    async fn test_master_fans_out_slaves() {
        let db = Arc::new(FakeCidb::new());
        let slaves = vec![
            SimulatedBuild::paladin("lumpy", 11, true),
            SimulatedBuild::paladin("peppy", 11, false),
            SimulatedBuild::paladin("daisy", 11, true),
        ];

        let outcome = simulator(&db, 2)
            .simulate_master(master(11), slaves)
            .await
            .unwrap();
        assert_eq!(outcome.slaves.len(), 3);

        let statuses = db.get_slave_statuses(outcome.master, None).await.unwrap();
        assert_eq!(statuses.len(), 3);
        let mut configs: Vec<_> = statuses.iter().map(|b| b.build_config.as_str()).collect();
        configs.sort();
        assert_eq!(configs, ["daisy-paladin", "lumpy-paladin", "peppy-paladin"]);
        assert!(
            statuses
                .iter()
                .all(|b| b.master_build_id() == Some(outcome.master))
        );

        // Each returned slave id matches the config it was submitted with.
        let peppy = db.get_build_status(outcome.slaves[1]).await.unwrap().unwrap();
        assert_eq!(peppy.build_config, "peppy-paladin");

        let failures = db.get_slave_failures(outcome.master, None).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].build_config, "peppy-paladin");
        assert_eq!(failures[0].exception_category, ExceptionCategory::Lab);

        let stages = db.get_slave_stages(outcome.master, None).await.unwrap();
        assert_eq!(stages.len(), 9);

        let master_record = db.get_build_status(outcome.master).await.unwrap().unwrap();
        assert_eq!(master_record.status, BuildStatus::Passed);
        assert_eq!(master_record.summary.as_deref(), Some("all slaves done"));
        assert_eq!(db.get_actions_for_build(outcome.master).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_non_terminal_stage_is_rejected_before_writing() {
        let db = Arc::new(FakeCidb::new());
        let bad = SimulatedBuild::paladin("lumpy", 1, true)
            .with_stage(SimulatedStage::new("Archive", StageStatus::Inflight));

        let err = simulator(&db, 2)
            .simulate_master(master(1), vec![bad])
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSimulation { .. }));
        assert_eq!(db.build_count(), 0);
    }

    #[tokio::test]
    async fn test_master_without_slaves() {
        let db = Arc::new(FakeCidb::new());
        let outcome = simulator(&db, 4)
            .simulate_master(master(3), Vec::new())
            .await
            .unwrap();
        assert!(outcome.slaves.is_empty());
        assert!(db.get_slave_statuses(outcome.master, None).await.unwrap().is_empty());
    }
}
