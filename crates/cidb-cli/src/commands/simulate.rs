//! Fan-out simulation against a live database.

use std::sync::Arc;

use anyhow::Result;
use cidb_config::CidbConfig;
use cidb_core::{BuildStatus, ClAction, ClActionKind, GerritChange, StageStatus};
use cidb_db::{BuildRepo, HistoryRepo, NewBuild};
use cidb_scheduler::{BuildSimulator, SimulatedBuild, SimulatedStage, WorkerPool};
use tracing::info;

const BOARDS: &[&str] = &["lumpy", "peppy", "daisy", "link", "samus", "kevin", "eve", "reef"];

pub async fn run(config: &CidbConfig, slaves: usize, workers: Option<usize>) -> Result<()> {
    let db = Arc::new(super::open(config).await?);

    let build_number = db
        .get_most_recent_build("chromeos", "master-paladin", None)
        .await?
        .map_or(1, |build| build.build_number + 1);

    let master = SimulatedBuild::new(
        NewBuild::new(
            "master-paladin",
            "chromeos",
            build_number,
            "master-paladin",
            "master-bot",
        )
        .with_timeout_seconds(4 * 60 * 60)
        .important(true),
        BuildStatus::Passed,
    )
    .with_stage(SimulatedStage::new("CommitQueueCompletion", StageStatus::Passed))
    .with_cl_action(ClAction::new(
        GerritChange::new(500_000 + build_number, false),
        1,
        ClActionKind::PickedUp,
    ))
    .with_summary(format!("simulated run with {slaves} slaves"));

    // Every seventh slave fails its hardware tests.
    let slave_builds = (0..slaves)
        .map(|i| {
            let board = match i / BOARDS.len() {
                0 => BOARDS[i].to_string(),
                round => format!("{}-{round}", BOARDS[i % BOARDS.len()]),
            };
            SimulatedBuild::paladin(&board, build_number, i % 7 != 6)
        })
        .collect();

    let pool = WorkerPool::new(workers.unwrap_or(config.workers));
    info!(slaves, workers = pool.workers(), build_number, "Starting simulation");

    let simulator = BuildSimulator::new(db.clone(), pool);
    let outcome = simulator.simulate_master(master, slave_builds).await?;

    let master = db.get_build_status(outcome.master).await?;
    let slaves = db.get_slave_statuses(outcome.master, None).await?;
    super::print_json(&serde_json::json!({
        "master": master,
        "slaves": slaves,
    }))
}
