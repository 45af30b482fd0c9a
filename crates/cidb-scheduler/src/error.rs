use cidb_db::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("worker failed: {0}")]
    Worker(String),

    #[error("task queue closed with {0} tasks unqueued")]
    QueueClosed(usize),

    #[error("invalid simulated build {build_config}: {reason}")]
    InvalidSimulation { build_config: String, reason: String },
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
