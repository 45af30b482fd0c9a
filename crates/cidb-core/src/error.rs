//! Error types for CIDB domain values.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown build status: {0}")]
    UnknownBuildStatus(String),

    #[error("unknown stage status: {0}")]
    UnknownStageStatus(String),

    #[error("unknown exception category: {0}")]
    UnknownCategory(String),

    #[error("unknown CL action: {0}")]
    UnknownAction(String),

    #[error("unknown change source: {0}")]
    UnknownChangeSource(String),
}

pub type Result<T> = std::result::Result<T, Error>;
