//! Row identifiers.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Primary key of a row in `buildTable`.
///
/// Generated by the database and monotonically increasing, so ordering by
/// id is ordering by insertion.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("{_0}")]
#[serde(transparent)]
pub struct BuildId(i64);

impl BuildId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for BuildId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<BuildId> for i64 {
    fn from(id: BuildId) -> Self {
        id.0
    }
}

impl std::str::FromStr for BuildId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Primary key of a row in `buildStageTable`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("{_0}")]
#[serde(transparent)]
pub struct BuildStageId(i64);

impl BuildStageId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for BuildStageId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Primary key of a row in `failureTable`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("{_0}")]
#[serde(transparent)]
pub struct FailureId(i64);

impl FailureId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for FailureId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}
