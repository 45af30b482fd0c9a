//! Build and stage status state machines.
//!
//! A build moves `planned -> waiting -> inflight` and ends in one of the
//! terminal statuses. Stages follow the same path but only end in
//! `pass`, `fail` or `forgiven`. The stored text values match what the
//! builders have always written to the database.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Status of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildStatus {
    #[serde(rename = "planned")]
    Planned,
    #[serde(rename = "waiting")]
    Waiting,
    #[serde(rename = "inflight")]
    Inflight,
    #[serde(rename = "pass")]
    Passed,
    #[serde(rename = "fail")]
    Failed,
    #[serde(rename = "aborted")]
    Aborted,
    #[serde(rename = "forgiven")]
    Forgiven,
    #[serde(rename = "skipped")]
    Skipped,
}

impl BuildStatus {
    pub const ALL: [BuildStatus; 8] = [
        BuildStatus::Planned,
        BuildStatus::Waiting,
        BuildStatus::Inflight,
        BuildStatus::Passed,
        BuildStatus::Failed,
        BuildStatus::Aborted,
        BuildStatus::Forgiven,
        BuildStatus::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Planned => "planned",
            BuildStatus::Waiting => "waiting",
            BuildStatus::Inflight => "inflight",
            BuildStatus::Passed => "pass",
            BuildStatus::Failed => "fail",
            BuildStatus::Aborted => "aborted",
            BuildStatus::Forgiven => "forgiven",
            BuildStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Passed
                | BuildStatus::Failed
                | BuildStatus::Aborted
                | BuildStatus::Forgiven
                | BuildStatus::Skipped
        )
    }

    /// Whether a freshly inserted build may start in this status.
    pub fn is_initial(&self) -> bool {
        matches!(
            self,
            BuildStatus::Planned | BuildStatus::Waiting | BuildStatus::Inflight
        )
    }
}

impl Default for BuildStatus {
    fn default() -> Self {
        BuildStatus::Inflight
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BuildStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::UnknownBuildStatus(s.to_string()))
    }
}

impl TryFrom<String> for BuildStatus {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Status of a single stage within a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageStatus {
    #[serde(rename = "planned")]
    Planned,
    #[serde(rename = "waiting")]
    Waiting,
    #[serde(rename = "inflight")]
    Inflight,
    #[serde(rename = "pass")]
    Passed,
    #[serde(rename = "fail")]
    Failed,
    #[serde(rename = "forgiven")]
    Forgiven,
}

impl StageStatus {
    pub const ALL: [StageStatus; 6] = [
        StageStatus::Planned,
        StageStatus::Waiting,
        StageStatus::Inflight,
        StageStatus::Passed,
        StageStatus::Failed,
        StageStatus::Forgiven,
    ];

    pub fn as_str(&self) -> &'static str {
        BuildStatus::from(*self).as_str()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Passed | StageStatus::Failed | StageStatus::Forgiven
        )
    }

    /// Whether `StartBuildStage` may move a stage out of this status.
    pub fn can_start(&self) -> bool {
        matches!(self, StageStatus::Planned | StageStatus::Waiting)
    }
}

impl Default for StageStatus {
    fn default() -> Self {
        StageStatus::Planned
    }
}

impl From<StageStatus> for BuildStatus {
    fn from(status: StageStatus) -> Self {
        match status {
            StageStatus::Planned => BuildStatus::Planned,
            StageStatus::Waiting => BuildStatus::Waiting,
            StageStatus::Inflight => BuildStatus::Inflight,
            StageStatus::Passed => BuildStatus::Passed,
            StageStatus::Failed => BuildStatus::Failed,
            StageStatus::Forgiven => BuildStatus::Forgiven,
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StageStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::UnknownStageStatus(s.to_string()))
    }
}

impl TryFrom<String> for StageStatus {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
