//! CL action vocabulary.
//!
//! A CL action records something a build did to a change (picked it up,
//! submitted it, kicked it out, ...). How actions are chosen is up to the
//! builders; the database only stores them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

/// Which code review host a change lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeSource {
    Internal,
    External,
}

impl ChangeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeSource::Internal => "internal",
            ChangeSource::External => "external",
        }
    }

    pub fn from_internal(internal: bool) -> Self {
        if internal {
            ChangeSource::Internal
        } else {
            ChangeSource::External
        }
    }
}

impl std::fmt::Display for ChangeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChangeSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "internal" => Ok(ChangeSource::Internal),
            "external" => Ok(ChangeSource::External),
            _ => Err(Error::UnknownChangeSource(s.to_string())),
        }
    }
}

impl TryFrom<String> for ChangeSource {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A change on a review host, identified without a patch number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GerritChange {
    pub change_number: i64,
    pub internal: bool,
}

impl GerritChange {
    pub fn new(change_number: i64, internal: bool) -> Self {
        Self {
            change_number,
            internal,
        }
    }

    pub fn source(&self) -> ChangeSource {
        ChangeSource::from_internal(self.internal)
    }
}

macro_rules! cl_action_kinds {
    ($($variant:ident => $text:literal),+ $(,)?) => {
        /// Action a build took on a change.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum ClActionKind {
            $(#[serde(rename = $text)] $variant,)+
        }

        impl ClActionKind {
            pub const ALL: &'static [ClActionKind] = &[$(ClActionKind::$variant,)+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(ClActionKind::$variant => $text,)+
                }
            }
        }
    };
}

cl_action_kinds! {
    PickedUp => "picked_up",
    Submitted => "submitted",
    KickedOut => "kicked_out",
    SubmitFailed => "submit_failed",
    Verified => "verified",
    Forgiven => "forgiven",
    Requeued => "requeued",
    Speculative => "speculative",
    ScreenedForPreCq => "screened_for_pre_cq",
    ValidationPendingPreCq => "validation_pending_pre_cq",
    TrybotLaunching => "trybot_launching",
    TrybotCancelled => "trybot_cancelled",
    PreCqInflight => "pre_cq_inflight",
    PreCqPassed => "pre_cq_passed",
    PreCqFailed => "pre_cq_failed",
    PreCqLaunched => "pre_cq_launched",
    PreCqWaiting => "pre_cq_waiting",
    PreCqReadyToSubmit => "pre_cq_ready_to_submit",
    PreCqFullyVerified => "pre_cq_fully_verified",
    PreCqPartiallyVerified => "pre_cq_partially_verified",
    PreCqExempt => "pre_cq_exempt",
    PreCqReset => "pre_cq_reset",
    IrrelevantToSlave => "irrelevant_to_slave",
    RelevantToSlave => "relevant_to_slave",
}

impl std::fmt::Display for ClActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ClActionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ClActionKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::UnknownAction(s.to_string()))
    }
}

impl TryFrom<String> for ClActionKind {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One action to record against a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClAction {
    pub change_number: i64,
    pub patch_number: i64,
    pub change_source: ChangeSource,
    pub action: ClActionKind,
    pub reason: Option<String>,
    /// Request id of the build launched on behalf of this change, if any.
    pub buildbucket_id: Option<String>,
    /// Explicit timestamp; the database clock is used when absent.
    pub timestamp: Option<DateTime<Utc>>,
}

impl ClAction {
    pub fn new(change: GerritChange, patch_number: i64, action: ClActionKind) -> Self {
        Self {
            change_number: change.change_number,
            patch_number,
            change_source: change.source(),
            action,
            reason: None,
            buildbucket_id: None,
            timestamp: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_buildbucket_id(mut self, buildbucket_id: impl Into<String>) -> Self {
        self.buildbucket_id = Some(buildbucket_id.into());
        self
    }

    pub fn change(&self) -> GerritChange {
        GerritChange::new(
            self.change_number,
            self.change_source == ChangeSource::Internal,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_action_parses_back() {
        for kind in ClActionKind::ALL {
            assert_eq!(kind.as_str().parse::<ClActionKind>().unwrap(), *kind);
        }
        assert!("exploded".parse::<ClActionKind>().is_err());
    }

    #[test]
    fn test_action_builder() {
        let action = ClAction::new(GerritChange::new(205535, false), 1, ClActionKind::Submitted)
            .with_reason("strategy:cq-submit");
        assert_eq!(action.change_source, ChangeSource::External);
        assert_eq!(action.reason.as_deref(), Some("strategy:cq-submit"));
        assert_eq!(action.change(), GerritChange::new(205535, false));
    }
}
