//! Repository traits and the PostgreSQL implementation.
//!
//! Each trait covers one slice of the schema. [`Cidb`] bundles all of them
//! so callers can hold a single `Arc<dyn Cidb>` backed by either [`PgCidb`]
//! or [`FakeCidb`](crate::FakeCidb).

use std::sync::Arc;

use crate::CidbConnection;

/// `SELECT` of every [`BuildRecord`] column from `buildTable`, followed by
/// the given clause.
macro_rules! select_builds {
    ($tail:literal) => {
        concat!(
            "SELECT id, builder_name, waterfall, build_number, build_config, bot_hostname, \
             master_build_id, buildbucket_id, buildbot_generation, important, status, \
             start_time, finish_time, last_updated, timeout_seconds, deadline, summary, \
             metadata_url, milestone_version, platform_version, full_version, final \
             FROM buildTable ",
            $tail
        )
    };
}

pub mod annotation;
pub mod build;
pub mod cl_action;
pub mod deadline;
pub mod history;
pub mod stage;

pub use annotation::{
    AnnotationRepo, BuildMessageRecord, HwTestResult, HwTestResultRecord, NewBuildMessage,
};
pub use build::{
    BoardMetadata, BoardPerBuildRecord, BuildMetadata, BuildRecord, BuildRepo, NewBuild,
};
pub use cl_action::{ClActionRecord, ClActionRepo};
pub use deadline::DeadlineRepo;
pub use history::{BuildHistoryQuery, HistoryRepo, SlaveStageRecord};
pub use stage::{BuildStageRecord, NewFailure, StageFailureRecord, StageRepo};

/// Build summaries longer than this are cut.
pub const SUMMARY_MAX_CHARS: usize = 1024;
/// Failure messages longer than this are cut.
pub const FAILURE_MESSAGE_MAX_CHARS: usize = 240;
/// Limit for a build message's type, subtype and board.
pub const MESSAGE_FIELD_MAX_CHARS: usize = 240;
pub const MESSAGE_VALUE_MAX_CHARS: usize = 480;

/// Every repository behind one handle.
pub trait Cidb:
    BuildRepo + StageRepo + ClActionRepo + DeadlineRepo + AnnotationRepo + HistoryRepo
{
}

impl<T> Cidb for T where
    T: BuildRepo + StageRepo + ClActionRepo + DeadlineRepo + AnnotationRepo + HistoryRepo
{
}

/// PostgreSQL implementation of all repository traits.
#[derive(Clone)]
pub struct PgCidb {
    conn: Arc<CidbConnection>,
}

impl PgCidb {
    pub fn new(conn: Arc<CidbConnection>) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &CidbConnection {
        &self.conn
    }
}

/// Cut `value` to at most `max_chars` characters.
pub(crate) fn truncate(value: &str, max_chars: usize) -> &str {
    match value.char_indices().nth(max_chars) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abcdef", 3), "abc");
        assert_eq!(truncate("abc", 3), "abc");
        assert_eq!(truncate("", 3), "");
        assert_eq!(truncate("héllo", 2), "hé");
    }

    #[test]
    fn test_select_builds_macro() {
        let sql = select_builds!("WHERE id = $1");
        assert!(sql.starts_with("SELECT id, builder_name"));
        assert!(sql.ends_with("FROM buildTable WHERE id = $1"));
    }
}
