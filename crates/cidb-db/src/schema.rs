//! Schema versions required by the repository operations.
//!
//! Each gated operation calls [`CidbConnection::require_schema`] with one
//! of these before touching the database.
//!
//! [`CidbConnection::require_schema`]: crate::CidbConnection::require_schema

pub mod min {
    /// `clActionTable`.
    pub const CL_ACTIONS: i64 = 2;
    /// `boardPerBuildTable`.
    pub const BOARD_PER_BUILD: i64 = 3;
    /// `buildStageTable`.
    pub const BUILD_STAGES: i64 = 4;
    /// `failureTable`.
    pub const FAILURES: i64 = 5;
    /// `deadline` and `timeout_seconds` on `buildTable`.
    pub const DEADLINES: i64 = 6;
    /// Master/slave links, buildbucket ids and version metadata on `buildTable`.
    pub const BUILDS: i64 = 7;
    pub const KEYVALS: i64 = 8;
    pub const BUILD_MESSAGES: i64 = 9;
    /// `failureView`, which joins failures with their stage and build.
    pub const FAILURE_VIEW: i64 = 10;
    pub const HW_TEST_RESULTS: i64 = 11;
}
