//! Core domain types for the continuous-integration database (CIDB).
//!
//! This crate contains:
//! - Typed identifiers for builds, stages and failures
//! - Build and stage status state machines
//! - Failure categories
//! - CL action vocabulary

pub mod cl_action;
pub mod error;
pub mod failure;
pub mod id;
pub mod status;

pub use cl_action::{ChangeSource, ClAction, ClActionKind, GerritChange};
pub use error::{Error, Result};
pub use failure::ExceptionCategory;
pub use id::{BuildId, BuildStageId, FailureId};
pub use status::{BuildStatus, StageStatus};
