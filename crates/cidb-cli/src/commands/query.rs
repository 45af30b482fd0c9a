//! Read-side commands and deadline maintenance.

use std::time::Duration;

use anyhow::{Result, bail};
use cidb_config::CidbConfig;
use cidb_core::BuildId;
use cidb_db::{AnnotationRepo, BuildHistoryQuery, DeadlineRepo, HistoryRepo};
use serde_json::json;

pub struct HistoryFilters {
    pub limit: i64,
    pub waterfall: Option<String>,
    pub milestone: Option<String>,
    pub platform_version: Option<String>,
}

pub async fn history(config: &CidbConfig, build_config: &str, filters: HistoryFilters) -> Result<()> {
    let db = super::open(config).await?;

    let mut query = BuildHistoryQuery::new(build_config).limit(filters.limit);
    if let Some(waterfall) = filters.waterfall {
        query = query.waterfall(waterfall);
    }
    if let Some(milestone) = filters.milestone {
        query = query.milestone(milestone);
    }
    if let Some(platform_version) = filters.platform_version {
        query = query.platform_version(platform_version);
    }

    let builds = db.get_build_history(&query).await?;
    super::print_json(&builds)
}

pub async fn slaves(config: &CidbConfig, master_id: i64, buildbucket_ids: Vec<String>) -> Result<()> {
    let db = super::open(config).await?;
    let filter = (!buildbucket_ids.is_empty()).then_some(buildbucket_ids.as_slice());
    let builds = db.get_slave_statuses(BuildId::new(master_id), filter).await?;
    super::print_json(&builds)
}

pub async fn deadline(config: &CidbConfig, build_id: i64) -> Result<()> {
    let db = super::open(config).await?;
    let remaining = db.get_time_to_deadline(BuildId::new(build_id)).await?;
    super::print_json(&json!({
        "build_id": build_id,
        "seconds_remaining": remaining.map(|d| d.as_secs_f64()),
    }))
}

pub async fn extend_deadline(config: &CidbConfig, build_id: i64, seconds: u64) -> Result<()> {
    if seconds == 0 {
        bail!("extension must be at least one second");
    }
    let db = super::open(config).await?;
    let id = BuildId::new(build_id);
    let updated = db.extend_deadline(id, Duration::from_secs(seconds)).await?;
    let remaining = db.get_time_to_deadline(id).await?;
    super::print_json(&json!({
        "build_id": build_id,
        "extended": updated > 0,
        "seconds_remaining": remaining.map(|d| d.as_secs_f64()),
    }))
}

pub async fn keyvals(config: &CidbConfig) -> Result<()> {
    let db = super::open(config).await?;
    let values = db.get_key_vals().await?;
    let sorted: std::collections::BTreeMap<_, _> = values.into_iter().collect();
    super::print_json(&sorted)
}
