//! Per-build deadlines.
//!
//! All arithmetic happens on the database clock so that builders with a
//! skewed local clock agree on how much time is left.

use std::time::Duration;

use async_trait::async_trait;
use cidb_core::BuildId;
use tracing::debug;

use super::PgCidb;
use crate::schema::min;
use crate::DbResult;

#[async_trait]
pub trait DeadlineRepo: Send + Sync {
    /// Time left before the build's deadline. `None` when the build has no
    /// deadline or does not exist, zero once the deadline has passed.
    async fn get_time_to_deadline(&self, id: BuildId) -> DbResult<Option<Duration>>;

    /// Move the deadline to `extra` from now. Only succeeds (returns 1) when
    /// that is later than the current deadline and the current deadline has
    /// not already passed. A build without a deadline always gets one.
    async fn extend_deadline(&self, id: BuildId, extra: Duration) -> DbResult<u64>;
}

#[async_trait]
impl DeadlineRepo for PgCidb {
    async fn get_time_to_deadline(&self, id: BuildId) -> DbResult<Option<Duration>> {
        self.conn
            .require_schema("get_time_to_deadline", min::DEADLINES)?;
        let pool = self.conn.pool();
        let remaining = self
            .conn
            .run("get_time_to_deadline", || {
                sqlx::query_scalar::<_, Option<f64>>(
                    r#"
                    SELECT GREATEST(EXTRACT(EPOCH FROM (deadline - NOW())), 0)::float8
                    FROM buildTable WHERE id = $1
                    "#,
                )
                .bind(id.get())
                .fetch_optional(pool)
            })
            .await?
            .flatten();
        Ok(remaining.map(Duration::from_secs_f64))
    }

    async fn extend_deadline(&self, id: BuildId, extra: Duration) -> DbResult<u64> {
        self.conn.require_schema("extend_deadline", min::DEADLINES)?;
        let pool = self.conn.pool();
        let extra_secs = extra.as_secs_f64();
        let result = self
            .conn
            .run("extend_deadline", || {
                sqlx::query(
                    r#"
                    UPDATE buildTable
                    SET deadline = NOW() + ($2::float8 * INTERVAL '1 second')
                    WHERE id = $1
                      AND (deadline IS NULL OR deadline > NOW())
                      AND (deadline IS NULL OR NOW() + ($2::float8 * INTERVAL '1 second') > deadline)
                    "#,
                )
                .bind(id.get())
                .bind(extra_secs)
                .execute(pool)
            })
            .await?;

        let updated = result.rows_affected();
        debug!(build_id = %id, extra_secs, updated, "Extended build deadline");
        Ok(updated)
    }
}
