use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, info, warn};

use crate::db::downsells::{self, DownsellQueueRow, DownsellRow};
use crate::scheduler::content_body;
use crate::sender::{dedupe, Purpose, SendRequest, SendService};
use crate::utils::errors::GatewayError;

/// Entry statuses in `downsells_queue`.
mod entry_status {
    pub const SENT: &str = "sent";
    pub const CANCELED: &str = "canceled";
    pub const FAILED: &str = "failed";
}

/// Per-batch processing deadline; rows not reached stay pending for the
/// next tick.
const BATCH_DEADLINE: Duration = Duration::from_secs(60);

/// Delay before a transiently failed entry is retried.
fn retry_delay(attempts: i32) -> chrono::Duration {
    let secs = 30i64.saturating_mul(1i64 << attempts.clamp(0, 5) as u32);
    chrono::Duration::seconds(secs.min(600))
}

/// Schedule a downsell firing for a chat, anchored at the trigger moment.
/// The minute-truncated unique index makes re-scheduling idempotent.
pub async fn schedule(
    pool: &PgPool,
    downsell: &DownsellRow,
    chat_id: &str,
    trigger_occurred_at: DateTime<Utc>,
) -> Result<bool, GatewayError> {
    let schedule_at = trigger_occurred_at + chrono::Duration::seconds(downsell.delay_seconds);
    let created = downsells::schedule(pool, downsell.id, &downsell.bot_slug, chat_id, schedule_at)
        .await?;
    if created {
        debug!(
            slug = %downsell.bot_slug,
            downsell_id = downsell.id,
            chat_id,
            %schedule_at,
            "downsell scheduled"
        );
    }
    Ok(created)
}

/// Worker draining due downsell queue entries on a fixed tick. Entries are
/// claimed with skip-locked row locks so multiple replicas can coexist.
pub struct DownsellScheduler {
    pool: PgPool,
    sender: Arc<SendService>,
    tick: Duration,
    batch_size: i64,
    max_attempts: i32,
}

impl DownsellScheduler {
    pub fn new(
        pool: PgPool,
        sender: Arc<SendService>,
        tick_secs: u64,
        batch_size: i64,
        max_attempts: i32,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            sender,
            tick: Duration::from_secs(tick_secs.max(1)),
            batch_size,
            max_attempts,
        })
    }

    pub async fn run(self: Arc<Self>) {
        info!(tick_secs = self.tick.as_secs(), "downsell scheduler started");
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match tokio::time::timeout(BATCH_DEADLINE, self.drain_once()).await {
                Ok(Ok(0)) => {}
                Ok(Ok(n)) => debug!(processed = n, "downsell batch complete"),
                Ok(Err(e)) => warn!(error = %e, "downsell batch failed"),
                Err(_) => warn!("downsell batch hit the deadline, rolled back to pending"),
            }
        }
    }

    /// One batch: claim due entries, fire each through the send service,
    /// settle statuses in the same transaction.
    async fn drain_once(&self) -> Result<usize, GatewayError> {
        let mut tx = self.pool.begin().await?;
        let rows = downsells::claim_due(&mut tx, self.batch_size).await?;
        if rows.is_empty() {
            tx.rollback().await?;
            return Ok(0);
        }

        let count = rows.len();
        for row in rows {
            self.process_entry(&mut tx, row).await?;
        }
        tx.commit().await?;
        Ok(count)
    }

    async fn process_entry(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        row: DownsellQueueRow,
    ) -> Result<(), GatewayError> {
        // Config may have been deactivated or deleted since scheduling.
        let config = downsells::fetch(&self.pool, row.downsell_id).await?;
        let Some(config) = config.filter(|c| c.active) else {
            downsells::mark(tx, row.id, entry_status::CANCELED).await?;
            debug!(queue_id = row.id, "downsell canceled, config gone or inactive");
            return Ok(());
        };

        let Some(body) = content_body(&config.text, &config.media_refs) else {
            downsells::mark(tx, row.id, entry_status::CANCELED).await?;
            warn!(downsell_id = config.id, "downsell has no content, canceling entry");
            return Ok(());
        };

        let mut request = SendRequest::new(
            row.bot_slug.clone(),
            row.chat_id.clone(),
            Purpose::Downsell,
            dedupe::downsell(row.id),
            body,
        );
        request.metadata = serde_json::json!({
            "downsell_id": config.id,
            "queue_id": row.id,
        });

        match self.sender.send(request).await {
            Ok(ok) => {
                downsells::mark(tx, row.id, entry_status::SENT).await?;
                debug!(
                    queue_id = row.id,
                    message_id = ok.message_id,
                    dedupe_applied = ok.dedupe_applied,
                    "downsell sent"
                );
            }
            Err(err) if err.error.is_transient() => {
                if row.attempts + 1 >= self.max_attempts {
                    downsells::mark(tx, row.id, entry_status::FAILED).await?;
                    warn!(
                        queue_id = row.id,
                        attempts = row.attempts + 1,
                        code = err.error.code(),
                        "downsell failed after attempt cap"
                    );
                } else {
                    let next_at = Utc::now() + retry_delay(row.attempts);
                    downsells::reschedule_attempt(tx, row.id, next_at).await?;
                    debug!(
                        queue_id = row.id,
                        attempts = row.attempts + 1,
                        %next_at,
                        code = err.error.code(),
                        "downsell rescheduled"
                    );
                }
            }
            Err(err) => {
                downsells::mark(tx, row.id, entry_status::FAILED).await?;
                warn!(queue_id = row.id, code = err.error.code(), "downsell failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_and_caps() {
        assert_eq!(retry_delay(0), chrono::Duration::seconds(30));
        assert_eq!(retry_delay(1), chrono::Duration::seconds(60));
        assert_eq!(retry_delay(3), chrono::Duration::seconds(240));
        assert_eq!(retry_delay(5), chrono::Duration::seconds(600));
        assert_eq!(retry_delay(50), chrono::Duration::seconds(600));
    }
}
