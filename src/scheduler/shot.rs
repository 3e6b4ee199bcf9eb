use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use crate::db::shots::{self, entry_status, status, ShotRow};
use crate::db::funnel;
use crate::scheduler::content_body;
use crate::sender::{dedupe, Purpose, SendRequest, SendService};
use crate::utils::errors::GatewayError;

const BATCH_DEADLINE: Duration = Duration::from_secs(60);

/// Declared filter names. PIX-dependent ones exist in the vocabulary but
/// resolve only when a payments collaborator is plugged in.
pub fn is_known_filter(filter: &str) -> bool {
    matches!(filter, "all_started" | "has_unpaid_pix" | "exclude_paid")
}

/// Filters a shot can target. PIX-dependent filters need the payments
/// collaborator and are rejected at populate time; the seam below is where
/// a deployment plugs that collaborator in.
pub fn validate_filter(filter: &str) -> Result<(), GatewayError> {
    match filter {
        "all_started" => Ok(()),
        "has_unpaid_pix" | "exclude_paid" => Err(GatewayError::BadRequest {
            description: Some(format!(
                "filter '{}' requires the payments collaborator",
                filter
            )),
        }),
        other => Err(GatewayError::BadRequest {
            description: Some(format!("unknown filter '{}'", other)),
        }),
    }
}

/// Resolves a filter expression into the target chat set.
#[async_trait]
pub trait ShotTargetSource: Send + Sync {
    async fn resolve(&self, slug: &str, filter: &str) -> Result<Vec<String>, GatewayError>;
}

/// Built-in source: `all_started` = every chat that ever delivered `/start`
/// to the tenant, read from the funnel records.
pub struct FunnelTargetSource {
    pool: PgPool,
}

impl FunnelTargetSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ShotTargetSource for FunnelTargetSource {
    async fn resolve(&self, slug: &str, filter: &str) -> Result<Vec<String>, GatewayError> {
        validate_filter(filter)?;
        funnel::distinct_start_chats(&self.pool, slug).await
    }
}

/// Worker driving `sending` shots: drains per-shot target queues in batches,
/// rolls progress counters, and flips due scheduled shots to `sending`.
pub struct ShotScheduler {
    pool: PgPool,
    sender: Arc<SendService>,
    tick: Duration,
    batch_size: i64,
    max_attempts: i32,
}

impl ShotScheduler {
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
        info!(tick_secs = self.tick.as_secs(), "shot scheduler started");
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = self.start_due_scheduled().await {
                warn!(error = %e, "failed to start scheduled shots");
            }
            match shots::sending(&self.pool).await {
                Ok(active) => {
                    for shot in active {
                        match tokio::time::timeout(BATCH_DEADLINE, self.drain_shot(&shot)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                warn!(shot_id = shot.id, error = %e, "shot batch failed")
                            }
                            Err(_) => warn!(
                                shot_id = shot.id,
                                "shot batch hit the deadline, rolled back to pending"
                            ),
                        }
                    }
                }
                Err(e) => warn!(error = %e, "failed to list sending shots"),
            }
        }
    }

    /// Scheduled shots whose time has come move `queued → sending` without
    /// an operator action.
    async fn start_due_scheduled(&self) -> Result<(), GatewayError> {
        for shot in shots::due_scheduled(&self.pool).await? {
            if shots::transition(&self.pool, &shot.bot_slug, shot.id, status::QUEUED, status::SENDING)
                .await?
                .is_some()
            {
                info!(shot_id = shot.id, slug = %shot.bot_slug, "scheduled shot started");
            }
        }
        Ok(())
    }

    /// One batch for one shot: claim pending targets, send each, settle
    /// entry statuses and counters in the same transaction.
    async fn drain_shot(&self, shot: &ShotRow) -> Result<(), GatewayError> {
        let Some(body) = content_body(&shot.text, &shot.media_refs) else {
            warn!(shot_id = shot.id, "shot has no content, canceling");
            shots::cancel(&self.pool, &shot.bot_slug, shot.id).await?;
            return Ok(());
        };

        let mut tx = self.pool.begin().await?;
        let rows = shots::claim_pending(&mut tx, shot.id, self.batch_size).await?;
        if rows.is_empty() {
            // Queue drained (possibly by another replica): run the
            // completion check so counters can close the shot out.
            shots::apply_batch_counts(&mut tx, shot.id, 0, 0).await?;
            tx.commit().await?;
            return Ok(());
        }

        let mut sent = 0i64;
        let mut failed = 0i64;
        for row in rows {
            let mut request = SendRequest::new(
                row.bot_slug.clone(),
                row.chat_id.clone(),
                Purpose::Shot,
                dedupe::shot(shot.id, &row.chat_id),
                body.clone(),
            );
            request.metadata = serde_json::json!({ "shot_id": shot.id });

            match self.sender.send(request).await {
                Ok(ok) => {
                    shots::mark_entry(&mut tx, row.id, entry_status::SENT).await?;
                    sent += 1;
                    debug!(
                        shot_id = shot.id,
                        chat_id = %row.chat_id,
                        message_id = ok.message_id,
                        dedupe_applied = ok.dedupe_applied,
                        "shot target sent"
                    );
                }
                Err(err) if err.error.is_transient() => {
                    if row.attempts + 1 >= self.max_attempts {
                        shots::mark_entry(&mut tx, row.id, entry_status::FAILED).await?;
                        failed += 1;
                        warn!(
                            shot_id = shot.id,
                            chat_id = %row.chat_id,
                            code = err.error.code(),
                            "shot target failed after attempt cap"
                        );
                    } else {
                        shots::bump_entry_attempts(&mut tx, row.id).await?;
                        debug!(
                            shot_id = shot.id,
                            chat_id = %row.chat_id,
                            attempts = row.attempts + 1,
                            code = err.error.code(),
                            "shot target will retry"
                        );
                    }
                }
                Err(err) => {
                    shots::mark_entry(&mut tx, row.id, entry_status::FAILED).await?;
                    failed += 1;
                    debug!(
                        shot_id = shot.id,
                        chat_id = %row.chat_id,
                        code = err.error.code(),
                        "shot target failed"
                    );
                }
            }
        }

        shots::apply_batch_counts(&mut tx, shot.id, sent, failed).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_started_is_the_only_builtin_filter() {
        assert!(validate_filter("all_started").is_ok());
    }

    #[test]
    fn pix_filters_require_the_payments_collaborator() {
        for filter in ["has_unpaid_pix", "exclude_paid"] {
            let err = validate_filter(filter).unwrap_err();
            assert_eq!(err.code(), "BAD_REQUEST");
            assert!(err.description().unwrap().contains("payments collaborator"));
        }
    }

    #[test]
    fn unknown_filters_are_rejected() {
        let err = validate_filter("everyone").unwrap_err();
        assert_eq!(err.code(), "BAD_REQUEST");
    }
}
