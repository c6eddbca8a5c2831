//! Scheduled expiry sweep
//!
//! Downgrades records whose paid period has ended without a renewal. Each tick
//! reads one page of lapsed records (most overdue first) and expires them one
//! by one with a conditional write. A record that changed since the read is
//! skipped; anything still lapsed is picked up by the next tick.

use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::config::BillingConfig;
use crate::email::BillingEmailService;
use crate::error::BillingResult;
use crate::invariants::audit_committed;
use crate::record::UserSubscriptionRecord;
use crate::state_machine::expire_if_lapsed;
use crate::store::{bounded, RecordStore, WriteOutcome};

/// Result of expiring a single record
#[derive(Debug, Clone, PartialEq)]
pub enum SweepRecordResult {
    /// Downgraded to free. `notified` is false when the email was not accepted.
    Expired { email: String, notified: bool },
    /// Left alone: renewed, downgraded or otherwise changed since the read
    Skipped { email: String },
    Error { email: String, error: String },
}

/// Outcome of one sweep tick
#[derive(Debug, Clone, PartialEq)]
pub struct SweepSummary {
    pub started_at: OffsetDateTime,
    pub matched: usize,
    pub expired: usize,
    pub skipped: usize,
    pub errors: usize,
    /// The page was full, so more lapsed records may remain
    pub backlog: bool,
    pub results: Vec<SweepRecordResult>,
}

impl SweepSummary {
    fn new(started_at: OffsetDateTime, page_size: i64, results: Vec<SweepRecordResult>) -> Self {
        let count = |f: fn(&SweepRecordResult) -> bool| results.iter().filter(|r| f(r)).count();
        let matched = results.len();

        Self {
            started_at,
            matched,
            expired: count(|r| matches!(r, SweepRecordResult::Expired { .. })),
            skipped: count(|r| matches!(r, SweepRecordResult::Skipped { .. })),
            errors: count(|r| matches!(r, SweepRecordResult::Error { .. })),
            backlog: i64::try_from(matched).is_ok_and(|m| m >= page_size),
            results,
        }
    }
}

/// Expires lapsed subscriptions, one tick at a time
pub struct ExpirySweep {
    config: BillingConfig,
    store: Arc<dyn RecordStore>,
    email: BillingEmailService,
    running: Mutex<()>,
}

impl ExpirySweep {
    pub fn new(config: BillingConfig, store: Arc<dyn RecordStore>, email: BillingEmailService) -> Self {
        Self {
            config,
            store,
            email,
            running: Mutex::new(()),
        }
    }

    /// Run one tick now
    ///
    /// Returns `Ok(None)` when another tick is still running.
    pub async fn run(&self) -> BillingResult<Option<SweepSummary>> {
        self.run_at(OffsetDateTime::now_utc()).await
    }

    /// Run one tick treating `now` as the sweep start time
    pub async fn run_at(&self, now: OffsetDateTime) -> BillingResult<Option<SweepSummary>> {
        let Ok(_tick) = self.running.try_lock() else {
            tracing::warn!("Expiry sweep already running, skipping this tick");
            return Ok(None);
        };

        let page_size = self.config.sweep_page_size;
        let lapsed = bounded(
            self.config.store_timeout,
            "lapsed subscription query",
            self.store.find_lapsed(now, page_size),
        )
        .await?;

        tracing::info!(matched = lapsed.len(), "Expiring lapsed subscriptions");

        let mut results = Vec::with_capacity(lapsed.len());
        for record in lapsed {
            results.push(self.expire_one(record, now).await);
        }

        let summary = SweepSummary::new(now, page_size, results);
        if summary.backlog {
            tracing::warn!(
                page_size = page_size,
                "Sweep page full, remaining lapsed records will be handled next tick"
            );
        }
        Ok(Some(summary))
    }

    async fn expire_one(&self, record: UserSubscriptionRecord, now: OffsetDateTime) -> SweepRecordResult {
        let email = record.email.clone();
        let transition = expire_if_lapsed(&record, now);
        let Some(next) = transition.record.as_ref() else {
            return SweepRecordResult::Skipped { email };
        };

        let written = bounded(
            self.config.store_timeout,
            "subscription expiry",
            self.store.update_if_unchanged(next, record.write_guard()),
        )
        .await;

        match written {
            Ok(WriteOutcome::Applied) => {
                tracing::info!(email = %email, "Subscription expired, user moved to free plan");
                audit_committed(next);
                let notified = match &transition.notification {
                    Some(notification) => self.email.notify(notification).await,
                    None => false,
                };
                SweepRecordResult::Expired { email, notified }
            }
            Ok(WriteOutcome::Conflict) => {
                tracing::debug!(email = %email, "Record changed since read, skipping");
                SweepRecordResult::Skipped { email }
            }
            Err(e) => SweepRecordResult::Error {
                email,
                error: e.to_string(),
            },
        }
    }
}
