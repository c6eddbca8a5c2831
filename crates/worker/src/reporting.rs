//! Log summaries for scheduled jobs

use findco_billing::{InvariantCheckSummary, SweepRecordResult, SweepSummary, ViolationSeverity};
use tracing::{error, info, warn};

/// Log results of an expiry sweep tick
///
/// Returns how many users were downgraded without their email going out.
pub fn log_sweep_results(summary: &SweepSummary) -> usize {
    let not_notified = summary
        .results
        .iter()
        .filter(|r| matches!(r, SweepRecordResult::Expired { notified: false, .. }))
        .count();

    info!(
        matched = summary.matched,
        expired = summary.expired,
        skipped = summary.skipped,
        errors = summary.errors,
        not_notified = not_notified,
        "Expiry sweep complete"
    );

    // Log individual errors
    for result in &summary.results {
        if let SweepRecordResult::Error { email, error } = result {
            error!(email = %email, error = %error, "Failed to expire subscription");
        }
    }

    not_notified
}

/// Log results of the invariant checks
pub fn log_invariant_results(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(checks_run = summary.checks_run, "All subscription invariants hold");
        return;
    }

    warn!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Subscription invariant violations found"
    );

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                user_ids = ?violation.user_ids,
                context = %violation.context,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium | ViolationSeverity::Low => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                user_ids = ?violation.user_ids,
                "{}",
                violation.description
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    #[test]
    fn test_log_sweep_results_counts_undelivered_emails() {
        let summary = SweepSummary {
            started_at: OffsetDateTime::UNIX_EPOCH,
            matched: 4,
            expired: 2,
            skipped: 1,
            errors: 1,
            backlog: false,
            results: vec![
                SweepRecordResult::Expired {
                    email: "a@x.com".to_string(),
                    notified: false,
                },
                SweepRecordResult::Expired {
                    email: "d@x.com".to_string(),
                    notified: true,
                },
                SweepRecordResult::Skipped {
                    email: "b@x.com".to_string(),
                },
                SweepRecordResult::Error {
                    email: "c@x.com".to_string(),
                    error: "Store error: timeout".to_string(),
                },
            ],
        };

        assert_eq!(log_sweep_results(&summary), 1);

        let clean = SweepSummary {
            results: vec![],
            matched: 0,
            expired: 0,
            skipped: 0,
            errors: 0,
            ..summary
        };
        assert_eq!(log_sweep_results(&clean), 0);
    }
}
