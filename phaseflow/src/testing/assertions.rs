//! Test assertions for backfill reports.

use chrono::NaiveDate;

use crate::backfill::{BackfillReport, BackfillResult};
use crate::core::DateStatus;

/// Asserts that the backfill succeeded.
pub fn assert_backfill_succeeded(report: &BackfillReport) {
    assert!(
        report.is_success(),
        "Expected success, got {:?}\n{}",
        report.result,
        report.render_table()
    );
}

/// Asserts that `date` finished with `expected`.
pub fn assert_date_status(report: &BackfillReport, date: NaiveDate, expected: DateStatus) {
    let actual = report.outcome(date).map(|o| o.status);
    assert_eq!(
        actual,
        Some(expected),
        "Expected {} to be {}, got {:?}\n{}",
        date,
        expected,
        actual,
        report.render_table()
    );
}

/// Asserts that every reconciled date has zero unaccounted entities.
pub fn assert_fully_accounted(report: &BackfillReport) {
    for outcome in &report.outcomes {
        if let Some(reconciliation) = &outcome.reconciliation {
            assert_eq!(
                reconciliation.unaccounted, 0,
                "Expected {} to be fully accounted, unaccounted: {:?}",
                outcome.date, reconciliation.unaccounted_entities
            );
        }
    }
}

/// Asserts that the backfill was interrupted.
pub fn assert_interrupted(report: &BackfillReport) {
    assert!(
        matches!(report.result, BackfillResult::Interrupted { .. }),
        "Expected interruption, got {:?}",
        report.result
    );
}
