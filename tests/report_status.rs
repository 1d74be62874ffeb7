use std::time::Duration;

use magpie::engine::report::{
    AccountReport, ErrorEntry, FolderSummary, RunReport, RunStatus,
};
use magpie::errors::ArchiveError;

fn clean_account(name: &str, downloaded: u64) -> AccountReport {
    let mut report = AccountReport::new(name);
    report.folders.push(FolderSummary {
        folder: "INBOX".into(),
        downloaded,
        bytes: downloaded * 1024,
        ..FolderSummary::default()
    });
    report.elapsed = Duration::from_secs(1);
    report
}

#[test]
fn all_clean_accounts_mean_success() {
    let report = RunReport {
        accounts: vec![clean_account("personal", 3), clean_account("work", 0)],
        elapsed: Duration::from_secs(2),
        cancelled: false,
    };
    assert_eq!(report.status(), RunStatus::Success);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.downloaded(), 3);
}

#[test]
fn any_recorded_error_means_completed_with_errors() {
    let mut flaky = clean_account("personal", 2);
    flaky.folders[0].failed = 1;
    flaky.errors.push(ErrorEntry::new(
        "INBOX",
        Some(42),
        &ArchiveError::FetchFailed("NO: [SERVERBUG]".into()),
    ));

    let report = RunReport {
        accounts: vec![flaky, clean_account("work", 1)],
        elapsed: Duration::from_secs(2),
        cancelled: false,
    };
    assert_eq!(report.status(), RunStatus::CompletedWithErrors);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.failed(), 1);
}

#[test]
fn one_fatal_account_among_healthy_ones_is_partial() {
    let mut dead = AccountReport::new("broken");
    dead.fatal = Some("authentication failed: revoked token".into());

    let report = RunReport {
        accounts: vec![dead, clean_account("work", 5)],
        elapsed: Duration::from_secs(2),
        cancelled: false,
    };
    assert_eq!(report.status(), RunStatus::CompletedWithErrors);
    assert_eq!(report.exit_code(), 1);
}

#[test]
fn run_fails_only_when_every_account_is_fatal() {
    let mut one = AccountReport::new("a");
    one.fatal = Some("authentication failed".into());
    let mut two = AccountReport::new("b");
    two.fatal = Some("connection failed: refused".into());

    let report = RunReport {
        accounts: vec![one, two],
        elapsed: Duration::from_secs(1),
        cancelled: false,
    };
    assert_eq!(report.status(), RunStatus::Failed);
    assert_eq!(report.exit_code(), 2);
}

#[test]
fn cancellation_downgrades_success() {
    let report = RunReport {
        accounts: vec![clean_account("personal", 10)],
        elapsed: Duration::from_secs(1),
        cancelled: true,
    };
    assert_eq!(report.status(), RunStatus::CompletedWithErrors);
}

#[test]
fn error_entries_carry_scope_tags() {
    let entry = ErrorEntry::new(
        "Work/Clients",
        Some(1337),
        &ArchiveError::SizeExceeded {
            uid: 1337,
            size: 52_428_801,
            limit: 52_428_800,
        },
    );
    assert_eq!(entry.folder, "Work/Clients");
    assert_eq!(entry.uid, Some(1337));
    assert_eq!(entry.category, "size-exceeded");
    assert!(entry.detail.contains("52428801"));
}

#[test]
fn account_totals_aggregate_folders() {
    let mut report = AccountReport::new("personal");
    report.folders.push(FolderSummary {
        folder: "INBOX".into(),
        downloaded: 3,
        skipped: 1,
        failed: 1,
        bytes: 4096,
        retries: 2,
        ..FolderSummary::default()
    });
    report.folders.push(FolderSummary {
        folder: "Sent".into(),
        downloaded: 2,
        bytes: 2048,
        ..FolderSummary::default()
    });

    assert_eq!(report.downloaded(), 5);
    assert_eq!(report.skipped(), 1);
    assert_eq!(report.failed(), 1);
    assert_eq!(report.bytes(), 6144);
    assert_eq!(report.processed(), 7);
    assert!(!report.clean());
}
