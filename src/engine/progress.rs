//! Progress reporting seam. The engine emits events; what happens to them
//! (log lines, a UI, a test recorder) is the sink's business.

use tracing::{info, warn};

use super::report::FolderSummary;

pub trait ProgressSink: Send + Sync {
    fn folder_started(&self, account: &str, folder: &str, total: usize);
    fn message_downloaded(&self, account: &str, folder: &str, uid: u32, bytes: u64);
    fn message_failed(&self, account: &str, folder: &str, uid: u32, reason: &str);
    fn folder_completed(&self, account: &str, folder: &str, summary: &FolderSummary);
}

/// Default sink: structured log lines.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn folder_started(&self, account: &str, folder: &str, total: usize) {
        info!(account, folder, missing = total, "folder pass started");
    }

    fn message_downloaded(&self, account: &str, folder: &str, uid: u32, bytes: u64) {
        info!(account, folder, uid, bytes, "message archived");
    }

    fn message_failed(&self, account: &str, folder: &str, uid: u32, reason: &str) {
        warn!(account, folder, uid, reason, "message not archived");
    }

    fn folder_completed(&self, account: &str, folder: &str, summary: &FolderSummary) {
        info!(
            account,
            folder,
            downloaded = summary.downloaded,
            skipped = summary.skipped,
            failed = summary.failed,
            bytes = summary.bytes,
            retries = summary.retries,
            "folder pass completed"
        );
    }
}
