//! The backup engine: account fan-out, per-folder UID reconciliation, and
//! the rate-limited fetch/persist pipeline.

pub mod progress;
pub mod report;

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::credentials::CredentialResolver;
use crate::errors::{ArchiveError, ArchiveResult};
use crate::imap::ImapConnection;
use crate::message::{self, ParsedMessage};
use crate::retry::{sleep_backoff, Limiter, RetryPolicy};
use crate::sanitize::sanitize_folder_components;
use crate::storage::{FileStore, Reconciliation};
use crate::types::{Account, FolderInfo, MessageMeta, MessageRecord, Tuning};

use progress::ProgressSink;
use report::{AccountReport, ErrorEntry, FolderSummary, RunReport};

const METADATA_CHUNK: usize = 200;

/// Drives one `UID FETCH`-style call with backoff. Retryable failures that
/// tore the socket get a fresh connection (re-selecting the folder when one
/// is given) before the next attempt.
macro_rules! retry_imap {
    ($engine:expr, $account:expr, $conn:expr, $folder:expr, $retries:expr, $call:expr) => {{
        let mut attempt: u32 = 1;
        loop {
            if $engine.cancel.is_cancelled() {
                break Err(ArchiveError::Cancelled);
            }
            match $call.await {
                Ok(value) => break Ok(value),
                Err(e) if e.is_retryable() && attempt < $engine.policy.max_attempts => {
                    warn!(error = %e, attempt, "retryable IMAP failure");
                    $retries += 1;
                    if let Err(stop) = sleep_backoff(&$engine.policy, attempt, &$engine.cancel).await
                    {
                        break Err(stop);
                    }
                    if e.needs_reconnect() {
                        if let Err(redial) = $engine.reconnect($account, $conn, $folder).await {
                            break Err(redial);
                        }
                    }
                    attempt += 1;
                }
                Err(e) => break Err(e),
            }
        }
    }};
}

#[derive(Clone)]
pub struct Engine {
    store: Arc<FileStore>,
    tuning: Tuning,
    policy: RetryPolicy,
    limiter: Arc<Limiter>,
    resolver: Arc<dyn CredentialResolver>,
    progress: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
    dry_run: bool,
}

impl Engine {
    pub fn new(
        store: FileStore,
        tuning: Tuning,
        resolver: Arc<dyn CredentialResolver>,
        progress: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Self {
        let policy = RetryPolicy {
            max_attempts: tuning.max_attempts.max(1),
            base_delay: Duration::from_millis(tuning.retry_base_ms),
            ..RetryPolicy::default()
        };
        let limiter = Arc::new(Limiter::new(
            tuning.global_concurrency,
            tuning.per_host_concurrency,
        ));
        Self {
            store: Arc::new(store),
            tuning,
            policy,
            limiter,
            resolver,
            progress,
            cancel,
            dry_run: false,
        }
    }

    /// Compute and report the missing UID sets without downloading or
    /// writing anything.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the whole backup: sweep, then one task per account, bounded by
    /// the limiter at fetch granularity.
    pub async fn run(&self, accounts: &[Account]) -> RunReport {
        let start = Instant::now();

        if !self.dry_run {
            if let Err(e) = self.run_store(|store| store.startup_sweep()).await {
                warn!(error = %e, "startup sweep failed");
            }
        }

        let mut set = JoinSet::new();
        for (index, account) in accounts.iter().cloned().enumerate() {
            let engine = self.clone();
            set.spawn(async move { (index, engine.backup_account(account).await) });
        }

        let mut reports: Vec<(usize, AccountReport)> = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(indexed) => reports.push(indexed),
                Err(e) => warn!(error = %e, "account task panicked"),
            }
        }
        reports.sort_by_key(|(index, _)| *index);

        RunReport {
            accounts: reports.into_iter().map(|(_, report)| report).collect(),
            elapsed: start.elapsed(),
            cancelled: self.cancel.is_cancelled(),
        }
    }

    /// Connects once and lists the folder tree; used by the CLI listing
    /// mode and shared with nothing else.
    pub async fn list_account_folders(&self, account: &Account) -> ArchiveResult<Vec<FolderInfo>> {
        let mut conn = self.establish(account).await?;
        let folders = conn.list_folders().await;
        conn.logout().await;
        folders
    }

    async fn establish(&self, account: &Account) -> ArchiveResult<ImapConnection> {
        let secret = self.resolver.resolve(account)?;
        let timeout = self.op_timeout();
        crate::retry::with_retry(&self.policy, &self.cancel, |_| {
            ImapConnection::establish(account, &secret, timeout)
        })
        .await
    }

    async fn reconnect(
        &self,
        account: &Account,
        conn: &mut ImapConnection,
        selected_folder: Option<&str>,
    ) -> ArchiveResult<()> {
        debug!(account = %account.name, "re-establishing IMAP connection");
        *conn = self.establish(account).await?;
        if let Some(folder) = selected_folder {
            conn.select(folder).await?;
        }
        Ok(())
    }

    async fn backup_account(&self, account: Account) -> AccountReport {
        let start = Instant::now();
        let mut report = AccountReport::new(&account.name);
        info!(account = %account.name, host = %account.host, "account backup started");

        let mut conn = match self.establish(&account).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(account = %account.name, error = %e, "account unreachable");
                report.fatal = Some(e.to_string());
                report.elapsed = start.elapsed();
                return report;
            }
        };

        let mut list_retries = 0u64;
        let folders =
            retry_imap!(self, &account, &mut conn, None, list_retries, conn.list_folders());
        if list_retries > 0 {
            debug!(account = %account.name, retries = list_retries, "LIST needed retries");
        }
        let folders = match folders {
            Ok(folders) => folders,
            Err(e) => {
                warn!(account = %account.name, error = %e, "LIST failed");
                report.fatal = Some(e.to_string());
                report.elapsed = start.elapsed();
                conn.logout().await;
                return report;
            }
        };

        let targets = self.select_targets(&account, &folders, &mut report);
        debug!(
            account = %account.name,
            listed = folders.len(),
            selected = targets.len(),
            "folder targets chosen"
        );

        if self.tuning.parallel_folders {
            conn.logout().await;
            self.backup_folders_parallel(&account, targets, &mut report).await;
        } else {
            self.backup_folders_sequential(&account, &mut conn, targets, &mut report).await;
            conn.logout().await;
        }

        report.elapsed = start.elapsed();
        info!(
            account = %account.name,
            downloaded = report.downloaded(),
            failed = report.failed(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "account backup finished"
        );
        report
    }

    /// Applies the include list and the `\Noselect` rule. A folder the
    /// operator asked for by name but cannot be opened is worth an error;
    /// every other non-selectable folder is silently skipped.
    fn select_targets(
        &self,
        account: &Account,
        folders: &[FolderInfo],
        report: &mut AccountReport,
    ) -> Vec<FolderInfo> {
        let mut targets = Vec::new();
        for folder in folders {
            let included =
                account.folders.is_empty() || account.folders.iter().any(|f| f == &folder.raw_name);
            if !included {
                continue;
            }
            if !folder.selectable {
                if !account.folders.is_empty() {
                    let err = ArchiveError::FolderNotSelectable(folder.raw_name.clone());
                    report.errors.push(ErrorEntry::new(&folder.raw_name, None, &err));
                } else {
                    debug!(folder = %folder.raw_name, "skipping non-selectable folder");
                }
                continue;
            }
            targets.push(folder.clone());
        }
        targets
    }

    async fn backup_folders_sequential(
        &self,
        account: &Account,
        conn: &mut ImapConnection,
        targets: Vec<FolderInfo>,
        report: &mut AccountReport,
    ) {
        for folder in targets {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.backup_folder(account, conn, &folder).await {
                Ok(mut summary) => {
                    report.errors.append(&mut summary.errors);
                    report.folders.push(summary);
                }
                Err(e) => {
                    if !self.record_folder_error(account, &folder, e, report) {
                        break;
                    }
                }
            }
        }
    }

    async fn backup_folders_parallel(
        &self,
        account: &Account,
        targets: Vec<FolderInfo>,
        report: &mut AccountReport,
    ) {
        let mut set = JoinSet::new();
        for folder in targets {
            let engine = self.clone();
            let account = account.clone();
            set.spawn(async move {
                let mut conn = match engine.establish(&account).await {
                    Ok(conn) => conn,
                    Err(e) => return (folder, Err(e)),
                };
                let result = engine.backup_folder(&account, &mut conn, &folder).await;
                conn.logout().await;
                (folder, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(mut summary))) => {
                    report.errors.append(&mut summary.errors);
                    report.folders.push(summary);
                }
                Ok((folder, Err(e))) => {
                    // In parallel mode sibling workers are already running;
                    // a fatal error marks the account and the siblings fail
                    // (or finish) on their own.
                    self.record_folder_error(account, &folder, e, report);
                }
                Err(e) => warn!(error = %e, "folder task panicked"),
            }
        }
    }

    /// Returns false when the error ends the whole account.
    fn record_folder_error(
        &self,
        account: &Account,
        folder: &FolderInfo,
        error: ArchiveError,
        report: &mut AccountReport,
    ) -> bool {
        match &error {
            ArchiveError::Cancelled => false,
            e if e.is_account_fatal() => {
                warn!(account = %account.name, folder = %folder.raw_name, error = %e, "account aborted");
                report.fatal = Some(e.to_string());
                false
            }
            e => {
                warn!(account = %account.name, folder = %folder.raw_name, error = %e, "folder skipped");
                report.errors.push(ErrorEntry::new(&folder.raw_name, None, &error));
                true
            }
        }
    }

    /// One (account, folder) pass: SELECT, reconcile UIDVALIDITY, diff the
    /// local UID set against the server's, then fetch every missing UID in
    /// ascending order. The UIDVALIDITY side-file is written only when
    /// every missing UID was at least attempted.
    async fn backup_folder(
        &self,
        account: &Account,
        conn: &mut ImapConnection,
        folder: &FolderInfo,
    ) -> ArchiveResult<FolderSummary> {
        let components = sanitize_folder_components(&folder.raw_name, folder.delimiter.as_deref())?;
        let folder_dir = self.store.folder_dir(&account.name, &components)?;
        let label = components.join("/");

        let mut summary = FolderSummary {
            folder: label.clone(),
            ..FolderSummary::default()
        };

        let selected = retry_imap!(
            self,
            account,
            conn,
            None,
            summary.retries,
            conn.select(&folder.raw_name)
        )?;
        let server_token = selected.uid_validity.unwrap_or(0);
        debug!(
            account = %account.name,
            folder = %label,
            exists = selected.exists,
            uid_next = ?selected.uid_next,
            uidvalidity = server_token,
            "folder selected"
        );

        let local_uids = self
            .reconciled_local_uids(&folder_dir, server_token, &mut summary)
            .await?;

        let raw_name = folder.raw_name.clone();
        let server_uids = retry_imap!(
            self,
            account,
            conn,
            Some(raw_name.as_str()),
            summary.retries,
            conn.search_all_uids()
        )?;

        let missing: Vec<u32> = server_uids
            .iter()
            .copied()
            .filter(|uid| !local_uids.contains(uid))
            .collect();
        self.progress.folder_started(&account.name, &label, missing.len());

        if self.dry_run {
            info!(
                account = %account.name,
                folder = %label,
                on_server = server_uids.len(),
                local = local_uids.len(),
                missing = missing.len(),
                "dry run: nothing downloaded"
            );
            summary.skipped = missing.len() as u64;
            self.progress.folder_completed(&account.name, &label, &summary);
            return Ok(summary);
        }

        let metas = self
            .fetch_all_metadata(account, conn, &raw_name, &missing, &mut summary)
            .await?;

        let mut all_attempted = true;
        for &uid in &missing {
            if self.cancel.is_cancelled() {
                all_attempted = false;
                break;
            }

            let Some(meta) = metas.get(&uid) else {
                // Vanished between SEARCH and FETCH; the next run settles it.
                debug!(uid, "no metadata returned, message gone server-side");
                summary.skipped += 1;
                continue;
            };

            if let Some(size) = meta.size {
                if size > self.tuning.max_message_bytes {
                    let err = ArchiveError::SizeExceeded {
                        uid,
                        size,
                        limit: self.tuning.max_message_bytes,
                    };
                    summary.skipped += 1;
                    report_uid_error(&mut summary, &label, uid, &err);
                    self.progress
                        .message_failed(&account.name, &label, uid, err.category());
                    continue;
                }
            }

            match self
                .fetch_and_persist(account, conn, &raw_name, &folder_dir, meta, &mut summary)
                .await
            {
                Ok(bytes) => {
                    summary.downloaded += 1;
                    summary.bytes += bytes;
                    self.progress.message_downloaded(&account.name, &label, uid, bytes);
                }
                Err(ArchiveError::Cancelled) => {
                    all_attempted = false;
                    break;
                }
                Err(e) if e.is_account_fatal() => return Err(e),
                Err(e) => {
                    summary.failed += 1;
                    report_uid_error(&mut summary, &label, uid, &e);
                    self.progress.message_failed(&account.name, &label, uid, e.category());
                }
            }
        }

        if all_attempted {
            let dir = folder_dir.clone();
            self.run_store(move |store| store.store_uidvalidity(&dir, server_token))
                .await?;
        }

        self.progress.folder_completed(&account.name, &label, &summary);
        Ok(summary)
    }

    /// Local UID set after applying the UIDVALIDITY rule. In dry-run mode
    /// nothing on disk moves; a would-be rotation just empties the set.
    async fn reconciled_local_uids(
        &self,
        folder_dir: &Path,
        server_token: u32,
        summary: &mut FolderSummary,
    ) -> ArchiveResult<BTreeSet<u32>> {
        if self.dry_run {
            let dir = folder_dir.to_path_buf();
            let stored = self.run_store(move |store| store.load_uidvalidity(&dir)).await?;
            if let Some(old) = stored {
                if old != server_token {
                    summary.rotated = true;
                    return Ok(BTreeSet::new());
                }
            }
        } else {
            let dir = folder_dir.to_path_buf();
            let outcome = self
                .run_store(move |store| store.reconcile_uidvalidity(&dir, server_token))
                .await?;
            if let Reconciliation::Rotated { old, stale_dir } = outcome {
                let rotation = ArchiveError::UidValidityChanged {
                    old,
                    new: server_token,
                };
                info!(
                    stale = %stale_dir.display(),
                    %rotation,
                    "folder quarantined, starting fresh mirror"
                );
                summary.rotated = true;
                return Ok(BTreeSet::new());
            }
        }

        let dir = folder_dir.to_path_buf();
        self.run_store(move |store| store.enumerate_uids(&dir)).await
    }

    async fn fetch_all_metadata(
        &self,
        account: &Account,
        conn: &mut ImapConnection,
        raw_name: &str,
        missing: &[u32],
        summary: &mut FolderSummary,
    ) -> ArchiveResult<HashMap<u32, MessageMeta>> {
        let mut metas = HashMap::with_capacity(missing.len());
        for chunk in missing.chunks(METADATA_CHUNK) {
            let batch = retry_imap!(
                self,
                account,
                conn,
                Some(raw_name),
                summary.retries,
                conn.fetch_metadata(chunk)
            )?;
            for meta in batch {
                metas.insert(meta.uid, meta);
            }
        }
        Ok(metas)
    }

    /// Downloads one message (buffered or streamed past the threshold) and
    /// hands it to the store together with its attachments. Holds the
    /// limiter permits for the duration of the transfer.
    async fn fetch_and_persist(
        &self,
        account: &Account,
        conn: &mut ImapConnection,
        raw_name: &str,
        folder_dir: &Path,
        meta: &MessageMeta,
        summary: &mut FolderSummary,
    ) -> ArchiveResult<u64> {
        let permit = self.limiter.acquire(&account.host, &self.cancel).await?;
        let uid = meta.uid;
        let streamed = meta
            .size
            .map(|size| size > self.tuning.streaming_threshold_bytes)
            .unwrap_or(false);

        let result = if streamed {
            let temp = self.store.streaming_temp_path(folder_dir, uid);
            retry_imap!(
                self,
                account,
                conn,
                Some(raw_name),
                summary.retries,
                conn.stream_message_to_file(uid, &temp)
            )?;
            let dir = folder_dir.to_path_buf();
            let meta = meta.clone();
            self.run_store(move |store| {
                let raw = std::fs::read(&temp)
                    .map_err(|e| ArchiveError::local_io("reading streamed body", e))?;
                let parsed = message::parse_message(&raw, meta.internal_date);
                let record = persist_side_files(store, &dir, &meta, &parsed, &raw)?;
                store.commit_streamed_message(&dir, &record, &temp)?;
                Ok(raw.len() as u64)
            })
            .await
        } else {
            let raw = retry_imap!(
                self,
                account,
                conn,
                Some(raw_name),
                summary.retries,
                conn.fetch_message(uid)
            )?;
            let dir = folder_dir.to_path_buf();
            let meta = meta.clone();
            self.run_store(move |store| {
                let parsed = message::parse_message(&raw, meta.internal_date);
                let record = persist_side_files(store, &dir, &meta, &parsed, &raw)?;
                store.persist_message(&dir, &record, &raw)?;
                Ok(raw.len() as u64)
            })
            .await
        };

        drop(permit);
        result
    }

    async fn run_store<T, F>(&self, f: F) -> ArchiveResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&FileStore) -> ArchiveResult<T> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| ArchiveError::LocalIo(format!("store task failed: {e}")))?
    }

    fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.tuning.operation_timeout_secs.max(1))
    }
}

fn report_uid_error(summary: &mut FolderSummary, label: &str, uid: u32, error: &ArchiveError) {
    debug!(folder = label, uid, error = %error, "recorded per-message error");
    summary.errors.push(ErrorEntry::new(label, Some(uid), error));
}

/// Materializes attachments first, then builds the sidecar record naming
/// exactly the files that were stored. The `.eml` write that follows is the
/// commit point for the whole group.
fn persist_side_files(
    store: &FileStore,
    folder_dir: &Path,
    meta: &MessageMeta,
    parsed: &ParsedMessage,
    raw: &[u8],
) -> ArchiveResult<MessageRecord> {
    let mut stored_names = Vec::with_capacity(parsed.attachments.len());
    for part in &parsed.attachments {
        let name = store.persist_attachment(folder_dir, meta.uid, &part.filename, &part.data)?;
        stored_names.push(name);
    }

    Ok(MessageRecord {
        uid: meta.uid,
        subject: parsed.subject.clone(),
        from: parsed.from.clone(),
        to: parsed.to.clone(),
        date: parsed.date,
        flags: meta.flags.clone(),
        headers: parsed.headers.clone(),
        attachments: stored_names,
        checksum: message::digest(raw),
        size: raw.len() as u64,
    })
}
