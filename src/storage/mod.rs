//! On-disk message store.
//!
//! The layout is the index: `<root>/<account>/<folder-path>/<UID>.eml` plus a
//! `<UID>.json` sidecar, an `attachments/<UID>/` directory, and one
//! `.uidvalidity` side-file per folder. Every write goes through a temp file
//! in the same directory followed by a rename, so readers observe either the
//! previous or the committed state.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::errors::{ArchiveError, ArchiveResult};
use crate::sanitize::{resolve_under_root, sanitize_filename, split_extension};
use crate::types::MessageRecord;

const TMP_PREFIX: &str = ".tmp.";
const UIDVALIDITY_FILE: &str = ".uidvalidity";
const ATTACHMENTS_DIR: &str = "attachments";

/// Outcome of comparing the server UIDVALIDITY against the recorded one.
#[derive(Debug, PartialEq, Eq)]
pub enum Reconciliation {
    /// No token on disk yet; the folder starts (or continues) fresh.
    Fresh,
    /// Token matches; the local UID set is valid.
    Unchanged,
    /// Token changed; the old directory was quarantined and a fresh one
    /// created in its place.
    Rotated { old: u32, stale_dir: PathBuf },
}

#[derive(Debug, Default)]
pub struct SweepStats {
    pub removed_temps: u64,
    pub removed_singletons: u64,
    pub removed_attachment_dirs: u64,
}

/// Filesystem store rooted at the archive directory. All methods are
/// synchronous; the engine runs the write paths on the blocking pool.
#[derive(Clone, Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one account's folders. The display name is run
    /// through filename sanitization so it is always a single component.
    pub fn account_dir(&self, account_name: &str) -> PathBuf {
        self.root.join(sanitize_filename(account_name))
    }

    /// Resolves a folder's sanitized components under the account root,
    /// enforcing containment.
    pub fn folder_dir(&self, account_name: &str, components: &[String]) -> ArchiveResult<PathBuf> {
        let account_root = self.account_dir(account_name);
        resolve_under_root(&account_root, components)
    }

    /// UIDs present in the folder directory. A UID counts only when both
    /// `<N>.eml` and `<N>.json` exist; anything else is ignored. A missing
    /// directory is an empty folder, not an error.
    pub fn enumerate_uids(&self, folder_dir: &Path) -> ArchiveResult<BTreeSet<u32>> {
        let entries = match fs::read_dir(folder_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(ArchiveError::local_io("reading folder directory", e)),
        };

        let mut eml = BTreeSet::new();
        let mut json = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(|e| ArchiveError::local_io("reading folder entry", e))?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(".eml") {
                if let Ok(uid) = stem.parse::<u32>() {
                    eml.insert(uid);
                }
            } else if let Some(stem) = name.strip_suffix(".json") {
                if let Ok(uid) = stem.parse::<u32>() {
                    json.insert(uid);
                }
            }
        }
        Ok(eml.intersection(&json).copied().collect())
    }

    pub fn load_uidvalidity(&self, folder_dir: &Path) -> ArchiveResult<Option<u32>> {
        let path = folder_dir.join(UIDVALIDITY_FILE);
        match fs::read_to_string(&path) {
            Ok(s) => match s.trim().parse::<u32>() {
                Ok(token) => Ok(Some(token)),
                Err(_) => {
                    warn!(path = %path.display(), "unparseable uidvalidity file, treating as absent");
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ArchiveError::local_io("reading uidvalidity", e)),
        }
    }

    pub fn store_uidvalidity(&self, folder_dir: &Path, token: u32) -> ArchiveResult<()> {
        self.ensure_dir(folder_dir)?;
        self.atomic_write(&folder_dir.join(UIDVALIDITY_FILE), format!("{token}\n").as_bytes())
    }

    /// Compares the server token with the recorded one. On mismatch the
    /// whole folder directory is renamed to `<name>.stale-<old-token>` and a
    /// fresh directory takes its place; the stale copy is left for the
    /// operator. This is the sole trigger for re-downloading a folder.
    pub fn reconcile_uidvalidity(
        &self,
        folder_dir: &Path,
        server_token: u32,
    ) -> ArchiveResult<Reconciliation> {
        match self.load_uidvalidity(folder_dir)? {
            None => Ok(Reconciliation::Fresh),
            Some(old) if old == server_token => Ok(Reconciliation::Unchanged),
            Some(old) => {
                let stale_dir = self.quarantine(folder_dir, old)?;
                self.ensure_dir(folder_dir)?;
                Ok(Reconciliation::Rotated { old, stale_dir })
            }
        }
    }

    /// Persists the sidecar and then the raw message, each atomically. The
    /// `.eml` rename is the commit point for the pair; a sidecar without its
    /// message is removed by the startup sweep.
    pub fn persist_message(
        &self,
        folder_dir: &Path,
        record: &MessageRecord,
        raw: &[u8],
    ) -> ArchiveResult<()> {
        self.ensure_dir(folder_dir)?;
        let sidecar = serde_json::to_vec_pretty(record)
            .map_err(|e| ArchiveError::LocalIo(format!("encoding sidecar: {e}")))?;
        self.atomic_write(&folder_dir.join(format!("{}.json", record.uid)), &sidecar)?;
        self.atomic_write(&folder_dir.join(format!("{}.eml", record.uid)), raw)
    }

    /// Commit path for bodies that were streamed to a temp file by the IMAP
    /// client: writes the sidecar, then renames the temp into place.
    pub fn commit_streamed_message(
        &self,
        folder_dir: &Path,
        record: &MessageRecord,
        temp_path: &Path,
    ) -> ArchiveResult<()> {
        self.ensure_dir(folder_dir)?;
        let sidecar = serde_json::to_vec_pretty(record)
            .map_err(|e| ArchiveError::LocalIo(format!("encoding sidecar: {e}")))?;
        self.atomic_write(&folder_dir.join(format!("{}.json", record.uid)), &sidecar)?;

        let final_path = folder_dir.join(format!("{}.eml", record.uid));
        restrict_file_permissions(temp_path)?;
        fs::rename(temp_path, &final_path).map_err(|e| {
            let _ = fs::remove_file(temp_path);
            ArchiveError::local_io("committing streamed message", e)
        })
    }

    /// Writes one attachment under `attachments/<UID>/`, disambiguating
    /// duplicate names with `_1`, `_2`, … before the extension.
    pub fn persist_attachment(
        &self,
        folder_dir: &Path,
        uid: u32,
        name: &str,
        data: &[u8],
    ) -> ArchiveResult<String> {
        let dir = folder_dir.join(ATTACHMENTS_DIR).join(uid.to_string());
        self.ensure_dir(&dir)?;

        let base = sanitize_filename(name);
        let mut candidate = base.clone();
        let mut counter = 0u32;
        while dir.join(&candidate).exists() {
            counter += 1;
            let (stem, ext) = split_extension(&base);
            candidate = match ext {
                Some(ext) => format!("{stem}_{counter}.{ext}"),
                None => format!("{stem}_{counter}"),
            };
        }

        self.atomic_write(&dir.join(&candidate), data)?;
        Ok(candidate)
    }

    /// Pre-run cleanup: removes leftover temp files, `<UID>.eml`/`<UID>.json`
    /// singletons, and attachment directories whose message pair is gone.
    /// Runs before any worker starts, so no locking is needed.
    pub fn startup_sweep(&self) -> ArchiveResult<SweepStats> {
        let mut stats = SweepStats::default();
        if self.root.exists() {
            self.sweep_dir(&self.root, &mut stats)?;
        }
        debug!(
            temps = stats.removed_temps,
            singletons = stats.removed_singletons,
            attachment_dirs = stats.removed_attachment_dirs,
            "startup sweep finished"
        );
        Ok(stats)
    }

    fn sweep_dir(&self, dir: &Path, stats: &mut SweepStats) -> ArchiveResult<()> {
        let entries =
            fs::read_dir(dir).map_err(|e| ArchiveError::local_io("sweeping directory", e))?;

        let mut eml = BTreeSet::new();
        let mut json = BTreeSet::new();
        let mut subdirs = Vec::new();
        let mut attachments_dir = None;

        for entry in entries {
            let entry = entry.map_err(|e| ArchiveError::local_io("sweeping entry", e))?;
            let path = entry.path();
            let name = entry.file_name();
            let Some(name) = name.to_str().map(str::to_owned) else { continue };
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);

            if is_dir {
                if name == ATTACHMENTS_DIR {
                    attachments_dir = Some(path);
                } else if !name.contains(".stale-") {
                    // Quarantined folders stay exactly as the operator found them.
                    subdirs.push(path);
                }
                continue;
            }

            if name.starts_with(TMP_PREFIX) {
                fs::remove_file(&path)
                    .map_err(|e| ArchiveError::local_io("removing temp file", e))?;
                stats.removed_temps += 1;
                continue;
            }
            if let Some(stem) = name.strip_suffix(".eml") {
                if let Ok(uid) = stem.parse::<u32>() {
                    eml.insert(uid);
                }
            } else if let Some(stem) = name.strip_suffix(".json") {
                if let Ok(uid) = stem.parse::<u32>() {
                    json.insert(uid);
                }
            }
        }

        for uid in eml.symmetric_difference(&json) {
            for suffix in ["eml", "json"] {
                let orphan = dir.join(format!("{uid}.{suffix}"));
                if orphan.exists() {
                    fs::remove_file(&orphan)
                        .map_err(|e| ArchiveError::local_io("removing singleton", e))?;
                    stats.removed_singletons += 1;
                }
            }
        }

        if let Some(att_dir) = attachments_dir {
            let paired: BTreeSet<u32> = eml.intersection(&json).copied().collect();
            self.sweep_attachments(&att_dir, &paired, stats)?;
        }

        for sub in subdirs {
            self.sweep_dir(&sub, stats)?;
        }
        Ok(())
    }

    fn sweep_attachments(
        &self,
        att_dir: &Path,
        paired: &BTreeSet<u32>,
        stats: &mut SweepStats,
    ) -> ArchiveResult<()> {
        let entries =
            fs::read_dir(att_dir).map_err(|e| ArchiveError::local_io("sweeping attachments", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| ArchiveError::local_io("sweeping attachments", e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let keep = name.parse::<u32>().map(|uid| paired.contains(&uid)).unwrap_or(false);
            if !keep {
                fs::remove_dir_all(entry.path())
                    .map_err(|e| ArchiveError::local_io("removing orphan attachments", e))?;
                stats.removed_attachment_dirs += 1;
            }
        }
        Ok(())
    }

    /// Name for an in-progress streamed body inside the folder directory.
    pub fn streaming_temp_path(&self, folder_dir: &Path, uid: u32) -> PathBuf {
        folder_dir.join(format!("{TMP_PREFIX}{uid}.eml"))
    }

    pub fn ensure_dir(&self, dir: &Path) -> ArchiveResult<()> {
        fs::create_dir_all(dir).map_err(|e| ArchiveError::local_io("creating directory", e))?;
        restrict_dir_permissions(dir)
    }

    /// `write(temp) → fsync(temp) → rename(temp, final)`. The rename is the
    /// commit point; on any failure the temp file is deleted.
    fn atomic_write(&self, final_path: &Path, data: &[u8]) -> ArchiveResult<()> {
        let dir = final_path
            .parent()
            .ok_or_else(|| ArchiveError::LocalIo("write target has no parent".into()))?;
        let file_name = final_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ArchiveError::LocalIo("write target has no file name".into()))?;
        let temp_path = dir.join(format!("{TMP_PREFIX}{file_name}"));

        let result = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(data)?;
            file.sync_all()?;
            Ok(())
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path);
            return Err(ArchiveError::local_io("writing temp file", e));
        }

        restrict_file_permissions(&temp_path)?;
        fs::rename(&temp_path, final_path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            ArchiveError::local_io("committing file", e)
        })
    }

    fn quarantine(&self, folder_dir: &Path, old_token: u32) -> ArchiveResult<PathBuf> {
        let name = folder_dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ArchiveError::LocalIo("folder directory has no name".into()))?;
        let parent = folder_dir
            .parent()
            .ok_or_else(|| ArchiveError::LocalIo("folder directory has no parent".into()))?;

        let mut stale = parent.join(format!("{name}.stale-{old_token}"));
        let mut counter = 1u32;
        while stale.exists() {
            counter += 1;
            stale = parent.join(format!("{name}.stale-{old_token}.{counter}"));
        }
        fs::rename(folder_dir, &stale)
            .map_err(|e| ArchiveError::local_io("quarantining stale folder", e))?;
        Ok(stale)
    }
}

#[cfg(unix)]
fn restrict_file_permissions(path: &Path) -> ArchiveResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .map_err(|e| ArchiveError::local_io("setting file permissions", e))
}

#[cfg(unix)]
fn restrict_dir_permissions(path: &Path) -> ArchiveResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
        .map_err(|e| ArchiveError::local_io("setting directory permissions", e))
}

#[cfg(not(unix))]
fn restrict_file_permissions(_path: &Path) -> ArchiveResult<()> {
    Ok(())
}

#[cfg(not(unix))]
fn restrict_dir_permissions(_path: &Path) -> ArchiveResult<()> {
    Ok(())
}
