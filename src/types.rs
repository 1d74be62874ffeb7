use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One configured mailbox. Immutable for the duration of a run; the secret
/// itself is never stored here, only the reference by which the credential
/// resolver finds it.
#[derive(Clone, Debug, Deserialize)]
pub struct Account {
    pub name: String,
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    pub username: String,
    #[serde(default = "default_true")]
    pub tls: bool,
    #[serde(default)]
    pub auth: AuthKind,
    pub credential: CredentialRef,
    /// Optional folder include list (raw server names). Empty means all
    /// selectable folders.
    #[serde(default)]
    pub folders: Vec<String>,
}

fn default_imap_port() -> u16 {
    993
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    #[default]
    Password,
    OAuth2,
}

/// Where the account secret lives. Resolved at connect time, never persisted.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialRef {
    /// Environment variable holding the password or bearer token.
    Env(String),
    /// OS keyring entry.
    Keyring { service: String, user: String },
}

/// A folder as reported by LIST: raw name, hierarchy delimiter, attributes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FolderInfo {
    pub raw_name: String,
    pub delimiter: Option<String>,
    pub selectable: bool,
    pub role: FolderRole,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FolderRole {
    Inbox,
    Sent,
    Drafts,
    Trash,
    Junk,
    Archive,
    #[default]
    Regular,
}

impl FolderRole {
    /// Maps an IMAP special-use attribute (e.g. `\Sent`) to a role.
    pub fn from_special_use(attr: &str) -> Option<Self> {
        match attr {
            "\\Sent" => Some(FolderRole::Sent),
            "\\Drafts" => Some(FolderRole::Drafts),
            "\\Trash" => Some(FolderRole::Trash),
            "\\Junk" => Some(FolderRole::Junk),
            "\\All" | "\\Archive" => Some(FolderRole::Archive),
            _ => None,
        }
    }
}

/// Header-level summary of one message, fetched without the body. Enough to
/// apply the size ceiling and to build the sidecar once the body arrives.
#[derive(Clone, Debug)]
pub struct MessageMeta {
    pub uid: u32,
    pub flags: Vec<String>,
    pub size: Option<u32>,
    pub internal_date: Option<DateTime<Utc>>,
}

/// The sidecar record persisted as `<UID>.json` next to `<UID>.eml`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRecord {
    pub uid: u32,
    pub subject: String,
    pub from: String,
    pub to: String,
    pub date: Option<DateTime<Utc>>,
    pub flags: Vec<String>,
    pub headers: BTreeMap<String, Vec<String>>,
    pub attachments: Vec<String>,
    pub checksum: String,
    pub size: u64,
}

/// Tuning knobs shared by the engine, the retry layer and the IMAP client.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Tuning {
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub operation_timeout_secs: u64,
    pub streaming_threshold_bytes: u32,
    pub max_message_bytes: u32,
    pub parallel_folders: bool,
    pub run_timeout_secs: Option<u64>,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            global_concurrency: 5,
            per_host_concurrency: 2,
            max_attempts: 3,
            retry_base_ms: 500,
            operation_timeout_secs: 60,
            streaming_threshold_bytes: 10 * 1024 * 1024,
            max_message_bytes: 50 * 1024 * 1024,
            parallel_folders: false,
            run_timeout_secs: None,
        }
    }
}
