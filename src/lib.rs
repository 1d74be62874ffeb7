//! magpie — batch IMAP mailbox archiver.
//!
//! Mirrors every configured account's folders to a local, self-describing
//! store: one verbatim `<UID>.eml` per message plus a JSON sidecar, written
//! atomically so the mirror is always consistent. Runs are incremental;
//! only messages missing from the local UID set are downloaded.

pub mod app;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod errors;
pub mod imap;
pub mod message;
pub mod retry;
pub mod sanitize;
pub mod storage;
pub mod types;
