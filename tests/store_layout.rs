use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use magpie::message;
use magpie::storage::{FileStore, Reconciliation};
use magpie::types::MessageRecord;

fn record(uid: u32, raw: &[u8]) -> MessageRecord {
    MessageRecord {
        uid,
        subject: "hello".into(),
        from: "Alice <alice@example.org>".into(),
        to: "bob@example.org".into(),
        date: None,
        flags: vec!["\\Seen".into()],
        headers: BTreeMap::new(),
        attachments: Vec::new(),
        checksum: message::digest(raw),
        size: raw.len() as u64,
    }
}

fn folder(store: &FileStore) -> std::path::PathBuf {
    store.root().join("personal").join("INBOX")
}

#[test]
fn enumerate_admits_only_complete_pairs() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FileStore::new(tmp.path());
    let dir = folder(&store);
    fs::create_dir_all(&dir).unwrap();

    fs::write(dir.join("1.eml"), b"raw").unwrap();
    fs::write(dir.join("1.json"), b"{}").unwrap();
    fs::write(dir.join("2.eml"), b"raw").unwrap();
    fs::write(dir.join("3.json"), b"{}").unwrap();
    fs::write(dir.join("notanumber.eml"), b"raw").unwrap();
    fs::write(dir.join("notanumber.json"), b"{}").unwrap();

    let uids = store.enumerate_uids(&dir).unwrap();
    assert_eq!(uids.into_iter().collect::<Vec<_>>(), vec![1]);
}

#[test]
fn enumerate_missing_directory_is_empty() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FileStore::new(tmp.path());
    let uids = store.enumerate_uids(&folder(&store)).unwrap();
    assert!(uids.is_empty());
}

#[test]
fn uidvalidity_roundtrip_and_format() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FileStore::new(tmp.path());
    let dir = folder(&store);

    assert_eq!(store.load_uidvalidity(&dir).unwrap(), None);
    store.store_uidvalidity(&dir, 1000).unwrap();
    assert_eq!(store.load_uidvalidity(&dir).unwrap(), Some(1000));

    let raw = fs::read_to_string(dir.join(".uidvalidity")).unwrap();
    assert_eq!(raw, "1000\n");
}

#[test]
fn reconcile_rotates_on_token_change() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FileStore::new(tmp.path());
    let dir = folder(&store);

    // Fresh folder, then an unchanged pass.
    assert_eq!(store.reconcile_uidvalidity(&dir, 1000).unwrap(), Reconciliation::Fresh);
    store.store_uidvalidity(&dir, 1000).unwrap();
    let raw = b"Subject: x\r\n\r\nbody\r\n";
    store.persist_message(&dir, &record(1, raw), raw).unwrap();
    store.persist_message(&dir, &record(2, raw), raw).unwrap();
    store.persist_message(&dir, &record(3, raw), raw).unwrap();
    assert_eq!(
        store.reconcile_uidvalidity(&dir, 1000).unwrap(),
        Reconciliation::Unchanged
    );

    // Server rotated: the old mirror is quarantined untouched, the live
    // directory starts over.
    match store.reconcile_uidvalidity(&dir, 2000).unwrap() {
        Reconciliation::Rotated { old, stale_dir } => {
            assert_eq!(old, 1000);
            assert_eq!(stale_dir, store.root().join("personal").join("INBOX.stale-1000"));
            let stale_uids = store.enumerate_uids(&stale_dir).unwrap();
            assert_eq!(stale_uids.into_iter().collect::<Vec<_>>(), vec![1, 2, 3]);
            assert_eq!(
                fs::read_to_string(stale_dir.join(".uidvalidity")).unwrap(),
                "1000\n"
            );
        }
        other => panic!("expected rotation, got {other:?}"),
    }
    assert!(store.enumerate_uids(&dir).unwrap().is_empty());
}

#[test]
fn persist_message_writes_pair_with_matching_checksum() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FileStore::new(tmp.path());
    let dir = folder(&store);

    let raw = b"Subject: hi\r\n\r\nhello world\r\n";
    let rec = record(7, raw);
    store.persist_message(&dir, &rec, raw).unwrap();

    let stored_raw = fs::read(dir.join("7.eml")).unwrap();
    assert_eq!(stored_raw, raw);

    let sidecar: MessageRecord =
        serde_json::from_slice(&fs::read(dir.join("7.json")).unwrap()).unwrap();
    assert_eq!(sidecar, rec);
    assert_eq!(sidecar.checksum, message::digest(&stored_raw));

    // No temp residue after a successful commit.
    assert!(!dir_has_temp_files(&dir));
}

#[cfg(unix)]
#[test]
fn persisted_files_are_private() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = tempfile::tempdir().unwrap();
    let store = FileStore::new(tmp.path());
    let dir = folder(&store);

    let raw = b"Subject: x\r\n\r\nbody\r\n";
    store.persist_message(&dir, &record(1, raw), raw).unwrap();

    let file_mode = fs::metadata(dir.join("1.eml")).unwrap().permissions().mode() & 0o777;
    assert_eq!(file_mode, 0o600);
    let dir_mode = fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
    assert_eq!(dir_mode, 0o700);
}

#[test]
fn attachment_collisions_get_numeric_suffixes() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FileStore::new(tmp.path());
    let dir = folder(&store);

    let first = store.persist_attachment(&dir, 4, "report.pdf", b"one").unwrap();
    let second = store.persist_attachment(&dir, 4, "report.pdf", b"two").unwrap();
    let third = store.persist_attachment(&dir, 4, "report.pdf", b"three").unwrap();
    assert_eq!(first, "report.pdf");
    assert_eq!(second, "report_1.pdf");
    assert_eq!(third, "report_2.pdf");

    let att_dir = dir.join("attachments").join("4");
    assert_eq!(fs::read(att_dir.join("report.pdf")).unwrap(), b"one");
    assert_eq!(fs::read(att_dir.join("report_1.pdf")).unwrap(), b"two");
    assert_eq!(fs::read(att_dir.join("report_2.pdf")).unwrap(), b"three");

    // Extension-less names get the suffix at the end.
    let first = store.persist_attachment(&dir, 4, "README", b"a").unwrap();
    let second = store.persist_attachment(&dir, 4, "README", b"b").unwrap();
    assert_eq!(first, "README");
    assert_eq!(second, "README_1");
}

#[test]
fn hostile_attachment_names_are_confined() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FileStore::new(tmp.path());
    let dir = folder(&store);

    let stored = store
        .persist_attachment(&dir, 9, "../../escape.sh", b"#!/bin/sh")
        .unwrap();
    assert_eq!(stored, ".._.._escape.sh");
    assert!(dir.join("attachments").join("9").join(&stored).is_file());
    assert!(!tmp.path().join("escape.sh").exists());
}

#[test]
fn startup_sweep_removes_partial_state() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FileStore::new(tmp.path());
    let dir = folder(&store);
    fs::create_dir_all(&dir).unwrap();

    // A healthy pair with attachments survives.
    let raw = b"Subject: keep\r\n\r\nok\r\n";
    store.persist_message(&dir, &record(9, raw), raw).unwrap();
    store.persist_attachment(&dir, 9, "a.txt", b"data").unwrap();
    store.store_uidvalidity(&dir, 42).unwrap();

    // Partial state: interrupted temp writes, singletons, orphan attachments.
    fs::write(dir.join(".tmp.5.eml"), b"partial").unwrap();
    fs::write(dir.join("7.eml"), b"no sidecar").unwrap();
    fs::write(dir.join("8.json"), b"{}").unwrap();
    fs::create_dir_all(dir.join("attachments").join("7")).unwrap();
    fs::write(dir.join("attachments").join("7").join("x.bin"), b"x").unwrap();

    let stats = store.startup_sweep().unwrap();
    assert_eq!(stats.removed_temps, 1);
    assert_eq!(stats.removed_singletons, 2);
    assert_eq!(stats.removed_attachment_dirs, 1);

    assert!(!dir.join(".tmp.5.eml").exists());
    assert!(!dir.join("7.eml").exists());
    assert!(!dir.join("8.json").exists());
    assert!(!dir.join("attachments").join("7").exists());

    assert!(dir.join("9.eml").exists());
    assert!(dir.join("9.json").exists());
    assert!(dir.join("attachments").join("9").join("a.txt").exists());
    assert_eq!(store.load_uidvalidity(&dir).unwrap(), Some(42));
}

#[test]
fn startup_sweep_leaves_quarantined_folders_alone() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FileStore::new(tmp.path());
    let stale = store.root().join("personal").join("INBOX.stale-1000");
    fs::create_dir_all(&stale).unwrap();
    fs::write(stale.join(".tmp.1.eml"), b"partial").unwrap();
    fs::write(stale.join("2.eml"), b"singleton").unwrap();

    store.startup_sweep().unwrap();

    assert!(stale.join(".tmp.1.eml").exists());
    assert!(stale.join("2.eml").exists());
}

#[test]
fn streamed_commit_matches_buffered_layout() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FileStore::new(tmp.path());
    let dir = folder(&store);
    fs::create_dir_all(&dir).unwrap();

    let raw = b"Subject: big\r\n\r\nlarge body\r\n";
    let temp = store.streaming_temp_path(&dir, 11);
    fs::write(&temp, raw).unwrap();

    store.commit_streamed_message(&dir, &record(11, raw), &temp).unwrap();

    assert!(!temp.exists());
    assert_eq!(fs::read(dir.join("11.eml")).unwrap(), raw);
    assert!(dir.join("11.json").exists());
}

fn dir_has_temp_files(dir: &Path) -> bool {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .any(|e| e.file_name().to_string_lossy().starts_with(".tmp."))
}
