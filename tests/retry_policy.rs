use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use magpie::errors::ArchiveError;
use magpie::retry::{with_retry, Limiter, RetryPolicy};
use tokio_util::sync::CancellationToken;

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_secs(30),
    }
}

#[test]
fn backoff_doubles_with_bounded_jitter() {
    let policy = RetryPolicy {
        max_attempts: 5,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(30),
    };

    for _ in 0..50 {
        let first = policy.backoff_delay(1).as_millis() as u64;
        assert!((80..=120).contains(&first), "attempt 1 waited {first}ms");

        let second = policy.backoff_delay(2).as_millis() as u64;
        assert!((160..=240).contains(&second), "attempt 2 waited {second}ms");

        let third = policy.backoff_delay(3).as_millis() as u64;
        assert!((320..=480).contains(&third), "attempt 3 waited {third}ms");
    }
}

#[test]
fn backoff_is_capped() {
    let policy = RetryPolicy {
        max_attempts: 32,
        base_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(30),
    };
    for attempt in 1..=32 {
        assert!(policy.backoff_delay(attempt) <= Duration::from_secs(30));
    }
}

#[test]
fn taxonomy_classification() {
    let retryable = [
        ArchiveError::ConnectionFailed("dns".into()),
        ArchiveError::FetchFailed("NO: server hiccup".into()),
        ArchiveError::RateLimited("slow down".into()),
        ArchiveError::Timeout("SELECT".into()),
    ];
    for e in &retryable {
        assert!(e.is_retryable(), "{e} should be retryable");
        assert!(!e.is_account_fatal(), "{e} should not end the account");
    }

    let account_fatal = [
        ArchiveError::AuthFailed("bad password".into()),
        ArchiveError::LocalIo("disk full".into()),
    ];
    for e in &account_fatal {
        assert!(e.is_account_fatal(), "{e} should end the account");
        assert!(!e.is_retryable(), "{e} should not be retried");
    }

    let folder_fatal = [
        ArchiveError::FolderNotFound("Ghost".into()),
        ArchiveError::FolderNotSelectable("Container".into()),
        ArchiveError::PathEscape("../etc".into()),
        ArchiveError::SanitizationFailed("CON".into()),
    ];
    for e in &folder_fatal {
        assert!(e.is_folder_fatal(), "{e} should skip the folder");
        assert!(!e.is_retryable());
        assert!(!e.is_account_fatal());
    }

    let per_uid = ArchiveError::SizeExceeded {
        uid: 9,
        size: 51 * 1024 * 1024,
        limit: 50 * 1024 * 1024,
    };
    assert!(!per_uid.is_retryable());
    assert!(!per_uid.is_account_fatal());
    assert!(!per_uid.is_folder_fatal());
}

#[tokio::test]
async fn with_retry_recovers_after_transient_failures() {
    let calls = Arc::new(AtomicU32::new(0));
    let cancel = CancellationToken::new();

    let counter = calls.clone();
    let result = with_retry(&fast_policy(), &cancel, move |_attempt| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ArchiveError::FetchFailed("NO: transient".into()))
            } else {
                Ok(42u32)
            }
        }
    })
    .await;

    assert_eq!(result.unwrap(), 42);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn with_retry_gives_up_after_budget() {
    let calls = Arc::new(AtomicU32::new(0));
    let cancel = CancellationToken::new();

    let counter = calls.clone();
    let result: Result<u32, _> = with_retry(&fast_policy(), &cancel, move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(ArchiveError::ConnectionFailed("refused".into()))
        }
    })
    .await;

    assert!(matches!(result, Err(ArchiveError::ConnectionFailed(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn with_retry_does_not_retry_fatal_errors() {
    let calls = Arc::new(AtomicU32::new(0));
    let cancel = CancellationToken::new();

    let counter = calls.clone();
    let result: Result<u32, _> = with_retry(&fast_policy(), &cancel, move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(ArchiveError::AuthFailed("revoked token".into()))
        }
    })
    .await;

    assert!(matches!(result, Err(ArchiveError::AuthFailed(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn with_retry_observes_cancellation() {
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result: Result<u32, _> = with_retry(&fast_policy(), &cancel, |_| async {
        panic!("must not run after cancellation")
    })
    .await;
    assert!(matches!(result, Err(ArchiveError::Cancelled)));
}

#[tokio::test]
async fn limiter_enforces_per_host_cap() {
    let limiter = Arc::new(Limiter::new(10, 2));
    let cancel = CancellationToken::new();

    let first = limiter.acquire("imap.example.org", &cancel).await.unwrap();
    let _second = limiter.acquire("imap.example.org", &cancel).await.unwrap();

    // Third slot for the same host must wait...
    let blocked = tokio::time::timeout(
        Duration::from_millis(50),
        limiter.acquire("imap.example.org", &cancel),
    )
    .await;
    assert!(blocked.is_err(), "third acquisition should block");

    // ...while another host is unaffected.
    let _other = limiter.acquire("imap.other.org", &cancel).await.unwrap();

    drop(first);
    tokio::time::timeout(
        Duration::from_millis(200),
        limiter.acquire("imap.example.org", &cancel),
    )
    .await
    .expect("freed slot should be granted")
    .unwrap();
}

#[tokio::test]
async fn limiter_enforces_global_cap() {
    let limiter = Arc::new(Limiter::new(2, 10));
    let cancel = CancellationToken::new();

    let _a = limiter.acquire("host-a", &cancel).await.unwrap();
    let _b = limiter.acquire("host-b", &cancel).await.unwrap();

    let blocked =
        tokio::time::timeout(Duration::from_millis(50), limiter.acquire("host-c", &cancel)).await;
    assert!(blocked.is_err(), "global cap should block a third host");
}

#[tokio::test]
async fn limiter_aborts_waiters_on_cancellation() {
    let limiter = Arc::new(Limiter::new(1, 1));
    let cancel = CancellationToken::new();

    let held = limiter.acquire("host", &cancel).await.unwrap();

    let waiter = {
        let limiter = limiter.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { limiter.acquire("host", &cancel).await.map(|_| ()) })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(ArchiveError::Cancelled)));
    drop(held);
}
