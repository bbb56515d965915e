//! Scoped borrowing through `PooledConnection`.
//!
//! The guard must hand its connection back exactly once on every exit path:
//! normal scope end, explicit release, early return, `?` and panics.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use tokio_test::assert_ok;
use zilliz_connect::{Connection, ConnectionState, Error, OverflowPolicy, Pool};
use zilliz_testing::{MockFactory, RecordingTimer, init_tracing, test_config};

async fn pool(factory: &MockFactory, capacity: usize) -> Pool<MockFactory> {
    init_tracing();
    Pool::builder(test_config(), factory.clone())
        .capacity(capacity)
        .timer(RecordingTimer::new())
        .build()
        .await
        .expect("pool should build")
}

/// Let spawned check-in tasks run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test]
async fn test_drop_returns_connection() {
    let factory = MockFactory::new();
    let pool = pool(&factory, 3).await;

    {
        let conn = assert_ok!(pool.acquire().await);
        assert_eq!(conn.id(), 1);
        assert_eq!(pool.status().in_use, 1);
        assert_eq!(pool.status().available, 2);
    }

    // The borrowed count drops synchronously, the check-in follows.
    assert_eq!(pool.status().in_use, 0);
    settle().await;
    assert_eq!(pool.status().available, 3);
    assert_eq!(pool.status().created, 3);
}

#[tokio::test]
async fn test_release_waits_for_check_in() {
    let factory = MockFactory::new();
    let pool = pool(&factory, 2).await;

    let conn = assert_ok!(pool.acquire().await);
    conn.release().await;

    let status = pool.status();
    assert_eq!(status.available, 2);
    assert_eq!(status.in_use, 0);
}

#[tokio::test]
async fn test_guard_derefs_to_connection() {
    let factory = MockFactory::new();
    let pool = pool(&factory, 1).await;

    let conn = assert_ok!(pool.acquire().await);
    let info = assert_ok!(conn.probe().await);
    assert_eq!(info.resource_count(), 2);

    let meta = conn.metadata().expect("guard holds a connection");
    assert_eq!(meta.state, ConnectionState::Borrowed);
    assert_eq!(meta.checkout_count, 1);
}

#[tokio::test]
async fn test_repeated_borrows_reuse_one_connection() {
    let factory = MockFactory::new();
    let pool = pool(&factory, 1).await;

    for _ in 0..10 {
        let conn = assert_ok!(pool.acquire().await);
        assert_eq!(conn.id(), 1);
        conn.release().await;
    }

    assert_eq!(pool.status().created, 1);
    assert_eq!(pool.status().available, 1);
    assert_eq!(factory.open_calls(), 1);
}

async fn query(pool: &Pool<MockFactory>, fail: bool) -> Result<usize, Error> {
    let conn = pool.acquire().await?;
    if fail {
        conn.handle().break_connection();
    }
    let info = conn.probe().await.map_err(Error::InvalidConnection)?;
    Ok(info.resource_count())
}

#[tokio::test]
async fn test_question_mark_returns_connection() {
    let factory = MockFactory::new();
    let pool = pool(&factory, 2).await;

    assert_eq!(assert_ok!(query(&pool, false).await), 2);
    settle().await;
    assert_eq!(pool.status().available, 2);

    let err = query(&pool, true).await.unwrap_err();
    assert!(matches!(err, Error::InvalidConnection(_)));
    settle().await;

    // The broken connection was discarded, not re-enqueued.
    let status = pool.status();
    assert_eq!(status.in_use, 0);
    assert_eq!(status.available, 1);
    assert_eq!(status.discarded, 1);
}

#[tokio::test]
async fn test_panic_returns_connection() {
    let factory = MockFactory::new();
    let pool = pool(&factory, 2).await;

    let task = {
        let pool = pool.clone();
        tokio::spawn(async move {
            let conn = pool.acquire().await.unwrap();
            if conn.id() > 0 {
                panic!("borrower failed");
            }
        })
    };
    let err = task.await.unwrap_err();
    assert!(err.is_panic());

    settle().await;
    let status = pool.status();
    assert_eq!(status.in_use, 0);
    assert_eq!(status.available, 2);
}

#[tokio::test(start_paused = true)]
async fn test_acquire_timeout_with_fail_policy() {
    let factory = MockFactory::new();
    let pool = Pool::builder(test_config(), factory.clone())
        .capacity(1)
        .overflow_policy(OverflowPolicy::Fail)
        .build()
        .await
        .unwrap();

    let held = assert_ok!(pool.acquire().await);
    let err = pool
        .acquire_timeout(Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AcquisitionTimeout(_)));

    drop(held);
    settle().await;
    assert_ok!(pool.acquire_timeout(Duration::from_millis(50)).await);
}

#[tokio::test]
async fn test_guard_on_closed_pool_discards() {
    let factory = MockFactory::new();
    let pool = pool(&factory, 2).await;

    let conn = assert_ok!(pool.acquire().await);
    pool.close_all();
    conn.release().await;

    let status = pool.status();
    assert_eq!(status.available, 0);
    assert_eq!(status.discarded, 2);
}

#[tokio::test(start_paused = true)]
async fn test_drop_with_hung_connection_finishes_check_in() {
    let factory = MockFactory::new();
    let pool = pool(&factory, 1).await;

    let conn = assert_ok!(pool.acquire().await);
    conn.handle().hang();
    drop(conn);

    tokio::time::sleep(Duration::from_secs(6)).await;
    let status = pool.status();
    assert_eq!(status.in_use, 0);
    assert_eq!(status.available, 0);
    assert_eq!(status.discarded, 1);
}

#[test]
fn test_drop_outside_runtime_discards() {
    init_tracing();
    let factory = MockFactory::new();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    let (pool, conn) = runtime.block_on(async {
        let pool = pool(&factory, 2).await;
        let conn = pool.acquire().await.unwrap();
        (pool, conn)
    });
    drop(runtime);

    drop(conn);
    let status = pool.status();
    assert_eq!(status.in_use, 0);
    assert_eq!(status.available, 1);
    assert_eq!(status.discarded, 1);
}
