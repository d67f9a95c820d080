
use std::sync::Arc;

use sqlx::PgPool;

use braid::reaper::{HealthReaper, StaticLiveness};
use braid::strand::HEALTH_CHECK_LOCK_KEY;

use test_helpers::*;

fn reaper_with_live(store: braid::JobStore, live: &[&str]) -> HealthReaper {
    let oracle = StaticLiveness::new(live.iter().map(|s| s.to_string()));
    HealthReaper::new(store, Arc::new(oracle))
}

#[sqlx::test]
async fn dead_workers_lose_their_locks(pool: PgPool) {
    let store = store(pool);
    let job = enqueue(&store, simple("default")).await;
    assert!(store.lock_exclusively(job.id, "w7").await.expect("lock"));

    let reaper = reaper_with_live(store.clone(), &["w1"]);
    let stats = reaper.sweep().await.expect("sweep").expect("lock acquired");
    assert_eq!(stats.reclaimed, 1);
    assert_eq!(stats.errors, 0);

    let job = refetch(&store, job.id).await;
    assert!(job.locked_at.is_none());
    assert!(job.locked_by.is_none());
    // The interrupted attempt never reported an outcome.
    assert_eq!(job.attempts, 0);
}

#[sqlx::test]
async fn dead_worker_at_the_attempt_cap_fails_the_job(pool: PgPool) {
    let store = store(pool);
    let job = enqueue(&store, simple("default").max_attempts(5)).await;
    assert!(store.lock_exclusively(job.id, "w7").await.expect("lock"));
    sqlx::query("UPDATE delayed_jobs SET attempts = 5 WHERE id = $1")
        .bind(job.id)
        .execute(store.pool())
        .await
        .expect("set attempts");

    let reaper = reaper_with_live(store.clone(), &[]);
    let stats = reaper.sweep().await.expect("sweep").expect("lock acquired");
    assert_eq!(stats.reclaimed, 1);

    assert!(store.get(job.id).await.expect("get").is_none());
    let failed = store
        .find_failed(job.id)
        .await
        .expect("find_failed")
        .expect("failed row");
    assert_eq!(failed.attempts, 5);
}

#[sqlx::test]
async fn live_workers_keep_their_locks(pool: PgPool) {
    let store = store(pool);
    let job = enqueue(&store, simple("default")).await;
    assert!(store.lock_exclusively(job.id, "w1").await.expect("lock"));

    let reaper = reaper_with_live(store.clone(), &["w1"]);
    let stats = reaper.sweep().await.expect("sweep").expect("lock acquired");
    assert_eq!(stats.examined, 0);
    assert_eq!(stats.reclaimed, 0);
    assert_eq!(
        refetch(&store, job.id).await.locked_by.as_deref(),
        Some("w1")
    );
}

#[sqlx::test]
async fn broker_prefetches_are_left_to_their_own_sweep(pool: PgPool) {
    let store = store(pool);
    enqueue(&store, simple("default")).await;
    let locked = store
        .get_and_lock_next_available(&[], "default", None, None, 1, "prefetch:host-a")
        .await
        .expect("fetch");
    assert_eq!(locked.prefetched.len(), 1);
    let id = locked.prefetched[0].id;

    let reaper = reaper_with_live(store.clone(), &[]);
    let stats = reaper.sweep().await.expect("sweep").expect("lock acquired");
    assert_eq!(stats.examined, 0);
    assert_eq!(
        refetch(&store, id).await.locked_by.as_deref(),
        Some("prefetch:host-a")
    );
}

#[sqlx::test]
async fn concurrent_sweeps_are_serialized(pool: PgPool) {
    let store = store(pool);

    // Hold the cluster-wide lock from another session.
    let mut conn = store.pool().acquire().await.expect("acquire");
    let (held,): (bool,) =
        sqlx::query_as("SELECT pg_try_advisory_lock(half_md5_as_bigint($1))")
            .bind(HEALTH_CHECK_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await
            .expect("advisory lock");
    assert!(held);

    let reaper = reaper_with_live(store.clone(), &[]);
    let swept = reaper.sweep().await.expect("sweep");
    assert!(swept.is_none(), "sweep should be skipped while locked");

    sqlx::query("SELECT pg_advisory_unlock(half_md5_as_bigint($1))")
        .bind(HEALTH_CHECK_LOCK_KEY)
        .execute(&mut *conn)
        .await
        .expect("advisory unlock");

    assert!(reaper.sweep().await.expect("sweep").is_some());
}
