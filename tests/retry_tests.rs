
use chrono::Utc;
use sqlx::PgPool;

use braid::store::RescheduleOutcome;

use test_helpers::*;

#[sqlx::test]
async fn reschedule_bumps_attempts_and_backs_off(pool: PgPool) {
    let store = store(pool);
    let job = enqueue(&store, simple("default")).await;
    assert!(store.lock_exclusively(job.id, "w1").await.expect("lock"));
    let job = refetch(&store, job.id).await;

    let before = Utc::now();
    let outcome = store
        .reschedule(&job, Some("boom"))
        .await
        .expect("reschedule");
    let RescheduleOutcome::Rescheduled { run_at } = outcome else {
        panic!("expected a reschedule");
    };

    let job = refetch(&store, job.id).await;
    assert_eq!(job.attempts, 1);
    assert!(job.locked_at.is_none());
    assert!(job.locked_by.is_none());
    assert_eq!(job.last_error.as_deref(), Some("boom"));
    // One failure: run_at = now + 1^4 + 5 seconds.
    let delay = run_at - before;
    assert!(
        (5..=8).contains(&delay.num_seconds()),
        "unexpected backoff {delay}"
    );
}

#[sqlx::test]
async fn reschedule_at_the_cap_moves_to_the_failed_set(pool: PgPool) {
    let store = store(pool);
    let job = enqueue(&store, simple("default").max_attempts(1)).await;
    assert!(store.lock_exclusively(job.id, "w1").await.expect("lock"));
    let job = refetch(&store, job.id).await;

    let outcome = store
        .reschedule(&job, Some("boom"))
        .await
        .expect("reschedule");
    let RescheduleOutcome::Failed(failed) = outcome else {
        panic!("expected a permanent failure");
    };

    // The id lives in exactly one of the two tables.
    assert_eq!(failed.original_job_id, job.id);
    assert_eq!(failed.last_error.as_deref(), Some("boom"));
    assert_eq!(failed.locked_by.as_deref(), Some("w1"));
    assert!(store.get(job.id).await.expect("get").is_none());
    assert!(store
        .find_failed(job.id)
        .await
        .expect("find_failed")
        .is_some());
}

#[sqlx::test]
async fn failing_a_job_promotes_its_strand_successor(pool: PgPool) {
    let store = store(pool);
    let head = enqueue(&store, simple("default").strand("s")).await;
    let successor = enqueue(&store, simple("default").strand("s")).await;
    assert!(!successor.next_in_strand);

    store.fail_job(head.id, Some("fatal")).await.expect("fail");

    let successor = refetch(&store, successor.id).await;
    assert!(successor.next_in_strand);
    let failed = store
        .find_failed(head.id)
        .await
        .expect("find_failed")
        .expect("failed row");
    assert_eq!(failed.strand.as_deref(), Some("s"));
}

#[sqlx::test]
async fn clear_locks_releases_only_that_worker(pool: PgPool) {
    let store = store(pool);
    let mine = enqueue(&store, simple("default")).await;
    let theirs = enqueue(&store, simple("default")).await;
    assert!(store.lock_exclusively(mine.id, "w1").await.expect("lock"));
    assert!(store.lock_exclusively(theirs.id, "w2").await.expect("lock"));

    assert_eq!(store.clear_locks("w1").await.expect("clear"), 1);
    assert!(refetch(&store, mine.id).await.locked_by.is_none());
    assert_eq!(
        refetch(&store, theirs.id).await.locked_by.as_deref(),
        Some("w2")
    );
}

#[sqlx::test]
async fn running_jobs_excludes_holds(pool: PgPool) {
    let store = store(pool);
    let running = enqueue(&store, simple("default")).await;
    let held = enqueue(&store, simple("default")).await;
    assert!(store
        .lock_exclusively(running.id, "w1")
        .await
        .expect("lock"));
    store
        .bulk_update(braid::BulkAction::Hold, braid::Selector::Ids(&[held.id]))
        .await
        .expect("hold");

    let running_jobs = store.running_jobs().await.expect("running_jobs");
    let ids: Vec<i64> = running_jobs.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![running.id]);
}
