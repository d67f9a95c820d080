
use chrono::{Duration, Utc};
use sqlx::PgPool;

use braid::store::StoreError;

use test_helpers::*;

#[sqlx::test]
async fn duplicate_singleton_enqueues_coalesce(pool: PgPool) {
    let store = store(pool);
    let t = Utc::now();

    let first = enqueue(
        &store,
        simple("default")
            .strand("cleanup")
            .singleton()
            .run_at(t + Duration::seconds(100)),
    )
    .await;
    let second = enqueue(
        &store,
        simple("default")
            .strand("cleanup")
            .singleton()
            .run_at(t + Duration::seconds(10)),
    )
    .await;

    // One pending row, with run_at pulled forward to the earlier request.
    assert_eq!(first.id, second.id);
    assert_eq!(
        store
            .jobs_count(braid::Flavor::Strand, Some("cleanup"))
            .await
            .expect("count"),
        1
    );
    let delta = second.run_at - (t + Duration::seconds(10));
    assert!(delta.num_milliseconds().abs() < 5, "run_at {}", second.run_at);
}

#[sqlx::test]
async fn later_singleton_does_not_push_run_at_back(pool: PgPool) {
    let store = store(pool);
    let t = Utc::now();

    enqueue(
        &store,
        simple("default")
            .strand("cleanup")
            .singleton()
            .run_at(t + Duration::seconds(10)),
    )
    .await;
    let second = enqueue(
        &store,
        simple("default")
            .strand("cleanup")
            .singleton()
            .run_at(t + Duration::seconds(100)),
    )
    .await;

    let delta = second.run_at - (t + Duration::seconds(10));
    assert!(delta.num_milliseconds().abs() < 5, "run_at {}", second.run_at);
}

#[sqlx::test]
async fn a_running_job_coexists_with_one_pending_singleton(pool: PgPool) {
    let store = store(pool);

    let running = enqueue(&store, simple("default").strand("cleanup").singleton()).await;
    assert!(store
        .lock_exclusively(running.id, "w1")
        .await
        .expect("lock"));

    // A locked job does not coalesce; a new pending row appears.
    let pending = enqueue(&store, simple("default").strand("cleanup").singleton()).await;
    assert_ne!(running.id, pending.id);

    // Further singleton enqueues coalesce with the pending row.
    let third = enqueue(&store, simple("default").strand("cleanup").singleton()).await;
    assert_eq!(pending.id, third.id);
    assert_eq!(
        store
            .jobs_count(braid::Flavor::Strand, Some("cleanup"))
            .await
            .expect("count"),
        2
    );
}

#[sqlx::test]
async fn singleton_without_strand_is_rejected(pool: PgPool) {
    let store = store(pool);
    let result = store.enqueue(simple("default").singleton()).await;
    assert!(matches!(result, Err(StoreError::SingletonWithoutStrand)));
}

#[sqlx::test]
async fn empty_queue_name_is_rejected(pool: PgPool) {
    let store = store(pool);
    let result = store.enqueue(simple("")).await;
    assert!(matches!(result, Err(StoreError::EmptyQueue)));
}
