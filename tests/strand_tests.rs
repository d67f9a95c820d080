
use sqlx::PgPool;

use test_helpers::*;

#[sqlx::test]
async fn strict_strand_marks_only_the_head_eligible(pool: PgPool) {
    let store = store(pool);
    let j1 = enqueue(&store, simple("default").strand("s")).await;
    let j2 = enqueue(&store, simple("default").strand("s")).await;
    let j3 = enqueue(&store, simple("default").strand("s")).await;

    assert!(j1.next_in_strand);
    assert!(!j2.next_in_strand);
    assert!(!j3.next_in_strand);

    let available = store
        .find_available("default", None, None, 10)
        .await
        .expect("find_available");
    let ids: Vec<i64> = available.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![j1.id]);
}

#[sqlx::test]
async fn deleting_the_head_promotes_the_oldest_successor(pool: PgPool) {
    let store = store(pool);
    let j1 = enqueue(&store, simple("default").strand("s")).await;
    let j2 = enqueue(&store, simple("default").strand("s")).await;
    let j3 = enqueue(&store, simple("default").strand("s")).await;

    assert!(store.delete(j1.id).await.expect("delete"));
    assert!(refetch(&store, j2.id).await.next_in_strand);
    assert!(!refetch(&store, j3.id).await.next_in_strand);

    assert!(store.delete(j2.id).await.expect("delete"));
    assert!(refetch(&store, j3.id).await.next_in_strand);
}

#[sqlx::test]
async fn insert_then_delete_leaves_strand_state_unchanged(pool: PgPool) {
    let store = store(pool);
    let j1 = enqueue(&store, simple("default").strand("s")).await;
    let j2 = enqueue(&store, simple("default").strand("s")).await;

    let j3 = enqueue(&store, simple("default").strand("s")).await;
    assert!(!j3.next_in_strand);
    assert!(store.delete(j3.id).await.expect("delete"));

    assert!(refetch(&store, j1.id).await.next_in_strand);
    assert!(!refetch(&store, j2.id).await.next_in_strand);
}

#[sqlx::test]
async fn n_strand_keeps_eligibility_bounded(pool: PgPool) {
    let store = store(pool);
    let mut jobs = Vec::new();
    for _ in 0..6 {
        jobs.push(enqueue(&store, simple("default").strand("n").max_concurrent(3)).await);
    }
    let eligibility: Vec<bool> = jobs.iter().map(|j| j.next_in_strand).collect();
    assert_eq!(eligibility, vec![true, true, true, false, false, false]);

    // Any completion opens one slot for the oldest ineligible job.
    assert!(store.delete(jobs[1].id).await.expect("delete"));
    assert!(refetch(&store, jobs[3].id).await.next_in_strand);
    assert!(!refetch(&store, jobs[4].id).await.next_in_strand);
}

#[sqlx::test]
async fn unrelated_strands_do_not_interact(pool: PgPool) {
    let store = store(pool);
    let a1 = enqueue(&store, simple("default").strand("a")).await;
    let b1 = enqueue(&store, simple("default").strand("b")).await;
    let a2 = enqueue(&store, simple("default").strand("a")).await;

    assert!(a1.next_in_strand);
    assert!(b1.next_in_strand);
    assert!(!a2.next_in_strand);

    assert!(store.delete(b1.id).await.expect("delete"));
    assert!(!refetch(&store, a2.id).await.next_in_strand);
}

#[sqlx::test]
async fn find_available_orders_by_priority_run_at_id(pool: PgPool) {
    let store = store(pool);
    let low = enqueue(&store, simple("default").priority(10)).await;
    let high = enqueue(&store, simple("default").priority(5)).await;
    let low_later = enqueue(&store, simple("default").priority(10)).await;

    let available = store
        .find_available("default", None, None, 10)
        .await
        .expect("find_available");
    let ids: Vec<i64> = available.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![high.id, low.id, low_later.id]);

    // A shorter read is a prefix of a longer one.
    let shorter = store
        .find_available("default", None, None, 2)
        .await
        .expect("find_available");
    let shorter_ids: Vec<i64> = shorter.iter().map(|j| j.id).collect();
    assert_eq!(shorter_ids, ids[..2].to_vec());
}

#[sqlx::test]
async fn future_and_locked_jobs_are_not_available(pool: PgPool) {
    let store = store(pool);
    let future = enqueue(
        &store,
        simple("default").run_at(chrono::Utc::now() + chrono::Duration::hours(1)),
    )
    .await;
    let ready = enqueue(&store, simple("default")).await;

    assert!(store
        .lock_exclusively(ready.id, "w1")
        .await
        .expect("lock"));

    let available = store
        .find_available("default", None, None, 10)
        .await
        .expect("find_available");
    assert!(available.is_empty(), "future={} ready={}", future.id, ready.id);
}

#[sqlx::test]
async fn queue_partitions_the_ready_set(pool: PgPool) {
    let store = store(pool);
    enqueue(&store, simple("emails")).await;
    let job = enqueue(&store, simple("default")).await;

    let available = store
        .find_available("default", None, None, 10)
        .await
        .expect("find_available");
    let ids: Vec<i64> = available.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![job.id]);
}
