use std::sync::Arc;
use std::time::Duration;

use pdoflow::{JobRegistry, ShutdownController, Status, WorkUnit, WorkerOptions};
use serde_json::json;

use crate::helpers::{with_test_db, StaticCounter};

mod helpers;

fn spawn_worker(options: WorkerOptions) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        options
            .init()
            .await
            .expect("Failed to build worker")
            .run()
            .await
            .expect("Worker failed");
    })
}

#[tokio::test]
async fn failing_once_then_succeeding_consumes_one_try() {
    static ATTEMPTS: StaticCounter = StaticCounter::new();

    with_test_db(|test_db| async move {
        let mut registry = JobRegistry::new();
        registry
            .add_job("tests::retries", "flaky_once", |_args, _kwargs| async {
                if ATTEMPTS.increment().await == 1 {
                    Err("first attempt fails".to_string())
                } else {
                    Ok(())
                }
            })
            .unwrap();
        let registry = Arc::new(registry);

        let utils = test_db.utils().await;
        let posted = utils
            .post_work(
                "tests::retries",
                "flaky_once",
                vec![WorkUnit::new(vec![]).tries(3)],
            )
            .await
            .expect("Failed to post work");

        let shutdown = ShutdownController::new();
        let worker = spawn_worker(test_db.worker_options(registry, &shutdown));

        let snapshot = utils
            .await_posting_completion(
                posted.posting_id,
                Duration::from_millis(100),
                Some(Duration::from_secs(15)),
            )
            .await
            .expect("Posting should complete");
        assert_eq!(*snapshot.status(), Status::Done);

        let record = utils.job_record(posted.job_ids[0]).await.unwrap();
        assert_eq!(*record.status(), Status::Done);
        assert_eq!(*record.tries_remaining(), 2);
        assert_eq!(*record.exited_ok(), Some(true));
        assert_eq!(ATTEMPTS.get().await, 2);

        shutdown.trigger();
        worker.await.expect("Worker panicked");
    })
    .await;
}

#[tokio::test]
async fn exhausting_tries_settles_unit_and_posting_as_errored() {
    static ATTEMPTS: StaticCounter = StaticCounter::new();

    with_test_db(|test_db| async move {
        let mut registry = JobRegistry::new();
        registry
            .add_job("tests::retries", "always_fails", |_args, _kwargs| async {
                ATTEMPTS.increment().await;
                Err::<(), _>("doomed".to_string())
            })
            .unwrap();
        let registry = Arc::new(registry);

        let utils = test_db.utils().await;
        let posted = utils
            .post_work(
                "tests::retries",
                "always_fails",
                vec![WorkUnit::new(vec![]).tries(2)],
            )
            .await
            .expect("Failed to post work");

        let shutdown = ShutdownController::new();
        let worker = spawn_worker(test_db.worker_options(registry, &shutdown));

        let snapshot = utils
            .await_posting_completion(
                posted.posting_id,
                Duration::from_millis(100),
                Some(Duration::from_secs(15)),
            )
            .await
            .expect("Posting should settle");
        assert_eq!(*snapshot.status(), Status::ErroredOut);

        let record = utils.job_record(posted.job_ids[0]).await.unwrap();
        assert_eq!(*record.status(), Status::ErroredOut);
        assert_eq!(*record.tries_remaining(), 0);
        assert_eq!(*record.exited_ok(), Some(false));
        assert_eq!(ATTEMPTS.get().await, 2);

        shutdown.trigger();
        worker.await.expect("Worker panicked");
    })
    .await;
}

#[tokio::test]
async fn unresolvable_entry_point_fails_like_user_code() {
    with_test_db(|test_db| async move {
        // Nothing registered: every resolution fails.
        let registry = Arc::new(JobRegistry::new());

        let utils = test_db.utils().await;
        let posted = utils
            .post_work(
                "tests::retries",
                "not_registered",
                vec![WorkUnit::new(vec![]).tries(2)],
            )
            .await
            .expect("Failed to post work");

        let shutdown = ShutdownController::new();
        let worker = spawn_worker(test_db.worker_options(registry, &shutdown));

        let snapshot = utils
            .await_posting_completion(
                posted.posting_id,
                Duration::from_millis(100),
                Some(Duration::from_secs(15)),
            )
            .await
            .expect("Posting should settle");
        assert_eq!(*snapshot.status(), Status::ErroredOut);

        let record = utils.job_record(posted.job_ids[0]).await.unwrap();
        assert_eq!(*record.tries_remaining(), 0);

        shutdown.trigger();
        worker.await.expect("Worker panicked");
    })
    .await;
}

#[tokio::test]
async fn panicking_user_code_is_contained_and_retried() {
    static ATTEMPTS: StaticCounter = StaticCounter::new();

    with_test_db(|test_db| async move {
        let mut registry = JobRegistry::new();
        registry
            .add_job("tests::retries", "panics_once", |_args, _kwargs| async {
                if ATTEMPTS.increment().await == 1 {
                    panic!("user code exploded");
                }
                Ok::<(), String>(())
            })
            .unwrap();
        let registry = Arc::new(registry);

        let utils = test_db.utils().await;
        let posted = utils
            .post_work(
                "tests::retries",
                "panics_once",
                vec![WorkUnit::new(vec![json!("payload")]).tries(3)],
            )
            .await
            .expect("Failed to post work");

        let shutdown = ShutdownController::new();
        let worker = spawn_worker(test_db.worker_options(registry, &shutdown));

        let snapshot = utils
            .await_posting_completion(
                posted.posting_id,
                Duration::from_millis(100),
                Some(Duration::from_secs(15)),
            )
            .await
            .expect("Posting should complete");
        assert_eq!(*snapshot.status(), Status::Done);

        let record = utils.job_record(posted.job_ids[0]).await.unwrap();
        assert_eq!(*record.tries_remaining(), 2);

        shutdown.trigger();
        worker.await.expect("Worker panicked");
    })
    .await;
}

#[tokio::test]
async fn exhausted_failure_budget_blacklists_the_posting_locally() {
    with_test_db(|test_db| async move {
        let mut registry = JobRegistry::new();
        registry
            .add_job("tests::retries", "always_fails", |_args, _kwargs| async {
                Err::<(), _>("doomed".to_string())
            })
            .unwrap();
        registry
            .add_job("tests::retries", "succeeds", |_args, _kwargs| async {
                Ok::<(), String>(())
            })
            .unwrap();
        let registry = Arc::new(registry);

        let utils = test_db.utils().await;
        let doomed = utils
            .post_work(
                "tests::retries",
                "always_fails",
                (0..5).map(|_| WorkUnit::new(vec![]).tries(1)).collect(),
            )
            .await
            .expect("Failed to post work");

        let shutdown = ShutdownController::new();
        let worker = spawn_worker(
            test_db
                .worker_options(registry, &shutdown)
                .failure_budget(2),
        );

        // Two real failures exhaust the budget; the rest of the batch is
        // settled without execution.
        let snapshot = utils
            .await_posting_completion(
                doomed.posting_id,
                Duration::from_millis(100),
                Some(Duration::from_secs(15)),
            )
            .await
            .expect("Posting should settle");
        assert_eq!(*snapshot.status(), Status::ErroredOut);
        assert_eq!(
            utils
                .count_jobs(doomed.posting_id, Status::ErroredOut)
                .await
                .unwrap(),
            5
        );

        // The worker itself survives and keeps serving other postings.
        let healthy = utils
            .post_work("tests::retries", "succeeds", vec![WorkUnit::new(vec![])])
            .await
            .expect("Failed to post work");
        let snapshot = utils
            .await_posting_completion(
                healthy.posting_id,
                Duration::from_millis(100),
                Some(Duration::from_secs(15)),
            )
            .await
            .expect("Posting should complete");
        assert_eq!(*snapshot.status(), Status::Done);

        shutdown.trigger();
        worker.await.expect("Worker panicked");
    })
    .await;
}
