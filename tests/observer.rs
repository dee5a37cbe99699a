use std::time::Duration;

use futures::StreamExt;
use pdoflow::{PdoflowError, Status, WorkUnit};
use serde_json::json;
use uuid::Uuid;

use crate::helpers::with_test_db;

mod helpers;

#[tokio::test]
async fn empty_posting_is_complete_in_one_yield() {
    with_test_db(|test_db| async move {
        let utils = test_db.utils().await;
        let posted = utils
            .post_work("tests::observer", "noop", vec![])
            .await
            .expect("Failed to post empty posting");

        let percents: Vec<f64> = utils
            .poll_posting_percent(posted.posting_id)
            .await
            .expect("Posting should exist")
            .collect()
            .await;

        assert_eq!(percents, vec![100.0]);
    })
    .await;
}

#[tokio::test]
async fn unknown_posting_fails_with_not_found_on_first_read() {
    with_test_db(|test_db| async move {
        let utils = test_db.utils().await;
        let ghost = Uuid::new_v4();

        let err = utils.poll_posting(ghost).await.err().expect("must fail");
        assert!(matches!(err, PdoflowError::PostingNotFound(id) if id == ghost));

        let err = utils
            .poll_posting_percent(ghost)
            .await
            .err()
            .expect("must fail");
        assert!(matches!(err, PdoflowError::PostingNotFound(_)));

        let err = utils
            .poll_job_status_count(ghost, Status::Waiting)
            .await
            .err()
            .expect("must fail");
        assert!(matches!(err, PdoflowError::PostingNotFound(_)));

        let err = utils
            .await_for_status_threshold(
                ghost,
                Status::Done,
                |count| count > 0,
                Duration::from_millis(50),
                Some(Duration::from_millis(200)),
            )
            .await
            .err()
            .expect("must fail");
        assert!(matches!(err, PdoflowError::PostingNotFound(_)));

        let err = utils.posting(ghost).await.err().expect("must fail");
        assert!(matches!(err, PdoflowError::PostingNotFound(_)));
    })
    .await;
}

#[tokio::test]
async fn status_counts_track_the_queue() {
    with_test_db(|test_db| async move {
        let utils = test_db.utils().await;
        let posted = utils
            .post_work(
                "tests::observer",
                "noop",
                (0..3).map(|i| WorkUnit::new(vec![json!(i)])).collect(),
            )
            .await
            .expect("Failed to post work");

        let counts = utils
            .poll_job_status_count(posted.posting_id, Status::Waiting)
            .await
            .expect("Posting should exist");
        tokio::pin!(counts);
        assert_eq!(counts.next().await, Some(3));

        let done_counts = utils
            .poll_job_status_count(posted.posting_id, Status::Done)
            .await
            .expect("Posting should exist");
        tokio::pin!(done_counts);
        assert_eq!(done_counts.next().await, Some(0));
    })
    .await;
}

#[tokio::test]
async fn poll_posting_ends_on_a_terminal_snapshot() {
    with_test_db(|test_db| async move {
        let utils = test_db.utils().await;
        let posted = utils
            .post_work("tests::observer", "noop", vec![WorkUnit::new(vec![])])
            .await
            .expect("Failed to post work");

        utils
            .cancel_posting(posted.posting_id)
            .await
            .expect("Failed to cancel");

        let snapshots: Vec<_> = utils
            .poll_posting(posted.posting_id)
            .await
            .expect("Posting should exist")
            .collect()
            .await;

        assert_eq!(snapshots.len(), 1);
        assert_eq!(*snapshots[0].status(), Status::Cancelled);
    })
    .await;
}

#[tokio::test]
async fn threshold_returns_the_satisfying_count() {
    with_test_db(|test_db| async move {
        let utils = test_db.utils().await;
        let posted = utils
            .post_work(
                "tests::observer",
                "noop",
                (0..4).map(|_| WorkUnit::new(vec![])).collect(),
            )
            .await
            .expect("Failed to post work");

        let count = utils
            .await_for_status_threshold(
                posted.posting_id,
                Status::Waiting,
                |count| count >= 4,
                Duration::from_millis(50),
                Some(Duration::from_secs(5)),
            )
            .await
            .expect("Threshold should be met immediately");
        assert_eq!(count, 4);
    })
    .await;
}

#[tokio::test]
async fn threshold_honors_the_deadline() {
    with_test_db(|test_db| async move {
        let utils = test_db.utils().await;
        let posted = utils
            .post_work("tests::observer", "noop", vec![WorkUnit::new(vec![])])
            .await
            .expect("Failed to post work");

        let err = utils
            .await_for_status_threshold(
                posted.posting_id,
                Status::Done,
                |count| count > 0,
                Duration::from_millis(50),
                Some(Duration::from_millis(300)),
            )
            .await
            .err()
            .expect("No worker is running, the threshold can never be met");
        assert!(matches!(err, PdoflowError::Timeout(_)));
    })
    .await;
}

#[tokio::test]
async fn await_posting_completion_times_out_without_workers() {
    with_test_db(|test_db| async move {
        let utils = test_db.utils().await;
        let posted = utils
            .post_work("tests::observer", "noop", vec![WorkUnit::new(vec![])])
            .await
            .expect("Failed to post work");

        let err = utils
            .await_posting_completion(
                posted.posting_id,
                Duration::from_millis(50),
                Some(Duration::from_millis(300)),
            )
            .await
            .err()
            .expect("Nothing will complete this posting");
        assert!(matches!(err, PdoflowError::Timeout(_)));
    })
    .await;
}
