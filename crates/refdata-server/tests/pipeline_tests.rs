//! End-to-end pipeline tests
//!
//! Drive the scheduler against the in-memory store with CSV snapshots served
//! from memory. Covers batching, checkpoints, failure and resume.

mod common;

use common::{csv, csv_from_rows, harness, lei, row, CsvFetcher};
use refdata_server::ingest::models::{
    FailureCategory, JobKind, JobState, ProcessingStatus,
};
use refdata_server::ingest::{IngestError, IngestStore};

#[tokio::test]
async fn test_full_run_commits_in_batches() {
    let h = harness(CsvFetcher::new(csv(10)), 3);

    let report = h.scheduler.trigger_full().await.unwrap().wait().await.unwrap();

    assert_eq!(h.store.committed_batches().await, vec![3, 3, 3, 1]);
    assert_eq!(report.batches, 4);
    assert_eq!(report.outcome.created, 10);

    let snapshot = h.latest(JobKind::Full).await;
    assert_eq!(snapshot.id, report.snapshot_id);
    assert_eq!(snapshot.processing_status, ProcessingStatus::Completed);
    assert_eq!(snapshot.processed_records, 10);
    assert_eq!(snapshot.total_records, 10);
    assert!(snapshot.total_records_final);
    assert_eq!(snapshot.failed_records, 0);
    assert_eq!(snapshot.checkpoint_key, lei(10));
    assert_eq!(snapshot.percent_complete(), 100.0);

    let job = h.store.job_status(JobKind::Full).await.unwrap();
    assert_eq!(job.status, JobState::Completed);
    assert_eq!(job.current_snapshot_id, Some(snapshot.id));
    assert!(job.last_success_at.is_some());

    assert_eq!(h.store.record_count().await, 10);
    assert_eq!(h.store.audit_count().await, 10);
}

#[tokio::test]
async fn test_replaying_a_snapshot_changes_nothing() {
    let h = harness(CsvFetcher::new(csv(10)), 4);

    h.scheduler.trigger_delta().await.unwrap().wait().await.unwrap();
    let report = h.scheduler.trigger_delta().await.unwrap().wait().await.unwrap();

    assert_eq!(report.outcome.unchanged, 10);
    assert_eq!(report.outcome.created, 0);
    assert_eq!(h.store.record_count().await, 10);
    assert_eq!(h.store.audit_count().await, 10);
}

#[tokio::test]
async fn test_delta_updates_changed_fields_only() {
    let h = harness(CsvFetcher::new(csv(3)), 10);
    h.scheduler.trigger_full().await.unwrap().wait().await.unwrap();

    h.fetcher.set_body(csv_from_rows(&[
        row(2, "Renamed Entity", "2024-02-01T00:00:00Z"),
        row(3, "Older Name", "2023-06-01T00:00:00Z"),
    ]));
    let report = h.scheduler.trigger_delta().await.unwrap().wait().await.unwrap();

    assert_eq!(report.outcome.updated, 1);
    assert_eq!(report.outcome.stale, 1);

    let renamed = h.store.get_record(&lei(2)).await.unwrap().unwrap();
    assert_eq!(renamed.record.legal_name, "Renamed Entity");
    let kept = h.store.get_record(&lei(3)).await.unwrap().unwrap();
    assert_eq!(kept.record.legal_name, "Entity 3");

    let history = h.store.audit_history(&lei(2)).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].changed["legal_name"], "Renamed Entity");
    assert!(history[1].changed.get("country").is_none());
}

#[tokio::test]
async fn test_failed_batch_then_resume_from_checkpoint() {
    let h = harness(CsvFetcher::new(csv(10)), 3);
    h.store.reject_key(lei(7)).await;

    let err = h.scheduler.trigger_full().await.unwrap().wait().await.unwrap_err();
    assert!(matches!(err, IngestError::Store(_)));

    let failed = h.latest(JobKind::Full).await;
    assert_eq!(failed.processing_status, ProcessingStatus::Failed);
    assert_eq!(failed.failure_category, Some(FailureCategory::SchemaError));
    assert_eq!(failed.checkpoint_key, lei(6));
    assert_eq!(failed.processed_records, 6);
    assert_eq!(failed.retry_count, 0);
    assert_eq!(h.store.record_count().await, 6);
    assert_eq!(
        h.store.job_status(JobKind::Full).await.unwrap().status,
        JobState::Failed
    );

    h.store.clear_rejections().await;
    let report = h.scheduler.resume(failed.id).await.unwrap().wait().await.unwrap();

    assert_eq!(report.skipped, 6);
    assert_eq!(report.outcome.created, 4);
    assert_eq!(h.store.committed_batches().await, vec![3, 3, 3, 1]);

    let done = h.latest(JobKind::Full).await;
    assert_eq!(done.id, failed.id);
    assert_eq!(done.processing_status, ProcessingStatus::Completed);
    assert_eq!(done.processed_records, 10);
    assert_eq!(done.total_records, 10);
    assert_eq!(done.checkpoint_key, lei(10));
    assert_eq!(done.retry_count, 1);
    assert_eq!(done.failure_category, None);
    assert_eq!(h.store.record_count().await, 10);
    // Nothing before the checkpoint was re-applied
    assert_eq!(h.store.audit_count().await, 10);
}

#[tokio::test]
async fn test_resume_after_crash_mid_run() {
    let h = harness(CsvFetcher::unreachable(), 4);
    let staged = h
        .stage_snapshot(JobKind::Delta, &csv(10), |s| {
            s.processing_status = ProcessingStatus::InProgress;
            s.checkpoint_key = lei(5);
            s.processed_records = 5;
            s.total_records = 5;
        })
        .await;

    let report = h.scheduler.resume(staged.id).await.unwrap().wait().await.unwrap();

    assert_eq!(report.skipped, 5);
    assert_eq!(h.store.committed_batches().await, vec![4, 1]);

    let done = h.store.get_snapshot(staged.id).await.unwrap().unwrap();
    assert_eq!(done.processing_status, ProcessingStatus::Completed);
    assert_eq!(done.processed_records, 10);
    assert_eq!(done.total_records, 10);
    assert_eq!(done.retry_count, 0);
    assert_eq!(h.fetcher.calls(), 0);
}

async fn fail_on_record_25(batch_size: usize) {
    let h = harness(CsvFetcher::new(csv(100)), batch_size);
    h.store.reject_key(lei(25)).await;

    let _ = h.scheduler.trigger_full().await.unwrap().wait().await;

    let failed = h.latest(JobKind::Full).await;
    assert_eq!(failed.processing_status, ProcessingStatus::Failed);
    assert_eq!(failed.failure_category, Some(FailureCategory::SchemaError));
    assert_eq!(failed.checkpoint_key, lei(24));
    assert_eq!(failed.processed_records, 24);
    assert_eq!(failed.retry_count, 0);
    assert!(failed.error_message.unwrap().contains(&lei(25)));
}

#[tokio::test]
async fn test_checkpoint_precedes_failing_record_with_batches_of_six() {
    fail_on_record_25(6).await;
}

#[tokio::test]
async fn test_checkpoint_precedes_failing_record_with_batches_of_one() {
    fail_on_record_25(1).await;
}

#[tokio::test]
async fn test_invalid_rows_are_counted_and_skipped() {
    let rows = vec![
        row(1, "Good One", "2024-01-01T00:00:00Z"),
        "NOTALEI,Bad Lei,,US,ACTIVE,ISSUED,2024-01-01T00:00:00Z".to_string(),
        row(3, "Good Three", "2024-01-01T00:00:00Z"),
        format!("{},Bad Country,,USA,ACTIVE,ISSUED,2024-01-01T00:00:00Z", lei(4)),
        format!("{},Bad Date,,US,ACTIVE,ISSUED,yesterday", lei(5)),
        row(6, "Good Six", "2024-01-01T00:00:00Z"),
    ];
    let h = harness(CsvFetcher::new(csv_from_rows(&rows)), 2);

    h.scheduler.trigger_delta().await.unwrap().wait().await.unwrap();

    let snapshot = h.latest(JobKind::Delta).await;
    assert_eq!(snapshot.processing_status, ProcessingStatus::Completed);
    assert_eq!(snapshot.total_records, 6);
    assert_eq!(snapshot.processed_records, 3);
    assert_eq!(snapshot.failed_records, 3);
    assert_eq!(snapshot.checkpoint_key, lei(6));
    assert_eq!(h.store.committed_batches().await, vec![2, 1]);
}

#[tokio::test]
async fn test_missing_checkpoint_is_file_corruption() {
    let h = harness(CsvFetcher::unreachable(), 5);
    let staged = h
        .stage_snapshot(JobKind::Full, &csv(5), |s| {
            s.processing_status = ProcessingStatus::Failed;
            s.failure_category = Some(FailureCategory::NetworkError);
            s.checkpoint_key = lei(99);
        })
        .await;

    let err = h.scheduler.resume(staged.id).await.unwrap().wait().await.unwrap_err();
    assert!(matches!(err, IngestError::CheckpointNotFound { .. }));

    let failed = h.store.get_snapshot(staged.id).await.unwrap().unwrap();
    assert_eq!(failed.processing_status, ProcessingStatus::Failed);
    assert_eq!(failed.failure_category, Some(FailureCategory::FileCorruption));
    assert_eq!(h.store.record_count().await, 0);

    // Corrupt snapshots are not retried
    let err = h.scheduler.resume(staged.id).await.unwrap_err();
    assert!(matches!(err, IngestError::NotRetryable { .. }));
}

#[tokio::test]
async fn test_missing_header_column_fails_the_snapshot() {
    let body = "LEI,LegalName\n5493001KJTIIGC8Y1R12,Acme\n";
    let h = harness(CsvFetcher::new(body), 5);

    let err = h.scheduler.trigger_full().await.unwrap().wait().await.unwrap_err();
    assert!(matches!(err, IngestError::FileCorruption(_)));

    let snapshot = h.latest(JobKind::Full).await;
    assert_eq!(snapshot.failure_category, Some(FailureCategory::FileCorruption));
}

#[tokio::test]
async fn test_resumed_run_refetches_missing_artifact() {
    let h = harness(CsvFetcher::new(csv(4)), 2);
    let staged = h
        .stage_snapshot(JobKind::Delta, &csv(4), |s| {
            s.processing_status = ProcessingStatus::Failed;
            s.failure_category = Some(FailureCategory::NetworkError);
            s.checkpoint_key = lei(2);
            s.processed_records = 2;
        })
        .await;
    std::fs::remove_file(&staged.artifact_path).unwrap();

    h.scheduler.resume(staged.id).await.unwrap().wait().await.unwrap();

    assert_eq!(h.fetcher.calls(), 1);
    assert!(staged.artifact_path.exists());
    let done = h.store.get_snapshot(staged.id).await.unwrap().unwrap();
    assert_eq!(done.processing_status, ProcessingStatus::Completed);
    assert_eq!(done.processed_records, 4);
}

#[tokio::test]
async fn test_stop_lands_on_batch_boundary_and_resumes() {
    let h = harness(CsvFetcher::new(csv(10)), 3);
    let scheduler = h.scheduler.clone();
    h.store
        .on_commit(move |committed| {
            if committed == 2 {
                scheduler.shutdown();
            }
        })
        .await;

    let run = h.scheduler.trigger_full().await.unwrap();
    assert!(matches!(run.wait().await, Err(IngestError::Cancelled)));
    h.scheduler.stop().await;

    let paused = h.latest(JobKind::Full).await;
    assert_eq!(paused.processing_status, ProcessingStatus::InProgress);
    assert_eq!(paused.checkpoint_key, lei(6));
    assert_eq!(paused.processed_records, 6);
    assert!(!paused.total_records_final);
    assert_eq!(h.store.committed_batches().await, vec![3, 3]);
    assert_eq!(h.store.record_count().await, 6);

    let job = h.store.job_status(JobKind::Full).await.unwrap();
    assert_eq!(job.status, JobState::Idle);
    assert_eq!(job.error_message.as_deref(), Some("cancelled"));

    let restarted = h.restart();
    let report = restarted.resume(paused.id).await.unwrap().wait().await.unwrap();

    assert_eq!(report.skipped, 6);
    assert_eq!(report.outcome.created, 4);
    assert_eq!(h.store.committed_batches().await, vec![3, 3, 3, 1]);

    let done = h.store.get_snapshot(paused.id).await.unwrap().unwrap();
    assert_eq!(done.processing_status, ProcessingStatus::Completed);
    assert_eq!(done.processed_records, 10);
    assert_eq!(done.total_records, 10);
    assert_eq!(done.checkpoint_key, lei(10));
    assert_eq!(done.retry_count, 0);
    assert_eq!(h.store.audit_count().await, 10);
}

#[tokio::test]
async fn test_refetched_artifact_with_other_content_is_corrupt() {
    let h = harness(CsvFetcher::new(csv(5)), 2);
    let staged = h
        .stage_snapshot(JobKind::Delta, &csv(4), |s| {
            s.processing_status = ProcessingStatus::Failed;
            s.failure_category = Some(FailureCategory::NetworkError);
            s.checkpoint_key = lei(2);
            s.processed_records = 2;
        })
        .await;
    std::fs::remove_file(&staged.artifact_path).unwrap();

    let err = h.scheduler.resume(staged.id).await.unwrap().wait().await.unwrap_err();
    assert!(matches!(err, IngestError::FileCorruption(_)));

    let failed = h.store.get_snapshot(staged.id).await.unwrap().unwrap();
    assert_eq!(failed.processing_status, ProcessingStatus::Failed);
    assert_eq!(failed.failure_category, Some(FailureCategory::FileCorruption));
    assert_eq!(failed.checkpoint_key, lei(2));
    assert_eq!(failed.processed_records, 2);
    assert!(!staged.artifact_path.exists());
    assert_eq!(h.store.record_count().await, 0);
    assert_eq!(
        h.store.job_status(JobKind::Delta).await.unwrap().status,
        JobState::Failed
    );
}
