//! Tests for sync and snapshot routes
//!
//! Backed by the in-memory store and a fetcher that never finishes, so a
//! triggered run stays RUNNING for the duration of a test.

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use axum::{
        body::Body,
        http::{Method, Request, StatusCode},
        Router,
    };
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::features::router;
    use crate::ingest::models::{ArtifactInfo, FailureCategory, JobKind, JobState, SnapshotFile};
    use crate::ingest::{
        IngestConfig, IngestResult, IngestStore, MemoryStore, Scheduler, SnapshotFetcher,
        SyncStatusService,
    };

    struct StalledFetcher;

    #[async_trait]
    impl SnapshotFetcher for StalledFetcher {
        async fn fetch(&self, _source_uri: &str, _dest: &Path) -> IngestResult<ArtifactInfo> {
            std::future::pending().await
        }
    }

    fn setup() -> (Router, Arc<MemoryStore>, Scheduler) {
        let store = Arc::new(MemoryStore::new());
        let config = IngestConfig {
            full_source_url: "http://localhost/full.csv.gz".to_string(),
            delta_source_url: "http://localhost/delta.csv.gz".to_string(),
            ..IngestConfig::default()
        };
        let scheduler = Scheduler::new(store.clone(), Arc::new(StalledFetcher), config);
        let service = Arc::new(SyncStatusService::new(store.clone(), scheduler.clone()));
        (router(service), store, scheduler)
    }

    fn request(method: Method, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn failed_snapshot(store: &MemoryStore, category: FailureCategory) -> Uuid {
        let snapshot = SnapshotFile::registered(
            JobKind::Delta,
            "http://localhost/delta.csv.gz",
            ArtifactInfo {
                path: PathBuf::from("/nonexistent/delta.csv"),
                sha256: "00".to_string(),
                bytes: 0,
            },
        );
        store.insert_snapshot(&snapshot).await.unwrap();
        store
            .fail_snapshot(snapshot.id, category, "boom")
            .await
            .unwrap();
        snapshot.id
    }

    #[tokio::test]
    async fn test_status_of_untouched_job_is_idle() {
        let (app, _store, _scheduler) = setup();

        let response = app
            .oneshot(request(Method::GET, "/sync/full/status"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["kind"], "full");
        assert_eq!(body["status"], "idle");
        assert!(body["snapshot"].is_null());
    }

    #[tokio::test]
    async fn test_unknown_kind_is_bad_request() {
        let (app, _store, _scheduler) = setup();

        let response = app
            .oneshot(request(Method::POST, "/sync/weekly/trigger"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"]["status"], 400);
    }

    #[tokio::test]
    async fn test_second_trigger_conflicts() {
        let (app, _store, scheduler) = setup();

        let first = app
            .clone()
            .oneshot(request(Method::POST, "/sync/delta/trigger"))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);

        let second = app
            .clone()
            .oneshot(request(Method::POST, "/sync/delta/trigger"))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);

        let status = app
            .oneshot(request(Method::GET, "/sync/delta/status"))
            .await
            .unwrap();
        assert_eq!(json_body(status).await["status"], "running");

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_get_unknown_snapshot_is_not_found() {
        let (app, _store, _scheduler) = setup();

        let response = app
            .oneshot(request(Method::GET, &format!("/snapshots/{}", Uuid::new_v4())))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_snapshot_includes_progress() {
        let (app, store, _scheduler) = setup();
        let id = failed_snapshot(&store, FailureCategory::NetworkError).await;

        let response = app
            .oneshot(request(Method::GET, &format!("/snapshots/{}", id)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["processing_status"], "failed");
        assert_eq!(body["failure_category"], "NETWORK_ERROR");
        assert_eq!(body["percent_complete"], 0.0);
    }

    #[tokio::test]
    async fn test_resume_corrupt_snapshot_is_unprocessable() {
        let (app, store, _scheduler) = setup();
        let id = failed_snapshot(&store, FailureCategory::FileCorruption).await;

        let response = app
            .oneshot(request(Method::POST, &format!("/snapshots/{}/resume", id)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(store.job_status(JobKind::Delta).await.unwrap().status, JobState::Idle);
    }

    #[tokio::test]
    async fn test_resume_unknown_snapshot_is_not_found() {
        let (app, _store, _scheduler) = setup();

        let response = app
            .oneshot(request(
                Method::POST,
                &format!("/snapshots/{}/resume", Uuid::new_v4()),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
