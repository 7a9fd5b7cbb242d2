//! HTTP query surface over the orchestrator

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::database::{BackupError, BackupMetadata, BackupOrchestrator, BackupStats, BackupType};

/// Entries returned by `GET /backups` when no limit is given
const DEFAULT_LIST_LIMIT: usize = 20;

// Shared handler state
struct AppState {
    orchestrator: Arc<BackupOrchestrator>,
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub verified: bool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

// Maps engine errors to HTTP responses
struct ApiError(BackupError);

impl From<BackupError> for ApiError {
    fn from(error: BackupError) -> Self {
        ApiError(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BackupError::BackupNotFound => StatusCode::NOT_FOUND,
            BackupError::Config(_) => StatusCode::BAD_REQUEST,
            BackupError::LockContention { .. } => StatusCode::CONFLICT,
            _ => {
                error!("request failed: {}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

// Handler for GET /backups
async fn list_backups_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> ApiResult<Vec<BackupMetadata>> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .min(state.orchestrator.config().history_limit);
    Ok(Json(state.orchestrator.list_backups(limit).await?))
}

// Handler for GET /backups/stats
async fn stats_handler(State(state): State<Arc<AppState>>) -> ApiResult<BackupStats> {
    Ok(Json(state.orchestrator.get_stats().await?))
}

// Handler for GET /backups/last
async fn last_backup_handler(State(state): State<Arc<AppState>>) -> ApiResult<BackupMetadata> {
    match state.orchestrator.last_backup().await? {
        Some(metadata) => Ok(Json(metadata)),
        None => Err(ApiError(BackupError::BackupNotFound)),
    }
}

// Handler for POST /backups/{type}; runs to completion and returns the record
async fn run_backup_handler(
    State(state): State<Arc<AppState>>,
    Path(backup_type): Path<String>,
) -> ApiResult<BackupMetadata> {
    let backup_type: BackupType = backup_type.parse()?;
    Ok(Json(state.orchestrator.run_backup(backup_type).await))
}

// Handler for POST /backups/verify-latest
async fn verify_latest_handler(State(state): State<Arc<AppState>>) -> ApiResult<VerifyResponse> {
    let verified = state.orchestrator.verify_latest_backup().await?;
    Ok(Json(VerifyResponse { verified }))
}

/// Build the API router
pub fn router(orchestrator: Arc<BackupOrchestrator>) -> Router {
    let state = Arc::new(AppState { orchestrator });

    Router::new()
        .route("/backups", get(list_backups_handler))
        .route("/backups/stats", get(stats_handler))
        .route("/backups/last", get(last_backup_handler))
        .route("/backups/verify-latest", post(verify_latest_handler))
        .route("/backups/{backup_type}", post(run_backup_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackupConfig;
    use crate::database::BackupStatus;
    use crate::database::dump::MockDumpExecutor;
    use crate::database::state::{LOCK_TTL, MemoryStateStore, StateStore};
    use crate::database::storage::MockStorageProvider;
    use crate::database::verify::MockBackupVerifier;
    use std::path::Path as FsPath;
    use tempfile::tempdir;
    use tokio::net::TcpListener;

    async fn serve(orchestrator: BackupOrchestrator) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(Arc::new(orchestrator));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn orchestrator(scratch: &FsPath, dump: MockDumpExecutor, storage: MockStorageProvider) -> BackupOrchestrator {
        let config = BackupConfig {
            scratch_dir: scratch.to_path_buf(),
            ..BackupConfig::default()
        };
        BackupOrchestrator::new(
            config,
            Arc::new(dump),
            Arc::new(storage),
            Arc::new(MockBackupVerifier::new()),
            Arc::new(MemoryStateStore::new(100)),
        )
    }

    #[tokio::test]
    async fn test_run_then_query() {
        let dir = tempdir().unwrap();
        let scratch = dir.path().to_path_buf();

        let mut dump = MockDumpExecutor::new();
        dump.expect_dump().times(1).returning(move |id, _, _| {
            let path = scratch.join(format!("{}.dump", id));
            std::fs::write(&path, b"PGDMP").unwrap();
            Ok(path)
        });
        let mut storage = MockStorageProvider::new();
        storage.expect_store_backup().times(1).returning(|_, _, _| Ok(()));

        let base = serve(orchestrator(dir.path(), dump, storage)).await;
        let client = reqwest::Client::new();

        let empty: Vec<BackupMetadata> = client
            .get(format!("{}/backups", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(empty.is_empty());

        let response = client.get(format!("{}/backups/last", base)).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

        let run: BackupMetadata = client
            .post(format!("{}/backups/incremental", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(run.status, BackupStatus::Completed);
        assert_eq!(run.backup_type, BackupType::Incremental);

        let listed: Vec<BackupMetadata> = client
            .get(format!("{}/backups?limit=5", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, run.id);

        let last: BackupMetadata = client
            .get(format!("{}/backups/last", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(last.id, run.id);

        let stats: serde_json::Value = client
            .get(format!("{}/backups/stats", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats["total"], 1);
        assert_eq!(stats["successful"], 1);
        assert_eq!(stats["successRate"], 1.0);
    }

    #[tokio::test]
    async fn test_unknown_backup_type_is_rejected() {
        let dir = tempdir().unwrap();
        let mut dump = MockDumpExecutor::new();
        dump.expect_dump().times(0);

        let base = serve(orchestrator(dir.path(), dump, MockStorageProvider::new())).await;
        let response = reqwest::Client::new()
            .post(format!("{}/backups/differential", base))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: serde_json::Value = response.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("differential"));
    }

    #[tokio::test]
    async fn test_verify_latest_without_backups() {
        let dir = tempdir().unwrap();
        let base = serve(orchestrator(dir.path(), MockDumpExecutor::new(), MockStorageProvider::new())).await;

        let body: VerifyResponse = reqwest::Client::new()
            .post(format!("{}/backups/verify-latest", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(!body.verified);
    }

    #[tokio::test]
    async fn test_verify_latest_conflicts_with_running_backup() {
        let dir = tempdir().unwrap();
        let state = Arc::new(MemoryStateStore::new(10));
        let mut full = BackupMetadata::new("1-a".into(), BackupType::Full, chrono::Utc::now());
        full.status = BackupStatus::Completed;
        full.object_key = "backups/full/a.dump".into();
        state.record_run(&full).await.unwrap();
        assert!(state.try_acquire_lock("2-running", LOCK_TTL).await.unwrap());

        let mut storage = MockStorageProvider::new();
        storage.expect_retrieve_backup().times(0);
        let orchestrator = BackupOrchestrator::new(
            BackupConfig {
                scratch_dir: dir.path().to_path_buf(),
                ..BackupConfig::default()
            },
            Arc::new(MockDumpExecutor::new()),
            Arc::new(storage),
            Arc::new(MockBackupVerifier::new()),
            state,
        );

        let base = serve(orchestrator).await;
        let response = reqwest::Client::new()
            .post(format!("{}/backups/verify-latest", base))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
        let body: serde_json::Value = response.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("2-running"));
    }
}
