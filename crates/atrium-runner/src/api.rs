use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
};

use anyhow::Context;
use atrium_toolchain::PackageManager;
use axum::{
    Json, Router,
    extract::{Query, State},
    http::{Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::file_service::{self, FileNode};
use crate::git_service::{self, CommitPage, FileDiff};
use crate::orchestrator::Orchestrator;
use crate::port_alloc;

/// Control-plane state: the registry of per-project orchestrators plus the
/// globally exclusive proxy port. Constructed once at CLI entry and passed
/// in as axum state, never as an ambient global.
pub struct ControlPlane {
    orchestrators: Mutex<HashMap<PathBuf, Arc<Orchestrator>>>,
    package_manager: PackageManager,
    proxy_port: u16,
    workspace_path: PathBuf,
}

impl ControlPlane {
    pub fn new(
        proxy_port: u16,
        package_manager: PackageManager,
        workspace_path: impl Into<PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            orchestrators: Mutex::new(HashMap::new()),
            package_manager,
            proxy_port,
            workspace_path: workspace_path.into(),
        })
    }

    fn project_path(&self, project_id: &str) -> PathBuf {
        self.workspace_path.join(project_id)
    }

    /// Orchestrators are created lazily on first use and never evicted.
    async fn orchestrator(&self, project_path: PathBuf) -> Arc<Orchestrator> {
        let mut orchestrators = self.orchestrators.lock().await;
        orchestrators
            .entry(project_path.clone())
            .or_insert_with(|| Arc::new(Orchestrator::new(project_path, self.package_manager)))
            .clone()
    }

    async fn existing_orchestrator(&self, project_path: &std::path::Path) -> Option<Arc<Orchestrator>> {
        self.orchestrators.lock().await.get(project_path).cloned()
    }

    /// Only one project may own the proxy port; everything else stops first.
    /// This is a global serialization point by design.
    async fn stop_all_projects(&self) {
        let orchestrators = self.orchestrators.lock().await;
        tracing::info!("stopping all running projects");
        for (path, orch) in orchestrators.iter() {
            if orch.is_running().await {
                tracing::info!(project = %path.display(), "stopping project");
                if !orch.stop_project().await {
                    tracing::warn!(project = %path.display(), "failed to stop project");
                }
            }
        }
    }

    /// Stop-all, allocate a fresh upstream port, and restart one project.
    async fn restart_exclusive(&self, orch: &Orchestrator) -> anyhow::Result<()> {
        self.stop_all_projects().await;
        let app_port = port_alloc::find_free_port().context("failed to find free port")?;
        orch.restart_project(self.proxy_port, app_port).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(serde_json::json!({ "message": message }))).into_response()
    }
}

fn require(field: &str, name: &str) -> Result<(), ApiError> {
    if field.is_empty() {
        return Err(ApiError::BadRequest(format!("{name} is required")));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ProjectOperationRequest {
    project_id: String,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    message: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: u16,
}

#[derive(Debug, Deserialize)]
struct ProjectQuery {
    project_id: String,
}

#[derive(Debug, Serialize)]
struct CheckPreviewResponse {
    status: u16,
    healthy: bool,
}

#[derive(Debug, Serialize)]
struct LintResponse {
    message: String,
    #[serde(rename = "lintErrors")]
    lint_errors: bool,
}

#[derive(Debug, Serialize)]
struct BuildErrorResponse {
    message: String,
    #[serde(rename = "buildErrors")]
    build_errors: bool,
}

#[derive(Debug, Deserialize)]
struct AddPackageRequest {
    project_id: String,
    package_name: String,
    #[serde(default)]
    restart_server: bool,
}

#[derive(Debug, Serialize)]
struct AddPackageResponse {
    success: bool,
    message: String,
}

#[derive(Debug, Serialize)]
struct FileTreeResponse {
    root: Option<FileNode>,
}

#[derive(Debug, Deserialize)]
struct FileContentQuery {
    project_id: String,
    file_path: String,
}

#[derive(Debug, Serialize)]
struct FileContentResponse {
    content: String,
    mime_type: String,
}

#[derive(Debug, Deserialize)]
struct CommitsQuery {
    project_id: String,
    cursor: Option<String>,
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct CommitDiffQuery {
    project_id: String,
    commit_hash: String,
}

#[derive(Debug, Serialize)]
struct CommitDiffResponse {
    changes: Vec<FileDiff>,
}

#[derive(Debug, Deserialize)]
struct FileDiffQuery {
    project_id: String,
    commit_hash: String,
    file_path: String,
}

#[derive(Debug, Serialize)]
struct FileDiffResponse {
    diff: FileDiff,
}

#[derive(Debug, Deserialize)]
struct SwitchCommitRequest {
    project_id: String,
    commit_hash: String,
}

pub fn router(state: Arc<ControlPlane>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::ACCEPT, header::AUTHORIZATION, header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health))
        .route("/check-preview", get(check_preview))
        .route("/projects/start", post(start_project))
        .route("/projects/stop", post(stop_project))
        .route("/projects/lint", post(run_lint))
        .route("/projects/check-errors", post(check_build_errors))
        .route("/projects/add-package", post(add_package))
        .route("/files/tree", get(get_file_tree))
        .route("/files/content", get(get_file_content))
        .route("/git/commits", get(get_commits))
        .route("/git/commits/diff", get(get_commit_diff))
        .route("/git/commits/file_diff", get(get_file_diff))
        .route("/git/commits/switch", post(switch_commit))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: 200 })
}

async fn check_preview(
    State(cp): State<Arc<ControlPlane>>,
    Query(query): Query<ProjectQuery>,
) -> Result<Response, ApiError> {
    require(&query.project_id, "project ID")?;

    let project_path = cp.project_path(&query.project_id);
    let healthy = match cp.existing_orchestrator(&project_path).await {
        Some(orch) => orch.is_running().await,
        None => false,
    };

    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    let body = CheckPreviewResponse { status: status.as_u16(), healthy };
    Ok((status, Json(body)).into_response())
}

async fn start_project(
    State(cp): State<Arc<ControlPlane>>,
    Json(req): Json<ProjectOperationRequest>,
) -> Result<Response, ApiError> {
    require(&req.project_id, "project ID")?;

    let project_path = cp.project_path(&req.project_id);
    if !project_path.exists() {
        return Err(ApiError::BadRequest("Project directory does not exist".to_string()));
    }

    let orch = cp.orchestrator(project_path).await;
    cp.restart_exclusive(&orch)
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to start project: {e:#}")))?;

    Ok((
        StatusCode::CREATED,
        Json(MessageResponse { message: "Project started successfully".to_string() }),
    )
        .into_response())
}

async fn stop_project(
    State(cp): State<Arc<ControlPlane>>,
    Json(req): Json<ProjectOperationRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    require(&req.project_id, "project ID")?;

    let orch = cp.orchestrator(cp.project_path(&req.project_id)).await;
    if !orch.stop_project().await {
        return Err(ApiError::Internal("Failed to stop project".to_string()));
    }

    Ok(Json(MessageResponse { message: "Project stopped successfully".to_string() }))
}

async fn run_lint(
    State(cp): State<Arc<ControlPlane>>,
    Json(req): Json<ProjectOperationRequest>,
) -> Result<Json<LintResponse>, ApiError> {
    require(&req.project_id, "project ID")?;

    let orch = cp.orchestrator(cp.project_path(&req.project_id)).await;
    let (success, output) = orch.run_lint().await;
    Ok(Json(LintResponse { message: output, lint_errors: !success }))
}

async fn check_build_errors(
    State(cp): State<Arc<ControlPlane>>,
    Json(req): Json<ProjectOperationRequest>,
) -> Result<Json<BuildErrorResponse>, ApiError> {
    require(&req.project_id, "project ID")?;

    let orch = cp.orchestrator(cp.project_path(&req.project_id)).await;
    let (success, output) = orch.check_build_errors().await;
    Ok(Json(BuildErrorResponse { message: output, build_errors: !success }))
}

async fn add_package(
    State(cp): State<Arc<ControlPlane>>,
    Json(req): Json<AddPackageRequest>,
) -> Result<Json<AddPackageResponse>, ApiError> {
    require(&req.project_id, "project ID")?;
    require(&req.package_name, "package name")?;

    let orch = cp.orchestrator(cp.project_path(&req.project_id)).await;
    let (success, output) = orch.add_package(&req.package_name).await;
    let mut message = output;

    if success && req.restart_server {
        match cp.restart_exclusive(&orch).await {
            Ok(()) => message.push_str("\nServer restarted successfully with the new package."),
            Err(e) => {
                tracing::warn!(error = %e, "failed to restart project after adding package");
                message.push_str("\nWarning: Failed to restart server after package installation.");
            }
        }
    } else if success {
        message.push_str("\nServer restart was not requested.");
    }

    Ok(Json(AddPackageResponse { success, message }))
}

async fn get_file_tree(
    State(cp): State<Arc<ControlPlane>>,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<FileTreeResponse>, ApiError> {
    require(&query.project_id, "project ID")?;

    let project_path = cp.project_path(&query.project_id);
    let root = file_service::build_file_tree(&project_path)
        .map_err(|e| ApiError::Internal(format!("Failed to build file tree: {e}")))?;
    Ok(Json(FileTreeResponse { root }))
}

async fn get_file_content(
    State(cp): State<Arc<ControlPlane>>,
    Query(query): Query<FileContentQuery>,
) -> Result<Json<FileContentResponse>, ApiError> {
    require(&query.project_id, "project ID")?;
    require(&query.file_path, "file path")?;

    let project_path = cp.project_path(&query.project_id);
    let full_path = file_service::resolve_within_project(&project_path, &query.file_path)
        .ok_or_else(|| {
            ApiError::BadRequest(
                "invalid file path: attempting to access file outside project directory"
                    .to_string(),
            )
        })?;

    let metadata = match std::fs::metadata(&full_path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::BadRequest(format!("file not found: {}", query.file_path)));
        }
        Err(e) => return Err(ApiError::Internal(format!("failed to access file: {e}"))),
    };
    if metadata.is_dir() {
        return Err(ApiError::BadRequest(format!(
            "path is a directory, not a file: {}",
            query.file_path
        )));
    }

    let content = std::fs::read(&full_path)
        .map_err(|e| ApiError::Internal(format!("failed to read file: {e}")))?;

    let mime_type = file_service::detect_mime_type(&full_path, &content);
    let content = base64::engine::general_purpose::STANDARD.encode(&content);
    Ok(Json(FileContentResponse { content, mime_type }))
}

fn git_project_path(cp: &ControlPlane, project_id: &str) -> Result<PathBuf, ApiError> {
    require(project_id, "project ID")?;
    let project_path = cp.project_path(project_id);
    if !git_service::is_git_repository(&project_path) {
        return Err(ApiError::BadRequest("not a git repository".to_string()));
    }
    Ok(project_path)
}

async fn get_commits(
    State(cp): State<Arc<ControlPlane>>,
    Query(query): Query<CommitsQuery>,
) -> Result<Json<CommitPage>, ApiError> {
    let project_path = git_project_path(&cp, &query.project_id)?;

    let limit = match query.limit {
        Some(limit) if limit > 0 => limit as usize,
        _ => git_service::DEFAULT_COMMIT_LIMIT,
    };

    let page = git_service::list_commits(&project_path, query.cursor.as_deref(), limit)
        .await
        .map_err(|e| ApiError::Internal(format!("{e:#}")))?;
    Ok(Json(page))
}

async fn get_commit_diff(
    State(cp): State<Arc<ControlPlane>>,
    Query(query): Query<CommitDiffQuery>,
) -> Result<Json<CommitDiffResponse>, ApiError> {
    let project_path = git_project_path(&cp, &query.project_id)?;

    let changes = git_service::commit_diff(&project_path, &query.commit_hash)
        .await
        .map_err(|e| ApiError::Internal(format!("failed to get changed files: {e:#}")))?;
    Ok(Json(CommitDiffResponse { changes }))
}

async fn get_file_diff(
    State(cp): State<Arc<ControlPlane>>,
    Query(query): Query<FileDiffQuery>,
) -> Result<Json<FileDiffResponse>, ApiError> {
    let project_path = git_project_path(&cp, &query.project_id)?;

    let diff = git_service::file_diff(&project_path, &query.commit_hash, &query.file_path).await;
    Ok(Json(FileDiffResponse { diff }))
}

/// Resets the working tree to the given commit. This discards uncommitted
/// changes; the caller owns any confirmation flow.
async fn switch_commit(
    State(cp): State<Arc<ControlPlane>>,
    Json(req): Json<SwitchCommitRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let project_path = git_project_path(&cp, &req.project_id)?;

    git_service::reset_to_commit(&project_path, &req.commit_hash)
        .await
        .map_err(|e| ApiError::Internal(format!("failed to reset to commit: {e:#}")))?;

    Ok(Json(MessageResponse {
        message: format!("Successfully reset to commit {}", req.commit_hash),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control_plane(workspace: &std::path::Path) -> Arc<ControlPlane> {
        ControlPlane::new(3000, PackageManager::Pnpm, workspace)
    }

    #[tokio::test]
    async fn registry_reuses_orchestrators_per_project() {
        let dir = tempfile::tempdir().unwrap();
        let cp = control_plane(dir.path());

        let a = cp.orchestrator(cp.project_path("p1")).await;
        let b = cp.orchestrator(cp.project_path("p1")).await;
        let c = cp.orchestrator(cp.project_path("p2")).await;

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn check_preview_is_unhealthy_for_unknown_project() {
        let dir = tempfile::tempdir().unwrap();
        let cp = control_plane(dir.path());

        let response = check_preview(
            State(cp),
            Query(ProjectQuery { project_id: "ghost".to_string() }),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn start_rejects_missing_project_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cp = control_plane(dir.path());

        let err = start_project(
            State(cp),
            Json(ProjectOperationRequest { project_id: "nope".to_string() }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[tokio::test]
    async fn file_content_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("p1")).unwrap();
        let cp = control_plane(dir.path());

        let err = get_file_content(
            State(cp),
            Query(FileContentQuery {
                project_id: "p1".to_string(),
                file_path: "../../etc/passwd".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
        assert!(err.to_string().contains("outside project directory"));
    }

    #[tokio::test]
    async fn file_content_round_trips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("p1")).unwrap();
        let raw = b"const x = 1;\n";
        std::fs::write(dir.path().join("p1/app.ts"), raw).unwrap();
        let cp = control_plane(dir.path());

        let Json(body) = get_file_content(
            State(cp),
            Query(FileContentQuery {
                project_id: "p1".to_string(),
                file_path: "app.ts".to_string(),
            }),
        )
        .await
        .unwrap();

        let decoded = base64::engine::general_purpose::STANDARD.decode(body.content).unwrap();
        assert_eq!(decoded, raw);
    }

    #[tokio::test]
    async fn git_routes_require_a_repository() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("p1")).unwrap();
        let cp = control_plane(dir.path());

        let err = git_project_path(&cp, "p1").unwrap_err();
        assert!(err.to_string().contains("not a git repository"));
    }

    #[tokio::test]
    async fn missing_file_is_a_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("p1")).unwrap();
        let cp = control_plane(dir.path());

        let err = get_file_content(
            State(cp),
            Query(FileContentQuery {
                project_id: "p1".to_string(),
                file_path: "ghost.ts".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
        assert!(err.to_string().contains("file not found"));
    }
}
