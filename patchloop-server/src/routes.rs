//! HTTP route handlers for the JSON API.

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use patchloop::core::types::{Event, Project, Task, TaskState};
use patchloop::io::store::StoreError;
use patchloop::service::{CreateProject, Service, SubmitTask};

use crate::sse;
use crate::state::AppState;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/projects", post(create_project).get(list_projects))
        .route("/projects/{id}", get(get_project))
        .route("/tasks", post(submit_task).get(list_tasks))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/cancel", post(cancel_task))
        .route("/tasks/{id}/events", get(list_events))
        .route("/tasks/{id}/stream", get(sse::stream_handler))
}

/// JSON error body with a status derived from the failure.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let status = match err.downcast_ref::<StoreError>() {
            Some(StoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Some(StoreError::InvalidInput(_)) => StatusCode::BAD_REQUEST,
            Some(StoreError::DuplicateProject(_) | StoreError::TerminalTask { .. }) => {
                StatusCode::CONFLICT
            }
            Some(_) => StatusCode::INTERNAL_SERVER_ERROR,
            // Validation and git setup failures raised by the service.
            None => StatusCode::UNPROCESSABLE_ENTITY,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %format!("{err:#}"), "request failed");
        }
        Self::new(status, format!("{err:#}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Run a synchronous service call on the blocking pool.
pub async fn blocking<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Service) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let service = state.service.clone();
    tokio::task::spawn_blocking(move || f(&service))
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(ApiError::from)
}

async fn health() -> &'static str {
    "ok"
}

/// POST /api/projects - register a project.
async fn create_project(
    State(state): State<AppState>,
    Json(request): Json<CreateProject>,
) -> Result<(StatusCode, Json<Project>), ApiError> {
    let project = blocking(&state, move |s| s.create_project(request)).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn list_projects(State(state): State<AppState>) -> Result<Json<Vec<Project>>, ApiError> {
    Ok(Json(blocking(&state, Service::list_projects).await?))
}

/// GET /api/projects/{id} - by id or name.
async fn get_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Project>, ApiError> {
    Ok(Json(blocking(&state, move |s| s.get_project(&id)).await?))
}

/// POST /api/tasks - queue a task.
async fn submit_task(
    State(state): State<AppState>,
    Json(request): Json<SubmitTask>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let task = blocking(&state, move |s| s.submit_task(request)).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

#[derive(Debug, Default, Deserialize)]
struct TaskQuery {
    state: Option<String>,
    project: Option<String>,
}

/// GET /api/tasks?state=&project= - tasks in creation order.
async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TaskQuery>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let filter = match query.state.as_deref() {
        Some(raw) => Some(TaskState::parse(raw).ok_or_else(|| {
            ApiError::new(StatusCode::BAD_REQUEST, format!("unknown task state `{raw}`"))
        })?),
        None => None,
    };
    let tasks = blocking(&state, move |s| s.list_tasks(filter, query.project.as_deref())).await?;
    Ok(Json(tasks))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(blocking(&state, move |s| s.get_task(&id)).await?))
}

/// POST /api/tasks/{id}/cancel
async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(blocking(&state, move |s| s.cancel_task(&id)).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct AfterQuery {
    #[serde(default)]
    pub after: i64,
}

/// GET /api/tasks/{id}/events?after=N - events with seq > N.
async fn list_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<AfterQuery>,
) -> Result<Json<Vec<Event>>, ApiError> {
    Ok(Json(
        blocking(&state, move |s| s.events(&id, query.after)).await?,
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use patchloop::io::store::TaskStore;
    use patchloop::test_support::{TestRepo, test_config};

    use super::*;

    fn app(repo: &TestRepo) -> Router {
        let store = Arc::new(TaskStore::open_in_memory().expect("store"));
        let workspaces = repo.scratch_dir("workspaces").expect("workspaces");
        let state = AppState::new(Service::new(store, test_config(), workspaces));
        Router::new().nest("/api", api_router()).with_state(state)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn register(app: &Router, repo: &TestRepo) {
        let (status, _) = send(
            app,
            "POST",
            "/api/projects",
            Some(json!({ "name": "demo", "path": repo.path() })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn health_is_ok() {
        let repo = TestRepo::new().expect("repo");
        let response = app(&repo)
            .oneshot(Request::get("/api/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn projects_can_be_registered_and_fetched() {
        let repo = TestRepo::new().expect("repo");
        let app = app(&repo);
        register(&app, &repo).await;

        let (status, list) = send(&app, "GET", "/api/projects", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().map(Vec::len), Some(1));

        let (status, project) = send(&app, "GET", "/api/projects/demo", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(project["name"], "demo");

        let (status, _) = send(&app, "GET", "/api/projects/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(
            &app,
            "POST",
            "/api/projects",
            Some(json!({ "name": "demo", "path": repo.path() })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().is_some_and(|e| e.contains("demo")));
    }

    #[tokio::test]
    async fn tasks_are_queued_listed_and_cancelled() {
        let repo = TestRepo::new().expect("repo");
        let app = app(&repo);
        register(&app, &repo).await;

        let (status, task) = send(
            &app,
            "POST",
            "/api/tasks",
            Some(json!({ "project": "demo", "prompt": "add a hello world function" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(task["state"], "queued");
        let id = task["id"].as_str().expect("id").to_string();

        let (status, queued) = send(&app, "GET", "/api/tasks?state=queued", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(queued[0]["id"], id.as_str());
        let (status, _) = send(&app, "GET", "/api/tasks?state=done", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, cancelled) = send(&app, "POST", &format!("/api/tasks/{id}/cancel"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled["state"], "failed");
        assert_eq!(cancelled["reason"], "cancelled");

        let (status, _) = send(&app, "POST", &format!("/api/tasks/{id}/cancel"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, events) = send(&app, "GET", &format!("/api/tasks/{id}/events"), None).await;
        assert_eq!(status, StatusCode::OK);
        let events = events.as_array().expect("events");
        assert_eq!(events.len(), 2);
        assert_eq!(events[1]["phase"], "failed");

        let first = events[0]["seq"].as_i64().expect("seq");
        let (_, rest) = send(
            &app,
            "GET",
            &format!("/api/tasks/{id}/events?after={first}"),
            None,
        )
        .await;
        assert_eq!(rest.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn invalid_submissions_are_rejected() {
        let repo = TestRepo::new().expect("repo");
        let app = app(&repo);
        register(&app, &repo).await;

        let (status, _) = send(
            &app,
            "POST",
            "/api/tasks",
            Some(json!({
                "project": "demo",
                "prompt": "x",
                "source_branch": "main",
                "target_branch": "main",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            "POST",
            "/api/tasks",
            Some(json!({ "project": "missing", "prompt": "x" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stream_replays_events_and_closes_after_terminal_state() {
        let repo = TestRepo::new().expect("repo");
        let app = app(&repo);
        register(&app, &repo).await;
        let (_, task) = send(
            &app,
            "POST",
            "/api/tasks",
            Some(json!({ "project": "demo", "prompt": "tidy up" })),
        )
        .await;
        let id = task["id"].as_str().expect("id").to_string();
        send(&app, "POST", &format!("/api/tasks/{id}/cancel"), None).await;

        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/api/tasks/{id}/stream"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("event: task_event"));
        assert!(text.contains("task queued"));
        assert!(text.contains("cancelled before start"));
        assert!(text.trim_end().ends_with("data: {\"state\":\"failed\"}"), "{text}");

        let (status, _) = send(&app, "GET", "/api/tasks/unknown/stream", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
