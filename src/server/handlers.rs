// Route handlers

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::agents::{silent_progress, ProgressFn};
use crate::error::CaseworkError;
use crate::pipeline::App;
use crate::stage::RedoStep;
use crate::store::AgentConfig;

impl IntoResponse for CaseworkError {
    fn into_response(self) -> Response {
        let status = match &self {
            CaseworkError::NotFound(_) => StatusCode::NOT_FOUND,
            CaseworkError::IllegalTransition(_) | CaseworkError::Invalid(_) => {
                StatusCode::BAD_REQUEST
            }
            CaseworkError::AgentFailed(_)
            | CaseworkError::Parse(_)
            | CaseworkError::Storage(_)
            | CaseworkError::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type Result<T> = std::result::Result<T, CaseworkError>;

pub fn create_router(app: Arc<App>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/projects", post(create_project).get(list_projects))
        .route("/api/projects/:id", get(get_project))
        .route("/api/projects/:id/run-next", post(run_next))
        .route("/api/projects/:id/approve", post(approve))
        .route("/api/projects/:id/unapprove", post(unapprove))
        .route("/api/projects/:id/redo", post(redo))
        .route("/api/projects/:id/artifacts", get(artifacts))
        .route("/api/projects/:id/run-logs", get(run_logs))
        .route("/api/projects/:id/deliverables", get(deliverables))
        .route("/api/projects/:id/workflow", get(workflow))
        .route("/api/projects/:id/workflow/steps/:step_id/run", post(run_step))
        .route(
            "/api/projects/:id/workflow/steps/:step_id/run-stream",
            get(run_step_stream),
        )
        .route(
            "/api/projects/:id/workflow/steps/:step_id/approve",
            post(approve_step),
        )
        .route(
            "/api/projects/:id/workflow/steps/:step_id/unapprove",
            post(unapprove_step),
        )
        .route(
            "/api/projects/:id/workflow/steps/:step_id/chat",
            post(chat).get(chat_history),
        )
        .route(
            "/api/projects/:id/workflow/steps/:step_id/deliverable",
            get(step_deliverable),
        )
        .route("/api/deliverables/:id", get(get_deliverable))
        .route("/api/workflows", get(list_workflows))
        .route("/api/agent-configs", get(list_agent_configs))
        .route("/api/agent-configs/:key", put(put_agent_config))
        .with_state(app)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "time": chrono::Utc::now().to_rfc3339() }))
}

// ---------------------------------------------------------------------------
// Projects
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CreateProjectBody {
    name: String,
    objective: String,
    #[serde(default)]
    constraints: String,
}

async fn create_project(
    State(app): State<Arc<App>>,
    Json(body): Json<CreateProjectBody>,
) -> Result<impl IntoResponse> {
    if body.name.trim().is_empty() || body.objective.trim().is_empty() {
        return Err(CaseworkError::Invalid("name and objective are required".into()));
    }
    let project = app
        .create_project(&body.name, &body.objective, &body.constraints)
        .await?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn list_projects(State(app): State<Arc<App>>) -> Result<impl IntoResponse> {
    Ok(Json(app.storage.list_projects().await?))
}

async fn get_project(
    State(app): State<Arc<App>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    Ok(Json(app.storage.get_project(id).await?))
}

async fn run_next(State(app): State<Arc<App>>, Path(id): Path<i64>) -> Result<impl IntoResponse> {
    Ok(Json(app.run_next(id, silent_progress()).await?))
}

async fn approve(State(app): State<Arc<App>>, Path(id): Path<i64>) -> Result<impl IntoResponse> {
    Ok(Json(app.approve(id).await?))
}

async fn unapprove(State(app): State<Arc<App>>, Path(id): Path<i64>) -> Result<impl IntoResponse> {
    Ok(Json(app.unapprove(id).await?))
}

#[derive(Deserialize)]
struct RedoBody {
    step: String,
}

async fn redo(
    State(app): State<Arc<App>>,
    Path(id): Path<i64>,
    Json(body): Json<RedoBody>,
) -> Result<impl IntoResponse> {
    let step: RedoStep = body.step.parse()?;
    Ok(Json(app.redo(id, step).await?))
}

async fn artifacts(State(app): State<Arc<App>>, Path(id): Path<i64>) -> Result<impl IntoResponse> {
    Ok(Json(app.artifacts(id).await?))
}

async fn run_logs(State(app): State<Arc<App>>, Path(id): Path<i64>) -> Result<impl IntoResponse> {
    app.storage.get_project(id).await?;
    Ok(Json(app.storage.list_run_logs(id).await?))
}

async fn deliverables(
    State(app): State<Arc<App>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    app.storage.get_project(id).await?;
    Ok(Json(app.storage.list_deliverables(id).await?))
}

async fn workflow(State(app): State<Arc<App>>, Path(id): Path<i64>) -> Result<impl IntoResponse> {
    app.storage.get_project(id).await?;
    Ok(Json(app.storage.instance_for_project(id).await?))
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// Steps are addressed under their project; a step ID that exists but
/// belongs to another project reads as not found.
async fn step_in_project(app: &App, project_id: i64, step_id: i64) -> Result<()> {
    app.storage.get_project(project_id).await?;
    let (_, owner) = app.storage.get_step(step_id).await?;
    if owner != project_id {
        return Err(CaseworkError::NotFound("Workflow step"));
    }
    Ok(())
}

async fn run_step(
    State(app): State<Arc<App>>,
    Path((project_id, step_id)): Path<(i64, i64)>,
) -> Result<impl IntoResponse> {
    step_in_project(&app, project_id, step_id).await?;
    Ok(Json(app.run_step(step_id, silent_progress()).await?))
}

/// Streamed step execution. Events: connected, status, llm, critic,
/// progress, then exactly one of complete or error.
async fn run_step_stream(
    State(app): State<Arc<App>>,
    Path((project_id, step_id)): Path<(i64, i64)>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    step_in_project(&app, project_id, step_id).await?;
    let (tx, rx) = mpsc::unbounded_channel::<Event>();
    let _ = tx.send(Event::default().event("connected").data("{}"));

    let progress_tx = tx.clone();
    let progress: ProgressFn = Arc::new(move |message, kind| {
        let _ = progress_tx.send(
            Event::default()
                .event(kind)
                .data(json!({ "message": message }).to_string()),
        );
    });

    tokio::spawn(async move {
        match app.run_step(step_id, progress).await {
            Ok(outcome) => {
                let data = serde_json::to_string(&outcome)
                    .unwrap_or_else(|_| "{}".to_string());
                let _ = tx.send(Event::default().event("complete").data(data));
            }
            Err(e) => {
                let _ = tx.send(
                    Event::default()
                        .event("error")
                        .data(json!({ "error": e.to_string() }).to_string()),
                );
            }
        }
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok(event), rx))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn approve_step(
    State(app): State<Arc<App>>,
    Path((project_id, step_id)): Path<(i64, i64)>,
) -> Result<impl IntoResponse> {
    step_in_project(&app, project_id, step_id).await?;
    Ok(Json(app.approve_step(step_id).await?))
}

async fn unapprove_step(
    State(app): State<Arc<App>>,
    Path((project_id, step_id)): Path<(i64, i64)>,
) -> Result<impl IntoResponse> {
    step_in_project(&app, project_id, step_id).await?;
    Ok(Json(app.unapprove_step(step_id).await?))
}

#[derive(Deserialize)]
struct ChatBody {
    message: String,
}

async fn chat(
    State(app): State<Arc<App>>,
    Path((project_id, step_id)): Path<(i64, i64)>,
    Json(body): Json<ChatBody>,
) -> Result<impl IntoResponse> {
    step_in_project(&app, project_id, step_id).await?;
    if body.message.trim().is_empty() {
        return Err(CaseworkError::Invalid("message is required".into()));
    }
    let deliverable = app
        .refine_step(step_id, &body.message, silent_progress())
        .await?;
    Ok(Json(deliverable))
}

async fn chat_history(
    State(app): State<Arc<App>>,
    Path((project_id, step_id)): Path<(i64, i64)>,
) -> Result<impl IntoResponse> {
    step_in_project(&app, project_id, step_id).await?;
    Ok(Json(app.storage.list_chat_messages(step_id).await?))
}

async fn step_deliverable(
    State(app): State<Arc<App>>,
    Path((project_id, step_id)): Path<(i64, i64)>,
) -> Result<impl IntoResponse> {
    step_in_project(&app, project_id, step_id).await?;
    let deliverable = app
        .storage
        .latest_deliverable_for_step(step_id)
        .await?
        .ok_or(CaseworkError::NotFound("Deliverable"))?;
    Ok(Json(deliverable))
}

async fn get_deliverable(
    State(app): State<Arc<App>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    Ok(Json(app.storage.get_deliverable(id).await?))
}

// ---------------------------------------------------------------------------
// Workflows and agent configs
// ---------------------------------------------------------------------------

async fn list_workflows(State(app): State<Arc<App>>) -> Result<impl IntoResponse> {
    Ok(Json(app.storage.list_templates().await?))
}

async fn list_agent_configs(State(app): State<Arc<App>>) -> Result<impl IntoResponse> {
    Ok(Json(app.storage.list_agent_configs().await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentConfigBody {
    system_prompt: String,
    model: String,
    max_tokens: u32,
}

async fn put_agent_config(
    State(app): State<Arc<App>>,
    Path(key): Path<String>,
    Json(body): Json<AgentConfigBody>,
) -> Result<impl IntoResponse> {
    let key: crate::agents::AgentKey = key.parse()?;
    if body.max_tokens == 0 {
        return Err(CaseworkError::Invalid("max_tokens must be positive".into()));
    }
    let config = AgentConfig {
        agent_key: key.as_str().to_string(),
        system_prompt: body.system_prompt,
        model: body.model,
        max_tokens: body.max_tokens,
    };
    app.storage.upsert_agent_config(&config).await?;
    Ok(Json(config))
}
