// Integration tests for the HTTP API
//
// Uses the fixture model, a temp-file database, and tower's oneshot so no
// network or credential is needed.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

use casework::llm::FixtureModel;
use casework::pipeline::App;
use casework::rag::NoRetriever;
use casework::server::create_router;
use casework::store::Storage;

async fn router() -> (Router, TempDir) {
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(&dir.path().join("api.db")).unwrap();
    let app = Arc::new(App::new(
        storage,
        Arc::new(FixtureModel::new()),
        Arc::new(NoRetriever),
    ));
    app.ensure_defaults().await.unwrap();
    (create_router(app), dir)
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(body) => Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn create_project(router: &Router) -> i64 {
    let (status, body) = send(
        router,
        "POST",
        "/api/projects",
        Some(json!({
            "name": "Acme Expansion",
            "objective": "Should we enter the APAC market?",
            "constraints": "Budget $2M, decision by Q3"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["id"].as_i64().unwrap()
}

#[tokio::test]
async fn test_health() {
    let (router, _dir) = router().await;
    let (status, body) = send(&router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_project_creation_and_listing() {
    let (router, _dir) = router().await;
    let id = create_project(&router).await;

    let (status, body) = send(&router, "GET", &format!("/api/projects/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stage"], "created");

    let (status, body) = send(&router, "GET", "/api/projects", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_create_project_requires_fields() {
    let (router, _dir) = router().await;
    let (status, body) = send(
        &router,
        "POST",
        "/api/projects",
        Some(json!({"name": "", "objective": "x"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("required"));
}

#[tokio::test]
async fn test_unknown_project_is_404() {
    let (router, _dir) = router().await;
    let (status, body) = send(&router, "GET", "/api/projects/999", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Project not found");
}

#[tokio::test]
async fn test_full_pipeline_over_http() {
    let (router, _dir) = router().await;
    let id = create_project(&router).await;

    let expected_drafts = [
        "definition_draft",
        "issues_draft",
        "hypotheses_draft",
        "execution_done",
        "summary_draft",
        "presentation_draft",
    ];
    for draft in expected_drafts {
        let (status, body) =
            send(&router, "POST", &format!("/api/projects/{id}/run-next"), None).await;
        assert_eq!(status, StatusCode::OK, "run-next failed at {draft}: {body}");
        assert_eq!(body["project"]["stage"], draft);
        assert!(body["deliverable"]["content"]["payload"].is_object());

        let (status, _) =
            send(&router, "POST", &format!("/api/projects/{id}/approve"), None).await;
        assert_eq!(status, StatusCode::OK);
    }

    let (_, body) = send(&router, "GET", &format!("/api/projects/{id}"), None).await;
    assert_eq!(body["stage"], "complete");

    // run-next from complete is rejected without mutation
    let (status, body) =
        send(&router, "POST", &format!("/api/projects/{id}/run-next"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("complete"));

    let (_, artifacts) =
        send(&router, "GET", &format!("/api/projects/{id}/artifacts"), None).await;
    assert!(!artifacts["issues"].as_array().unwrap().is_empty());
    assert!(!artifacts["slides"].as_array().unwrap().is_empty());

    // stored rows keep camelCase keys on the wire
    let issue = &artifacts["issues"].as_array().unwrap()[0];
    assert!(issue.get("projectId").is_some());
    assert!(issue.get("parentId").is_some());
    assert!(issue.get("parent_id").is_none());

    let (_, logs) = send(&router, "GET", &format!("/api/projects/{id}/run-logs"), None).await;
    assert_eq!(logs.as_array().unwrap().len(), 6);
    assert!(logs
        .as_array()
        .unwrap()
        .iter()
        .all(|l| l["status"] == "success" && l["outputJson"].is_object()));
}

#[tokio::test]
async fn test_approve_from_created_is_rejected() {
    let (router, _dir) = router().await;
    let id = create_project(&router).await;
    let (status, body) =
        send(&router, "POST", &format!("/api/projects/{id}/approve"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("created"));
}

#[tokio::test]
async fn test_redo_rewinds_stage() {
    let (router, _dir) = router().await;
    let id = create_project(&router).await;

    send(&router, "POST", &format!("/api/projects/{id}/run-next"), None).await;
    send(&router, "POST", &format!("/api/projects/{id}/approve"), None).await;
    send(&router, "POST", &format!("/api/projects/{id}/run-next"), None).await;

    let (status, body) = send(
        &router,
        "POST",
        &format!("/api/projects/{id}/redo"),
        Some(json!({"step": "issues"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stage"], "definition_approved");

    let (status, body) = send(
        &router,
        "POST",
        &format!("/api/projects/{id}/redo"),
        Some(json!({"step": "nonsense"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("Invalid step"));
}

#[tokio::test]
async fn test_workflow_steps_and_chat() {
    let (router, _dir) = router().await;
    let id = create_project(&router).await;

    let (status, workflow) =
        send(&router, "GET", &format!("/api/projects/{id}/workflow"), None).await;
    assert_eq!(status, StatusCode::OK);
    let steps = workflow["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 6);
    let step_id = steps[0]["id"].as_i64().unwrap();
    let step = |tail: &str| format!("/api/projects/{id}/workflow/steps/{step_id}/{tail}");

    let (status, body) = send(&router, "POST", &step("run"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["project"]["stage"], "definition_draft");

    // refine via chat, then read history
    let (status, deliverable) = send(
        &router,
        "POST",
        &step("chat"),
        Some(json!({"message": "Add a churn metric"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deliverable["content"]["type"], "project_definition");

    let (_, history) = send(&router, "GET", &step("chat"), None).await;
    let dialogue: Vec<_> = history
        .as_array()
        .unwrap()
        .iter()
        .filter(|m| m["role"] == "user" || m["role"] == "assistant")
        .collect();
    assert_eq!(dialogue.len(), 2);
    assert_eq!(dialogue[0]["role"], "user");

    // approve locks the deliverable; chat now refused
    let (status, _) = send(&router, "POST", &step("approve"), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send(
        &router,
        "POST",
        &step("chat"),
        Some(json!({"message": "more changes"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("locked"));
}

#[tokio::test]
async fn test_step_run_out_of_order_is_rejected() {
    let (router, _dir) = router().await;
    let id = create_project(&router).await;

    let (_, workflow) = send(&router, "GET", &format!("/api/projects/{id}/workflow"), None).await;
    let summary_step = workflow["steps"].as_array().unwrap()[4]["id"].as_i64().unwrap();

    let (status, _) = send(
        &router,
        "POST",
        &format!("/api/projects/{id}/workflow/steps/{summary_step}/run"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_step_under_wrong_project_is_404() {
    let (router, _dir) = router().await;
    let id = create_project(&router).await;

    let (_, workflow) = send(&router, "GET", &format!("/api/projects/{id}/workflow"), None).await;
    let step_id = workflow["steps"].as_array().unwrap()[0]["id"].as_i64().unwrap();

    let other = create_project(&router).await;
    let (status, _) = send(
        &router,
        "POST",
        &format!("/api/projects/{other}/workflow/steps/{step_id}/run"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_rerun_completed_step_over_http() {
    let (router, _dir) = router().await;
    let id = create_project(&router).await;

    let (_, workflow) = send(&router, "GET", &format!("/api/projects/{id}/workflow"), None).await;
    let step_id = workflow["steps"].as_array().unwrap()[0]["id"].as_i64().unwrap();
    let run = format!("/api/projects/{id}/workflow/steps/{step_id}/run");

    let (status, body) = send(&router, "POST", &run, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deliverable"]["version"], 1);

    let (status, body) = send(&router, "POST", &run, None).await;
    assert_eq!(status, StatusCode::OK, "re-running a completed step: {body}");
    assert_eq!(body["deliverable"]["version"], 2);
    assert_eq!(body["project"]["stage"], "definition_draft");
}

#[tokio::test]
async fn test_agent_config_round_trip() {
    let (router, _dir) = router().await;

    let (status, body) = send(
        &router,
        "PUT",
        "/api/agent-configs/summary",
        Some(json!({
            "systemPrompt": "One paragraph only.",
            "model": "gpt-5-nano",
            "maxTokens": 2048
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["agentKey"], "summary");

    let (_, configs) = send(&router, "GET", "/api/agent-configs", None).await;
    assert_eq!(configs.as_array().unwrap().len(), 1);

    let (status, _) = send(
        &router,
        "PUT",
        "/api/agent-configs/not_an_agent",
        Some(json!({"systemPrompt": "x", "model": "m", "maxTokens": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_deliverable_envelope_over_http() {
    let (router, _dir) = router().await;
    let id = create_project(&router).await;

    send(&router, "POST", &format!("/api/projects/{id}/run-next"), None).await;
    let (_, list) = send(&router, "GET", &format!("/api/projects/{id}/deliverables"), None).await;
    let deliverable = &list.as_array().unwrap()[0];

    let content = &deliverable["content"];
    assert_eq!(content["type"], "project_definition");
    assert_eq!(content["version"], 1);
    assert!(content["payload"]["governing_question"].is_string());
    assert_eq!(content["metadata"]["agentKey"], "project_definition");
}
