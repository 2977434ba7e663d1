//! # Control surface
//!
//! HTTP + WebSocket host over the engine boundary: test CRUD, result
//! queries with a `sections` opt-in for heavy payloads, run/stop and
//! debug commands, and a WebSocket feed of the event stream. The GUI is
//! just another client of these routes.
//!
//! One run is active per browser target; starting a second while one is
//! in flight returns 409.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::browser::BrowserClient;
use crate::debug::{DebugCommand, DebugGate};
use crate::events::EventBus;
use crate::protocol::{RunStatus, TestDefinition, TestResult};
use crate::runner::{RunConfig, Runner};
use crate::store::{slugify, SaveMeta, TestStore};
use crate::validation::{validate_edit, EditChange};

/// Results kept per test unless a save requests otherwise.
const DEFAULT_RETENTION: usize = 50;

struct ActiveRun {
    test_id: String,
    gate: Arc<DebugGate>,
}

#[derive(Clone)]
pub struct AppState {
    store: Arc<TestStore>,
    runner: Arc<Runner>,
    bus: EventBus,
    active: Arc<Mutex<Option<ActiveRun>>>,
}

impl AppState {
    pub fn new(client: Arc<dyn BrowserClient>, store: Arc<TestStore>, bus: EventBus) -> Self {
        let runner = Arc::new(Runner::new(client, Some(store.clone()), bus.clone()));
        Self {
            store,
            runner,
            bus,
            active: Arc::new(Mutex::new(None)),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/tests", get(list_tests).post(save_test))
        .route("/api/tests/:id", get(get_test).delete(delete_test))
        .route("/api/tests/:id/validate", post(validate_test_edit))
        .route("/api/tests/:id/results", get(list_results))
        .route("/api/tests/:id/results/:run_id", get(get_result))
        .route(
            "/api/tests/:id/results/:run_id/screenshot",
            get(get_screenshot),
        )
        .route("/api/tests/:id/run", post(run_test))
        .route("/api/run/stop", post(stop_run))
        .route("/api/run/debug", post(debug_command))
        .route("/api/events/ws", get(events_ws))
        .with_state(state)
}

/// Binds and serves until the process exits.
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    info!(port, "control surface listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn not_found(what: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": what }))).into_response()
}

// ----------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ListTestsQuery {
    tag: Option<String>,
}

async fn list_tests(
    State(state): State<AppState>,
    Query(query): Query<ListTestsQuery>,
) -> Response {
    let tests = state.store.list_tests(query.tag.as_deref());
    Json(tests).into_response()
}

async fn get_test(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.get_test(&id) {
        Some(test) => Json(test).into_response(),
        None => not_found("test not found"),
    }
}

#[derive(Debug, Deserialize)]
struct SaveTestBody {
    id: Option<String>,
    name: String,
    description: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    definition: TestDefinition,
}

async fn save_test(State(state): State<AppState>, Json(body): Json<SaveTestBody>) -> Response {
    let id = body.id.unwrap_or_else(|| slugify(&body.name));
    let meta = SaveMeta {
        description: body.description,
        tags: body.tags,
    };
    match state.store.save_test(&id, &body.name, body.definition, meta) {
        Ok(saved) => (StatusCode::CREATED, Json(saved)).into_response(),
        Err(e) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn delete_test(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.delete_test(&id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            error!(id, error = %e, "delete failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn validate_test_edit(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(change): Json<EditChange>,
) -> Response {
    let Some(test) = state.store.get_test(&id) else {
        return not_found("test not found");
    };
    let def = match serde_json::to_value(&test.definition) {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    };
    Json(validate_edit(&def, &change)).into_response()
}

// ----------------------------------------------------------------------
// Results
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ListResultsQuery {
    status: Option<RunStatus>,
    limit: Option<usize>,
}

async fn list_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ListResultsQuery>,
) -> Response {
    Json(state.store.list_results(&id, query.status, query.limit)).into_response()
}

#[derive(Debug, Deserialize)]
struct GetResultQuery {
    /// Comma-separated heavy fields to include, e.g.
    /// `sections=step_traces,screenshot`.
    sections: Option<String>,
}

async fn get_result(
    State(state): State<AppState>,
    Path((id, run_id)): Path<(String, String)>,
    Query(query): Query<GetResultQuery>,
) -> Response {
    let sections: Option<Vec<String>> = query
        .sections
        .map(|s| s.split(',').map(|p| p.trim().to_string()).collect());
    match state.store.get_result(&id, &run_id, sections.as_deref()) {
        Some(run) => Json(run).into_response(),
        None => not_found("result not found"),
    }
}

/// Decoded screenshot as a PNG body, when the run captured one.
async fn get_screenshot(
    State(state): State<AppState>,
    Path((id, run_id)): Path<(String, String)>,
) -> Response {
    let sections = ["screenshot".to_string()];
    let Some(run) = state.store.get_result(&id, &run_id, Some(&sections)) else {
        return not_found("result not found");
    };
    let TestResult::Failed {
        screenshot: Some(b64),
        ..
    } = run.result
    else {
        return not_found("no screenshot captured");
    };
    match base64::engine::general_purpose::STANDARD.decode(b64.as_bytes()) {
        Ok(bytes) => ([("content-type", "image/png")], bytes).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("corrupt screenshot: {}", e) })),
        )
            .into_response(),
    }
}

// ----------------------------------------------------------------------
// Runs
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct RunBody {
    #[serde(default)]
    inputs: BTreeMap<String, Value>,
    #[serde(default)]
    debug: bool,
    #[serde(default)]
    step_delay_ms: u64,
    retention: Option<usize>,
}

async fn run_test(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<RunBody>>,
) -> Response {
    let Json(body) = body.unwrap_or_default();
    let Some(test) = state.store.get_test(&id) else {
        return not_found("test not found");
    };

    let gate = Arc::new(DebugGate::new(
        body.debug,
        body.step_delay_ms,
        state.bus.clone(),
    ));
    {
        let mut active = state.active.lock().expect("active run lock");
        if active.is_some() {
            return (
                StatusCode::CONFLICT,
                Json(json!({ "error": "a run is already in progress" })),
            )
                .into_response();
        }
        *active = Some(ActiveRun {
            test_id: id.clone(),
            gate: gate.clone(),
        });
    }

    let run_id = uuid::Uuid::new_v4().to_string();
    let config = RunConfig {
        test_id: Some(id.clone()),
        run_id: Some(run_id.clone()),
        inputs: body.inputs,
    };
    let retention = body.retention.or(Some(DEFAULT_RETENTION));

    let runner = state.runner.clone();
    let store = state.store.clone();
    let active = state.active.clone();
    let definition = test.definition.clone();
    tokio::spawn(async move {
        let started = chrono::Utc::now();
        match runner.run(&definition, config, gate).await {
            Ok(result) => {
                if let Err(e) = store.save_result(&id, result, started, retention) {
                    error!(test_id = %id, error = %e, "failed to persist run result");
                }
            }
            Err(e) => warn!(test_id = %id, error = %e, "run refused"),
        }
        *active.lock().expect("active run lock") = None;
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({ "run_id": run_id, "status": "running" })),
    )
        .into_response()
}

async fn stop_run(State(state): State<AppState>) -> Response {
    match state.active.lock().expect("active run lock").as_ref() {
        Some(run) => {
            run.gate.command(DebugCommand::Stop);
            Json(json!({ "stopped": run.test_id })).into_response()
        }
        None => not_found("no active run"),
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum DebugBody {
    Step,
    Continue,
    RunTo { target: usize },
    Stop,
}

async fn debug_command(State(state): State<AppState>, Json(body): Json<DebugBody>) -> Response {
    let command = match body {
        DebugBody::Step => DebugCommand::Step,
        DebugBody::Continue => DebugCommand::Continue,
        DebugBody::RunTo { target } => DebugCommand::RunTo(target),
        DebugBody::Stop => DebugCommand::Stop,
    };
    match state.active.lock().expect("active run lock").as_ref() {
        Some(run) => {
            run.gate.command(command);
            Json(json!({ "ok": true })).into_response()
        }
        None => not_found("no active run"),
    }
}

// ----------------------------------------------------------------------
// Events
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct EventsQuery {
    /// Topic prefix, e.g. `step:` or `run:`. Empty receives everything.
    #[serde(default)]
    topics: String,
}

async fn events_ws(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| pump_events(socket, state.bus, query.topics))
}

/// Forwards subscribed events until either side hangs up.
async fn pump_events(mut socket: WebSocket, bus: EventBus, topics: String) {
    let mut subscription = bus.subscribe(&topics);
    loop {
        tokio::select! {
            event = subscription.next() => {
                let Some(event) = event else { break };
                let Ok(payload) = serde_json::to_string(&event) else { continue };
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fake::FakeBrowser;
    use serde_json::json;
    use tokio::time::{sleep, Duration};

    fn state() -> (tempfile::TempDir, AppState, Arc<FakeBrowser>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TestStore::new(dir.path()));
        let fake = Arc::new(FakeBrowser::new());
        let bus = EventBus::new();
        (dir, AppState::new(fake.clone(), store, bus), fake)
    }

    fn save_body(id: &str) -> SaveTestBody {
        SaveTestBody {
            id: Some(id.to_string()),
            name: id.to_string(),
            description: None,
            tags: Vec::new(),
            definition: serde_json::from_value(json!({
                "url": "http://x",
                "steps": [ { "eval": "1", "as": "r" } ]
            }))
            .unwrap(),
        }
    }

    #[tokio::test]
    async fn test_save_then_get_and_conflict() {
        let (_dir, state, _fake) = state();
        let created = save_test(State(state.clone()), Json(save_body("demo"))).await;
        assert_eq!(created.status(), StatusCode::CREATED);

        let fetched = get_test(State(state.clone()), Path("demo".to_string())).await;
        assert_eq!(fetched.status(), StatusCode::OK);

        let dup = save_test(State(state.clone()), Json(save_body("demo"))).await;
        assert_eq!(dup.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_get_missing_test_is_404() {
        let (_dir, state, _fake) = state();
        let missing = get_test(State(state), Path("ghost".to_string())).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_run_persists_result_and_clears_active() {
        let (_dir, state, _fake) = state();
        save_test(State(state.clone()), Json(save_body("demo"))).await;

        let accepted = run_test(State(state.clone()), Path("demo".to_string()), None).await;
        assert_eq!(accepted.status(), StatusCode::ACCEPTED);

        // Wait for the spawned run to finish and persist.
        for _ in 0..50 {
            if state.active.lock().unwrap().is_none() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let runs = state.store.list_results("demo", None, None);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Passed);
    }

    #[tokio::test]
    async fn test_second_run_conflicts_while_active() {
        let (_dir, state, _fake) = state();
        save_test(State(state.clone()), Json(save_body("demo"))).await;

        // Hold the run paused at its first step so it stays active.
        let body = RunBody {
            debug: true,
            ..RunBody::default()
        };
        let first = run_test(
            State(state.clone()),
            Path("demo".to_string()),
            Some(Json(body)),
        )
        .await;
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        sleep(Duration::from_millis(30)).await;

        let second = run_test(State(state.clone()), Path("demo".to_string()), None).await;
        assert_eq!(second.status(), StatusCode::CONFLICT);

        let stopped = stop_run(State(state.clone())).await;
        assert_eq!(stopped.status(), StatusCode::OK);
        for _ in 0..50 {
            if state.active.lock().unwrap().is_none() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_debug_command_without_active_run_is_404() {
        let (_dir, state, _fake) = state();
        let response = debug_command(
            State(state),
            Json(serde_json::from_value(json!({ "command": "step" })).unwrap()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_validate_route_reports_findings() {
        let (_dir, state, _fake) = state();
        save_test(State(state.clone()), Json(save_body("demo"))).await;
        let change: EditChange = serde_json::from_value(json!({
            "op": "add",
            "section": "steps",
            "index": 0,
            "step": { "mock_network": { "match": "**", "status": 200 } }
        }))
        .unwrap();
        let response =
            validate_test_edit(State(state), Path("demo".to_string()), Json(change)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
