use axum::body::Bytes;
use axum::response::Html;
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::api::models::{
    ErrorBody, ProgressView, RunRequest, RunResponse, TaskActionResponse,
};
use crate::enrich::settings::{
    ClassificationSettings, LanguageSettings, SettingsRepo, TranslationSettings,
};
use crate::enrich::EnrichmentKind;
use crate::scheduler::{RunOutcome, Scheduler};

pub mod models;

#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Scheduler,
    pub settings: SettingsRepo,
    /// When set, mutating endpoints require `Authorization: Bearer <token>`.
    pub api_token: Option<String>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(admin_index))
        // Tasks
        .route("/tasks/status", get(tasks_status))
        .route("/tasks/:name/start", post(start_task))
        .route("/tasks/:name/stop", post(stop_task))
        .route("/tasks/:name/run", post(run_task))
        // Progress
        .route("/progress", get(progress_all))
        .route("/progress/:name", get(progress_one))
        .route("/metrics/prom", get(metrics_prom))
        // Prompt settings
        .route("/settings/:name", get(get_settings).put(put_settings))
        // Health
        .route("/health", get(health))
        .with_state(state)
}

const ADMIN_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1" />
  <title>EnrichFlow Admin</title>
  <style>
    body {
      margin: 0 auto;
      max-width: 1100px;
      padding: 0 16px 40px;
      font: 14px/1.4 system-ui, sans-serif;
      background: #fafaf7;
      color: #222;
    }
    header { padding: 18px 0 10px; border-bottom: 2px solid #2d6a4f; }
    header h1 { margin: 0 0 4px; font-size: 22px; color: #2d6a4f; }
    header p { margin: 0; color: #666; font-size: 12px; }
    main { display: flex; flex-wrap: wrap; gap: 14px; margin-top: 14px; }
    section {
      flex: 1 1 340px;
      padding: 10px 14px 14px;
      background: #fff;
      border: 1px solid #e2e2dc;
      border-radius: 6px;
    }
    section h2 { margin: 4px 0 10px; font-size: 15px; }
    label { display: block; margin: 8px 0 3px; font-size: 12px; color: #555; }
    input, select, textarea { width: 100%; padding: 6px; border: 1px solid #ccc; border-radius: 4px; }
    button { margin: 8px 6px 0 0; padding: 6px 14px; border: 0; border-radius: 4px; background: #2d6a4f; color: #fff; }
    button:hover { background: #1b4332; }
    pre { margin-top: 10px; padding: 8px; min-height: 100px; max-height: 360px; overflow: auto; background: #1e1e1e; color: #d4d4d4; font-size: 12px; }
  </style>
</head>
<body>
  <header>
    <h1>EnrichFlow Admin</h1>
    <p>Endpoints: /tasks/status, /tasks/:name/start|stop|run, /progress, /settings/:name, /metrics/prom</p>
  </header>
  <main>
    <section>
      <h2>Token</h2>
      <label>API token (only if the server requires one)</label>
      <input id="token" type="password" />
    </section>
    <section>
      <h2>Tasks</h2>
      <button onclick="show('/tasks/status', 'tasks-out')">Refresh</button>
      <label>Task</label>
      <select id="task-name">
        <option>translation</option>
        <option>classification</option>
        <option>language-detection</option>
      </select>
      <button onclick="taskAction('start')">Start</button>
      <button onclick="taskAction('stop')">Stop</button>
      <label>Run now: limit (1-100)</label>
      <input id="run-limit" placeholder="10" />
      <button onclick="runTask()">Run</button>
      <pre id="tasks-out">{}</pre>
    </section>
    <section>
      <h2>Progress</h2>
      <button onclick="show('/progress', 'progress-out')">Refresh</button>
      <pre id="progress-out">{}</pre>
    </section>
    <section>
      <h2>Prompt Settings</h2>
      <label>Kind</label>
      <select id="settings-name">
        <option>translation</option>
        <option>classification</option>
        <option>language-detection</option>
      </select>
      <button onclick="loadSettings()">Load</button>
      <label>JSON</label>
      <textarea id="settings-body" rows="10">{}</textarea>
      <button onclick="saveSettings()">Save</button>
      <pre id="settings-out">{}</pre>
    </section>
  </main>
  <script>
    function buildHeaders(extra) {
      const headers = Object.assign({}, extra || {});
      const token = document.getElementById("token").value.trim();
      if (token) headers["Authorization"] = "Bearer " + token;
      return headers;
    }

    async function show(path, targetId, init) {
      const req = Object.assign({}, init);
      req.headers = buildHeaders(req.headers);
      const res = await fetch(path, req);
      const text = await res.text();
      let pretty;
      try { pretty = JSON.stringify(JSON.parse(text), null, 2); } catch (e) { pretty = text; }
      document.getElementById(targetId).textContent = res.status + " " + res.statusText + "\n" + pretty;
      return text;
    }

    function taskName() {
      return document.getElementById("task-name").value;
    }

    function taskAction(action) {
      show("/tasks/" + taskName() + "/" + action, "tasks-out", { method: "POST" });
    }

    function runTask() {
      const limit = document.getElementById("run-limit").value.trim();
      const body = {};
      if (limit) body.limit = parseInt(limit, 10);
      show("/tasks/" + taskName() + "/run", "tasks-out", {
        method: "POST",
        headers: { "Content-Type": "application/json" },
        body: JSON.stringify(body)
      });
    }

    async function loadSettings() {
      const name = document.getElementById("settings-name").value;
      const txt = await show("/settings/" + name, "settings-out");
      try {
        const parsed = JSON.parse(txt);
        delete parsed.updated_at;
        document.getElementById("settings-body").value = JSON.stringify(parsed, null, 2);
      } catch (e) {}
    }

    function saveSettings() {
      const name = document.getElementById("settings-name").value;
      const raw = document.getElementById("settings-body").value.trim();
      try { JSON.parse(raw); } catch (e) {
        document.getElementById("settings-out").textContent = "settings must be valid JSON";
        return;
      }
      show("/settings/" + name, "settings-out", {
        method: "PUT",
        headers: { "Content-Type": "application/json" },
        body: raw
      });
    }
  </script>
</body>
</html>
"#;

pub async fn admin_index() -> Html<&'static str> {
    Html(ADMIN_HTML)
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn api_err(status: StatusCode, msg: impl Into<String>) -> ApiError {
    (status, Json(ErrorBody { error: msg.into() }))
}

fn internal_err(e: anyhow::Error) -> ApiError {
    api_err(StatusCode::INTERNAL_SERVER_ERROR, format!("internal error: {e}"))
}

fn parse_task(name: &str) -> Result<EnrichmentKind, ApiError> {
    name.parse::<EnrichmentKind>()
        .map_err(|e| api_err(StatusCode::BAD_REQUEST, e.to_string()))
}

fn authorize(state: &ApiState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.api_token.as_deref() else {
        return Ok(());
    };

    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    if presented == Some(expected) {
        Ok(())
    } else {
        Err(api_err(StatusCode::UNAUTHORIZED, "unauthorized"))
    }
}

pub async fn tasks_status(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.scheduler.get_all_status())
}

pub async fn start_task(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TaskActionResponse>, ApiError> {
    authorize(&state, &headers)?;
    let task = parse_task(&name)?;

    if !state.scheduler.start(task).map_err(internal_err)? {
        return Err(api_err(
            StatusCode::BAD_REQUEST,
            format!("task {task} is not registered"),
        ));
    }

    Ok(Json(TaskActionResponse {
        success: true,
        message: format!("task {task} started"),
    }))
}

pub async fn stop_task(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TaskActionResponse>, ApiError> {
    authorize(&state, &headers)?;
    let task = parse_task(&name)?;

    if !state.scheduler.stop(task).map_err(internal_err)? {
        return Err(api_err(
            StatusCode::BAD_REQUEST,
            format!("task {task} is not registered"),
        ));
    }

    Ok(Json(TaskActionResponse {
        success: true,
        message: format!("task {task} stopped"),
    }))
}

pub async fn run_task(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<RunResponse>, ApiError> {
    authorize(&state, &headers)?;
    let task = parse_task(&name)?;

    // An empty body means "use the defaults".
    let req = if body.iter().all(u8::is_ascii_whitespace) {
        RunRequest::default()
    } else {
        serde_json::from_slice::<RunRequest>(&body)
            .map_err(|e| api_err(StatusCode::BAD_REQUEST, format!("invalid body: {e}")))?
    };
    let limit = req.effective_limit();

    match state.scheduler.run_now(task, limit).await.map_err(internal_err)? {
        RunOutcome::Completed(stats) => Ok(Json(RunResponse {
            message: format!(
                "{task}: {} succeeded, {} skipped, {} failed, {} remaining",
                stats.success, stats.skipped, stats.failed, stats.remaining
            ),
            stats,
        })),
        RunOutcome::Failed(msg) => Err(api_err(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{task} batch failed: {msg}"),
        )),
        RunOutcome::Skipped => Err(api_err(
            StatusCode::CONFLICT,
            format!("{task} is already running elsewhere"),
        )),
    }
}

pub async fn progress_all(
    State(state): State<ApiState>,
) -> Result<Json<BTreeMap<EnrichmentKind, ProgressView>>, ApiError> {
    let mut out = BTreeMap::new();
    for task in EnrichmentKind::ALL {
        let stats = state.scheduler.progress(task).await.map_err(internal_err)?;
        out.insert(task, ProgressView::from(stats));
    }
    Ok(Json(out))
}

pub async fn progress_one(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<ProgressView>, ApiError> {
    let task = parse_task(&name)?;
    let stats = state.scheduler.progress(task).await.map_err(internal_err)?;
    Ok(Json(ProgressView::from(stats)))
}

pub async fn metrics_prom(State(state): State<ApiState>) -> Response {
    let mut body = String::new();
    let gauges: [(&str, &str); 6] = [
        ("enrichflow_items_total", "Conversations inside the processing horizon"),
        ("enrichflow_items_completed", "Conversations with a completed record"),
        ("enrichflow_items_failed", "Conversations whose last attempt failed"),
        ("enrichflow_items_pending", "Conversations not attempted yet"),
        ("enrichflow_task_enabled", "1 when the task trigger is armed"),
        ("enrichflow_task_running", "1 while a batch is executing"),
    ];

    let mut rows: Vec<[i64; 6]> = Vec::with_capacity(EnrichmentKind::ALL.len());
    for task in EnrichmentKind::ALL {
        let p = match state.scheduler.progress(task).await {
            Ok(p) => p,
            Err(e) => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("metrics error: {e}"),
                )
                    .into_response()
            }
        };
        let status = state.scheduler.get_status(task);
        rows.push([
            p.total,
            p.completed,
            p.failed,
            p.pending,
            i64::from(status.enabled),
            i64::from(status.running),
        ]);
    }

    for (i, (metric, help)) in gauges.iter().enumerate() {
        body.push_str(&format!("# HELP {metric} {help}\n# TYPE {metric} gauge\n"));
        for (task, row) in EnrichmentKind::ALL.iter().zip(&rows) {
            body.push_str(&format!("{metric}{{task=\"{task}\"}} {}\n", row[i]));
        }
    }

    (StatusCode::OK, body).into_response()
}

async fn load_json<T>(settings: &SettingsRepo, kind: EnrichmentKind) -> Result<Value, ApiError>
where
    T: DeserializeOwned + Serialize + Default,
{
    let stored = settings.load::<T>(kind).await;
    serde_json::to_value(stored).map_err(|e| internal_err(e.into()))
}

pub async fn get_settings(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let kind = parse_task(&name)?;
    let value = match kind {
        EnrichmentKind::Translation => load_json::<TranslationSettings>(&state.settings, kind).await?,
        EnrichmentKind::Classification => {
            load_json::<ClassificationSettings>(&state.settings, kind).await?
        }
        EnrichmentKind::LanguageDetection => {
            load_json::<LanguageSettings>(&state.settings, kind).await?
        }
    };
    Ok(Json(value))
}

fn parse_settings<T: DeserializeOwned>(body: Value) -> Result<T, ApiError> {
    serde_json::from_value(body)
        .map_err(|e| api_err(StatusCode::BAD_REQUEST, format!("invalid settings: {e}")))
}

pub async fn put_settings(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    let kind = parse_task(&name)?;
    let bad = |e: anyhow::Error| api_err(StatusCode::BAD_REQUEST, e.to_string());

    match kind {
        EnrichmentKind::Translation => {
            let s: TranslationSettings = parse_settings(body)?;
            s.validate().map_err(bad)?;
            state.settings.save(kind, &s).await.map_err(internal_err)?;
        }
        EnrichmentKind::Classification => {
            let s: ClassificationSettings = parse_settings(body)?;
            s.validate().map_err(bad)?;
            state.settings.save(kind, &s).await.map_err(internal_err)?;
        }
        EnrichmentKind::LanguageDetection => {
            let s: LanguageSettings = parse_settings(body)?;
            s.validate().map_err(bad)?;
            state.settings.save(kind, &s).await.map_err(internal_err)?;
        }
    }
    tracing::info!(kind = kind.as_str(), "settings updated");

    get_settings(State(state), Path(name)).await
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
