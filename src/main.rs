mod config;
mod dedup;
mod enrich;
mod guard;
mod http;
mod images;
mod jobs;
mod judge;
mod llm;
mod metrics;
mod models;
mod notify;
mod pipeline;
mod retry;
mod safe_path;
mod session;
mod source;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use config::{MonitorConfig, SolverKind, SourceStrategy};
use eyre::{WrapErr, eyre};
use guard::{ChallengeSolver, GridSolver, NoSolver, ResilienceGuard};
use jobs::{Scheduler, StatusBoard};
use llm::{ChatBackend, OpenAiClient};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::Task;
use notify::NotificationFanout;
use pipeline::{RunnerOptions, TaskRunner};
use serde::Serialize;
use serde_json::json;
use session::Session;
use source::{ApiSource, BrowserSource, FallbackSource, ListingSource, MtopClient};
use std::{net::SocketAddr, sync::Arc};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "argus.api", "monitor crashed: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = MonitorConfig::from_env();
    let tasks = load_tasks(&config.storage.tasks_file).await?;
    let session = match Session::load(&config.source.session_file).await {
        Ok(session) => Arc::new(session),
        Err(err) => {
            warn!(target = "argus.api", error = %err, "session_missing_running_anonymous");
            Arc::new(Session::default())
        }
    };
    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("installing prometheus recorder")?;

    let http = http::build_client(&config.http);
    let shutdown = CancellationToken::new();
    let backend: Arc<dyn ChatBackend> =
        Arc::new(OpenAiClient::new(http.clone(), config.llm.clone()));
    if !backend.is_configured() {
        warn!(target = "argus.api", "ai_backend_not_configured");
    }
    let fanout = Arc::new(NotificationFanout::from_config(http.clone(), &config.notify));
    if fanout.is_empty() {
        warn!(target = "argus.api", "no_notification_channels_configured");
    } else {
        info!(target = "argus.api", channels = ?fanout.channel_names(), "notification_channels");
    }

    let units: Vec<(Task, Arc<TaskRunner>)> = tasks
        .into_iter()
        .map(|task| {
            let runner = build_runner(
                &config,
                &task,
                http.clone(),
                session.clone(),
                backend.clone(),
                fanout.clone(),
                shutdown.clone(),
            );
            (task, Arc::new(runner))
        })
        .collect();

    let scheduler = Scheduler::new(config.scheduler.clone(), shutdown.clone());
    let handles = scheduler.spawn_all(units).await;

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!(target = "argus.api", "shutdown_requested");
            }
            shutdown.cancel();
        });
    }
    let schedules = {
        let shutdown = shutdown.clone();
        let run_once = config.scheduler.run_once;
        tokio::spawn(async move {
            futures::future::join_all(handles).await;
            if run_once {
                shutdown.cancel();
            }
        })
    };

    let app = router(AppState {
        board: scheduler.board(),
        prometheus,
    });
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "argus.api", "status server listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;
    let stop = shutdown.clone();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await
        .wrap_err("status server")?;
    schedules.await.wrap_err("scheduler join")?;
    info!(target = "argus.api", "monitor_stopped");
    Ok(())
}

async fn load_tasks(path: &std::path::Path) -> eyre::Result<Vec<Task>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .wrap_err_with(|| format!("reading tasks file {}", path.display()))?;
    // YAML is a superset of JSON, so one parser covers both task file formats.
    let tasks: Vec<Task> = serde_yaml::from_str(&raw)
        .wrap_err_with(|| format!("parsing tasks file {}", path.display()))?;
    if tasks.is_empty() {
        return Err(eyre!("tasks file {} defines no tasks", path.display()));
    }
    info!(
        target = "argus.api",
        total = tasks.len(),
        enabled = tasks.iter().filter(|t| t.enabled).count(),
        "tasks_loaded"
    );
    Ok(tasks)
}

fn build_runner(
    config: &MonitorConfig,
    task: &Task,
    http: reqwest::Client,
    session: Arc<Session>,
    backend: Arc<dyn ChatBackend>,
    fanout: Arc<NotificationFanout>,
    shutdown: CancellationToken,
) -> TaskRunner {
    let solver: Box<dyn ChallengeSolver> = match config.guard.solver {
        SolverKind::Grid => Box::new(GridSolver::new()),
        SolverKind::None => Box::new(NoSolver),
    };
    let guard = Arc::new(ResilienceGuard::new(config.guard.clone(), solver, shutdown));
    let mtop = MtopClient::new(http.clone(), &config.source, session.clone());

    let api = || -> Box<dyn ListingSource> {
        Box::new(ApiSource::new(
            mtop.clone(),
            config.source.page_size,
            config.judge.debug,
        ))
    };
    let browser = || -> Box<dyn ListingSource> {
        Box::new(BrowserSource::new(
            config.source.clone(),
            &config.guard,
            session.clone(),
            guard.clone(),
        ))
    };
    let source: Box<dyn ListingSource> = match config.source.strategy {
        SourceStrategy::Api => api(),
        SourceStrategy::Browser => browser(),
        SourceStrategy::Auto => Box::new(FallbackSource::new(api(), browser())),
    };

    TaskRunner::new(
        source,
        Box::new(enrich::MtopEnricher::new(mtop.clone(), retry::RetryPolicy::default())),
        Arc::new(judge::AiJudge::new(
            backend,
            config.judge.clone(),
            config.llm.max_tokens,
            retry::RetryPolicy::default(),
        )),
        fanout,
        guard.clone(),
        images::ImageStore::new(http, &config.storage.image_dir, &task.task_name),
        RunnerOptions {
            ledger_dir: config.storage.ledger_dir.clone(),
            skip_ai: config.judge.skip_analysis,
            pc_url_to_mobile: config.notify.pc_url_to_mobile,
            task_timeout: config.scheduler.task_timeout,
        },
    )
}

#[derive(Clone)]
struct AppState {
    board: StatusBoard,
    prometheus: PrometheusHandle,
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health))
        .route("/tasks", get(list_tasks))
        .route("/tasks/{name}", get(get_task))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Liveness check.
///
/// - Method: `GET`
/// - Path: `/health`
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "argus-monitor-rs",
    }))
}

/// Last known state of every configured task.
async fn list_tasks(State(state): State<AppState>) -> Json<Vec<jobs::TaskStatus>> {
    crate::metrics::inc_requests("/tasks");
    Json(state.board.snapshot().await)
}

async fn get_task(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<jobs::TaskStatus>, AppError> {
    crate::metrics::inc_requests("/tasks/{name}");
    state
        .board
        .get(&name)
        .await
        .map(Json)
        .ok_or(AppError::NotFound(name))
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap_or_default();
        }
    }
    axum::http::Response::builder()
        .header("content-type", "text/plain; version=0.0.4")
        .body(state.prometheus.render())
        .unwrap_or_default()
}

#[derive(Debug, Serialize)]
struct ApiError {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[derive(Debug)]
enum AppError {
    NotFound(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::NotFound(name) => {
                let payload = ApiError {
                    error: "not_found".into(),
                    detail: Some(format!("no task named `{name}`")),
                };
                (StatusCode::NOT_FOUND, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> Router {
        router(AppState {
            board: StatusBoard::default(),
            prometheus: PrometheusBuilder::new().build_recorder().handle(),
        })
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (status, body) = get_json(app(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn task_listing_and_lookup() {
        let (status, body) = get_json(app(), "/tasks").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));

        let (status, body) = get_json(app(), "/tasks/unknown").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn tasks_file_accepts_json_and_yaml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let json_path = dir.path().join("config.json");
        tokio::fs::write(
            &json_path,
            r#"[{"task_name": "Sony A7M4", "keyword": "A7M4", "min_price": 10000, "ai_prompt_text": "x"}]"#,
        )
        .await
        .expect("write");
        let tasks = load_tasks(&json_path).await.expect("json tasks");
        assert_eq!(tasks[0].min_price.as_deref(), Some("10000"));

        let yaml_path = dir.path().join("tasks.yaml");
        tokio::fs::write(
            &yaml_path,
            "- task_name: MacBook\n  keyword: macbook air m1\n  max_pages: 2\n  enabled: false\n",
        )
        .await
        .expect("write");
        let tasks = load_tasks(&yaml_path).await.expect("yaml tasks");
        assert_eq!(tasks[0].max_pages, 2);
        assert!(!tasks[0].enabled);

        let empty = dir.path().join("empty.json");
        tokio::fs::write(&empty, "[]").await.expect("write");
        assert!(load_tasks(&empty).await.is_err());
    }
}
