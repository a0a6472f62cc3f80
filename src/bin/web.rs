//! Jotlin Web 服务
//!
//! 启动: cargo run --bin jotlin-web --features web
//!
//! - `POST /api/chats/:chat_id/stream`：流式回复（`data: ...\n\n` 帧），可同时触发文档生成
//! - `/api/requirements/*`：后台需求任务的提交、状态与结果
//!
//! 未配置 `[requirements] base_url` 时任务在本进程内执行；配置后转发到远端服务。

#![cfg(feature = "web")]

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures_util::stream;
use serde::Deserialize;

use jotlin_stream::chat::{ChatStore, Message};
use jotlin_stream::client::StreamRequest;
use jotlin_stream::config::{load_config, AppConfig};
use jotlin_stream::core::{RequirementError, ShutdownManager};
use jotlin_stream::llm::{create_llm_from_config, LlmClient};
use jotlin_stream::observability;
use jotlin_stream::requirements::{
    HttpRequirementClient, JobPoller, LlmRequirementWorkflow, PollerConfig, RequirementClient,
    RequirementRequest, RequirementService, SubmitResponse, TaskStatus, TaskStatusReport,
};
use jotlin_stream::stream::{FrameWriter, ProducerError, ProducerRequest, StreamProducer};

/// 每个流的帧缓冲；写满时生产者等待，客户端断开时写入失败
const FRAME_BUFFER: usize = 64;

const CHAT_SUBMIT_MESSAGE: &str =
    "AI agents are analyzing your requirements and generating documents. This may take a few minutes.";

struct AppState {
    config: AppConfig,
    producer: StreamProducer,
    chats: ChatStore,
    jobs: Arc<dyn RequirementClient>,
    shutdown: Arc<ShutdownManager>,
}

#[derive(Deserialize)]
struct ResultQuery {
    #[serde(default = "default_formatted")]
    formatted: bool,
}

fn default_formatted() -> bool {
    true
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cfg = load_config(None).context("Failed to load configuration")?;
    let llm = create_llm_from_config(&cfg.llm);
    let jobs = requirement_backend(&cfg, Arc::clone(&llm));
    let poller = JobPoller::new(Arc::clone(&jobs), PollerConfig::from(&cfg.requirements));
    let producer = StreamProducer::new(llm, Arc::clone(&jobs), poller, cfg.llm.system_prompt.clone());

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let port = cfg.web.effective_port();
    let state = Arc::new(AppState {
        config: cfg,
        producer,
        chats: ChatStore::new(),
        jobs,
        shutdown: Arc::clone(&shutdown),
    });
    let app = router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Jotlin Web: http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait_for_shutdown().await })
        .await
        .context("Server error")?;

    tracing::info!("Jotlin Web stopped");
    Ok(())
}

fn requirement_backend(cfg: &AppConfig, llm: Arc<dyn LlmClient>) -> Arc<dyn RequirementClient> {
    match cfg.requirements.base_url.as_deref() {
        Some(url) => {
            tracing::info!(url, "Using remote requirement service");
            Arc::new(HttpRequirementClient::new(
                Some(url),
                Duration::from_secs(cfg.requirements.request_timeout_secs),
            ))
        }
        None => {
            tracing::info!("Running requirement tasks in-process");
            Arc::new(RequirementService::new(Arc::new(LlmRequirementWorkflow::new(llm))))
        }
    }
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(api_health))
        .route("/api/chats/:chat_id/stream", post(api_chat_stream))
        .route("/api/requirements/generate", post(api_generate))
        .route(
            "/api/requirements/generate-from-chat",
            post(api_generate_from_chat),
        )
        .route("/api/requirements/status/:task_id", get(api_task_status))
        .route("/api/requirements/result/:task_id", get(api_task_result))
        .with_state(state)
}

async fn api_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// 流式聊天：纯文本帧流，首个信号之前先写出任务启动信号（若请求生成文档）
async fn api_chat_stream(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<String>,
    Json(req): Json<StreamRequest>,
) -> Result<Response, (StatusCode, String)> {
    let message = req.message.trim().to_string();
    if message.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "message is required".to_string()));
    }

    let history = state
        .chats
        .recent(&chat_id, state.config.llm.history_messages)
        .await;
    let (writer, rx) = FrameWriter::channel(FRAME_BUFFER);
    let cancel = state.shutdown.stream_token();

    let state_spawn = Arc::clone(&state);
    tokio::spawn(async move {
        let request = ProducerRequest {
            chat_id: chat_id.clone(),
            message: message.clone(),
            history,
            generate_documents: req.generate_documents,
        };
        match state_spawn.producer.run(request, writer, cancel).await {
            Ok(summary) => {
                state_spawn.chats.append(&chat_id, Message::user(message)).await;
                state_spawn
                    .chats
                    .append(&chat_id, Message::assistant(summary.reply))
                    .await;
                tracing::info!(
                    chat_id = %chat_id,
                    task_id = ?summary.task_id,
                    documents = summary.documents,
                    "Chat stream finished"
                );
            }
            Err(ProducerError::ClientDisconnected) => {
                tracing::info!(chat_id = %chat_id, "Client disconnected, stream dropped");
            }
            Err(e) => tracing::warn!(chat_id = %chat_id, error = %e, "Chat stream ended with error"),
        }
    });

    let body = stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|frame| (Ok::<Bytes, Infallible>(Bytes::from(frame)), rx))
    });
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body))
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn api_generate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RequirementRequest>,
) -> Result<Json<SubmitResponse>, (StatusCode, String)> {
    submit(&state, &req.initial_requirements, None).await
}

async fn api_generate_from_chat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RequirementRequest>,
) -> Result<Json<SubmitResponse>, (StatusCode, String)> {
    submit(&state, &req.initial_requirements, Some(CHAT_SUBMIT_MESSAGE)).await
}

async fn submit(
    state: &AppState,
    initial_requirements: &str,
    message: Option<&str>,
) -> Result<Json<SubmitResponse>, (StatusCode, String)> {
    if initial_requirements.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "initial_requirements is required".to_string(),
        ));
    }
    let mut submitted = state
        .jobs
        .submit(initial_requirements)
        .await
        .map_err(job_error)?;
    submitted.status = TaskStatus::Started;
    if let Some(message) = message {
        submitted.message = message.to_string();
    }
    tracing::info!(task_id = %submitted.task_id, "Requirement task submitted");
    Ok(Json(submitted))
}

async fn api_task_status(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskStatusReport>, (StatusCode, String)> {
    state
        .jobs
        .status(&task_id)
        .await
        .map(Json)
        .map_err(job_error)
}

async fn api_task_result(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    Query(q): Query<ResultQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    if q.formatted {
        let formatted = state
            .jobs
            .formatted_result(&task_id)
            .await
            .map_err(job_error)?;
        serde_json::to_value(formatted)
            .map(Json)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
    } else {
        state
            .jobs
            .raw_result(&task_id)
            .await
            .map(Json)
            .map_err(job_error)
    }
}

fn job_error(err: RequirementError) -> (StatusCode, String) {
    match err {
        RequirementError::NotFound(_) => (StatusCode::NOT_FOUND, "Task not found".to_string()),
        RequirementError::NotCompleted { status, .. } => (
            StatusCode::BAD_REQUEST,
            format!("Task is not completed. Current status: {}", status),
        ),
        RequirementError::Http(e) => (StatusCode::BAD_GATEWAY, e.to_string()),
        other => {
            tracing::error!(error = %other, "Requirement service error");
            (StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    }
}
