use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use corebroker::client::ControllerClient;
use corebroker::config::AgentConfig;
use corebroker::core::affinity::{ProcfsSampler, SchedAffinity};
use corebroker::core::agent::{AffinityResponse, AllocateRequest, Registration, ReleaseRequest};
use corebroker::core::executor::{AgentExecutor, ExecutorError};
use std::sync::Arc;
use std::time::Duration;

pub type SharedExecutor = Arc<AgentExecutor>;

pub async fn run(config: AgentConfig) -> anyhow::Result<()> {
    let name = config
        .name
        .clone()
        .or_else(corebroker::utils::hostname)
        .context("No agent name configured and the hostname is unavailable")?;
    let total_cores = config
        .total_cores
        .unwrap_or_else(corebroker::utils::available_cpus);
    let affinity = SchedAffinity::new().context("Failed to read this process's CPU affinity")?;

    let executor = AgentExecutor::new(
        name.clone(),
        total_cores,
        config.core_offset,
        Box::new(affinity),
        Box::new(ProcfsSampler::default()),
    )
    .with_sample_window(Duration::from_millis(config.sample_window_ms))
    .with_local_cpu_ids(config.local_cpu_ids);
    let executor = Arc::new(executor);

    let advertise = config
        .advertise_host
        .clone()
        .unwrap_or_else(|| corebroker::utils::local_ip().to_string());
    let registration = Registration {
        vm_name: name.clone(),
        endpoint: Some(format!("http://{advertise}:{}", config.port)),
        total_cores: Some(total_cores),
        core_offset: Some(config.core_offset),
    };
    let client = ControllerClient::build(&config.controller_url)?;
    tokio::spawn(crate::heartbeat::run(
        client,
        registration,
        Duration::from_secs(config.heartbeat_secs.max(1)),
    ));

    let app = router(executor);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(
        "Agent {name} managing cores {}..{} listening on: {addr}",
        config.core_offset,
        config.core_offset + total_cores
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received shutdown signal");
            }
        })
        .await?;
    Ok(())
}

pub fn router(executor: SharedExecutor) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/allocate", post(allocate))
        .route("/release", post(release))
        .route("/health", get(get_health))
        .with_state(executor)
}

fn error_response(job: &str, e: ExecutorError) -> (StatusCode, Json<AffinityResponse>) {
    let status = match &e {
        ExecutorError::JobNotFound(_) => StatusCode::NOT_FOUND,
        ExecutorError::Bind { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    tracing::warn!(job, "{e}");
    (
        status,
        Json(AffinityResponse {
            ok: false,
            job: Some(job.to_string()),
            cores: Vec::new(),
            error: Some(e.to_string()),
        }),
    )
}

#[axum::debug_handler]
async fn status(State(executor): State<SharedExecutor>) -> impl IntoResponse {
    (StatusCode::OK, Json(executor.status().await))
}

#[axum::debug_handler]
async fn allocate(
    State(executor): State<SharedExecutor>,
    Json(input): Json<AllocateRequest>,
) -> impl IntoResponse {
    match executor.allocate(&input.job, input.pid, &input.cores) {
        Ok(cores) => (
            StatusCode::OK,
            Json(AffinityResponse {
                ok: true,
                job: Some(input.job),
                cores,
                error: None,
            }),
        ),
        Err(e) => error_response(&input.job, e),
    }
}

#[axum::debug_handler]
async fn release(
    State(executor): State<SharedExecutor>,
    Json(input): Json<ReleaseRequest>,
) -> impl IntoResponse {
    match executor.release(&input.job, &input.keep_cores) {
        Ok(cores) => (
            StatusCode::OK,
            Json(AffinityResponse {
                ok: true,
                job: Some(input.job),
                cores,
                error: None,
            }),
        ),
        Err(e) => error_response(&input.job, e),
    }
}

#[axum::debug_handler]
async fn get_health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}
