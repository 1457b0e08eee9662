use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use corebroker::config::ControllerConfig;
use corebroker::core::agent::Registration;
use corebroker::core::audit::{AuditLog, AuditStore};
use corebroker::core::broker::{Broker, BrokerSettings};
use corebroker::core::info::{
    CompleteRequest, CompleteResponse, CoreRequest, RequestResponse, RequestStatus,
};
use corebroker::core::steal::StealPolicy;
use corebroker::core::transport::HttpAgentTransport;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

pub type SharedBroker = Arc<Broker>;

pub async fn run(config: ControllerConfig) -> anyhow::Result<()> {
    let transport = Arc::new(HttpAgentTransport::new(Duration::from_secs(
        config.agent_timeout_secs,
    ))?);
    let settings = BrokerSettings {
        policy: StealPolicy {
            min_cores_per_job: config.min_cores_per_job,
            reserve_buffer: config.reserve_buffer,
        },
        activity_capacity: config.activity_capacity,
    };
    let mut broker = Broker::new(transport, settings);

    if !config.no_audit {
        let path = match &config.audit_db {
            Some(path) => path.clone(),
            None => corebroker::core::get_data_dir()?.join("alloc_log.db"),
        };
        match AuditStore::open(&path) {
            Ok(store) => {
                tracing::info!("Writing audit trail to {}", path.display());
                broker = broker.with_audit(AuditLog::spawn(store));
            }
            Err(e) => tracing::warn!("Audit trail disabled: {e:#}"),
        }
    }

    let broker = Arc::new(broker);
    let interval = Duration::from_millis(config.sched_interval_ms.max(1));
    tokio::spawn({
        let broker = Arc::clone(&broker);
        async move {
            tracing::info!("Starting scheduler, pass every {interval:?}");
            broker.run(interval).await;
        }
    });

    let app = router(Arc::clone(&broker));
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on: {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received shutdown signal");
            }
        })
        .await?;

    broker.flush_audit().await;
    Ok(())
}

pub fn router(broker: SharedBroker) -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/request", post(request))
        .route("/complete", post(complete))
        .route("/summary", get(summary))
        .route("/health", get(get_health))
        .with_state(broker)
}

#[axum::debug_handler]
async fn register(
    State(broker): State<SharedBroker>,
    Json(input): Json<Registration>,
) -> impl IntoResponse {
    match broker.register(input).await {
        Ok(created) => (
            StatusCode::OK,
            Json(serde_json::json!({ "ok": true, "created": created })),
        ),
        Err(e) => {
            tracing::warn!("Registration rejected: {e}");
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "ok": false, "message": e.to_string() })),
            )
        }
    }
}

#[axum::debug_handler]
async fn request(
    State(broker): State<SharedBroker>,
    Json(input): Json<CoreRequest>,
) -> impl IntoResponse {
    match broker
        .request(&input.vm, &input.job, input.pid, input.cores_requested)
        .await
    {
        Ok(_) => (
            StatusCode::OK,
            Json(RequestResponse {
                status: RequestStatus::Queued,
                message: None,
            }),
        ),
        Err(e) => {
            tracing::warn!("Request rejected: {e}");
            (
                StatusCode::BAD_REQUEST,
                Json(RequestResponse {
                    status: RequestStatus::Error,
                    message: Some(e.to_string()),
                }),
            )
        }
    }
}

#[axum::debug_handler]
async fn complete(
    State(broker): State<SharedBroker>,
    Json(input): Json<CompleteRequest>,
) -> impl IntoResponse {
    match broker.complete(&input.vm, &input.job).await {
        Ok(freed) => (
            StatusCode::OK,
            Json(CompleteResponse {
                ok: true,
                freed,
                message: None,
            }),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(CompleteResponse {
                ok: false,
                freed: Vec::new(),
                message: Some(e.to_string()),
            }),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct SummaryQuery {
    #[serde(default = "default_live")]
    live: bool,
}

fn default_live() -> bool {
    true
}

#[axum::debug_handler]
async fn summary(
    State(broker): State<SharedBroker>,
    Query(query): Query<SummaryQuery>,
) -> impl IntoResponse {
    (StatusCode::OK, Json(broker.summary(query.live).await))
}

#[axum::debug_handler]
async fn get_health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use corebroker::core::agent::{Agent, AgentStatus, AllocateRequest, ReleaseRequest};
    use corebroker::core::info::Summary;
    use corebroker::core::transport::{AgentCallError, AgentTransport};
    use corebroker::core::CoreIndex;
    use tower::ServiceExt;

    /// Agents that accept every call and report no jobs.
    struct AcceptingAgents;

    #[async_trait]
    impl AgentTransport for AcceptingAgents {
        async fn status(&self, agent: &Agent) -> Result<AgentStatus, AgentCallError> {
            Ok(AgentStatus {
                vm: agent.name.clone(),
                total_cores: agent.total_cores,
                offset: agent.core_offset,
                jobs: vec![],
            })
        }

        async fn allocate(
            &self,
            _agent: &Agent,
            req: &AllocateRequest,
        ) -> Result<Vec<CoreIndex>, AgentCallError> {
            Ok(req.cores.clone())
        }

        async fn release(
            &self,
            _agent: &Agent,
            req: &ReleaseRequest,
        ) -> Result<Vec<CoreIndex>, AgentCallError> {
            Ok(req.keep_cores.clone())
        }
    }

    fn test_broker() -> SharedBroker {
        Arc::new(Broker::new(
            Arc::new(AcceptingAgents),
            BrokerSettings::default(),
        ))
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(if method == "GET" {
                Body::empty()
            } else {
                Body::from(body.to_string())
            })
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn register_vm1(app: &Router) {
        let (status, body) = call(
            app,
            "POST",
            "/register",
            serde_json::json!({
                "vm_name": "vm1",
                "endpoint": "http://10.0.0.2:5001",
                "total_cores": 4,
                "core_offset": 0
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(test_broker());
        let (status, body) = call(&app, "GET", "/health", serde_json::Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_request_then_summary() {
        let broker = test_broker();
        let app = router(Arc::clone(&broker));
        register_vm1(&app).await;

        let (status, body) = call(
            &app,
            "POST",
            "/request",
            serde_json::json!({ "vm": "vm1", "job": "train", "pid": 100, "cores_requested": 4 }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "queued");

        broker.run_pass().await;

        let (status, body) =
            call(&app, "GET", "/summary?live=false", serde_json::Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        let summary: Summary = serde_json::from_value(body).unwrap();
        assert_eq!(summary.allocation("vm1", "train"), Some(&[0, 1, 2, 3][..]));
        assert!(summary.live_jobs.is_empty());

        let (_, body) = call(&app, "GET", "/summary", serde_json::Value::Null).await;
        assert_eq!(body["live_jobs"]["vm1"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_request_unknown_agent() {
        let app = router(test_broker());
        let (status, body) = call(
            &app,
            "POST",
            "/request",
            serde_json::json!({ "vm": "vm9", "job": "train", "pid": 100, "cores_requested": 1 }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
        assert!(body["message"].as_str().unwrap().contains("vm9"));
    }

    #[tokio::test]
    async fn test_register_incomplete_first_time() {
        let app = router(test_broker());
        let (status, body) = call(
            &app,
            "POST",
            "/register",
            serde_json::json!({ "vm_name": "vm1" }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);
    }

    #[tokio::test]
    async fn test_complete_twice() {
        let broker = test_broker();
        let app = router(Arc::clone(&broker));
        register_vm1(&app).await;
        broker.request("vm1", "train", 100, 2).await.unwrap();
        broker.run_pass().await;

        let done = serde_json::json!({ "vm": "vm1", "job": "train", "pid": 100 });
        let (status, body) = call(&app, "POST", "/complete", done.clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["freed"], serde_json::json!([0, 1]));

        let (status, body) = call(&app, "POST", "/complete", done).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);
    }
}
