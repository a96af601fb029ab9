use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use common::results::{SchedulerEvent, SubmitReceipt, TaskReport};
use common::worker::{
    ClusterStats, MailboxPollRequest, MailboxPollResponse, WorkerHeartbeatRequest,
    WorkerHeartbeatResponse, WorkerMetrics, WorkerRegisterRequest, WorkerRegisterResponse,
};
use common::{MessageEnvelope, TaskDeclaration};

use crate::coordinator::{Coordinator, CoordinatorError};
use crate::scheduler::SchedulerError;
use crate::transport::{MailboxTransport, TransportError};

/// Tope de sobres por poll, para no armar respuestas gigantes.
const MAX_POLL: usize = 64;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub mailbox: Arc<MailboxTransport>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/tasks", post(submit_task))
        .route("/api/v1/tasks/:id", get(get_task))
        .route("/api/v1/tasks/:id/events", get(get_task_events))
        .route("/api/v1/stats", get(stats))
        .route("/api/v1/workers", get(list_workers))
        .route("/api/v1/workers/register", post(register_worker))
        .route("/api/v1/workers/heartbeat", post(worker_heartbeat))
        .route("/api/v1/messages", post(post_message))
        .route("/api/v1/messages/poll", post(poll_messages))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- errores ---------------- */

pub struct ApiError(CoordinatorError);

impl From<CoordinatorError> for ApiError {
    fn from(e: CoordinatorError) -> Self {
        Self(e)
    }
}

impl From<TransportError> for ApiError {
    fn from(e: TransportError) -> Self {
        Self(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoordinatorError::Invalid(_) | CoordinatorError::Split(_) | CoordinatorError::Privacy(_) => {
                StatusCode::BAD_REQUEST
            }
            CoordinatorError::UnknownTask(_)
            | CoordinatorError::UnknownWorker(_)
            | CoordinatorError::Transport(TransportError::UnknownNode(_))
            | CoordinatorError::Scheduler(SchedulerError::UnknownJob(_)) => StatusCode::NOT_FOUND,
            CoordinatorError::Scheduler(_) => StatusCode::CONFLICT,
            CoordinatorError::Protocol(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Valida, transforma y parte la tarea; los jobs salen en el mismo request si hay workers
async fn submit_task(
    State(state): State<AppState>,
    Json(decl): Json<TaskDeclaration>,
) -> Result<(StatusCode, Json<SubmitReceipt>), ApiError> {
    let now = Utc::now();
    let receipt = state.coordinator.submit(decl, now)?;
    state.coordinator.dispatch(now);
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskReport>, ApiError> {
    state
        .coordinator
        .task_report(&id)
        .map(Json)
        .ok_or_else(|| CoordinatorError::UnknownTask(id).into())
}

async fn get_task_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<SchedulerEvent>>, ApiError> {
    state
        .coordinator
        .events(&id)
        .map(Json)
        .ok_or_else(|| CoordinatorError::UnknownTask(id).into())
}

async fn stats(State(state): State<AppState>) -> Json<ClusterStats> {
    Json(state.coordinator.stats())
}

async fn list_workers(State(state): State<AppState>) -> Json<Vec<WorkerMetrics>> {
    Json(state.coordinator.worker_metrics(Utc::now()))
}

// Registra un worker nuevo y le abre el buzón
async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<WorkerRegisterRequest>,
) -> Json<WorkerRegisterResponse> {
    let now = Utc::now();
    let worker_id = state
        .coordinator
        .register_worker(&req.hostname, req.max_concurrency, now);
    state.mailbox.open(&worker_id);
    state.coordinator.dispatch(now);
    Json(WorkerRegisterResponse {
        worker_id,
        coordinator_id: state.coordinator.node_id().to_string(),
    })
}

async fn worker_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<WorkerHeartbeatRequest>,
) -> Result<Json<WorkerHeartbeatResponse>, ApiError> {
    state.coordinator.heartbeat(&req, Utc::now())?;
    Ok(Json(WorkerHeartbeatResponse { ok: true }))
}

// Sobre entrante de un worker (JOB_ACK, JOB_RESULT, JOB_FAIL)
async fn post_message(
    State(state): State<AppState>,
    Json(envelope): Json<MessageEnvelope>,
) -> Result<StatusCode, ApiError> {
    let now = Utc::now();
    if let Err(e) = state.coordinator.handle_envelope(&envelope, now) {
        warn!(
            "sobre {} {} de {} rechazado: {}",
            envelope.msg_type.as_str(),
            envelope.msg_id,
            envelope.src_node,
            e
        );
        return Err(e.into());
    }
    state.coordinator.dispatch(now);
    Ok(StatusCode::ACCEPTED)
}

async fn poll_messages(
    State(state): State<AppState>,
    Json(req): Json<MailboxPollRequest>,
) -> Result<Json<MailboxPollResponse>, ApiError> {
    let envelopes = state.mailbox.drain(&req.node_id, req.max.min(MAX_POLL))?;
    if !envelopes.is_empty() {
        info!("worker {} retira {} sobres", req.node_id, envelopes.len());
    }
    Ok(Json(MailboxPollResponse { envelopes }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::verification::InMemoryReputation;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use common::engine::execute_builtin;
    use common::protocol::{AckStatus, JobAck};
    use common::{JobResult, Message};
    use serde_json::Value;
    use tower::ServiceExt;

    fn app() -> Router {
        let mailbox = Arc::new(MailboxTransport::new());
        let coordinator = Arc::new(Coordinator::new(
            CoordinatorConfig::default(),
            mailbox.clone(),
            Arc::new(InMemoryReputation::new()),
        ));
        build_router(AppState { coordinator, mailbox })
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_responde_ok() {
        let app = app();
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn tarea_invalida_es_400_con_todas_las_violaciones() {
        let app = app();
        let (status, body) = call(
            &app,
            "POST",
            "/api/v1/tasks",
            Some(json!({"task_type": "range_reduce", "payload": {"start": 5, "end": 1}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let msg = body["error"].as_str().unwrap();
        assert!(msg.contains("owner_id"), "{msg}");
        assert!(msg.contains("start"), "{msg}");
    }

    #[tokio::test]
    async fn ids_desconocidos_son_404() {
        let app = app();
        assert_eq!(call(&app, "GET", "/api/v1/tasks/nada", None).await.0, StatusCode::NOT_FOUND);
        assert_eq!(call(&app, "GET", "/api/v1/tasks/nada/events", None).await.0, StatusCode::NOT_FOUND);
        let (status, _) = call(
            &app,
            "POST",
            "/api/v1/workers/heartbeat",
            Some(json!({"worker_id": "fantasma"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, "POST", "/api/v1/messages/poll", Some(json!({"node_id": "fantasma"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sobre_mal_formado_es_422() {
        let app = app();
        let (status, _) = call(
            &app,
            "POST",
            "/api/v1/messages",
            Some(json!({
                "msg_type": "JOB_RESULT",
                "msg_id": "m1",
                "src_node": "w1",
                "dst_node": "coordinator",
                "timestamp": Utc::now(),
                "payload": {"job_id": 7}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn flujo_completo_por_http() {
        let app = app();
        let (status, reg) = call(
            &app,
            "POST",
            "/api/v1/workers/register",
            Some(json!({"hostname": "h1", "max_concurrency": 4})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let worker = reg["worker_id"].as_str().unwrap().to_string();
        let coordinator_id = reg["coordinator_id"].as_str().unwrap().to_string();

        let (status, receipt) = call(
            &app,
            "POST",
            "/api/v1/tasks",
            Some(json!({
                "owner_id": "alice",
                "task_type": "map_reduce",
                "payload": {"data": [1, 2, 3, 4], "map_function": "square", "reduce_function": "sum", "chunk_size": 2}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(receipt["jobs"], 2);
        let task_id = receipt["task_id"].as_str().unwrap().to_string();

        let (_, polled) = call(&app, "POST", "/api/v1/messages/poll", Some(json!({"node_id": worker}))).await;
        let envelopes: Vec<MessageEnvelope> = serde_json::from_value(polled["envelopes"].clone()).unwrap();
        assert_eq!(envelopes.len(), 2);

        for env in envelopes {
            let Message::Assign(a) = env.decode().unwrap() else { panic!("se esperaba JOB_ASSIGN") };
            let ack = Message::Ack(JobAck {
                task_id: a.task_id.clone(),
                job_id: a.job_id.clone(),
                status: AckStatus::Accepted,
                reason: None,
            })
            .into_envelope(&worker, &coordinator_id)
            .unwrap();
            let (status, _) = call(&app, "POST", "/api/v1/messages", Some(serde_json::to_value(ack).unwrap())).await;
            assert_eq!(status, StatusCode::ACCEPTED);

            let out = execute_builtin(&a.code_ref, &a.input_payload).unwrap();
            let result = Message::Result(JobResult::ok(&a.task_id, &a.job_id, &worker, a.attempt, out, 5))
                .into_envelope(&worker, &coordinator_id)
                .unwrap();
            let (status, _) = call(&app, "POST", "/api/v1/messages", Some(serde_json::to_value(result).unwrap())).await;
            assert_eq!(status, StatusCode::ACCEPTED);
        }

        let (status, report) = call(&app, "GET", &format!("/api/v1/tasks/{task_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["status"], "COMPLETED");
        assert_eq!(report["result"], json!(30));

        let (_, events) = call(&app, "GET", &format!("/api/v1/tasks/{task_id}/events"), None).await;
        assert!(events.as_array().unwrap().len() >= 8);

        let (_, stats) = call(&app, "GET", "/api/v1/stats", None).await;
        assert_eq!(stats["tasks_completed"], 1);
        let (_, workers) = call(&app, "GET", "/api/v1/workers", None).await;
        assert_eq!(workers[0]["jobs_succeeded"], 2);
    }
}
