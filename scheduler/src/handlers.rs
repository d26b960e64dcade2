use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use common::tz::{local_to_utc, parse_timezone};
use common::{
    parse_job_document, parse_scheduled_document, AckResponse, AgentHeartbeatRequest, AgentHeartbeatResponse,
    AgentRegisterRequest, AgentRegisterResponse, AgentSummary, CancelResponse,
    DocumentError, ErrorBody, ExecutionTarget, ExecutionView, JobCompleteRequest,
    JobExecutionResult, JobStatusUpdate, PollResponse, RegistrationOutcome, ScheduleView,
    SubmitResponse,
};

use crate::auth::AgentAuth;
use crate::engine::{EngineStatus, HIGH_PRIORITY};
use crate::error::{DispatchError, EngineError, ScheduleError};
use crate::queue::{ActiveJob, QueueStatus, QueuedJobView};
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // superficie de agentes
        .route("/api/v1/agent/register", post(register_agent))
        .route("/api/v1/agent/heartbeat", post(agent_heartbeat))
        .route("/api/v1/agent/jobs/poll", get(poll_jobs))
        .route("/api/v1/agent/jobs/:execution_id/status", post(report_status))
        .route("/api/v1/agent/jobs/:execution_id/complete", post(complete_job))
        .route("/api/v1/agent/:agent_id/approve", post(approve_agent))
        .route("/api/v1/agent/:agent_id/deactivate", post(deactivate_agent))
        .route("/api/v1/agents", get(list_agents))
        // superficie de jobs
        .route("/api/v1/jobs", post(submit_job))
        .route("/api/v1/jobs/run", post(run_job_now))
        .route(
            "/api/v1/executions/:execution_id",
            get(get_execution).delete(cancel_execution),
        )
        .route("/api/v1/queues", get(list_queues))
        .route("/api/v1/queues/*timezone", get(get_queue))
        .route("/api/v1/engine", get(engine_status))
        // programación recurrente
        .route("/api/v1/schedules", get(list_schedules).post(create_schedule))
        .route(
            "/api/v1/schedules/:job_id",
            get(get_schedule).delete(delete_schedule),
        )
        .route("/api/v1/schedules/:job_id/pause", post(pause_schedule))
        .route("/api/v1/schedules/:job_id/resume", post(resume_schedule))
        .with_state(state)
}

/* ---------------- errores HTTP ---------------- */

#[derive(Debug)]
pub struct ApiError(StatusCode, ErrorBody);

impl ApiError {
    fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self(
            status,
            ErrorBody {
                error: error.into(),
                details: Vec::new(),
            },
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(self.1)).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Validation(v) => ApiError(
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error: format!("job '{}' inválido", v.job_id),
                    details: v.errors,
                },
            ),
            EngineError::NotRunning(_) | EngineError::QueueClosed(_) => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
            EngineError::Timeout { .. } => ApiError::new(StatusCode::GATEWAY_TIMEOUT, e.to_string()),
            EngineError::ResultUnavailable(_) => {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        if let DispatchError::Engine(inner) = e {
            return inner.into();
        }
        let status = match &e {
            DispatchError::NoAgentAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::Transport { .. } => StatusCode::BAD_GATEWAY,
            DispatchError::UnknownExecution(_)
            | DispatchError::UnknownAgent(_)
            | DispatchError::AssignmentNotFound(_) => StatusCode::NOT_FOUND,
            DispatchError::InvalidTransition(_) | DispatchError::InvalidCompletion(_) => {
                StatusCode::CONFLICT
            }
            DispatchError::Engine(_) | DispatchError::Persistence(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        ApiError::new(status, e.to_string())
    }
}

impl From<ScheduleError> for ApiError {
    fn from(e: ScheduleError) -> Self {
        match e {
            ScheduleError::Engine(inner) => inner.into(),
            ScheduleError::NotScheduled(_) => ApiError::new(StatusCode::NOT_FOUND, e.to_string()),
            ScheduleError::InvalidTrigger(_) | ScheduleError::JobDisabled(_) => {
                ApiError::new(StatusCode::BAD_REQUEST, e.to_string())
            }
        }
    }
}

impl From<DocumentError> for ApiError {
    fn from(e: DocumentError) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, e.to_string())
    }
}

type ApiResult<T> = Result<T, ApiError>;

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

async fn register_agent(
    State(state): State<AppState>,
    Json(req): Json<AgentRegisterRequest>,
) -> ApiResult<(StatusCode, Json<AgentRegisterResponse>)> {
    let missing: Vec<String> = [
        ("agent_id", &req.agent_id),
        ("name", &req.agent_name),
        ("hostname", &req.hostname),
        ("ip_address", &req.ip_address),
    ]
    .iter()
    .filter(|(_, v)| v.trim().is_empty())
    .map(|(k, _)| format!("falta el campo '{}'", k))
    .collect();
    if !missing.is_empty() {
        return Err(ApiError(
            StatusCode::BAD_REQUEST,
            ErrorBody {
                error: "registro inválido".into(),
                details: missing,
            },
        ));
    }

    let (outcome, record) = state.registry.register(req)?;
    let token = state.tokens.issue(&record.agent_id);
    let code = match outcome {
        RegistrationOutcome::Created => StatusCode::CREATED,
        RegistrationOutcome::Updated => StatusCode::OK,
    };

    Ok((
        code,
        Json(AgentRegisterResponse {
            status: outcome,
            agent_id: record.agent_id,
            token,
            token_expires_in: state.tokens.ttl_secs(),
            is_approved: record.is_approved,
        }),
    ))
}

async fn agent_heartbeat(
    State(state): State<AppState>,
    AgentAuth(agent_id): AgentAuth,
    Json(req): Json<AgentHeartbeatRequest>,
) -> ApiResult<Json<AgentHeartbeatResponse>> {
    let record = state.registry.heartbeat(&agent_id, &req)?;
    Ok(Json(AgentHeartbeatResponse {
        ok: true,
        is_approved: record.is_approved,
        server_time: Utc::now(),
    }))
}

#[derive(Debug, Deserialize)]
struct PollQuery {
    agent_id: Option<String>,
    max_jobs: Option<usize>,
}

async fn poll_jobs(
    State(state): State<AppState>,
    AgentAuth(agent_id): AgentAuth,
    Query(q): Query<PollQuery>,
) -> ApiResult<Json<PollResponse>> {
    if q.agent_id.as_deref().is_some_and(|id| id != agent_id) {
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "el token no corresponde a ese agente",
        ));
    }
    let max_jobs = q.max_jobs.unwrap_or(1).max(1);
    Ok(Json(state.dispatcher.poll(&agent_id, max_jobs).await?))
}

async fn report_status(
    State(state): State<AppState>,
    AgentAuth(agent_id): AgentAuth,
    Path(execution_id): Path<String>,
    Json(update): Json<JobStatusUpdate>,
) -> ApiResult<Json<AckResponse>> {
    state
        .dispatcher
        .report_status(&agent_id, &execution_id, update)?;
    Ok(Json(AckResponse { ok: true }))
}

async fn complete_job(
    State(state): State<AppState>,
    AgentAuth(agent_id): AgentAuth,
    Path(execution_id): Path<String>,
    Json(req): Json<JobCompleteRequest>,
) -> ApiResult<Json<AckResponse>> {
    state.dispatcher.complete(&agent_id, &execution_id, req)?;
    Ok(Json(AckResponse { ok: true }))
}

async fn approve_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> ApiResult<Json<AgentSummary>> {
    let agent = state.registry.set_approved(&agent_id, true)?;
    let is_online = agent.is_online_at(Utc::now());
    Ok(Json(AgentSummary { agent, is_online }))
}

async fn deactivate_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> ApiResult<Json<AgentSummary>> {
    let agent = state.registry.set_active(&agent_id, false)?;
    let is_online = agent.is_online_at(Utc::now());
    Ok(Json(AgentSummary { agent, is_online }))
}

#[derive(Debug, Deserialize)]
struct AgentsQuery {
    pool: Option<String>,
}

async fn list_agents(
    State(state): State<AppState>,
    Query(q): Query<AgentsQuery>,
) -> ApiResult<Json<Vec<AgentSummary>>> {
    let now = Utc::now();
    let agents = state
        .registry
        .list(q.pool.as_deref())?
        .into_iter()
        .map(|agent| {
            let is_online = agent.is_online_at(now);
            AgentSummary { agent, is_online }
        })
        .collect();
    Ok(Json(agents))
}

#[derive(Debug, Deserialize)]
struct SubmitQuery {
    priority: Option<i32>,
    /// Instante RFC 3339
    scheduled_at: Option<String>,
    /// Hora de pared en la zona del job, `YYYY-mm-ddTHH:MM:SS`
    run_at_local: Option<String>,
}

fn scheduled_time(q: &SubmitQuery, timezone: &str) -> ApiResult<Option<DateTime<Utc>>> {
    if let Some(raw) = &q.scheduled_at {
        let at = DateTime::parse_from_rfc3339(raw).map_err(|e| {
            ApiError::new(StatusCode::BAD_REQUEST, format!("scheduled_at inválido: {}", e))
        })?;
        return Ok(Some(at.with_timezone(&Utc)));
    }
    let Some(raw) = &q.run_at_local else {
        return Ok(None);
    };

    let local = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S").map_err(|e| {
        ApiError::new(StatusCode::BAD_REQUEST, format!("run_at_local inválido: {}", e))
    })?;
    let tz = parse_timezone(timezone).unwrap_or(chrono_tz::UTC);
    local_to_utc(tz, local).map(Some).ok_or_else(|| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("la hora {} no existe en {}", raw, timezone),
        )
    })
}

// Recibe el documento del job (YAML o JSON) y lo enruta al motor o a los agentes
async fn submit_job(
    State(state): State<AppState>,
    Query(q): Query<SubmitQuery>,
    body: String,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let submission = parse_job_document(&body)?;
    let at = scheduled_time(&q, &submission.definition.timezone)?;
    let resp = state.dispatcher.submit(submission, q.priority, at).await?;
    info!(
        "ejecución {} aceptada ({:?})",
        resp.execution_id, resp.status
    );
    Ok((StatusCode::ACCEPTED, Json(resp)))
}

#[derive(Debug, Deserialize)]
struct RunQuery {
    priority: Option<i32>,
}

async fn run_job_now(
    State(state): State<AppState>,
    Query(q): Query<RunQuery>,
    body: String,
) -> ApiResult<Json<JobExecutionResult>> {
    let submission = parse_job_document(&body)?;
    if submission.target != ExecutionTarget::Local {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "la ejecución inmediata sólo admite jobs locales",
        ));
    }
    let result = state
        .engine
        .execute_immediately(submission.definition, q.priority.unwrap_or(HIGH_PRIORITY))
        .await
        .map_err(|e| {
            if let EngineError::Timeout { .. } = e {
                warn!("{}", e);
            }
            ApiError::from(e)
        })?;
    Ok(Json(result))
}

async fn get_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> ApiResult<Json<ExecutionView>> {
    state
        .dispatcher
        .execution(&execution_id)?
        .map(Json)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "ejecución desconocida"))
}

#[derive(Debug, Deserialize)]
struct CancelQuery {
    timezone: Option<String>,
}

async fn cancel_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
    Query(q): Query<CancelQuery>,
) -> ApiResult<Json<CancelResponse>> {
    let cancelled = state
        .dispatcher
        .cancel(&execution_id, q.timezone.as_deref())?;
    Ok(Json(CancelResponse {
        execution_id,
        cancelled,
    }))
}

async fn list_queues(State(state): State<AppState>) -> Json<Vec<QueueStatus>> {
    Json(state.engine.queue_statuses())
}

#[derive(Debug, Serialize)]
struct QueueDetail {
    status: QueueStatus,
    queued_jobs: Vec<QueuedJobView>,
    active_jobs: Vec<ActiveJob>,
}

async fn get_queue(
    State(state): State<AppState>,
    Path(timezone): Path<String>,
) -> ApiResult<Json<QueueDetail>> {
    let timezone = timezone.trim_start_matches('/').to_string();
    let status = state
        .engine
        .queue_status(&timezone)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "cola desconocida"))?;
    let queued_jobs = state
        .engine
        .queued_jobs()
        .remove(&timezone)
        .unwrap_or_default();
    let active_jobs = state
        .engine
        .active_jobs()
        .remove(&timezone)
        .unwrap_or_default();
    Ok(Json(QueueDetail {
        status,
        queued_jobs,
        active_jobs,
    }))
}

async fn engine_status(State(state): State<AppState>) -> Json<EngineStatus> {
    Json(state.engine.status())
}

#[derive(Debug, Deserialize)]
struct ScheduleListQuery {
    /// Sólo las próximas N programaciones activas, por fecha de disparo
    upcoming: Option<usize>,
}

async fn list_schedules(
    State(state): State<AppState>,
    Query(q): Query<ScheduleListQuery>,
) -> Json<Vec<ScheduleView>> {
    Json(match q.upcoming {
        Some(limit) => state.schedules.next_run_times(limit),
        None => state.schedules.list(),
    })
}

// Documento de job con bloque `schedule`; reemplaza la programación previa del job
async fn create_schedule(
    State(state): State<AppState>,
    Query(q): Query<RunQuery>,
    body: String,
) -> ApiResult<(StatusCode, Json<ScheduleView>)> {
    let (submission, trigger) = parse_scheduled_document(&body)?;
    let view = state.schedules.schedule_job(submission, trigger, q.priority)?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn get_schedule(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<ScheduleView>> {
    state
        .schedules
        .get(&job_id)
        .map(Json)
        .ok_or_else(|| ScheduleError::NotScheduled(job_id).into())
}

async fn delete_schedule(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.schedules.unschedule(&job_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn pause_schedule(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<ScheduleView>> {
    Ok(Json(state.schedules.pause(&job_id)?))
}

async fn resume_schedule(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<ScheduleView>> {
    Ok(Json(state.schedules.resume(&job_id)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenStore;
    use crate::dispatch::{DispatchConfig, Dispatcher};
    use crate::engine::{EngineConfig, ExecutionEngine};
    use crate::history::{ExecutionHistory, InMemoryHistory};
    use crate::push::tests::FakeTransport;
    use crate::recurring::RecurringScheduler;
    use crate::registry::{AgentRegistry, InMemoryAgentRegistry};
    use crate::testing::{call_log, fake_registry};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let history: Arc<dyn ExecutionHistory> = Arc::new(InMemoryHistory::new());
        let registry: Arc<dyn AgentRegistry> = Arc::new(InMemoryAgentRegistry::new());
        let engine = ExecutionEngine::new(
            EngineConfig::default(),
            Arc::new(fake_registry(call_log())),
            history.clone(),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            engine.clone(),
            registry.clone(),
            history.clone(),
            Arc::new(FakeTransport::new(true)),
            DispatchConfig::default(),
        ));
        AppState {
            engine,
            schedules: Arc::new(RecurringScheduler::new(dispatcher.clone())),
            dispatcher,
            registry,
            history,
            tokens: Arc::new(TokenStore::new(3600)),
        }
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn post_json(uri: &str, body: Value, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(t) = token {
            builder = builder.header("authorization", format!("Bearer {t}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn registration(id: &str, pool: &str) -> Value {
        json!({
            "agent_id": id,
            "name": id,
            "hostname": "host",
            "ip_address": "10.0.0.2",
            "agent_pool": pool,
            "max_parallel_jobs": 2
        })
    }

    async fn register(app: &Router, id: &str, pool: &str) -> String {
        let (status, body) = send(app, post_json("/api/v1/agent/register", registration(id, pool), None)).await;
        assert!(status.is_success());
        body["token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn health_responde_ok() {
        let app = build_router(test_state());
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn registro_crea_y_luego_actualiza() {
        let app = build_router(test_state());

        let (status, body) = send(&app, post_json("/api/v1/agent/register", registration("a1", "default"), None)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "created");
        assert_eq!(body["token_expires_in"], 3600);
        assert_eq!(body["is_approved"], false);

        let (status, body) = send(&app, post_json("/api/v1/agent/register", registration("a1", "default"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "updated");
    }

    #[tokio::test]
    async fn registro_sin_campos_requeridos_es_400() {
        let app = build_router(test_state());
        let mut reg = registration("a1", "default");
        reg["hostname"] = json!("");

        let (status, body) = send(&app, post_json("/api/v1/agent/register", reg, None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["details"][0], "falta el campo 'hostname'");
    }

    #[tokio::test]
    async fn heartbeat_sin_token_es_401() {
        let app = build_router(test_state());
        let token = register(&app, "a1", "default").await;

        let hb = json!({ "status": "online", "current_jobs": 0 });
        let (status, _) = send(&app, post_json("/api/v1/agent/heartbeat", hb.clone(), None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(&app, post_json("/api/v1/agent/heartbeat", hb.clone(), Some("falso"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = send(&app, post_json("/api/v1/agent/heartbeat", hb, Some(&token))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn flujo_de_agente_por_http() {
        let state = test_state();
        let app = build_router(state.clone());
        let token = register(&app, "gpu-1", "gpu").await;

        let doc = "id: train\nname: Train\ntype: agent\nagent_pool: gpu\nsteps:\n  - id: main\n    type: record\n    tag: x\n";
        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/jobs")
            .body(Body::from(doc))
            .unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "queued");
        let execution_id = body["execution_id"].as_str().unwrap().to_string();

        let (status, _) = send(&app, post_json("/api/v1/agent/gpu-1/approve", Value::Null, None)).await;
        assert_eq!(status, StatusCode::OK);

        let poll = Request::builder()
            .uri("/api/v1/agent/jobs/poll?max_jobs=3")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, poll).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["jobs"][0]["execution_id"], execution_id.as_str());

        let (status, _) = send(
            &app,
            post_json(
                &format!("/api/v1/agent/jobs/{execution_id}/status"),
                json!({ "status": "running", "message": "arrancó" }),
                Some(&token),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(
            &app,
            post_json(
                &format!("/api/v1/agent/jobs/{execution_id}/complete"),
                json!({ "status": "success" }),
                Some(&token),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let get = Request::builder()
            .uri(format!("/api/v1/executions/{execution_id}"))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, get).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["assignment"]["status"], "completed");
        assert_eq!(body["agent_id"], "gpu-1");
    }

    #[tokio::test]
    async fn documento_invalido_es_400() {
        let app = build_router(test_state());
        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/jobs")
            .body(Body::from("name: sin id\ntype: local\n"))
            .unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("'id'"));
    }

    #[tokio::test]
    async fn job_local_con_motor_detenido_es_503() {
        let app = build_router(test_state());
        let doc = "id: j\nname: J\ntype: local\nsteps:\n  - id: a\n    type: record\n    tag: x\n";
        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/jobs")
            .body(Body::from(doc))
            .unwrap();
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn ejecucion_inmediata_devuelve_el_resultado() {
        let state = test_state();
        state.engine.start();
        let app = build_router(state.clone());

        let doc = "id: j\nname: J\ntype: local\nsteps:\n  - id: a\n    type: record\n    tag: x\n";
        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/jobs/run")
            .body(Body::from(doc))
            .unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");

        let req = Request::builder().uri("/api/v1/queues/UTC").body(Body::empty()).unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"]["processed"], 1);

        state.engine.stop().await;
    }

    #[tokio::test]
    async fn ejecucion_desconocida_es_404() {
        let app = build_router(test_state());
        let req = Request::builder()
            .uri("/api/v1/executions/exec_nada")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, post_json("/api/v1/agent/nadie/approve", Value::Null, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn programaciones_por_http() {
        let app = build_router(test_state());
        let doc = "id: rep\nname: Reporte\ntype: record\ntag: x\ntimezone: Asia/Tokyo\nschedule:\n  type: cron\n  cron: '0 0 7 * * *'\n";
        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/schedules?priority=3")
            .body(Body::from(doc))
            .unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["timezone"], "Asia/Tokyo");
        assert_eq!(body["priority"], 3);
        assert!(body["next_run_time"].is_string());

        let (status, body) = send(&app, post_json("/api/v1/schedules/rep/pause", Value::Null, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["paused"], true);

        let req = Request::builder()
            .uri("/api/v1/schedules?upcoming=5")
            .body(Body::empty())
            .unwrap();
        let (_, body) = send(&app, req).await;
        assert_eq!(body.as_array().unwrap().len(), 0);

        let (status, body) = send(&app, post_json("/api/v1/schedules/rep/resume", Value::Null, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["paused"], false);

        let delete = || {
            Request::builder()
                .method("DELETE")
                .uri("/api/v1/schedules/rep")
                .body(Body::empty())
                .unwrap()
        };
        let resp = app.clone().oneshot(delete()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let (status, _) = send(&app, delete()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let bad = "id: j\nname: J\ntype: record\nschedule: {type: cron, cron: 'nunca'}\n";
        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/schedules")
            .body(Body::from(bad))
            .unwrap();
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn hora_local_se_convierte_a_utc() {
        let q = SubmitQuery {
            priority: None,
            scheduled_at: None,
            run_at_local: Some("2024-07-01T09:00:00".into()),
        };
        let at = scheduled_time(&q, "America/New_York").unwrap().unwrap();
        assert_eq!(at.to_rfc3339(), "2024-07-01T13:00:00+00:00");

        let gap = SubmitQuery {
            run_at_local: Some("2024-03-10T02:30:00".into()),
            ..q
        };
        assert!(scheduled_time(&gap, "America/New_York").is_err());
    }
}
