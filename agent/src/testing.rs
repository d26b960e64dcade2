//! Scheduler falso en proceso para probar el cliente y el worker.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

use common::{
    AckResponse, AgentHeartbeatResponse, AgentRegisterRequest, AgentRegisterResponse, AssignedJob,
    JobCompleteRequest, JobStatusUpdate, PollResponse, RegistrationOutcome, SystemInfo,
};

pub struct FakeScheduler {
    /// Token que aceptan las rutas autenticadas
    accept_token: String,
    pub registers: AtomicUsize,
    calls: Mutex<Vec<String>>,
    pub updates: Mutex<Vec<(String, JobStatusUpdate)>>,
    pub completes: Mutex<Vec<(String, JobCompleteRequest)>>,
    pub pending: Mutex<Vec<AssignedJob>>,
}

impl FakeScheduler {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn authorize(&self, headers: &HeaderMap, call: &str) -> Result<(), StatusCode> {
        let expected = format!("Bearer {}", self.accept_token);
        let ok = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == expected);
        if !ok {
            return Err(StatusCode::UNAUTHORIZED);
        }
        self.calls.lock().unwrap().push(call.to_string());
        Ok(())
    }
}

pub fn registration(agent_id: &str) -> AgentRegisterRequest {
    AgentRegisterRequest {
        agent_id: agent_id.into(),
        agent_name: agent_id.into(),
        hostname: "test".into(),
        ip_address: "127.0.0.1".into(),
        endpoint: None,
        agent_pool: "default".into(),
        capabilities: vec![],
        max_parallel_jobs: 2,
        agent_version: None,
        system_info: SystemInfo::default(),
    }
}

type Fake = Arc<FakeScheduler>;

async fn register(
    State(fake): State<Fake>,
    Json(req): Json<AgentRegisterRequest>,
) -> Json<AgentRegisterResponse> {
    let n = fake.registers.fetch_add(1, Ordering::SeqCst) + 1;
    Json(AgentRegisterResponse {
        status: if n == 1 {
            RegistrationOutcome::Created
        } else {
            RegistrationOutcome::Updated
        },
        agent_id: req.agent_id,
        token: format!("t{}", n),
        token_expires_in: 60,
        is_approved: true,
    })
}

async fn heartbeat(
    State(fake): State<Fake>,
    headers: HeaderMap,
) -> Result<Json<AgentHeartbeatResponse>, StatusCode> {
    fake.authorize(&headers, "heartbeat")?;
    Ok(Json(AgentHeartbeatResponse {
        ok: true,
        is_approved: true,
        server_time: Utc::now(),
    }))
}

async fn poll(
    State(fake): State<Fake>,
    headers: HeaderMap,
) -> Result<Json<PollResponse>, StatusCode> {
    fake.authorize(&headers, "poll")?;
    let jobs = std::mem::take(&mut *fake.pending.lock().unwrap());
    Ok(Json(PollResponse {
        jobs,
        poll_interval_seconds: 30,
    }))
}

async fn status(
    State(fake): State<Fake>,
    Path(execution_id): Path<String>,
    headers: HeaderMap,
    Json(update): Json<JobStatusUpdate>,
) -> Result<Json<AckResponse>, StatusCode> {
    fake.authorize(&headers, "status")?;
    fake.updates.lock().unwrap().push((execution_id, update));
    Ok(Json(AckResponse { ok: true }))
}

async fn complete(
    State(fake): State<Fake>,
    Path(execution_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<JobCompleteRequest>,
) -> Result<Json<AckResponse>, StatusCode> {
    fake.authorize(&headers, "complete")?;
    fake.completes.lock().unwrap().push((execution_id, req));
    Ok(Json(AckResponse { ok: true }))
}

/// Levanta el scheduler falso en un puerto efímero. Devuelve su URL base.
pub async fn spawn_fake_scheduler(accept_token: &str) -> (String, Fake) {
    let fake = Arc::new(FakeScheduler {
        accept_token: accept_token.to_string(),
        registers: AtomicUsize::new(0),
        calls: Mutex::new(Vec::new()),
        updates: Mutex::new(Vec::new()),
        completes: Mutex::new(Vec::new()),
        pending: Mutex::new(Vec::new()),
    });

    let app = Router::new()
        .route("/api/v1/agent/register", post(register))
        .route("/api/v1/agent/heartbeat", post(heartbeat))
        .route("/api/v1/agent/jobs/poll", get(poll))
        .route("/api/v1/agent/jobs/:execution_id/status", post(status))
        .route("/api/v1/agent/jobs/:execution_id/complete", post(complete))
        .with_state(fake.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), fake)
}
