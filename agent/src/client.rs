use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

use common::{
    AgentHeartbeatRequest, AgentHeartbeatResponse, AgentRegisterRequest, AgentRegisterResponse,
    JobCompleteRequest, JobStatusUpdate, PollResponse,
};

/// Cliente HTTP del protocolo agente → scheduler.
///
/// Guarda el token del último registro. Si el scheduler responde 401
/// (token vencido o desconocido) se re-registra y reintenta una vez.
pub struct SchedulerClient {
    http: Client,
    base_url: String,
    registration: AgentRegisterRequest,
    token: Mutex<Option<String>>,
}

impl SchedulerClient {
    pub fn new(base_url: &str, registration: AgentRegisterRequest) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("no se pudo crear el cliente HTTP")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            registration,
            token: Mutex::new(None),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.registration.agent_id
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/agent{}", self.base_url, path)
    }

    fn current_token(&self) -> Option<String> {
        self.token
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn store_token(&self, token: Option<String>) {
        *self.token.lock().unwrap_or_else(|p| p.into_inner()) = token;
    }

    pub async fn register(&self) -> Result<AgentRegisterResponse> {
        let resp = self
            .http
            .post(self.url("/register"))
            .json(&self.registration)
            .send()
            .await
            .context("scheduler inalcanzable al registrar")?
            .error_for_status()
            .context("registro rechazado")?;
        let body: AgentRegisterResponse = resp.json().await?;

        info!(
            "agente {} registrado ({:?}, aprobado={})",
            body.agent_id, body.status, body.is_approved
        );
        self.store_token(Some(body.token.clone()));
        Ok(body)
    }

    async fn send_once<F>(&self, build: &F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let token = match self.current_token() {
            Some(t) => t,
            None => self.register().await?.token,
        };
        Ok(build(&self.http).bearer_auth(token).send().await?)
    }

    async fn send_authed<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let resp = self.send_once(&build).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp.error_for_status()?);
        }

        warn!("token rechazado por el scheduler, re-registrando");
        self.store_token(None);
        let resp = self.send_once(&build).await?;
        Ok(resp.error_for_status()?)
    }

    pub async fn heartbeat(&self, req: &AgentHeartbeatRequest) -> Result<AgentHeartbeatResponse> {
        let url = self.url("/heartbeat");
        let resp = self.send_authed(|http| http.post(&url).json(req)).await?;
        Ok(resp.json().await?)
    }

    pub async fn poll(&self, max_jobs: usize) -> Result<PollResponse> {
        let url = format!(
            "{}?agent_id={}&max_jobs={}",
            self.url("/jobs/poll"),
            self.agent_id(),
            max_jobs
        );
        let resp = self.send_authed(|http| http.get(&url)).await?;
        Ok(resp.json().await?)
    }

    pub async fn report_status(&self, execution_id: &str, update: &JobStatusUpdate) -> Result<()> {
        let url = self.url(&format!("/jobs/{}/status", execution_id));
        self.send_authed(|http| http.post(&url).json(update)).await?;
        Ok(())
    }

    pub async fn complete(&self, execution_id: &str, req: &JobCompleteRequest) -> Result<()> {
        let url = self.url(&format!("/jobs/{}/complete", execution_id));
        self.send_authed(|http| http.post(&url).json(req)).await?;
        Ok(())
    }
}
