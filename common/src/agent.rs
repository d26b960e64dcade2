//! Modelo de agentes remotos y protocolo scheduler ↔ agente.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::DEFAULT_AGENT_POOL;
use crate::job::{ExecutionId, JobDefinition, JobId};
use crate::results::{JobExecutionResult, JobStatus, StepResult};

pub type AgentId = String;

/// Ventana de heartbeat para considerar un agente online.
pub const AGENT_ONLINE_WINDOW_SECS: i64 = 300;
pub const DEFAULT_ASSIGNMENT_TIMEOUT_MINUTES: u32 = 60;
pub const DEFAULT_MAX_PARALLEL_JOBS: u32 = 2;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemInfo {
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub cpu_cores: Option<u32>,
    #[serde(default)]
    pub memory_gb: Option<f64>,
    #[serde(default)]
    pub disk_gb: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceUsage {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub disk_percent: f32,
}

/// Entrada del registro de agentes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRecord {
    pub agent_id: AgentId,
    pub agent_name: String,
    pub hostname: String,
    pub ip_address: String,
    /// URL base del listener push del agente, si tiene uno
    pub endpoint: Option<String>,
    pub agent_pool: String,
    pub capabilities: Vec<String>,
    pub max_parallel_jobs: u32,
    pub current_jobs: u32,
    /// Estado reportado por el propio agente ("online", "busy", ...)
    pub status: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub is_approved: bool,
    pub is_active: bool,
    pub agent_version: Option<String>,
    pub system_info: SystemInfo,
    pub resources: Option<ResourceUsage>,
    pub registered_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn is_online_at(&self, now: DateTime<Utc>) -> bool {
        match self.last_heartbeat {
            Some(hb) => {
                self.status == "online"
                    && now - hb < Duration::seconds(AGENT_ONLINE_WINDOW_SECS)
            }
            None => false,
        }
    }

    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }

    pub fn can_accept_job_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self.is_approved
            && self.is_online_at(now)
            && self.current_jobs < self.max_parallel_jobs
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentType {
    Local,
    Agent,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Assigned,
    Accepted,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl AssignmentStatus {
    fn rank(self) -> u8 {
        match self {
            AssignmentStatus::Assigned => 0,
            AssignmentStatus::Accepted => 1,
            AssignmentStatus::Running => 2,
            AssignmentStatus::Completed | AssignmentStatus::Failed | AssignmentStatus::Timeout => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 3
    }

    /// Estado de la ejecución que refleja este estado de asignación.
    pub fn as_job_status(self) -> JobStatus {
        match self {
            AssignmentStatus::Assigned | AssignmentStatus::Accepted => JobStatus::Assigned,
            AssignmentStatus::Running => JobStatus::Running,
            AssignmentStatus::Completed => JobStatus::Success,
            AssignmentStatus::Failed => JobStatus::Failed,
            AssignmentStatus::Timeout => JobStatus::Timeout,
        }
    }

    pub fn from_job_status(status: JobStatus) -> Option<Self> {
        match status {
            JobStatus::Success | JobStatus::PartialSuccess => Some(AssignmentStatus::Completed),
            JobStatus::Failed | JobStatus::Cancelled => Some(AssignmentStatus::Failed),
            JobStatus::Timeout => Some(AssignmentStatus::Timeout),
            JobStatus::Running => Some(AssignmentStatus::Running),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("transición inválida de {from:?} a {to:?}")]
pub struct InvalidTransition {
    pub from: AssignmentStatus,
    pub to: AssignmentStatus,
}

/// Vínculo entre una ejecución y el agente que la corre.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentJobAssignment {
    pub assignment_id: String,
    pub execution_id: ExecutionId,
    pub job_id: JobId,
    pub agent_id: AgentId,
    pub assignment_type: AssignmentType,
    pub status: AssignmentStatus,
    pub assigned_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout_minutes: u32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub result_summary: Option<String>,
}

impl AgentJobAssignment {
    pub fn new(execution_id: &str, job_id: &str, agent_id: &str) -> Self {
        Self {
            assignment_id: uuid::Uuid::new_v4().to_string(),
            execution_id: execution_id.to_string(),
            job_id: job_id.to_string(),
            agent_id: agent_id.to_string(),
            assignment_type: AssignmentType::Agent,
            status: AssignmentStatus::Assigned,
            assigned_at: Utc::now(),
            accepted_at: None,
            started_at: None,
            completed_at: None,
            timeout_minutes: DEFAULT_ASSIGNMENT_TIMEOUT_MINUTES,
            retry_count: 0,
            max_retries: 0,
            result_summary: None,
        }
    }

    /// Avanza el estado. Repetir el estado actual no hace nada; retroceder
    /// o salir de un estado terminal es error. Cada timestamp se escribe una vez.
    pub fn advance(
        &mut self,
        next: AssignmentStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, InvalidTransition> {
        if next == self.status {
            return Ok(false);
        }
        if self.status.is_terminal() || next.rank() < self.status.rank() {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        let stamp = match next {
            AssignmentStatus::Assigned => None,
            AssignmentStatus::Accepted => Some(&mut self.accepted_at),
            AssignmentStatus::Running => Some(&mut self.started_at),
            _ => Some(&mut self.completed_at),
        };
        if let Some(slot) = stamp {
            if slot.is_none() {
                *slot = Some(now);
            }
        }
        self.status = next;
        Ok(true)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal()
            && now - self.assigned_at > Duration::minutes(i64::from(self.timeout_minutes))
    }
}

/* --------- Mensajes del protocolo --------- */

fn default_pool() -> String {
    DEFAULT_AGENT_POOL.to_string()
}

fn default_parallel() -> u32 {
    DEFAULT_MAX_PARALLEL_JOBS
}

fn default_status() -> String {
    "online".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegisterRequest {
    pub agent_id: AgentId,
    #[serde(alias = "name")]
    pub agent_name: String,
    pub hostname: String,
    pub ip_address: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_pool")]
    pub agent_pool: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_parallel")]
    pub max_parallel_jobs: u32,
    #[serde(default)]
    pub agent_version: Option<String>,
    #[serde(default)]
    pub system_info: SystemInfo,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationOutcome {
    Created,
    Updated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegisterResponse {
    pub status: RegistrationOutcome,
    pub agent_id: AgentId,
    pub token: String,
    pub token_expires_in: u64,
    pub is_approved: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHeartbeatRequest {
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub current_jobs: u32,
    #[serde(default)]
    pub resources: ResourceUsage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHeartbeatResponse {
    pub ok: bool,
    pub is_approved: bool,
    pub server_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignedJob {
    pub execution_id: ExecutionId,
    pub assignment_id: String,
    pub job_id: JobId,
    pub job_name: String,
    /// Documento original del job
    pub job_yaml: String,
    pub job: JobDefinition,
    pub timeout_minutes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollResponse {
    pub jobs: Vec<AssignedJob>,
    pub poll_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusUpdate {
    pub status: AssignmentStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub step: Option<StepResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCompleteRequest {
    pub status: JobStatus,
    #[serde(default)]
    pub result: Option<JobExecutionResult>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    pub ok: bool,
}

/// Cuerpo de `POST {endpoint}/api/job/assign` en modo push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushAssignRequest {
    pub execution_id: ExecutionId,
    pub job_id: JobId,
    pub job_name: String,
    pub job_yaml: String,
    pub job: JobDefinition,
}

/// Vista del registro para el listado de agentes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    #[serde(flatten)]
    pub agent: AgentRecord,
    pub is_online: bool,
}
