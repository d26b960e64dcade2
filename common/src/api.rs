//! Cuerpos JSON de la API de jobs del scheduler (los usa también el cliente).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::AgentJobAssignment;
use crate::document::ExecutionTarget;
use crate::job::{ExecutionId, JobDefinition};
use crate::results::{JobExecutionResult, JobStatus};

/// Registro histórico de una ejecución.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecord {
    pub execution_id: ExecutionId,
    pub job_id: String,
    pub job_name: String,
    pub timezone: String,
    pub status: JobStatus,
    pub target: ExecutionTarget,
    pub priority: i32,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<JobExecutionResult>,
    pub error_message: Option<String>,
    /// Mensajes con timestamp (progreso reportado por agentes, etc.)
    #[serde(default)]
    pub output_log: Vec<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,
    pub agent_id: Option<String>,
}

impl ExecutionRecord {
    pub fn new(
        execution_id: &str,
        job: &JobDefinition,
        target: ExecutionTarget,
        status: JobStatus,
    ) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            job_id: job.job_id.clone(),
            job_name: job.job_name.clone(),
            timezone: job.timezone.clone(),
            status,
            target,
            priority: job.priority,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error_message: None,
            output_log: Vec::new(),
            retry_count: 0,
            max_retries: job.max_retries,
            agent_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub execution_id: ExecutionId,
    pub status: JobStatus,
    pub target: ExecutionTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionView {
    #[serde(flatten)]
    pub record: ExecutionRecord,
    pub assignment: Option<AgentJobAssignment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub execution_id: ExecutionId,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default)]
    pub details: Vec<String>,
}
