use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::job::{ExecutionId, JobDefinition, StepConfiguration};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Cancelled,
    Timeout,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }

    /// Estados que abortan el job si el paso no tiene continue_on_failure.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            StepStatus::Failed | StepStatus::Timeout | StepStatus::Cancelled
        )
    }
}

/// Estado global de una ejecución.
///
/// `Queued` y `Assigned` sólo aparecen en ejecuciones enviadas a agentes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Assigned,
    Running,
    Success,
    Failed,
    Cancelled,
    PartialSuccess,
    Timeout,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        self.rank() == 4
    }

    /// Orden de avance. Un estado nunca pasa a otro de menor rango.
    pub fn rank(self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Queued => 1,
            JobStatus::Assigned => 2,
            JobStatus::Running => 3,
            JobStatus::Success
            | JobStatus::Failed
            | JobStatus::Cancelled
            | JobStatus::PartialSuccess
            | JobStatus::Timeout => 4,
        }
    }

    pub fn can_advance_to(self, next: JobStatus) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Assigned => "assigned",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::PartialSuccess => "partial_success",
            JobStatus::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub step_id: String,
    pub step_name: String,
    pub step_type: String,
    pub status: StepStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub output: String,
    pub error_message: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl StepResult {
    pub fn started(config: &StepConfiguration) -> Self {
        Self {
            step_id: config.step_id.clone(),
            step_name: config.step_name.clone(),
            step_type: config.step_type.clone(),
            status: StepStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            duration_seconds: None,
            output: String::new(),
            error_message: None,
            retry_count: 0,
            metadata: Map::new(),
        }
    }

    /// Pasa el resultado a un estado terminal. Sólo la primera llamada cuenta.
    pub fn complete(&mut self, status: StepStatus, output: Option<String>, error: Option<String>) {
        if self.status.is_terminal() {
            return;
        }
        let end = Utc::now();
        self.status = status;
        self.end_time = Some(end);
        self.duration_seconds = Some(seconds_between(self.start_time, end));
        if let Some(out) = output {
            self.output = out;
        }
        self.error_message = error;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobExecutionResult {
    pub execution_id: ExecutionId,
    pub job_id: String,
    pub job_name: String,
    pub status: JobStatus,
    pub timezone: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub step_results: Vec<StepResult>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl JobExecutionResult {
    pub fn new(execution_id: &str, job: &JobDefinition, status: JobStatus) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            job_id: job.job_id.clone(),
            job_name: job.job_name.clone(),
            status,
            timezone: job.timezone.clone(),
            start_time: Utc::now(),
            end_time: None,
            duration_seconds: None,
            step_results: Vec::new(),
            error_message: None,
            retry_count: 0,
            metadata: Map::new(),
        }
    }

    pub fn complete(&mut self, status: JobStatus, error: Option<String>) {
        if self.status.is_terminal() {
            return;
        }
        let end = Utc::now();
        self.status = status;
        self.end_time = Some(end);
        self.duration_seconds = Some(seconds_between(self.start_time, end));
        if error.is_some() {
            self.error_message = error;
        }
    }

    pub fn successful_steps(&self) -> usize {
        self.step_results
            .iter()
            .filter(|s| s.status == StepStatus::Success)
            .count()
    }

    pub fn failed_steps(&self) -> usize {
        self.step_results
            .iter()
            .filter(|s| s.status.is_failure())
            .count()
    }
}

/// Estado agregado de un job a partir de los pasos ejecutados.
///
/// - todos OK → `success`
/// - alguno OK y sin abortar → `partial_success`
/// - en otro caso → `failed`
pub fn aggregate_status(steps: &[StepResult], aborted: bool) -> JobStatus {
    let ok = steps
        .iter()
        .filter(|s| s.status == StepStatus::Success)
        .count();

    if !steps.is_empty() && ok == steps.len() && !aborted {
        JobStatus::Success
    } else if ok > 0 && !aborted {
        JobStatus::PartialSuccess
    } else {
        JobStatus::Failed
    }
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds().max(0) as f64 / 1000.0
}
