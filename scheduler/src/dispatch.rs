//! Despacho de jobs: ruta local (motor) o remota (agentes, pull y push).

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use common::{
    generate_execution_id, AgentJobAssignment, AssignedJob, AssignmentStatus, ExecutionId,
    ExecutionRecord, ExecutionTarget, ExecutionView, JobCompleteRequest, JobDefinition,
    JobExecutionResult, JobStatus, JobStatusUpdate, JobSubmission, PollResponse,
    PushAssignRequest, SubmitResponse,
};
use common::agent::DEFAULT_ASSIGNMENT_TIMEOUT_MINUTES;

use crate::engine::ExecutionEngine;
use crate::error::{DispatchError, EngineError};
use crate::history::ExecutionHistory;
use crate::push::AgentTransport;
use crate::registry::AgentRegistry;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Intervalo sugerido al agente cuando no recibió trabajo
    pub idle_poll_interval_secs: u64,
    /// Intervalo sugerido cuando sí recibió trabajo
    pub busy_poll_interval_secs: u64,
    pub assignment_timeout_minutes: u32,
    /// Horas que se conservan ejecuciones y asignaciones terminadas
    pub retention_hours: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            idle_poll_interval_secs: 30,
            busy_poll_interval_secs: 60,
            assignment_timeout_minutes: DEFAULT_ASSIGNMENT_TIMEOUT_MINUTES,
            retention_hours: 24,
        }
    }
}

/// Job remoto que todavía no terminó.
#[derive(Debug, Clone)]
struct AgentJobSpec {
    definition: Arc<JobDefinition>,
    source: String,
    pool: String,
    capabilities: Vec<String>,
    priority: i32,
    not_before: DateTime<Utc>,
    submitted_at: DateTime<Utc>,
}

pub struct Dispatcher {
    engine: Arc<ExecutionEngine>,
    registry: Arc<dyn AgentRegistry>,
    history: Arc<dyn ExecutionHistory>,
    transport: Arc<dyn AgentTransport>,
    config: DispatchConfig,
    jobs: Mutex<HashMap<ExecutionId, AgentJobSpec>>,
    /// Ejecuciones con una asignación en curso; evita asignar dos veces
    claims: Mutex<HashSet<ExecutionId>>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Suelta la reclamación al salir del alcance.
struct Claim<'a> {
    claims: &'a Mutex<HashSet<ExecutionId>>,
    execution_id: ExecutionId,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        guard(self.claims).remove(&self.execution_id);
    }
}

impl Dispatcher {
    pub fn new(
        engine: Arc<ExecutionEngine>,
        registry: Arc<dyn AgentRegistry>,
        history: Arc<dyn ExecutionHistory>,
        transport: Arc<dyn AgentTransport>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            engine,
            registry,
            history,
            transport,
            config,
            jobs: Mutex::new(HashMap::new()),
            claims: Mutex::new(HashSet::new()),
        }
    }

    /// Valida el job contra los pasos del motor sin encolarlo.
    pub fn validate(&self, job: &JobDefinition) -> Result<(), EngineError> {
        self.engine.validate(job)
    }

    /// Acepta un job ya parseado. Los locales van al motor; los de agente
    /// se intentan asignar ya y, si no hay agente, quedan en `queued`.
    pub async fn submit(
        &self,
        submission: JobSubmission,
        priority: Option<i32>,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<SubmitResponse, DispatchError> {
        let JobSubmission {
            definition,
            target,
            source,
        } = submission;
        let priority = priority.unwrap_or(definition.priority);

        let (pool, capabilities) = match target {
            ExecutionTarget::Local => {
                let execution_id = self.engine.schedule(definition, scheduled_at, priority)?;
                return Ok(SubmitResponse {
                    execution_id,
                    status: JobStatus::Pending,
                    target: ExecutionTarget::Local,
                });
            }
            ExecutionTarget::Agent { pool, capabilities } => (pool, capabilities),
        };

        self.engine.validate(&definition)?;

        let now = Utc::now();
        let not_before = scheduled_at.unwrap_or(now);
        let execution_id = generate_execution_id(not_before);
        let target = ExecutionTarget::Agent {
            pool: pool.clone(),
            capabilities: capabilities.clone(),
        };

        let mut record =
            ExecutionRecord::new(&execution_id, &definition, target.clone(), JobStatus::Queued);
        record.priority = priority;
        record.submitted_at = now;
        if let Err(e) = self.history.record_submitted(record) {
            warn!("no se pudo registrar la ejecución {}: {}", execution_id, e);
        }

        info!(
            "job '{}' enviado al pool '{}' como {}",
            definition.job_id, pool, execution_id
        );
        guard(&self.jobs).insert(
            execution_id.clone(),
            AgentJobSpec {
                definition: Arc::new(definition),
                source,
                pool,
                capabilities,
                priority,
                not_before,
                submitted_at: now,
            },
        );

        let status = if self.try_assign(&execution_id).await? {
            JobStatus::Assigned
        } else {
            JobStatus::Queued
        };
        Ok(SubmitResponse {
            execution_id,
            status,
            target,
        })
    }

    /// Intenta asignar una ejecución en cola. Sin agente o con el push
    /// rechazado devuelve `Ok(false)` y la ejecución sigue en `queued`.
    pub async fn try_assign(&self, execution_id: &str) -> Result<bool, DispatchError> {
        match self.assign(execution_id).await {
            Ok(_) => Ok(true),
            Err(DispatchError::NoAgentAvailable(pool)) => {
                debug!("{} sigue en cola: no hay agentes en '{}'", execution_id, pool);
                Ok(false)
            }
            Err(e @ DispatchError::Transport { .. }) => {
                warn!("{} sigue en cola: {}", execution_id, e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn assign(&self, execution_id: &str) -> Result<AgentJobAssignment, DispatchError> {
        let Some(_claim) = self.claim(execution_id) else {
            return Err(DispatchError::NoAgentAvailable(
                "asignación en curso".into(),
            ));
        };
        let spec = guard(&self.jobs)
            .get(execution_id)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownExecution(execution_id.to_string()))?;

        if Utc::now() < spec.not_before {
            return Err(DispatchError::NoAgentAvailable(spec.pool.clone()));
        }
        if let Some(current) = self.registry.assignment_for_execution(execution_id)? {
            if !current.status.is_terminal() {
                return Ok(current);
            }
        }

        let agent = self
            .registry
            .reserve(&spec.pool, &spec.capabilities)?
            .ok_or_else(|| DispatchError::NoAgentAvailable(spec.pool.clone()))?;

        let retries = match self.history.get(execution_id) {
            Ok(Some(record)) => record.retry_count,
            _ => 0,
        };
        let mut assignment =
            AgentJobAssignment::new(execution_id, &spec.definition.job_id, &agent.agent_id);
        assignment.timeout_minutes = self.config.assignment_timeout_minutes;
        assignment.retry_count = retries;
        assignment.max_retries = spec.definition.max_retries;
        self.registry.create_assignment(assignment.clone())?;

        if let Some(endpoint) = agent.endpoint.as_deref() {
            let req = PushAssignRequest {
                execution_id: execution_id.to_string(),
                job_id: spec.definition.job_id.clone(),
                job_name: spec.definition.job_name.clone(),
                job_yaml: spec.source.clone(),
                job: (*spec.definition).clone(),
            };
            match self.transport.push(endpoint, &req).await {
                Ok(()) => {
                    let (accepted, _) = self.registry.advance_assignment(
                        execution_id,
                        AssignmentStatus::Accepted,
                        None,
                        Utc::now(),
                    )?;
                    assignment = accepted;
                }
                Err(e) => {
                    self.registry.advance_assignment(
                        execution_id,
                        AssignmentStatus::Failed,
                        Some(format!("push rechazado: {}", e)),
                        Utc::now(),
                    )?;
                    self.registry.release(&agent.agent_id)?;
                    return Err(e);
                }
            }
        }

        if let Err(e) = self
            .history
            .update_status(execution_id, JobStatus::Assigned, None)
        {
            warn!("no se pudo marcar {} como asignada: {}", execution_id, e);
        }
        if let Err(e) = self.history.set_agent(execution_id, Some(&agent.agent_id)) {
            warn!("no se pudo anotar el agente de {}: {}", execution_id, e);
        }

        info!(
            "ejecución {} asignada al agente {} ({})",
            execution_id,
            agent.agent_id,
            if agent.endpoint.is_some() { "push" } else { "pull" }
        );
        Ok(assignment)
    }

    fn claim(&self, execution_id: &str) -> Option<Claim<'_>> {
        let mut claims = guard(&self.claims);
        if !claims.insert(execution_id.to_string()) {
            return None;
        }
        Some(Claim {
            claims: &self.claims,
            execution_id: execution_id.to_string(),
        })
    }

    /// Ejecuciones remotas sin asignación viva, por prioridad y antigüedad.
    fn queued_executions(&self) -> Result<Vec<ExecutionId>, DispatchError> {
        let specs: Vec<(ExecutionId, i32, DateTime<Utc>)> = guard(&self.jobs)
            .iter()
            .map(|(id, s)| (id.clone(), s.priority, s.submitted_at))
            .collect();

        let mut queued = Vec::new();
        for (id, priority, submitted_at) in specs {
            let live = self
                .registry
                .assignment_for_execution(&id)?
                .map_or(false, |a| !a.status.is_terminal());
            if !live {
                queued.push((id, priority, submitted_at));
            }
        }
        queued.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
        Ok(queued.into_iter().map(|(id, _, _)| id).collect())
    }

    /// Reintenta asignar todo lo que está en cola. Sin cambios en los
    /// agentes no asigna nada. Devuelve cuántas asignó.
    pub async fn sweep(&self) -> usize {
        let queued = match self.queued_executions() {
            Ok(q) => q,
            Err(e) => {
                warn!("no se pudieron listar las ejecuciones en cola: {}", e);
                return 0;
            }
        };

        let mut assigned = 0;
        for execution_id in queued {
            match self.try_assign(&execution_id).await {
                Ok(true) => assigned += 1,
                Ok(false) => {}
                Err(e) => warn!("error asignando {}: {}", execution_id, e),
            }
        }
        if assigned > 0 {
            info!("sweep de despacho: {} ejecuciones asignadas", assigned);
        }
        assigned
    }

    /// Trabajo para un agente en modo pull. Cada asignación entregada pasa
    /// a `accepted`.
    pub async fn poll(&self, agent_id: &str, max_jobs: usize) -> Result<PollResponse, DispatchError> {
        if self.registry.get(agent_id)?.is_none() {
            return Err(DispatchError::UnknownAgent(agent_id.to_string()));
        }
        self.sweep().await;

        let mut jobs = Vec::new();
        for assignment in self.registry.pending_assignments(agent_id, max_jobs)? {
            let spec = guard(&self.jobs).get(&assignment.execution_id).cloned();
            let Some(spec) = spec else {
                warn!(
                    "asignación {} sin job conocido, se ignora",
                    assignment.assignment_id
                );
                continue;
            };
            self.registry.advance_assignment(
                &assignment.execution_id,
                AssignmentStatus::Accepted,
                None,
                Utc::now(),
            )?;
            jobs.push(AssignedJob {
                execution_id: assignment.execution_id.clone(),
                assignment_id: assignment.assignment_id.clone(),
                job_id: spec.definition.job_id.clone(),
                job_name: spec.definition.job_name.clone(),
                job_yaml: spec.source.clone(),
                job: (*spec.definition).clone(),
                timeout_minutes: assignment.timeout_minutes,
            });
        }

        if !jobs.is_empty() {
            info!("agente {} recibe {} jobs", agent_id, jobs.len());
        }
        let poll_interval_seconds = if jobs.is_empty() {
            self.config.idle_poll_interval_secs
        } else {
            self.config.busy_poll_interval_secs
        };
        Ok(PollResponse {
            jobs,
            poll_interval_seconds,
        })
    }

    fn owned_assignment(
        &self,
        agent_id: &str,
        execution_id: &str,
    ) -> Result<AgentJobAssignment, DispatchError> {
        match self.registry.assignment_for_execution(execution_id)? {
            Some(a) if a.agent_id == agent_id => Ok(a),
            _ => Err(DispatchError::AssignmentNotFound(execution_id.to_string())),
        }
    }

    fn log_line(&self, execution_id: &str, agent_id: &str, message: &str) {
        let line = format!("[{}] [{}] {}", Utc::now().to_rfc3339(), agent_id, message);
        if let Err(e) = self.history.append_log(execution_id, &line) {
            debug!("no se pudo anotar el log de {}: {}", execution_id, e);
        }
    }

    /// Progreso reportado por el agente (`accepted` o `running`).
    pub fn report_status(
        &self,
        agent_id: &str,
        execution_id: &str,
        update: JobStatusUpdate,
    ) -> Result<AgentJobAssignment, DispatchError> {
        let current = self.owned_assignment(agent_id, execution_id)?;
        if update.status.is_terminal() {
            return Err(DispatchError::InvalidTransition(common::InvalidTransition {
                from: current.status,
                to: update.status,
            }));
        }

        let (assignment, changed) =
            self.registry
                .advance_assignment(execution_id, update.status, None, Utc::now())?;
        if changed && update.status == AssignmentStatus::Running {
            if let Err(e) = self
                .history
                .update_status(execution_id, JobStatus::Running, None)
            {
                warn!("no se pudo marcar {} como running: {}", execution_id, e);
            }
        }

        if let Some(message) = update.message.as_deref() {
            self.log_line(execution_id, agent_id, message);
        }
        if let Some(step) = &update.step {
            let mut line = format!("paso '{}': {:?}", step.step_id, step.status);
            if let Some(err) = &step.error_message {
                line.push_str(&format!(" ({})", err));
            }
            self.log_line(execution_id, agent_id, &line);
        }
        Ok(assignment)
    }

    /// Fin de la ejecución en el agente: cierra la asignación, libera el
    /// hueco y refleja el estado final en el historial. Repetirlo no hace nada.
    pub fn complete(
        &self,
        agent_id: &str,
        execution_id: &str,
        req: JobCompleteRequest,
    ) -> Result<AgentJobAssignment, DispatchError> {
        self.owned_assignment(agent_id, execution_id)?;
        let next = match AssignmentStatus::from_job_status(req.status) {
            Some(s) if s.is_terminal() => s,
            _ => return Err(DispatchError::InvalidCompletion(req.status)),
        };
        let summary = req
            .error_message
            .clone()
            .unwrap_or_else(|| req.status.as_str().to_string());

        let (assignment, changed) =
            self.registry
                .advance_assignment(execution_id, next, Some(summary), Utc::now())?;
        if !changed {
            return Ok(assignment);
        }
        self.registry.release(agent_id)?;

        let spec = guard(&self.jobs).remove(execution_id);
        self.mirror_result(execution_id, spec.as_ref(), req);
        self.log_line(execution_id, agent_id, "ejecución terminada");
        info!(
            "ejecución {} terminada en el agente {} ({:?})",
            execution_id, agent_id, assignment.status
        );
        Ok(assignment)
    }

    fn mirror_result(
        &self,
        execution_id: &str,
        spec: Option<&AgentJobSpec>,
        req: JobCompleteRequest,
    ) {
        let meta = match self.history.get(execution_id) {
            Ok(Some(record)) => record,
            Ok(None) | Err(_) => match spec {
                Some(spec) => ExecutionRecord::new(
                    execution_id,
                    &spec.definition,
                    ExecutionTarget::Agent {
                        pool: spec.pool.clone(),
                        capabilities: spec.capabilities.clone(),
                    },
                    JobStatus::Running,
                ),
                None => {
                    warn!("no hay registro de {} para reflejar el resultado", execution_id);
                    return;
                }
            },
        };

        let mut result = match req.result {
            Some(result) => result,
            None => {
                let mut result = JobExecutionResult {
                    execution_id: execution_id.to_string(),
                    job_id: meta.job_id.clone(),
                    job_name: meta.job_name.clone(),
                    status: JobStatus::Running,
                    timezone: meta.timezone.clone(),
                    start_time: meta.started_at.unwrap_or(meta.submitted_at),
                    end_time: None,
                    duration_seconds: None,
                    step_results: Vec::new(),
                    error_message: None,
                    retry_count: meta.retry_count,
                    metadata: Default::default(),
                };
                result.complete(req.status, None);
                result
            }
        };
        result.status = req.status;
        if req.error_message.is_some() {
            result.error_message = req.error_message;
        }

        if let Err(e) = self.history.record_complete(&meta, &result) {
            warn!("no se pudo persistir el resultado de {}: {}", execution_id, e);
        }
    }

    /// Cierra por `timeout` las asignaciones vivas cuyo agente se cayó o
    /// cuyo plazo venció. Con reintentos disponibles la ejecución vuelve a
    /// `queued`; si no, queda en `timeout`.
    pub fn expire_assignments(&self, now: DateTime<Utc>) -> Result<usize, DispatchError> {
        let mut expired = 0;
        for assignment in self.registry.active_assignments()? {
            let agent_online = self
                .registry
                .get(&assignment.agent_id)?
                .map_or(false, |a| a.is_active && a.is_online_at(now));
            let reason = if !agent_online {
                "el agente dejó de responder"
            } else if assignment.is_expired_at(now) {
                "venció el plazo de la asignación"
            } else {
                continue;
            };

            let execution_id = assignment.execution_id.as_str();
            let (_, changed) = self.registry.advance_assignment(
                execution_id,
                AssignmentStatus::Timeout,
                Some(reason.to_string()),
                now,
            )?;
            if !changed {
                continue;
            }
            expired += 1;
            if let Err(e) = self.registry.release(&assignment.agent_id) {
                debug!("no se pudo liberar {}: {}", assignment.agent_id, e);
            }

            let retries = match self.history.get(execution_id) {
                Ok(Some(record)) => record.retry_count,
                _ => assignment.retry_count,
            };
            if retries < assignment.max_retries {
                warn!(
                    "reencolando {} ({}), intento {}/{}",
                    execution_id,
                    reason,
                    retries + 1,
                    assignment.max_retries
                );
                if let Err(e) = self.history.requeue(execution_id) {
                    warn!("no se pudo reencolar {} en el historial: {}", execution_id, e);
                }
            } else {
                warn!(
                    "ejecución {} en timeout ({}), sin reintentos",
                    execution_id, reason
                );
                guard(&self.jobs).remove(execution_id);
                if let Err(e) = self.history.update_status(
                    execution_id,
                    JobStatus::Timeout,
                    Some(reason.to_string()),
                ) {
                    warn!("no se pudo marcar {} en timeout: {}", execution_id, e);
                }
            }
            self.log_line(execution_id, &assignment.agent_id, reason);
        }
        Ok(expired)
    }

    /// Olvida lo terminado hace más de `retention_hours`: asignaciones del
    /// registro y registros del historial. Devuelve cuántos borró en total.
    pub fn prune_finished(&self, now: DateTime<Utc>) -> Result<usize, DispatchError> {
        let hours = i64::try_from(self.config.retention_hours).unwrap_or(i64::MAX);
        let Some(before) = chrono::Duration::try_hours(hours).and_then(|d| now.checked_sub_signed(d))
        else {
            return Ok(0);
        };

        let mut removed = self.registry.prune_assignments(before)?;
        match self.history.prune_finished(before) {
            Ok(n) => removed += n,
            Err(e) => warn!("no se pudo limpiar el historial: {}", e),
        }
        Ok(removed)
    }

    /// Cancela una ejecución que todavía no corre. Las remotas ya
    /// asignadas y las locales activas no se interrumpen.
    pub fn cancel(&self, execution_id: &str, timezone: Option<&str>) -> Result<bool, DispatchError> {
        if !guard(&self.jobs).contains_key(execution_id) {
            return Ok(self.engine.cancel(execution_id, timezone));
        }

        let Some(_claim) = self.claim(execution_id) else {
            return Ok(false);
        };
        let live = self
            .registry
            .assignment_for_execution(execution_id)?
            .map_or(false, |a| !a.status.is_terminal());
        if live {
            warn!("{} ya está asignada a un agente, no se cancela", execution_id);
            return Ok(false);
        }

        guard(&self.jobs).remove(execution_id);
        if let Err(e) = self.history.update_status(
            execution_id,
            JobStatus::Cancelled,
            Some("cancelado antes de asignarse".into()),
        ) {
            warn!("no se pudo marcar {} como cancelada: {}", execution_id, e);
        }
        info!("ejecución remota {} cancelada", execution_id);
        Ok(true)
    }

    pub fn execution(&self, execution_id: &str) -> Result<Option<ExecutionView>, DispatchError> {
        let Some(record) = self.history.get(execution_id)? else {
            return Ok(None);
        };
        let assignment = self.registry.assignment_for_execution(execution_id)?;
        Ok(Some(ExecutionView { record, assignment }))
    }
}
