//! Registro de agentes y tabla de asignaciones.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use common::{
    AgentHeartbeatRequest, AgentJobAssignment, AgentRecord, AgentRegisterRequest,
    AssignmentStatus, RegistrationOutcome,
};

use crate::error::DispatchError;

/// Contrato del registro. La reserva de un agente (elegir el menos cargado
/// y sumarle un job) es atómica.
pub trait AgentRegistry: Send + Sync {
    fn register(
        &self,
        req: AgentRegisterRequest,
    ) -> Result<(RegistrationOutcome, AgentRecord), DispatchError>;

    fn heartbeat(
        &self,
        agent_id: &str,
        req: &AgentHeartbeatRequest,
    ) -> Result<AgentRecord, DispatchError>;

    fn get(&self, agent_id: &str) -> Result<Option<AgentRecord>, DispatchError>;

    fn list(&self, pool: Option<&str>) -> Result<Vec<AgentRecord>, DispatchError>;

    /// Agente elegible menos cargado, sin reservarlo.
    fn find_available(
        &self,
        pool: &str,
        capabilities: &[String],
    ) -> Result<Option<AgentRecord>, DispatchError>;

    /// Elige el agente elegible menos cargado y le suma un job.
    fn reserve(
        &self,
        pool: &str,
        capabilities: &[String],
    ) -> Result<Option<AgentRecord>, DispatchError>;

    /// Devuelve un hueco al agente.
    fn release(&self, agent_id: &str) -> Result<(), DispatchError>;

    fn set_approved(&self, agent_id: &str, approved: bool) -> Result<AgentRecord, DispatchError>;

    fn set_active(&self, agent_id: &str, active: bool) -> Result<AgentRecord, DispatchError>;

    fn create_assignment(&self, assignment: AgentJobAssignment) -> Result<(), DispatchError>;

    /// Última asignación de la ejecución.
    fn assignment_for_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<AgentJobAssignment>, DispatchError>;

    /// Avanza la última asignación de la ejecución. Devuelve la asignación
    /// y si hubo cambio.
    fn advance_assignment(
        &self,
        execution_id: &str,
        next: AssignmentStatus,
        summary: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(AgentJobAssignment, bool), DispatchError>;

    /// Asignaciones `assigned` del agente, como mucho `max`.
    fn pending_assignments(
        &self,
        agent_id: &str,
        max: usize,
    ) -> Result<Vec<AgentJobAssignment>, DispatchError>;

    /// Asignaciones no terminales de todos los agentes.
    fn active_assignments(&self) -> Result<Vec<AgentJobAssignment>, DispatchError>;

    /// Borra las asignaciones terminales completadas antes de `before`.
    fn prune_assignments(&self, before: DateTime<Utc>) -> Result<usize, DispatchError>;
}

#[derive(Default)]
struct RegistryTables {
    agents: HashMap<String, AgentRecord>,
    assignments: HashMap<String, AgentJobAssignment>,
    /// execution_id → assignment_id más reciente
    by_execution: HashMap<String, String>,
}

impl RegistryTables {
    fn active_count(&self, agent_id: &str) -> u32 {
        self.assignments
            .values()
            .filter(|a| a.agent_id == agent_id && !a.status.is_terminal())
            .count() as u32
    }

    fn least_loaded(
        &self,
        pool: &str,
        capabilities: &[String],
        now: DateTime<Utc>,
    ) -> Option<String> {
        self.agents
            .values()
            .filter(|a| a.agent_pool == pool)
            .filter(|a| a.can_accept_job_at(now))
            .filter(|a| a.has_capabilities(capabilities))
            .min_by(|a, b| {
                a.current_jobs
                    .cmp(&b.current_jobs)
                    .then_with(|| a.agent_id.cmp(&b.agent_id))
            })
            .map(|a| a.agent_id.clone())
    }
}

#[derive(Default)]
pub struct InMemoryAgentRegistry {
    tables: Mutex<RegistryTables>,
}

impl InMemoryAgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, RegistryTables> {
        self.tables.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl AgentRegistry for InMemoryAgentRegistry {
    fn register(
        &self,
        req: AgentRegisterRequest,
    ) -> Result<(RegistrationOutcome, AgentRecord), DispatchError> {
        let now = Utc::now();
        let mut tables = self.tables();

        let (outcome, record) = match tables.agents.get_mut(&req.agent_id) {
            Some(existing) => {
                existing.agent_name = req.agent_name;
                existing.hostname = req.hostname;
                existing.ip_address = req.ip_address;
                existing.endpoint = req.endpoint;
                existing.agent_pool = req.agent_pool;
                existing.capabilities = req.capabilities;
                existing.max_parallel_jobs = req.max_parallel_jobs;
                existing.agent_version = req.agent_version;
                existing.system_info = req.system_info;
                existing.status = "online".to_string();
                existing.last_heartbeat = Some(now);
                (RegistrationOutcome::Updated, existing.clone())
            }
            None => {
                let record = AgentRecord {
                    agent_id: req.agent_id.clone(),
                    agent_name: req.agent_name,
                    hostname: req.hostname,
                    ip_address: req.ip_address,
                    endpoint: req.endpoint,
                    agent_pool: req.agent_pool,
                    capabilities: req.capabilities,
                    max_parallel_jobs: req.max_parallel_jobs,
                    current_jobs: 0,
                    status: "online".to_string(),
                    last_heartbeat: Some(now),
                    is_approved: false,
                    is_active: true,
                    agent_version: req.agent_version,
                    system_info: req.system_info,
                    resources: None,
                    registered_at: now,
                };
                tables.agents.insert(req.agent_id, record.clone());
                (RegistrationOutcome::Created, record)
            }
        };

        info!(
            "agente {} registrado ({:?}, pool={}, max_parallel_jobs={})",
            record.agent_id, outcome, record.agent_pool, record.max_parallel_jobs
        );
        Ok((outcome, record))
    }

    fn heartbeat(
        &self,
        agent_id: &str,
        req: &AgentHeartbeatRequest,
    ) -> Result<AgentRecord, DispatchError> {
        let mut tables = self.tables();
        let in_flight = tables.active_count(agent_id);
        let agent = tables
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| DispatchError::UnknownAgent(agent_id.to_string()))?;

        agent.last_heartbeat = Some(Utc::now());
        agent.status = req.status.clone();
        // el agente puede no saber aún de asignaciones recién creadas
        agent.current_jobs = req.current_jobs.max(in_flight);
        agent.resources = Some(req.resources);

        debug!(
            "heartbeat de {} (estado={}, jobs={}/{})",
            agent_id, agent.status, agent.current_jobs, agent.max_parallel_jobs
        );
        Ok(agent.clone())
    }

    fn get(&self, agent_id: &str) -> Result<Option<AgentRecord>, DispatchError> {
        Ok(self.tables().agents.get(agent_id).cloned())
    }

    fn list(&self, pool: Option<&str>) -> Result<Vec<AgentRecord>, DispatchError> {
        let mut agents: Vec<AgentRecord> = self
            .tables()
            .agents
            .values()
            .filter(|a| pool.map_or(true, |p| a.agent_pool == p))
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(agents)
    }

    fn find_available(
        &self,
        pool: &str,
        capabilities: &[String],
    ) -> Result<Option<AgentRecord>, DispatchError> {
        let tables = self.tables();
        Ok(tables
            .least_loaded(pool, capabilities, Utc::now())
            .and_then(|id| tables.agents.get(&id).cloned()))
    }

    fn reserve(
        &self,
        pool: &str,
        capabilities: &[String],
    ) -> Result<Option<AgentRecord>, DispatchError> {
        let mut tables = self.tables();
        let Some(id) = tables.least_loaded(pool, capabilities, Utc::now()) else {
            return Ok(None);
        };
        let agent = tables
            .agents
            .get_mut(&id)
            .ok_or_else(|| DispatchError::UnknownAgent(id.clone()))?;
        agent.current_jobs += 1;
        debug!(
            "agente {} reservado ({}/{})",
            id, agent.current_jobs, agent.max_parallel_jobs
        );
        Ok(Some(agent.clone()))
    }

    fn release(&self, agent_id: &str) -> Result<(), DispatchError> {
        let mut tables = self.tables();
        let agent = tables
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| DispatchError::UnknownAgent(agent_id.to_string()))?;
        if agent.current_jobs == 0 {
            warn!("release de {} con current_jobs en 0", agent_id);
        }
        agent.current_jobs = agent.current_jobs.saturating_sub(1);
        Ok(())
    }

    fn set_approved(&self, agent_id: &str, approved: bool) -> Result<AgentRecord, DispatchError> {
        let mut tables = self.tables();
        let agent = tables
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| DispatchError::UnknownAgent(agent_id.to_string()))?;
        agent.is_approved = approved;
        info!("agente {} aprobado={}", agent_id, approved);
        Ok(agent.clone())
    }

    fn set_active(&self, agent_id: &str, active: bool) -> Result<AgentRecord, DispatchError> {
        let mut tables = self.tables();
        let agent = tables
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| DispatchError::UnknownAgent(agent_id.to_string()))?;
        agent.is_active = active;
        info!("agente {} activo={}", agent_id, active);
        Ok(agent.clone())
    }

    fn create_assignment(&self, assignment: AgentJobAssignment) -> Result<(), DispatchError> {
        let mut tables = self.tables();
        tables.by_execution.insert(
            assignment.execution_id.clone(),
            assignment.assignment_id.clone(),
        );
        tables
            .assignments
            .insert(assignment.assignment_id.clone(), assignment);
        Ok(())
    }

    fn assignment_for_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<AgentJobAssignment>, DispatchError> {
        let tables = self.tables();
        Ok(tables
            .by_execution
            .get(execution_id)
            .and_then(|id| tables.assignments.get(id))
            .cloned())
    }

    fn advance_assignment(
        &self,
        execution_id: &str,
        next: AssignmentStatus,
        summary: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(AgentJobAssignment, bool), DispatchError> {
        let mut tables = self.tables();
        let id = tables
            .by_execution
            .get(execution_id)
            .cloned()
            .ok_or_else(|| DispatchError::AssignmentNotFound(execution_id.to_string()))?;
        let assignment = tables
            .assignments
            .get_mut(&id)
            .ok_or_else(|| DispatchError::AssignmentNotFound(execution_id.to_string()))?;

        let changed = assignment.advance(next, now)?;
        if changed && summary.is_some() {
            assignment.result_summary = summary;
        }
        Ok((assignment.clone(), changed))
    }

    fn pending_assignments(
        &self,
        agent_id: &str,
        max: usize,
    ) -> Result<Vec<AgentJobAssignment>, DispatchError> {
        let mut pending: Vec<AgentJobAssignment> = self
            .tables()
            .assignments
            .values()
            .filter(|a| a.agent_id == agent_id && a.status == AssignmentStatus::Assigned)
            .cloned()
            .collect();
        pending.sort_by_key(|a| a.assigned_at);
        pending.truncate(max);
        Ok(pending)
    }

    fn active_assignments(&self) -> Result<Vec<AgentJobAssignment>, DispatchError> {
        let mut active: Vec<AgentJobAssignment> = self
            .tables()
            .assignments
            .values()
            .filter(|a| !a.status.is_terminal())
            .cloned()
            .collect();
        active.sort_by_key(|a| a.assigned_at);
        Ok(active)
    }

    fn prune_assignments(&self, before: DateTime<Utc>) -> Result<usize, DispatchError> {
        let mut tables = self.tables();
        let tables = &mut *tables;
        let len = tables.assignments.len();
        tables.assignments.retain(|_, a| {
            !(a.status.is_terminal() && a.completed_at.map_or(false, |t| t < before))
        });
        let assignments = &tables.assignments;
        tables.by_execution.retain(|_, id| assignments.contains_key(id));
        let removed = len - tables.assignments.len();
        if removed > 0 {
            debug!("{} asignaciones terminadas eliminadas", removed);
        }
        Ok(removed)
    }
}
