//! Historial de ejecuciones: contrato de persistencia y versión en memoria.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use common::{ExecutionRecord, JobExecutionResult, JobStatus};

use crate::error::PersistenceError;

/// Persistencia de ejecuciones. Es best-effort: quien llama registra el
/// error y sigue, nunca aborta un job por esto.
pub trait ExecutionHistory: Send + Sync {
    /// Alta de una ejecución recién aceptada.
    fn record_submitted(&self, record: ExecutionRecord) -> Result<(), PersistenceError>;

    /// La ejecución empezó a correr.
    fn record_start(&self, meta: &ExecutionRecord) -> Result<(), PersistenceError>;

    /// Resultado final. Un registro terminal no se vuelve a tocar.
    fn record_complete(
        &self,
        meta: &ExecutionRecord,
        result: &JobExecutionResult,
    ) -> Result<(), PersistenceError>;

    /// Avanza el estado si no retrocede. Devuelve si hubo cambio.
    fn update_status(
        &self,
        execution_id: &str,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<bool, PersistenceError>;

    /// Vuelve a `queued` una ejecución no terminal para un nuevo intento.
    fn requeue(&self, execution_id: &str) -> Result<bool, PersistenceError>;

    fn set_agent(&self, execution_id: &str, agent_id: Option<&str>) -> Result<(), PersistenceError>;

    fn append_log(&self, execution_id: &str, line: &str) -> Result<(), PersistenceError>;

    fn get(&self, execution_id: &str) -> Result<Option<ExecutionRecord>, PersistenceError>;

    fn list_by_status(&self, status: JobStatus) -> Result<Vec<ExecutionRecord>, PersistenceError>;

    /// Borra los registros terminales que terminaron antes de `before`.
    /// Devuelve cuántos se borraron.
    fn prune_finished(&self, before: DateTime<Utc>) -> Result<usize, PersistenceError>;
}

#[derive(Default)]
pub struct InMemoryHistory {
    records: Mutex<HashMap<String, ExecutionRecord>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, ExecutionRecord>> {
        self.records.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl ExecutionHistory for InMemoryHistory {
    fn record_submitted(&self, record: ExecutionRecord) -> Result<(), PersistenceError> {
        self.records()
            .entry(record.execution_id.clone())
            .or_insert(record);
        Ok(())
    }

    fn record_start(&self, meta: &ExecutionRecord) -> Result<(), PersistenceError> {
        let mut records = self.records();
        let rec = records
            .entry(meta.execution_id.clone())
            .or_insert_with(|| meta.clone());
        if rec.status.can_advance_to(JobStatus::Running) {
            rec.status = JobStatus::Running;
            if rec.started_at.is_none() {
                rec.started_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    fn record_complete(
        &self,
        meta: &ExecutionRecord,
        result: &JobExecutionResult,
    ) -> Result<(), PersistenceError> {
        let mut records = self.records();
        let rec = records
            .entry(meta.execution_id.clone())
            .or_insert_with(|| meta.clone());
        if rec.status.is_terminal() {
            return Ok(());
        }
        rec.status = result.status;
        rec.started_at.get_or_insert(result.start_time);
        rec.finished_at = Some(result.end_time.unwrap_or_else(Utc::now));
        rec.error_message = result.error_message.clone();
        rec.result = Some(result.clone());
        Ok(())
    }

    fn update_status(
        &self,
        execution_id: &str,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<bool, PersistenceError> {
        let mut records = self.records();
        let Some(rec) = records.get_mut(execution_id) else {
            return Ok(false);
        };
        if rec.status == status || !rec.status.can_advance_to(status) {
            return Ok(false);
        }
        rec.status = status;
        if status == JobStatus::Running && rec.started_at.is_none() {
            rec.started_at = Some(Utc::now());
        }
        if status.is_terminal() {
            rec.finished_at = Some(Utc::now());
        }
        if error.is_some() {
            rec.error_message = error;
        }
        Ok(true)
    }

    fn requeue(&self, execution_id: &str) -> Result<bool, PersistenceError> {
        let mut records = self.records();
        let Some(rec) = records.get_mut(execution_id) else {
            return Ok(false);
        };
        if rec.status.is_terminal() {
            return Ok(false);
        }
        rec.status = JobStatus::Queued;
        rec.retry_count += 1;
        rec.agent_id = None;
        Ok(true)
    }

    fn set_agent(&self, execution_id: &str, agent_id: Option<&str>) -> Result<(), PersistenceError> {
        if let Some(rec) = self.records().get_mut(execution_id) {
            rec.agent_id = agent_id.map(str::to_string);
        }
        Ok(())
    }

    fn append_log(&self, execution_id: &str, line: &str) -> Result<(), PersistenceError> {
        match self.records().get_mut(execution_id) {
            Some(rec) => {
                rec.output_log.push(line.to_string());
                Ok(())
            }
            None => Err(PersistenceError::Storage(format!(
                "ejecución {} no existe",
                execution_id
            ))),
        }
    }

    fn get(&self, execution_id: &str) -> Result<Option<ExecutionRecord>, PersistenceError> {
        Ok(self.records().get(execution_id).cloned())
    }

    fn list_by_status(&self, status: JobStatus) -> Result<Vec<ExecutionRecord>, PersistenceError> {
        let mut out: Vec<ExecutionRecord> = self
            .records()
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.submitted_at.cmp(&b.submitted_at))
        });
        Ok(out)
    }

    fn prune_finished(&self, before: DateTime<Utc>) -> Result<usize, PersistenceError> {
        let mut records = self.records();
        let len = records.len();
        records.retain(|_, r| {
            !(r.status.is_terminal() && r.finished_at.map_or(false, |t| t < before))
        });
        Ok(len - records.len())
    }
}
