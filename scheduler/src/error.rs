use thiserror::Error;

use common::{InvalidTransition, JobStatus, JobValidationError};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PersistenceError {
    #[error("error de persistencia: {0}")]
    Storage(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("el motor no está corriendo (estado: {0})")]
    NotRunning(String),

    #[error(transparent)]
    Validation(#[from] JobValidationError),

    #[error("timeout esperando la ejecución {execution_id} después de {waited_secs}s")]
    Timeout {
        execution_id: String,
        waited_secs: u64,
    },

    #[error("la cola '{0}' no acepta jobs")]
    QueueClosed(String),

    #[error("no hay resultado disponible para la ejecución {0}")]
    ResultUnavailable(String),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    /// No hay agente elegible; la ejecución queda en `queued`.
    #[error("no hay agentes disponibles en el pool '{0}'")]
    NoAgentAvailable(String),

    #[error("error de transporte hacia {endpoint}: {reason}")]
    Transport { endpoint: String, reason: String },

    #[error("ejecución desconocida: {0}")]
    UnknownExecution(String),

    #[error("agente desconocido: {0}")]
    UnknownAgent(String),

    #[error("no hay asignación para la ejecución {0}")]
    AssignmentNotFound(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("estado final inválido: {0:?}")]
    InvalidCompletion(JobStatus),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("disparador inválido: {0}")]
    InvalidTrigger(String),

    #[error("el job '{0}' no está programado")]
    NotScheduled(String),

    #[error("el job '{0}' está deshabilitado")]
    JobDisabled(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}
