use thiserror::Error;

/// Error de un intento de ejecución de un paso.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StepError {
    /// Configuración inválida detectada en tiempo de ejecución. No se reintenta.
    #[error("validación: {0}")]
    Validation(String),

    /// Falta un colaborador externo (p.ej. ejecutor SQL). No se reintenta.
    #[error("configuración: {0}")]
    Configuration(String),

    #[error("{0}")]
    Execution(String),

    #[error("timeout después de {0}s")]
    Timeout(u64),
}

impl StepError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Execution(_) | StepError::Timeout(_))
    }
}

/// Lista estructurada de problemas de configuración de un paso.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("paso '{step_id}' inválido: {}", errors.join("; "))]
pub struct StepValidationError {
    pub step_id: String,
    pub errors: Vec<String>,
}

impl StepValidationError {
    pub fn new(step_id: impl Into<String>, errors: Vec<String>) -> Self {
        Self {
            step_id: step_id.into(),
            errors,
        }
    }
}

/// Todos los errores de validación de un job, agregados.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("job '{job_id}' inválido: {}", errors.join("; "))]
pub struct JobValidationError {
    pub job_id: String,
    pub errors: Vec<String>,
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("documento mal formado: {0}")]
    Syntax(#[from] serde_yaml::Error),

    #[error("el documento debe ser un mapa")]
    NotAMap,

    #[error("falta la clave requerida '{0}'")]
    MissingKey(String),

    #[error("valor inválido para '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}
