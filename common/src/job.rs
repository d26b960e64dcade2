use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::error::JobValidationError;
use crate::step::StepRegistry;

pub type JobId = String;
pub type ExecutionId = String;

pub const DEFAULT_TIMEZONE: &str = "UTC";
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 5;

/// Configuración de un paso dentro de un job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepConfiguration {
    pub step_id: String,
    pub step_name: String,
    /// Discriminador hacia el registro de pasos ("shell", "sql", ...)
    pub step_type: String,
    /// Configuración propia del tipo de paso
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Timeout duro por intento, en segundos
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub continue_on_failure: bool,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
}

fn default_retry_delay() -> u64 {
    DEFAULT_RETRY_DELAY_SECS
}

impl StepConfiguration {
    pub fn new(step_id: &str, step_type: &str, config: Map<String, Value>) -> Self {
        Self {
            step_id: step_id.to_string(),
            step_name: step_id.to_string(),
            step_type: step_type.to_string(),
            config,
            timeout: None,
            continue_on_failure: false,
            retry_count: 0,
            retry_delay: DEFAULT_RETRY_DELAY_SECS,
        }
    }

    /// Reglas genéricas, comunes a todos los tipos de paso.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.step_id.trim().is_empty() {
            errors.push("step_id es obligatorio".to_string());
        }
        if self.step_name.trim().is_empty() {
            errors.push("step_name es obligatorio".to_string());
        }
        if self.step_type.trim().is_empty() {
            errors.push("step_type es obligatorio".to_string());
        }
        if self.config.is_empty() {
            errors.push("config no puede estar vacío".to_string());
        }
        if self.timeout == Some(0) {
            errors.push("timeout debe ser un entero positivo".to_string());
        }

        errors
    }
}

/// Definición completa de un job: pasos ordenados + metadatos de planificación.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobDefinition {
    pub job_id: JobId,
    pub job_name: String,
    #[serde(default)]
    pub description: String,
    /// Zona IANA dueña del job
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub steps: Vec<StepConfiguration>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_job_timeout")]
    pub timeout_seconds: u64,
    /// Mayor = más urgente
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: Option<String>,
}

fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_job_timeout() -> u64 {
    DEFAULT_JOB_TIMEOUT_SECS
}

impl JobDefinition {
    pub fn new(job_id: &str, job_name: &str, steps: Vec<StepConfiguration>) -> Self {
        Self {
            job_id: job_id.to_string(),
            job_name: job_name.to_string(),
            description: String::new(),
            timezone: default_timezone(),
            steps,
            enabled: true,
            max_retries: 0,
            timeout_seconds: DEFAULT_JOB_TIMEOUT_SECS,
            priority: 0,
            tags: Vec::new(),
            metadata: Map::new(),
            created_at: Utc::now(),
            created_by: None,
        }
    }

    /// Valida el job completo y devuelve todos los errores juntos.
    ///
    /// Cada paso se construye contra el registro, así que las reglas propias
    /// de cada tipo también entran en el resultado.
    pub fn validate(&self, registry: &StepRegistry) -> Result<(), JobValidationError> {
        let mut errors = Vec::new();

        if self.job_id.trim().is_empty() {
            errors.push("job_id es obligatorio".to_string());
        }
        if self.job_name.trim().is_empty() {
            errors.push("job_name es obligatorio".to_string());
        }
        if self.timezone.trim().is_empty() {
            errors.push("timezone es obligatorio".to_string());
        }
        if self.timeout_seconds == 0 {
            errors.push("timeout_seconds debe ser un entero positivo".to_string());
        }
        if self.steps.is_empty() {
            errors.push("se requiere al menos un paso".to_string());
        }

        let mut seen = HashSet::new();
        for (i, step) in self.steps.iter().enumerate() {
            if !seen.insert(step.step_id.as_str()) {
                errors.push(format!("step_id duplicado: {}", step.step_id));
            }
            if let Err(e) = registry.create(step) {
                errors.extend(
                    e.errors
                        .into_iter()
                        .map(|msg| format!("paso {} ({}): {}", i, step.step_id, msg)),
                );
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(JobValidationError {
                job_id: self.job_id.clone(),
                errors,
            })
        }
    }
}

/// Genera un execution_id del estilo `exec_20240101_120000_1a2b3c4d`.
pub fn generate_execution_id(at: DateTime<Utc>) -> ExecutionId {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("exec_{}_{}", at.format("%Y%m%d_%H%M%S"), &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cfg(pairs: Value) -> Map<String, Value> {
        pairs.as_object().cloned().unwrap()
    }

    fn shell_step(id: &str) -> StepConfiguration {
        StepConfiguration::new(id, "shell", cfg(json!({"command": "true"})))
    }

    #[test]
    fn execution_id_tiene_formato_esperado() {
        let at = DateTime::parse_from_rfc3339("2024-03-05T07:08:09Z")
            .unwrap()
            .with_timezone(&Utc);
        let id = generate_execution_id(at);

        assert!(id.starts_with("exec_20240305_070809_"));
        assert_eq!(id.len(), "exec_20240305_070809_".len() + 8);
    }

    #[test]
    fn validacion_generica_de_paso() {
        let mut step = StepConfiguration::new("", "", Map::new());
        step.timeout = Some(0);

        let errors = step.validate();
        assert_eq!(errors.len(), 5);
    }

    #[test]
    fn job_sin_pasos_es_invalido() {
        let registry = StepRegistry::new();
        let job = JobDefinition::new("j1", "vacío", vec![]);

        let err = job.validate(&registry).unwrap_err();
        assert!(err.errors.iter().any(|e| e.contains("al menos un paso")));
    }

    #[test]
    fn job_con_ids_duplicados_y_tipo_desconocido_agrega_errores() {
        let registry = StepRegistry::new();
        let job = JobDefinition::new("j1", "dup", vec![shell_step("a"), shell_step("a")]);

        let err = job.validate(&registry).unwrap_err();
        assert!(err.errors.iter().any(|e| e.contains("duplicado")));
        // registro vacío: ambos pasos fallan por tipo desconocido
        assert_eq!(
            err.errors
                .iter()
                .filter(|e| e.contains("tipo de paso desconocido"))
                .count(),
            2
        );
    }

    #[test]
    fn valores_por_defecto_al_deserializar() {
        let job: JobDefinition = serde_json::from_value(json!({
            "job_id": "j",
            "job_name": "n",
            "steps": [{"step_id": "s", "step_name": "s", "step_type": "shell", "config": {"command": "true"}}]
        }))
        .unwrap();

        assert_eq!(job.timezone, "UTC");
        assert!(job.enabled);
        assert_eq!(job.timeout_seconds, DEFAULT_JOB_TIMEOUT_SECS);
        assert_eq!(job.steps[0].retry_delay, DEFAULT_RETRY_DELAY_SECS);
    }
}
