use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Estado compartido por todos los pasos de una ejecución.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub job_id: String,
    pub execution_id: String,
    pub timezone: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ExecutionContext {
    pub fn new(job_id: &str, execution_id: &str, timezone: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            execution_id: execution_id.to_string(),
            timezone: timezone.to_string(),
            start_time: Utc::now(),
            variables: Map::new(),
            metadata: Map::new(),
        }
    }

    pub fn set_variable(&mut self, key: &str, value: impl Into<Value>) {
        self.variables.insert(key.to_string(), value.into());
    }

    pub fn get_variable(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    /// Guarda la variable con su nombre plano y con el prefijo del paso,
    /// así un paso posterior puede leer `stdout` o `extraer_stdout`.
    pub fn set_step_variable(&mut self, step_id: &str, key: &str, value: impl Into<Value>) {
        let value = value.into();
        self.variables
            .insert(format!("{}_{}", step_id, key), value.clone());
        self.variables.insert(key.to_string(), value);
    }

    pub fn add_metadata(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    /// Variables de entorno que se exportan a los procesos hijos.
    pub fn environment(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("JOB_ID".to_string(), self.job_id.clone()),
            ("EXECUTION_ID".to_string(), self.execution_id.clone()),
            ("JOB_TIMEZONE".to_string(), self.timezone.clone()),
        ];

        for (key, value) in &self.variables {
            let scalar = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => continue,
            };
            let name: String = key
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
                .collect();
            env.push((format!("JOB_VAR_{}", name), scalar));
        }

        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn variable_de_paso_se_guarda_dos_veces() {
        let mut ctx = ExecutionContext::new("j", "e", "UTC");
        ctx.set_step_variable("contar", "rows_affected", 7);

        assert_eq!(ctx.get_variable("rows_affected"), Some(&json!(7)));
        assert_eq!(ctx.get_variable("contar_rows_affected"), Some(&json!(7)));
    }

    #[test]
    fn entorno_exporta_solo_escalares() {
        let mut ctx = ExecutionContext::new("j1", "e1", "Europe/London");
        ctx.set_variable("stdout", "hola");
        ctx.set_variable("ok", true);
        ctx.set_variable("lista", json!([1, 2]));

        let env = ctx.environment();
        assert!(env.contains(&("JOB_ID".into(), "j1".into())));
        assert!(env.contains(&("JOB_TIMEZONE".into(), "Europe/London".into())));
        assert!(env.contains(&("JOB_VAR_STDOUT".into(), "hola".into())));
        assert!(env.contains(&("JOB_VAR_OK".into(), "true".into())));
        assert!(!env.iter().any(|(k, _)| k == "JOB_VAR_LISTA"));
    }
}
