//! Documento de definición de job (YAML o JSON) → `JobSubmission`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DocumentError;
use crate::job::{JobDefinition, StepConfiguration, DEFAULT_RETRY_DELAY_SECS};
use crate::schedule::Trigger;

pub const DEFAULT_AGENT_POOL: &str = "default";

const JOB_KEYS: [&str; 17] = [
    "id",
    "name",
    "type",
    "description",
    "timezone",
    "enabled",
    "priority",
    "max_retries",
    "timeout_seconds",
    "tags",
    "metadata",
    "created_by",
    "execution_type",
    "agent_pool",
    "agent_requirements",
    "schedule",
    "steps",
];

const STEP_KEYS: [&str; 8] = [
    "id",
    "name",
    "type",
    "timeout",
    "continue_on_failure",
    "retry_count",
    "retry_delay",
    "config",
];

/// Dónde corre un job: en el motor local o en un agente remoto.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutionTarget {
    Local,
    Agent {
        pool: String,
        #[serde(default)]
        capabilities: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub struct JobSubmission {
    pub definition: JobDefinition,
    pub target: ExecutionTarget,
    /// Texto original; es lo que se reenvía a los agentes
    pub source: String,
}

fn document_map(text: &str) -> Result<Map<String, Value>, DocumentError> {
    let yaml: serde_yaml::Value = serde_yaml::from_str(text)?;
    let doc = serde_json::to_value(&yaml).map_err(|e| DocumentError::InvalidValue {
        key: "documento".into(),
        reason: e.to_string(),
    })?;
    match doc {
        Value::Object(doc) => Ok(doc),
        _ => Err(DocumentError::NotAMap),
    }
}

pub fn parse_job_document(text: &str) -> Result<JobSubmission, DocumentError> {
    let doc = document_map(text)?;
    submission_from_map(&doc, text)
}

/// Documento de job con bloque `schedule` obligatorio.
pub fn parse_scheduled_document(text: &str) -> Result<(JobSubmission, Trigger), DocumentError> {
    let doc = document_map(text)?;
    let submission = submission_from_map(&doc, text)?;
    let trigger = match doc.get("schedule") {
        None | Some(Value::Null) => return Err(DocumentError::MissingKey("schedule".into())),
        Some(raw) => serde_json::from_value::<Trigger>(raw.clone())
            .map_err(|e| invalid("schedule", &e.to_string()))?,
    };
    Ok((submission, trigger))
}

fn submission_from_map(doc: &Map<String, Value>, text: &str) -> Result<JobSubmission, DocumentError> {
    let job_id = required_string(doc, "id")?;
    let job_name = required_string(doc, "name")?;
    let job_type = required_string(doc, "type")?;

    let steps = match doc.get("steps") {
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, item)| parse_step(i, item))
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err(invalid("steps", "debe ser una lista")),
        None if is_job_level_type(&job_type) => return Err(DocumentError::MissingKey("steps".into())),
        // forma de un solo paso: `type` es el tipo de paso y el resto de claves su config
        None => {
            let config: Map<String, Value> = doc
                .iter()
                .filter(|(k, _)| !JOB_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let mut step = StepConfiguration::new("main", &job_type, config);
            step.step_name = job_name.clone();
            vec![step]
        }
    };

    let mut definition = JobDefinition::new(&job_id, &job_name, steps);
    if let Some(v) = optional_string(doc, "description")? {
        definition.description = v;
    }
    if let Some(v) = optional_string(doc, "timezone")? {
        definition.timezone = v;
    }
    if let Some(v) = optional_bool(doc, "enabled")? {
        definition.enabled = v;
    }
    if let Some(v) = optional_i64(doc, "priority")? {
        definition.priority = i32::try_from(v).map_err(|_| invalid("priority", "fuera de rango"))?;
    }
    if let Some(v) = optional_u64(doc, "max_retries")? {
        definition.max_retries = u32::try_from(v).map_err(|_| invalid("max_retries", "fuera de rango"))?;
    }
    if let Some(v) = optional_u64(doc, "timeout_seconds")? {
        definition.timeout_seconds = v;
    }
    if let Some(v) = optional_string_list(doc, "tags")? {
        definition.tags = v;
    }
    match doc.get("metadata") {
        None | Some(Value::Null) => {}
        Some(Value::Object(m)) => definition.metadata = m.clone(),
        Some(_) => return Err(invalid("metadata", "debe ser un diccionario")),
    }
    definition.created_by = optional_string(doc, "created_by")?;

    let target = execution_target(doc, &job_type)?;

    Ok(JobSubmission {
        definition,
        target,
        source: text.to_string(),
    })
}

fn is_job_level_type(job_type: &str) -> bool {
    matches!(job_type, "local" | "agent" | "agent_job")
}

/// Marcadores de ruteo: `execution_type: agent`, `type: agent|agent_job` o `agent_pool`.
fn execution_target(doc: &Map<String, Value>, job_type: &str) -> Result<ExecutionTarget, DocumentError> {
    let execution_type = optional_string(doc, "execution_type")?;
    let pool = optional_string(doc, "agent_pool")?;

    let routed = matches!(job_type, "agent" | "agent_job")
        || execution_type.as_deref() == Some("agent")
        || pool.is_some();
    if !routed {
        return Ok(ExecutionTarget::Local);
    }

    let capabilities = match doc.get("agent_requirements") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Object(req)) => optional_string_list(req, "capabilities")?.unwrap_or_default(),
        Some(_) => return Err(invalid("agent_requirements", "debe ser un diccionario")),
    };

    Ok(ExecutionTarget::Agent {
        pool: pool
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_AGENT_POOL.to_string()),
        capabilities,
    })
}

fn parse_step(index: usize, item: &Value) -> Result<StepConfiguration, DocumentError> {
    let Value::Object(map) = item else {
        return Err(invalid(&format!("steps[{}]", index), "debe ser un diccionario"));
    };

    let step_id = required_string(map, "id")?;
    let step_type = required_string(map, "type")?;

    let mut config: Map<String, Value> = map
        .iter()
        .filter(|(k, _)| !STEP_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    match map.get("config") {
        None | Some(Value::Null) => {}
        Some(Value::Object(nested)) => config.extend(nested.clone()),
        Some(_) => return Err(invalid("config", "debe ser un diccionario")),
    }

    Ok(StepConfiguration {
        step_name: optional_string(map, "name")?.unwrap_or_else(|| step_id.clone()),
        timeout: optional_u64(map, "timeout")?,
        continue_on_failure: optional_bool(map, "continue_on_failure")?.unwrap_or(false),
        retry_count: match optional_u64(map, "retry_count")? {
            Some(v) => u32::try_from(v).map_err(|_| invalid("retry_count", "fuera de rango"))?,
            None => 0,
        },
        retry_delay: optional_u64(map, "retry_delay")?.unwrap_or(DEFAULT_RETRY_DELAY_SECS),
        step_id,
        step_type,
        config,
    })
}

fn invalid(key: &str, reason: &str) -> DocumentError {
    DocumentError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn required_string(map: &Map<String, Value>, key: &str) -> Result<String, DocumentError> {
    match optional_string(map, key)? {
        Some(s) if !s.trim().is_empty() => Ok(s),
        _ => Err(DocumentError::MissingKey(key.to_string())),
    }
}

fn optional_string(map: &Map<String, Value>, key: &str) -> Result<Option<String>, DocumentError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        // ids numéricos en YAML (`id: 42`)
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err(invalid(key, "debe ser texto")),
    }
}

fn optional_bool(map: &Map<String, Value>, key: &str) -> Result<Option<bool>, DocumentError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(invalid(key, "debe ser booleano")),
    }
}

fn optional_u64(map: &Map<String, Value>, key: &str) -> Result<Option<u64>, DocumentError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| invalid(key, "debe ser un entero no negativo")),
    }
}

fn optional_i64(map: &Map<String, Value>, key: &str) -> Result<Option<i64>, DocumentError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| invalid(key, "debe ser un entero")),
    }
}

fn optional_string_list(
    map: &Map<String, Value>,
    key: &str,
) -> Result<Option<Vec<String>>, DocumentError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| invalid(key, "debe ser una lista de textos"))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        Some(_) => Err(invalid(key, "debe ser una lista")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MULTI_STEP: &str = r#"
id: backup-nocturno
name: Backup nocturno
type: local
timezone: America/New_York
priority: 7
tags: [db, nightly]
steps:
  - id: dump
    type: shell
    command: pg_dump main > /tmp/main.sql
    timeout: 600
    retry_count: 2
    retry_delay: 10
  - id: contar
    name: Contar filas
    type: sql
    query: SELECT count(*) FROM t
    continue_on_failure: true
"#;

    #[test]
    fn parsea_job_multi_paso_local() {
        let sub = parse_job_document(MULTI_STEP).unwrap();
        let def = &sub.definition;

        assert_eq!(sub.target, ExecutionTarget::Local);
        assert_eq!(def.job_id, "backup-nocturno");
        assert_eq!(def.timezone, "America/New_York");
        assert_eq!(def.priority, 7);
        assert_eq!(def.tags, vec!["db", "nightly"]);
        assert_eq!(def.steps.len(), 2);

        let dump = &def.steps[0];
        assert_eq!(dump.step_name, "dump");
        assert_eq!(dump.timeout, Some(600));
        assert_eq!(dump.retry_count, 2);
        assert_eq!(dump.retry_delay, 10);
        assert_eq!(dump.config.get("command"), Some(&json!("pg_dump main > /tmp/main.sql")));
        assert!(!dump.config.contains_key("timeout"));

        let contar = &def.steps[1];
        assert_eq!(contar.step_name, "Contar filas");
        assert!(contar.continue_on_failure);
        assert_eq!(contar.retry_delay, DEFAULT_RETRY_DELAY_SECS);
    }

    #[test]
    fn forma_de_un_solo_paso() {
        let sub = parse_job_document(
            r#"{"id": "q1", "name": "Consulta", "type": "sql", "query": "select 1", "timeout_seconds": 30}"#,
        )
        .unwrap();

        let step = &sub.definition.steps[0];
        assert_eq!(step.step_type, "sql");
        assert_eq!(step.step_name, "Consulta");
        assert_eq!(step.config.get("query"), Some(&json!("select 1")));
        assert!(!step.config.contains_key("timeout_seconds"));
        assert_eq!(sub.definition.timeout_seconds, 30);
    }

    #[test]
    fn agent_pool_enruta_a_agentes() {
        let sub = parse_job_document(
            "id: j\nname: n\ntype: shell\ncommand: nvidia-smi\nagent_pool: gpu\nagent_requirements:\n  capabilities: [cuda]\n",
        )
        .unwrap();

        assert_eq!(
            sub.target,
            ExecutionTarget::Agent {
                pool: "gpu".into(),
                capabilities: vec!["cuda".into()],
            }
        );
        assert!(!sub.definition.steps[0].config.contains_key("agent_pool"));
    }

    #[test]
    fn execution_type_agent_usa_pool_por_defecto() {
        let sub = parse_job_document(
            "id: j\nname: n\ntype: agent_job\nexecution_type: agent\nsteps:\n  - id: a\n    type: shell\n    command: 'true'\n",
        )
        .unwrap();

        assert_eq!(
            sub.target,
            ExecutionTarget::Agent {
                pool: DEFAULT_AGENT_POOL.into(),
                capabilities: vec![],
            }
        );
    }

    #[test]
    fn faltan_claves_requeridas() {
        assert!(matches!(
            parse_job_document("name: n\ntype: shell\n"),
            Err(DocumentError::MissingKey(k)) if k == "id"
        ));
        assert!(matches!(
            parse_job_document("id: j\nname: n\ntype: local\n"),
            Err(DocumentError::MissingKey(k)) if k == "steps"
        ));
        assert!(matches!(
            parse_job_document("id: j\nname: n\ntype: local\nsteps:\n  - type: shell\n"),
            Err(DocumentError::MissingKey(k)) if k == "id"
        ));
    }

    #[test]
    fn documento_que_no_es_mapa() {
        assert!(matches!(parse_job_document("- a\n- b\n"), Err(DocumentError::NotAMap)));
        assert!(matches!(parse_job_document("id: [\n"), Err(DocumentError::Syntax(_))));
    }

    #[test]
    fn documento_con_programacion_cron() {
        let (sub, trigger) = parse_scheduled_document(
            "id: rep\nname: Reporte\ntype: shell\ncommand: ./reporte.sh\ntimezone: Europe/Madrid\nschedule:\n  type: cron\n  cron: '0 30 9 * * mon-fri'\n",
        )
        .unwrap();
        assert_eq!(sub.definition.timezone, "Europe/Madrid");
        assert_eq!(
            trigger,
            Trigger::Cron {
                cron: "0 30 9 * * mon-fri".into()
            }
        );
        // la programación no se filtra a la config del paso
        assert!(!sub.definition.steps[0].config.contains_key("schedule"));
    }

    #[test]
    fn programacion_de_intervalo_y_errores() {
        let (_, trigger) = parse_scheduled_document(
            "id: j\nname: n\ntype: shell\ncommand: 'true'\nschedule: {type: interval, interval: {minutes: 5}}\n",
        )
        .unwrap();
        match trigger {
            Trigger::Interval { interval } => assert_eq!(interval.total_seconds(), Some(300)),
            other => panic!("disparador inesperado: {:?}", other),
        }

        let sin = parse_scheduled_document("id: j\nname: n\ntype: shell\ncommand: 'true'\n");
        assert!(matches!(sin, Err(DocumentError::MissingKey(k)) if k == "schedule"));

        let raro = parse_scheduled_document(
            "id: j\nname: n\ntype: shell\ncommand: 'true'\nschedule: {type: lunar}\n",
        );
        assert!(matches!(raro, Err(DocumentError::InvalidValue { key, .. }) if key == "schedule"));
    }
}
