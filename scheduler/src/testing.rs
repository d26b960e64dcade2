//! Pasos falsos y helpers compartidos por los tests del scheduler.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{ExecutionContext, JobDefinition, Step, StepConfiguration, StepError, StepRegistry};

pub type CallLog = Arc<Mutex<Vec<String>>>;

struct FakeStep {
    cfg: StepConfiguration,
    log: CallLog,
    fail: bool,
}

#[async_trait]
impl Step for FakeStep {
    fn config(&self) -> &StepConfiguration {
        &self.cfg
    }

    async fn execute_impl(&self, ctx: &mut ExecutionContext) -> Result<String, StepError> {
        if let Some(ms) = self.cfg.config.get("ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        self.log.lock().unwrap().push(ctx.job_id.clone());
        if self.fail {
            return Err(StepError::Execution("boom".into()));
        }
        Ok(format!("{} ok", self.cfg.step_id))
    }
}

/// Registro con "record" (anota el job y termina bien), "sleep" (igual,
/// pero duerme `ms`) y "boom" (siempre falla).
pub fn fake_registry(log: CallLog) -> StepRegistry {
    let mut registry = StepRegistry::new();
    for (kind, fail) in [("record", false), ("sleep", false), ("boom", true)] {
        let log = log.clone();
        registry.register(kind, move |cfg| {
            Ok(Box::new(FakeStep {
                cfg: cfg.clone(),
                log: log.clone(),
                fail,
            }) as Box<dyn Step>)
        });
    }
    registry
}

pub fn call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn one_step_job(job_id: &str, kind: &str, config: Value) -> JobDefinition {
    let config: Map<String, Value> = match config {
        Value::Object(map) if !map.is_empty() => map,
        _ => json!({ "tag": job_id }).as_object().cloned().unwrap_or_default(),
    };
    let mut step = StepConfiguration::new("main", kind, config);
    step.retry_delay = 0;
    JobDefinition::new(job_id, job_id, vec![step])
}
