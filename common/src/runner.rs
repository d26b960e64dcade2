//! Ejecución secuencial de los pasos de un job. La usan las colas del
//! scheduler y los agentes remotos.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, info_span, warn, Instrument};

use crate::context::ExecutionContext;
use crate::job::{JobDefinition, StepConfiguration};
use crate::results::{aggregate_status, JobExecutionResult, JobStatus, StepResult, StepStatus};
use crate::step::{self, StepRegistry};

/// Recibe el progreso de una ejecución (p.ej. el agente lo reporta al scheduler).
#[async_trait]
pub trait JobObserver: Send + Sync {
    async fn step_started(&self, _ctx: &ExecutionContext, _step: &StepConfiguration, _index: usize) {}

    async fn step_finished(&self, _ctx: &ExecutionContext, _result: &StepResult) {}
}

pub struct NoopObserver;

impl JobObserver for NoopObserver {}

/// Corre los pasos en orden y calcula el estado agregado.
///
/// Un paso que falla sin `continue_on_failure` corta la ejecución.
pub async fn run_job(
    job: &JobDefinition,
    execution_id: &str,
    registry: &StepRegistry,
    observer: &dyn JobObserver,
) -> JobExecutionResult {
    let span = info_span!(
        "job",
        job_id = %job.job_id,
        execution_id = %execution_id,
        timezone = %job.timezone,
    );

    async move {
        let mut result = JobExecutionResult::new(execution_id, job, JobStatus::Running);

        if !job.enabled {
            warn!("job deshabilitado, no se ejecuta");
            result.complete(JobStatus::Cancelled, Some("job deshabilitado".into()));
            return result;
        }

        let mut ctx = ExecutionContext::new(&job.job_id, execution_id, &job.timezone);
        ctx.add_metadata("job_name", job.job_name.clone());
        let mut abort_reason: Option<String> = None;

        info!("iniciando job '{}' ({} pasos)", job.job_name, job.steps.len());

        for (index, step_cfg) in job.steps.iter().enumerate() {
            observer.step_started(&ctx, step_cfg, index).await;

            let step_result = match registry.create(step_cfg) {
                Ok(step) => step::execute(step.as_ref(), &mut ctx).await,
                Err(e) => {
                    let mut r = StepResult::started(step_cfg);
                    r.complete(StepStatus::Failed, None, Some(e.to_string()));
                    r
                }
            };

            observer.step_finished(&ctx, &step_result).await;

            let failed = step_result.status.is_failure();
            if failed && !step_cfg.continue_on_failure {
                abort_reason = Some(format!(
                    "paso '{}' falló: {}",
                    step_cfg.step_id,
                    step_result.error_message.as_deref().unwrap_or("sin detalle")
                ));
                result.step_results.push(step_result);
                break;
            }
            if failed {
                warn!("paso '{}' falló, se continúa (continue_on_failure)", step_cfg.step_id);
            }
            result.step_results.push(step_result);
        }

        let aborted = abort_reason.is_some();
        let status = aggregate_status(&result.step_results, aborted);
        let error = match (abort_reason, status) {
            (Some(reason), _) => Some(reason),
            (None, JobStatus::Failed) => Some("ningún paso terminó con éxito".to_string()),
            (None, JobStatus::PartialSuccess) => Some(format!(
                "{} de {} pasos fallaron",
                result.failed_steps(),
                result.step_results.len()
            )),
            _ => None,
        };

        result
            .metadata
            .insert("context_variables".into(), Value::Object(ctx.variables));
        result.complete(status, error);

        info!(
            "job terminó con estado {} en {:.3}s",
            status.as_str(),
            result.duration_seconds.unwrap_or_default()
        );
        result
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StepError;
    use crate::step::testing::ScriptedStep;
    use crate::step::Step;
    use crate::steps::StepServices;
    use serde_json::{json, Map};
    use std::sync::Mutex;

    /// Registro con "ok" (siempre funciona) y "boom" (siempre falla).
    fn fake_registry() -> StepRegistry {
        let mut registry = StepRegistry::new();
        registry.register("ok", |cfg| {
            let mut s = ScriptedStep::new(&cfg.step_id, 0);
            s.cfg = cfg.clone();
            Ok(Box::new(s) as Box<dyn Step>)
        });
        registry.register("boom", |cfg| {
            let mut s = ScriptedStep::new(&cfg.step_id, u32::MAX);
            s.cfg = cfg.clone();
            s.error = StepError::Execution("boom".into());
            Ok(Box::new(s) as Box<dyn Step>)
        });
        registry
    }

    fn step(id: &str, kind: &str, continue_on_failure: bool) -> StepConfiguration {
        let mut cfg = StepConfiguration::new(id, kind, json!({"x": 1}).as_object().cloned().unwrap());
        cfg.continue_on_failure = continue_on_failure;
        cfg.retry_delay = 0;
        cfg
    }

    #[tokio::test]
    async fn todos_ok_es_success() {
        let job = JobDefinition::new("j", "n", vec![step("a", "ok", false), step("b", "ok", false)]);
        let r = run_job(&job, "e1", &fake_registry(), &NoopObserver).await;

        assert_eq!(r.status, JobStatus::Success);
        assert_eq!(r.step_results.len(), 2);
        assert!(r.error_message.is_none());
        assert!(r.end_time.is_some());
    }

    #[tokio::test]
    async fn fallo_sin_continue_aborta_el_resto() {
        let job = JobDefinition::new(
            "j",
            "n",
            vec![step("a", "ok", false), step("b", "boom", false), step("c", "ok", false)],
        );
        let r = run_job(&job, "e1", &fake_registry(), &NoopObserver).await;

        assert_eq!(r.status, JobStatus::Failed);
        assert_eq!(r.step_results.len(), 2);
        assert!(r.error_message.unwrap().contains("paso 'b'"));
    }

    #[tokio::test]
    async fn fallo_con_continue_da_parcial() {
        let job = JobDefinition::new(
            "j",
            "n",
            vec![step("a", "ok", false), step("b", "boom", true), step("c", "ok", false)],
        );
        let r = run_job(&job, "e1", &fake_registry(), &NoopObserver).await;

        assert_eq!(r.status, JobStatus::PartialSuccess);
        assert_eq!(r.step_results.len(), 3);
    }

    #[tokio::test]
    async fn todos_fallan_con_continue_es_failed() {
        let job = JobDefinition::new("j", "n", vec![step("a", "boom", true), step("b", "boom", true)]);
        let r = run_job(&job, "e1", &fake_registry(), &NoopObserver).await;

        assert_eq!(r.status, JobStatus::Failed);
        assert_eq!(r.step_results.len(), 2);
    }

    #[tokio::test]
    async fn job_deshabilitado_se_cancela() {
        let mut job = JobDefinition::new("j", "n", vec![step("a", "ok", false)]);
        job.enabled = false;
        let r = run_job(&job, "e1", &fake_registry(), &NoopObserver).await;

        assert_eq!(r.status, JobStatus::Cancelled);
        assert!(r.step_results.is_empty());
    }

    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl JobObserver for Recorder {
        async fn step_started(&self, _ctx: &ExecutionContext, step: &StepConfiguration, index: usize) {
            self.0.lock().unwrap().push(format!("start {} {}", index, step.step_id));
        }

        async fn step_finished(&self, _ctx: &ExecutionContext, result: &StepResult) {
            self.0
                .lock()
                .unwrap()
                .push(format!("end {} {:?}", result.step_id, result.status));
        }
    }

    #[tokio::test]
    async fn observador_ve_cada_paso() {
        let job = JobDefinition::new("j", "n", vec![step("a", "ok", false), step("b", "boom", false)]);
        let recorder = Recorder(Mutex::new(Vec::new()));

        run_job(&job, "e1", &fake_registry(), &recorder).await;

        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec!["start 0 a", "end a Success", "start 1 b", "end b Failed"]
        );
    }

    #[tokio::test]
    async fn variables_de_contexto_quedan_en_metadata() {
        let job = JobDefinition::new("j", "n", vec![step("a", "ok", false)]);
        let r = run_job(&job, "e1", &fake_registry(), &NoopObserver).await;

        assert_eq!(r.metadata["context_variables"]["a_stdout"], json!("ok 0"));
    }

    // Escenario A: "exit 0" y luego "exit 1" sin continue_on_failure
    #[cfg(unix)]
    #[tokio::test]
    async fn shell_exit_0_luego_exit_1_falla_el_job() {
        let registry = StepRegistry::with_builtin_steps(StepServices::default());
        let mut config = Map::new();
        config.insert("command".into(), "exit 0".into());
        let first = StepConfiguration::new("uno", "shell", config);
        let mut config = Map::new();
        config.insert("command".into(), "exit 1".into());
        let mut second = StepConfiguration::new("dos", "shell", config);
        second.retry_delay = 0;
        let job = JobDefinition::new("escenario-a", "A", vec![first, second]);

        let r = run_job(&job, "e-a", &registry, &NoopObserver).await;

        assert_eq!(r.step_results.len(), 2);
        assert_eq!(r.step_results[0].status, StepStatus::Success);
        assert_eq!(r.step_results[1].status, StepStatus::Failed);
        assert_eq!(r.status, JobStatus::Failed);
    }
}
