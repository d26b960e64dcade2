//! Framework de pasos: contrato común, política de reintentos/timeout y registro.

mod params;
mod registry;

pub use params::ConfigReader;
pub use registry::{StepFactory, StepRegistry};

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{info, info_span, warn, Instrument};

use crate::context::ExecutionContext;
use crate::error::StepError;
use crate::job::StepConfiguration;
use crate::results::{StepResult, StepStatus};

/// Un tipo de paso concreto. Sólo el cuerpo cambia entre tipos;
/// reintentos y timeout los pone [`execute`].
#[async_trait]
pub trait Step: Send + Sync {
    fn config(&self) -> &StepConfiguration;

    /// Un intento. Puede escribir variables en el contexto para pasos posteriores.
    async fn execute_impl(&self, ctx: &mut ExecutionContext) -> Result<String, StepError>;
}

/// Ejecuta un paso con su máquina de reintentos.
///
/// Intentos = `retry_count + 1`. Antes de cada reintento se duerme
/// `retry_delay`. Cada intento corre bajo el timeout del paso si lo tiene.
/// Los errores no reintentables cortan el ciclo de inmediato.
pub async fn execute(step: &dyn Step, ctx: &mut ExecutionContext) -> StepResult {
    let cfg = step.config();
    let span = info_span!(
        "step",
        step_id = %cfg.step_id,
        step_type = %cfg.step_type,
    );

    async move {
        let mut result = StepResult::started(cfg);
        let attempts = cfg.retry_count.saturating_add(1);
        let mut last_error: Option<StepError> = None;
        let mut attempt_used = 0;

        info!("iniciando paso '{}'", cfg.step_name);

        for attempt in 0..attempts {
            attempt_used = attempt;

            if attempt > 0 {
                info!(
                    "reintento {}/{} en {}s",
                    attempt, cfg.retry_count, cfg.retry_delay
                );
                sleep(Duration::from_secs(cfg.retry_delay)).await;
            }

            let outcome = match cfg.timeout {
                Some(secs) => match timeout(Duration::from_secs(secs), step.execute_impl(ctx)).await
                {
                    Ok(r) => r,
                    Err(_) => Err(StepError::Timeout(secs)),
                },
                None => step.execute_impl(ctx).await,
            };

            match outcome {
                Ok(output) => {
                    result.retry_count = attempt;
                    result
                        .metadata
                        .insert("attempts".into(), (attempt + 1).into());
                    result.complete(StepStatus::Success, Some(output), None);
                    info!(
                        "paso completado en {:.3}s",
                        result.duration_seconds.unwrap_or_default()
                    );
                    return result;
                }
                Err(e) => {
                    warn!("intento {} falló: {}", attempt + 1, e);
                    let retryable = e.is_retryable();
                    last_error = Some(e);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        result.retry_count = attempt_used;
        result
            .metadata
            .insert("attempts".into(), (attempt_used + 1).into());
        if matches!(last_error, Some(StepError::Timeout(_))) {
            result.metadata.insert("timed_out".into(), true.into());
        }
        let message = last_error.map(|e| e.to_string());
        warn!("paso falló: {}", message.as_deref().unwrap_or("sin detalle"));
        result.complete(StepStatus::Failed, None, message);
        result
    }
    .instrument(span)
    .await
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedStep;
    use super::*;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("job", "exec", "UTC")
    }

    #[tokio::test]
    async fn exito_al_primer_intento() {
        let step = ScriptedStep::new("a", 0);
        let mut ctx = ctx();

        let r = execute(&step, &mut ctx).await;

        assert_eq!(r.status, StepStatus::Success);
        assert_eq!(r.retry_count, 0);
        assert_eq!(r.output, "ok 0");
        assert_eq!(ctx.get_variable("stdout"), Some(&json!("ok 0")));
    }

    #[tokio::test]
    async fn siempre_falla_hace_k_mas_uno_intentos() {
        let mut step = ScriptedStep::new("a", u32::MAX);
        step.cfg.retry_count = 3;

        let r = execute(&step, &mut ctx()).await;

        assert_eq!(step.calls.load(Ordering::SeqCst), 4);
        assert_eq!(r.status, StepStatus::Failed);
        assert_eq!(r.retry_count, 3);
        assert_eq!(r.error_message.as_deref(), Some("falla programada"));
    }

    #[tokio::test]
    async fn exito_tras_reintentos_registra_el_intento() {
        let mut step = ScriptedStep::new("a", 2);
        step.cfg.retry_count = 5;

        let r = execute(&step, &mut ctx()).await;

        assert_eq!(r.status, StepStatus::Success);
        assert_eq!(r.retry_count, 2);
        assert_eq!(step.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn error_de_validacion_no_se_reintenta() {
        let mut step = ScriptedStep::new("a", u32::MAX);
        step.cfg.retry_count = 4;
        step.error = StepError::Validation("tipo incorrecto".into());

        let r = execute(&step, &mut ctx()).await;

        assert_eq!(step.calls.load(Ordering::SeqCst), 1);
        assert_eq!(r.status, StepStatus::Failed);
        assert_eq!(r.retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cuenta_como_intento_fallido() {
        let mut step = ScriptedStep::new("lento", 0);
        step.sleep_ms = 5_000;
        step.cfg.timeout = Some(1);
        step.cfg.retry_count = 1;

        let r = execute(&step, &mut ctx()).await;

        assert_eq!(step.calls.load(Ordering::SeqCst), 2);
        assert_eq!(r.status, StepStatus::Failed);
        assert_eq!(r.metadata.get("timed_out"), Some(&json!(true)));
        assert!(r.error_message.unwrap().contains("timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn espera_retry_delay_entre_intentos() {
        let mut step = ScriptedStep::new("a", 1);
        step.cfg.retry_count = 1;
        step.cfg.retry_delay = 30;

        let before = tokio::time::Instant::now();
        let r = execute(&step, &mut ctx()).await;

        assert_eq!(r.status, StepStatus::Success);
        assert!(before.elapsed() >= Duration::from_secs(30));
    }
}
