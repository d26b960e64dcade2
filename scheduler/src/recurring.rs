//! Programación recurrente de jobs: cron, intervalo y fecha única.
//!
//! Cada disparo pasa por el despachador como un envío más: los jobs locales
//! terminan en `ExecutionEngine::schedule` y los de agentes en la tabla de
//! asignaciones. Los disparos perdidos se colapsan en uno solo.

use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use croner::Cron;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use common::tz::{local_to_utc, parse_timezone, resolve_timezone};
use common::{ExecutionId, JobId, JobSubmission, ScheduleView, Trigger};

use crate::dispatch::Dispatcher;
use crate::error::ScheduleError;

/// Disparador validado, listo para calcular instantes.
enum CompiledTrigger {
    Cron(Cron),
    Interval {
        every: chrono::Duration,
        start: DateTime<Utc>,
    },
    Once(DateTime<Utc>),
}

impl CompiledTrigger {
    fn compile(trigger: &Trigger, tz: Tz, now: DateTime<Utc>) -> Result<Self, ScheduleError> {
        match trigger {
            Trigger::Cron { cron } => Cron::new(cron)
                .with_seconds_optional()
                .parse()
                .map(CompiledTrigger::Cron)
                .map_err(|e| ScheduleError::InvalidTrigger(format!("cron '{}': {}", cron, e))),
            Trigger::Interval { interval } => {
                let every = interval
                    .total_seconds()
                    .and_then(|s| i64::try_from(s).ok())
                    .and_then(chrono::Duration::try_seconds)
                    .filter(|d| *d > chrono::Duration::zero())
                    .ok_or_else(|| {
                        ScheduleError::InvalidTrigger(
                            "el intervalo debe ser mayor que cero".into(),
                        )
                    })?;
                Ok(CompiledTrigger::Interval { every, start: now })
            }
            Trigger::Date { run_date } => parse_run_date(run_date, tz).map(CompiledTrigger::Once),
        }
    }

    /// Primer disparo estrictamente posterior a `after`.
    fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        match self {
            CompiledTrigger::Cron(cron) => cron
                .find_next_occurrence(&after.with_timezone(&tz), false)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
            CompiledTrigger::Interval { every, start } => {
                if after < *start {
                    return start.checked_add_signed(*every);
                }
                let step = every.num_milliseconds();
                let elapsed = after.signed_duration_since(*start).num_milliseconds();
                let offset = (elapsed / step + 1).checked_mul(step)?;
                start.checked_add_signed(chrono::Duration::try_milliseconds(offset)?)
            }
            CompiledTrigger::Once(at) => (*at > after).then_some(*at),
        }
    }
}

/// `run_date` en RFC 3339, o como hora de pared en la zona del job.
fn parse_run_date(raw: &str, tz: Tz) -> Result<DateTime<Utc>, ScheduleError> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(at.with_timezone(&Utc));
    }
    let local = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .map_err(|e| ScheduleError::InvalidTrigger(format!("run_date '{}': {}", raw, e)))?;
    local_to_utc(tz, local).ok_or_else(|| {
        ScheduleError::InvalidTrigger(format!("la hora {} no existe en {}", raw, tz.name()))
    })
}

struct ScheduleEntry {
    submission: JobSubmission,
    trigger: Trigger,
    compiled: CompiledTrigger,
    tz: Tz,
    priority: i32,
    paused: bool,
    next_run: Option<DateTime<Utc>>,
    last_run: Option<DateTime<Utc>>,
    last_execution_id: Option<ExecutionId>,
    run_count: u64,
}

impl ScheduleEntry {
    fn view(&self) -> ScheduleView {
        let job = &self.submission.definition;
        ScheduleView {
            job_id: job.job_id.clone(),
            job_name: job.job_name.clone(),
            timezone: self.tz.name().to_string(),
            trigger: self.trigger.clone(),
            priority: self.priority,
            paused: self.paused,
            next_run_time: self.next_run,
            last_run_time: self.last_run,
            last_execution_id: self.last_execution_id.clone(),
            run_count: self.run_count,
        }
    }
}

/// Tabla de programaciones, una por job. Programar de nuevo un job
/// reemplaza su disparador.
pub struct RecurringScheduler {
    dispatcher: Arc<Dispatcher>,
    entries: Mutex<HashMap<JobId, ScheduleEntry>>,
}

impl RecurringScheduler {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<JobId, ScheduleEntry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn schedule_job(
        &self,
        submission: JobSubmission,
        trigger: Trigger,
        priority: Option<i32>,
    ) -> Result<ScheduleView, ScheduleError> {
        self.schedule_job_at(submission, trigger, priority, Utc::now())
    }

    fn schedule_job_at(
        &self,
        submission: JobSubmission,
        trigger: Trigger,
        priority: Option<i32>,
        now: DateTime<Utc>,
    ) -> Result<ScheduleView, ScheduleError> {
        let job = &submission.definition;
        if !job.enabled {
            return Err(ScheduleError::JobDisabled(job.job_id.clone()));
        }
        self.dispatcher.validate(job)?;

        let (timezone, fallback) = resolve_timezone(&job.timezone);
        if fallback {
            warn!(
                "zona '{}' desconocida para la programación de '{}', se usa {}",
                job.timezone, job.job_id, timezone
            );
        }
        let tz = parse_timezone(&timezone).unwrap_or(chrono_tz::UTC);
        let compiled = CompiledTrigger::compile(&trigger, tz, now)?;
        let next_run = compiled.next_after(now, tz).ok_or_else(|| {
            ScheduleError::InvalidTrigger("el disparador no tiene ejecuciones futuras".into())
        })?;

        let job_id = job.job_id.clone();
        let entry = ScheduleEntry {
            priority: priority.unwrap_or(job.priority),
            submission,
            trigger,
            compiled,
            tz,
            paused: false,
            next_run: Some(next_run),
            last_run: None,
            last_execution_id: None,
            run_count: 0,
        };
        let view = entry.view();
        if self.entries().insert(job_id.clone(), entry).is_some() {
            debug!("programación anterior de '{}' reemplazada", job_id);
        }
        info!(
            "job '{}' programado ({}), próxima ejecución {}",
            job_id,
            view.trigger.kind(),
            next_run
        );
        Ok(view)
    }

    pub fn unschedule(&self, job_id: &str) -> Result<(), ScheduleError> {
        match self.entries().remove(job_id) {
            Some(_) => {
                info!("programación de '{}' eliminada", job_id);
                Ok(())
            }
            None => Err(ScheduleError::NotScheduled(job_id.to_string())),
        }
    }

    /// Deja de disparar sin olvidar el disparador.
    pub fn pause(&self, job_id: &str) -> Result<ScheduleView, ScheduleError> {
        let mut entries = self.entries();
        let entry = entries
            .get_mut(job_id)
            .ok_or_else(|| ScheduleError::NotScheduled(job_id.to_string()))?;
        entry.paused = true;
        info!("programación de '{}' en pausa", job_id);
        Ok(entry.view())
    }

    pub fn resume(&self, job_id: &str) -> Result<ScheduleView, ScheduleError> {
        self.resume_at(job_id, Utc::now())
    }

    /// Los disparos que cayeron durante la pausa no se recuperan.
    fn resume_at(&self, job_id: &str, now: DateTime<Utc>) -> Result<ScheduleView, ScheduleError> {
        let mut entries = self.entries();
        let entry = entries
            .get_mut(job_id)
            .ok_or_else(|| ScheduleError::NotScheduled(job_id.to_string()))?;
        entry.paused = false;
        entry.next_run = entry.compiled.next_after(now, entry.tz);
        info!("programación de '{}' reanudada", job_id);
        Ok(entry.view())
    }

    pub fn get(&self, job_id: &str) -> Option<ScheduleView> {
        self.entries().get(job_id).map(ScheduleEntry::view)
    }

    pub fn list(&self) -> Vec<ScheduleView> {
        let mut out: Vec<ScheduleView> = self.entries().values().map(ScheduleEntry::view).collect();
        out.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        out
    }

    /// Próximos disparos de las programaciones activas, el más cercano primero.
    pub fn next_run_times(&self, limit: usize) -> Vec<ScheduleView> {
        let mut out: Vec<ScheduleView> = self
            .entries()
            .values()
            .filter(|e| !e.paused && e.next_run.is_some())
            .map(ScheduleEntry::view)
            .collect();
        out.sort_by_key(|v| v.next_run_time);
        out.truncate(limit);
        out
    }

    /// Envía los disparos vencidos a `now`. Devuelve cuántos se encolaron.
    pub async fn fire_due(&self, now: DateTime<Utc>) -> usize {
        let due: Vec<(JobSubmission, i32, DateTime<Utc>)> = {
            let mut entries = self.entries();
            entries
                .values_mut()
                .filter(|e| !e.paused)
                .filter_map(|e| {
                    let slot = e.next_run.filter(|t| *t <= now)?;
                    e.next_run = e.compiled.next_after(now, e.tz);
                    e.last_run = Some(slot);
                    e.run_count += 1;
                    Some((e.submission.clone(), e.priority, slot))
                })
                .collect()
        };

        let mut fired = 0;
        for (submission, priority, slot) in due {
            let job_id = submission.definition.job_id.clone();
            match self.dispatcher.submit(submission, Some(priority), Some(slot)).await {
                Ok(resp) => {
                    fired += 1;
                    info!("disparo de '{}' encolado como {}", job_id, resp.execution_id);
                    if let Some(entry) = self.entries().get_mut(&job_id) {
                        entry.last_execution_id = Some(resp.execution_id);
                    }
                }
                Err(e) => warn!("disparo de '{}' falló: {}", job_id, e),
            }
        }

        self.entries().retain(|job_id, e| {
            let keep = e.paused || e.next_run.is_some();
            if !keep {
                debug!("programación de '{}' sin disparos futuros, se descarta", job_id);
            }
            keep
        });
        fired
    }
}

pub async fn run_recurring_loop(
    scheduler: Arc<RecurringScheduler>,
    tick: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = sleep(tick) => {}
            _ = shutdown.changed() => break,
        }
        scheduler.fire_due(Utc::now()).await;
    }
    debug!("programación recurrente detenida");
}
