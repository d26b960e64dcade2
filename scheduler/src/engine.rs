//! Motor de ejecución: colas por zona horaria, ciclo de vida y supervisión.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{info, warn};

use common::tz::resolve_timezone;
use common::{ExecutionId, JobDefinition, JobExecutionResult, StepRegistry};

use crate::error::EngineError;
use crate::history::ExecutionHistory;
use crate::queue::{ActiveJob, QueueConfig, QueueStatus, QueuedJobView, TimezoneJobQueue};

/// Prioridad por defecto de `execute_immediately`.
pub const HIGH_PRIORITY: i32 = 10;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub queue: QueueConfig,
    /// Colas que se crean al arrancar
    pub default_timezones: Vec<String>,
    pub health_interval: Duration,
    pub metrics_interval: Duration,
    /// Margen sobre `timeout_seconds` al esperar un job síncrono
    pub result_wait_buffer: Duration,
    pub stop_grace: Duration,
    pub queue_size_warning: usize,
    pub min_success_rate: f64,
    pub min_processed_for_rate: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            default_timezones: vec![
                "UTC".to_string(),
                "America/New_York".to_string(),
                "Europe/London".to_string(),
            ],
            health_interval: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(600),
            result_wait_buffer: Duration::from_secs(60),
            stop_grace: Duration::from_secs(30),
            queue_size_warning: 100,
            min_success_rate: 80.0,
            min_processed_for_rate: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl EngineState {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineState::Stopped => "stopped",
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::Stopping => "stopping",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub started_at: Option<DateTime<Utc>>,
    pub queue_count: usize,
    pub total_queued: usize,
    pub total_active: usize,
    pub total_processed: u64,
    pub total_successful: u64,
    pub total_failed: u64,
    pub success_rate: f64,
    pub supported_step_types: Vec<String>,
    pub queues: Vec<QueueStatus>,
}

pub struct ExecutionEngine {
    config: EngineConfig,
    registry: Arc<StepRegistry>,
    history: Arc<dyn ExecutionHistory>,
    queues: Mutex<HashMap<String, Arc<TimezoneJobQueue>>>,
    state: Mutex<EngineState>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl ExecutionEngine {
    pub fn new(
        config: EngineConfig,
        registry: Arc<StepRegistry>,
        history: Arc<dyn ExecutionHistory>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            registry,
            history,
            queues: Mutex::new(HashMap::new()),
            state: Mutex::new(EngineState::Stopped),
            started_at: Mutex::new(None),
            shutdown,
            supervisor: Mutex::new(None),
        })
    }

    pub fn state(&self) -> EngineState {
        *guard(&self.state)
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn supported_step_types(&self) -> Vec<String> {
        self.registry.kinds()
    }

    /// stopped → starting → running. Crea las colas por defecto y el supervisor.
    pub fn start(self: &Arc<Self>) {
        {
            let mut state = guard(&self.state);
            if *state != EngineState::Stopped {
                warn!("el motor ya está en estado {}", state.as_str());
                return;
            }
            *state = EngineState::Starting;
        }
        info!("iniciando motor de ejecución");
        self.shutdown.send_replace(false);
        *guard(&self.started_at) = Some(Utc::now());

        // colas que quedaron detenidas de una corrida anterior
        let existing: Vec<Arc<TimezoneJobQueue>> = guard(&self.queues).values().cloned().collect();
        for queue in existing {
            queue.start();
        }
        for tz in &self.config.default_timezones {
            self.queue_for(tz);
        }

        let engine = Arc::clone(self);
        let rx = self.shutdown.subscribe();
        *guard(&self.supervisor) = Some(tokio::spawn(async move {
            engine.supervisor_loop(rx).await;
        }));

        *guard(&self.state) = EngineState::Running;
        info!(
            "motor corriendo con {} colas; tipos de paso: {}",
            guard(&self.queues).len(),
            self.supported_step_types().join(", ")
        );
    }

    /// running → stopping → stopped. Cada cola espera a sus activos hasta la gracia.
    pub async fn stop(&self) {
        {
            let mut state = guard(&self.state);
            if *state != EngineState::Running {
                return;
            }
            *state = EngineState::Stopping;
        }
        info!("deteniendo motor de ejecución");
        self.shutdown.send_replace(true);

        let supervisor = guard(&self.supervisor).take();
        if let Some(handle) = supervisor {
            if let Err(e) = handle.await {
                warn!("el supervisor terminó con error: {}", e);
            }
        }

        let queues: Vec<Arc<TimezoneJobQueue>> = guard(&self.queues).values().cloned().collect();
        let deadline = Instant::now() + self.config.stop_grace;
        for queue in queues {
            let left = deadline.saturating_duration_since(Instant::now());
            queue.stop(left).await;
        }

        *guard(&self.state) = EngineState::Stopped;
        info!("motor detenido");
    }

    /// Cola de la zona, creándola si no existe. Siempre la devuelve arrancada.
    fn queue_for(self: &Arc<Self>, timezone: &str) -> Arc<TimezoneJobQueue> {
        let mut queues = guard(&self.queues);
        if let Some(queue) = queues.get(timezone) {
            queue.start();
            return Arc::clone(queue);
        }
        let queue = TimezoneJobQueue::new(
            timezone,
            self.config.queue.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.history),
        );
        queue.start();
        queues.insert(timezone.to_string(), Arc::clone(&queue));
        info!("cola creada para la zona {}", timezone);
        queue
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        let state = self.state();
        if state != EngineState::Running {
            return Err(EngineError::NotRunning(state.as_str().to_string()));
        }
        Ok(())
    }

    /// Valida el job y resuelve su zona; una zona desconocida cae a UTC.
    fn prepare(&self, mut job: JobDefinition) -> Result<Arc<JobDefinition>, EngineError> {
        let (timezone, fallback) = resolve_timezone(&job.timezone);
        if fallback {
            warn!(
                "zona horaria '{}' desconocida para el job '{}', se usa {}",
                job.timezone, job.job_id, timezone
            );
        }
        job.timezone = timezone;
        job.validate(&self.registry)?;
        Ok(Arc::new(job))
    }

    pub fn validate(&self, job: &JobDefinition) -> Result<(), EngineError> {
        self.prepare(job.clone()).map(|_| ())
    }

    /// Encola el job en la cola de su zona y devuelve el id de ejecución.
    pub fn schedule(
        self: &Arc<Self>,
        job: JobDefinition,
        scheduled_time: Option<DateTime<Utc>>,
        priority: i32,
    ) -> Result<ExecutionId, EngineError> {
        self.ensure_running()?;
        let job = self.prepare(job)?;
        let queue = self.queue_for(&job.timezone);
        let execution_id = queue.add_job(job, scheduled_time, priority)?;
        info!("ejecución {} programada", execution_id);
        Ok(execution_id)
    }

    /// Encola con prioridad alta y espera el resultado hasta
    /// `timeout_seconds` + margen. Vencido el plazo el job sigue corriendo.
    pub async fn execute_immediately(
        self: &Arc<Self>,
        job: JobDefinition,
        priority: i32,
    ) -> Result<JobExecutionResult, EngineError> {
        self.ensure_running()?;
        let job = self.prepare(job)?;
        let wait = Duration::from_secs(job.timeout_seconds)
            .saturating_add(self.config.result_wait_buffer);
        let queue = self.queue_for(&job.timezone);
        let (execution_id, rx) = queue.add_job_with_result(job, None, priority)?;
        info!(
            "ejecución inmediata {} (espera máx {:?})",
            execution_id, wait
        );

        match timeout(wait, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => self.result_from_history(&execution_id),
            Err(_) => {
                warn!("se agotó la espera de la ejecución {}", execution_id);
                Err(EngineError::Timeout {
                    execution_id,
                    waited_secs: wait.as_secs(),
                })
            }
        }
    }

    /// Último recurso si el canal se cerró sin resultado. Nunca inventa un éxito.
    fn result_from_history(&self, execution_id: &str) -> Result<JobExecutionResult, EngineError> {
        match self.history.get(execution_id) {
            Ok(Some(record)) => record
                .result
                .ok_or_else(|| EngineError::ResultUnavailable(execution_id.to_string())),
            Ok(None) => Err(EngineError::ResultUnavailable(execution_id.to_string())),
            Err(e) => {
                warn!("no se pudo leer el historial de {}: {}", execution_id, e);
                Err(EngineError::ResultUnavailable(execution_id.to_string()))
            }
        }
    }

    /// Cancela un job pendiente, en la cola indicada o en todas.
    pub fn cancel(&self, execution_id: &str, timezone: Option<&str>) -> bool {
        let queues: Vec<Arc<TimezoneJobQueue>> = {
            let queues = guard(&self.queues);
            match timezone {
                Some(tz) => queues.get(tz).cloned().into_iter().collect(),
                None => queues.values().cloned().collect(),
            }
        };
        queues.iter().any(|q| q.cancel(execution_id))
    }

    pub fn is_active(&self, execution_id: &str) -> bool {
        guard(&self.queues)
            .values()
            .any(|q| q.is_active(execution_id))
    }

    pub fn queue_status(&self, timezone: &str) -> Option<QueueStatus> {
        guard(&self.queues).get(timezone).map(|q| q.status())
    }

    pub fn queue_statuses(&self) -> Vec<QueueStatus> {
        let mut statuses: Vec<QueueStatus> =
            guard(&self.queues).values().map(|q| q.status()).collect();
        statuses.sort_by(|a, b| a.timezone.cmp(&b.timezone));
        statuses
    }

    pub fn active_jobs(&self) -> HashMap<String, Vec<ActiveJob>> {
        guard(&self.queues)
            .iter()
            .map(|(tz, q)| (tz.clone(), q.active_jobs()))
            .collect()
    }

    pub fn queued_jobs(&self) -> HashMap<String, Vec<QueuedJobView>> {
        guard(&self.queues)
            .iter()
            .map(|(tz, q)| (tz.clone(), q.queued_jobs()))
            .collect()
    }

    pub fn status(&self) -> EngineStatus {
        let queues = self.queue_statuses();
        let total_processed: u64 = queues.iter().map(|q| q.processed).sum();
        let total_successful: u64 = queues.iter().map(|q| q.successful).sum();
        let success_rate = if total_processed > 0 {
            total_successful as f64 / total_processed as f64 * 100.0
        } else {
            0.0
        };

        EngineStatus {
            state: self.state(),
            started_at: *guard(&self.started_at),
            queue_count: queues.len(),
            total_queued: queues.iter().map(|q| q.queue_size).sum(),
            total_active: queues.iter().map(|q| q.active_jobs).sum(),
            total_processed,
            total_successful,
            total_failed: queues.iter().map(|q| q.failed).sum(),
            success_rate,
            supported_step_types: self.supported_step_types(),
            queues,
        }
    }

    /// Avisos de salud por cola. Sólo detecta, no corrige nada.
    pub fn check_health(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for q in self.queue_statuses() {
            if q.queue_size > self.config.queue_size_warning {
                warnings.push(format!(
                    "cola {} con {} jobs pendientes",
                    q.timezone, q.queue_size
                ));
            }
            if q.processed > self.config.min_processed_for_rate
                && q.success_rate < self.config.min_success_rate
            {
                warnings.push(format!(
                    "cola {} con tasa de éxito baja: {:.1}%",
                    q.timezone, q.success_rate
                ));
            }
        }
        warnings
    }

    async fn supervisor_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut last_metrics = Instant::now();
        loop {
            tokio::select! {
                _ = sleep(self.config.health_interval) => {}
                _ = shutdown.changed() => break,
            }

            for warning in self.check_health() {
                warn!("salud: {}", warning);
            }

            if last_metrics.elapsed() >= self.config.metrics_interval {
                last_metrics = Instant::now();
                let status = self.status();
                info!(
                    "métricas: {} colas, {} pendientes, {} activos, {} procesados ({:.1}% éxito)",
                    status.queue_count,
                    status.total_queued,
                    status.total_active,
                    status.total_processed,
                    status.success_rate
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::InMemoryHistory;
    use crate::queue::QueueState;
    use crate::testing::{call_log, fake_registry, one_step_job};
    use common::{JobStatus, StepConfiguration, StepServices};
    use serde_json::{json, Map};

    fn test_config() -> EngineConfig {
        EngineConfig {
            queue: QueueConfig {
                idle_sleep: Duration::from_millis(10),
                ..QueueConfig::default()
            },
            result_wait_buffer: Duration::from_millis(200),
            stop_grace: Duration::from_millis(200),
            ..EngineConfig::default()
        }
    }

    fn engine() -> Arc<ExecutionEngine> {
        ExecutionEngine::new(
            test_config(),
            Arc::new(fake_registry(call_log())),
            Arc::new(InMemoryHistory::new()),
        )
    }

    #[tokio::test]
    async fn schedule_con_motor_detenido_falla() {
        let engine = engine();
        let err = engine
            .schedule(one_step_job("j", "record", json!({})), None, 1)
            .unwrap_err();
        assert!(matches!(err, EngineError::NotRunning(_)));
    }

    #[tokio::test]
    async fn start_crea_las_colas_por_defecto() {
        let engine = engine();
        engine.start();

        let zones: Vec<String> = engine
            .queue_statuses()
            .into_iter()
            .map(|q| q.timezone)
            .collect();
        assert_eq!(zones, vec!["America/New_York", "Europe/London", "UTC"]);
        assert!(engine.is_running());

        engine.stop().await;
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    // Escenario B: un paso sql sin `query` nunca llega a la cola
    #[tokio::test]
    async fn sql_sin_query_se_rechaza_antes_de_encolar() {
        let engine = ExecutionEngine::new(
            test_config(),
            Arc::new(StepRegistry::with_builtin_steps(StepServices::default())),
            Arc::new(InMemoryHistory::new()),
        );
        engine.start();

        let mut config = Map::new();
        config.insert("connection_name".into(), json!("main"));
        let job = JobDefinition::new("b", "B", vec![StepConfiguration::new("q", "sql", config)]);

        let err = engine.schedule(job, None, 1).unwrap_err();
        match err {
            EngineError::Validation(e) => {
                assert!(e.errors.iter().any(|m| m.contains("query")), "{:?}", e.errors)
            }
            other => panic!("error inesperado: {other}"),
        }
        assert_eq!(engine.status().total_queued, 0);

        engine.stop().await;
    }

    #[tokio::test]
    async fn zona_desconocida_cae_a_utc() {
        let engine = engine();
        engine.start();

        let mut job = one_step_job("j", "record", json!({}));
        job.timezone = "Marte/Olympus".into();
        let result = engine.execute_immediately(job, HIGH_PRIORITY).await.unwrap();

        assert_eq!(result.status, JobStatus::Success);
        assert_eq!(result.timezone, "UTC");
        engine.stop().await;
    }

    #[tokio::test]
    async fn zona_nueva_crea_su_cola() {
        let engine = engine();
        engine.start();

        let mut job = one_step_job("j", "record", json!({}));
        job.timezone = "Asia/Tokyo".into();
        engine.execute_immediately(job, HIGH_PRIORITY).await.unwrap();

        assert_eq!(engine.queue_status("Asia/Tokyo").unwrap().processed, 1);
        engine.stop().await;
    }

    // Escenario E: el job duerme más que su timeout y el llamador recibe timeout
    #[tokio::test]
    async fn ejecucion_inmediata_vence_por_timeout() {
        let engine = engine();
        engine.start();

        let mut job = one_step_job("lento", "sleep", json!({ "ms": 5_000 }));
        job.timeout_seconds = 1;
        let started = std::time::Instant::now();
        let err = engine
            .execute_immediately(job, HIGH_PRIORITY)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
        // el job sigue corriendo del lado del motor
        assert_eq!(engine.status().total_active, 1);
    }

    #[tokio::test]
    async fn reinicio_vuelve_a_arrancar_las_colas() {
        let engine = engine();
        engine.start();
        let mut job = one_step_job("tokio", "record", json!({}));
        job.timezone = "Asia/Tokyo".into();
        engine.execute_immediately(job, HIGH_PRIORITY).await.unwrap();
        engine.stop().await;
        assert_eq!(engine.queue_status("UTC").unwrap().state, QueueState::Stopped);

        engine.start();
        for q in engine.queue_statuses() {
            assert_eq!(q.state, QueueState::Running, "cola {}", q.timezone);
        }
        let result = engine
            .execute_immediately(one_step_job("j", "record", json!({})), HIGH_PRIORITY)
            .await
            .unwrap();
        assert_eq!(result.status, JobStatus::Success);
        engine.stop().await;
    }

    #[tokio::test]
    async fn timeout_enorme_no_desborda_la_espera() {
        let engine = engine();
        engine.start();

        let mut job = one_step_job("j", "record", json!({}));
        job.timeout_seconds = u64::MAX - 1;
        let result = engine.execute_immediately(job, HIGH_PRIORITY).await.unwrap();

        assert_eq!(result.status, JobStatus::Success);
        engine.stop().await;
    }

    #[tokio::test]
    async fn cancelar_en_todas_las_colas() {
        let engine = engine();
        engine.start();

        let later = Utc::now() + chrono::Duration::hours(1);
        let id = engine
            .schedule(one_step_job("j", "record", json!({})), Some(later), 1)
            .unwrap();

        assert!(engine.cancel(&id, None));
        assert!(!engine.cancel(&id, Some("UTC")));
        engine.stop().await;
    }

    #[test]
    fn salud_detecta_cola_grande() {
        let mut config = test_config();
        config.queue_size_warning = 1;
        let engine = ExecutionEngine::new(
            config,
            Arc::new(fake_registry(call_log())),
            Arc::new(InMemoryHistory::new()),
        );
        let queue = TimezoneJobQueue::new(
            "UTC",
            QueueConfig::default(),
            Arc::clone(&engine.registry),
            Arc::clone(&engine.history),
        );
        for id in ["a", "b"] {
            queue
                .add_job(Arc::new(one_step_job(id, "record", json!({}))), None, 1)
                .unwrap();
        }
        guard(&engine.queues).insert("UTC".into(), queue);

        let warnings = engine.check_health();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("2 jobs pendientes"));
    }
}
