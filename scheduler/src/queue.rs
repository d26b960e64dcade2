//! Cola de jobs de una zona horaria: heap de prioridad, workers y métricas.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use common::{
    generate_execution_id, run_job, ExecutionId, ExecutionRecord, ExecutionTarget,
    JobDefinition, JobExecutionResult, JobStatus, NoopObserver, StepRegistry,
};

use crate::error::EngineError;
use crate::history::ExecutionHistory;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_concurrent_jobs: usize,
    pub worker_count: usize,
    /// Espera de un worker cuando no hay jobs listos
    pub idle_sleep: Duration,
    pub monitor_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 5,
            worker_count: 2,
            idle_sleep: Duration::from_secs(1),
            monitor_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl QueueState {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueState::Stopped => "stopped",
            QueueState::Starting => "starting",
            QueueState::Running => "running",
            QueueState::Stopping => "stopping",
            QueueState::Error => "error",
        }
    }
}

/// Un job esperando turno en la cola.
pub struct QueuedJob {
    pub execution_id: ExecutionId,
    pub job: Arc<JobDefinition>,
    pub scheduled_time: DateTime<Utc>,
    pub priority: i32,
    pub enqueue_time: DateTime<Utc>,
    seq: u64,
    notify: Option<oneshot::Sender<JobExecutionResult>>,
}

impl QueuedJob {
    pub fn is_ready_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.scheduled_time
    }

    fn record(&self, status: JobStatus) -> ExecutionRecord {
        let mut record =
            ExecutionRecord::new(&self.execution_id, &self.job, ExecutionTarget::Local, status);
        record.priority = self.priority;
        record.submitted_at = self.enqueue_time;
        record
    }
}

/// Clave del heap de listos: prioridad desc, hora programada asc, orden de llegada.
#[derive(Debug, PartialEq, Eq)]
struct ReadyKey {
    priority: i32,
    scheduled: DateTime<Utc>,
    seq: u64,
}

impl Ord for ReadyKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.scheduled.cmp(&self.scheduled))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Jobs pendientes. Los futuros esperan en `deferred` hasta su hora; las
/// cancelaciones sólo borran la entrada y las claves huérfanas se
/// descartan al salir del heap.
#[derive(Default)]
struct PendingJobs {
    entries: HashMap<u64, QueuedJob>,
    by_execution: HashMap<ExecutionId, u64>,
    ready: BinaryHeap<ReadyKey>,
    deferred: BinaryHeap<Reverse<(DateTime<Utc>, u64)>>,
    next_seq: u64,
}

impl PendingJobs {
    fn push(&mut self, mut job: QueuedJob, now: DateTime<Utc>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        job.seq = seq;

        if job.is_ready_at(now) {
            self.ready.push(ReadyKey {
                priority: job.priority,
                scheduled: job.scheduled_time,
                seq,
            });
        } else {
            self.deferred.push(Reverse((job.scheduled_time, seq)));
        }
        self.by_execution.insert(job.execution_id.clone(), seq);
        self.entries.insert(seq, job);
    }

    /// Pasa a `ready` los diferidos cuya hora ya llegó.
    fn promote(&mut self, now: DateTime<Utc>) {
        while let Some(Reverse((scheduled, seq))) = self.deferred.peek().copied() {
            if scheduled > now {
                break;
            }
            self.deferred.pop();
            if let Some(job) = self.entries.get(&seq) {
                self.ready.push(ReadyKey {
                    priority: job.priority,
                    scheduled,
                    seq,
                });
            }
        }
    }

    fn pop_ready(&mut self, now: DateTime<Utc>) -> Option<QueuedJob> {
        self.promote(now);
        while let Some(key) = self.ready.pop() {
            if let Some(job) = self.entries.remove(&key.seq) {
                self.by_execution.remove(&job.execution_id);
                return Some(job);
            }
        }
        None
    }

    fn remove(&mut self, execution_id: &str) -> Option<QueuedJob> {
        let seq = self.by_execution.remove(execution_id)?;
        self.entries.remove(&seq)
    }

    fn drain(&mut self) -> Vec<QueuedJob> {
        self.ready.clear();
        self.deferred.clear();
        self.by_execution.clear();
        self.entries.drain().map(|(_, job)| job).collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Job que un worker tiene corriendo.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveJob {
    pub execution_id: ExecutionId,
    pub job_id: String,
    pub job_name: String,
    pub priority: i32,
    pub scheduled_time: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuedJobView {
    pub execution_id: ExecutionId,
    pub job_id: String,
    pub job_name: String,
    pub priority: i32,
    pub scheduled_time: DateTime<Utc>,
    pub enqueue_time: DateTime<Utc>,
    pub wait_seconds: f64,
    pub ready: bool,
}

#[derive(Debug, Default)]
struct QueueMetrics {
    processed: u64,
    successful: u64,
    failed: u64,
    total_duration_secs: f64,
    total_wait_secs: f64,
    started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub timezone: String,
    pub state: QueueState,
    pub queue_size: usize,
    pub active_jobs: usize,
    pub worker_count: usize,
    pub max_concurrent_jobs: usize,
    pub processed: u64,
    pub successful: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub average_duration_seconds: f64,
    pub average_wait_seconds: f64,
    pub uptime_seconds: i64,
    pub jobs_per_hour: f64,
}

pub struct TimezoneJobQueue {
    timezone: String,
    config: QueueConfig,
    registry: Arc<StepRegistry>,
    history: Arc<dyn ExecutionHistory>,
    pending: Mutex<PendingJobs>,
    active: Mutex<HashMap<ExecutionId, ActiveJob>>,
    metrics: Mutex<QueueMetrics>,
    state: Mutex<QueueState>,
    permits: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl TimezoneJobQueue {
    pub fn new(
        timezone: &str,
        config: QueueConfig,
        registry: Arc<StepRegistry>,
        history: Arc<dyn ExecutionHistory>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let permits = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        Arc::new(Self {
            timezone: timezone.to_string(),
            config,
            registry,
            history,
            pending: Mutex::new(PendingJobs::default()),
            active: Mutex::new(HashMap::new()),
            metrics: Mutex::new(QueueMetrics::default()),
            state: Mutex::new(QueueState::Stopped),
            permits,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn timezone(&self) -> &str {
        &self.timezone
    }

    pub fn state(&self) -> QueueState {
        *guard(&self.state)
    }

    fn set_state(&self, state: QueueState) {
        *guard(&self.state) = state;
    }

    /// Lanza los workers y el monitor. Llamarlo con la cola ya corriendo no hace nada.
    pub fn start(self: &Arc<Self>) {
        {
            let mut state = guard(&self.state);
            if *state != QueueState::Stopped {
                return;
            }
            *state = QueueState::Starting;
        }
        self.shutdown.send_replace(false);
        guard(&self.metrics).started_at = Some(Utc::now());

        let mut tasks = guard(&self.tasks);
        for worker in 0..self.config.worker_count.max(1) {
            let queue = Arc::clone(self);
            let rx = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                queue.worker_loop(worker, rx).await;
            }));
        }
        let queue = Arc::clone(self);
        let rx = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            queue.monitor_loop(rx).await;
        }));
        drop(tasks);

        self.set_state(QueueState::Running);
        info!(
            "cola {} iniciada ({} workers, máx {} concurrentes)",
            self.timezone, self.config.worker_count, self.config.max_concurrent_jobs
        );
    }

    /// Detiene los workers y espera hasta `grace` a que terminen los jobs
    /// activos. Los pendientes se cancelan.
    pub async fn stop(&self, grace: Duration) {
        {
            let mut state = guard(&self.state);
            if matches!(*state, QueueState::Stopped | QueueState::Stopping) {
                return;
            }
            *state = QueueState::Stopping;
        }
        self.shutdown.send_replace(true);

        let handles: Vec<JoinHandle<()>> = guard(&self.tasks).drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("worker de la cola {} terminó con error: {}", self.timezone, e);
            }
        }

        let deadline = Instant::now() + grace;
        while self.active_count() > 0 && Instant::now() < deadline {
            sleep(Duration::from_millis(100)).await;
        }
        let remaining = self.active_count();
        if remaining > 0 {
            warn!(
                "cola {}: {} jobs siguen activos tras {:?} de gracia",
                self.timezone, remaining, grace
            );
        }

        let leftovers = guard(&self.pending).drain();
        if !leftovers.is_empty() {
            info!(
                "cola {}: cancelando {} jobs pendientes",
                self.timezone,
                leftovers.len()
            );
        }
        for queued in leftovers {
            self.finish_cancelled(queued, "cola detenida");
        }

        self.set_state(QueueState::Stopped);
        info!("cola {} detenida", self.timezone);
    }

    /// Encola un job. Sin hora programada corre en cuanto haya turno.
    pub fn add_job(
        &self,
        job: Arc<JobDefinition>,
        scheduled_time: Option<DateTime<Utc>>,
        priority: i32,
    ) -> Result<ExecutionId, EngineError> {
        self.push(job, scheduled_time, priority, None)
    }

    /// Como [`add_job`](Self::add_job), y además devuelve un canal que
    /// recibe el resultado cuando el job termina o se cancela.
    pub fn add_job_with_result(
        &self,
        job: Arc<JobDefinition>,
        scheduled_time: Option<DateTime<Utc>>,
        priority: i32,
    ) -> Result<(ExecutionId, oneshot::Receiver<JobExecutionResult>), EngineError> {
        let (tx, rx) = oneshot::channel();
        let id = self.push(job, scheduled_time, priority, Some(tx))?;
        Ok((id, rx))
    }

    fn push(
        &self,
        job: Arc<JobDefinition>,
        scheduled_time: Option<DateTime<Utc>>,
        priority: i32,
        notify: Option<oneshot::Sender<JobExecutionResult>>,
    ) -> Result<ExecutionId, EngineError> {
        if matches!(self.state(), QueueState::Stopping | QueueState::Error) {
            return Err(EngineError::QueueClosed(self.timezone.clone()));
        }

        let now = Utc::now();
        let scheduled_time = scheduled_time.unwrap_or(now);
        let queued = QueuedJob {
            execution_id: generate_execution_id(scheduled_time),
            job,
            scheduled_time,
            priority,
            enqueue_time: now,
            seq: 0,
            notify,
        };
        let execution_id = queued.execution_id.clone();

        if let Err(e) = self.history.record_submitted(queued.record(JobStatus::Pending)) {
            warn!("no se pudo registrar la ejecución {}: {}", execution_id, e);
        }

        info!(
            "job '{}' encolado en {} como {} (prioridad {}, programado {})",
            queued.job.job_id, self.timezone, execution_id, priority, scheduled_time
        );
        guard(&self.pending).push(queued, now);
        Ok(execution_id)
    }

    /// Saca el siguiente job listo: mayor prioridad y, a igual prioridad,
    /// el programado antes. Los futuros no salen antes de su hora.
    pub fn next_ready(&self, now: DateTime<Utc>) -> Option<QueuedJob> {
        guard(&self.pending).pop_ready(now)
    }

    /// Quita un job pendiente. Un job activo no se puede interrumpir.
    pub fn cancel(&self, execution_id: &str) -> bool {
        let removed = guard(&self.pending).remove(execution_id);
        match removed {
            Some(queued) => {
                info!("job {} cancelado en la cola {}", execution_id, self.timezone);
                self.finish_cancelled(queued, "cancelado antes de ejecutarse");
                true
            }
            None => {
                if guard(&self.active).contains_key(execution_id) {
                    warn!(
                        "job {} ya está corriendo en {}, no se puede cancelar",
                        execution_id, self.timezone
                    );
                }
                false
            }
        }
    }

    fn finish_cancelled(&self, mut queued: QueuedJob, reason: &str) {
        let mut result =
            JobExecutionResult::new(&queued.execution_id, &queued.job, JobStatus::Pending);
        result.complete(JobStatus::Cancelled, Some(reason.to_string()));

        if let Err(e) = self
            .history
            .record_complete(&queued.record(JobStatus::Pending), &result)
        {
            warn!("no se pudo persistir la cancelación de {}: {}", queued.execution_id, e);
        }
        if let Some(tx) = queued.notify.take() {
            let _ = tx.send(result);
        }
    }

    async fn worker_loop(self: Arc<Self>, worker: usize, mut shutdown: watch::Receiver<bool>) {
        debug!("worker {} de la cola {} arrancó", worker, self.timezone);
        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            let Some(queued) = self.next_ready(Utc::now()) else {
                drop(permit);
                tokio::select! {
                    _ = sleep(self.config.idle_sleep) => {}
                    _ = shutdown.changed() => break,
                }
                continue;
            };

            let queue = Arc::clone(&self);
            tokio::spawn(async move {
                queue.execute(queued, permit).await;
            });
        }
        debug!("worker {} de la cola {} terminó", worker, self.timezone);
    }

    /// Corre un job ya sacado de la cola. El permiso se libera al salir.
    async fn execute(&self, mut queued: QueuedJob, _permit: OwnedSemaphorePermit) {
        let started_at = Utc::now();
        let execution_id = queued.execution_id.clone();
        guard(&self.active).insert(
            execution_id.clone(),
            ActiveJob {
                execution_id: execution_id.clone(),
                job_id: queued.job.job_id.clone(),
                job_name: queued.job.job_name.clone(),
                priority: queued.priority,
                scheduled_time: queued.scheduled_time,
                started_at,
                timeout_seconds: queued.job.timeout_seconds,
            },
        );

        let meta = queued.record(JobStatus::Pending);
        if let Err(e) = self.history.record_start(&meta) {
            warn!("no se pudo registrar el inicio de {}: {}", execution_id, e);
        }

        // Un panic dentro del job no debe tumbar al worker
        let job = Arc::clone(&queued.job);
        let registry = Arc::clone(&self.registry);
        let run_id = execution_id.clone();
        let handle = tokio::spawn(async move {
            run_job(&job, &run_id, &registry, &NoopObserver).await
        });
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => {
                error!("la ejecución {} abortó: {}", execution_id, e);
                let mut result =
                    JobExecutionResult::new(&execution_id, &queued.job, JobStatus::Running);
                result.start_time = started_at;
                result.complete(JobStatus::Failed, Some(format!("la ejecución abortó: {}", e)));
                result
            }
        };

        if let Err(e) = self.history.record_complete(&meta, &result) {
            warn!("no se pudo persistir el resultado de {}: {}", execution_id, e);
        }

        {
            let mut metrics = guard(&self.metrics);
            metrics.processed += 1;
            if result.status == JobStatus::Success {
                metrics.successful += 1;
            } else {
                metrics.failed += 1;
            }
            metrics.total_duration_secs += result.duration_seconds.unwrap_or_default();
            metrics.total_wait_secs +=
                (started_at - queued.enqueue_time).num_milliseconds().max(0) as f64 / 1000.0;
        }
        guard(&self.active).remove(&execution_id);

        info!(
            "job {} terminó en la cola {} con estado {}",
            execution_id,
            self.timezone,
            result.status.as_str()
        );
        if let Some(tx) = queued.notify.take() {
            let _ = tx.send(result);
        }
    }

    async fn monitor_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = sleep(self.config.monitor_interval) => {}
                _ = shutdown.changed() => break,
            }

            let status = self.status();
            debug!(
                "cola {}: {} pendientes, {} activos, {} procesados",
                self.timezone, status.queue_size, status.active_jobs, status.processed
            );

            let now = Utc::now();
            for job in self.active_jobs() {
                let running = (now - job.started_at).num_seconds().max(0) as u64;
                if running > job.timeout_seconds {
                    warn!(
                        "job {} lleva {}s corriendo en {} (timeout {}s)",
                        job.execution_id, running, self.timezone, job.timeout_seconds
                    );
                }
            }
        }
    }

    pub fn queue_size(&self) -> usize {
        guard(&self.pending).len()
    }

    pub fn active_count(&self) -> usize {
        guard(&self.active).len()
    }

    pub fn is_active(&self, execution_id: &str) -> bool {
        guard(&self.active).contains_key(execution_id)
    }

    pub fn active_jobs(&self) -> Vec<ActiveJob> {
        let mut jobs: Vec<ActiveJob> = guard(&self.active).values().cloned().collect();
        jobs.sort_by_key(|j| j.started_at);
        jobs
    }

    /// Pendientes en el orden en que saldrían.
    pub fn queued_jobs(&self) -> Vec<QueuedJobView> {
        let now = Utc::now();
        let pending = guard(&self.pending);
        let mut jobs: Vec<(ReadyKey, QueuedJobView)> = pending
            .entries
            .values()
            .map(|q| {
                let key = ReadyKey {
                    priority: q.priority,
                    scheduled: q.scheduled_time,
                    seq: q.seq,
                };
                let view = QueuedJobView {
                    execution_id: q.execution_id.clone(),
                    job_id: q.job.job_id.clone(),
                    job_name: q.job.job_name.clone(),
                    priority: q.priority,
                    scheduled_time: q.scheduled_time,
                    enqueue_time: q.enqueue_time,
                    wait_seconds: (now - q.enqueue_time).num_milliseconds().max(0) as f64
                        / 1000.0,
                    ready: q.is_ready_at(now),
                };
                (key, view)
            })
            .collect();
        jobs.sort_by(|a, b| b.0.cmp(&a.0));
        jobs.into_iter().map(|(_, view)| view).collect()
    }

    pub fn status(&self) -> QueueStatus {
        let queue_size = self.queue_size();
        let active_jobs = self.active_count();
        let metrics = guard(&self.metrics);

        let processed = metrics.processed as f64;
        let success_rate = if metrics.processed > 0 {
            metrics.successful as f64 / processed * 100.0
        } else {
            0.0
        };
        let (average_duration_seconds, average_wait_seconds) = if metrics.processed > 0 {
            (
                metrics.total_duration_secs / processed,
                metrics.total_wait_secs / processed,
            )
        } else {
            (0.0, 0.0)
        };
        let uptime_seconds = metrics
            .started_at
            .map(|t| (Utc::now() - t).num_seconds().max(0))
            .unwrap_or(0);
        let jobs_per_hour = if uptime_seconds > 0 {
            processed * 3600.0 / uptime_seconds as f64
        } else {
            0.0
        };

        QueueStatus {
            timezone: self.timezone.clone(),
            state: self.state(),
            queue_size,
            active_jobs,
            worker_count: self.config.worker_count,
            max_concurrent_jobs: self.config.max_concurrent_jobs,
            processed: metrics.processed,
            successful: metrics.successful,
            failed: metrics.failed,
            success_rate,
            average_duration_seconds,
            average_wait_seconds,
            uptime_seconds,
            jobs_per_hour,
        }
    }
}
