use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{CpuExt, DiskExt, System, SystemExt};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use common::{
    run_job, AgentHeartbeatRequest, AssignmentStatus, ExecutionContext, JobCompleteRequest,
    JobDefinition, JobExecutionResult, JobObserver, JobStatus, JobStatusUpdate, ResourceUsage,
    StepConfiguration, StepRegistry, StepResult, SystemInfo,
};

use crate::client::SchedulerClient;

/// Estado compartido del agente: cliente, tipos de paso y cupos locales.
///
/// Los cupos son un semáforo de `max_parallel_jobs` permisos; cada job
/// en curso (pull o push) retiene uno hasta terminar.
pub struct AgentRuntime {
    client: Arc<SchedulerClient>,
    steps: Arc<StepRegistry>,
    slots: Arc<Semaphore>,
    max_parallel: u32,
}

impl AgentRuntime {
    pub fn new(client: Arc<SchedulerClient>, steps: Arc<StepRegistry>, max_parallel: u32) -> Arc<Self> {
        let max_parallel = max_parallel.max(1);
        Arc::new(Self {
            client,
            steps,
            slots: Arc::new(Semaphore::new(max_parallel as usize)),
            max_parallel,
        })
    }

    pub fn free_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn current_jobs(&self) -> u32 {
        self.max_parallel
            .saturating_sub(self.slots.available_permits() as u32)
    }

    pub fn try_reserve(&self) -> Option<OwnedSemaphorePermit> {
        self.slots.clone().try_acquire_owned().ok()
    }

    /// Corre el job en una tarea propia. El permiso se libera al terminar.
    pub fn spawn_job(
        self: &Arc<Self>,
        execution_id: String,
        job: JobDefinition,
        permit: OwnedSemaphorePermit,
    ) -> JoinHandle<JobStatus> {
        let runtime = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            runtime.execute(execution_id, job).await
        })
    }

    async fn execute(self: &Arc<Self>, execution_id: String, job: JobDefinition) -> JobStatus {
        info!("ejecutando {} (job '{}')", execution_id, job.job_id);
        let started = JobStatusUpdate {
            status: AssignmentStatus::Running,
            message: Some(format!("ejecución iniciada en {}", self.client.agent_id())),
            step: None,
        };
        if let Err(e) = self.client.report_status(&execution_id, &started).await {
            warn!("no se pudo reportar inicio de {}: {:#}", execution_id, e);
        }

        // el job corre en su propia tarea para que un panic no se lleve el reporte final
        let runner = {
            let observer = ReportingObserver {
                client: self.client.clone(),
                execution_id: execution_id.clone(),
            };
            let steps = self.steps.clone();
            let job = job.clone();
            let id = execution_id.clone();
            tokio::spawn(async move { run_job(&job, &id, &steps, &observer).await })
        };

        let result = match runner.await {
            Ok(r) => r,
            Err(e) => {
                let mut r = JobExecutionResult::new(&execution_id, &job, JobStatus::Running);
                r.complete(JobStatus::Failed, Some(format!("panic ejecutando el job: {}", e)));
                r
            }
        };

        let status = result.status;
        let req = JobCompleteRequest {
            status,
            error_message: result.error_message.clone(),
            result: Some(result),
        };
        match self.client.complete(&execution_id, &req).await {
            Ok(()) => info!("{} terminó con estado {}", execution_id, status.as_str()),
            Err(e) => warn!("no se pudo reportar el fin de {}: {:#}", execution_id, e),
        }
        status
    }
}

/// Reporta el progreso por paso al scheduler.
struct ReportingObserver {
    client: Arc<SchedulerClient>,
    execution_id: String,
}

impl ReportingObserver {
    async fn send(&self, update: JobStatusUpdate) {
        if let Err(e) = self.client.report_status(&self.execution_id, &update).await {
            warn!("no se pudo reportar progreso de {}: {:#}", self.execution_id, e);
        }
    }
}

#[async_trait]
impl JobObserver for ReportingObserver {
    async fn step_started(&self, _ctx: &ExecutionContext, step: &StepConfiguration, index: usize) {
        self.send(JobStatusUpdate {
            status: AssignmentStatus::Running,
            message: Some(format!("paso {} '{}' iniciado", index + 1, step.step_id)),
            step: None,
        })
        .await;
    }

    async fn step_finished(&self, _ctx: &ExecutionContext, result: &StepResult) {
        self.send(JobStatusUpdate {
            status: AssignmentStatus::Running,
            message: Some(format!(
                "paso '{}' terminó con {:?}",
                result.step_id, result.status
            )),
            step: Some(result.clone()),
        })
        .await;
    }
}

/* --------- Loops de fondo --------- */

/// Heartbeat periódico con uso de CPU, memoria y disco.
pub async fn run_heartbeat_loop(
    runtime: Arc<AgentRuntime>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sys = System::new_all();
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let req = AgentHeartbeatRequest {
            status: "online".into(),
            current_jobs: runtime.current_jobs(),
            resources: sample_resources(&mut sys),
        };
        match runtime.client.heartbeat(&req).await {
            Ok(resp) if !resp.is_approved => debug!("agente pendiente de aprobación"),
            Ok(_) => {}
            Err(e) => warn!("heartbeat falló: {:#}", e),
        }
    }
    debug!("heartbeat detenido");
}

/// Pide jobs mientras haya cupos libres.
pub async fn run_poll_loop(
    runtime: Arc<AgentRuntime>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        poll_once(&runtime).await;
    }
    debug!("poll detenido");
}

/// Un ciclo de pull. Devuelve cuántos jobs arrancó.
pub async fn poll_once(runtime: &Arc<AgentRuntime>) -> usize {
    let free = runtime.free_slots();
    if free == 0 {
        debug!("sin cupos libres, no se piden jobs");
        return 0;
    }

    let resp = match runtime.client.poll(free).await {
        Ok(r) => r,
        Err(e) => {
            warn!("poll falló: {:#}", e);
            return 0;
        }
    };

    let mut started = 0;
    for assigned in resp.jobs {
        // un push pudo ocupar el cupo entre el poll y ahora
        let permit = match runtime.try_reserve() {
            Some(p) => p,
            None => match runtime.slots.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            },
        };
        runtime.spawn_job(assigned.execution_id, assigned.job, permit);
        started += 1;
    }
    started
}

fn percent(used: u64, total: u64) -> f32 {
    if total == 0 {
        0.0
    } else {
        (used as f64 / total as f64 * 100.0) as f32
    }
}

fn sample_resources(sys: &mut System) -> ResourceUsage {
    sys.refresh_cpu();
    sys.refresh_memory();
    sys.refresh_disks();

    let (disk_total, disk_free) = sys
        .disks()
        .iter()
        .fold((0u64, 0u64), |(t, f), d| (t + d.total_space(), f + d.available_space()));

    ResourceUsage {
        cpu_percent: sys.global_cpu_info().cpu_usage(),
        memory_percent: percent(sys.used_memory(), sys.total_memory()),
        disk_percent: percent(disk_total.saturating_sub(disk_free), disk_total),
    }
}

const GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Datos fijos de la máquina que se envían al registrarse.
pub fn system_info() -> SystemInfo {
    let sys = System::new_all();
    let disk_total: u64 = sys.disks().iter().map(|d| d.total_space()).sum();

    SystemInfo {
        os: sys.long_os_version().or_else(|| sys.name()),
        cpu_cores: Some(sys.cpus().len() as u32),
        memory_gb: Some(sys.total_memory() as f64 / GB),
        disk_gb: Some(disk_total as f64 / GB),
    }
}
