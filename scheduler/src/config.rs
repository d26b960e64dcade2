use clap::Parser;
use std::time::Duration;

use crate::dispatch::DispatchConfig;
use crate::engine::EngineConfig;
use crate::queue::QueueConfig;

#[derive(Parser, Debug, Clone)]
#[command(name = "scheduler", about = "Scheduler de jobs por zona horaria con agentes remotos")]
pub struct SchedulerArgs {
    /// Dirección de escucha HTTP
    #[arg(long, env = "SCHEDULER_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: String,

    /// Jobs concurrentes por cola
    #[arg(long, env = "SCHEDULER_MAX_CONCURRENT_JOBS", default_value_t = 5)]
    pub max_concurrent_jobs: usize,

    #[arg(long, env = "SCHEDULER_WORKERS_PER_QUEUE", default_value_t = 2)]
    pub workers_per_queue: usize,

    /// Colas creadas al arrancar
    #[arg(
        long,
        env = "SCHEDULER_DEFAULT_TIMEZONES",
        value_delimiter = ',',
        default_value = "UTC,America/New_York,Europe/London"
    )]
    pub default_timezones: Vec<String>,

    #[arg(long, default_value_t = 30)]
    pub health_interval_secs: u64,

    #[arg(long, default_value_t = 600)]
    pub metrics_interval_secs: u64,

    /// Intervalo del sweep de despacho y del failover
    #[arg(long, env = "SCHEDULER_SWEEP_INTERVAL_SECS", default_value_t = 15)]
    pub sweep_interval_secs: u64,

    /// Vida de los tokens de agente
    #[arg(long, env = "SCHEDULER_TOKEN_TTL_SECS", default_value_t = 14400)]
    pub token_ttl_secs: u64,

    /// Hilos para pasos bloqueantes (procesos, consultas)
    #[arg(long, env = "SCHEDULER_BLOCKING_THREADS", default_value_t = 8)]
    pub blocking_threads: usize,

    #[arg(long, default_value_t = 10)]
    pub push_timeout_secs: u64,

    /// Gracia para los jobs activos al apagar
    #[arg(long, default_value_t = 30)]
    pub stop_grace_secs: u64,

    /// Plazo de una asignación a agente antes de darla por vencida
    #[arg(long, default_value_t = 60)]
    pub assignment_timeout_minutes: u32,

    /// Cada cuánto se revisan los disparos recurrentes
    #[arg(long, default_value_t = 1)]
    pub schedule_tick_secs: u64,

    /// Horas que se conservan ejecuciones y asignaciones terminadas
    #[arg(long, env = "SCHEDULER_RETENTION_HOURS", default_value_t = 24)]
    pub retention_hours: u64,
}

impl SchedulerArgs {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            queue: QueueConfig {
                max_concurrent_jobs: self.max_concurrent_jobs.max(1),
                worker_count: self.workers_per_queue.max(1),
                ..QueueConfig::default()
            },
            default_timezones: self.default_timezones.clone(),
            health_interval: Duration::from_secs(self.health_interval_secs.max(1)),
            metrics_interval: Duration::from_secs(self.metrics_interval_secs.max(1)),
            stop_grace: Duration::from_secs(self.stop_grace_secs),
            ..EngineConfig::default()
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            assignment_timeout_minutes: self.assignment_timeout_minutes,
            retention_hours: self.retention_hours,
            ..DispatchConfig::default()
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn schedule_tick(&self) -> Duration {
        Duration::from_secs(self.schedule_tick_secs.max(1))
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_secs(self.push_timeout_secs.max(1))
    }
}
