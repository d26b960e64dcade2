use clap::Parser;
use std::net::UdpSocket;
use std::time::Duration;

use common::{AgentRegisterRequest, SystemInfo};

#[derive(Parser, Debug, Clone)]
#[command(name = "agent", about = "Agente remoto que ejecuta jobs del scheduler")]
pub struct AgentArgs {
    /// URL base del scheduler
    #[arg(long, env = "SCHEDULER_URL", default_value = "http://localhost:8080")]
    pub scheduler_url: String,

    /// Id estable del agente (por defecto `agent-<hostname>`)
    #[arg(long, env = "AGENT_ID")]
    pub agent_id: Option<String>,

    #[arg(long, env = "AGENT_NAME")]
    pub name: Option<String>,

    #[arg(long, env = "AGENT_POOL", default_value = "default")]
    pub pool: String,

    /// Capacidades anunciadas; vacío = todos los tipos de paso soportados
    #[arg(long, env = "AGENT_CAPABILITIES", value_delimiter = ',')]
    pub capabilities: Vec<String>,

    #[arg(long, env = "AGENT_MAX_PARALLEL_JOBS", default_value_t = 2)]
    pub max_parallel_jobs: u32,

    #[arg(long, default_value_t = 30)]
    pub heartbeat_interval_secs: u64,

    #[arg(long, env = "AGENT_POLL_INTERVAL_SECS", default_value_t = 10)]
    pub poll_interval_secs: u64,

    /// Dirección del listener push; sin ella el agente sólo hace pull
    #[arg(long, env = "AGENT_LISTEN")]
    pub listen: Option<String>,

    /// URL que el scheduler usa para llegar al listener push
    #[arg(long, env = "AGENT_ADVERTISE_URL")]
    pub advertise_url: Option<String>,

    #[arg(long, env = "AGENT_IP")]
    pub ip_address: Option<String>,

    #[arg(long, env = "AGENT_BLOCKING_THREADS", default_value_t = 8)]
    pub blocking_threads: usize,
}

impl AgentArgs {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    /// Endpoint push anunciado al registrarse, si hay listener.
    pub fn endpoint(&self) -> Option<String> {
        let listen = self.listen.as_ref()?;
        Some(
            self.advertise_url
                .clone()
                .unwrap_or_else(|| format!("http://{}", listen)),
        )
    }

    pub fn register_request(
        &self,
        hostname: &str,
        supported_kinds: Vec<String>,
        system_info: SystemInfo,
    ) -> AgentRegisterRequest {
        let agent_id = self
            .agent_id
            .clone()
            .unwrap_or_else(|| format!("agent-{}", hostname));
        let capabilities = if self.capabilities.is_empty() {
            supported_kinds
        } else {
            self.capabilities.clone()
        };

        AgentRegisterRequest {
            agent_name: self.name.clone().unwrap_or_else(|| agent_id.clone()),
            agent_id,
            hostname: hostname.to_string(),
            ip_address: self.ip_address.clone().unwrap_or_else(local_ip),
            endpoint: self.endpoint(),
            agent_pool: self.pool.clone(),
            capabilities,
            max_parallel_jobs: self.max_parallel_jobs.max(1),
            agent_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            system_info,
        }
    }
}

// IP de la interfaz de salida; connect sobre UDP no envía paquetes
fn local_ip() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("8.8.8.8:80")?;
            s.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}
