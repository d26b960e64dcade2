mod client;
mod config;
mod push;
#[cfg(test)]
mod testing;
mod worker;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use common::{BlockingPool, StepRegistry, StepServices};

use crate::client::SchedulerClient;
use crate::config::AgentArgs;
use crate::worker::AgentRuntime;

const REGISTER_RETRY: Duration = Duration::from_secs(5);
const DRAIN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("agent=debug,common=info,reqwest=info")),
        )
        .init();

    let args = AgentArgs::parse();

    let services = StepServices {
        pool: BlockingPool::new(args.blocking_threads),
        ..StepServices::default()
    };
    let steps = Arc::new(StepRegistry::with_builtin_steps(services));

    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let registration = args.register_request(&hostname, steps.kinds(), worker::system_info());
    let client = Arc::new(SchedulerClient::new(&args.scheduler_url, registration)?);

    // 1) Registro, reintentando mientras el scheduler no responda
    loop {
        match client.register().await {
            Ok(resp) if !resp.is_approved => {
                warn!("agente {} registrado pero sin aprobar", resp.agent_id);
                break;
            }
            Ok(_) => break,
            Err(e) => {
                warn!("registro falló ({:#}), reintento en {:?}", e, REGISTER_RETRY);
                tokio::select! {
                    _ = sleep(REGISTER_RETRY) => {}
                    _ = tokio::signal::ctrl_c() => return Ok(()),
                }
            }
        }
    }

    let runtime = AgentRuntime::new(client.clone(), steps, args.max_parallel_jobs);
    info!(
        "agente {} contra {} (max_parallel_jobs={})",
        client.agent_id(),
        args.scheduler_url,
        args.max_parallel_jobs
    );

    // 2) Loops de fondo
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = vec![
        tokio::spawn(worker::run_heartbeat_loop(
            runtime.clone(),
            args.heartbeat_interval(),
            shutdown_rx.clone(),
        )),
        tokio::spawn(worker::run_poll_loop(
            runtime.clone(),
            args.poll_interval(),
            shutdown_rx.clone(),
        )),
    ];

    if let Some(listen) = args.listen.clone() {
        let runtime = runtime.clone();
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = push::serve_push(runtime, listen, rx).await {
                warn!("listener push terminó con error: {:#}", e);
            }
        }));
    }

    tokio::signal::ctrl_c().await?;
    info!("apagando agente");
    shutdown_tx.send_replace(true);
    for t in tasks {
        if let Err(e) = t.await {
            warn!("tarea de fondo terminó con error: {}", e);
        }
    }

    // 3) Deja terminar los jobs en curso
    let drained = tokio::time::timeout(DRAIN_GRACE, async {
        while runtime.current_jobs() > 0 {
            sleep(Duration::from_millis(200)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!("quedaron {} jobs en curso al salir", runtime.current_jobs());
    }
    Ok(())
}
