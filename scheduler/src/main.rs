mod auth;
mod config;
mod dispatch;
mod engine;
mod error;
mod failover;
mod handlers;
mod history;
mod monitor;
mod push;
mod queue;
mod recurring;
mod registry;
mod state;
#[cfg(test)]
mod testing;

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use common::{BlockingPool, StepRegistry, StepServices};

use crate::auth::TokenStore;
use crate::config::SchedulerArgs;
use crate::dispatch::Dispatcher;
use crate::engine::ExecutionEngine;
use crate::history::{ExecutionHistory, InMemoryHistory};
use crate::push::HttpPushTransport;
use crate::recurring::RecurringScheduler;
use crate::registry::{AgentRegistry, InMemoryAgentRegistry};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("scheduler=debug,common=info,tower_http=info,axum=info")
            }),
        )
        .init();

    let args = SchedulerArgs::parse();

    let services = StepServices {
        pool: BlockingPool::new(args.blocking_threads),
        ..StepServices::default()
    };
    let steps = Arc::new(StepRegistry::with_builtin_steps(services));
    let history: Arc<dyn ExecutionHistory> = Arc::new(InMemoryHistory::new());
    let registry: Arc<dyn AgentRegistry> = Arc::new(InMemoryAgentRegistry::new());

    let engine = ExecutionEngine::new(args.engine_config(), steps, history.clone());
    engine.start();

    let transport = HttpPushTransport::new(args.push_timeout())
        .context("no se pudo crear el cliente HTTP de push")?;
    let dispatcher = Arc::new(Dispatcher::new(
        engine.clone(),
        registry.clone(),
        history.clone(),
        Arc::new(transport),
        args.dispatch_config(),
    ));

    let schedules = Arc::new(RecurringScheduler::new(dispatcher.clone()));

    let state = AppState {
        engine: engine.clone(),
        schedules: schedules.clone(),
        dispatcher: dispatcher.clone(),
        registry,
        history,
        tokens: Arc::new(TokenStore::new(args.token_ttl_secs)),
    };

    // loops de fondo: despacho de jobs en cola, expiración de asignaciones y disparos recurrentes
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatch_loop = tokio::spawn(monitor::run_dispatch_loop(
        dispatcher.clone(),
        args.sweep_interval(),
        shutdown_rx.clone(),
    ));
    let failover_loop = tokio::spawn(failover::run_failover_loop(
        dispatcher,
        args.sweep_interval(),
        shutdown_rx.clone(),
    ));
    let recurring_loop = tokio::spawn(recurring::run_recurring_loop(
        schedules,
        args.schedule_tick(),
        shutdown_rx,
    ));

    // router HTTP
    let app = handlers::build_router(state).layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("no se pudo escuchar en {}", args.listen))?;
    info!("scheduler escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("error en el servidor HTTP")?;

    info!("apagando scheduler");
    shutdown_tx.send_replace(true);
    join_loops(vec![
        ("despacho", dispatch_loop),
        ("failover", failover_loop),
        ("programación recurrente", recurring_loop),
    ])
    .await;
    engine.stop().await;
    Ok(())
}

/// Espera los loops de fondo. Devuelve cuántos terminaron con error.
async fn join_loops(loops: Vec<(&'static str, JoinHandle<()>)>) -> usize {
    let mut failed = 0;
    for (name, handle) in loops {
        if let Err(e) = handle.await {
            warn!("el loop de {} terminó con error: {}", name, e);
            failed += 1;
        }
    }
    failed
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("no se pudo escuchar ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}
