use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::DispatchError;

/// Loop de tolerancia a fallos:
/// - detecta asignaciones de agentes caídos o vencidas
/// - las cierra en `timeout` y reencola si quedan reintentos
/// - borra ejecuciones y asignaciones terminadas fuera de la retención
pub async fn run_failover_loop(
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = sleep(interval) => {}
            _ = shutdown.changed() => break,
        }

        if let Err(e) = sweep_once(&dispatcher) {
            warn!("error en failover sweep: {}", e);
        }
    }
    debug!("failover detenido");
}

/// Una pasada de chequeo. Devuelve cuántas asignaciones expiró.
/// Después limpia lo terminado fuera de la retención.
pub fn sweep_once(dispatcher: &Dispatcher) -> Result<usize, DispatchError> {
    let now = Utc::now();
    let expired = dispatcher.expire_assignments(now)?;
    if expired > 0 {
        info!("failover: {} asignaciones pasaron a timeout", expired);
    }
    match dispatcher.prune_finished(now) {
        Ok(0) => {}
        Ok(n) => debug!("retención: {} registros terminados eliminados", n),
        Err(e) => warn!("error limpiando terminados: {}", e),
    }
    Ok(expired)
}
