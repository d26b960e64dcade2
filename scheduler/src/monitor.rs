use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::dispatch::Dispatcher;

/// Loop del sweep de despacho: reintenta asignar las ejecuciones remotas
/// que siguen en cola. Es la única salida del estado `queued`.
pub async fn run_dispatch_loop(
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("sweep de despacho cada {:?}", interval);
    loop {
        tokio::select! {
            _ = sleep(interval) => {}
            _ = shutdown.changed() => break,
        }

        let assigned = dispatcher.sweep().await;
        debug!("sweep de despacho: {} asignadas", assigned);
    }
    debug!("sweep de despacho detenido");
}
