use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::StepError;

pub const DEFAULT_BLOCKING_THREADS: usize = 8;

/// Pool acotado para trabajo bloqueante (procesos, consultas).
///
/// El permiso viaja dentro del closure, así que el cupo se libera cuando el
/// trabajo termina de verdad, aunque quien esperaba ya se haya ido por timeout.
#[derive(Debug, Clone)]
pub struct BlockingPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl BlockingPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Cupo para trabajo asíncrono que igual debe contar contra el pool
    /// (procesos hijos). Se libera al soltar el permiso.
    pub async fn permit(&self) -> Result<OwnedSemaphorePermit, StepError> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StepError::Execution("pool bloqueante cerrado".into()))
    }

    pub async fn run<F, T>(&self, work: F) -> Result<T, StepError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StepError::Execution("pool bloqueante cerrado".into()))?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            work()
        })
        .await
        .map_err(|e| StepError::Execution(format!("panic o join error en tarea bloqueante: {}", e)))
    }
}

impl Default for BlockingPool {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCKING_THREADS)
    }
}
