// scheduler/src/state.rs

use std::sync::Arc;

use crate::auth::TokenStore;
use crate::dispatch::Dispatcher;
use crate::engine::ExecutionEngine;
use crate::history::ExecutionHistory;
use crate::recurring::RecurringScheduler;
use crate::registry::AgentRegistry;

/// Estado compartido por los handlers y los loops de fondo.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ExecutionEngine>,
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<dyn AgentRegistry>,
    pub history: Arc<dyn ExecutionHistory>,
    pub tokens: Arc<TokenStore>,
    pub schedules: Arc<RecurringScheduler>,
}
