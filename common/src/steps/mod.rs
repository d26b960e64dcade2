//! Tipos de paso concretos. Son pegamento fino hacia procesos, bases de datos y HTTP.

pub mod http;
pub mod script;
pub mod sql;

pub use http::{HttpConfig, HttpStep};
pub use script::{Interpreter, ScriptConfig, ScriptSource, ScriptStep};
pub use sql::{QueryExecutor, QueryOutcome, QueryRequest, SqlStep};

use std::sync::Arc;

use crate::pool::BlockingPool;
use crate::step::{Step, StepRegistry};

/// Colaboradores externos que necesitan los pasos.
#[derive(Clone, Default)]
pub struct StepServices {
    pub pool: BlockingPool,
    pub query_executor: Option<Arc<dyn QueryExecutor>>,
    pub http: reqwest::Client,
}

impl StepRegistry {
    /// Registro con todos los tipos incluidos: shell, powershell, python, sql, http.
    pub fn with_builtin_steps(services: StepServices) -> Self {
        let mut registry = StepRegistry::new();
        register_builtin_steps(&mut registry, services);
        registry
    }
}

pub fn register_builtin_steps(registry: &mut StepRegistry, services: StepServices) {
    for interpreter in [Interpreter::Shell, Interpreter::PowerShell, Interpreter::Python] {
        let pool = services.pool.clone();
        registry.register(interpreter.kind(), move |cfg| {
            Ok(Box::new(ScriptStep::new(cfg, interpreter, pool.clone())?) as Box<dyn Step>)
        });
    }

    let pool = services.pool.clone();
    let executor = services.query_executor.clone();
    registry.register("sql", move |cfg| {
        Ok(Box::new(SqlStep::new(cfg, executor.clone(), pool.clone())?) as Box<dyn Step>)
    });

    let client = services.http.clone();
    registry.register("http", move |cfg| {
        Ok(Box::new(HttpStep::new(cfg, client.clone())?) as Box<dyn Step>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::StepConfiguration;
    use serde_json::Map;

    #[test]
    fn registra_todos_los_tipos() {
        let registry = StepRegistry::with_builtin_steps(StepServices::default());
        assert_eq!(
            registry.kinds(),
            vec!["http", "powershell", "python", "shell", "sql"]
        );
    }

    // Escenario B: paso sql sin 'query' no se puede construir
    #[test]
    fn sql_sin_query_falla_al_construir() {
        let registry = StepRegistry::with_builtin_steps(StepServices::default());
        let mut config = Map::new();
        config.insert("connection_name".into(), "main".into());
        let cfg = StepConfiguration::new("s1", "sql", config);

        let err = registry.create(&cfg).err().unwrap();
        assert!(err.errors.iter().any(|e| e.contains("'query'")));
    }
}
