use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::context::ExecutionContext;
use crate::error::{StepError, StepValidationError};
use crate::job::StepConfiguration;
use crate::pool::BlockingPool;
use crate::step::{ConfigReader, Step};

const DANGEROUS_SQL: [&str; 5] = [
    "xp_cmdshell",
    "sp_oacreate",
    "sp_oamethod",
    "openrowset",
    "opendatasource",
];

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub connection_name: String,
    pub query: String,
    pub parameters: Map<String, Value>,
    pub max_rows: Option<u64>,
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutcome {
    pub rows_affected: u64,
    pub rows: Vec<Map<String, Value>>,
}

/// Ejecutor externo de consultas. Es bloqueante; el paso lo lanza en el pool.
pub trait QueryExecutor: Send + Sync {
    fn execute(&self, request: &QueryRequest) -> Result<QueryOutcome, String>;
}

pub struct SqlStep {
    cfg: StepConfiguration,
    request: QueryRequest,
    executor: Option<Arc<dyn QueryExecutor>>,
    pool: BlockingPool,
}

impl SqlStep {
    pub fn new(
        cfg: &StepConfiguration,
        executor: Option<Arc<dyn QueryExecutor>>,
        pool: BlockingPool,
    ) -> Result<Self, StepValidationError> {
        let mut r = ConfigReader::new(&cfg.config);

        let query = r.required_str("query");
        let lowered = query.to_lowercase();
        for pattern in DANGEROUS_SQL {
            if lowered.contains(pattern) {
                r.error(format!("patrón SQL potencialmente peligroso: {}", pattern));
            }
        }

        let connection_name = match r.optional_str("connection_name") {
            Some(name) if name.trim().is_empty() => {
                r.error("'connection_name' no puede estar vacío");
                name
            }
            Some(name) => name,
            None => "default".to_string(),
        };

        let max_rows = r.optional_u64("max_rows");
        if max_rows == Some(0) {
            r.error("'max_rows' debe ser positivo");
        }
        let parameters = r.optional_map("parameters");

        let request = QueryRequest {
            connection_name,
            query,
            parameters,
            max_rows,
            timeout: cfg.timeout,
        };

        Ok(Self {
            request: r.finish(&cfg.step_id, request)?,
            cfg: cfg.clone(),
            executor,
            pool,
        })
    }
}

#[async_trait]
impl Step for SqlStep {
    fn config(&self) -> &StepConfiguration {
        &self.cfg
    }

    async fn execute_impl(&self, ctx: &mut ExecutionContext) -> Result<String, StepError> {
        let executor = self.executor.clone().ok_or_else(|| {
            StepError::Configuration("no hay ejecutor SQL configurado".to_string())
        })?;

        let request = self.request.clone();
        let mut outcome = self
            .pool
            .run(move || executor.execute(&request))
            .await?
            .map_err(StepError::Execution)?;

        if let Some(max) = self.request.max_rows {
            outcome.rows.truncate(max as usize);
        }

        let step_id = &self.cfg.step_id;
        ctx.set_step_variable(step_id, "rows_affected", outcome.rows_affected);
        ctx.set_step_variable(step_id, "rows_returned", outcome.rows.len() as u64);

        if outcome.rows.is_empty() {
            Ok(format!("{} filas afectadas", outcome.rows_affected))
        } else {
            serde_json::to_string(&outcome.rows).map_err(|e| {
                StepError::Execution(format!("no se pudo serializar el resultado: {}", e))
            })
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Ejecutor en memoria que devuelve siempre el mismo resultado.
    pub struct FakeExecutor {
        pub outcome: Result<QueryOutcome, String>,
        pub seen: Mutex<Vec<QueryRequest>>,
    }

    impl QueryExecutor for FakeExecutor {
        fn execute(&self, request: &QueryRequest) -> Result<QueryOutcome, String> {
            self.seen.lock().unwrap().push(request.clone());
            self.outcome.clone()
        }
    }

    fn cfg(config: Value) -> StepConfiguration {
        StepConfiguration::new("consulta", "sql", config.as_object().cloned().unwrap())
    }

    #[test]
    fn falta_query_es_error_de_validacion() {
        let err = SqlStep::new(&cfg(json!({"connection_name": "main"})), None, BlockingPool::new(1))
            .err()
            .unwrap();
        assert_eq!(err.errors, vec!["falta la clave requerida 'query'".to_string()]);
    }

    #[test]
    fn rechaza_patrones_peligrosos_y_max_rows_cero() {
        let err = SqlStep::new(
            &cfg(json!({"query": "EXEC XP_CMDSHELL 'dir'", "max_rows": 0})),
            None,
            BlockingPool::new(1),
        )
        .err()
        .unwrap();
        assert_eq!(err.errors.len(), 2);
    }

    #[tokio::test]
    async fn sin_ejecutor_falla_por_configuracion() {
        let Ok(step) = SqlStep::new(&cfg(json!({"query": "select 1"})), None, BlockingPool::new(1))
        else {
            panic!("config válida");
        };
        let err = step
            .execute_impl(&mut ExecutionContext::new("j", "e", "UTC"))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn guarda_filas_en_el_contexto() {
        let rows = vec![
            json!({"id": 1}).as_object().cloned().unwrap(),
            json!({"id": 2}).as_object().cloned().unwrap(),
            json!({"id": 3}).as_object().cloned().unwrap(),
        ];
        let executor = Arc::new(FakeExecutor {
            outcome: Ok(QueryOutcome {
                rows_affected: 0,
                rows,
            }),
            seen: Mutex::new(Vec::new()),
        });
        let Ok(step) = SqlStep::new(
            &cfg(json!({"query": "select id from t", "max_rows": 2})),
            Some(executor.clone() as Arc<dyn QueryExecutor>),
            BlockingPool::new(1),
        ) else {
            panic!("config válida");
        };
        let mut ctx = ExecutionContext::new("j", "e", "UTC");

        let out = step.execute_impl(&mut ctx).await.unwrap();

        assert_eq!(out, r#"[{"id":1},{"id":2}]"#);
        assert_eq!(ctx.get_variable("rows_returned"), Some(&json!(2)));
        assert_eq!(ctx.get_variable("consulta_rows_affected"), Some(&json!(0)));
        assert_eq!(executor.seen.lock().unwrap()[0].connection_name, "default");
    }
}
