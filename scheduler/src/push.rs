//! Entrega push: el scheduler llama al listener HTTP del agente.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use common::PushAssignRequest;

use crate::error::DispatchError;

#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Entrega una asignación en `endpoint`. Cualquier fallo de red o
    /// respuesta no 2xx es `DispatchError::Transport`.
    async fn push(&self, endpoint: &str, req: &PushAssignRequest) -> Result<(), DispatchError>;
}

pub struct HttpPushTransport {
    client: Client,
}

impl HttpPushTransport {
    pub fn new(timeout: Duration) -> Result<Self, DispatchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Transport {
                endpoint: "-".into(),
                reason: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AgentTransport for HttpPushTransport {
    async fn push(&self, endpoint: &str, req: &PushAssignRequest) -> Result<(), DispatchError> {
        let url = format!("{}/api/job/assign", endpoint.trim_end_matches('/'));
        debug!("push de {} a {}", req.execution_id, url);

        let resp = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|e| DispatchError::Transport {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(DispatchError::Transport {
                endpoint: endpoint.to_string(),
                reason: format!("respuesta {}", resp.status()),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Transporte en memoria: anota cada push y acepta o rechaza según `accept`.
    pub struct FakeTransport {
        pub accept: bool,
        pub pushed: Mutex<Vec<(String, String)>>,
    }

    impl FakeTransport {
        pub fn new(accept: bool) -> Self {
            Self {
                accept,
                pushed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AgentTransport for FakeTransport {
        async fn push(&self, endpoint: &str, req: &PushAssignRequest) -> Result<(), DispatchError> {
            self.pushed
                .lock()
                .unwrap()
                .push((endpoint.to_string(), req.execution_id.clone()));
            if self.accept {
                Ok(())
            } else {
                Err(DispatchError::Transport {
                    endpoint: endpoint.to_string(),
                    reason: "respuesta 503 Service Unavailable".into(),
                })
            }
        }
    }

    #[tokio::test]
    async fn endpoint_inalcanzable_es_error_de_transporte() {
        let transport = HttpPushTransport::new(Duration::from_millis(500)).unwrap();
        let job = common::JobDefinition::new("j", "j", vec![]);
        let req = PushAssignRequest {
            execution_id: "e1".into(),
            job_id: "j".into(),
            job_name: "j".into(),
            job_yaml: String::new(),
            job,
        };

        let err = transport.push("http://127.0.0.1:1", &req).await.unwrap_err();
        assert!(matches!(err, DispatchError::Transport { .. }));
    }
}
