use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::error::{StepError, StepValidationError};
use crate::job::StepConfiguration;
use crate::step::{ConfigReader, Step};

const METHODS: [&str; 7] = ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

#[derive(Debug, Clone, PartialEq)]
pub struct HttpConfig {
    pub url: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub expected_status_codes: Vec<u16>,
}

impl HttpConfig {
    pub fn parse(cfg: &StepConfiguration) -> Result<Self, StepValidationError> {
        let mut r = ConfigReader::new(&cfg.config);

        let url = r.required_str("url");
        if !url.is_empty() && !(url.starts_with("http://") || url.starts_with("https://")) {
            r.error("'url' debe empezar con http:// o https://");
        }

        let method_name = r
            .optional_str("method")
            .unwrap_or_else(|| "GET".to_string())
            .to_uppercase();
        let method = if METHODS.contains(&method_name.as_str()) {
            Method::from_bytes(method_name.as_bytes()).unwrap_or(Method::GET)
        } else {
            r.error(format!("'method' debe ser uno de: {}", METHODS.join(", ")));
            Method::GET
        };

        let headers = r.optional_string_map("headers");
        let body = cfg.config.get("body").filter(|v| !v.is_null()).cloned();

        let mut expected_status_codes = Vec::new();
        for code in r
            .optional_int_list("expected_status_codes")
            .unwrap_or_else(|| vec![200])
        {
            if (100..=599).contains(&code) {
                expected_status_codes.push(code as u16);
            } else {
                r.error(format!("código HTTP inválido en 'expected_status_codes': {}", code));
            }
        }

        let parsed = HttpConfig {
            url,
            method,
            headers,
            body,
            expected_status_codes,
        };
        r.finish(&cfg.step_id, parsed)
    }
}

#[derive(Debug)]
pub struct HttpStep {
    cfg: StepConfiguration,
    http: HttpConfig,
    client: Client,
}

impl HttpStep {
    pub fn new(cfg: &StepConfiguration, client: Client) -> Result<Self, StepValidationError> {
        Ok(Self {
            http: HttpConfig::parse(cfg)?,
            cfg: cfg.clone(),
            client,
        })
    }
}

#[async_trait]
impl Step for HttpStep {
    fn config(&self) -> &StepConfiguration {
        &self.cfg
    }

    async fn execute_impl(&self, ctx: &mut ExecutionContext) -> Result<String, StepError> {
        let mut req = self
            .client
            .request(self.http.method.clone(), &self.http.url)
            .header("X-Execution-Id", &ctx.execution_id);
        for (name, value) in &self.http.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &self.http.body {
            req = req.json(body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| StepError::Execution(format!("error HTTP hacia {}: {}", self.http.url, e)))?;

        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| StepError::Execution(format!("error leyendo la respuesta: {}", e)))?;

        ctx.set_step_variable(&self.cfg.step_id, "status_code", status);

        if !self.http.expected_status_codes.contains(&status) {
            return Err(StepError::Execution(format!(
                "status {} no esperado (esperados: {:?})",
                status, self.http.expected_status_codes
            )));
        }

        ctx.set_step_variable(&self.cfg.step_id, "response_body", text.clone());
        Ok(text)
    }
}
