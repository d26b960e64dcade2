use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::context::ExecutionContext;
use crate::error::{StepError, StepValidationError};
use crate::job::StepConfiguration;
use crate::pool::BlockingPool;
use crate::step::{ConfigReader, Step};

const EXECUTION_POLICIES: [&str; 5] = [
    "Restricted",
    "AllSigned",
    "RemoteSigned",
    "Unrestricted",
    "Bypass",
];

const DANGEROUS_POWERSHELL: [&str; 14] = [
    "Remove-Item",
    "rd",
    "rmdir",
    "del",
    "Format-Volume",
    "Remove-Computer",
    "Restart-Computer",
    "Stop-Computer",
    "Invoke-Expression",
    "iex",
    "Invoke-Command",
    "icm",
    "Start-Process",
    "saps",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpreter {
    Shell,
    PowerShell,
    Python,
}

impl Interpreter {
    pub fn kind(self) -> &'static str {
        match self {
            Interpreter::Shell => "shell",
            Interpreter::PowerShell => "powershell",
            Interpreter::Python => "python",
        }
    }

    fn program(self) -> &'static str {
        match self {
            Interpreter::Shell => "sh",
            Interpreter::PowerShell => "pwsh",
            Interpreter::Python => "python3",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptSource {
    Inline(String),
    File(String),
}

/// Configuración tipada de un paso de script.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptConfig {
    pub interpreter: Interpreter,
    pub source: ScriptSource,
    pub working_directory: Option<String>,
    pub env: Vec<(String, String)>,
    /// Sólo PowerShell: se pasan como `-Nombre valor`
    pub parameters: Vec<(String, String)>,
    pub execution_policy: String,
    pub expected_exit_codes: Vec<i64>,
}

impl ScriptConfig {
    pub fn parse(
        cfg: &StepConfiguration,
        interpreter: Interpreter,
    ) -> Result<Self, StepValidationError> {
        let mut r = ConfigReader::new(&cfg.config);

        let inline = match interpreter {
            Interpreter::Shell => {
                let command = r.optional_str("command");
                let script = r.optional_str("script");
                if command.is_some() && script.is_some() {
                    r.error("no se puede indicar 'command' y 'script' a la vez");
                }
                command.or(script)
            }
            _ => r.optional_str("script"),
        };
        let path = r.optional_str("script_path");

        let source = match (inline, path) {
            (Some(_), Some(_)) => {
                r.error("no se puede indicar el script en línea y 'script_path' a la vez");
                ScriptSource::Inline(String::new())
            }
            (Some(body), None) => {
                if body.trim().is_empty() {
                    r.error("el script no puede estar vacío");
                }
                ScriptSource::Inline(body)
            }
            (None, Some(path)) => {
                if !path.starts_with('/') && !path.starts_with("./") && !is_windows_absolute(&path)
                {
                    r.error("'script_path' debe ser absoluto o empezar con './'");
                }
                ScriptSource::File(path)
            }
            (None, None) => {
                let keys = if interpreter == Interpreter::Shell {
                    "'command', 'script' o 'script_path'"
                } else {
                    "'script' o 'script_path'"
                };
                r.error(format!("se requiere {}", keys));
                ScriptSource::Inline(String::new())
            }
        };

        let working_directory = r.optional_str("working_directory");
        let env = r.optional_string_map("env");

        let mut parameters = Vec::new();
        let mut execution_policy = String::from("RemoteSigned");
        if interpreter == Interpreter::PowerShell {
            parameters = r.optional_string_map("parameters");
            if let Some(policy) = r.optional_str("execution_policy") {
                if !EXECUTION_POLICIES.contains(&policy.as_str()) {
                    r.error(format!(
                        "execution_policy debe ser una de: {}",
                        EXECUTION_POLICIES.join(", ")
                    ));
                }
                execution_policy = policy;
            }
            if let ScriptSource::Inline(body) = &source {
                for cmd in dangerous_commands(body) {
                    r.error(format!("comando PowerShell potencialmente peligroso: {}", cmd));
                }
            }
        }

        let expected_exit_codes = r
            .optional_int_list("expected_exit_codes")
            .unwrap_or_else(|| vec![0]);
        if expected_exit_codes.is_empty() {
            r.error("'expected_exit_codes' no puede estar vacío");
        }

        let parsed = ScriptConfig {
            interpreter,
            source,
            working_directory,
            env,
            parameters,
            execution_policy,
            expected_exit_codes,
        };
        r.finish(&cfg.step_id, parsed)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(self.interpreter.program());

        match (self.interpreter, &self.source) {
            (Interpreter::Shell, ScriptSource::Inline(body)) => {
                cmd.arg("-c").arg(body);
            }
            (Interpreter::Python, ScriptSource::Inline(body)) => {
                cmd.arg("-c").arg(body);
            }
            (Interpreter::Shell | Interpreter::Python, ScriptSource::File(path)) => {
                cmd.arg(path);
            }
            (Interpreter::PowerShell, source) => {
                cmd.args([
                    "-NoProfile",
                    "-NonInteractive",
                    "-ExecutionPolicy",
                    self.execution_policy.as_str(),
                ]);
                match source {
                    ScriptSource::Inline(body) => {
                        cmd.arg("-Command").arg(body);
                    }
                    ScriptSource::File(path) => {
                        cmd.arg("-File").arg(path);
                        for (name, value) in &self.parameters {
                            cmd.arg(format!("-{}", name)).arg(value);
                        }
                    }
                }
            }
        }

        if let Some(dir) = &self.working_directory {
            cmd.current_dir(dir);
        }
        cmd
    }
}

fn is_windows_absolute(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() > 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Comandos peligrosos presentes como palabra completa en el script.
fn dangerous_commands(script: &str) -> Vec<&'static str> {
    let words: Vec<String> = script
        .split(|c: char| !(c.is_alphanumeric() || c == '-'))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect();

    DANGEROUS_POWERSHELL
        .iter()
        .copied()
        .filter(|cmd| words.iter().any(|w| w == &cmd.to_lowercase()))
        .collect()
}

struct ProcessOutput {
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

#[derive(Debug)]
pub struct ScriptStep {
    cfg: StepConfiguration,
    script: ScriptConfig,
    pool: BlockingPool,
}

impl ScriptStep {
    pub fn new(
        cfg: &StepConfiguration,
        interpreter: Interpreter,
        pool: BlockingPool,
    ) -> Result<Self, StepValidationError> {
        Ok(Self {
            script: ScriptConfig::parse(cfg, interpreter)?,
            cfg: cfg.clone(),
            pool,
        })
    }
}

#[async_trait]
impl Step for ScriptStep {
    fn config(&self) -> &StepConfiguration {
        &self.cfg
    }

    async fn execute_impl(&self, ctx: &mut ExecutionContext) -> Result<String, StepError> {
        let mut cmd = self.script.command();
        cmd.envs(ctx.environment());
        cmd.envs(self.script.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        debug!("lanzando {:?}", cmd);
        let program = self.script.interpreter.program();

        // si el intento se abandona por timeout, el hijo muere y el cupo vuelve al pool
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        let _permit = self.pool.permit().await?;
        let out = cmd
            .output()
            .await
            .map(|o| ProcessOutput {
                code: o.status.code(),
                stdout: String::from_utf8_lossy(&o.stdout).to_string(),
                stderr: String::from_utf8_lossy(&o.stderr).to_string(),
            })
            .map_err(|e| StepError::Execution(format!("no se pudo lanzar '{}': {}", program, e)))?;

        let code = out.code.map(i64::from).unwrap_or(-1);
        ctx.set_step_variable(&self.cfg.step_id, "exit_code", code);

        if !self.script.expected_exit_codes.contains(&code) {
            let mut msg = format!("el proceso terminó con código {}", code);
            if !out.stderr.trim().is_empty() {
                msg.push_str(": ");
                msg.push_str(out.stderr.trim());
            }
            return Err(StepError::Execution(msg));
        }

        ctx.set_step_variable(&self.cfg.step_id, "stdout", out.stdout.trim_end());

        let mut output = out.stdout;
        if !out.stderr.trim().is_empty() {
            output.push_str("\nSTDERR:\n");
            output.push_str(&out.stderr);
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn step_cfg(kind: &str, config: Value) -> StepConfiguration {
        StepConfiguration::new("s1", kind, config.as_object().cloned().unwrap())
    }

    #[test]
    fn shell_requiere_comando_o_script() {
        let cfg = step_cfg("shell", json!({"working_directory": "/tmp"}));
        let err = ScriptConfig::parse(&cfg, Interpreter::Shell).unwrap_err();
        assert!(err.errors[0].contains("'command'"));
    }

    #[test]
    fn powershell_rechaza_script_y_path_juntos() {
        let cfg = step_cfg(
            "powershell",
            json!({"script": "Get-Date", "script_path": "/opt/x.ps1"}),
        );
        assert!(ScriptConfig::parse(&cfg, Interpreter::PowerShell).is_err());
    }

    #[test]
    fn powershell_valida_politica_y_comandos_peligrosos() {
        let cfg = step_cfg(
            "powershell",
            json!({"script": "Remove-Item C:\\temp -Recurse; iex $x", "execution_policy": "Whatever"}),
        );
        let err = ScriptConfig::parse(&cfg, Interpreter::PowerShell).unwrap_err();

        assert!(err.errors.iter().any(|e| e.contains("execution_policy")));
        assert!(err.errors.iter().any(|e| e.contains("Remove-Item")));
        assert!(err.errors.iter().any(|e| e.ends_with(": iex")));
    }

    #[test]
    fn palabras_que_contienen_comandos_no_son_peligrosas() {
        assert!(dangerous_commands("Get-Content order.txt | Select-Object model").is_empty());
        assert_eq!(dangerous_commands("del archivo.txt"), vec!["del"]);
    }

    #[test]
    fn script_path_relativo_es_invalido() {
        let cfg = step_cfg("python", json!({"script_path": "scripts/run.py"}));
        assert!(ScriptConfig::parse(&cfg, Interpreter::Python).is_err());

        let cfg = step_cfg("python", json!({"script_path": "./scripts/run.py"}));
        assert!(ScriptConfig::parse(&cfg, Interpreter::Python).is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shell_exporta_stdout_y_variables_de_entorno() {
        let mut cfg = step_cfg("shell", json!({"command": "echo \"$JOB_ID-$GREETING\""}));
        cfg.config
            .insert("env".into(), json!({"GREETING": "hola"}));
        let step = ScriptStep::new(&cfg, Interpreter::Shell, BlockingPool::new(1)).unwrap();
        let mut ctx = ExecutionContext::new("job-7", "e", "UTC");

        let out = step.execute_impl(&mut ctx).await.unwrap();

        assert_eq!(out.trim(), "job-7-hola");
        assert_eq!(ctx.get_variable("stdout"), Some(&json!("job-7-hola")));
        assert_eq!(ctx.get_variable("s1_exit_code"), Some(&json!(0)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn codigo_de_salida_inesperado_es_error_de_ejecucion() {
        let cfg = step_cfg("shell", json!({"command": "echo malo >&2; exit 3"}));
        let step = ScriptStep::new(&cfg, Interpreter::Shell, BlockingPool::new(1)).unwrap();
        let mut ctx = ExecutionContext::new("j", "e", "UTC");

        let err = step.execute_impl(&mut ctx).await.unwrap_err();

        assert_eq!(
            err,
            StepError::Execution("el proceso terminó con código 3: malo".into())
        );
        assert_eq!(ctx.get_variable("exit_code"), Some(&json!(3)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_mata_el_proceso_y_libera_el_cupo() {
        let pool = BlockingPool::new(1);
        let mut cfg = step_cfg("shell", json!({"command": "exec sleep 3"}));
        cfg.timeout = Some(1);
        let step = ScriptStep::new(&cfg, Interpreter::Shell, pool.clone()).unwrap();
        let mut ctx = ExecutionContext::new("j", "e", "UTC");

        let result = crate::step::execute(&step, &mut ctx).await;
        assert_eq!(result.status, crate::results::StepStatus::Failed);
        assert_eq!(pool.available(), 1);

        let cfg = step_cfg("shell", json!({"command": "true"}));
        let next = ScriptStep::new(&cfg, Interpreter::Shell, pool.clone()).unwrap();
        let started = std::time::Instant::now();
        next.execute_impl(&mut ctx).await.unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn codigos_esperados_configurables() {
        let cfg = step_cfg("shell", json!({"command": "exit 2", "expected_exit_codes": [0, 2]}));
        let step = ScriptStep::new(&cfg, Interpreter::Shell, BlockingPool::new(1)).unwrap();

        assert!(step
            .execute_impl(&mut ExecutionContext::new("j", "e", "UTC"))
            .await
            .is_ok());
    }
}
