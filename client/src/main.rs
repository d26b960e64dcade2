use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::{Client, Response};
use serde_json::Value;
use std::path::PathBuf;

use common::{
    AgentSummary, CancelResponse, ErrorBody, ExecutionView, JobExecutionResult, ScheduleView,
    SubmitResponse,
};

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI para operar el scheduler")]
struct Cli {
    /// URL base del scheduler
    #[arg(long, env = "SCHEDULER_URL", default_value = "http://localhost:8080")]
    scheduler_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Envía un documento de job (YAML o JSON)
    Submit {
        #[arg(value_name = "ARCHIVO")]
        file: PathBuf,
        #[arg(long)]
        priority: Option<i32>,
        /// Instante RFC 3339 en que debe correr
        #[arg(long, conflicts_with = "run_at_local")]
        scheduled_at: Option<String>,
        /// Hora de pared en la zona del job (YYYY-mm-ddTHH:MM:SS)
        #[arg(long)]
        run_at_local: Option<String>,
    },
    /// Ejecuta un job local ya y espera el resultado
    Run {
        #[arg(value_name = "ARCHIVO")]
        file: PathBuf,
        #[arg(long)]
        priority: Option<i32>,
    },
    /// Consulta una ejecución
    Status {
        #[arg(value_name = "EXECUTION_ID")]
        id: String,
    },
    /// Cancela una ejecución en cola
    Cancel {
        #[arg(value_name = "EXECUTION_ID")]
        id: String,
        #[arg(long)]
        timezone: Option<String>,
    },
    /// Estado de las colas (o el detalle de una zona)
    Queues {
        #[arg(value_name = "ZONA")]
        timezone: Option<String>,
    },
    /// Estado del motor
    Engine,
    /// Lista los agentes registrados
    Agents {
        #[arg(long)]
        pool: Option<String>,
    },
    /// Programaciones recurrentes
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
    Approve {
        #[arg(value_name = "AGENT_ID")]
        agent_id: String,
    },
    Deactivate {
        #[arg(value_name = "AGENT_ID")]
        agent_id: String,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// Programa un job cuyo documento trae el bloque `schedule`
    Add {
        #[arg(value_name = "ARCHIVO")]
        file: PathBuf,
        #[arg(long)]
        priority: Option<i32>,
    },
    /// Lista las programaciones (o sólo las próximas N)
    List {
        #[arg(long)]
        upcoming: Option<usize>,
    },
    Remove {
        #[arg(value_name = "JOB_ID")]
        job_id: String,
    },
    Pause {
        #[arg(value_name = "JOB_ID")]
        job_id: String,
    },
    Resume {
        #[arg(value_name = "JOB_ID")]
        job_id: String,
    },
}

/// Convierte una respuesta no exitosa en error con el mensaje del scheduler.
async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) if body.details.is_empty() => bail!("{}: {}", status, body.error),
        Ok(body) => bail!("{}: {} ({})", status, body.error, body.details.join("; ")),
        Err(_) => bail!("{}: {}", status, text),
    }
}

fn read_document(file: &PathBuf) -> Result<String> {
    std::fs::read_to_string(file).with_context(|| format!("no se pudo leer {}", file.display()))
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_result(result: &JobExecutionResult) {
    println!("Ejecución {}:", result.execution_id);
    println!("  job: {} ({})", result.job_name, result.job_id);
    println!("  estado: {}", result.status.as_str());
    if let Some(d) = result.duration_seconds {
        println!("  duración: {:.3}s", d);
    }
    for step in &result.step_results {
        println!("  - paso {}: {:?}", step.step_id, step.status);
        if let Some(err) = &step.error_message {
            println!("      error: {}", err);
        }
    }
    if let Some(err) = &result.error_message {
        println!("  error: {}", err);
    }
}

fn print_agent(a: &AgentSummary) {
    println!("Agente {} ({})", a.agent.agent_id, a.agent.agent_name);
    println!("  host      : {} / {}", a.agent.hostname, a.agent.ip_address);
    println!("  pool      : {}", a.agent.agent_pool);
    println!("  online    : {}", a.is_online);
    println!(
        "  aprobado  : {} / activo: {}",
        a.agent.is_approved, a.agent.is_active
    );
    println!(
        "  jobs      : {}/{}",
        a.agent.current_jobs, a.agent.max_parallel_jobs
    );
    if !a.agent.capabilities.is_empty() {
        println!("  capacidades: {}", a.agent.capabilities.join(", "));
    }
    if let Some(r) = a.agent.resources {
        println!(
            "  recursos  : cpu {:.1}% mem {:.1}% disco {:.1}%",
            r.cpu_percent, r.memory_percent, r.disk_percent
        );
    }
}

fn print_schedule(v: &ScheduleView) {
    let state = if v.paused { "en pausa" } else { "activa" };
    println!("Programación {} ({}) [{}]", v.job_id, v.job_name, state);
    println!("  disparador: {} / zona {}", v.trigger.kind(), v.timezone);
    match v.next_run_time {
        Some(t) => println!("  próxima   : {}", t),
        None => println!("  próxima   : -"),
    }
    if let Some(t) = v.last_run_time {
        println!("  última    : {} ({} disparos)", t, v.run_count);
    }
}

async fn schedule_command(client: &Client, base_url: &str, action: ScheduleAction) -> Result<()> {
    let url = format!("{}/api/v1/schedules", base_url);
    match action {
        ScheduleAction::Add { file, priority } => {
            let mut req = client.post(&url).body(read_document(&file)?);
            if let Some(p) = priority {
                req = req.query(&[("priority", p)]);
            }
            let view: ScheduleView = check(req.send().await?).await?.json().await?;
            print_schedule(&view);
        }
        ScheduleAction::List { upcoming } => {
            let mut req = client.get(&url);
            if let Some(n) = upcoming {
                req = req.query(&[("upcoming", n)]);
            }
            let views: Vec<ScheduleView> = check(req.send().await?).await?.json().await?;
            if views.is_empty() {
                println!("No hay programaciones.");
            }
            for v in &views {
                print_schedule(v);
            }
        }
        ScheduleAction::Remove { job_id } => {
            check(client.delete(format!("{}/{}", url, job_id)).send().await?).await?;
            println!("Programación de {} eliminada", job_id);
        }
        ScheduleAction::Pause { job_id } => {
            let resp = client.post(format!("{}/{}/pause", url, job_id)).send().await?;
            let view: ScheduleView = check(resp).await?.json().await?;
            print_schedule(&view);
        }
        ScheduleAction::Resume { job_id } => {
            let resp = client.post(format!("{}/{}/resume", url, job_id)).send().await?;
            let view: ScheduleView = check(resp).await?.json().await?;
            print_schedule(&view);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = cli.scheduler_url.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Submit {
            file,
            priority,
            scheduled_at,
            run_at_local,
        } => {
            let doc = read_document(&file)?;
            let mut query: Vec<(&str, String)> = Vec::new();
            if let Some(p) = priority {
                query.push(("priority", p.to_string()));
            }
            if let Some(at) = scheduled_at {
                query.push(("scheduled_at", at));
            }
            if let Some(at) = run_at_local {
                query.push(("run_at_local", at));
            }

            let resp = client
                .post(format!("{}/api/v1/jobs", base_url))
                .query(&query)
                .body(doc)
                .send()
                .await?;
            let submitted: SubmitResponse = check(resp).await?.json().await?;
            println!("Job enviado:");
            println!("  execution_id: {}", submitted.execution_id);
            println!("  estado: {}", submitted.status.as_str());
            println!("  destino: {:?}", submitted.target);
        }

        Commands::Run { file, priority } => {
            let doc = read_document(&file)?;
            let mut req = client.post(format!("{}/api/v1/jobs/run", base_url)).body(doc);
            if let Some(p) = priority {
                req = req.query(&[("priority", p)]);
            }
            let result: JobExecutionResult = check(req.send().await?).await?.json().await?;
            print_result(&result);
        }

        Commands::Status { id } => {
            let resp = client
                .get(format!("{}/api/v1/executions/{}", base_url, id))
                .send()
                .await?;
            let view: ExecutionView = check(resp).await?.json().await?;
            let r = &view.record;
            println!("Ejecución {}:", r.execution_id);
            println!("  job: {} ({})", r.job_name, r.job_id);
            println!("  zona: {}", r.timezone);
            println!("  estado: {}", r.status.as_str());
            println!("  enviado: {}", r.submitted_at);
            if let Some(t) = r.started_at {
                println!("  iniciado: {}", t);
            }
            if let Some(t) = r.finished_at {
                println!("  finalizado: {}", t);
            }
            if let Some(agent) = &r.agent_id {
                println!("  agente: {} (reintentos {}/{})", agent, r.retry_count, r.max_retries);
            }
            if let Some(a) = &view.assignment {
                println!("  asignación: {:?}", a.status);
            }
            if let Some(err) = &r.error_message {
                println!("  error: {}", err);
            }
            for line in &r.output_log {
                println!("  | {}", line);
            }
        }

        Commands::Cancel { id, timezone } => {
            let mut req = client.delete(format!("{}/api/v1/executions/{}", base_url, id));
            if let Some(tz) = timezone {
                req = req.query(&[("timezone", tz)]);
            }
            let resp: CancelResponse = check(req.send().await?).await?.json().await?;
            if resp.cancelled {
                println!("Ejecución {} cancelada", resp.execution_id);
            } else {
                println!("La ejecución {} ya no estaba en cola", resp.execution_id);
            }
        }

        Commands::Queues { timezone } => {
            let url = match timezone {
                Some(tz) => format!("{}/api/v1/queues/{}", base_url, tz),
                None => format!("{}/api/v1/queues", base_url),
            };
            let value: Value = check(client.get(url).send().await?).await?.json().await?;
            print_json(&value)?;
        }

        Commands::Engine => {
            let resp = client.get(format!("{}/api/v1/engine", base_url)).send().await?;
            let value: Value = check(resp).await?.json().await?;
            print_json(&value)?;
        }

        Commands::Agents { pool } => {
            let mut req = client.get(format!("{}/api/v1/agents", base_url));
            if let Some(pool) = pool {
                req = req.query(&[("pool", pool)]);
            }
            let agents: Vec<AgentSummary> = check(req.send().await?).await?.json().await?;
            if agents.is_empty() {
                println!("No hay agentes registrados.");
            }
            for a in &agents {
                print_agent(a);
                println!();
            }
        }

        Commands::Schedule { action } => schedule_command(&client, &base_url, action).await?,

        Commands::Approve { agent_id } => {
            let resp = client
                .post(format!("{}/api/v1/agent/{}/approve", base_url, agent_id))
                .send()
                .await?;
            let agent: AgentSummary = check(resp).await?.json().await?;
            println!("Agente {} aprobado", agent.agent.agent_id);
        }

        Commands::Deactivate { agent_id } => {
            let resp = client
                .post(format!("{}/api/v1/agent/{}/deactivate", base_url, agent_id))
                .send()
                .await?;
            let agent: AgentSummary = check(resp).await?.json().await?;
            println!("Agente {} desactivado", agent.agent.agent_id);
        }
    }

    Ok(())
}
