use std::env;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::results::SubmitReceipt;
use common::worker::{ClusterStats, WorkerMetrics};
use common::{SchedulerEvent, TaskDeclaration, TaskReport};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;

/// - En Docker: COORDINATOR_URL=http://coordinator:8080
/// - Local: default http://localhost:8080
fn coordinator_base_url() -> String {
    env::var("COORDINATOR_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI para enviar tareas al coordinador y seguir su estado")]
struct Cli {
    /// URL base del coordinador (por defecto COORDINATOR_URL)
    #[arg(long, global = true)]
    url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Envía una declaración de tarea (JSON)
    Submit {
        #[arg(value_name = "DECLARACION")]
        file: PathBuf,
    },
    /// Consulta el estado de una tarea
    Status {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },
    /// Muestra el historial de eventos de una tarea
    Events {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },
    /// Lista los workers registrados
    Workers,
    /// Contadores globales del clúster
    Stats,
    /// Ejecuta la declaración en este proceso, sin coordinador
    RunLocal {
        #[arg(value_name = "DECLARACION")]
        file: PathBuf,
    },
}

fn read_declaration(path: &Path) -> Result<TaskDeclaration> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("no se pudo leer {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("declaración inválida en {}", path.display()))
}

/// Devuelve el cuerpo JSON o el mensaje de error del coordinador.
async fn parse<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }
    let body: serde_json::Value = resp.json().await.unwrap_or_default();
    let msg = body
        .get("error")
        .and_then(|e| e.as_str())
        .unwrap_or("sin detalle");
    bail!("el coordinador respondió {status}: {msg}")
}

fn print_report(report: &TaskReport) {
    println!("Tarea:");
    println!("  id          : {}", report.task_id);
    println!("  tipo        : {:?}", report.task_type);
    println!("  estado      : {:?}", report.status);
    println!("  verificación: {:?}", report.verification);

    let c = &report.counters;
    println!(
        "  jobs        : pending={}, assigned={}, acked={}, running={}, completed={}, failed={}, expired={}",
        c.pending, c.assigned, c.acked, c.running, c.completed, c.failed, c.expired
    );
    if c.duplicate_results > 0 || c.penalties > 0 {
        println!(
            "  duplicados={}, penalizaciones={}",
            c.duplicate_results, c.penalties
        );
    }

    for p in &report.privacy {
        let degradado = if p.degraded { " (degradada)" } else { "" };
        println!(
            "  privacidad  : {} pedida={} aplicada={}{}",
            p.scope,
            p.requested.as_str(),
            p.effective.as_str(),
            degradado
        );
    }

    println!("  enviada     : {}", report.submitted_at);
    if let Some(ref done) = report.finished_at {
        println!("  finalizada  : {}", done);
    }
    if let Some(ref result) = report.result {
        println!("  resultado   : {}", result);
    }
    if let Some(ref failure) = report.failure {
        match failure.job_id {
            Some(ref job) => println!("  fallo       : {} (job {})", failure.reason, job),
            None => println!("  fallo       : {}", failure.reason),
        }
    }
}

fn print_worker(w: &WorkerMetrics) {
    println!("Worker {}", w.worker_id);
    println!("  host           : {}", w.hostname);
    println!("  dead           : {}", w.dead);
    println!("  last_heartbeat : {} s ago", w.last_heartbeat_secs_ago);
    println!(
        "  concurrency    : max={}, activos={}",
        w.max_concurrency, w.active_jobs
    );
    println!(
        "  jobs           : started={}, ok={}, failed={}",
        w.jobs_started, w.jobs_succeeded, w.jobs_failed
    );
    println!(
        "  reputación     : {:.2} (penalizaciones={})",
        w.reputation, w.penalties
    );
    match w.avg_job_ms {
        Some(avg) => println!("  avg_job_ms     : {:.1}", avg),
        None => println!("  avg_job_ms     : (sin datos)"),
    }
    match w.last_cpu_percent {
        Some(cpu) => println!("  cpu_percent    : {:.1}%", cpu),
        None => println!("  cpu_percent    : (sin datos)"),
    }
    match w.last_mem_bytes {
        Some(mem) => println!("  mem_bytes      : {}", mem),
        None => println!("  mem_bytes      : (sin datos)"),
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = cli.url.unwrap_or_else(coordinator_base_url);

    match cli.command {
        Commands::Submit { file } => {
            let decl = read_declaration(&file)?;
            let url = format!("{}/api/v1/tasks", base_url);
            let receipt: SubmitReceipt = parse(client.post(&url).json(&decl).send().await?).await?;

            println!("Tarea aceptada:");
            println!("  id     : {}", receipt.task_id);
            println!("  estado : {:?}", receipt.status);
            println!("  jobs   : {}", receipt.jobs);
            for p in &receipt.privacy {
                if p.degraded {
                    println!(
                        "  aviso  : privacidad {} degradada a {}",
                        p.requested.as_str(),
                        p.effective.as_str()
                    );
                }
            }
        }

        Commands::Status { id } => {
            let url = format!("{}/api/v1/tasks/{id}", base_url);
            let report: TaskReport = parse(client.get(&url).send().await?).await?;
            print_report(&report);
        }

        Commands::Events { id } => {
            let url = format!("{}/api/v1/tasks/{id}/events", base_url);
            let events: Vec<SchedulerEvent> = parse(client.get(&url).send().await?).await?;
            if events.is_empty() {
                println!("Sin eventos para la tarea {id}.");
            }
            for ev in events {
                let from = ev.from.map(|s| format!("{s:?}")).unwrap_or_else(|| "-".into());
                let to = ev.to.map(|s| format!("{s:?}")).unwrap_or_else(|| "-".into());
                let worker = ev.worker_id.as_deref().unwrap_or("-");
                println!(
                    "{} {} {} -> {} worker={} intento={} {}",
                    ev.at, ev.job_id, from, to, worker, ev.attempt, ev.detail
                );
            }
        }

        Commands::Workers => {
            let url = format!("{}/api/v1/workers", base_url);
            let workers: Vec<WorkerMetrics> = parse(client.get(&url).send().await?).await?;
            if workers.is_empty() {
                println!("No hay workers registrados.");
            }
            for w in &workers {
                print_worker(w);
                println!();
            }
        }

        Commands::Stats => {
            let url = format!("{}/api/v1/stats", base_url);
            let stats: ClusterStats = parse(client.get(&url).send().await?).await?;
            println!("Clúster:");
            println!(
                "  tareas  : total={}, completadas={}, fallidas={}",
                stats.tasks_total, stats.tasks_completed, stats.tasks_failed
            );
            println!(
                "  jobs    : completed={}, failed={}, expired={}, duplicados={}",
                stats.jobs.completed, stats.jobs.failed, stats.jobs.expired, stats.jobs.duplicate_results
            );
            println!(
                "  workers : vivos={}, caídos={}",
                stats.workers_alive, stats.workers_dead
            );
        }

        Commands::RunLocal { file } => {
            let decl = read_declaration(&file)?;
            let value = common::direct::execute_declaration(decl)
                .context("la ejecución local falló")?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
    }

    Ok(())
}
