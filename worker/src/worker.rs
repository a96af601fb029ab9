use std::{env, sync::Arc, time::Duration, time::Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use sysinfo::{CpuExt, System, SystemExt};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use common::protocol::{AckStatus, FailReason, JobAck, JobAssign, JobFail};
use common::worker::{
    MailboxPollRequest, MailboxPollResponse, WorkerHeartbeatRequest, WorkerRegisterRequest,
    WorkerRegisterResponse,
};
use common::{JobResult, Message, MessageEnvelope, WorkerId};

use crate::sandbox::{SandboxChain, SandboxLimits, DEFAULT_CHAIN};

pub const DEFAULT_COORDINATOR_URL: &str = "http://localhost:8080";
const DEFAULT_WORKER_CONCURRENCY: u32 = 2;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const POLL_MAX: usize = 16;
const SEND_ATTEMPTS: u64 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub coordinator_url: String,
    pub concurrency: u32,
    /// Nombres de backend separados por coma, en orden de preferencia.
    pub sandbox_chain: String,
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            coordinator_url: DEFAULT_COORDINATOR_URL.to_string(),
            concurrency: DEFAULT_WORKER_CONCURRENCY,
            sandbox_chain: DEFAULT_CHAIN.to_string(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            coordinator_url: env::var("COORDINATOR_URL").unwrap_or(d.coordinator_url),
            concurrency: env::var("WORKER_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .filter(|c| *c > 0)
                .unwrap_or(d.concurrency),
            sandbox_chain: env::var("SANDBOX_CHAIN").unwrap_or(d.sandbox_chain),
            poll_interval: env::var("POLL_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(d.poll_interval),
        }
    }
}

/* =========================
   Ejecución de un JOB_ASSIGN
   ========================= */

/// Corre el job en la cadena de sandboxes y arma la respuesta: JOB_RESULT si el código
/// corrió (bien o mal), JOB_FAIL si no se pudo correr.
pub async fn execute_assignment(
    chain: &SandboxChain,
    assign: &JobAssign,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Message {
    let fail = |reason: FailReason, detail: String| {
        Message::Fail(JobFail {
            task_id: assign.task_id.clone(),
            job_id: assign.job_id.clone(),
            worker_id: worker_id.to_string(),
            reason,
            attempt: assign.attempt,
            detail: Some(detail),
        })
    };

    let limits = SandboxLimits::until(assign.deadline_ts, now);
    if limits.wall_time.is_zero() {
        return fail(FailReason::Timeout, format!("deadline {} ya vencido", assign.deadline_ts));
    }

    let started = Instant::now();
    let outcome = chain.run(&assign.code_ref, &assign.input_payload, &limits).await;
    let runtime_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok((output, kind)) => {
            info!(
                "job {} (attempt={}) terminado en {} ms con sandbox {}",
                assign.job_id,
                assign.attempt,
                runtime_ms,
                kind.as_str()
            );
            let mut result = JobResult::ok(
                &assign.task_id,
                &assign.job_id,
                worker_id,
                assign.attempt,
                output,
                runtime_ms,
            );
            result.sandbox = Some(kind);
            Message::Result(result)
        }
        Err(e) => match e.fail_reason() {
            Some(reason) => {
                warn!("job {} no se pudo ejecutar: {}", assign.job_id, e);
                fail(reason, e.to_string())
            }
            None => {
                warn!("job {} falló: {}", assign.job_id, e);
                Message::Result(JobResult::failed(
                    &assign.task_id,
                    &assign.job_id,
                    worker_id,
                    assign.attempt,
                    e.to_string(),
                    runtime_ms,
                ))
            }
        },
    }
}

/* =========================
   Salida hacia el coordinador
   ========================= */

#[derive(Clone)]
struct Outbox {
    client: Client,
    base_url: String,
    worker_id: WorkerId,
    coordinator_id: String,
}

impl Outbox {
    /// Entrega al menos una vez: reintenta errores de red y 5xx, no los 4xx.
    async fn send(&self, msg: Message) {
        let label = format!("{} {}", msg.msg_type().as_str(), msg.job_id());
        let envelope: MessageEnvelope = match msg.into_envelope(&self.worker_id, &self.coordinator_id) {
            Ok(env) => env,
            Err(e) => {
                warn!("no se pudo armar el sobre {}: {}", label, e);
                return;
            }
        };
        let url = format!("{}/api/v1/messages", self.base_url);
        for attempt in 1..=SEND_ATTEMPTS {
            match self.client.post(&url).json(&envelope).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!("{} entregado", label);
                    return;
                }
                Ok(resp) if resp.status().is_client_error() => {
                    warn!("el coordinador rechazó {}: status {}", label, resp.status());
                    return;
                }
                Ok(resp) => warn!("error {} enviando {} (intento {})", resp.status(), label, attempt),
                Err(e) => warn!("error HTTP enviando {} (intento {}): {:?}", label, attempt, e),
            }
            sleep(Duration::from_millis(200 * attempt)).await;
        }
        warn!("se descarta {} tras {} intentos; vencerá por timeout", label, SEND_ATTEMPTS);
    }

    async fn ack(&self, assign: &JobAssign, status: AckStatus, reason: Option<String>) {
        self.send(Message::Ack(JobAck {
            task_id: assign.task_id.clone(),
            job_id: assign.job_id.clone(),
            status,
            reason,
        }))
        .await;
    }
}

/* =========================
   Loop principal
   ========================= */

/// Loop principal del worker.
/// - Se registra en el coordinador.
/// - Hace heartbeats con CPU y memoria del host.
/// - Vacía su buzón y responde cada JOB_ASSIGN con un ack.
/// - Ejecuta los jobs aceptados en paralelo (hasta `concurrency`).
pub async fn run(config: WorkerConfig) -> Result<()> {
    let base_url = config.coordinator_url.trim_end_matches('/').to_string();
    let client = Client::new();

    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    let register_url = format!("{}/api/v1/workers/register", base_url);
    let res = client
        .post(&register_url)
        .json(&WorkerRegisterRequest {
            hostname,
            max_concurrency: config.concurrency,
        })
        .send()
        .await
        .with_context(|| format!("no se pudo registrar contra {base_url}"))?;
    let WorkerRegisterResponse {
        worker_id,
        coordinator_id,
    } = res.error_for_status()?.json().await?;

    let chain = Arc::new(SandboxChain::from_names(&config.sandbox_chain));
    info!(
        "worker {} registrado con concurrency={} contra {} (sandboxes: {:?})",
        worker_id,
        config.concurrency,
        base_url,
        chain.kinds()
    );

    let outbox = Outbox {
        client: client.clone(),
        base_url: base_url.clone(),
        worker_id: worker_id.clone(),
        coordinator_id,
    };
    let sem = Arc::new(Semaphore::new(config.concurrency as usize));

    // System para leer CPU y memoria
    let mut sys = System::new_all();

    loop {
        // --------- Heartbeat con CPU/MEM ---------
        sys.refresh_cpu();
        sys.refresh_memory();

        let hb_url = format!("{}/api/v1/workers/heartbeat", base_url);
        let hb = client
            .post(&hb_url)
            .json(&WorkerHeartbeatRequest {
                worker_id: worker_id.clone(),
                cpu_percent: Some(sys.global_cpu_info().cpu_usage()),
                mem_bytes: Some(sys.used_memory()),
            })
            .send()
            .await;
        match hb {
            Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {
                // el coordinador olvidó a este worker; hay que volver a registrarse con id nuevo
                bail!("el coordinador ya no conoce al worker {}", worker_id);
            }
            Ok(resp) if !resp.status().is_success() => {
                warn!("heartbeat rechazado: status {}", resp.status())
            }
            Err(e) => warn!("error HTTP en heartbeat: {:?}", e),
            Ok(_) => {}
        }

        // --------- Buzón ---------
        let poll_url = format!("{}/api/v1/messages/poll", base_url);
        let envelopes = match client
            .post(&poll_url)
            .json(&MailboxPollRequest {
                node_id: worker_id.clone(),
                max: POLL_MAX,
            })
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => match resp.json::<MailboxPollResponse>().await {
                Ok(poll) => poll.envelopes,
                Err(e) => {
                    warn!("respuesta de poll inválida: {:?}", e);
                    Vec::new()
                }
            },
            Ok(resp) => {
                warn!("poll rechazado: status {}", resp.status());
                Vec::new()
            }
            Err(e) => {
                warn!("error HTTP en poll: {:?}", e);
                Vec::new()
            }
        };

        if envelopes.is_empty() {
            sleep(config.poll_interval).await;
            continue;
        }

        for envelope in envelopes {
            let assign = match envelope.decode() {
                Ok(Message::Assign(a)) => a,
                Ok(other) => {
                    warn!("mensaje inesperado en el buzón: {}", other.msg_type().as_str());
                    continue;
                }
                Err(e) => {
                    warn!("sobre {} inválido: {}", envelope.msg_id, e);
                    continue;
                }
            };

            // --------- Control de concurrencia local ---------
            let permit = match sem.clone().try_acquire_owned() {
                Ok(p) => p,
                Err(_) => {
                    info!("sin slots libres para {}, respondiendo busy", assign.job_id);
                    outbox
                        .ack(&assign, AckStatus::Busy, Some("sin slots libres".into()))
                        .await;
                    continue;
                }
            };

            info!(
                "tengo job {} de la tarea {} (attempt={}, handler={}, sandbox={})",
                assign.job_id,
                assign.task_id,
                assign.attempt,
                assign.code_ref.handler,
                assign.sandbox_type.as_str()
            );
            outbox.ack(&assign, AckStatus::Accepted, None).await;

            let chain = chain.clone();
            let outbox = outbox.clone();
            tokio::spawn(async move {
                let reply = execute_assignment(&chain, &assign, &outbox.worker_id, Utc::now()).await;
                outbox.send(reply).await;
                // liberar el slot al terminar
                drop(permit);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::engine::ReduceOp;
    use common::task::ResourceRequirements;
    use common::{CodeRef, JobInput, SandboxKind};
    use serde_json::json;

    fn assign(handler: &str, sandbox: SandboxKind, input: JobInput, deadline: DateTime<Utc>) -> JobAssign {
        JobAssign {
            task_id: "t1".into(),
            job_id: "t1:0".into(),
            attempt: 2,
            code_ref: CodeRef {
                sandbox,
                handler: handler.into(),
                params: json!({}),
            },
            sandbox_type: sandbox,
            input_payload: input,
            requirements: ResourceRequirements::default(),
            deadline_ts: deadline,
            privacy: "none".into(),
        }
    }

    #[test]
    fn config_por_defecto() {
        let c = WorkerConfig::default();
        assert_eq!(c.coordinator_url, "http://localhost:8080");
        assert_eq!(c.concurrency, 2);
        assert_eq!(c.sandbox_chain, "container,wasm,process,builtin");
        assert_eq!(c.poll_interval, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn resultado_lleva_el_sandbox_que_corrio() {
        let now = Utc::now();
        let chain = SandboxChain::from_names(DEFAULT_CHAIN);
        let a = assign(
            "range_reduce",
            SandboxKind::Wasm,
            JobInput::Range { start: 0, end: 4, operation: ReduceOp::Sum },
            now + chrono::Duration::seconds(30),
        );
        let Message::Result(r) = execute_assignment(&chain, &a, "w1", now).await else {
            panic!("se esperaba JOB_RESULT");
        };
        assert!(r.success);
        assert_eq!((r.worker_id.as_str(), r.attempt), ("w1", 2));
        assert_eq!(r.output, Some(json!({"value": 6, "count": 4})));
        // wasm no está y process no corre handlers incorporados
        assert_eq!(r.sandbox, Some(SandboxKind::Builtin));
    }

    #[tokio::test]
    async fn codigo_invalido_es_job_fail() {
        let now = Utc::now();
        let chain = SandboxChain::from_names("builtin");
        let a = assign(
            "no_existe",
            SandboxKind::Builtin,
            JobInput::Whole { input: json!(1) },
            now + chrono::Duration::seconds(30),
        );
        let Message::Fail(f) = execute_assignment(&chain, &a, "w1", now).await else {
            panic!("se esperaba JOB_FAIL");
        };
        assert_eq!(f.reason, FailReason::InvalidCode);
        assert_eq!(f.attempt, 2);
    }

    #[tokio::test]
    async fn deadline_vencido_es_timeout_sin_ejecutar() {
        let now = Utc::now();
        let chain = SandboxChain::from_names("builtin");
        let a = assign("echo", SandboxKind::Builtin, JobInput::Whole { input: json!(1) }, now);
        let Message::Fail(f) = execute_assignment(&chain, &a, "w1", now).await else {
            panic!("se esperaba JOB_FAIL");
        };
        assert_eq!(f.reason, FailReason::Timeout);
    }

    #[tokio::test]
    async fn error_del_codigo_es_job_result_fallido() {
        let now = Utc::now();
        let chain = SandboxChain::from_names("builtin");
        let a = assign(
            "sum",
            SandboxKind::Builtin,
            JobInput::Whole { input: json!({"no": "lista"}) },
            now + chrono::Duration::seconds(30),
        );
        let Message::Result(r) = execute_assignment(&chain, &a, "w1", now).await else {
            panic!("se esperaba JOB_RESULT");
        };
        assert!(!r.success);
        assert!(r.output.is_none());
        assert!(r.error.unwrap().contains("sum"));
    }
}
