use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use common::protocol::{AckStatus, JobFail};
use common::results::{JobResult, SchedulerEvent, StatusCounters};
use common::{Job, JobId, JobStatus, WorkerId};

use crate::state::{lock, JobRecord, SchedulerState};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("transición inválida para {job_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("el job {0} ya está registrado")]
    DuplicateJob(JobId),

    #[error("job desconocido: {0}")]
    UnknownJob(JobId),
}

/// Qué hizo el scheduler con un JOB_RESULT / JOB_FAIL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultOutcome {
    Completed,
    /// Fallo transitorio: vuelve a PENDING con attempt+1.
    Retrying,
    /// Intentos agotados.
    Failed,
    /// El job ya era terminal; se registra y se ignora.
    Duplicate,
    /// Mensaje de un intento o worker que ya no corresponde.
    Stale,
}

impl ResultOutcome {
    /// El job llegó a un estado terminal con este mensaje.
    pub fn settled(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Jobs afectados por una pasada de expiración.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrySweep {
    pub requeued: Vec<JobId>,
    pub failed: Vec<JobId>,
}

/// Dueño único del estado de los jobs. Toda mutación pasa por estas operaciones,
/// y cada una es atómica respecto de su job (mutex por registro).
pub struct JobScheduler {
    state: SchedulerState,
    retry_backoff: Duration,
}

impl JobScheduler {
    pub fn new(retry_backoff: Duration) -> Self {
        Self {
            state: SchedulerState::new(),
            retry_backoff,
        }
    }

    fn with_record<R>(
        &self,
        job_id: &str,
        f: impl FnOnce(&mut JobRecord) -> Result<R, SchedulerError>,
    ) -> Result<R, SchedulerError> {
        let rec = self
            .state
            .get(job_id)
            .ok_or_else(|| SchedulerError::UnknownJob(job_id.to_string()))?;
        let mut guard = lock(&rec);
        f(&mut guard)
    }

    fn event(
        &self,
        rec: &JobRecord,
        from: Option<JobStatus>,
        to: Option<JobStatus>,
        worker: Option<&str>,
        detail: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.state.push_event(SchedulerEvent {
            at: now,
            task_id: rec.job.task_id.clone(),
            job_id: rec.job.id.clone(),
            from,
            to,
            worker_id: worker.map(str::to_string),
            attempt: rec.attempt,
            detail: detail.into(),
        });
    }

    fn transition(
        &self,
        rec: &mut JobRecord,
        to: JobStatus,
        worker: Option<&str>,
        detail: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        let from = rec.status;
        rec.status = to;
        self.event(rec, Some(from), Some(to), worker, detail, now);
    }

    fn invalid(rec: &JobRecord, to: JobStatus) -> SchedulerError {
        SchedulerError::InvalidTransition {
            job_id: rec.job.id.clone(),
            from: rec.status,
            to,
        }
    }

    fn backoff_for(&self, attempt: u32) -> chrono::Duration {
        chrono::Duration::from_std(self.retry_backoff * attempt).unwrap_or_else(|_| chrono::Duration::zero())
    }

    fn requeue(&self, rec: &mut JobRecord, now: DateTime<Utc>, delay: chrono::Duration, detail: impl Into<String>) {
        let worker = rec.assigned_to.take();
        rec.assigned_at = None;
        rec.deadline = None;
        rec.next_retry_at = Some(now + delay);
        self.transition(rec, JobStatus::Pending, worker.as_deref(), detail, now);
    }

    /// Fallo del intento en curso: reintento con backoff o FAILED si ya no quedan intentos.
    fn retry_or_fail(&self, rec: &mut JobRecord, error: String, now: DateTime<Utc>) -> ResultOutcome {
        rec.last_error = Some(error.clone());
        if rec.attempt < rec.max_attempts {
            let delay = self.backoff_for(rec.attempt);
            rec.attempt += 1;
            info!(
                "reintentando job {} (attempt={}/{}): {}",
                rec.job.id, rec.attempt, rec.max_attempts, error
            );
            self.requeue(rec, now, delay, format!("reintento: {error}"));
            ResultOutcome::Retrying
        } else {
            warn!(
                "job {} superó el máximo de intentos ({}), marcando FAILED: {}",
                rec.job.id, rec.max_attempts, error
            );
            let worker = rec.assigned_to.clone();
            rec.failure_reason = Some(error.clone());
            self.transition(rec, JobStatus::Failed, worker.as_deref(), error, now);
            ResultOutcome::Failed
        }
    }

    /// ASSIGNED/ACKED/RUNNING -> EXPIRED -> PENDING (attempt+1) o FAILED.
    fn expire(&self, rec: &mut JobRecord, detail: &str, now: DateTime<Utc>) -> bool {
        let worker = rec.assigned_to.clone();
        self.transition(rec, JobStatus::Expired, worker.as_deref(), detail, now);
        rec.last_error = Some(detail.to_string());
        if rec.attempt < rec.max_attempts {
            let delay = self.backoff_for(rec.attempt);
            rec.attempt += 1;
            self.requeue(rec, now, delay, format!("reencolado tras {detail}"));
            true
        } else {
            rec.failure_reason = Some(detail.to_string());
            rec.assigned_to = None;
            self.transition(rec, JobStatus::Failed, worker.as_deref(), "intentos agotados", now);
            false
        }
    }

    fn complete(&self, rec: &mut JobRecord, result: &JobResult, detail: &str, now: DateTime<Utc>) {
        rec.result = Some(result.clone());
        rec.deadline = None;
        self.transition(rec, JobStatus::Completed, Some(&result.worker_id), detail, now);
    }

    /// El mensaje corresponde al intento y worker vigentes.
    fn is_current(rec: &JobRecord, worker: &str, attempt: u32) -> bool {
        rec.status.is_in_flight() && rec.assigned_to.as_deref() == Some(worker) && rec.attempt == attempt
    }

    /* ==== operaciones ==== */

    /// Inserta los jobs en PENDING. Falla sin insertar nada si algún id ya existe.
    pub fn register(&self, task_id: &str, jobs: &[Job], now: DateTime<Utc>) -> Result<(), SchedulerError> {
        self.state
            .insert_all(task_id, jobs)
            .map_err(SchedulerError::DuplicateJob)?;
        for job in jobs {
            if let Some(rec) = self.state.snapshot(&job.id) {
                self.event(&rec, None, Some(JobStatus::Pending), None, "registrado", now);
            }
        }
        debug!("registrados {} jobs de la tarea {}", jobs.len(), task_id);
        Ok(())
    }

    /// PENDING -> ASSIGNED con deadline `now + timeout`. Devuelve el registro asignado,
    /// o `None` si el job ya era terminal.
    pub fn mark_assigned(
        &self,
        job_id: &str,
        worker: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, SchedulerError> {
        self.with_record(job_id, |rec| {
            if rec.status.is_terminal() {
                return Ok(None);
            }
            if rec.status != JobStatus::Pending {
                return Err(Self::invalid(rec, JobStatus::Assigned));
            }
            let timeout = i64::try_from(rec.job.timeout_secs).unwrap_or(i64::MAX / 1000);
            rec.assigned_to = Some(worker.to_string());
            rec.assigned_at = Some(now);
            rec.deadline = Some(now + chrono::Duration::seconds(timeout));
            rec.next_retry_at = None;
            rec.assigned_attempt = Some(rec.attempt);
            rec.tried_workers.push(worker.to_string());
            self.transition(rec, JobStatus::Assigned, Some(worker), "asignado", now);
            Ok(Some(rec.clone()))
        })
    }

    /// ASSIGNED -> ACKED si se aceptó; busy/rejected lo devuelven a PENDING sin consumir intento.
    /// Acks repetidos o tardíos no cambian nada.
    pub fn mark_ack(
        &self,
        job_id: &str,
        worker: &str,
        status: AckStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, SchedulerError> {
        self.with_record(job_id, |rec| {
            if rec.status.is_terminal() {
                return Ok(false);
            }
            if !rec.tried_workers.iter().any(|w| w == worker) {
                return Err(Self::invalid(rec, JobStatus::Acked));
            }
            if rec.status != JobStatus::Assigned || rec.assigned_to.as_deref() != Some(worker) {
                return Ok(false);
            }
            match status {
                AckStatus::Accepted => {
                    self.transition(rec, JobStatus::Acked, Some(worker), "aceptado", now);
                }
                AckStatus::Busy => {
                    self.requeue(rec, now, chrono::Duration::zero(), format!("worker {worker} ocupado"));
                }
                AckStatus::Rejected => {
                    rec.excluded_workers.insert(worker.to_string());
                    rec.last_error = Some(format!("rechazado por {worker}"));
                    self.requeue(rec, now, chrono::Duration::zero(), format!("rechazado por {worker}"));
                }
            }
            Ok(true)
        })
    }

    /// ACKED (o ASSIGNED con el ack perdido) -> RUNNING.
    pub fn mark_running(&self, job_id: &str, worker: &str, now: DateTime<Utc>) -> Result<bool, SchedulerError> {
        self.with_record(job_id, |rec| match rec.status {
            JobStatus::Completed | JobStatus::Failed | JobStatus::Running => Ok(false),
            JobStatus::Assigned | JobStatus::Acked if rec.assigned_to.as_deref() == Some(worker) => {
                self.transition(rec, JobStatus::Running, Some(worker), "ejecutando", now);
                Ok(true)
            }
            _ => Err(Self::invalid(rec, JobStatus::Running)),
        })
    }

    /// Aplica un JOB_RESULT. Idempotente: sobre un job terminal sólo cuenta el duplicado.
    pub fn mark_result(&self, result: &JobResult, now: DateTime<Utc>) -> Result<ResultOutcome, SchedulerError> {
        self.with_record(&result.job_id, |rec| {
            let worker = result.worker_id.as_str();
            if rec.status.is_terminal() {
                rec.duplicate_results += 1;
                self.event(
                    rec,
                    None,
                    None,
                    Some(worker),
                    format!("resultado duplicado ignorado (intento {})", result.attempt),
                    now,
                );
                return Ok(ResultOutcome::Duplicate);
            }

            if !Self::is_current(rec, worker, result.attempt) {
                // un éxito tardío de un worker que sí tuvo el job vale igual: misma entrada, mismo código
                if result.success && rec.tried_workers.iter().any(|w| w == worker) {
                    self.complete(rec, result, "resultado tardío aceptado", now);
                    return Ok(ResultOutcome::Completed);
                }
                self.event(
                    rec,
                    None,
                    None,
                    Some(worker),
                    format!("resultado obsoleto ignorado (intento {})", result.attempt),
                    now,
                );
                return Ok(ResultOutcome::Stale);
            }

            if rec.status != JobStatus::Running {
                self.transition(rec, JobStatus::Running, Some(worker), "ejecutando", now);
            }
            if result.success {
                self.complete(rec, result, "completado", now);
                Ok(ResultOutcome::Completed)
            } else {
                let error = result.error.clone().unwrap_or_else(|| "error sin detalle".to_string());
                Ok(self.retry_or_fail(rec, error, now))
            }
        })
    }

    /// Aplica un JOB_FAIL. `invalid_code` y `no_resources` excluyen al worker para este job.
    pub fn mark_failed(&self, fail: &JobFail, now: DateTime<Utc>) -> Result<ResultOutcome, SchedulerError> {
        self.with_record(&fail.job_id, |rec| {
            let worker = fail.worker_id.as_str();
            if rec.status.is_terminal() {
                rec.duplicate_results += 1;
                self.event(rec, None, None, Some(worker), "JOB_FAIL sobre job terminal ignorado", now);
                return Ok(ResultOutcome::Duplicate);
            }
            if !Self::is_current(rec, worker, fail.attempt) {
                self.event(rec, None, None, Some(worker), "JOB_FAIL obsoleto ignorado", now);
                return Ok(ResultOutcome::Stale);
            }
            if fail.reason.excludes_worker() {
                rec.excluded_workers.insert(worker.to_string());
            }
            let error = match &fail.detail {
                Some(d) => format!("{}: {d}", fail.reason.as_str()),
                None => fail.reason.as_str().to_string(),
            };
            Ok(self.retry_or_fail(rec, error, now))
        })
    }

    fn expire_where(&self, now: DateTime<Utc>, detail: &str, pred: impl Fn(&JobRecord) -> bool) -> RetrySweep {
        let mut touched: Vec<(u64, JobId, bool)> = Vec::new();
        for rec in self.state.all() {
            let mut rec = lock(&rec);
            if rec.status.is_in_flight() && pred(&rec) {
                let requeued = self.expire(&mut rec, detail, now);
                touched.push((rec.seq, rec.job.id.clone(), requeued));
            }
        }
        touched.sort_by_key(|(seq, _, _)| *seq);
        let mut sweep = RetrySweep::default();
        for (_, id, requeued) in touched {
            if requeued {
                sweep.requeued.push(id);
            } else {
                sweep.failed.push(id);
            }
        }
        sweep
    }

    /// Jobs en vuelo cuyo deadline pasó: vuelven a PENDING con attempt+1, o FAILED al tope.
    pub fn jobs_due_for_retry(&self, now: DateTime<Utc>) -> RetrySweep {
        let sweep = self.expire_where(now, "timeout", |rec| rec.deadline.is_some_and(|d| d < now));
        if !sweep.requeued.is_empty() || !sweep.failed.is_empty() {
            info!(
                "expiración: {} reencolados, {} fallidos",
                sweep.requeued.len(),
                sweep.failed.len()
            );
        }
        sweep
    }

    /// Expira todo lo que tenía un worker caído.
    pub fn expire_worker(&self, worker: &str, now: DateTime<Utc>) -> RetrySweep {
        self.expire_where(now, "worker caído", |rec| rec.assigned_to.as_deref() == Some(worker))
    }

    /// Borra los jobs y eventos de una tarea ya terminada. Devuelve cuántos jobs había.
    pub fn forget_task(&self, task_id: &str) -> usize {
        self.state.remove_task(task_id)
    }

    /// Pasa a FAILED todos los jobs no terminales de la tarea.
    pub fn cancel_task(&self, task_id: &str, reason: &str, now: DateTime<Utc>) -> Vec<JobId> {
        let mut cancelled = Vec::new();
        for rec in self.state.of_task(task_id) {
            let mut rec = lock(&rec);
            if rec.status.is_terminal() {
                continue;
            }
            let worker = rec.assigned_to.take();
            rec.deadline = None;
            rec.failure_reason = Some(reason.to_string());
            self.transition(&mut rec, JobStatus::Failed, worker.as_deref(), reason, now);
            cancelled.push(rec.job.id.clone());
        }
        if !cancelled.is_empty() {
            info!("tarea {}: {} jobs cancelados ({})", task_id, cancelled.len(), reason);
        }
        cancelled
    }

    /// Sólo quedan workers excluidos para este job: se levantan las exclusiones y se vuelve a
    /// intentar contra ellos. Si el intento en curso ya llegó a un worker, el reintento gasta
    /// uno nuevo con backoff; sin intentos restantes el job pasa a FAILED con el último error.
    pub fn lift_exclusions(&self, job_id: &str, now: DateTime<Utc>) -> Result<ResultOutcome, SchedulerError> {
        self.with_record(job_id, |rec| {
            if rec.status != JobStatus::Pending || rec.excluded_workers.is_empty() {
                return Ok(ResultOutcome::Stale);
            }
            let mut lifted: Vec<WorkerId> = rec.excluded_workers.drain().collect();
            lifted.sort();
            let error = rec
                .last_error
                .clone()
                .unwrap_or_else(|| "sin workers elegibles".to_string());

            if rec.assigned_attempt != Some(rec.attempt) {
                // el fallo ya gastó el intento y su backoff
                self.event(rec, None, None, None, format!("exclusiones levantadas: {lifted:?}"), now);
                return Ok(ResultOutcome::Retrying);
            }
            if rec.attempt < rec.max_attempts {
                let delay = self.backoff_for(rec.attempt);
                rec.attempt += 1;
                rec.next_retry_at = Some(now + delay);
                info!(
                    "job {} sin workers elegibles, reintento contra {:?} (attempt={}/{})",
                    rec.job.id, lifted, rec.attempt, rec.max_attempts
                );
                self.event(rec, None, None, None, format!("reintento contra excluidos {lifted:?}"), now);
                Ok(ResultOutcome::Retrying)
            } else {
                warn!("job {} sin workers elegibles ni intentos: {}", rec.job.id, error);
                rec.failure_reason = Some(error.clone());
                self.transition(rec, JobStatus::Failed, None, error, now);
                Ok(ResultOutcome::Failed)
            }
        })
    }

    /// Fuerza FAILED con un motivo, aunque el job esté COMPLETED (verificación agotada).
    pub fn fail_job(&self, job_id: &str, reason: &str, now: DateTime<Utc>) -> Result<bool, SchedulerError> {
        self.with_record(job_id, |rec| {
            if rec.status == JobStatus::Failed {
                return Ok(false);
            }
            let worker = rec.assigned_to.take();
            rec.deadline = None;
            rec.failure_reason = Some(reason.to_string());
            self.transition(rec, JobStatus::Failed, worker.as_deref(), reason, now);
            Ok(true)
        })
    }

    /// Evento sin cambio de estado (veredictos, penalizaciones).
    pub fn note(&self, job_id: &str, worker: Option<&str>, detail: impl Into<String>, now: DateTime<Utc>) {
        if let Some(rec) = self.state.snapshot(job_id) {
            self.event(&rec, None, None, worker, detail, now);
        }
    }

    /* ==== consultas ==== */

    /// Jobs PENDING cuyo backoff ya venció, en orden de registro.
    pub fn dispatchable(&self, now: DateTime<Utc>) -> Vec<JobRecord> {
        let mut out: Vec<JobRecord> = self
            .state
            .all()
            .into_iter()
            .filter_map(|rec| {
                let rec = lock(&rec);
                let due = rec.next_retry_at.map_or(true, |t| t <= now);
                (rec.status == JobStatus::Pending && due).then(|| rec.clone())
            })
            .collect();
        out.sort_by_key(|r| r.seq);
        out
    }

    pub fn record(&self, job_id: &str) -> Option<JobRecord> {
        self.state.snapshot(job_id)
    }

    pub fn task_records(&self, task_id: &str) -> Vec<JobRecord> {
        let mut out: Vec<JobRecord> = self.state.of_task(task_id).iter().map(|r| lock(r).clone()).collect();
        out.sort_by_key(|r| r.seq);
        out
    }

    pub fn events(&self, task_id: &str) -> Vec<SchedulerEvent> {
        self.state.events(task_id)
    }

    /// Jobs por estado, de una tarea o de todas.
    pub fn counters(&self, task_id: Option<&str>) -> StatusCounters {
        let records = match task_id {
            Some(id) => self.state.of_task(id),
            None => self.state.all(),
        };
        let mut c = StatusCounters::default();
        for rec in records {
            let rec = lock(&rec);
            c.count(rec.status);
            c.duplicate_results += u64::from(rec.duplicate_results);
        }
        c
    }

    pub fn in_flight_by_worker(&self) -> HashMap<WorkerId, u32> {
        let mut load: HashMap<WorkerId, u32> = HashMap::new();
        for rec in self.state.all() {
            let rec = lock(&rec);
            if let (true, Some(w)) = (rec.status.is_in_flight(), rec.assigned_to.as_ref()) {
                *load.entry(w.clone()).or_insert(0) += 1;
            }
        }
        load
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use common::protocol::FailReason;
    use common::{CodeRef, JobInput, SandboxKind};
    use serde_json::json;

    fn job(id: &str, max_attempts: u32) -> Job {
        Job {
            id: id.into(),
            task_id: "t1".into(),
            node_id: None,
            index: 0,
            input: JobInput::Chunk { offset: 0, items: vec![json!(1)] },
            code_ref: CodeRef {
                sandbox: SandboxKind::Builtin,
                handler: "map".into(),
                params: json!({"function": "increment"}),
            },
            replica_of: None,
            max_attempts,
            timeout_secs: 10,
        }
    }

    fn sched() -> JobScheduler {
        JobScheduler::new(Duration::ZERO)
    }

    fn ok(job_id: &str, worker: &str, attempt: u32) -> JobResult {
        JobResult::ok("t1", job_id, worker, attempt, json!([2]), 5)
    }

    fn err(job_id: &str, worker: &str, attempt: u32) -> JobResult {
        JobResult::failed("t1", job_id, worker, attempt, "boom", 5)
    }

    #[test]
    fn registrar_id_repetido_falla_sin_insertar_nada() {
        let s = sched();
        let now = Utc::now();
        s.register("t1", &[job("t1:0", 3)], now).unwrap();
        let e = s.register("t1", &[job("t1:1", 3), job("t1:0", 3)], now).unwrap_err();
        assert_eq!(e, SchedulerError::DuplicateJob("t1:0".into()));
        assert!(s.record("t1:1").is_none());
    }

    #[test]
    fn ciclo_feliz_y_resultado_duplicado() {
        let s = sched();
        let now = Utc::now();
        s.register("t1", &[job("t1:0", 3)], now).unwrap();

        let rec = s.mark_assigned("t1:0", "w1", now).unwrap().unwrap();
        assert_eq!(rec.deadline, Some(now + ChronoDuration::seconds(10)));
        assert!(s.mark_ack("t1:0", "w1", AckStatus::Accepted, now).unwrap());
        assert!(s.mark_running("t1:0", "w1", now).unwrap());
        assert_eq!(s.mark_result(&ok("t1:0", "w1", 1), now).unwrap(), ResultOutcome::Completed);

        // el mismo resultado otra vez: no cambia nada, sólo se cuenta
        assert_eq!(s.mark_result(&ok("t1:0", "w1", 1), now).unwrap(), ResultOutcome::Duplicate);
        assert_eq!(s.mark_result(&err("t1:0", "w1", 1), now).unwrap(), ResultOutcome::Duplicate);

        let c = s.counters(Some("t1"));
        assert_eq!(c.completed, 1);
        assert_eq!(c.duplicate_results, 2);
        assert_eq!(s.record("t1:0").unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn running_sobre_completed_es_noop_y_sobre_pending_es_invalido() {
        let s = sched();
        let now = Utc::now();
        s.register("t1", &[job("t1:0", 3), job("t1:1", 3)], now).unwrap();
        s.mark_assigned("t1:0", "w1", now).unwrap();
        s.mark_result(&ok("t1:0", "w1", 1), now).unwrap();

        assert!(!s.mark_running("t1:0", "w1", now).unwrap());
        assert!(matches!(
            s.mark_running("t1:1", "w1", now),
            Err(SchedulerError::InvalidTransition { from: JobStatus::Pending, .. })
        ));
        assert_eq!(s.mark_assigned("t1:0", "w2", now).unwrap(), None);
    }

    #[test]
    fn reintentos_se_agotan_en_max_attempts() {
        let s = sched();
        let now = Utc::now();
        s.register("t1", &[job("t1:0", 3)], now).unwrap();

        let mut outcomes = Vec::new();
        for attempt in 1..=3 {
            let rec = s.mark_assigned("t1:0", "w1", now).unwrap().unwrap();
            assert_eq!(rec.attempt, attempt);
            outcomes.push(s.mark_result(&err("t1:0", "w1", attempt), now).unwrap());
        }
        assert_eq!(
            outcomes,
            vec![ResultOutcome::Retrying, ResultOutcome::Retrying, ResultOutcome::Failed]
        );
        let rec = s.record("t1:0").unwrap();
        assert_eq!(rec.status, JobStatus::Failed);
        assert_eq!(rec.attempt, 3);
        assert_eq!(rec.failure_reason.as_deref(), Some("boom"));
        // ya no se puede asignar: nunca pasa de max_attempts
        assert_eq!(s.mark_assigned("t1:0", "w1", now).unwrap(), None);
    }

    #[test]
    fn deadline_vencido_expira_y_reencola_con_attempt_mas_uno() {
        let s = sched();
        let now = Utc::now();
        s.register("t1", &[job("t1:0", 2)], now).unwrap();
        s.mark_assigned("t1:0", "w1", now).unwrap();

        assert_eq!(s.jobs_due_for_retry(now + ChronoDuration::seconds(5)), RetrySweep::default());
        let sweep = s.jobs_due_for_retry(now + ChronoDuration::seconds(11));
        assert_eq!(sweep.requeued, vec!["t1:0".to_string()]);
        let rec = s.record("t1:0").unwrap();
        assert_eq!((rec.status, rec.attempt), (JobStatus::Pending, 2));

        let events = s.events("t1");
        assert!(events.iter().any(|e| e.to == Some(JobStatus::Expired)));

        // segundo vencimiento: ya no quedan intentos
        let later = now + ChronoDuration::seconds(20);
        s.mark_assigned("t1:0", "w2", later).unwrap();
        let sweep = s.jobs_due_for_retry(later + ChronoDuration::seconds(11));
        assert_eq!(sweep.failed, vec!["t1:0".to_string()]);
        assert_eq!(s.record("t1:0").unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn busy_reencola_sin_gastar_intento_y_rejected_excluye() {
        let s = sched();
        let now = Utc::now();
        s.register("t1", &[job("t1:0", 3)], now).unwrap();

        s.mark_assigned("t1:0", "w1", now).unwrap();
        assert!(s.mark_ack("t1:0", "w1", AckStatus::Busy, now).unwrap());
        let rec = s.record("t1:0").unwrap();
        assert_eq!((rec.status, rec.attempt), (JobStatus::Pending, 1));
        assert!(rec.excluded_workers.is_empty());

        s.mark_assigned("t1:0", "w2", now).unwrap();
        assert!(s.mark_ack("t1:0", "w2", AckStatus::Rejected, now).unwrap());
        let rec = s.record("t1:0").unwrap();
        assert_eq!(rec.attempt, 1);
        assert!(rec.excluded_workers.contains("w2"));

        // ack tardío del primer worker: no-op
        assert!(!s.mark_ack("t1:0", "w1", AckStatus::Accepted, now).unwrap());
        // ack de alguien que nunca lo tuvo
        assert!(s.mark_ack("t1:0", "w9", AckStatus::Accepted, now).is_err());
    }

    #[test]
    fn fallo_obsoleto_se_ignora_y_exito_tardio_se_acepta() {
        let s = sched();
        let now = Utc::now();
        s.register("t1", &[job("t1:0", 3)], now).unwrap();
        s.mark_assigned("t1:0", "w1", now).unwrap();
        s.jobs_due_for_retry(now + ChronoDuration::seconds(11));
        s.mark_assigned("t1:0", "w2", now + ChronoDuration::seconds(12)).unwrap();

        assert_eq!(s.mark_result(&err("t1:0", "w1", 1), now).unwrap(), ResultOutcome::Stale);
        assert_eq!(s.record("t1:0").unwrap().status, JobStatus::Assigned);

        assert_eq!(s.mark_result(&ok("t1:0", "w1", 1), now).unwrap(), ResultOutcome::Completed);
        // el resultado del intento vigente llega después y es un duplicado
        assert_eq!(s.mark_result(&ok("t1:0", "w2", 2), now).unwrap(), ResultOutcome::Duplicate);
    }

    #[test]
    fn job_fail_invalid_code_excluye_al_worker() {
        let s = sched();
        let now = Utc::now();
        s.register("t1", &[job("t1:0", 3)], now).unwrap();
        s.mark_assigned("t1:0", "w1", now).unwrap();
        let fail = JobFail {
            task_id: "t1".into(),
            job_id: "t1:0".into(),
            worker_id: "w1".into(),
            reason: FailReason::InvalidCode,
            attempt: 1,
            detail: Some("handler desconocido".into()),
        };
        assert_eq!(s.mark_failed(&fail, now).unwrap(), ResultOutcome::Retrying);
        let rec = s.record("t1:0").unwrap();
        assert!(rec.excluded_workers.contains("w1"));
        assert_eq!(rec.last_error.as_deref(), Some("invalid_code: handler desconocido"));
        assert_eq!(s.mark_failed(&fail, now).unwrap(), ResultOutcome::Stale);
    }

    #[test]
    fn backoff_retrasa_el_despacho() {
        let s = JobScheduler::new(Duration::from_millis(500));
        let now = Utc::now();
        s.register("t1", &[job("t1:0", 3)], now).unwrap();
        s.mark_assigned("t1:0", "w1", now).unwrap();
        s.mark_result(&err("t1:0", "w1", 1), now).unwrap();

        assert!(s.dispatchable(now).is_empty());
        let due = s.dispatchable(now + ChronoDuration::milliseconds(500));
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn worker_caido_expira_sus_jobs() {
        let s = sched();
        let now = Utc::now();
        s.register("t1", &[job("t1:0", 3), job("t1:1", 3)], now).unwrap();
        s.mark_assigned("t1:0", "w1", now).unwrap();
        s.mark_assigned("t1:1", "w2", now).unwrap();

        let sweep = s.expire_worker("w1", now);
        assert_eq!(sweep.requeued, vec!["t1:0".to_string()]);
        assert_eq!(s.in_flight_by_worker().get("w2"), Some(&1));
        assert_eq!(s.in_flight_by_worker().get("w1"), None);
    }

    #[test]
    fn cancelar_tarea_falla_lo_pendiente_y_respeta_lo_completado() {
        let s = sched();
        let now = Utc::now();
        s.register("t1", &[job("t1:0", 3), job("t1:1", 3)], now).unwrap();
        s.mark_assigned("t1:0", "w1", now).unwrap();
        s.mark_result(&ok("t1:0", "w1", 1), now).unwrap();

        let cancelled = s.cancel_task("t1", "task_deadline_exceeded", now);
        assert_eq!(cancelled, vec!["t1:1".to_string()]);
        let rec = s.record("t1:1").unwrap();
        assert_eq!(rec.failure_reason.as_deref(), Some("task_deadline_exceeded"));
        assert_eq!(s.record("t1:0").unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn levantar_exclusiones_gasta_intento_solo_si_el_vigente_ya_se_uso() {
        let s = sched();
        let now = Utc::now();
        s.register("t1", &[job("t1:0", 3)], now).unwrap();

        // el rechazo no gasta intento: lo gasta el levantamiento
        s.mark_assigned("t1:0", "w1", now).unwrap();
        s.mark_ack("t1:0", "w1", AckStatus::Rejected, now).unwrap();
        assert_eq!(s.lift_exclusions("t1:0", now).unwrap(), ResultOutcome::Retrying);
        let rec = s.record("t1:0").unwrap();
        assert_eq!((rec.status, rec.attempt), (JobStatus::Pending, 2));
        assert!(rec.excluded_workers.is_empty());
        assert_eq!(s.lift_exclusions("t1:0", now).unwrap(), ResultOutcome::Stale);

        // invalid_code ya pasó al intento siguiente
        s.mark_assigned("t1:0", "w1", now).unwrap();
        let fail = JobFail {
            task_id: "t1".into(),
            job_id: "t1:0".into(),
            worker_id: "w1".into(),
            reason: FailReason::InvalidCode,
            attempt: 2,
            detail: None,
        };
        assert_eq!(s.mark_failed(&fail, now).unwrap(), ResultOutcome::Retrying);
        assert_eq!(s.lift_exclusions("t1:0", now).unwrap(), ResultOutcome::Retrying);
        assert_eq!(s.record("t1:0").unwrap().attempt, 3);

        s.mark_assigned("t1:0", "w1", now).unwrap();
        s.mark_ack("t1:0", "w1", AckStatus::Rejected, now).unwrap();
        assert_eq!(s.lift_exclusions("t1:0", now).unwrap(), ResultOutcome::Failed);
        let rec = s.record("t1:0").unwrap();
        assert_eq!(rec.status, JobStatus::Failed);
        assert_eq!(rec.failure_reason.as_deref(), Some("rechazado por w1"));
    }

    #[test]
    fn resultados_concurrentes_completan_una_sola_vez() {
        let s = sched();
        let now = Utc::now();
        s.register("t1", &[job("t1:0", 3)], now).unwrap();
        s.mark_assigned("t1:0", "w1", now).unwrap();

        let outcomes: Vec<ResultOutcome> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| s.mark_result(&ok("t1:0", "w1", 1), now).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let count = |o: ResultOutcome| outcomes.iter().filter(|x| **x == o).count();
        assert_eq!(count(ResultOutcome::Completed), 1);
        assert_eq!(count(ResultOutcome::Duplicate), 7);

        let rec = s.record("t1:0").unwrap();
        assert_eq!(rec.duplicate_results, 7);
        let completions = s
            .events("t1")
            .iter()
            .filter(|e| e.to == Some(JobStatus::Completed))
            .count();
        assert_eq!(completions, 1);
    }

    #[test]
    fn acks_y_barridos_concurrentes_expiran_cada_job_una_vez() {
        let s = sched();
        let now = Utc::now();
        let jobs: Vec<Job> = (0..64).map(|i| job(&format!("t1:{i}"), 3)).collect();
        s.register("t1", &jobs, now).unwrap();
        for j in &jobs {
            s.mark_assigned(&j.id, "w1", now).unwrap();
        }
        let late = now + ChronoDuration::seconds(11);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for j in &jobs {
                    assert!(s.mark_ack(&j.id, "w1", AckStatus::Accepted, late).is_ok());
                }
            });
            for _ in 0..2 {
                scope.spawn(|| s.jobs_due_for_retry(late));
            }
        });

        let events = s.events("t1");
        for j in &jobs {
            let rec = s.record(&j.id).unwrap();
            assert_eq!((rec.status, rec.attempt), (JobStatus::Pending, 2), "{}", j.id);
            let expirations = events
                .iter()
                .filter(|e| e.job_id == j.id && e.to == Some(JobStatus::Expired))
                .count();
            assert_eq!(expirations, 1, "{}", j.id);
        }
    }
}
