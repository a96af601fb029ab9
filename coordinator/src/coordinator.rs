use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use common::aggregate::aggregate;
use common::dag::node_task;
use common::error::{InvalidTaskError, PrivacyError, ProtocolError, SplitError};
use common::pricing::Budget;
use common::privacy::{self, AppliedPrivacy, ReversalToken};
use common::protocol::{JobAssign, Message};
use common::results::{SchedulerEvent, SubmitReceipt, TaskFailure, TaskReport};
use common::split::{split, split_jobs, PipelinePlan, SplitPlan};
use common::task::{Priority, PrivacyMode, TaskStatus, MAX_DURATION_SECS};
use common::worker::{ClusterStats, WorkerHeartbeatRequest, WorkerMetrics};
use common::{Job, JobId, JobStatus, MessageEnvelope, Task, TaskDeclaration, TaskId, WorkerId};

use crate::config::CoordinatorConfig;
use crate::scheduler::{JobScheduler, ResultOutcome, SchedulerError};
use crate::state::{lock, read, write, JobRecord};
use crate::transport::{Transport, TransportError};
use crate::verification::{
    evaluate, outputs_match, GroupVerdict, MemberState, ReputationStore, VerificationGroup,
    VerificationPolicy, Verdict,
};
use crate::workers::WorkerRegistry;

pub const VERIFICATION_EXHAUSTED: &str = "verification_exhausted";
pub const TASK_DEADLINE_EXCEEDED: &str = "task_deadline_exceeded";
pub const MAX_PRICE_EXCEEDED: &str = "max_price_exceeded";

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Invalid(#[from] InvalidTaskError),

    #[error(transparent)]
    Split(#[from] SplitError),

    #[error(transparent)]
    Privacy(#[from] PrivacyError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("tarea desconocida: {0}")]
    UnknownTask(TaskId),

    #[error("worker desconocido: {0}")]
    UnknownWorker(WorkerId),
}

/// El worker que firma un resultado tiene que ser el nodo que lo envía.
fn check_sender(envelope: &MessageEnvelope, worker_id: &str) -> Result<(), ProtocolError> {
    if envelope.src_node == worker_id {
        return Ok(());
    }
    Err(ProtocolError::Invariant {
        msg_type: envelope.msg_type.as_str().to_string(),
        reason: format!("worker_id {} no coincide con src_node {}", worker_id, envelope.src_node),
    })
}

/* ==== estado por tarea ==== */

/// Clave de la unidad de una tarea que no es pipeline.
const ROOT_UNIT: &str = "";

/// Una tarea ya transformada y partida: la tarea entera, o un nodo de pipeline.
struct Unit {
    task: Task,
    /// Jobs primarios en el orden del split.
    jobs: Vec<Job>,
    token: ReversalToken,
    privacy: PrivacyMode,
    /// Por id de job primario.
    groups: BTreeMap<JobId, VerificationGroup>,
}

struct PipelineRun {
    plan: PipelinePlan,
    current_layer: usize,
    /// Salidas agregadas por nodo.
    outputs: BTreeMap<String, Value>,
}

struct TaskEntry {
    task: Task,
    status: TaskStatus,
    policy: VerificationPolicy,
    privacy: Vec<AppliedPrivacy>,
    units: BTreeMap<String, Unit>,
    pipeline: Option<PipelineRun>,
    result: Option<Value>,
    failure: Option<TaskFailure>,
    deadline: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    penalties: u64,
}

/// Lo que hizo una pasada del barrido periódico.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub dead_workers: Vec<WorkerId>,
    pub requeued: Vec<JobId>,
    pub failed: Vec<JobId>,
    pub expired_tasks: Vec<TaskId>,
    /// Tareas terminadas que superaron la retención y se olvidaron.
    pub evicted_tasks: Vec<TaskId>,
    pub forgotten_workers: Vec<WorkerId>,
    pub dispatched: usize,
}

fn member_state(rec: &JobRecord) -> MemberState<'_> {
    match (rec.status, rec.result.as_ref(), rec.output()) {
        (JobStatus::Completed, Some(r), Some(output)) => MemberState::Completed {
            worker: &r.worker_id,
            output,
        },
        (JobStatus::Completed | JobStatus::Failed, _, _) => MemberState::Failed,
        _ => MemberState::Pending,
    }
}

fn build_unit(
    task: Task,
    jobs: Vec<Job>,
    token: ReversalToken,
    privacy: PrivacyMode,
    policy: VerificationPolicy,
    to_register: &mut Vec<Job>,
) -> Unit {
    let mut groups = BTreeMap::new();
    for job in &jobs {
        let (group, members) = VerificationGroup::start(job.clone(), policy);
        to_register.extend(members);
        groups.insert(job.id.clone(), group);
    }
    Unit {
        task,
        jobs,
        token,
        privacy,
        groups,
    }
}

/// Bucle de orquestación: recibe tareas y mensajes de workers y mueve los jobs
/// siempre a través del scheduler.
pub struct Coordinator {
    config: CoordinatorConfig,
    scheduler: JobScheduler,
    workers: WorkerRegistry,
    reputation: Arc<dyn ReputationStore>,
    transport: Arc<dyn Transport>,
    tasks: RwLock<HashMap<TaskId, Arc<Mutex<TaskEntry>>>>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        transport: Arc<dyn Transport>,
        reputation: Arc<dyn ReputationStore>,
    ) -> Self {
        Self {
            scheduler: JobScheduler::new(config.retry_backoff),
            workers: WorkerRegistry::new(),
            config,
            reputation,
            transport,
            tasks: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.workers
    }

    fn entry(&self, task_id: &str) -> Option<Arc<Mutex<TaskEntry>>> {
        read(&self.tasks).get(task_id).cloned()
    }

    /* ==== alta de tareas ==== */

    pub fn submit(&self, decl: TaskDeclaration, now: DateTime<Utc>) -> Result<SubmitReceipt, CoordinatorError> {
        self.submit_with_id(uuid::Uuid::new_v4().to_string(), decl, now)
    }

    /// Valida, transforma, parte y registra. Si algo falla no queda ningún job registrado.
    pub fn submit_with_id(
        &self,
        task_id: TaskId,
        decl: TaskDeclaration,
        now: DateTime<Utc>,
    ) -> Result<SubmitReceipt, CoordinatorError> {
        if self.entry(&task_id).is_some() {
            return Err(SchedulerError::DuplicateJob(task_id).into());
        }
        let task = decl.validate(task_id.clone(), now).map_err(|e| {
            info!("tarea rechazada: {}", e);
            e
        })?;
        let policy = VerificationPolicy::for_level(task.privacy.verification, self.config.strict_replica_budget);
        let transformed = privacy::apply(task.clone())?;

        let mut entry = TaskEntry {
            deadline: task
                .config
                .deadline_secs
                .map(|s| now + chrono::Duration::seconds(s.min(MAX_DURATION_SECS) as i64)),
            task,
            status: TaskStatus::Accepted,
            policy,
            privacy: vec![transformed.applied.clone()],
            units: BTreeMap::new(),
            pipeline: None,
            result: None,
            failure: None,
            finished_at: None,
            penalties: 0,
        };

        let mut to_register = Vec::new();
        match split(&transformed.task)? {
            SplitPlan::Jobs(jobs) => {
                let unit = build_unit(
                    transformed.task,
                    jobs,
                    transformed.token,
                    transformed.applied.effective,
                    policy,
                    &mut to_register,
                );
                entry.units.insert(ROOT_UNIT.to_string(), unit);
            }
            SplitPlan::Pipeline(plan) => {
                entry.pipeline = Some(PipelineRun {
                    plan,
                    current_layer: 0,
                    outputs: BTreeMap::new(),
                });
                prepare_layer(&mut entry, now, &mut to_register)?;
            }
        }

        self.scheduler.register(&task_id, &to_register, now)?;
        let jobs = to_register.iter().filter(|j| !j.is_replica()).count();
        info!(
            "tarea {} aceptada: tipo {:?}, {} jobs, privacidad {:?}, verificación {:?}",
            task_id,
            entry.task.task_type(),
            jobs,
            entry.privacy.last().map(|p| p.effective),
            entry.policy.level
        );

        let receipt = SubmitReceipt {
            task_id: task_id.clone(),
            status: entry.status,
            jobs,
            privacy: entry.privacy.clone(),
        };
        write(&self.tasks).insert(task_id, Arc::new(Mutex::new(entry)));
        Ok(receipt)
    }

    /* ==== mensajes entrantes ==== */

    /// Aplica un sobre recibido de un worker. Duplicados y mensajes tardíos no son errores.
    pub fn handle_envelope(&self, envelope: &MessageEnvelope, now: DateTime<Utc>) -> Result<(), CoordinatorError> {
        if envelope.dst_node != self.config.node_id {
            return Err(ProtocolError::Invariant {
                msg_type: envelope.msg_type.as_str().to_string(),
                reason: format!("dst_node {} no es este coordinador", envelope.dst_node),
            }
            .into());
        }
        match envelope.decode()? {
            Message::Ack(ack) => {
                let changed = self
                    .scheduler
                    .mark_ack(&ack.job_id, &envelope.src_node, ack.status, now)?;
                if changed {
                    debug!("ack {:?} de {} para {}", ack.status, envelope.src_node, ack.job_id);
                }
                Ok(())
            }
            Message::Result(result) => {
                check_sender(envelope, &result.worker_id)?;
                let outcome = self.scheduler.mark_result(&result, now)?;
                debug!("resultado de {} para {}: {:?}", result.worker_id, result.job_id, outcome);
                if outcome.settled() || outcome == ResultOutcome::Retrying {
                    self.workers
                        .record_result(&result.worker_id, result.success, result.runtime_ms);
                }
                if outcome.settled() {
                    self.on_job_settled(&result.job_id, now);
                }
                Ok(())
            }
            Message::Fail(fail) => {
                check_sender(envelope, &fail.worker_id)?;
                let outcome = self.scheduler.mark_failed(&fail, now)?;
                warn!(
                    "JOB_FAIL de {} para {}: {} ({:?})",
                    fail.worker_id,
                    fail.job_id,
                    fail.reason.as_str(),
                    outcome
                );
                if outcome.settled() || outcome == ResultOutcome::Retrying {
                    self.workers.record_result(&fail.worker_id, false, 0);
                }
                if outcome.settled() {
                    self.on_job_settled(&fail.job_id, now);
                }
                Ok(())
            }
            Message::Assign(a) => Err(ProtocolError::Unexpected(format!("JOB_ASSIGN {} hacia el coordinador", a.job_id)).into()),
        }
    }

    /// Un job llegó a COMPLETED o FAILED: decide la verificación de su grupo y avanza la tarea.
    fn on_job_settled(&self, job_id: &str, now: DateTime<Utc>) {
        let Some(rec) = self.scheduler.record(job_id) else {
            return;
        };
        let Some(entry_ref) = self.entry(&rec.job.task_id) else {
            return;
        };
        let mut entry = lock(&entry_ref);
        if entry.status.is_terminal() {
            return;
        }
        let task_id = entry.task.id.clone();
        let unit_key = rec.job.node_id.clone().unwrap_or_default();
        let primary = rec.job.primary_id().to_string();

        let (verdict, all_members) = {
            let Some(group) = entry.units.get(&unit_key).and_then(|u| u.groups.get(&primary)) else {
                return;
            };
            if group.verdict.is_some() || !group.is_member(job_id) {
                return;
            }
            let records: Vec<JobRecord> = group
                .members
                .iter()
                .filter_map(|id| self.scheduler.record(id))
                .collect();
            let members: Vec<MemberState<'_>> = records.iter().map(member_state).collect();
            (
                evaluate(&group.policy, &members, self.config.float_tolerance),
                group.all_members.clone(),
            )
        };

        match verdict {
            Verdict::Pending => {}
            Verdict::NeedMore(n) => {
                let Some(group) = group_mut(&mut entry, &unit_key, &primary) else {
                    return;
                };
                let replicas = group.spawn(n);
                info!(
                    "verificación de {}: sin acuerdo en la ronda {}, pidiendo {} réplica(s)",
                    primary, group.round, n
                );
                self.scheduler
                    .note(&primary, None, format!("verificación: {n} réplica(s) más"), now);
                if let Err(e) = self.scheduler.register(&task_id, &replicas, now) {
                    self.fail_task(&mut entry, Some(primary), e.to_string(), now);
                }
            }
            Verdict::Accept { output, dissenters } => {
                // también pierden reputación los de rondas anteriores que no coinciden con lo aceptado
                let mut penalized: BTreeSet<WorkerId> = dissenters.into_iter().collect();
                for id in &all_members {
                    if let Some(r) = self.scheduler.record(id).and_then(|r| r.result) {
                        let matches = r
                            .output
                            .as_ref()
                            .is_some_and(|o| outputs_match(o, &output, self.config.float_tolerance));
                        if r.success && !matches {
                            penalized.insert(r.worker_id);
                        }
                    }
                }
                for worker in &penalized {
                    warn!("penalizando worker {}: salida discrepante en {}", worker, primary);
                    self.reputation.penalize(worker, &format!("salida discrepante en {primary}"));
                    self.scheduler
                        .note(&primary, Some(worker), "penalización: salida discrepante", now);
                }
                entry.penalties += penalized.len() as u64;
                if entry.policy.replicated() {
                    info!("verificación de {}: salida aceptada", primary);
                    self.scheduler.note(&primary, None, "verificación: salida aceptada", now);
                }
                if let Some(group) = group_mut(&mut entry, &unit_key, &primary) {
                    group.verdict = Some(GroupVerdict::Accepted(output));
                }
                self.try_finish_unit(&mut entry, &unit_key, now);
            }
            Verdict::Exhausted => {
                warn!("verificación de {}: sin mayoría, presupuesto de réplicas agotado", primary);
                let Some(group) = group_mut(&mut entry, &unit_key, &primary) else {
                    return;
                };
                for id in &group.members {
                    if let Err(e) = self.scheduler.fail_job(id, VERIFICATION_EXHAUSTED, now) {
                        warn!("no se pudo marcar {} como FAILED: {}", id, e);
                    }
                }
                if group.round < self.config.verification_rounds {
                    let previous: Vec<WorkerId> = all_members
                        .iter()
                        .filter_map(|id| self.scheduler.record(id))
                        .flat_map(|r| r.tried_workers)
                        .collect();
                    let jobs = group.next_round(previous);
                    info!("verificación de {}: ronda {} con workers nuevos", primary, group.round);
                    if let Err(e) = self.scheduler.register(&task_id, &jobs, now) {
                        self.fail_task(&mut entry, Some(primary), e.to_string(), now);
                    }
                } else {
                    group.verdict = Some(GroupVerdict::Failed(VERIFICATION_EXHAUSTED.to_string()));
                    self.fail_task(&mut entry, Some(primary), VERIFICATION_EXHAUSTED.to_string(), now);
                }
            }
            Verdict::AllFailed => {
                let reason = self
                    .scheduler
                    .record(job_id)
                    .and_then(|r| r.failure_reason)
                    .unwrap_or_else(|| "job fallido".to_string());
                if let Some(group) = group_mut(&mut entry, &unit_key, &primary) {
                    group.verdict = Some(GroupVerdict::Failed(reason.clone()));
                }
                self.fail_task(&mut entry, Some(job_id.to_string()), reason, now);
            }
        }
    }

    /// Si todos los grupos de la unidad están aceptados, agrega y avanza.
    fn try_finish_unit(&self, entry: &mut TaskEntry, unit_key: &str, now: DateTime<Utc>) {
        let aggregated = {
            let Some(unit) = entry.units.get(unit_key) else {
                return;
            };
            let mut outputs: HashMap<JobId, Value> = HashMap::new();
            for (primary, group) in &unit.groups {
                match &group.verdict {
                    Some(GroupVerdict::Accepted(v)) => {
                        outputs.insert(primary.clone(), v.clone());
                    }
                    _ => return,
                }
            }
            aggregate(&unit.task, &unit.jobs, &outputs, &unit.token)
        };
        let value = match aggregated {
            Ok(v) => v,
            Err(e) => {
                self.fail_task(entry, None, format!("agregación: {e}"), now);
                return;
            }
        };

        if entry.pipeline.is_none() {
            self.complete_task(entry, value, now);
            return;
        }
        debug!("tarea {}: nodo {} agregado", entry.task.id, unit_key);
        let Some(run) = entry.pipeline.as_mut() else {
            return;
        };
        run.outputs.insert(unit_key.to_string(), value);
        let layer_done = run
            .plan
            .layers
            .get(run.current_layer)
            .is_some_and(|layer| layer.iter().all(|id| run.outputs.contains_key(id)));
        if !layer_done {
            return;
        }
        run.current_layer += 1;

        if run.current_layer >= run.plan.layers.len() {
            let by_node: HashMap<String, Value> = run.outputs.clone().into_iter().collect();
            match aggregate(&entry.task, &[], &by_node, &ReversalToken::identity()) {
                Ok(v) => self.complete_task(entry, v, now),
                Err(e) => self.fail_task(entry, None, format!("agregación: {e}"), now),
            }
            return;
        }

        let mut jobs = Vec::new();
        let task_id = entry.task.id.clone();
        let prepared = prepare_layer(entry, now, &mut jobs)
            .and_then(|_| self.scheduler.register(&task_id, &jobs, now).map_err(CoordinatorError::from));
        match prepared {
            Ok(()) => info!(
                "tarea {}: capa {} del pipeline registrada ({} jobs)",
                task_id,
                entry.pipeline.as_ref().map_or(0, |r| r.current_layer),
                jobs.len()
            ),
            Err(e) => self.fail_task(entry, None, e.to_string(), now),
        }
    }

    fn complete_task(&self, entry: &mut TaskEntry, value: Value, now: DateTime<Utc>) {
        info!("tarea {} COMPLETED", entry.task.id);
        entry.status = TaskStatus::Completed;
        entry.result = Some(value);
        entry.finished_at = Some(now);
    }

    /// Falla la tarea con el motivo del job que la terminó y cancela lo que quede en curso.
    fn fail_task(&self, entry: &mut TaskEntry, job_id: Option<JobId>, reason: String, now: DateTime<Utc>) {
        warn!("tarea {} FAILED: {} (job {:?})", entry.task.id, reason, job_id);
        entry.status = TaskStatus::Failed;
        entry.finished_at = Some(now);
        let cancel_reason = if reason == TASK_DEADLINE_EXCEEDED {
            TASK_DEADLINE_EXCEEDED
        } else {
            "tarea fallida"
        };
        entry.failure = Some(TaskFailure { job_id, reason });
        self.scheduler.cancel_task(&entry.task.id, cancel_reason, now);
    }

    /* ==== despacho ==== */

    /// Asigna los jobs pendientes a workers libres y envía los JOB_ASSIGN. Devuelve cuántos salieron.
    /// Las tareas de prioridad alta pasan primero; dentro de la misma prioridad, orden de registro.
    pub fn dispatch(&self, now: DateTime<Utc>) -> usize {
        let mut load = self.scheduler.in_flight_by_worker();
        let mut sent = 0;

        let mut queue = self.scheduler.dispatchable(now);
        queue.sort_by_cached_key(|rec| std::cmp::Reverse(self.task_priority(&rec.job.task_id)));

        for rec in queue {
            let Some(entry_ref) = self.entry(&rec.job.task_id) else {
                continue;
            };
            let (exclude, shared_exclude, privacy, requirements, budget) = {
                let entry = lock(&entry_ref);
                if entry.status.is_terminal() {
                    continue;
                }
                let unit_key = rec.job.node_id.clone().unwrap_or_default();
                let Some(unit) = entry.units.get(&unit_key) else {
                    continue;
                };
                // exclusiones de verificación: nunca se levantan
                let mut shared: HashSet<WorkerId> = HashSet::new();
                if let Some(group) = unit.groups.get(rec.job.primary_id()) {
                    shared.extend(group.excluded_workers.iter().cloned());
                    // las réplicas de una ronda corren en workers distintos
                    for sibling in group.members.iter().filter(|m| m.as_str() != rec.id()) {
                        if let Some(s) = self.scheduler.record(sibling) {
                            shared.extend(s.tried_workers);
                        }
                    }
                }
                let mut exclude = shared.clone();
                exclude.extend(rec.excluded_workers.iter().cloned());
                (exclude, shared, unit.privacy, entry.task.requirements.clone(), entry.task.budget())
            };

            let Some(worker) = self.workers.pick(
                &exclude,
                &load,
                self.reputation.as_ref(),
                self.config.min_worker_reputation,
                &budget,
            ) else {
                self.unblock(&rec, &exclude, &shared_exclude, &budget, now);
                debug!("sin worker disponible para {}", rec.id());
                continue;
            };

            let assigned = match self.scheduler.mark_assigned(rec.id(), &worker, now) {
                Ok(Some(r)) => r,
                Ok(None) => continue,
                Err(e) => {
                    warn!("no se pudo asignar {}: {}", rec.id(), e);
                    continue;
                }
            };
            let assign = JobAssign {
                task_id: assigned.job.task_id.clone(),
                job_id: assigned.job.id.clone(),
                attempt: assigned.attempt,
                code_ref: assigned.job.code_ref.clone(),
                sandbox_type: assigned.job.code_ref.sandbox,
                input_payload: assigned.job.input.clone(),
                requirements,
                deadline_ts: assigned
                    .deadline
                    .unwrap_or(now + chrono::Duration::seconds(assigned.job.timeout_secs.min(MAX_DURATION_SECS) as i64)),
                privacy: privacy.as_str().to_string(),
            };
            info!(
                "asignando job {} (attempt={}) al worker {}",
                assign.job_id, assign.attempt, worker
            );
            let sent_ok = Message::Assign(assign)
                .into_envelope_at(&self.config.node_id, &worker, now)
                .map_err(CoordinatorError::from)
                .and_then(|env| self.transport.send(env).map_err(CoordinatorError::from));
            if let Err(e) = sent_ok {
                // queda ASSIGNED y vence por timeout
                warn!("no se pudo enviar JOB_ASSIGN de {} a {}: {}", rec.id(), worker, e);
            }
            self.workers.record_started(&worker);
            *load.entry(worker).or_insert(0) += 1;
            sent += 1;
        }
        sent
    }

    fn task_priority(&self, task_id: &str) -> Priority {
        self.entry(task_id)
            .map_or(Priority::default(), |entry| lock(&entry).task.config.priority)
    }

    /// El job no encontró worker. Dos situaciones no se arreglan esperando:
    /// - hay workers elegibles vivos pero ninguno entra en `max_price`: falla el job;
    /// - sólo quedan workers que el propio job excluyó (rechazo, `invalid_code`,
    ///   `no_resources`): se reintenta contra ellos en vez de esperar para siempre.
    fn unblock(
        &self,
        rec: &JobRecord,
        exclude: &HashSet<WorkerId>,
        shared_exclude: &HashSet<WorkerId>,
        budget: &Budget,
        now: DateTime<Utc>,
    ) {
        let reputation = self.reputation.as_ref();
        let min = self.config.min_worker_reputation;
        let unlimited = Budget::unlimited();

        let eligible = self.workers.has_candidate(exclude, reputation, min, &unlimited);
        if eligible && !self.workers.has_candidate(exclude, reputation, min, budget) {
            warn!(
                "job {}: ningún worker elegible entra en max_price={}",
                rec.id(),
                budget.max_price
            );
            match self.scheduler.fail_job(rec.id(), MAX_PRICE_EXCEEDED, now) {
                Ok(true) => self.on_job_settled(rec.id(), now),
                Ok(false) => {}
                Err(e) => warn!("no se pudo fallar {}: {}", rec.id(), e),
            }
            return;
        }

        if rec.excluded_workers.is_empty()
            || eligible
            || !self.workers.has_candidate(shared_exclude, reputation, min, budget)
        {
            return;
        }
        match self.scheduler.lift_exclusions(rec.id(), now) {
            Ok(ResultOutcome::Failed) => self.on_job_settled(rec.id(), now),
            Ok(_) => {}
            Err(e) => warn!("no se pudieron levantar exclusiones de {}: {}", rec.id(), e),
        }
    }

    /* ==== barrido periódico ==== */

    /// Workers muertos, deadlines de jobs y de tareas; después despacha lo que quedó pendiente.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport {
            dead_workers: self.workers.mark_dead_workers(now, self.config.worker_dead_timeout),
            ..SweepReport::default()
        };
        for worker in &report.dead_workers {
            let s = self.scheduler.expire_worker(worker, now);
            report.requeued.extend(s.requeued);
            report.failed.extend(s.failed);
        }
        let s = self.scheduler.jobs_due_for_retry(now);
        report.requeued.extend(s.requeued);
        report.failed.extend(s.failed);

        for job_id in &report.failed {
            self.on_job_settled(job_id, now);
        }
        report.expired_tasks = self.expire_tasks(now);
        report.evicted_tasks = self.evict_tasks(now);
        report.forgotten_workers = self.workers.forget_dead(now, self.config.worker_retention);
        report.dispatched = self.dispatch(now);
        report
    }

    /// Olvida las tareas terminales cuyo `finished_at` quedó más atrás que la retención.
    fn evict_tasks(&self, now: DateTime<Utc>) -> Vec<TaskId> {
        let retention =
            chrono::Duration::from_std(self.config.task_retention).unwrap_or_else(|_| chrono::Duration::zero());
        let stale: Vec<TaskId> = read(&self.tasks)
            .iter()
            .filter(|(_, entry_ref)| {
                let entry = lock(entry_ref);
                entry.status.is_terminal() && entry.finished_at.is_some_and(|t| t + retention < now)
            })
            .map(|(id, _)| id.clone())
            .collect();
        if stale.is_empty() {
            return stale;
        }
        let mut tasks = write(&self.tasks);
        let mut evicted = Vec::with_capacity(stale.len());
        for task_id in stale {
            if tasks.remove(&task_id).is_some() {
                let jobs = self.scheduler.forget_task(&task_id);
                info!("tarea {} olvidada tras la retención ({} jobs)", task_id, jobs);
                evicted.push(task_id);
            }
        }
        evicted.sort();
        evicted
    }

    fn expire_tasks(&self, now: DateTime<Utc>) -> Vec<TaskId> {
        let entries: Vec<Arc<Mutex<TaskEntry>>> = read(&self.tasks).values().cloned().collect();
        let mut expired = Vec::new();
        for entry_ref in entries {
            let mut entry = lock(&entry_ref);
            let overdue = entry.deadline.is_some_and(|d| d < now);
            if overdue && !entry.status.is_terminal() {
                expired.push(entry.task.id.clone());
                self.fail_task(&mut entry, None, TASK_DEADLINE_EXCEEDED.to_string(), now);
            }
        }
        expired.sort();
        expired
    }

    /* ==== workers ==== */

    pub fn register_worker(&self, hostname: &str, max_concurrency: u32, now: DateTime<Utc>) -> WorkerId {
        self.workers.register(hostname, max_concurrency, now)
    }

    pub fn heartbeat(&self, req: &WorkerHeartbeatRequest, now: DateTime<Utc>) -> Result<(), CoordinatorError> {
        if self.workers.heartbeat(req, now) {
            Ok(())
        } else {
            Err(CoordinatorError::UnknownWorker(req.worker_id.clone()))
        }
    }

    pub fn worker_metrics(&self, now: DateTime<Utc>) -> Vec<WorkerMetrics> {
        let load = self.scheduler.in_flight_by_worker();
        self.workers.metrics(now, &load, self.reputation.as_ref())
    }

    /* ==== consultas ==== */

    pub fn task_report(&self, task_id: &str) -> Option<TaskReport> {
        let entry_ref = self.entry(task_id)?;
        let entry = lock(&entry_ref);
        let mut counters = self.scheduler.counters(Some(task_id));
        counters.penalties = entry.penalties;
        let status = match entry.status {
            TaskStatus::Accepted if counters.total() > counters.pending => TaskStatus::Running,
            other => other,
        };
        Some(TaskReport {
            task_id: entry.task.id.clone(),
            task_type: entry.task.task_type(),
            status,
            result: entry.result.clone(),
            failure: entry.failure.clone(),
            privacy: entry.privacy.clone(),
            verification: entry.task.privacy.verification,
            counters,
            submitted_at: entry.task.submitted_at,
            finished_at: entry.finished_at,
        })
    }

    pub fn events(&self, task_id: &str) -> Option<Vec<SchedulerEvent>> {
        self.entry(task_id)?;
        Some(self.scheduler.events(task_id))
    }

    pub fn stats(&self) -> ClusterStats {
        let entries: Vec<Arc<Mutex<TaskEntry>>> = read(&self.tasks).values().cloned().collect();
        let mut stats = ClusterStats {
            tasks_total: entries.len() as u64,
            ..ClusterStats::default()
        };
        for entry_ref in entries {
            match lock(&entry_ref).status {
                TaskStatus::Completed => stats.tasks_completed += 1,
                TaskStatus::Failed => stats.tasks_failed += 1,
                TaskStatus::Accepted | TaskStatus::Running => {}
            }
        }
        stats.jobs = self.scheduler.counters(None);
        stats.jobs.penalties = self.reputation.total_penalties();
        let (alive, dead) = self.workers.counts();
        stats.workers_alive = alive;
        stats.workers_dead = dead;
        stats
    }
}

fn group_mut<'a>(entry: &'a mut TaskEntry, unit_key: &str, primary: &str) -> Option<&'a mut VerificationGroup> {
    entry.units.get_mut(unit_key)?.groups.get_mut(primary)
}

/// Arma las unidades de la capa en curso del pipeline con las salidas de las capas previas.
fn prepare_layer(entry: &mut TaskEntry, now: DateTime<Utc>, to_register: &mut Vec<Job>) -> Result<(), CoordinatorError> {
    let Some(run) = entry.pipeline.as_ref() else {
        return Ok(());
    };
    let Some(layer) = run.plan.layers.get(run.current_layer) else {
        return Ok(());
    };
    let nodes = layer
        .iter()
        .map(|id| {
            run.plan
                .graph
                .node(id)
                .cloned()
                .ok_or_else(|| SplitError::InvalidPartition(format!("nodo {id} fuera del grafo")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let outputs = run.outputs.clone();

    let mut units = Vec::new();
    for node in nodes {
        let sub = node_task(&entry.task, &node, &outputs, now)?;
        let transformed = privacy::apply(sub)?;
        let jobs = split_jobs(&transformed.task)?;
        entry.privacy.push(transformed.applied.clone());
        units.push((
            node.id.clone(),
            build_unit(
                transformed.task,
                jobs,
                transformed.token,
                transformed.applied.effective,
                entry.policy,
                to_register,
            ),
        ));
    }
    entry.units.extend(units);
    Ok(())
}
