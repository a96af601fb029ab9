use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde_json::Value;

use common::{Job, JobId, VerificationLevel, WorkerId};

use crate::state::lock;

/* ==== política ==== */

/// Cuántas salidas iguales hacen falta y cuántos miembros puede tener una ronda.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationPolicy {
    pub level: VerificationLevel,
    pub quorum: usize,
    /// Réplicas que se lanzan junto con el primario.
    pub initial_replicas: u32,
    /// Miembros por ronda (primario incluido).
    pub max_members: usize,
}

impl VerificationPolicy {
    pub fn for_level(level: VerificationLevel, strict_budget: u32) -> Self {
        match level {
            VerificationLevel::Off => Self {
                level,
                quorum: 1,
                initial_replicas: 0,
                max_members: 1,
            },
            VerificationLevel::Basic => Self {
                level,
                quorum: 2,
                initial_replicas: 1,
                max_members: 2,
            },
            VerificationLevel::Strict => Self {
                level,
                quorum: 2,
                initial_replicas: 1,
                max_members: 1 + strict_budget.max(1) as usize,
            },
        }
    }

    pub fn replicated(&self) -> bool {
        self.initial_replicas > 0
    }
}

/* ==== comparación ==== */

/// Igualdad por tipo: números con tolerancia, colecciones por valor.
pub fn outputs_match(a: &Value, b: &Value, tolerance: f64) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => {
                let scale = x.abs().max(y.abs()).max(1.0);
                (x - y).abs() <= tolerance * scale
            }
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| outputs_match(x, y, tolerance))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| outputs_match(x, y, tolerance)))
        }
        _ => a == b,
    }
}

/* ==== veredicto ==== */

/// Estado de un miembro de la ronda, tal como lo ve el evaluador.
#[derive(Debug, Clone, PartialEq)]
pub enum MemberState<'a> {
    Pending,
    Completed { worker: &'a str, output: &'a Value },
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Todavía hay miembros sin resultado y nada está decidido.
    Pending,
    Accept { output: Value, dissenters: Vec<WorkerId> },
    /// Pedir tantas réplicas nuevas.
    NeedMore(usize),
    /// Presupuesto de réplicas agotado sin mayoría.
    Exhausted,
    /// Ningún miembro terminó con éxito.
    AllFailed,
}

/// Decide sobre una ronda. Acepta cuando el grupo mayoritario llega al quórum y ni los
/// pendientes podrían empatarlo; un empate al agotar el presupuesto es `Exhausted`.
pub fn evaluate(policy: &VerificationPolicy, members: &[MemberState<'_>], tolerance: f64) -> Verdict {
    // clases de equivalencia en orden de llegada: (representante, workers)
    let mut classes: Vec<(&Value, Vec<&str>)> = Vec::new();
    let mut pending = 0usize;
    for m in members {
        match m {
            MemberState::Pending => pending += 1,
            MemberState::Failed => {}
            MemberState::Completed { worker, output } => {
                match classes.iter_mut().find(|(rep, _)| outputs_match(rep, output, tolerance)) {
                    Some((_, workers)) => workers.push(*worker),
                    None => classes.push((*output, vec![*worker])),
                }
            }
        }
    }

    let mut ranked: Vec<usize> = (0..classes.len()).collect();
    // estable: ante igual tamaño gana la clase que apareció primero
    ranked.sort_by(|a, b| classes[*b].1.len().cmp(&classes[*a].1.len()));
    let leader = ranked.first().map_or(0, |i| classes[*i].1.len());
    let runner_up = ranked.get(1).map_or(0, |i| classes[*i].1.len());

    if leader >= policy.quorum && leader > runner_up + pending {
        let winner = ranked[0];
        let dissenters = classes
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != winner)
            .flat_map(|(_, (_, ws))| ws.iter().map(|w| w.to_string()))
            .collect();
        return Verdict::Accept {
            output: classes[winner].0.clone(),
            dissenters,
        };
    }
    if pending > 0 {
        return Verdict::Pending;
    }
    if members.len() < policy.max_members {
        // de a una réplica, salvo que falten varias para llegar al quórum
        let missing = policy.quorum.saturating_sub(leader).max(1);
        return Verdict::NeedMore(missing.min(policy.max_members - members.len()));
    }
    if classes.is_empty() {
        Verdict::AllFailed
    } else {
        Verdict::Exhausted
    }
}

/* ==== grupo de verificación ==== */

#[derive(Debug, Clone, PartialEq)]
pub enum GroupVerdict {
    Accepted(Value),
    Failed(String),
}

/// Un job primario y sus réplicas, a lo largo de todas las rondas.
#[derive(Debug, Clone)]
pub struct VerificationGroup {
    pub primary: Job,
    pub policy: VerificationPolicy,
    /// Ronda en curso, desde 1.
    pub round: u32,
    /// Miembros de la ronda en curso.
    pub members: Vec<JobId>,
    /// Miembros de todas las rondas.
    pub all_members: Vec<JobId>,
    /// Workers que no pueden entrar en la ronda en curso.
    pub excluded_workers: HashSet<WorkerId>,
    next_replica: u32,
    pub verdict: Option<GroupVerdict>,
}

impl VerificationGroup {
    /// Crea el grupo y devuelve los jobs a registrar (primario + réplicas iniciales).
    pub fn start(primary: Job, policy: VerificationPolicy) -> (Self, Vec<Job>) {
        let mut group = Self {
            members: vec![primary.id.clone()],
            all_members: vec![primary.id.clone()],
            primary: primary.clone(),
            policy,
            round: 1,
            excluded_workers: HashSet::new(),
            next_replica: 1,
            verdict: None,
        };
        let mut jobs = vec![primary];
        jobs.extend(group.spawn(policy.initial_replicas as usize));
        (group, jobs)
    }

    /// Réplicas nuevas para la ronda en curso.
    pub fn spawn(&mut self, n: usize) -> Vec<Job> {
        (0..n)
            .map(|_| {
                let job = self.primary.replica(self.next_replica);
                self.next_replica += 1;
                self.members.push(job.id.clone());
                self.all_members.push(job.id.clone());
                job
            })
            .collect()
    }

    /// Ronda nueva con workers frescos: excluye a todos los que participaron antes.
    pub fn next_round(&mut self, previous_workers: impl IntoIterator<Item = WorkerId>) -> Vec<Job> {
        self.round += 1;
        self.excluded_workers.extend(previous_workers);
        self.members.clear();
        self.spawn(1 + self.policy.initial_replicas as usize)
    }

    pub fn is_member(&self, job_id: &str) -> bool {
        self.members.iter().any(|m| m == job_id)
    }
}

/* ==== reputación ==== */

pub const PENALTY_STEP: f64 = 0.2;

/// Almacén externo de reputación de workers.
pub trait ReputationStore: Send + Sync {
    fn penalize(&self, worker_id: &str, reason: &str);

    fn penalties(&self, worker_id: &str) -> u32;

    fn total_penalties(&self) -> u64;

    /// 1.0 sin penalizaciones, baja `PENALTY_STEP` por cada una, nunca menos de 0.
    fn score(&self, worker_id: &str) -> f64 {
        (1.0 - PENALTY_STEP * f64::from(self.penalties(worker_id))).max(0.0)
    }
}

#[derive(Default)]
pub struct InMemoryReputation {
    penalties: Mutex<HashMap<WorkerId, Vec<String>>>,
}

impl InMemoryReputation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reasons(&self, worker_id: &str) -> Vec<String> {
        lock(&self.penalties).get(worker_id).cloned().unwrap_or_default()
    }
}

impl ReputationStore for InMemoryReputation {
    fn penalize(&self, worker_id: &str, reason: &str) {
        lock(&self.penalties)
            .entry(worker_id.to_string())
            .or_default()
            .push(reason.to_string());
    }

    fn penalties(&self, worker_id: &str) -> u32 {
        lock(&self.penalties)
            .get(worker_id)
            .map_or(0, |r| u32::try_from(r.len()).unwrap_or(u32::MAX))
    }

    fn total_penalties(&self) -> u64 {
        lock(&self.penalties).values().map(|r| r.len() as u64).sum()
    }
}
